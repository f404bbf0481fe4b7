use serde::{Deserialize, Serialize};

/// Tunables for one pipeline instance. Every field has a default, so a partial
/// `[pipeline]` table in the server's TOML file is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max days between two transactions for them to be possible duplicates.
    pub duplicate_window_days: i64,
    /// Minimum description similarity for a possible duplicate.
    pub duplicate_similarity: f32,
    pub recurring_min_occurrences: usize,
    pub recurring_lookback_months: u32,
    pub recurring_min_confidence: f32,
    pub auto_link_min_confidence: f32,
    /// Relative amount tolerance for auto-linking (0.05 = 5 %).
    pub auto_link_amount_tolerance: f64,
    /// Floor for the amount tolerance, in cents.
    pub auto_link_min_tolerance_cents: i64,
    pub max_reported_errors: usize,
    /// Age after which a `PROCESSING` import is considered abandoned.
    pub stale_import_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            duplicate_window_days: 3,
            duplicate_similarity: 0.85,
            recurring_min_occurrences: 3,
            recurring_lookback_months: 12,
            recurring_min_confidence: 0.5,
            auto_link_min_confidence: 0.7,
            auto_link_amount_tolerance: 0.05,
            auto_link_min_tolerance_cents: 50,
            max_reported_errors: 10,
            stale_import_secs: 600,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_import_secs)
    }
}
