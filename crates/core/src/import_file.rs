use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::account::{AccountId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileFormat {
    Csv,
    Ofx,
    Qif,
}

impl FileFormat {
    /// Maps an uploaded filename's extension to a declared format.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        match ext.to_lowercase().as_str() {
            "csv" | "txt" => Some(FileFormat::Csv),
            "ofx" | "qfx" => Some(FileFormat::Ofx),
            "qif" => Some(FileFormat::Qif),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileFormat::Csv => "CSV",
            FileFormat::Ofx => "OFX",
            FileFormat::Qif => "QIF",
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CSV" => Ok(FileFormat::Csv),
            "OFX" => Ok(FileFormat::Ofx),
            "QIF" => Ok(FileFormat::Qif),
            other => Err(format!("Unsupported file format: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::Pending => "PENDING",
            ImportStatus::Processing => "PROCESSING",
            ImportStatus::Completed => "COMPLETED",
            ImportStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ImportStatus::Pending),
            "PROCESSING" => Ok(ImportStatus::Processing),
            "COMPLETED" => Ok(ImportStatus::Completed),
            "FAILED" => Ok(ImportStatus::Failed),
            other => Err(format!("Unknown import status: '{other}'")),
        }
    }
}

/// What to do with rows the duplicate detector flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuplicatePolicy {
    /// Drop duplicates and possible duplicates.
    #[default]
    Reject,
    /// Import everything, flagging duplicates for review.
    MarkDuplicate,
    /// Drop exact duplicates, import possible duplicates.
    Skip,
}

impl DuplicatePolicy {
    /// Only an explicit `MARK_DUPLICATE` may re-process content that was already imported.
    pub fn allows_reimport(self) -> bool {
        self == DuplicatePolicy::MarkDuplicate
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DuplicatePolicy::Reject => "REJECT",
            DuplicatePolicy::MarkDuplicate => "MARK_DUPLICATE",
            DuplicatePolicy::Skip => "SKIP",
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "REJECT" => Ok(DuplicatePolicy::Reject),
            "MARK_DUPLICATE" => Ok(DuplicatePolicy::MarkDuplicate),
            "SKIP" => Ok(DuplicatePolicy::Skip),
            other => Err(format!(
                "Unknown duplicate policy: '{other}' (expected REJECT, MARK_DUPLICATE or SKIP)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportCounts {
    pub total_rows: u64,
    pub imported: u64,
    pub duplicates: u64,
    pub errors: u64,
}

impl ImportCounts {
    pub fn new(total_rows: usize, imported: usize, duplicates: usize, errors: usize) -> Self {
        let widen = |n: usize| u64::try_from(n).unwrap_or(u64::MAX);
        ImportCounts {
            total_rows: widen(total_rows),
            imported: widen(imported),
            duplicates: widen(duplicates),
            errors: widen(errors),
        }
    }
}

/// One uploaded statement file and its processing lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFile {
    pub id: i64,
    pub user_id: UserId,
    pub filename: String,
    pub format: FileFormat,
    pub byte_size: u64,
    pub content_hash: String,
    pub status: ImportStatus,
    pub counts: ImportCounts,
    pub duplicate_policy: DuplicatePolicy,
    pub account_id: Option<AccountId>,
    pub error_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ImportFile {
    /// A completed import that actually brought in transactions.
    pub fn is_fully_imported(&self) -> bool {
        self.status == ImportStatus::Completed && self.counts.imported > 0
    }

    /// Whether a prior attempt for the same content may be deleted before retrying.
    /// `PROCESSING` records only qualify once they are older than `stale_after`.
    pub fn is_purgeable(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.status {
            ImportStatus::Failed | ImportStatus::Pending => true,
            ImportStatus::Processing => now - self.uploaded_at >= stale_after,
            ImportStatus::Completed => self.counts.imported == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewImportFile {
    pub user_id: UserId,
    pub filename: String,
    pub format: FileFormat,
    pub byte_size: u64,
    pub content_hash: String,
    pub duplicate_policy: DuplicatePolicy,
    pub account_id: Option<AccountId>,
}

/// Field values exactly as they appeared in the source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFields {
    pub date: Option<String>,
    pub description: Option<String>,
    pub amount: Option<String>,
    pub direction: Option<String>,
    pub balance: Option<String>,
    pub reference: Option<String>,
}

/// Audit record of one parsed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransactionRow {
    pub import_file_id: i64,
    pub row_number: usize,
    pub fields: RawFields,
    pub row_hash: String,
    pub fingerprint: String,
    pub processed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn import(status: ImportStatus, imported: u64, age_secs: i64) -> ImportFile {
        ImportFile {
            id: 1,
            user_id: UserId(1),
            filename: "statement.csv".to_string(),
            format: FileFormat::Csv,
            byte_size: 10,
            content_hash: "abc".to_string(),
            status,
            counts: ImportCounts { imported, ..Default::default() },
            duplicate_policy: DuplicatePolicy::Reject,
            account_id: None,
            error_message: None,
            uploaded_at: Utc::now() - Duration::seconds(age_secs),
            processed_at: None,
        }
    }

    #[test]
    fn format_from_filename_extension() {
        assert_eq!(FileFormat::from_filename("March.CSV"), Some(FileFormat::Csv));
        assert_eq!(FileFormat::from_filename("export.qfx"), Some(FileFormat::Ofx));
        assert_eq!(FileFormat::from_filename("old.qif"), Some(FileFormat::Qif));
        assert_eq!(FileFormat::from_filename("statement.pdf"), None);
        assert_eq!(FileFormat::from_filename("noextension"), None);
    }

    #[test]
    fn duplicate_policy_is_a_closed_set() {
        assert_eq!("mark_duplicate".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::MarkDuplicate);
        assert_eq!("SKIP".parse::<DuplicatePolicy>().unwrap(), DuplicatePolicy::Skip);
        assert!("IGNORE".parse::<DuplicatePolicy>().is_err());
        assert_eq!(DuplicatePolicy::default(), DuplicatePolicy::Reject);
    }

    #[test]
    fn policy_serde_uses_screaming_case() {
        let json = serde_json::to_string(&DuplicatePolicy::MarkDuplicate).unwrap();
        assert_eq!(json, "\"MARK_DUPLICATE\"");
    }

    #[test]
    fn counts_keep_large_values() {
        let big = 5_000_000_000usize;
        let counts = ImportCounts::new(big, big - 1, 1, 0);
        assert_eq!(counts.total_rows, 5_000_000_000);
        assert_eq!(counts.imported, 4_999_999_999);
    }

    #[test]
    fn fully_imported_requires_completed_with_rows() {
        assert!(import(ImportStatus::Completed, 3, 0).is_fully_imported());
        assert!(!import(ImportStatus::Completed, 0, 0).is_fully_imported());
        assert!(!import(ImportStatus::Failed, 3, 0).is_fully_imported());
    }

    #[test]
    fn purgeable_records() {
        let stale = Duration::seconds(600);
        let now = Utc::now();
        assert!(import(ImportStatus::Failed, 0, 0).is_purgeable(now, stale));
        assert!(import(ImportStatus::Completed, 0, 0).is_purgeable(now, stale));
        assert!(!import(ImportStatus::Completed, 5, 0).is_purgeable(now, stale));
        assert!(!import(ImportStatus::Processing, 0, 10).is_purgeable(now, stale));
        assert!(import(ImportStatus::Processing, 0, 3600).is_purgeable(now, stale));
    }

    #[test]
    fn terminal_states() {
        assert!(ImportStatus::Completed.is_terminal());
        assert!(ImportStatus::Failed.is_terminal());
        assert!(!ImportStatus::Processing.is_terminal());
    }
}
