use std::path::{Path, PathBuf};

use anyhow::Context;
use ledgerline_import::PipelineConfig;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "ledgerline.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    /// Bunyan-style JSON lines.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" | "bunyan" => Ok(LogFormat::Json),
            other => anyhow::bail!("Unknown log format: '{other}' (expected pretty or json)"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// SQLite file. Defaults to the platform data directory.
    pub database: Option<PathBuf>,
    pub log_format: LogFormat,
    pub max_upload_bytes: usize,
    /// Origins allowed to call the API from a browser. Empty disables CORS.
    pub cors_origins: Vec<String>,
    /// Use keyword and MCC heuristics for transactions no rule matches.
    pub heuristics: bool,
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            database: None,
            log_format: LogFormat::Pretty,
            max_upload_bytes: 10 * 1024 * 1024,
            cors_origins: Vec::new(),
            heuristics: true,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads the file named by `LEDGERLINE_CONFIG` (or `ledgerline.toml` if it
    /// exists), then applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var("LEDGERLINE_CONFIG").ok();
        let path = explicit
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else if explicit.is_some() {
            anyhow::bail!("Config file {} does not exist", path.display());
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let src = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&src).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(bind) = lookup("LEDGERLINE_BIND") {
            self.bind = bind;
        }
        if let Some(database) = lookup("LEDGERLINE_DATABASE") {
            self.database = Some(PathBuf::from(database));
        }
        if let Some(format) = lookup("LEDGERLINE_LOG_FORMAT") {
            self.log_format = format.parse()?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let dirs = directories::ProjectDirs::from("com", "ledgerline", "Ledgerline")
            .context("Failed to resolve the platform data directory")?;
        Ok(dirs.data_dir().join("ledgerline.db"))
    }
}
