//! Typed configuration for the pipeline core.
//!
//! The core consumes configuration, it never produces it: the UI owns the
//! settings screens and hands these structs over (optionally persisted as a
//! single JSON file via [`AppConfig`]).

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    #[default]
    All,
    MediaOnly,
    TextOnly,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub chat_id: Option<i64>,
    pub output_directory: PathBuf,
    pub export_mode: ExportMode,
    /// Inclusive lower bound on remote message ids; 0 disables the bound.
    pub min_message_id: i64,
    /// Inclusive upper bound on remote message ids; 0 disables the bound.
    pub max_message_id: i64,
    pub page_size: usize,
    pub download_concurrency: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chat_id: None,
            output_directory: PathBuf::from("exported_messages"),
            export_mode: ExportMode::All,
            min_message_id: 0,
            max_message_id: 0,
            page_size: 100,
            download_concurrency: 4,
        }
    }
}

/// Which header components to render in front of each redelivered message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderOptions {
    pub show_sender_name: bool,
    pub show_sender_username: bool,
    pub show_date: bool,
    pub show_reply_link: bool,
    /// Render reply links as hidden HTML anchors rather than raw URLs.
    pub hidden_reply_links: bool,
    /// UTC offset in hours applied to header dates (e.g. 3 for Moscow).
    pub timezone_offset_hours: i32,
}

impl Default for HeaderOptions {
    fn default() -> Self {
        Self {
            show_sender_name: true,
            show_sender_username: true,
            show_date: true,
            show_reply_link: true,
            hidden_reply_links: true,
            timezone_offset_hours: 0,
        }
    }
}

/// Rules for merging consecutive short messages into one delivery unit.
/// All thresholds are inclusive: equality still merges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    pub enabled: bool,
    pub max_messages: usize,
    pub time_gap: Duration,
    /// Per-message text length ceiling, in characters.
    pub max_message_len: usize,
    /// Ceiling for the combined unit text, separators and header included.
    pub combined_budget: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_messages: 7,
            time_gap: Duration::from_secs(10 * 60),
            max_message_len: 150,
            combined_budget: 4000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResendConfig {
    pub target_chat_id: Option<i64>,
    pub source_directory: PathBuf,
    pub include_text: bool,
    pub include_media: bool,
    pub header: HeaderOptions,
    pub batch: BatchPolicy,
    /// Minimum spacing between destination sends.
    pub send_spacing: Duration,
    /// Deliver without a notification sound. A redelivery replays history,
    /// so the quiet default keeps the destination from pinging per message.
    pub silent: bool,
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            target_chat_id: None,
            source_directory: PathBuf::from("exported_messages"),
            include_text: true,
            include_media: true,
            header: HeaderOptions::default(),
            batch: BatchPolicy::default(),
            send_spacing: Duration::from_secs(2),
            silent: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts for transient (non rate-limit) failures.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    /// Consecutive FloodWait reports tolerated before the governor gives up.
    pub flood_retry_ceiling: u32,
    /// Upper bound on the jitter added to every reported cooldown.
    pub jitter_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            flood_retry_ceiling: 3,
            jitter_cap: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub export: ExportConfig,
    pub resend: ResendConfig,
    pub retry: RetryPolicy,
}

impl AppConfig {
    /// Load from a JSON file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        let cfg: AppConfig = serde_json::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.export.output_directory.as_os_str().is_empty() {
            return Err(Error::Config("output directory cannot be empty".into()));
        }
        if self.resend.source_directory.as_os_str().is_empty() {
            return Err(Error::Config("source directory cannot be empty".into()));
        }
        if self.export.page_size == 0 {
            return Err(Error::Config("page size must be > 0".into()));
        }
        if self.export.download_concurrency == 0 {
            return Err(Error::Config("download concurrency must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry attempts must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_config.json");

        let mut cfg = AppConfig::default();
        cfg.export.chat_id = Some(42);
        cfg.resend.batch.enabled = true;
        cfg.resend.header.timezone_offset_hours = 3;
        cfg.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.export.download_concurrency = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
