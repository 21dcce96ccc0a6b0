//! Runtime settings for the command engine and the event bus.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! [engine]
//! max_conflict_retries = 3
//! command_timeout_ms = 2000
//!
//! [bus]
//! shards = 4
//! max_attempts = 5
//! initial_backoff_ms = 10
//! max_backoff_ms = 1000
//! ```
use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Command handling.
    pub engine: EngineSettings,
    /// Event delivery to projection handlers.
    pub bus: BusSettings,
}

impl Settings {
    /// Parses and validates settings from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Self = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads, parses and validates a TOML settings file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Rejects settings the engine or bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()
    }
}

/// Settings for [`AggregateEngine`](crate::engine::AggregateEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// How many times a command is re-validated after losing an append race
    /// before the conflict is returned to the caller.
    pub max_conflict_retries: u32,
    /// Deadline for reading the stream and validating a command in one
    /// attempt. A started append always runs to completion, so a timed out
    /// command wrote nothing. `None` waits indefinitely.
    pub command_timeout_ms: Option<u64>,
}

impl EngineSettings {
    /// The per-attempt validation deadline, if any.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            command_timeout_ms: None,
        }
    }
}

/// Settings for [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Worker lanes per handler. Events of one stream always share a lane.
    pub shards: usize,
    /// Deliveries tried per handler and event before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between retries.
    pub max_backoff_ms: u64,
}

impl BusSettings {
    /// Delay before the first retry.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Upper bound on the delay between retries.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Rejects zero shards, zero attempts and inverted backoff bounds.
    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(Error::Config("bus.shards must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("bus.max_attempts must be at least 1".into()));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "bus.initial_backoff_ms must not exceed bus.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            shards: 4,
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let settings = Settings::from_toml_str("").expect("empty config is valid");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.engine.max_conflict_retries, 3);
        assert_eq!(settings.bus.shards, 4);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [engine]
            command_timeout_ms = 250

            [bus]
            max_attempts = 2
            "#,
        )
        .expect("valid config");

        assert_eq!(
            settings.engine.command_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(settings.engine.max_conflict_retries, 3);
        assert_eq!(settings.bus.max_attempts, 2);
        assert_eq!(settings.bus.shards, 4);
    }

    #[test]
    fn zero_shards_is_rejected() {
        let err = Settings::from_toml_str("[bus]\nshards = 0\n").expect_err("must fail");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn inverted_backoff_is_rejected() {
        let err = Settings::from_toml_str("[bus]\ninitial_backoff_ms = 50\nmax_backoff_ms = 5\n")
            .expect_err("must fail");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = Settings::from_toml_str("[engine\n").expect_err("must fail");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn settings_file_is_read_and_validated() {
        let path = std::env::temp_dir().join(format!("streakwise-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[engine]\nmax_conflict_retries = 7\n\n[bus]\nshards = 2\n")
            .unwrap();

        let settings = Settings::from_file(&path);
        std::fs::remove_file(&path).unwrap();

        let settings = settings.expect("valid config file");
        assert_eq!(settings.engine.max_conflict_retries, 7);
        assert_eq!(settings.bus.shards, 2);
        assert_eq!(settings.bus.max_attempts, 5);
    }

    #[test]
    fn missing_settings_file_is_a_config_error() {
        let path = std::env::temp_dir().join(format!("streakwise-{}.toml", uuid::Uuid::new_v4()));
        let err = Settings::from_file(&path).expect_err("must fail");
        assert!(matches!(err, Error::Config(msg) if msg.contains("cannot read")));
    }
}
