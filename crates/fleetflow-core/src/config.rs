//! Global configuration, captured once from the environment.
//!
//! The record is immutable and passed explicitly into constructors —
//! nothing reads environment variables after startup. The redaction salt
//! is secret-like and is masked in `Debug` output.

use std::fmt;

/// How aggressively event messages are scrubbed before detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionMode {
    Off,
    Balanced,
    Strict,
}

impl RedactionMode {
    /// Parse a mode name. Unknown values fall back to `Balanced`.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "off" => RedactionMode::Off,
            "strict" => RedactionMode::Strict,
            _ => RedactionMode::Balanced,
        }
    }
}

/// Immutable runtime configuration.
#[derive(Clone)]
pub struct Config {
    /// Root for artifacts: local path or `gs://bucket/prefix`.
    pub artifacts_root: String,
    /// Purge runs older than this many hours.
    pub retention_hours: i64,
    /// Message redaction mode.
    pub redaction_mode: RedactionMode,
    /// Salt for strict-mode user-id hashing. Never logged.
    pub redaction_salt: String,
    /// Worker lock TTL in minutes.
    pub lock_ttl_minutes: i64,
}

impl Config {
    /// Capture configuration from the environment.
    ///
    /// `ARTIFACTS_ROOT` (default `./artifacts`), `RETENTION_HOURS`
    /// (default 48), `REDACTION_MODE` (off|balanced|strict, default
    /// balanced), `REDACTION_SALT`, `LOCK_TTL_MINUTES` (default 30).
    pub fn from_env() -> Self {
        let artifacts_root =
            std::env::var("ARTIFACTS_ROOT").unwrap_or_else(|_| "./artifacts".to_string());
        let retention_hours = std::env::var("RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(48);
        let redaction_mode = RedactionMode::parse(
            &std::env::var("REDACTION_MODE").unwrap_or_else(|_| "balanced".to_string()),
        );
        let redaction_salt =
            std::env::var("REDACTION_SALT").unwrap_or_else(|_| "fleetflow-salt".to_string());
        let lock_ttl_minutes = std::env::var("LOCK_TTL_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        Config {
            artifacts_root,
            retention_hours,
            redaction_mode,
            redaction_salt,
            lock_ttl_minutes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            artifacts_root: "./artifacts".to_string(),
            retention_hours: 48,
            redaction_mode: RedactionMode::Balanced,
            redaction_salt: "fleetflow-salt".to_string(),
            lock_ttl_minutes: 30,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("artifacts_root", &self.artifacts_root)
            .field("retention_hours", &self.retention_hours)
            .field("redaction_mode", &self.redaction_mode)
            .field("redaction_salt", &"<masked>")
            .field("lock_ttl_minutes", &self.lock_ttl_minutes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redaction_mode_parse() {
        assert_eq!(RedactionMode::parse("off"), RedactionMode::Off);
        assert_eq!(RedactionMode::parse("STRICT"), RedactionMode::Strict);
        assert_eq!(RedactionMode::parse("balanced"), RedactionMode::Balanced);
        assert_eq!(RedactionMode::parse("bogus"), RedactionMode::Balanced);
    }

    #[test]
    fn test_debug_masks_salt() {
        let config = Config {
            redaction_salt: "super-secret".to_string(),
            ..Config::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<masked>"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retention_hours, 48);
        assert_eq!(config.lock_ttl_minutes, 30);
        assert_eq!(config.redaction_mode, RedactionMode::Balanced);
    }
}
