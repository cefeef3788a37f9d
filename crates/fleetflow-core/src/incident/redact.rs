//! Evidence redaction.
//!
//! Applied to every event message before detection so nothing sensitive
//! survives into timelines, incident evidence, or reports.
//!
//! - `off`: unchanged.
//! - `balanced` (default): credential assignments, high-entropy
//!   base64-like runs, emails, and Windows paths become fixed tokens;
//!   IPv4 addresses are masked to their /24.
//! - `strict`: additionally masks `HH:MM:SS` clock times and hashes user
//!   ids with a salted SHA-256 into `user-<12 hex>`.

use regex::{Regex, RegexBuilder};
use sha2::{Digest, Sha256};

use crate::config::RedactionMode;

pub struct Redactor {
    mode: RedactionMode,
    salt: String,
    secret_patterns: Vec<Regex>,
    base64_run: Regex,
    email: Regex,
    path_patterns: Vec<Regex>,
    ipv4: Regex,
    clock: Regex,
}

impl Redactor {
    pub fn new(mode: RedactionMode, salt: &str) -> Self {
        let case_insensitive = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("valid redaction pattern")
        };
        let plain = |pattern: &str| Regex::new(pattern).expect("valid redaction pattern");
        Self {
            mode,
            salt: salt.to_string(),
            secret_patterns: vec![
                case_insensitive(r"password=\S+"),
                case_insensitive(r"secret\s*[:=]\s*\S+"),
                case_insensitive(r"token=\S+"),
            ],
            base64_run: plain(r"[A-Za-z0-9+/=]{24,}"),
            email: plain(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
            path_patterns: vec![
                plain(r"[A-Za-z]:\\[^\s]+"),
                plain(r"[A-Za-z]:/[^\s]+"),
                plain(r"\\\\[A-Za-z0-9_.-]+\\[^\s]+"),
            ],
            ipv4: plain(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3})\.\d{1,3}\b"),
            clock: plain(r"\d{2}:\d{2}:\d{2}"),
        }
    }

    /// Scrub one event message according to the configured mode.
    pub fn redact_message(&self, message: &str) -> String {
        if message.is_empty() || self.mode == RedactionMode::Off {
            return message.to_string();
        }
        let mut redacted = message.to_string();
        for pattern in &self.secret_patterns {
            redacted = pattern.replace_all(&redacted, "[REDACTED]").into_owned();
        }
        redacted = self
            .base64_run
            .replace_all(&redacted, "[REDACTED]")
            .into_owned();
        redacted = self
            .email
            .replace_all(&redacted, "[REDACTED_EMAIL]")
            .into_owned();
        for pattern in &self.path_patterns {
            redacted = pattern
                .replace_all(&redacted, "[REDACTED_PATH]")
                .into_owned();
        }
        redacted = self.ipv4.replace_all(&redacted, "$1.0/24").into_owned();
        if self.mode == RedactionMode::Strict {
            redacted = self.clock.replace_all(&redacted, "HH:MM:SS").into_owned();
        }
        redacted
    }

    /// Strict mode hashes user ids with the salt; other modes pass them
    /// through untouched.
    pub fn hash_user(&self, user_id: Option<&str>) -> Option<String> {
        let user_id = user_id?;
        if user_id.is_empty() || self.mode != RedactionMode::Strict {
            return Some(user_id.to_string());
        }
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(user_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Some(format!("user-{}", &digest[..12]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balanced() -> Redactor {
        Redactor::new(RedactionMode::Balanced, "test-salt")
    }

    #[test]
    fn test_off_mode_is_identity() {
        let redactor = Redactor::new(RedactionMode::Off, "s");
        let message = "password=hunter2 from 10.1.2.3";
        assert_eq!(redactor.redact_message(message), message);
    }

    #[test]
    fn test_balanced_masks_credentials() {
        let out = balanced().redact_message("login PASSWORD=hunter2 secret: abc token=xyz");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("xyz"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn test_balanced_masks_email_and_paths() {
        let out = balanced().redact_message(r"mail bob@example.com wrote C:\Users\bob\file.txt");
        assert!(out.contains("[REDACTED_EMAIL]"));
        assert!(out.contains("[REDACTED_PATH]"));
        assert!(!out.contains("bob@example.com"));
    }

    #[test]
    fn test_balanced_masks_ipv4_last_octet() {
        let out = balanced().redact_message("reset from 192.168.10.77 done");
        assert_eq!(out, "reset from 192.168.10.0/24 done");
    }

    #[test]
    fn test_balanced_masks_base64_runs() {
        let out = balanced().redact_message("blob QWxhZGRpbjpvcGVuIHNlc2FtZQ1234 end");
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn test_strict_masks_clock_times_and_hashes_users() {
        let redactor = Redactor::new(RedactionMode::Strict, "pepper");
        assert_eq!(redactor.redact_message("at 12:34:56 ok"), "at HH:MM:SS ok");

        let hashed = redactor.hash_user(Some("alice")).unwrap();
        assert!(hashed.starts_with("user-"));
        assert_eq!(hashed.len(), "user-".len() + 12);
        // Deterministic for the same salt
        assert_eq!(redactor.hash_user(Some("alice")).unwrap(), hashed);
        // Different salt, different hash
        let other = Redactor::new(RedactionMode::Strict, "different");
        assert_ne!(other.hash_user(Some("alice")).unwrap(), hashed);
    }

    #[test]
    fn test_balanced_passes_user_through() {
        assert_eq!(balanced().hash_user(Some("alice")).as_deref(), Some("alice"));
        assert_eq!(balanced().hash_user(None), None);
    }
}
