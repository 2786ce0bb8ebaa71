//! Relay configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Color;

/// Tunables for one consumer. Every field has a default, so a partial JSON
/// document (or `{}`) is a valid configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// POSIX shared-memory name of the snapshot channel.
    pub channel_name: String,
    /// Consistent-read attempts per poll before reporting contention.
    pub read_retries: u32,
    /// Upper bound on any fence wait, in milliseconds.
    pub fence_timeout_ms: u64,
    /// Clear applied to the whole destination before the frame is drawn.
    /// `None` leaves pixels outside the destination rectangle untouched.
    pub clear_color: Option<Color>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_name: "/frame-relay".to_owned(),
            read_retries: crate::channel::DEFAULT_READ_ATTEMPTS,
            fence_timeout_ms: 100,
            clear_color: None,
        }
    }
}

impl RelayConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown fields and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// As [`from_json_str`](Self::from_json_str), plus [`ConfigError::Io`]
    /// if the file cannot be read.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.channel_name.starts_with('/') || self.channel_name[1..].contains('/') {
            return Err(ConfigError::invalid(format!(
                "channel_name {:?} must be a single leading-slash component",
                self.channel_name
            )));
        }
        if self.read_retries == 0 {
            return Err(ConfigError::invalid("read_retries must be at least 1"));
        }
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::invalid("fence_timeout_ms must be at least 1"));
        }
        if let Some(color) = self.clear_color {
            let components = color.to_array();
            if components.iter().any(|c| !(0.0..=1.0).contains(c)) {
                return Err(ConfigError::invalid(format!(
                    "clear_color {components:?} has components outside [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// [`fence_timeout_ms`](Self::fence_timeout_ms) as a `Duration`.
    #[must_use]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// Map the configured channel read-only.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the producer has not created the channel yet.
    #[cfg(all(unix, not(all(feature = "loom", test))))]
    pub fn open_channel(&self) -> std::io::Result<crate::channel::ShmRegion> {
        crate::channel::ShmRegion::open_read_only(&self.channel_name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(RelayConfig::from_json_str("{}").unwrap(), RelayConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = RelayConfig::from_json_str(
            r#"{ "read_retries": 3, "clear_color": { "r": 0.0, "g": 0.0, "b": 0.0, "a": 1.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.read_retries, 3);
        assert_eq!(config.clear_color, Some(Color::BLACK));
        assert_eq!(config.fence_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for json in [
            r#"{ "read_retries": 0 }"#,
            r#"{ "fence_timeout_ms": 0 }"#,
            r#"{ "channel_name": "relay" }"#,
            r#"{ "clear_color": { "r": 2.0, "g": 0.0, "b": 0.0, "a": 1.0 } }"#,
        ] {
            assert!(
                matches!(RelayConfig::from_json_str(json), Err(ConfigError::Invalid(_))),
                "{json} should be invalid"
            );
        }
    }

    #[test]
    fn malformed_documents_are_parse_errors() {
        assert!(matches!(
            RelayConfig::from_json_str(r#"{ "read_retries": "many" }"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RelayConfig::from_json_str(r#"{ "retries": 4 }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            RelayConfig::from_json_file("/nonexistent/frame-relay.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
