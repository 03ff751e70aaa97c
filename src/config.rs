//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Fallback text sent when a reply matches no continuation of the current node.
pub const DEFAULT_RECOVERY_MESSAGE: &str =
    "Sorry, I didn't catch that option. Send us a new message to start again.";

/// Automation core configuration.
#[derive(Debug, Clone)]
pub struct AutomationConfig {
    /// Path of the libSQL database file.
    pub db_path: String,
    /// Port for the HTTP surface.
    pub port: u16,
    /// Delivery client endpoint. `None` means intents are only logged.
    pub delivery_url: Option<String>,
    /// Bearer token for the delivery endpoint.
    pub delivery_token: Option<SecretString>,
    /// Upper bound on nodes executed in one pass (guards zero-delay cycles).
    pub max_nodes_per_pass: usize,
    /// How often the delay ticker polls for due states.
    pub delay_poll_interval: Duration,
    /// Default recovery message (accounts may override).
    pub recovery_message: String,
    /// Default similarity threshold for FAQ triggers.
    pub faq_threshold: f32,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/autoflow.db".to_string(),
            port: 8080,
            delivery_url: None,
            delivery_token: None,
            max_nodes_per_pass: 10,
            delay_poll_interval: Duration::from_secs(15),
            recovery_message: DEFAULT_RECOVERY_MESSAGE.to_string(),
            faq_threshold: 0.7,
        }
    }
}

impl AutomationConfig {
    /// Load configuration from `AUTOFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_nodes_per_pass = parse_env("AUTOFLOW_MAX_NODES_PER_PASS", defaults.max_nodes_per_pass)?;
        if max_nodes_per_pass == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AUTOFLOW_MAX_NODES_PER_PASS".into(),
                message: "must be at least 1".into(),
            });
        }

        let faq_threshold: f32 = parse_env("AUTOFLOW_FAQ_THRESHOLD", defaults.faq_threshold)?;
        if !(0.0..=1.0).contains(&faq_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "AUTOFLOW_FAQ_THRESHOLD".into(),
                message: format!("{faq_threshold} is outside 0.0..=1.0"),
            });
        }

        Ok(Self {
            db_path: std::env::var("AUTOFLOW_DB_PATH").unwrap_or(defaults.db_path),
            port: parse_env("AUTOFLOW_PORT", defaults.port)?,
            delivery_url: std::env::var("AUTOFLOW_DELIVERY_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            delivery_token: std::env::var("AUTOFLOW_DELIVERY_TOKEN")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            max_nodes_per_pass,
            delay_poll_interval: Duration::from_secs(parse_env(
                "AUTOFLOW_DELAY_POLL_SECS",
                defaults.delay_poll_interval.as_secs(),
            )?),
            recovery_message: std::env::var("AUTOFLOW_RECOVERY_MESSAGE")
                .unwrap_or(defaults.recovery_message),
            faq_threshold,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AutomationConfig::default();
        assert_eq!(config.max_nodes_per_pass, 10);
        assert_eq!(config.port, 8080);
        assert!(config.delivery_url.is_none());
        assert!((config.faq_threshold - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn parse_env_falls_back_to_default() {
        let value: u16 = parse_env("AUTOFLOW_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
