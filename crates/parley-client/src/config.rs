//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the daemon starts with zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::FETCH_COOLDOWN_SECS;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the offline relay. `None` disables push and fetch.
    /// Env: `PARLEY_RELAY_URL`
    pub relay_url: Option<String>,

    /// Directory holding the database and the identity file.
    /// Env: `PARLEY_DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Minimum time between two unforced relay fetches.
    /// Env: `PARLEY_FETCH_COOLDOWN_SECS`
    /// Default: `60`
    pub fetch_cooldown: Duration,

    /// Period of the background fetch loop.
    /// Env: `PARLEY_FETCH_INTERVAL_SECS`
    /// Default: `30`
    pub fetch_interval: Duration,

    /// Timeout of every relay HTTP request.
    /// Env: `PARLEY_HTTP_TIMEOUT_SECS`
    /// Default: `20`
    pub http_timeout: Duration,

    /// Capacity of the outbound envelope queue.
    pub outbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            data_dir: None,
            fetch_cooldown: Duration::from_secs(FETCH_COOLDOWN_SECS),
            fetch_interval: Duration::from_secs(30),
            http_timeout: Duration::from_secs(20),
            outbound_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_RELAY_URL") {
            let url = url.trim();
            if !url.is_empty() {
                config.relay_url = Some(url.to_string());
            }
        }

        if let Some(dir) = lookup("PARLEY_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(secs) = parse_secs(&lookup, "PARLEY_FETCH_COOLDOWN_SECS") {
            config.fetch_cooldown = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "PARLEY_FETCH_INTERVAL_SECS") {
            config.fetch_interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "PARLEY_HTTP_TIMEOUT_SECS") {
            config.http_timeout = secs;
        }

        config
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let value = lookup(name)?;
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(variable = name, value = %value, "Invalid duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ClientConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = load(&[]);
        assert!(config.relay_url.is_none());
        assert_eq!(config.fetch_cooldown, Duration::from_secs(60));
        assert_eq!(config.fetch_interval, Duration::from_secs(30));
        assert_eq!(config.http_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PARLEY_RELAY_URL", "https://relay.example.org/"),
            ("PARLEY_DATA_DIR", "/tmp/parley"),
            ("PARLEY_FETCH_COOLDOWN_SECS", "5"),
        ]);
        assert_eq!(config.relay_url.as_deref(), Some("https://relay.example.org/"));
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/parley")));
        assert_eq!(config.fetch_cooldown, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = load(&[
            ("PARLEY_FETCH_INTERVAL_SECS", "soon"),
            ("PARLEY_HTTP_TIMEOUT_SECS", "0"),
            ("PARLEY_RELAY_URL", "  "),
        ]);
        assert_eq!(config.fetch_interval, Duration::from_secs(30));
        assert_eq!(config.http_timeout, Duration::from_secs(20));
        assert!(config.relay_url.is_none());
    }
}
