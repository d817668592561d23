use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::error::ConfigError;

/// Process-wide settings, built once in `main` and handed to every constructor.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    pub event_stream: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub solr_url: String,
    pub activities_api_url: String,
    pub local_cache_ttl: Duration,
    pub local_cache_capacity: u64,
    pub shared_cache_ttl: Duration,
    pub call_timeout: Duration,
    pub message_timeout: Duration,
    pub max_delivery_attempts: u32,
    pub queue_connect_attempts: u32,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_source(|key| read_secret(key).or_else(|| var(key)))
    }

    pub fn from_source<F>(source: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            port: try_load(&source, "RUST_PORT", "8080")?,
            redis_url: try_load(&source, "REDIS_URL", "redis://127.0.0.1:6379")?,
            event_stream: try_load(&source, "EVENT_STREAM", "activities-events")?,
            consumer_group: try_load(&source, "CONSUMER_GROUP", "search")?,
            consumer_name: try_load(&source, "CONSUMER_NAME", "search-1")?,
            solr_url: try_load(&source, "SOLR_URL", "http://127.0.0.1:8983/solr/activities")?,
            activities_api_url: try_load(&source, "ACTIVITIES_API_URL", "http://127.0.0.1:8080")?,
            local_cache_ttl: Duration::from_secs(try_load(
                &source,
                "LOCAL_CACHE_TTL_SECONDS",
                "30",
            )?),
            local_cache_capacity: try_load(&source, "LOCAL_CACHE_CAPACITY", "1000")?,
            shared_cache_ttl: Duration::from_secs(try_load(
                &source,
                "SHARED_CACHE_TTL_SECONDS",
                "60",
            )?),
            call_timeout: Duration::from_millis(try_load(&source, "CALL_TIMEOUT_MS", "5000")?),
            message_timeout: Duration::from_secs(try_load(
                &source,
                "MESSAGE_TIMEOUT_SECONDS",
                "10",
            )?),
            max_delivery_attempts: try_load(&source, "MAX_DELIVERY_ATTEMPTS", "3")?,
            queue_connect_attempts: try_load(&source, "QUEUE_CONNECT_ATTEMPTS", "6")?,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key)
        .map_err(|_| {
            warn!("Environment variable {key} not found, using default");
        })
        .ok()
}

fn try_load<T, F>(source: &F, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    source(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .trim()
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })
}

fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path).map(|s| s.trim().to_string()).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_source(source(&[])).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.event_stream, "activities-events");
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.max_delivery_attempts, 3);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_source(source(&[
            ("RUST_PORT", "9000"),
            ("SHARED_CACHE_TTL_SECONDS", " 120 "),
            ("CONSUMER_NAME", "search-7"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.shared_cache_ttl, Duration::from_secs(120));
        assert_eq!(config.consumer_name, "search-7");
    }

    #[test]
    fn test_invalid_value() {
        let result = Config::from_source(source(&[("RUST_PORT", "eighty")]));

        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key, .. }) if key == "RUST_PORT"
        ));
    }
}
