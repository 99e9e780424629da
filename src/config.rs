use crate::error::ConfigError;
use std::{env, fmt::Display, str::FromStr, time::Duration};
use tracing::info;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub cors_origin: Option<String>,
    pub store_timeout: Duration,
    pub vote_retry: RetryPolicy,
    pub subscriber_buffer: usize,
    pub subscriber_idle_timeout: Option<Duration>,
    pub sse_keep_alive: Duration,
    pub shutdown_grace: Duration,
    pub one_vote_per_voter: bool,
}

/// Bounded exponential backoff for transient counter store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let idle_secs: u64 = try_load(&lookup, "SUBSCRIBER_IDLE_TIMEOUT_SECS", "0")?;
        let subscriber_buffer: usize = try_load(&lookup, "SUBSCRIBER_BUFFER", "16")?;
        if subscriber_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "SUBSCRIBER_BUFFER",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            port: try_load(&lookup, "PORT", "3333")?,
            redis_url: optional(&lookup, "REDIS_URL"),
            redis_key_prefix: try_load(&lookup, "REDIS_KEY_PREFIX", "poll")?,
            cors_origin: optional(&lookup, "CORS_ORIGIN"),
            store_timeout: Duration::from_millis(try_load(&lookup, "STORE_TIMEOUT_MS", "500")?),
            vote_retry: RetryPolicy {
                attempts: try_load(&lookup, "VOTE_RETRY_ATTEMPTS", "3")?,
                backoff: Duration::from_millis(try_load(&lookup, "VOTE_RETRY_BACKOFF_MS", "50")?),
            },
            subscriber_buffer,
            subscriber_idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            sse_keep_alive: Duration::from_secs(try_load(&lookup, "SSE_KEEP_ALIVE_SECS", "30")?),
            shutdown_grace: Duration::from_secs(try_load(&lookup, "SHUTDOWN_GRACE_SECS", "5")?),
            one_vote_per_voter: try_load(&lookup, "ONE_VOTE_PER_VOTER", "true")?,
        })
    }
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let value = optional(lookup, key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.port, 3333);
        assert_eq!(config.redis_url, None);
        assert_eq!(config.redis_key_prefix, "poll");
        assert_eq!(config.store_timeout, Duration::from_millis(500));
        assert_eq!(config.vote_retry.attempts, 3);
        assert_eq!(config.subscriber_idle_timeout, None);
        assert_eq!(config.sse_keep_alive, Duration::from_secs(30));
        assert!(config.one_vote_per_voter);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("REDIS_URL", "redis://127.0.0.1:6379"),
            ("SUBSCRIBER_IDLE_TIMEOUT_SECS", "90"),
            ("ONE_VOTE_PER_VOTER", "false"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(
            config.subscriber_idle_timeout,
            Some(Duration::from_secs(90))
        );
        assert!(!config.one_vote_per_voter);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = config_from(&[("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        assert!(config_from(&[("SUBSCRIBER_BUFFER", "0")]).is_err());
    }

    #[test]
    fn retry_delay_doubles() {
        let policy = RetryPolicy {
            attempts: 4,
            backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(50));
        assert_eq!(policy.delay(2), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
    }
}
