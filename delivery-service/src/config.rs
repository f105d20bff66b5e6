use dotenvy::dotenv;
use std::env;
use uuid::Uuid;

/// Engine configuration. Every tunable has a documented default so a bare
/// environment boots a working single-node engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this server process in the fleet.
    pub process_id: String,
    pub redis_url: String,
    /// Budget for one fanout publish; a timeout is treated exactly like
    /// the bus being unavailable and triggers the queue fallback.
    pub publish_timeout_ms: u64,
    /// Window within which jobs sharing a batch key are coalesced.
    pub batch_window_ms: u64,
    /// Per-user cap on SENT-but-undelivered records before dequeues for
    /// that user are deferred.
    pub max_in_flight_per_user: usize,
    /// Retry budget for queued jobs.
    pub max_attempts: u32,
    /// Base for exponential retry backoff (base * 2^(attempts-1)).
    pub retry_backoff_ms: u64,
    /// Deferral applied when a job is held back by per-user backpressure.
    pub backpressure_delay_ms: u64,
    /// Presence transitions within this window collapse into one broadcast.
    pub presence_debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            process_id: Uuid::new_v4().to_string(),
            redis_url: "redis://127.0.0.1:6379".into(),
            publish_timeout_ms: 2_000,
            batch_window_ms: 2_000,
            max_in_flight_per_user: 32,
            max_attempts: 3,
            retry_backoff_ms: 1_000,
            backpressure_delay_ms: 500,
            presence_debounce_ms: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::DeliveryError> {
        dotenv().ok();
        let defaults = Config::default();

        Ok(Self {
            process_id: env::var("PROCESS_ID").unwrap_or(defaults.process_id),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            publish_timeout_ms: parse_env("PUBLISH_TIMEOUT_MS", defaults.publish_timeout_ms)?,
            batch_window_ms: parse_env("BATCH_WINDOW_MS", defaults.batch_window_ms)?,
            max_in_flight_per_user: parse_env(
                "MAX_IN_FLIGHT_PER_USER",
                defaults.max_in_flight_per_user,
            )?,
            max_attempts: parse_env("MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_backoff_ms: parse_env("RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            backpressure_delay_ms: parse_env(
                "BACKPRESSURE_DELAY_MS",
                defaults.backpressure_delay_ms,
            )?,
            presence_debounce_ms: parse_env("PRESENCE_DEBOUNCE_MS", defaults.presence_debounce_ms)?,
        })
    }
}

fn parse_env<T: std::str::FromStr>(
    key: &str,
    default: T,
) -> Result<T, crate::error::DeliveryError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| crate::error::DeliveryError::Config(format!("{key} invalid: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert!(cfg.max_attempts > 0);
        assert!(cfg.batch_window_ms > 0);
        assert!(cfg.max_in_flight_per_user > 0);
    }
}
