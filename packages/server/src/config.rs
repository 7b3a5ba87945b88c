//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Retry backoff law: exponential with clamp.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_ms: u64,
    pub multiplier: u32,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 2,
            max_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt, given how many attempts have run.
    ///
    /// `delay = min(initial * multiplier^(attempts - 1), max)`.
    pub fn delay_for_attempt(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).max(0) as u32;
        let factor = (self.multiplier as u64)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let delay_ms = self
            .initial_ms
            .checked_mul(factor)
            .unwrap_or(u64::MAX)
            .min(self.max_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Terminal-row aging.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub completed_job_age_ms: u64,
    pub failed_job_age_ms: u64,
    pub interval_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            completed_job_age_ms: 7 * 24 * 60 * 60 * 1_000,
            failed_job_age_ms: 30 * 24 * 60 * 60 * 1_000,
            interval_ms: 60 * 60 * 1_000,
        }
    }
}

/// Stalled-job detection.
#[derive(Debug, Clone)]
pub struct StallConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            timeout_ms: 600_000,
        }
    }
}

/// Leaky-bucket admission to the upstream mail provider.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    pub min_spacing_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
            min_spacing_ms: 1_000,
        }
    }
}

/// Health scoring and alerting thresholds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub error_rate_pct: f64,
    pub queue_size_threshold: i64,
    pub slow_job_ms: u64,
    pub auto_retry_enabled: bool,
    pub auto_retry_types: Vec<String>,
    pub auto_retry_per_job_threshold: u32,
    pub max_alerts_history: usize,
    pub health_check_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            error_rate_pct: 10.0,
            queue_size_threshold: 100,
            slow_job_ms: 300_000,
            auto_retry_enabled: true,
            auto_retry_types: vec!["email_archival".to_string(), "export".to_string()],
            auto_retry_per_job_threshold: 3,
            max_alerts_history: 1_000,
            health_check_interval_ms: 60_000,
        }
    }
}

/// Worker pool sizing and supervision.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub health_check_interval_ms: u64,
    pub max_restart_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub idle_poll_ms: u64,
    pub busy_backoff_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            health_check_interval_ms: 30_000,
            max_restart_attempts: 3,
            heartbeat_interval_ms: 30_000,
            idle_poll_ms: 5_000,
            busy_backoff_ms: 1_000,
            drain_timeout_ms: 30_000,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub mail_api_base_url: String,
    pub storage_root: String,
    pub default_timeout_ms: i64,
    pub default_max_retries: i32,
    pub queue_depth_ceiling: i64,
    pub export_ttl_ms: u64,
    pub retry: RetryConfig,
    pub cleanup: CleanupConfig,
    pub stall: StallConfig,
    pub rate_limit: RateLimitConfig,
    pub monitor: MonitorConfig,
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            mail_api_base_url: "https://graph.microsoft.com/v1.0".to_string(),
            storage_root: "./data/archive".to_string(),
            default_timeout_ms: 300_000,
            default_max_retries: 3,
            queue_depth_ceiling: 10_000,
            export_ttl_ms: 24 * 60 * 60 * 1_000,
            retry: RetryConfig::default(),
            cleanup: CleanupConfig::default(),
            stall: StallConfig::default(),
            rate_limit: RateLimitConfig::default(),
            monitor: MonitorConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Config::default();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            mail_api_base_url: env::var("MAIL_API_BASE_URL")
                .unwrap_or(defaults.mail_api_base_url),
            storage_root: env::var("STORAGE_ROOT").unwrap_or(defaults.storage_root),
            default_timeout_ms: parse_env("DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms)?,
            default_max_retries: parse_env("DEFAULT_MAX_RETRIES", defaults.default_max_retries)?,
            queue_depth_ceiling: parse_env("QUEUE_DEPTH_CEILING", defaults.queue_depth_ceiling)?,
            export_ttl_ms: parse_env("EXPORT_TTL_MS", defaults.export_ttl_ms)?,
            retry: RetryConfig {
                initial_ms: parse_env("RETRY_INITIAL_MS", defaults.retry.initial_ms)?,
                multiplier: parse_env("RETRY_MULTIPLIER", defaults.retry.multiplier)?,
                max_ms: parse_env("RETRY_MAX_MS", defaults.retry.max_ms)?,
            },
            cleanup: CleanupConfig {
                completed_job_age_ms: parse_env(
                    "CLEANUP_COMPLETED_JOB_AGE_MS",
                    defaults.cleanup.completed_job_age_ms,
                )?,
                failed_job_age_ms: parse_env(
                    "CLEANUP_FAILED_JOB_AGE_MS",
                    defaults.cleanup.failed_job_age_ms,
                )?,
                interval_ms: parse_env("CLEANUP_INTERVAL_MS", defaults.cleanup.interval_ms)?,
            },
            stall: StallConfig {
                interval_ms: parse_env("HEALTH_STALLED_INTERVAL_MS", defaults.stall.interval_ms)?,
                timeout_ms: parse_env("HEALTH_STALLED_TIMEOUT_MS", defaults.stall.timeout_ms)?,
            },
            rate_limit: RateLimitConfig {
                max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit.max_requests)?,
                window_ms: parse_env("RATE_LIMIT_WINDOW_MS", defaults.rate_limit.window_ms)?,
                min_spacing_ms: parse_env(
                    "RATE_LIMIT_MIN_SPACING_MS",
                    defaults.rate_limit.min_spacing_ms,
                )?,
            },
            monitor: MonitorConfig {
                error_rate_pct: parse_env("MONITOR_ERROR_RATE_PCT", defaults.monitor.error_rate_pct)?,
                queue_size_threshold: parse_env(
                    "MONITOR_QUEUE_SIZE_THRESHOLD",
                    defaults.monitor.queue_size_threshold,
                )?,
                slow_job_ms: parse_env("MONITOR_SLOW_JOB_MS", defaults.monitor.slow_job_ms)?,
                auto_retry_enabled: parse_env(
                    "MONITOR_AUTO_RETRY_ENABLED",
                    defaults.monitor.auto_retry_enabled,
                )?,
                auto_retry_types: env::var("MONITOR_AUTO_RETRY_TYPES")
                    .map(|raw| {
                        raw.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or(defaults.monitor.auto_retry_types),
                auto_retry_per_job_threshold: parse_env(
                    "MONITOR_AUTO_RETRY_PER_JOB_THRESHOLD",
                    defaults.monitor.auto_retry_per_job_threshold,
                )?,
                max_alerts_history: parse_env(
                    "MONITOR_MAX_ALERTS_HISTORY",
                    defaults.monitor.max_alerts_history,
                )?,
                health_check_interval_ms: parse_env(
                    "MONITOR_HEALTH_CHECK_INTERVAL_MS",
                    defaults.monitor.health_check_interval_ms,
                )?,
            },
            pool: PoolConfig {
                max_concurrency: parse_env("MAX_CONCURRENCY", defaults.pool.max_concurrency)?,
                health_check_interval_ms: parse_env(
                    "POOL_HEALTH_CHECK_INTERVAL_MS",
                    defaults.pool.health_check_interval_ms,
                )?,
                max_restart_attempts: parse_env(
                    "POOL_MAX_RESTART_ATTEMPTS",
                    defaults.pool.max_restart_attempts,
                )?,
                heartbeat_interval_ms: parse_env(
                    "POOL_HEARTBEAT_INTERVAL_MS",
                    defaults.pool.heartbeat_interval_ms,
                )?,
                idle_poll_ms: parse_env("POOL_IDLE_POLL_MS", defaults.pool.idle_poll_ms)?,
                busy_backoff_ms: parse_env("POOL_BUSY_BACKOFF_MS", defaults.pool.busy_backoff_ms)?,
                drain_timeout_ms: parse_env("POOL_DRAIN_TIMEOUT_MS", defaults.pool.drain_timeout_ms)?,
            },
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_up_to_clamp() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_monotonic_non_decreasing() {
        let retry = RetryConfig::default();
        let mut last = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = retry.delay_for_attempt(attempt);
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(i32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.default_timeout_ms, 300_000);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.queue_depth_ceiling, 10_000);
        assert_eq!(config.pool.max_concurrency, 10);
        assert_eq!(config.rate_limit.max_requests, 60);
        assert_eq!(config.rate_limit.min_spacing_ms, 1_000);
        assert_eq!(config.stall.timeout_ms, 600_000);
        assert_eq!(config.monitor.max_alerts_history, 1_000);
        assert_eq!(config.cleanup.completed_job_age_ms, 7 * 24 * 60 * 60 * 1_000);
        assert_eq!(config.cleanup.failed_job_age_ms, 30 * 24 * 60 * 60 * 1_000);
    }
}
