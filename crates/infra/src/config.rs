//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use clipforge_generation::{CreditPricing, JobKind};
use clipforge_ledger::AmountBand;

use crate::jobs::{JobOptions, RetryPolicy, WorkerConfig};
use crate::monitor::MonitorConfig;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Per-queue delivery and worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub attempts: u32,
    pub backoff: Duration,
    pub concurrency: usize,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl QueueSettings {
    fn defaults(queue: JobKind) -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_millis(5_000),
            concurrency: match queue {
                JobKind::Story => 2,
                JobKind::Effect | JobKind::GenerationLib => 4,
            },
            keep_completed: 100,
            keep_failed: 200,
        }
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            retry: RetryPolicy::exponential(self.attempts.max(1), self.backoff, MAX_BACKOFF),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }
}

fn env_prefix(queue: JobKind) -> &'static str {
    match queue {
        JobKind::Story => "STORY",
        JobKind::Effect => "EFFECT",
        JobKind::GenerationLib => "GENERATION_LIB",
    }
}

/// Provider and storage endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub storage_upload_url: Option<String>,
    pub storage_public_url: Option<String>,
    pub storage_token: Option<String>,
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub story: QueueSettings,
    pub effect: QueueSettings,
    pub generation_lib: QueueSettings,
    pub stall_interval: Duration,
    pub monitor: MonitorConfig,
    pub progress_tick: Duration,
    pub notification_ttl: chrono::Duration,
    pub credit_band: AmountBand,
    pub pricing: CreditPricing,
    pub provider: ProviderSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the process env in production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let queue = |kind: JobKind| -> Result<QueueSettings, ConfigError> {
            let prefix = env_prefix(kind);
            let defaults = QueueSettings::defaults(kind);
            Ok(QueueSettings {
                attempts: env.parse(&format!("{prefix}_ATTEMPTS"), defaults.attempts)?,
                backoff: Duration::from_millis(env.parse(
                    &format!("{prefix}_BACKOFF_MS"),
                    defaults.backoff.as_millis() as u64,
                )?),
                concurrency: env
                    .positive(&format!("{prefix}_CONCURRENCY"), defaults.concurrency)?,
                keep_completed: env
                    .parse(&format!("{prefix}_KEEP_COMPLETED"), defaults.keep_completed)?,
                keep_failed: env.parse(&format!("{prefix}_KEEP_FAILED"), defaults.keep_failed)?,
            })
        };

        let defaults = CreditPricing::default();
        let pricing = CreditPricing {
            story_per_scene: env.positive("PRICE_STORY_PER_SCENE", defaults.story_per_scene)?,
            voice_over: env.positive("PRICE_VOICE_OVER", defaults.voice_over)?,
            effect: env.positive("PRICE_EFFECT", defaults.effect)?,
            generation_lib: env.positive("PRICE_GENERATION_LIB", defaults.generation_lib)?,
        };

        let band_defaults = AmountBand::default();
        let credit_band = AmountBand::new(
            env.parse("CREDITS_MIN_AMOUNT", band_defaults.min)?,
            env.parse("CREDITS_MAX_AMOUNT", band_defaults.max)?,
        );
        if credit_band.min > credit_band.max {
            return Err(ConfigError::Invalid {
                key: "CREDITS_MIN_AMOUNT".to_string(),
                value: credit_band.min.to_string(),
            });
        }

        let monitor_defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            interval: Duration::from_secs(env.positive(
                "MONITOR_INTERVAL_SECS",
                monitor_defaults.interval.as_secs(),
            )?),
            warning_depth: env.parse("MONITOR_WARNING_DEPTH", monitor_defaults.warning_depth)?,
            critical_depth: env.parse("MONITOR_CRITICAL_DEPTH", monitor_defaults.critical_depth)?,
        };

        Ok(Self {
            database_url: env.optional("DATABASE_URL"),
            redis_url: env.optional("REDIS_URL"),
            bind_addr: env.parse(
                "BIND_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            story: queue(JobKind::Story)?,
            effect: queue(JobKind::Effect)?,
            generation_lib: queue(JobKind::GenerationLib)?,
            stall_interval: Duration::from_secs(env.positive("STALL_INTERVAL_SECS", 120u64)?),
            monitor,
            progress_tick: Duration::from_millis(env.positive("PROGRESS_TICK_MS", 3_000u64)?),
            notification_ttl: chrono::Duration::days(env.parse(
                "NOTIFICATION_TTL_DAYS",
                clipforge_events::notification::DEFAULT_TTL_DAYS,
            )?),
            credit_band,
            pricing,
            provider: ProviderSettings {
                base_url: env
                    .optional("PROVIDER_BASE_URL")
                    .unwrap_or_else(|| "https://queue.fal.run".to_string()),
                api_key: env.optional("PROVIDER_API_KEY"),
                storage_upload_url: env.optional("STORAGE_UPLOAD_URL"),
                storage_public_url: env.optional("STORAGE_PUBLIC_URL"),
                storage_token: env.optional("STORAGE_TOKEN"),
                ffmpeg_path: env
                    .optional("FFMPEG_PATH")
                    .unwrap_or_else(|| "ffmpeg".to_string()),
            },
        })
    }

    pub fn queue(&self, queue: JobKind) -> &QueueSettings {
        match queue {
            JobKind::Story => &self.story,
            JobKind::Effect => &self.effect,
            JobKind::GenerationLib => &self.generation_lib,
        }
    }

    pub fn worker_config(&self, queue: JobKind) -> WorkerConfig {
        WorkerConfig::new(queue)
            .with_concurrency(self.queue(queue).concurrency)
            .with_stall_interval(self.stall_interval)
            .with_heartbeat_interval(self.stall_interval / 8)
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values both count as absent.
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    /// Intervals, prices and pool sizes: zero and below are rejected.
    fn positive<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + ToString,
    {
        let value = self.parse(key, default)?;
        if value > T::default() {
            Ok(value)
        } else {
            Err(ConfigError::Invalid {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).unwrap();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.story.concurrency, 2);
        assert_eq!(cfg.effect.concurrency, 4);
        assert_eq!(cfg.story.attempts, 1);
        assert_eq!(cfg.stall_interval, Duration::from_secs(120));
        assert_eq!(cfg.pricing, CreditPricing::default());
        assert_eq!(cfg.credit_band, AmountBand::default());
        assert_eq!(cfg.notification_ttl, chrono::Duration::days(7));
    }

    #[test]
    fn queue_overrides_are_per_kind() {
        let cfg = config(&[
            ("GENERATION_LIB_ATTEMPTS", "3"),
            ("GENERATION_LIB_BACKOFF_MS", "250"),
            ("STORY_KEEP_FAILED", "5"),
        ])
        .unwrap();

        let options = cfg.queue(JobKind::GenerationLib).job_options();
        assert_eq!(options.retry.max_attempts, 3);
        assert_eq!(options.retry.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.story.keep_failed, 5);
        assert_eq!(cfg.effect.attempts, 1);
    }

    #[test]
    fn invalid_values_name_the_key() {
        let err = config(&[("EFFECT_CONCURRENCY", "many")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "EFFECT_CONCURRENCY".to_string(),
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn inverted_credit_band_is_rejected() {
        let err = config(&[("CREDITS_MIN_AMOUNT", "50"), ("CREDITS_MAX_AMOUNT", "10")]);
        assert!(err.is_err());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for key in ["STALL_INTERVAL_SECS", "PROGRESS_TICK_MS", "MONITOR_INTERVAL_SECS"] {
            let err = config(&[(key, "0")]).unwrap_err();
            assert_eq!(
                err,
                ConfigError::Invalid {
                    key: key.to_string(),
                    value: "0".to_string()
                }
            );
        }
    }

    #[test]
    fn prices_must_be_positive() {
        let err = config(&[("PRICE_EFFECT", "0")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "PRICE_EFFECT".to_string(),
                value: "0".to_string()
            }
        );

        let err = config(&[("PRICE_STORY_PER_SCENE", "-5")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "PRICE_STORY_PER_SCENE".to_string(),
                value: "-5".to_string()
            }
        );

        let cfg = config(&[("PRICE_VOICE_OVER", "1")]).unwrap();
        assert_eq!(cfg.pricing.voice_over, 1);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(config(&[("STORY_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config(&[("REDIS_URL", "  "), ("PROVIDER_API_KEY", "k")]).unwrap();
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.provider.api_key.as_deref(), Some("k"));
    }
}
