//! Process configuration.
//!
//! Everything is read from the environment (a `.env` file is loaded first by
//! the binaries). Unset keys fall back to the defaults of each component's
//! config struct.

use std::path::PathBuf;
use std::str::FromStr;

use crate::coordinator::CoordinatorConfig;
use crate::mail::{RelayConfig, ThrottleConfig};
use crate::registry::DEFAULT_MAX_RANGE;
use crate::scheduler::{QueueRetention, SchedulerConfig};
use crate::sender::SenderConfig;
use crate::synchronizer::SynchronizerConfig;
use crate::{Error, Result};

/// Default relational store URL.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:mass-mailer.db?mode=rwc";

/// Default operational store URL.
pub const DEFAULT_OPERATIONAL_DATABASE_URL: &str = "sqlite:mass-mailer-ops.db?mode=rwc";

/// Default relay request timeout.
const DEFAULT_RELAY_TIMEOUT_SECS: u64 = 30;

/// Identity of a sender worker inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: i64,
    pub max_workers: u32,
}

/// Transport selection and throttling.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Relay endpoint; without one the dry-run transport is used.
    pub relay_url: Option<String>,
    pub relay_timeout_secs: u64,
    pub relay_auth_token: Option<String>,
    pub channel_rate_per_sec: Option<f64>,
}

impl TransportConfig {
    pub fn relay(&self) -> Option<RelayConfig> {
        self.relay_url.as_ref().map(|url| RelayConfig {
            url: url.clone(),
            timeout_secs: self.relay_timeout_secs,
            auth_token: self.relay_auth_token.clone(),
        })
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            default_rate_per_sec: self.channel_rate_per_sec,
        }
    }
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    /// Only required by sender workers.
    pub worker: Option<WorkerIdentity>,
    pub database_url: String,
    pub operational_database_url: String,
    pub log_dir: Option<PathBuf>,
    /// Rewrite the worker registry on startup.
    pub reset_registry: bool,
    pub max_range: i64,
    pub coordinator: CoordinatorConfig,
    pub sender: SenderConfig,
    pub scheduler: SchedulerConfig,
    pub synchronizer: SynchronizerConfig,
    pub transport: TransportConfig,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            worker: None,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            operational_database_url: DEFAULT_OPERATIONAL_DATABASE_URL.to_string(),
            log_dir: None,
            reset_registry: false,
            max_range: DEFAULT_MAX_RANGE,
            coordinator: CoordinatorConfig::default(),
            sender: SenderConfig::default(),
            scheduler: SchedulerConfig::default(),
            synchronizer: SynchronizerConfig::default(),
            transport: TransportConfig {
                relay_timeout_secs: DEFAULT_RELAY_TIMEOUT_SECS,
                ..Default::default()
            },
        }
    }
}

/// Typed reads over a key lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn opt<T: FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.raw(key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|e| Error::config(format!("{}={:?}: {}", key, v, e)))
            })
            .transpose()
    }

    fn get<T: FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        Ok(self.opt(key)?.unwrap_or(default))
    }

    fn flag(&self, key: &str) -> Result<bool> {
        match self.raw(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::config(format!("{}={:?} is not a boolean", key, v))),
            },
        }
    }
}

impl MailerConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let d = Self::default();

        let worker = match (
            env.opt::<i64>("MAILER_WORKER_ID")?,
            env.opt::<u32>("MAILER_MAX_WORKERS")?,
        ) {
            (Some(worker_id), Some(max_workers)) => Some(WorkerIdentity {
                worker_id,
                max_workers,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::config(
                    "MAILER_WORKER_ID and MAILER_MAX_WORKERS must be set together",
                ));
            }
        };

        let retention = &d.scheduler.queue_retention;
        let config = Self {
            worker,
            database_url: env.get("DATABASE_URL", d.database_url.clone())?,
            operational_database_url: env
                .get("OPERATIONAL_DATABASE_URL", d.operational_database_url.clone())?,
            log_dir: env.raw("MAILER_LOG_DIR").map(PathBuf::from),
            reset_registry: env.flag("MAILER_RESET_REGISTRY")?,
            max_range: env.get("MAILER_MAX_RANGE", d.max_range)?,
            coordinator: CoordinatorConfig {
                period_ms: env.get("MAILER_PERIOD_MS", d.coordinator.period_ms)?,
                synchronizing_round: env
                    .get("MAILER_SYNCHRONIZING_ROUND", d.coordinator.synchronizing_round)?,
            },
            sender: SenderConfig {
                chunk_size: env.get("MAILER_CHUNK_SIZE", d.sender.chunk_size)?,
                idle_sleep_ms: env.get("MAILER_IDLE_SLEEP_MS", d.sender.idle_sleep_ms)?,
            },
            scheduler: SchedulerConfig {
                check_period_ms: env.get("MAILER_CHECK_PERIOD_MS", d.scheduler.check_period_ms)?,
                campaign_retention_days: env.get(
                    "MAILER_CAMPAIGN_RETENTION_DAYS",
                    d.scheduler.campaign_retention_days,
                )?,
                queue_retention: QueueRetention {
                    triggered_hours: env
                        .get("MAILER_RETENTION_TRIGGERED_HOURS", retention.triggered_hours)?,
                    test_hours: env.get("MAILER_RETENTION_TEST_HOURS", retention.test_hours)?,
                    subscription_hours: env.get(
                        "MAILER_RETENTION_SUBSCRIPTION_HOURS",
                        retention.subscription_hours,
                    )?,
                    api_transactional_hours: env.get(
                        "MAILER_RETENTION_API_TRANSACTIONAL_HOURS",
                        retention.api_transactional_hours,
                    )?,
                },
                queue_batch_size: env.get("MAILER_QUEUE_BATCH_SIZE", d.scheduler.queue_batch_size)?,
            },
            synchronizer: SynchronizerConfig {
                chunk_size: env.get("MAILER_SYNC_CHUNK_SIZE", d.synchronizer.chunk_size)?,
                poll_ms: env.get("MAILER_SYNC_POLL_MS", d.synchronizer.poll_ms)?,
                stale_sent_secs: env
                    .get("MAILER_STALE_SENT_SECS", d.synchronizer.stale_sent_secs)?,
            },
            transport: TransportConfig {
                relay_url: env.raw("MAILER_RELAY_URL"),
                relay_timeout_secs: env
                    .get("MAILER_RELAY_TIMEOUT_SECS", d.transport.relay_timeout_secs)?,
                relay_auth_token: env.raw("MAILER_RELAY_AUTH_TOKEN"),
                channel_rate_per_sec: env.opt("MAILER_CHANNEL_RATE_PER_SEC")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(worker) = self.worker {
            if worker.max_workers == 0 {
                return Err(Error::config("MAILER_MAX_WORKERS must be at least 1"));
            }
            if worker.worker_id < 0 || worker.worker_id >= i64::from(worker.max_workers) {
                return Err(Error::config(format!(
                    "MAILER_WORKER_ID {} is outside the pool of {} workers",
                    worker.worker_id, worker.max_workers
                )));
            }
            if self.max_range < i64::from(worker.max_workers) {
                return Err(Error::config(format!(
                    "MAILER_MAX_RANGE {} is smaller than the pool of {} workers",
                    self.max_range, worker.max_workers
                )));
            }
        }

        let positive = [
            ("MAILER_PERIOD_MS", self.coordinator.period_ms as i64),
            (
                "MAILER_SYNCHRONIZING_ROUND",
                i64::from(self.coordinator.synchronizing_round),
            ),
            ("MAILER_CHUNK_SIZE", self.sender.chunk_size),
            ("MAILER_CHECK_PERIOD_MS", self.scheduler.check_period_ms as i64),
            ("MAILER_QUEUE_BATCH_SIZE", self.scheduler.queue_batch_size),
            ("MAILER_SYNC_CHUNK_SIZE", self.synchronizer.chunk_size),
            ("MAILER_SYNC_POLL_MS", self.synchronizer.poll_ms as i64),
            ("MAILER_RELAY_TIMEOUT_SECS", self.transport.relay_timeout_secs as i64),
        ];
        for (key, value) in positive {
            if value <= 0 {
                return Err(Error::config(format!("{} must be positive", key)));
            }
        }

        if let Some(rps) = self.transport.channel_rate_per_sec {
            if !rps.is_finite() || rps <= 0.0 {
                return Err(Error::config(
                    "MAILER_CHANNEL_RATE_PER_SEC must be a positive number",
                ));
            }
        }
        Ok(())
    }

    /// The worker identity, required by sender workers.
    pub fn require_worker(&self) -> Result<WorkerIdentity> {
        self.worker.ok_or_else(|| {
            Error::config("MAILER_WORKER_ID and MAILER_MAX_WORKERS are required for sender workers")
        })
    }
}
