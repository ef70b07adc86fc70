use crate::error::{ProcessorError, Result};
use crate::logging::LogFormat;
use crate::services::classifier::{ModelSource, ReferenceDistribution};
use crate::services::stream_consumer::StreamBinding;
use crate::services::supervisor::{ReclaimPolicy, SupervisorConfig};
use db_pool::env_utils::{parse_env_optional, parse_env_or};
use db_pool::DbConfig;
use resilience::RetryConfig;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const SERVICE_NAME: &str = "log-processor-service";

#[derive(Clone)]
pub struct Config {
    pub redis_url: String,
    pub database: DbConfig,

    // Stream binding
    pub stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,

    pub supervisor: SupervisorConfig,
    pub persist_timeout: Duration,
    pub classifier: ModelSource,

    pub health_port: u16,
    pub log_format: LogFormat,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &redis_utils::redact_url(&self.redis_url))
            .field("database", &self.database)
            .field("stream_key", &self.stream_key)
            .field("consumer_group", &self.consumer_group)
            .field("consumer_name", &self.consumer_name)
            .field("supervisor", &self.supervisor)
            .field("persist_timeout", &self.persist_timeout)
            .field("classifier", &self.classifier)
            .field("health_port", &self.health_port)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database = DbConfig::from_env(SERVICE_NAME).map_err(ProcessorError::Config)?;

        let supervisor_defaults = SupervisorConfig::default();
        let retry_defaults = &supervisor_defaults.startup_retry;
        let reclaim_defaults = ReclaimPolicy::default();

        let reclaim = if env_or("RECLAIM_ENABLED", true)? {
            Some(ReclaimPolicy {
                min_idle: Duration::from_millis(env_or(
                    "RECLAIM_MIN_IDLE_MS",
                    reclaim_defaults.min_idle.as_millis() as u64,
                )?),
                interval: Duration::from_secs(env_or(
                    "RECLAIM_INTERVAL_SECS",
                    reclaim_defaults.interval.as_secs(),
                )?),
                batch_size: env_or("RECLAIM_BATCH_SIZE", reclaim_defaults.batch_size)?,
            })
        } else {
            None
        };

        let supervisor = SupervisorConfig {
            group_start_id: env_or("GROUP_START_ID", supervisor_defaults.group_start_id.clone())?,
            batch_size: env_or("BATCH_SIZE", supervisor_defaults.batch_size)?,
            block_timeout: Duration::from_millis(env_or(
                "BLOCK_TIMEOUT_MS",
                supervisor_defaults.block_timeout.as_millis() as u64,
            )?),
            fault_backoff: Duration::from_millis(env_or(
                "FAULT_BACKOFF_MS",
                supervisor_defaults.fault_backoff.as_millis() as u64,
            )?),
            startup_retry: RetryConfig {
                max_retries: env_or("STARTUP_MAX_RETRIES", retry_defaults.max_retries)?,
                initial_backoff: Duration::from_millis(env_or(
                    "STARTUP_INITIAL_BACKOFF_MS",
                    retry_defaults.initial_backoff.as_millis() as u64,
                )?),
                ..retry_defaults.clone()
            },
            reclaim,
        };

        if supervisor.batch_size == 0 {
            return Err(ProcessorError::Config("BATCH_SIZE must be at least 1".into()));
        }
        if supervisor.reclaim.as_ref().is_some_and(|r| r.batch_size == 0) {
            return Err(ProcessorError::Config(
                "RECLAIM_BATCH_SIZE must be at least 1".into(),
            ));
        }

        let classifier = match env_optional::<PathBuf>("CLASSIFIER_MODEL_PATH")? {
            Some(path) => ModelSource::File(path),
            None => {
                let reference = ReferenceDistribution::default();
                ModelSource::Reference(ReferenceDistribution {
                    mean: env_or("CLASSIFIER_REFERENCE_MEAN", reference.mean)?,
                    std_dev: env_or("CLASSIFIER_REFERENCE_STD_DEV", reference.std_dev)?,
                    samples: env_or("CLASSIFIER_REFERENCE_SAMPLES", reference.samples)?,
                    contamination: env_or("CLASSIFIER_CONTAMINATION", reference.contamination)?,
                    seed: env_or("CLASSIFIER_SEED", reference.seed)?,
                })
            }
        };

        Ok(Self {
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379".to_string())?,
            database,
            stream_key: env_or("STREAM_KEY", "log_stream".to_string())?,
            consumer_group: env_or("CONSUMER_GROUP", "ai_group".to_string())?,
            consumer_name: match env_optional("CONSUMER_NAME")? {
                Some(name) => name,
                None => default_consumer_name(),
            },
            supervisor,
            persist_timeout: Duration::from_millis(env_or("PERSIST_TIMEOUT_MS", 5000u64)?),
            classifier,
            health_port: env_or("HEALTH_PORT", 8080u16)?,
            log_format: env_or("LOG_FORMAT", LogFormat::Text)?,
        })
    }

    pub fn stream_binding(&self) -> StreamBinding {
        StreamBinding {
            stream_key: self.stream_key.clone(),
            group: self.consumer_group.clone(),
            consumer: self.consumer_name.clone(),
        }
    }
}

/// Unique per process so that two workers on one host never share a PEL.
pub fn default_consumer_name() -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.trim().is_empty() => format!("{}-{}", host.trim(), std::process::id()),
        _ => format!("worker-{}", uuid::Uuid::new_v4()),
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    parse_env_or(key, default).map_err(ProcessorError::Config)
}

fn env_optional<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    parse_env_optional(key).map_err(ProcessorError::Config)
}
