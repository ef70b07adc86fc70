use crate::config::Config;
use crate::error::{ProcessorError, Result};
use crate::services::classifier::{Classifier, LengthClassifier};
use crate::services::persistence::{PgLogStore, RecordStore};
use crate::services::stream_consumer::{EventStream, RedisEventStream};
use redis_utils::{RedisConfig, RedisPool};
use resilience::with_retry;
use std::sync::Arc;
use tracing::info;

/// The three collaborators of the processing loop, shared by reference.
#[derive(Clone)]
pub struct AppContext {
    pub stream: Arc<dyn EventStream>,
    pub classifier: Arc<dyn Classifier>,
    pub store: Arc<dyn RecordStore>,
}

impl AppContext {
    /// Initializes the classifier before it is shared, so `score` never runs
    /// against an unfitted model.
    pub fn new<C>(
        stream: Arc<dyn EventStream>,
        mut classifier: C,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self>
    where
        C: Classifier + 'static,
    {
        classifier.initialize().map_err(|e| {
            ProcessorError::Startup(format!(
                "classifier {} failed to initialize: {}",
                classifier.name(),
                e
            ))
        })?;

        Ok(Self {
            stream,
            classifier: Arc::new(classifier),
            store,
        })
    }

    /// Connect to Redis and PostgreSQL, retrying with the startup policy.
    pub async fn connect(config: &Config) -> Result<Self> {
        let retry = config.supervisor.startup_retry.clone();

        let redis_config = RedisConfig::new(config.redis_url.clone());
        let redis = with_retry(retry.clone(), || RedisPool::connect(&redis_config))
            .await
            .map_err(|e| ProcessorError::Startup(format!("Redis unavailable: {}", e)))?;

        config.database.log_config();
        let pool = with_retry(retry, || db_pool::create_pool(config.database.clone()))
            .await
            .map_err(|e| ProcessorError::Startup(format!("PostgreSQL unavailable: {}", e)))?;

        let binding = config.stream_binding();
        info!(
            redis = %redis.endpoint(),
            stream = %binding.stream_key,
            group = %binding.group,
            consumer = %binding.consumer,
            "Connected to stream and database"
        );

        let stream = RedisEventStream::new(redis.manager(), binding);
        let store = PgLogStore::new(pool, config.persist_timeout);

        Self::new(
            Arc::new(stream),
            LengthClassifier::new(config.classifier.clone()),
            Arc::new(store),
        )
    }
}
