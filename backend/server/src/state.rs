use std::sync::Arc;

use anyhow::Context;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{
    cache::{LocalTier, ReadPath, SharedTier},
    config::Config,
    coordinator::Coordinator,
    database::{RedisRecordStore, init_redis},
    queue::{StreamPublisher, connect_with_backoff},
    search::SolrIndex,
    synchronizer::{HttpActivitySource, Synchronizer},
};

pub struct CatalogState {
    pub config: Config,
    pub coordinator: Coordinator,
}

impl CatalogState {
    pub async fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let store_connection = init_redis(&config.redis_url)
            .await
            .context("Failed to connect to the record store")?;
        let queue_connection =
            connect_with_backoff(&config.redis_url, config.queue_connect_attempts)
                .await
                .context("Failed to connect to the event queue")?;

        let store = RedisRecordStore::new(store_connection, config.call_timeout);
        let publisher = StreamPublisher::new(queue_connection, &config);
        info!("Publishing change events to {}", config.event_stream);

        Ok(Self::from_parts(
            config,
            Coordinator::new(Arc::new(store), Arc::new(publisher)),
        ))
    }

    pub fn from_parts(config: Config, coordinator: Coordinator) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator,
        })
    }
}

pub struct SearchState {
    pub config: Config,
    pub read_path: ReadPath,
}

impl SearchState {
    /// Builds the read path and the synchronizer over the same index and
    /// tiers. Returns the queue connection for the consumer.
    pub async fn new(
        config: Config,
    ) -> anyhow::Result<(Arc<Self>, Synchronizer, ConnectionManager)> {
        let cache_connection = init_redis(&config.redis_url)
            .await
            .context("Failed to connect to the shared cache")?;
        let queue_connection =
            connect_with_backoff(&config.redis_url, config.queue_connect_attempts)
                .await
                .context("Failed to connect to the event queue")?;

        let index = Arc::new(
            SolrIndex::new(&config.solr_url, config.call_timeout)
                .context("Failed to build search client")?,
        );
        let source = Arc::new(
            HttpActivitySource::new(&config.activities_api_url, config.call_timeout)
                .context("Failed to build catalog client")?,
        );
        let local = Arc::new(LocalTier::new(
            config.local_cache_capacity,
            config.local_cache_ttl,
        ));
        let shared = Arc::new(SharedTier::new(
            cache_connection,
            config.shared_cache_ttl,
            config.call_timeout,
        ));

        let synchronizer = Synchronizer::new(source, index.clone(), local.clone(), shared.clone());
        let read_path = ReadPath::new(local, shared, index);

        Ok((
            Self::from_parts(config, read_path),
            synchronizer,
            queue_connection,
        ))
    }

    pub fn from_parts(config: Config, read_path: ReadPath) -> Arc<Self> {
        Arc::new(Self { config, read_path })
    }
}
