//! # Synchronizer
//!
//! Applies change events to the search index and the cache tiers.
//!
//! - Never trusts the event snapshot, canonical state is always re-fetched
//! - An activity that is gone by the time its create/update arrives is
//!   removed from the index, so a late event cannot resurrect it
//! - Fetch and index errors go back to the queue for retry
//! - Flush errors are logged and swallowed
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::{
    cache::CacheTier,
    error::{FetchError, SyncError},
    models::{ChangeEvent, EventAction, ManyActivities, SearchDocument},
    queue::EventHandler,
    search::SearchIndex,
};

/// Canonical activity state, as served by the catalog.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<SearchDocument>, FetchError>;
}

#[derive(Clone)]
pub struct HttpActivitySource {
    client: Client,
    base_url: String,
}

impl HttpActivitySource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ActivitySource for HttpActivitySource {
    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<SearchDocument>, FetchError> {
        let response = self
            .client
            .get(format!("{}/activities/many", self.base_url))
            .query(&[("ids", ids.join(","))])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let body: ManyActivities = response.json().await?;
        Ok(body.activities)
    }
}

pub struct Synchronizer {
    source: Arc<dyn ActivitySource>,
    index: Arc<dyn SearchIndex>,
    tiers: Vec<Arc<dyn CacheTier>>,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn ActivitySource>,
        index: Arc<dyn SearchIndex>,
        local: Arc<dyn CacheTier>,
        shared: Arc<dyn CacheTier>,
    ) -> Self {
        Self {
            source,
            index,
            tiers: vec![local, shared],
        }
    }

    async fn reindex(&self, id: &str) -> Result<(), SyncError> {
        let documents = self
            .source
            .fetch_many(&[id.to_string()])
            .await
            .map_err(|source| SyncError::Fetch {
                id: id.to_string(),
                source,
            })?;

        match documents.into_iter().find(|doc| doc.id == id) {
            Some(document) => {
                self.index
                    .index(&document)
                    .await
                    .map_err(|source| SyncError::Index {
                        id: id.to_string(),
                        source,
                    })?;
                debug!(activity_id = %id, "Indexed activity");
            }
            None => {
                info!(activity_id = %id, "Activity no longer exists, removing from index");
                self.remove(id).await?;
            }
        }

        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), SyncError> {
        self.index
            .delete(id)
            .await
            .map_err(|source| SyncError::Index {
                id: id.to_string(),
                source,
            })
    }

    async fn flush(&self) {
        for tier in &self.tiers {
            if let Err(e) = tier.flush_all().await {
                warn!("Error flushing {} cache: {e}", tier.name());
            }
        }
    }
}

#[async_trait]
impl EventHandler for Synchronizer {
    async fn handle(&self, event: ChangeEvent) -> Result<(), SyncError> {
        match &event.action {
            EventAction::Create | EventAction::Update => self.reindex(&event.id).await?,
            EventAction::Delete => self.remove(&event.id).await?,
            EventAction::Other(action) => {
                info!(activity_id = %event.id, "Ignoring unknown event action {action}");
                return Ok(());
            }
        }

        self.flush().await;
        info!(action = %event.action, activity_id = %event.id, "Synchronized event");

        Ok(())
    }
}
