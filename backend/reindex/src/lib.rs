//! # Reindex
//!
//! Rebuilds the search index from the record store by republishing a `create`
//! event for every activity. The search service handles them like any other
//! event, so a rebuild needs no direct access to the search engine.
//!
//! - Safe to rerun, the synchronizer treats duplicate creates as upserts
//! - One failed publish does not stop the run, failures are counted and reported
use activities::{
    database::RecordStore, error::StoreError, models::ChangeEvent, queue::EventPublisher,
};
use indicatif::ProgressBar;
use tracing::{error, info};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub published: usize,
    pub failed: Vec<String>,
}

impl Summary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub async fn republish(
    store: &dyn RecordStore,
    publisher: &dyn EventPublisher,
    progress: &ProgressBar,
    dry_run: bool,
) -> Result<Summary, StoreError> {
    let mut activities = store.list().await?;
    activities.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    info!("Found {} activities to reindex", activities.len());
    progress.set_length(activities.len() as u64);

    let mut summary = Summary {
        total: activities.len(),
        ..Summary::default()
    };

    for activity in &activities {
        progress.set_message(activity.fields.title.clone());

        if dry_run {
            info!(activity_id = %activity.id, "Would republish {}", activity.fields.title);
        } else {
            match publisher.publish(&ChangeEvent::created(activity)).await {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    error!(
                        activity_id = %activity.id,
                        "Failed to publish {}: {e}",
                        activity.fields.title
                    );
                    summary.failed.push(activity.id.clone());
                }
            }
        }

        progress.inc(1);
    }

    progress.finish_with_message("Done");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use activities::{
        memory::{MemoryPublisher, MemoryRecordStore, activity},
        models::EventAction,
    };

    use super::*;

    async fn seeded() -> MemoryRecordStore {
        let store = MemoryRecordStore::default();
        for (id, title) in [("a1", "Yoga"), ("a2", "Boxing"), ("a3", "Pilates")] {
            store.insert(&activity(id, title, 10)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_republishes_every_record() {
        let store = seeded().await;
        let publisher = MemoryPublisher::default();

        let summary = republish(&store, &publisher, &ProgressBar::hidden(), false)
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.published, 3);
        assert!(summary.is_clean());

        let events = publisher.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.action == EventAction::Create));
    }

    #[tokio::test]
    async fn test_dry_run_publishes_nothing() {
        let store = seeded().await;
        let publisher = MemoryPublisher::default();

        let summary = republish(&store, &publisher, &ProgressBar::hidden(), true)
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.published, 0);
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let store = seeded().await;
        let publisher = MemoryPublisher::default();
        publisher.set_failing(true);

        let summary = republish(&store, &publisher, &ProgressBar::hidden(), false)
            .await
            .unwrap();

        assert_eq!(summary.published, 0);
        assert_eq!(summary.failed.len(), 3);
        assert!(!summary.is_clean());
    }

    #[tokio::test]
    async fn test_store_error_aborts() {
        let store = seeded().await;
        store.fail_reads(true);

        let result = republish(
            &store,
            &MemoryPublisher::default(),
            &ProgressBar::hidden(),
            false,
        )
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable)));
    }
}
