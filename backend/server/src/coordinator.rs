//! # Write Coordinator
//!
//! Each mutation is a two step saga: record store write, then event publish.
//! If the publish fails the store write is undone.
//!
//! | Operation | Compensation on publish failure          |
//! |-----------|------------------------------------------|
//! | create    | remove the new record                    |
//! | update    | re-apply the previous fields             |
//! | delete    | re-insert the removed record as it was   |
//! | enroll    | none, the publish error is surfaced      |
//! | unenroll  | none, the publish error is surfaced      |
//!
//! A failed compensation is `Inconsistent` and logged at `error!`.
//!
//! Enrollment is not compensated. A caller retrying after a publish error gets
//! `AlreadyEnrolled` or `NotEnrolled`, and the update event is published again
//! on that path so the index still converges.
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::{
    database::{EnrollOutcome, FieldsOutcome, RecordStore},
    error::{QueueError, StoreError, ValidationError, WriteError},
    models::{
        Activity, ActivityPatch, ChangeEvent, Enrollment, EnrollmentStatus, EventAction,
        NewActivity,
    },
    queue::EventPublisher,
    stats::{Statistics, compute_statistics},
    utils::{new_activity_id, validate_activity, validate_participant},
};

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn RecordStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn RecordStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn create(&self, input: &NewActivity) -> Result<Activity, WriteError> {
        let fields = validate_activity(input)?;
        let activity = Activity {
            id: new_activity_id(),
            fields,
            enrolled: Default::default(),
            created_at: Utc::now(),
        };

        self.store.insert(&activity).await?;

        if let Err(publish) = self.publisher.publish(&ChangeEvent::created(&activity)).await {
            let rollback = self.store.remove(&activity.id).await.map(|_| ());
            return Err(compensated(EventAction::Create, &activity.id, publish, rollback));
        }

        info!(activity_id = %activity.id, "Created activity");
        Ok(activity)
    }

    pub async fn update(&self, id: &str, patch: &ActivityPatch) -> Result<Activity, WriteError> {
        if patch.is_empty() {
            return Err(ValidationError::NoFieldsToUpdate.into());
        }

        let current = self.store.get(id).await?.ok_or(WriteError::NotFound)?;
        let fields = validate_activity(&patch.apply_to(&current.fields))?;

        match self.store.update_fields(id, &fields).await? {
            FieldsOutcome::Updated => {}
            FieldsOutcome::NotFound => return Err(WriteError::NotFound),
            FieldsOutcome::BelowEnrollment { enrolled } => {
                return Err(ValidationError::CapacityBelowEnrollment {
                    capacity: fields.capacity,
                    enrolled,
                }
                .into());
            }
        }

        // Enrollment may have moved since the read, the store is authoritative.
        let updated = self
            .store
            .get(id)
            .await?
            .unwrap_or_else(|| Activity { fields, ..current.clone() });

        if let Err(publish) = self.publisher.publish(&ChangeEvent::updated(&updated)).await {
            let rollback = match self.store.update_fields(id, &current.fields).await {
                Ok(FieldsOutcome::Updated) => Ok(()),
                Ok(FieldsOutcome::NotFound) => Err(StoreError::Corrupt {
                    id: id.to_string(),
                    reason: "record vanished before rollback".to_string(),
                }),
                Ok(FieldsOutcome::BelowEnrollment { enrolled }) => Err(StoreError::Corrupt {
                    id: id.to_string(),
                    reason: format!(
                        "previous capacity {} no longer covers {enrolled} enrolled",
                        current.fields.capacity
                    ),
                }),
                Err(e) => Err(e),
            };
            return Err(compensated(EventAction::Update, id, publish, rollback));
        }

        info!(activity_id = %id, "Updated activity");
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), WriteError> {
        self.store.get(id).await?.ok_or(WriteError::NotFound)?;

        let removed = self.store.remove(id).await?.ok_or(WriteError::NotFound)?;

        if let Err(publish) = self.publisher.publish(&ChangeEvent::deleted(id)).await {
            let rollback = self.store.insert(&removed).await;
            return Err(compensated(EventAction::Delete, id, publish, rollback));
        }

        info!(activity_id = %id, "Deleted activity");
        Ok(())
    }

    pub async fn enroll(&self, id: &str, participant: &str) -> Result<Enrollment, WriteError> {
        let participant = validate_participant(participant)?;
        self.store.get(id).await?.ok_or(WriteError::NotFound)?;

        let enrolled = match self.store.enroll(id, participant).await? {
            EnrollOutcome::Done { enrolled } => enrolled,
            EnrollOutcome::AlreadyEnrolled => {
                // A retry after a failed publish lands here, the event is owed.
                self.announce(id).await?;
                return Err(WriteError::AlreadyEnrolled);
            }
            outcome => return Err(rejected(outcome)),
        };

        self.announce(id).await?;

        info!(activity_id = %id, participant, "Participant enrolled");
        Ok(Enrollment {
            status: EnrollmentStatus::Inscribed,
            activity_id: id.to_string(),
            participant: participant.to_string(),
            enrolled,
        })
    }

    pub async fn unenroll(&self, id: &str, participant: &str) -> Result<Enrollment, WriteError> {
        let participant = validate_participant(participant)?;
        self.store.get(id).await?.ok_or(WriteError::NotFound)?;

        let enrolled = match self.store.unenroll(id, participant).await? {
            EnrollOutcome::Done { enrolled } => enrolled,
            EnrollOutcome::NotEnrolled => {
                self.announce(id).await?;
                return Err(WriteError::NotEnrolled);
            }
            outcome => return Err(rejected(outcome)),
        };

        self.announce(id).await?;

        info!(activity_id = %id, participant, "Participant unenrolled");
        Ok(Enrollment {
            status: EnrollmentStatus::Uninscribed,
            activity_id: id.to_string(),
            participant: participant.to_string(),
            enrolled,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Activity, WriteError> {
        self.store.get(id).await?.ok_or(WriteError::NotFound)
    }

    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<Activity>, WriteError> {
        Ok(self.store.get_many(ids).await?)
    }

    pub async fn list(&self) -> Result<Vec<Activity>, WriteError> {
        let mut activities = self.store.list().await?;
        activities.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(activities)
    }

    pub async fn enrollments_of(&self, participant: &str) -> Result<Vec<Activity>, WriteError> {
        let participant = validate_participant(participant)?;
        let ids = self.store.enrollments_of(participant).await?;
        Ok(self.store.get_many(&ids).await?)
    }

    pub async fn statistics(&self) -> Result<Statistics, WriteError> {
        let activities = self.store.list().await?;
        Ok(compute_statistics(activities.into()).await)
    }

    /// Publishes an update carrying the post-enrollment snapshot.
    async fn announce(&self, id: &str) -> Result<(), WriteError> {
        let event = match self.store.get(id).await {
            Ok(Some(activity)) => ChangeEvent::updated(&activity),
            _ => ChangeEvent::new(EventAction::Update, id, Default::default()),
        };

        self.publisher.publish(&event).await.map_err(|e| {
            warn!(activity_id = %id, "Enrollment committed but event not published: {e}");
            WriteError::Publish(e)
        })
    }
}

fn rejected(outcome: EnrollOutcome) -> WriteError {
    match outcome {
        EnrollOutcome::Full => WriteError::Full,
        EnrollOutcome::AlreadyEnrolled => WriteError::AlreadyEnrolled,
        EnrollOutcome::NotEnrolled => WriteError::NotEnrolled,
        EnrollOutcome::NotFound | EnrollOutcome::Done { .. } => WriteError::NotFound,
    }
}

fn compensated(
    action: EventAction,
    id: &str,
    publish: QueueError,
    rollback: Result<(), StoreError>,
) -> WriteError {
    let action = match action {
        EventAction::Create => "create",
        EventAction::Update => "update",
        EventAction::Delete => "delete",
        EventAction::Other(_) => "other",
    };

    match rollback {
        Ok(()) => {
            warn!(activity_id = %id, action, "Publish failed, change rolled back: {publish}");
            WriteError::RolledBack {
                action,
                id: id.to_string(),
                source: publish,
            }
        }
        Err(rollback) => {
            error!(
                activity_id = %id,
                action,
                publish_error = %publish,
                rollback_error = %rollback,
                "Publish and rollback both failed, record store and index have diverged"
            );
            WriteError::Inconsistent {
                action,
                id: id.to_string(),
                publish,
                rollback,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::memory::{MemoryPublisher, MemoryRecordStore, new_activity};

    fn setup() -> (Arc<MemoryRecordStore>, Arc<MemoryPublisher>, Coordinator) {
        let store = Arc::new(MemoryRecordStore::default());
        let publisher = Arc::new(MemoryPublisher::default());
        let coordinator = Coordinator::new(store.clone(), publisher.clone());
        (store, publisher, coordinator)
    }

    #[tokio::test]
    async fn test_create_publishes_event() {
        let (store, publisher, coordinator) = setup();

        let created = coordinator.create(&new_activity("Yoga", 5)).await.unwrap();

        assert_eq!(store.len(), 1);
        let events = publisher.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::Create);
        assert_eq!(events[0].id, created.id);
        assert_eq!(events[0].snapshot.title, "Yoga");
    }

    #[tokio::test]
    async fn test_create_validation_writes_nothing() {
        let (store, publisher, coordinator) = setup();

        let result = coordinator.create(&new_activity("  ", 5)).await;

        assert!(matches!(
            result,
            Err(WriteError::Validation(ValidationError::TitleRequired))
        ));
        assert!(store.is_empty());
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_publish_failure() {
        let (store, publisher, coordinator) = setup();
        publisher.set_failing(true);

        let result = coordinator.create(&new_activity("Yoga", 5)).await;

        assert!(matches!(
            result,
            Err(WriteError::RolledBack {
                action: "create",
                ..
            })
        ));
        assert!(store.is_empty());
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_is_inconsistent() {
        let (store, publisher, coordinator) = setup();
        publisher.set_failing(true);
        store.fail_remove(true);

        let result = coordinator.create(&new_activity("Yoga", 5)).await;

        assert!(matches!(
            result,
            Err(WriteError::Inconsistent {
                action: "create",
                rollback: StoreError::Unavailable,
                ..
            })
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rolls_back_previous_fields() {
        let (store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 5)).await.unwrap();
        publisher.set_failing(true);

        let patch = ActivityPatch {
            title: Some("Pilates".to_string()),
            ..ActivityPatch::default()
        };
        let result = coordinator.update(&created.id, &patch).await;

        assert!(matches!(result, Err(WriteError::RolledBack { .. })));
        let stored = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.fields, created.fields);
    }

    #[tokio::test]
    async fn test_failed_delete_rollback_is_inconsistent() {
        let (store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 5)).await.unwrap();
        publisher.set_failing(true);
        store.fail_insert(true);

        let result = coordinator.delete(&created.id).await;

        match result {
            Err(WriteError::Inconsistent { action, id, .. }) => {
                assert_eq!(action, "delete");
                assert_eq!(id, created.id);
            }
            other => panic!("expected inconsistent delete, got {other:?}"),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_rejects_empty_patch_and_low_capacity() {
        let (_store, _publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 2)).await.unwrap();
        coordinator.enroll(&created.id, "u1").await.unwrap();
        coordinator.enroll(&created.id, "u2").await.unwrap();

        let result = coordinator.update(&created.id, &ActivityPatch::default()).await;
        assert!(matches!(
            result,
            Err(WriteError::Validation(ValidationError::NoFieldsToUpdate))
        ));

        let patch = ActivityPatch {
            capacity: Some(1),
            ..ActivityPatch::default()
        };
        let result = coordinator.update(&created.id, &patch).await;
        assert!(matches!(
            result,
            Err(WriteError::Validation(
                ValidationError::CapacityBelowEnrollment {
                    capacity: 1,
                    enrolled: 2
                }
            ))
        ));

        let result = coordinator.update("missing", &patch).await;
        assert!(matches!(result, Err(WriteError::NotFound)));
    }

    #[tokio::test]
    async fn test_update_keeps_enrollment() {
        let (_store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 2)).await.unwrap();
        coordinator.enroll(&created.id, "u1").await.unwrap();

        let patch = ActivityPatch {
            title: Some("Pilates".to_string()),
            capacity: Some(4),
            ..ActivityPatch::default()
        };
        let updated = coordinator.update(&created.id, &patch).await.unwrap();

        assert_eq!(updated.fields.title, "Pilates");
        assert_eq!(updated.fields.capacity, 4);
        assert_eq!(updated.enrolled, BTreeSet::from(["u1".to_string()]));
        assert_eq!(publisher.events().last().unwrap().action, EventAction::Update);
    }

    #[tokio::test]
    async fn test_delete_restores_exact_record() {
        let (store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 3)).await.unwrap();
        coordinator.enroll(&created.id, "u1").await.unwrap();
        let before = store.get(&created.id).await.unwrap().unwrap();
        publisher.set_failing(true);

        let result = coordinator.delete(&created.id).await;

        assert!(matches!(
            result,
            Err(WriteError::RolledBack {
                action: "delete",
                ..
            })
        ));
        assert_eq!(store.get(&created.id).await.unwrap(), Some(before));
    }

    #[tokio::test]
    async fn test_delete_publishes_and_reports_missing() {
        let (store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 3)).await.unwrap();

        coordinator.delete(&created.id).await.unwrap();

        assert!(store.is_empty());
        assert_eq!(publisher.events().last(), Some(&ChangeEvent::deleted(&created.id)));
        assert!(matches!(
            coordinator.delete(&created.id).await,
            Err(WriteError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_enrollment_conflicts() {
        let (_store, _publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 1)).await.unwrap();

        let enrollment = coordinator.enroll(&created.id, "u1").await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Inscribed);
        assert_eq!(enrollment.enrolled, 1);

        assert!(matches!(
            coordinator.enroll(&created.id, "u1").await,
            Err(WriteError::AlreadyEnrolled)
        ));
        assert!(matches!(
            coordinator.enroll(&created.id, "u2").await,
            Err(WriteError::Full)
        ));
        assert!(matches!(
            coordinator.unenroll(&created.id, "u2").await,
            Err(WriteError::NotEnrolled)
        ));
        assert!(matches!(
            coordinator.enroll("missing", "u1").await,
            Err(WriteError::NotFound)
        ));
        assert!(matches!(
            coordinator.enroll(&created.id, " ").await,
            Err(WriteError::Validation(ValidationError::ParticipantRequired))
        ));

        let enrollment = coordinator.unenroll(&created.id, "u1").await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Uninscribed);
        assert_eq!(enrollment.enrolled, 0);
    }

    #[tokio::test]
    async fn test_enroll_publish_failure_is_not_compensated() {
        let (store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 2)).await.unwrap();
        publisher.set_failing(true);

        let result = coordinator.enroll(&created.id, "u1").await;

        assert!(matches!(result, Err(WriteError::Publish(_))));
        let stored = store.get(&created.id).await.unwrap().unwrap();
        assert!(stored.enrolled.contains("u1"));
    }

    #[tokio::test]
    async fn test_enroll_retry_republishes_after_publish_failure() {
        let (_store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 2)).await.unwrap();
        publisher.set_failing(true);

        let first = coordinator.enroll(&created.id, "u1").await;
        assert!(matches!(first, Err(WriteError::Publish(_))));

        publisher.set_failing(false);
        let before = publisher.events().len();
        let retry = coordinator.enroll(&created.id, "u1").await;

        assert!(matches!(retry, Err(WriteError::AlreadyEnrolled)));
        let events = publisher.events();
        assert_eq!(events.len(), before + 1);
        let last = events.last().unwrap();
        assert_eq!(last.action, EventAction::Update);
        assert_eq!(last.id, created.id);
        assert_eq!(last.snapshot.title, "Yoga");
    }

    #[tokio::test]
    async fn test_unenroll_retry_republishes_after_publish_failure() {
        let (store, publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 2)).await.unwrap();
        coordinator.enroll(&created.id, "u1").await.unwrap();
        publisher.set_failing(true);

        let first = coordinator.unenroll(&created.id, "u1").await;
        assert!(matches!(first, Err(WriteError::Publish(_))));
        let stored = store.get(&created.id).await.unwrap().unwrap();
        assert!(stored.enrolled.is_empty());

        publisher.set_failing(false);
        let before = publisher.events().len();
        let retry = coordinator.unenroll(&created.id, "u1").await;

        assert!(matches!(retry, Err(WriteError::NotEnrolled)));
        let events = publisher.events();
        assert_eq!(events.len(), before + 1);
        assert_eq!(events.last().unwrap().action, EventAction::Update);
        assert_eq!(events.last().unwrap().id, created.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enrolls_respect_capacity() {
        let (store, _publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 5)).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..40 {
            let coordinator = coordinator.clone();
            let id = created.id.clone();
            handles.push(tokio::spawn(async move {
                coordinator.enroll(&id, &format!("user{n}")).await
            }));
        }

        let mut inscribed = 0;
        let mut full = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => inscribed += 1,
                Err(WriteError::Full) => full += 1,
                Err(e) => panic!("unexpected enroll error: {e}"),
            }
        }

        assert_eq!(inscribed, 5);
        assert_eq!(full, 35);
        let stored = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.enrolled_count(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_seat_goes_to_one_participant() {
        let (_store, _publisher, coordinator) = setup();
        let created = coordinator.create(&new_activity("Yoga", 1)).await.unwrap();

        let a = tokio::spawn({
            let coordinator = coordinator.clone();
            let id = created.id.clone();
            async move { coordinator.enroll(&id, "userA").await }
        });
        let b = tokio::spawn({
            let coordinator = coordinator.clone();
            let id = created.id.clone();
            async move { coordinator.enroll(&id, "userB").await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        let inscribed = results
            .iter()
            .filter(|result| {
                matches!(result, Ok(e) if e.status == EnrollmentStatus::Inscribed)
            })
            .count();
        let full = results
            .iter()
            .filter(|result| matches!(result, Err(WriteError::Full)))
            .count();
        assert_eq!((inscribed, full), (1, 1));

        let stored = coordinator.get(&created.id).await.unwrap();
        assert_eq!(stored.enrolled_count(), 1);
        assert_eq!(stored.available_seats(), 0);
    }

    #[tokio::test]
    async fn test_reads() {
        let (_store, _publisher, coordinator) = setup();
        let yoga = coordinator.create(&new_activity("Yoga", 2)).await.unwrap();
        let boxing = coordinator.create(&new_activity("Boxing", 2)).await.unwrap();
        coordinator.enroll(&boxing.id, "u1").await.unwrap();

        assert_eq!(coordinator.list().await.unwrap().len(), 2);

        let many = coordinator
            .get_many(&[yoga.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(many.len(), 1);
        assert_eq!(many[0].id, yoga.id);

        let mine = coordinator.enrollments_of("u1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, boxing.id);

        let stats = coordinator.statistics().await.unwrap();
        assert_eq!(stats.total_activities, 2);
        assert_eq!(stats.total_enrolled, 1);
    }
}
