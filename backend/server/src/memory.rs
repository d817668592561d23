//! In-process implementations of every storage and transport seam, with
//! switchable failures. Compiled for tests and behind the `testing` feature.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    database::{EnrollOutcome, FieldsOutcome, RecordStore},
    error::{FetchError, QueueError, SearchError, StoreError},
    models::{
        Activity, ActivityFields, ChangeEvent, NewActivity, Page, SearchDocument, SearchFilters,
        Weekday,
    },
    queue::EventPublisher,
    synchronizer::ActivitySource,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn new_activity(title: &str, capacity: i64) -> NewActivity {
    NewActivity {
        title: title.to_string(),
        description: format!("{title} class"),
        instructor: "Ana".to_string(),
        day: "Monday".to_string(),
        start_time: "09:00".to_string(),
        end_time: "10:00".to_string(),
        capacity,
        photo_url: String::new(),
    }
}

pub fn activity(id: &str, title: &str, capacity: u32) -> Activity {
    Activity {
        id: id.to_string(),
        fields: ActivityFields {
            title: title.to_string(),
            description: format!("{title} class"),
            instructor: "Ana".to_string(),
            day: Weekday::Monday,
            start_time: "09:00".to_string(),
            end_time: "10:00".to_string(),
            capacity,
            photo_url: String::new(),
        },
        enrolled: BTreeSet::new(),
        created_at: Utc::now(),
    }
}

pub fn document(id: &str, title: &str, day: Weekday) -> SearchDocument {
    let mut activity = activity(id, title, 10);
    activity.fields.day = day;
    activity.to_document()
}

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<String, Activity>>,
    fail_insert: AtomicBool,
    fail_update: AtomicBool,
    fail_remove: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryRecordStore {
    pub fn fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, activity: &Activity) -> Result<(), StoreError> {
        Self::check(&self.fail_insert)?;
        lock(&self.records).insert(activity.id.clone(), activity.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Activity>, StoreError> {
        Self::check(&self.fail_reads)?;
        Ok(lock(&self.records).get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Activity>, StoreError> {
        Self::check(&self.fail_reads)?;
        Ok(lock(&self.records).values().cloned().collect())
    }

    async fn update_fields(
        &self,
        id: &str,
        fields: &ActivityFields,
    ) -> Result<FieldsOutcome, StoreError> {
        Self::check(&self.fail_update)?;
        let mut records = lock(&self.records);

        let Some(activity) = records.get_mut(id) else {
            return Ok(FieldsOutcome::NotFound);
        };

        let enrolled = activity.enrolled_count();
        if fields.capacity < enrolled {
            return Ok(FieldsOutcome::BelowEnrollment { enrolled });
        }

        activity.fields = fields.clone();
        Ok(FieldsOutcome::Updated)
    }

    async fn remove(&self, id: &str) -> Result<Option<Activity>, StoreError> {
        Self::check(&self.fail_remove)?;
        Ok(lock(&self.records).remove(id))
    }

    async fn enroll(&self, id: &str, participant: &str) -> Result<EnrollOutcome, StoreError> {
        let mut records = lock(&self.records);

        let Some(activity) = records.get_mut(id) else {
            return Ok(EnrollOutcome::NotFound);
        };
        if activity.enrolled.contains(participant) {
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }
        if activity.is_full() {
            return Ok(EnrollOutcome::Full);
        }

        activity.enrolled.insert(participant.to_string());
        Ok(EnrollOutcome::Done {
            enrolled: activity.enrolled_count(),
        })
    }

    async fn unenroll(&self, id: &str, participant: &str) -> Result<EnrollOutcome, StoreError> {
        let mut records = lock(&self.records);

        let Some(activity) = records.get_mut(id) else {
            return Ok(EnrollOutcome::NotFound);
        };
        if !activity.enrolled.remove(participant) {
            return Ok(EnrollOutcome::NotEnrolled);
        }

        Ok(EnrollOutcome::Done {
            enrolled: activity.enrolled_count(),
        })
    }

    async fn enrollments_of(&self, participant: &str) -> Result<Vec<String>, StoreError> {
        Self::check(&self.fail_reads)?;

        Ok(lock(&self.records)
            .values()
            .filter(|activity| activity.enrolled.contains(participant))
            .map(|activity| activity.id.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryPublisher {
    events: Mutex<Vec<ChangeEvent>>,
    failing: AtomicBool,
}

impl MemoryPublisher {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable);
        }

        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Emulates the engine's exact id match and case-insensitive substring
/// clauses. Counts every `list` call and keeps the last filters it saw.
#[derive(Default)]
pub struct MemoryIndex {
    documents: Mutex<BTreeMap<String, SearchDocument>>,
    queries: AtomicUsize,
    last_filters: Mutex<Option<SearchFilters>>,
    failing: AtomicBool,
}

impl MemoryIndex {
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn last_filters(&self) -> Option<SearchFilters> {
        lock(&self.last_filters).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn document(&self, id: &str) -> Option<SearchDocument> {
        lock(&self.documents).get(id).cloned()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SearchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SearchError::Unavailable);
        }
        Ok(())
    }
}

fn contains(haystack: &str, needle: &str) -> bool {
    needle.is_empty() || haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl crate::search::SearchIndex for MemoryIndex {
    async fn list(&self, filters: &SearchFilters) -> Result<Page, SearchError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_filters) = Some(filters.clone());
        self.check()?;

        let id = filters.id.trim();
        let matches: Vec<SearchDocument> = lock(&self.documents)
            .values()
            .filter(|doc| {
                if !id.is_empty() {
                    return doc.id == id;
                }
                contains(&doc.title, filters.title.trim())
                    && contains(&doc.description, filters.description.trim())
                    && contains(doc.day.as_str(), filters.day.trim())
            })
            .cloned()
            .collect();

        let results: Vec<SearchDocument> = matches
            .iter()
            .skip(filters.start() as usize)
            .take(filters.count() as usize)
            .cloned()
            .collect();

        Ok(Page {
            page: filters.page(),
            count: results.len() as u32,
            total: matches.len() as u64,
            results,
        })
    }

    async fn index(&self, document: &SearchDocument) -> Result<(), SearchError> {
        self.check()?;
        lock(&self.documents).insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), SearchError> {
        self.check()?;
        lock(&self.documents).remove(id);
        Ok(())
    }
}

/// Reads canonical state straight from a record store instead of over HTTP.
pub struct StoreSource {
    store: Arc<dyn RecordStore>,
}

impl StoreSource {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ActivitySource for StoreSource {
    async fn fetch_many(&self, ids: &[String]) -> Result<Vec<SearchDocument>, FetchError> {
        let activities = self.store.get_many(ids).await?;
        Ok(activities.iter().map(Activity::to_document).collect())
    }
}
