//! # Models
//!
//! Records, wire payloads and search projections shared by the catalog and
//! search services.
//!
//! ## Activity
//! - Canonical record, owned by the Record Store
//! - `|enrolled| <= capacity` holds for every committed read
//! - `id` is a UUID v4 string, assigned on create and stable across stores
//!
//! ## Change Event
//! - One per successful Record Store write
//! - Delivered at-least-once, so consumers must tolerate duplicates
//! - Versioned, unknown fields ignored, missing required fields rejected
//!
//! ## Search Document
//! - Denormalized projection of an activity, written only by the synchronizer
use std::{collections::BTreeSet, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
            Weekday::Saturday => "Saturday",
            Weekday::Sunday => "Sunday",
        }
    }
}

impl fmt::Display for Weekday {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weekday {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();

        Weekday::ALL
            .into_iter()
            .find(|day| day.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("unknown day of week: {trimmed}"))
    }
}

impl TryFrom<String> for Weekday {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Weekday> for String {
    fn from(day: Weekday) -> Self {
        day.as_str().to_string()
    }
}

/// Validated descriptive fields of an activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFields {
    pub title: String,
    pub description: String,
    pub instructor: String,
    pub day: Weekday,
    pub start_time: String,
    pub end_time: String,
    pub capacity: u32,
    #[serde(default)]
    pub photo_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(flatten)]
    pub fields: ActivityFields,
    #[serde(default)]
    pub enrolled: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn enrolled_count(&self) -> u32 {
        self.enrolled.len() as u32
    }

    pub fn available_seats(&self) -> u32 {
        self.fields.capacity.saturating_sub(self.enrolled_count())
    }

    pub fn is_full(&self) -> bool {
        self.enrolled_count() >= self.fields.capacity
    }

    pub fn to_document(&self) -> SearchDocument {
        SearchDocument {
            id: self.id.clone(),
            title: self.fields.title.clone(),
            description: self.fields.description.clone(),
            instructor: self.fields.instructor.clone(),
            day: self.fields.day,
            start_time: self.fields.start_time.clone(),
            end_time: self.fields.end_time.clone(),
            capacity: self.fields.capacity,
            available_seats: self.available_seats(),
            photo_url: self.fields.photo_url.clone(),
        }
    }

    pub fn snapshot(&self) -> EventSnapshot {
        EventSnapshot {
            title: self.fields.title.clone(),
            description: self.fields.description.clone(),
            day: self.fields.day.to_string(),
        }
    }
}

/// Create payload as sent by clients, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewActivity {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub instructor: String,
    #[serde(default)]
    pub day: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub capacity: i64,
    #[serde(default)]
    pub photo_url: String,
}

/// Partial update. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub instructor: Option<String>,
    pub day: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub capacity: Option<i64>,
    pub photo_url: Option<String>,
}

impl ActivityPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.instructor.is_none()
            && self.day.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.capacity.is_none()
            && self.photo_url.is_none()
    }

    /// Overlays the patch on stored fields, yielding an unvalidated payload.
    pub fn apply_to(&self, current: &ActivityFields) -> NewActivity {
        NewActivity {
            title: self.title.clone().unwrap_or_else(|| current.title.clone()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| current.description.clone()),
            instructor: self
                .instructor
                .clone()
                .unwrap_or_else(|| current.instructor.clone()),
            day: self.day.clone().unwrap_or_else(|| current.day.to_string()),
            start_time: self
                .start_time
                .clone()
                .unwrap_or_else(|| current.start_time.clone()),
            end_time: self
                .end_time
                .clone()
                .unwrap_or_else(|| current.end_time.clone()),
            capacity: self.capacity.unwrap_or(current.capacity as i64),
            photo_url: self
                .photo_url
                .clone()
                .unwrap_or_else(|| current.photo_url.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Inscribed,
    Uninscribed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub status: EnrollmentStatus,
    pub activity_id: String,
    pub participant: String,
    pub enrolled: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub id: String,
    pub title: String,
    pub description: String,
    pub instructor: String,
    pub day: Weekday,
    pub start_time: String,
    pub end_time: String,
    pub capacity: u32,
    pub available_seats: u32,
    #[serde(default)]
    pub photo_url: String,
}

/// Response body of `GET /activities/many`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManyActivities {
    pub activities: Vec<SearchDocument>,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub day: String,
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub count: i64,
}

impl SearchFilters {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: id.to_string(),
            page: 1,
            count: 1,
            ..Self::default()
        }
    }

    pub fn page(&self) -> u32 {
        if self.page < 1 {
            1
        } else {
            self.page.min(u32::MAX as i64) as u32
        }
    }

    pub fn count(&self) -> u32 {
        if self.count < 1 {
            DEFAULT_PAGE_SIZE
        } else {
            self.count.min(MAX_PAGE_SIZE as i64) as u32
        }
    }

    /// Offset of the first row, `(page - 1) * count`.
    pub fn start(&self) -> u64 {
        (self.page() as u64 - 1) * self.count() as u64
    }

    /// Trimmed copy with pagination resolved. This is what the engine sees,
    /// casing is left as the caller sent it.
    pub fn normalized(&self) -> Self {
        Self {
            id: self.id.trim().to_string(),
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            day: self.day.trim().to_string(),
            page: self.page() as i64,
            count: self.count() as i64,
        }
    }

    /// Normalized and lowercased, so equivalent requests share one cache key.
    pub fn canonical(&self) -> Self {
        let normalized = self.normalized();

        Self {
            title: normalized.title.to_lowercase(),
            description: normalized.description.to_lowercase(),
            day: normalized.day.to_lowercase(),
            ..normalized
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: u32,
    pub count: u32,
    pub total: u64,
    pub results: Vec<SearchDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Update,
    Delete,
    Other(String),
}

impl EventAction {
    pub fn as_str(&self) -> &str {
        match self {
            EventAction::Create => "create",
            EventAction::Update => "update",
            EventAction::Delete => "delete",
            EventAction::Other(action) => action,
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create" => EventAction::Create,
            "update" => EventAction::Update,
            "delete" => EventAction::Delete,
            _ => EventAction::Other(value),
        }
    }
}

impl From<EventAction> for String {
    fn from(action: EventAction) -> Self {
        action.as_str().to_string()
    }
}

impl Serialize for EventAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(EventAction::from)
    }
}

/// Searchable fields denormalized into an event. Informational only, the
/// synchronizer always re-fetches canonical state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSnapshot {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub day: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub version: u32,
    pub action: EventAction,
    pub id: String,
    #[serde(flatten)]
    pub snapshot: EventSnapshot,
}

impl ChangeEvent {
    pub fn new(action: EventAction, id: &str, snapshot: EventSnapshot) -> Self {
        Self {
            version: EVENT_SCHEMA_VERSION,
            action,
            id: id.to_string(),
            snapshot,
        }
    }

    pub fn created(activity: &Activity) -> Self {
        Self::new(EventAction::Create, &activity.id, activity.snapshot())
    }

    pub fn updated(activity: &Activity) -> Self {
        Self::new(EventAction::Update, &activity.id, activity.snapshot())
    }

    pub fn deleted(id: &str) -> Self {
        Self::new(EventAction::Delete, id, EventSnapshot::default())
    }
}
