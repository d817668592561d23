use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("title is required and cannot be empty")]
    TitleRequired,

    #[error("instructor is required and cannot be empty")]
    InstructorRequired,

    #[error("start_time and end_time are required and cannot be empty")]
    TimeRequired,

    #[error("{0} is not a valid HH:MM time")]
    InvalidTime(String),

    #[error("end_time must be after start_time")]
    EndBeforeStart,

    #[error("capacity cannot be negative")]
    CapacityNegative,

    #[error("day is required and cannot be empty")]
    DayRequired,

    #[error("{0} is not a valid day of the week")]
    InvalidDay(String),

    #[error("no fields to update")]
    NoFieldsToUpdate,

    #[error("capacity {capacity} cannot be less than the {enrolled} enrolled participants")]
    CapacityBelowEnrollment { capacity: u32, enrolled: u32 },

    #[error("participant is required and cannot be empty")]
    ParticipantRequired,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Record store call timed out")]
    Timeout,

    #[error("Record store unavailable")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Failed to encode event: {0}")]
    Encode(serde_json::Error),

    #[error("Malformed event: {0}")]
    Decode(String),

    #[error("Unsupported event schema version {0}")]
    UnsupportedVersion(u32),

    #[error("Queue call timed out")]
    Timeout,

    #[error("Queue unreachable after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        source: redis::RedisError,
    },

    #[error("Queue unavailable")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Search engine returned status {0}")]
    Status(u16),

    #[error("Search engine rejected the update with status {0}")]
    Rejected(i64),

    #[error("Malformed search response: {0}")]
    Malformed(String),

    #[error("Search index unavailable")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache value could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Cache call timed out")]
    Timeout,

    #[error("Cache unavailable")]
    Unavailable,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned status {0}")]
    Status(u16),

    #[error("Upstream store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Error fetching activity {id}: {source}")]
    Fetch { id: String, source: FetchError },

    #[error("Error updating search index for {id}: {source}")]
    Index { id: String, source: SearchError },
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Activity not found")]
    NotFound,

    #[error("Activity is full")]
    Full,

    #[error("Participant already enrolled")]
    AlreadyEnrolled,

    #[error("Participant not enrolled in activity")]
    NotEnrolled,

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to publish event: {0}")]
    Publish(QueueError),

    #[error("Failed to publish {action} event for {id}, change rolled back: {source}")]
    RolledBack {
        action: &'static str,
        id: String,
        source: QueueError,
    },

    #[error(
        "Failed to publish {action} event for {id} ({publish}) and rollback failed ({rollback})"
    )]
    Inconsistent {
        action: &'static str,
        id: String,
        publish: QueueError,
        rollback: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("{0}")]
    Write(#[from] WriteError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::Write(error) => match error {
                WriteError::Validation(_) => StatusCode::BAD_REQUEST,
                WriteError::NotFound => StatusCode::NOT_FOUND,
                WriteError::Full | WriteError::AlreadyEnrolled | WriteError::NotEnrolled => {
                    StatusCode::CONFLICT
                }
                WriteError::Store(_) | WriteError::Publish(_) | WriteError::RolledBack { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                WriteError::Inconsistent { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Search(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, self.to_string()).into_response()
    }
}
