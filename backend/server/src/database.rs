//! # Redis
//!
//! Record Store for activities. Single source of truth for existence,
//! capacity and enrollment.
//!
//! ## Requirements
//!
//! - O(1) point lookups by activity id
//! - `|enrolled| <= capacity` for every committed read, even under concurrent
//!   enroll calls racing for the last seat
//! - Exact pre-image on delete so a failed publish can be rolled back
//!
//! ## Layout
//!
//! - `activity:{id}`: hash with `fields` (JSON), `capacity` (int), `created_at`
//! - `activity:{id}:enrolled`: set of participant ids
//! - `participant:{id}:activities`: reverse index for enrollment lookups
//! - `activities`: set of every activity id
//!
//! ## Atomicity
//!
//! Conditional writes run as Lua scripts. Redis executes a script as one
//! operation, so the capacity/membership check and the set mutation cannot
//! interleave with another writer. No coordinator-side locking.
use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

use crate::{
    error::StoreError,
    models::{Activity, ActivityFields},
    utils::with_deadline,
};

pub const ACTIVITY_IDS_KEY: &str = "activities";

const ENROLL_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
if redis.call('SISMEMBER', KEYS[2], ARGV[2]) == 1 then return -2 end
local capacity = tonumber(redis.call('HGET', KEYS[1], 'capacity'))
if redis.call('SCARD', KEYS[2]) >= capacity then return -3 end
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[1])
return redis.call('SCARD', KEYS[2])
"#;

const UNENROLL_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
if redis.call('SREM', KEYS[2], ARGV[2]) == 0 then return -2 end
redis.call('SREM', KEYS[3], ARGV[1])
return redis.call('SCARD', KEYS[2])
"#;

const UPDATE_FIELDS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {-1, 0} end
local enrolled = redis.call('SCARD', KEYS[2])
if enrolled > tonumber(ARGV[2]) then return {-2, enrolled} end
redis.call('HSET', KEYS[1], 'fields', ARGV[1], 'capacity', ARGV[2])
return {0, enrolled}
"#;

const REMOVE_SCRIPT: &str = r#"
local fields = redis.call('HGET', KEYS[1], 'fields')
if not fields then return false end
local created_at = redis.call('HGET', KEYS[1], 'created_at')
local members = redis.call('SMEMBERS', KEYS[2])
for _, participant in ipairs(members) do
    redis.call('SREM', ARGV[2] .. participant .. ':activities', ARGV[1])
end
redis.call('DEL', KEYS[1], KEYS[2])
redis.call('SREM', KEYS[3], ARGV[1])
local out = {fields, created_at}
for _, participant in ipairs(members) do
    out[#out + 1] = participant
end
return out
"#;

const PARTICIPANT_PREFIX: &str = "participant:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Done { enrolled: u32 },
    NotFound,
    Full,
    AlreadyEnrolled,
    NotEnrolled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldsOutcome {
    Updated,
    NotFound,
    BelowEnrollment { enrolled: u32 },
}

/// Canonical activity storage. Implementations must be safe to share across
/// request tasks and must never hold an in-process lock across an `.await`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Writes the whole record, enrollments included. Used by create and by
    /// the delete rollback.
    async fn insert(&self, activity: &Activity) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Activity>, StoreError>;

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Activity>, StoreError> {
        let mut activities = Vec::with_capacity(ids.len());

        for id in ids {
            if let Some(activity) = self.get(id).await? {
                activities.push(activity);
            }
        }

        Ok(activities)
    }

    async fn list(&self) -> Result<Vec<Activity>, StoreError>;

    /// Replaces descriptive fields if the new capacity still covers the
    /// current enrollment, checked atomically with the write.
    async fn update_fields(
        &self,
        id: &str,
        fields: &ActivityFields,
    ) -> Result<FieldsOutcome, StoreError>;

    /// Deletes the record and returns exactly what was removed.
    async fn remove(&self, id: &str) -> Result<Option<Activity>, StoreError>;

    async fn enroll(&self, id: &str, participant: &str) -> Result<EnrollOutcome, StoreError>;

    async fn unenroll(&self, id: &str, participant: &str) -> Result<EnrollOutcome, StoreError>;

    async fn enrollments_of(&self, participant: &str) -> Result<Vec<String>, StoreError>;
}

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(500));

    let client = Client::open(redis_url)?;

    client.get_connection_manager_with_config(config).await
}

fn record_key(id: &str) -> String {
    format!("activity:{id}")
}

fn enrolled_key(id: &str) -> String {
    format!("activity:{id}:enrolled")
}

fn participant_key(participant: &str) -> String {
    format!("{PARTICIPANT_PREFIX}{participant}:activities")
}

#[derive(Clone)]
pub struct RedisRecordStore {
    connection: ConnectionManager,
    deadline: Duration,
}

impl RedisRecordStore {
    pub fn new(connection: ConnectionManager, deadline: Duration) -> Self {
        Self {
            connection,
            deadline,
        }
    }

    fn decode(
        id: &str,
        fields: &str,
        created_at: &str,
        enrolled: BTreeSet<String>,
    ) -> Result<Activity, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: id.to_string(),
            reason,
        };

        let fields: ActivityFields =
            serde_json::from_str(fields).map_err(|e| corrupt(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(created_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);

        Ok(Activity {
            id: id.to_string(),
            fields,
            enrolled,
            created_at,
        })
    }

    fn encode_fields(id: &str, fields: &ActivityFields) -> Result<String, StoreError> {
        serde_json::to_string(fields).map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn run_enroll_script(
        &self,
        script: &str,
        id: &str,
        participant: &str,
        missing_member: EnrollOutcome,
    ) -> Result<EnrollOutcome, StoreError> {
        let mut connection = self.connection.clone();

        let code: i64 = with_deadline(self.deadline, StoreError::Timeout, async {
            Ok::<_, StoreError>(
                Script::new(script)
                    .key(record_key(id))
                    .key(enrolled_key(id))
                    .key(participant_key(participant))
                    .arg(id)
                    .arg(participant)
                    .invoke_async(&mut connection)
                    .await?,
            )
        })
        .await?;

        Ok(match code {
            -1 => EnrollOutcome::NotFound,
            -2 => missing_member,
            -3 => EnrollOutcome::Full,
            enrolled => EnrollOutcome::Done {
                enrolled: enrolled as u32,
            },
        })
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn insert(&self, activity: &Activity) -> Result<(), StoreError> {
        let fields = Self::encode_fields(&activity.id, &activity.fields)?;
        let mut connection = self.connection.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(
                record_key(&activity.id),
                &[
                    ("fields", fields),
                    ("capacity", activity.fields.capacity.to_string()),
                    ("created_at", activity.created_at.to_rfc3339()),
                ],
            )
            .ignore()
            .del(enrolled_key(&activity.id))
            .ignore()
            .sadd(ACTIVITY_IDS_KEY, &activity.id)
            .ignore();

        for participant in &activity.enrolled {
            pipe.sadd(enrolled_key(&activity.id), participant)
                .ignore()
                .sadd(participant_key(participant), &activity.id)
                .ignore();
        }

        with_deadline(self.deadline, StoreError::Timeout, async {
            let () = pipe.query_async(&mut connection).await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Activity>, StoreError> {
        let mut connection = self.connection.clone();

        let (fields, created_at, enrolled): (Option<String>, Option<String>, BTreeSet<String>) =
            with_deadline(self.deadline, StoreError::Timeout, async {
                Ok::<_, StoreError>(
                    redis::pipe()
                        .hget(record_key(id), "fields")
                        .hget(record_key(id), "created_at")
                        .smembers(enrolled_key(id))
                        .query_async(&mut connection)
                        .await?,
                )
            })
            .await?;

        match (fields, created_at) {
            (Some(fields), Some(created_at)) => {
                Self::decode(id, &fields, &created_at, enrolled).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Activity>, StoreError> {
        let mut connection = self.connection.clone();

        let ids: BTreeSet<String> = with_deadline(self.deadline, StoreError::Timeout, async {
            Ok::<_, StoreError>(connection.smembers(ACTIVITY_IDS_KEY).await?)
        })
        .await?;

        let ids: Vec<String> = ids.into_iter().collect();
        self.get_many(&ids).await
    }

    async fn update_fields(
        &self,
        id: &str,
        fields: &ActivityFields,
    ) -> Result<FieldsOutcome, StoreError> {
        let encoded = Self::encode_fields(id, fields)?;
        let mut connection = self.connection.clone();

        let (code, enrolled): (i64, i64) = with_deadline(self.deadline, StoreError::Timeout, async {
            Ok::<_, StoreError>(
                Script::new(UPDATE_FIELDS_SCRIPT)
                    .key(record_key(id))
                    .key(enrolled_key(id))
                    .arg(encoded)
                    .arg(fields.capacity)
                    .invoke_async(&mut connection)
                    .await?,
            )
        })
        .await?;

        Ok(match code {
            -1 => FieldsOutcome::NotFound,
            -2 => FieldsOutcome::BelowEnrollment {
                enrolled: enrolled as u32,
            },
            _ => FieldsOutcome::Updated,
        })
    }

    async fn remove(&self, id: &str) -> Result<Option<Activity>, StoreError> {
        let mut connection = self.connection.clone();

        let removed: Option<Vec<String>> = with_deadline(self.deadline, StoreError::Timeout, async {
            Ok::<_, StoreError>(
                Script::new(REMOVE_SCRIPT)
                    .key(record_key(id))
                    .key(enrolled_key(id))
                    .key(ACTIVITY_IDS_KEY)
                    .arg(id)
                    .arg(PARTICIPANT_PREFIX)
                    .invoke_async(&mut connection)
                    .await?,
            )
        })
        .await?;

        let Some(mut removed) = removed else {
            return Ok(None);
        };

        if removed.len() < 2 {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                reason: "incomplete record".to_string(),
            });
        }

        let enrolled: BTreeSet<String> = removed.split_off(2).into_iter().collect();
        Self::decode(id, &removed[0], &removed[1], enrolled).map(Some)
    }

    async fn enroll(&self, id: &str, participant: &str) -> Result<EnrollOutcome, StoreError> {
        self.run_enroll_script(
            ENROLL_SCRIPT,
            id,
            participant,
            EnrollOutcome::AlreadyEnrolled,
        )
        .await
    }

    async fn unenroll(&self, id: &str, participant: &str) -> Result<EnrollOutcome, StoreError> {
        self.run_enroll_script(UNENROLL_SCRIPT, id, participant, EnrollOutcome::NotEnrolled)
            .await
    }

    async fn enrollments_of(&self, participant: &str) -> Result<Vec<String>, StoreError> {
        let mut connection = self.connection.clone();

        let ids: BTreeSet<String> = with_deadline(self.deadline, StoreError::Timeout, async {
            Ok::<_, StoreError>(connection.smembers(participant_key(participant)).await?)
        })
        .await?;

        Ok(ids.into_iter().collect())
    }
}

/// Live connection for the `#[ignore]`d tests, run with `cargo test -- --ignored`.
#[cfg(test)]
pub(crate) async fn test_redis() -> ConnectionManager {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    init_redis(&url).await.expect("a Redis server at REDIS_URL")
}
