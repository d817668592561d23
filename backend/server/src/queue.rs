//! # Event Queue
//!
//! Durable change-event queue on a Redis Stream.
//!
//! ## Delivery
//!
//! - Publisher: `XADD <stream> * payload <json>`, one entry per store write
//! - Consumer group per service, one consumer task per process
//! - Entries are acked with `XACK` only after the handler succeeds
//! - Failures are retried in place with a per-message timeout
//! - After `max_attempts` the raw entry is copied to `<stream>:dead` with the
//!   failure reason and then acked
//! - On start the consumer re-reads its own unacked entries first, so a crash
//!   mid-handling redelivers instead of dropping the event
//!
//! Net effect is at-least-once. Handlers must be idempotent.
use std::{cmp::min, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands,
    aio::ConnectionManager,
    streams::{StreamId, StreamReadOptions, StreamReadReply},
};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    database::init_redis,
    error::{QueueError, SyncError},
    models::{ChangeEvent, EVENT_SCHEMA_VERSION},
    utils::with_deadline,
};

pub const PAYLOAD_FIELD: &str = "payload";
pub const REASON_FIELD: &str = "reason";
pub const SOURCE_ID_FIELD: &str = "source_id";
pub const DEAD_LETTER_SUFFIX: &str = ":dead";

const INITIAL_CONNECT_BACKOFF: Duration = Duration::from_millis(500);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(8);
const READ_BLOCK: Duration = Duration::from_secs(2);
const READ_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), QueueError>;
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ChangeEvent) -> Result<(), SyncError>;
}

pub fn encode_event(event: &ChangeEvent) -> Result<String, QueueError> {
    serde_json::to_string(event).map_err(QueueError::Encode)
}

pub fn decode_event(payload: &str) -> Result<ChangeEvent, QueueError> {
    let event: ChangeEvent =
        serde_json::from_str(payload).map_err(|e| QueueError::Decode(e.to_string()))?;

    if event.version != EVENT_SCHEMA_VERSION {
        return Err(QueueError::UnsupportedVersion(event.version));
    }

    if event.id.trim().is_empty() {
        return Err(QueueError::Decode("empty id".to_string()));
    }

    Ok(event)
}

/// Connects with bounded exponential backoff. Exhausting `attempts` fails
/// startup.
pub async fn connect_with_backoff(
    redis_url: &str,
    attempts: u32,
) -> Result<ConnectionManager, QueueError> {
    let attempts = attempts.max(1);
    let mut delay = INITIAL_CONNECT_BACKOFF;
    let mut attempt = 1;

    loop {
        match init_redis(redis_url).await {
            Ok(connection) => {
                info!("Connected to queue after {attempt} attempt(s)");
                return Ok(connection);
            }
            Err(source) if attempt >= attempts => {
                return Err(QueueError::ConnectFailed { attempts, source });
            }
            Err(e) => {
                warn!(
                    "Queue connect attempt {attempt}/{attempts} failed: {e}, retrying in {delay:?}"
                );
                sleep(delay).await;
                delay = min(delay * 2, MAX_CONNECT_BACKOFF);
                attempt += 1;
            }
        }
    }
}

#[derive(Clone)]
pub struct StreamPublisher {
    connection: ConnectionManager,
    stream: String,
    deadline: Duration,
}

impl StreamPublisher {
    pub fn new(connection: ConnectionManager, config: &Config) -> Self {
        Self {
            connection,
            stream: config.event_stream.clone(),
            deadline: config.call_timeout,
        }
    }
}

#[async_trait]
impl EventPublisher for StreamPublisher {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), QueueError> {
        let payload = encode_event(event)?;
        let mut connection = self.connection.clone();

        let entry_id: String = with_deadline(self.deadline, QueueError::Timeout, async {
            Ok::<_, QueueError>(
                connection
                    .xadd(&self.stream, "*", &[(PAYLOAD_FIELD, payload.as_str())])
                    .await?,
            )
        })
        .await?;

        debug!(
            action = %event.action,
            activity_id = %event.id,
            entry_id = %entry_id,
            "Published change event"
        );

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub message_timeout: Duration,
    pub retry_backoff: Duration,
}

impl DeliveryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts,
            message_timeout: config.message_timeout,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    DeadLetter(String),
}

/// Decodes and handles one queue payload under `policy`. Never fails: every
/// outcome is either an ack or a dead-letter.
pub async fn deliver<H>(handler: &H, payload: Option<&str>, policy: &DeliveryPolicy) -> Disposition
where
    H: EventHandler + ?Sized,
{
    let Some(payload) = payload else {
        warn!("Queue entry has no {PAYLOAD_FIELD} field");
        return Disposition::DeadLetter(format!("missing {PAYLOAD_FIELD} field"));
    };

    let event = match decode_event(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejecting queue entry: {e}");
            return Disposition::DeadLetter(e.to_string());
        }
    };

    let attempts = policy.max_attempts.max(1);
    let mut last_failure = String::new();

    for attempt in 1..=attempts {
        match timeout(policy.message_timeout, handler.handle(event.clone())).await {
            Ok(Ok(())) => return Disposition::Ack,
            Ok(Err(e)) => {
                warn!(
                    attempt,
                    action = %event.action,
                    activity_id = %event.id,
                    "Event handling failed: {e}"
                );
                last_failure = e.to_string();
            }
            Err(_) => {
                warn!(
                    attempt,
                    action = %event.action,
                    activity_id = %event.id,
                    "Event handling timed out after {:?}",
                    policy.message_timeout
                );
                last_failure = format!("timed out after {:?}", policy.message_timeout);
            }
        }

        if attempt < attempts {
            sleep(policy.retry_backoff * attempt).await;
        }
    }

    error!(
        action = %event.action,
        activity_id = %event.id,
        "Giving up after {attempts} attempts: {last_failure}"
    );
    Disposition::DeadLetter(last_failure)
}

pub struct StreamConsumer {
    connection: ConnectionManager,
    stream: String,
    dead_letter: String,
    group: String,
    consumer: String,
    policy: DeliveryPolicy,
    deadline: Duration,
}

impl StreamConsumer {
    pub fn new(connection: ConnectionManager, config: &Config) -> Self {
        Self {
            connection,
            stream: config.event_stream.clone(),
            dead_letter: format!("{}{DEAD_LETTER_SUFFIX}", config.event_stream),
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            policy: DeliveryPolicy::from_config(config),
            deadline: config.call_timeout,
        }
    }

    /// Creates the consumer group from the start of the stream, so events
    /// published before the first consumer came up are still processed.
    pub async fn ensure_group(&mut self) -> Result<(), QueueError> {
        let result: Result<(), redis::RedisError> = self
            .connection
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;

        match result {
            Ok(()) => {
                info!("Created consumer group {} on {}", self.group, self.stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replays this consumer's pending entries, then follows the stream.
    /// Only a failure to create the group ends it, read errors are retried.
    pub async fn run<H>(mut self, handler: &H) -> Result<(), QueueError>
    where
        H: EventHandler + ?Sized,
    {
        self.ensure_group().await?;
        info!("Consuming {} as {}/{}", self.stream, self.group, self.consumer);

        let mut cursor = "0".to_string();
        loop {
            let entries = self.read_retrying(&cursor, None).await;
            let Some(last) = entries.last() else {
                break;
            };
            cursor = last.id.clone();

            info!("Redelivering {} unacked entries", entries.len());
            for entry in entries {
                self.process(handler, &entry).await;
            }
        }

        loop {
            for entry in self.read_retrying(">", Some(READ_BLOCK)).await {
                self.process(handler, &entry).await;
            }
        }
    }

    async fn read_retrying(&mut self, id: &str, block: Option<Duration>) -> Vec<StreamId> {
        loop {
            match self.read(id, block).await {
                Ok(entries) => return entries,
                Err(e) => {
                    warn!("Error reading from {}: {e}", self.stream);
                    sleep(READ_ERROR_PAUSE).await;
                }
            }
        }
    }

    async fn read(
        &mut self,
        id: &str,
        block: Option<Duration>,
    ) -> Result<Vec<StreamId>, QueueError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(16);

        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = self
            .connection
            .xread_options(&[&self.stream], &[id], &options)
            .await?;

        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    async fn process<H>(&mut self, handler: &H, entry: &StreamId)
    where
        H: EventHandler + ?Sized,
    {
        let payload: Option<String> = entry.get(PAYLOAD_FIELD);
        let disposition = deliver(handler, payload.as_deref(), &self.policy).await;

        if let Err(e) = self.settle(entry, payload.as_deref(), &disposition).await {
            // Left pending; picked up again on the next start.
            warn!("Failed to settle entry {}: {e}", entry.id);
        }
    }

    async fn settle(
        &mut self,
        entry: &StreamId,
        payload: Option<&str>,
        disposition: &Disposition,
    ) -> Result<(), QueueError> {
        let mut connection = self.connection.clone();

        with_deadline(self.deadline, QueueError::Timeout, async {
            if let Disposition::DeadLetter(reason) = disposition {
                let _: String = connection
                    .xadd(
                        &self.dead_letter,
                        "*",
                        &[
                            (PAYLOAD_FIELD, payload.unwrap_or_default()),
                            (REASON_FIELD, reason.as_str()),
                            (SOURCE_ID_FIELD, entry.id.as_str()),
                        ],
                    )
                    .await?;
                warn!("Dead-lettered entry {} to {}", entry.id, self.dead_letter);
            }

            let _: i64 = connection
                .xack(&self.stream, &self.group, &[&entry.id])
                .await?;
            Ok::<_, QueueError>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use redis::streams::{StreamPendingReply, StreamRangeReply};

    use super::*;
    use crate::{
        database::test_redis, error::SearchError, models::EventAction, utils::new_activity_id,
    };

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        async fn handle(&self, event: ChangeEvent) -> Result<(), SyncError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            if call < self.failures {
                return Err(SyncError::Index {
                    id: event.id,
                    source: SearchError::Unavailable,
                });
            }

            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl EventHandler for Stuck {
        async fn handle(&self, _event: ChangeEvent) -> Result<(), SyncError> {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn policy() -> DeliveryPolicy {
        DeliveryPolicy {
            max_attempts: 3,
            message_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(10),
        }
    }

    fn payload() -> String {
        encode_event(&ChangeEvent::deleted("a1")).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_acks() {
        let handler = Flaky::new(2);

        let disposition = deliver(&handler, Some(&payload()), &policy()).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letters_after_max_attempts() {
        let handler = Flaky::new(u32::MAX);

        let disposition = deliver(&handler, Some(&payload()), &policy()).await;

        assert!(matches!(disposition, Disposition::DeadLetter(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let disposition = deliver(&Stuck, Some(&payload()), &policy()).await;

        match disposition {
            Disposition::DeadLetter(reason) => assert!(reason.contains("timed out")),
            Disposition::Ack => panic!("stuck handler must not be acked"),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_skips_handler() {
        let handler = Flaky::new(0);

        let disposition = deliver(&handler, Some("{not json"), &policy()).await;
        assert!(matches!(disposition, Disposition::DeadLetter(_)));

        let disposition = deliver(&handler, None, &policy()).await;
        assert!(matches!(disposition, Disposition::DeadLetter(_)));

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decode_checks_version() {
        let result = decode_event(r#"{"version":2,"action":"create","id":"a1"}"#);
        assert!(matches!(result, Err(QueueError::UnsupportedVersion(2))));

        let result = decode_event(r#"{"action":"create","id":"a1"}"#);
        assert!(matches!(result, Err(QueueError::Decode(_))));

        let event = decode_event(r#"{"version":1,"action":"create","id":"a1","title":"Yoga"}"#)
            .unwrap();
        assert_eq!(event.action, EventAction::Create);
        assert_eq!(event.snapshot.title, "Yoga");
    }

    #[test]
    fn test_decode_rejects_blank_id() {
        let result = decode_event(r#"{"version":1,"action":"delete","id":"  "}"#);
        assert!(matches!(result, Err(QueueError::Decode(_))));
    }

    fn redis_config(stream: &str) -> Config {
        let stream = stream.to_string();
        Config::from_source(move |key| match key {
            "EVENT_STREAM" => Some(stream.clone()),
            "MAX_DELIVERY_ATTEMPTS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn test_redis_consumer_replays_acks_and_dead_letters() {
        let stream = format!("test-events-{}", new_activity_id());
        let dead_letter = format!("{stream}{DEAD_LETTER_SUFFIX}");
        let config = redis_config(&stream);
        let mut connection = test_redis().await;
        let publisher = StreamPublisher::new(connection.clone(), &config);

        // Delivered to this consumer before a crash and never acked.
        let mut consumer = StreamConsumer::new(connection.clone(), &config);
        consumer.ensure_group().await.unwrap();
        publisher.publish(&ChangeEvent::deleted("a1")).await.unwrap();
        assert_eq!(consumer.read(">", None).await.unwrap().len(), 1);

        publisher.publish(&ChangeEvent::deleted("a2")).await.unwrap();
        let _: String = connection
            .xadd(&stream, "*", &[(PAYLOAD_FIELD, "{not json")])
            .await
            .unwrap();

        let handler = Arc::new(Flaky::new(0));
        let task = tokio::spawn({
            let handler = handler.clone();
            async move { consumer.run(handler.as_ref()).await }
        });

        let settled = timeout(Duration::from_secs(10), async {
            loop {
                let pending: StreamPendingReply = connection
                    .xpending(&stream, &config.consumer_group)
                    .await
                    .unwrap();
                let dead: usize = connection.xlen(&dead_letter).await.unwrap();

                if handler.calls.load(Ordering::SeqCst) == 2 && pending.count() == 0 && dead == 1 {
                    break;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        task.abort();
        assert!(settled.is_ok(), "consumer did not settle every entry");

        let dead: StreamRangeReply = connection.xrange_all(&dead_letter).await.unwrap();
        let entry = &dead.ids[0];
        let payload: Option<String> = entry.get(PAYLOAD_FIELD);
        let reason: Option<String> = entry.get(REASON_FIELD);
        assert_eq!(payload.as_deref(), Some("{not json"));
        assert!(reason.is_some_and(|reason| !reason.is_empty()));

        let _: i64 = connection.del(&[&stream, &dead_letter]).await.unwrap();
    }
}
