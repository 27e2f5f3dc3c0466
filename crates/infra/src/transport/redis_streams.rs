//! Redis Streams-backed job transport (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams to provide:
//! - **Durable submission**: `XADD` to the job stream
//! - **Competing consumers**: one consumer group shared by all workers (`XREADGROUP`)
//! - **Acknowledgement**: `XACK` on success
//! - **Delayed retries**: nacked messages wait in a sorted set scored by their
//!   due time, then move back to the stream
//! - **Dead-letter stream**: messages that exhausted the retry policy
//! - **Crash recovery**: entries left pending by a dead consumer longer than
//!   the visibility timeout are taken over with `XCLAIM`; entries this
//!   transport is still working on are never claimed back
//!
//! ## Keys
//!
//! - **Stream**: `taskhub:jobs` (configurable)
//! - **Delayed retries**: `<stream>:delayed` (sorted set)
//! - **Dead-letter stream**: `<stream>:dlq`
//!
//! Each stream entry carries two fields: `attempt` (1-based delivery number at
//! the time it was added) and `payload` (the JSON-encoded `JobMessage`).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Value;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use taskhub_core::JobMessage;

use super::{Delivery, DeliverySource, JobTransport, NackOutcome, TransportError};
use crate::jobs::types::{DeadLetterEntry, RetryPolicy};

/// Default visibility timeout before a pending entry may be claimed by another consumer.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of due retries moved back to the stream per `receive`.
const DEFAULT_PROMOTE_BATCH: usize = 100;

/// Atomically moves due members of the delayed set back onto the stream.
///
/// KEYS[1] delayed set, KEYS[2] stream, KEYS[3] dead-letter stream
/// ARGV[1] now (ms), ARGV[2] batch size
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local moved = 0
for _, member in ipairs(due) do
  if redis.call('ZREM', KEYS[1], member) == 1 then
    local attempt, nonce, payload = string.match(member, '^(%d+)|([^|]*)|(.*)$')
    if attempt then
      redis.call('XADD', KEYS[2], '*', 'attempt', attempt, 'payload', payload)
      moved = moved + 1
    else
      redis.call('XADD', KEYS[3], '*', 'reason', 'malformed delayed entry', 'payload', member)
    end
  end
end
return moved
"#;

/// Redis Streams transport configuration.
#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
    pub delayed_key: String,
    pub dlq_key: String,
    pub retry_policy: RetryPolicy,
    pub visibility_timeout: Duration,
    pub promote_batch: usize,
}

impl RedisStreamsConfig {
    pub fn new(
        stream_key: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        let stream_key = stream_key.into();
        Self {
            delayed_key: format!("{stream_key}:delayed"),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: group.into(),
            consumer: consumer.into(),
            retry_policy: RetryPolicy::default(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            promote_batch: DEFAULT_PROMOTE_BATCH,
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }
}

/// Redis Streams job transport.
///
/// Implements both [`JobTransport`] and [`DeliverySource`]; a producer only
/// needs the former and never touches the consumer group.
#[derive(Clone)]
pub struct RedisStreamsTransport {
    config: RedisStreamsConfig,
    conn: MultiplexedConnection,
    /// Dedicated to `XREADGROUP ... BLOCK` so blocking reads never delay other commands.
    blocking_conn: MultiplexedConnection,
    promote_script: redis::Script,
    /// Entry ids handed out by `receive` and not yet acked or nacked.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for RedisStreamsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsTransport {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `config` - stream, group and consumer names plus retry settings
    pub async fn connect(
        redis_url: impl AsRef<str>,
        config: RedisStreamsConfig,
    ) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let blocking_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(Self {
            config,
            conn,
            blocking_conn,
            promote_script: redis::Script::new(PROMOTE_DUE_SCRIPT),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.config
    }

    /// Ensure the consumer group exists (idempotent).
    ///
    /// Creates the stream too. The group starts at the beginning of the stream
    /// so messages submitted before the first worker started are not skipped.
    pub async fn ensure_consumer_group(&self) -> Result<(), TransportError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(TransportError::Command(format!("XGROUP CREATE failed: {}", e))),
        }
    }

    /// Read back up to `count` dead-lettered messages, oldest first.
    pub async fn dead_letters(&self, count: usize) -> Result<Vec<DeadLetterEntry>, TransportError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XRANGE")
            .arg(&self.config.dlq_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("XRANGE failed: {}", e)))?;

        let mut entries = Vec::new();
        if let Value::Bulk(items) = reply {
            for item in &items {
                let Some(entry) = StreamEntry::parse(item) else {
                    continue;
                };
                match entry.to_dead_letter() {
                    Ok(dead) => entries.push(dead),
                    Err(e) => warn!(entry_id = %entry.id, error = %e, "skipping unreadable dead letter"),
                }
            }
        }
        Ok(entries)
    }

    /// Move due delayed retries back onto the stream.
    async fn promote_due(&self) -> Result<i64, TransportError> {
        let mut conn = self.conn.clone();
        self.promote_script
            .key(&self.config.delayed_key)
            .key(&self.config.stream_key)
            .key(&self.config.dlq_key)
            .arg(Utc::now().timestamp_millis())
            .arg(self.config.promote_batch)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("delayed promotion failed: {}", e)))
    }

    /// Take over one entry another consumer left pending past the visibility timeout.
    async fn claim_stale(&self) -> Result<Option<Delivery>, TransportError> {
        let mut conn = self.conn.clone();
        let min_idle_ms = self.config.visibility_timeout.as_millis() as u64;

        // XPENDING with IDLE returns [id, consumer, idle_ms, delivery_count] tuples.
        let pending: Value = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(self.config.promote_batch)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("XPENDING failed: {}", e)))?;

        // A long-running job of our own also shows up as idle.
        let candidate = {
            let held = self.held();
            parse_pending(&pending)
                .into_iter()
                .find(|p| !held.contains(&p.entry_id))
        };
        let Some(PendingEntry {
            entry_id,
            consumer,
            deliveries: prior_deliveries,
        }) = candidate
        else {
            return Ok(None);
        };

        let claimed: Value = redis::cmd("XCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg(min_idle_ms)
            .arg(&entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("XCLAIM failed: {}", e)))?;

        let entry = match &claimed {
            Value::Bulk(items) => items.first().and_then(StreamEntry::parse),
            _ => None,
        };
        let Some(entry) = entry else {
            // Claimed by someone else first, or the entry was deleted.
            return Ok(None);
        };

        debug!(entry_id = %entry.id, from = %consumer, prior_deliveries, "claimed stale pending entry");
        self.into_delivery(entry, prior_deliveries).await
    }

    async fn read_new(&self, max_wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let mut conn = self.blocking_conn.clone();
        let block_ms = (max_wait.as_millis() as u64).max(1);

        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(&self.config.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("XREADGROUP failed: {}", e)))?;

        match parse_read_reply(&reply).into_iter().next() {
            Some(entry) => self.into_delivery(entry, 0).await,
            None => Ok(None),
        }
    }

    /// Decode an entry; undecodable entries are dead-lettered and acked.
    async fn into_delivery(
        &self,
        entry: StreamEntry,
        prior_deliveries: u32,
    ) -> Result<Option<Delivery>, TransportError> {
        match entry.decode() {
            Ok((message, attempt)) => {
                self.held().insert(entry.id.clone());
                Ok(Some(Delivery {
                    delivery_id: entry.id,
                    message,
                    attempt: attempt + prior_deliveries,
                }))
            }
            Err(e) => {
                error!(entry_id = %entry.id, error = %e, "undecodable job entry; dead-lettering");
                let raw = entry.fields.get("payload").cloned().unwrap_or_default();
                let mut conn = self.conn.clone();
                redis::pipe()
                    .atomic()
                    .cmd("XADD")
                    .arg(&self.config.dlq_key)
                    .arg("*")
                    .arg("original_entry_id")
                    .arg(&entry.id)
                    .arg("reason")
                    .arg(e.to_string())
                    .arg("dead_lettered_at")
                    .arg(Utc::now().to_rfc3339())
                    .arg("payload")
                    .arg(raw)
                    .ignore()
                    .cmd("XACK")
                    .arg(&self.config.stream_key)
                    .arg(&self.config.group)
                    .arg(&entry.id)
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(|e| TransportError::Command(format!("DLQ XADD failed: {}", e)))?;
                Ok(None)
            }
        }
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, delivery: &Delivery) {
        self.held().remove(&delivery.delivery_id);
    }

    /// Number of deliveries handed out and not yet acked or nacked.
    pub fn in_flight_len(&self) -> usize {
        self.held().len()
    }
}

#[async_trait]
impl JobTransport for RedisStreamsTransport {
    #[instrument(
        skip(self, message),
        fields(stream_key = %self.config.stream_key, job_id = %message.job_id),
        err
    )]
    async fn submit(&self, message: JobMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("*")
            .arg("attempt")
            .arg(1)
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("XADD failed: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl DeliverySource for RedisStreamsTransport {
    async fn receive(&self, max_wait: Duration) -> Result<Option<Delivery>, TransportError> {
        let promoted = self.promote_due().await?;
        if promoted > 0 {
            debug!(promoted, "moved due retries back to the stream");
        }

        if let Some(delivery) = self.claim_stale().await? {
            return Ok(Some(delivery));
        }

        self.read_new(max_wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.release(delivery);
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(&delivery.delivery_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }

    #[instrument(
        skip(self, delivery),
        fields(job_id = %delivery.message.job_id, attempt = delivery.attempt),
        err
    )]
    async fn nack(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<NackOutcome, TransportError> {
        self.release(delivery);
        let payload = serde_json::to_string(&delivery.message)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        let policy = &self.config.retry_policy;
        let mut conn = self.conn.clone();

        if policy.should_retry(delivery.attempt) {
            let delay = policy.delay_for_attempt(delivery.attempt);
            let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let member = encode_delayed_member(delivery.attempt + 1, &payload);

            // Schedule the retry and release the original entry together.
            redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(&self.config.delayed_key)
                .arg(due_ms)
                .arg(member)
                .ignore()
                .cmd("XACK")
                .arg(&self.config.stream_key)
                .arg(&self.config.group)
                .arg(&delivery.delivery_id)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| TransportError::Command(format!("retry scheduling failed: {}", e)))?;

            return Ok(NackOutcome::Retrying { delay });
        }

        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.config.dlq_key)
            .arg("*")
            .arg("original_entry_id")
            .arg(&delivery.delivery_id)
            .arg("job_id")
            .arg(delivery.message.job_id.as_str())
            .arg("attempts")
            .arg(delivery.attempt)
            .arg("reason")
            .arg(reason)
            .arg("dead_lettered_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(&payload)
            .ignore()
            .cmd("XACK")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(&delivery.delivery_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TransportError::Command(format!("DLQ XADD failed: {}", e)))?;

        warn!(reason, "message sent to dead-letter stream");
        Ok(NackOutcome::DeadLettered)
    }
}

/// `<attempt>|<nonce>|<payload>`; the nonce keeps repeated retries of the
/// same payload distinct inside the sorted set.
fn encode_delayed_member(attempt: u32, payload: &str) -> String {
    format!("{attempt}|{}|{payload}", Uuid::now_v7().simple())
}

#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Entry format: `[id, [field1, value1, field2, value2, ...]]`.
    fn parse(value: &Value) -> Option<Self> {
        let Value::Bulk(parts) = value else {
            return None;
        };
        let id = value_to_string(parts.first()?)?;
        let Value::Bulk(raw_fields) = parts.get(1)? else {
            return None;
        };

        let mut fields = HashMap::new();
        for pair in raw_fields.chunks(2) {
            if let [key, val] = pair {
                if let (Some(key), Some(val)) = (value_to_string(key), value_to_string(val)) {
                    fields.insert(key, val);
                }
            }
        }
        Some(Self { id, fields })
    }

    fn decode(&self) -> Result<(JobMessage, u32), TransportError> {
        let payload = self
            .fields
            .get("payload")
            .ok_or_else(|| TransportError::Serialization("missing payload field".to_string()))?;
        let message: JobMessage = serde_json::from_str(payload)
            .map_err(|e| TransportError::Serialization(format!("invalid payload: {}", e)))?;
        let attempt = self
            .fields
            .get("attempt")
            .and_then(|a| a.parse::<u32>().ok())
            .unwrap_or(1)
            .max(1);
        Ok((message, attempt))
    }

    fn to_dead_letter(&self) -> Result<DeadLetterEntry, TransportError> {
        let (message, _) = self.decode()?;
        let attempts = self
            .fields
            .get("attempts")
            .and_then(|a| a.parse().ok())
            .unwrap_or(0);
        let reason = self.fields.get("reason").cloned().unwrap_or_default();
        let dead_lettered_at = self
            .fields
            .get("dead_lettered_at")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(DeadLetterEntry {
            message,
            attempts,
            reason,
            dead_lettered_at,
        })
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn value_to_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Int(i) => u32::try_from(*i).ok(),
        other => value_to_string(other)?.parse().ok(),
    }
}

/// `XREADGROUP` reply: `[[stream_key, [entry, ...]], ...]`, or nil on timeout.
fn parse_read_reply(reply: &Value) -> Vec<StreamEntry> {
    let Value::Bulk(streams) = reply else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for stream in streams {
        if let Value::Bulk(parts) = stream {
            if let Some(Value::Bulk(items)) = parts.get(1) {
                entries.extend(items.iter().filter_map(StreamEntry::parse));
            }
        }
    }
    entries
}

/// One row of an extended `XPENDING` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    entry_id: String,
    consumer: String,
    deliveries: u32,
}

/// Rows of an extended `XPENDING` reply; malformed rows are skipped.
fn parse_pending(reply: &Value) -> Vec<PendingEntry> {
    let Value::Bulk(rows) = reply else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let Value::Bulk(row) = row else {
                return None;
            };
            Some(PendingEntry {
                entry_id: value_to_string(row.first()?)?,
                consumer: value_to_string(row.get(1)?)?,
                deliveries: value_to_u32(row.get(3)?)?,
            })
        })
        .collect()
}
