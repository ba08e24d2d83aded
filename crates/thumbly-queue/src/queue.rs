//! Job queue using Redis Streams.

use std::time::Duration;

use chrono::Utc;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::envelope::ProcessingEnvelope;
use crate::error::{QueueError, QueueResult};

/// TTL for bookkeeping keys (attempts, live markers, settle guards). Long
/// enough to outlive any job, short enough to self-heal after a crash.
const BOOKKEEPING_TTL_SECS: u64 = 86_400;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Sorted set holding delayed/backoff entries
    pub scheduled_key: String,
    /// Total attempts before an entry is terminally failed
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff
    pub backoff_base: Duration,
    /// Idle window after which a reserved entry counts as stalled
    pub stall_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "thumbly:jobs".to_string(),
            consumer_group: "thumbly:workers".to_string(),
            scheduled_key: "thumbly:scheduled".to_string(),
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
            stall_timeout: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            scheduled_key: std::env::var("QUEUE_SCHEDULED_KEY").unwrap_or(defaults.scheduled_key),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            backoff_base: Duration::from_millis(
                std::env::var("QUEUE_BACKOFF_BASE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.backoff_base.as_millis() as u64),
            ),
            stall_timeout: Duration::from_millis(
                std::env::var("QUEUE_STALL_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.stall_timeout.as_millis() as u64),
            ),
        }
    }
}

/// A reserved queue entry. The holder must settle it with exactly one
/// `ack` or `nack`.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Stream message ID
    pub message_id: String,
    /// Attempt number (1-based) this reservation represents
    pub attempt: u32,
    /// The processing envelope
    pub envelope: ProcessingEnvelope,
}

/// Result of a `nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Rescheduled; the entry becomes visible again after `delay`.
    Retry { delay: Duration, attempt: u32 },
    /// All attempts used; the job is terminally failed.
    Exhausted,
}

/// Which set `clean` operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanKind {
    /// Entries sitting in the stream
    Waiting,
    /// Entries in the delayed/backoff set
    Delayed,
}

/// Delay before attempt `attempt + 1`, growing exponentially per attempt.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

/// Job queue client.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Total attempts allowed per job.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Initialize the queue (create the consumer group if needed).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Enqueue an envelope, optionally delayed.
    ///
    /// A job may have at most one live entry; a second enqueue for the same
    /// `job_id` is rejected with [`QueueError::Duplicate`].
    pub async fn enqueue(
        &self,
        envelope: &ProcessingEnvelope,
        delay: Option<Duration>,
    ) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let job_id = envelope.idempotency_key().to_string();

        let acquired: bool = redis::cmd("SET")
            .arg(self.live_key(&job_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(BOOKKEEPING_TTL_SECS)
            .query_async(&mut conn)
            .await
            .unwrap_or(false);
        if !acquired {
            warn!(job_id = %job_id, "duplicate enqueue rejected");
            return Err(QueueError::Duplicate(job_id));
        }

        match delay {
            Some(delay) if !delay.is_zero() => {
                self.schedule(&mut conn, envelope, delay).await?;
            }
            _ => {
                self.xadd(&mut conn, envelope).await?;
            }
        }

        Ok(())
    }

    /// Put an envelope into the delayed set without touching the live marker.
    /// Used by `nack` for retry backoff.
    async fn schedule(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        envelope: &ProcessingEnvelope,
        delay: Duration,
    ) -> QueueResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        redis::cmd("ZADD")
            .arg(&self.config.scheduled_key)
            .arg(visible_at)
            .arg(&payload)
            .query_async::<()>(conn)
            .await?;

        info!(
            job_id = %envelope.job_id,
            delay_ms = delay.as_millis() as u64,
            "scheduled job with delay"
        );
        Ok(())
    }

    async fn xadd(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        envelope: &ProcessingEnvelope,
    ) -> QueueResult<String> {
        let payload = serde_json::to_string(envelope)?;
        let job_id = envelope.job_id.to_string();

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("key")
            .arg(&job_id)
            .query_async(conn)
            .await?;

        // Remember where the entry lives so `remove` can find it.
        conn.set_ex::<_, _, ()>(self.entry_key(&job_id), &message_id, BOOKKEEPING_TTL_SECS)
            .await?;

        info!(job_id = %job_id, message_id = %message_id, "enqueued job");
        Ok(message_id)
    }

    /// Move due entries from the delayed set into the stream.
    ///
    /// Called periodically by the worker; returns how many entries moved.
    pub async fn promote_due(&self) -> QueueResult<usize> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.config.scheduled_key)
            .arg(0)
            .arg(now)
            .query_async(&mut conn)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        for payload in &due {
            // Remove first so a concurrent promoter cannot double-deliver.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.config.scheduled_key)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }

            match serde_json::from_str::<ProcessingEnvelope>(payload) {
                Ok(envelope) => {
                    self.xadd(&mut conn, &envelope).await?;
                    moved += 1;
                }
                Err(e) => {
                    warn!("failed to parse scheduled entry, dropping: {}", e);
                }
            }
        }

        if moved > 0 {
            debug!(count = moved, "promoted scheduled jobs");
        }
        Ok(moved)
    }

    /// Reserve up to `count` entries, blocking up to `block_ms`.
    ///
    /// Each reservation counts one attempt. Returns an empty vector when the
    /// queue is paused or nothing became available.
    pub async fn reserve(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<QueueEntry>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        if self.paused(&mut conn).await? {
            return Ok(Vec::new());
        }

        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::new();
        for stream_key in reply.keys {
            for id in stream_key.ids {
                let message_id = id.id.clone();
                let Some(redis::Value::BulkString(payload)) = id.map.get("job") else {
                    warn!(message_id = %message_id, "stream entry without job payload");
                    self.discard(&mut conn, &message_id).await;
                    continue;
                };
                let payload = String::from_utf8_lossy(payload);
                match serde_json::from_str::<ProcessingEnvelope>(&payload) {
                    Ok(envelope) => {
                        let attempt = self.bump_attempt(&mut conn, &envelope.job_id.to_string()).await?;
                        debug!(job_id = %envelope.job_id, attempt, "reserved job");
                        entries.push(QueueEntry {
                            message_id,
                            attempt,
                            envelope,
                        });
                    }
                    Err(e) => {
                        warn!(message_id = %message_id, "failed to parse payload: {}", e);
                        self.discard(&mut conn, &message_id).await;
                    }
                }
            }
        }

        Ok(entries)
    }

    /// Acknowledge a successfully processed entry.
    pub async fn ack(&self, entry: &QueueEntry) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.settle(&mut conn, &entry.message_id).await?;

        self.discard(&mut conn, &entry.message_id).await;
        self.clear_job_keys(&mut conn, &entry.envelope.job_id.to_string())
            .await;

        debug!(job_id = %entry.envelope.job_id, "acked job");
        Ok(())
    }

    /// Report a failed attempt.
    ///
    /// While attempts remain the entry is rescheduled with exponential
    /// backoff; otherwise the job is terminally failed and its bookkeeping
    /// cleared so a later manual retry can re-enqueue it.
    pub async fn nack(&self, entry: &QueueEntry, error: &str) -> QueueResult<NackOutcome> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.settle(&mut conn, &entry.message_id).await?;

        self.discard(&mut conn, &entry.message_id).await;
        let job_id = entry.envelope.job_id.to_string();
        conn.del::<_, ()>(self.entry_key(&job_id)).await.ok();

        if entry.attempt >= self.config.max_attempts {
            self.clear_job_keys(&mut conn, &job_id).await;
            warn!(
                job_id = %job_id,
                attempts = entry.attempt,
                error,
                "job exhausted all attempts"
            );
            return Ok(NackOutcome::Exhausted);
        }

        let delay = backoff_delay(self.config.backoff_base, entry.attempt);
        self.schedule(&mut conn, &entry.envelope, delay).await?;
        info!(
            job_id = %job_id,
            attempt = entry.attempt,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error,
            "job attempt failed, rescheduled"
        );
        Ok(NackOutcome::Retry {
            delay,
            attempt: entry.attempt,
        })
    }

    /// Best-effort removal of a waiting or delayed entry.
    ///
    /// Returns true if an entry was found and removed. A reserved (active)
    /// entry cannot be removed; it settles through its worker.
    pub async fn remove(&self, job_id: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut removed = false;

        if let Some(message_id) = conn
            .get::<_, Option<String>>(self.entry_key(job_id))
            .await?
        {
            // Only waiting entries are deletable; a reserved entry is in the
            // group's pending list and stays with its consumer.
            let deleted: i64 = redis::cmd("XDEL")
                .arg(&self.config.stream_name)
                .arg(&message_id)
                .query_async(&mut conn)
                .await?;
            removed = deleted > 0;
        }

        let scheduled: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.config.scheduled_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        for payload in scheduled {
            let matches = serde_json::from_str::<ProcessingEnvelope>(&payload)
                .map(|e| e.job_id.as_str() == job_id)
                .unwrap_or(false);
            if matches {
                let zremoved: i64 = redis::cmd("ZREM")
                    .arg(&self.config.scheduled_key)
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await?;
                removed = removed || zremoved > 0;
            }
        }

        if removed {
            self.clear_job_keys(&mut conn, job_id).await;
            info!(job_id = %job_id, "removed queue entry");
        }
        Ok(removed)
    }

    /// Stop handing out entries until `resume` is called.
    pub async fn pause(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(self.paused_key(), "1").await?;
        info!("queue paused");
        Ok(())
    }

    /// Resume handing out entries.
    pub async fn resume(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(self.paused_key()).await?;
        info!("queue resumed");
        Ok(())
    }

    /// Whether the queue is currently paused.
    pub async fn is_paused(&self) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.paused(&mut conn).await
    }

    /// Drop entries older than `older_than` from the chosen set.
    /// Returns how many entries were removed.
    pub async fn clean(&self, older_than: Duration, kind: CleanKind) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;

        match kind {
            CleanKind::Delayed => {
                // Scheduled scores are visibility times; anything this far in
                // the past has been abandoned.
                let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
                    .arg(&self.config.scheduled_key)
                    .arg(0)
                    .arg(cutoff)
                    .query_async(&mut conn)
                    .await?;
                Ok(removed)
            }
            CleanKind::Waiting => {
                // Stream IDs are `<ms>-<seq>`; trim everything below the cutoff.
                let removed: u64 = redis::cmd("XTRIM")
                    .arg(&self.config.stream_name)
                    .arg("MINID")
                    .arg(format!("{}-0", cutoff.max(0)))
                    .query_async(&mut conn)
                    .await?;
                Ok(removed)
            }
        }
    }

    /// Refresh ownership of a reserved entry so the stall monitor does not
    /// reclaim it while progress is still being made.
    pub async fn update_progress(&self, consumer_name: &str, entry: &QueueEntry) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // XCLAIM with min-idle 0 resets the idle timer; JUSTID skips the payload.
        let _res: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(0)
            .arg(&entry.message_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    /// Claim reserved entries that have gone silent past the stall window.
    ///
    /// Claimed entries are handed back to the caller to settle; the stalled
    /// reservation already consumed its attempt.
    pub async fn claim_stalled(
        &self,
        consumer_name: &str,
        count: usize,
    ) -> QueueResult<Vec<QueueEntry>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let min_idle_ms = self.config.stall_timeout.as_millis() as u64;

        let pending: Vec<Vec<redis::Value>> = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut stalled_ids = Vec::new();
        for detail in pending {
            // Format: [id, consumer, idle_time_ms, delivery_count]
            if let (Some(redis::Value::BulkString(id)), Some(redis::Value::Int(idle_ms))) =
                (detail.first(), detail.get(2))
            {
                if *idle_ms as u64 >= min_idle_ms {
                    if let Ok(id) = String::from_utf8(id.clone()) {
                        stalled_ids.push(id);
                    }
                }
            }
        }

        if stalled_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle_ms);
        for id in &stalled_ids {
            cmd.arg(id);
        }

        let claimed: Vec<Vec<redis::Value>> = cmd.query_async(&mut conn).await?;

        let mut entries = Vec::new();
        for message in claimed {
            let (Some(redis::Value::BulkString(id)), Some(redis::Value::Array(fields))) =
                (message.first(), message.get(1))
            else {
                continue;
            };
            let Ok(message_id) = String::from_utf8(id.clone()) else {
                continue;
            };
            let Some(payload) = field_value(fields, "job") else {
                self.discard(&mut conn, &message_id).await;
                continue;
            };
            match serde_json::from_str::<ProcessingEnvelope>(&payload) {
                Ok(envelope) => {
                    let attempt = self
                        .current_attempt(&mut conn, &envelope.job_id.to_string())
                        .await?;
                    warn!(job_id = %envelope.job_id, attempt, "claimed stalled job");
                    entries.push(QueueEntry {
                        message_id,
                        attempt,
                        envelope,
                    });
                }
                Err(e) => {
                    warn!(message_id = %message_id, "failed to parse stalled payload: {}", e);
                    self.discard(&mut conn, &message_id).await;
                }
            }
        }

        Ok(entries)
    }

    /// Number of entries currently in the stream.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    /// Number of entries waiting in the delayed set.
    pub async fn scheduled_len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.zcard(&self.config.scheduled_key).await?;
        Ok(len)
    }

    // ------------------------------------------------------------------
    // internals

    async fn paused(&self, conn: &mut redis::aio::MultiplexedConnection) -> QueueResult<bool> {
        let paused: bool = conn.exists(self.paused_key()).await?;
        Ok(paused)
    }

    /// First settle wins; later calls for the same entry observe AlreadyAcked.
    async fn settle(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        message_id: &str,
    ) -> QueueResult<()> {
        let first: bool = redis::cmd("SET")
            .arg(self.settled_key(message_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(BOOKKEEPING_TTL_SECS)
            .query_async(conn)
            .await
            .unwrap_or(false);
        if !first {
            return Err(QueueError::AlreadyAcked(message_id.to_string()));
        }
        Ok(())
    }

    async fn discard(&self, conn: &mut redis::aio::MultiplexedConnection, message_id: &str) {
        let _: Result<(), _> = redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(conn)
            .await;
        let _: Result<(), _> = redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(conn)
            .await;
    }

    async fn bump_attempt(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &str,
    ) -> QueueResult<u32> {
        let key = self.attempts_key(job_id);
        let attempt: u32 = conn.incr(&key, 1).await?;
        conn.expire::<_, ()>(&key, BOOKKEEPING_TTL_SECS as i64).await?;
        Ok(attempt)
    }

    async fn current_attempt(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &str,
    ) -> QueueResult<u32> {
        let attempt: Option<u32> = conn.get(self.attempts_key(job_id)).await?;
        Ok(attempt.unwrap_or(1))
    }

    async fn clear_job_keys(&self, conn: &mut redis::aio::MultiplexedConnection, job_id: &str) {
        let _: Result<(), _> = conn.del::<_, ()>(self.live_key(job_id)).await;
        let _: Result<(), _> = conn.del::<_, ()>(self.attempts_key(job_id)).await;
        let _: Result<(), _> = conn.del::<_, ()>(self.entry_key(job_id)).await;
    }

    fn live_key(&self, job_id: &str) -> String {
        format!("thumbly:live:{}", job_id)
    }

    fn attempts_key(&self, job_id: &str) -> String {
        format!("thumbly:attempts:{}", job_id)
    }

    fn entry_key(&self, job_id: &str) -> String {
        format!("thumbly:entry:{}", job_id)
    }

    fn settled_key(&self, message_id: &str) -> String {
        format!("thumbly:settled:{}", message_id)
    }

    fn paused_key(&self) -> &'static str {
        "thumbly:paused"
    }
}

/// Extract a field value from an XCLAIM reply's flat field array.
fn field_value(fields: &[redis::Value], name: &str) -> Option<String> {
    let mut i = 0;
    while i + 1 < fields.len() {
        if let (redis::Value::BulkString(field), redis::Value::BulkString(value)) =
            (&fields[i], &fields[i + 1])
        {
            if field.as_slice() == name.as_bytes() {
                return String::from_utf8(value.clone()).ok();
            }
        }
        i += 2;
    }
    None
}
