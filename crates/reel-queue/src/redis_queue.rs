//! Job queue using Redis Streams.
//!
//! Layout:
//! - `{prefix}:job:{id}` hash with `status`, `data` (job JSON) and, while a
//!   consumer holds the job, `lease` + `receipt`
//! - the jobs stream, consumed through one consumer group
//! - `{prefix}:delayed` sorted set of job IDs scored by retry time (ms)
//! - the dead letter stream
//!
//! A job is held by whichever consumer owns its pending stream entry. Entries
//! idle longer than the visibility timeout are reclaimed with XAUTOCLAIM;
//! heartbeats reset the idle timer.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamPendingReply, StreamReadReply};
use redis::{AsyncCommands, AsyncConnectionConfig, Script};
use reel_models::{DownloadArtifact, Job, JobId, JobStatus};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::queue::{apply_failure, Delivery, JobFailure, JobQueue, NackDisposition, QueueStats};

/// Give up a stale or orphaned entry after this many reclaim candidates.
const MAX_CLAIMS_PER_DEQUEUE: usize = 10;

/// Move due retries from the delayed set back onto the stream.
///
/// KEYS: delayed set, stream. ARGV: now (ms), batch size.
static PROMOTE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local moved = 0
for _, id in ipairs(due) do
  if redis.call('ZREM', KEYS[1], id) == 1 then
    redis.call('XADD', KEYS[2], '*', 'job_id', id)
    moved = moved + 1
  end
end
return moved
",
    )
});

/// Compare-and-set a job to `active` under a new lease.
///
/// KEYS: job hash. ARGV: consumer, receipt, job JSON.
/// Returns -1 when the record is gone, 0 when it is already settled.
static ACTIVATE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then return -1 end
if status ~= 'queued' and status ~= 'active' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'active', 'lease', ARGV[1], 'receipt', ARGV[2], 'data', ARGV[3])
return 1
",
    )
});

/// Reset the idle timer of a pending entry if the caller still holds it.
///
/// KEYS: job hash, stream. ARGV: group, consumer, receipt.
static HEARTBEAT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], 'lease') ~= ARGV[2] or redis.call('HGET', KEYS[1], 'receipt') ~= ARGV[3] then
  return 0
end
redis.call('XCLAIM', KEYS[2], ARGV[1], ARGV[2], 0, ARGV[3], 'JUSTID')
return 1
",
    )
});

/// Settle a delivery: write the record, release the stream entry, and
/// optionally park the job for retry or copy it to the DLQ.
///
/// KEYS: job hash, stream, delayed set, dlq stream.
/// ARGV: group, receipt, consumer, status, job JSON, retention secs,
///       retry-at ms (or ''), dlq reason (or ''), job id.
static SETTLE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], 'lease') ~= ARGV[3] or redis.call('HGET', KEYS[1], 'receipt') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[4], 'data', ARGV[5])
redis.call('HDEL', KEYS[1], 'lease', 'receipt')
redis.call('XACK', KEYS[2], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[2], ARGV[2])
if ARGV[7] ~= '' then
  redis.call('ZADD', KEYS[3], ARGV[7], ARGV[9])
end
if ARGV[8] ~= '' then
  redis.call('XADD', KEYS[4], '*', 'job_id', ARGV[9], 'error', ARGV[8], 'job', ARGV[5])
end
if ARGV[4] ~= 'active' and tonumber(ARGV[6]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[6])
end
return 1
",
    )
});

/// Reconnect a few times with backoff before surfacing the error.
fn reconnect_policy() -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_number_of_retries(3)
        .set_connection_timeout(Duration::from_secs(5))
}

/// Redis Streams job queue.
pub struct RedisJobQueue {
    client: redis::Client,
    /// Shared handle for non-blocking commands, reconnecting after a drop;
    /// `None` once closed
    conn: RwLock<Option<ConnectionManager>>,
    config: QueueConfig,
}

impl RedisJobQueue {
    /// Connect to Redis and verify the connection.
    pub async fn connect(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let mut conn = client
            .get_connection_manager_with_config(reconnect_policy())
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        Ok(Self {
            client,
            conn: RwLock::new(Some(conn)),
            config,
        })
    }

    /// Connect using environment configuration.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(QueueConfig::from_env()).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<ConnectionManager> {
        self.conn.read().await.clone().ok_or(QueueError::Closed)
    }

    async fn promote_due(&self, conn: &mut ConnectionManager) -> QueueResult<()> {
        let moved: i64 = PROMOTE_SCRIPT
            .key(self.config.delayed_key())
            .key(&self.config.stream_name)
            .arg(Utc::now().timestamp_millis())
            .arg(100)
            .invoke_async(conn)
            .await?;

        if moved > 0 {
            debug!("Promoted {} delayed jobs", moved);
        }
        Ok(())
    }

    /// Claim one entry whose consumer stopped heartbeating.
    async fn claim_expired(
        &self,
        conn: &mut ConnectionManager,
        consumer: &str,
    ) -> QueueResult<Option<Delivery>> {
        let min_idle_ms = self.config.visibility_timeout.as_millis() as u64;
        let mut cursor = "0-0".to_string();

        for _ in 0..MAX_CLAIMS_PER_DEQUEUE {
            let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
                .arg(&self.config.stream_name)
                .arg(&self.config.consumer_group)
                .arg(consumer)
                .arg(min_idle_ms)
                .arg(&cursor)
                .arg("COUNT")
                .arg(1)
                .query_async(conn)
                .await?;

            let Some(entry) = reply.claimed.first() else {
                return Ok(None);
            };

            info!(message_id = %entry.id, consumer = %consumer, "Claimed idle job entry");
            if let Some(delivery) = self.activate_entry(conn, consumer, entry).await? {
                return Ok(Some(delivery));
            }

            if reply.next_stream_id == "0-0" {
                return Ok(None);
            }
            cursor = reply.next_stream_id;
        }

        Ok(None)
    }

    /// Read one new entry, blocking up to `block`.
    async fn read_new(&self, consumer: &str, block: Duration) -> QueueResult<Option<StreamId>> {
        // Blocking reads get their own connection so they do not stall
        // commands pipelined on the shared one.
        let connection_config =
            AsyncConnectionConfig::new().set_response_timeout(block + Duration::from_secs(5));
        let mut conn = self
            .client
            .get_multiplexed_async_connection_with_config(&connection_config)
            .await
            .map_err(|e| QueueError::dequeue_failed(e.to_string()))?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next()))
    }

    /// Turn a stream entry into a delivery, discarding stale entries.
    async fn activate_entry(
        &self,
        conn: &mut ConnectionManager,
        consumer: &str,
        entry: &StreamId,
    ) -> QueueResult<Option<Delivery>> {
        let Some(job_id) = job_id_from_entry(entry) else {
            warn!(message_id = %entry.id, "Stream entry without job_id, discarding");
            self.discard(conn, &entry.id).await?;
            return Ok(None);
        };

        let key = self.config.job_key(&job_id);
        let data: Option<String> = conn.hget(&key, "data").await?;
        let Some(data) = data else {
            warn!(job_id = %job_id, "Job record missing, discarding entry");
            self.discard(conn, &entry.id).await?;
            return Ok(None);
        };

        let mut job: Job = serde_json::from_str(&data)?;
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job already settled, discarding entry");
            self.discard(conn, &entry.id).await?;
            return Ok(None);
        }
        job.activate()?;
        let payload = serde_json::to_string(&job)?;

        let activated: i64 = ACTIVATE_SCRIPT
            .key(&key)
            .arg(consumer)
            .arg(&entry.id)
            .arg(&payload)
            .invoke_async(conn)
            .await?;

        if activated != 1 {
            debug!(job_id = %job_id, result = activated, "Activation refused, discarding entry");
            self.discard(conn, &entry.id).await?;
            return Ok(None);
        }

        debug!(job_id = %job_id, consumer = %consumer, "Dequeued job");
        Ok(Some(Delivery {
            job,
            receipt: entry.id.clone(),
            consumer: consumer.to_string(),
        }))
    }

    async fn discard(&self, conn: &mut ConnectionManager, message_id: &str) -> QueueResult<()> {
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .ignore()
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        job: &Job,
        retry_at_ms: Option<i64>,
        dlq_reason: Option<&str>,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let job_id = job.id.as_str();

        let settled: i64 = SETTLE_SCRIPT
            .key(self.config.job_key(job_id))
            .key(&self.config.stream_name)
            .key(self.config.delayed_key())
            .key(&self.config.dlq_stream_name)
            .arg(&self.config.consumer_group)
            .arg(&delivery.receipt)
            .arg(&delivery.consumer)
            .arg(job.status.as_str())
            .arg(serde_json::to_string(job)?)
            .arg(self.config.job_retention.as_secs())
            .arg(retry_at_ms.map(|ms| ms.to_string()).unwrap_or_default())
            .arg(dlq_reason.unwrap_or_default())
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;

        if settled != 1 {
            return Err(QueueError::LeaseLost(job_id.to_string()));
        }
        Ok(())
    }
}

fn job_id_from_entry(entry: &StreamId) -> Option<String> {
    entry.get::<String>("job_id").filter(|id| !id.is_empty())
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    /// Create the consumer group if it does not exist.
    async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn enqueue(&self, job: Job) -> QueueResult<JobId> {
        if job.status != JobStatus::Queued {
            return Err(QueueError::enqueue_failed(format!(
                "job {} is {}, expected queued",
                job.id, job.status
            )));
        }

        let mut conn = self.conn().await?;
        let key = self.config.job_key(job.id.as_str());

        let exists: bool = conn.exists(&key).await?;
        if exists {
            warn!(job_id = %job.id, "Duplicate job rejected");
            return Err(QueueError::enqueue_failed(format!("duplicate job {}", job.id)));
        }

        let payload = serde_json::to_string(&job)?;
        let (message_id,): (String,) = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("status")
            .arg(JobStatus::Queued.as_str())
            .arg("data")
            .arg(&payload)
            .ignore()
            .cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job_id")
            .arg(job.id.as_str())
            .query_async(&mut conn)
            .await?;

        info!(job_id = %job.id, message_id = %message_id, "Enqueued job");
        Ok(job.id)
    }

    async fn dequeue(&self, consumer: &str, block: Duration) -> QueueResult<Option<Delivery>> {
        let mut conn = self.conn().await?;

        self.promote_due(&mut conn).await?;

        if let Some(delivery) = self.claim_expired(&mut conn, consumer).await? {
            return Ok(Some(delivery));
        }

        match self.read_new(consumer, block).await? {
            Some(entry) => self.activate_entry(&mut conn, consumer, &entry).await,
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let held: i64 = HEARTBEAT_SCRIPT
            .key(self.config.job_key(delivery.job_id().as_str()))
            .key(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(&delivery.consumer)
            .arg(&delivery.receipt)
            .invoke_async(&mut conn)
            .await?;

        if held != 1 {
            return Err(QueueError::LeaseLost(delivery.job_id().to_string()));
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery, artifact: DownloadArtifact) -> QueueResult<Job> {
        let mut job = delivery.job.clone();
        job.succeed(artifact)?;
        self.settle(delivery, &job, None, None).await?;

        debug!(job_id = %job.id, "Acknowledged job");
        Ok(job)
    }

    async fn nack(&self, delivery: &Delivery, failure: JobFailure) -> QueueResult<NackDisposition> {
        let mut job = delivery.job.clone();

        match apply_failure(&mut job, &failure, &self.config.backoff)? {
            Some((attempt, delay)) => {
                let retry_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                self.settle(delivery, &job, Some(retry_at), None).await?;
                info!(
                    job_id = %job.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduled retry"
                );
                Ok(NackDisposition::Retry { attempt, delay })
            }
            None => {
                self.settle(delivery, &job, None, Some(&failure.message)).await?;
                warn!(job_id = %job.id, "Moved job to DLQ: {}", failure.message);
                Ok(NackDisposition::Failed { job })
            }
        }
    }

    async fn get(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let data: Option<String> = conn.hget(self.config.job_key(job_id.as_str()), "data").await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await?;

        let queued: u64 = conn.xlen(&self.config.stream_name).await?;
        let pending: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;
        let delayed: u64 = conn.zcard(self.config.delayed_key()).await?;
        let dead_lettered: u64 = conn.xlen(&self.config.dlq_stream_name).await?;

        Ok(QueueStats {
            queued,
            in_flight: pending.count() as u64,
            delayed,
            dead_lettered,
        })
    }

    async fn close(&self) -> QueueResult<()> {
        if self.conn.write().await.take().is_some() {
            info!("Redis queue connection released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        StreamId {
            id: "1-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), redis::Value::BulkString(v.as_bytes().to_vec())))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_job_id_from_entry() {
        assert_eq!(
            job_id_from_entry(&entry(&[("job_id", "0192-abc")])),
            Some("0192-abc".to_string())
        );
        assert_eq!(job_id_from_entry(&entry(&[("job_id", "")])), None);
        assert_eq!(job_id_from_entry(&entry(&[("job", "{}")])), None);
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_bad_url() {
        let config = QueueConfig {
            redis_url: "not-a-redis-url".to_string(),
            ..QueueConfig::default()
        };
        let result = RedisJobQueue::connect(config).await;
        assert!(result.is_err());
    }
}
