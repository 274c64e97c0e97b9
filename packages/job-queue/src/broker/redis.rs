//! Redis-backed broker
//!
//! Key layout under the configured namespace `ns`:
//!
//! | Key | Type | Content |
//! |---|---|---|
//! | `ns:jobs` | hash | id -> envelope JSON for live jobs |
//! | `ns:pending:<lane>` | list | ids waiting to run (LPUSH in, RPOP out) |
//! | `ns:inflight` | zset | id -> lease deadline (ms) |
//! | `ns:leases` | hash | id -> lease token |
//! | `ns:scheduled` | zset | id -> retry due time (ms) |
//! | `ns:dead` | zset | id -> time of death (ms) |
//! | `ns:dead_jobs` | hash | id -> dead letter JSON |
//! | `ns:quarantine` | hash | id -> raw envelope that failed to decode |
//!
//! Every state transition is a Lua script so that claims stay atomic across
//! worker processes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use similarity_shared_config::RedisConfig;
use uuid::Uuid;

use super::{lease_deadline, plan_failure, Broker, ClaimedJob, DeadLetter, FailureDisposition, QueueStats};
use crate::envelope::{JobEnvelope, Lane};
use crate::error::{QueueError, QueueResult};
use crate::retry::Backoff;

const CLAIM_SCRIPT: &str = r#"
while true do
  local id = redis.call('RPOP', KEYS[1])
  if not id then return false end
  local body = redis.call('HGET', KEYS[4], id)
  if body then
    redis.call('ZADD', KEYS[2], ARGV[1], id)
    redis.call('HSET', KEYS[3], id, ARGV[2])
    return {id, body}
  end
end
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
if tonumber(ARGV[4]) == 0 then
  redis.call('LPUSH', KEYS[4], ARGV[1])
else
  redis.call('ZADD', KEYS[5], ARGV[4], ARGV[1])
end
return 1
"#;

const DEAD_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
redis.call('HSET', KEYS[5], ARGV[1], ARGV[3])
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('RPUSH', KEYS[3], ARGV[1])
return 1
"#;

/// Moves ids due in the zset KEYS[1] back onto their lane lists.
/// KEYS[2] is the leases hash (cleared for recovered leases), KEYS[3] the jobs hash.
const REQUEUE_DUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local moved = 0
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
  local body = redis.call('HGET', KEYS[3], id)
  if body then
    local lane = cjson.decode(body)['lane']
    redis.call('LPUSH', ARGV[2] .. ':pending:' .. lane, id)
    moved = moved + 1
  end
end
return moved
"#;

const REPLAY_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
redis.call('LPUSH', KEYS[4], ARGV[1])
return 1
"#;

const QUARANTINE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[4], ARGV[1], ARGV[2])
return 1
"#;

struct Scripts {
    claim: Script,
    ack: Script,
    retry: Script,
    dead: Script,
    release: Script,
    requeue_due: Script,
    replay: Script,
    quarantine: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
            retry: Script::new(RETRY_SCRIPT),
            dead: Script::new(DEAD_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            requeue_due: Script::new(REQUEUE_DUE_SCRIPT),
            replay: Script::new(REPLAY_SCRIPT),
            quarantine: Script::new(QUARANTINE_SCRIPT),
        }
    }
}

/// Key names for one namespace
#[derive(Debug, Clone)]
struct Keys {
    namespace: String,
}

impl Keys {
    fn jobs(&self) -> String {
        format!("{}:jobs", self.namespace)
    }

    fn pending(&self, lane: Lane) -> String {
        format!("{}:pending:{}", self.namespace, lane)
    }

    fn inflight(&self) -> String {
        format!("{}:inflight", self.namespace)
    }

    fn leases(&self) -> String {
        format!("{}:leases", self.namespace)
    }

    fn scheduled(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    fn dead(&self) -> String {
        format!("{}:dead", self.namespace)
    }

    fn dead_jobs(&self) -> String {
        format!("{}:dead_jobs", self.namespace)
    }

    fn quarantine(&self) -> String {
        format!("{}:quarantine", self.namespace)
    }
}

/// Broker storing jobs in Redis
///
/// Cheap to clone: clones share one auto-reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    keys: Keys,
    scripts: std::sync::Arc<Scripts>,
}

impl RedisBroker {
    /// Connect to Redis, failing fast if it does not answer within the
    /// configured connect timeout.
    pub async fn connect(config: &RedisConfig, namespace: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(config.connection_url())?;
        let timeout = Duration::from_secs(config.connect_timeout_secs);

        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                QueueError::Unavailable(format!(
                    "no answer from {} within {}s",
                    redact(&config.url),
                    config.connect_timeout_secs
                ))
            })??;

        let broker = Self {
            conn,
            keys: Keys {
                namespace: namespace.into(),
            },
            scripts: std::sync::Arc::new(Scripts::load()),
        };
        broker.ping().await?;

        tracing::info!(
            url = %redact(&config.url),
            namespace = %broker.keys.namespace,
            "Connected to Redis broker"
        );
        Ok(broker)
    }

    pub fn namespace(&self) -> &str {
        &self.keys.namespace
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Park an undecodable envelope out of the way so it cannot block the lane
    async fn quarantine(&self, id: &str, raw: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = self
            .scripts
            .quarantine
            .key(self.keys.inflight())
            .key(self.keys.leases())
            .key(self.keys.jobs())
            .key(self.keys.quarantine())
            .arg(id)
            .arg(raw)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    fn settled(job: &ClaimedJob, result: i32) -> QueueResult<()> {
        if result == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(job.id()))
        }
    }
}

/// Strip credentials from a connection URL before logging it
fn redact(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => raw.to_string(),
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, envelope: &JobEnvelope) -> QueueResult<()> {
        let body = envelope.to_json()?;
        let id = envelope.id.to_string();
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .hset(self.keys.jobs(), &id, body)
            .ignore()
            .lpush(self.keys.pending(envelope.lane), &id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim(&self, lane: Lane, lease: Duration) -> QueueResult<Option<ClaimedJob>> {
        let token = Uuid::new_v4();
        let expires_at = lease_deadline(lease);
        let mut conn = self.conn.clone();

        let claimed: Option<(String, String)> = self
            .scripts
            .claim
            .key(self.keys.pending(lane))
            .key(self.keys.inflight())
            .key(self.keys.leases())
            .key(self.keys.jobs())
            .arg(expires_at.timestamp_millis())
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;

        let Some((id, body)) = claimed else {
            return Ok(None);
        };

        match JobEnvelope::from_json(&id, &body) {
            Ok(envelope) => Ok(Some(ClaimedJob {
                envelope,
                lease_token: token,
                lease_expires_at: expires_at,
            })),
            Err(err) => {
                tracing::error!(job_id = %id, error = %err, "Quarantining undecodable job");
                self.quarantine(&id, &body).await?;
                Err(err)
            }
        }
    }

    async fn ack(&self, job: &ClaimedJob) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let result: i32 = self
            .scripts
            .ack
            .key(self.keys.inflight())
            .key(self.keys.leases())
            .key(self.keys.jobs())
            .arg(job.id().to_string())
            .arg(job.lease_token.to_string())
            .invoke_async(&mut conn)
            .await?;
        Self::settled(job, result)
    }

    async fn fail(
        &self,
        job: &ClaimedJob,
        reason: &str,
        backoff: &Backoff,
    ) -> QueueResult<FailureDisposition> {
        let (next, disposition) = plan_failure(&job.envelope, reason, backoff);
        let mut conn = self.conn.clone();

        let result: i32 = match disposition {
            FailureDisposition::Retrying { delay, .. } => {
                let due = if delay.is_zero() {
                    0
                } else {
                    Self::now_ms() + delay.as_millis() as i64
                };
                self.scripts
                    .retry
                    .key(self.keys.inflight())
                    .key(self.keys.leases())
                    .key(self.keys.jobs())
                    .key(self.keys.pending(next.lane))
                    .key(self.keys.scheduled())
                    .arg(job.id().to_string())
                    .arg(job.lease_token.to_string())
                    .arg(next.to_json()?)
                    .arg(due)
                    .invoke_async(&mut conn)
                    .await?
            }
            FailureDisposition::DeadLettered => {
                let letter = DeadLetter {
                    envelope: next,
                    reason: reason.to_string(),
                    died_at: Utc::now(),
                };
                self.scripts
                    .dead
                    .key(self.keys.inflight())
                    .key(self.keys.leases())
                    .key(self.keys.jobs())
                    .key(self.keys.dead())
                    .key(self.keys.dead_jobs())
                    .arg(job.id().to_string())
                    .arg(job.lease_token.to_string())
                    .arg(serde_json::to_string(&letter)?)
                    .arg(letter.died_at.timestamp_millis())
                    .invoke_async(&mut conn)
                    .await?
            }
        };

        Self::settled(job, result)?;
        Ok(disposition)
    }

    async fn release(&self, job: &ClaimedJob) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let result: i32 = self
            .scripts
            .release
            .key(self.keys.inflight())
            .key(self.keys.leases())
            .key(self.keys.pending(job.envelope.lane))
            .arg(job.id().to_string())
            .arg(job.lease_token.to_string())
            .invoke_async(&mut conn)
            .await?;
        Self::settled(job, result)
    }

    async fn recover_expired(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .scripts
            .requeue_due
            .key(self.keys.inflight())
            .key(self.keys.leases())
            .key(self.keys.jobs())
            .arg(Self::now_ms())
            .arg(&self.keys.namespace)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .scripts
            .requeue_due
            .key(self.keys.scheduled())
            .key(self.keys.leases())
            .key(self.keys.jobs())
            .arg(Self::now_ms())
            .arg(&self.keys.namespace)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let (default, critical, low, in_flight, scheduled, dead): (u64, u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.keys.pending(Lane::Default))
                .llen(self.keys.pending(Lane::Critical))
                .llen(self.keys.pending(Lane::Low))
                .zcard(self.keys.inflight())
                .zcard(self.keys.scheduled())
                .zcard(self.keys.dead())
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            pending: [
                (Lane::Default, default),
                (Lane::Critical, critical),
                (Lane::Low, low),
            ]
            .into_iter()
            .collect(),
            in_flight,
            scheduled,
            dead,
        })
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();

        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.keys.dead())
            .arg(0)
            .arg(limit as isize - 1)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let bodies: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.dead_jobs())
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        ids.iter()
            .zip(bodies)
            .filter_map(|(id, body)| body.map(|b| (id, b)))
            .map(|(id, body)| {
                serde_json::from_str(&body).map_err(|e| QueueError::corrupt(id.as_str(), e.to_string()))
            })
            .collect()
    }

    async fn replay_dead(&self, id: Uuid) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let key = id.to_string();

        let body: Option<String> = redis::cmd("HGET")
            .arg(self.keys.dead_jobs())
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        let body = body.ok_or(QueueError::NotFound(id))?;

        let letter: DeadLetter =
            serde_json::from_str(&body).map_err(|e| QueueError::corrupt(key.as_str(), e.to_string()))?;
        let mut envelope = letter.envelope;
        envelope.retried = 0;

        let replayed: i32 = self
            .scripts
            .replay
            .key(self.keys.dead())
            .key(self.keys.dead_jobs())
            .key(self.keys.jobs())
            .key(self.keys.pending(envelope.lane))
            .arg(&key)
            .arg(envelope.to_json()?)
            .invoke_async(&mut conn)
            .await?;

        if replayed == 1 {
            Ok(())
        } else {
            Err(QueueError::NotFound(id))
        }
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(QueueError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }
}
