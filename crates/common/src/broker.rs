//! Queue broker abstraction and its Redis implementation.
//!
//! Queues are Redis lists under `hookrelay:queue:<name>`. Delayed pushes sit
//! in a single sorted set scored by their visibility time (unix millis) and
//! are promoted onto their target list by a Lua script before every pop.
//!
//! A `Broker` is one connection owned by exactly one task. Concurrent units
//! obtain their own through a `BrokerConnector`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::Serialize;

use crate::error::AppError;
use crate::redis_pool;
use crate::types::DEFAULT_PRIORITY;

const QUEUE_NAMESPACE: &str = "hookrelay:queue:";
const DELAYED_KEY: &str = "hookrelay:delayed";

/// Maximum number of delayed items promoted per pop.
const PROMOTE_BATCH: usize = 100;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[4]))
for _, member in ipairs(due) do
    if redis.call('ZREM', KEYS[1], member) == 1 then
        local item = cjson.decode(member)
        local target = ARGV[2] .. item.queue
        if tonumber(item.priority) < tonumber(ARGV[3]) then
            redis.call('LPUSH', target, item.payload)
        else
            redis.call('RPUSH', target, item.payload)
        end
    end
end
return #due
"#;

/// One single-owner connection to the job-queue broker.
#[async_trait]
pub trait Broker: Send {
    /// Append `payload` to `queue`. A non-zero `delay` keeps it invisible
    /// until the delay elapses; a `priority` below [`DEFAULT_PRIORITY`]
    /// places it ahead of default-priority items.
    async fn push(
        &mut self,
        queue: &str,
        payload: &str,
        priority: u32,
        delay: Duration,
    ) -> Result<(), AppError>;

    /// Take the next visible item, waiting at most `wait` for one to appear.
    async fn pop(&mut self, queue: &str, wait: Duration) -> Result<Option<String>, AppError>;

    /// Names of existing queues starting with `prefix`.
    async fn list_queues(&mut self, prefix: &str) -> Result<Vec<String>, AppError>;

    /// Number of visible items in `queue`.
    async fn queue_len(&mut self, queue: &str) -> Result<usize, AppError>;
}

/// Factory handing out fresh broker connections.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Broker>, AppError>;
}

/// Sorted-set member describing a delayed push.
#[derive(Debug, Serialize)]
struct DelayedItem<'a> {
    queue: &'a str,
    priority: u32,
    payload: &'a str,
    /// Keeps identical payloads from collapsing into one member.
    nonce: String,
}

/// Redis-backed connector. Cloning shares the client, never a connection.
#[derive(Clone)]
pub struct RedisConnector {
    client: Client,
}

impl RedisConnector {
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        Ok(Self {
            client: redis_pool::open_client(redis_url)?,
        })
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> Result<Box<dyn Broker>, AppError> {
        let conn = redis_pool::create_redis_pool(&self.client).await?;
        Ok(Box::new(RedisBroker::new(conn)))
    }
}

/// Broker connection backed by Redis lists.
pub struct RedisBroker {
    conn: ConnectionManager,
    promote: Script,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            promote: Script::new(PROMOTE_SCRIPT),
        }
    }

    fn queue_key(queue: &str) -> String {
        format!("{}{}", QUEUE_NAMESPACE, queue)
    }

    /// Move every delayed item whose time has come onto its target list.
    async fn promote_due(&mut self) -> Result<(), AppError> {
        let promoted: i64 = self
            .promote
            .key(DELAYED_KEY)
            .arg(Utc::now().timestamp_millis())
            .arg(QUEUE_NAMESPACE)
            .arg(DEFAULT_PRIORITY)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut self.conn)
            .await?;

        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed queue items");
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(
        &mut self,
        queue: &str,
        payload: &str,
        priority: u32,
        delay: Duration,
    ) -> Result<(), AppError> {
        if delay.is_zero() {
            let command = if priority < DEFAULT_PRIORITY {
                "LPUSH"
            } else {
                "RPUSH"
            };
            let _: () = redis::cmd(command)
                .arg(Self::queue_key(queue))
                .arg(payload)
                .query_async(&mut self.conn)
                .await?;
            return Ok(());
        }

        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let member = serde_json::to_string(&DelayedItem {
            queue,
            priority,
            payload,
            nonce: uuid::Uuid::new_v4().to_string(),
        })?;

        let _: () = redis::cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(visible_at)
            .arg(member)
            .query_async(&mut self.conn)
            .await?;

        tracing::debug!(queue, delay_secs = delay.as_secs(), "Delayed push");
        Ok(())
    }

    async fn pop(&mut self, queue: &str, wait: Duration) -> Result<Option<String>, AppError> {
        self.promote_due().await?;

        let key = Self::queue_key(queue);

        // BLPOP with a zero timeout blocks forever, so a zero wait is a plain LPOP.
        if wait.is_zero() {
            let item: Option<String> = redis::cmd("LPOP")
                .arg(&key)
                .query_async(&mut self.conn)
                .await?;
            return Ok(item);
        }

        let item: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&key)
            .arg(wait.as_secs_f64())
            .query_async(&mut self.conn)
            .await?;

        Ok(item.map(|(_, payload)| payload))
    }

    async fn list_queues(&mut self, prefix: &str) -> Result<Vec<String>, AppError> {
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}{}*", QUEUE_NAMESPACE, prefix))
            .query_async(&mut self.conn)
            .await?;

        let mut names: Vec<String> = keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(QUEUE_NAMESPACE).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn queue_len(&mut self, queue: &str) -> Result<usize, AppError> {
        let len: usize = redis::cmd("LLEN")
            .arg(Self::queue_key(queue))
            .query_async(&mut self.conn)
            .await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_key_is_namespaced() {
        assert_eq!(RedisBroker::queue_key("Q_ABC"), "hookrelay:queue:Q_ABC");
    }

    #[test]
    fn test_delayed_member_shape() {
        let member = serde_json::to_string(&DelayedItem {
            queue: "notify",
            priority: 2,
            payload: "{}",
            nonce: "n".to_string(),
        })
        .unwrap();
        assert_eq!(
            member,
            r#"{"queue":"notify","priority":2,"payload":"{}","nonce":"n"}"#
        );
    }

    /// Requires a running Redis reachable through `REDIS_URL`.
    #[tokio::test]
    #[ignore]
    async fn test_redis_round_trip_with_delay() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let connector = RedisConnector::new(&url).unwrap();
        let mut broker = connector.connect().await.unwrap();
        let queue = format!("test-{}", uuid::Uuid::new_v4());

        broker
            .push(&queue, "later", DEFAULT_PRIORITY, Duration::from_secs(1))
            .await
            .unwrap();
        broker
            .push(&queue, "now", DEFAULT_PRIORITY, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            broker.pop(&queue, Duration::ZERO).await.unwrap().as_deref(),
            Some("now")
        );
        assert_eq!(broker.pop(&queue, Duration::ZERO).await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            broker.pop(&queue, Duration::from_secs(1)).await.unwrap().as_deref(),
            Some("later")
        );
    }
}
