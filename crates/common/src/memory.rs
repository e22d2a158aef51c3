//! In-process broker and store.
//!
//! Every handle returned by [`MemoryBroker::connect`] is a separate
//! connection onto the same shared queues, which keeps the single-owner
//! connection discipline of the real broker while needing no server. Used by
//! the test suites and for local runs without Redis/PostgreSQL.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::broker::{Broker, BrokerConnector};
use crate::error::AppError;
use crate::store::NotifyStore;
use crate::types::{DEFAULT_PRIORITY, NotificationRequest, StoredNotification};

/// A push as the broker received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub queue: String,
    pub payload: String,
    pub priority: u32,
    pub delay: Duration,
}

#[derive(Debug)]
struct Delayed {
    visible_at: Instant,
    queue: String,
    priority: u32,
    payload: String,
}

#[derive(Debug, Default)]
struct Queues {
    ready: HashMap<String, VecDeque<String>>,
    delayed: Vec<Delayed>,
    pushes: Vec<PushRecord>,
}

impl Queues {
    fn enqueue(&mut self, queue: String, payload: String, priority: u32) {
        let list = self.ready.entry(queue).or_default();
        if priority < DEFAULT_PRIORITY {
            list.push_front(payload);
        } else {
            list.push_back(payload);
        }
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| d.visible_at <= now);
        self.delayed = pending;
        for item in due {
            self.enqueue(item.queue, item.payload, item.priority);
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|d| d.visible_at).min()
    }
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<Queues>,
    pushed: Notify,
}

/// Shared in-memory queues; doubles as its own connector.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every push received so far, in order.
    pub async fn pushes(&self) -> Vec<PushRecord> {
        self.shared.queues.lock().await.pushes.clone()
    }

    /// Pushes received for one queue.
    pub async fn pushes_to(&self, queue: &str) -> Vec<PushRecord> {
        self.pushes()
            .await
            .into_iter()
            .filter(|p| p.queue == queue)
            .collect()
    }

    /// Visible items of a queue, front first, without consuming them.
    pub async fn snapshot(&self, queue: &str) -> Vec<String> {
        let mut queues = self.shared.queues.lock().await;
        queues.promote_due(Instant::now());
        queues
            .ready
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn try_pop(&self, queue: &str) -> (Option<String>, Option<Instant>) {
        let mut queues = self.shared.queues.lock().await;
        queues.promote_due(Instant::now());
        let item = queues.ready.get_mut(queue).and_then(VecDeque::pop_front);
        (item, queues.next_visible_at())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(
        &mut self,
        queue: &str,
        payload: &str,
        priority: u32,
        delay: Duration,
    ) -> Result<(), AppError> {
        {
            let mut queues = self.shared.queues.lock().await;
            queues.pushes.push(PushRecord {
                queue: queue.to_string(),
                payload: payload.to_string(),
                priority,
                delay,
            });
            if delay.is_zero() {
                queues.enqueue(queue.to_string(), payload.to_string(), priority);
            } else {
                queues.delayed.push(Delayed {
                    visible_at: Instant::now() + delay,
                    queue: queue.to_string(),
                    priority,
                    payload: payload.to_string(),
                });
            }
        }
        self.shared.pushed.notify_waiters();
        Ok(())
    }

    async fn pop(&mut self, queue: &str, wait: Duration) -> Result<Option<String>, AppError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (item, next_visible) = self.try_pop(queue).await;
            if item.is_some() {
                return Ok(item);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn list_queues(&mut self, prefix: &str) -> Result<Vec<String>, AppError> {
        let mut queues = self.shared.queues.lock().await;
        queues.promote_due(Instant::now());
        let mut names: Vec<String> = queues
            .ready
            .iter()
            .filter(|(name, items)| name.starts_with(prefix) && !items.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn queue_len(&mut self, queue: &str) -> Result<usize, AppError> {
        let mut queues = self.shared.queues.lock().await;
        queues.promote_due(Instant::now());
        Ok(queues.ready.get(queue).map_or(0, VecDeque::len))
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Broker>, AppError> {
        Ok(Box::new(self.clone()))
    }
}

#[derive(Debug, Default)]
struct Records {
    next_id: i64,
    rows: BTreeMap<i64, NotificationRequest>,
}

/// In-memory delayed notification store. Ids increase in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Records>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, id: i64) -> Option<NotificationRequest> {
        self.records.lock().await.rows.get(&id).cloned()
    }
}

#[async_trait]
impl NotifyStore for MemoryStore {
    async fn insert(&self, request: &NotificationRequest) -> Result<i64, AppError> {
        let mut records = self.records.lock().await;
        records.next_id += 1;
        let id = records.next_id;
        let mut stored = request.clone();
        stored.send_immediate = false;
        records.rows.insert(id, stored);
        Ok(id)
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<StoredNotification>, AppError> {
        let records = self.records.lock().await;
        Ok(records
            .rows
            .iter()
            .filter(|(_, r)| r.scheduled_time.is_some_and(|at| at <= now))
            .map(|(id, r)| StoredNotification {
                id: *id,
                request: r.clone(),
            })
            .collect())
    }

    async fn find_by_external_key(
        &self,
        key: &str,
    ) -> Result<Option<StoredNotification>, AppError> {
        let records = self.records.lock().await;
        Ok(records
            .rows
            .iter()
            .find(|(_, r)| r.external_key.as_deref() == Some(key))
            .map(|(id, r)| StoredNotification {
                id: *id,
                request: r.clone(),
            }))
    }

    async fn delete_by_id(&self, id: i64) -> Result<(), AppError> {
        self.records.lock().await.rows.remove(&id);
        Ok(())
    }
}
