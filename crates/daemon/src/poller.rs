use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

use hookrelay_common::broker::Broker;
use hookrelay_common::error::AppError;
use hookrelay_common::store::NotifyStore;
use hookrelay_common::types::{DEFAULT_PRIORITY, FANIN_QUEUE};

use crate::worker::{Lifeline, WorkerExit};

/// Moves delayed notifications whose scheduled time has passed from the
/// store onto the fan-in queue.
pub struct DelayedDispatchPoller {
    broker: Box<dyn Broker>,
    store: Arc<dyn NotifyStore>,
    lifeline: Lifeline,
    retire: watch::Receiver<bool>,
    tick: Duration,
    scan_interval: Duration,
}

impl DelayedDispatchPoller {
    pub fn new(
        broker: Box<dyn Broker>,
        store: Arc<dyn NotifyStore>,
        lifeline: Lifeline,
        retire: watch::Receiver<bool>,
        tick: Duration,
        scan_interval: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            lifeline,
            retire,
            tick,
            scan_interval,
        }
    }

    /// Tick until retired or orphaned. Scans run on the first tick and then
    /// whenever `scan_interval` has elapsed since the previous one.
    pub async fn run(mut self) -> WorkerExit {
        tracing::info!(
            tick_ms = self.tick.as_millis() as u64,
            scan_interval_secs = self.scan_interval.as_secs(),
            "Delayed-dispatch poller started"
        );

        let mut last_scan: Option<Instant> = None;
        loop {
            if self.lifeline.is_orphaned() {
                tracing::warn!("Supervisor is gone, delayed-dispatch poller exiting");
                return WorkerExit::Orphaned;
            }
            if *self.retire.borrow() {
                tracing::info!("Delayed-dispatch poller retired");
                return WorkerExit::Retired;
            }

            if last_scan.is_none_or(|at| at.elapsed() >= self.scan_interval) {
                last_scan = Some(Instant::now());
                if let Err(e) = self.scan().await {
                    tracing::error!(error = %e, "Delayed-dispatch scan failed");
                    return WorkerExit::Failed;
                }
            }

            tokio::time::sleep(self.tick).await;
        }
    }

    /// Release every due record: enqueue first, then delete, so a crash in
    /// between duplicates rather than loses a notification.
    pub async fn scan(&mut self) -> Result<usize, AppError> {
        let due = self.store.find_due(Utc::now()).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let count = due.len();
        for stored in due {
            let mut request = stored.request;
            request.send_immediate = true;

            self.broker
                .push(FANIN_QUEUE, &request.to_json()?, DEFAULT_PRIORITY, Duration::ZERO)
                .await?;
            self.store.delete_by_id(stored.id).await?;

            tracing::debug!(
                id = stored.id,
                routing_key = %request.routing_key,
                "Delayed notification released"
            );
        }

        tracing::info!(count, "Released due delayed notifications");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration};
    use hookrelay_common::memory::{MemoryBroker, MemoryStore};
    use hookrelay_common::types::NotificationRequest;
    use hookrelay_notifier::message::NotifyMessage;

    use super::*;

    fn scheduled(id: u32, at: DateTime<Utc>) -> NotificationRequest {
        let mut request = NotifyMessage::create("http://x/test")
            .data(serde_json::json!({ "id": id }))
            .unwrap()
            .scheduled_time(at)
            .finalize()
            .unwrap();
        request.send_immediate = false;
        request
    }

    fn poller(
        broker: &MemoryBroker,
        store: &MemoryStore,
    ) -> (DelayedDispatchPoller, watch::Sender<()>, watch::Sender<bool>) {
        let (life_tx, life_rx) = watch::channel(());
        let (retire_tx, retire_rx) = watch::channel(false);
        let poller = DelayedDispatchPoller::new(
            Box::new(broker.clone()),
            Arc::new(store.clone()),
            Lifeline::new(life_rx),
            retire_rx,
            Duration::from_millis(10),
            Duration::from_secs(30),
        );
        (poller, life_tx, retire_tx)
    }

    #[tokio::test]
    async fn test_scan_releases_only_due_records_in_order() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert(&scheduled(1, now - ChronoDuration::seconds(5))).await.unwrap();
        let future = store.insert(&scheduled(2, now + ChronoDuration::hours(1))).await.unwrap();
        store.insert(&scheduled(3, now - ChronoDuration::seconds(1))).await.unwrap();

        let (mut poller, _life, _retire) = poller(&broker, &store);
        assert_eq!(poller.scan().await.unwrap(), 2);

        let queued: Vec<_> = broker
            .snapshot(FANIN_QUEUE)
            .await
            .iter()
            .map(|raw| NotificationRequest::from_json(raw).unwrap())
            .collect();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].data, r#"{"id":1}"#);
        assert_eq!(queued[1].data, r#"{"id":3}"#);
        assert!(queued.iter().all(|r| r.send_immediate));

        assert_eq!(store.len().await, 1);
        assert!(store.get(future).await.is_some());
    }

    #[tokio::test]
    async fn test_first_scan_is_immediate_and_retire_stops_it() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        store
            .insert(&scheduled(1, Utc::now() - ChronoDuration::seconds(1)))
            .await
            .unwrap();

        let (poller, _life, retire) = poller(&broker, &store);
        let handle = tokio::spawn(poller.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.snapshot(FANIN_QUEUE).await.len(), 1);
        assert!(store.is_empty().await);

        retire.send_replace(true);
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Retired);
    }

    #[tokio::test]
    async fn test_poller_detects_orphaning() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let (poller, life, _retire) = poller(&broker, &store);
        let handle = tokio::spawn(poller.run());

        drop(life);
        let exit = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Orphaned);
    }
}
