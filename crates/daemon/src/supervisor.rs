//! Supervisor: routes the fan-in queue onto per-key queues and keeps one
//! worker alive per non-empty routing queue, plus the delayed-dispatch poller.
//!
//! The pool map is owned here and only mutated by the supervisor task. Unit
//! exits arrive over an mpsc channel and reaping them is the only place a
//! pool entry is removed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use hookrelay_common::broker::{Broker, BrokerConnector};
use hookrelay_common::config::AppConfig;
use hookrelay_common::error::AppError;
use hookrelay_common::store::NotifyStore;
use hookrelay_common::types::{
    DEFAULT_PRIORITY, FANIN_QUEUE, POLLER_KEY, ROUTING_KEY_PREFIX, is_reserved_key,
};
use hookrelay_notifier::delivery::DeliveryEngine;

use crate::poller::DelayedDispatchPoller;
use crate::worker::{Lifeline, RoutingWorker, WorkerExit};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Bounded wait of one fan-in pop.
    pub pop_wait: Duration,
    /// How long a routing worker waits on an empty queue before exiting.
    pub worker_idle: Duration,
    /// Maximum fan-in items routed per iteration.
    pub drain_batch: usize,
    /// Pause after the fan-in queue ran dry.
    pub loop_sleep: Duration,
    pub poller_respawn: Duration,
    pub poller_scan: Duration,
    pub poller_tick: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pop_wait: Duration::from_secs(5),
            worker_idle: Duration::from_secs(5),
            drain_batch: 100,
            loop_sleep: Duration::from_millis(300),
            poller_respawn: Duration::from_secs(60),
            poller_scan: Duration::from_secs(30),
            poller_tick: Duration::from_millis(500),
        }
    }
}

impl From<&AppConfig> for SupervisorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            pop_wait: config.pop_wait(),
            worker_idle: config.worker_idle(),
            drain_batch: config.drain_batch.max(1),
            poller_respawn: config.poller_respawn(),
            poller_scan: config.poller_scan(),
            ..Self::default()
        }
    }
}

/// How the supervisor terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Graceful shutdown completed.
    Shutdown,
    /// The main loop hit an error; units were drained before exiting.
    Failed,
}

impl SupervisorExit {
    pub fn code(&self) -> i32 {
        match self {
            SupervisorExit::Shutdown => 138,
            SupervisorExit::Failed => 69,
        }
    }
}

type UnitExit = (String, WorkerExit);

pub struct Supervisor {
    connector: Arc<dyn BrokerConnector>,
    store: Arc<dyn NotifyStore>,
    engine: DeliveryEngine,
    config: SupervisorConfig,
    /// Active units by routing key (or [`POLLER_KEY`]), with their spawn time.
    pool: HashMap<String, Instant>,
    lifeline: watch::Sender<()>,
    retire_poller: watch::Sender<bool>,
    exits_tx: mpsc::UnboundedSender<UnitExit>,
    exits_rx: mpsc::UnboundedReceiver<UnitExit>,
    last_poller_spawn: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        store: Arc<dyn NotifyStore>,
        engine: DeliveryEngine,
        config: SupervisorConfig,
    ) -> Self {
        let (lifeline, _) = watch::channel(());
        let (retire_poller, _) = watch::channel(false);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();

        Self {
            connector,
            store,
            engine,
            config,
            pool: HashMap::new(),
            lifeline,
            retire_poller,
            exits_tx,
            exits_rx,
            last_poller_spawn: None,
        }
    }

    /// Run until `shutdown` flips to `true` or the main loop fails, then
    /// drain every unit. Dropping the returned future without awaiting it
    /// to completion orphans the running units.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SupervisorExit {
        tracing::info!(
            pop_wait_ms = self.config.pop_wait.as_millis() as u64,
            drain_batch = self.config.drain_batch,
            "Supervisor starting"
        );

        let mut broker = match self.connector.connect().await {
            Ok(broker) => broker,
            Err(e) => {
                tracing::error!(error = %e, "Supervisor failed to connect to the broker");
                return SupervisorExit::Failed;
            }
        };

        let exit = match self.run_loop(broker.as_mut(), &mut shutdown).await {
            Ok(()) => {
                tracing::info!("Shutdown requested, draining units");
                SupervisorExit::Shutdown
            }
            Err(e) => {
                tracing::error!(error = %e, "Supervisor loop failed, draining units");
                SupervisorExit::Failed
            }
        };

        self.drain().await;
        drop(broker);

        tracing::info!(code = exit.code(), "Supervisor terminated");
        exit
    }

    async fn run_loop(
        &mut self,
        broker: &mut dyn Broker,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), AppError> {
        self.recover(broker).await?;

        loop {
            self.reap_exited(broker).await?;
            if *shutdown.borrow() {
                return Ok(());
            }

            self.ensure_poller().await?;

            for _ in 0..self.config.drain_batch {
                let Some(raw) = broker.pop(FANIN_QUEUE, self.config.pop_wait).await? else {
                    break;
                };
                self.route(broker, &raw).await?;

                self.reap_exited(broker).await?;
                if *shutdown.borrow() {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.loop_sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Resume routing queues left non-empty by a previous run.
    async fn recover(&mut self, broker: &mut dyn Broker) -> Result<(), AppError> {
        let queues = broker.list_queues(ROUTING_KEY_PREFIX).await?;
        for key in queues {
            if !self.pool.contains_key(&key) {
                tracing::info!(routing_key = %key, "Resuming routing queue");
                self.spawn_worker(key).await?;
            }
        }
        Ok(())
    }

    async fn route(&mut self, broker: &mut dyn Broker, raw: &str) -> Result<(), AppError> {
        let routing_key = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => value
                .get("routingKey")
                .and_then(serde_json::Value::as_str)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping fan-in item that is not valid JSON");
                return Ok(());
            }
        };
        let Some(routing_key) = routing_key else {
            tracing::warn!("Skipping fan-in item without a routing key");
            return Ok(());
        };
        if is_reserved_key(&routing_key) {
            tracing::warn!(
                routing_key = %routing_key,
                "Skipping fan-in item with a reserved routing key"
            );
            return Ok(());
        }

        broker
            .push(&routing_key, raw, DEFAULT_PRIORITY, Duration::ZERO)
            .await?;

        if !self.pool.contains_key(&routing_key) {
            self.spawn_worker(routing_key).await?;
        }
        Ok(())
    }

    async fn ensure_poller(&mut self) -> Result<(), AppError> {
        if self.pool.contains_key(POLLER_KEY) {
            return Ok(());
        }
        if self
            .last_poller_spawn
            .is_some_and(|at| at.elapsed() < self.config.poller_respawn)
        {
            return Ok(());
        }

        let poller = DelayedDispatchPoller::new(
            self.connector.connect().await?,
            self.store.clone(),
            self.new_lifeline(),
            self.retire_poller.subscribe(),
            self.config.poller_tick,
            self.config.poller_scan,
        );
        self.last_poller_spawn = Some(Instant::now());
        self.spawn_unit(POLLER_KEY.to_string(), poller.run());
        Ok(())
    }

    async fn spawn_worker(&mut self, routing_key: String) -> Result<(), AppError> {
        let worker = RoutingWorker::new(
            routing_key.clone(),
            self.connector.connect().await?,
            self.engine.clone(),
            self.new_lifeline(),
            self.config.worker_idle,
        );
        self.spawn_unit(routing_key, worker.run());
        Ok(())
    }

    /// Run a unit on its own task. A watcher task reports its exit, counting
    /// a panic as [`WorkerExit::Failed`].
    fn spawn_unit<F>(&mut self, key: String, unit: F)
    where
        F: Future<Output = WorkerExit> + Send + 'static,
    {
        let handle = tokio::spawn(unit);
        let exits = self.exits_tx.clone();
        let watched = key.clone();
        tokio::spawn(async move {
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(e) => {
                    tracing::error!(key = %watched, error = %e, "Unit panicked");
                    WorkerExit::Failed
                }
            };
            // The supervisor may already be gone; the exit is then unobserved.
            let _ = exits.send((watched, exit));
        });

        tracing::debug!(key = %key, "Unit spawned");
        self.pool.insert(key, Instant::now());
    }

    fn new_lifeline(&self) -> Lifeline {
        Lifeline::new(self.lifeline.subscribe())
    }

    /// Handle pending exit notifications. A routing queue that received work
    /// after its worker idled out gets a fresh worker.
    async fn reap_exited(&mut self, broker: &mut dyn Broker) -> Result<(), AppError> {
        while let Ok((key, exit)) = self.exits_rx.try_recv() {
            self.reap(&key, exit);

            if key != POLLER_KEY
                && exit != WorkerExit::Orphaned
                && !self.pool.contains_key(&key)
                && broker.queue_len(&key).await? > 0
            {
                tracing::debug!(routing_key = %key, "Routing queue refilled, respawning worker");
                self.spawn_worker(key).await?;
            }
        }
        Ok(())
    }

    fn reap(&mut self, key: &str, exit: WorkerExit) {
        let uptime_ms = self
            .pool
            .remove(key)
            .map(|spawned| spawned.elapsed().as_millis() as u64);

        match exit {
            WorkerExit::Failed => {
                tracing::error!(key, code = exit.code(), ?uptime_ms, "Unit failed")
            }
            _ => tracing::debug!(key, code = exit.code(), %exit, ?uptime_ms, "Unit exited"),
        }
    }

    /// Retire the poller and wait for every unit to be reaped.
    async fn drain(&mut self) {
        self.retire_poller.send_replace(true);

        while !self.pool.is_empty() {
            tracing::debug!(remaining = self.pool.len(), "Waiting for units to exit");
            match self.exits_rx.recv().await {
                Some((key, exit)) => self.reap(&key, exit),
                None => break,
            }
        }
    }
}
