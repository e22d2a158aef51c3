//! Per-routing-key delivery worker.

use std::time::Duration;

use tokio::sync::watch;

use hookrelay_common::broker::Broker;
use hookrelay_common::error::AppError;
use hookrelay_common::types::NotificationRequest;
use hookrelay_notifier::delivery::{DeliveryEngine, DeliveryOutcome};

/// How a supervised unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue stayed empty for the idle window.
    Drained,
    /// The supervisor went away.
    Orphaned,
    /// An error (or a panic) ended the unit.
    Failed,
    /// Asked to stop by the supervisor while draining.
    Retired,
}

impl WorkerExit {
    pub fn code(&self) -> i32 {
        match self {
            WorkerExit::Drained => 0,
            WorkerExit::Orphaned => 1,
            WorkerExit::Failed => 69,
            WorkerExit::Retired => 143,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerExit::Drained => write!(f, "drained"),
            WorkerExit::Orphaned => write!(f, "orphaned"),
            WorkerExit::Failed => write!(f, "failed"),
            WorkerExit::Retired => write!(f, "retired"),
        }
    }
}

/// Liveness link to the supervisor. The supervisor keeps the sending half;
/// once it is dropped every holder of a `Lifeline` is orphaned.
#[derive(Debug, Clone)]
pub struct Lifeline {
    rx: watch::Receiver<()>,
}

impl Lifeline {
    pub fn new(rx: watch::Receiver<()>) -> Self {
        Self { rx }
    }

    pub fn is_orphaned(&self) -> bool {
        self.rx.has_changed().is_err()
    }
}

/// Delivers the notifications of one routing queue strictly one at a time.
pub struct RoutingWorker {
    routing_key: String,
    broker: Box<dyn Broker>,
    engine: DeliveryEngine,
    lifeline: Lifeline,
    idle: Duration,
}

impl RoutingWorker {
    pub fn new(
        routing_key: String,
        broker: Box<dyn Broker>,
        engine: DeliveryEngine,
        lifeline: Lifeline,
        idle: Duration,
    ) -> Self {
        Self {
            routing_key,
            broker,
            engine,
            lifeline,
            idle,
        }
    }

    pub async fn run(mut self) -> WorkerExit {
        tracing::debug!(routing_key = %self.routing_key, "Routing worker started");

        loop {
            let raw = match self.broker.pop(&self.routing_key, self.idle).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::debug!(routing_key = %self.routing_key, "Routing queue drained");
                    return WorkerExit::Drained;
                }
                Err(e) => {
                    tracing::error!(
                        routing_key = %self.routing_key,
                        error = %e,
                        "Failed to pop from routing queue"
                    );
                    return WorkerExit::Failed;
                }
            };

            if let Err(e) = self.deliver(&raw).await {
                tracing::error!(
                    routing_key = %self.routing_key,
                    error = %e,
                    "Routing worker failed"
                );
                return WorkerExit::Failed;
            }

            if self.lifeline.is_orphaned() {
                tracing::warn!(
                    routing_key = %self.routing_key,
                    "Supervisor is gone, routing worker exiting"
                );
                return WorkerExit::Orphaned;
            }
        }
    }

    async fn deliver(&mut self, raw: &str) -> Result<DeliveryOutcome, AppError> {
        let request = NotificationRequest::from_json(raw)?;
        let outcome = self.engine.send(self.broker.as_mut(), request).await?;
        tracing::debug!(routing_key = %self.routing_key, ?outcome, "Notification processed");
        Ok(outcome)
    }
}
