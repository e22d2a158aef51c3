//! Submission entry point used by producers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use hookrelay_common::broker::{Broker, BrokerConnector};
use hookrelay_common::error::AppError;
use hookrelay_common::store::NotifyStore;
use hookrelay_common::types::{
    DEFAULT_PRIORITY, FANIN_QUEUE, NotificationRequest, is_reserved_key,
};

use crate::codec;
use crate::message::NotifyMessage;

/// Where a submitted notification went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Pushed on the fan-in queue for immediate delivery.
    Queued,
    /// Held in the store under the given id until due or triggered.
    Stored(i64),
}

pub struct NotifyAgent {
    broker: Mutex<Box<dyn Broker>>,
    store: Arc<dyn NotifyStore>,
}

impl NotifyAgent {
    pub fn new(broker: Box<dyn Broker>, store: Arc<dyn NotifyStore>) -> Self {
        Self {
            broker: Mutex::new(broker),
            store,
        }
    }

    /// Open a dedicated broker connection for this agent.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        store: Arc<dyn NotifyStore>,
    ) -> Result<Self, AppError> {
        Ok(Self::new(connector.connect().await?, store))
    }

    pub async fn add_message(&self, message: NotifyMessage) -> Result<Submission, AppError> {
        self.add_notify(message.finalize()?).await
    }

    /// Queue a notification now, or store it for its scheduled time or an
    /// external trigger.
    pub async fn add_notify(&self, mut request: NotificationRequest) -> Result<Submission, AppError> {
        if request.routing_key.is_empty() || is_reserved_key(&request.routing_key) {
            return Err(AppError::InvalidArgument(format!(
                "invalid routing key '{}'",
                request.routing_key
            )));
        }
        if !request.need_response {
            request.run_once = true;
        }
        if request.is_scheduled_after(chrono::Utc::now()) {
            request.send_immediate = false;
        }
        if !request.has_dispatch_timing() {
            return Err(AppError::PreconditionViolation(
                "must specify a sending time".to_string(),
            ));
        }

        if request.send_immediate {
            self.enqueue(&request).await?;
            tracing::debug!(
                url = %request.url,
                routing_key = %request.routing_key,
                "Notification queued"
            );
            return Ok(Submission::Queued);
        }

        let id = self.store.insert(&request).await?;
        tracing::debug!(
            id,
            url = %request.url,
            scheduled_time = ?request.scheduled_time,
            external_key = ?request.external_key,
            "Notification stored for later dispatch"
        );
        Ok(Submission::Stored(id))
    }

    /// Release a stored notification now, merging `merge_data` into its
    /// payload. Returns `false` when no record carries `external_key`.
    pub async fn trigger_notify(
        &self,
        external_key: &str,
        merge_data: Value,
    ) -> Result<bool, AppError> {
        let Some(stored) = self.store.find_by_external_key(external_key).await? else {
            return Ok(false);
        };

        let mut request = stored.request;
        if !merge_data.is_null() {
            let mut payload = codec::parse(&request.data, request.content_type)?;
            codec::deep_merge(&mut payload, merge_data);
            request.data = codec::stringify(&payload, request.content_type)?;
        }
        request.send_immediate = true;

        self.enqueue(&request).await?;
        self.store.delete_by_id(stored.id).await?;

        tracing::info!(
            id = stored.id,
            external_key,
            routing_key = %request.routing_key,
            "Notification triggered"
        );
        Ok(true)
    }

    /// Drop a stored notification. Returns `false` when no record carries
    /// `external_key`.
    pub async fn cancel_notify(&self, external_key: &str) -> Result<bool, AppError> {
        let Some(stored) = self.store.find_by_external_key(external_key).await? else {
            return Ok(false);
        };

        self.store.delete_by_id(stored.id).await?;
        tracing::info!(id = stored.id, external_key, "Notification cancelled");
        Ok(true)
    }

    async fn enqueue(&self, request: &NotificationRequest) -> Result<(), AppError> {
        let payload = request.to_json()?;
        self.broker
            .lock()
            .await
            .push(FANIN_QUEUE, &payload, DEFAULT_PRIORITY, std::time::Duration::ZERO)
            .await
    }
}
