//! Delivery engine: one HTTP attempt, status evaluation, audit logging and
//! retry scheduling.
//!
//! Retries go back through the fan-in queue with broker-side delay
//! `MAX_RETRY_TIMES * 2^retry_count` seconds (18s, 36s, ... ~77 min), at most
//! `MAX_RETRY_TIMES` times.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use hookrelay_common::broker::Broker;
use hookrelay_common::error::AppError;
use hookrelay_common::types::{
    DeliveryStatus, FANIN_QUEUE, MAX_RETRY_TIMES, NotificationRequest, RETRY_PRIORITY,
};

use crate::transport::HttpTransport;

/// Timeout for fire-and-forget notifications.
pub const NO_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout when a response is awaited; receivers may run long jobs inline.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3600);

/// What happened to a notification after one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The attempt succeeded.
    Delivered,
    /// The attempt failed and the notification allows a single attempt.
    Failed,
    /// The attempt failed and the retry budget is spent.
    Exhausted,
    /// The attempt failed and another one is scheduled.
    Retrying { retry_count: u32, delay: Duration },
}

impl DeliveryOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryOutcome::Retrying { .. })
    }
}

/// Audit entry written after every attempt.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord<'a> {
    #[serde(flatten)]
    pub request: &'a NotificationRequest,
    pub actual_response: &'a str,
    pub status: DeliveryStatus,
    /// Wall-clock duration of the HTTP call, in milliseconds.
    pub duration: u64,
}

pub fn effective_timeout(request: &NotificationRequest) -> Duration {
    if request.need_response {
        RESPONSE_TIMEOUT
    } else {
        NO_RESPONSE_TIMEOUT
    }
}

/// Fire-and-forget notifications always succeed; otherwise the trimmed body
/// must contain the expected response, ignoring case.
pub fn evaluate_status(request: &NotificationRequest, actual_response: &str) -> DeliveryStatus {
    if !request.need_response {
        return DeliveryStatus::Success;
    }

    let body = actual_response.trim().to_lowercase();
    let expected = request.expect_response.to_lowercase();
    if body.contains(&expected) {
        DeliveryStatus::Success
    } else {
        DeliveryStatus::Failure
    }
}

/// Broker delay before the attempt numbered `retry_count`.
pub fn retry_delay(retry_count: u32) -> Duration {
    Duration::from_secs(u64::from(MAX_RETRY_TIMES) * 2u64.pow(retry_count))
}

macro_rules! audit {
    ($level:ident, $record:expr, $json:expr) => {
        tracing::$level!(
            target: "notify_agent",
            caller = %$record.request.caller,
            url = %$record.request.url,
            method = %$record.request.method,
            content_type = %$record.request.content_type,
            routing_key = %$record.request.routing_key,
            external_key = ?$record.request.external_key,
            retry_count = $record.request.retry_count,
            need_response = $record.request.need_response,
            run_once = $record.request.run_once,
            expect_response = %$record.request.expect_response,
            status = %$record.status,
            duration_ms = $record.duration,
            record = %$json,
            "Notification delivery attempt"
        )
    };
}

/// Sends notifications and decides whether they are retried.
#[derive(Clone)]
pub struct DeliveryEngine {
    transport: Arc<dyn HttpTransport>,
}

impl DeliveryEngine {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Deliver `request` once. Failures that may be retried are pushed back on
    /// the fan-in queue through `broker`.
    pub async fn send(
        &self,
        broker: &mut dyn Broker,
        request: NotificationRequest,
    ) -> Result<DeliveryOutcome, AppError> {
        let started = Instant::now();
        let actual_response = self
            .transport
            .request(
                &request.url,
                &request.data,
                request.method,
                effective_timeout(&request),
                request.content_type,
            )
            .await;
        let duration = started.elapsed();

        let status = evaluate_status(&request, &actual_response);
        Self::audit(&DeliveryRecord {
            request: &request,
            actual_response: &actual_response,
            status,
            duration: duration.as_millis() as u64,
        });

        if status == DeliveryStatus::Success {
            return Ok(DeliveryOutcome::Delivered);
        }
        if request.run_once {
            return Ok(DeliveryOutcome::Failed);
        }

        self.retry(broker, request).await
    }

    async fn retry(
        &self,
        broker: &mut dyn Broker,
        mut request: NotificationRequest,
    ) -> Result<DeliveryOutcome, AppError> {
        if request.retry_count >= MAX_RETRY_TIMES {
            tracing::error!(
                target: "notify_agent",
                url = %request.url,
                routing_key = %request.routing_key,
                retry_count = request.retry_count,
                "Retry budget exhausted, dropping notification"
            );
            return Ok(DeliveryOutcome::Exhausted);
        }

        request.retry_count += 1;
        let delay = retry_delay(request.retry_count);

        broker
            .push(FANIN_QUEUE, &request.to_json()?, RETRY_PRIORITY, delay)
            .await?;

        tracing::info!(
            url = %request.url,
            routing_key = %request.routing_key,
            retry_count = request.retry_count,
            delay_secs = delay.as_secs(),
            "Notification retry scheduled"
        );

        Ok(DeliveryOutcome::Retrying {
            retry_count: request.retry_count,
            delay,
        })
    }

    fn audit(record: &DeliveryRecord<'_>) {
        let json = serde_json::to_string(record).unwrap_or_default();
        match record.status {
            DeliveryStatus::Success => audit!(info, record, json),
            DeliveryStatus::Failure => audit!(error, record, json),
        }
    }
}
