//! Notification submission routes.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{delete, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use hookrelay_common::error::AppError;
use hookrelay_notifier::{NotifyMessage, Submission};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(create_notification))
        .route(
            "/api/notifications/{external_key}/trigger",
            post(trigger_notification),
        )
        .route("/api/notifications/{external_key}", delete(cancel_notification))
}

/// Request body of `POST /api/notifications`. Only `url` is required; every
/// other field falls back to the builder default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationParams {
    pub url: String,
    pub method: Option<String>,
    pub content_type: Option<String>,
    pub data: Option<Value>,
    pub caller: Option<String>,
    /// Kept loose so a non-boolean value is reported as an invalid argument.
    pub send_immediate: Option<Value>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub need_response: Option<bool>,
    pub expect_response: Option<String>,
    pub run_once: Option<bool>,
    pub routing_key: Option<String>,
    pub group: Option<String>,
    pub external_key: Option<String>,
}

impl CreateNotificationParams {
    pub fn into_message(self) -> Result<NotifyMessage, AppError> {
        let mut message = NotifyMessage::create(self.url);

        if let Some(method) = self.method {
            message = message.method(method.parse()?);
        }
        if let Some(content_type) = self.content_type {
            message = message.content_type(content_type.parse()?);
        }
        if let Some(data) = self.data {
            message = message.data(data)?;
        }
        if let Some(caller) = self.caller {
            message = message.caller(caller)?;
        }
        if let Some(send_immediate) = self.send_immediate {
            let Value::Bool(send_immediate) = send_immediate else {
                return Err(AppError::InvalidArgument(
                    "sendImmediate must be a boolean".to_string(),
                ));
            };
            message = message.send_immediate(send_immediate);
        }
        if let Some(at) = self.scheduled_time {
            message = message.scheduled_time(at);
        }
        if let Some(need_response) = self.need_response {
            message = message.need_response(need_response);
        }
        if let Some(expect_response) = self.expect_response {
            message = message.expect_response(expect_response);
        }
        if let Some(run_once) = self.run_once {
            message = message.run_once(run_once);
        }
        if let Some(group) = self.group {
            message = message.group(group);
        }
        if let Some(routing_key) = self.routing_key {
            message = message.routing_key(routing_key)?;
        }
        if let Some(external_key) = self.external_key {
            message = message.external_key(external_key)?;
        }

        Ok(message)
    }
}

/// POST /api/notifications — Queue or store a notification.
async fn create_notification(
    State(state): State<AppState>,
    Json(params): Json<CreateNotificationParams>,
) -> Result<Json<Value>, AppError> {
    let submission = state.agent.add_message(params.into_message()?).await?;
    Ok(Json(match submission {
        Submission::Queued => json!({ "queued": true }),
        Submission::Stored(id) => json!({ "queued": false, "id": id }),
    }))
}

/// POST /api/notifications/{external_key}/trigger — Release a stored
/// notification now. An optional JSON body is merged into its payload.
async fn trigger_notification(
    State(state): State<AppState>,
    Path(external_key): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let merge_data = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)?
    };

    if state.agent.trigger_notify(&external_key, merge_data).await? {
        Ok(Json(json!({ "triggered": true })))
    } else {
        Err(AppError::NotFound(format!(
            "Notification {} not found",
            external_key
        )))
    }
}

/// DELETE /api/notifications/{external_key} — Cancel a stored notification.
async fn cancel_notification(
    State(state): State<AppState>,
    Path(external_key): Path<String>,
) -> Result<Json<Value>, AppError> {
    if state.agent.cancel_notify(&external_key).await? {
        Ok(Json(json!({ "cancelled": true })))
    } else {
        Err(AppError::NotFound(format!(
            "Notification {} not found",
            external_key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookrelay_common::types::{ContentType, HttpMethod};

    fn params(body: Value) -> CreateNotificationParams {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_params_map_onto_builder() {
        let request = params(json!({
            "url": "http://x/test",
            "method": "get",
            "contentType": "application/x-www-form-urlencoded",
            "data": {"a": 1},
            "needResponse": false,
            "group": "g1"
        }))
        .into_message()
        .unwrap()
        .finalize()
        .unwrap();

        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.content_type, ContentType::Form);
        assert_eq!(request.data, "a=1");
        assert!(!request.need_response);
        assert_eq!(
            request.routing_key,
            hookrelay_notifier::message::routing_key("http://x/test", Some("g1"))
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for body in [
            json!({"url": "http://x", "method": "PUT"}),
            json!({"url": "http://x", "contentType": "text/plain"}),
            json!({"url": "http://x", "sendImmediate": "yes"}),
            json!({"url": "http://x", "caller": ""}),
            json!({"url": "http://x", "data": 3}),
            json!({"url": "http://x", "routingKey": "PROCESS_DB"}),
            json!({"url": "http://x", "routingKey": "notify"}),
        ] {
            let err = params(body).into_message().unwrap_err();
            assert!(err.is_validation(), "unexpected error: {}", err);
        }
    }
}
