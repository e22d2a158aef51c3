use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Name of the shared queue every immediate, retried or triggered notification
/// lands on before it is routed.
pub const FANIN_QUEUE: &str = "notify";

/// Prefix of every derived routing key (and therefore of every routing queue).
pub const ROUTING_KEY_PREFIX: &str = "Q_";

/// Reserved pool key of the delayed-dispatch poller.
pub const POLLER_KEY: &str = "PROCESS_DB";

/// Whether `key` names one of the daemon's own queues and so cannot be used
/// as a routing key.
pub fn is_reserved_key(key: &str) -> bool {
    key == FANIN_QUEUE || key == POLLER_KEY
}

/// Number of retries after which a failing notification is dropped.
pub const MAX_RETRY_TIMES: u32 = 9;

/// Broker priority for freshly submitted notifications (lower is more urgent).
pub const DEFAULT_PRIORITY: u32 = 1024;

/// Broker priority for retries, so they overtake fresh work once visible.
pub const RETRY_PRIORITY: u32 = 2;

/// HTTP method used to reach the notification target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported HTTP method '{}'",
                other
            ))),
        }
    }
}

/// Payload encoding, which is also the `Content-Type` sent to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/x-www-form-urlencoded")]
    Form,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Form => "application/x-www-form-urlencoded",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "application/json" => Ok(ContentType::Json),
            "application/x-www-form-urlencoded" => Ok(ContentType::Form),
            _ => Err(AppError::InvalidArgument(
                "unsupported Http Content-Type".to_string(),
            )),
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failure,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Success => write!(f, "success"),
            DeliveryStatus::Failure => write!(f, "failure"),
        }
    }
}

/// Yes/no flags travel as `1` (yes) and `2` (no) on the wire; plain booleans
/// are accepted when reading.
pub mod flag {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const YES: u8 = 1;
    pub const NO: u8 = 2;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(if *value { YES } else { NO })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Int(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => Ok(b),
            Raw::Int(1) => Ok(true),
            Raw::Int(2) => Ok(false),
            Raw::Int(other) => Err(D::Error::custom(format!(
                "flag can only be 1 or 2, got {}",
                other
            ))),
        }
    }
}

fn default_caller() -> String {
    "unknown".to_string()
}

fn default_true() -> bool {
    true
}

fn default_expect_response() -> String {
    "success".to_string()
}

/// The unit of work travelling through queues and the delayed store.
///
/// `data` is already serialized per `content_type`; only the delivering side
/// parses it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(default = "default_caller")]
    pub caller: String,
    pub url: String,
    pub method: HttpMethod,
    pub content_type: ContentType,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default = "default_true", with = "flag")]
    pub send_immediate: bool,
    #[serde(default = "default_true", with = "flag")]
    pub need_response: bool,
    #[serde(default = "default_true", with = "flag")]
    pub run_once: bool,
    #[serde(default = "default_expect_response")]
    pub expect_response: String,
    pub routing_key: String,
    #[serde(default)]
    pub external_key: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl NotificationRequest {
    /// Whether the request names at least one way of being dispatched.
    pub fn has_dispatch_timing(&self) -> bool {
        self.send_immediate
            || self.scheduled_time.is_some()
            || self.external_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Whether a scheduled time lies strictly after `now`.
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.is_some_and(|at| at > now)
    }

    pub fn to_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A notification held in the durable store until it is due or triggered.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredNotification {
    pub id: i64,
    pub request: NotificationRequest,
}
