//! Notification builder.
//!
//! `NotifyMessage::create(url)` starts from the defaults every caller gets
//! unless they override them: `POST`, JSON, immediate dispatch, a response
//! containing `"success"` expected, and a single attempt.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use hookrelay_common::error::AppError;
use hookrelay_common::types::{
    ContentType, HttpMethod, NotificationRequest, ROUTING_KEY_PREFIX, is_reserved_key,
};

use crate::codec;

/// Derive the routing key of a target.
///
/// Every notification sharing a key is delivered strictly one at a time;
/// tagging the same URL with different groups lets them proceed concurrently.
pub fn routing_key(url: &str, group: Option<&str>) -> String {
    let seed = match group.filter(|g| !g.is_empty()) {
        Some(group) => format!("{}_{}", url, group),
        None => url.to_string(),
    };
    let digest = Sha256::digest(seed.as_bytes());
    format!("{}{}", ROUTING_KEY_PREFIX, hex::encode_upper(digest))
}

/// Mutable description of a notification, turned into a
/// [`NotificationRequest`] by [`NotifyMessage::finalize`].
#[derive(Debug, Clone)]
pub struct NotifyMessage {
    caller: String,
    url: String,
    method: HttpMethod,
    content_type: ContentType,
    data: Value,
    send_immediate: bool,
    scheduled_time: Option<DateTime<Utc>>,
    need_response: bool,
    expect_response: String,
    run_once: bool,
    routing_key: Option<String>,
    group: Option<String>,
    external_key: Option<String>,
}

impl NotifyMessage {
    pub fn create(url: impl Into<String>) -> Self {
        Self {
            caller: "unknown".to_string(),
            url: url.into(),
            method: HttpMethod::Post,
            content_type: ContentType::Json,
            data: Value::Object(Map::new()),
            send_immediate: true,
            scheduled_time: None,
            need_response: true,
            expect_response: "success".to_string(),
            run_once: true,
            routing_key: None,
            group: None,
            external_key: None,
        }
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Result<Self, AppError> {
        let caller = caller.into();
        if caller.trim().is_empty() {
            return Err(AppError::InvalidArgument(
                "caller must be a non-empty string".to_string(),
            ));
        }
        self.caller = caller;
        Ok(self)
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Payloads must be an object or an array so they can be form-encoded
    /// and merged on trigger.
    pub fn data(mut self, data: Value) -> Result<Self, AppError> {
        if !(data.is_object() || data.is_array()) {
            return Err(AppError::InvalidArgument(
                "data must be an object or an array".to_string(),
            ));
        }
        self.data = data;
        Ok(self)
    }

    pub fn send_immediate(mut self, send_immediate: bool) -> Self {
        self.send_immediate = send_immediate;
        self
    }

    pub fn scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn need_response(mut self, need_response: bool) -> Self {
        self.need_response = need_response;
        self
    }

    pub fn expect_response(mut self, expect_response: impl Into<String>) -> Self {
        self.expect_response = expect_response.into();
        self
    }

    pub fn run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    /// Pin an explicit routing key instead of deriving one from the URL.
    pub fn routing_key(mut self, key: impl Into<String>) -> Result<Self, AppError> {
        let key = key.into();
        if key.trim().is_empty() || key.chars().any(char::is_whitespace) {
            return Err(AppError::InvalidArgument(
                "routing key must be non-empty and contain no whitespace".to_string(),
            ));
        }
        if is_reserved_key(&key) {
            return Err(AppError::InvalidArgument(format!(
                "routing key '{}' is reserved",
                key
            )));
        }
        self.routing_key = Some(key);
        Ok(self)
    }

    /// An empty group is the same as no group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        let group = group.into();
        self.group = (!group.is_empty()).then_some(group);
        self
    }

    pub fn external_key(mut self, key: impl Into<String>) -> Result<Self, AppError> {
        let key = key.into();
        if key.is_empty() {
            return Err(AppError::InvalidArgument(
                "external key must be non-empty".to_string(),
            ));
        }
        self.external_key = Some(key);
        Ok(self)
    }

    /// Compute the routing key if unset, serialize the payload and freeze the
    /// message.
    pub fn finalize(self) -> Result<NotificationRequest, AppError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| AppError::InvalidArgument(format!("invalid url '{}': {}", self.url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::InvalidArgument(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }

        let routing_key = match self.routing_key {
            Some(key) => key,
            None => routing_key(&self.url, self.group.as_deref()),
        };
        let data = codec::stringify(&self.data, self.content_type)?;

        let request = NotificationRequest {
            caller: self.caller,
            url: self.url,
            method: self.method,
            content_type: self.content_type,
            data,
            scheduled_time: self.scheduled_time,
            send_immediate: self.send_immediate,
            need_response: self.need_response,
            run_once: self.run_once,
            expect_response: self.expect_response,
            routing_key,
            external_key: self.external_key,
            retry_count: 0,
        };

        if !request.has_dispatch_timing() {
            return Err(AppError::PreconditionViolation(
                "must specify a sending time".to_string(),
            ));
        }

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let req = NotifyMessage::create("http://x/test").finalize().unwrap();
        assert_eq!(req.caller, "unknown");
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.content_type, ContentType::Json);
        assert!(req.send_immediate);
        assert!(req.need_response);
        assert!(req.run_once);
        assert_eq!(req.expect_response, "success");
        assert_eq!(req.data, "{}");
        assert_eq!(req.retry_count, 0);
        assert_eq!(req.routing_key, routing_key("http://x/test", None));
    }

    #[test]
    fn test_routing_key_is_deterministic() {
        let a = routing_key("http://x/test", Some("g1"));
        let b = routing_key("http://x/test", Some("g1"));
        assert_eq!(a, b);
        assert!(a.starts_with("Q_"));
        assert_eq!(a.len(), 2 + 64);
        assert_eq!(&a[2..], a[2..].to_ascii_uppercase());
    }

    #[test]
    fn test_routing_key_depends_on_group() {
        let plain = routing_key("http://x/test", None);
        let g1 = routing_key("http://x/test", Some("g1"));
        let g2 = routing_key("http://x/test", Some("g2"));
        assert_ne!(plain, g1);
        assert_ne!(g1, g2);
        assert_eq!(plain, routing_key("http://x/test", Some("")));
    }

    #[test]
    fn test_group_feeds_derived_key() {
        let req = NotifyMessage::create("http://x/test")
            .group("tenant-7")
            .finalize()
            .unwrap();
        assert_eq!(req.routing_key, routing_key("http://x/test", Some("tenant-7")));
    }

    #[test]
    fn test_explicit_routing_key_wins() {
        let req = NotifyMessage::create("http://x/test")
            .group("ignored")
            .routing_key("Q_CUSTOM")
            .unwrap()
            .finalize()
            .unwrap();
        assert_eq!(req.routing_key, "Q_CUSTOM");
    }

    #[test]
    fn test_form_payload_is_serialized() {
        let req = NotifyMessage::create("http://x/test")
            .content_type(ContentType::Form)
            .data(json!({"id": 1, "name": "a b"}))
            .unwrap()
            .finalize()
            .unwrap();
        assert_eq!(req.data, "id=1&name=a+b");
    }

    #[test]
    fn test_setters_validate_eagerly() {
        assert!(NotifyMessage::create("http://x").caller("").is_err());
        assert!(NotifyMessage::create("http://x").data(json!(5)).is_err());
        assert!(NotifyMessage::create("http://x").routing_key("a b").is_err());
        assert!(NotifyMessage::create("http://x").external_key("").is_err());
    }

    #[test]
    fn test_reserved_routing_keys_are_rejected() {
        for key in ["PROCESS_DB", "notify"] {
            let err = NotifyMessage::create("http://x/test")
                .routing_key(key)
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidArgument(_)), "{} accepted", key);
        }
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let err = NotifyMessage::create("not a url").finalize().unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));

        let err = NotifyMessage::create("ftp://x/file").finalize().unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_dispatch_timing_is_rejected() {
        let err = NotifyMessage::create("http://x/test")
            .send_immediate(false)
            .finalize()
            .unwrap_err();
        assert!(matches!(err, AppError::PreconditionViolation(_)));
    }

    #[test]
    fn test_external_key_alone_is_enough() {
        let req = NotifyMessage::create("http://x/test")
            .send_immediate(false)
            .external_key("order-9")
            .unwrap()
            .finalize()
            .unwrap();
        assert_eq!(req.external_key.as_deref(), Some("order-9"));
    }
}
