//! HTTP transport used to reach notification targets.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};

use hookrelay_common::error::AppError;
use hookrelay_common::types::{ContentType, HttpMethod};

/// Performs one HTTP call and hands back the raw response body.
///
/// Implementations never fail: a transport error yields an empty body and a
/// non-2xx response yields whatever body the target sent.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn request(
        &self,
        url: &str,
        data: &str,
        method: HttpMethod,
        timeout: Duration,
        content_type: ContentType,
    ) -> String;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub user_agent: String,
    pub max_redirects: usize,
    pub verify_tls: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("hookrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 5,
            verify_tls: true,
        }
    }
}

/// `reqwest`-backed transport. The client pools connections internally and
/// is shared by every worker.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    fn query_url(url: &str, data: &str) -> String {
        if data.is_empty() {
            return url.to_string();
        }
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", url, separator, data)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(
        &self,
        url: &str,
        data: &str,
        method: HttpMethod,
        timeout: Duration,
        content_type: ContentType,
    ) -> String {
        let builder = match method {
            HttpMethod::Get => self.client.get(Self::query_url(url, data)),
            HttpMethod::Post => self
                .client
                .post(url)
                .header(CONTENT_TYPE, content_type.as_str())
                .header(CONTENT_LENGTH, data.len().to_string())
                .body(data.to_string()),
        };

        let response = match builder.timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url, method = %method, error = %e, "Notification request failed");
                return String::new();
            }
        };

        let status = response.status();
        match response.text().await {
            Ok(body) => {
                tracing::debug!(url, status = status.as_u16(), "Notification response received");
                body
            }
            Err(e) => {
                tracing::warn!(url, status = status.as_u16(), error = %e, "Failed to read response body");
                String::new()
            }
        }
    }
}
