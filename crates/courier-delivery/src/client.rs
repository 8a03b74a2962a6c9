//! HTTP client for outbound deliveries.
//!
//! Sends a pre-built header map and body verbatim so the audit record matches
//! what went on the wire. Any response, 2xx or not, comes back as a
//! [`DeliveryResponse`]; only transport failures are errors.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Response,
};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Configuration for the delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for one HTTP call.
    pub timeout: Duration,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Maximum bytes of response body kept for the audit record.
    pub max_response_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: crate::USER_AGENT.to_string(),
            max_response_body_bytes: crate::DEFAULT_RESPONSE_BODY_LIMIT,
        }
    }
}

/// Thin wrapper around a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound POST.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Attempt row id, for tracing.
    pub attempt_id: Uuid,
    /// Event being delivered, for tracing.
    pub event_id: Uuid,
    /// Target URL.
    pub url: String,
    /// Complete header set, sent as-is.
    pub headers: BTreeMap<String, String>,
    /// Exact body bytes.
    pub body: Bytes,
    /// Attempt number, for tracing.
    pub attempt_number: u32,
}

/// Response from a receiver.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Response body, truncated to the configured limit.
    pub body: String,
    /// Wall-clock duration of the call.
    pub duration: Duration,
    /// True for 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a client with the given configuration.
    ///
    /// Redirects are not followed: a 3xx is a failed delivery.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    #[cfg(test)]
    pub(crate) fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs `request.body` to `request.url`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when no response arrives within the configured timeout
    /// - `NetworkError` for connection and protocol failures
    /// - `ConfigurationError` when a header cannot be encoded
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            event_id = %request.event_id,
            attempt_id = %request.attempt_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let headers = to_header_map(&request.headers)?;
            let start_time = std::time::Instant::now();

            let response = match self
                .client
                .post(&request.url)
                .headers(headers)
                .body(request.body.clone())
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {e}");

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = self.parse_response(response, start_time).await;

            if delivery_response.is_success {
                tracing::info!(status = delivery_response.status_code, "webhook delivered");
            } else {
                tracing::warn!(
                    status = delivery_response.status_code,
                    "receiver returned non-success status"
                );
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    async fn parse_response(
        &self,
        mut response: Response,
        start_time: std::time::Instant,
    ) -> DeliveryResponse {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();
        let headers = extract_headers(response.headers());

        let limit = self.config.max_response_body_bytes;
        let mut buffer = Vec::with_capacity(limit.min(4096));
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = limit.saturating_sub(buffer.len());
                    buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    if buffer.len() >= limit {
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("failed to read response body: {e}");
                    break;
                },
            }
        }

        DeliveryResponse {
            status_code,
            headers,
            body: truncate_utf8(&buffer, limit),
            duration: start_time.elapsed(),
            is_success,
        }
    }
}

/// Decodes at most `limit` bytes, dropping a split trailing character.
/// NUL characters become U+FFFD, as PostgreSQL text columns reject them.
pub(crate) fn truncate_utf8(bytes: &[u8], limit: usize) -> String {
    let slice = &bytes[..bytes.len().min(limit)];
    let decoded = match std::str::from_utf8(slice) {
        Ok(s) => s.to_string(),
        Err(e) if e.error_len().is_none() => {
            String::from_utf8_lossy(&slice[..e.valid_up_to()]).into_owned()
        },
        Err(_) => String::from_utf8_lossy(slice).into_owned(),
    };
    if decoded.contains('\0') {
        decoded.replace('\0', "\u{fffd}")
    } else {
        decoded
    }
}

fn to_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| DeliveryError::configuration(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            DeliveryError::configuration(format!("invalid value for header {name}"))
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

fn extract_headers(header_map: &HeaderMap) -> BTreeMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| value.to_str().ok().map(|v| (key.to_string(), v.to_string())))
        .collect()
}

/// Headers the transport owns; endpoint configuration cannot set them.
pub fn is_managed_header(header_name: &str) -> bool {
    matches!(
        header_name.to_ascii_lowercase().as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
