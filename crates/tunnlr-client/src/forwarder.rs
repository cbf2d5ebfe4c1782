//! Replays forwarded requests against the local service

use crate::config::AgentConfig;
use crate::AgentError;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tracing::{debug, warn};
use tunnlr_proto::{
    collect_headers, is_hop_by_hop, strip_test_path, RequestEnvelope, ResponseEnvelope,
};

/// Status reported to the relay when the local service could not be reached
pub const LOCAL_FAILURE_STATUS: u16 = 502;

/// HTTP client bound to one local service
#[derive(Clone)]
pub struct LocalForwarder {
    client: reqwest::Client,
    base_url: String,
    api_prefix: String,
}

impl LocalForwarder {
    pub fn new(
        local_host: &str,
        local_port: u16,
        timeout: Duration,
        api_prefix: impl Into<String>,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: format!("http://{}:{}", local_host, local_port),
            api_prefix: api_prefix.into(),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        Self::new(
            &config.local_host,
            config.local_port,
            config.local_timeout,
            config.api_prefix.clone(),
        )
    }

    /// Local URL a forwarded path maps to. A leftover test-path prefix is removed.
    pub fn target_url(&self, path: &str) -> String {
        let path = strip_test_path(path, &self.api_prefix);
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Replay one request. Never fails: local errors become a 502 response so the relay's
    /// pending entry resolves instead of timing out.
    pub async fn forward(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let request_id = request.request_id.clone();
        match self.try_forward(request).await {
            Ok(response) => response,
            Err(reason) => {
                warn!("Local request {} failed: {}", request_id, reason);
                ResponseEnvelope::text(request_id, LOCAL_FAILURE_STATUS, reason)
            }
        }
    }

    async fn try_forward(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, String> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| format!("Invalid method: {}", request.method))?;
        let url = self.target_url(&request.path);

        debug!("Replaying {} {} -> {}", method, request.path, url);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("host") || is_hop_by_hop(name) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => debug!("Skipping unrepresentable header {}", name),
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(describe)?;

        let status_code = response.status().as_u16();
        let headers = collect_headers(response.headers().iter().filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str(), value.to_string()))
        }));
        let body = response.text().await.map_err(describe)?;

        Ok(ResponseEnvelope {
            request_id: request.request_id,
            status_code,
            headers,
            body,
        })
    }
}

fn describe(error: reqwest::Error) -> String {
    if error.is_timeout() {
        "Local service timed out".to_string()
    } else if error.is_connect() {
        "Local service unavailable".to_string()
    } else {
        format!("Local request failed: {}", error)
    }
}
