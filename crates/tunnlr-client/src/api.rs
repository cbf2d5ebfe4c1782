//! Client for the relay's management API

use crate::config::{relay_base, Scheme};
use crate::AgentError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tunnlr_proto::TunnelStatus;
use url::Url;

/// Status of a tunnel as reported by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatusReport {
    pub tunnel_id: String,
    pub status: TunnelStatus,
    pub public_url: String,
    pub dashboard_url: String,
    pub local_port: u16,
    pub protocol: String,
    pub connected: bool,
    pub request_count: u64,
    pub bytes_transferred: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

pub struct RelayApiClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl RelayApiClient {
    /// `relay_url` may use any of the schemes the agent accepts; `ws` maps to `http`.
    /// `token` is the credential the tunnel was opened with.
    pub fn new(relay_url: &str, token: impl Into<String>) -> Result<Self, AgentError> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: relay_base(relay_url, Scheme::Http)?,
            token: token.into(),
        })
    }

    /// Deactivate a tunnel; a connected agent is told the tunnel was closed
    pub async fn deactivate(&self, tunnel_id: &str) -> Result<(), AgentError> {
        let url = self.tunnel_url(tunnel_id, "")?;
        debug!("DELETE {}", url);

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(AgentError::TunnelNotFound(tunnel_id.to_string())),
            StatusCode::UNAUTHORIZED => {
                Err(AgentError::Unauthorized(error_message(response).await))
            }
            status => Err(api_error(status, response).await),
        }
    }

    pub async fn status(&self, tunnel_id: &str) -> Result<TunnelStatusReport, AgentError> {
        let url = self.tunnel_url(tunnel_id, "/status")?;
        debug!("GET {}", url);

        let response = self.client.get(url).bearer_auth(&self.token).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(AgentError::TunnelNotFound(tunnel_id.to_string())),
            StatusCode::UNAUTHORIZED => {
                Err(AgentError::Unauthorized(error_message(response).await))
            }
            status => Err(api_error(status, response).await),
        }
    }

    fn tunnel_url(&self, tunnel_id: &str, suffix: &str) -> Result<Url, AgentError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AgentError::Config(format!("{} cannot be a base URL", self.base_url)))?
            .clear()
            .extend(["api", "tunnels", tunnel_id]);
        if !suffix.is_empty() {
            let path = format!("{}{}", url.path(), suffix);
            url.set_path(&path);
        }
        Ok(url)
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    }
}

async fn api_error(status: StatusCode, response: reqwest::Response) -> AgentError {
    AgentError::Api(format!("{}: {}", status, error_message(response).await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_urls() {
        let client = RelayApiClient::new("wss://relay.example.com", "token").unwrap();

        assert_eq!(
            client.tunnel_url("t-1", "").unwrap().as_str(),
            "https://relay.example.com/api/tunnels/t-1"
        );
        assert_eq!(
            client.tunnel_url("t-1", "/status").unwrap().as_str(),
            "https://relay.example.com/api/tunnels/t-1/status"
        );
    }

    #[test]
    fn test_tunnel_id_is_escaped() {
        let client = RelayApiClient::new("http://127.0.0.1:8080", "token").unwrap();
        assert_eq!(
            client.tunnel_url("a/b", "").unwrap().as_str(),
            "http://127.0.0.1:8080/api/tunnels/a%2Fb"
        );
    }

    #[test]
    fn test_status_report_parses_relay_json() {
        let json = r#"{
            "tunnel_id": "t-1",
            "status": "Inactive",
            "public_url": "https://abc.tunnlr.dev",
            "dashboard_url": "https://dashboard.tunnlr.dev/abc",
            "local_port": 3000,
            "protocol": "http",
            "connected": false,
            "request_count": 4,
            "bytes_transferred": 120
        }"#;

        let report: TunnelStatusReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.status, TunnelStatus::Inactive);
        assert_eq!(report.request_count, 4);
    }
}
