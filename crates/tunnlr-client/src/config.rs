//! Agent configuration

use crate::AgentError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tunnlr_proto::{CONNECT_PATH, DEFAULT_API_PREFIX};
use url::Url;

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Relay base URL (`ws://`, `wss://`, `http://` or `https://`)
    pub relay_url: String,
    pub auth_token: String,
    pub local_host: String,
    pub local_port: u16,
    /// Protocol label sent to the relay
    pub protocol: String,
    /// Upper bound on one call to the local service
    #[serde(with = "duration_secs")]
    pub local_timeout: Duration,
    /// First path segment of the relay's test paths
    pub api_prefix: String,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8080".to_string(),
            auth_token: String::new(),
            local_host: "localhost".to_string(),
            local_port: 0,
            protocol: "http".to_string(),
            local_timeout: Duration::from_secs(30),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// URL of the relay's connect endpoint, carrying token, port and protocol
    pub fn connect_url(&self) -> Result<Url, AgentError> {
        let mut url = relay_base(&self.relay_url, Scheme::WebSocket)?;
        url.set_path(CONNECT_PATH);
        url.query_pairs_mut()
            .append_pair("token", &self.auth_token)
            .append_pair("port", &self.local_port.to_string())
            .append_pair("protocol", &self.protocol);
        Ok(url)
    }

    /// Base URL of the relay's HTTP surface
    pub fn api_url(&self) -> Result<Url, AgentError> {
        relay_base(&self.relay_url, Scheme::Http)
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Scheme {
    WebSocket,
    Http,
}

/// Parse a relay URL and coerce it to the requested scheme family, keeping TLS-ness
pub(crate) fn relay_base(raw: &str, family: Scheme) -> Result<Url, AgentError> {
    let mut url = Url::parse(raw)?;

    let secure = match url.scheme() {
        "ws" | "http" => false,
        "wss" | "https" => true,
        other => {
            return Err(AgentError::Config(format!(
                "unsupported relay URL scheme: {}",
                other
            )))
        }
    };

    let scheme = match (family, secure) {
        (Scheme::WebSocket, false) => "ws",
        (Scheme::WebSocket, true) => "wss",
        (Scheme::Http, false) => "http",
        (Scheme::Http, true) => "https",
    };

    url.set_scheme(scheme)
        .map_err(|_| AgentError::Config(format!("cannot use {} for {}", scheme, raw)))?;
    url.set_path("/");
    url.set_query(None);
    Ok(url)
}

/// Builder for AgentConfig
#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.config.relay_url = url.into();
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = token.into();
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.protocol = protocol.into();
        self
    }

    pub fn local_timeout(mut self, timeout: Duration) -> Self {
        self.config.local_timeout = timeout;
        self
    }

    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.api_prefix = prefix.into();
        self
    }

    pub fn build(self) -> Result<AgentConfig, AgentError> {
        if self.config.auth_token.is_empty() {
            return Err(AgentError::Config("auth_token is required".to_string()));
        }
        if self.config.local_port == 0 {
            return Err(AgentError::Config("local_port is required".to_string()));
        }
        if self.config.protocol.is_empty() {
            return Err(AgentError::Config("protocol must not be empty".to_string()));
        }
        // Fail early on a relay URL we could never connect to
        self.config.connect_url()?;
        Ok(self.config)
    }
}
