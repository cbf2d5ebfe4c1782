//! Routing logic for inbound HTTP requests
//!
//! Decides whether an inbound request is addressed to a tunnel and, if so, how the tunnel is
//! identified. The test-path convention (`/<api-prefix>/tunnel/<id>/<rest>`) is tried first,
//! then the subdomain convention (`<sub>.<domain>.<tld>`). Anything else is not a tunnel request.

pub mod http;

pub use http::{normalize_host, subdomain_of};

use tracing::trace;
use tunnlr_proto::{split_test_path, DEFAULT_API_PREFIX};

/// How an inbound request identifies its tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Literal tunnel id taken from the path
    TunnelPath {
        tunnel_id: String,
        /// `None` when the path stops at the tunnel id
        local_path: Option<String>,
    },
    /// First host label; the tunnel record is looked up by subdomain
    Subdomain {
        subdomain: String,
        local_path: String,
    },
}

impl Resolution {
    /// Short label used in logs
    pub fn key(&self) -> &str {
        match self {
            Resolution::TunnelPath { tunnel_id, .. } => tunnel_id,
            Resolution::Subdomain { subdomain, .. } => subdomain,
        }
    }
}

/// Route resolution settings
#[derive(Debug, Clone)]
pub struct RouteConfig {
    /// First path segment of the test-path convention
    pub api_prefix: String,
    /// Host labels that belong to the relay itself and never name a tunnel
    pub reserved_subdomains: Vec<String>,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            reserved_subdomains: ["www", "api", "relay", "dashboard"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl RouteConfig {
    /// Reserve the first label of a host the relay itself answers on
    ///
    /// Hosts with fewer than three labels have no such label and are ignored.
    pub fn reserve_host(&mut self, host: &str) {
        let Some(label) = subdomain_of(host) else {
            return;
        };
        if !self
            .reserved_subdomains
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(&label))
        {
            self.reserved_subdomains.push(label);
        }
    }
}

/// Maps (host, path) to a [`Resolution`]
#[derive(Debug, Clone, Default)]
pub struct RouteResolver {
    config: RouteConfig,
}

impl RouteResolver {
    pub fn new(config: RouteConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Resolve an inbound request. `None` means "not a tunnel request".
    pub fn resolve(&self, host: Option<&str>, path_and_query: &str) -> Option<Resolution> {
        if let Some(test_path) = split_test_path(path_and_query, &self.config.api_prefix) {
            trace!("Resolved test path to tunnel {}", test_path.tunnel_id);
            return Some(Resolution::TunnelPath {
                tunnel_id: test_path.tunnel_id,
                local_path: test_path.local_path,
            });
        }

        let subdomain = subdomain_of(host?)?;
        if self
            .config
            .reserved_subdomains
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(&subdomain))
        {
            trace!("Host label {} is reserved, not a tunnel request", subdomain);
            return None;
        }

        trace!("Resolved host to subdomain {}", subdomain);
        let local_path = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };

        Some(Resolution::Subdomain {
            subdomain,
            local_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_resolution() {
        let resolver = RouteResolver::default();

        assert_eq!(
            resolver.resolve(Some("abc123.example.com"), "/widgets?color=red"),
            Some(Resolution::Subdomain {
                subdomain: "abc123".to_string(),
                local_path: "/widgets?color=red".to_string(),
            })
        );
    }

    #[test]
    fn test_path_takes_precedence_over_subdomain() {
        let resolver = RouteResolver::default();

        let resolution = resolver
            .resolve(Some("abc123.example.com"), "/api/tunnel/T1/ping")
            .unwrap();

        assert_eq!(
            resolution,
            Resolution::TunnelPath {
                tunnel_id: "T1".to_string(),
                local_path: Some("/ping".to_string()),
            }
        );
        assert_eq!(resolution.key(), "T1");
    }

    #[test]
    fn test_missing_local_path_still_resolves() {
        let resolver = RouteResolver::default();

        assert_eq!(
            resolver.resolve(Some("localhost:8080"), "/api/tunnel/T1"),
            Some(Resolution::TunnelPath {
                tunnel_id: "T1".to_string(),
                local_path: None,
            })
        );
    }

    #[test]
    fn test_not_a_tunnel_request() {
        let resolver = RouteResolver::default();

        assert_eq!(resolver.resolve(Some("example.com"), "/widgets"), None);
        assert_eq!(resolver.resolve(Some("localhost:5000"), "/health"), None);
        assert_eq!(resolver.resolve(None, "/widgets"), None);
        assert_eq!(resolver.resolve(Some(".example.com"), "/"), None);
    }

    #[test]
    fn test_reserved_subdomains_are_skipped() {
        let resolver = RouteResolver::default();
        assert_eq!(resolver.resolve(Some("relay.tunnlr.dev"), "/tunnel"), None);
        assert_eq!(resolver.resolve(Some("Dashboard.tunnlr.dev"), "/x"), None);

        let resolver = RouteResolver::new(RouteConfig {
            api_prefix: "api".to_string(),
            reserved_subdomains: Vec::new(),
        });
        assert!(resolver.resolve(Some("relay.tunnlr.dev"), "/tunnel").is_some());
    }

    #[test]
    fn test_relay_host_label_is_reserved() {
        let mut config = RouteConfig {
            api_prefix: "api".to_string(),
            reserved_subdomains: vec!["www".to_string()],
        };
        config.reserve_host("Tunnels.MyCorp.com:443");
        config.reserve_host("tunnels.mycorp.com");
        config.reserve_host("localhost:8080");
        assert_eq!(config.reserved_subdomains, vec!["www", "tunnels"]);

        let resolver = RouteResolver::new(config);
        assert_eq!(resolver.resolve(Some("tunnels.mycorp.com"), "/health"), None);
        assert!(resolver.resolve(Some("abc.mycorp.com"), "/health").is_some());
    }

    #[test]
    fn test_custom_api_prefix() {
        let resolver = RouteResolver::new(RouteConfig {
            api_prefix: "v2".to_string(),
            ..RouteConfig::default()
        });

        assert!(matches!(
            resolver.resolve(None, "/v2/tunnel/T9/x"),
            Some(Resolution::TunnelPath { .. })
        ));
        assert_eq!(resolver.resolve(None, "/api/tunnel/T9/x"), None);
    }
}
