//! Tunnel vocabulary shared by the relay and the agent

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default first path segment of the test-path convention (`/api/tunnel/<id>/...`)
pub const DEFAULT_API_PREFIX: &str = "api";

const TUNNEL_SEGMENT: &str = "tunnel";

/// Lifecycle status of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum TunnelStatus {
    /// Agent connected (or reusable by the owner's next connection)
    Active,
    /// Agent disconnected
    Inactive,
    /// Deactivated by its owner
    Deactivated,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Active => "Active",
            TunnelStatus::Inactive => "Inactive",
            TunnelStatus::Deactivated => "Deactivated",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TunnelStatus::Active)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(TunnelStatus::Active),
            "Inactive" => Ok(TunnelStatus::Inactive),
            "Deactivated" => Ok(TunnelStatus::Deactivated),
            other => Err(format!("Unknown tunnel status: {}", other)),
        }
    }
}

/// Sent to the agent as the first message of an accepted session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TunnelDescriptor {
    pub tunnel_id: String,
    pub public_url: String,
    pub dashboard_url: String,
}

/// A path that matched `/<api-prefix>/tunnel/<tunnel-id>/<rest...>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPath {
    pub tunnel_id: String,
    /// `/<rest...>` plus the query string; `None` when nothing follows the tunnel id
    pub local_path: Option<String>,
}

/// Match a request path against the test-path convention.
///
/// Returns `None` when the path does not follow the convention at all.
pub fn split_test_path(path_and_query: &str, api_prefix: &str) -> Option<TestPath> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let mut segments = path.trim_start_matches('/').splitn(4, '/');

    let prefix = segments.next()?;
    if !prefix.eq_ignore_ascii_case(api_prefix.trim_matches('/')) {
        return None;
    }
    if !segments.next()?.eq_ignore_ascii_case(TUNNEL_SEGMENT) {
        return None;
    }

    let tunnel_id = segments.next().filter(|id| !id.is_empty())?;

    let local_path = segments
        .next()
        .filter(|rest| !rest.is_empty())
        .map(|rest| match query {
            Some(query) => format!("/{}?{}", rest, query),
            None => format!("/{}", rest),
        });

    Some(TestPath {
        tunnel_id: tunnel_id.to_string(),
        local_path,
    })
}

/// Remove a test-path prefix from a path, if present.
pub fn strip_test_path(path_and_query: &str, api_prefix: &str) -> String {
    match split_test_path(path_and_query, api_prefix) {
        Some(TestPath {
            local_path: Some(local),
            ..
        }) => local,
        Some(TestPath {
            local_path: None, ..
        }) => "/".to_string(),
        None => path_and_query.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TunnelStatus::Active,
            TunnelStatus::Inactive,
            TunnelStatus::Deactivated,
        ] {
            assert_eq!(status.as_str().parse::<TunnelStatus>().unwrap(), status);
        }
        assert!("Paused".parse::<TunnelStatus>().is_err());
        assert!(TunnelStatus::Active.is_active());
        assert!(!TunnelStatus::Deactivated.is_active());
    }

    #[test]
    fn test_split_test_path() {
        let tp = split_test_path("/api/tunnel/T1/ping", "api").unwrap();
        assert_eq!(tp.tunnel_id, "T1");
        assert_eq!(tp.local_path.as_deref(), Some("/ping"));

        let tp = split_test_path("/api/tunnel/T1/v1/users/7?page=2", "api").unwrap();
        assert_eq!(tp.local_path.as_deref(), Some("/v1/users/7?page=2"));
    }

    #[test]
    fn test_split_test_path_without_rest() {
        let tp = split_test_path("/api/tunnel/T1", "api").unwrap();
        assert_eq!(tp.tunnel_id, "T1");
        assert_eq!(tp.local_path, None);

        let tp = split_test_path("/api/tunnel/T1/", "api").unwrap();
        assert_eq!(tp.local_path, None);
    }

    #[test]
    fn test_split_test_path_non_matching() {
        assert!(split_test_path("/widgets", "api").is_none());
        assert!(split_test_path("/api/tunnels/T1/status", "api").is_none());
        assert!(split_test_path("/api/tunnel/", "api").is_none());
        assert!(split_test_path("/v2/tunnel/T1/ping", "api").is_none());
        assert!(split_test_path("/v2/tunnel/T1/ping", "v2").is_some());
    }

    #[test]
    fn test_strip_test_path() {
        assert_eq!(strip_test_path("/api/tunnel/T1/ping", "api"), "/ping");
        assert_eq!(strip_test_path("/api/tunnel/T1", "api"), "/");
        assert_eq!(strip_test_path("/widgets?id=3", "api"), "/widgets?id=3");
    }
}
