//! Node identity for gateway nodes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TopologyError;

/// Identity of a gateway node, rendered as `hostname:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    host: String,
    port: u16,
}

impl NodeId {
    /// Create a node id from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidNodeId`] when the host is empty,
    /// contains whitespace, or the port is zero.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TopologyError> {
        let host = host.into();

        if host.is_empty() || host.chars().any(char::is_whitespace) || port == 0 {
            return Err(TopologyError::InvalidNodeId(format!("{host}:{port}")));
        }

        Ok(Self { host, port })
    }

    /// The hostname part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeId {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::InvalidNodeId(s.to_string()))?;

        let port = port
            .parse::<u16>()
            .map_err(|_| TopologyError::InvalidNodeId(s.to_string()))?;

        Self::new(host, port).map_err(|_| TopologyError::InvalidNodeId(s.to_string()))
    }
}

impl TryFrom<String> for NodeId {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(node_id: NodeId) -> Self {
        node_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_parse_host_port() {
        let node_id: NodeId = "node-b:9090".parse().unwrap();
        assert_eq!(node_id.host(), "node-b");
        assert_eq!(node_id.port(), 9090);
        assert_eq!(node_id.to_string(), "node-b:9090");
    }

    #[test]
    fn test_rejects_malformed_ids() {
        assert!("node-b".parse::<NodeId>().is_err());
        assert!(":9090".parse::<NodeId>().is_err());
        assert!("node-b:0".parse::<NodeId>().is_err());
        assert!("node-b:http".parse::<NodeId>().is_err());
        assert!("node b:9090".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let node_id: NodeId = "node-c:9091".parse().unwrap();
        let json = serde_json::to_string(&node_id).unwrap();
        assert_eq!(json, "\"node-c:9091\"");

        let decoded: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, node_id);

        assert_matches!(
            serde_json::from_str::<NodeId>("\"node-c\""),
            Err(e) if e.to_string().contains("hostname:port")
        );
    }

    #[test]
    fn test_ipv6_style_host_uses_last_colon() {
        let node_id: NodeId = "[::1]:7000".parse().unwrap();
        assert_eq!(node_id.host(), "[::1]");
        assert_eq!(node_id.port(), 7000);
    }
}
