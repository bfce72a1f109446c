//! # Node Identity and Roles
//!
//! - [`NodeUrl`]: contact URL `enode://<hex-id>@<host>:<port>`.
//! - [`SelfRole`]: how the local node behaves inside the peer graph.
//! - [`PeerClass`]: which peer set an admitted remote lands in.

use std::fmt;
use std::str::FromStr;

use shared_types::NodeType;

use super::errors::CommError;

const NODE_URL_SCHEME: &str = "enode://";

/// Parsed node contact URL.
///
/// The `id` component is the peer identifier used throughout the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeUrl {
    id: String,
    host: String,
    port: u16,
}

impl NodeUrl {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// Parse `enode://<hex-id>@<host>:<port>`. A trailing query string is ignored.
    pub fn parse(raw: &str) -> Result<Self, CommError> {
        let invalid = || CommError::InvalidNodeUrl(raw.to_string());

        let rest = raw.trim().strip_prefix(NODE_URL_SCHEME).ok_or_else(invalid)?;
        let rest = rest.split('?').next().unwrap_or_default();
        let (id, addr) = rest.split_once('@').ok_or_else(invalid)?;

        if id.is_empty() || hex::decode(id).is_err() {
            return Err(invalid());
        }

        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;

        Ok(Self::new(id.to_lowercase(), host, port))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same node, reachable at a different host.
    pub fn with_host(&self, host: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            host: host.into(),
            port: self.port,
        }
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}{}@[{}]:{}", NODE_URL_SCHEME, self.id, self.host, self.port)
        } else {
            write!(f, "{}{}@{}:{}", NODE_URL_SCHEME, self.id, self.host, self.port)
        }
    }
}

impl FromStr for NodeUrl {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Role of the local node, derived from its configured node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelfRole {
    /// Normal and mine-master nodes.
    Base,
    /// Consensus participant.
    Verifier,
    /// Listed verifier-boot node.
    Boot,
}

impl SelfRole {
    /// Resolve the role for `node_type`.
    ///
    /// A verifier-boot node only gets the `Boot` role when its id appears in
    /// `verifier_boot_ids`; `None` means the configuration is invalid.
    pub fn resolve<'a>(
        node_type: NodeType,
        self_id: &str,
        mut verifier_boot_ids: impl Iterator<Item = &'a str>,
    ) -> Option<Self> {
        match node_type {
            NodeType::Normal | NodeType::MineMaster => Some(SelfRole::Base),
            NodeType::Verifier => Some(SelfRole::Verifier),
            NodeType::VerifierBoot => verifier_boot_ids
                .any(|id| id.eq_ignore_ascii_case(self_id))
                .then_some(SelfRole::Boot),
            NodeType::Miner => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SelfRole::Base => "base",
            SelfRole::Verifier => "verifier",
            SelfRole::Boot => "boot",
        }
    }
}

/// Peer set an admitted remote peer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeerClass {
    Base,
    CurrentVerifier,
    NextVerifier,
    VerifierBoot,
}

impl PeerClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerClass::Base => "base",
            PeerClass::CurrentVerifier => "current_verifier",
            PeerClass::NextVerifier => "next_verifier",
            PeerClass::VerifierBoot => "verifier_boot",
        }
    }
}

impl fmt::Display for PeerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "b832f4f2fe19dbc5604766bbb268a6d0";

    #[test]
    fn test_parse_node_url() {
        let url = NodeUrl::parse(&format!("enode://{}@127.0.0.1:10003", ID)).unwrap();
        assert_eq!(url.id(), ID);
        assert_eq!(url.host(), "127.0.0.1");
        assert_eq!(url.port(), 10003);
        assert_eq!(url.to_string(), format!("enode://{}@127.0.0.1:10003", ID));
    }

    #[test]
    fn test_parse_ignores_query() {
        let url = NodeUrl::parse(&format!("enode://{}@10.0.0.1:30303?discport=0", ID)).unwrap();
        assert_eq!(url.port(), 30303);
    }

    #[test]
    fn test_parse_ipv6_host() {
        let url = NodeUrl::parse(&format!("enode://{}@[::1]:30303", ID)).unwrap();
        assert_eq!(url.host(), "::1");
        assert_eq!(url.to_string(), format!("enode://{}@[::1]:30303", ID));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "enode://@192.168.122.102:40006",
            "enode://01010101@123.124.125.126",
            "enode://zz@1.2.3.4:5",
            "http://0101@1.2.3.4:5",
            "enode://0101@:5",
            "enode://0101@1.2.3.4:99999",
        ] {
            assert!(
                matches!(NodeUrl::parse(raw), Err(CommError::InvalidNodeUrl(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_with_host_keeps_id_and_port() {
        let url = NodeUrl::parse(&format!("enode://{}@0.0.0.0:10003", ID)).unwrap();
        let rewritten = url.with_host("172.16.5.201");
        assert_eq!(rewritten.id(), ID);
        assert_eq!(rewritten.port(), 10003);
        assert_eq!(rewritten.host(), "172.16.5.201");
    }

    #[test]
    fn test_self_role_resolution() {
        let boots = ["aa", "bb"];
        assert_eq!(
            SelfRole::resolve(NodeType::Normal, "x", boots.iter().copied()),
            Some(SelfRole::Base)
        );
        assert_eq!(
            SelfRole::resolve(NodeType::MineMaster, "x", boots.iter().copied()),
            Some(SelfRole::Base)
        );
        assert_eq!(
            SelfRole::resolve(NodeType::Verifier, "x", boots.iter().copied()),
            Some(SelfRole::Verifier)
        );
        assert_eq!(
            SelfRole::resolve(NodeType::VerifierBoot, "bb", boots.iter().copied()),
            Some(SelfRole::Boot)
        );
        assert_eq!(
            SelfRole::resolve(NodeType::VerifierBoot, "cc", boots.iter().copied()),
            None
        );
        assert_eq!(
            SelfRole::resolve(NodeType::Miner, "x", boots.iter().copied()),
            None
        );
    }
}
