use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Raft node id. Derived from the node's gossip name, see [`node_id`].
pub type NodeId = u64;

/// Identity a cluster member advertises to its peers.
///
/// Raft membership carries this alongside the numeric id so server
/// descriptors can be rebuilt from the configuration alone: `name` is the
/// gossip node name, `rpc_addr` the multiplexed host:port that replication
/// traffic and clients dial.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ClusterNode {
    pub name: String,
    pub rpc_addr: String,
}

impl ClusterNode {
    pub fn new(name: impl Into<String>, rpc_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rpc_addr: rpc_addr.into(),
        }
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.rpc_addr)
    }
}

/// Maps a node name to its raft id (FNV-1a, stable across processes).
pub fn node_id(name: &str) -> NodeId {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// OpenRaft type configuration for cachet.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(Serialize, Deserialize)]
pub struct TypeConfig;

impl fmt::Display for TypeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeConfig")
    }
}

impl openraft::RaftTypeConfig for TypeConfig {
    type D = Request;
    type R = Response;
    type Node = ClusterNode;
    type NodeId = NodeId;
    type Entry = openraft::Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// What gets proposed to the log: the codec-encoded entry bytes.
///
/// The consensus library replicates these opaquely; only the state machine
/// decodes them. Keeping the wire bytes as the payload is what makes the
/// entry layout a cross-node commitment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub data: Vec<u8>,
}

impl Request {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Failure of a single apply, carried back to the proposing node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ApplyError {
    Malformed(String),
    Cache(String),
}

impl From<ApplyError> for Error {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::Malformed(msg) => Error::MalformedEntry(msg),
            ApplyError::Cache(msg) => Error::Cache(msg),
        }
    }
}

/// Result of applying one log entry.
///
/// `value` is set for GET entries; `error` distinguishes our own apply
/// failures from consensus failures, which surface separately.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Response {
    pub value: Option<Vec<u8>>,
    pub error: Option<ApplyError>,
}

impl Response {
    pub fn ok(value: Option<Vec<u8>>) -> Self {
        Self { value, error: None }
    }

    pub fn fail(error: ApplyError) -> Self {
        Self {
            value: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_stable_and_distinct() {
        assert_eq!(node_id("node-1"), node_id("node-1"));
        assert_ne!(node_id("node-1"), node_id("node-2"));
        assert_ne!(node_id(""), node_id("0"));
    }
}
