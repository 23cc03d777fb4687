//! Cluster wire format.
//!
//! Every datagram carries one bincode-encoded [`Envelope`]. Cache keys and
//! values travel as opaque byte strings encoded with the same options, so the
//! transport never needs to know a cache's concrete types.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::net::SocketAddr;

use warden_common::constants::MAX_DATAGRAM_SIZE;
use warden_common::{ClusterNode, RemovalCause, Result, WardenError};

use super::clock::Version;

/// Outer frame of every datagram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Cluster name; frames from other clusters are ignored
    pub cluster: String,
    /// Sending node name
    pub from: String,
    pub message: Message,
}

/// A member as advertised in gossip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node: ClusterNode,
    pub addr: SocketAddr,
}

/// Cluster protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Periodic liveness + membership gossip
    Heartbeat {
        node: ClusterNode,
        members: Vec<MemberInfo>,
    },
    /// Graceful departure
    Leave,
    /// Replicated cache mutation. `op_id == 0` means no ack is wanted.
    Replicate {
        op_id: u64,
        cache: String,
        op: CacheOp,
    },
    Ack {
        op_id: u64,
    },
    /// Read a key from its owner
    Fetch {
        request_id: u64,
        cache: String,
        key: Vec<u8>,
    },
    FetchReply {
        request_id: u64,
        entry: Option<WireEntry>,
    },
    /// Ask the receiver to push its live entries for a cache
    SyncRequest {
        cache: String,
    },
}

/// A cache mutation as replicated between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheOp {
    Put {
        key: Vec<u8>,
        entry: WireEntry,
    },
    /// Remove the entry written at `version`
    Remove {
        key: Vec<u8>,
        version: Version,
        cause: RemovalCause,
    },
}

impl CacheOp {
    pub fn version(&self) -> &Version {
        match self {
            Self::Put { entry, .. } => &entry.version,
            Self::Remove { version, .. } => version,
        }
    }
}

/// A live entry on the wire. Expiry is relative since peers share no clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    pub value: Vec<u8>,
    pub version: Version,
    pub ttl_remaining_ms: u64,
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
}

/// Encode a datagram, rejecting anything that would not fit in one UDP packet
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    options()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .serialize(envelope)
        .map_err(|e| match *e {
            bincode::ErrorKind::SizeLimit => WardenError::InvalidInput(format!(
                "message exceeds the {MAX_DATAGRAM_SIZE}-byte datagram limit"
            )),
            _ => WardenError::Codec(format!("failed to encode envelope: {e}")),
        })
}

pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    options()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .deserialize(bytes)
        .map_err(|e| WardenError::Codec(format!("failed to decode envelope: {e}")))
}

/// Encode a cache key or value
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    options()
        .serialize(value)
        .map_err(|e| WardenError::Codec(format!("failed to encode value: {e}")))
}

pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    options()
        .deserialize(bytes)
        .map_err(|e| WardenError::Codec(format!("failed to decode value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ClusterNode {
        ClusterNode {
            node_name: "node-1".to_string(),
            cluster_name: "test".to_string(),
            machine_id: "host-a".to_string(),
        }
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope {
            cluster: "test".to_string(),
            from: "node-1".to_string(),
            message: Message::Replicate {
                op_id: 9,
                cache: "auth-sessions".to_string(),
                op: CacheOp::Remove {
                    key: encode_value(&42u64).unwrap(),
                    version: Version::new(7, "node-1"),
                    cause: RemovalCause::Invalidated,
                },
            },
        };

        let bytes = encode(&envelope).unwrap();
        let parsed = decode(&bytes).unwrap();

        assert_eq!(parsed.from, "node-1");
        match parsed.message {
            Message::Replicate { op_id, op, .. } => {
                assert_eq!(op_id, 9);
                assert_eq!(op.version(), &Version::new(7, "node-1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn oversized_envelope_is_rejected() {
        let envelope = Envelope {
            cluster: "test".to_string(),
            from: "node-1".to_string(),
            message: Message::Replicate {
                op_id: 1,
                cache: "big".to_string(),
                op: CacheOp::Put {
                    key: vec![1],
                    entry: WireEntry {
                        value: vec![0u8; MAX_DATAGRAM_SIZE],
                        version: Version::new(1, "node-1"),
                        ttl_remaining_ms: 1_000,
                    },
                },
            },
        };

        assert!(matches!(encode(&envelope), Err(WardenError::InvalidInput(_))));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn heartbeat_carries_members() {
        let addr: SocketAddr = "127.0.0.1:7801".parse().unwrap();
        let envelope = Envelope {
            cluster: "test".to_string(),
            from: "node-1".to_string(),
            message: Message::Heartbeat {
                node: node(),
                members: vec![MemberInfo { node: node(), addr }],
            },
        };
        let parsed = decode(&encode(&envelope).unwrap()).unwrap();
        match parsed.message {
            Message::Heartbeat { members, .. } => assert_eq!(members[0].addr, addr),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
