//! Wire protocol: message vocabulary and framed-JSON codec.
//!
//! Messages travel as length-prefixed JSON over TCP: a 4-byte big-endian
//! payload length, then the payload. The length prefix makes message
//! boundaries explicit, so payloads may contain any bytes and a slow
//! peer cannot wedge the reader between messages. Frames above
//! [`MAX_FRAME_BYTES`] are rejected before allocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::atom::{Atom, AtomType, Handle};
use crate::cluster::member::{MemberInfo, NodeId, NodeStatus};
use crate::cluster::sync::{SyncOpId, SyncOperation};
use crate::error::{ProtocolError, ValidationError};
use crate::truth::TruthValue;

/// Largest accepted frame payload.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Serialized atom as it travels between nodes.
///
/// Carries the simple projection of the truth value; richer variants
/// are flattened to `(strength, confidence)` on the way out. Exactly
/// one of `name` and `outgoing` is present, matching the node/link
/// split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomData {
    /// Content-derived handle, restated for integrity checking.
    pub handle: Handle,
    /// Type tag.
    #[serde(rename = "type")]
    pub atom_type: AtomType,
    /// Truth strength.
    pub truth_strength: f32,
    /// Truth confidence.
    pub truth_confidence: f32,
    /// Node name; absent for links.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ordered child handles; absent for nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outgoing: Option<Vec<Handle>>,
}

impl AtomData {
    /// Projects an atom onto its wire form.
    #[must_use]
    pub fn from_atom(atom: &Atom) -> Self {
        Self {
            handle: atom.handle(),
            atom_type: atom.atom_type().clone(),
            truth_strength: atom.tv().strength(),
            truth_confidence: atom.tv().confidence(),
            name: atom.name().map(str::to_string),
            outgoing: atom.outgoing().map(<[Handle]>::to_vec),
        }
    }

    /// Reconstructs the atom, validating everything that arrived off the
    /// wire: truth components, node/link shape, and that the restated
    /// handle matches the content.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` describing the first field that does
    /// not hold up.
    pub fn to_atom(&self) -> Result<Atom, ValidationError> {
        let tv = TruthValue::simple(self.truth_strength, self.truth_confidence)?;

        let atom = match (&self.name, &self.outgoing) {
            (Some(name), None) => Atom::node_with_tv(self.atom_type.clone(), name.clone(), tv)?,
            (None, Some(outgoing)) => {
                Atom::link_with_tv(self.atom_type.clone(), outgoing.clone(), tv)?
            }
            (Some(_), Some(_)) => {
                return Err(ValidationError::MalformedAtomData {
                    reason: "both name and outgoing present".to_string(),
                })
            }
            (None, None) => {
                return Err(ValidationError::MalformedAtomData {
                    reason: "neither name nor outgoing present".to_string(),
                })
            }
        };

        if atom.handle() != self.handle {
            return Err(ValidationError::MalformedAtomData {
                reason: format!(
                    "handle {} does not match content (expected {})",
                    self.handle,
                    atom.handle()
                ),
            });
        }

        Ok(atom)
    }
}

/// Whether a join request was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    /// The seed accepted the node; a membership snapshot follows.
    Accepted,
    /// Cluster id mismatch; the node must not adopt any state.
    Rejected,
}

/// Everything nodes say to each other.
///
/// The `type` tag is the wire contract; variant renames pin each tag
/// explicitly so refactoring cannot silently change the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClusterMessage {
    /// A node asks a seed to let it into the cluster.
    #[serde(rename = "cluster_join_request")]
    JoinRequest {
        /// Cluster the joiner believes it belongs to.
        cluster_id: String,
        /// Joiner's identity.
        node_id: NodeId,
        /// Host the joiner listens on.
        host: String,
        /// Port the joiner listens on.
        port: u16,
        /// When the request was made.
        timestamp: DateTime<Utc>,
    },

    /// The seed's answer to a join request.
    #[serde(rename = "cluster_join_response")]
    JoinResponse {
        /// Accepted or rejected.
        status: JoinStatus,
        /// Identity of the answering node, so the joiner can attribute
        /// the snapshot it adopts regardless of how it spelled the
        /// seed's address.
        responder: NodeId,
        /// Current membership, empty on rejection.
        cluster_nodes: Vec<MemberInfo>,
    },

    /// Periodic liveness and load report.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        /// Reporting node.
        node_id: NodeId,
        /// Reported lifecycle state.
        status: NodeStatus,
        /// Atom count at the reporter.
        atomspace_size: u64,
        /// Load at the reporter, 0.0 to 1.0.
        load_factor: f32,
        /// When the report was made.
        timestamp: DateTime<Utc>,
    },

    /// One replicated mutation.
    #[serde(rename = "sync_operation")]
    Sync {
        /// The operation, flattened into the message body.
        #[serde(flatten)]
        op: SyncOperation,
    },

    /// Graceful goodbye.
    #[serde(rename = "cluster_departure")]
    Departure {
        /// Departing node.
        node_id: NodeId,
        /// When it left.
        timestamp: DateTime<Utc>,
    },

    /// A joiner asks for the full atom population.
    #[serde(rename = "full_sync_request")]
    FullSyncRequest {
        /// Requesting node.
        node_id: NodeId,
    },

    /// Full atom population, children ordered before referrers.
    #[serde(rename = "full_sync_response")]
    FullSyncResponse {
        /// Every atom the responder holds.
        atoms: Vec<AtomData>,
        /// Responder's clock, merged by the receiver.
        vector_clock: crate::clock::VectorClock,
        /// Operations still queued for broadcast at the responder.
        /// Their effects are already inside `atoms`; the receiver marks
        /// them seen so the upcoming broadcast does not apply twice.
        #[serde(default)]
        pending_ops: Vec<SyncOpId>,
    },

    /// A node asks its peers to vote on a conflict.
    #[serde(rename = "conflict_vote_request")]
    VoteRequest {
        /// The conflicted operation.
        op_id: SyncOpId,
        /// The contested atom.
        atom_handle: Handle,
        /// Asker's current truth value.
        local_tv: TruthValue,
        /// Arriving truth value.
        incoming_tv: TruthValue,
        /// Asking node.
        node_id: NodeId,
    },

    /// A peer's vote.
    #[serde(rename = "conflict_vote_response")]
    VoteResponse {
        /// The conflicted operation.
        op_id: SyncOpId,
        /// True to take the incoming truth value.
        prefer_incoming: bool,
        /// Voting node.
        node_id: NodeId,
    },
}

/// Writes one framed message.
///
/// # Errors
///
/// Returns `ProtocolError::FrameTooLarge` if the serialized payload
/// exceeds [`MAX_FRAME_BYTES`], `ProtocolError::Malformed` if it fails
/// to serialize, or `ProtocolError::Io` on write failure.
pub async fn write_frame<W>(writer: &mut W, message: &ClusterMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::Malformed {
        reason: "frame length overflow".to_string(),
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed message.
///
/// # Errors
///
/// Returns `ProtocolError::FrameTooLarge` if the advertised length
/// exceeds [`MAX_FRAME_BYTES`], `ProtocolError::Malformed` if the
/// payload is not a valid message, or `ProtocolError::Io` if the stream
/// ends mid-frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<ClusterMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;

    fn node_id(name: &str) -> NodeId {
        NodeId::new(name).unwrap()
    }

    #[test]
    fn test_atom_data_node_roundtrip() {
        let atom = Atom::node_with_tv(
            AtomType::Concept,
            "water",
            TruthValue::simple(0.9, 0.8).unwrap(),
        )
        .unwrap();

        let data = AtomData::from_atom(&atom);
        assert_eq!(data.name.as_deref(), Some("water"));
        assert!(data.outgoing.is_none());

        let back = data.to_atom().unwrap();
        assert_eq!(back, atom);
    }

    #[test]
    fn test_atom_data_link_roundtrip() {
        let child = Atom::node(AtomType::Concept, "child").unwrap();
        let link = Atom::link(AtomType::Inheritance, vec![child.handle(), child.handle()]).unwrap();

        let data = AtomData::from_atom(&link);
        assert!(data.name.is_none());
        assert_eq!(data.outgoing.as_ref().map(Vec::len), Some(2));

        let back = data.to_atom().unwrap();
        assert_eq!(back.handle(), link.handle());
    }

    #[test]
    fn test_atom_data_projects_rich_truth() {
        let atom = Atom::node_with_tv(
            AtomType::Concept,
            "counted",
            TruthValue::count(0.5, 800.0).unwrap(),
        )
        .unwrap();

        let data = AtomData::from_atom(&atom);
        assert!((data.truth_strength - 0.5).abs() < 1e-6);
        assert!((data.truth_confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_atom_data_rejects_handle_mismatch() {
        let atom = Atom::node(AtomType::Concept, "original").unwrap();
        let mut data = AtomData::from_atom(&atom);
        data.name = Some("tampered".to_string());

        let err = data.to_atom().unwrap_err();
        assert!(matches!(err, ValidationError::MalformedAtomData { .. }));
    }

    #[test]
    fn test_atom_data_rejects_ambiguous_shape() {
        let atom = Atom::node(AtomType::Concept, "shape").unwrap();
        let mut data = AtomData::from_atom(&atom);
        data.outgoing = Some(vec![Handle::zero()]);

        assert!(data.to_atom().is_err());

        let mut neither = AtomData::from_atom(&atom);
        neither.name = None;
        assert!(neither.to_atom().is_err());
    }

    #[test]
    fn test_atom_data_rejects_bad_truth() {
        let atom = Atom::node(AtomType::Concept, "truth").unwrap();
        let mut data = AtomData::from_atom(&atom);
        data.truth_confidence = 2.0;

        assert!(data.to_atom().is_err());
    }

    #[test]
    fn test_message_wire_tags() {
        let join = ClusterMessage::JoinRequest {
            cluster_id: "mesh".to_string(),
            node_id: node_id("joiner"),
            host: "127.0.0.1".to_string(),
            port: 7500,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&join).unwrap();
        assert!(json.contains("\"type\":\"cluster_join_request\""));

        let heartbeat = ClusterMessage::Heartbeat {
            node_id: node_id("reporter"),
            status: NodeStatus::Active,
            atomspace_size: 10,
            load_factor: 0.25,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&heartbeat).unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
        assert!(json.contains("\"status\":\"active\""));

        let departure = ClusterMessage::Departure {
            node_id: node_id("leaver"),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&departure).unwrap();
        assert!(json.contains("\"type\":\"cluster_departure\""));
    }

    #[test]
    fn test_sync_message_flattens_operation() {
        let atom = Atom::node(AtomType::Concept, "flat").unwrap();
        let op = SyncOperation::add(
            AtomData::from_atom(&atom),
            node_id("origin"),
            VectorClock::new(),
        );
        let message = ClusterMessage::Sync { op };

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"sync_operation\""));
        // Operation fields sit at the top level of the message body.
        assert!(json.contains("\"operation_type\":\"add\""));
        assert!(json.contains("\"source_node\":\"origin\""));

        let back: ClusterMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClusterMessage::Sync { op } => assert_eq!(op.handle, atom.handle()),
            other => panic!("expected Sync, got {other:?}"),
        }
    }

    #[test]
    fn test_join_response_tags() {
        let response = ClusterMessage::JoinResponse {
            status: JoinStatus::Rejected,
            responder: node_id("seed"),
            cluster_nodes: vec![],
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"type\":\"cluster_join_response\""));
        assert!(json.contains("\"status\":\"rejected\""));
        assert!(json.contains("\"responder\":\"seed\""));
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let message = ClusterMessage::FullSyncRequest {
            node_id: node_id("asker"),
        };
        write_frame(&mut client, &message).await.unwrap();

        let received = read_frame(&mut server).await.unwrap();
        match received {
            ClusterMessage::FullSyncRequest { node_id } => {
                assert_eq!(node_id.as_str(), "asker");
            }
            other => panic!("expected FullSyncRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_sequencing() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        for i in 0..3u64 {
            let message = ClusterMessage::Heartbeat {
                node_id: node_id("seq"),
                status: NodeStatus::Active,
                atomspace_size: i,
                load_factor: 0.0,
                timestamp: Utc::now(),
            };
            write_frame(&mut client, &message).await.unwrap();
        }

        for i in 0..3u64 {
            match read_frame(&mut server).await.unwrap() {
                ClusterMessage::Heartbeat { atomspace_size, .. } => {
                    assert_eq!(atomspace_size, i);
                }
                other => panic!("expected Heartbeat, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversize_header() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let huge = (MAX_FRAME_BYTES as u32) + 1;
        client.write_all(&huge.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_truncated_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        // Advertise 100 bytes, deliver 3, then hang up.
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[tokio::test]
    async fn test_read_frame_garbage_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let garbage = b"not json at all";
        client
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(garbage).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }
}
