//! Consensus value types.
//!
//! Everything here is an immutable value once constructed: certificates and
//! round data are cloned freely between the vote-collection and broadcast
//! paths.

use crate::crypto::{Digest, HashAlgorithm, MemberId, Signature};
use crate::error::ConsensusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How far past both the local view and its certified justification a
/// message may move a node.
pub const MAX_VIEW_JUMP: u64 = 1 << 16;

/// Checks that `view` is at most [`MAX_VIEW_JUMP`] ahead of the higher of
/// `local` and `certified`, and leaves room for a following view.
pub(crate) fn check_view_bound(
    view: u64,
    local: u64,
    certified: u64,
) -> Result<(), ConsensusError> {
    if view == u64::MAX || view.saturating_sub(local.max(certified)) > MAX_VIEW_JUMP {
        return Err(ConsensusError::ViewOutOfRange { got: view, local });
    }
    Ok(())
}

/// A stage of the per-view agreement protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Waiting for the view's leader to propose.
    NewView,
    /// Proposal received and voted on.
    Prepare,
    /// Prepare certificate received.
    PreCommit,
    /// PreCommit certificate received; the replica is locked.
    Commit,
    /// Commit certificate received; the payload is final.
    Decide,
}

impl Phase {
    /// All phases in protocol order.
    pub const ALL: [Phase; 5] = [
        Phase::NewView,
        Phase::Prepare,
        Phase::PreCommit,
        Phase::Commit,
        Phase::Decide,
    ];

    /// Returns the wire tag for this phase.
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::NewView => "NewView",
            Phase::Prepare => "Prepare",
            Phase::PreCommit => "PreCommit",
            Phase::Commit => "Commit",
            Phase::Decide => "Decide",
        }
    }

    /// The phase that follows this one within a view.
    pub const fn successor(self) -> Option<Phase> {
        match self {
            Phase::NewView => Some(Phase::Prepare),
            Phase::Prepare => Some(Phase::PreCommit),
            Phase::PreCommit => Some(Phase::Commit),
            Phase::Commit => Some(Phase::Decide),
            Phase::Decide => None,
        }
    }

    /// The phase whose certificate justifies a message of this phase.
    pub const fn predecessor(self) -> Option<Phase> {
        match self {
            Phase::NewView => None,
            Phase::Prepare => Some(Phase::NewView),
            Phase::PreCommit => Some(Phase::Prepare),
            Phase::Commit => Some(Phase::PreCommit),
            Phase::Decide => Some(Phase::Commit),
        }
    }

    pub(crate) const fn tag(self) -> u8 {
        match self {
            Phase::NewView => 0,
            Phase::Prepare => 1,
            Phase::PreCommit => 2,
            Phase::Commit => 3,
            Phase::Decide => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// Opaque content being agreed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsensusPayload {
    /// Digest of the previously committed payload.
    pub parent: Digest,
    /// Application-defined bytes.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl ConsensusPayload {
    /// Creates a payload chained to `parent`.
    pub fn new(parent: Digest, data: impl Into<Vec<u8>>) -> Self {
        Self {
            parent,
            data: data.into(),
        }
    }

    /// The payload every chain starts from.
    pub fn genesis(hash: HashAlgorithm) -> Self {
        Self::new(hash.genesis(), Vec::new())
    }
}

/// Unsigned certificate body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QcData {
    /// Phase the votes were cast in.
    pub phase: Phase,
    /// View the votes were cast in.
    pub view: u64,
    /// Payload voted for.
    pub payload: ConsensusPayload,
}

/// A signature attached by a named committee member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    /// Signing member.
    pub signer: MemberId,
    /// Signature over the hash of the canonical encoding.
    pub signature: Signature,
}

/// Quorum certificate: proof that a quorum of members voted for `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qc {
    /// Certified body.
    pub data: QcData,
    /// Vote seals, ordered by committee index.
    pub votes: Vec<Seal>,
}

impl Qc {
    /// The certificate every node holds before any round completes.
    pub fn genesis(hash: HashAlgorithm) -> Self {
        Self {
            data: QcData {
                phase: Phase::NewView,
                view: 0,
                payload: ConsensusPayload::genesis(hash),
            },
            votes: Vec::new(),
        }
    }

    /// Returns true for the vote-less genesis certificate.
    pub fn is_genesis(&self) -> bool {
        self.votes.is_empty()
            && self.data.phase == Phase::NewView
            && self.data.view == 0
            && self.data.payload.data.is_empty()
            && self.data.payload.parent.as_bytes().iter().all(|b| *b == 0)
    }

    /// View the certificate was formed in.
    pub fn view(&self) -> u64 {
        self.data.view
    }

    /// Phase the certificate was formed in.
    pub fn phase(&self) -> Phase {
        self.data.phase
    }

    /// Certified payload.
    pub fn payload(&self) -> &ConsensusPayload {
        &self.data.payload
    }
}

/// A round's working state as sent by the leader (or by a replica for
/// NewView).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusData {
    /// View number.
    pub view: u64,
    /// Declared phase.
    pub phase: Phase,
    /// Payload under agreement.
    pub payload: ConsensusPayload,
    /// Certificate of the preceding phase (or highest known QC for NewView).
    pub justify: Qc,
}

/// Wire message: round data plus the sender's seal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConsensusData {
    /// Signed body.
    pub data: ConsensusData,
    /// Sender seal.
    pub seal: Seal,
}

impl SignedConsensusData {
    /// Declared sender.
    pub fn signer(&self) -> MemberId {
        self.seal.signer
    }
}

/// A replica's vote, addressed to the leader only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Voted body.
    pub data: QcData,
    /// Voter seal.
    pub seal: Seal,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::NewView.successor(), Some(Phase::Prepare));
        assert_eq!(Phase::Commit.successor(), Some(Phase::Decide));
        assert_eq!(Phase::Decide.successor(), None);
        assert_eq!(Phase::Decide.predecessor(), Some(Phase::Commit));
        assert!(Phase::Prepare < Phase::Commit);
    }

    #[test]
    fn test_phase_tags() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!("END".parse::<Phase>().is_err());
    }

    #[test]
    fn test_genesis_qc() {
        let qc = Qc::genesis(HashAlgorithm::Sha256);
        assert!(qc.is_genesis());
        assert_eq!(qc.view(), 0);

        let mut forged = qc.clone();
        forged.data.payload.data = b"x".to_vec();
        assert!(!forged.is_genesis());
    }

    #[test]
    fn test_payload_json_is_hex() {
        let payload = ConsensusPayload::new(HashAlgorithm::Sha256.genesis(), b"\x01\x02".to_vec());
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"0102\""));

        let parsed: ConsensusPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }
}
