//! Consensus message envelopes exchanged between committee members.
//!
//! Leader and replicas exchange these during a view:
//! - `NewView` flows from every member to the next leader
//! - `Prepare`, `PreCommit`, `Commit` and `Decide` are broadcast by the leader
//! - `Vote` flows from each replica back to the leader only

use crate::crypto::MemberId;
use crate::types::{Phase, SignedConsensusData, Vote};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Consensus messages exchanged between committee members.
///
/// The `type` tag doubles as the dispatch key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ConsensusMessage {
    /// A member entering a view, carrying its highest known QC.
    NewView(SignedConsensusData),

    /// The leader's proposal.
    Prepare(SignedConsensusData),

    /// Carries the Prepare QC.
    PreCommit(SignedConsensusData),

    /// Carries the PreCommit QC; replicas lock on it.
    Commit(SignedConsensusData),

    /// Carries the Commit QC; the payload is final.
    Decide(SignedConsensusData),

    /// A replica's vote for the current phase.
    Vote(Vote),
}

impl ConsensusMessage {
    /// Wraps signed round data in the envelope matching its declared phase.
    pub fn for_phase(signed: SignedConsensusData) -> Self {
        match signed.data.phase {
            Phase::NewView => ConsensusMessage::NewView(signed),
            Phase::Prepare => ConsensusMessage::Prepare(signed),
            Phase::PreCommit => ConsensusMessage::PreCommit(signed),
            Phase::Commit => ConsensusMessage::Commit(signed),
            Phase::Decide => ConsensusMessage::Decide(signed),
        }
    }

    /// Encodes the message to bytes.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decodes a message from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Returns the message type as a string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::NewView(_) => Phase::NewView.as_str(),
            ConsensusMessage::Prepare(_) => Phase::Prepare.as_str(),
            ConsensusMessage::PreCommit(_) => Phase::PreCommit.as_str(),
            ConsensusMessage::Commit(_) => Phase::Commit.as_str(),
            ConsensusMessage::Decide(_) => Phase::Decide.as_str(),
            ConsensusMessage::Vote(_) => "Vote",
        }
    }

    /// The view the message belongs to.
    pub fn view(&self) -> u64 {
        match self {
            ConsensusMessage::NewView(m)
            | ConsensusMessage::Prepare(m)
            | ConsensusMessage::PreCommit(m)
            | ConsensusMessage::Commit(m)
            | ConsensusMessage::Decide(m) => m.data.view,
            ConsensusMessage::Vote(v) => v.data.view,
        }
    }

    /// The member that signed the message.
    pub fn signer(&self) -> MemberId {
        match self {
            ConsensusMessage::NewView(m)
            | ConsensusMessage::Prepare(m)
            | ConsensusMessage::PreCommit(m)
            | ConsensusMessage::Commit(m)
            | ConsensusMessage::Decide(m) => m.seal.signer,
            ConsensusMessage::Vote(v) => v.seal.signer,
        }
    }
}
