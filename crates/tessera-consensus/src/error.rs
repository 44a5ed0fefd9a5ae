//! Consensus error types.

use crate::crypto::MemberId;
use crate::types::Phase;
use thiserror::Error;

/// Errors that can occur during consensus operations.
///
/// Message-level variants never escape a handler: the dispatcher logs them
/// and drops the offending message. Configuration variants are only
/// produced at startup.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The committee is empty.
    #[error("committee has no members")]
    EmptyCommittee,

    /// A member key appears more than once in the committee.
    #[error("duplicate committee member: {0}")]
    DuplicateMember(MemberId),

    /// The configured quorum cannot be used with this committee.
    #[error("invalid quorum {quorum} for committee of {members}")]
    InvalidQuorum {
        /// Configured quorum size.
        quorum: usize,
        /// Committee size.
        members: usize,
    },

    /// The local signing key is not part of the committee.
    #[error("local key {0} is not a committee member")]
    NotMember(MemberId),

    /// Configuration is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A key could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signature verification failed.
    #[error("bad signature from {0}")]
    BadSignature(MemberId),

    /// The signer is not a member of the committee.
    #[error("signer {0} is not a committee member")]
    UnknownSigner(MemberId),

    /// The sender is not the leader of the message view.
    #[error("{signer} is not the leader of view {view}")]
    NotLeader {
        /// Claimed sender.
        signer: MemberId,
        /// View the message was sent for.
        view: u64,
    },

    /// The message refers to a view this node has already left.
    #[error("stale view {got}, local view is {local}")]
    StaleView {
        /// View in the message.
        got: u64,
        /// Local view.
        local: u64,
    },

    /// The message belongs to a different view than the local one.
    #[error("view mismatch: message for view {got}, local view is {local}")]
    ViewMismatch {
        /// View in the message.
        got: u64,
        /// Local view.
        local: u64,
    },

    /// The message view is too far ahead to be trusted.
    #[error("view {got} is out of range, local view is {local}")]
    ViewOutOfRange {
        /// View in the message.
        got: u64,
        /// Local view.
        local: u64,
    },

    /// The message phase is not the expected successor of the local phase.
    #[error("unexpected phase {got}, local phase is {local}")]
    UnexpectedPhase {
        /// Phase in the message.
        got: Phase,
        /// Local phase.
        local: Phase,
    },

    /// A quorum certificate failed validation.
    #[error("invalid quorum certificate: {0}")]
    InvalidQc(String),

    /// A proposal failed validation.
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    /// A vote failed validation.
    #[error("invalid vote: {0}")]
    InvalidVote(String),

    /// The message could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// State persistence failed.
    #[error("state store error: {0}")]
    Store(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport rejected a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// The engine is already running.
    #[error("engine already running")]
    AlreadyRunning,
}

/// A specialized Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
