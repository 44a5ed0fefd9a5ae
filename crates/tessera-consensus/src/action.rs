//! Commands emitted by the consensus state machines.

use crate::crypto::{Digest, MemberId};
use crate::message::ConsensusMessage;
use crate::types::{ConsensusPayload, Phase};
use std::time::Duration;

/// Something the runner must do on behalf of the state machines.
///
/// Handlers never perform I/O. They return actions and the engine executes
/// them in order once the consensus lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a message to a single member, normally the view's leader.
    SendToLeader {
        /// Destination member.
        leader: MemberId,
        /// Message to deliver.
        message: ConsensusMessage,
    },

    /// Send a message to every other member.
    Broadcast {
        /// Message to deliver.
        message: ConsensusMessage,
    },

    /// Hand a decided payload to the application.
    Execute {
        /// View the payload was decided in.
        view: u64,
        /// Chain height after this commit.
        height: u64,
        /// Decided payload.
        payload: ConsensusPayload,
    },

    /// Push the view-change deadline out by `timeout`.
    ResetTimer {
        /// Time until the next view change.
        timeout: Duration,
    },

    /// Publish an event to subscribers.
    Notify(ConsensusEvent),
}

/// Observable consensus progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// The local leader formed a quorum certificate.
    QcFormed {
        /// View of the certificate.
        view: u64,
        /// Phase of the certificate.
        phase: Phase,
    },

    /// A payload was committed.
    Committed {
        /// View it was decided in.
        view: u64,
        /// Chain height after the commit.
        height: u64,
        /// Digest of the committed payload.
        digest: Digest,
    },

    /// The local node entered a new view.
    ViewChanged {
        /// The new view.
        view: u64,
        /// Its leader.
        leader: MemberId,
    },

    /// The view timed out without progress.
    TimedOut {
        /// The view that was abandoned.
        view: u64,
    },
}
