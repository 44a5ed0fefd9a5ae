//! Leader state machine.
//!
//! The leader of a view collects NewView messages, proposes once a quorum of
//! members has entered the view, and turns each phase's votes into the
//! certificate that justifies the next phase. Its own replica still votes:
//! those votes come back through [`Leader::on_vote`] like anyone else's.

use crate::context::RoundContext;
use crate::crypto::Digest;
use crate::error::{ConsensusError, Result};
use crate::qc::{VoteCollector, VoteOutcome};
use crate::replica::ReplicaState;
use crate::types::{
    check_view_bound, ConsensusData, ConsensusPayload, Phase, Qc, QcData, SignedConsensusData,
    Vote,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// A view in which the local node may propose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalSlot {
    /// View to propose in.
    pub view: u64,
    /// Highest certificate reported by the NewView quorum.
    pub high_qc: Qc,
    /// Payload that must be proposed again instead of fresh data.
    pub reproposal: Option<ConsensusPayload>,
}

impl ProposalSlot {
    /// Whether the application must supply data for this slot.
    pub fn needs_payload(&self) -> bool {
        self.reproposal.is_none()
    }
}

/// What a NewView did to the leader's round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewViewOutcome {
    /// View the NewView was for.
    pub view: u64,
    /// Distinct members known to have entered that view.
    pub count: usize,
    /// Whether that count reaches the quorum.
    pub quorum_reached: bool,
}

/// The leader state machine.
pub struct Leader {
    ctx: Arc<RoundContext>,
    votes: VoteCollector,
}

impl Leader {
    /// Creates a leader with an empty collector.
    pub fn new(ctx: Arc<RoundContext>) -> Self {
        let votes = VoteCollector::new(ctx.committee().clone(), *ctx.codec());
        Self { ctx, votes }
    }

    /// The underlying collector.
    pub fn collector(&self) -> &VoteCollector {
        &self.votes
    }

    /// Records a member entering a view the local node leads.
    pub fn on_new_view(&self, local_view: u64, msg: &SignedConsensusData) -> Result<NewViewOutcome> {
        let data = &msg.data;
        if data.phase != Phase::NewView {
            return Err(ConsensusError::UnexpectedPhase {
                got: data.phase,
                local: Phase::NewView,
            });
        }

        self.ctx.verify_signed(msg)?;

        if !self.ctx.is_leader(data.view) {
            return Err(ConsensusError::NotLeader {
                signer: self.ctx.me(),
                view: data.view,
            });
        }
        if data.view < local_view {
            return Err(ConsensusError::StaleView {
                got: data.view,
                local: local_view,
            });
        }

        let justify = &data.justify;
        if *justify != self.ctx.genesis_qc() {
            if justify.phase() != Phase::Prepare || justify.view() >= data.view {
                return Err(ConsensusError::InvalidQc(format!(
                    "NewView for view {} carries a {} certificate from view {}",
                    data.view,
                    justify.phase(),
                    justify.view()
                )));
            }
            self.ctx.verify_qc(justify)?;
        }
        check_view_bound(data.view, local_view, justify.view())?;

        let count = self
            .votes
            .add_new_view(data.view, &msg.signer(), justify.clone())?;
        let quorum = self.ctx.committee().quorum();
        trace!(view = data.view, from = %msg.signer(), count, quorum, "NewView recorded");

        Ok(NewViewOutcome {
            view: data.view,
            count,
            quorum_reached: count >= quorum,
        })
    }

    /// Returns the slot to propose in, if the local node leads the current
    /// view, has not proposed yet, and a quorum has entered the view.
    pub fn proposal_slot(&self, state: &ReplicaState) -> Option<ProposalSlot> {
        let view = state.view;
        if !self.ctx.is_leader(view) || state.phase != Phase::NewView {
            return None;
        }
        if self.votes.new_view_count(view) < self.ctx.committee().quorum() {
            return None;
        }

        let high_qc = self
            .votes
            .high_qc(view)
            .unwrap_or_else(|| self.ctx.genesis_qc());

        // An uncommitted certified payload on the committed chain may already
        // be locked by some members; proposing anything else would stall.
        let reproposal = (!high_qc.is_genesis()
            && high_qc.phase() == Phase::Prepare
            && high_qc.payload().parent == state.committed)
            .then(|| high_qc.payload().clone());

        Some(ProposalSlot {
            view,
            high_qc,
            reproposal,
        })
    }

    /// Builds and signs the Prepare for `slot`, opening vote collection for
    /// it. `data` is ignored when the slot re-proposes.
    pub fn propose(
        &self,
        slot: ProposalSlot,
        committed: &Digest,
        data: Vec<u8>,
    ) -> Result<SignedConsensusData> {
        let payload = slot
            .reproposal
            .unwrap_or_else(|| ConsensusPayload::new(committed.clone(), data));

        self.votes.open(QcData {
            phase: Phase::Prepare,
            view: slot.view,
            payload: payload.clone(),
        })?;

        debug!(
            view = slot.view,
            justify_view = slot.high_qc.view(),
            bytes = payload.data.len(),
            "proposing"
        );

        Ok(self.ctx.sign(ConsensusData {
            view: slot.view,
            phase: Phase::Prepare,
            payload,
            justify: slot.high_qc,
        }))
    }

    /// Counts a vote. Returns the next phase message once the vote completes
    /// a certificate.
    pub fn on_vote(&self, local_view: u64, vote: &Vote) -> Result<Option<SignedConsensusData>> {
        let view = vote.data.view;
        if !self.ctx.is_leader(view) {
            return Err(ConsensusError::InvalidVote(format!(
                "vote for view {} sent to a non-leader",
                view
            )));
        }
        if view != local_view {
            return Err(ConsensusError::ViewMismatch {
                got: view,
                local: local_view,
            });
        }

        let qc = match self.votes.add_vote(vote)? {
            VoteOutcome::Certified(qc) => qc,
            VoteOutcome::Pending { votes, quorum } => {
                trace!(view, phase = %vote.data.phase, votes, quorum, "vote counted");
                return Ok(None);
            }
            VoteOutcome::AlreadyCertified => return Ok(None),
        };

        let Some(next) = qc.phase().successor() else {
            return Ok(None);
        };
        if next != Phase::Decide {
            self.votes.open(QcData {
                phase: next,
                view,
                payload: qc.payload().clone(),
            })?;
        }

        Ok(Some(self.ctx.sign(ConsensusData {
            view,
            phase: next,
            payload: qc.payload().clone(),
            justify: qc,
        })))
    }

    /// Drops collection state for views below `view`.
    pub fn prune_below(&self, view: u64) {
        self.votes.prune_below(view);
    }
}
