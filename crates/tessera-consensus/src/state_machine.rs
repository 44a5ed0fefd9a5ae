//! Synchronous consensus core.
//!
//! [`ConsensusCore`] owns the replica and leader state machines and
//! serializes every state transition behind one lock. Inputs are decoded
//! messages, timer expiries and proposal ticks; outputs are [`Action`]s.
//! Messages the node addresses to itself (its own votes and NewViews while
//! it leads) are delivered in place and never reach the transport.

use crate::action::{Action, ConsensusEvent};
use crate::config::ConsensusConfig;
use crate::context::RoundContext;
use crate::crypto::{Digest, Keypair, MemberId};
use crate::error::{ConsensusError, Result};
use crate::leader::{Leader, ProposalSlot};
use crate::liveness::Liveness;
use crate::message::ConsensusMessage;
use crate::metrics::ConsensusMetrics;
use crate::replica::Replica;
use crate::store::StateStore;
use crate::types::{Phase, SignedConsensusData, Vote};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time view of consensus progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusStatus {
    /// Current view.
    pub view: u64,
    /// Current phase.
    pub phase: Phase,
    /// Committed payloads.
    pub height: u64,
    /// Digest of the last committed payload.
    pub committed: Digest,
    /// Leader of the current view.
    pub leader: MemberId,
    /// Whether the local node leads the current view.
    pub is_leader: bool,
    /// View of the current lock, if any.
    pub locked_view: Option<u64>,
}

/// Replica and leader composed over a shared round context.
pub struct ConsensusCore {
    ctx: Arc<RoundContext>,
    replica: Mutex<Replica>,
    leader: Leader,
    liveness: Liveness,
    status: RwLock<ConsensusStatus>,
    metrics: Arc<ConsensusMetrics>,
}

impl ConsensusCore {
    /// Creates the core, resuming from `store` when it holds saved state.
    pub fn new(
        config: &ConsensusConfig,
        keypair: Keypair,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let ctx = Arc::new(RoundContext::new(config, keypair)?);
        let replica = Replica::new(ctx.clone(), store)?;
        let status = RwLock::new(Self::snapshot(&ctx, &replica));
        let metrics = Arc::new(ConsensusMetrics::new());
        metrics.current_view.set(replica.state().view as i64);
        metrics.current_height.set(replica.state().height as i64);

        info!(
            member = %ctx.me(),
            members = ctx.committee().len(),
            quorum = ctx.committee().quorum(),
            view = replica.state().view,
            "consensus core ready"
        );

        Ok(Self {
            leader: Leader::new(ctx.clone()),
            liveness: Liveness::new(ctx.committee().clone(), ctx.me()),
            replica: Mutex::new(replica),
            ctx,
            status,
            metrics,
        })
    }

    /// The shared round context.
    pub fn context(&self) -> &Arc<RoundContext> {
        &self.ctx
    }

    /// Node metrics.
    pub fn metrics(&self) -> &Arc<ConsensusMetrics> {
        &self.metrics
    }

    /// Senders of accepted messages, by when they were last heard from.
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Latest status. Never blocks on the consensus lock.
    pub fn status(&self) -> ConsensusStatus {
        self.status.read().clone()
    }

    /// Announces the current view to its leader.
    pub fn start(&self) -> Vec<Action> {
        let mut replica = self.replica.lock();
        let actions = replica.start_round();
        self.route(&mut replica, actions)
    }

    /// Handles one inbound message. Invalid messages are logged and dropped.
    pub fn handle(&self, message: ConsensusMessage) -> Vec<Action> {
        let mut replica = self.replica.lock();
        let actions = self.dispatch(&mut replica, message);
        self.route(&mut replica, actions)
    }

    /// Abandons the current view.
    pub fn on_timeout(&self) -> Vec<Action> {
        let mut replica = self.replica.lock();
        let actions = replica.on_timeout();
        self.route(&mut replica, actions)
    }

    /// The slot the local node may propose in right now, if any.
    pub fn proposal_slot(&self) -> Option<ProposalSlot> {
        let replica = self.replica.lock();
        self.leader.proposal_slot(replica.state())
    }

    /// Proposes in `slot`. A slot that went stale while the payload was being
    /// fetched is dropped.
    pub fn propose(&self, slot: ProposalSlot, data: Vec<u8>) -> Vec<Action> {
        let mut replica = self.replica.lock();

        let current = self.leader.proposal_slot(replica.state());
        if current.as_ref().map(|s| s.view) != Some(slot.view) {
            debug!(view = slot.view, "proposal slot went stale");
            return Vec::new();
        }

        let committed = replica.state().committed.clone();
        let prepare = match self.leader.propose(slot, &committed, data) {
            Ok(prepare) => prepare,
            Err(e) => {
                warn!(error = %e, "failed to build proposal");
                return Vec::new();
            }
        };

        let mut actions = vec![Action::Broadcast {
            message: ConsensusMessage::Prepare(prepare.clone()),
        }];
        match replica.on_prepare(&prepare) {
            Ok(own) => actions.extend(own),
            Err(e) => warn!(view = prepare.data.view, error = %e, "own proposal rejected locally"),
        }
        self.route(&mut replica, actions)
    }

    /// Delivers self-addressed messages in place and returns what is left
    /// for the engine.
    fn route(&self, replica: &mut Replica, actions: Vec<Action>) -> Vec<Action> {
        let me = self.ctx.me();
        let mut queue: VecDeque<Action> = actions.into();
        let mut out = Vec::with_capacity(queue.len());

        while let Some(action) = queue.pop_front() {
            match action {
                Action::SendToLeader { leader, message } if leader == me => {
                    queue.extend(self.dispatch(replica, message));
                }
                other => out.push(other),
            }
        }

        self.leader.prune_below(replica.state().view);
        *self.status.write() = Self::snapshot(&self.ctx, replica);
        self.metrics.observe(&out);
        out
    }

    fn dispatch(&self, replica: &mut Replica, message: ConsensusMessage) -> Vec<Action> {
        let kind = message.kind();
        let view = message.view();
        let from = message.signer();

        let result = match message {
            ConsensusMessage::Vote(vote) => self.on_vote(replica, &vote),
            ConsensusMessage::NewView(m) => {
                Self::check_envelope(kind, &m).and_then(|_| self.on_new_view(replica, &m))
            }
            ConsensusMessage::Prepare(m) => {
                Self::check_envelope(kind, &m).and_then(|_| replica.on_prepare(&m))
            }
            ConsensusMessage::PreCommit(m)
            | ConsensusMessage::Commit(m)
            | ConsensusMessage::Decide(m) => {
                Self::check_envelope(kind, &m).and_then(|_| replica.on_phase(&m))
            }
        };

        match result {
            Ok(actions) => {
                self.liveness.record(from);
                actions
            }
            Err(
                e @ (ConsensusError::BadSignature(_)
                | ConsensusError::UnknownSigner(_)
                | ConsensusError::NotLeader { .. }
                | ConsensusError::ViewOutOfRange { .. }
                | ConsensusError::InvalidQc(_)),
            ) => {
                warn!(kind, view, from = %from, error = %e, "rejected consensus message");
                self.metrics.message_dropped(kind);
                Vec::new()
            }
            Err(e) => {
                debug!(kind, view, from = %from, error = %e, "dropped consensus message");
                self.metrics.message_dropped(kind);
                Vec::new()
            }
        }
    }

    fn check_envelope(kind: &str, signed: &SignedConsensusData) -> Result<()> {
        if signed.data.phase.as_str() != kind {
            return Err(ConsensusError::InvalidProposal(format!(
                "{} envelope carries {} data",
                kind, signed.data.phase
            )));
        }
        Ok(())
    }

    fn on_new_view(&self, replica: &mut Replica, msg: &SignedConsensusData) -> Result<Vec<Action>> {
        let local = replica.state().view;
        let outcome = self.leader.on_new_view(local, msg)?;

        if outcome.quorum_reached && outcome.view > local {
            info!(
                from = local,
                to = outcome.view,
                "quorum entered a later view, following"
            );
            return Ok(replica.enter_view(outcome.view));
        }
        Ok(Vec::new())
    }

    fn on_vote(&self, replica: &mut Replica, vote: &Vote) -> Result<Vec<Action>> {
        let Some(next) = self.leader.on_vote(replica.state().view, vote)? else {
            return Ok(Vec::new());
        };

        let justify = &next.data.justify;
        let mut actions = vec![
            Action::Notify(ConsensusEvent::QcFormed {
                view: justify.view(),
                phase: justify.phase(),
            }),
            Action::Broadcast {
                message: ConsensusMessage::for_phase(next.clone()),
            },
        ];

        match replica.apply_phase(&next.data) {
            Ok(own) => actions.extend(own),
            Err(e) => warn!(
                view = next.data.view,
                phase = %next.data.phase,
                error = %e,
                "local replica is out of step with its own round"
            ),
        }
        Ok(actions)
    }

    fn snapshot(ctx: &RoundContext, replica: &Replica) -> ConsensusStatus {
        let state = replica.state();
        ConsensusStatus {
            view: state.view,
            phase: state.phase,
            height: state.height,
            committed: state.committed.clone(),
            leader: ctx.leader(state.view),
            is_leader: ctx.is_leader(state.view),
            locked_view: state.locked_qc.as_ref().map(|qc| qc.view()),
        }
    }
}
