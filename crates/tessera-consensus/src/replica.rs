//! Replica state machine.
//!
//! Every member runs one replica, including the view's leader. The replica
//! validates the leader's phase messages, votes, locks, commits, and moves to
//! the next view on Decide or timeout. It never performs I/O: each handler
//! returns the [`Action`]s the engine must carry out.
//!
//! # Acceptance rules
//!
//! A Prepare is accepted when it is signed by the leader of its view, the
//! view is not behind the local one, the replica has not voted Prepare in
//! that view, the payload extends the committed chain, and the proposal is
//! safe with respect to the current lock.
//!
//! PreCommit, Commit and Decide are accepted only for the local view, only as
//! the direct successor of the local phase, and only when justified by a
//! valid certificate of the preceding phase over the payload being voted on.
//! A Decide the replica missed the preceding phases for is still applied if
//! its Commit certificate is valid and extends the committed chain.

use crate::action::{Action, ConsensusEvent};
use crate::context::RoundContext;
use crate::crypto::Digest;
use crate::error::{ConsensusError, Result};
use crate::message::ConsensusMessage;
use crate::store::{PersistedState, StateStore};
use crate::types::{
    check_view_bound, ConsensusData, ConsensusPayload, Phase, Qc, QcData, SignedConsensusData,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Mutable per-node consensus state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaState {
    /// Current view. Never decreases.
    pub view: u64,
    /// Current phase within the view.
    pub phase: Phase,
    /// Highest Prepare QC seen.
    pub prepare_qc: Option<Qc>,
    /// PreCommit QC the replica is locked on.
    pub locked_qc: Option<Qc>,
    /// Payload voted for in the current view.
    pub proposal: Option<ConsensusPayload>,
    /// Digest of the last committed payload.
    pub committed: Digest,
    /// Number of committed payloads.
    pub height: u64,
}

/// The replica state machine.
pub struct Replica {
    ctx: Arc<RoundContext>,
    store: Arc<dyn StateStore>,
    state: ReplicaState,
}

impl Replica {
    /// Creates a replica, resuming from `store` if it holds saved progress.
    ///
    /// A resumed replica enters the view after the saved one so it cannot
    /// vote twice in a view it may already have voted in.
    pub fn new(ctx: Arc<RoundContext>, store: Arc<dyn StateStore>) -> Result<Self> {
        let hash = ctx.codec().hash_algorithm();
        let state = match store.load()? {
            Some(saved) => {
                info!(
                    view = saved.view,
                    height = saved.height,
                    committed = %saved.committed,
                    "resuming consensus from saved state"
                );
                let view = saved
                    .view
                    .checked_add(1)
                    .ok_or(ConsensusError::ViewOutOfRange {
                        got: saved.view,
                        local: saved.view,
                    })?;
                ReplicaState {
                    view,
                    phase: Phase::NewView,
                    prepare_qc: saved.prepare_qc,
                    locked_qc: saved.locked_qc,
                    proposal: None,
                    committed: saved.committed,
                    height: saved.height,
                }
            }
            None => ReplicaState {
                view: 0,
                phase: Phase::NewView,
                prepare_qc: None,
                locked_qc: None,
                proposal: None,
                committed: hash.genesis(),
                height: 0,
            },
        };

        let replica = Self { ctx, store, state };
        replica.persist();
        Ok(replica)
    }

    /// Current state.
    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    /// The highest certificate to hand to the next leader.
    pub fn high_qc(&self) -> Qc {
        self.state
            .prepare_qc
            .clone()
            .unwrap_or_else(|| self.ctx.genesis_qc())
    }

    /// Announces the current view to its leader and arms the timer.
    pub fn start_round(&self) -> Vec<Action> {
        let view = self.state.view;
        let justify = self.high_qc();
        let new_view = self.ctx.sign(ConsensusData {
            view,
            phase: Phase::NewView,
            payload: justify.payload().clone(),
            justify,
        });

        vec![
            Action::SendToLeader {
                leader: self.ctx.leader(view),
                message: ConsensusMessage::NewView(new_view),
            },
            Action::ResetTimer {
                timeout: self.ctx.timeout(),
            },
        ]
    }

    /// Handles the leader's proposal.
    pub fn on_prepare(&mut self, msg: &SignedConsensusData) -> Result<Vec<Action>> {
        let data = &msg.data;
        if data.phase != Phase::Prepare {
            return Err(ConsensusError::UnexpectedPhase {
                got: data.phase,
                local: self.state.phase,
            });
        }

        self.ctx.verify_signed(msg)?;
        self.check_leader(msg)?;

        if data.view < self.state.view {
            return Err(ConsensusError::StaleView {
                got: data.view,
                local: self.state.view,
            });
        }
        if data.view == self.state.view && self.state.phase != Phase::NewView {
            return Err(ConsensusError::UnexpectedPhase {
                got: Phase::Prepare,
                local: self.state.phase,
            });
        }

        check_view_bound(data.view, self.state.view, data.justify.view())?;

        let justify = &data.justify;
        if *justify != self.ctx.genesis_qc() {
            if justify.phase() != Phase::Prepare {
                return Err(ConsensusError::InvalidQc(format!(
                    "proposal justified by a {} certificate",
                    justify.phase()
                )));
            }
            if justify.view() >= data.view {
                return Err(ConsensusError::InvalidQc(format!(
                    "justify view {} is not below proposal view {}",
                    justify.view(),
                    data.view
                )));
            }
            self.ctx.verify_qc(justify)?;
        }

        if data.payload.parent != self.state.committed {
            return Err(ConsensusError::InvalidProposal(format!(
                "parent {} does not extend committed {}",
                data.payload.parent, self.state.committed
            )));
        }

        self.check_safe_node(data)?;

        let mut actions = Vec::new();
        if data.view > self.state.view {
            warn!(
                local = self.state.view,
                view = data.view,
                "proposal from a later view, catching up"
            );
            actions.extend(self.advance_to(data.view));
        }

        debug!(view = data.view, leader = %msg.signer(), "accepted proposal");
        self.state.phase = Phase::Prepare;
        self.state.proposal = Some(data.payload.clone());

        actions.push(self.vote(Phase::Prepare, data.payload.clone()));
        actions.push(Action::ResetTimer {
            timeout: self.ctx.timeout(),
        });
        Ok(actions)
    }

    /// Handles a PreCommit, Commit or Decide from the leader.
    pub fn on_phase(&mut self, msg: &SignedConsensusData) -> Result<Vec<Action>> {
        let data = &msg.data;
        if self.ctx.is_leader(data.view) {
            return Err(ConsensusError::InvalidProposal(format!(
                "{} for view {} is our own",
                data.phase, data.view
            )));
        }

        self.ctx.verify_signed(msg)?;
        self.check_leader(msg)?;

        if data.phase == Phase::Decide
            && !(data.view == self.state.view && self.state.phase == Phase::Commit)
        {
            return self.catch_up(data);
        }

        if data.view != self.state.view {
            return Err(ConsensusError::ViewMismatch {
                got: data.view,
                local: self.state.view,
            });
        }
        if self.state.phase.successor() != Some(data.phase) {
            return Err(ConsensusError::UnexpectedPhase {
                got: data.phase,
                local: self.state.phase,
            });
        }

        let expected = data.phase.predecessor();
        let justify = &data.justify;
        if Some(justify.phase()) != expected
            || justify.view() != data.view
            || justify.payload() != &data.payload
        {
            return Err(ConsensusError::InvalidQc(format!(
                "{} is not justified by a {:?} certificate for view {}",
                data.phase, expected, data.view
            )));
        }
        if self.state.proposal.as_ref() != Some(&data.payload) {
            return Err(ConsensusError::InvalidProposal(
                "payload differs from the accepted proposal".into(),
            ));
        }
        self.ctx.verify_qc(justify)?;

        self.apply_phase(data)
    }

    /// Applies an already validated PreCommit, Commit or Decide.
    ///
    /// The leader calls this directly for the phases it drives itself.
    pub(crate) fn apply_phase(&mut self, data: &ConsensusData) -> Result<Vec<Action>> {
        if data.view != self.state.view || self.state.phase.successor() != Some(data.phase) {
            return Err(ConsensusError::UnexpectedPhase {
                got: data.phase,
                local: self.state.phase,
            });
        }

        match data.phase {
            Phase::PreCommit => {
                self.update_prepare_qc(&data.justify);
                self.state.phase = Phase::PreCommit;
                self.persist();
                Ok(vec![
                    self.vote(Phase::PreCommit, data.payload.clone()),
                    Action::ResetTimer {
                        timeout: self.ctx.timeout(),
                    },
                ])
            }
            Phase::Commit => {
                self.update_locked_qc(&data.justify);
                self.state.phase = Phase::Commit;
                self.persist();
                Ok(vec![
                    self.vote(Phase::Commit, data.payload.clone()),
                    Action::ResetTimer {
                        timeout: self.ctx.timeout(),
                    },
                ])
            }
            Phase::Decide => {
                self.state.phase = Phase::Decide;
                Ok(self.decide(&data.justify))
            }
            Phase::NewView | Phase::Prepare => Err(ConsensusError::UnexpectedPhase {
                got: data.phase,
                local: self.state.phase,
            }),
        }
    }

    /// Abandons the current view.
    pub fn on_timeout(&mut self) -> Vec<Action> {
        let view = self.state.view;
        warn!(
            view,
            phase = %self.state.phase,
            leader = %self.ctx.leader(view),
            "view timed out"
        );

        let mut actions = vec![Action::Notify(ConsensusEvent::TimedOut { view })];
        match view.checked_add(1) {
            Some(next) => actions.extend(self.enter_view(next)),
            None => {
                error!(view, "no view left to move to");
                actions.push(Action::ResetTimer {
                    timeout: self.ctx.timeout(),
                });
            }
        }
        actions
    }

    /// Moves to a later view and announces it to that view's leader.
    pub(crate) fn enter_view(&mut self, view: u64) -> Vec<Action> {
        let mut actions = self.advance_to(view);
        if !actions.is_empty() {
            actions.extend(self.start_round());
        }
        actions
    }

    /// Applies a Decide outside the normal phase sequence.
    fn catch_up(&mut self, data: &ConsensusData) -> Result<Vec<Action>> {
        let qc = &data.justify;
        if qc.phase() != Phase::Commit || qc.view() != data.view || qc.payload() != &data.payload {
            return Err(ConsensusError::InvalidQc(format!(
                "Decide for view {} is not justified by its Commit certificate",
                data.view
            )));
        }
        if data.payload.parent != self.state.committed {
            return Err(ConsensusError::InvalidProposal(format!(
                "decided payload does not extend committed {}",
                self.state.committed
            )));
        }
        self.ctx.verify_qc(qc)?;

        debug!(
            view = data.view,
            local = self.state.view,
            phase = %self.state.phase,
            "applying decision missed in sequence"
        );
        Ok(self.decide(qc))
    }

    /// Commits the payload certified by `commit_qc`.
    fn decide(&mut self, commit_qc: &Qc) -> Vec<Action> {
        let payload = commit_qc.payload().clone();
        let digest = self.ctx.codec().payload_digest(&payload);

        self.state.committed = digest.clone();
        self.state.height += 1;
        info!(
            view = commit_qc.view(),
            height = self.state.height,
            digest = %digest,
            "committed payload"
        );

        let mut actions = vec![
            Action::Execute {
                view: commit_qc.view(),
                height: self.state.height,
                payload,
            },
            Action::Notify(ConsensusEvent::Committed {
                view: commit_qc.view(),
                height: self.state.height,
                digest,
            }),
        ];

        match commit_qc.view().checked_add(1) {
            Some(next) if next > self.state.view => actions.extend(self.enter_view(next)),
            _ => self.persist(),
        }
        actions
    }

    /// Sets the view, resetting per-view state. Views never go backwards.
    fn advance_to(&mut self, view: u64) -> Vec<Action> {
        if view <= self.state.view {
            return Vec::new();
        }

        self.state.view = view;
        self.state.phase = Phase::NewView;
        self.state.proposal = None;
        self.persist();

        let leader = self.ctx.leader(view);
        debug!(view, leader = %leader, "entered view");
        vec![Action::Notify(ConsensusEvent::ViewChanged { view, leader })]
    }

    fn check_leader(&self, msg: &SignedConsensusData) -> Result<()> {
        let view = msg.data.view;
        if msg.signer() != self.ctx.leader(view) {
            return Err(ConsensusError::NotLeader {
                signer: msg.signer(),
                view,
            });
        }
        Ok(())
    }

    /// A proposal is safe if it is the locked payload, directly extends it,
    /// or is justified by a certificate newer than the lock.
    fn check_safe_node(&self, data: &ConsensusData) -> Result<()> {
        let Some(locked) = &self.state.locked_qc else {
            return Ok(());
        };

        let locked_payload = locked.payload();
        let extends_lock =
            data.payload.parent == self.ctx.codec().payload_digest(locked_payload);
        if data.payload == *locked_payload || extends_lock || data.justify.view() > locked.view() {
            return Ok(());
        }

        Err(ConsensusError::InvalidProposal(format!(
            "conflicts with certificate locked at view {}",
            locked.view()
        )))
    }

    fn update_prepare_qc(&mut self, qc: &Qc) {
        match &self.state.prepare_qc {
            Some(current) if current.view() > qc.view() => {
                warn!(
                    current = current.view(),
                    offered = qc.view(),
                    "ignoring older prepare certificate"
                );
            }
            _ => self.state.prepare_qc = Some(qc.clone()),
        }
    }

    fn update_locked_qc(&mut self, qc: &Qc) {
        match &self.state.locked_qc {
            Some(current) if current.view() > qc.view() => {
                warn!(
                    current = current.view(),
                    offered = qc.view(),
                    "ignoring older lock"
                );
            }
            _ => self.state.locked_qc = Some(qc.clone()),
        }
    }

    fn vote(&self, phase: Phase, payload: ConsensusPayload) -> Action {
        let view = self.state.view;
        Action::SendToLeader {
            leader: self.ctx.leader(view),
            message: ConsensusMessage::Vote(self.ctx.vote(QcData {
                phase,
                view,
                payload,
            })),
        }
    }

    fn persist(&self) {
        let saved = PersistedState {
            view: self.state.view,
            prepare_qc: self.state.prepare_qc.clone(),
            locked_qc: self.state.locked_qc.clone(),
            committed: self.state.committed.clone(),
            height: self.state.height,
        };
        if let Err(e) = self.store.save(&saved) {
            error!(view = self.state.view, error = %e, "failed to persist consensus state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::config::ConsensusConfig;
    use crate::crypto::Keypair;
    use crate::store::MemoryStateStore;
    use crate::types::{Vote, MAX_VIEW_JUMP};

    struct Fixture {
        keys: Vec<Keypair>,
        codec: Codec,
        store: Arc<MemoryStateStore>,
        replica: Replica,
    }

    /// Replica for member 1 of a four member committee. Member 0 leads view 0.
    fn fixture() -> Fixture {
        let keys: Vec<_> = (0..4).map(Keypair::from_seed).collect();
        let config = ConsensusConfig::new(keys.iter().map(Keypair::member_id).collect());
        let ctx = Arc::new(RoundContext::new(&config, Keypair::from_seed(1)).unwrap());
        let store = Arc::new(MemoryStateStore::new());
        let replica = Replica::new(ctx, store.clone()).unwrap();
        Fixture {
            keys,
            codec: Codec::default(),
            store,
            replica,
        }
    }

    impl Fixture {
        fn genesis(&self) -> Qc {
            Qc::genesis(self.codec.hash_algorithm())
        }

        fn payload(&self, data: &[u8]) -> ConsensusPayload {
            ConsensusPayload::new(self.replica.state().committed.clone(), data.to_vec())
        }

        fn certify(&self, phase: Phase, view: u64, payload: &ConsensusPayload) -> Qc {
            let data = QcData {
                phase,
                view,
                payload: payload.clone(),
            };
            Qc {
                votes: self.keys[..3]
                    .iter()
                    .map(|k| self.codec.seal_qc_data(k, &data))
                    .collect(),
                data,
            }
        }

        fn from_leader(
            &self,
            view: u64,
            phase: Phase,
            payload: &ConsensusPayload,
            justify: Qc,
        ) -> SignedConsensusData {
            let leader = &self.keys[(view % 4) as usize];
            self.codec.sign_consensus_data(
                leader,
                ConsensusData {
                    view,
                    phase,
                    payload: payload.clone(),
                    justify,
                },
            )
        }
    }

    fn votes(actions: &[Action]) -> Vec<&Vote> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendToLeader {
                    message: ConsensusMessage::Vote(v),
                    ..
                } => Some(v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_accepts_proposal_and_votes() {
        let mut f = fixture();
        let p = f.payload(b"P");
        let msg = f.from_leader(0, Phase::Prepare, &p, f.genesis());

        let actions = f.replica.on_prepare(&msg).unwrap();
        let votes = votes(&actions);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].data.phase, Phase::Prepare);
        assert_eq!(votes[0].data.payload, p);
        assert_eq!(f.replica.state().phase, Phase::Prepare);
        assert_eq!(f.replica.state().proposal, Some(p));
    }

    #[test]
    fn test_rejects_proposal_from_non_leader() {
        let mut f = fixture();
        let p = f.payload(b"P");
        let msg = f.codec.sign_consensus_data(
            &f.keys[2],
            ConsensusData {
                view: 0,
                phase: Phase::Prepare,
                payload: p,
                justify: f.genesis(),
            },
        );

        assert!(matches!(
            f.replica.on_prepare(&msg),
            Err(ConsensusError::NotLeader { .. })
        ));
        assert_eq!(f.replica.state().phase, Phase::NewView);
    }

    #[test]
    fn test_rejects_second_proposal_in_view() {
        let mut f = fixture();
        let p = f.payload(b"P");
        let q = f.payload(b"Q");
        f.replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &p, f.genesis()))
            .unwrap();

        let result = f
            .replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &q, f.genesis()));
        assert!(matches!(result, Err(ConsensusError::UnexpectedPhase { .. })));
        assert_eq!(f.replica.state().proposal, Some(p));
    }

    #[test]
    fn test_rejects_proposal_off_committed_chain() {
        let mut f = fixture();
        let orphan = ConsensusPayload::new(f.codec.digest(b"elsewhere"), b"P".to_vec());
        let result = f
            .replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &orphan, f.genesis()));
        assert!(matches!(result, Err(ConsensusError::InvalidProposal(_))));
    }

    #[test]
    fn test_adopts_later_view_from_proposal() {
        let mut f = fixture();
        let p = f.payload(b"P");
        let actions = f
            .replica
            .on_prepare(&f.from_leader(6, Phase::Prepare, &p, f.genesis()))
            .unwrap();

        assert_eq!(f.replica.state().view, 6);
        assert_eq!(f.replica.state().phase, Phase::Prepare);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Notify(ConsensusEvent::ViewChanged { view: 6, .. }))));
    }

    #[test]
    fn test_out_of_order_phase_rejected_without_mutation() {
        let mut f = fixture();
        let p = f.payload(b"P");
        f.replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &p, f.genesis()))
            .unwrap();
        let before = f.replica.state().clone();

        // Commit before PreCommit
        let commit = f.from_leader(
            0,
            Phase::Commit,
            &p,
            f.certify(Phase::PreCommit, 0, &p),
        );
        assert!(matches!(
            f.replica.on_phase(&commit),
            Err(ConsensusError::UnexpectedPhase { .. })
        ));
        assert_eq!(f.replica.state(), &before);
    }

    #[test]
    fn test_phase_with_weak_certificate_rejected() {
        let mut f = fixture();
        let p = f.payload(b"P");
        f.replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &p, f.genesis()))
            .unwrap();

        let mut qc = f.certify(Phase::Prepare, 0, &p);
        qc.votes.truncate(2);
        let precommit = f.from_leader(0, Phase::PreCommit, &p, qc);
        assert!(matches!(
            f.replica.on_phase(&precommit),
            Err(ConsensusError::InvalidQc(_))
        ));
        assert_eq!(f.replica.state().prepare_qc, None);
    }

    #[test]
    fn test_full_view_commits_and_moves_on() {
        let mut f = fixture();
        let p = f.payload(b"P");

        f.replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &p, f.genesis()))
            .unwrap();
        let prepare_qc = f.certify(Phase::Prepare, 0, &p);
        f.replica
            .on_phase(&f.from_leader(0, Phase::PreCommit, &p, prepare_qc.clone()))
            .unwrap();
        assert_eq!(f.replica.state().prepare_qc, Some(prepare_qc.clone()));

        let precommit_qc = f.certify(Phase::PreCommit, 0, &p);
        f.replica
            .on_phase(&f.from_leader(0, Phase::Commit, &p, precommit_qc.clone()))
            .unwrap();
        assert_eq!(f.replica.state().locked_qc, Some(precommit_qc));

        let commit_qc = f.certify(Phase::Commit, 0, &p);
        let actions = f
            .replica
            .on_phase(&f.from_leader(0, Phase::Decide, &p, commit_qc))
            .unwrap();

        let executed: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Execute { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(executed, vec![p.clone()]);

        let state = f.replica.state();
        assert_eq!(state.view, 1);
        assert_eq!(state.phase, Phase::NewView);
        assert_eq!(state.height, 1);
        assert_eq!(state.committed, f.codec.payload_digest(&p));
        assert_eq!(state.proposal, None);

        // NewView for view 1 goes to member 1, carrying the prepare QC.
        let new_view = actions.iter().find_map(|a| match a {
            Action::SendToLeader {
                leader,
                message: ConsensusMessage::NewView(m),
            } => Some((leader, m)),
            _ => None,
        });
        let (leader, msg) = new_view.unwrap();
        assert_eq!(*leader, f.keys[1].member_id());
        assert_eq!(msg.data.view, 1);
        assert_eq!(msg.data.justify, prepare_qc);

        // A replayed Decide does not execute twice.
        let replay = f.from_leader(0, Phase::Decide, &p, f.certify(Phase::Commit, 0, &p));
        assert!(f.replica.on_phase(&replay).is_err());
        assert_eq!(f.replica.state().height, 1);
    }

    #[test]
    fn test_missed_phases_caught_up_by_decide() {
        let mut f = fixture();
        let p = f.payload(b"P");
        let decide = f.from_leader(0, Phase::Decide, &p, f.certify(Phase::Commit, 0, &p));

        let actions = f.replica.on_phase(&decide).unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::Execute { .. })));
        assert_eq!(f.replica.state().view, 1);
        assert_eq!(f.replica.state().height, 1);
    }

    #[test]
    fn test_lock_blocks_conflicting_proposal() {
        let mut f = fixture();
        let p = f.payload(b"P");
        f.replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &p, f.genesis()))
            .unwrap();
        f.replica
            .on_phase(&f.from_leader(0, Phase::PreCommit, &p, f.certify(Phase::Prepare, 0, &p)))
            .unwrap();
        f.replica
            .on_phase(&f.from_leader(0, Phase::Commit, &p, f.certify(Phase::PreCommit, 0, &p)))
            .unwrap();
        f.replica.on_timeout();
        assert_eq!(f.replica.state().view, 1);

        // Same parent, different data, justified only by genesis.
        let q = f.payload(b"Q");
        let result = f
            .replica
            .on_prepare(&f.from_leader(1, Phase::Prepare, &q, f.genesis()));
        assert!(matches!(result, Err(ConsensusError::InvalidProposal(_))));

        // Re-proposing the locked payload is fine.
        let ok = f.from_leader(1, Phase::Prepare, &p, f.certify(Phase::Prepare, 0, &p));
        assert!(f.replica.on_prepare(&ok).is_ok());
    }

    #[test]
    fn test_newer_justify_unlocks() {
        let mut f = fixture();
        let p = f.payload(b"P");
        f.replica
            .on_prepare(&f.from_leader(0, Phase::Prepare, &p, f.genesis()))
            .unwrap();
        f.replica
            .on_phase(&f.from_leader(0, Phase::PreCommit, &p, f.certify(Phase::Prepare, 0, &p)))
            .unwrap();
        f.replica
            .on_phase(&f.from_leader(0, Phase::Commit, &p, f.certify(Phase::PreCommit, 0, &p)))
            .unwrap();
        f.replica.on_timeout();
        f.replica.on_timeout();

        let q = f.payload(b"Q");
        let msg = f.from_leader(2, Phase::Prepare, &q, f.certify(Phase::Prepare, 1, &q));
        assert!(f.replica.on_prepare(&msg).is_ok());
    }

    #[test]
    fn test_timeout_sends_high_qc_to_next_leader() {
        let mut f = fixture();
        let actions = f.replica.on_timeout();

        assert_eq!(f.replica.state().view, 1);
        assert!(matches!(
            actions[0],
            Action::Notify(ConsensusEvent::TimedOut { view: 0 })
        ));
        let sent = actions.iter().any(|a| match a {
            Action::SendToLeader {
                leader,
                message: ConsensusMessage::NewView(m),
            } => *leader == f.keys[1].member_id() && m.data.justify.is_genesis(),
            _ => false,
        });
        assert!(sent);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ResetTimer { .. })));
    }

    #[test]
    fn test_restart_resumes_after_saved_view() {
        let mut f = fixture();
        f.replica.on_timeout();
        f.replica.on_timeout();
        assert_eq!(f.store.load().unwrap().unwrap().view, 2);

        let config = ConsensusConfig::new(f.keys.iter().map(Keypair::member_id).collect());
        let ctx = Arc::new(RoundContext::new(&config, Keypair::from_seed(1)).unwrap());
        let resumed = Replica::new(ctx, f.store.clone()).unwrap();
        assert_eq!(resumed.state().view, 3);
        assert_eq!(resumed.state().phase, Phase::NewView);
    }

    fn resume(f: &Fixture, saved: PersistedState) -> Result<Replica> {
        f.store.save(&saved).unwrap();
        let config = ConsensusConfig::new(f.keys.iter().map(Keypair::member_id).collect());
        let ctx = Arc::new(RoundContext::new(&config, Keypair::from_seed(1)).unwrap());
        Replica::new(ctx, f.store.clone())
    }

    #[test]
    fn test_proposal_too_far_ahead_rejected() {
        let mut f = fixture();
        let p = f.payload(b"P");

        // Member 3 leads view u64::MAX.
        let last = f.from_leader(u64::MAX, Phase::Prepare, &p, f.genesis());
        assert!(matches!(
            f.replica.on_prepare(&last),
            Err(ConsensusError::ViewOutOfRange { .. })
        ));
        let beyond = f.from_leader(MAX_VIEW_JUMP + 4, Phase::Prepare, &p, f.genesis());
        assert!(matches!(
            f.replica.on_prepare(&beyond),
            Err(ConsensusError::ViewOutOfRange { .. })
        ));
        assert_eq!(f.replica.state().view, 0);

        f.replica.on_timeout();
        assert_eq!(f.replica.state().view, 1);

        let within = f.from_leader(MAX_VIEW_JUMP, Phase::Prepare, &p, f.genesis());
        assert!(f.replica.on_prepare(&within).is_ok());
        assert_eq!(f.replica.state().view, MAX_VIEW_JUMP);
    }

    #[test]
    fn test_timeout_in_last_view_does_not_overflow() {
        let f = fixture();
        let saved = PersistedState {
            view: u64::MAX - 1,
            prepare_qc: None,
            locked_qc: None,
            committed: f.replica.state().committed.clone(),
            height: 0,
        };
        let mut replica = resume(&f, saved.clone()).unwrap();
        assert_eq!(replica.state().view, u64::MAX);

        let actions = replica.on_timeout();
        assert_eq!(replica.state().view, u64::MAX);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ResetTimer { .. })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::SendToLeader { .. })));

        let exhausted = PersistedState {
            view: u64::MAX,
            ..saved
        };
        assert!(matches!(
            resume(&f, exhausted),
            Err(ConsensusError::ViewOutOfRange { .. })
        ));
    }

    #[test]
    fn test_older_certificates_never_replace_newer() {
        let f = fixture();
        let p = f.payload(b"P");
        let newer_prepare = f.certify(Phase::Prepare, 5, &p);
        let newer_lock = f.certify(Phase::PreCommit, 5, &p);
        let mut replica = resume(
            &f,
            PersistedState {
                view: 5,
                prepare_qc: Some(newer_prepare.clone()),
                locked_qc: Some(newer_lock.clone()),
                committed: f.replica.state().committed.clone(),
                height: 0,
            },
        )
        .unwrap();

        let q = f.payload(b"Q");
        replica.update_locked_qc(&f.certify(Phase::PreCommit, 2, &q));
        replica.update_prepare_qc(&f.certify(Phase::Prepare, 2, &q));
        assert_eq!(replica.state().locked_qc, Some(newer_lock.clone()));
        assert_eq!(replica.state().prepare_qc, Some(newer_prepare.clone()));

        // A Commit for an older view never reaches the lock either.
        let commit = f.from_leader(2, Phase::Commit, &q, f.certify(Phase::PreCommit, 2, &q));
        assert!(replica.on_phase(&commit).is_err());
        assert!(replica.apply_phase(&commit.data).is_err());
        assert_eq!(replica.state().locked_qc, Some(newer_lock));
        assert_eq!(replica.state().view, 6);
    }
}
