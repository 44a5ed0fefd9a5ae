//! Quorum certificate builder.
//!
//! Votes arrive from parallel receive paths, so the builder owns its own
//! lock. State is an arena of rounds keyed by view; a view change drops every
//! round below the new view rather than merging it forward.

use crate::codec::Codec;
use crate::committee::Committee;
use crate::crypto::MemberId;
use crate::error::{ConsensusError, Result};
use crate::types::{Phase, Qc, QcData, Seal, Vote};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Result of adding a vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Vote counted; quorum not reached yet.
    Pending {
        /// Distinct valid votes so far.
        votes: usize,
        /// Votes required.
        quorum: usize,
    },
    /// This vote completed the quorum.
    Certified(Qc),
    /// The target was already certified; the vote was ignored.
    AlreadyCertified,
}

/// Votes for one `(view, phase)` target.
#[derive(Debug)]
struct PhaseVotes {
    target: QcData,
    /// Keyed by committee index so the emitted QC is ordered.
    votes: BTreeMap<usize, Seal>,
    certificate: Option<Qc>,
}

/// Everything collected for one view.
#[derive(Debug, Default)]
struct Round {
    phases: HashMap<Phase, PhaseVotes>,
    /// NewView justifications keyed by committee index.
    new_views: BTreeMap<usize, Qc>,
}

/// Accumulates votes into quorum certificates.
pub struct VoteCollector {
    committee: Arc<Committee>,
    codec: Codec,
    rounds: Mutex<BTreeMap<u64, Round>>,
}

impl VoteCollector {
    /// Creates an empty collector.
    pub fn new(committee: Arc<Committee>, codec: Codec) -> Self {
        Self {
            committee,
            codec,
            rounds: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens accumulation for `target`. Votes for a `(view, phase)` that was
    /// never opened are discarded.
    ///
    /// Reopening the same target is a no-op; a different target for an
    /// already open `(view, phase)` is refused.
    pub fn open(&self, target: QcData) -> Result<()> {
        let mut rounds = self.rounds.lock();
        let round = rounds.entry(target.view).or_default();

        if let Some(existing) = round.phases.get(&target.phase) {
            if existing.target == target {
                return Ok(());
            }
            return Err(ConsensusError::InvalidProposal(format!(
                "view {} already has a {} target",
                target.view, target.phase
            )));
        }

        tracing::trace!(view = target.view, phase = %target.phase, "opened vote target");
        round.phases.insert(
            target.phase,
            PhaseVotes {
                target,
                votes: BTreeMap::new(),
                certificate: None,
            },
        );
        Ok(())
    }

    /// Adds a vote.
    ///
    /// Votes from non-members, for unopened targets, for a different payload
    /// than the target, with a bad signature, or repeated by the same member
    /// are rejected and leave the round untouched.
    pub fn add_vote(&self, vote: &Vote) -> Result<VoteOutcome> {
        let signer = vote.seal.signer;
        let idx = self
            .committee
            .index_of(&signer)
            .ok_or(ConsensusError::UnknownSigner(signer))?;

        self.codec.verify_vote(vote)?;

        let mut rounds = self.rounds.lock();
        let entry = rounds
            .get_mut(&vote.data.view)
            .and_then(|round| round.phases.get_mut(&vote.data.phase))
            .ok_or_else(|| {
                ConsensusError::InvalidVote(format!(
                    "no open {} target for view {}",
                    vote.data.phase, vote.data.view
                ))
            })?;

        if entry.certificate.is_some() {
            return Ok(VoteOutcome::AlreadyCertified);
        }

        if entry.target != vote.data {
            return Err(ConsensusError::InvalidVote(format!(
                "{} voted for a different payload",
                signer
            )));
        }

        if entry.votes.contains_key(&idx) {
            return Err(ConsensusError::InvalidVote(format!(
                "duplicate vote from {}",
                signer
            )));
        }

        entry.votes.insert(idx, vote.seal);

        let quorum = self.committee.quorum();
        if entry.votes.len() < quorum {
            return Ok(VoteOutcome::Pending {
                votes: entry.votes.len(),
                quorum,
            });
        }

        let qc = Qc {
            data: entry.target.clone(),
            votes: entry.votes.values().copied().collect(),
        };
        entry.certificate = Some(qc.clone());

        tracing::debug!(
            view = qc.view(),
            phase = %qc.phase(),
            votes = qc.votes.len(),
            "quorum certificate formed"
        );

        Ok(VoteOutcome::Certified(qc))
    }

    /// Records a NewView justification from `signer` and returns how many
    /// distinct members have entered `view`. The caller validates `justify`.
    ///
    /// A member is held in at most one view, the latest it announced. A
    /// NewView for a later view moves the member there; one for an earlier
    /// view is ignored.
    pub fn add_new_view(&self, view: u64, signer: &MemberId, justify: Qc) -> Result<usize> {
        let idx = self
            .committee
            .index_of(signer)
            .ok_or(ConsensusError::UnknownSigner(*signer))?;

        let mut rounds = self.rounds.lock();
        let held = rounds
            .iter()
            .find(|(_, round)| round.new_views.contains_key(&idx))
            .map(|(held, _)| *held);
        match held {
            Some(held) if held > view => {
                tracing::trace!(
                    view,
                    held,
                    member = %signer,
                    "ignoring NewView behind a later one"
                );
                return Ok(rounds.get(&view).map_or(0, |r| r.new_views.len()));
            }
            Some(held) if held < view => {
                if let Some(round) = rounds.get_mut(&held) {
                    round.new_views.remove(&idx);
                    if round.new_views.is_empty() && round.phases.is_empty() {
                        rounds.remove(&held);
                    }
                }
            }
            _ => {}
        }

        let round = rounds.entry(view).or_default();
        round.new_views.entry(idx).or_insert(justify);
        Ok(round.new_views.len())
    }

    /// Number of members known to have entered `view`.
    pub fn new_view_count(&self, view: u64) -> usize {
        self.rounds
            .lock()
            .get(&view)
            .map(|r| r.new_views.len())
            .unwrap_or(0)
    }

    /// The highest-view justification collected for `view`.
    pub fn high_qc(&self, view: u64) -> Option<Qc> {
        self.rounds.lock().get(&view).and_then(|r| {
            r.new_views
                .values()
                .max_by_key(|qc| (qc.view(), qc.phase()))
                .cloned()
        })
    }

    /// Number of distinct votes counted for `(view, phase)`.
    pub fn vote_count(&self, view: u64, phase: Phase) -> usize {
        self.rounds
            .lock()
            .get(&view)
            .and_then(|r| r.phases.get(&phase))
            .map(|p| p.votes.len())
            .unwrap_or(0)
    }

    /// The certificate emitted for `(view, phase)`, if any.
    pub fn certificate(&self, view: u64, phase: Phase) -> Option<Qc> {
        self.rounds
            .lock()
            .get(&view)
            .and_then(|r| r.phases.get(&phase))
            .and_then(|p| p.certificate.clone())
    }

    /// Discards every round below `view`.
    pub fn prune_below(&self, view: u64) {
        let mut rounds = self.rounds.lock();
        let kept = rounds.split_off(&view);
        let dropped = rounds.len();
        *rounds = kept;
        if dropped > 0 {
            tracing::trace!(view, dropped, "discarded superseded vote rounds");
        }
    }

    /// Number of views with live state.
    pub fn round_count(&self) -> usize {
        self.rounds.lock().len()
    }
}
