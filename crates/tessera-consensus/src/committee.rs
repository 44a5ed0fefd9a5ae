//! Committee membership, leader rotation and certificate validation.
//!
//! The committee is fixed for the node's lifetime. Member order is stable
//! and defines leader rotation.

use crate::codec::Codec;
use crate::crypto::MemberId;
use crate::error::{ConsensusError, Result};
use crate::types::Qc;
use std::collections::{HashMap, HashSet};

/// The fixed, ordered committee.
#[derive(Debug, Clone)]
pub struct Committee {
    /// Members in rotation order.
    members: Vec<MemberId>,

    /// Index for fast lookup by key.
    index: HashMap<MemberId, usize>,

    /// Distinct valid votes required for a certificate.
    quorum: usize,
}

impl Committee {
    /// Creates a committee.
    ///
    /// `quorum` overrides the default `n - floor((n - 1) / 3)`; it must lie
    /// in `(n / 2, n]` so that any two quorums intersect.
    pub fn new(members: Vec<MemberId>, quorum: Option<usize>) -> Result<Self> {
        if members.is_empty() {
            return Err(ConsensusError::EmptyCommittee);
        }

        let mut index = HashMap::with_capacity(members.len());
        for (i, member) in members.iter().enumerate() {
            if index.insert(*member, i).is_some() {
                return Err(ConsensusError::DuplicateMember(*member));
            }
        }

        let n = members.len();
        let quorum = quorum.unwrap_or_else(|| Self::default_quorum(n));
        if quorum * 2 <= n || quorum > n {
            return Err(ConsensusError::InvalidQuorum { quorum, members: n });
        }

        let faulty = Self::max_faulty(n);
        if quorum * 2 <= n + faulty {
            tracing::warn!(
                quorum,
                members = n,
                faulty,
                "configured quorum does not tolerate the maximum number of Byzantine members"
            );
        }

        Ok(Self {
            members,
            index,
            quorum,
        })
    }

    /// The smallest quorum tolerating `floor((n - 1) / 3)` Byzantine members.
    pub fn default_quorum(n: usize) -> usize {
        n - Self::max_faulty(n)
    }

    /// The number of Byzantine members a committee of `n` tolerates.
    pub fn max_faulty(n: usize) -> usize {
        n.saturating_sub(1) / 3
    }

    /// Returns all members in rotation order.
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if there are no members. Never true for a constructed
    /// committee.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the quorum size.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Checks if a key belongs to a member.
    pub fn contains(&self, member: &MemberId) -> bool {
        self.index.contains_key(member)
    }

    /// Returns the rotation index of a member.
    pub fn index_of(&self, member: &MemberId) -> Option<usize> {
        self.index.get(member).copied()
    }

    /// Gets the leader for a view using round-robin rotation.
    pub fn leader_for_view(&self, view: u64) -> MemberId {
        let idx = (view % self.members.len() as u64) as usize;
        self.members[idx]
    }

    /// Checks if `member` leads `view`.
    pub fn is_leader(&self, member: &MemberId, view: u64) -> bool {
        self.leader_for_view(view) == *member
    }

    /// Validates a quorum certificate.
    ///
    /// The genesis certificate is accepted as is. Any other certificate
    /// needs at least `quorum` seals from distinct members, each valid over
    /// the certificate body.
    pub fn verify_qc(&self, codec: &Codec, qc: &Qc) -> Result<()> {
        if *qc == Qc::genesis(codec.hash_algorithm()) {
            return Ok(());
        }

        let mut seen = HashSet::with_capacity(qc.votes.len());
        for seal in &qc.votes {
            if !self.contains(&seal.signer) {
                return Err(ConsensusError::InvalidQc(format!(
                    "vote from non-member {}",
                    seal.signer
                )));
            }
            if !seen.insert(seal.signer) {
                return Err(ConsensusError::InvalidQc(format!(
                    "duplicate vote from {}",
                    seal.signer
                )));
            }
            codec
                .verify_seal(&qc.data, seal)
                .map_err(|e| ConsensusError::InvalidQc(e.to_string()))?;
        }

        if seen.len() < self.quorum {
            return Err(ConsensusError::InvalidQc(format!(
                "{} votes, need {}",
                seen.len(),
                self.quorum
            )));
        }

        Ok(())
    }
}
