//! Immutable context shared by the replica and leader state machines.

use crate::codec::Codec;
use crate::committee::Committee;
use crate::config::ConsensusConfig;
use crate::crypto::{Keypair, MemberId};
use crate::error::{ConsensusError, Result};
use crate::types::{ConsensusData, Qc, QcData, SignedConsensusData, Vote};
use std::sync::Arc;
use std::time::Duration;

/// Everything a round needs that never changes while the node runs.
#[derive(Debug)]
pub struct RoundContext {
    committee: Arc<Committee>,
    codec: Codec,
    keypair: Keypair,
    me: MemberId,
    timeout: Duration,
}

impl RoundContext {
    /// Builds the context, checking that `keypair` belongs to the committee.
    pub fn new(config: &ConsensusConfig, keypair: Keypair) -> Result<Self> {
        config.validate()?;
        let committee = Committee::new(config.members.clone(), config.quorum)?;

        let me = keypair.member_id();
        if !committee.contains(&me) {
            return Err(ConsensusError::NotMember(me));
        }

        Ok(Self {
            committee: Arc::new(committee),
            codec: Codec::new(config.hash),
            keypair,
            me,
            timeout: config.consensus_timeout,
        })
    }

    /// The committee.
    pub fn committee(&self) -> &Arc<Committee> {
        &self.committee
    }

    /// The message codec.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// The local member id.
    pub fn me(&self) -> MemberId {
        self.me
    }

    /// View-change timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Leader of `view`.
    pub fn leader(&self, view: u64) -> MemberId {
        self.committee.leader_for_view(view)
    }

    /// Whether the local node leads `view`.
    pub fn is_leader(&self, view: u64) -> bool {
        self.committee.is_leader(&self.me, view)
    }

    /// The genesis certificate for the configured hash.
    pub fn genesis_qc(&self) -> Qc {
        Qc::genesis(self.codec.hash_algorithm())
    }

    /// Signs round data with the local key.
    pub fn sign(&self, data: ConsensusData) -> SignedConsensusData {
        self.codec.sign_consensus_data(&self.keypair, data)
    }

    /// Signs a vote over a certificate body with the local key.
    pub fn vote(&self, data: QcData) -> Vote {
        self.codec.sign_vote(&self.keypair, data)
    }

    /// Checks that a round message was signed by a member and that the seal
    /// is valid.
    pub fn verify_signed(&self, signed: &SignedConsensusData) -> Result<()> {
        let signer = signed.signer();
        if !self.committee.contains(&signer) {
            return Err(ConsensusError::UnknownSigner(signer));
        }
        self.codec
            .verify_consensus_data(signed)
            .map_err(|_| ConsensusError::BadSignature(signer))
    }

    /// Validates a certificate against the committee.
    pub fn verify_qc(&self, qc: &Qc) -> Result<()> {
        self.committee.verify_qc(&self.codec, qc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConsensusPayload, Phase};

    fn config() -> ConsensusConfig {
        ConsensusConfig::new((0..4).map(|i| Keypair::from_seed(i).member_id()).collect())
    }

    #[test]
    fn test_non_member_key_rejected() {
        let result = RoundContext::new(&config(), Keypair::from_seed(9));
        assert!(matches!(result, Err(ConsensusError::NotMember(_))));
    }

    #[test]
    fn test_verify_signed() {
        let ctx = RoundContext::new(&config(), Keypair::from_seed(1)).unwrap();
        let data = ConsensusData {
            view: 1,
            phase: Phase::Prepare,
            payload: ConsensusPayload::genesis(ctx.codec().hash_algorithm()),
            justify: ctx.genesis_qc(),
        };

        let signed = ctx.sign(data.clone());
        assert!(ctx.verify_signed(&signed).is_ok());
        assert!(ctx.is_leader(1));

        let outsider = Codec::default().sign_consensus_data(&Keypair::from_seed(9), data);
        assert!(matches!(
            ctx.verify_signed(&outsider),
            Err(ConsensusError::UnknownSigner(_))
        ));

        let mut tampered = signed;
        tampered.data.view = 2;
        assert!(matches!(
            ctx.verify_signed(&tampered),
            Err(ConsensusError::BadSignature(_))
        ));
    }
}
