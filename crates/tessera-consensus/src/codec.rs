//! Canonical encoding, hashing and signing of consensus messages.
//!
//! The canonical encoding is a fixed-order, length-prefixed, big-endian
//! layout; it is what gets hashed and signed. It is independent of the JSON
//! wire encoding in [`crate::message`].

use crate::crypto::{Digest, HashAlgorithm, Keypair};
use crate::error::Result;
use crate::types::{ConsensusData, ConsensusPayload, Qc, QcData, Seal, SignedConsensusData, Vote};

/// Domain tag for signed round data.
const CONSENSUS_DATA_TAG: &[u8] = b"TESSERA/CONSENSUS_DATA:";

/// Domain tag for votes over certificate bodies.
const QC_DATA_TAG: &[u8] = b"TESSERA/QC_DATA:";

/// Deterministic encoder and signer for consensus messages.
///
/// Holds no phase state; every method is a pure transform or a
/// side-effect-free predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    hash: HashAlgorithm,
}

impl Codec {
    /// Creates a codec hashing with `hash`.
    pub const fn new(hash: HashAlgorithm) -> Self {
        Self { hash }
    }

    /// The configured hash algorithm.
    pub const fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash
    }

    /// Hashes arbitrary bytes.
    pub fn digest(&self, bytes: &[u8]) -> Digest {
        self.hash.digest(bytes)
    }

    /// Digest of a payload, used as the `parent` of its successor.
    pub fn payload_digest(&self, payload: &ConsensusPayload) -> Digest {
        let mut buf = Vec::with_capacity(payload.data.len() + 80);
        write_payload(&mut buf, payload);
        self.digest(&buf)
    }

    /// Canonical bytes of a certificate body, as signed by voters.
    pub fn encode_qc_data(&self, data: &QcData) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(QC_DATA_TAG);
        write_qc_data(&mut buf, data);
        buf
    }

    /// Canonical bytes of round data, including the full justify QC.
    pub fn encode_consensus_data(&self, data: &ConsensusData) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(CONSENSUS_DATA_TAG);
        buf.extend_from_slice(&data.view.to_be_bytes());
        buf.push(data.phase.tag());
        write_payload(&mut buf, &data.payload);
        write_qc(&mut buf, &data.justify);
        buf
    }

    /// Signs round data with the node's key.
    pub fn sign_consensus_data(&self, keypair: &Keypair, data: ConsensusData) -> SignedConsensusData {
        let hash = self.digest(&self.encode_consensus_data(&data));
        SignedConsensusData {
            data,
            seal: Seal {
                signer: keypair.member_id(),
                signature: keypair.sign(hash.as_bytes()),
            },
        }
    }

    /// Checks the seal of round data against the declared signer's key.
    pub fn verify_consensus_data(&self, signed: &SignedConsensusData) -> Result<()> {
        let hash = self.digest(&self.encode_consensus_data(&signed.data));
        signed
            .seal
            .signer
            .verify(hash.as_bytes(), &signed.seal.signature)
    }

    /// Builds a vote over a certificate body.
    pub fn sign_vote(&self, keypair: &Keypair, data: QcData) -> Vote {
        let seal = self.seal_qc_data(keypair, &data);
        Vote { data, seal }
    }

    /// Signs a certificate body, producing a seal.
    pub fn seal_qc_data(&self, keypair: &Keypair, data: &QcData) -> Seal {
        let hash = self.digest(&self.encode_qc_data(data));
        Seal {
            signer: keypair.member_id(),
            signature: keypair.sign(hash.as_bytes()),
        }
    }

    /// Checks a vote seal over a certificate body.
    pub fn verify_seal(&self, data: &QcData, seal: &Seal) -> Result<()> {
        let hash = self.digest(&self.encode_qc_data(data));
        seal.signer.verify(hash.as_bytes(), &seal.signature)
    }

    /// Checks a vote against its own body.
    pub fn verify_vote(&self, vote: &Vote) -> Result<()> {
        self.verify_seal(&vote.data, &vote.seal)
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn write_payload(buf: &mut Vec<u8>, payload: &ConsensusPayload) {
    write_bytes(buf, payload.parent.as_bytes());
    write_bytes(buf, &payload.data);
}

fn write_qc_data(buf: &mut Vec<u8>, data: &QcData) {
    buf.push(data.phase.tag());
    buf.extend_from_slice(&data.view.to_be_bytes());
    write_payload(buf, &data.payload);
}

fn write_qc(buf: &mut Vec<u8>, qc: &Qc) {
    write_qc_data(buf, &qc.data);
    buf.extend_from_slice(&(qc.votes.len() as u32).to_be_bytes());
    for seal in &qc.votes {
        buf.extend_from_slice(seal.signer.as_bytes());
        buf.extend_from_slice(seal.signature.as_bytes());
    }
}
