//! Message transport boundary and an in-process implementation.
//!
//! Real deployments plug their P2P stack in behind [`Transport`]. The
//! [`LocalNetwork`] wires a whole committee together inside one process for
//! tests and the local devnet; members can be disconnected to simulate a
//! crash.

use crate::crypto::MemberId;
use crate::error::{ConsensusError, Result};
use crate::message::ConsensusMessage;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Outbound side of the network. Inbound bytes arrive on the channel handed
/// to the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a message to one member.
    async fn send_to(&self, member: &MemberId, message: &ConsensusMessage) -> Result<()>;

    /// Sends a message to every other member.
    async fn broadcast(&self, message: &ConsensusMessage) -> Result<()>;
}

/// An in-memory network connecting committee members through channels.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    inboxes: RwLock<HashMap<MemberId, mpsc::Sender<Bytes>>>,
    disconnected: RwLock<HashSet<MemberId>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a member, returning its transport and inbound channel.
    pub fn join(
        self: &Arc<Self>,
        member: MemberId,
        capacity: usize,
    ) -> (LocalTransport, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.inboxes.write().insert(member, tx);
        let transport = LocalTransport {
            network: self.clone(),
            me: member,
        };
        (transport, rx)
    }

    /// Drops all traffic to and from `member`.
    pub fn disconnect(&self, member: MemberId) {
        tracing::info!(member = %member, "disconnecting member");
        self.disconnected.write().insert(member);
    }

    /// Restores traffic to and from `member`.
    pub fn reconnect(&self, member: MemberId) {
        tracing::info!(member = %member, "reconnecting member");
        self.disconnected.write().remove(&member);
    }

    /// Whether `member` is currently cut off.
    pub fn is_disconnected(&self, member: &MemberId) -> bool {
        self.disconnected.read().contains(member)
    }

    fn route(&self, from: &MemberId, to: &MemberId) -> Option<mpsc::Sender<Bytes>> {
        if self.is_disconnected(from) || self.is_disconnected(to) {
            return None;
        }
        self.inboxes.read().get(to).cloned()
    }

    async fn deliver(&self, from: &MemberId, to: &MemberId, bytes: Bytes) -> Result<()> {
        let Some(inbox) = self.route(from, to) else {
            tracing::trace!(from = %from, to = %to, "message dropped by local network");
            return Ok(());
        };
        if inbox.send(bytes).await.is_err() {
            tracing::debug!(to = %to, "member inbox closed");
        }
        Ok(())
    }
}

/// A member's handle on a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    me: MemberId,
}

impl LocalTransport {
    /// The member this transport sends as.
    pub fn member(&self) -> MemberId {
        self.me
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_to(&self, member: &MemberId, message: &ConsensusMessage) -> Result<()> {
        let bytes = message
            .encode()
            .map_err(|e| ConsensusError::Transport(e.to_string()))?;
        self.network.deliver(&self.me, member, bytes).await
    }

    async fn broadcast(&self, message: &ConsensusMessage) -> Result<()> {
        let bytes = message
            .encode()
            .map_err(|e| ConsensusError::Transport(e.to_string()))?;

        let peers: Vec<MemberId> = self
            .network
            .inboxes
            .read()
            .keys()
            .filter(|m| **m != self.me)
            .copied()
            .collect();

        for peer in peers {
            self.network.deliver(&self.me, &peer, bytes.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;
    use crate::crypto::Keypair;
    use crate::types::{ConsensusPayload, Phase, QcData};

    fn vote(from: &Keypair) -> ConsensusMessage {
        let codec = Codec::default();
        ConsensusMessage::Vote(codec.sign_vote(
            from,
            QcData {
                phase: Phase::Prepare,
                view: 0,
                payload: ConsensusPayload::genesis(codec.hash_algorithm()),
            },
        ))
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let keys: Vec<_> = (0..3).map(Keypair::from_seed).collect();
        let network = LocalNetwork::new();
        let mut joined: Vec<_> = keys
            .iter()
            .map(|k| network.join(k.member_id(), 16))
            .collect();

        let msg = vote(&keys[0]);
        joined[0].0.broadcast(&msg).await.unwrap();

        assert!(joined[0].1.try_recv().is_err());
        for (_, rx) in joined.iter_mut().skip(1) {
            let bytes = rx.try_recv().unwrap();
            assert_eq!(ConsensusMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[tokio::test]
    async fn test_disconnected_member_is_isolated() {
        let keys: Vec<_> = (0..2).map(Keypair::from_seed).collect();
        let network = LocalNetwork::new();
        let (t0, mut rx0) = network.join(keys[0].member_id(), 16);
        let (t1, mut rx1) = network.join(keys[1].member_id(), 16);

        network.disconnect(keys[1].member_id());
        t0.send_to(&keys[1].member_id(), &vote(&keys[0])).await.unwrap();
        t1.send_to(&keys[0].member_id(), &vote(&keys[1])).await.unwrap();
        assert!(rx0.try_recv().is_err());
        assert!(rx1.try_recv().is_err());

        network.reconnect(keys[1].member_id());
        t0.send_to(&keys[1].member_id(), &vote(&keys[0])).await.unwrap();
        assert!(rx1.try_recv().is_ok());
    }
}
