//! Deterministic in-process committee for integration tests.
//!
//! Messages travel through one FIFO queue; tests decide when to deliver,
//! drop, duplicate or reorder them, and when timers fire.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tessera_consensus::{
    Action, ConsensusConfig, ConsensusCore, ConsensusData, ConsensusEvent, ConsensusMessage,
    ConsensusPayload, Keypair, MemoryStateStore, MemberId, Phase, QcData,
};

/// Index of the member whose key [`Cluster::equivocate`] misuses.
pub const BYZANTINE: usize = 3;

/// Seed of a key outside every committee built here.
const OUTSIDER_SEED: u64 = 99;

/// A message in flight.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: usize,
    pub to: usize,
    pub message: ConsensusMessage,
}

pub struct Cluster {
    pub ids: Vec<MemberId>,
    pub nodes: Vec<ConsensusCore>,
    pub queue: VecDeque<Envelope>,
    pub executed: Vec<Vec<Vec<u8>>>,
    pub events: Vec<Vec<ConsensusEvent>>,
    pub crashed: HashSet<usize>,
    /// Message kinds silently dropped on send.
    pub drop_kinds: HashSet<&'static str>,
}

impl Cluster {
    pub fn new(n: u64) -> Self {
        let ids: Vec<_> = (0..n).map(|i| Keypair::from_seed(i).member_id()).collect();
        let config = ConsensusConfig::new(ids.clone());
        let nodes = (0..n)
            .map(|i| {
                ConsensusCore::new(
                    &config,
                    Keypair::from_seed(i),
                    Arc::new(MemoryStateStore::new()),
                )
                .unwrap()
            })
            .collect();

        Self {
            ids,
            nodes,
            queue: VecDeque::new(),
            executed: vec![Vec::new(); n as usize],
            events: vec![Vec::new(); n as usize],
            crashed: HashSet::new(),
            drop_kinds: HashSet::new(),
        }
    }

    pub fn index_of(&self, member: &MemberId) -> usize {
        self.ids.iter().position(|id| id == member).unwrap()
    }

    pub fn live(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|i| !self.crashed.contains(i))
            .collect()
    }

    pub fn start(&mut self) {
        for i in self.live() {
            let actions = self.nodes[i].start();
            self.apply(i, actions);
        }
    }

    /// Routes a node's actions: messages go to the queue, commits and
    /// events are recorded.
    pub fn apply(&mut self, from: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendToLeader { leader, message } => {
                    let to = self.index_of(&leader);
                    self.send(from, to, message);
                }
                Action::Broadcast { message } => {
                    for to in 0..self.nodes.len() {
                        if to != from {
                            self.send(from, to, message.clone());
                        }
                    }
                }
                Action::Execute { payload, .. } => self.executed[from].push(payload.data),
                Action::ResetTimer { .. } => {}
                Action::Notify(event) => self.events[from].push(event),
            }
        }
    }

    fn send(&mut self, from: usize, to: usize, message: ConsensusMessage) {
        if self.drop_kinds.contains(message.kind()) {
            return;
        }
        self.queue.push_back(Envelope { from, to, message });
    }

    /// Delivers the envelope at `index`. Crashed nodes swallow messages.
    pub fn deliver_at(&mut self, index: usize) {
        let Some(envelope) = self.queue.remove(index) else {
            return;
        };
        if self.crashed.contains(&envelope.to) {
            return;
        }
        let actions = self.nodes[envelope.to].handle(envelope.message);
        self.apply(envelope.to, actions);
    }

    pub fn deliver_all(&mut self) {
        while !self.queue.is_empty() {
            self.deliver_at(0);
        }
    }

    /// Gives every live leader a chance to propose.
    pub fn tick(&mut self) {
        for i in self.live() {
            if let Some(slot) = self.nodes[i].proposal_slot() {
                let data = format!("v{}", slot.view).into_bytes();
                let actions = self.nodes[i].propose(slot, data);
                self.apply(i, actions);
            }
        }
    }

    pub fn timeout(&mut self, node: usize) {
        let actions = self.nodes[node].on_timeout();
        self.apply(node, actions);
    }

    pub fn timeout_all(&mut self) {
        for i in self.live() {
            self.timeout(i);
        }
    }

    /// One proposal and its full round trip.
    pub fn round(&mut self) {
        self.deliver_all();
        self.tick();
        self.deliver_all();
    }

    /// Queues messages for `target` signed by a key outside the committee,
    /// one of them claiming to come from the current leader.
    pub fn inject_outsider(&mut self, target: usize, salt: u64) {
        let outsider = Keypair::from_seed(OUTSIDER_SEED);
        let status = self.nodes[target].status();
        let ctx = self.nodes[target].context().clone();
        let payload = ConsensusPayload::new(status.committed, format!("x{salt}").into_bytes());

        let prepare = ctx.codec().sign_consensus_data(
            &outsider,
            ConsensusData {
                view: status.view,
                phase: Phase::Prepare,
                payload: payload.clone(),
                justify: ctx.genesis_qc(),
            },
        );
        let mut forged = prepare.clone();
        forged.seal.signer = status.leader;
        let vote = ctx.codec().sign_vote(
            &outsider,
            QcData {
                phase: Phase::Prepare,
                view: status.view,
                payload,
            },
        );

        for message in [
            ConsensusMessage::Prepare(prepare),
            ConsensusMessage::Prepare(forged),
            ConsensusMessage::Vote(vote),
        ] {
            self.queue.push_back(Envelope {
                from: target,
                to: target,
                message,
            });
        }
    }

    /// Queues a second, conflicting proposal and vote signed with the key
    /// of [`BYZANTINE`] for the view `target` is in. The proposal is only
    /// sent when that member leads the view.
    pub fn equivocate(&mut self, target: usize, salt: u64) {
        if target == BYZANTINE {
            return;
        }
        let key = Keypair::from_seed(BYZANTINE as u64);
        let status = self.nodes[target].status();
        let ctx = self.nodes[target].context().clone();
        let payload = ConsensusPayload::new(
            status.committed,
            format!("e{}-{salt}", status.view).into_bytes(),
        );

        if status.leader == self.ids[BYZANTINE] {
            let prepare = ctx.codec().sign_consensus_data(
                &key,
                ConsensusData {
                    view: status.view,
                    phase: Phase::Prepare,
                    payload: payload.clone(),
                    justify: ctx.genesis_qc(),
                },
            );
            self.queue.push_back(Envelope {
                from: BYZANTINE,
                to: target,
                message: ConsensusMessage::Prepare(prepare),
            });
        }

        let vote = ctx.codec().sign_vote(
            &key,
            QcData {
                phase: Phase::Prepare,
                view: status.view,
                payload,
            },
        );
        self.queue.push_back(Envelope {
            from: BYZANTINE,
            to: self.index_of(&status.leader),
            message: ConsensusMessage::Vote(vote),
        });
    }

    pub fn qcs_formed(&self, view: u64) -> usize {
        self.events
            .iter()
            .flatten()
            .filter(|e| matches!(e, ConsensusEvent::QcFormed { view: v, .. } if *v == view))
            .count()
    }
}

/// Every pair of nodes agrees on their common committed prefix.
pub fn assert_prefix_consistent(executed: &[Vec<Vec<u8>>]) {
    for a in executed {
        for b in executed {
            let common = a.len().min(b.len());
            assert_eq!(a[..common], b[..common], "committed histories diverge");
        }
    }
}
