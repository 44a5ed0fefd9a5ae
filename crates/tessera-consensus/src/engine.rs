//! Consensus engine implementation.
//!
//! The engine owns the I/O around a [`ConsensusCore`]: it drains inbound
//! bytes, drives the view-change timer and the proposal ticker, and carries
//! out the actions the core returns. The core is synchronous and the engine
//! never awaits while holding its lock.
//!
//! Outbound messages and committed payloads are handed to two background
//! tasks, so a slow peer or executor never holds up the timer. Committed
//! payloads queue without bound and reach the [`Executor`] in order; an
//! outbound message that finds its queue full is dropped.

use crate::action::{Action, ConsensusEvent};
use crate::config::ConsensusConfig;
use crate::crypto::{Keypair, MemberId};
use crate::error::{ConsensusError, Result};
use crate::message::ConsensusMessage;
use crate::metrics::ConsensusMetrics;
use crate::pacemaker::Pacemaker;
use crate::state_machine::{ConsensusCore, ConsensusStatus};
use crate::store::StateStore;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

/// Outbound messages that may wait for the transport.
const OUTBOUND_BUFFER: usize = 1024;

/// Receives committed payloads, in commit order, exactly once each.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Called when a payload is committed.
    async fn on_commit(&self, data: &[u8]);
}

/// Supplies proposal data when the local node leads a view.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Returns the data to propose in `view`. May be empty.
    async fn next_payload(&self, view: u64) -> Vec<u8>;
}

/// The consensus engine.
pub struct ConsensusEngine {
    /// Engine configuration.
    config: ConsensusConfig,

    /// State machines.
    core: Arc<ConsensusCore>,

    /// View-change timer.
    pacemaker: Pacemaker,

    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    payloads: Arc<dyn PayloadSource>,

    /// Event broadcaster.
    events: broadcast::Sender<ConsensusEvent>,

    /// Inbound message receiver (owned by engine runner).
    inbound: Mutex<Option<mpsc::Receiver<Bytes>>>,

    /// Stop signal.
    shutdown: watch::Sender<bool>,
}

impl ConsensusEngine {
    /// Creates a new consensus engine.
    pub fn new(
        config: ConsensusConfig,
        keypair: Keypair,
        store: Arc<dyn StateStore>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Bytes>,
        executor: Arc<dyn Executor>,
        payloads: Arc<dyn PayloadSource>,
    ) -> Result<Self> {
        let core = Arc::new(ConsensusCore::new(&config, keypair, store)?);
        let (events, _) = broadcast::channel(1024);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            pacemaker: Pacemaker::new(config.consensus_timeout),
            config,
            core,
            transport,
            executor,
            payloads,
            events,
            inbound: Mutex::new(Some(inbound)),
            shutdown,
        })
    }

    /// Subscribes to consensus events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }

    /// Returns the current consensus status.
    pub fn status(&self) -> ConsensusStatus {
        self.core.status()
    }

    /// Returns the local member id.
    pub fn member_id(&self) -> MemberId {
        self.core.context().me()
    }

    /// Node metrics.
    pub fn metrics(&self) -> &Arc<ConsensusMetrics> {
        self.core.metrics()
    }

    /// Members heard from within the last online check interval.
    pub fn online_members(&self) -> Vec<MemberId> {
        self.core
            .liveness()
            .online_members(self.config.member_online_check_interval)
    }

    /// Runs the consensus engine until [`ConsensusEngine::stop`] is called or
    /// the inbound channel closes.
    pub async fn run(&self) -> Result<()> {
        let mut inbound = self
            .inbound
            .lock()
            .take()
            .ok_or(ConsensusError::AlreadyRunning)?;
        let mut shutdown = self.shutdown.subscribe();

        let mut proposal_tick = interval(self.config.consensus_interval);
        proposal_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let check_every = self.config.member_online_check_interval;
        let mut online_tick = interval_at(Instant::now() + check_every, check_every);

        tracing::info!(
            member = %self.member_id(),
            view = self.status().view,
            "consensus engine started"
        );

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (commits, commits_rx) = mpsc::unbounded_channel();
        let sender = spawn_sender(self.transport.clone(), outbound_rx);
        let executor = spawn_executor(self.executor.clone(), commits_rx);
        let outlets = Outlets { outbound, commits };

        let actions = self.core.start();
        self.execute(&outlets, actions);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                received = inbound.recv() => match received {
                    Some(bytes) => self.on_bytes(&outlets, bytes),
                    None => {
                        tracing::info!("inbound channel closed");
                        break;
                    }
                },

                _ = self.pacemaker.expired() => {
                    let actions = self.core.on_timeout();
                    self.execute(&outlets, actions);
                }

                _ = proposal_tick.tick() => self.try_propose(&outlets).await,

                _ = online_tick.tick() => self.check_online(),
            }
        }

        // Every committed payload reaches the executor before run returns.
        drop(outlets);
        sender.abort();
        if let Err(e) = executor.await {
            tracing::error!(error = %e, "executor task failed");
        }

        tracing::info!(member = %self.member_id(), "consensus engine stopped");
        Ok(())
    }

    /// Stops the engine.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Handles raw bytes from the transport.
    fn on_bytes(&self, outlets: &Outlets, bytes: Bytes) {
        let message = match ConsensusMessage::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(len = bytes.len(), error = %e, "undecodable consensus message");
                self.metrics().message_dropped("Undecodable");
                return;
            }
        };

        self.metrics().message_received(message.kind());

        let actions = self.core.handle(message);
        self.execute(outlets, actions);
    }

    /// Proposes if the local node leads the current view and a quorum has
    /// entered it.
    async fn try_propose(&self, outlets: &Outlets) {
        let Some(slot) = self.core.proposal_slot() else {
            return;
        };

        let data = if slot.needs_payload() {
            self.payloads.next_payload(slot.view).await
        } else {
            Vec::new()
        };

        let actions = self.core.propose(slot, data);
        self.execute(outlets, actions);
    }

    fn check_online(&self) {
        let window = self.config.member_online_check_interval;
        let offline = self.core.liveness().offline_members(window);
        let total = self.core.context().committee().len();
        self.metrics()
            .online_members
            .set((total - offline.len()) as i64);

        if !offline.is_empty() {
            tracing::warn!(
                offline = offline.len(),
                members = ?offline,
                "committee members not heard from"
            );
        }
    }

    fn execute(&self, outlets: &Outlets, actions: Vec<Action>) {
        for action in actions {
            match action {
                send @ (Action::SendToLeader { .. } | Action::Broadcast { .. }) => {
                    if let Err(e) = outlets.outbound.try_send(send) {
                        tracing::warn!(error = %e, "outbound message dropped");
                    }
                }
                commit @ Action::Execute { .. } => {
                    if outlets.commits.send(commit).is_err() {
                        tracing::error!("executor task is gone, committed payload not executed");
                    }
                }
                Action::ResetTimer { timeout } => self.pacemaker.reset(timeout),
                Action::Notify(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }
}

/// Feeds for the background tasks of a running engine.
struct Outlets {
    outbound: mpsc::Sender<Action>,
    commits: mpsc::UnboundedSender<Action>,
}

fn spawn_sender(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<Action>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            match action {
                Action::SendToLeader { leader, message } => {
                    if let Err(e) = transport.send_to(&leader, &message).await {
                        tracing::warn!(to = %leader, kind = message.kind(), error = %e, "send failed");
                    }
                }
                Action::Broadcast { message } => {
                    if let Err(e) = transport.broadcast(&message).await {
                        tracing::warn!(kind = message.kind(), error = %e, "broadcast failed");
                    }
                }
                _ => {}
            }
        }
    })
}

fn spawn_executor(
    executor: Arc<dyn Executor>,
    mut rx: mpsc::UnboundedReceiver<Action>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(action) = rx.recv().await {
            if let Action::Execute {
                view,
                height,
                payload,
            } = action
            {
                tracing::debug!(view, height, bytes = payload.data.len(), "executing payload");
                executor.on_commit(&payload.data).await;
            }
        }
    })
}

/// An executor that discards committed payloads.
#[derive(Debug, Default)]
pub struct NoOpExecutor;

#[async_trait]
impl Executor for NoOpExecutor {
    async fn on_commit(&self, _data: &[u8]) {}
}

/// A payload source that always proposes empty data.
#[derive(Debug, Default)]
pub struct EmptyPayloads;

#[async_trait]
impl PayloadSource for EmptyPayloads {
    async fn next_payload(&self, _view: u64) -> Vec<u8> {
        Vec::new()
    }
}
