//! Runs the hosted committee members over an in-process network.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tessera_consensus::{
    ConsensusEngine, ConsensusEvent, ConsensusStatus, Executor, FileStateStore, LocalNetwork,
    MemberId, MemoryStateStore, PayloadSource, StateStore,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Logs every committed payload.
struct LoggingExecutor {
    member: MemberId,
}

#[async_trait]
impl Executor for LoggingExecutor {
    async fn on_commit(&self, data: &[u8]) {
        tracing::info!(
            member = %self.member.short_id(),
            bytes = data.len(),
            payload = %String::from_utf8_lossy(data),
            "payload committed"
        );
    }
}

/// Proposes `<network>/view-<n>` in every view.
struct ViewPayloads {
    network: String,
}

#[async_trait]
impl PayloadSource for ViewPayloads {
    async fn next_payload(&self, view: u64) -> Vec<u8> {
        format!("{}/view-{view}", self.network).into_bytes()
    }
}

/// The running members of one node process.
pub struct LocalCommittee {
    engines: Vec<Arc<ConsensusEngine>>,
    handles: Vec<JoinHandle<tessera_consensus::Result<()>>>,
    events: broadcast::Receiver<ConsensusEvent>,
}

impl LocalCommittee {
    /// Builds an engine per hosted key and starts them.
    pub fn start(config: &NodeConfig) -> Result<Self> {
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let network = LocalNetwork::new();
        let mut engines = Vec::new();
        for key in config.keypairs()? {
            let member = key.member_id();
            let store: Arc<dyn StateStore> = match config.state_path(&member) {
                Some(path) => Arc::new(FileStateStore::new(path)),
                None => Arc::new(MemoryStateStore::new()),
            };
            let (transport, inbound) = network.join(member, config.mailbox_size);

            let engine = ConsensusEngine::new(
                config.consensus.clone(),
                key,
                store,
                Arc::new(transport),
                inbound,
                Arc::new(LoggingExecutor { member }),
                Arc::new(ViewPayloads {
                    network: config.network.clone(),
                }),
            )
            .with_context(|| format!("failed to create engine for {member}"))?;
            engines.push(Arc::new(engine));
        }

        let events = engines
            .first()
            .context("no hosted members")?
            .subscribe();

        let handles = engines
            .iter()
            .map(|engine| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.run().await })
            })
            .collect();

        tracing::info!(
            network = %config.network,
            hosted = engines.len(),
            committee = config.consensus.members.len(),
            "committee started"
        );

        Ok(Self {
            engines,
            handles,
            events,
        })
    }

    /// Returns the engines, in the order of the configured keys.
    pub fn engines(&self) -> &[Arc<ConsensusEngine>] {
        &self.engines
    }

    /// Waits until the first hosted member has committed `rounds` payloads,
    /// or forever when `rounds` is `None`. Ctrl-C ends the wait early.
    pub async fn run_until(&mut self, rounds: Option<u64>) {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("interrupted");
                    return;
                }
                event = self.events.recv() => match event {
                    Ok(ConsensusEvent::Committed { height, .. }) => {
                        if rounds.is_some_and(|r| height >= r) {
                            tracing::info!(height, "target height reached");
                            return;
                        }
                    }
                    Ok(ConsensusEvent::TimedOut { view }) => {
                        tracing::warn!(view, "view timed out");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    /// Stops every engine and returns their final status.
    pub async fn shutdown(self) -> Result<Vec<ConsensusStatus>> {
        for engine in &self.engines {
            engine.stop();
        }
        for handle in self.handles {
            handle.await.context("engine task panicked")??;
        }

        let statuses: Vec<_> = self.engines.iter().map(|e| e.status()).collect();
        for (engine, status) in self.engines.iter().zip(&statuses) {
            tracing::info!(
                member = %engine.member_id().short_id(),
                view = status.view,
                height = status.height,
                committed = %status.committed,
                "engine stopped"
            );
        }
        Ok(statuses)
    }
}
