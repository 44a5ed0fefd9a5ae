//! Prometheus metrics for a consensus node.
//!
//! Each node owns its registry so that several nodes can share a process, as
//! the local devnet does.

use crate::action::{Action, ConsensusEvent};
use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Certificate labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    /// Phase the certificate was formed in.
    pub phase: String,
}

/// Inbound message labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabels {
    /// Message type (NewView, Prepare, ..., Vote).
    pub kind: String,
}

/// Metrics state container.
#[derive(Clone)]
pub struct ConsensusMetrics {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Committed payloads.
    pub commits_total: Counter,
    /// Views entered after the first.
    pub view_changes_total: Counter,
    /// Views abandoned on timeout.
    pub timeouts_total: Counter,
    /// Certificates formed while leading, by phase.
    pub qcs_formed_total: Family<PhaseLabels, Counter>,
    /// Decoded inbound messages, by type.
    pub messages_received_total: Family<MessageLabels, Counter>,
    /// Messages rejected by validation or undecodable, by type.
    pub messages_dropped_total: Family<MessageLabels, Counter>,
    /// Current view.
    pub current_view: Gauge,
    /// Committed chain height.
    pub current_height: Gauge,
    /// Members heard from within the last online check.
    pub online_members: Gauge,
    /// Size of committed payload data.
    pub payload_bytes: Histogram,
}

impl Default for ConsensusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsensusMetrics {
    /// Create a new metrics state with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let commits_total = Counter::default();
        registry.register(
            "tessera_commits",
            "Committed payloads",
            commits_total.clone(),
        );

        let view_changes_total = Counter::default();
        registry.register(
            "tessera_view_changes",
            "Views entered",
            view_changes_total.clone(),
        );

        let timeouts_total = Counter::default();
        registry.register(
            "tessera_view_timeouts",
            "Views abandoned on timeout",
            timeouts_total.clone(),
        );

        let qcs_formed_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "tessera_qcs_formed",
            "Quorum certificates formed by this node as leader",
            qcs_formed_total.clone(),
        );

        let messages_received_total = Family::<MessageLabels, Counter>::default();
        registry.register(
            "tessera_messages_received",
            "Decoded consensus messages received",
            messages_received_total.clone(),
        );

        let messages_dropped_total = Family::<MessageLabels, Counter>::default();
        registry.register(
            "tessera_messages_dropped",
            "Consensus messages dropped by validation",
            messages_dropped_total.clone(),
        );

        let current_view = Gauge::default();
        registry.register("tessera_view", "Current view", current_view.clone());

        let current_height = Gauge::default();
        registry.register(
            "tessera_height",
            "Committed chain height",
            current_height.clone(),
        );

        let online_members = Gauge::default();
        registry.register(
            "tessera_online_members",
            "Committee members heard from recently",
            online_members.clone(),
        );

        let payload_bytes = Histogram::new(exponential_buckets(64.0, 2.0, 16));
        registry.register(
            "tessera_payload_bytes",
            "Size of committed payload data in bytes",
            payload_bytes.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            commits_total,
            view_changes_total,
            timeouts_total,
            qcs_formed_total,
            messages_received_total,
            messages_dropped_total,
            current_view,
            current_height,
            online_members,
            payload_bytes,
        }
    }

    /// Updates counters from the actions a handler produced.
    pub fn observe(&self, actions: &[Action]) {
        for action in actions {
            match action {
                Action::Execute { payload, .. } => {
                    self.payload_bytes.observe(payload.data.len() as f64);
                }
                Action::Notify(event) => self.observe_event(event),
                _ => {}
            }
        }
    }

    fn observe_event(&self, event: &ConsensusEvent) {
        match event {
            ConsensusEvent::QcFormed { phase, .. } => {
                self.qcs_formed_total
                    .get_or_create(&PhaseLabels {
                        phase: phase.to_string(),
                    })
                    .inc();
            }
            ConsensusEvent::Committed { height, .. } => {
                self.commits_total.inc();
                self.current_height.set(*height as i64);
            }
            ConsensusEvent::ViewChanged { view, .. } => {
                self.view_changes_total.inc();
                self.current_view.set(*view as i64);
            }
            ConsensusEvent::TimedOut { .. } => {
                self.timeouts_total.inc();
            }
        }
    }

    /// Counts a decoded inbound message.
    pub fn message_received(&self, kind: &str) {
        self.messages_received_total
            .get_or_create(&MessageLabels { kind: kind.into() })
            .inc();
    }

    /// Counts a dropped message.
    pub fn message_dropped(&self, kind: &str) {
        self.messages_dropped_total
            .get_or_create(&MessageLabels { kind: kind.into() })
            .inc();
    }

    /// Renders the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry.read()) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HashAlgorithm;
    use crate::types::Phase;

    #[test]
    fn test_observe_events() {
        let metrics = ConsensusMetrics::new();
        metrics.observe(&[
            Action::Notify(ConsensusEvent::QcFormed {
                view: 0,
                phase: Phase::Prepare,
            }),
            Action::Notify(ConsensusEvent::Committed {
                view: 0,
                height: 1,
                digest: HashAlgorithm::Sha256.digest(b"p"),
            }),
            Action::Notify(ConsensusEvent::TimedOut { view: 1 }),
        ]);

        assert_eq!(metrics.commits_total.get(), 1);
        assert_eq!(metrics.current_height.get(), 1);
        assert_eq!(metrics.timeouts_total.get(), 1);

        let text = metrics.encode();
        assert!(text.contains("tessera_commits_total 1"));
        assert!(text.contains("phase=\"Prepare\""));
    }

    #[test]
    fn test_dropped_by_kind() {
        let metrics = ConsensusMetrics::new();
        metrics.message_dropped("Vote");
        metrics.message_dropped("Vote");

        let count = metrics
            .messages_dropped_total
            .get_or_create(&MessageLabels {
                kind: "Vote".into(),
            })
            .get();
        assert_eq!(count, 2);
    }
}
