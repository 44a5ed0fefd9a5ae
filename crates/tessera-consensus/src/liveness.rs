//! Member liveness tracking.

use crate::committee::Committee;
use crate::crypto::MemberId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Last time each member was heard from.
#[derive(Debug)]
pub struct Liveness {
    committee: Arc<Committee>,
    me: MemberId,
    last_seen: RwLock<HashMap<MemberId, Instant>>,
}

impl Liveness {
    /// Creates a tracker. Nobody but the local node counts as online until
    /// a message arrives from them.
    pub fn new(committee: Arc<Committee>, me: MemberId) -> Self {
        Self {
            committee,
            me,
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    /// Records a message from `member`. Non-members are ignored.
    pub fn record(&self, member: MemberId) {
        if self.committee.contains(&member) {
            self.last_seen.write().insert(member, Instant::now());
        }
    }

    /// Members heard from within `window`, in rotation order. Always
    /// includes the local node.
    pub fn online_members(&self, window: Duration) -> Vec<MemberId> {
        self.partition(window).0
    }

    /// Members not heard from within `window`, in rotation order.
    pub fn offline_members(&self, window: Duration) -> Vec<MemberId> {
        self.partition(window).1
    }

    fn partition(&self, window: Duration) -> (Vec<MemberId>, Vec<MemberId>) {
        let now = Instant::now();
        let last_seen = self.last_seen.read();
        self.committee.members().iter().copied().partition(|member| {
            *member == self.me
                || last_seen
                    .get(member)
                    .is_some_and(|seen| now.duration_since(*seen) <= window)
        })
    }
}
