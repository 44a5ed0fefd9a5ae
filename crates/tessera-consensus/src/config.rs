//! Consensus configuration.

use crate::crypto::{HashAlgorithm, MemberId};
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters consumed by the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Ordered committee; order defines leader rotation.
    pub members: Vec<MemberId>,

    /// Quorum size override. Defaults to `n - floor((n - 1) / 3)`.
    #[serde(default)]
    pub quorum: Option<usize>,

    /// Hash function used for digests and signing.
    #[serde(default)]
    pub hash: HashAlgorithm,

    /// Time without progress before a view change.
    #[serde(default = "default_timeout", with = "millis")]
    pub consensus_timeout: Duration,

    /// Pace at which the leader proposes.
    #[serde(default = "default_interval", with = "millis")]
    pub consensus_interval: Duration,

    /// How often member liveness is checked.
    #[serde(default = "default_online_check", with = "millis")]
    pub member_online_check_interval: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_online_check() -> Duration {
    Duration::from_secs(5)
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            quorum: None,
            hash: HashAlgorithm::default(),
            consensus_timeout: default_timeout(),
            consensus_interval: default_interval(),
            member_online_check_interval: default_online_check(),
        }
    }
}

impl ConsensusConfig {
    /// Creates a configuration for `members` with default timings.
    pub fn new(members: Vec<MemberId>) -> Self {
        Self {
            members,
            ..Default::default()
        }
    }

    /// Validates timing parameters. Committee checks happen when the
    /// [`crate::Committee`] is built.
    pub fn validate(&self) -> Result<()> {
        if self.consensus_timeout.is_zero() {
            return Err(ConsensusError::Config("consensus_timeout is zero".into()));
        }
        if self.consensus_interval.is_zero() {
            return Err(ConsensusError::Config("consensus_interval is zero".into()));
        }
        if self.member_online_check_interval.is_zero() {
            return Err(ConsensusError::Config(
                "member_online_check_interval is zero".into(),
            ));
        }
        if self.consensus_interval >= self.consensus_timeout {
            tracing::warn!(
                interval_ms = self.consensus_interval.as_millis() as u64,
                timeout_ms = self.consensus_timeout.as_millis() as u64,
                "consensus interval is not shorter than the timeout; every view will time out"
            );
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn test_defaults_validate() {
        let config = ConsensusConfig::new(vec![Keypair::from_seed(0).member_id()]);
        assert!(config.validate().is_ok());
        assert_eq!(config.consensus_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ConsensusConfig {
            consensus_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConsensusError::Config(_))));
    }

    #[test]
    fn test_json_durations_in_millis() {
        let member = Keypair::from_seed(0).member_id();
        let json = format!(
            r#"{{"members":["{}"],"consensus_timeout":1500,"hash":"sha512"}}"#,
            member.to_hex()
        );
        let config: ConsensusConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.consensus_timeout, Duration::from_millis(1500));
        assert_eq!(config.consensus_interval, Duration::from_secs(1));
        assert_eq!(config.hash, HashAlgorithm::Sha512);
        assert_eq!(config.members, vec![member]);
    }
}
