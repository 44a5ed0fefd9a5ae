//! Node configuration.
//!
//! A node process hosts one or more committee members. The file lists the
//! secrets of the hosted members next to the committee definition they all
//! share; members of the committee that are not hosted here are expected to
//! run elsewhere.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tessera_consensus::{Committee, ConsensusConfig, Keypair, MemberId};

/// Configuration for a Tessera node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network name.
    pub network: String,

    /// Hex-encoded secret keys of the members hosted by this process.
    pub keys: Vec<String>,

    /// Directory for persisted consensus state. State is kept in memory
    /// when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Inbound queue capacity per hosted member.
    #[serde(default = "default_mailbox_size")]
    pub mailbox_size: usize,

    /// Committee and timing parameters.
    pub consensus: ConsensusConfig,
}

fn default_mailbox_size() -> usize {
    1024
}

impl NodeConfig {
    /// Loads a configuration file, choosing the format from the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::load_json(path),
            Some("yaml") | Some("yml") => Self::load_yaml(path),
            _ => bail!(
                "unsupported config format for {}: expected .json, .yaml or .yml",
                path.display()
            ),
        }
    }

    /// Loads configuration from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config_file(path.as_ref())?;
        let config: NodeConfig =
            serde_json::from_str(&content).context("failed to parse JSON config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config_file(path.as_ref())?;
        let config: NodeConfig =
            serde_yaml::from_str(&content).context("failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as YAML.
    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.network.is_empty() {
            bail!("network is empty");
        }
        if self.keys.is_empty() {
            bail!("no hosted member keys");
        }
        if self.mailbox_size == 0 {
            bail!("mailbox_size is zero");
        }

        self.consensus.validate()?;
        let committee = Committee::new(self.consensus.members.clone(), self.consensus.quorum)?;

        let mut seen = HashSet::new();
        for key in self.keypairs()? {
            let member = key.member_id();
            if !committee.contains(&member) {
                bail!("hosted key {member} is not a committee member");
            }
            if !seen.insert(member) {
                bail!("hosted key {member} listed twice");
            }
        }

        Ok(())
    }

    /// Decodes the hosted member keys.
    pub fn keypairs(&self) -> Result<Vec<Keypair>> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, k)| Keypair::from_secret_hex(k).with_context(|| format!("key #{i}")))
            .collect()
    }

    /// Where the state of `member` is persisted, if anywhere.
    pub fn state_path(&self, member: &MemberId) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", member.to_hex())))
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    // Editors on Windows like to prepend a byte order mark.
    Ok(match content.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => content,
    })
}

/// Generates a devnet configuration hosting every member of an `n`-member
/// committee with deterministic keys.
pub fn generate_devnet(members: u64) -> NodeConfig {
    let keys: Vec<Keypair> = (0..members).map(Keypair::from_seed).collect();

    let mut consensus = ConsensusConfig::new(keys.iter().map(Keypair::member_id).collect());
    consensus.consensus_interval = Duration::from_millis(200);
    consensus.consensus_timeout = Duration::from_secs(2);
    consensus.member_online_check_interval = Duration::from_secs(5);

    NodeConfig {
        network: "tessera-devnet".into(),
        keys: keys.iter().map(Keypair::secret_hex).collect(),
        data_dir: None,
        mailbox_size: default_mailbox_size(),
        consensus,
    }
}
