//! Engine configuration, read from TOML.
//!
//! Every section and key is optional; a missing file section falls back to
//! the defaults documented on each field.

use crate::permissions::Permissions;
use crate::CoreError;
use railhead_store::Backoff;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub repository: RepositoryConfig,
    pub push: PushConfig,
    pub events: EventsConfig,
    pub train: TrainConfig,
    pub transformers: TransformerSettings,
    pub permissions: Permissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Local working directory holding the bare repository, event log and lock.
    pub path: PathBuf,
    /// Remote to fetch from and push to. Without one the repository is local only.
    pub url: Option<String>,
    pub branch: String,
    pub committer_name: String,
    pub committer_email: String,
    pub ssh_key_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    /// Repack after this many successful writes; 0 disables.
    pub gc_frequency: u32,
    /// Requests drained from the queue per write cycle.
    pub max_batch: usize,
    /// Fetch/reset/reapply rounds after a non-fast-forward push.
    pub conflict_retries: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("railhead-data"),
            url: None,
            branch: "master".to_owned(),
            committer_name: "railhead".to_owned(),
            committer_email: "railhead@localhost".to_owned(),
            ssh_key_path: None,
            known_hosts_path: None,
            gc_frequency: 20,
            max_batch: 10,
            conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushConfig {
    pub max_elapsed_ms: u64,
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_elapsed_ms: 7000,
            max_retries: 6,
            initial_interval_ms: 100,
            multiplier: 2.0,
            max_interval_ms: 2000,
        }
    }
}

impl PushConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_interval_ms),
            max_elapsed: Duration::from_millis(self.max_elapsed_ms),
            max_retries: self.max_retries,
            ..Backoff::default()
        }
    }
}

/// How the relational event log participates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMode {
    /// No event log.
    #[default]
    Off,
    /// Audit trail only; reads come from git.
    Esl,
    /// Audit trail that also serves deployment reads.
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    pub mode: EventMode,
    /// Defaults to `events.sqlite` inside the repository directory.
    pub path: Option<PathBuf>,
    pub tx_retries: u32,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            mode: EventMode::Off,
            path: None,
            tx_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Compute environment prognoses on a worker pool before applying them.
    pub parallel_prognosis: bool,
    pub max_threads: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            parallel_prognosis: false,
            max_threads: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformerSettings {
    /// Releases kept below the oldest deployed one, counting that one.
    pub kept_versions_on_cleanup: usize,
    /// Record audit events against release source commits.
    pub write_commit_data: bool,
    pub max_nesting_depth: usize,
    /// Copied from `[train]` when the engine starts.
    #[serde(skip)]
    pub parallel_prognosis: bool,
    #[serde(skip)]
    pub max_threads: usize,
}

impl Default for TransformerSettings {
    fn default() -> Self {
        Self {
            kept_versions_on_cleanup: 10,
            write_commit_data: false,
            max_nesting_depth: 16,
            parallel_prognosis: false,
            max_threads: 4,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: Self =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Local-only repository under `path` with every other setting defaulted.
    pub fn for_local(path: impl Into<PathBuf>) -> Self {
        Self {
            repository: RepositoryConfig {
                path: path.into(),
                ..RepositoryConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.repository.branch.is_empty() {
            return Err(CoreError::Config("repository.branch must not be empty".to_owned()));
        }
        if self.repository.max_batch == 0 {
            return Err(CoreError::Config("repository.max_batch must be at least 1".to_owned()));
        }
        if self.train.max_threads == 0 {
            return Err(CoreError::Config("train.max_threads must be at least 1".to_owned()));
        }
        if self.transformers.kept_versions_on_cleanup == 0 {
            return Err(CoreError::Config(
                "transformers.kept_versions_on_cleanup must be at least 1".to_owned(),
            ));
        }
        if self.push.multiplier < 1.0 {
            return Err(CoreError::Config("push.multiplier must be at least 1.0".to_owned()));
        }
        Ok(())
    }

    pub fn events_path(&self) -> PathBuf {
        self.events
            .path
            .clone()
            .unwrap_or_else(|| self.repository.path.join("events.sqlite"))
    }

    /// Transformer settings with the train section folded in.
    pub fn transformer_settings(&self) -> TransformerSettings {
        TransformerSettings {
            parallel_prognosis: self.train.parallel_prognosis,
            max_threads: self.train.max_threads,
            ..self.transformers.clone()
        }
    }
}
