//! Deployment orchestration engine for Railhead.
//!
//! This crate turns requests into commits: the `Transformer` sum type and every
//! concrete operation (releases, deploys, locks, queueing, cleanup, release
//! trains), the lock policy, permission checks, the single-writer `Engine` that
//! batches, commits and pushes with conflict retry, readiness and change
//! notification, and process-level locking and signal handling.

pub mod concurrency;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod environment;
pub mod locks;
pub mod notify;
pub mod permissions;
pub mod release;
pub mod train;
pub mod transformer;

pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken, RepoLock};
pub use config::{
    EngineConfig, EventMode, EventsConfig, PushConfig, RepositoryConfig, TrainConfig,
    TransformerSettings,
};
pub use deploy::{DeployApplicationVersion, DeployPrognosis, QueueApplicationVersion};
pub use engine::{ApplyOutcome, Engine};
pub use environment::CreateEnvironment;
pub use locks::{
    CreateEnvironmentApplicationLock, CreateEnvironmentGroupLock, CreateEnvironmentLock,
    CreateEnvironmentTeamLock, DeleteEnvironmentApplicationLock, DeleteEnvironmentGroupLock,
    DeleteEnvironmentLock, DeleteEnvironmentTeamLock, LockedError,
};
pub use notify::{Notify, Readiness};
pub use permissions::Permissions;
pub use release::{
    CleanupOldApplicationVersions, CreateApplicationVersion, CreateUndeployApplicationVersion,
};
pub use train::{
    AppPrognosis, AppSkipCause, EnvPrognosis, EnvReleaseTrain, EnvSkipCause, ReleaseTrain,
    ReleaseTrainPrognosis,
};
pub use transformer::{CommitEvent, DbRecord, History, Transformer, TransformerContext};

use railhead_schema::SchemaError;
use railhead_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Locked(#[from] Box<LockedError>),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("conflicting concurrent write: {0}")]
    Conflict(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("write queue closed")]
    QueueClosed,
    #[error("transformers nested deeper than {0} levels")]
    NestingTooDeep(usize),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SchemaError> for CoreError {
    fn from(e: SchemaError) -> Self {
        match e {
            SchemaError::InvalidName { .. } => CoreError::Validation(e.to_string()),
            SchemaError::UnknownTarget(_) => CoreError::NotFound(e.to_string()),
        }
    }
}

impl From<LockedError> for CoreError {
    fn from(e: LockedError) -> Self {
        CoreError::Locked(Box::new(e))
    }
}

impl CoreError {
    /// Git, filesystem, database and encoding faults. These are not the
    /// caller's doing and are reported to callers without detail.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CoreError::Store(_) | CoreError::Serialization(_) | CoreError::Io(_)
        )
    }

    /// The message shown to callers. Internal faults are logged here with full
    /// detail and replaced by an opaque string.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            tracing::warn!("internal error: {self}");
            "internal error".to_owned()
        } else {
            self.to_string()
        }
    }

    pub fn as_locked(&self) -> Option<&LockedError> {
        match self {
            CoreError::Locked(e) => Some(e),
            _ => None,
        }
    }
}
