//! Storage layer for Railhead: the versioned deployment state and where it lives.
//!
//! This crate provides an in-memory `FileTree` and the typed `State` snapshot
//! over it, the repository tree layout (`layout`), a `GitRepository` adapter that
//! loads, commits, fetches and pushes the single branch acting as system of
//! record, SSH `Credentials` with pinned host keys, bounded exponential
//! `Backoff` for pushes, repository repacking (`GarbageCollector`), and the
//! relational `EventLog` mirroring every applied change.

pub mod backoff;
pub mod credentials;
pub mod events;
pub mod gc;
pub mod git;
pub mod layout;
pub mod state;
pub mod tree;

pub use backoff::{Backoff, Retry};
pub use credentials::{Credentials, KnownHosts};
pub use events::{
    CommitEventRow, DeploymentRow, EslEvent, EventLog, EventSavepoint, EventStore, EventTx,
    ReleaseRow, TxMode,
};
pub use gc::{GarbageCollector, GcReport};
pub use git::GitRepository;
pub use layout::{RepoLayout, LAYOUT_FORMAT_VERSION};
pub use state::State;
pub use tree::{FileTree, TreeChange};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Schema(#[from] railhead_schema::SchemaError),
    #[error("corrupt repository data at '{path}': {reason}")]
    Corrupt { path: String, reason: String },
    #[error("push rejected as non-fast-forward: {0}")]
    NonFastForward(String),
    #[error("push of '{reference}' rejected by remote: {status}")]
    PushRejected { reference: String, status: String },
    #[error("host key verification failed for '{0}'")]
    HostKey(String),
    #[error("credentials error: {0}")]
    Credentials(String),
    #[error("repository layout version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("repack failed: {0}")]
    Gc(String),
    #[error("write attempted in a read-only event log transaction")]
    ReadOnly,
    #[error("commit '{0}' does not exist")]
    UnknownCommit(String),
}

impl StoreError {
    pub(crate) fn corrupt(path: &str, reason: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            path: path.to_owned(),
            reason: reason.to_string(),
        }
    }
}
