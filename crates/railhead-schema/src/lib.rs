//! Identifiers, name validation, and the persisted record types of Railhead.
//!
//! This crate defines the schema layer shared by the store and the engine:
//! validated newtypes for environments, applications, teams, locks and commits
//! (`EnvName`, `AppName`, ...), environment configuration with upstream
//! resolution (`EnvironmentConfig`), lock records and the per-deploy lock policy
//! (`Lock`, `LockBehaviour`), release and deployment metadata, and the audit
//! events attached to source commits (`Event`).

pub mod config;
pub mod event;
pub mod lock;
pub mod release;
pub mod types;
pub mod validate;

pub use config::{
    resolve_train_targets, ArgoCdConfig, ArgoCdDestination, EnvironmentConfig, TargetType,
    Upstream, UpstreamProblem, UpstreamSource,
};
pub use event::{Event, EventKind};
pub use lock::{Actor, Lock, LockBehaviour, LockScope};
pub use release::{Deployment, Release, SourceTrain};
pub use types::{AppName, CommitId, EnvGroupName, EnvName, LockId, TeamName, Version};
pub use validate::{
    validate_app_name, validate_commit_id, validate_env_name, validate_lock_id,
    validate_team_name,
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid {kind}: '{value}'")]
    InvalidName { kind: &'static str, value: String },
    #[error("no environment or environment group named '{0}'")]
    UnknownTarget(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_display_invalid_name() {
        let e = SchemaError::InvalidName {
            kind: "application name",
            value: "Bad_Name".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("application name"));
        assert!(msg.contains("Bad_Name"));
    }

    #[test]
    fn schema_error_display_unknown_target() {
        let e = SchemaError::UnknownTarget("prod".to_owned());
        assert!(e.to_string().contains("prod"));
    }
}
