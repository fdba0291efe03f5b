//! Audit events attached to the source commit of a release.

use crate::types::{AppName, CommitId, EnvGroupName, EnvName};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    NewRelease {
        environments: Vec<EnvName>,
    },
    Deployment {
        application: AppName,
        environment: EnvName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_train_environment_group: Option<EnvGroupName>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_train_upstream: Option<EnvName>,
    },
    LockPreventedDeployment {
        application: AppName,
        environment: EnvName,
        lock_message: String,
        lock_type: String,
    },
    ReplacedBy {
        application: AppName,
        environment: EnvName,
        commit_id: CommitId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NewRelease,
    Deployment,
    LockPreventedDeployment,
    ReplacedBy,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewRelease { .. } => EventKind::NewRelease,
            Event::Deployment { .. } => EventKind::Deployment,
            Event::LockPreventedDeployment { .. } => EventKind::LockPreventedDeployment,
            Event::ReplacedBy { .. } => EventKind::ReplacedBy,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::NewRelease => write!(f, "new-release"),
            EventKind::Deployment => write!(f, "deployment"),
            EventKind::LockPreventedDeployment => write!(f, "lock-prevented-deployment"),
            EventKind::ReplacedBy => write!(f, "replaced-by"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_matches_kind() {
        let event = Event::LockPreventedDeployment {
            application: AppName::new("api"),
            environment: EnvName::new("prod"),
            lock_message: "freeze".to_owned(),
            lock_type: "environment".to_owned(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind().to_string());
        assert_eq!(json["lock_type"], "environment");
    }

    #[test]
    fn deployment_event_omits_empty_train_fields() {
        let event = Event::Deployment {
            application: AppName::new("api"),
            environment: EnvName::new("dev"),
            source_train_environment_group: None,
            source_train_upstream: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"deployment","application":"api","environment":"dev"}"#
        );
    }
}
