use crate::lock::Actor;
use crate::types::{CommitId, EnvGroupName, EnvName, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of one release of an application.
///
/// Manifests are stored next to it in the tree, one file per environment, and
/// are read through the state rather than carried here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_commit_id: Option<CommitId>,
    #[serde(default)]
    pub source_author: String,
    #[serde(default)]
    pub source_message: String,
    #[serde(default)]
    pub display_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub undeploy: bool,
}

/// The currently deployed release of an application in one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub version: Version,
    pub deployed_by: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
}

/// Origin of a deploy issued by a release train.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceTrain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_group: Option<EnvGroupName>,
    pub upstream: EnvName,
}
