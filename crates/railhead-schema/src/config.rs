//! Environment configuration as stored in `environments/<env>/config.json`.

use crate::types::{EnvGroupName, EnvName};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argocd: Option<ArgoCdConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_group: Option<EnvGroupName>,
}

/// Where an environment receives promoted versions from.
///
/// Exactly one of `latest` and `environment` must be set for the upstream to be
/// usable; the release train reports the other combinations as skip causes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSource {
    Latest,
    Environment(EnvName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamProblem {
    NoUpstream,
    NeitherLatestNorEnvironment,
    BothLatestAndEnvironment,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgoCdConfig {
    #[serde(default)]
    pub destination: ArgoCdDestination,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_windows: Vec<ArgoCdSyncWindow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_list: Vec<ArgoCdAccessEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub application_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_differences: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgoCdDestination {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_project_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgoCdSyncWindow {
    pub schedule: String,
    pub duration: String,
    pub kind: String,
    #[serde(default)]
    pub applications: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgoCdAccessEntry {
    pub group: String,
    pub kind: String,
}

impl EnvironmentConfig {
    pub fn upstream_latest() -> Self {
        Self {
            upstream: Some(Upstream {
                environment: None,
                latest: Some(true),
            }),
            ..Self::default()
        }
    }

    pub fn upstream_env(env: impl Into<EnvName>) -> Self {
        Self {
            upstream: Some(Upstream {
                environment: Some(env.into()),
                latest: None,
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<EnvGroupName>) -> Self {
        self.environment_group = Some(group.into());
        self
    }

    pub fn is_upstream_latest(&self) -> bool {
        matches!(self.upstream_source(), Ok(UpstreamSource::Latest))
    }

    pub fn upstream_source(&self) -> Result<UpstreamSource, UpstreamProblem> {
        let Some(upstream) = &self.upstream else {
            return Err(UpstreamProblem::NoUpstream);
        };
        let latest = upstream.latest.unwrap_or(false);
        match (&upstream.environment, latest) {
            (Some(_), true) => Err(UpstreamProblem::BothLatestAndEnvironment),
            (Some(env), false) => Ok(UpstreamSource::Environment(env.clone())),
            (None, true) => Ok(UpstreamSource::Latest),
            (None, false) => Err(UpstreamProblem::NeitherLatestNorEnvironment),
        }
    }

    /// The group this environment belongs to; an ungrouped environment forms its own group.
    pub fn group_name(&self, env: &EnvName) -> EnvGroupName {
        self.environment_group
            .clone()
            .unwrap_or_else(|| EnvGroupName::new(env.as_str()))
    }
}

/// How a release train target name is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    Environment,
    EnvironmentGroup,
}

/// Resolve a release train target into the sorted list of environments it covers.
///
/// Unless restricted to environments, every environment whose group equals
/// `target` is selected. Unless restricted to groups, an environment named
/// `target` is used when no group matched.
pub fn resolve_train_targets(
    configs: &BTreeMap<EnvName, EnvironmentConfig>,
    target: &str,
    target_type: Option<TargetType>,
) -> Result<Vec<EnvName>, SchemaError> {
    let mut envs: Vec<EnvName> = Vec::new();
    if target_type != Some(TargetType::Environment) {
        envs.extend(
            configs
                .iter()
                .filter(|(_, c)| c.environment_group.as_ref().is_some_and(|g| g == target))
                .map(|(env, _)| env.clone()),
        );
    }
    if target_type != Some(TargetType::EnvironmentGroup) && envs.is_empty() {
        if let Some((env, _)) = configs.get_key_value(target) {
            envs.push(env.clone());
        }
    }
    if envs.is_empty() {
        return Err(SchemaError::UnknownTarget(target.to_owned()));
    }
    envs.sort();
    Ok(envs)
}
