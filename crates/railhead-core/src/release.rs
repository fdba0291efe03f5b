//! Creating releases and cleaning up the ones nobody can deploy any more.

use crate::deploy::DeployApplicationVersion;
use crate::transformer::{DbRecord, Transformer, TransformerContext};
use crate::CoreError;
use railhead_schema::{
    AppName, CommitId, EnvName, Event, LockBehaviour, Release, TeamName, Version,
};
use railhead_store::State;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApplicationVersion {
    pub application: AppName,
    /// Explicit version; the next free one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    pub manifests: BTreeMap<EnvName, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_commit_id: Option<CommitId>,
    #[serde(default)]
    pub source_author: String,
    #[serde(default)]
    pub source_message: String,
    #[serde(default)]
    pub display_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamName>,
    #[serde(default)]
    pub write_commit_data: bool,
}

impl CreateApplicationVersion {
    pub fn new(application: impl Into<AppName>, manifests: BTreeMap<EnvName, String>) -> Self {
        Self {
            application: application.into(),
            version: None,
            manifests,
            source_commit_id: None,
            source_author: String::new(),
            source_message: String::new(),
            display_version: String::new(),
            team: None,
            write_commit_data: false,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.application.validate()?;
        if self.version == Some(0) {
            return Err(CoreError::Validation("release versions start at 1".to_owned()));
        }
        for env in self.manifests.keys() {
            env.validate()?;
        }
        if let Some(team) = &self.team {
            team.validate()?;
        }
        if let Some(commit) = &self.source_commit_id {
            commit.validate()?;
        }
        Ok(())
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let app = &self.application;
        let latest = state.latest_release(app)?;
        let version = match self.version {
            Some(v) if state.release_exists(app, v) => {
                return Err(CoreError::AlreadyExists(format!("release {v} of \"{app}\"")));
            }
            Some(v) => v,
            None => latest.map_or(1, |l| l + 1),
        };
        let is_latest = latest.map_or(true, |l| version > l);
        if !is_latest {
            let kept = ctx.settings.kept_versions_on_cleanup;
            if old_versions_with(state, app, kept, Some(version))?.contains(&version) {
                return Err(CoreError::Validation(format!(
                    "version {version} of \"{app}\" is too old and would be removed by cleanup"
                )));
            }
        }
        for env in self.manifests.keys() {
            if !state.environment_exists(env) {
                return Err(CoreError::NotFound(format!("environment \"{env}\"")));
            }
        }

        let release = Release {
            version,
            source_commit_id: self.source_commit_id.clone(),
            source_author: self.source_author.clone(),
            source_message: self.source_message.clone(),
            display_version: self.display_version.clone(),
            created_at: Some(ctx.now),
            undeploy: false,
        };
        state.write_release(app, &release, &self.manifests);
        if let Some(team) = &self.team {
            state.set_team_owner(app, team);
        }
        if self.write_commit_data {
            if let Some(commit) = &release.source_commit_id {
                ctx.record_event(
                    commit,
                    Event::NewRelease {
                        environments: self.manifests.keys().cloned().collect(),
                    },
                );
            }
        }
        ctx.record(DbRecord::Release {
            application: app.clone(),
            release,
            deleted: false,
        });
        info!("created version {version} of {app}");

        let mut message = format!("created version {version} of \"{app}\"");
        if is_latest {
            let envs: Vec<EnvName> = self.manifests.keys().cloned().collect();
            deploy_to_latest_environments(
                state,
                ctx,
                app,
                version,
                &envs,
                self.write_commit_data,
                &mut message,
            )?;
        }
        Ok(message)
    }
}

/// Deploy a fresh latest release to every listed environment promoting from "latest".
fn deploy_to_latest_environments(
    state: &mut State,
    ctx: &mut TransformerContext<'_>,
    app: &AppName,
    version: Version,
    envs: &[EnvName],
    write_commit_data: bool,
    message: &mut String,
) -> Result<(), CoreError> {
    for env in envs {
        let Some(config) = state.environment_config(env)? else {
            continue;
        };
        if !config.is_upstream_latest() {
            continue;
        }
        let deploy = Transformer::DeployApplicationVersion(DeployApplicationVersion {
            write_commit_data,
            ..DeployApplicationVersion::new(env.clone(), app.clone(), version, LockBehaviour::Queue)
        });
        match ctx.execute(&deploy, state) {
            Ok(msg) => {
                message.push('\n');
                message.push_str(&msg);
            }
            Err(CoreError::Locked(locked)) => {
                debug!("not auto-deploying {app} to {env}: {locked}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// A release marking an application for removal from its environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUndeployApplicationVersion {
    pub application: AppName,
    #[serde(default)]
    pub write_commit_data: bool,
}

impl CreateUndeployApplicationVersion {
    pub fn new(application: impl Into<AppName>) -> Self {
        Self {
            application: application.into(),
            write_commit_data: false,
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let app = &self.application;
        let Some(latest) = state.latest_release(app)? else {
            return Err(CoreError::NotFound(format!("application \"{app}\" has no releases")));
        };
        let version = latest + 1;
        let manifests: BTreeMap<EnvName, String> = state
            .release_manifests(app, latest)
            .into_keys()
            .map(|env| (env, String::new()))
            .collect();
        let release = Release {
            version,
            source_commit_id: None,
            source_author: String::new(),
            source_message: String::new(),
            display_version: String::new(),
            created_at: Some(ctx.now),
            undeploy: true,
        };
        state.write_release(app, &release, &manifests);
        ctx.record(DbRecord::Release {
            application: app.clone(),
            release,
            deleted: false,
        });

        let mut message = format!("created undeploy-version {version} of \"{app}\"");
        let envs: Vec<EnvName> = manifests.into_keys().collect();
        deploy_to_latest_environments(
            state,
            ctx,
            app,
            version,
            &envs,
            self.write_commit_data,
            &mut message,
        )?;
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOldApplicationVersions {
    pub application: AppName,
}

impl CleanupOldApplicationVersions {
    pub fn new(application: impl Into<AppName>) -> Self {
        Self {
            application: application.into(),
        }
    }

    /// Returns one line per removed release, or an empty string.
    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let app = &self.application;
        let old = find_old_application_versions(state, app, ctx.settings.kept_versions_on_cleanup)?;
        let mut lines = Vec::with_capacity(old.len());
        for version in old {
            let Some(release) = state.release(app, version)? else {
                continue;
            };
            state.delete_release(app, version);
            ctx.record(DbRecord::Release {
                application: app.clone(),
                release,
                deleted: true,
            });
            lines.push(format!("removed version {version} of app \"{app}\" as cleanup"));
        }
        if !lines.is_empty() {
            debug!("cleaned up {} releases of {app}", lines.len());
        }
        Ok(lines.join("\n"))
    }
}

/// Releases of `app` that fall outside the retention window.
///
/// The window starts at the oldest version deployed anywhere (or the latest
/// release when nothing is deployed) and reaches `kept` releases back,
/// counting that version itself.
pub fn find_old_application_versions(
    state: &State,
    app: &AppName,
    kept: usize,
) -> Result<Vec<Version>, CoreError> {
    old_versions_with(state, app, kept, None)
}

fn old_versions_with(
    state: &State,
    app: &AppName,
    kept: usize,
    extra: Option<Version>,
) -> Result<Vec<Version>, CoreError> {
    let mut versions = state.release_versions(app)?;
    if let Some(extra) = extra {
        if let Err(pos) = versions.binary_search(&extra) {
            versions.insert(pos, extra);
        }
    }
    let Some(&latest) = versions.last() else {
        return Ok(Vec::new());
    };
    let mut oldest_deployed = latest;
    for env in state.environment_names() {
        if let Some(v) = state.deployed_version(&env, app)? {
            oldest_deployed = oldest_deployed.min(v);
        }
    }
    let pos = versions.partition_point(|&v| v < oldest_deployed);
    if pos < kept {
        return Ok(Vec::new());
    }
    Ok(versions[..=pos - kept].to_vec())
}
