//! Deploying a release to an environment, and the queue of deployments
//! waiting for locks to go away.

use crate::locks::LockedError;
use crate::release::CleanupOldApplicationVersions;
use crate::transformer::{DbRecord, Transformer, TransformerContext};
use crate::CoreError;
use railhead_schema::{
    AppName, CommitId, Deployment, EnvName, EnvironmentConfig, Event, Lock, LockBehaviour,
    LockId, SourceTrain, TeamName, Version,
};
use railhead_store::State;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployApplicationVersion {
    pub environment: EnvName,
    pub application: AppName,
    pub version: Version,
    #[serde(default)]
    pub lock_behaviour: LockBehaviour,
    #[serde(default)]
    pub write_commit_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_train: Option<SourceTrain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
    /// Release trains deploy without cleaning up old releases.
    #[serde(default)]
    pub skip_cleanup: bool,
}

/// Everything a deploy needs to know, read from one state snapshot.
///
/// Computing this is free of side effects, so release trains compute many of
/// them up front and apply them later.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployPrognosis {
    pub team: Option<TeamName>,
    pub environment_config: EnvironmentConfig,
    pub manifest: Option<Arc<[u8]>>,
    pub environment_locks: BTreeMap<LockId, Lock>,
    pub application_locks: BTreeMap<LockId, Lock>,
    pub team_locks: BTreeMap<LockId, Lock>,
    pub new_release_commit: Option<CommitId>,
    pub existing_version: Option<Version>,
    pub old_release_commit: Option<CommitId>,
}

impl DeployPrognosis {
    pub fn is_locked(&self) -> bool {
        !(self.environment_locks.is_empty()
            && self.application_locks.is_empty()
            && self.team_locks.is_empty())
    }

    /// Scope and message of the most significant blocking lock.
    fn first_lock(&self) -> Option<(&'static str, &str)> {
        [
            ("environment", &self.environment_locks),
            ("application", &self.application_locks),
            ("team", &self.team_locks),
        ]
        .into_iter()
        .find_map(|(kind, locks)| locks.values().next().map(|l| (kind, l.message.as_str())))
    }
}

impl DeployApplicationVersion {
    pub fn new(
        environment: impl Into<EnvName>,
        application: impl Into<AppName>,
        version: Version,
        lock_behaviour: LockBehaviour,
    ) -> Self {
        Self {
            environment: environment.into(),
            application: application.into(),
            version,
            lock_behaviour,
            write_commit_data: false,
            source_train: None,
            ci_link: None,
            skip_cleanup: false,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.environment.validate()?;
        self.application.validate()?;
        if self.version == 0 {
            return Err(CoreError::Validation("release versions start at 1".to_owned()));
        }
        Ok(())
    }

    pub fn prognosis(&self, state: &State) -> Result<DeployPrognosis, CoreError> {
        let env = &self.environment;
        let app = &self.application;
        let Some(environment_config) = state.environment_config(env)? else {
            return Err(CoreError::NotFound(format!("environment \"{env}\"")));
        };
        let Some(release) = state.release(app, self.version)? else {
            return Err(CoreError::NotFound(format!(
                "release {} of \"{app}\"",
                self.version
            )));
        };
        let team = state.team_owner(app)?;
        let team_locks = match &team {
            Some(team) => state.team_locks(env, team)?,
            None => BTreeMap::new(),
        };
        let existing_version = state.deployed_version(env, app)?;
        let old_release_commit = match existing_version {
            Some(v) => state.release(app, v)?.and_then(|r| r.source_commit_id),
            None => None,
        };
        Ok(DeployPrognosis {
            manifest: state.release_manifest(app, self.version, env),
            environment_locks: state.environment_locks(env)?,
            application_locks: state.application_locks(env, app)?,
            team_locks,
            team,
            environment_config,
            new_release_commit: release.source_commit_id,
            existing_version,
            old_release_commit,
        })
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let prognosis = self.prognosis(state)?;
        self.apply_prognosis(state, ctx, &prognosis)
    }

    pub fn apply_prognosis(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
        prognosis: &DeployPrognosis,
    ) -> Result<String, CoreError> {
        let env = &self.environment;
        let app = &self.application;
        ctx.permissions
            .check_deploy(&ctx.actor, prognosis.team.as_ref())?;

        if self.lock_behaviour != LockBehaviour::Ignore && prognosis.is_locked() {
            if self.write_commit_data {
                if let (Some((lock_type, lock_message)), Some(commit)) =
                    (prognosis.first_lock(), &prognosis.new_release_commit)
                {
                    ctx.record_event(
                        commit,
                        Event::LockPreventedDeployment {
                            application: app.clone(),
                            environment: env.clone(),
                            lock_message: lock_message.to_owned(),
                            lock_type: lock_type.to_owned(),
                        },
                    );
                }
            }
            match self.lock_behaviour {
                LockBehaviour::Queue => {
                    let queue = Transformer::QueueApplicationVersion(QueueApplicationVersion {
                        environment: env.clone(),
                        application: app.clone(),
                        version: self.version,
                    });
                    return ctx.execute(&queue, state);
                }
                _ => {
                    return Err(LockedError {
                        environment: env.clone(),
                        application: app.clone(),
                        environment_locks: prognosis.environment_locks.clone(),
                        application_locks: prognosis.application_locks.clone(),
                        team_locks: prognosis.team_locks.clone(),
                    }
                    .into());
                }
            }
        }

        let deployment = Deployment {
            version: self.version,
            deployed_by: ctx.actor.clone(),
            deployed_at: Some(ctx.now),
            ci_link: self.ci_link.clone(),
        };
        state.write_deployment(env, app, &deployment, prognosis.manifest.clone());
        state.delete_queued_version(env, app);
        ctx.record(DbRecord::Deployment {
            environment: env.clone(),
            application: app.clone(),
            deployment,
        });

        let mut message = format!("deployed version {} of \"{app}\" to \"{env}\"", self.version);
        if !self.skip_cleanup {
            let cleanup = Transformer::CleanupOldApplicationVersions(CleanupOldApplicationVersions {
                application: app.clone(),
            });
            let removed = ctx.execute(&cleanup, state)?;
            if !removed.is_empty() {
                message.push('\n');
                message.push_str(&removed);
            }
        }

        if self.write_commit_data {
            self.record_deployment_events(ctx, prognosis);
        }
        Ok(message)
    }

    fn record_deployment_events(&self, ctx: &mut TransformerContext<'_>, prognosis: &DeployPrognosis) {
        let Some(new_commit) = &prognosis.new_release_commit else {
            warn!(
                "release {} of {} has no source commit, not recording deployment event",
                self.version, self.application
            );
            return;
        };
        ctx.record_event(
            new_commit,
            Event::Deployment {
                application: self.application.clone(),
                environment: self.environment.clone(),
                source_train_environment_group: self
                    .source_train
                    .as_ref()
                    .and_then(|t| t.target_group.clone()),
                source_train_upstream: self.source_train.as_ref().map(|t| t.upstream.clone()),
            },
        );
        if prognosis.existing_version.is_none() {
            return;
        }
        match &prognosis.old_release_commit {
            Some(old_commit) => ctx.record_event(
                old_commit,
                Event::ReplacedBy {
                    application: self.application.clone(),
                    environment: self.environment.clone(),
                    commit_id: new_commit.clone(),
                },
            ),
            None => debug!(
                "replaced release of {} has no source commit, skipping replaced-by event",
                self.application
            ),
        }
    }
}

/// Remember a version to deploy once the locks blocking it are gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueApplicationVersion {
    pub environment: EnvName,
    pub application: AppName,
    pub version: Version,
}

impl QueueApplicationVersion {
    pub fn transform(&self, state: &mut State) -> String {
        state.set_queued_version(&self.environment, &self.application, self.version);
        format!(
            "Queued version {} of app \"{}\" in env \"{}\"",
            self.version, self.application, self.environment
        )
    }
}

/// Deploy the version queued for `(env, app)` if nothing blocks it any more.
///
/// Returns the message of whatever happened, or `None` when there was no
/// queued version or it is still blocked.
pub(crate) fn process_queue(
    state: &mut State,
    ctx: &mut TransformerContext<'_>,
    env: &EnvName,
    app: &AppName,
) -> Result<Option<String>, CoreError> {
    let Some(queued) = state.queued_version(env, app)? else {
        return Ok(None);
    };
    if state.deployed_version(env, app)? == Some(queued) {
        state.delete_queued_version(env, app);
        return Ok(Some(format!(
            "deleted queued version {queued} because it was already deployed. app=\"{app}\" env=\"{env}\""
        )));
    }
    if !state.release_exists(app, queued) {
        state.delete_queued_version(env, app);
        return Ok(Some(format!(
            "deleted queued version {queued} of app \"{app}\" in env \"{env}\" because the release no longer exists"
        )));
    }

    let deploy = DeployApplicationVersion {
        write_commit_data: ctx.settings.write_commit_data,
        ..DeployApplicationVersion::new(env.clone(), app.clone(), queued, LockBehaviour::Fail)
    };
    let prognosis = deploy.prognosis(state)?;
    if prognosis.is_locked() {
        debug!("queued version {queued} of {app} in {env} is still blocked");
        return Ok(None);
    }
    if !ctx.permissions.may_deploy(&ctx.actor, prognosis.team.as_ref()) {
        info!("{} may not deploy queued version {queued} of {app}, leaving it queued", ctx.actor.email);
        return Ok(None);
    }
    let message = ctx.nested(|ctx| deploy.apply_prognosis(state, ctx, &prognosis))?;
    info!("deployed queued version {queued} of {app} to {env}");
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformerSettings;
    use crate::permissions::Permissions;
    use chrono::{TimeZone, Utc};
    use railhead_schema::{Actor, Release};

    fn actor() -> Actor {
        Actor::new("test", "test@example.com")
    }

    fn lock(message: &str) -> Lock {
        Lock {
            message: message.to_owned(),
            created_by: actor(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            ci_link: None,
            suggested_lifetime: None,
        }
    }

    fn fixture() -> State {
        let mut state = State::default();
        state
            .write_environment_config(&EnvName::new("dev"), &EnvironmentConfig::upstream_latest())
            .unwrap();
        let mut manifests = BTreeMap::new();
        manifests.insert(EnvName::new("dev"), "m1".to_owned());
        for v in 1..=2 {
            state.write_release(
                &AppName::new("foo"),
                &Release {
                    version: v,
                    source_commit_id: Some(CommitId::new(format!("{v:040}"))),
                    source_author: String::new(),
                    source_message: String::new(),
                    display_version: String::new(),
                    created_at: None,
                    undeploy: false,
                },
                &manifests,
            );
        }
        state
    }

    fn run(
        state: &mut State,
        deploy: &DeployApplicationVersion,
        settings: &TransformerSettings,
    ) -> (Result<String, CoreError>, Vec<crate::CommitEvent>) {
        let permissions = Permissions::allow_all();
        let mut ctx = TransformerContext::new(actor(), Utc::now(), settings, &permissions);
        let result = deploy.transform(state, &mut ctx);
        (result, ctx.events().to_vec())
    }

    #[test]
    fn deploy_writes_pointer_and_manifest() {
        let mut state = fixture();
        let deploy = DeployApplicationVersion::new("dev", "foo", 2, LockBehaviour::Fail);
        let (result, _) = run(&mut state, &deploy, &TransformerSettings::default());
        assert_eq!(result.unwrap(), "deployed version 2 of \"foo\" to \"dev\"");

        let dev = EnvName::new("dev");
        let foo = AppName::new("foo");
        assert_eq!(state.deployed_version(&dev, &foo).unwrap(), Some(2));
        let deployment = state.deployment(&dev, &foo).unwrap().unwrap();
        assert_eq!(deployment.deployed_by, actor());
        assert_eq!(
            state
                .tree()
                .read("environments/dev/applications/foo/manifests/manifests.yaml"),
            Some(b"m1".as_slice())
        );
    }

    #[test]
    fn missing_release_is_not_found() {
        let mut state = fixture();
        let deploy = DeployApplicationVersion::new("dev", "foo", 9, LockBehaviour::Fail);
        let (result, _) = run(&mut state, &deploy, &TransformerSettings::default());
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[test]
    fn fail_behaviour_lists_every_blocking_lock() {
        let mut state = fixture();
        let dev = EnvName::new("dev");
        let foo = AppName::new("foo");
        state
            .write_environment_lock(&dev, &LockId::new("env-freeze"), &lock("env"))
            .unwrap();
        state
            .write_application_lock(&dev, &foo, &LockId::new("app-freeze"), &lock("app"))
            .unwrap();

        let deploy = DeployApplicationVersion::new("dev", "foo", 1, LockBehaviour::Fail);
        let (result, _) = run(&mut state, &deploy, &TransformerSettings::default());
        let err = result.unwrap_err();
        let locked = err.as_locked().unwrap();
        assert_eq!(locked.environment_locks.len(), 1);
        assert_eq!(locked.application_locks.len(), 1);
        assert!(locked.team_locks.is_empty());
        assert_eq!(state.deployed_version(&dev, &foo).unwrap(), None);
    }

    #[test]
    fn queue_behaviour_records_pending_version() {
        let mut state = fixture();
        let dev = EnvName::new("dev");
        let foo = AppName::new("foo");
        let settings = TransformerSettings::default();
        run(
            &mut state,
            &DeployApplicationVersion::new("dev", "foo", 1, LockBehaviour::Fail),
            &settings,
        )
        .0
        .unwrap();
        state
            .write_environment_lock(&dev, &LockId::new("freeze"), &lock("hold"))
            .unwrap();

        let deploy = DeployApplicationVersion::new("dev", "foo", 2, LockBehaviour::Queue);
        let (result, _) = run(&mut state, &deploy, &settings);
        assert_eq!(result.unwrap(), "Queued version 2 of app \"foo\" in env \"dev\"");
        assert_eq!(state.deployed_version(&dev, &foo).unwrap(), Some(1));
        assert_eq!(state.queued_version(&dev, &foo).unwrap(), Some(2));
    }

    #[test]
    fn ignore_behaviour_deploys_through_locks() {
        let mut state = fixture();
        let dev = EnvName::new("dev");
        state
            .write_environment_lock(&dev, &LockId::new("freeze"), &lock("hold"))
            .unwrap();
        let deploy = DeployApplicationVersion::new("dev", "foo", 1, LockBehaviour::Ignore);
        let (result, _) = run(&mut state, &deploy, &TransformerSettings::default());
        assert!(result.is_ok());
        assert_eq!(
            state.deployed_version(&dev, &AppName::new("foo")).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn commit_data_events() {
        let mut state = fixture();
        let settings = TransformerSettings {
            write_commit_data: true,
            ..TransformerSettings::default()
        };
        let mut deploy = DeployApplicationVersion::new("dev", "foo", 1, LockBehaviour::Fail);
        deploy.write_commit_data = true;
        let (_, events) = run(&mut state, &deploy, &settings);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].event, Event::Deployment { .. }));

        deploy.version = 2;
        let (_, events) = run(&mut state, &deploy, &settings);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].commit, CommitId::new(format!("{:040}", 1)));
        assert!(matches!(events[1].event, Event::ReplacedBy { .. }));
    }

    #[test]
    fn lock_prevented_event_names_environment_lock_first() {
        let mut state = fixture();
        let dev = EnvName::new("dev");
        state
            .write_environment_lock(&dev, &LockId::new("b"), &lock("env lock"))
            .unwrap();
        state
            .write_application_lock(&dev, &AppName::new("foo"), &LockId::new("a"), &lock("app lock"))
            .unwrap();
        let mut deploy = DeployApplicationVersion::new("dev", "foo", 1, LockBehaviour::Queue);
        deploy.write_commit_data = true;
        let (_, events) = run(&mut state, &deploy, &TransformerSettings::default());
        match &events[0].event {
            Event::LockPreventedDeployment {
                lock_type,
                lock_message,
                ..
            } => {
                assert_eq!(lock_type, "environment");
                assert_eq!(lock_message, "env lock");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
