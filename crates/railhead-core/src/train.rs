//! Release trains: promote whatever each environment's upstream holds.
//!
//! A train runs in two phases. The prognosis reads one state snapshot and
//! decides, per environment and per application, what to deploy or why to
//! skip it. Applying a prognosis then issues the deploys. Prognoses only read,
//! so for environment groups they can be computed on a bounded worker pool
//! while the apply phase stays sequential and in environment name order.

use crate::deploy::{DeployApplicationVersion, DeployPrognosis};
use crate::permissions::Permissions;
use crate::transformer::TransformerContext;
use crate::CoreError;
use railhead_schema::{
    resolve_train_targets, validate_env_name, Actor, AppName, CommitId, EnvGroupName, EnvName,
    EnvironmentConfig, Event, Lock, LockBehaviour, LockId, SourceTrain, TargetType, TeamName,
    UpstreamProblem, UpstreamSource, Version,
};
use railhead_store::State;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use tracing::{debug, info, warn};

/// A pinned version may lag the current latest release by at most this many versions.
const MAX_PINNED_VERSION_AGE: Version = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvSkipCause {
    EnvHasNoUpstream,
    EnvHasNoUpstreamLatestOrUpstreamEnv,
    EnvHasBothUpstreamLatestAndUpstreamEnv,
    UpstreamEnvConfigNotFound,
    EnvIsLocked,
}

impl EnvSkipCause {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvSkipCause::EnvHasNoUpstream => "ENV_HAS_NO_UPSTREAM",
            EnvSkipCause::EnvHasNoUpstreamLatestOrUpstreamEnv => {
                "ENV_HAS_NO_UPSTREAM_LATEST_OR_UPSTREAM_ENV"
            }
            EnvSkipCause::EnvHasBothUpstreamLatestAndUpstreamEnv => {
                "ENV_HAS_BOTH_UPSTREAM_LATEST_AND_UPSTREAM_ENV"
            }
            EnvSkipCause::UpstreamEnvConfigNotFound => "UPSTREAM_ENV_CONFIG_NOT_FOUND",
            EnvSkipCause::EnvIsLocked => "ENV_IS_LOCKED",
        }
    }
}

impl fmt::Display for EnvSkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<UpstreamProblem> for EnvSkipCause {
    fn from(problem: UpstreamProblem) -> Self {
        match problem {
            UpstreamProblem::NoUpstream => EnvSkipCause::EnvHasNoUpstream,
            UpstreamProblem::NeitherLatestNorEnvironment => {
                EnvSkipCause::EnvHasNoUpstreamLatestOrUpstreamEnv
            }
            UpstreamProblem::BothLatestAndEnvironment => {
                EnvSkipCause::EnvHasBothUpstreamLatestAndUpstreamEnv
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppSkipCause {
    AppHasNoVersionInUpstreamEnv,
    AppAlreadyInUpstreamVersion,
    AppIsLocked,
    AppDoesNotExistInEnv,
    TeamIsLocked,
    NoTeamPermission,
    AppWithoutTeam,
}

impl AppSkipCause {
    pub fn as_str(self) -> &'static str {
        match self {
            AppSkipCause::AppHasNoVersionInUpstreamEnv => "APP_HAS_NO_VERSION_IN_UPSTREAM_ENV",
            AppSkipCause::AppAlreadyInUpstreamVersion => "APP_ALREADY_IN_UPSTREAM_VERSION",
            AppSkipCause::AppIsLocked => "APP_IS_LOCKED",
            AppSkipCause::AppDoesNotExistInEnv => "APP_DOES_NOT_EXIST_IN_ENV",
            AppSkipCause::TeamIsLocked => "TEAM_IS_LOCKED",
            AppSkipCause::NoTeamPermission => "NO_TEAM_PERMISSION",
            AppSkipCause::AppWithoutTeam => "APP_WITHOUT_TEAM",
        }
    }
}

impl fmt::Display for AppSkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the train will do with one application in one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppPrognosis {
    /// Version to deploy, or the version already in place for
    /// [`AppSkipCause::AppAlreadyInUpstreamVersion`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<AppSkipCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamName>,
    /// Application or team locks behind the skip.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub locks: BTreeMap<LockId, Lock>,
    #[serde(skip)]
    pub new_release_commit: Option<CommitId>,
    #[serde(skip)]
    pub deploy: Option<DeployPrognosis>,
}

impl AppPrognosis {
    fn skipped(cause: AppSkipCause, commit: Option<CommitId>) -> Self {
        Self {
            skip_cause: Some(cause),
            new_release_commit: commit,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvPrognosis {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<EnvSkipCause>,
    /// `latest` or the upstream environment name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<EnvName>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_locks: BTreeMap<LockId, Lock>,
    pub apps: BTreeMap<AppName, AppPrognosis>,
}

impl EnvPrognosis {
    fn skipped(cause: EnvSkipCause) -> Self {
        Self {
            skip_cause: Some(cause),
            ..Self::default()
        }
    }

    /// Applications that would be deployed, with their versions.
    pub fn deployments(&self) -> impl Iterator<Item = (&AppName, Version)> {
        self.apps
            .iter()
            .filter(|(_, p)| p.skip_cause.is_none())
            .filter_map(|(app, p)| p.version.map(|v| (app, v)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReleaseTrainPrognosis {
    pub target: String,
    pub environments: BTreeMap<EnvName, EnvPrognosis>,
}

/// Read-only inputs shared by every environment of one train.
struct TrainInputs<'a> {
    configs: BTreeMap<EnvName, EnvironmentConfig>,
    actor: &'a Actor,
    permissions: &'a Permissions,
    /// State at the pinned commit, if the train is pinned.
    pinned: Option<State>,
}

impl<'a> TrainInputs<'a> {
    fn load(
        state: &State,
        ctx: &'a TransformerContext<'_>,
        commit_hash: Option<&CommitId>,
    ) -> Result<Self, CoreError> {
        let pinned = match commit_hash {
            Some(commit) => {
                let history = ctx.history.ok_or_else(|| {
                    CoreError::Validation(
                        "release trains pinned to a commit need repository history".to_owned(),
                    )
                })?;
                Some(history.state_at(commit)?)
            }
            None => None,
        };
        Ok(Self {
            configs: state.environment_configs()?,
            actor: &ctx.actor,
            permissions: ctx.permissions,
            pinned,
        })
    }
}

/// Promote into one environment or into every environment of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTrain {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<TargetType>,
    /// Only promote applications owned by this team.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<CommitId>,
    #[serde(default)]
    pub write_commit_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
}

impl ReleaseTrain {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            target_type: None,
            team: None,
            commit_hash: None,
            write_commit_data: false,
            ci_link: None,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_env_name(&self.target)?;
        if let Some(team) = &self.team {
            team.validate()?;
        }
        if let Some(commit) = &self.commit_hash {
            commit.validate()?;
        }
        Ok(())
    }

    fn env_trains(
        &self,
        configs: &BTreeMap<EnvName, EnvironmentConfig>,
    ) -> Result<Vec<EnvReleaseTrain>, CoreError> {
        let envs = resolve_train_targets(configs, &self.target, self.target_type)?;
        let is_group = self.target_type != Some(TargetType::Environment)
            && configs.values().any(|c| {
                c.environment_group
                    .as_ref()
                    .is_some_and(|g| *g == self.target)
            });
        let train_group = is_group.then(|| EnvGroupName::new(self.target.as_str()));
        Ok(envs
            .into_iter()
            .map(|environment| EnvReleaseTrain {
                environment,
                train_group: train_group.clone(),
                team: self.team.clone(),
                commit_hash: self.commit_hash.clone(),
                write_commit_data: self.write_commit_data,
                ci_link: self.ci_link.clone(),
            })
            .collect())
    }

    /// Compute what the train would do, without changing anything.
    pub fn prognosis(
        &self,
        state: &State,
        ctx: &TransformerContext<'_>,
    ) -> Result<ReleaseTrainPrognosis, CoreError> {
        let inputs = TrainInputs::load(state, ctx, self.commit_hash.as_ref())?;
        let trains = self.env_trains(&inputs.configs)?;
        let results = compute_prognoses(&trains, state, &inputs, ctx.settings);
        let mut environments = BTreeMap::new();
        for (train, result) in trains.into_iter().zip(results) {
            environments.insert(train.environment, result?);
        }
        Ok(ReleaseTrainPrognosis {
            target: self.target.clone(),
            environments,
        })
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let mut message = format!(
            "Release Train to environment/environment group '{}':",
            self.target
        );
        let blocks = if ctx.settings.parallel_prognosis {
            self.run_parallel(state, ctx)?
        } else {
            self.run_sequential(state, ctx)?
        };
        for block in blocks {
            message.push_str("\n\n");
            message.push_str(&block);
        }
        Ok(message)
    }

    /// Prognosis and apply per environment, one environment after another.
    fn run_sequential(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<Vec<String>, CoreError> {
        let trains = self.env_trains(&state.environment_configs()?)?;
        let mut blocks = Vec::with_capacity(trains.len());
        for train in trains {
            blocks.push(ctx.nested(|ctx| train.transform(state, ctx))?);
        }
        Ok(blocks)
    }

    /// All prognoses against the starting state on a worker pool, then every
    /// apply in environment order.
    fn run_parallel(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<Vec<String>, CoreError> {
        let (trains, prognoses) = {
            let inputs = TrainInputs::load(state, ctx, self.commit_hash.as_ref())?;
            let trains = self.env_trains(&inputs.configs)?;
            let prognoses = compute_prognoses(&trains, state, &inputs, ctx.settings)
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            (trains, prognoses)
        };
        let mut blocks = Vec::with_capacity(trains.len());
        for (train, prognosis) in trains.iter().zip(&prognoses) {
            blocks.push(ctx.nested(|ctx| train.apply_prognosis(state, ctx, prognosis))?);
        }
        Ok(blocks)
    }
}

/// Environment prognoses in the order of `trains`, computed on up to
/// `max_threads` workers when parallel prognosis is enabled.
fn compute_prognoses(
    trains: &[EnvReleaseTrain],
    state: &State,
    inputs: &TrainInputs<'_>,
    settings: &crate::config::TransformerSettings,
) -> Vec<Result<EnvPrognosis, CoreError>> {
    let workers = settings.max_threads.max(1).min(trains.len());
    if !settings.parallel_prognosis || workers <= 1 {
        return trains.iter().map(|t| t.prognosis(state, inputs)).collect();
    }
    debug!("computing {} environment prognoses on {workers} threads", trains.len());
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::sync_channel(trains.len());
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                let Some(train) = trains.get(i) else {
                    break;
                };
                if tx.send((i, train.prognosis(state, inputs))).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);
    let mut by_index: BTreeMap<usize, Result<EnvPrognosis, CoreError>> = rx.into_iter().collect();
    (0..trains.len())
        .map(|i| {
            by_index
                .remove(&i)
                .unwrap_or_else(|| Err(worker_stopped(&trains[i].environment)))
        })
        .collect()
}

/// A worker ended without reporting on `env`.
fn worker_stopped(env: &EnvName) -> CoreError {
    CoreError::Io(std::io::Error::other(format!(
        "prognosis worker for environment \"{env}\" stopped"
    )))
}

/// The part of a release train targeting a single environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvReleaseTrain {
    pub environment: EnvName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_group: Option<EnvGroupName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<TeamName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<CommitId>,
    #[serde(default)]
    pub write_commit_data: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
}

impl EnvReleaseTrain {
    pub fn new(environment: impl Into<EnvName>) -> Self {
        Self {
            environment: environment.into(),
            train_group: None,
            team: None,
            commit_hash: None,
            write_commit_data: false,
            ci_link: None,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.environment.validate()?;
        if let Some(group) = &self.train_group {
            group.validate()?;
        }
        if let Some(team) = &self.team {
            team.validate()?;
        }
        if let Some(commit) = &self.commit_hash {
            commit.validate()?;
        }
        Ok(())
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let prognosis = {
            let inputs = TrainInputs::load(state, ctx, self.commit_hash.as_ref())?;
            self.prognosis(state, &inputs)?
        };
        self.apply_prognosis(state, ctx, &prognosis)
    }

    fn prognosis(&self, state: &State, inputs: &TrainInputs<'_>) -> Result<EnvPrognosis, CoreError> {
        let env = &self.environment;
        let Some(config) = inputs.configs.get(env) else {
            return Err(CoreError::NotFound(format!("environment \"{env}\"")));
        };
        let upstream = match config.upstream_source() {
            Ok(upstream) => upstream,
            Err(problem) => return Ok(EnvPrognosis::skipped(problem.into())),
        };
        let (source, upstream_env) = match &upstream {
            UpstreamSource::Latest => ("latest".to_owned(), None),
            UpstreamSource::Environment(up) => {
                if !inputs.configs.contains_key(up) {
                    return Ok(EnvPrognosis {
                        upstream: Some(up.clone()),
                        ..EnvPrognosis::skipped(EnvSkipCause::UpstreamEnvConfigNotFound)
                    });
                }
                (up.to_string(), Some(up.clone()))
            }
        };

        let environment_locks = state.environment_locks(env)?;
        let (apps, pinned_versions) = self.candidate_apps(state, inputs, &upstream)?;

        if !environment_locks.is_empty() {
            let mut locked = BTreeMap::new();
            for app in apps {
                let commit = latest_release_commit(state, &app)?;
                locked.insert(
                    app,
                    AppPrognosis {
                        new_release_commit: commit,
                        ..AppPrognosis::default()
                    },
                );
            }
            info!("environment {env} is locked, release train skips it");
            return Ok(EnvPrognosis {
                skip_cause: Some(EnvSkipCause::EnvIsLocked),
                source,
                upstream: upstream_env,
                environment_locks,
                apps: locked,
            });
        }

        let mut prognoses = BTreeMap::new();
        for app in apps {
            let commit = latest_release_commit(state, &app)?;
            let team = state.team_owner(&app)?;
            if let Some(filter) = &self.team {
                match &team {
                    None => {
                        prognoses.insert(app, AppPrognosis::skipped(AppSkipCause::AppWithoutTeam, commit));
                        continue;
                    }
                    Some(owner) if owner != filter => continue,
                    Some(_) => {}
                }
            }

            let version = match (&pinned_versions, &upstream) {
                (Some(pinned), _) => match pinned.get(&app) {
                    Some(v) => *v,
                    None => continue,
                },
                (None, UpstreamSource::Latest) => match state.latest_release(&app)? {
                    Some(v) => v,
                    None => {
                        warn!("{app} has no releases, release train to {env} skips it");
                        continue;
                    }
                },
                (None, UpstreamSource::Environment(up)) => match state.deployed_version(up, &app)? {
                    Some(v) => v,
                    None => {
                        prognoses.insert(
                            app,
                            AppPrognosis::skipped(AppSkipCause::AppHasNoVersionInUpstreamEnv, commit),
                        );
                        continue;
                    }
                },
            };

            if state.deployed_version(env, &app)? == Some(version) {
                prognoses.insert(
                    app,
                    AppPrognosis {
                        version: Some(version),
                        ..AppPrognosis::skipped(AppSkipCause::AppAlreadyInUpstreamVersion, commit)
                    },
                );
                continue;
            }

            let application_locks = state.application_locks(env, &app)?;
            if !application_locks.is_empty() {
                prognoses.insert(
                    app,
                    AppPrognosis {
                        locks: application_locks,
                        ..AppPrognosis::skipped(AppSkipCause::AppIsLocked, commit)
                    },
                );
                continue;
            }

            if !state.release_exists(&app, version) {
                return Err(CoreError::NotFound(format!(
                    "release {version} of \"{app}\" needed by the release train to \"{env}\""
                )));
            }
            if state.release_manifest(&app, version, env).is_none() {
                prognoses.insert(app, AppPrognosis::skipped(AppSkipCause::AppDoesNotExistInEnv, commit));
                continue;
            }

            if let Some(owner) = &team {
                if !inputs.permissions.may_deploy(inputs.actor, Some(owner)) {
                    prognoses.insert(
                        app,
                        AppPrognosis {
                            team: team.clone(),
                            ..AppPrognosis::skipped(AppSkipCause::NoTeamPermission, commit)
                        },
                    );
                    continue;
                }
                let team_locks = state.team_locks(env, owner)?;
                if !team_locks.is_empty() {
                    prognoses.insert(
                        app,
                        AppPrognosis {
                            team: team.clone(),
                            locks: team_locks,
                            ..AppPrognosis::skipped(AppSkipCause::TeamIsLocked, commit)
                        },
                    );
                    continue;
                }
            }

            let deploy = self
                .deploy_for(&app, version, upstream_env.as_ref())
                .prognosis(state)?;
            prognoses.insert(
                app,
                AppPrognosis {
                    version: Some(version),
                    skip_cause: None,
                    team,
                    locks: BTreeMap::new(),
                    new_release_commit: commit,
                    deploy: Some(deploy),
                },
            );
        }

        Ok(EnvPrognosis {
            skip_cause: None,
            source,
            upstream: upstream_env,
            environment_locks,
            apps: prognoses,
        })
    }

    /// Applications the train considers, plus the pinned versions when the
    /// train is pinned to a commit.
    fn candidate_apps(
        &self,
        state: &State,
        inputs: &TrainInputs<'_>,
        upstream: &UpstreamSource,
    ) -> Result<(Vec<AppName>, Option<BTreeMap<AppName, Version>>), CoreError> {
        let Some(pinned) = &inputs.pinned else {
            let apps = match upstream {
                UpstreamSource::Latest => state.environment_applications(&self.environment),
                UpstreamSource::Environment(up) => state.environment_applications(up),
            };
            return Ok((apps, None));
        };

        let mut versions = BTreeMap::new();
        match upstream {
            UpstreamSource::Latest => {
                for app in pinned.applications() {
                    if let Some(v) = pinned.latest_release(&app)? {
                        versions.insert(app, v);
                    }
                }
            }
            UpstreamSource::Environment(up) => {
                for app in pinned.environment_applications(up) {
                    if let Some(v) = pinned.deployed_version(up, &app)? {
                        versions.insert(app, v);
                    }
                }
            }
        }
        for (app, version) in &versions {
            let latest = state.latest_release(app)?.unwrap_or(*version);
            if latest.saturating_sub(*version) > MAX_PINNED_VERSION_AGE {
                return Err(CoreError::Validation(format!(
                    "version {version} of \"{app}\" at the pinned commit is more than \
                     {MAX_PINNED_VERSION_AGE} versions behind the latest release {latest}"
                )));
            }
        }
        Ok((versions.keys().cloned().collect(), Some(versions)))
    }

    fn deploy_for(
        &self,
        app: &AppName,
        version: Version,
        upstream: Option<&EnvName>,
    ) -> DeployApplicationVersion {
        DeployApplicationVersion {
            write_commit_data: self.write_commit_data,
            source_train: Some(SourceTrain {
                target_group: self.train_group.clone(),
                upstream: upstream.cloned().unwrap_or_else(|| EnvName::new("latest")),
            }),
            ci_link: self.ci_link.clone(),
            skip_cleanup: true,
            ..DeployApplicationVersion::new(
                self.environment.clone(),
                app.clone(),
                version,
                LockBehaviour::Queue,
            )
        }
    }

    pub fn apply_prognosis(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
        prognosis: &EnvPrognosis,
    ) -> Result<String, CoreError> {
        let env = &self.environment;
        if let Some(cause) = prognosis.skip_cause {
            if self.write_commit_data && cause == EnvSkipCause::EnvIsLocked {
                let lock_message = prognosis
                    .environment_locks
                    .values()
                    .next()
                    .map(|l| l.message.clone())
                    .unwrap_or_default();
                for (app, app_prognosis) in &prognosis.apps {
                    let Some(commit) = &app_prognosis.new_release_commit else {
                        continue;
                    };
                    ctx.record_event(
                        commit,
                        Event::LockPreventedDeployment {
                            application: app.clone(),
                            environment: env.clone(),
                            lock_message: lock_message.clone(),
                            lock_type: "environment".to_owned(),
                        },
                    );
                }
            }
            return Ok(self.env_skip_line(cause, prognosis));
        }

        let mut skipped = Vec::new();
        let mut deployed = 0usize;
        for (app, app_prognosis) in &prognosis.apps {
            if let Some(cause) = app_prognosis.skip_cause {
                skipped.push(self.app_skip_line(app, app_prognosis, cause, prognosis));
                continue;
            }
            let (Some(version), Some(deploy_prognosis)) =
                (app_prognosis.version, &app_prognosis.deploy)
            else {
                continue;
            };
            let deploy = self.deploy_for(app, version, prognosis.upstream.as_ref());
            ctx.nested(|ctx| deploy.apply_prognosis(state, ctx, deploy_prognosis))?;
            deployed += 1;
        }
        info!("release train deployed {deployed} applications to {env}");

        let team_info = self
            .team
            .as_ref()
            .map(|t| format!(" for team '{t}'"))
            .unwrap_or_default();
        let mut message = format!(
            "Release Train to '{env}' environment:\n\n\
             The release train deployed {deployed} services from '{}' to '{env}'{team_info}",
            prognosis.source
        );
        for line in skipped {
            message.push('\n');
            message.push_str(&line);
        }
        Ok(message)
    }

    fn env_skip_line(&self, cause: EnvSkipCause, prognosis: &EnvPrognosis) -> String {
        let env = &self.environment;
        match cause {
            EnvSkipCause::EnvHasNoUpstream => {
                format!("Environment \"{env}\" does not have upstream configured - skipping.")
            }
            EnvSkipCause::EnvHasNoUpstreamLatestOrUpstreamEnv => format!(
                "Environment \"{env}\" does not have upstream.latest or upstream.environment configured - skipping."
            ),
            EnvSkipCause::EnvHasBothUpstreamLatestAndUpstreamEnv => format!(
                "Environment \"{env}\" has both upstream.latest and upstream.environment configured - skipping."
            ),
            EnvSkipCause::UpstreamEnvConfigNotFound => format!(
                "Could not find environment config for upstream env \"{}\". Target env was \"{env}\"",
                prognosis.upstream.as_ref().map(EnvName::as_str).unwrap_or_default()
            ),
            EnvSkipCause::EnvIsLocked => {
                format!("Target Environment '{env}' is locked - skipping.")
            }
        }
    }

    fn app_skip_line(
        &self,
        app: &AppName,
        app_prognosis: &AppPrognosis,
        cause: AppSkipCause,
        prognosis: &EnvPrognosis,
    ) -> String {
        let env = &self.environment;
        let team = app_prognosis
            .team
            .as_ref()
            .map(TeamName::as_str)
            .unwrap_or_default();
        match cause {
            AppSkipCause::AppHasNoVersionInUpstreamEnv => format!(
                "skipping because there is no version for application \"{app}\" in env \"{}\"",
                prognosis.source
            ),
            AppSkipCause::AppAlreadyInUpstreamVersion => format!(
                "skipping \"{app}\" because it is already in the version {}",
                app_prognosis.version.unwrap_or_default()
            ),
            AppSkipCause::AppIsLocked => format!(
                "skipping application \"{app}\" in environment \"{env}\" due to application lock"
            ),
            AppSkipCause::AppDoesNotExistInEnv => format!(
                "skipping application \"{app}\" in environment \"{env}\" because it doesn't exist there"
            ),
            AppSkipCause::TeamIsLocked => format!(
                "skipping application \"{app}\" in environment \"{env}\" due to team lock on team \"{team}\""
            ),
            AppSkipCause::NoTeamPermission => format!(
                "skipping application \"{app}\" in environment \"{env}\" because the user team \"{team}\" is not the same as the application"
            ),
            AppSkipCause::AppWithoutTeam => format!(
                "skipping application \"{app}\" in environment \"{env}\" because it has no owning team"
            ),
        }
    }
}

fn latest_release_commit(state: &State, app: &AppName) -> Result<Option<CommitId>, CoreError> {
    let Some(latest) = state.latest_release(app)? else {
        return Ok(None);
    };
    Ok(state.release(app, latest)?.and_then(|r| r.source_commit_id))
}
