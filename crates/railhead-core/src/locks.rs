//! Lock transformers for every scope, and the error raised when locks block a deploy.
//!
//! Creating a lock only writes the lock record. Deleting one also drains the
//! deployment queue of whatever the lock was holding back.

use crate::deploy::process_queue;
use crate::transformer::{Transformer, TransformerContext};
use crate::CoreError;
use railhead_schema::{AppName, EnvGroupName, EnvName, Lock, LockId, TeamName};
use railhead_store::State;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// A deploy with [`Fail`](railhead_schema::LockBehaviour::Fail) behaviour ran
/// into locks. Carries every blocking lock, grouped by scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedError {
    pub environment: EnvName,
    pub application: AppName,
    pub environment_locks: BTreeMap<LockId, Lock>,
    pub application_locks: BTreeMap<LockId, Lock>,
    pub team_locks: BTreeMap<LockId, Lock>,
}

impl fmt::Display for LockedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "deploying \"{}\" to \"{}\" is blocked by",
            self.application, self.environment
        )?;
        let mut first = true;
        for (scope, locks) in [
            ("environment", &self.environment_locks),
            ("application", &self.application_locks),
            ("team", &self.team_locks),
        ] {
            for id in locks.keys() {
                let sep = if first { " " } else { ", " };
                write!(f, "{sep}{scope} lock '{id}'")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::error::Error for LockedError {}

fn new_lock(
    ctx: &TransformerContext<'_>,
    message: &str,
    ci_link: &Option<String>,
    suggested_lifetime: &Option<String>,
) -> Lock {
    Lock {
        message: message.to_owned(),
        created_by: ctx.actor.clone(),
        created_at: ctx.now,
        ci_link: ci_link.clone(),
        suggested_lifetime: suggested_lifetime.clone(),
    }
}

fn require_environment(state: &State, env: &EnvName) -> Result<(), CoreError> {
    if state.environment_exists(env) {
        Ok(())
    } else {
        Err(CoreError::NotFound(format!("environment \"{env}\"")))
    }
}

/// Drain the queue of every given application in `env`, appending what happened.
fn drain_queues(
    state: &mut State,
    ctx: &mut TransformerContext<'_>,
    env: &EnvName,
    apps: &[AppName],
    message: &mut String,
) -> Result<(), CoreError> {
    for app in apps {
        if let Some(msg) = process_queue(state, ctx, env, app)? {
            message.push('\n');
            message.push_str(&msg);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentLock {
    pub environment: EnvName,
    pub lock_id: LockId,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_lifetime: Option<String>,
}

impl CreateEnvironmentLock {
    pub fn new(
        environment: impl Into<EnvName>,
        lock_id: impl Into<LockId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            lock_id: lock_id.into(),
            message: message.into(),
            ci_link: None,
            suggested_lifetime: None,
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        require_environment(state, &self.environment)?;
        let lock = new_lock(ctx, &self.message, &self.ci_link, &self.suggested_lifetime);
        state.write_environment_lock(&self.environment, &self.lock_id, &lock)?;
        info!("locked environment {} ({})", self.environment, self.lock_id);
        Ok(format!(
            "Created lock \"{}\" on environment \"{}\"",
            self.lock_id, self.environment
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEnvironmentLock {
    pub environment: EnvName,
    pub lock_id: LockId,
}

impl DeleteEnvironmentLock {
    pub fn new(environment: impl Into<EnvName>, lock_id: impl Into<LockId>) -> Self {
        Self {
            environment: environment.into(),
            lock_id: lock_id.into(),
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let env = &self.environment;
        require_environment(state, env)?;
        state.delete_environment_lock(env, &self.lock_id);
        let mut message = format!("Deleted lock \"{}\" on environment \"{env}\"", self.lock_id);
        let apps = state.environment_applications(env);
        drain_queues(state, ctx, env, &apps, &mut message)?;
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentApplicationLock {
    pub environment: EnvName,
    pub application: AppName,
    pub lock_id: LockId,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_lifetime: Option<String>,
}

impl CreateEnvironmentApplicationLock {
    pub fn new(
        environment: impl Into<EnvName>,
        application: impl Into<AppName>,
        lock_id: impl Into<LockId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            application: application.into(),
            lock_id: lock_id.into(),
            message: message.into(),
            ci_link: None,
            suggested_lifetime: None,
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        require_environment(state, &self.environment)?;
        let lock = new_lock(ctx, &self.message, &self.ci_link, &self.suggested_lifetime);
        state.write_application_lock(&self.environment, &self.application, &self.lock_id, &lock)?;
        Ok(format!(
            "Created lock \"{}\" on environment \"{}\" for application \"{}\"",
            self.lock_id, self.environment, self.application
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEnvironmentApplicationLock {
    pub environment: EnvName,
    pub application: AppName,
    pub lock_id: LockId,
}

impl DeleteEnvironmentApplicationLock {
    pub fn new(
        environment: impl Into<EnvName>,
        application: impl Into<AppName>,
        lock_id: impl Into<LockId>,
    ) -> Self {
        Self {
            environment: environment.into(),
            application: application.into(),
            lock_id: lock_id.into(),
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let env = &self.environment;
        require_environment(state, env)?;
        let app = &self.application;
        state.delete_application_lock(env, app, &self.lock_id);
        let mut message = format!(
            "Deleted lock \"{}\" on environment \"{env}\" for application \"{app}\"",
            self.lock_id
        );
        drain_queues(state, ctx, env, std::slice::from_ref(app), &mut message)?;
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentTeamLock {
    pub environment: EnvName,
    pub team: TeamName,
    pub lock_id: LockId,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_lifetime: Option<String>,
}

impl CreateEnvironmentTeamLock {
    pub fn new(
        environment: impl Into<EnvName>,
        team: impl Into<TeamName>,
        lock_id: impl Into<LockId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            team: team.into(),
            lock_id: lock_id.into(),
            message: message.into(),
            ci_link: None,
            suggested_lifetime: None,
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        require_environment(state, &self.environment)?;
        let mut owns_app = false;
        for app in state.applications() {
            if state.team_owner(&app)?.as_ref() == Some(&self.team) {
                owns_app = true;
                break;
            }
        }
        if !owns_app {
            return Err(CoreError::NotFound(format!(
                "team \"{}\" does not own any application",
                self.team
            )));
        }
        let lock = new_lock(ctx, &self.message, &self.ci_link, &self.suggested_lifetime);
        state.write_team_lock(&self.environment, &self.team, &self.lock_id, &lock)?;
        Ok(format!(
            "Created lock \"{}\" on environment \"{}\" for team \"{}\"",
            self.lock_id, self.environment, self.team
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEnvironmentTeamLock {
    pub environment: EnvName,
    pub team: TeamName,
    pub lock_id: LockId,
}

impl DeleteEnvironmentTeamLock {
    pub fn new(
        environment: impl Into<EnvName>,
        team: impl Into<TeamName>,
        lock_id: impl Into<LockId>,
    ) -> Self {
        Self {
            environment: environment.into(),
            team: team.into(),
            lock_id: lock_id.into(),
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let env = &self.environment;
        require_environment(state, env)?;
        state.delete_team_lock(env, &self.team, &self.lock_id);
        let mut message = format!(
            "Deleted lock \"{}\" on environment \"{env}\" for team \"{}\"",
            self.lock_id, self.team
        );
        let mut apps = Vec::new();
        for app in state.environment_applications(env) {
            if state.team_owner(&app)?.as_ref() == Some(&self.team) {
                apps.push(app);
            }
        }
        drain_queues(state, ctx, env, &apps, &mut message)?;
        Ok(message)
    }
}

/// Environments whose group is `group`, in name order.
fn group_members(state: &State, group: &EnvGroupName) -> Result<Vec<EnvName>, CoreError> {
    let members: Vec<EnvName> = state
        .environment_configs()?
        .into_iter()
        .filter(|(env, config)| config.group_name(env) == *group)
        .map(|(env, _)| env)
        .collect();
    if members.is_empty() {
        return Err(CoreError::NotFound(format!("environment group \"{group}\"")));
    }
    Ok(members)
}

/// Lock every environment of a group under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentGroupLock {
    pub environment_group: EnvGroupName,
    pub lock_id: LockId,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_lifetime: Option<String>,
}

impl CreateEnvironmentGroupLock {
    pub fn new(
        environment_group: impl Into<EnvGroupName>,
        lock_id: impl Into<LockId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            environment_group: environment_group.into(),
            lock_id: lock_id.into(),
            message: message.into(),
            ci_link: None,
            suggested_lifetime: None,
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let mut message = format!(
            "Creating locks '{}' for environment group '{}':",
            self.lock_id, self.environment_group
        );
        for env in group_members(state, &self.environment_group)? {
            let lock = Transformer::CreateEnvironmentLock(CreateEnvironmentLock {
                environment: env,
                lock_id: self.lock_id.clone(),
                message: self.message.clone(),
                ci_link: self.ci_link.clone(),
                suggested_lifetime: self.suggested_lifetime.clone(),
            });
            message.push('\n');
            message.push_str(&ctx.execute(&lock, state)?);
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEnvironmentGroupLock {
    pub environment_group: EnvGroupName,
    pub lock_id: LockId,
}

impl DeleteEnvironmentGroupLock {
    pub fn new(environment_group: impl Into<EnvGroupName>, lock_id: impl Into<LockId>) -> Self {
        Self {
            environment_group: environment_group.into(),
            lock_id: lock_id.into(),
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        let mut message = format!(
            "Deleting locks '{}' for environment group '{}':",
            self.lock_id, self.environment_group
        );
        for env in group_members(state, &self.environment_group)? {
            let delete = Transformer::DeleteEnvironmentLock(DeleteEnvironmentLock {
                environment: env,
                lock_id: self.lock_id.clone(),
            });
            message.push('\n');
            message.push_str(&ctx.execute(&delete, state)?);
        }
        Ok(message)
    }
}
