//! The `Transformer` sum type and the context it runs in.
//!
//! A transformer reads and mutates a private copy of the [`State`] and returns
//! one commit-message fragment. Transformers may run further transformers
//! through [`TransformerContext::execute`]; everything they do lands in the
//! same commit.

use crate::config::TransformerSettings;
use crate::deploy::{DeployApplicationVersion, QueueApplicationVersion};
use crate::environment::CreateEnvironment;
use crate::locks::{
    CreateEnvironmentApplicationLock, CreateEnvironmentGroupLock, CreateEnvironmentLock,
    CreateEnvironmentTeamLock, DeleteEnvironmentApplicationLock, DeleteEnvironmentGroupLock,
    DeleteEnvironmentLock, DeleteEnvironmentTeamLock,
};
use crate::permissions::Permissions;
use crate::release::{
    CleanupOldApplicationVersions, CreateApplicationVersion, CreateUndeployApplicationVersion,
};
use crate::train::{EnvReleaseTrain, ReleaseTrain};
use crate::CoreError;
use chrono::{DateTime, Utc};
use railhead_schema::{Actor, AppName, CommitId, Deployment, EnvName, Event, Release};
use railhead_store::{GitRepository, State, StoreError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Read access to earlier commits, used to pin release trains to a commit.
pub trait History {
    fn state_at(&self, commit: &CommitId) -> Result<State, CoreError>;
}

impl History for GitRepository {
    fn state_at(&self, commit: &CommitId) -> Result<State, CoreError> {
        GitRepository::state_at(self, commit).map_err(|e| match e {
            StoreError::UnknownCommit(_) => CoreError::NotFound(e.to_string()),
            other => other.into(),
        })
    }
}

/// An audit event keyed by the source commit of the release it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub commit: CommitId,
    pub event: Event,
}

/// A row the engine mirrors into the relational event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbRecord {
    Deployment {
        environment: EnvName,
        application: AppName,
        deployment: Deployment,
    },
    Release {
        application: AppName,
        release: Release,
        deleted: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Transformer {
    CreateApplicationVersion(CreateApplicationVersion),
    CreateUndeployApplicationVersion(CreateUndeployApplicationVersion),
    DeployApplicationVersion(DeployApplicationVersion),
    CreateEnvironment(CreateEnvironment),
    CreateEnvironmentLock(CreateEnvironmentLock),
    DeleteEnvironmentLock(DeleteEnvironmentLock),
    CreateEnvironmentApplicationLock(CreateEnvironmentApplicationLock),
    DeleteEnvironmentApplicationLock(DeleteEnvironmentApplicationLock),
    CreateEnvironmentTeamLock(CreateEnvironmentTeamLock),
    DeleteEnvironmentTeamLock(DeleteEnvironmentTeamLock),
    CreateEnvironmentGroupLock(CreateEnvironmentGroupLock),
    DeleteEnvironmentGroupLock(DeleteEnvironmentGroupLock),
    QueueApplicationVersion(QueueApplicationVersion),
    CleanupOldApplicationVersions(CleanupOldApplicationVersions),
    ReleaseTrain(ReleaseTrain),
    EnvReleaseTrain(EnvReleaseTrain),
}

impl Transformer {
    /// Tag recorded in the event log. Matches the serialized `type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Transformer::CreateApplicationVersion(_) => "CreateApplicationVersion",
            Transformer::CreateUndeployApplicationVersion(_) => "CreateUndeployApplicationVersion",
            Transformer::DeployApplicationVersion(_) => "DeployApplicationVersion",
            Transformer::CreateEnvironment(_) => "CreateEnvironment",
            Transformer::CreateEnvironmentLock(_) => "CreateEnvironmentLock",
            Transformer::DeleteEnvironmentLock(_) => "DeleteEnvironmentLock",
            Transformer::CreateEnvironmentApplicationLock(_) => "CreateEnvironmentApplicationLock",
            Transformer::DeleteEnvironmentApplicationLock(_) => "DeleteEnvironmentApplicationLock",
            Transformer::CreateEnvironmentTeamLock(_) => "CreateEnvironmentTeamLock",
            Transformer::DeleteEnvironmentTeamLock(_) => "DeleteEnvironmentTeamLock",
            Transformer::CreateEnvironmentGroupLock(_) => "CreateEnvironmentGroupLock",
            Transformer::DeleteEnvironmentGroupLock(_) => "DeleteEnvironmentGroupLock",
            Transformer::QueueApplicationVersion(_) => "QueueApplicationVersion",
            Transformer::CleanupOldApplicationVersions(_) => "CleanupOldApplicationVersions",
            Transformer::ReleaseTrain(_) => "ReleaseTrain",
            Transformer::EnvReleaseTrain(_) => "EnvReleaseTrain",
        }
    }

    /// Check names and ids before anything touches the repository.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Transformer::CreateApplicationVersion(t) => t.validate(),
            Transformer::CreateUndeployApplicationVersion(t) => Ok(t.application.validate()?),
            Transformer::DeployApplicationVersion(t) => t.validate(),
            Transformer::CreateEnvironment(t) => t.validate(),
            Transformer::CreateEnvironmentLock(t) => {
                t.environment.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::DeleteEnvironmentLock(t) => {
                t.environment.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::CreateEnvironmentApplicationLock(t) => {
                t.environment.validate()?;
                t.application.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::DeleteEnvironmentApplicationLock(t) => {
                t.environment.validate()?;
                t.application.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::CreateEnvironmentTeamLock(t) => {
                t.environment.validate()?;
                t.team.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::DeleteEnvironmentTeamLock(t) => {
                t.environment.validate()?;
                t.team.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::CreateEnvironmentGroupLock(t) => {
                t.environment_group.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::DeleteEnvironmentGroupLock(t) => {
                t.environment_group.validate()?;
                Ok(t.lock_id.validate()?)
            }
            Transformer::QueueApplicationVersion(t) => {
                t.environment.validate()?;
                Ok(t.application.validate()?)
            }
            Transformer::CleanupOldApplicationVersions(t) => Ok(t.application.validate()?),
            Transformer::ReleaseTrain(t) => t.validate(),
            Transformer::EnvReleaseTrain(t) => t.validate(),
        }
    }

    pub fn transform(
        &self,
        state: &mut State,
        ctx: &mut TransformerContext<'_>,
    ) -> Result<String, CoreError> {
        debug!("applying {} at depth {}", self.event_type(), ctx.depth());
        match self {
            Transformer::CreateApplicationVersion(t) => t.transform(state, ctx),
            Transformer::CreateUndeployApplicationVersion(t) => t.transform(state, ctx),
            Transformer::DeployApplicationVersion(t) => t.transform(state, ctx),
            Transformer::CreateEnvironment(t) => t.transform(state),
            Transformer::CreateEnvironmentLock(t) => t.transform(state, ctx),
            Transformer::DeleteEnvironmentLock(t) => t.transform(state, ctx),
            Transformer::CreateEnvironmentApplicationLock(t) => t.transform(state, ctx),
            Transformer::DeleteEnvironmentApplicationLock(t) => t.transform(state, ctx),
            Transformer::CreateEnvironmentTeamLock(t) => t.transform(state, ctx),
            Transformer::DeleteEnvironmentTeamLock(t) => t.transform(state, ctx),
            Transformer::CreateEnvironmentGroupLock(t) => t.transform(state, ctx),
            Transformer::DeleteEnvironmentGroupLock(t) => t.transform(state, ctx),
            Transformer::QueueApplicationVersion(t) => Ok(t.transform(state)),
            Transformer::CleanupOldApplicationVersions(t) => t.transform(state, ctx),
            Transformer::ReleaseTrain(t) => t.transform(state, ctx),
            Transformer::EnvReleaseTrain(t) => t.transform(state, ctx),
        }
    }
}

/// Everything a transformer may consult besides the state itself, plus the
/// audit data it produces.
pub struct TransformerContext<'a> {
    pub actor: Actor,
    /// One timestamp for the whole request.
    pub now: DateTime<Utc>,
    pub settings: &'a TransformerSettings,
    pub permissions: &'a Permissions,
    pub history: Option<&'a dyn History>,
    /// ESL version of the top-level transformer being applied.
    pub esl_version: Option<i64>,
    events: Vec<CommitEvent>,
    records: Vec<DbRecord>,
    depth: usize,
}

impl<'a> TransformerContext<'a> {
    pub fn new(
        actor: Actor,
        now: DateTime<Utc>,
        settings: &'a TransformerSettings,
        permissions: &'a Permissions,
    ) -> Self {
        Self {
            actor,
            now,
            settings,
            permissions,
            history: None,
            esl_version: None,
            events: Vec::new(),
            records: Vec::new(),
            depth: 0,
        }
    }

    #[must_use]
    pub fn with_history(mut self, history: &'a dyn History) -> Self {
        self.history = Some(history);
        self
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Run a nested transformer as part of the current one.
    pub fn execute(
        &mut self,
        transformer: &Transformer,
        state: &mut State,
    ) -> Result<String, CoreError> {
        self.nested(|ctx| transformer.transform(state, ctx))
    }

    /// Run `f` one nesting level deeper, refusing to exceed the configured depth.
    pub fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        if self.depth >= self.settings.max_nesting_depth {
            return Err(CoreError::NestingTooDeep(self.settings.max_nesting_depth));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    pub fn record_event(&mut self, commit: &CommitId, event: Event) {
        self.events.push(CommitEvent {
            commit: commit.clone(),
            event,
        });
    }

    pub fn record(&mut self, record: DbRecord) {
        self.records.push(record);
    }

    pub fn events(&self) -> &[CommitEvent] {
        &self.events
    }

    pub fn records(&self) -> &[DbRecord] {
        &self.records
    }

    /// Hand the collected audit data to the engine.
    pub fn take_audit(&mut self) -> (Vec<CommitEvent>, Vec<DbRecord>) {
        (
            std::mem::take(&mut self.events),
            std::mem::take(&mut self.records),
        )
    }
}
