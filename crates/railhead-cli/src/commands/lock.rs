use super::submit;
use railhead_core::{
    CreateEnvironmentApplicationLock, CreateEnvironmentGroupLock, CreateEnvironmentLock,
    CreateEnvironmentTeamLock, DeleteEnvironmentApplicationLock, DeleteEnvironmentGroupLock,
    DeleteEnvironmentLock, DeleteEnvironmentTeamLock, EngineConfig, Transformer,
};
use railhead_schema::Actor;

/// What a lock applies to.
#[derive(Debug, Clone)]
pub enum LockScopeArg {
    Environment { environment: String },
    Application { environment: String, application: String },
    Team { environment: String, team: String },
    Group { group: String },
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub scope: LockScopeArg,
    pub lock_id: String,
    pub message: String,
    pub ci_link: Option<String>,
    pub lifetime: Option<String>,
}

fn create_transformer(request: LockRequest) -> Transformer {
    let LockRequest {
        scope,
        lock_id,
        message,
        ci_link,
        lifetime,
    } = request;
    match scope {
        LockScopeArg::Environment { environment } => {
            let mut t = CreateEnvironmentLock::new(environment, lock_id, message);
            t.ci_link = ci_link;
            t.suggested_lifetime = lifetime;
            Transformer::CreateEnvironmentLock(t)
        }
        LockScopeArg::Application {
            environment,
            application,
        } => {
            let mut t =
                CreateEnvironmentApplicationLock::new(environment, application, lock_id, message);
            t.ci_link = ci_link;
            t.suggested_lifetime = lifetime;
            Transformer::CreateEnvironmentApplicationLock(t)
        }
        LockScopeArg::Team { environment, team } => {
            let mut t = CreateEnvironmentTeamLock::new(environment, team, lock_id, message);
            t.ci_link = ci_link;
            t.suggested_lifetime = lifetime;
            Transformer::CreateEnvironmentTeamLock(t)
        }
        LockScopeArg::Group { group } => {
            let mut t = CreateEnvironmentGroupLock::new(group, lock_id, message);
            t.ci_link = ci_link;
            t.suggested_lifetime = lifetime;
            Transformer::CreateEnvironmentGroupLock(t)
        }
    }
}

fn delete_transformer(scope: LockScopeArg, lock_id: String) -> Transformer {
    match scope {
        LockScopeArg::Environment { environment } => {
            Transformer::DeleteEnvironmentLock(DeleteEnvironmentLock::new(environment, lock_id))
        }
        LockScopeArg::Application {
            environment,
            application,
        } => Transformer::DeleteEnvironmentApplicationLock(DeleteEnvironmentApplicationLock::new(
            environment,
            application,
            lock_id,
        )),
        LockScopeArg::Team { environment, team } => Transformer::DeleteEnvironmentTeamLock(
            DeleteEnvironmentTeamLock::new(environment, team, lock_id),
        ),
        LockScopeArg::Group { group } => Transformer::DeleteEnvironmentGroupLock(
            DeleteEnvironmentGroupLock::new(group, lock_id),
        ),
    }
}

pub fn create(
    config: EngineConfig,
    actor: Actor,
    request: LockRequest,
    json: bool,
) -> Result<u8, String> {
    submit(config, actor, vec![create_transformer(request)], json)
}

pub fn delete(
    config: EngineConfig,
    actor: Actor,
    (scope, lock_id): (LockScopeArg, String),
    json: bool,
) -> Result<u8, String> {
    submit(config, actor, vec![delete_transformer(scope, lock_id)], json)
}
