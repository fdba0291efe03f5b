//! Scenario tests that drive transformers directly against an in-memory state.

use chrono::{TimeZone, Utc};
use railhead_core::{
    CleanupOldApplicationVersions, CoreError, CreateApplicationVersion, CreateEnvironment,
    CreateEnvironmentApplicationLock, CreateEnvironmentGroupLock, CreateEnvironmentLock,
    CreateEnvironmentTeamLock, CreateUndeployApplicationVersion,
    DeleteEnvironmentApplicationLock, DeleteEnvironmentGroupLock, DeleteEnvironmentLock,
    DeleteEnvironmentTeamLock, DeployApplicationVersion, Permissions, Transformer,
    TransformerContext, TransformerSettings,
};
use railhead_schema::{
    Actor, AppName, EnvName, EnvironmentConfig, LockBehaviour, LockId, TeamName, Version,
};
use railhead_store::State;
use std::collections::BTreeMap;

struct Harness {
    state: State,
    settings: TransformerSettings,
    permissions: Permissions,
}

impl Harness {
    fn new() -> Self {
        Self {
            state: State::default(),
            settings: TransformerSettings::default(),
            permissions: Permissions::allow_all(),
        }
    }

    fn actor() -> Actor {
        Actor::new("Grace", "grace@example.com")
    }

    /// Apply one transformer; on error the state is left as it was.
    fn apply(&mut self, transformer: Transformer) -> Result<String, CoreError> {
        transformer.validate()?;
        let mut next = self.state.clone();
        let mut ctx =
            TransformerContext::new(Self::actor(), Utc::now(), &self.settings, &self.permissions);
        let message = transformer.transform(&mut next, &mut ctx)?;
        self.state = next;
        Ok(message)
    }

    fn env(&mut self, name: &str, config: EnvironmentConfig) {
        self.apply(Transformer::CreateEnvironment(CreateEnvironment::new(
            name, config,
        )))
        .unwrap();
    }

    fn release(&mut self, app: &str, envs: &[&str]) -> String {
        self.apply(release(app, envs, None)).unwrap()
    }

    fn deployed(&self, env: &str, app: &str) -> Option<Version> {
        self.state
            .deployed_version(&EnvName::new(env), &AppName::new(app))
            .unwrap()
    }

    fn queued(&self, env: &str, app: &str) -> Option<Version> {
        self.state
            .queued_version(&EnvName::new(env), &AppName::new(app))
            .unwrap()
    }
}

fn release(app: &str, envs: &[&str], team: Option<&str>) -> Transformer {
    let manifests: BTreeMap<EnvName, String> = envs
        .iter()
        .map(|e| (EnvName::new(*e), format!("kind: Deployment # {app} in {e}")))
        .collect();
    let mut t = CreateApplicationVersion::new(app, manifests);
    t.team = team.map(TeamName::new);
    Transformer::CreateApplicationVersion(t)
}

fn deploy(env: &str, app: &str, version: Version, behaviour: LockBehaviour) -> Transformer {
    Transformer::DeployApplicationVersion(DeployApplicationVersion::new(
        env, app, version, behaviour,
    ))
}

#[test]
fn release_versions_count_up_in_call_order() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    for expected in 1..=4 {
        let message = h.release("foo", &["dev"]);
        assert!(
            message.starts_with(&format!("created version {expected} of \"foo\"")),
            "{message}"
        );
    }
    assert_eq!(
        h.state.release_versions(&AppName::new("foo")).unwrap(),
        vec![1, 2, 3, 4]
    );
}

#[test]
fn new_release_auto_deploys_to_latest_environments_only() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.env("staging", EnvironmentConfig::upstream_env("dev"));
    h.release("foo", &["dev", "staging"]);

    assert_eq!(h.deployed("dev", "foo"), Some(1));
    assert_eq!(h.deployed("staging", "foo"), None);
}

#[test]
fn fail_lists_exactly_the_blocking_locks() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.env("prod", EnvironmentConfig::upstream_env("dev"));
    h.release("foo", &["dev", "prod"]);
    h.release("foo", &["dev", "prod"]);
    h.apply(deploy("prod", "foo", 1, LockBehaviour::Fail)).unwrap();

    h.apply(Transformer::CreateEnvironmentLock(CreateEnvironmentLock::new(
        "prod", "freeze", "code freeze",
    )))
    .unwrap();
    h.apply(Transformer::CreateEnvironmentApplicationLock(
        CreateEnvironmentApplicationLock::new("prod", "foo", "incident", "investigating"),
    ))
    .unwrap();
    // A lock on another application must not show up.
    h.apply(Transformer::CreateEnvironmentApplicationLock(
        CreateEnvironmentApplicationLock::new("prod", "bar", "other", "unrelated"),
    ))
    .unwrap();

    let err = h.apply(deploy("prod", "foo", 2, LockBehaviour::Fail)).unwrap_err();
    let locked = err.as_locked().unwrap();
    assert_eq!(
        locked.environment_locks.keys().collect::<Vec<_>>(),
        vec![&LockId::new("freeze")]
    );
    assert_eq!(
        locked.application_locks.keys().collect::<Vec<_>>(),
        vec![&LockId::new("incident")]
    );
    assert!(locked.team_locks.is_empty());
    assert_eq!(h.deployed("prod", "foo"), Some(1));
}

#[test]
fn queued_version_deploys_when_lock_is_removed() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.release("foo", &["dev"]);
    h.apply(Transformer::CreateEnvironmentLock(CreateEnvironmentLock::new(
        "dev", "freeze", "hold",
    )))
    .unwrap();

    h.release("foo", &["dev"]);
    assert_eq!(h.deployed("dev", "foo"), Some(1));
    assert_eq!(h.queued("dev", "foo"), Some(2));

    let message = h
        .apply(Transformer::DeleteEnvironmentLock(DeleteEnvironmentLock::new(
            "dev", "freeze",
        )))
        .unwrap();
    assert!(message.starts_with("Deleted lock \"freeze\" on environment \"dev\""));
    assert!(message.contains("deployed version 2 of \"foo\" to \"dev\""), "{message}");
    assert_eq!(h.deployed("dev", "foo"), Some(2));
    assert_eq!(h.queued("dev", "foo"), None);
}

#[test]
fn queue_stays_while_another_lock_remains() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.release("foo", &["dev"]);
    for id in ["a", "b"] {
        h.apply(Transformer::CreateEnvironmentLock(CreateEnvironmentLock::new(
            "dev", id, "hold",
        )))
        .unwrap();
    }
    h.release("foo", &["dev"]);

    h.apply(Transformer::DeleteEnvironmentLock(DeleteEnvironmentLock::new("dev", "a")))
        .unwrap();
    assert_eq!(h.deployed("dev", "foo"), Some(1));
    assert_eq!(h.queued("dev", "foo"), Some(2));
}

#[test]
fn team_lock_blocks_and_its_removal_drains() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.apply(release("foo", &["dev"], Some("payments"))).unwrap();

    let missing_team = h.apply(Transformer::CreateEnvironmentTeamLock(
        CreateEnvironmentTeamLock::new("dev", "nobody", "freeze", ""),
    ));
    assert!(matches!(missing_team, Err(CoreError::NotFound(_))));

    h.apply(Transformer::CreateEnvironmentTeamLock(
        CreateEnvironmentTeamLock::new("dev", "payments", "freeze", "quarter close"),
    ))
    .unwrap();
    h.apply(release("foo", &["dev"], Some("payments"))).unwrap();
    assert_eq!(h.queued("dev", "foo"), Some(2));

    let err = h.apply(deploy("dev", "foo", 2, LockBehaviour::Fail)).unwrap_err();
    assert!(err
        .as_locked()
        .unwrap()
        .team_locks
        .contains_key("freeze"));

    h.apply(Transformer::DeleteEnvironmentTeamLock(DeleteEnvironmentTeamLock {
        environment: EnvName::new("dev"),
        team: TeamName::new("payments"),
        lock_id: LockId::new("freeze"),
    }))
    .unwrap();
    assert_eq!(h.deployed("dev", "foo"), Some(2));
}

#[test]
fn group_locks_cover_every_member() {
    let mut h = Harness::new();
    h.env("de-1", EnvironmentConfig::upstream_latest().with_group("prod"));
    h.env("de-2", EnvironmentConfig::upstream_latest().with_group("prod"));
    h.env("dev", EnvironmentConfig::upstream_latest());

    let message = h
        .apply(Transformer::CreateEnvironmentGroupLock(
            CreateEnvironmentGroupLock::new("prod", "freeze", "holiday"),
        ))
        .unwrap();
    assert!(message.contains("de-1") && message.contains("de-2"));
    for env in ["de-1", "de-2"] {
        assert!(h
            .state
            .environment_locks(&EnvName::new(env))
            .unwrap()
            .contains_key("freeze"));
    }
    assert!(h
        .state
        .environment_locks(&EnvName::new("dev"))
        .unwrap()
        .is_empty());

    h.apply(Transformer::DeleteEnvironmentGroupLock(
        DeleteEnvironmentGroupLock::new("prod", "freeze"),
    ))
    .unwrap();
    assert!(h
        .state
        .environment_locks(&EnvName::new("de-2"))
        .unwrap()
        .is_empty());

    let unknown = h.apply(Transformer::CreateEnvironmentGroupLock(
        CreateEnvironmentGroupLock::new("nowhere", "freeze", ""),
    ));
    assert!(matches!(unknown, Err(CoreError::NotFound(_))));
}

#[test]
fn deleting_locks_in_an_unknown_environment_is_not_found() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.apply(release("foo", &["dev"], Some("payments"))).unwrap();

    let deletes = [
        Transformer::DeleteEnvironmentLock(DeleteEnvironmentLock::new("nowhere", "freeze")),
        Transformer::DeleteEnvironmentApplicationLock(DeleteEnvironmentApplicationLock::new(
            "nowhere", "foo", "freeze",
        )),
        Transformer::DeleteEnvironmentTeamLock(DeleteEnvironmentTeamLock::new(
            "nowhere", "payments", "freeze",
        )),
    ];
    for delete in deletes {
        let err = h.apply(delete).unwrap_err();
        assert!(matches!(&err, CoreError::NotFound(m) if m.contains("nowhere")), "{err}");
    }

    h.apply(Transformer::DeleteEnvironmentLock(DeleteEnvironmentLock::new("dev", "absent")))
        .unwrap();
}

#[test]
fn cleanup_keeps_deployed_releases_and_the_retention_window() {
    let mut h = Harness::new();
    h.settings.kept_versions_on_cleanup = 3;
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.env("staging", EnvironmentConfig::upstream_env("dev"));
    for _ in 0..5 {
        h.release("foo", &["dev", "staging"]);
    }
    h.apply(deploy("staging", "foo", 5, LockBehaviour::Fail)).unwrap();
    for _ in 0..10 {
        h.release("foo", &["dev", "staging"]);
    }

    let versions = h.state.release_versions(&AppName::new("foo")).unwrap();
    assert_eq!(versions, (3..=15).collect::<Vec<_>>());
    assert_eq!(h.deployed("staging", "foo"), Some(5));
    assert_eq!(h.deployed("dev", "foo"), Some(15));

    // Nothing further is old enough.
    let message = h
        .apply(Transformer::CleanupOldApplicationVersions(
            CleanupOldApplicationVersions::new("foo"),
        ))
        .unwrap();
    assert!(message.is_empty());
}

#[test]
fn undeploy_release_is_promoted_like_any_other() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.release("foo", &["dev"]);
    let message = h
        .apply(Transformer::CreateUndeployApplicationVersion(
            CreateUndeployApplicationVersion::new("foo"),
        ))
        .unwrap();
    assert!(message.starts_with("created undeploy-version 2 of \"foo\""));
    assert_eq!(h.deployed("dev", "foo"), Some(2));
    let release = h.state.release(&AppName::new("foo"), 2).unwrap().unwrap();
    assert!(release.undeploy);

    let missing = h.apply(Transformer::CreateUndeployApplicationVersion(
        CreateUndeployApplicationVersion::new("bar"),
    ));
    assert!(matches!(missing, Err(CoreError::NotFound(_))));
}

#[test]
fn permissions_guard_deploys_of_owned_apps() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.env("prod", EnvironmentConfig::upstream_env("dev"));
    h.apply(release("foo", &["dev", "prod"], Some("payments"))).unwrap();

    h.permissions = Permissions::allow_all().grant("someone@example.com", "search");
    let err = h.apply(deploy("prod", "foo", 1, LockBehaviour::Fail)).unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));

    h.permissions = Permissions::allow_all().grant("grace@example.com", "payments");
    h.apply(deploy("prod", "foo", 1, LockBehaviour::Fail)).unwrap();
    assert_eq!(h.deployed("prod", "foo"), Some(1));
}

#[test]
fn replayed_json_produces_the_same_commit() {
    let mut h = Harness::new();
    h.env("dev", EnvironmentConfig::upstream_latest());
    h.env("prod", EnvironmentConfig::upstream_env("dev"));
    h.release("foo", &["dev", "prod"]);

    let now = Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap();
    let requests = vec![
        release("foo", &["dev", "prod"], Some("payments")),
        deploy("prod", "foo", 1, LockBehaviour::Queue),
        Transformer::CreateEnvironmentLock(CreateEnvironmentLock::new("prod", "freeze", "hold")),
    ];
    for original in requests {
        let replayed: Transformer =
            serde_json::from_str(&serde_json::to_string(&original).unwrap()).unwrap();

        let run = |t: &Transformer| {
            let mut state = h.state.clone();
            let mut ctx =
                TransformerContext::new(Harness::actor(), now, &h.settings, &h.permissions);
            let message = t.transform(&mut state, &mut ctx).unwrap();
            (state.tree().digest(), message)
        };
        assert_eq!(run(&original), run(&replayed), "{}", original.event_type());
    }
}
