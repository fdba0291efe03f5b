use super::{colorize, describe, json_pretty, open_engine, EXIT_SUCCESS};
use railhead_core::{CoreError, EngineConfig};
use railhead_schema::{
    Actor, AppName, EnvName, EnvironmentConfig, Lock, LockId, TeamName, UpstreamSource, Version,
};
use railhead_store::{State, StoreError};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentStatus {
    environment: EnvName,
    config: EnvironmentConfig,
    locks: BTreeMap<LockId, Lock>,
    team_locks: BTreeMap<TeamName, BTreeMap<LockId, Lock>>,
    applications: Vec<AppStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppStatus {
    name: AppName,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queued_version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    team: Option<TeamName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployed_by: Option<Actor>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    locks: BTreeMap<LockId, Lock>,
}

fn store_err(e: StoreError) -> String {
    describe(&CoreError::from(e))
}

fn collect(state: &State, env: &EnvName) -> Result<EnvironmentStatus, String> {
    let Some(config) = state.environment_config(env).map_err(store_err)? else {
        return Err(format!("not found: environment \"{env}\""));
    };
    let mut team_locks = BTreeMap::new();
    let mut applications = Vec::new();
    for app in state.environment_applications(env) {
        let team = state.team_owner(&app).map_err(store_err)?;
        if let Some(team) = &team {
            if !team_locks.contains_key(team) {
                let locks = state.team_locks(env, team).map_err(store_err)?;
                if !locks.is_empty() {
                    team_locks.insert(team.clone(), locks);
                }
            }
        }
        let deployment = state.deployment(env, &app).map_err(store_err)?;
        applications.push(AppStatus {
            version: deployment.as_ref().map(|d| d.version),
            queued_version: state.queued_version(env, &app).map_err(store_err)?,
            deployed_by: deployment.map(|d| d.deployed_by),
            locks: state.application_locks(env, &app).map_err(store_err)?,
            team,
            name: app,
        });
    }
    Ok(EnvironmentStatus {
        environment: env.clone(),
        config,
        locks: state.environment_locks(env).map_err(store_err)?,
        team_locks,
        applications,
    })
}

fn render(status: &EnvironmentStatus) -> String {
    let mut out = format!("environment: {}\n", status.environment);
    let upstream = match status.config.upstream_source() {
        Ok(UpstreamSource::Latest) => "latest".to_owned(),
        Ok(UpstreamSource::Environment(env)) => env.into_inner(),
        Err(_) => "-".to_owned(),
    };
    out.push_str(&format!("upstream:    {upstream}\n"));
    if let Some(group) = &status.config.environment_group {
        out.push_str(&format!("group:       {group}\n"));
    }
    for (id, lock) in &status.locks {
        out.push_str(&format!("{} {id}: {}\n", colorize("locked"), lock.message));
    }
    for (team, locks) in &status.team_locks {
        for (id, lock) in locks {
            out.push_str(&format!(
                "{} {id} (team {team}): {}\n",
                colorize("locked"),
                lock.message
            ));
        }
    }
    if status.applications.is_empty() {
        out.push_str("no applications\n");
        return out;
    }
    out.push_str(&format!(
        "{:<24} {:>8} {:>8} {:<12} LOCKS\n",
        "APPLICATION", "VERSION", "QUEUED", "TEAM"
    ));
    for app in &status.applications {
        let version = app.version.map_or_else(|| "-".to_owned(), |v| v.to_string());
        let queued = app
            .queued_version
            .map_or_else(|| "-".to_owned(), |v| v.to_string());
        let team = app.team.as_ref().map_or("-", |t| t.as_str());
        let locks: Vec<&str> = app.locks.keys().map(LockId::as_str).collect();
        out.push_str(&format!(
            "{:<24} {version:>8} {queued:>8} {team:<12} {}\n",
            app.name,
            locks.join(",")
        ));
    }
    out
}

pub fn run(config: EngineConfig, environment: &str, json: bool) -> Result<u8, String> {
    let env = EnvName::parse(environment).map_err(|e| format!("invalid argument: {e}"))?;
    let engine = open_engine(config)?;
    let status = collect(&engine.state(), &env)?;
    if json {
        println!("{}", json_pretty(&status)?);
    } else {
        print!("{}", render(&status));
    }
    Ok(EXIT_SUCCESS)
}
