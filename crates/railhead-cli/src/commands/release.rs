use super::submit;
use railhead_core::{
    CreateApplicationVersion, CreateUndeployApplicationVersion, EngineConfig, Transformer,
};
use railhead_schema::{Actor, CommitId, EnvName, TeamName};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub struct Options {
    pub version: Option<u64>,
    pub team: Option<String>,
    pub source_commit: Option<String>,
    pub source_author: Option<String>,
    pub source_message: Option<String>,
    pub display_version: Option<String>,
}

/// Parse an `ENV=FILE` manifest argument.
pub fn parse_manifest_arg(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((env, file)) if !env.is_empty() && !file.is_empty() => {
            Ok((env.to_owned(), PathBuf::from(file)))
        }
        _ => Err(format!("expected ENV=FILE, got '{arg}'")),
    }
}

fn read_manifests(manifests: &[(String, PathBuf)]) -> Result<BTreeMap<EnvName, String>, String> {
    let mut out = BTreeMap::new();
    for (env, path) in manifests {
        let content = read_manifest(path)?;
        if out.insert(EnvName::new(env.as_str()), content).is_some() {
            return Err(format!("invalid argument: manifest for '{env}' given twice"));
        }
    }
    Ok(out)
}

fn read_manifest(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("failed to read manifest {}: {e}", path.display()))
}

pub fn run(
    config: EngineConfig,
    actor: Actor,
    application: &str,
    manifests: &[(String, PathBuf)],
    options: Options,
    json: bool,
) -> Result<u8, String> {
    let mut release = CreateApplicationVersion::new(application, read_manifests(manifests)?);
    release.version = options.version;
    release.team = options.team.map(TeamName::new);
    release.source_commit_id = options.source_commit.map(CommitId::new);
    release.source_author = options.source_author.unwrap_or_default();
    release.source_message = options.source_message.unwrap_or_default();
    release.display_version = options.display_version.unwrap_or_default();
    release.write_commit_data = config.transformers.write_commit_data;
    submit(
        config,
        actor,
        vec![Transformer::CreateApplicationVersion(release)],
        json,
    )
}

pub fn undeploy(
    config: EngineConfig,
    actor: Actor,
    application: &str,
    json: bool,
) -> Result<u8, String> {
    let mut undeploy = CreateUndeployApplicationVersion::new(application);
    undeploy.write_commit_data = config.transformers.write_commit_data;
    submit(
        config,
        actor,
        vec![Transformer::CreateUndeployApplicationVersion(undeploy)],
        json,
    )
}
