use super::submit;
use railhead_core::{CreateEnvironment, EngineConfig, Transformer};
use railhead_schema::{Actor, EnvironmentConfig};
use std::path::PathBuf;

pub struct Options {
    pub latest: bool,
    pub upstream: Option<String>,
    pub group: Option<String>,
    pub config_file: Option<PathBuf>,
}

pub fn run(
    config: EngineConfig,
    actor: Actor,
    name: &str,
    options: Options,
    json: bool,
) -> Result<u8, String> {
    let env_config = environment_config(options)?;
    let transformer = Transformer::CreateEnvironment(CreateEnvironment::new(name, env_config));
    submit(config, actor, vec![transformer], json)
}

fn environment_config(options: Options) -> Result<EnvironmentConfig, String> {
    if let Some(path) = options.config_file {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        return serde_json::from_str(&content)
            .map_err(|e| format!("invalid argument: {}: {e}", path.display()));
    }
    let config = match (options.latest, options.upstream) {
        (true, _) => EnvironmentConfig::upstream_latest(),
        (false, Some(env)) => EnvironmentConfig::upstream_env(env),
        (false, None) => EnvironmentConfig::default(),
    };
    Ok(match options.group {
        Some(group) => config.with_group(group),
        None => config,
    })
}
