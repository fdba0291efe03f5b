use super::submit;
use railhead_core::{DeployApplicationVersion, EngineConfig, Transformer};
use railhead_schema::{Actor, LockBehaviour};

#[allow(clippy::too_many_arguments)]
pub fn run(
    config: EngineConfig,
    actor: Actor,
    environment: &str,
    application: &str,
    version: u64,
    lock_behaviour: LockBehaviour,
    ci_link: Option<String>,
    json: bool,
) -> Result<u8, String> {
    let mut deploy =
        DeployApplicationVersion::new(environment, application, version, lock_behaviour);
    deploy.ci_link = ci_link;
    deploy.write_commit_data = config.transformers.write_commit_data;
    submit(
        config,
        actor,
        vec![Transformer::DeployApplicationVersion(deploy)],
        json,
    )
}
