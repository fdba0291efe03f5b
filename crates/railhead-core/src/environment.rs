use crate::CoreError;
use railhead_schema::{EnvName, EnvironmentConfig};
use railhead_store::State;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironment {
    pub environment: EnvName,
    #[serde(default)]
    pub config: EnvironmentConfig,
}

impl CreateEnvironment {
    pub fn new(environment: impl Into<EnvName>, config: EnvironmentConfig) -> Self {
        Self {
            environment: environment.into(),
            config,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        self.environment.validate()?;
        if let Some(upstream) = self
            .config
            .upstream
            .as_ref()
            .and_then(|u| u.environment.as_ref())
        {
            upstream.validate()?;
        }
        if let Some(group) = &self.config.environment_group {
            group.validate()?;
        }
        Ok(())
    }

    pub fn transform(&self, state: &mut State) -> Result<String, CoreError> {
        let env = &self.environment;
        if state.environment_exists(env) {
            return Err(CoreError::AlreadyExists(format!("environment \"{env}\"")));
        }
        state.write_environment_config(env, &self.config)?;
        info!("created environment {env}");
        Ok(format!("create environment \"{env}\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_config_file() {
        let mut state = State::default();
        let t = CreateEnvironment::new(
            "staging",
            EnvironmentConfig::upstream_env("dev").with_group("pre-prod"),
        );
        assert_eq!(t.transform(&mut state).unwrap(), "create environment \"staging\"");
        let config = state
            .environment_config(&EnvName::new("staging"))
            .unwrap()
            .unwrap();
        assert_eq!(config, t.config);
        assert_eq!(state.environment_names(), vec![EnvName::new("staging")]);
    }

    #[test]
    fn second_create_is_rejected() {
        let mut state = State::default();
        let t = CreateEnvironment::new("dev", EnvironmentConfig::upstream_latest());
        t.transform(&mut state).unwrap();
        assert!(matches!(
            t.transform(&mut state),
            Err(CoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn invalid_upstream_name_fails_validation() {
        let t = CreateEnvironment::new("prod", EnvironmentConfig::upstream_env("Staging!"));
        assert!(matches!(t.validate(), Err(CoreError::Validation(_))));
    }
}
