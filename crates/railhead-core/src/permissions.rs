use crate::CoreError;
use railhead_schema::{Actor, TeamName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ALL_TEAMS: &str = "*";

/// Team-based deploy permissions.
///
/// Disabled permissions allow everything. When enabled, an actor may deploy an
/// application only if their email maps to the owning team or to `*`.
/// Applications without an owning team are open to everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Permissions {
    pub enabled: bool,
    /// Actor email to the teams that actor may deploy for.
    pub teams: BTreeMap<String, Vec<String>>,
}

impl Permissions {
    pub fn allow_all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn grant(mut self, email: impl Into<String>, team: impl Into<String>) -> Self {
        self.enabled = true;
        self.teams.entry(email.into()).or_default().push(team.into());
        self
    }

    pub fn may_deploy(&self, actor: &Actor, team: Option<&TeamName>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(team) = team else {
            return true;
        };
        self.teams
            .get(&actor.email)
            .is_some_and(|teams| teams.iter().any(|t| t == ALL_TEAMS || t == team.as_str()))
    }

    pub fn check_deploy(&self, actor: &Actor, team: Option<&TeamName>) -> Result<(), CoreError> {
        if self.may_deploy(actor, team) {
            Ok(())
        } else {
            Err(CoreError::PermissionDenied(format!(
                "{} may not deploy for team \"{}\"",
                actor.email,
                team.map(TeamName::as_str).unwrap_or_default()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Actor {
        Actor::new("alice", "alice@example.com")
    }

    #[test]
    fn disabled_allows_everything() {
        let p = Permissions::allow_all();
        assert!(p.may_deploy(&alice(), Some(&TeamName::new("payments"))));
    }

    #[test]
    fn enabled_checks_team_membership() {
        let p = Permissions::default().grant("alice@example.com", "payments");
        assert!(p.may_deploy(&alice(), Some(&TeamName::new("payments"))));
        assert!(!p.may_deploy(&alice(), Some(&TeamName::new("search"))));
        assert!(p.may_deploy(&alice(), None));
        assert!(!p.may_deploy(
            &Actor::new("bob", "bob@example.com"),
            Some(&TeamName::new("payments"))
        ));
    }

    #[test]
    fn wildcard_grants_every_team() {
        let p = Permissions::default().grant("alice@example.com", "*");
        assert!(p.may_deploy(&alice(), Some(&TeamName::new("anything"))));
    }

    #[test]
    fn denial_is_permission_error() {
        let p = Permissions::default().grant("alice@example.com", "payments");
        let err = p
            .check_deploy(&alice(), Some(&TeamName::new("search")))
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));
        assert!(err.to_string().contains("search"));
    }
}
