use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The person or system on whose behalf a change is made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub email: String,
}

impl Actor {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// A lock record, stored as JSON under the `locks/` directory of its scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub message: String,
    pub created_by: Actor,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_lifetime: Option<String>,
}

/// How a deploy reacts to a lock blocking it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBehaviour {
    /// Deploy regardless of locks.
    Ignore,
    /// Abort with an error listing every blocking lock.
    #[default]
    Fail,
    /// Remember the version and deploy it once the locks are gone.
    Queue,
}

impl fmt::Display for LockBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockBehaviour::Ignore => write!(f, "ignore"),
            LockBehaviour::Fail => write!(f, "fail"),
            LockBehaviour::Queue => write!(f, "queue"),
        }
    }
}

impl std::str::FromStr for LockBehaviour {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(LockBehaviour::Ignore),
            "fail" => Ok(LockBehaviour::Fail),
            "queue" => Ok(LockBehaviour::Queue),
            other => Err(format!("unknown lock behaviour '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    Environment,
    Application,
    Team,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockScope::Environment => write!(f, "environment"),
            LockScope::Application => write!(f, "application"),
            LockScope::Team => write!(f, "team"),
        }
    }
}
