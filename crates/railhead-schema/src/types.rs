//! Newtype wrappers for the identifiers that name things in the repository tree.
//!
//! All newtypes serialize/deserialize as plain strings. Deserialization does not
//! validate; transformers call [`parse`](EnvName::parse) or the `validate_*`
//! functions before touching state.

use crate::validate;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Release version number, strictly increasing per application starting at 1.
pub type Version = u64;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident, $validator:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string without validating it.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Wrap a string, rejecting it if it is not a valid identifier of this kind.
            pub fn parse(s: impl Into<String>) -> Result<Self, SchemaError> {
                let s = s.into();
                $validator(&s)?;
                Ok(Self(s))
            }

            /// Check the wrapped value against the naming rules of this kind.
            pub fn validate(&self) -> Result<(), SchemaError> {
                $validator(&self.0)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Name of a deployment environment, e.g. `staging`.
    EnvName,
    validate::validate_env_name
);

string_newtype!(
    /// Name of an environment group. Groups share the environment naming rules.
    EnvGroupName,
    validate::validate_env_name
);

string_newtype!(
    /// Name of an application.
    AppName,
    validate::validate_app_name
);

string_newtype!(
    /// Name of the team owning an application.
    TeamName,
    validate::validate_team_name
);

string_newtype!(
    /// Identifier of a lock, unique within its scope and safe to use as a file name.
    LockId,
    validate::validate_lock_id
);

string_newtype!(
    /// Full 40-character hex SHA-1 of a git commit.
    CommitId,
    validate::validate_commit_id
);
