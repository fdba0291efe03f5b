use crate::SchemaError;

const MAX_APP_NAME_LEN: usize = 39;
const MAX_ENV_NAME_LEN: usize = 20;
const MAX_TEAM_NAME_LEN: usize = 20;
const MIN_LOCK_ID_LEN: usize = 2;
const MAX_LOCK_ID_LEN: usize = 99;

/// Matches `^[a-z0-9]+(-[a-z0-9]+)*$`.
fn is_dash_separated_lowercase(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

fn invalid(kind: &'static str, value: &str) -> SchemaError {
    SchemaError::InvalidName {
        kind,
        value: value.to_owned(),
    }
}

pub fn validate_app_name(name: &str) -> Result<(), SchemaError> {
    if name.len() > MAX_APP_NAME_LEN || !is_dash_separated_lowercase(name) {
        return Err(invalid("application name", name));
    }
    Ok(())
}

pub fn validate_env_name(name: &str) -> Result<(), SchemaError> {
    if name.len() > MAX_ENV_NAME_LEN || !is_dash_separated_lowercase(name) {
        return Err(invalid("environment name", name));
    }
    Ok(())
}

pub fn validate_team_name(name: &str) -> Result<(), SchemaError> {
    if name.len() > MAX_TEAM_NAME_LEN || !is_dash_separated_lowercase(name) {
        return Err(invalid("team name", name));
    }
    Ok(())
}

/// Lock ids become file names inside the repository tree.
pub fn validate_lock_id(id: &str) -> Result<(), SchemaError> {
    if id.len() < MIN_LOCK_ID_LEN
        || id.len() > MAX_LOCK_ID_LEN
        || id == "."
        || id == ".."
        || id.bytes().any(|b| b == b'/' || b.is_ascii_control())
    {
        return Err(invalid("lock id", id));
    }
    Ok(())
}

pub fn validate_commit_id(id: &str) -> Result<(), SchemaError> {
    if id.len() != 40
        || !id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(invalid("commit id", id));
    }
    Ok(())
}
