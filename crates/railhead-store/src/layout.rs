//! Where things live: the local working directory and the repository tree.

use crate::StoreError;
use railhead_schema::{AppName, EnvName, LockId, TeamName, Version};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current working directory format version. Incremented on incompatible layout changes.
pub const LAYOUT_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "format";

/// Layout of the local working directory backing one engine.
///
/// Holds the bare git repository, the event log database and the process
/// lock. Directories are created on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutVersion {
    format_version: u32,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn git_dir(&self) -> PathBuf {
        self.root.join("repo.git")
    }

    #[inline]
    pub fn events_db(&self) -> PathBuf {
        self.root.join("events.sqlite")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = LayoutVersion {
                format_version: LAYOUT_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: LayoutVersion = serde_json::from_str(&content)?;
        if ver.format_version != LAYOUT_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: LAYOUT_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

pub const APPLICATIONS_DIR: &str = "applications";
pub const ENVIRONMENTS_DIR: &str = "environments";

pub fn application_dir(app: &AppName) -> String {
    format!("{APPLICATIONS_DIR}/{app}")
}

pub fn team_file(app: &AppName) -> String {
    format!("{APPLICATIONS_DIR}/{app}/team")
}

pub fn releases_dir(app: &AppName) -> String {
    format!("{APPLICATIONS_DIR}/{app}/releases")
}

pub fn release_dir(app: &AppName, version: Version) -> String {
    format!("{APPLICATIONS_DIR}/{app}/releases/{version}")
}

pub fn release_environments_dir(app: &AppName, version: Version) -> String {
    format!("{}/environments", release_dir(app, version))
}

pub fn release_manifest(app: &AppName, version: Version, env: &EnvName) -> String {
    format!("{}/environments/{env}/manifests.yaml", release_dir(app, version))
}

pub fn environment_dir(env: &EnvName) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}")
}

pub fn environment_config(env: &EnvName) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}/config.json")
}

pub fn environment_locks_dir(env: &EnvName) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}/locks")
}

pub fn environment_lock(env: &EnvName, id: &LockId) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}/locks/{id}")
}

pub fn env_applications_dir(env: &EnvName) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}/applications")
}

pub fn env_application_dir(env: &EnvName, app: &AppName) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}/applications/{app}")
}

pub fn deployed_version_file(env: &EnvName, app: &AppName) -> String {
    format!("{}/version", env_application_dir(env, app))
}

pub fn queued_version_file(env: &EnvName, app: &AppName) -> String {
    format!("{}/queued_version", env_application_dir(env, app))
}

pub fn env_application_manifest(env: &EnvName, app: &AppName) -> String {
    format!("{}/manifests/manifests.yaml", env_application_dir(env, app))
}

pub fn application_locks_dir(env: &EnvName, app: &AppName) -> String {
    format!("{}/locks", env_application_dir(env, app))
}

pub fn application_lock(env: &EnvName, app: &AppName, id: &LockId) -> String {
    format!("{}/locks/{id}", env_application_dir(env, app))
}

pub fn team_locks_dir(env: &EnvName, team: &TeamName) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}/teams/{team}/locks")
}

pub fn team_lock(env: &EnvName, team: &TeamName, id: &LockId) -> String {
    format!("{ENVIRONMENTS_DIR}/{env}/teams/{team}/locks/{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_dir_paths_are_correct() {
        let layout = RepoLayout::new("/tmp/railhead-test");
        assert_eq!(layout.git_dir(), PathBuf::from("/tmp/railhead-test/repo.git"));
        assert_eq!(
            layout.events_db(),
            PathBuf::from("/tmp/railhead-test/events.sqlite")
        );
        assert_eq!(layout.lock_file(), PathBuf::from("/tmp/railhead-test/.lock"));
    }

    #[test]
    fn tree_paths_are_correct() {
        let app = AppName::new("api");
        let env = EnvName::new("dev");
        let team = TeamName::new("core");
        let id = LockId::new("freeze");
        assert_eq!(
            release_manifest(&app, 3, &env),
            "applications/api/releases/3/environments/dev/manifests.yaml"
        );
        assert_eq!(environment_config(&env), "environments/dev/config.json");
        assert_eq!(environment_lock(&env, &id), "environments/dev/locks/freeze");
        assert_eq!(
            application_lock(&env, &app, &id),
            "environments/dev/applications/api/locks/freeze"
        );
        assert_eq!(
            team_lock(&env, &team, &id),
            "environments/dev/teams/core/locks/freeze"
        );
        assert_eq!(
            queued_version_file(&env, &app),
            "environments/dev/applications/api/queued_version"
        );
    }

    #[test]
    fn initialize_writes_version() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path().join("work"));
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn version_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("format"), r#"{"format_version": 99}"#).unwrap();
        let layout = RepoLayout::new(dir.path());
        assert!(matches!(
            layout.verify_version(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
