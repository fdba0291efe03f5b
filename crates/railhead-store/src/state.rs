use crate::layout;
use crate::tree::FileTree;
use crate::StoreError;
use chrono::{DateTime, Utc};
use railhead_schema::{
    Actor, AppName, CommitId, Deployment, EnvName, EnvironmentConfig, Lock, LockId, Release,
    TeamName, Version,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable snapshot of all deployment data, pinned to the commit it was read from.
///
/// Readers share snapshots freely; transformers mutate a private clone which
/// the engine turns into the next commit. `commit` is `None` only for a branch
/// that has no commits yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    commit: Option<CommitId>,
    tree: FileTree,
}

fn parse_version(path: &str, raw: &str) -> Result<Version, StoreError> {
    raw.trim()
        .parse::<Version>()
        .map_err(|e| StoreError::corrupt(path, e))
}

impl State {
    pub fn new(commit: Option<CommitId>, tree: FileTree) -> Self {
        Self { commit, tree }
    }

    pub fn commit(&self) -> Option<&CommitId> {
        self.commit.as_ref()
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn into_tree(self) -> FileTree {
        self.tree
    }

    pub fn digest(&self) -> String {
        self.tree.digest()
    }

    fn read_str(&self, path: &str) -> Result<Option<&str>, StoreError> {
        match self.tree.read(path) {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt(path, e)),
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StoreError> {
        match self.tree.read(path) {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| StoreError::corrupt(path, e)),
        }
    }

    fn read_version(&self, path: &str) -> Result<Option<Version>, StoreError> {
        self.read_str(path)?
            .map(|raw| parse_version(path, raw))
            .transpose()
    }

    fn read_locks(&self, dir: &str) -> Result<BTreeMap<LockId, Lock>, StoreError> {
        let mut locks = BTreeMap::new();
        for id in self.tree.list_dir(dir) {
            let path = format!("{dir}/{id}");
            if let Some(lock) = self.read_json::<Lock>(&path)? {
                locks.insert(LockId::new(id), lock);
            }
        }
        Ok(locks)
    }

    fn write_json<T: serde::Serialize>(&mut self, path: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(value)?;
        self.tree.write(path, json);
        Ok(())
    }

    // Environments

    pub fn environment_names(&self) -> Vec<EnvName> {
        self.tree
            .list_dir(layout::ENVIRONMENTS_DIR)
            .into_iter()
            .map(EnvName::new)
            .filter(|env| self.environment_exists(env))
            .collect()
    }

    pub fn environment_exists(&self, env: &EnvName) -> bool {
        self.tree.is_file(&layout::environment_config(env))
    }

    pub fn environment_config(
        &self,
        env: &EnvName,
    ) -> Result<Option<EnvironmentConfig>, StoreError> {
        self.read_json(&layout::environment_config(env))
    }

    pub fn environment_configs(&self) -> Result<BTreeMap<EnvName, EnvironmentConfig>, StoreError> {
        let mut configs = BTreeMap::new();
        for env in self.environment_names() {
            if let Some(config) = self.environment_config(&env)? {
                configs.insert(env, config);
            }
        }
        Ok(configs)
    }

    pub fn write_environment_config(
        &mut self,
        env: &EnvName,
        config: &EnvironmentConfig,
    ) -> Result<(), StoreError> {
        self.write_json(&layout::environment_config(env), config)
    }

    // Applications and releases

    pub fn applications(&self) -> Vec<AppName> {
        self.tree
            .list_dir(layout::APPLICATIONS_DIR)
            .into_iter()
            .map(AppName::new)
            .collect()
    }

    pub fn team_owner(&self, app: &AppName) -> Result<Option<TeamName>, StoreError> {
        Ok(self
            .read_str(&layout::team_file(app))?
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(TeamName::new))
    }

    pub fn set_team_owner(&mut self, app: &AppName, team: &TeamName) {
        self.tree.write(&layout::team_file(app), team.as_str());
    }

    /// Release versions of `app`, ascending.
    pub fn release_versions(&self, app: &AppName) -> Result<Vec<Version>, StoreError> {
        let dir = layout::releases_dir(app);
        let mut versions = self
            .tree
            .list_dir(&dir)
            .iter()
            .map(|name| parse_version(&format!("{dir}/{name}"), name))
            .collect::<Result<Vec<_>, _>>()?;
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest_release(&self, app: &AppName) -> Result<Option<Version>, StoreError> {
        Ok(self.release_versions(app)?.last().copied())
    }

    pub fn release_exists(&self, app: &AppName, version: Version) -> bool {
        self.tree.is_dir(&layout::release_dir(app, version))
    }

    pub fn release(&self, app: &AppName, version: Version) -> Result<Option<Release>, StoreError> {
        if !self.release_exists(app, version) {
            return Ok(None);
        }
        let dir = layout::release_dir(app, version);
        let field = |name: &str| -> Result<String, StoreError> {
            Ok(self
                .read_str(&format!("{dir}/{name}"))?
                .unwrap_or_default()
                .to_owned())
        };
        let source_commit_id = Some(field("source_commit_id")?)
            .filter(|c| !c.is_empty())
            .map(CommitId::new);
        let created_at = match self.read_str(&format!("{dir}/created_at"))? {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| StoreError::corrupt(&format!("{dir}/created_at"), e))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Some(Release {
            version,
            source_commit_id,
            source_author: field("source_author")?,
            source_message: field("source_message")?,
            display_version: field("display_version")?,
            created_at,
            undeploy: self.tree.is_file(&format!("{dir}/undeploy")),
        }))
    }

    pub fn release_manifests(
        &self,
        app: &AppName,
        version: Version,
    ) -> BTreeMap<EnvName, Arc<[u8]>> {
        let dir = layout::release_environments_dir(app, version);
        self.tree
            .list_dir(&dir)
            .into_iter()
            .map(EnvName::new)
            .filter_map(|env| {
                self.tree
                    .read_shared(&layout::release_manifest(app, version, &env))
                    .map(|m| (env, m))
            })
            .collect()
    }

    pub fn release_manifest(
        &self,
        app: &AppName,
        version: Version,
        env: &EnvName,
    ) -> Option<Arc<[u8]>> {
        self.tree
            .read_shared(&layout::release_manifest(app, version, env))
    }

    pub fn write_release(
        &mut self,
        app: &AppName,
        release: &Release,
        manifests: &BTreeMap<EnvName, String>,
    ) {
        let dir = layout::release_dir(app, release.version);
        if let Some(commit) = &release.source_commit_id {
            self.tree
                .write(&format!("{dir}/source_commit_id"), commit.as_str());
        }
        if !release.source_author.is_empty() {
            self.tree
                .write(&format!("{dir}/source_author"), &release.source_author);
        }
        if !release.source_message.is_empty() {
            self.tree
                .write(&format!("{dir}/source_message"), &release.source_message);
        }
        if !release.display_version.is_empty() {
            self.tree
                .write(&format!("{dir}/display_version"), &release.display_version);
        }
        if let Some(created_at) = release.created_at {
            self.tree
                .write(&format!("{dir}/created_at"), created_at.to_rfc3339());
        }
        if release.undeploy {
            self.tree.write(&format!("{dir}/undeploy"), "");
        }
        for (env, manifest) in manifests {
            self.tree
                .write(&layout::release_manifest(app, release.version, env), manifest);
        }
    }

    pub fn delete_release(&mut self, app: &AppName, version: Version) -> bool {
        self.tree.remove_dir(&layout::release_dir(app, version)) > 0
    }

    // Per-environment application state

    pub fn environment_applications(&self, env: &EnvName) -> Vec<AppName> {
        self.tree
            .list_dir(&layout::env_applications_dir(env))
            .into_iter()
            .map(AppName::new)
            .collect()
    }

    pub fn deployed_version(
        &self,
        env: &EnvName,
        app: &AppName,
    ) -> Result<Option<Version>, StoreError> {
        self.read_version(&layout::deployed_version_file(env, app))
    }

    pub fn deployment(&self, env: &EnvName, app: &AppName) -> Result<Option<Deployment>, StoreError> {
        let Some(version) = self.deployed_version(env, app)? else {
            return Ok(None);
        };
        let dir = layout::env_application_dir(env, app);
        let text = |name: &str| -> Result<Option<String>, StoreError> {
            Ok(self.read_str(&format!("{dir}/{name}"))?.map(str::to_owned))
        };
        let deployed_at = match text("deployed_at_utc")? {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|e| StoreError::corrupt(&format!("{dir}/deployed_at_utc"), e))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Some(Deployment {
            version,
            deployed_by: Actor {
                name: text("deployed_by")?.unwrap_or_default(),
                email: text("deployed_by_email")?.unwrap_or_default(),
            },
            deployed_at,
            ci_link: text("ci_link")?,
        }))
    }

    /// Point `(env, app)` at a release and copy its manifest next to the pointer.
    pub fn write_deployment(
        &mut self,
        env: &EnvName,
        app: &AppName,
        deployment: &Deployment,
        manifest: Option<Arc<[u8]>>,
    ) {
        let dir = layout::env_application_dir(env, app);
        self.tree.write(
            &layout::deployed_version_file(env, app),
            deployment.version.to_string(),
        );
        self.tree
            .write(&format!("{dir}/deployed_by"), &deployment.deployed_by.name);
        self.tree.write(
            &format!("{dir}/deployed_by_email"),
            &deployment.deployed_by.email,
        );
        match deployment.deployed_at {
            Some(at) => self
                .tree
                .write(&format!("{dir}/deployed_at_utc"), at.to_rfc3339()),
            None => {
                self.tree.remove(&format!("{dir}/deployed_at_utc"));
            }
        }
        match &deployment.ci_link {
            Some(link) => self.tree.write(&format!("{dir}/ci_link"), link),
            None => {
                self.tree.remove(&format!("{dir}/ci_link"));
            }
        }
        let manifest_path = layout::env_application_manifest(env, app);
        match manifest {
            Some(content) => self.tree.write_shared(&manifest_path, content),
            None => {
                self.tree.remove(&manifest_path);
            }
        }
    }

    pub fn queued_version(&self, env: &EnvName, app: &AppName) -> Result<Option<Version>, StoreError> {
        self.read_version(&layout::queued_version_file(env, app))
    }

    pub fn set_queued_version(&mut self, env: &EnvName, app: &AppName, version: Version) {
        self.tree
            .write(&layout::queued_version_file(env, app), version.to_string());
    }

    pub fn delete_queued_version(&mut self, env: &EnvName, app: &AppName) -> bool {
        self.tree.remove(&layout::queued_version_file(env, app))
    }

    // Locks

    pub fn environment_locks(&self, env: &EnvName) -> Result<BTreeMap<LockId, Lock>, StoreError> {
        self.read_locks(&layout::environment_locks_dir(env))
    }

    pub fn application_locks(
        &self,
        env: &EnvName,
        app: &AppName,
    ) -> Result<BTreeMap<LockId, Lock>, StoreError> {
        self.read_locks(&layout::application_locks_dir(env, app))
    }

    pub fn team_locks(
        &self,
        env: &EnvName,
        team: &TeamName,
    ) -> Result<BTreeMap<LockId, Lock>, StoreError> {
        self.read_locks(&layout::team_locks_dir(env, team))
    }

    pub fn write_environment_lock(
        &mut self,
        env: &EnvName,
        id: &LockId,
        lock: &Lock,
    ) -> Result<(), StoreError> {
        self.write_json(&layout::environment_lock(env, id), lock)
    }

    pub fn delete_environment_lock(&mut self, env: &EnvName, id: &LockId) -> bool {
        self.tree.remove(&layout::environment_lock(env, id))
    }

    pub fn write_application_lock(
        &mut self,
        env: &EnvName,
        app: &AppName,
        id: &LockId,
        lock: &Lock,
    ) -> Result<(), StoreError> {
        self.write_json(&layout::application_lock(env, app, id), lock)
    }

    pub fn delete_application_lock(&mut self, env: &EnvName, app: &AppName, id: &LockId) -> bool {
        self.tree.remove(&layout::application_lock(env, app, id))
    }

    pub fn write_team_lock(
        &mut self,
        env: &EnvName,
        team: &TeamName,
        id: &LockId,
        lock: &Lock,
    ) -> Result<(), StoreError> {
        self.write_json(&layout::team_lock(env, team, id), lock)
    }

    pub fn delete_team_lock(&mut self, env: &EnvName, team: &TeamName, id: &LockId) -> bool {
        self.tree.remove(&layout::team_lock(env, team, id))
    }
}
