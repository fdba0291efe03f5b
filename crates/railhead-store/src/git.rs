//! The git repository acting as system of record.
//!
//! The local side is a bare repository with a single branch. Every write is a
//! full tree built from a [`FileTree`]; the remote is only ever fast-forwarded.

use crate::credentials::Credentials;
use crate::state::State;
use crate::tree::FileTree;
use crate::StoreError;
use git2::{
    Direction, ErrorCode, FetchOptions, ObjectType, Oid, PushOptions, Repository, Signature,
    TreeWalkMode, TreeWalkResult,
};
use railhead_schema::{Actor, CommitId};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

const REMOTE_NAME: &str = "origin";
const FILE_MODE: i32 = 0o100_644;
const DIR_MODE: i32 = 0o040_000;

pub struct GitRepository {
    repo: Repository,
    branch: String,
    remote_url: Option<String>,
    credentials: Credentials,
}

enum Node<'a> {
    File(&'a [u8]),
    Dir(BTreeMap<&'a str, Node<'a>>),
}

fn insert_node<'a>(dir: &mut BTreeMap<&'a str, Node<'a>>, path: &'a str, content: &'a [u8]) {
    match path.split_once('/') {
        None => {
            dir.insert(path, Node::File(content));
        }
        Some((head, rest)) => {
            let child = dir
                .entry(head)
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            if let Node::Dir(children) = child {
                insert_node(children, rest, content);
            }
        }
    }
}

fn write_dir(repo: &Repository, dir: &BTreeMap<&str, Node<'_>>) -> Result<Oid, StoreError> {
    let mut builder = repo.treebuilder(None)?;
    for (name, node) in dir {
        match node {
            Node::File(content) => {
                let oid = repo.blob(content)?;
                builder.insert(*name, oid, FILE_MODE)?;
            }
            Node::Dir(children) => {
                let oid = write_dir(repo, children)?;
                builder.insert(*name, oid, DIR_MODE)?;
            }
        }
    }
    Ok(builder.write()?)
}

fn classify_push_status(reference: &str, status: &str) -> StoreError {
    let lowered = status.to_ascii_lowercase();
    if lowered.contains("non-fast-forward")
        || lowered.contains("fetch first")
        || lowered.contains("stale info")
    {
        StoreError::NonFastForward(status.to_owned())
    } else {
        StoreError::PushRejected {
            reference: reference.to_owned(),
            status: status.to_owned(),
        }
    }
}

fn classify_push_error(e: git2::Error) -> StoreError {
    let message = e.message().to_ascii_lowercase();
    if e.code() == ErrorCode::NotFastForward
        || message.contains("non-fastforwardable")
        || message.contains("non-fast-forward")
    {
        StoreError::NonFastForward(e.message().to_owned())
    } else {
        StoreError::Git(e)
    }
}

impl GitRepository {
    /// Open the bare repository at `git_dir`, creating it if necessary, and point
    /// its `origin` remote at `remote_url`.
    pub fn open(
        git_dir: &Path,
        branch: &str,
        remote_url: Option<&str>,
        credentials: Credentials,
    ) -> Result<Self, StoreError> {
        let repo = if git_dir.join("HEAD").exists() {
            Repository::open_bare(git_dir)?
        } else {
            info!("initializing bare repository at {}", git_dir.display());
            Repository::init_bare(git_dir)?
        };
        if let Some(url) = remote_url {
            match repo.find_remote(REMOTE_NAME) {
                Ok(existing) if existing.url() == Some(url) => {}
                Ok(_) => repo.remote_set_url(REMOTE_NAME, url)?,
                Err(_) => {
                    repo.remote(REMOTE_NAME, url)?;
                }
            }
        }
        Ok(Self {
            repo,
            branch: branch.to_owned(),
            remote_url: remote_url.map(str::to_owned),
            credentials,
        })
    }

    /// Open an existing repository for reading history only.
    pub fn open_readonly(git_dir: &Path, branch: &str) -> Result<Self, StoreError> {
        Ok(Self {
            repo: Repository::open_bare(git_dir)?,
            branch: branch.to_owned(),
            remote_url: None,
            credentials: Credentials::default(),
        })
    }

    pub fn path(&self) -> &Path {
        self.repo.path()
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn has_remote(&self) -> bool {
        self.remote_url.is_some()
    }

    fn local_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/{REMOTE_NAME}/{}", self.branch)
    }

    pub fn head(&self) -> Result<Option<Oid>, StoreError> {
        match self.repo.refname_to_id(&self.local_ref()) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Materialize the branch head into a [`State`].
    pub fn load_state(&self) -> Result<State, StoreError> {
        match self.head()? {
            Some(oid) => self.load_commit(oid),
            None => Ok(State::default()),
        }
    }

    /// Materialize any commit into a [`State`].
    /// A malformed or absent commit id is [`StoreError::UnknownCommit`].
    pub fn state_at(&self, commit: &CommitId) -> Result<State, StoreError> {
        let unknown = || StoreError::UnknownCommit(commit.to_string());
        let oid = Oid::from_str(commit).map_err(|_| unknown())?;
        match self.repo.find_commit(oid) {
            Ok(_) => self.load_commit(oid),
            Err(e) if e.code() == ErrorCode::NotFound => Err(unknown()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_commit(&self, oid: Oid) -> Result<State, StoreError> {
        let commit = self.repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let mut blobs: Vec<(String, Oid)> = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    blobs.push((format!("{root}{name}"), entry.id()));
                }
            }
            TreeWalkResult::Ok
        })?;
        let mut files = FileTree::new();
        for (path, blob_id) in blobs {
            let blob = self.repo.find_blob(blob_id)?;
            files.write(&path, blob.content());
        }
        debug!("loaded {} files at commit {oid}", files.len());
        Ok(State::new(Some(CommitId::new(oid.to_string())), files))
    }

    /// Create a commit of `tree` on top of `parent` and move the local branch to it.
    pub fn commit(
        &self,
        parent: Option<&CommitId>,
        tree: &FileTree,
        message: &str,
        author: &Actor,
        committer: &Actor,
    ) -> Result<CommitId, StoreError> {
        let mut root: BTreeMap<&str, Node<'_>> = BTreeMap::new();
        for (path, content) in tree.iter() {
            insert_node(&mut root, path, content);
        }
        let tree_id = write_dir(&self.repo, &root)?;
        let git_tree = self.repo.find_tree(tree_id)?;

        let author_sig = Signature::now(&author.name, &author.email)?;
        let committer_sig = Signature::now(&committer.name, &committer.email)?;
        let parent_commit = parent
            .map(|p| Oid::from_str(p).and_then(|oid| self.repo.find_commit(oid)))
            .transpose()?;
        let parents: Vec<&git2::Commit<'_>> = parent_commit.iter().collect();

        let oid = self.repo.commit(
            None,
            &author_sig,
            &committer_sig,
            message,
            &git_tree,
            &parents,
        )?;
        self.repo
            .reference(&self.local_ref(), oid, true, "railhead: commit")?;
        debug!("committed {oid} on {}", self.branch);
        Ok(CommitId::new(oid.to_string()))
    }

    /// Fetch the remote branch and point the local branch at it.
    ///
    /// A remote without the branch yet leaves an empty local branch.
    pub fn fetch_and_reset(&self) -> Result<(), StoreError> {
        if self.remote_url.is_none() {
            return Ok(());
        }
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        let local_ref = self.local_ref();

        let branch_exists = {
            let connection = remote.connect_auth(
                Direction::Fetch,
                Some(self.credentials.remote_callbacks()),
                None,
            )?;
            let heads = connection.list()?;
            heads.iter().any(|h| h.name() == local_ref)
        };
        if !branch_exists {
            debug!("remote has no branch {}, starting empty", self.branch);
            if let Ok(mut reference) = self.repo.find_reference(&local_ref) {
                reference.delete()?;
            }
            return Ok(());
        }

        let refspec = format!("+{local_ref}:{}", self.remote_ref());
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.credentials.remote_callbacks());
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;

        let remote_head = self.repo.refname_to_id(&self.remote_ref())?;
        self.repo
            .reference(&local_ref, remote_head, true, "railhead: reset to remote")?;
        info!("reset {} to remote head {remote_head}", self.branch);
        Ok(())
    }

    /// Move the local branch back to `target`, or delete it when `target` is
    /// `None`. Used to drop commits that were never pushed.
    pub fn reset_branch(&self, target: Option<&CommitId>) -> Result<(), StoreError> {
        let local_ref = self.local_ref();
        match target {
            Some(commit) => {
                let oid = Oid::from_str(commit)?;
                self.repo
                    .reference(&local_ref, oid, true, "railhead: discard unpushed")?;
            }
            None => {
                if let Ok(mut reference) = self.repo.find_reference(&local_ref) {
                    reference.delete()?;
                }
            }
        }
        debug!("reset {} to {target:?}", self.branch);
        Ok(())
    }

    /// Push the local branch. Non-fast-forward results surface as
    /// [`StoreError::NonFastForward`], other per-ref rejections as
    /// [`StoreError::PushRejected`].
    pub fn push(&self) -> Result<(), StoreError> {
        if self.remote_url.is_none() {
            return Ok(());
        }
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        let local_ref = self.local_ref();
        let refspec = format!("{local_ref}:{local_ref}");

        let mut rejected: Option<(String, String)> = None;
        let result = {
            let mut callbacks = self.credentials.remote_callbacks();
            callbacks.push_update_reference(|reference, status| {
                if let Some(status) = status {
                    rejected = Some((reference.to_owned(), status.to_owned()));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote.push(&[refspec.as_str()], Some(&mut options))
        };
        result.map_err(classify_push_error)?;
        if let Some((reference, status)) = rejected {
            return Err(classify_push_status(&reference, &status));
        }
        debug!("pushed {local_ref}");
        Ok(())
    }

    pub(crate) fn repository(&self) -> &Repository {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> Actor {
        Actor::new("Railhead", "railhead@example.com")
    }

    #[test]
    fn commit_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepository::open(&dir.path().join("repo.git"), "master", None, Credentials::default()).unwrap();
        assert!(repo.load_state().unwrap().commit().is_none());

        let mut tree = FileTree::new();
        tree.write("environments/dev/config.json", "{}");
        tree.write("applications/api/releases/1/source_author", "ada");
        tree.write("top", "level");
        let first = repo.commit(None, &tree, "first", &actor(), &actor()).unwrap();

        let state = repo.load_state().unwrap();
        assert_eq!(state.commit(), Some(&first));
        assert_eq!(state.tree(), &tree);

        tree.remove("top");
        let second = repo.commit(Some(&first), &tree, "second", &actor(), &actor()).unwrap();
        assert_eq!(repo.load_state().unwrap().tree(), &tree);

        let old = repo.state_at(&first).unwrap();
        assert!(old.tree().is_file("top"));
        assert_ne!(first, second);
    }

    #[test]
    fn state_at_unknown_commit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepository::open(&dir.path().join("repo.git"), "master", None, Credentials::default()).unwrap();
        let mut tree = FileTree::new();
        tree.write("top", "level");
        repo.commit(None, &tree, "first", &actor(), &actor()).unwrap();

        let missing = CommitId::new("ab".repeat(20));
        assert!(matches!(repo.state_at(&missing), Err(StoreError::UnknownCommit(c)) if c == missing.as_str()));
        let malformed = CommitId::new("not-hex");
        assert!(matches!(repo.state_at(&malformed), Err(StoreError::UnknownCommit(_))));
    }

    #[test]
    fn push_and_fetch_through_local_remote() {
        let dir = tempfile::tempdir().unwrap();
        let remote_dir = dir.path().join("remote.git");
        Repository::init_bare(&remote_dir).unwrap();
        let url = remote_dir.to_str().unwrap();

        let a = GitRepository::open(&dir.path().join("a.git"), "master", Some(url), Credentials::default()).unwrap();
        let b = GitRepository::open(&dir.path().join("b.git"), "master", Some(url), Credentials::default()).unwrap();

        a.fetch_and_reset().unwrap();
        let mut tree = FileTree::new();
        tree.write("file", "from a");
        let commit = a.commit(None, &tree, "a", &actor(), &actor()).unwrap();
        a.push().unwrap();

        b.fetch_and_reset().unwrap();
        let state = b.load_state().unwrap();
        assert_eq!(state.commit(), Some(&commit));
        assert_eq!(state.tree().read("file"), Some(&b"from a"[..]));
    }

    #[test]
    fn concurrent_push_is_non_fast_forward() {
        let dir = tempfile::tempdir().unwrap();
        let remote_dir = dir.path().join("remote.git");
        Repository::init_bare(&remote_dir).unwrap();
        let url = remote_dir.to_str().unwrap();

        let a = GitRepository::open(&dir.path().join("a.git"), "master", Some(url), Credentials::default()).unwrap();
        let b = GitRepository::open(&dir.path().join("b.git"), "master", Some(url), Credentials::default()).unwrap();

        let mut base = FileTree::new();
        base.write("file", "base");
        let root = a.commit(None, &base, "base", &actor(), &actor()).unwrap();
        a.push().unwrap();
        b.fetch_and_reset().unwrap();

        let mut ours = base.clone();
        ours.write("a", "1");
        a.commit(Some(&root), &ours, "a", &actor(), &actor()).unwrap();
        a.push().unwrap();

        let mut theirs = base.clone();
        theirs.write("b", "1");
        b.commit(Some(&root), &theirs, "b", &actor(), &actor()).unwrap();
        assert!(matches!(b.push(), Err(StoreError::NonFastForward(_))));

        b.fetch_and_reset().unwrap();
        assert!(b.load_state().unwrap().tree().is_file("a"));
    }

    #[test]
    fn reset_branch_drops_unpushed_commits() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitRepository::open(&dir.path().join("repo.git"), "master", None, Credentials::default()).unwrap();
        let mut tree = FileTree::new();
        tree.write("file", "one");
        let first = repo.commit(None, &tree, "first", &actor(), &actor()).unwrap();
        tree.write("file", "two");
        repo.commit(Some(&first), &tree, "second", &actor(), &actor()).unwrap();

        repo.reset_branch(Some(&first)).unwrap();
        assert_eq!(repo.load_state().unwrap().tree().read("file"), Some(&b"one"[..]));

        repo.reset_branch(None).unwrap();
        assert!(repo.head().unwrap().is_none());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_push_status("refs/heads/master", "rejected: non-fast-forward"),
            StoreError::NonFastForward(_)
        ));
        assert!(matches!(
            classify_push_status("refs/heads/master", "protected branch hook declined"),
            StoreError::PushRejected { .. }
        ));
    }
}
