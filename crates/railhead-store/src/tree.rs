use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// In-memory snapshot of a repository tree.
///
/// Paths are `/`-separated and relative to the tree root. Directories are
/// implied by the files below them, mirroring git, which cannot store an empty
/// directory. Blobs are shared between clones of a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    files: BTreeMap<String, Arc<[u8]>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TreeChange {
    Added(String),
    Modified(String),
    Removed(String),
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn dir_prefix(dir: &str) -> String {
    let dir = normalize(dir);
    if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    }
}

impl FileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(normalize(path)).map(AsRef::as_ref)
    }

    pub fn read_shared(&self, path: &str) -> Option<Arc<[u8]>> {
        self.files.get(normalize(path)).cloned()
    }

    pub fn write(&mut self, path: &str, content: impl AsRef<[u8]>) {
        self.files
            .insert(normalize(path).to_owned(), Arc::from(content.as_ref()));
    }

    pub fn write_shared(&mut self, path: &str, content: Arc<[u8]>) {
        self.files.insert(normalize(path).to_owned(), content);
    }

    /// Remove a single file. Returns whether it existed.
    pub fn remove(&mut self, path: &str) -> bool {
        self.files.remove(normalize(path)).is_some()
    }

    /// Remove every file below `dir`. Returns the number of files removed.
    pub fn remove_dir(&mut self, dir: &str) -> usize {
        let prefix = dir_prefix(dir);
        let doomed: Vec<String> = self
            .files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.files.remove(key);
        }
        doomed.len()
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.files.contains_key(normalize(path))
    }

    pub fn is_dir(&self, dir: &str) -> bool {
        let prefix = dir_prefix(dir);
        self.files
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.is_file(path) || self.is_dir(path)
    }

    /// Names of the immediate children (files and directories) of `dir`, sorted.
    pub fn list_dir(&self, dir: &str) -> Vec<String> {
        let prefix = dir_prefix(dir);
        let names: BTreeSet<&str> = self
            .files
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
            .collect();
        names.into_iter().map(str::to_owned).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// blake3 digest over every path and blob, in path order.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (path, content) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(content.len() as u64).to_le_bytes());
            hasher.update(content);
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Paths that differ between `self` (before) and `other` (after).
    pub fn diff(&self, other: &FileTree) -> Vec<TreeChange> {
        let mut changes = Vec::new();
        for (path, content) in &self.files {
            match other.files.get(path) {
                None => changes.push(TreeChange::Removed(path.clone())),
                Some(after) if after != content => {
                    changes.push(TreeChange::Modified(path.clone()));
                }
                Some(_) => {}
            }
        }
        for path in other.files.keys() {
            if !self.files.contains_key(path) {
                changes.push(TreeChange::Added(path.clone()));
            }
        }
        changes.sort();
        changes
    }
}
