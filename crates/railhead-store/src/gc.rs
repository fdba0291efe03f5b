use crate::git::GitRepository;
use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Repacks the repository so that per-write loose objects do not pile up.
pub struct GarbageCollector {
    git_dir: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub loose_before: usize,
    pub packs_before: usize,
    pub loose_after: usize,
    pub packs_after: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ObjectCounts {
    loose: usize,
    packs: usize,
}

fn count_objects(git_dir: &Path) -> Result<ObjectCounts, StoreError> {
    let objects = git_dir.join("objects");
    let mut counts = ObjectCounts::default();
    if !objects.is_dir() {
        return Ok(counts);
    }
    for entry in fs::read_dir(&objects)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == "pack" {
            counts.packs = fs::read_dir(entry.path())?
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "pack"))
                .count();
        } else if name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
            counts.loose += fs::read_dir(entry.path())?.count();
        }
    }
    Ok(counts)
}

impl GarbageCollector {
    pub fn new(git_dir: impl Into<PathBuf>) -> Self {
        Self {
            git_dir: git_dir.into(),
        }
    }

    pub fn for_repository(repo: &GitRepository) -> Self {
        Self::new(repo.repository().path())
    }

    /// Run `git repack -a -d` against the repository.
    pub fn repack(&self) -> Result<GcReport, StoreError> {
        let started = Instant::now();
        let before = count_objects(&self.git_dir)?;
        debug!(
            "repacking {}: {} loose objects, {} packs",
            self.git_dir.display(),
            before.loose,
            before.packs
        );

        let output = Command::new("git")
            .arg("repack")
            .arg("-a")
            .arg("-d")
            .env("GIT_DIR", &self.git_dir)
            .current_dir(&self.git_dir)
            .output()
            .map_err(|e| StoreError::Gc(format!("spawning git: {e}")))?;
        if !output.status.success() {
            return Err(StoreError::Gc(format!(
                "git repack exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let after = count_objects(&self.git_dir)?;
        let report = GcReport {
            loose_before: before.loose,
            packs_before: before.packs,
            loose_after: after.loose,
            packs_after: after.packs,
            elapsed: started.elapsed(),
        };
        info!(
            "repacked repository: loose objects {} -> {}, packs {} -> {}",
            report.loose_before, report.loose_after, report.packs_before, report.packs_after
        );
        Ok(report)
    }
}
