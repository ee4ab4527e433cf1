//! In-process implementation of the collaborator contracts.
//!
//! [`MemoryRepository`] models a repository as a map of path to content:
//! a shared remote mainline, a local mainline copy, and one file map per
//! workspace forked from the local mainline. Merges are three-way per path
//! against the workspace's fork point. Every operation can be made to fail
//! transiently with [`MemoryRepository::fail_next`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collab::{
    InfraError, InfraResult, MainlineHandle, MainlinePublisher, MergeResult, ValidationReport,
    ValidationRunner, ValidationTarget, WorkspaceProvider,
};
use crate::model::ItemId;

/// Path to content.
pub type Files = BTreeMap<String, String>;

type ValidatorFn = Arc<dyn Fn(&Files) -> ValidationReport + Send + Sync>;

/// A commit recorded on the local mainline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub handle: MainlineHandle,
    pub message: String,
    pub item: ItemId,
    pub files: Files,
}

#[derive(Debug, Clone)]
struct Workspace {
    base: Files,
    files: Files,
}

impl Workspace {
    /// Paths edited since the fork point.
    fn changed_paths(&self) -> Vec<&String> {
        self.base
            .keys()
            .chain(self.files.keys())
            .filter(|path| self.base.get(*path) != self.files.get(*path))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Mainline contents plus the length of the commit log when they were taken.
#[derive(Clone)]
struct Snapshot {
    files: Files,
    commits: usize,
}

#[derive(Default)]
struct State {
    remote: Files,
    local: Files,
    commits: Vec<Commit>,
    snapshots: HashMap<String, Snapshot>,
    workspaces: BTreeMap<String, Workspace>,
    next_workspace: u64,
    next_snapshot: u64,
    failures: HashMap<String, u32>,
    validator: Option<ValidatorFn>,
}

impl State {
    /// Consume one injected failure for `operation`, if any.
    fn trip(&mut self, operation: &str) -> InfraResult<()> {
        match self.failures.get_mut(operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(InfraError::transient(operation, "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn workspace(&self, workspace: &str) -> InfraResult<&Workspace> {
        self.workspaces
            .get(workspace)
            .ok_or_else(|| InfraError::permanent("workspace", format!("unknown workspace '{workspace}'")))
    }
}

/// Workspaces, mainline, and validation over in-memory file maps.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryRepository")
            .field("files", &state.local.len())
            .field("commits", &state.commits.len())
            .field("workspaces", &state.workspaces.len())
            .finish_non_exhaustive()
    }
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `times` calls of `operation` fail transiently.
    ///
    /// Operation names: `create`, `diff`, `merge`, `destroy`, `sync`,
    /// `snapshot`, `restore`, `commit`, `publish`, `validate`.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.lock().failures.insert(operation.to_string(), times);
    }

    /// Replace the validation suite. The default passes everything.
    pub fn set_validator(
        &self,
        validator: impl Fn(&Files) -> ValidationReport + Send + Sync + 'static,
    ) {
        self.lock().validator = Some(Arc::new(validator));
    }

    /// Write `path` on both the remote and the local mainline.
    pub fn seed_mainline(&self, path: &str, content: &str) {
        let mut state = self.lock();
        state.remote.insert(path.to_string(), content.to_string());
        state.local.insert(path.to_string(), content.to_string());
    }

    /// Write `path` on the remote only, as another publisher would.
    pub fn push_external(&self, path: &str, content: &str) {
        self.lock()
            .remote
            .insert(path.to_string(), content.to_string());
    }

    /// Edit a file in a workspace.
    ///
    /// # Errors
    ///
    /// Permanent [`InfraError`] for an unknown workspace.
    pub fn write_file(&self, workspace: &str, path: &str, content: &str) -> InfraResult<()> {
        let mut state = self.lock();
        let ws = state
            .workspaces
            .get_mut(workspace)
            .ok_or_else(|| InfraError::permanent("write", format!("unknown workspace '{workspace}'")))?;
        ws.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    /// Delete a file in a workspace.
    ///
    /// # Errors
    ///
    /// Permanent [`InfraError`] for an unknown workspace.
    pub fn remove_file(&self, workspace: &str, path: &str) -> InfraResult<()> {
        let mut state = self.lock();
        let ws = state
            .workspaces
            .get_mut(workspace)
            .ok_or_else(|| InfraError::permanent("write", format!("unknown workspace '{workspace}'")))?;
        ws.files.remove(path);
        Ok(())
    }

    /// Local mainline contents.
    #[must_use]
    pub fn mainline(&self) -> Files {
        self.lock().local.clone()
    }

    #[must_use]
    pub fn mainline_file(&self, path: &str) -> Option<String> {
        self.lock().local.get(path).cloned()
    }

    /// Remote mainline contents.
    #[must_use]
    pub fn published(&self) -> Files {
        self.lock().remote.clone()
    }

    #[must_use]
    pub fn commits(&self) -> Vec<Commit> {
        self.lock().commits.clone()
    }

    #[must_use]
    pub fn workspace_count(&self) -> usize {
        self.lock().workspaces.len()
    }

    #[must_use]
    pub fn has_workspace(&self, workspace: &str) -> bool {
        self.lock().workspaces.contains_key(workspace)
    }
}

impl WorkspaceProvider for MemoryRepository {
    fn create(&self, item: &ItemId) -> InfraResult<String> {
        let mut state = self.lock();
        state.trip("create")?;
        state.next_workspace += 1;
        let name = format!("ws-{item}-{}", state.next_workspace);
        let fork = state.local.clone();
        state.workspaces.insert(
            name.clone(),
            Workspace {
                base: fork.clone(),
                files: fork,
            },
        );
        Ok(name)
    }

    fn has_changes(&self, workspace: &str) -> InfraResult<bool> {
        let mut state = self.lock();
        state.trip("diff")?;
        let ws = state.workspace(workspace)?;
        Ok(ws
            .changed_paths()
            .into_iter()
            .any(|path| ws.files.get(path) != state.local.get(path)))
    }

    fn merge(&self, workspace: &str) -> InfraResult<MergeResult> {
        let mut state = self.lock();
        state.trip("merge")?;
        let ws = state.workspace(workspace)?.clone();
        let changed = ws.changed_paths();

        let conflicts: Vec<String> = changed
            .iter()
            .filter(|path| {
                let ours = state.local.get(**path);
                ours != ws.base.get(**path) && ours != ws.files.get(**path)
            })
            .map(|path| (*path).clone())
            .collect();
        if !conflicts.is_empty() {
            return Ok(MergeResult::Conflict {
                detail: format!("automatic merge failed in {} file(s)", conflicts.len()),
                paths: conflicts,
            });
        }

        for path in changed {
            match ws.files.get(path) {
                Some(content) => {
                    state.local.insert(path.clone(), content.clone());
                }
                None => {
                    state.local.remove(path);
                }
            }
        }
        Ok(MergeResult::Merged)
    }

    fn destroy(&self, workspace: &str) -> InfraResult<()> {
        let mut state = self.lock();
        state.trip("destroy")?;
        state.workspaces.remove(workspace);
        Ok(())
    }
}

impl MainlinePublisher for MemoryRepository {
    fn sync(&self) -> InfraResult<()> {
        let mut state = self.lock();
        state.trip("sync")?;
        state.local = state.remote.clone();
        Ok(())
    }

    fn snapshot(&self) -> InfraResult<MainlineHandle> {
        let mut state = self.lock();
        state.trip("snapshot")?;
        state.next_snapshot += 1;
        let handle = format!("snap-{}", state.next_snapshot);
        let snapshot = Snapshot {
            files: state.local.clone(),
            commits: state.commits.len(),
        };
        state.snapshots.insert(handle.clone(), snapshot);
        Ok(MainlineHandle(handle))
    }

    fn restore(&self, handle: &MainlineHandle) -> InfraResult<()> {
        let mut state = self.lock();
        state.trip("restore")?;
        let snapshot = state
            .snapshots
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| InfraError::permanent("restore", format!("unknown snapshot {handle}")))?;
        state.local = snapshot.files;
        state.commits.truncate(snapshot.commits);
        Ok(())
    }

    fn commit(&self, message: &str, item: &ItemId) -> InfraResult<MainlineHandle> {
        let mut state = self.lock();
        state.trip("commit")?;
        let handle = MainlineHandle(format!("c{}", state.commits.len() + 1));
        let files = state.local.clone();
        state.commits.push(Commit {
            handle: handle.clone(),
            message: message.to_string(),
            item: item.clone(),
            files: files.clone(),
        });
        let snapshot = Snapshot {
            files,
            commits: state.commits.len(),
        };
        state.snapshots.insert(handle.0.clone(), snapshot);
        Ok(handle)
    }

    fn publish(&self) -> InfraResult<()> {
        let mut state = self.lock();
        state.trip("publish")?;
        state.remote = state.local.clone();
        Ok(())
    }
}

impl ValidationRunner for MemoryRepository {
    fn run(&self, _target: &ValidationTarget<'_>) -> InfraResult<ValidationReport> {
        let (validator, files) = {
            let mut state = self.lock();
            state.trip("validate")?;
            (state.validator.clone(), state.local.clone())
        };
        Ok(validator.map_or_else(ValidationReport::pass, |check| check(&files)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> ItemId {
        ItemId::new_unchecked(raw)
    }

    #[test]
    fn fresh_workspace_has_no_changes() {
        let repo = MemoryRepository::new();
        repo.seed_mainline("a", "1");
        let ws = repo.create(&id("x")).unwrap();
        assert!(!repo.has_changes(&ws).unwrap());
        repo.write_file(&ws, "a", "2").unwrap();
        assert!(repo.has_changes(&ws).unwrap());
    }

    #[test]
    fn disjoint_edits_merge_cleanly() {
        let repo = MemoryRepository::new();
        repo.seed_mainline("a", "1");
        repo.seed_mainline("b", "1");
        let one = repo.create(&id("one")).unwrap();
        let two = repo.create(&id("two")).unwrap();
        repo.write_file(&one, "a", "one").unwrap();
        repo.remove_file(&two, "b").unwrap();

        assert_eq!(repo.merge(&one).unwrap(), MergeResult::Merged);
        assert_eq!(repo.merge(&two).unwrap(), MergeResult::Merged);
        assert_eq!(repo.mainline_file("a").as_deref(), Some("one"));
        assert_eq!(repo.mainline_file("b"), None);
    }

    #[test]
    fn overlapping_edits_conflict_without_touching_mainline() {
        let repo = MemoryRepository::new();
        repo.seed_mainline("a", "1");
        let one = repo.create(&id("one")).unwrap();
        let two = repo.create(&id("two")).unwrap();
        repo.write_file(&one, "a", "one").unwrap();
        repo.write_file(&two, "a", "two").unwrap();
        repo.merge(&one).unwrap();
        let before = repo.mainline();

        let MergeResult::Conflict { paths, .. } = repo.merge(&two).unwrap() else {
            panic!("expected conflict");
        };
        assert_eq!(paths, vec!["a".to_string()]);
        assert_eq!(repo.mainline(), before);
    }

    #[test]
    fn restore_returns_to_snapshot() {
        let repo = MemoryRepository::new();
        repo.seed_mainline("a", "1");
        let snap = repo.snapshot().unwrap();
        let ws = repo.create(&id("x")).unwrap();
        repo.write_file(&ws, "a", "2").unwrap();
        repo.merge(&ws).unwrap();
        repo.commit("m", &id("x")).unwrap();
        repo.restore(&snap).unwrap();
        assert_eq!(repo.mainline_file("a").as_deref(), Some("1"));
        assert!(repo.published().get("a").is_some_and(|v| v == "1"));
        assert!(repo.commits().is_empty());
    }

    #[test]
    fn sync_picks_up_external_pushes() {
        let repo = MemoryRepository::new();
        repo.push_external("a", "remote");
        assert_eq!(repo.mainline_file("a"), None);
        repo.sync().unwrap();
        assert_eq!(repo.mainline_file("a").as_deref(), Some("remote"));
    }

    #[test]
    fn injected_failures_are_transient_and_counted() {
        let repo = MemoryRepository::new();
        repo.fail_next("publish", 2);
        assert!(repo.publish().unwrap_err().transient);
        assert!(repo.publish().is_err());
        assert!(repo.publish().is_ok());
    }
}
