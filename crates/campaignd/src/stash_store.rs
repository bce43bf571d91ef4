//! Persisted stash registry.
//!
//! `<state_dir>/stashes.json` holds `{counter, stashes}` and is the source of
//! truth across restarts. Writes go through a temp file in the same directory,
//! fsync, then rename, so a crash never leaves a half-written registry.

use campaign_core::GitStash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

const REGISTRY_FILE: &str = "stashes.json";

#[derive(Debug, Error)]
pub enum StashStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stash registry: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to replace stash registry: {0}")]
    Persist(#[from] tempfile::PersistError),
}

pub type Result<T> = std::result::Result<T, StashStoreError>;

/// In-memory registry: monotonic counter plus stashes by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashRegistry {
    pub counter: u64,
    pub stashes: BTreeMap<String, GitStash>,
}

impl StashRegistry {
    /// Bump and return the counter. Never reused, even after drops.
    pub fn next_sequence(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    pub fn insert(&mut self, stash: GitStash) {
        self.stashes.insert(stash.id.clone(), stash);
    }

    pub fn remove(&mut self, id: &str) -> Option<GitStash> {
        self.stashes.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&GitStash> {
        self.stashes.get(id)
    }

    pub fn len(&self) -> usize {
        self.stashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stashes.is_empty()
    }

    /// Stashes oldest first.
    pub fn ordered(&self) -> Vec<&GitStash> {
        let mut stashes: Vec<&GitStash> = self.stashes.values().collect();
        stashes.sort_by_key(|s| s.sequence);
        stashes
    }

    pub fn latest(&self) -> Option<&GitStash> {
        self.stashes.values().max_by_key(|s| s.sequence)
    }

    pub fn latest_for_phase(&self, phase: &str) -> Option<&GitStash> {
        self.stashes
            .values()
            .filter(|s| stash_phase(&s.id).as_deref() == Some(phase))
            .max_by_key(|s| s.sequence)
    }
}

/// Compose a stash id: `campaign[-<phase>]-<counter>-<timestamp_ms>`.
pub fn compose_stash_id(phase: Option<&str>, counter: u64, timestamp_ms: i64) -> String {
    match phase {
        Some(phase) => format!("campaign-{phase}-{counter}-{timestamp_ms}"),
        None => format!("campaign-{counter}-{timestamp_ms}"),
    }
}

/// Phase encoded in a stash id, if any.
pub fn stash_phase(id: &str) -> Option<String> {
    let rest = id.strip_prefix("campaign-")?;
    let mut parts: Vec<&str> = rest.rsplitn(3, '-').collect();
    if parts.len() < 3 {
        return None;
    }
    let phase = parts.pop()?;
    (!phase.is_empty()).then(|| phase.to_string())
}

/// File-backed registry location.
#[derive(Debug, Clone)]
pub struct StashStore {
    state_dir: PathBuf,
}

impl StashStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.state_dir.join(REGISTRY_FILE)
    }

    /// Create the state directory with a self-ignoring `.gitignore` so that
    /// stash, clean and reset never touch campaign state.
    pub fn ensure_state_dir(&self) -> Result<()> {
        ensure_ignored_dir(&self.state_dir)
    }

    /// Load the registry; a missing file is an empty registry.
    pub fn load(&self) -> Result<StashRegistry> {
        let path = self.path();
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StashRegistry::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, registry: &StashRegistry) -> Result<()> {
        self.ensure_state_dir()?;
        let json = serde_json::to_vec_pretty(registry)?;

        let mut temp = NamedTempFile::new_in(&self.state_dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(self.path())?;

        debug!(
            path = %self.path().display(),
            stashes = registry.len(),
            counter = registry.counter,
            "stash registry saved"
        );
        Ok(())
    }
}

/// Create `dir` holding a `.gitignore` that ignores everything in it.
pub fn ensure_ignored_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let gitignore = dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(gitignore, "*\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn stash(id: &str, sequence: u64) -> GitStash {
        GitStash {
            id: id.to_string(),
            description: format!("checkpoint {sequence}"),
            created_at: Utc::now(),
            branch: "main".to_string(),
            sequence,
            phase: stash_phase(id),
            base_commit: "abc".to_string(),
            stash_ref: Some(format!("sha{sequence}")),
        }
    }

    #[test]
    fn stash_ids_encode_phase_and_counter() {
        assert_eq!(
            compose_stash_id(Some("phase1"), 3, 1700),
            "campaign-phase1-3-1700"
        );
        assert_eq!(compose_stash_id(None, 4, 1800), "campaign-4-1800");
    }

    #[test]
    fn phase_is_parsed_from_id() {
        assert_eq!(stash_phase("campaign-phase1-3-1700").as_deref(), Some("phase1"));
        assert_eq!(
            stash_phase("campaign-lint-cleanup-12-1700").as_deref(),
            Some("lint-cleanup")
        );
        assert_eq!(stash_phase("campaign-4-1800"), None);
        assert_eq!(stash_phase("other-1-2"), None);
    }

    #[test]
    fn counter_is_monotonic() {
        let mut registry = StashRegistry::default();
        let a = registry.next_sequence();
        let b = registry.next_sequence();
        assert!(b > a);
    }

    #[test]
    fn latest_and_latest_for_phase_use_sequence() {
        let mut registry = StashRegistry::default();
        registry.insert(stash("campaign-phase1-1-100", 1));
        registry.insert(stash("campaign-phase2-2-200", 2));
        registry.insert(stash("campaign-phase1-3-300", 3));
        registry.insert(stash("campaign-4-400", 4));

        assert_eq!(registry.latest().unwrap().id, "campaign-4-400");
        assert_eq!(
            registry.latest_for_phase("phase1").unwrap().id,
            "campaign-phase1-3-300"
        );
        assert!(registry.latest_for_phase("phase9").is_none());
        let ordered: Vec<u64> = registry.ordered().iter().map(|s| s.sequence).collect();
        assert_eq!(ordered, vec![1, 2, 3, 4]);
    }

    #[test]
    fn missing_file_loads_empty_registry() {
        let dir = TempDir::new().unwrap();
        let store = StashStore::new(dir.path().join("state"));
        assert_eq!(store.load().unwrap(), StashRegistry::default());
    }

    #[test]
    fn save_then_load_preserves_registry_and_ignores_state() {
        let dir = TempDir::new().unwrap();
        let store = StashStore::new(dir.path().join("state"));
        let mut registry = StashRegistry::default();
        registry.next_sequence();
        registry.insert(stash("campaign-phase1-1-100", 1));
        store.save(&registry).unwrap();

        assert_eq!(store.load().unwrap(), registry);
        let gitignore = std::fs::read_to_string(dir.path().join("state/.gitignore")).unwrap();
        assert_eq!(gitignore, "*\n");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name != "stashes.json" && name != ".gitignore")
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn corrupt_registry_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = StashStore::new(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(StashStoreError::Json(_))));
    }
}
