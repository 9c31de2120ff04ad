//! Script types and data structures.

use std::collections::HashMap;
use std::path::PathBuf;

/// How a file takes part in loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// `.ext` file, loaded before all regular scripts.
    Extension,
    /// `.lua` file.
    Script,
}

/// Which states a script is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptScope {
    /// Loaded into every state.
    AllMaps,
    /// Loaded only into states of this map (numeric top-level folder).
    Map(u32),
}

impl ScriptScope {
    pub fn applies_to(self, map_id: u32) -> bool {
        match self {
            ScriptScope::AllMaps => true,
            ScriptScope::Map(id) => id == map_id,
        }
    }
}

/// A Lua source file read from the script directory.
#[derive(Debug, Clone)]
pub struct LuaScript {
    /// Module name (file stem); also its `package.loaded` key.
    pub name: String,
    /// Full path on disk.
    pub path: PathBuf,
    pub kind: ScriptKind,
    pub scope: ScriptScope,
    /// File contents.
    pub source: String,
    /// Content hash for change detection.
    pub hash: String,
}

/// Every script found by one scan, in load order.
#[derive(Debug, Clone, Default)]
pub struct ScriptSet {
    /// Extensions first, then scripts; each group sorted by path.
    pub scripts: Vec<LuaScript>,
    /// `package.path` value covering every scanned directory.
    pub require_path: String,
    /// (path, message) pairs for entries that could not be read.
    pub errors: Vec<(String, String)>,
}

impl ScriptSet {
    /// Scripts to run in a state of `map_id`, in load order.
    pub fn for_map(&self, map_id: u32) -> impl Iterator<Item = &LuaScript> {
        self.scripts
            .iter()
            .filter(move |script| script.scope.applies_to(map_id))
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Compare against a newer scan.
    pub fn diff(&self, newer: &ScriptSet) -> SyncResult {
        let old: HashMap<&PathBuf, &str> = self
            .scripts
            .iter()
            .map(|s| (&s.path, s.hash.as_str()))
            .collect();
        let new: HashMap<&PathBuf, &str> = newer
            .scripts
            .iter()
            .map(|s| (&s.path, s.hash.as_str()))
            .collect();

        let mut result = SyncResult {
            errors: newer.errors.clone(),
            ..SyncResult::default()
        };
        for (path, hash) in &new {
            match old.get(path) {
                None => result.added += 1,
                Some(previous) if previous != hash => result.updated += 1,
                Some(_) => {}
            }
        }
        result.removed = old.keys().filter(|path| !new.contains_key(*path)).count();
        result
    }
}

/// Changes between two scans of the script directory.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Number of scripts added.
    pub added: usize,
    /// Number of scripts updated.
    pub updated: usize,
    /// Number of scripts removed.
    pub removed: usize,
    /// Errors encountered during the scan.
    pub errors: Vec<(String, String)>,
}

impl SyncResult {
    /// Check if any changes were made.
    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.updated > 0 || self.removed > 0
    }

    /// Total number of changes.
    pub fn total_changes(&self) -> usize {
        self.added + self.updated + self.removed
    }
}

/// Outcome of running a script set in one state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Scripts executed successfully.
    pub executed: usize,
    /// Scripts skipped as duplicates or already required.
    pub skipped: usize,
    /// Scripts that raised an error.
    pub failed: usize,
}
