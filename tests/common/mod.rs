//! Test helpers for state integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use mapstate::{Config, StateKey, StateRegistry};

/// Registry with default configuration and no scripts.
pub fn empty_registry() -> Arc<StateRegistry> {
    Arc::new(StateRegistry::new(&Config::default()))
}

/// Script directory populated from `(relative path, source)` pairs.
pub fn script_dir(files: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().unwrap();
    for (relative, source) in files {
        let path = temp.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, source).unwrap();
    }
    temp
}

/// Configuration pointing at `dir`.
pub fn config_for(dir: &Path) -> Config {
    let mut config = Config::default();
    config.engine.script_path = dir.to_string_lossy().to_string();
    config
}

/// Registry that loads the scripts in `dir`.
pub fn registry_for(dir: &Path) -> Arc<StateRegistry> {
    Arc::new(StateRegistry::load(&config_for(dir)).unwrap())
}

/// Run Lua in an existing state.
pub fn exec(registry: &StateRegistry, key: StateKey, source: &str) {
    registry
        .get(key)
        .expect("state should exist")
        .execute(source)
        .unwrap();
}

/// Read a global string from a state, `None` when unset.
pub fn global_string(registry: &StateRegistry, key: StateKey, name: &str) -> Option<String> {
    registry
        .get(key)
        .expect("state should exist")
        .get_global::<Option<String>>(name)
        .unwrap()
}
