//! Script loader for scanning Lua files and running them in new states.
//!
//! Layout of the script directory:
//! - `*.ext` files are extensions and load before everything else.
//! - `*.lua` files load in path order.
//! - Files under a top-level folder named by a map id (e.g. `530/`) load
//!   only into states of that map; everything else loads everywhere.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use mlua::{Table, Value};
use tracing::{debug, error, info, warn};

use super::compat;
use super::engine::ScriptEngine;
use super::types::{LoadReport, LuaScript, ScriptKind, ScriptScope, ScriptSet};
use crate::config::EngineConfig;
use crate::Result;

/// Loader for scanning Lua scripts from the file system.
pub struct ScriptLoader {
    /// Base directory for scripts.
    scripts_dir: PathBuf,
    /// Extra `package.path` entries appended after the scanned directories.
    extra_require_paths: Vec<String>,
}

impl ScriptLoader {
    /// Create a new ScriptLoader with the given scripts directory.
    pub fn new<P: AsRef<Path>>(scripts_dir: P) -> Self {
        Self {
            scripts_dir: scripts_dir.as_ref().to_path_buf(),
            extra_require_paths: Vec::new(),
        }
    }

    /// Loader for the configured script path; a leading `~` expands to `$HOME`.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut loader = Self::new(expand_home(&config.script_path));
        loader.extra_require_paths = config.extra_require_paths();
        loader
    }

    /// Read every script under the scripts directory.
    ///
    /// A missing directory yields an empty set; unreadable entries are
    /// recorded in `ScriptSet::errors`.
    pub fn scan(&self) -> Result<ScriptSet> {
        let started = Instant::now();
        let mut set = ScriptSet::default();
        let mut require_dirs = Vec::new();

        if self.scripts_dir.is_dir() {
            info!(path = %self.scripts_dir.display(), "searching scripts");
            self.scan_directory(&self.scripts_dir, &mut set, &mut require_dirs);
        } else {
            warn!(path = %self.scripts_dir.display(), "script directory does not exist");
        }

        set.scripts.sort_by(|a, b| {
            let rank = |s: &LuaScript| (s.kind == ScriptKind::Script) as u8;
            rank(a).cmp(&rank(b)).then_with(|| a.path.cmp(&b.path))
        });

        let mut entries: Vec<String> = require_dirs
            .iter()
            .flat_map(|dir| {
                let dir = dir.to_string_lossy();
                [format!("{}/?.lua", dir), format!("{}/?.ext", dir)]
            })
            .collect();
        entries.extend(self.extra_require_paths.iter().cloned());
        set.require_path = entries.join(";");

        info!(
            scripts = set.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded scripts"
        );
        Ok(set)
    }

    /// Scan a directory recursively, skipping hidden entries.
    fn scan_directory(&self, dir: &Path, set: &mut ScriptSet, require_dirs: &mut Vec<PathBuf>) {
        debug!(path = %dir.display(), "scanning script directory");
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                set.errors.push((dir.display().to_string(), e.to_string()));
                return;
            }
        };
        require_dirs.push(dir.to_path_buf());

        let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        paths.sort();

        for path in paths {
            let hidden = path
                .file_name()
                .map(|name| name.to_string_lossy().starts_with('.'))
                .unwrap_or(true);
            if hidden {
                continue;
            }

            if path.is_dir() {
                self.scan_directory(&path, set, require_dirs);
            } else if let Some(kind) = script_kind(&path) {
                match self.read_script(&path, kind) {
                    Ok(script) => {
                        debug!(path = %path.display(), scope = ?script.scope, "found script");
                        set.scripts.push(script);
                    }
                    Err(e) => set.errors.push((path.display().to_string(), e.to_string())),
                }
            }
        }
    }

    fn read_script(&self, path: &Path, kind: ScriptKind) -> Result<LuaScript> {
        let source = fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(LuaScript {
            name,
            path: path.to_path_buf(),
            kind,
            scope: self.scope_of(path),
            hash: Self::calculate_hash(&source),
            source,
        })
    }

    /// Scope from the first folder below the scripts directory.
    fn scope_of(&self, path: &Path) -> ScriptScope {
        let relative = path.strip_prefix(&self.scripts_dir).unwrap_or(path);
        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(folder)), Some(_)) => folder
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
                .map(ScriptScope::Map)
                .unwrap_or(ScriptScope::AllMaps),
            _ => ScriptScope::AllMaps,
        }
    }

    /// Calculate a simple hash of the file content.
    fn calculate_hash(content: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Get the scripts directory path.
    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }
}

fn script_kind(path: &Path) -> Option<ScriptKind> {
    match path.extension()?.to_str()? {
        "lua" => Some(ScriptKind::Script),
        "ext" => Some(ScriptKind::Extension),
        _ => None,
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(format!("{}{}", home, rest));
        }
    }
    PathBuf::from(path)
}

/// Run the scripts of `set` that apply to the engine's map.
///
/// Each script becomes a module: its return value (or `true`) is stored in
/// `package.loaded[name]`. A module name that is already loaded, or that a
/// previous file in the set already claimed, is skipped. Script errors are
/// logged and counted; they never abort the load.
pub fn run_scripts(engine: &ScriptEngine, set: &ScriptSet) -> Result<LoadReport> {
    engine.enter()?;
    let started = Instant::now();
    let lua = engine.lua();
    let package: Table = lua.globals().get("package")?;
    let (loaded, _) = compat::subtable(lua, &package, "loaded")?;

    let mut report = LoadReport::default();
    let mut claimed: HashMap<&str, &Path> = HashMap::new();

    for script in set.for_map(engine.key().map_id()) {
        if let Some(first) = claimed.get(script.name.as_str()) {
            error!(
                path = %script.path.display(),
                loaded_from = %first.display(),
                "file with the same name already loaded, rename either file"
            );
            report.skipped += 1;
            continue;
        }
        claimed.insert(&script.name, &script.path);

        if !matches!(loaded.get::<Value>(script.name.as_str())?, Value::Nil) {
            debug!(path = %script.path.display(), "already loaded or required");
            report.skipped += 1;
            continue;
        }

        match engine.run_chunk(&script.path.to_string_lossy(), &script.source) {
            Ok(value) => {
                let value = match value {
                    Value::Nil | Value::Boolean(false) => Value::Boolean(true),
                    other => other,
                };
                loaded.set(script.name.as_str(), value)?;
                debug!(path = %script.path.display(), "loaded script");
                report.executed += 1;
            }
            Err(e) => {
                error!(state = %engine.key(), path = %script.path.display(), "error loading script: {}", e);
                report.failed += 1;
            }
        }
    }

    info!(
        state = %engine.key(),
        executed = report.executed,
        skipped = report.skipped,
        failed = report.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "executed Lua scripts"
    );
    Ok(report)
}
