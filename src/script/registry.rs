//! Lifecycle of the per-map Lua states.
//!
//! The host builds one [`StateRegistry`] and hands each map object a
//! [`StateHandle`]. Dropping the handle destroys the map's state. Hosts that
//! need process-wide access can use [`StateRegistry::global`] instead.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::bus::StateEventBus;
use super::engine::{EngineOptions, ResourceLimits, ScriptEngine};
use super::key::StateKey;
use super::loader::{self, ScriptLoader};
use super::types::{ScriptSet, SyncResult};
use crate::config::{Config, EngineConfig};
use crate::{MapStateError, Result};

static GLOBAL_REGISTRY: OnceLock<Arc<StateRegistry>> = OnceLock::new();

/// Which states a reload rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadTarget {
    /// Rescan the script directory without touching any state.
    CacheOnly,
    /// Rebuild the global state.
    Global,
    /// Rebuild every state.
    AllStates,
    /// Rebuild every instance of one map.
    Map(u32),
}

/// Owner of every Lua state, keyed by map and instance.
pub struct StateRegistry {
    states: Mutex<HashMap<StateKey, Arc<ScriptEngine>>>,
    bus: Arc<StateEventBus>,
    config: EngineConfig,
    limits: ResourceLimits,
    scripts: RwLock<Arc<ScriptSet>>,
}

impl StateRegistry {
    /// Registry with no scripts; states start empty.
    pub fn new(config: &Config) -> Self {
        Self::with_scripts(config, ScriptSet::default())
    }

    /// Registry that runs `scripts` in every state it creates.
    pub fn with_scripts(config: &Config, scripts: ScriptSet) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            bus: Arc::new(StateEventBus::new()),
            config: config.engine.clone(),
            limits: ResourceLimits::from(&config.limits),
            scripts: RwLock::new(Arc::new(scripts)),
        }
    }

    /// Registry with scripts scanned from the configured directory.
    pub fn load(config: &Config) -> Result<Self> {
        let scripts = ScriptLoader::from_config(&config.engine).scan()?;
        for (path, message) in &scripts.errors {
            warn!(path = %path, "failed to read script: {}", message);
        }
        Ok(Self::with_scripts(config, scripts))
    }

    /// Process-wide registry, built with default configuration on first use
    /// unless [`StateRegistry::install_global`] ran earlier.
    pub fn global() -> &'static Arc<StateRegistry> {
        GLOBAL_REGISTRY.get_or_init(|| Arc::new(StateRegistry::new(&Config::default())))
    }

    /// Install the process-wide registry. Fails if it was already set or used.
    pub fn install_global(registry: Arc<StateRegistry>) -> std::result::Result<(), Arc<StateRegistry>> {
        GLOBAL_REGISTRY.set(registry)
    }

    fn engine_options(&self, scripts: &ScriptSet) -> EngineOptions {
        EngineOptions {
            limits: self.limits.clone(),
            traceback: self.config.traceback,
            compatibility_mode: self.config.compatibility_mode,
            require_path: scripts.require_path.clone(),
        }
    }

    /// Create the state for `key` unless one already exists.
    ///
    /// The new state runs the scripts scoped to its map and becomes owned by
    /// the calling thread. Script failures are logged, not returned; only a
    /// state that cannot be built is an error.
    pub fn create(&self, key: StateKey) -> Result<()> {
        let scripts = Arc::clone(&self.scripts.read());
        let engine = {
            let mut states = self.states.lock();
            if states.contains_key(&key) {
                return Ok(());
            }
            let engine = Arc::new(ScriptEngine::new(
                key,
                Arc::clone(&self.bus),
                self.engine_options(&scripts),
            )?);
            // Pin to the creator before any other thread can look it up.
            engine.enter()?;
            states.insert(key, Arc::clone(&engine));
            engine
        };

        info!(state = %key, "created Lua state");
        if let Err(e) = loader::run_scripts(&engine, &scripts) {
            self.destroy(key);
            return Err(e);
        }
        Ok(())
    }

    /// Look up a state. The returned handle should not outlive the current dispatch.
    pub fn get(&self, key: StateKey) -> Option<Arc<ScriptEngine>> {
        self.states.lock().get(&key).cloned()
    }

    /// Like [`StateRegistry::get`], but absent states are an error.
    pub fn require(&self, key: StateKey) -> Result<Arc<ScriptEngine>> {
        self.get(key).ok_or(MapStateError::StateNotFound(key))
    }

    /// Remove and shut down the state for `key`. Safe to call repeatedly.
    pub fn destroy(&self, key: StateKey) -> bool {
        let removed = self.states.lock().remove(&key);
        match removed {
            Some(engine) => {
                engine.shutdown();
                info!(state = %key, "destroyed Lua state");
                true
            }
            None => {
                debug!(state = %key, "destroy on absent state");
                false
            }
        }
    }

    pub fn contains(&self, key: StateKey) -> bool {
        self.states.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    /// Keys of all live states, sorted.
    pub fn keys(&self) -> Vec<StateKey> {
        let mut keys: Vec<StateKey> = self.states.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Deliver pending events for every state owned by the calling thread.
    ///
    /// This is the tick of a single-threaded host. States pinned to other
    /// threads are left for their owners. Returns the number of handlers run.
    pub fn update_all(&self) -> usize {
        let engines: Vec<Arc<ScriptEngine>> = self.states.lock().values().cloned().collect();
        let mut delivered = 0;
        for engine in engines {
            match engine.process_messages() {
                Ok(count) => delivered += count,
                Err(MapStateError::WrongThread { key }) => {
                    debug!(state = %key, "skipping state owned by another thread");
                }
                Err(e) => warn!(state = %engine.key(), "failed to process messages: {}", e),
            }
        }
        delivered
    }

    /// Rescan the script directory and rebuild the targeted states.
    ///
    /// Rebuilt states get a fresh Lua state owned by the calling thread. A
    /// state that fails to rebuild stays destroyed and is listed in the
    /// returned errors; the remaining targets are still rebuilt.
    pub fn reload(&self, target: ReloadTarget) -> Result<SyncResult> {
        let fresh = ScriptLoader::from_config(&self.config).scan()?;
        let mut changes = self.scripts.read().diff(&fresh);
        *self.scripts.write() = Arc::new(fresh);
        info!(
            added = changes.added,
            updated = changes.updated,
            removed = changes.removed,
            ?target,
            "reloaded script cache"
        );

        let keys: Vec<StateKey> = self
            .keys()
            .into_iter()
            .filter(|key| match target {
                ReloadTarget::CacheOnly => false,
                ReloadTarget::Global => key.is_global(),
                ReloadTarget::AllStates => true,
                ReloadTarget::Map(map_id) => key.map_id() == map_id,
            })
            .collect();

        for key in keys {
            self.destroy(key);
            if let Err(e) = self.create(key) {
                error!(state = %key, "failed to rebuild state: {}", e);
                changes.errors.push((key.to_string(), e.to_string()));
            }
        }
        Ok(changes)
    }

    /// Destroy every state.
    pub fn shutdown(&self) {
        let drained: Vec<(StateKey, Arc<ScriptEngine>)> = self.states.lock().drain().collect();
        let count = drained.len();
        for (_, engine) in drained {
            engine.shutdown();
        }
        info!(states = count, "shut down state registry");
    }

    pub fn bus(&self) -> &Arc<StateEventBus> {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the current script set.
    pub fn scripts(&self) -> Arc<ScriptSet> {
        Arc::clone(&self.scripts.read())
    }
}

/// Map-side handle to a state; destroying it destroys the state.
///
/// Holds only a weak reference, so a handle outliving its registry is harmless.
pub struct StateHandle {
    key: StateKey,
    registry: Weak<StateRegistry>,
    owns_state: bool,
}

impl StateHandle {
    /// Create the state for a map instance and return its handle.
    ///
    /// Maps excluded by configuration (disabled engine, `only_on_maps`,
    /// compatibility mode) get a handle without a state of their own, as do
    /// non-zero instances of the reserved global map.
    pub fn attach(registry: &Arc<StateRegistry>, map_id: u32, instance_id: u32) -> Result<Self> {
        let key = StateKey::new(map_id, instance_id);
        let owns_state = registry.config().should_state_load(key);
        if owns_state {
            registry.create(key)?;
        } else {
            debug!(state = %key, "map excluded from scripting");
        }
        Ok(Self {
            key,
            registry: Arc::downgrade(registry),
            owns_state,
        })
    }

    pub fn key(&self) -> StateKey {
        self.key
    }

    pub fn map_id(&self) -> u32 {
        self.key.map_id()
    }

    pub fn instance_id(&self) -> u32 {
        self.key.instance_id()
    }

    pub fn is_global(&self) -> bool {
        self.key.is_global()
    }

    /// Whether this handle created (and will destroy) a state.
    pub fn owns_state(&self) -> bool {
        self.owns_state
    }

    /// The state serving this map; the global state in compatibility mode.
    pub fn engine(&self) -> Option<Arc<ScriptEngine>> {
        let registry = self.registry.upgrade()?;
        registry.get(self.key).or_else(|| {
            if registry.config().compatibility_mode {
                registry.get(StateKey::global())
            } else {
                None
            }
        })
    }
}

impl Drop for StateHandle {
    fn drop(&mut self) {
        if !self.owns_state {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.destroy(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry() -> Arc<StateRegistry> {
        Arc::new(StateRegistry::new(&Config::default()))
    }

    #[test]
    fn test_create_and_get() {
        let registry = registry();
        let key = StateKey::new(1, 0);

        assert!(registry.get(key).is_none());
        registry.create(key).unwrap();
        assert_eq!(registry.get(key).unwrap().key(), key);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = registry();
        let key = StateKey::new(1, 0);

        registry.create(key).unwrap();
        let first = registry.get(key).unwrap();
        first.execute("marker = 'first'").unwrap();

        registry.create(key).unwrap();
        let second = registry.get(key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get_global::<String>("marker").unwrap(), "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let registry = registry();
        let key = StateKey::new(1, 0);
        registry.create(key).unwrap();

        assert!(registry.destroy(key));
        assert!(registry.get(key).is_none());
        assert!(!registry.destroy(key));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_destroy_absent_leaves_others() {
        let registry = registry();
        registry.create(StateKey::new(1, 0)).unwrap();

        assert!(!registry.destroy(StateKey::new(2, 0)));
        assert_eq!(registry.keys(), vec![StateKey::new(1, 0)]);
    }

    #[test]
    fn test_require_missing_state() {
        let registry = registry();
        assert!(matches!(
            registry.require(StateKey::new(9, 9)),
            Err(MapStateError::StateNotFound(_))
        ));
    }

    #[test]
    fn test_destroy_removes_routes() {
        let registry = registry();
        let key = StateKey::new(1, 0);
        registry.create(key).unwrap();
        registry
            .get(key)
            .unwrap()
            .execute(r#"RegisterStateEvent(1, "OnReady", function() end)"#)
            .unwrap();
        assert_eq!(registry.bus().route_count(), 1);

        registry.destroy(key);
        assert_eq!(registry.bus().route_count(), 0);
        assert!(!registry.bus().notify(1, "OnReady", "late"));
    }

    #[test]
    fn test_handle_drop_destroys_state() {
        let registry = registry();
        let handle = StateHandle::attach(&registry, 1, 0).unwrap();
        assert!(handle.owns_state());
        assert!(handle.engine().is_some());
        assert!(registry.contains(StateKey::new(1, 0)));

        drop(handle);
        assert!(!registry.contains(StateKey::new(1, 0)));
    }

    #[test]
    fn test_handle_outlives_registry() {
        let registry = registry();
        let handle = StateHandle::attach(&registry, 1, 0).unwrap();
        drop(registry);

        assert!(handle.engine().is_none());
        drop(handle);
    }

    #[test]
    fn test_handle_respects_only_on_maps() {
        let mut config = Config::default();
        config.engine.only_on_maps = "1".to_string();
        let registry = Arc::new(StateRegistry::new(&config));

        let allowed = StateHandle::attach(&registry, 1, 0).unwrap();
        let excluded = StateHandle::attach(&registry, 2, 0).unwrap();
        assert!(allowed.owns_state());
        assert!(!excluded.owns_state());
        assert!(excluded.engine().is_none());
        assert_eq!(registry.len(), 1);

        drop(excluded);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handle_compatibility_mode_uses_global() {
        let mut config = Config::default();
        config.engine.compatibility_mode = true;
        let registry = Arc::new(StateRegistry::new(&config));

        let global = StateHandle::attach(&registry, crate::script::GLOBAL_MAP_ID, 0).unwrap();
        let map = StateHandle::attach(&registry, 0, 0).unwrap();

        assert!(global.is_global());
        assert!(!map.owns_state());
        assert_eq!(map.engine().unwrap().key(), StateKey::global());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let registry = registry();
        registry.create(StateKey::new(1, 0)).unwrap();
        registry.create(StateKey::new(2, 0)).unwrap();

        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(registry.bus().inbox_count(), 0);
    }

    #[test]
    fn test_create_runs_scripts() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("hello.lua"), "greeting = 'hi'").unwrap();

        let mut config = Config::default();
        config.engine.script_path = temp.path().to_string_lossy().to_string();
        let registry = StateRegistry::load(&config).unwrap();

        registry.create(StateKey::new(1, 0)).unwrap();
        let engine = registry.get(StateKey::new(1, 0)).unwrap();
        assert_eq!(engine.get_global::<String>("greeting").unwrap(), "hi");
    }

    #[test]
    fn test_reload_rebuilds_target_map() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("version.lua");
        fs::write(&script, "version = 1").unwrap();

        let mut config = Config::default();
        config.engine.script_path = temp.path().to_string_lossy().to_string();
        let registry = StateRegistry::load(&config).unwrap();
        registry.create(StateKey::new(1, 0)).unwrap();
        registry.create(StateKey::new(2, 0)).unwrap();

        fs::write(&script, "version = 2").unwrap();
        let changes = registry.reload(ReloadTarget::Map(1)).unwrap();
        assert_eq!(changes.updated, 1);

        let reloaded = registry.get(StateKey::new(1, 0)).unwrap();
        let untouched = registry.get(StateKey::new(2, 0)).unwrap();
        assert_eq!(reloaded.get_global::<i64>("version").unwrap(), 2);
        assert_eq!(untouched.get_global::<i64>("version").unwrap(), 1);
    }

    #[test]
    fn test_created_state_pinned_to_creator() {
        let registry = registry();
        let key = StateKey::new(1, 0);
        registry.create(key).unwrap();

        let foreign = Arc::clone(&registry);
        let result = std::thread::spawn(move || {
            let engine = foreign.get(key).unwrap();
            engine.process_messages()
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(MapStateError::WrongThread { .. })));

        registry.get(key).unwrap().execute("ok = true").unwrap();
    }

    #[test]
    fn test_reload_rebuilds_every_targeted_state() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a_broken.lua"), "error('boom')").unwrap();
        fs::write(temp.path().join("b_version.lua"), "version = 1").unwrap();

        let mut config = Config::default();
        config.engine.script_path = temp.path().to_string_lossy().to_string();
        let registry = StateRegistry::load(&config).unwrap();
        let keys = [StateKey::new(1, 0), StateKey::new(1, 1), StateKey::new(2, 0)];
        for key in keys {
            registry.create(key).unwrap();
        }

        fs::write(temp.path().join("b_version.lua"), "version = 2").unwrap();
        let changes = registry.reload(ReloadTarget::AllStates).unwrap();
        assert!(changes.errors.is_empty());
        assert_eq!(registry.keys(), keys.to_vec());
        for key in keys {
            let engine = registry.get(key).unwrap();
            assert_eq!(engine.get_global::<i64>("version").unwrap(), 2);
        }
    }

    #[test]
    fn test_handle_rejects_instances_of_global_map() {
        let registry = registry();
        let handle = StateHandle::attach(&registry, crate::script::GLOBAL_MAP_ID, 5).unwrap();

        assert!(!handle.owns_state());
        assert!(handle.engine().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reload_cache_only_keeps_states() {
        let registry = registry();
        registry.create(StateKey::new(1, 0)).unwrap();
        let before = registry.get(StateKey::new(1, 0)).unwrap();

        registry.reload(ReloadTarget::CacheOnly).unwrap();
        let after = registry.get(StateKey::new(1, 0)).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }
}
