//! One sandboxed Lua state bound to a map instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use mlua::{Function, HookTriggers, Lua, RegistryKey, Table, Value, VmState};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::api;
use super::bus::{EventKey, StateEventBus};
use super::compat;
use super::key::StateKey;
use super::queue::MessageQueue;
use crate::{MapStateError, Result};

/// Instructions between two checks of the instruction budget.
const HOOK_INTERVAL: u32 = 10_000;

/// Resource limits applied to every entry into a state.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of instructions per entry (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory: 64 * 1024 * 1024,
        }
    }
}

/// Settings a state is built with.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub limits: ResourceLimits,
    /// Keep the Lua traceback in reported errors.
    pub traceback: bool,
    /// Exposed to scripts through `IsCompatibilityMode()`.
    pub compatibility_mode: bool,
    /// Value of `package.path`.
    pub require_path: String,
}

/// State shared between a [`ScriptEngine`] and the native functions it exposes.
pub(crate) struct StateContext {
    pub key: StateKey,
    pub bus: Arc<StateEventBus>,
    pub compatibility_mode: bool,
    handlers: Mutex<HashMap<EventKey, RegistryKey>>,
}

impl StateContext {
    /// Store `handler` for `(map_id, name)` in this state and route the event here.
    ///
    /// A previous handler of this state for the same key is released.
    pub fn register_handler(
        &self,
        lua: &Lua,
        map_id: u32,
        name: String,
        handler: Function,
    ) -> mlua::Result<()> {
        let slot = lua.create_registry_value(handler)?;
        self.bus.register(map_id, &name, self.key);
        self.handlers.lock().insert(EventKey::new(map_id, name), slot);
        Ok(())
    }

    fn handler(&self, lua: &Lua, event: &EventKey) -> mlua::Result<Option<Function>> {
        match self.handlers.lock().get(event) {
            Some(slot) => lua.registry_value(slot).map(Some),
            None => Ok(None),
        }
    }
}

/// Lua state with sandboxing, resource limits and a cross-state inbox.
pub struct ScriptEngine {
    lua: Lua,
    context: Arc<StateContext>,
    inbox: Arc<MessageQueue>,
    owner: OnceLock<ThreadId>,
    instruction_count: Arc<AtomicU64>,
    options: EngineOptions,
}

impl ScriptEngine {
    /// Build a state for `key` and attach its inbox to `bus`.
    pub fn new(key: StateKey, bus: Arc<StateEventBus>, options: EngineOptions) -> Result<Self> {
        let lua = Lua::new();

        compat::install(&lua)
            .map_err(|e| MapStateError::Script(format!("Failed to install compat helpers: {}", e)))?;
        Self::apply_sandbox(&lua, &options.require_path)?;

        if options.limits.max_memory > 0 {
            lua.set_memory_limit(options.limits.max_memory)
                .map_err(|e| MapStateError::Script(format!("Failed to set memory limit: {}", e)))?;
        }

        let context = Arc::new(StateContext {
            key,
            bus: Arc::clone(&bus),
            compatibility_mode: options.compatibility_mode,
            handlers: Mutex::new(HashMap::new()),
        });
        api::register(&lua, Arc::clone(&context))
            .map_err(|e| MapStateError::Script(format!("Failed to register state API: {}", e)))?;

        let inbox = bus.attach(key);
        debug!(state = %key, "created Lua state");

        Ok(Self {
            lua,
            context,
            inbox,
            owner: OnceLock::new(),
            instruction_count: Arc::new(AtomicU64::new(0)),
            options,
        })
    }

    /// Strip host access from the standard library.
    ///
    /// `require` stays available but only searches `require_path`; native
    /// modules cannot be loaded.
    fn apply_sandbox(lua: &Lua, require_path: &str) -> Result<()> {
        let sandbox = || -> mlua::Result<()> {
            let globals = lua.globals();
            for name in ["io", "dofile", "loadfile", "debug"] {
                globals.set(name, Value::Nil)?;
            }

            let os: Table = globals.get("os")?;
            let safe_os = lua.create_table()?;
            for name in ["time", "clock", "date", "difftime"] {
                safe_os.set(name, os.get::<Value>(name)?)?;
            }
            globals.set("os", safe_os.clone())?;

            let package: Table = globals.get("package")?;
            package.set("path", require_path)?;
            package.set("cpath", "")?;
            package.set("loadlib", Value::Nil)?;

            // `require` serves library tables straight from `package.loaded`.
            let loaded: Table = package.get("loaded")?;
            loaded.set("io", Value::Nil)?;
            loaded.set("debug", Value::Nil)?;
            loaded.set("os", safe_os)?;
            Ok(())
        };
        sandbox().map_err(|e| MapStateError::Script(format!("Failed to apply sandbox: {}", e)))
    }

    /// Claim the state for the calling thread, or fail if another thread owns it.
    pub(crate) fn enter(&self) -> Result<()> {
        let current = thread::current().id();
        let owner = *self.owner.get_or_init(|| current);
        if owner != current {
            return Err(MapStateError::WrongThread {
                key: self.context.key,
            });
        }
        Ok(())
    }

    /// Run `f` with the instruction budget armed.
    fn with_limits<R>(&self, f: impl FnOnce() -> mlua::Result<R>) -> mlua::Result<R> {
        self.instruction_count.store(0, Ordering::SeqCst);

        if self.options.limits.max_instructions > 0 {
            let count = Arc::clone(&self.instruction_count);
            let limit = self.options.limits.max_instructions;

            self.lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| {
                    let current =
                        count.fetch_add(HOOK_INTERVAL as u64, Ordering::SeqCst) + HOOK_INTERVAL as u64;
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "Script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let result = f();
        let _ = self.lua.remove_hook();
        result
    }

    /// Execute Lua source in this state.
    pub fn execute(&self, source: &str) -> Result<()> {
        self.enter()?;
        self.with_limits(|| self.lua.load(source).exec())
            .map_err(|e| MapStateError::Script(self.describe(&e)))
    }

    /// Run a named chunk and return its result.
    pub fn run_chunk(&self, chunk_name: &str, source: &str) -> Result<Value> {
        self.enter()?;
        self.with_limits(|| {
            self.lua
                .load(source)
                .set_name(format!("@{}", chunk_name))
                .call::<Value>(())
        })
        .map_err(|e| MapStateError::Script(self.describe(&e)))
    }

    /// Deliver every message queued for this state right now.
    ///
    /// Must be called from the owning thread. Handler errors are logged and
    /// do not stop the batch. Returns the number of handlers invoked.
    pub fn process_messages(&self) -> Result<usize> {
        self.enter()?;

        let mut delivered = 0;
        for message in self.inbox.drain() {
            if self.context.bus.owner_of(message.map_id, &message.event_name)
                != Some(self.context.key)
            {
                debug!(
                    state = %self.context.key,
                    map_id = message.map_id,
                    event = %message.event_name,
                    "dropping message for a route this state no longer owns"
                );
                continue;
            }

            let event = EventKey::new(message.map_id, message.event_name);
            let handler = match self.context.handler(&self.lua, &event) {
                Ok(Some(handler)) => handler,
                Ok(None) => continue,
                Err(e) => {
                    error!(state = %self.context.key, event = %event.name, "{}", self.describe(&e));
                    continue;
                }
            };

            match self.with_limits(|| handler.call::<()>(message.data)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        state = %self.context.key,
                        map_id = event.map_id,
                        event = %event.name,
                        "state event handler failed: {}",
                        self.describe(&e)
                    );
                }
            }
        }
        Ok(delivered)
    }

    /// Detach from the bus and release every handler slot.
    ///
    /// Does not enter the Lua state, so any thread may call it.
    pub fn shutdown(&self) {
        self.context.bus.detach(self.context.key);
        self.context.handlers.lock().clear();
        debug!(state = %self.context.key, "shut down Lua state");
    }

    /// Render a Lua error for logs, trimming the traceback unless enabled.
    fn describe(&self, err: &mlua::Error) -> String {
        describe_error(err, self.options.traceback)
    }

    /// Set a global value in the Lua environment.
    pub fn set_global<V: mlua::IntoLua>(&self, name: &str, value: V) -> Result<()> {
        self.enter()?;
        self.lua
            .globals()
            .set(name, value)
            .map_err(|e| MapStateError::Script(format!("Failed to set global '{}': {}", name, e)))
    }

    /// Get a global value from the Lua environment.
    pub fn get_global<V: mlua::FromLua>(&self, name: &str) -> Result<V> {
        self.enter()?;
        self.lua
            .globals()
            .get(name)
            .map_err(|e| MapStateError::Script(format!("Failed to get global '{}': {}", name, e)))
    }

    pub fn key(&self) -> StateKey {
        self.context.key
    }

    /// Number of queued, undelivered messages.
    pub fn pending_messages(&self) -> usize {
        self.inbox.len()
    }

    /// Number of events this state has handlers for.
    pub fn handler_count(&self) -> usize {
        self.context.handlers.lock().len()
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The underlying Lua state. Callers must be on the owning thread.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

/// Render a Lua error, optionally dropping the `stack traceback:` section.
pub(crate) fn describe_error(err: &mlua::Error, traceback: bool) -> String {
    let text = err.to_string();
    if traceback {
        return text;
    }
    match text.find("\nstack traceback:") {
        Some(pos) => text[..pos].to_string(),
        None => text,
    }
}
