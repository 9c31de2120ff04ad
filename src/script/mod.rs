//! Lua state management.
//!
//! Every map instance gets its own sandboxed Lua state, plus one global
//! state. States talk to each other only through the event bus: a script
//! registers a handler for `(map_id, event_name)` and any state may notify
//! it. Notifications are queued and delivered on the owning state's thread.

pub(crate) mod api;
pub mod bus;
pub mod compat;
pub mod engine;
pub mod key;
pub mod loader;
pub mod queue;
pub mod registry;
pub mod types;

pub use bus::{EventKey, StateEventBus};
pub use engine::{EngineOptions, ResourceLimits, ScriptEngine};
pub use key::{StateKey, GLOBAL_MAP_ID};
pub use loader::{run_scripts, ScriptLoader};
pub use queue::{Message, MessageQueue};
pub use registry::{ReloadTarget, StateHandle, StateRegistry};
pub use types::{LoadReport, LuaScript, ScriptKind, ScriptScope, ScriptSet, SyncResult};
