//! mapstate - per-map Lua scripting states
//!
//! Owns one Lua state per map instance plus a global state, and lets those
//! states exchange named events through a thread-safe queue.

pub mod config;
pub mod error;
pub mod logging;
pub mod script;

pub use config::Config;
pub use error::{MapStateError, Result};
pub use script::{
    EventKey, Message, MessageQueue, ReloadTarget, ScriptEngine, StateEventBus, StateHandle,
    StateKey, StateRegistry, GLOBAL_MAP_ID,
};
