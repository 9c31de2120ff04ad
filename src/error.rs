//! Error types for mapstate.

use thiserror::Error;

use crate::script::StateKey;

/// Common error type for mapstate.
#[derive(Error, Debug)]
pub enum MapStateError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for configuration or host input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lua runtime or syntax error.
    #[error("script error: {0}")]
    Script(String),

    /// A Lua state was entered from a thread that does not own it.
    #[error("state {key} entered from a foreign thread")]
    WrongThread {
        /// Key of the pinned state.
        key: StateKey,
    },

    /// No state is registered under the key.
    #[error("state {0} not found")]
    StateNotFound(StateKey),
}

impl From<mlua::Error> for MapStateError {
    fn from(e: mlua::Error) -> Self {
        MapStateError::Script(e.to_string())
    }
}

/// Result type alias for mapstate operations.
pub type Result<T> = std::result::Result<T, MapStateError>;
