//! Cross-state event routing.
//!
//! The bus only knows which state owns each `(map_id, event_name)` pair and
//! where that state's inbox is. Lua callbacks stay inside the owning state and
//! are invoked there when it drains its inbox.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::key::StateKey;
use super::queue::{Message, MessageQueue};

/// Routing key of a registered event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub map_id: u32,
    pub name: String,
}

impl EventKey {
    pub fn new(map_id: u32, name: impl Into<String>) -> Self {
        Self {
            map_id,
            name: name.into(),
        }
    }
}

/// Process-wide registry of event routes and state inboxes.
pub struct StateEventBus {
    routes: RwLock<HashMap<EventKey, StateKey>>,
    inboxes: RwLock<HashMap<StateKey, Arc<MessageQueue>>>,
}

impl StateEventBus {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            inboxes: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or return) the inbox of a state.
    pub fn attach(&self, owner: StateKey) -> Arc<MessageQueue> {
        let mut inboxes = self.inboxes.write();
        Arc::clone(
            inboxes
                .entry(owner)
                .or_insert_with(|| Arc::new(MessageQueue::new())),
        )
    }

    /// Remove a state's inbox and every route it owns.
    ///
    /// The inbox is closed so a thread blocked on it wakes up. Returns the
    /// number of routes removed.
    pub fn detach(&self, owner: StateKey) -> usize {
        let removed = {
            let mut routes = self.routes.write();
            let before = routes.len();
            routes.retain(|_, key| *key != owner);
            before - routes.len()
        };
        if let Some(inbox) = self.inboxes.write().remove(&owner) {
            inbox.close();
        }
        debug!(state = %owner, routes = removed, "detached state from event bus");
        removed
    }

    /// Route `(map_id, name)` to `owner`, replacing any earlier registration.
    ///
    /// Returns the previous owner, if any.
    pub fn register(&self, map_id: u32, name: &str, owner: StateKey) -> Option<StateKey> {
        let previous = self
            .routes
            .write()
            .insert(EventKey::new(map_id, name), owner);
        debug!(map_id, event = name, state = %owner, ?previous, "registered state event");
        previous
    }

    /// Queue `data` for the state owning `(map_id, name)`.
    ///
    /// Returns `false` when nobody listens; that is not an error.
    pub fn notify(&self, map_id: u32, name: &str, data: &str) -> bool {
        let Some(owner) = self.owner_of(map_id, name) else {
            trace!(map_id, event = name, "no listener for state event");
            return false;
        };
        let inbox = self.inboxes.read().get(&owner).cloned();
        match inbox {
            Some(inbox) => inbox.push(Message::new(map_id, name, data)),
            None => false,
        }
    }

    /// Current owner of a route.
    pub fn owner_of(&self, map_id: u32, name: &str) -> Option<StateKey> {
        self.routes
            .read()
            .get(&EventKey::new(map_id, name))
            .copied()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    pub fn inbox_count(&self) -> usize {
        self.inboxes.read().len()
    }
}

impl Default for StateEventBus {
    fn default() -> Self {
        Self::new()
    }
}
