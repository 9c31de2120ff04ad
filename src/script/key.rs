//! Composite key identifying one Lua state.

use std::fmt;

/// Reserved map id of the process-wide global state.
pub const GLOBAL_MAP_ID: u32 = u32::MAX;

/// Key of a Lua state: map id in the high 32 bits, instance id in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(u64);

impl StateKey {
    /// Pack a map/instance pair.
    pub const fn new(map_id: u32, instance_id: u32) -> Self {
        Self(((map_id as u64) << 32) | instance_id as u64)
    }

    /// Key of the global state.
    pub const fn global() -> Self {
        Self::new(GLOBAL_MAP_ID, 0)
    }

    /// Rebuild a key from its packed form.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Packed 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn map_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn instance_id(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_global(self) -> bool {
        self.0 == Self::global().0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            write!(f, "global")
        } else {
            write!(f, "{}:{}", self.map_id(), self.instance_id())
        }
    }
}
