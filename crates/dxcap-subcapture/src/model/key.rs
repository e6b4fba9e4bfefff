use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit set on every key synthesized by the engine.
///
/// Captured keys are assigned by the interception layer starting from 1 and never reach this
/// bit, so restore-time objects and commands can never collide with captured ones.
pub const RESTORE_KEY_MASK: u64 = 1 << 63;

/// Identity of a tracked API object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(pub u64);

impl ObjectKey {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_restore(self) -> bool {
        self.0 & RESTORE_KEY_MASK != 0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_restore() {
            write!(f, "R{}", self.0 & !RESTORE_KEY_MASK)
        } else {
            write!(f, "O{}", self.0)
        }
    }
}

/// Identity of a captured (or synthesized) API call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandKey(pub u64);

impl CommandKey {
    pub fn is_restore(self) -> bool {
        self.0 & RESTORE_KEY_MASK != 0
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_restore() {
            write!(f, "#R{}", self.0 & !RESTORE_KEY_MASK)
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// A byte location inside a tracked resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyOffset {
    pub key: ObjectKey,
    pub offset: u64,
}

impl KeyOffset {
    pub fn new(key: ObjectKey, offset: u64) -> Self {
        Self { key, offset }
    }
}

impl fmt::Display for KeyOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.offset)
    }
}

/// Hands out keys from the reserved restore range.
///
/// Objects and commands share one counter; the two key spaces are disjoint by type anyway, and a
/// single counter keeps the synthesized stream strictly ordered.
#[derive(Debug)]
pub struct KeyAllocator {
    next: u64,
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    fn bump(&mut self) -> u64 {
        let value = self.next | RESTORE_KEY_MASK;
        self.next += 1;
        value
    }

    pub fn object(&mut self) -> ObjectKey {
        ObjectKey(self.bump())
    }

    pub fn command(&mut self) -> CommandKey {
        CommandKey(self.bump())
    }

    /// Number of keys handed out so far.
    pub fn issued(&self) -> u64 {
        self.next - 1
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}
