//! One-shot reporting of known limitations.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

/// Input shapes the engine recognizes but cannot restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Limitation {
    /// `D3D12_TILE_RANGE_FLAG_SKIP` in a tile mapping update.
    TileRangeSkip,
    /// Top-level builds whose instances are given as an array of pointers.
    InstanceArrayOfPointers,
    /// Acceleration structure copies that do not produce a structure (serialize, visualize).
    AccelerationStructureCopyMode,
    /// Resources created inside a protected session.
    ProtectedResource,
    /// Texture formats without a known element size.
    UnknownTextureFormat,
    /// Entry points without a restore path.
    UnsupportedEntryPoint,
}

impl fmt::Display for Limitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Limitation::TileRangeSkip => "tile range flag SKIP is not supported",
            Limitation::InstanceArrayOfPointers => {
                "instance descriptors given as an array of pointers are not captured"
            }
            Limitation::AccelerationStructureCopyMode => {
                "acceleration structure copy mode is not restored"
            }
            Limitation::ProtectedResource => "protected resources are restored without content",
            Limitation::UnknownTextureFormat => "texture format has no known element size",
            Limitation::UnsupportedEntryPoint => "entry point has no restore path",
        };
        f.write_str(text)
    }
}

/// Deduplicated warnings for the lifetime of one capture session.
#[derive(Debug, Default)]
pub struct Diagnostics {
    occurrences: BTreeMap<Limitation, u64>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an occurrence; logs only the first one. Returns `true` if this call logged.
    pub fn warn_once(&mut self, limitation: Limitation, detail: impl fmt::Display) -> bool {
        let count = self.occurrences.entry(limitation).or_insert(0);
        *count += 1;
        if *count > 1 {
            return false;
        }
        warn!(?limitation, %detail, "{limitation}; further occurrences are not reported");
        true
    }

    pub fn occurrences(&self, limitation: Limitation) -> u64 {
        self.occurrences.get(&limitation).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Limitation, u64)> + '_ {
        self.occurrences.iter().map(|(limitation, count)| (*limitation, *count))
    }
}
