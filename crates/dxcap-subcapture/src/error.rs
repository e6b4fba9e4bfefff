use thiserror::Error;

use crate::analysis::AnalysisError;
use crate::aux_views::AuxHeapKind;
use crate::gpu::{GpuError, WaitError};
use crate::model::{ObjectKey, ObjectKind};

pub type Result<T> = std::result::Result<T, SubcaptureError>;

/// Errors raised while tracking or restoring state.
///
/// Every variant is fatal for the subcapture: it means upstream tracking handed the engine
/// something inconsistent, or a device call that must succeed did not. Callers are expected to
/// abort the capture session rather than attempt to continue with partially restored state.
#[derive(Debug, Error)]
pub enum SubcaptureError {
    #[error("unknown object {0}")]
    UnknownObject(ObjectKey),

    #[error("object {0} is already tracked")]
    DuplicateObject(ObjectKey),

    #[error("object {key} is a {found:?}, expected {expected}")]
    WrongKind {
        key: ObjectKey,
        found: ObjectKind,
        expected: &'static str,
    },

    #[error("object {0} released more times than it was referenced")]
    ReleaseUnderflow(ObjectKey),

    #[error("gpu address 0x{0:016x} does not resolve to a tracked resource")]
    UnresolvedGpuAddress(u64),

    #[error("subresource {subresource} out of range for resource {key} ({count} subresources)")]
    SubresourceOutOfRange {
        key: ObjectKey,
        subresource: u32,
        count: u32,
    },

    #[error("descriptor slot {index} out of range for heap {heap} (capacity {capacity})")]
    DescriptorOutOfRange {
        heap: ObjectKey,
        index: u32,
        capacity: u32,
    },

    #[error("tile coordinate out of range for resource {key}: {detail}")]
    TileOutOfRange { key: ObjectKey, detail: String },

    #[error("resource {0} is not a tracked reserved resource")]
    NotTiled(ObjectKey),

    #[error("command list {0} is not tracked")]
    UnknownCommandList(ObjectKey),

    #[error("state restore requires a device, but no device creation was observed")]
    NoDevice,

    #[error("{size} bytes at offset {offset} overflow the {capacity}-byte upload buffer")]
    UploadBufferOverflow { offset: u64, size: u64, capacity: u64 },

    #[error("auxiliary {kind:?} descriptor heap exhausted (capacity {capacity})")]
    AuxiliaryHeapExhausted { kind: AuxHeapKind, capacity: u32 },

    #[error("gpu error: {0}")]
    Gpu(#[from] GpuError),

    #[error("fence wait failed: {0}")]
    FenceWait(#[from] WaitError),

    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),
}
