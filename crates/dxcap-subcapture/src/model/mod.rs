//! Tagged records for every trackable API object and GPU resource.

mod key;
mod object;
mod registry;
mod resource;

pub use key::{CommandKey, KeyAllocator, KeyOffset, ObjectKey, RESTORE_KEY_MASK};
pub use object::{
    DescriptorHeapRecord, FenceRecord, NativeHandle, ObjectKind, ObjectPayload, TrackedObject,
};
pub use registry::{ObjectRegistry, ReleaseOutcome};
pub use resource::{
    Format, HeapFlags, HeapRecord, HeapType, ResourceDesc, ResourceDimension, ResourceFlags,
    ResourceRecord, ResourceStates, TextureLayout,
};
