use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{HeapRecord, ObjectKey, ResourceRecord};
use crate::command::CommandRecord;
use crate::descriptors::DescriptorHeapType;

/// Type tag of a tracked object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Factory,
    Adapter,
    Output,
    Device,
    DebugInterface,
    DebugDevice,
    InfoQueue,
    DeviceRemovedExtendedData,
    CommandQueue,
    CommandAllocator,
    GraphicsCommandList,
    DebugCommandList,
    Heap,
    CommittedResource,
    PlacedResource,
    ReservedResource,
    BackBuffer,
    RootSignature,
    RootSignatureDeserializer,
    GraphicsPipelineState,
    ComputePipelineState,
    StreamPipelineState,
    PipelineLibrary,
    StateObject,
    StateObjectProperties,
    DescriptorHeap,
    QueryHeap,
    CommandSignature,
    Fence,
    SharedFence,
    SwapChain,
    Surface,
    ProtectedResourceSession,
    LifetimeOwner,
    LifetimeTracker,
    SwapChainAssistant,
    ShaderCacheSession,
    MetaCommand,
    Tools,
    SdkConfiguration,
    DeviceFactory,
    DeviceConfiguration,
    VideoDevice,
    VideoDecoder,
    VideoDecoderHeap,
    VideoProcessor,
    VideoEncoder,
    VideoEncoderHeap,
    VideoMotionEstimator,
    VideoMotionVectorHeap,
    StorageFactory,
    StorageQueue,
    StorageFile,
    StorageStatusArray,
}

impl ObjectKind {
    pub fn is_resource(self) -> bool {
        matches!(
            self,
            ObjectKind::CommittedResource
                | ObjectKind::PlacedResource
                | ObjectKind::ReservedResource
                | ObjectKind::BackBuffer
        )
    }

    /// Objects every restored session needs regardless of what the offline analysis selected.
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            ObjectKind::Factory
                | ObjectKind::Adapter
                | ObjectKind::Output
                | ObjectKind::Device
                | ObjectKind::CommandQueue
                | ObjectKind::SwapChain
                | ObjectKind::BackBuffer
                | ObjectKind::Heap
                | ObjectKind::DescriptorHeap
                | ObjectKind::Fence
        )
    }
}

/// Driver-owned handle of the live object. Referenced, never owned, by the model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeHandle(pub u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FenceRecord {
    /// Last value signalled from the CPU or from a queue.
    pub value: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorHeapRecord {
    pub heap_type: DescriptorHeapType,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// Kind-specific data attached to a tracked object.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum ObjectPayload {
    #[default]
    None,
    Resource(ResourceRecord),
    Heap(HeapRecord),
    DescriptorHeap(DescriptorHeapRecord),
    Fence(FenceRecord),
}

/// One trackable API object.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedObject {
    pub key: ObjectKey,
    pub kind: ObjectKind,
    pub native: NativeHandle,
    pub parent: Option<ObjectKey>,
    pub children: BTreeSet<ObjectKey>,
    pub name: Option<String>,
    pub residency_priority: Option<u32>,
    pub ref_count: u32,
    pub destroyed: bool,
    /// Destroyed by the application but still required as a restore dependency.
    pub keep_destroyed: bool,
    /// The call that created the object; replayed verbatim (modulo state rewrites) on restore.
    pub creation: Option<CommandRecord>,
    pub payload: ObjectPayload,
}

impl TrackedObject {
    pub fn new(key: ObjectKey, kind: ObjectKind) -> Self {
        Self {
            key,
            kind,
            native: NativeHandle::default(),
            parent: None,
            children: BTreeSet::new(),
            name: None,
            residency_priority: None,
            ref_count: 1,
            destroyed: false,
            keep_destroyed: false,
            creation: None,
            payload: ObjectPayload::None,
        }
    }

    pub fn with_parent(mut self, parent: Option<ObjectKey>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_payload(mut self, payload: ObjectPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_creation(mut self, creation: CommandRecord) -> Self {
        self.creation = Some(creation);
        self
    }

    pub fn resource(&self) -> Option<&ResourceRecord> {
        match &self.payload {
            ObjectPayload::Resource(record) => Some(record),
            _ => None,
        }
    }

    /// Live from the point of view of a restore: either still referenced by the application or
    /// retained as a dependency.
    pub fn is_restorable(&self) -> bool {
        !self.destroyed || self.keep_destroyed
    }
}
