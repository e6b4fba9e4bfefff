//! Structured records of intercepted (and synthesized) API calls.
//!
//! Every handle argument has already been resolved to an [`ObjectKey`] by the interception layer.
//! The same vocabulary is used in both directions: inbound records drive tracking, and the
//! restore routines emit records of the same shape into the outgoing stream.

use serde::{Deserialize, Serialize};

use crate::accel::{BuildDesc, CopyMode, GpuAddressArg, OmmArrayDesc};
use crate::descriptors::{DescriptorHandle, DescriptorHeapType, DescriptorRecord};
use crate::gpu::PlacedFootprint;
use crate::model::{
    CommandKey, Format, HeapFlags, HeapType, ObjectKey, ObjectKind, ResourceDesc, ResourceStates,
};
use crate::tiled::{TileRangeFlag, TileRegion, TileRegionSize, TiledResourceCoordinate};

/// `D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES`.
pub const ALL_SUBRESOURCES: u32 = 0xffff_ffff;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub key: CommandKey,
    pub command: Command,
}

impl CommandRecord {
    pub fn new(key: CommandKey, command: Command) -> Self {
        Self { key, command }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandListType {
    Direct,
    Bundle,
    Compute,
    Copy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceBarrier {
    Transition {
        resource: ObjectKey,
        subresource: u32,
        before: ResourceStates,
        after: ResourceStates,
    },
    Aliasing {
        before: Option<ObjectKey>,
        after: Option<ObjectKey>,
    },
    Uav {
        resource: Option<ObjectKey>,
    },
}

impl ResourceBarrier {
    pub fn transition(resource: ObjectKey, before: ResourceStates, after: ResourceStates) -> Self {
        ResourceBarrier::Transition {
            resource,
            subresource: ALL_SUBRESOURCES,
            before,
            after,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyLocation {
    Subresource(u32),
    Footprint(PlacedFootprint),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureCopyLocation {
    pub resource: ObjectKey,
    pub location: CopyLocation,
}

/// One intercepted entry point and its resolved arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    CreateDevice {
        device: ObjectKey,
        adapter: Option<ObjectKey>,
    },
    /// Creation of any object the engine only tracks by identity (pipelines, root signatures,
    /// query heaps, factories, ...).
    CreateObject {
        kind: ObjectKind,
        object: ObjectKey,
        parent: Option<ObjectKey>,
    },
    CreateCommandQueue {
        device: ObjectKey,
        queue: ObjectKey,
        list_type: CommandListType,
    },
    CreateCommandAllocator {
        device: ObjectKey,
        allocator: ObjectKey,
        list_type: CommandListType,
    },
    /// Lists are created open.
    CreateCommandList {
        device: ObjectKey,
        list: ObjectKey,
        allocator: ObjectKey,
        list_type: CommandListType,
        initial_pipeline: Option<ObjectKey>,
    },
    CreateHeap {
        device: ObjectKey,
        heap: ObjectKey,
        size: u64,
        heap_type: HeapType,
        flags: HeapFlags,
    },
    CreateCommittedResource {
        device: ObjectKey,
        resource: ObjectKey,
        heap_type: HeapType,
        heap_flags: HeapFlags,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        gpu_va: u64,
        protected_session: Option<ObjectKey>,
    },
    CreatePlacedResource {
        device: ObjectKey,
        resource: ObjectKey,
        heap: ObjectKey,
        heap_offset: u64,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        gpu_va: u64,
    },
    CreateReservedResource {
        device: ObjectKey,
        resource: ObjectKey,
        desc: ResourceDesc,
        initial_state: ResourceStates,
        gpu_va: u64,
    },
    CreateDescriptorHeap {
        device: ObjectKey,
        heap: ObjectKey,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    },
    CreateFence {
        device: ObjectKey,
        fence: ObjectKey,
        initial_value: u64,
    },
    CreateSwapChain {
        factory: Option<ObjectKey>,
        queue: ObjectKey,
        swap_chain: ObjectKey,
        buffer_count: u32,
        width: u32,
        height: u32,
        format: Format,
    },
    GetSwapChainBuffer {
        swap_chain: ObjectKey,
        index: u32,
        resource: ObjectKey,
        desc: ResourceDesc,
    },
    AddRef {
        object: ObjectKey,
    },
    Release {
        object: ObjectKey,
    },
    SetName {
        object: ObjectKey,
        name: String,
    },
    SetResidencyPriority {
        device: ObjectKey,
        objects: Vec<ObjectKey>,
        priorities: Vec<u32>,
    },
    MakeResident {
        device: ObjectKey,
        objects: Vec<ObjectKey>,
    },
    EnqueueMakeResident {
        device: ObjectKey,
        objects: Vec<ObjectKey>,
        fence: ObjectKey,
        fence_value: u64,
    },
    Evict {
        device: ObjectKey,
        objects: Vec<ObjectKey>,
    },
    CreateView {
        device: ObjectKey,
        view: DescriptorRecord,
        dest: DescriptorHandle,
    },
    CopyDescriptorsSimple {
        device: ObjectKey,
        count: u32,
        dest: DescriptorHandle,
        src: DescriptorHandle,
        heap_type: DescriptorHeapType,
    },
    Map {
        resource: ObjectKey,
        subresource: u32,
    },
    Unmap {
        resource: ObjectKey,
        subresource: u32,
    },
    FenceSignal {
        fence: ObjectKey,
        value: u64,
    },
    QueueSignal {
        queue: ObjectKey,
        fence: ObjectKey,
        value: u64,
    },
    QueueWait {
        queue: ObjectKey,
        fence: ObjectKey,
        value: u64,
    },
    /// CPU-side wait until `fence` reaches `value`.
    WaitForFence {
        fence: ObjectKey,
        value: u64,
    },
    ExecuteCommandLists {
        queue: ObjectKey,
        lists: Vec<ObjectKey>,
    },
    UpdateTileMappings {
        queue: ObjectKey,
        resource: ObjectKey,
        heap: Option<ObjectKey>,
        regions: Vec<TileRegion>,
        range_flags: Vec<TileRangeFlag>,
        heap_range_offsets: Vec<u32>,
        range_tile_counts: Vec<u32>,
    },
    CopyTileMappings {
        queue: ObjectKey,
        dst_resource: ObjectKey,
        dst_coordinate: TiledResourceCoordinate,
        src_resource: ObjectKey,
        src_coordinate: TiledResourceCoordinate,
        size: TileRegionSize,
    },
    Present {
        swap_chain: ObjectKey,
        sync_interval: u32,
        flags: u32,
    },
    /// An entry point the engine does not model; tracked only for diagnostics.
    Unsupported {
        entry_point: String,
        object: Option<ObjectKey>,
    },

    CommandListReset {
        list: ObjectKey,
        allocator: ObjectKey,
        initial_pipeline: Option<ObjectKey>,
    },
    CommandListClose {
        list: ObjectKey,
    },
    CommandAllocatorReset {
        allocator: ObjectKey,
    },
    ResourceBarrier {
        list: ObjectKey,
        barriers: Vec<ResourceBarrier>,
    },
    CopyBufferRegion {
        list: ObjectKey,
        dst: ObjectKey,
        dst_offset: u64,
        src: ObjectKey,
        src_offset: u64,
        size: u64,
    },
    CopyTextureRegion {
        list: ObjectKey,
        dst: TextureCopyLocation,
        src: TextureCopyLocation,
    },
    CopyResource {
        list: ObjectKey,
        dst: ObjectKey,
        src: ObjectKey,
    },
    SetPipelineState {
        list: ObjectKey,
        pipeline: ObjectKey,
    },
    SetRootSignature {
        list: ObjectKey,
        root_signature: ObjectKey,
        compute: bool,
    },
    SetDescriptorHeaps {
        list: ObjectKey,
        heaps: Vec<ObjectKey>,
    },
    DrawInstanced {
        list: ObjectKey,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    Dispatch {
        list: ObjectKey,
        x: u32,
        y: u32,
        z: u32,
    },
    OmSetRenderTargets {
        list: ObjectKey,
        render_targets: Vec<DescriptorHandle>,
        /// With a single-handle range, `render_targets[0]` is the first of consecutive slots and
        /// the vector length is the target count.
        single_handle_range: bool,
        depth_stencil: Option<DescriptorHandle>,
    },
    ClearRenderTargetView {
        list: ObjectKey,
        view: DescriptorHandle,
        color: [f32; 4],
    },
    ClearDepthStencilView {
        list: ObjectKey,
        view: DescriptorHandle,
        flags: u32,
        depth: f32,
        stencil: u8,
    },
    ClearUnorderedAccessViewUint {
        list: ObjectKey,
        gpu_view: DescriptorHandle,
        cpu_view: DescriptorHandle,
        resource: ObjectKey,
        values: [u32; 4],
    },
    ClearUnorderedAccessViewFloat {
        list: ObjectKey,
        gpu_view: DescriptorHandle,
        cpu_view: DescriptorHandle,
        resource: ObjectKey,
        values: [f32; 4],
    },
    BuildRaytracingAccelerationStructure {
        list: ObjectKey,
        desc: BuildDesc,
    },
    CopyRaytracingAccelerationStructure {
        list: ObjectKey,
        dest: GpuAddressArg,
        source: GpuAddressArg,
        mode: CopyMode,
    },
    NvApiBuildRaytracingAccelerationStructureEx {
        list: ObjectKey,
        desc: BuildDesc,
        ex_flags: u32,
    },
    NvApiBuildRaytracingOpacityMicromapArray {
        list: ObjectKey,
        desc: OmmArrayDesc,
    },
}

impl Command {
    /// Name of the API entry point, for logs and diagnostics.
    pub fn entry_point(&self) -> &'static str {
        match self {
            Command::CreateDevice { .. } => "D3D12CreateDevice",
            Command::CreateObject { .. } => "Create",
            Command::CreateCommandQueue { .. } => "ID3D12Device::CreateCommandQueue",
            Command::CreateCommandAllocator { .. } => "ID3D12Device::CreateCommandAllocator",
            Command::CreateCommandList { .. } => "ID3D12Device::CreateCommandList",
            Command::CreateHeap { .. } => "ID3D12Device::CreateHeap",
            Command::CreateCommittedResource { .. } => "ID3D12Device::CreateCommittedResource",
            Command::CreatePlacedResource { .. } => "ID3D12Device::CreatePlacedResource",
            Command::CreateReservedResource { .. } => "ID3D12Device::CreateReservedResource",
            Command::CreateDescriptorHeap { .. } => "ID3D12Device::CreateDescriptorHeap",
            Command::CreateFence { .. } => "ID3D12Device::CreateFence",
            Command::CreateSwapChain { .. } => "IDXGIFactory::CreateSwapChain",
            Command::GetSwapChainBuffer { .. } => "IDXGISwapChain::GetBuffer",
            Command::AddRef { .. } => "IUnknown::AddRef",
            Command::Release { .. } => "IUnknown::Release",
            Command::SetName { .. } => "ID3D12Object::SetName",
            Command::SetResidencyPriority { .. } => "ID3D12Device1::SetResidencyPriority",
            Command::MakeResident { .. } => "ID3D12Device::MakeResident",
            Command::EnqueueMakeResident { .. } => "ID3D12Device3::EnqueueMakeResident",
            Command::Evict { .. } => "ID3D12Device::Evict",
            Command::CreateView { .. } => "ID3D12Device::CreateView",
            Command::CopyDescriptorsSimple { .. } => "ID3D12Device::CopyDescriptorsSimple",
            Command::Map { .. } => "ID3D12Resource::Map",
            Command::Unmap { .. } => "ID3D12Resource::Unmap",
            Command::FenceSignal { .. } => "ID3D12Fence::Signal",
            Command::QueueSignal { .. } => "ID3D12CommandQueue::Signal",
            Command::QueueWait { .. } => "ID3D12CommandQueue::Wait",
            Command::WaitForFence { .. } => "ID3D12Fence::SetEventOnCompletion",
            Command::ExecuteCommandLists { .. } => "ID3D12CommandQueue::ExecuteCommandLists",
            Command::UpdateTileMappings { .. } => "ID3D12CommandQueue::UpdateTileMappings",
            Command::CopyTileMappings { .. } => "ID3D12CommandQueue::CopyTileMappings",
            Command::Present { .. } => "IDXGISwapChain::Present",
            Command::Unsupported { .. } => "Unsupported",
            Command::CommandListReset { .. } => "ID3D12GraphicsCommandList::Reset",
            Command::CommandListClose { .. } => "ID3D12GraphicsCommandList::Close",
            Command::CommandAllocatorReset { .. } => "ID3D12CommandAllocator::Reset",
            Command::ResourceBarrier { .. } => "ID3D12GraphicsCommandList::ResourceBarrier",
            Command::CopyBufferRegion { .. } => "ID3D12GraphicsCommandList::CopyBufferRegion",
            Command::CopyTextureRegion { .. } => "ID3D12GraphicsCommandList::CopyTextureRegion",
            Command::CopyResource { .. } => "ID3D12GraphicsCommandList::CopyResource",
            Command::SetPipelineState { .. } => "ID3D12GraphicsCommandList::SetPipelineState",
            Command::SetRootSignature { .. } => "ID3D12GraphicsCommandList::SetRootSignature",
            Command::SetDescriptorHeaps { .. } => "ID3D12GraphicsCommandList::SetDescriptorHeaps",
            Command::DrawInstanced { .. } => "ID3D12GraphicsCommandList::DrawInstanced",
            Command::Dispatch { .. } => "ID3D12GraphicsCommandList::Dispatch",
            Command::OmSetRenderTargets { .. } => "ID3D12GraphicsCommandList::OMSetRenderTargets",
            Command::ClearRenderTargetView { .. } => {
                "ID3D12GraphicsCommandList::ClearRenderTargetView"
            }
            Command::ClearDepthStencilView { .. } => {
                "ID3D12GraphicsCommandList::ClearDepthStencilView"
            }
            Command::ClearUnorderedAccessViewUint { .. } => {
                "ID3D12GraphicsCommandList::ClearUnorderedAccessViewUint"
            }
            Command::ClearUnorderedAccessViewFloat { .. } => {
                "ID3D12GraphicsCommandList::ClearUnorderedAccessViewFloat"
            }
            Command::BuildRaytracingAccelerationStructure { .. } => {
                "ID3D12GraphicsCommandList4::BuildRaytracingAccelerationStructure"
            }
            Command::CopyRaytracingAccelerationStructure { .. } => {
                "ID3D12GraphicsCommandList4::CopyRaytracingAccelerationStructure"
            }
            Command::NvApiBuildRaytracingAccelerationStructureEx { .. } => {
                "NvAPI_D3D12_BuildRaytracingAccelerationStructureEx"
            }
            Command::NvApiBuildRaytracingOpacityMicromapArray { .. } => {
                "NvAPI_D3D12_BuildRaytracingOpacityMicromapArray"
            }
        }
    }

    /// The command list a recorded command belongs to. `Reset` and `Close` are list-level
    /// operations and are not considered recorded commands.
    pub fn command_list(&self) -> Option<ObjectKey> {
        match self {
            Command::ResourceBarrier { list, .. }
            | Command::CopyBufferRegion { list, .. }
            | Command::CopyTextureRegion { list, .. }
            | Command::CopyResource { list, .. }
            | Command::SetPipelineState { list, .. }
            | Command::SetRootSignature { list, .. }
            | Command::SetDescriptorHeaps { list, .. }
            | Command::DrawInstanced { list, .. }
            | Command::Dispatch { list, .. }
            | Command::OmSetRenderTargets { list, .. }
            | Command::ClearRenderTargetView { list, .. }
            | Command::ClearDepthStencilView { list, .. }
            | Command::ClearUnorderedAccessViewUint { list, .. }
            | Command::ClearUnorderedAccessViewFloat { list, .. }
            | Command::BuildRaytracingAccelerationStructure { list, .. }
            | Command::CopyRaytracingAccelerationStructure { list, .. }
            | Command::NvApiBuildRaytracingAccelerationStructureEx { list, .. }
            | Command::NvApiBuildRaytracingOpacityMicromapArray { list, .. } => Some(*list),
            _ => None,
        }
    }

    /// Rebinds a recorded command to another command list.
    pub fn set_command_list(&mut self, new_list: ObjectKey) {
        match self {
            Command::ResourceBarrier { list, .. }
            | Command::CopyBufferRegion { list, .. }
            | Command::CopyTextureRegion { list, .. }
            | Command::CopyResource { list, .. }
            | Command::SetPipelineState { list, .. }
            | Command::SetRootSignature { list, .. }
            | Command::SetDescriptorHeaps { list, .. }
            | Command::DrawInstanced { list, .. }
            | Command::Dispatch { list, .. }
            | Command::OmSetRenderTargets { list, .. }
            | Command::ClearRenderTargetView { list, .. }
            | Command::ClearDepthStencilView { list, .. }
            | Command::ClearUnorderedAccessViewUint { list, .. }
            | Command::ClearUnorderedAccessViewFloat { list, .. }
            | Command::BuildRaytracingAccelerationStructure { list, .. }
            | Command::CopyRaytracingAccelerationStructure { list, .. }
            | Command::NvApiBuildRaytracingAccelerationStructureEx { list, .. }
            | Command::NvApiBuildRaytracingOpacityMicromapArray { list, .. } => *list = new_list,
            _ => {}
        }
    }

    /// Descriptor slots whose view description is embedded in the command.
    pub fn referenced_views(&self) -> Vec<DescriptorHandle> {
        match self {
            Command::OmSetRenderTargets {
                render_targets,
                single_handle_range,
                depth_stencil,
                ..
            } => {
                let mut views: Vec<DescriptorHandle> = if *single_handle_range {
                    render_targets
                        .first()
                        .map(|first| {
                            (0..render_targets.len() as u32)
                                .map(|i| first.offset(i))
                                .collect()
                        })
                        .unwrap_or_default()
                } else {
                    render_targets.clone()
                };
                views.extend(depth_stencil.iter().copied());
                views
            }
            Command::ClearRenderTargetView { view, .. }
            | Command::ClearDepthStencilView { view, .. } => vec![*view],
            Command::ClearUnorderedAccessViewUint {
                gpu_view, cpu_view, ..
            }
            | Command::ClearUnorderedAccessViewFloat {
                gpu_view, cpu_view, ..
            } => vec![*gpu_view, *cpu_view],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_handle_ranges_expand_to_consecutive_slots() {
        let command = Command::OmSetRenderTargets {
            list: ObjectKey(1),
            render_targets: vec![
                DescriptorHandle::new(ObjectKey(9), 4),
                DescriptorHandle::new(ObjectKey(9), 4),
                DescriptorHandle::new(ObjectKey(9), 4),
            ],
            single_handle_range: true,
            depth_stencil: Some(DescriptorHandle::new(ObjectKey(10), 0)),
        };
        assert_eq!(
            command.referenced_views(),
            vec![
                DescriptorHandle::new(ObjectKey(9), 4),
                DescriptorHandle::new(ObjectKey(9), 5),
                DescriptorHandle::new(ObjectKey(9), 6),
                DescriptorHandle::new(ObjectKey(10), 0),
            ]
        );
    }

    #[test]
    fn list_commands_can_be_rebound() {
        let mut command = Command::Dispatch {
            list: ObjectKey(1),
            x: 1,
            y: 1,
            z: 1,
        };
        assert_eq!(command.command_list(), Some(ObjectKey(1)));
        command.set_command_list(ObjectKey(2));
        assert_eq!(command.command_list(), Some(ObjectKey(2)));
        assert_eq!(
            Command::CommandListClose { list: ObjectKey(2) }.command_list(),
            None
        );
    }
}
