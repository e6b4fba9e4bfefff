//! Routes intercepted calls into the trackers and, at the start of the subcapture, writes the
//! synthesized commands that recreate the tracked state.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accel::{
    AccelerationStructureOp, AccelerationStructureState, AccelerationStructureTracker,
    BuildDesc, CapturedInput, GeometryDesc, GpuAddressArg, OmmArrayDesc, RestoreSummary,
};
use crate::analysis::AnalyzerResults;
use crate::aux_views::{AuxiliaryViewSynthesizer, CapturedDescriptor};
use crate::command::{Command, CommandListType, CommandRecord};
use crate::config::SubcaptureConfig;
use crate::content::{ContentPipeline, ContentStats};
use crate::descriptors::DescriptorTracker;
use crate::diagnostics::{Diagnostics, Limitation};
use crate::error::{Result, SubcaptureError};
use crate::gpu::{CancelToken, FenceWaiter, GpuDevice};
use crate::model::{
    DescriptorHeapRecord, FenceRecord, HeapFlags, HeapRecord, HeapType, KeyAllocator, KeyOffset,
    ObjectKey, ObjectKind, ObjectPayload, ObjectRegistry, ReleaseOutcome, ResourceRecord,
    ResourceStates, TrackedObject,
};
use crate::range::{RangeState, SubcaptureRange};
use crate::residency::ResidencyReconciler;
use crate::resource_states::{ResourceStateTracker, StateClass};
use crate::stream::{CommandSink, RecordedCommand, RestoreQueue, RestoreStream};
use crate::tiled::TiledResourceTracker;

/// A command recorded on a list that has not been reset since, with the descriptors it
/// referenced at record time.
#[derive(Clone, Debug)]
struct DeferredCommand {
    record: CommandRecord,
    views: Vec<CapturedDescriptor>,
}

#[derive(Debug)]
struct CommandListState {
    allocator: ObjectKey,
    initial_pipeline: Option<ObjectKey>,
    open: bool,
    commands: Vec<DeferredCommand>,
}

/// What one run of [`StateOrchestrator::restore_state`] wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub objects: usize,
    pub fences: usize,
    pub structures_pruned: usize,
    pub structures: RestoreSummary,
    pub tile_updates: usize,
    pub mappable_resources: usize,
    pub content_batches: usize,
    pub descriptors: usize,
    pub barriers: usize,
    pub residency_calls: usize,
    pub deferred_commands: usize,
    pub released: usize,
    pub commands_written: u64,
}

/// Owns every tracker for one capture session.
pub struct StateOrchestrator<G: GpuDevice, S: CommandSink> {
    gpu: G,
    sink: S,
    keys: KeyAllocator,
    analysis: AnalyzerResults,
    range: SubcaptureRange,
    diagnostics: Diagnostics,
    registry: ObjectRegistry,
    states: ResourceStateTracker,
    tiles: TiledResourceTracker,
    content: ContentPipeline,
    structures: AccelerationStructureTracker,
    residency: ResidencyReconciler,
    descriptors: DescriptorTracker,
    aux_views: AuxiliaryViewSynthesizer,
    lists: BTreeMap<ObjectKey, CommandListState>,
    protected: BTreeSet<ObjectKey>,
    device: Option<ObjectKey>,
    report: Option<RestoreReport>,
    cancel: CancelToken,
}

impl<G: GpuDevice, S: CommandSink> StateOrchestrator<G, S> {
    /// Builds an orchestrator, loading the analysis artifact when `config.use_analysis` is set.
    /// A missing artifact restores everything.
    pub fn new(config: &SubcaptureConfig, gpu: G, sink: S) -> Result<Self> {
        let analysis = if config.use_analysis {
            AnalyzerResults::load_optional(&config.analysis_path())?
        } else {
            AnalyzerResults::absent()
        };
        Ok(Self::with_analysis(config, gpu, sink, analysis))
    }

    pub fn with_analysis(
        config: &SubcaptureConfig,
        gpu: G,
        sink: S,
        analysis: AnalyzerResults,
    ) -> Self {
        let cancel = CancelToken::new();
        Self {
            gpu,
            sink,
            keys: KeyAllocator::new(),
            analysis,
            range: SubcaptureRange::new(config.frames, config.executions),
            diagnostics: Diagnostics::new(),
            registry: ObjectRegistry::new(),
            states: ResourceStateTracker::new(),
            tiles: TiledResourceTracker::new(),
            content: ContentPipeline::new(config, FenceWaiter::new(cancel.clone())),
            structures: AccelerationStructureTracker::new(config.optimize),
            residency: ResidencyReconciler::new(),
            descriptors: DescriptorTracker::new(),
            aux_views: AuxiliaryViewSynthesizer::new(config.aux_heap_capacity),
            lists: BTreeMap::new(),
            protected: BTreeSet::new(),
            device: None,
            report: None,
            cancel,
        }
    }

    /// Token that aborts fence waits in progress, for callers shutting the session down.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn range(&self) -> &SubcaptureRange {
        &self.range
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn structures(&self) -> &AccelerationStructureTracker {
        &self.structures
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn content_stats(&self) -> ContentStats {
        self.content.stats()
    }

    /// Set once the restore ran.
    pub fn report(&self) -> Option<&RestoreReport> {
        self.report.as_ref()
    }

    /// Handles one intercepted call.
    ///
    /// Before the range, calls are only tracked. The first call inside the range triggers the
    /// restore, then calls are forwarded to the sink unchanged until the range ends.
    pub fn process(&mut self, record: CommandRecord) -> Result<()> {
        let at_start = self.range.is_frame_range_start() || self.range.is_execution_range_start();
        if self.report.is_none() && at_start {
            self.restore_state()?;
        }

        match self.range.state() {
            RangeState::BeforeRange => self.track(&record)?,
            RangeState::InRange => self.sink.write(RecordedCommand {
                key: record.key,
                command: record.command.clone(),
                mapped_data: None,
            }),
            RangeState::AfterRange => {}
        }

        match record.command {
            Command::Present { .. } => self.range.frame_end(),
            Command::ExecuteCommandLists { .. } => self.range.execution_end(),
            _ => {}
        }
        Ok(())
    }

    fn insert(
        &mut self,
        record: &CommandRecord,
        key: ObjectKey,
        kind: ObjectKind,
        parent: Option<ObjectKey>,
        payload: ObjectPayload,
    ) -> Result<()> {
        self.registry.insert(
            TrackedObject::new(key, kind)
                .with_parent(parent)
                .with_payload(payload)
                .with_creation(record.clone()),
        )
    }

    fn track_resource(
        &mut self,
        record: &CommandRecord,
        key: ObjectKey,
        kind: ObjectKind,
        parent: ObjectKey,
        resource: ResourceRecord,
    ) -> Result<()> {
        if !resource.desc.is_buffer() && resource.desc.format.bytes_per_element().is_none() {
            self.diagnostics.warn_once(
                Limitation::UnknownTextureFormat,
                format_args!("{key} {:?}", resource.desc.format),
            );
        }
        self.states.record_creation(
            key,
            resource.initial_state,
            resource.desc.subresource_count(),
            StateClass::of(&resource),
        );
        if resource.created_not_resident() {
            self.residency.created_not_resident(key, parent);
        }
        self.insert(record, key, kind, Some(parent), ObjectPayload::Resource(resource))
    }

    fn track(&mut self, record: &CommandRecord) -> Result<()> {
        match &record.command {
            Command::CreateDevice { device, adapter } => {
                self.device.get_or_insert(*device);
                self.insert(record, *device, ObjectKind::Device, *adapter, ObjectPayload::None)?;
            }
            Command::CreateObject {
                kind,
                object,
                parent,
            } => self.insert(record, *object, *kind, *parent, ObjectPayload::None)?,
            Command::CreateCommandQueue { device, queue, .. } => {
                self.insert(
                    record,
                    *queue,
                    ObjectKind::CommandQueue,
                    Some(*device),
                    ObjectPayload::None,
                )?
            }
            Command::CreateCommandAllocator {
                device, allocator, ..
            } => self.insert(
                record,
                *allocator,
                ObjectKind::CommandAllocator,
                Some(*device),
                ObjectPayload::None,
            )?,
            Command::CreateCommandList {
                device,
                list,
                allocator,
                initial_pipeline,
                ..
            } => {
                self.insert(
                    record,
                    *list,
                    ObjectKind::GraphicsCommandList,
                    Some(*device),
                    ObjectPayload::None,
                )?;
                self.lists.insert(
                    *list,
                    CommandListState {
                        allocator: *allocator,
                        initial_pipeline: *initial_pipeline,
                        open: true,
                        commands: Vec::new(),
                    },
                );
            }
            Command::CreateHeap {
                device,
                heap,
                size,
                heap_type,
                flags,
            } => {
                if flags.contains(HeapFlags::CREATE_NOT_RESIDENT) {
                    self.residency.created_not_resident(*heap, *device);
                }
                let payload = ObjectPayload::Heap(HeapRecord {
                    size: *size,
                    heap_type: *heap_type,
                    flags: *flags,
                });
                self.insert(record, *heap, ObjectKind::Heap, Some(*device), payload)?;
            }
            Command::CreateCommittedResource {
                device,
                resource,
                heap_type,
                heap_flags,
                desc,
                initial_state,
                gpu_va,
                protected_session,
            } => {
                if protected_session.is_some() {
                    self.diagnostics.warn_once(Limitation::ProtectedResource, resource);
                    self.protected.insert(*resource);
                }
                let mut tracked = ResourceRecord::new(*desc, *heap_type, *initial_state)
                    .with_gpu_va(*gpu_va);
                tracked.heap_flags = *heap_flags;
                self.track_resource(
                    record,
                    *resource,
                    ObjectKind::CommittedResource,
                    *device,
                    tracked,
                )?;
            }
            Command::CreatePlacedResource {
                resource,
                heap,
                heap_offset,
                desc,
                initial_state,
                gpu_va,
                ..
            } => {
                let heap_record = match &self.registry.require(*heap)?.payload {
                    ObjectPayload::Heap(heap_record) => *heap_record,
                    _ => {
                        return Err(SubcaptureError::WrongKind {
                            key: *heap,
                            found: self.registry.require(*heap)?.kind,
                            expected: "heap",
                        })
                    }
                };
                let mut tracked = ResourceRecord::new(*desc, heap_record.heap_type, *initial_state)
                    .with_gpu_va(*gpu_va);
                tracked.placement = Some(KeyOffset::new(*heap, *heap_offset));
                // Residency belongs to the heap; the placed resource follows it.
                tracked.heap_flags = heap_record.flags - HeapFlags::CREATE_NOT_RESIDENT;
                self.track_resource(record, *resource, ObjectKind::PlacedResource, *heap, tracked)?;
            }
            Command::CreateReservedResource {
                device,
                resource,
                desc,
                initial_state,
                gpu_va,
            } => {
                let mut tracked =
                    ResourceRecord::new(*desc, HeapType::Default, *initial_state)
                        .with_gpu_va(*gpu_va);
                tracked.reserved = true;
                self.tiles
                    .register(*resource, desc, self.gpu.resource_tiling(desc));
                self.track_resource(
                    record,
                    *resource,
                    ObjectKind::ReservedResource,
                    *device,
                    tracked,
                )?;
            }
            Command::CreateDescriptorHeap {
                device,
                heap,
                heap_type,
                capacity,
                shader_visible,
            } => {
                self.descriptors
                    .create_heap(*heap, *heap_type, *capacity, *shader_visible);
                let payload = ObjectPayload::DescriptorHeap(DescriptorHeapRecord {
                    heap_type: *heap_type,
                    capacity: *capacity,
                    shader_visible: *shader_visible,
                });
                self.insert(record, *heap, ObjectKind::DescriptorHeap, Some(*device), payload)?;
            }
            Command::CreateFence {
                device,
                fence,
                initial_value,
            } => {
                let payload = ObjectPayload::Fence(FenceRecord {
                    value: *initial_value,
                });
                self.insert(record, *fence, ObjectKind::Fence, Some(*device), payload)?;
            }
            Command::CreateSwapChain {
                queue, swap_chain, ..
            } => self.insert(
                record,
                *swap_chain,
                ObjectKind::SwapChain,
                Some(*queue),
                ObjectPayload::None,
            )?,
            Command::GetSwapChainBuffer {
                swap_chain,
                resource,
                desc,
                ..
            } => {
                if self.registry.contains(*resource) {
                    // Every GetBuffer call hands out another reference to the same buffer.
                    self.registry.add_ref(*resource)?;
                } else {
                    let mut tracked = ResourceRecord::new(
                        *desc,
                        HeapType::Default,
                        ResourceStates::PRESENT,
                    );
                    tracked.back_buffer = true;
                    self.track_resource(
                        record,
                        *resource,
                        ObjectKind::BackBuffer,
                        *swap_chain,
                        tracked,
                    )?;
                }
            }
            Command::AddRef { object } => {
                self.registry.add_ref(*object)?;
            }
            Command::Release { object } => {
                if matches!(self.registry.release(*object)?, ReleaseOutcome::Removed) {
                    self.forget(*object);
                }
            }
            Command::SetName { object, name } => {
                self.registry.require_mut(*object)?.name = Some(name.clone());
            }
            Command::SetResidencyPriority {
                objects,
                priorities,
                ..
            } => {
                for (object, priority) in objects.iter().zip(priorities) {
                    self.registry.require_mut(*object)?.residency_priority = Some(*priority);
                }
            }
            Command::MakeResident { device, objects } => {
                self.residency.observe(objects, 1, *device)
            }
            Command::EnqueueMakeResident {
                device,
                objects,
                fence,
                fence_value,
            } => {
                self.residency.observe(objects, 1, *device);
                self.signal(*fence, *fence_value)?;
            }
            Command::Evict { device, objects } => self.residency.observe(objects, -1, *device),
            Command::CreateView { view, dest, .. } => self.descriptors.set(*dest, view.clone())?,
            Command::CopyDescriptorsSimple {
                count, dest, src, ..
            } => self.descriptors.copy(*dest, *src, *count)?,
            Command::FenceSignal { fence, value } | Command::QueueSignal { fence, value, .. } => {
                self.signal(*fence, *value)?
            }
            Command::ExecuteCommandLists { lists, .. } => {
                for list in lists {
                    self.execute(*list)?;
                }
            }
            Command::UpdateTileMappings {
                resource,
                heap,
                regions,
                range_flags,
                heap_range_offsets,
                range_tile_counts,
                ..
            } => self.tiles.apply_tile_mapping_update(
                *resource,
                *heap,
                regions,
                range_flags,
                heap_range_offsets,
                range_tile_counts,
                &mut self.diagnostics,
            )?,
            Command::CopyTileMappings {
                dst_resource,
                dst_coordinate,
                src_resource,
                src_coordinate,
                size,
                ..
            } => self.tiles.copy_tile_mappings(
                *dst_resource,
                *dst_coordinate,
                *src_resource,
                *src_coordinate,
                *size,
            )?,
            Command::Unsupported { entry_point, .. } => {
                self.diagnostics
                    .warn_once(Limitation::UnsupportedEntryPoint, entry_point);
            }
            Command::CommandListReset {
                list,
                allocator,
                initial_pipeline,
            } => {
                let state = self.list_mut(*list)?;
                state.allocator = *allocator;
                state.initial_pipeline = *initial_pipeline;
                state.open = true;
                state.commands.clear();
            }
            Command::CommandListClose { list } => self.list_mut(*list)?.open = false,
            Command::Map { .. }
            | Command::Unmap { .. }
            | Command::QueueWait { .. }
            | Command::WaitForFence { .. }
            | Command::CommandAllocatorReset { .. }
            | Command::Present { .. } => {}
            command => {
                let Some(list) = command.command_list() else {
                    debug!(entry_point = command.entry_point(), "untracked call");
                    return Ok(());
                };
                let views = CapturedDescriptor::capture(command, &self.descriptors);
                self.list_mut(list)?.commands.push(DeferredCommand {
                    record: record.clone(),
                    views,
                });
            }
        }
        Ok(())
    }

    fn list_mut(&mut self, list: ObjectKey) -> Result<&mut CommandListState> {
        self.lists
            .get_mut(&list)
            .ok_or(SubcaptureError::UnknownCommandList(list))
    }

    fn signal(&mut self, fence: ObjectKey, value: u64) -> Result<()> {
        if let ObjectPayload::Fence(record) = &mut self.registry.require_mut(fence)?.payload {
            record.value = value;
        }
        Ok(())
    }

    /// Drops tracking state of an object that left the registry.
    fn forget(&mut self, key: ObjectKey) {
        self.states.forget(key);
        self.tiles.remove(key);
        self.descriptors.destroy_heap(key);
        self.residency.forget(key);
        self.lists.remove(&key);
        self.protected.remove(&key);
    }

    /// Applies the effects of one executed list: its barriers and its acceleration structure
    /// operations.
    fn execute(&mut self, list: ObjectKey) -> Result<()> {
        let commands: Vec<CommandRecord> = self
            .lists
            .get(&list)
            .ok_or(SubcaptureError::UnknownCommandList(list))?
            .commands
            .iter()
            .map(|deferred| deferred.record.clone())
            .collect();
        for record in commands {
            match &record.command {
                Command::ResourceBarrier { barriers, .. } => self.states.apply(barriers)?,
                Command::BuildRaytracingAccelerationStructure { desc, .. } => {
                    let op = AccelerationStructureOp::Build(self.resolve_build(desc)?);
                    self.capture_structure(&record, list, op)?;
                }
                Command::NvApiBuildRaytracingAccelerationStructureEx { desc, ex_flags, .. } => {
                    let op = AccelerationStructureOp::NvApiBuild {
                        desc: self.resolve_build(desc)?,
                        ex_flags: *ex_flags,
                    };
                    self.capture_structure(&record, list, op)?;
                }
                Command::NvApiBuildRaytracingOpacityMicromapArray { desc, .. } => {
                    let op = AccelerationStructureOp::NvApiOmmBuild(self.resolve_omm(desc)?);
                    self.capture_structure(&record, list, op)?;
                }
                Command::CopyRaytracingAccelerationStructure {
                    dest, source, mode, ..
                } => {
                    if !mode.produces_structure() {
                        self.diagnostics.warn_once(
                            Limitation::AccelerationStructureCopyMode,
                            format_args!("{mode:?} at {}", record.key),
                        );
                        continue;
                    }
                    let op = AccelerationStructureOp::Copy {
                        dest: self.resolve(*dest)?,
                        source: self.resolve(*source)?,
                        mode: *mode,
                    };
                    self.capture_structure(&record, list, op)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fills in the resource behind a GPU address the interception layer left unresolved.
    fn resolve(&self, arg: GpuAddressArg) -> Result<GpuAddressArg> {
        if arg.is_null() || arg.target.is_some() {
            return Ok(arg);
        }
        let target = self
            .registry
            .resolve_address(arg.address)
            .ok_or(SubcaptureError::UnresolvedGpuAddress(arg.address))?;
        Ok(GpuAddressArg::resolved(arg.address, target))
    }

    fn resolve_build(&self, desc: &BuildDesc) -> Result<BuildDesc> {
        let mut resolved = desc.clone();
        resolved.dest = self.resolve(desc.dest)?;
        if desc.inputs.is_update() {
            resolved.source = self.resolve(desc.source)?;
        }
        resolved.inputs.instance_descs = self.resolve(desc.inputs.instance_descs)?;
        for geometry in &mut resolved.inputs.geometries {
            match geometry {
                GeometryDesc::Triangles { triangles, .. } => {
                    triangles.transform = self.resolve(triangles.transform)?;
                    triangles.index_buffer = self.resolve(triangles.index_buffer)?;
                    triangles.vertex_buffer = self.resolve(triangles.vertex_buffer)?;
                }
                GeometryDesc::ProceduralAabbs { aabbs, .. } => {
                    aabbs.aabbs = self.resolve(aabbs.aabbs)?;
                }
            }
        }
        Ok(resolved)
    }

    fn resolve_omm(&self, desc: &OmmArrayDesc) -> Result<OmmArrayDesc> {
        let mut resolved = *desc;
        resolved.dest = self.resolve(desc.dest)?;
        resolved.inputs.input_buffer = self.resolve(desc.inputs.input_buffer)?;
        resolved.inputs.per_omm_descs = self.resolve(desc.inputs.per_omm_descs)?;
        Ok(resolved)
    }

    fn capture_structure(
        &mut self,
        record: &CommandRecord,
        list: ObjectKey,
        op: AccelerationStructureOp,
    ) -> Result<()> {
        let ranges = match op.input_ranges() {
            Ok(ranges) => ranges,
            Err(reason) => {
                self.diagnostics.warn_once(
                    Limitation::InstanceArrayOfPointers,
                    format_args!("{reason:?} at {}", record.key),
                );
                return Ok(());
            }
        };
        let dest_arg = op.dest();
        let dest = dest_arg
            .target
            .ok_or(SubcaptureError::UnresolvedGpuAddress(dest_arg.address))?;

        let scratch_size = match &op {
            AccelerationStructureOp::Build(desc)
            | AccelerationStructureOp::NvApiBuild { desc, .. } => {
                let info = self.gpu.prebuild_info(&desc.inputs);
                if desc.inputs.is_update() {
                    info.update_scratch_size
                } else {
                    info.scratch_size
                }
            }
            AccelerationStructureOp::NvApiOmmBuild(desc) => {
                self.gpu.omm_prebuild_info(&desc.inputs).scratch_size
            }
            AccelerationStructureOp::Copy { .. } => 0,
        };

        let mut state = AccelerationStructureState::new(record.key, list, dest, op);
        state.scratch_size = scratch_size;
        for range in ranges {
            let location = self
                .resolve(range.address)?
                .target
                .ok_or(SubcaptureError::UnresolvedGpuAddress(range.address.address))?;
            let resource = self.registry.resource(location.key)?.clone();
            let content = self.content.capture_on_consumption(
                &mut self.gpu,
                location.key,
                &resource,
                location.offset,
                range.size,
                record.key,
            )?;
            if !resource.cpu_mappable {
                state.restore_payload += range.size;
            }
            let snapshotted = state
                .tiled_inputs
                .iter()
                .any(|tiled| tiled.key == location.key);
            if resource.reserved && !snapshotted {
                state.tiled_inputs.extend(self.tiles.snapshot(location.key));
            }
            state.inputs.push(CapturedInput {
                location,
                size: range.size,
                record: resource,
                content: Some(content),
            });
        }

        for key in state.referenced_resources() {
            self.registry.pin(key);
        }
        self.structures.store_state(state);
        self.release_removed_structures();
        Ok(())
    }

    /// Returns the pins and content references of states the tracker dropped.
    fn release_removed_structures(&mut self) {
        for state in self.structures.take_removed() {
            for input in &state.inputs {
                if let Some(content) = input.content {
                    self.content.release(content);
                }
            }
            for key in state.referenced_resources() {
                if self.registry.unpin(key) {
                    self.forget(key);
                }
            }
        }
    }

    /// Objects the restore recreates: every live object, narrowed by the analysis, plus the
    /// ancestors of everything kept.
    fn restore_set(&self) -> BTreeSet<ObjectKey> {
        let mut keep = BTreeSet::new();
        for object in self.registry.restorable() {
            let needed = match object.kind {
                ObjectKind::GraphicsCommandList => self.analysis.requires_command_list(object.key),
                kind if kind.is_infrastructure() => true,
                _ => {
                    self.analysis.requires_object(object.key)
                        || self.registry.is_pinned(object.key)
                }
            };
            if !needed {
                continue;
            }
            keep.insert(object.key);
            keep.extend(self.registry.ancestors(object.key));
            if let Some(list) = self.lists.get(&object.key) {
                keep.insert(list.allocator);
                keep.extend(self.registry.ancestors(list.allocator));
            }
        }
        keep
    }

    /// Writes the commands that recreate the tracked state. Runs once, at the start of the
    /// range.
    pub fn restore_state(&mut self) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let Some(device) = self.device else {
            if !self.registry.is_empty() {
                return Err(SubcaptureError::NoDevice);
            }
            info!("nothing tracked before the subcapture; nothing to restore");
            self.report = Some(report);
            return Ok(report);
        };
        info!(
            frame = self.range.frame(),
            execution = self.range.execution(),
            objects = self.registry.len(),
            "restoring state"
        );

        report.structures_pruned = self.structures.optimize(&self.analysis);
        self.release_removed_structures();
        let keep = self.restore_set();
        let is_restored = |key: ObjectKey| keep.contains(&key);

        let Self {
            gpu,
            sink,
            keys,
            analysis,
            registry,
            states,
            tiles,
            content,
            structures,
            residency,
            descriptors,
            aux_views,
            lists,
            protected,
            ..
        } = self;
        let mut stream = RestoreStream::new(&mut *sink, keys);

        // Objects, in creation order.
        let mut prioritized = Vec::new();
        let mut priorities = Vec::new();
        for object in registry.restorable().filter(|object| is_restored(object.key)) {
            let Some(creation) = &object.creation else {
                debug!(key = %object.key, "no creation call recorded");
                continue;
            };
            stream.emit(restore_creation(object, &creation.command));
            if object.kind == ObjectKind::GraphicsCommandList {
                stream.emit(Command::CommandListClose { list: object.key });
            }
            if let Some(name) = &object.name {
                stream.emit(Command::SetName {
                    object: object.key,
                    name: name.clone(),
                });
            }
            if let Some(priority) = object.residency_priority {
                prioritized.push(object.key);
                priorities.push(priority);
            }
            report.objects += 1;
        }
        if !prioritized.is_empty() {
            stream.emit(Command::SetResidencyPriority {
                device,
                objects: prioritized,
                priorities,
            });
        }

        for object in registry.restorable().filter(|object| is_restored(object.key)) {
            let ObjectPayload::Fence(fence) = &object.payload else {
                continue;
            };
            let initial = match object.creation.as_ref().map(|creation| &creation.command) {
                Some(Command::CreateFence { initial_value, .. }) => *initial_value,
                _ => 0,
            };
            if fence.value != initial {
                stream.emit(Command::FenceSignal {
                    fence: object.key,
                    value: fence.value,
                });
                report.fences += 1;
            }
        }

        report.structures = structures.restore(device, content, is_restored, &mut stream)?;

        let mut queue = RestoreQueue::create(&mut stream, device, CommandListType::Direct);
        report.tile_updates = tiles.restore(queue.queue, is_restored, &mut stream);

        let mut device_only = Vec::new();
        for object in registry.restorable().filter(|object| is_restored(object.key)) {
            let Some(resource) = object.resource() else {
                continue;
            };
            if resource.back_buffer
                || resource.is_acceleration_structure_storage()
                || protected.contains(&object.key)
            {
                continue;
            }
            if resource.cpu_mappable {
                content.restore_mappable(&mut *gpu, object.key, &resource.desc, &mut stream)?;
                report.mappable_resources += 1;
            } else {
                device_only.push((object.key, resource.desc));
            }
        }
        report.content_batches =
            content.restore_device_only(&mut *gpu, device, &device_only, &mut queue, &mut stream)?;

        report.descriptors = descriptors.restore(device, analysis, is_restored, &mut stream);
        report.barriers = states.restore(is_restored, &mut queue, &mut stream);
        report.residency_calls = residency.restore(is_restored, &mut stream);

        for (&list, state) in lists.iter() {
            if !is_restored(list) || state.commands.is_empty() {
                continue;
            }
            stream.emit(Command::CommandListReset {
                list,
                allocator: state.allocator,
                initial_pipeline: state.initial_pipeline,
            });
            for deferred in &state.commands {
                let command = aux_views.prepare(
                    &deferred.record.command,
                    &deferred.views,
                    descriptors,
                    device,
                    &mut stream,
                )?;
                stream.emit(command);
                report.deferred_commands += 1;
            }
            if !state.open {
                stream.emit(Command::CommandListClose { list });
            }
        }

        queue.release(&mut stream);
        for object in registry.restorable().filter(|object| is_restored(object.key)) {
            if object.keep_destroyed {
                stream.emit(Command::Release { object: object.key });
                report.released += 1;
            }
        }
        report.commands_written = stream.written();

        if aux_views.recreated() > 0 {
            warn!(
                views = aux_views.recreated(),
                "deferred commands re-targeted to auxiliary views"
            );
        }
        info!(
            objects = report.objects,
            structures = report.structures.replayed,
            content_batches = report.content_batches,
            barriers = report.barriers,
            commands = report.commands_written,
            "state restored"
        );
        self.report = Some(report);
        Ok(report)
    }
}

/// The creation call as replayed: tracked resources start in the state content restore
/// expects.
fn restore_creation(object: &TrackedObject, command: &Command) -> Command {
    let mut command = command.clone();
    let tracked = object
        .resource()
        .is_some_and(|resource| StateClass::of(resource) == StateClass::Tracked);
    if tracked {
        match &mut command {
            Command::CreateCommittedResource { initial_state, .. }
            | Command::CreatePlacedResource { initial_state, .. }
            | Command::CreateReservedResource { initial_state, .. } => {
                *initial_state = ResourceStates::COPY_DEST;
            }
            _ => {}
        }
    }
    command
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::accel::BuildInputs;
    use crate::config::InclusiveRange;
    use crate::gpu::HostMemoryGpu;
    use crate::model::{CommandKey, ResourceDesc};
    use crate::stream::MemorySink;

    const DEVICE: ObjectKey = ObjectKey(1);
    const QUEUE: ObjectKey = ObjectKey(2);
    const ALLOCATOR: ObjectKey = ObjectKey(3);
    const LIST: ObjectKey = ObjectKey(4);
    const INSTANCES: ObjectKey = ObjectKey(5);
    const STORAGE: ObjectKey = ObjectKey(6);
    const SWAP_CHAIN: ObjectKey = ObjectKey(7);

    struct Session {
        orchestrator: StateOrchestrator<HostMemoryGpu, MemorySink>,
        next: u64,
    }

    impl Session {
        fn new(frames: InclusiveRange) -> Self {
            let config = SubcaptureConfig {
                frames,
                ..SubcaptureConfig::default()
            };
            let gpu = HostMemoryGpu::new().with_zero_fill_unknown();
            let orchestrator = StateOrchestrator::new(&config, gpu, MemorySink::new()).unwrap();
            Self {
                orchestrator,
                next: 1,
            }
        }

        fn call(&mut self, command: Command) -> CommandKey {
            let key = CommandKey(self.next);
            self.next += 1;
            self.orchestrator
                .process(CommandRecord::new(key, command))
                .unwrap();
            key
        }

        fn present(&mut self) -> CommandKey {
            self.call(Command::Present {
                swap_chain: SWAP_CHAIN,
                sync_interval: 1,
                flags: 0,
            })
        }

        fn buffer(&mut self, resource: ObjectKey, size: u64, state: ResourceStates, gpu_va: u64) {
            self.call(Command::CreateCommittedResource {
                device: DEVICE,
                resource,
                heap_type: HeapType::Default,
                heap_flags: HeapFlags::empty(),
                desc: ResourceDesc::buffer(size),
                initial_state: state,
                gpu_va,
                protected_session: None,
            });
        }

        fn infrastructure(&mut self) {
            self.call(Command::CreateDevice {
                device: DEVICE,
                adapter: None,
            });
            self.call(Command::CreateCommandQueue {
                device: DEVICE,
                queue: QUEUE,
                list_type: CommandListType::Direct,
            });
            self.call(Command::CreateCommandAllocator {
                device: DEVICE,
                allocator: ALLOCATOR,
                list_type: CommandListType::Direct,
            });
            self.call(Command::CreateCommandList {
                device: DEVICE,
                list: LIST,
                allocator: ALLOCATOR,
                list_type: CommandListType::Direct,
                initial_pipeline: None,
            });
        }

        fn sink(&self) -> &MemorySink {
            self.orchestrator.sink()
        }
    }

    #[test]
    fn tracks_before_the_range_and_forwards_inside_it() {
        let mut session = Session::new(InclusiveRange::single(2));
        session.infrastructure();
        session.buffer(INSTANCES, 256, ResourceStates::COMMON, 0x1_0000);
        session.present();
        assert!(session.sink().records().is_empty());

        let present = session.present();
        let report = *session.orchestrator.report().unwrap();
        assert_eq!(report.objects, 5);

        let records = session.sink().records();
        assert!(matches!(records[0].command, Command::CreateDevice { .. }));
        assert!(records[..records.len() - 1]
            .iter()
            .all(|record| record.key.is_restore()));
        let last = records.last().unwrap();
        assert_eq!(last.key, present);
        assert!(matches!(last.command, Command::Present { .. }));

        let created_state = session.sink().commands().find_map(|command| match command {
            Command::CreateCommittedResource {
                resource: INSTANCES,
                initial_state,
                ..
            } => Some(*initial_state),
            _ => None,
        });
        assert_eq!(created_state, Some(ResourceStates::COPY_DEST));
    }

    #[test]
    fn nothing_is_written_after_the_range() {
        let mut session = Session::new(InclusiveRange::single(1));
        session.infrastructure();
        session.present();
        let written = session.sink().records().len();
        session.present();
        session.buffer(INSTANCES, 256, ResourceStates::COMMON, 0x1_0000);
        assert_eq!(session.sink().records().len(), written);
        assert_eq!(session.orchestrator.range().state(), RangeState::AfterRange);
    }

    #[test]
    fn released_objects_are_not_recreated() {
        let mut session = Session::new(InclusiveRange::single(2));
        session.infrastructure();
        session.buffer(INSTANCES, 256, ResourceStates::COMMON, 0x1_0000);
        session.call(Command::Release { object: INSTANCES });
        session.present();
        session.present();

        assert!(!session.orchestrator.registry().contains(INSTANCES));
        assert!(!session.sink().commands().any(|command| matches!(
            command,
            Command::CreateCommittedResource {
                resource: INSTANCES,
                ..
            }
        )));
    }

    #[test]
    fn structure_inputs_outlive_their_release() {
        let mut session = Session::new(InclusiveRange::single(2));
        session.infrastructure();
        session.buffer(INSTANCES, 256, ResourceStates::COMMON, 0x1_0000);
        session.buffer(
            STORAGE,
            64 * 1024,
            ResourceStates::RAYTRACING_ACCELERATION_STRUCTURE,
            0x2_0000,
        );
        session.call(Command::BuildRaytracingAccelerationStructure {
            list: LIST,
            desc: BuildDesc {
                dest: GpuAddressArg::new(0x2_0000),
                inputs: BuildInputs::top_level(4, GpuAddressArg::new(0x1_0000)),
                source: GpuAddressArg::NULL,
                scratch: GpuAddressArg::new(0x2_8000),
            },
        });
        session.call(Command::CommandListClose { list: LIST });
        session.call(Command::ExecuteCommandLists {
            queue: QUEUE,
            lists: vec![LIST],
        });
        session.call(Command::Release { object: INSTANCES });
        assert_eq!(session.orchestrator.structures().len(), 1);
        assert!(session.orchestrator.registry().contains(INSTANCES));

        session.present();
        session.present();

        let report = *session.orchestrator.report().unwrap();
        assert_eq!(report.structures.replayed, 1);
        assert_eq!(report.released, 1);
        let sink = session.sink();
        assert_eq!(
            sink.count("ID3D12GraphicsCommandList4::BuildRaytracingAccelerationStructure"),
            2
        );
        let released_last = sink
            .commands()
            .filter(|command| matches!(command, Command::Release { .. }))
            .last();
        assert_eq!(released_last, Some(&Command::Release { object: INSTANCES }));
    }

    #[test]
    fn commands_on_unknown_lists_are_rejected() {
        let mut session = Session::new(InclusiveRange::single(2));
        session.infrastructure();
        let result = session.orchestrator.process(CommandRecord::new(
            CommandKey(100),
            Command::Dispatch {
                list: ObjectKey(99),
                x: 1,
                y: 1,
                z: 1,
            },
        ));
        assert!(matches!(
            result,
            Err(SubcaptureError::UnknownCommandList(ObjectKey(99)))
        ));
    }

    #[test]
    fn objects_without_a_device_cannot_be_restored() {
        let mut session = Session::new(InclusiveRange::single(2));
        session.call(Command::CreateObject {
            kind: ObjectKind::Factory,
            object: ObjectKey(20),
            parent: None,
        });
        session.present();
        let result = session.orchestrator.process(CommandRecord::new(
            CommandKey(100),
            Command::Present {
                swap_chain: SWAP_CHAIN,
                sync_interval: 1,
                flags: 0,
            },
        ));
        assert!(matches!(result, Err(SubcaptureError::NoDevice)));
    }

    #[test]
    fn an_empty_session_restores_nothing() {
        let mut session = Session::new(InclusiveRange::single(1));
        session.present();
        assert_eq!(session.orchestrator.report(), Some(&RestoreReport::default()));
    }
}
