use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use super::{
    AccelerationStructureOp, AccelerationStructureState, AccelerationStructureTracker,
    GpuAddressArg,
};
use crate::command::{Command, CommandListType, ResourceBarrier};
use crate::content::{ContentPipeline, UploadCursor};
use crate::error::Result;
use crate::gpu::ACCELERATION_STRUCTURE_ALIGNMENT;
use crate::model::{
    HeapFlags, HeapType, KeyOffset, ObjectKey, ResourceDesc, ResourceFlags, ResourceStates,
};
use crate::resource_states::StateClass;
use crate::stream::{RestoreQueue, RestoreStream};
use crate::tiled::TiledResourceTracker;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub replayed: usize,
    pub skipped: usize,
    pub tile_updates: usize,
    pub content_uploads: usize,
    pub scratch_size: u64,
    pub upload_size: u64,
}

/// Helper objects created in the outgoing stream for the duration of the restore.
struct RestoreHelpers {
    scratch: ObjectKey,
    upload: Option<UploadCursor>,
    copy: RestoreQueue,
    direct: RestoreQueue,
}

impl RestoreHelpers {
    fn create(
        device: ObjectKey,
        scratch_size: u64,
        upload_size: u64,
        stream: &mut RestoreStream<'_>,
    ) -> Self {
        let scratch = stream.new_object();
        stream.emit(Command::CreateCommittedResource {
            device,
            resource: scratch,
            heap_type: HeapType::Default,
            heap_flags: HeapFlags::empty(),
            desc: ResourceDesc::buffer(scratch_size)
                .with_flags(ResourceFlags::ALLOW_UNORDERED_ACCESS),
            initial_state: ResourceStates::UNORDERED_ACCESS,
            gpu_va: 0,
            protected_session: None,
        });

        let upload = (upload_size > 0).then(|| {
            let buffer = stream.new_object();
            stream.emit(Command::CreateCommittedResource {
                device,
                resource: buffer,
                heap_type: HeapType::Upload,
                heap_flags: HeapFlags::empty(),
                desc: ResourceDesc::buffer(upload_size),
                initial_state: ResourceStates::GENERIC_READ,
                gpu_va: 0,
                protected_session: None,
            });
            UploadCursor::new(buffer, upload_size)
        });

        Self {
            scratch,
            upload,
            copy: RestoreQueue::create(stream, device, CommandListType::Copy),
            direct: RestoreQueue::create(stream, device, CommandListType::Direct),
        }
    }

    fn release(self, stream: &mut RestoreStream<'_>) {
        stream.emit(Command::Release {
            object: self.scratch,
        });
        if let Some(upload) = self.upload {
            stream.emit(Command::Release {
                object: upload.buffer,
            });
        }
        self.copy.release(stream);
        self.direct.release(stream);
    }
}

/// The recorded command with scratch memory redirected to the restore scratch buffer.
///
/// `source` is the destination of the state the operation reads from at restore time. It
/// differs from the recorded source once update-chain compression has spliced out the state
/// the operation originally read.
fn rewire(
    op: &AccelerationStructureOp,
    source: Option<GpuAddressArg>,
    scratch: ObjectKey,
    list: ObjectKey,
) -> Command {
    let scratch = GpuAddressArg::restore_target(KeyOffset::new(scratch, 0));
    match op {
        AccelerationStructureOp::Build(desc) => {
            let mut desc = desc.clone();
            desc.scratch = scratch;
            if let Some(source) = source.filter(|_| desc.inputs.is_update()) {
                desc.source = source;
            }
            Command::BuildRaytracingAccelerationStructure { list, desc }
        }
        AccelerationStructureOp::Copy {
            dest,
            source: recorded,
            mode,
        } => Command::CopyRaytracingAccelerationStructure {
            list,
            dest: *dest,
            source: source.unwrap_or(*recorded),
            mode: *mode,
        },
        AccelerationStructureOp::NvApiBuild { desc, ex_flags } => {
            let mut desc = desc.clone();
            desc.scratch = scratch;
            if let Some(source) = source.filter(|_| desc.inputs.is_update()) {
                desc.source = source;
            }
            Command::NvApiBuildRaytracingAccelerationStructureEx {
                list,
                desc,
                ex_flags: *ex_flags,
            }
        }
        AccelerationStructureOp::NvApiOmmBuild(desc) => {
            let mut desc = *desc;
            desc.scratch = scratch;
            Command::NvApiBuildRaytracingOpacityMicromapArray { list, desc }
        }
    }
}

/// Input buffers that content restore leaves in `COPY_DEST` and the build must read.
fn input_barriers(state: &AccelerationStructureState, to_input: bool) -> Vec<ResourceBarrier> {
    let mut seen = HashSet::new();
    state
        .inputs
        .iter()
        .filter(|input| StateClass::of(&input.record) == StateClass::Tracked)
        .filter(|input| seen.insert(input.location.key))
        .map(|input| {
            let (before, after) = if to_input {
                (ResourceStates::COPY_DEST, ResourceStates::NON_PIXEL_SHADER_RESOURCE)
            } else {
                (ResourceStates::NON_PIXEL_SHADER_RESOURCE, ResourceStates::COPY_DEST)
            };
            ResourceBarrier::transition(input.location.key, before, after)
        })
        .collect()
}

impl AccelerationStructureTracker {
    /// Replays every live state in id order.
    ///
    /// Each state gets its own round trip: sparse input mappings and input bytes go through the
    /// copy queue, the direct queue waits for them, runs the recorded operation against the
    /// shared scratch buffer, and is waited on before the next state starts.
    pub fn restore(
        &self,
        device: ObjectKey,
        content: &mut ContentPipeline,
        is_restored: impl Fn(ObjectKey) -> bool,
        stream: &mut RestoreStream<'_>,
    ) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary::default();
        if self.is_empty() {
            return Ok(summary);
        }

        summary.scratch_size = self
            .max_scratch_size()
            .max(ACCELERATION_STRUCTURE_ALIGNMENT)
            .next_multiple_of(ACCELERATION_STRUCTURE_ALIGNMENT);
        summary.upload_size = self.max_restore_payload();
        let mut helpers =
            RestoreHelpers::create(device, summary.scratch_size, summary.upload_size, stream);
        let mut replayed_tiles: HashSet<(ObjectKey, u64)> = HashSet::new();

        for state in self.states() {
            let referenced = state.referenced_resources();
            if let Some(missing) = referenced.iter().find(|&&key| !is_restored(key)) {
                debug!(id = state.id, %missing, "skipping structure with a dropped resource");
                summary.skipped += 1;
                continue;
            }

            for tiled in &state.tiled_inputs {
                if !replayed_tiles.insert((tiled.key, tiled.update_id)) {
                    continue;
                }
                for command in
                    TiledResourceTracker::synthesize_update_commands(tiled, helpers.copy.queue)
                {
                    stream.emit(command);
                    summary.tile_updates += 1;
                }
            }

            if let Some(upload) = helpers.upload.as_mut() {
                upload.rewind();
            }
            for input in &state.inputs {
                let Some(id) = input.content else {
                    continue;
                };
                let replayed = match helpers.upload.as_mut() {
                    Some(upload) => {
                        content.replay_buffer_content(id, upload, &mut helpers.copy, stream)?
                    }
                    None => {
                        let mut empty = UploadCursor::new(ObjectKey::NULL, 0);
                        content.replay_buffer_content(id, &mut empty, &mut helpers.copy, stream)?
                    }
                };
                if replayed {
                    summary.content_uploads += 1;
                }
            }

            let uploaded = helpers.copy.execute(stream);
            helpers.direct.wait_for(stream, &helpers.copy, uploaded);

            let to_input = input_barriers(state, true);
            if !to_input.is_empty() {
                helpers.direct.record(
                    stream,
                    Command::ResourceBarrier {
                        list: helpers.direct.list,
                        barriers: to_input,
                    },
                );
            }
            let source = self
                .source_of(state.id)
                .and_then(|source| self.get(source))
                .map(|source| source.op.dest());
            let command = rewire(&state.op, source, helpers.scratch, helpers.direct.list);
            helpers.direct.record(stream, command);

            let mut after = vec![ResourceBarrier::Uav {
                resource: Some(state.dest.key),
            }];
            after.extend(input_barriers(state, false));
            helpers.direct.record(
                stream,
                Command::ResourceBarrier {
                    list: helpers.direct.list,
                    barriers: after,
                },
            );
            helpers.direct.submit_and_wait(stream);
            helpers.copy.wait_and_reset(stream);
            summary.replayed += 1;
        }

        helpers.release(stream);
        info!(
            replayed = summary.replayed,
            skipped = summary.skipped,
            scratch = summary.scratch_size,
            upload = summary.upload_size,
            "acceleration structures restored"
        );
        Ok(summary)
    }
}
