//! Re-targets deferred commands whose descriptor slots were overwritten after recording.
//!
//! `OMSetRenderTargets` and the `Clear*View` calls read their descriptors when they are
//! recorded, not when the list executes. A list recorded before the subcapture starts can
//! therefore reference a slot whose contents changed before the list is replayed. Such commands
//! are pointed at a slot of an auxiliary heap holding the view as it was at record time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::Command;
use crate::descriptors::{
    DescriptorHandle, DescriptorHeapType, DescriptorRecord, DescriptorTracker,
};
use crate::error::{Result, SubcaptureError};
use crate::model::ObjectKey;
use crate::stream::RestoreStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuxHeapKind {
    Rtv,
    Dsv,
    UavShaderVisible,
    UavCpu,
}

impl AuxHeapKind {
    fn heap_type(self) -> DescriptorHeapType {
        match self {
            AuxHeapKind::Rtv => DescriptorHeapType::Rtv,
            AuxHeapKind::Dsv => DescriptorHeapType::Dsv,
            AuxHeapKind::UavShaderVisible | AuxHeapKind::UavCpu => DescriptorHeapType::CbvSrvUav,
        }
    }

    fn shader_visible(self) -> bool {
        self == AuxHeapKind::UavShaderVisible
    }
}

/// A slot referenced by a deferred command, with its contents when the command was recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedDescriptor {
    pub handle: DescriptorHandle,
    pub record: Option<DescriptorRecord>,
}

impl CapturedDescriptor {
    /// Snapshots every slot `command` references.
    pub fn capture(command: &Command, live: &DescriptorTracker) -> Vec<Self> {
        command
            .referenced_views()
            .into_iter()
            .map(|handle| Self {
                handle,
                record: live.get(handle).cloned(),
            })
            .collect()
    }
}

#[derive(Debug)]
struct AuxHeap {
    key: ObjectKey,
    next: u32,
}

#[derive(Debug)]
pub struct AuxiliaryViewSynthesizer {
    capacity: u32,
    heaps: BTreeMap<AuxHeapKind, AuxHeap>,
    recreated: usize,
}

impl AuxiliaryViewSynthesizer {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            heaps: BTreeMap::new(),
            recreated: 0,
        }
    }

    /// Number of views recreated in auxiliary heaps so far.
    pub fn recreated(&self) -> usize {
        self.recreated
    }

    pub fn heap(&self, kind: AuxHeapKind) -> Option<ObjectKey> {
        self.heaps.get(&kind).map(|heap| heap.key)
    }

    /// Reserves `count` consecutive slots, creating the heap on first use.
    fn allocate(
        &mut self,
        kind: AuxHeapKind,
        count: u32,
        device: ObjectKey,
        stream: &mut RestoreStream<'_>,
    ) -> Result<DescriptorHandle> {
        let capacity = self.capacity;
        let heap = self.heaps.entry(kind).or_insert_with(|| {
            let key = stream.new_object();
            stream.emit(Command::CreateDescriptorHeap {
                device,
                heap: key,
                heap_type: kind.heap_type(),
                capacity,
                shader_visible: kind.shader_visible(),
            });
            debug!(?kind, heap = %key, capacity, "created auxiliary descriptor heap");
            AuxHeap { key, next: 0 }
        });
        if heap.next + count > capacity {
            return Err(SubcaptureError::AuxiliaryHeapExhausted { kind, capacity });
        }
        let handle = DescriptorHandle::new(heap.key, heap.next);
        heap.next += count;
        Ok(handle)
    }

    /// Returns `command` with every stale view moved to an auxiliary slot.
    ///
    /// `captured` lists the referenced slots in [`Command::referenced_views`] order. Commands
    /// whose slots all still hold the captured views come back unchanged.
    pub fn prepare(
        &mut self,
        command: &Command,
        captured: &[CapturedDescriptor],
        live: &DescriptorTracker,
        device: ObjectKey,
        stream: &mut RestoreStream<'_>,
    ) -> Result<Command> {
        let stale: Vec<bool> = captured
            .iter()
            .map(|view| {
                view.record
                    .as_ref()
                    .is_some_and(|record| live.get(view.handle) != Some(record))
            })
            .collect();
        if !stale.contains(&true) {
            return Ok(command.clone());
        }

        let mut views: Vec<DescriptorHandle> = captured.iter().map(|view| view.handle).collect();
        let mut start = 0;
        if let Command::OmSetRenderTargets {
            render_targets,
            single_handle_range: true,
            ..
        } = command
        {
            // A single-handle range can only be redirected as a whole.
            let count = render_targets.len();
            if stale[..count].contains(&true) {
                let first = self.allocate(AuxHeapKind::Rtv, count as u32, device, stream)?;
                for (i, view) in captured[..count].iter().enumerate() {
                    let record = view.record.as_ref().or_else(|| live.get(view.handle));
                    let dest = first.offset(i as u32);
                    if let Some(record) = record {
                        self.recreate(record, dest, device, stream);
                    }
                    views[i] = dest;
                }
            }
            start = count;
        }

        for i in start..captured.len() {
            let Some(record) = captured[i].record.as_ref().filter(|_| stale[i]) else {
                continue;
            };
            let Some(kind) = aux_kind(command, i, record, live, captured[i].handle) else {
                continue;
            };
            let dest = self.allocate(kind, 1, device, stream)?;
            self.recreate(record, dest, device, stream);
            views[i] = dest;
        }

        let mut rewritten = command.clone();
        retarget(&mut rewritten, &views);
        Ok(rewritten)
    }

    fn recreate(
        &mut self,
        record: &DescriptorRecord,
        dest: DescriptorHandle,
        device: ObjectKey,
        stream: &mut RestoreStream<'_>,
    ) {
        stream.emit(Command::CreateView {
            device,
            view: record.clone(),
            dest,
        });
        self.recreated += 1;
    }
}

fn aux_kind(
    command: &Command,
    position: usize,
    record: &DescriptorRecord,
    live: &DescriptorTracker,
    handle: DescriptorHandle,
) -> Option<AuxHeapKind> {
    match record.kind.heap_type() {
        DescriptorHeapType::Rtv => Some(AuxHeapKind::Rtv),
        DescriptorHeapType::Dsv => Some(AuxHeapKind::Dsv),
        DescriptorHeapType::CbvSrvUav => {
            let gpu_side = match command {
                Command::ClearUnorderedAccessViewUint { .. }
                | Command::ClearUnorderedAccessViewFloat { .. } => position == 0,
                _ => live.is_shader_visible(handle.heap),
            };
            Some(if gpu_side {
                AuxHeapKind::UavShaderVisible
            } else {
                AuxHeapKind::UavCpu
            })
        }
        DescriptorHeapType::Sampler => None,
    }
}

/// Writes `views` back into the handle fields, in [`Command::referenced_views`] order.
fn retarget(command: &mut Command, views: &[DescriptorHandle]) {
    match command {
        Command::OmSetRenderTargets {
            render_targets,
            single_handle_range,
            depth_stencil,
            ..
        } => {
            let count = render_targets.len();
            for (i, target) in render_targets.iter_mut().enumerate() {
                *target = if *single_handle_range { views[0] } else { views[i] };
            }
            if let Some(depth_stencil) = depth_stencil {
                *depth_stencil = views[count];
            }
        }
        Command::ClearRenderTargetView { view, .. }
        | Command::ClearDepthStencilView { view, .. } => *view = views[0],
        Command::ClearUnorderedAccessViewUint {
            gpu_view, cpu_view, ..
        }
        | Command::ClearUnorderedAccessViewFloat {
            gpu_view, cpu_view, ..
        } => {
            *gpu_view = views[0];
            *cpu_view = views[1];
        }
        _ => {}
    }
}
