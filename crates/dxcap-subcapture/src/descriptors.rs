//! Descriptor heap contents: which view lives in which slot.
//!
//! Descriptors are plain CPU-side records, so tracking them is simply a matter of mirroring every
//! `Create*View` and `CopyDescriptors*` call into a per-heap slot map. The map is consulted twice:
//! to recreate the slots at restore time, and by the auxiliary view synthesizer to detect slots
//! that were overwritten after a deferred command referenced them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::AnalyzerResults;
use crate::command::Command;
use crate::error::{Result, SubcaptureError};
use crate::model::{Format, ObjectKey};
use crate::stream::RestoreStream;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DescriptorHeapType {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

/// CPU (or GPU) descriptor handle expressed as heap + slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DescriptorHandle {
    pub heap: ObjectKey,
    pub index: u32,
}

impl DescriptorHandle {
    pub fn new(heap: ObjectKey, index: u32) -> Self {
        Self { heap, index }
    }

    pub fn offset(self, by: u32) -> Self {
        Self {
            heap: self.heap,
            index: self.index + by,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthStencil,
    Sampler,
}

impl ViewKind {
    pub fn heap_type(self) -> DescriptorHeapType {
        match self {
            ViewKind::ConstantBuffer | ViewKind::ShaderResource | ViewKind::UnorderedAccess => {
                DescriptorHeapType::CbvSrvUav
            }
            ViewKind::RenderTarget => DescriptorHeapType::Rtv,
            ViewKind::DepthStencil => DescriptorHeapType::Dsv,
            ViewKind::Sampler => DescriptorHeapType::Sampler,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewDimension {
    Buffer,
    Texture1d,
    Texture1dArray,
    Texture2d,
    Texture2dArray,
    Texture2dMs,
    Texture2dMsArray,
    Texture3d,
    TextureCube,
    TextureCubeArray,
    RaytracingAccelerationStructure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewSubresources {
    pub dimension: ViewDimension,
    pub mip_slice: u32,
    pub mip_levels: u32,
    pub first_array_slice: u32,
    pub array_size: u32,
    pub plane_slice: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferView {
    pub first_element: u64,
    pub num_elements: u32,
    pub structure_byte_stride: u32,
    pub counter_offset: u64,
}

/// View description passed to `Create*View`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ViewDesc {
    ConstantBuffer {
        buffer_location: u64,
        size_in_bytes: u32,
    },
    Texture {
        format: Format,
        subresources: ViewSubresources,
    },
    Buffer {
        format: Format,
        buffer: BufferView,
    },
    DepthStencil {
        format: Format,
        subresources: ViewSubresources,
        read_only_flags: u32,
    },
    Sampler {
        filter: u32,
        address_modes: [u32; 3],
        mip_lod_bias: f32,
        max_anisotropy: u32,
        comparison: u32,
        border_color: [f32; 4],
        lod_range: [f32; 2],
    },
}

/// Contents of one descriptor slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub kind: ViewKind,
    pub resource: Option<ObjectKey>,
    pub counter_resource: Option<ObjectKey>,
    /// `None` when the view was created with a null description (resource defaults).
    pub desc: Option<ViewDesc>,
}

impl DescriptorRecord {
    pub fn new(kind: ViewKind, resource: Option<ObjectKey>, desc: Option<ViewDesc>) -> Self {
        Self {
            kind,
            resource,
            counter_resource: None,
            desc,
        }
    }
}

#[derive(Debug)]
struct HeapSlots {
    heap_type: DescriptorHeapType,
    capacity: u32,
    shader_visible: bool,
    slots: BTreeMap<u32, DescriptorRecord>,
}

#[derive(Debug, Default)]
pub struct DescriptorTracker {
    heaps: BTreeMap<ObjectKey, HeapSlots>,
}

impl DescriptorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_heap(
        &mut self,
        heap: ObjectKey,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) {
        self.heaps.insert(
            heap,
            HeapSlots {
                heap_type,
                capacity,
                shader_visible,
                slots: BTreeMap::new(),
            },
        );
    }

    pub fn destroy_heap(&mut self, heap: ObjectKey) {
        self.heaps.remove(&heap);
    }

    pub fn heap_type(&self, heap: ObjectKey) -> Option<DescriptorHeapType> {
        self.heaps.get(&heap).map(|slots| slots.heap_type)
    }

    pub fn is_shader_visible(&self, heap: ObjectKey) -> bool {
        self.heaps.get(&heap).is_some_and(|slots| slots.shader_visible)
    }

    fn heap_mut(&mut self, handle: DescriptorHandle) -> Result<&mut HeapSlots> {
        let slots = self
            .heaps
            .get_mut(&handle.heap)
            .ok_or(SubcaptureError::UnknownObject(handle.heap))?;
        if handle.index >= slots.capacity {
            return Err(SubcaptureError::DescriptorOutOfRange {
                heap: handle.heap,
                index: handle.index,
                capacity: slots.capacity,
            });
        }
        Ok(slots)
    }

    pub fn set(&mut self, dest: DescriptorHandle, record: DescriptorRecord) -> Result<()> {
        let slots = self.heap_mut(dest)?;
        slots.slots.insert(dest.index, record);
        Ok(())
    }

    pub fn get(&self, handle: DescriptorHandle) -> Option<&DescriptorRecord> {
        self.heaps.get(&handle.heap)?.slots.get(&handle.index)
    }

    /// `CopyDescriptorsSimple`: copies `count` consecutive slots. Empty source slots clear the
    /// destination.
    pub fn copy(
        &mut self,
        dest: DescriptorHandle,
        src: DescriptorHandle,
        count: u32,
    ) -> Result<()> {
        let mut staged = Vec::with_capacity(count as usize);
        for i in 0..count {
            staged.push(self.get(src.offset(i)).cloned());
        }
        if count > 0 {
            // Validate the whole destination range before touching it.
            self.heap_mut(dest.offset(count - 1))?;
        }
        let slots = self.heap_mut(dest)?;
        for (i, record) in (0u32..).zip(staged) {
            match record {
                Some(record) => {
                    slots.slots.insert(dest.index + i, record);
                }
                None => {
                    slots.slots.remove(&(dest.index + i));
                }
            }
        }
        Ok(())
    }

    pub fn populated_slots(&self) -> usize {
        self.heaps.values().map(|slots| slots.slots.len()).sum()
    }

    /// Recreates every populated slot of every restored heap.
    ///
    /// Slots whose view targets a resource that is not being restored are skipped: the
    /// application can no longer reach them through anything but a stale handle.
    pub fn restore(
        &self,
        device: ObjectKey,
        analysis: &AnalyzerResults,
        is_restored: impl Fn(ObjectKey) -> bool,
        stream: &mut RestoreStream<'_>,
    ) -> usize {
        let mut created = 0;
        for (&heap, slots) in &self.heaps {
            if !is_restored(heap) {
                continue;
            }
            for (&index, record) in &slots.slots {
                if !analysis.requires_descriptor(heap, index) {
                    continue;
                }
                let targets_restored = record.resource.map_or(true, &is_restored)
                    && record.counter_resource.map_or(true, &is_restored);
                if !targets_restored {
                    debug!(%heap, index, "skipping descriptor of a dropped resource");
                    continue;
                }
                stream.emit(Command::CreateView {
                    device,
                    view: record.clone(),
                    dest: DescriptorHandle::new(heap, index),
                });
                created += 1;
            }
        }
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KeyAllocator;
    use crate::stream::MemorySink;

    fn rtv(resource: u64) -> DescriptorRecord {
        DescriptorRecord::new(ViewKind::RenderTarget, Some(ObjectKey(resource)), None)
    }

    #[test]
    fn copy_moves_records_and_clears_empty_slots() {
        let mut tracker = DescriptorTracker::new();
        tracker.create_heap(ObjectKey(1), DescriptorHeapType::Rtv, 8, false);
        tracker.set(DescriptorHandle::new(ObjectKey(1), 0), rtv(10)).unwrap();
        tracker.set(DescriptorHandle::new(ObjectKey(1), 5), rtv(11)).unwrap();

        tracker
            .copy(
                DescriptorHandle::new(ObjectKey(1), 4),
                DescriptorHandle::new(ObjectKey(1), 0),
                2,
            )
            .unwrap();

        assert_eq!(tracker.get(DescriptorHandle::new(ObjectKey(1), 4)), Some(&rtv(10)));
        assert_eq!(tracker.get(DescriptorHandle::new(ObjectKey(1), 5)), None);
    }

    #[test]
    fn out_of_range_slots_are_rejected() {
        let mut tracker = DescriptorTracker::new();
        tracker.create_heap(ObjectKey(1), DescriptorHeapType::Rtv, 2, false);
        let err = tracker
            .set(DescriptorHandle::new(ObjectKey(1), 2), rtv(10))
            .unwrap_err();
        assert!(matches!(err, SubcaptureError::DescriptorOutOfRange { index: 2, .. }));
    }

    #[test]
    fn restore_skips_dropped_resources_and_unrequired_slots() {
        let mut tracker = DescriptorTracker::new();
        tracker.create_heap(ObjectKey(1), DescriptorHeapType::Rtv, 4, false);
        tracker.set(DescriptorHandle::new(ObjectKey(1), 0), rtv(10)).unwrap();
        tracker.set(DescriptorHandle::new(ObjectKey(1), 1), rtv(11)).unwrap();
        tracker.set(DescriptorHandle::new(ObjectKey(1), 2), rtv(12)).unwrap();

        let analysis = AnalyzerResults::parse("DESCRIPTORS 1 0 1 1").unwrap();
        let mut sink = MemorySink::new();
        let mut keys = KeyAllocator::new();
        let mut stream = RestoreStream::new(&mut sink, &mut keys);
        let created = tracker.restore(
            ObjectKey(100),
            &analysis,
            |key| key != ObjectKey(11),
            &mut stream,
        );

        assert_eq!(created, 1);
        assert!(matches!(
            &sink.records()[0].command,
            Command::CreateView { dest, .. } if *dest == DescriptorHandle::new(ObjectKey(1), 0)
        ));
    }
}
