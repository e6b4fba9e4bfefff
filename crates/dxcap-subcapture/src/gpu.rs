//! Access to the live GPU the application is running on.
//!
//! Restoring device-only content needs real readbacks: the engine has to copy resource bytes
//! into a readback buffer, wait for the GPU and read them back. Everything it needs from the
//! driver goes through [`GpuDevice`], so tests and the offline tooling can substitute
//! [`HostMemoryGpu`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::accel::{AccelerationStructureLevel, BuildInputs, OmmInputs};
use crate::model::{Format, ObjectKey, ResourceDesc, ResourceDimension};

/// `D3D12_TEXTURE_DATA_PITCH_ALIGNMENT`.
pub const ROW_PITCH_ALIGNMENT: u64 = 256;
/// `D3D12_TEXTURE_DATA_PLACEMENT_ALIGNMENT`.
pub const PLACEMENT_ALIGNMENT: u64 = 512;
/// Size of one tile of a reserved resource.
pub const TILE_SIZE_IN_BYTES: u64 = 64 * 1024;
/// `D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BYTE_ALIGNMENT`.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GpuError {
    #[error("resource {0} is unknown to the device")]
    UnknownResource(ObjectKey),

    #[error("resource {0} is not resident")]
    NotResident(ObjectKey),

    #[error("read of {size} bytes at offset {offset} is out of bounds for resource {resource}")]
    OutOfBounds {
        resource: ObjectKey,
        offset: u64,
        size: u64,
    },

    #[error("readback of {requested} bytes exceeds the {available} bytes copied")]
    ReadbackOutOfBounds { requested: u64, available: u64 },

    #[error("device call failed: {0}")]
    Device(String),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("wait for fence value {target} cancelled at completed value {completed}")]
    Cancelled { target: u64, completed: u64 },
}

/// GPU/CPU synchronization primitive with a monotonically increasing completed value.
pub trait Fence {
    fn completed_value(&self) -> u64;
}

/// Shared flag that aborts outstanding fence waits.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Blocking wait for GPU completion.
#[derive(Clone, Debug, Default)]
pub struct FenceWaiter {
    cancel: CancelToken,
}

impl FenceWaiter {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Spins until `fence` reaches `target` or the wait is cancelled.
    pub fn wait(&self, fence: &dyn Fence, target: u64) -> Result<(), WaitError> {
        let mut spins = 0u64;
        loop {
            let completed = fence.completed_value();
            if completed >= target {
                trace!(target, spins, "fence reached");
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(WaitError::Cancelled { target, completed });
            }
            spins += 1;
            std::hint::spin_loop();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubresourceFootprint {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_pitch: u32,
}

impl SubresourceFootprint {
    pub fn size_in_bytes(&self) -> u64 {
        u64::from(self.row_pitch) * u64::from(self.height) * u64::from(self.depth)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacedFootprint {
    pub offset: u64,
    pub footprint: SubresourceFootprint,
}

/// `GetCopyableFootprints` result. Buffers have no layouts, only a total size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyableFootprints {
    pub layouts: Vec<PlacedFootprint>,
    pub total_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileShape {
    pub width_in_texels: u32,
    pub height_in_texels: u32,
    pub depth_in_texels: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedMipInfo {
    pub num_standard_mips: u32,
    pub num_packed_mips: u32,
    /// Tiles used by the packed mips of one array slice.
    pub num_tiles_for_packed_mips: u32,
    pub start_tile_index_in_overall_resource: u32,
}

/// Tile range of one standard subresource. Packed subresources report `u32::MAX` as start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubresourceTiling {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    pub depth_in_tiles: u32,
    pub start_tile_index_in_overall_resource: u32,
}

impl SubresourceTiling {
    pub const PACKED_START: u32 = u32::MAX;

    pub fn is_packed(&self) -> bool {
        self.start_tile_index_in_overall_resource == Self::PACKED_START
    }

    pub fn tile_count(&self) -> u32 {
        self.width_in_tiles * self.height_in_tiles * self.depth_in_tiles
    }
}

/// `GetResourceTiling` result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTiling {
    pub total_tiles: u32,
    pub packed_mip_info: PackedMipInfo,
    pub tile_shape: TileShape,
    pub subresources: Vec<SubresourceTiling>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

/// One region copied into the readback buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadbackCopy {
    Buffer {
        resource: ObjectKey,
        offset: u64,
        size: u64,
        dst_offset: u64,
    },
    /// `footprint.offset` is the destination offset in the readback buffer.
    Texture {
        resource: ObjectKey,
        subresource: u32,
        footprint: PlacedFootprint,
    },
}

impl ReadbackCopy {
    fn end(&self) -> u64 {
        match self {
            ReadbackCopy::Buffer {
                size, dst_offset, ..
            } => dst_offset + size,
            ReadbackCopy::Texture { footprint, .. } => {
                footprint.offset + footprint.footprint.size_in_bytes()
            }
        }
    }
}

/// Driver services the engine relies on.
pub trait GpuDevice {
    /// Reads bytes of a CPU-mappable resource through a mapping.
    fn read_mapped(
        &mut self,
        resource: ObjectKey,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GpuError>;

    /// Enqueues a make-resident request; returns the fence value signalled on completion.
    fn enqueue_make_resident(&mut self, resources: &[ObjectKey]) -> Result<u64, GpuError>;

    fn evict(&mut self, resources: &[ObjectKey]) -> Result<(), GpuError>;

    /// Records and submits copies into the shared readback buffer; returns the fence value
    /// signalled when the copies complete.
    fn submit_readback(&mut self, copies: &[ReadbackCopy]) -> Result<u64, GpuError>;

    /// Reads the first `size` bytes of the readback buffer. Only valid after the fence value
    /// returned by the matching [`GpuDevice::submit_readback`] completed.
    fn read_readback(&mut self, size: u64) -> Result<Vec<u8>, GpuError>;

    fn fence(&self) -> &dyn Fence;

    fn copyable_footprints(&self, desc: &ResourceDesc) -> CopyableFootprints;

    fn resource_tiling(&self, desc: &ResourceDesc) -> ResourceTiling;

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo;

    fn omm_prebuild_info(&self, inputs: &OmmInputs) -> PrebuildInfo;
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Fence that completes one value per poll until it catches up with the last signal.
///
/// Waiting on value `n` therefore takes a deterministic number of polls, which exercises the
/// waiting path without depending on timing.
#[derive(Debug, Default)]
pub struct CountingFence {
    completed: AtomicU64,
    signalled: AtomicU64,
    polls: AtomicU64,
}

impl CountingFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) -> u64 {
        self.signalled.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn signalled(&self) -> u64 {
        self.signalled.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }
}

impl Fence for CountingFence {
    fn completed_value(&self) -> u64 {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let signalled = self.signalled.load(Ordering::SeqCst);
        let completed = self.completed.load(Ordering::SeqCst);
        if completed < signalled {
            self.completed.store(completed + 1, Ordering::SeqCst);
        }
        completed
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GpuStats {
    pub mapped_reads: u64,
    pub readback_submissions: u64,
    pub readback_bytes: u64,
    pub make_resident_calls: u64,
    pub evict_calls: u64,
}

#[derive(Debug)]
struct HostResource {
    desc: ResourceDesc,
    bytes: Vec<u8>,
    resident: bool,
}

/// [`GpuDevice`] over host memory.
///
/// Texture bytes are stored in the layout reported by [`GpuDevice::copyable_footprints`], so a
/// texture readback is a straight copy.
#[derive(Debug, Default)]
pub struct HostMemoryGpu {
    resources: BTreeMap<ObjectKey, HostResource>,
    readback: Vec<u8>,
    fence: CountingFence,
    zero_fill_unknown: bool,
    stats: GpuStats,
}

impl HostMemoryGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources the device has never been told about read as zeroes instead of failing.
    pub fn with_zero_fill_unknown(mut self) -> Self {
        self.zero_fill_unknown = true;
        self
    }

    /// Registers a resource with initial contents, padded or truncated to its footprint size.
    pub fn add_resource(&mut self, key: ObjectKey, desc: ResourceDesc, mut bytes: Vec<u8>) {
        let size = self.copyable_footprints(&desc).total_bytes;
        bytes.resize(usize::try_from(size).unwrap_or(usize::MAX), 0);
        self.resources.insert(
            key,
            HostResource {
                desc,
                bytes,
                resident: true,
            },
        );
    }

    pub fn write(&mut self, key: ObjectKey, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let resource = self
            .resources
            .get_mut(&key)
            .ok_or(GpuError::UnknownResource(key))?;
        let range = byte_range(key, offset, data.len() as u64, resource.bytes.len())?;
        resource.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn set_resident(&mut self, key: ObjectKey, resident: bool) {
        if let Some(resource) = self.resources.get_mut(&key) {
            resource.resident = resident;
        }
    }

    pub fn is_resident(&self, key: ObjectKey) -> Option<bool> {
        self.resources.get(&key).map(|resource| resource.resident)
    }

    pub fn stats(&self) -> GpuStats {
        self.stats
    }

    pub fn counting_fence(&self) -> &CountingFence {
        &self.fence
    }

    fn bytes(
        &self,
        key: ObjectKey,
        offset: u64,
        size: u64,
        require_resident: bool,
    ) -> Result<Vec<u8>, GpuError> {
        let Some(resource) = self.resources.get(&key) else {
            if self.zero_fill_unknown {
                return Ok(vec![0; usize::try_from(size).unwrap_or(0)]);
            }
            return Err(GpuError::UnknownResource(key));
        };
        if require_resident && !resource.resident {
            return Err(GpuError::NotResident(key));
        }
        let range = byte_range(key, offset, size, resource.bytes.len())?;
        Ok(resource.bytes[range].to_vec())
    }
}

fn byte_range(
    key: ObjectKey,
    offset: u64,
    size: u64,
    len: usize,
) -> Result<std::ops::Range<usize>, GpuError> {
    let out_of_bounds = GpuError::OutOfBounds {
        resource: key,
        offset,
        size,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds.clone())?;
    let end = offset
        .checked_add(size)
        .and_then(|end| usize::try_from(end).ok())
        .ok_or(out_of_bounds.clone())?;
    if end > len {
        return Err(out_of_bounds);
    }
    Ok(start..end)
}

/// Tile extent in texels for a 2D texture with elements of `bytes_per_element`.
fn standard_tile_shape(bytes_per_element: u32) -> TileShape {
    let (width, height) = match bytes_per_element {
        1 => (256, 256),
        2 => (256, 128),
        4 => (128, 128),
        8 => (128, 64),
        _ => (64, 64),
    };
    TileShape {
        width_in_texels: width,
        height_in_texels: height,
        depth_in_texels: 1,
    }
}

impl GpuDevice for HostMemoryGpu {
    fn read_mapped(
        &mut self,
        resource: ObjectKey,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GpuError> {
        self.stats.mapped_reads += 1;
        self.bytes(resource, offset, size, false)
    }

    fn enqueue_make_resident(&mut self, resources: &[ObjectKey]) -> Result<u64, GpuError> {
        self.stats.make_resident_calls += 1;
        for key in resources {
            self.set_resident(*key, true);
        }
        Ok(self.fence.signal())
    }

    fn evict(&mut self, resources: &[ObjectKey]) -> Result<(), GpuError> {
        self.stats.evict_calls += 1;
        for key in resources {
            self.set_resident(*key, false);
        }
        Ok(())
    }

    fn submit_readback(&mut self, copies: &[ReadbackCopy]) -> Result<u64, GpuError> {
        let required = copies.iter().map(ReadbackCopy::end).max().unwrap_or(0);
        let required = usize::try_from(required)
            .map_err(|_| GpuError::Device("readback too large".into()))?;
        if self.readback.len() < required {
            self.readback.resize(required, 0);
        }

        for copy in copies {
            let (bytes, dst_offset) = match *copy {
                ReadbackCopy::Buffer {
                    resource,
                    offset,
                    size,
                    dst_offset,
                } => (self.bytes(resource, offset, size, true)?, dst_offset),
                ReadbackCopy::Texture {
                    resource,
                    subresource,
                    footprint,
                } => {
                    match self.resources.get(&resource).map(|resource| resource.desc) {
                        Some(desc) => {
                            let layouts = self.copyable_footprints(&desc).layouts;
                            let source =
                                layouts.get(subresource as usize).ok_or(GpuError::OutOfBounds {
                                    resource,
                                    offset: u64::from(subresource),
                                    size: 0,
                                })?;
                            let size = source.footprint.size_in_bytes();
                            (self.bytes(resource, source.offset, size, true)?, footprint.offset)
                        }
                        None if self.zero_fill_unknown => {
                            let size = footprint.footprint.size_in_bytes() as usize;
                            (vec![0; size], footprint.offset)
                        }
                        None => return Err(GpuError::UnknownResource(resource)),
                    }
                }
            };
            let start = dst_offset as usize;
            self.readback[start..start + bytes.len()].copy_from_slice(&bytes);
            self.stats.readback_bytes += bytes.len() as u64;
        }

        self.stats.readback_submissions += 1;
        Ok(self.fence.signal())
    }

    fn read_readback(&mut self, size: u64) -> Result<Vec<u8>, GpuError> {
        let available = self.readback.len() as u64;
        if size > available {
            return Err(GpuError::ReadbackOutOfBounds {
                requested: size,
                available,
            });
        }
        Ok(self.readback[..size as usize].to_vec())
    }

    fn fence(&self) -> &dyn Fence {
        &self.fence
    }

    fn copyable_footprints(&self, desc: &ResourceDesc) -> CopyableFootprints {
        if desc.is_buffer() {
            return CopyableFootprints {
                layouts: Vec::new(),
                total_bytes: desc.width,
            };
        }

        // Formats the engine does not lay out itself are treated as 32-bit texels.
        let bytes_per_element = u64::from(desc.format.bytes_per_element().unwrap_or(4));
        let mut layouts = Vec::with_capacity(desc.subresource_count() as usize);
        let mut offset = 0u64;
        for _slice in 0..desc.array_size() {
            for mip in 0..desc.mip_levels() {
                let width = (desc.width >> mip).max(1);
                let height = (desc.height >> mip).max(1);
                let depth = if desc.dimension == ResourceDimension::Texture3d {
                    (u32::from(desc.depth_or_array_size) >> mip).max(1)
                } else {
                    1
                };
                let row_pitch = align_up(width * bytes_per_element, ROW_PITCH_ALIGNMENT);
                let footprint = SubresourceFootprint {
                    format: desc.format,
                    width: width as u32,
                    height,
                    depth,
                    row_pitch: row_pitch as u32,
                };
                offset = align_up(offset, PLACEMENT_ALIGNMENT);
                layouts.push(PlacedFootprint { offset, footprint });
                offset += footprint.size_in_bytes();
            }
        }
        CopyableFootprints {
            layouts,
            total_bytes: offset,
        }
    }

    fn resource_tiling(&self, desc: &ResourceDesc) -> ResourceTiling {
        if desc.is_buffer() {
            let tiles = desc.width.div_ceil(TILE_SIZE_IN_BYTES) as u32;
            return ResourceTiling {
                total_tiles: tiles,
                packed_mip_info: PackedMipInfo::default(),
                tile_shape: TileShape {
                    width_in_texels: TILE_SIZE_IN_BYTES as u32,
                    height_in_texels: 1,
                    depth_in_texels: 1,
                },
                subresources: vec![SubresourceTiling {
                    width_in_tiles: tiles,
                    height_in_tiles: 1,
                    depth_in_tiles: 1,
                    start_tile_index_in_overall_resource: 0,
                }],
            };
        }

        let shape = standard_tile_shape(desc.format.bytes_per_element().unwrap_or(4));
        let mips = desc.mip_levels();
        let num_standard_mips = (0..mips)
            .take_while(|&mip| {
                (desc.width >> mip) >= u64::from(shape.width_in_texels)
                    && (desc.height >> mip) >= shape.height_in_texels
            })
            .count() as u32;
        let num_packed_mips = mips - num_standard_mips;
        let packed_tiles_per_slice = u32::from(num_packed_mips > 0);

        let mut subresources = Vec::with_capacity(desc.subresource_count() as usize);
        let mut next = 0u32;
        let mut packed_start = None;
        for _slice in 0..desc.array_size() {
            for mip in 0..mips {
                if mip < num_standard_mips {
                    let width = (desc.width >> mip).max(1);
                    let height = (desc.height >> mip).max(1);
                    let tiling = SubresourceTiling {
                        width_in_tiles: width.div_ceil(u64::from(shape.width_in_texels)) as u32,
                        height_in_tiles: height.div_ceil(shape.height_in_texels),
                        depth_in_tiles: 1,
                        start_tile_index_in_overall_resource: next,
                    };
                    next += tiling.tile_count();
                    subresources.push(tiling);
                } else {
                    subresources.push(SubresourceTiling {
                        start_tile_index_in_overall_resource: SubresourceTiling::PACKED_START,
                        ..SubresourceTiling::default()
                    });
                }
            }
            if packed_tiles_per_slice > 0 {
                packed_start.get_or_insert(next);
                next += packed_tiles_per_slice;
            }
        }

        ResourceTiling {
            total_tiles: next,
            packed_mip_info: PackedMipInfo {
                num_standard_mips,
                num_packed_mips,
                num_tiles_for_packed_mips: packed_tiles_per_slice,
                start_tile_index_in_overall_resource: packed_start.unwrap_or(0),
            },
            tile_shape: shape,
            subresources,
        }
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo {
        let per_primitive = match inputs.level {
            AccelerationStructureLevel::TopLevel => 128,
            AccelerationStructureLevel::BottomLevel => 64,
        };
        let result_size = align_up(
            ACCELERATION_STRUCTURE_ALIGNMENT + inputs.primitive_count() * per_primitive,
            ACCELERATION_STRUCTURE_ALIGNMENT,
        );
        let scratch_size = align_up(result_size / 2, ACCELERATION_STRUCTURE_ALIGNMENT);
        PrebuildInfo {
            result_size,
            scratch_size,
            update_scratch_size: align_up(scratch_size / 2, ACCELERATION_STRUCTURE_ALIGNMENT),
        }
    }

    fn omm_prebuild_info(&self, inputs: &OmmInputs) -> PrebuildInfo {
        let result_size = align_up(
            ACCELERATION_STRUCTURE_ALIGNMENT + inputs.input_buffer_size,
            ACCELERATION_STRUCTURE_ALIGNMENT,
        );
        PrebuildInfo {
            result_size,
            scratch_size: align_up(result_size / 2, ACCELERATION_STRUCTURE_ALIGNMENT),
            update_scratch_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_fence_completes_one_value_per_poll() {
        let fence = CountingFence::new();
        let target = {
            fence.signal();
            fence.signal()
        };
        FenceWaiter::default().wait(&fence, target).unwrap();
        assert_eq!(fence.completed_value(), 2);
        assert!(fence.polls() >= 3);
    }

    #[test]
    fn cancelled_wait_fails() {
        let fence = CountingFence::new();
        let waiter = FenceWaiter::default();
        waiter.cancel_token().cancel();
        assert_eq!(
            waiter.wait(&fence, 5),
            Err(WaitError::Cancelled {
                target: 5,
                completed: 0
            })
        );
    }

    #[test]
    fn texture_footprints_are_pitch_and_placement_aligned() {
        let gpu = HostMemoryGpu::new();
        let desc = ResourceDesc::texture2d(100, 10, 1, 2, Format::R8G8B8A8_UNORM);
        let footprints = gpu.copyable_footprints(&desc);

        assert_eq!(footprints.layouts.len(), 2);
        assert_eq!(footprints.layouts[0].footprint.row_pitch, 512);
        assert_eq!(footprints.layouts[1].offset, 5120);
        assert_eq!(footprints.layouts[1].footprint.row_pitch, 256);
        assert_eq!(footprints.total_bytes, 5120 + 256 * 5);
    }

    #[test]
    fn tiling_places_packed_mips_after_each_slice() {
        let gpu = HostMemoryGpu::new();
        // 256x256 RGBA8: mips 256 and 128 are standard (128x128 tiles), 64/32 are packed.
        let desc = ResourceDesc::texture2d(256, 256, 2, 4, Format::R8G8B8A8_UNORM);
        let tiling = gpu.resource_tiling(&desc);

        assert_eq!(tiling.packed_mip_info.num_standard_mips, 2);
        assert_eq!(tiling.packed_mip_info.num_packed_mips, 2);
        // Slice 0: 4 + 1 standard tiles, 1 packed; slice 1 likewise.
        assert_eq!(tiling.total_tiles, 12);
        assert_eq!(tiling.packed_mip_info.start_tile_index_in_overall_resource, 5);
        assert_eq!(tiling.subresources[4].start_tile_index_in_overall_resource, 6);
        assert!(tiling.subresources[2].is_packed());
    }

    #[test]
    fn readback_requires_residency() {
        let mut gpu = HostMemoryGpu::new();
        gpu.add_resource(ObjectKey(1), ResourceDesc::buffer(8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        gpu.set_resident(ObjectKey(1), false);
        let copy = ReadbackCopy::Buffer {
            resource: ObjectKey(1),
            offset: 2,
            size: 4,
            dst_offset: 0,
        };
        assert_eq!(
            gpu.submit_readback(&[copy]),
            Err(GpuError::NotResident(ObjectKey(1)))
        );

        let value = gpu.enqueue_make_resident(&[ObjectKey(1)]).unwrap();
        FenceWaiter::default().wait(gpu.fence(), value).unwrap();
        let value = gpu.submit_readback(&[copy]).unwrap();
        FenceWaiter::default().wait(gpu.fence(), value).unwrap();
        assert_eq!(gpu.read_readback(4).unwrap(), vec![3, 4, 5, 6]);
    }
}
