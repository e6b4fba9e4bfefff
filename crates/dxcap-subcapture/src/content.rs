//! Capture and re-upload of resource bytes.
//!
//! Two paths exist, picked by whether the CPU can map the resource:
//!
//! - CPU-mappable resources are restored by replaying a `Map`/`Unmap` pair whose mapped-data
//!   side channel carries the captured bytes.
//! - Device-only resources go through a staging round trip: make resident, copy into a readback
//!   buffer, wait, read, evict, then in the outgoing stream create an upload buffer holding the
//!   bytes and copy from it into the real resource.
//!
//! Device-only restores are batched by a byte budget and strictly serialized: each batch is
//! recorded on one list, executed and waited on before the next batch starts.

use std::collections::BTreeMap;

use hashbrown::HashMap as FastMap;
use serde::Serialize;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::command::{Command, CopyLocation, TextureCopyLocation};
use crate::config::SubcaptureConfig;
use crate::error::{Result, SubcaptureError};
use crate::gpu::{FenceWaiter, GpuDevice, PlacedFootprint, ReadbackCopy, PLACEMENT_ALIGNMENT};
use crate::model::{
    CommandKey, HeapFlags, HeapType, KeyOffset, ObjectKey, ResourceDesc, ResourceRecord,
    ResourceStates,
};
use crate::stream::{MappedData, RestoreQueue, RestoreStream};

pub type ContentId = u64;

/// Bytes captured from one buffer range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferRestoreInfo {
    pub id: ContentId,
    pub key: ObjectKey,
    pub offset: u64,
    pub size: u64,
    /// xxh3-64 of `bytes`.
    pub hash: u64,
    pub mappable: bool,
    /// Call that consumed the range.
    pub command: CommandKey,
    pub bytes: Vec<u8>,
}

impl BufferRestoreInfo {
    pub fn location(&self) -> KeyOffset {
        KeyOffset::new(self.key, self.offset)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContentStats {
    pub captures: u64,
    pub deduplicated: u64,
    pub bytes_stored: u64,
    pub bytes_replayed: u64,
    pub batches: u64,
}

/// Window into the restore-time upload buffer used while replaying captured ranges.
#[derive(Clone, Copy, Debug)]
pub struct UploadCursor {
    pub buffer: ObjectKey,
    pub capacity: u64,
    pub offset: u64,
}

impl UploadCursor {
    pub fn new(buffer: ObjectKey, capacity: u64) -> Self {
        Self {
            buffer,
            capacity,
            offset: 0,
        }
    }

    pub fn rewind(&mut self) {
        self.offset = 0;
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment.max(1)) * alignment.max(1)
}

#[derive(Debug)]
enum BatchItem {
    Buffer { key: ObjectKey, size: u64 },
    Texture { key: ObjectKey, layouts: Vec<PlacedFootprint>, size: u64 },
}

impl BatchItem {
    fn key(&self) -> ObjectKey {
        match self {
            BatchItem::Buffer { key, .. } | BatchItem::Texture { key, .. } => *key,
        }
    }

    fn size(&self) -> u64 {
        match self {
            BatchItem::Buffer { size, .. } | BatchItem::Texture { size, .. } => *size,
        }
    }
}

/// Splits items into consecutive batches of at most `budget` bytes. An item larger than the
/// budget forms a batch of its own.
fn batches(items: Vec<BatchItem>, budget: u64) -> Vec<Vec<BatchItem>> {
    let mut out: Vec<Vec<BatchItem>> = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for item in items {
        if !current.is_empty() && used + item.size() > budget {
            out.push(std::mem::take(&mut current));
            used = 0;
        }
        used += item.size();
        current.push(item);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[derive(Debug)]
pub struct ContentPipeline {
    captures: BTreeMap<ContentId, BufferRestoreInfo>,
    index: FastMap<(ObjectKey, u64, u64), ContentId>,
    refs: FastMap<ContentId, u32>,
    /// Hash of the bytes last replayed at each location.
    replayed: FastMap<KeyOffset, u64>,
    next_id: ContentId,
    buffer_batch_bytes: u64,
    texture_batch_bytes: u64,
    texture_granularity: u64,
    waiter: FenceWaiter,
    stats: ContentStats,
}

impl ContentPipeline {
    pub fn new(config: &SubcaptureConfig, waiter: FenceWaiter) -> Self {
        Self {
            captures: BTreeMap::new(),
            index: FastMap::new(),
            refs: FastMap::new(),
            replayed: FastMap::new(),
            next_id: 1,
            buffer_batch_bytes: config.buffer_batch_bytes,
            texture_batch_bytes: config.texture_batch_bytes,
            texture_granularity: config.texture_footprint_granularity,
            waiter,
            stats: ContentStats::default(),
        }
    }

    pub fn stats(&self) -> ContentStats {
        self.stats
    }

    pub fn get(&self, id: ContentId) -> Option<&BufferRestoreInfo> {
        self.captures.get(&id)
    }

    pub fn len(&self) -> usize {
        self.captures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    /// Captures `size` bytes at `offset` of `key` at the moment a command consumes them.
    ///
    /// Capturing bytes identical to an existing capture at the same location stores nothing and
    /// returns the existing id. Every returned id holds one reference; see
    /// [`ContentPipeline::release`].
    pub fn capture_on_consumption(
        &mut self,
        gpu: &mut dyn GpuDevice,
        key: ObjectKey,
        record: &ResourceRecord,
        offset: u64,
        size: u64,
        command: CommandKey,
    ) -> Result<ContentId> {
        let bytes = if record.cpu_mappable {
            gpu.read_mapped(key, offset, size)?
        } else {
            let value = gpu.submit_readback(&[ReadbackCopy::Buffer {
                resource: key,
                offset,
                size,
                dst_offset: 0,
            }])?;
            self.waiter.wait(gpu.fence(), value)?;
            gpu.read_readback(size)?
        };
        let hash = xxh3_64(&bytes);
        self.stats.captures += 1;

        if let Some(&id) = self.index.get(&(key, offset, hash)) {
            self.stats.deduplicated += 1;
            *self.refs.entry(id).or_insert(0) += 1;
            debug!(%key, offset, id, %command, "content already captured");
            return Ok(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.stats.bytes_stored += size;
        self.index.insert((key, offset, hash), id);
        self.refs.insert(id, 1);
        self.captures.insert(
            id,
            BufferRestoreInfo {
                id,
                key,
                offset,
                size,
                hash,
                mappable: record.cpu_mappable,
                command,
                bytes,
            },
        );
        debug!(%key, offset, size, id, %command, "captured content");
        Ok(id)
    }

    pub fn retain(&mut self, id: ContentId) {
        *self.refs.entry(id).or_insert(0) += 1;
    }

    /// Drops one reference; the capture is discarded with the last one.
    pub fn release(&mut self, id: ContentId) {
        let Some(count) = self.refs.get_mut(&id) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.refs.remove(&id);
        if let Some(info) = self.captures.remove(&id) {
            self.index.remove(&(info.key, info.offset, info.hash));
        }
    }

    /// Writes one captured range back, unless the same bytes were already replayed at that
    /// location. Device-only ranges are staged through `upload` and copied on `copy_queue`.
    ///
    /// Returns whether anything was written. A device-only range that does not fit the rest of
    /// the upload buffer is an error.
    pub fn replay_buffer_content(
        &mut self,
        id: ContentId,
        upload: &mut UploadCursor,
        copy_queue: &mut RestoreQueue,
        stream: &mut RestoreStream<'_>,
    ) -> Result<bool> {
        let Some(info) = self.captures.get(&id) else {
            debug!(id, "no captured content to replay");
            return Ok(false);
        };
        if self.replayed.get(&info.location()) == Some(&info.hash) {
            return Ok(false);
        }

        if info.mappable {
            stream.emit(Command::Map {
                resource: info.key,
                subresource: 0,
            });
            stream.emit_with_data(
                Command::Unmap {
                    resource: info.key,
                    subresource: 0,
                },
                MappedData {
                    offset: info.offset,
                    bytes: info.bytes.clone(),
                },
            );
        } else {
            if upload.offset + info.size > upload.capacity {
                return Err(SubcaptureError::UploadBufferOverflow {
                    offset: upload.offset,
                    size: info.size,
                    capacity: upload.capacity,
                });
            }
            stream.emit(Command::Map {
                resource: upload.buffer,
                subresource: 0,
            });
            stream.emit_with_data(
                Command::Unmap {
                    resource: upload.buffer,
                    subresource: 0,
                },
                MappedData {
                    offset: upload.offset,
                    bytes: info.bytes.clone(),
                },
            );
            copy_queue.record(
                stream,
                Command::CopyBufferRegion {
                    list: copy_queue.list,
                    dst: info.key,
                    dst_offset: info.offset,
                    src: upload.buffer,
                    src_offset: upload.offset,
                    size: info.size,
                },
            );
            upload.offset += info.size;
        }

        self.stats.bytes_replayed += info.size;
        self.replayed.insert(info.location(), info.hash);
        Ok(true)
    }

    /// Restores a CPU-mappable resource through `Map`/`Unmap`.
    pub fn restore_mappable(
        &mut self,
        gpu: &mut dyn GpuDevice,
        key: ObjectKey,
        desc: &ResourceDesc,
        stream: &mut RestoreStream<'_>,
    ) -> Result<()> {
        let size = gpu.copyable_footprints(desc).total_bytes;
        let bytes = gpu.read_mapped(key, 0, size)?;
        stream.emit(Command::Map {
            resource: key,
            subresource: 0,
        });
        stream.emit_with_data(
            Command::Unmap {
                resource: key,
                subresource: 0,
            },
            MappedData { offset: 0, bytes },
        );
        self.stats.bytes_replayed += size;
        Ok(())
    }

    /// Restores device-only resources through batched staging round trips. Returns the number
    /// of batches.
    pub fn restore_device_only(
        &mut self,
        gpu: &mut dyn GpuDevice,
        device: ObjectKey,
        resources: &[(ObjectKey, ResourceDesc)],
        queue: &mut RestoreQueue,
        stream: &mut RestoreStream<'_>,
    ) -> Result<usize> {
        let mut buffers = Vec::new();
        let mut textures = Vec::new();
        for (key, desc) in resources {
            if desc.is_buffer() {
                buffers.push(BatchItem::Buffer {
                    key: *key,
                    size: desc.width,
                });
            } else {
                let footprints = gpu.copyable_footprints(desc);
                let size = align_up(
                    align_up(footprints.total_bytes, self.texture_granularity),
                    PLACEMENT_ALIGNMENT,
                );
                textures.push(BatchItem::Texture {
                    key: *key,
                    layouts: footprints.layouts,
                    size,
                });
            }
        }

        let mut count = 0;
        let all = batches(buffers, self.buffer_batch_bytes)
            .into_iter()
            .chain(batches(textures, self.texture_batch_bytes));
        for batch in all {
            self.restore_batch(gpu, device, &batch, queue, stream)?;
            count += 1;
        }
        info!(resources = resources.len(), batches = count, "device-only content restored");
        Ok(count)
    }

    fn restore_batch(
        &mut self,
        gpu: &mut dyn GpuDevice,
        device: ObjectKey,
        batch: &[BatchItem],
        queue: &mut RestoreQueue,
        stream: &mut RestoreStream<'_>,
    ) -> Result<()> {
        let keys: Vec<ObjectKey> = batch.iter().map(BatchItem::key).collect();
        let resident = gpu.enqueue_make_resident(&keys)?;
        self.waiter.wait(gpu.fence(), resident)?;

        let mut copies = Vec::new();
        let mut placements = Vec::with_capacity(batch.len());
        let mut cursor = 0u64;
        for item in batch {
            placements.push(cursor);
            match item {
                BatchItem::Buffer { key, size } => copies.push(ReadbackCopy::Buffer {
                    resource: *key,
                    offset: 0,
                    size: *size,
                    dst_offset: cursor,
                }),
                BatchItem::Texture { key, layouts, .. } => {
                    for (subresource, layout) in (0u32..).zip(layouts) {
                        copies.push(ReadbackCopy::Texture {
                            resource: *key,
                            subresource,
                            footprint: PlacedFootprint {
                                offset: cursor + layout.offset,
                                footprint: layout.footprint,
                            },
                        });
                    }
                }
            }
            cursor = align_up(cursor + item.size(), PLACEMENT_ALIGNMENT);
        }
        let total = cursor;

        let copied = gpu.submit_readback(&copies)?;
        self.waiter.wait(gpu.fence(), copied)?;
        let bytes = gpu.read_readback(total)?;
        gpu.evict(&keys)?;

        let upload = stream.new_object();
        stream.emit(Command::CreateCommittedResource {
            device,
            resource: upload,
            heap_type: HeapType::Upload,
            heap_flags: HeapFlags::empty(),
            desc: ResourceDesc::buffer(total),
            initial_state: ResourceStates::GENERIC_READ,
            gpu_va: 0,
            protected_session: None,
        });
        stream.emit(Command::Map {
            resource: upload,
            subresource: 0,
        });
        stream.emit_with_data(
            Command::Unmap {
                resource: upload,
                subresource: 0,
            },
            MappedData { offset: 0, bytes },
        );

        for (item, &placement) in batch.iter().zip(&placements) {
            match item {
                BatchItem::Buffer { key, size } => queue.record(
                    stream,
                    Command::CopyBufferRegion {
                        list: queue.list,
                        dst: *key,
                        dst_offset: 0,
                        src: upload,
                        src_offset: placement,
                        size: *size,
                    },
                ),
                BatchItem::Texture { key, layouts, .. } => {
                    for (subresource, layout) in (0u32..).zip(layouts) {
                        queue.record(
                            stream,
                            Command::CopyTextureRegion {
                                list: queue.list,
                                dst: TextureCopyLocation {
                                    resource: *key,
                                    location: CopyLocation::Subresource(subresource),
                                },
                                src: TextureCopyLocation {
                                    resource: upload,
                                    location: CopyLocation::Footprint(PlacedFootprint {
                                        offset: placement + layout.offset,
                                        footprint: layout.footprint,
                                    }),
                                },
                            },
                        );
                    }
                }
            }
        }
        queue.submit_and_wait(stream);
        stream.emit(Command::Release { object: upload });

        self.stats.batches += 1;
        self.stats.bytes_replayed += total;
        debug!(resources = batch.len(), bytes = total, "restored content batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandListType;
    use crate::gpu::HostMemoryGpu;
    use crate::model::{Format, KeyAllocator};
    use crate::stream::MemorySink;

    fn device_buffer(size: u64) -> ResourceRecord {
        ResourceRecord::new(ResourceDesc::buffer(size), HeapType::Default, ResourceStates::COMMON)
    }

    #[test]
    fn identical_captures_store_bytes_once() {
        let mut gpu = HostMemoryGpu::new();
        gpu.add_resource(ObjectKey(1), ResourceDesc::buffer(64), (0..64).collect());
        let mut content =
            ContentPipeline::new(&SubcaptureConfig::default(), FenceWaiter::default());
        let record = device_buffer(64);

        let first = content
            .capture_on_consumption(&mut gpu, ObjectKey(1), &record, 16, 32, CommandKey(5))
            .unwrap();
        let stored = content.stats().bytes_stored;
        let second = content
            .capture_on_consumption(&mut gpu, ObjectKey(1), &record, 16, 32, CommandKey(9))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(stored, 32);
        assert_eq!(content.stats().bytes_stored, 32);
        assert_eq!(content.stats().deduplicated, 1);
        assert_eq!(content.get(first).unwrap().bytes, (16..48).collect::<Vec<u8>>());

        gpu.write(ObjectKey(1), 16, &[0xff]).unwrap();
        let third = content
            .capture_on_consumption(&mut gpu, ObjectKey(1), &record, 16, 32, CommandKey(10))
            .unwrap();
        assert_ne!(third, first);
        assert_eq!(content.stats().bytes_stored, 64);
    }

    #[test]
    fn captures_are_discarded_with_their_last_reference() {
        let mut gpu = HostMemoryGpu::new();
        gpu.add_resource(ObjectKey(1), ResourceDesc::buffer(8), vec![7; 8]);
        let mut content =
            ContentPipeline::new(&SubcaptureConfig::default(), FenceWaiter::default());
        let record = device_buffer(8);
        let id = content
            .capture_on_consumption(&mut gpu, ObjectKey(1), &record, 0, 8, CommandKey(1))
            .unwrap();
        content.retain(id);

        content.release(id);
        assert!(content.get(id).is_some());
        content.release(id);
        assert!(content.get(id).is_none());
    }

    #[test]
    fn replay_skips_content_already_at_its_location() {
        let mut gpu = HostMemoryGpu::new();
        gpu.add_resource(ObjectKey(1), ResourceDesc::buffer(8), vec![3; 8]);
        let mut content =
            ContentPipeline::new(&SubcaptureConfig::default(), FenceWaiter::default());
        let id = content
            .capture_on_consumption(&mut gpu, ObjectKey(1), &device_buffer(8), 0, 8, CommandKey(1))
            .unwrap();

        let mut sink = MemorySink::new();
        let mut keys = KeyAllocator::new();
        let mut stream = RestoreStream::new(&mut sink, &mut keys);
        let mut queue = RestoreQueue::create(&mut stream, ObjectKey(100), CommandListType::Copy);
        let mut upload = UploadCursor::new(ObjectKey(200), 64);

        assert!(content.replay_buffer_content(id, &mut upload, &mut queue, &mut stream).unwrap());
        assert!(!content.replay_buffer_content(id, &mut upload, &mut queue, &mut stream).unwrap());
        assert_eq!(upload.offset, 8);
        assert_eq!(content.stats().bytes_replayed, 8);
        assert_eq!(sink.count("ID3D12GraphicsCommandList::CopyBufferRegion"), 1);
    }

    #[test]
    fn device_only_content_larger_than_the_upload_buffer_is_rejected() {
        let mut gpu = HostMemoryGpu::new();
        gpu.add_resource(ObjectKey(1), ResourceDesc::buffer(8), vec![3; 8]);
        let mut content =
            ContentPipeline::new(&SubcaptureConfig::default(), FenceWaiter::default());
        let id = content
            .capture_on_consumption(&mut gpu, ObjectKey(1), &device_buffer(8), 0, 8, CommandKey(1))
            .unwrap();

        let mut sink = MemorySink::new();
        let mut keys = KeyAllocator::new();
        let mut stream = RestoreStream::new(&mut sink, &mut keys);
        let mut queue = RestoreQueue::create(&mut stream, ObjectKey(100), CommandListType::Copy);
        let mut upload = UploadCursor::new(ObjectKey(200), 4);

        let err = content
            .replay_buffer_content(id, &mut upload, &mut queue, &mut stream)
            .unwrap_err();
        assert!(matches!(
            err,
            SubcaptureError::UploadBufferOverflow {
                offset: 0,
                size: 8,
                capacity: 4,
            }
        ));
        assert_eq!(sink.count("ID3D12GraphicsCommandList::CopyBufferRegion"), 0);
    }

    #[test]
    fn device_only_restore_batches_by_budget() {
        let mut gpu = HostMemoryGpu::new();
        let mut resources = Vec::new();
        for key in 1..=3u64 {
            let desc = ResourceDesc::buffer(600 * 1024);
            gpu.add_resource(ObjectKey(key), desc, vec![key as u8; 600 * 1024]);
            resources.push((ObjectKey(key), desc));
        }
        let texture = ResourceDesc::texture2d(64, 64, 1, 1, Format::R8G8B8A8_UNORM);
        gpu.add_resource(ObjectKey(4), texture, vec![9; 64 * 64 * 4]);
        resources.push((ObjectKey(4), texture));

        let mut content =
            ContentPipeline::new(&SubcaptureConfig::default(), FenceWaiter::default());
        let mut sink = MemorySink::new();
        let mut keys = KeyAllocator::new();
        let mut stream = RestoreStream::new(&mut sink, &mut keys);
        let mut queue = RestoreQueue::create(&mut stream, ObjectKey(100), CommandListType::Direct);
        let batches = content
            .restore_device_only(&mut gpu, ObjectKey(100), &resources, &mut queue, &mut stream)
            .unwrap();

        // 600 KiB buffers against a 1 MiB budget: one per batch, then the texture.
        assert_eq!(batches, 4);
        assert_eq!(gpu.stats().make_resident_calls, 4);
        assert_eq!(gpu.stats().evict_calls, 4);
        assert_eq!(sink.count("ID3D12Device::CreateCommittedResource"), 4);
        assert_eq!(sink.count("ID3D12GraphicsCommandList::CopyTextureRegion"), 1);
        assert_eq!(sink.count("ID3D12CommandQueue::ExecuteCommandLists"), 4);

        let uploaded: Vec<&MappedData> = sink
            .records()
            .iter()
            .filter_map(|record| record.mapped_data.as_ref())
            .collect();
        assert_eq!(uploaded.len(), 4);
        assert!(uploaded[0].bytes[..600 * 1024].iter().all(|&b| b == 1));
        assert!(uploaded[3].bytes[..64 * 4].iter().all(|&b| b == 9));
    }

    #[test]
    fn oversized_items_form_their_own_batch() {
        let items = vec![
            BatchItem::Buffer { key: ObjectKey(1), size: 10 },
            BatchItem::Buffer { key: ObjectKey(2), size: 100 },
            BatchItem::Buffer { key: ObjectKey(3), size: 5 },
            BatchItem::Buffer { key: ObjectKey(4), size: 5 },
        ];
        let sizes: Vec<Vec<u64>> = batches(items, 20)
            .iter()
            .map(|batch| batch.iter().map(BatchItem::size).collect())
            .collect();
        assert_eq!(sizes, vec![vec![10], vec![100], vec![5, 5]]);
    }
}
