//! Tile-to-heap mapping tables of reserved resources.
//!
//! A reserved resource has no memory of its own; `UpdateTileMappings` binds each of its 64 KiB
//! tiles to a tile of some heap. The tracker mirrors those calls into a flat per-resource tile
//! array and can turn the array back into a sequence of update calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::command::Command;
use crate::diagnostics::{Diagnostics, Limitation};
use crate::error::{Result, SubcaptureError};
use crate::gpu::ResourceTiling;
use crate::model::{ObjectKey, ResourceDesc};
use crate::stream::RestoreStream;

/// `D3D12_TILED_RESOURCE_COORDINATE`. For packed mips and buffers only `x` is meaningful.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TiledResourceCoordinate {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub subresource: u32,
}

impl TiledResourceCoordinate {
    pub fn new(x: u32, y: u32, z: u32, subresource: u32) -> Self {
        Self { x, y, z, subresource }
    }
}

/// `D3D12_TILE_REGION_SIZE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRegionSize {
    pub num_tiles: u32,
    pub use_box: bool,
    pub width: u32,
    pub height: u16,
    pub depth: u16,
}

impl TileRegionSize {
    pub fn linear(num_tiles: u32) -> Self {
        Self {
            num_tiles,
            use_box: false,
            width: 0,
            height: 0,
            depth: 0,
        }
    }

    pub fn boxed(width: u32, height: u16, depth: u16) -> Self {
        Self {
            num_tiles: width * u32::from(height) * u32::from(depth),
            use_box: true,
            width,
            height,
            depth,
        }
    }
}

/// Start coordinate plus optional size. Without a size the region is the single tile at the
/// coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRegion {
    pub coordinate: TiledResourceCoordinate,
    pub size: Option<TileRegionSize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileRangeFlag {
    None,
    Null,
    Skip,
    ReuseSingleTile,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub heap: Option<ObjectKey>,
    pub heap_offset: u32,
    pub subresource: u32,
    pub packed: bool,
}

/// One reserved resource and its current tile mappings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TiledResource {
    pub key: ObjectKey,
    pub tiling: ResourceTiling,
    pub tiles: Vec<Tile>,
    /// Bumped on every mapping change.
    pub update_id: u64,
    is_buffer: bool,
    mip_levels: u32,
    /// First packed tile of each array slice.
    packed_offsets: Vec<u32>,
}

impl TiledResource {
    pub fn new(key: ObjectKey, desc: &ResourceDesc, tiling: ResourceTiling) -> Self {
        let mip_levels = desc.mip_levels();
        let packed = tiling.packed_mip_info;
        let mut tiles = vec![Tile::default(); tiling.total_tiles as usize];

        for (subresource, sub) in (0u32..).zip(&tiling.subresources) {
            if sub.is_packed() {
                continue;
            }
            let start = sub.start_tile_index_in_overall_resource as usize;
            let end = (start + sub.tile_count() as usize).min(tiles.len());
            for tile in &mut tiles[start.min(end)..end] {
                tile.subresource = subresource;
            }
        }

        let mut packed_offsets = Vec::new();
        if !desc.is_buffer() && packed.num_packed_mips > 0 {
            for slice in 0..desc.array_size() {
                let offset = if packed.num_standard_mips > 0 {
                    let last = slice * mip_levels + packed.num_standard_mips - 1;
                    tiling
                        .subresources
                        .get(last as usize)
                        .map(|sub| sub.start_tile_index_in_overall_resource + sub.tile_count())
                        .unwrap_or(0)
                } else {
                    slice * packed.num_tiles_for_packed_mips
                };
                let first_packed = slice * mip_levels + packed.num_standard_mips;
                let end = ((offset + packed.num_tiles_for_packed_mips) as usize).min(tiles.len());
                for tile in &mut tiles[(offset as usize).min(end)..end] {
                    tile.subresource = first_packed;
                    tile.packed = true;
                }
                packed_offsets.push(offset);
            }
        }

        Self {
            key,
            tiling,
            tiles,
            update_id: 0,
            is_buffer: desc.is_buffer(),
            mip_levels,
            packed_offsets,
        }
    }

    fn out_of_range(&self, detail: String) -> SubcaptureError {
        SubcaptureError::TileOutOfRange {
            key: self.key,
            detail,
        }
    }

    /// Index into [`TiledResource::tiles`] of the tile at `coordinate`.
    pub fn tile_index(&self, coordinate: TiledResourceCoordinate) -> Result<usize> {
        let index = if self.is_buffer {
            coordinate.x as usize
        } else {
            let mip = coordinate.subresource % self.mip_levels;
            let slice = coordinate.subresource / self.mip_levels;
            let packed = self.tiling.packed_mip_info;
            if mip >= packed.num_standard_mips {
                let offset = self
                    .packed_offsets
                    .get(slice as usize)
                    .ok_or_else(|| self.out_of_range(format!("no packed mips for slice {slice}")))?;
                if coordinate.x >= packed.num_tiles_for_packed_mips {
                    let detail = format!("packed tile {} of slice {slice}", coordinate.x);
                    return Err(self.out_of_range(detail));
                }
                (offset + coordinate.x) as usize
            } else {
                let sub = self
                    .tiling
                    .subresources
                    .get(coordinate.subresource as usize)
                    .ok_or_else(|| {
                        self.out_of_range(format!("subresource {}", coordinate.subresource))
                    })?;
                if coordinate.x >= sub.width_in_tiles
                    || coordinate.y >= sub.height_in_tiles
                    || coordinate.z >= sub.depth_in_tiles
                {
                    return Err(self.out_of_range(format!("{coordinate:?}")));
                }
                (sub.start_tile_index_in_overall_resource
                    + coordinate.x
                    + coordinate.y * sub.width_in_tiles
                    + coordinate.z * sub.width_in_tiles * sub.height_in_tiles) as usize
            }
        };
        if index >= self.tiles.len() {
            return Err(self.out_of_range(format!("tile {index} of {}", self.tiles.len())));
        }
        Ok(index)
    }

    /// Inverse of [`TiledResource::tile_index`].
    pub fn coordinate_of(&self, index: usize) -> TiledResourceCoordinate {
        if self.is_buffer {
            return TiledResourceCoordinate::new(index as u32, 0, 0, 0);
        }
        let tile = self.tiles[index];
        if tile.packed {
            let slice = tile.subresource / self.mip_levels;
            let offset = self.packed_offsets[slice as usize];
            return TiledResourceCoordinate::new(index as u32 - offset, 0, 0, tile.subresource);
        }
        let sub = self.tiling.subresources[tile.subresource as usize];
        let local = index as u32 - sub.start_tile_index_in_overall_resource;
        let row = sub.width_in_tiles.max(1);
        let plane = row * sub.height_in_tiles.max(1);
        TiledResourceCoordinate::new(
            local % row,
            (local / row) % sub.height_in_tiles.max(1),
            local / plane,
            tile.subresource,
        )
    }

    /// Tiles covered by `region`, in update order.
    fn region_tiles(&self, region: &TileRegion) -> Result<Vec<usize>> {
        let Some(size) = region.size else {
            return Ok(vec![self.tile_index(region.coordinate)?]);
        };
        if size.use_box {
            let mut out = Vec::with_capacity(size.num_tiles as usize);
            for z in 0..u32::from(size.depth) {
                for y in 0..u32::from(size.height) {
                    for x in 0..size.width {
                        let mut coordinate = region.coordinate;
                        coordinate.x += x;
                        coordinate.y += y;
                        coordinate.z += z;
                        out.push(self.tile_index(coordinate)?);
                    }
                }
            }
            Ok(out)
        } else {
            let start = self.tile_index(region.coordinate)?;
            let end = start + size.num_tiles as usize;
            if end > self.tiles.len() {
                let detail = format!("{} tiles from tile {start}", size.num_tiles);
                return Err(self.out_of_range(detail));
            }
            Ok((start..end).collect())
        }
    }

    fn tiles_of(&self, regions: &[TileRegion]) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        for region in regions {
            out.extend(self.region_tiles(region)?);
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct TiledResourceTracker {
    resources: BTreeMap<ObjectKey, TiledResource>,
}

impl TiledResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: ObjectKey, desc: &ResourceDesc, tiling: ResourceTiling) {
        debug!(%key, total_tiles = tiling.total_tiles, "tracking reserved resource");
        self.resources.insert(key, TiledResource::new(key, desc, tiling));
    }

    pub fn remove(&mut self, key: ObjectKey) {
        self.resources.remove(&key);
    }

    pub fn get(&self, key: ObjectKey) -> Option<&TiledResource> {
        self.resources.get(&key)
    }

    pub fn contains(&self, key: ObjectKey) -> bool {
        self.resources.contains_key(&key)
    }

    pub fn snapshot(&self, key: ObjectKey) -> Option<TiledResource> {
        self.resources.get(&key).cloned()
    }

    fn require_mut(&mut self, key: ObjectKey) -> Result<&mut TiledResource> {
        self.resources.get_mut(&key).ok_or(SubcaptureError::NotTiled(key))
    }

    /// Mirrors one `UpdateTileMappings` call.
    ///
    /// Empty `range_tile_counts` means a single range spanning every region tile; missing flags
    /// and offsets default to `NONE` and 0.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_tile_mapping_update(
        &mut self,
        resource: ObjectKey,
        heap: Option<ObjectKey>,
        regions: &[TileRegion],
        range_flags: &[TileRangeFlag],
        heap_range_offsets: &[u32],
        range_tile_counts: &[u32],
        diagnostics: &mut Diagnostics,
    ) -> Result<()> {
        let tiled = self.require_mut(resource)?;
        let indices = tiled.tiles_of(regions)?;
        let counts: Vec<u32> = if range_tile_counts.is_empty() {
            vec![indices.len() as u32]
        } else {
            range_tile_counts.to_vec()
        };
        let total: usize = counts.iter().map(|&count| count as usize).sum();
        if total > indices.len() {
            return Err(tiled.out_of_range(format!(
                "{total} range tiles for {} region tiles",
                indices.len()
            )));
        }

        let mut cursor = indices.into_iter();
        for (range, &count) in counts.iter().enumerate() {
            let flag = range_flags.get(range).copied().unwrap_or(TileRangeFlag::None);
            let start = heap_range_offsets.get(range).copied().unwrap_or(0);
            if flag == TileRangeFlag::Skip {
                diagnostics.warn_once(Limitation::TileRangeSkip, format!("resource {resource}"));
            }
            for i in 0..count {
                let Some(index) = cursor.next() else { break };
                let tile = &mut tiled.tiles[index];
                match (flag, heap) {
                    (TileRangeFlag::Skip, _) => {}
                    (TileRangeFlag::Null, _) | (_, None) => {
                        tile.heap = None;
                        tile.heap_offset = 0;
                    }
                    (TileRangeFlag::None, Some(heap)) => {
                        tile.heap = Some(heap);
                        tile.heap_offset = start + i;
                    }
                    (TileRangeFlag::ReuseSingleTile, Some(heap)) => {
                        tile.heap = Some(heap);
                        tile.heap_offset = start;
                    }
                }
            }
        }
        tiled.update_id += 1;
        Ok(())
    }

    /// Mirrors `CopyTileMappings`.
    pub fn copy_tile_mappings(
        &mut self,
        dst: ObjectKey,
        dst_coordinate: TiledResourceCoordinate,
        src: ObjectKey,
        src_coordinate: TiledResourceCoordinate,
        size: TileRegionSize,
    ) -> Result<()> {
        let source = self.resources.get(&src).ok_or(SubcaptureError::NotTiled(src))?;
        let src_tiles: Vec<Tile> = source
            .region_tiles(&TileRegion {
                coordinate: src_coordinate,
                size: Some(size),
            })?
            .into_iter()
            .map(|index| source.tiles[index])
            .collect();

        let tiled = self.require_mut(dst)?;
        let dst_indices = tiled.region_tiles(&TileRegion {
            coordinate: dst_coordinate,
            size: Some(size),
        })?;
        for (index, src_tile) in dst_indices.into_iter().zip(src_tiles) {
            let tile = &mut tiled.tiles[index];
            tile.heap = src_tile.heap;
            tile.heap_offset = src_tile.heap_offset;
        }
        tiled.update_id += 1;
        Ok(())
    }

    /// Re-expresses the mapping table as `UpdateTileMappings` calls on `queue`: one call per
    /// heap, in heap key order, one single-tile region per mapped tile.
    pub fn synthesize_update_commands(tiled: &TiledResource, queue: ObjectKey) -> Vec<Command> {
        let mut by_heap: BTreeMap<ObjectKey, Vec<(usize, u32)>> = BTreeMap::new();
        for (index, tile) in tiled.tiles.iter().enumerate() {
            if let Some(heap) = tile.heap {
                by_heap.entry(heap).or_default().push((index, tile.heap_offset));
            }
        }

        by_heap
            .into_iter()
            .map(|(heap, tiles)| Command::UpdateTileMappings {
                queue,
                resource: tiled.key,
                heap: Some(heap),
                regions: tiles
                    .iter()
                    .map(|&(index, _)| TileRegion {
                        coordinate: tiled.coordinate_of(index),
                        size: Some(TileRegionSize::linear(1)),
                    })
                    .collect(),
                range_flags: vec![TileRangeFlag::None; tiles.len()],
                heap_range_offsets: tiles.iter().map(|&(_, offset)| offset).collect(),
                range_tile_counts: vec![1; tiles.len()],
            })
            .collect()
    }

    /// Emits the mapping table of every restored reserved resource. Mappings into heaps that are
    /// not restored are dropped.
    pub fn restore(
        &self,
        queue: ObjectKey,
        is_restored: impl Fn(ObjectKey) -> bool,
        stream: &mut RestoreStream<'_>,
    ) -> usize {
        let mut emitted = 0;
        for tiled in self.resources.values() {
            if !is_restored(tiled.key) {
                continue;
            }
            for command in Self::synthesize_update_commands(tiled, queue) {
                if let Command::UpdateTileMappings { heap: Some(heap), .. } = &command {
                    if !is_restored(*heap) {
                        debug!(
                            resource = %tiled.key,
                            %heap,
                            "dropping mappings into unrestored heap"
                        );
                        continue;
                    }
                }
                stream.emit(command);
                emitted += 1;
            }
        }
        info!(commands = emitted, "tile mappings restored");
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuDevice, HostMemoryGpu};
    use crate::model::Format;
    use pretty_assertions::assert_eq;

    const TEXTURE: ObjectKey = ObjectKey(1);
    const HEAP_A: ObjectKey = ObjectKey(2);
    const HEAP_B: ObjectKey = ObjectKey(3);

    /// 256x256 RGBA8, 2 slices, 4 mips: per slice 4 + 1 standard tiles and 1 packed tile.
    fn tracker() -> TiledResourceTracker {
        let desc = ResourceDesc::texture2d(256, 256, 2, 4, Format::R8G8B8A8_UNORM);
        let tiling = HostMemoryGpu::new().resource_tiling(&desc);
        let mut tracker = TiledResourceTracker::new();
        tracker.register(TEXTURE, &desc, tiling);
        tracker
    }

    fn mapped(tracker: &TiledResourceTracker) -> Vec<(usize, Option<ObjectKey>, u32)> {
        tracker
            .get(TEXTURE)
            .unwrap()
            .tiles
            .iter()
            .enumerate()
            .filter(|(_, tile)| tile.heap.is_some())
            .map(|(index, tile)| (index, tile.heap, tile.heap_offset))
            .collect()
    }

    #[test]
    fn box_regions_map_advancing_heap_offsets() {
        let mut tracker = tracker();
        let mut diagnostics = Diagnostics::new();
        tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_A),
                &[TileRegion {
                    coordinate: TiledResourceCoordinate::new(0, 0, 0, 0),
                    size: Some(TileRegionSize::boxed(2, 2, 1)),
                }],
                &[TileRangeFlag::None],
                &[10],
                &[4],
                &mut diagnostics,
            )
            .unwrap();

        assert_eq!(
            mapped(&tracker),
            vec![
                (0, Some(HEAP_A), 10),
                (1, Some(HEAP_A), 11),
                (2, Some(HEAP_A), 12),
                (3, Some(HEAP_A), 13)
            ]
        );
        assert_eq!(tracker.get(TEXTURE).unwrap().update_id, 1);
    }

    #[test]
    fn packed_mips_are_addressed_per_slice() {
        let mut tracker = tracker();
        let mut diagnostics = Diagnostics::new();
        // Subresource 6 = slice 1, mip 2: the packed tail of slice 1 (tile 11).
        tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_B),
                &[TileRegion {
                    coordinate: TiledResourceCoordinate::new(0, 0, 0, 6),
                    size: None,
                }],
                &[],
                &[7],
                &[],
                &mut diagnostics,
            )
            .unwrap();
        assert_eq!(mapped(&tracker), vec![(11, Some(HEAP_B), 7)]);

        let tiled = tracker.get(TEXTURE).unwrap();
        assert!(tiled.tiles[11].packed);
        assert_eq!(tiled.coordinate_of(11), TiledResourceCoordinate::new(0, 0, 0, 6));
    }

    #[test]
    fn range_flags_reuse_null_and_skip() {
        let mut tracker = tracker();
        let mut diagnostics = Diagnostics::new();
        let linear = |x, n| TileRegion {
            coordinate: TiledResourceCoordinate::new(x, 0, 0, 0),
            size: Some(TileRegionSize::linear(n)),
        };
        tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_A),
                &[linear(0, 4)],
                &[TileRangeFlag::None],
                &[0],
                &[4],
                &mut diagnostics,
            )
            .unwrap();
        tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_B),
                &[linear(0, 4)],
                &[
                    TileRangeFlag::ReuseSingleTile,
                    TileRangeFlag::Null,
                    TileRangeFlag::Skip,
                ],
                &[5, 0, 0],
                &[2, 1, 1],
                &mut diagnostics,
            )
            .unwrap();

        assert_eq!(
            mapped(&tracker),
            vec![(0, Some(HEAP_B), 5), (1, Some(HEAP_B), 5), (3, Some(HEAP_A), 3)]
        );
        assert_eq!(diagnostics.occurrences(Limitation::TileRangeSkip), 1);
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let mut tracker = tracker();
        let err = tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_A),
                &[TileRegion {
                    coordinate: TiledResourceCoordinate::new(2, 0, 0, 0),
                    size: None,
                }],
                &[],
                &[],
                &[],
                &mut Diagnostics::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SubcaptureError::TileOutOfRange { .. }));
    }

    #[test]
    fn synthesized_updates_are_grouped_by_heap_and_deterministic() {
        let mut tracker = tracker();
        let mut diagnostics = Diagnostics::new();
        let single = |x, y, subresource| TileRegion {
            coordinate: TiledResourceCoordinate::new(x, y, 0, subresource),
            size: None,
        };
        tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_B),
                &[single(1, 1, 0), single(0, 0, 4)],
                &[],
                &[20],
                &[2],
                &mut diagnostics,
            )
            .unwrap();
        tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_A),
                &[single(0, 0, 1)],
                &[],
                &[3],
                &[],
                &mut diagnostics,
            )
            .unwrap();

        let tiled = tracker.get(TEXTURE).unwrap();
        let first = TiledResourceTracker::synthesize_update_commands(tiled, ObjectKey(50));
        let second = TiledResourceTracker::synthesize_update_commands(tiled, ObjectKey(50));
        assert_eq!(first, second);

        let heaps: Vec<Option<ObjectKey>> = first
            .iter()
            .map(|command| match command {
                Command::UpdateTileMappings { heap, .. } => *heap,
                _ => None,
            })
            .collect();
        assert_eq!(heaps, vec![Some(HEAP_A), Some(HEAP_B)]);

        let Command::UpdateTileMappings {
            regions,
            heap_range_offsets,
            ..
        } = &first[1]
        else {
            panic!("expected a tile mapping update");
        };
        assert_eq!(
            regions
                .iter()
                .map(|region| region.coordinate)
                .collect::<Vec<_>>(),
            vec![
                TiledResourceCoordinate::new(1, 1, 0, 0),
                TiledResourceCoordinate::new(0, 0, 0, 4)
            ]
        );
        assert_eq!(heap_range_offsets, &vec![20, 21]);
    }

    #[test]
    fn copy_tile_mappings_copies_heap_bindings() {
        let mut tracker = tracker();
        let mut diagnostics = Diagnostics::new();
        tracker
            .apply_tile_mapping_update(
                TEXTURE,
                Some(HEAP_A),
                &[TileRegion {
                    coordinate: TiledResourceCoordinate::new(0, 0, 0, 0),
                    size: Some(TileRegionSize::linear(2)),
                }],
                &[],
                &[8],
                &[],
                &mut diagnostics,
            )
            .unwrap();
        tracker
            .copy_tile_mappings(
                TEXTURE,
                TiledResourceCoordinate::new(0, 0, 0, 4),
                TEXTURE,
                TiledResourceCoordinate::new(0, 0, 0, 0),
                TileRegionSize::linear(2),
            )
            .unwrap();

        assert_eq!(
            mapped(&tracker),
            vec![
                (0, Some(HEAP_A), 8),
                (1, Some(HEAP_A), 9),
                (6, Some(HEAP_A), 8),
                (7, Some(HEAP_A), 9)
            ]
        );
    }
}
