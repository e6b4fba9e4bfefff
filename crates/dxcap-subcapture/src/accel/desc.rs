//! Build and copy descriptions of raytracing acceleration structures, as captured from the
//! application's calls.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::model::{Format, KeyOffset};

/// Size of one `D3D12_RAYTRACING_INSTANCE_DESC`.
pub const INSTANCE_DESC_SIZE: u64 = 64;
/// Size of a 3x4 row-major float transform.
pub const TRANSFORM_SIZE: u64 = 48;

/// A GPU virtual address argument together with the resource it was resolved to, if the
/// interception layer could resolve it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpuAddressArg {
    pub address: u64,
    pub target: Option<KeyOffset>,
}

impl GpuAddressArg {
    pub const NULL: Self = Self {
        address: 0,
        target: None,
    };

    pub fn new(address: u64) -> Self {
        Self {
            address,
            target: None,
        }
    }

    pub fn resolved(address: u64, target: KeyOffset) -> Self {
        Self {
            address,
            target: Some(target),
        }
    }

    /// Address inside a resource synthesized at restore time; the replayer fills in the real
    /// address from the key.
    pub fn restore_target(target: KeyOffset) -> Self {
        Self {
            address: 0,
            target: Some(target),
        }
    }

    pub fn is_null(&self) -> bool {
        self.address == 0 && self.target.is_none()
    }
}

bitflags! {
    /// `D3D12_RAYTRACING_ACCELERATION_STRUCTURE_BUILD_FLAGS`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 0x1;
        const ALLOW_COMPACTION = 0x2;
        const PREFER_FAST_TRACE = 0x4;
        const PREFER_FAST_BUILD = 0x8;
        const MINIMIZE_MEMORY = 0x10;
        const PERFORM_UPDATE = 0x20;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccelerationStructureLevel {
    TopLevel,
    BottomLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementsLayout {
    Array,
    ArrayOfPointers,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrianglesDesc {
    pub transform: GpuAddressArg,
    pub index_format: Format,
    pub vertex_format: Format,
    pub index_count: u32,
    pub vertex_count: u32,
    pub index_buffer: GpuAddressArg,
    pub vertex_buffer: GpuAddressArg,
    pub vertex_stride: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AabbsDesc {
    pub aabb_count: u64,
    pub aabbs: GpuAddressArg,
    pub stride: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryDesc {
    Triangles { flags: u32, triangles: TrianglesDesc },
    ProceduralAabbs { flags: u32, aabbs: AabbsDesc },
}

/// `D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_INPUTS`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInputs {
    pub level: AccelerationStructureLevel,
    pub flags: BuildFlags,
    pub num_descs: u32,
    pub layout: ElementsLayout,
    /// Instance descriptors of a top-level build.
    pub instance_descs: GpuAddressArg,
    /// Geometry of a bottom-level build.
    pub geometries: Vec<GeometryDesc>,
}

/// A GPU memory range read by a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRange {
    pub address: GpuAddressArg,
    pub size: u64,
}

/// Input buffers the driver cannot be asked about and that therefore cannot be captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UncapturableInputs {
    InstancePointers,
}

fn index_size(format: Format) -> u64 {
    match format {
        Format::R16_UINT => 2,
        Format::R32_UINT => 4,
        _ => 0,
    }
}

impl BuildInputs {
    pub fn top_level(num_instances: u32, instance_descs: GpuAddressArg) -> Self {
        Self {
            level: AccelerationStructureLevel::TopLevel,
            flags: BuildFlags::empty(),
            num_descs: num_instances,
            layout: ElementsLayout::Array,
            instance_descs,
            geometries: Vec::new(),
        }
    }

    pub fn bottom_level(geometries: Vec<GeometryDesc>) -> Self {
        Self {
            level: AccelerationStructureLevel::BottomLevel,
            flags: BuildFlags::empty(),
            num_descs: geometries.len() as u32,
            layout: ElementsLayout::Array,
            instance_descs: GpuAddressArg::NULL,
            geometries,
        }
    }

    pub fn with_flags(mut self, flags: BuildFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_update(&self) -> bool {
        self.flags.contains(BuildFlags::PERFORM_UPDATE)
    }

    /// Every GPU memory range the build reads, excluding the source structure.
    pub fn input_ranges(&self) -> Result<Vec<InputRange>, UncapturableInputs> {
        let mut ranges = Vec::new();
        let mut push = |address: GpuAddressArg, size: u64| {
            if !address.is_null() && size != 0 {
                ranges.push(InputRange { address, size });
            }
        };

        match self.level {
            AccelerationStructureLevel::TopLevel => {
                if self.layout == ElementsLayout::ArrayOfPointers {
                    return Err(UncapturableInputs::InstancePointers);
                }
                push(
                    self.instance_descs,
                    u64::from(self.num_descs) * INSTANCE_DESC_SIZE,
                );
            }
            AccelerationStructureLevel::BottomLevel => {
                for geometry in &self.geometries {
                    match geometry {
                        GeometryDesc::Triangles { triangles, .. } => {
                            push(
                                triangles.vertex_buffer,
                                u64::from(triangles.vertex_count) * triangles.vertex_stride,
                            );
                            push(
                                triangles.index_buffer,
                                u64::from(triangles.index_count)
                                    * index_size(triangles.index_format),
                            );
                            push(triangles.transform, TRANSFORM_SIZE);
                        }
                        GeometryDesc::ProceduralAabbs { aabbs, .. } => {
                            push(aabbs.aabbs, aabbs.aabb_count * aabbs.stride);
                        }
                    }
                }
            }
        }
        Ok(ranges)
    }

    /// Number of primitives (triangles, boxes or instances) the build consumes.
    pub fn primitive_count(&self) -> u64 {
        match self.level {
            AccelerationStructureLevel::TopLevel => u64::from(self.num_descs),
            AccelerationStructureLevel::BottomLevel => self
                .geometries
                .iter()
                .map(|geometry| match geometry {
                    GeometryDesc::Triangles { triangles, .. } => {
                        let vertices = if triangles.index_count > 0 {
                            triangles.index_count
                        } else {
                            triangles.vertex_count
                        };
                        u64::from(vertices / 3)
                    }
                    GeometryDesc::ProceduralAabbs { aabbs, .. } => aabbs.aabb_count,
                })
                .sum(),
        }
    }
}

/// `D3D12_BUILD_RAYTRACING_ACCELERATION_STRUCTURE_DESC`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDesc {
    pub dest: GpuAddressArg,
    pub inputs: BuildInputs,
    /// Non-null for updates.
    pub source: GpuAddressArg,
    pub scratch: GpuAddressArg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyMode {
    Clone,
    Compact,
    VisualizationDecodeForTools,
    Serialize,
    DeserializeDriverCompatible,
}

impl CopyMode {
    /// Modes whose result is a valid acceleration structure at the destination.
    pub fn produces_structure(self) -> bool {
        matches!(self, CopyMode::Clone | CopyMode::Compact)
    }
}

/// Inputs of an opacity micromap array build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmmInputs {
    pub flags: u32,
    pub num_omm_descs: u32,
    pub input_buffer: GpuAddressArg,
    pub input_buffer_size: u64,
    pub per_omm_descs: GpuAddressArg,
    pub per_omm_descs_stride: u64,
}

impl OmmInputs {
    pub fn input_ranges(&self) -> Vec<InputRange> {
        [
            InputRange {
                address: self.input_buffer,
                size: self.input_buffer_size,
            },
            InputRange {
                address: self.per_omm_descs,
                size: u64::from(self.num_omm_descs) * self.per_omm_descs_stride,
            },
        ]
        .into_iter()
        .filter(|range| !range.address.is_null() && range.size != 0)
        .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmmArrayDesc {
    pub dest: GpuAddressArg,
    pub inputs: OmmInputs,
    pub scratch: GpuAddressArg,
}
