//! Resource descriptions and the per-resource record kept by the registry.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::KeyOffset;

bitflags! {
    /// GPU usage state of a resource or subresource (`D3D12_RESOURCE_STATES`).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ResourceStates: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const RAYTRACING_ACCELERATION_STRUCTURE = 0x40_0000;
        const SHADING_RATE_SOURCE = 0x100_0000;
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceStates {
    pub const COMMON: Self = Self::empty();
    pub const PRESENT: Self = Self::empty();
}

bitflags! {
    /// `D3D12_RESOURCE_FLAGS`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
        const DENY_SHADER_RESOURCE = 0x8;
        const ALLOW_CROSS_ADAPTER = 0x10;
        const ALLOW_SIMULTANEOUS_ACCESS = 0x20;
        const VIDEO_DECODE_REFERENCE_ONLY = 0x40;
        const RAYTRACING_ACCELERATION_STRUCTURE = 0x100;
    }
}

bitflags! {
    /// `D3D12_HEAP_FLAGS` subset relevant to restore.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HeapFlags: u32 {
        const SHARED = 0x1;
        const DENY_BUFFERS = 0x4;
        const ALLOW_DISPLAY = 0x8;
        const SHARED_CROSS_ADAPTER = 0x20;
        const DENY_RT_DS_TEXTURES = 0x40;
        const DENY_NON_RT_DS_TEXTURES = 0x80;
        const HARDWARE_PROTECTED = 0x100;
        const ALLOW_WRITE_WATCH = 0x200;
        const CREATE_NOT_RESIDENT = 0x800;
        const CREATE_NOT_ZEROED = 0x1000;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapType {
    Default,
    Upload,
    Readback,
    /// Custom heap; `cpu_visible` reflects its CPU page property.
    Custom { cpu_visible: bool },
    GpuUpload,
}

impl HeapType {
    /// Whether resources on this heap can be mapped for CPU access.
    pub fn is_cpu_visible(self) -> bool {
        match self {
            HeapType::Default => false,
            HeapType::Upload | HeapType::Readback | HeapType::GpuUpload => true,
            HeapType::Custom { cpu_visible } => cpu_visible,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceDimension {
    Buffer,
    Texture1d,
    Texture2d,
    Texture3d,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureLayout {
    Unknown,
    RowMajor,
    UndefinedSwizzle64Kb,
    StandardSwizzle64Kb,
}

/// DXGI format code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Format(pub u32);

impl Format {
    pub const UNKNOWN: Self = Self(0);
    pub const R32G32B32A32_FLOAT: Self = Self(2);
    pub const R32G32B32_FLOAT: Self = Self(6);
    pub const R16G16B16A16_FLOAT: Self = Self(10);
    pub const R32G32_FLOAT: Self = Self(16);
    pub const R8G8B8A8_UNORM: Self = Self(28);
    pub const R16G16_FLOAT: Self = Self(34);
    pub const D32_FLOAT: Self = Self(40);
    pub const R32_FLOAT: Self = Self(41);
    pub const R32_UINT: Self = Self(42);
    pub const D24_UNORM_S8_UINT: Self = Self(45);
    pub const R16_UINT: Self = Self(57);
    pub const R8_UNORM: Self = Self(61);
    pub const B8G8R8A8_UNORM: Self = Self(87);

    /// Size of one element in bytes, for the uncompressed formats the engine lays out itself.
    pub fn bytes_per_element(self) -> Option<u32> {
        let size = match self {
            Self::R32G32B32A32_FLOAT => 16,
            Self::R32G32B32_FLOAT => 12,
            Self::R16G16B16A16_FLOAT | Self::R32G32_FLOAT => 8,
            Self::R8G8B8A8_UNORM
            | Self::B8G8R8A8_UNORM
            | Self::R16G16_FLOAT
            | Self::D32_FLOAT
            | Self::R32_FLOAT
            | Self::R32_UINT
            | Self::D24_UNORM_S8_UINT => 4,
            Self::R16_UINT => 2,
            Self::R8_UNORM => 1,
            _ => return None,
        };
        Some(size)
    }
}

/// `D3D12_RESOURCE_DESC`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub alignment: u64,
    pub width: u64,
    pub height: u32,
    pub depth_or_array_size: u16,
    pub mip_levels: u16,
    pub format: Format,
    pub sample_count: u32,
    pub layout: TextureLayout,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            alignment: 0,
            width: size,
            height: 1,
            depth_or_array_size: 1,
            mip_levels: 1,
            format: Format::UNKNOWN,
            sample_count: 1,
            layout: TextureLayout::RowMajor,
            flags: ResourceFlags::empty(),
        }
    }

    pub fn texture2d(
        width: u64,
        height: u32,
        array_size: u16,
        mip_levels: u16,
        format: Format,
    ) -> Self {
        Self {
            dimension: ResourceDimension::Texture2d,
            alignment: 0,
            width,
            height,
            depth_or_array_size: array_size,
            mip_levels,
            format,
            sample_count: 1,
            layout: TextureLayout::Unknown,
            flags: ResourceFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    pub fn mip_levels(&self) -> u32 {
        u32::from(self.mip_levels.max(1))
    }

    /// Number of array slices (a 3D texture has one; its depth is per-mip).
    pub fn array_size(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer | ResourceDimension::Texture3d => 1,
            _ => u32::from(self.depth_or_array_size.max(1)),
        }
    }

    pub fn subresource_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer => 1,
            _ => self.mip_levels() * self.array_size(),
        }
    }
}

/// Everything the engine knows about a resource besides the generic object fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub desc: ResourceDesc,
    pub heap_type: HeapType,
    pub heap_flags: HeapFlags,
    /// GPU virtual address of the first byte; zero for textures.
    pub gpu_va: u64,
    pub initial_state: ResourceStates,
    pub cpu_mappable: bool,
    /// Upload-heap resources live in `GENERIC_READ` for their whole lifetime.
    pub generic_read: bool,
    pub reserved: bool,
    pub back_buffer: bool,
    /// Heap and offset of a placed resource.
    pub placement: Option<KeyOffset>,
}

impl ResourceRecord {
    pub fn new(desc: ResourceDesc, heap_type: HeapType, initial_state: ResourceStates) -> Self {
        Self {
            desc,
            heap_type,
            heap_flags: HeapFlags::empty(),
            gpu_va: 0,
            initial_state,
            cpu_mappable: heap_type.is_cpu_visible(),
            generic_read: heap_type == HeapType::Upload,
            reserved: false,
            back_buffer: false,
            placement: None,
        }
    }

    pub fn with_gpu_va(mut self, gpu_va: u64) -> Self {
        self.gpu_va = gpu_va;
        self
    }

    /// Resources holding acceleration structures are created in and never leave
    /// `RAYTRACING_ACCELERATION_STRUCTURE`.
    pub fn is_acceleration_structure_storage(&self) -> bool {
        self.initial_state
            .contains(ResourceStates::RAYTRACING_ACCELERATION_STRUCTURE)
            || self
                .desc
                .flags
                .contains(ResourceFlags::RAYTRACING_ACCELERATION_STRUCTURE)
    }

    /// Size of the GPU address range covered by the resource.
    pub fn address_range_size(&self) -> u64 {
        if self.desc.is_buffer() {
            self.desc.width
        } else {
            0
        }
    }

    pub fn created_not_resident(&self) -> bool {
        self.heap_flags.contains(HeapFlags::CREATE_NOT_RESIDENT)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapRecord {
    pub size: u64,
    pub heap_type: HeapType,
    pub flags: HeapFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subresource_count_follows_dimension() {
        assert_eq!(ResourceDesc::buffer(64).subresource_count(), 1);
        assert_eq!(
            ResourceDesc::texture2d(256, 256, 6, 4, Format::R8G8B8A8_UNORM).subresource_count(),
            24
        );

        let mut volume = ResourceDesc::texture2d(64, 64, 32, 3, Format::R8G8B8A8_UNORM);
        volume.dimension = ResourceDimension::Texture3d;
        assert_eq!(volume.subresource_count(), 3);
    }

    #[test]
    fn upload_heap_resources_are_generic_read_and_mappable() {
        let upload = ResourceRecord::new(
            ResourceDesc::buffer(16),
            HeapType::Upload,
            ResourceStates::GENERIC_READ,
        );
        assert!(upload.cpu_mappable);
        assert!(upload.generic_read);

        let readback = ResourceRecord::new(
            ResourceDesc::buffer(16),
            HeapType::Readback,
            ResourceStates::COPY_DEST,
        );
        assert!(readback.cpu_mappable);
        assert!(!readback.generic_read);
    }
}
