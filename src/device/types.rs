//! Public descriptor types of the rendering device and their Vulkan
//! mappings.

use ash::vk;
use bitflags::bitflags;

/// Defines a `(index, generation)` handle type addressing one slot of a
/// typed allocator. A handle is stale once the slot's generation moved past
/// the handle's; stale handles are rejected by every device operation.
#[macro_export]
macro_rules! define_handle_type {
    ($visibility:vis, $name:ident) => {
        #[derive(Copy, Clone, PartialEq, Eq, Hash)]
        $visibility struct $name {
            index: usize,
            generation: u64,
        }

        impl $name {
            pub(crate) fn new(index: usize, generation: u64) -> Self {
                Self {
                    index,
                    generation,
                }
            }

            /// Slot index. Only meaningful for diagnostics, never an offset
            /// into caller visible memory.
            pub fn index(&self) -> usize {
                self.index
            }

            pub fn generation(&self) -> u64 {
                self.generation
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_fmt(format_args!(
                    concat!(stringify!($name), "({}:{})"),
                    self.index, self.generation
                ))
            }
        }
    }
}

define_handle_type!(pub, BufferHandle);
define_handle_type!(pub, ImageHandle);
define_handle_type!(pub, SamplerHandle);
define_handle_type!(pub, ShaderModuleHandle);

// Handles are passed around constantly, keep them register sized.
static_assertions::const_assert_eq!(std::mem::size_of::<BufferHandle>(), 16);

/// Pipeline stage a shader module is built for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Geometry,
    TessellationControl,
    TessellationEvaluation,
}

impl ShaderStage {
    pub const COUNT: usize = 6;

    /// All stages in a stable order. The index of a stage in this array is
    /// also its slot in per stage tables.
    pub const ALL: [ShaderStage; Self::COUNT] = [
        ShaderStage::Vertex,
        ShaderStage::Fragment,
        ShaderStage::Compute,
        ShaderStage::Geometry,
        ShaderStage::TessellationControl,
        ShaderStage::TessellationEvaluation,
    ];

    pub fn table_index(self) -> usize {
        self as usize
    }

    pub(crate) fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        }
    }
}

/// Which side of the bus primarily accesses an allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Visibility {
    Host,
    Device,
}

bitflags! {
    /// Buffer usage, mapped 1:1 onto Vulkan usage bits.
    pub struct BufferUsage: u32 {
        const TRANSFER_SOURCE = 1 << 0;
        const TRANSFER_DESTINATION = 1 << 1;
        const READ_ONLY_TEXEL = 1 << 2;
        const READ_WRITE_TEXEL = 1 << 3;
        const READ_ONLY = 1 << 4;
        const READ_WRITE = 1 << 5;
        const INDEX = 1 << 6;
        const VERTEX = 1 << 7;
        const INDIRECT = 1 << 8;
    }
}

impl BufferUsage {
    pub(crate) fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();

        if self.contains(BufferUsage::TRANSFER_SOURCE) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(BufferUsage::TRANSFER_DESTINATION) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.contains(BufferUsage::READ_ONLY_TEXEL) {
            flags |= vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER;
        }
        if self.contains(BufferUsage::READ_WRITE_TEXEL) {
            flags |= vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        }
        if self.contains(BufferUsage::READ_ONLY) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(BufferUsage::READ_WRITE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(BufferUsage::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(BufferUsage::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(BufferUsage::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }

        flags
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
    pub visibility: Visibility,
}

bitflags! {
    /// Image usage, mapped 1:1 onto Vulkan usage bits.
    pub struct ImageUsage: u32 {
        const TRANSFER_SOURCE = 1 << 0;
        const TRANSFER_DESTINATION = 1 << 1;
        const SAMPLED = 1 << 2;
        const COLOR_ATTACHMENT = 1 << 3;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 4;
    }
}

impl ImageUsage {
    pub(crate) fn to_vk(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();

        if self.contains(ImageUsage::TRANSFER_SOURCE) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(ImageUsage::TRANSFER_DESTINATION) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if self.contains(ImageUsage::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(ImageUsage::COLOR_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }

        flags
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Undefined,
    Rgba8Unorm,
    Rgba8Snorm,
    Rgba8Srgb,
    Rg32Sfloat,
    Rgb32Sfloat,
    Rgba32Uint,
    D32Sfloat,
    D24UnormS8Uint,
    D32SfloatS8Uint,
}

impl Format {
    pub(crate) fn to_vk(self) -> vk::Format {
        match self {
            Format::Undefined => vk::Format::UNDEFINED,
            Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::Rgba8Snorm => vk::Format::R8G8B8A8_SNORM,
            Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            Format::Rg32Sfloat => vk::Format::R32G32_SFLOAT,
            Format::Rgb32Sfloat => vk::Format::R32G32B32_SFLOAT,
            Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
            Format::D32Sfloat => vk::Format::D32_SFLOAT,
            Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            Format::D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageSamples {
    S1,
    S2,
    S4,
    S8,
    S16,
    S32,
    S64,
}

impl ImageSamples {
    pub(crate) fn to_vk(self) -> vk::SampleCountFlags {
        match self {
            ImageSamples::S1 => vk::SampleCountFlags::TYPE_1,
            ImageSamples::S2 => vk::SampleCountFlags::TYPE_2,
            ImageSamples::S4 => vk::SampleCountFlags::TYPE_4,
            ImageSamples::S8 => vk::SampleCountFlags::TYPE_8,
            ImageSamples::S16 => vk::SampleCountFlags::TYPE_16,
            ImageSamples::S32 => vk::SampleCountFlags::TYPE_32,
            ImageSamples::S64 => vk::SampleCountFlags::TYPE_64,
        }
    }
}

/// Shape of an image. Images are two dimensional, a cube image additionally
/// sets the cube compatible flag and gets a cube view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageType {
    Plane,
    Cube,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageExtent {
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub image_type: ImageType,
    pub format: Format,
    pub extent: ImageExtent,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: ImageSamples,
    pub usage: ImageUsage,
    pub visibility: Visibility,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerFilter {
    Nearest,
    Linear,
    Cubic,
}

impl SamplerFilter {
    pub(crate) fn to_vk(self) -> vk::Filter {
        match self {
            SamplerFilter::Nearest => vk::Filter::NEAREST,
            SamplerFilter::Linear => vk::Filter::LINEAR,
            SamplerFilter::Cubic => vk::Filter::CUBIC_EXT,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerMipmapMode {
    Nearest,
    Linear,
}

impl SamplerMipmapMode {
    pub(crate) fn to_vk(self) -> vk::SamplerMipmapMode {
        match self {
            SamplerMipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
            SamplerMipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
    MirrorClampToEdge,
}

impl SamplerAddressMode {
    pub(crate) fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            SamplerAddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            SamplerAddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            SamplerAddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
            SamplerAddressMode::MirrorClampToEdge => vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOperation {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOperation {
    pub(crate) fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareOperation::Never => vk::CompareOp::NEVER,
            CompareOperation::Less => vk::CompareOp::LESS,
            CompareOperation::Equal => vk::CompareOp::EQUAL,
            CompareOperation::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareOperation::Greater => vk::CompareOp::GREATER,
            CompareOperation::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareOperation::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareOperation::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BorderColor {
    FloatTransparentBlack,
    FloatOpaqueBlack,
    FloatOpaqueWhite,
    IntOpaqueBlack,
}

impl BorderColor {
    pub(crate) fn to_vk(self) -> vk::BorderColor {
        match self {
            BorderColor::FloatTransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            BorderColor::FloatOpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
            BorderColor::FloatOpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
            BorderColor::IntOpaqueBlack => vk::BorderColor::INT_OPAQUE_BLACK,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SamplerDescriptor {
    pub magnification_filter: SamplerFilter,
    pub minification_filter: SamplerFilter,
    pub mipmap_mode: SamplerMipmapMode,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub anisotropy_enabled: bool,
    pub max_anisotropy: f32,
    pub compare_enabled: bool,
    pub compare_operation: CompareOperation,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: BorderColor,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            magnification_filter: SamplerFilter::Linear,
            minification_filter: SamplerFilter::Linear,
            mipmap_mode: SamplerMipmapMode::Linear,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            mip_lod_bias: 0.0,
            anisotropy_enabled: false,
            max_anisotropy: 1.0,
            compare_enabled: false,
            compare_operation: CompareOperation::Never,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: BorderColor::FloatOpaqueBlack,
        }
    }
}

/// Shader module creation request.
///
/// The cache key is `(stage, hash)` where `hash` is the content hash of the
/// SPIR-V, not its identity: loading the same module through two different
/// paths still yields one device object.
#[derive(Clone, Debug)]
pub struct ShaderModuleDescriptor {
    pub stage: ShaderStage,
    pub spirv: Vec<u32>,
    pub hash: u64,
}
