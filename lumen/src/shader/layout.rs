//! Owned shader parameter layout trees.
//!
//! The shading-language compiler reports parameter layouts through its own
//! reflection object graph. That graph is converted once, at load time, into
//! the owned tree defined here, so the rest of the crate never touches the
//! compiler's objects or lifetimes. A node carries its *relative* coordinates
//! in every coordinate space at once ([`ParameterOffsets`]); the layout
//! walker accumulates them while descending and keeps the spaces apart.

use ash::vk;

/// The shader stage a module was compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            Self::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            Self::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        }
    }
}

/// What a leaf parameter binds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
    CombinedImageSampler,
    Sampler,
    AccelerationStructure,
    PushConstant,
}

impl BindingKind {
    /// The native descriptor type, or `None` for push constants, which are
    /// not descriptors at all.
    pub fn descriptor_type(self) -> Option<vk::DescriptorType> {
        match self {
            Self::UniformBuffer => Some(vk::DescriptorType::UNIFORM_BUFFER),
            Self::StorageBuffer => Some(vk::DescriptorType::STORAGE_BUFFER),
            Self::SampledImage => Some(vk::DescriptorType::SAMPLED_IMAGE),
            Self::StorageImage => Some(vk::DescriptorType::STORAGE_IMAGE),
            Self::CombinedImageSampler => Some(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            Self::Sampler => Some(vk::DescriptorType::SAMPLER),
            Self::AccelerationStructure => Some(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            Self::PushConstant => None,
        }
    }
}

/// Relative coordinates of a variable within its parent, one per coordinate
/// space. The spaces are independent and must never be conflated:
///
/// - `uniform`: byte offset inside the enclosing uniform or push-constant
///   block,
/// - `slot`: descriptor binding index inside the enclosing set,
/// - `space`: descriptor set index contribution,
/// - `push_constant`: push-constant range index contribution,
/// - `sub_element`: register space used to place nested parameter blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParameterOffsets {
    pub uniform: u64,
    pub slot: u32,
    pub space: u32,
    pub push_constant: u32,
    pub sub_element: u32,
}

impl ParameterOffsets {
    pub fn uniform(offset: u64) -> Self {
        Self {
            uniform: offset,
            ..Self::default()
        }
    }

    pub fn slot(slot: u32) -> Self {
        Self {
            slot,
            ..Self::default()
        }
    }
}

/// One type in the layout tree.
#[derive(Clone, Debug)]
pub enum TypeLayout {
    /// A scalar, vector or matrix occupying `size` bytes of uniform data.
    Value { size: u64 },

    /// An aggregate; `uniform_size` is the struct's total uniform footprint
    /// including trailing padding, as reported by the compiler.
    Struct {
        fields: Vec<VariableLayout>,
        uniform_size: u64,
    },

    /// A uniform array. `element_count == 0` means unbounded.
    Array {
        element: Box<TypeLayout>,
        element_stride: u64,
        element_count: u64,
    },

    /// An explicit or implicit uniform block. When `push_constant` is set the
    /// block's contents live in the push-constant coordinate space instead of
    /// a descriptor-backed buffer.
    ConstantBuffer {
        element: Box<VariableLayout>,
        push_constant: bool,
    },

    /// A group of parameters owning a private descriptor set.
    ParameterBlock { element: Box<VariableLayout> },

    /// An opaque resource (texture, buffer, acceleration structure).
    /// `element_stride` is nonzero for structured buffers and carries the
    /// per-element byte stride.
    Resource {
        kind: BindingKind,
        element_stride: u64,
    },
}

impl TypeLayout {
    /// Bytes of uniform data this type contributes to the enclosing block.
    /// Resources, constant buffers and parameter blocks contribute none; the
    /// data they carry lives in their own coordinate space.
    pub fn uniform_size(&self) -> u64 {
        match self {
            Self::Value { size } => *size,
            Self::Struct { uniform_size, .. } => *uniform_size,
            Self::Array {
                element_stride,
                element_count,
                ..
            } => element_stride * element_count,
            Self::ConstantBuffer { .. } | Self::ParameterBlock { .. } | Self::Resource { .. } => 0,
        }
    }
}

/// A named variable plus its type and relative coordinates.
#[derive(Clone, Debug)]
pub struct VariableLayout {
    /// `None` for anonymous variables (e.g. the synthesized element of an
    /// implicit global uniform block).
    pub name: Option<String>,
    pub ty: TypeLayout,
    pub offsets: ParameterOffsets,
}

impl VariableLayout {
    pub fn new(name: impl Into<String>, ty: TypeLayout, offsets: ParameterOffsets) -> Self {
        Self {
            name: Some(name.into()),
            ty,
            offsets,
        }
    }

    pub fn anonymous(ty: TypeLayout, offsets: ParameterOffsets) -> Self {
        Self {
            name: None,
            ty,
            offsets,
        }
    }
}

/// Layout of a single entry point.
#[derive(Clone, Debug)]
pub struct EntryPointLayout {
    pub name: String,
    pub stage: ShaderStage,
    /// Root of the entry point's own parameters (uniform entry-point
    /// parameters, push-constant blocks declared on the entry point).
    pub parameters: VariableLayout,
    /// Local workgroup size; meaningful for compute stages only.
    pub workgroup_size: [u32; 3],
}

/// The complete reflected layout of one compiled shader program: the global
/// parameter scope plus one entry point.
#[derive(Clone, Debug)]
pub struct ProgramLayout {
    pub globals: VariableLayout,
    pub entry_point: EntryPointLayout,
}

impl ProgramLayout {
    /// An empty global scope, handy as a starting point for front ends and
    /// tests.
    pub fn empty_globals() -> VariableLayout {
        VariableLayout::anonymous(
            TypeLayout::Struct {
                fields: Vec::new(),
                uniform_size: 0,
            },
            ParameterOffsets::default(),
        )
    }
}
