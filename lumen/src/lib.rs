//! Lumen is a small rendering layer on top of raw Vulkan (via [`ash`]).
//!
//! The heart of the crate is its reflection-driven resource binding model: a
//! compiled shader's parameter layout is walked once at load time into a flat
//! name → [`Binding`] table, and every per-draw update goes through
//! [`ShaderModule::set_uniform`] and friends, which resolve a dotted
//! parameter path (`"light.position"`) to either a uniform-buffer write, a
//! push-constant write, or a descriptor-set write.
//!
//! A [`Pipeline`] composes one to three [`ShaderModule`]s, merges their
//! descriptor-set layout contributions (slot collisions across stages are
//! hard errors), concatenates their push-constant ranges in stage order and
//! creates the native pipeline objects. Each pipeline owns one descriptor set
//! per logical set per frame in flight; uniform data lives in one packed,
//! host-mapped buffer per shader module per frame.
//!
//! Shading-language compilation is deliberately out of scope: anything that
//! can produce SPIR-V plus a [`ProgramLayout`] tree can drive the crate by
//! implementing [`ShaderCompiler`].
//!
//! [`Binding`]: shader::Binding
//! [`ShaderModule`]: shader::ShaderModule
//! [`ShaderModule::set_uniform`]: shader::ShaderModule::set_uniform
//! [`Pipeline`]: pipeline::Pipeline
//! [`ProgramLayout`]: shader::layout::ProgramLayout
//! [`ShaderCompiler`]: shader::compiler::ShaderCompiler

pub mod buffer;
pub mod descriptor_set;
pub mod device;
pub mod pipeline;
pub mod resource;
pub mod shader;

use ash::vk;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Number of overlapping, independently resourced render frames.
///
/// Every shader module keeps one uniform buffer per frame and every pipeline
/// keeps one descriptor-set array per frame, so the host can write frame
/// `N + 1` while the GPU still consumes frame `N`. The caller must fence
/// frame `K`'s prior submission before touching frame `K`'s resources again.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound on logical descriptor set indices a shader may use.
///
/// Set indices must be contiguous from 0; a parameter block landing at or
/// above this bound is a reflection error.
pub const MAX_DESCRIPTOR_SETS: usize = 4;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two, which holds for every Vulkan
/// alignment limit this crate consumes.
#[inline]
pub(crate) const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Error type returned by native Vulkan calls.
///
/// These are resource-acquisition failures; there is no in-crate recovery
/// path for them, callers typically treat them as fatal at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VulkanError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    LayerNotPresent,
    ExtensionNotPresent,
    FeatureNotPresent,
    IncompatibleDriver,
    TooManyObjects,
    FragmentedPool,
    OutOfPoolMemory,
    InvalidOpaqueCaptureAddress,
    Unknown(i32),
}

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_LAYER_NOT_PRESENT => Self::LayerNotPresent,
            vk::Result::ERROR_EXTENSION_NOT_PRESENT => Self::ExtensionNotPresent,
            vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::FeatureNotPresent,
            vk::Result::ERROR_INCOMPATIBLE_DRIVER => Self::IncompatibleDriver,
            vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            vk::Result::ERROR_FRAGMENTED_POOL => Self::FragmentedPool,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY => Self::OutOfPoolMemory,
            vk::Result::ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS => {
                Self::InvalidOpaqueCaptureAddress
            }
            other => Self::Unknown(other.as_raw()),
        }
    }
}

impl Error for VulkanError {}

impl Display for VulkanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::InitializationFailed => write!(f, "initialization failed"),
            Self::DeviceLost => write!(f, "the logical device was lost"),
            Self::LayerNotPresent => write!(f, "a requested layer is not present"),
            Self::ExtensionNotPresent => write!(f, "a requested extension is not present"),
            Self::FeatureNotPresent => write!(f, "a requested feature is not present"),
            Self::IncompatibleDriver => write!(f, "the driver is incompatible"),
            Self::TooManyObjects => write!(f, "too many objects of this type were created"),
            Self::FragmentedPool => write!(f, "the descriptor pool is fragmented"),
            Self::OutOfPoolMemory => write!(f, "the descriptor pool is out of memory"),
            Self::InvalidOpaqueCaptureAddress => {
                write!(f, "an opaque capture address was invalid")
            }
            Self::Unknown(raw) => write!(f, "unknown Vulkan error (code {})", raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(28, 256), 256);
    }
}
