//! Views over externally-owned resources, in the shape descriptor writes
//! want them.
//!
//! The binding engine never creates images or acceleration structures; it
//! only needs their handles at `set_*` time. These carriers keep the call
//! sites free of raw Vulkan structs.

use ash::vk;

/// An image view ready to be bound, with the layout it will be in when the
/// shader reads or writes it.
#[derive(Clone, Copy, Debug)]
pub struct ImageView {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    /// Sampler for combined-image-sampler bindings; ignored for sampled and
    /// storage images.
    pub sampler: vk::Sampler,
}

impl ImageView {
    pub fn sampled(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self {
            view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampler,
        }
    }

    pub fn storage(view: vk::ImageView) -> Self {
        Self {
            view,
            layout: vk::ImageLayout::GENERAL,
            sampler: vk::Sampler::null(),
        }
    }

    pub(crate) fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: self.layout,
        }
    }
}

/// A top-level acceleration structure handle for ray-tracing bindings.
#[derive(Clone, Copy, Debug)]
pub struct AccelerationStructureRef {
    pub handle: vk::AccelerationStructureKHR,
}

impl AccelerationStructureRef {
    pub fn new(handle: vk::AccelerationStructureKHR) -> Self {
        Self { handle }
    }
}
