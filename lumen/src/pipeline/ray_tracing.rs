//! Shader binding table construction for ray-tracing pipelines.
//!
//! Group handles are laid out in declaration order: one raygen group, then
//! the miss groups, the hit groups and the callable groups. Each region
//! starts at a `shader_group_base_alignment` boundary and strides by the
//! aligned handle size; the raygen region is required to have stride equal
//! to its size.

use crate::{
    align_up,
    buffer::{Buffer, BufferCreationError},
    device::{Device, DeviceProperties},
    VulkanError,
};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};

/// Number of shader groups of each kind in a ray-tracing pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct GroupCounts {
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
}

impl GroupCounts {
    pub(crate) fn total(&self) -> u32 {
        1 + self.miss + self.hit + self.callable
    }
}

/// Byte layout of one shader binding table, before any buffer exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SbtLayout {
    pub handle_size: u64,
    /// Handle size rounded up to the handle alignment: the stride within
    /// the miss, hit and callable regions.
    pub stride: u64,
    pub raygen_offset: u64,
    pub raygen_size: u64,
    pub miss_offset: u64,
    pub miss_size: u64,
    pub hit_offset: u64,
    pub hit_size: u64,
    pub callable_offset: u64,
    pub callable_size: u64,
    pub total_size: u64,
}

impl SbtLayout {
    pub(crate) fn new(properties: &DeviceProperties, counts: GroupCounts) -> Self {
        let handle_size = properties.shader_group_handle_size as u64;
        let stride = align_up(handle_size, properties.shader_group_handle_alignment as u64);
        let base = properties.shader_group_base_alignment as u64;

        // The raygen region's stride must equal its size, so it occupies a
        // full base-aligned slot of its own.
        let raygen_size = align_up(stride, base);
        let miss_offset = raygen_size;
        let miss_size = align_up(counts.miss as u64 * stride, base);
        let hit_offset = miss_offset + miss_size;
        let hit_size = align_up(counts.hit as u64 * stride, base);
        let callable_offset = hit_offset + hit_size;
        let callable_size = align_up(counts.callable as u64 * stride, base);

        Self {
            handle_size,
            stride,
            raygen_offset: 0,
            raygen_size,
            miss_offset,
            miss_size,
            hit_offset,
            hit_size,
            callable_offset,
            callable_size,
            total_size: callable_offset + callable_size,
        }
    }

    /// Byte offset of each group's handle within the table, in declaration
    /// order.
    fn handle_offsets(&self, counts: GroupCounts) -> Vec<u64> {
        let mut offsets = vec![self.raygen_offset];
        let region = |base: u64, count: u32| (0..count as u64).map(move |i| base + i * self.stride);
        offsets.extend(region(self.miss_offset, counts.miss));
        offsets.extend(region(self.hit_offset, counts.hit));
        offsets.extend(region(self.callable_offset, counts.callable));
        offsets
    }
}

/// Error raised while building a [`ShaderBindingTable`].
#[derive(Debug)]
pub enum SbtError {
    /// A Vulkan call failed.
    VulkanError(VulkanError),
    /// The backing buffer could not be created.
    BufferError(BufferCreationError),
}

impl Error for SbtError {}

impl Display for SbtError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::VulkanError(err) => write!(f, "Vulkan call failed: {}", err),
            Self::BufferError(err) => write!(f, "SBT buffer creation failed: {}", err),
        }
    }
}

impl From<vk::Result> for SbtError {
    fn from(err: vk::Result) -> Self {
        Self::VulkanError(err.into())
    }
}

impl From<BufferCreationError> for SbtError {
    fn from(err: BufferCreationError) -> Self {
        Self::BufferError(err)
    }
}

/// The device buffer holding the group handles, plus the four regions
/// `vkCmdTraceRaysKHR` consumes.
pub struct ShaderBindingTable {
    _buffer: Buffer,
    raygen: vk::StridedDeviceAddressRegionKHR,
    miss: vk::StridedDeviceAddressRegionKHR,
    hit: vk::StridedDeviceAddressRegionKHR,
    callable: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Fetches the pipeline's group handles and scatters them into a fresh
    /// host-visible table buffer.
    pub(crate) fn new(
        device: Arc<Device>,
        ray_tracing_fns: &ash::khr::ray_tracing_pipeline::Device,
        pipeline: vk::Pipeline,
        counts: GroupCounts,
    ) -> Result<Self, SbtError> {
        let layout = SbtLayout::new(device.properties(), counts);
        let group_count = counts.total();
        let handles = unsafe {
            ray_tracing_fns.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                group_count as usize * layout.handle_size as usize,
            )
        }?;

        let mut buffer = Buffer::new(
            device,
            "shader binding table",
            layout.total_size,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        )?;

        let handle_size = layout.handle_size as usize;
        for (group, offset) in layout.handle_offsets(counts).into_iter().enumerate() {
            let handle = &handles[group * handle_size..(group + 1) * handle_size];
            buffer.fill(handle, offset);
        }

        let base = buffer.device_address();
        let region = |offset: u64, size: u64, stride: u64| vk::StridedDeviceAddressRegionKHR {
            device_address: if size == 0 { 0 } else { base + offset },
            stride,
            size,
        };

        Ok(Self {
            raygen: region(layout.raygen_offset, layout.raygen_size, layout.raygen_size),
            miss: region(layout.miss_offset, layout.miss_size, layout.stride),
            hit: region(layout.hit_offset, layout.hit_size, layout.stride),
            callable: region(layout.callable_offset, layout.callable_size, layout.stride),
            _buffer: buffer,
        })
    }

    pub fn raygen_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.raygen
    }

    pub fn miss_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.miss
    }

    pub fn hit_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.hit
    }

    pub fn callable_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.callable
    }
}

impl std::fmt::Debug for ShaderBindingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("ShaderBindingTable")
            .field("raygen_size", &self.raygen.size)
            .field("miss_size", &self.miss.size)
            .field("hit_size", &self.hit.size)
            .field("callable_size", &self.callable.size)
            .finish()
    }
}
