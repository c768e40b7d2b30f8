//! Host-visible and device-local buffers backed by [`gpu_allocator`].

use crate::{device::Device, VulkanError};
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use log::warn;
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};

/// Error returned when creating a [`Buffer`].
#[derive(Debug)]
pub enum BufferCreationError {
    /// The requested size was zero.
    ZeroSize,
    /// A Vulkan call failed.
    VulkanError(VulkanError),
    /// The allocator could not satisfy the request.
    AllocationFailed(String),
}

impl Error for BufferCreationError {}

impl Display for BufferCreationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::ZeroSize => write!(f, "buffers cannot be zero-sized"),
            Self::VulkanError(err) => write!(f, "Vulkan call failed: {}", err),
            Self::AllocationFailed(err) => write!(f, "allocation failed: {}", err),
        }
    }
}

impl From<vk::Result> for BufferCreationError {
    fn from(err: vk::Result) -> Self {
        Self::VulkanError(err.into())
    }
}

/// A buffer plus the allocation that backs it. The allocation is freed and
/// the handle destroyed on drop.
pub struct Buffer {
    device: Arc<Device>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

impl Buffer {
    /// Creates a buffer of `size` bytes in `location` memory.
    pub fn new(
        device: Arc<Device>,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self, BufferCreationError> {
        if size == 0 {
            return Err(BufferCreationError::ZeroSize);
        }

        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { device.handle().create_buffer(&info, None) }?;
        let requirements =
            unsafe { device.handle().get_buffer_memory_requirements(handle) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|err| {
                unsafe { device.handle().destroy_buffer(handle, None) };
                BufferCreationError::AllocationFailed(err.to_string())
            })?;

        unsafe {
            device.handle().bind_buffer_memory(
                handle,
                allocation.memory(),
                allocation.offset(),
            )
        }
        .map_err(|err| {
            unsafe { device.handle().destroy_buffer(handle, None) };
            BufferCreationError::from(err)
        })?;

        Ok(Self {
            device,
            handle,
            allocation: Some(allocation),
            size,
        })
    }

    /// Convenience constructor for a host-visible uniform buffer.
    pub fn new_uniform(
        device: Arc<Device>,
        name: &str,
        size: u64,
    ) -> Result<Self, BufferCreationError> {
        Self::new(
            device,
            name,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copies `data` into the mapped allocation at `offset` bytes. Writes
    /// falling outside the buffer or into unmapped memory are dropped with a
    /// warning rather than corrupting neighbours.
    pub fn fill(&mut self, data: &[u8], offset: u64) {
        let end = offset + data.len() as u64;
        if end > self.size {
            warn!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.size,
            );
            return;
        }
        let mapped = match self.allocation.as_mut().and_then(Allocation::mapped_slice_mut) {
            Some(mapped) => mapped,
            None => {
                warn!("write to a buffer without host-visible memory");
                return;
            }
        };
        mapped[offset as usize..end as usize].copy_from_slice(data);
    }

    /// Copies `len` bytes starting at `offset` out of the mapped
    /// allocation. Returns `None` for out-of-range reads or buffers without
    /// host-visible memory.
    pub fn read(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let end = offset + len as u64;
        if end > self.size {
            warn!(
                "read of {} bytes at offset {} exceeds buffer size {}",
                len, offset, self.size,
            );
            return None;
        }
        let mapped = self.allocation.as_ref()?.mapped_slice()?;
        Some(mapped[offset as usize..end as usize].to_vec())
    }

    /// Returns the device address, for shader binding tables and
    /// acceleration-structure builds. The buffer must have been created
    /// with `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.handle);
        unsafe { self.device.handle().get_buffer_device_address(&info) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.device.allocator().free(allocation) {
                warn!("failed to free buffer allocation: {}", err);
            }
        }
        unsafe { self.device.handle().destroy_buffer(self.handle, None) };
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
