//! Instance, physical device and logical device bring-up.
//!
//! One [`Device`] owns the whole ash stack plus the shared descriptor pool
//! and the [`gpu_allocator`] instance every buffer allocates from. All other
//! objects in the crate hold an `Arc<Device>` and release their Vulkan
//! handles before the device itself is destroyed.

use crate::VulkanError;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::{
    error::Error,
    ffi::CStr,
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};

/// Descriptors of each type the shared pool can hold. Sized for a handful
/// of pipelines with bindless-style texture arrays.
const POOL_DESCRIPTOR_COUNT: u32 = 4096;
/// Descriptor sets the shared pool can hand out over its lifetime.
const POOL_SET_COUNT: u32 = 256;

/// Device limits and ray-tracing properties the binding engine needs,
/// captured once at device creation so layout math never touches Vulkan.
#[derive(Clone, Copy, Debug)]
pub struct DeviceProperties {
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_push_constants_size: u32,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
}

impl DeviceProperties {
    /// Properties of a typical desktop implementation, for device-free
    /// layout tests.
    #[cfg(test)]
    pub(crate) fn test_default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 64,
            max_push_constants_size: 128,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
        }
    }
}

/// Error that can happen when creating a [`Device`].
#[derive(Debug)]
pub enum DeviceCreationError {
    /// The Vulkan loader library could not be found or initialized.
    LoaderUnavailable(String),
    /// No physical device exposes a graphics-and-compute queue family.
    NoSuitableDevice,
    /// A Vulkan call failed.
    VulkanError(VulkanError),
    /// The memory allocator could not be initialized.
    AllocatorError(String),
}

impl Error for DeviceCreationError {}

impl Display for DeviceCreationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::LoaderUnavailable(err) => write!(f, "Vulkan loader unavailable: {}", err),
            Self::NoSuitableDevice => {
                write!(f, "no physical device with a graphics and compute queue")
            }
            Self::VulkanError(err) => write!(f, "Vulkan call failed: {}", err),
            Self::AllocatorError(err) => write!(f, "allocator initialization failed: {}", err),
        }
    }
}

impl From<vk::Result> for DeviceCreationError {
    fn from(err: vk::Result) -> Self {
        Self::VulkanError(err.into())
    }
}

/// The logical device plus everything that is shared across pipelines.
pub struct Device {
    // Keeps the loader library alive for the lifetime of the instance.
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    properties: DeviceProperties,
    descriptor_pool: vk::DescriptorPool,
    allocator: Mutex<Option<Allocator>>,
    ray_tracing_fns: Option<ash::khr::ray_tracing_pipeline::Device>,
}

impl Device {
    /// Brings up an instance, picks the first physical device with a
    /// graphics-and-compute queue, and creates the logical device with
    /// descriptor indexing, buffer device addresses, dynamic rendering and,
    /// where supported, the ray-tracing pipeline extensions.
    pub fn new(application_name: &CStr) -> Result<Arc<Self>, DeviceCreationError> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|err| DeviceCreationError::LoaderUnavailable(err.to_string()))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(application_name)
            .api_version(vk::API_VERSION_1_3);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None) }?;

        let (physical_device, queue_family_index) =
            match Self::pick_physical_device(&instance) {
                Ok(Some(found)) => found,
                Ok(None) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(DeviceCreationError::NoSuitableDevice);
                }
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            };

        let ray_tracing_supported =
            match Self::supports_ray_tracing(&instance, physical_device) {
                Ok(supported) => supported,
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err.into());
                }
            };

        let mut extensions = Vec::new();
        if ray_tracing_supported {
            extensions.push(ash::khr::acceleration_structure::NAME.as_ptr());
            extensions.push(ash::khr::ray_tracing_pipeline::NAME.as_ptr());
            extensions.push(ash::khr::deferred_host_operations::NAME.as_ptr());
        }

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true)
            .runtime_descriptor_array(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        let queue_priorities = [1.0];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)];

        let mut device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extensions)
            .push_next(&mut features12)
            .push_next(&mut features13);
        if ray_tracing_supported {
            device_info = device_info
                .push_next(&mut as_features)
                .push_next(&mut rt_features);
        }

        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|err| {
                unsafe { instance.destroy_instance(None) };
                DeviceCreationError::from(err)
            })?;
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        let properties =
            Self::query_properties(&instance, physical_device, ray_tracing_supported);
        info!(
            "device ready: uniform alignment {}, push constant limit {}, ray tracing {}",
            properties.min_uniform_buffer_offset_alignment,
            properties.max_push_constants_size,
            if ray_tracing_supported { "on" } else { "off" },
        );

        let descriptor_pool =
            match Self::create_descriptor_pool(&device, ray_tracing_supported) {
                Ok(pool) => pool,
                Err(err) => {
                    unsafe {
                        device.destroy_device(None);
                        instance.destroy_instance(None);
                    }
                    return Err(err.into());
                }
            };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe {
                    device.destroy_descriptor_pool(descriptor_pool, None);
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(DeviceCreationError::AllocatorError(err.to_string()));
            }
        };

        let ray_tracing_fns = ray_tracing_supported
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(&instance, &device));

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family_index,
            properties,
            descriptor_pool,
            allocator: Mutex::new(Some(allocator)),
            ray_tracing_fns,
        }))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
    ) -> Result<Option<(vk::PhysicalDevice, u32)>, vk::Result> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }?;
        for physical_device in physical_devices {
            let families = unsafe {
                instance.get_physical_device_queue_family_properties(physical_device)
            };
            let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
            if let Some(index) = families
                .iter()
                .position(|family| family.queue_flags.contains(wanted))
            {
                return Ok(Some((physical_device, index as u32)));
            }
        }
        Ok(None)
    }

    fn supports_ray_tracing(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<bool, vk::Result> {
        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
        let has = |name: &CStr| {
            extensions.iter().any(|ext| {
                ext.extension_name_as_c_str()
                    .is_ok_and(|ext_name| ext_name == name)
            })
        };
        Ok(has(ash::khr::acceleration_structure::NAME)
            && has(ash::khr::ray_tracing_pipeline::NAME)
            && has(ash::khr::deferred_host_operations::NAME))
    }

    fn query_properties(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        ray_tracing: bool,
    ) -> DeviceProperties {
        let mut rt_properties =
            vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        if ray_tracing {
            properties2 = properties2.push_next(&mut rt_properties);
        }
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut properties2)
        };
        let limits = properties2.properties.limits;

        DeviceProperties {
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_push_constants_size: limits.max_push_constants_size,
            shader_group_handle_size: rt_properties.shader_group_handle_size,
            shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
            shader_group_base_alignment: rt_properties.shader_group_base_alignment,
        }
    }

    fn create_descriptor_pool(
        device: &ash::Device,
        ray_tracing: bool,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        let mut pool_sizes = vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: POOL_DESCRIPTOR_COUNT,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: POOL_DESCRIPTOR_COUNT,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: POOL_DESCRIPTOR_COUNT,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: POOL_DESCRIPTOR_COUNT,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: POOL_DESCRIPTOR_COUNT,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: POOL_DESCRIPTOR_COUNT,
            },
        ];
        if ray_tracing {
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: POOL_DESCRIPTOR_COUNT,
            });
        }

        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(POOL_SET_COUNT)
            .pool_sizes(&pool_sizes);
        unsafe { device.create_descriptor_pool(&info, None) }
    }

    pub(crate) fn handle(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub(crate) fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.descriptor_pool
    }

    /// Ray-tracing entry points, present only when the extensions were
    /// enabled at device creation.
    pub(crate) fn ray_tracing_fns(
        &self,
    ) -> Option<&ash::khr::ray_tracing_pipeline::Device> {
        self.ray_tracing_fns.as_ref()
    }

    /// Locks the shared allocator. Panics only after the device has begun
    /// tearing down, which no live object can observe.
    pub(crate) fn allocator(&self) -> MappedAllocatorGuard<'_> {
        MutexGuard::map(self.allocator.lock(), |slot| match slot {
            Some(allocator) => allocator,
            None => unreachable!("allocator outlives every allocation"),
        })
    }

    /// Blocks until the queue has drained. Used before tearing down
    /// per-frame resources.
    pub fn wait_idle(&self) {
        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            warn!("device_wait_idle failed: {}", VulkanError::from(err));
        }
    }
}

pub(crate) type MappedAllocatorGuard<'a> =
    parking_lot::MappedMutexGuard<'a, Allocator>;

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // The allocator must release its memory blocks before the
            // device goes away.
            drop(self.allocator.lock().take());
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Device")
            .field("physical_device", &self.physical_device)
            .field("queue_family_index", &self.queue_family_index)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}
