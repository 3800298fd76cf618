//! Logical device, its queue and the memory allocator.

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Mutex;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::{debug, error, info};

use crate::error::RhiResult;
use crate::vulkan::adapter::{AdapterCandidate, RAY_TRACING_EXTENSIONS};
use crate::vulkan::instance::Instance;

/// Owns the `VkDevice`. All queue kinds share the graphics family's queue 0.
pub struct LogicalDevice {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    /// Separate only when the adapter cannot present from the graphics family.
    present_queue: Option<vk::Queue>,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    acceleration: Option<ash::khr::acceleration_structure::Device>,
}

impl LogicalDevice {
    /// Creates the device with the 1.2/1.3 features the backend relies on.
    pub fn new(instance: &Instance, adapter: &AdapterCandidate, presentable: bool) -> RhiResult<Self> {
        let families = adapter.queue_families;
        // Completeness was checked during selection.
        let graphics_family = families.graphics_family.unwrap_or(0);
        let present_family = families.present_family.filter(|f| *f != graphics_family);

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = std::iter::once(graphics_family)
            .chain(present_family)
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let mut extensions: Vec<&CStr> = Vec::new();
        if presentable {
            extensions.push(ash::khr::swapchain::NAME);
        }
        if adapter.ray_tracing {
            extensions.extend_from_slice(RAY_TRACING_EXTENSIONS);
        }
        let extension_names: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|e| e.as_ptr()).collect();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_buffer_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true)
            .maintenance4(true);
        let mut acceleration_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true)
            .descriptor_binding_acceleration_structure_update_after_bind(true);
        let base = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .fill_mode_non_solid(true);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&base)
            .push_next(&mut features12)
            .push_next(&mut features13);
        if adapter.ray_tracing {
            create_info = create_info.push_next(&mut acceleration_features);
        }

        // SAFETY: the adapter came from this instance; create_info outlives the call.
        let device = unsafe {
            instance
                .handle()
                .create_device(adapter.device, &create_info, None)?
        };
        info!("Logical device created with {} extension(s)", extensions.len());

        // SAFETY: the families were requested above with one queue each.
        let queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = present_family.map(|family| {
            debug!("Presenting from dedicated family {}", family);
            // SAFETY: as above.
            unsafe { device.get_device_queue(family, 0) }
        });

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.handle().clone(),
            device: device.clone(),
            physical_device: adapter.device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created on the device yet.
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };
        debug!("GPU memory allocator initialized");

        let acceleration = adapter
            .ray_tracing
            .then(|| ash::khr::acceleration_structure::Device::new(instance.handle(), &device));

        Ok(Self {
            device,
            physical_device: adapter.device,
            queue,
            queue_family: graphics_family,
            present_queue,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            acceleration,
        })
    }

    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    #[inline]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Queue used for `vkQueuePresentKHR`.
    #[inline]
    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue.unwrap_or(self.queue)
    }

    #[inline]
    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Acceleration structure entry points, when the adapter supports them.
    #[inline]
    pub fn acceleration(&self) -> Option<&ash::khr::acceleration_structure::Device> {
        self.acceleration.as_ref()
    }

    /// GPU address of a buffer created with `SHADER_DEVICE_ADDRESS` usage.
    pub fn buffer_address(&self, buffer: vk::Buffer) -> u64 {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        // SAFETY: the buffer is live and was created with device-address usage.
        unsafe { self.device.get_buffer_device_address(&info) }
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        // SAFETY: the allocator must go before the device it allocates from.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                error!("Device wait idle failed during drop: {:?}", e);
            }
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        debug!("Logical device destroyed");
    }
}

// SAFETY: ash::Device is Send + Sync, queue access is serialized by the
// backend's submit lock and the allocator is Mutex-guarded.
unsafe impl Send for LogicalDevice {}
unsafe impl Sync for LogicalDevice {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LogicalDevice>();
    }
}
