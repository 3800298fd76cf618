//! Timeline semaphores and deferred destruction.
//!
//! Core fences map one-to-one onto timeline semaphores. A second, internal
//! timeline counts queue submissions; objects dropped by the core are parked
//! in a [`RetireQueue`] keyed by the submission value current at drop time and
//! destroyed once the GPU has passed it.

use std::collections::VecDeque;
use std::time::Duration;

use ash::vk;
use tracing::{error, trace};

use crate::error::{RhiError, RhiResult};
use crate::vulkan::device::LogicalDevice;
use crate::vulkan::resources::{self, VkBuffer, VkImage};

pub(crate) fn create_timeline(device: &ash::Device, initial_value: u64) -> RhiResult<vk::Semaphore> {
    let mut timeline = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(initial_value);
    let info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline);
    // SAFETY: valid create info; destroyed via the owning object.
    Ok(unsafe { device.create_semaphore(&info, None)? })
}

pub(crate) fn create_binary(device: &ash::Device) -> RhiResult<vk::Semaphore> {
    // SAFETY: as above.
    Ok(unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? })
}

/// Current counter value; `ERROR_DEVICE_LOST` becomes [`RhiError::DeviceLost`].
pub(crate) fn timeline_value(device: &ash::Device, semaphore: vk::Semaphore) -> RhiResult<u64> {
    // SAFETY: the semaphore is a live timeline semaphore.
    unsafe { device.get_semaphore_counter_value(semaphore) }.map_err(device_error)
}

/// Blocks until the counter reaches `value`.
pub(crate) fn wait_timeline(
    device: &ash::Device,
    semaphore: vk::Semaphore,
    value: u64,
    timeout: Duration,
) -> RhiResult<()> {
    let semaphores = [semaphore];
    let values = [value];
    let info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);
    let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    // SAFETY: as above.
    match unsafe { device.wait_semaphores(&info, nanos) } {
        Ok(()) => Ok(()),
        Err(vk::Result::TIMEOUT) => {
            let completed = timeline_value(device, semaphore)?;
            Err(RhiError::FenceTimeout { value, completed })
        }
        Err(e) => Err(device_error(e)),
    }
}

/// Maps a queue or wait error to the core's classification.
pub(crate) fn device_error(result: vk::Result) -> RhiError {
    if result == vk::Result::ERROR_DEVICE_LOST {
        error!("Vulkan device lost");
        RhiError::DeviceLost("VK_ERROR_DEVICE_LOST".into())
    } else {
        RhiError::VulkanError(result)
    }
}

/// An object whose destruction waits for the GPU.
pub(crate) enum Garbage {
    Buffer(VkBuffer),
    Image(VkImage),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    Pipeline(vk::Pipeline),
    ShaderModule(vk::ShaderModule),
    AccelerationStructure(vk::AccelerationStructureKHR),
    CommandPool(vk::CommandPool),
    Semaphore(vk::Semaphore),
}

impl Garbage {
    pub(crate) fn destroy(self, device: &LogicalDevice) {
        let raw = device.handle();
        // SAFETY: the retire queue only hands out objects the GPU has finished with.
        unsafe {
            match self {
                Garbage::Buffer(buffer) => resources::destroy_buffer(device, buffer),
                Garbage::Image(image) => resources::destroy_image(device, image),
                Garbage::ImageView(view) => raw.destroy_image_view(view, None),
                Garbage::Sampler(sampler) => raw.destroy_sampler(sampler, None),
                Garbage::Pipeline(pipeline) => raw.destroy_pipeline(pipeline, None),
                Garbage::ShaderModule(module) => raw.destroy_shader_module(module, None),
                Garbage::AccelerationStructure(accel) => {
                    if let Some(loader) = device.acceleration() {
                        loader.destroy_acceleration_structure(accel, None);
                    }
                }
                Garbage::CommandPool(pool) => raw.destroy_command_pool(pool, None),
                Garbage::Semaphore(semaphore) => raw.destroy_semaphore(semaphore, None),
            }
        }
    }
}

/// Objects waiting for a submission value, in submission order.
#[derive(Default)]
pub(crate) struct RetireQueue {
    entries: VecDeque<(u64, Garbage)>,
}

impl RetireQueue {
    pub(crate) fn push(&mut self, submission: u64, garbage: Garbage) {
        self.entries.push_back((submission, garbage));
    }

    /// Removes everything whose submission has completed.
    pub(crate) fn take_ready(&mut self, completed: u64) -> Vec<Garbage> {
        let ready = self
            .entries
            .iter()
            .take_while(|(submission, _)| *submission <= completed)
            .count();
        if ready > 0 {
            trace!("Retiring {} objects at submission {}", ready, completed);
        }
        self.entries.drain(..ready).map(|(_, garbage)| garbage).collect()
    }

    pub(crate) fn take_all(&mut self) -> Vec<Garbage> {
        self.entries.drain(..).map(|(_, garbage)| garbage).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_queue_respects_submission_order() {
        let mut queue = RetireQueue::default();
        queue.push(1, Garbage::Semaphore(vk::Semaphore::null()));
        queue.push(2, Garbage::Sampler(vk::Sampler::null()));
        queue.push(2, Garbage::ImageView(vk::ImageView::null()));
        queue.push(5, Garbage::Pipeline(vk::Pipeline::null()));

        assert!(queue.take_ready(0).is_empty());
        assert_eq!(queue.take_ready(2).len(), 3);
        assert_eq!(queue.len(), 1);
        assert!(queue.take_ready(4).is_empty());
        assert_eq!(queue.take_all().len(), 1);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_device_error_classification() {
        assert!(matches!(
            device_error(vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost(_)
        ));
        assert!(matches!(
            device_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            RhiError::VulkanError(_)
        ));
    }
}
