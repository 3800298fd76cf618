//! Physical device selection.
//!
//! Every adapter is checked for the features the backend cannot run without
//! (Vulkan 1.3, dynamic rendering, synchronization2, timeline semaphores,
//! bindless descriptor indexing) and the survivors are scored. Ray tracing is
//! optional and only recorded.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Extensions required for acceleration structures.
pub(crate) const RAY_TRACING_EXTENSIONS: &[&CStr] = &[
    ash::khr::acceleration_structure::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// Queue families the backend uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    /// Family able to present to the target surface, if there is one.
    pub present_family: Option<u32>,
    pub compute_family: Option<u32>,
    pub transfer_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// A graphics family is always needed; a present family only when presenting.
    #[inline]
    pub fn is_complete(&self, needs_present: bool) -> bool {
        self.graphics_family.is_some() && (!needs_present || self.present_family.is_some())
    }

    /// Distinct families, graphics first.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(4);
        for family in [
            self.graphics_family,
            self.present_family,
            self.compute_family,
            self.transfer_family,
        ]
        .into_iter()
        .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// A physical device that passed the capability checks.
#[derive(Clone)]
pub struct AdapterCandidate {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
    pub ray_tracing: bool,
    /// Upper bound on any update-after-bind resource binding, used to clamp heaps.
    pub max_bindless_resources: u32,
    pub max_bindless_samplers: u32,
}

impl AdapterCandidate {
    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "Unknown Device".to_owned())
    }

    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Total device-local heap size in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }
}

impl std::fmt::Debug for AdapterCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCandidate")
            .field("name", &self.name())
            .field("type", &self.device_type_name())
            .field("queue_families", &self.queue_families)
            .field("ray_tracing", &self.ray_tracing)
            .finish()
    }
}

/// Surface an adapter must be able to present to.
pub struct PresentTarget<'a> {
    pub surface: vk::SurfaceKHR,
    pub loader: &'a ash::khr::surface::Instance,
}

/// Picks the highest-scoring suitable adapter.
///
/// # Errors
///
/// [`RhiError::NoSuitableGpu`] when nothing qualifies.
pub fn select_adapter(
    instance: &ash::Instance,
    present: Option<&PresentTarget<'_>>,
) -> RhiResult<AdapterCandidate> {
    // SAFETY: plain enumeration on a live instance.
    let devices = unsafe { instance.enumerate_physical_devices()? };
    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }
    info!("Found {} GPU(s)", devices.len());

    let best = devices
        .into_iter()
        .filter_map(|device| check_adapter(instance, device, present))
        .map(|candidate| {
            let score = rate_adapter(&candidate);
            debug!(
                "GPU '{}' ({}) scored {}",
                candidate.name(),
                candidate.device_type_name(),
                score
            );
            (candidate, score)
        })
        .max_by_key(|(_, score)| *score);

    let Some((adapter, score)) = best else {
        warn!("No GPU supports Vulkan 1.3 with dynamic rendering and synchronization2");
        return Err(RhiError::NoSuitableGpu);
    };

    info!(
        "Selected GPU '{}' ({}), score {}, ray tracing {}",
        adapter.name(),
        adapter.device_type_name(),
        score,
        if adapter.ray_tracing { "available" } else { "unavailable" }
    );
    Ok(adapter)
}

fn check_adapter(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    present: Option<&PresentTarget<'_>>,
) -> Option<AdapterCandidate> {
    // SAFETY: queries on a device enumerated from this instance.
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let name = properties
        .device_name_as_c_str()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !meets_api_version(properties.api_version) {
        debug!(
            "GPU '{}' skipped: Vulkan {}.{}",
            name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version)
        );
        return None;
    }

    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features12)
        .push_next(&mut features13);
    // SAFETY: the chain points at locals that outlive the call.
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let anisotropy = features.features.sampler_anisotropy == vk::TRUE;

    let required = [
        ("dynamic rendering", features13.dynamic_rendering),
        ("synchronization2", features13.synchronization2),
        ("timeline semaphores", features12.timeline_semaphore),
        ("descriptor indexing", features12.descriptor_indexing),
        ("runtime descriptor arrays", features12.runtime_descriptor_array),
        ("partially bound descriptors", features12.descriptor_binding_partially_bound),
        (
            "update-after-bind images",
            features12.descriptor_binding_sampled_image_update_after_bind,
        ),
        ("buffer device address", features12.buffer_device_address),
    ];
    if let Some((missing, _)) = required.iter().find(|(_, supported)| *supported == vk::FALSE) {
        debug!("GPU '{}' skipped: no {}", name, missing);
        return None;
    }
    if !anisotropy {
        debug!("GPU '{}' skipped: no sampler anisotropy", name);
        return None;
    }

    let queue_families = find_queue_families(instance, device, present);
    if !queue_families.is_complete(present.is_some()) {
        debug!("GPU '{}' skipped: missing queue families", name);
        return None;
    }

    // SAFETY: plain enumeration.
    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
        .unwrap_or_default();
    let has_extension = |wanted: &CStr| {
        extensions
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|n| n == wanted))
    };
    if present.is_some() && !has_extension(ash::khr::swapchain::NAME) {
        debug!("GPU '{}' skipped: no swapchain support", name);
        return None;
    }
    let ray_tracing = RAY_TRACING_EXTENSIONS.iter().all(|ext| has_extension(ext));

    let mut indexing = vk::PhysicalDeviceDescriptorIndexingProperties::default();
    let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut indexing);
    // SAFETY: as above.
    unsafe { instance.get_physical_device_properties2(device, &mut properties2) };

    Some(AdapterCandidate {
        device,
        properties,
        memory_properties,
        queue_families,
        ray_tracing,
        max_bindless_resources: indexing
            .max_descriptor_set_update_after_bind_sampled_images
            .min(indexing.max_descriptor_set_update_after_bind_storage_images)
            .min(indexing.max_descriptor_set_update_after_bind_storage_buffers),
        max_bindless_samplers: indexing.max_descriptor_set_update_after_bind_samplers,
    })
}

fn meets_api_version(version: u32) -> bool {
    let (major, minor) = (vk::api_version_major(version), vk::api_version_minor(version));
    major > 1 || (major == 1 && minor >= 3)
}

fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    present: Option<&PresentTarget<'_>>,
) -> QueueFamilyIndices {
    // SAFETY: query on a live device.
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let mut indices = QueueFamilyIndices::default();

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 {
            continue;
        }
        let flags = family.queue_flags;
        let graphics = flags.contains(vk::QueueFlags::GRAPHICS);
        let compute = flags.contains(vk::QueueFlags::COMPUTE);

        if graphics && compute && indices.graphics_family.is_none() {
            indices.graphics_family = Some(index);
        }
        if compute && !graphics && indices.compute_family.is_none() {
            indices.compute_family = Some(index);
        }
        if flags.contains(vk::QueueFlags::TRANSFER)
            && !graphics
            && !compute
            && indices.transfer_family.is_none()
        {
            indices.transfer_family = Some(index);
        }
        if let Some(target) = present
            && indices.present_family.is_none()
        {
            // SAFETY: surface and device belong to the same instance.
            let supported = unsafe {
                target
                    .loader
                    .get_physical_device_surface_support(device, index, target.surface)
                    .unwrap_or(false)
            };
            if supported {
                indices.present_family = Some(index);
            }
        }
    }

    indices.compute_family = indices.compute_family.or(indices.graphics_family);
    indices.transfer_family = indices.transfer_family.or(indices.graphics_family);
    indices
}

/// Higher is better: device class dominates, then image limits and VRAM.
pub(crate) fn rate_adapter(adapter: &AdapterCandidate) -> u32 {
    let mut score = match adapter.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };

    score += adapter.properties.limits.max_image_dimension2_d;
    let vram_mb = (adapter.device_local_memory() / (1024 * 1024)).min(16_000) as u32;
    score += vram_mb;

    let families = adapter.queue_families;
    if families.compute_family != families.graphics_family {
        score += 100;
    }
    if families.transfer_family != families.graphics_family {
        score += 100;
    }
    if adapter.ray_tracing {
        score += 500;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(device_type: vk::PhysicalDeviceType, vram_mb: u64, max_dim: u32) -> AdapterCandidate {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.device_type = device_type;
        properties.limits.max_image_dimension2_d = max_dim;

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_heap_count = 2;
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: vram_mb * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 64 * 1024 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::empty(),
        };

        AdapterCandidate {
            device: vk::PhysicalDevice::null(),
            properties,
            memory_properties,
            queue_families: QueueFamilyIndices {
                graphics_family: Some(0),
                present_family: Some(0),
                compute_family: Some(0),
                transfer_family: Some(0),
            },
            ray_tracing: false,
            max_bindless_resources: 500_000,
            max_bindless_samplers: 2048,
        }
    }

    #[test]
    fn test_discrete_beats_integrated() {
        let discrete = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 4096, 16384);
        let integrated = candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, 16_000, 16384);
        assert!(rate_adapter(&discrete) > rate_adapter(&integrated));
    }

    #[test]
    fn test_vram_breaks_ties() {
        let small = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 4096, 16384);
        let large = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 8192, 16384);
        assert!(rate_adapter(&large) > rate_adapter(&small));
        // Host heaps do not count.
        assert_eq!(large.device_local_memory(), 8192 * 1024 * 1024);
    }

    #[test]
    fn test_vram_contribution_is_capped() {
        let a = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 32_000, 16384);
        let b = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 64_000, 16384);
        assert_eq!(rate_adapter(&a), rate_adapter(&b));
    }

    #[test]
    fn test_dedicated_queues_and_ray_tracing_bonus() {
        let base = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, 4096, 16384);
        let mut better = base.clone();
        better.queue_families.compute_family = Some(1);
        better.ray_tracing = true;
        assert_eq!(rate_adapter(&better), rate_adapter(&base) + 600);
    }

    #[test]
    fn test_api_version_gate() {
        assert!(meets_api_version(vk::API_VERSION_1_3));
        assert!(!meets_api_version(vk::API_VERSION_1_2));
        assert!(meets_api_version(vk::make_api_version(0, 2, 0, 0)));
    }

    #[test]
    fn test_queue_family_completeness() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            ..Default::default()
        };
        assert!(indices.is_complete(false));
        assert!(!indices.is_complete(true));
    }

    #[test]
    fn test_unique_families() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
            compute_family: Some(2),
            transfer_family: Some(1),
        };
        assert_eq!(indices.unique_families(), vec![0, 2, 1]);
    }
}
