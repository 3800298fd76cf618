//! The bindless descriptor set backing the shader-visible heaps.
//!
//! One update-after-bind set holds every shader-visible descriptor. A
//! shader-resource heap index addresses the same array element in each of
//! the resource bindings; which binding receives the write depends on the
//! view type. Samplers get their own binding indexed by the sampler heap.

use ash::vk;
use tracing::{info, trace};

use crate::error::RhiResult;
use crate::pipeline::MAX_PUSH_CONSTANT_SIZE;

pub(crate) const BINDING_SAMPLED_IMAGE: u32 = 0;
pub(crate) const BINDING_STORAGE_IMAGE: u32 = 1;
pub(crate) const BINDING_STORAGE_BUFFER: u32 = 2;
pub(crate) const BINDING_SAMPLER: u32 = 3;
pub(crate) const BINDING_ACCELERATION_STRUCTURE: u32 = 4;

/// One array element to fill.
pub(crate) enum DescriptorWrite {
    SampledImage(vk::ImageView),
    StorageImage(vk::ImageView),
    StorageBuffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Sampler(vk::Sampler),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

pub(crate) struct BindlessSet {
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    resource_capacity: u32,
    sampler_capacity: u32,
}

impl BindlessSet {
    pub(crate) fn new(
        device: &ash::Device,
        resource_capacity: u32,
        sampler_capacity: u32,
        acceleration_structures: bool,
    ) -> RhiResult<Self> {
        let stages = vk::ShaderStageFlags::ALL;
        let mut bindings = vec![
            (BINDING_SAMPLED_IMAGE, vk::DescriptorType::SAMPLED_IMAGE, resource_capacity),
            (BINDING_STORAGE_IMAGE, vk::DescriptorType::STORAGE_IMAGE, resource_capacity),
            (BINDING_STORAGE_BUFFER, vk::DescriptorType::STORAGE_BUFFER, resource_capacity),
            (BINDING_SAMPLER, vk::DescriptorType::SAMPLER, sampler_capacity),
        ];
        if acceleration_structures {
            bindings.push((
                BINDING_ACCELERATION_STRUCTURE,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                resource_capacity,
            ));
        }

        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|&(binding, ty, count)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(count)
                    .stage_flags(stages)
            })
            .collect();
        let binding_flags = vec![
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
            layout_bindings.len()
        ];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&layout_bindings)
            .push_next(&mut flags_info);

        // SAFETY: all create infos outlive their calls; objects are destroyed in `destroy`.
        unsafe {
            let layout = device.create_descriptor_set_layout(&layout_info, None)?;

            let pool_sizes: Vec<vk::DescriptorPoolSize> = bindings
                .iter()
                .map(|&(_, ty, count)| vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: count,
                })
                .collect();
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            let pool = device.create_descriptor_pool(&pool_info, None)?;

            let layouts = [layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            let set = device.allocate_descriptor_sets(&alloc_info)?[0];

            let push_constants = [vk::PushConstantRange::default()
                .stage_flags(stages)
                .offset(0)
                .size(MAX_PUSH_CONSTANT_SIZE)];
            let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&layouts)
                .push_constant_ranges(&push_constants);
            let pipeline_layout = device.create_pipeline_layout(&pipeline_layout_info, None)?;

            info!(
                "Bindless set: {} resources, {} samplers{}",
                resource_capacity,
                sampler_capacity,
                if acceleration_structures { ", acceleration structures" } else { "" }
            );

            Ok(Self {
                layout,
                pool,
                set,
                pipeline_layout,
                resource_capacity,
                sampler_capacity,
            })
        }
    }

    #[inline]
    pub(crate) fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Layout shared by every pipeline: the bindless set plus push constants.
    #[inline]
    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    #[inline]
    pub(crate) fn resource_capacity(&self) -> u32 {
        self.resource_capacity
    }

    #[inline]
    pub(crate) fn sampler_capacity(&self) -> u32 {
        self.sampler_capacity
    }

    /// Writes `write` at array element `index`.
    pub(crate) fn write(&self, device: &ash::Device, index: u32, write: DescriptorWrite) {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_array_element(index);
        match write {
            DescriptorWrite::SampledImage(view) | DescriptorWrite::StorageImage(view) => {
                let (binding, ty, layout) = match write {
                    DescriptorWrite::SampledImage(_) => (
                        BINDING_SAMPLED_IMAGE,
                        vk::DescriptorType::SAMPLED_IMAGE,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    ),
                    _ => (
                        BINDING_STORAGE_IMAGE,
                        vk::DescriptorType::STORAGE_IMAGE,
                        vk::ImageLayout::GENERAL,
                    ),
                };
                let info = [vk::DescriptorImageInfo::default()
                    .image_view(view)
                    .image_layout(layout)];
                let writes = [base
                    .dst_binding(binding)
                    .descriptor_type(ty)
                    .image_info(&info)];
                // SAFETY: update-after-bind permits writes while the set is bound.
                unsafe { device.update_descriptor_sets(&writes, &[]) };
            }
            DescriptorWrite::StorageBuffer {
                buffer,
                offset,
                range,
            } => {
                let info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(offset)
                    .range(range)];
                let writes = [base
                    .dst_binding(BINDING_STORAGE_BUFFER)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&info)];
                // SAFETY: as above.
                unsafe { device.update_descriptor_sets(&writes, &[]) };
            }
            DescriptorWrite::Sampler(sampler) => {
                let info = [vk::DescriptorImageInfo::default().sampler(sampler)];
                let writes = [base
                    .dst_binding(BINDING_SAMPLER)
                    .descriptor_type(vk::DescriptorType::SAMPLER)
                    .image_info(&info)];
                // SAFETY: as above.
                unsafe { device.update_descriptor_sets(&writes, &[]) };
            }
            DescriptorWrite::AccelerationStructure(accel) => {
                let handles = [accel];
                let mut accel_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(&handles);
                let mut write = base
                    .dst_binding(BINDING_ACCELERATION_STRUCTURE)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut accel_info);
                write.descriptor_count = 1;
                // SAFETY: as above.
                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
        }
        trace!("Bindless write at {}", index);
    }

    /// Destroys the set's objects. Called once, after the device is idle.
    pub(crate) fn destroy(&self, device: &ash::Device) {
        // SAFETY: nothing references the set once the device is idle.
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
