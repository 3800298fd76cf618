//! Command pools and translation of recorded commands into Vulkan.
//!
//! Each core command list owns one pool with one primary command buffer;
//! resetting the list resets the pool. Encoding walks the recorded
//! [`Command`]s once. Render passes are implicit: the encoder opens a
//! dynamic-rendering scope at the first draw after render targets are set
//! and closes it before anything that may not run inside one (barriers,
//! copies, dispatches, builds).

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;
use tracing::trace;

use crate::backend::{RawResource, RawView};
use crate::command::{Command, IndexFormat, Viewport};
use crate::error::{RhiError, RhiResult};
use crate::footprint::{MipFootprint, mip_extent};
use crate::queue::QueueKind;
use crate::resource::{ResourceRef, Texture};
use crate::state::AccessState;
use crate::vulkan::Objects;
use crate::vulkan::acceleration;
use crate::vulkan::conv;
use crate::vulkan::device::LogicalDevice;
use crate::vulkan::resources::VkImage;

pub(crate) struct VkCommandList {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
    pub queue: QueueKind,
    pub name: String,
}

impl VkCommandList {
    pub(crate) fn new(device: &ash::Device, family: u32, queue: QueueKind, name: &str) -> RhiResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(family);
        // SAFETY: valid create info; the pool is destroyed through the retire queue.
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: the pool was just created.
        let buffer = match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                // SAFETY: nothing was allocated from the pool.
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(e.into());
            }
        };
        Ok(Self {
            pool,
            buffer,
            queue,
            name: name.to_string(),
        })
    }

    /// Returns the command buffer to the initial state.
    pub(crate) fn reset(&self, device: &ash::Device) -> RhiResult<()> {
        // SAFETY: the core resets a list only after its last submission completed.
        unsafe { device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }
}

/// Everything encoding needs besides the object tables.
pub(crate) struct EncodeContext<'a> {
    pub device: &'a LogicalDevice,
    pub pipeline_layout: vk::PipelineLayout,
    pub descriptor_set: vk::DescriptorSet,
    pub labels: Option<&'a ash::ext::debug_utils::Device>,
}

struct Attachment {
    view: vk::ImageView,
    extent: vk::Extent2D,
}

struct Encoder<'a> {
    ctx: &'a EncodeContext<'a>,
    objects: &'a mut Objects,
    cmd: vk::CommandBuffer,
    colors: Vec<RawView>,
    depth: Option<RawView>,
    rendering: bool,
}

fn lookup<'m, T>(map: &'m HashMap<u64, T>, id: u64, what: &str) -> RhiResult<&'m T> {
    map.get(&id)
        .ok_or_else(|| RhiError::InvalidHandle(format!("{what} {id} is not live")))
}

/// Records `commands` into `list`, replacing whatever it held.
pub(crate) fn encode(
    ctx: &EncodeContext<'_>,
    objects: &mut Objects,
    list: &VkCommandList,
    commands: &[Command],
) -> RhiResult<()> {
    let raw = ctx.device.handle();
    list.reset(raw)?;
    let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    // SAFETY: the buffer was just reset.
    unsafe { raw.begin_command_buffer(list.buffer, &begin)? };

    let mut encoder = Encoder {
        ctx,
        objects,
        cmd: list.buffer,
        colors: Vec::new(),
        depth: None,
        rendering: false,
    };
    for command in commands {
        encoder.command(command)?;
    }
    encoder.end_rendering();

    // SAFETY: recording is balanced; every scope opened above was closed.
    unsafe { raw.end_command_buffer(list.buffer)? };
    trace!("Encoded '{}' ({} commands)", list.name, commands.len());
    Ok(())
}

impl Encoder<'_> {
    fn raw(&self) -> &ash::Device {
        self.ctx.device.handle()
    }

    fn command(&mut self, command: &Command) -> RhiResult<()> {
        let cmd = self.cmd;
        match command {
            Command::Transition {
                resource,
                before,
                after,
            } => {
                self.end_rendering();
                self.transition(resource, *before, *after)?;
            }
            Command::UavBarrier { .. } => {
                self.end_rendering();
                let barrier = [vk::MemoryBarrier2::default()
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
                    .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)];
                let dependency = vk::DependencyInfo::default().memory_barriers(&barrier);
                // SAFETY: the command buffer is recording.
                unsafe { self.raw().cmd_pipeline_barrier2(cmd, &dependency) };
            }
            Command::ClearRenderTarget { view, color } => {
                let value = vk::ClearValue {
                    color: vk::ClearColorValue { float32: *color },
                };
                self.clear(view.raw(), value, false)?;
            }
            Command::ClearDepth { view, depth } => {
                let value = vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: *depth,
                        stencil: 0,
                    },
                };
                self.clear(view.raw(), value, true)?;
            }
            Command::SetRenderTargets { colors, depth } => {
                self.end_rendering();
                self.colors = colors.iter().map(|v| v.raw()).collect();
                self.depth = depth.as_ref().map(|v| v.raw());
            }
            Command::SetViewport(viewport) => self.set_viewport(viewport),
            Command::SetPipeline(pipeline) => {
                let vk_pipeline = lookup(&self.objects.pipelines, pipeline.raw().0, "pipeline")?;
                let (handle, bind_point) = (vk_pipeline.pipeline, vk_pipeline.bind_point);
                // SAFETY: pipeline and set are live; the layout is shared by every pipeline.
                unsafe {
                    self.raw().cmd_bind_pipeline(cmd, bind_point, handle);
                    self.raw().cmd_bind_descriptor_sets(
                        cmd,
                        bind_point,
                        self.ctx.pipeline_layout,
                        0,
                        &[self.ctx.descriptor_set],
                        &[],
                    );
                }
            }
            Command::SetIndexBuffer { buffer, format } => {
                let handle = lookup(&self.objects.buffers, buffer.raw().0, "buffer")?.buffer;
                let index_type = match format {
                    IndexFormat::U16 => vk::IndexType::UINT16,
                    IndexFormat::U32 => vk::IndexType::UINT32,
                };
                // SAFETY: the buffer has index usage.
                unsafe { self.raw().cmd_bind_index_buffer(cmd, handle, 0, index_type) };
            }
            Command::PushConstants(data) => {
                // SAFETY: the core caps push data at the layout's range.
                unsafe {
                    self.raw().cmd_push_constants(
                        cmd,
                        self.ctx.pipeline_layout,
                        vk::ShaderStageFlags::ALL,
                        0,
                        data,
                    )
                };
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                self.begin_rendering()?;
                // SAFETY: inside a rendering scope with a graphics pipeline bound.
                unsafe {
                    self.raw()
                        .cmd_draw(cmd, *vertex_count, *instance_count, *first_vertex, *first_instance)
                };
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => {
                self.begin_rendering()?;
                // SAFETY: as above, with an index buffer bound.
                unsafe {
                    self.raw().cmd_draw_indexed(
                        cmd,
                        *index_count,
                        *instance_count,
                        *first_index,
                        *vertex_offset,
                        *first_instance,
                    )
                };
            }
            Command::Dispatch { x, y, z } => {
                self.end_rendering();
                // SAFETY: outside rendering with a compute pipeline bound.
                unsafe { self.raw().cmd_dispatch(cmd, *x, *y, *z) };
            }
            Command::CopyBufferToBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                self.end_rendering();
                let dst = lookup(&self.objects.buffers, dst.raw().0, "buffer")?.buffer;
                let src = lookup(&self.objects.buffers, src.raw().0, "buffer")?.buffer;
                let region = [vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                }];
                // SAFETY: ranges were checked against both buffers when recorded.
                unsafe { self.raw().cmd_copy_buffer(cmd, src, dst, &region) };
            }
            Command::CopyBufferToTexture {
                dst,
                src,
                footprints,
            } => {
                self.end_rendering();
                let buffer = lookup(&self.objects.buffers, src.raw().0, "buffer")?.buffer;
                let image = lookup(&self.objects.images, dst.raw().0, "texture")?;
                let regions = copy_regions(dst, image, footprints);
                // SAFETY: the texture is in TRANSFER_DST layout (CopyDest).
                unsafe {
                    self.raw().cmd_copy_buffer_to_image(
                        cmd,
                        buffer,
                        image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    )
                };
            }
            Command::CopyTextureToBuffer {
                dst,
                src,
                footprints,
            } => {
                self.end_rendering();
                let buffer = lookup(&self.objects.buffers, dst.raw().0, "buffer")?.buffer;
                let image = lookup(&self.objects.images, src.raw().0, "texture")?;
                let regions = copy_regions(src, image, footprints);
                // SAFETY: the texture is in TRANSFER_SRC layout (CopySource).
                unsafe {
                    self.raw().cmd_copy_image_to_buffer(
                        cmd,
                        image.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        buffer,
                        &regions,
                    )
                };
            }
            Command::CopyTextureToTexture { dst, src } => {
                self.end_rendering();
                let dst_image = lookup(&self.objects.images, dst.raw().0, "texture")?;
                let src_image = lookup(&self.objects.images, src.raw().0, "texture")?;
                let mips = dst_image.mip_levels.min(src_image.mip_levels);
                let regions: Vec<vk::ImageCopy> = (0..mips)
                    .map(|mip| {
                        let layers = |image: &VkImage| vk::ImageSubresourceLayers {
                            aspect_mask: image.aspect(),
                            mip_level: mip,
                            base_array_layer: 0,
                            layer_count: 1,
                        };
                        vk::ImageCopy {
                            src_subresource: layers(src_image),
                            src_offset: vk::Offset3D::default(),
                            dst_subresource: layers(dst_image),
                            dst_offset: vk::Offset3D::default(),
                            extent: vk::Extent3D {
                                width: mip_extent(src_image.extent.width, mip),
                                height: mip_extent(src_image.extent.height, mip),
                                depth: 1,
                            },
                        }
                    })
                    .collect();
                // SAFETY: layouts match the CopySource/CopyDest states checked when recorded.
                unsafe {
                    self.raw().cmd_copy_image(
                        cmd,
                        src_image.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst_image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    )
                };
            }
            Command::BuildAccelerationStructure { accel, scratch } => {
                self.end_rendering();
                let loader = self.ctx.device.acceleration().ok_or_else(|| {
                    RhiError::Unsupported("acceleration structures on this adapter".into())
                })?;
                let inputs = accel.inputs();
                let addresses = inputs
                    .input_buffers()
                    .into_iter()
                    .map(|buffer| {
                        lookup(&self.objects.buffers, buffer.raw().0, "buffer").map(|b| b.address)
                    })
                    .collect::<RhiResult<Vec<u64>>>()?;
                let scratch_address = lookup(&self.objects.buffers, scratch.raw().0, "buffer")?.address;
                let dst = lookup(&self.objects.accels, accel.raw().0, "acceleration structure")?.handle;
                acceleration::cmd_build(loader, cmd, inputs, &addresses, dst, scratch_address);
            }
            Command::BeginMarker(name) => {
                if let Some(labels) = self.ctx.labels {
                    let name = CString::new(name.as_str()).unwrap_or_default();
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name);
                    // SAFETY: debug labels have no state requirements.
                    unsafe { labels.cmd_begin_debug_utils_label(cmd, &label) };
                }
            }
            Command::EndMarker => {
                if let Some(labels) = self.ctx.labels {
                    // SAFETY: balanced with a BeginMarker, checked when recorded.
                    unsafe { labels.cmd_end_debug_utils_label(cmd) };
                }
            }
        }
        Ok(())
    }

    fn transition(&mut self, resource: &ResourceRef, before: AccessState, after: AccessState) -> RhiResult<()> {
        let src = conv::scope(before);
        let dst = conv::scope(after);
        // Present has no stages of its own; the acquire wait covers ALL_COMMANDS.
        let stages = |s: vk::PipelineStageFlags2| {
            if s.is_empty() {
                vk::PipelineStageFlags2::ALL_COMMANDS
            } else {
                s
            }
        };
        let cmd = self.cmd;

        match resource.raw() {
            RawResource::Buffer(buffer) => {
                let handle = lookup(&self.objects.buffers, buffer.0, "buffer")?.buffer;
                let barrier = [vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(stages(src.stages))
                    .src_access_mask(src.access)
                    .dst_stage_mask(stages(dst.stages))
                    .dst_access_mask(dst.access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(handle)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)];
                let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barrier);
                // SAFETY: the command buffer is recording.
                unsafe { self.raw().cmd_pipeline_barrier2(cmd, &dependency) };
            }
            RawResource::Texture(texture) => {
                let image = self
                    .objects
                    .images
                    .get_mut(&texture.0)
                    .ok_or_else(|| RhiError::InvalidHandle(format!("texture {} is not live", texture.0)))?;
                // Nothing worth keeping lives in an image no command has touched.
                let old_layout = if image.initialized {
                    src.layout
                } else {
                    vk::ImageLayout::UNDEFINED
                };
                image.initialized = true;
                let barrier = [vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(stages(src.stages))
                    .src_access_mask(src.access)
                    .dst_stage_mask(stages(dst.stages))
                    .dst_access_mask(dst.access)
                    .old_layout(old_layout)
                    .new_layout(dst.layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image.image)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(image.aspect())
                            .base_mip_level(0)
                            .level_count(vk::REMAINING_MIP_LEVELS)
                            .base_array_layer(0)
                            .layer_count(vk::REMAINING_ARRAY_LAYERS),
                    )];
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barrier);
                // SAFETY: as above.
                unsafe { self.ctx.device.handle().cmd_pipeline_barrier2(cmd, &dependency) };
            }
        }
        Ok(())
    }

    fn attachment(&self, view: RawView) -> RhiResult<Attachment> {
        let vk_view = lookup(&self.objects.views, view.0, "view")?;
        let (Some(image_view), RawResource::Texture(texture)) = (vk_view.image_view, vk_view.resource) else {
            return Err(RhiError::InvalidHandle(format!("view {} is not an attachment", view.0)));
        };
        let image = lookup(&self.objects.images, texture.0, "texture")?;
        Ok(Attachment {
            view: image_view,
            extent: vk::Extent2D {
                width: mip_extent(image.extent.width, vk_view.base_mip),
                height: mip_extent(image.extent.height, vk_view.base_mip),
            },
        })
    }

    fn clear(&mut self, view: RawView, value: vk::ClearValue, depth: bool) -> RhiResult<()> {
        self.end_rendering();
        let target = self.attachment(view)?;
        let layout = if depth {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        let attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(layout)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(value);
        let colors = [attachment];
        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: target.extent,
            })
            .layer_count(1);
        info = if depth {
            info.depth_attachment(&colors[0])
        } else {
            info.color_attachments(&colors)
        };
        // SAFETY: the attachment is in the layout its access state implies.
        unsafe {
            self.raw().cmd_begin_rendering(self.cmd, &info);
            self.raw().cmd_end_rendering(self.cmd);
        }
        Ok(())
    }

    fn begin_rendering(&mut self) -> RhiResult<()> {
        if self.rendering {
            return Ok(());
        }
        if self.colors.is_empty() && self.depth.is_none() {
            return Err(RhiError::contract("draw recorded without render targets"));
        }

        let mut extent = None;
        let mut colors = Vec::with_capacity(self.colors.len());
        for view in &self.colors {
            let target = self.attachment(*view)?;
            extent.get_or_insert(target.extent);
            colors.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(target.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE),
            );
        }
        let depth = match self.depth {
            Some(view) => {
                let target = self.attachment(view)?;
                extent.get_or_insert(target.extent);
                Some(
                    vk::RenderingAttachmentInfo::default()
                        .image_view(target.view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(vk::AttachmentLoadOp::LOAD)
                        .store_op(vk::AttachmentStoreOp::STORE),
                )
            }
            None => None,
        };

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: extent.unwrap_or_default(),
            })
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
        }
        // SAFETY: targets were validated against their states when recorded.
        unsafe { self.raw().cmd_begin_rendering(self.cmd, &info) };
        self.rendering = true;
        Ok(())
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            // SAFETY: paired with `begin_rendering`.
            unsafe { self.raw().cmd_end_rendering(self.cmd) };
            self.rendering = false;
        }
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        let vk_viewport = [vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        }];
        let scissor = [vk::Rect2D {
            offset: vk::Offset2D {
                x: viewport.x as i32,
                y: viewport.y as i32,
            },
            extent: vk::Extent2D {
                width: viewport.width as u32,
                height: viewport.height as u32,
            },
        }];
        // SAFETY: both are dynamic states of every graphics pipeline.
        unsafe {
            self.raw().cmd_set_viewport(self.cmd, 0, &vk_viewport);
            self.raw().cmd_set_scissor(self.cmd, 0, &scissor);
        }
    }
}

fn copy_regions(texture: &Texture, image: &VkImage, footprints: &[MipFootprint]) -> Vec<vk::BufferImageCopy> {
    let bytes_per_texel = texture.format().bytes_per_texel();
    footprints
        .iter()
        .map(|footprint| vk::BufferImageCopy {
            buffer_offset: footprint.offset,
            buffer_row_length: footprint.row_length_texels(bytes_per_texel),
            buffer_image_height: footprint.height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: image.aspect(),
                mip_level: footprint.mip,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: footprint.width,
                height: footprint.height,
                depth: 1,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_reports_missing_objects() {
        let mut map = HashMap::new();
        map.insert(7u64, "seven");
        assert_eq!(*lookup(&map, 7, "thing").unwrap(), "seven");
        match lookup(&map, 8, "thing") {
            Err(RhiError::InvalidHandle(message)) => assert_eq!(message, "thing 8 is not live"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
