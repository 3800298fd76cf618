//! Pipeline creation against the shared bindless layout.
//!
//! Graphics pipelines use dynamic rendering (no render pass objects) and
//! take viewport and scissor as dynamic state. There is no vertex input:
//! shaders fetch vertices from storage buffers through the bindless set.

use std::ffi::CString;

use ash::vk;
use tracing::debug;

use crate::error::{RhiError, RhiResult};
use crate::pipeline::{
    ComputePipelineDesc, CullMode, FillMode, GraphicsPipelineDesc, PipelineDesc, PrimitiveTopology,
    ShaderBytecode,
};
use crate::view::CompareOp;
use crate::vulkan::conv;

pub(crate) struct VkPipeline {
    pub pipeline: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
}

fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

fn cull_mode(cull: CullMode) -> vk::CullModeFlags {
    match cull {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

fn polygon_mode(fill: FillMode) -> vk::PolygonMode {
    match fill {
        FillMode::Solid => vk::PolygonMode::FILL,
        FillMode::Wireframe => vk::PolygonMode::LINE,
    }
}

fn depth_compare(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

fn blend_attachment(alpha_blend: bool) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    if !alpha_blend {
        return state.blend_enable(false);
    }
    state
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
}

struct Module {
    module: vk::ShaderModule,
    entry: CString,
}

fn create_module(device: &ash::Device, shader: &ShaderBytecode) -> RhiResult<Module> {
    let entry = CString::new(shader.entry())
        .map_err(|_| RhiError::ShaderError(format!("entry point {:?} contains NUL", shader.entry())))?;
    let info = vk::ShaderModuleCreateInfo::default().code(shader.words());
    // SAFETY: the words were checked for the SPIR-V magic.
    let module = unsafe { device.create_shader_module(&info, None) }
        .map_err(|e| RhiError::ShaderError(format!("shader module creation failed: {e:?}")))?;
    Ok(Module { module, entry })
}

/// Creates a pipeline. Shader modules are destroyed before returning.
pub(crate) fn create_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &PipelineDesc,
) -> RhiResult<VkPipeline> {
    let mut modules = Vec::with_capacity(2);
    let result = match desc {
        PipelineDesc::Graphics(graphics) => create_graphics(device, layout, graphics, &mut modules),
        PipelineDesc::Compute(compute) => create_compute(device, layout, compute, &mut modules),
    };
    for module in modules {
        // SAFETY: modules are not referenced once the pipeline exists.
        unsafe { device.destroy_shader_module(module.module, None) };
    }
    result
}

fn create_graphics(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &GraphicsPipelineDesc,
    modules: &mut Vec<Module>,
) -> RhiResult<VkPipeline> {
    modules.push(create_module(device, &desc.vertex)?);
    if let Some(fragment) = &desc.fragment {
        modules.push(create_module(device, fragment)?);
    }

    let stage_flags = [vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT];
    let stages: Vec<vk::PipelineShaderStageCreateInfo> = modules
        .iter()
        .zip(stage_flags)
        .map(|(module, stage)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage)
                .module(module.module)
                .name(&module.entry)
        })
        .collect();

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(topology(desc.topology));
    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(polygon_mode(desc.fill))
        .cull_mode(cull_mode(desc.cull))
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let has_depth = desc.depth_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(has_depth && desc.depth.test)
        .depth_write_enable(has_depth && desc.depth.write)
        .depth_compare_op(depth_compare(desc.depth.compare));
    let attachments = vec![blend_attachment(desc.alpha_blend); desc.color_formats.len()];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc.color_formats.iter().map(|f| conv::format(*f)).collect();
    let depth_format = desc.depth_format.map(conv::format).unwrap_or(vk::Format::UNDEFINED);
    let stencil_format = match desc.depth_format {
        Some(format) if format.has_stencil() => depth_format,
        _ => vk::Format::UNDEFINED,
    };
    let mut rendering = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format)
        .stencil_attachment_format(stencil_format);

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(layout)
        .push_next(&mut rendering);

    // SAFETY: every referenced struct lives until the call returns.
    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
    }
    .map_err(|(_, e)| RhiError::PipelineError(format!("'{}': {e:?}", desc.name)))?;

    debug!(
        "Graphics pipeline '{}' ({} color targets, depth {:?})",
        desc.name,
        color_formats.len(),
        desc.depth_format
    );
    pipelines
        .into_iter()
        .next()
        .map(|pipeline| VkPipeline {
            pipeline,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
        .ok_or_else(|| RhiError::PipelineError(format!("'{}': driver returned no pipeline", desc.name)))
}

fn create_compute(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &ComputePipelineDesc,
    modules: &mut Vec<Module>,
) -> RhiResult<VkPipeline> {
    modules.push(create_module(device, &desc.shader)?);
    let module = &modules[0];
    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module.module)
        .name(&module.entry);
    let info = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);

    // SAFETY: as above.
    let pipelines = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
    }
    .map_err(|(_, e)| RhiError::PipelineError(format!("'{}': {e:?}", desc.name)))?;

    debug!("Compute pipeline '{}'", desc.name);
    pipelines
        .into_iter()
        .next()
        .map(|pipeline| VkPipeline {
            pipeline,
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
        .ok_or_else(|| RhiError::PipelineError(format!("'{}': driver returned no pipeline", desc.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_states() {
        let opaque = blend_attachment(false);
        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(opaque.color_write_mask, vk::ColorComponentFlags::RGBA);

        let blended = blend_attachment(true);
        assert_eq!(blended.blend_enable, vk::TRUE);
        assert_eq!(blended.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(cull_mode(CullMode::None), vk::CullModeFlags::NONE);
        assert_eq!(polygon_mode(FillMode::Wireframe), vk::PolygonMode::LINE);
        assert_eq!(topology(PrimitiveTopology::LineList), vk::PrimitiveTopology::LINE_LIST);
        assert_eq!(depth_compare(CompareOp::LessEqual), vk::CompareOp::LESS_OR_EQUAL);
    }
}
