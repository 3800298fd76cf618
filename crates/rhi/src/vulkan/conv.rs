//! Translations from core types to Vulkan enums and flags.

use ash::vk;

use crate::format::Format;
use crate::state::AccessState;

pub(crate) fn format(format: Format) -> vk::Format {
    match format {
        Format::Unknown => vk::Format::UNDEFINED,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Inverse of [`format`] for the formats a surface may report.
pub(crate) fn format_from_vk(format: vk::Format) -> Format {
    match format {
        vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
        _ => Format::Unknown,
    }
}

pub(crate) fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Pipeline stages, accesses and image layout implied by one access state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AccessScope {
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

pub(crate) fn scope(state: AccessState) -> AccessScope {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;

    let shaders = S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER;
    let (stages, access, layout) = match state {
        AccessState::Common => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE, vk::ImageLayout::GENERAL),
        AccessState::ShaderRead => (
            shaders,
            A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        AccessState::UnorderedAccess => (
            shaders,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
            vk::ImageLayout::GENERAL,
        ),
        AccessState::RenderTarget => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ),
        AccessState::DepthWrite => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        AccessState::CopySource => (S::COPY, A::TRANSFER_READ, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
        AccessState::CopyDest => (S::COPY, A::TRANSFER_WRITE, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        AccessState::VertexOrConstantRead => (
            S::VERTEX_INPUT | shaders,
            A::INDEX_READ | A::UNIFORM_READ | A::SHADER_STORAGE_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ),
        AccessState::Present => (S::NONE, A::NONE, vk::ImageLayout::PRESENT_SRC_KHR),
        AccessState::AccelerationStructure => (
            S::ACCELERATION_STRUCTURE_BUILD_KHR | shaders,
            A::ACCELERATION_STRUCTURE_READ_KHR | A::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::ImageLayout::GENERAL,
        ),
    };
    AccessScope {
        stages,
        access,
        layout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_state_has_a_layout() {
        for state in AccessState::ALL {
            assert_ne!(scope(state).layout, vk::ImageLayout::UNDEFINED, "{}", state.name());
        }
    }

    #[test]
    fn test_write_states_carry_write_access() {
        let writes = vk::AccessFlags2::SHADER_STORAGE_WRITE
            | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            | vk::AccessFlags2::TRANSFER_WRITE
            | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR
            | vk::AccessFlags2::MEMORY_WRITE;
        for state in AccessState::ALL {
            if state.is_write() {
                assert!(scope(state).access.intersects(writes), "{}", state.name());
            }
        }
    }

    #[test]
    fn test_format_mapping() {
        assert_eq!(format(Format::Rgba8Unorm), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(format_from_vk(vk::Format::B8G8R8A8_SRGB), Format::Bgra8Srgb);
        assert_eq!(format_from_vk(vk::Format::A2B10G10R10_UNORM_PACK32), Format::Unknown);
        assert_eq!(
            aspect(Format::D24UnormS8Uint),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
