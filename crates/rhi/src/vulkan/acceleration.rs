//! Acceleration structure geometry, sizing and builds (`VK_KHR_acceleration_structure`).

use ash::vk;

use crate::acceleration::{AccelerationStructureInputs, AccelerationStructureKind, AccelerationStructureSizes};
use crate::error::RhiResult;

pub(crate) struct VkAccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    /// Core id of the result buffer.
    pub buffer: u64,
    pub address: u64,
}

pub(crate) fn structure_type(kind: AccelerationStructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

/// Device addresses of the buffers a build reads, in [`AccelerationStructureInputs::input_buffers`] order.
/// All zero when only querying sizes.
pub(crate) fn geometry(
    inputs: &AccelerationStructureInputs,
    addresses: &[u64],
) -> vk::AccelerationStructureGeometryKHR<'static> {
    let address = |i: usize| vk::DeviceOrHostAddressConstKHR {
        device_address: addresses.get(i).copied().unwrap_or(0),
    };
    match inputs {
        AccelerationStructureInputs::BottomLevel {
            vertex_count,
            vertex_stride,
            indices,
            ..
        } => {
            let index_type = if indices.is_some() {
                vk::IndexType::UINT32
            } else {
                vk::IndexType::NONE_KHR
            };
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(address(0))
                .vertex_stride(u64::from(*vertex_stride))
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(index_type)
                .index_data(address(1));
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
        AccelerationStructureInputs::TopLevel { .. } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(address(0));
            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        }
    }
}

pub(crate) fn build_sizes(
    loader: &ash::khr::acceleration_structure::Device,
    inputs: &AccelerationStructureInputs,
) -> AccelerationStructureSizes {
    let geometries = [geometry(inputs, &[])];
    let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(structure_type(inputs.kind()))
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);
    let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
    // SAFETY: size queries read only the geometry description.
    unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &info,
            &[inputs.primitive_count()],
            &mut sizes,
        );
    }
    AccelerationStructureSizes {
        result: sizes.acceleration_structure_size,
        scratch: sizes.build_scratch_size,
    }
}

pub(crate) fn create(
    loader: &ash::khr::acceleration_structure::Device,
    kind: AccelerationStructureKind,
    buffer: vk::Buffer,
    buffer_id: u64,
    size: u64,
) -> RhiResult<VkAccelerationStructure> {
    let info = vk::AccelerationStructureCreateInfoKHR::default()
        .buffer(buffer)
        .offset(0)
        .size(size)
        .ty(structure_type(kind));
    // SAFETY: the buffer has acceleration-structure storage usage and outlives the structure.
    let handle = unsafe { loader.create_acceleration_structure(&info, None)? };
    let address_info =
        vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
    // SAFETY: the structure was just created.
    let address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };
    Ok(VkAccelerationStructure {
        handle,
        buffer: buffer_id,
        address,
    })
}

/// Records a full build of `dst` from `inputs`.
pub(crate) fn cmd_build(
    loader: &ash::khr::acceleration_structure::Device,
    cmd: vk::CommandBuffer,
    inputs: &AccelerationStructureInputs,
    input_addresses: &[u64],
    dst: vk::AccelerationStructureKHR,
    scratch_address: u64,
) {
    let geometries = [geometry(inputs, input_addresses)];
    let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(structure_type(inputs.kind()))
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .dst_acceleration_structure(dst)
        .geometries(&geometries)
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: scratch_address,
        });
    let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default()
        .primitive_count(inputs.primitive_count())];
    // SAFETY: all addresses belong to live buffers kept alive by the recording.
    unsafe { loader.cmd_build_acceleration_structures(cmd, &[info], &[&ranges]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structure_type() {
        assert_eq!(
            structure_type(AccelerationStructureKind::TopLevel),
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        );
        assert_eq!(
            structure_type(AccelerationStructureKind::BottomLevel),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        );
    }
}
