//! Ray-tracing acceleration structures.
//!
//! A structure owns a result buffer (kept in
//! [`AccessState::AccelerationStructure`]) and, until [`AccelerationStructure::release_scratch`]
//! is called, a scratch buffer used by the build. Builds are recorded through
//! [`CommandRecorder::build_acceleration_structure`](crate::command::CommandRecorder::build_acceleration_structure),
//! usually by the uploader.

use std::sync::{Arc, Mutex};

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::backend::RawAccelerationStructure;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::resource::{Buffer, BufferDesc, BufferKind, Resource};
use crate::state::AccessState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// Geometry or instances a structure is built from.
#[derive(Debug, Clone)]
pub enum AccelerationStructureInputs {
    /// Triangles with `R32G32B32_FLOAT` positions.
    BottomLevel {
        vertices: Arc<Buffer>,
        vertex_count: u32,
        vertex_stride: u32,
        /// 32-bit indices; `None` for non-indexed triangle lists.
        indices: Option<Arc<Buffer>>,
        index_count: u32,
    },
    /// An array of [`AccelerationStructureInstance`].
    TopLevel {
        instances: Arc<Buffer>,
        instance_count: u32,
    },
}

impl AccelerationStructureInputs {
    pub fn kind(&self) -> AccelerationStructureKind {
        match self {
            AccelerationStructureInputs::BottomLevel { .. } => AccelerationStructureKind::BottomLevel,
            AccelerationStructureInputs::TopLevel { .. } => AccelerationStructureKind::TopLevel,
        }
    }

    /// Triangles for bottom level, instances for top level.
    pub fn primitive_count(&self) -> u32 {
        match self {
            AccelerationStructureInputs::BottomLevel {
                vertex_count,
                indices,
                index_count,
                ..
            } => {
                if indices.is_some() {
                    index_count / 3
                } else {
                    vertex_count / 3
                }
            }
            AccelerationStructureInputs::TopLevel { instance_count, .. } => *instance_count,
        }
    }

    /// Buffers the build reads.
    pub fn input_buffers(&self) -> Vec<&Arc<Buffer>> {
        match self {
            AccelerationStructureInputs::BottomLevel {
                vertices, indices, ..
            } => std::iter::once(vertices).chain(indices.iter()).collect(),
            AccelerationStructureInputs::TopLevel { instances, .. } => vec![instances],
        }
    }

    fn validate(&self) -> RhiResult<()> {
        match self {
            AccelerationStructureInputs::BottomLevel {
                vertices,
                vertex_count,
                vertex_stride,
                indices,
                index_count,
            } => {
                if *vertex_stride < 12 {
                    return Err(RhiError::contract(format!(
                        "vertex stride {} is smaller than a float3 position",
                        vertex_stride
                    )));
                }
                if u64::from(*vertex_count) * u64::from(*vertex_stride) > vertices.size() {
                    return Err(RhiError::contract(format!(
                        "{} vertices overrun '{}'",
                        vertex_count,
                        vertices.name()
                    )));
                }
                if let Some(indices) = indices
                    && u64::from(*index_count) * 4 > indices.size()
                {
                    return Err(RhiError::contract(format!(
                        "{} indices overrun '{}'",
                        index_count,
                        indices.name()
                    )));
                }
            }
            AccelerationStructureInputs::TopLevel {
                instances,
                instance_count,
            } => {
                let needed = u64::from(*instance_count) * size_of::<AccelerationStructureInstance>() as u64;
                if needed > instances.size() {
                    return Err(RhiError::contract(format!(
                        "{} instances overrun '{}'",
                        instance_count,
                        instances.name()
                    )));
                }
            }
        }
        if self.primitive_count() == 0 {
            return Err(RhiError::contract("acceleration structure with no primitives"));
        }
        Ok(())
    }
}

/// Sizes a backend needs to build a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationStructureSizes {
    pub result: u64,
    pub scratch: u64,
}

/// One instance of a bottom-level structure inside a top-level one.
///
/// Matches the 64-byte layout both D3D12 and Vulkan consume.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccelerationStructureInstance {
    /// Row-major 3x4 transform.
    pub transform: [f32; 12],
    /// Custom index (low 24 bits) and visibility mask (high 8 bits).
    pub id_and_mask: u32,
    /// Hit group offset (low 24 bits) and flags (high 8 bits).
    pub offset_and_flags: u32,
    /// Device address of the bottom-level structure.
    pub blas_address: u64,
}

impl AccelerationStructureInstance {
    /// Identity transform, full mask.
    pub const IDENTITY: [f32; 12] = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    /// An instance of `blas` with `transform`.
    pub fn new(blas: &AccelerationStructure, transform: [f32; 12], id: u32, mask: u8) -> Self {
        Self {
            transform,
            id_and_mask: (id & 0x00FF_FFFF) | (u32::from(mask) << 24),
            offset_and_flags: 0,
            blas_address: blas.address(),
        }
    }
}

/// A bottom- or top-level acceleration structure.
pub struct AccelerationStructure {
    device: Arc<Device>,
    raw: RawAccelerationStructure,
    name: String,
    inputs: AccelerationStructureInputs,
    result: Arc<Buffer>,
    scratch: Mutex<Option<Arc<Buffer>>>,
}

impl AccelerationStructure {
    /// Allocates result and scratch storage. Prefer [`Device::create_acceleration_structure`].
    pub fn new(
        device: &Arc<Device>,
        inputs: AccelerationStructureInputs,
        name: &str,
    ) -> RhiResult<Arc<Self>> {
        inputs.validate()?;
        let sizes = device.backend().acceleration_structure_sizes(&inputs)?;

        let result = Buffer::new(
            device,
            BufferDesc {
                name: format!("{name} (result)"),
                size: sizes.result,
                stride: 0,
                kind: BufferKind::AccelerationStructure,
            },
        )?;
        // Result storage lives in this state for its whole life.
        result.state_cell().set(AccessState::AccelerationStructure);

        let scratch = Buffer::new(
            device,
            BufferDesc {
                name: format!("{name} (scratch)"),
                size: sizes.scratch.max(1),
                stride: 0,
                kind: BufferKind::Scratch,
            },
        )?;
        scratch.state_cell().set(AccessState::UnorderedAccess);

        let raw =
            device
                .backend()
                .create_acceleration_structure(inputs.kind(), result.raw(), sizes.result)?;

        debug!(
            "Created {:?} acceleration structure '{}' ({} primitives, {} + {} bytes)",
            inputs.kind(),
            name,
            inputs.primitive_count(),
            sizes.result,
            sizes.scratch
        );

        Ok(Arc::new(Self {
            device: Arc::clone(device),
            raw,
            name: name.to_string(),
            inputs,
            result,
            scratch: Mutex::new(Some(scratch)),
        }))
    }

    #[inline]
    pub fn kind(&self) -> AccelerationStructureKind {
        self.inputs.kind()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn inputs(&self) -> &AccelerationStructureInputs {
        &self.inputs
    }

    /// The buffer holding the built structure.
    #[inline]
    pub fn result(&self) -> &Arc<Buffer> {
        &self.result
    }

    /// The scratch buffer, if not yet released.
    pub fn scratch(&self) -> Option<Arc<Buffer>> {
        self.scratch.lock().ok().and_then(|s| s.clone())
    }

    /// Drops this structure's reference to its scratch buffer.
    ///
    /// Recorders that built the structure keep their own reference until
    /// they are reset, so this is safe to call right after a flush.
    pub fn release_scratch(&self) {
        if let Ok(mut scratch) = self.scratch.lock()
            && scratch.take().is_some()
        {
            debug!("Released scratch of '{}'", self.name);
        }
    }

    /// Device address for instance descriptions.
    pub fn address(&self) -> u64 {
        self.device.backend().acceleration_structure_address(self.raw)
    }

    #[inline]
    pub fn raw(&self) -> RawAccelerationStructure {
        self.raw
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        self.device.backend().destroy_acceleration_structure(self.raw);
        debug!("Destroyed acceleration structure '{}'", self.name);
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("primitives", &self.inputs.primitive_count())
            .field("scratch", &self.scratch().is_some())
            .finish()
    }
}

impl From<&Arc<AccelerationStructure>> for crate::resource::ResourceRef {
    fn from(accel: &Arc<AccelerationStructure>) -> Self {
        crate::resource::ResourceRef::Buffer(Arc::clone(&accel.result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_layout() {
        assert_eq!(size_of::<AccelerationStructureInstance>(), 64);
    }
}
