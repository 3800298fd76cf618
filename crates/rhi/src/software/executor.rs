//! Emulated GPU execution of encoded command lists.

use std::collections::HashMap;

use crate::acceleration::AccelerationStructureKind;
use crate::backend::{RawAccelerationStructure, RawBuffer, RawTexture};
use crate::command::Command;
use crate::error::{RhiError, RhiResult};
use crate::footprint::{MipFootprint, mip_extent};
use crate::resource::{ResourceRef, TextureDesc};
use crate::software::memory::{HostMemory, encode_color, encode_depth};

/// Magic written at the start of a built acceleration structure.
pub const ACCELERATION_STRUCTURE_MAGIC: [u8; 4] = *b"KBVH";

/// An encoded operation with every reference resolved to a raw id.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Barrier,
    Draw,
    Dispatch,
    CopyBuffer {
        dst: RawBuffer,
        dst_offset: u64,
        src: RawBuffer,
        src_offset: u64,
        size: u64,
    },
    BufferToTexture {
        dst: RawTexture,
        src: RawBuffer,
        footprints: Vec<MipFootprint>,
    },
    TextureToBuffer {
        dst: RawBuffer,
        src: RawTexture,
        footprints: Vec<MipFootprint>,
    },
    TextureToTexture {
        dst: RawTexture,
        src: RawTexture,
    },
    Clear {
        texture: RawTexture,
        mip: u32,
        texel: Vec<u8>,
    },
    Build {
        accel: RawAccelerationStructure,
        kind: AccelerationStructureKind,
        result: RawBuffer,
        primitives: u32,
    },
}

/// Translates recorded commands into ops.
pub(crate) fn encode(commands: &[Command]) -> Vec<Op> {
    let mut ops = Vec::with_capacity(commands.len());
    for command in commands {
        let op = match command {
            Command::Transition { .. } | Command::UavBarrier { .. } => Op::Barrier,
            Command::Draw { .. } | Command::DrawIndexed { .. } => Op::Draw,
            Command::Dispatch { .. } => Op::Dispatch,
            Command::CopyBufferToBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => Op::CopyBuffer {
                dst: dst.raw(),
                dst_offset: *dst_offset,
                src: src.raw(),
                src_offset: *src_offset,
                size: *size,
            },
            Command::CopyBufferToTexture {
                dst,
                src,
                footprints,
            } => Op::BufferToTexture {
                dst: dst.raw(),
                src: src.raw(),
                footprints: footprints.clone(),
            },
            Command::CopyTextureToBuffer {
                dst,
                src,
                footprints,
            } => Op::TextureToBuffer {
                dst: dst.raw(),
                src: src.raw(),
                footprints: footprints.clone(),
            },
            Command::CopyTextureToTexture { dst, src } => Op::TextureToTexture {
                dst: dst.raw(),
                src: src.raw(),
            },
            Command::ClearRenderTarget { view, color } => match view.resource() {
                ResourceRef::Texture(texture) => Op::Clear {
                    texture: texture.raw(),
                    mip: view.mip().unwrap_or(0),
                    texel: encode_color(view.format(), *color),
                },
                ResourceRef::Buffer(_) => continue,
            },
            Command::ClearDepth { view, depth } => match view.resource() {
                ResourceRef::Texture(texture) => Op::Clear {
                    texture: texture.raw(),
                    mip: view.mip().unwrap_or(0),
                    texel: encode_depth(view.format(), *depth),
                },
                ResourceRef::Buffer(_) => continue,
            },
            Command::BuildAccelerationStructure { accel, .. } => Op::Build {
                accel: accel.raw(),
                kind: accel.kind(),
                result: accel.result().raw(),
                primitives: accel.inputs().primitive_count(),
            },
            Command::SetRenderTargets { .. }
            | Command::SetViewport(_)
            | Command::SetPipeline(_)
            | Command::SetIndexBuffer { .. }
            | Command::PushConstants(_)
            | Command::BeginMarker(_)
            | Command::EndMarker => continue,
        };
        ops.push(op);
    }
    ops
}

/// Emulated device memory.
pub(crate) struct SoftBuffer {
    pub(crate) memory: HostMemory,
    pub(crate) size: u64,
    pub(crate) host_visible: bool,
}

pub(crate) struct SoftTexture {
    pub(crate) desc: TextureDesc,
    /// Tightly packed texels per mip.
    pub(crate) mips: Vec<HostMemory>,
}

impl SoftTexture {
    pub(crate) fn new(desc: TextureDesc) -> Self {
        let texel = desc.format.bytes_per_texel() as usize;
        let mips = (0..desc.mip_levels)
            .map(|mip| {
                let w = mip_extent(desc.width, mip) as usize;
                let h = mip_extent(desc.height, mip) as usize;
                HostMemory::zeroed(w * h * texel)
            })
            .collect();
        Self { desc, mips }
    }

    fn row_size(&self, mip: u32) -> usize {
        mip_extent(self.desc.width, mip) as usize * self.desc.format.bytes_per_texel() as usize
    }
}

/// Counters of executed work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub lists: u64,
    pub barriers: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub copies: u64,
    pub clears: u64,
    pub builds: u64,
}

pub(crate) struct Memory<'a> {
    pub(crate) buffers: &'a HashMap<u64, SoftBuffer>,
    pub(crate) textures: &'a HashMap<u64, SoftTexture>,
}

fn fault(message: String) -> RhiError {
    RhiError::DeviceLost(format!("software device fault: {message}"))
}

impl Memory<'_> {
    fn buffer(&self, raw: RawBuffer) -> RhiResult<&SoftBuffer> {
        self.buffers
            .get(&raw.0)
            .ok_or_else(|| fault(format!("buffer {} destroyed while in use", raw.0)))
    }

    fn texture(&self, raw: RawTexture) -> RhiResult<&SoftTexture> {
        self.textures
            .get(&raw.0)
            .ok_or_else(|| fault(format!("texture {} destroyed while in use", raw.0)))
    }

    /// Runs one op. Faults mean the recorded work was invalid and are fatal.
    pub(crate) fn execute(&self, op: &Op, stats: &mut ExecutionStats) -> RhiResult<()> {
        match op {
            Op::Barrier => stats.barriers += 1,
            Op::Draw => stats.draws += 1,
            Op::Dispatch => stats.dispatches += 1,
            Op::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                let (dst, src) = (self.buffer(*dst)?, self.buffer(*src)?);
                if src_offset + size > src.size || dst_offset + size > dst.size {
                    return Err(fault("buffer copy out of bounds".into()));
                }
                // SAFETY: ranges were bounds-checked; ptr::copy tolerates overlap.
                unsafe {
                    std::ptr::copy(
                        src.memory.ptr().as_ptr().add(*src_offset as usize),
                        dst.memory.ptr().as_ptr().add(*dst_offset as usize),
                        *size as usize,
                    );
                }
                stats.copies += 1;
            }
            Op::BufferToTexture {
                dst,
                src,
                footprints,
            } => {
                let (texture, buffer) = (self.texture(*dst)?, self.buffer(*src)?);
                for footprint in footprints {
                    self.walk_rows(texture, buffer, footprint, |tex_row, buf_row, len| {
                        // SAFETY: walk_rows bounds-checks both rows.
                        unsafe { std::ptr::copy_nonoverlapping(buf_row, tex_row, len) }
                    })?;
                }
                stats.copies += 1;
            }
            Op::TextureToBuffer {
                dst,
                src,
                footprints,
            } => {
                let (texture, buffer) = (self.texture(*src)?, self.buffer(*dst)?);
                for footprint in footprints {
                    self.walk_rows(texture, buffer, footprint, |tex_row, buf_row, len| {
                        // SAFETY: walk_rows bounds-checks both rows.
                        unsafe { std::ptr::copy_nonoverlapping(tex_row, buf_row, len) }
                    })?;
                }
                stats.copies += 1;
            }
            Op::TextureToTexture { dst, src } => {
                let (dst, src) = (self.texture(*dst)?, self.texture(*src)?);
                for (d, s) in dst.mips.iter().zip(&src.mips) {
                    if d.len() != s.len() {
                        return Err(fault("texture copy between different shapes".into()));
                    }
                    // SAFETY: equal lengths; distinct textures never overlap.
                    unsafe { std::ptr::copy(s.ptr().as_ptr(), d.ptr().as_ptr(), s.len()) }
                }
                stats.copies += 1;
            }
            Op::Clear {
                texture,
                mip,
                texel,
            } => {
                let texture = self.texture(*texture)?;
                let memory = texture
                    .mips
                    .get(*mip as usize)
                    .ok_or_else(|| fault(format!("clear of missing mip {mip}")))?;
                if !texel.is_empty() {
                    // SAFETY: exclusive access under the backend lock.
                    let bytes = unsafe {
                        std::slice::from_raw_parts_mut(memory.ptr().as_ptr(), memory.len())
                    };
                    for chunk in bytes.chunks_exact_mut(texel.len()) {
                        chunk.copy_from_slice(texel);
                    }
                }
                stats.clears += 1;
            }
            Op::Build {
                kind,
                result,
                primitives,
                ..
            } => {
                let buffer = self.buffer(*result)?;
                let mut header = Vec::with_capacity(12);
                header.extend_from_slice(&ACCELERATION_STRUCTURE_MAGIC);
                let kind_tag: u32 = match kind {
                    AccelerationStructureKind::BottomLevel => 0,
                    AccelerationStructureKind::TopLevel => 1,
                };
                header.extend_from_slice(&kind_tag.to_le_bytes());
                header.extend_from_slice(&primitives.to_le_bytes());
                if (buffer.size as usize) < header.len() {
                    return Err(fault("acceleration structure buffer too small".into()));
                }
                // SAFETY: size checked above.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        header.as_ptr(),
                        buffer.memory.ptr().as_ptr(),
                        header.len(),
                    )
                }
                stats.builds += 1;
            }
        }
        Ok(())
    }

    /// Calls `copy(texture_row, buffer_row, row_size)` for every row of a footprint.
    fn walk_rows(
        &self,
        texture: &SoftTexture,
        buffer: &SoftBuffer,
        footprint: &MipFootprint,
        mut copy: impl FnMut(*mut u8, *mut u8, usize),
    ) -> RhiResult<()> {
        let mip = footprint.mip;
        let memory = texture
            .mips
            .get(mip as usize)
            .ok_or_else(|| fault(format!("copy of missing mip {mip}")))?;
        let row_size = texture.row_size(mip);
        if footprint.row_size as usize != row_size
            || footprint.row_count != mip_extent(texture.desc.height, mip)
        {
            return Err(fault(format!("footprint does not match mip {mip}")));
        }
        if footprint.offset + footprint.span() > buffer.size {
            return Err(fault(format!("mip {mip} footprint overruns buffer")));
        }

        for row in 0..footprint.row_count {
            let buffer_offset = footprint.row_offset(row) as usize;
            let texture_offset = row as usize * row_size;
            // SAFETY: offsets are within the checked spans above.
            unsafe {
                copy(
                    memory.ptr().as_ptr().add(texture_offset),
                    buffer.memory.ptr().as_ptr().add(buffer_offset),
                    row_size,
                );
            }
        }
        Ok(())
    }
}
