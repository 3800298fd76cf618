//! Command recording and the barrier layer.
//!
//! A [`CommandRecorder`] is an append-only list of [`Command`]s bound to one
//! queue kind. Barrier requests go through [`plan_barrier`], so the stored
//! [`AccessState`] of every resource always matches what the GPU will see
//! when the next recorded command runs.
//!
//! Recorded commands hold `Arc`s of everything they touch. Resources
//! therefore stay alive until the recorder is begun again, which only
//! happens after the fence guarding its last submission has signaled.
//!
//! A recording that is thrown away before submission ([`CommandRecorder::reset`],
//! or dropping a recorder mid-recording) undoes its transitions on the
//! stored states, since the GPU never executes them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel_rhi::{AccessState, CommandRecorder, QueueKind};
//! use keel_rhi::device::Device;
//! use keel_rhi::resource::{Buffer, BufferKind};
//!
//! # fn example(device: Arc<Device>, src: Arc<Buffer>, dst: Arc<Buffer>) -> Result<(), keel_rhi::RhiError> {
//! let mut recorder = CommandRecorder::new(&device, QueueKind::Graphics, "copy")?;
//! recorder.begin()?;
//! recorder.barrier(&src, AccessState::CopySource)?;
//! recorder.barrier(&dst, AccessState::CopyDest)?;
//! recorder.copy_buffer_to_buffer(&dst, 0, &src, 0, 256)?;
//! recorder.end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, trace};

use crate::acceleration::AccelerationStructure;
use crate::backend::RawCommandList;
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::footprint::MipFootprint;
use crate::pipeline::{Pipeline, PipelineKind};
use crate::queue::QueueKind;
use crate::resource::{Buffer, BufferKind, Resource, ResourceRef, Texture};
use crate::state::{AccessState, BarrierOutcome, plan_barrier};
use crate::view::{View, ViewKind};

/// Viewport rectangle; the scissor always matches it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-depth viewport covering `width` x `height` from the origin.
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Index element size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

/// One recorded GPU command.
#[derive(Debug, Clone)]
pub enum Command {
    Transition {
        resource: ResourceRef,
        before: AccessState,
        after: AccessState,
    },
    UavBarrier {
        resource: ResourceRef,
    },
    ClearRenderTarget {
        view: Arc<View>,
        color: [f32; 4],
    },
    ClearDepth {
        view: Arc<View>,
        depth: f32,
    },
    SetRenderTargets {
        colors: Vec<Arc<View>>,
        depth: Option<Arc<View>>,
    },
    SetViewport(Viewport),
    SetPipeline(Arc<Pipeline>),
    SetIndexBuffer {
        buffer: Arc<Buffer>,
        format: IndexFormat,
    },
    PushConstants(Vec<u8>),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBufferToBuffer {
        dst: Arc<Buffer>,
        dst_offset: u64,
        src: Arc<Buffer>,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        dst: Arc<Texture>,
        src: Arc<Buffer>,
        footprints: Vec<MipFootprint>,
    },
    CopyTextureToBuffer {
        dst: Arc<Buffer>,
        src: Arc<Texture>,
        footprints: Vec<MipFootprint>,
    },
    CopyTextureToTexture {
        dst: Arc<Texture>,
        src: Arc<Texture>,
    },
    BuildAccelerationStructure {
        accel: Arc<AccelerationStructure>,
        scratch: Arc<Buffer>,
    },
    BeginMarker(String),
    EndMarker,
}

/// Lifecycle of a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// Created, never begun.
    Initial,
    /// Between `begin` and `end`.
    Recording,
    /// Ended and ready to submit.
    Closed,
}

/// Counters for one recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub draws: u32,
    pub dispatches: u32,
    pub transitions: u32,
    pub uav_barriers: u32,
    pub elided_barriers: u32,
    pub copies: u32,
}

/// Records commands for one queue.
pub struct CommandRecorder {
    device: Arc<Device>,
    queue: QueueKind,
    raw: RawCommandList,
    name: String,
    state: RecorderState,
    commands: Vec<Command>,
    stats: RecorderStats,
    marker_depth: u32,
    end_failed: bool,
}

impl CommandRecorder {
    /// Creates a recorder for `queue`.
    pub fn new(device: &Arc<Device>, queue: QueueKind, name: &str) -> RhiResult<Self> {
        let raw = device.backend().create_command_list(queue, name)?;
        debug!("Created {:?} command recorder '{}'", queue, name);

        Ok(Self {
            device: Arc::clone(device),
            queue,
            raw,
            name: name.to_string(),
            state: RecorderState::Initial,
            commands: Vec::new(),
            stats: RecorderStats::default(),
            marker_depth: 0,
            end_failed: false,
        })
    }

    /// Resets the recorder and starts a new recording.
    ///
    /// Releases every resource reference held by the previous recording.
    /// Only valid once the GPU has finished with the previous submission.
    /// A recording whose `end` failed is discarded as by [`reset`](Self::reset).
    pub fn begin(&mut self) -> RhiResult<()> {
        if self.state == RecorderState::Recording {
            if !self.end_failed {
                return Err(RhiError::contract(format!(
                    "recorder '{}' begun twice",
                    self.name
                )));
            }
            self.rollback_transitions();
        }
        self.device.backend().reset_command_list(self.raw)?;
        self.clear();
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Finalizes the recording for submission.
    ///
    /// On failure the recorder stays `Recording`, so the caller may fix the
    /// problem and end again, or discard the recording with `begin`/`reset`.
    pub fn end(&mut self) -> RhiResult<()> {
        self.ensure_recording("end")?;
        if self.marker_depth != 0 {
            self.end_failed = true;
            return Err(RhiError::contract(format!(
                "recorder '{}' ended with {} open marker(s)",
                self.name, self.marker_depth
            )));
        }
        if let Err(e) = self
            .device
            .backend()
            .encode_command_list(self.raw, &self.commands)
        {
            self.end_failed = true;
            return Err(e);
        }
        self.end_failed = false;
        self.state = RecorderState::Closed;
        trace!(
            "Closed recorder '{}' with {} commands",
            self.name,
            self.commands.len()
        );
        Ok(())
    }

    /// Discards the current recording without submitting it.
    ///
    /// Transitions recorded since `begin` are undone, newest first, so each
    /// resource's stored state again matches the GPU. Must not be called on a
    /// recording that was already submitted.
    pub fn reset(&mut self) {
        if self.state == RecorderState::Initial {
            return;
        }
        self.rollback_transitions();
        self.clear();
        self.state = RecorderState::Initial;
        debug!("Discarded recording of '{}'", self.name);
    }

    /// Requests that `resource` be in `target` before the next command.
    ///
    /// Emits a transition, a UAV-hazard barrier or nothing, see
    /// [`plan_barrier`]. The resource's stored state is updated on transition.
    pub fn barrier(
        &mut self,
        resource: impl Into<ResourceRef>,
        target: AccessState,
    ) -> RhiResult<BarrierOutcome> {
        self.ensure_recording("barrier")?;
        let resource = resource.into();
        let outcome = plan_barrier(resource.state(), target);

        match outcome {
            BarrierOutcome::Transition { before, after } => {
                resource.state_cell().set(after);
                self.stats.transitions += 1;
                self.commands.push(Command::Transition {
                    resource,
                    before,
                    after,
                });
            }
            BarrierOutcome::UavHazard => {
                self.stats.uav_barriers += 1;
                self.commands.push(Command::UavBarrier { resource });
            }
            BarrierOutcome::Elided => {
                self.stats.elided_barriers += 1;
            }
        }
        Ok(outcome)
    }

    /// Orders unordered accesses to `resource` regardless of its state.
    pub fn uav_barrier(&mut self, resource: impl Into<ResourceRef>) -> RhiResult<()> {
        self.ensure_recording("uav_barrier")?;
        self.stats.uav_barriers += 1;
        self.commands.push(Command::UavBarrier {
            resource: resource.into(),
        });
        Ok(())
    }

    /// Clears a render target view; its texture must be in `RenderTarget`.
    pub fn clear_render_target(&mut self, view: &Arc<View>, color: [f32; 4]) -> RhiResult<()> {
        self.ensure_recording("clear_render_target")?;
        self.ensure_view(view, ViewKind::RenderTarget, AccessState::RenderTarget)?;
        self.commands.push(Command::ClearRenderTarget {
            view: Arc::clone(view),
            color,
        });
        Ok(())
    }

    /// Clears a depth target view; its texture must be in `DepthWrite`.
    pub fn clear_depth(&mut self, view: &Arc<View>, depth: f32) -> RhiResult<()> {
        self.ensure_recording("clear_depth")?;
        self.ensure_view(view, ViewKind::DepthTarget, AccessState::DepthWrite)?;
        self.commands.push(Command::ClearDepth {
            view: Arc::clone(view),
            depth,
        });
        Ok(())
    }

    /// Binds color and depth targets for subsequent draws.
    pub fn set_render_targets(
        &mut self,
        colors: &[&Arc<View>],
        depth: Option<&Arc<View>>,
    ) -> RhiResult<()> {
        self.ensure_recording("set_render_targets")?;
        self.ensure_graphics("set_render_targets")?;
        for view in colors {
            self.ensure_view(view, ViewKind::RenderTarget, AccessState::RenderTarget)?;
        }
        if let Some(view) = depth {
            self.ensure_view(view, ViewKind::DepthTarget, AccessState::DepthWrite)?;
        }
        self.commands.push(Command::SetRenderTargets {
            colors: colors.iter().map(|v| Arc::clone(v)).collect(),
            depth: depth.cloned(),
        });
        Ok(())
    }

    /// Sets the viewport and a matching scissor. Negative extents are ignored.
    pub fn set_viewport(&mut self, viewport: Viewport) -> RhiResult<()> {
        self.ensure_recording("set_viewport")?;
        if viewport.width >= 0.0 && viewport.height >= 0.0 {
            self.commands.push(Command::SetViewport(viewport));
        }
        Ok(())
    }

    /// Binds a pipeline.
    pub fn set_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> RhiResult<()> {
        self.ensure_recording("set_pipeline")?;
        if pipeline.kind() == PipelineKind::Graphics {
            self.ensure_graphics("set_pipeline")?;
        } else if self.queue == QueueKind::Copy {
            return Err(RhiError::contract(format!(
                "compute pipeline '{}' bound on copy recorder '{}'",
                pipeline.name(),
                self.name
            )));
        }
        self.commands.push(Command::SetPipeline(Arc::clone(pipeline)));
        Ok(())
    }

    /// Binds an index buffer; it must be in `VertexOrConstantRead`.
    pub fn set_index_buffer(&mut self, buffer: &Arc<Buffer>, format: IndexFormat) -> RhiResult<()> {
        self.ensure_recording("set_index_buffer")?;
        self.ensure_graphics("set_index_buffer")?;
        if buffer.kind() != BufferKind::Index {
            return Err(RhiError::contract(format!(
                "'{}' is a {} buffer, not an index buffer",
                buffer.name(),
                buffer.kind().name()
            )));
        }
        ensure_state(buffer.as_ref(), AccessState::VertexOrConstantRead)?;
        self.commands.push(Command::SetIndexBuffer {
            buffer: Arc::clone(buffer),
            format,
        });
        Ok(())
    }

    /// Uploads push constants for the bound pipeline.
    pub fn push_constants(&mut self, data: &[u8]) -> RhiResult<()> {
        self.ensure_recording("push_constants")?;
        self.commands.push(Command::PushConstants(data.to_vec()));
        Ok(())
    }

    /// Draws non-indexed geometry.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.ensure_recording("draw")?;
        self.ensure_graphics("draw")?;
        self.stats.draws += 1;
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    /// Draws indexed geometry from the bound index buffer.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.ensure_recording("draw_indexed")?;
        self.ensure_graphics("draw_indexed")?;
        self.stats.draws += 1;
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        Ok(())
    }

    /// Dispatches compute work groups.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RhiResult<()> {
        self.ensure_recording("dispatch")?;
        if self.queue == QueueKind::Copy {
            return Err(RhiError::contract(format!(
                "dispatch on copy recorder '{}'",
                self.name
            )));
        }
        self.stats.dispatches += 1;
        self.commands.push(Command::Dispatch { x, y, z });
        Ok(())
    }

    /// Copies `size` bytes between buffers.
    ///
    /// `src` must be in `CopySource` and `dst` in `CopyDest`.
    pub fn copy_buffer_to_buffer(
        &mut self,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        src: &Arc<Buffer>,
        src_offset: u64,
        size: u64,
    ) -> RhiResult<()> {
        self.ensure_recording("copy_buffer_to_buffer")?;
        ensure_state(src.as_ref(), AccessState::CopySource)?;
        ensure_state(dst.as_ref(), AccessState::CopyDest)?;
        ensure_range(src, src_offset, size)?;
        ensure_range(dst, dst_offset, size)?;

        self.stats.copies += 1;
        self.commands.push(Command::CopyBufferToBuffer {
            dst: Arc::clone(dst),
            dst_offset,
            src: Arc::clone(src),
            src_offset,
            size,
        });
        Ok(())
    }

    /// Copies mips laid out by `footprints` from a buffer into a texture.
    pub fn copy_buffer_to_texture(
        &mut self,
        dst: &Arc<Texture>,
        src: &Arc<Buffer>,
        footprints: &[MipFootprint],
    ) -> RhiResult<()> {
        self.ensure_recording("copy_buffer_to_texture")?;
        ensure_state(src.as_ref(), AccessState::CopySource)?;
        ensure_state(dst.as_ref(), AccessState::CopyDest)?;
        ensure_footprints(dst, src, footprints)?;

        self.stats.copies += 1;
        self.commands.push(Command::CopyBufferToTexture {
            dst: Arc::clone(dst),
            src: Arc::clone(src),
            footprints: footprints.to_vec(),
        });
        Ok(())
    }

    /// Copies texture mips into a buffer laid out by `footprints`.
    pub fn copy_texture_to_buffer(
        &mut self,
        dst: &Arc<Buffer>,
        src: &Arc<Texture>,
        footprints: &[MipFootprint],
    ) -> RhiResult<()> {
        self.ensure_recording("copy_texture_to_buffer")?;
        ensure_state(src.as_ref(), AccessState::CopySource)?;
        ensure_state(dst.as_ref(), AccessState::CopyDest)?;
        ensure_footprints(src, dst, footprints)?;

        self.stats.copies += 1;
        self.commands.push(Command::CopyTextureToBuffer {
            dst: Arc::clone(dst),
            src: Arc::clone(src),
            footprints: footprints.to_vec(),
        });
        Ok(())
    }

    /// Copies every mip of `src` into `dst`; extents and formats must match.
    pub fn copy_texture_to_texture(&mut self, dst: &Arc<Texture>, src: &Arc<Texture>) -> RhiResult<()> {
        self.ensure_recording("copy_texture_to_texture")?;
        ensure_state(src.as_ref(), AccessState::CopySource)?;
        ensure_state(dst.as_ref(), AccessState::CopyDest)?;
        let (s, d) = (src.desc(), dst.desc());
        if (s.width, s.height, s.mip_levels, s.format) != (d.width, d.height, d.mip_levels, d.format) {
            return Err(RhiError::contract(format!(
                "texture copy '{}' -> '{}' with mismatched shapes",
                s.name, d.name
            )));
        }

        self.stats.copies += 1;
        self.commands.push(Command::CopyTextureToTexture {
            dst: Arc::clone(dst),
            src: Arc::clone(src),
        });
        Ok(())
    }

    /// Builds an acceleration structure from its inputs.
    ///
    /// Inputs must be in `ShaderRead`; the scratch buffer must not have been released.
    pub fn build_acceleration_structure(&mut self, accel: &Arc<AccelerationStructure>) -> RhiResult<()> {
        self.ensure_recording("build_acceleration_structure")?;
        if self.queue == QueueKind::Copy {
            return Err(RhiError::contract(format!(
                "acceleration structure build on copy recorder '{}'",
                self.name
            )));
        }
        for input in accel.inputs().input_buffers() {
            ensure_state(input.as_ref(), AccessState::ShaderRead)?;
        }
        let scratch = accel.scratch().ok_or_else(|| {
            RhiError::contract(format!(
                "'{}' is being built after its scratch buffer was released",
                accel.name()
            ))
        })?;

        self.commands.push(Command::BuildAccelerationStructure {
            accel: Arc::clone(accel),
            scratch,
        });
        Ok(())
    }

    /// Opens a named debug region.
    pub fn begin_marker(&mut self, name: &str) -> RhiResult<()> {
        self.ensure_recording("begin_marker")?;
        self.marker_depth += 1;
        self.commands.push(Command::BeginMarker(name.to_string()));
        Ok(())
    }

    /// Closes the innermost debug region.
    pub fn end_marker(&mut self) -> RhiResult<()> {
        self.ensure_recording("end_marker")?;
        if self.marker_depth == 0 {
            return Err(RhiError::contract(format!(
                "end_marker without an open marker on '{}'",
                self.name
            )));
        }
        self.marker_depth -= 1;
        self.commands.push(Command::EndMarker);
        Ok(())
    }

    /// Commands recorded so far.
    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn state(&self) -> RecorderState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn raw(&self) -> RawCommandList {
        self.raw
    }

    fn clear(&mut self) {
        self.commands.clear();
        self.stats = RecorderStats::default();
        self.marker_depth = 0;
        self.end_failed = false;
    }

    fn rollback_transitions(&self) {
        for command in self.commands.iter().rev() {
            if let Command::Transition { resource, before, .. } = command {
                resource.state_cell().set(*before);
            }
        }
    }

    fn ensure_recording(&self, verb: &str) -> RhiResult<()> {
        if self.state != RecorderState::Recording {
            return Err(RhiError::contract(format!(
                "{} on recorder '{}' in state {:?}",
                verb, self.name, self.state
            )));
        }
        Ok(())
    }

    fn ensure_graphics(&self, verb: &str) -> RhiResult<()> {
        if self.queue != QueueKind::Graphics {
            return Err(RhiError::contract(format!(
                "{} needs a graphics recorder, '{}' is {:?}",
                verb, self.name, self.queue
            )));
        }
        Ok(())
    }

    fn ensure_view(&self, view: &View, kind: ViewKind, state: AccessState) -> RhiResult<()> {
        if view.kind() != kind {
            return Err(RhiError::contract(format!(
                "expected a {:?} view, got {:?}",
                kind,
                view.kind()
            )));
        }
        ensure_state(view.resource().as_resource(), state)
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        if self.state == RecorderState::Recording {
            self.rollback_transitions();
        }
        self.commands.clear();
        self.device.backend().destroy_command_list(self.raw);
        debug!("Destroyed command recorder '{}'", self.name);
    }
}

impl std::fmt::Debug for CommandRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRecorder")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("state", &self.state)
            .field("commands", &self.commands.len())
            .finish()
    }
}

fn ensure_state(resource: &dyn Resource, expected: AccessState) -> RhiResult<()> {
    let actual = resource.state();
    if actual != expected {
        return Err(RhiError::contract(format!(
            "'{}' is in {} but {} is required",
            resource.name(),
            actual.name(),
            expected.name()
        )));
    }
    Ok(())
}

fn ensure_range(buffer: &Buffer, offset: u64, size: u64) -> RhiResult<()> {
    match offset.checked_add(size) {
        Some(end) if end <= buffer.size() => Ok(()),
        _ => Err(RhiError::contract(format!(
            "copy range {}+{} exceeds '{}' ({} bytes)",
            offset,
            size,
            buffer.name(),
            buffer.size()
        ))),
    }
}

fn ensure_footprints(texture: &Texture, buffer: &Buffer, footprints: &[MipFootprint]) -> RhiResult<()> {
    let desc = texture.desc();
    for footprint in footprints {
        if footprint.mip >= desc.mip_levels {
            return Err(RhiError::contract(format!(
                "footprint mip {} outside '{}'",
                footprint.mip, desc.name
            )));
        }
        if footprint.offset + footprint.span() > buffer.size() {
            return Err(RhiError::contract(format!(
                "mip {} footprint overruns '{}'",
                footprint.mip,
                buffer.name()
            )));
        }
    }
    Ok(())
}
