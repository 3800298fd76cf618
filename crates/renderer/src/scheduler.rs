//! Frame pacing.
//!
//! The [`FrameScheduler`] is the facade clients drive each frame. It owns
//! the device's graphics queue, the surface, one timeline fence and one
//! recorder per backbuffer slot. Each slot remembers the fence value
//! signaled for the last frame that used it; acquiring the slot again waits
//! for that value, which bounds the CPU to `frames_in_flight` frames ahead
//! of the GPU.
//!
//! A frame that fails to end, or is dropped instead of ended, is abandoned:
//! its recording is discarded, the phase returns to `Idle` and the still
//! acquired backbuffer is handed out again by the next `acquire_frame`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel_core::RendererConfig;
//! use keel_renderer::FrameScheduler;
//! use keel_rhi::software::SoftwareBackend;
//! use keel_rhi::{AccessState, SurfaceTarget};
//!
//! # fn example() -> keel_rhi::RhiResult<()> {
//! let config = RendererConfig::default();
//! let mut scheduler = FrameScheduler::with_backend(
//!     Arc::new(SoftwareBackend::default()),
//!     SurfaceTarget::Offscreen,
//!     &config,
//! )?;
//!
//! let mut frame = scheduler.acquire_frame()?;
//! let backbuffer = Arc::clone(frame.backbuffer());
//! let view = Arc::clone(frame.backbuffer_view());
//! frame.recorder().barrier(&backbuffer, AccessState::RenderTarget)?;
//! frame.recorder().clear_render_target(&view, [0.0, 0.0, 0.0, 1.0])?;
//! scheduler.end_frame(frame)?;
//! scheduler.present(config.vsync)?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};

use keel_core::{RendererConfig, Timer};
use keel_rhi::acceleration::{AccelerationStructure, AccelerationStructureInputs};
use keel_rhi::backend::Backend;
use keel_rhi::pipeline::{Pipeline, PipelineDesc};
use keel_rhi::resource::{Buffer, BufferKind, ResourceRef, Texture, TextureDesc};
use keel_rhi::surface::SwapchainDesc;
use keel_rhi::view::{Sampler, SamplerDesc, View, ViewDesc};
use keel_rhi::{
    AccessState, CommandRecorder, Device, Fence, Format, PresentStatus, Queue, QueueKind, RecorderState, RhiError,
    RhiResult, Surface, SurfaceTarget,
};
use tracing::{debug, error, info, warn};

use crate::frame::{Frame, FramePhase};
use crate::stats::FrameStats;
use crate::uploader::Uploader;

/// Backbuffer format requested from the presentation engine.
pub const BACKBUFFER_FORMAT: Format = Format::Bgra8Srgb;

struct FrameSlot {
    /// `None` while lent out in a [`Frame`].
    recorder: Option<CommandRecorder>,
    /// Fence value signaled after this slot's last frame; 0 if never used.
    fence_value: u64,
}

/// Acquire/submit/present protocol with bounded frames in flight.
pub struct FrameScheduler {
    device: Arc<Device>,
    queue: Arc<Queue>,
    // Dropped before the fence and slots so backbuffers go first.
    surface: Surface,
    fence: Fence,
    slots: Vec<FrameSlot>,
    next_fence_value: u64,
    phase: FramePhase,
    /// Dead once the outstanding [`Frame`] is ended or dropped.
    lease: Weak<()>,
    stats: FrameStats,
    frame_timer: Timer,
    config: RendererConfig,
}

impl FrameScheduler {
    /// Creates a device on `backend` from `config`, then the scheduler.
    pub fn with_backend(backend: Arc<dyn Backend>, target: SurfaceTarget, config: &RendererConfig) -> RhiResult<Self> {
        validate(config)?;
        let device = Device::new(backend, crate::device_desc(config))?;
        Self::new(&device, target, config)
    }

    /// Creates the surface, the frame fence and one recorder per backbuffer.
    ///
    /// # Errors
    ///
    /// [`RhiError::ContractViolation`] for an invalid `config`, otherwise the
    /// backend's error.
    pub fn new(device: &Arc<Device>, target: SurfaceTarget, config: &RendererConfig) -> RhiResult<Self> {
        validate(config)?;
        let queue = device.create_queue(QueueKind::Graphics);
        let surface = Surface::new(
            device,
            target,
            SwapchainDesc {
                width: config.width,
                height: config.height,
                image_count: config.frames_in_flight as u32,
                format: BACKBUFFER_FORMAT,
                vsync: config.vsync,
            },
        )?;
        let fence = device.create_fence("frame fence")?;

        let mut scheduler = Self {
            device: Arc::clone(device),
            queue,
            surface,
            fence,
            slots: Vec::new(),
            next_fence_value: 1,
            phase: FramePhase::Idle,
            lease: Weak::new(),
            stats: FrameStats::default(),
            frame_timer: Timer::new(),
            config: config.clone(),
        };
        scheduler.fit_slots()?;

        info!(
            "Frame scheduler ready: {} slots, {}x{}",
            scheduler.slots.len(),
            config.width,
            config.height
        );
        Ok(scheduler)
    }

    /// Keeps exactly one slot per backbuffer.
    fn fit_slots(&mut self) -> RhiResult<()> {
        let count = self.surface.image_count() as usize;
        self.slots.truncate(count);
        while self.slots.len() < count {
            let index = self.slots.len();
            let recorder = self
                .device
                .create_recorder(QueueKind::Graphics, &format!("frame {index}"))?;
            self.slots.push(FrameSlot {
                recorder: Some(recorder),
                fence_value: 0,
            });
        }
        Ok(())
    }

    fn expect_phase(&self, expected: &[FramePhase], verb: &str) -> RhiResult<()> {
        if expected.contains(&self.phase) {
            return Ok(());
        }
        Err(RhiError::contract(format!("{} called in phase {:?}", verb, self.phase)))
    }

    /// Returns to `Idle` if the outstanding frame was dropped without being ended.
    ///
    /// The dropped recorder has already undone its transitions; the slot's
    /// recorder is recreated on the next acquisition.
    fn reclaim_abandoned_frame(&mut self) {
        let outstanding = matches!(self.phase, FramePhase::FrameAcquired | FramePhase::Recorded);
        if outstanding && self.lease.strong_count() == 0 {
            warn!(
                "Frame for backbuffer {:?} was dropped without end_frame; abandoning it",
                self.surface.current_index()
            );
            self.phase = FramePhase::Idle;
        }
    }

    /// Acquires the next backbuffer and hands out its slot's recorder, begun.
    ///
    /// Blocks only if the GPU has not finished the last frame that used the
    /// same slot.
    pub fn acquire_frame(&mut self) -> RhiResult<Frame> {
        self.reclaim_abandoned_frame();
        self.expect_phase(&[FramePhase::Idle], "acquire_frame")?;
        let index = match self.surface.current_index() {
            // Left acquired by an abandoned frame or a failed fence wait.
            Some(index) => {
                debug!("Reusing acquired backbuffer {}", index);
                index
            }
            None => self.surface.acquire()?,
        };
        let slot = index as usize;

        let fence_value = self.slots[slot].fence_value;
        if !self.fence.is_complete(fence_value)? {
            let (result, waited) = Timer::measure(|| self.fence.wait(fence_value));
            result?;
            self.stats.record_wait(waited);
            debug!("Slot {} waited {:?} for fence value {}", slot, waited, fence_value);
        }

        let mut recorder = match self.slots[slot].recorder.take() {
            Some(recorder) => recorder,
            None => {
                warn!("Recorder of slot {} was dropped with its frame; recreating", slot);
                self.device
                    .create_recorder(QueueKind::Graphics, &format!("frame {slot}"))?
            }
        };
        if let Err(e) = recorder.begin() {
            self.slots[slot].recorder = Some(recorder);
            return Err(e);
        }

        let backbuffer = self
            .surface
            .backbuffer(index)
            .cloned()
            .ok_or_else(|| RhiError::SwapchainError(format!("no backbuffer {index}")))?;
        let backbuffer_view = self
            .surface
            .backbuffer_view(index)
            .cloned()
            .ok_or_else(|| RhiError::SwapchainError(format!("no backbuffer view {index}")))?;
        let (width, height) = self.surface.extent();

        let lease = Arc::new(());
        self.lease = Arc::downgrade(&lease);
        self.phase = FramePhase::FrameAcquired;
        Ok(Frame {
            slot: index,
            lease,
            backbuffer,
            backbuffer_view,
            recorder,
            width,
            height,
        })
    }

    /// Submits additional closed recorders ahead of the frame's own.
    ///
    /// Moves the protocol to [`FramePhase::Recorded`]; may be called more
    /// than once before [`FrameScheduler::end_frame`].
    pub fn submit(&mut self, recorders: &[&CommandRecorder]) -> RhiResult<()> {
        self.expect_phase(&[FramePhase::FrameAcquired, FramePhase::Recorded], "submit")?;
        self.queue.submit(recorders)?;
        for recorder in recorders {
            self.stats.record(recorder.stats());
        }
        self.phase = FramePhase::Recorded;
        Ok(())
    }

    /// Transitions the backbuffer to `Present`, closes and submits the
    /// frame's recorder, and signals the frame fence for its slot.
    ///
    /// # Errors
    ///
    /// If the frame cannot be submitted, it is abandoned: the recording is
    /// discarded, the phase returns to [`FramePhase::Idle`] and the next
    /// [`acquire_frame`](Self::acquire_frame) hands out the same backbuffer.
    pub fn end_frame(&mut self, frame: Frame) -> RhiResult<()> {
        if !std::ptr::eq(Arc::as_ptr(&frame.lease), self.lease.as_ptr()) {
            return Err(RhiError::contract(format!(
                "frame for slot {} was not acquired from this scheduler",
                frame.slot
            )));
        }
        let Frame {
            slot,
            backbuffer,
            mut recorder,
            ..
        } = frame;
        let result = self.finish_frame(slot, &backbuffer, &mut recorder);
        if let Err(e) = &result
            && self.phase != FramePhase::Submitted
        {
            recorder.reset();
            self.phase = FramePhase::Idle;
            warn!("Abandoned frame for slot {}: {}", slot, e);
        }
        if let Some(home) = self.slots.get_mut(slot as usize) {
            home.recorder = Some(recorder);
        }
        result
    }

    fn finish_frame(&mut self, slot: u32, backbuffer: &Arc<Texture>, recorder: &mut CommandRecorder) -> RhiResult<()> {
        self.expect_phase(&[FramePhase::FrameAcquired, FramePhase::Recorded], "end_frame")?;
        if self.surface.current_index() != Some(slot) {
            return Err(RhiError::contract(format!(
                "frame for slot {} ended while slot {:?} is acquired",
                slot,
                self.surface.current_index()
            )));
        }

        if recorder.state() == RecorderState::Recording {
            recorder.barrier(backbuffer, AccessState::Present)?;
            recorder.end()?;
        } else if ResourceRef::from(backbuffer).state() != AccessState::Present {
            return Err(RhiError::contract(format!(
                "recorder '{}' was closed with the backbuffer in {:?}",
                recorder.name(),
                ResourceRef::from(backbuffer).state()
            )));
        }

        self.queue.submit(&[&*recorder])?;
        self.phase = FramePhase::Submitted;
        self.stats.record(recorder.stats());
        let value = self.next_fence_value;
        self.fence.signal(&self.queue, value)?;
        self.next_fence_value += 1;
        self.slots[slot as usize].fence_value = value;
        Ok(())
    }

    /// Hands the backbuffer to the presentation engine. Never waits.
    ///
    /// A [`PresentStatus`] other than `Presented` means the caller should
    /// [`resize`](Self::resize) before the next frame.
    pub fn present(&mut self, vsync: bool) -> RhiResult<PresentStatus> {
        self.expect_phase(&[FramePhase::Submitted], "present")?;
        self.phase = FramePhase::Idle;
        let status = self.surface.present(vsync)?;
        if status != PresentStatus::Presented {
            warn!("Present returned {:?}", status);
        }

        self.stats.frames += 1;
        self.stats.memory_bytes = self.device.memory_stats().total_bytes();
        self.stats.log_periodically();
        let delta = self.frame_timer.tick();
        if self.stats.frames % crate::stats::STATS_LOG_INTERVAL == 0 {
            debug!(
                "Last frame took {:?} (average {:?})",
                delta,
                self.frame_timer.average_tick()
            );
        }
        Ok(status)
    }

    /// Drains the pipeline: signals a fresh fence value and waits for it.
    pub fn wait_idle(&mut self) -> RhiResult<()> {
        let value = self.next_fence_value;
        self.fence.signal(&self.queue, value)?;
        self.next_fence_value += 1;
        self.fence.wait(value)
    }

    /// Drains the GPU and recreates the backbuffers at the new extent.
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.reclaim_abandoned_frame();
        self.expect_phase(&[FramePhase::Idle], "resize")?;
        self.wait_idle()?;
        self.surface.resize(width, height)?;
        self.fit_slots()?;
        self.config.width = width;
        self.config.height = height;
        Ok(())
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    #[inline]
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    #[inline]
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    #[inline]
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Number of backbuffer slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Fence value the next acquisition of `slot` waits for.
    pub fn slot_fence_value(&self, slot: u32) -> Option<u64> {
        self.slots.get(slot as usize).map(|s| s.fence_value)
    }

    /// The frame fence.
    #[inline]
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn create_buffer(&self, size: u64, stride: u32, kind: BufferKind, name: &str) -> RhiResult<Arc<Buffer>> {
        self.device.create_buffer(size, stride, kind, name)
    }

    pub fn create_texture(&self, desc: TextureDesc) -> RhiResult<Arc<Texture>> {
        self.device.create_texture(desc)
    }

    pub fn create_view(&self, resource: impl Into<ResourceRef>, desc: ViewDesc) -> RhiResult<Arc<View>> {
        self.device.create_view(resource, desc)
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> RhiResult<Arc<Sampler>> {
        self.device.create_sampler(desc)
    }

    pub fn create_pipeline(&self, desc: &PipelineDesc) -> RhiResult<Arc<Pipeline>> {
        self.device.create_pipeline(desc)
    }

    pub fn create_acceleration_structure(
        &self,
        inputs: AccelerationStructureInputs,
        name: &str,
    ) -> RhiResult<Arc<AccelerationStructure>> {
        self.device.create_acceleration_structure(inputs, name)
    }

    /// A graphics recorder for work submitted through [`FrameScheduler::submit`].
    pub fn create_recorder(&self, name: &str) -> RhiResult<CommandRecorder> {
        self.device.create_recorder(QueueKind::Graphics, name)
    }

    /// An uploader submitting on the scheduler's queue.
    pub fn create_uploader(&self) -> RhiResult<Uploader> {
        Uploader::new(&self.device, &self.queue)
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("Failed to drain frames on shutdown: {}", e);
        }
        info!("Frame scheduler shut down after {} frames", self.stats.frames);
    }
}

fn validate(config: &RendererConfig) -> RhiResult<()> {
    config
        .validate()
        .map_err(|e| RhiError::contract(format!("invalid renderer configuration: {e}")))
}
