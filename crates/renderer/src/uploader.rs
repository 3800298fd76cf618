//! Batched CPU→GPU transfers.
//!
//! The [`Uploader`] stages data in host-visible buffers and replays the
//! queued requests into one recorder per [`Uploader::flush`]. Each flush
//! signals the uploader's own fence; staging memory and recorders are kept
//! until that value has been reached.

use std::collections::VecDeque;
use std::sync::Arc;

use bytemuck::Pod;
use keel_rhi::acceleration::AccelerationStructure;
use keel_rhi::footprint::MipFootprint;
use keel_rhi::resource::{Buffer, BufferKind, Resource, Texture};
use keel_rhi::{AccessState, CommandRecorder, Device, Fence, Queue, RhiError, RhiResult};
use tracing::{debug, error, trace};

/// CPU-side texel data for a texture upload.
///
/// Each mip holds tightly packed rows of `width * bytes_per_texel` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageData {
    pub mips: Vec<Vec<u8>>,
}

impl ImageData {
    /// Image data with only the top mip.
    pub fn new(mip0: Vec<u8>) -> Self {
        Self { mips: vec![mip0] }
    }

    /// Appends the next mip.
    pub fn with_mip(mut self, data: Vec<u8>) -> Self {
        self.mips.push(data);
        self
    }
}

enum UploadRequest {
    BufferCopy {
        staging: Arc<Buffer>,
        destination: Arc<Buffer>,
        size: u64,
    },
    TextureCopy {
        staging: Arc<Buffer>,
        destination: Arc<Texture>,
        footprints: Vec<MipFootprint>,
    },
    AccelerationStructureBuild {
        accel: Arc<AccelerationStructure>,
    },
}

/// Requests replayed by one flush, kept until its fence value completes.
struct UploadBatch {
    fence_value: u64,
    recorder: CommandRecorder,
    requests: Vec<UploadRequest>,
}

impl UploadBatch {
    fn retire(self) -> CommandRecorder {
        for request in &self.requests {
            if let UploadRequest::AccelerationStructureBuild { accel } = request {
                accel.release_scratch();
            }
        }
        self.recorder
    }
}

/// Staging uploads and acceleration-structure builds.
pub struct Uploader {
    device: Arc<Device>,
    queue: Arc<Queue>,
    fence: Fence,
    next_fence_value: u64,
    requests: Vec<UploadRequest>,
    batches: VecDeque<UploadBatch>,
    /// Recorders whose batch has completed, ready for reuse.
    idle_recorders: Vec<CommandRecorder>,
    staged_bytes: u64,
}

impl Uploader {
    pub fn new(device: &Arc<Device>, queue: &Arc<Queue>) -> RhiResult<Self> {
        let fence = device.create_fence("upload fence")?;
        Ok(Self {
            device: Arc::clone(device),
            queue: Arc::clone(queue),
            fence,
            next_fence_value: 1,
            requests: Vec::new(),
            batches: VecDeque::new(),
            idle_recorders: Vec::new(),
            staged_bytes: 0,
        })
    }

    fn create_staging(&mut self, size: u64, name: &str) -> RhiResult<Arc<Buffer>> {
        let staging = self
            .device
            .create_buffer(size, 0, BufferKind::Staging, &format!("{name} (staging)"))?;
        self.staged_bytes += size;
        Ok(staging)
    }

    /// Copies `data` into a staging buffer and queues a copy to the start of `destination`.
    ///
    /// # Errors
    ///
    /// [`RhiError::ContractViolation`] if `data` does not fit.
    pub fn enqueue_buffer_upload(&mut self, data: &[u8], destination: &Arc<Buffer>) -> RhiResult<()> {
        let size = data.len() as u64;
        if size == 0 {
            trace!("Skipping empty upload to '{}'", destination.name());
            return Ok(());
        }
        if size > destination.size() {
            return Err(RhiError::contract(format!(
                "{} bytes do not fit in '{}' ({} bytes)",
                size,
                destination.name(),
                destination.size()
            )));
        }

        let staging = self.create_staging(size, destination.name())?;
        {
            let mut mapping = staging.map()?;
            mapping.as_mut_slice()[..data.len()].copy_from_slice(data);
        }
        self.requests.push(UploadRequest::BufferCopy {
            staging,
            destination: Arc::clone(destination),
            size,
        });
        Ok(())
    }

    /// Typed form of [`Uploader::enqueue_buffer_upload`].
    pub fn enqueue_slice<T: Pod>(&mut self, data: &[T], destination: &Arc<Buffer>) -> RhiResult<()> {
        self.enqueue_buffer_upload(bytemuck::cast_slice(data), destination)
    }

    /// Lays `image` out at the device's copy footprints and queues a copy of
    /// every mip of `destination`.
    ///
    /// # Errors
    ///
    /// [`RhiError::ContractViolation`] if a mip is missing or shorter than
    /// its rows.
    pub fn enqueue_texture_upload(&mut self, image: &ImageData, destination: &Arc<Texture>) -> RhiResult<()> {
        let desc = destination.desc();
        if image.mips.len() < desc.mip_levels as usize {
            return Err(RhiError::contract(format!(
                "'{}' has {} mips, upload supplies {}",
                desc.name,
                desc.mip_levels,
                image.mips.len()
            )));
        }

        let (footprints, total) = self.device.texture_footprints(desc);
        for footprint in &footprints {
            let needed = footprint.row_size * u64::from(footprint.row_count);
            let supplied = image.mips[footprint.mip as usize].len() as u64;
            if supplied < needed {
                return Err(RhiError::contract(format!(
                    "mip {} of '{}' needs {} bytes ({} rows of {}), got {}",
                    footprint.mip, desc.name, needed, footprint.row_count, footprint.row_size, supplied
                )));
            }
        }

        let staging = self.create_staging(total, &desc.name)?;
        {
            let mut mapping = staging.map()?;
            let bytes = mapping.as_mut_slice();
            for footprint in &footprints {
                let source = &image.mips[footprint.mip as usize];
                let row_size = footprint.row_size as usize;
                for row in 0..footprint.row_count {
                    let dst = footprint.row_offset(row) as usize;
                    let src = row as usize * row_size;
                    bytes[dst..dst + row_size].copy_from_slice(&source[src..src + row_size]);
                }
            }
        }

        debug!(
            "Staged {} mips of '{}' in {} bytes",
            footprints.len(),
            desc.name,
            total
        );
        self.requests.push(UploadRequest::TextureCopy {
            staging,
            destination: Arc::clone(destination),
            footprints,
        });
        Ok(())
    }

    /// Queues a build of `accel` from its inputs.
    pub fn enqueue_acceleration_structure_build(&mut self, accel: &Arc<AccelerationStructure>) {
        self.requests.push(UploadRequest::AccelerationStructureBuild {
            accel: Arc::clone(accel),
        });
    }

    /// Records every queued request into one recorder, submits it and
    /// signals the upload fence.
    ///
    /// Returns the fence value that marks completion. With nothing queued,
    /// returns the last signaled value without submitting.
    ///
    /// # Errors
    ///
    /// If recording or submission fails, the recording is discarded, every
    /// destination keeps its previous state and the requests stay queued.
    pub fn flush(&mut self) -> RhiResult<u64> {
        if self.requests.is_empty() {
            return Ok(self.fence.last_signaled());
        }
        self.release_completed()?;

        let mut recorder = match self.idle_recorders.pop() {
            Some(recorder) => recorder,
            None => self.device.create_recorder(
                self.queue.kind(),
                &format!("upload {}", self.next_fence_value),
            )?,
        };

        let recorded = record_all(&mut recorder, &self.requests)
            .and_then(|()| self.queue.submit(&[&recorder]));
        if let Err(e) = recorded {
            recorder.reset();
            self.idle_recorders.push(recorder);
            return Err(e);
        }

        let requests = std::mem::take(&mut self.requests);
        let value = self.next_fence_value;
        self.fence.signal(&self.queue, value)?;
        self.next_fence_value += 1;

        debug!(
            "Flushed {} upload requests ({} staged bytes) as fence value {}",
            requests.len(),
            self.staged_bytes,
            value
        );
        self.staged_bytes = 0;
        self.batches.push_back(UploadBatch {
            fence_value: value,
            recorder,
            requests,
        });
        Ok(value)
    }

    /// Releases the batches whose fence value has completed, without blocking.
    ///
    /// Returns how many were released.
    pub fn release_completed(&mut self) -> RhiResult<usize> {
        let completed = self.fence.completed_value()?;
        let mut released = 0;
        while let Some(batch) = self.batches.front() {
            if batch.fence_value > completed {
                break;
            }
            if let Some(batch) = self.batches.pop_front() {
                self.idle_recorders.push(batch.retire());
                released += 1;
            }
        }
        if released > 0 {
            trace!("Released {} completed upload batches", released);
        }
        Ok(released)
    }

    /// Waits for every flush, then drops staging buffers, recorders and
    /// unflushed requests. Calling it again does nothing.
    pub fn clear_requests(&mut self) -> RhiResult<()> {
        if let Some(last) = self.batches.back().map(|b| b.fence_value) {
            self.fence.wait(last)?;
        }
        let batches = self.batches.len();
        for batch in self.batches.drain(..) {
            drop(batch.retire());
        }
        if !self.requests.is_empty() {
            debug!("Discarding {} unflushed upload requests", self.requests.len());
            self.requests.clear();
        }
        self.idle_recorders.clear();
        self.staged_bytes = 0;
        if batches > 0 {
            debug!("Cleared {} upload batches", batches);
        }
        Ok(())
    }

    /// Requests queued since the last flush.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Flushes whose resources have not been released yet.
    pub fn in_flight_batches(&self) -> usize {
        self.batches.len()
    }

    /// The upload fence.
    #[inline]
    pub fn fence(&self) -> &Fence {
        &self.fence
    }
}

fn record_all(recorder: &mut CommandRecorder, requests: &[UploadRequest]) -> RhiResult<()> {
    recorder.begin()?;
    recorder.begin_marker("upload")?;
    for request in requests {
        record(recorder, request)?;
    }
    recorder.end_marker()?;
    recorder.end()
}

fn record(recorder: &mut CommandRecorder, request: &UploadRequest) -> RhiResult<()> {
    match request {
        UploadRequest::BufferCopy {
            staging,
            destination,
            size,
        } => {
            recorder.barrier(destination, AccessState::CopyDest)?;
            recorder.barrier(staging, AccessState::CopySource)?;
            recorder.copy_buffer_to_buffer(destination, 0, staging, 0, *size)
        }
        UploadRequest::TextureCopy {
            staging,
            destination,
            footprints,
        } => {
            recorder.barrier(destination, AccessState::CopyDest)?;
            recorder.barrier(staging, AccessState::CopySource)?;
            recorder.copy_buffer_to_texture(destination, staging, footprints)
        }
        UploadRequest::AccelerationStructureBuild { accel } => {
            for input in accel.inputs().input_buffers() {
                recorder.barrier(input, AccessState::ShaderRead)?;
            }
            recorder.build_acceleration_structure(accel)?;
            recorder.uav_barrier(accel.result())
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        if let Err(e) = self.clear_requests() {
            error!("Upload fence wait failed on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("pending_requests", &self.requests.len())
            .field("in_flight_batches", &self.batches.len())
            .field("last_signaled", &self.fence.last_signaled())
            .finish()
    }
}
