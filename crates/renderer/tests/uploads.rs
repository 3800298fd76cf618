//! Integration tests for the uploader on the software backend.

use std::sync::Arc;

use keel_renderer::{ImageData, Uploader};
use keel_rhi::acceleration::AccelerationStructureInputs;
use keel_rhi::resource::{Buffer, BufferKind, Texture, TextureDesc};
use keel_rhi::software::{ACCELERATION_STRUCTURE_MAGIC, SoftwareBackend};
use keel_rhi::{AccessState, Device, DeviceDesc, Format, Queue, QueueKind, RhiError};

fn setup(backend: SoftwareBackend) -> (Arc<SoftwareBackend>, Arc<Device>, Arc<Queue>) {
    let backend = Arc::new(backend);
    let device = Device::new(backend.clone(), DeviceDesc::default()).unwrap();
    let queue = device.create_queue(QueueKind::Graphics);
    (backend, device, queue)
}

/// Submits `record` on its own fence, waits, and returns the readback contents.
fn read_back(
    device: &Arc<Device>,
    queue: &Queue,
    size: u64,
    record: impl FnOnce(&mut keel_rhi::CommandRecorder, &Arc<Buffer>),
) -> Vec<u8> {
    let readback = device
        .create_buffer(size, 0, BufferKind::Readback, "readback")
        .unwrap();
    let mut recorder = device.create_recorder(QueueKind::Graphics, "readback").unwrap();
    recorder.begin().unwrap();
    recorder.barrier(&readback, AccessState::CopyDest).unwrap();
    record(&mut recorder, &readback);
    recorder.end().unwrap();
    queue.submit(&[&recorder]).unwrap();

    let fence = device.create_fence("readback").unwrap();
    fence.signal(queue, 1).unwrap();
    fence.wait(1).unwrap();
    readback.read(0, size).unwrap()
}

fn read_buffer(device: &Arc<Device>, queue: &Queue, buffer: &Arc<Buffer>, size: u64) -> Vec<u8> {
    read_back(device, queue, size, |recorder, readback| {
        recorder.barrier(buffer, AccessState::CopySource).unwrap();
        recorder
            .copy_buffer_to_buffer(readback, 0, buffer, 0, size)
            .unwrap();
    })
}

#[test]
fn test_buffer_round_trip() {
    let (_backend, device, queue) = setup(SoftwareBackend::default());
    let destination = device
        .create_buffer(256, 4, BufferKind::Storage, "destination")
        .unwrap();
    let data: Vec<u32> = (0..64).map(|i| i * 7 + 1).collect();

    let mut uploader = Uploader::new(&device, &queue).unwrap();
    uploader.enqueue_slice(&data, &destination).unwrap();
    assert_eq!(uploader.pending_requests(), 1);

    let value = uploader.flush().unwrap();
    assert_eq!(value, 1);
    assert_eq!(uploader.pending_requests(), 0);
    assert_eq!(uploader.in_flight_batches(), 1);
    uploader.fence().wait(value).unwrap();
    assert_eq!(destination_state(&destination), AccessState::CopyDest);

    let bytes = read_buffer(&device, &queue, &destination, 256);
    assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&data));
}

fn destination_state(buffer: &Arc<Buffer>) -> AccessState {
    use keel_rhi::resource::Resource;
    buffer.state()
}

#[test]
fn test_oversized_upload_is_rejected() {
    let (_backend, device, queue) = setup(SoftwareBackend::default());
    let destination = device
        .create_buffer(16, 0, BufferKind::Storage, "small")
        .unwrap();
    let mut uploader = Uploader::new(&device, &queue).unwrap();

    let err = uploader
        .enqueue_buffer_upload(&[0u8; 32], &destination)
        .unwrap_err();
    assert!(matches!(err, RhiError::ContractViolation(_)));
    assert_eq!(uploader.pending_requests(), 0);
    // Nothing queued: flush submits nothing and reports the last value.
    assert_eq!(uploader.flush().unwrap(), 0);
}

fn texel_rows(width: u32, height: u32, seed: u8) -> Vec<u8> {
    (0..width * height * 4)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

#[test]
fn test_texture_upload_respects_row_pitch() {
    let (_backend, device, queue) = setup(SoftwareBackend::default());
    let desc = TextureDesc::new("narrow", 3, 2, Format::Rgba8Unorm).with_mip_levels(2);
    let texture: Arc<Texture> = device.create_texture(desc.clone()).unwrap();
    let (footprints, total) = device.texture_footprints(&desc);
    assert_eq!(footprints[0].row_size, 12);
    assert_eq!(footprints[0].row_pitch, 256);
    assert_eq!(footprints[1].offset % 512, 0);

    let image = ImageData::new(texel_rows(3, 2, 10)).with_mip(texel_rows(1, 1, 200));
    let mut uploader = Uploader::new(&device, &queue).unwrap();
    uploader.enqueue_texture_upload(&image, &texture).unwrap();
    let value = uploader.flush().unwrap();
    uploader.fence().wait(value).unwrap();

    let bytes = read_back(&device, &queue, total, |recorder, readback| {
        recorder.barrier(&texture, AccessState::CopySource).unwrap();
        recorder
            .copy_texture_to_buffer(readback, &texture, &footprints)
            .unwrap();
    });

    for footprint in &footprints {
        let source = &image.mips[footprint.mip as usize];
        let row_size = footprint.row_size as usize;
        for row in 0..footprint.row_count {
            let at = footprint.row_offset(row) as usize;
            let from = row as usize * row_size;
            assert_eq!(
                &bytes[at..at + row_size],
                &source[from..from + row_size],
                "mip {} row {}",
                footprint.mip,
                row
            );
        }
    }
}

#[test]
fn test_texture_upload_rejects_short_sources() {
    let (_backend, device, queue) = setup(SoftwareBackend::default());
    let texture = device
        .create_texture(TextureDesc::new("two mips", 4, 4, Format::Rgba8Unorm).with_mip_levels(2))
        .unwrap();
    let mut uploader = Uploader::new(&device, &queue).unwrap();

    let missing_mip = ImageData::new(texel_rows(4, 4, 0));
    assert!(matches!(
        uploader.enqueue_texture_upload(&missing_mip, &texture),
        Err(RhiError::ContractViolation(_))
    ));

    let short_row = ImageData::new(texel_rows(4, 4, 0)).with_mip(vec![0; 15]);
    assert!(matches!(
        uploader.enqueue_texture_upload(&short_row, &texture),
        Err(RhiError::ContractViolation(_))
    ));
    assert_eq!(uploader.pending_requests(), 0);
}

#[test]
fn test_clear_requests_is_idempotent() {
    let (backend, device, queue) = setup(SoftwareBackend::deferred());
    let destination = device
        .create_buffer(64, 0, BufferKind::Storage, "destination")
        .unwrap();
    let mut uploader = Uploader::new(&device, &queue).unwrap();

    uploader.enqueue_buffer_upload(&[7; 64], &destination).unwrap();
    let value = uploader.flush().unwrap();
    // Deferred: nothing has run yet.
    assert_eq!(uploader.fence().completed_value().unwrap(), 0);
    assert_eq!(uploader.release_completed().unwrap(), 0);

    uploader.enqueue_buffer_upload(&[9; 8], &destination).unwrap();
    uploader.clear_requests().unwrap();
    assert!(uploader.fence().completed_value().unwrap() >= value);
    assert_eq!(uploader.in_flight_batches(), 0);
    assert_eq!(uploader.pending_requests(), 0);
    assert_eq!(backend.pending_work(), 0);

    uploader.clear_requests().unwrap();
    assert_eq!(uploader.in_flight_batches(), 0);
    assert_eq!(uploader.fence().last_signaled(), value);
}

#[test]
fn test_release_completed_does_not_block() {
    let (backend, device, queue) = setup(SoftwareBackend::deferred());
    let destination = device
        .create_buffer(32, 0, BufferKind::Storage, "destination")
        .unwrap();
    let mut uploader = Uploader::new(&device, &queue).unwrap();

    uploader.enqueue_buffer_upload(&[1; 32], &destination).unwrap();
    let first = uploader.flush().unwrap();
    uploader.enqueue_buffer_upload(&[2; 32], &destination).unwrap();
    let second = uploader.flush().unwrap();
    assert_eq!((first, second), (1, 2));
    assert_eq!(uploader.in_flight_batches(), 2);

    // Retire the first list and its signal only.
    backend.advance(2).unwrap();
    assert_eq!(uploader.release_completed().unwrap(), 1);
    assert_eq!(uploader.in_flight_batches(), 1);

    uploader.fence().wait(second).unwrap();
    assert_eq!(uploader.release_completed().unwrap(), 1);
    assert_eq!(uploader.in_flight_batches(), 0);
}

#[test]
fn test_acceleration_structure_build() {
    let (_backend, device, queue) = setup(SoftwareBackend::default());
    let positions: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    let vertices = device
        .create_buffer(36, 12, BufferKind::Vertex, "triangle")
        .unwrap();
    let accel = device
        .create_acceleration_structure(
            AccelerationStructureInputs::BottomLevel {
                vertices: Arc::clone(&vertices),
                vertex_count: 3,
                vertex_stride: 12,
                indices: None,
                index_count: 0,
            },
            "blas",
        )
        .unwrap();

    let mut uploader = Uploader::new(&device, &queue).unwrap();
    uploader.enqueue_slice(&positions, &vertices).unwrap();
    uploader.enqueue_acceleration_structure_build(&accel);
    let value = uploader.flush().unwrap();
    uploader.fence().wait(value).unwrap();
    assert!(accel.scratch().is_some());
    assert!(format!("{accel:?}").contains("\"blas\""));

    // Completed batches give up the scratch buffer.
    uploader.clear_requests().unwrap();
    assert!(accel.scratch().is_none());

    let header = read_buffer(&device, &queue, accel.result(), 12);
    assert_eq!(&header[0..4], &ACCELERATION_STRUCTURE_MAGIC);
    assert_eq!(u32::from_le_bytes([header[4], header[5], header[6], header[7]]), 0);
    assert_eq!(u32::from_le_bytes([header[8], header[9], header[10], header[11]]), 1);
}

#[test]
fn test_build_after_scratch_release_is_rejected() {
    let (_backend, device, queue) = setup(SoftwareBackend::default());
    let instances = device
        .create_buffer(64, 64, BufferKind::Storage, "instances")
        .unwrap();
    let tlas = device
        .create_acceleration_structure(
            AccelerationStructureInputs::TopLevel {
                instances,
                instance_count: 1,
            },
            "tlas",
        )
        .unwrap();
    tlas.release_scratch();

    let mut uploader = Uploader::new(&device, &queue).unwrap();
    uploader.enqueue_acceleration_structure_build(&tlas);
    assert!(matches!(uploader.flush(), Err(RhiError::ContractViolation(_))));
}

#[test]
fn test_failed_flush_keeps_requests_and_states() {
    let (_backend, device, queue) = setup(SoftwareBackend::default());
    let destination = device
        .create_buffer(64, 0, BufferKind::Storage, "destination")
        .unwrap();
    let instances = device
        .create_buffer(64, 64, BufferKind::Storage, "instances")
        .unwrap();
    let tlas = device
        .create_acceleration_structure(
            AccelerationStructureInputs::TopLevel {
                instances: Arc::clone(&instances),
                instance_count: 1,
            },
            "tlas",
        )
        .unwrap();
    tlas.release_scratch();

    let mut uploader = Uploader::new(&device, &queue).unwrap();
    uploader.enqueue_buffer_upload(&[3; 64], &destination).unwrap();
    uploader.enqueue_acceleration_structure_build(&tlas);
    assert!(matches!(uploader.flush(), Err(RhiError::ContractViolation(_))));

    // Nothing reached the queue, so nothing changed state.
    assert_eq!(queue.submissions(), 0);
    assert_eq!(destination_state(&destination), AccessState::Common);
    assert_eq!(destination_state(&instances), AccessState::Common);
    assert_eq!(uploader.pending_requests(), 2);
    assert_eq!(uploader.in_flight_batches(), 0);
    assert_eq!(uploader.fence().last_signaled(), 0);

    uploader.clear_requests().unwrap();
    uploader.enqueue_buffer_upload(&[5; 64], &destination).unwrap();
    let value = uploader.flush().unwrap();
    assert_eq!(value, 1);
    uploader.fence().wait(value).unwrap();
    assert_eq!(read_buffer(&device, &queue, &destination, 64), vec![5; 64]);
}
