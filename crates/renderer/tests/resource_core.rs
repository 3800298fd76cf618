//! Integration tests for descriptor heaps, views and the barrier policy.

use std::collections::HashSet;
use std::sync::Arc;

use keel_rhi::descriptor::DescriptorHeapKind;
use keel_rhi::resource::{BufferKind, Resource, TextureDesc, TextureUsage};
use keel_rhi::software::SoftwareBackend;
use keel_rhi::view::{ViewDesc, ViewDimension};
use keel_rhi::{
    AccessState, BarrierOutcome, Device, DeviceDesc, Format, QueueKind, RecorderState, RhiError, Viewport,
};

fn device_with_capacity(capacity: u32) -> Arc<Device> {
    Device::new(
        Arc::new(SoftwareBackend::default()),
        DeviceDesc {
            shader_resource_heap_capacity: capacity,
            sampler_heap_capacity: capacity,
            render_target_heap_capacity: capacity,
            depth_target_heap_capacity: capacity,
            ..Default::default()
        },
    )
    .unwrap()
}

#[test]
fn test_heap_capacity_is_enforced() {
    let device = device_with_capacity(8);
    let buffer = device
        .create_buffer(256, 16, BufferKind::Storage, "storage")
        .unwrap();

    let views: Vec<_> = (0..8)
        .map(|_| {
            device
                .create_view(&buffer, ViewDesc::shader_read(ViewDimension::Buffer))
                .unwrap()
        })
        .collect();
    let indices: HashSet<u32> = views.iter().map(|v| v.index()).collect();
    assert_eq!(indices.len(), 8, "every view should own a distinct slot");

    let err = device
        .create_view(&buffer, ViewDesc::shader_read(ViewDimension::Buffer))
        .unwrap_err();
    assert!(matches!(err, RhiError::ResourceExhausted { capacity: 8, .. }));
    assert!(!err.is_fatal());

    drop(views);
    let heap = device.heap(DescriptorHeapKind::ShaderResource);
    assert_eq!(heap.allocated(), 0);

    let again = device
        .create_view(&buffer, ViewDesc::shader_read(ViewDimension::Buffer))
        .unwrap();
    assert!(indices.contains(&again.index()), "freed slots are reused");
    assert!(heap.is_allocated(again.index()));
    assert_eq!(heap.allocated(), 1);
}

#[test]
fn test_view_validation() {
    let device = device_with_capacity(16);
    let buffer = device
        .create_buffer(64, 4, BufferKind::Vertex, "vertices")
        .unwrap();
    let texture = device
        .create_texture(TextureDesc::new("albedo", 4, 4, Format::Rgba8Unorm))
        .unwrap();

    let cases = [
        device.create_view(&buffer, ViewDesc::render_target()),
        device.create_view(&buffer, ViewDesc::shader_read(ViewDimension::Texture2D)),
        device.create_view(&buffer, ViewDesc::unordered_access(ViewDimension::Buffer)),
        device.create_view(
            &buffer,
            ViewDesc::shader_read(ViewDimension::AccelerationStructure),
        ),
        device.create_view(&texture, ViewDesc::shader_read(ViewDimension::Buffer)),
        // Created without STORAGE or RENDER_TARGET usage.
        device.create_view(&texture, ViewDesc::unordered_access(ViewDimension::Texture2D)),
        device.create_view(&texture, ViewDesc::render_target()),
        device.create_view(
            &texture,
            ViewDesc::shader_read(ViewDimension::Texture2D).with_slice(1),
        ),
        device.create_view(
            &texture,
            ViewDesc::shader_read(ViewDimension::Texture2D).with_mip(1),
        ),
    ];
    for (i, case) in cases.into_iter().enumerate() {
        assert!(
            matches!(case, Err(RhiError::ContractViolation(_))),
            "case {} should be a contract violation",
            i
        );
    }

    let view = device
        .create_view(&texture, ViewDesc::shader_read(ViewDimension::Texture2D))
        .unwrap();
    assert_eq!(view.format(), Format::Rgba8Unorm);
    // Views never change the resource's state.
    assert_eq!(texture.state(), AccessState::Common);
    // No slot leaked by the failed attempts.
    assert_eq!(device.heap(DescriptorHeapKind::ShaderResource).allocated(), 1);
    assert_eq!(device.heap(DescriptorHeapKind::RenderTarget).allocated(), 0);
}

#[test]
fn test_barrier_elision() {
    let device = device_with_capacity(16);
    let texture = device
        .create_texture(
            TextureDesc::new("target", 8, 8, Format::Rgba8Unorm)
                .with_usage(TextureUsage::SHADER_READ | TextureUsage::STORAGE),
        )
        .unwrap();
    let mut recorder = device.create_recorder(QueueKind::Graphics, "barriers").unwrap();
    recorder.begin().unwrap();

    assert_eq!(
        recorder.barrier(&texture, AccessState::ShaderRead).unwrap(),
        BarrierOutcome::Transition {
            before: AccessState::Common,
            after: AccessState::ShaderRead
        }
    );
    assert_eq!(
        recorder.barrier(&texture, AccessState::ShaderRead).unwrap(),
        BarrierOutcome::Elided
    );
    assert_eq!(texture.state(), AccessState::ShaderRead);

    assert!(recorder.barrier(&texture, AccessState::UnorderedAccess).unwrap().emits());
    assert_eq!(
        recorder.barrier(&texture, AccessState::UnorderedAccess).unwrap(),
        BarrierOutcome::UavHazard
    );
    assert_eq!(texture.state(), AccessState::UnorderedAccess);

    let stats = recorder.stats();
    assert_eq!(stats.transitions, 2);
    assert_eq!(stats.uav_barriers, 1);
    assert_eq!(stats.elided_barriers, 1);
    // Elided requests record nothing.
    assert_eq!(recorder.commands().len(), 3);
    assert!(format!("{:?}", recorder.commands()).contains("UavBarrier"));

    recorder.end().unwrap();
    assert_eq!(recorder.state(), RecorderState::Closed);
}

#[test]
fn test_copy_requires_transitions() {
    let device = device_with_capacity(16);
    let src = device.create_buffer(64, 0, BufferKind::Staging, "src").unwrap();
    let dst = device.create_buffer(64, 0, BufferKind::Storage, "dst").unwrap();
    let mut recorder = device.create_recorder(QueueKind::Copy, "copies").unwrap();
    recorder.begin().unwrap();

    let err = recorder.copy_buffer_to_buffer(&dst, 0, &src, 0, 64).unwrap_err();
    assert!(matches!(err, RhiError::ContractViolation(_)));

    recorder.barrier(&src, AccessState::CopySource).unwrap();
    recorder.barrier(&dst, AccessState::CopyDest).unwrap();
    recorder.copy_buffer_to_buffer(&dst, 0, &src, 0, 64).unwrap();

    // Out of range.
    assert!(recorder.copy_buffer_to_buffer(&dst, 32, &src, 0, 64).is_err());
    // Copy recorders do not draw or dispatch.
    assert!(matches!(recorder.draw(3, 1, 0, 0), Err(RhiError::ContractViolation(_))));
    assert!(matches!(recorder.dispatch(1, 1, 1), Err(RhiError::ContractViolation(_))));
    assert_eq!(recorder.stats().copies, 1);
    assert_eq!(recorder.stats().draws, 0);
}

#[test]
fn test_recorder_lifecycle_violations() {
    let device = device_with_capacity(16);
    let mut recorder = device.create_recorder(QueueKind::Graphics, "lifecycle").unwrap();

    assert!(matches!(recorder.end(), Err(RhiError::ContractViolation(_))));
    recorder.begin().unwrap();
    assert!(matches!(recorder.begin(), Err(RhiError::ContractViolation(_))));

    recorder.begin_marker("unbalanced").unwrap();
    assert!(matches!(recorder.end(), Err(RhiError::ContractViolation(_))));
    assert_eq!(recorder.state(), RecorderState::Recording);
    recorder.end_marker().unwrap();
    assert!(matches!(recorder.end_marker(), Err(RhiError::ContractViolation(_))));
    recorder.end().unwrap();

    // An open recorder cannot be submitted.
    let queue = device.create_queue(QueueKind::Graphics);
    let mut open = device.create_recorder(QueueKind::Graphics, "open").unwrap();
    open.begin().unwrap();
    assert!(matches!(queue.submit(&[&open]), Err(RhiError::ContractViolation(_))));

    // Nor can a recorder go to a queue of another kind.
    let copy_queue = device.create_queue(QueueKind::Copy);
    assert!(matches!(
        copy_queue.submit(&[&recorder]),
        Err(RhiError::ContractViolation(_))
    ));
    queue.submit(&[&recorder]).unwrap();
    assert_eq!(queue.submissions(), 1);
}

#[test]
fn test_verbs_on_closed_recorder_are_rejected() {
    let device = device_with_capacity(16);
    let buffer = device.create_buffer(64, 0, BufferKind::Storage, "buffer").unwrap();
    let mut recorder = device.create_recorder(QueueKind::Graphics, "closed").unwrap();

    // Never begun.
    assert!(matches!(
        recorder.barrier(&buffer, AccessState::ShaderRead),
        Err(RhiError::ContractViolation(_))
    ));

    recorder.begin().unwrap();
    recorder.end().unwrap();
    assert!(matches!(
        recorder.barrier(&buffer, AccessState::ShaderRead),
        Err(RhiError::ContractViolation(_))
    ));
    assert!(recorder.uav_barrier(&buffer).is_err());
    assert!(recorder.set_viewport(Viewport::new(64.0, 64.0)).is_err());
    assert!(recorder.push_constants(&[0; 16]).is_err());
    assert!(recorder.begin_marker("late").is_err());
    assert!(recorder.end_marker().is_err());

    // Nothing was recorded and the stored state is untouched.
    assert_eq!(buffer.state(), AccessState::Common);
    assert!(recorder.commands().is_empty());
    assert_eq!(recorder.stats().transitions, 0);
    assert_eq!(recorder.state(), RecorderState::Closed);
}

#[test]
fn test_discarded_recordings_restore_states() {
    let device = device_with_capacity(16);
    let buffer = device.create_buffer(64, 0, BufferKind::Storage, "buffer").unwrap();
    let texture = device
        .create_texture(TextureDesc::new("texture", 4, 4, Format::Rgba8Unorm))
        .unwrap();
    let mut recorder = device.create_recorder(QueueKind::Graphics, "discard").unwrap();

    recorder.begin().unwrap();
    recorder.barrier(&buffer, AccessState::CopyDest).unwrap();
    recorder.barrier(&buffer, AccessState::ShaderRead).unwrap();
    recorder.barrier(&texture, AccessState::CopyDest).unwrap();
    recorder.reset();
    assert_eq!(recorder.state(), RecorderState::Initial);
    assert!(recorder.commands().is_empty());
    assert_eq!(buffer.state(), AccessState::Common);
    assert_eq!(texture.state(), AccessState::Common);

    // A failed end may be abandoned by beginning again.
    recorder.begin().unwrap();
    recorder.barrier(&buffer, AccessState::ShaderRead).unwrap();
    recorder.begin_marker("left open").unwrap();
    assert!(recorder.end().is_err());
    recorder.begin().unwrap();
    assert_eq!(buffer.state(), AccessState::Common);
    assert!(recorder.commands().is_empty());

    // Dropping an open recording undoes it too.
    recorder.barrier(&texture, AccessState::ShaderRead).unwrap();
    assert_eq!(texture.state(), AccessState::ShaderRead);
    drop(recorder);
    assert_eq!(texture.state(), AccessState::Common);
}

#[test]
fn test_mapping_is_scoped() {
    let device = device_with_capacity(16);
    let staging = device.create_buffer(16, 0, BufferKind::Staging, "staging").unwrap();
    let gpu_only = device.create_buffer(16, 0, BufferKind::Storage, "gpu").unwrap();

    {
        let mut mapping = staging.map().unwrap();
        mapping.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert!(matches!(staging.map(), Err(RhiError::ContractViolation(_))));
    }
    assert_eq!(staging.read(0, 4).unwrap(), vec![1, 2, 3, 4]);
    assert!(matches!(gpu_only.map(), Err(RhiError::ContractViolation(_))));
    assert!(staging.write(12, &[0; 8]).is_err());
}

#[test]
fn test_memory_stats_track_live_resources() {
    let device = device_with_capacity(16);
    let before = device.memory_stats();
    let buffer = device.create_buffer(1024, 0, BufferKind::Storage, "big").unwrap();
    let during = device.memory_stats();
    assert_eq!(during.buffers, before.buffers + 1);
    assert_eq!(during.buffer_bytes, before.buffer_bytes + 1024);
    drop(buffer);
    assert_eq!(device.memory_stats(), before);
}
