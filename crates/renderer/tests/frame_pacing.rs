//! Integration tests for the frame protocol on the software backend.

use std::sync::Arc;
use std::time::Duration;

use keel_core::RendererConfig;
use keel_renderer::{FramePhase, FrameScheduler};
use keel_rhi::resource::Resource;
use keel_rhi::software::SoftwareBackend;
use keel_rhi::{AccessState, PresentStatus, RhiError, RhiResult, SurfaceTarget};

fn scheduler(backend: &Arc<SoftwareBackend>, config: &RendererConfig) -> FrameScheduler {
    FrameScheduler::with_backend(backend.clone(), SurfaceTarget::Offscreen, config).unwrap()
}

/// Clears the backbuffer and presents. Returns the frame's slot.
fn render_frame(scheduler: &mut FrameScheduler) -> RhiResult<u32> {
    let mut frame = scheduler.acquire_frame()?;
    let backbuffer = Arc::clone(frame.backbuffer());
    let view = Arc::clone(frame.backbuffer_view());
    let recorder = frame.recorder();
    recorder.barrier(&backbuffer, AccessState::RenderTarget)?;
    recorder.clear_render_target(&view, [0.1, 0.2, 0.3, 1.0])?;

    let slot = frame.slot();
    scheduler.end_frame(frame)?;
    assert_eq!(scheduler.present(false)?, PresentStatus::Presented);
    Ok(slot)
}

#[test]
fn test_frames_in_flight_are_bounded() {
    let backend = Arc::new(SoftwareBackend::deferred());
    let config = RendererConfig::default()
        .with_frames_in_flight(3)
        .with_extent(64, 64);
    let mut scheduler = scheduler(&backend, &config);
    assert_eq!(scheduler.slot_count(), 3);

    for expected_slot in [0, 1, 2, 0, 1, 2] {
        let slot = render_frame(&mut scheduler).unwrap();
        assert_eq!(slot, expected_slot);
        let fence = scheduler.fence();
        let outstanding = fence.last_signaled() - fence.completed_value().unwrap();
        assert!(outstanding <= 3, "{} frames in flight", outstanding);
    }

    // The first lap ran without blocking; each later acquisition waited once.
    let stats = scheduler.stats();
    assert_eq!(stats.frames, 6);
    assert_eq!(stats.fence_waits, 3);
    assert_eq!(stats.barriers_emitted, 12);
    assert_eq!(stats.barriers_elided, 0);
    assert_eq!(scheduler.slot_fence_value(0), Some(4));
    assert_eq!(scheduler.slot_fence_value(2), Some(6));
    assert_eq!(scheduler.slot_fence_value(3), None);

    scheduler.wait_idle().unwrap();
    assert_eq!(backend.pending_work(), 0);
    assert_eq!(scheduler.phase(), FramePhase::Idle);
}

#[test]
fn test_immediate_backend_never_waits() {
    let backend = Arc::new(SoftwareBackend::default());
    let mut scheduler = scheduler(&backend, &RendererConfig::default().with_extent(32, 32));
    for _ in 0..5 {
        render_frame(&mut scheduler).unwrap();
    }
    assert_eq!(scheduler.stats().frames, 5);
    assert_eq!(scheduler.stats().fence_waits, 0);
    assert_eq!(scheduler.stats().average_wait(), Duration::ZERO);
}

#[test]
fn test_phase_misuse_is_rejected() {
    let backend = Arc::new(SoftwareBackend::default());
    let mut scheduler = scheduler(&backend, &RendererConfig::default().with_extent(32, 32));

    assert!(matches!(scheduler.present(false), Err(RhiError::ContractViolation(_))));
    assert_eq!(scheduler.phase(), FramePhase::Idle);

    let frame = scheduler.acquire_frame().unwrap();
    assert_eq!(scheduler.phase(), FramePhase::FrameAcquired);
    assert!(matches!(scheduler.acquire_frame(), Err(RhiError::ContractViolation(_))));
    assert!(matches!(scheduler.present(false), Err(RhiError::ContractViolation(_))));
    assert!(matches!(scheduler.resize(16, 16), Err(RhiError::ContractViolation(_))));
    assert_eq!(scheduler.phase(), FramePhase::FrameAcquired);

    // Extra work goes ahead of the frame's own recorder.
    let mut extra = scheduler.create_recorder("extra").unwrap();
    extra.begin().unwrap();
    extra.end().unwrap();
    scheduler.submit(&[&extra]).unwrap();
    assert_eq!(scheduler.phase(), FramePhase::Recorded);

    scheduler.end_frame(frame).unwrap();
    assert_eq!(scheduler.phase(), FramePhase::Submitted);
    assert!(matches!(scheduler.submit(&[&extra]), Err(RhiError::ContractViolation(_))));
    assert!(matches!(scheduler.acquire_frame(), Err(RhiError::ContractViolation(_))));
    assert_eq!(scheduler.phase(), FramePhase::Submitted);

    scheduler.present(true).unwrap();
    assert_eq!(scheduler.phase(), FramePhase::Idle);
    assert_eq!(scheduler.queue().submissions(), 2);
}

#[test]
fn test_closed_recorder_must_leave_backbuffer_presentable() {
    let backend = Arc::new(SoftwareBackend::default());
    let mut scheduler = scheduler(&backend, &RendererConfig::default().with_extent(32, 32));

    let mut frame = scheduler.acquire_frame().unwrap();
    let backbuffer = Arc::clone(frame.backbuffer());
    frame.recorder().barrier(&backbuffer, AccessState::RenderTarget).unwrap();
    frame.recorder().end().unwrap();

    let err = scheduler.end_frame(frame).unwrap_err();
    assert!(matches!(err, RhiError::ContractViolation(_)));
    assert!(!err.is_fatal());
    assert_eq!(scheduler.queue().submissions(), 0);

    // The frame was abandoned and its transition undone.
    assert_eq!(scheduler.phase(), FramePhase::Idle);
    assert_eq!(backbuffer.state(), AccessState::Present);
    assert_eq!(render_frame(&mut scheduler).unwrap(), 0);
    assert_eq!(render_frame(&mut scheduler).unwrap(), 1);
    assert_eq!(scheduler.stats().frames, 2);
}

#[test]
fn test_failed_end_frame_is_recoverable() {
    let backend = Arc::new(SoftwareBackend::default());
    let mut scheduler = scheduler(&backend, &RendererConfig::default().with_extent(32, 32));

    let mut frame = scheduler.acquire_frame().unwrap();
    let slot = frame.slot();
    let backbuffer = Arc::clone(frame.backbuffer());
    frame.recorder().barrier(&backbuffer, AccessState::RenderTarget).unwrap();
    frame.recorder().begin_marker("left open").unwrap();

    let err = scheduler.end_frame(frame).unwrap_err();
    assert!(matches!(err, RhiError::ContractViolation(_)));
    assert_eq!(scheduler.phase(), FramePhase::Idle);
    assert_eq!(scheduler.queue().submissions(), 0);
    assert_eq!(scheduler.slot_fence_value(slot), Some(0));
    assert_eq!(backbuffer.state(), AccessState::Present);

    // The still-acquired backbuffer is handed out again.
    assert_eq!(render_frame(&mut scheduler).unwrap(), slot);
    scheduler.resize(16, 16).unwrap();
    render_frame(&mut scheduler).unwrap();
    assert_eq!(scheduler.stats().frames, 2);
}

#[test]
fn test_dropped_frame_is_abandoned() {
    let backend = Arc::new(SoftwareBackend::default());
    let mut scheduler = scheduler(&backend, &RendererConfig::default().with_extent(32, 32));

    let mut frame = scheduler.acquire_frame().unwrap();
    let slot = frame.slot();
    let backbuffer = Arc::clone(frame.backbuffer());
    frame.recorder().barrier(&backbuffer, AccessState::RenderTarget).unwrap();
    drop(frame);
    assert_eq!(backbuffer.state(), AccessState::Present);

    // The slot's recorder went with the frame and is recreated.
    assert_eq!(render_frame(&mut scheduler).unwrap(), slot);
    assert_eq!(render_frame(&mut scheduler).unwrap(), slot + 1);
    assert_eq!(scheduler.queue().submissions(), 2);
    assert_eq!(scheduler.phase(), FramePhase::Idle);
}

#[test]
fn test_foreign_frame_is_rejected() {
    let backend = Arc::new(SoftwareBackend::default());
    let config = RendererConfig::default().with_extent(32, 32);
    let mut first = scheduler(&backend, &config);
    let mut second = scheduler(&backend, &config);

    let frame = first.acquire_frame().unwrap();
    assert!(matches!(second.end_frame(frame), Err(RhiError::ContractViolation(_))));
    assert_eq!(second.phase(), FramePhase::Idle);
    assert_eq!(second.queue().submissions(), 0);

    // The rejected frame was dropped, so the first scheduler recovers.
    render_frame(&mut first).unwrap();
}

#[test]
fn test_device_loss_is_fatal() {
    let backend = Arc::new(SoftwareBackend::deferred());
    let config = RendererConfig::default()
        .with_extent(32, 32)
        .with_fence_timeout(Duration::from_millis(10));
    let mut scheduler = scheduler(&backend, &config);
    for _ in 0..2 {
        render_frame(&mut scheduler).unwrap();
    }

    backend.simulate_device_loss("test");
    let err = scheduler.acquire_frame().unwrap_err();
    assert!(matches!(err, RhiError::DeviceLost(_)), "{err}");
    assert!(err.is_fatal());
}

#[test]
fn test_hung_queue_times_out() {
    let backend = Arc::new(SoftwareBackend::deferred());
    let config = RendererConfig::default()
        .with_frames_in_flight(2)
        .with_extent(32, 32)
        .with_fence_timeout(Duration::from_millis(10));
    let mut scheduler = scheduler(&backend, &config);
    render_frame(&mut scheduler).unwrap();
    render_frame(&mut scheduler).unwrap();

    backend.simulate_hang(true);
    let err = scheduler.acquire_frame().unwrap_err();
    assert!(
        matches!(err, RhiError::FenceTimeout { value: 1, completed: 0 }),
        "{err}"
    );
    assert!(err.is_fatal());
    backend.simulate_hang(false);
}

#[test]
fn test_resize_recreates_backbuffers() {
    let backend = Arc::new(SoftwareBackend::deferred());
    let mut scheduler = scheduler(&backend, &RendererConfig::default().with_extent(64, 48));
    render_frame(&mut scheduler).unwrap();

    scheduler.resize(320, 200).unwrap();
    assert_eq!(backend.pending_work(), 0);
    assert_eq!(scheduler.surface().extent(), (320, 200));
    assert_eq!((scheduler.config().width, scheduler.config().height), (320, 200));

    let frame = scheduler.acquire_frame().unwrap();
    assert_eq!((frame.width(), frame.height()), (320, 200));
    assert_eq!(frame.backbuffer().desc().width, 320);
    scheduler.end_frame(frame).unwrap();
    scheduler.present(false).unwrap();

    assert!(scheduler.resize(0, 10).is_err());
}

#[test]
fn test_invalid_config_is_rejected() {
    let backend = Arc::new(SoftwareBackend::default());
    for config in [
        RendererConfig::default().with_frames_in_flight(0),
        RendererConfig::default().with_frames_in_flight(keel_core::MAX_FRAMES_IN_FLIGHT + 1),
        RendererConfig::default().with_heap_capacities(0, 16, 16, 16),
        RendererConfig::default().with_extent(0, 600),
    ] {
        let result = FrameScheduler::with_backend(backend.clone(), SurfaceTarget::Offscreen, &config);
        assert!(matches!(result, Err(RhiError::ContractViolation(_))));
    }
}
