//! Headless keel demo.
//!
//! Uploads a triangle, a mipmapped checkerboard and (where supported) a
//! bottom-level acceleration structure, then runs a number of cleared
//! frames through the frame scheduler and logs the statistics.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytemuck::{Pod, Zeroable};
use clap::{Parser, ValueEnum};
use tracing::{error, info};

use keel_core::{RendererConfig, Timer};
use keel_renderer::{FrameScheduler, ImageData};
use keel_rhi::acceleration::AccelerationStructureInputs;
use keel_rhi::resource::{BufferKind, TextureDesc};
use keel_rhi::software::{ExecutionMode, SoftwareBackend, SoftwareConfig};
use keel_rhi::view::{ViewDesc, ViewDimension};
use keel_rhi::{AccessState, Backend, Format, RhiError, SurfaceTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    /// CPU emulation, always available
    Software,
    /// Vulkan 1.3 device (feature `vulkan`)
    Vulkan,
}

#[derive(Parser)]
#[command(name = "keel-demo")]
#[command(author, version, about = "Runs offscreen frames through the keel renderer", long_about = None)]
struct Args {
    /// Backend to run on
    #[arg(long, value_enum, default_value = "software")]
    backend: BackendChoice,

    /// Frames to render before exiting
    #[arg(short, long, default_value = "180")]
    frames: u64,

    /// Backbuffer width
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Backbuffer height
    #[arg(long, default_value = "720")]
    height: u32,

    /// Frames in flight (overrides KEEL_FRAMES_IN_FLIGHT)
    #[arg(long)]
    frames_in_flight: Option<usize>,

    /// Let the software queue lag behind until a fence wait drains it
    #[arg(long)]
    deferred: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DemoVertex {
    position: [f32; 3],
    color: [f32; 3],
}

const TRIANGLE: [DemoVertex; 3] = [
    DemoVertex {
        position: [0.0, -0.5, 0.0],
        color: [1.0, 0.0, 0.0],
    },
    DemoVertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0],
    },
    DemoVertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0],
    },
];

const CHECKER_SIZE: u32 = 64;

fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let lit = ((x / cell) + (y / cell)) % 2 == 0;
            let value = if lit { 230 } else { 40 };
            texels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    texels
}

fn create_backend(args: &Args, config: &RendererConfig) -> Result<Arc<dyn Backend>> {
    match args.backend {
        BackendChoice::Software => {
            let mut software = SoftwareConfig::default();
            if args.deferred {
                software = software.with_execution(ExecutionMode::Deferred);
            }
            Ok(Arc::new(SoftwareBackend::new(software)))
        }
        #[cfg(feature = "vulkan")]
        BackendChoice::Vulkan => {
            if args.deferred {
                tracing::warn!("--deferred only affects the software backend");
            }
            let backend = keel_rhi::vulkan::VulkanBackend::new(&keel_rhi::vulkan::VulkanConfig {
                validation: config.validation,
                ..Default::default()
            })
            .context("failed to create Vulkan backend")?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "vulkan"))]
        BackendChoice::Vulkan => {
            let _ = config;
            bail!("keel-demo was built without the `vulkan` feature")
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = RendererConfig::from_env()
        .context("invalid KEEL_* environment")?
        .with_extent(args.width, args.height);
    if let Some(frames) = args.frames_in_flight {
        config = config.with_frames_in_flight(frames);
    }

    let backend = create_backend(args, &config)?;
    let mut scheduler = FrameScheduler::with_backend(backend, SurfaceTarget::Offscreen, &config)
        .context("failed to create frame scheduler")?;
    let adapter = scheduler.device().adapter().clone();
    info!(
        "Running on {} ({}, {})",
        adapter.name, adapter.backend, adapter.device_type
    );

    // Static content
    let vertices = scheduler.create_buffer(
        size_of_val(&TRIANGLE) as u64,
        size_of::<DemoVertex>() as u32,
        BufferKind::Vertex,
        "triangle",
    )?;
    let checker_desc = TextureDesc::new("checkerboard", CHECKER_SIZE, CHECKER_SIZE, Format::Rgba8Unorm)
        .with_mip_levels(2);
    let checker = scheduler.create_texture(checker_desc)?;
    let image = ImageData::new(checkerboard(CHECKER_SIZE, 8))
        .with_mip(checkerboard(CHECKER_SIZE / 2, 4));

    let mut uploader = scheduler.create_uploader()?;
    uploader.enqueue_slice(&TRIANGLE, &vertices)?;
    uploader.enqueue_texture_upload(&image, &checker)?;

    let blas = if adapter.ray_tracing {
        let blas = scheduler.create_acceleration_structure(
            AccelerationStructureInputs::BottomLevel {
                vertices: Arc::clone(&vertices),
                vertex_count: TRIANGLE.len() as u32,
                vertex_stride: size_of::<DemoVertex>() as u32,
                indices: None,
                index_count: 0,
            },
            "triangle blas",
        )?;
        uploader.enqueue_acceleration_structure_build(&blas);
        Some(blas)
    } else {
        info!("Adapter has no ray tracing; skipping acceleration structure");
        None
    };

    let (upload, elapsed) = Timer::measure(|| {
        let value = uploader.flush()?;
        uploader.fence().wait(value)
    });
    upload.context("static upload failed")?;
    info!("Uploaded static content in {:?}", elapsed);
    if let Some(blas) = &blas {
        info!("Acceleration structure '{}' at {:#x}", blas.name(), blas.address());
    }

    let checker_view = scheduler.create_view(&checker, ViewDesc::shader_read(ViewDimension::Texture2D))?;
    info!("Checkerboard bound at shader-resource slot {}", checker_view.index());

    for index in 0..args.frames {
        let mut frame = scheduler.acquire_frame()?;
        let backbuffer = Arc::clone(frame.backbuffer());
        let target = Arc::clone(frame.backbuffer_view());
        let recorder = frame.recorder();

        // Elided after the first frame.
        recorder.barrier(&checker, AccessState::ShaderRead)?;
        recorder.barrier(&vertices, AccessState::ShaderRead)?;
        recorder.barrier(&backbuffer, AccessState::RenderTarget)?;

        let t = index as f32 / args.frames.max(1) as f32;
        recorder.clear_render_target(&target, [0.1, 0.1 + 0.4 * t, 0.3, 1.0])?;
        scheduler.end_frame(frame)?;
        scheduler.present(config.vsync)?;
    }

    uploader.clear_requests()?;
    scheduler.wait_idle()?;

    let stats = scheduler.stats();
    info!(
        "Rendered {} frames: {} barriers ({} elided), {} fence waits (avg {:?})",
        stats.frames,
        stats.barriers_emitted,
        stats.barriers_elided,
        stats.fence_waits,
        stats.average_wait()
    );
    let memory = scheduler.device().memory_stats();
    info!(
        "Live at exit: {} buffers, {} textures, {} bytes",
        memory.buffers,
        memory.textures,
        memory.total_bytes()
    );
    Ok(())
}

fn main() -> Result<()> {
    keel_core::init_logging();
    let args = Args::parse();
    if args.frames == 0 {
        bail!("--frames must be at least 1");
    }

    if let Err(e) = run(&args) {
        match e.downcast_ref::<RhiError>() {
            Some(rhi) if rhi.is_fatal() => error!("Fatal device error: {}", rhi),
            _ => error!("Demo failed: {:#}", e),
        }
        return Err(e);
    }
    info!("Done");
    Ok(())
}
