//! Frame Soak
//!
//! Drives the frame pipeline against the headless device for many frames:
//! an HDR scene pass, bloom and tone mapping into the surface, a per-frame
//! uniform upload, periodic resizes and the occasional out-of-date surface.
//! Prints renderer, resource and allocator statistics at the end.
//!
//! Usage: `frame_soak [frames] [frames_in_flight]` (defaults 2000 and 2).
//!
//! Set `RUST_LOG=debug` to watch pool growth and swapchain rebuilds.

use std::sync::Arc;

use anyhow::{Context, bail};
use glam::UVec2;
use sortie::core::device::{ImageLayout, SurfaceStatus};
use sortie::prelude::*;

const RESIZE_EVERY: u64 = 250;
const OUT_OF_DATE_EVERY: u64 = 97;
const SIZES: [UVec2; 4] = [
    UVec2::new(1280, 720),
    UVec2::new(800, 600),
    UVec2::new(1920, 1080),
    UVec2::new(333, 217),
];

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameUniforms {
    frame: u32,
    time: f32,
    extent: [f32; 2],
}

/// HDR color target the scene pass renders into, recreated on resize.
struct SceneTarget {
    handle: ResourceHandle,
    extent: UVec2,
}

impl SceneTarget {
    fn create(resources: &mut ResourceManager, extent: UVec2) -> anyhow::Result<Self> {
        let desc = ImageDesc::render_target("scene_color", extent, wgpu::TextureFormat::Rgba16Float);
        let handle = resources
            .create_image(&desc)
            .context("scene color target could not be created")?;
        Ok(Self { handle, extent })
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let frames: u64 = args.next().map(|a| a.parse()).transpose()?.unwrap_or(2000);
    let frames_in_flight: u32 = args.next().map(|a| a.parse()).transpose()?.unwrap_or(2);

    let settings = FrameSettings {
        frames_in_flight,
        log_statistics_every: 500,
        ..Default::default()
    };

    let device = Arc::new(HeadlessDevice::new());
    let mut renderer = FrameRenderer::new(device.clone(), device.clone(), settings)?;
    renderer.add_post_effect(BloomEffect::new())?;
    renderer.add_post_effect(ToneMappingEffect::new())?;

    // One uniform buffer per slot: a slot's buffer is only rewritten after
    // the frame that last read it has retired.
    let uniform_size = size_of::<FrameUniforms>() as u64;
    let mut uniforms = Vec::with_capacity(frames_in_flight as usize);
    for _ in 0..frames_in_flight {
        let buffer = renderer
            .resources_mut()
            .create_host_buffer(uniform_size, wgpu::BufferUsages::UNIFORM, true)
            .context("uniform buffer could not be created")?;
        uniforms.push(buffer);
    }
    let initial_extent = renderer.surface().extent();
    let mut scene = SceneTarget::create(renderer.resources_mut(), initial_extent)?;

    log::info!("Soaking {frames} frames with {frames_in_flight} frames in flight");

    for frame in 0..frames {
        if frame > 0 && frame % RESIZE_EVERY == 0 {
            let size = SIZES[((frame / RESIZE_EVERY) as usize) % SIZES.len()];
            renderer.resize(size.x, size.y);
        }
        if frame > 0 && frame % OUT_OF_DATE_EVERY == 0 {
            device.queue_acquire_status(SurfaceStatus::OutOfDate);
        }

        let extent = renderer.surface().extent();
        if extent != scene.extent {
            let resources = renderer.resources_mut();
            resources.mark_delete(scene.handle);
            scene = SceneTarget::create(resources, extent)?;
        }

        let data = FrameUniforms {
            frame: frame as u32,
            time: frame as f32 / 60.0,
            extent: [extent.x as f32, extent.y as f32],
        };

        let outcome = renderer.render_frame(|ctx| {
            let buffer = uniforms[ctx.frame_number as usize % uniforms.len()];
            ctx.resources.write_host_buffer(buffer, 0, bytemuck::bytes_of(&data));
            ctx.recorder.use_resource(ctx.resources, buffer);

            let Some(input) = PostImage::from_resource(ctx.resources, scene.handle) else {
                return;
            };
            ctx.recorder.use_resource(ctx.resources, scene.handle);
            ctx.recorder
                .image_barrier(input.image, ImageLayout::Undefined, ImageLayout::ColorAttachment);
            ctx.recorder
                .begin_rendering(input.view, input.extent, Some([0.1, 0.2, 0.3, 1.0]));
            ctx.recorder.set_viewport_scissor(input.extent);
            ctx.recorder.draw(36, 64);
            ctx.recorder.end_rendering();
            ctx.recorder.image_barrier(
                input.image,
                ImageLayout::ColorAttachment,
                ImageLayout::ShaderReadOnly,
            );

            ctx.run_post(&input);
        })?;

        if !outcome.is_presented() {
            log::debug!("Frame {frame} skipped");
        }
    }

    renderer.log_statistics();
    let stats = renderer.statistics();
    let resources = renderer.resources_mut();
    resources.mark_delete(scene.handle);
    for buffer in uniforms {
        resources.mark_delete(buffer);
    }
    renderer.shutdown()?;

    let headless = device.stats();
    println!("=== Frame Soak ===");
    println!("frames presented:    {}", stats.frames_presented);
    println!("frames skipped:      {}", stats.frames_skipped);
    println!("swapchain rebuilds:  {}", stats.swapchain_rebuilds);
    println!("submits:             {}", headless.submits);
    println!("fence waits:         {}", headless.fence_waits);
    println!("descriptor pools:    {}", headless.descriptor_pools_created);
    println!("descriptor sets:     {}", headless.descriptor_sets_allocated);
    println!("memory allocations:  {}", headless.memory_allocations);

    let leaked = device.live();
    if leaked.images > 0 || leaked.buffers > 0 || leaked.fences > 0 || leaked.command_buffers > 0 {
        bail!("objects still alive after shutdown: {leaked:?}");
    }
    drop(renderer);
    Ok(())
}
