//! GPU state for the progressive tiled tracer.
//!
//! One `GpuState` owns every GPU resource: the swapchain surface, the
//! offscreen accumulation target, both pipelines, and the uniform buffers.
//! The render loop is an explicit state machine: each call to
//! [`GpuState::render_slice`] advances a bounded number of accumulation
//! draws, presents when the display throttle grants one, and reports when a
//! whole frame (one spiral over the tile grid) has finished. Keeping slices
//! short means window events - including close requests - are honoured at
//! sample granularity, just like the original single-threaded loop polled
//! events between draws.

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use bytemuck::{Pod, Zeroable};
use rand::prelude::*;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tiler::{DisplayThrottle, SamplePlan, Step};
use winit::dpi::PhysicalSize;

use crate::compile::{self, ACCUM_FORMAT, DEPTH_FORMAT};
use crate::lights::{LightSet, MAX_LIGHTS};
use crate::readback::PendingReadback;
use crate::reload::{ShaderPaths, SourceFingerprint};
use crate::RendererConfig;

/// Upper bound on accumulation draws per `render_slice` call, so the event
/// loop gets control back even when the display throttle stays closed.
const MAX_DRAWS_PER_SLICE: u32 = 256;

/// Pixel-rect sentinel telling the display shader "no tile in progress".
const NO_TILE: [f32; 4] = [-1.0, -1.0, -1.0, -1.0];

/// Blending on Rgba32Float is an adapter-specific format capability, not a
/// spec guarantee; the device must opt in to the per-format feature table to
/// use it.
const ACCUM_REQUIRED_FEATURES: wgpu::Features =
    wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;

/// Whether the adapter can blend into the accumulation format at all.
fn float_accumulation_supported(adapter: &wgpu::Adapter) -> bool {
    adapter.features().contains(ACCUM_REQUIRED_FEATURES)
        && adapter
            .get_texture_format_features(ACCUM_FORMAT)
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::BLENDABLE)
}

/// Outcome of one render slice.
pub(crate) enum FrameSlice {
    /// More samples remain in the current frame.
    Continue,
    /// The frame finished: final display pass done, dump written if enabled.
    FrameComplete,
    /// The configured frame limit was reached; the loop should exit.
    Finished,
}

/// Errors escaping the render loop. Surface errors are usually recoverable
/// (reconfigure and retry); fatal errors end the run.
pub(crate) enum RenderError {
    Surface(wgpu::SurfaceError),
    Fatal(anyhow::Error),
}

impl From<wgpu::SurfaceError> for RenderError {
    fn from(err: wgpu::SurfaceError) -> Self {
        RenderError::Surface(err)
    }
}

impl From<anyhow::Error> for RenderError {
    fn from(err: anyhow::Error) -> Self {
        RenderError::Fatal(err)
    }
}

/// Per-sample uniform block for the trace pass. Layout must match the
/// `TraceParams` std140 block declared by the trace shaders.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct TraceParams {
    resolution: [f32; 2],
    time: f32,
    seed: i32,
    /// Normalized tile bounds: x0, x1, y0, y1.
    tile: [f32; 4],
    samples: i32,
    sample_index: i32,
    light_count: i32,
    _pad: f32,
}

unsafe impl Zeroable for TraceParams {}
unsafe impl Pod for TraceParams {}

/// Static light array uploaded once at startup. std140 pads each element of
/// both arrays to 16 bytes, hence the vec4-shaped rows.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct LightsUniform {
    positions: [[f32; 4]; MAX_LIGHTS],
    colors: [[i32; 4]; MAX_LIGHTS],
}

unsafe impl Zeroable for LightsUniform {}
unsafe impl Pod for LightsUniform {}

impl LightsUniform {
    fn from_set(lights: &LightSet) -> Self {
        let mut uniform = Self {
            positions: [[0.0; 4]; MAX_LIGHTS],
            colors: [[0; 4]; MAX_LIGHTS],
        };
        for (slot, pos) in uniform.positions.iter_mut().zip(lights.positions()) {
            *slot = *pos;
        }
        for (slot, col) in uniform.colors.iter_mut().zip(lights.colors()) {
            slot[0] = *col;
        }
        uniform
    }
}

/// Uniform block for the display pass.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct DisplayParams {
    /// Pixel-space rect of the in-progress tile, or [`NO_TILE`].
    tile_px: [f32; 4],
    sample_count: i32,
    samples: i32,
    _pad: [f32; 2],
}

unsafe impl Zeroable for DisplayParams {}
unsafe impl Pod for DisplayParams {}

/// Offscreen accumulation target: float color plus matching depth.
///
/// The pair is always created together and replaced together; a draw call
/// never observes a half-rebuilt target.
struct RenderTarget {
    _color: wgpu::Texture,
    color_view: wgpu::TextureView,
    _depth: wgpu::Texture,
    depth_view: wgpu::TextureView,
}

impl RenderTarget {
    fn new(device: &wgpu::Device, size: PhysicalSize<u32>) -> Self {
        let extent = wgpu::Extent3d {
            width: size.width.max(1),
            height: size.height.max(1),
            depth_or_array_layers: 1,
        };

        let color = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("accumulation color"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: ACCUM_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("accumulation depth"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });

        let color_view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            _color: color,
            color_view,
            _depth: depth,
            depth_view,
        }
    }
}

/// Texture input exposed to the trace shader on bind group 1.
struct ChannelResources {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

pub(crate) struct GpuState {
    /// Kept alive for the surface lifetime.
    _instance: wgpu::Instance,
    limits: wgpu::Limits,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    size: PhysicalSize<u32>,

    trace_pipeline_layout: wgpu::PipelineLayout,
    trace_pipeline: wgpu::RenderPipeline,
    display_pipeline: wgpu::RenderPipeline,

    params_buffer: wgpu::Buffer,
    display_buffer: wgpu::Buffer,
    trace_bind_group: wgpu::BindGroup,
    channel_bind_group: wgpu::BindGroup,
    _channel: ChannelResources,
    display_layout: wgpu::BindGroupLayout,
    display_bind_group: wgpu::BindGroup,
    display_sampler: wgpu::Sampler,

    target: RenderTarget,

    shader_paths: ShaderPaths,
    fingerprint: SourceFingerprint,

    samples: u32,
    grid: u32,
    time_base_fps: f32,
    max_frames: Option<u32>,
    sink: Option<capture::FrameSink>,

    params: TraceParams,
    plan: SamplePlan,
    throttle: DisplayThrottle,
    /// True when the next slice must clear the target and re-check shaders.
    frame_fresh: bool,
    frame: u32,
    frame_started: Instant,
    rng: StdRng,
}

impl GpuState {
    pub(crate) fn new<T>(
        target: &T,
        initial_size: PhysicalSize<u32>,
        config: &RendererConfig,
    ) -> Result<Self>
    where
        T: HasDisplayHandle + HasWindowHandle,
    {
        let instance = wgpu::Instance::default();
        let window_handle = target
            .window_handle()
            .map_err(|err| anyhow!("failed to acquire window handle: {err}"))?;
        let display_handle = target
            .display_handle()
            .map_err(|err| anyhow!("failed to acquire display handle: {err}"))?;
        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: display_handle.as_raw(),
                raw_window_handle: window_handle.as_raw(),
            })
        }
        .context("failed to create rendering surface")?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .context("failed to find a suitable GPU adapter")?;

        // Additive blending into an Rgba32Float attachment is the heart of
        // the accumulator; an adapter that cannot do it cannot run at all.
        if !float_accumulation_supported(&adapter) {
            anyhow::bail!(
                "adapter does not support blending into float32 render targets; \
                 the accumulation buffer cannot be created"
            );
        }

        let limits = adapter.limits();
        let max_dimension = limits.max_texture_dimension_2d;
        let width = initial_size.width.max(1);
        let height = initial_size.height.max(1);
        if width > max_dimension || height > max_dimension {
            anyhow::bail!(
                "GPU max texture dimension is {max_dimension}, requested surface is {width}x{height}"
            );
        }

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("voxtrace device"),
            required_features: ACCUM_REQUIRED_FEATURES,
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|format| format.is_srgb())
            .unwrap_or(surface_caps.formats[0]);

        let size = PhysicalSize::new(width, height);
        let surface_config = wgpu::SurfaceConfiguration {
            // COPY_SRC lets the frame dump read back exactly what was presented.
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            format: surface_format,
            width: size.width,
            height: size.height,
            present_mode: surface_caps.present_modes[0],
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &surface_config);
        tracing::info!(
            width,
            height,
            format = ?surface_format,
            "configured surface"
        );

        // Trace bind group 0: per-sample params plus the static light array.
        let trace_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("trace uniform layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        // Trace bind group 1: the optional channel texture.
        let channel_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("channel layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let trace_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("trace pipeline layout"),
                bind_group_layouts: &[&trace_layout, &channel_layout],
                push_constant_ranges: &[],
            });

        // Display bind group: normalisation params plus the accumulation
        // texture. Rgba32Float is not filterable without an extra feature,
        // and the display pass only ever texelFetches, so non-filtering.
        let display_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("display layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                    count: None,
                },
            ],
        });

        let display_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("display pipeline layout"),
                bind_group_layouts: &[&display_layout],
                push_constant_ranges: &[],
            });

        let shader_paths = ShaderPaths {
            vertex: config.vertex_shader.clone(),
            fragment: config.fragment_shader.clone(),
        };
        let fingerprint = SourceFingerprint::probe(&shader_paths);

        let vertex_source = fs::read_to_string(&shader_paths.vertex).with_context(|| {
            format!(
                "failed to read vertex shader at {}",
                shader_paths.vertex.display()
            )
        })?;
        let fragment_source = fs::read_to_string(&shader_paths.fragment).with_context(|| {
            format!(
                "failed to read fragment shader at {}",
                shader_paths.fragment.display()
            )
        })?;

        let trace_pipeline = compile::build_trace_pipeline(
            &device,
            &trace_pipeline_layout,
            &vertex_source,
            &fragment_source,
        )
        .context("initial trace shader build failed")?;
        let display_pipeline =
            compile::build_display_pipeline(&device, &display_pipeline_layout, surface_format)?;

        let params = TraceParams {
            resolution: [size.width as f32, size.height as f32],
            time: 0.0,
            seed: 0,
            tile: [0.0, 1.0, 0.0, 1.0],
            samples: config.samples as i32,
            sample_index: 0,
            light_count: config.lights.len() as i32,
            _pad: 0.0,
        };
        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("trace params"),
            size: std::mem::size_of::<TraceParams>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let lights_uniform = LightsUniform::from_set(&config.lights);
        let lights_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("trace lights"),
            size: std::mem::size_of::<LightsUniform>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&lights_buffer, 0, bytemuck::bytes_of(&lights_uniform));

        let display_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("display params"),
            size: std::mem::size_of::<DisplayParams>() as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let trace_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("trace bind group"),
            layout: &trace_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: lights_buffer.as_entire_binding(),
                },
            ],
        });

        let channel = create_channel_resources(&device, &queue, config.channel_texture.as_deref())?;
        let channel_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("channel bind group"),
            layout: &channel_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&channel.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&channel.sampler),
                },
            ],
        });

        let target = RenderTarget::new(&device, size);
        let display_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let display_bind_group = create_display_bind_group(
            &device,
            &display_layout,
            &display_buffer,
            &target.color_view,
            &display_sampler,
        );

        let now = Instant::now();
        let plan = SamplePlan::new(config.grid, config.samples)
            .map_err(|err| anyhow!("invalid tile plan: {err}"))?;

        Ok(Self {
            _instance: instance,
            limits,
            surface,
            device,
            queue,
            config: surface_config,
            size,
            trace_pipeline_layout,
            trace_pipeline,
            display_pipeline,
            params_buffer,
            display_buffer,
            trace_bind_group,
            channel_bind_group,
            _channel: channel,
            display_layout,
            display_bind_group,
            display_sampler,
            target,
            shader_paths,
            fingerprint,
            samples: config.samples,
            grid: config.grid,
            time_base_fps: config.time_base_fps,
            max_frames: config.max_frames,
            sink: config.dump.clone(),
            params,
            plan,
            throttle: DisplayThrottle::sixty_hz(now),
            frame_fresh: true,
            frame: 1,
            frame_started: now,
            rng: StdRng::from_entropy(),
        })
    }

    pub(crate) fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    /// Reconfigures the swapchain and rebuilds the accumulation target.
    ///
    /// The in-progress frame restarts: tile plan, throttle and clear flag are
    /// reset because the old accumulation contents are gone with the target.
    pub(crate) fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width == 0 || new_size.height == 0 {
            return;
        }
        let max_dimension = self.limits.max_texture_dimension_2d;
        if new_size.width > max_dimension || new_size.height > max_dimension {
            tracing::warn!(
                width = new_size.width,
                height = new_size.height,
                max_dimension,
                "resize exceeds GPU limits; keeping previous size"
            );
            return;
        }

        self.size = new_size;
        self.config.width = new_size.width;
        self.config.height = new_size.height;
        self.surface.configure(&self.device, &self.config);

        self.target = RenderTarget::new(&self.device, new_size);
        self.display_bind_group = create_display_bind_group(
            &self.device,
            &self.display_layout,
            &self.display_buffer,
            &self.target.color_view,
            &self.display_sampler,
        );

        self.params.resolution = [new_size.width as f32, new_size.height as f32];
        self.restart_frame();
        tracing::debug!(
            width = new_size.width,
            height = new_size.height,
            "resized accumulation target"
        );
    }

    fn restart_frame(&mut self) {
        // grid/samples were validated at startup; rebuilding cannot fail.
        if let Ok(plan) = SamplePlan::new(self.grid, self.samples) {
            self.plan = plan;
        }
        self.frame_fresh = true;
        self.throttle.rearm(Instant::now());
    }

    /// Polls shader mtimes and swaps in a freshly validated pipeline.
    ///
    /// A failed rebuild (unreadable source, compile or link error) logs the
    /// diagnostic and leaves the previous pipeline bound. The new fingerprint
    /// is stored either way so a broken save is compiled once, not every
    /// frame; the next edit triggers another attempt.
    fn check_reload(&mut self) {
        let probe = SourceFingerprint::probe(&self.shader_paths);
        if probe == self.fingerprint {
            return;
        }
        self.fingerprint = probe;
        tracing::info!(
            vertex = %self.shader_paths.vertex.display(),
            fragment = %self.shader_paths.fragment.display(),
            "shader sources changed; recompiling"
        );

        let sources = fs::read_to_string(&self.shader_paths.vertex).and_then(|vertex| {
            fs::read_to_string(&self.shader_paths.fragment).map(|fragment| (vertex, fragment))
        });
        let (vertex_source, fragment_source) = match sources {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "shader source unreadable; keeping previous program");
                return;
            }
        };

        match compile::build_trace_pipeline(
            &self.device,
            &self.trace_pipeline_layout,
            &vertex_source,
            &fragment_source,
        ) {
            Ok(pipeline) => {
                self.trace_pipeline = pipeline;
                tracing::info!("shader reload complete");
            }
            Err(err) => {
                tracing::error!(error = %err, "shader reload failed; keeping previous program");
            }
        }
    }

    /// Advances the frame state machine by a bounded amount of work.
    pub(crate) fn render_slice(&mut self) -> Result<FrameSlice, RenderError> {
        if self.frame_fresh {
            self.check_reload();
            self.clear_target();
            self.frame_started = Instant::now();
            self.frame_fresh = false;
        }

        for _ in 0..MAX_DRAWS_PER_SLICE {
            match self.plan.next() {
                Some(step) => {
                    self.draw_sample(&step);
                    if self.throttle.ready(Instant::now()) {
                        let tile_px = step.tile.to_pixels(self.size.width, self.size.height);
                        self.present_display(step.sample + 1, tile_px, false)?;
                        return Ok(FrameSlice::Continue);
                    }
                }
                None => return self.finish_frame(),
            }
        }

        Ok(FrameSlice::Continue)
    }

    /// Clears the accumulation color and depth at the start of a frame.
    fn clear_target(&mut self) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("clear encoder"),
            });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("accumulation clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.target.color_view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.target.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Issues one accumulation draw for the given plan step.
    ///
    /// Each sample is its own submission: uniform writes take effect at
    /// submit time, so batching draws into one encoder would make every draw
    /// see only the last sample's parameters.
    fn draw_sample(&mut self, step: &Step) {
        self.params.time = self.frame as f32 / self.time_base_fps;
        self.params.seed = self.rng.gen();
        self.params.sample_index = step.sample as i32;
        self.params.tile = [step.tile.x0, step.tile.x1, step.tile.y0, step.tile.y1];
        self.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&self.params));

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("sample encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("accumulation pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target.color_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.trace_pipeline);
            pass.set_bind_group(0, &self.trace_bind_group, &[]);
            pass.set_bind_group(1, &self.channel_bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Runs the display pass and presents, optionally capturing the result.
    fn present_display(
        &mut self,
        sample_count: u32,
        tile_px: [f32; 4],
        capture_frame: bool,
    ) -> Result<(), RenderError> {
        let display = DisplayParams {
            tile_px,
            sample_count: sample_count as i32,
            samples: self.samples as i32,
            _pad: [0.0; 2],
        };
        self.queue
            .write_buffer(&self.display_buffer, 0, bytemuck::bytes_of(&display));

        let frame = self.surface.get_current_texture()?;
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("display encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("display pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.display_pipeline);
            pass.set_bind_group(0, &self.display_bind_group, &[]);
            pass.draw(0..3, 0..1);
        }

        let pending = if capture_frame && self.sink.is_some() {
            match PendingReadback::record(
                &self.device,
                &mut encoder,
                &frame.texture,
                self.size.width,
                self.size.height,
            ) {
                Ok(pending) => Some(pending),
                Err(err) => {
                    tracing::warn!(error = %err, "frame capture setup failed; skipping dump");
                    None
                }
            }
        } else {
            None
        };

        self.queue.submit(std::iter::once(encoder.finish()));
        frame.present();

        if let (Some(pending), Some(sink)) = (pending, self.sink.as_ref()) {
            // Dump problems are logged and the frame skipped, never fatal.
            match pending.resolve_bgr(&self.device) {
                Ok(bgr) => {
                    if let Err(err) =
                        sink.write_frame(self.frame, self.size.width, self.size.height, &bgr)
                    {
                        tracing::warn!(error = %err, frame = self.frame, "frame dump failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, frame = self.frame, "frame readback failed");
                }
            }
        }

        Ok(())
    }

    /// Final display pass of a frame, dump, bookkeeping, next-frame setup.
    fn finish_frame(&mut self) -> Result<FrameSlice, RenderError> {
        self.present_display(self.samples, NO_TILE, true)?;

        let elapsed = self.frame_started.elapsed();
        match self.max_frames {
            Some(max) => {
                let remaining = max.saturating_sub(self.frame);
                tracing::info!(
                    frame = self.frame,
                    ms = elapsed.as_millis() as u64,
                    eta_s = (remaining as f32 * elapsed.as_secs_f32()) as u64,
                    "frame complete"
                );
                if self.frame >= max {
                    return Ok(FrameSlice::Finished);
                }
            }
            None => {
                tracing::debug!(
                    frame = self.frame,
                    ms = elapsed.as_millis() as u64,
                    "frame complete"
                );
            }
        }

        self.frame += 1;
        self.restart_frame();
        Ok(FrameSlice::FrameComplete)
    }
}

fn create_display_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    display_buffer: &wgpu::Buffer,
    accum_view: &wgpu::TextureView,
    sampler: &wgpu::Sampler,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("display bind group"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: display_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::TextureView(accum_view),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::Sampler(sampler),
            },
        ],
    })
}

/// Loads the optional channel texture, falling back to a 1x1 white pixel so
/// the shader-side binding is always valid.
fn create_channel_resources(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    path: Option<&Path>,
) -> Result<ChannelResources> {
    use wgpu::util::{DeviceExt, TextureDataOrder};

    let (rgba, width, height, label) = match path {
        Some(path) => match load_channel_image(path) {
            Ok((rgba, width, height)) => {
                tracing::info!(path = %path.display(), width, height, "loaded channel texture");
                (rgba, width, height, "channel texture")
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to load channel texture; using placeholder"
                );
                (vec![255u8; 4], 1, 1, "placeholder channel texture")
            }
        },
        None => (vec![255u8; 4], 1, 1, "placeholder channel texture"),
    };

    let texture = device.create_texture_with_data(
        queue,
        &wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        TextureDataOrder::LayerMajor,
        &rgba,
    );

    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        address_mode_u: wgpu::AddressMode::Repeat,
        address_mode_v: wgpu::AddressMode::Repeat,
        address_mode_w: wgpu::AddressMode::Repeat,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    });

    Ok(ChannelResources {
        _texture: texture,
        view,
        sampler,
    })
}

fn load_channel_image(path: &Path) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::open(path)
        .with_context(|| format!("failed to open texture at {}", path.display()))?;
    let mut rgba = image.to_rgba8();
    let (width, height) = (rgba.width(), rgba.height());
    if width == 0 || height == 0 {
        anyhow::bail!("texture at {} has zero extent", path.display());
    }
    image::imageops::flip_vertical_in_place(&mut rgba);
    Ok((rgba.into_raw(), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_gate_checks_the_per_format_table() {
        // Blendability of Rgba32Float lives in the adapter's per-format
        // feature table; the device request must carry the feature that
        // unlocks it.
        assert!(ACCUM_REQUIRED_FEATURES
            .contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES));
        assert!(wgpu::TextureFormatFeatureFlags::all()
            .contains(wgpu::TextureFormatFeatureFlags::BLENDABLE));
    }
}
