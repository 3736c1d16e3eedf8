//! Rendering core for the voxtrace demo harness.
//!
//! The flow mirrors the shape of the harness itself:
//!
//! ```text
//!   CLI / voxtrace
//!          │ RendererConfig
//!          ▼
//!   Renderer::run ──▶ WindowState ──▶ winit event loop ──▶ render_slice()
//!                                              │
//!                                              ├─▶ shader reload check
//!                                              ├─▶ spiral tile plan / samples
//!                                              └─▶ throttled display + dump
//! ```
//!
//! `GpuState` (in `gpu`) owns every GPU resource and the frame state
//! machine; this module owns the window, translates platform events, and
//! decides when the process exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use winit::dpi::PhysicalSize;
use winit::event::{Event, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::{Window, WindowBuilder};

mod compile;
mod gpu;
mod lights;
mod readback;
mod reload;

pub use lights::{LightSet, MAX_LIGHTS};

use gpu::{FrameSlice, GpuState, RenderError};

/// Immutable configuration handed to the renderer at start-up.
#[derive(Clone)]
pub struct RendererConfig {
    /// Window size in physical pixels.
    pub surface_size: (u32, u32),
    /// Hot-reloaded vertex shader source watched for edits.
    pub vertex_shader: PathBuf,
    /// Hot-reloaded fragment shader source watched for edits.
    pub fragment_shader: PathBuf,
    /// Accumulation draws per tile.
    pub samples: u32,
    /// Screen subdivision: the spiral walks a `grid x grid` tile grid.
    pub grid: u32,
    /// Time base for the `u_time` uniform: `time = frame / fps`.
    pub time_base_fps: f32,
    /// Static light set uploaded once.
    pub lights: LightSet,
    /// Optional image bound to the trace shader's channel slot.
    pub channel_texture: Option<PathBuf>,
    /// Frame dump destination; `None` disables capture.
    pub dump: Option<capture::FrameSink>,
    /// Stop after this many frames; `None` runs until the window closes.
    pub max_frames: Option<u32>,
}

/// Entry point owning the configuration; all real work happens in
/// [`GpuState`] once the window exists.
pub struct Renderer {
    config: RendererConfig,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    /// Opens the window and drives the event loop until the frame limit is
    /// reached or the window is closed.
    pub fn run(&mut self) -> Result<()> {
        let event_loop = EventLoop::new().context("failed to initialize event loop")?;
        let window_size = PhysicalSize::new(self.config.surface_size.0, self.config.surface_size.1);
        let window = WindowBuilder::new()
            .with_title("voxtrace")
            .with_inner_size(window_size)
            .build(&event_loop)
            .context("failed to create window")?;
        let window = Arc::new(window);

        let mut state = WindowState::new(window.clone(), &self.config)?;
        state.window().request_redraw();

        event_loop
            .run(move |event, elwt| {
                elwt.set_control_flow(ControlFlow::Wait);

                match event {
                    Event::WindowEvent { window_id, event } if window_id == state.window().id() => {
                        match event {
                            WindowEvent::CloseRequested | WindowEvent::Destroyed => {
                                elwt.exit();
                            }
                            WindowEvent::Resized(new_size) => {
                                state.resize(new_size);
                            }
                            WindowEvent::ScaleFactorChanged {
                                mut inner_size_writer,
                                ..
                            } => {
                                // Keep the current physical size across DPI changes.
                                let _ = inner_size_writer.request_inner_size(state.size());
                            }
                            WindowEvent::RedrawRequested => match state.render_slice() {
                                Ok(FrameSlice::Continue) | Ok(FrameSlice::FrameComplete) => {}
                                Ok(FrameSlice::Finished) => {
                                    tracing::info!("frame limit reached; exiting");
                                    elwt.exit();
                                }
                                Err(RenderError::Surface(
                                    wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated,
                                )) => {
                                    state.resize(state.size());
                                }
                                Err(RenderError::Surface(wgpu::SurfaceError::OutOfMemory)) => {
                                    tracing::error!("surface out of memory; exiting");
                                    elwt.exit();
                                }
                                Err(RenderError::Surface(wgpu::SurfaceError::Timeout)) => {
                                    tracing::warn!("surface timeout; retrying next frame");
                                }
                                Err(RenderError::Surface(other)) => {
                                    tracing::warn!("surface error: {other:?}; retrying next frame");
                                }
                                Err(RenderError::Fatal(err)) => {
                                    tracing::error!(error = %format!("{err:#}"), "render failed");
                                    elwt.exit();
                                }
                            },
                            _ => {}
                        }
                    }
                    Event::AboutToWait => {
                        // Accumulation is open-ended: always schedule the
                        // next slice once the event queue drains.
                        state.window().request_redraw();
                    }
                    _ => {}
                }
            })
            .map_err(|err| anyhow!("event loop error: {err}"))
    }
}

/// Window plus the GPU state rendering into it.
struct WindowState {
    window: Arc<Window>,
    gpu: GpuState,
}

impl WindowState {
    fn new(window: Arc<Window>, config: &RendererConfig) -> Result<Self> {
        let size = window.inner_size();
        let gpu = GpuState::new(window.as_ref(), size, config)?;
        Ok(Self { window, gpu })
    }

    fn window(&self) -> &Window {
        self.window.as_ref()
    }

    fn size(&self) -> PhysicalSize<u32> {
        self.gpu.size()
    }

    fn resize(&mut self, new_size: PhysicalSize<u32>) {
        self.gpu.resize(new_size);
    }

    fn render_slice(&mut self) -> Result<FrameSlice, RenderError> {
        self.gpu.render_slice()
    }
}
