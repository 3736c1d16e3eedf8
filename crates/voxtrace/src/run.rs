use anyhow::{Context, Result};
use capture::FrameSink;
use renderer::{LightSet, Renderer, RendererConfig, MAX_LIGHTS};
use tracing_subscriber::EnvFilter;

use crate::cli::{parse_surface_size, Cli};

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

pub fn run(cli: Cli) -> Result<()> {
    let surface_size = parse_surface_size(&cli.size).context("invalid --size")?;

    anyhow::ensure!(cli.samples > 0, "--samples must be at least 1");
    anyhow::ensure!(cli.grid > 0, "--grid must be at least 1");
    anyhow::ensure!(cli.fps > 0.0, "--fps must be positive");
    anyhow::ensure!(
        cli.lights <= MAX_LIGHTS,
        "--lights is capped at {MAX_LIGHTS}"
    );

    let vertex_shader = cli.shader_dir.join(format!("{}.vert", cli.vert));
    let fragment_shader = cli.shader_dir.join(format!("{}.frag", cli.frag));
    tracing::info!(
        vertex = %vertex_shader.display(),
        fragment = %fragment_shader.display(),
        samples = cli.samples,
        grid = cli.grid,
        "starting voxtrace"
    );

    // A dump directory that cannot be created disables capture for the run
    // instead of failing it; individual frame failures are handled the same
    // way further down in the renderer.
    let dump = if cli.dump {
        match FrameSink::create(&cli.dump_dir) {
            Ok(sink) => {
                tracing::info!(dir = %sink.dir().display(), "frame dumps enabled");
                Some(sink)
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot create dump directory; dumps disabled");
                None
            }
        }
    } else {
        None
    };

    let light_seed = cli.light_seed.unwrap_or_else(rand::random);
    let lights = LightSet::generate(cli.lights, light_seed);
    tracing::debug!(count = lights.len(), seed = light_seed, "generated light set");

    let config = RendererConfig {
        surface_size,
        vertex_shader,
        fragment_shader,
        samples: cli.samples,
        grid: cli.grid,
        time_base_fps: cli.fps,
        lights,
        channel_texture: cli.texture.clone(),
        dump,
        max_frames: match cli.max_frames {
            0 => None,
            n => Some(n),
        },
    };

    Renderer::new(config).run()
}
