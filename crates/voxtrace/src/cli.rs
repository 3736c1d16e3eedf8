use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "voxtrace",
    author,
    version,
    about = "Progressive tiled shader tracer with hot reload"
)]
pub struct Cli {
    /// Window resolution (e.g. `1920x1080`).
    #[arg(long, value_name = "WIDTHxHEIGHT", default_value = "1920x1080")]
    pub size: String,

    /// Accumulation samples per tile.
    #[arg(long, value_name = "COUNT", default_value_t = 2000)]
    pub samples: u32,

    /// Screen subdivision; the spiral walks an NxN tile grid.
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub grid: u32,

    /// Time base: the shader's time uniform advances 1/FPS per frame.
    #[arg(long, value_name = "FPS", default_value_t = 30.0)]
    pub fps: f32,

    /// Directory searched for the trace shader sources.
    #[arg(long, value_name = "DIR", default_value = "shaders")]
    pub shader_dir: PathBuf,

    /// Vertex shader name, resolved to `<shader-dir>/<NAME>.vert`.
    #[arg(long, value_name = "NAME", default_value = "trace")]
    pub vert: String,

    /// Fragment shader name, resolved to `<shader-dir>/<NAME>.frag`.
    #[arg(long, value_name = "NAME", env = "SHADER_OVERWRITE", default_value = "voxel_trace")]
    pub frag: String,

    /// Optional image bound to the trace shader's channel texture.
    #[arg(long, value_name = "PATH")]
    pub texture: Option<PathBuf>,

    /// Dump every finished frame as an uncompressed TGA. Setting the
    /// environment variable to anything but a falsey value enables dumps.
    #[arg(long, env = "SCREEN_DUMP", value_parser = clap::builder::FalseyValueParser::new())]
    pub dump: bool,

    /// Directory receiving frame dumps.
    #[arg(long, value_name = "DIR", default_value = "screen_dump")]
    pub dump_dir: PathBuf,

    /// Stop after this many frames (0 = run until the window closes).
    #[arg(long, value_name = "FRAMES", default_value_t = 300)]
    pub max_frames: u32,

    /// Number of random point lights uploaded to the shader.
    #[arg(long, value_name = "COUNT", default_value_t = 250)]
    pub lights: usize,

    /// Seed for light placement; omit for a fresh layout every run.
    #[arg(long, value_name = "SEED")]
    pub light_seed: Option<u64>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

/// Parses `WIDTHxHEIGHT` into a physical pixel size.
pub fn parse_surface_size(value: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow::anyhow!("expected WIDTHxHEIGHT, got '{value}'"))?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid width in '{value}'"))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid height in '{value}'"))?;
    if width == 0 || height == 0 {
        anyhow::bail!("surface size must be non-zero, got '{value}'");
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_the_classic_harness() {
        let cli = Cli::parse_from(["voxtrace"]);
        assert_eq!(cli.samples, 2000);
        assert_eq!(cli.grid, 5);
        assert_eq!(cli.fps, 30.0);
        assert_eq!(cli.frag, "voxel_trace");
        assert_eq!(cli.max_frames, 300);
        assert_eq!(cli.lights, 250);
    }

    #[test]
    fn screen_dump_env_enables_dumps_when_set_to_anything() {
        // The whole unset/1/0 sequence lives in one test because the
        // variable is process-global.
        std::env::remove_var("SCREEN_DUMP");
        assert!(!Cli::parse_from(["voxtrace"]).dump);

        std::env::set_var("SCREEN_DUMP", "1");
        assert!(Cli::parse_from(["voxtrace"]).dump);
        std::env::set_var("SCREEN_DUMP", "yes");
        assert!(Cli::parse_from(["voxtrace"]).dump);

        std::env::set_var("SCREEN_DUMP", "0");
        assert!(!Cli::parse_from(["voxtrace"]).dump);
        std::env::remove_var("SCREEN_DUMP");
    }

    #[test]
    fn surface_size_parses_both_cases() {
        assert_eq!(parse_surface_size("1920x1080").unwrap(), (1920, 1080));
        assert_eq!(parse_surface_size("640X360").unwrap(), (640, 360));
        assert!(parse_surface_size("1920").is_err());
        assert!(parse_surface_size("0x100").is_err());
        assert!(parse_surface_size("axb").is_err());
    }
}
