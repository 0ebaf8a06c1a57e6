use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use renderer::GpuPowerPreference;

#[derive(Parser, Debug)]
#[command(
    name = "shaderloop",
    author,
    version,
    about = "Headless live preview for feedback fragment shaders",
    arg_required_else_help = false
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Fragment shader to render; falls back to `shader` from the config file.
    #[arg(value_name = "SHADER")]
    pub shader: Option<PathBuf>,

    /// Session config (defaults to `shaderloop.toml` in the config directory).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Surface resolution (e.g. `800x600`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_surface_size)]
    pub size: Option<(u32, u32)>,

    /// Frames to render before exiting (0 keeps running while watching).
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u32>,

    /// Simulated frame rate used to advance `iTime`.
    #[arg(long, value_name = "FPS")]
    pub frame_rate: Option<f32>,

    /// Write the final frame to this PNG path.
    #[arg(long, value_name = "PATH", value_parser = parse_export_path)]
    pub export: Option<PathBuf>,

    /// Reload the shader and textures when their files change.
    #[arg(long)]
    pub watch: bool,

    /// Quiet period after a file event before `--watch` reloads (e.g. `250ms`).
    #[arg(long, value_name = "DURATION", value_parser = parse_interval)]
    pub watch_interval: Option<Duration>,

    /// Texture bound as `tex<N>` in the order given (`NAME=PATH`).
    #[arg(long = "texture", value_name = "NAME=PATH", value_parser = parse_texture)]
    pub textures: Vec<(String, PathBuf)>,

    /// Uniform set every frame (`NAME=X[,Y[,Z]]`).
    #[arg(long = "uniform", value_name = "NAME=VALUES", value_parser = parse_uniform)]
    pub uniforms: Vec<(String, Vec<f32>)>,

    /// Adapter power preference.
    #[arg(long, value_enum)]
    pub power: Option<PowerArg>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a shader without rendering and print its diagnostics.
    Check(CheckArgs),
    /// Print the resolved configuration paths.
    Where,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[arg(value_name = "SHADER")]
    pub shader: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PowerArg {
    Low,
    High,
}

impl From<PowerArg> for GpuPowerPreference {
    fn from(value: PowerArg) -> Self {
        match value {
            PowerArg::Low => GpuPowerPreference::Low,
            PowerArg::High => GpuPowerPreference::High,
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_surface_size(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X', '×'])
        .ok_or_else(|| "expected WIDTHxHEIGHT, e.g. 800x600".to_string())?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| "invalid width in size specification".to_string())?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| "invalid height in size specification".to_string())?;
    if width == 0 || height == 0 {
        return Err("surface dimensions must be greater than zero".into());
    }
    Ok((width, height))
}

pub fn parse_export_path(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => Ok(path),
        None => Err("export path has no extension; expected .png".to_string()),
        Some(other) => Err(format!(
            "unsupported export format '.{other}'; expected .png"
        )),
    }
}

pub fn parse_interval(value: &str) -> Result<Duration, String> {
    let interval = humantime::parse_duration(value.trim())
        .map_err(|err| format!("invalid duration '{value}': {err}"))?;
    if interval.is_zero() {
        return Err("watch interval must be greater than zero".into());
    }
    Ok(interval)
}

pub fn parse_texture(value: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| "expected NAME=PATH".to_string())?;
    let name = name.trim();
    if name.is_empty() || path.trim().is_empty() {
        return Err("texture name and path must not be empty".into());
    }
    Ok((name.to_string(), PathBuf::from(path.trim())))
}

pub fn parse_uniform(value: &str) -> Result<(String, Vec<f32>), String> {
    let (name, values) = value
        .split_once('=')
        .ok_or_else(|| "expected NAME=X[,Y[,Z]]".to_string())?;
    let name = name.trim();
    if !renderer::is_name_valid(Some(name)) {
        return Err(format!(
            "invalid uniform name '{name}'; use letters and digits starting with a letter"
        ));
    }
    let components = values
        .split(',')
        .map(|component| {
            component
                .trim()
                .parse::<f32>()
                .map_err(|_| format!("invalid number '{}' for uniform '{name}'", component.trim()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if !(1..=3).contains(&components.len()) {
        return Err(format!(
            "uniform '{name}' takes 1 to 3 components, got {}",
            components.len()
        ));
    }
    Ok((name.to_string(), components))
}
