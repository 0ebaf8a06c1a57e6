use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use loopconfig::{LoopConfig, PowerSetting};
use renderer::{is_name_valid, GpuPowerPreference, UniformValue};

use crate::cli::RunArgs;

/// Fully resolved run settings: config file values overridden by CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPlan {
    pub shader: Option<PathBuf>,
    pub size: (u32, u32),
    /// Zero means "until interrupted" and is only accepted while watching.
    pub frames: u32,
    pub frame_rate: f32,
    pub export: Option<PathBuf>,
    pub watch: bool,
    pub watch_interval: Duration,
    pub textures: Vec<(String, PathBuf)>,
    pub uniforms: Vec<(String, UniformValue)>,
    pub power: GpuPowerPreference,
}

impl SessionPlan {
    pub fn resolve(args: RunArgs, config: Option<LoopConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let mut textures: Vec<(String, PathBuf)> = config
            .textures
            .into_iter()
            .map(|entry| (entry.name, entry.path))
            .collect();
        for (name, path) in args.textures {
            upsert(&mut textures, name, path);
        }

        let mut uniforms = Vec::new();
        let configured = config
            .uniforms
            .iter()
            .map(|(name, setting)| (name.clone(), setting.components().to_vec()));
        for (name, components) in configured.chain(args.uniforms) {
            if !is_name_valid(Some(&name)) {
                bail!("invalid uniform name '{name}'; use letters and digits starting with a letter");
            }
            let Some(value) = uniform_value(&components) else {
                bail!("uniform '{name}' takes 1 to 3 components, got {}", components.len());
            };
            upsert(&mut uniforms, name, value);
        }

        let plan = Self {
            shader: args.shader.or(config.shader),
            size: args
                .size
                .unwrap_or((config.surface.width, config.surface.height)),
            frames: args.frames.unwrap_or(config.session.frames),
            frame_rate: args.frame_rate.unwrap_or(config.session.frame_rate),
            export: args.export.or(config.session.export),
            watch: args.watch || config.session.watch,
            watch_interval: args.watch_interval.unwrap_or(config.session.watch_interval),
            textures,
            uniforms,
            power: match args.power {
                Some(power) => power.into(),
                None => match config.power {
                    PowerSetting::Low => GpuPowerPreference::Low,
                    PowerSetting::High => GpuPowerPreference::High,
                },
            },
        };

        if plan.frames == 0 && !plan.watch {
            bail!("--frames 0 only makes sense together with --watch");
        }
        if !(plan.frame_rate.is_finite() && plan.frame_rate > 0.0) {
            bail!("frame rate must be greater than zero");
        }
        if Duration::try_from_secs_f32(plan.frame_rate.recip()).is_err() {
            bail!("frame rate {} is too low", plan.frame_rate);
        }
        if plan.watch && plan.shader.is_none() {
            bail!("--watch needs a shader file to watch");
        }
        Ok(plan)
    }

    /// Seconds between frames at the configured frame rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::try_from_secs_f32(self.frame_rate.recip()).unwrap_or(Duration::MAX)
    }
}

fn uniform_value(components: &[f32]) -> Option<UniformValue> {
    match *components {
        [x] => Some(UniformValue::Float(x)),
        [x, y] => Some(UniformValue::Vec2([x, y])),
        [x, y, z] => Some(UniformValue::Vec3([x, y, z])),
        _ => None,
    }
}

fn upsert<V>(entries: &mut Vec<(String, V)>, name: String, value: V) {
    match entries.iter_mut().find(|(existing, _)| *existing == name) {
        Some(entry) => entry.1 = value,
        None => entries.push((name, value)),
    }
}
