use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// File name looked up inside the configuration directory.
pub const CONFIG_FILE_NAME: &str = "shaderloop.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerSetting {
    #[default]
    Low,
    High,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoopConfig {
    pub version: u32,
    /// Fragment shader rendered by the session.
    #[serde(default)]
    pub shader: Option<PathBuf>,
    #[serde(default)]
    pub power: PowerSetting,
    #[serde(default)]
    pub surface: Surface,
    #[serde(default)]
    pub session: Session,
    /// Bound to `tex0..` in declaration order.
    #[serde(default)]
    pub textures: Vec<TextureEntry>,
    #[serde(default)]
    pub uniforms: BTreeMap<String, UniformSetting>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            version: 1,
            shader: None,
            power: PowerSetting::default(),
            surface: Surface::default(),
            session: Session::default(),
            textures: Vec::new(),
            uniforms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Surface {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for Surface {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Session {
    #[serde(default = "default_frames")]
    pub frames: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f32,
    /// PNG written from the final frame.
    #[serde(default)]
    pub export: Option<PathBuf>,
    #[serde(default)]
    pub watch: bool,
    #[serde(
        default = "default_watch_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub watch_interval: Duration,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            frame_rate: default_frame_rate(),
            export: None,
            watch: false,
            watch_interval: default_watch_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TextureEntry {
    pub name: String,
    pub path: PathBuf,
}

/// `name = 0.5` or `name = [0.1, 0.2]`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UniformSetting {
    Scalar(f32),
    Vector(Vec<f32>),
}

impl UniformSetting {
    pub fn components(&self) -> &[f32] {
        match self {
            UniformSetting::Scalar(value) => std::slice::from_ref(value),
            UniformSetting::Vector(values) => values,
        }
    }
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

fn default_frames() -> u32 {
    1
}

fn default_frame_rate() -> f32 {
    60.0
}

fn default_watch_interval() -> Duration {
    Duration::from_millis(250)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl de::Visitor<'_> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v).map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Duration::try_from_secs_f64(v)
                .map_err(|err| E::custom(format!("invalid duration {v}: {err}")))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl LoopConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: LoopConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads and validates a file; relative paths inside it are resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&input)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let Some(shader) = self.shader.as_mut() {
            resolve(shader);
        }
        if let Some(export) = self.session.export.as_mut() {
            resolve(export);
        }
        for texture in &mut self.textures {
            resolve(&mut texture.path);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.surface.width == 0 || self.surface.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "surface size {}x{} must be non-zero",
                self.surface.width, self.surface.height
            )));
        }

        if !(self.session.frame_rate.is_finite() && self.session.frame_rate > 0.0) {
            return Err(ConfigError::Invalid(
                "session.frame_rate must be greater than zero".into(),
            ));
        }

        if self.session.watch && self.session.watch_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "session.watch_interval must be greater than zero".into(),
            ));
        }

        let mut seen = Vec::with_capacity(self.textures.len());
        for texture in &self.textures {
            if texture.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "texture entries need a non-empty name".into(),
                ));
            }
            if seen.contains(&texture.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "texture '{}' is declared twice",
                    texture.name
                )));
            }
            seen.push(texture.name.as_str());
        }

        for (name, setting) in &self.uniforms {
            let count = setting.components().len();
            if !(1..=3).contains(&count) {
                return Err(ConfigError::Invalid(format!(
                    "uniform '{name}' has {count} components; expected 1 to 3"
                )));
            }
        }

        Ok(())
    }
}
