//! GPU capability consumed by the feedback/registry/binding core.
//!
//! The core never talks to a graphics API directly. Everything it needs is
//! expressed through [`GpuApi`], an immediate-mode surface modelled on the
//! classic "texture unit + named uniform" programming model:
//!
//! ```text
//!   FrameOrchestrator ─▶ TextureBindingSet ─▶ GpuApi::active_texture / bind_texture
//!          │          ─▶ ShaderRegistry    ─▶ GpuApi::compile_shader / link_program
//!          └────────────▶ FeedbackSurface  ─▶ GpuApi::bind_render_target / draw_fullscreen_quad
//! ```
//!
//! The headless `wgpu` implementation lives in this module tree:
//! - `context` requests an adapter/device without a presentation surface.
//! - `textures` allocates render-target images and decodes user textures.
//! - `pipeline` turns reflected GLSL programs into render pipelines keyed by
//!   colour-target count.
//! - `uniforms` packs named uniform values into the std140 slot block.
//! - `timer` measures the GPU time of a frame scope.
//! - `state` glues everything together as [`WgpuBackend`].

mod context;
mod pipeline;
mod state;
mod textures;
mod timer;
mod uniforms;

use std::fmt;
use std::time::Duration;

use image::RgbaImage;

pub use state::WgpuBackend;

/// Number of texture units exposed by every backend.
pub const MAX_TEXTURE_UNITS: u32 = 16;

/// Shader stage handed to [`GpuApi::compile_shader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Value written through [`GpuApi::set_uniform`].
///
/// `Int` doubles as the sampler-unit setter: assigning an integer to a
/// sampler uniform selects the texture unit it reads from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Int(i32),
}

impl UniformValue {
    /// Expands the value into a padded vec4 slot.
    pub fn to_slot(self) -> [f32; 4] {
        match self {
            UniformValue::Float(x) => [x, 0.0, 0.0, 0.0],
            UniformValue::Vec2([x, y]) => [x, y, 0.0, 0.0],
            UniformValue::Vec3([x, y, z]) => [x, y, z, 0.0],
            UniformValue::Vec4(v) => v,
            UniformValue::Int(i) => [i as f32, 0.0, 0.0, 0.0],
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<(f32, f32)> for UniformValue {
    fn from((x, y): (f32, f32)) -> Self {
        UniformValue::Vec2([x, y])
    }
}

impl From<(f32, f32, f32)> for UniformValue {
    fn from((x, y, z): (f32, f32, f32)) -> Self {
        UniformValue::Vec3([x, y, z])
    }
}

impl From<[f32; 2]> for UniformValue {
    fn from(value: [f32; 2]) -> Self {
        UniformValue::Vec2(value)
    }
}

impl From<[f32; 3]> for UniformValue {
    fn from(value: [f32; 3]) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<[f32; 4]> for UniformValue {
    fn from(value: [f32; 4]) -> Self {
        UniformValue::Vec4(value)
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::Int(value)
    }
}

/// Failures reported by a GPU backend.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("invalid {kind} handle #{id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("texture unit {unit} exceeds the supported unit count ({max})")]
    UnitOutOfRange { unit: u32, max: u32 },
    #[error("texture size {width}x{height} is invalid (maximum dimension {max})")]
    InvalidSize { width: u32, height: u32, max: u32 },
    #[error("no program bound for draw")]
    NoProgram,
    #[error("render target must have at least one attachment")]
    EmptyRenderTarget,
    #[error("render target attachments have mismatched sizes")]
    MismatchedAttachments,
    #[error("draw rejected by the device: {0}")]
    Draw(String),
    #[error("texture read-back failed: {0}")]
    Readback(String),
}

/// Opaque GPU capability used by the core components.
///
/// Handles are cheap copyable ids; comparing two handles compares resource
/// identity, never contents. Every `create_*`/`compile_*`/`link_*` result must
/// be released exactly once through the matching `delete_*` call.
pub trait GpuApi {
    type Texture: Clone + PartialEq + fmt::Debug;
    type Shader: fmt::Debug;
    type Program: Clone + PartialEq + fmt::Debug;
    type RenderTarget: fmt::Debug;

    /// Allocates an uninitialised RGBA image usable as a colour attachment.
    fn create_texture(&mut self, width: u32, height: u32) -> Result<Self::Texture, GpuError>;
    /// Uploads decoded pixels into a sampled texture.
    fn upload_texture(&mut self, image: &RgbaImage) -> Result<Self::Texture, GpuError>;
    fn delete_texture(&mut self, texture: Self::Texture);
    fn texture_size(&self, texture: &Self::Texture) -> Option<(u32, u32)>;
    /// Copies the texture contents back to host memory.
    fn read_texture(&mut self, texture: &Self::Texture) -> Result<RgbaImage, GpuError>;

    /// Compiles a single stage, returning the compiler log on failure.
    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<Self::Shader, String>;
    fn delete_shader(&mut self, shader: Self::Shader);
    /// Links a program, returning `(program, link log)` or the failure log.
    fn link_program(
        &mut self,
        vertex: &Self::Shader,
        fragment: &Self::Shader,
    ) -> Result<(Self::Program, String), String>;
    fn delete_program(&mut self, program: Self::Program);
    fn use_program(&mut self, program: &Self::Program);
    /// Writes a named uniform. Unknown names are silently ignored.
    fn set_uniform(&mut self, program: &Self::Program, name: &str, value: UniformValue);

    /// Selects the texture unit affected by [`GpuApi::bind_texture`].
    fn active_texture(&mut self, unit: u32) -> Result<(), GpuError>;
    /// Binds (or with `None` unbinds) a texture on the active unit.
    fn bind_texture(&mut self, texture: Option<&Self::Texture>) -> Result<(), GpuError>;

    /// Groups equally sized textures into a multi-attachment draw destination.
    fn create_render_target(
        &mut self,
        attachments: &[Self::Texture],
    ) -> Result<Self::RenderTarget, GpuError>;
    fn delete_render_target(&mut self, target: Self::RenderTarget);
    /// Routes subsequent draws into `target`, or the visible framebuffer for `None`.
    fn bind_render_target(&mut self, target: Option<&Self::RenderTarget>);
    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32);
    fn draw_fullscreen_quad(&mut self) -> Result<(), GpuError>;

    fn begin_timer(&mut self);
    /// Ends the scope opened by [`GpuApi::begin_timer`] and returns its length.
    ///
    /// Backends without timestamp queries report wall-clock time up to the
    /// point all submitted work has finished.
    fn end_timer(&mut self) -> Duration;
}
