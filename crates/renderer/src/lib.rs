//! Renderer core for shaderloop.
//!
//! The crate drives a double-buffered feedback surface: every frame a
//! fragment shader renders into the writable render target while sampling
//! the previous frame's attachments, the result is composited to the screen,
//! and the two targets swap roles. The flow is:
//!
//! ```text
//!   shader file ──▶ expand_includes ──▶ ShaderRegistry ─┐
//!   image files ──▶ TextureBindingSet ──────────────────┤
//!                                                       ▼
//!   RequestQueue ──▶ FrameOrchestrator::update ──▶ FeedbackSurface (A|B)
//!                               │
//!                               └─▶ draw(): composite ─▶ swap
//! ```
//!
//! Everything above the [`gpu::GpuApi`] trait is backend agnostic.
//! [`gpu::WgpuBackend`] is the headless `wgpu` implementation used by the
//! `shaderloop` binary; unit tests drive the same code through a recording
//! fake.

pub mod bindings;
pub mod compile;
pub mod error;
pub mod feedback;
pub mod gpu;
pub mod include;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod target;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bindings::{BoundUnits, TextureBindingSet};
pub use error::{
    CompileStage, FrameError, IncludeError, NoActiveShader, SetupError, ShaderError,
};
pub use feedback::{FeedbackSurface, Slot};
pub use gpu::{GpuApi, GpuError, ShaderStage, UniformValue, WgpuBackend, MAX_TEXTURE_UNITS};
pub use include::{
    expand_includes, DirectoryIncludes, InMemoryIncludes, IncludeResolver, MAX_INCLUDE_DEPTH,
};
pub use orchestrator::FrameOrchestrator;
pub use registry::{ProgramEntry, ShaderRegistry};
pub use runtime::{
    BoxedTimeSource, RequestQueue, RequestSender, RuntimeRequest, SteppedTimeSource,
    SystemTimeSource, TimeSample, TimeSource,
};
pub use target::{RenderTarget, DEFAULT_ATTACHMENTS};
pub use types::{is_name_valid, AdapterProfile, GpuPowerPreference};
