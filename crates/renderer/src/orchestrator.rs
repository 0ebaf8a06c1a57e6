//! Per-frame driver tying the feedback surface, shaders and textures together.
//!
//! ```text
//!   update():  begin timer ─▶ bind inputs ─▶ render into writable target
//!                          ─▶ unbind (always) ─▶ unit 0 active ─▶ end timer
//!   draw():    composite current_output() to the screen ─▶ swap()
//! ```

use std::fmt::Display;
use std::fs;
use std::hash::Hash;
use std::path::Path;
use std::time::Duration;

use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::bindings::{BoundUnits, TextureBindingSet};
use crate::compile::{COPY_FRAGMENT_GLSL, DEFAULT_FRAGMENT_GLSL, VERTEX_SHADER_GLSL};
use crate::error::{FrameError, NoActiveShader, SetupError, ShaderError};
use crate::feedback::FeedbackSurface;
use crate::gpu::{GpuApi, GpuError, UniformValue};
use crate::include::{DirectoryIncludes, IncludeResolver};
use crate::registry::ShaderRegistry;
use crate::runtime::{RequestQueue, RuntimeRequest};

/// Frames whose GPU time exceeds this are reported.
const SLOW_FRAME: Duration = Duration::from_millis(50);

/// Sampler the copy program reads the composited image from.
const COPY_SAMPLER: &str = "frame";

pub struct FrameOrchestrator<G: GpuApi, K = String> {
    surface: FeedbackSurface<G>,
    shaders: ShaderRegistry<G, K>,
    textures: TextureBindingSet<G, K>,
    copy_program: G::Program,
    active_identity: Option<K>,
    update_time: Duration,
    frames: u64,
}

impl<G, K> FrameOrchestrator<G, K>
where
    G: GpuApi,
    K: Eq + Hash + Clone + Display,
{
    /// Creates the 1x1 feedback surface, the shared shaders and the copy program.
    pub fn new(gpu: &mut G) -> Result<Self, SetupError> {
        let surface = FeedbackSurface::new(gpu)?;
        let shaders = match ShaderRegistry::new(gpu, VERTEX_SHADER_GLSL, DEFAULT_FRAGMENT_GLSL) {
            Ok(shaders) => shaders,
            Err(err) => {
                surface.destroy(gpu);
                return Err(err.into());
            }
        };
        let copy_program = match shaders.build_unregistered(gpu, "copy", COPY_FRAGMENT_GLSL) {
            Ok(program) => program,
            Err(err) => {
                shaders.teardown(gpu);
                surface.destroy(gpu);
                return Err(err.into());
            }
        };
        debug!("frame orchestrator ready");

        Ok(Self {
            surface,
            shaders,
            textures: TextureBindingSet::new(),
            copy_program,
            active_identity: None,
            update_time: Duration::ZERO,
            frames: 0,
        })
    }

    /// Renders one frame into the writable feedback target.
    ///
    /// Texture units bound for the draw are released and unit 0 is made
    /// active again whether or not binding or drawing succeeded.
    pub fn update(&mut self, gpu: &mut G) -> Result<(), FrameError> {
        let program = self
            .shaders
            .current_program()
            .cloned()
            .ok_or(FrameError::NoActiveShader)?;

        gpu.begin_timer();
        gpu.use_program(&program);
        let mut bound = BoundUnits::new();
        let drawn = self
            .textures
            .bind_all_for_draw(gpu, &program, self.surface.previous_outputs(), &mut bound)
            .and_then(|_| self.surface.render(gpu));
        let unbound = self.textures.unbind_all_for_draw(gpu, &mut bound);
        self.update_time = gpu.end_timer();

        if self.update_time > SLOW_FRAME {
            warn!(
                frame = self.frames,
                elapsed_ms = self.update_time.as_secs_f64() * 1000.0,
                "slow frame"
            );
        }

        drawn?;
        unbound?;
        Ok(())
    }

    /// Blits `current_output()` to the visible framebuffer through the copy program.
    ///
    /// A zero-sized output is skipped.
    pub fn composite(&mut self, gpu: &mut G, width: u32, height: u32) -> Result<(), FrameError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        gpu.bind_render_target(None);
        gpu.set_viewport(0, 0, width, height);
        gpu.use_program(&self.copy_program);
        gpu.active_texture(0)?;
        gpu.bind_texture(Some(self.surface.current_output()))?;
        gpu.set_uniform(&self.copy_program, COPY_SAMPLER, UniformValue::Int(0));
        let drawn = gpu.draw_fullscreen_quad();
        let unbound = gpu.bind_texture(None);
        drawn?;
        unbound?;
        Ok(())
    }

    /// Exchanges the writable and previous feedback targets.
    pub fn swap_buffers(&mut self) {
        self.surface.swap();
        self.frames = self.frames.saturating_add(1);
    }

    /// Composites to a `width`x`height` screen, then swaps.
    ///
    /// The swap happens even when compositing fails so feedback keeps
    /// advancing; the composite error is still returned.
    pub fn draw(&mut self, gpu: &mut G, width: u32, height: u32) -> Result<(), FrameError> {
        let composited = self.composite(gpu, width, height);
        self.swap_buffers();
        composited
    }

    /// Reads `current_output()` back to host memory without changing any state.
    pub fn screenshot(&self, gpu: &mut G) -> Result<RgbaImage, GpuError> {
        gpu.read_texture(self.surface.current_output())
    }

    /// Resizes the feedback surface; zero or unchanged sizes are ignored.
    pub fn update_surface_size(&mut self, gpu: &mut G, width: u32, height: u32) -> Result<bool, GpuError> {
        let resized = self.surface.resize(gpu, width, height)?;
        if resized {
            info!(width, height, "surface resized");
        }
        Ok(resized)
    }

    /// Registers a shader; an identity that is currently active is re-activated.
    pub fn compile_and_register(
        &mut self,
        gpu: &mut G,
        identity: K,
        fragment_source: &str,
        resolver: &dyn IncludeResolver,
    ) -> Result<String, ShaderError> {
        let result = self
            .shaders
            .compile_and_register(gpu, identity.clone(), fragment_source, resolver);
        if self.active_identity.as_ref() == Some(&identity) {
            self.shaders.activate(gpu, &identity);
        }
        result
    }

    /// Reads `path` and registers it, resolving includes next to the file.
    pub fn load_shader_file(&mut self, gpu: &mut G, identity: K, path: &Path) -> Result<String, ShaderError> {
        let source = fs::read_to_string(path).map_err(|source| ShaderError::Io {
            identity: identity.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        let resolver = DirectoryIncludes::for_file(path);
        self.compile_and_register(gpu, identity, &source, &resolver)
    }

    /// Activates the identity's program; `false` means the default program is active.
    pub fn activate_shader(&mut self, gpu: &mut G, identity: &K) -> bool {
        self.active_identity = Some(identity.clone());
        self.shaders.activate(gpu, identity)
    }

    pub fn remove_shader(&mut self, gpu: &mut G, identity: &K) -> bool {
        if self.active_identity.as_ref() == Some(identity) {
            self.active_identity = None;
        }
        self.shaders.remove(gpu, identity)
    }

    pub fn set_uniform(
        &mut self,
        gpu: &mut G,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> Result<(), NoActiveShader> {
        self.shaders.set_uniform(gpu, name, value)
    }

    pub fn add_texture(&mut self, gpu: &mut G, identity: K, path: &Path) -> bool {
        self.textures.add_or_update(gpu, identity, path)
    }

    pub fn add_texture_bytes(&mut self, gpu: &mut G, identity: K, bytes: &[u8]) -> bool {
        self.textures.add_or_update_bytes(gpu, identity, bytes)
    }

    pub fn remove_texture(&mut self, gpu: &mut G, identity: &K) -> bool {
        self.textures.remove(gpu, identity)
    }

    /// Applies queued runtime requests; call between frames.
    ///
    /// Shader and texture failures are logged and do not stop the batch. The
    /// first GPU error from a resize is returned after the batch completes.
    pub fn apply_requests(&mut self, gpu: &mut G, queue: &RequestQueue<K>) -> Result<usize, GpuError> {
        let requests = queue.drain();
        let count = requests.len();
        let mut first_error = None;

        for request in requests {
            match request {
                RuntimeRequest::Resize { width, height } => {
                    if let Err(err) = self.update_surface_size(gpu, width, height) {
                        warn!(width, height, error = %err, "queued resize failed");
                        first_error.get_or_insert(err);
                    }
                }
                RuntimeRequest::ReloadShader { identity, path } => {
                    match self.load_shader_file(gpu, identity.clone(), &path) {
                        Ok(_) => info!(identity = %identity, "shader reloaded"),
                        Err(err) => {
                            warn!(identity = %identity, error = %err, log = %err.log(), "shader reload failed")
                        }
                    }
                }
                RuntimeRequest::RemoveShader { identity } => {
                    self.remove_shader(gpu, &identity);
                }
                RuntimeRequest::AddTexture { identity, path } => {
                    if !self.add_texture(gpu, identity.clone(), &path) {
                        warn!(identity = %identity, path = %path.display(), "queued texture was not loaded");
                    }
                }
                RuntimeRequest::RemoveTexture { identity } => {
                    self.remove_texture(gpu, &identity);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    pub fn surface(&self) -> &FeedbackSurface<G> {
        &self.surface
    }

    pub fn shaders(&self) -> &ShaderRegistry<G, K> {
        &self.shaders
    }

    pub fn textures(&self) -> &TextureBindingSet<G, K> {
        &self.textures
    }

    pub fn active_identity(&self) -> Option<&K> {
        self.active_identity.as_ref()
    }

    /// Duration of the last [`update`](Self::update) timer scope.
    ///
    /// With [`WgpuBackend`](crate::WgpuBackend) this is wall-clock time from
    /// the start of the scope until the queue drained, so it includes
    /// submission latency on top of GPU execution.
    pub fn update_time(&self) -> Duration {
        self.update_time
    }

    /// Number of completed swaps.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Releases textures, shaders (default last), the copy program, then the surface.
    pub fn teardown(self, gpu: &mut G) {
        self.textures.teardown(gpu);
        self.shaders.teardown(gpu);
        gpu.delete_program(self.copy_program);
        self.surface.destroy(gpu);
        debug!("frame orchestrator released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::include::InMemoryIncludes;
    use crate::testing::{GpuEvent, RecordingGpu};

    const SHADER_A: &str = r"layout(location = 0) out vec4 color;
uniform float uTime;
uniform sampler2D texLastFrame0;
void main() { color = texture(texLastFrame0, uv) * uTime; }
";

    fn orchestrator(gpu: &mut RecordingGpu) -> FrameOrchestrator<RecordingGpu> {
        FrameOrchestrator::new(gpu).unwrap()
    }

    fn register_and_activate(
        gpu: &mut RecordingGpu,
        orchestrator: &mut FrameOrchestrator<RecordingGpu>,
        identity: &str,
    ) {
        orchestrator
            .compile_and_register(gpu, identity.to_string(), SHADER_A, &InMemoryIncludes::new())
            .unwrap();
        assert!(orchestrator.activate_shader(gpu, &identity.to_string()));
    }

    #[test]
    fn end_to_end_frame_at_800_by_600() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        orchestrator.update_surface_size(&mut gpu, 800, 600).unwrap();
        register_and_activate(&mut gpu, &mut orchestrator, "x.frag");
        orchestrator.set_uniform(&mut gpu, "uTime", 1.0_f32).unwrap();

        let written = *orchestrator.surface().current_output();
        orchestrator.update(&mut gpu).unwrap();
        orchestrator.draw(&mut gpu, 800, 600).unwrap();

        assert_ne!(*orchestrator.surface().current_output(), written);
        assert_eq!(orchestrator.surface().previous_outputs()[0], written);
        assert_eq!(gpu.active_unit(), 0);
        assert!(gpu.occupied_units().is_empty());
        assert_eq!(orchestrator.frame_count(), 1);

        let draws = gpu.draws();
        assert_eq!(draws.len(), 2);
        assert!(draws[0].1.is_some(), "frame renders into the feedback target");
        assert_eq!(draws[1], (orchestrator.copy_program, None));
    }

    #[test]
    fn composite_reads_current_output_before_swap() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        orchestrator.update_surface_size(&mut gpu, 64, 64).unwrap();
        register_and_activate(&mut gpu, &mut orchestrator, "a");
        orchestrator.update(&mut gpu).unwrap();
        let written = *orchestrator.surface().current_output();
        gpu.clear_events();

        orchestrator.draw(&mut gpu, 320, 200).unwrap();
        let viewport = gpu
            .events
            .iter()
            .position(|event| *event == GpuEvent::Viewport(0, 0, 320, 200))
            .unwrap();
        let bind = gpu
            .events
            .iter()
            .position(|event| {
                *event
                    == GpuEvent::BindTexture {
                        unit: 0,
                        texture: Some(written),
                    }
            })
            .unwrap();
        assert!(viewport < bind);
        assert_eq!(
            gpu.last_uniform(orchestrator.copy_program, "frame"),
            Some(UniformValue::Int(0))
        );
    }

    #[test]
    fn update_binds_textures_and_feedback_then_releases_them() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        register_and_activate(&mut gpu, &mut orchestrator, "a");
        let image = RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 255]));
        let mut png = std::io::Cursor::new(Vec::new());
        image.write_to(&mut png, image::ImageFormat::Png).unwrap();
        assert!(orchestrator.add_texture_bytes(&mut gpu, "noise".into(), png.get_ref()));

        orchestrator.update(&mut gpu).unwrap();
        let program = *orchestrator.shaders().current_program().unwrap();
        assert_eq!(gpu.last_uniform(program, "tex0"), Some(UniformValue::Int(0)));
        assert_eq!(gpu.last_uniform(program, "texLastFrame0"), Some(UniformValue::Int(1)));
        assert_eq!(gpu.last_uniform(program, "texLastFrame1"), Some(UniformValue::Int(2)));
        assert!(gpu.occupied_units().is_empty());
        assert_eq!(gpu.active_unit(), 0);
        assert_eq!(orchestrator.update_time(), Duration::from_micros(250));
    }

    #[test]
    fn failed_draw_still_releases_units_and_ends_timer() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        register_and_activate(&mut gpu, &mut orchestrator, "a");
        gpu.clear_events();
        gpu.fail_next_draw = true;

        let err = orchestrator.update(&mut gpu).unwrap_err();
        assert!(matches!(err, FrameError::Gpu(GpuError::Draw(_))));
        assert!(gpu.occupied_units().is_empty());
        assert_eq!(gpu.active_unit(), 0);
        assert_eq!(gpu.current_target(), None);
        assert_eq!(gpu.events.first(), Some(&GpuEvent::BeginTimer));
        assert_eq!(gpu.events.last(), Some(&GpuEvent::EndTimer));
    }

    #[test]
    fn update_requires_an_active_shader() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        assert!(matches!(
            orchestrator.update(&mut gpu),
            Err(FrameError::NoActiveShader)
        ));
    }

    #[test]
    fn feedback_alternates_across_frames() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        register_and_activate(&mut gpu, &mut orchestrator, "a");
        let first = *orchestrator.surface().current_output();
        for _ in 0..2 {
            orchestrator.update(&mut gpu).unwrap();
            orchestrator.draw(&mut gpu, 16, 16).unwrap();
        }
        assert_eq!(*orchestrator.surface().current_output(), first);
    }

    #[test]
    fn reload_of_active_shader_reactivates_it() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        register_and_activate(&mut gpu, &mut orchestrator, "a");
        orchestrator
            .compile_and_register(&mut gpu, "a".into(), SHADER_A, &InMemoryIncludes::new())
            .unwrap();
        let current = *orchestrator.shaders().current_program().unwrap();
        assert_ne!(current, *orchestrator.shaders().default_program());
        assert!(gpu.is_live_program(current));

        assert!(orchestrator
            .compile_and_register(&mut gpu, "a".into(), "#error", &InMemoryIncludes::new())
            .is_err());
        assert_eq!(
            orchestrator.shaders().current_program(),
            Some(orchestrator.shaders().default_program())
        );
        orchestrator.update(&mut gpu).unwrap();
    }

    #[test]
    fn applies_queued_requests_between_frames() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        let dir = tempfile::tempdir().unwrap();
        let shader = dir.path().join("live.frag");
        fs::write(&shader, SHADER_A).unwrap();

        let queue = RequestQueue::new();
        let sender = queue.sender();
        sender.resize(100, 100);
        sender.resize(640, 480);
        sender.reload_shader("live".to_string(), &shader);
        sender.send(RuntimeRequest::AddTexture {
            identity: "missing".to_string(),
            path: dir.path().join("missing.png"),
        });

        let applied = orchestrator.apply_requests(&mut gpu, &queue).unwrap();
        assert_eq!(applied, 3);
        assert_eq!(orchestrator.surface().size(), (640, 480));
        assert!(orchestrator.shaders().is_custom(&"live".to_string()));
        assert!(orchestrator.textures().is_empty());

        sender.send(RuntimeRequest::RemoveShader {
            identity: "live".to_string(),
        });
        orchestrator.apply_requests(&mut gpu, &queue).unwrap();
        assert!(!orchestrator.shaders().is_custom(&"live".to_string()));
    }

    #[test]
    fn screenshot_captures_current_output_size() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        orchestrator.update_surface_size(&mut gpu, 40, 30).unwrap();
        let events = gpu.events.len();
        let image = orchestrator.screenshot(&mut gpu).unwrap();
        assert_eq!(image.dimensions(), (40, 30));
        assert_eq!(gpu.events.len(), events);
    }

    #[test]
    fn teardown_releases_in_dependency_order() {
        let mut gpu = RecordingGpu::new();
        let mut orchestrator = orchestrator(&mut gpu);
        register_and_activate(&mut gpu, &mut orchestrator, "a");
        let image = RgbaImage::new(1, 1);
        let mut png = std::io::Cursor::new(Vec::new());
        image.write_to(&mut png, image::ImageFormat::Png).unwrap();
        orchestrator.add_texture_bytes(&mut gpu, "t".into(), png.get_ref());
        let user_texture = *orchestrator.textures().texture(&"t".to_string()).unwrap();
        let default = *orchestrator.shaders().default_program();
        let copy = orchestrator.copy_program;
        gpu.clear_events();

        orchestrator.teardown(&mut gpu);
        let position = |wanted: &GpuEvent| gpu.events.iter().position(|event| event == wanted).unwrap();
        let texture = position(&GpuEvent::DeleteTexture(user_texture));
        let default = position(&GpuEvent::DeleteProgram(default));
        let copy = position(&GpuEvent::DeleteProgram(copy));
        let first_target = gpu
            .events
            .iter()
            .position(|event| matches!(event, GpuEvent::DeleteRenderTarget(_)))
            .unwrap();
        assert!(texture < default);
        assert!(default < copy);
        assert!(copy < first_target);

        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_programs(), 0);
        assert_eq!(gpu.live_shaders(), 0);
        assert_eq!(gpu.live_targets(), 0);
    }
}
