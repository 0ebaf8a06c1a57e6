//! Recording fake of [`GpuApi`] for unit tests.
//!
//! Every call is appended to an event log and resource lifetimes are tracked
//! so tests can assert exact allocation counts, release order, and texture
//! unit state. Releasing a handle twice panics.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use image::RgbaImage;

use crate::gpu::{GpuApi, GpuError, ShaderStage, UniformValue, MAX_TEXTURE_UNITS};

/// Marker that makes [`RecordingGpu::link_program`] fail for a fragment stage.
pub const FAIL_LINK_MARKER: &str = "// fail-link";

#[derive(Debug, Clone, PartialEq)]
pub enum GpuEvent {
    CreateTexture { id: u64, width: u32, height: u32 },
    UploadTexture { id: u64 },
    DeleteTexture(u64),
    CompileShader { id: u64, stage: ShaderStage },
    DeleteShader(u64),
    LinkProgram(u64),
    DeleteProgram(u64),
    UseProgram(u64),
    SetUniform { program: u64, name: String, value: UniformValue },
    ActiveTexture(u32),
    BindTexture { unit: u32, texture: Option<u64> },
    CreateRenderTarget { id: u64, attachments: Vec<u64> },
    DeleteRenderTarget(u64),
    BindRenderTarget(Option<u64>),
    Viewport(u32, u32, u32, u32),
    Draw { program: u64, target: Option<u64> },
    BeginTimer,
    EndTimer,
}

#[derive(Debug, Default)]
pub struct RecordingGpu {
    next_id: u64,
    pub events: Vec<GpuEvent>,
    textures: HashMap<u64, (u32, u32)>,
    shaders: HashMap<u64, (ShaderStage, String)>,
    programs: HashMap<u64, String>,
    targets: HashMap<u64, Vec<u64>>,
    deleted: HashSet<u64>,
    pub texture_allocations: usize,
    active_unit: u32,
    units: [Option<u64>; MAX_TEXTURE_UNITS as usize],
    current_program: Option<u64>,
    current_target: Option<u64>,
    /// Makes the next draw fail.
    pub fail_next_draw: bool,
    /// Makes texture allocation fail once this many more textures exist.
    pub texture_budget: Option<usize>,
    /// Makes uploads fail.
    pub fail_uploads: bool,
}

impl RecordingGpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn release(&mut self, id: u64, live: bool, kind: &str) {
        assert!(live, "{kind} #{id} released but not live");
        assert!(self.deleted.insert(id), "{kind} #{id} released twice");
    }

    pub fn active_unit(&self) -> u32 {
        self.active_unit
    }

    /// Units that currently hold a texture.
    pub fn occupied_units(&self) -> Vec<u32> {
        (0..MAX_TEXTURE_UNITS)
            .filter(|unit| self.units[*unit as usize].is_some())
            .collect()
    }

    pub fn current_target(&self) -> Option<u64> {
        self.current_target
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn live_shaders(&self) -> usize {
        self.shaders.len()
    }

    pub fn live_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn is_live_program(&self, id: u64) -> bool {
        self.programs.contains_key(&id)
    }

    pub fn is_live_texture(&self, id: u64) -> bool {
        self.textures.contains_key(&id)
    }

    /// Number of times `id` was released (0 or 1; a second release panics).
    pub fn release_count(&self, id: u64) -> usize {
        usize::from(self.deleted.contains(&id))
    }

    /// Fragment source a live program was linked from.
    pub fn program_source(&self, id: u64) -> Option<&str> {
        self.programs.get(&id).map(String::as_str)
    }

    /// Most recent value written to `name` on `program`.
    pub fn last_uniform(&self, program: u64, name: &str) -> Option<UniformValue> {
        self.events.iter().rev().find_map(|event| match event {
            GpuEvent::SetUniform {
                program: p,
                name: n,
                value,
            } if *p == program && n == name => Some(*value),
            _ => None,
        })
    }

    pub fn draws(&self) -> Vec<(u64, Option<u64>)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                GpuEvent::Draw { program, target } => Some((*program, *target)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    fn check_allocation(&self) -> Result<(), GpuError> {
        match self.texture_budget {
            Some(budget) if self.textures.len() >= budget => Err(GpuError::InvalidSize {
                width: 0,
                height: 0,
                max: 0,
            }),
            _ => Ok(()),
        }
    }
}

impl GpuApi for RecordingGpu {
    type Texture = u64;
    type Shader = u64;
    type Program = u64;
    type RenderTarget = u64;

    fn create_texture(&mut self, width: u32, height: u32) -> Result<u64, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize {
                width,
                height,
                max: u32::MAX,
            });
        }
        self.check_allocation()?;
        let id = self.allocate_id();
        self.textures.insert(id, (width, height));
        self.texture_allocations += 1;
        self.events.push(GpuEvent::CreateTexture { id, width, height });
        Ok(id)
    }

    fn upload_texture(&mut self, image: &RgbaImage) -> Result<u64, GpuError> {
        if self.fail_uploads {
            return Err(GpuError::Readback("upload rejected".into()));
        }
        self.check_allocation()?;
        let id = self.allocate_id();
        self.textures.insert(id, image.dimensions());
        self.texture_allocations += 1;
        self.events.push(GpuEvent::UploadTexture { id });
        Ok(id)
    }

    fn delete_texture(&mut self, texture: u64) {
        let live = self.textures.remove(&texture).is_some();
        self.release(texture, live, "texture");
        self.events.push(GpuEvent::DeleteTexture(texture));
    }

    fn texture_size(&self, texture: &u64) -> Option<(u32, u32)> {
        self.textures.get(texture).copied()
    }

    fn read_texture(&mut self, texture: &u64) -> Result<RgbaImage, GpuError> {
        let (width, height) = self.texture_size(texture).ok_or(GpuError::InvalidHandle {
            kind: "texture",
            id: *texture,
        })?;
        Ok(RgbaImage::from_pixel(width, height, image::Rgba([0, 0, 0, 255])))
    }

    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<u64, String> {
        if let Some(line) = source.lines().position(|line| line.contains("#error")) {
            return Err(format!("0:{}: error: #error directive", line + 1));
        }
        let id = self.allocate_id();
        self.shaders.insert(id, (stage, source.to_string()));
        self.events.push(GpuEvent::CompileShader { id, stage });
        Ok(id)
    }

    fn delete_shader(&mut self, shader: u64) {
        let live = self.shaders.remove(&shader).is_some();
        self.release(shader, live, "shader");
        self.events.push(GpuEvent::DeleteShader(shader));
    }

    fn link_program(&mut self, vertex: &u64, fragment: &u64) -> Result<(u64, String), String> {
        match self.shaders.get(vertex) {
            Some((ShaderStage::Vertex, _)) => {}
            _ => return Err(format!("shader #{vertex} is not a vertex stage")),
        }
        let source = match self.shaders.get(fragment) {
            Some((ShaderStage::Fragment, source)) => source.clone(),
            _ => return Err(format!("shader #{fragment} is not a fragment stage")),
        };
        if source.contains(FAIL_LINK_MARKER) {
            return Err("link error: unresolved varying".into());
        }
        let id = self.allocate_id();
        self.programs.insert(id, source);
        self.events.push(GpuEvent::LinkProgram(id));
        Ok((id, format!("program #{id} linked")))
    }

    fn delete_program(&mut self, program: u64) {
        let live = self.programs.remove(&program).is_some();
        self.release(program, live, "program");
        if self.current_program == Some(program) {
            self.current_program = None;
        }
        self.events.push(GpuEvent::DeleteProgram(program));
    }

    fn use_program(&mut self, program: &u64) {
        self.current_program = Some(*program);
        self.events.push(GpuEvent::UseProgram(*program));
    }

    fn set_uniform(&mut self, program: &u64, name: &str, value: UniformValue) {
        self.events.push(GpuEvent::SetUniform {
            program: *program,
            name: name.to_string(),
            value,
        });
    }

    fn active_texture(&mut self, unit: u32) -> Result<(), GpuError> {
        if unit >= MAX_TEXTURE_UNITS {
            return Err(GpuError::UnitOutOfRange {
                unit,
                max: MAX_TEXTURE_UNITS,
            });
        }
        self.active_unit = unit;
        self.events.push(GpuEvent::ActiveTexture(unit));
        Ok(())
    }

    fn bind_texture(&mut self, texture: Option<&u64>) -> Result<(), GpuError> {
        if let Some(id) = texture {
            if !self.textures.contains_key(id) {
                return Err(GpuError::InvalidHandle {
                    kind: "texture",
                    id: *id,
                });
            }
        }
        self.units[self.active_unit as usize] = texture.copied();
        self.events.push(GpuEvent::BindTexture {
            unit: self.active_unit,
            texture: texture.copied(),
        });
        Ok(())
    }

    fn create_render_target(&mut self, attachments: &[u64]) -> Result<u64, GpuError> {
        let first = attachments.first().ok_or(GpuError::EmptyRenderTarget)?;
        let size = self.texture_size(first);
        if attachments.iter().any(|id| self.texture_size(id) != size) {
            return Err(GpuError::MismatchedAttachments);
        }
        let id = self.allocate_id();
        self.targets.insert(id, attachments.to_vec());
        self.events.push(GpuEvent::CreateRenderTarget {
            id,
            attachments: attachments.to_vec(),
        });
        Ok(id)
    }

    fn delete_render_target(&mut self, target: u64) {
        let live = self.targets.remove(&target).is_some();
        self.release(target, live, "render target");
        self.events.push(GpuEvent::DeleteRenderTarget(target));
    }

    fn bind_render_target(&mut self, target: Option<&u64>) {
        self.current_target = target.copied();
        self.events.push(GpuEvent::BindRenderTarget(target.copied()));
    }

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.events.push(GpuEvent::Viewport(x, y, width, height));
    }

    fn draw_fullscreen_quad(&mut self) -> Result<(), GpuError> {
        let program = self.current_program.ok_or(GpuError::NoProgram)?;
        if std::mem::take(&mut self.fail_next_draw) {
            return Err(GpuError::Draw("injected draw failure".into()));
        }
        self.events.push(GpuEvent::Draw {
            program,
            target: self.current_target,
        });
        Ok(())
    }

    fn begin_timer(&mut self) {
        self.events.push(GpuEvent::BeginTimer);
    }

    fn end_timer(&mut self) -> Duration {
        self.events.push(GpuEvent::EndTimer);
        Duration::from_micros(250)
    }
}
