use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbaImage;
use tracing::{debug, warn};
use wgpu::naga::ShaderStage as NagaStage;
use wgpu::util::DeviceExt;

use crate::compile::{wrap_fragment, MAX_SAMPLER_SLOTS};
use crate::types::{AdapterProfile, GpuPowerPreference};

use super::context::GpuContext;
use super::pipeline::{
    build_pipeline, build_sampler_entries, create_module, fragment_output_locations, parse_stage,
    prelude_line_count, PipelineLayouts,
};
use super::textures::{
    create_placeholder, create_render_texture, create_sampler, read_back, upload_image,
    TextureResource,
};
use super::timer::FrameTimer;
use super::uniforms::{UniformTable, UNIFORM_BLOCK_SIZE};
use super::{GpuApi, GpuError, ShaderStage, UniformValue, MAX_TEXTURE_UNITS};

/// Handle to a texture owned by [`WgpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(u64);

/// Handle to a compiled shader stage owned by [`WgpuBackend`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ShaderHandle(u64);

/// Handle to a linked program owned by [`WgpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(u64);

/// Handle to a render target owned by [`WgpuBackend`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TargetHandle(u64);

struct CompiledShader {
    stage: ShaderStage,
    module: wgpu::ShaderModule,
    fragment: Option<FragmentInterface>,
}

struct FragmentInterface {
    uniforms: UniformTable,
    outputs: Vec<u32>,
}

struct LinkedProgram {
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    outputs: Vec<u32>,
    uniforms: UniformTable,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    pipelines: HashMap<usize, wgpu::RenderPipeline>,
}

/// Headless `wgpu` implementation of [`GpuApi`].
///
/// Emulates the texture-unit model on top of bind groups: sampler uniforms
/// store the unit they read from, and each draw resolves those units into a
/// fresh texture bind group. Drawing with no render target bound writes into
/// an internal "screen" texture sized to the viewport.
pub struct WgpuBackend {
    context: GpuContext,
    layouts: PipelineLayouts,
    next_id: u64,
    textures: HashMap<u64, TextureResource>,
    shaders: HashMap<u64, CompiledShader>,
    programs: HashMap<u64, LinkedProgram>,
    targets: HashMap<u64, Vec<u64>>,
    units: [Option<u64>; MAX_TEXTURE_UNITS as usize],
    active_unit: u32,
    current_program: Option<u64>,
    current_target: Option<u64>,
    viewport: Option<(u32, u32, u32, u32)>,
    placeholder: TextureResource,
    sampler: wgpu::Sampler,
    screen: TextureResource,
    timer: FrameTimer,
}

impl WgpuBackend {
    pub fn new(power: GpuPowerPreference) -> Result<Self> {
        let context = GpuContext::new_headless(power)?;
        let layouts = PipelineLayouts::new(&context.device);
        let placeholder = create_placeholder(&context.device, &context.queue);
        let sampler = create_sampler(&context.device);
        let screen = create_render_texture(&context.device, 0, 1, 1);

        Ok(Self {
            context,
            layouts,
            next_id: 1,
            textures: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            targets: HashMap::new(),
            units: [None; MAX_TEXTURE_UNITS as usize],
            active_unit: 0,
            current_program: None,
            current_target: None,
            viewport: None,
            placeholder,
            sampler,
            screen,
            timer: FrameTimer::default(),
        })
    }

    pub fn adapter_profile(&self) -> &AdapterProfile {
        &self.context.adapter_profile
    }

    /// Number of live textures, programs and render targets, for leak checks.
    pub fn live_resources(&self) -> (usize, usize, usize) {
        (self.textures.len(), self.programs.len(), self.targets.len())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), GpuError> {
        let max = self.context.max_texture_dimension;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(GpuError::InvalidSize { width, height, max });
        }
        Ok(())
    }

    fn compile_fragment(&self, source: &str) -> Result<CompiledShader, String> {
        let wrapped = wrap_fragment(source)?;
        let module = parse_stage(
            NagaStage::Fragment,
            &wrapped.source,
            prelude_line_count(&wrapped.source),
        )?;
        let outputs = fragment_output_locations(&module);
        let module = self.checked_module(NagaStage::Fragment, &wrapped.source)?;
        Ok(CompiledShader {
            stage: ShaderStage::Fragment,
            module,
            fragment: Some(FragmentInterface {
                uniforms: UniformTable::from_reflection(&wrapped),
                outputs,
            }),
        })
    }

    fn checked_module(&self, stage: NagaStage, source: &str) -> Result<wgpu::ShaderModule, String> {
        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = create_module(device, stage, source, "program stage");
        match pollster::block_on(device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(module),
        }
    }

    /// Ensures the screen texture covers the current viewport.
    fn fit_screen(&mut self) {
        let (x, y, width, height) = self
            .viewport
            .unwrap_or((0, 0, self.screen.width, self.screen.height));
        let wanted = ((x + width).max(1), (y + height).max(1));
        if (self.screen.width, self.screen.height) != wanted {
            debug!(width = wanted.0, height = wanted.1, "resizing screen texture");
            self.screen.texture.destroy();
            self.screen = create_render_texture(&self.context.device, 0, wanted.0, wanted.1);
        }
    }
}

impl GpuApi for WgpuBackend {
    type Texture = TextureHandle;
    type Shader = ShaderHandle;
    type Program = ProgramHandle;
    type RenderTarget = TargetHandle;

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle, GpuError> {
        self.check_size(width, height)?;
        let id = self.allocate_id();
        let resource = create_render_texture(&self.context.device, id, width, height);
        self.textures.insert(id, resource);
        Ok(TextureHandle(id))
    }

    fn upload_texture(&mut self, image: &RgbaImage) -> Result<TextureHandle, GpuError> {
        let (width, height) = image.dimensions();
        self.check_size(width, height)?;
        let id = self.allocate_id();
        let resource = upload_image(&self.context.device, &self.context.queue, id, image);
        self.textures.insert(id, resource);
        Ok(TextureHandle(id))
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        match self.textures.remove(&texture.0) {
            Some(resource) => resource.texture.destroy(),
            None => warn!(id = texture.0, "delete of unknown texture"),
        }
        for unit in self.units.iter_mut() {
            if *unit == Some(texture.0) {
                *unit = None;
            }
        }
    }

    fn texture_size(&self, texture: &TextureHandle) -> Option<(u32, u32)> {
        self.textures
            .get(&texture.0)
            .map(|resource| (resource.width, resource.height))
    }

    fn read_texture(&mut self, texture: &TextureHandle) -> Result<RgbaImage, GpuError> {
        let resource = self.textures.get(&texture.0).ok_or(GpuError::InvalidHandle {
            kind: "texture",
            id: texture.0,
        })?;
        read_back(&self.context.device, &self.context.queue, resource)
    }

    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderHandle, String> {
        let compiled = match stage {
            ShaderStage::Fragment => self.compile_fragment(source)?,
            ShaderStage::Vertex => {
                parse_stage(NagaStage::Vertex, source, 0)?;
                CompiledShader {
                    stage,
                    module: self.checked_module(NagaStage::Vertex, source)?,
                    fragment: None,
                }
            }
        };
        let id = self.allocate_id();
        self.shaders.insert(id, compiled);
        Ok(ShaderHandle(id))
    }

    fn delete_shader(&mut self, shader: ShaderHandle) {
        if self.shaders.remove(&shader.0).is_none() {
            warn!(id = shader.0, "delete of unknown shader");
        }
    }

    fn link_program(
        &mut self,
        vertex: &ShaderHandle,
        fragment: &ShaderHandle,
    ) -> Result<(ProgramHandle, String), String> {
        let vertex_stage = self
            .shaders
            .get(&vertex.0)
            .filter(|shader| shader.stage == ShaderStage::Vertex)
            .ok_or_else(|| format!("shader #{} is not a compiled vertex stage", vertex.0))?;
        let fragment_stage = self
            .shaders
            .get(&fragment.0)
            .filter(|shader| shader.stage == ShaderStage::Fragment)
            .ok_or_else(|| format!("shader #{} is not a compiled fragment stage", fragment.0))?;
        let interface = fragment_stage
            .fragment
            .as_ref()
            .ok_or_else(|| "fragment stage carries no interface".to_string())?;

        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = build_pipeline(
            device,
            &self.layouts,
            &vertex_stage.module,
            &fragment_stage.module,
            &interface.outputs,
            1,
        );
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(err.to_string());
        }

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("program uniforms"),
            contents: &[0u8; UNIFORM_BLOCK_SIZE as usize],
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let uniform_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("program uniform bind group"),
            layout: &self.layouts.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform_buffer.as_entire_binding(),
            }],
        });

        let program = LinkedProgram {
            vertex: vertex_stage.module.clone(),
            fragment: fragment_stage.module.clone(),
            outputs: interface.outputs.clone(),
            uniforms: interface.uniforms.clone(),
            uniform_buffer,
            uniform_bind_group,
            pipelines: HashMap::from([(1, pipeline)]),
        };
        let id = self.allocate_id();
        self.programs.insert(id, program);
        debug!(id, "linked program");
        Ok((ProgramHandle(id), String::new()))
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program.0).is_none() {
            warn!(id = program.0, "delete of unknown program");
        }
        if self.current_program == Some(program.0) {
            self.current_program = None;
        }
    }

    fn use_program(&mut self, program: &ProgramHandle) {
        self.current_program = Some(program.0);
    }

    fn set_uniform(&mut self, program: &ProgramHandle, name: &str, value: UniformValue) {
        match self.programs.get_mut(&program.0) {
            Some(linked) => {
                linked.uniforms.set(name, value);
            }
            None => warn!(id = program.0, name, "uniform write to unknown program"),
        }
    }

    fn active_texture(&mut self, unit: u32) -> Result<(), GpuError> {
        if unit >= MAX_TEXTURE_UNITS {
            return Err(GpuError::UnitOutOfRange {
                unit,
                max: MAX_TEXTURE_UNITS,
            });
        }
        self.active_unit = unit;
        Ok(())
    }

    fn bind_texture(&mut self, texture: Option<&TextureHandle>) -> Result<(), GpuError> {
        let binding = match texture {
            Some(handle) if self.textures.contains_key(&handle.0) => Some(handle.0),
            Some(handle) => {
                return Err(GpuError::InvalidHandle {
                    kind: "texture",
                    id: handle.0,
                })
            }
            None => None,
        };
        self.units[self.active_unit as usize] = binding;
        Ok(())
    }

    fn create_render_target(&mut self, attachments: &[TextureHandle]) -> Result<TargetHandle, GpuError> {
        let first = attachments.first().ok_or(GpuError::EmptyRenderTarget)?;
        let size = self.texture_size(first).ok_or(GpuError::InvalidHandle {
            kind: "texture",
            id: first.0,
        })?;
        for attachment in attachments {
            match self.texture_size(attachment) {
                Some(other) if other == size => {}
                Some(_) => return Err(GpuError::MismatchedAttachments),
                None => {
                    return Err(GpuError::InvalidHandle {
                        kind: "texture",
                        id: attachment.0,
                    })
                }
            }
        }
        let id = self.allocate_id();
        self.targets
            .insert(id, attachments.iter().map(|handle| handle.0).collect());
        Ok(TargetHandle(id))
    }

    fn delete_render_target(&mut self, target: TargetHandle) {
        if self.targets.remove(&target.0).is_none() {
            warn!(id = target.0, "delete of unknown render target");
        }
        if self.current_target == Some(target.0) {
            self.current_target = None;
        }
    }

    fn bind_render_target(&mut self, target: Option<&TargetHandle>) {
        self.current_target = target.map(|handle| handle.0);
    }

    fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.viewport = Some((x, y, width, height));
    }

    fn draw_fullscreen_quad(&mut self) -> Result<(), GpuError> {
        let program_id = self.current_program.ok_or(GpuError::NoProgram)?;
        if self.current_target.is_none() {
            self.fit_screen();
        }

        let attachment_ids: Vec<u64> = match self.current_target {
            Some(id) => self
                .targets
                .get(&id)
                .cloned()
                .ok_or(GpuError::InvalidHandle {
                    kind: "render target",
                    id,
                })?,
            None => Vec::new(),
        };
        let mut color_views = Vec::with_capacity(attachment_ids.len().max(1));
        let mut extent = (self.screen.width, self.screen.height);
        if attachment_ids.is_empty() {
            color_views.push(&self.screen.view);
        } else {
            for id in &attachment_ids {
                let resource = self
                    .textures
                    .get(id)
                    .ok_or(GpuError::InvalidHandle { kind: "texture", id: *id })?;
                extent = (resource.width, resource.height);
                color_views.push(&resource.view);
            }
        }

        let LinkedProgram {
            vertex,
            fragment,
            outputs,
            uniforms,
            uniform_buffer,
            uniform_bind_group,
            pipelines,
        } = self
            .programs
            .get_mut(&program_id)
            .ok_or(GpuError::InvalidHandle {
                kind: "program",
                id: program_id,
            })?;

        let mut sampled_views = vec![&self.placeholder.view; MAX_SAMPLER_SLOTS];
        for (slot, &unit) in uniforms.sampler_units().iter().enumerate() {
            let Some(texture_id) = self.units[unit as usize] else {
                continue;
            };
            if attachment_ids.contains(&texture_id) {
                warn!(texture_id, unit, "texture is both sampled and written; sampling placeholder");
                continue;
            }
            if let Some(resource) = self.textures.get(&texture_id) {
                sampled_views[slot] = &resource.view;
            }
        }

        let device = &self.context.device;
        let queue = &self.context.queue;
        if let Some(bytes) = uniforms.take_dirty_bytes() {
            queue.write_buffer(uniform_buffer, 0, bytes);
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let target_count = color_views.len();
        let pipeline = pipelines.entry(target_count).or_insert_with(|| {
            debug!(program_id, target_count, "building pipeline variant");
            build_pipeline(device, &self.layouts, vertex, fragment, outputs, target_count)
        });
        let sampler_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("sampler bind group"),
            layout: &self.layouts.sampler_layout,
            entries: &build_sampler_entries(&sampled_views, &self.sampler),
        });

        let (x, y, width, height) = self.viewport.unwrap_or((0, 0, extent.0, extent.1));
        let x = x.min(extent.0);
        let y = y.min(extent.1);
        let width = width.min(extent.0 - x);
        let height = height.min(extent.1 - y);

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("draw encoder"),
        });
        {
            let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
                .iter()
                .map(|view| {
                    Some(wgpu::RenderPassColorAttachment {
                        view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })
                })
                .collect();
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("fullscreen pass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if width > 0 && height > 0 {
                render_pass.set_viewport(
                    x as f32,
                    y as f32,
                    width as f32,
                    height as f32,
                    0.0,
                    1.0,
                );
                render_pass.set_pipeline(pipeline);
                render_pass.set_bind_group(0, &*uniform_bind_group, &[]);
                render_pass.set_bind_group(1, &sampler_bind_group, &[]);
                render_pass.draw(0..3, 0..1);
            }
        }
        queue.submit(std::iter::once(encoder.finish()));

        match pollster::block_on(device.pop_error_scope()) {
            Some(err) => Err(GpuError::Draw(err.to_string())),
            None => Ok(()),
        }
    }

    fn begin_timer(&mut self) {
        self.timer.begin(Instant::now());
    }

    fn end_timer(&mut self) -> Duration {
        self.context.wait_idle();
        self.timer.end(Instant::now())
    }
}
