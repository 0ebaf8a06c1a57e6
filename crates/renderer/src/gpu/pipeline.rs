use std::borrow::Cow;

use wgpu::naga::ShaderStage as NagaStage;

use crate::compile::MAX_SAMPLER_SLOTS;

use super::textures::TEXTURE_FORMAT;
use super::uniforms::UNIFORM_BLOCK_SIZE;

/// Bind group layouts shared by every program.
///
/// Group 0 carries the uniform slot block, group 1 one texture/sampler pair
/// per sampler slot. Programs that reflect fewer samplers simply leave the
/// remaining bindings unused.
pub(crate) struct PipelineLayouts {
    pub uniform_layout: wgpu::BindGroupLayout,
    pub sampler_layout: wgpu::BindGroupLayout,
    pub pipeline_layout: wgpu::PipelineLayout,
}

impl PipelineLayouts {
    pub fn new(device: &wgpu::Device) -> Self {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: wgpu::BufferSize::new(UNIFORM_BLOCK_SIZE),
                },
                count: None,
            }],
        });
        let sampler_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sampler layout"),
            entries: &build_sampler_layout_entries(),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("program pipeline layout"),
            bind_group_layouts: &[&uniform_layout, &sampler_layout],
            push_constant_ranges: &[],
        });

        Self {
            uniform_layout,
            sampler_layout,
            pipeline_layout,
        }
    }
}

/// Runs the naga GLSL front end and validator over one stage.
///
/// Diagnostics use `0:<line>: error: <message>`, with lines counted from
/// the user's source (the first `line_offset` lines belong to the prelude).
pub(crate) fn parse_stage(
    stage: NagaStage,
    source: &str,
    line_offset: usize,
) -> Result<wgpu::naga::Module, String> {
    use wgpu::naga::front::glsl::{Frontend, Options};
    use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

    let user_line = |line: u32| (line as usize).saturating_sub(line_offset);

    let module = Frontend::default()
        .parse(&Options::from(stage), source)
        .map_err(|errors| {
            errors
                .errors
                .iter()
                .map(|error| {
                    let line = user_line(error.meta.location(source).line_number);
                    format!("0:{line}: error: {}", error.kind)
                })
                .collect::<Vec<_>>()
                .join("\n")
        })?;

    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| {
            let line = err
                .location(source)
                .map(|location| user_line(location.line_number))
                .unwrap_or(0);
            format!("0:{line}: error: {err}")
        })?;

    Ok(module)
}

/// Number of prelude lines ahead of the `#line 1` marker in wrapped source.
pub(crate) fn prelude_line_count(source: &str) -> usize {
    source
        .find("#line 1\n")
        .map(|index| source[..index].matches('\n').count() + 1)
        .unwrap_or(0)
}

/// Compiles GLSL that already passed the naga front end into a module.
pub(crate) fn create_module(
    device: &wgpu::Device,
    stage: NagaStage,
    source: &str,
    label: &str,
) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(source.to_string()),
            stage,
            defines: &[],
        },
    })
}

/// Builds a pipeline writing `target_count` colour attachments.
///
/// Attachments the fragment stage has no output for keep an empty write mask.
pub(crate) fn build_pipeline(
    device: &wgpu::Device,
    layouts: &PipelineLayouts,
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
    fragment_outputs: &[u32],
    target_count: usize,
) -> wgpu::RenderPipeline {
    let targets: Vec<Option<wgpu::ColorTargetState>> = (0..target_count as u32)
        .map(|location| {
            let write_mask = if fragment_outputs.contains(&location) {
                wgpu::ColorWrites::ALL
            } else {
                wgpu::ColorWrites::empty()
            };
            Some(wgpu::ColorTargetState {
                format: TEXTURE_FORMAT,
                blend: None,
                write_mask,
            })
        })
        .collect();

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("program pipeline"),
        layout: Some(&layouts.pipeline_layout),
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: fragment,
            entry_point: Some("main"),
            targets: &targets,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}

/// Locations written by the fragment entry point of a parsed module.
pub(crate) fn fragment_output_locations(module: &wgpu::naga::Module) -> Vec<u32> {
    use wgpu::naga::{Binding, TypeInner};

    let Some(entry) = module
        .entry_points
        .iter()
        .find(|entry| entry.stage == NagaStage::Fragment)
    else {
        return Vec::new();
    };
    let Some(result) = entry.function.result.as_ref() else {
        return Vec::new();
    };
    if let Some(Binding::Location { location, .. }) = &result.binding {
        return vec![*location];
    }
    match &module.types[result.ty].inner {
        TypeInner::Struct { members, .. } => members
            .iter()
            .filter_map(|member| match &member.binding {
                Some(Binding::Location { location, .. }) => Some(*location),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn build_sampler_layout_entries() -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = Vec::with_capacity(MAX_SAMPLER_SLOTS * 2);
    for index in 0..MAX_SAMPLER_SLOTS as u32 {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: index * 2,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: index * 2 + 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }
    entries
}

pub(crate) fn build_sampler_entries<'a>(
    views: &[&'a wgpu::TextureView],
    sampler: &'a wgpu::Sampler,
) -> Vec<wgpu::BindGroupEntry<'a>> {
    let mut entries = Vec::with_capacity(views.len() * 2);
    for (index, view) in views.iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: (index as u32) * 2,
            resource: wgpu::BindingResource::TextureView(view),
        });
        entries.push(wgpu::BindGroupEntry {
            binding: (index as u32) * 2 + 1,
            resource: wgpu::BindingResource::Sampler(sampler),
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{
        wrap_fragment, COPY_FRAGMENT_GLSL, DEFAULT_FRAGMENT_GLSL, VERTEX_SHADER_GLSL,
    };

    fn parse_wrapped(source: &str) -> Result<wgpu::naga::Module, String> {
        let wrapped = wrap_fragment(source)?;
        parse_stage(
            NagaStage::Fragment,
            &wrapped.source,
            prelude_line_count(&wrapped.source),
        )
    }

    #[test]
    fn shared_vertex_stage_passes_naga() {
        let module = parse_stage(NagaStage::Vertex, VERTEX_SHADER_GLSL, 0)
            .unwrap_or_else(|log| panic!("{log}"));
        assert!(module
            .entry_points
            .iter()
            .any(|entry| entry.stage == NagaStage::Vertex && entry.name == "main"));
    }

    #[test]
    fn builtin_fragments_pass_naga() {
        for source in [COPY_FRAGMENT_GLSL, DEFAULT_FRAGMENT_GLSL] {
            let module = parse_wrapped(source).unwrap_or_else(|log| panic!("{log}"));
            assert_eq!(fragment_output_locations(&module), vec![0]);
        }
    }

    #[test]
    fn feedback_shader_with_two_outputs_passes_naga() {
        let source = r"#version 330
uniform float iTime;
uniform int iFrame;
uniform vec3 iResolution;
uniform vec4 uTint;
uniform sampler2D tex0;
uniform sampler2D texLastFrame0;
uniform sampler2D texLastFrame1;
layout(location = 0) out vec4 color;
layout(location = 1) out vec4 trail;

void main() {
    vec2 p = gl_FragCoord.xy / iResolution.xy;
    vec4 previous = texture(texLastFrame0, uv);
    float pulse = 0.5 + 0.5 * sin(iTime + float(iFrame));
    color = mix(texture(tex0, p), previous, 0.9) * pulse * uTint;
    trail = texture(texLastFrame1, uv) * 0.5;
}
";
        let module = parse_wrapped(source).unwrap_or_else(|log| panic!("{log}"));
        let mut outputs = fragment_output_locations(&module);
        outputs.sort_unstable();
        assert_eq!(outputs, vec![0, 1]);
    }

    #[test]
    fn library_unit_without_main_passes_naga() {
        let source = "float brighten(float x) {\n    return clamp(x * 1.5, 0.0, 1.0);\n}\n";
        parse_wrapped(source).unwrap_or_else(|log| panic!("{log}"));
    }

    #[test]
    fn wrapped_shader_errors_use_user_lines() {
        let source = "uniform float uGain;\nlayout(location = 0) out vec4 color;\nvoid main() {\n    color = vec4(missing_value * uGain);\n}\n";
        let log = parse_wrapped(source).unwrap_err();
        assert!(log.starts_with("0:4: error:"), "{log}");
    }

    #[test]
    fn prelude_offset_maps_to_first_user_line() {
        let source = "#version 450\nlayout(location = 0) in vec2 uv;\n#line 1\nvoid main() {}\n";
        let offset = prelude_line_count(source);
        assert_eq!(offset, 3);
        let main_line = source.lines().position(|line| line.starts_with("void")).unwrap() + 1;
        assert_eq!(main_line - offset, 1);
    }

    #[test]
    fn unwrapped_source_has_no_offset() {
        assert_eq!(prelude_line_count("void main() {}\n"), 0);
    }

    #[test]
    fn reports_user_relative_line_on_parse_error() {
        let source = "#version 450\n#line 1\nvoid main() {\n  float x = ;\n}\n";
        let log = parse_stage(NagaStage::Fragment, source, prelude_line_count(source)).unwrap_err();
        assert!(log.starts_with("0:2: error:"), "{log}");
    }
}
