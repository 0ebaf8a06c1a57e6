//! GLSL wrapping for user fragment shaders.
//!
//! Preview shaders are written against a GL-style uniform model (loose
//! `uniform float uTime;` and `uniform sampler2D tex0;` declarations) that
//! Vulkan-flavoured GLSL does not accept. [`wrap_fragment`] rewrites them:
//!
//! 1. Blank the `#version` directive and every reflected `uniform` line so
//!    line numbers in compiler logs still match the user's file.
//! 2. Prepend a prelude that declares the `uv` input, a std140 block of vec4
//!    slots, and one texture/sampler binding pair per reflected sampler.
//! 3. Map each reflected name onto its slot or binding pair with `#define`.

use std::collections::HashSet;

/// Upper bound on reflected value uniforms per program (one vec4 slot each).
pub const MAX_UNIFORM_SLOTS: usize = 64;
/// Upper bound on reflected `sampler2D` uniforms per program.
pub const MAX_SAMPLER_SLOTS: usize = 16;

/// Scalar/vector type of a reflected value uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
}

impl UniformKind {
    fn from_glsl(ty: &str) -> Option<Self> {
        match ty {
            "float" => Some(UniformKind::Float),
            "int" => Some(UniformKind::Int),
            "vec2" => Some(UniformKind::Vec2),
            "vec3" => Some(UniformKind::Vec3),
            "vec4" => Some(UniformKind::Vec4),
            _ => None,
        }
    }

    fn slot_expression(self, slot: usize) -> String {
        match self {
            UniformKind::Float => format!("(loop_uniforms.slots[{slot}].x)"),
            UniformKind::Int => format!("int(loop_uniforms.slots[{slot}].x)"),
            UniformKind::Vec2 => format!("(loop_uniforms.slots[{slot}].xy)"),
            UniformKind::Vec3 => format!("(loop_uniforms.slots[{slot}].xyz)"),
            UniformKind::Vec4 => format!("(loop_uniforms.slots[{slot}])"),
        }
    }
}

/// A value uniform mapped onto the slot block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedUniform {
    pub name: String,
    pub kind: UniformKind,
    pub slot: usize,
}

/// Result of [`wrap_fragment`]: compilable GLSL plus its uniform interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedFragment {
    pub source: String,
    pub uniforms: Vec<ReflectedUniform>,
    /// Sampler names in binding order; index `k` uses bindings `2k`/`2k + 1`.
    pub samplers: Vec<String>,
}

enum Declaration<'a> {
    Value(UniformKind, &'a str),
    Sampler(&'a str),
}

/// Rewrites a fragment shader into the prelude-backed dialect.
///
/// Fails with a compiler-style log when the shader declares more uniforms or
/// samplers than the slot block can hold.
pub fn wrap_fragment(source: &str) -> Result<WrappedFragment, String> {
    let mut body = String::with_capacity(source.len() + 1);
    let mut uniforms: Vec<ReflectedUniform> = Vec::new();
    let mut samplers: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut skipped_version = false;

    for (index, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if !skipped_version && trimmed.starts_with("#version") {
            skipped_version = true;
            body.push('\n');
            continue;
        }

        match parse_uniform_declaration(trimmed) {
            Some(Declaration::Value(kind, name)) => {
                if seen.insert(name) {
                    if uniforms.len() == MAX_UNIFORM_SLOTS {
                        return Err(format!(
                            "0:{}: error: too many uniforms (at most {MAX_UNIFORM_SLOTS} supported)",
                            index + 1
                        ));
                    }
                    uniforms.push(ReflectedUniform {
                        name: name.to_string(),
                        kind,
                        slot: uniforms.len(),
                    });
                }
                body.push('\n');
            }
            Some(Declaration::Sampler(name)) => {
                if seen.insert(name) {
                    if samplers.len() == MAX_SAMPLER_SLOTS {
                        return Err(format!(
                            "0:{}: error: too many samplers (at most {MAX_SAMPLER_SLOTS} supported)",
                            index + 1
                        ));
                    }
                    samplers.push(name.to_string());
                }
                body.push('\n');
            }
            None => {
                body.push_str(line);
                body.push('\n');
            }
        }
    }

    if !declares_main(source) {
        // Library units (includes checked standalone) carry no entry point.
        body.push_str("void main() {}\n");
    }

    let mut prelude = String::from(FRAGMENT_PRELUDE);
    for uniform in &uniforms {
        prelude.push_str(&format!(
            "#define {} {}\n",
            uniform.name,
            uniform.kind.slot_expression(uniform.slot)
        ));
    }
    for (index, name) in samplers.iter().enumerate() {
        let texture_binding = index * 2;
        let sampler_binding = texture_binding + 1;
        prelude.push_str(&format!(
            "layout(set = 1, binding = {texture_binding}) uniform texture2D loop_texture{index};\n\
             layout(set = 1, binding = {sampler_binding}) uniform sampler loop_sampler{index};\n\
             #define {name} sampler2D(loop_texture{index}, loop_sampler{index})\n"
        ));
    }

    Ok(WrappedFragment {
        source: format!("{prelude}#line 1\n{body}"),
        uniforms,
        samplers,
    })
}

fn parse_uniform_declaration(line: &str) -> Option<Declaration<'_>> {
    let code = line.split("//").next()?.trim_end();
    let rest = code.strip_prefix("uniform")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim().strip_suffix(';')?;
    let mut tokens = rest
        .split_whitespace()
        .filter(|token| !matches!(*token, "highp" | "mediump" | "lowp"));
    let ty = tokens.next()?;
    let name = tokens.next()?;
    if tokens.next().is_some() || !is_glsl_identifier(name) {
        return None;
    }
    if ty == "sampler2D" {
        return Some(Declaration::Sampler(name));
    }
    UniformKind::from_glsl(ty).map(|kind| Declaration::Value(kind, name))
}

fn is_glsl_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Detects a `main(` entry point while ignoring names such as `domain(`.
fn declares_main(source: &str) -> bool {
    let bytes = source.as_bytes();
    source.match_indices("main").any(|(start, _)| {
        let boundary_before = start == 0 || {
            let prev = bytes[start - 1];
            !(prev.is_ascii_alphanumeric() || prev == b'_')
        };
        let after = source[start + 4..].trim_start();
        boundary_before && after.starts_with('(')
    })
}

/// Injected ahead of every fragment shader; the slot count must match
/// [`MAX_UNIFORM_SLOTS`] and the uniform buffer layout in `gpu::uniforms`.
const FRAGMENT_PRELUDE: &str = r"#version 450
layout(location = 0) in vec2 uv;

layout(std140, set = 0, binding = 0) uniform LoopUniforms {
    vec4 slots[64];
} loop_uniforms;

";

/// Full-screen triangle shared by every program.
///
/// The clip-space y axis is mirrored so row 0 of every render target holds
/// the bottom of the image, matching how uploaded textures are stored and
/// keeping `uv`, `gl_FragCoord`, and feedback sampling on one orientation.
pub const VERTEX_SHADER_GLSL: &str = r"#version 450
layout(location = 0) out vec2 uv;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    vec2 pos = positions[vertex_index];
    uv = pos * 0.5 + vec2(0.5, 0.5);
    gl_Position = vec4(pos.x, -pos.y, 0.0, 1.0);
}
";

/// Passthrough used to present the feedback surface.
pub const COPY_FRAGMENT_GLSL: &str = r"layout(location = 0) out vec4 color;
uniform sampler2D frame;

void main() {
    color = texture(frame, uv);
}
";

/// Checkerboard shown for identities whose shader failed to build.
pub const DEFAULT_FRAGMENT_GLSL: &str = r"layout(location = 0) out vec4 color;

void main() {
    vec2 cell = floor(uv * 8.0);
    float checker = mod(cell.x + cell.y, 2.0);
    color = vec4(vec3(0.25 + 0.5 * checker), 1.0);
}
";
