//! Identity-keyed table of linked shader programs.
//!
//! Each identity moves through a small state machine:
//!
//! ```text
//!   Unregistered ──compile ok──▶ Custom(program)
//!        │                          │  ▲
//!        │ compile/link fails       │  │ recompile ok
//!        ▼                          ▼  │
//!     Default ◀──────compile/link fails─┘
//!
//!   remove(identity) returns any state to Unregistered.
//! ```
//!
//! A failed build always leaves the identity rendering the shared default
//! program; a failed include expansion leaves it exactly as it was.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use tracing::{debug, info, warn};

use crate::error::{CompileStage, IncludeError, NoActiveShader, ShaderError};
use crate::gpu::{GpuApi, ShaderStage, UniformValue};
use crate::include::{expand_includes, IncludeResolver};

/// Program bound to a registered identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramEntry<P> {
    Custom(P),
    Default,
}

pub struct ShaderRegistry<G: GpuApi, K = String> {
    vertex: G::Shader,
    default_program: G::Program,
    entries: HashMap<K, ProgramEntry<G::Program>>,
    current: Option<G::Program>,
}

impl<G, K> ShaderRegistry<G, K>
where
    G: GpuApi,
    K: Eq + Hash + Clone + Display,
{
    /// Compiles the shared vertex stage and the default fragment program.
    pub fn new(gpu: &mut G, vertex_source: &str, default_fragment: &str) -> Result<Self, ShaderError> {
        let vertex = gpu
            .compile_shader(ShaderStage::Vertex, vertex_source)
            .map_err(|log| ShaderError::Compile {
                identity: "vertex".to_string(),
                stage: CompileStage::Vertex,
                log,
            })?;
        let default_program = match link_fragment(gpu, &vertex, "default", default_fragment) {
            Ok((program, _)) => program,
            Err(err) => {
                gpu.delete_shader(vertex);
                return Err(err);
            }
        };
        Ok(Self {
            vertex,
            default_program,
            entries: HashMap::new(),
            current: None,
        })
    }

    /// Builds a program outside the identity table, linked with the shared vertex stage.
    ///
    /// The caller owns the result and releases it with `GpuApi::delete_program`.
    pub fn build_unregistered(
        &self,
        gpu: &mut G,
        name: &str,
        fragment_source: &str,
    ) -> Result<G::Program, ShaderError> {
        link_fragment(gpu, &self.vertex, name, fragment_source).map(|(program, _)| program)
    }

    /// Expands includes, compiles, and links `fragment_source` under `identity`.
    ///
    /// On success the identity's previous program is replaced and the link log
    /// is returned. On a compile or link failure the previous program is still
    /// released and the identity falls back to the default program. Include
    /// failures return before anything is touched.
    pub fn compile_and_register(
        &mut self,
        gpu: &mut G,
        identity: K,
        fragment_source: &str,
        resolver: &dyn IncludeResolver,
    ) -> Result<String, ShaderError> {
        let expanded = expand_includes(fragment_source, resolver, |text| check_standalone(gpu, text))
            .map_err(|source: IncludeError| {
                warn!(identity = %identity, error = %source, "include expansion failed");
                ShaderError::Include {
                    identity: identity.to_string(),
                    source,
                }
            })?;

        if let Some(ProgramEntry::Custom(previous)) =
            self.entries.insert(identity.clone(), ProgramEntry::Default)
        {
            if self.current.as_ref() == Some(&previous) {
                self.current = None;
            }
            gpu.delete_program(previous);
            debug!(identity = %identity, "released previous program");
        }

        match link_fragment(gpu, &self.vertex, &identity.to_string(), &expanded) {
            Ok((program, log)) => {
                self.entries
                    .insert(identity.clone(), ProgramEntry::Custom(program));
                info!(identity = %identity, "shader registered");
                Ok(log)
            }
            Err(err) => {
                warn!(identity = %identity, "shader build failed; using default program");
                Err(err)
            }
        }
    }

    /// Makes the identity's program current.
    ///
    /// Returns `false` when the identity is unknown or bound to the default
    /// program; the default program is activated in that case.
    pub fn activate(&mut self, gpu: &mut G, identity: &K) -> bool {
        let (program, custom) = match self.entries.get(identity) {
            Some(ProgramEntry::Custom(program)) => (program.clone(), true),
            _ => (self.default_program.clone(), false),
        };
        gpu.use_program(&program);
        self.current = Some(program);
        custom
    }

    /// Releases and unregisters the identity; returns whether it was present.
    pub fn remove(&mut self, gpu: &mut G, identity: &K) -> bool {
        match self.entries.remove(identity) {
            Some(ProgramEntry::Custom(program)) => {
                if self.current.as_ref() == Some(&program) {
                    self.current = None;
                }
                gpu.delete_program(program);
                debug!(identity = %identity, "shader removed");
                true
            }
            Some(ProgramEntry::Default) => true,
            None => false,
        }
    }

    /// Writes a uniform on the current program.
    ///
    /// Calling this before any [`activate`](Self::activate) is a contract
    /// violation: debug builds panic, release builds skip the write and
    /// return [`NoActiveShader`].
    pub fn set_uniform(
        &mut self,
        gpu: &mut G,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> Result<(), NoActiveShader> {
        let Some(program) = self.current.as_ref() else {
            debug_assert!(false, "uniform '{name}' set while no shader is active");
            warn!(name, "uniform set while no shader is active");
            return Err(NoActiveShader);
        };
        gpu.set_uniform(program, name, value.into());
        Ok(())
    }

    pub fn current_program(&self) -> Option<&G::Program> {
        self.current.as_ref()
    }

    pub fn default_program(&self) -> &G::Program {
        &self.default_program
    }

    pub fn entry(&self, identity: &K) -> Option<&ProgramEntry<G::Program>> {
        self.entries.get(identity)
    }

    pub fn is_custom(&self, identity: &K) -> bool {
        matches!(self.entries.get(identity), Some(ProgramEntry::Custom(_)))
    }

    pub fn identities(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Releases custom programs, then the default program, then the vertex stage.
    pub fn teardown(self, gpu: &mut G) {
        for (_, entry) in self.entries {
            if let ProgramEntry::Custom(program) = entry {
                gpu.delete_program(program);
            }
        }
        gpu.delete_program(self.default_program);
        gpu.delete_shader(self.vertex);
    }
}

fn check_standalone<G: GpuApi>(gpu: &mut G, source: &str) -> Result<(), String> {
    let shader = gpu.compile_shader(ShaderStage::Fragment, source)?;
    gpu.delete_shader(shader);
    Ok(())
}

/// Compiles a fragment stage and links it with `vertex`; the stage is released either way.
fn link_fragment<G: GpuApi>(
    gpu: &mut G,
    vertex: &G::Shader,
    identity: &str,
    source: &str,
) -> Result<(G::Program, String), ShaderError> {
    let fragment = gpu
        .compile_shader(ShaderStage::Fragment, source)
        .map_err(|log| ShaderError::Compile {
            identity: identity.to_string(),
            stage: CompileStage::Fragment,
            log,
        })?;
    let linked = gpu.link_program(vertex, &fragment);
    gpu.delete_shader(fragment);
    linked.map_err(|log| ShaderError::Compile {
        identity: identity.to_string(),
        stage: CompileStage::Link,
        log,
    })
}
