//! `#include "name"` expansion for fragment shaders.
//!
//! Includes resolve relative to the file that names them. Every include is
//! expanded recursively and then compiled on its own before its text is
//! spliced into the parent, so a broken helper file is reported by name
//! instead of as an error deep inside the combined source.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::IncludeError;

/// Maximum nesting of includes below the root shader.
pub const MAX_INCLUDE_DEPTH: usize = 16;

/// Text of one resolved include plus the key used for cycle detection.
#[derive(Debug, Clone)]
pub struct ResolvedInclude {
    pub key: PathBuf,
    pub source: String,
}

/// Locates include files on behalf of the shader registry.
pub trait IncludeResolver {
    /// Key of the root shader itself, used to reject self-inclusion.
    fn root(&self) -> Option<PathBuf> {
        None
    }

    /// Loads `include` as named from the file keyed `from` (`None` for the root).
    fn resolve(&self, include: &str, from: Option<&Path>) -> Result<ResolvedInclude, IncludeError>;
}

/// Resolves includes from the filesystem.
#[derive(Debug, Clone)]
pub struct DirectoryIncludes {
    root_file: PathBuf,
    root_dir: PathBuf,
}

impl DirectoryIncludes {
    /// Includes of the root shader resolve next to `shader_path`.
    pub fn for_file(shader_path: &Path) -> Self {
        let root_file = fs::canonicalize(shader_path).unwrap_or_else(|_| shader_path.to_path_buf());
        let root_dir = root_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            root_file,
            root_dir,
        }
    }
}

impl IncludeResolver for DirectoryIncludes {
    fn root(&self) -> Option<PathBuf> {
        Some(self.root_file.clone())
    }

    fn resolve(&self, include: &str, from: Option<&Path>) -> Result<ResolvedInclude, IncludeError> {
        let base = from
            .and_then(Path::parent)
            .unwrap_or(self.root_dir.as_path());
        let path = base.join(include);
        let source = fs::read_to_string(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => IncludeError::Missing {
                include: include.to_string(),
                path: path.clone(),
            },
            _ => IncludeError::Unreadable {
                include: include.to_string(),
                source: err,
            },
        })?;
        let key = fs::canonicalize(&path).unwrap_or(path);
        Ok(ResolvedInclude { key, source })
    }
}

/// Resolves includes from a fixed map of relative paths to source text.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIncludes {
    files: HashMap<PathBuf, String>,
}

impl InMemoryIncludes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

impl IncludeResolver for InMemoryIncludes {
    fn resolve(&self, include: &str, from: Option<&Path>) -> Result<ResolvedInclude, IncludeError> {
        let path = match from.and_then(Path::parent) {
            Some(parent) => parent.join(include),
            None => PathBuf::from(include),
        };
        match self.files.get(&path) {
            Some(source) => Ok(ResolvedInclude {
                key: path,
                source: source.clone(),
            }),
            None => Err(IncludeError::Missing {
                include: include.to_string(),
                path,
            }),
        }
    }
}

/// Expands every include in `source`.
///
/// `check` compiles an include's expanded text standalone and returns the
/// compiler log on failure. A file reached through two branches is spliced
/// in only once.
pub fn expand_includes<F>(
    source: &str,
    resolver: &dyn IncludeResolver,
    mut check: F,
) -> Result<String, IncludeError>
where
    F: FnMut(&str) -> Result<(), String>,
{
    let root = resolver.root();
    let mut expander = Expander {
        resolver,
        check: &mut check,
        stack: root.iter().cloned().collect(),
        expanded: HashSet::new(),
    };
    let mut out = String::with_capacity(source.len());
    expander.expand(source, root.as_deref(), 0, &mut out)?;
    Ok(out)
}

struct Expander<'a> {
    resolver: &'a dyn IncludeResolver,
    check: &'a mut dyn FnMut(&str) -> Result<(), String>,
    stack: Vec<PathBuf>,
    expanded: HashSet<PathBuf>,
}

impl Expander<'_> {
    fn expand(
        &mut self,
        source: &str,
        origin: Option<&Path>,
        depth: usize,
        out: &mut String,
    ) -> Result<(), IncludeError> {
        for line in source.lines() {
            let Some(include) = parse_include_directive(line) else {
                out.push_str(line);
                out.push('\n');
                continue;
            };

            let resolved = self.resolver.resolve(include, origin)?;
            if self.stack.contains(&resolved.key) {
                let mut chain: Vec<String> = self
                    .stack
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect();
                chain.push(resolved.key.display().to_string());
                return Err(IncludeError::Cycle {
                    include: include.to_string(),
                    chain,
                });
            }
            if self.expanded.contains(&resolved.key) {
                out.push('\n');
                continue;
            }
            if depth + 1 > MAX_INCLUDE_DEPTH {
                return Err(IncludeError::TooDeep {
                    include: include.to_string(),
                    max: MAX_INCLUDE_DEPTH,
                });
            }

            self.stack.push(resolved.key.clone());
            let mut text = String::with_capacity(resolved.source.len());
            let nested = self.expand(&resolved.source, Some(&resolved.key), depth + 1, &mut text);
            self.stack.pop();
            nested?;

            (self.check)(&text).map_err(|log| IncludeError::Invalid {
                include: include.to_string(),
                log,
            })?;
            tracing::trace!(include, key = %resolved.key.display(), "expanded include");
            self.expanded.insert(resolved.key);
            out.push_str(&text);
        }
        Ok(())
    }
}

/// Returns the quoted name of an `#include "name"` (or `<name>`) line.
fn parse_include_directive(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("include")?.trim();
    let name = rest
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .or_else(|| rest.strip_prefix('<').and_then(|inner| inner.strip_suffix('>')))?;
    (!name.is_empty()).then_some(name)
}
