use oxc_resolver::{ResolveOptions, Resolver};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{LoadError, Result};
use crate::graph::ExecutionContext;

/// Outcome of resolving a specifier that escapes the bundle graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A concrete file on disk.
    Path(PathBuf),
    /// A host built-in module; the sandbox cannot execute these.
    Builtin(String),
}

/// Import syntax the specifier was written in; selects the matching
/// package-export condition ("import" or "require").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
    Esm,
    CommonJs,
}

/// Filesystem-backed resolver for one execution context.
///
/// Each context gets its own instance because package-export conditions
/// differ between them: a package may map the same specifier to different
/// files for "client" and "server" consumers.
pub struct SpecifierResolver {
    context: ExecutionContext,
    esm: Resolver,
    cjs: Resolver,
}

impl SpecifierResolver {
    pub fn new(project_root: &Path, context: ExecutionContext, conditions: &[String]) -> Self {
        let esm = Resolver::new(options(project_root, conditions, "import"));
        let cjs = Resolver::new(options(project_root, conditions, "require"));
        Self { context, esm, cjs }
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    /// Map a specifier to a filesystem target or a built-in marker.
    ///
    /// Failure is fatal for the surrounding load; there is no retry.
    pub fn resolve(&self, specifier: &str, from: &Path, kind: SpecifierKind) -> Result<Resolved> {
        if let Some(name) = specifier.strip_prefix("node:") {
            return Ok(Resolved::Builtin(name.to_string()));
        }

        let dir = from.parent().unwrap_or_else(|| Path::new("."));
        let resolver = match kind {
            SpecifierKind::Esm => &self.esm,
            SpecifierKind::CommonJs => &self.cjs,
        };

        match resolver.resolve(dir, specifier) {
            Ok(resolution) => {
                let path = resolution.path().to_path_buf();
                debug!(
                    specifier,
                    context = %self.context,
                    path = %path.display(),
                    "resolved specifier"
                );
                Ok(Resolved::Path(path))
            }
            Err(err) => {
                debug!(specifier, context = %self.context, %err, "resolution failed");
                Err(LoadError::Resolution {
                    specifier: specifier.to_string(),
                    from: from.to_path_buf(),
                })
            }
        }
    }
}

fn options(project_root: &Path, conditions: &[String], kind_condition: &str) -> ResolveOptions {
    let mut condition_names: Vec<String> = conditions.to_vec();
    condition_names.push("node".to_string());
    condition_names.push(kind_condition.to_string());
    condition_names.push("default".to_string());

    ResolveOptions {
        extensions: vec![
            ".js".to_string(),
            ".mjs".to_string(),
            ".cjs".to_string(),
            ".json".to_string(),
        ],
        condition_names,
        roots: vec![project_root.to_path_buf()],
        ..ResolveOptions::default()
    }
}
