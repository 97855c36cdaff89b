//! Collaborator interfaces for the precompiled bundle graph.
//!
//! The upstream bundler owns the graph; the loader only consumes it. All
//! traits are object safe and held behind `Arc<dyn …>` so the host build
//! tool (and the test helpers) can supply their own implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Execution context tag selecting which package-export conditions apply
/// while resolving an asset's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionContext {
    #[serde(rename = "client")]
    Client,
    #[serde(rename = "server")]
    Server,
}

impl ExecutionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionContext::Client => "client",
            ExecutionContext::Server => "server",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a bundle's packaged output is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleBehavior {
    /// Written to its own output file.
    Standalone,
    /// Embedded as a value inside a referencing asset.
    Inline,
}

/// One node in a bundle's traversal sequence.
pub enum BundleNode<'a> {
    Asset(&'a dyn Asset),
    Dependency(&'a dyn Dependency),
}

/// The frozen decision for one (asset, dependency) edge, computed once
/// during preload and never re-derived afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyResolution {
    /// Pre-resolved by the upstream graph to an internal asset.
    Asset(String),
    /// Satisfied by an inline sub-bundle's packaged contents.
    InlineBundle(String),
    /// Excluded from the output; imports resolve to an empty object.
    Skipped,
    /// Escapes the graph; falls through to the specifier resolver.
    External(String),
}

/// One compiled source unit with a stable internal identifier.
pub trait Asset: Send + Sync {
    fn id(&self) -> &str;
    fn file_path(&self) -> &Path;
    /// Output type of the asset, e.g. "js" or "css".
    fn kind(&self) -> &str;
    fn context(&self) -> ExecutionContext;
    /// Fetch the compiled source text. May perform IO.
    fn code(&self) -> anyhow::Result<String>;
    /// Free-form metadata attached by the upstream compiler.
    fn meta(&self) -> &serde_json::Value;
}

/// A directed edge from an asset to a symbolic specifier.
pub trait Dependency: Send + Sync {
    fn id(&self) -> &str;
    fn specifier(&self) -> &str;
    /// Runtime alias substituted for the specifier in compiled code.
    fn placeholder(&self) -> Option<&str>;
}

/// A named output unit grouping assets.
pub trait Bundle: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    fn behavior(&self) -> BundleBehavior;
    fn needs_stable_name(&self) -> bool;
    fn public_url(&self) -> &str;
    fn dist_dir(&self) -> &Path;
    fn scope_hoisted(&self) -> bool;
    fn entry_asset(&self) -> Option<&dyn Asset>;
    /// The bundle's {asset, dependency} node sequence, each node exactly
    /// once.
    fn traverse(&self) -> Vec<BundleNode<'_>>;
}

/// The precompiled dependency graph produced by the upstream bundler.
pub trait BundleGraph: Send + Sync {
    /// The bundle a dependency refers to, if it crosses a bundle boundary.
    fn referenced_bundle(
        &self,
        dependency: &dyn Dependency,
        bundle: &dyn Bundle,
    ) -> Option<&dyn Bundle>;

    /// The internal asset a dependency was pre-resolved to, if any.
    fn resolved_asset(&self, dependency: &dyn Dependency, bundle: &dyn Bundle)
        -> Option<&dyn Asset>;

    fn dependency_skipped(&self, dependency: &dyn Dependency) -> bool;

    /// The externally visible identifier of an asset, if it has one.
    fn public_id(&self, asset: &dyn Asset) -> Option<String>;

    fn dependencies(&self, asset: &dyn Asset) -> Vec<&dyn Dependency>;

    fn bundles(&self) -> Vec<&dyn Bundle>;

    fn entry_bundles(&self) -> Vec<&dyn Bundle>;
}

/// External packaging collaborator invoked for inline sub-bundles.
pub trait InlinePackager: Send + Sync {
    /// Package a bundle and return its contents as an expression that can
    /// be assigned to `module.exports`.
    fn package(&self, bundle: &dyn Bundle, graph: &dyn BundleGraph) -> anyhow::Result<String>;
}
