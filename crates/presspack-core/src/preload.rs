//! Asset preloader: one traversal per bundle, bounded parallel fetch.
//!
//! Produces the complete per-bundle mapping from every reachable internal
//! asset id to its metadata, source text, and frozen resolution table.
//! Inline sub-bundles are packaged through the external collaborator,
//! memoized per sub-bundle id, and wrapped as assignable source text.

use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::InlineBundleCache;
use crate::errors::{LoadError, Result};
use crate::graph::{
    Asset, Bundle, BundleBehavior, BundleGraph, BundleNode, DependencyResolution, ExecutionContext,
    InlinePackager,
};

/// Fixed ceiling on concurrent fetch/package operations.
pub(crate) const MAX_IN_FLIGHT: usize = 32;

/// Owned snapshot of one asset after preloading.
pub(crate) struct PreloadedAsset {
    pub id: String,
    pub file_path: PathBuf,
    pub context: ExecutionContext,
    pub kind: String,
    pub code: Arc<String>,
    pub meta: serde_json::Value,
    pub public_id: Option<String>,
    pub resolutions: FxHashMap<String, DependencyResolution>,
}

enum FetchTask<'a> {
    Code(&'a dyn Asset),
    Inline(&'a dyn Bundle),
}

enum Fetched {
    Code { id: String, code: String },
    Inline { id: String, contents: String },
}

/// Preload every asset reachable from `bundle`.
///
/// Any individual fetch or packaging failure aborts the whole preload; a
/// partial bundle is never returned.
pub(crate) fn preload_bundle(
    graph: &dyn BundleGraph,
    bundle: &dyn Bundle,
    inline_packager: &dyn InlinePackager,
    inline_cache: &InlineBundleCache,
) -> Result<Vec<PreloadedAsset>> {
    debug!(bundle = bundle.id(), "preloading bundle");

    let mut assets: Vec<&dyn Asset> = Vec::new();
    let mut seen_assets: FxHashSet<String> = FxHashSet::default();
    let mut inline_bundles: Vec<&dyn Bundle> = Vec::new();
    let mut seen_inline: FxHashSet<String> = FxHashSet::default();

    for node in bundle.traverse() {
        match node {
            BundleNode::Asset(asset) => {
                if seen_assets.insert(asset.id().to_string()) {
                    assets.push(asset);
                }
            }
            BundleNode::Dependency(dependency) => {
                if let Some(referenced) = graph.referenced_bundle(dependency, bundle) {
                    if referenced.behavior() == BundleBehavior::Inline
                        && seen_inline.insert(referenced.id().to_string())
                    {
                        inline_bundles.push(referenced);
                    }
                }
            }
        }
    }

    // Already-packaged sub-bundles are served from the session cache; the
    // rest go through the collaborator exactly once each.
    let mut wrapped: FxHashMap<String, Arc<String>> = FxHashMap::default();
    let mut to_package: Vec<&dyn Bundle> = Vec::new();
    for inline in &inline_bundles {
        match inline_cache.get(inline.id()) {
            Some(text) => {
                wrapped.insert(inline.id().to_string(), text);
            }
            None => to_package.push(*inline),
        }
    }

    let mut tasks: Vec<FetchTask<'_>> = Vec::with_capacity(assets.len() + to_package.len());
    tasks.extend(assets.iter().map(|asset| FetchTask::Code(*asset)));
    tasks.extend(to_package.iter().map(|inline| FetchTask::Inline(*inline)));

    let fetched: Vec<Fetched> = if tasks.is_empty() {
        Vec::new()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(MAX_IN_FLIGHT)
            .build()
            .map_err(|err| LoadError::Engine(err.to_string()))?;
        pool.install(|| {
            tasks
                .par_iter()
                .map(|task| match task {
                    FetchTask::Code(asset) => asset
                        .code()
                        .map(|code| Fetched::Code {
                            id: asset.id().to_string(),
                            code,
                        })
                        .map_err(|err| LoadError::Fetch {
                            id: asset.id().to_string(),
                            message: format!("{err:#}"),
                        }),
                    FetchTask::Inline(inline) => inline_packager
                        .package(*inline, graph)
                        .map(|contents| Fetched::Inline {
                            id: inline.id().to_string(),
                            contents,
                        })
                        .map_err(|err| LoadError::Fetch {
                            id: inline.id().to_string(),
                            message: format!("{err:#}"),
                        }),
                })
                .collect::<Result<Vec<_>>>()
        })?
    };

    let mut codes: FxHashMap<String, Arc<String>> = FxHashMap::default();
    for item in fetched {
        match item {
            Fetched::Code { id, code } => {
                codes.insert(id, Arc::new(code));
            }
            Fetched::Inline { id, contents } => {
                let text = Arc::new(format!("module.exports = {};", contents));
                inline_cache.insert(id.clone(), Arc::clone(&text));
                wrapped.insert(id, text);
            }
        }
    }

    let mut loaded = Vec::with_capacity(assets.len() + inline_bundles.len());
    for asset in &assets {
        let code = codes
            .remove(asset.id())
            .ok_or_else(|| LoadError::UnknownAsset {
                id: asset.id().to_string(),
            })?;
        loaded.push(PreloadedAsset {
            id: asset.id().to_string(),
            file_path: asset.file_path().to_path_buf(),
            context: asset.context(),
            kind: asset.kind().to_string(),
            code,
            meta: asset.meta().clone(),
            public_id: graph.public_id(*asset),
            resolutions: compute_resolutions(graph, bundle, *asset),
        });
    }

    for inline in &inline_bundles {
        let entry = inline.entry_asset().ok_or_else(|| {
            LoadError::UnsupportedConfiguration(format!(
                "inline bundle '{}' has no entry asset",
                inline.id()
            ))
        })?;
        let code = wrapped
            .get(inline.id())
            .cloned()
            .ok_or_else(|| LoadError::UnknownAsset {
                id: inline.id().to_string(),
            })?;
        loaded.push(PreloadedAsset {
            id: inline.id().to_string(),
            file_path: entry.file_path().to_path_buf(),
            context: entry.context(),
            kind: entry.kind().to_string(),
            code,
            meta: entry.meta().clone(),
            public_id: graph.public_id(entry),
            resolutions: compute_resolutions(graph, bundle, entry),
        });
    }

    info!(bundle = bundle.id(), assets = loaded.len(), "preloaded bundle");
    Ok(loaded)
}

/// Build the frozen resolution table for one asset. Internal edges are
/// pre-resolved by the upstream graph; only unmatched specifiers will
/// later fall through to the specifier resolver.
fn compute_resolutions(
    graph: &dyn BundleGraph,
    bundle: &dyn Bundle,
    asset: &dyn Asset,
) -> FxHashMap<String, DependencyResolution> {
    let mut table = FxHashMap::default();
    for dependency in graph.dependencies(asset) {
        let key = dependency
            .placeholder()
            .unwrap_or_else(|| dependency.specifier())
            .to_string();

        let resolution = if graph.dependency_skipped(dependency) {
            DependencyResolution::Skipped
        } else if let Some(referenced) = graph
            .referenced_bundle(dependency, bundle)
            .filter(|referenced| referenced.behavior() == BundleBehavior::Inline)
        {
            DependencyResolution::InlineBundle(referenced.id().to_string())
        } else if let Some(resolved) = graph.resolved_asset(dependency, bundle) {
            if resolved.kind() == "js" {
                DependencyResolution::Asset(resolved.id().to_string())
            } else {
                DependencyResolution::Skipped
            }
        } else {
            DependencyResolution::External(dependency.specifier().to_string())
        };

        table.insert(key, resolution);
    }
    table
}
