//! Static-site packaging orchestration on top of the loader core.
//!
//! Consumes a loaded bundle's entry export plus a small fixed set of
//! runtime modules and hands both to the rendering collaborator. Output
//! composition beyond that handoff (stream stitching, writing to disk)
//! belongs to the host build tool.

pub mod page;

pub use page::{page_meta, url_join, Page, PageProps};

use presspack_core::{
    Bundle, BundleGraph, BundleHandle, ExecutionContext, Exports, LoadError, LoaderSession,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

/// One runtime module to load before rendering, under an explicit
/// execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeModuleSpec {
    /// Name the renderer looks the module up under.
    pub name: String,
    pub specifier: String,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackagerConfig {
    #[serde(default)]
    pub runtime_modules: Vec<RuntimeModuleSpec>,
}

/// The runtime modules loaded for one package operation.
pub struct RuntimeModules {
    entries: HashMap<String, Exports>,
}

impl RuntimeModules {
    pub fn get(&self, name: &str) -> Option<&Exports> {
        self.entries.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One rendered output of a bundle, e.g. the HTML document or the
/// hydration payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub kind: String,
    pub contents: Vec<u8>,
}

/// Rendering collaborator: turns a loaded entry export into output bytes.
pub trait Renderer {
    fn render(
        &self,
        entry: &Exports,
        props: &PageProps,
        runtime: &RuntimeModules,
    ) -> anyhow::Result<Vec<RenderedArtifact>>;
}

pub struct StaticPackager {
    config: PackagerConfig,
    session: Rc<LoaderSession>,
    graph: Arc<dyn BundleGraph>,
    renderer: Arc<dyn Renderer>,
}

impl StaticPackager {
    pub fn new(
        config: PackagerConfig,
        session: Rc<LoaderSession>,
        graph: Arc<dyn BundleGraph>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            config,
            session,
            graph,
            renderer,
        }
    }

    /// Package one bundle: execute its entry server-side and render.
    pub fn package(&self, bundle: &dyn Bundle) -> anyhow::Result<Vec<RenderedArtifact>> {
        if bundle.scope_hoisted() {
            return Err(LoadError::UnsupportedConfiguration(
                "scope hoisting is not supported for static-site packaging".to_string(),
            )
            .into());
        }
        let entry = bundle.entry_asset().ok_or_else(|| {
            LoadError::UnsupportedConfiguration(format!(
                "bundle '{}' has no entry asset",
                bundle.id()
            ))
        })?;
        let entry_id = entry.id().to_string();
        let entry_meta = entry.meta().clone();

        info!(bundle = bundle.id(), entry = %entry_id, "packaging bundle");
        let handle = self.session.load_bundle(bundle)?;
        let entry_exports = handle.load(&entry_id)?;
        let runtime = self.load_runtime_modules(&handle)?;
        let props = self.page_props(bundle, &entry_meta);

        self.renderer.render(&entry_exports, &props, &runtime)
    }

    /// Load the configured runtime modules, each under its own execution
    /// context, anchored at the project root rather than at any asset.
    /// Repeated package operations share one execution per (module,
    /// context) through the session's module cache.
    fn load_runtime_modules(&self, handle: &BundleHandle) -> Result<RuntimeModules, LoadError> {
        let anchor = self.session.config().project_root.join("__presspack__.js");
        let mut entries = HashMap::new();
        for module in &self.config.runtime_modules {
            debug!(
                name = %module.name,
                specifier = %module.specifier,
                context = %module.context,
                "loading runtime module"
            );
            let exports = handle.load_external(&module.specifier, &anchor, module.context)?;
            entries.insert(module.name.clone(), exports);
        }
        Ok(RuntimeModules { entries })
    }

    /// Synthesize page descriptors from the graph's entry bundles.
    fn page_props(&self, bundle: &dyn Bundle, entry_meta: &serde_json::Value) -> PageProps {
        let mut pages = Vec::new();
        for candidate in self.graph.entry_bundles() {
            if candidate.kind() != "js" || !candidate.needs_stable_name() {
                continue;
            }
            let Some(main) = candidate.entry_asset() else {
                continue;
            };
            pages.push(Page {
                url: url_join(candidate.public_url(), candidate.name()),
                name: candidate.name().to_string(),
                meta: page_meta(main.meta()),
            });
        }

        let current_page = Page {
            url: url_join(bundle.public_url(), bundle.name()),
            name: bundle.name().to_string(),
            meta: page_meta(entry_meta),
        };

        PageProps {
            pages,
            current_page,
        }
    }
}
