//! Mock implementations of the bundle-graph collaborator traits.

use presspack_core::graph::{
    Asset, Bundle, BundleBehavior, BundleGraph, BundleNode, Dependency, ExecutionContext,
    InlinePackager,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tracks how many fetches are in flight at once.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

pub struct MockAsset {
    id: String,
    file_path: PathBuf,
    context: ExecutionContext,
    kind: String,
    code: String,
    meta: JsonValue,
    fetch_count: AtomicUsize,
    fetch_delay: Option<Duration>,
    fail_fetch: bool,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl MockAsset {
    pub fn new(
        id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        context: ExecutionContext,
        code: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            context,
            kind: "js".to_string(),
            code: code.into(),
            meta: JsonValue::Object(Default::default()),
            fetch_count: AtomicUsize::new(0),
            fetch_delay: None,
            fail_fetch: false,
            gauge: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn with_failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

impl Asset for MockAsset {
    fn id(&self) -> &str {
        &self.id
    }

    fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn context(&self) -> ExecutionContext {
        self.context
    }

    fn code(&self) -> anyhow::Result<String> {
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if let Some(delay) = self.fetch_delay {
            std::thread::sleep(delay);
        }
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail_fetch {
            Err(anyhow::anyhow!("synthetic fetch failure"))
        } else {
            Ok(self.code.clone())
        };
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        result
    }

    fn meta(&self) -> &JsonValue {
        &self.meta
    }
}

enum MockResolution {
    Asset(String),
    InlineBundle(String),
    Skipped,
    External,
}

pub struct MockDependency {
    id: String,
    specifier: String,
    placeholder: Option<String>,
    resolution: MockResolution,
}

impl MockDependency {
    pub fn to_asset(
        id: impl Into<String>,
        specifier: impl Into<String>,
        asset_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            specifier: specifier.into(),
            placeholder: None,
            resolution: MockResolution::Asset(asset_id.into()),
        }
    }

    pub fn inline(
        id: impl Into<String>,
        specifier: impl Into<String>,
        bundle_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            specifier: specifier.into(),
            placeholder: None,
            resolution: MockResolution::InlineBundle(bundle_id.into()),
        }
    }

    pub fn skipped(id: impl Into<String>, specifier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            specifier: specifier.into(),
            placeholder: None,
            resolution: MockResolution::Skipped,
        }
    }

    pub fn external(id: impl Into<String>, specifier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            specifier: specifier.into(),
            placeholder: None,
            resolution: MockResolution::External,
        }
    }

    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }
}

impl Dependency for MockDependency {
    fn id(&self) -> &str {
        &self.id
    }

    fn specifier(&self) -> &str {
        &self.specifier
    }

    fn placeholder(&self) -> Option<&str> {
        self.placeholder.as_deref()
    }
}

enum MockNode {
    Asset(Arc<MockAsset>),
    Dependency(Arc<MockDependency>),
}

pub struct MockBundle {
    id: String,
    name: String,
    kind: String,
    behavior: BundleBehavior,
    needs_stable_name: bool,
    public_url: String,
    dist_dir: PathBuf,
    scope_hoisted: bool,
    entry: Option<Arc<MockAsset>>,
    nodes: Vec<MockNode>,
}

impl Bundle for MockBundle {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn behavior(&self) -> BundleBehavior {
        self.behavior
    }

    fn needs_stable_name(&self) -> bool {
        self.needs_stable_name
    }

    fn public_url(&self) -> &str {
        &self.public_url
    }

    fn dist_dir(&self) -> &Path {
        &self.dist_dir
    }

    fn scope_hoisted(&self) -> bool {
        self.scope_hoisted
    }

    fn entry_asset(&self) -> Option<&dyn Asset> {
        self.entry.as_deref().map(|asset| asset as &dyn Asset)
    }

    fn traverse(&self) -> Vec<BundleNode<'_>> {
        self.nodes
            .iter()
            .map(|node| match node {
                MockNode::Asset(asset) => BundleNode::Asset(&**asset),
                MockNode::Dependency(dependency) => BundleNode::Dependency(&**dependency),
            })
            .collect()
    }
}

/// Declarative description of a bundle; assets and dependencies must be
/// registered on the graph before the bundle is added.
pub struct MockBundleSpec {
    id: String,
    name: String,
    kind: String,
    behavior: BundleBehavior,
    needs_stable_name: bool,
    public_url: String,
    dist_dir: PathBuf,
    scope_hoisted: bool,
    entry: Option<String>,
    assets: Vec<String>,
}

impl MockBundleSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: "js".to_string(),
            behavior: BundleBehavior::Standalone,
            needs_stable_name: false,
            public_url: "/".to_string(),
            dist_dir: PathBuf::from("/dist"),
            scope_hoisted: false,
            entry: None,
            assets: Vec::new(),
        }
    }

    pub fn entry(mut self, asset_id: impl Into<String>) -> Self {
        let asset_id = asset_id.into();
        if !self.assets.contains(&asset_id) {
            self.assets.push(asset_id.clone());
        }
        self.entry = Some(asset_id);
        self
    }

    pub fn asset(mut self, asset_id: impl Into<String>) -> Self {
        self.assets.push(asset_id.into());
        self
    }

    pub fn assets<I, S>(mut self, asset_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assets.extend(asset_ids.into_iter().map(Into::into));
        self
    }

    pub fn inline(mut self) -> Self {
        self.behavior = BundleBehavior::Inline;
        self
    }

    pub fn stable_name(mut self) -> Self {
        self.needs_stable_name = true;
        self
    }

    pub fn scope_hoisted(mut self) -> Self {
        self.scope_hoisted = true;
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }

    pub fn dist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dist_dir = dir.into();
        self
    }
}

#[derive(Default)]
pub struct MockBundleGraph {
    assets: HashMap<String, Arc<MockAsset>>,
    dependencies: HashMap<String, Vec<Arc<MockDependency>>>,
    dependency_index: HashMap<String, Arc<MockDependency>>,
    bundles: Vec<Arc<MockBundle>>,
    entry_bundle_ids: Vec<String>,
    public_ids: HashMap<String, String>,
}

impl MockBundleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_asset(&mut self, asset: MockAsset) -> Arc<MockAsset> {
        let asset = Arc::new(asset);
        self.assets.insert(asset.id.clone(), Arc::clone(&asset));
        asset
    }

    pub fn add_dependency(
        &mut self,
        from_asset: &str,
        dependency: MockDependency,
    ) -> Arc<MockDependency> {
        let dependency = Arc::new(dependency);
        self.dependency_index
            .insert(dependency.id.clone(), Arc::clone(&dependency));
        self.dependencies
            .entry(from_asset.to_string())
            .or_default()
            .push(Arc::clone(&dependency));
        dependency
    }

    pub fn set_public_id(&mut self, asset_id: impl Into<String>, public_id: impl Into<String>) {
        self.public_ids.insert(asset_id.into(), public_id.into());
    }

    pub fn add_bundle(&mut self, spec: MockBundleSpec) -> Arc<MockBundle> {
        let mut nodes = Vec::new();
        for asset_id in &spec.assets {
            if let Some(dependencies) = self.dependencies.get(asset_id) {
                for dependency in dependencies {
                    nodes.push(MockNode::Dependency(Arc::clone(dependency)));
                }
            }
            let asset = self
                .assets
                .get(asset_id)
                .unwrap_or_else(|| panic!("asset '{}' must be registered before the bundle", asset_id));
            nodes.push(MockNode::Asset(Arc::clone(asset)));
        }
        let entry = spec.entry.as_ref().map(|asset_id| {
            Arc::clone(
                self.assets
                    .get(asset_id)
                    .unwrap_or_else(|| panic!("entry asset '{}' must be registered", asset_id)),
            )
        });
        let bundle = Arc::new(MockBundle {
            id: spec.id,
            name: spec.name,
            kind: spec.kind,
            behavior: spec.behavior,
            needs_stable_name: spec.needs_stable_name,
            public_url: spec.public_url,
            dist_dir: spec.dist_dir,
            scope_hoisted: spec.scope_hoisted,
            entry,
            nodes,
        });
        self.bundles.push(Arc::clone(&bundle));
        bundle
    }

    pub fn mark_entry_bundle(&mut self, bundle_id: impl Into<String>) {
        self.entry_bundle_ids.push(bundle_id.into());
    }
}

impl BundleGraph for MockBundleGraph {
    fn referenced_bundle(
        &self,
        dependency: &dyn Dependency,
        _bundle: &dyn Bundle,
    ) -> Option<&dyn Bundle> {
        let dependency = self.dependency_index.get(dependency.id())?;
        match &dependency.resolution {
            MockResolution::InlineBundle(bundle_id) => self
                .bundles
                .iter()
                .find(|bundle| bundle.id == *bundle_id)
                .map(|bundle| &**bundle as &dyn Bundle),
            _ => None,
        }
    }

    fn resolved_asset(
        &self,
        dependency: &dyn Dependency,
        _bundle: &dyn Bundle,
    ) -> Option<&dyn Asset> {
        let dependency = self.dependency_index.get(dependency.id())?;
        match &dependency.resolution {
            MockResolution::Asset(asset_id) => self
                .assets
                .get(asset_id)
                .map(|asset| &**asset as &dyn Asset),
            _ => None,
        }
    }

    fn dependency_skipped(&self, dependency: &dyn Dependency) -> bool {
        self.dependency_index
            .get(dependency.id())
            .map(|dependency| matches!(dependency.resolution, MockResolution::Skipped))
            .unwrap_or(false)
    }

    fn public_id(&self, asset: &dyn Asset) -> Option<String> {
        self.public_ids.get(asset.id()).cloned()
    }

    fn dependencies(&self, asset: &dyn Asset) -> Vec<&dyn Dependency> {
        self.dependencies
            .get(asset.id())
            .map(|dependencies| {
                dependencies
                    .iter()
                    .map(|dependency| &**dependency as &dyn Dependency)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn bundles(&self) -> Vec<&dyn Bundle> {
        self.bundles
            .iter()
            .map(|bundle| &**bundle as &dyn Bundle)
            .collect()
    }

    fn entry_bundles(&self) -> Vec<&dyn Bundle> {
        self.entry_bundle_ids
            .iter()
            .filter_map(|bundle_id| {
                self.bundles
                    .iter()
                    .find(|bundle| bundle.id == *bundle_id)
                    .map(|bundle| &**bundle as &dyn Bundle)
            })
            .collect()
    }
}

/// Inline packager that records every invocation.
#[derive(Default)]
pub struct CountingInlinePackager {
    contents: HashMap<String, String>,
    calls: AtomicUsize,
    per_bundle: Mutex<HashMap<String, usize>>,
}

impl CountingInlinePackager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the packaged expression returned for a bundle id.
    pub fn with_contents(
        mut self,
        bundle_id: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        self.contents.insert(bundle_id.into(), expression.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, bundle_id: &str) -> usize {
        *self
            .per_bundle
            .lock()
            .unwrap()
            .get(bundle_id)
            .unwrap_or(&0)
    }
}

impl InlinePackager for CountingInlinePackager {
    fn package(&self, bundle: &dyn Bundle, _graph: &dyn BundleGraph) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_bundle
            .lock()
            .unwrap()
            .entry(bundle.id().to_string())
            .or_insert(0) += 1;
        self.contents.get(bundle.id()).cloned().ok_or_else(|| {
            anyhow::anyhow!("no inline contents registered for bundle '{}'", bundle.id())
        })
    }
}
