//! Bundle loader: orchestrates preloading, per-asset import callbacks, and
//! memoized sandbox execution.
//!
//! All caches live in an explicit [`LoaderSession`] constructed at
//! configuration time and invalidated on configuration reload; nothing is
//! process-global. The session is single-threaded by design: the engine
//! context is not `Send`, and every cache is mutated only from the thread
//! driving the package operation.

use rquickjs::{Array, Ctx, Exception, Function, Object, Value};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, info};

use crate::bridge::PublicIdBridge;
use crate::cache::{InlineBundleCache, ModuleCache, ModuleKey};
use crate::config::LoaderConfig;
use crate::errors::{LoadError, Result};
use crate::graph::{Bundle, BundleGraph, DependencyResolution, ExecutionContext, InlinePackager};
use crate::preload::{preload_bundle, PreloadedAsset};
use crate::resolver::{Resolved, SpecifierKind, SpecifierResolver};
use crate::sandbox::{compile_unit, engine_message, throw_load_error, Exports, Sandbox};

/// Target metadata of a loaded bundle, exposed to executing code through
/// the global loader handle.
#[derive(Debug, Clone)]
pub struct BundleMeta {
    pub dist_dir: PathBuf,
    pub public_url: String,
}

/// Per-bundle asset table plus its lookup indices. Append-only during one
/// load; growth happens only through lazy cross-bundle pulls.
pub(crate) struct LoadedBundle {
    id: String,
    entry_asset_id: Option<String>,
    meta: BundleMeta,
    assets: RefCell<FxHashMap<String, Rc<PreloadedAsset>>>,
    by_file_path: RefCell<FxHashMap<ModuleKey, String>>,
    by_public_id: RefCell<FxHashMap<String, String>>,
}

impl LoadedBundle {
    fn new(bundle: &dyn Bundle, preloaded: Vec<PreloadedAsset>) -> Self {
        let loaded = Self {
            id: bundle.id().to_string(),
            entry_asset_id: bundle.entry_asset().map(|asset| asset.id().to_string()),
            meta: BundleMeta {
                dist_dir: bundle.dist_dir().to_path_buf(),
                public_url: bundle.public_url().to_string(),
            },
            assets: RefCell::new(FxHashMap::default()),
            by_file_path: RefCell::new(FxHashMap::default()),
            by_public_id: RefCell::new(FxHashMap::default()),
        };
        for asset in preloaded {
            let asset = Rc::new(asset);
            let id = asset.id.clone();
            loaded.insert_asset_if_absent(&id, &asset);
        }
        loaded
    }

    fn asset(&self, asset_id: &str) -> Option<Rc<PreloadedAsset>> {
        self.assets.borrow().get(asset_id).cloned()
    }

    fn asset_id_for(&self, key: &ModuleKey) -> Option<String> {
        self.by_file_path.borrow().get(key).cloned()
    }

    fn asset_for_public_id(&self, public_id: &str) -> Option<String> {
        self.by_public_id.borrow().get(public_id).cloned()
    }

    fn insert_asset_if_absent(&self, id: &str, asset: &Rc<PreloadedAsset>) {
        {
            let mut assets = self.assets.borrow_mut();
            if assets.contains_key(id) {
                return;
            }
            assets.insert(id.to_string(), Rc::clone(asset));
        }
        let key = ModuleKey::new(asset.file_path.clone(), asset.context);
        self.by_file_path
            .borrow_mut()
            .entry(key)
            .or_insert_with(|| id.to_string());
        if let Some(public_id) = &asset.public_id {
            self.by_public_id
                .borrow_mut()
                .entry(public_id.clone())
                .or_insert_with(|| id.to_string());
        }
    }

    /// Merge another bundle's asset table into this one. Ids already
    /// present are kept: first writer wins, duplicates are assumed
    /// content-identical.
    fn merge_from(&self, other: &LoadedBundle) {
        let other_assets = other.assets.borrow();
        for (id, asset) in other_assets.iter() {
            self.insert_asset_if_absent(id, asset);
        }
    }

    fn register_public_ids(&self, bridge: &PublicIdBridge) {
        let assets = self.assets.borrow();
        for (id, asset) in assets.iter() {
            if let Some(public_id) = &asset.public_id {
                bridge.register(public_id.clone(), self.id.clone(), id.clone());
            }
        }
    }
}

/// One configuration cycle's worth of loader state.
pub struct LoaderSession {
    weak: Weak<LoaderSession>,
    config: LoaderConfig,
    graph: Arc<dyn BundleGraph>,
    inline_packager: Arc<dyn InlinePackager>,
    client_resolver: SpecifierResolver,
    server_resolver: SpecifierResolver,
    modules: ModuleCache,
    inline_cache: InlineBundleCache,
    bridge: PublicIdBridge,
    bundles: RefCell<FxHashMap<String, Rc<LoadedBundle>>>,
    // Declared last so it drops last: the caches above hold persistent
    // engine values that must be released before the runtime is freed.
    sandbox: Sandbox,
}

impl LoaderSession {
    pub fn new(
        config: LoaderConfig,
        graph: Arc<dyn BundleGraph>,
        inline_packager: Arc<dyn InlinePackager>,
    ) -> Result<Rc<Self>> {
        let client_resolver = SpecifierResolver::new(
            &config.project_root,
            ExecutionContext::Client,
            &config.client_conditions,
        );
        let server_resolver = SpecifierResolver::new(
            &config.project_root,
            ExecutionContext::Server,
            &config.server_conditions,
        );
        let sandbox = Sandbox::new()?;
        info!(project_root = %config.project_root.display(), "loader session created");
        Ok(Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            graph,
            inline_packager,
            client_resolver,
            server_resolver,
            sandbox,
            modules: ModuleCache::default(),
            inline_cache: InlineBundleCache::default(),
            bridge: PublicIdBridge::default(),
            bundles: RefCell::new(FxHashMap::default()),
        }))
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Clear every cache. Must run on configuration reload, before the
    /// next package operation, or stale module records would be served.
    /// The engine context itself stays alive; only loader state is reset.
    pub fn invalidate(&self) {
        self.modules.clear();
        self.inline_cache.clear();
        self.bridge.clear();
        self.bundles.borrow_mut().clear();
        info!("loader caches invalidated");
    }

    /// Load a bundle: preload its assets (memoized per bundle id) and
    /// return a handle for executing them.
    pub fn load_bundle(&self, bundle: &dyn Bundle) -> Result<BundleHandle> {
        let session = self
            .weak
            .upgrade()
            .ok_or_else(|| LoadError::Engine("loader session dropped".to_string()))?;
        let loaded = self.load_bundle_inner(bundle)?;
        Ok(BundleHandle {
            session,
            bundle: loaded,
        })
    }

    fn load_bundle_inner(&self, bundle: &dyn Bundle) -> Result<Rc<LoadedBundle>> {
        if let Some(loaded) = self.bundles.borrow().get(bundle.id()).cloned() {
            return Ok(loaded);
        }
        let preloaded = preload_bundle(
            &*self.graph,
            bundle,
            &*self.inline_packager,
            &self.inline_cache,
        )?;
        let loaded = Rc::new(LoadedBundle::new(bundle, preloaded));
        loaded.register_public_ids(&self.bridge);
        self.bundles
            .borrow_mut()
            .insert(bundle.id().to_string(), Rc::clone(&loaded));
        Ok(loaded)
    }

    fn resolver(&self, context: ExecutionContext) -> &SpecifierResolver {
        match context {
            ExecutionContext::Client => &self.client_resolver,
            ExecutionContext::Server => &self.server_resolver,
        }
    }

    fn load_asset<'js>(
        &self,
        ctx: &Ctx<'js>,
        bundle: &Rc<LoadedBundle>,
        asset_id: &str,
    ) -> Result<Value<'js>> {
        let asset = bundle.asset(asset_id).ok_or_else(|| LoadError::UnknownAsset {
            id: asset_id.to_string(),
        })?;
        let key = ModuleKey::new(asset.file_path.clone(), asset.context);
        if let Some(module) = self.modules.get(ctx, &key)? {
            let exports: Value = module.get("exports")?;
            return Ok(exports);
        }

        debug!(asset = asset_id, key = %key, "executing asset");
        let require = self.asset_require(ctx, bundle, &asset)?;
        let loader = self.loader_handle(ctx, bundle)?;
        self.execute(ctx, &asset.code, &asset.file_path, key, require, loader)
    }

    /// The local import callback for one asset: the frozen resolution
    /// table is checked first; only unmatched specifiers fall through to
    /// the specifier resolver.
    fn require_from<'js>(
        &self,
        ctx: &Ctx<'js>,
        bundle: &Rc<LoadedBundle>,
        asset: &Rc<PreloadedAsset>,
        specifier: &str,
    ) -> Result<Value<'js>> {
        match asset.resolutions.get(specifier) {
            Some(DependencyResolution::Skipped) => {
                debug!(specifier, from = %asset.file_path.display(), "skipped dependency");
                Ok(Object::new(ctx.clone())?.into_value())
            }
            Some(DependencyResolution::Asset(id)) | Some(DependencyResolution::InlineBundle(id)) => {
                let id = id.clone();
                self.load_asset(ctx, bundle, &id)
            }
            Some(DependencyResolution::External(external)) => {
                let external = external.clone();
                self.load_external_inner(ctx, bundle, &external, &asset.file_path, asset.context)
            }
            None => {
                self.load_external_inner(ctx, bundle, specifier, &asset.file_path, asset.context)
            }
        }
    }

    fn load_external_inner<'js>(
        &self,
        ctx: &Ctx<'js>,
        bundle: &Rc<LoadedBundle>,
        specifier: &str,
        from: &Path,
        context: ExecutionContext,
    ) -> Result<Value<'js>> {
        let resolved = self
            .resolver(context)
            .resolve(specifier, from, SpecifierKind::CommonJs)?;
        let path = match resolved {
            Resolved::Builtin(name) => {
                return Err(LoadError::UnsupportedConfiguration(format!(
                    "built-in module '{name}' is not available in the packaging sandbox"
                )));
            }
            Resolved::Path(path) => path,
        };

        let key = ModuleKey::new(path.clone(), context);
        if let Some(module) = self.modules.get(ctx, &key)? {
            let exports: Value = module.get("exports")?;
            return Ok(exports);
        }

        // Externally resolved paths that correspond to preloaded assets
        // execute from the asset table, not the filesystem.
        if let Some(asset_id) = bundle.asset_id_for(&key) {
            return self.load_asset(ctx, bundle, &asset_id);
        }

        let code = std::fs::read_to_string(&path)?;
        debug!(path = %path.display(), %context, "executing external module");
        let require = self.external_require(ctx, bundle, &path, context)?;
        let loader = self.loader_handle(ctx, bundle)?;
        self.execute(ctx, &code, &path, key, require, loader)
    }

    fn load_public_inner<'js>(
        &self,
        ctx: &Ctx<'js>,
        bundle: &Rc<LoadedBundle>,
        public_id: &str,
    ) -> Result<Value<'js>> {
        if let Some(asset_id) = bundle.asset_for_public_id(public_id) {
            return self.load_asset(ctx, bundle, &asset_id);
        }

        if let Some(entry) = self.bridge.lookup(public_id) {
            let other = self.bundles.borrow().get(&entry.bundle_id).cloned();
            if let Some(other) = other {
                return self.load_asset(ctx, &other, &entry.asset_id);
            }
        }

        // The identifier may name a bundle rather than a known asset: pull
        // that bundle in at runtime and merge its asset table into ours.
        let other = self.pull_bundle_by_name(bundle, public_id)?;
        if let Some(asset_id) = bundle.asset_for_public_id(public_id) {
            return self.load_asset(ctx, bundle, &asset_id);
        }
        if let Some(entry_id) = other.entry_asset_id.clone() {
            return self.load_asset(ctx, bundle, &entry_id);
        }
        Err(LoadError::UnknownBundle {
            name: public_id.to_string(),
        })
    }

    fn pull_bundle_by_name(
        &self,
        target: &Rc<LoadedBundle>,
        name: &str,
    ) -> Result<Rc<LoadedBundle>> {
        let graph = Arc::clone(&self.graph);
        let bundles = graph.bundles();
        let bundle = bundles
            .iter()
            .find(|bundle| bundle.name() == name)
            .copied()
            .ok_or_else(|| LoadError::UnknownBundle {
                name: name.to_string(),
            })?;
        let other = self.load_bundle_inner(bundle)?;
        if !Rc::ptr_eq(&other, target) {
            debug!(from = %other.id, into = %target.id, "merging lazily pulled bundle");
            target.merge_from(&other);
        }
        Ok(other)
    }

    /// Compile and run one unit. The module record is cached before the
    /// body executes and evicted again if execution fails.
    fn execute<'js>(
        &self,
        ctx: &Ctx<'js>,
        code: &str,
        path: &Path,
        key: ModuleKey,
        require: Function<'js>,
        loader: Function<'js>,
    ) -> Result<Value<'js>> {
        let unit = compile_unit(ctx, code, path).map_err(|err| LoadError::Execution {
            path: path.to_path_buf(),
            message: engine_message(ctx, err),
        })?;

        let filename = path.to_string_lossy().into_owned();
        let dirname = path
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());

        let exports = Object::new(ctx.clone())?;
        let module = Object::new(ctx.clone())?;
        module.set("exports", exports.clone())?;
        module.set("id", key.to_string())?;
        module.set("filename", filename.clone())?;
        module.set("path", dirname.clone())?;
        module.set("children", Array::new(ctx.clone())?)?;

        // Insert before executing: a circular reference back into this key
        // must observe the partially populated exports, not recurse.
        self.modules.insert(ctx, key.clone(), &module);

        let called: rquickjs::Result<Value> =
            unit.call((exports, require, module.clone(), dirname, filename, loader));
        match called {
            Ok(_) => {
                let exports: Value = module.get("exports")?;
                Ok(exports)
            }
            Err(err) => {
                let message = engine_message(ctx, err);
                self.modules.remove(&key);
                Err(LoadError::Execution {
                    path: path.to_path_buf(),
                    message,
                })
            }
        }
    }

    fn asset_require<'js>(
        &self,
        ctx: &Ctx<'js>,
        bundle: &Rc<LoadedBundle>,
        asset: &Rc<PreloadedAsset>,
    ) -> Result<Function<'js>> {
        let weak = self.weak.clone();
        let bundle = Rc::clone(bundle);
        let asset = Rc::clone(asset);
        let require = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, specifier: String| -> rquickjs::Result<Value<'js>> {
                let session = weak
                    .upgrade()
                    .ok_or_else(|| Exception::throw_message(&ctx, "loader session dropped"))?;
                session
                    .require_from(&ctx, &bundle, &asset, &specifier)
                    .map_err(|err| throw_load_error(&ctx, err))
            },
        )?;
        Ok(require)
    }

    fn external_require<'js>(
        &self,
        ctx: &Ctx<'js>,
        bundle: &Rc<LoadedBundle>,
        from: &Path,
        context: ExecutionContext,
    ) -> Result<Function<'js>> {
        let weak = self.weak.clone();
        let bundle = Rc::clone(bundle);
        let from = from.to_path_buf();
        let require = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, specifier: String| -> rquickjs::Result<Value<'js>> {
                let session = weak
                    .upgrade()
                    .ok_or_else(|| Exception::throw_message(&ctx, "loader session dropped"))?;
                session
                    .load_external_inner(&ctx, &bundle, &specifier, &from, context)
                    .map_err(|err| throw_load_error(&ctx, err))
            },
        )?;
        Ok(require)
    }

    /// The global loader handle passed to every unit: callable with a
    /// public id, with `meta` and `load` attached.
    fn loader_handle<'js>(
        &self,
        ctx: &Ctx<'js>,
        bundle: &Rc<LoadedBundle>,
    ) -> Result<Function<'js>> {
        let weak = self.weak.clone();
        let target = Rc::clone(bundle);
        let handle = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, public_id: String| -> rquickjs::Result<Value<'js>> {
                let session = weak
                    .upgrade()
                    .ok_or_else(|| Exception::throw_message(&ctx, "loader session dropped"))?;
                session
                    .load_public_inner(&ctx, &target, &public_id)
                    .map_err(|err| throw_load_error(&ctx, err))
            },
        )?;

        let meta = Object::new(ctx.clone())?;
        meta.set("distDir", bundle.meta.dist_dir.to_string_lossy().into_owned())?;
        meta.set("publicUrl", bundle.meta.public_url.clone())?;
        handle.set("meta", meta)?;

        let weak = self.weak.clone();
        let target = Rc::clone(bundle);
        let load = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, name: String| -> rquickjs::Result<()> {
                let session = weak
                    .upgrade()
                    .ok_or_else(|| Exception::throw_message(&ctx, "loader session dropped"))?;
                session
                    .pull_bundle_by_name(&target, &name)
                    .map(|_| ())
                    .map_err(|err| throw_load_error(&ctx, err))
            },
        )?;
        handle.set("load", load)?;

        Ok(handle)
    }
}

/// Handle for loading assets of one loaded bundle.
pub struct BundleHandle {
    session: Rc<LoaderSession>,
    bundle: Rc<LoadedBundle>,
}

impl std::fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleHandle")
            .field("bundle_id", &self.bundle.id)
            .finish_non_exhaustive()
    }
}

impl BundleHandle {
    pub fn bundle_id(&self) -> &str {
        &self.bundle.id
    }

    pub fn meta(&self) -> &BundleMeta {
        &self.bundle.meta
    }

    /// Execute an internal asset (memoized) and return its exports.
    pub fn load(&self, asset_id: &str) -> Result<Exports> {
        let session = &self.session;
        session.sandbox.with(|ctx| {
            let value = session.load_asset(&ctx, &self.bundle, asset_id)?;
            Ok(Exports::from_value(
                session.sandbox.context_handle(),
                &ctx,
                value,
            ))
        })
    }

    /// Resolve a specifier under an explicit execution context and execute
    /// the target (memoized by resolved path + context). The context is
    /// independent of any calling asset; runtime-module loads are not
    /// always triggered from inside an asset's own import callback.
    pub fn load_external(
        &self,
        specifier: &str,
        from: &Path,
        context: ExecutionContext,
    ) -> Result<Exports> {
        let session = &self.session;
        session.sandbox.with(|ctx| {
            let value = session.load_external_inner(&ctx, &self.bundle, specifier, from, context)?;
            Ok(Exports::from_value(
                session.sandbox.context_handle(),
                &ctx,
                value,
            ))
        })
    }

    /// Load an asset by its externally visible identifier; falls back to
    /// pulling in an entire bundle of that name.
    pub fn load_public(&self, public_id: &str) -> Result<Exports> {
        let session = &self.session;
        session.sandbox.with(|ctx| {
            let value = session.load_public_inner(&ctx, &self.bundle, public_id)?;
            Ok(Exports::from_value(
                session.sandbox.context_handle(),
                &ctx,
                value,
            ))
        })
    }

    /// Load another bundle by name and merge its asset table into this
    /// one, without executing anything.
    pub fn load_bundle_by_name(&self, name: &str) -> Result<()> {
        self.session
            .pull_bundle_by_name(&self.bundle, name)
            .map(|_| ())
    }

    /// The frozen resolution decision for one of an asset's specifiers.
    pub fn resolution(&self, asset_id: &str, specifier: &str) -> Option<DependencyResolution> {
        self.bundle
            .asset(asset_id)
            .and_then(|asset| asset.resolutions.get(specifier).cloned())
    }
}
