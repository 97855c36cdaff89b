//! Identity-keyed caches scoped to one loader session.
//!
//! The module identity cache memoizes instantiated modules by
//! (file path, execution context): the same file loaded under different
//! contexts is two independent modules, since conditional resolution can
//! pick different dependency targets per context. Records are inserted
//! *before* the module body runs so circular references resolve to the
//! partially populated exports instead of recursing.

use rquickjs::{Ctx, Object, Persistent};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::errors::Result;
use crate::graph::ExecutionContext;

/// Identity key for one instantiated module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub path: PathBuf,
    pub context: ExecutionContext,
}

impl ModuleKey {
    pub fn new(path: PathBuf, context: ExecutionContext) -> Self {
        Self { path, context }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path.display(), self.context)
    }
}

/// Memoized module records, keyed by identity.
///
/// Stores the sandboxed `module` object rather than its exports value, so
/// a `module.exports =` reassignment during execution is observed by every
/// later lookup, exactly as during re-entrant (circular) loads.
#[derive(Default)]
pub(crate) struct ModuleCache {
    entries: RefCell<FxHashMap<ModuleKey, Persistent<Object<'static>>>>,
}

impl ModuleCache {
    pub fn get<'js>(&self, ctx: &Ctx<'js>, key: &ModuleKey) -> Result<Option<Object<'js>>> {
        let entries = self.entries.borrow();
        match entries.get(key) {
            Some(record) => Ok(Some(record.clone().restore(ctx)?)),
            None => Ok(None),
        }
    }

    /// Insert a record. Must happen before the module body executes.
    pub fn insert<'js>(&self, ctx: &Ctx<'js>, key: ModuleKey, module: &Object<'js>) {
        let record = Persistent::save(ctx, module.clone());
        self.entries.borrow_mut().insert(key, record);
    }

    /// Evict a record whose execution failed, so a later request for the
    /// same identity re-runs instead of observing a partial exports
    /// object.
    pub fn remove(&self, key: &ModuleKey) {
        if self.entries.borrow_mut().remove(key).is_some() {
            debug!(key = %key, "evicted failed module record");
        }
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

/// Packaged contents of inline sub-bundles, keyed by bundle id.
///
/// Shared across every bundle load in the session so the external
/// packaging collaborator runs at most once per sub-bundle.
#[derive(Default)]
pub(crate) struct InlineBundleCache {
    entries: RefCell<FxHashMap<String, Arc<String>>>,
}

impl InlineBundleCache {
    pub fn get(&self, bundle_id: &str) -> Option<Arc<String>> {
        self.entries.borrow().get(bundle_id).cloned()
    }

    pub fn insert(&self, bundle_id: String, contents: Arc<String>) {
        self.entries.borrow_mut().insert(bundle_id, contents);
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn test_context() -> (Runtime, Context) {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        (runtime, context)
    }

    #[test]
    fn test_same_record_returned_for_same_key() {
        let (_runtime, context) = test_context();
        let cache = ModuleCache::default();
        let key = ModuleKey::new(PathBuf::from("/app/a.js"), ExecutionContext::Client);

        context.with(|ctx| {
            let module = Object::new(ctx.clone()).unwrap();
            cache.insert(&ctx, key.clone(), &module);
            module.set("stamp", 7).unwrap();

            let restored = cache.get(&ctx, &key).unwrap().unwrap();
            let stamp: i32 = restored.get("stamp").unwrap();
            assert_eq!(stamp, 7);
        });
    }

    #[test]
    fn test_context_tag_separates_identities() {
        let (_runtime, context) = test_context();
        let cache = ModuleCache::default();
        let client = ModuleKey::new(PathBuf::from("/app/a.js"), ExecutionContext::Client);
        let server = ModuleKey::new(PathBuf::from("/app/a.js"), ExecutionContext::Server);

        context.with(|ctx| {
            let module = Object::new(ctx.clone()).unwrap();
            cache.insert(&ctx, client.clone(), &module);

            assert!(cache.get(&ctx, &client).unwrap().is_some());
            assert!(cache.get(&ctx, &server).unwrap().is_none());
        });
    }

    #[test]
    fn test_remove_and_clear() {
        let (_runtime, context) = test_context();
        let cache = ModuleCache::default();
        let key = ModuleKey::new(PathBuf::from("/app/a.js"), ExecutionContext::Client);

        context.with(|ctx| {
            let module = Object::new(ctx.clone()).unwrap();
            cache.insert(&ctx, key.clone(), &module);
            assert_eq!(cache.len(), 1);

            cache.remove(&key);
            assert_eq!(cache.len(), 0);
            assert!(cache.get(&ctx, &key).unwrap().is_none());

            cache.insert(&ctx, key.clone(), &module);
            cache.clear();
            assert_eq!(cache.len(), 0);
        });
    }

    #[test]
    fn test_module_key_display() {
        let key = ModuleKey::new(PathBuf::from("/app/a.js"), ExecutionContext::Server);
        assert_eq!(key.to_string(), "/app/a.js#server");
    }

    #[test]
    fn test_inline_cache_round_trip() {
        let cache = InlineBundleCache::default();
        assert!(cache.get("ib").is_none());

        cache.insert("ib".to_string(), Arc::new("module.exports = 1;".to_string()));
        assert_eq!(&**cache.get("ib").unwrap(), "module.exports = 1;");

        cache.clear();
        assert!(cache.get("ib").is_none());
    }
}
