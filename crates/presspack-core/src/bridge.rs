//! Session-wide bridge from public asset identifiers to loader calls.
//!
//! Public ids are stable externally visible names, distinct from internal
//! asset ids. Every bundle registers its assets here as it loads, so a
//! later `presspackRequire(publicId)` from a different bundle can find the
//! owning bundle without re-walking the graph.

use rustc_hash::FxHashMap;
use std::cell::RefCell;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BridgeEntry {
    pub bundle_id: String,
    pub asset_id: String,
}

#[derive(Default)]
pub(crate) struct PublicIdBridge {
    entries: RefCell<FxHashMap<String, BridgeEntry>>,
}

impl PublicIdBridge {
    /// Register a public id. First writer wins; duplicate registrations
    /// are assumed content-identical and ignored.
    pub fn register(&self, public_id: String, bundle_id: String, asset_id: String) {
        self.entries.borrow_mut().entry(public_id).or_insert(BridgeEntry {
            bundle_id,
            asset_id,
        });
    }

    pub fn lookup(&self, public_id: &str) -> Option<BridgeEntry> {
        self.entries.borrow().get(public_id).cloned()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}
