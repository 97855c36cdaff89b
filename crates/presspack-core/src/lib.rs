pub mod bridge;
pub mod cache;
pub mod config;
pub mod errors;
pub mod graph;
pub mod loader;
pub mod preload;
pub mod resolver;
pub mod sandbox;

pub use cache::ModuleKey;
pub use config::LoaderConfig;
pub use errors::{LoadError, Result};
pub use graph::{
    Asset, Bundle, BundleBehavior, BundleGraph, BundleNode, Dependency, DependencyResolution,
    ExecutionContext, InlinePackager,
};
pub use loader::{BundleHandle, BundleMeta, LoaderSession};
pub use resolver::{Resolved, SpecifierKind, SpecifierResolver};
pub use sandbox::{Exports, Sandbox};
