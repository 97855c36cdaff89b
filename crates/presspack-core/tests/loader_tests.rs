use indoc::indoc;
use presspack_core::{DependencyResolution, LoadError, LoaderConfig, LoaderSession};
use presspack_test_helpers::init_test_logging;
use presspack_test_helpers::mocks::{
    CountingInlinePackager, MockAsset, MockBundleGraph, MockBundleSpec, MockDependency,
};
use presspack_core::ExecutionContext::{Client, Server};
use serde_json::json;
use std::rc::Rc;
use std::sync::Arc;

fn session(graph: MockBundleGraph) -> Rc<LoaderSession> {
    session_with_packager(graph, CountingInlinePackager::new())
}

fn session_with_packager(
    graph: MockBundleGraph,
    packager: CountingInlinePackager,
) -> Rc<LoaderSession> {
    init_test_logging();
    LoaderSession::new(LoaderConfig::default(), Arc::new(graph), Arc::new(packager)).unwrap()
}

#[test]
fn test_loading_same_asset_twice_executes_once() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new(
        "a",
        "/app/a.js",
        Client,
        indoc! {r#"
            globalThis.__aRuns = (globalThis.__aRuns || 0) + 1;
            exports.runs = globalThis.__aRuns;
        "#},
    ));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("a"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    let first = handle.load("a").unwrap();
    let second = handle.load("a").unwrap();

    assert_eq!(first.get_json("runs").unwrap(), Some(json!(1)));
    assert_eq!(second.get_json("runs").unwrap(), Some(json!(1)));
}

#[test]
fn test_repeat_load_returns_same_exports_reference() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("a", "/app/a.js", Client, "exports.x = 1;"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("a"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    let first = handle.load("a").unwrap();
    let second = handle.load("a").unwrap();

    // A mutation through one handle is visible through the other: both
    // wrap the same live object, not copies.
    first
        .with(|_ctx, value| {
            value.as_object().unwrap().set("marker", 7)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(second.get_json("marker").unwrap(), Some(json!(7)));
}

#[test]
fn test_require_of_internal_asset() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("m", "/app/m.js", Client, "exports.value = 'm';"));
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        "exports.default = require('./m.js').value;",
    ));
    graph.add_dependency("e", MockDependency::to_asset("d1", "./m.js", "m"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e").asset("m"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("default").unwrap(), Some(json!("m")));
}

#[test]
fn test_placeholder_aliases_the_specifier() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("m", "/app/m.js", Client, "exports.value = 'm';"));
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        "exports.default = require('ph1').value;",
    ));
    graph.add_dependency(
        "e",
        MockDependency::to_asset("d1", "./m.js", "m").with_placeholder("ph1"),
    );
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e").asset("m"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("default").unwrap(), Some(json!("m")));
    assert_eq!(
        handle.resolution("e", "ph1").unwrap(),
        DependencyResolution::Asset("m".to_string())
    );
}

#[test]
fn test_same_file_under_both_contexts_is_two_modules() {
    let counter = indoc! {r#"
        globalThis.__n = (globalThis.__n || 0) + 1;
        exports.stamp = globalThis.__n;
    "#};
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("fc", "/app/f.js", Client, counter));
    graph.add_asset(MockAsset::new("fs", "/app/f.js", Server, counter));
    let bundle = graph.add_bundle(
        MockBundleSpec::new("b1", "main.js")
            .entry("fc")
            .asset("fs"),
    );

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    let client = handle.load("fc").unwrap();
    let server = handle.load("fs").unwrap();

    // Same path, different execution context: two independent records.
    assert_eq!(client.get_json("stamp").unwrap(), Some(json!(1)));
    assert_eq!(server.get_json("stamp").unwrap(), Some(json!(2)));

    // And each later lookup still returns its own record.
    assert_eq!(handle.load("fc").unwrap().get_json("stamp").unwrap(), Some(json!(1)));
    assert_eq!(handle.load("fs").unwrap().get_json("stamp").unwrap(), Some(json!(2)));
}

#[test]
fn test_circular_references_resolve_to_partial_exports() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new(
        "a",
        "/app/a.js",
        Client,
        indoc! {r#"
            exports.before = true;
            const b = require('./b.js');
            exports.fromB = b.value;
            exports.value = 'A';
        "#},
    ));
    graph.add_asset(MockAsset::new(
        "b",
        "/app/b.js",
        Client,
        indoc! {r#"
            const a = require('./a.js');
            exports.sawPartial = a.before === true && a.value === undefined;
            exports.value = 'B';
        "#},
    ));
    graph.add_dependency("a", MockDependency::to_asset("d1", "./b.js", "b"));
    graph.add_dependency("b", MockDependency::to_asset("d2", "./a.js", "a"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("a").asset("b"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    let a = handle.load("a").unwrap();
    assert_eq!(a.get_json("fromB").unwrap(), Some(json!("B")));
    assert_eq!(a.get_json("value").unwrap(), Some(json!("A")));

    // B re-entered A mid-execution and observed the partial exports.
    let b = handle.load("b").unwrap();
    assert_eq!(b.get_json("sawPartial").unwrap(), Some(json!(true)));
}

#[test]
fn test_skipped_dependency_resolves_to_empty_object() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        "exports.empty = Object.keys(require('./side-effect.js')).length === 0;",
    ));
    graph.add_dependency("e", MockDependency::skipped("d1", "./side-effect.js"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("empty").unwrap(), Some(json!(true)));
}

#[test]
fn test_non_script_asset_resolution_is_skipped() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("css", "/app/style.css", Client, "").with_kind("css"));
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        "exports.empty = Object.keys(require('./style.css')).length === 0;",
    ));
    graph.add_dependency("e", MockDependency::to_asset("d1", "./style.css", "css"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("empty").unwrap(), Some(json!(true)));
    assert_eq!(
        handle.resolution("e", "./style.css").unwrap(),
        DependencyResolution::Skipped
    );
}

#[test]
fn test_inline_bundle_packaged_exactly_once() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("ie", "/app/widget.js", Client, ""));
    graph.add_bundle(MockBundleSpec::new("ib", "widget").inline().entry("ie"));

    graph.add_asset(MockAsset::new(
        "x",
        "/app/x.js",
        Client,
        "exports.answer = require('widget-ref').answer;",
    ));
    graph.add_asset(MockAsset::new(
        "y",
        "/app/y.js",
        Client,
        "exports.answer = require('widget-ref').answer;",
    ));
    graph.add_dependency("x", MockDependency::inline("dx", "widget-ref", "ib"));
    graph.add_dependency("y", MockDependency::inline("dy", "widget-ref", "ib"));
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        "exports.sum = require('./x.js').answer + require('./y.js').answer;",
    ));
    graph.add_dependency("e", MockDependency::to_asset("d1", "./x.js", "x"));
    graph.add_dependency("e", MockDependency::to_asset("d2", "./y.js", "y"));
    let bundle = graph.add_bundle(
        MockBundleSpec::new("b1", "main.js")
            .entry("e")
            .assets(["x", "y"]),
    );

    let packager = Arc::new(
        CountingInlinePackager::new().with_contents("ib", r#"{"answer": 21}"#),
    );
    init_test_logging();
    let session = LoaderSession::new(
        LoaderConfig::default(),
        Arc::new(graph),
        Arc::clone(&packager) as Arc<dyn presspack_core::InlinePackager>,
    )
    .unwrap();

    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("sum").unwrap(), Some(json!(42)));
    assert_eq!(packager.calls(), 1);
    assert_eq!(packager.calls_for("ib"), 1);
}

#[test]
fn test_resolution_decisions_are_stable_across_loads() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("m", "/app/m.js", Client, "exports.value = 'm';"));
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        "exports.default = require('./m.js').value;",
    ));
    graph.add_dependency("e", MockDependency::to_asset("d1", "./m.js", "m"));
    graph.add_dependency("e", MockDependency::external("d2", "widgets"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e").asset("m"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    let before_internal = handle.resolution("e", "./m.js").unwrap();
    let before_external = handle.resolution("e", "widgets").unwrap();

    handle.load("e").unwrap();
    handle.load("e").unwrap();

    assert_eq!(handle.resolution("e", "./m.js").unwrap(), before_internal);
    assert_eq!(handle.resolution("e", "widgets").unwrap(), before_external);
    assert_eq!(before_internal, DependencyResolution::Asset("m".to_string()));
    assert_eq!(
        before_external,
        DependencyResolution::External("widgets".to_string())
    );
}

#[test]
fn test_failed_execution_is_evicted_and_reruns() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new(
        "bad",
        "/app/bad.js",
        Client,
        indoc! {r#"
            globalThis.__fails = (globalThis.__fails || 0) + 1;
            throw new Error('boom ' + globalThis.__fails);
        "#},
    ));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("bad"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    let first = handle.load("bad").unwrap_err();
    assert!(matches!(first, LoadError::Execution { .. }));
    assert!(first.to_string().contains("boom 1"));

    // The failed record was evicted: the body runs again instead of a
    // stale half-populated exports object being served.
    let second = handle.load("bad").unwrap_err();
    assert!(second.to_string().contains("boom 2"));
}

#[test]
fn test_invalidate_clears_every_cache() {
    let mut graph = MockBundleGraph::new();
    let asset = graph.add_asset(MockAsset::new(
        "a",
        "/app/a.js",
        Client,
        indoc! {r#"
            globalThis.__aRuns = (globalThis.__aRuns || 0) + 1;
            exports.runs = globalThis.__aRuns;
        "#},
    ));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("a"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    assert_eq!(handle.load("a").unwrap().get_json("runs").unwrap(), Some(json!(1)));
    assert_eq!(asset.fetch_count(), 1);

    session.invalidate();

    // The bundle must be preloaded again and the module re-executed.
    let handle = session.load_bundle(&*bundle).unwrap();
    assert_eq!(handle.load("a").unwrap().get_json("runs").unwrap(), Some(json!(2)));
    assert_eq!(asset.fetch_count(), 2);
}

#[test]
fn test_loader_handle_exposes_target_meta() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        indoc! {r#"
            exports.distDir = presspackRequire.meta.distDir;
            exports.publicUrl = presspackRequire.meta.publicUrl;
        "#},
    ));
    let bundle = graph.add_bundle(
        MockBundleSpec::new("b1", "main.js")
            .entry("e")
            .public_url("https://site.example/")
            .dist_dir("/out"),
    );

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("distDir").unwrap(), Some(json!("/out")));
    assert_eq!(
        exports.get_json("publicUrl").unwrap(),
        Some(json!("https://site.example/"))
    );
    assert_eq!(handle.meta().public_url, "https://site.example/");
}

#[test]
fn test_public_load_within_one_bundle() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("m", "/app/m.js", Client, "exports.value = 'm';"));
    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        "exports.viaPublic = presspackRequire('pubM').value;",
    ));
    graph.set_public_id("m", "pubM");
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e").asset("m"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("viaPublic").unwrap(), Some(json!("m")));
}

#[test]
fn test_public_load_across_loaded_bundles() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("m", "/app/m.js", Client, "exports.value = 'm';"));
    graph.set_public_id("m", "pubM");
    let first = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("m"));

    graph.add_asset(MockAsset::new(
        "e2",
        "/app/e2.js",
        Client,
        "exports.viaPublic = presspackRequire('pubM').value;",
    ));
    let second = graph.add_bundle(MockBundleSpec::new("b2", "other.js").entry("e2"));

    let session = session(graph);
    session.load_bundle(&*first).unwrap();
    let handle = session.load_bundle(&*second).unwrap();
    let exports = handle.load("e2").unwrap();

    // 'pubM' is not in b2's table; the session-wide bridge finds it in b1.
    assert_eq!(exports.get_json("viaPublic").unwrap(), Some(json!("m")));
}

#[test]
fn test_lazy_bundle_pull_from_script() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("z", "/app/z.js", Client, "exports.value = 'z';"));
    graph.set_public_id("z", "pubZ");
    graph.add_bundle(MockBundleSpec::new("b2", "second.js").entry("z"));

    graph.add_asset(MockAsset::new(
        "e",
        "/app/e.js",
        Client,
        indoc! {r#"
            presspackRequire.load('second.js');
            exports.z = presspackRequire('pubZ').value;
        "#},
    ));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();
    let exports = handle.load("e").unwrap();

    assert_eq!(exports.get_json("z").unwrap(), Some(json!("z")));
}

#[test]
fn test_load_public_falls_back_to_bundle_name() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("z", "/app/z.js", Client, "exports.value = 'z';"));
    graph.add_bundle(MockBundleSpec::new("b2", "second.js").entry("z"));

    graph.add_asset(MockAsset::new("e", "/app/e.js", Client, "exports.ok = true;"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    // The identifier names a bundle: it is pulled in, merged, and its
    // entry executed.
    let exports = handle.load_public("second.js").unwrap();
    assert_eq!(exports.get_json("value").unwrap(), Some(json!("z")));
}

#[test]
fn test_shared_asset_executes_once_across_bundles() {
    let counter = indoc! {r#"
        globalThis.__shared = (globalThis.__shared || 0) + 1;
        exports.runs = globalThis.__shared;
    "#};
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("shared", "/app/shared.js", Client, counter));
    graph.add_asset(MockAsset::new(
        "z",
        "/app/z.js",
        Client,
        "exports.runs = require('./shared.js').runs;",
    ));
    graph.add_dependency("z", MockDependency::to_asset("d1", "./shared.js", "shared"));
    let first = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("shared"));
    graph.add_bundle(
        MockBundleSpec::new("b2", "second.js")
            .entry("z")
            .asset("shared"),
    );

    let session = session(graph);
    let handle = session.load_bundle(&*first).unwrap();
    assert_eq!(handle.load("shared").unwrap().get_json("runs").unwrap(), Some(json!(1)));

    handle.load_bundle_by_name("second.js").unwrap();
    let z = handle.load("z").unwrap();

    // Identity caching is per (path, context): the merged bundle's copy
    // short-circuits to the already-executed record.
    assert_eq!(z.get_json("runs").unwrap(), Some(json!(1)));
}

#[test]
fn test_unknown_names_error() {
    let mut graph = MockBundleGraph::new();
    graph.add_asset(MockAsset::new("e", "/app/e.js", Client, "exports.ok = true;"));
    let bundle = graph.add_bundle(MockBundleSpec::new("b1", "main.js").entry("e"));

    let session = session(graph);
    let handle = session.load_bundle(&*bundle).unwrap();

    assert!(matches!(
        handle.load("ghost").unwrap_err(),
        LoadError::UnknownAsset { .. }
    ));
    assert!(matches!(
        handle.load_bundle_by_name("nope").unwrap_err(),
        LoadError::UnknownBundle { .. }
    ));
    assert!(matches!(
        handle.load_public("nope").unwrap_err(),
        LoadError::UnknownBundle { .. }
    ));
}
