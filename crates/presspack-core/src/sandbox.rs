//! Execution sandbox around an embedded QuickJS engine.
//!
//! Compiled asset source is script text, not native code, so execution is
//! an explicit host boundary: source text goes in together with a binding
//! table (exports, local import callback, module record, path strings, the
//! global loader handle) and an opaque exports value comes out. The loader
//! owns caching and ordering; this module only compiles, calls, and
//! translates errors across the boundary.

use rquickjs::{Context, Ctx, Exception, Function, Persistent, Runtime, Value};
use std::path::Path;

use crate::errors::{LoadError, Result};

/// Embedded script engine shared by every module in one loader session.
pub struct Sandbox {
    _runtime: Runtime,
    context: Context,
}

impl Sandbox {
    pub fn new() -> Result<Self> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;
        Ok(Self {
            _runtime: runtime,
            context,
        })
    }

    /// Run a closure against the engine context.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Ctx<'_>) -> R,
    {
        self.context.with(f)
    }

    pub(crate) fn context_handle(&self) -> Context {
        self.context.clone()
    }

    /// Evaluate an expression and return its value as JSON. Intended for
    /// embedder diagnostics and tests; module loading never goes through
    /// here.
    pub fn eval_json(&self, source: &str) -> Result<serde_json::Value> {
        self.context.with(|ctx| {
            let value: Value = ctx.eval(source.as_bytes().to_vec()).map_err(|err| {
                LoadError::Execution {
                    path: Path::new("<eval>").to_path_buf(),
                    message: engine_message(&ctx, err),
                }
            })?;
            value_to_json(&ctx, value)
        })
    }
}

/// Compile source text into a callable unit with the loader's injected
/// bindings. The `sourceURL` tag keeps engine stack traces pointing at the
/// original file.
pub(crate) fn compile_unit<'js>(
    ctx: &Ctx<'js>,
    source: &str,
    path: &Path,
) -> rquickjs::Result<Function<'js>> {
    let wrapper = format!(
        "(function(exports, require, module, __dirname, __filename, presspackRequire) {{\n{}\n}})\n//# sourceURL={}",
        source,
        path.display()
    );
    ctx.eval(wrapper)
}

/// Extract a readable message from an engine error, draining the pending
/// exception when there is one.
pub(crate) fn engine_message(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    match err {
        rquickjs::Error::Exception => {
            let caught = ctx.catch();
            caught
                .as_object()
                .and_then(|obj| obj.get::<_, String>("message").ok())
                .unwrap_or_else(|| "uncaught exception".to_string())
        }
        other => other.to_string(),
    }
}

/// Re-throw a loader error into the engine so script code observes it as a
/// normal exception.
pub(crate) fn throw_load_error(ctx: &Ctx<'_>, err: LoadError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}

pub(crate) fn value_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value> {
    match ctx.json_stringify(value)? {
        Some(text) => {
            let text = text.to_string()?;
            serde_json::from_str(&text).map_err(|err| LoadError::Engine(err.to_string()))
        }
        None => Ok(serde_json::Value::Null),
    }
}

/// Handle to a loaded module's exports value, usable after the engine
/// scope that produced it has ended.
pub struct Exports {
    context: Context,
    value: Persistent<Value<'static>>,
}

impl Clone for Exports {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            value: self.value.clone(),
        }
    }
}

impl std::fmt::Debug for Exports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exports").finish_non_exhaustive()
    }
}

impl Exports {
    pub(crate) fn from_value<'js>(context: Context, ctx: &Ctx<'js>, value: Value<'js>) -> Self {
        Self {
            context,
            value: Persistent::save(ctx, value),
        }
    }

    /// Run a closure against the live exports value.
    pub fn with<R>(&self, f: impl for<'js> FnOnce(&Ctx<'js>, &Value<'js>) -> Result<R>) -> Result<R> {
        self.context.with(|ctx| {
            let value = self.value.clone().restore(&ctx)?;
            f(&ctx, &value)
        })
    }

    /// Whether the exports object has the named property.
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.with(|_ctx, value| match value.as_object() {
            Some(object) => Ok(object.contains_key(key)?),
            None => Ok(false),
        })
    }

    /// A named export converted to JSON, or `None` when absent.
    pub fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.with(|ctx, value| {
            let Some(object) = value.as_object() else {
                return Ok(None);
            };
            if !object.contains_key(key)? {
                return Ok(None);
            }
            let member: Value = object.get(key)?;
            value_to_json(ctx, member).map(Some)
        })
    }

    /// The whole exports value converted to JSON.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        self.with(|ctx, value| value_to_json(ctx, value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::Object;
    use serde_json::json;

    #[test]
    fn test_eval_json() {
        let sandbox = Sandbox::new().unwrap();
        let value = sandbox.eval_json("({answer: 40 + 2})").unwrap();
        assert_eq!(value, json!({"answer": 42}));
    }

    #[test]
    fn test_compiled_unit_populates_exports() {
        let sandbox = Sandbox::new().unwrap();
        sandbox.with(|ctx| {
            let unit = compile_unit(
                &ctx,
                "exports.x = 40 + 2; exports.file = __filename;",
                Path::new("/app/m.js"),
            )
            .unwrap();

            let exports = Object::new(ctx.clone()).unwrap();
            let module = Object::new(ctx.clone()).unwrap();
            module.set("exports", exports.clone()).unwrap();
            let noop = Function::new(ctx.clone(), || ()).unwrap();

            let _: Value = unit
                .call((
                    exports.clone(),
                    noop.clone(),
                    module,
                    "/app",
                    "/app/m.js",
                    noop,
                ))
                .unwrap();

            let x: i32 = exports.get("x").unwrap();
            let file: String = exports.get("file").unwrap();
            assert_eq!(x, 42);
            assert_eq!(file, "/app/m.js");
        });
    }

    #[test]
    fn test_engine_message_extracts_thrown_error() {
        let sandbox = Sandbox::new().unwrap();
        sandbox.with(|ctx| {
            let unit =
                compile_unit(&ctx, "throw new Error('boom');", Path::new("/app/bad.js")).unwrap();

            let exports = Object::new(ctx.clone()).unwrap();
            let module = Object::new(ctx.clone()).unwrap();
            module.set("exports", exports.clone()).unwrap();
            let noop = Function::new(ctx.clone(), || ()).unwrap();

            let err = unit
                .call::<_, Value>((exports, noop.clone(), module, "/app", "/app/bad.js", noop))
                .unwrap_err();

            assert_eq!(engine_message(&ctx, err), "boom");
        });
    }

    #[test]
    fn test_compile_error_is_reported() {
        let sandbox = Sandbox::new().unwrap();
        sandbox.with(|ctx| {
            let result = compile_unit(&ctx, "function {", Path::new("/app/bad.js"));
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_exports_handle_survives_scope() {
        let sandbox = Sandbox::new().unwrap();
        let exports = sandbox.with(|ctx| {
            let value: Value = ctx.eval(b"({greeting: 'hello'})".to_vec()).unwrap();
            Exports::from_value(sandbox.context_handle(), &ctx, value)
        });

        assert!(exports.contains("greeting").unwrap());
        assert_eq!(
            exports.get_json("greeting").unwrap(),
            Some(json!("hello"))
        );
        assert_eq!(exports.get_json("missing").unwrap(), None);
        assert_eq!(exports.to_json().unwrap(), json!({"greeting": "hello"}));
    }
}
