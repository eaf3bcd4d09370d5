//! Module resolution and loading through the guest boundary.

use marten_runtime::modules::ModuleState;
use marten_runtime::{
    Guest, GuestError, GuestValue, MemoryReader, PackageAlias, Resolved, Runtime, RuntimeConfig, RuntimeError,
};
use marten_test_util::{TestGuest, Value};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

fn runtime(reader: MemoryReader) -> Runtime<TestGuest> {
    Runtime::builder(TestGuest::new())
        .root("/proj")
        .reader(reader)
        .build()
        .unwrap()
}

fn is_not_found(err: &GuestError<Value>) -> bool {
    matches!(err, GuestError::Runtime(RuntimeError::ModuleNotFound { .. }))
}

mod resolution_tests {
    use super::*;

    #[test]
    fn test_relative_require() {
        let reader = MemoryReader::new()
            .with_file("/proj/index.js", "const a = require('./a');")
            .with_file("/proj/a.js", "exports.x = 1;");
        let rt = runtime(reader);
        rt.guest()
            .script("/proj/a.js", |g, scope| scope.export(g, "x", Value::Number(1.0)));
        rt.guest().script("/proj/index.js", |g, scope| {
            let a = scope.require(g, "./a")?;
            scope.export(g, "a", a)
        });

        let exports = rt.load_main(Path::new("index.js")).unwrap();
        assert_eq!(exports.prop("a").prop("x").as_f64(), Some(1.0));
    }

    #[test]
    fn test_missing_module() {
        let rt = runtime(MemoryReader::new().with_file("/proj/index.js", ""));
        let err = rt.loader().require("missing", Path::new("/proj")).unwrap_err();
        assert!(is_not_found(&err));
        assert_eq!(
            err.to_string(),
            "Cannot find module 'missing' from '/proj'"
        );
    }

    #[test]
    fn test_direct_file_wins_over_extension() {
        let reader = MemoryReader::new()
            .with_file("/proj/data", "exact")
            .with_file("/proj/data.js", "with extension");
        let rt = runtime(reader);
        let resolved = rt.loader().resolve("./data", Path::new("/proj")).unwrap();
        assert_eq!(resolved, Resolved::File(PathBuf::from("/proj/data")));
    }

    #[test]
    fn test_explicit_path_does_not_walk() {
        let reader = MemoryReader::new().with_file("/proj/helpers.js", "");
        let rt = runtime(reader);
        let err = rt.loader().require("./helpers", Path::new("/proj/lib")).unwrap_err();
        assert!(is_not_found(&err));
        // a bare name does walk up to the ancestor
        assert!(rt.loader().require("helpers", Path::new("/proj/lib")).is_ok());
    }

    #[test]
    fn test_node_modules_walk() {
        let reader = MemoryReader::new()
            .with_file("/proj/node_modules/left-pad/package.json", r#"{"main": "lib/pad"}"#)
            .with_file("/proj/node_modules/left-pad/lib/pad.js", "");
        let rt = runtime(reader);
        rt.guest().script("/proj/node_modules/left-pad/lib/pad.js", |g, scope| {
            scope.export(g, "name", Value::str("left-pad"))
        });

        let exports = rt
            .loader()
            .require("left-pad", Path::new("/proj/src/deep"))
            .unwrap();
        assert_eq!(exports.prop("name").as_str(), Some("left-pad"));
        assert!(rt.loader().is_cached("/proj/node_modules/left-pad"));
    }

    #[test]
    fn test_package_without_descriptor_uses_index() {
        let reader = MemoryReader::new().with_file("/proj/widgets/index.js", "");
        let rt = runtime(reader);
        let resolved = rt.loader().resolve("./widgets", Path::new("/proj")).unwrap();
        assert_eq!(
            resolved,
            Resolved::Package {
                dir: PathBuf::from("/proj/widgets"),
                entry: PathBuf::from("/proj/widgets/index.js"),
            }
        );
    }

    #[test]
    fn test_package_main_directory_falls_back_to_index() {
        let reader = MemoryReader::new()
            .with_file("/proj/pkg/package.json", r#"{"main": "dist"}"#)
            .with_file("/proj/pkg/dist/index.js", "");
        let rt = runtime(reader);
        let resolved = rt.loader().resolve("./pkg", Path::new("/proj")).unwrap();
        assert_eq!(resolved.key(), "/proj/pkg/dist/index.js");
    }

    #[test]
    fn test_require_resolve() {
        let reader = MemoryReader::new()
            .with_file("/proj/index.js", "")
            .with_file("/proj/lib/b.js", "");
        let rt = runtime(reader);
        let seen = Rc::new(std::cell::RefCell::new(None));
        let sink = seen.clone();
        rt.guest().script("/proj/index.js", move |g, scope| {
            let resolve = g.get(&scope.require, "resolve")?;
            let path = g.call(&resolve, &Value::Undefined, &[Value::str("./lib/b")])?;
            *sink.borrow_mut() = path.as_str().map(str::to_string);
            Ok(())
        });
        rt.load_main(Path::new("index.js")).unwrap();
        assert_eq!(seen.borrow().as_deref(), Some("/proj/lib/b.js"));
        // resolving does not evaluate
        assert_eq!(rt.guest().evaluations("/proj/lib/b.js"), 0);
    }
}

mod caching_tests {
    use super::*;

    #[test]
    fn test_single_evaluation() {
        let reader = MemoryReader::new()
            .with_file("/proj/counter.js", "")
            .with_file("/proj/lib/user.js", "");
        let rt = runtime(reader);
        let first = rt.loader().require("./counter", Path::new("/proj")).unwrap();
        let second = rt.loader().require("../counter.js", Path::new("/proj/lib")).unwrap();
        let third = rt.loader().require("/proj/counter.js", Path::new("/elsewhere")).unwrap();

        assert_eq!(rt.guest().evaluations("/proj/counter.js"), 1);
        assert!(first.same(&second));
        assert!(first.same(&third));
    }

    #[test]
    fn test_circular_require_sees_partial_exports() {
        let reader = MemoryReader::new()
            .with_file("/proj/a.js", "")
            .with_file("/proj/b.js", "");
        let rt = runtime(reader);
        rt.guest().script("/proj/a.js", |g, scope| {
            scope.export(g, "started", Value::Bool(true))?;
            let b = scope.require(g, "./b")?;
            scope.export(g, "b", b)?;
            scope.export(g, "done", Value::Bool(true))
        });
        rt.guest().script("/proj/b.js", |g, scope| {
            let a = scope.require(g, "./a")?;
            scope.export(g, "aStarted", a.prop("started"))?;
            scope.export(g, "aDoneAtRequire", a.prop("done"))?;
            scope.export(g, "a", a)
        });

        let a = rt.loader().require("./a", Path::new("/proj")).unwrap();
        let b = a.prop("b");
        assert_eq!(b.prop("aStarted").as_bool(), Some(true));
        assert!(matches!(b.prop("aDoneAtRequire"), Value::Undefined));
        // b holds the same object, which has since been completed
        assert_eq!(b.prop("a").prop("done").as_bool(), Some(true));
        assert_eq!(rt.guest().evaluations("/proj/a.js"), 1);
        assert_eq!(rt.guest().evaluations("/proj/b.js"), 1);
        assert_eq!(
            rt.loader().record("/proj/a.js").map(|r| r.state()),
            Some(ModuleState::Loaded)
        );
    }

    #[test]
    fn test_module_exports_replacement() {
        let reader = MemoryReader::new().with_file("/proj/fn.js", "");
        let rt = runtime(reader);
        rt.guest().script("/proj/fn.js", |g, scope| {
            let f = g.func("answer", |_g, _this, _args| Ok(Value::Number(42.0)));
            scope.replace_exports(g, f)
        });
        let exports = rt.loader().require("./fn", Path::new("/proj")).unwrap();
        let result = rt.guest().call(&exports, &Value::Undefined, &[]).unwrap();
        assert_eq!(result.as_f64(), Some(42.0));
    }

    #[test]
    fn test_failed_module_is_evicted() {
        let reader = MemoryReader::new().with_file("/proj/flaky.js", "");
        let rt = runtime(reader);
        let attempts = Rc::new(Cell::new(0));
        let counter = attempts.clone();
        rt.guest().script("/proj/flaky.js", move |g, scope| {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                return Err(g.throw("first load fails"));
            }
            scope.export(g, "ok", Value::Bool(true))
        });

        let err = rt.loader().require("./flaky", Path::new("/proj")).unwrap_err();
        assert!(matches!(err, GuestError::Thrown(_)));
        assert!(!rt.loader().is_cached("/proj/flaky.js"));

        let exports = rt.loader().require("./flaky", Path::new("/proj")).unwrap();
        assert_eq!(exports.prop("ok").as_bool(), Some(true));
        assert_eq!(attempts.get(), 2);
    }

    #[test]
    fn test_require_cache_exposes_loaded_modules() {
        let reader = MemoryReader::new()
            .with_file("/proj/index.js", "")
            .with_file("/proj/lib/dep.js", "");
        let rt = runtime(reader);
        rt.guest()
            .script("/proj/lib/dep.js", |g, scope| scope.export(g, "x", Value::Number(7.0)));
        rt.guest().script("/proj/index.js", |g, scope| {
            scope.require(g, "./lib/dep")?;
            let cache = g.get(&scope.require, "cache")?;
            let entry = g.get(&cache, "/proj/lib/dep.js")?;
            let exports = g.get(&entry, "exports")?;
            scope.export(g, "seen", exports.prop("x"))?;
            scope.export(g, "selfLoading", g.get(&cache, "/proj/index.js")?.prop("loaded"))
        });

        let exports = rt.load_main(Path::new("index.js")).unwrap();
        assert_eq!(exports.prop("seen").as_f64(), Some(7.0));
        assert_eq!(exports.prop("selfLoading").as_bool(), Some(false));
    }

    #[test]
    fn test_guest_seeded_cache_entry() {
        let reader = MemoryReader::new().with_file("/proj/index.js", "");
        let rt = runtime(reader);
        rt.guest().script("/proj/index.js", |g, scope| {
            let cache = g.get(&scope.require, "cache")?;
            let module = g.object();
            let exports = g.object();
            g.set(&exports, "virtual", Value::Bool(true))?;
            g.set(&module, "exports", exports)?;
            g.set(&cache, "virtual-dep", module)?;
            let dep = scope.require(g, "virtual-dep")?;
            scope.export(g, "dep", dep)
        });

        let exports = rt.load_main(Path::new("index.js")).unwrap();
        assert_eq!(exports.prop("dep").prop("virtual").as_bool(), Some(true));
        assert!(rt.loader().is_cached("virtual-dep"));
    }

    #[test]
    fn test_clearing_cache_entry_reloads() {
        let reader = MemoryReader::new().with_file("/proj/once.js", "");
        let rt = runtime(reader);
        let first = rt.loader().require("./once", Path::new("/proj")).unwrap();
        rt.guest()
            .set(rt.loader().cache_object(), "/proj/once.js", Value::Undefined)
            .unwrap();

        let second = rt.loader().require("./once", Path::new("/proj")).unwrap();
        assert_eq!(rt.guest().evaluations("/proj/once.js"), 2);
        assert!(!first.same(&second));
    }

    #[test]
    fn test_failed_module_leaves_no_guest_cache_entry() {
        let reader = MemoryReader::new().with_file("/proj/broken.js", "");
        let rt = runtime(reader);
        rt.guest()
            .script("/proj/broken.js", |g, _scope| Err(g.throw("broken")));
        assert!(rt.loader().require("./broken", Path::new("/proj")).is_err());
        let entry = rt
            .guest()
            .get(rt.loader().cache_object(), "/proj/broken.js")
            .unwrap();
        assert!(matches!(entry, Value::Undefined));
    }

    #[test]
    fn test_wrapper_source() {
        let reader = MemoryReader::new().with_file("/proj/src.js", "exports.v = 1;");
        let rt = runtime(reader);
        rt.loader().require("./src", Path::new("/proj")).unwrap();
        let source = rt.guest().last_source("/proj/src.js").unwrap();
        assert!(source.starts_with("(function (exports, require, module, __filename, __dirname, process) {exports.v = 1;"));
        assert!(source.contains("exports.v = 1;"));
    }

    #[test]
    fn test_process_argument() {
        let reader = MemoryReader::new().with_file("/proj/main.js", "");
        let guest = TestGuest::new();
        let process = guest.object();
        guest.set(&process, "pid", Value::Number(1.0)).unwrap();
        let rt = Runtime::builder(guest)
            .root("/proj")
            .reader(reader)
            .builtin("process", process)
            .build()
            .unwrap();
        rt.guest()
            .script("/proj/main.js", |g, scope| scope.export(g, "pid", scope.process.prop("pid")));

        let exports = rt.load_main(Path::new("main.js")).unwrap();
        assert_eq!(exports.prop("pid").as_f64(), Some(1.0));
    }

    #[test]
    fn test_process_argument_without_process() {
        let reader = MemoryReader::new().with_file("/proj/main.js", "");
        let rt = runtime(reader);
        rt.guest().script("/proj/main.js", |g, scope| {
            scope.export(g, "hasProcess", Value::Bool(!matches!(scope.process, Value::Undefined)))?;
            let global = g.global();
            scope.export(g, "globalIsGlobal", Value::Bool(g.get(&global, "global")?.same(&global)))
        });

        let exports = rt.load_main(Path::new("main.js")).unwrap();
        assert_eq!(exports.prop("hasProcess").as_bool(), Some(false));
        assert_eq!(exports.prop("globalIsGlobal").as_bool(), Some(true));
    }
}

mod data_tests {
    use super::*;

    #[test]
    fn test_json_module() {
        let reader = MemoryReader::new().with_file("/proj/config.json", r#"{"port": 8080, "tags": ["a", "b"]}"#);
        let rt = runtime(reader);
        let exports = rt.loader().require("./config.json", Path::new("/proj")).unwrap();
        assert_eq!(exports.prop("port").as_f64(), Some(8080.0));
        assert_eq!(exports.prop("tags").prop("1").as_str(), Some("b"));
        assert_eq!(rt.guest().evaluations("/proj/config.json"), 0);
    }

    #[test]
    fn test_malformed_json_module() {
        let reader = MemoryReader::new().with_file("/proj/broken.json", "{ not json");
        let rt = runtime(reader);
        let err = rt.loader().require("./broken.json", Path::new("/proj")).unwrap_err();
        match err {
            GuestError::Runtime(RuntimeError::ModuleParse { path, .. }) => assert_eq!(path, "/proj/broken.json"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_package_descriptor() {
        let reader = MemoryReader::new()
            .with_file("/proj/pkg/package.json", "{")
            .with_file("/proj/pkg/index.js", "");
        let rt = runtime(reader);
        let err = rt.loader().require("./pkg", Path::new("/proj")).unwrap_err();
        assert!(matches!(err, GuestError::Runtime(RuntimeError::ModuleParse { .. })));
    }
}

mod builtin_tests {
    use super::*;

    #[test]
    fn test_host_builtin() {
        let guest = TestGuest::new();
        let exports = guest.object();
        guest.set(&exports, "kind", Value::str("host")).unwrap();
        let rt = Runtime::builder(guest)
            .root("/proj")
            .reader(MemoryReader::new())
            .builtin("events", exports)
            .build()
            .unwrap();

        let a = rt.require("events").unwrap();
        let b = rt.require("node:events").unwrap();
        assert_eq!(a.prop("kind").as_str(), Some("host"));
        assert!(a.same(&b));
        assert!(rt.loader().is_cached("events"));
    }

    #[test]
    fn test_reserved_builtin_not_installed() {
        let reader = MemoryReader::new().with_file("/proj/node_modules/fs/index.js", "");
        let rt = runtime(reader);
        let err = rt.require("fs").unwrap_err();
        assert!(matches!(err, GuestError::Runtime(RuntimeError::MissingBuiltin(ref name)) if name == "fs"));
    }

    #[test]
    fn test_builtin_package_alias() {
        let mut config = RuntimeConfig::with_root("/proj/app");
        config
            .loader
            .builtin_packages
            .insert("stream".to_string(), PackageAlias::Name("readable-stream".to_string()));
        let reader = MemoryReader::new()
            .with_file("/proj/node_modules/readable-stream/package.json", r#"{"main": "readable.js"}"#)
            .with_file("/proj/node_modules/readable-stream/readable.js", "");
        let rt = Runtime::builder(TestGuest::new())
            .config(config)
            .reader(reader)
            .build()
            .unwrap();
        rt.guest()
            .script("/proj/node_modules/readable-stream/readable.js", |g, scope| {
                scope.export(g, "polyfill", Value::Bool(true))
            });

        let exports = rt.require("stream").unwrap();
        assert_eq!(exports.prop("polyfill").as_bool(), Some(true));
        rt.require("stream").unwrap();
        assert_eq!(
            rt.guest().evaluations("/proj/node_modules/readable-stream/readable.js"),
            1
        );
        assert!(rt.loader().is_cached("stream"));
    }

    #[test]
    fn test_builtin_from_factory() {
        let rt = Runtime::builder(TestGuest::new())
            .reader(MemoryReader::new())
            .builtin_with("os", |rt| {
                let exports = rt.guest().object();
                rt.guest().set(&exports, "EOL", Value::str("\n"))?;
                Ok(exports)
            })
            .build()
            .unwrap();
        assert_eq!(rt.require("os").unwrap().prop("EOL").as_str(), Some("\n"));
    }
}

mod filesystem_tests {
    use super::*;

    #[test]
    fn test_fs_reader_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("node_modules/greet")).unwrap();
        std::fs::write(root.join("node_modules/greet/index.js"), "module.exports = 'hi';").unwrap();
        std::fs::write(root.join("main.js"), "require('greet');").unwrap();

        let rt = Runtime::builder(TestGuest::new()).root(root).build().unwrap();
        let main = root.join("main.js").to_string_lossy().into_owned();
        rt.guest().script(&main, |g, scope| {
            let greet = scope.require(g, "greet")?;
            scope.export(g, "greet", greet)
        });
        let greet_key = root.join("node_modules/greet/index.js").to_string_lossy().into_owned();
        rt.guest().script(&greet_key, |g, scope| scope.replace_exports(g, Value::str("hi")));

        let exports = rt.load_main(Path::new("main.js")).unwrap();
        assert_eq!(exports.prop("greet").as_str(), Some("hi"));
    }
}
