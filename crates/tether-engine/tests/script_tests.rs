//! Script, template and execution control tests
//!
//! Tests cover:
//! - Function and object templates
//! - Unbound scripts and code caches
//! - Script error reporting
//! - Termination and host-thrown exceptions
//! - Microtasks, heap statistics and configuration files

use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tether_engine::{
    CachedData, CompileMode, CompileOptions, Context, ContextOptions, Error, FunctionTemplate,
    HandleState, Isolate, ObjectTemplate, PropertyAttribute, RuntimeConfig, SimEngine,
};

// =============================================================================
// TEMPLATES
// =============================================================================

#[test]
fn test_function_template_properties() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let ctx = Context::new(&iso);

    let tmpl = FunctionTemplate::new(&iso, |_| None);
    tmpl.set("arity", 2, PropertyAttribute::NONE);
    tmpl.set("label", "adder", PropertyAttribute::READ_ONLY);

    let f = tmpl.get_function(&ctx).unwrap();
    assert!(f.is_function());
    let obj = f.into_object();
    assert_eq!(obj.get("arity").unwrap().as_number(), Some(2.0));
    assert_eq!(obj.get("label").unwrap().to_string(), "adder");

    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
}

#[test]
fn test_object_template_instances() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let ctx = Context::new(&iso);

    let method = FunctionTemplate::new(&iso, |info| Some(info.context().new_value("called")));
    let tmpl = ObjectTemplate::new(&iso);
    tmpl.set("version", 2, PropertyAttribute::READ_ONLY | PropertyAttribute::DONT_DELETE);
    tmpl.set("name", "tether", PropertyAttribute::NONE);
    tmpl.set("hello", &method, PropertyAttribute::NONE);
    tmpl.set_internal_field_count(3);
    assert_eq!(tmpl.internal_field_count(), 3);

    let a = tmpl.new_instance(&ctx).unwrap();
    let b = tmpl.new_instance(&ctx).unwrap();
    ctx.global().set("a", &a).unwrap();
    ctx.global().set("b", &b).unwrap();

    let result = ctx.run_script("a.name = 'changed'; b.name", "instances.js").unwrap();
    assert_eq!(result.to_string(), "tether");
    let result = ctx.run_script("a.version = 9; a.version", "readonly.js").unwrap();
    assert_eq!(result.as_number(), Some(2.0));
    let result = ctx.run_script("b.hello()", "method.js").unwrap();
    assert_eq!(result.to_string(), "called");

    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
}

#[test]
fn test_global_template_shapes_the_context() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());

    let tmpl = ObjectTemplate::new(&iso);
    tmpl.set("answer", 42, PropertyAttribute::NONE);
    let ctx = Context::with_options(
        &iso,
        ContextOptions {
            global_template: Some(&tmpl),
        },
    );

    let answer = ctx.run_script("answer", "global.js").unwrap();
    assert_eq!(answer.as_number(), Some(42.0));

    ctx.close();
    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
}

// =============================================================================
// UNBOUND SCRIPTS
// =============================================================================

#[test]
fn test_unbound_script_runs_in_several_contexts() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let first = Context::new(&iso);
    let second = Context::new(&iso);

    first.run_script("x = 'first'", "setup.js").unwrap();
    second.run_script("x = 'second'", "setup.js").unwrap();

    let script = iso
        .compile_unbound_script("x", "read.js", CompileOptions::default())
        .unwrap();
    assert!(!script.cached_data_rejected());
    assert_eq!(script.run(&first).unwrap().to_string(), "first");
    assert_eq!(script.run(&second).unwrap().to_string(), "second");
    assert_eq!(iso.script_count(), 1);

    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
}

#[test]
fn test_code_cache_is_accepted_for_the_same_source() {
    let iso = Isolate::new(SimEngine::new());

    let source = "cached = { hits: 1 }";
    let script = iso
        .compile_unbound_script(source, "cache.js", CompileOptions::default())
        .unwrap();
    let cache = script.create_code_cache();
    assert!(!cache.bytes.is_empty());

    let reused = iso
        .compile_unbound_script(
            source,
            "cache.js",
            CompileOptions {
                cached_data: Some(cache.clone()),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!reused.cached_data_rejected());

    let other = iso
        .compile_unbound_script(
            "cached = 2",
            "cache.js",
            CompileOptions {
                cached_data: Some(cache),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(other.cached_data_rejected());

    let garbage = iso
        .compile_unbound_script(
            source,
            "cache.js",
            CompileOptions {
                cached_data: Some(CachedData {
                    bytes: vec![0xde, 0xad],
                }),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(garbage.cached_data_rejected());

    iso.dispose();
}

#[test]
fn test_cached_data_with_eager_mode_is_rejected() {
    let iso = Isolate::new(SimEngine::new());
    let err = iso
        .compile_unbound_script(
            "1",
            "eager.js",
            CompileOptions {
                cached_data: Some(CachedData { bytes: Vec::new() }),
                mode: CompileMode::Eager,
            },
        )
        .unwrap_err();

    match err {
        Error::InvalidArgument(msg) => {
            assert_eq!(msg, "compile mode and cached data cannot both be set")
        }
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    assert_eq!(iso.script_count(), 0);
    iso.dispose();
}

#[test]
fn test_compile_reports_syntax_errors() {
    let iso = Isolate::new(SimEngine::new());
    let err = iso
        .compile_unbound_script("a = ", "broken.js", CompileOptions::default())
        .unwrap_err();

    let script_err = err.as_script_error().unwrap();
    assert!(script_err.message.starts_with("SyntaxError"));
    assert!(script_err.location.starts_with("broken.js:1:"));
    iso.dispose();
}

// =============================================================================
// SCRIPT ERRORS
// =============================================================================

#[test]
fn test_reference_error_has_location_and_stack() {
    let iso = Isolate::new(SimEngine::new());
    let ctx = Context::new(&iso);

    let err = ctx.run_script("a = 1;\n  missing", "ref.js").unwrap_err();
    let script_err = err.as_script_error().unwrap();
    assert_eq!(script_err.message, "ReferenceError: missing is not defined");
    assert_eq!(script_err.location, "ref.js:2:3");
    assert_eq!(
        format!("{:#}", script_err),
        "ReferenceError: missing is not defined\n    at ref.js:2:3"
    );
    assert_eq!(
        err.to_string(),
        "ReferenceError: missing is not defined (ref.js:2:3)"
    );
    iso.dispose();
}

#[test]
fn test_type_errors() {
    let iso = Isolate::new(SimEngine::new());
    let ctx = Context::new(&iso);

    let err = ctx.run_script("n = 1; n()", "call.js").unwrap_err();
    assert_eq!(
        err.as_script_error().unwrap().message,
        "TypeError: n is not a function"
    );

    let err = ctx.run_script("nothing = undefined; nothing.x", "read.js").unwrap_err();
    assert_eq!(
        err.as_script_error().unwrap().message,
        "TypeError: Cannot read properties of undefined (reading 'x')"
    );
    iso.dispose();
}

#[test]
fn test_thrown_values_become_script_errors() {
    let iso = Isolate::new(SimEngine::new());
    let ctx = Context::new(&iso);

    let err = ctx.run_script("throw 'custom failure'", "throw.js").unwrap_err();
    let script_err = err.as_script_error().unwrap();
    assert_eq!(script_err.message, "custom failure");
    assert_eq!(script_err.location, "throw.js:1:1");

    // the context is still usable afterwards
    assert_eq!(ctx.run_script("1", "ok.js").unwrap().as_number(), Some(1.0));
    iso.dispose();
}

// =============================================================================
// TERMINATION AND EXCEPTIONS
// =============================================================================

#[test]
fn test_terminate_from_callback_stops_the_script() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let ctx = Context::new(&iso);

    let after_calls = Arc::new(AtomicUsize::new(0));
    let stop = FunctionTemplate::new(&iso, |info| {
        info.isolate().terminate_execution();
        assert!(info.isolate().is_execution_terminating());
        None
    });
    let counter = Arc::clone(&after_calls);
    let after = FunctionTemplate::new(&iso, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        None
    });
    ctx.global().set("stop", &stop.get_function(&ctx).unwrap()).unwrap();
    ctx.global().set("after", &after.get_function(&ctx).unwrap()).unwrap();

    let err = ctx.run_script("stop(); after()", "terminate.js").unwrap_err();
    assert!(err
        .as_script_error()
        .unwrap()
        .message
        .starts_with("ExecutionTerminated"));
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    assert!(!iso.is_execution_terminating());

    // termination does not outlive the script it stopped
    ctx.run_script("after()", "resume.js").unwrap();
    assert_eq!(after_calls.load(Ordering::SeqCst), 1);

    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
}

#[test]
fn test_terminate_handle_after_dispose_is_ignored() {
    let iso = Isolate::new(SimEngine::new());
    let handle = iso.terminate_handle();
    iso.dispose();
    assert!(!handle.terminate());
}

#[test]
fn test_host_thrown_exception_propagates() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let ctx = Context::new(&iso);

    let fail = FunctionTemplate::new(&iso, |info| {
        let exception = info.context().new_value("boom");
        info.isolate().throw_exception(&exception);
        None
    });
    ctx.global().set("fail", &fail.get_function(&ctx).unwrap()).unwrap();

    let err = ctx.run_script("fail(); 1", "fail.js").unwrap_err();
    assert_eq!(err.as_script_error().unwrap().message, "boom");

    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
    assert_eq!(engine.double_frees(), 0);
}

// =============================================================================
// MICROTASKS
// =============================================================================

#[test]
fn test_microtasks_run_at_checkpoint() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let ctx = Context::new(&iso);

    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let tick = FunctionTemplate::new(&iso, move |_| {
        sink.lock().push("tick".to_string());
        None
    });
    ctx.global().set("tick", &tick.get_function(&ctx).unwrap()).unwrap();

    ctx.run_script("queueMicrotask(tick); queueMicrotask(tick)", "queue.js")
        .unwrap();
    assert!(log.lock().is_empty());

    ctx.perform_microtask_checkpoint();
    assert_eq!(*log.lock(), vec!["tick", "tick"]);

    ctx.perform_microtask_checkpoint();
    assert_eq!(log.lock().len(), 2);

    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
}

#[test]
fn test_queue_microtask_requires_a_function() {
    let iso = Isolate::new(SimEngine::new());
    let ctx = Context::new(&iso);
    let err = ctx.run_script("queueMicrotask(1)", "bad.js").unwrap_err();
    assert!(err
        .as_script_error()
        .unwrap()
        .message
        .starts_with("TypeError"));
    iso.dispose();
}

// =============================================================================
// HEAP STATISTICS AND RELEASE
// =============================================================================

#[test]
fn test_heap_statistics_follow_contexts() {
    let iso = Isolate::new(SimEngine::new());
    let before = iso.heap_statistics();
    assert!(before.heap_size_limit > 0);
    assert!(before.total_heap_size >= before.used_heap_size);

    let ctx = Context::new(&iso);
    ctx.run_script("a = { b: { c: 1 } }", "heap.js").unwrap();
    let after = iso.heap_statistics();
    assert_eq!(
        after.number_of_native_contexts,
        before.number_of_native_contexts + 1
    );
    assert!(after.used_heap_size > before.used_heap_size);

    iso.dispose();
}

#[test]
fn test_batch_mark_releasable() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let ctx = Context::new(&iso);

    let values: Vec<_> = (0..8).map(|i| ctx.new_value(i)).collect();
    let raws: Vec<_> = values.iter().map(|v| v.raw()).collect();
    let releasable_before = iso.handle_stats().releasable;

    iso.batch_mark_releasable(values.into_iter().chain([iso.null()]));
    assert_eq!(iso.handle_stats().releasable, releasable_before + 8);
    for &raw in &raws {
        assert_eq!(iso.handle_state(raw), Some(HandleState::Releasable));
    }

    assert_eq!(iso.flush_releasable(), releasable_before + 8);
    for &raw in &raws {
        assert!(!engine.is_record_live(raw));
    }
    assert!(iso.null().is_null());

    iso.dispose();
    assert_eq!(engine.double_frees(), 0);
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[test]
fn test_config_file_drives_isolate_options() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[isolate]").unwrap();
    writeln!(file, "flush_on_exit = true").unwrap();
    writeln!(file, "release_batch_size = 16").unwrap();
    writeln!(file, "[sweeper]").unwrap();
    writeln!(file, "interval_ms = 25").unwrap();

    let config = RuntimeConfig::from_file(file.path()).unwrap();
    assert!(config.isolate.flush_on_exit);
    assert!(!config.isolate.trace_memory);
    assert_eq!(config.isolate.release_batch_size, 16);
    assert_eq!(config.sweeper.interval_ms, 25);

    let engine = SimEngine::new();
    let iso = Isolate::with_options(engine.clone(), config.isolate);
    let ctx = Context::new(&iso);
    drop(ctx.run_script("o = { a: 1 }", "config.js").unwrap());
    assert_eq!(iso.handle_stats().releasable, 1);

    // leaving the next host call flushes the dropped result
    let n = ctx.new_value(1);
    assert_eq!(iso.handle_stats().releasable, 0);
    drop(n);
    assert_eq!(iso.flush_releasable(), 1);

    iso.dispose();
    assert_eq!(engine.live_allocations(), 0);
}

#[test]
fn test_config_file_with_unknown_keys_is_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[isolate]").unwrap();
    writeln!(file, "flush_everything = true").unwrap();

    let err = RuntimeConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_missing_config_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RuntimeConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}
