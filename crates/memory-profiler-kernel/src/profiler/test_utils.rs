// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::profiler::common::v8_string;
use crate::profiler::v8_platform::{Initialized, V8Platform};
use crate::target::{GcThing, ManagedHeap, ObjectRef, TargetValue};
use deno_core::v8;
use deno_core::v8::HandleScope;

/// Returns the v8 platform shared by every unit test.
pub fn cfg_test_v8() -> V8Platform<Initialized> {
    static V8_PLATFORM_INIT: std::sync::Once = std::sync::Once::new();

    V8_PLATFORM_INIT.call_once(|| {
        // When running with PKU support, only the thread that initialized the v8 platform (or that thread's
        // spawned children) can access the v8 isolates. This is problematic in `cargo` unit tests because there is
        // currently no way that we can guarantee that the main thread will be the first to initialize v8.
        // In order to get around this, we can use the "unprotected" v8 platform.
        let platform = v8::new_unprotected_default_platform(0, false);
        let shared_platform = platform.make_shared();
        deno_core::JsRuntime::init_platform(Some(shared_platform));
    });

    V8Platform::<Initialized>(std::marker::PhantomData)
}

/// Compiles and runs `code`, returning the completion value or the stringified exception.
pub(crate) fn try_execute<'s>(
    scope: &mut HandleScope<'s>,
    code: &str,
) -> Result<v8::Local<'s, v8::Value>, String> {
    let tc_scope = &mut v8::TryCatch::new(scope);
    let code = v8_string(tc_scope, code);
    let script = v8::Script::compile(tc_scope, code, None).unwrap();
    script.run(tc_scope).ok_or_else(|| {
        let exception = tc_scope.exception().unwrap().to_rust_string_lossy(tc_scope);
        tc_scope.reset();
        exception
    })
}

/// A target heap shaped like a small page: a `Window` global rooted by the engine, holding a
/// `document` and a `helper` function, both with the global as parent.
pub(crate) struct SampleHeap {
    pub heap: ManagedHeap,
    /// `{ "g": global, "doc": document, "label": "not an object" }`
    pub named: ObjectRef,
}

pub(crate) fn sample_heap() -> SampleHeap {
    use crate::target::FunctionMetadata;

    let heap = ManagedHeap::new();
    let global = heap.alloc_object("Window");
    let object_proto = heap.alloc_object("Object");
    let document = heap.alloc_object("HTMLDocument");
    let helper = heap.alloc_function(FunctionMetadata {
        function_size: 64,
        script_size: 1024,
        name: Some(heap.new_string("helper")),
        filename: Some("page.js".to_string()),
        line_start: 3,
        line_extent: 4,
    });
    heap.set_prototype(document, Some(object_proto));
    heap.set_parent(document, Some(global));
    heap.set_parent(helper, Some(global));
    heap.set_property(global, "document", TargetValue::Object(document));
    heap.set_property(global, "helper", TargetValue::Object(helper));
    heap.set_property(document, "title", TargetValue::String(heap.new_string("Example")));
    heap.set_property(document, "ready", TargetValue::Boolean(true));
    heap.add_root(GcThing::Object(global));

    let named = heap.alloc_object("Object");
    heap.set_property(named, "g", TargetValue::Object(global));
    heap.set_property(named, "doc", TargetValue::Object(document));
    heap.set_property(named, "label", TargetValue::String(heap.new_string("not an object")));

    SampleHeap {
        heap,
        named,
    }
}
