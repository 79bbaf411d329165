// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use kernel::profiler::v8_platform::{initialize_v8, Initialized, V8Platform};
use std::sync::OnceLock;
mod memory_profiler;

pub(crate) static V8_PLATFORM: OnceLock<V8Platform<Initialized>> = OnceLock::new();

fn main() {
    // NOTE: v8 must be initialized by the thread that later creates every isolate. Both the
    // target runtime and the profiling runtime run on this thread.
    let v8 = initialize_v8(0).expect("v8 should only be initialized once");
    V8_PLATFORM.set(v8).expect("cell should have been unset");

    memory_profiler::start();
}
