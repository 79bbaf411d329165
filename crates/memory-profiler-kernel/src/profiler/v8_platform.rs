// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::model::profile::{ProfileRequest, ProfileResult, ProfilerOptions};
use crate::profiler::common::ProfilerError;
use crate::profiler::runtime::IsolatedRuntime;
use crate::profiler::session::profile_memory;
use crate::target::TargetRuntime;
use deno_core::v8;
use std::sync::Arc;

/// A ZWT used to indicate that a [`V8Platform`] has not been initialized.
#[derive(Debug, Copy, Clone)]
pub struct Uninitialized;
/// A ZWT used to indicate that a [`V8Platform`] has been initialized.
#[derive(Debug, Copy, Clone)]
pub struct Initialized;

/// An instance of the v8 platform.
#[derive(Debug, Copy, Clone)]
pub struct V8Platform<T>(pub(crate) std::marker::PhantomData<T>);

impl V8Platform<Uninitialized> {
    /// Creates a new uninitialized [`V8Platform`].
    fn new() -> Self {
        V8Platform::<Uninitialized>(std::marker::PhantomData)
    }

    /// Creates a v8 platform with the provided `thread_pool_size` and initializes it.
    fn initialize(self, thread_pool_size: u32) -> V8Platform<Initialized> {
        let platform = v8::new_default_platform(thread_pool_size, false);
        let shared_platform = platform.make_shared();
        deno_core::JsRuntime::init_platform(Some(shared_platform));

        V8Platform::<Initialized>(std::marker::PhantomData)
    }
}

impl V8Platform<Initialized> {
    /// Creates a profiling runtime whose heap is limited to `heap_budget_bytes`.
    pub fn try_new_runtime(&self, heap_budget_bytes: usize) -> Result<IsolatedRuntime, ProfilerError> {
        IsolatedRuntime::start(heap_budget_bytes)
    }

    /// Runs one profiling session against `target`. See [`profile_memory`].
    pub fn profile(
        &self,
        target: Arc<dyn TargetRuntime>,
        request: ProfileRequest,
        options: &ProfilerOptions,
    ) -> Result<ProfileResult, ProfilerError> {
        profile_memory(target, request, options)
    }

    /// Creates a plain `deno_core` runtime, used to host a script whose heap is then profiled.
    pub fn new_target_runtime(&self) -> deno_core::JsRuntime {
        deno_core::JsRuntime::new(Default::default())
    }
}

/// Initializes the process's v8 platform with the provided thread pool size. If zero is provided,
/// a suitable number based on the number of processors currently online will be used.
///
/// Returns `Some` if v8 was successfully initialized for the first time, or `None` if v8 has already been initialized.
///
/// # Caveats
/// This should only be called from the parent thread of all child threads that will access v8.
/// (e.g. the main thread). If this is not done, on modern Linux systems running on hardware
/// supporting [Memory Protection Keys], a segfault will trigger when attempting to use v8.
///
/// [Memory Protection Keys]: https://docs.kernel.org/core-api/protection-keys.html
pub fn initialize_v8(thread_pool_size: u32) -> Option<V8Platform<Initialized>> {
    use std::sync::atomic::{AtomicBool, Ordering};
    static V8_PLATFORM_INIT: AtomicBool = AtomicBool::new(false);

    match V8_PLATFORM_INIT.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed) {
        Err(_) => None,
        Ok(_) => {
            let uninit = V8Platform::<Uninitialized>::new();
            Some(uninit.initialize(thread_pool_size))
        }
    }
}
