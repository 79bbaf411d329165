// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025 Datadog, Inc.

use crate::profiler::common::ProfilerError;
use deno_core::v8;
use std::sync::{Arc, Mutex, PoisonError};

/// Tracks executions on a [`v8::Isolate`] and terminates any that push the isolate's heap up to its
/// configured limit.
#[derive(Debug)]
pub(crate) struct HeapLimitWatchdog {
    /// This will be `Some` if there was a termination. Otherwise, it will be `None`.
    termination_err: Arc<Mutex<Option<ProfilerError>>>,
    isolate_handle: v8::IsolateHandle,
}

impl HeapLimitWatchdog {
    /// Registers a near-heap-limit callback on `runtime` and returns a watchdog that reports the
    /// terminations it causes.
    pub fn install(runtime: &mut deno_core::JsRuntime) -> Self {
        let termination_err = Arc::new(Mutex::new(None));
        let isolate_handle = runtime.v8_isolate().thread_safe_handle();

        let state = Arc::clone(&termination_err);
        let handle = isolate_handle.clone();
        runtime.add_near_heap_limit_callback(move |current_limit, initial_limit| {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_none() {
                tracing::debug!(current_limit, initial_limit, "profiling runtime reached its heap limit");
                *state = Some(ProfilerError::OutOfMemory);
            }
            drop(state);
            handle.terminate_execution();
            // The isolate needs headroom to unwind the terminated frames. The session is
            // abandoned afterwards, so the raised limit is never used for new work.
            current_limit * 2
        });

        Self {
            termination_err,
            isolate_handle,
        }
    }

    /// Executes the provided closure, returning an error instead of its result if the isolate's
    /// heap limit was reached while it ran.
    pub fn execute<F, T, S>(&self, scope: &mut S, f: F) -> Result<T, ProfilerError>
    where
        F: FnOnce(&mut S) -> T,
        S: AsMut<v8::Isolate>,
    {
        // Request to cancel any in-progress terminations. If there is not one
        // (i.e. `v8::IsolateHandle::is_execution_terminating()` is false), this is a no-op.
        self.isolate_handle.cancel_terminate_execution();

        let execution_result = f(scope);

        let termination_err = self
            .termination_err
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match termination_err {
            None => Ok(execution_result),
            Some(e) => Err(e),
        }
    }
}
