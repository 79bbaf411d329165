// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::model::profile::ProfileResult;
use crate::profiler::builtins::{self, SessionSlot, SessionState};
use crate::profiler::common::{v8_interned, v8_string, ProfilerError};
use crate::profiler::mirror::{MirrorStorage, StringMirror};
use crate::profiler::resource_watchdog::HeapLimitWatchdog;
use crate::target::{Enumeration, ObjectRef, TargetRuntime, TargetString};
use deno_core::v8;
use deno_core::v8::HandleScope;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// A `deno_core` runtime dedicated to running one profiling script against a target runtime.
///
/// Tear-down happens in reverse order of construction: the session (sockets, identities, the
/// mirrors' root), then the context, then the isolate, and finally the storage that external
/// string mirrors point into.
pub struct IsolatedRuntime {
    session: SessionSlot,
    context: Option<v8::Global<v8::Context>>,
    watchdog: HeapLimitWatchdog,
    runtime: deno_core::JsRuntime,
    /// Declared after `runtime` so that it is dropped after the isolate.
    retained_storage: MirrorStorage,
}

/// Creates a `deno_core` runtime whose v8 heap is limited to `heap_budget_bytes`.
pub(crate) fn new_budgeted_runtime(
    heap_budget_bytes: usize,
) -> Result<deno_core::JsRuntime, ProfilerError> {
    let options = deno_core::RuntimeOptions {
        create_params: Some(v8::CreateParams::default().heap_limits(0, heap_budget_bytes)),
        ..Default::default()
    };
    deno_core::JsRuntime::try_new(options).map_err(|err| {
        tracing::debug!(%err, heap_budget_bytes, "unable to create the profiling runtime");
        ProfilerError::OutOfMemory
    })
}

impl IsolatedRuntime {
    /// Creates the runtime and installs the builtin functions into its global object.
    pub fn start(heap_budget_bytes: usize) -> Result<Self, ProfilerError> {
        let mut runtime = new_budgeted_runtime(heap_budget_bytes)?;
        let watchdog = HeapLimitWatchdog::install(&mut runtime);
        let session: SessionSlot = Rc::new(RefCell::new(None));
        runtime.v8_isolate().set_slot(Rc::clone(&session));
        let context = runtime.main_context();
        {
            let scope = &mut runtime.handle_scope();
            watchdog.execute(scope, |sc| builtins::install(sc))??;
        }
        Ok(Self {
            session,
            context: Some(context),
            watchdog,
            runtime,
            retained_storage: MirrorStorage::default(),
        })
    }

    /// Creates the string mirror and attaches a new session for `target` to the runtime.
    pub(crate) fn attach_session(
        &mut self,
        target: Arc<dyn TargetRuntime>,
        named_objects: Option<ObjectRef>,
        default_enumeration: Enumeration,
    ) -> Result<(), ProfilerError> {
        let mut slot = self
            .session
            .try_borrow_mut()
            .map_err(|_| ProfilerError::InvalidState("session is in use"))?;
        if slot.is_some() {
            return Err(ProfilerError::InvalidState("a session is already attached"));
        }
        let scope = &mut self.runtime.handle_scope();
        let mirror = self.watchdog.execute(scope, |sc| StringMirror::new(sc))?;
        *slot = Some(SessionState::new(
            target,
            mirror,
            named_objects,
            default_enumeration,
        ));
        Ok(())
    }

    /// Runs `f` against the attached session.
    pub(crate) fn with_session<T>(
        &self,
        f: impl FnOnce(&mut SessionState) -> T,
    ) -> Result<T, ProfilerError> {
        let mut slot = self
            .session
            .try_borrow_mut()
            .map_err(|_| ProfilerError::InvalidState("session is in use"))?;
        let state = slot
            .as_mut()
            .ok_or(ProfilerError::InvalidState("no session is attached"))?;
        Ok(f(state))
    }

    /// Evaluates `script` once and converts its completion value.
    ///
    /// Before evaluation, the global `argument` is set to the mirror of `argument` (or `null`).
    pub fn evaluate(
        &mut self,
        script: &str,
        filename: &str,
        start_line: u32,
        argument: Option<&TargetString>,
    ) -> Result<ProfileResult, ProfilerError> {
        let scope = &mut self.runtime.handle_scope();
        let argument: v8::Local<v8::Value> = match argument {
            Some(argument) => {
                let mut slot = self
                    .session
                    .try_borrow_mut()
                    .map_err(|_| ProfilerError::InvalidState("session is in use"))?;
                let state = slot
                    .as_mut()
                    .ok_or(ProfilerError::InvalidState("no session is attached"))?;
                state.mirror.mirror(scope, argument)?.into()
            }
            None => v8::null(scope).into(),
        };
        let global = scope.get_current_context().global(scope);
        let key = v8_interned(scope, "argument");
        global
            .set(scope, key.into(), argument)
            .ok_or(ProfilerError::OutOfMemory)?;

        let tc_scope = &mut v8::TryCatch::new(scope);
        let outcome = self.watchdog.execute(tc_scope, |sc| {
            run_script(sc, script, filename, start_line).map(|value| convert_result(sc, value))
        })?;
        match outcome {
            Ok(result) => Ok(result),
            Err(failure) => {
                self.watchdog
                    .execute(tc_scope, |sc| report_failure(sc, failure))?;
                Err(ProfilerError::ProfilingFailed)
            }
        }
    }
}

impl Drop for IsolatedRuntime {
    fn drop(&mut self) {
        let state = match self.session.try_borrow_mut() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(state) = state {
            self.retained_storage = state.release();
        }
        drop(self.context.take());
        // `runtime` and then `retained_storage` are dropped in field order.
    }
}

/// A script exception, captured before the `TryCatch` that caught it is reset.
struct CaughtFailure<'s> {
    exception: Option<v8::Local<'s, v8::Value>>,
    traceback: Option<v8::Local<'s, v8::Value>>,
}

fn compile<'s>(
    scope: &mut HandleScope<'s>,
    source: &str,
    filename: &str,
    start_line: u32,
) -> Option<v8::Local<'s, v8::Script>> {
    let code = v8::String::new(scope, source)?;
    let name = v8_string(scope, filename);
    let line_offset = i32::try_from(start_line.saturating_sub(1)).unwrap_or(i32::MAX);
    let origin = v8::ScriptOrigin::new(
        scope,
        name.into(),
        line_offset,
        0,
        false,
        0,
        None,
        false,
        false,
        false,
        None,
    );
    v8::Script::compile(scope, code, Some(&origin))
}

/// Compiles and runs `source` as a classic script. If it does not compile, it is retried as the
/// body of a function called with the global `this`, which allows a top-level `return`.
fn run_script<'s>(
    scope: &mut v8::TryCatch<'_, HandleScope<'s>>,
    source: &str,
    filename: &str,
    start_line: u32,
) -> Result<v8::Local<'s, v8::Value>, CaughtFailure<'s>> {
    let script = match compile(scope, source, filename, start_line) {
        Some(script) => script,
        None => {
            let original = caught(scope);
            scope.reset();
            let wrapped = format!("(function () {{{}\n}}).call(this);", source);
            match compile(scope, &wrapped, filename, start_line) {
                Some(script) => script,
                None => {
                    scope.reset();
                    return Err(original);
                }
            }
        }
    };
    script.run(scope).ok_or_else(|| caught(scope))
}

fn caught<'s>(scope: &mut v8::TryCatch<'_, HandleScope<'s>>) -> CaughtFailure<'s> {
    CaughtFailure {
        exception: scope.exception(),
        traceback: scope.stack_trace(),
    }
}

/// Copies a completion value out of the runtime. Strings are deep-copied, and gc-managed values
/// other than strings become [`ProfileResult::Undefined`].
fn convert_result(scope: &mut HandleScope, value: v8::Local<v8::Value>) -> ProfileResult {
    if value.is_string() {
        ProfileResult::String(value.to_rust_string_lossy(scope))
    } else if value.is_int32() {
        ProfileResult::Integer(value.int32_value(scope).unwrap_or_default())
    } else if value.is_number() {
        ProfileResult::Number(value.number_value(scope).unwrap_or(f64::NAN))
    } else if value.is_boolean() {
        ProfileResult::Boolean(value.is_true())
    } else if value.is_null() {
        ProfileResult::Null
    } else {
        ProfileResult::Undefined
    }
}

/// Publishes a script failure through the error hook: sets `lastException` and
/// `lastExceptionTraceback`, then calls `handleError` if the script defined one.
fn report_failure<'s>(scope: &mut v8::TryCatch<'_, HandleScope<'s>>, failure: CaughtFailure<'s>) {
    scope.reset();
    let global = scope.get_current_context().global(scope);
    let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();
    let exception = failure.exception.unwrap_or(undefined);
    let traceback = failure.traceback.unwrap_or(undefined);

    tracing::debug!(
        exception = %exception.to_rust_string_lossy(scope),
        traceback = %traceback.to_rust_string_lossy(scope),
        "profiling script failed"
    );

    let key = v8_interned(scope, "lastException");
    global.set(scope, key.into(), exception);
    let key = v8_interned(scope, "lastExceptionTraceback");
    global.set(scope, key.into(), traceback);

    let key = v8_interned(scope, "handleError");
    let handler = global
        .get(scope, key.into())
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());
    if let Some(handler) = handler {
        if handler.call(scope, global.into(), &[]).is_none() {
            tracing::debug!("handleError threw");
        }
        scope.reset();
    }
}
