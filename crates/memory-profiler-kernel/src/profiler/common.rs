// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::target::TargetError;
use deno_core::v8;
use deno_core::v8::HandleScope;

/// An error that ends a profiling session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfilerError {
    #[error("Out of memory.")]
    OutOfMemory,
    #[error("Multi-threaded memory profiling is currently unsupported.")]
    ConcurrentTargetExecution,
    /// The profiling script failed. The script's own error is deliberately not carried.
    #[error("Profiling failed.")]
    ProfilingFailed,
    #[error("invalid profiling session state: {0}")]
    InvalidState(&'static str),
}

/// An error raised by a builtin function. It is thrown into the profiling script at the call site,
/// and the session stays usable.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Argument must be an object ID or name.")]
    InvalidTarget,
    #[error("{0}")]
    InvalidArgument(&'static str),
    #[error("{0}")]
    Introspection(#[from] TargetError),
    #[error("ServerSocket method called on non-ServerSocket object.")]
    NotASocket,
    #[error("{0}")]
    Socket(&'static str),
    #[error("The profiler session is not available.")]
    SessionUnavailable,
    #[error("Out of memory.")]
    OutOfMemory,
}

impl ScriptError {
    fn is_type_error(&self) -> bool {
        matches!(
            self,
            ScriptError::InvalidTarget | ScriptError::InvalidArgument(_) | ScriptError::NotASocket
        )
    }
}

impl From<ProfilerError> for ScriptError {
    fn from(value: ProfilerError) -> Self {
        match value {
            ProfilerError::OutOfMemory => ScriptError::OutOfMemory,
            _ => ScriptError::SessionUnavailable,
        }
    }
}

/// Throws `error` into the script currently calling into Rust.
pub fn throw_script_error(scope: &mut HandleScope, error: &ScriptError) {
    let message = v8_string(scope, &error.to_string());
    let exception = if error.is_type_error() {
        v8::Exception::type_error(scope, message)
    } else {
        v8::Exception::error(scope, message)
    };
    scope.throw_exception(exception);
}

/// Creates a [`Internalized`](v8::string::NewStringType::Internalized) v8 string. There is
/// extra runtime cost to this.
///
/// # Panics
/// Panics if `str` is longer than the v8 string length limit.
pub fn v8_interned<'s>(scope: &mut HandleScope<'s>, str: &str) -> v8::Local<'s, v8::String> {
    v8::String::new_from_one_byte(scope, str.as_bytes(), v8::NewStringType::Internalized)
        .expect("str length should be less than v8 limit")
}

/// Creates a [`Normal`](v8::string::NewStringType::Normal) v8 string from UTF-8, which always
/// allocates memory to create the string.
///
/// # Panics
/// Panics if `str` is longer than the v8 string length limit.
pub fn v8_string<'s>(scope: &mut HandleScope<'s>, str: &str) -> v8::Local<'s, v8::String> {
    v8::String::new_from_utf8(scope, str.as_bytes(), v8::NewStringType::Normal)
        .expect("str length should be less than v8 limit")
}

/// Defines `value` as an own data property of `object`. Unlike [`v8::Object::set`], this never
/// reaches a setter on the prototype chain, so it cannot run script.
pub fn define_property(
    scope: &mut HandleScope,
    object: v8::Local<v8::Object>,
    key: v8::Local<v8::Name>,
    value: v8::Local<v8::Value>,
) -> Option<()> {
    object
        .create_data_property(scope, key, value)
        .filter(|defined| *defined)
        .map(|_| ())
}

/// [`define_property`] for an array index.
pub fn define_index(
    scope: &mut HandleScope,
    object: v8::Local<v8::Object>,
    index: u32,
    value: v8::Local<v8::Value>,
) -> Option<()> {
    let key = v8_string(scope, &index.to_string());
    define_property(scope, object, key.into(), value)
}

/// A shorthand for creating a [`v8::Integer`].
pub fn v8_uint<'s>(scope: &mut HandleScope<'s>, number: u32) -> v8::Local<'s, v8::Integer> {
    v8::Integer::new_from_unsigned(scope, number)
}
