// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

//! The seam between the profiler and the runtime being profiled.
//!
//! A profiling session never owns the target. It only holds opaque [`ObjectRef`] handles into it
//! and asks the [`TargetRuntime`] to trace, describe, and look up properties on its behalf.

pub mod fixture;
pub mod managed_heap;
pub mod monitor;
pub mod v8_snapshot;

pub use managed_heap::ManagedHeap;
pub use monitor::{ActiveFrame, ExecutionMonitor};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// An opaque handle to a gc-managed object living in a target runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(pub(crate) u32);

impl ObjectRef {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A string owned by a target runtime.
///
/// The code units are stored the way a JS engine stores them: one byte per unit when every
/// character is Latin-1, UTF-16 otherwise. Cloning a `TargetString` shares its storage. Two
/// `TargetString`s are the "same string" only if they share storage; equal contents are not enough.
#[derive(Debug, Clone)]
pub struct TargetString(pub(crate) StringStorage);

/// The code units backing a [`TargetString`].
#[derive(Debug, Clone)]
pub(crate) enum StringStorage {
    Latin1(Arc<[u8]>),
    TwoByte(Arc<[u16]>),
}

impl TargetString {
    pub fn new(value: &str) -> Self {
        let latin1: Option<Vec<u8>> = value.chars().map(|c| u8::try_from(c).ok()).collect();
        match latin1 {
            Some(bytes) => Self(StringStorage::Latin1(Arc::from(bytes))),
            None => Self(StringStorage::TwoByte(value.encode_utf16().collect())),
        }
    }

    /// Decodes the string. Unpaired surrogates are replaced.
    pub fn to_rust_string(&self) -> String {
        match &self.0 {
            StringStorage::Latin1(bytes) => bytes.iter().map(|&b| char::from(b)).collect(),
            StringStorage::TwoByte(units) => String::from_utf16_lossy(units),
        }
    }

    /// The number of UTF-16 code units.
    pub fn len(&self) -> usize {
        match &self.0 {
            StringStorage::Latin1(bytes) => bytes.len(),
            StringStorage::TwoByte(units) => units.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if both handles point to the same backing storage.
    pub fn same_storage(&self, other: &TargetString) -> bool {
        self.storage_addr() == other.storage_addr()
    }

    /// The address of the backing storage, usable as an identity key while the storage is alive.
    pub(crate) fn storage_addr(&self) -> usize {
        match &self.0 {
            StringStorage::Latin1(bytes) => Arc::as_ptr(bytes) as *const u8 as usize,
            StringStorage::TwoByte(units) => Arc::as_ptr(units) as *const u16 as usize,
        }
    }

    pub(crate) fn storage(&self) -> &StringStorage {
        &self.0
    }
}

impl Display for TargetString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_rust_string())
    }
}

/// A node visited by a heap trace. Only [`GcThing::Object`] nodes carry identity.
#[derive(Debug, Clone)]
pub enum GcThing {
    Object(ObjectRef),
    String(TargetString),
    Double(f64),
}

/// A value stored in a property slot of a target object.
#[derive(Debug, Clone)]
pub enum TargetValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(TargetString),
    Object(ObjectRef),
}

impl TargetValue {
    /// The gc-thing this value keeps alive, if any.
    pub fn as_gc_thing(&self) -> Option<GcThing> {
        match self {
            TargetValue::String(s) => Some(GcThing::String(s.clone())),
            TargetValue::Object(obj) => Some(GcThing::Object(*obj)),
            _ => None,
        }
    }
}

/// The key of a property: either a name or an integer index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    Name(String),
    Index(u32),
}

impl Display for PropertyKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyKey::Name(name) => f.write_str(name),
            PropertyKey::Index(idx) => write!(f, "{}", idx),
        }
    }
}

/// Canonical array indices (`"0"`, `"42"`, but not `"042"`) become [`PropertyKey::Index`].
impl From<&str> for PropertyKey {
    fn from(value: &str) -> Self {
        match value.parse::<u32>() {
            Ok(idx) if idx.to_string() == value => PropertyKey::Index(idx),
            _ => PropertyKey::Name(value.to_string()),
        }
    }
}

impl From<u32> for PropertyKey {
    fn from(value: u32) -> Self {
        PropertyKey::Index(value)
    }
}

/// The result of a property lookup that does not run script.
#[derive(Debug, Clone)]
pub enum PropertyLookup {
    /// Neither the object nor its prototype chain has the property.
    Missing,
    /// A data property holding the value.
    Value(TargetValue),
    /// An accessor property. Its getter was not invoked.
    Accessor,
}

/// Metadata about a function object and the script that defines it.
#[derive(Debug, Clone)]
pub struct FunctionMetadata {
    pub function_size: usize,
    pub script_size: usize,
    pub name: Option<TargetString>,
    pub filename: Option<String>,
    pub line_start: u32,
    pub line_extent: u32,
}

impl FunctionMetadata {
    /// The last source line of the function (inclusive).
    pub fn line_end(&self) -> u32 {
        self.line_start.saturating_add(self.line_extent).saturating_sub(1)
    }
}

/// The objects an extended (proxy-capable) object delegates to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedRefs {
    pub wrapped: Option<ObjectRef>,
    pub outer: Option<ObjectRef>,
    pub inner: Option<ObjectRef>,
}

/// Strategy used to enumerate the properties of an object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Enumeration {
    /// The engine's default enumeration.
    #[default]
    Standard,
    /// Enumeration driven by a stateful per-class iterator.
    ClassIterator,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TargetError {
    #[error("object {0:?} is no longer live")]
    DeadObject(ObjectRef),
    #[error("property lookup failed: {0}")]
    LookupFailed(String),
}

/// A runtime whose heap can be traced and introspected without running its scripts.
///
/// Trace order is whatever the implementation produces. Callers must not assign meaning to it.
pub trait TargetRuntime: Send + Sync {
    /// Reports every GC root to `tracer`.
    fn trace_roots(&self, tracer: &mut dyn FnMut(GcThing));

    /// Reports the direct children of `object` to `tracer`.
    fn trace_children(&self, object: ObjectRef, tracer: &mut dyn FnMut(GcThing));

    /// The native class name of `object`, if the engine can supply one.
    fn class_name(&self, object: ObjectRef) -> Option<String>;

    /// The approximate size of `object`, in bytes, as accounted by the engine.
    fn size_of(&self, object: ObjectRef) -> usize;

    fn parent(&self, object: ObjectRef) -> Option<ObjectRef>;

    fn prototype(&self, object: ObjectRef) -> Option<ObjectRef>;

    /// Function metadata, or `None` if `object` is not a function.
    fn function_info(&self, object: ObjectRef) -> Option<FunctionMetadata>;

    /// Delegation targets, or `None` if `object` is not of an extended class.
    fn extended_refs(&self, object: ObjectRef) -> Option<ExtendedRefs>;

    /// Looks up `key` on `object` and its prototype chain without invoking accessors.
    fn lookup_property(
        &self,
        object: ObjectRef,
        key: &PropertyKey,
    ) -> Result<PropertyLookup, TargetError>;

    /// Lists the own and inherited enumerable properties of `object`.
    fn enumerate(
        &self,
        object: ObjectRef,
        strategy: Enumeration,
    ) -> Result<Vec<PropertyKey>, TargetError>;

    /// Returns `true` if a thread other than the calling one has an active frame in this runtime.
    ///
    /// Code that runs target scripts must hold an [`ActiveFrame`] for the duration, as
    /// [`v8_snapshot::TargetScriptRuntime::execute_script`] does.
    fn has_foreign_active_frame(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::{FunctionMetadata, StringStorage, TargetString};

    #[test]
    fn strings_use_the_narrowest_engine_form() {
        let ascii = TargetString::new("window");
        assert!(matches!(ascii.storage(), StringStorage::Latin1(b) if &b[..] == b"window"));

        let latin1 = TargetString::new("café");
        assert!(matches!(latin1.storage(), StringStorage::Latin1(b) if b.len() == 4));
        assert_eq!(latin1.to_string(), "café");

        let wide = TargetString::new("naïve ✓ 😀");
        assert!(matches!(wide.storage(), StringStorage::TwoByte(_)));
        assert_eq!(wide.len(), 10);
        assert_eq!(wide.to_string(), "naïve ✓ 😀");
    }

    #[test]
    fn storage_identity_is_shared_by_clones_only() {
        let original = TargetString::new("résumé ✓");
        assert!(original.same_storage(&original.clone()));
        assert!(!original.same_storage(&TargetString::new("résumé ✓")));
    }

    #[test]
    fn line_end_saturates() {
        let metadata = FunctionMetadata {
            function_size: 0,
            script_size: 0,
            name: None,
            filename: None,
            line_start: u32::MAX - 1,
            line_extent: 10,
        };
        assert_eq!(metadata.line_end(), u32::MAX - 1);
    }
}
