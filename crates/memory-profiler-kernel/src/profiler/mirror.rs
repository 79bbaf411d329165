// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::profiler::common::{define_index, ProfilerError};
use crate::target::{StringStorage, TargetString};
use deno_core::v8;
use deno_core::v8::HandleScope;
use std::collections::HashMap;

/// How a target string is represented in the profiling runtime. Both kinds are v8 external strings
/// that read the target's storage in place. Their finalizers do nothing: the storage belongs to
/// the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MirrorKind {
    /// Latin-1 code units.
    OneByte,
    /// UTF-16 code units.
    TwoByte,
}

/// Mirrors target strings into the profiling runtime, at most once per distinct target string.
///
/// Every mirror is appended to a rooted [`v8::Array`], so none can be collected while the session lives.
/// The backing storage of each mirrored string is retained until [`StringMirror::into_backing_storage`]
/// hands it to the owner of the isolate, which must drop it only after the isolate is disposed.
#[derive(Debug)]
pub struct StringMirror {
    v8_array: v8::Global<v8::Array>,
    entries: Vec<MirrorEntry>,
    /// Storage address to index in `entries` (and `v8_array`).
    by_storage: HashMap<usize, u32>,
}

#[derive(Debug)]
struct MirrorEntry {
    storage: StringStorage,
    kind: MirrorKind,
}

/// Target string storage that must outlive the isolate holding its mirrors.
#[derive(Debug, Default)]
pub struct MirrorStorage(Vec<StringStorage>);

impl MirrorStorage {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl StringMirror {
    pub fn new(scope: &mut HandleScope) -> Self {
        let v8_array = v8::Array::new(scope, 0);
        Self {
            v8_array: v8::Global::new(scope, v8_array),
            entries: Vec::new(),
            by_storage: HashMap::new(),
        }
    }

    /// Returns the mirror of `string`, creating it on first use.
    pub fn mirror<'s>(
        &mut self,
        scope: &mut HandleScope<'s>,
        string: &TargetString,
    ) -> Result<v8::Local<'s, v8::String>, ProfilerError> {
        let array = v8::Local::new(scope, &self.v8_array);
        if let Some(&idx) = self.by_storage.get(&string.storage_addr()) {
            return array
                .get_index(scope, idx)
                .and_then(|value| v8::Local::<v8::String>::try_from(value).ok())
                .ok_or(ProfilerError::OutOfMemory);
        }

        let storage = string.storage().clone();
        let (mirror, kind) = match &storage {
            StringStorage::Latin1(bytes) => (external_one_byte(scope, bytes), MirrorKind::OneByte),
            StringStorage::TwoByte(units) => (external_two_byte(scope, units), MirrorKind::TwoByte),
        };
        let mirror = mirror.ok_or(ProfilerError::OutOfMemory)?;

        let idx = self.entries.len() as u32;
        define_index(scope, array.into(), idx, mirror.into()).ok_or(ProfilerError::OutOfMemory)?;
        self.by_storage.insert(string.storage_addr(), idx);
        self.entries.push(MirrorEntry { storage, kind });
        Ok(mirror)
    }

    /// The representation chosen for `string`, if it has been mirrored.
    pub fn kind_of(&self, string: &TargetString) -> Option<MirrorKind> {
        let idx = *self.by_storage.get(&string.storage_addr())?;
        self.entries.get(idx as usize).map(|entry| entry.kind)
    }

    /// The number of mirrors created.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases the root of every mirror and returns the storage they reference.
    pub fn into_backing_storage(self) -> MirrorStorage {
        let Self {
            v8_array, entries, ..
        } = self;
        drop(v8_array);
        MirrorStorage(entries.into_iter().map(|entry| entry.storage).collect())
    }
}

// SAFETY (both constructors below): the code units are retained by the `StringMirror` and then by
// its `MirrorStorage`, which the profiling runtime drops only after disposing of the isolate. They
// therefore outlive every reference v8 holds to them, and v8 never frees or mutates the contents of
// a static external string.

/// Creates an external one-byte string over Latin-1 `bytes` without copying them.
fn external_one_byte<'s>(
    scope: &mut HandleScope<'s>,
    bytes: &[u8],
) -> Option<v8::Local<'s, v8::String>> {
    let bytes: &'static [u8] = unsafe { std::mem::transmute::<&[u8], &'static [u8]>(bytes) };
    v8::String::new_external_onebyte_static(scope, bytes)
}

/// Creates an external two-byte string over UTF-16 `units` without copying them.
fn external_two_byte<'s>(
    scope: &mut HandleScope<'s>,
    units: &[u16],
) -> Option<v8::Local<'s, v8::String>> {
    let units: &'static [u16] = unsafe { std::mem::transmute::<&[u16], &'static [u16]>(units) };
    v8::String::new_external_twobyte_static(scope, units)
}
