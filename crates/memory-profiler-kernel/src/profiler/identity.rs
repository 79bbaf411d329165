// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::profiler::common::ProfilerError;
use crate::target::ObjectRef;
use std::collections::HashMap;

/// Assigns session-local identities to target objects.
///
/// Identities are assigned sequentially from 1 in the order objects are registered. Identity 0 is
/// reserved to mean "no object".
#[derive(Debug)]
pub struct IdentityRegistry {
    next_id: u32,
    object_to_id: HashMap<ObjectRef, u32>,
    /// Indexed by identity. Slot 0 is always `None`.
    id_to_object: Vec<Option<ObjectRef>>,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            object_to_id: HashMap::new(),
            id_to_object: vec![None],
        }
    }

    /// Returns the identity of `object`, or 0 if it has none. This never assigns an identity.
    pub fn id_for(&self, object: ObjectRef) -> u32 {
        self.object_to_id.get(&object).copied().unwrap_or(0)
    }

    /// Returns the object with identity `id`, or `None` if `id` is 0 or was never assigned.
    pub fn object_for(&self, id: u32) -> Option<ObjectRef> {
        self.id_to_object.get(id as usize).copied().flatten()
    }

    pub fn contains(&self, object: ObjectRef) -> bool {
        self.object_to_id.contains_key(&object)
    }

    /// Returns the identity of `object`, assigning the next one if it has none yet.
    pub fn intern(&mut self, object: ObjectRef) -> Result<u32, ProfilerError> {
        if let Some(&id) = self.object_to_id.get(&object) {
            return Ok(id);
        }
        if self.next_id == u32::MAX {
            return Err(ProfilerError::OutOfMemory);
        }
        self.object_to_id
            .try_reserve(1)
            .map_err(|_| ProfilerError::OutOfMemory)?;
        self.id_to_object
            .try_reserve(1)
            .map_err(|_| ProfilerError::OutOfMemory)?;

        let id = self.next_id;
        self.next_id += 1;
        self.object_to_id.insert(object, id);
        self.id_to_object.push(Some(object));
        Ok(id)
    }

    /// The identity the next registered object will receive.
    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// The number of objects with an identity.
    pub fn len(&self) -> usize {
        self.object_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_to_id.is_empty()
    }

    /// Every assigned identity with its object, in assignment order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, ObjectRef)> + '_ {
        self.id_to_object
            .iter()
            .enumerate()
            .filter_map(|(id, object)| object.map(|object| (id as u32, object)))
    }
}
