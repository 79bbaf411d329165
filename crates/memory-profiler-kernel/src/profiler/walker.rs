// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::profiler::common::ProfilerError;
use crate::profiler::identity::IdentityRegistry;
use crate::target::{GcThing, ObjectRef, TargetRuntime};

/// Discovers target objects and registers them with an [`IdentityRegistry`].
pub struct HeapWalker<'a> {
    target: &'a dyn TargetRuntime,
    registry: &'a mut IdentityRegistry,
}

impl<'a> HeapWalker<'a> {
    pub fn new(target: &'a dyn TargetRuntime, registry: &'a mut IdentityRegistry) -> Self {
        Self { target, registry }
    }

    /// Traces everything reachable from the GC roots, then from each of `extra_seeds`, assigning
    /// an identity to every object on first visit.
    ///
    /// Identities follow depth-first pre-order: an object is registered before its children, and
    /// its children are visited in trace order. Strings and numbers are skipped. If registration
    /// fails, the walk stops and the registry must not be queried.
    pub fn discover_all(&mut self, extra_seeds: &[ObjectRef]) -> Result<(), ProfilerError> {
        let mut seeds = Vec::new();
        self.target.trace_roots(&mut |thing| {
            if let GcThing::Object(object) = thing {
                seeds.push(object);
            }
        });
        seeds.extend_from_slice(extra_seeds);

        // Pushed in reverse so that pops follow trace order.
        let mut worklist: Vec<ObjectRef> = seeds.into_iter().rev().collect();
        let mut children = Vec::new();
        while let Some(object) = worklist.pop() {
            if self.registry.contains(object) {
                continue;
            }
            self.registry.intern(object)?;

            children.clear();
            self.target.trace_children(object, &mut |thing| {
                if let GcThing::Object(child) = thing {
                    children.push(child);
                }
            });
            worklist.extend(
                children
                    .iter()
                    .rev()
                    .filter(|child| !self.registry.contains(**child)),
            );
        }
        tracing::debug!(objects = self.registry.len(), "heap walk complete");
        Ok(())
    }

    /// Returns the identities of the direct object children of `id`, in engine trace order, or
    /// `None` if `id` names no object. Children without an identity are assigned one.
    pub fn children_of(&mut self, id: u32) -> Result<Option<Vec<u32>>, ProfilerError> {
        let Some(object) = self.registry.object_for(id) else {
            return Ok(None);
        };
        let mut children = Vec::new();
        self.target.trace_children(object, &mut |thing| {
            if let GcThing::Object(child) = thing {
                children.push(child);
            }
        });
        children
            .into_iter()
            .map(|child| self.registry.intern(child))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Returns the identities of the objects that are direct GC roots, in root trace order.
    pub fn gc_roots(&mut self) -> Result<Vec<u32>, ProfilerError> {
        let mut roots = Vec::new();
        self.target.trace_roots(&mut |thing| {
            if let GcThing::Object(object) = thing {
                roots.push(object);
            }
        });
        roots
            .into_iter()
            .map(|root| self.registry.intern(root))
            .collect()
    }
}
