// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::model::heap_fixture::{FixtureObject, FixtureValue, HeapFixture};
use crate::target::managed_heap::{ExtendedObject, ManagedHeap};
use crate::target::{FunctionMetadata, GcThing, ObjectRef, PropertyKey, TargetValue};
use anyhow::{anyhow, bail};
use std::collections::HashMap;

/// A [`ManagedHeap`] built from a [`HeapFixture`].
#[derive(Debug)]
pub struct LoadedHeap {
    pub heap: ManagedHeap,
    /// The named-object table, if the fixture declares one.
    pub named_objects: Option<ObjectRef>,
    /// Fixture id to object.
    pub symbols: HashMap<String, ObjectRef>,
}

/// Builds a fresh heap containing every object of `fixture`.
pub fn load_fixture(fixture: &HeapFixture) -> anyhow::Result<LoadedHeap> {
    let heap = ManagedHeap::new();

    // A fresh heap hands out references sequentially, so every id can be resolved before allocation.
    let mut symbols = HashMap::with_capacity(fixture.objects.len());
    for (idx, object) in fixture.objects.iter().enumerate() {
        if symbols.insert(object.id.clone(), ObjectRef(idx as u32)).is_some() {
            bail!("duplicate fixture object id `{}`", object.id);
        }
    }
    let resolve = |id: &str| -> anyhow::Result<ObjectRef> {
        symbols
            .get(id)
            .copied()
            .ok_or_else(|| anyhow!("unknown fixture object id `{}`", id))
    };
    let resolve_opt = |id: &Option<String>| id.as_deref().map(resolve).transpose();

    for object in &fixture.objects {
        let allocated = allocate(&heap, object, &resolve_opt)?;
        debug_assert_eq!(Some(allocated), symbols.get(&object.id).copied());
    }

    for object in &fixture.objects {
        let this = resolve(&object.id)?;
        heap.set_parent(this, resolve_opt(&object.parent)?);
        heap.set_prototype(this, resolve_opt(&object.prototype)?);
        if let Some(size) = object.size {
            heap.set_size(this, size);
        }
        for (name, value) in &object.properties {
            let key = PropertyKey::from(name.as_str());
            match value {
                FixtureValue::Accessor { getter, returns } => {
                    let returns = target_value(&heap, returns, &resolve)?;
                    heap.define_accessor(this, key, resolve(getter)?, move || returns.clone());
                }
                other => heap.set_property(this, key, target_value(&heap, other, &resolve)?),
            }
        }
        for (name, value) in &object.hidden {
            let value = target_value(&heap, value, &resolve)?;
            heap.set_hidden_property(this, PropertyKey::from(name.as_str()), value);
        }
        for edge in &object.internal {
            heap.add_internal_edge(this, GcThing::Object(resolve(edge)?));
        }
    }

    for root in &fixture.roots {
        heap.add_root(GcThing::Object(resolve(root)?));
    }

    let named_objects = if fixture.named.is_empty() {
        None
    } else {
        let table = heap.alloc_object("Object");
        for (name, id) in &fixture.named {
            heap.set_property(table, name.as_str(), TargetValue::Object(resolve(id)?));
        }
        Some(table)
    };

    Ok(LoadedHeap {
        heap,
        named_objects,
        symbols,
    })
}

fn allocate(
    heap: &ManagedHeap,
    object: &FixtureObject,
    resolve_opt: &dyn Fn(&Option<String>) -> anyhow::Result<Option<ObjectRef>>,
) -> anyhow::Result<ObjectRef> {
    if let Some(function) = &object.function {
        return Ok(heap.alloc_function(FunctionMetadata {
            function_size: function.function_size,
            script_size: function.script_size,
            name: function.name.as_deref().map(|name| heap.new_string(name)),
            filename: function.filename.clone(),
            line_start: function.line_start,
            line_extent: function.line_extent,
        }));
    }
    if let Some(extended) = &object.extended {
        let class = object.class.as_deref().unwrap_or("Object");
        return Ok(heap.alloc_extended(
            class,
            ExtendedObject {
                resolver: resolve_opt(&extended.resolver)?,
                wrapped: resolve_opt(&extended.wrapped)?,
                outer: resolve_opt(&extended.outer)?,
                inner: resolve_opt(&extended.inner)?,
            },
        ));
    }
    Ok(match &object.class {
        Some(class) => heap.alloc_object(class),
        None => heap.alloc_classless(),
    })
}

fn target_value(
    heap: &ManagedHeap,
    value: &FixtureValue,
    resolve: &dyn Fn(&str) -> anyhow::Result<ObjectRef>,
) -> anyhow::Result<TargetValue> {
    Ok(match value {
        FixtureValue::Undefined => TargetValue::Undefined,
        FixtureValue::Null => TargetValue::Null,
        FixtureValue::Boolean(b) => TargetValue::Boolean(*b),
        FixtureValue::Number(n) => TargetValue::Number(*n),
        FixtureValue::String(s) => TargetValue::String(heap.new_string(s)),
        FixtureValue::Object(id) => TargetValue::Object(resolve(id)?),
        FixtureValue::Accessor { .. } => bail!("accessors can only be used as property values"),
    })
}
