// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::target::monitor::ExecutionMonitor;
use crate::target::{
    Enumeration, ExtendedRefs, FunctionMetadata, GcThing, ObjectRef, PropertyKey, PropertyLookup,
    TargetError, TargetRuntime, TargetString, TargetValue,
};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The bytes accounted to every object, regardless of its contents.
pub const OBJECT_HEADER_SIZE: usize = 32;
/// The bytes accounted to each property slot or internal edge of an object.
pub const SLOT_SIZE: usize = 16;

type Getter = Arc<dyn Fn() -> TargetValue + Send + Sync>;

/// A garbage-collected heap of script objects that can be shared with a profiling session.
///
/// Objects are never freed: an [`ObjectRef`] handed out by this heap stays valid for the heap's lifetime.
#[derive(Debug, Default)]
pub struct ManagedHeap {
    cells: RwLock<HeapCells>,
    monitor: Arc<ExecutionMonitor>,
}

#[derive(Debug, Default)]
struct HeapCells {
    objects: Vec<HeapObject>,
    roots: Vec<GcThing>,
}

#[derive(Debug)]
struct HeapObject {
    class: Option<String>,
    size: Option<usize>,
    parent: Option<ObjectRef>,
    prototype: Option<ObjectRef>,
    properties: IndexMap<PropertyKey, Property>,
    internal: Vec<GcThing>,
    kind: ObjectKind,
}

#[derive(Debug)]
enum ObjectKind {
    Plain,
    Function(FunctionMetadata),
    Extended(ExtendedObject),
}

#[derive(Debug)]
struct Property {
    slot: Slot,
    enumerable: bool,
}

enum Slot {
    Data(TargetValue),
    Accessor { getter: ObjectRef, get: Getter },
}

impl Debug for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Data(value) => f.debug_tuple("Data").field(value).finish(),
            Slot::Accessor { getter, .. } => {
                f.debug_struct("Accessor").field("getter", getter).finish()
            }
        }
    }
}

/// An object whose behavior is defined by delegation.
///
/// A membrane wrapper is an extended object with a `resolver`: property access is forwarded to the
/// resolver, and `wrapped` names the object it stands in for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedObject {
    pub resolver: Option<ObjectRef>,
    pub wrapped: Option<ObjectRef>,
    pub outer: Option<ObjectRef>,
    pub inner: Option<ObjectRef>,
}

impl HeapObject {
    fn new(class: Option<String>, kind: ObjectKind) -> Self {
        Self {
            class,
            size: None,
            parent: None,
            prototype: None,
            properties: IndexMap::new(),
            internal: Vec::new(),
            kind,
        }
    }
}

impl ManagedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty heap whose target execution is tracked by a shared `monitor`.
    pub fn with_monitor(monitor: Arc<ExecutionMonitor>) -> Self {
        Self {
            cells: RwLock::default(),
            monitor,
        }
    }

    /// Allocates an empty object of the given native class.
    pub fn alloc_object(&self, class: &str) -> ObjectRef {
        self.alloc(HeapObject::new(Some(class.to_string()), ObjectKind::Plain))
    }

    /// Allocates an empty object whose native class is unknown.
    pub fn alloc_classless(&self) -> ObjectRef {
        self.alloc(HeapObject::new(None, ObjectKind::Plain))
    }

    pub fn alloc_function(&self, metadata: FunctionMetadata) -> ObjectRef {
        self.alloc(HeapObject::new(
            Some("Function".to_string()),
            ObjectKind::Function(metadata),
        ))
    }

    pub fn alloc_extended(&self, class: &str, extended: ExtendedObject) -> ObjectRef {
        self.alloc(HeapObject::new(
            Some(class.to_string()),
            ObjectKind::Extended(extended),
        ))
    }

    /// Creates a string whose storage is owned by this heap's callers.
    pub fn new_string(&self, value: &str) -> TargetString {
        TargetString::new(value)
    }

    /// Defines (or replaces) an enumerable data property.
    pub fn set_property(&self, object: ObjectRef, key: impl Into<PropertyKey>, value: TargetValue) {
        self.define(object, key.into(), Slot::Data(value), true);
    }

    /// Defines (or replaces) a non-enumerable data property.
    pub fn set_hidden_property(
        &self,
        object: ObjectRef,
        key: impl Into<PropertyKey>,
        value: TargetValue,
    ) {
        self.define(object, key.into(), Slot::Data(value), false);
    }

    /// Defines an enumerable accessor property. `getter` is the function object that implements it
    /// and `get` computes its value whenever the property is read through [`ManagedHeap::get`].
    pub fn define_accessor<F>(
        &self,
        object: ObjectRef,
        key: impl Into<PropertyKey>,
        getter: ObjectRef,
        get: F,
    ) where
        F: Fn() -> TargetValue + Send + Sync + 'static,
    {
        let slot = Slot::Accessor {
            getter,
            get: Arc::new(get),
        };
        self.define(object, key.into(), slot, true);
    }

    pub fn set_parent(&self, object: ObjectRef, parent: Option<ObjectRef>) {
        if let Some(cell) = self.write().objects.get_mut(object.index()) {
            cell.parent = parent;
        }
    }

    pub fn set_prototype(&self, object: ObjectRef, prototype: Option<ObjectRef>) {
        if let Some(cell) = self.write().objects.get_mut(object.index()) {
            cell.prototype = prototype;
        }
    }

    /// Overrides the size the heap accounts for `object`.
    pub fn set_size(&self, object: ObjectRef, size: usize) {
        if let Some(cell) = self.write().objects.get_mut(object.index()) {
            cell.size = Some(size);
        }
    }

    /// Adds an engine-internal edge that is traced but is not a property.
    pub fn add_internal_edge(&self, object: ObjectRef, thing: GcThing) {
        if let Some(cell) = self.write().objects.get_mut(object.index()) {
            cell.internal.push(thing);
        }
    }

    pub fn add_root(&self, thing: GcThing) {
        self.write().roots.push(thing);
    }

    /// Reads a property the way script would, invoking accessors.
    pub fn get(&self, object: ObjectRef, key: &PropertyKey) -> TargetValue {
        let getter = {
            let cells = self.read();
            match cells.find_property(object, key) {
                Some(Slot::Data(value)) => return value.clone(),
                Some(Slot::Accessor { get, .. }) => Arc::clone(get),
                None => return TargetValue::Undefined,
            }
        };
        getter()
    }

    pub fn object_count(&self) -> usize {
        self.read().objects.len()
    }

    /// The monitor that tracks script execution in this heap.
    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    fn alloc(&self, object: HeapObject) -> ObjectRef {
        let mut cells = self.write();
        let object_ref = ObjectRef(cells.objects.len() as u32);
        cells.objects.push(object);
        object_ref
    }

    fn define(&self, object: ObjectRef, key: PropertyKey, slot: Slot, enumerable: bool) {
        if let Some(cell) = self.write().objects.get_mut(object.index()) {
            cell.properties.insert(key, Property { slot, enumerable });
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HeapCells> {
        self.cells.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HeapCells> {
        self.cells.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HeapCells {
    fn object(&self, object: ObjectRef) -> Result<&HeapObject, TargetError> {
        self.objects
            .get(object.index())
            .ok_or(TargetError::DeadObject(object))
    }

    /// The object followed by its prototype chain. A cyclic chain is cut at the first repeat.
    fn chain(&self, object: ObjectRef) -> Vec<ObjectRef> {
        let mut chain = Vec::new();
        let mut current = Some(object);
        while let Some(obj) = current {
            if chain.contains(&obj) {
                break;
            }
            let Some(cell) = self.objects.get(obj.index()) else {
                break;
            };
            chain.push(obj);
            current = cell.prototype;
        }
        chain
    }

    fn find_property(&self, object: ObjectRef, key: &PropertyKey) -> Option<&Slot> {
        self.chain(object).into_iter().find_map(|obj| {
            self.objects[obj.index()]
                .properties
                .get(key)
                .map(|property| &property.slot)
        })
    }
}

/// Enumerates properties one at a time, the way a class-level iterator hook is driven:
/// initialized with the object, advanced with `next`, and discarded once exhausted.
struct ClassIterator<'h> {
    cells: &'h HeapCells,
    chain: Vec<ObjectRef>,
    level: usize,
    position: usize,
    seen: HashSet<&'h PropertyKey>,
}

impl<'h> ClassIterator<'h> {
    fn new(cells: &'h HeapCells, object: ObjectRef) -> Self {
        Self {
            cells,
            chain: cells.chain(object),
            level: 0,
            position: 0,
            seen: HashSet::new(),
        }
    }
}

impl<'h> Iterator for ClassIterator<'h> {
    type Item = PropertyKey;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let object = *self.chain.get(self.level)?;
            let cells = self.cells;
            let properties = &cells.objects[object.index()].properties;
            let Some((key, property)) = properties.get_index(self.position) else {
                self.level += 1;
                self.position = 0;
                continue;
            };
            self.position += 1;
            // A non-enumerable property still shadows an inherited enumerable one.
            if self.seen.insert(key) && property.enumerable {
                return Some(key.clone());
            }
        }
    }
}

impl TargetRuntime for ManagedHeap {
    fn trace_roots(&self, tracer: &mut dyn FnMut(GcThing)) {
        let roots = self.read().roots.clone();
        for root in roots {
            tracer(root);
        }
    }

    fn trace_children(&self, object: ObjectRef, tracer: &mut dyn FnMut(GcThing)) {
        let children = {
            let cells = self.read();
            let Some(cell) = cells.objects.get(object.index()) else {
                return;
            };
            let mut children = Vec::new();
            children.extend(cell.parent.map(GcThing::Object));
            children.extend(cell.prototype.map(GcThing::Object));
            for property in cell.properties.values() {
                match &property.slot {
                    Slot::Data(value) => children.extend(value.as_gc_thing()),
                    Slot::Accessor { getter, .. } => children.push(GcThing::Object(*getter)),
                }
            }
            match &cell.kind {
                ObjectKind::Plain => {}
                ObjectKind::Function(metadata) => {
                    children.extend(metadata.name.clone().map(GcThing::String));
                }
                ObjectKind::Extended(extended) => {
                    let delegates = [
                        extended.resolver,
                        extended.wrapped,
                        extended.outer,
                        extended.inner,
                    ];
                    children.extend(delegates.into_iter().flatten().map(GcThing::Object));
                }
            }
            children.extend(cell.internal.iter().cloned());
            children
        };
        for child in children {
            tracer(child);
        }
    }

    fn class_name(&self, object: ObjectRef) -> Option<String> {
        self.read()
            .objects
            .get(object.index())
            .and_then(|cell| cell.class.clone())
    }

    fn size_of(&self, object: ObjectRef) -> usize {
        let cells = self.read();
        let Some(cell) = cells.objects.get(object.index()) else {
            return 0;
        };
        cell.size.unwrap_or_else(|| {
            OBJECT_HEADER_SIZE + SLOT_SIZE * (cell.properties.len() + cell.internal.len())
        })
    }

    fn parent(&self, object: ObjectRef) -> Option<ObjectRef> {
        self.read()
            .objects
            .get(object.index())
            .and_then(|cell| cell.parent)
    }

    fn prototype(&self, object: ObjectRef) -> Option<ObjectRef> {
        self.read()
            .objects
            .get(object.index())
            .and_then(|cell| cell.prototype)
    }

    fn function_info(&self, object: ObjectRef) -> Option<FunctionMetadata> {
        let cells = self.read();
        match &cells.objects.get(object.index())?.kind {
            ObjectKind::Function(metadata) => Some(metadata.clone()),
            _ => None,
        }
    }

    fn extended_refs(&self, object: ObjectRef) -> Option<ExtendedRefs> {
        let cells = self.read();
        match &cells.objects.get(object.index())?.kind {
            ObjectKind::Extended(extended) => Some(ExtendedRefs {
                // Only a membrane (an object with a resolver) wraps another object.
                wrapped: extended.resolver.and(extended.wrapped),
                outer: extended.outer,
                inner: extended.inner,
            }),
            _ => None,
        }
    }

    fn lookup_property(
        &self,
        object: ObjectRef,
        key: &PropertyKey,
    ) -> Result<PropertyLookup, TargetError> {
        let cells = self.read();
        cells.object(object)?;
        Ok(match cells.find_property(object, key) {
            None => PropertyLookup::Missing,
            Some(Slot::Data(value)) => PropertyLookup::Value(value.clone()),
            Some(Slot::Accessor { .. }) => PropertyLookup::Accessor,
        })
    }

    fn enumerate(
        &self,
        object: ObjectRef,
        strategy: Enumeration,
    ) -> Result<Vec<PropertyKey>, TargetError> {
        let cells = self.read();
        cells.object(object)?;
        match strategy {
            Enumeration::Standard => {
                let mut seen = HashSet::new();
                let mut keys = Vec::new();
                for obj in cells.chain(object) {
                    for (key, property) in &cells.objects[obj.index()].properties {
                        if seen.insert(key) && property.enumerable {
                            keys.push(key.clone());
                        }
                    }
                }
                Ok(keys)
            }
            Enumeration::ClassIterator => Ok(ClassIterator::new(&cells, object).collect()),
        }
    }

    fn has_foreign_active_frame(&self) -> bool {
        self.monitor.has_foreign_frame()
    }
}
