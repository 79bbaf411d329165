// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::model::descriptor::{FunctionDescriptor, MirroredValue, ObjectDescriptor};
use crate::profiler::common::{ProfilerError, ScriptError};
use crate::profiler::identity::IdentityRegistry;
use crate::profiler::walker::HeapWalker;
use crate::target::{Enumeration, ObjectRef, PropertyKey, PropertyLookup, TargetRuntime, TargetValue};
use indexmap::IndexMap;

/// Answers queries about target objects by identity.
///
/// Any object a query mentions that has no identity yet (for example, one created after the initial
/// heap walk) is assigned one.
pub struct ObjectInspector<'a> {
    target: &'a dyn TargetRuntime,
    registry: &'a mut IdentityRegistry,
}

impl<'a> ObjectInspector<'a> {
    pub fn new(target: &'a dyn TargetRuntime, registry: &'a mut IdentityRegistry) -> Self {
        Self { target, registry }
    }

    /// Describes the object with identity `id`, or returns `None` if there is no such object.
    pub fn describe(&mut self, id: u32) -> Result<Option<ObjectDescriptor>, ScriptError> {
        let Some(object) = self.registry.object_for(id) else {
            return Ok(None);
        };

        let parent = self.intern_opt(self.target.parent(object))?;
        let prototype = self.intern_opt(self.target.prototype(object))?;
        let (mut wrapped_object, mut outer_object, mut inner_object) = (None, None, None);
        if let Some(refs) = self.target.extended_refs(object) {
            wrapped_object = self.intern_opt(refs.wrapped)?;
            outer_object = self.intern_opt(refs.outer)?;
            inner_object = self.intern_opt(refs.inner)?;
        }
        let function = self
            .target
            .function_info(object)
            .map(|info| FunctionDescriptor {
                function_size: info.function_size,
                script_size: info.script_size,
                line_end: info.line_end(),
                line_start: info.line_start,
                name: info.name,
                filename: info.filename,
            });
        let children = HeapWalker::new(self.target, self.registry)
            .children_of(id)?
            .unwrap_or_default();

        Ok(Some(ObjectDescriptor {
            id,
            native_class: self.target.class_name(object),
            size: self.target.size_of(object),
            parent,
            prototype,
            wrapped_object,
            outer_object,
            inner_object,
            function,
            children,
        }))
    }

    /// The identity of the parent of `id`, or `None` if `id` names no object or it has no parent.
    pub fn parent_of(&mut self, id: u32) -> Result<Option<u32>, ScriptError> {
        let Some(object) = self.registry.object_for(id) else {
            return Ok(None);
        };
        Ok(self.intern_opt(self.target.parent(object))?)
    }

    /// Looks up one property of `id` without running accessors, or returns `None` if `id` names
    /// no object. Missing properties and accessor properties both read as `null`.
    pub fn property_value(
        &mut self,
        id: u32,
        key: &PropertyKey,
    ) -> Result<Option<MirroredValue>, ScriptError> {
        let Some(object) = self.registry.object_for(id) else {
            return Ok(None);
        };
        self.lookup(object, key).map(Some)
    }

    /// Looks up every enumerable own and inherited property of `id`, in enumeration order.
    pub fn properties_of(
        &mut self,
        id: u32,
        strategy: Enumeration,
    ) -> Result<Option<IndexMap<PropertyKey, MirroredValue>>, ScriptError> {
        let Some(object) = self.registry.object_for(id) else {
            return Ok(None);
        };
        let keys = self.target.enumerate(object, strategy)?;
        let mut properties = IndexMap::with_capacity(keys.len());
        for key in keys {
            let value = self.lookup(object, &key)?;
            properties.insert(key, value);
        }
        Ok(Some(properties))
    }

    /// The native class name of every object that currently has an identity.
    pub fn object_table(&self) -> IndexMap<u32, Option<String>> {
        self.registry
            .iter()
            .map(|(id, object)| (id, self.target.class_name(object)))
            .collect()
    }

    /// Resolves `object`'s identity, assigning one if needed.
    pub fn intern(&mut self, object: ObjectRef) -> Result<u32, ProfilerError> {
        self.registry.intern(object)
    }

    /// Converts a target value into the form handed to scripts.
    pub fn mirror_value(&mut self, value: TargetValue) -> Result<MirroredValue, ProfilerError> {
        Ok(match value {
            TargetValue::Undefined => MirroredValue::Undefined,
            TargetValue::Null => MirroredValue::Null,
            TargetValue::Boolean(b) => MirroredValue::Boolean(b),
            TargetValue::Number(n) => MirroredValue::Number(n),
            TargetValue::String(s) => MirroredValue::String(s),
            TargetValue::Object(object) => MirroredValue::ObjectId(self.registry.intern(object)?),
        })
    }

    fn lookup(&mut self, object: ObjectRef, key: &PropertyKey) -> Result<MirroredValue, ScriptError> {
        match self.target.lookup_property(object, key)? {
            PropertyLookup::Value(value) => Ok(self.mirror_value(value)?),
            PropertyLookup::Missing | PropertyLookup::Accessor => Ok(MirroredValue::Null),
        }
    }

    fn intern_opt(&mut self, object: Option<ObjectRef>) -> Result<Option<u32>, ProfilerError> {
        object.map(|object| self.registry.intern(object)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectInspector;
    use crate::model::descriptor::MirroredValue;
    use crate::profiler::identity::IdentityRegistry;
    use crate::profiler::walker::HeapWalker;
    use crate::target::managed_heap::{ExtendedObject, OBJECT_HEADER_SIZE};
    use crate::target::{Enumeration, FunctionMetadata, GcThing, ManagedHeap, PropertyKey, TargetValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn walked(heap: &ManagedHeap) -> IdentityRegistry {
        let mut registry = IdentityRegistry::new();
        HeapWalker::new(heap, &mut registry).discover_all(&[]).unwrap();
        registry
    }

    #[test]
    fn describe_plain_object() {
        let heap = ManagedHeap::new();
        let global = heap.alloc_object("Window");
        let proto = heap.alloc_object("Object");
        let obj = heap.alloc_object("Object");
        heap.set_parent(obj, Some(global));
        heap.set_prototype(obj, Some(proto));
        heap.set_property(global, "obj", TargetValue::Object(obj));
        heap.add_root(GcThing::Object(global));
        let mut registry = walked(&heap);
        let obj_id = registry.id_for(obj);
        let mut inspector = ObjectInspector::new(&heap, &mut registry);

        let descriptor = inspector.describe(obj_id).unwrap().unwrap();
        assert_eq!(descriptor.id, obj_id);
        assert_eq!(descriptor.native_class.as_deref(), Some("Object"));
        assert_eq!(descriptor.size, OBJECT_HEADER_SIZE);
        assert_eq!(descriptor.parent, Some(1));
        assert!(descriptor.prototype.is_some());
        assert!(descriptor.function.is_none());
        assert!(descriptor.wrapped_object.is_none());
        assert_eq!(descriptor.children, vec![1, descriptor.prototype.unwrap()]);
        assert!(inspector.describe(0).unwrap().is_none());
        assert!(inspector.describe(1000).unwrap().is_none());
    }

    #[test]
    fn describe_function_and_membrane() {
        let heap = ManagedHeap::new();
        let function = heap.alloc_function(FunctionMetadata {
            function_size: 80,
            script_size: 400,
            name: Some(heap.new_string("onload")),
            filename: Some("page.js".to_string()),
            line_start: 10,
            line_extent: 5,
        });
        let resolver = heap.alloc_object("Object");
        let membrane = heap.alloc_extended(
            "Wrapper",
            ExtendedObject {
                resolver: Some(resolver),
                wrapped: Some(function),
                ..Default::default()
            },
        );
        heap.add_root(GcThing::Object(membrane));
        let mut registry = walked(&heap);
        let mut inspector = ObjectInspector::new(&heap, &mut registry);

        let wrapper = inspector.describe(1).unwrap().unwrap();
        assert_eq!(wrapper.native_class.as_deref(), Some("Wrapper"));
        let wrapped_id = wrapper.wrapped_object.unwrap();
        assert!(wrapper.outer_object.is_none());

        let described = inspector.describe(wrapped_id).unwrap().unwrap();
        let info = described.function.unwrap();
        assert_eq!(info.name.unwrap().to_string(), "onload");
        assert_eq!(info.filename.as_deref(), Some("page.js"));
        assert_eq!(info.line_start, 10);
        assert_eq!(info.line_end, 14);
        assert_eq!(info.script_size, 400);
    }

    #[test]
    fn property_values_are_mirrored_without_side_effects() {
        let heap = ManagedHeap::new();
        let obj = heap.alloc_object("Object");
        let child = heap.alloc_object("Object");
        let getter = heap.alloc_object("Function");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        heap.set_property(obj, "child", TargetValue::Object(child));
        heap.set_property(obj, "text", TargetValue::String(heap.new_string("sup")));
        heap.set_property(obj, "flag", TargetValue::Boolean(true));
        heap.set_property(obj, "count", TargetValue::Number(2.5));
        heap.define_accessor(obj, "computed", getter, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            TargetValue::Null
        });
        heap.add_root(GcThing::Object(obj));
        let mut registry = walked(&heap);
        let child_id = registry.id_for(child);
        let mut inspector = ObjectInspector::new(&heap, &mut registry);

        let value = inspector.property_value(1, &"child".into()).unwrap();
        assert!(matches!(value, Some(MirroredValue::ObjectId(id)) if id == child_id));
        let value = inspector.property_value(1, &"text".into()).unwrap();
        assert!(matches!(value, Some(MirroredValue::String(s)) if s.to_string() == "sup"));
        let value = inspector.property_value(1, &"flag".into()).unwrap();
        assert!(matches!(value, Some(MirroredValue::Boolean(true))));
        let value = inspector.property_value(1, &"count".into()).unwrap();
        assert!(matches!(value, Some(MirroredValue::Number(n)) if n == 2.5));
        let value = inspector.property_value(1, &"missing".into()).unwrap();
        assert!(matches!(value, Some(MirroredValue::Null)));
        let value = inspector.property_value(1, &"computed".into()).unwrap();
        assert!(matches!(value, Some(MirroredValue::Null)));

        for strategy in [Enumeration::Standard, Enumeration::ClassIterator] {
            let properties = inspector.properties_of(1, strategy).unwrap().unwrap();
            assert_eq!(properties.len(), 5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(inspector.property_value(77, &"child".into()).unwrap().is_none());
    }

    #[test]
    fn enumeration_strategies_produce_the_same_properties() {
        let heap = ManagedHeap::new();
        let proto = heap.alloc_object("Object");
        let obj = heap.alloc_object("Object");
        heap.set_prototype(obj, Some(proto));
        heap.set_property(proto, "inherited", TargetValue::Number(1.0));
        heap.set_property(obj, "own", TargetValue::Object(proto));
        heap.set_property(obj, 3u32, TargetValue::Undefined);
        heap.add_root(GcThing::Object(obj));
        let mut registry = walked(&heap);
        let mut inspector = ObjectInspector::new(&heap, &mut registry);

        let standard = inspector.properties_of(1, Enumeration::Standard).unwrap().unwrap();
        let iterated = inspector.properties_of(1, Enumeration::ClassIterator).unwrap().unwrap();
        let standard_keys: Vec<_> = standard.keys().cloned().collect();
        let iterated_keys: Vec<_> = iterated.keys().cloned().collect();
        assert_eq!(standard_keys, iterated_keys);
        assert_eq!(
            standard_keys,
            vec![
                PropertyKey::Name("own".to_string()),
                PropertyKey::Index(3),
                PropertyKey::Name("inherited".to_string()),
            ]
        );
    }

    #[test]
    fn object_table_covers_every_identity() {
        let heap = ManagedHeap::new();
        let root = heap.alloc_object("Window");
        let anonymous = heap.alloc_classless();
        heap.set_property(root, "anon", TargetValue::Object(anonymous));
        heap.add_root(GcThing::Object(root));
        let mut registry = walked(&heap);
        let inspector = ObjectInspector::new(&heap, &mut registry);

        let table = inspector.object_table();
        assert_eq!(table.len(), 2);
        assert_eq!(table[&1].as_deref(), Some("Window"));
        assert_eq!(table[&2], None);
    }
}
