// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

//! The functions a profiling script calls to query the target runtime.

use crate::model::descriptor::{MirroredValue, ObjectDescriptor};
use crate::profiler::common::{define_index, define_property, throw_script_error};
use crate::profiler::common::{v8_interned, v8_string, v8_uint};
use crate::profiler::common::{ProfilerError, ScriptError};
use crate::profiler::identity::IdentityRegistry;
use crate::profiler::inspector::ObjectInspector;
use crate::profiler::mirror::{MirrorStorage, StringMirror};
use crate::profiler::socket::{self, SocketTable};
use crate::profiler::walker::HeapWalker;
use crate::target::{Enumeration, ObjectRef, PropertyKey, PropertyLookup, TargetRuntime, TargetValue};
use deno_core::v8;
use deno_core::v8::HandleScope;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// The maximum number of frames reported by `stack()`.
const MAX_STACK_FRAMES: usize = 64;

/// Everything a builtin needs to answer a query. Owned by the profiling runtime's isolate.
pub(crate) struct SessionState {
    pub target: Arc<dyn TargetRuntime>,
    pub registry: IdentityRegistry,
    pub mirror: StringMirror,
    pub named_objects: Option<ObjectRef>,
    pub default_enumeration: Enumeration,
    pub sockets: SocketTable,
}

/// Stored in an isolate slot. `None` before a session is attached and after it is released.
pub(crate) type SessionSlot = Rc<RefCell<Option<SessionState>>>;

impl SessionState {
    pub fn new(
        target: Arc<dyn TargetRuntime>,
        mirror: StringMirror,
        named_objects: Option<ObjectRef>,
        default_enumeration: Enumeration,
    ) -> Self {
        Self {
            target,
            registry: IdentityRegistry::new(),
            mirror,
            named_objects,
            default_enumeration,
            sockets: SocketTable::default(),
        }
    }

    pub fn inspector(&mut self) -> ObjectInspector<'_> {
        ObjectInspector::new(&*self.target, &mut self.registry)
    }

    pub fn walker(&mut self) -> HeapWalker<'_> {
        HeapWalker::new(&*self.target, &mut self.registry)
    }

    /// Closes every socket and forgets every identity, then releases the mirrors' root. Returns
    /// the string storage, which must outlive the isolate.
    pub fn release(self) -> MirrorStorage {
        let Self {
            sockets,
            registry,
            mirror,
            ..
        } = self;
        drop(sockets);
        drop(registry);
        mirror.into_backing_storage()
    }
}

/// Runs `f` against the session attached to the isolate, then either returns its value to the
/// script or throws its error at the call site.
pub(crate) fn with_session<'s, F>(scope: &mut HandleScope<'s>, mut rv: v8::ReturnValue, f: F)
where
    F: FnOnce(&mut HandleScope<'s>, &mut SessionState) -> Result<v8::Local<'s, v8::Value>, ScriptError>,
{
    let Some(slot) = scope.get_slot::<SessionSlot>().cloned() else {
        throw_script_error(scope, &ScriptError::SessionUnavailable);
        return;
    };
    let result = match slot.try_borrow_mut() {
        Ok(mut state) => match state.as_mut() {
            Some(state) => f(scope, state),
            None => Err(ScriptError::SessionUnavailable),
        },
        // A builtin re-entered while another was running.
        Err(_) => Err(ScriptError::SessionUnavailable),
    };
    match result {
        Ok(value) => rv.set(value),
        Err(err) => throw_script_error(scope, &err),
    }
}

/// Installs the profiler builtins and the profiling-script standard library on the global object.
pub(crate) fn install(scope: &mut HandleScope) -> Result<(), ProfilerError> {
    let global = scope.get_current_context().global(scope);
    macro_rules! function {
        ($name:literal, $callback:expr) => {
            let key = v8_interned(scope, $name);
            let function = v8::Function::new(scope, $callback).ok_or(ProfilerError::OutOfMemory)?;
            global
                .set(scope, key.into(), function.into())
                .ok_or(ProfilerError::OutOfMemory)?;
        };
    }
    function!("getObjectInfo", get_object_info);
    function!("getObjectProperties", get_object_properties);
    function!("getObjectProperty", get_object_property);
    function!("getObjectParent", get_object_parent);
    function!("getNamedObjects", get_named_objects);
    function!("getObjectTable", get_object_table);
    function!("getGCRoots", get_gc_roots);
    function!("print", print);
    function!("stack", stack);
    function!("forceGC", force_gc);
    socket::install(scope, global)
}

/// Resolves an "object ID or name" argument to an identity. Returns `None` if it names no object.
fn resolve_target(
    scope: &mut HandleScope,
    session: &mut SessionState,
    value: v8::Local<v8::Value>,
) -> Result<Option<u32>, ScriptError> {
    if value.is_number() {
        let id = value.uint32_value(scope).unwrap_or(0);
        Ok(session.registry.object_for(id).map(|_| id))
    } else if value.is_string() {
        let Some(table) = session.named_objects else {
            return Ok(None);
        };
        let name = value.to_rust_string_lossy(scope);
        match session.target.lookup_property(table, &PropertyKey::from(name.as_str()))? {
            PropertyLookup::Value(TargetValue::Object(object)) => {
                Ok(Some(session.registry.intern(object)?))
            }
            _ => Ok(None),
        }
    } else {
        Err(ScriptError::InvalidTarget)
    }
}

fn get_object_info<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let target = args.get(0);
    with_session(scope, rv, |scope, session| {
        let Some(id) = resolve_target(scope, session, target)? else {
            return Ok(v8::null(scope).into());
        };
        let descriptor = session.inspector().describe(id)?;
        match descriptor {
            Some(descriptor) => Ok(descriptor_to_v8(scope, &mut session.mirror, &descriptor)?.into()),
            None => Ok(v8::null(scope).into()),
        }
    });
}

fn get_object_properties<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let target = args.get(0);
    let flag = args.get(1);
    let strategy = (!flag.is_undefined()).then(|| {
        if flag.boolean_value(scope) {
            Enumeration::ClassIterator
        } else {
            Enumeration::Standard
        }
    });
    with_session(scope, rv, |scope, session| {
        let Some(id) = resolve_target(scope, session, target)? else {
            return Ok(v8::null(scope).into());
        };
        let strategy = strategy.unwrap_or(session.default_enumeration);
        let properties = session.inspector().properties_of(id, strategy)?;
        match properties {
            Some(properties) => Ok(properties_to_v8(scope, &mut session.mirror, &properties)?.into()),
            None => Ok(v8::null(scope).into()),
        }
    });
}

fn get_object_property<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let target = args.get(0);
    // Converted before the session is borrowed: `toString` may run script.
    let Some(name) = args.get(1).to_string(scope) else {
        return;
    };
    let name = name.to_rust_string_lossy(scope);
    with_session(scope, rv, |scope, session| {
        let Some(id) = resolve_target(scope, session, target)? else {
            return Ok(v8::null(scope).into());
        };
        let value = session
            .inspector()
            .property_value(id, &PropertyKey::from(name.as_str()))?;
        match value {
            Some(value) => mirrored_to_v8(scope, &mut session.mirror, &value),
            None => Ok(v8::null(scope).into()),
        }
    });
}

fn get_object_parent<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    let target = args.get(0);
    with_session(scope, rv, |scope, session| {
        let Some(id) = resolve_target(scope, session, target)? else {
            return Ok(v8::null(scope).into());
        };
        match session.inspector().parent_of(id)? {
            Some(parent) => Ok(v8_uint(scope, parent).into()),
            None => Ok(v8::null(scope).into()),
        }
    });
}

fn get_named_objects<'s>(
    scope: &mut HandleScope<'s>,
    _args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    with_session(scope, rv, |scope, session| {
        let Some(table) = session.named_objects else {
            return Ok(v8::Object::new(scope).into());
        };
        let mut inspector = session.inspector();
        let id = inspector.intern(table)?;
        let properties = inspector
            .properties_of(id, Enumeration::Standard)?
            .unwrap_or_default();
        Ok(properties_to_v8(scope, &mut session.mirror, &properties)?.into())
    });
}

fn get_object_table<'s>(
    scope: &mut HandleScope<'s>,
    _args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    with_session(scope, rv, |scope, session| {
        let table = session.inspector().object_table();
        let object = v8::Object::new(scope);
        for (id, class_name) in table {
            let value: v8::Local<v8::Value> = match class_name {
                Some(class_name) => v8_string(scope, &class_name).into(),
                None => v8::null(scope).into(),
            };
            define_index(scope, object, id, value).ok_or(ScriptError::OutOfMemory)?;
        }
        Ok(object.into())
    });
}

fn get_gc_roots<'s>(
    scope: &mut HandleScope<'s>,
    _args: v8::FunctionCallbackArguments<'s>,
    rv: v8::ReturnValue,
) {
    with_session(scope, rv, |scope, session| {
        let roots = session.walker().gc_roots()?;
        Ok(ids_to_v8(scope, &roots)?.into())
    });
}

fn print<'s>(
    scope: &mut HandleScope<'s>,
    args: v8::FunctionCallbackArguments<'s>,
    _rv: v8::ReturnValue,
) {
    let line = (0..args.length())
        .map(|idx| args.get(idx).to_rust_string_lossy(scope))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::info!(target: "profiler_script", "{}", line);
}

fn stack<'s>(
    scope: &mut HandleScope<'s>,
    _args: v8::FunctionCallbackArguments<'s>,
    mut rv: v8::ReturnValue,
) {
    let mut lines = Vec::new();
    if let Some(trace) = v8::StackTrace::current_stack_trace(scope, MAX_STACK_FRAMES) {
        for idx in 0..trace.get_frame_count() {
            let Some(frame) = trace.get_frame(scope, idx) else {
                continue;
            };
            let function = frame
                .get_function_name(scope)
                .map(|name| name.to_rust_string_lossy(scope))
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "<anonymous>".to_string());
            let script = frame
                .get_script_name(scope)
                .map(|name| name.to_rust_string_lossy(scope))
                .unwrap_or_default();
            lines.push(format!(
                "{}@{}:{}:{}",
                function,
                script,
                frame.get_line_number(),
                frame.get_column()
            ));
        }
    }
    rv.set(v8_string(scope, &lines.join("\n")).into());
}

fn force_gc<'s>(
    scope: &mut HandleScope<'s>,
    _args: v8::FunctionCallbackArguments<'s>,
    _rv: v8::ReturnValue,
) {
    scope.low_memory_notification();
}

/// Builds the script-visible form of a descriptor. Absent optional fields are omitted.
fn descriptor_to_v8<'s>(
    scope: &mut HandleScope<'s>,
    mirror: &mut StringMirror,
    descriptor: &ObjectDescriptor,
) -> Result<v8::Local<'s, v8::Object>, ScriptError> {
    let object = v8::Object::new(scope);
    let id = v8_uint(scope, descriptor.id);
    set_field(scope, object, "id", id.into())?;
    if let Some(native_class) = &descriptor.native_class {
        let native_class = v8_string(scope, native_class);
        set_field(scope, object, "nativeClass", native_class.into())?;
    }
    let size = v8::Number::new(scope, descriptor.size as f64);
    set_field(scope, object, "size", size.into())?;

    let optional_ids = [
        ("parent", descriptor.parent),
        ("prototype", descriptor.prototype),
        ("wrappedObject", descriptor.wrapped_object),
        ("outerObject", descriptor.outer_object),
        ("innerObject", descriptor.inner_object),
    ];
    for (name, id) in optional_ids {
        if let Some(id) = id {
            let id = v8_uint(scope, id);
            set_field(scope, object, name, id.into())?;
        }
    }

    if let Some(function) = &descriptor.function {
        let function_size = v8::Number::new(scope, function.function_size as f64);
        set_field(scope, object, "functionSize", function_size.into())?;
        let script_size = v8::Number::new(scope, function.script_size as f64);
        set_field(scope, object, "scriptSize", script_size.into())?;
        if let Some(name) = &function.name {
            let name = mirror.mirror(scope, name)?;
            set_field(scope, object, "name", name.into())?;
        }
        if let Some(filename) = &function.filename {
            let filename = v8_string(scope, filename);
            set_field(scope, object, "filename", filename.into())?;
        }
        let line_start = v8_uint(scope, function.line_start);
        set_field(scope, object, "lineStart", line_start.into())?;
        let line_end = v8_uint(scope, function.line_end);
        set_field(scope, object, "lineEnd", line_end.into())?;
    }

    let children = ids_to_v8(scope, &descriptor.children)?;
    set_field(scope, object, "children", children.into())?;
    Ok(object)
}

fn properties_to_v8<'s>(
    scope: &mut HandleScope<'s>,
    mirror: &mut StringMirror,
    properties: &IndexMap<PropertyKey, MirroredValue>,
) -> Result<v8::Local<'s, v8::Object>, ScriptError> {
    let object = v8::Object::new(scope);
    for (key, value) in properties {
        let value = mirrored_to_v8(scope, mirror, value)?;
        let defined = match key {
            PropertyKey::Index(idx) => define_index(scope, object, *idx, value),
            PropertyKey::Name(name) => {
                let name = v8_string(scope, name);
                define_property(scope, object, name.into(), value)
            }
        };
        defined.ok_or(ScriptError::OutOfMemory)?;
    }
    Ok(object)
}

fn mirrored_to_v8<'s>(
    scope: &mut HandleScope<'s>,
    mirror: &mut StringMirror,
    value: &MirroredValue,
) -> Result<v8::Local<'s, v8::Value>, ScriptError> {
    Ok(match value {
        MirroredValue::Undefined => v8::undefined(scope).into(),
        MirroredValue::Null => v8::null(scope).into(),
        MirroredValue::Boolean(b) => v8::Boolean::new(scope, *b).into(),
        MirroredValue::Number(n) => v8::Number::new(scope, *n).into(),
        MirroredValue::ObjectId(id) => v8_uint(scope, *id).into(),
        MirroredValue::String(s) => mirror.mirror(scope, s)?.into(),
    })
}

fn ids_to_v8<'s>(
    scope: &mut HandleScope<'s>,
    ids: &[u32],
) -> Result<v8::Local<'s, v8::Array>, ScriptError> {
    let array = v8::Array::new(scope, ids.len() as i32);
    for (idx, id) in ids.iter().enumerate() {
        let id = v8_uint(scope, *id);
        define_index(scope, array.into(), idx as u32, id.into()).ok_or(ScriptError::OutOfMemory)?;
    }
    Ok(array)
}

fn set_field(
    scope: &mut HandleScope,
    object: v8::Local<v8::Object>,
    name: &str,
    value: v8::Local<v8::Value>,
) -> Result<(), ScriptError> {
    let key = v8_interned(scope, name);
    define_property(scope, object, key.into(), value).ok_or(ScriptError::OutOfMemory)
}
