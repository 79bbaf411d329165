// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::target::TargetString;

/// A description of one target object, produced per query.
///
/// Every `u32` field is an identity from the session's identity registry.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub id: u32,
    pub native_class: Option<String>,
    pub size: usize,
    pub parent: Option<u32>,
    pub prototype: Option<u32>,
    pub wrapped_object: Option<u32>,
    pub outer_object: Option<u32>,
    pub inner_object: Option<u32>,
    pub function: Option<FunctionDescriptor>,
    /// Direct children, in engine trace order.
    pub children: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub function_size: usize,
    pub script_size: usize,
    pub name: Option<TargetString>,
    pub filename: Option<String>,
    pub line_start: u32,
    pub line_end: u32,
}

/// A target value as it is handed to a profiling script.
#[derive(Debug, Clone)]
pub enum MirroredValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    /// An object, replaced by its identity.
    ObjectId(u32),
    /// A string, to be mirrored rather than copied.
    String(TargetString),
}
