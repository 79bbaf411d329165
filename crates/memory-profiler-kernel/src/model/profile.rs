// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::constants::DEFAULT_HEAP_BUDGET_MB;
use crate::target::{Enumeration, ObjectRef, TargetString};
use derive_builder::Builder;
use serde::Serialize;

/// One invocation of the profiler.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct ProfileRequest {
    /// The source of the profiling script.
    pub script: String,
    /// The name the script is reported under.
    pub filename: String,
    /// The line number of the first line of `script`.
    #[builder(default = "1")]
    pub start_line: u32,
    /// A target object whose properties name well-known objects.
    #[builder(default, setter(strip_option))]
    pub named_objects: Option<ObjectRef>,
    /// A target string exposed to the script as the global `argument`.
    #[builder(default, setter(strip_option))]
    pub argument: Option<TargetString>,
}

/// The result of a profiling script, copied out of the profiling runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProfileResult {
    /// Either `undefined`, or a gc-managed value that cannot outlive the profiling runtime.
    Undefined,
    Null,
    Boolean(bool),
    Integer(i32),
    Number(f64),
    String(String),
}

// Used internally to pass options to a profiling session
#[derive(Clone, Debug)]
pub struct ProfilerOptions {
    /// The heap budget of the profiling runtime, in bytes.
    pub heap_budget_bytes: usize,
    /// The enumeration used by `getObjectProperties` when the script does not choose one.
    pub default_enumeration: Enumeration,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        Self {
            heap_budget_bytes: DEFAULT_HEAP_BUDGET_MB * 1024 * 1024,
            default_enumeration: Enumeration::Standard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ProfileRequestBuilder, ProfileResult};

    #[test]
    fn request_defaults() {
        let request = ProfileRequestBuilder::default()
            .script("return 1;")
            .filename("test.js")
            .build()
            .unwrap();
        assert_eq!(request.start_line, 1);
        assert!(request.named_objects.is_none());
        assert!(request.argument.is_none());
    }

    #[test]
    fn results_serialize_as_plain_json() {
        let json = serde_json::to_string(&ProfileResult::String("hi".to_string())).unwrap();
        assert_eq!(json, r#""hi""#);
        let json = serde_json::to_string(&ProfileResult::Integer(2)).unwrap();
        assert_eq!(json, "2");
        let json = serde_json::to_string(&ProfileResult::Undefined).unwrap();
        assert_eq!(json, "null");
    }
}
