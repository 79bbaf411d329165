// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A serialized description of a target heap. Objects refer to one another by their `id`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HeapFixture {
    pub objects: Vec<FixtureObject>,
    #[serde(default)]
    pub roots: Vec<String>,
    /// The named-object table handed to profiling scripts.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub named: IndexMap<String, String>,
}

impl HeapFixture {
    pub fn from_json(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FixtureObject {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prototype: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, FixtureValue>,
    /// Non-enumerable properties.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub hidden: IndexMap<String, FixtureValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FixtureFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<FixtureExtended>,
    /// Engine-internal edges to other objects.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub internal: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixtureValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    /// A reference to another fixture object, by id.
    Object(String),
    Accessor {
        getter: String,
        returns: Box<FixtureValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FixtureFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default = "default_line")]
    pub line_start: u32,
    #[serde(default = "default_line")]
    pub line_extent: u32,
    #[serde(default)]
    pub function_size: usize,
    #[serde(default)]
    pub script_size: usize,
}

fn default_line() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FixtureExtended {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<String>,
}
