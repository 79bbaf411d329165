// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::model::profile::ProfilerOptions;
use crate::target::Enumeration;
use anyhow::{anyhow, Result};
use serde::de::{Error, Unexpected};
use serde::{Deserialize, Deserializer};

// Parses the provided YAML text, returning the profiler options.
pub fn parse_config_file(config_contents: &str) -> Result<ProfilerOptions> {
    let yaml_config: YamlConfigFile = serde_yaml::from_str(config_contents)?;
    yaml_config.try_into()
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct YamlConfigFile {
    #[serde(default)]
    #[allow(dead_code)]
    schema_version: SchemaVersion,
    heap_budget_mb: Option<usize>,
    enumeration: Option<Enumeration>,
}

// A marker for the schema version.
// No content because it's only deserialized if the schema version is correct.
#[derive(Default)]
struct SchemaVersion {}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == "v1" {
            Ok(SchemaVersion {})
        } else {
            Err(D::Error::invalid_value(
                Unexpected::Str(&version),
                &"v1",
            ))
        }
    }
}

impl TryFrom<YamlConfigFile> for ProfilerOptions {
    type Error = anyhow::Error;

    fn try_from(value: YamlConfigFile) -> Result<Self> {
        let defaults = ProfilerOptions::default();
        let heap_budget_bytes = match value.heap_budget_mb {
            Some(mb) => mb
                .checked_mul(1024 * 1024)
                .ok_or_else(|| anyhow!("heap-budget-mb {mb} is too large"))?,
            None => defaults.heap_budget_bytes,
        };
        Ok(ProfilerOptions {
            heap_budget_bytes,
            default_enumeration: value.enumeration.unwrap_or(defaults.default_enumeration),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::parse_config_file;
    use crate::constants::DEFAULT_HEAP_BUDGET_MB;
    use crate::target::Enumeration;

    #[test]
    fn empty_config_uses_defaults() {
        let options = parse_config_file("schema-version: v1\n").unwrap();
        assert_eq!(options.heap_budget_bytes, DEFAULT_HEAP_BUDGET_MB * 1024 * 1024);
        assert_eq!(options.default_enumeration, Enumeration::Standard);
    }

    #[test]
    fn config_overrides() {
        let options = parse_config_file(
            "schema-version: v1\nheap-budget-mb: 8\nenumeration: class-iterator\n",
        )
        .unwrap();
        assert_eq!(options.heap_budget_bytes, 8 * 1024 * 1024);
        assert_eq!(options.default_enumeration, Enumeration::ClassIterator);
    }

    #[test]
    fn wrong_schema_or_unknown_key_is_rejected() {
        assert!(parse_config_file("schema-version: v2\n").is_err());
        assert!(parse_config_file("heap-budget: 8\n").is_err());
    }

    #[test]
    fn oversized_heap_budget_is_rejected() {
        let yaml = format!("heap-budget-mb: {}\n", usize::MAX / 2);
        let err = parse_config_file(&yaml).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
