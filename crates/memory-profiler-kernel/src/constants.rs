// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION: &str = match option_env!("GITHUB_SHA") {
    Some(sha) => sha,
    None => "development",
};

/// The heap budget of the profiling runtime when no configuration overrides it.
pub const DEFAULT_HEAP_BUDGET_MB: usize = 32;

/// The name of the configuration file looked up next to the profiling script.
pub const CONFIG_FILE_NAME: &str = "memory-profiler.yml";
