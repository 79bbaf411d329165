// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

pub const ERROR_GENERAL: i32 = 1;
pub const ERROR_INVALID_ARGUMENT: i32 = 2;
pub const ERROR_PROFILING_FAILED: i32 = 3;
pub const ERROR_OUT_OF_MEMORY: i32 = 4;
