// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

mod builtins;
pub mod common;
pub mod identity;
pub mod inspector;
pub mod mirror;
pub(crate) mod resource_watchdog;
pub mod runtime;
pub mod session;
mod socket;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod v8_platform;
pub mod walker;

pub use common::ProfilerError;
pub use session::{profile_memory, ProfilerSession, SessionPhase};
