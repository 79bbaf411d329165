// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::{fs, process};

use anyhow::{anyhow, Context};
use cli::{CliError, CliPreparation, HeapSource, ProfileRun};
use error_codes::{
    ERROR_GENERAL, ERROR_INVALID_ARGUMENT, ERROR_OUT_OF_MEMORY, ERROR_PROFILING_FAILED,
};
use kernel::model::heap_fixture::HeapFixture;
use kernel::model::profile::{ProfileRequestBuilder, ProfileResult};
use kernel::profiler::v8_platform::{Initialized, V8Platform};
use kernel::profiler::ProfilerError;
use kernel::target::fixture::load_fixture;
use kernel::target::v8_snapshot::TargetScriptRuntime;
use kernel::target::{ManagedHeap, ObjectRef, TargetRuntime};
use thiserror::Error;

mod cli;
mod error_codes;

#[derive(Debug, Error)]
enum RunError {
    #[error("{0:#}")]
    Setup(#[from] anyhow::Error),
    #[error(transparent)]
    Profiler(#[from] ProfilerError),
}

/// Starts the process
///
/// # Panics
///
/// This function will exit the process when it finds an error.
pub fn start() {
    match cli::prepare_run() {
        Err(e) => {
            eprintln!("Error found: {e}");
            match e {
                CliError::Parsing(_) => process::exit(ERROR_INVALID_ARGUMENT),
                _ => process::exit(ERROR_GENERAL),
            }
        }
        Ok(CliPreparation::NoRun) => {
            // don't do anything, just exit with 0 code
        }
        Ok(CliPreparation::Run(run)) => {
            let v8 = crate::V8_PLATFORM.get().expect("v8 should have been initialized");
            let outcome = execute(v8, &run).and_then(|result| write_result(&run, &result));
            if let Err(e) = outcome {
                eprintln!("Error found: {e}");
                let code = match e {
                    RunError::Profiler(ProfilerError::OutOfMemory) => ERROR_OUT_OF_MEMORY,
                    RunError::Profiler(ProfilerError::ProfilingFailed) => ERROR_PROFILING_FAILED,
                    _ => ERROR_GENERAL,
                };
                // `process::exit` skips destructors, so flush the file logs first.
                drop(run);
                process::exit(code);
            }
        }
    }
}

fn execute(v8: &V8Platform<Initialized>, run: &ProfileRun) -> Result<ProfileResult, RunError> {
    let script = fs::read_to_string(&run.script_path)
        .with_context(|| format!("unable to read script {}", run.script_path.display()))?;
    let (heap, named_objects) = load_heap(v8, &run.heap_source)?;
    tracing::debug!(
        objects = heap.object_count(),
        named = named_objects.is_some(),
        "profiling target heap loaded"
    );

    let mut builder = ProfileRequestBuilder::default();
    builder
        .script(script)
        .filename(run.script_path.display().to_string())
        .start_line(run.start_line);
    if let Some(named_objects) = named_objects {
        builder.named_objects(named_objects);
    }
    if let Some(argument) = &run.argument {
        builder.argument(heap.new_string(argument));
    }
    let request = builder.build().context("invalid profile request")?;

    let target: Arc<dyn TargetRuntime> = Arc::new(heap);
    Ok(v8.profile(target, request, &run.options)?)
}

/// Builds the heap the profiling script inspects, along with its named-object table.
fn load_heap(
    v8: &V8Platform<Initialized>,
    source: &HeapSource,
) -> anyhow::Result<(ManagedHeap, Option<ObjectRef>)> {
    match source {
        HeapSource::Fixture(path) => {
            let contents = read_file(path)?;
            let fixture = match path.extension().and_then(OsStr::to_str) {
                Some("yml" | "yaml") => HeapFixture::from_yaml(&contents)?,
                _ => HeapFixture::from_json(&contents)?,
            };
            let loaded = load_fixture(&fixture)
                .with_context(|| format!("invalid fixture {}", path.display()))?;
            Ok((loaded.heap, loaded.named_objects))
        }
        HeapSource::TargetScript(path) => {
            let source = read_file(path)?;
            // The target runtime is dropped before the profiling runtime is created.
            let mut runtime = TargetScriptRuntime::new(v8.new_target_runtime());
            runtime
                .execute_script("<target>", source)
                .map_err(|err| anyhow!("target script {} failed: {err:#}", path.display()))?;
            Ok((runtime.capture_heap()?, None))
        }
        HeapSource::Empty => Ok((ManagedHeap::new(), None)),
    }
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))
}

fn write_result(run: &ProfileRun, result: &ProfileResult) -> Result<(), RunError> {
    let json = serde_json::to_string_pretty(result).context("unable to serialize result")?;
    match &run.output {
        None => println!("{json}"),
        Some(path) => {
            fs::write(path, json).with_context(|| format!("unable to write {}", path.display()))?;
        }
    }
    Ok(())
}
