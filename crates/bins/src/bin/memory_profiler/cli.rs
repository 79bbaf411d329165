// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use getopts::{Fail, Matches, Options};
use kernel::config_file::parse_config_file;
use kernel::constants::{CARGO_VERSION, CONFIG_FILE_NAME, VERSION};
use kernel::model::profile::ProfilerOptions;
use kernel::target::Enumeration;
use std::path::{Path, PathBuf};
use std::{env, fs};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} -s script.js [options]", program);
    print!("{}", opts.usage(&brief));
}

fn get_opts() -> Options {
    let mut opts = Options::new();
    opts.optopt("s", "script", "the profiling script", "/path/to/script.js");
    opts.optopt(
        "f",
        "fixture",
        "a JSON or YAML heap fixture to profile",
        "/path/to/heap.yml",
    );
    opts.optopt(
        "t",
        "target",
        "a JavaScript file whose resulting heap is profiled",
        "/path/to/target.js",
    );
    opts.optopt(
        "a",
        "argument",
        "a string exposed to the profiling script as `argument`",
        "VALUE",
    );
    opts.optopt(
        "n",
        "start-line",
        "the line number of the first line of the script",
        "1",
    );
    opts.optopt(
        "c",
        "config",
        "the configuration file (defaults to memory-profiler.yml next to the script)",
        "/path/to/memory-profiler.yml",
    );
    opts.optopt("b", "heap-budget", "heap budget of the profiling runtime, in MiB", "32");
    opts.optopt(
        "e",
        "enumeration",
        "default property enumeration: standard or class-iterator",
        "standard",
    );
    opts.optopt("o", "output", "write the JSON result to a file", "/path/to/result.json");
    opts.optflag("h", "help", "print this help");
    opts.optflag("v", "version", "shows the tool version");
    opts.optflag(
        "l",
        "logs",
        "Enables logs to a file. Usually /tmp/memory-profiler/logs",
    );
    opts
}

fn get_log_dir() -> PathBuf {
    let mut log_dir = env::temp_dir();
    log_dir.push("memory-profiler/logs");
    log_dir
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Error parsing arguments: {0:?}")]
    Parsing(#[from] Fail),
    #[error("A profiling script must be provided with --script.")]
    MissingScript,
    #[error("Only one of --fixture and --target can be provided.")]
    ConflictingHeapSources,
    #[error("Invalid start line {0:?}. It must be a positive number.")]
    InvalidStartLine(String),
    #[error("Invalid heap budget {0:?}. It must be a positive number of MiB.")]
    InvalidHeapBudget(String),
    #[error("Invalid enumeration {0:?}. It must be `standard` or `class-iterator`.")]
    InvalidEnumeration(String),
    #[error("Invalid configuration file {path:?}: {message}")]
    Config { path: PathBuf, message: String },
}

/// Where the profiled heap comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum HeapSource {
    Fixture(PathBuf),
    TargetScript(PathBuf),
    Empty,
}

#[derive(Debug)]
pub struct ProfileRun {
    pub script_path: PathBuf,
    pub start_line: u32,
    pub heap_source: HeapSource,
    pub argument: Option<String>,
    pub options: ProfilerOptions,
    pub output: Option<PathBuf>,
    /// Flushes the file logs when dropped.
    pub guard: Option<WorkerGuard>,
}

pub enum CliPreparation {
    Run(ProfileRun),
    NoRun,
}

/// Parses the process arguments, sets up tracing and resolves the profiler options.
pub fn prepare_run() -> Result<CliPreparation, CliError> {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();
    let opts = get_opts();

    let matches = opts.parse(&args[1..])?;

    if matches.opt_present("v") {
        println!("Version: {}, revision: {}", CARGO_VERSION, VERSION);
        return Ok(CliPreparation::NoRun);
    }

    if matches.opt_present("h") {
        print_usage(&program, &opts);
        return Ok(CliPreparation::NoRun);
    }

    let guard = if matches.opt_present("l") {
        let log_dir = get_log_dir();
        let pid = std::process::id();
        let file_appender = tracing_appender::rolling::daily(log_dir, format!("profiler.{pid}.log"));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .json()
            .with_writer(non_blocking)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
        None
    };

    let run = parse_run(&matches, guard)?;
    Ok(CliPreparation::Run(run))
}

fn parse_run(matches: &Matches, guard: Option<WorkerGuard>) -> Result<ProfileRun, CliError> {
    let script_path = matches
        .opt_str("s")
        .map(PathBuf::from)
        .ok_or(CliError::MissingScript)?;

    let start_line = match matches.opt_str("n") {
        None => 1,
        Some(line) => match line.parse::<u32>() {
            Ok(parsed) if parsed > 0 => parsed,
            _ => return Err(CliError::InvalidStartLine(line)),
        },
    };

    Ok(ProfileRun {
        heap_source: heap_source(matches)?,
        options: resolve_options(matches, &script_path)?,
        script_path,
        start_line,
        argument: matches.opt_str("a"),
        output: matches.opt_str("o").map(PathBuf::from),
        guard,
    })
}

fn heap_source(matches: &Matches) -> Result<HeapSource, CliError> {
    match (matches.opt_str("f"), matches.opt_str("t")) {
        (Some(_), Some(_)) => Err(CliError::ConflictingHeapSources),
        (Some(fixture), None) => Ok(HeapSource::Fixture(PathBuf::from(fixture))),
        (None, Some(target)) => Ok(HeapSource::TargetScript(PathBuf::from(target))),
        (None, None) => Ok(HeapSource::Empty),
    }
}

/// Reads the configuration file (if any), then applies the command-line overrides on top of it.
fn resolve_options(matches: &Matches, script_path: &Path) -> Result<ProfilerOptions, CliError> {
    let config_path = match matches.opt_str("c") {
        Some(path) => Some(PathBuf::from(path)),
        None => script_path
            .parent()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .filter(|path| path.is_file()),
    };

    let mut options = match config_path {
        None => ProfilerOptions::default(),
        Some(path) => {
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|contents| parse_config_file(&contents));
            match parsed {
                Ok(options) => {
                    tracing::debug!(config = %path.display(), "using configuration file");
                    options
                }
                Err(err) => {
                    return Err(CliError::Config {
                        path,
                        message: err.to_string(),
                    })
                }
            }
        }
    };

    if let Some(budget) = matches.opt_str("b") {
        options.heap_budget_bytes = match budget.parse::<usize>() {
            Ok(mb) if mb > 0 => match mb.checked_mul(1024 * 1024) {
                Some(bytes) => bytes,
                None => return Err(CliError::InvalidHeapBudget(budget)),
            },
            _ => return Err(CliError::InvalidHeapBudget(budget)),
        };
    }

    if let Some(enumeration) = matches.opt_str("e") {
        options.default_enumeration = match enumeration.as_str() {
            "standard" => Enumeration::Standard,
            "class-iterator" => Enumeration::ClassIterator,
            _ => return Err(CliError::InvalidEnumeration(enumeration)),
        };
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::{get_opts, heap_source, parse_run, resolve_options, CliError, HeapSource};
    use kernel::constants::DEFAULT_HEAP_BUDGET_MB;
    use kernel::target::Enumeration;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn matches(args: &[&str]) -> getopts::Matches {
        get_opts().parse(args).unwrap()
    }

    #[test]
    fn script_is_required() {
        let res = parse_run(&matches(&["-f", "heap.yml"]), None);
        assert!(matches!(res, Err(CliError::MissingScript)));
    }

    #[test]
    fn run_defaults() {
        let run = parse_run(&matches(&["-s", "/nonexistent/script.js"]), None).unwrap();
        assert_eq!(run.script_path, PathBuf::from("/nonexistent/script.js"));
        assert_eq!(run.start_line, 1);
        assert_eq!(run.heap_source, HeapSource::Empty);
        assert!(run.argument.is_none());
        assert_eq!(
            run.options.heap_budget_bytes,
            DEFAULT_HEAP_BUDGET_MB * 1024 * 1024
        );
    }

    #[test]
    fn start_line_must_be_positive() {
        for line in ["0", "-3", "abc"] {
            let res = parse_run(&matches(&["-s", "a.js", "-n", line]), None);
            assert!(matches!(res, Err(CliError::InvalidStartLine(_))), "{line}");
        }
        let run = parse_run(&matches(&["-s", "a.js", "-n", "12"]), None).unwrap();
        assert_eq!(run.start_line, 12);
    }

    #[test]
    fn heap_sources_are_exclusive() {
        let res = heap_source(&matches(&["-f", "heap.yml", "-t", "target.js"]));
        assert!(matches!(res, Err(CliError::ConflictingHeapSources)));
        assert_eq!(
            heap_source(&matches(&["-t", "target.js"])).unwrap(),
            HeapSource::TargetScript(PathBuf::from("target.js"))
        );
    }

    #[test]
    fn config_next_to_script_is_picked_up_and_overridden() {
        let dir = std::env::temp_dir().join(format!("memory-profiler-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("memory-profiler.yml"),
            "schema-version: v1\nheap-budget-mb: 8\nenumeration: class-iterator\n",
        )
        .unwrap();
        let script = dir.join("script.js");

        let options = resolve_options(&matches(&[]), &script).unwrap();
        assert_eq!(options.heap_budget_bytes, 8 * 1024 * 1024);
        assert_eq!(options.default_enumeration, Enumeration::ClassIterator);

        let options = resolve_options(&matches(&["-b", "64", "-e", "standard"]), &script).unwrap();
        assert_eq!(options.heap_budget_bytes, 64 * 1024 * 1024);
        assert_eq!(options.default_enumeration, Enumeration::Standard);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let script = Path::new("/nonexistent/script.js");
        let res = resolve_options(&matches(&["-b", "0"]), script);
        assert!(matches!(res, Err(CliError::InvalidHeapBudget(_))));
        let huge = (usize::MAX / 2).to_string();
        let res = resolve_options(&matches(&["-b", huge.as_str()]), script);
        assert!(matches!(res, Err(CliError::InvalidHeapBudget(b)) if b == huge));
        let res = resolve_options(&matches(&["-e", "random"]), script);
        assert!(matches!(res, Err(CliError::InvalidEnumeration(_))));
        let res = resolve_options(&matches(&["-c", "/nonexistent/memory-profiler.yml"]), script);
        assert!(matches!(res, Err(CliError::Config { .. })));
    }
}
