// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;

/// Tracks which threads currently have an active call frame in a target runtime.
#[derive(Debug, Default)]
pub struct ExecutionMonitor {
    frames: Mutex<HashMap<ThreadId, usize>>,
}

impl ExecutionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the calling thread as executing in the runtime until the returned guard is dropped.
    /// Frames nest.
    pub fn enter(&self) -> ActiveFrame<'_> {
        let thread = std::thread::current().id();
        *self.frames().entry(thread).or_insert(0) += 1;
        ActiveFrame {
            monitor: self,
            thread,
        }
    }

    /// Returns `true` if any thread other than the caller has an active frame.
    pub fn has_foreign_frame(&self) -> bool {
        let current = std::thread::current().id();
        self.frames()
            .iter()
            .any(|(thread, depth)| *thread != current && *depth > 0)
    }

    /// The frame depth of the calling thread.
    pub fn current_depth(&self) -> usize {
        let current = std::thread::current().id();
        self.frames().get(&current).copied().unwrap_or(0)
    }

    fn frames(&self) -> MutexGuard<'_, HashMap<ThreadId, usize>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exit(&self, thread: ThreadId) {
        let mut frames = self.frames();
        if let Some(depth) = frames.get_mut(&thread) {
            *depth -= 1;
            if *depth == 0 {
                frames.remove(&thread);
            }
        }
    }
}

/// A call frame held by one thread. See [`ExecutionMonitor::enter`].
#[derive(Debug)]
pub struct ActiveFrame<'a> {
    monitor: &'a ExecutionMonitor,
    thread: ThreadId,
}

impl Drop for ActiveFrame<'_> {
    fn drop(&mut self) {
        self.monitor.exit(self.thread);
    }
}
