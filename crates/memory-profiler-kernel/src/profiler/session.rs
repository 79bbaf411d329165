// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

use crate::model::profile::{ProfileRequest, ProfileResult, ProfilerOptions};
use crate::profiler::common::ProfilerError;
use crate::profiler::runtime::IsolatedRuntime;
use crate::target::{ObjectRef, TargetRuntime};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// The lifecycle of a [`ProfilerSession`]. Phases only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    RuntimeInitialized,
    MirroringInitialized,
    ObjectsInitialized,
    Running,
    Completed,
    Failed,
}

impl Display for SessionPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            SessionPhase::Created => "created",
            SessionPhase::RuntimeInitialized => "runtime-initialized",
            SessionPhase::MirroringInitialized => "mirroring-initialized",
            SessionPhase::ObjectsInitialized => "objects-initialized",
            SessionPhase::Running => "running",
            SessionPhase::Completed => "completed",
            SessionPhase::Failed => "failed",
        };
        f.write_str(str)
    }
}

/// One profiling session: a fresh profiling runtime, identity registry, and string mirror, used to
/// run a single script against `target`.
pub struct ProfilerSession {
    target: Arc<dyn TargetRuntime>,
    options: ProfilerOptions,
    phase: SessionPhase,
}

impl ProfilerSession {
    /// Creates a session, or fails if another thread is executing in `target`.
    pub fn new(
        target: Arc<dyn TargetRuntime>,
        options: &ProfilerOptions,
    ) -> Result<Self, ProfilerError> {
        if target.has_foreign_active_frame() {
            tracing::debug!("refusing to profile a target that is running on another thread");
            return Err(ProfilerError::ConcurrentTargetExecution);
        }
        Ok(Self {
            target,
            options: options.clone(),
            phase: SessionPhase::Created,
        })
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Runs the session to completion. A session runs at most once.
    ///
    /// Everything the session created is torn down before this returns, whether or not it succeeded.
    pub fn run(&mut self, request: ProfileRequest) -> Result<ProfileResult, ProfilerError> {
        if self.phase != SessionPhase::Created {
            return Err(ProfilerError::InvalidState("a profiling session runs only once"));
        }
        let result = self.advance(&request);
        match &result {
            Ok(_) => self.transition(SessionPhase::Completed),
            Err(err) => {
                tracing::debug!(
                    %err,
                    phase = %self.phase,
                    filename = %request.filename,
                    "profiling session failed"
                );
                self.transition(SessionPhase::Failed);
            }
        }
        result
    }

    fn advance(&mut self, request: &ProfileRequest) -> Result<ProfileResult, ProfilerError> {
        let mut runtime = IsolatedRuntime::start(self.options.heap_budget_bytes)?;
        self.transition(SessionPhase::RuntimeInitialized);

        runtime.attach_session(
            Arc::clone(&self.target),
            request.named_objects,
            self.options.default_enumeration,
        )?;
        self.transition(SessionPhase::MirroringInitialized);

        // The named table is walked after the GC roots so that its objects have identities even
        // if nothing else references them.
        let seeds: Vec<ObjectRef> = request.named_objects.into_iter().collect();
        runtime.with_session(|state| state.walker().discover_all(&seeds))??;
        self.transition(SessionPhase::ObjectsInitialized);

        self.transition(SessionPhase::Running);
        runtime.evaluate(
            &request.script,
            &request.filename,
            request.start_line,
            request.argument.as_ref(),
        )
    }

    fn transition(&mut self, next: SessionPhase) {
        tracing::debug!(from = %self.phase, to = %next, "profiling session transition");
        self.phase = next;
    }
}

/// Runs `request`'s script against `target` in a new profiling session.
///
/// The script sees the builtins `getObjectInfo`, `getObjectProperties`, `getObjectProperty`,
/// `getObjectParent`, `getNamedObjects`, `getObjectTable`, `getGCRoots`, and `ServerSocket`.
/// Its completion value (or the value of a top-level `return`) is the result.
pub fn profile_memory(
    target: Arc<dyn TargetRuntime>,
    request: ProfileRequest,
    options: &ProfilerOptions,
) -> Result<ProfileResult, ProfilerError> {
    ProfilerSession::new(target, options)?.run(request)
}

#[cfg(test)]
mod tests {
    use super::{profile_memory, ProfilerSession, SessionPhase};
    use crate::model::profile::{
        ProfileRequest, ProfileRequestBuilder, ProfileResult, ProfilerOptions,
    };
    use crate::profiler::common::ProfilerError;
    use crate::profiler::test_utils::{cfg_test_v8, sample_heap};
    use crate::target::{GcThing, ManagedHeap, TargetRuntime, TargetValue};
    use std::sync::{mpsc, Arc};

    fn request(script: &str) -> ProfileRequest {
        ProfileRequestBuilder::default()
            .script(script)
            .filename("test.js")
            .build()
            .unwrap()
    }

    /// Profiles the sample heap with its named table.
    fn profile_sample(script: &str) -> Result<ProfileResult, ProfilerError> {
        cfg_test_v8();
        let sample = sample_heap();
        let named = sample.named;
        let mut request = request(script);
        request.named_objects = Some(named);
        profile_memory(Arc::new(sample.heap), request, &ProfilerOptions::default())
    }

    #[test]
    fn single_root_without_properties() {
        cfg_test_v8();
        let heap = ManagedHeap::new();
        let root = heap.alloc_object("Object");
        heap.add_root(GcThing::Object(root));
        let script = "
            const roots = getGCRoots();
            const info = getObjectInfo(roots[0]);
            return roots.length === 1 && info.children.length === 0 && info.size >= 32
                && info.nativeClass === 'Object' && !('lineStart' in info);
        ";
        let result = profile_memory(Arc::new(heap), request(script), &ProfilerOptions::default());
        assert_eq!(result, Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn top_level_return() {
        cfg_test_v8();
        let result = profile_memory(
            Arc::new(ManagedHeap::new()),
            request("return 1+1;"),
            &ProfilerOptions::default(),
        );
        assert_eq!(result, Ok(ProfileResult::Integer(2)));
    }

    #[test]
    fn string_argument_round_trips() {
        cfg_test_v8();
        let heap = ManagedHeap::new();
        let argument = heap.new_string("hello");
        let request = ProfileRequestBuilder::default()
            .script("return argument;")
            .filename("test.js")
            .start_line(1u32)
            .argument(argument)
            .build()
            .unwrap();
        let result = profile_memory(Arc::new(heap), request, &ProfilerOptions::default());
        assert_eq!(result, Ok(ProfileResult::String("hello".to_string())));
    }

    #[test]
    fn named_objects_share_identities_with_the_walk() {
        let script = "
            const named = getNamedObjects();
            return getGCRoots()[0] === named.g
                && getObjectInfo('g').id === named.g
                && getObjectParent('doc') === named.g
                && getObjectInfo(getObjectParent('doc')).nativeClass === 'Window'
                && getObjectTable()[named.g] === 'Window';
        ";
        assert_eq!(profile_sample(script), Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn names_that_are_not_objects_resolve_to_null() {
        let script = "
            return getObjectInfo('label') === null
                && getObjectInfo('missing') === null
                && getNamedObjects().label === 'not an object'
                && getObjectInfo(0) === null
                && getObjectInfo(1e9) === null;
        ";
        assert_eq!(profile_sample(script), Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn names_without_a_table() {
        cfg_test_v8();
        let script = "
            return getObjectInfo('oof') === null
                && getObjectProperty('blarg', 'hi') === null
                && JSON.stringify(getNamedObjects()) === '{}';
        ";
        let result = profile_memory(
            Arc::new(ManagedHeap::new()),
            request(script),
            &ProfilerOptions::default(),
        );
        assert_eq!(result, Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn properties_are_mirrored() {
        let script = "
            const doc = getNamedObjects().doc;
            const props = getObjectProperties(doc);
            const alt = getObjectProperties('doc', true);
            return getObjectProperty('doc', 'title') === 'Example'
                && getObjectProperty(doc, 'ready') === true
                && getObjectProperty(doc, 'missing') === null
                && props.title === 'Example'
                && JSON.stringify(props) === JSON.stringify(alt)
                && typeof getObjectProperty('g', 'document') === 'number';
        ";
        assert_eq!(profile_sample(script), Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn reserved_property_names_are_plain_data() {
        cfg_test_v8();
        let heap = ManagedHeap::new();
        let root = heap.alloc_object("Object");
        heap.set_property(root, "x", TargetValue::Number(1.0));
        heap.set_property(root, "__proto__", TargetValue::Number(5.0));
        heap.add_root(GcThing::Object(root));
        let script = "
            const id = getGCRoots()[0];
            const props = getObjectProperties(id);
            return Object.keys(props).join(',') === 'x,__proto__'
                && props.__proto__ === 5
                && Object.getPrototypeOf(props) === Object.prototype
                && getObjectProperty(id, '__proto__') === 5;
        ";
        let result = profile_memory(Arc::new(heap), request(script), &ProfilerOptions::default());
        assert_eq!(result, Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn prototype_setters_do_not_intercept_results() {
        let script = "
            let hits = 0;
            for (const key of ['children', 'title', '0', '1', '2']) {
                Object.defineProperty(Object.prototype, key, {
                    set(_) { hits++; getGCRoots(); },
                    configurable: true,
                });
            }
            const info = getObjectInfo('g');
            const props = getObjectProperties('doc');
            const table = getObjectTable();
            return hits === 0
                && info.hasOwnProperty('children')
                && Array.isArray(info.children)
                && info.children.length > 0
                && info.children.hasOwnProperty('0')
                && props.hasOwnProperty('title')
                && Object.keys(table).length > 0;
        ";
        assert_eq!(profile_sample(script), Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn function_metadata_is_reported() {
        let script = "
            const info = getObjectInfo(getObjectProperty('g', 'helper'));
            return [info.name, info.filename, info.lineStart, info.lineEnd, info.scriptSize].join(',');
        ";
        assert_eq!(
            profile_sample(script),
            Ok(ProfileResult::String("helper,page.js,3,6,1024".to_string()))
        );
    }

    #[test]
    fn bad_targets_throw_catchable_type_errors() {
        let script = "
            try {
                getObjectInfo({});
                return 'no error';
            } catch (e) {
                return e instanceof TypeError && e.message === 'Argument must be an object ID or name.';
            }
        ";
        assert_eq!(profile_sample(script), Ok(ProfileResult::Boolean(true)));
    }

    #[test]
    fn uncaught_errors_fail_the_session() {
        cfg_test_v8();
        let mut session =
            ProfilerSession::new(Arc::new(ManagedHeap::new()), &ProfilerOptions::default())
                .unwrap();
        assert_eq!(session.phase(), SessionPhase::Created);
        let result = session.run(request("getObjectInfo(null);"));
        assert_eq!(result, Err(ProfilerError::ProfilingFailed));
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert!(matches!(
            session.run(request("1")),
            Err(ProfilerError::InvalidState(_))
        ));
    }

    #[test]
    fn completed_sessions_do_not_rerun() {
        cfg_test_v8();
        let mut session =
            ProfilerSession::new(Arc::new(ManagedHeap::new()), &ProfilerOptions::default())
                .unwrap();
        assert_eq!(session.run(request("'done'")), Ok(ProfileResult::String("done".to_string())));
        assert_eq!(session.phase(), SessionPhase::Completed);
        assert!(session.run(request("'again'")).is_err());
    }

    #[test]
    fn heap_budget_is_enforced() {
        cfg_test_v8();
        let options = ProfilerOptions {
            heap_budget_bytes: 16 * 1024 * 1024,
            ..Default::default()
        };
        let script = "const hog = []; while (true) { hog.push(new Array(100000).fill(1.5)); }";
        let result = profile_memory(Arc::new(ManagedHeap::new()), request(script), &options);
        assert_eq!(result, Err(ProfilerError::OutOfMemory));
    }

    #[test]
    fn concurrent_target_execution_is_rejected() {
        cfg_test_v8();
        let heap = Arc::new(ManagedHeap::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        std::thread::scope(|s| {
            let worker_heap = Arc::clone(&heap);
            s.spawn(move || {
                let _frame = worker_heap.monitor().enter();
                entered_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            });
            entered_rx.recv().unwrap();

            assert!(heap.has_foreign_active_frame());
            let result = profile_memory(
                Arc::clone(&heap) as Arc<dyn TargetRuntime>,
                request("return 1;"),
                &ProfilerOptions::default(),
            );
            assert_eq!(result, Err(ProfilerError::ConcurrentTargetExecution));
            done_tx.send(()).unwrap();
        });

        // The same target can be profiled once the other thread has left.
        let result = profile_memory(heap, request("return 1;"), &ProfilerOptions::default());
        assert_eq!(result, Ok(ProfileResult::Integer(1)));
    }

    #[test]
    fn server_socket_from_a_script() {
        cfg_test_v8();
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let script = format!(
            "
            const server = new ServerSocket();
            server.bind('127.0.0.1', {port});
            server.listen();
            const accepted = server.accept(20);
            server.close();
            let closed;
            try {{ server.listen(); }} catch (e) {{ closed = e.message; }}
            let foreign;
            try {{ ServerSocket.prototype.recv.call({{}}, 1); }} catch (e) {{
                foreign = e instanceof TypeError && e.message;
            }}
            return [accepted, closed, foreign].join('|');
            "
        );
        let result = profile_memory(
            Arc::new(ManagedHeap::new()),
            request(&script),
            &ProfilerOptions::default(),
        );
        assert_eq!(
            result,
            Ok(ProfileResult::String(
                "|Socket is closed.|ServerSocket method called on non-ServerSocket object."
                    .to_string()
            ))
        );
    }
}
