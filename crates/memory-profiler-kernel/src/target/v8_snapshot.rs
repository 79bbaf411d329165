// Unless explicitly stated otherwise all files in this repository are licensed under the Apache License, Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2024 Datadog, Inc.

//! Imports the heap of a live v8 isolate.
//!
//! v8 offers no way to walk an isolate's object graph from outside, but it can serialize the graph as a
//! heap snapshot. The snapshot is converted into a [`ManagedHeap`], which can then be profiled.

use crate::target::managed_heap::ManagedHeap;
use crate::target::monitor::ExecutionMonitor;
use crate::target::{FunctionMetadata, GcThing, ObjectRef, PropertyKey, TargetValue};
use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    snapshot: SnapshotHeader,
    nodes: Vec<u64>,
    edges: Vec<u64>,
    strings: Vec<String>,
    #[serde(default)]
    locations: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct SnapshotHeader {
    meta: SnapshotMeta,
}

#[derive(Debug, Deserialize)]
struct SnapshotMeta {
    node_fields: Vec<String>,
    node_types: Vec<serde_json::Value>,
    edge_fields: Vec<String>,
    edge_types: Vec<serde_json::Value>,
    #[serde(default)]
    location_fields: Vec<String>,
}

/// How a snapshot node is represented in the imported heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NodeRole {
    /// A script-visible object.
    Object,
    String,
    /// An engine-internal node whose outgoing edges are attributed to whoever points at it.
    Transparent,
    /// A node with no meaning for profiling (code, maps, symbols).
    Dropped,
}

fn node_role(node_type: &str) -> NodeRole {
    match node_type {
        "object" | "closure" | "regexp" | "native" => NodeRole::Object,
        "string" | "concatenated string" | "sliced string" => NodeRole::String,
        "hidden" | "array" | "synthetic" => NodeRole::Transparent,
        _ => NodeRole::Dropped,
    }
}

/// A parsed snapshot with resolved field offsets.
struct SnapshotGraph {
    raw: RawSnapshot,
    node_width: usize,
    edge_width: usize,
    node_type_offset: usize,
    node_name_offset: usize,
    node_size_offset: usize,
    node_edge_count_offset: usize,
    edge_type_offset: usize,
    edge_name_offset: usize,
    edge_to_offset: usize,
    node_type_names: Vec<String>,
    edge_type_names: Vec<String>,
    /// The index of each node's first edge in `raw.edges`.
    first_edge: Vec<usize>,
}

struct Edge<'a> {
    kind: &'a str,
    name_or_index: u64,
    to: usize,
}

impl SnapshotGraph {
    fn new(raw: RawSnapshot) -> anyhow::Result<Self> {
        let meta = &raw.snapshot.meta;
        let field = |fields: &[String], name: &str| -> anyhow::Result<usize> {
            fields
                .iter()
                .position(|f| f == name)
                .ok_or_else(|| anyhow!("heap snapshot is missing the `{}` field", name))
        };
        let type_names = |types: &[serde_json::Value]| -> anyhow::Result<Vec<String>> {
            let names = types
                .first()
                .and_then(serde_json::Value::as_array)
                .ok_or_else(|| anyhow!("heap snapshot has no type enumeration"))?;
            Ok(names
                .iter()
                .map(|name| name.as_str().unwrap_or_default().to_string())
                .collect())
        };

        let node_width = meta.node_fields.len();
        let edge_width = meta.edge_fields.len();
        if node_width == 0 || edge_width == 0 {
            bail!("heap snapshot declares no node or edge fields");
        }
        if raw.nodes.len() % node_width != 0 || raw.edges.len() % edge_width != 0 {
            bail!("heap snapshot arrays do not match their declared fields");
        }

        let mut graph = Self {
            node_width,
            edge_width,
            node_type_offset: field(&meta.node_fields, "type")?,
            node_name_offset: field(&meta.node_fields, "name")?,
            node_size_offset: field(&meta.node_fields, "self_size")?,
            node_edge_count_offset: field(&meta.node_fields, "edge_count")?,
            edge_type_offset: field(&meta.edge_fields, "type")?,
            edge_name_offset: field(&meta.edge_fields, "name_or_index")?,
            edge_to_offset: field(&meta.edge_fields, "to_node")?,
            node_type_names: type_names(&meta.node_types)?,
            edge_type_names: type_names(&meta.edge_types)?,
            first_edge: Vec::new(),
            raw,
        };

        let mut next_edge: usize = 0;
        let mut first_edge = Vec::with_capacity(graph.node_count());
        for node in 0..graph.node_count() {
            first_edge.push(next_edge);
            next_edge = usize::try_from(graph.node_field(node, graph.node_edge_count_offset))
                .ok()
                .and_then(|count| next_edge.checked_add(count))
                .ok_or_else(|| anyhow!("heap snapshot node {} has an invalid edge count", node))?;
        }
        if next_edge.checked_mul(graph.edge_width) != Some(graph.raw.edges.len()) {
            bail!("heap snapshot edge counts do not match the edge array");
        }
        graph.first_edge = first_edge;

        for edge in 0..next_edge {
            let to_node = graph.raw.edges[edge * graph.edge_width + graph.edge_to_offset];
            if graph.node_index(to_node).is_none() {
                bail!("heap snapshot edge {} points at invalid node offset {}", edge, to_node);
            }
        }
        Ok(graph)
    }

    /// Converts a node offset into the node array into a node index, if it names a node.
    fn node_index(&self, offset: u64) -> Option<usize> {
        let offset = usize::try_from(offset).ok()?;
        let node = offset / self.node_width;
        (offset % self.node_width == 0 && node < self.node_count()).then_some(node)
    }

    fn node_count(&self) -> usize {
        self.raw.nodes.len() / self.node_width
    }

    fn node_field(&self, node: usize, offset: usize) -> u64 {
        self.raw.nodes[node * self.node_width + offset]
    }

    fn node_type(&self, node: usize) -> &str {
        let type_idx = self.node_field(node, self.node_type_offset) as usize;
        self.node_type_names
            .get(type_idx)
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn node_name(&self, node: usize) -> &str {
        self.string(self.node_field(node, self.node_name_offset))
    }

    fn string(&self, idx: u64) -> &str {
        self.raw
            .strings
            .get(idx as usize)
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn edges(&self, node: usize) -> impl Iterator<Item = Edge<'_>> + '_ {
        let count = self.node_field(node, self.node_edge_count_offset) as usize;
        let first = self.first_edge[node];
        (first..first + count).map(move |edge| {
            let base = edge * self.edge_width;
            let type_idx = self.raw.edges[base + self.edge_type_offset] as usize;
            Edge {
                kind: self
                    .edge_type_names
                    .get(type_idx)
                    .map(String::as_str)
                    .unwrap_or_default(),
                name_or_index: self.raw.edges[base + self.edge_name_offset],
                // Every `to_node` was validated when the graph was built.
                to: self
                    .node_index(self.raw.edges[base + self.edge_to_offset])
                    .unwrap_or_default(),
            }
        })
    }

    /// The first lines of closures, keyed by node index, from the optional `locations` table.
    /// Entries naming no node, or a line that does not fit a `u32`, are skipped.
    fn closure_lines(&self) -> HashMap<usize, u32> {
        let fields = &self.raw.snapshot.meta.location_fields;
        let (Some(object), Some(line)) = (
            fields.iter().position(|f| f == "object_index"),
            fields.iter().position(|f| f == "line"),
        ) else {
            return HashMap::new();
        };
        self.raw
            .locations
            .chunks_exact(fields.len())
            .filter_map(|loc| {
                let node = self.node_index(loc[object])?;
                let line = u32::try_from(loc[line]).ok()?.checked_add(1)?;
                Some((node, line))
            })
            .collect()
    }
}

/// A `deno_core` runtime hosting target code, whose heap can be captured for profiling.
///
/// Target scripts run inside a frame of the runtime's [`ExecutionMonitor`]. Captured heaps share that
/// monitor, so a profiling session refuses them while another thread is still running target code.
pub struct TargetScriptRuntime {
    runtime: deno_core::JsRuntime,
    monitor: Arc<ExecutionMonitor>,
}

impl TargetScriptRuntime {
    pub fn new(runtime: deno_core::JsRuntime) -> Self {
        Self {
            runtime,
            monitor: Arc::new(ExecutionMonitor::new()),
        }
    }

    /// Runs `source` as target code, holding an active frame for the duration of the call.
    pub fn execute_script(&mut self, name: &'static str, source: String) -> anyhow::Result<()> {
        let _frame = self.monitor.enter();
        self.runtime
            .execute_script(name, source)
            .map(|_| ())
            .map_err(|err| anyhow!("{err}"))
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    /// A handle that can terminate the running target script from another thread.
    pub fn isolate_handle(&mut self) -> deno_core::v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// Takes a heap snapshot of the target isolate and imports it.
    pub fn capture_heap(&mut self) -> anyhow::Result<ManagedHeap> {
        let mut serialized = Vec::new();
        self.runtime.v8_isolate().take_heap_snapshot(|chunk| {
            serialized.extend_from_slice(chunk);
            true
        });
        build_heap(&serialized, ManagedHeap::with_monitor(Arc::clone(&self.monitor)))
    }
}

/// Builds a [`ManagedHeap`] from a serialized v8 heap snapshot.
///
/// Script-visible objects keep their constructor name as class and their self size. Property and
/// element edges become properties, other edges become internal edges. Engine-internal nodes are
/// collapsed so that whatever they point at is attributed to the object referencing them.
pub fn import_snapshot(serialized: &[u8]) -> anyhow::Result<ManagedHeap> {
    build_heap(serialized, ManagedHeap::new())
}

fn build_heap(serialized: &[u8], heap: ManagedHeap) -> anyhow::Result<ManagedHeap> {
    let raw: RawSnapshot =
        serde_json::from_slice(serialized).context("heap snapshot is not valid JSON")?;
    let graph = SnapshotGraph::new(raw)?;
    let roles: Vec<NodeRole> = (0..graph.node_count())
        .map(|node| node_role(graph.node_type(node)))
        .collect();
    let closure_lines = graph.closure_lines();

    let mut objects: HashMap<usize, ObjectRef> = HashMap::new();
    let mut strings = HashMap::new();
    for node in 0..graph.node_count() {
        match roles[node] {
            NodeRole::Object => {
                let size = graph.node_field(node, graph.node_size_offset) as usize;
                let object = if graph.node_type(node) == "closure" {
                    let name = graph.node_name(node);
                    heap.alloc_function(FunctionMetadata {
                        function_size: size,
                        script_size: 0,
                        name: (!name.is_empty()).then(|| heap.new_string(name)),
                        filename: None,
                        line_start: closure_lines.get(&node).copied().unwrap_or(0),
                        line_extent: 1,
                    })
                } else {
                    heap.alloc_object(graph.node_name(node))
                };
                heap.set_size(object, size);
                objects.insert(node, object);
            }
            NodeRole::String => {
                strings.insert(node, heap.new_string(graph.node_name(node)));
            }
            NodeRole::Transparent | NodeRole::Dropped => {}
        }
    }

    let thing_for = |node: usize| -> Option<GcThing> {
        match roles[node] {
            NodeRole::Object => objects.get(&node).copied().map(GcThing::Object),
            NodeRole::String => strings.get(&node).cloned().map(GcThing::String),
            _ => None,
        }
    };

    // Follows edges through transparent nodes, reporting every object or string reached.
    let collapse = |start: usize, visit: &mut dyn FnMut(GcThing)| {
        let mut seen = HashSet::from([start]);
        let mut worklist = vec![start];
        while let Some(node) = worklist.pop() {
            for edge in graph.edges(node) {
                if edge.kind == "weak" || !seen.insert(edge.to) {
                    continue;
                }
                if roles[edge.to] == NodeRole::Transparent {
                    worklist.push(edge.to);
                } else if let Some(thing) = thing_for(edge.to) {
                    visit(thing);
                }
            }
        }
    };

    for (&node, &object) in &objects {
        for edge in graph.edges(node) {
            if edge.kind == "weak" {
                continue;
            }
            let named = !matches!(edge.kind, "element" | "hidden");
            let value = match roles[edge.to] {
                NodeRole::Object => objects.get(&edge.to).map(|o| TargetValue::Object(*o)),
                NodeRole::String => strings.get(&edge.to).map(|s| TargetValue::String(s.clone())),
                NodeRole::Transparent => {
                    collapse(edge.to, &mut |thing| heap.add_internal_edge(object, thing));
                    None
                }
                NodeRole::Dropped => None,
            };
            let Some(value) = value else {
                continue;
            };
            if named && graph.string(edge.name_or_index) == "__proto__" {
                if let TargetValue::Object(proto) = value {
                    heap.set_prototype(object, Some(proto));
                }
                continue;
            }
            match edge.kind {
                "property" => {
                    let name = graph.string(edge.name_or_index).to_string();
                    heap.set_property(object, PropertyKey::Name(name), value);
                }
                "element" => {
                    let key = match u32::try_from(edge.name_or_index) {
                        Ok(idx) => PropertyKey::Index(idx),
                        Err(_) => PropertyKey::Name(edge.name_or_index.to_string()),
                    };
                    heap.set_property(object, key, value);
                }
                _ => {
                    if let Some(thing) = value.as_gc_thing() {
                        heap.add_internal_edge(object, thing);
                    }
                }
            }
        }
    }

    // The first node is the synthetic snapshot root.
    if graph.node_count() > 0 {
        collapse(0, &mut |thing| heap.add_root(thing));
    }
    Ok(heap)
}

#[cfg(test)]
mod tests {
    use super::{import_snapshot, TargetScriptRuntime};
    use crate::model::profile::{ProfileRequestBuilder, ProfileResult, ProfilerOptions};
    use crate::profiler::test_utils::cfg_test_v8;
    use crate::profiler::{profile_memory, ProfilerError};
    use crate::target::{
        GcThing, ManagedHeap, ObjectRef, PropertyLookup, TargetRuntime, TargetValue,
    };
    use std::sync::{mpsc, Arc};
    use std::time::{Duration, Instant};

    const SNAPSHOT: &str = r#"{
        "snapshot": {
            "meta": {
                "node_fields": ["type", "name", "id", "self_size", "edge_count"],
                "node_types": [["hidden", "object", "string", "synthetic", "closure"], "string", "number", "number", "number"],
                "edge_fields": ["type", "name_or_index", "to_node"],
                "edge_types": [["property", "element", "internal", "hidden", "weak"], "string_or_number", "node"]
            },
            "node_count": 7,
            "edge_count": 6
        },
        "nodes": [
            3, 0, 1, 0, 1,
            3, 1, 3, 0, 1,
            1, 2, 5, 48, 3,
            2, 3, 7, 16, 0,
            1, 2, 9, 32, 0,
            0, 4, 11, 24, 1,
            4, 5, 13, 56, 0
        ],
        "edges": [
            3, 0, 5,
            1, 0, 10,
            0, 6, 15,
            2, 7, 20,
            2, 8, 25,
            2, 9, 30
        ],
        "strings": ["(root)", "(GC roots)", "Object", "hi", "system / Context", "onload", "greeting", "__proto__", "context", "closure"]
    }"#;

    #[test]
    fn imports_objects_through_internal_nodes() {
        let heap = import_snapshot(SNAPSHOT.as_bytes()).unwrap();
        assert_eq!(heap.object_count(), 3);
        let (object, proto, closure) = (ObjectRef(0), ObjectRef(1), ObjectRef(2));

        let mut roots = Vec::new();
        heap.trace_roots(&mut |thing| {
            if let GcThing::Object(obj) = thing {
                roots.push(obj);
            }
        });
        assert_eq!(roots, vec![object]);

        assert_eq!(heap.size_of(object), 48);
        assert_eq!(heap.prototype(object), Some(proto));
        let greeting = heap.lookup_property(object, &"greeting".into()).unwrap();
        assert!(matches!(greeting, PropertyLookup::Value(TargetValue::String(s)) if s.to_string() == "hi"));

        // The closure is only reachable through the hidden context node.
        let mut children = Vec::new();
        heap.trace_children(object, &mut |thing| {
            if let GcThing::Object(obj) = thing {
                children.push(obj);
            }
        });
        assert!(children.contains(&closure));
        let function = heap.function_info(closure).unwrap();
        assert_eq!(function.name.unwrap().to_string(), "onload");
    }

    #[test]
    fn malformed_snapshot_is_rejected() {
        assert!(import_snapshot(b"{}").is_err());
        assert!(import_snapshot(b"not json").is_err());
    }

    /// Builds a two-node snapshot whose only edge points at `to_node`.
    fn single_edge_snapshot(to_node: u64, locations: &str) -> String {
        format!(
            r#"{{
                "snapshot": {{
                    "meta": {{
                        "node_fields": ["type", "name", "id", "self_size", "edge_count"],
                        "node_types": [["synthetic", "closure"], "string", "number", "number", "number"],
                        "edge_fields": ["type", "name_or_index", "to_node"],
                        "edge_types": [["element"], "string_or_number", "node"],
                        "location_fields": ["object_index", "script_id", "line", "column"]
                    }}
                }},
                "nodes": [0, 0, 1, 0, 1, 1, 1, 3, 16, 0],
                "edges": [0, 0, {to_node}],
                "strings": ["(root)", "onload"],
                "locations": [{locations}]
            }}"#
        )
    }

    #[test]
    fn edges_to_invalid_nodes_are_rejected() {
        let heap = import_snapshot(single_edge_snapshot(5, "").as_bytes()).unwrap();
        assert_eq!(heap.object_count(), 1);
        // Past the end of the node array.
        let err = import_snapshot(single_edge_snapshot(10, "").as_bytes()).unwrap_err();
        assert!(err.to_string().contains("invalid node offset"), "{err}");
        // Inside a node rather than at its start.
        assert!(import_snapshot(single_edge_snapshot(3, "").as_bytes()).is_err());
        assert!(import_snapshot(single_edge_snapshot(u64::MAX, "").as_bytes()).is_err());
    }

    #[test]
    fn out_of_range_locations_are_skipped() {
        let heap =
            import_snapshot(single_edge_snapshot(5, "5, 1, 4294967295, 0, 50, 1, 2, 0").as_bytes())
                .unwrap();
        let function = heap.function_info(ObjectRef(0)).unwrap();
        assert_eq!(function.line_start, 0);

        let heap = import_snapshot(single_edge_snapshot(5, "5, 1, 9, 0").as_bytes()).unwrap();
        let function = heap.function_info(ObjectRef(0)).unwrap();
        assert_eq!(function.line_start, 10);
    }

    #[test]
    fn captures_a_live_isolate() {
        let mut runtime = TargetScriptRuntime::new(cfg_test_v8().new_target_runtime());
        runtime
            .execute_script(
                "target.js",
                "globalThis.profilerMarker = { label: 'marker-value' };".to_string(),
            )
            .unwrap();
        assert_eq!(runtime.monitor().current_depth(), 0);
        let heap = runtime.capture_heap().unwrap();

        let marker = (0..heap.object_count() as u32).map(ObjectRef).find(|obj| {
            matches!(
                heap.lookup_property(*obj, &"label".into()),
                Ok(PropertyLookup::Value(TargetValue::String(s))) if s.to_string() == "marker-value"
            )
        });
        assert!(marker.is_some());
    }

    #[test]
    fn running_target_scripts_block_profiling() {
        let v8 = cfg_test_v8();
        let (started_tx, started_rx) = mpsc::channel();
        let request = || {
            ProfileRequestBuilder::default()
                .script("return 1;")
                .filename("test.js")
                .build()
                .unwrap()
        };

        std::thread::scope(|s| {
            let worker = s.spawn(move || {
                let mut runtime = TargetScriptRuntime::new(v8.new_target_runtime());
                started_tx
                    .send((runtime.isolate_handle(), Arc::clone(runtime.monitor())))
                    .unwrap();
                runtime.execute_script("spin.js", "while (true) {}".to_string())
            });
            let (handle, monitor) = started_rx.recv().unwrap();
            let deadline = Instant::now() + Duration::from_secs(10);
            while !monitor.has_foreign_frame() {
                assert!(Instant::now() < deadline, "target script never started");
                std::thread::sleep(Duration::from_millis(5));
            }

            let heap = Arc::new(ManagedHeap::with_monitor(Arc::clone(&monitor)));
            assert!(heap.has_foreign_active_frame());
            let result = profile_memory(
                Arc::clone(&heap) as Arc<dyn TargetRuntime>,
                request(),
                &ProfilerOptions::default(),
            );
            assert_eq!(result, Err(ProfilerError::ConcurrentTargetExecution));

            handle.terminate_execution();
            assert!(worker.join().unwrap().is_err());
            let result = profile_memory(heap, request(), &ProfilerOptions::default());
            assert_eq!(result, Ok(ProfileResult::Integer(1)));
        });
    }
}
