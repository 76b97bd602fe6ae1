// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! `GraphConfig<In, Out>` — the edge registry and vertex set for one graph instance
//! (spec.md §3 "GraphConfig", §4.6 "Graph deep-copy").

use std::thread::JoinHandle;

use crate::connector::Connector;
use crate::graph::edge::{EdgeDescriptor, EdgeKind};
use crate::payload::Payload;
use crate::task_manager::TaskManager;

/// Type-erased view of a [`TaskManager`], so a [`GraphConfig`] can hold task managers
/// of unrelated `In`/`Out` types in a single vertex set (spec.md §9 "a trait/interface
/// with only the erased operations... execute_thread").
pub trait GraphNode: Send {
    fn name(&self) -> &str;
    fn spawn(self: Box<Self>) -> Vec<JoinHandle<()>>;
}

impl<In: Payload, Out: Payload> GraphNode for TaskManager<In, Out> {
    fn name(&self) -> &str {
        TaskManager::name(self)
    }

    fn spawn(self: Box<Self>) -> Vec<JoinHandle<()>> {
        TaskManager::spawn(*self)
    }
}

/// One graph instance: its external input/output connectors, its vertex set, and the
/// edge descriptors recorded as it was built (spec.md §3 "GraphConfig").
///
/// `In`/`Out` are the graph's own external boundary types — the connector a caller
/// feeds with `produce_data` and the connector terminal tasks sink into. Every vertex
/// inside (however many distinct `Task<In, Out>` instantiations it's built from) is
/// erased to [`GraphNode`] once added.
pub struct GraphConfig<In: Payload, Out: Payload> {
    address: String,
    pipeline_id: usize,
    num_pipelines: usize,
    input: Connector<In>,
    output: Connector<Out>,
    nodes: Vec<Box<dyn GraphNode>>,
    edges: Vec<EdgeDescriptor>,
}

impl<In: Payload, Out: Payload> GraphConfig<In, Out> {
    pub fn new(
        address: impl Into<String>,
        pipeline_id: usize,
        num_pipelines: usize,
        input: Connector<In>,
        output: Connector<Out>,
    ) -> Self {
        GraphConfig {
            address: address.into(),
            pipeline_id,
            num_pipelines,
            input,
            output,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    pub fn num_pipelines(&self) -> usize {
        self.num_pipelines
    }

    pub fn input(&self) -> &Connector<In> {
        &self.input
    }

    pub fn output(&self) -> &Connector<Out> {
        &self.output
    }

    pub fn edges(&self) -> &[EdgeDescriptor] {
        &self.edges
    }

    /// Adds a vertex and records a producer-consumer descriptor for it (spec.md §4.6
    /// "Edge descriptors are first-class").
    pub fn add_task_manager(&mut self, node: impl GraphNode + 'static) -> &mut Self {
        self.edges.push(EdgeDescriptor::new(
            EdgeKind::ProducerConsumer,
            node.name().to_owned(),
            self.address.clone(),
        ));
        self.nodes.push(Box::new(node));
        self
    }

    /// Records a rule edge for diagnostics (the actual wiring happens when the
    /// bookkeeper's `RuleManager` is constructed with its output connector; this call
    /// only appends the bookkeeping record spec.md §4.6 describes).
    pub fn record_rule_edge(&mut self, bookkeeper: &str, rule: &str, consumer: &str) -> &mut Self {
        self.edges.push(EdgeDescriptor::new(
            EdgeKind::Rule,
            format!("{bookkeeper}::{rule}"),
            consumer.to_owned(),
        ));
        self
    }

    pub fn record_memory_edge(&mut self, task: &str, pool: &str) -> &mut Self {
        self.edges
            .push(EdgeDescriptor::new(EdgeKind::Memory, task.to_owned(), pool.to_owned()));
        self
    }

    /// Validates that every recorded edge names a vertex that was actually added
    /// (spec.md §7 "edge whose endpoint is not registered in the graph").
    pub fn validate(&self) -> crate::error::Result<()> {
        let known: std::collections::HashSet<&str> = self.nodes.iter().map(|n| n.name()).collect();
        for edge in &self.edges {
            if edge.kind == EdgeKind::ProducerConsumer && !known.contains(edge.from.as_str()) {
                return Err(crate::error::Error::configuration(format!(
                    "edge references unregistered task manager '{}'",
                    edge.from
                )));
            }
        }
        Ok(())
    }

    /// Spawns every vertex's worker threads (spec.md §4.7 "Runtime... for each
    /// TaskManager, spawn num_threads worker threads").
    pub fn spawn_all(self) -> Vec<JoinHandle<()>> {
        self.nodes.into_iter().flat_map(|n| n.spawn()).collect()
    }
}
