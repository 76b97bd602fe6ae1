// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! `Runtime<In, Out>` — walks a graph configuration, spawns its worker threads, and
//! joins on shutdown (spec.md §3 "Runtime" system-overview row, §4.7).

use std::sync::Arc;
use std::thread::JoinHandle;

use crate::connector::{Connector, ConsumeResult};
use crate::graph::GraphConfig;
use crate::payload::Payload;

/// Owns one top-level [`GraphConfig`]'s external input/output connectors and its
/// spawned worker threads (spec.md §6 "Runtime control").
pub struct Runtime<In: Payload, Out: Payload> {
    input: Connector<In>,
    output: Connector<Out>,
    graph: Option<GraphConfig<In, Out>>,
    handles: Option<Vec<JoinHandle<()>>>,
}

impl<In: Payload, Out: Payload> Runtime<In, Out> {
    pub fn new(graph: GraphConfig<In, Out>) -> Self {
        Runtime {
            input: graph.input().clone(),
            output: graph.output().clone(),
            graph: Some(graph),
            handles: None,
        }
    }

    /// Spawns every task manager's worker threads and returns immediately (spec.md
    /// §6 "execute_runtime() (non-blocking)").
    ///
    /// # Panics
    /// Panics if called more than once for the same runtime.
    pub fn execute_runtime(&mut self) {
        let graph = self
            .graph
            .take()
            .expect("execute_runtime called more than once on the same Runtime");
        self.handles = Some(graph.spawn_all());
    }

    /// Blocks until every spawned thread has exited (spec.md §6 "wait_for_runtime()
    /// (blocking join)").
    pub fn wait_for_runtime(&mut self) {
        if let Some(handles) = self.handles.take() {
            for handle in handles {
                let _ = handle.join();
            }
        }
    }

    /// `execute_runtime()` followed immediately by `wait_for_runtime()` (spec.md §6
    /// "execute_and_wait()").
    pub fn execute_and_wait(&mut self) {
        self.execute_runtime();
        self.wait_for_runtime();
    }

    /// Pushes `item` onto the graph's external input connector.
    pub fn produce_data(&self, item: In) {
        self.input.produce(Arc::new(item));
    }

    /// Marks the graph's external input as having no more producers (spec.md §6
    /// "finished_producing_data()").
    pub fn finished_producing_data(&self) {
        self.input.producer_finished();
    }

    /// Blocks for the next item on the graph's external output connector (spec.md §6
    /// "consume_data()").
    pub fn consume_data(&self) -> ConsumeResult<Out> {
        self.output.consume()
    }

    pub fn is_output_terminated(&self) -> bool {
        self.output.is_drained()
    }

    pub fn input(&self) -> &Connector<In> {
        &self.input
    }

    pub fn output(&self) -> &Connector<Out> {
        &self.output
    }
}
