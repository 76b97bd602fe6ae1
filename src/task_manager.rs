// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! `Task<In, Out>`, `TaskContext`, and `TaskManager` — the per-task runtime that owns
//! a user task body, its connectors, and the per-thread scheduling loop (spec.md §3
//! "TaskManager", §4.2).
//!
//! Grounded on the teacher's `executor/thread_runner.rs` for the loop shape (wait on
//! input, invoke user body, log and continue past user errors) and on
//! `original_source/src/htgs/core/task/TaskScheduler.hpp` for the exact control flow
//! the loop below replays: start-task firing, `can_terminate` short-circuit before
//! consuming, and the termination handoff described in spec.md §5.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use crate::connector::{Connector, ConsumeResult, PollResult, TerminableEdge};
use crate::payload::Payload;
use crate::scheduling::TaskManagerConfig;

/// A stateful compute unit bound to a `TaskManager` (spec.md §6 "Task<In,Out>").
///
/// `copy()` is called once per extra thread a `TaskManager` runs with and once per
/// `ExecutionPipeline` replica (spec.md §3 "deep-copied by ExecutionPipeline at
/// initialization"); implementations whose state is not meaningfully shareable across
/// threads must return an independent copy, not a shared handle.
pub trait Task<In, Out>: Send {
    /// Invoked once per item consumed from the input connector.
    fn execute(&mut self, item: &In, ctx: &TaskContext<Out>) -> anyhow::Result<()>;

    /// Invoked exactly once, with no input, when this task is a start task (spec.md
    /// §4.2). Default: no-op, for tasks that are never configured as start tasks.
    fn execute_start(&mut self, ctx: &TaskContext<Out>) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Called once per thread, on that thread, before the scheduling loop begins.
    fn initialize(&mut self, ctx: &TaskContext<Out>) {
        let _ = ctx;
    }

    /// Called once per thread, on that thread, after the scheduling loop ends.
    fn shutdown(&mut self) {}

    /// Overridable termination predicate, checked before each consume attempt.
    /// Default: the input connector alone decides (spec.md §4.2 "the default is
    /// `input is drained`").
    fn can_terminate(&self, input: &Connector<In>) -> bool {
        input.is_drained()
    }

    /// Produces an independent copy of this task's state for another thread or
    /// pipeline replica (spec.md §6 "copy() -> Task").
    fn copy(&self) -> Box<dyn Task<In, Out>>;
}

/// Handed to a `Task` on every call; the sole channel through which a task body may
/// emit output (spec.md §4.2 "The body's add_result(out) forwards to the output
/// connector's produce").
pub struct TaskContext<Out> {
    output: Option<Connector<Out>>,
    pipeline_id: usize,
    num_pipelines: usize,
    address: String,
}

impl<Out: Payload> TaskContext<Out> {
    /// Forwards `item` to the output connector; a no-op for sink tasks with no
    /// output connector (spec.md §4.2).
    pub fn add_result(&self, item: Out) {
        if let Some(output) = &self.output {
            output.produce(Arc::new(item));
        }
    }

    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    pub fn num_pipelines(&self) -> usize {
        self.num_pipelines
    }

    /// The slash-delimited path identifying this task manager's graph replica
    /// (spec.md §3 "address").
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Tracks how many of a `TaskManager`'s threads are still running, so exactly one of
/// them performs the last-thread-out termination handoff (spec.md §5, §2
/// "RuntimeThreadGroup").
struct RuntimeThreadGroup {
    remaining: AtomicUsize,
}

impl RuntimeThreadGroup {
    fn new(num_threads: usize) -> Self {
        RuntimeThreadGroup {
            remaining: AtomicUsize::new(num_threads.max(1)),
        }
    }

    /// Returns true exactly once, for whichever thread's call brings the count to
    /// zero.
    fn thread_exiting(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

/// The per-task runtime unit: owns connectors, scheduling policy, and a prototype
/// task body it clones once per thread (spec.md §3 "TaskManager").
pub struct TaskManager<In: Payload, Out: Payload> {
    name: String,
    address: String,
    pipeline_id: usize,
    num_pipelines: usize,
    config: TaskManagerConfig,
    body: Box<dyn Task<In, Out>>,
    input: Option<Connector<In>>,
    output: Option<Connector<Out>>,
    memory_edges: Vec<Box<dyn TerminableEdge>>,
}

impl<In: Payload, Out: Payload> TaskManager<In, Out> {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        pipeline_id: usize,
        num_pipelines: usize,
        config: TaskManagerConfig,
        body: Box<dyn Task<In, Out>>,
    ) -> Self {
        TaskManager {
            name: name.into(),
            address: address.into(),
            pipeline_id,
            num_pipelines,
            config,
            body,
            input: None,
            output: None,
            memory_edges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn num_threads(&self) -> usize {
        self.config.num_threads.max(1)
    }

    /// Wires `input` as this task manager's sole input connector. The caller is
    /// responsible for having called `input.increment_input_task_count()` for every
    /// producer feeding it, including this one if it self-feeds (spec.md §9 "Cyclic
    /// self-edges").
    pub fn with_input(mut self, input: Connector<In>) -> Self {
        self.input = Some(input);
        self
    }

    /// Wires `output` as this task manager's sole output connector, registering this
    /// task manager as one of its producers (spec.md §4.1
    /// "increment_input_task_count... during graph wiring").
    pub fn with_output(mut self, output: Connector<Out>) -> Self {
        output.increment_input_task_count();
        self.output = Some(output);
        self
    }

    /// Registers a memory pool release edge this task feeds, so its termination is
    /// folded into the same last-thread-out handoff as the output connector
    /// (spec.md §5).
    pub fn with_memory_edge(mut self, edge: Box<dyn TerminableEdge>) -> Self {
        self.memory_edges.push(edge);
        self
    }

    pub fn input(&self) -> Option<&Connector<In>> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&Connector<Out>> {
        self.output.as_ref()
    }

    /// Spawns `num_threads` OS threads, each running `initialize -> loop -> shutdown`
    /// against its own clone of the task body, and returns their join handles
    /// (spec.md §4.7 "Runtime").
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let group = Arc::new(RuntimeThreadGroup::new(self.config.num_threads.max(1)));
        let name = Arc::new(self.name);
        let address = Arc::new(self.address);
        let input = self.input;
        let output = self.output;
        let memory_edges = Arc::new(self.memory_edges);
        let config = Arc::new(self.config);
        let pipeline_id = self.pipeline_id;
        let num_pipelines = self.num_pipelines;

        (0..config.num_threads.max(1))
            .map(|thread_index| {
                let body = self.body.copy();
                let input = input.clone();
                let output = output.clone();
                let group = Arc::clone(&group);
                let name = Arc::clone(&name);
                let address = Arc::clone(&address);
                let config = Arc::clone(&config);
                let memory_edges = Arc::clone(&memory_edges);

                std::thread::Builder::new()
                    .name(format!("{name}[{thread_index}]@{address}"))
                    .spawn(move || {
                        run_thread(
                            body,
                            input,
                            output,
                            config,
                            pipeline_id,
                            num_pipelines,
                            address,
                            name,
                            group,
                            memory_edges,
                        )
                    })
                    .expect("failed to spawn task manager thread")
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
fn run_thread<In: Payload, Out: Payload>(
    mut body: Box<dyn Task<In, Out>>,
    input: Option<Connector<In>>,
    output: Option<Connector<Out>>,
    config: Arc<TaskManagerConfig>,
    pipeline_id: usize,
    num_pipelines: usize,
    address: Arc<String>,
    name: Arc<String>,
    group: Arc<RuntimeThreadGroup>,
    memory_edges: Arc<Vec<Box<dyn TerminableEdge>>>,
) {
    let ctx = TaskContext {
        output: output.clone(),
        pipeline_id,
        num_pipelines,
        address: address.as_str().to_owned(),
    };

    debug!(task = %name, address = %*address, "thread starting");
    body.initialize(&ctx);

    let mut first_iteration = config.is_start_task;
    loop {
        if first_iteration {
            first_iteration = false;
            trace!(task = %name, "invoking start-task body");
            if let Err(err) = body.execute_start(&ctx) {
                warn!(task = %name, error = %err, "start-task body returned an error");
            }
            continue;
        }

        let Some(input) = input.as_ref() else {
            break;
        };

        if body.can_terminate(input) {
            trace!(task = %name, "can_terminate reported true");
            break;
        }

        let next = match config.poll {
            None => match input.consume() {
                ConsumeResult::Item(item) => Some(item),
                ConsumeResult::Drained => None,
            },
            Some(timeout) => match input.poll(timeout) {
                PollResult::Item(item) => Some(item),
                PollResult::Drained => None,
                PollResult::TimedOut => continue,
            },
        };

        let Some(item) = next else {
            trace!(task = %name, "input drained");
            break;
        };

        if let Err(err) = body.execute(item.as_ref(), &ctx) {
            warn!(task = %name, error = %err, "task body returned an error");
        }
    }

    body.shutdown();

    if group.thread_exiting() {
        debug!(task = %name, address = %*address, "last thread out, finishing producer edges");
        if let Some(output) = &output {
            output.producer_finished();
        }
        for edge in memory_edges.iter() {
            edge.producer_finished();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConsumeResult;

    struct Increment;
    impl Task<i32, i32> for Increment {
        fn execute(&mut self, item: &i32, ctx: &TaskContext<i32>) -> anyhow::Result<()> {
            ctx.add_result(item + 1);
            Ok(())
        }
        fn copy(&self) -> Box<dyn Task<i32, i32>> {
            Box::new(Increment)
        }
    }

    #[test]
    fn single_threaded_chain_produces_and_terminates() {
        let input = Connector::<i32>::fifo("in");
        input.increment_input_task_count();
        let output = Connector::<i32>::fifo("out");

        let tm = TaskManager::new(
            "inc",
            "/root",
            0,
            1,
            TaskManagerConfig::default(),
            Box::new(Increment),
        )
        .with_input(input.clone())
        .with_output(output.clone());

        for v in 0..4 {
            input.produce(Arc::new(v));
        }
        input.producer_finished();

        let handles = tm.spawn();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = Vec::new();
        while let ConsumeResult::Item(v) = output.consume() {
            seen.push(*v);
        }
        assert!(output.is_drained());
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    struct EmitOnce;
    impl Task<(), &'static str> for EmitOnce {
        fn execute(&mut self, _item: &(), _ctx: &TaskContext<&'static str>) -> anyhow::Result<()> {
            unreachable!("start-only task has no input connector")
        }
        fn execute_start(&mut self, ctx: &TaskContext<&'static str>) -> anyhow::Result<()> {
            ctx.add_result("hello");
            Ok(())
        }
        fn copy(&self) -> Box<dyn Task<(), &'static str>> {
            Box::new(EmitOnce)
        }
    }

    #[test]
    fn start_task_with_no_input_fires_once_then_exits() {
        let output = Connector::<&'static str>::fifo("out");
        let tm = TaskManager::new(
            "start",
            "/root",
            0,
            1,
            TaskManagerConfig::default().start_task(),
            Box::new(EmitOnce),
        )
        .with_output(output.clone());

        for h in tm.spawn() {
            h.join().unwrap();
        }

        match output.consume() {
            ConsumeResult::Item(v) => assert_eq!(*v, "hello"),
            ConsumeResult::Drained => panic!("expected one item"),
        }
        assert!(output.is_drained());
    }

    struct CountingThreads {
        threads_seen: Arc<std::sync::atomic::AtomicUsize>,
    }
    impl Task<i32, i32> for CountingThreads {
        fn execute(&mut self, item: &i32, ctx: &TaskContext<i32>) -> anyhow::Result<()> {
            self.threads_seen.fetch_add(1, Ordering::SeqCst);
            ctx.add_result(*item);
            Ok(())
        }
        fn copy(&self) -> Box<dyn Task<i32, i32>> {
            Box::new(CountingThreads {
                threads_seen: Arc::clone(&self.threads_seen),
            })
        }
    }

    #[test]
    fn multi_threaded_task_manager_finishes_output_exactly_once() {
        let input = Connector::<i32>::fifo("in");
        input.increment_input_task_count();
        let output = Connector::<i32>::fifo("out");

        let seen = Arc::new(AtomicUsize::new(0));
        let tm = TaskManager::new(
            "par",
            "/root",
            0,
            1,
            TaskManagerConfig::default().with_threads(4),
            Box::new(CountingThreads {
                threads_seen: Arc::clone(&seen),
            }),
        )
        .with_input(input.clone())
        .with_output(output.clone());

        for v in 0..20 {
            input.produce(Arc::new(v));
        }
        input.producer_finished();

        for h in tm.spawn() {
            h.join().unwrap();
        }

        assert_eq!(seen.load(Ordering::SeqCst), 20);
        assert!(output.is_drained());
        let mut count = 0;
        while let ConsumeResult::Item(_) = output.consume() {
            count += 1;
        }
        assert_eq!(count, 20);
    }
}
