// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! A buffer allocated by a task inside an `ExecutionPipeline` replica is released by
//! a task downstream of the pipeline, outside the replica's own graph. Allocation
//! count must equal release count at shutdown regardless of which graph did the
//! releasing (spec.md §4.4 "Cross-graph releases", §8 "Memory released outside
//! producing graph").

use std::sync::Arc;
use std::thread;

use htgs_rt::{
    Allocator, Connector, ConsumeResult, ExecutionPipeline, GraphConfig, MemoryHandle, MemoryPool, ReleaseImmediately,
    Rule, Task, TaskContext, TaskManager, TaskManagerConfig,
};
use parking_lot::Mutex;

struct VecAllocator;
impl Allocator<Vec<u8>> for VecAllocator {
    fn alloc(&self) -> Vec<u8> {
        vec![0u8; 4]
    }
    fn free(&self, _item: Vec<u8>) {}
}

/// Allocates one buffer per input inside its replica and forwards the handle
/// downstream instead of releasing it itself.
struct Allocate {
    pool: MemoryPool<Vec<u8>>,
}
impl Task<i32, MemoryHandle<Vec<u8>>> for Allocate {
    fn execute(&mut self, _item: &i32, ctx: &TaskContext<MemoryHandle<Vec<u8>>>) -> anyhow::Result<()> {
        let handle = self.pool.mem_get(Box::new(ReleaseImmediately), None);
        ctx.add_result(handle);
        Ok(())
    }
    fn copy(&self) -> Box<dyn Task<i32, MemoryHandle<Vec<u8>>>> {
        Box::new(Allocate {
            pool: self.pool.clone(),
        })
    }
}

struct Broadcast;
impl Rule<i32, i32> for Broadcast {
    fn apply(&mut self, item: &i32, _pipeline_id: usize, emit: &mut dyn FnMut(i32)) {
        emit(*item);
    }
}

#[test]
fn release_outside_the_allocating_replica_still_reclaims() {
    let pool = MemoryPool::new_static("xgraph", "/root/0", 0, 4, Arc::new(VecAllocator)).unwrap();
    let release_edge = pool.register_release_producer();
    let manager_pool = pool.clone();
    let manager_thread = thread::spawn(move || manager_pool.run_manager_loop());

    let replica_pool = pool.clone();
    let factory = move |pipeline_id: usize,
                         num_pipelines: usize,
                         address: String,
                         shared_output: Connector<MemoryHandle<Vec<u8>>>|
          -> GraphConfig<i32, MemoryHandle<Vec<u8>>> {
        let input = Connector::<i32>::fifo(format!("alloc-in@{address}"));
        let mut graph = GraphConfig::new(address.clone(), pipeline_id, num_pipelines, input.clone(), shared_output.clone());
        let allocator_tm: TaskManager<i32, MemoryHandle<Vec<u8>>> = TaskManager::new(
            "allocate",
            address,
            pipeline_id,
            num_pipelines,
            TaskManagerConfig::default(),
            Box::new(Allocate {
                pool: replica_pool.clone(),
            }),
        )
        .with_input(input)
        .with_output(shared_output);
        graph.add_task_manager(allocator_tm);
        graph
    };

    let mut pipeline = ExecutionPipeline::new("alloc-pipeline", 1, factory);
    pipeline.add_decomposition_rule("broadcast", Arc::new(Mutex::new(Broadcast)));

    let shared_output = Connector::<MemoryHandle<Vec<u8>>>::fifo("shared-handles");
    let running = pipeline.initialize("/root", shared_output.clone()).unwrap();

    for v in 0..4 {
        running.execute(v);
    }
    running.finished_producing_data();

    // This consumer plays the role of a task downstream of the pipeline, outside the
    // replica's own graph, that releases every handle it receives.
    let mut released = 0;
    while let ConsumeResult::Item(handle) = shared_output.consume() {
        handle.with(|buf| assert_eq!(buf.len(), 4));
        Arc::try_unwrap(handle)
            .unwrap_or_else(|_| panic!("handle should not be shared"))
            .release();
        released += 1;
    }
    running.join();

    while pool.outstanding() != 0 {
        thread::yield_now();
    }
    release_edge.producer_finished();
    manager_thread.join().unwrap();

    assert_eq!(released, 4);
    assert_eq!(pool.free_count(), 4);
    assert_eq!(pool.outstanding(), 0);
}
