// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! An `ExecutionPipeline` of 2 replicas where a decomposition rule routes each input
//! to exactly one replica, `x % num_pipelines`. Each replica just forwards its input
//! to a replica-tagged output so the test can tell which replica handled which item.

use std::sync::Arc;

use htgs_rt::{
    Connector, ConsumeResult, ExecutionPipeline, GraphConfig, Rule, Task, TaskContext, TaskManager, TaskManagerConfig,
};
use parking_lot::Mutex;

struct Tag {
    pipeline_id: usize,
}
impl Task<i32, (usize, i32)> for Tag {
    fn execute(&mut self, item: &i32, ctx: &TaskContext<(usize, i32)>) -> anyhow::Result<()> {
        ctx.add_result((self.pipeline_id, *item));
        Ok(())
    }
    fn copy(&self) -> Box<dyn Task<i32, (usize, i32)>> {
        Box::new(Tag {
            pipeline_id: self.pipeline_id,
        })
    }
}

struct RouteByModulo {
    num_pipelines: usize,
}
impl Rule<i32, i32> for RouteByModulo {
    fn apply(&mut self, item: &i32, pipeline_id: usize, emit: &mut dyn FnMut(i32)) {
        if (*item as usize) % self.num_pipelines == pipeline_id {
            emit(*item);
        }
    }
}

fn replica_factory(
    pipeline_id: usize,
    num_pipelines: usize,
    address: String,
    shared_output: Connector<(usize, i32)>,
) -> GraphConfig<i32, (usize, i32)> {
    let input = Connector::<i32>::fifo(format!("replica-in@{address}"));
    let mut graph = GraphConfig::new(address.clone(), pipeline_id, num_pipelines, input.clone(), shared_output.clone());
    let tag: TaskManager<i32, (usize, i32)> = TaskManager::new(
        "tag",
        address,
        pipeline_id,
        num_pipelines,
        TaskManagerConfig::default(),
        Box::new(Tag { pipeline_id }),
    )
    .with_input(input)
    .with_output(shared_output);
    graph.add_task_manager(tag);
    graph
}

#[test]
fn each_input_is_routed_to_exactly_one_replica() {
    let mut pipeline = ExecutionPipeline::new("decompose", 2, replica_factory);
    pipeline.add_decomposition_rule("modulo", Arc::new(Mutex::new(RouteByModulo { num_pipelines: 2 })));

    let shared_output = Connector::<(usize, i32)>::fifo("shared-out");
    let running = pipeline.initialize("/root", shared_output.clone()).unwrap();

    for v in 0..6 {
        running.execute(v);
    }
    running.finished_producing_data();

    let mut by_replica: Vec<Vec<i32>> = vec![Vec::new(), Vec::new()];
    let mut total = 0;
    while let ConsumeResult::Item(v) = shared_output.consume() {
        let (replica, value) = *v;
        by_replica[replica].push(value);
        total += 1;
    }
    running.join();

    by_replica[0].sort_unstable();
    by_replica[1].sort_unstable();
    assert_eq!(by_replica[0], vec![0, 2, 4]);
    assert_eq!(by_replica[1], vec![1, 3, 5]);
    assert_eq!(total, 6);
}
