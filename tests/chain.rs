// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Two task managers wired A -> B, A computing x+1, B computing x*2.

use std::sync::Arc;

use htgs_rt::{Connector, ConsumeResult, Task, TaskContext, TaskManager, TaskManagerConfig};

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

struct Double;
impl Task<i32, i32> for Double {
    fn execute(&mut self, item: &i32, ctx: &TaskContext<i32>) -> anyhow::Result<()> {
        ctx.add_result(item * 2);
        Ok(())
    }
    fn copy(&self) -> Box<dyn Task<i32, i32>> {
        Box::new(Double)
    }
}

#[test]
fn chain_produces_expected_multiset() {
    let input = Connector::<i32>::fifo("chain-in");
    input.increment_input_task_count();
    let middle = Connector::<i32>::fifo("chain-mid");
    let output = Connector::<i32>::fifo("chain-out");

    let a = TaskManager::new("a", "/chain", 0, 1, TaskManagerConfig::default(), Box::new(Increment))
        .with_input(input.clone())
        .with_output(middle.clone());
    let b = TaskManager::new("b", "/chain", 0, 1, TaskManagerConfig::default(), Box::new(Double))
        .with_input(middle.clone())
        .with_output(output.clone());

    let mut handles = a.spawn();
    handles.extend(b.spawn());

    for v in [0, 1, 2, 3] {
        input.produce(Arc::new(v));
    }
    input.producer_finished();

    for h in handles {
        h.join().unwrap();
    }

    let mut seen = Vec::new();
    while let ConsumeResult::Item(v) = output.consume() {
        seen.push(*v);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![2, 4, 6, 8]);
    assert!(output.is_drained());
}
