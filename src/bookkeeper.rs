// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The fan-out router task (spec.md §3 "Bookkeeper<In>", §4.3).
//!
//! A bookkeeper has no output connector of its own — every rule it owns is bound to
//! its own downstream connector via a [`RuleManager`], so "applying" an input means
//! invoking every attached rule in registration order and letting each rule's `emit`
//! calls land wherever that rule is wired.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::connector::Connector;
use crate::payload::{NoOutput, Payload};
use crate::rule::Rule;
use crate::task_manager::{Task, TaskContext};

/// Binds one [`Rule`] to exactly one downstream [`Connector<Out>`] under a fixed
/// `pipeline_id`.
///
/// Grounded on `original_source/src/htgs/core/rules/RuleManager.hpp`: in the original,
/// one `RuleManager` exists per (rule, output connector) pair, and the same rule
/// instance may be wrapped by several managers if it is shared across bookkeepers
/// (spec.md §3 "RuleManager<In, Out>"). The rule is held behind an `Arc<Mutex<_>>` so
/// that sharing is possible and so `Rule::apply`'s `&mut self` is satisfiable from
/// multiple TaskManager threads calling concurrently — in this port that lock is
/// always taken, regardless of [`Rule::needs_lock`], because Rust gives no safe way to
/// hand out `&mut self` through a shared handle without one; the flag is kept on the
/// trait for interface fidelity but this manager does not special-case it (see
/// DESIGN.md "Open Question decisions").
///
/// `pipeline_id` is fixed at construction rather than threaded in from the owning
/// `Bookkeeper` at call time: an ordinary bookkeeper attaches every manager with its
/// own `pipeline_id`, but an `ExecutionPipeline`'s decomposition bookkeeper attaches
/// one manager per replica, each stamped with that replica's index, so the shared
/// decomposition rule can tell which replica a given `apply` call is routing for
/// (spec.md §4.5 "Rule routes x to replica x % N").
pub struct RuleManager<In, Out> {
    rule: Arc<Mutex<dyn Rule<In, Out>>>,
    output: Connector<Out>,
    label: String,
    pipeline_id: usize,
}

impl<In, Out> RuleManager<In, Out> {
    pub fn new(
        label: impl Into<String>,
        rule: Arc<Mutex<dyn Rule<In, Out>>>,
        output: Connector<Out>,
        pipeline_id: usize,
    ) -> Self {
        RuleManager {
            rule,
            output,
            label: label.into(),
            pipeline_id,
        }
    }

    pub fn output(&self) -> &Connector<Out> {
        &self.output
    }

    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }
}

impl<In, Out> Clone for RuleManager<In, Out> {
    /// Shares the underlying rule instance and output connector — used when a
    /// `TaskManager` spins up extra threads for a multi-threaded `Bookkeeper`, which
    /// must cooperate on the same rule state and connectors, not fork fresh ones
    /// (spec.md §3 "RuleManager... shared across pipelines if the rule itself is
    /// shared").
    fn clone(&self) -> Self {
        RuleManager {
            rule: Arc::clone(&self.rule),
            output: self.output.clone(),
            label: self.label.clone(),
            pipeline_id: self.pipeline_id,
        }
    }
}

/// Type-erased view of a [`RuleManager`] over a common input type, so a
/// [`Bookkeeper`] can hold managers that fan out to differently-typed downstream
/// connectors in one ordered list (spec.md §9 "tagged-variant enum... or
/// trait/interface with only erased operations").
pub(crate) trait AnyRuleManager<In>: Send + Sync {
    fn apply(&self, item: &In);
    fn can_terminate(&self) -> bool;
    fn shutdown(&self);
    fn label(&self) -> &str;
    fn clone_box(&self) -> Box<dyn AnyRuleManager<In>>;
}

impl<In, Out> AnyRuleManager<In> for RuleManager<In, Out>
where
    In: Payload,
    Out: Payload,
{
    fn apply(&self, item: &In) {
        let mut rule = self.rule.lock();
        let output = &self.output;
        rule.apply(item, self.pipeline_id, &mut |out| output.produce(Arc::new(out)));
    }

    fn can_terminate(&self) -> bool {
        self.rule.lock().can_terminate(self.pipeline_id)
    }

    fn shutdown(&self) {
        self.rule.lock().shutdown(self.pipeline_id);
        self.output.producer_finished();
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn clone_box(&self) -> Box<dyn AnyRuleManager<In>> {
        Box::new(self.clone())
    }
}

/// A task whose output type is the "nothing" marker (spec.md §3): every rule
/// attached emits directly to its own bound connector, not through a bookkeeper-level
/// output. Holds its [`RuleManager`]s in registration order; per spec.md §4.3 and §5
/// ("Ordering guarantees"), each input item is replayed through every manager,
/// strictly sequentially, in that order.
pub struct Bookkeeper<In: Payload> {
    name: String,
    pipeline_id: usize,
    managers: Vec<Box<dyn AnyRuleManager<In>>>,
}

impl<In: Payload> Bookkeeper<In> {
    pub fn new(name: impl Into<String>, pipeline_id: usize) -> Self {
        Bookkeeper {
            name: name.into(),
            pipeline_id,
            managers: Vec::new(),
        }
    }

    /// Registers a manager; it is invoked after every manager already attached
    /// (spec.md §4.3 "in insertion order").
    pub fn add_rule<Out: Payload>(&mut self, manager: RuleManager<In, Out>) {
        self.managers.push(Box::new(manager));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline_id(&self) -> usize {
        self.pipeline_id
    }

    /// Replays `item` through every attached rule manager in registration order
    /// (spec.md §4.3).
    pub fn process(&self, item: &In) {
        for manager in &self.managers {
            trace!(bookkeeper = %self.name, rule = manager.label(), "applying rule");
            manager.apply(item);
        }
    }

    /// True only once every attached rule itself reports `can_terminate` (spec.md
    /// §4.3 "can_terminate for a Bookkeeper"). The caller is additionally
    /// responsible for the "input is drained" half of that conjunction.
    pub fn rules_can_terminate(&self) -> bool {
        self.managers.iter().all(|m| m.can_terminate())
    }

    /// Shuts down every rule, then marks each rule's bound output connector as
    /// having lost one producer (spec.md §4.3 "On shutdown").
    pub fn shutdown(&self) {
        for manager in &self.managers {
            manager.shutdown();
        }
    }
}

/// A bookkeeper plugs directly into a `TaskManager<In, NoOutput>` as its task body:
/// it has no output connector of its own (every rule manager owns its own), so
/// `add_result` is never called and `Out` is fixed to the "nothing" marker (spec.md
/// §3 "A task whose output type is a special nothing marker").
impl<In: Payload> Task<In, NoOutput> for Bookkeeper<In> {
    fn execute(&mut self, item: &In, ctx: &TaskContext<NoOutput>) -> anyhow::Result<()> {
        let _ = ctx;
        self.process(item);
        Ok(())
    }

    fn can_terminate(&self, input: &Connector<In>) -> bool {
        input.is_drained() && self.rules_can_terminate()
    }

    fn shutdown(&mut self) {
        Bookkeeper::shutdown(self);
    }

    fn copy(&self) -> Box<dyn Task<In, NoOutput>> {
        Box::new(Bookkeeper {
            name: self.name.clone(),
            pipeline_id: self.pipeline_id,
            managers: self.managers.iter().map(|m| m.clone_box()).collect(),
        })
    }
}
