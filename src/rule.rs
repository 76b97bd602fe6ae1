// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! User-authored routing rules, invoked by a [`crate::bookkeeper::Bookkeeper`]
//! (spec.md §3 "Rule<In, Out>", §4.3).

/// A fan-out predicate/transformer attached to a [`crate::bookkeeper::Bookkeeper`].
///
/// Grounded on `original_source/src/htgs/api/IRule.hpp`'s `applyRule` / `canTerminateRule`
/// pair, generalized to a plain trait rather than the original's `AnyIRule` erasure base
/// (spec.md §9 "Polymorphism by capability, not inheritance").
///
/// Implementations may hold private accumulator state; [`Rule::apply`] is called with
/// that state mutable, under the manager's lock when [`Rule::needs_lock`] is true
/// (spec.md §4.3, §5 "Shared-resource policy").
pub trait Rule<In, Out>: Send {
    /// Inspects `item`, optionally calling `emit` zero or more times. Each `emit` call
    /// is forwarded, in order, to this rule's bound output connector (spec.md §4.3).
    fn apply(&mut self, item: &In, pipeline_id: usize, emit: &mut dyn FnMut(Out));

    /// Whether this rule has nothing further to contribute and the owning bookkeeper
    /// may terminate once its input is also drained (spec.md §4.3 "can_terminate").
    /// Default: true (no private state that outlives input drain).
    fn can_terminate(&self, pipeline_id: usize) -> bool {
        let _ = pipeline_id;
        true
    }

    /// Called once, after the rule's last `apply`, before its output connector is
    /// marked `producer_finished` (spec.md §4.3 "On shutdown").
    fn shutdown(&mut self, pipeline_id: usize) {
        let _ = pipeline_id;
    }

    /// If true, the bookkeeper serializes every `apply` call to this rule instance
    /// behind a dedicated mutex — required when the same rule is shared across
    /// bookkeepers in different `ExecutionPipeline` replicas (spec.md §5
    /// "Shared-resource policy"). Default: false (rule is not shared).
    fn needs_lock(&self) -> bool {
        false
    }
}
