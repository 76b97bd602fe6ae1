// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! `Connector<T>` — the typed, multi-producer/multi-consumer queue every edge in the
//! graph is made of (spec.md §3, §4.1).
//!
//! A connector is the sole source of truth for termination: consumers never ask "is my
//! producer still alive", they ask the connector "are you drained" (empty AND every
//! producer that was ever wired to you has called [`Connector::producer_finished`]).
//! That split is what lets fan-in edges, self-feeding bookkeeper loops, and replicated
//! pipeline sinks all share one termination rule.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::payload::Payload;

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of a blocking [`Connector::consume`].
#[derive(Debug)]
pub enum ConsumeResult<T> {
    Item(Arc<T>),
    /// Queue was empty and every producer has called `producer_finished`.
    Drained,
}

/// Outcome of a bounded-wait [`Connector::poll`].
#[derive(Debug)]
pub enum PollResult<T> {
    Item(Arc<T>),
    Drained,
    TimedOut,
}

/// How items are ordered inside a connector's internal queue.
enum Backing<T> {
    Fifo(VecDeque<Arc<T>>),
    /// Linear-scan priority queue ordered by a user comparator. Connectors in this
    /// runtime hold at most a handful of in-flight items at a time (bookkeeper fan-out,
    /// task input backlog), so an O(n) max-scan is simpler and just as fast in practice
    /// as maintaining a heap over a dynamic comparator.
    Priority(Vec<Arc<T>>, Arc<dyn Fn(&T, &T) -> std::cmp::Ordering + Send + Sync>),
}

impl<T> Backing<T> {
    fn push(&mut self, item: Arc<T>) {
        match self {
            Backing::Fifo(q) => q.push_back(item),
            Backing::Priority(v, _) => v.push(item),
        }
    }

    fn pop(&mut self) -> Option<Arc<T>> {
        match self {
            Backing::Fifo(q) => q.pop_front(),
            Backing::Priority(v, cmp) => {
                if v.is_empty() {
                    return None;
                }
                let mut best = 0;
                for i in 1..v.len() {
                    if cmp(&v[i], &v[best]) == std::cmp::Ordering::Greater {
                        best = i;
                    }
                }
                Some(v.swap_remove(best))
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Fifo(q) => q.len(),
            Backing::Priority(v, _) => v.len(),
        }
    }
}

struct State<T> {
    backing: Backing<T>,
    /// Number of task-manager threads still registered as producers. The sole
    /// source of truth for termination (spec.md §4.1 "Design rationale").
    producer_count: u32,
    input_terminated: bool,
    /// Set once graph wiring completes; `increment_input_task_count` after this point
    /// is a protocol violation (spec.md §7).
    frozen: bool,
}

/// A typed FIFO (or priority) queue with producer-reference-count termination.
///
/// Cheaply cloneable — clones share the same underlying queue, mutex, and condvar, the
/// same way a task manager's output connector handle is shared with every thread of
/// that task (spec.md §3 "Connector<T>").
pub struct Connector<T: Payload> {
    id: String,
    numeric_id: u64,
    state: Arc<Mutex<State<T>>>,
    not_empty: Arc<Condvar>,
}

impl<T: Payload> Clone for Connector<T> {
    fn clone(&self) -> Self {
        Connector {
            id: self.id.clone(),
            numeric_id: self.numeric_id,
            state: Arc::clone(&self.state),
            not_empty: Arc::clone(&self.not_empty),
        }
    }
}

impl<T: Payload> fmt::Debug for Connector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector").field("id", &self.id).finish()
    }
}

impl<T: Payload> Connector<T> {
    /// Creates an unbounded FIFO connector identified by `id` (used only in log lines
    /// and protocol-violation messages).
    pub fn fifo(id: impl Into<String>) -> Self {
        Self::new(id, Backing::Fifo(VecDeque::new()))
    }

    /// Creates a connector whose `consume`/`poll` return items in descending order of
    /// `cmp` rather than arrival order (spec.md §4.1 "A priority variant...").
    pub fn priority(
        id: impl Into<String>,
        cmp: impl Fn(&T, &T) -> std::cmp::Ordering + Send + Sync + 'static,
    ) -> Self {
        Self::new(id, Backing::Priority(Vec::new(), Arc::new(cmp)))
    }

    fn new(id: impl Into<String>, backing: Backing<T>) -> Self {
        Connector {
            id: id.into(),
            numeric_id: NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(State {
                backing,
                producer_count: 0,
                input_terminated: false,
                frozen: false,
            })),
            not_empty: Arc::new(Condvar::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registers one more producer against this connector. Must only be called during
    /// graph wiring, before the runtime starts and before any `produce` (spec.md
    /// §3 "producer_count is incremented exactly once per task-manager bound as
    /// producer, during graph wiring, never at runtime.").
    pub fn increment_input_task_count(&self) {
        let mut state = self.state.lock();
        if state.frozen {
            Error::protocol_violation(
                self.id.clone(),
                "increment_input_task_count called after wiring was frozen",
            );
        }
        state.producer_count += 1;
    }

    /// Freezes wiring: no further `increment_input_task_count` calls are permitted.
    /// Called once by the graph/runtime machinery right before threads are spawned.
    pub fn freeze_wiring(&self) {
        self.state.lock().frozen = true;
    }

    /// Pushes `item` onto the queue and wakes one waiting consumer.
    ///
    /// # Panics
    /// Panics (protocol violation) if called after `input_terminated` — that is
    /// always a bug in a `Task`/`Rule` implementation, not a recoverable condition
    /// (spec.md §4.1).
    pub fn produce(&self, item: Arc<T>) {
        let mut state = self.state.lock();
        if state.input_terminated {
            Error::protocol_violation(self.id.clone(), "produce called after input_terminated");
        }
        state.backing.push(item);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available or the connector is drained.
    pub fn consume(&self) -> ConsumeResult<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.backing.pop() {
                return ConsumeResult::Item(item);
            }
            if state.input_terminated {
                return ConsumeResult::Drained;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Blocks until an item is available, the connector is drained, or `timeout`
    /// elapses (spec.md §4.1 "poll(dur)").
    pub fn poll(&self, timeout: Duration) -> PollResult<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.backing.pop() {
                return PollResult::Item(item);
            }
            if state.input_terminated {
                return PollResult::Drained;
            }
            let now = Instant::now();
            if now >= deadline {
                return PollResult::TimedOut;
            }
            let wait_result = self.not_empty.wait_for(&mut state, deadline - now);
            if wait_result.timed_out() {
                // One more look: data (or termination) may have arrived right at the
                // edge of the window.
                if let Some(item) = state.backing.pop() {
                    return PollResult::Item(item);
                }
                if state.input_terminated {
                    return PollResult::Drained;
                }
                return PollResult::TimedOut;
            }
        }
    }

    /// Decrements the producer count; if it reaches zero, marks the connector
    /// terminated and wakes every waiter (spec.md §4.1, §5 "Termination ordering").
    ///
    /// # Panics
    /// Panics (protocol violation) on a double `producer_finished` for the same
    /// producer slot — the count would otherwise underflow.
    pub fn producer_finished(&self) {
        let mut state = self.state.lock();
        if state.producer_count == 0 {
            Error::protocol_violation(self.id.clone(), "producer_finished called with producer_count already zero");
        }
        state.producer_count -= 1;
        let reached_zero = state.producer_count == 0;
        if reached_zero {
            state.input_terminated = true;
        }
        drop(state);
        if reached_zero {
            self.not_empty.notify_all();
        }
    }

    /// Broadcasts to waiters without changing any state. Used when a downstream task
    /// has itself terminated and needs to unblock threads blocked in `consume` on this
    /// connector (spec.md §4.1 "wakeup_consumer").
    pub fn wakeup_consumer(&self) {
        self.not_empty.notify_all();
    }

    /// True once the queue is empty and every producer has finished.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.input_terminated && state.backing.len() == 0
    }

    pub fn is_input_terminated(&self) -> bool {
        self.state.lock().input_terminated
    }

    pub fn producer_count(&self) -> u32 {
        self.state.lock().producer_count
    }

    pub fn len(&self) -> usize {
        self.state.lock().backing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A type-erased view of "the producer-termination half of a connector", so a
/// [`crate::task_manager::TaskManager`] can hold a single heterogeneous list of every
/// edge it must call `producer_finished` on at last-thread-out — its own output plus
/// every memory pool return edge it feeds — without naming each edge's payload type
/// (spec.md §5 "Termination ordering", §9 "trait/interface with only erased
/// operations").
pub trait TerminableEdge: Send + Sync {
    fn producer_finished(&self);
    fn wakeup_consumer(&self);
}

impl<T: Payload> TerminableEdge for Connector<T> {
    fn producer_finished(&self) {
        Connector::producer_finished(self)
    }

    fn wakeup_consumer(&self) {
        Connector::wakeup_consumer(self)
    }
}
