// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! `MemoryPool<T>` — a bounded set of reusable buffers, Static or Dynamic
//! (spec.md §3 "MemoryPool<T>", §4.4 "MemoryManager").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connector::{Connector, ConsumeResult};
use crate::memory::allocator::Allocator;
use crate::memory::release_rule::ReleaseRule;
use crate::payload::Payload;

/// Static pools pre-allocate all `capacity` buffers at construction and only ever
/// recycle them; Dynamic pools allocate per `mem_get` and throttle outstanding buffers
/// to `capacity` (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Static,
    Dynamic,
}

struct PoolInner<T: Payload> {
    name: String,
    address: String,
    pipeline_id: usize,
    kind: PoolKind,
    capacity: usize,
    allocator: Arc<dyn Allocator<T>>,
    /// Static pools' empty-items queue (spec.md §4.4): pre-filled with real buffers,
    /// drained by `mem_get`, refilled by the manager when a release rule fires.
    empty: Connector<T>,
    /// Dynamic pools' throttle: `capacity` permits, one consumed per outstanding
    /// buffer, returned when the buffer is freed. Plays the role of the Static pool's
    /// empty-items queue for a pool that has no pre-existing buffers to hand out.
    permits: Connector<()>,
    /// The full-items queue (spec.md §4.4): every `releaseMemory` call lands here;
    /// the pool's manager thread consumes it for reclamation.
    returns: Connector<MemoryHandle<T>>,
    outstanding: AtomicUsize,
}

/// Identified by `(name, address)` (spec.md §3) — `address` is the owning graph
/// replica's address string, which is how `releaseMemory` routes a buffer back to the
/// pool that allocated it even across graph boundaries (spec.md §4.4 "Cross-graph
/// releases").
pub struct MemoryPool<T: Payload> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Payload> Clone for MemoryPool<T> {
    fn clone(&self) -> Self {
        MemoryPool {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> MemoryPool<T> {
    /// Pre-allocates `capacity` buffers via `allocator.alloc()` into the empty-items
    /// queue (spec.md §4.4 "Start-up for Static pools...").
    pub fn new_static(
        name: impl Into<String>,
        address: impl Into<String>,
        pipeline_id: usize,
        capacity: usize,
        allocator: Arc<dyn Allocator<T>>,
    ) -> crate::error::Result<Self> {
        if capacity == 0 {
            return Err(crate::error::Error::configuration(
                "memory pool capacity must be nonzero",
            ));
        }
        let empty = Connector::fifo(format!("{}@{}::empty", name_of(&name), addr_of(&address)));
        empty.increment_input_task_count();
        empty.freeze_wiring();
        for _ in 0..capacity {
            empty.produce(Arc::new(allocator.alloc()));
        }
        let returns = Connector::fifo(format!("{}@{}::returns", name_of(&name), addr_of(&address)));
        Ok(MemoryPool {
            inner: Arc::new(PoolInner {
                name: name.into(),
                address: address.into(),
                pipeline_id,
                kind: PoolKind::Static,
                capacity,
                allocator,
                empty,
                permits: Connector::fifo("unused-static-permits"),
                returns,
                outstanding: AtomicUsize::new(0),
            }),
        })
    }

    /// Pre-fills `capacity` permits; buffers themselves are allocated lazily by
    /// `mem_get` (spec.md §3 "Dynamic").
    pub fn new_dynamic(
        name: impl Into<String>,
        address: impl Into<String>,
        pipeline_id: usize,
        capacity: usize,
        allocator: Arc<dyn Allocator<T>>,
    ) -> crate::error::Result<Self> {
        if capacity == 0 {
            return Err(crate::error::Error::configuration(
                "memory pool capacity must be nonzero",
            ));
        }
        let permits = Connector::fifo(format!("{}@{}::permits", name_of(&name), addr_of(&address)));
        permits.increment_input_task_count();
        permits.freeze_wiring();
        for _ in 0..capacity {
            permits.produce(Arc::new(()));
        }
        let returns = Connector::fifo(format!("{}@{}::returns", name_of(&name), addr_of(&address)));
        Ok(MemoryPool {
            inner: Arc::new(PoolInner {
                name: name.into(),
                address: address.into(),
                pipeline_id,
                kind: PoolKind::Dynamic,
                capacity,
                allocator,
                empty: Connector::fifo("unused-dynamic-empty"),
                permits,
                returns,
                outstanding: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffers currently checked out (not yet reclaimed). Used by the
    /// conservation property tests (spec.md §8 items 3-4).
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub fn free_count(&self) -> usize {
        match self.inner.kind {
            PoolKind::Static => self.inner.empty.len(),
            PoolKind::Dynamic => self.inner.permits.len(),
        }
    }

    /// Registers the caller (a task that will call [`MemoryHandle::release`] during
    /// its lifetime) as a producer of this pool's return connector, and hands back an
    /// erased handle a `TaskManager` can fold into its last-thread-out termination
    /// list alongside its own output connector (spec.md §5 "For each memory edge the
    /// task feeds, do the same on that edge's return connector").
    pub fn register_release_producer(&self) -> Box<dyn crate::connector::TerminableEdge> {
        self.inner.returns.increment_input_task_count();
        Box::new(self.inner.returns.clone())
    }

    /// `memGet`: blocks until a buffer is available, attaches `release_rule`, returns
    /// the handle (spec.md §4.4). `element_count` is consulted only for Dynamic pools.
    pub fn mem_get(
        &self,
        release_rule: Box<dyn ReleaseRule<T> + Send>,
        element_count: Option<usize>,
    ) -> MemoryHandle<T> {
        let value = match self.inner.kind {
            PoolKind::Static => match self.inner.empty.consume() {
                ConsumeResult::Item(arc) => Arc::try_unwrap(arc).unwrap_or_else(|_| unreachable!(
                    "pool-internal empty connector never shares an item across consumers"
                )),
                ConsumeResult::Drained => panic!(
                    "memory pool '{}' empty-items connector drained unexpectedly",
                    self.inner.name
                ),
            },
            PoolKind::Dynamic => {
                match self.inner.permits.consume() {
                    ConsumeResult::Item(_) => {}
                    ConsumeResult::Drained => panic!(
                        "memory pool '{}' permit connector drained unexpectedly",
                        self.inner.name
                    ),
                }
                match element_count {
                    Some(n) => self.inner.allocator.alloc_sized(n),
                    None => self.inner.allocator.alloc(),
                }
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        MemoryHandle {
            inner: Arc::new(HandleInner {
                value: Mutex::new(Some(value)),
                release_rule: Mutex::new(release_rule),
                pool: self.clone(),
            }),
        }
    }

    /// Drives the pool's manager loop: pops returned handles until `returns` drains,
    /// reclaiming each whose release rule votes yes (spec.md §4.4 "Memory manager
    /// thread body"). Run this on a dedicated thread per pool, the same way any other
    /// task manager runs its scheduling loop (spec.md §2 "MemoryManager (task)").
    pub fn run_manager_loop(&self) {
        loop {
            match self.inner.returns.consume() {
                ConsumeResult::Item(handle) => self.reclaim_if_released(&handle),
                ConsumeResult::Drained => break,
            }
        }
        match self.inner.kind {
            PoolKind::Static => self.inner.empty.producer_finished(),
            PoolKind::Dynamic => self.inner.permits.producer_finished(),
        }
    }

    fn reclaim_if_released(&self, handle: &Arc<MemoryHandle<T>>) {
        let mut rule = handle.inner.release_rule.lock();
        rule.memory_used();
        if !rule.can_release() {
            return;
        }
        drop(rule);
        let mut slot = handle.inner.value.lock();
        let Some(value) = slot.take() else {
            // Already reclaimed by an earlier duplicate release (defensive: a rule
            // that votes `true` more than once must not double-free).
            return;
        };
        drop(slot);
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        match self.inner.kind {
            PoolKind::Static => self.inner.empty.produce(Arc::new(value)),
            PoolKind::Dynamic => {
                self.inner.allocator.free(value);
                self.inner.permits.produce(Arc::new(()));
            }
        }
    }
}

fn name_of(s: &impl ToString) -> String {
    s.to_string()
}
fn addr_of(s: &impl ToString) -> String {
    s.to_string()
}

struct HandleInner<T: Payload> {
    value: Mutex<Option<T>>,
    release_rule: Mutex<Box<dyn ReleaseRule<T> + Send>>,
    pool: MemoryPool<T>,
}

/// A checked-out buffer (spec.md §3 "MemoryData<T>").
///
/// Cheaply cloneable: every clone refers to the same underlying buffer and release
/// rule, so a buffer fanned out to several downstream tasks can have each of them call
/// [`MemoryHandle::release`] independently, and the pool's release rule (e.g.
/// [`crate::memory::release_rule::ReleaseAfterCount`]) decides when the last one wins.
pub struct MemoryHandle<T: Payload> {
    inner: Arc<HandleInner<T>>,
}

impl<T: Payload> Clone for MemoryHandle<T> {
    fn clone(&self) -> Self {
        MemoryHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Payload> MemoryHandle<T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.value.lock();
        f(guard.as_ref().expect("memory handle used after release"))
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.value.lock();
        f(guard.as_mut().expect("memory handle used after release"))
    }

    pub fn pool_name(&self) -> &str {
        self.inner.pool.name()
    }

    pub fn pool_address(&self) -> &str {
        self.inner.pool.address()
    }

    pub fn pipeline_id(&self) -> usize {
        self.inner.pool.inner.pipeline_id
    }

    /// `releaseMemory`: pushes this handle onto its originating pool's return
    /// connector (spec.md §4.4). Routes by the pool's address, so memory allocated in
    /// replica `k` is always returned to replica `k`'s manager, even when called from
    /// a task outside that replica's graph (spec.md §4.4 "Cross-graph releases").
    pub fn release(self) {
        let pool = self.inner.pool.clone();
        pool.inner.returns.produce(Arc::new(self));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::release_rule::{ReleaseAfterCount, ReleaseImmediately};
    use std::thread;

    struct VecAllocator;
    impl Allocator<Vec<u8>> for VecAllocator {
        fn alloc(&self) -> Vec<u8> {
            vec![0u8; 16]
        }
        fn alloc_sized(&self, n: usize) -> Vec<u8> {
            vec![0u8; n]
        }
        fn free(&self, _item: Vec<u8>) {}
    }

    #[test]
    fn static_pool_conserves_capacity() {
        let pool = MemoryPool::new_static("buf", "/root", 0, 4, Arc::new(VecAllocator)).unwrap();
        assert_eq!(pool.free_count(), 4);

        let release_edge = pool.register_release_producer();
        let manager_pool = pool.clone();
        let manager = thread::spawn(move || manager_pool.run_manager_loop());

        for _ in 0..10 {
            let h = pool.mem_get(Box::new(ReleaseImmediately), None);
            assert_eq!(pool.outstanding(), 1);
            h.with(|v| assert_eq!(v.len(), 16));
            h.release();
            // Give the manager thread a chance to reclaim before the next mem_get.
            while pool.outstanding() != 0 {
                thread::yield_now();
            }
        }

        release_edge.producer_finished();
        manager.join().unwrap();
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn dynamic_pool_throttles_outstanding() {
        let pool = MemoryPool::new_dynamic("buf", "/root", 0, 2, Arc::new(VecAllocator)).unwrap();
        let release_edge = pool.register_release_producer();
        let manager_pool = pool.clone();
        let manager = thread::spawn(move || manager_pool.run_manager_loop());

        let h1 = pool.mem_get(Box::new(ReleaseImmediately), Some(8));
        let h2 = pool.mem_get(Box::new(ReleaseImmediately), Some(8));
        assert_eq!(pool.outstanding(), 2);

        h1.release();
        h2.release();
        while pool.outstanding() != 0 {
            thread::yield_now();
        }

        release_edge.producer_finished();
        manager.join().unwrap();
    }

    #[test]
    fn release_after_count_waits_for_every_user() {
        let pool = MemoryPool::new_static("buf", "/root", 0, 1, Arc::new(VecAllocator)).unwrap();
        let release_edge = pool.register_release_producer();
        let manager_pool = pool.clone();
        let manager = thread::spawn(move || manager_pool.run_manager_loop());

        let h = pool.mem_get(Box::new(ReleaseAfterCount::new(3)), None);
        let h2 = h.clone();
        let h3 = h.clone();

        h.release();
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(pool.outstanding(), 1, "should not release until 3 calls land");

        h2.release();
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(pool.outstanding(), 1);

        h3.release();
        while pool.outstanding() != 0 {
            thread::yield_now();
        }

        release_edge.producer_finished();
        manager.join().unwrap();
        assert_eq!(pool.free_count(), 1);
    }
}
