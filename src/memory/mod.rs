// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Memory pools: bounded, reusable buffer management decoupled from the task graph
//! that consumes the buffers (spec.md §3 "MemoryPool<T>", §4.4).

pub mod allocator;
pub mod pool;
pub mod release_rule;

pub use allocator::Allocator;
pub use pool::{MemoryHandle, MemoryPool, PoolKind};
pub use release_rule::{ReleaseAfterCount, ReleaseImmediately, ReleaseRule};
