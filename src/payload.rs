// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The marker capability every value flowing through a [`crate::connector::Connector`]
//! must satisfy. `Payload` carries no required operations of its own — it exists so
//! that connectors, task bodies, and rules can all be generic over "some opaque,
//! thread-shareable item" without each one re-stating `Send + Sync + 'static`.

/// Blanket capability for anything that can ride a connector.
///
/// Every payload on a connector is reference-counted (`Arc<T>`) once produced, so a
/// single item can be observed by a rule, forwarded downstream, and still be owned by
/// whatever produced it.
pub trait Payload: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Payload for T {}

/// Marker payload for tasks whose output has no meaningful value — the Bookkeeper's
/// "nothing" output type (spec.md §4.3: "A task whose output type is a special
/// 'nothing' marker").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoOutput;
