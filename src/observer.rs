// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use crate::entry::EntryStateTag;
use crate::node::Node;

/// A host-suppliable, best-effort progress hook.
///
/// Every method may be called concurrently from multiple worker threads, and
/// possibly more than once for the same node (the invalidator in particular
/// makes no de-duplication promise when a node is reachable via more than one
/// path). Implementations must be thread-safe and idempotent; `enqueueing` in
/// particular is a hint, not a guarantee that a build will actually run.
pub trait ProgressObserver<N: Node>: Send + Sync {
    /// A node was marked dirty or deleted by the invalidator.
    fn invalidated(&self, _node: &N, _state: EntryStateTag) {}

    /// A node was pushed onto the evaluator's work queue.
    fn enqueueing(&self, _node: &N) {}

    /// A node finished a build attempt (successful, errored, or revalidated)
    /// and landed in the given state.
    fn evaluated(&self, _node: &N, _state: EntryStateTag) {}
}

/// A `ProgressObserver` that does nothing, used when a caller doesn't supply one.
pub struct NullObserver;

impl<N: Node> ProgressObserver<N> for NullObserver {}
