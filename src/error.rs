// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use std::fmt;

use crate::node::Node;

/// A discovered dependency cycle, reported relative to the root that surfaced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleInfo<N: Node> {
    /// The ordered sequence of keys forming the loop.
    pub cycle: Vec<N>,
    /// The ordered prefix from the reporting root into the cycle's head. Empty
    /// when the reporting node itself participates in the cycle.
    pub path_to_cycle: Vec<N>,
}

/// The engine's own error taxonomy. `Builder` wraps a host-supplied error value;
/// the other three variants are raised by the engine itself and never appear
/// inside a `BuildOutcome`.
#[derive(Clone, Debug)]
pub enum EngineError<E> {
    /// A node builder reported a semantic failure.
    Builder(E),
    /// This node participates in at least one dependency cycle.
    Cycle,
    /// The pass was interrupted by the caller before this node completed.
    ///
    /// Not attached to a node's persistent `error` slot: an interrupted node is
    /// left `Dirty` rather than `Done` with this variant, so it is retried on
    /// the next `update` rather than being remembered as permanently broken.
    Interrupted,
    /// Programmer misuse: `inject` was called against a node with non-empty
    /// recorded `deps`.
    InjectConflict,
}

impl<E: fmt::Display> fmt::Display for EngineError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Builder(e) => write!(f, "builder error: {e}"),
            EngineError::Cycle => write!(f, "node participates in a dependency cycle"),
            EngineError::Interrupted => write!(f, "evaluation was interrupted"),
            EngineError::InjectConflict => {
                write!(f, "attempted to inject a value over a node with derived dependencies")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for EngineError<E> {}

/// The error state attached to a `DONE` node that failed, or surfaced for a
/// root by `update`.
#[derive(Clone, Debug)]
pub struct ErrorInfo<N: Node> {
    pub error: EngineError<N::Error>,
    /// Transitive dependencies that themselves ended up errored and
    /// contributed to this failure, in the order they were discovered.
    pub transitive_errors: Vec<N>,
    /// Cycles this key participates in, if the failure is cycle-related.
    pub cycles: Vec<CycleInfo<N>>,
}

impl<N: Node> ErrorInfo<N> {
    pub(crate) fn builder(error: N::Error) -> ErrorInfo<N> {
        ErrorInfo { error: EngineError::Builder(error), transitive_errors: Vec::new(), cycles: Vec::new() }
    }

    pub(crate) fn with_transitive(mut self, transitive: Vec<N>) -> ErrorInfo<N> {
        self.transitive_errors = transitive;
        self
    }
}
