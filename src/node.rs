// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::hash::Hash;

use fnv::FnvHashMap;

use crate::evaluate::{CancellationToken, Scheduler};
use crate::store::{EntrySnapshot, GraphStore};
use crate::version::Generation;

/// A set of dependencies requested together via one bulk lookup. Recorded in
/// declaration order; re-checked as a unit during `CHECK_DEPENDENCIES`.
pub type DepGroup<N> = Vec<N>;

/// The result of one builder invocation.
pub enum BuildOutcome<N: Node> {
    /// The builder produced a value.
    Done(N::Value),
    /// The builder observed `values_missing() == true` partway through and is
    /// asking to be restarted once the deps it already requested are done.
    MissingDeps,
    /// The builder raised a semantic failure.
    Err(N::Error),
}

/// Both the stable, hashable identity of a node and the means of computing its
/// value. Implementations are typically a closed enum of "builder families",
/// each variant carrying its own argument — the idiomatic stand-in for a
/// `(type_tag, argument)` pair, dispatched by Rust's own pattern matching
/// instead of a runtime registry lookup.
pub trait Node: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    type Value: Clone + fmt::Debug + PartialEq + Send + Sync + 'static;
    type Error: std::error::Error + Clone + Send + Sync + 'static;

    /// Computes this node's value against the given environment.
    ///
    /// Must be re-entrant and idempotent: for the same version and the same
    /// dependency values, a second invocation (after a restart triggered by
    /// `MissingDeps`) must request the same deps and, once they are all
    /// present, produce the same value. Non-determinism here is a builder bug,
    /// not something the engine can detect or correct for.
    fn build(&self, env: &Environment<Self>) -> BuildOutcome<Self>;

    /// Whether a node of this kind may be safely abandoned mid-build on
    /// invalidation and restarted later, versus needing to run to completion.
    /// Nearly everything is restartable; the default reflects that.
    fn restartable(&self) -> bool {
        true
    }
}

pub(crate) enum RequestOutcome<N: Node> {
    Value(N::Value),
    /// The dependency is `DONE` but errored; `get_value` treats this the same
    /// as absent, `get_value_or_throw` surfaces it.
    Errored,
    Absent,
}

/// The API a builder uses to request dependency values and to learn whether
/// any of its lookups came back absent.
///
/// An `Environment` is only valid for the duration of one `build` call: it
/// accumulates the dep-groups requested during that call so the engine can
/// record them against the node's entry once the call returns.
pub struct Environment<'a, N: Node> {
    store: &'a GraphStore<N>,
    scheduler: &'a Scheduler<N>,
    requester: crate::store::EntryId,
    #[allow(dead_code)]
    version: Generation,
    cancellation: &'a CancellationToken,
    groups: RefCell<Vec<DepGroup<N>>>,
    missing: Cell<bool>,
}

impl<'a, N: Node> Environment<'a, N> {
    pub(crate) fn new(
        store: &'a GraphStore<N>,
        scheduler: &'a Scheduler<N>,
        requester: crate::store::EntryId,
        version: Generation,
        cancellation: &'a CancellationToken,
    ) -> Environment<'a, N> {
        Environment {
            store,
            scheduler,
            requester,
            version,
            cancellation,
            groups: RefCell::new(Vec::new()),
            missing: Cell::new(false),
        }
    }

    /// Requests a single value, as a singleton dep-group.
    pub fn get_value(&self, key: &N) -> Option<N::Value> {
        match self.request_group(std::slice::from_ref(key)).remove(key) {
            Some(RequestOutcome::Value(v)) => Some(v),
            Some(RequestOutcome::Errored) | Some(RequestOutcome::Absent) | None => None,
        }
    }

    /// Requests several values at once, forming one dep-group whose members
    /// are re-checked concurrently (but whose group as a whole is sequenced
    /// with other groups) during revalidation.
    pub fn get_values(&self, keys: &[N]) -> FnvHashMap<N, Option<N::Value>> {
        self
            .request_group(keys)
            .into_iter()
            .map(|(k, outcome)| {
                let value = match outcome {
                    RequestOutcome::Value(v) => Some(v),
                    RequestOutcome::Errored | RequestOutcome::Absent => None,
                };
                (k, value)
            })
            .collect()
    }

    /// Error-transparent lookup: surfaces the dependency's error (if its
    /// declared error type matches) rather than collapsing it to absent.
    pub fn get_value_or_throw(&self, key: &N) -> ValueOrError<N> {
        match self.request_group(std::slice::from_ref(key)).remove(key) {
            Some(RequestOutcome::Value(v)) => ValueOrError::Value(v),
            Some(RequestOutcome::Errored) => ValueOrError::Error,
            Some(RequestOutcome::Absent) | None => ValueOrError::Absent,
        }
    }

    /// True if any lookup so far during this build attempt came back absent
    /// (dependency not yet `DONE`, or `DONE` with an error).
    pub fn values_missing(&self) -> bool {
        self.missing.get()
    }

    /// Whether the caller has requested that this pass be interrupted. A
    /// cooperative builder performing a long computation may poll this and
    /// return `BuildOutcome::MissingDeps` (or simply unwind) to participate in
    /// prompt cancellation; the engine does not force this.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn request_group(&self, keys: &[N]) -> FnvHashMap<N, RequestOutcome<N>> {
        let mut results = FnvHashMap::default();
        let mut group = Vec::with_capacity(keys.len());
        for key in keys {
            group.push(key.clone());
            let dep_id = self.store.get_or_create(key);
            self.store.add_edge(self.requester, dep_id);
            let outcome = match self.store.snapshot(dep_id) {
                EntrySnapshot::Done { value: Some(v), .. } => RequestOutcome::Value(v),
                EntrySnapshot::Done { value: None, .. } => {
                    self.missing.set(true);
                    RequestOutcome::Errored
                }
                EntrySnapshot::Pending => {
                    self.missing.set(true);
                    self.scheduler.ensure_started(self.store, dep_id);
                    RequestOutcome::Absent
                }
                EntrySnapshot::Deleted => {
                    self.missing.set(true);
                    RequestOutcome::Absent
                }
            };
            results.insert(key.clone(), outcome);
        }
        self.groups.borrow_mut().push(group);
        results
    }

    /// Consumes the environment, returning the dep-groups recorded during this
    /// build attempt and whether any lookup came back absent.
    pub(crate) fn into_parts(self) -> (Vec<DepGroup<N>>, bool) {
        (self.groups.into_inner(), self.missing.get())
    }
}

/// The result of an error-transparent dependency lookup.
pub enum ValueOrError<N: Node> {
    Value(N::Value),
    Error,
    Absent,
}
