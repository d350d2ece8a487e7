// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

//! A parallel, cache-aware incremental evaluation engine for keyed dependency
//! graphs: the core of a larger build tool, but domain-agnostic. Host code
//! supplies [`Node`] implementations — keyed, hashable builders — and drives
//! the graph through [`Engine::invalidate`], [`Engine::delete`],
//! [`Engine::inject`], and [`Engine::update`].

mod cycles;
mod entry;
mod error;
mod evaluate;
mod invalidate;
mod node;
mod observer;
mod store;
mod version;

#[cfg(test)]
mod tests;

pub use crate::entry::EntryStateTag;
pub use crate::error::{CycleInfo, EngineError, ErrorInfo};
pub use crate::evaluate::{CancellationToken, EvaluatorConfig, RootOutcome, Stats};
pub use crate::invalidate::InjectConflict;
pub use crate::node::{BuildOutcome, DepGroup, Environment, Node, ValueOrError};
pub use crate::observer::{NullObserver, ProgressObserver};
pub use crate::store::{EntryId, GraphStore};
pub use crate::version::{Generation, Relation, Version};

use fnv::FnvHashMap;
use parking_lot::Mutex;

/// Construction-time defaults, used whenever a call to `update` doesn't
/// override them.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub default_parallelism: usize,
    pub default_keep_going: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig { default_parallelism: num_cpus_fallback(), default_keep_going: true }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(std::num::NonZeroUsize::get).unwrap_or(4)
}

/// The result of a single `update` pass: one outcome per requested root, plus
/// a summary flag.
pub struct UpdateResult<N: Node> {
    pub roots: Vec<(N, RootOutcome<N>)>,
    pub has_error: bool,
}

impl<N: Node> UpdateResult<N> {
    /// The value for a given root, if it completed successfully. Returns
    /// `None` for roots not present in this result or that ended up errored
    /// or cyclic.
    pub fn value(&self, node: &N) -> Option<&N::Value> {
        self.roots.iter().find(|(n, _)| n == node).and_then(|(_, outcome)| match outcome {
            RootOutcome::Value(v) => Some(v),
            _ => None,
        })
    }
}

/// A keyed, incrementally-maintained dependency graph driven by `N`'s
/// `build` implementations.
pub struct Engine<N: Node> {
    store: GraphStore<N>,
    current_version: Mutex<Generation>,
    stats: Stats,
    config: EngineConfig,
}

impl<N: Node> Engine<N> {
    pub fn new() -> Engine<N> {
        Engine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Engine<N> {
        Engine { store: GraphStore::new(), current_version: Mutex::new(Generation::initial()), stats: Stats::default(), config }
    }

    pub fn current_version(&self) -> Generation {
        *self.current_version.lock()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Marks each listed node (and the transitive closure of its rdeps) dirty.
    /// Values are retained so a later revalidation can short-circuit.
    pub fn invalidate(&self, keys: &[N]) {
        self.invalidate_with_observer(keys, &NullObserver);
    }

    pub fn invalidate_with_observer(&self, keys: &[N], observer: &dyn ProgressObserver<N>) {
        invalidate::invalidate(&self.store, keys, observer);
    }

    /// Marks every currently-erroneous node dirty.
    pub fn invalidate_errors(&self) {
        self.invalidate_errors_with_observer(&NullObserver);
    }

    pub fn invalidate_errors_with_observer(&self, observer: &dyn ProgressObserver<N>) {
        invalidate::invalidate_errors(&self.store, observer);
    }

    /// Deep-deletes every node matching `predicate`, plus its transitive
    /// rdeps and any node that was already dirty.
    pub fn delete(&self, predicate: impl Fn(&N) -> bool) {
        self.delete_with_observer(predicate, &NullObserver);
    }

    pub fn delete_with_observer(&self, predicate: impl Fn(&N) -> bool, observer: &dyn ProgressObserver<N>) {
        invalidate::delete(&self.store, predicate, observer);
    }

    /// Installs caller-supplied values, bypassing builders. Fails if any
    /// target node already has builder-derived dependencies.
    pub fn inject(&self, values: FnvHashMap<N, N::Value>) -> Result<(), InjectConflict<N>> {
        self.inject_with_observer(values, &NullObserver)
    }

    pub fn inject_with_observer(
        &self,
        values: FnvHashMap<N, N::Value>,
        observer: &dyn ProgressObserver<N>,
    ) -> Result<(), InjectConflict<N>> {
        invalidate::inject(&self.store, values, self.current_version(), observer)
    }

    /// Runs to quiescence: bumps the graph version, then evaluates `roots`
    /// (and whatever they transitively require) until each is `DONE`, proven
    /// erroneous, or (fail-fast) the pass is aborted by the first error.
    pub fn update(
        &self,
        roots: &[N],
        keep_going: bool,
        parallelism: usize,
        reporter: Option<&dyn ProgressObserver<N>>,
    ) -> UpdateResult<N> {
        let version = {
            let mut current = self.current_version.lock();
            *current = current.next();
            *current
        };
        let cancellation = CancellationToken::new();
        let reporter: &dyn ProgressObserver<N> = reporter.unwrap_or(&NullObserver);
        let config = EvaluatorConfig { parallelism, keep_going };
        let roots_vec = evaluate::run(&self.store, roots, config, version, &cancellation, reporter, &self.stats);
        let has_error = roots_vec.iter().any(|(_, outcome)| !matches!(outcome, RootOutcome::Value(_)));
        UpdateResult { roots: roots_vec, has_error }
    }

    /// `update`, filling in `parallelism`/`keep_going` from this engine's
    /// construction-time `EngineConfig`.
    pub fn update_with_defaults(&self, roots: &[N], reporter: Option<&dyn ProgressObserver<N>>) -> UpdateResult<N> {
        self.update(roots, self.config.default_keep_going, self.config.default_parallelism, reporter)
    }

    /// Snapshot of every live node's key.
    pub fn get_nodes(&self) -> Vec<N> {
        self.store.get_nodes()
    }

    /// Snapshot of every node currently `DONE`.
    pub fn get_done_nodes(&self) -> Vec<N> {
        self.store.get_done_nodes()
    }

    /// A human-readable GraphViz dump of the current topology. Not
    /// thread-safe with a concurrent `update`.
    pub fn dump<W: std::io::Write>(&self, writer: W) -> std::io::Result<()> {
        self.store.dump(writer)
    }
}

impl<N: Node> Default for Engine<N> {
    fn default() -> Engine<N> {
        Engine::new()
    }
}
