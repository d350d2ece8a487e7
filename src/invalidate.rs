// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use std::collections::VecDeque;
use std::fmt;

use fnv::{FnvHashMap, FnvHashSet};

use crate::entry::{DirtyData, EntryState, EntryStateTag};
use crate::node::Node;
use crate::observer::ProgressObserver;
use crate::store::{EntryId, GraphStore};
use crate::version::Generation;

/// Raised by `inject` when the caller targets a node that already has
/// builder-derived dependencies: injection must not blend with derivation.
#[derive(Debug)]
pub struct InjectConflict<N>(pub N);

impl<N: fmt::Display> fmt::Display for InjectConflict<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot inject over derived node {}", self.0)
    }
}

impl<N: fmt::Debug + fmt::Display> std::error::Error for InjectConflict<N> {}

/// Walks the transitive closure of rdeps from `roots`, marking every node
/// reached as `Dirty` (retaining its value) and reporting each transition.
/// The roots themselves are *cleared* rather than merely dirtied — their
/// `force_rebuild` flag is set so `ensure_started` routes them straight to a
/// full rebuild instead of `CheckDependencies` — matching the teacher's
/// `invalidate_from_roots`, which calls `entry.clear(false)` on the
/// predicate-matched roots and only dirties the rdeps reached beyond them:
/// a node named directly by `invalidate`/`invalidate_errors` is exactly the
/// one the caller has reason to believe is stale, so it must actually rerun
/// rather than risk revalidating straight back to `Done` unexamined.
/// Traversal order is unspecified; the relation is commutative and
/// idempotent, so multiple callers hitting overlapping roots concurrently is
/// safe modulo the per-entry locking already provided by `GraphStore`.
pub(crate) fn invalidate<N: Node>(store: &GraphStore<N>, keys: &[N], observer: &dyn ProgressObserver<N>) {
    let roots: Vec<EntryId> = keys.iter().filter_map(|k| store.get(k)).collect();
    walk_and_dirty(store, roots, observer);
}

/// Marks every currently-erroneous node dirty, mirroring `invalidate` but with
/// the roots computed from current state rather than caller-supplied keys.
pub(crate) fn invalidate_errors<N: Node>(store: &GraphStore<N>, observer: &dyn ProgressObserver<N>) {
    let roots: Vec<EntryId> = store
        .all_ids()
        .into_iter()
        .filter(|&id| {
            let entry = store.entry_handle(id);
            matches!(&*entry.state.lock(), EntryState::Done(data) if data.error.is_some())
        })
        .collect();
    walk_and_dirty(store, roots, observer);
}

fn walk_and_dirty<N: Node>(store: &GraphStore<N>, roots: Vec<EntryId>, observer: &dyn ProgressObserver<N>) {
    let root_set: FnvHashSet<EntryId> = roots.iter().copied().collect();
    let mut seen = FnvHashSet::default();
    let mut queue: VecDeque<EntryId> = roots.into_iter().collect();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let force_rebuild = root_set.contains(&id);
        let entry = store.entry_handle(id);
        let mut guard = entry.state.lock();
        let dirtied = match &*guard {
            EntryState::Done(data) => {
                *guard = EntryState::Dirty(DirtyData {
                    previous_value: data.value.clone(),
                    previous_error: data.error.clone(),
                    deps: data.deps.clone(),
                    last_changed_version: data.last_changed_version,
                    last_evaluated_version: data.last_evaluated_version,
                    force_rebuild,
                });
                true
            }
            EntryState::New | EntryState::Deleted => false,
            EntryState::Dirty(data) => {
                // Already dirty from an earlier call: only a transition from
                // merely-dirty to cleared is meaningful here, and only when
                // this call is the one naming it directly.
                if force_rebuild && !data.force_rebuild {
                    *guard = EntryState::Dirty(DirtyData {
                        previous_value: data.previous_value.clone(),
                        previous_error: data.previous_error.clone(),
                        deps: data.deps.clone(),
                        last_changed_version: data.last_changed_version,
                        last_evaluated_version: data.last_evaluated_version,
                        force_rebuild: true,
                    });
                }
                false
            }
            EntryState::CheckDependencies(data) => {
                // Abandon the in-flight revalidation, but keep whatever value
                // and error it already knows about — it was Dirty a moment
                // ago carrying exactly this data, and a second invalidation
                // before the first one finished re-checking deps must not
                // regress the retained value back to nothing.
                *guard = EntryState::Dirty(DirtyData {
                    previous_value: data.previous_value.clone(),
                    previous_error: data.previous_error.clone(),
                    deps: data.deps.clone(),
                    last_changed_version: data.last_changed_version,
                    last_evaluated_version: data.last_evaluated_version,
                    force_rebuild,
                });
                true
            }
            EntryState::Rebuilding(data) => {
                // A rebuild in flight only carries forward `previous_value`
                // and `last_changed_version` (not the full `Done` record it
                // started from); that's the most this path can retain
                // without reconstructing state the builder hasn't declared
                // yet. Its eventual result (if it lands late) is discarded by
                // the run-token/state-shape check in `run_build`.
                *guard = EntryState::Dirty(DirtyData {
                    previous_value: data.previous_value.clone(),
                    previous_error: None,
                    deps: Vec::new(),
                    last_changed_version: data.last_changed_version,
                    last_evaluated_version: Generation::initial(),
                    force_rebuild,
                });
                true
            }
        };
        drop(guard);
        if dirtied {
            observer.invalidated(entry.node(), EntryStateTag::Dirty);
            queue.extend(store.rdeps_of(id));
        }
    }
}

/// Marks every node matching `predicate`, plus the transitive closure of its
/// rdeps, as `Deleted`. Any node that was already `Dirty` at the moment of
/// deletion is swept up too, since deletion is meant to guarantee freshness
/// for nodes the caller no longer trusts. Once a deleted node's last live
/// rdep has also been deleted, it is removed from the store outright.
pub(crate) fn delete<N: Node>(store: &GraphStore<N>, predicate: impl Fn(&N) -> bool, observer: &dyn ProgressObserver<N>) {
    let mut seen = FnvHashSet::default();
    // Seed with every node matching the predicate, plus every node that is
    // already dirty: deletion is the hammer that guarantees freshness for
    // nodes the caller no longer trusts, and a dirty node's value is exactly
    // the kind of thing the caller shouldn't trust.
    let mut queue: VecDeque<EntryId> = store
        .all_ids()
        .into_iter()
        .filter(|&id| {
            let entry = store.entry_handle(id);
            predicate(entry.node()) || matches!(&*entry.state.lock(), EntryState::Dirty(_))
        })
        .collect();

    let mut touched = Vec::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let entry = store.entry_handle(id);
        let mut guard = entry.state.lock();
        if matches!(&*guard, EntryState::Deleted) {
            continue;
        }
        *guard = EntryState::Deleted;
        drop(guard);
        store.remove_edges_from(id);
        observer.invalidated(entry.node(), EntryStateTag::Deleted);
        touched.push(id);
        queue.extend(store.rdeps_of(id));
    }

    for id in touched {
        store.remove_if_unreferenced(id);
    }
}

/// Installs caller-supplied values, bypassing builders entirely. Injected
/// entries have empty `deps`; overwriting a node that has non-empty recorded
/// `deps` is rejected with `InjectConflict` before anything is mutated.
/// Overwriting a previously-injected (or now-stale) node invalidates its
/// rdeps, same as any other value change.
pub(crate) fn inject<N: Node>(
    store: &GraphStore<N>,
    values: FnvHashMap<N, N::Value>,
    current_version: Generation,
    observer: &dyn ProgressObserver<N>,
) -> Result<(), InjectConflict<N>> {
    for key in values.keys() {
        if let Some(id) = store.get(key) {
            let entry = store.entry_handle(id);
            let has_derivation = matches!(&*entry.state.lock(), EntryState::Done(data) if !data.deps.is_empty());
            if has_derivation {
                return Err(InjectConflict(key.clone()));
            }
        }
    }

    let next_version = current_version.next();
    for (key, value) in values {
        let id = store.get_or_create(&key);
        let entry = store.entry_handle(id);
        let mut guard = entry.state.lock();
        let (previous_value, previous_changed) = match &*guard {
            EntryState::Done(data) => (data.value.clone(), data.last_changed_version),
            _ => (None, next_version),
        };
        let unchanged = previous_value.as_ref() == Some(&value);
        let last_changed_version = if unchanged { previous_changed } else { next_version };
        *guard = EntryState::Done(crate::entry::DoneData {
            value: Some(value),
            error: None,
            deps: Vec::new(),
            last_changed_version,
            last_evaluated_version: next_version,
        });
        drop(guard);
        observer.evaluated(entry.node(), EntryStateTag::Done);
        if !unchanged {
            walk_and_dirty(store, store.rdeps_of(id), observer);
        }
    }
    Ok(())
}
