// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use fnv::FnvHashSet;
use parking_lot::Mutex;

use crate::error::EngineError;
use crate::node::{DepGroup, Node};
use crate::version::Generation;

/// Distinguishes completed builds from stale ones racing against a concurrent
/// invalidation: every time an entry leaves `Dirty` for `Rebuilding`, its
/// `RunToken` advances, and a worker that was mid-build under a since-replaced
/// token discards its result instead of committing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RunToken(u32);

impl RunToken {
    fn new(value: u32) -> RunToken {
        RunToken(value)
    }
}

/// A coarse snapshot of `EntryState`, exposed to `ProgressObserver` and used
/// for introspection; carries no data, just the variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryStateTag {
    New,
    Dirty,
    CheckDependencies,
    Rebuilding,
    Done,
    Deleted,
}

pub(crate) struct DirtyData<N: Node> {
    pub(crate) previous_value: Option<N::Value>,
    pub(crate) previous_error: Option<EngineError<N::Error>>,
    pub(crate) deps: Vec<DepGroup<N>>,
    pub(crate) last_changed_version: Generation,
    pub(crate) last_evaluated_version: Generation,
    /// Set for a node directly named by `invalidate`/`invalidate_errors`
    /// (as opposed to one reached only transitively via rdeps): such a node
    /// is cleared rather than merely dirtied, so `ensure_started` routes it
    /// straight to `Rebuilding` instead of `CheckDependencies`, forcing the
    /// builder to run rather than letting revalidation short-circuit it.
    pub(crate) force_rebuild: bool,
}

pub(crate) struct CheckDependenciesData<N: Node> {
    pub(crate) previous_value: Option<N::Value>,
    pub(crate) previous_error: Option<EngineError<N::Error>>,
    pub(crate) deps: Vec<DepGroup<N>>,
    pub(crate) last_changed_version: Generation,
    pub(crate) last_evaluated_version: Generation,
    /// Index of the dep-group currently being (re)checked.
    pub(crate) group_cursor: usize,
    /// Members of the group at `group_cursor` not yet confirmed `DONE`. Empty
    /// means the group is ready to be compared; the entry is then eligible for
    /// dispatch again.
    pub(crate) pending: FnvHashSet<N>,
}

impl<N: Node> CheckDependenciesData<N> {
    pub(crate) fn from_dirty(dirty: DirtyData<N>) -> CheckDependenciesData<N> {
        CheckDependenciesData {
            previous_value: dirty.previous_value,
            previous_error: dirty.previous_error,
            deps: dirty.deps,
            last_changed_version: dirty.last_changed_version,
            last_evaluated_version: dirty.last_evaluated_version,
            group_cursor: 0,
            pending: FnvHashSet::default(),
        }
    }
}

pub(crate) struct RebuildingData<N: Node> {
    pub(crate) run_token: RunToken,
    pub(crate) previous_value: Option<N::Value>,
    pub(crate) last_changed_version: Generation,
    /// Dep-groups declared so far during the current build attempt; replaced
    /// wholesale on every restart (builders re-declare deps from scratch).
    pub(crate) groups_so_far: Vec<DepGroup<N>>,
    /// `Some` while parked on outstanding deps from the most recent
    /// `MissingDeps` restart request; `None` means this entry is ready for a
    /// worker to invoke (or re-invoke) the builder.
    pub(crate) pending: Option<FnvHashSet<N>>,
}

impl<N: Node> RebuildingData<N> {
    pub(crate) fn fresh(run_token: RunToken) -> RebuildingData<N> {
        RebuildingData {
            run_token,
            previous_value: None,
            last_changed_version: Generation::initial(),
            groups_so_far: Vec::new(),
            pending: None,
        }
    }

    pub(crate) fn restart_from_dirty(run_token: RunToken, dirty: DirtyData<N>) -> RebuildingData<N> {
        RebuildingData {
            run_token,
            previous_value: dirty.previous_value,
            last_changed_version: dirty.last_changed_version,
            groups_so_far: Vec::new(),
            pending: None,
        }
    }

    pub(crate) fn restart_from_check(run_token: RunToken, check: CheckDependenciesData<N>) -> RebuildingData<N> {
        RebuildingData {
            run_token,
            previous_value: check.previous_value,
            last_changed_version: check.last_changed_version,
            groups_so_far: Vec::new(),
            pending: None,
        }
    }
}

pub(crate) struct DoneData<N: Node> {
    pub(crate) value: Option<N::Value>,
    pub(crate) error: Option<EngineError<N::Error>>,
    pub(crate) deps: Vec<DepGroup<N>>,
    pub(crate) last_changed_version: Generation,
    pub(crate) last_evaluated_version: Generation,
}

pub(crate) enum EntryState<N: Node> {
    New,
    Dirty(DirtyData<N>),
    CheckDependencies(CheckDependenciesData<N>),
    Rebuilding(RebuildingData<N>),
    Done(DoneData<N>),
    Deleted,
}

impl<N: Node> EntryState<N> {
    pub(crate) fn tag(&self) -> EntryStateTag {
        match self {
            EntryState::New => EntryStateTag::New,
            EntryState::Dirty(_) => EntryStateTag::Dirty,
            EntryState::CheckDependencies(_) => EntryStateTag::CheckDependencies,
            EntryState::Rebuilding(_) => EntryStateTag::Rebuilding,
            EntryState::Done(_) => EntryStateTag::Done,
            EntryState::Deleted => EntryStateTag::Deleted,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, EntryState::Done(_))
    }
}

/// A node and its current state, sharing cheap `Arc` handles so that the
/// graph-level lock only needs to be held long enough to look an entry up;
/// the entry's own transitions are then serialized by its own mutex.
pub(crate) struct Entry<N: Node> {
    node: Arc<N>,
    pub(crate) state: Arc<Mutex<EntryState<N>>>,
    /// Generates this entry's `RunToken`s. Lives outside `EntryState` (rather
    /// than being reset whenever the entry leaves `Rebuilding`) precisely so a
    /// worker abandoned by a concurrent invalidation can never be confused
    /// with a later, unrelated build attempt that happens to start from the
    /// same baseline token.
    run_tokens: Arc<AtomicU32>,
}

impl<N: Node> Entry<N> {
    pub(crate) fn new(node: N) -> Entry<N> {
        Entry {
            node: Arc::new(node),
            state: Arc::new(Mutex::new(EntryState::New)),
            run_tokens: Arc::new(AtomicU32::new(0)),
        }
    }

    pub(crate) fn node(&self) -> &N {
        &self.node
    }

    pub(crate) fn next_run_token(&self) -> RunToken {
        RunToken::new(self.run_tokens.fetch_add(1, Ordering::SeqCst))
    }
}

impl<N: Node> Clone for Entry<N> {
    fn clone(&self) -> Entry<N> {
        Entry { node: Arc::clone(&self.node), state: Arc::clone(&self.state), run_tokens: Arc::clone(&self.run_tokens) }
    }
}
