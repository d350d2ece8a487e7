// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use fnv::FnvHashSet;
use parking_lot::Mutex;

use crate::cycles::report_cycles;
use crate::entry::{CheckDependenciesData, DoneData, EntryState, EntryStateTag, RebuildingData};
use crate::error::{EngineError, ErrorInfo};
use crate::node::{BuildOutcome, DepGroup, Environment, Node};
use crate::observer::ProgressObserver;
use crate::store::{EntryId, EntrySnapshot, GraphStore};
use crate::version::{relate_or_assume_changed, Generation, Relation};

/// A caller-initiated interrupt flag. Workers poll it between builder
/// invocations; a builder's `Environment` exposes it too so a cooperative
/// builder can bail out of a long computation early.
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Clone for CancellationToken {
    fn clone(&self) -> CancellationToken {
        CancellationToken(Arc::clone(&self.0))
    }
}

impl Default for CancellationToken {
    fn default() -> CancellationToken {
        CancellationToken::new()
    }
}

/// Per-engine counters surfaced for a host's own progress UI, grounded on the
/// teacher's `context::Stats`.
#[derive(Default)]
pub struct Stats {
    pub(crate) ran: AtomicUsize,
    pub(crate) revalidated: AtomicUsize,
    pub(crate) errored: AtomicUsize,
}

impl Stats {
    pub fn ran(&self) -> usize {
        self.ran.load(Ordering::Relaxed)
    }

    pub fn revalidated(&self) -> usize {
        self.revalidated.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> usize {
        self.errored.load(Ordering::Relaxed)
    }
}

/// Per-`update` tunables.
#[derive(Clone, Copy, Debug)]
pub struct EvaluatorConfig {
    pub parallelism: usize,
    pub keep_going: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> EvaluatorConfig {
        EvaluatorConfig { parallelism: 4, keep_going: true }
    }
}

enum WorkItem {
    Entry(EntryId),
    Stop,
}

/// The evaluator's shared work queue plus the bookkeeping needed to detect
/// when the pool has drained to quiescence.
pub(crate) struct Scheduler<N: Node> {
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    pending: Arc<AtomicUsize>,
    num_workers: usize,
    _marker: std::marker::PhantomData<N>,
}

impl<N: Node> Scheduler<N> {
    fn new(num_workers: usize) -> Scheduler<N> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Scheduler { tx, rx, pending: Arc::new(AtomicUsize::new(0)), num_workers, _marker: std::marker::PhantomData }
    }

    fn push(&self, id: EntryId) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        // The receivers outlive every sender of a given `update` call, so a
        // send can only fail if we mis-tracked `pending`, which is a bug.
        self.tx.send(WorkItem::Entry(id)).expect("scheduler queue closed while work was pending");
    }

    /// Kicks off a fresh node (first requested as a root, or first requested
    /// by some other node's `Environment`). A no-op if the node isn't `New`
    /// or `Dirty` — i.e. it's already under way or already resolved.
    pub(crate) fn ensure_started(&self, store: &GraphStore<N>, id: EntryId) {
        let entry = store.entry_handle(id);
        let mut guard = entry.state.lock();
        match &*guard {
            EntryState::New => {
                let run_token = entry.next_run_token();
                *guard = EntryState::Rebuilding(RebuildingData::fresh(run_token));
                drop(guard);
                self.push(id);
            }
            EntryState::Dirty(data) => {
                let force_rebuild = data.force_rebuild;
                let previous = std::mem::replace(&mut *guard, EntryState::Deleted);
                if let EntryState::Dirty(dirty) = previous {
                    *guard = if force_rebuild {
                        // Cleared, not merely dirtied: skip revalidation
                        // entirely and force the builder to run.
                        let run_token = entry.next_run_token();
                        EntryState::Rebuilding(RebuildingData::restart_from_dirty(run_token, dirty))
                    } else {
                        EntryState::CheckDependencies(CheckDependenciesData::from_dirty(dirty))
                    };
                }
                drop(guard);
                self.push(id);
            }
            _ => {}
        }
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            // We were the one to bring the outstanding count to zero: nobody
            // else has more work queued, so wake every worker to exit.
            self.stop_all();
        }
    }

    fn stop_all(&self) {
        for _ in 0..self.num_workers {
            let _ = self.tx.send(WorkItem::Stop);
        }
    }

    /// True if nothing has ever been pushed (and nothing is in flight). Used
    /// right after bootstrapping the roots: if every one of them was already
    /// `DONE`, no worker will ever call `finish` to trigger the usual
    /// quiescence broadcast, so the pool must be told to stop directly.
    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

struct FailFast<N: Node> {
    triggered: AtomicBool,
    error: Mutex<Option<(N, ErrorInfo<N>)>>,
}

impl<N: Node> FailFast<N> {
    fn new() -> FailFast<N> {
        FailFast { triggered: AtomicBool::new(false), error: Mutex::new(None) }
    }
}

struct EvalContext<'a, N: Node> {
    store: &'a GraphStore<N>,
    scheduler: &'a Scheduler<N>,
    version: Generation,
    keep_going: bool,
    cancellation: &'a CancellationToken,
    reporter: &'a dyn ProgressObserver<N>,
    stats: &'a Stats,
    fail_fast: &'a FailFast<N>,
}

/// The outcome of a single root, as returned by `update`.
pub enum RootOutcome<N: Node> {
    Value(N::Value),
    Error(ErrorInfo<N>),
    Cycle(Vec<crate::error::CycleInfo<N>>),
}

/// Runs the evaluator to quiescence for the given roots. Bumps no version
/// itself — the caller (`Engine::update`) does that before invoking this —
/// and reports one `RootOutcome` per root.
pub(crate) fn run<N: Node>(
    store: &GraphStore<N>,
    roots: &[N],
    config: EvaluatorConfig,
    version: Generation,
    cancellation: &CancellationToken,
    reporter: &dyn ProgressObserver<N>,
    stats: &Stats,
) -> Vec<(N, RootOutcome<N>)> {
    let scheduler = Scheduler::new(config.parallelism.max(1));
    let fail_fast = FailFast::new();
    let ctx = EvalContext {
        store,
        scheduler: &scheduler,
        version,
        keep_going: config.keep_going,
        cancellation,
        reporter,
        stats,
        fail_fast: &fail_fast,
    };

    let root_ids: Vec<EntryId> = roots
        .iter()
        .map(|root| {
            let id = store.get_or_create(root);
            scheduler.ensure_started(store, id);
            id
        })
        .collect();

    if scheduler.is_idle() {
        // Every root was already `DONE`: no worker will ever observe the
        // queue draining to zero, so nobody would otherwise broadcast `Stop`.
        scheduler.stop_all();
    }

    std::thread::scope(|scope| {
        for _ in 0..scheduler.num_workers {
            let ctx = &ctx;
            let scheduler = &scheduler;
            scope.spawn(move || worker_loop(ctx, scheduler));
        }
    });

    // Two passes: first diagnose every root (including running the lazy
    // cycle DFS against the still-unmarked graph), then mark cycle
    // participants `DONE`. Marking as we go would let an earlier root's
    // cycle members short-circuit a later root's DFS, since `DONE` nodes
    // terminate a search branch.
    let diagnosed: Vec<(N, RootOutcome<N>)> = root_ids
        .into_iter()
        .zip(roots.iter().cloned())
        .map(|(id, node)| (node, diagnose_root(store, &fail_fast, id)))
        .collect();

    for (_, outcome) in &diagnosed {
        if let RootOutcome::Cycle(cycles) = outcome {
            mark_cyclic(store, cycles);
        }
    }

    diagnosed
}

fn worker_loop<N: Node>(ctx: &EvalContext<N>, scheduler: &Scheduler<N>) {
    loop {
        match scheduler.rx.recv() {
            Ok(WorkItem::Stop) | Err(_) => break,
            Ok(WorkItem::Entry(id)) => {
                dispatch(ctx, id);
                scheduler.finish();
            }
        }
    }
}

fn dispatch<N: Node>(ctx: &EvalContext<N>, id: EntryId) {
    let entry = ctx.store.entry_handle(id);
    let ready = {
        let guard = entry.state.lock();
        match &*guard {
            EntryState::Rebuilding(data) => data.pending.is_none(),
            EntryState::CheckDependencies(data) => data.pending.is_empty(),
            _ => false,
        }
    };
    if !ready {
        return;
    }
    let is_rebuilding = matches!(&*entry.state.lock(), EntryState::Rebuilding(_));
    if is_rebuilding {
        run_build(ctx, id);
    } else {
        resume_check_dependencies(ctx, id);
    }
}

fn pending_keys<N: Node>(store: &GraphStore<N>, groups: &[DepGroup<N>]) -> FnvHashSet<N> {
    let mut pending = FnvHashSet::default();
    for group in groups {
        for key in group {
            if let Some(id) = store.get(key) {
                if !store.is_done(id) {
                    pending.insert(key.clone());
                }
            }
        }
    }
    pending
}

fn run_build<N: Node>(ctx: &EvalContext<N>, id: EntryId) {
    let entry = ctx.store.entry_handle(id);
    let run_token = {
        let guard = entry.state.lock();
        match &*guard {
            EntryState::Rebuilding(data) if data.pending.is_none() => data.run_token,
            _ => return,
        }
    };

    if ctx.cancellation.is_cancelled() {
        return;
    }

    ctx.reporter.enqueueing(entry.node());
    let env = Environment::new(ctx.store, ctx.scheduler, id, ctx.version, ctx.cancellation);
    let outcome = entry.node().build(&env);
    let (groups, missing) = env.into_parts();

    let mut guard = entry.state.lock();
    let still_current = matches!(&*guard, EntryState::Rebuilding(data) if data.run_token == run_token);
    if !still_current {
        // Invalidated out from under us (or already superseded): discard.
        return;
    }

    match outcome {
        BuildOutcome::MissingDeps => {
            debug_assert!(missing, "builder returned MissingDeps without any absent lookup");
            let still_pending = pending_keys(ctx.store, &groups);
            if still_pending.is_empty() {
                drop(guard);
                ctx.scheduler.push(id);
            } else if let EntryState::Rebuilding(data) = &mut *guard {
                data.groups_so_far = groups;
                data.pending = Some(still_pending);
            }
        }
        BuildOutcome::Done(value) => {
            ctx.stats.ran.fetch_add(1, Ordering::Relaxed);
            let (previous_value, baseline_changed) = match &*guard {
                EntryState::Rebuilding(data) => (data.previous_value.clone(), data.last_changed_version),
                _ => (None, ctx.version),
            };
            let last_changed_version =
                if previous_value.as_ref() == Some(&value) { baseline_changed } else { ctx.version };
            *guard = EntryState::Done(DoneData {
                value: Some(value),
                error: None,
                deps: groups,
                last_changed_version,
                last_evaluated_version: ctx.version,
            });
            drop(guard);
            ctx.reporter.evaluated(entry.node(), EntryStateTag::Done);
            signal_completion(ctx, id);
        }
        BuildOutcome::Err(error) => {
            ctx.stats.errored.fetch_add(1, Ordering::Relaxed);
            let baseline_changed = match &*guard {
                EntryState::Rebuilding(data) => data.last_changed_version,
                _ => ctx.version,
            };
            *guard = EntryState::Done(DoneData {
                value: None,
                error: Some(EngineError::Builder(error.clone())),
                deps: groups,
                last_changed_version: baseline_changed,
                last_evaluated_version: ctx.version,
            });
            drop(guard);
            ctx.reporter.evaluated(entry.node(), EntryStateTag::Done);
            if !ctx.keep_going && !ctx.fail_fast.triggered.swap(true, Ordering::SeqCst) {
                *ctx.fail_fast.error.lock() = Some((entry.node().clone(), ErrorInfo::builder(error)));
                ctx.cancellation.cancel();
            }
            signal_completion(ctx, id);
        }
    }
}

fn dep_last_changed_version<N: Node>(store: &GraphStore<N>, id: EntryId) -> Generation {
    let entry = store.entry_handle(id);
    match &*entry.state.lock() {
        EntryState::Done(data) => data.last_changed_version,
        _ => Generation::initial(),
    }
}

fn resume_check_dependencies<N: Node>(ctx: &EvalContext<N>, id: EntryId) {
    let entry = ctx.store.entry_handle(id);
    loop {
        if ctx.cancellation.is_cancelled() {
            return;
        }
        let (group, last_evaluated_version, at_end) = {
            let guard = entry.state.lock();
            match &*guard {
                EntryState::CheckDependencies(data) if data.pending.is_empty() => {
                    if data.group_cursor >= data.deps.len() {
                        (Vec::new(), data.last_evaluated_version, true)
                    } else {
                        (data.deps[data.group_cursor].clone(), data.last_evaluated_version, false)
                    }
                }
                _ => return,
            }
        };

        if at_end {
            let mut guard = entry.state.lock();
            let data = match &mut *guard {
                EntryState::CheckDependencies(data) => data,
                _ => return,
            };
            ctx.stats.revalidated.fetch_add(1, Ordering::Relaxed);
            let taken = std::mem::replace(
                data,
                CheckDependenciesData {
                    previous_value: None,
                    previous_error: None,
                    deps: Vec::new(),
                    last_changed_version: Generation::initial(),
                    last_evaluated_version: Generation::initial(),
                    group_cursor: 0,
                    pending: FnvHashSet::default(),
                },
            );
            *guard = EntryState::Done(DoneData {
                value: taken.previous_value,
                error: taken.previous_error,
                deps: taken.deps,
                last_changed_version: taken.last_changed_version,
                last_evaluated_version: ctx.version,
            });
            drop(guard);
            ctx.reporter.evaluated(entry.node(), EntryStateTag::Done);
            signal_completion(ctx, id);
            return;
        }

        let mut unresolved = FnvHashSet::default();
        let mut any_changed = false;
        for key in &group {
            let dep_id = ctx.store.get_or_create(key);
            ctx.store.add_edge(id, dep_id);
            match ctx.store.snapshot(dep_id) {
                EntrySnapshot::Done { .. } => {
                    let dep_changed = dep_last_changed_version(ctx.store, dep_id);
                    if relate_or_assume_changed(&dep_changed, &last_evaluated_version) == Relation::Descendant {
                        any_changed = true;
                    }
                }
                EntrySnapshot::Deleted => any_changed = true,
                EntrySnapshot::Pending => {
                    unresolved.insert(key.clone());
                    ctx.scheduler.ensure_started(ctx.store, dep_id);
                }
            }
        }

        if any_changed {
            let mut guard = entry.state.lock();
            let previous = std::mem::replace(&mut *guard, EntryState::Deleted);
            if let EntryState::CheckDependencies(check) = previous {
                let run_token = entry.next_run_token();
                *guard = EntryState::Rebuilding(RebuildingData::restart_from_check(run_token, check));
            }
            drop(guard);
            run_build(ctx, id);
            return;
        }

        if !unresolved.is_empty() {
            let mut guard = entry.state.lock();
            if let EntryState::CheckDependencies(data) = &mut *guard {
                data.pending = unresolved;
            }
            return;
        }

        let mut guard = entry.state.lock();
        if let EntryState::CheckDependencies(data) = &mut *guard {
            data.group_cursor += 1;
        }
        drop(guard);
        // Loop around: the next group may already be satisfied too.
    }
}

/// Wakes every rdep parked on `id`'s completion. A parked rdep only reacts if
/// `id`'s key is still present in its recorded pending set — late-added rdeps
/// (added after `id` already completed) never entered that set in the first
/// place, so they see the value directly and need no signal.
fn signal_completion<N: Node>(ctx: &EvalContext<N>, id: EntryId) {
    let dep_key = ctx.store.node_of(id);
    let rdep_ids = ctx.store.rdeps_of(id);
    for rdep_id in rdep_ids {
        let rdep = ctx.store.entry_handle(rdep_id);
        let should_wake = {
            let mut guard = rdep.state.lock();
            match &mut *guard {
                EntryState::CheckDependencies(data) => data.pending.remove(&dep_key) && data.pending.is_empty(),
                EntryState::Rebuilding(data) => match &mut data.pending {
                    Some(pending) => {
                        let woke = pending.remove(&dep_key) && pending.is_empty();
                        if woke {
                            data.pending = None;
                        }
                        woke
                    }
                    None => false,
                },
                _ => false,
            }
        };
        if should_wake {
            ctx.scheduler.push(rdep_id);
        }
    }
}

/// Diagnoses a single root without mutating cycle-participant state; see the
/// comment in `run` for why marking is deferred to a second pass.
fn diagnose_root<N: Node>(store: &GraphStore<N>, fail_fast: &FailFast<N>, id: EntryId) -> RootOutcome<N> {
    if fail_fast.triggered.load(Ordering::SeqCst) {
        if let Some((failed_node, info)) = fail_fast.error.lock().clone() {
            let node = store.node_of(id);
            if node == failed_node {
                return RootOutcome::Error(info);
            }
            return RootOutcome::Error(ErrorInfo::builder_interrupted());
        }
    }

    let entry = store.entry_handle(id);
    let guard = entry.state.lock();
    match &*guard {
        EntryState::Done(data) => match (&data.value, &data.error) {
            (Some(value), None) => RootOutcome::Value(value.clone()),
            (_, Some(EngineError::Cycle)) => {
                drop(guard);
                RootOutcome::Cycle(report_cycles(store, id))
            }
            (_, Some(_)) => {
                drop(guard);
                RootOutcome::Error(collect_error_info(store, id))
            }
            (None, None) => unreachable!("a DONE node always has a value or an error"),
        },
        _ => {
            // The pool drained without finishing this root: either a cycle or
            // (if `fail_fast` intervened) an interrupt the caller should retry.
            drop(guard);
            let cycles = report_cycles(store, id);
            if cycles.is_empty() {
                RootOutcome::Error(ErrorInfo::builder_interrupted())
            } else {
                RootOutcome::Cycle(cycles)
            }
        }
    }
}

fn collect_error_info<N: Node>(store: &GraphStore<N>, id: EntryId) -> ErrorInfo<N> {
    let entry = store.entry_handle(id);
    let guard = entry.state.lock();
    let (error, deps) = match &*guard {
        EntryState::Done(data) => (data.error.clone(), data.deps.clone()),
        _ => (None, Vec::new()),
    };
    drop(guard);
    let mut transitive = Vec::new();
    for group in &deps {
        for key in group {
            if let Some(dep_id) = store.get(key) {
                let dep_entry = store.entry_handle(dep_id);
                if let EntryState::Done(dep_data) = &*dep_entry.state.lock() {
                    if dep_data.error.is_some() {
                        transitive.push(key.clone());
                    }
                }
            }
        }
    }
    let info = match error {
        Some(EngineError::Builder(e)) => ErrorInfo::builder(e),
        Some(other) => ErrorInfo { error: other, transitive_errors: Vec::new(), cycles: Vec::new() },
        None => ErrorInfo { error: EngineError::Interrupted, transitive_errors: Vec::new(), cycles: Vec::new() },
    };
    info.with_transitive(transitive)
}

fn mark_cyclic<N: Node>(store: &GraphStore<N>, cycles: &[crate::error::CycleInfo<N>]) {
    for info in cycles {
        for key in &info.cycle {
            let Some(id) = store.get(key) else { continue };
            let entry = store.entry_handle(id);
            let mut guard = entry.state.lock();
            if !matches!(&*guard, EntryState::Done(_)) {
                *guard = EntryState::Done(DoneData {
                    value: None,
                    error: Some(EngineError::Cycle),
                    deps: Vec::new(),
                    last_changed_version: Generation::initial(),
                    last_evaluated_version: Generation::initial(),
                });
            }
        }
    }
}

impl<N: Node> ErrorInfo<N> {
    fn builder_interrupted() -> ErrorInfo<N> {
        ErrorInfo { error: EngineError::Interrupted, transitive_errors: Vec::new(), cycles: Vec::new() }
    }
}
