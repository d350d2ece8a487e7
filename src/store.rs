// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use std::io::{self, Write};

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;
use petgraph::dot::Dot;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;

use crate::entry::{Entry, EntryState};
use crate::node::Node;

/// Stable identity of an entry within the graph's topology. Stays valid
/// across `delete` removing other entries (the crate uses `StableDiGraph`,
/// not `DiGraph`, precisely so removal doesn't invalidate indices still held
/// by in-flight workers).
pub type EntryId = petgraph::stable_graph::NodeIndex<u32>;

type PGraph<N> = StableDiGraph<Entry<N>, (), u32>;

/// A point-in-time read of an entry's value/error, enough for a dependent to
/// decide whether it's satisfied without taking the entry's own lock twice.
pub(crate) enum EntrySnapshot<N: Node> {
    Done { value: Option<N::Value> },
    Pending,
    Deleted,
}

pub(crate) struct InnerGraph<N: Node> {
    index: FnvHashMap<N, EntryId>,
    graph: PGraph<N>,
}

impl<N: Node> InnerGraph<N> {
    fn new() -> InnerGraph<N> {
        InnerGraph { index: FnvHashMap::default(), graph: PGraph::new() }
    }

    fn get_or_create(&mut self, node: &N) -> EntryId {
        if let Some(&id) = self.index.get(node) {
            return id;
        }
        let id = self.graph.add_node(Entry::new(node.clone()));
        self.index.insert(node.clone(), id);
        id
    }

    fn get(&self, node: &N) -> Option<EntryId> {
        self.index.get(node).copied()
    }

    fn entry(&self, id: EntryId) -> &Entry<N> {
        self.graph.node_weight(id).expect("EntryId outlived its entry")
    }

    fn add_edge(&mut self, src: EntryId, dst: EntryId) {
        if self.graph.find_edge(src, dst).is_none() {
            self.graph.add_edge(src, dst, ());
        }
    }

    fn remove_edges_from(&mut self, src: EntryId) {
        let edges: Vec<_> = self.graph.edges(src).map(|e| e.id()).collect();
        for edge in edges {
            self.graph.remove_edge(edge);
        }
    }

    fn rdeps_of(&self, id: EntryId) -> Vec<EntryId> {
        self.graph.neighbors_directed(id, Direction::Incoming).collect()
    }

    fn has_rdeps(&self, id: EntryId) -> bool {
        self.graph.neighbors_directed(id, Direction::Incoming).next().is_some()
    }

    fn remove_node(&mut self, id: EntryId) {
        if let Some(entry) = self.graph.node_weight(id) {
            self.index.remove(entry.node());
        }
        self.graph.remove_node(id);
    }

    fn all_ids(&self) -> Vec<EntryId> {
        self.graph.node_indices().collect()
    }
}

/// A thread-safe, keyed container of node entries.
///
/// Mirrors the teacher's `Graph<N>` wrapping `Mutex<InnerGraph<N>>`: the
/// graph-level lock protects only the topology (which keys exist, and the
/// edges between them) and is held only briefly; an entry's own state is then
/// read or transitioned under that entry's private lock.
pub struct GraphStore<N: Node> {
    inner: Mutex<InnerGraph<N>>,
}

impl<N: Node> GraphStore<N> {
    pub fn new() -> GraphStore<N> {
        GraphStore { inner: Mutex::new(InnerGraph::new()) }
    }

    /// Atomic get-or-create: exactly one creation wins for concurrent callers
    /// requesting the same key.
    pub(crate) fn get_or_create(&self, node: &N) -> EntryId {
        self.inner.lock().get_or_create(node)
    }

    /// Never blocks behind a build: only takes the short-lived topology lock.
    pub(crate) fn get(&self, node: &N) -> Option<EntryId> {
        self.inner.lock().get(node)
    }

    pub(crate) fn entry_handle(&self, id: EntryId) -> Entry<N> {
        self.inner.lock().entry(id).clone()
    }

    pub(crate) fn node_of(&self, id: EntryId) -> N {
        self.inner.lock().entry(id).node().clone()
    }

    pub(crate) fn add_edge(&self, src: EntryId, dst: EntryId) {
        self.inner.lock().add_edge(src, dst);
    }

    /// The entry's own recorded dep-groups, flattened in declaration order
    /// (deduplicated, keeping the first occurrence). This follows the order
    /// the builder actually requested its dependencies in — rather than the
    /// graph topology's edge list, ordered however `petgraph` happens to
    /// store it — which is what the cycle reporter needs to reproduce a
    /// deterministic, declaration-order-respecting walk (§4.5).
    pub(crate) fn declared_deps_of(&self, id: EntryId) -> Vec<EntryId> {
        // Clone the declared keys out while holding only the entry's own
        // lock, then resolve them to ids afterwards: `self.get` takes the
        // graph-level lock, and other call sites (e.g. `get_done_nodes`)
        // hold that lock first and an entry's lock second, so doing both at
        // once here in the opposite order would risk a deadlock.
        let ordered_keys: Vec<N> = {
            let entry = self.entry_handle(id);
            let guard = entry.state.lock();
            let groups: &[Vec<N>] = match &*guard {
                EntryState::Done(data) => &data.deps,
                EntryState::Dirty(data) => &data.deps,
                EntryState::CheckDependencies(data) => &data.deps,
                EntryState::Rebuilding(data) => &data.groups_so_far,
                EntryState::New | EntryState::Deleted => &[],
            };
            let mut seen = FnvHashSet::default();
            let mut out = Vec::new();
            for group in groups {
                for key in group {
                    if seen.insert(key.clone()) {
                        out.push(key.clone());
                    }
                }
            }
            out
        };
        ordered_keys.into_iter().filter_map(|key| self.get(&key)).collect()
    }

    pub(crate) fn rdeps_of(&self, id: EntryId) -> Vec<EntryId> {
        self.inner.lock().rdeps_of(id)
    }

    pub(crate) fn remove_edges_from(&self, id: EntryId) {
        self.inner.lock().remove_edges_from(id);
    }

    /// Removes `id` from the topology if (and only if) it has no remaining
    /// live reverse dependencies, matching the contract that deleted nodes
    /// leave the store only once their transitive rdeps have also been
    /// marked deleted.
    pub(crate) fn remove_if_unreferenced(&self, id: EntryId) {
        let mut inner = self.inner.lock();
        if !inner.has_rdeps(id) {
            inner.remove_node(id);
        }
    }

    pub(crate) fn all_ids(&self) -> Vec<EntryId> {
        self.inner.lock().all_ids()
    }

    pub(crate) fn is_done(&self, id: EntryId) -> bool {
        let entry = self.entry_handle(id);
        entry.state.lock().is_done()
    }

    pub(crate) fn snapshot(&self, id: EntryId) -> EntrySnapshot<N> {
        let entry = self.entry_handle(id);
        let state = entry.state.lock();
        match &*state {
            EntryState::Done(data) => EntrySnapshot::Done { value: data.value.clone() },
            EntryState::Deleted => EntrySnapshot::Deleted,
            EntryState::New | EntryState::Dirty(_) | EntryState::CheckDependencies(_) | EntryState::Rebuilding(_) => {
                EntrySnapshot::Pending
            }
        }
    }

    /// Snapshot of every live node's key, for introspection.
    pub fn get_nodes(&self) -> Vec<N> {
        let inner = self.inner.lock();
        inner.all_ids().into_iter().map(|id| inner.entry(id).node().clone()).collect()
    }

    /// Snapshot of every node currently `DONE`, successfully or not.
    pub fn get_done_nodes(&self) -> Vec<N> {
        let inner = self.inner.lock();
        inner
            .all_ids()
            .into_iter()
            .filter_map(|id| {
                let entry = inner.entry(id);
                if entry.state.lock().is_done() {
                    Some(entry.node().clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// A human-readable GraphViz dump of the current topology, including each
    /// node's current state tag. Not thread-safe with concurrent mutation:
    /// callers should only invoke this between `update` calls.
    pub fn dump<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let inner = self.inner.lock();
        let display = inner.graph.map(
            |_, entry| format!("{} [{:?}]", entry.node(), entry.state.lock().tag()),
            |_, _| "",
        );
        write!(writer, "{}", Dot::new(&display))
    }
}

impl<N: Node> Default for GraphStore<N> {
    fn default() -> GraphStore<N> {
        GraphStore::new()
    }
}
