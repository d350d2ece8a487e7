// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use fnv::FnvHashSet;

use crate::error::CycleInfo;
use crate::node::Node;
use crate::store::{EntryId, GraphStore};

/// Performs the lazy cycle discovery described for a stuck root: a bounded
/// depth-first search through `deps` edges, with `DONE` nodes terminating a
/// branch. Explores every direct child of `root` independently so that a
/// cycle reachable via more than one first-step child is reported once per
/// distinct first step (S4), while the *same* first step never contributes
/// more than one report.
pub(crate) fn report_cycles<N: Node>(store: &GraphStore<N>, root: EntryId) -> Vec<CycleInfo<N>> {
    let mut infos = Vec::new();
    let mut emitted: Vec<Vec<EntryId>> = Vec::new();

    for first_step in store.declared_deps_of(root) {
        let mut path = vec![root];
        let mut visited = FnvHashSet::default();
        let Some(raw_cycle) = dfs_find_cycle(store, first_step, &mut path, &mut visited) else {
            continue;
        };

        if let Some(pos) = raw_cycle.iter().position(|&n| n == root) {
            // The reporting root participates directly: rotate so it leads.
            let mut rotated = raw_cycle[pos..].to_vec();
            rotated.extend_from_slice(&raw_cycle[..pos]);
            if emitted.contains(&rotated) {
                continue;
            }
            emitted.push(rotated.clone());
            infos.push(CycleInfo { cycle: to_nodes(store, &rotated), path_to_cycle: Vec::new() });
        } else {
            if emitted.contains(&raw_cycle) {
                continue;
            }
            emitted.push(raw_cycle.clone());
            infos.push(CycleInfo { cycle: to_nodes(store, &raw_cycle), path_to_cycle: vec![store.node_of(root)] });
        }
    }

    infos
}

/// Depth-first search for a cycle reachable from `node`, appending to `path`
/// as it descends. Returns the cyclic suffix of `path` (from the first
/// occurrence of the repeated node to the end) the moment `node` is found
/// already on the current path.
fn dfs_find_cycle<N: Node>(
    store: &GraphStore<N>,
    node: EntryId,
    path: &mut Vec<EntryId>,
    visited: &mut FnvHashSet<EntryId>,
) -> Option<Vec<EntryId>> {
    if let Some(pos) = path.iter().position(|&n| n == node) {
        return Some(path[pos..].to_vec());
    }
    if store.is_done(node) {
        return None;
    }
    if !visited.insert(node) {
        return None;
    }
    path.push(node);
    for dep in store.declared_deps_of(node) {
        if let Some(cycle) = dfs_find_cycle(store, dep, path, visited) {
            return Some(cycle);
        }
    }
    path.pop();
    None
}

fn to_nodes<N: Node>(store: &GraphStore<N>, ids: &[EntryId]) -> Vec<N> {
    ids.iter().map(|&id| store.node_of(id)).collect()
}
