// Copyright 2024 The increment_graph Authors. Licensed under the Apache License, Version 2.0.

use std::fmt;
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::{BuildOutcome, Engine, Environment, Node, RootOutcome, ValueOrError};

#[derive(Clone, Debug)]
struct NodeDef {
    deps: Vec<&'static str>,
    base_value: String,
    should_error: bool,
    tolerate_dep_errors: bool,
}

impl Default for NodeDef {
    fn default() -> NodeDef {
        NodeDef { deps: Vec::new(), base_value: String::new(), should_error: false, tolerate_dep_errors: false }
    }
}

/// Shared mutable configuration for a population of `TNode`s: what each key's
/// declared deps and base value are, whether it should currently fail, and a
/// log of every `build()` invocation for asserting rebuild counts.
#[derive(Default)]
struct TContext {
    defs: Mutex<FnvHashMap<&'static str, NodeDef>>,
    runs: Mutex<Vec<&'static str>>,
}

impl TContext {
    fn new() -> Arc<TContext> {
        Arc::new(TContext::default())
    }

    fn set(&self, key: &'static str, deps: Vec<&'static str>, base_value: &str) {
        self.defs.lock().unwrap().insert(key, NodeDef { deps, base_value: base_value.to_string(), ..Default::default() });
    }

    fn set_tolerant(&self, key: &'static str, deps: Vec<&'static str>, base_value: &str) {
        let mut defs = self.defs.lock().unwrap();
        defs.insert(
            key,
            NodeDef { deps, base_value: base_value.to_string(), tolerate_dep_errors: true, ..Default::default() },
        );
    }

    fn fail(&self, key: &'static str) {
        self.defs.lock().unwrap().entry(key).or_default().should_error = true;
    }

    fn unfail(&self, key: &'static str) {
        self.defs.lock().unwrap().entry(key).or_default().should_error = false;
    }

    fn set_base_value(&self, key: &'static str, base_value: &str) {
        self.defs.lock().unwrap().entry(key).or_default().base_value = base_value.to_string();
    }

    fn def(&self, key: &'static str) -> NodeDef {
        self.defs.lock().unwrap().entry(key).or_default().clone()
    }

    fn record_run(&self, key: &'static str) {
        self.runs.lock().unwrap().push(key);
    }

    fn run_count(&self, key: &'static str) -> usize {
        self.runs.lock().unwrap().iter().filter(|&&k| k == key).count()
    }

    fn clear_runs(&self) {
        self.runs.lock().unwrap().clear();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TError(String);

impl fmt::Display for TError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TError {}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TValue(String);

/// A node keyed by a static label, sharing one `TContext` per test graph.
/// Equality and hashing consider only the key: every `TNode` in a given test
/// carries the same `ctx`, so the key is the node's true identity.
#[derive(Clone)]
struct TNode {
    key: &'static str,
    ctx: Arc<TContext>,
}

impl TNode {
    fn new(ctx: &Arc<TContext>, key: &'static str) -> TNode {
        TNode { key, ctx: Arc::clone(ctx) }
    }
}

impl PartialEq for TNode {
    fn eq(&self, other: &TNode) -> bool {
        self.key == other.key
    }
}

impl Eq for TNode {}

impl std::hash::Hash for TNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for TNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TNode({})", self.key)
    }
}

impl fmt::Display for TNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

impl Node for TNode {
    type Value = TValue;
    type Error = TError;

    fn build(&self, env: &Environment<Self>) -> BuildOutcome<Self> {
        self.ctx.record_run(self.key);
        let def = self.ctx.def(self.key);
        if def.should_error {
            return BuildOutcome::Err(TError(format!("{} failed", self.key)));
        }
        if def.deps.is_empty() {
            return BuildOutcome::Done(TValue(def.base_value));
        }

        let mut combined = def.base_value;
        let mut pending = false;
        for dep_key in &def.deps {
            let dep = TNode::new(&self.ctx, dep_key);
            match env.get_value_or_throw(&dep) {
                ValueOrError::Value(v) => combined.push_str(&v.0),
                ValueOrError::Error => {
                    if !def.tolerate_dep_errors {
                        return BuildOutcome::Err(TError(format!("{} saw {} error", self.key, dep_key)));
                    }
                    combined.push_str("<err>");
                }
                ValueOrError::Absent => pending = true,
            }
        }
        if pending {
            return BuildOutcome::MissingDeps;
        }
        BuildOutcome::Done(TValue(combined))
    }
}

fn value_of<'a>(result: &'a crate::UpdateResult<TNode>, node: &TNode) -> Option<&'a str> {
    result.value(node).map(|v| v.0.as_str())
}

fn outcome_of<'a>(result: &'a crate::UpdateResult<TNode>, node: &TNode) -> &'a RootOutcome<TNode> {
    &result.roots.iter().find(|(n, _)| n == node).expect("root missing from result").1
}

#[test]
fn s1_straight_chain_suppresses_upstream_rebuild() {
    let ctx = TContext::new();
    ctx.set("C", vec![], "c");
    ctx.set("B", vec!["C"], "b");
    ctx.set("A", vec!["B"], "a");
    let engine: Engine<TNode> = Engine::new();
    let (a, c) = (TNode::new(&ctx, "A"), TNode::new(&ctx, "C"));

    let result = engine.update(&[a.clone()], true, 4, None);
    assert_eq!(value_of(&result, &a), Some("abc"));

    ctx.clear_runs();
    engine.invalidate(&[c.clone()]);
    let result = engine.update(&[a.clone()], true, 4, None);
    assert_eq!(value_of(&result, &a), Some("abc"));
    // C reruns (it was invalidated), but its output is unchanged, so neither
    // B nor A are rebuilt — only revalidated.
    assert_eq!(ctx.run_count("C"), 1);
    assert_eq!(ctx.run_count("B"), 0);
    assert_eq!(ctx.run_count("A"), 0);
}

#[test]
fn s1_changed_value_propagates() {
    let ctx = TContext::new();
    ctx.set("C", vec![], "c");
    ctx.set("B", vec!["C"], "b");
    ctx.set("A", vec!["B"], "a");
    let engine: Engine<TNode> = Engine::new();
    let (a, c) = (TNode::new(&ctx, "A"), TNode::new(&ctx, "C"));

    engine.update(&[a.clone()], true, 4, None);
    ctx.clear_runs();
    ctx.set_base_value("C", "c2");
    engine.invalidate(&[c.clone()]);
    let result = engine.update(&[a.clone()], true, 4, None);
    assert_eq!(value_of(&result, &a), Some("abc2"));
    assert_eq!(ctx.run_count("C"), 1);
    assert_eq!(ctx.run_count("B"), 1);
    assert_eq!(ctx.run_count("A"), 1);
}

#[test]
fn s2_diamond_revalidates_without_rebuild() {
    let ctx = TContext::new();
    ctx.set("D", vec![], "d");
    ctx.set("B", vec!["D"], "b");
    ctx.set("C", vec!["D"], "c");
    ctx.set("A", vec!["B", "C"], "a");
    let engine: Engine<TNode> = Engine::new();
    let a = TNode::new(&ctx, "A");
    let d = TNode::new(&ctx, "D");

    let first = engine.update(&[a.clone()], true, 4, None);
    assert!(value_of(&first, &a).is_some());

    ctx.clear_runs();
    engine.invalidate(&[d.clone()]);
    let second = engine.update(&[a.clone()], true, 4, None);
    assert_eq!(value_of(&second, &a), value_of(&first, &a));
    assert_eq!(ctx.run_count("D"), 1);
    assert_eq!(ctx.run_count("B"), 0);
    assert_eq!(ctx.run_count("C"), 0);
    assert_eq!(ctx.run_count("A"), 0);
}

#[test]
fn s3_two_node_cycle_reports_rotated_to_the_reporting_root() {
    let ctx = TContext::new();
    ctx.set("X", vec!["Y"], "");
    ctx.set("Y", vec!["X"], "");
    let engine: Engine<TNode> = Engine::new();
    let (x, y) = (TNode::new(&ctx, "X"), TNode::new(&ctx, "Y"));

    let result = engine.update(&[x.clone(), y.clone()], true, 4, None);

    match outcome_of(&result, &x) {
        RootOutcome::Cycle(cycles) => {
            assert_eq!(cycles.len(), 1);
            assert_eq!(cycles[0].cycle, vec![x.clone(), y.clone()]);
            assert!(cycles[0].path_to_cycle.is_empty());
        }
        other => panic!("expected a cycle for X, got {other:?}"),
    }
    match outcome_of(&result, &y) {
        RootOutcome::Cycle(cycles) => {
            assert_eq!(cycles.len(), 1);
            assert_eq!(cycles[0].cycle, vec![y.clone(), x.clone()]);
            assert!(cycles[0].path_to_cycle.is_empty());
        }
        other => panic!("expected a cycle for Y, got {other:?}"),
    }
}

impl fmt::Debug for RootOutcome<TNode> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootOutcome::Value(v) => write!(f, "Value({v:?})"),
            RootOutcome::Error(e) => write!(f, "Error({:?})", e.error),
            RootOutcome::Cycle(c) => write!(f, "Cycle({c:?})"),
        }
    }
}

#[test]
fn s4_cycle_via_longer_path_reports_once_per_first_step() {
    let ctx = TContext::new();
    // top -> a -> c -> top (the cycle), plus a -> b -> c (an alternate,
    // non-cyclic route into the same cycle that must not double-report it).
    ctx.set("top", vec!["a"], "");
    ctx.set("a", vec!["c", "b"], "");
    ctx.set("b", vec!["c"], "");
    ctx.set("c", vec!["top"], "");
    ctx.set("x", vec!["top"], "");
    let engine: Engine<TNode> = Engine::new();
    let top = TNode::new(&ctx, "top");
    let x = TNode::new(&ctx, "x");

    let result = engine.update(&[top.clone(), x.clone()], true, 4, None);

    match outcome_of(&result, &top) {
        RootOutcome::Cycle(cycles) => {
            assert_eq!(cycles.len(), 1, "expected exactly one cycle report for top, got {cycles:?}");
            assert_eq!(cycles[0].cycle, vec![top.clone(), TNode::new(&ctx, "a"), TNode::new(&ctx, "c")]);
            assert!(cycles[0].path_to_cycle.is_empty());
        }
        other => panic!("expected a cycle for top, got {other:?}"),
    }
    match outcome_of(&result, &x) {
        RootOutcome::Cycle(cycles) => {
            assert_eq!(cycles.len(), 1, "expected exactly one cycle report for x, got {cycles:?}");
            assert_eq!(cycles[0].cycle, vec![top.clone(), TNode::new(&ctx, "a"), TNode::new(&ctx, "c")]);
            assert_eq!(cycles[0].path_to_cycle, vec![x.clone()]);
        }
        other => panic!("expected a cycle for x, got {other:?}"),
    }
}

#[test]
fn s5_keep_going_tolerant_dependent_completes_despite_error() {
    let ctx = TContext::new();
    ctx.set("B", vec![], "b");
    ctx.fail("B");
    ctx.set("C", vec![], "c");
    ctx.set_tolerant("A", vec!["B", "C"], "a");
    let engine: Engine<TNode> = Engine::new();
    let a = TNode::new(&ctx, "A");

    let result = engine.update(&[a.clone()], true, 4, None);
    assert_eq!(value_of(&result, &a), Some("a<err>c"));
}

#[test]
fn s5_keep_going_intolerant_dependent_errors_with_transitive_cause() {
    let ctx = TContext::new();
    ctx.set("B", vec![], "b");
    ctx.fail("B");
    ctx.set("C", vec![], "c");
    ctx.set("A", vec!["B", "C"], "a");
    let engine: Engine<TNode> = Engine::new();
    let (a, b) = (TNode::new(&ctx, "A"), TNode::new(&ctx, "B"));

    let result = engine.update(&[a.clone()], true, 4, None);
    match outcome_of(&result, &a) {
        RootOutcome::Error(info) => {
            assert!(info.transitive_errors.contains(&b));
        }
        other => panic!("expected A to be errored, got {other:?}"),
    }
    assert!(result.has_error);
}

#[test]
fn s5_fail_fast_aborts_the_pass() {
    let ctx = TContext::new();
    ctx.set("B", vec![], "b");
    ctx.fail("B");
    ctx.set("C", vec![], "c");
    ctx.set("A", vec!["B", "C"], "a");
    let engine: Engine<TNode> = Engine::new();
    let a = TNode::new(&ctx, "A");

    let result = engine.update(&[a.clone()], false, 4, None);
    assert!(result.has_error);
    match outcome_of(&result, &a) {
        RootOutcome::Error(_) => {}
        other => panic!("expected A to be errored under fail-fast, got {other:?}"),
    }
}

#[test]
fn s6_injection_bypasses_the_builder_and_propagates_on_change() {
    let ctx = TContext::new();
    ctx.set("K", vec![], "should-not-run");
    ctx.set("R", vec!["K"], "r");
    let engine: Engine<TNode> = Engine::new();
    let (k, r) = (TNode::new(&ctx, "K"), TNode::new(&ctx, "R"));

    let mut values = FnvHashMap::default();
    values.insert(k.clone(), TValue("v1".to_string()));
    engine.inject(values).unwrap();

    let result = engine.update(&[k.clone()], true, 4, None);
    assert_eq!(value_of(&result, &k), Some("v1"));
    assert_eq!(ctx.run_count("K"), 0);

    let result = engine.update(&[r.clone()], true, 4, None);
    assert_eq!(value_of(&result, &r), Some("rv1"));

    ctx.clear_runs();
    let mut values = FnvHashMap::default();
    values.insert(k.clone(), TValue("v2".to_string()));
    engine.inject(values).unwrap();
    let result = engine.update(&[r.clone()], true, 4, None);
    assert_eq!(value_of(&result, &r), Some("rv2"));
    assert_eq!(ctx.run_count("K"), 0);
    assert_eq!(ctx.run_count("R"), 1);
}

#[test]
fn inject_conflict_rejects_derived_nodes() {
    let ctx = TContext::new();
    ctx.set("D", vec![], "d");
    ctx.set("R", vec!["D"], "r");
    let engine: Engine<TNode> = Engine::new();
    let r = TNode::new(&ctx, "R");

    engine.update(&[r.clone()], true, 4, None);

    let mut values = FnvHashMap::default();
    values.insert(r.clone(), TValue("bogus".to_string()));
    let err = engine.inject(values).unwrap_err();
    assert_eq!(err.0, r);
}

#[test]
fn delete_sweeps_up_already_dirty_nodes() {
    let ctx = TContext::new();
    ctx.set("Base", vec![], "base");
    ctx.set("Mid", vec!["Base"], "mid");
    ctx.set("Top", vec!["Mid"], "top");
    let engine: Engine<TNode> = Engine::new();
    let (base, mid, top) = (TNode::new(&ctx, "Base"), TNode::new(&ctx, "Mid"), TNode::new(&ctx, "Top"));

    engine.update(&[top.clone()], true, 4, None);
    // Dirty Mid (but don't revalidate it yet) before deleting Base.
    engine.invalidate(&[mid.clone()]);
    engine.delete(|n: &TNode| n == &base);

    let nodes = engine.get_nodes();
    assert!(!nodes.contains(&base));
    assert!(!nodes.contains(&mid), "a node dirty at the moment of deletion must be swept up too");
    assert!(!nodes.contains(&top));
}

#[test]
fn property_done_snapshot_and_dump_are_stable_without_new_input() {
    let ctx = TContext::new();
    ctx.set("D", vec![], "d");
    ctx.set("B", vec!["D"], "b");
    ctx.set("C", vec!["D"], "c");
    ctx.set("A", vec!["B", "C"], "a");
    let engine: Engine<TNode> = Engine::new();
    let a = TNode::new(&ctx, "A");
    let first = engine.update(&[a.clone()], true, 4, None);

    let done = engine.get_done_nodes();
    for key in ["A", "B", "C", "D"] {
        assert!(done.contains(&TNode::new(&ctx, key)), "{key} should be DONE after the first update");
    }

    let mut dot = Vec::new();
    engine.dump(&mut dot).expect("dump should not fail between updates");
    assert!(!dot.is_empty());

    // No invalidation since the first update: a second update must reproduce
    // the same value without rebuilding anything.
    ctx.clear_runs();
    let second = engine.update(&[a.clone()], true, 4, None);
    assert_eq!(value_of(&first, &a), value_of(&second, &a));
    assert_eq!(ctx.run_count("A"), 0);
    assert_eq!(ctx.run_count("B"), 0);
    assert_eq!(ctx.run_count("C"), 0);
    assert_eq!(ctx.run_count("D"), 0);
}

#[test]
fn randomized_invalidate_and_rebuild_converges() {
    let ctx = TContext::new();
    let keys: Vec<&'static str> = vec!["n0", "n1", "n2", "n3", "n4", "n5"];
    // A DAG: ni depends on n(i+1)..n5, so there is no cycle.
    for (idx, &key) in keys.iter().enumerate() {
        let deps: Vec<&'static str> = keys[idx + 1..].to_vec();
        ctx.set(key, deps, key);
    }
    let engine: Engine<TNode> = Engine::new();
    let root = TNode::new(&ctx, "n0");
    let mut rng = rand::rng();

    let first = engine.update(&[root.clone()], true, 4, None);
    assert!(value_of(&first, &root).is_some());

    for _ in 0..25 {
        let mut shuffled = keys.clone();
        shuffled.shuffle(&mut rng);
        let touch = &shuffled[..1 + rng.random_range(0..shuffled.len())];
        let touched: Vec<TNode> = touch.iter().map(|k| TNode::new(&ctx, k)).collect();
        engine.invalidate(&touched);
        let result = engine.update(&[root.clone()], true, 4, None);
        assert!(value_of(&result, &root).is_some(), "root should always resolve in an acyclic graph");
        assert!(!result.has_error);
    }
}
