//! End-to-end scenarios through [`Machine::call`].
//!
//! These tests drive whole plans through the store and the locks, and observe
//! transitions through recorded lifecycle hooks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::engine::Machine;
use crate::error::TrellisError;
use crate::handler::{Handler, LeafCall, Reply};
use crate::persistence::{InMemoryLocks, InMemoryStore, StateStore};
use crate::plan::{GraphDecl, Plan};
use crate::testing::{arrow_on, HookLog};

// ==========================================================================
// Helpers
// ==========================================================================

fn machine(plan: Plan) -> (Machine, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let machine = Machine::builder(plan).with_store(store.clone()).build();
    (machine, store)
}

fn entered(log: &HookLog) -> Vec<String> {
    log.events()
        .into_iter()
        .filter(|e| e.hook == "onEntry")
        .map(|e| e.node)
        .collect()
}

fn left(log: &HookLog) -> Vec<String> {
    log.events()
        .into_iter()
        .filter(|e| e.hook == "afterLeft")
        .map(|e| e.node)
        .collect()
}

// ==========================================================================
// Transitions
// ==========================================================================

#[tokio::test]
async fn test_leaf_arrow_moves_graph() {
    let log = HookLog::new();
    let plan = Plan::new("ab")
        .graph("main", GraphDecl::new().node("A").node("B").arrow("A", "x", "B"))
        .leaf("A")
        .leaf("B")
        .bind("main:A", log.record(arrow_on("go", "x")))
        .bind("main:B", log.record(Handler::new()));
    let (machine, store) = machine(plan);

    machine.call("m", "go", json!({})).await.unwrap();

    assert_eq!(left(&log), vec!["main:A"]);
    assert_eq!(entered(&log), vec!["main:B"]);
    let saved = store.load("m").await.unwrap().unwrap();
    assert_eq!(saved.active.get("main").map(String::as_str), Some("main:B"));
}

fn twin_loops(log: &HookLog, target: &str) -> Plan {
    let branch = GraphDecl::new().node("X").node("Y").arrow("X", "self", target);
    Plan::new("twins")
        .composite("main", ["L", "R"])
        .graph("L", branch.clone())
        .graph("R", branch)
        .leaf("X")
        .leaf("Y")
        .bind("main:L:X", log.record(arrow_on("poke", "self")))
        .bind("main:R:X", log.record(arrow_on("poke", "self")))
        .bind("main:L:Y", log.record(Handler::new()))
        .bind("main:R:Y", log.record(Handler::new()))
}

#[tokio::test]
async fn test_composite_self_loops_are_noops() {
    let log = HookLog::new();
    let (machine, store) = machine(twin_loops(&log, "X"));

    machine.call("t", "poke", json!({})).await.unwrap();
    let first = store.load("t").await.unwrap().unwrap();
    machine.call("t", "poke", json!({})).await.unwrap();
    let second = store.load("t").await.unwrap().unwrap();

    assert!(log.events().is_empty());
    assert_eq!(first.active, second.active);
    assert_eq!(first.instance_ids, second.instance_ids);
}

#[tokio::test]
async fn test_composite_loops_to_other_child_move_both_branches() {
    let log = HookLog::new();
    let (machine, store) = machine(twin_loops(&log, "Y"));

    machine.call("t", "poke", json!({})).await.unwrap();

    let mut left = left(&log);
    left.sort();
    let mut entered = entered(&log);
    entered.sort();
    assert_eq!(left, vec!["main:L:X", "main:R:X"]);
    assert_eq!(entered, vec!["main:L:Y", "main:R:Y"]);

    let saved = store.load("t").await.unwrap().unwrap();
    assert_eq!(saved.active_child("main:L"), Some("main:L:Y"));
    assert_eq!(saved.active_child("main:R"), Some("main:R:Y"));
}

#[tokio::test]
async fn test_conflicting_branches_leave_state_untouched() {
    let plan = Plan::new("split")
        .graph(
            "main",
            GraphDecl::new()
                .node("C")
                .node("X")
                .node("Y")
                .arrow("C", "toX", "X")
                .arrow("C", "toY", "Y"),
        )
        .composite("C", ["P", "Q"])
        .leaf("P")
        .leaf("Q")
        .leaf("X")
        .leaf("Y")
        .bind(
            "main:C:P",
            Handler::new()
                .on("split", |_c: LeafCall| async move { Ok(Reply::new().with_arrow("toX")) })
                .on("touch", |c: LeafCall| async move {
                    let mut ctx = c.ctx;
                    ctx["touched"] = json!(true);
                    Ok(Reply::new().with_ctx(ctx))
                }),
        )
        .bind("main:C:Q", arrow_on("split", "toY"));
    let (machine, store) = machine(plan);

    machine.call("s", "touch", json!({})).await.unwrap();
    let before = store.load("s").await.unwrap().unwrap();

    let err = machine.call("s", "split", json!({})).await.unwrap_err();
    assert!(matches!(err, TrellisError::InvalidTransition { ref node, .. } if node == "main"));
    assert_eq!(store.load("s").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_idle_self_loop_beside_a_move_is_rejected() {
    let log = HookLog::new();
    let plan = Plan::new("stay-or-go")
        .graph(
            "main",
            GraphDecl::new()
                .node("C")
                .node("X")
                .arrow("C", "stay", "C")
                .arrow("C", "toX", "X"),
        )
        .composite("C", ["P", "Q"])
        .leaf("P")
        .leaf("Q")
        .leaf("X")
        .bind("main:C:P", log.record(arrow_on("split", "stay")))
        .bind("main:C:Q", log.record(arrow_on("split", "toX")))
        .bind("main:X", log.record(Handler::new()));
    let (machine, store) = machine(plan);

    machine.call("s", "look", json!({})).await.unwrap();
    let before = store.load("s").await.unwrap().unwrap();

    let err = machine.call("s", "split", json!({})).await.unwrap_err();
    assert!(matches!(err, TrellisError::InvalidTransition { ref node, .. } if node == "main"));
    assert!(log.events().is_empty());
    assert_eq!(store.load("s").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_context_only_call_keeps_tree_and_ids() {
    let plan = Plan::new("note")
        .composite("main", ["Pad", "Clock"])
        .graph("Pad", GraphDecl::new().node("Blank").node("Full"))
        .leaf("Blank")
        .leaf("Full")
        .leaf("Clock")
        .bind(
            "main:Pad:Blank",
            Handler::new().on("write", |c: LeafCall| async move {
                let mut ctx = c.ctx;
                ctx["text"] = c.params["text"].clone();
                Ok(Reply::new().with_ctx(ctx))
            }),
        );
    let (machine, store) = machine(plan);

    machine.call("n", "write", json!({"text": "draft"})).await.unwrap();
    let first = store.load("n").await.unwrap().unwrap();
    machine.call("n", "write", json!({"text": "hi"})).await.unwrap();
    let saved = store.load("n").await.unwrap().unwrap();

    assert_eq!(saved.active, first.active);
    assert_eq!(saved.instance_ids, first.instance_ids);
    assert_eq!(saved.context, json!({"text": "hi"}));
    assert_eq!(saved.revision, first.revision + 1);
}

#[tokio::test]
async fn test_history_resumes_last_child() {
    let plan = Plan::new("player")
        .graph(
            "main",
            GraphDecl::new()
                .node("Playing")
                .node("Paused")
                .arrow("Playing", "pause", "Paused")
                .arrow_via("Paused", "resume", "Playing", "history"),
        )
        .graph(
            "Playing",
            GraphDecl::new()
                .node("Intro")
                .node("Chorus")
                .arrow("Intro", "next", "Chorus"),
        )
        .leaf("Intro")
        .leaf("Chorus")
        .leaf("Paused")
        .bind("main:Playing:Intro", arrow_on("next", "next"))
        .bind("main:Playing:Chorus", arrow_on("pause", "pause"))
        .bind("main:Paused", arrow_on("resume", "resume"));
    let (machine, _) = machine(plan);

    machine.call("p", "next", json!({})).await.unwrap();
    machine.call("p", "pause", json!({})).await.unwrap();
    assert_eq!(machine.state("p").await.unwrap().active_child("main"), Some("main:Paused"));

    machine.call("p", "resume", json!({})).await.unwrap();
    let state = machine.state("p").await.unwrap();
    assert_eq!(state.active_child("main"), Some("main:Playing"));
    assert_eq!(state.active_child("main:Playing"), Some("main:Playing:Chorus"));
}

#[tokio::test]
async fn test_instance_ids_rotate_only_for_left_nodes() {
    let plan = Plan::new("house")
        .composite("main", ["Door", "Light"])
        .graph(
            "Door",
            GraphDecl::new()
                .node("Closed")
                .node("Open")
                .arrow("Closed", "open", "Open")
                .arrow("Open", "slam", "Open"),
        )
        .leaf("Closed")
        .leaf("Open")
        .leaf("Light")
        .bind("main:Door:Closed", arrow_on("open", "open"))
        .bind(
            "main:Door:Open",
            Handler::new().on("slam", |_c: LeafCall| async move { Ok(Reply::new().with_arrow("slam")) }),
        );
    let (machine, _) = machine(plan);

    // Nothing defines "look"; the call only persists the initial tree.
    machine.call("h", "look", json!({})).await.unwrap();
    let before = machine.state("h").await.unwrap();
    machine.call("h", "open", json!({})).await.unwrap();
    let after = machine.state("h").await.unwrap();

    for stable in ["main", "main:Door", "main:Light"] {
        assert_eq!(before.instance_id(stable), after.instance_id(stable), "{stable} changed");
    }
    assert!(after.instance_id("main:Door:Closed").is_none());
    let open_id = after.instance_id("main:Door:Open").unwrap().to_owned();

    // A leaf self-loop reproduces the same assignment: nothing rotates.
    machine.call("h", "slam", json!({})).await.unwrap();
    let slammed = machine.state("h").await.unwrap();
    assert_eq!(slammed.instance_id("main:Door:Open"), Some(open_id.as_str()));
}

#[tokio::test]
async fn test_reentered_subtree_gets_fresh_ids() {
    let log = HookLog::new();
    let plan = Plan::new("loop")
        .graph("main", GraphDecl::new().node("C").arrow("C", "reset", "C"))
        .composite("C", ["L", "R"])
        .graph("L", GraphDecl::new().node("A").node("B").arrow("A", "x", "B"))
        .leaf("A")
        .leaf("B")
        .leaf("R")
        .bind("main:C", log.record(Handler::new()))
        .bind("main:C:L:A", arrow_on("advance", "x"))
        .bind("main:C:R", arrow_on("reset", "reset"));
    let (machine, _) = machine(plan);

    machine.call("l", "advance", json!({})).await.unwrap();
    let before = machine.state("l").await.unwrap();
    assert_eq!(before.active_child("main:C:L"), Some("main:C:L:B"));

    machine.call("l", "reset", json!({})).await.unwrap();
    let after = machine.state("l").await.unwrap();

    assert_eq!(after.active_child("main:C:L"), Some("main:C:L:A"));
    assert_ne!(before.instance_id("main:C"), after.instance_id("main:C"));
    assert_ne!(before.instance_id("main:C:R"), after.instance_id("main:C:R"));
    assert_eq!(before.instance_id("main"), after.instance_id("main"));

    // The re-entered composite sees its new id in both hooks.
    let events = log.events();
    assert_eq!(log.hooks(), vec!["onEntry main:C", "afterLeft main:C"]);
    assert_eq!(events[0].instance_id, events[1].instance_id);
    assert_eq!(events[0].instance_id.as_deref(), after.instance_id("main:C"));
}

#[tokio::test]
async fn test_entry_hook_chains_transitions() {
    let plan = Plan::new("relay")
        .graph(
            "main",
            GraphDecl::new()
                .node("Start")
                .node("Relay")
                .node("Finish")
                .arrow("Start", "go", "Relay")
                .arrow("Relay", "pass", "Finish"),
        )
        .leaf("Start")
        .leaf("Relay")
        .leaf("Finish")
        .bind("main:Start", arrow_on("go", "go"))
        .bind("main:Relay", arrow_on("onEntry", "pass"));
    let (machine, _) = machine(plan);

    machine.call("r", "go", json!({})).await.unwrap();
    assert_eq!(machine.state("r").await.unwrap().active_child("main"), Some("main:Finish"));
}

fn bouncer() -> Handler {
    Handler::new()
        .on("serve", |_c: LeafCall| async move { Ok(Reply::new().with_arrow("hit")) })
        .on("onEntry", |_c: LeafCall| async move { Ok(Reply::new().with_arrow("hit")) })
}

#[tokio::test]
async fn test_runaway_entry_loop_hits_configured_limit() {
    let plan = Plan::new("spin")
        .graph(
            "main",
            GraphDecl::new()
                .node("Ping")
                .node("Pong")
                .arrow("Ping", "hit", "Pong")
                .arrow("Pong", "hit", "Ping"),
        )
        .leaf("Ping")
        .leaf("Pong")
        .bind("main:Ping", bouncer())
        .bind("main:Pong", bouncer());
    let store = Arc::new(InMemoryStore::new());
    let machine = Machine::builder(plan)
        .with_store(store.clone())
        .with_config(EngineConfig::new().with_max_cycles(10))
        .build();

    let err = machine.call("s", "serve", json!({})).await.unwrap_err();
    assert!(matches!(err, TrellisError::CycleLimitExceeded { limit: 10 }));
    assert!(store.is_empty());
}

// ==========================================================================
// Plans Built From Context
// ==========================================================================

fn crew_plan() -> Plan {
    Plan::new("crew")
        .dynamic_composite("main", "member")
        .graph(
            "member",
            GraphDecl::new().node("Resting").node("Working").arrow("Resting", "assign", "Working"),
        )
        .leaf("Resting")
        .leaf("Working")
        .bind_node_count("main", |ctx| {
            ctx["crew"]
                .as_array()
                .map(|names| names.iter().filter_map(|n| n.as_str().map(String::from)).collect())
                .unwrap_or_default()
        })
        .bind(
            "main",
            Handler::new().on("hire", |c: LeafCall| async move {
                let mut ctx = c.ctx;
                let name = c.params["name"].clone();
                match ctx["crew"].as_array_mut() {
                    Some(crew) => crew.push(name),
                    None => ctx["crew"] = json!([name]),
                }
                Ok(Reply::new().with_ctx(ctx))
            }),
        )
        .bind(
            "main:member:Resting",
            Handler::new().on("assign", |c: LeafCall| async move {
                let wanted = c.params["name"].as_str().unwrap_or_default().to_owned();
                if c.node.id.ends_with(&format!("member[{wanted}]:Resting")) {
                    Ok(Reply::new().with_arrow("assign").with_result("on it"))
                } else {
                    Ok(Reply::new())
                }
            }),
        )
}

#[tokio::test]
async fn test_dynamic_members_follow_context() {
    let (machine, _) = machine(crew_plan());

    machine.call("c", "hire", json!({"name": "ada"})).await.unwrap();
    machine.call("c", "hire", json!({"name": "bo"})).await.unwrap();

    let result = machine.call("c", "assign", json!({"name": "bo"})).await.unwrap();
    assert_eq!(result, json!({"member[ada]": null, "member[bo]": "on it"}));

    let state = machine.state("c").await.unwrap();
    assert_eq!(state.active_child("main:member[ada]"), Some("main:member[ada]:Resting"));
    assert_eq!(state.active_child("main:member[bo]"), Some("main:member[bo]:Working"));
    assert!(state.instance_id("main:member[bo]:Working").is_some());
}

#[tokio::test]
async fn test_external_plan_runs_in_place() {
    let door = Plan::new("door")
        .graph("main", GraphDecl::new().node("Closed").node("Open").arrow("Closed", "open", "Open"))
        .leaf("Closed")
        .leaf("Open")
        .bind("main:Closed", arrow_on("open", "open"));
    let house = Plan::new("house")
        .composite("main", ["Front", "Back"])
        .external("Front", door.clone())
        .external("Back", door);
    let (machine, _) = machine(house);

    machine.call("h", "open", json!({})).await.unwrap();
    let state = machine.state("h").await.unwrap();
    assert_eq!(state.active_child("main:Front"), Some("main:Front:Open"));
    assert_eq!(state.active_child("main:Back"), Some("main:Back:Open"));
}

// ==========================================================================
// Serialization
// ==========================================================================

fn counting_plan(unsynchronized: bool, in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Plan {
    let step = move |c: LeafCall| {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20 + fastrand::u64(0..20))).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut ctx = c.ctx;
            let seen = ctx["n"].as_u64().unwrap_or(0);
            ctx["n"] = json!(seen + 1);
            Ok(Reply::new().with_ctx(ctx).with_result(seen))
        }
    };
    let handler = if unsynchronized {
        Handler::new().on_unsynchronized("step", step)
    } else {
        Handler::new().on("step", step)
    };
    Plan::new("count")
        .graph("main", GraphDecl::new().node("Only"))
        .leaf("Only")
        .bind("main:Only", handler)
}

async fn run_concurrently(machine: &Machine, calls: usize) -> Vec<Value> {
    let tasks: Vec<_> = (0..calls)
        .map(|_| {
            let machine = machine.clone();
            tokio::spawn(async move { machine.call("shared", "step", json!({})).await })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_synchronized_calls_are_sequential() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (machine, store) = machine(counting_plan(false, in_flight, peak.clone()));

    let results = run_concurrently(&machine, 8).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let mut seen: Vec<u64> = results.iter().filter_map(Value::as_u64).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<_>>());
    assert_eq!(store.load("shared").await.unwrap().unwrap().context["n"], json!(8));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsynchronized_calls_overlap() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (machine, _) = machine(counting_plan(true, in_flight, peak.clone()));
    machine.call("shared", "look", json!({})).await.unwrap();

    run_concurrently(&machine, 4).await;
    assert!(peak.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_failed_handler_releases_lock() {
    let attempts = Arc::new(Mutex::new(0));
    let counter = attempts.clone();
    let plan = Plan::new("fragile")
        .graph("main", GraphDecl::new().node("Only"))
        .leaf("Only")
        .bind(
            "main:Only",
            Handler::new().on("try", move |_c: LeafCall| {
                let attempts = counter.clone();
                async move {
                    let mut n = attempts.lock().unwrap();
                    *n += 1;
                    if *n == 1 {
                        anyhow::bail!("first try fails");
                    }
                    Ok(Reply::new().with_result("ok"))
                }
            }),
        );
    let locks = Arc::new(InMemoryLocks::new());
    let store = Arc::new(InMemoryStore::new());
    let machine = Machine::builder(plan)
        .with_store(store.clone())
        .with_locks(locks.clone())
        .build();

    let err = machine.call("f", "try", json!({})).await.unwrap_err();
    assert!(matches!(err, TrellisError::HandlerFailure { ref node, .. } if node == "main:Only"));
    assert!(!locks.is_locked("f"));
    assert!(store.is_empty());

    assert_eq!(machine.call("f", "try", json!({})).await.unwrap(), json!("ok"));
}
