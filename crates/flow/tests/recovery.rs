//! Stop, snapshot, recover and resume across fresh instances

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use everruns_flow::broker::Handler;
use everruns_flow::prelude::*;
use everruns_flow::ActivityStatus;

fn record(scope: &Scope) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: Handler = Arc::new(move |m: &Message| sink.lock().push(m.routing_key().to_string()));
    scope
        .broker()
        .subscribe_tmp(exchanges::EVENT, "#", handler, SubscribeOptions::default());
    seen
}

fn count(seen: &Mutex<Vec<String>>, routing_key: &str) -> usize {
    seen.lock().iter().filter(|k| *k == routing_key).count()
}

fn definition_def() -> DefinitionDef {
    DefinitionDef::new("def").with_process(
        ProcessDef::new("main")
            .with_element(ElementDef::new("start", "bpmn:StartEvent"))
            .with_element(ElementDef::new("approve", "bpmn:UserTask"))
            .with_element(ElementDef::new("end", "bpmn:EndEvent"))
            .with_flow("start", "approve")
            .with_flow("approve", "end"),
    )
}

fn definition() -> Arc<Scope> {
    Scope::definition(
        &definition_def(),
        &BehaviourRegistry::with_defaults(),
        Environment::default(),
    )
    .unwrap()
}

/// Run until the user task waits, stop, and serialize the snapshot
fn stopped_snapshot() -> String {
    let running = definition();
    running.run(Content::default()).unwrap();
    assert_eq!(running.activity_status(), ActivityStatus::Wait);

    running.get_api(None).unwrap().stop();
    assert_eq!(running.status(), ElementStatus::Stopped);

    serde_json::to_string(&running.get_state()).unwrap()
}

fn recovered(snapshot: &str) -> Arc<Scope> {
    let state: ElementState = serde_json::from_str(snapshot).unwrap();
    recovered_from(&state)
}

fn recovered_from(state: &ElementState) -> Arc<Scope> {
    let scope = definition();
    scope.recover(state).unwrap();
    scope
}

fn element_mut<'a>(state: &'a mut ElementState, id: &str) -> Option<&'a mut ElementState> {
    if state.id == id {
        return Some(state);
    }
    state
        .execution
        .as_mut()?
        .children
        .iter_mut()
        .find_map(|c| element_mut(c, id))
}

/// Append redelivered copies of the activity's root start under `routing_keys`
fn redeliver(state: &mut ElementState, id: &str, routing_keys: &[&str]) {
    let activity = element_mut(state, id).unwrap();
    let queue_name = format!("execute-{}-q", activity.execution_id.clone().unwrap());
    let queue = activity
        .broker
        .as_mut()
        .unwrap()
        .queues
        .iter_mut()
        .find(|q| q.name == queue_name)
        .unwrap();
    let root = queue
        .messages
        .iter()
        .find(|m| m.routing_key() == keys::EXECUTE_START && m.content.is_root_scope)
        .cloned()
        .unwrap();
    for routing_key in routing_keys {
        let mut message = root.clone();
        message.fields.routing_key = routing_key.to_string();
        message.fields.redelivered = true;
        queue.messages.push(message);
    }
}

#[test_log::test]
fn test_snapshot_carries_waiting_activity() {
    let state: ElementState = serde_json::from_str(&stopped_snapshot()).unwrap();

    assert_eq!(state.status, ElementStatus::Stopped);
    assert!(state.stopped);
    let approve = state.find("approve").unwrap();
    assert_eq!(approve.status, ElementStatus::Stopped);
    let execution = approve.execution.as_ref().unwrap();
    assert!(!execution.completed);
    assert_eq!(state.find("start").map(|s| s.counters.taken), Some(1));
    assert_eq!(state.find("end").map(|e| e.counters.taken), Some(0));
}

#[test_log::test]
fn test_recovered_definition_resumes_and_completes_once() {
    let snapshot = stopped_snapshot();
    let scope = recovered(&snapshot);
    let seen = record(&scope);
    assert_eq!(scope.status(), ElementStatus::Stopped);

    scope.resume().unwrap();
    assert_eq!(scope.status(), ElementStatus::Running);
    assert_eq!(scope.activity_status(), ActivityStatus::Wait);
    assert_eq!(count(&seen, "definition.end"), 0);

    let postponed = scope.get_postponed();
    assert_eq!(postponed.len(), 1);
    assert_eq!(postponed[0].id(), "approve");

    scope.signal(json!({"id": "approve"})).unwrap();

    assert_eq!(count(&seen, "activity.end"), 2);
    assert_eq!(count(&seen, "process.end"), 1);
    assert_eq!(count(&seen, "definition.end"), 1);
    assert!(!scope.is_running());
}

#[test_log::test]
fn test_redelivery_is_idempotent() {
    let snapshot = stopped_snapshot();

    let once = recovered(&snapshot);
    let once_seen = record(&once);
    once.resume().unwrap();
    once.signal(json!({"id": "approve"})).unwrap();

    // same snapshot, every delivery repeated
    let twice = recovered(&snapshot);
    let twice_seen = record(&twice);
    twice.resume().unwrap();
    twice.resume().unwrap();
    assert_eq!(twice.get_postponed().len(), 1);
    twice.signal(json!({"id": "approve"})).unwrap();
    twice.signal(json!({"id": "approve"})).unwrap();

    assert_eq!(count(&twice_seen, "definition.end"), 1);
    assert_eq!(count(&twice_seen, "process.end"), 1);
    assert_eq!(*once_seen.lock(), *twice_seen.lock());
    assert_eq!(once.counters(), twice.counters());
}

#[test_log::test]
fn test_redelivered_completion_finishes_activity_once() {
    let mut state: ElementState = serde_json::from_str(&stopped_snapshot()).unwrap();
    // the run completed but neither start nor completion was acknowledged
    redeliver(
        &mut state,
        "approve",
        &[keys::EXECUTE_START, keys::EXECUTE_COMPLETED, keys::EXECUTE_COMPLETED],
    );
    let scope = recovered_from(&state);
    let seen = record(&scope);
    let executions = Arc::new(Mutex::new(Vec::new()));
    let sink = executions.clone();
    let handler: Handler =
        Arc::new(move |m: &Message| sink.lock().push(m.routing_key().to_string()));
    scope
        .broker()
        .subscribe_tmp(exchanges::EXECUTION, "execute.#", handler, SubscribeOptions::default());

    scope.resume().unwrap();

    assert_eq!(count(&seen, "activity.end"), 2);
    assert_eq!(count(&seen, "activity.leave"), 2);
    assert_eq!(count(&seen, "process.end"), 1);
    assert_eq!(count(&seen, "process.leave"), 1);
    assert_eq!(count(&seen, "definition.end"), 1);
    assert_eq!(count(&executions, keys::EXECUTE_COMPLETED), 1);
    assert!(!scope.is_running());

    scope.signal(json!({"id": "approve"})).unwrap();
    assert_eq!(count(&seen, "activity.end"), 2);
    assert_eq!(count(&seen, "definition.end"), 1);
}

#[test_log::test]
fn test_signal_to_stopped_definition_is_not_applied() {
    let scope = recovered(&stopped_snapshot());
    let seen = record(&scope);

    // not resumed yet, nothing consumes the api
    scope.signal(json!({"id": "approve"})).unwrap();
    assert_eq!(count(&seen, "activity.end"), 0);

    scope.resume().unwrap();
    assert_eq!(scope.activity_status(), ActivityStatus::Wait);
    scope.signal(json!({"id": "approve"})).unwrap();
    assert_eq!(count(&seen, "definition.end"), 1);
}

#[test_log::test]
fn test_resume_of_completed_run_is_noop() {
    let scope = definition();
    let seen = record(&scope);
    scope.run(Content::default()).unwrap();
    scope.signal(json!({"id": "approve"})).unwrap();
    assert_eq!(count(&seen, "definition.end"), 1);

    let state: ElementState =
        serde_json::from_str(&serde_json::to_string(&scope.get_state()).unwrap()).unwrap();
    let fresh = definition();
    let fresh_seen = record(&fresh);
    fresh.recover(&state).unwrap();
    fresh.resume().unwrap();

    assert!(fresh_seen.lock().is_empty());
    assert!(!fresh.is_running());
    assert_eq!(fresh.counters().taken, 1);
}
