//! Coordination tests over real processes and definitions
//!
//! Run with: cargo test -p everruns-flow --test coordination

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;

use everruns_flow::broker::Handler;
use everruns_flow::prelude::*;

/// (routing key, element id, execution id) of every observed message
type Seen = Arc<Mutex<Vec<(String, String, Option<String>)>>>;

fn record(broker: &Broker, exchange: &str, seen: &Seen) {
    let sink = seen.clone();
    let handler: Handler = Arc::new(move |m: &Message| {
        sink.lock().push((
            m.routing_key().to_string(),
            m.content.id.clone(),
            m.content.execution_id.clone(),
        ))
    });
    broker.subscribe_tmp(exchange, "#", handler, SubscribeOptions::default());
}

fn events(scope: &Scope) -> Seen {
    let seen = Seen::default();
    record(scope.broker(), exchanges::EVENT, &seen);
    seen
}

fn count(seen: &Seen, routing_key: &str) -> usize {
    seen.lock().iter().filter(|(k, _, _)| k == routing_key).count()
}

fn count_for(seen: &Seen, routing_key: &str, id: &str) -> usize {
    seen.lock()
        .iter()
        .filter(|(k, i, _)| k == routing_key && i == id)
        .count()
}

fn process(def: ProcessDef) -> Arc<Scope> {
    Scope::process(&def, &BehaviourRegistry::with_defaults(), Environment::default()).unwrap()
}

struct Failing;

impl Behaviour for Failing {
    fn execute(&self, _scope: &ExecutionScope, _message: &Message) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }
}

#[test_log::test]
fn test_exactly_one_terminal_per_execution() {
    let scope = process(
        ProcessDef::new("process")
            .with_element(ElementDef::new("start", "bpmn:StartEvent"))
            .with_element(ElementDef::new("task", "bpmn:Task"))
            .with_element(ElementDef::new("approve", "bpmn:UserTask"))
            .with_element(ElementDef::new("end", "bpmn:EndEvent"))
            .with_flow("start", "task")
            .with_flow("task", "approve")
            .with_flow("approve", "end"),
    );
    let executions = Seen::default();
    record(scope.broker(), exchanges::EXECUTION, &executions);
    for child in scope.children() {
        record(&child.broker(), exchanges::EXECUTION, &executions);
    }

    scope.run(Content::default()).unwrap();
    scope.signal(json!({"id": "approve"})).unwrap();

    let terminal = [
        keys::EXECUTE_COMPLETED,
        keys::EXECUTE_DISCARD,
        keys::EXECUTE_ERROR,
    ];
    let mut per_execution: HashMap<String, usize> = HashMap::new();
    for (key, _, execution_id) in executions.lock().iter() {
        if terminal.contains(&key.as_str()) {
            *per_execution
                .entry(execution_id.clone().unwrap_or_default())
                .or_default() += 1;
        }
    }
    // four activities plus the process itself
    assert_eq!(per_execution.len(), 5);
    assert!(per_execution.values().all(|n| *n == 1), "{:?}", per_execution);
}

#[test_log::test]
fn test_zero_children_completes_immediately() {
    let scope = process(ProcessDef::new("empty"));
    let seen = events(&scope);

    scope.run(Content::default()).unwrap();

    assert_eq!(count(&seen, "process.end"), 1);
    assert_eq!(count(&seen, "process.leave"), 1);
    assert!(!scope.is_running());
    let execution = scope.execution().unwrap();
    assert_eq!(execution.status(), ExecutionStatus::Completed);
}

#[test_log::test]
fn test_definition_without_executable_process_is_fatal_once() {
    let def = DefinitionDef::new("def")
        .with_process(
            ProcessDef::new("lib")
                .with_element(ElementDef::new("task", "bpmn:Task"))
                .non_executable(),
        )
        .with_process(
            ProcessDef::new("other")
                .with_element(ElementDef::new("task", "bpmn:Task"))
                .non_executable(),
        );
    let definition =
        Scope::definition(&def, &BehaviourRegistry::with_defaults(), Environment::default())
            .unwrap();
    let seen = events(&definition);
    let executions = Seen::default();
    record(definition.broker(), exchanges::EXECUTION, &executions);

    definition.run(Content::default()).unwrap();

    assert_eq!(count(&executions, keys::EXECUTION_FATAL), 1);
    assert_eq!(count(&executions, keys::EXECUTE_COMPLETED), 0);
    assert_eq!(count(&seen, "definition.error"), 1);
    assert_eq!(count(&seen, "definition.end"), 0);
    assert_eq!(count(&seen, "process.enter"), 0);
}

#[test_log::test]
fn test_two_siblings_complete_once() {
    let scope = process(
        ProcessDef::new("process")
            .with_element(ElementDef::new("a", "bpmn:UserTask"))
            .with_element(ElementDef::new("b", "bpmn:UserTask")),
    );
    let seen = events(&scope);
    scope.run(Content::default()).unwrap();
    assert_eq!(scope.get_postponed().len(), 2);

    scope.signal(json!({"id": "a"})).unwrap();
    assert!(scope.is_running());
    assert_eq!(count(&seen, "process.end"), 0);

    scope.signal(json!({"id": "b"})).unwrap();
    assert!(!scope.is_running());
    assert_eq!(count(&seen, "process.end"), 1);
    assert_eq!(count(&seen, "process.leave"), 1);
}

#[test_log::test]
fn test_error_stops_running_sibling_once() {
    let mut registry = BehaviourRegistry::with_defaults();
    registry.register("test:Fail", |_def: &ElementDef| {
        Ok(Arc::new(Failing) as Arc<dyn Behaviour>)
    });
    // the waiting sibling runs first so it is in flight when the other fails
    let def = ProcessDef::new("process")
        .with_element(ElementDef::new("b", "bpmn:UserTask"))
        .with_element(ElementDef::new("a", "test:Fail"));
    let scope = Scope::process(&def, &registry, Environment::default()).unwrap();
    let seen = events(&scope);

    scope.run(Content::default()).unwrap();

    assert_eq!(count_for(&seen, "activity.stop", "b"), 1);
    assert_eq!(count_for(&seen, "activity.stop", "a"), 0);
    assert_eq!(count_for(&seen, "activity.error", "a"), 1);
    assert_eq!(count(&seen, "process.error"), 1);
    assert_eq!(count(&seen, "process.end"), 0);
    assert_eq!(
        scope.execution().map(|e| e.status()),
        Some(ExecutionStatus::Error)
    );
    assert!(!scope.is_running());
}

#[test_log::test]
fn test_postponed_keeps_one_entry_per_child() {
    let scope = process(
        ProcessDef::new("process")
            .with_element(ElementDef::new("approve", "bpmn:UserTask"))
            .with_element(ElementDef::new("end", "bpmn:EndEvent"))
            .with_flow("approve", "end"),
    );
    let seen = events(&scope);
    scope.run(Content::default()).unwrap();

    // enter, start and wait all came from the same child
    assert!(count_for(&seen, "activity.wait", "approve") >= 1);
    let execution = scope.execution().unwrap();
    assert_eq!(execution.postponed_count(), 1);
    let postponed = scope.get_postponed();
    assert_eq!(postponed.len(), 1);
    assert_eq!(postponed[0].id(), "approve");
}

#[test_log::test]
fn test_definition_relays_process_events() {
    let def = DefinitionDef::new("def").with_process(
        ProcessDef::new("main")
            .with_element(ElementDef::new("approve", "bpmn:UserTask"))
            .with_element(ElementDef::new("end", "bpmn:EndEvent"))
            .with_flow("approve", "end"),
    );
    let definition =
        Scope::definition(&def, &BehaviourRegistry::with_defaults(), Environment::default())
            .unwrap();
    let seen = events(&definition);

    definition.run(Content::default()).unwrap();
    assert_eq!(definition.activity_status(), everruns_flow::ActivityStatus::Wait);
    assert_eq!(definition.get_postponed().len(), 1);

    definition.signal(json!({"id": "approve"})).unwrap();

    assert_eq!(count_for(&seen, "activity.end", "end"), 1);
    assert_eq!(count(&seen, "process.end"), 1);
    assert_eq!(count(&seen, "definition.end"), 1);
    assert!(!definition.is_running());
}

#[test_log::test]
fn test_definition_lists_activities_waiting_in_processes() {
    let def = DefinitionDef::new("def")
        .with_process(
            ProcessDef::new("main")
                .with_element(ElementDef::new("approve", "bpmn:UserTask"))
                .with_element(ElementDef::new("end", "bpmn:EndEvent"))
                .with_flow("approve", "end"),
        )
        .with_process(ProcessDef::new("side").with_element(ElementDef::new("review", "bpmn:UserTask")));
    let definition =
        Scope::definition(&def, &BehaviourRegistry::with_defaults(), Environment::default())
            .unwrap();
    let seen = events(&definition);
    definition.run(Content::default()).unwrap();

    let mut ids: Vec<String> = definition
        .get_postponed()
        .iter()
        .map(|api| api.id().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["approve", "review"]);

    let via_api: Vec<String> = definition
        .get_api(None)
        .unwrap()
        .get_postponed()
        .iter()
        .map(|api| api.id().to_string())
        .collect();
    assert_eq!(via_api.len(), 2);

    for api in definition.get_postponed() {
        api.signal(json!({"ok": true}));
    }
    assert_eq!(count(&seen, "process.end"), 2);
    assert_eq!(count(&seen, "definition.end"), 1);
    assert!(definition.get_postponed().is_empty());
}

#[test_log::test]
fn test_discard_via_api_terminates_once() {
    let scope = process(
        ProcessDef::new("process")
            .with_element(ElementDef::new("approve", "bpmn:UserTask"))
            .with_element(ElementDef::new("end", "bpmn:EndEvent"))
            .with_flow("approve", "end"),
    );
    let seen = events(&scope);
    let executions = Seen::default();
    record(scope.broker(), exchanges::EXECUTION, &executions);
    scope.run(Content::default()).unwrap();

    let api = scope.get_api(None).unwrap();
    api.discard();
    api.discard();

    assert_eq!(count_for(&executions, keys::EXECUTE_DISCARD, "process"), 1);
    assert_eq!(count_for(&executions, keys::EXECUTE_COMPLETED, "process"), 0);
    assert_eq!(
        scope.execution().map(|e| e.status()),
        Some(ExecutionStatus::Terminated)
    );
    assert_eq!(count(&seen, "process.discard"), 1);
    assert_eq!(count(&seen, "process.leave"), 1);
    assert_eq!(count(&seen, "process.end"), 0);
    assert!(!scope.is_running());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_parallel_tasks_complete_once(order in (1usize..6).prop_flat_map(|n| {
        Just((0..n).collect::<Vec<_>>()).prop_shuffle()
    })) {
        let mut def = ProcessDef::new("process");
        for i in 0..order.len() {
            def = def.with_element(ElementDef::new(format!("task-{}", i), "bpmn:UserTask"));
        }
        let scope = process(def);
        let seen = events(&scope);
        scope.run(Content::default()).unwrap();

        for (signalled, i) in order.iter().enumerate() {
            prop_assert_eq!(count(&seen, "process.end"), 0);
            prop_assert_eq!(scope.get_postponed().len(), order.len() - signalled);
            scope.signal(json!({"id": format!("task-{}", i)})).unwrap();
        }

        prop_assert_eq!(count(&seen, "process.end"), 1);
        prop_assert!(!scope.is_running());
    }
}
