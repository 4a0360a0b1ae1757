//! Generic behaviours shipped with the engine

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use super::{addressed_command, Behaviour, Command, EventDefinition, ExecutionScope};
use crate::broker::{Handler, Message};
use crate::race::EventDefinitionExecution;

/// Completes immediately, optionally with a fixed output
#[derive(Debug, Clone, Default)]
pub struct TaskBehaviour {
    output: Option<Value>,
}

impl TaskBehaviour {
    pub fn new(output: Option<Value>) -> Self {
        Self { output }
    }
}

impl Behaviour for TaskBehaviour {
    fn execute(&self, scope: &ExecutionScope, message: &Message) -> anyhow::Result<()> {
        scope.complete(message, self.output.clone());
        Ok(())
    }
}

/// Waits until the activity is signalled
#[derive(Debug, Clone, Default)]
pub struct SignalTaskBehaviour {
    reference: Option<String>,
}

impl SignalTaskBehaviour {
    pub fn new(reference: Option<String>) -> Self {
        Self { reference }
    }
}

impl Behaviour for SignalTaskBehaviour {
    fn execute(&self, scope: &ExecutionScope, message: &Message) -> anyhow::Result<()> {
        let execution_id = scope.execution_id().to_string();
        let tag = format!("_signal-task-{}", execution_id);

        let reference = self.reference.clone();
        let activity_id = scope.activity().id.clone();
        let listener_scope = scope.clone();
        let start = message.clone();
        let listener_tag = tag.clone();
        let handler: Handler = Arc::new(move |api: &Message| {
            match addressed_command(api, &[execution_id.as_str()]) {
                Some(Command::Signal) => {
                    if api.properties.delegate
                        && !delegate_matches(api, &activity_id, &execution_id, reference.as_deref())
                    {
                        return;
                    }
                    listener_scope.cancel(&listener_tag);
                    listener_scope.complete(&start, api.content.message.clone());
                }
                // the activity publishes the discard itself
                Some(Command::Discard) | Some(Command::Stop) if !api.properties.delegate => {
                    listener_scope.cancel(&listener_tag);
                }
                _ => {}
            }
        });

        scope.subscribe_api(&tag, handler);
        scope.wait();
        Ok(())
    }
}

/// A delegated signal names the task by reference, id or execution id
fn delegate_matches(
    api: &Message,
    activity_id: &str,
    execution_id: &str,
    reference: Option<&str>,
) -> bool {
    let Some(signal) = api.content.message.as_ref() else {
        return false;
    };
    let signal_id = signal.get("id").and_then(Value::as_str);
    let signal_execution_id = signal.get("executionId").and_then(Value::as_str);
    signal_execution_id == Some(execution_id)
        || (signal_id.is_some() && (signal_id == Some(activity_id) || signal_id == reference))
}

/// Races a set of event definitions; the first to complete wins
pub struct EventBehaviour {
    definitions: Vec<Arc<dyn EventDefinition>>,
    completion_key: Option<String>,
    executions: Mutex<HashMap<String, Arc<EventDefinitionExecution>>>,
}

impl EventBehaviour {
    pub fn new(definitions: Vec<Arc<dyn EventDefinition>>) -> Self {
        Self {
            definitions,
            completion_key: None,
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Publish the winning definition under another routing key
    pub fn with_completion_key(mut self, key: impl Into<String>) -> Self {
        self.completion_key = Some(key.into());
        self
    }

    pub fn definition_types(&self) -> Vec<&str> {
        self.definitions.iter().map(|d| d.definition_type()).collect()
    }
}

impl Behaviour for EventBehaviour {
    fn execute(&self, scope: &ExecutionScope, message: &Message) -> anyhow::Result<()> {
        if self.definitions.is_empty() {
            scope.complete(message, None);
            return Ok(());
        }

        let root_id = scope.execution_id().to_string();
        let execution = if message.content.is_root_scope {
            let execution = match &self.completion_key {
                Some(key) => EventDefinitionExecution::with_completion_key(
                    scope.clone(),
                    self.definitions.clone(),
                    key.clone(),
                ),
                None => EventDefinitionExecution::new(scope.clone(), self.definitions.clone()),
            };
            let mut executions = self.executions.lock();
            executions.retain(|_, e| !e.is_finished());
            executions.insert(root_id, execution.clone());
            execution
        } else {
            match self.executions.lock().get(&root_id).cloned() {
                Some(execution) => execution,
                None => {
                    warn!(
                        execution_id = ?message.execution_id(),
                        "No event definition execution for message, ignored"
                    );
                    return Ok(());
                }
            }
        };

        execution.execute(message);
        Ok(())
    }
}
