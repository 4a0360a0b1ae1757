//! Event definitions raced by an event activity

use std::sync::Arc;

use tracing::debug;

use super::{addressed_command, Command, ExecutionScope};
use crate::broker::{Handler, Message};
use crate::chain::ParentChain;
use crate::expression::is_truthy;

/// One way an event activity can complete
pub trait EventDefinition: Send + Sync {
    fn definition_type(&self) -> &str;

    /// Start (or resume) the definition execution described by `message`.
    ///
    /// The message is definition scoped: its execution id is
    /// `<activity execution id>_<index>` and its parent chain starts at the
    /// activity.
    fn execute(&self, scope: &ExecutionScope, message: &Message) -> anyhow::Result<()>;
}

fn root_execution_id(parent: Option<&ParentChain>) -> Option<String> {
    parent.and_then(|p| p.head.execution_id.clone())
}

/// Completes when a matching signal arrives
#[derive(Debug, Clone)]
pub struct SignalEventDefinition {
    reference: Option<String>,
}

impl SignalEventDefinition {
    pub fn new(reference: Option<String>) -> Self {
        Self { reference }
    }

    fn matches(&self, signal: &Message, own_id: &str) -> bool {
        // a signal sent straight to this definition needs no reference
        if signal.routing_key().ends_with(&format!(".{}", own_id)) {
            return true;
        }
        match (&self.reference, signal.content.message_id()) {
            (Some(reference), Some(id)) => reference == id,
            (None, _) => true,
            _ => false,
        }
    }
}

impl EventDefinition for SignalEventDefinition {
    fn definition_type(&self) -> &str {
        "bpmn:SignalEventDefinition"
    }

    fn execute(&self, scope: &ExecutionScope, message: &Message) -> anyhow::Result<()> {
        let execution_id = message
            .execution_id()
            .ok_or_else(|| anyhow::anyhow!("signal definition message without execution id"))?
            .to_string();
        let root_id = root_execution_id(message.content.parent.as_ref()).unwrap_or_default();
        let tag = format!("_signal-definition-{}", execution_id);

        let definition = self.clone();
        let listener_scope = scope.clone();
        let start = message.clone();
        let listener_tag = tag.clone();
        let handler: Handler = Arc::new(move |api: &Message| {
            match addressed_command(api, &[execution_id.as_str(), root_id.as_str()]) {
                Some(Command::Signal) if definition.matches(api, &execution_id) => {
                    listener_scope.cancel(&listener_tag);
                    listener_scope.complete(&start, api.content.message.clone());
                }
                Some(Command::Stop) | Some(Command::Discard) if !api.properties.delegate => {
                    debug!(execution_id = %execution_id, "Signal definition released");
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

/// Completes when its condition resolves truthy, re-checked on every signal
#[derive(Debug, Clone)]
pub struct ConditionalEventDefinition {
    condition: String,
}

impl ConditionalEventDefinition {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
        }
    }
}

impl EventDefinition for ConditionalEventDefinition {
    fn definition_type(&self) -> &str {
        "bpmn:ConditionalEventDefinition"
    }

    fn execute(&self, scope: &ExecutionScope, message: &Message) -> anyhow::Result<()> {
        let value = scope
            .environment()
            .resolve_expression(&self.condition, message)?;
        if is_truthy(value.as_ref()) {
            scope.complete(message, value);
            return Ok(());
        }

        let execution_id = message
            .execution_id()
            .ok_or_else(|| anyhow::anyhow!("conditional definition message without execution id"))?
            .to_string();
        let root_id = root_execution_id(message.content.parent.as_ref()).unwrap_or_default();
        let tag = format!("_conditional-definition-{}", execution_id);

        let condition = self.condition.clone();
        let listener_scope = scope.clone();
        let start = message.clone();
        let listener_tag = tag.clone();
        let handler: Handler = Arc::new(move |api: &Message| {
            match addressed_command(api, &[execution_id.as_str(), root_id.as_str()]) {
                Some(Command::Signal) => {
                    let value = match listener_scope
                        .environment()
                        .resolve_expression(&condition, api)
                    {
                        Ok(value) => value,
                        Err(err) => {
                            listener_scope.cancel(&listener_tag);
                            listener_scope.fail(
                                &start,
                                crate::error::ExecutionError::new(
                                    listener_scope.activity().id.clone(),
                                    err.to_string(),
                                ),
                            );
                            return;
                        }
                    };
                    if is_truthy(value.as_ref()) {
                        listener_scope.cancel(&listener_tag);
                        listener_scope.complete(&start, value);
                    }
                }
                Some(Command::Stop) | Some(Command::Discard) if !api.properties.delegate => {
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
