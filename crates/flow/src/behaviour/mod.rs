//! Activity behaviours
//!
//! A behaviour receives the `execute.start` message of its activity and must
//! eventually publish exactly one of `execute.completed`, `execute.discard` or
//! `execute.error` for that execution id. On `stop`/`discard` commands it
//! releases its listeners without a second terminal publish.
//!
//! [`ExecutionScope`] wraps the activity broker with the publishes a
//! behaviour needs.

mod builtin;
mod definitions;
mod registry;

use serde_json::Value;

use crate::api::actions;
use crate::broker::{
    exchanges, keys, Broker, Content, Handler, Message, Properties, SubscribeOptions,
};
use crate::chain::{ElementRef, ParentChain};
use crate::config::EngineConfig;
use crate::error::ExecutionError;
use crate::expression::Environment;

pub use builtin::{EventBehaviour, SignalTaskBehaviour, TaskBehaviour};
pub use definitions::{ConditionalEventDefinition, EventDefinition, SignalEventDefinition};
pub use registry::{BehaviourFactory, BehaviourRegistry};

/// Concrete work performed by an activity
pub trait Behaviour: Send + Sync {
    /// Handle an `execute.start` message.
    ///
    /// Called with the root message on first run and with redelivered
    /// messages when an activity resumes. An `Err` is published as
    /// `execute.error` on behalf of the behaviour.
    fn execute(&self, scope: &ExecutionScope, message: &Message) -> anyhow::Result<()>;
}

/// Publishing helpers bound to one activity execution
#[derive(Clone)]
pub struct ExecutionScope {
    activity: ElementRef,
    parent: Option<ParentChain>,
    broker: Broker,
    environment: Environment,
}

impl ExecutionScope {
    pub fn new(
        activity: ElementRef,
        parent: Option<ParentChain>,
        broker: Broker,
        environment: Environment,
    ) -> Self {
        Self {
            activity,
            parent,
            broker,
            environment,
        }
    }

    /// Activity address, execution id included
    pub fn activity(&self) -> &ElementRef {
        &self.activity
    }

    pub fn execution_id(&self) -> &str {
        self.activity.execution_id.as_deref().unwrap_or_default()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn config(&self) -> &EngineConfig {
        &self.environment.config
    }

    /// Publish `execute.completed` for the execution `message` describes
    pub fn complete(&self, message: &Message, output: Option<Value>) {
        let mut content = message.content.clone();
        if output.is_some() {
            content.output = output;
        }
        self.publish_execution(keys::EXECUTE_COMPLETED, content);
    }

    pub fn discard(&self, message: &Message) {
        self.publish_execution(keys::EXECUTE_DISCARD, message.content.clone());
    }

    pub fn fail(&self, message: &Message, error: ExecutionError) {
        self.publish_execution(keys::EXECUTE_ERROR, message.content.clone().with_error(error));
    }

    /// Publish on the activity execution exchange
    pub fn publish_execution(&self, routing_key: &str, content: Content) {
        self.broker
            .publish(exchanges::EXECUTION, routing_key, content, Properties::new());
    }

    /// Activity-level content for lifecycle events
    pub fn activity_content(&self) -> Content {
        Content::new(self.activity.id.clone(), self.activity.element_type.clone())
            .with_execution_id(self.execution_id())
            .with_parent(self.parent.clone())
    }

    /// Publish an `activity.<action>` lifecycle event
    pub fn publish_event(&self, action: &str, content: Content) {
        self.broker.publish(
            exchanges::EVENT,
            &format!("activity.{}", action),
            content,
            Properties::new(),
        );
    }

    /// Announce that the activity waits for input
    pub fn wait(&self) {
        self.publish_event("wait", self.activity_content());
    }

    /// Announce a pending timer
    pub fn timer(&self, expire_at: Option<Value>) {
        let mut content = self.activity_content();
        if let Some(expire_at) = expire_at {
            content.extra.insert("expireAt".to_string(), expire_at);
        }
        self.publish_event("timer", content);
    }

    /// Listen to every api message of the activity under a fixed tag.
    ///
    /// Subscribing again with the same tag replaces the previous listener.
    pub fn subscribe_api(&self, consumer_tag: &str, handler: Handler) -> String {
        self.broker.subscribe_tmp(
            exchanges::API,
            "#",
            handler,
            SubscribeOptions::default().with_consumer_tag(consumer_tag),
        )
    }

    pub fn cancel(&self, consumer_tag: &str) {
        self.broker.cancel(consumer_tag);
    }
}

/// Api command classification used by behaviours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Signal,
    Discard,
    Stop,
    Other,
}

/// Classify an api message addressed to any of `execution_ids`.
///
/// Delegated messages count as addressed to everyone.
pub fn addressed_command(message: &Message, execution_ids: &[&str]) -> Option<Command> {
    let addressed = message.properties.delegate
        || execution_ids
            .iter()
            .any(|id| message.routing_key().ends_with(&format!(".{}", id)));
    if !addressed {
        return None;
    }
    Some(match message.properties.message_type.as_deref() {
        Some(actions::SIGNAL) => Command::Signal,
        Some(actions::DISCARD) | Some(actions::CANCEL) => Command::Discard,
        Some(actions::STOP) => Command::Stop,
        _ => Command::Other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_message(routing_key: &str, action: &str, delegate: bool) -> Message {
        let mut message = Message::new(routing_key, Content::new("task", "bpmn:Task"));
        message.properties = Properties::new().with_type(action);
        message.properties.delegate = delegate;
        message
    }

    #[test]
    fn test_addressed_command() {
        let stop = api_message("activity.stop.task_1", "stop", false);
        assert_eq!(addressed_command(&stop, &["task_1"]), Some(Command::Stop));
        assert_eq!(addressed_command(&stop, &["task_2"]), None);

        let signal = api_message("definition.signal.def_1", "signal", true);
        assert_eq!(addressed_command(&signal, &["task_1"]), Some(Command::Signal));

        let cancel = api_message("activity.cancel.task_1", "cancel", false);
        assert_eq!(addressed_command(&cancel, &["task_1"]), Some(Command::Discard));
    }

    #[test]
    fn test_activity_content_carries_root_execution() {
        let scope = ExecutionScope::new(
            ElementRef::new("task", "bpmn:Task").with_execution_id("task_1"),
            None,
            Broker::new("task"),
            Environment::default(),
        );
        let content = scope.activity_content();
        assert_eq!(content.id, "task");
        assert_eq!(content.execution_id.as_deref(), Some("task_1"));
    }
}
