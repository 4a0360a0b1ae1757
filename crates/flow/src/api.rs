//! Command and signal protocol
//!
//! An [`Api`] is a stateless handle built from an element and one of its
//! messages. Commands are published on the owner's `api` exchange with the
//! routing key `<prefix>.<action>.<executionId>` and carry a correlation id so
//! the issuer can match the effect.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::broker::{exchanges, Broker, Content, Message, Properties};
use crate::error::{ExpressionError, FlowError, Result};
use crate::expression::Environment;

/// Api actions understood by elements
pub mod actions {
    pub const CANCEL: &str = "cancel";
    pub const DISCARD: &str = "discard";
    pub const SIGNAL: &str = "signal";
    pub const STOP: &str = "stop";
}

/// Element that can be addressed through an [`Api`]
pub trait ApiOwner: Send + Sync {
    /// Broker carrying the owner's `api` exchange
    fn broker(&self) -> Broker;

    /// Routing key prefix, e.g. `activity` or `process`
    fn api_prefix(&self) -> &str;

    /// Own listing of in-flight children, if the owner keeps one
    fn postponed(&self) -> Option<Vec<Api>> {
        None
    }

    /// Nested execution that may keep a listing of its own
    fn nested(&self) -> Option<Arc<dyn ApiOwner>> {
        None
    }
}

/// Options for an api publish
#[derive(Debug, Clone, Default)]
pub struct ApiOptions {
    /// Reuse a correlation id instead of generating one
    pub correlation_id: Option<String>,
    /// Broadcast to every child of the addressed scope
    pub delegate: bool,
}

impl ApiOptions {
    pub fn delegated() -> Self {
        Self {
            delegate: true,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Command handle for one element instance
#[derive(Clone)]
pub struct Api {
    owner: Arc<dyn ApiOwner>,
    message: Message,
    environment: Option<Environment>,
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("prefix", &self.owner.api_prefix())
            .field("id", &self.message.content.id)
            .field("execution_id", &self.message.content.execution_id)
            .finish()
    }
}

impl Api {
    /// Build an api from an owner and the message describing the instance
    pub fn new(
        owner: Arc<dyn ApiOwner>,
        message: Option<&Message>,
        environment: Option<Environment>,
    ) -> Result<Self> {
        let message = message.ok_or(FlowError::MissingMessage)?;
        Ok(Self {
            owner,
            message: message.clone(),
            environment,
        })
    }

    pub fn id(&self) -> &str {
        &self.message.content.id
    }

    pub fn element_type(&self) -> &str {
        &self.message.content.element_type
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.message.content.execution_id.as_deref()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn content(&self) -> &Content {
        &self.message.content
    }

    /// Routing key for an action addressed to this instance
    pub fn routing_key(&self, action: &str) -> String {
        match self.execution_id() {
            Some(execution_id) => {
                format!("{}.{}.{}", self.owner.api_prefix(), action, execution_id)
            }
            None => format!("{}.{}", self.owner.api_prefix(), action),
        }
    }

    pub fn cancel(&self) -> String {
        self.send_api_message(actions::CANCEL, None, ApiOptions::default())
    }

    pub fn discard(&self) -> String {
        self.send_api_message(actions::DISCARD, None, ApiOptions::default())
    }

    pub fn signal(&self, payload: Value) -> String {
        self.send_api_message(actions::SIGNAL, Some(payload), ApiOptions::default())
    }

    pub fn stop(&self) -> String {
        self.send_api_message(actions::STOP, None, ApiOptions::default())
    }

    /// Publish an api message and return its correlation id
    pub fn send_api_message(
        &self,
        action: &str,
        payload: Option<Value>,
        options: ApiOptions,
    ) -> String {
        let correlation_id = options
            .correlation_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let mut content = self.message.content.clone();
        content.message = payload;

        let mut properties = Properties::new()
            .with_type(action)
            .with_correlation_id(correlation_id.clone());
        if options.delegate {
            properties = properties.delegated();
        }

        self.owner
            .broker()
            .publish(exchanges::API, &self.routing_key(action), content, properties);
        correlation_id
    }

    /// Apis for every in-flight descendant the owner knows about
    pub fn get_postponed(&self) -> Vec<Api> {
        self.owner
            .postponed()
            .or_else(|| self.owner.nested().and_then(|nested| nested.postponed()))
            .unwrap_or_default()
    }

    /// Resolve an expression against this api's message
    pub fn resolve_expression(&self, expression: &str) -> std::result::Result<Option<Value>, ExpressionError> {
        match &self.environment {
            Some(environment) => environment.resolve_expression(expression, &self.message),
            None => Environment::default().resolve_expression(expression, &self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Handler, SubscribeOptions};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Owner {
        broker: Broker,
        postponed: Option<Vec<Message>>,
        nested: Option<Arc<dyn ApiOwner>>,
    }

    impl ApiOwner for Owner {
        fn broker(&self) -> Broker {
            self.broker.clone()
        }

        fn api_prefix(&self) -> &str {
            "activity"
        }

        fn postponed(&self) -> Option<Vec<Api>> {
            let owner: Arc<dyn ApiOwner> = Arc::new(Owner {
                broker: self.broker.clone(),
                postponed: None,
                nested: None,
            });
            self.postponed.as_ref().map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| Api::new(owner.clone(), Some(m), None).ok())
                    .collect()
            })
        }

        fn nested(&self) -> Option<Arc<dyn ApiOwner>> {
            self.nested.clone()
        }
    }

    fn owner(broker: &Broker) -> Arc<dyn ApiOwner> {
        Arc::new(Owner {
            broker: broker.clone(),
            postponed: None,
            nested: None,
        })
    }

    fn message(execution_id: &str) -> Message {
        Message::new(
            "activity.wait",
            Content::new("task", "bpmn:UserTask").with_execution_id(execution_id),
        )
    }

    #[test]
    fn test_requires_source_message() {
        let broker = Broker::new("task");
        let err = Api::new(owner(&broker), None, None).expect_err("should fail");
        assert!(matches!(err, FlowError::MissingMessage));
    }

    #[test]
    fn test_signal_is_addressed_and_correlated() {
        let broker = Broker::new("task");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Handler = Arc::new(move |m: &Message| sink.lock().push(m.clone()));
        broker.subscribe_tmp("api", "#", handler, SubscribeOptions::default());

        let api = Api::new(owner(&broker), Some(&message("task_1")), None).unwrap();
        let correlation_id = api.signal(json!({"id": "Approve"}));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].routing_key(), "activity.signal.task_1");
        assert_eq!(seen[0].properties.message_type.as_deref(), Some("signal"));
        assert_eq!(
            seen[0].properties.correlation_id.as_deref(),
            Some(correlation_id.as_str())
        );
        assert_eq!(seen[0].content.message_id(), Some("Approve"));
    }

    #[test]
    fn test_supplied_correlation_id_is_kept() {
        let broker = Broker::new("task");
        let api = Api::new(owner(&broker), Some(&message("task_1")), None).unwrap();
        let id = api.send_api_message(
            actions::STOP,
            None,
            ApiOptions::default().with_correlation_id("corr-1"),
        );
        assert_eq!(id, "corr-1");
    }

    #[test]
    fn test_routing_key_without_execution_id() {
        let broker = Broker::new("task");
        let bare = Message::new("activity.init", Content::new("task", "bpmn:Task"));
        let api = Api::new(owner(&broker), Some(&bare), None).unwrap();
        assert_eq!(api.routing_key("discard"), "activity.discard");
    }

    #[test]
    fn test_get_postponed_prefers_own_listing() {
        let broker = Broker::new("task");
        let nested: Arc<dyn ApiOwner> = Arc::new(Owner {
            broker: broker.clone(),
            postponed: Some(vec![message("nested_1")]),
            nested: None,
        });

        let with_own: Arc<dyn ApiOwner> = Arc::new(Owner {
            broker: broker.clone(),
            postponed: Some(vec![message("own_1"), message("own_2")]),
            nested: Some(nested.clone()),
        });
        let api = Api::new(with_own, Some(&message("x")), None).unwrap();
        assert_eq!(api.get_postponed().len(), 2);

        let via_nested: Arc<dyn ApiOwner> = Arc::new(Owner {
            broker: broker.clone(),
            postponed: None,
            nested: Some(nested),
        });
        let api = Api::new(via_nested, Some(&message("x")), None).unwrap();
        let postponed = api.get_postponed();
        assert_eq!(postponed.len(), 1);
        assert_eq!(postponed[0].execution_id(), Some("nested_1"));

        let api = Api::new(owner(&broker), Some(&message("x")), None).unwrap();
        assert!(api.get_postponed().is_empty());
    }

    #[test]
    fn test_resolve_expression_uses_message() {
        let broker = Broker::new("task");
        let api = Api::new(owner(&broker), Some(&message("task_1")), None).unwrap();
        assert_eq!(
            api.resolve_expression("${content.executionId}").unwrap(),
            Some(json!("task_1"))
        );
    }
}
