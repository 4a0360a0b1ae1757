//! Broker message types
//!
//! Every message carries `fields` (delivery metadata set by the broker),
//! `content` (the element payload) and `properties` (publisher metadata).
//! Cloning a message deep-copies everything it owns, so two messages in
//! flight never share mutable structure.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::chain::{ElementRef, ParentChain};
use crate::error::ExecutionError;

/// Exchange names shared by every element broker
pub mod exchanges {
    /// Lifecycle events published outward
    pub const EVENT: &str = "event";
    /// Coordinator and behaviour traffic
    pub const EXECUTION: &str = "execution";
    /// Commands addressed to element instances
    pub const API: &str = "api";
}

/// Routing keys used by coordinators
pub mod keys {
    pub const EXECUTE_START: &str = "execute.start";
    pub const EXECUTE_COMPLETED: &str = "execute.completed";
    pub const EXECUTE_DISCARD: &str = "execute.discard";
    pub const EXECUTE_ERROR: &str = "execute.error";
    pub const EXECUTION_STOPPED: &str = "execution.stopped";
    pub const EXECUTION_FATAL: &str = "execution.fatal";
}

/// Generate a fresh execution id for an element
pub fn new_execution_id(element_id: &str) -> String {
    format!("{}_{}", element_id, Uuid::now_v7().simple())
}

/// Delivery metadata, owned by the broker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fields {
    pub routing_key: String,
    pub exchange: String,
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,
    #[serde(default)]
    pub delivery_tag: u64,
}

/// Publisher metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delegate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn delegated(mut self) -> Self {
        self.delegate = true;
        self
    }
}

/// What a coordinator should do with an outbound target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    Take,
    Discard,
}

/// One outbound relation reported when an element leaves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFlow {
    pub target: String,
    pub action: FlowAction,
}

impl OutboundFlow {
    pub fn take(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            action: FlowAction::Take,
        }
    }

    pub fn discard(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            action: FlowAction::Discard,
        }
    }
}

/// Element payload of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentChain>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_root_scope: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_definition_scope: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_multi_instance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound: Vec<ElementRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound: Vec<OutboundFlow>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub discard: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discard_sequence: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Content {
    pub fn new(id: impl Into<String>, element_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            ..Default::default()
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_parent(mut self, parent: Option<ParentChain>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: ExecutionError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_message(mut self, message: Value) -> Self {
        self.message = Some(message);
        self
    }

    /// Address of the element instance this content describes
    pub fn element_ref(&self) -> ElementRef {
        ElementRef {
            id: self.id.clone(),
            element_type: self.element_type.clone(),
            execution_id: self.execution_id.clone(),
        }
    }

    /// Id of the message payload, used to match signal references
    pub fn message_id(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
    }
}

/// A delivered broker message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub fields: Fields,
    pub content: Content,
    pub properties: Properties,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, content: Content) -> Self {
        Self {
            fields: Fields {
                routing_key: routing_key.into(),
                ..Default::default()
            },
            content,
            properties: Properties::default(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.fields.routing_key
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.content.execution_id.as_deref()
    }

    pub fn is_redelivered(&self) -> bool {
        self.fields.redelivered
    }

    /// Last word of the routing key, e.g. `leave` for `activity.leave`
    pub fn action(&self) -> &str {
        self.fields
            .routing_key
            .rsplit('.')
            .next()
            .unwrap_or_default()
    }

    /// `{fields, content, properties}` view used by expression resolution
    pub fn to_context(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
