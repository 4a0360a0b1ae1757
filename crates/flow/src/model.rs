//! Parsed definition graph
//!
//! These types are the input the engine runs. Producing them from a modeler
//! format happens outside the engine; they deserialize from JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One event definition attached to an event activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinitionDef {
    #[serde(rename = "type")]
    pub definition_type: String,
    /// Signal or message id this definition waits for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Expression evaluated by conditional definitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl EventDefinitionDef {
    pub fn signal(reference: impl Into<String>) -> Self {
        Self {
            definition_type: "bpmn:SignalEventDefinition".to_string(),
            reference: Some(reference.into()),
            condition: None,
        }
    }

    pub fn conditional(condition: impl Into<String>) -> Self {
        Self {
            definition_type: "bpmn:ConditionalEventDefinition".to_string(),
            reference: None,
            condition: Some(condition.into()),
        }
    }
}

/// One activity or event in a process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDef {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Ids of elements flowing into this one
    #[serde(default)]
    pub inbound: Vec<String>,
    /// Ids of elements this one flows into
    #[serde(default)]
    pub outbound: Vec<String>,
    /// Signal/message ids that start this element when idle
    #[serde(default)]
    pub start_references: Vec<String>,
    #[serde(default)]
    pub event_definitions: Vec<EventDefinitionDef>,
    /// Behaviour-specific settings
    #[serde(default)]
    pub behaviour: Map<String, Value>,
}

impl ElementDef {
    pub fn new(id: impl Into<String>, element_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            ..Default::default()
        }
    }

    pub fn with_start_reference(mut self, reference: impl Into<String>) -> Self {
        self.start_references.push(reference.into());
        self
    }

    pub fn with_event_definition(mut self, definition: EventDefinitionDef) -> Self {
        self.event_definitions.push(definition);
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.behaviour.insert(key.into(), value);
        self
    }

    /// Elements without inbound flows or start references run when the scope starts
    pub fn is_start(&self) -> bool {
        self.inbound.is_empty() && self.start_references.is_empty()
    }
}

fn default_process_type() -> String {
    "bpmn:Process".to_string()
}

fn default_definition_type() -> String {
    "bpmn:Definitions".to_string()
}

fn default_true() -> bool {
    true
}

/// A process and its elements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDef {
    pub id: String,
    #[serde(rename = "type", default = "default_process_type")]
    pub element_type: String,
    #[serde(default = "default_true")]
    pub executable: bool,
    #[serde(default)]
    pub elements: Vec<ElementDef>,
}

impl ProcessDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            element_type: default_process_type(),
            executable: true,
            elements: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: ElementDef) -> Self {
        self.elements.push(element);
        self
    }

    pub fn non_executable(mut self) -> Self {
        self.executable = false;
        self
    }

    /// Connect two elements with a flow
    pub fn with_flow(mut self, from: &str, to: &str) -> Self {
        for element in &mut self.elements {
            if element.id == from && !element.outbound.iter().any(|t| t == to) {
                element.outbound.push(to.to_string());
            }
            if element.id == to && !element.inbound.iter().any(|s| s == from) {
                element.inbound.push(from.to_string());
            }
        }
        self
    }
}

/// Top-level definition holding processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionDef {
    pub id: String,
    #[serde(rename = "type", default = "default_definition_type")]
    pub element_type: String,
    #[serde(default)]
    pub processes: Vec<ProcessDef>,
}

impl DefinitionDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            element_type: default_definition_type(),
            processes: Vec::new(),
        }
    }

    pub fn with_process(mut self, process: ProcessDef) -> Self {
        self.processes.push(process);
        self
    }
}
