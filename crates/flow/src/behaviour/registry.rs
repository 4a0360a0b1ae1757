//! Behaviour registry for element-type dispatch
//!
//! Maps element types to factories so activities can be built from a parsed
//! definition without knowing concrete behaviour types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{
    Behaviour, ConditionalEventDefinition, EventBehaviour, EventDefinition,
    SignalEventDefinition, SignalTaskBehaviour, TaskBehaviour,
};
use crate::error::RegistryError;
use crate::model::{ElementDef, EventDefinitionDef};

/// Factory building a behaviour for one element
pub type BehaviourFactory =
    Box<dyn Fn(&ElementDef) -> Result<Arc<dyn Behaviour>, RegistryError> + Send + Sync>;

/// Registry of behaviour factories keyed by element type
pub struct BehaviourRegistry {
    factories: HashMap<String, BehaviourFactory>,
}

impl BehaviourRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the generic task, wait and event behaviours
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        for element_type in [
            "bpmn:Task",
            "bpmn:ScriptTask",
            "bpmn:ServiceTask",
            "bpmn:SendTask",
            "bpmn:BusinessRuleTask",
        ] {
            registry.register(element_type, task_factory);
        }

        for element_type in ["bpmn:UserTask", "bpmn:ManualTask", "bpmn:ReceiveTask"] {
            registry.register(element_type, |def: &ElementDef| {
                Ok(Arc::new(SignalTaskBehaviour::new(reference_setting(def))) as Arc<dyn Behaviour>)
            });
        }

        for element_type in [
            "bpmn:StartEvent",
            "bpmn:EndEvent",
            "bpmn:IntermediateCatchEvent",
            "bpmn:IntermediateThrowEvent",
        ] {
            registry.register(element_type, event_factory);
        }

        registry
    }

    /// Register a factory for an element type, replacing any previous one
    pub fn register<F>(&mut self, element_type: impl Into<String>, factory: F)
    where
        F: Fn(&ElementDef) -> Result<Arc<dyn Behaviour>, RegistryError> + Send + Sync + 'static,
    {
        self.factories.insert(element_type.into(), Box::new(factory));
    }

    /// Build the behaviour for an element
    pub fn create(&self, def: &ElementDef) -> Result<Arc<dyn Behaviour>, RegistryError> {
        let factory = self
            .factories
            .get(&def.element_type)
            .ok_or_else(|| RegistryError::UnknownType(def.element_type.clone()))?;
        factory(def)
    }

    /// Check if an element type is registered
    pub fn is_registered(&self, element_type: &str) -> bool {
        self.factories.contains_key(element_type)
    }

    /// Get all registered element types
    pub fn element_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for BehaviourRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BehaviourRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviourRegistry")
            .field("element_types", &self.element_types())
            .finish()
    }
}

fn reference_setting(def: &ElementDef) -> Option<String> {
    def.behaviour
        .get("reference")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn task_factory(def: &ElementDef) -> Result<Arc<dyn Behaviour>, RegistryError> {
    Ok(Arc::new(TaskBehaviour::new(def.behaviour.get("output").cloned())))
}

fn event_factory(def: &ElementDef) -> Result<Arc<dyn Behaviour>, RegistryError> {
    if def.event_definitions.is_empty() {
        return task_factory(def);
    }

    let definitions = def
        .event_definitions
        .iter()
        .map(|d| event_definition(def, d))
        .collect::<Result<Vec<_>, _>>()?;

    let mut behaviour = EventBehaviour::new(definitions);
    if let Some(key) = def.behaviour.get("completionKey").and_then(|v| v.as_str()) {
        behaviour = behaviour.with_completion_key(key);
    }
    Ok(Arc::new(behaviour))
}

fn event_definition(
    element: &ElementDef,
    def: &EventDefinitionDef,
) -> Result<Arc<dyn EventDefinition>, RegistryError> {
    match def.definition_type.as_str() {
        "bpmn:SignalEventDefinition" | "bpmn:MessageEventDefinition" => {
            Ok(Arc::new(SignalEventDefinition::new(def.reference.clone())))
        }
        "bpmn:ConditionalEventDefinition" => {
            let condition = def.condition.clone().ok_or_else(|| RegistryError::Factory {
                element_id: element.id.clone(),
                message: "conditional event definition without condition".to_string(),
            })?;
            Ok(Arc::new(ConditionalEventDefinition::new(condition)))
        }
        other => Err(RegistryError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventDefinitionDef;

    #[test]
    fn test_defaults_cover_common_types() {
        let registry = BehaviourRegistry::with_defaults();
        assert!(registry.is_registered("bpmn:Task"));
        assert!(registry.is_registered("bpmn:UserTask"));
        assert!(registry.is_registered("bpmn:IntermediateCatchEvent"));
    }

    #[test]
    fn test_defaults_leave_gateways_unregistered() {
        let registry = BehaviourRegistry::with_defaults();
        for gateway in ["bpmn:ExclusiveGateway", "bpmn:ParallelGateway", "bpmn:InclusiveGateway"] {
            assert!(!registry.is_registered(gateway), "{}", gateway);
        }
    }

    #[test]
    fn test_unknown_type() {
        let registry = BehaviourRegistry::new();
        let result = registry.create(&ElementDef::new("x", "bpmn:Mystery"));
        assert!(matches!(result, Err(RegistryError::UnknownType(t)) if t == "bpmn:Mystery"));
    }

    #[test]
    fn test_event_without_condition_fails() {
        let registry = BehaviourRegistry::with_defaults();
        let mut def = ElementDef::new("catch", "bpmn:IntermediateCatchEvent");
        def.event_definitions.push(EventDefinitionDef {
            definition_type: "bpmn:ConditionalEventDefinition".into(),
            reference: None,
            condition: None,
        });
        assert!(matches!(
            registry.create(&def),
            Err(RegistryError::Factory { .. })
        ));
    }

    #[test]
    fn test_register_custom_factory() {
        let mut registry = BehaviourRegistry::new();
        registry.register("custom:Noop", |_def: &ElementDef| {
            Ok(Arc::new(TaskBehaviour::default()) as Arc<dyn Behaviour>)
        });
        let def = ElementDef::new("noop", "custom:Noop")
            .with_event_definition(EventDefinitionDef::signal("ignored"));
        assert!(registry.create(&def).is_ok());
        assert_eq!(registry.element_types(), vec!["custom:Noop"]);
    }
}
