// Flow Execution Engine
//
// This crate drives parsed process definitions to completion inside one
// process: definitions run processes, processes run activities, activities
// run behaviours. Coordinators at every level talk only through an
// in-process topic broker.
//
// Key design decisions:
// - Every element owns a broker with `event`, `execution` and `api` exchanges;
//   scopes shovel child events upward so observers can subscribe at the top
// - Publish is synchronous: consumers run before `publish` returns
// - Suspension is coordinator state (postponed entries), never a held stack;
//   in-flight entries are unacknowledged queue messages so snapshots carry them
// - Exactly one terminal publish per execution id
// - Behaviours plug in through a registry keyed by element type
//
//   Definition ── ScopeExecution ── Process ── ScopeExecution ── Activity
//                                                                  │
//                                               ActivityExecution ─┤
//                                                                  │
//                                     Behaviour / EventDefinitionExecution

// Messaging substrate
pub mod broker;

// Protocol pieces
pub mod api;
pub mod chain;
pub mod status;

// Elements and coordinators
pub mod activity;
pub mod behaviour;
pub mod element;
pub mod execution;
pub mod race;
pub mod scope;

// Input, snapshots and environment
pub mod config;
pub mod expression;
pub mod model;
pub mod snapshot;

pub mod error;
pub mod telemetry;

// Re-exports for convenience
pub use activity::{Activity, ActivityExecution};
pub use api::{Api, ApiOptions, ApiOwner};
pub use behaviour::{Behaviour, BehaviourRegistry, EventDefinition, ExecutionScope};
pub use broker::{Broker, Content, Message};
pub use chain::{shift_parent, unshift_parent, ElementRef, ParentChain};
pub use config::EngineConfig;
pub use element::Element;
pub use error::{ExecutionError, FlowError, Result};
pub use execution::{ExecutionStatus, ScopeExecution};
pub use expression::Environment;
pub use model::{DefinitionDef, ElementDef, EventDefinitionDef, ProcessDef};
pub use race::EventDefinitionExecution;
pub use scope::{Scope, ScopeKind};
pub use snapshot::{ElementState, ExecutionState};
pub use status::{ActivityStatus, StatusTracker};

/// Common imports for embedding the engine
pub mod prelude {
    pub use crate::api::{actions, Api, ApiOwner};
    pub use crate::behaviour::{Behaviour, BehaviourRegistry, ExecutionScope};
    pub use crate::broker::{exchanges, keys, Broker, Content, Message, SubscribeOptions};
    pub use crate::element::Element;
    pub use crate::error::{FlowError, Result};
    pub use crate::expression::Environment;
    pub use crate::model::{DefinitionDef, ElementDef, EventDefinitionDef, ProcessDef};
    pub use crate::scope::Scope;
    pub use crate::snapshot::{ElementState, ElementStatus, ExecutionStatus};
}
