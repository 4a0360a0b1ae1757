// Engine Configuration
//
// Routing and priority settings shared by every coordinator, loaded from
// environment variables or built in code.

use std::env;

use serde::{Deserialize, Serialize};

use crate::broker::keys;

/// Configuration for coordinators and behaviours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Routing key the race coordinator publishes when a definition wins
    pub completion_key: String,

    /// Priority of race listeners on an activity execution exchange
    pub race_priority: i32,

    /// Priority of per-activity execution queues
    pub execution_priority: i32,

    /// Priority of coordinator subscriptions to child events
    pub child_priority: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion_key: keys::EXECUTE_COMPLETED.to_string(),
            race_priority: 300,
            execution_priority: 100,
            child_priority: 200,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `FLOW_COMPLETION_KEY`: race completion routing key (default: execute.completed)
    /// - `FLOW_RACE_PRIORITY`: race listener priority (default: 300)
    /// - `FLOW_EXECUTION_PRIORITY`: activity execution queue priority (default: 100)
    /// - `FLOW_CHILD_PRIORITY`: child event subscription priority (default: 200)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            completion_key: env::var("FLOW_COMPLETION_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.completion_key),
            race_priority: env::var("FLOW_RACE_PRIORITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.race_priority),
            execution_priority: env::var("FLOW_EXECUTION_PRIORITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.execution_priority),
            child_priority: env::var("FLOW_CHILD_PRIORITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.child_priority),
        }
    }

    pub fn with_completion_key(mut self, key: impl Into<String>) -> Self {
        self.completion_key = key.into();
        self
    }

    pub fn with_race_priority(mut self, priority: i32) -> Self {
        self.race_priority = priority;
        self
    }
}
