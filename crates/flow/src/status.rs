//! Activity status tracking
//!
//! Aggregates child lifecycle events into a single scope status.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::broker::Content;

/// Aggregated activity status of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Nothing in flight
    Idle,
    /// At least one activity is executing
    Executing,
    /// Only timers are pending
    Timer,
    /// Activities are waiting for external input
    Wait,
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityStatus::Idle => write!(f, "idle"),
            ActivityStatus::Executing => write!(f, "executing"),
            ActivityStatus::Timer => write!(f, "timer"),
            ActivityStatus::Wait => write!(f, "wait"),
        }
    }
}

/// Tracks which activity executions are waiting, executing or on a timer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusTracker {
    wait: BTreeSet<String>,
    execute: BTreeSet<String>,
    timer: BTreeSet<String>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one lifecycle event
    pub fn track(&mut self, routing_key: &str, content: &Content) {
        if Self::is_ignored(routing_key) {
            return;
        }

        match routing_key {
            "activity.enter"
            | "activity.start"
            | "activity.execution.completed"
            | "activity.execution.error"
            | "activity.end" => {
                if let Some(id) = Self::own_id(content) {
                    self.wait.remove(&id);
                    self.execute.insert(id);
                }
            }
            "activity.execution.outbound.take"
            | "activity.detach"
            | "activity.call"
            | "activity.wait" => {
                if let Some(id) = Self::keyed_id(content) {
                    self.execute.remove(&id);
                    self.wait.insert(id);
                }
            }
            "activity.timer" => {
                if let Some(id) = Self::own_id(content) {
                    self.execute.remove(&id);
                    self.timer.insert(id);
                }
            }
            "activity.leave" => {
                if let Some(id) = Self::own_id(content) {
                    self.wait.remove(&id);
                    self.execute.remove(&id);
                    self.timer.remove(&id);
                }
            }
            _ => {}
        }
    }

    /// Derived status: executing beats timer beats wait
    pub fn status(&self) -> ActivityStatus {
        if !self.execute.is_empty() {
            ActivityStatus::Executing
        } else if !self.timer.is_empty() {
            ActivityStatus::Timer
        } else if !self.wait.is_empty() {
            ActivityStatus::Wait
        } else {
            ActivityStatus::Idle
        }
    }

    pub fn clear(&mut self) {
        self.wait.clear();
        self.execute.clear();
        self.timer.clear();
    }

    fn is_ignored(routing_key: &str) -> bool {
        ["association.", "flow.", "process.", "definition."]
            .iter()
            .any(|prefix| routing_key.starts_with(prefix))
    }

    fn own_id(content: &Content) -> Option<String> {
        content.execution_id.clone()
    }

    // multi-instance iterations report against their parent execution
    fn keyed_id(content: &Content) -> Option<String> {
        if content.is_multi_instance {
            content
                .parent
                .as_ref()
                .and_then(|p| p.head.execution_id.clone())
        } else {
            Self::own_id(content)
        }
    }
}
