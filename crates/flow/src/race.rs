//! Event definition race
//!
//! An event activity with several event definitions starts all of them and
//! completes with whichever reports `execute.completed` first.
//!
//! ```text
//!   execute.start (root)
//!        │
//!        ├─► execute.start  <root>_0  ──► definition 0
//!        ├─► execute.start  <root>_1  ──► definition 1     (skipped if 0 already won)
//!        │
//!   execute.completed <root>_k (definition scoped)
//!        │
//!        └─► <completion key> <root>   (parent chain unwrapped one level)
//! ```
//!
//! Starts are published in order. Publish is synchronous, so a definition
//! that completes while it is being started pre-empts every later one.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::actions;
use crate::behaviour::{EventDefinition, ExecutionScope};
use crate::broker::{exchanges, keys, Content, Handler, Message, SubscribeOptions};
use crate::chain::{shift_parent, unshift_parent};
use crate::error::ExecutionError;

#[derive(Default)]
struct RaceState {
    root: Option<Content>,
    completed: bool,
    stopped: bool,
    execute_tag: Option<String>,
    api_tag: Option<String>,
}

/// First-to-finish coordinator for the event definitions of one activity run
pub struct EventDefinitionExecution {
    scope: ExecutionScope,
    definitions: Vec<Arc<dyn EventDefinition>>,
    completion_key: String,
    state: Mutex<RaceState>,
    me: Weak<EventDefinitionExecution>,
}

impl EventDefinitionExecution {
    /// Create a race using the configured completion key
    pub fn new(scope: ExecutionScope, definitions: Vec<Arc<dyn EventDefinition>>) -> Arc<Self> {
        let completion_key = scope.config().completion_key.clone();
        Self::with_completion_key(scope, definitions, completion_key)
    }

    /// Create a race that publishes the winner under `completion_key`
    pub fn with_completion_key(
        scope: ExecutionScope,
        definitions: Vec<Arc<dyn EventDefinition>>,
        completion_key: impl Into<String>,
    ) -> Arc<Self> {
        let completion_key = completion_key.into();
        Arc::new_cyclic(|me| Self {
            scope,
            definitions,
            completion_key,
            state: Mutex::new(RaceState::default()),
            me: me.clone(),
        })
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Completed or stopped; no further messages are handled
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.completed || state.stopped
    }

    /// Handle an execute message.
    ///
    /// Root messages start the race; definition messages (redelivered on
    /// resume) go straight to their definition by index.
    pub fn execute(&self, message: &Message) {
        if !message.content.is_root_scope {
            self.execute_definition(message);
            return;
        }

        let Some(root_id) = message.execution_id().map(str::to_string) else {
            warn!(id = %message.content.id, "Event definition race without execution id");
            return;
        };

        {
            let mut state = self.state.lock();
            state.root = Some(message.content.clone());
            state.completed = false;
            state.stopped = false;
        }
        self.activate(&root_id);

        if message.is_redelivered() {
            debug!(execution_id = %root_id, "Race resumed, awaiting redelivered definitions");
            return;
        }

        let activity = message.content.element_ref();
        let parent = unshift_parent(&activity, message.content.parent.as_ref());

        for (index, definition) in self.definitions.iter().enumerate() {
            if self.is_finished() {
                debug!(execution_id = %root_id, index, "Race decided, remaining definitions skipped");
                break;
            }

            let mut content = message.content.clone();
            content.element_type = definition.definition_type().to_string();
            content.execution_id = Some(format!("{}_{}", root_id, index));
            content.is_root_scope = false;
            content.is_definition_scope = true;
            content.index = Some(index);
            content.parent = Some(parent.clone());

            self.scope.publish_execution(keys::EXECUTE_START, content);
        }
    }

    fn activate(&self, root_id: &str) {
        let priority = self.scope.config().race_priority;
        let broker = self.scope.broker();

        let me = self.me.clone();
        let on_execute: Handler = Arc::new(move |message: &Message| {
            if let Some(race) = me.upgrade() {
                race.on_execute_message(message);
            }
        });
        let execute_tag = broker.subscribe_tmp(
            exchanges::EXECUTION,
            "execute.#",
            on_execute,
            SubscribeOptions::default()
                .with_priority(priority)
                .with_consumer_tag(format!("_eventdefinition-execution-{}", root_id)),
        );

        let me = self.me.clone();
        let on_api: Handler = Arc::new(move |message: &Message| {
            if let Some(race) = me.upgrade() {
                race.on_api_message(message);
            }
        });
        let api_tag = broker.subscribe_tmp(
            exchanges::API,
            &format!("*.*.{}", root_id),
            on_api,
            SubscribeOptions::default()
                .with_priority(priority)
                .with_consumer_tag(format!("_eventdefinition-api-{}", root_id)),
        );

        let mut state = self.state.lock();
        state.execute_tag = Some(execute_tag);
        state.api_tag = Some(api_tag);
    }

    fn execute_definition(&self, message: &Message) {
        let Some(index) = message.content.index else {
            warn!(execution_id = ?message.execution_id(), "Definition message without index, ignored");
            return;
        };
        let Some(definition) = self.definitions.get(index) else {
            warn!(
                execution_id = ?message.execution_id(),
                index,
                definitions = self.definitions.len(),
                "Definition index out of range, ignored"
            );
            return;
        };

        if let Err(err) = definition.execute(&self.scope, message) {
            warn!(index, error = %err, "Event definition failed");
            self.scope.fail(
                message,
                ExecutionError::wrap(self.scope.activity().id.clone(), &err),
            );
        }
    }

    fn on_execute_message(&self, message: &Message) {
        if self.is_finished() {
            return;
        }
        let content = &message.content;
        match message.routing_key() {
            keys::EXECUTE_START if content.is_definition_scope => self.execute_definition(message),
            keys::EXECUTE_COMPLETED if content.is_definition_scope => self.complete(message),
            keys::EXECUTE_DISCARD if !content.is_definition_scope => {
                debug!(execution_id = ?content.execution_id, "Activity discarded, race abandoned");
                self.stop_listening();
            }
            keys::EXECUTE_ERROR => self.stop_listening(),
            _ => {}
        }
    }

    fn on_api_message(&self, message: &Message) {
        match message.properties.message_type.as_deref() {
            Some(actions::STOP) | Some(actions::DISCARD) => self.stop_listening(),
            _ => {}
        }
    }

    fn complete(&self, message: &Message) {
        let root = {
            let mut state = self.state.lock();
            if state.completed || state.stopped {
                return;
            }
            state.completed = true;
            state.root.clone()
        };
        self.cancel_listeners();

        let Some(root) = root else {
            return;
        };
        info!(
            execution_id = ?root.execution_id,
            winner = ?message.content.index,
            "Event definition completed"
        );

        let mut content = message.content.clone();
        content.element_type = root.element_type.clone();
        content.execution_id = root.execution_id.clone();
        content.is_root_scope = true;
        content.is_definition_scope = false;
        content.index = None;
        content.parent = shift_parent(message.content.parent.as_ref());

        self.scope.publish_execution(&self.completion_key, content);
    }

    fn stop_listening(&self) {
        {
            let mut state = self.state.lock();
            if state.completed || state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.cancel_listeners();
    }

    fn cancel_listeners(&self) {
        let (execute_tag, api_tag) = {
            let mut state = self.state.lock();
            (state.execute_tag.take(), state.api_tag.take())
        };
        for tag in execute_tag.into_iter().chain(api_tag) {
            self.scope.broker().cancel(&tag);
        }
    }
}
