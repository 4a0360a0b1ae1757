//! Activity element
//!
//! An activity owns a broker, a behaviour and, while running, one
//! [`ActivityExecution`]. It announces its lifecycle on its `event`
//! exchange:
//!
//! ```text
//! init -> enter -> start -> (wait | timer)* -> execution.completed -> end -> leave
//!                        \-> discard -> leave
//!                        \-> error -> leave
//!                        \-> stop
//! ```
//!
//! `leave` carries the outbound flows the owning scope relays to siblings.

mod execution;

pub use execution::ActivityExecution;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::{actions, Api, ApiOwner};
use crate::behaviour::{Behaviour, BehaviourRegistry, ExecutionScope};
use crate::broker::{
    exchanges, keys, new_execution_id, Broker, Content, Handler, Message, OutboundFlow,
    Properties, SubscribeOptions,
};
use crate::chain::{ElementRef, ParentChain};
use crate::element::Element;
use crate::error::{FlowError, Result};
use crate::expression::Environment;
use crate::model::ElementDef;
use crate::snapshot::{Counters, ElementState, ElementStatus};

struct ActivityInner {
    status: ElementStatus,
    execution_id: Option<String>,
    /// `execution_id` was allocated by `init` and not used by a run yet
    initialized: bool,
    parent: Option<ParentChain>,
    stopped: bool,
    counters: Counters,
    run_content: Option<Content>,
    execution: Option<Arc<ActivityExecution>>,
    api_tag: Option<String>,
}

/// A runnable element driven by a [`Behaviour`]
pub struct Activity {
    def: ElementDef,
    broker: Broker,
    behaviour: Arc<dyn Behaviour>,
    environment: Environment,
    state: Mutex<ActivityInner>,
    me: Weak<Activity>,
}

impl Activity {
    pub fn new(def: ElementDef, behaviour: Arc<dyn Behaviour>, environment: Environment) -> Arc<Self> {
        let broker = Broker::new(def.id.clone());
        Arc::new_cyclic(|me| Self {
            def,
            broker,
            behaviour,
            environment,
            state: Mutex::new(ActivityInner {
                status: ElementStatus::Idle,
                execution_id: None,
                initialized: false,
                parent: None,
                stopped: false,
                counters: Counters::default(),
                run_content: None,
                execution: None,
                api_tag: None,
            }),
            me: me.clone(),
        })
    }

    /// Build an activity with the behaviour registered for its type
    pub fn from_registry(
        def: ElementDef,
        registry: &BehaviourRegistry,
        environment: Environment,
    ) -> Result<Arc<Self>> {
        let behaviour = registry.create(&def)?;
        Ok(Self::new(def, behaviour, environment))
    }

    pub fn def(&self) -> &ElementDef {
        &self.def
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn status(&self) -> ElementStatus {
        self.state.lock().status
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().counters
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn execution(&self) -> Option<Arc<ActivityExecution>> {
        self.state.lock().execution.clone()
    }

    pub(crate) fn run_content(&self) -> Option<Content> {
        self.state.lock().run_content.clone()
    }

    fn publish_event(&self, action: &str, content: Content) {
        self.broker.publish(
            exchanges::EVENT,
            &format!("activity.{}", action),
            content,
            Properties::new(),
        );
    }

    fn element_ref(&self, execution_id: &str) -> ElementRef {
        ElementRef::new(self.def.id.clone(), self.def.element_type.clone())
            .with_execution_id(execution_id)
    }

    fn subscribe_api(&self, execution_id: &str) {
        let me = self.me.clone();
        let handler: Handler = Arc::new(move |message: &Message| {
            let Some(activity) = me.upgrade() else {
                return;
            };
            match message.properties.message_type.as_deref() {
                Some(actions::STOP) => activity.stop(),
                Some(actions::DISCARD) | Some(actions::CANCEL) => activity.discard(),
                _ => {}
            }
        });
        let tag = self.broker.subscribe_tmp(
            exchanges::API,
            &format!("activity.*.{}", execution_id),
            handler,
            SubscribeOptions::default().with_consumer_tag(format!("_activity-api-{}", execution_id)),
        );
        self.state.lock().api_tag = Some(tag);
    }

    fn outbound(&self, action: fn(String) -> OutboundFlow) -> Vec<OutboundFlow> {
        self.def.outbound.iter().cloned().map(action).collect()
    }

    fn leave_discarded(&self, mut content: Content) {
        content.outbound = self.outbound(OutboundFlow::discard);
        content.discard_sequence.push(self.def.id.clone());
        self.publish_event("leave", content);
    }

    /// Called by the execution once its root execution reached a terminal key
    pub(crate) fn on_execution_completed(&self, routing_key: &str, message: &Message) {
        let (content, api_tag) = {
            let mut state = self.state.lock();
            state.status = ElementStatus::Idle;
            match routing_key {
                keys::EXECUTE_COMPLETED => state.counters.taken += 1,
                keys::EXECUTE_DISCARD => state.counters.discarded += 1,
                _ => {}
            }
            let mut content = state
                .run_content
                .clone()
                .unwrap_or_else(|| message.content.clone());
            content.is_root_scope = false;
            content.output = message.content.output.clone();
            content.error = message.content.error.clone();
            (content, state.api_tag.take())
        };
        if let Some(tag) = api_tag {
            self.broker.cancel(&tag);
        }

        match routing_key {
            keys::EXECUTE_COMPLETED => {
                self.publish_event("execution.completed", content.clone());
                self.publish_event("end", content.clone());
                let mut leave = content;
                leave.outbound = if message.content.outbound.is_empty() {
                    self.outbound(OutboundFlow::take)
                } else {
                    message.content.outbound.clone()
                };
                self.publish_event("leave", leave);
            }
            keys::EXECUTE_DISCARD => {
                self.publish_event("discard", content.clone());
                self.leave_discarded(content);
            }
            _ => {
                warn!(
                    activity_id = %self.def.id,
                    error = ?content.error,
                    "Activity failed"
                );
                self.publish_event("error", content.clone());
                self.publish_event("leave", content);
            }
        }
    }

    /// Locate the unacknowledged root start of a recovered run
    fn recovered_root(state: &ElementState, execution_id: &str) -> Option<Content> {
        let queue_name = format!("execute-{}-q", execution_id);
        state
            .broker
            .as_ref()?
            .queues
            .iter()
            .find(|q| q.name == queue_name)?
            .messages
            .iter()
            .find(|m| m.content.is_root_scope && m.execution_id() == Some(execution_id))
            .map(|m| m.content.clone())
    }
}

impl ApiOwner for Activity {
    fn broker(&self) -> Broker {
        self.broker.clone()
    }

    fn api_prefix(&self) -> &str {
        "activity"
    }

    fn nested(&self) -> Option<Arc<dyn ApiOwner>> {
        self.execution().map(|e| e as Arc<dyn ApiOwner>)
    }
}

impl Element for Activity {
    fn id(&self) -> &str {
        &self.def.id
    }

    fn element_type(&self) -> &str {
        &self.def.element_type
    }

    fn is_start(&self) -> bool {
        self.def.is_start()
    }

    fn start_references(&self) -> &[String] {
        &self.def.start_references
    }

    fn is_running(&self) -> bool {
        self.status() == ElementStatus::Running
    }

    fn execution_id(&self) -> Option<String> {
        self.state.lock().execution_id.clone()
    }

    fn init(&self, parent: Option<&ParentChain>) {
        let execution_id = {
            let mut state = self.state.lock();
            if state.status == ElementStatus::Running {
                return;
            }
            let execution_id = new_execution_id(&self.def.id);
            state.execution_id = Some(execution_id.clone());
            state.initialized = true;
            state.parent = parent.cloned();
            execution_id
        };
        let content = Content::new(self.def.id.clone(), self.def.element_type.clone())
            .with_execution_id(execution_id)
            .with_parent(parent.cloned());
        self.publish_event("init", content);
    }

    fn run(&self, input: Content) -> Result<()> {
        let content = {
            let mut state = self.state.lock();
            if state.status == ElementStatus::Running {
                return Err(FlowError::AlreadyRunning(self.def.id.clone()));
            }
            let execution_id = match (state.initialized, state.execution_id.clone()) {
                (true, Some(id)) => id,
                _ => new_execution_id(&self.def.id),
            };
            let parent = input.parent.clone().or_else(|| state.parent.clone());

            let mut content = Content::new(self.def.id.clone(), self.def.element_type.clone())
                .with_execution_id(execution_id.clone())
                .with_parent(parent.clone());
            content.inbound = input.inbound;
            content.discard = input.discard;
            content.discard_sequence = input.discard_sequence;
            content.message = input.message;

            state.status = ElementStatus::Running;
            state.execution_id = Some(execution_id);
            state.initialized = false;
            state.parent = parent;
            state.stopped = false;
            state.run_content = Some(content.clone());
            state.execution = None;
            content
        };
        let execution_id = content.execution_id.clone().unwrap_or_default();

        self.subscribe_api(&execution_id);
        self.publish_event("enter", content.clone());

        if content.discard {
            debug!(activity_id = %self.def.id, %execution_id, "Activity discarded on enter");
            let api_tag = {
                let mut state = self.state.lock();
                state.status = ElementStatus::Idle;
                state.counters.discarded += 1;
                state.api_tag.take()
            };
            if let Some(tag) = api_tag {
                self.broker.cancel(&tag);
            }
            self.publish_event("discard", content.clone());
            self.leave_discarded(content);
            return Ok(());
        }

        self.publish_event("start", content.clone());

        let scope = ExecutionScope::new(
            self.element_ref(&execution_id),
            content.parent.clone(),
            self.broker.clone(),
            self.environment.clone(),
        );
        let execution = ActivityExecution::new(self.me.clone(), scope, self.behaviour.clone());
        self.state.lock().execution = Some(execution.clone());

        let mut root = content;
        root.is_root_scope = true;
        execution.execute(Message::new(keys::EXECUTE_START, root))
    }

    fn stop(&self) {
        let (execution, api_tag, content) = {
            let mut state = self.state.lock();
            if state.status != ElementStatus::Running {
                return;
            }
            state.status = ElementStatus::Stopped;
            state.stopped = true;
            (
                state.execution.clone(),
                state.api_tag.take(),
                state.run_content.clone(),
            )
        };
        if let Some(tag) = api_tag {
            self.broker.cancel(&tag);
        }
        if let Some(execution) = execution {
            execution.stop();
        }
        info!(activity_id = %self.def.id, "Activity stopped");
        if let Some(content) = content {
            self.publish_event("stop", content);
        }
    }

    fn discard(&self) {
        if !self.is_running() {
            return;
        }
        match self.execution() {
            Some(execution) => execution.discard(),
            None => warn!(activity_id = %self.def.id, "Discard without execution"),
        }
    }

    fn resume(&self) -> Result<()> {
        let (execution_id, execution) = {
            let mut state = self.state.lock();
            let resumable = match state.status {
                ElementStatus::Stopped => true,
                ElementStatus::Running => state.api_tag.is_none(),
                ElementStatus::Idle => false,
            };
            if !resumable {
                return Ok(());
            }
            state.status = ElementStatus::Running;
            state.stopped = false;
            (state.execution_id.clone(), state.execution.clone())
        };
        let Some(execution_id) = execution_id else {
            return Err(FlowError::MissingExecutionId(self.def.id.clone()));
        };
        debug!(activity_id = %self.def.id, %execution_id, "Resuming activity");
        self.subscribe_api(&execution_id);
        match execution {
            Some(execution) => execution.resume(),
            None => {
                warn!(activity_id = %self.def.id, "Nothing to resume");
                Ok(())
            }
        }
    }

    fn get_api(&self, message: Option<&Message>) -> Result<Api> {
        let owner: Arc<dyn ApiOwner> = self
            .me
            .upgrade()
            .ok_or_else(|| FlowError::not_running(self.def.id.clone()))?;
        let fallback = self
            .run_content()
            .map(|content| Message::new("activity.api", content));
        Api::new(
            owner,
            message.or(fallback.as_ref()),
            Some(self.environment.clone()),
        )
    }

    fn get_state(&self) -> ElementState {
        let state = self.state.lock();
        ElementState {
            id: self.def.id.clone(),
            element_type: self.def.element_type.clone(),
            status: state.status,
            execution_id: state.execution_id.clone(),
            stopped: state.stopped,
            counters: state.counters,
            broker: Some(self.broker.get_state()),
            execution: state.execution.as_ref().map(|e| e.get_state()),
        }
    }

    fn recover(&self, snapshot: &ElementState) -> Result<()> {
        if self.is_running() {
            return Err(FlowError::AlreadyRunning(self.def.id.clone()));
        }
        if let Some(broker) = &snapshot.broker {
            self.broker.recover(broker);
        }

        let root = snapshot
            .execution_id
            .as_deref()
            .and_then(|id| Self::recovered_root(snapshot, id));

        let execution = match (&snapshot.execution, &snapshot.execution_id) {
            (Some(exec_state), Some(execution_id)) if !exec_state.completed => {
                let parent = root.as_ref().and_then(|c| c.parent.clone());
                let scope = ExecutionScope::new(
                    self.element_ref(execution_id),
                    parent,
                    self.broker.clone(),
                    self.environment.clone(),
                );
                Some(ActivityExecution::recovered(
                    self.me.clone(),
                    scope,
                    self.behaviour.clone(),
                    exec_state,
                ))
            }
            _ => None,
        };

        let mut state = self.state.lock();
        state.status = snapshot.status;
        state.execution_id = snapshot.execution_id.clone();
        state.initialized = false;
        state.stopped = snapshot.stopped;
        state.counters = snapshot.counters;
        state.parent = root.as_ref().and_then(|c| c.parent.clone());
        state.run_content = root.map(|mut c| {
            c.is_root_scope = false;
            c
        });
        state.execution = execution;
        state.api_tag = None;
        Ok(())
    }
}
