//! Process and definition execution coordinator
//!
//! A [`ScopeExecution`] owns one scope level: a definition's processes or a
//! process's activities. Children report through their own brokers; the
//! coordinator copies every child lifecycle event into its durable
//! `execute-<executionId>-q` queue and interprets them one at a time:
//!
//! ```text
//!   child broker            scope broker
//!  +--------------+        +--------------------------+
//!  | event        |  tmp   | execute-<id>-q           |
//!  |  activity.#  | -----> |  execute.start (root)    | -> postponed
//!  +--------------+        |  activity.enter ...      |    bookkeeping
//!                          +--------------------------+
//!                          | execution exchange       | <- execute.completed
//!                          |                          |    execute.error
//!                          |                          |    execute.discard
//!                          |                          |    execution.stopped
//!                          |                          |    execution.fatal
//!                          +--------------------------+
//! ```
//!
//! Events stay unacknowledged while their child is in flight, so a broker
//! snapshot holds exactly the postponed entries a resumed coordinator needs.
//! Only one terminal publish happens per execution id.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::{actions, Api, ApiOwner};
use crate::broker::{
    exchanges, keys, Broker, ConsumeOptions, Content, FlowAction, Handler, Message, Properties,
    QueueOptions, SubscribeOptions,
};
use crate::chain::{unshift_parent, ElementRef, ParentChain};
use crate::element::Element;
use crate::error::{ExecutionError, FlowError, Result};
use crate::expression::Environment;
use crate::scope::ScopeKind;
use crate::snapshot::ExecutionState;
use crate::status::{ActivityStatus, StatusTracker};

pub use crate::snapshot::ExecutionStatus;

#[derive(Default)]
struct ScopeInner {
    execution_id: Option<String>,
    status: ExecutionStatus,
    completed: bool,
    stopped: bool,
    fatal: bool,
    root: Option<Content>,
    postponed: Vec<Message>,
    tracker: StatusTracker,
    consumer_tag: Option<String>,
    child_tags: Vec<(Broker, String)>,
    api_tag: Option<String>,
}

/// Coordinator of one process or definition run
pub struct ScopeExecution {
    kind: ScopeKind,
    id: String,
    element_type: String,
    broker: Broker,
    environment: Environment,
    children: Vec<Arc<dyn Element>>,
    state: Mutex<ScopeInner>,
    me: Weak<ScopeExecution>,
}

impl ScopeExecution {
    pub fn new(
        kind: ScopeKind,
        id: impl Into<String>,
        element_type: impl Into<String>,
        broker: Broker,
        environment: Environment,
        children: Vec<Arc<dyn Element>>,
    ) -> Arc<Self> {
        let id = id.into();
        let element_type = element_type.into();
        Arc::new_cyclic(|me| Self {
            kind,
            id,
            element_type,
            broker,
            environment,
            children,
            state: Mutex::new(ScopeInner::default()),
            me: me.clone(),
        })
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn children(&self) -> &[Arc<dyn Element>] {
        &self.children
    }

    pub fn get_child(&self, id: &str) -> Option<&Arc<dyn Element>> {
        self.children.iter().find(|c| c.id() == id)
    }

    pub fn execution_id(&self) -> Option<String> {
        self.state.lock().execution_id.clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.consumer_tag.is_some() && !state.completed
    }

    /// Aggregated status of in-flight children
    pub fn activity_status(&self) -> ActivityStatus {
        self.state.lock().tracker.status()
    }

    /// Latest message of every in-flight child
    pub fn postponed_messages(&self) -> Vec<Message> {
        self.state.lock().postponed.clone()
    }

    pub fn postponed_count(&self) -> usize {
        self.state.lock().postponed.len()
    }

    fn queue_name(execution_id: &str) -> String {
        format!("execute-{}-q", execution_id)
    }

    fn scope_ref(&self, execution_id: &str) -> ElementRef {
        ElementRef::new(self.id.clone(), self.element_type.clone()).with_execution_id(execution_id)
    }

    /// Parent chain handed to children
    fn child_parent(&self) -> Option<ParentChain> {
        let state = self.state.lock();
        let execution_id = state.execution_id.as_deref()?;
        Some(unshift_parent(
            &self.scope_ref(execution_id),
            state.root.as_ref().and_then(|r| r.parent.as_ref()),
        ))
    }

    /// Start the scope with its root `execute.start` message
    pub fn execute(&self, message: &Message) -> Result<()> {
        let execution_id = message
            .content
            .execution_id
            .clone()
            .ok_or_else(|| FlowError::MissingExecutionId(self.id.clone()))?;

        {
            let mut state = self.state.lock();
            if state.fatal {
                return Err(FlowError::Fatal(self.id.clone()));
            }
            if state.consumer_tag.is_some() {
                return Err(FlowError::AlreadyRunning(self.id.clone()));
            }
            let mut root = message.content.clone();
            root.is_root_scope = true;
            state.execution_id = Some(execution_id.clone());
            state.root = Some(root);
            state.status = ExecutionStatus::Start;
            state.completed = false;
            state.stopped = false;
            state.postponed.clear();
            state.tracker.clear();
        }

        if self.children.is_empty() {
            debug!(scope_id = %self.id, %execution_id, "No children, completing");
            self.complete(keys::EXECUTE_COMPLETED, None);
            return Ok(());
        }

        let executable: Vec<Arc<dyn Element>> =
            self.children.iter().filter(|c| c.is_start()).cloned().collect();
        if executable.is_empty() {
            self.raise_fatal(&execution_id);
            return Ok(());
        }

        let queue = Self::queue_name(&execution_id);
        self.broker.assert_queue(&queue, QueueOptions::durable());
        let root = self.root_content();
        self.broker.queue_message(&queue, keys::EXECUTE_START, root, Properties::new())?;

        self.state.lock().status = ExecutionStatus::Executing;
        self.subscribe(&execution_id);
        self.consume(&queue)?;

        info!(
            scope_id = %self.id,
            %execution_id,
            children = executable.len(),
            "Scope executing"
        );

        // every init is postponed before the first child can leave
        let parent = self.child_parent();
        for child in &executable {
            child.init(parent.as_ref());
        }
        for child in &executable {
            if !self.is_running() {
                break;
            }
            let input = Content::default().with_parent(parent.clone());
            if let Err(err) = child.run(input) {
                warn!(scope_id = %self.id, child_id = %child.id(), error = %err, "Child did not start");
            }
        }
        Ok(())
    }

    /// Continue a stopped or recovered run
    pub fn resume(&self) -> Result<()> {
        let execution_id = {
            let mut state = self.state.lock();
            if state.completed || state.fatal || state.consumer_tag.is_some() {
                return Ok(());
            }
            let Some(execution_id) = state.execution_id.clone() else {
                return Err(FlowError::not_running(self.id.clone()));
            };
            state.status = ExecutionStatus::Executing;
            state.stopped = false;
            state.postponed.clear();
            state.tracker.clear();
            execution_id
        };

        let queue = Self::queue_name(&execution_id);
        if !self.broker.has_queue(&queue) {
            return Err(FlowError::not_running(self.id.clone()));
        }

        debug!(scope_id = %self.id, %execution_id, "Resuming scope");
        self.subscribe(&execution_id);
        self.consume(&queue)?;

        if self.is_completed() {
            return Ok(());
        }
        if self.postponed_count() == 0 {
            self.complete(keys::EXECUTE_COMPLETED, None);
            return Ok(());
        }

        for child in &self.children {
            child.resume()?;
        }
        Ok(())
    }

    /// Stop the run; children are stopped and `execution.stopped` is published
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.completed || state.stopped || state.consumer_tag.is_none() {
                return;
            }
            state.stopped = true;
            state.status = ExecutionStatus::Stopped;
        }
        self.deactivate();

        for child in &self.children {
            if child.is_running() {
                child.stop();
            }
        }

        info!(scope_id = %self.id, "Scope stopped");
        let content = self.root_content();
        self.broker.publish(
            exchanges::EXECUTION,
            keys::EXECUTION_STOPPED,
            content,
            Properties::new(),
        );
    }

    /// Discard the run and every running child
    pub fn discard(&self) {
        if !self.finish(ExecutionStatus::Terminated) {
            return;
        }
        for child in &self.children {
            if child.is_running() {
                child.discard();
            }
        }
        info!(scope_id = %self.id, "Scope discarded");
        self.publish_terminal(keys::EXECUTE_DISCARD, None);
    }

    fn root_content(&self) -> Content {
        let state = self.state.lock();
        match &state.root {
            Some(root) => root.clone(),
            None => {
                let mut content = Content::new(self.id.clone(), self.element_type.clone());
                content.execution_id = state.execution_id.clone();
                content.is_root_scope = true;
                content
            }
        }
    }

    fn raise_fatal(&self, execution_id: &str) {
        {
            let mut state = self.state.lock();
            state.fatal = true;
            state.status = ExecutionStatus::Init;
        }
        self.deactivate();
        warn!(scope_id = %self.id, %execution_id, "No executable children");
        let content = self.root_content().with_error(ExecutionError::fatal(
            self.id.clone(),
            format!("{} has no executable elements", self.id),
        ));
        self.broker.publish(
            exchanges::EXECUTION,
            keys::EXECUTION_FATAL,
            content,
            Properties::new(),
        );
    }

    fn subscribe(&self, execution_id: &str) {
        let queue = Self::queue_name(execution_id);
        let pattern = format!("{}.#", self.kind.child_prefix());
        let priority = self.environment.config.child_priority;

        let mut child_tags = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let own = self.broker.clone();
            let queue = queue.clone();
            let handler: Handler = Arc::new(move |message: &Message| {
                if let Err(err) = own.queue_message(
                    &queue,
                    message.routing_key(),
                    message.content.clone(),
                    message.properties.clone(),
                ) {
                    warn!(error = %err, "Child event dropped");
                }
            });
            let child_broker = child.broker();
            let tag = child_broker.subscribe_tmp(
                exchanges::EVENT,
                &pattern,
                handler,
                SubscribeOptions::default()
                    .with_priority(priority)
                    .with_consumer_tag(format!("_{}-child-{}", self.kind.prefix(), execution_id)),
            );
            child_tags.push((child_broker, tag));
        }

        let me = self.me.clone();
        let api_handler: Handler = Arc::new(move |message: &Message| {
            if let Some(execution) = me.upgrade() {
                execution.on_api_message(message);
            }
        });
        let api_tag = self.broker.subscribe_tmp(
            exchanges::API,
            "#",
            api_handler,
            SubscribeOptions::default()
                .with_consumer_tag(format!("_{}-api-{}", self.kind.prefix(), execution_id)),
        );

        let mut state = self.state.lock();
        state.child_tags = child_tags;
        state.api_tag = Some(api_tag);
    }

    fn consume(&self, queue: &str) -> Result<()> {
        let me = self.me.clone();
        let handler: Handler = Arc::new(move |message: &Message| {
            if let Some(execution) = me.upgrade() {
                execution.on_message(message);
            }
        });
        let execution_id = self.execution_id().unwrap_or_default();
        let tag = self.broker.consume(
            queue,
            handler,
            ConsumeOptions {
                consumer_tag: Some(format!("_{}-execution-{}", self.kind.prefix(), execution_id)),
                no_ack: false,
            },
        )?;

        let mut state = self.state.lock();
        if state.completed || state.stopped {
            drop(state);
            self.broker.cancel(&tag);
        } else {
            state.consumer_tag = Some(tag);
        }
        Ok(())
    }

    /// Cancel every subscription; unacknowledged events stay queued
    fn deactivate(&self) {
        let (consumer_tag, child_tags, api_tag) = {
            let mut state = self.state.lock();
            (
                state.consumer_tag.take(),
                std::mem::take(&mut state.child_tags),
                state.api_tag.take(),
            )
        };
        if let Some(tag) = consumer_tag {
            self.broker.cancel(&tag);
        }
        for (broker, tag) in child_tags {
            broker.cancel(&tag);
        }
        if let Some(tag) = api_tag {
            self.broker.cancel(&tag);
        }
    }

    /// Mark the run terminal. Returns false if it already was.
    fn finish(&self, status: ExecutionStatus) -> bool {
        let execution_id = {
            let mut state = self.state.lock();
            if state.completed || state.stopped || state.fatal {
                return false;
            }
            state.completed = true;
            state.status = status;
            state.postponed.clear();
            state.tracker.clear();
            state.execution_id.clone()
        };
        self.deactivate();
        if let Some(execution_id) = execution_id {
            self.broker.delete_queue(&Self::queue_name(&execution_id));
        }
        true
    }

    fn publish_terminal(&self, routing_key: &str, error: Option<ExecutionError>) {
        let mut content = self.root_content();
        content.error = error;
        self.broker
            .publish(exchanges::EXECUTION, routing_key, content, Properties::new());
    }

    fn complete(&self, routing_key: &str, error: Option<ExecutionError>) {
        let status = match routing_key {
            keys::EXECUTE_ERROR => ExecutionStatus::Error,
            keys::EXECUTE_DISCARD => ExecutionStatus::Terminated,
            _ => ExecutionStatus::Completed,
        };
        if !self.finish(status) {
            return;
        }
        info!(scope_id = %self.id, %status, "Scope finished");
        self.publish_terminal(routing_key, error);
    }

    fn on_message(&self, message: &Message) {
        let terminal = {
            let state = self.state.lock();
            state.completed || state.stopped
        };
        if terminal {
            self.broker.ack(message);
            return;
        }

        let routing_key = message.routing_key();
        if routing_key == keys::EXECUTE_START {
            // the root start stays pending until the run finishes
            if message.content.is_root_scope {
                let mut state = self.state.lock();
                if state.root.is_none() || message.is_redelivered() {
                    state.root = Some(message.content.clone());
                }
            }
            return;
        }

        let child_id = message.content.id.clone();
        let evicted = {
            let mut state = self.state.lock();
            state.tracker.track(routing_key, &message.content);
            state
                .postponed
                .iter()
                .position(|m| m.content.id == child_id)
                .map(|pos| state.postponed.remove(pos))
        };
        if let Some(previous) = evicted {
            if previous.fields.delivery_tag != message.fields.delivery_tag {
                self.broker.ack(&previous);
            }
        }

        match message.action() {
            "leave" => {
                self.broker.ack(message);
                self.on_child_leave(message);
            }
            "error" => {
                self.broker.ack(message);
                self.on_child_error(message);
            }
            _ => {
                self.state.lock().postponed.push(message.clone());
            }
        }
    }

    fn on_child_leave(&self, message: &Message) {
        let parent = self.child_parent();
        for flow in &message.content.outbound {
            let Some(target) = self.get_child(&flow.target) else {
                warn!(scope_id = %self.id, target = %flow.target, "Outbound target not found");
                continue;
            };
            if target.is_running() {
                debug!(target = %flow.target, "Outbound target already running");
                continue;
            }

            let mut input = Content::default().with_parent(parent.clone());
            input.inbound = vec![message.content.element_ref()];
            match flow.action {
                FlowAction::Take => {}
                FlowAction::Discard => {
                    if message.content.discard_sequence.contains(&flow.target) {
                        debug!(target = %flow.target, "Discard loop, not relayed");
                        continue;
                    }
                    input.discard = true;
                    input.discard_sequence = message.content.discard_sequence.clone();
                }
            }

            target.init(parent.as_ref());
            if let Err(err) = target.run(input) {
                warn!(target = %flow.target, error = %err, "Outbound target did not run");
            }
        }

        if self.postponed_count() == 0 {
            self.complete(keys::EXECUTE_COMPLETED, None);
        }
    }

    fn on_child_error(&self, message: &Message) {
        let source_id = message.content.id.clone();
        if !self.finish(ExecutionStatus::Error) {
            return;
        }

        warn!(
            scope_id = %self.id,
            child_id = %source_id,
            error = ?message.content.error,
            "Child failed, stopping siblings"
        );
        for child in &self.children {
            if child.id() != source_id && child.is_running() {
                child.stop();
            }
        }

        let error = message
            .content
            .error
            .clone()
            .unwrap_or_else(|| ExecutionError::new(source_id, "child failed"));
        self.publish_terminal(keys::EXECUTE_ERROR, Some(error));
    }

    fn on_api_message(&self, message: &Message) {
        if message.properties.delegate {
            self.on_delegated(message);
            return;
        }

        let Some(execution_id) = self.execution_id() else {
            return;
        };
        if !message.routing_key().ends_with(&format!(".{}", execution_id)) {
            return;
        }
        match message.properties.message_type.as_deref() {
            Some(actions::STOP) => self.stop(),
            Some(actions::DISCARD) | Some(actions::CANCEL) => self.discard(),
            _ => {}
        }
    }

    /// Broadcast to every child and start idle children waiting for this message
    fn on_delegated(&self, message: &Message) {
        for child in &self.children {
            child.broker().publish(
                exchanges::API,
                message.routing_key(),
                message.content.clone(),
                message.properties.clone(),
            );
        }

        if message.properties.message_type.as_deref() != Some(actions::SIGNAL) {
            return;
        }
        let Some(reference) = message.content.message_id().map(str::to_string) else {
            return;
        };
        let parent = self.child_parent();
        for child in &self.children {
            if child.is_running() || !child.start_references().iter().any(|r| r == &reference) {
                continue;
            }
            debug!(child_id = %child.id(), %reference, "Starting child by reference");
            let mut input = Content::default().with_parent(parent.clone());
            input.message = message.content.message.clone();
            child.init(parent.as_ref());
            if let Err(err) = child.run(input) {
                warn!(child_id = %child.id(), error = %err, "Child did not start");
            }
        }
    }

    /// Api for this run or for the nested instance `message` describes
    pub fn get_api(&self, message: Option<&Message>) -> Result<Api> {
        let owner: Arc<dyn ApiOwner> = self
            .me
            .upgrade()
            .ok_or_else(|| FlowError::not_running(self.id.clone()))?;
        let execution_id = self.execution_id();

        let Some(message) = message else {
            let root = Message::new(keys::EXECUTE_START, self.root_content());
            return Api::new(owner, Some(&root), Some(self.environment.clone()));
        };

        if execution_id.is_some() && message.content.execution_id == execution_id {
            return Api::new(owner, Some(message), Some(self.environment.clone()));
        }

        let content = &message.content;
        let candidates = std::iter::once(content.id.as_str()).chain(
            content
                .parent
                .iter()
                .flat_map(|p| p.iter().map(|r| r.id.as_str())),
        );
        for candidate in candidates {
            if let Some(child) = self.get_child(candidate) {
                if child.is_running() {
                    return child.get_api(Some(message));
                }
            }
        }
        Err(FlowError::unknown_element(content.id.clone()))
    }

    pub fn get_state(&self) -> ExecutionState {
        let state = self.state.lock();
        ExecutionState {
            execution_id: state.execution_id.clone(),
            stopped: state.stopped,
            completed: state.completed,
            status: state.status,
            children: self.children.iter().map(|c| c.get_state()).collect(),
        }
    }

    /// Restore bookkeeping and children; call [`resume`](Self::resume) to continue
    pub fn recover(&self, snapshot: &ExecutionState) -> Result<()> {
        if self.is_running() {
            return Err(FlowError::AlreadyRunning(self.id.clone()));
        }
        for child_state in &snapshot.children {
            match self.get_child(&child_state.id) {
                Some(child) => child.recover(child_state)?,
                None => return Err(FlowError::unknown_element(child_state.id.clone())),
            }
        }

        let mut state = self.state.lock();
        state.execution_id = snapshot.execution_id.clone();
        state.status = snapshot.status;
        state.completed = snapshot.completed;
        state.stopped = snapshot.stopped;
        state.fatal = false;
        state.root = None;
        state.postponed.clear();
        state.tracker.clear();
        Ok(())
    }
}

impl ApiOwner for ScopeExecution {
    fn broker(&self) -> Broker {
        self.broker.clone()
    }

    fn api_prefix(&self) -> &str {
        self.kind.prefix()
    }

    fn postponed(&self) -> Option<Vec<Api>> {
        let postponed = self.postponed_messages();
        Some(
            postponed
                .iter()
                .flat_map(|m| {
                    let Some(child) = self.get_child(&m.content.id) else {
                        return Vec::new();
                    };
                    let nested = child.get_postponed();
                    if !nested.is_empty() {
                        return nested;
                    }
                    child.get_api(Some(m)).into_iter().collect()
                })
                .collect(),
        )
    }
}
