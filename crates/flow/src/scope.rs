//! Process and definition elements
//!
//! A [`Scope`] is the element wrapper around a [`ScopeExecution`]: it owns
//! the children, shovels their events into its own `event` exchange and turns
//! the coordinator's terminal messages into `process.*` / `definition.*`
//! lifecycle events.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::activity::Activity;
use crate::api::{actions, Api, ApiOptions, ApiOwner};
use crate::behaviour::BehaviourRegistry;
use crate::broker::{
    exchanges, keys, new_execution_id, Broker, Content, Handler, Message, Properties,
    SubscribeOptions,
};
use crate::chain::ParentChain;
use crate::element::Element;
use crate::error::{FlowError, Result};
use crate::execution::ScopeExecution;
use crate::expression::Environment;
use crate::model::{DefinitionDef, ProcessDef};
use crate::snapshot::{Counters, ElementState, ElementStatus, ExecutionState};
use crate::status::ActivityStatus;
use crate::telemetry;

/// Which level a scope coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Children are processes
    Definition,
    /// Children are activities
    Process,
}

impl ScopeKind {
    /// Routing key prefix of the scope's own events and api
    pub fn prefix(&self) -> &'static str {
        match self {
            ScopeKind::Definition => "definition",
            ScopeKind::Process => "process",
        }
    }

    /// Routing key prefix of child lifecycle events
    pub fn child_prefix(&self) -> &'static str {
        match self {
            ScopeKind::Definition => "process",
            ScopeKind::Process => "activity",
        }
    }
}

struct ScopeState {
    status: ElementStatus,
    execution_id: Option<String>,
    initialized: bool,
    parent: Option<ParentChain>,
    stopped: bool,
    counters: Counters,
    run_content: Option<Content>,
    execution: Option<Arc<ScopeExecution>>,
    execution_tag: Option<String>,
}

/// A process or a definition
pub struct Scope {
    kind: ScopeKind,
    id: String,
    element_type: String,
    executable: bool,
    broker: Broker,
    environment: Environment,
    children: Vec<Arc<dyn Element>>,
    /// Typed handles on nested processes, definitions only
    processes: Vec<Arc<Scope>>,
    state: Mutex<ScopeState>,
    me: Weak<Scope>,
}

impl Scope {
    fn build(
        kind: ScopeKind,
        id: String,
        element_type: String,
        executable: bool,
        environment: Environment,
        children: Vec<Arc<dyn Element>>,
        processes: Vec<Arc<Scope>>,
    ) -> Arc<Self> {
        let broker = Broker::new(id.clone());
        for child in &children {
            child.broker().shovel(
                &format!("{}-{}", id, child.id()),
                exchanges::EVENT,
                "#",
                &broker,
                exchanges::EVENT,
            );
        }

        Arc::new_cyclic(|me| Self {
            kind,
            id,
            element_type,
            executable,
            broker,
            environment,
            children,
            processes,
            state: Mutex::new(ScopeState {
                status: ElementStatus::Idle,
                execution_id: None,
                initialized: false,
                parent: None,
                stopped: false,
                counters: Counters::default(),
                run_content: None,
                execution: None,
                execution_tag: None,
            }),
            me: me.clone(),
        })
    }

    /// Process scope over arbitrary children
    pub fn new(
        id: impl Into<String>,
        element_type: impl Into<String>,
        environment: Environment,
        children: Vec<Arc<dyn Element>>,
    ) -> Arc<Self> {
        Self::build(
            ScopeKind::Process,
            id.into(),
            element_type.into(),
            true,
            environment,
            children,
            Vec::new(),
        )
    }

    /// Build a process and its activities
    pub fn process(
        def: &ProcessDef,
        registry: &BehaviourRegistry,
        environment: Environment,
    ) -> Result<Arc<Self>> {
        let children = def
            .elements
            .iter()
            .map(|element| {
                Activity::from_registry(element.clone(), registry, environment.clone())
                    .map(|a| a as Arc<dyn Element>)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::build(
            ScopeKind::Process,
            def.id.clone(),
            def.element_type.clone(),
            def.executable,
            environment,
            children,
            Vec::new(),
        ))
    }

    /// Build a definition and every process in it
    pub fn definition(
        def: &DefinitionDef,
        registry: &BehaviourRegistry,
        environment: Environment,
    ) -> Result<Arc<Self>> {
        let processes = def
            .processes
            .iter()
            .map(|p| Self::process(p, registry, environment.clone()))
            .collect::<Result<Vec<_>>>()?;
        let children = processes
            .iter()
            .map(|p| p.clone() as Arc<dyn Element>)
            .collect();

        Ok(Self::build(
            ScopeKind::Definition,
            def.id.clone(),
            def.element_type.clone(),
            true,
            environment,
            children,
            processes,
        ))
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
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

    pub fn execution(&self) -> Option<Arc<ScopeExecution>> {
        self.state.lock().execution.clone()
    }

    pub fn children(&self) -> &[Arc<dyn Element>] {
        &self.children
    }

    pub fn get_child(&self, id: &str) -> Option<&Arc<dyn Element>> {
        self.children.iter().find(|c| c.id() == id)
    }

    /// Nested process by id, definitions only
    pub fn get_process(&self, id: &str) -> Option<&Arc<Scope>> {
        self.processes.iter().find(|p| p.id == id)
    }

    pub fn processes(&self) -> &[Arc<Scope>] {
        &self.processes
    }

    /// Aggregated status of running activities
    pub fn activity_status(&self) -> ActivityStatus {
        match self.kind {
            ScopeKind::Process => self
                .execution()
                .map(|e| e.activity_status())
                .unwrap_or(ActivityStatus::Idle),
            ScopeKind::Definition => {
                let statuses: Vec<ActivityStatus> =
                    self.processes.iter().map(|p| p.activity_status()).collect();
                [
                    ActivityStatus::Executing,
                    ActivityStatus::Timer,
                    ActivityStatus::Wait,
                ]
                .into_iter()
                .find(|s| statuses.contains(s))
                .unwrap_or(ActivityStatus::Idle)
            }
        }
    }

    /// Send a signal to every element in the scope
    pub fn signal(&self, payload: Value) -> Result<String> {
        let api = self.get_api(None)?;
        Ok(api.send_api_message(actions::SIGNAL, Some(payload), ApiOptions::delegated()))
    }

    /// Apis for every in-flight descendant
    pub fn get_postponed(&self) -> Vec<Api> {
        self.execution()
            .and_then(|e| e.postponed())
            .unwrap_or_default()
    }

    fn publish_event(&self, action: &str, content: Content) {
        self.broker.publish(
            exchanges::EVENT,
            &format!("{}.{}", self.kind.prefix(), action),
            content,
            Properties::new(),
        );
    }

    fn subscribe_execution(&self, execution_id: &str) {
        let me = self.me.clone();
        let own_id = execution_id.to_string();
        let handler: Handler = Arc::new(move |message: &Message| {
            if message.execution_id() != Some(own_id.as_str()) {
                return;
            }
            if let Some(scope) = me.upgrade() {
                scope.on_execution_message(message);
            }
        });
        let tag = self.broker.subscribe_tmp(
            exchanges::EXECUTION,
            "#",
            handler,
            SubscribeOptions::default()
                .with_consumer_tag(format!("_{}-scope-{}", self.kind.prefix(), execution_id)),
        );
        self.state.lock().execution_tag = Some(tag);
    }

    fn on_execution_message(&self, message: &Message) {
        let routing_key = message.routing_key();
        let (content, leaving, tag) = {
            let mut state = self.state.lock();
            let mut content = state
                .run_content
                .clone()
                .unwrap_or_else(|| message.content.clone());
            content.is_root_scope = false;
            content.output = message.content.output.clone();
            content.error = message.content.error.clone();

            let leaving = match routing_key {
                keys::EXECUTE_COMPLETED => {
                    state.counters.taken += 1;
                    true
                }
                keys::EXECUTE_DISCARD => {
                    state.counters.discarded += 1;
                    true
                }
                keys::EXECUTE_ERROR | keys::EXECUTION_FATAL => true,
                keys::EXECUTION_STOPPED => {
                    state.status = ElementStatus::Stopped;
                    state.stopped = true;
                    false
                }
                _ => return,
            };
            let tag = if leaving {
                state.status = ElementStatus::Idle;
                state.execution_tag.take()
            } else {
                None
            };
            (content, leaving, tag)
        };
        if let Some(tag) = tag {
            self.broker.cancel(&tag);
        }

        match routing_key {
            keys::EXECUTE_COMPLETED => {
                info!(scope_id = %self.id, "Scope completed");
                self.publish_event("end", content.clone());
            }
            keys::EXECUTE_DISCARD => self.publish_event("discard", content.clone()),
            keys::EXECUTE_ERROR | keys::EXECUTION_FATAL => {
                warn!(scope_id = %self.id, error = ?content.error, "Scope failed");
                self.publish_event("error", content.clone());
            }
            _ => {
                self.publish_event("stop", content.clone());
            }
        }
        // a fatal run never leaves, it was never entered by a child
        if leaving && routing_key != keys::EXECUTION_FATAL {
            self.publish_event("leave", content);
        }
    }

    /// Locate the root start of a recovered run in the coordinator queue
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
            .find(|m| m.content.is_root_scope && m.routing_key() == keys::EXECUTE_START)
            .map(|m| m.content.clone())
    }
}

impl ApiOwner for Scope {
    fn broker(&self) -> Broker {
        self.broker.clone()
    }

    fn api_prefix(&self) -> &str {
        self.kind.prefix()
    }

    fn nested(&self) -> Option<Arc<dyn ApiOwner>> {
        self.execution().map(|e| e as Arc<dyn ApiOwner>)
    }
}

impl Element for Scope {
    fn id(&self) -> &str {
        &self.id
    }

    fn element_type(&self) -> &str {
        &self.element_type
    }

    fn is_start(&self) -> bool {
        self.executable
    }

    fn start_references(&self) -> &[String] {
        &[]
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
            let execution_id = new_execution_id(&self.id);
            state.execution_id = Some(execution_id.clone());
            state.initialized = true;
            state.parent = parent.cloned();
            execution_id
        };
        let content = Content::new(self.id.clone(), self.element_type.clone())
            .with_execution_id(execution_id)
            .with_parent(parent.cloned());
        self.publish_event("init", content);
    }

    fn run(&self, input: Content) -> Result<()> {
        let content = {
            let mut state = self.state.lock();
            if state.status == ElementStatus::Running {
                return Err(FlowError::AlreadyRunning(self.id.clone()));
            }
            let execution_id = match (state.initialized, state.execution_id.clone()) {
                (true, Some(id)) => id,
                _ => new_execution_id(&self.id),
            };
            let parent = input.parent.clone().or_else(|| state.parent.clone());
            let mut content = Content::new(self.id.clone(), self.element_type.clone())
                .with_execution_id(execution_id.clone())
                .with_parent(parent.clone());
            content.inbound = input.inbound;
            content.message = input.message;

            state.status = ElementStatus::Running;
            state.execution_id = Some(execution_id);
            state.initialized = false;
            state.parent = parent;
            state.stopped = false;
            state.run_content = Some(content.clone());
            content
        };
        let execution_id = content.execution_id.clone().unwrap_or_default();

        let execution = ScopeExecution::new(
            self.kind,
            self.id.clone(),
            self.element_type.clone(),
            self.broker.clone(),
            self.environment.clone(),
            self.children.clone(),
        );
        self.state.lock().execution = Some(execution.clone());
        self.subscribe_execution(&execution_id);

        let _span = telemetry::scope_span(self.kind, &self.id, &execution_id).entered();
        debug!(scope_id = %self.id, %execution_id, "Running scope");
        self.publish_event("enter", content.clone());
        self.publish_event("start", content.clone());

        let mut root = content;
        root.is_root_scope = true;
        execution.execute(&Message::new(keys::EXECUTE_START, root))
    }

    fn stop(&self) {
        if !self.is_running() {
            return;
        }
        if let Some(execution) = self.execution() {
            execution.stop();
        }
    }

    fn discard(&self) {
        if !self.is_running() {
            return;
        }
        if let Some(execution) = self.execution() {
            execution.discard();
        }
    }

    fn resume(&self) -> Result<()> {
        let (execution, execution_id, needs_subscription) = {
            let mut state = self.state.lock();
            let resumable = match state.status {
                ElementStatus::Stopped => true,
                ElementStatus::Running => state
                    .execution
                    .as_ref()
                    .map(|e| !e.is_running())
                    .unwrap_or(false),
                ElementStatus::Idle => false,
            };
            if !resumable {
                return Ok(());
            }
            state.status = ElementStatus::Running;
            state.stopped = false;
            (
                state.execution.clone(),
                state.execution_id.clone(),
                state.execution_tag.is_none(),
            )
        };
        let (Some(execution), Some(execution_id)) = (execution, execution_id) else {
            return Err(FlowError::not_running(self.id.clone()));
        };
        if needs_subscription {
            self.subscribe_execution(&execution_id);
        }
        let _span = telemetry::scope_span(self.kind, &self.id, &execution_id).entered();
        info!(scope_id = %self.id, %execution_id, "Resuming scope");
        execution.resume()
    }

    fn get_api(&self, message: Option<&Message>) -> Result<Api> {
        if let Some(execution) = self.execution() {
            return execution.get_api(message);
        }
        let owner: Arc<dyn ApiOwner> = self
            .me
            .upgrade()
            .ok_or_else(|| FlowError::not_running(self.id.clone()))?;
        let fallback = {
            let state = self.state.lock();
            let mut content = Content::new(self.id.clone(), self.element_type.clone());
            content.execution_id = state.execution_id.clone();
            Message::new(keys::EXECUTE_START, content)
        };
        Api::new(
            owner,
            Some(message.unwrap_or(&fallback)),
            Some(self.environment.clone()),
        )
    }

    fn get_postponed(&self) -> Vec<Api> {
        Scope::get_postponed(self)
    }

    fn get_state(&self) -> ElementState {
        let state = self.state.lock();
        let execution = match &state.execution {
            Some(execution) => execution.get_state(),
            None => ExecutionState {
                children: self.children.iter().map(|c| c.get_state()).collect(),
                ..Default::default()
            },
        };
        ElementState {
            id: self.id.clone(),
            element_type: self.element_type.clone(),
            status: state.status,
            execution_id: state.execution_id.clone(),
            stopped: state.stopped,
            counters: state.counters,
            broker: Some(self.broker.get_state()),
            execution: Some(execution),
        }
    }

    fn recover(&self, snapshot: &ElementState) -> Result<()> {
        if self.is_running() {
            return Err(FlowError::AlreadyRunning(self.id.clone()));
        }
        if let Some(broker) = &snapshot.broker {
            self.broker.recover(broker);
        }

        let root = snapshot
            .execution_id
            .as_deref()
            .and_then(|id| Self::recovered_root(snapshot, id));

        let execution = ScopeExecution::new(
            self.kind,
            self.id.clone(),
            self.element_type.clone(),
            self.broker.clone(),
            self.environment.clone(),
            self.children.clone(),
        );
        if let Some(exec_state) = &snapshot.execution {
            execution.recover(exec_state)?;
        }

        {
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
            state.execution = Some(execution);
            state.execution_tag = None;
        }

        if snapshot.status != ElementStatus::Idle {
            if let Some(execution_id) = &snapshot.execution_id {
                self.subscribe_execution(execution_id);
            }
        }
        debug!(scope_id = %self.id, "Scope recovered");
        Ok(())
    }
}
