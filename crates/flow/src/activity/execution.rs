//! Per-activity execution coordinator
//!
//! Owns the durable `execute-<executionId>-q` queue on the activity broker.
//! Every `execute.start` stays unacknowledged until its execution finishes,
//! so a snapshot taken mid-run carries exactly the starts that must be
//! redelivered on resume.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::Activity;
use crate::api::{actions, Api, ApiOwner};
use crate::behaviour::{Behaviour, ExecutionScope};
use crate::broker::{
    exchanges, keys, Broker, ConsumeOptions, Handler, Message, Properties, QueueOptions,
};
use crate::error::{ExecutionError, Result};
use crate::snapshot::{ExecutionState, ExecutionStatus};

struct ExecutionInner {
    status: ExecutionStatus,
    completed: bool,
    stopped: bool,
    postponed: Vec<Message>,
    consumer_tag: Option<String>,
}

/// Drives one run of an activity through its behaviour
pub struct ActivityExecution {
    execution_id: String,
    activity: Weak<Activity>,
    scope: ExecutionScope,
    behaviour: Arc<dyn Behaviour>,
    state: Mutex<ExecutionInner>,
    me: Weak<ActivityExecution>,
}

impl ActivityExecution {
    pub(crate) fn new(
        activity: Weak<Activity>,
        scope: ExecutionScope,
        behaviour: Arc<dyn Behaviour>,
    ) -> Arc<Self> {
        let execution_id = scope.execution_id().to_string();
        Arc::new_cyclic(|me| Self {
            execution_id,
            activity,
            scope,
            behaviour,
            state: Mutex::new(ExecutionInner {
                status: ExecutionStatus::Init,
                completed: false,
                stopped: false,
                postponed: Vec::new(),
                consumer_tag: None,
            }),
            me: me.clone(),
        })
    }

    pub(crate) fn recovered(
        activity: Weak<Activity>,
        scope: ExecutionScope,
        behaviour: Arc<dyn Behaviour>,
        state: &ExecutionState,
    ) -> Arc<Self> {
        let execution = Self::new(activity, scope, behaviour);
        {
            let mut inner = execution.state.lock();
            inner.status = state.status;
            inner.completed = state.completed;
            inner.stopped = state.stopped;
        }
        execution
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    fn queue_name(&self) -> String {
        format!("execute-{}-q", self.execution_id)
    }

    fn broker(&self) -> &Broker {
        self.scope.broker()
    }

    /// Start the run with the root `execute.start` message
    pub fn execute(&self, root: Message) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.status = ExecutionStatus::Executing;
            state.stopped = false;
        }
        self.activate()?;
        if !root.is_redelivered() {
            self.broker().publish(
                exchanges::EXECUTION,
                keys::EXECUTE_START,
                root.content,
                Properties::new(),
            );
        }
        Ok(())
    }

    /// Re-attach to the execution queue; unacknowledged starts are redelivered
    pub fn resume(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.completed || state.consumer_tag.is_some() {
                return Ok(());
            }
            state.status = ExecutionStatus::Executing;
            state.stopped = false;
        }
        debug!(execution_id = %self.execution_id, "Resuming activity execution");
        self.activate()
    }

    fn activate(&self) -> Result<()> {
        let queue = self.queue_name();
        self.broker().assert_queue(&queue, QueueOptions::durable());
        self.broker().bind_queue(
            &queue,
            exchanges::EXECUTION,
            "execute.#",
            self.scope.config().execution_priority,
        )?;

        let me = self.me.clone();
        let handler: Handler = Arc::new(move |message: &Message| {
            if let Some(execution) = me.upgrade() {
                execution.on_message(message);
            }
        });
        let tag = self.broker().consume(
            &queue,
            handler,
            ConsumeOptions {
                consumer_tag: Some(format!("_activity-execution-{}", self.execution_id)),
                no_ack: false,
            },
        );
        match tag {
            Ok(tag) => {
                let mut state = self.state.lock();
                // consume may have completed us synchronously
                if state.completed {
                    drop(state);
                    self.broker().cancel(&tag);
                } else {
                    state.consumer_tag = Some(tag);
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stop without completing. Unacknowledged starts stay queued for resume.
    pub fn stop(&self) {
        let (tag, sub_executions) = {
            let mut state = self.state.lock();
            if state.completed || state.stopped {
                return;
            }
            state.stopped = true;
            state.status = ExecutionStatus::Stopped;
            let subs: Vec<String> = state
                .postponed
                .drain(..)
                .filter_map(|m| m.content.execution_id)
                .filter(|id| id != &self.execution_id)
                .collect();
            (state.consumer_tag.take(), subs)
        };
        if let Some(tag) = tag {
            self.broker().cancel(&tag);
        }
        self.release(std::iter::once(self.execution_id.clone()).chain(sub_executions));
    }

    /// Discard the run from outside
    pub fn discard(&self) {
        if self.is_completed() {
            return;
        }
        let content = self
            .activity
            .upgrade()
            .and_then(|a| a.run_content())
            .map(|mut c| {
                c.is_root_scope = true;
                c
            });
        match content {
            Some(content) => self.scope.publish_execution(keys::EXECUTE_DISCARD, content),
            None => warn!(execution_id = %self.execution_id, "Discard without run content"),
        }
    }

    fn on_message(&self, message: &Message) {
        if self.is_completed() {
            self.broker().ack(message);
            return;
        }

        match message.routing_key() {
            keys::EXECUTE_START => self.on_start(message),
            keys::EXECUTE_COMPLETED | keys::EXECUTE_DISCARD | keys::EXECUTE_ERROR => {
                self.on_finished(message)
            }
            _ => self.broker().ack(message),
        }
    }

    fn on_start(&self, message: &Message) {
        let is_root = message.content.is_root_scope
            && message.execution_id() == Some(self.execution_id.as_str());

        let evicted = {
            let mut state = self.state.lock();
            let evicted = state
                .postponed
                .iter()
                .position(|m| m.content.execution_id == message.content.execution_id)
                .map(|pos| state.postponed.remove(pos));
            state.postponed.push(message.clone());
            evicted
        };
        if let Some(previous) = evicted {
            if previous.fields.delivery_tag != message.fields.delivery_tag {
                self.broker().ack(&previous);
            }
        }

        // fresh sub-execution starts belong to whoever published them
        if !is_root && !message.is_redelivered() {
            return;
        }

        if let Err(err) = self.behaviour.execute(&self.scope, message) {
            if !self.is_completed() {
                warn!(
                    execution_id = %self.execution_id,
                    error = %err,
                    "Behaviour failed"
                );
                self.scope.fail(
                    message,
                    ExecutionError::wrap(self.scope.activity().id.clone(), &err),
                );
            }
        }
    }

    fn on_finished(&self, message: &Message) {
        let routing_key = message.routing_key();
        let finishes_run = message.execution_id() == Some(self.execution_id.as_str())
            || routing_key == keys::EXECUTE_ERROR;

        let (to_ack, tag, sub_executions) = {
            let mut state = self.state.lock();
            let mut to_ack: Vec<Message> = Vec::new();
            if let Some(pos) = state
                .postponed
                .iter()
                .position(|m| m.content.execution_id == message.content.execution_id)
            {
                to_ack.push(state.postponed.remove(pos));
            }
            to_ack.push(message.clone());

            let mut tag = None;
            let mut subs = Vec::new();
            if finishes_run {
                state.completed = true;
                state.status = match routing_key {
                    keys::EXECUTE_COMPLETED => ExecutionStatus::Completed,
                    keys::EXECUTE_ERROR => ExecutionStatus::Error,
                    _ => ExecutionStatus::Terminated,
                };
                for pending in state.postponed.drain(..) {
                    if let Some(id) = pending.content.execution_id.clone() {
                        if id != self.execution_id {
                            subs.push(id);
                        }
                    }
                    to_ack.push(pending);
                }
                tag = state.consumer_tag.take();
            }
            (to_ack, tag, subs)
        };

        for acked in &to_ack {
            self.broker().ack(acked);
        }
        if !finishes_run {
            return;
        }

        if let Some(tag) = tag {
            self.broker().cancel(&tag);
        }
        self.broker().delete_queue(&self.queue_name());

        debug!(
            execution_id = %self.execution_id,
            routing_key,
            "Activity execution finished"
        );
        if let Some(activity) = self.activity.upgrade() {
            activity.on_execution_completed(routing_key, message);
        }

        // release listeners still waiting on the finished run
        self.release(std::iter::once(self.execution_id.clone()).chain(sub_executions));
    }

    fn release(&self, execution_ids: impl IntoIterator<Item = String>) {
        let content = self.scope.activity_content();
        for execution_id in execution_ids {
            self.broker().publish(
                exchanges::API,
                &format!("activity.{}.{}", actions::STOP, execution_id),
                content.clone().with_execution_id(execution_id.clone()),
                Properties::new().with_type(actions::STOP),
            );
        }
    }

    pub fn get_state(&self) -> ExecutionState {
        let state = self.state.lock();
        ExecutionState {
            execution_id: Some(self.execution_id.clone()),
            stopped: state.stopped,
            completed: state.completed,
            status: state.status,
            children: Vec::new(),
        }
    }
}

impl ApiOwner for ActivityExecution {
    fn broker(&self) -> Broker {
        self.scope.broker().clone()
    }

    fn api_prefix(&self) -> &str {
        "activity"
    }

    fn postponed(&self) -> Option<Vec<Api>> {
        let owner: Arc<dyn ApiOwner> = self.me.upgrade()?;
        let postponed: Vec<Message> = self
            .state
            .lock()
            .postponed
            .iter()
            .filter(|m| m.execution_id() != Some(self.execution_id.as_str()))
            .cloned()
            .collect();
        Some(
            postponed
                .iter()
                .filter_map(|m| {
                    Api::new(owner.clone(), Some(m), Some(self.scope.environment().clone())).ok()
                })
                .collect(),
        )
    }
}
