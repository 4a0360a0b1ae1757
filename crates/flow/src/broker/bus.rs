//! In-process topic broker
//!
//! Delivery is synchronous: `publish` routes the message into every bound
//! queue and invokes the queue consumers before it returns. Consumers may
//! publish again from inside a handler; nested deliveries run to completion
//! before the outer publish moves on to the next queue.
//!
//! The broker lock is never held while a handler runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::message::{Content, Fields, Message, Properties};
use super::topic;
use crate::error::BrokerError;

/// Message handler invoked for each delivery
pub type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Options for durable queues
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Durable queues are included in snapshots
    pub durable: bool,
    /// Auto-delete queues are removed when their consumer is cancelled
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Options for consumers
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: Option<String>,
    /// Messages are removed on delivery instead of waiting for an ack
    pub no_ack: bool,
}

/// Options for temporary subscriptions
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub consumer_tag: Option<String>,
    /// Higher priority subscriptions receive a message first
    pub priority: i32,
    pub no_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            consumer_tag: None,
            priority: 0,
            no_ack: true,
        }
    }
}

impl SubscribeOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }
}

/// Persisted queue binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingState {
    pub exchange: String,
    pub pattern: String,
    #[serde(default)]
    pub priority: i32,
}

/// Persisted durable queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub name: String,
    #[serde(default)]
    pub bindings: Vec<BindingState>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Snapshot of every durable queue in a broker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerState {
    pub queues: Vec<QueueState>,
}

/// Queue metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: usize,
    pub pending_count: usize,
    pub has_consumer: bool,
}

struct Binding {
    queue: String,
    pattern: String,
    priority: i32,
}

struct Envelope {
    message: Message,
    pending: bool,
}

struct Consumer {
    tag: String,
    handler: Handler,
    no_ack: bool,
}

struct Queue {
    durable: bool,
    auto_delete: bool,
    messages: VecDeque<Envelope>,
    consumer: Option<Consumer>,
}

impl Queue {
    fn new(options: &QueueOptions) -> Self {
        Self {
            durable: options.durable,
            auto_delete: options.auto_delete,
            messages: VecDeque::new(),
            consumer: None,
        }
    }

    /// Return delivered but unacknowledged messages to the queue
    fn requeue_pending(&mut self) {
        for envelope in self.messages.iter_mut().filter(|e| e.pending) {
            envelope.pending = false;
            envelope.message.fields.redelivered = true;
        }
    }
}

#[derive(Default)]
struct BrokerInner {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Queue>,
    consumers: HashMap<String, String>,
    next_delivery_tag: u64,
    next_seq: u64,
}

impl BrokerInner {
    fn delivery_tag(&mut self) -> u64 {
        self.next_delivery_tag += 1;
        self.next_delivery_tag
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn bind(&mut self, queue: &str, exchange: &str, pattern: &str, priority: i32) {
        let bindings = self.exchanges.entry(exchange.to_string()).or_default();
        if bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern)
        {
            return;
        }
        // stable: equal priorities keep bind order
        let pos = bindings
            .iter()
            .position(|b| b.priority < priority)
            .unwrap_or(bindings.len());
        bindings.insert(
            pos,
            Binding {
                queue: queue.to_string(),
                pattern: pattern.to_string(),
                priority,
            },
        );
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.remove(name) {
            if let Some(consumer) = queue.consumer {
                self.consumers.remove(&consumer.tag);
            }
        }
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|b| b.queue != name);
        }
    }

    fn enqueue(&mut self, queue: &str, mut message: Message) -> bool {
        message.fields.delivery_tag = self.delivery_tag();
        match self.queues.get_mut(queue) {
            Some(q) => {
                q.messages.push_back(Envelope {
                    message,
                    pending: false,
                });
                true
            }
            None => false,
        }
    }
}

/// Synchronous topic broker owned by one element
#[derive(Clone)]
pub struct Broker {
    owner: Arc<str>,
    inner: Arc<Mutex<BrokerInner>>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Broker")
            .field("owner", &self.owner)
            .field("exchanges", &inner.exchanges.len())
            .field("queues", &inner.queues.len())
            .finish()
    }
}

impl Broker {
    pub fn new(owner: impl Into<String>) -> Self {
        let owner: String = owner.into();
        Self {
            owner: owner.into(),
            inner: Arc::new(Mutex::new(BrokerInner::default())),
        }
    }

    /// Id of the element owning this broker
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Create a queue unless it already exists
    pub fn assert_queue(&self, name: &str, options: QueueOptions) {
        let mut inner = self.inner.lock();
        inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Queue::new(&options));
    }

    /// Bind a queue to an exchange pattern
    pub fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        priority: i32,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock();
        if !inner.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        inner.bind(queue, exchange, pattern, priority);
        Ok(())
    }

    /// Delete a queue, its bindings and its consumer
    pub fn delete_queue(&self, name: &str) {
        self.inner.lock().delete_queue(name);
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    pub fn get_queue(&self, name: &str) -> Option<QueueInfo> {
        let inner = self.inner.lock();
        inner.queues.get(name).map(|q| QueueInfo {
            name: name.to_string(),
            message_count: q.messages.len(),
            pending_count: q.messages.iter().filter(|e| e.pending).count(),
            has_consumer: q.consumer.is_some(),
        })
    }

    pub fn has_consumer(&self, consumer_tag: &str) -> bool {
        self.inner.lock().consumers.contains_key(consumer_tag)
    }

    /// Publish to an exchange and deliver to every matching queue
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Content,
        properties: Properties,
    ) {
        let targets = {
            let mut inner = self.inner.lock();
            let mut targets: Vec<String> = Vec::new();
            if let Some(bindings) = inner.exchanges.get(exchange) {
                for binding in bindings {
                    if topic::matches(&binding.pattern, routing_key)
                        && !targets.contains(&binding.queue)
                    {
                        targets.push(binding.queue.clone());
                    }
                }
            }

            if targets.is_empty() {
                if properties.mandatory {
                    warn!(
                        broker = %self.owner,
                        exchange,
                        routing_key,
                        "Mandatory message was not routed"
                    );
                }
                return;
            }

            let mut message = Message {
                fields: Fields {
                    routing_key: routing_key.to_string(),
                    exchange: exchange.to_string(),
                    ..Default::default()
                },
                content,
                properties,
            };
            if message.properties.timestamp.is_none() {
                message.properties.timestamp = Some(chrono::Utc::now().timestamp_millis());
            }
            for queue in &targets {
                inner.enqueue(queue, message.clone());
            }
            targets
        };

        for queue in targets {
            self.drain(&queue);
        }
    }

    /// Put a message straight into a queue, bypassing exchanges
    pub fn queue_message(
        &self,
        queue: &str,
        routing_key: &str,
        content: Content,
        properties: Properties,
    ) -> Result<(), BrokerError> {
        {
            let mut inner = self.inner.lock();
            let message = Message {
                fields: Fields {
                    routing_key: routing_key.to_string(),
                    exchange: String::new(),
                    ..Default::default()
                },
                content,
                properties,
            };
            if !inner.enqueue(queue, message) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
        }
        self.drain(queue);
        Ok(())
    }

    /// Attach the single consumer of a queue and deliver what is waiting
    pub fn consume(
        &self,
        queue: &str,
        handler: Handler,
        options: ConsumeOptions,
    ) -> Result<String, BrokerError> {
        let tag = {
            let mut inner = self.inner.lock();
            let seq = inner.seq();
            let tag = options
                .consumer_tag
                .unwrap_or_else(|| format!("{}-consumer-{}", self.owner, seq));
            let q = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if q.consumer.is_some() {
                return Err(BrokerError::ExclusiveConsumer(queue.to_string()));
            }
            q.consumer = Some(Consumer {
                tag: tag.clone(),
                handler,
                no_ack: options.no_ack,
            });
            inner.consumers.insert(tag.clone(), queue.to_string());
            tag
        };
        self.drain(queue);
        Ok(tag)
    }

    /// Cancel a consumer.
    ///
    /// Unacknowledged messages go back to the queue flagged as redelivered.
    /// Auto-delete queues are removed.
    pub fn cancel(&self, consumer_tag: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(queue_name) = inner.consumers.remove(consumer_tag) else {
            return false;
        };
        let auto_delete = match inner.queues.get_mut(&queue_name) {
            Some(queue) => {
                queue.consumer = None;
                queue.requeue_pending();
                queue.auto_delete
            }
            None => false,
        };
        if auto_delete {
            inner.delete_queue(&queue_name);
        }
        debug!(broker = %self.owner, consumer_tag, queue = %queue_name, "Consumer cancelled");
        true
    }

    /// Subscribe with a temporary queue bound to `pattern`
    pub fn subscribe_tmp(
        &self,
        exchange: &str,
        pattern: &str,
        handler: Handler,
        options: SubscribeOptions,
    ) -> String {
        let (queue, tag) = {
            let mut inner = self.inner.lock();
            let seq = inner.seq();
            let queue = format!("{}-tmp-{}", self.owner, seq);
            let tag = options
                .consumer_tag
                .clone()
                .unwrap_or_else(|| format!("{}-sub-{}", self.owner, seq));
            // a reused tag replaces the previous subscription
            if let Some(previous) = inner.consumers.get(&tag).cloned() {
                inner.delete_queue(&previous);
            }
            inner.queues.insert(
                queue.clone(),
                Queue::new(&QueueOptions {
                    durable: false,
                    auto_delete: true,
                }),
            );
            inner.bind(&queue, exchange, pattern, options.priority);
            if let Some(q) = inner.queues.get_mut(&queue) {
                q.consumer = Some(Consumer {
                    tag: tag.clone(),
                    handler,
                    no_ack: options.no_ack,
                });
            }
            inner.consumers.insert(tag.clone(), queue.clone());
            (queue, tag)
        };
        self.drain(&queue);
        tag
    }

    /// Subscribe for a single delivery
    pub fn subscribe_once(
        &self,
        exchange: &str,
        pattern: &str,
        handler: Handler,
        options: SubscribeOptions,
    ) -> String {
        let tag = options.consumer_tag.clone().unwrap_or_else(|| {
            let seq = self.inner.lock().seq();
            format!("{}-once-{}", self.owner, seq)
        });
        let broker = self.clone();
        let once_tag = tag.clone();
        let wrapped: Handler = Arc::new(move |message: &Message| {
            if broker.cancel(&once_tag) {
                handler(message);
            }
        });
        self.subscribe_tmp(
            exchange,
            pattern,
            wrapped,
            options.with_consumer_tag(tag.clone()),
        )
    }

    /// Remove an acknowledged message from its queue
    pub fn ack(&self, message: &Message) {
        let tag = message.fields.delivery_tag;
        let mut inner = self.inner.lock();
        for queue in inner.queues.values_mut() {
            if let Some(pos) = queue
                .messages
                .iter()
                .position(|e| e.message.fields.delivery_tag == tag)
            {
                queue.messages.remove(pos);
                return;
            }
        }
    }

    /// Reject a message, optionally putting it back for redelivery
    pub fn nack(&self, message: &Message, requeue: bool) {
        let tag = message.fields.delivery_tag;
        let queue_name = {
            let mut inner = self.inner.lock();
            let mut found = None;
            for (name, queue) in inner.queues.iter_mut() {
                if let Some(pos) = queue
                    .messages
                    .iter()
                    .position(|e| e.message.fields.delivery_tag == tag)
                {
                    if requeue {
                        queue.messages[pos].pending = false;
                        queue.messages[pos].message.fields.redelivered = true;
                        found = Some(name.clone());
                    } else {
                        queue.messages.remove(pos);
                    }
                    break;
                }
            }
            found
        };
        if let Some(queue) = queue_name {
            self.drain(&queue);
        }
    }

    /// Forward matching messages from this broker into another broker's exchange
    pub fn shovel(
        &self,
        name: &str,
        source_exchange: &str,
        pattern: &str,
        target: &Broker,
        target_exchange: &str,
    ) -> String {
        let target = target.clone();
        let target_exchange = target_exchange.to_string();
        let handler: Handler = Arc::new(move |message: &Message| {
            target.publish(
                &target_exchange,
                message.routing_key(),
                message.content.clone(),
                message.properties.clone(),
            );
        });
        self.subscribe_tmp(
            source_exchange,
            pattern,
            handler,
            SubscribeOptions::default().with_consumer_tag(format!("shovel-{}", name)),
        )
    }

    /// Snapshot every durable queue
    pub fn get_state(&self) -> BrokerState {
        let inner = self.inner.lock();
        let mut queues: Vec<QueueState> = inner
            .queues
            .iter()
            .filter(|(_, q)| q.durable)
            .map(|(name, q)| {
                let bindings = inner
                    .exchanges
                    .iter()
                    .flat_map(|(exchange, bindings)| {
                        bindings
                            .iter()
                            .filter(|b| &b.queue == name)
                            .map(move |b| BindingState {
                                exchange: exchange.clone(),
                                pattern: b.pattern.clone(),
                                priority: b.priority,
                            })
                    })
                    .collect();
                let messages = q
                    .messages
                    .iter()
                    .map(|e| {
                        let mut message = e.message.clone();
                        message.fields.redelivered |= e.pending;
                        message.fields.consumer_tag = None;
                        message
                    })
                    .collect();
                QueueState {
                    name: name.clone(),
                    bindings,
                    messages,
                }
            })
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        BrokerState { queues }
    }

    /// Restore durable queues from a snapshot.
    ///
    /// Existing queues with the same name are replaced; consumers attach later.
    pub fn recover(&self, state: &BrokerState) {
        let mut inner = self.inner.lock();
        for queue_state in &state.queues {
            inner.delete_queue(&queue_state.name);
            let mut queue = Queue::new(&QueueOptions::durable());
            for message in &queue_state.messages {
                let mut message = message.clone();
                message.fields.delivery_tag = inner.delivery_tag();
                queue.messages.push_back(Envelope {
                    message,
                    pending: false,
                });
            }
            inner.queues.insert(queue_state.name.clone(), queue);
            for binding in &queue_state.bindings {
                inner.bind(
                    &queue_state.name,
                    &binding.exchange,
                    &binding.pattern,
                    binding.priority,
                );
            }
        }
    }

    /// Deliver waiting messages until the queue is empty or loses its consumer
    fn drain(&self, queue: &str) {
        loop {
            let (handler, message) = {
                let mut inner = self.inner.lock();
                let Some(q) = inner.queues.get_mut(queue) else {
                    return;
                };
                let Some(consumer) = q.consumer.as_ref() else {
                    return;
                };
                let handler = consumer.handler.clone();
                let no_ack = consumer.no_ack;
                let tag = consumer.tag.clone();
                let Some(pos) = q.messages.iter().position(|e| !e.pending) else {
                    return;
                };
                let mut message = if no_ack {
                    match q.messages.remove(pos) {
                        Some(envelope) => envelope.message,
                        None => return,
                    }
                } else {
                    q.messages[pos].pending = true;
                    q.messages[pos].message.clone()
                };
                message.fields.consumer_tag = Some(tag);
                (handler, message)
            };
            handler(&message);
        }
    }
}
