//! Messaging substrate
//!
//! A single-threaded model of topic exchanges and queues. Each element owns
//! one broker; scopes shovel child events into their own broker so nested
//! lifecycle events are visible from the top.

mod bus;
mod message;
pub mod topic;

pub use bus::{
    BindingState, Broker, BrokerState, ConsumeOptions, Handler, QueueInfo, QueueOptions,
    QueueState, SubscribeOptions,
};
pub use message::{
    exchanges, keys, new_execution_id, Content, Fields, FlowAction, Message, OutboundFlow,
    Properties,
};
