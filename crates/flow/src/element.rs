//! Common interface of the children a scope coordinator drives

use crate::api::{Api, ApiOwner};
use crate::broker::{Content, Message};
use crate::chain::ParentChain;
use crate::error::Result;
use crate::snapshot::ElementState;

/// An element a [`ScopeExecution`](crate::execution::ScopeExecution) owns:
/// activities inside a process, processes inside a definition.
pub trait Element: ApiOwner {
    fn id(&self) -> &str;

    fn element_type(&self) -> &str;

    /// Runs as soon as the owning scope starts
    fn is_start(&self) -> bool;

    /// Signal/message ids that start this element when it is idle
    fn start_references(&self) -> &[String];

    fn is_running(&self) -> bool;

    /// Current or next execution id
    fn execution_id(&self) -> Option<String>;

    /// Allocate the next execution id and announce it with an `init` event
    fn init(&self, parent: Option<&ParentChain>);

    /// Start a new run. `input` carries parent chain, inbound and discard info.
    fn run(&self, input: Content) -> Result<()>;

    /// Stop the current run; no completion is published
    fn stop(&self);

    /// Discard the current run
    fn discard(&self);

    /// Continue after `stop` or `recover`
    fn resume(&self) -> Result<()>;

    /// Api for this element or, for scopes, the nested instance `message` describes
    fn get_api(&self, message: Option<&Message>) -> Result<Api>;

    /// Apis of in-flight descendants below this element, empty for leaves
    fn get_postponed(&self) -> Vec<Api> {
        Vec::new()
    }

    fn get_state(&self) -> ElementState;

    fn recover(&self, state: &ElementState) -> Result<()>;
}
