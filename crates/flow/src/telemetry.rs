// Tracing setup
//
// The engine only emits `tracing` events and spans. Embedders that have no
// subscriber of their own can install the console one here.

use tracing::Span;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::scope::ScopeKind;

/// Install a console subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`.
///
/// Fails instead of panicking when a global subscriber is already set.
pub fn init_tracing(default_filter: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .try_init()
}

/// Span covering one scope run
pub fn scope_span(kind: ScopeKind, id: &str, execution_id: &str) -> Span {
    tracing::info_span!(
        "flow.scope",
        kind = kind.prefix(),
        scope.id = %id,
        execution.id = %execution_id,
    )
}
