//! Request processing span helpers.
//!
//! Provides span creation and status-transition recording for requests
//! flowing through the agent.

use tracing::Span;

use crate::model::{RequestId, RequestStatus};

/// Start a span for processing one claimed request.
///
/// The `request.status` field is declared empty and can be updated via
/// [`record_status_transition`].
pub fn start_request_span(name: &str, id: Option<RequestId>) -> Span {
    tracing::info_span!(
        "request.process",
        "request.name" = name,
        "request.id" = id.map(|id| id.0),
        "request.status" = tracing::field::Empty,
    )
}

/// Record a status transition event on the given span.
///
/// Emits a tracing `info` event scoped to the span.
pub fn record_status_transition(span: &Span, from: RequestStatus, to: RequestStatus) {
    span.record("request.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "status_transition");
    });
}
