//! Span helpers for unit attempts.

use tracing::Span;

use crate::model::UnitId;

/// Start the span covering one attempt of a unit.
///
/// `unit.state` is declared empty; [`record_state_transition`] reports the
/// moves made while the span is open.
pub fn start_unit_span(id: &UnitId, attempt: u32) -> Span {
    tracing::info_span!(
        "unit.attempt",
        "unit.id" = %id.0,
        "unit.attempt" = attempt,
        "unit.state" = tracing::field::Empty,
    )
}

/// Emit a state transition event inside `span` and record the new state.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("unit.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
