//! Structured tracing for collection cycles.
//!
//! Emits debug-level spans for each cycle and its mark/sweep phases; attach
//! a `tracing` subscriber to observe them.

use tracing::{span, Level};

/// The two phases of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Mark,
    Sweep,
}

/// Span covering one whole collection cycle.
pub(crate) fn cycle_span(cycle: u64, cow_friendly: bool) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_cycle", cycle, cow_friendly).entered()
}

/// Span covering one phase of the active cycle.
pub(crate) fn phase_span(phase: Phase) -> span::EnteredSpan {
    span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
}
