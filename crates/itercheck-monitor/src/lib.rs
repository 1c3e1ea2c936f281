//! The itercheck access monitor.
//!
//! This crate is the stateful automaton at the center of the detector: it
//! receives one event per executed instruction from the binary-
//! instrumentation host, recognizes command-protocol writes, consults and
//! updates the ownership table, applies suppression, and emits diagnostics.
//!
//! See [`Detector`] for the engine, [`Host`] for the seam to the
//! instrumentation host, and [`observability`] for reports and sinks.

pub mod detector;
pub mod host;
pub mod observability;

pub use detector::{Detector, DetectorConfig};
pub use host::Host;
pub use observability::{
    CollectingSink, DiagnosticSink, JsonLinesSink, MonitorStats, NoOpSink, Report, TracingSink,
};
