//! itercheck — a byte-granular data-race oracle for cooperative,
//! explicitly-scheduled parallel-for runtimes.
//!
//! A binary-instrumentation host feeds the detector one event per memory
//! access of the monitored program. The detector records, per byte, which
//! worker last wrote it, and flags any byte written by one worker and then
//! touched by another before the region boundary resets ownership. Workers
//! identify themselves — and delimit regions — over a covert command
//! channel: tagged structures written into ordinary memory that the store
//! hook recognizes, because no other channel between the monitored program
//! and the detector exists.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use itercheck::{CollectingSink, Detector, DetectorConfig, Host, VirtAddr};
//!
//! fn drive<H: Host>(host: H) -> itercheck::Result<()> {
//!     let sink = Arc::new(CollectingSink::new());
//!     let mut detector = Detector::with_sink(host, DetectorConfig::default(), sink.clone());
//!
//!     // The instrumentation host calls these once per executed instruction.
//!     detector.on_instruction_fetch(VirtAddr::new(0x1000), 3);
//!     detector.on_store(VirtAddr::new(0x7ffc_0000), 8)?;
//!     detector.on_load(VirtAddr::new(0x7ffc_0000), 8)?;
//!
//!     for report in sink.snapshot() {
//!         eprintln!("{report}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Crate map
//!
//! - [`itercheck_types`]: addresses, worker/owner ids, sizing constants.
//! - [`itercheck_shadow`]: the sparse byte-granular ownership table.
//! - [`itercheck_wire`]: the in-memory command protocol.
//! - [`itercheck_monitor`]: the detector itself, its host seam, and
//!   diagnostics.

pub use itercheck_error::{ItercheckError, Result};
pub use itercheck_monitor::{
    CollectingSink, Detector, DetectorConfig, DiagnosticSink, Host, JsonLinesSink, MonitorStats,
    NoOpSink, Report, TracingSink,
};
pub use itercheck_shadow::{OwnershipStore, ShadowPage};
pub use itercheck_types::{
    AccessKind, AddrRange, MAX_DATA_SIZE, MAX_WORKERS, OwnerId, PAGE_BITS, PAGE_SIZE,
    STACK_TRACE_DEPTH, StackTrace, VirtAddr, WorkerId,
};
pub use itercheck_wire::{
    CMD_MAGIC, CMD_MARKER, CMD_TOTAL_SIZE, Command, DecodeOutcome, decode, encode, is_tagged,
};
