//! Diagnostic reports and the sinks that carry them.
//!
//! Detection is advisory: a race never stops the monitored program, so the
//! entire value of the detector is in what comes out of this module. Every
//! diagnostic is a structured [`Report`] value first and a rendered line
//! second; sinks decide where the reports land (collected for tests, logged
//! through `tracing`, streamed as JSON lines).

use std::fmt;
use std::io::Write;

use parking_lot::Mutex;

use itercheck_types::{AccessKind, StackTrace, VirtAddr, WorkerId};
use itercheck_wire::Command;

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// One diagnostic emitted by the monitor.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Report {
    /// A byte written by one worker was touched by another within the same
    /// region. At most one of these is emitted per delivered access.
    Race {
        /// Worker the instruction stream is attributed to; `None` if no
        /// `thrd` command has been processed yet.
        accessor: Option<WorkerId>,
        /// Worker that last wrote the conflicting byte.
        owner: WorkerId,
        /// First conflicting byte address.
        addr: VirtAddr,
        /// Base of the access that tripped the conflict.
        base: VirtAddr,
        /// Size of the access in bytes.
        size: usize,
        /// Load, store, or modify.
        kind: AccessKind,
        /// Call stack at the access, innermost first.
        stack: StackTrace,
    },

    /// A tagged command object carried an opcode outside the known set.
    /// The command is ignored and detector state is unchanged.
    ProtocolViolation {
        /// Printable preview of the unrecognized opcode bytes.
        opcode: String,
        /// Address of the command object.
        addr: VirtAddr,
        /// Call stack at the offending store, innermost first.
        stack: StackTrace,
    },

    /// A recognized command, echoed only when the detector is configured
    /// to narrate the protocol (debugging aid).
    CommandEcho {
        /// The decoded command.
        command: Command,
        /// For `stackbot`: the stack floor recomputed alongside it.
        stack_floor: Option<VirtAddr>,
    },
}

impl Report {
    /// Whether this report is a detected data race.
    #[must_use]
    pub fn is_race(&self) -> bool {
        matches!(self, Self::Race { .. })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Race {
                accessor,
                owner,
                addr,
                base,
                size,
                kind,
                stack,
            } => {
                match accessor {
                    Some(worker) => write!(f, "itercheck: error - worker {worker}")?,
                    None => f.write_str("itercheck: error - unattributed worker")?,
                }
                writeln!(f, " {kind} at {addr} [{base},{size}], owned by worker {owner}")?;
                write!(f, "{stack}")
            }
            Self::ProtocolViolation {
                opcode,
                addr,
                stack,
            } => {
                writeln!(
                    f,
                    "itercheck: WARNING - unknown command {opcode:?} at {addr}"
                )?;
                write!(f, "{stack}")
            }
            Self::CommandEcho {
                command,
                stack_floor,
            } => match stack_floor {
                Some(floor) => write!(f, "{command} [floor {floor}]"),
                None => write!(f, "{command}"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// DiagnosticSink
// ---------------------------------------------------------------------------

/// Destination for monitor diagnostics.
///
/// Called synchronously from the hooks, so implementations must be cheap
/// and must never block on the monitored program's own progress.
pub trait DiagnosticSink: Send + Sync {
    /// Deliver one report.
    fn on_report(&self, report: &Report);
}

/// Sink that discards everything. Default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

impl DiagnosticSink for NoOpSink {
    #[inline(always)]
    fn on_report(&self, _report: &Report) {}
}

/// Sink that retains every report in order. The workhorse of the test
/// harness and of embedders that post-process verdicts.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<Report>>,
}

impl CollectingSink {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports delivered so far, in delivery order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    /// Only the race reports.
    #[must_use]
    pub fn races(&self) -> Vec<Report> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.is_race())
            .cloned()
            .collect()
    }

    /// Number of reports delivered so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Whether nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all retained reports.
    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn on_report(&self, report: &Report) {
        self.reports.lock().push(report.clone());
    }
}

/// Sink that forwards reports to the `tracing` subscriber: races and
/// protocol violations at `warn`, command echo at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn on_report(&self, report: &Report) {
        match report {
            Report::Race { .. } | Report::ProtocolViolation { .. } => {
                tracing::warn!(report = %report, "itercheck diagnostic");
            }
            Report::CommandEcho { .. } => {
                tracing::debug!(report = %report, "itercheck command");
            }
        }
    }
}

/// Sink that serializes each report as one JSON line.
///
/// The line format is the `serde` rendering of [`Report`]; consumers that
/// want a stable machine-readable stream should pin the crate version.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Wrap a writer. Each report becomes one `\n`-terminated JSON object.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Unwrap the inner writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> DiagnosticSink for JsonLinesSink<W> {
    fn on_report(&self, report: &Report) {
        let mut writer = self.writer.lock();
        // Diagnostics must never disturb the monitored program; a failed
        // write is dropped rather than propagated.
        if let Ok(line) = serde_json::to_string(report) {
            let _ = writeln!(writer, "{line}");
        }
    }
}

// ---------------------------------------------------------------------------
// MonitorStats
// ---------------------------------------------------------------------------

/// Monotonic event counters for one detector instance.
///
/// Plain integers, not atomics: the host serializes events, so the counters
/// are only ever touched from inside a hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MonitorStats {
    /// Instruction-fetch events delivered.
    pub instructions: u64,
    /// Load events delivered.
    pub loads: u64,
    /// Store events delivered.
    pub stores: u64,
    /// Modify events delivered.
    pub modifies: u64,
    /// Recognized protocol commands processed.
    pub commands: u64,
    /// Race diagnostics emitted.
    pub races: u64,
    /// Protocol-violation warnings emitted.
    pub protocol_violations: u64,
}

impl MonitorStats {
    /// Total data-access events (loads + stores + modifies).
    #[must_use]
    pub fn data_accesses(&self) -> u64 {
        self.loads + self.stores + self.modifies
    }
}
