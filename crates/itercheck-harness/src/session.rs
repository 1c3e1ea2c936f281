//! High-level event scripting over a detector instance.
//!
//! A [`Session`] wires a [`ScriptedHost`], a [`Detector`], and a
//! [`CollectingSink`] together and exposes the monitored program's side of
//! the story as operations: "store these bytes", "issue this command",
//! "read that range". Tests describe executions; the session performs the
//! memory writes and delivers the matching hook events in order.

use std::sync::Arc;

use itercheck::{
    CollectingSink, Command, Detector, DetectorConfig, DiagnosticSink, Report, Result, VirtAddr,
    encode,
};

use crate::scripted_host::ScriptedHost;

/// One scripted detector run.
pub struct Session {
    host: ScriptedHost,
    detector: Detector<ScriptedHost>,
    sink: Arc<CollectingSink>,
}

impl Session {
    /// Session with default configuration (no command echo).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DetectorConfig::default())
    }

    /// Session with explicit configuration.
    #[must_use]
    pub fn with_config(config: DetectorConfig) -> Self {
        let host = ScriptedHost::new();
        let sink = Arc::new(CollectingSink::new());
        let detector = Detector::with_sink(
            host.clone(),
            config,
            Arc::clone(&sink) as Arc<dyn DiagnosticSink>,
        );
        Self {
            host,
            detector,
            sink,
        }
    }

    /// The scripted host handle (for stack metadata and raw memory pokes).
    #[must_use]
    pub fn host(&self) -> &ScriptedHost {
        &self.host
    }

    /// The detector under test.
    pub fn detector_mut(&mut self) -> &mut Detector<ScriptedHost> {
        &mut self.detector
    }

    /// Immutable view of the detector under test.
    #[must_use]
    pub fn detector(&self) -> &Detector<ScriptedHost> {
        &self.detector
    }

    /// Write a command object at `at` and deliver the announcing store.
    ///
    /// # Errors
    ///
    /// Propagates fatal detector errors (e.g. worker-id overflow).
    pub fn command(&mut self, at: VirtAddr, command: Command) -> Result<()> {
        tracing::debug!(%command, %at, "scripting command");
        self.host.write_memory(at, &encode(&command));
        self.detector.on_store(at, 4)
    }

    /// Write `bytes` at `addr` and deliver the store event.
    ///
    /// # Errors
    ///
    /// Propagates fatal detector errors.
    pub fn store(&mut self, addr: VirtAddr, bytes: &[u8]) -> Result<()> {
        self.host.write_memory(addr, bytes);
        self.detector.on_store(addr, bytes.len())
    }

    /// Deliver a load event for `size` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Propagates fatal detector errors.
    pub fn load(&mut self, addr: VirtAddr, size: usize) -> Result<()> {
        self.detector.on_load(addr, size)
    }

    /// Write `bytes` at `addr` and deliver the merged read-modify-write
    /// event.
    ///
    /// # Errors
    ///
    /// Propagates fatal detector errors.
    pub fn modify(&mut self, addr: VirtAddr, bytes: &[u8]) -> Result<()> {
        self.host.write_memory(addr, bytes);
        self.detector.on_modify(addr, bytes.len())
    }

    /// Every diagnostic so far, in order.
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.sink.snapshot()
    }

    /// Race diagnostics only.
    #[must_use]
    pub fn races(&self) -> Vec<Report> {
        self.sink.races()
    }

    /// Protocol-violation warnings only.
    #[must_use]
    pub fn warnings(&self) -> Vec<Report> {
        self.reports()
            .into_iter()
            .filter(|r| matches!(r, Report::ProtocolViolation { .. }))
            .collect()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Conventional address for scripted command objects, well away from the
/// data addresses tests usually use.
pub const CMD_AT: VirtAddr = VirtAddr::new(0x0600_0000_0000);

/// Script the common preamble: announce worker `worker` and start tracking.
///
/// # Errors
///
/// Propagates fatal detector errors.
pub fn enter_iteration(session: &mut Session, worker: u32) -> Result<()> {
    session.command(
        CMD_AT,
        Command::Worker {
            worker: itercheck::WorkerId::new(worker),
        },
    )?;
    session.command(CMD_AT, Command::Iter { iteration: 0 })
}
