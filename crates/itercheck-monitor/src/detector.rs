//! The per-access decision engine.
//!
//! [`Detector`] is the single-owner context object holding everything that
//! was process-global in earlier designs: the region state machine, the
//! ownership table, configuration, and the diagnostic sink. The host calls
//! exactly one hook at a time ([`crate::Host`] contract), so there is no
//! locking anywhere on the event path; the hooks take `&mut self` and the
//! type is deliberately `Send` but not `Sync` — driving it from two threads
//! at once is a compile error, not a latent race in the race detector.

use std::sync::Arc;

use itercheck_error::{ItercheckError, Result};
use itercheck_shadow::{OwnershipStore, page_chunks};
use itercheck_types::{
    AccessKind, AddrRange, MAX_DATA_SIZE, OwnerId, STACK_TRACE_DEPTH, VirtAddr, WorkerId,
};
use itercheck_wire::{self as wire, CMD_MAGIC_SIZE, CMD_TOTAL_SIZE, Command, DecodeOutcome};

use crate::host::Host;
use crate::observability::{DiagnosticSink, MonitorStats, NoOpSink, Report};

// ---------------------------------------------------------------------------
// DetectorConfig
// ---------------------------------------------------------------------------

/// Runtime configuration. Everything else (page and table sizing, protocol
/// constants, trace depth) is fixed at build time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Echo every recognized command to the diagnostic sink. Off by
    /// default; used when debugging the protocol itself.
    pub echo_commands: bool,
}

// ---------------------------------------------------------------------------
// RegionState
// ---------------------------------------------------------------------------

/// Mutable state scoped to one parallel region, reset by `end_for`.
#[derive(Debug, Clone, Copy, Default)]
struct RegionState {
    /// Whether access tracking is currently enforced (`iter`..`done`).
    active: bool,
    /// Worker the instruction stream is attributed to; [`OwnerId::UNOWNED`]
    /// until the first `thrd` command of the region.
    current: OwnerId,
    /// High end of the suppressed stack span (`stackbot` argument).
    stack_base: Option<VirtAddr>,
    /// Low end of the suppressed stack span; refreshed from the host at
    /// most once per out-of-range observation to tolerate stack growth.
    stack_floor: Option<VirtAddr>,
    /// Footprint of the most recent command object; writes inside it are
    /// the protocol's own bookkeeping, never races.
    last_command: Option<AddrRange>,
}

/// Stack/command suppression. Checked before reporting a conflict, never
/// before updating ownership.
fn suppressed<H: Host>(host: &H, region: &mut RegionState, addr: VirtAddr) -> bool {
    if let Some(base) = region.stack_base {
        if let Some(floor) = region.stack_floor {
            if addr >= floor && addr < base {
                return true;
            }
            if addr < floor {
                // The stack may have grown since the floor was recorded;
                // refresh it once and repeat the test.
                let refreshed = host.stack_floor();
                region.stack_floor = Some(refreshed);
                if addr >= refreshed && addr < base {
                    return true;
                }
            }
        }
    }
    if let Some(command) = region.last_command {
        if command.contains(addr) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// The race-detection engine driven by the instrumentation host.
///
/// # Event serialization
///
/// The host delivers events in true chronological execution order and each
/// hook runs to completion before the next event is issued, whatever the
/// monitored program's thread count. The detector relies on that guarantee
/// instead of locks; a host that cannot provide it must serialize calls
/// itself (e.g. behind a single-consumer event queue).
pub struct Detector<H: Host> {
    host: H,
    config: DetectorConfig,
    store: OwnershipStore,
    region: RegionState,
    sink: Arc<dyn DiagnosticSink>,
    stats: MonitorStats,
}

impl<H: Host> Detector<H> {
    /// Detector with no diagnostic sink (reports are dropped; stats and
    /// state are still maintained).
    pub fn new(host: H, config: DetectorConfig) -> Self {
        Self::with_sink(host, config, Arc::new(NoOpSink))
    }

    /// Detector delivering diagnostics to `sink`.
    pub fn with_sink(host: H, config: DetectorConfig, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            host,
            config,
            store: OwnershipStore::new(),
            region: RegionState::default(),
            sink,
            stats: MonitorStats::default(),
        }
    }

    /// Instruction-fetch events keep the host's load/store merging honest
    /// but carry no tracking semantics; only counted here.
    pub fn on_instruction_fetch(&mut self, _addr: VirtAddr, _len: usize) {
        self.stats.instructions += 1;
    }

    /// A data load of `size` bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Fatal invariant violations only (size bounds, address range,
    /// corrupted table state). Races are diagnostics, not errors.
    pub fn on_load(&mut self, addr: VirtAddr, size: usize) -> Result<()> {
        self.stats.loads += 1;
        if self.region.active {
            self.track_access(addr, size, AccessKind::Load)?;
        }
        Ok(())
    }

    /// A data store of `size` bytes at `addr`.
    ///
    /// Every store is first probed for a command tag; a recognized command
    /// mutates detector state. The store then falls through to ordinary
    /// ownership tracking while tracking is active (the command object's
    /// own footprint is covered by suppression, not exempted here).
    ///
    /// # Errors
    ///
    /// Fatal invariant violations only, including a `thrd` worker id that
    /// cannot fit the owner encoding.
    pub fn on_store(&mut self, addr: VirtAddr, size: usize) -> Result<()> {
        self.stats.stores += 1;
        self.probe_command(addr)?;
        if self.region.active {
            self.track_access(addr, size, AccessKind::Store)?;
        }
        Ok(())
    }

    /// A read-modify-write of `size` bytes at `addr`, merged by the host
    /// from a load and store of the same location. Treated as one access:
    /// the read half never conflicts with its own write half.
    ///
    /// # Errors
    ///
    /// As for [`Self::on_store`].
    pub fn on_modify(&mut self, addr: VirtAddr, size: usize) -> Result<()> {
        self.stats.modifies += 1;
        self.probe_command(addr)?;
        if self.region.active {
            self.track_access(addr, size, AccessKind::Modify)?;
        }
        Ok(())
    }

    /// Whether access tracking is currently enforced.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.region.active
    }

    /// Worker currently attributed to the instruction stream, if any
    /// `thrd` command has been processed this region.
    #[must_use]
    pub fn current_worker(&self) -> Option<WorkerId> {
        self.region.current.as_worker()
    }

    /// Event counters so far.
    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    /// The ownership table (primarily for verification tooling).
    #[must_use]
    pub fn ownership(&self) -> &OwnershipStore {
        &self.store
    }

    /// The wrapped host.
    #[must_use]
    pub fn host(&self) -> &H {
        &self.host
    }

    // -- command protocol ---------------------------------------------------

    /// Stage-one tag probe on the store path: one 4-byte read and one
    /// integer compare in the common case.
    fn probe_command(&mut self, addr: VirtAddr) -> Result<()> {
        let mut magic = [0u8; CMD_MAGIC_SIZE];
        if !self.host.read_memory(addr, &mut magic) || !wire::is_tagged(magic) {
            return Ok(());
        }
        let mut image = [0u8; CMD_TOTAL_SIZE];
        if !self.host.read_memory(addr, &mut image) {
            return Ok(());
        }
        match wire::decode(&image)? {
            DecodeOutcome::NotACommand => Ok(()),
            DecodeOutcome::Unknown { opcode } => {
                self.stats.protocol_violations += 1;
                let stack = self.host.capture_stack(STACK_TRACE_DEPTH);
                self.sink.on_report(&Report::ProtocolViolation {
                    opcode,
                    addr,
                    stack,
                });
                Ok(())
            }
            DecodeOutcome::Command(command) => self.apply_command(addr, command),
        }
    }

    fn apply_command(&mut self, addr: VirtAddr, command: Command) -> Result<()> {
        self.stats.commands += 1;
        let mut echo_floor = None;
        match command {
            Command::BeginFor => {}
            Command::EndFor => {
                // Region boundary: ownership recorded during this region is
                // irrelevant to the next one.
                self.store.clear();
                self.region.current = OwnerId::UNOWNED;
            }
            Command::Iter { .. } => {
                self.region.active = true;
            }
            Command::Done { .. } => {
                self.region.active = false;
            }
            Command::Worker { worker } => {
                self.region.current = OwnerId::from_worker(worker)
                    .ok_or(ItercheckError::WorkerIdOverflow { worker })?;
            }
            Command::StackBase { base } => {
                let floor = self.host.stack_floor();
                self.region.stack_base = Some(base);
                self.region.stack_floor = Some(floor);
                echo_floor = Some(floor);
            }
        }
        self.region.last_command = Some(AddrRange::from_len(addr, CMD_TOTAL_SIZE as u64));

        // `thrd` is the one command echo never narrates.
        if self.config.echo_commands && !matches!(command, Command::Worker { .. }) {
            self.sink.on_report(&Report::CommandEcho {
                command,
                stack_floor: echo_floor,
            });
        }
        Ok(())
    }

    // -- ownership tracking -------------------------------------------------

    /// Scan `[base, base+size)` against the ownership table: report at most
    /// one conflict for the whole access, and on writes take ownership of
    /// every byte regardless of conflicts or suppression.
    fn track_access(&mut self, base: VirtAddr, size: usize, kind: AccessKind) -> Result<()> {
        if size == 0 || size > MAX_DATA_SIZE {
            return Err(ItercheckError::AccessSizeOutOfRange { size });
        }

        // Split borrows: the page borrow from `store` must coexist with
        // suppression's use of `host` and `region`.
        let Self {
            host,
            store,
            region,
            sink,
            stats,
            ..
        } = self;

        let current = region.current;
        let mut conflict: Option<(VirtAddr, OwnerId)> = None;

        for (chunk_base, chunk_len) in page_chunks(base, size) {
            let start = chunk_base.page_offset();
            if kind.is_write() {
                let page = store.page_mut(chunk_base)?;
                for i in 0..chunk_len {
                    let offset = start + i;
                    let owner = page.owner_at(offset);
                    if conflict.is_none() && owner.is_owned() && owner != current {
                        let addr = chunk_base.offset(i as u64);
                        if !suppressed(host, region, addr) {
                            conflict = Some((addr, owner));
                        }
                    }
                    // Ownership always reflects the most recent writer,
                    // conflict or not.
                    page.set_owner_at(offset, current);
                }
            } else {
                let Some(page) = store.page(chunk_base)? else {
                    continue;
                };
                for i in 0..chunk_len {
                    let owner = page.owner_at(start + i);
                    if owner.is_owned() && owner != current {
                        let addr = chunk_base.offset(i as u64);
                        if !suppressed(host, region, addr) {
                            conflict = Some((addr, owner));
                            break;
                        }
                    }
                }
                if conflict.is_some() {
                    break;
                }
            }
        }

        if let Some((addr, owner)) = conflict {
            let Some(owner) = owner.as_worker() else {
                return Err(ItercheckError::invariant(
                    "conflicting owner id decoded as unowned",
                ));
            };
            stats.races += 1;
            let stack = host.capture_stack(STACK_TRACE_DEPTH);
            sink.on_report(&Report::Race {
                accessor: current.as_worker(),
                owner,
                addr,
                base,
                size,
                kind,
                stack,
            });
        }
        Ok(())
    }
}

impl<H: Host + std::fmt::Debug> std::fmt::Debug for Detector<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("host", &self.host)
            .field("config", &self.config)
            .field("region", &self.region)
            .field("store", &self.store)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use itercheck_types::StackTrace;

    use super::*;

    /// Minimal host: a flat 64 KiB memory image starting at address 0, a
    /// fixed stack floor, one canned stack frame. The full scripted host
    /// lives in the harness crate.
    #[derive(Debug)]
    struct FlatHost {
        memory: Vec<u8>,
        floor: VirtAddr,
    }

    impl FlatHost {
        fn new() -> Self {
            Self {
                memory: vec![0u8; 0x10000],
                floor: VirtAddr::new(0xe000),
            }
        }

        fn write(&mut self, addr: VirtAddr, bytes: &[u8]) {
            let start = addr.get() as usize;
            self.memory[start..start + bytes.len()].copy_from_slice(bytes);
        }
    }

    impl Host for FlatHost {
        fn read_memory(&self, addr: VirtAddr, buf: &mut [u8]) -> bool {
            let start = addr.get() as usize;
            let Some(end) = start.checked_add(buf.len()) else {
                return false;
            };
            if end > self.memory.len() {
                return false;
            }
            buf.copy_from_slice(&self.memory[start..end]);
            true
        }

        fn stack_floor(&self) -> VirtAddr {
            self.floor
        }

        fn capture_stack(&self, max_frames: usize) -> StackTrace {
            StackTrace::from_frames(vec![VirtAddr::new(0x4000)].into_iter().take(max_frames).collect())
        }
    }

    const CMD_AT: VirtAddr = VirtAddr::new(0x8000);

    fn detector_with_sink() -> (Detector<FlatHost>, Arc<crate::CollectingSink>) {
        let sink = Arc::new(crate::CollectingSink::new());
        let detector = Detector::with_sink(
            FlatHost::new(),
            DetectorConfig::default(),
            Arc::clone(&sink) as Arc<dyn DiagnosticSink>,
        );
        (detector, sink)
    }

    /// Write a command object into host memory, then deliver the store
    /// event that announces it.
    fn issue(detector: &mut Detector<FlatHost>, command: Command) -> Result<()> {
        let image = wire::encode(&command);
        // Writing host memory requires &mut host; Detector only hands out
        // &H, so poke the image in before constructing the event.
        detector.host_mut_for_test().write(CMD_AT, &image);
        detector.on_store(CMD_AT, 4)
    }

    impl Detector<FlatHost> {
        fn host_mut_for_test(&mut self) -> &mut FlatHost {
            &mut self.host
        }
    }

    #[test]
    fn commands_drive_the_state_machine() {
        let (mut detector, _sink) = detector_with_sink();
        assert!(!detector.is_active());
        assert_eq!(detector.current_worker(), None);

        issue(&mut detector, Command::BeginFor).unwrap();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(4),
            },
        )
        .unwrap();
        assert_eq!(detector.current_worker(), Some(WorkerId::new(4)));

        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();
        assert!(detector.is_active());

        issue(&mut detector, Command::Done { iteration: 0 }).unwrap();
        assert!(!detector.is_active());

        issue(&mut detector, Command::EndFor).unwrap();
        assert_eq!(detector.current_worker(), None);
        assert_eq!(detector.ownership().allocated_nodes(), 0);
        assert_eq!(detector.stats().commands, 5);
    }

    #[test]
    fn cross_worker_conflict_is_reported_once() {
        let (mut detector, sink) = detector_with_sink();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();

        detector.on_store(VirtAddr::new(0x100), 8).unwrap();
        assert!(sink.races().is_empty());

        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(2),
            },
        )
        .unwrap();
        detector.on_load(VirtAddr::new(0x100), 8).unwrap();

        let races = sink.races();
        assert_eq!(races.len(), 1);
        match &races[0] {
            Report::Race {
                accessor,
                owner,
                addr,
                base,
                size,
                kind,
                ..
            } => {
                assert_eq!(*accessor, Some(WorkerId::new(2)));
                assert_eq!(*owner, WorkerId::new(1));
                assert_eq!(*addr, VirtAddr::new(0x100));
                assert_eq!(*base, VirtAddr::new(0x100));
                assert_eq!(*size, 8);
                assert_eq!(*kind, AccessKind::Load);
            }
            other => panic!("expected race, got {other:?}"),
        }
        assert_eq!(detector.stats().races, 1);
    }

    #[test]
    fn same_worker_reaccess_is_clean() {
        let (mut detector, sink) = detector_with_sink();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();

        detector.on_store(VirtAddr::new(0x200), 4).unwrap();
        detector.on_load(VirtAddr::new(0x200), 4).unwrap();
        detector.on_modify(VirtAddr::new(0x200), 4).unwrap();
        assert!(sink.races().is_empty());
    }

    #[test]
    fn write_updates_ownership_even_when_conflicting() {
        let (mut detector, sink) = detector_with_sink();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();
        detector.on_store(VirtAddr::new(0x300), 4).unwrap();

        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(2),
            },
        )
        .unwrap();
        detector.on_store(VirtAddr::new(0x300), 4).unwrap();
        assert_eq!(sink.races().len(), 1);

        // Every byte now belongs to worker 2: re-access by worker 2 is
        // clean, and worker 1 would now be the racer.
        detector.on_load(VirtAddr::new(0x300), 4).unwrap();
        assert_eq!(sink.races().len(), 1);
        let owner = detector
            .ownership()
            .owner_of(VirtAddr::new(0x303))
            .unwrap();
        assert_eq!(owner.as_worker(), Some(WorkerId::new(2)));
    }

    #[test]
    fn inactive_detector_tracks_nothing() {
        let (mut detector, sink) = detector_with_sink();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        detector.on_store(VirtAddr::new(0x400), 8).unwrap();
        detector.on_load(VirtAddr::new(0x400), 8).unwrap();
        assert!(sink.is_empty());
        assert_eq!(detector.ownership().allocated_nodes(), 0);
    }

    #[test]
    fn command_footprint_is_suppressed() {
        let (mut detector, sink) = detector_with_sink();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();

        // The iter command's own store took ownership of the command
        // object's bytes for worker 1. A different worker re-announcing
        // itself writes the same object; the footprint rule keeps the
        // detector's own channel from reporting itself.
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(2),
            },
        )
        .unwrap();
        detector.on_store(CMD_AT, 4).unwrap();
        assert!(sink.races().is_empty());
    }

    #[test]
    fn stack_scratch_is_suppressed() {
        let (mut detector, sink) = detector_with_sink();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        issue(
            &mut detector,
            Command::StackBase {
                base: VirtAddr::new(0xf000),
            },
        )
        .unwrap();
        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();

        // Floor is 0xe000 (FlatHost): [0xe000, 0xf000) is private scratch.
        detector.on_store(VirtAddr::new(0xe800), 8).unwrap();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(2),
            },
        )
        .unwrap();
        detector.on_load(VirtAddr::new(0xe800), 8).unwrap();
        assert!(sink.races().is_empty());

        // The same dance outside the stack span does race.
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        detector.on_store(VirtAddr::new(0x500), 8).unwrap();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(2),
            },
        )
        .unwrap();
        detector.on_load(VirtAddr::new(0x500), 8).unwrap();
        assert_eq!(sink.races().len(), 1);
    }

    #[test]
    fn unknown_opcode_warns_and_changes_nothing() {
        let (mut detector, sink) = detector_with_sink();
        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();
        assert!(detector.is_active());

        let mut image = wire::encode(&Command::BeginFor);
        image[wire::CMD_PAYLOAD_OFFSET..wire::CMD_PAYLOAD_OFFSET + 6].copy_from_slice(b"bogus\0");
        detector.host_mut_for_test().write(CMD_AT, &image);
        detector.on_store(CMD_AT, 4).unwrap();

        let reports = sink.snapshot();
        let warnings: Vec<_> = reports
            .iter()
            .filter(|r| matches!(r, Report::ProtocolViolation { .. }))
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(detector.is_active());
        assert_eq!(detector.stats().protocol_violations, 1);
    }

    #[test]
    fn size_bounds_are_fatal() {
        let (mut detector, _sink) = detector_with_sink();
        issue(&mut detector, Command::Iter { iteration: 0 }).unwrap();
        assert_eq!(
            detector.on_load(VirtAddr::new(0x100), 0),
            Err(ItercheckError::AccessSizeOutOfRange { size: 0 })
        );
        assert_eq!(
            detector.on_store(VirtAddr::new(0x100), MAX_DATA_SIZE + 1),
            Err(ItercheckError::AccessSizeOutOfRange {
                size: MAX_DATA_SIZE + 1
            })
        );
    }

    #[test]
    fn echo_is_opt_in() {
        let sink = Arc::new(crate::CollectingSink::new());
        let mut detector = Detector::with_sink(
            FlatHost::new(),
            DetectorConfig {
                echo_commands: true,
            },
            Arc::clone(&sink) as Arc<dyn DiagnosticSink>,
        );
        issue(&mut detector, Command::BeginFor).unwrap();
        issue(
            &mut detector,
            Command::Worker {
                worker: WorkerId::new(1),
            },
        )
        .unwrap();
        issue(&mut detector, Command::Iter { iteration: 7 }).unwrap();

        let echoes: Vec<String> = sink
            .snapshot()
            .iter()
            .filter(|r| matches!(r, Report::CommandEcho { .. }))
            .map(ToString::to_string)
            .collect();
        // thrd is never echoed.
        assert_eq!(echoes, vec!["begin_for".to_owned(), "iter 7".to_owned()]);
    }

    #[test]
    fn instruction_fetch_only_counts() {
        let (mut detector, sink) = detector_with_sink();
        detector.on_instruction_fetch(VirtAddr::new(0x1000), 3);
        detector.on_instruction_fetch(VirtAddr::new(0x1003), 5);
        assert_eq!(detector.stats().instructions, 2);
        assert!(sink.is_empty());
    }
}
