//! The in-memory command protocol.
//!
//! The instrumented program and the detector share no API surface at all;
//! the only channel the detector can see is memory the host already
//! intercepts. Control messages are therefore smuggled as ordinary writes to
//! a tagged structure — the *command object* — that the store hook
//! recognizes:
//!
//! ```text
//! offset  0: u32 magic              (CMD_MAGIC, native endian)
//! offset  4: [u8; 16] marker        (CMD_MARKER, exact bytes)
//! offset 20: [u8; 128] payload      (opcode + fixed-offset arguments)
//! ```
//!
//! The tag check is two-stage: one integer compare against the magic on
//! every store (the common-case cost), then the 16-byte marker, and only
//! then is the payload interpreted. Arguments sit at fixed payload offsets
//! (`i32` at +4, pointer-sized at +8) and may directly abut a 4-byte opcode
//! name, so opcodes are matched as bounded prefixes, not as terminated
//! strings. No opcode in the set is a prefix of another.
//!
//! Decoding is defensive throughout: truncated buffers and mismatched
//! markers are "not a command", unknown opcodes are surfaced for a warning
//! diagnostic, and nothing here panics on corrupted input. The one hard
//! failure is a `thrd` worker argument that cannot fit the byte-wide owner
//! encoding — wrapping it would mis-attribute ownership for the rest of the
//! region, so that is an invariant violation.

use std::fmt;

use itercheck_error::{ItercheckError, Result};
use itercheck_types::{MAX_WORKERS, VirtAddr, WorkerId};

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

/// First-stage tag: the magic word opening every command object.
pub const CMD_MAGIC: u32 = u32::from_le_bytes(*b"itck");

/// Second-stage tag: constant identification string following the magic.
pub const CMD_MARKER: [u8; 16] = *b"itercheck cmd v1";

/// Bytes occupied by the magic word.
pub const CMD_MAGIC_SIZE: usize = 4;

/// Bytes occupied by the marker string.
pub const CMD_MARKER_SIZE: usize = 16;

/// Bytes of opcode-specific payload.
pub const CMD_PAYLOAD_SIZE: usize = 128;

/// Payload offset within the command object.
pub const CMD_PAYLOAD_OFFSET: usize = CMD_MAGIC_SIZE + CMD_MARKER_SIZE;

/// Total footprint of a command object in the monitored program's memory.
pub const CMD_TOTAL_SIZE: usize = CMD_PAYLOAD_OFFSET + CMD_PAYLOAD_SIZE;

/// Payload offset of the 32-bit integer argument.
const INT_ARG_OFFSET: usize = 4;

/// Payload offset of the pointer-sized address argument.
const PTR_ARG_OFFSET: usize = 8;

/// Longest prefix of an unrecognized payload echoed in warnings.
const UNKNOWN_OPCODE_PREVIEW: usize = 24;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A decoded control event from the instrumented runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Command {
    /// A parallel-for region is starting. Informational.
    BeginFor,
    /// The region ended: ownership state is wiped and the current worker
    /// attribution resets to "none".
    EndFor,
    /// A worker picked up an iteration; tracking is enforced from here.
    /// The iteration count is carried for diagnostics only.
    Iter {
        /// Iteration counter reported by the runtime.
        iteration: i32,
    },
    /// The current iteration finished; tracking is relaxed.
    Done {
        /// Iteration counter reported by the runtime.
        iteration: i32,
    },
    /// The instruction stream now executes on behalf of this worker.
    Worker {
        /// Announced worker, in the runtime's 0-based numbering.
        worker: WorkerId,
    },
    /// Base of the stack in use when the runtime entered the region;
    /// everything below it is private scratch.
    StackBase {
        /// Stack base address recorded by the runtime.
        base: VirtAddr,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeginFor => f.write_str("begin_for"),
            Self::EndFor => f.write_str("end_for"),
            Self::Iter { iteration } => write!(f, "iter {iteration}"),
            Self::Done { iteration } => write!(f, "done {iteration}"),
            Self::Worker { worker } => write!(f, "thrd {worker}"),
            Self::StackBase { base } => write!(f, "stackbot {base}"),
        }
    }
}

/// Result of inspecting a stored-to location for a command object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Both tag stages matched and the opcode is known.
    Command(Command),
    /// Both tag stages matched but the opcode is not in the known set; the
    /// caller reports a protocol warning and changes no state.
    Unknown {
        /// Printable preview of the unrecognized payload.
        opcode: String,
    },
    /// Ordinary program data.
    NotACommand,
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// First-stage probe: does a 4-byte read look like a command tag?
///
/// This is the per-store hot-path check; everything else in this module
/// runs only after it matches.
#[inline]
#[must_use]
pub fn is_tagged(magic_bytes: [u8; CMD_MAGIC_SIZE]) -> bool {
    u32::from_ne_bytes(magic_bytes) == CMD_MAGIC
}

/// Decode a full command-object image.
///
/// `image` is the [`CMD_TOTAL_SIZE`] bytes at the stored-to address as read
/// back from the monitored program's memory. Shorter buffers (the host
/// could not read the full footprint) decode as
/// [`DecodeOutcome::NotACommand`].
///
/// # Errors
///
/// A recognized `thrd` command whose worker argument is negative or exceeds
/// [`MAX_WORKERS`] is a fatal invariant violation, not a protocol warning.
pub fn decode(image: &[u8]) -> Result<DecodeOutcome> {
    let Some(magic) = read_array::<CMD_MAGIC_SIZE>(image, 0) else {
        return Ok(DecodeOutcome::NotACommand);
    };
    if !is_tagged(magic) {
        return Ok(DecodeOutcome::NotACommand);
    }
    let Some(marker) = read_array::<CMD_MARKER_SIZE>(image, CMD_MAGIC_SIZE) else {
        return Ok(DecodeOutcome::NotACommand);
    };
    if marker != CMD_MARKER {
        return Ok(DecodeOutcome::NotACommand);
    }
    let Some(payload) = image.get(CMD_PAYLOAD_OFFSET..CMD_TOTAL_SIZE) else {
        return Ok(DecodeOutcome::NotACommand);
    };
    decode_payload(payload)
}

fn decode_payload(payload: &[u8]) -> Result<DecodeOutcome> {
    let command = if has_opcode(payload, b"begin_for") {
        Command::BeginFor
    } else if has_opcode(payload, b"end_for") {
        Command::EndFor
    } else if has_opcode(payload, b"iter") {
        Command::Iter {
            iteration: read_i32(payload, INT_ARG_OFFSET),
        }
    } else if has_opcode(payload, b"done") {
        Command::Done {
            iteration: read_i32(payload, INT_ARG_OFFSET),
        }
    } else if has_opcode(payload, b"thrd") {
        let raw = read_i32(payload, INT_ARG_OFFSET);
        Command::Worker {
            worker: worker_from_raw(raw)?,
        }
    } else if has_opcode(payload, b"stackbot") {
        Command::StackBase {
            base: VirtAddr::new(read_u64(payload, PTR_ARG_OFFSET)),
        }
    } else {
        return Ok(DecodeOutcome::Unknown {
            opcode: opcode_preview(payload),
        });
    };
    Ok(DecodeOutcome::Command(command))
}

fn worker_from_raw(raw: i32) -> Result<WorkerId> {
    if raw < 0 {
        return Err(ItercheckError::NegativeWorkerId { raw });
    }
    let worker = WorkerId::new(raw as u32);
    if worker.get() >= MAX_WORKERS {
        return Err(ItercheckError::WorkerIdOverflow { worker });
    }
    Ok(worker)
}

#[inline]
fn has_opcode(payload: &[u8], opcode: &[u8]) -> bool {
    payload.len() >= opcode.len() && &payload[..opcode.len()] == opcode
}

fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let bytes = buf.get(offset..offset + N)?;
    bytes.try_into().ok()
}

/// Native-endian i32 at a fixed payload offset; out-of-bounds reads decode
/// as 0 (bounds-limited field read, never a panic).
fn read_i32(payload: &[u8], offset: usize) -> i32 {
    read_array::<4>(payload, offset).map_or(0, i32::from_ne_bytes)
}

/// Native-endian pointer-sized value at a fixed payload offset.
fn read_u64(payload: &[u8], offset: usize) -> u64 {
    read_array::<8>(payload, offset).map_or(0, u64::from_ne_bytes)
}

fn opcode_preview(payload: &[u8]) -> String {
    payload
        .iter()
        .take(UNKNOWN_OPCODE_PREVIEW)
        .take_while(|&&b| b != 0 && (b.is_ascii_graphic() || b == b' '))
        .map(|&b| b as char)
        .collect()
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Build the wire image of a command object.
///
/// This is what an instrumented runtime (or the test harness) writes into
/// its own memory to signal the detector. Round-trips through [`decode`].
#[must_use]
pub fn encode(command: &Command) -> [u8; CMD_TOTAL_SIZE] {
    let mut image = [0u8; CMD_TOTAL_SIZE];
    image[..CMD_MAGIC_SIZE].copy_from_slice(&CMD_MAGIC.to_ne_bytes());
    image[CMD_MAGIC_SIZE..CMD_PAYLOAD_OFFSET].copy_from_slice(&CMD_MARKER);

    let payload = &mut image[CMD_PAYLOAD_OFFSET..];
    match command {
        Command::BeginFor => write_opcode(payload, b"begin_for"),
        Command::EndFor => write_opcode(payload, b"end_for"),
        Command::Iter { iteration } => {
            write_opcode(payload, b"iter");
            payload[INT_ARG_OFFSET..INT_ARG_OFFSET + 4].copy_from_slice(&iteration.to_ne_bytes());
        }
        Command::Done { iteration } => {
            write_opcode(payload, b"done");
            payload[INT_ARG_OFFSET..INT_ARG_OFFSET + 4].copy_from_slice(&iteration.to_ne_bytes());
        }
        Command::Worker { worker } => {
            write_opcode(payload, b"thrd");
            let raw = worker.get() as i32;
            payload[INT_ARG_OFFSET..INT_ARG_OFFSET + 4].copy_from_slice(&raw.to_ne_bytes());
        }
        Command::StackBase { base } => {
            write_opcode(payload, b"stackbot");
            payload[PTR_ARG_OFFSET..PTR_ARG_OFFSET + 8]
                .copy_from_slice(&base.get().to_ne_bytes());
        }
    }
    image
}

fn write_opcode(payload: &mut [u8], opcode: &[u8]) {
    payload[..opcode.len()].copy_from_slice(opcode);
}
