//! Error taxonomy for the itercheck race detector.
//!
//! The taxonomy is deliberately narrow. Detected races and protocol
//! violations are *diagnostics*, not errors: they are delivered through the
//! monitor's sink and the hooks still return `Ok`, because detection must
//! never alter the monitored program's behavior. The only `Err`-producing
//! class is the invariant violation: a state the detector must not continue
//! from, since its entire value is the correctness of its verdicts.

use itercheck_types::{VirtAddr, WorkerId, ADDR_BITS, MAX_DATA_SIZE, MAX_WORKERS};
use thiserror::Error;

/// Primary error type for itercheck operations.
///
/// Every variant is fatal to the detector (though never to the monitored
/// program — the host decides how to wind the process down).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItercheckError {
    /// An address outside the supported virtual range reached the shadow
    /// table. Continuing would silently alias distinct addresses.
    #[error("address {addr} exceeds the supported {}-bit range", ADDR_BITS)]
    AddressOutOfRange {
        /// The offending address.
        addr: VirtAddr,
    },

    /// The host delivered a data access outside the supported size bounds.
    #[error("access size {size} outside supported range 1..={}", MAX_DATA_SIZE)]
    AccessSizeOutOfRange {
        /// The delivered size in bytes.
        size: usize,
    },

    /// A `thrd` command announced a worker id that cannot fit the byte-wide
    /// owner encoding. Wrapping would mis-attribute ownership, so this
    /// fails fast instead.
    #[error("worker id {worker} exceeds MAX_WORKERS ({})", MAX_WORKERS)]
    WorkerIdOverflow {
        /// The announced worker id.
        worker: WorkerId,
    },

    /// A `thrd` command carried a negative worker argument.
    #[error("worker id argument {raw} is negative")]
    NegativeWorkerId {
        /// The raw decoded argument.
        raw: i32,
    },

    /// Catch-all for internal state the detector cannot reconcile.
    #[error("internal invariant violated: {detail}")]
    Invariant {
        /// What was observed.
        detail: String,
    },
}

impl ItercheckError {
    /// Construct an [`ItercheckError::Invariant`].
    #[must_use]
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant {
            detail: detail.into(),
        }
    }

    /// Whether the detector must stop rather than continue issuing verdicts.
    ///
    /// Currently always `true`; the method exists so call sites read as a
    /// policy decision rather than an assumption.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Process exit code for hosts that surface detector failure as their
    /// own exit status.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AddressOutOfRange { .. } | Self::AccessSizeOutOfRange { .. } => 3,
            Self::WorkerIdOverflow { .. } | Self::NegativeWorkerId { .. } => 4,
            Self::Invariant { .. } => 2,
        }
    }
}

/// Convenience alias used across the itercheck crates.
pub type Result<T> = std::result::Result<T, ItercheckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = ItercheckError::AddressOutOfRange {
            addr: VirtAddr::new(1 << 48),
        };
        assert_eq!(
            err.to_string(),
            "address 0x1000000000000 exceeds the supported 48-bit range"
        );

        let err = ItercheckError::WorkerIdOverflow {
            worker: WorkerId::new(600),
        };
        assert_eq!(err.to_string(), "worker id 600 exceeds MAX_WORKERS (255)");

        let err = ItercheckError::invariant("page table slot points past arena");
        assert_eq!(
            err.to_string(),
            "internal invariant violated: page table slot points past arena"
        );
    }

    #[test]
    fn classification() {
        let err = ItercheckError::AccessSizeOutOfRange { size: 0 };
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 3);
        assert_eq!(ItercheckError::invariant("x").exit_code(), 2);
        assert_eq!(
            ItercheckError::NegativeWorkerId { raw: -1 }.exit_code(),
            4
        );
    }
}
