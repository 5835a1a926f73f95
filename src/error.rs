//! Error taxonomy for the delay accounting engine
//!
//! The engine favors availability: accounting inconsistencies degrade to
//! diagnostics (see `tracker`), and only construction and control-surface
//! failures surface as typed errors.

use thiserror::Error;

/// Errors returned by the delay accounting engine
#[derive(Debug, Error)]
pub enum DelayError {
    /// The per-CPU counter block for a new domain could not be allocated.
    ///
    /// Domain construction is all-or-nothing: on this error no partially
    /// initialized domain has been exposed, and the caller owns rollback of
    /// any containment node it was building around the domain.
    #[error("failed to allocate per-CPU counter block for delay domain")]
    Allocation,

    /// A control directive was not one of `0`, `1` or `2`.
    #[error("invalid tracking control directive {0:?} (expected \"0\", \"1\" or \"2\")")]
    InvalidControl(String),

    /// A task was registered on a CPU the tracker was not sized for.
    #[error("cpu {cpu} out of range (tracker covers {nr_cpus} cpus)")]
    UnknownCpu { cpu: usize, nr_cpus: usize },
}
