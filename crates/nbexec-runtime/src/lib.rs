//! # nbexec-runtime — kernel session runtime
//!
//! Drives one kernel through its lifecycle and turns submitted cells into
//! correlated, ordered execution event streams.
//!
//! - [`lifecycle`] — the kernel status state machine
//! - [`correlator`] — per-request filtering of the inbound stream
//! - [`execution`] — execution events, handles, and the per-execution task
//! - [`session`] — the per-kernel session task and its [`KernelHandle`]

pub mod config;
pub mod correlator;
pub mod execution;
pub mod lifecycle;
pub mod session;

pub use config::RuntimeConfig;
pub use correlator::{correlate, is_terminal_reply};
pub use execution::{ExecutionEvent, ExecutionHandle, ExecutionOutcome, ExecutionSummary};
pub use lifecycle::{Lifecycle, Transition};
pub use session::{KernelHandle, KernelSession, KernelSnapshot};
