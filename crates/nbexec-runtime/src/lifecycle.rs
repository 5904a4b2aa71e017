//! Kernel lifecycle state machine.
//!
//! ```text
//! not_connected -> starting -> idle <-> busy
//!                     |          ^       |
//!                     +--> interrupting <+
//! restarting  <- any live state, then -> starting
//! dead        <- any state (terminal)
//! ```
//!
//! Requests that target the current state are no-ops. Anything attempted
//! from `dead` is rejected.

use nbexec_protocol::{ExecutionState, KernelError, KernelResult, KernelStatus};
use tracing::info;

/// Result of a lifecycle request that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: KernelStatus, to: KernelStatus },
    Unchanged(KernelStatus),
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }

    pub fn status(&self) -> KernelStatus {
        match self {
            Self::Changed { to, .. } => *to,
            Self::Unchanged(status) => *status,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    status: KernelStatus,
    execution_count: Option<u32>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> KernelStatus {
        self.status
    }

    /// Last execution counter the kernel reported.
    pub fn execution_count(&self) -> Option<u32> {
        self.execution_count
    }

    pub fn observe_execution_count(&mut self, execution_count: u32) {
        self.execution_count = Some(execution_count);
    }

    /// Transport attached.
    pub fn connect(&mut self) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::NotConnected => Ok(self.move_to(KernelStatus::Starting)),
            KernelStatus::Starting => Ok(Transition::Unchanged(self.status)),
            _ => self.reject(KernelStatus::Starting),
        }
    }

    /// A `status` broadcast arrived.
    ///
    /// The first busy/idle report moves `starting` to `idle`. After a
    /// restart, any report means the kernel is back and moves to
    /// `starting`; callers filter out reports caused by the restart request
    /// itself. Reports in other states do not drive the machine; busy
    /// and idle there follow execution activation and completion.
    pub fn report_status(&mut self, state: ExecutionState) -> KernelResult<Transition> {
        match (self.status, state) {
            (KernelStatus::Dead, _) => self.reject(self.status),
            (KernelStatus::Starting, ExecutionState::Busy | ExecutionState::Idle) => {
                Ok(self.move_to(KernelStatus::Idle))
            }
            (KernelStatus::Restarting, ExecutionState::Dead) => {
                Ok(Transition::Unchanged(self.status))
            }
            (KernelStatus::Restarting, _) => Ok(self.restarted_unchecked()),
            _ => Ok(Transition::Unchanged(self.status)),
        }
    }

    /// An execution was accepted by the kernel.
    pub fn activate(&mut self) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::Idle => Ok(self.move_to(KernelStatus::Busy)),
            KernelStatus::Busy => Ok(Transition::Unchanged(self.status)),
            _ => self.reject(KernelStatus::Busy),
        }
    }

    /// The active execution ended (reply observed or tracking cancelled).
    pub fn complete(&mut self) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::Busy | KernelStatus::Interrupting => Ok(self.move_to(KernelStatus::Idle)),
            KernelStatus::Idle => Ok(Transition::Unchanged(self.status)),
            _ => self.reject(KernelStatus::Idle),
        }
    }

    pub fn interrupt(&mut self) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::Busy | KernelStatus::Starting => {
                Ok(self.move_to(KernelStatus::Interrupting))
            }
            KernelStatus::Interrupting => Ok(Transition::Unchanged(self.status)),
            _ => self.reject(KernelStatus::Interrupting),
        }
    }

    /// The kernel acknowledged an interrupt. `still_running` tells whether
    /// an execution is still active afterwards. A late acknowledgement
    /// outside `interrupting` changes nothing.
    pub fn acknowledge_interrupt(&mut self, still_running: bool) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::Interrupting if still_running => Ok(self.move_to(KernelStatus::Busy)),
            KernelStatus::Interrupting => Ok(self.move_to(KernelStatus::Idle)),
            KernelStatus::Dead => self.reject(self.status),
            _ => Ok(Transition::Unchanged(self.status)),
        }
    }

    pub fn restart(&mut self) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::Dead => self.reject(KernelStatus::Restarting),
            KernelStatus::Restarting => Ok(Transition::Unchanged(self.status)),
            _ => {
                self.execution_count = None;
                Ok(self.move_to(KernelStatus::Restarting))
            }
        }
    }

    /// The kernel confirmed the restart.
    pub fn restarted(&mut self) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::Restarting => Ok(self.restarted_unchecked()),
            KernelStatus::Starting => Ok(Transition::Unchanged(self.status)),
            _ => self.reject(KernelStatus::Starting),
        }
    }

    /// Explicit shutdown or transport loss.
    pub fn shutdown(&mut self) -> KernelResult<Transition> {
        match self.status {
            KernelStatus::Dead => self.reject(KernelStatus::Dead),
            _ => Ok(self.move_to(KernelStatus::Dead)),
        }
    }

    fn restarted_unchecked(&mut self) -> Transition {
        self.move_to(KernelStatus::Starting)
    }

    fn move_to(&mut self, to: KernelStatus) -> Transition {
        let from = self.status;
        self.status = to;
        info!(%from, %to, "kernel status changed");
        Transition::Changed { from, to }
    }

    fn reject(&self, to: KernelStatus) -> KernelResult<Transition> {
        Err(KernelError::InvalidTransition {
            from: self.status,
            to,
        })
    }
}
