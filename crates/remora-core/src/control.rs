//! # Process Control Trait
//!
//! Platform-agnostic interface over the OS debugging facility.
//!
//! A [`ProcessControl`] owns the OS handle to exactly one target process. It knows how to
//! attach, stop, continue and detach, and how to move bytes in and out of the target (through
//! its [`MemoryRead`] / [`MemoryWrite`] supertraits). It does not know about layouts, types
//! or the one-session rule; [`Session`](crate::Session) layers those on top.
//!
//! ## Platform Implementations
//!
//! - **Linux**: [`LinuxProcess`](crate::platform::linux::LinuxProcess) (`ptrace` + `/proc/<pid>/mem`)
//! - **macOS**: [`MacProcess`](crate::platform::macos::MacProcess) (Mach task and thread ports)
//! - **Tests**: `mock::MockProcess` (in-memory, behind the `mock` feature)

use std::path::Path;

use crate::error::{AttachError, RemoraResult};
use crate::memory::{MemoryRead, MemoryWrite};
use crate::types::{MemoryRange, ProcessId, ThreadId};

/// OS-level control over one target process
///
/// ## Errors
///
/// Suspend/resume failures are returned to the caller unchanged; implementations do not
/// retry beyond waiting for the stop they requested. A target that died surfaces as
/// [`AccessError::TargetExited`](crate::error::AccessError::TargetExited).
pub trait ProcessControl: MemoryRead + MemoryWrite
{
    /// PID of the target
    fn pid(&self) -> ProcessId;

    /// Acquire the OS handle and stop the target
    ///
    /// On success the target is stopped. Calling `attach` twice on the same handle is a
    /// no-op.
    fn attach(&mut self) -> Result<(), AttachError>;

    /// Release the OS handle, letting the target run
    fn detach(&mut self) -> RemoraResult<()>;

    /// Stop the target and block until the OS confirms the stop
    fn suspend(&mut self) -> RemoraResult<()>;

    /// Ask the target to stop without waiting for confirmation
    ///
    /// Follow up with [`poll_suspended`](ProcessControl::poll_suspended).
    fn request_suspend(&mut self) -> RemoraResult<()>;

    /// Non-blocking check for a stop requested by [`request_suspend`](ProcessControl::request_suspend)
    ///
    /// Returns `true` once the target is stopped.
    fn poll_suspended(&mut self) -> RemoraResult<bool>;

    /// Let a stopped target run again
    fn resume(&mut self) -> RemoraResult<()>;

    /// Resume the target even if this handle believes it is already running
    ///
    /// Used to recover when the believed state and the OS state have drifted apart, for
    /// example after another tool stopped the process.
    fn force_resume(&mut self) -> RemoraResult<()>;

    /// Whether the target process still exists
    fn is_alive(&self) -> bool;

    /// Current mappings of the target address space
    fn memory_ranges(&self) -> RemoraResult<Vec<MemoryRange>>;

    /// Threads of the target
    fn thread_ids(&self) -> RemoraResult<Vec<ThreadId>>;
}

/// Stop bookkeeping for backends that stop the target with a signal
///
/// A stop signal sent while an earlier one is still undelivered stays queued and stops the
/// target again right after the next resume. At most one request is therefore outstanding:
/// [`request`](StopTracker::request) answers whether a new signal is needed, and a pending
/// request is completed by waiting, not by signalling again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopTracker
{
    stopped: bool,
    requested: bool,
}

impl StopTracker
{
    /// Whether the target sits in a stop we caused
    pub fn is_stopped(self) -> bool
    {
        self.stopped
    }

    /// Whether a stop was signalled but not yet observed
    pub fn is_pending(self) -> bool
    {
        self.requested && !self.stopped
    }

    /// Record a stop request; `true` when a signal has to be sent for it
    pub fn request(&mut self) -> bool
    {
        if self.stopped || self.requested {
            return false;
        }
        self.requested = true;
        true
    }

    /// The signal for the last request could not be sent
    pub fn cancel(&mut self)
    {
        self.requested = false;
    }

    /// The target reported the stop
    pub fn mark_stopped(&mut self)
    {
        self.stopped = true;
        self.requested = false;
    }

    /// The target was let go
    pub fn mark_resumed(&mut self)
    {
        self.stopped = false;
    }
}

/// Create the native [`ProcessControl`] for the current host
///
/// `memory_file` overrides the memory interface the Linux backend opens (the wrapped-image
/// probe reports the launcher's `/proc/<pid>/mem`); other platforms ignore it.
///
/// ## Example
///
/// ```rust,no_run
/// use remora_core::control::create_control;
/// use remora_core::types::ProcessId;
///
/// let mut control = create_control(ProcessId::from(12345), None)?;
/// control.attach()?;
/// # Ok::<(), remora_core::error::RemoraError>(())
/// ```
///
/// ## Errors
///
/// Returns `InvalidArgument` on hosts without a process backend.
#[allow(unused_variables)]
pub fn create_control(pid: ProcessId, memory_file: Option<&Path>) -> RemoraResult<Box<dyn ProcessControl>>
{
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(crate::platform::linux::LinuxProcess::new(pid, memory_file)))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(crate::platform::macos::MacProcess::new(pid)))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(crate::error::RemoraError::InvalidArgument(format!(
            "no process backend for this platform (PID {pid})"
        )))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_one_signal_per_stop()
    {
        let mut stops = StopTracker::default();
        assert!(stops.request());
        assert!(stops.is_pending());
        // A second request while the first is undelivered must not signal again.
        assert!(!stops.request());

        stops.mark_stopped();
        assert!(stops.is_stopped());
        assert!(!stops.is_pending());
        assert!(!stops.request());

        stops.mark_resumed();
        assert!(stops.request());
    }

    #[test]
    fn test_cancelled_request_can_be_retried()
    {
        let mut stops = StopTracker::default();
        assert!(stops.request());
        stops.cancel();
        assert!(!stops.is_pending());
        assert!(stops.request());
    }
}
