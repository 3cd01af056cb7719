//! # Error Types
//!
//! Error handling for sessions, layouts and the command channel.
//!
//! Each concern gets its own `thiserror` enum so callers can tell a recoverable configuration
//! gap (a layout without an optional definition) from a fatal condition (no target process)
//! by type rather than by message. [`RemoraError`] wraps all of them for code that only
//! needs to propagate.

use thiserror::Error;

use crate::types::{Address, ProcessId};

/// Failure to establish a session
#[derive(Error, Debug)]
pub enum AttachError
{
    /// Another session from the same locator is still attached
    ///
    /// Only one session may be attached at a time. Detach (or drop) the existing session
    /// before attaching again.
    #[error("A session is already attached (PID {0})")]
    AlreadyAttached(ProcessId),

    /// The OS refused the debug attach
    ///
    /// On Linux this is `EPERM` from `PTRACE_ATTACH` (Yama `ptrace_scope`, a different user,
    /// or another tracer already attached). On macOS `task_for_pid()` needs root or the
    /// debugger entitlement.
    #[error("Permission denied attaching to PID {pid}: {reason}")]
    PermissionDenied
    {
        pid: ProcessId,
        reason: String,
    },

    /// The process does not exist (or exited before the attach completed)
    #[error("Process not found: PID {0}")]
    NoSuchProcess(ProcessId),

    /// Any other OS failure while attaching
    #[error("Failed to attach to PID {pid}: {reason}")]
    Platform
    {
        pid: ProcessId,
        reason: String,
    },
}

/// Failure to read or write target memory
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError
{
    /// The OS rejected the transfer outright (unmapped page, protection, bad address)
    #[error("Access denied at {address} ({len} bytes)")]
    Denied
    {
        address: Address,
        len: usize,
    },

    /// The target died while the operation was in progress
    ///
    /// The owning session detaches itself when it sees this; `is_attached()` is `false`
    /// afterwards.
    #[error("Target process exited")]
    TargetExited,

    /// The OS transferred some bytes and then could make no further progress
    #[error("Partial transfer at {address}: {transferred} of {requested} bytes")]
    PartialTransfer
    {
        address: Address,
        requested: usize,
        transferred: usize,
    },

    /// The session has been detached
    #[error("Not attached to a process")]
    NotAttached,

    /// A foreign header decoded to values no real object can have
    ///
    /// Examples: a string length beyond the configured maximum, an array whose `finish`
    /// precedes its `start`, a zero element size.
    #[error("Implausible {what} at {address}")]
    Implausible
    {
        address: Address,
        what: String,
    },
}

/// Kind of layout entry a lookup asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind
{
    Address,
    Offset,
    Numeric,
    String,
    Group,
}

impl std::fmt::Display for DefinitionKind
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.write_str(match self {
            DefinitionKind::Address => "address",
            DefinitionKind::Offset => "offset",
            DefinitionKind::Numeric => "numeric",
            DefinitionKind::String => "string",
            DefinitionKind::Group => "group",
        })
    }
}

/// Why a definition could not be produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingReason
{
    /// The key is not known to this layout at all.
    Absent,
    /// The key is declared but no value was recorded for this build.
    Unset,
    /// The key is declared and explicitly marked unusable for this build.
    Invalid,
}

impl MissingReason
{
    fn describe(self) -> &'static str
    {
        match self {
            MissingReason::Absent => "not defined",
            MissingReason::Unset => "declared but not set",
            MissingReason::Invalid => "marked invalid",
        }
    }
}

/// A layout lookup miss
///
/// Never defaulted to zero: a reader that needs an offset the current build does not define
/// must fail its own initialisation instead of reading from a bogus location.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} `{key}` is {}", .reason.describe())]
pub struct MissingDefinition
{
    pub kind: DefinitionKind,
    /// Full key path, e.g. `string/MSVC/buffer`.
    pub key: String,
    pub reason: MissingReason,
}

impl MissingDefinition
{
    pub fn absent(kind: DefinitionKind, key: impl Into<String>) -> Self
    {
        Self {
            kind,
            key: key.into(),
            reason: MissingReason::Absent,
        }
    }
}

/// No known layout matches the executable image of a process
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No known layout for PID {pid} (fingerprint {fingerprint})")]
pub struct LayoutMismatch
{
    pub pid: ProcessId,
    pub fingerprint: String,
}

/// Command channel failure
#[derive(Error, Debug)]
pub enum ChannelError
{
    /// The companion stopped answering and the target is gone
    #[error("Companion extension is gone")]
    PeerGone,

    /// The configured spin limit ran out before the control word changed
    #[error("Command {0:#010x} timed out")]
    Timeout(u32),

    /// The companion speaks a different protocol version
    #[error("Companion protocol version {found}, expected {expected}")]
    VersionMismatch
    {
        expected: u32,
        found: u32,
    },

    /// A request does not fit in the payload area
    #[error("Request of {len} bytes exceeds channel payload of {capacity} bytes")]
    PayloadTooLarge
    {
        len: usize,
        capacity: usize,
    },

    /// The companion rejected a core request (read/write/acquire)
    #[error("Companion reported a fault for command {0:#010x}")]
    Fault(u32),

    /// A string for the companion contains a NUL, which would end it early
    #[error("String for {0} contains a NUL byte")]
    EmbeddedNul(Address),

    /// The region cannot hold the described header, payload or client slot
    #[error("Invalid channel layout: {0}")]
    Layout(String),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Definition(#[from] MissingDefinition),
}

/// Umbrella error for code that only propagates
#[derive(Error, Debug)]
pub enum RemoraError
{
    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Definition(#[from] MissingDefinition),

    #[error(transparent)]
    Mismatch(#[from] LayoutMismatch),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Failed to stop the target
    ///
    /// Returned as-is; the caller's polling loop decides whether to retry.
    #[error("Failed to suspend process: {0}")]
    SuspendFailed(String),

    /// Failed to let the target run again
    #[error("Failed to resume process: {0}")]
    ResumeFailed(String),

    /// Invalid argument passed to an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// macOS-specific Mach API error
    #[cfg(target_os = "macos")]
    #[error("Mach API error: {0}")]
    MachError(#[from] crate::platform::macos::error::MachError),

    /// I/O error (procfs, image files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoraError
{
    /// `true` when the error means the target is gone
    pub fn is_target_exit(&self) -> bool
    {
        matches!(
            self,
            RemoraError::Access(AccessError::TargetExited) | RemoraError::Channel(ChannelError::PeerGone)
        )
    }
}

/// Convenience type alias for `Result<T, RemoraError>`
///
/// ```rust
/// use remora_core::error::RemoraResult;
/// fn foo() -> RemoraResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type RemoraResult<T> = std::result::Result<T, RemoraError>;
