//! # Mach API Errors
//!
//! `kern_return_t` codes as a Rust enum, and their mapping onto the shared error taxonomy.

use thiserror::Error;

use crate::error::{AccessError, AttachError};
use crate::types::{Address, ProcessId};

/// Mach kernel API error
///
/// Common `kern_return_t` values:
///
/// - `KERN_SUCCESS` (0): Operation succeeded
/// - `KERN_INVALID_ADDRESS` (1): Address not mapped in the target
/// - `KERN_PROTECTION_FAILURE` (2): Protection (or permission) failure
/// - `KERN_INVALID_ARGUMENT` (4): Invalid argument
/// - `KERN_FAILURE` (5): General failure (often means process not found)
///
/// ## References
///
/// - [kern_return_t documentation](https://developer.apple.com/documentation/kernel/kern_return_t)
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachError
{
    /// `KERN_INVALID_ADDRESS`
    #[error("KERN_INVALID_ADDRESS: Address not mapped")]
    InvalidAddress,

    /// `KERN_PROTECTION_FAILURE`
    ///
    /// `task_for_pid()` needs root or the `com.apple.security.cs.debugger` entitlement; System
    /// Integrity Protection blocks it for platform binaries regardless.
    ///
    /// See: [macOS Debugging Entitlements](https://developer.apple.com/documentation/bundleresources/entitlements/com.apple.security.cs.debugger)
    #[error("KERN_PROTECTION_FAILURE: Permission denied")]
    ProtectionFailure,

    /// `KERN_INVALID_ARGUMENT`
    #[error("KERN_INVALID_ARGUMENT: Invalid PID or argument")]
    InvalidArgument,

    /// `KERN_FAILURE`
    ///
    /// Usually the process is gone. `task_for_pid()` also returns it for permission problems;
    /// attach checks with `kill(pid, 0)` to tell the two apart.
    #[error("KERN_FAILURE: Process not found")]
    ProcessNotFound,

    /// Any other code, preserved for lookup
    #[error("Unknown Mach error: {0}")]
    Unknown(i32),
}

impl From<libc::kern_return_t> for MachError
{
    fn from(code: libc::kern_return_t) -> Self
    {
        match code {
            libc::KERN_INVALID_ADDRESS => MachError::InvalidAddress,
            libc::KERN_PROTECTION_FAILURE => MachError::ProtectionFailure,
            libc::KERN_INVALID_ARGUMENT => MachError::InvalidArgument,
            libc::KERN_FAILURE => MachError::ProcessNotFound,
            _ => MachError::Unknown(code),
        }
    }
}

impl MachError
{
    /// Memory transfer failure at `address`
    pub fn into_access(self, address: Address, len: usize) -> AccessError
    {
        match self {
            MachError::ProcessNotFound => AccessError::TargetExited,
            _ => AccessError::Denied { address, len },
        }
    }

    /// Attach failure for `pid`
    pub fn into_attach(self, pid: ProcessId) -> AttachError
    {
        match self {
            MachError::ProcessNotFound | MachError::InvalidArgument => AttachError::NoSuchProcess(pid),
            MachError::ProtectionFailure => AttachError::PermissionDenied {
                pid,
                reason: self.to_string(),
            },
            _ => AttachError::Platform {
                pid,
                reason: self.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_kern_return_mapping()
    {
        assert_eq!(MachError::from(libc::KERN_PROTECTION_FAILURE), MachError::ProtectionFailure);
        assert_eq!(MachError::from(libc::KERN_FAILURE), MachError::ProcessNotFound);
        assert_eq!(MachError::from(9999), MachError::Unknown(9999));
        assert_eq!(
            MachError::ProcessNotFound.into_access(Address::new(0x1000), 4),
            AccessError::TargetExited
        );
    }
}
