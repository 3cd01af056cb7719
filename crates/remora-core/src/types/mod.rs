//! # Types
//!
//! Platform-agnostic types shared by the session, layout registry and resolver.
//!
//! These keep foreign values (addresses, PIDs, thread handles) out of the host's own pointer
//! and integer types so they cannot be mixed up with sizes, counts or host pointers.

pub mod address;
pub mod process;

pub use address::Address;
pub use process::{AttachState, MemoryRange, ProcessId, TargetOs, ThreadId, WordSize};
