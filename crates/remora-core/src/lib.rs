//! # remora-core
//!
//! Attach to a running native program, read and write its memory, and make sense of what is
//! there.
//!
//! This crate provides:
//! - [`Locator`]: finds running targets by fingerprinting their executable image and picks
//!   the matching [`LayoutDescriptor`]
//! - [`Session`]: the one attached connection, with suspend/resume and typed memory access
//! - [`abi`]: decoding of the target's standard-library strings and arrays
//! - [`resolver`]: runtime type identification through dispatch tables and RTTI
//! - [`channel`]: an optional mailbox fast path to a companion extension in the target
//!
//! ## Platform Support
//!
//! - **Linux**: `ptrace` plus `/proc/<pid>/mem`; wine-wrapped Windows targets through the
//!   launcher's memory file
//! - **macOS**: Mach task and thread ports (`task_for_pid`, `thread_suspend`, `vm_write`)
//!
//! Layouts, the decoder and the resolver are platform-independent and run over any
//! [`MemoryRead`], including the in-memory target in `mock`.
//!
//! ## Features
//!
//! - `mock`: exports `mock::MockProcess` and `mock::MockCompanion`, test doubles for a target
//!   and for the companion on the far side of a channel
//!
//! ## Why unsafe code is needed
//!
//! Attaching, stopping and poking another process goes through raw system calls (`ptrace`,
//! `waitpid`, Mach traps). Each call is wrapped in a safe function that checks its result and
//! converts failures into the error types in [`error`].

#![allow(unsafe_code)] // Required for ptrace and Mach calls

pub mod abi;
pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod layout;
pub mod locator;
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod platform;
pub mod resolver;
pub mod rtti;
pub mod session;
pub mod types;

pub use channel::CommandChannel;
pub use config::CoreConfig;
pub use control::ProcessControl;
// Re-export commonly used types
pub use error::{RemoraError, RemoraResult};
pub use layout::LayoutDescriptor;
pub use locator::{Candidate, Locator};
pub use memory::{MemoryRead, MemoryWrite};
pub use resolver::TypeResolver;
pub use session::{Session, SessionMemory};
pub use types::{Address, ProcessId};
