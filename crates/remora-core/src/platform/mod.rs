//! # Platform-Specific Implementations
//!
//! Native [`ProcessControl`](crate::control::ProcessControl) backends.
//!
//! - **Linux**: `ptrace` for stop/continue and word writes, `/proc/<pid>/mem` for reads
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - **macOS**: Mach task and thread ports (`task_for_pid`, `thread_suspend`, `vm_write`)
//!   - See: [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//!
//! Only one backend is compiled, selected by `target_os`.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;
