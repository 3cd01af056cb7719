//! # macOS Backend
//!
//! [`ProcessControl`](crate::control::ProcessControl) over Mach ports.
//!
//! macOS has no `ptrace`-style attach. A debugger holds the target's **task** port (from
//! `task_for_pid()`) and talks to its **thread** ports directly:
//!
//! - **Suspend/Resume**: `thread_suspend()` / `thread_resume()` on each thread
//! - **Memory**: `mach_vm_read_overwrite()`, `vm_write()`, `mach_vm_region_recurse()`
//!
//! ## Dependencies
//!
//! - **mach2 crate**: `mach_task_self`, `task_threads`, `mach_vm_*`, `KERN_SUCCESS`
//! - **libc crate**: type definitions (`mach_port_t`, `thread_act_t`, ...)
//! - **extern "C"**: restricted functions not in mach2 (`task_for_pid`, `thread_suspend`, `vm_write`)
//! - **libproc crate**: process enumeration for the locator
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [task_for_pid(3) man page](https://developer.apple.com/library/archive/documentation/Darwin/Reference/ManPages/man3/task_for_pid.3.html)

pub mod error;
pub mod ffi;
pub mod memory;
pub mod task;

pub use task::MacProcess;
