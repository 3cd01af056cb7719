//! # Mach API FFI Declarations
//!
//! `extern "C"` declarations for the Mach calls the `mach2` crate does not provide. They need
//! root or debugging entitlements, which is why the standard bindings leave them out.
//!
//! Everything here is wrapped by the safe functions in [`task`](super::task) and
//! [`memory`](super::memory).
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [XNU Kernel Source](https://github.com/apple-oss-distributions/xnu)

// Allow doc comments in extern blocks
#![allow(unused_doc_comments)]

use libc::{c_int, kern_return_t, mach_msg_type_number_t, mach_port_t, thread_act_t, vm_address_t, vm_map_t, vm_offset_t, vm_size_t};

#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Get the task port of a process by PID
    ///
    /// Requires root or the debugger entitlement; returns `KERN_FAILURE` (not
    /// `KERN_PROTECTION_FAILURE`) in some denial cases.
    ///
    /// Not publicly documented; see `osfmk/kern/task.c` in the XNU sources.
    pub fn task_for_pid(target_task: mach_port_t, pid: c_int, task: *mut mach_port_t) -> kern_return_t;

    /// Release a port right obtained from `task_for_pid()` or `task_threads()`
    ///
    /// See: [mach_port_deallocate](https://developer.apple.com/documentation/kernel/1578777-mach_port_deallocate/)
    pub fn mach_port_deallocate(target_task: mach_port_t, name: mach_port_t) -> kern_return_t;

    /// Increment a thread's suspend count
    ///
    /// See: [thread_suspend](https://developer.apple.com/documentation/kernel/1402804-thread_suspend/)
    pub fn thread_suspend(target_act: thread_act_t) -> kern_return_t;

    /// Decrement a thread's suspend count; fails once the count is already zero
    ///
    /// See: [thread_resume](https://developer.apple.com/documentation/kernel/1402806-thread_resume/)
    pub fn thread_resume(target_act: thread_act_t) -> kern_return_t;

    /// Copy `data_count` bytes from our address space into the task
    ///
    /// See: [vm_write](https://developer.apple.com/documentation/kernel/1585462-vm_write/)
    pub fn vm_write(target_task: vm_map_t, address: vm_address_t, data: vm_offset_t, data_count: mach_msg_type_number_t)
        -> kern_return_t;

    /// Free memory the kernel allocated in our address space (thread arrays)
    ///
    /// See: [vm_deallocate](https://developer.apple.com/documentation/kernel/1585284-vm_deallocate/)
    pub fn vm_deallocate(target_task: vm_map_t, address: vm_address_t, size: vm_size_t) -> kern_return_t;
}
