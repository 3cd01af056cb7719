//! # Mach Task Control
//!
//! [`MacProcess`]: a target process held through its Mach task port.
//!
//! Suspension works per thread. Every thread of the task gets its own `thread_suspend()`
//! and the ports we suspended are remembered so `resume()` undoes exactly those. A thread
//! started while the task is suspended keeps running; call `suspend()` again to catch it.
//!
//! ## Mach API: task_threads()
//!
//! ```c
//! kern_return_t task_threads(
//!     task_t target_task,           // Task port from task_for_pid()
//!     thread_act_array_t *act_list, // Output: array of thread ports
//!     mach_msg_type_number_t *count // Output: number of threads
//! );
//! ```
//!
//! The array is allocated in our address space and must be freed with `vm_deallocate()`.
//! Each entry is a send right we now own: a port we keep in the suspended set is released
//! after its `thread_resume()`, every other one as soon as we are done with it.
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - [XNU Kernel Source](https://github.com/apple-oss-distributions/xnu) (for `task_for_pid` and `task_threads` implementation)

use std::mem;

use libc::{c_int, mach_msg_type_number_t, mach_port_t, thread_act_t, vm_address_t, vm_size_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::task::task_threads;
use mach2::traps::mach_task_self;
use tracing::{debug, warn};

use super::error::MachError;
use super::{ffi, memory};
use crate::control::ProcessControl;
use crate::error::{AccessError, AttachError, RemoraError, RemoraResult};
use crate::memory::{MemoryRead, MemoryWrite};
use crate::types::{Address, MemoryRange, ProcessId, ThreadId};

/// A target process controlled through Mach ports
///
/// Not thread-safe. Use from a single thread or wrap in `Mutex`.
#[derive(Debug)]
pub struct MacProcess
{
    pid: ProcessId,
    /// Task port from `task_for_pid()`; 0 while detached.
    task: mach_port_t,
    /// Threads we hold a suspend count and a send right on.
    suspended: Vec<thread_act_t>,
}

impl MacProcess
{
    pub fn new(pid: ProcessId) -> Self
    {
        Self {
            pid,
            task: 0,
            suspended: Vec::new(),
        }
    }

    fn ensure_attached(&self) -> Result<(), AccessError>
    {
        if self.task == 0 {
            Err(AccessError::NotAttached)
        } else {
            Ok(())
        }
    }

    /// Current thread ports of the task
    fn threads(&self) -> RemoraResult<ThreadPorts>
    {
        self.ensure_attached()?;
        ThreadPorts::list(self.task).map_err(|code| self.mach_failure(code))
    }

    fn mach_failure(&self, code: libc::kern_return_t) -> RemoraError
    {
        if !self.is_alive() {
            return AccessError::TargetExited.into();
        }
        MachError::from(code).into()
    }
}

/// Send rights returned by `task_threads()`, released on drop unless taken
#[derive(Debug)]
struct ThreadPorts(Vec<thread_act_t>);

impl ThreadPorts
{
    #[allow(unsafe_code)]
    fn list(task: mach_port_t) -> Result<Self, libc::kern_return_t>
    {
        unsafe {
            let mut threads: *mut thread_act_t = std::ptr::null_mut();
            let mut count: mach_msg_type_number_t = 0;
            let result = task_threads(task, &mut threads, &mut count);
            if result != KERN_SUCCESS {
                return Err(result);
            }
            let ports = if threads.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(threads, count as usize).to_vec()
            };
            deallocate_threads_array(threads, count);
            Ok(Self(ports))
        }
    }

    fn iter(&self) -> impl Iterator<Item = thread_act_t> + '_
    {
        self.0.iter().copied()
    }

    /// Hand the next port to the caller, who now owns its send right
    fn take(&mut self) -> Option<thread_act_t>
    {
        self.0.pop()
    }
}

impl Drop for ThreadPorts
{
    fn drop(&mut self)
    {
        for port in self.0.drain(..) {
            release_port(port);
        }
    }
}

#[allow(unsafe_code)]
fn release_port(port: mach_port_t)
{
    unsafe {
        let _ = ffi::mach_port_deallocate(mach_task_self(), port);
    }
}

#[allow(unsafe_code)]
fn deallocate_threads_array(threads: *mut thread_act_t, count: mach_msg_type_number_t)
{
    if threads.is_null() || count == 0 {
        return;
    }
    let size = (count as usize).saturating_mul(mem::size_of::<thread_act_t>()) as vm_size_t;
    unsafe {
        let _ = ffi::vm_deallocate(mach_task_self(), threads as vm_address_t, size);
    }
}

impl MemoryRead for MacProcess
{
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>
    {
        self.ensure_attached()?;
        memory::read_into(self.task, addr, buf)
    }
}

impl MemoryWrite for MacProcess
{
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        self.ensure_attached()?;
        memory::write(self.task, addr, data)
    }
}

impl ProcessControl for MacProcess
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    /// ## Mach API: task_for_pid()
    ///
    /// ```c
    /// kern_return_t task_for_pid(
    ///     mach_port_t target_task,  // Our own task port (mach_task_self())
    ///     int pid,                  // PID of target process
    ///     mach_port_t *task         // Output: task port for target process
    /// );
    /// ```
    #[allow(unsafe_code)]
    fn attach(&mut self) -> Result<(), AttachError>
    {
        if self.task != 0 {
            return Ok(());
        }

        let mut task: mach_port_t = 0;
        let result = unsafe { ffi::task_for_pid(mach_task_self(), self.pid.raw() as c_int, &mut task) };
        if result != KERN_SUCCESS {
            // task_for_pid() reports some permission denials as KERN_FAILURE.
            if result == libc::KERN_FAILURE && self.is_alive() {
                return Err(AttachError::PermissionDenied {
                    pid: self.pid,
                    reason: "task_for_pid() failed with KERN_FAILURE but the process exists; try running with sudo"
                        .to_string(),
                });
            }
            return Err(MachError::from(result).into_attach(self.pid));
        }

        self.task = task;
        if let Err(err) = self.suspend() {
            let _ = self.resume();
            unsafe {
                let _ = ffi::mach_port_deallocate(mach_task_self(), task);
            }
            self.task = 0;
            return Err(AttachError::Platform {
                pid: self.pid,
                reason: err.to_string(),
            });
        }
        debug!(pid = %self.pid, task, "attached");
        Ok(())
    }

    #[allow(unsafe_code)]
    fn detach(&mut self) -> RemoraResult<()>
    {
        if self.task == 0 {
            return Ok(());
        }
        if let Err(err) = self.resume() {
            warn!(pid = %self.pid, %err, "resume before detach failed");
        }
        unsafe {
            let _ = ffi::mach_port_deallocate(mach_task_self(), self.task);
        }
        self.task = 0;
        debug!(pid = %self.pid, "detached");
        Ok(())
    }

    #[allow(unsafe_code)]
    fn suspend(&mut self) -> RemoraResult<()>
    {
        let mut ports = self.threads()?;
        while let Some(thread) = ports.take() {
            if self.suspended.contains(&thread) {
                // Same port name again: drop the extra reference task_threads() added.
                release_port(thread);
                continue;
            }
            let result = unsafe { ffi::thread_suspend(thread) };
            if result != KERN_SUCCESS {
                release_port(thread);
                // The thread may have exited between task_threads() and here.
                if !self.is_alive() {
                    return Err(AccessError::TargetExited.into());
                }
                debug!(pid = %self.pid, thread, result, "thread_suspend failed, skipping");
                continue;
            }
            self.suspended.push(thread);
        }
        Ok(())
    }

    fn request_suspend(&mut self) -> RemoraResult<()>
    {
        self.suspend()
    }

    /// `thread_suspend()` takes effect before returning, so a requested stop is already done
    fn poll_suspended(&mut self) -> RemoraResult<bool>
    {
        self.ensure_attached()?;
        Ok(!self.suspended.is_empty())
    }

    #[allow(unsafe_code)]
    fn resume(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        let mut failed = Vec::new();
        for thread in self.suspended.drain(..) {
            let result = unsafe { ffi::thread_resume(thread) };
            if result != KERN_SUCCESS {
                failed.push((thread, result));
            }
            release_port(thread);
        }
        match failed.first() {
            Some(&(_, result)) if self.is_alive() => Err(RemoraError::ResumeFailed(format!(
                "thread_resume failed for {} thread(s): {}",
                failed.len(),
                MachError::from(result)
            ))),
            _ => Ok(()),
        }
    }

    /// Drive every thread's suspend count to zero
    #[allow(unsafe_code)]
    fn force_resume(&mut self) -> RemoraResult<()>
    {
        for thread in self.suspended.drain(..) {
            release_port(thread);
        }
        let ports = self.threads()?;
        for thread in ports.iter() {
            while unsafe { ffi::thread_resume(thread) } == KERN_SUCCESS {}
        }
        Ok(())
    }

    /// `kill(pid, 0)` checks existence without sending anything
    #[allow(unsafe_code)]
    fn is_alive(&self) -> bool
    {
        unsafe { libc::kill(self.pid.raw() as libc::pid_t, 0) == 0 }
    }

    fn memory_ranges(&self) -> RemoraResult<Vec<MemoryRange>>
    {
        self.ensure_attached()?;
        memory::regions(self.task)
    }

    fn thread_ids(&self) -> RemoraResult<Vec<ThreadId>>
    {
        Ok(self.threads()?.iter().map(|t| ThreadId::from(u64::from(t))).collect())
    }
}

impl Drop for MacProcess
{
    fn drop(&mut self)
    {
        if let Err(err) = self.detach() {
            warn!(pid = %self.pid, %err, "detach on drop failed");
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const MACH_PORT_RIGHT_SEND: u32 = 0;

    extern "C" {
        fn mach_port_get_refs(task: mach_port_t, name: mach_port_t, right: u32, refs: *mut u32)
            -> libc::kern_return_t;
    }

    #[allow(unsafe_code)]
    fn send_refs(port: mach_port_t) -> u32
    {
        let mut refs = 0;
        let result = unsafe { mach_port_get_refs(mach_task_self(), port, MACH_PORT_RIGHT_SEND, &mut refs) };
        assert_eq!(result, KERN_SUCCESS);
        refs
    }

    #[allow(unsafe_code)]
    fn own_task() -> mach_port_t
    {
        unsafe { mach_task_self() }
    }

    #[test]
    fn test_listed_ports_are_released()
    {
        let held = ThreadPorts::list(own_task()).unwrap();
        let port = held.iter().next().unwrap();
        let before = send_refs(port);

        for _ in 0..8 {
            let listed = ThreadPorts::list(own_task()).unwrap();
            assert!(listed.iter().any(|p| p == port));
        }
        assert_eq!(send_refs(port), before);
    }

    #[test]
    fn test_taken_port_is_kept()
    {
        let held = ThreadPorts::list(own_task()).unwrap();

        let mut listed = ThreadPorts::list(own_task()).unwrap();
        // Threads started in between have no reference from `held`.
        let taken = loop {
            let port = listed.take().unwrap();
            if held.iter().any(|p| p == port) {
                break port;
            }
            release_port(port);
        };
        let before = send_refs(taken);
        drop(listed);
        assert_eq!(send_refs(taken), before);

        release_port(taken);
        assert_eq!(send_refs(taken), before - 1);
    }
}
