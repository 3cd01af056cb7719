//! # Linux Backend
//!
//! [`ProcessControl`] over `ptrace(2)` and procfs.
//!
//! - **Attach**: `PTRACE_ATTACH`, then wait until the tracee reports its `SIGSTOP`.
//! - **Suspend**: `kill(pid, SIGSTOP)` and the same wait; `request_suspend` sends the signal
//!   and `poll_suspended` waits with `WNOHANG`. A stop that was requested but not yet seen is
//!   waited for, never signalled twice (see [`StopTracker`]).
//! - **Resume**: `PTRACE_CONT`.
//! - **Detach**: `PTRACE_DETACH` with `SIGCONT`; a running tracee is stopped first because the
//!   kernel only detaches from a stopped one.
//! - **Reads**: positioned reads on `/proc/<pid>/mem` (or the override handed to
//!   [`LinuxProcess::new`]), resumed after short reads.
//! - **Writes**: `PTRACE_POKEDATA`, decomposed by [`write_via_pokes`]. A running tracee is
//!   stopped around the write.
//!
//! Any other signal that stops the tracee while we wait for our `SIGSTOP` is re-injected
//! with `PTRACE_CONT` so the target still receives it.
//!
//! ## References
//!
//! - [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//! - [waitpid(2) man page](https://man7.org/linux/man-pages/man2/waitpid.2.html)
//! - [proc(5) man page](https://man7.org/linux/man-pages/man5/proc.5.html) (`/proc/<pid>/mem`)

pub mod procfs;

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr;

use libc::{c_int, c_long, c_void, pid_t};
use tracing::{debug, trace, warn};

pub use procfs::ProcFs;

use crate::control::{ProcessControl, StopTracker};
use crate::error::{AccessError, AttachError, RemoraError, RemoraResult};
use crate::memory::poke::{write_via_pokes, WordPoke};
use crate::memory::{MemoryRead, MemoryWrite};
use crate::types::{Address, MemoryRange, ProcessId, ThreadId, WordSize};

/// A target process controlled through `ptrace`
#[derive(Debug)]
pub struct LinuxProcess
{
    pid: ProcessId,
    proc: ProcFs,
    memory_path: PathBuf,
    memory: Option<File>,
    attached: bool,
    stops: Cell<StopTracker>,
}

impl LinuxProcess
{
    /// Handle for `pid`; nothing is touched until [`attach`](ProcessControl::attach)
    ///
    /// `memory_file` replaces `/proc/<pid>/mem` as the read interface.
    pub fn new(pid: ProcessId, memory_file: Option<&Path>) -> Self
    {
        let proc = ProcFs::default();
        let memory_path = memory_file.map_or_else(|| proc.mem_path(pid), Path::to_path_buf);
        Self {
            pid,
            proc,
            memory_path,
            memory: None,
            attached: false,
            stops: Cell::new(StopTracker::default()),
        }
    }

    fn stops<R>(&self, f: impl FnOnce(&mut StopTracker) -> R) -> R
    {
        let mut stops = self.stops.get();
        let result = f(&mut stops);
        self.stops.set(stops);
        result
    }

    fn is_stopped(&self) -> bool
    {
        self.stops.get().is_stopped()
    }

    fn raw_pid(&self) -> pid_t
    {
        self.pid.raw() as pid_t
    }

    fn ensure_attached(&self) -> Result<(), AccessError>
    {
        if self.attached {
            Ok(())
        } else {
            Err(AccessError::NotAttached)
        }
    }

    /// Block until the tracee reports a `SIGSTOP` stop
    fn wait_for_stop(&self) -> io::Result<()>
    {
        while !self.wait_once(0)? {}
        Ok(())
    }

    /// One `waitpid`; `true` once the tracee sits in a `SIGSTOP` stop
    #[allow(unsafe_code)]
    fn wait_once(&self, flags: c_int) -> io::Result<bool>
    {
        let mut status: c_int = 0;
        let rc = unsafe { libc::waitpid(self.raw_pid(), &mut status, flags | libc::__WALL) };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(false);
        }
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }
        if !libc::WIFSTOPPED(status) {
            return Ok(false);
        }

        let signal = libc::WSTOPSIG(status);
        if signal == libc::SIGSTOP {
            self.stops(StopTracker::mark_stopped);
            return Ok(true);
        }
        trace!(pid = %self.pid, signal, "re-injecting foreign stop signal");
        ptrace_cont(self.raw_pid(), signal)?;
        Ok(false)
    }

    /// Send `SIGSTOP` unless one is already on its way
    #[allow(unsafe_code)]
    fn send_stop(&self) -> io::Result<()>
    {
        if !self.stops(StopTracker::request) {
            return Ok(());
        }
        if unsafe { libc::kill(self.raw_pid(), libc::SIGSTOP) } == -1 {
            self.stops(StopTracker::cancel);
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn stop_now(&self) -> io::Result<()>
    {
        if self.is_stopped() {
            return Ok(());
        }
        self.send_stop()?;
        self.wait_for_stop()
    }

    fn cont(&self) -> io::Result<()>
    {
        ptrace_cont(self.raw_pid(), 0)?;
        self.stops(StopTracker::mark_resumed);
        Ok(())
    }

    /// Map an OS failure during a transfer, checking whether the target died
    fn transfer_error(&self, err: Option<io::Error>, address: Address, requested: usize, transferred: usize) -> AccessError
    {
        if !self.proc.is_alive(self.pid) || err.as_ref().and_then(io::Error::raw_os_error) == Some(libc::ESRCH) {
            return AccessError::TargetExited;
        }
        if let Some(err) = err {
            trace!(pid = %self.pid, %address, error = %err, "transfer failed");
        }
        if transferred == 0 {
            AccessError::Denied {
                address,
                len: requested,
            }
        } else {
            AccessError::PartialTransfer {
                address,
                requested,
                transferred,
            }
        }
    }

    fn control_error(&self, err: io::Error, wrap: fn(String) -> RemoraError) -> RemoraError
    {
        if err.raw_os_error() == Some(libc::ESRCH) && !self.proc.is_alive(self.pid) {
            return AccessError::TargetExited.into();
        }
        wrap(format!("PID {}: {err}", self.pid))
    }
}

impl MemoryRead for LinuxProcess
{
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>
    {
        self.ensure_attached()?;
        let file = self.memory.as_ref().ok_or(AccessError::NotAttached)?;

        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            match file.read_at(&mut buf[done..], at.value()) {
                Ok(0) => return Err(self.transfer_error(None, addr, buf.len(), done)),
                Ok(n) => {
                    if done + n < buf.len() {
                        trace!(pid = %self.pid, address = %at, got = n, "short read, continuing");
                    }
                    done += n;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(self.transfer_error(Some(err), addr, buf.len(), done)),
            }
        }
        Ok(())
    }
}

impl MemoryWrite for LinuxProcess
{
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        self.ensure_attached()?;
        if data.is_empty() {
            return Ok(());
        }

        // A pending asynchronous stop stays in place so the caller's poll sees it.
        let stops = self.stops.get();
        let keep_stopped = stops.is_stopped() || stops.is_pending();
        self.stop_now().map_err(|err| self.transfer_error(Some(err), addr, data.len(), 0))?;
        let result = write_via_pokes(self, addr, data);
        if !keep_stopped {
            if let Err(err) = self.cont() {
                warn!(pid = %self.pid, error = %err, "failed to continue after write");
            }
        }
        result
    }
}

impl WordPoke for LinuxProcess
{
    fn poke_width(&self) -> WordSize
    {
        WordSize::host()
    }

    fn peek_word(&self, addr: Address) -> Result<u64, AccessError>
    {
        let len = self.poke_width().bytes();
        ptrace_peek(self.raw_pid(), addr.value())
            .map(|word| word as u64)
            .map_err(|err| self.transfer_error(Some(err), addr, len, 0))
    }

    fn poke_word(&self, addr: Address, value: u64) -> Result<(), AccessError>
    {
        let len = self.poke_width().bytes();
        ptrace_poke(self.raw_pid(), addr.value(), value).map_err(|err| self.transfer_error(Some(err), addr, len, 0))
    }
}

impl ProcessControl for LinuxProcess
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn attach(&mut self) -> Result<(), AttachError>
    {
        if self.attached {
            return Ok(());
        }

        let pid = self.pid;
        ptrace_attach(self.raw_pid()).map_err(|err| match err.raw_os_error() {
            Some(libc::ESRCH) => AttachError::NoSuchProcess(pid),
            Some(libc::EPERM) => AttachError::PermissionDenied {
                pid,
                reason: format!("PTRACE_ATTACH: {err}"),
            },
            _ => AttachError::Platform {
                pid,
                reason: format!("PTRACE_ATTACH: {err}"),
            },
        })?;

        if let Err(err) = self.wait_for_stop() {
            return Err(match err.raw_os_error() {
                Some(libc::ESRCH) | Some(libc::ECHILD) => AttachError::NoSuchProcess(pid),
                _ => AttachError::Platform {
                    pid,
                    reason: format!("waiting for stop: {err}"),
                },
            });
        }

        match OpenOptions::new().read(true).open(&self.memory_path) {
            Ok(file) => self.memory = Some(file),
            Err(err) => {
                let _ = ptrace_detach(self.raw_pid(), libc::SIGCONT);
                self.stops.set(StopTracker::default());
                return Err(AttachError::PermissionDenied {
                    pid,
                    reason: format!("opening {}: {err}", self.memory_path.display()),
                });
            }
        }

        self.attached = true;
        debug!(%pid, memory = %self.memory_path.display(), "attached");
        Ok(())
    }

    fn detach(&mut self) -> RemoraResult<()>
    {
        if !self.attached {
            return Ok(());
        }

        self.memory = None;
        self.attached = false;
        if self.stop_now().is_err() && !self.proc.is_alive(self.pid) {
            self.stops.set(StopTracker::default());
            return Ok(());
        }
        let result = ptrace_detach(self.raw_pid(), libc::SIGCONT);
        self.stops.set(StopTracker::default());
        result.map_err(|err| self.control_error(err, RemoraError::ResumeFailed))?;
        debug!(pid = %self.pid, "detached");
        Ok(())
    }

    fn suspend(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        self.stop_now().map_err(|err| self.control_error(err, RemoraError::SuspendFailed))
    }

    fn request_suspend(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        if self.is_stopped() {
            return Ok(());
        }
        self.send_stop().map_err(|err| self.control_error(err, RemoraError::SuspendFailed))
    }

    fn poll_suspended(&mut self) -> RemoraResult<bool>
    {
        self.ensure_attached()?;
        if self.is_stopped() {
            return Ok(true);
        }
        self.wait_once(libc::WNOHANG)
            .map_err(|err| self.control_error(err, RemoraError::SuspendFailed))
    }

    fn resume(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        if !self.is_stopped() {
            return Ok(());
        }
        self.cont().map_err(|err| self.control_error(err, RemoraError::ResumeFailed))
    }

    fn force_resume(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        // An undelivered stop would freeze the tracee again right after the continue.
        if self.stops.get().is_pending() {
            self.wait_for_stop()
                .map_err(|err| self.control_error(err, RemoraError::ResumeFailed))?;
        }
        match ptrace_cont(self.raw_pid(), 0) {
            Ok(()) => {}
            // Not in a ptrace stop: the tracee is already running.
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) && self.proc.is_alive(self.pid) => {}
            Err(err) => return Err(self.control_error(err, RemoraError::ResumeFailed)),
        }
        self.stops(StopTracker::mark_resumed);
        Ok(())
    }

    fn is_alive(&self) -> bool
    {
        self.proc.is_alive(self.pid)
    }

    fn memory_ranges(&self) -> RemoraResult<Vec<MemoryRange>>
    {
        Ok(self.proc.maps(self.pid)?)
    }

    fn thread_ids(&self) -> RemoraResult<Vec<ThreadId>>
    {
        Ok(self.proc.threads(self.pid)?)
    }
}

impl Drop for LinuxProcess
{
    fn drop(&mut self)
    {
        if self.attached {
            if let Err(err) = self.detach() {
                warn!(pid = %self.pid, error = %err, "detach on drop failed");
            }
        }
    }
}

fn check(rc: c_long) -> io::Result<()>
{
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[allow(unsafe_code)]
fn ptrace_attach(pid: pid_t) -> io::Result<()>
{
    check(unsafe { libc::ptrace(libc::PTRACE_ATTACH, pid, ptr::null_mut::<c_void>(), ptr::null_mut::<c_void>()) })
}

#[allow(unsafe_code)]
fn ptrace_cont(pid: pid_t, signal: c_int) -> io::Result<()>
{
    check(unsafe { libc::ptrace(libc::PTRACE_CONT, pid, ptr::null_mut::<c_void>(), signal as usize as *mut c_void) })
}

#[allow(unsafe_code)]
fn ptrace_detach(pid: pid_t, signal: c_int) -> io::Result<()>
{
    check(unsafe { libc::ptrace(libc::PTRACE_DETACH, pid, ptr::null_mut::<c_void>(), signal as usize as *mut c_void) })
}

/// `PTRACE_PEEKDATA` returns the word itself, so `-1` is only an error when errno is set
#[allow(unsafe_code)]
fn ptrace_peek(pid: pid_t, addr: u64) -> io::Result<c_long>
{
    unsafe {
        *libc::__errno_location() = 0;
        let word = libc::ptrace(libc::PTRACE_PEEKDATA, pid, addr as usize as *mut c_void, ptr::null_mut::<c_void>());
        if word == -1 && *libc::__errno_location() != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(word)
    }
}

#[allow(unsafe_code)]
fn ptrace_poke(pid: pid_t, addr: u64, value: u64) -> io::Result<()>
{
    check(unsafe { libc::ptrace(libc::PTRACE_POKEDATA, pid, addr as usize as *mut c_void, value as usize as *mut c_void) })
}

#[cfg(test)]
mod tests
{
    use std::process::{Child, Command};

    use super::*;

    fn spawn_sleeper() -> Child
    {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[test]
    fn test_attach_missing_process()
    {
        let mut process = LinuxProcess::new(ProcessId::from(u32::MAX / 2), None);
        assert!(matches!(process.attach(), Err(AttachError::NoSuchProcess(_))));
        assert!(matches!(process.read_u8(Address::new(0x1000)), Err(AccessError::NotAttached)));
    }

    // Needs ptrace permission over our own children (Yama ptrace_scope <= 1).
    #[test]
    #[ignore]
    fn test_attach_suspend_resume_detach()
    {
        let mut child = spawn_sleeper();
        let mut process = LinuxProcess::new(ProcessId::from(child.id()), None);
        process.attach().unwrap();
        assert_eq!(process.proc.state(process.pid).unwrap(), 't');

        let ranges = process.memory_ranges().unwrap();
        let readable = ranges.iter().find(|r| r.readable && !r.is_empty()).unwrap();
        let head = process.read_bytes(readable.start, 16).unwrap();
        assert_eq!(head.len(), 16);

        process.resume().unwrap();
        process.request_suspend().unwrap();
        while !process.poll_suspended().unwrap() {
            std::thread::yield_now();
        }
        process.detach().unwrap();
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
