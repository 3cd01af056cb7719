//! # In-Memory Test Double
//!
//! [`MockProcess`] stands in for a live target in tests: a handful of mapped byte ranges plus
//! a tiny attach/stop state machine. It implements [`ProcessControl`], so it can back a real
//! [`Session`](crate::Session), and [`WordPoke`], so the POSIX write decomposition can be
//! exercised without `ptrace`.
//!
//! Clones share state. A test keeps one handle to poke at the "target" (kill it, inspect the
//! stop state, read the poke log) while the session owns another.
//!
//! ```rust
//! use remora_core::memory::MemoryRead;
//! use remora_core::mock::MockProcess;
//! use remora_core::types::Address;
//!
//! let mock = MockProcess::builder().map(0x1000, 0x100).build();
//! mock.fill(Address::new(0x1000), 4, 0x2a)?;
//! assert_eq!(mock.read_u8(Address::new(0x1003))?, 0x2a);
//! # Ok::<(), remora_core::error::AccessError>(())
//! ```
//!
//! [`MockCompanion`] plays the extension side of a [`LocalRegion`] on its own thread,
//! answering core channel commands out of a `MockProcess`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::abi::{self, ContainerAbi};
use crate::channel::{ChannelLayout, ChannelRegion, CoreCommand, LocalRegion, MAX_CLIENTS, MAX_NAME_LEN};
use crate::control::{ProcessControl, StopTracker};
use crate::error::{AccessError, AttachError, RemoraResult};
use crate::memory::poke::{write_via_pokes, WordPoke};
use crate::memory::{MemoryRead, MemoryWrite};
use crate::types::{Address, MemoryRange, ProcessId, ThreadId, WordSize};

#[derive(Debug)]
struct Mapping
{
    start: u64,
    bytes: Vec<u8>,
}

impl Mapping
{
    fn slice_range(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>>
    {
        let begin = addr.checked_sub(self.start)? as usize;
        let end = begin.checked_add(len)?;
        (end <= self.bytes.len()).then_some(begin..end)
    }
}

/// Target state as the process itself sees it, plus what the backend believes
///
/// `stopped` is the target's real state and `stops` the backend's view of it. A stop signal
/// sent while another is undelivered (or while the target is already stopped) is counted in
/// `queued_stops` and freezes the target again on the next continue.
#[derive(Debug, Default)]
struct MockState
{
    alive: bool,
    attached: bool,
    stopped: bool,
    stops: StopTracker,
    pending_polls: Option<u32>,
    queued_stops: u32,
    stop_signals: u32,
    attach_calls: u32,
    force_resumes: u32,
}

impl MockState
{
    fn send_stop(&mut self, latency: u32)
    {
        if !self.stops.request() {
            return;
        }
        self.stop_signals += 1;
        if self.stopped || self.pending_polls.is_some() {
            self.queued_stops += 1;
        } else {
            self.pending_polls = Some(latency);
        }
    }

    fn deliver_stop(&mut self)
    {
        if self.pending_polls.take().is_none() {
            self.queued_stops = self.queued_stops.saturating_sub(1);
        }
        self.stopped = true;
        self.stops.mark_stopped();
    }

    fn continue_target(&mut self)
    {
        self.stops.mark_resumed();
        if self.queued_stops > 0 {
            self.queued_stops -= 1;
            self.stopped = true;
        } else {
            self.stopped = false;
        }
    }

    fn reset_stops(&mut self)
    {
        self.stopped = false;
        self.stops = StopTracker::default();
        self.pending_polls = None;
        self.queued_stops = 0;
    }
}

#[derive(Debug)]
struct Inner
{
    pid: ProcessId,
    mappings: Mutex<Vec<Mapping>>,
    state: Mutex<MockState>,
    poke_width: Option<WordSize>,
    poke_log: Mutex<Vec<Address>>,
    stop_latency: u32,
    deny_attach: bool,
}

/// In-memory stand-in for a target process
#[derive(Debug, Clone)]
pub struct MockProcess
{
    inner: Arc<Inner>,
}

/// Builder for [`MockProcess`]
#[derive(Debug)]
pub struct MockProcessBuilder
{
    pid: ProcessId,
    mappings: Vec<Mapping>,
    poke_width: Option<WordSize>,
    stop_latency: u32,
    deny_attach: bool,
}

impl MockProcessBuilder
{
    pub fn pid(mut self, pid: u32) -> Self
    {
        self.pid = ProcessId(pid);
        self
    }

    /// Map `len` zeroed bytes at `start`
    pub fn map(mut self, start: u64, len: usize) -> Self
    {
        self.mappings.push(Mapping {
            start,
            bytes: vec![0; len],
        });
        self
    }

    /// Route `write_bytes` through the word-poke decomposition
    pub fn poke_writes(mut self, width: WordSize) -> Self
    {
        self.poke_width = Some(width);
        self
    }

    /// Number of `poll_suspended` calls before an asynchronous stop completes
    pub fn stop_latency(mut self, polls: u32) -> Self
    {
        self.stop_latency = polls;
        self
    }

    /// Make `attach` fail with `PermissionDenied`
    pub fn deny_attach(mut self) -> Self
    {
        self.deny_attach = true;
        self
    }

    pub fn build(self) -> MockProcess
    {
        MockProcess {
            inner: Arc::new(Inner {
                pid: self.pid,
                mappings: Mutex::new(self.mappings),
                state: Mutex::new(MockState {
                    alive: true,
                    ..MockState::default()
                }),
                poke_width: self.poke_width,
                poke_log: Mutex::new(Vec::new()),
                stop_latency: self.stop_latency,
                deny_attach: self.deny_attach,
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProcess
{
    pub fn builder() -> MockProcessBuilder
    {
        MockProcessBuilder {
            pid: ProcessId(4242),
            mappings: Vec::new(),
            poke_width: None,
            stop_latency: 0,
            deny_attach: false,
        }
    }

    /// Set `len` bytes at `addr` to `value`, bypassing poke mode
    pub fn fill(&self, addr: Address, len: usize, value: u8) -> Result<(), AccessError>
    {
        self.with_slice(addr, len, |bytes| bytes.fill(value))
    }

    /// Write raw bytes, bypassing poke mode
    pub fn store(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        self.with_slice(addr, data.len(), |bytes| bytes.copy_from_slice(data))
    }

    /// Simulate the target process exiting
    pub fn kill(&self)
    {
        let mut state = lock(&self.inner.state);
        state.alive = false;
        state.reset_stops();
    }

    /// Whether the target is really stopped, whatever the backend believes
    pub fn is_stopped(&self) -> bool
    {
        lock(&self.inner.state).stopped
    }

    pub fn is_attached(&self) -> bool
    {
        lock(&self.inner.state).attached
    }

    pub fn attach_calls(&self) -> u32
    {
        lock(&self.inner.state).attach_calls
    }

    pub fn force_resumes(&self) -> u32
    {
        lock(&self.inner.state).force_resumes
    }

    /// Stop signals sent to the target since it was built
    pub fn stop_signals(&self) -> u32
    {
        lock(&self.inner.state).stop_signals
    }

    /// Addresses of every word poke so far, in issue order
    pub fn poke_log(&self) -> Vec<Address>
    {
        lock(&self.inner.poke_log).clone()
    }

    fn with_slice<R>(&self, addr: Address, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, AccessError>
    {
        self.ensure_alive()?;
        let mut mappings = lock(&self.inner.mappings);
        for mapping in mappings.iter_mut() {
            if let Some(range) = mapping.slice_range(addr.value(), len) {
                return Ok(f(&mut mapping.bytes[range]));
            }
        }
        Err(AccessError::Denied { address: addr, len })
    }

    fn ensure_alive(&self) -> Result<(), AccessError>
    {
        if lock(&self.inner.state).alive {
            Ok(())
        } else {
            Err(AccessError::TargetExited)
        }
    }
}

impl MemoryRead for MockProcess
{
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>
    {
        self.with_slice(addr, buf.len(), |bytes| buf.copy_from_slice(bytes))
    }
}

impl MemoryWrite for MockProcess
{
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        if self.inner.poke_width.is_some() {
            write_via_pokes(self, addr, data)
        } else {
            self.store(addr, data)
        }
    }
}

impl WordPoke for MockProcess
{
    fn poke_width(&self) -> WordSize
    {
        self.inner.poke_width.unwrap_or(WordSize::Eight)
    }

    fn peek_word(&self, addr: Address) -> Result<u64, AccessError>
    {
        let width = self.poke_width().bytes();
        let mut bytes = [0u8; 8];
        self.read_into(addr, &mut bytes[..width])?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn poke_word(&self, addr: Address, value: u64) -> Result<(), AccessError>
    {
        let width = self.poke_width().bytes();
        self.store(addr, &value.to_le_bytes()[..width])?;
        lock(&self.inner.poke_log).push(addr);
        Ok(())
    }
}

impl ProcessControl for MockProcess
{
    fn pid(&self) -> ProcessId
    {
        self.inner.pid
    }

    fn attach(&mut self) -> Result<(), AttachError>
    {
        let mut state = lock(&self.inner.state);
        if !state.alive {
            return Err(AttachError::NoSuchProcess(self.inner.pid));
        }
        if self.inner.deny_attach {
            return Err(AttachError::PermissionDenied {
                pid: self.inner.pid,
                reason: "attach refused by test double".to_string(),
            });
        }
        state.attach_calls += 1;
        state.attached = true;
        state.reset_stops();
        state.stopped = true;
        state.stops.mark_stopped();
        Ok(())
    }

    fn detach(&mut self) -> RemoraResult<()>
    {
        let mut state = lock(&self.inner.state);
        state.attached = false;
        state.reset_stops();
        Ok(())
    }

    fn suspend(&mut self) -> RemoraResult<()>
    {
        self.ensure_alive()?;
        let mut state = lock(&self.inner.state);
        if !state.stops.is_stopped() {
            state.send_stop(self.inner.stop_latency);
            state.deliver_stop();
        }
        Ok(())
    }

    fn request_suspend(&mut self) -> RemoraResult<()>
    {
        self.ensure_alive()?;
        let mut state = lock(&self.inner.state);
        if !state.stops.is_stopped() {
            state.send_stop(self.inner.stop_latency);
        }
        Ok(())
    }

    fn poll_suspended(&mut self) -> RemoraResult<bool>
    {
        self.ensure_alive()?;
        let mut state = lock(&self.inner.state);
        if state.stops.is_pending() {
            match state.pending_polls {
                Some(n) if n > 0 => state.pending_polls = Some(n - 1),
                _ => state.deliver_stop(),
            }
        }
        Ok(state.stops.is_stopped())
    }

    fn resume(&mut self) -> RemoraResult<()>
    {
        self.ensure_alive()?;
        let mut state = lock(&self.inner.state);
        if state.stops.is_stopped() {
            state.continue_target();
        }
        Ok(())
    }

    fn force_resume(&mut self) -> RemoraResult<()>
    {
        self.ensure_alive()?;
        let mut state = lock(&self.inner.state);
        if state.stops.is_pending() {
            state.deliver_stop();
        }
        state.continue_target();
        state.force_resumes += 1;
        Ok(())
    }

    fn is_alive(&self) -> bool
    {
        lock(&self.inner.state).alive
    }

    fn memory_ranges(&self) -> RemoraResult<Vec<MemoryRange>>
    {
        let mappings = lock(&self.inner.mappings);
        Ok(mappings
            .iter()
            .map(|m| MemoryRange {
                start: Address::new(m.start),
                end: Address::new(m.start + m.bytes.len() as u64),
                readable: true,
                writable: true,
                executable: false,
                shared: false,
                file_offset: 0,
                name: None,
            })
            .collect())
    }

    fn thread_ids(&self) -> RemoraResult<Vec<ThreadId>>
    {
        Ok(vec![ThreadId(u64::from(self.inner.pid.raw()))])
    }
}

/// Companion thread serving core channel commands from a [`MockProcess`]
///
/// Modules passed to [`spawn`](MockCompanion::spawn) get indices from 1 in order; commands
/// addressed to them complete without doing anything. String commands treat the target's
/// string objects according to `strings`. The thread stops on drop.
#[derive(Debug)]
pub struct MockCompanion
{
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockCompanion
{
    pub fn spawn(
        region: LocalRegion,
        layout: ChannelLayout,
        memory: MockProcess,
        modules: Vec<(String, u32)>,
        strings: ContainerAbi,
    ) -> Self
    {
        let stop = Arc::new(AtomicBool::new(false));
        let server = CompanionState {
            region,
            layout,
            memory,
            modules,
            strings,
        };
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                let mut busy = false;
                for client in 0..MAX_CLIENTS {
                    busy |= server.serve(client as usize * 4);
                }
                if !busy {
                    thread::yield_now();
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for MockCompanion
{
    fn drop(&mut self)
    {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct CompanionState
{
    region: LocalRegion,
    layout: ChannelLayout,
    memory: MockProcess,
    modules: Vec<(String, u32)>,
    strings: ContainerAbi,
}

impl CompanionState
{
    /// Answer whatever is pending in one control word; `true` if something was answered
    fn serve(&self, control: usize) -> bool
    {
        let Ok(wire) = self.region.load_u32(control) else {
            return false;
        };
        let module = (wire >> 16) as usize;
        let reply = if module != 0 {
            if module <= self.modules.len() {
                Some(CoreCommand::Suspended)
            } else {
                Some(CoreCommand::Error)
            }
        } else {
            match CoreCommand::from_code(wire as u16) {
                Some(command) => self.core(command),
                None => Some(CoreCommand::Error),
            }
        };
        match reply {
            Some(state) => self.region.store_u32(control, state.wire()).is_ok(),
            None => false,
        }
    }

    fn core(&self, command: CoreCommand) -> Option<CoreCommand>
    {
        let done = match command {
            CoreCommand::Running
            | CoreCommand::Run
            | CoreCommand::Suspended
            | CoreCommand::Error
            | CoreCommand::ReadCString => return None,
            CoreCommand::Step | CoreCommand::Suspend => Ok(()),
            CoreCommand::Attach => self.attach(),
            CoreCommand::AcquireModule => self.find_module(),
            CoreCommand::AcquireCommand => self.region.store_u32(32, 1),
            CoreCommand::Read => self.read_raw(),
            CoreCommand::Write => self.write_raw(),
            CoreCommand::ReadQuad => self.read_fixed(8),
            CoreCommand::ReadDword => self.read_fixed(4),
            CoreCommand::ReadWord => self.read_fixed(2),
            CoreCommand::ReadByte => self.read_fixed(1),
            CoreCommand::WriteQuad => self.write_fixed(8),
            CoreCommand::WriteDword => self.write_fixed(4),
            CoreCommand::WriteWord => self.write_fixed(2),
            CoreCommand::WriteByte => self.write_fixed(1),
            CoreCommand::ReadStlString => self.read_string(),
            CoreCommand::WriteStlString => self.write_string(),
        };
        Some(if done.is_ok() { CoreCommand::Suspended } else { CoreCommand::Error })
    }

    fn payload(&self) -> usize
    {
        self.layout.header_size
    }

    fn target(&self) -> Result<Address, AccessError>
    {
        self.region.load_u64(16).map(Address::new)
    }

    fn attach(&self) -> Result<(), AccessError>
    {
        let payload = self.payload();
        self.region.store_u32(payload + 4, self.layout.core_version)?;
        self.region.store_u32(payload + 8, self.memory.pid().raw())?;
        self.region.store_u32(payload + 12, 0)
    }

    fn find_module(&self) -> Result<(), AccessError>
    {
        let payload = self.payload();
        let version = self.region.load_u32(payload)?;
        let mut raw = [0u8; MAX_NAME_LEN + 1];
        self.region.read_into(payload + 4, &mut raw)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let name = String::from_utf8_lossy(&raw[..end]);
        match self.modules.iter().position(|(n, v)| *n == name && *v == version) {
            Some(index) => {
                self.region.store_u32(24, index as u32 + 1)?;
                self.region.store_u32(32, 0)
            }
            None => self.region.store_u32(32, 1),
        }
    }

    fn read_raw(&self) -> Result<(), AccessError>
    {
        let len = self.region.load_u32(28)? as usize;
        let bytes = self.memory.read_bytes(self.target()?, len)?;
        self.region.write_bytes(self.payload(), &bytes)
    }

    fn write_raw(&self) -> Result<(), AccessError>
    {
        let len = self.region.load_u32(28)? as usize;
        let mut bytes = vec![0u8; len];
        self.region.read_into(self.payload(), &mut bytes)?;
        self.memory.store(self.target()?, &bytes)
    }

    /// Length in the value field, characters (and a NUL if it fits) in the payload
    fn read_string(&self) -> Result<(), AccessError>
    {
        let text = abi::read_foreign_string(&self.memory, &self.strings, self.target()?)?;
        let mut bytes = text.into_bytes();
        self.region.store_u32(24, bytes.len() as u32)?;
        bytes.push(0);
        bytes.truncate(self.layout.payload_size);
        self.region.write_bytes(self.payload(), &bytes)
    }

    fn write_string(&self) -> Result<(), AccessError>
    {
        let mut raw = vec![0u8; self.layout.payload_size];
        self.region.read_into(self.payload(), &mut raw)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let value = String::from_utf8_lossy(&raw[..end]);
        abi::assign_foreign_string(&self.memory, &self.strings, self.target()?, &value)
    }

    fn read_fixed(&self, width: usize) -> Result<(), AccessError>
    {
        let mut bytes = [0u8; 8];
        self.memory.read_into(self.target()?, &mut bytes[..width])?;
        let value = u64::from_le_bytes(bytes);
        if width == 8 {
            self.region.store_u64(40, value)
        } else {
            self.region.store_u32(24, value as u32)
        }
    }

    fn write_fixed(&self, width: usize) -> Result<(), AccessError>
    {
        let value = if width == 8 {
            self.region.load_u64(40)?
        } else {
            u64::from(self.region.load_u32(24)?)
        };
        self.memory.store(self.target()?, &value.to_le_bytes()[..width])
    }
}
