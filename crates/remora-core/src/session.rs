//! # Process Session
//!
//! A [`Session`] is the one live connection to the target: the platform handle, the layout
//! chosen for the target's build, and the attachment state.
//!
//! Sessions are created by the [`Locator`](crate::Locator), which enforces that at most one
//! of its sessions is attached at a time. The session returns that claim when it detaches,
//! when it notices the target died, or when it is dropped.
//!
//! ## State
//!
//! ```text
//!             attach                     resume / force_resume
//!   Detached ────────► Suspended ◄────────────────────────────► Attached
//!      ▲                   │          suspend / poll_suspended      │
//!      └───────────────────┴──── detach, drop, target exit ─────────┘
//! ```
//!
//! ## Dropping
//!
//! Dropping a session walks `Suspended → Attached → Detached` in that order, so the target
//! is never left stopped.
//!
//! ## Example
//!
//! ```rust
//! use remora_core::layout::LayoutBuilder;
//! use remora_core::memory::MemoryRead;
//! use remora_core::mock::MockProcess;
//! use remora_core::types::{Address, TargetOs, WordSize};
//! use remora_core::Locator;
//!
//! let layout = LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
//!     .with_address("tile_count", Address::new(0x1000))
//!     .build();
//! let mock = MockProcess::builder().map(0x1000, 0x10).build();
//! mock.store(Address::new(0x1000), &42u32.to_le_bytes())?;
//!
//! let locator = Locator::new(vec![layout.clone()]);
//! let session = locator.attach_with(Box::new(mock), layout)?;
//! let tiles = session.read_u32(session.layout().get_address("tile_count")?)?;
//! assert_eq!(tiles, 42);
//! # Ok::<(), remora_core::error::RemoraError>(())
//! ```

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::abi::{self, ContainerAbi, ForeignArray};
use crate::control::ProcessControl;
use crate::error::{AccessError, AttachError, RemoraResult};
use crate::layout::{ClassId, LayoutDescriptor};
use crate::memory::{format_hexdump, MemoryRead, MemoryWrite};
use crate::resolver::TypeResolver;
use crate::rtti::{strategy_for, RttiStrategy};
use crate::types::{Address, AttachState, MemoryRange, ProcessId, ThreadId};

/// Claim on a locator's single attach slot
///
/// The shared word holds the PID of the attached session, 0 when free.
#[derive(Debug)]
pub(crate) struct AttachSlot
{
    owner: Arc<AtomicU32>,
    pid: ProcessId,
    held: AtomicBool,
}

impl AttachSlot
{
    pub(crate) fn claim(owner: &Arc<AtomicU32>, pid: ProcessId) -> Result<Self, AttachError>
    {
        // PID 0 is never a user process, so it doubles as "free".
        let tag = pid.raw().max(1);
        owner
            .compare_exchange(0, tag, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|holder| AttachError::AlreadyAttached(ProcessId::from(holder)))?;
        Ok(Self {
            owner: Arc::clone(owner),
            pid,
            held: AtomicBool::new(true),
        })
    }

    pub(crate) fn release(&self)
    {
        if self.held.swap(false, Ordering::AcqRel) {
            self.owner.store(0, Ordering::Release);
            debug!(pid = %self.pid, "attach slot released");
        }
    }
}

impl Drop for AttachSlot
{
    fn drop(&mut self)
    {
        self.release();
    }
}

/// An attached target process and the layout of its build
pub struct Session
{
    control: Box<dyn ProcessControl>,
    layout: LayoutDescriptor,
    abi: ContainerAbi,
    rtti: Box<dyn RttiStrategy>,
    state: Cell<AttachState>,
    /// The target died while attached; the OS handle still needs releasing.
    orphaned: Cell<bool>,
    slot: AttachSlot,
}

impl std::fmt::Debug for Session
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Session")
            .field("pid", &self.control.pid())
            .field("state", &self.state.get())
            .field("layout", &self.layout.version())
            .finish_non_exhaustive()
    }
}

impl Session
{
    /// Attach `control` and bind `layout`
    ///
    /// The caller has already claimed `slot`; on failure it is released with the error.
    pub(crate) fn establish(
        mut control: Box<dyn ProcessControl>,
        layout: LayoutDescriptor,
        slot: AttachSlot,
        max_string_len: usize,
    ) -> Result<Self, AttachError>
    {
        control.attach()?;
        let abi = ContainerAbi::for_layout(&layout).with_max_len(max_string_len);
        let rtti = strategy_for(layout.os(), layout.word_size());
        debug!(pid = %control.pid(), layout = layout.version(), ?abi, "session attached");
        Ok(Self {
            control,
            layout,
            abi,
            rtti,
            state: Cell::new(AttachState::Suspended),
            orphaned: Cell::new(false),
            slot,
        })
    }

    pub fn pid(&self) -> ProcessId
    {
        self.control.pid()
    }

    pub fn state(&self) -> AttachState
    {
        self.state.get()
    }

    /// `true` while the session holds the target (running or stopped)
    pub fn is_attached(&self) -> bool
    {
        self.state.get().is_attached()
    }

    /// `true` once a stop has been confirmed
    ///
    /// After [`async_suspend`](Self::async_suspend) this stays `false` until
    /// [`poll_suspended`](Self::poll_suspended) observes the stop.
    pub fn is_suspended(&self) -> bool
    {
        self.state.get() == AttachState::Suspended
    }

    /// Layout bound to this session
    pub fn layout(&self) -> &LayoutDescriptor
    {
        &self.layout
    }

    /// Container ABI selected for the layout
    pub fn abi(&self) -> &ContainerAbi
    {
        &self.abi
    }

    /// Stop the target, blocking until the OS confirms
    pub fn suspend(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        if self.is_suspended() {
            return Ok(());
        }
        let result = self.control.suspend();
        self.observe(result)?;
        self.state.set(AttachState::Suspended);
        Ok(())
    }

    /// Ask the target to stop without waiting
    ///
    /// Poll [`poll_suspended`](Self::poll_suspended) until it returns `true`.
    pub fn async_suspend(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        if self.is_suspended() {
            return Ok(());
        }
        let result = self.control.request_suspend();
        self.observe(result)
    }

    /// Complete a stop requested with [`async_suspend`](Self::async_suspend)
    pub fn poll_suspended(&mut self) -> RemoraResult<bool>
    {
        self.ensure_attached()?;
        if self.is_suspended() {
            return Ok(true);
        }
        let result = self.control.poll_suspended();
        let stopped = self.observe(result)?;
        if stopped {
            self.state.set(AttachState::Suspended);
        }
        Ok(stopped)
    }

    /// Let the target run; a no-op unless suspended
    pub fn resume(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        if !self.is_suspended() {
            return Ok(());
        }
        let result = self.control.resume();
        self.observe(result)?;
        self.state.set(AttachState::Attached);
        Ok(())
    }

    /// Resume regardless of the believed state
    pub fn force_resume(&mut self) -> RemoraResult<()>
    {
        self.ensure_attached()?;
        let result = self.control.force_resume();
        self.observe(result)?;
        self.state.set(AttachState::Attached);
        Ok(())
    }

    /// Release the target
    ///
    /// Resumes first if suspended. Returns `Ok(false)` when already detached, including after
    /// the target died.
    pub fn detach(&mut self) -> RemoraResult<bool>
    {
        if !self.is_attached() {
            self.release_orphan();
            return Ok(false);
        }

        if self.is_suspended() {
            let result = self.control.resume();
            if let Err(err) = self.observe(result) {
                if !self.is_attached() {
                    self.release_orphan();
                    return Ok(false);
                }
                return Err(err);
            }
            self.state.set(AttachState::Attached);
        }

        let result = self.control.detach();
        self.observe(result)?;
        self.finish_detach();
        debug!(pid = %self.pid(), "session detached");
        Ok(true)
    }

    /// Mappings of the target address space
    pub fn memory_ranges(&self) -> RemoraResult<Vec<MemoryRange>>
    {
        self.ensure_attached()?;
        self.observe(self.control.memory_ranges())
    }

    /// Threads of the target
    pub fn thread_ids(&self) -> RemoraResult<Vec<ThreadId>>
    {
        self.ensure_attached()?;
        self.observe(self.control.thread_ids())
    }

    /// Hex and ASCII view of `len` bytes at `addr`
    pub fn hexdump(&self, addr: Address, len: usize) -> Result<String, AccessError>
    {
        let bytes = self.read_bytes(addr, len)?;
        Ok(format_hexdump(addr, &bytes, 16))
    }

    /// Decode the foreign string whose header is at `addr`
    pub fn read_foreign_string(&self, addr: Address) -> Result<String, AccessError>
    {
        abi::read_foreign_string(self, &self.abi, addr)
    }

    /// Decode into a caller buffer; see [`abi::read_foreign_string_into`]
    pub fn read_foreign_string_into(&self, addr: Address, out: &mut [u8]) -> Result<usize, AccessError>
    {
        abi::read_foreign_string_into(self, &self.abi, addr, out)
    }

    /// Decode the foreign array header at `addr`
    pub fn read_foreign_array(&self, addr: Address, element_size: usize) -> Result<ForeignArray, AccessError>
    {
        abi::read_foreign_array(self, &self.abi, addr, element_size)
    }

    /// Every element of a foreign array of pointers
    pub fn read_pointer_array(&self, addr: Address) -> Result<Vec<Address>, AccessError>
    {
        abi::read_pointer_array(self, &self.abi, addr)
    }

    /// Read a pointer-sized word of the target
    pub fn read_ptr(&self, addr: Address) -> Result<Address, AccessError>
    {
        self.read_pointer(addr, self.layout.word_size())
    }

    /// Class of the polymorphic object at `object`
    pub fn resolve_type(&mut self, object: Address) -> Result<ClassId, AccessError>
    {
        self.type_resolver().resolve_type(object)
    }

    /// Resolver bound to this session's memory and class table
    pub fn type_resolver(&mut self) -> TypeResolver<'_, SessionMemory<'_>>
    {
        let word = self.layout.word_size();
        let memory = SessionMemory {
            control: self.control.as_ref(),
            state: &self.state,
            orphaned: &self.orphaned,
            slot: &self.slot,
        };
        TypeResolver::new(memory, self.layout.classes_mut(), self.rtti.as_ref(), word)
    }

    /// Move the layout's addresses to `new_base`
    pub fn rebase_layout(&mut self, new_base: Address)
    {
        self.layout.rebase(new_base);
    }

    /// Shift the layout's dispatch pointers by `delta`
    pub fn rebase_class_table(&mut self, delta: i64)
    {
        self.layout.rebase_class_table(delta);
    }

    fn memory(&self) -> SessionMemory<'_>
    {
        SessionMemory {
            control: self.control.as_ref(),
            state: &self.state,
            orphaned: &self.orphaned,
            slot: &self.slot,
        }
    }

    fn ensure_attached(&self) -> Result<(), AccessError>
    {
        if self.is_attached() {
            Ok(())
        } else {
            Err(AccessError::NotAttached)
        }
    }

    fn observe<T>(&self, result: RemoraResult<T>) -> RemoraResult<T>
    {
        if let Err(err) = &result {
            if err.is_target_exit() {
                self.memory().mark_exited();
            }
        }
        result
    }

    fn finish_detach(&mut self)
    {
        self.layout.classes_mut().clear_dispatch_cache();
        self.state.set(AttachState::Detached);
        self.orphaned.set(false);
        self.slot.release();
    }

    /// Drop the OS handle of a target that died under us
    fn release_orphan(&mut self)
    {
        if self.orphaned.replace(false) {
            if let Err(err) = self.control.detach() {
                debug!(pid = %self.pid(), %err, "releasing handle of exited target");
            }
            self.layout.classes_mut().clear_dispatch_cache();
        }
    }
}

impl MemoryRead for Session
{
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>
    {
        self.memory().read_into(addr, buf)
    }
}

impl MemoryWrite for Session
{
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        self.memory().write_bytes(addr, data)
    }
}

impl Drop for Session
{
    fn drop(&mut self)
    {
        if self.is_suspended() {
            if let Err(err) = self.control.resume() {
                warn!(pid = %self.pid(), %err, "resume on drop failed");
            }
            self.state.set(AttachState::Attached);
        }
        if self.is_attached() {
            if let Err(err) = self.control.detach() {
                warn!(pid = %self.pid(), %err, "detach on drop failed");
            }
            self.state.set(AttachState::Detached);
        }
        self.release_orphan();
        self.slot.release();
    }
}

/// Memory view of a session that borrows only the pieces reads need
///
/// Lets a [`TypeResolver`] read through the session while holding the class table mutably.
#[derive(Clone, Copy)]
pub struct SessionMemory<'a>
{
    control: &'a dyn ProcessControl,
    state: &'a Cell<AttachState>,
    orphaned: &'a Cell<bool>,
    slot: &'a AttachSlot,
}

impl std::fmt::Debug for SessionMemory<'_>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("SessionMemory").field("pid", &self.control.pid()).finish()
    }
}

impl SessionMemory<'_>
{
    fn check<T>(&self, result: Result<T, AccessError>) -> Result<T, AccessError>
    {
        if matches!(result, Err(AccessError::TargetExited)) {
            self.mark_exited();
        }
        result
    }

    /// Implicit detach: the state flips now, the OS handle is released later with `&mut`
    fn mark_exited(&self)
    {
        if self.state.get().is_attached() {
            warn!(pid = %self.control.pid(), "target exited, detaching");
            self.state.set(AttachState::Detached);
            self.orphaned.set(true);
            self.slot.release();
        }
    }
}

impl MemoryRead for SessionMemory<'_>
{
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>
    {
        if !self.state.get().is_attached() {
            return Err(AccessError::NotAttached);
        }
        self.check(self.control.read_into(addr, buf))
    }
}

impl MemoryWrite for SessionMemory<'_>
{
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        if !self.state.get().is_attached() {
            return Err(AccessError::NotAttached);
        }
        self.check(self.control.write_bytes(addr, data))
    }
}
