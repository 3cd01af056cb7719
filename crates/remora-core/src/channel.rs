//! # Command Channel
//!
//! Synchronous mailbox protocol against a memory region shared with a companion extension
//! running inside the target.
//!
//! The region starts with a fixed-size header followed by a payload area:
//!
//! ```text
//! offset  size  field
//! 0       4*N   control word per client (N = MAX_CLIENTS)
//! 16      8     address
//! 24      4     value
//! 28      4     length
//! 32      4     error
//! 40      8     quad value
//! ...           (header padding)
//! header  ...   payload
//! ```
//!
//! A request is one round trip: the caller fills the header fields and payload, writes
//! `(module << 16) | code` into its control word, and spins until the companion replaces
//! that word with its completion state. The companion answers only while it holds the
//! caller's client suspended, so [`suspend`](CommandChannel::suspend) comes first.
//!
//! Reads over the channel return the same bytes a [`Session`](crate::Session) would read
//! directly. [`CommandChannel`] implements [`MemoryRead`] and [`MemoryWrite`], so the
//! container decoder and type resolver run over it unchanged.
//!
//! ## Regions
//!
//! - [`LocalRegion`]: atomics in this process (a mapped shared segment, or a test companion
//!   thread)
//! - [`RemoteRegion`]: a region inside the target, reached through any [`MemoryRead`] +
//!   [`MemoryWrite`] (normally a session) at the address the layout records
//!
//! ## Example
//!
//! ```rust
//! use remora_core::channel::{ChannelLayout, CommandChannel, LocalRegion};
//! use remora_core::config::CoreConfig;
//!
//! let layout = ChannelLayout::standard();
//! let region = LocalRegion::new(layout.region_size());
//! let channel = CommandChannel::new(region, layout, &CoreConfig::default())?;
//! assert!(!channel.is_suspended());
//! # Ok::<(), remora_core::error::ChannelError>(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::CoreConfig;
use crate::error::{AccessError, ChannelError, MissingDefinition};
use crate::layout::LayoutDescriptor;
use crate::memory::{MemoryRead, MemoryWrite};
use crate::types::Address;

/// Control word slots at the start of the header
pub const MAX_CLIENTS: u32 = 4;

/// Module index of the built-in core command set
pub const CORE_MODULE: u16 = 0;

/// Longest module or command name the lookup payload carries, excluding the NUL
pub const MAX_NAME_LEN: usize = 255;

const ADDRESS_FIELD: usize = 16;
const VALUE_FIELD: usize = 24;
const LENGTH_FIELD: usize = 28;
const ERROR_FIELD: usize = 32;
const QUAD_FIELD: usize = 40;
const HEADER_FIELDS_END: usize = 48;

const NAME_FIELD_LEN: usize = MAX_NAME_LEN + 1;

/// Built-in commands understood by every companion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CoreCommand
{
    Running = 0,
    Run,
    Step,
    Suspend,
    Suspended,
    Error,
    Attach,
    AcquireModule,
    AcquireCommand,
    Read,
    ReadQuad,
    ReadDword,
    ReadWord,
    ReadByte,
    Write,
    WriteQuad,
    WriteDword,
    WriteWord,
    WriteByte,
    ReadStlString,
    /// Reserved: listed by companions, never answered
    ReadCString,
    WriteStlString,
}

impl CoreCommand
{
    const ALL: [CoreCommand; 22] = [
        CoreCommand::Running,
        CoreCommand::Run,
        CoreCommand::Step,
        CoreCommand::Suspend,
        CoreCommand::Suspended,
        CoreCommand::Error,
        CoreCommand::Attach,
        CoreCommand::AcquireModule,
        CoreCommand::AcquireCommand,
        CoreCommand::Read,
        CoreCommand::ReadQuad,
        CoreCommand::ReadDword,
        CoreCommand::ReadWord,
        CoreCommand::ReadByte,
        CoreCommand::Write,
        CoreCommand::WriteQuad,
        CoreCommand::WriteDword,
        CoreCommand::WriteWord,
        CoreCommand::WriteByte,
        CoreCommand::ReadStlString,
        CoreCommand::ReadCString,
        CoreCommand::WriteStlString,
    ];

    pub fn from_code(code: u16) -> Option<Self>
    {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub const fn command(self) -> Command
    {
        Command {
            module: CORE_MODULE,
            code: self as u16,
        }
    }

    pub const fn wire(self) -> u32
    {
        self.command().wire()
    }
}

/// A command addressed to a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command
{
    pub module: u16,
    pub code: u16,
}

impl Command
{
    pub const fn new(module: u16, code: u16) -> Self
    {
        Self { module, code }
    }

    /// Value written to the control word
    pub const fn wire(self) -> u32
    {
        ((self.module as u32) << 16) | self.code as u32
    }

    pub const fn from_wire(wire: u32) -> Self
    {
        Self {
            module: (wire >> 16) as u16,
            code: wire as u16,
        }
    }
}

impl From<CoreCommand> for Command
{
    fn from(command: CoreCommand) -> Self
    {
        command.command()
    }
}

/// What the companion reported during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompanionInfo
{
    pub version: u32,
    pub pid: u32,
    /// The companion asks clients to yield while spinning (single-core affinity).
    pub wants_yield: bool,
}

/// Geometry and version of a channel region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout
{
    pub header_size: usize,
    pub payload_size: usize,
    /// Core protocol version the companion must report.
    pub core_version: u32,
    /// Control word slot used by this client.
    pub client: u32,
}

impl ChannelLayout
{
    pub const STANDARD_HEADER_SIZE: usize = 1024;
    pub const STANDARD_PAYLOAD_SIZE: usize = 1024 * 1024;
    pub const STANDARD_CORE_VERSION: u32 = 1;

    /// 1 KiB header, 1 MiB payload, client 0
    pub const fn standard() -> Self
    {
        Self {
            header_size: Self::STANDARD_HEADER_SIZE,
            payload_size: Self::STANDARD_PAYLOAD_SIZE,
            core_version: Self::STANDARD_CORE_VERSION,
            client: 0,
        }
    }

    /// Read the `channel` group of a layout
    ///
    /// `channel/core_version` is required; `channel/header_size`, `channel/payload_size` and
    /// `channel/client` fall back to the standard values.
    pub fn from_layout(layout: &LayoutDescriptor) -> Result<Self, MissingDefinition>
    {
        let group = layout.group("channel")?;
        let standard = Self::standard();
        Ok(Self {
            header_size: group
                .try_get_numeric("header_size")
                .map_or(standard.header_size, |size| size as usize),
            payload_size: group
                .try_get_numeric("payload_size")
                .map_or(standard.payload_size, |size| size as usize),
            core_version: group.get_numeric("core_version")?,
            client: group.try_get_numeric("client").unwrap_or(standard.client),
        })
    }

    pub fn with_client(mut self, client: u32) -> Self
    {
        self.client = client;
        self
    }

    pub const fn region_size(&self) -> usize
    {
        self.header_size + self.payload_size
    }

    pub const fn control_offset(&self) -> usize
    {
        self.client as usize * 4
    }

    fn validate(&self, region_size: usize) -> Result<(), ChannelError>
    {
        if self.client >= MAX_CLIENTS {
            return Err(ChannelError::Layout(format!(
                "client {} out of range (max {})",
                self.client,
                MAX_CLIENTS - 1
            )));
        }
        if self.header_size < HEADER_FIELDS_END {
            return Err(ChannelError::Layout(format!(
                "header of {} bytes cannot hold the request fields",
                self.header_size
            )));
        }
        if self.payload_size < 2 * NAME_FIELD_LEN + 4 {
            return Err(ChannelError::Layout(format!(
                "payload of {} bytes cannot hold a lookup request",
                self.payload_size
            )));
        }
        if region_size < self.region_size() {
            return Err(ChannelError::Layout(format!(
                "region of {region_size} bytes is smaller than {}",
                self.region_size()
            )));
        }
        Ok(())
    }
}

impl Default for ChannelLayout
{
    fn default() -> Self
    {
        Self::standard()
    }
}

/// Byte-addressed view of a channel region
///
/// Offsets are relative to the start of the region. Multi-byte values are little-endian.
pub trait ChannelRegion: fmt::Debug
{
    fn size(&self) -> usize;

    fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<(), AccessError>;

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), AccessError>;

    /// Whether the companion side still exists
    fn peer_alive(&self) -> bool;

    fn load_u32(&self, offset: usize) -> Result<u32, AccessError>
    {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn store_u32(&self, offset: usize, value: u32) -> Result<(), AccessError>
    {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    fn load_u64(&self, offset: usize) -> Result<u64, AccessError>
    {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn store_u64(&self, offset: usize, value: u64) -> Result<(), AccessError>
    {
        self.write_bytes(offset, &value.to_le_bytes())
    }
}

fn out_of_region(offset: usize, len: usize) -> AccessError
{
    AccessError::Denied {
        address: Address::new(offset as u64),
        len,
    }
}

/// Channel region in this process
///
/// Backed by 32-bit atomics; clones share the same words, so one clone can serve as the
/// companion side on another thread.
#[derive(Debug, Clone)]
pub struct LocalRegion
{
    words: Arc<[AtomicU32]>,
    size: usize,
    alive: Arc<AtomicBool>,
}

impl LocalRegion
{
    /// Zeroed region of at least `size` bytes
    pub fn new(size: usize) -> Self
    {
        let words: Vec<AtomicU32> = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self {
            words: words.into(),
            size,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the companion side as gone
    pub fn disconnect(&self)
    {
        self.alive.store(false, Ordering::Release);
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), AccessError>
    {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(out_of_region(offset, len)),
        }
    }
}

impl ChannelRegion for LocalRegion
{
    fn size(&self) -> usize
    {
        self.size
    }

    fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<(), AccessError>
    {
        self.check(offset, buf.len())?;
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = offset + i;
            let word = self.words[at / 4].load(Ordering::Acquire);
            *byte = (word >> ((at % 4) * 8)) as u8;
        }
        Ok(())
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), AccessError>
    {
        self.check(offset, data.len())?;
        for (i, &byte) in data.iter().enumerate() {
            let at = offset + i;
            let shift = (at % 4) * 8;
            let mask = !(0xffu32 << shift);
            let bits = u32::from(byte) << shift;
            // The closure never returns None, so the update always succeeds.
            let _ = self.words[at / 4].fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word & mask) | bits)
            });
        }
        Ok(())
    }

    fn peer_alive(&self) -> bool
    {
        self.alive.load(Ordering::Acquire)
    }

    fn load_u32(&self, offset: usize) -> Result<u32, AccessError>
    {
        self.check(offset, 4)?;
        if offset % 4 == 0 {
            return Ok(self.words[offset / 4].load(Ordering::Acquire));
        }
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn store_u32(&self, offset: usize, value: u32) -> Result<(), AccessError>
    {
        self.check(offset, 4)?;
        if offset % 4 == 0 {
            self.words[offset / 4].store(value, Ordering::Release);
            return Ok(());
        }
        self.write_bytes(offset, &value.to_le_bytes())
    }
}

/// Channel region inside the target, reached through foreign memory access
#[derive(Debug, Clone)]
pub struct RemoteRegion<M>
{
    memory: M,
    base: Address,
    size: usize,
}

impl<M: MemoryRead + MemoryWrite + fmt::Debug> RemoteRegion<M>
{
    pub fn new(memory: M, base: Address, size: usize) -> Self
    {
        Self { memory, base, size }
    }

    /// Region at the layout's `channel/region` address
    pub fn from_layout(memory: M, layout: &LayoutDescriptor, channel: &ChannelLayout) -> Result<Self, MissingDefinition>
    {
        let base = layout.get_address("channel/region")?;
        Ok(Self::new(memory, base, channel.region_size()))
    }

    pub fn base(&self) -> Address
    {
        self.base
    }

    fn at(&self, offset: usize, len: usize) -> Result<Address, AccessError>
    {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.base + offset as u64),
            _ => Err(out_of_region(offset, len)),
        }
    }
}

impl<M: MemoryRead + MemoryWrite + fmt::Debug> ChannelRegion for RemoteRegion<M>
{
    fn size(&self) -> usize
    {
        self.size
    }

    fn read_into(&self, offset: usize, buf: &mut [u8]) -> Result<(), AccessError>
    {
        let addr = self.at(offset, buf.len())?;
        self.memory.read_into(addr, buf)
    }

    fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), AccessError>
    {
        let addr = self.at(offset, data.len())?;
        self.memory.write_bytes(addr, data)
    }

    /// The region stays readable for as long as the target lives
    fn peer_alive(&self) -> bool
    {
        self.memory.read_u32(self.base).is_ok()
    }
}

/// Client end of the mailbox protocol
#[derive(Debug)]
pub struct CommandChannel<R: ChannelRegion>
{
    region: R,
    layout: ChannelLayout,
    use_yield: bool,
    check_every: u32,
    spin_limit: Option<u64>,
    modules: SmallVec<[u16; 8]>,
    suspended: bool,
}

impl<R: ChannelRegion> CommandChannel<R>
{
    /// Wrap a region
    ///
    /// ## Errors
    ///
    /// [`ChannelError::Layout`] when the region is too small for `layout` or the client slot
    /// does not exist.
    pub fn new(region: R, layout: ChannelLayout, config: &CoreConfig) -> Result<Self, ChannelError>
    {
        layout.validate(region.size())?;
        Ok(Self {
            region,
            layout,
            use_yield: config.channel_yield,
            check_every: config.channel_check_every.max(1),
            spin_limit: config.channel_spin_limit,
            modules: SmallVec::new(),
            suspended: false,
        })
    }

    pub fn layout(&self) -> &ChannelLayout
    {
        &self.layout
    }

    pub fn region(&self) -> &R
    {
        &self.region
    }

    pub fn payload_capacity(&self) -> usize
    {
        self.layout.payload_size
    }

    /// Whether this client holds the companion suspended
    pub fn is_suspended(&self) -> bool
    {
        self.suspended
    }

    /// Current value of this client's control word
    pub fn state(&self) -> Result<u32, ChannelError>
    {
        Ok(self.region.load_u32(self.layout.control_offset())?)
    }

    /// Issue one command and wait for the companion to complete it
    ///
    /// Returns `Ok(false)` when `command` names a module this channel never acquired, or
    /// when the companion answers with [`CoreCommand::Error`].
    ///
    /// ## Errors
    ///
    /// - [`ChannelError::PeerGone`] when the liveness check fails while waiting
    /// - [`ChannelError::Timeout`] when the configured spin limit runs out
    pub fn set_and_wait(&self, command: impl Into<Command>) -> Result<bool, ChannelError>
    {
        let command = command.into();
        if command.module != CORE_MODULE && !self.modules.contains(&command.module) {
            trace!(module = command.module, "command for unknown module");
            return Ok(false);
        }
        let wire = command.wire();
        self.region.store_u32(self.layout.control_offset(), wire)?;
        let reply = self.wait_while(wire)?;
        Ok(reply != CoreCommand::Error.wire())
    }

    /// Spin until the control word differs from `wire`, returning the new value
    fn wait_while(&self, wire: u32) -> Result<u32, ChannelError>
    {
        let control = self.layout.control_offset();
        let mut spins: u64 = 0;
        let mut since_check: u32 = 0;
        loop {
            let now = self.region.load_u32(control)?;
            if now != wire {
                return Ok(now);
            }

            spins += 1;
            since_check += 1;
            if since_check >= self.check_every {
                since_check = 0;
                if !self.region.peer_alive() {
                    debug!(command = wire, "companion disappeared");
                    return Err(ChannelError::PeerGone);
                }
            }
            if self.spin_limit.is_some_and(|limit| spins >= limit) {
                return Err(ChannelError::Timeout(wire));
            }

            if self.use_yield {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Exchange versions with the companion
    ///
    /// The companion may ask for yielding (when the two sides share a single core); that
    /// request is honored even if yielding was configured off.
    ///
    /// ## Errors
    ///
    /// [`ChannelError::VersionMismatch`] when the companion speaks another core version.
    pub fn handshake(&mut self) -> Result<CompanionInfo, ChannelError>
    {
        let payload = self.layout.header_size;
        self.region.store_u32(payload, local_affinity_mask())?;
        if !self.set_and_wait(CoreCommand::Attach)? {
            return Err(ChannelError::Fault(CoreCommand::Attach.wire()));
        }
        let info = CompanionInfo {
            version: self.region.load_u32(payload + 4)?,
            pid: self.region.load_u32(payload + 8)?,
            wants_yield: self.region.load_u32(payload + 12)? != 0,
        };
        if info.version != self.layout.core_version {
            return Err(ChannelError::VersionMismatch {
                expected: self.layout.core_version,
                found: info.version,
            });
        }
        self.use_yield |= info.wants_yield;
        debug!(version = info.version, companion_pid = info.pid, yield_ = self.use_yield, "channel handshake done");
        Ok(info)
    }

    /// Hold the companion between requests
    ///
    /// A client that just resumed asks for a single step, so the companion stops again at
    /// its next window; otherwise it asks for a plain suspend. Either way this returns once
    /// the companion reports [`CoreCommand::Suspended`].
    pub fn suspend(&mut self) -> Result<(), ChannelError>
    {
        if self.suspended {
            return Ok(());
        }
        let request = if self.state()? == CoreCommand::Run.wire() {
            CoreCommand::Step
        } else {
            CoreCommand::Suspend
        };
        self.region.store_u32(self.layout.control_offset(), request.wire())?;
        let mut now = self.wait_while(request.wire())?;
        if now == CoreCommand::Suspend.wire() {
            now = self.wait_while(now)?;
        }
        if now == CoreCommand::Error.wire() {
            return Err(ChannelError::Fault(request.wire()));
        }
        self.suspended = true;
        Ok(())
    }

    /// Release the companion
    pub fn resume(&mut self) -> Result<(), ChannelError>
    {
        if !self.suspended {
            return Ok(());
        }
        self.region.store_u32(self.layout.control_offset(), CoreCommand::Run.wire())?;
        self.suspended = false;
        Ok(())
    }

    /// Look up a companion module by name and version
    ///
    /// Returns the module index, or `None` if the companion has no such module. Names
    /// longer than [`MAX_NAME_LEN`] bytes are cut.
    pub fn acquire_module(&mut self, name: &str, version: u32) -> Result<Option<u16>, ChannelError>
    {
        let payload = self.layout.header_size;
        self.region.store_u32(payload, version)?;
        self.region.write_bytes(payload + 4, &name_field(name))?;
        if !self.set_and_wait(CoreCommand::AcquireModule)? || self.region.load_u32(ERROR_FIELD)? != 0 {
            debug!(module = name, version, "companion has no such module");
            return Ok(None);
        }
        let index = self.region.load_u32(VALUE_FIELD)? as u16;
        self.remember_module(index);
        Ok(Some(index))
    }

    /// Look up a single command of a companion module
    pub fn acquire_command(&mut self, module: &str, command: &str, version: u32) -> Result<Option<Command>, ChannelError>
    {
        let payload = self.layout.header_size;
        self.region.store_u32(payload, version)?;
        self.region.write_bytes(payload + 4, &name_field(module))?;
        self.region.write_bytes(payload + 4 + NAME_FIELD_LEN, &name_field(command))?;
        if !self.set_and_wait(CoreCommand::AcquireCommand)? || self.region.load_u32(ERROR_FIELD)? != 0 {
            return Ok(None);
        }
        let found = Command::from_wire(self.region.load_u32(VALUE_FIELD)?);
        self.remember_module(found.module);
        Ok(Some(found))
    }

    fn remember_module(&mut self, index: u16)
    {
        if index != CORE_MODULE && !self.modules.contains(&index) {
            self.modules.push(index);
        }
    }

    /// Copy target memory into `buf`, one payload-sized request at a time
    pub fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), ChannelError>
    {
        let payload = self.layout.header_size;
        let mut cursor = addr;
        for chunk in buf.chunks_mut(self.layout.payload_size) {
            self.region.store_u64(ADDRESS_FIELD, cursor.value())?;
            self.region.store_u32(LENGTH_FIELD, chunk.len() as u32)?;
            self.request(CoreCommand::Read)?;
            self.region.read_into(payload, chunk)?;
            cursor = cursor + chunk.len() as u64;
        }
        Ok(())
    }

    /// Copy `data` into target memory, one payload-sized request at a time
    pub fn write(&self, addr: Address, data: &[u8]) -> Result<(), ChannelError>
    {
        let payload = self.layout.header_size;
        let mut cursor = addr;
        for chunk in data.chunks(self.layout.payload_size) {
            self.region.store_u64(ADDRESS_FIELD, cursor.value())?;
            self.region.store_u32(LENGTH_FIELD, chunk.len() as u32)?;
            self.region.write_bytes(payload, chunk)?;
            self.request(CoreCommand::Write)?;
            cursor = cursor + chunk.len() as u64;
        }
        Ok(())
    }

    /// Read a scalar with the fixed-width read commands
    pub fn read_scalar(&self, addr: Address, width: usize) -> Result<u64, ChannelError>
    {
        self.region.store_u64(ADDRESS_FIELD, addr.value())?;
        let command = match width {
            1 => CoreCommand::ReadByte,
            2 => CoreCommand::ReadWord,
            4 => CoreCommand::ReadDword,
            8 => CoreCommand::ReadQuad,
            _ => {
                return Err(ChannelError::PayloadTooLarge {
                    len: width,
                    capacity: 8,
                })
            }
        };
        self.request(command)?;
        if width == 8 {
            Ok(self.region.load_u64(QUAD_FIELD)?)
        } else {
            Ok(u64::from(self.region.load_u32(VALUE_FIELD)?))
        }
    }

    /// Write a scalar with the fixed-width write commands
    pub fn write_scalar(&self, addr: Address, width: usize, value: u64) -> Result<(), ChannelError>
    {
        self.region.store_u64(ADDRESS_FIELD, addr.value())?;
        let command = match width {
            1 => CoreCommand::WriteByte,
            2 => CoreCommand::WriteWord,
            4 => CoreCommand::WriteDword,
            8 => CoreCommand::WriteQuad,
            _ => {
                return Err(ChannelError::PayloadTooLarge {
                    len: width,
                    capacity: 8,
                })
            }
        };
        if width == 8 {
            self.region.store_u64(QUAD_FIELD, value)?;
        } else {
            self.region.store_u32(VALUE_FIELD, value as u32)?;
        }
        self.request(command)
    }

    /// Read the standard-library string object at `addr` in one request
    ///
    /// The companion decodes the string with the target's own runtime, so no
    /// [`ContainerAbi`](crate::abi::ContainerAbi) is involved. Strings longer than the payload
    /// area come back cut to it.
    pub fn read_foreign_string(&self, addr: Address) -> Result<String, ChannelError>
    {
        self.region.store_u64(ADDRESS_FIELD, addr.value())?;
        self.request(CoreCommand::ReadStlString)?;
        let len = (self.region.load_u32(VALUE_FIELD)? as usize).min(self.layout.payload_size);
        let mut bytes = vec![0u8; len];
        self.region.read_into(self.layout.header_size, &mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Assign `value` to the standard-library string object at `addr`
    ///
    /// The companion reads the payload up to its NUL terminator, so `value` travels with one
    /// appended and may not contain one itself.
    ///
    /// ## Errors
    ///
    /// - [`ChannelError::EmbeddedNul`] when `value` contains a NUL byte
    /// - [`ChannelError::PayloadTooLarge`] when `value` and its terminator exceed the payload
    /// - [`ChannelError::Fault`] when the companion could not assign it
    pub fn write_foreign_string(&self, addr: Address, value: &str) -> Result<(), ChannelError>
    {
        if value.as_bytes().contains(&0) {
            return Err(ChannelError::EmbeddedNul(addr));
        }
        let len = value.len() + 1;
        if len > self.layout.payload_size {
            return Err(ChannelError::PayloadTooLarge {
                len,
                capacity: self.layout.payload_size,
            });
        }

        let payload = self.layout.header_size;
        self.region.store_u64(ADDRESS_FIELD, addr.value())?;
        self.region.store_u32(LENGTH_FIELD, value.len() as u32)?;
        self.region.write_bytes(payload, value.as_bytes())?;
        self.region.write_bytes(payload + value.len(), &[0])?;
        self.request(CoreCommand::WriteStlString)
    }

    /// Core request whose failure is a fault rather than a soft `false`
    fn request(&self, command: CoreCommand) -> Result<(), ChannelError>
    {
        if self.set_and_wait(command)? {
            Ok(())
        } else {
            Err(ChannelError::Fault(command.wire()))
        }
    }

    fn read_as_access(&self, addr: Address, width: usize) -> Result<u64, AccessError>
    {
        self.read_scalar(addr, width)
            .map_err(|err| channel_to_access(err, addr, width))
    }
}

fn channel_to_access(err: ChannelError, addr: Address, len: usize) -> AccessError
{
    match err {
        ChannelError::Access(access) => access,
        ChannelError::PeerGone => AccessError::TargetExited,
        _ => AccessError::Denied { address: addr, len },
    }
}

impl<R: ChannelRegion> MemoryRead for CommandChannel<R>
{
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>
    {
        let len = buf.len();
        self.read(addr, buf).map_err(|err| channel_to_access(err, addr, len))
    }

    fn read_u8(&self, addr: Address) -> Result<u8, AccessError>
    {
        self.read_as_access(addr, 1).map(|value| value as u8)
    }

    fn read_u16(&self, addr: Address) -> Result<u16, AccessError>
    {
        self.read_as_access(addr, 2).map(|value| value as u16)
    }

    fn read_u32(&self, addr: Address) -> Result<u32, AccessError>
    {
        self.read_as_access(addr, 4).map(|value| value as u32)
    }

    fn read_u64(&self, addr: Address) -> Result<u64, AccessError>
    {
        self.read_as_access(addr, 8)
    }
}

impl<R: ChannelRegion> MemoryWrite for CommandChannel<R>
{
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        self.write(addr, data)
            .map_err(|err| channel_to_access(err, addr, data.len()))
    }
}

/// NUL-padded name field, cut to [`MAX_NAME_LEN`] bytes
fn name_field(name: &str) -> [u8; NAME_FIELD_LEN]
{
    let mut field = [0u8; NAME_FIELD_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(MAX_NAME_LEN);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// One bit per CPU this process may run on, capped at 32
fn local_affinity_mask() -> u32
{
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get()).min(32);
    if cpus == 32 {
        u32::MAX
    } else {
        (1u32 << cpus) - 1
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn quiet_config() -> CoreConfig
    {
        CoreConfig {
            channel_yield: false,
            channel_check_every: 4,
            channel_spin_limit: Some(10_000),
            ..CoreConfig::default()
        }
    }

    fn small_layout() -> ChannelLayout
    {
        ChannelLayout {
            header_size: 64,
            payload_size: 1024,
            ..ChannelLayout::standard()
        }
    }

    #[test]
    fn test_wire_value()
    {
        assert_eq!(Command::new(3, 7).wire(), 0x0003_0007);
        assert_eq!(Command::from_wire(0x0003_0007), Command::new(3, 7));
        assert_eq!(CoreCommand::Suspended.wire(), 4);
        assert_eq!(CoreCommand::WriteStlString.wire(), 21);
        assert_eq!(CoreCommand::from_code(9), Some(CoreCommand::Read));
        assert_eq!(CoreCommand::from_code(22), None);
    }

    #[test]
    fn test_local_region_bytes_and_words()
    {
        let region = LocalRegion::new(16);
        region.write_bytes(1, &[0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(region.load_u32(0).unwrap(), 0xccbb_aa00);
        region.store_u32(4, 0x1234_5678).unwrap();
        let mut buf = [0u8; 4];
        region.read_into(3, &mut buf).unwrap();
        assert_eq!(buf, [0xcc, 0x78, 0x56, 0x34]);
        assert!(region.read_into(14, &mut buf).is_err());
    }

    #[test]
    fn test_unknown_module_is_false_without_writing()
    {
        let region = LocalRegion::new(small_layout().region_size());
        let channel = CommandChannel::new(region.clone(), small_layout(), &quiet_config()).unwrap();
        assert!(!channel.set_and_wait(Command::new(5, 1)).unwrap());
        assert_eq!(region.load_u32(0).unwrap(), 0);
    }

    #[test]
    fn test_spin_limit_times_out()
    {
        let region = LocalRegion::new(small_layout().region_size());
        let channel = CommandChannel::new(region, small_layout(), &quiet_config()).unwrap();
        assert!(matches!(
            channel.set_and_wait(CoreCommand::ReadByte),
            Err(ChannelError::Timeout(wire)) if wire == CoreCommand::ReadByte.wire()
        ));
    }

    #[test]
    fn test_dead_peer_is_reported()
    {
        let region = LocalRegion::new(small_layout().region_size());
        region.disconnect();
        let channel = CommandChannel::new(region, small_layout(), &quiet_config()).unwrap();
        assert!(matches!(channel.set_and_wait(CoreCommand::Read), Err(ChannelError::PeerGone)));
    }

    #[test]
    fn test_layout_validation()
    {
        let config = quiet_config();
        let small = LocalRegion::new(32);
        assert!(matches!(
            CommandChannel::new(small, small_layout(), &config),
            Err(ChannelError::Layout(_))
        ));

        let region = LocalRegion::new(small_layout().region_size());
        assert!(matches!(
            CommandChannel::new(region, small_layout().with_client(MAX_CLIENTS), &config),
            Err(ChannelError::Layout(_))
        ));
    }

    #[test]
    fn test_unsendable_strings_are_refused_locally()
    {
        let region = LocalRegion::new(small_layout().region_size());
        let channel = CommandChannel::new(region.clone(), small_layout(), &quiet_config()).unwrap();
        let addr = Address::new(0x1800);

        assert!(matches!(
            channel.write_foreign_string(addr, "urist\0mcurist"),
            Err(ChannelError::EmbeddedNul(at)) if at == addr
        ));
        assert!(matches!(
            channel.write_foreign_string(addr, &"x".repeat(1024)),
            Err(ChannelError::PayloadTooLarge { len: 1025, capacity: 1024 })
        ));
        // Nothing reached the control word, so no companion was asked.
        assert_eq!(region.load_u32(0).unwrap(), 0);
    }

    #[test]
    fn test_name_field_is_cut_and_terminated()
    {
        let long = "x".repeat(400);
        let field = name_field(&long);
        assert_eq!(field[MAX_NAME_LEN - 1], b'x');
        assert_eq!(field[MAX_NAME_LEN], 0);
    }
}
