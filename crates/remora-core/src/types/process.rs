//! Process, thread, target platform and memory range types.

use std::fmt;
use std::str::FromStr;

use super::Address;

/// Process identifier (PID)
///
/// ## Example
///
/// ```rust
/// use remora_core::types::ProcessId;
///
/// let pid = ProcessId::from(12345);
/// assert_eq!(pid.raw(), 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    /// Raw PID value
    pub fn raw(&self) -> u32
    {
        self.0
    }
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier
///
/// - **macOS**: Mach thread port (`thread_act_t`)
/// - **Linux**: kernel TID from `/proc/<pid>/task`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

/// Attachment state of a [`Session`](crate::Session)
///
/// ## State Transitions
///
/// - `Detached` → `Attached`: never happens directly; attaching leaves the target `Suspended`
/// - `Suspended` → `Attached`: `resume()` / `force_resume()`
/// - `Attached` → `Suspended`: `suspend()`, or `async_suspend()` followed by a successful poll
/// - any → `Detached`: `detach()`, drop, or the target dying mid-operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachState
{
    /// No OS handle is held.
    Detached,
    /// Handle held, target running.
    Attached,
    /// Handle held, target stopped.
    Suspended,
}

impl AttachState
{
    /// `true` for both `Attached` and `Suspended`
    pub fn is_attached(self) -> bool
    {
        !matches!(self, AttachState::Detached)
    }
}

/// Operating system a layout was recorded for
///
/// This is the OS the *target image* was built for, which is not necessarily the host: a
/// Windows image run under a compatibility layer on Linux is `TargetOs::Windows`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOs
{
    Linux,
    Windows,
    MacOs,
}

impl TargetOs
{
    /// OS of the host this crate was compiled for, when it is one of the known targets
    pub const fn host() -> Option<TargetOs>
    {
        if cfg!(target_os = "linux") {
            Some(TargetOs::Linux)
        } else if cfg!(target_os = "macos") {
            Some(TargetOs::MacOs)
        } else if cfg!(target_os = "windows") {
            Some(TargetOs::Windows)
        } else {
            None
        }
    }

    /// Lowercase tag used in layout metadata
    pub fn as_str(self) -> &'static str
    {
        match self {
            TargetOs::Linux => "linux",
            TargetOs::Windows => "windows",
            TargetOs::MacOs => "apple",
        }
    }
}

impl fmt::Display for TargetOs
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetOs
{
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "linux" => Ok(TargetOs::Linux),
            "windows" => Ok(TargetOs::Windows),
            "apple" | "macos" | "darwin" => Ok(TargetOs::MacOs),
            _ => Err(format!("Unknown target OS: {s}. Valid values: linux, windows, apple")),
        }
    }
}

/// Width of a pointer in the target image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordSize
{
    Four,
    Eight,
}

impl WordSize
{
    /// Pointer width of the host
    pub const fn host() -> WordSize
    {
        if cfg!(target_pointer_width = "64") {
            WordSize::Eight
        } else {
            WordSize::Four
        }
    }

    /// Width in bytes
    pub const fn bytes(self) -> usize
    {
        match self {
            WordSize::Four => 4,
            WordSize::Eight => 8,
        }
    }
}

/// A contiguous mapping in the target's address space
///
/// Produced from `/proc/<pid>/maps` on Linux and `mach_vm_region_recurse()` on macOS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRange
{
    /// First byte of the mapping.
    pub start: Address,
    /// One past the last byte.
    pub end: Address,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Shared (`s`) rather than private (`p`) mapping.
    pub shared: bool,
    /// File offset of the mapping start (0 when anonymous).
    pub file_offset: u64,
    /// Backing path or pseudo-name such as `[heap]`.
    pub name: Option<String>,
}

impl MemoryRange
{
    /// Size of the mapping in bytes
    pub fn len(&self) -> u64
    {
        self.end.value().saturating_sub(self.start.value())
    }

    /// `true` for a zero-length range
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    /// Whether `addr` falls inside this mapping
    pub fn contains(&self, addr: Address) -> bool
    {
        addr >= self.start && addr < self.end
    }

    /// Permission string in `rwxp` form
    pub fn permissions(&self) -> String
    {
        let mut perms = String::with_capacity(4);
        perms.push(if self.readable { 'r' } else { '-' });
        perms.push(if self.writable { 'w' } else { '-' });
        perms.push(if self.executable { 'x' } else { '-' });
        perms.push(if self.shared { 's' } else { 'p' });
        perms
    }

    /// Parse one line of `/proc/<pid>/maps`
    ///
    /// ```text
    /// 00400000-0040b000 r-xp 00000000 08:01 1234   /usr/bin/cat
    /// ```
    ///
    /// Returns `None` for malformed lines.
    pub fn parse_maps_line(line: &str) -> Option<MemoryRange>
    {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?.as_bytes();
        let offset = fields.next()?;
        let _device = fields.next()?;
        let _inode = fields.next()?;
        let name = fields.collect::<Vec<_>>().join(" ");

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        if perms.len() < 4 || end < start {
            return None;
        }

        Some(MemoryRange {
            start: Address::new(start),
            end: Address::new(end),
            readable: perms[0] == b'r',
            writable: perms[1] == b'w',
            executable: perms[2] == b'x',
            shared: perms[3] == b's',
            file_offset: u64::from_str_radix(offset, 16).ok()?,
            name: if name.is_empty() { None } else { Some(name) },
        })
    }
}
