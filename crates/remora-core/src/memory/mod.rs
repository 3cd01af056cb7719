//! # Foreign Memory Access
//!
//! The byte-level capability every other component is written against.
//!
//! [`MemoryRead`] and [`MemoryWrite`] have a single required method each; the typed helpers
//! (`read_u32`, `read_pointer`, `write_u16`, ...) are provided methods composed from those
//! byte primitives. The session, the command channel and the in-memory test double all
//! implement the traits, so the container decoder and type resolver run unchanged on any of
//! them.
//!
//! All multi-byte values are little-endian; every supported target is x86 or x86-64.

pub mod poke;

use std::fmt::Write as _;

use crate::error::AccessError;
use crate::types::{Address, WordSize};

/// Default cap for NUL-terminated strings read with [`MemoryRead::read_c_string`]
pub const DEFAULT_C_STRING_MAX: usize = 255;

/// Chunk alignment for C string scans so a scan never straddles a page boundary
const C_STRING_CHUNK: u64 = 64;

/// Read access to a foreign address space
pub trait MemoryRead
{
    /// Fill `buf` with the bytes at `addr`
    ///
    /// Implementations must either fill the whole buffer or fail; a short transfer that
    /// cannot be resumed is reported as [`AccessError::PartialTransfer`], never as success.
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>;

    /// Read `len` bytes into a new vector
    fn read_bytes(&self, addr: Address, len: usize) -> Result<Vec<u8>, AccessError>
    {
        let mut buf = vec![0u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, addr: Address) -> Result<u8, AccessError>
    {
        Ok(read_array::<_, 1>(self, addr)?[0])
    }

    fn read_u16(&self, addr: Address) -> Result<u16, AccessError>
    {
        read_array(self, addr).map(u16::from_le_bytes)
    }

    fn read_u32(&self, addr: Address) -> Result<u32, AccessError>
    {
        read_array(self, addr).map(u32::from_le_bytes)
    }

    fn read_u64(&self, addr: Address) -> Result<u64, AccessError>
    {
        read_array(self, addr).map(u64::from_le_bytes)
    }

    fn read_i32(&self, addr: Address) -> Result<i32, AccessError>
    {
        read_array(self, addr).map(i32::from_le_bytes)
    }

    fn read_f32(&self, addr: Address) -> Result<f32, AccessError>
    {
        read_array(self, addr).map(f32::from_le_bytes)
    }

    /// Read a pointer-sized unsigned value, zero-extended to `u64`
    fn read_word(&self, addr: Address, word: WordSize) -> Result<u64, AccessError>
    {
        match word {
            WordSize::Four => self.read_u32(addr).map(u64::from),
            WordSize::Eight => self.read_u64(addr),
        }
    }

    /// Read a pointer stored in the target
    fn read_pointer(&self, addr: Address, word: WordSize) -> Result<Address, AccessError>
    {
        self.read_word(addr, word).map(Address::new)
    }

    /// Read a NUL-terminated string of at most `max` bytes
    ///
    /// The terminator is not required within `max`; the result is simply cut there. Invalid
    /// UTF-8 is replaced rather than rejected, since target strings are usually in a legacy
    /// code page.
    fn read_c_string(&self, addr: Address, max: usize) -> Result<String, AccessError>
    {
        let mut out = Vec::new();
        let mut cursor = addr;
        while out.len() < max {
            let to_boundary = (C_STRING_CHUNK - cursor.value() % C_STRING_CHUNK) as usize;
            let len = to_boundary.min(max - out.len());
            let mut chunk = [0u8; C_STRING_CHUNK as usize];
            self.read_into(cursor, &mut chunk[..len])?;
            if let Some(nul) = chunk[..len].iter().position(|b| *b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                break;
            }
            out.extend_from_slice(&chunk[..len]);
            cursor = cursor + len as u64;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Write access to a foreign address space
pub trait MemoryWrite
{
    /// Write all of `data` at `addr`
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>;

    fn write_u8(&self, addr: Address, value: u8) -> Result<(), AccessError>
    {
        self.write_bytes(addr, &[value])
    }

    fn write_u16(&self, addr: Address, value: u16) -> Result<(), AccessError>
    {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u32(&self, addr: Address, value: u32) -> Result<(), AccessError>
    {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u64(&self, addr: Address, value: u64) -> Result<(), AccessError>
    {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_i32(&self, addr: Address, value: i32) -> Result<(), AccessError>
    {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_f32(&self, addr: Address, value: f32) -> Result<(), AccessError>
    {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Write a pointer-sized value, truncating to 32 bits for 4-byte targets
    fn write_word(&self, addr: Address, word: WordSize, value: u64) -> Result<(), AccessError>
    {
        match word {
            WordSize::Four => self.write_u32(addr, value as u32),
            WordSize::Eight => self.write_u64(addr, value),
        }
    }
}

impl<M: MemoryRead + ?Sized> MemoryRead for &M
{
    fn read_into(&self, addr: Address, buf: &mut [u8]) -> Result<(), AccessError>
    {
        (**self).read_into(addr, buf)
    }
}

impl<M: MemoryWrite + ?Sized> MemoryWrite for &M
{
    fn write_bytes(&self, addr: Address, data: &[u8]) -> Result<(), AccessError>
    {
        (**self).write_bytes(addr, data)
    }
}

fn read_array<M: MemoryRead + ?Sized, const N: usize>(mem: &M, addr: Address) -> Result<[u8; N], AccessError>
{
    let mut buf = [0u8; N];
    mem.read_into(addr, &mut buf)?;
    Ok(buf)
}

/// Formats bytes into a traditional hex + ASCII view.
pub fn format_hexdump(base: Address, bytes: &[u8], width: usize) -> String
{
    let width = width.clamp(8, 32);
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(width).enumerate() {
        let addr = base.value().saturating_add((row * width) as u64);
        let _ = write!(out, "{addr:016x}: ");

        for i in 0..width {
            match chunk.get(i) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
        }

        out.push(' ');
        out.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}
