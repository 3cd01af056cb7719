//! # Foreign Container Decoding
//!
//! Reconstructs the target's dynamic strings and arrays from raw memory.
//!
//! Two C++ runtimes are supported, selected once per [`LayoutDescriptor`] by its target OS:
//!
//! - **Inline (MSVC)**: the string header is a 16-byte buffer union'd with a heap pointer,
//!   followed by length and capacity words. While `capacity < 16` the characters live in
//!   the buffer itself; otherwise the buffer holds a pointer to them.
//! - **Out-of-line (libstdc++ COW)**: the string header is a single pointer to the
//!   characters. A `{ length, capacity, refcount }` record sits immediately before them.
//!
//! Arrays (`std::vector`) are the same in both: `start`, `finish` and `end_of_storage`
//! pointers, with MSVC 2008-era builds prefixing an allocator word.
//!
//! Every read goes through [`MemoryRead`]; nothing here dereferences a foreign pointer
//! directly. [`assign_foreign_string`] is the one writer: it replaces a string's characters
//! inside the buffer the target already allocated.

use tracing::trace;

use crate::error::AccessError;
use crate::layout::LayoutDescriptor;
use crate::memory::{MemoryRead, MemoryWrite};
use crate::types::{Address, TargetOs, WordSize};

/// Capacity below which an inline-ABI string keeps its characters in the header
pub const INLINE_CAPACITY: u64 = 16;

/// Default upper bound for a decoded string or array, in bytes
pub const DEFAULT_MAX_LEN: usize = 16 * 1024 * 1024;

/// String representation used by the target's C++ runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringAbi
{
    /// Small-buffer strings with length and capacity words at fixed offsets.
    Inline
    {
        buffer_offset: i64,
        length_offset: i64,
        capacity_offset: i64,
    },
    /// Pointer to characters preceded by a `{ length, capacity, refcount }` record.
    OutOfLine
    {
        record_size: u64,
    },
}

impl StringAbi
{
    /// MSVC 2008 layout: allocator word, 16-byte buffer, size, capacity
    pub fn msvc(word: WordSize) -> Self
    {
        let w = word.bytes() as i64;
        StringAbi::Inline {
            buffer_offset: w,
            length_offset: w + 16,
            capacity_offset: w + 16 + w,
        }
    }

    /// libstdc++ reference-counted layout
    pub fn refcounted(word: WordSize) -> Self
    {
        // length and capacity are size_t, refcount is an int padded to a word
        StringAbi::OutOfLine {
            record_size: 3 * word.bytes() as u64,
        }
    }
}

/// Field offsets of a dynamic array header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout
{
    pub start_offset: i64,
    pub finish_offset: i64,
    /// `end_of_storage`; unused for decoding but part of the header size.
    pub end_offset: Option<i64>,
}

impl ArrayLayout
{
    /// `start, finish, end_of_storage`
    pub fn three_pointer(word: WordSize) -> Self
    {
        let w = word.bytes() as i64;
        Self {
            start_offset: 0,
            finish_offset: w,
            end_offset: Some(2 * w),
        }
    }

    /// `allocator, start, finish, end_of_storage`
    pub fn with_allocator(word: WordSize) -> Self
    {
        let w = word.bytes() as i64;
        Self {
            start_offset: w,
            finish_offset: 2 * w,
            end_offset: Some(3 * w),
        }
    }
}

/// Container conventions for one layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerAbi
{
    pub word: WordSize,
    pub string: StringAbi,
    pub array: ArrayLayout,
    /// Decoded lengths above this are treated as a corrupt header.
    pub max_len: usize,
}

impl ContainerAbi
{
    /// Select the ABI for `layout`
    ///
    /// Windows images use the inline ABI, everything else the out-of-line one. The
    /// `string/MSVC` group (`buffer`, `size`, `capacity`) and the `vector` group (`start`,
    /// `finish`, `end`) override the default offsets when present.
    pub fn for_layout(layout: &LayoutDescriptor) -> Self
    {
        let word = layout.word_size();
        let string = match layout.os() {
            TargetOs::Windows => {
                let w = word.bytes() as i64;
                StringAbi::Inline {
                    buffer_offset: layout.try_get_offset("string/MSVC/buffer").unwrap_or(w),
                    length_offset: layout.try_get_offset("string/MSVC/size").unwrap_or(w + 16),
                    capacity_offset: layout.try_get_offset("string/MSVC/capacity").unwrap_or(2 * w + 16),
                }
            }
            TargetOs::Linux | TargetOs::MacOs => StringAbi::refcounted(word),
        };

        let defaults = match layout.os() {
            TargetOs::Windows => ArrayLayout::with_allocator(word),
            TargetOs::Linux | TargetOs::MacOs => ArrayLayout::three_pointer(word),
        };
        let array = ArrayLayout {
            start_offset: layout.try_get_offset("vector/start").unwrap_or(defaults.start_offset),
            finish_offset: layout.try_get_offset("vector/finish").unwrap_or(defaults.finish_offset),
            end_offset: layout.try_get_offset("vector/end").or(defaults.end_offset),
        };

        Self {
            word,
            string,
            array,
            max_len: DEFAULT_MAX_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self
    {
        self.max_len = max_len;
        self
    }
}

/// Decoded array header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignArray
{
    /// Address of the first element.
    pub base: Address,
    pub count: usize,
    pub element_size: usize,
}

impl ForeignArray
{
    /// Address of element `index`, or `None` past the end
    pub fn element(&self, index: usize) -> Option<Address>
    {
        (index < self.count).then(|| self.base + (index * self.element_size) as u64)
    }

    pub fn is_empty(&self) -> bool
    {
        self.count == 0
    }
}

/// Location and length of a string's characters
struct StringHeader
{
    data: Address,
    len: u64,
    /// Where the length word lives.
    length_at: Address,
}

fn read_string_header<M: MemoryRead + ?Sized>(
    mem: &M,
    abi: &ContainerAbi,
    addr: Address,
) -> Result<StringHeader, AccessError>
{
    match abi.string {
        StringAbi::Inline {
            buffer_offset,
            length_offset,
            capacity_offset,
        } => {
            let len = mem.read_word(addr.offset(length_offset), abi.word)?;
            let capacity = mem.read_word(addr.offset(capacity_offset), abi.word)?;
            if len > capacity {
                return Err(AccessError::Implausible {
                    address: addr,
                    what: format!("string header (length {len} > capacity {capacity})"),
                });
            }
            let data = if capacity < INLINE_CAPACITY {
                addr.offset(buffer_offset)
            } else {
                mem.read_pointer(addr.offset(buffer_offset), abi.word)?
            };
            Ok(StringHeader {
                data,
                len,
                length_at: addr.offset(length_offset),
            })
        }
        StringAbi::OutOfLine { record_size } => {
            let data = mem.read_pointer(addr, abi.word)?;
            let record = data.checked_sub(record_size).filter(|_| !data.is_null()).ok_or_else(|| {
                AccessError::Implausible {
                    address: addr,
                    what: format!("string pointer {data}"),
                }
            })?;
            let len = mem.read_word(record, abi.word)?;
            Ok(StringHeader {
                data,
                len,
                length_at: record,
            })
        }
    }
}

/// Decode the string whose header is at `addr`
///
/// ## Errors
///
/// `Implausible` when the header decodes to a length above `abi.max_len` or (inline ABI)
/// a length above the capacity; otherwise whatever the underlying reads return.
pub fn read_foreign_string<M: MemoryRead + ?Sized>(mem: &M, abi: &ContainerAbi, addr: Address) -> Result<String, AccessError>
{
    let header = read_string_header(mem, abi, addr)?;
    if header.len > abi.max_len as u64 {
        return Err(AccessError::Implausible {
            address: addr,
            what: format!("string length {}", header.len),
        });
    }
    let bytes = mem.read_bytes(header.data, header.len as usize)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode the string at `addr` into `out`, NUL-terminated
///
/// At most `out.len() - 1` characters are copied, the bound being applied before anything is
/// read, and `out[returned]` is always `0`. Returns the number of characters copied. An empty
/// `out` has no room for the terminator and receives nothing.
pub fn read_foreign_string_into<M: MemoryRead + ?Sized>(
    mem: &M,
    abi: &ContainerAbi,
    addr: Address,
    out: &mut [u8],
) -> Result<usize, AccessError>
{
    let Some(room) = out.len().checked_sub(1) else {
        return Ok(0);
    };
    let header = read_string_header(mem, abi, addr)?;
    let len = usize::try_from(header.len).map_or(room, |len| len.min(room));
    mem.read_into(header.data, &mut out[..len])?;
    out[len] = 0;
    Ok(len)
}

/// Replace the characters of the string at `addr` with `value`
///
/// `value` and a NUL terminator are written into the existing character buffer and the length
/// word is updated. Growing the buffer needs the target's allocator, so a value longer than
/// the current capacity is refused, as is a shared out-of-line representation (refcount above
/// zero) whose other owners would see the change.
///
/// ## Errors
///
/// `Implausible` when the header does not decode, the capacity is too small or the
/// representation is shared; otherwise whatever the underlying reads and writes return.
pub fn assign_foreign_string<M: MemoryRead + MemoryWrite + ?Sized>(
    mem: &M,
    abi: &ContainerAbi,
    addr: Address,
    value: &str,
) -> Result<(), AccessError>
{
    let header = read_string_header(mem, abi, addr)?;
    let capacity = match abi.string {
        StringAbi::Inline { capacity_offset, .. } => mem.read_word(addr.offset(capacity_offset), abi.word)?,
        StringAbi::OutOfLine { .. } => {
            let width = abi.word.bytes() as u64;
            // libstdc++ counts owners beyond the first.
            let refcount = mem.read_u32(header.length_at + 2 * width)? as i32;
            if refcount > 0 {
                return Err(AccessError::Implausible {
                    address: addr,
                    what: format!("in-place assignment to a string shared by {} owners", refcount + 1),
                });
            }
            mem.read_word(header.length_at + width, abi.word)?
        }
    };

    let len = value.len() as u64;
    if len > capacity || len > abi.max_len as u64 {
        return Err(AccessError::Implausible {
            address: addr,
            what: format!("string of {len} bytes for capacity {capacity}"),
        });
    }

    let mut bytes = Vec::with_capacity(value.len() + 1);
    bytes.extend_from_slice(value.as_bytes());
    bytes.push(0);
    mem.write_bytes(header.data, &bytes)?;
    mem.write_word(header.length_at, abi.word, len)?;
    trace!(%addr, len, capacity, "assigned foreign string");
    Ok(())
}

/// Decode the array header at `addr`
///
/// ## Errors
///
/// `Implausible` for a zero `element_size` or a `finish` before `start`.
pub fn read_foreign_array<M: MemoryRead + ?Sized>(
    mem: &M,
    abi: &ContainerAbi,
    addr: Address,
    element_size: usize,
) -> Result<ForeignArray, AccessError>
{
    if element_size == 0 {
        return Err(AccessError::Implausible {
            address: addr,
            what: "array element size 0".to_string(),
        });
    }

    let start = mem.read_pointer(addr.offset(abi.array.start_offset), abi.word)?;
    let finish = mem.read_pointer(addr.offset(abi.array.finish_offset), abi.word)?;
    if finish < start {
        return Err(AccessError::Implausible {
            address: addr,
            what: format!("array bounds {start}..{finish}"),
        });
    }

    let span = finish.value() - start.value();
    if span % element_size as u64 != 0 {
        trace!(%addr, span, element_size, "array span is not a multiple of the element size");
    }

    Ok(ForeignArray {
        base: start,
        count: (span / element_size as u64) as usize,
        element_size,
    })
}

/// Read every element of an array of pointers
pub fn read_pointer_array<M: MemoryRead + ?Sized>(
    mem: &M,
    abi: &ContainerAbi,
    addr: Address,
) -> Result<Vec<Address>, AccessError>
{
    let width = abi.word.bytes();
    let array = read_foreign_array(mem, abi, addr, width)?;
    if array.count.saturating_mul(width) > abi.max_len {
        return Err(AccessError::Implausible {
            address: addr,
            what: format!("pointer array of {} elements", array.count),
        });
    }

    let bytes = mem.read_bytes(array.base, array.count * width)?;
    Ok(bytes
        .chunks_exact(width)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word[..width].copy_from_slice(chunk);
            Address::new(u64::from_le_bytes(word))
        })
        .collect())
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::layout::LayoutBuilder;

    #[test]
    fn test_selection_by_os()
    {
        let windows = LayoutBuilder::new("w", TargetOs::Windows, WordSize::Four).build();
        let abi = ContainerAbi::for_layout(&windows);
        assert_eq!(abi.string, StringAbi::msvc(WordSize::Four));
        assert_eq!(abi.array.start_offset, 4);

        let linux = LayoutBuilder::new("l", TargetOs::Linux, WordSize::Four).build();
        let abi = ContainerAbi::for_layout(&linux);
        assert_eq!(abi.string, StringAbi::OutOfLine { record_size: 12 });
        assert_eq!(abi.array, ArrayLayout::three_pointer(WordSize::Four));
    }

    #[test]
    fn test_layout_overrides()
    {
        let layout = LayoutBuilder::new("w", TargetOs::Windows, WordSize::Four)
            .with_offset("string/MSVC/buffer", 0)
            .with_offset("string/MSVC/size", 16)
            .with_offset("string/MSVC/capacity", 20)
            .with_offset("vector/start", 0)
            .with_offset("vector/finish", 4)
            .build();
        let abi = ContainerAbi::for_layout(&layout);

        assert_eq!(
            abi.string,
            StringAbi::Inline {
                buffer_offset: 0,
                length_offset: 16,
                capacity_offset: 20,
            }
        );
        assert_eq!(abi.array.finish_offset, 4);
        assert_eq!(abi.array.end_offset, Some(12));
    }

    #[test]
    fn test_array_element_addresses()
    {
        let array = ForeignArray {
            base: Address::new(0x100),
            count: 3,
            element_size: 8,
        };
        assert_eq!(array.element(2), Some(Address::new(0x110)));
        assert_eq!(array.element(3), None);
    }
}
