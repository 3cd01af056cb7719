//! # Word-Poke Writes
//!
//! POSIX debug interfaces only write whole, aligned machine words (`PTRACE_POKEDATA`). This
//! module turns an arbitrary byte write into a sequence of word pokes:
//!
//! 1. the range is split into naturally aligned 8/4/2/1-byte pieces, largest first, in
//!    ascending address order, none wider than the poke word;
//! 2. every piece lies inside exactly one aligned word; consecutive pieces of the same word
//!    are merged into one poke;
//! 3. a word the range covers completely is written directly; any other word is peeked
//!    first and only the covered bytes are replaced, so bytes outside the requested range
//!    keep their value.
//!
//! No peek or poke ever touches a word outside the aligned words spanning the range, so a
//! write ending at the last byte of a mapping stays inside it.
//!
//! The decomposition is pure and is tested against the in-memory double; the Linux backend
//! supplies the actual peek/poke calls.
//!
//! ## References
//!
//! - [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html) (`PTRACE_PEEKDATA`, `PTRACE_POKEDATA`)

use smallvec::SmallVec;

use crate::error::AccessError;
use crate::types::{Address, WordSize};

/// Word-granular access to a foreign address space
pub trait WordPoke
{
    /// Width of a single poke
    fn poke_width(&self) -> WordSize;

    /// Read the aligned word at `addr`
    fn peek_word(&self, addr: Address) -> Result<u64, AccessError>;

    /// Write the aligned word at `addr`; only the low `poke_width()` bytes of `value` are used
    fn poke_word(&self, addr: Address, value: u64) -> Result<(), AccessError>;
}

/// One piece of a decomposed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PokeStep
{
    /// Offset of the piece from the start of the write.
    pub offset: usize,
    /// 8, 4, 2 or 1; the piece's address is a multiple of it.
    pub width: usize,
}

/// Split a `len`-byte write at `addr` into aligned pieces no wider than `word`
///
/// ```rust
/// use remora_core::memory::poke::{plan, PokeStep};
/// use remora_core::types::{Address, WordSize};
///
/// let steps = plan(Address::new(0x1003), 7, WordSize::Eight);
/// assert_eq!(steps.as_slice(), &[
///     PokeStep { offset: 0, width: 1 },
///     PokeStep { offset: 1, width: 4 },
///     PokeStep { offset: 5, width: 2 },
/// ]);
/// ```
pub fn plan(addr: Address, len: usize, word: WordSize) -> SmallVec<[PokeStep; 8]>
{
    let mut steps = SmallVec::new();
    let mut offset = 0;
    while offset < len {
        let at = addr.value().wrapping_add(offset as u64);
        let width = [8usize, 4, 2]
            .into_iter()
            .find(|&width| width <= word.bytes() && at % width as u64 == 0 && len - offset >= width)
            .unwrap_or(1);
        steps.push(PokeStep { offset, width });
        offset += width;
    }
    steps
}

/// Write `data` at `addr` through word pokes
///
/// ## Errors
///
/// The first failing peek or poke. Words before it have already been written.
pub fn write_via_pokes<P: WordPoke + ?Sized>(target: &P, addr: Address, data: &[u8]) -> Result<(), AccessError>
{
    let word = target.poke_width();
    let width = word.bytes() as u64;
    let start = addr.value();
    let end = start.checked_add(data.len() as u64).ok_or(AccessError::Denied {
        address: addr,
        len: data.len(),
    })?;

    let mut held: Option<(u64, [u8; 8])> = None;
    for step in plan(addr, data.len(), word) {
        let at = start + step.offset as u64;
        let aligned = at & !(width - 1);
        let (word_addr, mut bytes) = match held.take() {
            Some((word_addr, bytes)) if word_addr == aligned => (word_addr, bytes),
            previous => {
                if let Some((word_addr, bytes)) = previous {
                    target.poke_word(Address::new(word_addr), u64::from_le_bytes(bytes))?;
                }
                let covered = aligned >= start && aligned + width <= end;
                let bytes = if covered {
                    [0u8; 8]
                } else {
                    target.peek_word(Address::new(aligned))?.to_le_bytes()
                };
                (aligned, bytes)
            }
        };
        let inner = (at - word_addr) as usize;
        bytes[inner..inner + step.width].copy_from_slice(&data[step.offset..step.offset + step.width]);
        held = Some((word_addr, bytes));
    }
    if let Some((word_addr, bytes)) = held {
        target.poke_word(Address::new(word_addr), u64::from_le_bytes(bytes))?;
    }
    Ok(())
}
