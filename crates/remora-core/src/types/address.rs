//! Foreign memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address inside the target process
///
/// Every pointer read out of the target (dispatch-table pointers, string buffers, array bounds)
/// is kept as an `Address` rather than a host pointer. The only way to look behind an
/// `Address` is through a [`MemoryRead`](crate::memory::MemoryRead) implementation, so foreign
/// values are never dereferenced by the host directly.
///
/// ## Address Space
///
/// The target may be a 32-bit image running on a 64-bit host (the wrapped case on Linux), so
/// addresses are stored as `u64` and narrowed by [`WordSize`](crate::types::WordSize) only
/// when a pointer-sized field is read or written.
///
/// ## Example
///
/// ```rust
/// use remora_core::types::Address;
///
/// let addr = Address::from(0x1000u64);
/// let next_addr = addr + 0x100;
/// assert_eq!(next_addr.value(), 0x1100);
/// assert_eq!(next_addr.offset(-0x200), Address::new(0xf00));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    ///
    /// Foreign structures use it as "no object"; reading through it is always an error.
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// ```rust
    /// use remora_core::types::Address;
    ///
    /// const IMAGE_BASE: Address = Address::new(0x0040_0000);
    /// ```
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Returns `true` for the null address
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ```rust
    /// use remora_core::types::Address;
    ///
    /// let addr = Address::from(0x1000u64);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100u64)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Apply a signed field offset, wrapping on overflow
    ///
    /// Layout offsets are signed (a header may precede the pointer it describes), so this is
    /// the usual way to go from an object base to one of its fields.
    pub const fn offset(self, delta: i64) -> Self
    {
        Address(self.0.wrapping_add_signed(delta))
    }

    /// Apply a signed offset, returning `None` if the result leaves the `u64` range
    pub fn checked_offset(self, delta: i64) -> Option<Self>
    {
        self.0.checked_add_signed(delta).map(Address)
    }

    /// Signed distance `self - origin`
    ///
    /// Used when rebasing: the distance between the recorded and the observed image base.
    pub const fn delta_from(self, origin: Address) -> i64
    {
        self.0.wrapping_sub(origin.0) as i64
    }

    /// Add an offset to this address, saturating at the maximum value
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<u32> for Address
{
    fn from(value: u32) -> Self
    {
        Address(u64::from(value))
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_signed_offsets()
    {
        let base = Address::new(0x1000);
        assert_eq!(base.offset(0x10), Address::new(0x1010));
        assert_eq!(base.offset(-0x10), Address::new(0x0ff0));
        assert_eq!(Address::ZERO.checked_offset(-1), None);
        assert_eq!(Address::new(0x2000).delta_from(base), 0x1000);
        assert_eq!(base.delta_from(Address::new(0x2000)), -0x1000);
    }
}
