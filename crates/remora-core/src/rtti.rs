//! # RTTI Name Derivation
//!
//! Recovers a class name from a dispatch-table pointer by walking the compiler's run-time type
//! information. The walk is toolchain-specific, so it sits behind [`RttiStrategy`] and one
//! implementation is picked per target OS.
//!
//! ## Itanium C++ ABI (gcc, clang)
//!
//! ```text
//! vtable[-1] ──► std::type_info { vptr, const char* name }
//!                                         └──► "N2df4unitE"
//! ```
//!
//! ## MSVC
//!
//! ```text
//! vtable[-1] ──► RTTICompleteObjectLocator { signature, offset, cd_offset, type_descriptor, ... }
//!                                                                   └──► TypeDescriptor { vptr, spare, ".?AVunit@df@@" }
//! ```
//!
//! On x64 the locator stores image-relative offsets instead of pointers; the image base is
//! recovered from the locator's own `self` offset.
//!
//! ## References
//!
//! - [Itanium C++ ABI: RTTI layout](https://itanium-cxx-abi.github.io/cxx-abi/abi.html#rtti)
//! - [Itanium C++ ABI: mangling](https://itanium-cxx-abi.github.io/cxx-abi/abi.html#mangling)
//! - [Reversing Microsoft Visual C++ Part II: Classes, Methods and RTTI](http://www.openrce.org/articles/full_view/23)

use std::fmt;

use crate::error::AccessError;
use crate::memory::{MemoryRead, DEFAULT_C_STRING_MAX};
use crate::types::{Address, TargetOs, WordSize};

/// Toolchain-specific path from a dispatch pointer to a class name
pub trait RttiStrategy: fmt::Debug
{
    /// Name of the class whose dispatch table starts at `dispatch_ptr`
    fn class_name(&self, mem: &dyn MemoryRead, dispatch_ptr: Address) -> Result<String, AccessError>;
}

/// Strategy for images built with the given OS toolchain
pub fn strategy_for(os: TargetOs, word: WordSize) -> Box<dyn RttiStrategy>
{
    match os {
        TargetOs::Windows => Box::new(MsvcRtti { word }),
        TargetOs::Linux | TargetOs::MacOs => Box::new(ItaniumRtti { word }),
    }
}

/// gcc / clang type information
#[derive(Debug, Clone, Copy)]
pub struct ItaniumRtti
{
    pub word: WordSize,
}

impl RttiStrategy for ItaniumRtti
{
    fn class_name(&self, mem: &dyn MemoryRead, dispatch_ptr: Address) -> Result<String, AccessError>
    {
        let w = self.word.bytes() as u64;
        let type_info = mem.read_pointer(dispatch_ptr - w, self.word)?;
        let name_ptr = mem.read_pointer(type_info + w, self.word)?;
        let mangled = mem.read_c_string(name_ptr, DEFAULT_C_STRING_MAX)?;
        Ok(demangle_itanium_type(&mangled))
    }
}

/// MSVC type information
#[derive(Debug, Clone, Copy)]
pub struct MsvcRtti
{
    pub word: WordSize,
}

impl RttiStrategy for MsvcRtti
{
    fn class_name(&self, mem: &dyn MemoryRead, dispatch_ptr: Address) -> Result<String, AccessError>
    {
        let w = self.word.bytes() as u64;
        let locator = mem.read_pointer(dispatch_ptr - w, self.word)?;
        let descriptor = match self.word {
            WordSize::Four => mem.read_pointer(locator + 12, self.word)?,
            WordSize::Eight => {
                let descriptor_rva = mem.read_u32(locator + 12)?;
                let self_rva = mem.read_u32(locator + 20)?;
                let image_base = locator - u64::from(self_rva);
                image_base + u64::from(descriptor_rva)
            }
        };
        let decorated = mem.read_c_string(descriptor + 2 * w, DEFAULT_C_STRING_MAX)?;
        Ok(undecorate_msvc_type(&decorated))
    }
}

/// Turn an Itanium `type_info::name()` string into `a::b::c` form
///
/// Handles plain (`4unit`) and nested (`N2df4unitE`) source names. Anything else (templates,
/// substitutions) is returned unchanged.
///
/// ```rust
/// use remora_core::rtti::demangle_itanium_type;
///
/// assert_eq!(demangle_itanium_type("14building_bedst"), "building_bedst");
/// assert_eq!(demangle_itanium_type("N2df4unitE"), "df::unit");
/// ```
pub fn demangle_itanium_type(mangled: &str) -> String
{
    let name = mangled.strip_prefix('*').unwrap_or(mangled);
    let nested = name.strip_prefix('N').and_then(|inner| inner.strip_suffix('E'));
    match parse_source_names(nested.unwrap_or(name)) {
        Some(parts) if nested.is_some() || parts.len() == 1 => parts.join("::"),
        _ => name.to_string(),
    }
}

fn parse_source_names(mut rest: &str) -> Option<Vec<&str>>
{
    let mut parts = Vec::new();
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let len: usize = rest[..digits].parse().ok()?;
        let name = rest[digits..].get(..len)?;
        parts.push(name);
        rest = &rest[digits + len..];
    }
    (!parts.is_empty()).then_some(parts)
}

/// Turn an MSVC decorated type name into `a::b::c` form
///
/// ```rust
/// use remora_core::rtti::undecorate_msvc_type;
///
/// assert_eq!(undecorate_msvc_type(".?AVitem_woodst@@"), "item_woodst");
/// assert_eq!(undecorate_msvc_type(".?AUbuilding@df@@"), "df::building");
/// ```
pub fn undecorate_msvc_type(decorated: &str) -> String
{
    let body = decorated
        .strip_prefix(".?AV")
        .or_else(|| decorated.strip_prefix(".?AU"))
        .and_then(|body| body.strip_suffix("@@"));
    match body {
        Some(body) if !body.contains('?') => body.split('@').rev().collect::<Vec<_>>().join("::"),
        _ => decorated.to_string(),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::mock::MockProcess;

    #[test]
    fn test_itanium_names()
    {
        assert_eq!(demangle_itanium_type("9unit_info"), "unit_info");
        assert_eq!(demangle_itanium_type("N2df8building4bedE"), "df::building::bed");
        assert_eq!(demangle_itanium_type("*N2df4itemE"), "df::item");
        // Templates are left alone.
        assert_eq!(demangle_itanium_type("St6vectorIiSaIiEE"), "St6vectorIiSaIiEE");
        assert_eq!(demangle_itanium_type("3abc4de"), "3abc4de");
    }

    #[test]
    fn test_msvc_names()
    {
        assert_eq!(undecorate_msvc_type(".?AVunit@df@@"), "df::unit");
        assert_eq!(undecorate_msvc_type(".?AV?$vector@H@std@@"), ".?AV?$vector@H@std@@");
        assert_eq!(undecorate_msvc_type("garbage"), "garbage");
    }

    #[test]
    fn test_itanium_chain()
    {
        let mock = MockProcess::builder().map(0x1000, 0x100).build();
        // vtable at 0x1010, type_info at 0x1040, name at 0x1080
        mock.store(Address::new(0x100c), &0x1040u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x1044), &0x1080u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x1080), b"12item_weaponst\0").unwrap();

        let name = ItaniumRtti { word: WordSize::Four }.class_name(&mock, Address::new(0x1010)).unwrap();
        assert_eq!(name, "item_weaponst");
    }

    #[test]
    fn test_msvc_chain_32()
    {
        let mock = MockProcess::builder().map(0x1000, 0x100).build();
        // vtable at 0x1010, locator at 0x1040, type descriptor at 0x1080
        mock.store(Address::new(0x100c), &0x1040u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x104c), &0x1080u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x1088), b".?AVitem_weaponst@@\0").unwrap();

        let name = MsvcRtti { word: WordSize::Four }.class_name(&mock, Address::new(0x1010)).unwrap();
        assert_eq!(name, "item_weaponst");
    }

    #[test]
    fn test_msvc_chain_64_uses_image_relative_offsets()
    {
        let mock = MockProcess::builder().map(0x14000_0000, 0x3000).build();
        let base = 0x14000_0000u64;
        let vtable = base + 0x2010;
        let locator = base + 0x1000;
        let descriptor_rva = 0x1800u32;

        mock.store(Address::new(vtable - 8), &locator.to_le_bytes()).unwrap();
        mock.store(Address::new(locator + 12), &descriptor_rva.to_le_bytes()).unwrap();
        mock.store(Address::new(locator + 20), &0x1000u32.to_le_bytes()).unwrap();
        mock.store(Address::new(base + 0x1800 + 16), b".?AVunit@df@@\0").unwrap();

        let name = MsvcRtti { word: WordSize::Eight }.class_name(&mock, Address::new(vtable)).unwrap();
        assert_eq!(name, "df::unit");
    }
}
