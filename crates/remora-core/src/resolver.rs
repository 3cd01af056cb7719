//! # Runtime Type Resolver
//!
//! Identifies the concrete class of a polymorphic object inside the target.
//!
//! The target ships without symbols, so the only stable signal for "what is this object" is
//! its first word: the dispatch-table pointer shared by every instance of a class. Some
//! families share one dispatch table between several sub-kinds and tell them apart with a
//! small integer field; for those the resolver reads that field as well.
//!
//! ## Algorithm
//!
//! 1. Read the dispatch pointer at the object address.
//! 2. Look it up in the class table. On a miss, derive the class name through the
//!    [`RttiStrategy`] and register it (a name the layout already declared keeps its id).
//! 3. No discriminant: the family id is the answer.
//! 4. Otherwise read the discriminant; a known value yields the variant id, an unknown one
//!    falls back to the family id.
//!
//! ## Example
//!
//! ```rust
//! use remora_core::layout::LayoutBuilder;
//! use remora_core::mock::MockProcess;
//! use remora_core::resolver::TypeResolver;
//! use remora_core::rtti::strategy_for;
//! use remora_core::types::{Address, TargetOs, WordSize};
//!
//! let mock = MockProcess::builder().map(0x1000, 0x100).build();
//! mock.store(Address::new(0x1080), &0x1010u32.to_le_bytes())?;
//!
//! let mut layout = LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
//!     .with_class("unit", Some(Address::new(0x1010)))
//!     .build();
//! let rtti = strategy_for(TargetOs::Linux, WordSize::Four);
//! let mut resolver = TypeResolver::new(&mock, layout.classes_mut(), rtti.as_ref(), WordSize::Four);
//!
//! let id = resolver.resolve_type(Address::new(0x1080))?;
//! assert_eq!(resolver.class_id_to_name(id), Some("unit"));
//! # Ok::<(), remora_core::error::AccessError>(())
//! ```

use tracing::trace;

use crate::error::AccessError;
use crate::layout::{ClassId, ClassTable, Discriminant};
use crate::memory::MemoryRead;
use crate::rtti::RttiStrategy;
use crate::types::{Address, WordSize};

/// Resolver over one memory view and one class table
///
/// Borrowing the table mutably is what lets the pointer cache grow while resolving.
#[derive(Debug)]
pub struct TypeResolver<'a, M: MemoryRead>
{
    memory: M,
    classes: &'a mut ClassTable,
    rtti: &'a dyn RttiStrategy,
    word: WordSize,
}

impl<'a, M: MemoryRead> TypeResolver<'a, M>
{
    pub fn new(memory: M, classes: &'a mut ClassTable, rtti: &'a dyn RttiStrategy, word: WordSize) -> Self
    {
        Self {
            memory,
            classes,
            rtti,
            word,
        }
    }

    /// Class id of the object at `object`
    ///
    /// ## Errors
    ///
    /// Read failures from the memory view. A null dispatch pointer is reported as
    /// [`AccessError::Implausible`]. An unknown discriminant value is not an error.
    pub fn resolve_type(&mut self, object: Address) -> Result<ClassId, AccessError>
    {
        let dispatch_ptr = self.memory.read_pointer(object, self.word)?;
        let (family, discriminant) = self.family_for(dispatch_ptr)?;

        let Some(discriminant) = discriminant else {
            return Ok(family);
        };

        let value = self.read_discriminant(object, discriminant)?;
        let variant = self.classes.entry(family).and_then(|entry| entry.variant(value));
        if variant.is_none() {
            trace!(%object, family = family.0, value, "unknown discriminant, using family");
        }
        Ok(variant.unwrap_or(family))
    }

    pub fn class_name_to_id(&self, name: &str) -> Option<ClassId>
    {
        self.classes.class_id(name)
    }

    pub fn class_id_to_name(&self, id: ClassId) -> Option<&str>
    {
        self.classes.class_name(id)
    }

    /// Dispatch pointer of a family
    ///
    /// Multi-variant sub-kinds share their family's pointer and are not distinguished here.
    pub fn class_name_to_dispatch_ptr(&self, name: &str) -> Option<Address>
    {
        self.classes.dispatch_ptr(name)
    }

    fn family_for(&mut self, dispatch_ptr: Address) -> Result<(ClassId, Option<Discriminant>), AccessError>
    {
        if let Some(entry) = self.classes.entry_for_dispatch_ptr(dispatch_ptr) {
            return Ok((entry.id(), entry.discriminant()));
        }
        if dispatch_ptr.is_null() {
            return Err(AccessError::Implausible {
                address: dispatch_ptr,
                what: "null dispatch pointer".to_string(),
            });
        }

        let name = self.rtti.class_name(&self.memory, dispatch_ptr)?;
        let id = self.classes.register_class(&name, Some(dispatch_ptr), None);
        let discriminant = self.classes.entry(id).and_then(|entry| entry.discriminant());
        Ok((id, discriminant))
    }

    fn read_discriminant(&self, object: Address, discriminant: Discriminant) -> Result<u32, AccessError>
    {
        let at = object.offset(discriminant.offset);
        match discriminant.width {
            1 => self.memory.read_u8(at).map(u32::from),
            4 => self.memory.read_u32(at),
            _ => self.memory.read_u16(at).map(u32::from),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::layout::LayoutBuilder;
    use crate::mock::MockProcess;
    use crate::rtti::ItaniumRtti;
    use crate::types::TargetOs;

    #[test]
    fn test_unknown_pointer_is_named_through_rtti()
    {
        let mock = MockProcess::builder().map(0x1000, 0x200).build();
        // object 0x1100 → vtable 0x1010 → type_info 0x1040 → "4item"
        mock.store(Address::new(0x1100), &0x1010u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x100c), &0x1040u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x1044), &0x1080u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x1080), b"4item\0").unwrap();

        let mut layout = LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
            .with_class("unit", None)
            .build();
        let rtti = ItaniumRtti { word: WordSize::Four };
        let mut resolver = TypeResolver::new(&mock, layout.classes_mut(), &rtti, WordSize::Four);

        let id = resolver.resolve_type(Address::new(0x1100)).unwrap();
        assert_eq!(id, ClassId(1));
        assert_eq!(resolver.class_id_to_name(id), Some("item"));
        assert_eq!(resolver.class_name_to_dispatch_ptr("item"), Some(Address::new(0x1010)));
    }

    #[test]
    fn test_null_dispatch_pointer()
    {
        let mock = MockProcess::builder().map(0x1000, 0x100).build();
        let mut classes = ClassTable::new();
        let rtti = ItaniumRtti { word: WordSize::Four };
        let mut resolver = TypeResolver::new(&mock, &mut classes, &rtti, WordSize::Four);

        assert!(matches!(
            resolver.resolve_type(Address::new(0x1000)),
            Err(AccessError::Implausible { .. })
        ));
    }

    #[test]
    fn test_narrow_and_wide_discriminants()
    {
        let mock = MockProcess::builder().map(0x1000, 0x100).build();
        mock.store(Address::new(0x1080), &0x1010u32.to_le_bytes()).unwrap();
        mock.store(Address::new(0x1084), &[2, 0xff, 0xff, 0xff]).unwrap();

        for (width, expected) in [(1u8, "two"), (4u8, "all")] {
            let mut layout = LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
                .with_variant_class(
                    "job",
                    Some(Address::new(0x1010)),
                    Discriminant::new(4).with_width(width),
                    &[("two", 2), ("all", 0xffff_ff02)],
                )
                .build();
            let rtti = ItaniumRtti { word: WordSize::Four };
            let mut resolver = TypeResolver::new(&mock, layout.classes_mut(), &rtti, WordSize::Four);

            let id = resolver.resolve_type(Address::new(0x1080)).unwrap();
            assert_eq!(resolver.class_id_to_name(id), Some(expected));
        }
    }
}
