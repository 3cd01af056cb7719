//! # Layout Builder
//!
//! Fluent construction of a [`LayoutDescriptor`].
//!
//! This is the hand-off point from whatever parses layout definition files: the parser walks
//! its own format and feeds entries here. Class families are registered in call order, so the
//! order of `with_class*` calls is the order `ClassId`s are assigned in.

use super::classes::{ClassTable, Discriminant};
use super::group::OffsetGroup;
use super::{LayoutDescriptor, IMAGE_NAME_KEY, MD5_KEY, PE_TIMESTAMP_KEY};
use crate::error::{DefinitionKind, MissingReason};
use crate::types::{Address, TargetOs, WordSize};

/// Builder for [`LayoutDescriptor`]
///
/// ## Example
///
/// ```rust
/// use remora_core::layout::{Discriminant, LayoutBuilder};
/// use remora_core::types::{Address, TargetOs, WordSize};
///
/// let layout = LayoutBuilder::new("v0.31.25 windows", TargetOs::Windows, WordSize::Four)
///     .with_base(Address::new(0x0040_0000))
///     .with_pe_timestamp(0x4b7c_f8e2)
///     .with_offset("string/MSVC/buffer", 4)
///     .with_variant_class(
///         "building_workshopst",
///         Some(Address::new(0x00d4_0000)),
///         Discriminant::new(0xd4),
///         &[("Carpenters", 0), ("Farmers", 1)],
///     )
///     .build();
///
/// assert_eq!(layout.classes().len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct LayoutBuilder
{
    version: String,
    os: TargetOs,
    word_size: WordSize,
    base: Address,
    root: OffsetGroup,
    classes: ClassTable,
}

impl LayoutBuilder
{
    pub fn new(version: impl Into<String>, os: TargetOs, word_size: WordSize) -> Self
    {
        Self {
            version: version.into(),
            os,
            word_size,
            base: Address::ZERO,
            root: OffsetGroup::root(),
            classes: ClassTable::new(),
        }
    }

    /// Image base the recorded addresses assume
    pub fn with_base(mut self, base: Address) -> Self
    {
        self.base = base;
        self
    }

    pub fn with_address(mut self, key: &str, value: Address) -> Self
    {
        self.root.set_address(key, value);
        self
    }

    pub fn with_offset(mut self, key: &str, value: i64) -> Self
    {
        self.root.set_offset(key, value);
        self
    }

    pub fn with_numeric(mut self, key: &str, value: u32) -> Self
    {
        self.root.set_numeric(key, value);
        self
    }

    pub fn with_string(mut self, key: &str, value: impl Into<String>) -> Self
    {
        self.root.set_string(key, value);
        self
    }

    /// Declare a key that has no value for this build yet
    pub fn with_unset(mut self, kind: DefinitionKind, key: &str) -> Self
    {
        self.root.mark(kind, key, MissingReason::Unset);
        self
    }

    /// Declare a key that does not exist in this build
    pub fn with_invalid(mut self, kind: DefinitionKind, key: &str) -> Self
    {
        self.root.mark(kind, key, MissingReason::Invalid);
        self
    }

    pub fn with_md5(self, hex: &str) -> Self
    {
        self.with_string(MD5_KEY, hex.to_ascii_lowercase())
    }

    pub fn with_pe_timestamp(self, stamp: u32) -> Self
    {
        self.with_numeric(PE_TIMESTAMP_KEY, stamp)
    }

    /// File name of the executable image (matched case-insensitively by the locator)
    pub fn with_image_name(self, name: &str) -> Self
    {
        self.with_string(IMAGE_NAME_KEY, name)
    }

    /// Register a single-kind class family
    pub fn with_class(mut self, name: &str, dispatch_ptr: Option<Address>) -> Self
    {
        self.classes.register_class(name, dispatch_ptr, None);
        self
    }

    /// Register a multi-variant family and its named sub-kinds
    pub fn with_variant_class(
        mut self,
        name: &str,
        dispatch_ptr: Option<Address>,
        discriminant: Discriminant,
        variants: &[(&str, u32)],
    ) -> Self
    {
        let family = self.classes.register_class(name, dispatch_ptr, Some(discriminant));
        for (variant, value) in variants {
            self.classes.register_variant(family, variant, *value);
        }
        self
    }

    pub fn build(self) -> LayoutDescriptor
    {
        LayoutDescriptor {
            version: self.version,
            os: self.os,
            word_size: self.word_size,
            base: self.base,
            root: self.root,
            classes: self.classes,
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_declared_but_unusable_keys()
    {
        let layout = LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
            .with_unset(DefinitionKind::Offset, "creature/custom_profession")
            .with_invalid(DefinitionKind::Address, "cursor")
            .build();

        assert_eq!(
            layout.get_offset("creature/custom_profession").unwrap_err().reason,
            MissingReason::Unset
        );
        assert_eq!(layout.get_address("cursor").unwrap_err().reason, MissingReason::Invalid);
    }

    #[test]
    fn test_class_ids_follow_call_order()
    {
        let layout = LayoutBuilder::new("test", TargetOs::Linux, WordSize::Four)
            .with_class("unit", None)
            .with_variant_class("building_workshopst", None, Discriminant::new(0x10), &[("Forge", 3)])
            .with_class("item", None)
            .build();

        let names: Vec<&str> = layout.classes().names().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["unit", "building_workshopst", "Forge", "item"]);
    }
}
