//! # Layout Registry
//!
//! Per-build description of the target's data layout.
//!
//! The target has no symbols, and its structures move between builds. A [`LayoutDescriptor`]
//! records, for one build, where everything lives: global addresses, field offsets, sizes and
//! other numerics, metadata strings, and the class identity table used by the type resolver.
//!
//! Descriptors are produced by an external definition parser through [`LayoutBuilder`] and
//! are immutable afterwards, except for rebasing and the class table growing as the resolver
//! meets new dispatch pointers.
//!
//! ## Lookups
//!
//! Every lookup returns `Result<_, MissingDefinition>`. There is no zero default: a reader
//! that needs an offset this build lacks has to fail its own initialisation.
//!
//! ```rust
//! use remora_core::layout::LayoutBuilder;
//! use remora_core::types::{Address, TargetOs, WordSize};
//!
//! let layout = LayoutBuilder::new("v0.31.25", TargetOs::Linux, WordSize::Four)
//!     .with_address("tile_count", Address::new(0x1000))
//!     .build();
//!
//! assert_eq!(layout.get_address("tile_count")?, Address::new(0x1000));
//! assert!(layout.get_address("nonexistent").is_err());
//! # Ok::<(), remora_core::error::MissingDefinition>(())
//! ```

pub mod builder;
pub mod classes;
pub mod group;

use std::fmt;

use tracing::debug;

pub use builder::LayoutBuilder;
pub use classes::{ClassEntry, ClassId, ClassTable, Discriminant};
pub use group::{Definition, OffsetGroup};

use crate::error::{DefinitionKind, MissingDefinition};
use crate::types::{Address, TargetOs, WordSize};

/// String entry holding the md5 of the executable image
pub const MD5_KEY: &str = "md5";

/// Numeric entry holding the PE link timestamp of the executable image
pub const PE_TIMESTAMP_KEY: &str = "pe_timestamp";

/// Optional string entry naming the executable file, used to skip hashing unrelated images
pub const IMAGE_NAME_KEY: &str = "image_name";

/// Content fingerprint of an executable image
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint
{
    /// Lowercase hex md5 of the whole file.
    Md5(String),
    /// `TimeDateStamp` from the PE file header.
    PeTimestamp(u32),
}

impl fmt::Display for Fingerprint
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Fingerprint::Md5(hex) => write!(f, "md5:{hex}"),
            Fingerprint::PeTimestamp(stamp) => write!(f, "pe:{stamp:08x}"),
        }
    }
}

/// Layout of one build of the target
#[derive(Debug, Clone)]
pub struct LayoutDescriptor
{
    version: String,
    os: TargetOs,
    word_size: WordSize,
    base: Address,
    root: OffsetGroup,
    classes: ClassTable,
}

impl LayoutDescriptor
{
    /// Build label, e.g. `"v0.31.25 linux"`
    pub fn version(&self) -> &str
    {
        &self.version
    }

    /// OS the target image was built for
    pub fn os(&self) -> TargetOs
    {
        self.os
    }

    /// Pointer width of the target image
    pub fn word_size(&self) -> WordSize
    {
        self.word_size
    }

    /// Image base the addresses are currently expressed against
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// Top-level entry group
    pub fn root(&self) -> &OffsetGroup
    {
        &self.root
    }

    /// Nested entry group by path
    pub fn group(&self, path: &str) -> Result<&OffsetGroup, MissingDefinition>
    {
        self.root
            .group(path)
            .ok_or_else(|| MissingDefinition::absent(DefinitionKind::Group, path))
    }

    pub fn get_address(&self, name: &str) -> Result<Address, MissingDefinition>
    {
        self.root.get_address(name)
    }

    pub fn get_offset(&self, name: &str) -> Result<i64, MissingDefinition>
    {
        self.root.get_offset(name)
    }

    pub fn get_numeric(&self, name: &str) -> Result<u32, MissingDefinition>
    {
        self.root.get_numeric(name)
    }

    pub fn get_string(&self, name: &str) -> Result<String, MissingDefinition>
    {
        self.root.get_string(name)
    }

    pub fn try_get_address(&self, name: &str) -> Option<Address>
    {
        self.root.try_get_address(name)
    }

    pub fn try_get_offset(&self, name: &str) -> Option<i64>
    {
        self.root.try_get_offset(name)
    }

    pub fn try_get_numeric(&self, name: &str) -> Option<u32>
    {
        self.root.try_get_numeric(name)
    }

    pub fn try_get_string(&self, name: &str) -> Option<String>
    {
        self.root.try_get_string(name)
    }

    /// Fingerprints recorded for this build
    pub fn fingerprints(&self) -> Vec<Fingerprint>
    {
        let mut prints = Vec::new();
        if let Some(md5) = self.try_get_string(MD5_KEY) {
            prints.push(Fingerprint::Md5(md5.to_ascii_lowercase()));
        }
        if let Some(stamp) = self.try_get_numeric(PE_TIMESTAMP_KEY) {
            prints.push(Fingerprint::PeTimestamp(stamp));
        }
        prints
    }

    /// Whether `print` identifies this build
    pub fn matches(&self, print: &Fingerprint) -> bool
    {
        self.fingerprints().iter().any(|known| known == print)
    }

    pub fn classes(&self) -> &ClassTable
    {
        &self.classes
    }

    pub fn classes_mut(&mut self) -> &mut ClassTable
    {
        &mut self.classes
    }

    /// Move every address entry to a new image base
    ///
    /// Shifts each address by `new_base - base`. Dispatch pointers are untouched; see
    /// [`rebase_class_table`](Self::rebase_class_table).
    pub fn rebase(&mut self, new_base: Address)
    {
        let delta = new_base.delta_from(self.base);
        if delta == 0 {
            return;
        }
        debug!(version = %self.version, from = %self.base, to = %new_base, "rebasing addresses");
        self.root.rebase_addresses(delta);
        self.base = new_base;
    }

    /// Shift every dispatch-table pointer by `delta`
    pub fn rebase_class_table(&mut self, delta: i64)
    {
        self.classes.rebase(delta);
    }

    /// Rebase addresses and dispatch pointers by the same delta
    ///
    /// Appropriate when the whole image (code and data) moved, which is the case for a
    /// relocated PE image.
    pub fn rebase_all(&mut self, new_base: Address)
    {
        let delta = new_base.delta_from(self.base);
        self.rebase(new_base);
        self.rebase_class_table(delta);
    }
}
