//! Named groups of layout entries.

use std::collections::BTreeMap;

use crate::error::{DefinitionKind, MissingDefinition, MissingReason};
use crate::types::Address;

/// State of a single layout entry
///
/// Layout sources declare keys for every build they know about. A key may have a value for
/// this build, be declared without one yet, or be known to not exist in this build at all.
/// Only `Valid` produces a value; the other two report *why* nothing was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definition<T>
{
    Valid(T),
    Unset,
    Invalid,
}

impl<T: Clone> Definition<T>
{
    fn resolve(&self, kind: DefinitionKind, key: String) -> Result<T, MissingDefinition>
    {
        match self {
            Definition::Valid(value) => Ok(value.clone()),
            Definition::Unset => Err(MissingDefinition {
                kind,
                key,
                reason: MissingReason::Unset,
            }),
            Definition::Invalid => Err(MissingDefinition {
                kind,
                key,
                reason: MissingReason::Invalid,
            }),
        }
    }
}

type Entries<T> = BTreeMap<String, Definition<T>>;

/// A named set of addresses, offsets, numerics and strings, plus nested groups
///
/// Keys may be given as slash-separated paths (`"string/MSVC/buffer"`): every component but
/// the last names a nested group. Group names are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetGroup
{
    name: String,
    full_name: String,
    addresses: Entries<Address>,
    offsets: Entries<i64>,
    numerics: Entries<u32>,
    strings: Entries<String>,
    groups: BTreeMap<String, OffsetGroup>,
}

impl OffsetGroup
{
    /// Create the unnamed root group
    pub fn root() -> Self
    {
        Self::default()
    }

    fn child(name: &str, parent_full: &str) -> Self
    {
        Self {
            name: name.to_string(),
            full_name: format!("{parent_full}{name}/"),
            ..Self::default()
        }
    }

    /// Short name of this group (empty for the root)
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Path of this group including a trailing slash, e.g. `"string/MSVC/"`
    pub fn full_name(&self) -> &str
    {
        &self.full_name
    }

    /// Nested group by path
    pub fn group(&self, path: &str) -> Option<&OffsetGroup>
    {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self, |group, part| group.groups.get(part))
    }

    /// Nested group by path, creating missing groups along the way
    pub fn group_mut(&mut self, path: &str) -> &mut OffsetGroup
    {
        let mut group = self;
        for part in path.split('/').filter(|part| !part.is_empty()) {
            let parent_full = group.full_name.clone();
            group = group
                .groups
                .entry(part.to_string())
                .or_insert_with(|| OffsetGroup::child(part, &parent_full));
        }
        group
    }

    /// Direct child groups
    pub fn groups(&self) -> impl Iterator<Item = &OffsetGroup>
    {
        self.groups.values()
    }

    pub fn get_address(&self, key: &str) -> Result<Address, MissingDefinition>
    {
        self.lookup(key, DefinitionKind::Address, |g| &g.addresses)
    }

    pub fn get_offset(&self, key: &str) -> Result<i64, MissingDefinition>
    {
        self.lookup(key, DefinitionKind::Offset, |g| &g.offsets)
    }

    pub fn get_numeric(&self, key: &str) -> Result<u32, MissingDefinition>
    {
        self.lookup(key, DefinitionKind::Numeric, |g| &g.numerics)
    }

    pub fn get_string(&self, key: &str) -> Result<String, MissingDefinition>
    {
        self.lookup(key, DefinitionKind::String, |g| &g.strings)
    }

    pub fn try_get_address(&self, key: &str) -> Option<Address>
    {
        self.get_address(key).ok()
    }

    pub fn try_get_offset(&self, key: &str) -> Option<i64>
    {
        self.get_offset(key).ok()
    }

    pub fn try_get_numeric(&self, key: &str) -> Option<u32>
    {
        self.get_numeric(key).ok()
    }

    pub fn try_get_string(&self, key: &str) -> Option<String>
    {
        self.get_string(key).ok()
    }

    pub fn set_address(&mut self, key: &str, value: Address)
    {
        let (group, leaf) = self.split_mut(key);
        group.addresses.insert(leaf, Definition::Valid(value));
    }

    pub fn set_offset(&mut self, key: &str, value: i64)
    {
        let (group, leaf) = self.split_mut(key);
        group.offsets.insert(leaf, Definition::Valid(value));
    }

    pub fn set_numeric(&mut self, key: &str, value: u32)
    {
        let (group, leaf) = self.split_mut(key);
        group.numerics.insert(leaf, Definition::Valid(value));
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>)
    {
        let (group, leaf) = self.split_mut(key);
        group.strings.insert(leaf, Definition::Valid(value.into()));
    }

    /// Record a non-`Valid` state for a key
    ///
    /// `DefinitionKind::Group` has no entries and is ignored.
    pub fn mark(&mut self, kind: DefinitionKind, key: &str, reason: MissingReason)
    {
        let (group, leaf) = self.split_mut(key);
        match kind {
            DefinitionKind::Address => mark_entry(&mut group.addresses, leaf, reason),
            DefinitionKind::Offset => mark_entry(&mut group.offsets, leaf, reason),
            DefinitionKind::Numeric => mark_entry(&mut group.numerics, leaf, reason),
            DefinitionKind::String => mark_entry(&mut group.strings, leaf, reason),
            DefinitionKind::Group => {}
        }
    }

    /// Names of the address entries in this group (not recursive)
    pub fn address_keys(&self) -> impl Iterator<Item = &str>
    {
        self.addresses.keys().map(String::as_str)
    }

    /// Shift every valid address in this group and its children by `delta`
    pub(crate) fn rebase_addresses(&mut self, delta: i64)
    {
        for entry in self.addresses.values_mut() {
            if let Definition::Valid(addr) = entry {
                *addr = addr.offset(delta);
            }
        }
        for group in self.groups.values_mut() {
            group.rebase_addresses(delta);
        }
    }

    fn lookup<T: Clone>(
        &self,
        key: &str,
        kind: DefinitionKind,
        entries: impl Fn(&OffsetGroup) -> &Entries<T>,
    ) -> Result<T, MissingDefinition>
    {
        let (path, leaf) = split_key(key);
        let full_key = format!("{}{}", self.full_name, key);
        let group = self
            .group(path)
            .ok_or_else(|| MissingDefinition::absent(kind, full_key.clone()))?;
        match entries(group).get(leaf) {
            Some(definition) => definition.resolve(kind, full_key),
            None => Err(MissingDefinition::absent(kind, full_key)),
        }
    }

    fn split_mut(&mut self, key: &str) -> (&mut OffsetGroup, String)
    {
        let (path, leaf) = split_key(key);
        (self.group_mut(path), leaf.to_string())
    }
}

fn split_key(key: &str) -> (&str, &str)
{
    key.rsplit_once('/').unwrap_or(("", key))
}

fn mark_entry<T>(entries: &mut Entries<T>, leaf: String, reason: MissingReason)
{
    let definition = match reason {
        MissingReason::Invalid => Definition::Invalid,
        MissingReason::Unset | MissingReason::Absent => Definition::Unset,
    };
    entries.insert(leaf, definition);
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_nested_paths()
    {
        let mut root = OffsetGroup::root();
        root.set_offset("string/MSVC/buffer", 4);
        root.set_offset("string/MSVC/capacity", 0x18);

        let msvc = root.group("string/MSVC").unwrap();
        assert_eq!(msvc.full_name(), "string/MSVC/");
        assert_eq!(msvc.get_offset("buffer"), Ok(4));
        assert_eq!(root.get_offset("string/MSVC/capacity"), Ok(0x18));
        assert_eq!(root.group("string").unwrap().groups().count(), 1);
    }

    #[test]
    fn test_missing_keys_report_full_path_and_reason()
    {
        let mut root = OffsetGroup::root();
        root.mark(DefinitionKind::Offset, "creature/flags", MissingReason::Invalid);
        root.mark(DefinitionKind::Numeric, "creature/count", MissingReason::Unset);

        let invalid = root.get_offset("creature/flags").unwrap_err();
        assert_eq!(invalid.reason, MissingReason::Invalid);
        assert_eq!(invalid.key, "creature/flags");

        let unset = root.group("creature").unwrap().get_numeric("count").unwrap_err();
        assert_eq!(unset.reason, MissingReason::Unset);
        assert_eq!(unset.key, "creature/count");

        let absent = root.get_address("nowhere/at_all").unwrap_err();
        assert_eq!(absent.reason, MissingReason::Absent);
        assert_eq!(absent.kind, DefinitionKind::Address);
    }

    #[test]
    fn test_kinds_are_separate_namespaces()
    {
        let mut root = OffsetGroup::root();
        root.set_numeric("size", 12);
        assert!(root.get_offset("size").is_err());
        assert_eq!(root.try_get_numeric("size"), Some(12));
    }
}
