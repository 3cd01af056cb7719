//! Class identity table.
//!
//! Maps class names (and multi-variant sub-kinds) to dense [`ClassId`]s and remembers which
//! dispatch-table pointer belongs to which class. Ids are handed out in first-seen order and
//! never change for the lifetime of the table; downstream readers cache them freely.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::debug;

use crate::types::Address;

/// Dense class handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassId(pub u32);

impl ClassId
{
    pub fn index(self) -> usize
    {
        self.0 as usize
    }
}

impl fmt::Display for ClassId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

/// Location and width of the sub-kind field of a multi-variant family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discriminant
{
    /// Offset from the object base.
    pub offset: i64,
    /// Field width in bytes: 1, 2 or 4.
    pub width: u8,
}

impl Discriminant
{
    /// A 16-bit discriminant at `offset`, the common case
    pub fn new(offset: i64) -> Self
    {
        Self { offset, width: 2 }
    }

    pub fn with_width(mut self, width: u8) -> Self
    {
        self.width = width;
        self
    }
}

/// One class family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEntry
{
    id: ClassId,
    name: String,
    dispatch_ptr: Option<Address>,
    discriminant: Option<Discriminant>,
    variants: BTreeMap<u32, ClassId>,
}

impl ClassEntry
{
    pub fn id(&self) -> ClassId
    {
        self.id
    }

    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Dispatch-table pointer, once known
    pub fn dispatch_ptr(&self) -> Option<Address>
    {
        self.dispatch_ptr
    }

    pub fn discriminant(&self) -> Option<Discriminant>
    {
        self.discriminant
    }

    /// Id of the sub-kind with discriminant `value`
    pub fn variant(&self, value: u32) -> Option<ClassId>
    {
        self.variants.get(&value).copied()
    }

    /// `(discriminant value, id)` pairs in value order
    pub fn variants(&self) -> impl Iterator<Item = (u32, ClassId)> + '_
    {
        self.variants.iter().map(|(value, id)| (*value, *id))
    }
}

/// Ordered class families plus the `ClassId → name` mapping
#[derive(Debug, Clone, Default)]
pub struct ClassTable
{
    entries: Vec<ClassEntry>,
    names: Vec<String>,
    by_name: HashMap<String, ClassId>,
    family_index: HashMap<ClassId, usize>,
    dispatch_cache: HashMap<Address, usize>,
}

impl ClassTable
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register a class family, or update the existing family with this name
    ///
    /// A known name keeps its id; a `Some` dispatch pointer or discriminant replaces the
    /// recorded one. Unknown names get the next free id.
    pub fn register_class(
        &mut self,
        name: &str,
        dispatch_ptr: Option<Address>,
        discriminant: Option<Discriminant>,
    ) -> ClassId
    {
        if let Some(&index) = self.by_name.get(name).and_then(|id| self.family_index.get(id)) {
            let entry = &mut self.entries[index];
            if let Some(ptr) = dispatch_ptr {
                entry.dispatch_ptr = Some(ptr);
                self.dispatch_cache.insert(ptr, index);
            }
            if discriminant.is_some() {
                entry.discriminant = discriminant;
            }
            return entry.id;
        }

        let id = self.allocate(name);
        let index = self.entries.len();
        self.entries.push(ClassEntry {
            id,
            name: name.to_string(),
            dispatch_ptr,
            discriminant,
            variants: BTreeMap::new(),
        });
        self.family_index.insert(id, index);
        if let Some(ptr) = dispatch_ptr {
            self.dispatch_cache.insert(ptr, index);
        }
        debug!(class = name, id = id.0, ?dispatch_ptr, "registered class");
        id
    }

    /// Register a named sub-kind of `family` selected by discriminant `value`
    ///
    /// Re-registering a variant name of the same family keeps its id and moves it to the new
    /// value. Returns `None` when `family` is not a family id.
    pub fn register_variant(&mut self, family: ClassId, name: &str, value: u32) -> Option<ClassId>
    {
        let index = *self.family_index.get(&family)?;
        let existing = self.entries[index]
            .variants
            .iter()
            .find(|(_, id)| self.names[id.index()] == name)
            .map(|(value, id)| (*value, *id));

        let id = match existing {
            Some((old_value, id)) => {
                self.entries[index].variants.remove(&old_value);
                id
            }
            None => self.allocate(name),
        };
        self.entries[index].variants.insert(value, id);
        Some(id)
    }

    /// Family entry for `id` (`None` for variant ids)
    pub fn entry(&self, id: ClassId) -> Option<&ClassEntry>
    {
        self.family_index.get(&id).map(|&index| &self.entries[index])
    }

    /// Family whose dispatch pointer is `ptr`, caching the answer
    pub fn entry_for_dispatch_ptr(&mut self, ptr: Address) -> Option<&ClassEntry>
    {
        if let Some(&index) = self.dispatch_cache.get(&ptr) {
            return Some(&self.entries[index]);
        }
        let index = self.entries.iter().position(|e| e.dispatch_ptr == Some(ptr))?;
        self.dispatch_cache.insert(ptr, index);
        Some(&self.entries[index])
    }

    /// Id of the class (family or variant) first registered under `name`
    pub fn class_id(&self, name: &str) -> Option<ClassId>
    {
        self.by_name.get(name).copied()
    }

    pub fn class_name(&self, id: ClassId) -> Option<&str>
    {
        self.names.get(id.index()).map(String::as_str)
    }

    /// Recorded dispatch pointer of the family named `name`
    ///
    /// Variant names have no pointer of their own and return `None`.
    pub fn dispatch_ptr(&self, name: &str) -> Option<Address>
    {
        self.entry(self.class_id(name)?)?.dispatch_ptr
    }

    /// `ClassId → name` mapping, indexed by `ClassId::index()`
    pub fn names(&self) -> &[String]
    {
        &self.names
    }

    /// Class families in registration order
    pub fn families(&self) -> impl Iterator<Item = &ClassEntry>
    {
        self.entries.iter()
    }

    /// Number of ids handed out (families and variants)
    pub fn len(&self) -> usize
    {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.names.is_empty()
    }

    /// Shift every dispatch pointer by `delta`
    pub fn rebase(&mut self, delta: i64)
    {
        for entry in &mut self.entries {
            entry.dispatch_ptr = entry.dispatch_ptr.map(|ptr| ptr.offset(delta));
        }
        self.dispatch_cache = self
            .dispatch_cache
            .drain()
            .map(|(ptr, index)| (ptr.offset(delta), index))
            .collect();
    }

    /// Forget pointers learned at run time, keeping registered entries and ids
    pub fn clear_dispatch_cache(&mut self)
    {
        self.dispatch_cache.clear();
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(ptr) = entry.dispatch_ptr {
                self.dispatch_cache.insert(ptr, index);
            }
        }
    }

    fn allocate(&mut self, name: &str) -> ClassId
    {
        let id = ClassId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.by_name.entry(name.to_string()).or_insert(id);
        id
    }
}
