//! Table identities.
//!
//! Every mapped table is assigned a [`TableId`] by the [`TableSchema`] the database handle is
//! opened with. The id is the index of the table in the schema and stays stable for the
//! lifetime of the handle, which lets the rest of the crate use plain arrays and bitsets
//! instead of maps keyed by name.
use fixedbitset::FixedBitSet;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Stable identifier of a mapped table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(u32);

impl TableId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Index of the table into per table arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).unwrap_or(u32::MAX))
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mapping between table names and their [`TableId`].
///
/// The mapping is supplied by whoever knows the mapped tables (usually generated adapter code)
/// and is immutable once built.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    /// Table names by index/id
    tables: Vec<String>,
    /// Table names to index/id
    table_ids: BTreeMap<String, TableId>,
}

impl TableSchema {
    /// Build a schema where each table receives the id of its position in `tables`.
    ///
    /// Duplicate names keep the id of their first occurrence.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut schema = Self::default();
        for table in tables {
            schema.push(table.into());
        }
        schema
    }

    fn push(&mut self, table: String) {
        if self.table_ids.contains_key(&table) {
            return;
        }
        let id = TableId::from_index(self.tables.len());
        self.table_ids.insert(table.clone(), id);
        self.tables.push(table);
    }

    /// Number of mapped tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    #[must_use]
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.table_ids.get(name).copied()
    }

    #[must_use]
    pub fn table_name(&self, id: TableId) -> Option<&str> {
        self.tables.get(id.index()).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, id: TableId) -> bool {
        id.index() < self.tables.len()
    }

    /// Iterate over all mapped tables.
    pub fn tables(&self) -> impl Iterator<Item = (TableId, &str)> {
        self.tables
            .iter()
            .enumerate()
            .map(|(idx, name)| (TableId::from_index(idx), name.as_str()))
    }

    /// Build a [`TableSet`] sized for this schema from table names.
    ///
    /// # Errors
    ///
    /// Returns the first name that is not part of the schema.
    pub fn table_set<'n>(
        &self,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<TableSet, &'n str> {
        let mut set = TableSet::with_capacity(self.len());
        for name in names {
            let id = self.table_id(name).ok_or(name)?;
            set.insert(id);
        }
        Ok(set)
    }
}

/// Compact set of table ids.
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    bits: FixedBitSet,
}

// Equality ignores the capacity of the underlying bitset.
impl PartialEq for TableSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for TableSet {}

impl TableSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bits: FixedBitSet::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, id: TableId) {
        self.bits.grow(id.index() + 1);
        self.bits.insert(id.index());
    }

    pub fn remove(&mut self, id: TableId) {
        if id.index() < self.bits.len() {
            self.bits.set(id.index(), false);
        }
    }

    #[must_use]
    pub fn contains(&self, id: TableId) -> bool {
        self.bits.contains(id.index())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_clear()
    }

    /// Number of tables in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.count_ones(..)
    }

    /// Tables present in both sets.
    #[must_use]
    pub fn intersection(&self, other: &TableSet) -> TableSet {
        let mut bits = self.bits.clone();
        bits.intersect_with(&other.bits);
        Self { bits }
    }

    #[must_use]
    pub fn intersects(&self, other: &TableSet) -> bool {
        !self.bits.is_disjoint(&other.bits)
    }

    pub fn union_with(&mut self, other: &TableSet) {
        self.bits.union_with(&other.bits);
    }

    pub fn iter(&self) -> impl Iterator<Item = TableId> + '_ {
        self.into_iter()
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }
}

impl FromIterator<TableId> for TableSet {
    fn from_iter<T: IntoIterator<Item = TableId>>(iter: T) -> Self {
        let mut set = TableSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl<'a> IntoIterator for &'a TableSet {
    type Item = TableId;
    type IntoIter = std::iter::Map<fixedbitset::Ones<'a>, fn(usize) -> TableId>;

    fn into_iter(self) -> Self::IntoIter {
        self.bits.ones().map(TableId::from_index as fn(usize) -> TableId)
    }
}

impl Extend<TableId> for TableSet {
    fn extend<T: IntoIterator<Item = TableId>>(&mut self, iter: T) {
        for id in iter {
            self.insert(id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schema_assigns_ids_by_position() {
        let schema = TableSchema::new(["users", "orders", "users", "items"]);
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.table_id("users"), Some(TableId::new(0)));
        assert_eq!(schema.table_id("orders"), Some(TableId::new(1)));
        assert_eq!(schema.table_id("items"), Some(TableId::new(2)));
        assert_eq!(schema.table_name(TableId::new(1)), Some("orders"));
        assert!(schema.table_name(TableId::new(3)).is_none());
        assert!(!schema.contains(TableId::new(3)));
        assert_eq!(schema.table_set(["orders", "nope"]), Err("nope"));
    }

    #[test]
    fn table_set_operations() {
        let a: TableSet = [TableId::new(0), TableId::new(4)].into_iter().collect();
        let b: TableSet = [TableId::new(4), TableId::new(9)].into_iter().collect();

        assert!(a.intersects(&b));
        let both = a.intersection(&b);
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![TableId::new(4)]);
        assert_eq!(both.len(), 1);

        let c: TableSet = [TableId::new(1)].into_iter().collect();
        assert!(!a.intersects(&c));
        assert!(a.intersection(&c).is_empty());

        let mut d = a.clone();
        d.remove(TableId::new(0));
        d.remove(TableId::new(100));
        assert!(!d.contains(TableId::new(0)));
        assert!(d.contains(TableId::new(4)));
    }
}
