//! Relation store seam and the in-memory reference store
//!
//! The persistence engine proper is an external collaborator; the core only
//! assumes indexed lookups on the four key columns. `RelationStore` is that
//! seam, and `MemoryStore` is the in-tree implementation used by tests and
//! embedders that do not bring their own backend.

use crate::error::{CoreError, Result};
use crate::types::{BaseType, Row, RowId, DEFAULT_ORDER, FIRST_USER_ID, ROOT};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Storage seam for the flat self-referential relation
///
/// All methods are fallible so that backends can surface real I/O errors;
/// callers map those into the crate taxonomy with operation context.
pub trait RelationStore: Send + Sync {
    /// Point lookup by id.
    fn get(&self, id: RowId) -> Result<Option<Row>>;

    /// All children of a parent, ordered by (order, id).
    fn children(&self, parent: RowId) -> Result<Vec<Row>>;

    /// Children of a parent restricted to one type pointer, in id
    /// (creation) order.
    fn children_of_type(&self, parent: RowId, type_pointer: RowId) -> Result<Vec<Row>>;

    /// Every row carrying the given type pointer, in ascending id order.
    fn rows_of_type(&self, type_pointer: RowId) -> Result<Vec<Row>>;

    /// Up to `limit` rows with id greater than `after`, ascending.
    /// `None` starts from the beginning. Dump streaming builds on this.
    fn scan_from(&self, after: Option<RowId>, limit: usize) -> Result<Vec<Row>>;

    /// Rows whose value payload is the decimal form of `id` (inbound value
    /// references).
    fn rows_referencing(&self, id: RowId) -> Result<Vec<Row>>;

    /// Insert a new row, allocating its id.
    fn insert(&self, parent: RowId, order: i64, type_pointer: RowId, value: &str) -> Result<RowId>;

    /// Upsert a row under an explicit id. Restore path: bypasses id
    /// allocation and keeps the allocator ahead of the highest id seen.
    fn put(&self, row: Row) -> Result<()>;

    /// Replace a row's value payload.
    fn update_value(&self, id: RowId, value: &str) -> Result<()>;

    /// Move a row to a new parent and/or order slot.
    fn update_placement(&self, id: RowId, parent: RowId, order: i64) -> Result<()>;

    /// Non-recursive delete of one row.
    fn delete(&self, id: RowId) -> Result<()>;

    /// Non-recursive delete of every direct child of `parent`.
    fn delete_children(&self, parent: RowId) -> Result<()>;

    fn contains(&self, id: RowId) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// Number of stored rows.
    fn row_count(&self) -> Result<usize>;
}

#[derive(Default)]
struct Tables {
    rows: BTreeMap<RowId, Row>,
    // (order, id) keeps sibling scans in display order without re-sorting
    by_parent: HashMap<RowId, BTreeSet<(i64, RowId)>>,
    // (parent, type_pointer) is the hot path for attribute and report scans
    by_parent_type: HashMap<(RowId, RowId), BTreeSet<RowId>>,
    by_type: HashMap<RowId, BTreeSet<RowId>>,
    next_id: u64,
}

impl Tables {
    fn index(&mut self, row: &Row) {
        self.by_parent
            .entry(row.parent)
            .or_default()
            .insert((row.order, row.id));
        self.by_parent_type
            .entry((row.parent, row.type_pointer))
            .or_default()
            .insert(row.id);
        self.by_type.entry(row.type_pointer).or_default().insert(row.id);
    }

    fn unindex(&mut self, row: &Row) {
        if let Some(set) = self.by_parent.get_mut(&row.parent) {
            set.remove(&(row.order, row.id));
            if set.is_empty() {
                self.by_parent.remove(&row.parent);
            }
        }
        if let Some(set) = self.by_parent_type.get_mut(&(row.parent, row.type_pointer)) {
            set.remove(&row.id);
            if set.is_empty() {
                self.by_parent_type.remove(&(row.parent, row.type_pointer));
            }
        }
        if let Some(set) = self.by_type.get_mut(&row.type_pointer) {
            set.remove(&row.id);
            if set.is_empty() {
                self.by_type.remove(&row.type_pointer);
            }
        }
    }
}

/// In-memory relation store
///
/// A `BTreeMap` main relation (ascending id iteration falls out for free)
/// plus secondary indexes on parent and type pointer.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// An empty store with nothing seeded. Only the dump decoder and tests
    /// start from here.
    pub fn empty() -> Self {
        MemoryStore {
            tables: RwLock::new(Tables {
                next_id: 1,
                ..Tables::default()
            }),
        }
    }

    /// A store with the base-type rows seeded, ready for schema and data.
    pub fn with_base_types() -> Self {
        let store = MemoryStore::empty();
        {
            let mut tables = store.tables.write();
            for base in BaseType::ALL {
                let row = Row::new(
                    base.id(),
                    ROOT,
                    base.id(),
                    DEFAULT_ORDER,
                    base.name().to_string(),
                );
                tables.index(&row);
                tables.rows.insert(row.id, row);
            }
            tables.next_id = FIRST_USER_ID;
        }
        store
    }
}

impl RelationStore for MemoryStore {
    fn get(&self, id: RowId) -> Result<Option<Row>> {
        Ok(self.tables.read().rows.get(&id).cloned())
    }

    fn children(&self, parent: RowId) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let Some(ids) = tables.by_parent.get(&parent) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|(_, id)| tables.rows.get(id).cloned())
            .collect())
    }

    fn children_of_type(&self, parent: RowId, type_pointer: RowId) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let Some(ids) = tables.by_parent_type.get(&(parent, type_pointer)) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| tables.rows.get(id).cloned())
            .collect())
    }

    fn rows_of_type(&self, type_pointer: RowId) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let Some(ids) = tables.by_type.get(&type_pointer) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| tables.rows.get(id).cloned())
            .collect())
    }

    fn scan_from(&self, after: Option<RowId>, limit: usize) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        let range = match after {
            Some(id) => tables.rows.range(RowId(id.as_u64() + 1)..),
            None => tables.rows.range(..),
        };
        Ok(range.take(limit).map(|(_, row)| row.clone()).collect())
    }

    fn rows_referencing(&self, id: RowId) -> Result<Vec<Row>> {
        let needle = id.as_u64().to_string();
        let tables = self.tables.read();
        Ok(tables
            .rows
            .values()
            .filter(|row| row.value == needle)
            .cloned()
            .collect())
    }

    fn insert(&self, parent: RowId, order: i64, type_pointer: RowId, value: &str) -> Result<RowId> {
        let mut tables = self.tables.write();
        let id = RowId(tables.next_id);
        tables.next_id += 1;

        let row = Row::new(id, parent, type_pointer, order, value.to_string());
        tables.index(&row);
        tables.rows.insert(id, row);
        Ok(id)
    }

    fn put(&self, row: Row) -> Result<()> {
        if row.id == ROOT {
            return Err(CoreError::invalid("row id 0 is reserved for the root"));
        }
        let mut tables = self.tables.write();
        if let Some(existing) = tables.rows.remove(&row.id) {
            tables.unindex(&existing);
        }
        if row.id.as_u64() >= tables.next_id {
            tables.next_id = row.id.as_u64() + 1;
        }
        tables.index(&row);
        tables.rows.insert(row.id, row);
        Ok(())
    }

    fn update_value(&self, id: RowId, value: &str) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.rows.get_mut(&id) {
            Some(row) => {
                row.value = value.to_string();
                Ok(())
            }
            None => Err(CoreError::not_found(id)),
        }
    }

    fn update_placement(&self, id: RowId, parent: RowId, order: i64) -> Result<()> {
        let mut tables = self.tables.write();
        let Some(mut row) = tables.rows.remove(&id) else {
            return Err(CoreError::not_found(id));
        };
        tables.unindex(&row);
        row.parent = parent;
        row.order = order;
        tables.index(&row);
        tables.rows.insert(id, row);
        Ok(())
    }

    fn delete(&self, id: RowId) -> Result<()> {
        let mut tables = self.tables.write();
        match tables.rows.remove(&id) {
            Some(row) => {
                tables.unindex(&row);
                Ok(())
            }
            None => Err(CoreError::not_found(id)),
        }
    }

    fn delete_children(&self, parent: RowId) -> Result<()> {
        let mut tables = self.tables.write();
        let ids: Vec<RowId> = tables
            .by_parent
            .get(&parent)
            .map(|set| set.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(row) = tables.rows.remove(&id) {
                tables.unindex(&row);
            }
        }
        Ok(())
    }

    fn row_count(&self) -> Result<usize> {
        Ok(self.tables.read().rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_seeds_base_types() {
        let store = MemoryStore::with_base_types();
        assert_eq!(store.row_count().unwrap(), BaseType::ALL.len());

        let number = store.get(BaseType::Number.id()).unwrap().unwrap();
        assert!(number.is_terminal());
        assert_eq!(number.value, "Number");
        assert_eq!(number.parent, ROOT);
    }

    #[test]
    fn test_insert_allocates_above_reserved_range() {
        let store = MemoryStore::with_base_types();
        let id = store
            .insert(ROOT, DEFAULT_ORDER, ROOT, "Invoice")
            .unwrap();
        assert_eq!(id.as_u64(), FIRST_USER_ID);
    }

    #[test]
    fn test_children_ordered_by_order_then_id() {
        let store = MemoryStore::with_base_types();
        let parent = store.insert(ROOT, 1, ROOT, "Type").unwrap();
        let b = store.insert(parent, 2, BaseType::Number.id(), "B").unwrap();
        let a = store.insert(parent, 1, BaseType::Number.id(), "A").unwrap();

        let children = store.children(parent).unwrap();
        assert_eq!(children.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_children_of_type_in_creation_order() {
        let store = MemoryStore::with_base_types();
        let parent = store.insert(ROOT, 1, ROOT, "Type").unwrap();
        let field = store.insert(parent, 1, BaseType::ShortText.id(), "Tag").unwrap();
        let obj = store.insert(parent, 1, parent, "x").unwrap();
        let first = store.insert(obj, 1, field, "one").unwrap();
        let second = store.insert(obj, 2, field, "two").unwrap();

        let values = store.children_of_type(obj, field).unwrap();
        assert_eq!(values.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first, second]);
    }

    #[test]
    fn test_update_placement_reindexes() {
        let store = MemoryStore::with_base_types();
        let a = store.insert(ROOT, 1, ROOT, "A").unwrap();
        let b = store.insert(ROOT, 1, ROOT, "B").unwrap();
        let child = store.insert(a, 1, BaseType::Number.id(), "n").unwrap();

        store.update_placement(child, b, 3).unwrap();

        assert!(store.children(a).unwrap().is_empty());
        let moved = store.children(b).unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].order, 3);
    }

    #[test]
    fn test_put_keeps_allocator_ahead() {
        let store = MemoryStore::empty();
        store
            .put(Row::new(RowId(40), ROOT, ROOT, 1, "x".to_string()))
            .unwrap();
        let next = store.insert(ROOT, 1, ROOT, "y").unwrap();
        assert_eq!(next, RowId(41));
    }

    #[test]
    fn test_scan_from_pages_in_id_order() {
        let store = MemoryStore::empty();
        for i in 1..=5u64 {
            store
                .put(Row::new(RowId(i * 10), ROOT, ROOT, 1, String::new()))
                .unwrap();
        }

        let first = store.scan_from(None, 2).unwrap();
        assert_eq!(first.iter().map(|r| r.id.as_u64()).collect::<Vec<_>>(), vec![10, 20]);

        let rest = store.scan_from(Some(RowId(20)), 10).unwrap();
        assert_eq!(rest.iter().map(|r| r.id.as_u64()).collect::<Vec<_>>(), vec![30, 40, 50]);
    }

    #[test]
    fn test_rows_referencing_matches_decimal_values() {
        let store = MemoryStore::with_base_types();
        let target = store.insert(ROOT, 1, ROOT, "Target").unwrap();
        let holder = store.insert(ROOT, 1, ROOT, "Holder").unwrap();
        store
            .insert(holder, 1, BaseType::Number.id(), &target.as_u64().to_string())
            .unwrap();
        store.insert(holder, 2, BaseType::Number.id(), "999").unwrap();

        let referencing = store.rows_referencing(target).unwrap();
        assert_eq!(referencing.len(), 1);
    }

    #[test]
    fn test_delete_missing_row_is_not_found() {
        let store = MemoryStore::empty();
        assert!(matches!(
            store.delete(RowId(77)),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_children_is_non_recursive() {
        let store = MemoryStore::with_base_types();
        let top = store.insert(ROOT, 1, ROOT, "Top").unwrap();
        let mid = store.insert(top, 1, BaseType::ShortText.id(), "mid").unwrap();
        let leaf = store.insert(mid, 1, BaseType::ShortText.id(), "leaf").unwrap();

        store.delete_children(top).unwrap();

        assert!(store.get(mid).unwrap().is_none());
        // Grandchildren survive; recursive delete is composed by the caller.
        assert!(store.get(leaf).unwrap().is_some());
    }
}
