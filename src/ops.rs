//! Structural and instance operations over the relation
//!
//! Schema rows and data rows share these primitives: create, attribute
//! writes with base-type validation, sibling reorder, id renumbering,
//! and delete with inbound-reference protection. Multi-step rewrites stop
//! at the first failed step; nothing continues past a violated invariant.

use crate::error::{CoreError, Result};
use crate::schema::{FieldDef, FieldTarget, SchemaResolver, TypeKind};
use crate::store::RelationStore;
use crate::types::{
    parse_reference, BaseType, FieldModifiers, Row, RowId, DEFAULT_ORDER, ROOT, UNIQUE_ORDER_FLAG,
};
use sha2::{Digest, Sha256};

/// Mutating operations over a relation store
pub struct Ops<'a, S: RelationStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RelationStore + ?Sized> Ops<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Ops { store }
    }

    fn resolver(&self) -> SchemaResolver<'a, S> {
        SchemaResolver::new(self.store)
    }

    fn next_child_order(&self, parent: RowId) -> Result<i64> {
        Ok(self
            .store
            .children(parent)?
            .last()
            .map(|row| row.order + 1)
            .unwrap_or(DEFAULT_ORDER))
    }

    /// Create a composite type at root level.
    pub fn create_type(&self, name: &str, unique_values: bool) -> Result<RowId> {
        let order = if unique_values {
            UNIQUE_ORDER_FLAG
        } else {
            DEFAULT_ORDER
        };
        self.store.insert(ROOT, order, ROOT, name)
    }

    /// Create a restriction (subset) of an existing root-level type.
    pub fn create_restriction(&self, name: &str, base: RowId) -> Result<RowId> {
        let definition = self.resolver().type_definition(base)?;
        if matches!(definition.kind, TypeKind::Terminal(_)) {
            return Err(CoreError::invalid("cannot restrict a terminal type"));
        }
        self.store.insert(ROOT, DEFAULT_ORDER, base, name)
    }

    /// Append a field definition to a composite type.
    pub fn add_field(
        &self,
        type_id: RowId,
        target: RowId,
        name: &str,
        modifiers: FieldModifiers,
    ) -> Result<RowId> {
        let definition = self.resolver().type_definition(type_id)?;
        if !matches!(definition.kind, TypeKind::Composite) {
            return Err(CoreError::invalid(format!(
                "type {} cannot carry field definitions",
                type_id
            )));
        }
        if target == type_id {
            // A self-targeting field row would be indistinguishable from an
            // instance stored under the type row.
            return Err(CoreError::invalid(
                "field target must differ from the owning type",
            ));
        }
        // The target must itself be a type definition.
        self.resolver().type_definition(target)?;
        if let Some(base) = BaseType::from_id(target) {
            if base.is_marker() {
                return Err(CoreError::invalid(format!(
                    "{} is an internal marker, not a field type",
                    base.name()
                )));
            }
        }

        let order = self.next_child_order(type_id)?;
        let payload = FieldModifiers::encode(name, &modifiers);
        self.store.insert(type_id, order, target, &payload)
    }

    /// Rewrite a field definition's display name and modifiers.
    pub fn set_field_modifiers(
        &self,
        field_id: RowId,
        name: &str,
        modifiers: FieldModifiers,
    ) -> Result<()> {
        let row = self
            .store
            .get(field_id)?
            .ok_or_else(|| CoreError::not_found(field_id))?;
        if !self.resolver().is_field_definition(&row)? {
            return Err(CoreError::invalid(format!(
                "row {} is not a field definition",
                field_id
            )));
        }
        let payload = FieldModifiers::encode(name, &modifiers);
        self.store.update_value(field_id, &payload)
    }

    fn assert_unique_value(&self, type_id: RowId, value: &str, skip: Option<RowId>) -> Result<()> {
        let resolver = self.resolver();
        for row in self.store.rows_of_type(type_id)? {
            if Some(row.id) == skip || row.parent == ROOT {
                continue;
            }
            if resolver.is_field_definition(&row)? {
                continue;
            }
            if row.value == value {
                return Err(CoreError::invalid(format!(
                    "type {} requires unique values, \"{}\" already exists",
                    type_id, value
                )));
            }
        }
        Ok(())
    }

    /// Create an instance of a composite or restriction type.
    ///
    /// With no parent given the instance is stored under its type row.
    pub fn create_instance(
        &self,
        type_id: RowId,
        parent: Option<RowId>,
        value: &str,
    ) -> Result<RowId> {
        let definition = self.resolver().type_definition(type_id)?;
        if matches!(definition.kind, TypeKind::Terminal(_)) {
            return Err(CoreError::invalid("terminal types have no instances"));
        }
        if definition.unique_values {
            self.assert_unique_value(type_id, value, None)?;
        }

        let parent = parent.unwrap_or(type_id);
        if parent != type_id && self.store.get(parent)?.is_none() {
            return Err(CoreError::not_found(parent));
        }

        let order = self.next_child_order(parent)?;
        self.store.insert(parent, order, type_id, value)
    }

    /// Replace an instance's own display value.
    pub fn update_instance_value(&self, object_id: RowId, value: &str) -> Result<()> {
        let object = self
            .store
            .get(object_id)?
            .ok_or_else(|| CoreError::not_found(object_id))?;
        let definition = self.resolver().type_definition(object.type_pointer)?;
        if definition.unique_values {
            self.assert_unique_value(object.type_pointer, value, Some(object_id))?;
        }
        self.store.update_value(object_id, value)
    }

    fn find_field(&self, object: &Row, field_id: RowId) -> Result<FieldDef> {
        self.resolver()
            .resolve_fields(object.type_pointer)?
            .into_iter()
            .find(|f| f.id == field_id)
            .ok_or_else(|| {
                CoreError::invalid(format!(
                    "row {} has no field {} on type {}",
                    object.id, field_id, object.type_pointer
                ))
            })
    }

    fn prepare_value(&self, field: &FieldDef, value: &str) -> Result<String> {
        match &field.target {
            FieldTarget::Primitive(base) => normalize_value(*base, value),
            FieldTarget::Reference { type_id, restriction } => {
                let reference = parse_reference(value).ok_or_else(|| {
                    CoreError::invalid(format!("\"{}\" is not a row reference", value))
                })?;
                let target = self
                    .store
                    .get(reference)?
                    .ok_or_else(|| CoreError::not_found(reference))?;
                let expected = restriction.unwrap_or(*type_id);
                if target.type_pointer != expected && target.type_pointer != *type_id {
                    return Err(CoreError::invalid(format!(
                        "row {} is not an instance of type {}",
                        reference, expected
                    )));
                }
                Ok(value.to_string())
            }
        }
    }

    /// Write a single-valued field, replacing any stored attribute row.
    pub fn set_attribute(&self, object_id: RowId, field_id: RowId, value: &str) -> Result<RowId> {
        let object = self
            .store
            .get(object_id)?
            .ok_or_else(|| CoreError::not_found(object_id))?;
        let field = self.find_field(&object, field_id)?;
        let stored = self.prepare_value(&field, value)?;

        let existing = self.store.children_of_type(object_id, field_id)?;
        match existing.first() {
            Some(row) => {
                self.store.update_value(row.id, &stored)?;
                Ok(row.id)
            }
            None => {
                let order = self.next_child_order(object_id)?;
                self.store.insert(object_id, order, field_id, &stored)
            }
        }
    }

    /// Append one value to a multi-valued field.
    pub fn add_attribute_value(
        &self,
        object_id: RowId,
        field_id: RowId,
        value: &str,
    ) -> Result<RowId> {
        let object = self
            .store
            .get(object_id)?
            .ok_or_else(|| CoreError::not_found(object_id))?;
        let field = self.find_field(&object, field_id)?;
        if !field.is_multi() {
            return Err(CoreError::invalid(format!(
                "field {} is single-valued",
                field_id
            )));
        }
        let stored = self.prepare_value(&field, value)?;
        let order = self.next_child_order(object_id)?;
        self.store.insert(object_id, order, field_id, &stored)
    }

    /// Move a sibling from one order slot to another, shifting the affected
    /// range by one so the sequence stays a contiguous permutation.
    pub fn move_sibling(&self, parent: RowId, from_order: i64, to_order: i64) -> Result<()> {
        if from_order == to_order {
            return Ok(());
        }
        let siblings = self.store.children(parent)?;
        let moved = siblings
            .iter()
            .find(|row| row.order == from_order)
            .ok_or_else(|| {
                CoreError::invalid(format!(
                    "no child of {} at order {}",
                    parent, from_order
                ))
            })?
            .clone();

        for row in &siblings {
            if row.id == moved.id {
                continue;
            }
            let shifted = if from_order < to_order && row.order > from_order && row.order <= to_order
            {
                Some(row.order - 1)
            } else if to_order < from_order && row.order >= to_order && row.order < from_order {
                Some(row.order + 1)
            } else {
                None
            };
            if let Some(order) = shifted {
                self.store.update_placement(row.id, parent, order)?;
            }
        }
        self.store.update_placement(moved.id, parent, to_order)
    }

    /// Give a row a new id, rewriting every row that references the old id
    /// as id, parent or type pointer.
    ///
    /// The new row is written before the old one is removed so that an
    /// aborted rewrite never leaves the graph pointing at nothing.
    pub fn renumber(&self, old_id: RowId, new_id: RowId) -> Result<()> {
        if new_id == ROOT {
            return Err(CoreError::invalid("row id 0 is reserved for the root"));
        }
        if self.store.contains(new_id)? {
            return Err(CoreError::invalid(format!("row {} already exists", new_id)));
        }
        let row = self
            .store
            .get(old_id)?
            .ok_or_else(|| CoreError::not_found(old_id))?;

        self.store.put(Row::new(
            new_id,
            row.parent,
            if row.is_terminal() { new_id } else { row.type_pointer },
            row.order,
            row.value.clone(),
        ))?;

        for child in self.store.children(old_id)? {
            self.store.update_placement(child.id, new_id, child.order)?;
        }
        for mut pointing in self.store.rows_of_type(old_id)? {
            if pointing.id == new_id {
                continue;
            }
            pointing.type_pointer = new_id;
            self.store.put(pointing)?;
        }

        self.store.delete(old_id)
    }

    /// Inbound value references to a row.
    pub fn reference_count(&self, id: RowId) -> Result<usize> {
        Ok(self.store.rows_referencing(id)?.len())
    }

    /// Delete one row. Blocked with `ConflictingReference` while other rows
    /// still reference it, unless forced.
    pub fn delete_row(&self, id: RowId, force: bool) -> Result<()> {
        if !force {
            let references = self.reference_count(id)?;
            if references > 0 {
                return Err(CoreError::ConflictingReference { id, references });
            }
        }
        self.store.delete(id)
    }

    /// Recursive delete composed from the non-recursive primitives:
    /// children bottom-up, then the row itself.
    pub fn delete_recursive(&self, id: RowId, force: bool) -> Result<()> {
        if !force {
            let references = self.reference_count(id)?;
            if references > 0 {
                return Err(CoreError::ConflictingReference { id, references });
            }
        }
        for child in self.store.children(id)? {
            self.delete_recursive(child.id, true)?;
        }
        self.store.delete(id)
    }
}

/// Validate and normalize a primitive payload for storage.
///
/// Password values are stored as their SHA-256 hex digest; everything else
/// keeps its text form once it parses.
pub fn normalize_value(base: BaseType, value: &str) -> Result<String> {
    match base {
        BaseType::Number => {
            let trimmed = value.trim();
            trimmed
                .parse::<i64>()
                .map_err(|_| CoreError::invalid(format!("\"{}\" is not a number", value)))?;
            Ok(trimmed.to_string())
        }
        BaseType::Decimal => {
            let trimmed = value.trim();
            trimmed
                .parse::<f64>()
                .map_err(|_| CoreError::invalid(format!("\"{}\" is not a decimal", value)))?;
            Ok(trimmed.to_string())
        }
        BaseType::Boolean => match value {
            "0" | "1" => Ok(value.to_string()),
            _ => Err(CoreError::invalid(format!(
                "\"{}\" is not a boolean (expected 0 or 1)",
                value
            ))),
        },
        BaseType::Date => {
            chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map_err(|_| CoreError::invalid(format!("\"{}\" is not a date", value)))?;
            Ok(value.to_string())
        }
        BaseType::DateTime => {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map_err(|_| CoreError::invalid(format!("\"{}\" is not a date-time", value)))?;
            Ok(value.to_string())
        }
        BaseType::Password => {
            let mut hasher = Sha256::new();
            hasher.update(value.as_bytes());
            Ok(format!("{:x}", hasher.finalize()))
        }
        _ => Ok(value.to_string()),
    }
}
