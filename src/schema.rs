//! Schema resolution over the flat relation
//!
//! Rows under a type are interpreted as an ordered field list; rows under
//! an instance are joined against that list. The classification lives here
//! so that `id == type_pointer` checks never leak to call sites: everything
//! downstream sees `TypeKind`, `FieldDef` and `ResolvedInstance`.

use crate::error::{CoreError, Result};
use crate::store::RelationStore;
use crate::types::{BaseType, FieldModifiers, Row, RowId, ROOT, UNIQUE_ORDER_FLAG};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a root-level row defines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeKind {
    /// Self-describing leaf type (`id == type_pointer`)
    Terminal(BaseType),
    /// A composite entity whose children are field definitions
    Composite,
    /// A subset of another root-level type
    Restriction { base: RowId },
}

/// A resolved type definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub id: RowId,
    pub name: String,
    pub kind: TypeKind,
    /// Root-level order doubles as the "values must be unique" flag
    pub unique_values: bool,
}

/// Classification of a field's target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldTarget {
    Primitive(BaseType),
    Reference {
        /// The composite type the field ultimately points at
        type_id: RowId,
        /// The declared subset type, when the field targets a restriction
        restriction: Option<RowId>,
    },
}

impl FieldTarget {
    pub fn base_type(&self) -> Option<BaseType> {
        match self {
            FieldTarget::Primitive(base) => Some(*base),
            FieldTarget::Reference { .. } => None,
        }
    }
}

/// One resolved field definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: RowId,
    pub name: String,
    pub modifiers: FieldModifiers,
    pub target: FieldTarget,
    pub order: i64,
}

impl FieldDef {
    pub fn is_multi(&self) -> bool {
        self.modifiers.multi
    }

    pub fn is_required(&self) -> bool {
        self.modifiers.required
    }

    /// Alias when declared, display name otherwise
    pub fn key(&self) -> &str {
        self.modifiers.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A referenced row, as reported by instance resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedObject {
    pub id: RowId,
    pub display_value: String,
}

/// The stored state of one field on one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolvedValue {
    /// No attribute row stored
    Missing,
    /// Scalar primitive payload
    Text(String),
    /// Multi-valued primitive field: number of stored children
    Count(usize),
    /// Reference field: referenced rows in creation order
    References(Vec<ReferencedObject>),
}

impl ResolvedValue {
    /// Flat text rendering: references concatenate display values in
    /// creation order.
    pub fn display_text(&self) -> String {
        match self {
            ResolvedValue::Missing => String::new(),
            ResolvedValue::Text(text) => text.clone(),
            ResolvedValue::Count(n) => n.to_string(),
            ResolvedValue::References(refs) => refs
                .iter()
                .map(|r| r.display_value.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// One field joined against its stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedField {
    pub field: FieldDef,
    pub value: ResolvedValue,
}

/// An instance joined against its resolved field list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInstance {
    pub id: RowId,
    pub type_id: RowId,
    pub value: String,
    pub fields: Vec<ResolvedField>,
}

impl ResolvedInstance {
    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.fields
            .iter()
            .find(|f| f.field.name == name || f.field.key() == name)
    }
}

/// Read-only schema interpreter over a relation store
pub struct SchemaResolver<'a, S: RelationStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RelationStore + ?Sized> SchemaResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        SchemaResolver { store }
    }

    /// Classify a root-level row.
    pub fn classify(&self, row: &Row) -> Result<TypeKind> {
        if row.parent != ROOT {
            return Err(CoreError::invalid(format!(
                "row {} is not a type definition",
                row.id
            )));
        }
        if row.is_terminal() {
            let base = BaseType::from_id(row.id).ok_or_else(|| {
                CoreError::invalid(format!("terminal row {} is not a known base type", row.id))
            })?;
            return Ok(TypeKind::Terminal(base));
        }
        if row.type_pointer == ROOT {
            return Ok(TypeKind::Composite);
        }
        Ok(TypeKind::Restriction {
            base: row.type_pointer,
        })
    }

    /// Resolve a type id into its definition. Fails `NotFound` on unknown
    /// ids and `InvalidArgument` on rows that are not type definitions.
    pub fn type_definition(&self, type_id: RowId) -> Result<TypeDefinition> {
        let row = self
            .store
            .get(type_id)?
            .ok_or_else(|| CoreError::not_found(type_id))?;
        let kind = self.classify(&row)?;
        Ok(TypeDefinition {
            id: row.id,
            name: row.value.clone(),
            kind,
            unique_values: row.order == UNIQUE_ORDER_FLAG,
        })
    }

    /// Follow a restriction chain down to its base, short-circuiting on
    /// terminal rows and on revisits (the model does not forbid cycles).
    fn resolve_target(&self, declared: RowId) -> Result<FieldTarget> {
        let mut visited: HashSet<RowId> = HashSet::new();
        let mut current = declared;

        loop {
            let row = self
                .store
                .get(current)?
                .ok_or_else(|| CoreError::not_found(current))?;

            if row.is_terminal() {
                let base = BaseType::from_id(row.id).ok_or_else(|| {
                    CoreError::invalid(format!(
                        "terminal row {} is not a known base type",
                        row.id
                    ))
                })?;
                return Ok(FieldTarget::Primitive(base));
            }

            if row.type_pointer == ROOT || !visited.insert(current) {
                let restriction = if declared == row.id { None } else { Some(declared) };
                return Ok(FieldTarget::Reference {
                    type_id: row.id,
                    restriction,
                });
            }

            current = row.type_pointer;
        }
    }

    /// Ordered field list of a type.
    ///
    /// Terminal types have no fields. Restriction types inherit the field
    /// list of their base. Marker children (reports, access rules) and
    /// instance rows stored under the type row are not fields.
    pub fn resolve_fields(&self, type_id: RowId) -> Result<Vec<FieldDef>> {
        let definition = self.type_definition(type_id)?;

        match definition.kind {
            TypeKind::Terminal(_) => Ok(Vec::new()),
            TypeKind::Restriction { .. } => {
                let target = self.resolve_target(type_id)?;
                match target {
                    FieldTarget::Reference { type_id: base, .. } => self.resolve_fields(base),
                    FieldTarget::Primitive(_) => Ok(Vec::new()),
                }
            }
            TypeKind::Composite => {
                let mut fields = Vec::new();
                for child in self.store.children(type_id)? {
                    if child.type_pointer == type_id {
                        continue; // instance stored under its type row
                    }
                    if let Some(base) = BaseType::from_id(child.type_pointer) {
                        if base.is_marker() {
                            continue;
                        }
                    }
                    let (name, modifiers) = FieldModifiers::decode(&child.value);
                    let target = self.resolve_target(child.type_pointer)?;
                    fields.push(FieldDef {
                        id: child.id,
                        name,
                        modifiers,
                        target,
                        order: child.order,
                    });
                }
                Ok(fields)
            }
        }
    }

    /// Join one instance's stored attribute rows against the type's field
    /// list.
    pub fn resolve_instance(&self, type_id: RowId, object_id: RowId) -> Result<ResolvedInstance> {
        let object = self
            .store
            .get(object_id)?
            .ok_or_else(|| CoreError::not_found(object_id))?;
        if object.type_pointer != type_id {
            return Err(CoreError::invalid(format!(
                "row {} is not an instance of type {}",
                object_id, type_id
            )));
        }

        let fields = self.resolve_fields(type_id)?;
        let mut resolved = Vec::with_capacity(fields.len());

        for field in fields {
            let stored = self.store.children_of_type(object_id, field.id)?;
            let value = match &field.target {
                FieldTarget::Primitive(_) if field.is_multi() => ResolvedValue::Count(stored.len()),
                FieldTarget::Primitive(_) => match stored.first() {
                    Some(row) => ResolvedValue::Text(row.value.clone()),
                    None => ResolvedValue::Missing,
                },
                FieldTarget::Reference { .. } => {
                    if stored.is_empty() {
                        ResolvedValue::Missing
                    } else {
                        let mut refs = Vec::new();
                        for row in &stored {
                            // Dangling or non-numeric payloads are dropped,
                            // not surfaced as errors.
                            let Some(target_id) = row.value_as_reference() else {
                                continue;
                            };
                            if let Some(target) = self.store.get(target_id)? {
                                refs.push(ReferencedObject {
                                    id: target.id,
                                    display_value: target.value,
                                });
                            }
                        }
                        ResolvedValue::References(refs)
                    }
                }
            };
            resolved.push(ResolvedField { field, value });
        }

        Ok(ResolvedInstance {
            id: object.id,
            type_id,
            value: object.value,
            fields: resolved,
        })
    }

    /// True when `row` is a field definition: a child of a root-level
    /// composite or restriction type row, other than that row's instances.
    pub fn is_field_definition(&self, row: &Row) -> Result<bool> {
        if row.parent == ROOT {
            return Ok(false);
        }
        let Some(parent) = self.store.get(row.parent)? else {
            return Ok(false);
        };
        if parent.parent != ROOT || parent.is_terminal() {
            return Ok(false);
        }
        Ok(row.type_pointer != parent.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::DEFAULT_ORDER;

    fn composite(store: &MemoryStore, name: &str) -> RowId {
        store.insert(ROOT, DEFAULT_ORDER, ROOT, name).unwrap()
    }

    #[test]
    fn test_terminal_types_have_no_fields() {
        let store = MemoryStore::with_base_types();
        let resolver = SchemaResolver::new(&store);

        for base in BaseType::ALL {
            assert!(resolver.resolve_fields(base.id()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_unknown_type_is_not_found() {
        let store = MemoryStore::with_base_types();
        let resolver = SchemaResolver::new(&store);
        assert!(matches!(
            resolver.resolve_fields(RowId(9999)),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_fields_orders_and_classifies() {
        let store = MemoryStore::with_base_types();
        let person = composite(&store, "Person");
        let invoice = composite(&store, "Invoice");
        store
            .insert(invoice, 2, person, "Customer")
            .unwrap();
        store
            .insert(invoice, 1, BaseType::Number.id(), "Amount|req")
            .unwrap();

        let resolver = SchemaResolver::new(&store);
        let fields = resolver.resolve_fields(invoice).unwrap();

        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "Amount");
        assert!(fields[0].is_required());
        assert_eq!(fields[0].target, FieldTarget::Primitive(BaseType::Number));

        assert_eq!(fields[1].name, "Customer");
        assert_eq!(
            fields[1].target,
            FieldTarget::Reference {
                type_id: person,
                restriction: None
            }
        );
    }

    #[test]
    fn test_marker_children_and_instances_are_not_fields() {
        let store = MemoryStore::with_base_types();
        let invoice = composite(&store, "Invoice");
        store
            .insert(invoice, 1, BaseType::Number.id(), "Amount")
            .unwrap();
        store
            .insert(invoice, 1, BaseType::Report.id(), "Monthly totals")
            .unwrap();
        store.insert(invoice, 1, invoice, "INV-1").unwrap();

        let resolver = SchemaResolver::new(&store);
        let fields = resolver.resolve_fields(invoice).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "Amount");
    }

    #[test]
    fn test_restriction_chain_resolves_to_base() {
        let store = MemoryStore::with_base_types();
        let person = composite(&store, "Person");
        store
            .insert(person, 1, BaseType::ShortText.id(), "Name")
            .unwrap();
        // "Supplier" is a subset of Person; a field targeting it resolves
        // through the chain.
        let supplier = store.insert(ROOT, DEFAULT_ORDER, person, "Supplier").unwrap();
        let invoice = composite(&store, "Invoice");
        store.insert(invoice, 1, supplier, "Payee").unwrap();

        let resolver = SchemaResolver::new(&store);
        let fields = resolver.resolve_fields(invoice).unwrap();
        assert_eq!(
            fields[0].target,
            FieldTarget::Reference {
                type_id: person,
                restriction: Some(supplier)
            }
        );

        // The restriction type itself resolves to the base's field list.
        let inherited = resolver.resolve_fields(supplier).unwrap();
        assert_eq!(inherited.len(), 1);
        assert_eq!(inherited[0].name, "Name");
    }

    #[test]
    fn test_restriction_cycle_short_circuits() {
        let store = MemoryStore::with_base_types();
        // Two restriction rows pointing at each other; resolution must
        // terminate rather than recurse forever.
        let a = store.insert(ROOT, DEFAULT_ORDER, ROOT, "A").unwrap();
        let b = store.insert(ROOT, DEFAULT_ORDER, a, "B").unwrap();
        store.put(Row::new(a, ROOT, b, DEFAULT_ORDER, "A".to_string())).unwrap();

        let holder = composite(&store, "Holder");
        store.insert(holder, 1, a, "Link").unwrap();

        let resolver = SchemaResolver::new(&store);
        let fields = resolver.resolve_fields(holder).unwrap();
        assert!(matches!(fields[0].target, FieldTarget::Reference { .. }));
    }

    #[test]
    fn test_resolve_instance_scalar_and_reference() {
        let store = MemoryStore::with_base_types();
        let person = composite(&store, "Person");
        let invoice = composite(&store, "Invoice");
        let amount = store
            .insert(invoice, 1, BaseType::Number.id(), "Amount|req")
            .unwrap();
        let customer = store.insert(invoice, 2, person, "Customer").unwrap();

        let alice = store.insert(person, 1, person, "Alice").unwrap();
        let inv = store.insert(invoice, 1, invoice, "INV-1").unwrap();
        store.insert(inv, 1, amount, "150").unwrap();
        store
            .insert(inv, 2, customer, &alice.as_u64().to_string())
            .unwrap();

        let resolver = SchemaResolver::new(&store);
        let resolved = resolver.resolve_instance(invoice, inv).unwrap();

        assert_eq!(resolved.value, "INV-1");
        assert_eq!(
            resolved.field("Amount").unwrap().value,
            ResolvedValue::Text("150".to_string())
        );
        assert_eq!(
            resolved.field("Customer").unwrap().value,
            ResolvedValue::References(vec![ReferencedObject {
                id: alice,
                display_value: "Alice".to_string()
            }])
        );
    }

    #[test]
    fn test_resolve_instance_counts_multi_primitives() {
        let store = MemoryStore::with_base_types();
        let note = composite(&store, "Note");
        let tags = store
            .insert(note, 1, BaseType::ShortText.id(), "Tags|multi")
            .unwrap();
        let obj = store.insert(note, 1, note, "n1").unwrap();
        store.insert(obj, 1, tags, "red").unwrap();
        store.insert(obj, 2, tags, "blue").unwrap();

        let resolver = SchemaResolver::new(&store);
        let resolved = resolver.resolve_instance(note, obj).unwrap();
        assert_eq!(resolved.field("Tags").unwrap().value, ResolvedValue::Count(2));
    }

    #[test]
    fn test_resolve_instance_multi_reference_order() {
        let store = MemoryStore::with_base_types();
        let person = composite(&store, "Person");
        let team = composite(&store, "Team");
        let members = store.insert(team, 1, person, "Members|multi").unwrap();

        let bob = store.insert(person, 1, person, "Bob").unwrap();
        let eve = store.insert(person, 2, person, "Eve").unwrap();
        let squad = store.insert(team, 1, team, "Squad").unwrap();
        store.insert(squad, 1, members, &eve.as_u64().to_string()).unwrap();
        store.insert(squad, 2, members, &bob.as_u64().to_string()).unwrap();

        let resolver = SchemaResolver::new(&store);
        let resolved = resolver.resolve_instance(team, squad).unwrap();

        // Creation (id) order, not display order.
        assert_eq!(
            resolved.field("Members").unwrap().value.display_text(),
            "Eve, Bob"
        );
    }

    #[test]
    fn test_resolve_instance_type_mismatch() {
        let store = MemoryStore::with_base_types();
        let person = composite(&store, "Person");
        let invoice = composite(&store, "Invoice");
        let alice = store.insert(person, 1, person, "Alice").unwrap();

        let resolver = SchemaResolver::new(&store);
        assert!(matches!(
            resolver.resolve_instance(invoice, alice),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_is_field_definition() {
        let store = MemoryStore::with_base_types();
        let person = composite(&store, "Person");
        let invoice = composite(&store, "Invoice");
        let customer = store.insert(invoice, 1, person, "Customer").unwrap();
        let alice = store.insert(person, 1, person, "Alice").unwrap();

        let resolver = SchemaResolver::new(&store);
        let customer_row = store.get(customer).unwrap().unwrap();
        let alice_row = store.get(alice).unwrap().unwrap();

        assert!(resolver.is_field_definition(&customer_row).unwrap());
        assert!(!resolver.is_field_definition(&alice_row).unwrap());
    }
}
