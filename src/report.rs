//! Report compilation
//!
//! A report is itself rows: a `Report`-typed child of its subject type,
//! with `ReportColumn` children naming field definitions (or the subject
//! type, for the instance's own value) and `ReportJoin` children adding
//! filter-only context. The compiler turns that into a column descriptor
//! plan; running it is `report_exec`'s job.

use crate::error::{CoreError, Result};
use crate::schema::{FieldTarget, SchemaResolver};
use crate::store::RelationStore;
use crate::types::{parse_reference, BaseType, RowId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One output column of a compiled report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// The `ReportColumn` row this came from
    pub column_row: RowId,
    /// Field-definition id, or the subject type id for the own-value column
    pub target: RowId,
    pub label: String,
    /// Base type driving comparisons and totals
    pub base: BaseType,
    /// True for the subject's own value column
    pub subject: bool,
    /// True when the column reads a reference field
    pub reference: bool,
    /// True when the underlying field is multi-valued
    pub multi: bool,
}

impl ColumnSpec {
    /// Columns whose values are summed into totals
    pub fn is_numeric(&self) -> bool {
        !self.reference && !self.subject && self.base.is_numeric() && !self.multi
    }

    /// Columns that carry a companion identifier in column-major output
    pub fn carries_id(&self) -> bool {
        self.subject || self.reference
    }
}

/// A compiled report, ready to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPlan {
    pub report: RowId,
    pub name: String,
    pub subject_type: RowId,
    pub columns: Vec<ColumnSpec>,
    /// Additional type pointers joined on the subject id, filter-only
    pub extra_joins: Vec<RowId>,
}

impl ReportPlan {
    pub fn column(&self, target: RowId) -> Option<(usize, &ColumnSpec)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.target == target)
    }
}

/// Compiles report definitions into plans
pub struct ReportCompiler<'a, S: RelationStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: RelationStore + ?Sized> ReportCompiler<'a, S> {
    pub fn new(store: &'a S) -> Self {
        ReportCompiler { store }
    }

    /// Compile the report stored at `report_id`. Fails `NotFound` when the
    /// row is absent or is not a report row. Columns naming unknown fields
    /// are dropped with a log line rather than failing the whole report.
    pub fn compile(&self, report_id: RowId) -> Result<ReportPlan> {
        let report = self
            .store
            .get(report_id)?
            .ok_or_else(|| CoreError::not_found(report_id))?;
        if report.type_pointer != BaseType::Report.id() {
            return Err(CoreError::not_found(report_id));
        }

        let subject_type = report.parent;
        let resolver = SchemaResolver::new(self.store);
        let subject = resolver.type_definition(subject_type)?;
        let fields = resolver.resolve_fields(subject_type)?;

        let mut columns = Vec::new();
        let mut extra_joins = Vec::new();

        // children() keeps declaration order; columns and joins interleave
        // freely in storage.
        for child in self.store.children(report_id)? {
            if child.type_pointer == BaseType::ReportColumn.id() {
                let Some(target) = parse_reference(&child.value) else {
                    debug!(column_row = child.id.as_u64(), "skipping malformed report column");
                    continue;
                };
                if target == subject_type {
                    columns.push(ColumnSpec {
                        column_row: child.id,
                        target,
                        label: subject.name.clone(),
                        base: BaseType::ShortText,
                        subject: true,
                        reference: false,
                        multi: false,
                    });
                    continue;
                }
                let Some(field) = fields.iter().find(|f| f.id == target) else {
                    debug!(
                        column_row = child.id.as_u64(),
                        field_id = target.as_u64(),
                        "report column names no field of the subject type"
                    );
                    continue;
                };
                let (base, reference) = match &field.target {
                    FieldTarget::Primitive(base) => (*base, false),
                    FieldTarget::Reference { .. } => (BaseType::ShortText, true),
                };
                columns.push(ColumnSpec {
                    column_row: child.id,
                    target,
                    label: field.key().to_string(),
                    base,
                    subject: false,
                    reference,
                    multi: field.is_multi(),
                });
            } else if child.type_pointer == BaseType::ReportJoin.id() {
                match parse_reference(&child.value) {
                    Some(join) => extra_joins.push(join),
                    None => {
                        debug!(join_row = child.id.as_u64(), "skipping malformed report join");
                    }
                }
            }
        }

        Ok(ReportPlan {
            report: report_id,
            name: report.value,
            subject_type,
            columns,
            extra_joins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Ops;
    use crate::store::MemoryStore;
    use crate::types::{FieldModifiers, DEFAULT_ORDER, ROOT};

    fn report_setup() -> (MemoryStore, RowId, RowId, RowId, RowId) {
        let store = MemoryStore::with_base_types();
        let (invoice, amount, customer, report);
        {
            let ops = Ops::new(&store);
            let person = ops.create_type("Person", false).unwrap();
            invoice = ops.create_type("Invoice", false).unwrap();
            amount = ops
                .add_field(invoice, BaseType::Number.id(), "Amount", FieldModifiers::default())
                .unwrap();
            customer = ops
                .add_field(invoice, person, "Customer", FieldModifiers::default())
                .unwrap();
            report = store
                .insert(invoice, 10, BaseType::Report.id(), "All invoices")
                .unwrap();
            store
                .insert(report, 1, BaseType::ReportColumn.id(), &invoice.as_u64().to_string())
                .unwrap();
            store
                .insert(report, 2, BaseType::ReportColumn.id(), &amount.as_u64().to_string())
                .unwrap();
            store
                .insert(report, 3, BaseType::ReportColumn.id(), &customer.as_u64().to_string())
                .unwrap();
        }
        (store, invoice, amount, customer, report)
    }

    #[test]
    fn test_compile_resolves_columns() {
        let (store, invoice, amount, customer, report) = report_setup();
        let plan = ReportCompiler::new(&store).compile(report).unwrap();

        assert_eq!(plan.subject_type, invoice);
        assert_eq!(plan.name, "All invoices");
        assert_eq!(plan.columns.len(), 3);

        assert!(plan.columns[0].subject);
        assert_eq!(plan.columns[0].label, "Invoice");

        assert_eq!(plan.columns[1].target, amount);
        assert_eq!(plan.columns[1].base, BaseType::Number);
        assert!(plan.columns[1].is_numeric());

        assert_eq!(plan.columns[2].target, customer);
        assert!(plan.columns[2].reference);
        assert!(plan.columns[2].carries_id());
        assert!(!plan.columns[2].is_numeric());
    }

    #[test]
    fn test_compile_missing_report_is_not_found() {
        let (store, invoice, ..) = report_setup();
        let compiler = ReportCompiler::new(&store);

        assert!(matches!(
            compiler.compile(RowId(9999)),
            Err(CoreError::NotFound { .. })
        ));
        // A row that exists but is not a report row is equally absent.
        assert!(matches!(
            compiler.compile(invoice),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_compile_drops_unresolvable_columns() {
        let (store, _, _, _, report) = report_setup();
        store
            .insert(report, 4, BaseType::ReportColumn.id(), "not-an-id")
            .unwrap();
        store
            .insert(report, 5, BaseType::ReportColumn.id(), "424242")
            .unwrap();

        let plan = ReportCompiler::new(&store).compile(report).unwrap();
        assert_eq!(plan.columns.len(), 3);
    }

    #[test]
    fn test_compile_collects_extra_joins() {
        let (store, _, _, _, report) = report_setup();
        let ops = Ops::new(&store);
        let payment = ops.create_type("Payment", false).unwrap();
        let paid_via = ops
            .add_field(payment, BaseType::ShortText.id(), "Via", FieldModifiers::default())
            .unwrap();
        store
            .insert(
                report,
                DEFAULT_ORDER,
                BaseType::ReportJoin.id(),
                &paid_via.as_u64().to_string(),
            )
            .unwrap();

        let plan = ReportCompiler::new(&store).compile(report).unwrap();
        assert_eq!(plan.extra_joins, vec![paid_via]);
        // Joins contribute no output column.
        assert_eq!(plan.columns.len(), 3);
        assert_ne!(plan.subject_type, ROOT);
    }
}
