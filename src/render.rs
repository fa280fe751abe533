//! Report wire shapes
//!
//! The several historical output formats are presentation concerns over the
//! one `ReportResult`; each renderer is a pure projection and never goes
//! back to the store. Callers pick a shape per request.

use crate::report_exec::{ReportResult, ReportRow};
use serde_json::{json, Map, Value};

/// The historically-fixed output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderShape {
    /// One array per row, cells in column order
    RowMajor,
    /// One array per column, subject/reference columns accompanied by a
    /// synthetic `<label>_id` column
    ColumnMajor,
    /// One name-keyed object per row
    NamedObjects,
    /// The first row as a single object (empty object when no rows)
    FirstObject,
    /// Objects keyed by subject id
    ById,
    /// Row objects grouped under their parent id
    ByParent,
}

/// Project a result into the requested shape.
pub fn render(result: &ReportResult, shape: RenderShape) -> Value {
    match shape {
        RenderShape::RowMajor => row_major(result),
        RenderShape::ColumnMajor => column_major(result),
        RenderShape::NamedObjects => Value::Array(
            result.rows.iter().map(|row| row_object(result, row)).collect(),
        ),
        RenderShape::FirstObject => result
            .rows
            .first()
            .map(|row| row_object(result, row))
            .unwrap_or_else(|| Value::Object(Map::new())),
        RenderShape::ById => by_id(result),
        RenderShape::ByParent => by_parent(result),
    }
}

/// The full response envelope: shaped data plus totals and count.
pub fn render_envelope(result: &ReportResult, shape: RenderShape) -> Value {
    json!({
        "data": render(result, shape),
        "count": result.count,
        "totals": result.totals,
    })
}

fn row_major(result: &ReportResult) -> Value {
    Value::Array(
        result
            .rows
            .iter()
            .map(|row| {
                Value::Array(
                    row.cells
                        .iter()
                        .map(|cell| Value::String(cell.text.clone()))
                        .collect(),
                )
            })
            .collect(),
    )
}

fn column_major(result: &ReportResult) -> Value {
    let mut object = Map::new();
    for (index, column) in result.columns.iter().enumerate() {
        let values: Vec<Value> = result
            .rows
            .iter()
            .map(|row| Value::String(row.cells[index].text.clone()))
            .collect();
        object.insert(column.label.clone(), Value::Array(values));

        if column.carries_id() {
            let ids: Vec<Value> = result
                .rows
                .iter()
                .map(|row| match row.cells[index].primary_id() {
                    Some(id) => json!(id.as_u64()),
                    None => Value::Null,
                })
                .collect();
            object.insert(format!("{}_id", column.label), Value::Array(ids));
        }
    }
    Value::Object(object)
}

fn row_object(result: &ReportResult, row: &ReportRow) -> Value {
    let mut object = Map::new();
    for (index, column) in result.columns.iter().enumerate() {
        object.insert(
            column.label.clone(),
            Value::String(row.cells[index].text.clone()),
        );
    }
    Value::Object(object)
}

fn by_id(result: &ReportResult) -> Value {
    let mut object = Map::new();
    for row in &result.rows {
        object.insert(row.subject.as_u64().to_string(), row_object(result, row));
    }
    Value::Object(object)
}

fn by_parent(result: &ReportResult) -> Value {
    let mut object: Map<String, Value> = Map::new();
    for row in &result.rows {
        let key = row.parent.as_u64().to_string();
        let entry = object
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(row_object(result, row));
        }
    }
    Value::Object(object)
}
