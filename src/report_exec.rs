//! Report execution
//!
//! Runs a compiled `ReportPlan` against the relation store: one child
//! lookup per non-subject column plays the self-join, filters and ordering
//! apply over the materialized cells, and totals sum every numeric column.
//! The result is one internal shape; `render` projects it into the wire
//! formats without re-querying.

use crate::config::Config;
use crate::error::Result;
use crate::report::{ColumnSpec, ReportPlan};
use crate::store::RelationStore;
use crate::types::{parse_reference, Row, RowId, ROOT};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// The "from" bound of a filter, dispatched on its leading sentinel.
///
/// The sentinel characters are a historical wire format: a value that
/// legitimately starts with `=`, `~` or `!` cannot be expressed as a plain
/// lower bound. Preserved as-is for compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromBound {
    /// `=<id>`: the cell must reference exactly this row
    ExactId(RowId),
    /// `~text`: case-insensitive substring
    Pattern(String),
    /// `!text`: negated case-insensitive substring
    NotPattern(String),
    /// Anything else: numeric or lexicographic lower bound
    Lower(String),
}

impl FromBound {
    pub fn parse(raw: &str) -> FromBound {
        if let Some(rest) = raw.strip_prefix('=') {
            if let Some(id) = parse_reference(rest) {
                return FromBound::ExactId(id);
            }
            // `=` followed by a non-id degrades to a bound on the raw text.
            return FromBound::Lower(raw.to_string());
        }
        if let Some(rest) = raw.strip_prefix('~') {
            return FromBound::Pattern(rest.to_string());
        }
        if let Some(rest) = raw.strip_prefix('!') {
            return FromBound::NotPattern(rest.to_string());
        }
        FromBound::Lower(raw.to_string())
    }
}

/// One filter, keyed by the column (or extra-join) target it constrains.
/// All present parts must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub target: RowId,
    pub from: Option<String>,
    pub to: Option<String>,
    pub exact: Option<String>,
    pub contains: Option<String>,
}

impl Filter {
    pub fn new(target: RowId) -> Self {
        Filter {
            target,
            ..Filter::default()
        }
    }

    pub fn from_bound(mut self, raw: impl Into<String>) -> Self {
        self.from = Some(raw.into());
        self
    }

    pub fn to_bound(mut self, raw: impl Into<String>) -> Self {
        self.to = Some(raw.into());
        self
    }

    pub fn exact(mut self, raw: impl Into<String>) -> Self {
        self.exact = Some(raw.into());
        self
    }

    pub fn contains(mut self, raw: impl Into<String>) -> Self {
        self.contains = Some(raw.into());
        self
    }
}

/// Paging window. `limit: None` is the totals/count shape: effectively
/// unbounded, budgeted by the configured row cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Page {
    pub fn all() -> Self {
        Page::default()
    }

    pub fn limit(limit: usize) -> Self {
        Page {
            limit: Some(limit),
            offset: 0,
        }
    }

    pub fn window(limit: usize, offset: usize) -> Self {
        Page {
            limit: Some(limit),
            offset,
        }
    }
}

/// Ordering: comma-separated column target ids, `-` prefix descending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderSpec {
    pub keys: Vec<(RowId, bool)>, // (target, descending)
}

impl OrderSpec {
    pub fn none() -> Self {
        OrderSpec::default()
    }

    /// Unresolvable tokens are dropped silently; that is the historical
    /// contract of the ordering string.
    pub fn parse(text: &str) -> OrderSpec {
        let mut keys = Vec::new();
        for token in text.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (body, descending) = match token.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (token, false),
            };
            if let Some(target) = parse_reference(body) {
                keys.push((target, descending));
            }
        }
        OrderSpec { keys }
    }
}

/// One cell: flat display text plus the row ids behind it (subject and
/// reference columns carry ids, primitives none).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportCell {
    pub text: String,
    pub ids: Vec<RowId>,
}

impl ReportCell {
    fn text_only(text: String) -> Self {
        ReportCell {
            text,
            ids: Vec::new(),
        }
    }

    pub fn primary_id(&self) -> Option<RowId> {
        self.ids.first().copied()
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub subject: RowId,
    pub parent: RowId,
    pub cells: Vec<ReportCell>,
}

/// The single internal result every renderer projects from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportResult {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<ReportRow>,
    /// One entry per column; `None` for non-numeric columns
    pub totals: Vec<Option<f64>>,
    pub count: usize,
}

/// Executes compiled report plans
pub struct ReportExecutor<'a, S: RelationStore + ?Sized> {
    store: &'a S,
    config: &'a Config,
}

impl<'a, S: RelationStore + ?Sized> ReportExecutor<'a, S> {
    pub fn new(store: &'a S, config: &'a Config) -> Self {
        ReportExecutor { store, config }
    }

    /// Run the plan: scan, join, filter, order, page, total.
    pub fn execute(
        &self,
        plan: &ReportPlan,
        filters: &[Filter],
        page: Page,
        order: &OrderSpec,
    ) -> Result<ReportResult> {
        let candidates = self.store.rows_of_type(plan.subject_type)?;
        debug!(
            report = plan.report.as_u64(),
            candidates = candidates.len(),
            "executing report"
        );

        let row_cap = match page.limit {
            Some(_) => usize::MAX,
            None => self.config.totals_row_cap,
        };

        let mut parent_cache: HashMap<RowId, Option<Row>> = HashMap::new();
        let mut matched: Vec<ReportRow> = Vec::new();
        let mut capped = false;

        for subject in candidates {
            if !self.is_subject_instance(&subject, plan.subject_type, &mut parent_cache)? {
                continue;
            }
            let cells = self.build_cells(plan, &subject)?;
            if !self.passes_filters(plan, filters, &subject, &cells)? {
                continue;
            }
            if matched.len() >= row_cap {
                capped = true;
                break;
            }
            matched.push(ReportRow {
                subject: subject.id,
                parent: subject.parent,
                cells,
            });
        }
        if capped {
            warn!(
                report = plan.report.as_u64(),
                cap = row_cap,
                "unpaged report hit the row cap, result truncated"
            );
        }

        self.sort_rows(plan, order, &mut matched);

        let total_matched = matched.len();
        let rows: Vec<ReportRow> = match page.limit {
            Some(limit) => matched
                .into_iter()
                .skip(page.offset)
                .take(limit)
                .collect(),
            None => matched,
        };

        let totals = compute_totals(&plan.columns, &rows);
        let count = match page.limit {
            Some(_) => rows.len(),
            None => total_matched,
        };

        Ok(ReportResult {
            columns: plan.columns.clone(),
            rows,
            totals,
            count,
        })
    }

    /// Base predicate: the subject's type, excluding the structural rows
    /// that share its type pointer (root-level restriction rows and field
    /// definitions hanging off foreign type rows).
    fn is_subject_instance(
        &self,
        row: &Row,
        subject_type: RowId,
        parent_cache: &mut HashMap<RowId, Option<Row>>,
    ) -> Result<bool> {
        if row.parent == ROOT {
            return Ok(false);
        }
        if row.parent == subject_type {
            return Ok(true);
        }
        let parent = match parent_cache.get(&row.parent) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = self.store.get(row.parent)?;
                parent_cache.insert(row.parent, fetched.clone());
                fetched
            }
        };
        match parent {
            // A child of some other root-level type row is a field
            // definition, not data.
            Some(parent_row) => Ok(parent_row.parent != ROOT),
            None => Ok(false),
        }
    }

    fn build_cells(&self, plan: &ReportPlan, subject: &Row) -> Result<Vec<ReportCell>> {
        let mut cells = Vec::with_capacity(plan.columns.len());
        for column in &plan.columns {
            cells.push(self.build_cell(column, subject)?);
        }
        Ok(cells)
    }

    fn build_cell(&self, column: &ColumnSpec, subject: &Row) -> Result<ReportCell> {
        if column.subject {
            return Ok(ReportCell {
                text: subject.value.clone(),
                ids: vec![subject.id],
            });
        }

        let stored = self.store.children_of_type(subject.id, column.target)?;
        if column.reference {
            let mut ids = Vec::new();
            let mut texts = Vec::new();
            for row in &stored {
                let Some(target_id) = row.value_as_reference() else {
                    continue;
                };
                if let Some(target) = self.store.get(target_id)? {
                    ids.push(target.id);
                    texts.push(target.value);
                }
            }
            return Ok(ReportCell {
                text: texts.join(", "),
                ids,
            });
        }

        if column.multi {
            return Ok(ReportCell::text_only(stored.len().to_string()));
        }

        Ok(ReportCell::text_only(
            stored.first().map(|row| row.value.clone()).unwrap_or_default(),
        ))
    }

    fn passes_filters(
        &self,
        plan: &ReportPlan,
        filters: &[Filter],
        subject: &Row,
        cells: &[ReportCell],
    ) -> Result<bool> {
        for filter in filters {
            if let Some((index, column)) = plan.column(filter.target) {
                if !cell_matches(filter, column, &cells[index]) {
                    return Ok(false);
                }
            } else if plan.extra_joins.contains(&filter.target) {
                if !self.join_matches(filter, subject)? {
                    return Ok(false);
                }
            } else {
                // A filter on nothing the plan knows cannot match anything.
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Extra joins contribute no column; a filter on one holds when any
    /// child row at (subject, join target) satisfies it.
    fn join_matches(&self, filter: &Filter, subject: &Row) -> Result<bool> {
        let stored = self.store.children_of_type(subject.id, filter.target)?;
        Ok(stored.iter().any(|row| {
            let cell = ReportCell {
                text: row.value.clone(),
                ids: row.value_as_reference().into_iter().collect(),
            };
            text_matches(filter, &cell, false)
        }))
    }

    fn sort_rows(&self, plan: &ReportPlan, order: &OrderSpec, rows: &mut [ReportRow]) {
        let mut resolved: Vec<(usize, bool, bool)> = Vec::new();
        for (target, descending) in &order.keys {
            match plan.column(*target) {
                Some((index, column)) => {
                    resolved.push((index, *descending, column.base.is_numeric()))
                }
                None => {
                    // Dropped silently: historical ordering-string contract.
                    debug!(order_key = target.as_u64(), "order key resolves to no column");
                }
            }
        }
        if resolved.is_empty() {
            return;
        }

        rows.sort_by(|a, b| {
            for (index, descending, numeric) in &resolved {
                let left = &a.cells[*index].text;
                let right = &b.cells[*index].text;
                let ordering = if *numeric {
                    compare_numeric(left, right)
                } else {
                    left.cmp(right)
                };
                let ordering = if *descending { ordering.reverse() } else { ordering };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }
}

fn compare_numeric(left: &str, right: &str) -> Ordering {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        _ => left.cmp(right),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn cell_matches(filter: &Filter, column: &ColumnSpec, cell: &ReportCell) -> bool {
    text_matches(filter, cell, column.base.is_numeric() && !column.reference)
}

fn text_matches(filter: &Filter, cell: &ReportCell, numeric: bool) -> bool {
    if let Some(raw) = &filter.from {
        let matched = match FromBound::parse(raw) {
            FromBound::ExactId(id) => cell.ids.contains(&id),
            FromBound::Pattern(pattern) => contains_ci(&cell.text, &pattern),
            FromBound::NotPattern(pattern) => !contains_ci(&cell.text, &pattern),
            FromBound::Lower(bound) => lower_bound_holds(&cell.text, &bound, numeric),
        };
        if !matched {
            return false;
        }
    }
    if let Some(bound) = &filter.to {
        let matched = if numeric {
            match (cell.text.parse::<f64>(), bound.parse::<f64>()) {
                (Ok(value), Ok(limit)) => value <= limit,
                _ => false,
            }
        } else {
            cell.text.as_str() <= bound.as_str()
        };
        if !matched {
            return false;
        }
    }
    if let Some(exact) = &filter.exact {
        if &cell.text != exact {
            return false;
        }
    }
    if let Some(needle) = &filter.contains {
        if !contains_ci(&cell.text, needle) {
            return false;
        }
    }
    true
}

fn lower_bound_holds(text: &str, bound: &str, numeric: bool) -> bool {
    if numeric {
        match (text.parse::<f64>(), bound.parse::<f64>()) {
            (Ok(value), Ok(limit)) => value >= limit,
            _ => false,
        }
    } else {
        text >= bound
    }
}

fn compute_totals(columns: &[ColumnSpec], rows: &[ReportRow]) -> Vec<Option<f64>> {
    columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            if !column.is_numeric() {
                return None;
            }
            Some(
                rows.iter()
                    .filter_map(|row| row.cells[index].text.parse::<f64>().ok())
                    .sum(),
            )
        })
        .collect()
}
