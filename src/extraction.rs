//! Table-shape-aware extraction of candidate facts from raw grids.
//!
//! Each recognized table shape has its own pure extraction function. Values
//! leave this module already converted to wan and tagged with the cells they
//! were read from.

use crate::labels::normalize_label;
use crate::resolver::KeyResolver;
use crate::scale::{ScaleDecision, ScaleDetector};
use crate::schema::{CandidateSource, CandidateValue, CellRef, FactKey, RawTable, SourceReference};
use crate::three_public::extract_three_public;
use crate::utils::{is_category_code, parse_cell_number, round_canonical};
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    #[schemars(description = "收支总表: revenue and expenditure totals")]
    SummaryTotals,
    #[schemars(description = "收入总表: revenue itemized by functional category")]
    IncomeItemized,
    #[schemars(description = "支出总表: expenditure itemized by functional category")]
    ExpenditureItemized,
    #[schemars(description = "财政拨款收支总表: fiscal-grant revenue and expenditure totals")]
    FiscalGrantSummary,
    #[schemars(description = "“三公”经费表: the three public expenses")]
    ThreePublic,
    Unknown,
}

impl TableKind {
    /// Maps the extractor's table tag; anything unrecognized is `Unknown`.
    pub fn from_table_key(table_key: &str) -> Self {
        match table_key.trim().to_ascii_lowercase().as_str() {
            "summary" | "summary_totals" | "budget_summary" => TableKind::SummaryTotals,
            "income" | "income_itemized" | "budget_income" => TableKind::IncomeItemized,
            "expenditure" | "expenditure_itemized" | "budget_expenditure" => {
                TableKind::ExpenditureItemized
            }
            "fiscal_grant" | "fiscal_grant_summary" => TableKind::FiscalGrantSummary,
            "three_public" | "three_public_expenses" => TableKind::ThreePublic,
            _ => TableKind::Unknown,
        }
    }
}

/// Title fragments checked in order against a table's leading rows. First
/// match wins: "财政拨款收支总表" also contains "收支总表", so the fiscal-grant
/// entry must come before the summary entry.
const TITLE_MARKERS: &[(TableKind, &[&str])] = &[
    (TableKind::ThreePublic, &["三公"]),
    (TableKind::FiscalGrantSummary, &["财政拨款收支总表", "财政拨款收支预算总表"]),
    (TableKind::SummaryTotals, &["收支总表", "收支预算总表"]),
    (TableKind::IncomeItemized, &["收入总表", "收入预算表"]),
    (TableKind::ExpenditureItemized, &["支出总表", "支出预算表"]),
];

const TITLE_SCAN_ROWS: usize = 3;

/// Title first, then the table's own content.
pub fn detect_table_kind(rows: &[Vec<String>]) -> TableKind {
    let title: String = rows
        .iter()
        .take(TITLE_SCAN_ROWS)
        .flat_map(|row| row.iter())
        .map(|cell| normalize_label(cell))
        .collect();

    TITLE_MARKERS
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| title.contains(m)))
        .map(|(kind, _)| *kind)
        .unwrap_or_else(|| detect_kind_from_content(rows))
}

const THREE_PUBLIC_HEADER_MARKERS: &[&str] = &["因公出国", "公务接待", "公务用车"];
const EXPENDITURE_HEADER_MARKERS: &[&str] = &["基本支出", "项目支出"];
const INCOME_HEADER_MARKERS: &[&str] = &["财政拨款收入", "事业收入", "其他收入"];

/// Shape inference for untitled tables: labelled totals with a value beside
/// them, three-public column headers, or category rows under an income or
/// expenditure header.
fn detect_kind_from_content(rows: &[Vec<String>]) -> TableKind {
    let has_marker = |specs: &[MarkerSpec], first_only: bool| {
        specs.iter().any(|(_, markers)| {
            let markers = if first_only { &markers[..1] } else { *markers };
            markers.iter().any(|m| find_marker(rows, m).is_some())
        })
    };

    // Only the explicit fiscal-grant labels; the generic ones are shared with
    // the summary table.
    if has_marker(FISCAL_GRANT_MARKERS, true) {
        return TableKind::FiscalGrantSummary;
    }
    if has_marker(SUMMARY_MARKERS, false) {
        return TableKind::SummaryTotals;
    }

    let text: String = rows
        .iter()
        .flat_map(|row| row.iter())
        .map(|cell| normalize_label(cell))
        .collect();
    if THREE_PUBLIC_HEADER_MARKERS.iter().all(|m| text.contains(m)) {
        return TableKind::ThreePublic;
    }

    if rows.iter().any(|row| is_category_row(row)) {
        if EXPENDITURE_HEADER_MARKERS.iter().any(|m| text.contains(m)) {
            return TableKind::ExpenditureItemized;
        }
        if INCOME_HEADER_MARKERS.iter().any(|m| text.contains(m)) {
            return TableKind::IncomeItemized;
        }
    }

    TableKind::Unknown
}

/// Output of extracting a single table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub table_key: String,
    pub kind: TableKind,
    pub scale: ScaleDecision,
    pub candidates: Vec<CandidateValue>,
}

/// Context shared by the per-shape extraction functions.
pub(crate) struct TableView<'a> {
    pub table: &'a RawTable,
    pub scale: &'a ScaleDecision,
}

impl TableView<'_> {
    pub fn candidate(&self, key: FactKey, label: &str, raw_value: f64, cells: Vec<CellRef>) -> CandidateValue {
        CandidateValue {
            key,
            raw_label: label.trim().to_string(),
            numeric_value: round_canonical(self.scale.apply(raw_value)),
            source: CandidateSource::StructuredTable,
            source_reference: SourceReference {
                table_key: Some(self.table.table_key.clone()),
                page: self.table.page,
                cells,
                label: Some(label.trim().to_string()),
                note: None,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableExtractor {
    resolver: KeyResolver,
    detector: ScaleDetector,
}

impl TableExtractor {
    pub fn new(resolver: KeyResolver, detector: ScaleDetector) -> Self {
        Self { resolver, detector }
    }

    pub fn extract(&self, table: &RawTable) -> ExtractedTable {
        let mut kind = TableKind::from_table_key(&table.table_key);
        if kind == TableKind::Unknown {
            kind = detect_table_kind(&table.rows);
        }

        let scale = self.detector.detect(&table.rows, kind);
        let view = TableView {
            table,
            scale: &scale,
        };

        let candidates = match kind {
            TableKind::SummaryTotals => extract_summary_totals(&view, &self.resolver),
            TableKind::IncomeItemized => extract_itemized(&view, INCOME_COLUMNS),
            TableKind::ExpenditureItemized => extract_itemized(&view, EXPENDITURE_COLUMNS),
            TableKind::FiscalGrantSummary => extract_by_markers(&view, FISCAL_GRANT_MARKERS),
            TableKind::ThreePublic => extract_three_public(&view),
            TableKind::Unknown => {
                warn!(
                    "Table '{}' has no recognizable shape, skipping",
                    table.table_key
                );
                Vec::new()
            }
        };

        info!(
            "Extracted {} candidates from table '{}' ({:?}, unit {:?})",
            candidates.len(),
            table.table_key,
            kind,
            scale.unit
        );

        ExtractedTable {
            table_key: table.table_key.clone(),
            kind,
            scale,
            candidates,
        }
    }

    pub fn extract_all(&self, tables: &[RawTable]) -> Vec<ExtractedTable> {
        tables.iter().map(|t| self.extract(t)).collect()
    }
}

impl Default for TableExtractor {
    fn default() -> Self {
        Self::new(KeyResolver::default(), ScaleDetector::default())
    }
}

/// Key plus label fragments, tried in order; the first fragment found in any
/// cell of the table wins for that key.
type MarkerSpec = (FactKey, &'static [&'static str]);

const SUMMARY_MARKERS: &[MarkerSpec] = &[
    (FactKey::BudgetRevenueTotal, &["本年收入合计", "收入合计", "收入总计"]),
    (FactKey::BudgetExpenditureTotal, &["本年支出合计", "支出合计", "支出总计"]),
];

const FISCAL_GRANT_MARKERS: &[MarkerSpec] = &[
    (
        FactKey::FiscalGrantRevenueTotal,
        &["财政拨款收入合计", "本年收入合计", "收入合计", "收入总计"],
    ),
    (
        FactKey::FiscalGrantExpenditureTotal,
        &["财政拨款支出合计", "本年支出合计", "支出合计", "支出总计"],
    ),
];

/// Component keys the summary table may list under their own labels.
const SUMMARY_COMPONENT_KEYS: &[FactKey] = &[
    FactKey::BudgetRevenueFiscal,
    FactKey::BudgetRevenueBusiness,
    FactKey::BudgetRevenueOperation,
    FactKey::BudgetRevenueOther,
    FactKey::BudgetExpenditureBasic,
    FactKey::BudgetExpenditureProject,
];

/// First numeric cell to the right of `col`.
fn value_right_of(row: &[String], col: usize) -> Option<(usize, f64)> {
    row.iter()
        .enumerate()
        .skip(col + 1)
        .find_map(|(idx, cell)| parse_cell_number(cell).map(|v| (idx, v)))
}

fn find_marker(rows: &[Vec<String>], marker: &str) -> Option<(usize, usize, f64)> {
    for (r, row) in rows.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            if parse_cell_number(cell).is_some() {
                continue;
            }
            if normalize_label(cell).contains(marker) {
                if let Some((value_col, value)) = value_right_of(row, c) {
                    return Some((r, value_col, value));
                }
            }
        }
    }
    None
}

pub(crate) fn extract_by_markers(view: &TableView<'_>, specs: &[MarkerSpec]) -> Vec<CandidateValue> {
    let rows = &view.table.rows;
    let mut out = Vec::new();

    for (key, markers) in specs {
        let hit = markers
            .iter()
            .find_map(|marker| find_marker(rows, marker).map(|hit| (*marker, hit)));

        match hit {
            Some((marker, (row, col, value))) => {
                let label = label_left_of(&rows[row], col).unwrap_or(marker);
                out.push(view.candidate(*key, label, value, vec![CellRef { row, col }]));
            }
            None => debug!(
                "No marker row for {} in table '{}'",
                key, view.table.table_key
            ),
        }
    }

    out
}

fn label_left_of(row: &[String], col: usize) -> Option<&str> {
    row[..col]
        .iter()
        .rev()
        .find(|cell| !cell.trim().is_empty() && parse_cell_number(cell).is_none())
        .map(|cell| cell.as_str())
}

fn extract_summary_totals(view: &TableView<'_>, resolver: &KeyResolver) -> Vec<CandidateValue> {
    let mut out = extract_by_markers(view, SUMMARY_MARKERS);

    let mut seen: Vec<FactKey> = out.iter().map(|c| c.key).collect();
    for (r, row) in view.table.rows.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            if cell.trim().is_empty() || parse_cell_number(cell).is_some() {
                continue;
            }
            let Some(key) = resolver.resolve(cell) else {
                continue;
            };
            if !SUMMARY_COMPONENT_KEYS.contains(&key) || seen.contains(&key) {
                continue;
            }
            if let Some((col, value)) = value_right_of(row, c) {
                seen.push(key);
                out.push(view.candidate(key, cell, value, vec![CellRef { row: r, col }]));
            }
        }
    }

    out
}

/// Fixed column index → key for category rows of an itemized table.
type ColumnSpec = (usize, FactKey);

const INCOME_COLUMNS: &[ColumnSpec] = &[
    (2, FactKey::BudgetRevenueTotal),
    (3, FactKey::BudgetRevenueFiscal),
    (4, FactKey::BudgetRevenueBusiness),
    (5, FactKey::BudgetRevenueOperation),
    (6, FactKey::BudgetRevenueOther),
];

const EXPENDITURE_COLUMNS: &[ColumnSpec] = &[
    (2, FactKey::BudgetExpenditureTotal),
    (3, FactKey::BudgetExpenditureBasic),
    (4, FactKey::BudgetExpenditureProject),
];

/// A top-level functional category row: three-digit code, then a name.
pub fn is_category_row(row: &[String]) -> bool {
    match (row.first(), row.get(1)) {
        (Some(code), Some(name)) => {
            is_category_code(code) && !name.trim().is_empty() && parse_cell_number(name).is_none()
        }
        _ => false,
    }
}

fn extract_itemized(view: &TableView<'_>, columns: &[ColumnSpec]) -> Vec<CandidateValue> {
    let rows = &view.table.rows;
    let category_rows: Vec<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, row)| is_category_row(row))
        .map(|(idx, _)| idx)
        .collect();

    if category_rows.is_empty() {
        debug!("No category rows in table '{}'", view.table.table_key);
        return Vec::new();
    }

    let mut sums: BTreeMap<FactKey, (f64, Vec<CellRef>)> = BTreeMap::new();
    for &r in &category_rows {
        for (col, key) in columns {
            if let Some(value) = rows[r].get(*col).and_then(|cell| parse_cell_number(cell)) {
                let entry = sums.entry(*key).or_insert_with(|| (0.0, Vec::new()));
                entry.0 += value;
                entry.1.push(CellRef { row: r, col: *col });
            }
        }
    }

    columns
        .iter()
        .filter_map(|(_, key)| {
            sums.remove(key).map(|(total, cells)| {
                let label = format!("{}（{}个类款合计）", crate::catalog::display_label(*key), cells.len());
                view.candidate(*key, &label, total, cells)
            })
        })
        .collect()
}
