//! Extraction for the "three public expenses" (“三公”经费) table.
//!
//! Documents lay this table out in several ways. The data row is classified by
//! how many numeric cells it holds (2, 3, 6 or 7), and the header markers
//! "因公出国", "公务接待" and "机关运行经费" then pick the column layout for
//! that arity. Each arity has its own layout function.

use crate::catalog::display_label;
use crate::extraction::TableView;
use crate::labels::normalize_label;
use crate::schema::{CandidateValue, CellRef, FactKey};
use crate::utils::numeric_cells;
use log::debug;
use std::collections::BTreeMap;

use crate::schema::FactKey::{
    OperationFund as Fund, ThreePublicOutbound as Outbound, ThreePublicReception as Reception,
    ThreePublicTotal as Total, ThreePublicVehicleOperation as VehicleOperation,
    ThreePublicVehiclePurchase as VehiclePurchase, ThreePublicVehicleTotal as VehicleTotal,
};

const OUTBOUND_MARKER: &str = "因公出国";
const RECEPTION_MARKER: &str = "公务接待";
const FUND_MARKER: &str = "机关运行经费";
const VEHICLE_MARKER: &str = "公务用车";

/// (column index, raw value)
type Cell = (usize, f64);

/// A column layout: `None` marks a column that carries no fact.
pub type Layout = &'static [Option<FactKey>];

const TWO_TOTAL_AND_FUND: Layout = &[Some(Total), Some(Fund)];
const TWO_VEHICLE_SPLIT: Layout = &[Some(VehiclePurchase), Some(VehicleOperation)];

const THREE_ITEMS: Layout = &[Some(Outbound), Some(VehicleTotal), Some(Reception)];
const THREE_TOTAL_FIRST: Layout = &[Some(Total), Some(VehicleTotal), Some(Reception)];
const THREE_VEHICLE_BLOCK: Layout = &[Some(VehicleTotal), Some(VehiclePurchase), Some(VehicleOperation)];

const SIX_STANDARD: Layout = &[
    Some(Total),
    Some(Outbound),
    Some(VehicleTotal),
    Some(VehiclePurchase),
    Some(VehicleOperation),
    Some(Reception),
];
const SIX_WITHOUT_OUTBOUND: Layout = &[
    Some(Total),
    Some(VehicleTotal),
    Some(VehiclePurchase),
    Some(VehicleOperation),
    Some(Reception),
    Some(Fund),
];

const SEVEN_TRAILING_FUND: Layout = &[
    Some(Total),
    Some(Outbound),
    Some(VehicleTotal),
    Some(VehiclePurchase),
    Some(VehicleOperation),
    Some(Reception),
    Some(Fund),
];
const SEVEN_LEADING_FUND: Layout = &[
    Some(Fund),
    Some(Total),
    Some(Outbound),
    Some(VehicleTotal),
    Some(VehiclePurchase),
    Some(VehicleOperation),
    Some(Reception),
];
/// Seven numbers without a fund column: the first is a row sequence number.
const SEVEN_SEQUENCE_PREFIX: Layout = &[
    None,
    Some(Total),
    Some(Outbound),
    Some(VehicleTotal),
    Some(VehiclePurchase),
    Some(VehicleOperation),
    Some(Reception),
];

/// Which markers the header rows above the data row contain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderMarkers {
    pub outbound: bool,
    pub reception: bool,
    pub operation_fund: bool,
    /// The fund column is announced before the three-public columns.
    pub fund_leading: bool,
}

impl HeaderMarkers {
    pub fn from_header(header: &str) -> Self {
        let fund_pos = header.find(FUND_MARKER);
        let first_item_pos = [OUTBOUND_MARKER, VEHICLE_MARKER, RECEPTION_MARKER]
            .iter()
            .filter_map(|m| header.find(m))
            .min();

        Self {
            outbound: header.contains(OUTBOUND_MARKER),
            reception: header.contains(RECEPTION_MARKER),
            operation_fund: fund_pos.is_some(),
            fund_leading: matches!((fund_pos, first_item_pos), (Some(f), Some(i)) if f < i),
        }
    }
}

/// A data row tagged by its count of numeric cells.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreePublicRow {
    Two([Cell; 2]),
    Three([Cell; 3]),
    Six([Cell; 6]),
    Seven([Cell; 7]),
}

impl ThreePublicRow {
    pub fn from_cells(cells: &[Cell]) -> Option<Self> {
        match cells.len() {
            2 => cells.try_into().ok().map(ThreePublicRow::Two),
            3 => cells.try_into().ok().map(ThreePublicRow::Three),
            6 => cells.try_into().ok().map(ThreePublicRow::Six),
            7 => cells.try_into().ok().map(ThreePublicRow::Seven),
            _ => None,
        }
    }

    pub fn cells(&self) -> &[Cell] {
        match self {
            ThreePublicRow::Two(c) => c,
            ThreePublicRow::Three(c) => c,
            ThreePublicRow::Six(c) => c,
            ThreePublicRow::Seven(c) => c,
        }
    }

    pub fn layout(&self, markers: &HeaderMarkers) -> Layout {
        match self {
            ThreePublicRow::Two(_) => layout_two(markers),
            ThreePublicRow::Three(_) => layout_three(markers),
            ThreePublicRow::Six(_) => layout_six(markers),
            ThreePublicRow::Seven(_) => layout_seven(markers),
        }
    }
}

pub fn layout_two(markers: &HeaderMarkers) -> Layout {
    if markers.operation_fund {
        TWO_TOTAL_AND_FUND
    } else {
        TWO_VEHICLE_SPLIT
    }
}

pub fn layout_three(markers: &HeaderMarkers) -> Layout {
    if markers.outbound {
        THREE_ITEMS
    } else if markers.reception {
        THREE_TOTAL_FIRST
    } else {
        THREE_VEHICLE_BLOCK
    }
}

pub fn layout_six(markers: &HeaderMarkers) -> Layout {
    if !markers.outbound && markers.operation_fund {
        SIX_WITHOUT_OUTBOUND
    } else {
        SIX_STANDARD
    }
}

pub fn layout_seven(markers: &HeaderMarkers) -> Layout {
    match (markers.operation_fund, markers.fund_leading) {
        (true, true) => SEVEN_LEADING_FUND,
        (true, false) => SEVEN_TRAILING_FUND,
        (false, _) => SEVEN_SEQUENCE_PREFIX,
    }
}

fn row_text(row: &[String]) -> String {
    row.iter().map(|c| normalize_label(c)).collect()
}

/// The row holding the figures: the first supported-arity row labelled as a
/// total, otherwise the first supported-arity row.
fn find_data_row(rows: &[Vec<String>]) -> Option<(usize, ThreePublicRow)> {
    let candidates: Vec<(usize, ThreePublicRow)> = rows
        .iter()
        .enumerate()
        .filter_map(|(idx, row)| ThreePublicRow::from_cells(&numeric_cells(row)).map(|r| (idx, r)))
        .collect();

    let labelled_total = candidates.iter().position(|(idx, _)| {
        let text = row_text(&rows[*idx]);
        text.contains("合计") || text.contains("三公")
    });

    let pick = labelled_total.unwrap_or(0);
    candidates.into_iter().nth(pick)
}

pub(crate) fn extract_three_public(view: &TableView<'_>) -> Vec<CandidateValue> {
    let rows = &view.table.rows;
    let Some((data_row, row)) = find_data_row(rows) else {
        debug!(
            "No three-public data row with 2, 3, 6 or 7 numbers in '{}'",
            view.table.table_key
        );
        return Vec::new();
    };

    let header: String = rows[..data_row].iter().map(|r| row_text(r)).collect();
    let markers = HeaderMarkers::from_header(&header);
    let layout = row.layout(&markers);
    debug!(
        "Three-public row {} has {} numbers, markers {:?}",
        data_row,
        row.cells().len(),
        markers
    );

    let mut found: BTreeMap<FactKey, (f64, Vec<CellRef>, String)> = BTreeMap::new();
    for ((col, value), key) in row.cells().iter().zip(layout.iter()) {
        if let Some(key) = key {
            found.insert(
                *key,
                (
                    *value,
                    vec![CellRef { row: data_row, col: *col }],
                    display_label(*key).to_string(),
                ),
            );
        }
    }

    derive_missing_totals(&mut found);

    FactKey::ALL
        .iter()
        .filter_map(|key| {
            found
                .remove(key)
                .map(|(raw, cells, label)| view.candidate(*key, &label, raw, cells))
        })
        .collect()
}

/// Fills the vehicle subtotal and the overall total from their parts, only
/// when the table did not provide them.
fn derive_missing_totals(found: &mut BTreeMap<FactKey, (f64, Vec<CellRef>, String)>) {
    let sum_of = |found: &BTreeMap<FactKey, (f64, Vec<CellRef>, String)>, parts: &[FactKey]| {
        let mut total = 0.0;
        let mut cells = Vec::new();
        for part in parts {
            let (value, part_cells, _) = found.get(part)?;
            total += value;
            cells.extend(part_cells.iter().copied());
        }
        Some((total, cells))
    };

    if !found.contains_key(&VehicleTotal) {
        if let Some((total, cells)) = sum_of(found, &[VehiclePurchase, VehicleOperation]) {
            found.insert(
                VehicleTotal,
                (total, cells, "公务用车购置及运行费（购置费+运行费）".to_string()),
            );
        }
    }

    if !found.contains_key(&Total) {
        if let Some((total, cells)) =
            sum_of(found, &[Outbound, VehiclePurchase, VehicleOperation, Reception])
        {
            found.insert(
                Total,
                (total, cells, "“三公”经费合计（四项之和）".to_string()),
            );
        }
    }
}
