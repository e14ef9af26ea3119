use crate::config::ScaleConfig;
use crate::extraction::TableKind;
use crate::utils::parse_cell_number;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const UNIT_MARKER: &str = "单位";

/// Currency units found in budget tables. Canonical facts are in `Wan`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyUnit {
    #[schemars(description = "万元, ten thousand yuan (canonical)")]
    Wan,
    #[schemars(description = "千元, one thousand yuan")]
    Qian,
    #[schemars(description = "元, yuan")]
    Yuan,
}

impl CurrencyUnit {
    pub fn multiplier(&self) -> f64 {
        match self {
            CurrencyUnit::Wan => 1.0,
            CurrencyUnit::Qian => 0.1,
            CurrencyUnit::Yuan => 0.0001,
        }
    }

    /// Converts a raw amount to wan. Divides rather than multiplies so whole
    /// yuan amounts convert without float residue.
    pub fn to_wan(&self, raw: f64) -> f64 {
        match self {
            CurrencyUnit::Wan => raw,
            CurrencyUnit::Qian => raw / 10.0,
            CurrencyUnit::Yuan => raw / 10_000.0,
        }
    }

    /// Reads a unit word out of free text; "万元" and "千元" take precedence
    /// over a bare "元".
    pub fn from_text(text: &str) -> Option<Self> {
        if text.contains("万元") {
            Some(CurrencyUnit::Wan)
        } else if text.contains("千元") {
            Some(CurrencyUnit::Qian)
        } else if text.contains('元') {
            Some(CurrencyUnit::Yuan)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScaleBasis {
    Declared,
    TableDefault,
    Magnitude,
    CallerDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ScaleDecision {
    pub unit: CurrencyUnit,
    pub basis: ScaleBasis,
    /// The declaration text when `basis` is `Declared`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declaration: Option<String>,
}

impl ScaleDecision {
    pub fn multiplier(&self) -> f64 {
        self.unit.multiplier()
    }

    pub fn apply(&self, raw: f64) -> f64 {
        self.unit.to_wan(raw)
    }
}

/// Determines which unit a table's numbers are written in.
#[derive(Debug, Clone, Default)]
pub struct ScaleDetector {
    config: ScaleConfig,
}

impl ScaleDetector {
    pub fn new(config: ScaleConfig) -> Self {
        Self { config }
    }

    /// Declared unit, then the table kind's conventional unit, then magnitude.
    pub fn detect(&self, rows: &[Vec<String>], kind: TableKind) -> ScaleDecision {
        if let Some((unit, declaration)) = self.declared_unit(rows) {
            debug!("Table {:?} declares unit {:?} ('{}')", kind, unit, declaration);
            return ScaleDecision {
                unit,
                basis: ScaleBasis::Declared,
                declaration: Some(declaration),
            };
        }

        if let Some(unit) = self.config.table_defaults.get(&kind) {
            debug!("Table {:?} has no declared unit, using default {:?}", kind, unit);
            return ScaleDecision {
                unit: *unit,
                basis: ScaleBasis::TableDefault,
                declaration: None,
            };
        }

        self.infer_from_magnitude(rows)
    }

    fn declared_unit(&self, rows: &[Vec<String>]) -> Option<(CurrencyUnit, String)> {
        for row in rows.iter().take(self.config.declared_scan_rows) {
            for (idx, cell) in row.iter().enumerate() {
                let Some(pos) = cell.rfind(UNIT_MARKER) else {
                    continue;
                };

                let tail = &cell[pos + UNIT_MARKER.len()..];
                if let Some(unit) = CurrencyUnit::from_text(tail) {
                    return Some((unit, cell.trim().to_string()));
                }

                // "单位" | "万元" split across cells
                let rest = row[idx + 1..].join(" ");
                if let Some(unit) = CurrencyUnit::from_text(&rest) {
                    return Some((unit, format!("{} {}", cell.trim(), rest.trim())));
                }
            }
        }
        None
    }

    fn infer_from_magnitude(&self, rows: &[Vec<String>]) -> ScaleDecision {
        let max_abs = rows
            .iter()
            .flat_map(|row| row.iter())
            .filter_map(|cell| parse_cell_number(cell))
            .take(self.config.magnitude_scan_cells)
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));

        if max_abs >= self.config.magnitude_threshold {
            debug!("Largest value {} suggests the table is in 元", max_abs);
            ScaleDecision {
                unit: CurrencyUnit::Yuan,
                basis: ScaleBasis::Magnitude,
                declaration: None,
            }
        } else {
            ScaleDecision {
                unit: self.config.caller_default,
                basis: ScaleBasis::CallerDefault,
                declaration: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_declared_yuan_converts_exactly() {
        let rows = grid(&[&["单位：元"], &["收入合计", "1000000"]]);
        let decision = ScaleDetector::default().detect(&rows, TableKind::SummaryTotals);
        assert_eq!(decision.basis, ScaleBasis::Declared);
        assert_eq!(decision.unit, CurrencyUnit::Yuan);
        assert_eq!(decision.multiplier(), 0.0001);
        assert_eq!(decision.apply(1_000_000.0), 100.0);
    }

    #[test]
    fn test_declared_units_take_precedence_over_defaults() {
        let detector = ScaleDetector::default();
        let wan = detector.detect(&grid(&[&["编制单位：某局", "金额单位：万元"]]), TableKind::Unknown);
        assert_eq!(wan.unit, CurrencyUnit::Wan);

        let qian = detector.detect(&grid(&[&["单位：千元"], &["合计", "500000"]]), TableKind::ThreePublic);
        assert_eq!(qian.unit, CurrencyUnit::Qian);
        assert_eq!(qian.multiplier(), 0.1);
        assert_eq!(qian.apply(1234.0), 123.4);
    }

    #[test]
    fn test_split_cell_declaration() {
        let rows = grid(&[&["单位", "元"], &["合计", "12"]]);
        let decision = ScaleDetector::default().detect(&rows, TableKind::SummaryTotals);
        assert_eq!(decision.basis, ScaleBasis::Declared);
        assert_eq!(decision.unit, CurrencyUnit::Yuan);
    }

    #[test]
    fn test_table_default_when_undeclared() {
        let rows = grid(&[&["收入合计", "5000000"]]);
        let decision = ScaleDetector::default().detect(&rows, TableKind::IncomeItemized);
        assert_eq!(decision.basis, ScaleBasis::TableDefault);
        assert_eq!(decision.unit, CurrencyUnit::Wan);
    }

    #[test]
    fn test_magnitude_inference() {
        let detector = ScaleDetector::default();
        let large = detector.detect(&grid(&[&["合计", "250000", "12"]]), TableKind::ThreePublic);
        assert_eq!(large.basis, ScaleBasis::Magnitude);
        assert_eq!(large.unit, CurrencyUnit::Yuan);

        let small = detector.detect(&grid(&[&["合计", "25.5", "12"]]), TableKind::ThreePublic);
        assert_eq!(small.basis, ScaleBasis::CallerDefault);
        assert_eq!(small.unit, CurrencyUnit::Wan);
    }

    #[test]
    fn test_caller_default_override() {
        let detector = ScaleDetector::new(ScaleConfig {
            caller_default: CurrencyUnit::Yuan,
            ..ScaleConfig::default()
        });
        let decision = detector.detect(&grid(&[&["合计", "80"]]), TableKind::Unknown);
        assert_eq!(decision.basis, ScaleBasis::CallerDefault);
        assert_eq!(decision.unit, CurrencyUnit::Yuan);
    }

    #[test]
    fn test_declaration_outside_scan_window_is_ignored() {
        let mut rows: Vec<Vec<String>> = (0..25).map(|i| vec![format!("行{}", i)]).collect();
        rows.push(vec!["单位：元".to_string()]);
        let decision = ScaleDetector::default().detect(&rows, TableKind::Unknown);
        assert_eq!(decision.basis, ScaleBasis::CallerDefault);
    }

    #[test]
    fn test_magnitude_scan_is_bounded() {
        let detector = ScaleDetector::new(ScaleConfig {
            magnitude_scan_cells: 2,
            ..ScaleConfig::default()
        });
        let rows = grid(&[&["1", "2", "900000"]]);
        let decision = detector.detect(&rows, TableKind::Unknown);
        assert_eq!(decision.basis, ScaleBasis::CallerDefault);
    }
}
