use crate::resolver::KeyResolver;
use crate::schema::{CandidateSource, CandidateValue, ManualRow, SourceReference};
use crate::utils::round_canonical;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A manual row whose label resolved to no fact key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnmatchedLabel {
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualIngestion {
    pub candidates: Vec<CandidateValue>,
    pub unmatched: Vec<UnmatchedLabel>,
}

/// Resolves raw manual rows into manual candidates.
///
/// Values pass through unscaled: manual rows carry no table context, so unit
/// normalization happens during reconciliation. Non-finite values are
/// dropped. Rows keep their input order.
pub fn resolve_manual_rows(resolver: &KeyResolver, rows: &[ManualRow]) -> ManualIngestion {
    let mut out = ManualIngestion::default();

    for (idx, row) in rows.iter().enumerate() {
        if !row.value.is_finite() {
            debug!("Manual row {} ('{}') has no finite value, skipping", idx, row.label);
            continue;
        }

        match resolver.resolve(&row.label) {
            Some(key) => out.candidates.push(CandidateValue {
                key,
                raw_label: row.label.trim().to_string(),
                numeric_value: round_canonical(row.value),
                source: CandidateSource::ManualParse,
                source_reference: SourceReference {
                    label: Some(row.label.trim().to_string()),
                    note: Some(format!("manual row {}", idx)),
                    ..SourceReference::default()
                },
            }),
            None => out.unmatched.push(UnmatchedLabel {
                label: row.label.clone(),
                value: row.value,
            }),
        }
    }

    out
}

/// Reads manual rows from the JSON array the manual extractor emits.
pub fn manual_rows_from_json(json: &str) -> crate::error::Result<Vec<ManualRow>> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FactKey;

    #[test]
    fn test_resolves_and_collects_unmatched() {
        let rows = vec![
            ManualRow::new("收入合计", 100.0),
            ManualRow::new("政府采购预算", 12.0),
            ManualRow::new("公务接待费", 3.5),
        ];
        let out = resolve_manual_rows(&KeyResolver::default(), &rows);

        let keys: Vec<FactKey> = out.candidates.iter().map(|c| c.key).collect();
        assert_eq!(keys, vec![FactKey::BudgetRevenueTotal, FactKey::ThreePublicReception]);
        assert!(out
            .candidates
            .iter()
            .all(|c| c.source == CandidateSource::ManualParse));
        assert_eq!(
            out.unmatched,
            vec![UnmatchedLabel {
                label: "政府采购预算".to_string(),
                value: 12.0
            }]
        );
    }

    #[test]
    fn test_non_finite_rows_are_dropped() {
        let rows = vec![ManualRow::new("收入合计", f64::NAN)];
        let out = resolve_manual_rows(&KeyResolver::default(), &rows);
        assert!(out.candidates.is_empty());
        assert!(out.unmatched.is_empty());
    }

    #[test]
    fn test_rows_from_json() {
        let rows = manual_rows_from_json(r#"[{"label": "支出合计", "value": 900000}]"#).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 900000.0);
        assert!(manual_rows_from_json("{").is_err());
    }
}
