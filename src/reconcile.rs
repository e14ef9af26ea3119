//! Merging structured and manual candidates into one canonical fact set.
//!
//! Structured extraction is trusted: it always wins a disagreement. Manual
//! candidates only fill keys the tables did not provide, after their scale has
//! been normalized. Every disagreement and every rescaling decision is
//! returned as an audit entry; none of them fail the run.

use crate::config::ReconcileConfig;
use crate::scale::CurrencyUnit;
use crate::schema::{
    CandidateSource, CandidateValue, Fact, FactKey, FactScope, ProvenanceSource,
};
use crate::utils::{round_canonical, within_tolerance};
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    #[schemars(description = "Manual value differs from the structured one by the 元/万元 factor")]
    ScaleMismatch,
    #[schemars(description = "Manual value differs from the structured one; structured kept")]
    AutoFactProtected,
    #[schemars(description = "Two structured tables disagree; the first one read is kept")]
    StructuredDisagreement,
    #[schemars(description = "Two manual rows disagree after scaling; the first one is kept")]
    ManualDisagreement,
}

/// An unresolved disagreement between two candidates for one key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Conflict {
    pub key: FactKey,
    pub kind: ConflictKind,
    pub kept_value: f64,
    pub kept_source: CandidateSource,
    pub rejected_value: f64,
    pub rejected_source: CandidateSource,
    pub rejected_label: String,
    /// rejected / kept, when kept is non-zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScaleReason {
    #[schemars(description = "About scale_ratio times the anchor value; divided by scale_ratio")]
    AnchorRatio,
    #[schemars(description = "About 1/scale_ratio of the anchor value; multiplied by scale_ratio")]
    AnchorRatioInverse,
    LabelWan,
    LabelQian,
    LabelYuan,
    #[schemars(description = "Unlabelled and at least magnitude_yuan_threshold; read as 元")]
    MagnitudeYuan,
    #[schemars(description = "No signal; the value is taken as already in 万元")]
    AssumedCanonical,
    #[schemars(description = "A small-amount key still too large after scaling; divided by scale_ratio")]
    SmallAmountGuard,
}

/// How one manual value was brought to canonical units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ScaleNormalization {
    pub key: FactKey,
    pub raw_label: String,
    pub raw_value: f64,
    pub normalized_value: f64,
    pub reasons: Vec<ScaleReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<FactKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Accepted facts in `FactKey::ALL` order.
    pub facts: Vec<Fact>,
    pub conflicts: Vec<Conflict>,
    pub scale_decisions: Vec<ScaleNormalization>,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Merges candidates for one scope. `history` supplies known values (and
    /// nothing else) for anchor-based scale inference.
    pub fn reconcile(
        &self,
        scope: &FactScope,
        structured: &[CandidateValue],
        manual: &[CandidateValue],
        history: &[Fact],
    ) -> Reconciliation {
        let mut out = Reconciliation::default();

        // 1. Structured candidates: first per key wins
        let mut trusted: BTreeMap<FactKey, &CandidateValue> = BTreeMap::new();
        for candidate in structured {
            match trusted.get(&candidate.key) {
                None => {
                    trusted.insert(candidate.key, candidate);
                }
                Some(kept) => {
                    if !self.agrees(kept.numeric_value, candidate.numeric_value) {
                        out.conflicts.push(self.conflict(
                            ConflictKind::StructuredDisagreement,
                            kept,
                            candidate,
                        ));
                    }
                }
            }
        }

        let known: BTreeMap<FactKey, f64> = history
            .iter()
            .map(|f| (f.key, f.value))
            .chain(trusted.iter().map(|(k, c)| (*k, c.numeric_value)))
            .collect();

        // 2. Manual candidates: checked against structured, else normalized
        let mut fallback: BTreeMap<FactKey, (f64, &CandidateValue)> = BTreeMap::new();
        for candidate in manual {
            if let Some(kept) = trusted.get(&candidate.key) {
                if self.agrees(kept.numeric_value, candidate.numeric_value) {
                    debug!("Manual {} agrees with structured value, dropped", candidate.key);
                    continue;
                }
                let kind = if self.is_scale_error(kept.numeric_value, candidate.numeric_value) {
                    ConflictKind::ScaleMismatch
                } else {
                    ConflictKind::AutoFactProtected
                };
                warn!(
                    "Manual {} = {} disagrees with structured {} ({:?}), structured kept",
                    candidate.key, candidate.numeric_value, kept.numeric_value, kind
                );
                out.conflicts.push(self.conflict(kind, kept, candidate));
                continue;
            }

            let normalization = self.normalize_scale(candidate, &known);
            let value = normalization.normalized_value;
            out.scale_decisions.push(normalization);

            match fallback.get(&candidate.key) {
                None => {
                    fallback.insert(candidate.key, (value, candidate));
                }
                Some((kept_value, kept)) => {
                    if !self.agrees(*kept_value, value) {
                        out.conflicts.push(Conflict {
                            key: candidate.key,
                            kind: ConflictKind::ManualDisagreement,
                            kept_value: *kept_value,
                            kept_source: kept.source,
                            rejected_value: value,
                            rejected_source: candidate.source,
                            rejected_label: candidate.raw_label.clone(),
                            ratio: ratio_of(value, *kept_value),
                        });
                    }
                }
            }
        }

        // 3. Emit facts in catalog order
        for key in FactKey::ALL {
            let picked = trusted
                .get(&key)
                .map(|c| (c.numeric_value, *c))
                .or_else(|| fallback.get(&key).map(|(v, c)| (*v, *c)));
            if let Some((value, candidate)) = picked {
                out.facts.push(Fact {
                    unit_id: scope.unit_id.clone(),
                    year: scope.year,
                    stage: scope.stage,
                    key,
                    value: round_canonical(value),
                    is_locked: false,
                    provenance: ProvenanceSource::from(candidate.source),
                    source_reference: candidate.source_reference.clone(),
                });
            }
        }

        info!(
            "Reconciled {}/{} {}: {} facts, {} conflicts, {} scale decisions",
            scope.unit_id,
            scope.year,
            scope.stage.as_str(),
            out.facts.len(),
            out.conflicts.len(),
            out.scale_decisions.len()
        );

        out
    }

    fn agrees(&self, a: f64, b: f64) -> bool {
        within_tolerance(a, b, self.config.agreement_tolerance)
    }

    /// True when `rejected / kept` is close to the scale factor or its inverse.
    pub fn is_scale_error(&self, kept: f64, rejected: f64) -> bool {
        let Some(ratio) = ratio_of(rejected, kept) else {
            return false;
        };
        let factor = self.config.scale_ratio;
        (ratio - factor).abs() <= self.config.scale_ratio_tolerance
            || (ratio - 1.0 / factor).abs() <= self.config.inverse_ratio_tolerance
    }

    fn conflict(&self, kind: ConflictKind, kept: &CandidateValue, rejected: &CandidateValue) -> Conflict {
        Conflict {
            key: rejected.key,
            kind,
            kept_value: kept.numeric_value,
            kept_source: kept.source,
            rejected_value: rejected.numeric_value,
            rejected_source: rejected.source,
            rejected_label: rejected.raw_label.clone(),
            ratio: ratio_of(rejected.numeric_value, kept.numeric_value),
        }
    }

    /// Brings a manual-only value to wan. Anchor ratio first, then the label's
    /// unit word or raw magnitude, then the small-amount guard.
    pub fn normalize_scale(
        &self,
        candidate: &CandidateValue,
        known: &BTreeMap<FactKey, f64>,
    ) -> ScaleNormalization {
        let raw = candidate.numeric_value;
        let factor = self.config.scale_ratio;
        let mut reasons = Vec::new();

        let anchor = self
            .config
            .anchors
            .get(&candidate.key)
            .copied()
            .filter(|anchor| known.get(anchor).is_some_and(|v| *v != 0.0));

        let anchored = anchor.and_then(|anchor_key| {
            let anchor_value = known.get(&anchor_key)?;
            let ratio = raw / anchor_value;
            let band = self.config.anchor_ratio_band;
            if ((ratio / factor) - 1.0).abs() <= band {
                Some((raw / factor, ScaleReason::AnchorRatio))
            } else if ((ratio * factor) - 1.0).abs() <= band {
                Some((raw * factor, ScaleReason::AnchorRatioInverse))
            } else {
                None
            }
        });

        let mut value = match anchored {
            Some((value, reason)) => {
                reasons.push(reason);
                value
            }
            None => match CurrencyUnit::from_text(&candidate.raw_label) {
                Some(unit) => {
                    reasons.push(match unit {
                        CurrencyUnit::Wan => ScaleReason::LabelWan,
                        CurrencyUnit::Qian => ScaleReason::LabelQian,
                        CurrencyUnit::Yuan => ScaleReason::LabelYuan,
                    });
                    unit.to_wan(raw)
                }
                None if raw.abs() >= self.config.magnitude_yuan_threshold => {
                    reasons.push(ScaleReason::MagnitudeYuan);
                    raw / factor
                }
                None => {
                    reasons.push(ScaleReason::AssumedCanonical);
                    raw
                }
            },
        };

        if self.config.small_amount_keys.contains(&candidate.key)
            && value.abs() >= self.config.small_amount_threshold
        {
            reasons.push(ScaleReason::SmallAmountGuard);
            value /= factor;
        }

        ScaleNormalization {
            key: candidate.key,
            raw_label: candidate.raw_label.clone(),
            raw_value: raw,
            normalized_value: round_canonical(value),
            reasons,
            anchor: anchored.and(anchor),
        }
    }
}

fn ratio_of(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SourceReference, Stage};

    fn candidate(key: FactKey, label: &str, value: f64, source: CandidateSource) -> CandidateValue {
        CandidateValue {
            key,
            raw_label: label.to_string(),
            numeric_value: value,
            source,
            source_reference: SourceReference::default(),
        }
    }

    fn structured(key: FactKey, value: f64) -> CandidateValue {
        candidate(key, "表内", value, CandidateSource::StructuredTable)
    }

    fn manual(key: FactKey, label: &str, value: f64) -> CandidateValue {
        candidate(key, label, value, CandidateSource::ManualParse)
    }

    fn scope() -> FactScope {
        FactScope::new("U001", 2024, Stage::Budget)
    }

    fn value_of(out: &Reconciliation, key: FactKey) -> Option<f64> {
        out.facts.iter().find(|f| f.key == key).map(|f| f.value)
    }

    #[test]
    fn test_scale_mismatch_keeps_structured() {
        let out = Reconciler::default().reconcile(
            &scope(),
            &[structured(FactKey::BudgetRevenueFiscal, 90.0)],
            &[manual(FactKey::BudgetRevenueFiscal, "财政拨款收入", 900_000.0)],
            &[],
        );
        assert_eq!(value_of(&out, FactKey::BudgetRevenueFiscal), Some(90.0));
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].kind, ConflictKind::ScaleMismatch);
        assert_eq!(out.conflicts[0].ratio, Some(10_000.0));
        assert_eq!(out.facts[0].provenance, ProvenanceSource::StructuredTable);
    }

    #[test]
    fn test_agreeing_manual_value_is_dropped() {
        let out = Reconciler::default().reconcile(
            &scope(),
            &[structured(FactKey::BudgetRevenueTotal, 100.0)],
            &[manual(FactKey::BudgetRevenueTotal, "收入合计", 100.005)],
            &[],
        );
        assert!(out.conflicts.is_empty());
        assert!(out.scale_decisions.is_empty());
        assert_eq!(value_of(&out, FactKey::BudgetRevenueTotal), Some(100.0));
    }

    #[test]
    fn test_generic_disagreement_is_protected() {
        let out = Reconciler::default().reconcile(
            &scope(),
            &[structured(FactKey::BudgetRevenueTotal, 100.0)],
            &[manual(FactKey::BudgetRevenueTotal, "收入合计", 120.0)],
            &[],
        );
        assert_eq!(out.conflicts[0].kind, ConflictKind::AutoFactProtected);
        assert_eq!(value_of(&out, FactKey::BudgetRevenueTotal), Some(100.0));
    }

    #[test]
    fn test_inverse_scale_mismatch() {
        let reconciler = Reconciler::default();
        assert!(reconciler.is_scale_error(900_000.0, 90.0));
        assert!(!reconciler.is_scale_error(0.0, 90.0));
        assert!(!reconciler.is_scale_error(100.0, 99.0));
    }

    #[test]
    fn test_scale_ratio_tolerance_edges() {
        let reconciler = Reconciler::default();
        assert!(reconciler.is_scale_error(1.0, 10_000.9));
        assert!(reconciler.is_scale_error(1.0, 9_999.1));
        assert!(!reconciler.is_scale_error(1.0, 10_001.5));
        assert!(!reconciler.is_scale_error(1.0, 9_998.5));

        // inverse ratio 1e-4 with an absolute band of 1e-6
        assert!(reconciler.is_scale_error(10_000.0, 1.009));
        assert!(!reconciler.is_scale_error(10_000.0, 1.011));

        let out = reconciler.reconcile(
            &scope(),
            &[
                structured(FactKey::BudgetRevenueFiscal, 1.0),
                structured(FactKey::BudgetRevenueBusiness, 1.0),
            ],
            &[
                manual(FactKey::BudgetRevenueFiscal, "财政拨款收入", 10_000.9),
                manual(FactKey::BudgetRevenueBusiness, "事业收入", 10_001.5),
            ],
            &[],
        );
        let kind_of = |key: FactKey| out.conflicts.iter().find(|c| c.key == key).map(|c| c.kind);
        assert_eq!(kind_of(FactKey::BudgetRevenueFiscal), Some(ConflictKind::ScaleMismatch));
        assert_eq!(kind_of(FactKey::BudgetRevenueBusiness), Some(ConflictKind::AutoFactProtected));
        assert_eq!(value_of(&out, FactKey::BudgetRevenueBusiness), Some(1.0));
    }

    #[test]
    fn test_structured_duplicates_first_wins() {
        let out = Reconciler::default().reconcile(
            &scope(),
            &[
                structured(FactKey::BudgetExpenditureTotal, 100.0),
                structured(FactKey::BudgetExpenditureTotal, 100.0),
                structured(FactKey::BudgetExpenditureTotal, 98.0),
            ],
            &[],
            &[],
        );
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].kind, ConflictKind::StructuredDisagreement);
    }

    #[test]
    fn test_anchor_ratio_rescales_manual_only_key() {
        let out = Reconciler::default().reconcile(
            &scope(),
            &[structured(FactKey::FiscalGrantRevenueTotal, 90.0)],
            &[manual(FactKey::BudgetRevenueFiscal, "财政拨款收入", 880_000.0)],
            &[],
        );
        assert_eq!(value_of(&out, FactKey::BudgetRevenueFiscal), Some(88.0));
        let decision = &out.scale_decisions[0];
        assert_eq!(decision.reasons, vec![ScaleReason::AnchorRatio]);
        assert_eq!(decision.anchor, Some(FactKey::FiscalGrantRevenueTotal));
        assert_eq!(out.facts[0].key, FactKey::BudgetRevenueFiscal);
        assert_eq!(out.facts[0].provenance, ProvenanceSource::ManualParse);
    }

    #[test]
    fn test_anchor_from_history() {
        let history = vec![Fact {
            unit_id: "U001".to_string(),
            year: 2024,
            stage: Stage::Budget,
            key: FactKey::BudgetExpenditureTotal,
            value: 500.0,
            is_locked: true,
            provenance: ProvenanceSource::StructuredTable,
            source_reference: SourceReference::default(),
        }];
        let out = Reconciler::default().reconcile(
            &scope(),
            &[],
            &[manual(FactKey::BudgetRevenueTotal, "收入合计", 0.05)],
            &history,
        );
        assert_eq!(out.scale_decisions[0].reasons, vec![ScaleReason::AnchorRatioInverse]);
        assert_eq!(value_of(&out, FactKey::BudgetRevenueTotal), Some(500.0));
    }

    #[test]
    fn test_label_and_magnitude_inference() {
        let reconciler = Reconciler::default();
        let known = BTreeMap::new();

        let yuan = reconciler.normalize_scale(&manual(FactKey::BudgetRevenueOther, "其他收入（元）", 52_000.0), &known);
        assert_eq!(yuan.reasons, vec![ScaleReason::LabelYuan]);
        assert_eq!(yuan.normalized_value, 5.2);

        let wan = reconciler.normalize_scale(&manual(FactKey::BudgetRevenueOther, "其他收入（万元）", 52_000.0), &known);
        assert_eq!(wan.reasons, vec![ScaleReason::LabelWan]);
        assert_eq!(wan.normalized_value, 52_000.0);

        let qian = reconciler.normalize_scale(&manual(FactKey::BudgetRevenueOther, "其他收入（千元）", 520.0), &known);
        assert_eq!(qian.normalized_value, 52.0);

        let big = reconciler.normalize_scale(&manual(FactKey::BudgetRevenueOther, "其他收入", 12_000_000.0), &known);
        assert_eq!(big.reasons, vec![ScaleReason::MagnitudeYuan]);
        assert_eq!(big.normalized_value, 1_200.0);

        let plain = reconciler.normalize_scale(&manual(FactKey::BudgetRevenueOther, "其他收入", 12.0), &known);
        assert_eq!(plain.reasons, vec![ScaleReason::AssumedCanonical]);
    }

    #[test]
    fn test_small_amount_guard() {
        let reconciler = Reconciler::default();
        let known = BTreeMap::new();
        let guarded = reconciler.normalize_scale(
            &manual(FactKey::ThreePublicReception, "公务接待费", 35_000.0),
            &known,
        );
        assert_eq!(
            guarded.reasons,
            vec![ScaleReason::AssumedCanonical, ScaleReason::SmallAmountGuard]
        );
        assert_eq!(guarded.normalized_value, 3.5);

        // operation_fund is not a small-amount key
        let fund = reconciler.normalize_scale(&manual(FactKey::OperationFund, "机关运行经费", 35_000.0), &known);
        assert_eq!(fund.normalized_value, 35_000.0);
    }

    #[test]
    fn test_manual_duplicates_disagreeing() {
        let out = Reconciler::default().reconcile(
            &scope(),
            &[],
            &[
                manual(FactKey::BudgetRevenueOther, "其他收入", 12.0),
                manual(FactKey::BudgetRevenueOther, "其他收入（元）", 120_000.0),
                manual(FactKey::BudgetRevenueOther, "其他收入", 15.0),
            ],
            &[],
        );
        assert_eq!(value_of(&out, FactKey::BudgetRevenueOther), Some(12.0));
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].kind, ConflictKind::ManualDisagreement);
        assert_eq!(out.scale_decisions.len(), 3);
    }
}
