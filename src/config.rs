use crate::catalog;
use crate::error::{FactEngineError, Result};
use crate::extraction::TableKind;
use crate::scale::CurrencyUnit;
use crate::schema::FactKey;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Top-level engine configuration, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    #[serde(default)]
    pub scale: ScaleConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub validation: ValidationConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("scale.magnitude_threshold", self.scale.magnitude_threshold),
            ("reconcile.agreement_tolerance", self.reconcile.agreement_tolerance),
            ("reconcile.scale_ratio", self.reconcile.scale_ratio),
            ("reconcile.scale_ratio_tolerance", self.reconcile.scale_ratio_tolerance),
            ("reconcile.inverse_ratio_tolerance", self.reconcile.inverse_ratio_tolerance),
            ("reconcile.anchor_ratio_band", self.reconcile.anchor_ratio_band),
            ("reconcile.magnitude_yuan_threshold", self.reconcile.magnitude_yuan_threshold),
            ("reconcile.small_amount_threshold", self.reconcile.small_amount_threshold),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(FactEngineError::InvalidConfig(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        if self.reconcile.anchor_ratio_band >= 1.0 {
            return Err(FactEngineError::InvalidConfig(
                "reconcile.anchor_ratio_band must be below 1.0".to_string(),
            ));
        }
        if self.scale.declared_scan_rows == 0 {
            return Err(FactEngineError::InvalidConfig(
                "scale.declared_scan_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(EngineConfig);
        serde_json::to_string_pretty(&schema)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ScaleConfig {
    #[schemars(description = "How many leading rows are searched for a '单位' declaration")]
    pub declared_scan_rows: usize,

    #[schemars(description = "How many numeric cells magnitude inference inspects")]
    pub magnitude_scan_cells: usize,

    #[schemars(description = "Largest absolute value at or above which undeclared tables are read as 元")]
    pub magnitude_threshold: f64,

    #[schemars(description = "Unit assumed when no declaration, table default or magnitude signal applies")]
    pub caller_default: CurrencyUnit,

    #[schemars(description = "Conventional unit per table kind when the document declares none")]
    pub table_defaults: BTreeMap<TableKind, CurrencyUnit>,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        let table_defaults = [
            TableKind::SummaryTotals,
            TableKind::IncomeItemized,
            TableKind::ExpenditureItemized,
            TableKind::FiscalGrantSummary,
        ]
        .into_iter()
        .map(|kind| (kind, CurrencyUnit::Wan))
        .collect();

        Self {
            declared_scan_rows: 20,
            magnitude_scan_cells: 80,
            magnitude_threshold: 100_000.0,
            caller_default: CurrencyUnit::Wan,
            table_defaults,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReconcileConfig {
    #[schemars(description = "Absolute difference in wan under which two sources agree")]
    pub agreement_tolerance: f64,

    #[schemars(description = "The unit-error factor between 元 and 万元")]
    pub scale_ratio: f64,

    #[schemars(description = "Allowed distance of a conflict ratio from scale_ratio")]
    pub scale_ratio_tolerance: f64,

    #[schemars(description = "Allowed distance of a conflict ratio from 1/scale_ratio")]
    pub inverse_ratio_tolerance: f64,

    #[schemars(description = "Relative band around scale_ratio within which a manual value is rescaled against its anchor")]
    pub anchor_ratio_band: f64,

    #[schemars(description = "Unlabelled manual values at or above this are read as 元")]
    pub magnitude_yuan_threshold: f64,

    #[schemars(description = "Small-amount keys at or above this (after scaling) are force-divided by scale_ratio")]
    pub small_amount_threshold: f64,

    pub anchors: BTreeMap<FactKey, FactKey>,

    pub small_amount_keys: BTreeSet<FactKey>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        let entries = catalog::all_entries();
        let anchors = entries
            .iter()
            .filter_map(|e| e.anchor.map(|anchor| (e.key, anchor)))
            .collect();
        let small_amount_keys = entries
            .iter()
            .filter(|e| e.small_amount)
            .map(|e| e.key)
            .collect();

        Self {
            agreement_tolerance: 0.01,
            scale_ratio: 10_000.0,
            scale_ratio_tolerance: 1.0,
            inverse_ratio_tolerance: 0.000_001,
            anchor_ratio_band: 0.5,
            magnitude_yuan_threshold: 10_000_000.0,
            small_amount_threshold: 1_000.0,
            anchors,
            small_amount_keys,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ValidationConfig {
    #[schemars(description = "Narrative field keys that must be filled before a draft can be generated")]
    pub required_manual_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.reconcile.anchors.get(&FactKey::BudgetRevenueFiscal),
            Some(&FactKey::FiscalGrantRevenueTotal)
        );
        assert!(config
            .reconcile
            .small_amount_keys
            .contains(&FactKey::ThreePublicVehicleOperation));
        assert_eq!(
            config.scale.table_defaults.get(&TableKind::ThreePublic),
            None
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "reconcile": { "agreement_tolerance": 0.05 }, "scale": { "caller_default": "yuan" } }"#,
        )
        .unwrap();
        assert_eq!(config.reconcile.agreement_tolerance, 0.05);
        assert_eq!(config.reconcile.scale_ratio, 10_000.0);
        assert_eq!(config.scale.caller_default, CurrencyUnit::Yuan);
        assert_eq!(config.scale.declared_scan_rows, 20);
        assert!(config.validation.required_manual_keys.is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "reconcile": { "scale_ratio": 0 } }"#);
        assert!(err.is_err());
        let err = EngineConfig::from_json_str(r#"{ "reconcile": { "anchor_ratio_band": 2.0 } }"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_schema_generation() {
        let schema = EngineConfig::schema_as_json().unwrap();
        assert!(schema.contains("agreement_tolerance"));
        assert!(schema.contains("table_defaults"));
    }
}
