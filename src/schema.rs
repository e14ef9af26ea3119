use crate::error::{FactEngineError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of canonical financial facts a filing can carry.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FactKey {
    #[schemars(description = "收入合计: total budget revenue of the unit")]
    BudgetRevenueTotal,

    #[schemars(description = "财政拨款收入: revenue granted from the general public budget")]
    BudgetRevenueFiscal,

    #[schemars(description = "事业收入: revenue from public-service activities")]
    BudgetRevenueBusiness,

    #[schemars(description = "事业单位经营收入: revenue from business operations of public institutions")]
    BudgetRevenueOperation,

    #[schemars(description = "其他收入: all remaining revenue")]
    BudgetRevenueOther,

    #[schemars(description = "支出合计: total budget expenditure of the unit")]
    BudgetExpenditureTotal,

    #[schemars(description = "基本支出: basic (staff and routine) expenditure")]
    BudgetExpenditureBasic,

    #[schemars(description = "项目支出: project expenditure")]
    BudgetExpenditureProject,

    #[schemars(description = "财政拨款收入合计 in the fiscal-grant summary table")]
    FiscalGrantRevenueTotal,

    #[schemars(description = "财政拨款支出合计 in the fiscal-grant summary table")]
    FiscalGrantExpenditureTotal,

    #[schemars(description = "“三公”经费合计: total of the three public expenses")]
    ThreePublicTotal,

    #[schemars(description = "因公出国（境）费: official outbound travel")]
    ThreePublicOutbound,

    #[schemars(description = "公务用车购置及运行费: official vehicles, purchase plus operation")]
    ThreePublicVehicleTotal,

    #[schemars(description = "公务用车购置费: official vehicle purchase")]
    ThreePublicVehiclePurchase,

    #[schemars(description = "公务用车运行费: official vehicle operation and maintenance")]
    ThreePublicVehicleOperation,

    #[schemars(description = "公务接待费: official reception")]
    ThreePublicReception,

    #[schemars(description = "机关运行经费: administrative operating funds")]
    OperationFund,
}

impl FactKey {
    pub const ALL: [FactKey; 17] = [
        FactKey::BudgetRevenueTotal,
        FactKey::BudgetRevenueFiscal,
        FactKey::BudgetRevenueBusiness,
        FactKey::BudgetRevenueOperation,
        FactKey::BudgetRevenueOther,
        FactKey::BudgetExpenditureTotal,
        FactKey::BudgetExpenditureBasic,
        FactKey::BudgetExpenditureProject,
        FactKey::FiscalGrantRevenueTotal,
        FactKey::FiscalGrantExpenditureTotal,
        FactKey::ThreePublicTotal,
        FactKey::ThreePublicOutbound,
        FactKey::ThreePublicVehicleTotal,
        FactKey::ThreePublicVehiclePurchase,
        FactKey::ThreePublicVehicleOperation,
        FactKey::ThreePublicReception,
        FactKey::OperationFund,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactKey::BudgetRevenueTotal => "budget_revenue_total",
            FactKey::BudgetRevenueFiscal => "budget_revenue_fiscal",
            FactKey::BudgetRevenueBusiness => "budget_revenue_business",
            FactKey::BudgetRevenueOperation => "budget_revenue_operation",
            FactKey::BudgetRevenueOther => "budget_revenue_other",
            FactKey::BudgetExpenditureTotal => "budget_expenditure_total",
            FactKey::BudgetExpenditureBasic => "budget_expenditure_basic",
            FactKey::BudgetExpenditureProject => "budget_expenditure_project",
            FactKey::FiscalGrantRevenueTotal => "fiscal_grant_revenue_total",
            FactKey::FiscalGrantExpenditureTotal => "fiscal_grant_expenditure_total",
            FactKey::ThreePublicTotal => "three_public_total",
            FactKey::ThreePublicOutbound => "three_public_outbound",
            FactKey::ThreePublicVehicleTotal => "three_public_vehicle_total",
            FactKey::ThreePublicVehiclePurchase => "three_public_vehicle_purchase",
            FactKey::ThreePublicVehicleOperation => "three_public_vehicle_operation",
            FactKey::ThreePublicReception => "three_public_reception",
            FactKey::OperationFund => "operation_fund",
        }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactKey {
    type Err = FactEngineError;

    fn from_str(s: &str) -> Result<Self> {
        FactKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| FactEngineError::UnknownFactKey(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[schemars(description = "预算: the budget filed before the fiscal year")]
    Budget,

    #[schemars(description = "决算: the final account filed after the fiscal year")]
    FinalAccount,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Budget => "budget",
            Stage::FinalAccount => "final_account",
        }
    }
}

impl FromStr for Stage {
    type Err = FactEngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "budget" => Ok(Stage::Budget),
            "final_account" => Ok(Stage::FinalAccount),
            other => Err(FactEngineError::UnknownStage(other.to_string())),
        }
    }
}

/// Identifies the single row set a reconciliation run writes into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct FactScope {
    pub unit_id: String,
    pub year: i32,
    pub stage: Stage,
}

impl FactScope {
    pub fn new(unit_id: impl Into<String>, year: i32, stage: Stage) -> Self {
        Self {
            unit_id: unit_id.into(),
            year,
            stage,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_id.trim().is_empty() {
            return Err(FactEngineError::InvalidScope {
                unit_id: self.unit_id.clone(),
                year: self.year,
                details: "unit_id must not be blank".to_string(),
            });
        }
        if !(1900..=2999).contains(&self.year) {
            return Err(FactEngineError::InvalidScope {
                unit_id: self.unit_id.clone(),
                year: self.year,
                details: "year out of range".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceSource {
    #[schemars(description = "Table-shape-aware extraction from a document grid (trusted)")]
    StructuredTable,

    #[schemars(description = "Looser heuristic or assisted parsing of free text (fallback only)")]
    ManualParse,

    #[schemars(description = "A reviewer correction applied after reconciliation")]
    Correction,
}

impl ProvenanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvenanceSource::StructuredTable => "structured_table",
            ProvenanceSource::ManualParse => "manual_parse",
            ProvenanceSource::Correction => "correction",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "structured_table" => ProvenanceSource::StructuredTable,
            "correction" => ProvenanceSource::Correction,
            _ => ProvenanceSource::ManualParse,
        }
    }
}

/// A zero-based (row, column) position inside a table grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

/// Pointer from a value back to where it was read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct SourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<CellRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "The raw label the value was found under")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Free-form reviewer note; metadata only, never changes the value")]
    pub note: Option<String>,
}

impl SourceReference {
    pub fn cell(table_key: &str, page: Option<u32>, row: usize, col: usize, label: &str) -> Self {
        Self {
            table_key: Some(table_key.to_string()),
            page,
            cells: vec![CellRef { row, col }],
            label: Some(label.to_string()),
            note: None,
        }
    }
}

/// A table grid as produced by the external document-to-table extractor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RawTable {
    #[schemars(description = "Best-effort table classification from the extractor, possibly 'unknown'")]
    pub table_key: String,

    #[serde(default)]
    pub page: Option<u32>,

    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(table_key: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            table_key: table_key.into(),
            page: None,
            rows,
        }
    }
}

/// A raw `{label, numeric_value}` pair from the manual parsing channel.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ManualRow {
    pub label: String,
    pub value: f64,
}

impl ManualRow {
    pub fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    StructuredTable,
    ManualParse,
}

impl From<CandidateSource> for ProvenanceSource {
    fn from(source: CandidateSource) -> Self {
        match source {
            CandidateSource::StructuredTable => ProvenanceSource::StructuredTable,
            CandidateSource::ManualParse => ProvenanceSource::ManualParse,
        }
    }
}

/// An unreconciled value competing to become a fact.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CandidateValue {
    pub key: FactKey,
    pub raw_label: String,
    pub numeric_value: f64,
    pub source: CandidateSource,
    #[serde(default)]
    pub source_reference: SourceReference,
}

/// A canonical fact row. `value` is always in wan.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Fact {
    pub unit_id: String,
    pub year: i32,
    pub stage: Stage,
    pub key: FactKey,
    pub value: f64,
    #[serde(default)]
    pub is_locked: bool,
    pub provenance: ProvenanceSource,
    #[serde(default)]
    pub source_reference: SourceReference,
}

impl Fact {
    pub fn scope(&self) -> FactScope {
        FactScope::new(self.unit_id.clone(), self.year, self.stage)
    }
}

/// Narrative input value as typed by a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ManualValue {
    Number(f64),
    Text(String),
    Structured(serde_json::Value),
}

impl ManualValue {
    /// Non-blank text, a finite number, or a non-empty structured value.
    pub fn is_filled(&self) -> bool {
        match self {
            ManualValue::Text(text) => !text.trim().is_empty(),
            ManualValue::Number(n) => n.is_finite(),
            ManualValue::Structured(value) => match value {
                serde_json::Value::Null => false,
                serde_json::Value::String(s) => !s.trim().is_empty(),
                serde_json::Value::Array(items) => !items.is_empty(),
                serde_json::Value::Object(map) => !map.is_empty(),
                serde_json::Value::Number(n) => n.as_f64().is_some_and(f64::is_finite),
                serde_json::Value::Bool(_) => true,
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ManualValue::Text(text) => Some(text.as_str()),
            ManualValue::Structured(serde_json::Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// One itemized entry with its year-over-year comparison.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LineItem {
    pub code: String,
    pub name: String,
    pub current_amount: f64,
    #[serde(default)]
    pub prior_amount: Option<f64>,
    #[serde(default)]
    pub reason_text: Option<String>,
    #[serde(default)]
    #[schemars(description = "True when the reason text was generated by a template rather than written by a person")]
    pub reason_is_auto: bool,
}

/// The filing being validated.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Draft {
    pub draft_id: String,
    pub unit_id: String,
    pub year: i32,
    pub stage: Stage,
}

impl Draft {
    pub fn scope(&self) -> FactScope {
        FactScope::new(self.unit_id.clone(), self.year, self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fact_key_round_trips_through_str() {
        for key in FactKey::ALL {
            assert_eq!(key.as_str().parse::<FactKey>().unwrap(), key);
        }
        assert!("budget_revenue".parse::<FactKey>().is_err());
    }

    #[test]
    fn test_fact_key_serde_matches_as_str() {
        let json = serde_json::to_string(&FactKey::ThreePublicVehicleOperation).unwrap();
        assert_eq!(json, "\"three_public_vehicle_operation\"");
    }

    #[test]
    fn test_manual_value_filled() {
        assert!(!ManualValue::Text("   ".to_string()).is_filled());
        assert!(ManualValue::Text("说明".to_string()).is_filled());
        assert!(ManualValue::Number(0.0).is_filled());
        assert!(!ManualValue::Number(f64::NAN).is_filled());
        assert!(!ManualValue::Structured(serde_json::json!([])).is_filled());
        assert!(ManualValue::Structured(serde_json::json!({"a": 1})).is_filled());
        assert!(!ManualValue::Structured(serde_json::Value::Null).is_filled());
    }

    #[test]
    fn test_scope_validation() {
        assert!(FactScope::new("U001", 2024, Stage::Budget).validate().is_ok());
        assert!(FactScope::new("  ", 2024, Stage::Budget).validate().is_err());
        assert!(FactScope::new("U001", 24, Stage::Budget).validate().is_err());
    }
}
