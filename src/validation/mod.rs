//! Rule-based validation of a reconciled fact set plus narrative inputs.
//!
//! Rules are plain values holding a function pointer. The engine resolves each
//! rule's effective level and tolerance from optional per-rule configuration,
//! runs every enabled rule and collects leveled issues. A FATAL count above
//! zero must block report generation; callers enforce that through
//! [`ValidationSummary::blocks_generation`].

pub mod rules;

use crate::error::{FactEngineError, Result};
use crate::schema::{Fact, FactKey, LineItem, ManualValue, SourceReference};
use log::{debug, error, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;

/// Anchor attached to issues produced when a rule itself fails.
pub const RULE_ERROR_ANCHOR: &str = "rule_error";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueLevel {
    #[schemars(description = "Blocks report generation")]
    Fatal,
    #[schemars(description = "Surfaced to the reviewer, does not block")]
    Warning,
    #[schemars(description = "Advisory only")]
    Suggest,
}

impl IssueLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueLevel::Fatal => "FATAL",
            IssueLevel::Warning => "WARNING",
            IssueLevel::Suggest => "SUGGEST",
        }
    }
}

impl fmt::Display for IssueLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueLevel {
    type Err = FactEngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FATAL" => Ok(IssueLevel::Fatal),
            "WARNING" => Ok(IssueLevel::Warning),
            "SUGGEST" => Ok(IssueLevel::Suggest),
            _ => Err(FactEngineError::UnknownIssueLevel(s.to_string())),
        }
    }
}

/// One thing an issue points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidenceRef {
    Fact {
        key: FactKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceReference>,
    },
    ManualField {
        key: String,
    },
    LineItem {
        code: String,
        name: String,
    },
}

impl EvidenceRef {
    /// Reference to a fact, carrying its value and source cells when present.
    pub fn fact(key: FactKey, fact: Option<&Fact>) -> Self {
        EvidenceRef::Fact {
            key,
            value: fact.map(|f| f.value),
            source: fact.map(|f| f.source_reference.clone()),
        }
    }

    pub fn manual_field(key: &str) -> Self {
        EvidenceRef::ManualField {
            key: key.to_string(),
        }
    }

    pub fn line_item(item: &LineItem) -> Self {
        EvidenceRef::LineItem {
            code: item.code.clone(),
            name: item.name.clone(),
        }
    }
}

/// A named anchor plus the references backing an issue. Never empty: at
/// minimum the anchor names what was checked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Evidence {
    pub anchor: String,
    #[serde(default)]
    pub refs: Vec<EvidenceRef>,
}

impl Evidence {
    pub fn new(anchor: impl Into<String>, refs: Vec<EvidenceRef>) -> Self {
        Self {
            anchor: anchor.into(),
            refs,
        }
    }

    pub fn mentions_fact(&self, key: FactKey) -> bool {
        self.refs
            .iter()
            .any(|r| matches!(r, EvidenceRef::Fact { key: k, .. } if *k == key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ValidationIssue {
    pub draft_id: String,
    pub level: IssueLevel,
    pub rule_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    pub evidence: Evidence,
}

/// Per-rule override loaded from the rule configuration store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct RuleConfig {
    pub rule_id: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub level_override: Option<IssueLevel>,
    #[serde(default)]
    #[schemars(description = "Rule-specific parameters, e.g. {\"tolerance\": 0.05}")]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl RuleConfig {
    pub fn new(rule_id: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            is_enabled: true,
            level_override: None,
            params: serde_json::Map::new(),
        }
    }

    pub fn disabled(rule_id: impl Into<String>) -> Self {
        Self {
            is_enabled: false,
            ..Self::new(rule_id)
        }
    }

    pub fn with_level(mut self, level: IssueLevel) -> Self {
        self.level_override = Some(level);
        self
    }

    pub fn with_param(mut self, name: &str, value: serde_json::Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }
}

/// Rule configs keyed by rule id. A missing entry means defaults.
pub type RuleConfigs = BTreeMap<String, RuleConfig>;

/// What a rule runs with after overrides are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub level: IssueLevel,
    pub tolerance: Option<f64>,
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl EffectiveConfig {
    pub fn resolve(rule: &Rule, config: Option<&RuleConfig>) -> Self {
        let params = config.map(|c| c.params.clone()).unwrap_or_default();
        let tolerance = params
            .get("tolerance")
            .and_then(|v| v.as_f64())
            .or(rule.default_tolerance);
        Self {
            level: config
                .and_then(|c| c.level_override)
                .unwrap_or(rule.default_level),
            tolerance,
            params,
        }
    }

    pub fn tolerance_or(&self, fallback: f64) -> f64 {
        self.tolerance.unwrap_or(fallback)
    }

    pub fn param_f64(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(|v| v.as_f64())
    }

    pub fn param_bool(&self, name: &str) -> Option<bool> {
        self.params.get(name).and_then(|v| v.as_bool())
    }

    pub fn param_strings(&self, name: &str) -> Option<Vec<String>> {
        let items = self.params.get(name)?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        )
    }

    pub fn param_string_map(&self, name: &str) -> Option<BTreeMap<String, String>> {
        let object = self.params.get(name)?.as_object()?;
        Some(
            object
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
        )
    }
}

/// Everything a rule may read.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub facts_by_key: BTreeMap<FactKey, Fact>,
    pub manual_inputs_by_key: BTreeMap<String, ManualValue>,
    pub line_items: Vec<LineItem>,
    pub required_manual_keys: Vec<String>,
}

impl RuleContext {
    pub fn new(
        facts: Vec<Fact>,
        manual_inputs_by_key: BTreeMap<String, ManualValue>,
        line_items: Vec<LineItem>,
        required_manual_keys: Vec<String>,
    ) -> Self {
        Self {
            facts_by_key: facts.into_iter().map(|f| (f.key, f)).collect(),
            manual_inputs_by_key,
            line_items,
            required_manual_keys,
        }
    }

    pub fn value(&self, key: FactKey) -> Option<f64> {
        self.facts_by_key.get(&key).map(|f| f.value)
    }

    pub fn fact_ref(&self, key: FactKey) -> EvidenceRef {
        EvidenceRef::fact(key, self.facts_by_key.get(&key))
    }
}

/// A rule's raw output. `level` is set only when the rule must force a level
/// regardless of configuration (e.g. a missing operand is always FATAL).
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub level: Option<IssueLevel>,
    pub message: String,
    pub evidence: Evidence,
}

impl Finding {
    pub fn new(message: impl Into<String>, evidence: Evidence) -> Self {
        Self {
            level: None,
            message: message.into(),
            evidence,
        }
    }

    pub fn forced(level: IssueLevel, message: impl Into<String>, evidence: Evidence) -> Self {
        Self {
            level: Some(level),
            message: message.into(),
            evidence,
        }
    }
}

pub type RuleFn = fn(&RuleContext, &EffectiveConfig) -> Vec<Finding>;

#[derive(Clone)]
pub struct Rule {
    pub id: &'static str,
    pub description: &'static str,
    pub default_level: IssueLevel,
    pub default_tolerance: Option<f64>,
    pub run: RuleFn,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("default_level", &self.default_level)
            .field("default_tolerance", &self.default_tolerance)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self {
            rules: rules::builtin_rules(),
        }
    }

    /// Adds a rule, replacing any registered rule with the same id.
    pub fn register(&mut self, rule: Rule) {
        self.rules.retain(|r| r.id != rule.id);
        self.rules.push(rule);
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ValidationSummary {
    pub fatal_count: usize,
    pub warning_count: usize,
    pub suggest_count: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationSummary {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let count = |level: IssueLevel| issues.iter().filter(|i| i.level == level).count();
        Self {
            fatal_count: count(IssueLevel::Fatal),
            warning_count: count(IssueLevel::Warning),
            suggest_count: count(IssueLevel::Suggest),
            issues,
        }
    }

    pub fn blocks_generation(&self) -> bool {
        self.fatal_count > 0
    }

    pub fn issues_for(&self, rule_id: &str) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.rule_id == rule_id).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ValidationEngine {
    registry: RuleRegistry,
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new(RuleRegistry::builtin())
    }
}

impl ValidationEngine {
    pub fn new(registry: RuleRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Runs every enabled rule. Rules are independent, so order only affects
    /// the order of the returned issues.
    pub fn validate(
        &self,
        draft_id: &str,
        context: &RuleContext,
        configs: &RuleConfigs,
    ) -> ValidationSummary {
        let mut issues = Vec::new();

        for rule in self.registry.rules() {
            let config = configs.get(rule.id);
            if config.is_some_and(|c| !c.is_enabled) {
                debug!("Rule {} disabled", rule.id);
                continue;
            }
            let effective = EffectiveConfig::resolve(rule, config);

            let findings = match catch_unwind(AssertUnwindSafe(|| (rule.run)(context, &effective))) {
                Ok(findings) => findings,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!("Rule {} failed: {}", rule.id, reason);
                    vec![Finding::new(
                        format!("Rule {} failed to evaluate: {}", rule.id, reason),
                        Evidence::new(RULE_ERROR_ANCHOR, Vec::new()),
                    )]
                }
            };

            issues.extend(findings.into_iter().map(|finding| ValidationIssue {
                draft_id: draft_id.to_string(),
                level: finding.level.unwrap_or(effective.level),
                rule_id: rule.id.to_string(),
                message: finding.message,
                tolerance: effective.tolerance,
                evidence: finding.evidence,
            }));
        }

        let summary = ValidationSummary::from_issues(issues);
        info!(
            "Validated draft {}: {} fatal, {} warning, {} suggest",
            draft_id, summary.fatal_count, summary.warning_count, summary.suggest_count
        );
        summary
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
