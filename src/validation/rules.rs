//! The builtin rule set.

use super::{EffectiveConfig, Evidence, EvidenceRef, Finding, IssueLevel, Rule, RuleContext};
use crate::catalog::display_label;
use crate::schema::FactKey;
use crate::utils::within_tolerance;
use log::warn;
use regex::Regex;
use std::sync::OnceLock;

const AMOUNT_TOLERANCE: f64 = 0.01;
const DEFAULT_CHANGE_THRESHOLD: f64 = 0.1;
const DEFAULT_MIN_NARRATIVE_CHARS: f64 = 15.0;

/// Narrative fields whose stated 万元 amounts are compared with a fact.
const DEFAULT_NARRATIVE_FIELDS: &[(&str, FactKey)] = &[
    ("revenue_explanation", FactKey::BudgetRevenueTotal),
    ("expenditure_explanation", FactKey::BudgetExpenditureTotal),
    ("fiscal_grant_explanation", FactKey::FiscalGrantExpenditureTotal),
    ("three_public_explanation", FactKey::ThreePublicTotal),
    ("operation_fund_explanation", FactKey::OperationFund),
];

pub fn builtin_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "balance_revenue_expenditure",
            description: "收入合计 must equal 支出合计",
            default_level: IssueLevel::Fatal,
            default_tolerance: Some(AMOUNT_TOLERANCE),
            run: balance_revenue_expenditure,
        },
        Rule {
            id: "balance_fiscal_grant",
            description: "财政拨款收入合计 must equal 财政拨款支出合计",
            default_level: IssueLevel::Fatal,
            default_tolerance: Some(AMOUNT_TOLERANCE),
            run: balance_fiscal_grant,
        },
        Rule {
            id: "composition_revenue_total",
            description: "收入合计 equals the sum of its revenue sources",
            default_level: IssueLevel::Warning,
            default_tolerance: Some(AMOUNT_TOLERANCE),
            run: composition_revenue_total,
        },
        Rule {
            id: "composition_expenditure_total",
            description: "支出合计 equals 基本支出 plus 项目支出",
            default_level: IssueLevel::Fatal,
            default_tolerance: Some(AMOUNT_TOLERANCE),
            run: composition_expenditure_total,
        },
        Rule {
            id: "composition_three_public_total",
            description: "“三公”经费合计 equals outbound plus vehicles plus reception",
            default_level: IssueLevel::Fatal,
            default_tolerance: Some(AMOUNT_TOLERANCE),
            run: composition_three_public_total,
        },
        Rule {
            id: "composition_vehicle_total",
            description: "公务用车购置及运行费 equals purchase plus operation",
            default_level: IssueLevel::Fatal,
            default_tolerance: Some(AMOUNT_TOLERANCE),
            run: composition_vehicle_total,
        },
        Rule {
            id: "required_manual_fields",
            description: "Every required narrative field is filled",
            default_level: IssueLevel::Fatal,
            default_tolerance: None,
            run: required_manual_fields,
        },
        Rule {
            id: "required_facts",
            description: "Every fact key listed in params.keys is present",
            default_level: IssueLevel::Fatal,
            default_tolerance: None,
            run: required_facts,
        },
        Rule {
            id: "narrative_number_consistency",
            description: "Amounts stated in narrative text match the facts",
            default_level: IssueLevel::Warning,
            default_tolerance: Some(AMOUNT_TOLERANCE),
            run: narrative_number_consistency,
        },
        Rule {
            id: "placeholder_tokens",
            description: "No unfinished placeholder text remains",
            default_level: IssueLevel::Fatal,
            default_tolerance: None,
            run: placeholder_tokens,
        },
        Rule {
            id: "change_disclosure",
            description: "Large year-over-year changes carry a written justification",
            default_level: IssueLevel::Fatal,
            default_tolerance: None,
            run: change_disclosure,
        },
        Rule {
            id: "narrative_min_length",
            description: "Narrative fields are not trivially short",
            default_level: IssueLevel::Suggest,
            default_tolerance: None,
            run: narrative_min_length,
        },
    ]
}

fn wan_amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d[\d,]*(?:\.\d+)?)\s*万元").expect("invalid wan amount regex"))
}

/// The ASCII markers are bounded by non-letters rather than `\b`, which
/// treats adjacent CJK characters as word characters.
fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"X{2,}|x{2,}|…+|\.{3,}|。{3,}|[*＊]{2,}|(?:^|[^A-Za-z])((?i:todo|tbd))(?:[^A-Za-z]|$)|待(?:补充|填写|完善|定)")
            .expect("invalid placeholder regex")
    })
}

// ---------------------------------------------------------------------------
// Balance
// ---------------------------------------------------------------------------

/// Both operands absent is a FATAL gap when `require_operands` holds (the
/// `require_operands` param overrides it), otherwise the pair is skipped.
fn balance(
    ctx: &RuleContext,
    cfg: &EffectiveConfig,
    anchor: &str,
    left: FactKey,
    right: FactKey,
    require_operands: bool,
) -> Vec<Finding> {
    let require_operands = cfg.param_bool("require_operands").unwrap_or(require_operands);
    let evidence = || Evidence::new(anchor, vec![ctx.fact_ref(left), ctx.fact_ref(right)]);

    match (ctx.value(left), ctx.value(right)) {
        (Some(a), Some(b)) => {
            let tolerance = cfg.tolerance_or(AMOUNT_TOLERANCE);
            if within_tolerance(a, b, tolerance) {
                Vec::new()
            } else {
                vec![Finding::new(
                    format!(
                        "{} ({}) does not equal {} ({}); difference {:.2} exceeds {}",
                        display_label(left),
                        a,
                        display_label(right),
                        b,
                        (a - b).abs(),
                        tolerance
                    ),
                    evidence(),
                )]
            }
        }
        (Some(_), None) | (None, Some(_)) => {
            let missing = if ctx.value(left).is_none() { left } else { right };
            vec![Finding::forced(
                IssueLevel::Fatal,
                format!(
                    "Cannot check balance: {} ({}) is missing",
                    display_label(missing),
                    missing
                ),
                evidence(),
            )]
        }
        (None, None) if !require_operands => Vec::new(),
        (None, None) => vec![Finding::forced(
            IssueLevel::Fatal,
            format!(
                "Cannot check balance: {} ({}) and {} ({}) are both missing",
                display_label(left),
                left,
                display_label(right),
                right
            ),
            evidence(),
        )],
    }
}

fn balance_revenue_expenditure(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    balance(
        ctx,
        cfg,
        "balance_revenue_expenditure",
        FactKey::BudgetRevenueTotal,
        FactKey::BudgetExpenditureTotal,
        true,
    )
}

fn balance_fiscal_grant(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    balance(
        ctx,
        cfg,
        "balance_fiscal_grant",
        FactKey::FiscalGrantRevenueTotal,
        FactKey::FiscalGrantExpenditureTotal,
        false,
    )
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Total against the sum of whichever parts are present. Skipped when the
/// total or every part is absent.
fn composition(
    ctx: &RuleContext,
    cfg: &EffectiveConfig,
    anchor: &str,
    total_key: FactKey,
    parts: &[FactKey],
) -> Vec<Finding> {
    let Some(total) = ctx.value(total_key) else {
        return Vec::new();
    };
    let present: Vec<(FactKey, f64)> = parts
        .iter()
        .filter_map(|k| ctx.value(*k).map(|v| (*k, v)))
        .collect();
    if present.is_empty() {
        return Vec::new();
    }

    let sum: f64 = present.iter().map(|(_, v)| v).sum();
    let tolerance = cfg.tolerance_or(AMOUNT_TOLERANCE);
    if within_tolerance(total, sum, tolerance) {
        return Vec::new();
    }

    let mut refs = vec![ctx.fact_ref(total_key)];
    refs.extend(present.iter().map(|(k, _)| ctx.fact_ref(*k)));

    let missing: Vec<&str> = parts
        .iter()
        .filter(|k| ctx.value(**k).is_none())
        .map(|k| k.as_str())
        .collect();
    let mut message = format!(
        "{} ({}) differs from the sum of its parts ({:.6}) by {:.2}",
        display_label(total_key),
        total,
        sum,
        (total - sum).abs()
    );
    if !missing.is_empty() {
        message.push_str(&format!("; parts absent: {}", missing.join(", ")));
    }

    vec![Finding::new(message, Evidence::new(anchor, refs))]
}

fn composition_revenue_total(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    composition(
        ctx,
        cfg,
        "composition_revenue_total",
        FactKey::BudgetRevenueTotal,
        &[
            FactKey::BudgetRevenueFiscal,
            FactKey::BudgetRevenueBusiness,
            FactKey::BudgetRevenueOperation,
            FactKey::BudgetRevenueOther,
        ],
    )
}

fn composition_expenditure_total(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    composition(
        ctx,
        cfg,
        "composition_expenditure_total",
        FactKey::BudgetExpenditureTotal,
        &[FactKey::BudgetExpenditureBasic, FactKey::BudgetExpenditureProject],
    )
}

fn composition_three_public_total(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    composition(
        ctx,
        cfg,
        "composition_three_public_total",
        FactKey::ThreePublicTotal,
        &[
            FactKey::ThreePublicOutbound,
            FactKey::ThreePublicVehicleTotal,
            FactKey::ThreePublicReception,
        ],
    )
}

fn composition_vehicle_total(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    composition(
        ctx,
        cfg,
        "composition_vehicle_total",
        FactKey::ThreePublicVehicleTotal,
        &[
            FactKey::ThreePublicVehiclePurchase,
            FactKey::ThreePublicVehicleOperation,
        ],
    )
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// One issue listing every unfilled required field.
fn required_manual_fields(ctx: &RuleContext, _cfg: &EffectiveConfig) -> Vec<Finding> {
    let missing: Vec<&str> = ctx
        .required_manual_keys
        .iter()
        .filter(|key| {
            !ctx.manual_inputs_by_key
                .get(key.as_str())
                .is_some_and(|v| v.is_filled())
        })
        .map(|key| key.as_str())
        .collect();

    if missing.is_empty() {
        return Vec::new();
    }

    vec![Finding::new(
        format!("Required narrative fields are empty: {}", missing.join(", ")),
        Evidence::new(
            "required_manual_fields",
            missing.iter().map(|k| EvidenceRef::manual_field(k)).collect(),
        ),
    )]
}

fn required_facts(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    let keys: Vec<FactKey> = cfg
        .param_strings("keys")
        .unwrap_or_default()
        .iter()
        .filter_map(|raw| match raw.parse::<FactKey>() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("required_facts: ignoring {}", e);
                None
            }
        })
        .collect();

    let missing: Vec<FactKey> = keys
        .into_iter()
        .filter(|k| !ctx.facts_by_key.contains_key(k))
        .collect();
    if missing.is_empty() {
        return Vec::new();
    }

    let names: Vec<&str> = missing.iter().map(|k| k.as_str()).collect();
    vec![Finding::new(
        format!("Required facts are missing: {}", names.join(", ")),
        Evidence::new(
            "required_facts",
            missing.iter().map(|k| ctx.fact_ref(*k)).collect(),
        ),
    )]
}

// ---------------------------------------------------------------------------
// Narrative
// ---------------------------------------------------------------------------

fn narrative_fields(cfg: &EffectiveConfig) -> Vec<(String, FactKey)> {
    match cfg.param_string_map("field_keys") {
        Some(map) => map
            .into_iter()
            .filter_map(|(field, key)| key.parse::<FactKey>().ok().map(|k| (field, k)))
            .collect(),
        None => DEFAULT_NARRATIVE_FIELDS
            .iter()
            .map(|(field, key)| (field.to_string(), *key))
            .collect(),
    }
}

fn parse_stated_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok()
}

/// A field is consistent when at least one stated 万元 amount matches the
/// fact. Fields stating no amount, and facts not on file, are skipped.
fn narrative_number_consistency(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    let tolerance = cfg.tolerance_or(AMOUNT_TOLERANCE);
    let mut findings = Vec::new();

    for (field, key) in narrative_fields(cfg) {
        let Some(text) = ctx.manual_inputs_by_key.get(&field).and_then(|v| v.as_text()) else {
            continue;
        };
        let Some(fact_value) = ctx.value(key) else {
            continue;
        };

        let stated: Vec<f64> = wan_amount_re()
            .captures_iter(text)
            .filter_map(|c| c.get(1).and_then(|m| parse_stated_amount(m.as_str())))
            .collect();
        if stated.is_empty() || stated.iter().any(|v| within_tolerance(*v, fact_value, tolerance)) {
            continue;
        }

        let listed: Vec<String> = stated.iter().map(|v| v.to_string()).collect();
        findings.push(Finding::new(
            format!(
                "Field {} states {} 万元 but {} is {}",
                field,
                listed.join(" / "),
                display_label(key),
                fact_value
            ),
            Evidence::new(
                "narrative_number_consistency",
                vec![EvidenceRef::manual_field(&field), ctx.fact_ref(key)],
            ),
        ));
    }

    findings
}

fn placeholder_tokens(ctx: &RuleContext, _cfg: &EffectiveConfig) -> Vec<Finding> {
    let mut findings = Vec::new();
    let tokens_in = |text: &str| -> Vec<String> {
        placeholder_re()
            .captures_iter(text)
            .filter_map(|c| c.get(1).or_else(|| c.get(0)))
            .map(|m| m.as_str().to_string())
            .collect()
    };

    for (key, value) in &ctx.manual_inputs_by_key {
        let Some(text) = value.as_text() else {
            continue;
        };
        let tokens = tokens_in(text);
        if !tokens.is_empty() {
            findings.push(Finding::new(
                format!("Field {} contains placeholder text: {}", key, tokens.join(" ")),
                Evidence::new("placeholder_tokens", vec![EvidenceRef::manual_field(key)]),
            ));
        }
    }

    for item in &ctx.line_items {
        let Some(reason) = item.reason_text.as_deref() else {
            continue;
        };
        let tokens = tokens_in(reason);
        if !tokens.is_empty() {
            findings.push(Finding::new(
                format!(
                    "Reason for {} {} contains placeholder text: {}",
                    item.code,
                    item.name,
                    tokens.join(" ")
                ),
                Evidence::new("placeholder_tokens", vec![EvidenceRef::line_item(item)]),
            ));
        }
    }

    findings
}

/// Relative change against the prior amount. A zero prior with a non-zero
/// current amount counts as an unbounded change.
fn change_ratio(current: f64, prior: f64) -> f64 {
    if prior == 0.0 {
        if current == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        (current - prior).abs() / prior.abs()
    }
}

fn change_disclosure(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    let threshold = cfg.param_f64("threshold").unwrap_or(DEFAULT_CHANGE_THRESHOLD);

    ctx.line_items
        .iter()
        .filter_map(|item| {
            let prior = item.prior_amount?;
            let ratio = change_ratio(item.current_amount, prior);
            if ratio <= threshold {
                return None;
            }
            let justified = !item.reason_is_auto
                && item
                    .reason_text
                    .as_deref()
                    .is_some_and(|r| !r.trim().is_empty());
            if justified {
                return None;
            }

            let change = if ratio.is_finite() {
                format!("{:.1}%", ratio * 100.0)
            } else {
                "from zero".to_string()
            };
            Some(Finding::new(
                format!(
                    "{} {} changed {} ({} → {}) without a written justification",
                    item.code, item.name, change, prior, item.current_amount
                ),
                Evidence::new("change_disclosure", vec![EvidenceRef::line_item(item)]),
            ))
        })
        .collect()
}

fn narrative_min_length(ctx: &RuleContext, cfg: &EffectiveConfig) -> Vec<Finding> {
    let min_chars = cfg
        .param_f64("min_chars")
        .unwrap_or(DEFAULT_MIN_NARRATIVE_CHARS)
        .max(0.0) as usize;

    ctx.manual_inputs_by_key
        .iter()
        .filter_map(|(key, value)| {
            let text = value.as_text()?.trim();
            let count = text.chars().count();
            if text.is_empty() || count >= min_chars {
                return None;
            }
            Some(Finding::new(
                format!("Field {} has only {} characters (suggested at least {})", key, count, min_chars),
                Evidence::new("narrative_min_length", vec![EvidenceRef::manual_field(key)]),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::schema::{Fact, LineItem, ManualValue, ProvenanceSource, SourceReference, Stage};
    use crate::validation::{RuleConfig, RuleConfigs, ValidationEngine};

    fn fact(key: FactKey, value: f64) -> Fact {
        Fact {
            unit_id: "U001".to_string(),
            year: 2024,
            stage: Stage::Budget,
            key,
            value,
            is_locked: false,
            provenance: ProvenanceSource::StructuredTable,
            source_reference: SourceReference::default(),
        }
    }

    fn context(facts: &[(FactKey, f64)]) -> RuleContext {
        RuleContext::new(
            facts.iter().map(|(k, v)| fact(*k, *v)).collect(),
            BTreeMap::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    fn run_rule(id: &str, ctx: &RuleContext) -> Vec<crate::validation::ValidationIssue> {
        run_with(id, ctx, RuleConfigs::new())
    }

    fn run_with(
        id: &str,
        ctx: &RuleContext,
        configs: RuleConfigs,
    ) -> Vec<crate::validation::ValidationIssue> {
        let summary = ValidationEngine::default().validate("d1", ctx, &configs);
        summary.issues.into_iter().filter(|i| i.rule_id == id).collect()
    }

    fn item(code: &str, current: f64, prior: Option<f64>, reason: Option<&str>, auto: bool) -> LineItem {
        LineItem {
            code: code.to_string(),
            name: "项目".to_string(),
            current_amount: current,
            prior_amount: prior,
            reason_text: reason.map(|r| r.to_string()),
            reason_is_auto: auto,
        }
    }

    #[test]
    fn test_balance_tolerance_boundary() {
        let ok = context(&[
            (FactKey::BudgetRevenueTotal, 100.0),
            (FactKey::BudgetExpenditureTotal, 100.009),
        ]);
        assert!(run_rule("balance_revenue_expenditure", &ok).is_empty());

        let off = context(&[
            (FactKey::BudgetRevenueTotal, 100.0),
            (FactKey::BudgetExpenditureTotal, 100.011),
        ]);
        let issues = run_rule("balance_revenue_expenditure", &off);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Fatal);
        assert_eq!(issues[0].tolerance, Some(0.01));
        assert!(issues[0].evidence.mentions_fact(FactKey::BudgetRevenueTotal));
        assert!(issues[0].evidence.mentions_fact(FactKey::BudgetExpenditureTotal));
    }

    #[test]
    fn test_balance_missing_operand_is_fatal_even_when_downgraded() {
        let ctx = context(&[(FactKey::FiscalGrantRevenueTotal, 90.0)]);
        let mut configs = RuleConfigs::new();
        configs.insert(
            "balance_fiscal_grant".to_string(),
            RuleConfig::new("balance_fiscal_grant").with_level(IssueLevel::Suggest),
        );
        let issues = run_with("balance_fiscal_grant", &ctx, configs);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Fatal);
        assert!(issues[0].message.contains("fiscal_grant_expenditure_total"));

        assert!(run_rule("balance_fiscal_grant", &context(&[])).is_empty());
    }

    #[test]
    fn test_balance_without_any_operand() {
        let empty = context(&[]);
        let issues = run_rule("balance_revenue_expenditure", &empty);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Fatal);
        assert!(issues[0].message.contains("budget_revenue_total"));
        assert!(issues[0].message.contains("budget_expenditure_total"));
        assert!(issues[0].evidence.mentions_fact(FactKey::BudgetExpenditureTotal));

        let summary = ValidationEngine::default().validate("d1", &RuleContext::default(), &RuleConfigs::new());
        assert!(summary.blocks_generation());

        let mut configs = RuleConfigs::new();
        configs.insert(
            "balance_fiscal_grant".to_string(),
            RuleConfig::new("balance_fiscal_grant").with_param("require_operands", serde_json::json!(true)),
        );
        let issues = run_with("balance_fiscal_grant", &empty, configs);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Fatal);
    }

    #[test]
    fn test_level_override_applies_to_ordinary_findings() {
        let ctx = context(&[
            (FactKey::BudgetRevenueTotal, 100.0),
            (FactKey::BudgetExpenditureTotal, 90.0),
        ]);
        let mut configs = RuleConfigs::new();
        configs.insert(
            "balance_revenue_expenditure".to_string(),
            RuleConfig::new("balance_revenue_expenditure").with_level(IssueLevel::Warning),
        );
        let issues = run_with("balance_revenue_expenditure", &ctx, configs);
        assert_eq!(issues[0].level, IssueLevel::Warning);
    }

    #[test]
    fn test_composition_rules() {
        let ctx = context(&[
            (FactKey::BudgetRevenueTotal, 100.0),
            (FactKey::BudgetRevenueFiscal, 80.0),
            (FactKey::BudgetRevenueBusiness, 15.0),
            (FactKey::BudgetExpenditureTotal, 100.0),
            (FactKey::BudgetExpenditureBasic, 60.0),
            (FactKey::BudgetExpenditureProject, 40.0),
            (FactKey::ThreePublicVehicleTotal, 6.0),
            (FactKey::ThreePublicVehiclePurchase, 4.0),
            (FactKey::ThreePublicVehicleOperation, 2.5),
        ]);

        let revenue = run_rule("composition_revenue_total", &ctx);
        assert_eq!(revenue.len(), 1);
        assert_eq!(revenue[0].level, IssueLevel::Warning);
        assert!(revenue[0].message.contains("budget_revenue_other"));

        assert!(run_rule("composition_expenditure_total", &ctx).is_empty());

        let vehicle = run_rule("composition_vehicle_total", &ctx);
        assert_eq!(vehicle.len(), 1);
        assert_eq!(vehicle[0].level, IssueLevel::Fatal);

        // no parts on file, nothing to compare
        assert!(run_rule("composition_three_public_total", &ctx).is_empty());
    }

    #[test]
    fn test_required_manual_fields_single_issue() {
        let mut inputs = BTreeMap::new();
        inputs.insert("main_functions".to_string(), ManualValue::Text("负责……".to_string()));
        inputs.insert("glossary".to_string(), ManualValue::Text("   ".to_string()));
        let ctx = RuleContext::new(
            Vec::new(),
            inputs,
            Vec::new(),
            vec![
                "main_functions".to_string(),
                "glossary".to_string(),
                "organization".to_string(),
            ],
        );
        let issues = run_rule("required_manual_fields", &ctx);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("glossary"));
        assert!(issues[0].message.contains("organization"));
        assert!(!issues[0].message.contains("main_functions"));
        assert_eq!(issues[0].evidence.refs.len(), 2);
    }

    #[test]
    fn test_required_facts_from_params() {
        let ctx = context(&[(FactKey::BudgetRevenueTotal, 1.0)]);
        assert!(run_rule("required_facts", &ctx).is_empty());

        let mut configs = RuleConfigs::new();
        configs.insert(
            "required_facts".to_string(),
            RuleConfig::new("required_facts").with_param(
                "keys",
                serde_json::json!(["budget_revenue_total", "three_public_total", "bogus"]),
            ),
        );
        let issues = run_with("required_facts", &ctx, configs);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("three_public_total"));
        assert!(!issues[0].message.contains("budget_revenue_total"));
    }

    #[test]
    fn test_narrative_number_consistency() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "revenue_explanation".to_string(),
            ManualValue::Text("2024年收入预算1,200.50万元，比上年增加10万元。".to_string()),
        );
        inputs.insert(
            "expenditure_explanation".to_string(),
            ManualValue::Text("支出预算1300万元。".to_string()),
        );
        let ctx = RuleContext::new(
            vec![
                fact(FactKey::BudgetRevenueTotal, 1200.5),
                fact(FactKey::BudgetExpenditureTotal, 1200.5),
            ],
            inputs,
            Vec::new(),
            Vec::new(),
        );
        let issues = run_rule("narrative_number_consistency", &ctx);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Warning);
        assert!(issues[0].message.contains("expenditure_explanation"));
    }

    #[test]
    fn test_placeholder_tokens() {
        let mut inputs = BTreeMap::new();
        inputs.insert("a".to_string(), ManualValue::Text("本单位共有XX个内设机构".to_string()));
        inputs.insert("b".to_string(), ManualValue::Text("情况说明待补充".to_string()));
        inputs.insert("c".to_string(), ManualValue::Text("主要职能为教育管理。".to_string()));
        let mut ctx = RuleContext::new(Vec::new(), inputs, Vec::new(), Vec::new());
        ctx.line_items.push(item("201", 10.0, Some(9.0), Some("TODO"), false));

        let issues = run_rule("placeholder_tokens", &ctx);
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().all(|i| i.level == IssueLevel::Fatal));
    }

    #[test]
    fn test_placeholder_markers_next_to_chinese_text() {
        let mut inputs = BTreeMap::new();
        inputs.insert("a".to_string(), ManualValue::Text("本部门收入情况TODO".to_string()));
        inputs.insert("b".to_string(), ManualValue::Text("说明：todo补充".to_string()));
        inputs.insert("c".to_string(), ManualValue::Text("项目金额tbd".to_string()));
        inputs.insert("d".to_string(), ManualValue::Text("采购Photodone设备".to_string()));
        let ctx = RuleContext::new(Vec::new(), inputs, Vec::new(), Vec::new());

        let issues = run_rule("placeholder_tokens", &ctx);
        assert_eq!(issues.len(), 3);
        assert!(issues[0].message.ends_with("TODO"));
        assert!(!issues.iter().any(|i| i.message.starts_with("Field d")));
    }

    #[test]
    fn test_change_disclosure() {
        let mut ctx = RuleContext::default();
        ctx.line_items = vec![
            item("201", 120.0, Some(100.0), None, false),
            item("202", 120.0, Some(100.0), Some("自动生成"), true),
            item("203", 120.0, Some(100.0), Some("新增信息化建设项目"), false),
            item("204", 105.0, Some(100.0), None, false),
            item("205", 5.0, Some(0.0), None, false),
            item("206", 5.0, None, None, false),
        ];
        let issues = run_rule("change_disclosure", &ctx);
        let codes: Vec<bool> = ["201", "202", "205"]
            .iter()
            .map(|code| issues.iter().any(|i| i.message.starts_with(code)))
            .collect();
        assert_eq!(issues.len(), 3);
        assert_eq!(codes, vec![true, true, true]);

        let mut configs = RuleConfigs::new();
        configs.insert(
            "change_disclosure".to_string(),
            RuleConfig::new("change_disclosure").with_param("threshold", serde_json::json!(0.5)),
        );
        assert_eq!(run_with("change_disclosure", &ctx, configs).len(), 1);
    }

    #[test]
    fn test_narrative_min_length() {
        let mut inputs = BTreeMap::new();
        inputs.insert("short".to_string(), ManualValue::Text("无".to_string()));
        inputs.insert(
            "long".to_string(),
            ManualValue::Text("本部门主要负责全区教育事业发展规划和政策制定。".to_string()),
        );
        inputs.insert("number".to_string(), ManualValue::Number(3.0));
        let ctx = RuleContext::new(Vec::new(), inputs, Vec::new(), Vec::new());
        let issues = run_rule("narrative_min_length", &ctx);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, IssueLevel::Suggest);
    }

    #[test]
    fn test_builtin_ids_are_unique() {
        let rules = builtin_rules();
        let mut ids: Vec<&str> = rules.iter().map(|r| r.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), rules.len());
    }
}
