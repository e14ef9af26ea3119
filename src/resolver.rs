use crate::catalog;
use crate::labels::normalize_label;
use crate::schema::FactKey;
use log::trace;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A substring predicate over a normalized label.
///
/// Matches when the text contains every `all_of` fragment, at least one
/// `any_of` fragment (if any are listed) and none of the `none_of` fragments.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FuzzyRule {
    pub key: FactKey,
    #[serde(default)]
    pub all_of: Vec<String>,
    #[serde(default)]
    pub any_of: Vec<String>,
    #[serde(default)]
    pub none_of: Vec<String>,
}

impl FuzzyRule {
    pub fn new(key: FactKey, all_of: &[&str], any_of: &[&str], none_of: &[&str]) -> Self {
        let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            key,
            all_of: owned(all_of),
            any_of: owned(any_of),
            none_of: owned(none_of),
        }
    }

    pub fn matches(&self, normalized: &str) -> bool {
        self.all_of.iter().all(|f| normalized.contains(f.as_str()))
            && (self.any_of.is_empty() || self.any_of.iter().any(|f| normalized.contains(f.as_str())))
            && !self.none_of.iter().any(|f| normalized.contains(f.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MatchKind {
    Alias,
    FuzzyRule { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub key: FactKey,
    pub matched_by: MatchKind,
}

/// Maps raw labels onto the closed fact key space.
#[derive(Debug, Clone)]
pub struct KeyResolver {
    aliases: HashMap<String, FactKey>,
    rules: Vec<FuzzyRule>,
}

impl KeyResolver {
    /// Alias labels are normalized here so callers may pass raw spellings.
    /// On a duplicate alias the first entry wins.
    pub fn new<I, S>(aliases: I, rules: Vec<FuzzyRule>) -> Self
    where
        I: IntoIterator<Item = (S, FactKey)>,
        S: AsRef<str>,
    {
        let mut table = HashMap::new();
        for (label, key) in aliases {
            let normalized = normalize_label(label.as_ref());
            if normalized.is_empty() {
                continue;
            }
            table.entry(normalized).or_insert(key);
        }
        Self {
            aliases: table,
            rules,
        }
    }

    /// Exact alias first, then fuzzy rules in order; first match wins.
    pub fn resolve_detailed(&self, raw_label: &str) -> Option<Resolution> {
        let normalized = normalize_label(raw_label);
        if normalized.is_empty() {
            return None;
        }

        if let Some(key) = self.aliases.get(&normalized) {
            return Some(Resolution {
                key: *key,
                matched_by: MatchKind::Alias,
            });
        }

        let hit = self
            .rules
            .iter()
            .enumerate()
            .find(|(_, rule)| rule.matches(&normalized))
            .map(|(index, rule)| Resolution {
                key: rule.key,
                matched_by: MatchKind::FuzzyRule { index },
            });

        if hit.is_none() {
            trace!("No fact key for label '{}' (normalized '{}')", raw_label, normalized);
        }
        hit
    }

    pub fn resolve(&self, raw_label: &str) -> Option<FactKey> {
        self.resolve_detailed(raw_label).map(|r| r.key)
    }

    pub fn rules(&self) -> &[FuzzyRule] {
        &self.rules
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(default_aliases(), default_fuzzy_rules())
    }
}

pub fn default_aliases() -> Vec<(String, FactKey)> {
    catalog::all_entries()
        .into_iter()
        .flat_map(|entry| {
            entry
                .aliases
                .iter()
                .map(move |alias| (alias.to_string(), entry.key))
        })
        .collect()
}

/// Ordered from most to least specific; first match wins, so sub-items must
/// precede the totals whose fragments they share.
pub fn default_fuzzy_rules() -> Vec<FuzzyRule> {
    use FactKey::*;
    vec![
        FuzzyRule::new(FiscalGrantRevenueTotal, &["财政拨款", "收入"], &["合计", "总计"], &[]),
        FuzzyRule::new(FiscalGrantExpenditureTotal, &["财政拨款", "支出"], &["合计", "总计"], &[]),
        FuzzyRule::new(ThreePublicOutbound, &[], &["因公出国", "出国境", "出国费"], &[]),
        FuzzyRule::new(ThreePublicVehiclePurchase, &["公务用车", "购置"], &[], &["运行"]),
        FuzzyRule::new(ThreePublicVehicleOperation, &["公务用车", "运行"], &[], &["购置"]),
        FuzzyRule::new(ThreePublicVehicleTotal, &[], &["公务用车", "公车"], &[]),
        FuzzyRule::new(ThreePublicReception, &[], &["公务接待", "接待费"], &[]),
        FuzzyRule::new(OperationFund, &["机关运行"], &[], &[]),
        FuzzyRule::new(ThreePublicTotal, &["三公"], &["合计", "总计", "经费"], &[]),
        FuzzyRule::new(BudgetRevenueFiscal, &["财政拨款"], &[], &["支出"]),
        FuzzyRule::new(BudgetRevenueOperation, &["经营收入"], &[], &[]),
        FuzzyRule::new(BudgetRevenueBusiness, &["事业收入"], &[], &[]),
        FuzzyRule::new(BudgetRevenueOther, &["其他收入"], &[], &[]),
        FuzzyRule::new(BudgetExpenditureBasic, &["基本支出"], &[], &[]),
        FuzzyRule::new(BudgetExpenditureProject, &["项目支出"], &[], &[]),
        FuzzyRule::new(BudgetRevenueTotal, &["收入"], &["合计", "总计", "总额"], &[]),
        FuzzyRule::new(BudgetExpenditureTotal, &["支出"], &["合计", "总计", "总额"], &[]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_alias_resolution() {
        let resolver = KeyResolver::default();
        assert_eq!(resolver.resolve("收入合计"), Some(FactKey::BudgetRevenueTotal));
        assert_eq!(resolver.resolve("  支出总计（万元）"), Some(FactKey::BudgetExpenditureTotal));
        assert_eq!(resolver.resolve("因公出国（境）费"), Some(FactKey::ThreePublicOutbound));
        assert_eq!(
            resolver.resolve_detailed("“三公”经费合计").map(|r| r.matched_by),
            Some(MatchKind::Alias)
        );
    }

    #[test]
    fn test_fuzzy_resolution_first_match_wins() {
        let resolver = KeyResolver::default();
        assert_eq!(
            resolver.resolve("2024年“三公”经费预算数合计"),
            Some(FactKey::ThreePublicTotal)
        );
        assert_eq!(
            resolver.resolve("其中：公务用车购置"),
            Some(FactKey::ThreePublicVehiclePurchase)
        );
        assert_eq!(
            resolver.resolve("本部门财政拨款支出总计"),
            Some(FactKey::FiscalGrantExpenditureTotal)
        );
        assert_eq!(resolver.resolve("二、事业收入（含教育收费）"), Some(FactKey::BudgetRevenueBusiness));
    }

    #[test]
    fn test_alias_beats_fuzzy_rule() {
        let resolver = KeyResolver::new(
            vec![("公务接待费", FactKey::OperationFund)],
            vec![FuzzyRule::new(FactKey::ThreePublicReception, &["公务接待"], &[], &[])],
        );
        assert_eq!(resolver.resolve("公务接待费"), Some(FactKey::OperationFund));
        assert_eq!(resolver.resolve("国内公务接待"), Some(FactKey::ThreePublicReception));
    }

    #[test]
    fn test_fixture_rule_order_is_respected() {
        let resolver = KeyResolver::new(
            Vec::<(String, FactKey)>::new(),
            vec![
                FuzzyRule::new(FactKey::ThreePublicTotal, &["三公", "合计"], &[], &[]),
                FuzzyRule::new(FactKey::ThreePublicOutbound, &["三公"], &[], &[]),
            ],
        );
        let resolution = resolver.resolve_detailed("三公合计").unwrap();
        assert_eq!(resolution.key, FactKey::ThreePublicTotal);
        assert_eq!(resolution.matched_by, MatchKind::FuzzyRule { index: 0 });
        assert_eq!(resolver.resolve("三公出国"), Some(FactKey::ThreePublicOutbound));
    }

    #[test]
    fn test_unmatched_label() {
        let resolver = KeyResolver::default();
        assert_eq!(resolver.resolve("政府采购预算"), None);
        assert_eq!(resolver.resolve(""), None);
        assert_eq!(resolver.resolve("（万元）"), None);
    }
}
