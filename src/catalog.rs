use crate::schema::FactKey;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FactSection {
    Revenue,
    Expenditure,
    FiscalGrant,
    ThreePublic,
}

impl FactSection {
    pub fn title(&self) -> &'static str {
        match self {
            FactSection::Revenue => "收入 Revenue",
            FactSection::Expenditure => "支出 Expenditure",
            FactSection::FiscalGrant => "财政拨款 Fiscal Grant",
            FactSection::ThreePublic => "“三公”经费 Three Public Expenses",
        }
    }
}

/// Static description of one fact key.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub key: FactKey,
    pub display_label: &'static str,
    pub section: FactSection,
    /// Raw label spellings seen in documents; normalized before use.
    pub aliases: &'static [&'static str],
    /// A related key whose value should be of the same magnitude.
    pub anchor: Option<FactKey>,
    /// Always a small amount in wan; guards against unconverted yuan values.
    pub small_amount: bool,
}

pub fn entry(key: FactKey) -> CatalogEntry {
    use FactKey::*;
    use FactSection::*;

    let (display_label, section, aliases, anchor, small_amount): (
        &'static str,
        FactSection,
        &'static [&'static str],
        Option<FactKey>,
        bool,
    ) = match key {
        BudgetRevenueTotal => (
            "收入合计",
            Revenue,
            &["收入合计", "收入总计", "本年收入合计", "收入总额", "部门收入合计"],
            Some(BudgetExpenditureTotal),
            false,
        ),
        BudgetRevenueFiscal => (
            "财政拨款收入",
            Revenue,
            &["财政拨款收入", "一般公共预算财政拨款收入", "财政拨款", "一般公共预算拨款收入"],
            Some(FiscalGrantRevenueTotal),
            false,
        ),
        BudgetRevenueBusiness => ("事业收入", Revenue, &["事业收入"], None, false),
        BudgetRevenueOperation => (
            "事业单位经营收入",
            Revenue,
            &["事业单位经营收入", "经营收入"],
            None,
            false,
        ),
        BudgetRevenueOther => ("其他收入", Revenue, &["其他收入"], None, false),
        BudgetExpenditureTotal => (
            "支出合计",
            Expenditure,
            &["支出合计", "支出总计", "本年支出合计", "支出总额", "部门支出合计"],
            Some(BudgetRevenueTotal),
            false,
        ),
        BudgetExpenditureBasic => ("基本支出", Expenditure, &["基本支出"], None, false),
        BudgetExpenditureProject => ("项目支出", Expenditure, &["项目支出"], None, false),
        FiscalGrantRevenueTotal => (
            "财政拨款收入合计",
            FiscalGrant,
            &["财政拨款收入合计", "财政拨款收入总计"],
            Some(BudgetRevenueFiscal),
            false,
        ),
        FiscalGrantExpenditureTotal => (
            "财政拨款支出合计",
            FiscalGrant,
            &["财政拨款支出合计", "财政拨款支出总计"],
            Some(FiscalGrantRevenueTotal),
            false,
        ),
        ThreePublicTotal => (
            "“三公”经费合计",
            ThreePublic,
            &["三公经费合计", "三公经费", "三公经费支出合计", "三公经费预算"],
            None,
            true,
        ),
        ThreePublicOutbound => (
            "因公出国（境）费",
            ThreePublic,
            &["因公出国费", "因公出国境费", "因公出国境费用"],
            None,
            true,
        ),
        ThreePublicVehicleTotal => (
            "公务用车购置及运行费",
            ThreePublic,
            &["公务用车购置及运行费", "公务用车购置及运行维护费", "公务用车费"],
            None,
            true,
        ),
        ThreePublicVehiclePurchase => (
            "公务用车购置费",
            ThreePublic,
            &["公务用车购置费", "公务用车购置"],
            None,
            true,
        ),
        ThreePublicVehicleOperation => (
            "公务用车运行费",
            ThreePublic,
            &["公务用车运行费", "公务用车运行维护费", "公务用车运行"],
            None,
            true,
        ),
        ThreePublicReception => (
            "公务接待费",
            ThreePublic,
            &["公务接待费", "公务接待"],
            None,
            true,
        ),
        OperationFund => (
            "机关运行经费",
            ThreePublic,
            &["机关运行经费", "机关运行经费支出"],
            None,
            false,
        ),
    };

    CatalogEntry {
        key,
        display_label,
        section,
        aliases,
        anchor,
        small_amount,
    }
}

/// Every catalog entry in declaration order.
pub fn all_entries() -> Vec<CatalogEntry> {
    FactKey::ALL.iter().map(|key| entry(*key)).collect()
}

pub fn display_label(key: FactKey) -> &'static str {
    entry(key).display_label
}

/// Reviewer-facing reference of the fact key space, grouped by section.
#[derive(Debug, Clone)]
pub struct FactCatalog {
    pub revenue: Vec<CatalogEntry>,
    pub expenditure: Vec<CatalogEntry>,
    pub fiscal_grant: Vec<CatalogEntry>,
    pub three_public: Vec<CatalogEntry>,
}

impl FactCatalog {
    pub fn builtin() -> Self {
        let mut revenue = Vec::new();
        let mut expenditure = Vec::new();
        let mut fiscal_grant = Vec::new();
        let mut three_public = Vec::new();

        for entry in all_entries() {
            match entry.section {
                FactSection::Revenue => revenue.push(entry),
                FactSection::Expenditure => expenditure.push(entry),
                FactSection::FiscalGrant => fiscal_grant.push(entry),
                FactSection::ThreePublic => three_public.push(entry),
            }
        }

        Self {
            revenue,
            expenditure,
            fiscal_grant,
            three_public,
        }
    }

    fn sections(&self) -> [(FactSection, &Vec<CatalogEntry>); 4] {
        [
            (FactSection::Revenue, &self.revenue),
            (FactSection::Expenditure, &self.expenditure),
            (FactSection::FiscalGrant, &self.fiscal_grant),
            (FactSection::ThreePublic, &self.three_public),
        ]
    }

    pub fn total_keys(&self) -> usize {
        self.revenue.len() + self.expenditure.len() + self.fiscal_grant.len() + self.three_public.len()
    }

    pub fn to_csv(&self) -> String {
        let mut output = String::new();
        output.push_str("Section,Key,Label,Anchor,Small Amount\n");

        for (section, entries) in self.sections() {
            for entry in entries {
                output.push_str(&format!(
                    "{:?},{},{},{},{}\n",
                    section,
                    entry.key,
                    entry.display_label,
                    entry.anchor.map(|a| a.as_str()).unwrap_or(""),
                    entry.small_amount
                ));
            }
        }

        output
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str("# Fact Key Reference\n\n");

        for (section, entries) in self.sections() {
            output.push_str(&format!("## {}\n\n", section.title()));
            for entry in entries {
                let anchor = entry
                    .anchor
                    .map(|a| format!(" (anchor: `{}`)", a))
                    .unwrap_or_default();
                output.push_str(&format!(
                    "- `{}` {}{}\n",
                    entry.key, entry.display_label, anchor
                ));
            }
            output.push('\n');
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_covers_every_key() {
        let catalog = FactCatalog::builtin();
        assert_eq!(catalog.total_keys(), FactKey::ALL.len());
        assert_eq!(catalog.revenue.len(), 5);
        assert_eq!(catalog.three_public.len(), 7);
    }

    #[test]
    fn test_small_amount_keys_are_three_public_items() {
        for entry in all_entries().into_iter().filter(|e| e.small_amount) {
            assert_eq!(entry.section, FactSection::ThreePublic);
        }
        assert!(!entry(FactKey::OperationFund).small_amount);
    }

    #[test]
    fn test_catalog_to_markdown_and_csv() {
        let catalog = FactCatalog::builtin();
        let markdown = catalog.to_markdown();
        assert!(markdown.contains("# Fact Key Reference"));
        assert!(markdown.contains("`budget_revenue_fiscal` 财政拨款收入 (anchor: `fiscal_grant_revenue_total`)"));

        let csv = catalog.to_csv();
        assert!(csv.starts_with("Section,Key,Label"));
        assert!(csv.contains("ThreePublic,three_public_reception,公务接待费,,true"));
    }
}
