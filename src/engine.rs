use crate::config::EngineConfig;
use crate::corrections::FactCorrections;
use crate::error::{FactEngineError, Result};
use crate::extraction::{ExtractedTable, TableExtractor, TableKind};
use crate::ingestion::{resolve_manual_rows, UnmatchedLabel};
use crate::reconcile::{Conflict, Reconciler, ScaleNormalization};
use crate::resolver::KeyResolver;
use crate::scale::{ScaleDecision, ScaleDetector};
use crate::schema::{CandidateValue, FactKey, FactScope, ManualRow, RawTable};
use crate::store::FactStore;
use crate::validation::{RuleContext, ValidationEngine, ValidationSummary};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// The unit decision taken for one input table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableScale {
    pub table_key: String,
    pub kind: TableKind,
    pub scale: ScaleDecision,
}

impl From<&ExtractedTable> for TableScale {
    fn from(table: &ExtractedTable) -> Self {
        Self {
            table_key: table.table_key.clone(),
            kind: table.kind,
            scale: table.scale.clone(),
        }
    }
}

/// Audit trail of one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub scope: FactScope,
    pub facts_written: Vec<FactKey>,
    pub skipped_locked: Vec<FactKey>,
    pub unmatched_labels: Vec<UnmatchedLabel>,
    pub conflicts: Vec<Conflict>,
    pub scale_decisions: Vec<ScaleNormalization>,
    pub table_scales: Vec<TableScale>,
    /// Keys of input tables whose shape was not recognized; nothing was
    /// extracted from them.
    pub unrecognized_tables: Vec<String>,
}

impl ReconcileReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionReport {
    pub written: Vec<FactKey>,
    pub annotated: Vec<FactKey>,
    pub locked: Vec<FactKey>,
    pub skipped_locked: Vec<FactKey>,
    pub missing: Vec<FactKey>,
}

/// Wires extraction, reconciliation, persistence and validation together.
#[derive(Debug, Clone)]
pub struct FactEngine {
    config: EngineConfig,
    extractor: TableExtractor,
    resolver: KeyResolver,
    reconciler: Reconciler,
    validator: ValidationEngine,
}

impl FactEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let resolver = KeyResolver::default();
        Ok(Self {
            extractor: TableExtractor::new(resolver.clone(), ScaleDetector::new(config.scale.clone())),
            resolver,
            reconciler: Reconciler::new(config.reconcile.clone()),
            validator: ValidationEngine::default(),
            config,
        })
    }

    /// Replaces the label resolver used for table rows and manual rows, e.g.
    /// to add unit-specific aliases.
    pub fn with_resolver(mut self, resolver: KeyResolver) -> Self {
        self.extractor =
            TableExtractor::new(resolver.clone(), ScaleDetector::new(self.config.scale.clone()));
        self.resolver = resolver;
        self
    }

    /// Replaces the rule set, e.g. to add a caller-defined rule.
    pub fn with_validator(mut self, validator: ValidationEngine) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn extract_tables(&self, tables: &[RawTable]) -> Vec<ExtractedTable> {
        self.extractor.extract_all(tables)
    }

    /// Extracts the tables, resolves the manual rows and reconciles both
    /// against the scope's stored facts.
    pub fn reconcile(
        &self,
        store: &mut FactStore,
        scope: &FactScope,
        tables: &[RawTable],
        manual_rows: &[ManualRow],
    ) -> Result<ReconcileReport> {
        let extracted = self.extract_tables(tables);
        let structured: Vec<CandidateValue> = extracted
            .iter()
            .flat_map(|t| t.candidates.iter().cloned())
            .collect();
        let manual = resolve_manual_rows(&self.resolver, manual_rows);
        for unmatched in &manual.unmatched {
            debug!("No fact key for manual label '{}'", unmatched.label);
        }

        let mut report = self.reconcile_candidates(store, scope, &structured, &manual.candidates)?;
        report.unmatched_labels = manual.unmatched;
        report.table_scales = extracted.iter().map(TableScale::from).collect();
        report.unrecognized_tables = extracted
            .iter()
            .filter(|t| t.kind == TableKind::Unknown)
            .map(|t| t.table_key.clone())
            .collect();
        Ok(report)
    }

    /// Reconciles already-resolved candidates and persists the result in one
    /// transaction.
    pub fn reconcile_candidates(
        &self,
        store: &mut FactStore,
        scope: &FactScope,
        structured: &[CandidateValue],
        manual: &[CandidateValue],
    ) -> Result<ReconcileReport> {
        scope.validate()?;

        let history = store.load_facts(scope)?;
        let reconciliation = self.reconciler.reconcile(scope, structured, manual, &history);
        let outcome = store.write_facts(&reconciliation.facts)?;

        if !outcome.skipped_locked.is_empty() {
            warn!(
                "{} locked facts left unchanged for {}/{}",
                outcome.skipped_locked.len(),
                scope.unit_id,
                scope.year
            );
        }
        info!(
            "Reconciled {}/{}/{}: {} written, {} conflicts",
            scope.unit_id,
            scope.year,
            scope.stage.as_str(),
            outcome.written.len(),
            reconciliation.conflicts.len()
        );

        Ok(ReconcileReport {
            scope: scope.clone(),
            facts_written: outcome.written,
            skipped_locked: outcome.skipped_locked,
            unmatched_labels: Vec::new(),
            conflicts: reconciliation.conflicts,
            scale_decisions: reconciliation.scale_decisions,
            table_scales: Vec::new(),
            unrecognized_tables: Vec::new(),
        })
    }

    /// Applies reviewer corrections to the stored facts of a scope. Values of
    /// locked facts never change; their notes still may.
    pub fn apply_corrections(
        &self,
        store: &mut FactStore,
        scope: &FactScope,
        corrections: &FactCorrections,
    ) -> Result<CorrectionReport> {
        scope.validate()?;

        let base = store.load_facts(scope)?;
        let outcome = corrections.apply(scope, &base);

        let to_write: Vec<_> = outcome
            .facts
            .iter()
            .filter(|f| outcome.changed.contains(&f.key) || outcome.locked.contains(&f.key))
            .cloned()
            .collect();
        let references: Vec<_> = outcome
            .annotated
            .iter()
            .filter(|key| !to_write.iter().any(|f| f.key == **key))
            .filter_map(|key| outcome.fact(*key).map(|f| (*key, f.source_reference.clone())))
            .collect();
        let (written, _) = store.write_corrections(scope, &to_write, &references)?;

        let mut skipped_locked = outcome.skipped_locked;
        skipped_locked.extend(written.skipped_locked);
        skipped_locked.sort();
        skipped_locked.dedup();

        info!(
            "Applied {} corrections to {}/{}: {} written, {} refused",
            corrections.corrections.len(),
            scope.unit_id,
            scope.year,
            written.written.len(),
            skipped_locked.len()
        );

        Ok(CorrectionReport {
            written: written.written,
            annotated: outcome.annotated,
            locked: outcome.locked,
            skipped_locked,
            missing: outcome.missing,
        })
    }

    /// Validates a draft against a consistent snapshot and replaces its
    /// stored issues.
    pub fn validate_draft(&self, store: &mut FactStore, draft_id: &str) -> Result<ValidationSummary> {
        let draft = store
            .get_draft(draft_id)?
            .ok_or_else(|| FactEngineError::DraftNotFound(draft_id.to_string()))?;

        let snapshot = store.load_snapshot(&draft)?;
        let configs = store.load_rule_configs()?;
        let context = RuleContext::new(
            snapshot.facts,
            snapshot.manual_inputs,
            snapshot.line_items,
            self.config.validation.required_manual_keys.clone(),
        );

        let summary = self.validator.validate(draft_id, &context, &configs);
        store.replace_issues(draft_id, &summary.issues)?;

        info!(
            "Draft {}: {} fatal, {} warning, {} suggest",
            draft_id, summary.fatal_count, summary.warning_count, summary.suggest_count
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{default_aliases, default_fuzzy_rules};
    use crate::schema::{Draft, Stage};

    fn setup() -> (FactEngine, FactStore, FactScope) {
        let engine = FactEngine::new(EngineConfig::default()).unwrap();
        let store = FactStore::open_in_memory().unwrap();
        (engine, store, FactScope::new("U001", 2024, Stage::Budget))
    }

    #[test]
    fn test_reconcile_reports_table_scales_and_unmatched() {
        let (engine, mut store, scope) = setup();
        let tables = vec![RawTable::new(
            "unknown",
            vec![
                vec!["收支总表".to_string()],
                vec!["单位：元".to_string()],
                vec!["收入合计".to_string(), "1000000".to_string()],
            ],
        )];
        let manual = vec![ManualRow::new("某某补充说明", 3.0)];

        let report = engine.reconcile(&mut store, &scope, &tables, &manual).unwrap();
        assert_eq!(report.table_scales.len(), 1);
        assert_eq!(report.unmatched_labels.len(), 1);

        let fact = store.get_fact(&scope, FactKey::BudgetRevenueTotal).unwrap().unwrap();
        assert_eq!(fact.value, 100.0);
    }

    #[test]
    fn test_custom_resolver_aliases() {
        let (engine, mut store, scope) = setup();
        let mut aliases = default_aliases();
        aliases.push(("本年度拨款资金".to_string(), FactKey::BudgetRevenueFiscal));
        let engine = engine.with_resolver(KeyResolver::new(aliases, default_fuzzy_rules()));

        let tables = vec![RawTable::new(
            "summary",
            vec![
                vec!["单位：万元".to_string()],
                vec!["本年度拨款资金".to_string(), "80".to_string()],
            ],
        )];
        let manual = vec![ManualRow::new("本年度拨款资金", 80.0)];

        let report = engine.reconcile(&mut store, &scope, &tables, &manual).unwrap();
        assert!(report.unmatched_labels.is_empty());
        assert_eq!(report.facts_written, vec![FactKey::BudgetRevenueFiscal]);
        let fact = store.get_fact(&scope, FactKey::BudgetRevenueFiscal).unwrap().unwrap();
        assert_eq!(fact.value, 80.0);
    }

    #[test]
    fn test_invalid_scope_is_rejected() {
        let (engine, mut store, _) = setup();
        let scope = FactScope::new("", 2024, Stage::Budget);
        assert!(engine.reconcile_candidates(&mut store, &scope, &[], &[]).is_err());
    }

    #[test]
    fn test_validate_unknown_draft() {
        let (engine, mut store, _) = setup();
        let err = engine.validate_draft(&mut store, "missing").unwrap_err();
        assert!(matches!(err, FactEngineError::DraftNotFound(_)));
    }

    #[test]
    fn test_validate_draft_persists_issues() {
        let (engine, mut store, scope) = setup();
        store
            .save_draft(&Draft {
                draft_id: "D1".to_string(),
                unit_id: scope.unit_id.clone(),
                year: scope.year,
                stage: scope.stage,
            })
            .unwrap();

        let summary = engine.validate_draft(&mut store, "D1").unwrap();
        assert_eq!(summary.fatal_count, 1);
        assert!(summary.blocks_generation());
        let stored = store.load_issues("D1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].rule_id, "balance_revenue_expenditure");
    }
}
