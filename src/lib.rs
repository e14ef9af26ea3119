//! # Budget Fact Engine
//!
//! Turns the financial tables of government unit budget documents into one
//! canonical, consistent set of facts, and checks that set before a filing
//! may be generated from it.
//!
//! ## Core Concepts
//!
//! - **Fact**: a value for a closed [`FactKey`], scoped by unit, year and stage,
//!   always stored in 万元 (wan)
//! - **Candidate**: an unreconciled value, either from a structured table or
//!   from the looser manual parsing channel
//! - **Reconciliation**: structured values win; disagreements become audit
//!   entries, never silent drops; locked facts are never overwritten
//! - **Validation**: configurable rules produce FATAL/WARNING/SUGGEST issues
//!   with evidence; any FATAL blocks generation
//!
//! ## Example
//!
//! ```rust,ignore
//! use budget_fact_engine::*;
//!
//! let engine = FactEngine::new(EngineConfig::default())?;
//! let mut store = FactStore::open_in_memory()?;
//! let scope = FactScope::new("U001", 2024, Stage::Budget);
//!
//! let table = RawTable::new(
//!     "summary",
//!     vec![
//!         vec!["单位：万元".to_string()],
//!         vec!["收入合计".to_string(), "100".to_string()],
//!         vec!["支出合计".to_string(), "100".to_string()],
//!     ],
//! );
//! let report = engine.reconcile(&mut store, &scope, &[table], &[])?;
//! assert!(report.conflicts.is_empty());
//!
//! store.save_draft(&Draft {
//!     draft_id: "D1".to_string(),
//!     unit_id: scope.unit_id.clone(),
//!     year: scope.year,
//!     stage: scope.stage,
//! })?;
//! let summary = engine.validate_draft(&mut store, "D1")?;
//! assert!(!summary.blocks_generation());
//! ```

pub mod catalog;
pub mod config;
pub mod corrections;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod ingestion;
pub mod labels;
pub mod reconcile;
pub mod resolver;
pub mod scale;
pub mod schema;
pub mod store;
pub mod three_public;
pub mod utils;
pub mod validation;

pub use catalog::{CatalogEntry, FactCatalog, FactSection};
pub use config::{EngineConfig, ReconcileConfig, ScaleConfig, ValidationConfig};
pub use corrections::{CorrectionOutcome, FactCorrection, FactCorrections};
pub use engine::{CorrectionReport, FactEngine, ReconcileReport, TableScale};
pub use error::{FactEngineError, Result};
pub use extraction::{ExtractedTable, TableExtractor, TableKind};
pub use ingestion::{manual_rows_from_json, resolve_manual_rows, ManualIngestion, UnmatchedLabel};
pub use labels::normalize_label;
pub use reconcile::{
    Conflict, ConflictKind, Reconciler, Reconciliation, ScaleNormalization, ScaleReason,
};
pub use resolver::{FuzzyRule, KeyResolver};
pub use scale::{CurrencyUnit, ScaleBasis, ScaleDecision, ScaleDetector};
pub use schema::*;
pub use store::{DraftSnapshot, FactStore, FactWriteOutcome};
pub use validation::{
    Evidence, EvidenceRef, IssueLevel, Rule, RuleConfig, RuleConfigs, RuleContext, RuleRegistry,
    ValidationEngine, ValidationIssue, ValidationSummary,
};
