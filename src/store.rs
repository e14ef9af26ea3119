//! SQLite-backed persistence for facts, draft inputs, rule configuration and
//! validation issues.
//!
//! Fact writes go through a single guarded UPSERT so the lock check and the
//! write cannot be separated: a locked row is left untouched and reported as
//! skipped. Multi-row writes run inside one transaction.

use crate::error::Result;
use crate::schema::{Draft, Fact, FactKey, FactScope, LineItem, ManualValue, ProvenanceSource, SourceReference};
use crate::validation::{Evidence, IssueLevel, RuleConfig, RuleConfigs, ValidationIssue};
use chrono::{SecondsFormat, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const MIGRATIONS: &[(&str, &str)] = &[("0001_init.sql", include_str!("../migrations/0001_init.sql"))];

const UPSERT_FACT_SQL: &str = "
    INSERT INTO facts (unit_id, year, stage, key, value, is_locked, provenance, source_reference, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    ON CONFLICT(unit_id, year, stage, key) DO UPDATE SET
        value = excluded.value,
        is_locked = excluded.is_locked,
        provenance = excluded.provenance,
        source_reference = excluded.source_reference,
        updated_at = excluded.updated_at
    WHERE facts.is_locked = 0";

const SELECT_FACT_COLUMNS: &str =
    "SELECT unit_id, year, stage, key, value, is_locked, provenance, source_reference FROM facts";

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Keys written and keys left alone because their row is locked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactWriteOutcome {
    pub written: Vec<FactKey>,
    pub skipped_locked: Vec<FactKey>,
}

/// Everything validation reads for one draft, taken from one transaction.
#[derive(Debug, Clone, Default)]
pub struct DraftSnapshot {
    pub facts: Vec<Fact>,
    pub manual_inputs: BTreeMap<String, ManualValue>,
    pub line_items: Vec<LineItem>,
}

pub struct FactStore {
    conn: Connection,
}

impl FactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Applies embedded migrations not yet recorded; returns the versions
    /// applied by this call.
    pub fn migrate(&mut self) -> Result<Vec<String>> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )?;

        let already: HashSet<String> = {
            let mut stmt = self.conn.prepare("SELECT version FROM schema_migrations")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut applied = Vec::new();
        for (version, sql) in MIGRATIONS {
            if already.contains(*version) {
                continue;
            }
            let tx = self.conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, now_rfc3339()],
            )?;
            tx.commit()?;
            info!("Applied migration {}", version);
            applied.push((*version).to_string());
        }
        Ok(applied)
    }

    // -----------------------------------------------------------------------
    // Facts
    // -----------------------------------------------------------------------

    /// Writes all facts in one transaction. Locked rows are skipped, not
    /// errors; any other failure rolls the whole batch back.
    pub fn write_facts(&mut self, facts: &[Fact]) -> Result<FactWriteOutcome> {
        let tx = self.conn.transaction()?;
        let outcome = upsert_facts(&tx, facts, &now_rfc3339())?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Writes corrected facts and replaces the source references of
    /// annotated ones in a single transaction, so a batch lands whole or not
    /// at all. Returns the write outcome and the keys whose reference changed.
    pub fn write_corrections(
        &mut self,
        scope: &FactScope,
        facts: &[Fact],
        references: &[(FactKey, SourceReference)],
    ) -> Result<(FactWriteOutcome, Vec<FactKey>)> {
        let updated_at = now_rfc3339();
        let tx = self.conn.transaction()?;
        let outcome = upsert_facts(&tx, facts, &updated_at)?;

        let mut annotated = Vec::new();
        for (key, reference) in references {
            if set_fact_reference(&tx, scope, *key, reference, &updated_at)? {
                annotated.push(*key);
            }
        }
        tx.commit()?;

        Ok((outcome, annotated))
    }

    /// Returns false when the fact does not exist or is already locked.
    pub fn lock_fact(&self, scope: &FactScope, key: FactKey) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE facts SET is_locked = 1, updated_at = ?5
             WHERE unit_id = ?1 AND year = ?2 AND stage = ?3 AND key = ?4 AND is_locked = 0",
            params![scope.unit_id, scope.year, scope.stage.as_str(), key.as_str(), now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Locks every fact of a scope, e.g. once its final account is filed.
    pub fn lock_scope(&self, scope: &FactScope) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE facts SET is_locked = 1, updated_at = ?4
             WHERE unit_id = ?1 AND year = ?2 AND stage = ?3 AND is_locked = 0",
            params![scope.unit_id, scope.year, scope.stage.as_str(), now_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Replaces a fact's source reference. Allowed on locked rows: only the
    /// value is immutable.
    pub fn update_fact_reference(
        &self,
        scope: &FactScope,
        key: FactKey,
        reference: &SourceReference,
    ) -> Result<bool> {
        set_fact_reference(&self.conn, scope, key, reference, &now_rfc3339())
    }

    pub fn get_fact(&self, scope: &FactScope, key: FactKey) -> Result<Option<Fact>> {
        let sql = format!(
            "{} WHERE unit_id = ?1 AND year = ?2 AND stage = ?3 AND key = ?4",
            SELECT_FACT_COLUMNS
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![scope.unit_id, scope.year, scope.stage.as_str(), key.as_str()],
                FactRow::from_row,
            )
            .optional()?;
        row.map(FactRow::into_fact).transpose()
    }

    /// Facts of one scope in `FactKey::ALL` order.
    pub fn load_facts(&self, scope: &FactScope) -> Result<Vec<Fact>> {
        query_facts(&self.conn, scope)
    }

    // -----------------------------------------------------------------------
    // Drafts and their inputs
    // -----------------------------------------------------------------------

    pub fn save_draft(&self, draft: &Draft) -> Result<()> {
        self.conn.execute(
            "INSERT INTO drafts (draft_id, unit_id, year, stage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(draft_id) DO UPDATE SET
                unit_id = excluded.unit_id,
                year = excluded.year,
                stage = excluded.stage",
            params![draft.draft_id, draft.unit_id, draft.year, draft.stage.as_str(), now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_draft(&self, draft_id: &str) -> Result<Option<Draft>> {
        let row = self
            .conn
            .query_row(
                "SELECT draft_id, unit_id, year, stage FROM drafts WHERE draft_id = ?1",
                params![draft_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i32>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(draft_id, unit_id, year, stage)| -> Result<Draft> {
            Ok(Draft {
                draft_id,
                unit_id,
                year,
                stage: stage.parse()?,
            })
        })
        .transpose()
    }

    pub fn set_manual_input(&self, draft_id: &str, key: &str, value: &ManualValue) -> Result<()> {
        self.conn.execute(
            "INSERT INTO manual_inputs (draft_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(draft_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![draft_id, key, serde_json::to_string(value)?, now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_manual_inputs(&self, draft_id: &str) -> Result<BTreeMap<String, ManualValue>> {
        query_manual_inputs(&self.conn, draft_id)
    }

    pub fn replace_line_items(&mut self, draft_id: &str, items: &[LineItem]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM line_items WHERE draft_id = ?1", params![draft_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO line_items
                    (draft_id, position, code, name, current_amount, prior_amount, reason_text, reason_is_auto)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (position, item) in items.iter().enumerate() {
                stmt.execute(params![
                    draft_id,
                    position as i64,
                    item.code,
                    item.name,
                    item.current_amount,
                    item.prior_amount,
                    item.reason_text,
                    item.reason_is_auto,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_line_items(&self, draft_id: &str) -> Result<Vec<LineItem>> {
        query_line_items(&self.conn, draft_id)
    }

    /// Facts, manual inputs and line items for a draft, read in one
    /// transaction so validation sees a consistent state.
    pub fn load_snapshot(&mut self, draft: &Draft) -> Result<DraftSnapshot> {
        let tx = self.conn.transaction()?;
        let snapshot = DraftSnapshot {
            facts: query_facts(&tx, &draft.scope())?,
            manual_inputs: query_manual_inputs(&tx, &draft.draft_id)?,
            line_items: query_line_items(&tx, &draft.draft_id)?,
        };
        tx.commit()?;
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Rule configuration and issues
    // -----------------------------------------------------------------------

    pub fn save_rule_config(&self, config: &RuleConfig) -> Result<()> {
        self.conn.execute(
            "INSERT INTO rule_configs (rule_id, is_enabled, level_override, params) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(rule_id) DO UPDATE SET
                is_enabled = excluded.is_enabled,
                level_override = excluded.level_override,
                params = excluded.params",
            params![
                config.rule_id,
                config.is_enabled,
                config.level_override.map(|l| l.as_str()),
                serde_json::to_string(&config.params)?
            ],
        )?;
        Ok(())
    }

    pub fn load_rule_configs(&self) -> Result<RuleConfigs> {
        let mut stmt = self
            .conn
            .prepare("SELECT rule_id, is_enabled, level_override, params FROM rule_configs")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut configs = RuleConfigs::new();
        for (rule_id, is_enabled, level_override, params) in rows {
            let config = RuleConfig {
                rule_id: rule_id.clone(),
                is_enabled,
                level_override: level_override.map(|l| l.parse::<IssueLevel>()).transpose()?,
                params: serde_json::from_str(&params)?,
            };
            configs.insert(rule_id, config);
        }
        Ok(configs)
    }

    /// Deletes the draft's previous issues and inserts the new set atomically.
    pub fn replace_issues(&mut self, draft_id: &str, issues: &[ValidationIssue]) -> Result<usize> {
        let created_at = now_rfc3339();
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM validation_issues WHERE draft_id = ?1", params![draft_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO validation_issues (draft_id, level, rule_id, message, tolerance, evidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for issue in issues {
                stmt.execute(params![
                    draft_id,
                    issue.level.as_str(),
                    issue.rule_id,
                    issue.message,
                    issue.tolerance,
                    serde_json::to_string(&issue.evidence)?,
                    created_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Replaced {} issues with {} for draft {}", removed, issues.len(), draft_id);
        Ok(issues.len())
    }

    pub fn load_issues(&self, draft_id: &str) -> Result<Vec<ValidationIssue>> {
        let mut stmt = self.conn.prepare(
            "SELECT draft_id, level, rule_id, message, tolerance, evidence
             FROM validation_issues WHERE draft_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![draft_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(draft_id, level, rule_id, message, tolerance, evidence)| -> Result<ValidationIssue> {
                Ok(ValidationIssue {
                    draft_id,
                    level: level.parse()?,
                    rule_id,
                    message,
                    tolerance,
                    evidence: serde_json::from_str::<Evidence>(&evidence)?,
                })
            })
            .collect()
    }
}

/// Raw column values; conversion to domain types happens outside the
/// rusqlite row callback so parse failures surface as engine errors.
struct FactRow {
    unit_id: String,
    year: i32,
    stage: String,
    key: String,
    value: f64,
    is_locked: bool,
    provenance: String,
    source_reference: String,
}

impl FactRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            unit_id: row.get(0)?,
            year: row.get(1)?,
            stage: row.get(2)?,
            key: row.get(3)?,
            value: row.get(4)?,
            is_locked: row.get(5)?,
            provenance: row.get(6)?,
            source_reference: row.get(7)?,
        })
    }

    fn into_fact(self) -> Result<Fact> {
        Ok(Fact {
            unit_id: self.unit_id,
            year: self.year,
            stage: self.stage.parse()?,
            key: self.key.parse()?,
            value: self.value,
            is_locked: self.is_locked,
            provenance: ProvenanceSource::parse(&self.provenance),
            source_reference: serde_json::from_str(&self.source_reference)?,
        })
    }
}

fn upsert_facts(conn: &Connection, facts: &[Fact], updated_at: &str) -> Result<FactWriteOutcome> {
    let mut outcome = FactWriteOutcome::default();
    let mut stmt = conn.prepare(UPSERT_FACT_SQL)?;
    for fact in facts {
        let reference = serde_json::to_string(&fact.source_reference)?;
        let changed = stmt.execute(params![
            fact.unit_id,
            fact.year,
            fact.stage.as_str(),
            fact.key.as_str(),
            fact.value,
            fact.is_locked,
            fact.provenance.as_str(),
            reference,
            updated_at,
        ])?;
        if changed == 0 {
            debug!("{} is locked for {}/{}, skipped", fact.key, fact.unit_id, fact.year);
            outcome.skipped_locked.push(fact.key);
        } else {
            outcome.written.push(fact.key);
        }
    }
    Ok(outcome)
}

fn set_fact_reference(
    conn: &Connection,
    scope: &FactScope,
    key: FactKey,
    reference: &SourceReference,
    updated_at: &str,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE facts SET source_reference = ?5, updated_at = ?6
         WHERE unit_id = ?1 AND year = ?2 AND stage = ?3 AND key = ?4",
        params![
            scope.unit_id,
            scope.year,
            scope.stage.as_str(),
            key.as_str(),
            serde_json::to_string(reference)?,
            updated_at
        ],
    )?;
    Ok(changed > 0)
}

fn query_facts(conn: &Connection, scope: &FactScope) -> Result<Vec<Fact>> {
    let sql = format!(
        "{} WHERE unit_id = ?1 AND year = ?2 AND stage = ?3",
        SELECT_FACT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![scope.unit_id, scope.year, scope.stage.as_str()],
            FactRow::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut facts = rows
        .into_iter()
        .map(FactRow::into_fact)
        .collect::<Result<Vec<_>>>()?;
    facts.sort_by_key(|f| f.key);
    Ok(facts)
}

fn query_manual_inputs(conn: &Connection, draft_id: &str) -> Result<BTreeMap<String, ManualValue>> {
    let mut stmt = conn.prepare("SELECT key, value FROM manual_inputs WHERE draft_id = ?1")?;
    let rows = stmt
        .query_map(params![draft_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(key, value)| -> Result<(String, ManualValue)> {
            Ok((key, serde_json::from_str::<ManualValue>(&value)?))
        })
        .collect()
}

fn query_line_items(conn: &Connection, draft_id: &str) -> Result<Vec<LineItem>> {
    let mut stmt = conn.prepare(
        "SELECT code, name, current_amount, prior_amount, reason_text, reason_is_auto
         FROM line_items WHERE draft_id = ?1 ORDER BY position",
    )?;
    let items = stmt
        .query_map(params![draft_id], |row| {
            Ok(LineItem {
                code: row.get(0)?,
                name: row.get(1)?,
                current_amount: row.get(2)?,
                prior_amount: row.get(3)?,
                reason_text: row.get(4)?,
                reason_is_auto: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}
