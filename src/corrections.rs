use crate::error::Result;
use crate::schema::{Fact, FactKey, FactScope, ProvenanceSource, SourceReference};
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reviewer's batch of corrections to the reconciled facts of one scope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct FactCorrections {
    #[schemars(
        description = "Ordered list of corrections. Each one sees the result of the ones before it, so a Lock stops later value changes to the same key."
    )]
    #[serde(default)]
    pub corrections: Vec<FactCorrection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FactCorrection {
    /// Set a value outright. Creates the fact when it is not on file.
    SetValue {
        key: FactKey,
        #[schemars(description = "The corrected value in 万元.")]
        value: f64,
        #[serde(default)]
        note: Option<String>,
    },

    /// Multiply an existing value, e.g. 0.0001 for a value typed in 元.
    ScaleValue { key: FactKey, factor: f64 },

    /// Attach a reviewer note. Metadata only, so locked facts accept it.
    Annotate { key: FactKey, note: String },

    /// Make the value immutable.
    Lock { key: FactKey },
}

impl FactCorrection {
    pub fn key(&self) -> FactKey {
        match self {
            FactCorrection::SetValue { key, .. }
            | FactCorrection::ScaleValue { key, .. }
            | FactCorrection::Annotate { key, .. }
            | FactCorrection::Lock { key } => *key,
        }
    }
}

/// Result of applying corrections to a copy of the base facts.
#[derive(Debug, Clone, Default)]
pub struct CorrectionOutcome {
    pub facts: Vec<Fact>,
    /// Keys whose value changed.
    pub changed: Vec<FactKey>,
    /// Keys whose note changed.
    pub annotated: Vec<FactKey>,
    pub locked: Vec<FactKey>,
    /// Value corrections refused because the fact is locked.
    pub skipped_locked: Vec<FactKey>,
    /// Corrections naming a fact that is not on file.
    pub missing: Vec<FactKey>,
}

impl CorrectionOutcome {
    pub fn fact(&self, key: FactKey) -> Option<&Fact> {
        self.facts.iter().find(|f| f.key == key)
    }
}

impl FactCorrections {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(FactCorrections);
        serde_json::to_string_pretty(&schema)
    }

    /// Applies the corrections to a copy of `base`; `base` is left untouched
    /// so callers keep the pre-correction state for auditing.
    pub fn apply(&self, scope: &FactScope, base: &[Fact]) -> CorrectionOutcome {
        let mut outcome = CorrectionOutcome {
            facts: base.to_vec(),
            ..CorrectionOutcome::default()
        };

        for correction in &self.corrections {
            apply_single_correction(scope, &mut outcome, correction);
        }

        outcome.facts.sort_by_key(|f| f.key);
        dedup_keys(&mut outcome.changed);
        dedup_keys(&mut outcome.annotated);
        outcome
    }
}

fn apply_single_correction(scope: &FactScope, outcome: &mut CorrectionOutcome, correction: &FactCorrection) {
    let key = correction.key();
    let position = outcome.facts.iter().position(|f| f.key == key);

    match (correction, position) {
        (FactCorrection::SetValue { value, note, .. }, None) => {
            outcome.facts.push(Fact {
                unit_id: scope.unit_id.clone(),
                year: scope.year,
                stage: scope.stage,
                key,
                value: *value,
                is_locked: false,
                provenance: ProvenanceSource::Correction,
                source_reference: SourceReference {
                    note: note.clone(),
                    ..SourceReference::default()
                },
            });
            outcome.changed.push(key);
        }

        (FactCorrection::SetValue { value, note, .. }, Some(idx)) => {
            let fact = &mut outcome.facts[idx];
            if fact.is_locked {
                debug!("Correction to locked {} refused", key);
                outcome.skipped_locked.push(key);
                return;
            }
            fact.value = *value;
            fact.provenance = ProvenanceSource::Correction;
            if let Some(note) = note {
                fact.source_reference.note = Some(note.clone());
            }
            outcome.changed.push(key);
        }

        (FactCorrection::ScaleValue { factor, .. }, Some(idx)) => {
            let fact = &mut outcome.facts[idx];
            if fact.is_locked {
                outcome.skipped_locked.push(key);
                return;
            }
            fact.value = crate::utils::round_canonical(fact.value * factor);
            fact.provenance = ProvenanceSource::Correction;
            outcome.changed.push(key);
        }

        (FactCorrection::Annotate { note, .. }, Some(idx)) => {
            outcome.facts[idx].source_reference.note = Some(note.clone());
            outcome.annotated.push(key);
        }

        (FactCorrection::Lock { .. }, Some(idx)) => {
            let fact = &mut outcome.facts[idx];
            if !fact.is_locked {
                fact.is_locked = true;
                outcome.locked.push(key);
            }
        }

        (_, None) => outcome.missing.push(key),
    }
}

fn dedup_keys(keys: &mut Vec<FactKey>) {
    keys.sort();
    keys.dedup();
}
