//! Merge engine: classifies incoming rows against current staging

use crate::audit::RunCounts;
use crate::config::EntitySchema;
use crate::error::TabledgerError;
use crate::row::{normalize_pk, RawRow, StagingRow};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;

/// A row that failed validation
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Key as far as it could be read; `None` when the key itself was bad
    pub pk: Option<String>,
    pub source_row_num: u64,
    pub reason: String,
    /// Raw cells of the source row
    pub raw: serde_json::Value,
}

/// Validated, de-duplicated input for one entity
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub entity: String,
    rows: Vec<(usize, StagingRow)>,
    rejections: Vec<(usize, Rejection)>,
    /// Rows dropped because a later row carried the same key
    pub deduplicated: u64,
}

impl PreparedBatch {
    /// Keys of the rows that survived validation and de-duplication
    pub fn keys(&self) -> Vec<String> {
        self.rows.iter().map(|(_, row)| row.pk.clone()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejections.len()
    }
}

/// What the merge decided for one row
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedChange {
    Insert {
        row: StagingRow,
    },
    Update {
        before: StagingRow,
        after: StagingRow,
        changed: Vec<String>,
    },
    Conflict {
        current: StagingRow,
        incoming: StagingRow,
        changed: Vec<String>,
        protected: Vec<String>,
    },
    Reject(Rejection),
}

impl PlannedChange {
    /// The reason recorded on a conflict's row change and conflict record
    pub fn conflict_reason(protected: &[String]) -> String {
        format!("Protected field mismatch: {}", protected.join(", "))
    }
}

/// Classification of one entity batch
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub entity: String,
    /// Every change that produces a row change record, in source order
    pub changes: Vec<PlannedChange>,
    pub unchanged: u64,
    pub deduplicated: u64,
}

impl MergePlan {
    pub fn counts(&self) -> RunCounts {
        let mut counts = RunCounts {
            unchanged: self.unchanged,
            ..RunCounts::default()
        };
        for change in &self.changes {
            match change {
                PlannedChange::Insert { .. } => counts.inserted += 1,
                PlannedChange::Update { .. } => counts.updated += 1,
                PlannedChange::Conflict { .. } => counts.conflicted += 1,
                PlannedChange::Reject(_) => counts.rejected += 1,
            }
        }
        counts
    }

    /// Per-column update counts and sample keys
    pub fn summary(&self, schema: &EntitySchema, sample_size: usize) -> EntitySummary {
        let mut column_updates: IndexMap<String, u64> =
            schema.column_names().map(|c| (c.to_string(), 0)).collect();
        let mut summary = EntitySummary {
            entity: self.entity.clone(),
            counts: self.counts(),
            deduplicated: self.deduplicated,
            column_updates: IndexMap::new(),
            sample_inserted: Vec::new(),
            sample_updated: Vec::new(),
            sample_conflicted: Vec::new(),
            sample_rejected: Vec::new(),
        };

        fn push_sample(samples: &mut Vec<String>, pk: &str, limit: usize) {
            if samples.len() < limit {
                samples.push(pk.to_string());
            }
        }

        for change in &self.changes {
            match change {
                PlannedChange::Insert { row } => {
                    push_sample(&mut summary.sample_inserted, &row.pk, sample_size)
                }
                PlannedChange::Update { after, changed, .. } => {
                    for column in changed {
                        if let Some(count) = column_updates.get_mut(column) {
                            *count += 1;
                        }
                    }
                    push_sample(&mut summary.sample_updated, &after.pk, sample_size);
                }
                PlannedChange::Conflict { incoming, .. } => {
                    push_sample(&mut summary.sample_conflicted, &incoming.pk, sample_size)
                }
                PlannedChange::Reject(rejection) => push_sample(
                    &mut summary.sample_rejected,
                    rejection.pk.as_deref().unwrap_or("<no key>"),
                    sample_size,
                ),
            }
        }

        column_updates.retain(|_, count| *count > 0);
        summary.column_updates = column_updates;
        summary
    }
}

/// Human-facing digest of a merge
#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub entity: String,
    pub counts: RunCounts,
    pub deduplicated: u64,
    pub column_updates: IndexMap<String, u64>,
    pub sample_inserted: Vec<String>,
    pub sample_updated: Vec<String>,
    pub sample_conflicted: Vec<String>,
    pub sample_rejected: Vec<String>,
}

/// Classifies rows of one entity under its primary key and protected fields
pub struct MergeEngine<'a> {
    schema: &'a EntitySchema,
}

impl<'a> MergeEngine<'a> {
    pub fn new(schema: &'a EntitySchema) -> Self {
        Self { schema }
    }

    /// Validate and fingerprint rows in parallel, then keep only the last
    /// occurrence of every key by source order.
    pub fn prepare(&self, rows: &[RawRow]) -> PreparedBatch {
        let validated: Vec<(usize, std::result::Result<StagingRow, Rejection>)> = rows
            .par_iter()
            .enumerate()
            .map(|(idx, raw)| (idx, StagingRow::validate(self.schema, raw).map_err(|e| self.reject(raw, e))))
            .collect();

        let mut valid = Vec::with_capacity(validated.len());
        let mut rejections = Vec::new();
        for (idx, outcome) in validated {
            match outcome {
                Ok(row) => valid.push((idx, row)),
                Err(rejection) => rejections.push((idx, rejection)),
            }
        }

        // Source order is the line number, then position in the input
        valid.sort_by_key(|(idx, row)| (row.source_row_num.unwrap_or(0), *idx));

        let mut last_by_key: HashMap<&str, usize> = HashMap::with_capacity(valid.len());
        for (position, (_, row)) in valid.iter().enumerate() {
            last_by_key.insert(row.pk.as_str(), position);
        }
        let keep: Vec<bool> = valid
            .iter()
            .enumerate()
            .map(|(position, (_, row))| last_by_key.get(row.pk.as_str()) == Some(&position))
            .collect();

        let before = valid.len();
        let rows: Vec<(usize, StagingRow)> = valid
            .into_iter()
            .zip(keep)
            .filter_map(|(entry, keep)| keep.then_some(entry))
            .collect();
        let deduplicated = (before - rows.len()) as u64;

        if deduplicated > 0 {
            log::debug!(
                "{}: dropped {} duplicate key(s) in favour of later rows",
                self.schema.name,
                deduplicated
            );
        }

        PreparedBatch {
            entity: self.schema.name.clone(),
            rows,
            rejections,
            deduplicated,
        }
    }

    fn reject(&self, raw: &RawRow, error: TabledgerError) -> Rejection {
        let reason = match error {
            TabledgerError::Validation { message, .. } => message,
            other => other.to_string(),
        };
        Rejection {
            pk: normalize_pk(&self.schema.primary_key, raw.get(&self.schema.primary_key)).ok(),
            source_row_num: raw.source_row_num,
            reason,
            raw: raw.to_document(),
        }
    }

    /// Classify a prepared batch against the current rows for its keys
    pub fn classify(&self, batch: PreparedBatch, existing: &HashMap<String, StagingRow>) -> MergePlan {
        let PreparedBatch {
            entity,
            rows,
            rejections,
            deduplicated,
        } = batch;

        // Keys are unique after prepare(), so rows classify independently
        let classified: Vec<(usize, Option<PlannedChange>)> = rows
            .into_par_iter()
            .map(|(idx, incoming)| {
                let current = existing.get(&incoming.pk);
                (idx, self.classify_row(incoming, current))
            })
            .collect();

        let mut unchanged = 0u64;
        let mut ordered: Vec<(usize, PlannedChange)> =
            Vec::with_capacity(classified.len() + rejections.len());
        for (idx, change) in classified {
            match change {
                Some(change) => ordered.push((idx, change)),
                None => unchanged += 1,
            }
        }
        ordered.extend(
            rejections
                .into_iter()
                .map(|(idx, rejection)| (idx, PlannedChange::Reject(rejection))),
        );
        ordered.sort_by_key(|(idx, _)| *idx);

        MergePlan {
            entity,
            changes: ordered.into_iter().map(|(_, change)| change).collect(),
            unchanged,
            deduplicated,
        }
    }

    fn classify_row(&self, incoming: StagingRow, current: Option<&StagingRow>) -> Option<PlannedChange> {
        let current = match current {
            None => return Some(PlannedChange::Insert { row: incoming }),
            Some(current) => current,
        };

        if current.fingerprint == incoming.fingerprint {
            return None;
        }

        let changed = current.changed_columns(&incoming, self.schema);
        if changed.is_empty() {
            return None;
        }

        let protected: Vec<String> = changed
            .iter()
            .filter(|c| self.schema.is_protected(c))
            .cloned()
            .collect();

        if protected.is_empty() {
            Some(PlannedChange::Update {
                before: current.clone(),
                after: incoming,
                changed,
            })
        } else {
            Some(PlannedChange::Conflict {
                current: current.clone(),
                incoming,
                changed,
                protected,
            })
        }
    }

    /// Validate, de-duplicate and classify in one go
    pub fn plan(&self, rows: &[RawRow], existing: &HashMap<String, StagingRow>) -> MergePlan {
        self.classify(self.prepare(rows), existing)
    }
}
