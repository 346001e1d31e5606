//! The ledger: runs, rollbacks and history over one store
//!
//! Every run, forward or rollback, follows the same shape. A `running`
//! change event is committed on its own, then the run's work happens in a
//! second transaction that also finalizes the event and, when configured,
//! takes a state image. If anything in that transaction fails it is
//! discarded and the event is closed as `failed` with zero counts. HEAD
//! contention gets exactly one retry.

use crate::archive::{ArchiveManager, ImageArchive};
use crate::audit::{self, AuditWriter, ChangeEvent, Conflict, EventContext, EventStatus, NewRowChange, RowOp, RunCounts};
use crate::config::{EntitySchema, LedgerConfig};
use crate::data::DataProcessor;
use crate::diff::{self, ColumnDiffPager, DiffPager, DiffSummary};
use crate::error::{Result, TabledgerError};
use crate::merge::{EntitySummary, MergeEngine, MergePlan, PlannedChange};
use crate::progress::ProgressFn;
use crate::resolver::EventResolver;
use crate::rollback::{self, RollbackPlan};
use crate::row::{RawRow, StagingRow};
use crate::state::{self, Head, ImageChain, StateImage};
use crate::store::{self, now, LedgerStore};
use crate::verify::{self, VerifyReport};
use crate::workspace::LedgerWorkspace;
use duckdb::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Event source label of single-event rollbacks
pub const ROLLBACK_SOURCE: &str = "rollback";
/// Event source label of point-in-time rollbacks
pub const POINT_IN_TIME_SOURCE: &str = "point_in_time";

/// Per-run knobs; unset fields fall back to the workspace configuration
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub actor: Option<String>,
    pub source_name: Option<String>,
    pub file_name: Option<String>,
    pub create_image: Option<bool>,
    pub materialize: Option<bool>,
    pub notes: Option<String>,
}

impl RunOptions {
    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn source(mut self, source_name: &str) -> Self {
        self.source_name = Some(source_name.to_string());
        self
    }

    pub fn file_name(mut self, file_name: &str) -> Self {
        self.file_name = Some(file_name.to_string());
        self
    }

    pub fn without_image(mut self) -> Self {
        self.create_image = Some(false);
        self
    }

    pub fn materialize(mut self, materialize: bool) -> Self {
        self.materialize = Some(materialize);
        self
    }

    pub fn notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

/// What a run did
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub status: EventStatus,
    pub change_event_id: String,
    pub counts: RunCounts,
    pub summary: Vec<EntitySummary>,
    pub state_image_id: Option<String>,
    pub message: String,
}

/// Classification of input against current staging, nothing written
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub counts: RunCounts,
    pub summary: Vec<EntitySummary>,
}

struct ImagePolicy {
    create: bool,
    materialize: bool,
    images_dir: Option<PathBuf>,
}

/// A governed store of staged entities and their change history
pub struct Ledger {
    store: LedgerStore,
    config: LedgerConfig,
    images_dir: Option<PathBuf>,
    progress: Option<ProgressFn>,
}

impl Ledger {
    /// Open the ledger of a workspace
    pub fn open(workspace: &LedgerWorkspace) -> Result<Self> {
        let config = workspace.load_config()?;
        let store = LedgerStore::open(&workspace.db_path())?;
        store.bootstrap(&config)?;
        Ok(Self {
            store,
            config,
            images_dir: Some(workspace.images_dir.clone()),
            progress: None,
        })
    }

    /// A throwaway ledger; images are recorded but never materialized
    pub fn in_memory(config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        let store = LedgerStore::open_in_memory()?;
        store.bootstrap(&config)?;
        Ok(Self {
            store,
            config,
            images_dir: None,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn set_progress(&mut self, progress: Option<ProgressFn>) {
        self.progress = progress;
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        self.store.connection()
    }

    fn image_policy(&self, opts: &RunOptions) -> ImagePolicy {
        ImagePolicy {
            create: opts.create_image.unwrap_or(self.config.create_images),
            materialize: opts.materialize.unwrap_or(self.config.materialize_images),
            images_dir: self.images_dir.clone(),
        }
    }

    fn actor(&self, opts: &RunOptions) -> String {
        opts.actor.clone().unwrap_or_else(|| self.config.default_actor.clone())
    }

    // ---- forward runs ----

    /// Merge rows of one entity as one audited run
    pub fn run(&mut self, entity: &str, rows: Vec<RawRow>, opts: &RunOptions) -> Result<RunResult> {
        self.run_batches(vec![(entity.to_string(), rows)], opts)
    }

    /// Merge several entities under one change event and one transaction
    pub fn run_batches(&mut self, batches: Vec<(String, Vec<RawRow>)>, opts: &RunOptions) -> Result<RunResult> {
        for (entity, _) in &batches {
            self.config.entity(entity)?;
        }

        let ctx = EventContext {
            actor: self.actor(opts),
            source_name: opts.source_name.clone().unwrap_or_else(|| "api".to_string()),
            file_name: opts.file_name.clone(),
            entities: batches.iter().map(|(entity, _)| entity.clone()).collect(),
            notes: opts.notes.clone(),
            rollback_of: None,
        };
        let total_rows: usize = batches.iter().map(|(_, rows)| rows.len()).sum();
        log::info!("Running {} row(s) across {} entities", total_rows, batches.len());

        let policy = self.image_policy(opts);
        let Self {
            store,
            config,
            progress,
            ..
        } = self;

        execute(store, &ctx, |tx, event| {
            merge_run(tx, config, event, &batches, &policy, progress.as_ref())
        })
    }

    /// Load files and merge them as one run. Inputs pair an entity with a path.
    pub fn run_files(&mut self, inputs: &[(String, PathBuf)], opts: &RunOptions) -> Result<RunResult> {
        let (batches, names) = load_inputs(inputs)?;
        let mut opts = opts.clone();
        if opts.file_name.is_none() {
            opts.file_name = Some(names.join(", "));
        }
        if opts.source_name.is_none() {
            opts.source_name = Some("file".to_string());
        }
        self.run_batches(batches, &opts)
    }

    /// Classify input against current staging without writing anything
    pub fn preview(&self, batches: &[(String, Vec<RawRow>)]) -> Result<Preview> {
        let conn = self.store.connection();
        let mut counts = RunCounts::default();
        let mut summary = Vec::with_capacity(batches.len());

        for (entity, rows) in batches {
            let schema = self.config.entity(entity)?;
            check_headers(schema, rows)?;
            let (plan, _) = plan_batch(conn, schema, rows)?;
            counts.add(&plan.counts());
            summary.push(plan.summary(schema, self.config.sample_size));
        }
        Ok(Preview { counts, summary })
    }

    pub fn preview_files(&self, inputs: &[(String, PathBuf)]) -> Result<Preview> {
        let (batches, _) = load_inputs(inputs)?;
        self.preview(&batches)
    }

    // ---- rollbacks ----

    /// Undo one event's applied changes as a new audited run
    pub fn rollback_event(&mut self, event_id: &str, opts: &RunOptions) -> Result<RunResult> {
        let target = self.terminal_event(event_id)?;
        let ctx = EventContext {
            actor: self.actor(opts),
            source_name: ROLLBACK_SOURCE.to_string(),
            file_name: Some(format!("rollback:{}", target.id)),
            entities: target.entities.clone(),
            notes: Some(opts.notes.clone().unwrap_or_else(|| format!("Rollback of {}", target.id))),
            rollback_of: Some(target.id.clone()),
        };
        log::info!("Rolling back event {}", target.id);

        let policy = self.image_policy(opts);
        let Self { store, config, .. } = self;

        execute(store, &ctx, |tx, event| {
            let changes = rollback::plan_event_rollback(tx, config, &target)?;
            let mut writer = AuditWriter::new(tx, &event.id);
            rollback::apply_net_changes(tx, config, &changes, &mut writer, &now())?;

            let status = if changes.is_empty() {
                EventStatus::NoChanges
            } else {
                EventStatus::RolledBack
            };
            let finished = writer.finalize(status, None)?;
            let image = match status {
                EventStatus::RolledBack => maybe_image(tx, config, &finished, &policy)?,
                _ => None,
            };
            Ok(run_result(
                finished,
                Vec::new(),
                image,
                format!("Rolled back {} row(s) of event {}", changes.len(), target.id),
            ))
        })
    }

    /// What `rollback_to` would reverse, without writing anything
    pub fn plan_rollback_to(&self, target_id: &str) -> Result<RollbackPlan> {
        let target = self.terminal_event(target_id)?;
        rollback::plan_rollback_to(self.store.connection(), &self.config, &target, None)
    }

    /// Return staging to the state right after `target_id` by reversing
    /// every newer event, newest first, and move HEAD back to match.
    pub fn rollback_to(&mut self, target_id: &str, opts: &RunOptions) -> Result<RunResult> {
        let target = self.terminal_event(target_id)?;
        let ctx = EventContext {
            actor: self.actor(opts),
            source_name: POINT_IN_TIME_SOURCE.to_string(),
            file_name: Some(format!("rollback_to:{}", target.id)),
            entities: self.config.entity_names().into_iter().map(str::to_string).collect(),
            notes: opts.notes.clone(),
            rollback_of: Some(target.id.clone()),
        };
        log::info!("Rolling back to event {}", target.id);

        let Self { store, config, .. } = self;
        execute(store, &ctx, |tx, event| {
            let plan = rollback::plan_rollback_to(tx, config, &target, Some(&event.id))?;
            let mut writer = AuditWriter::new(tx, &event.id);
            rollback::apply_net_changes(tx, config, &plan.changes, &mut writer, &now())?;

            let status = if plan.changes.is_empty() {
                EventStatus::NoChanges
            } else {
                EventStatus::RolledBack
            };
            let notes = format!(
                "Point-in-time rollback to {}; reversed {} event(s)",
                target.id,
                plan.events.len()
            );
            let finished = writer.finalize(status, Some(notes.as_str()))?;

            let expected = state::head(tx)?.state_image_id;
            let restored = plan.restore_point.as_ref().map(|image| image.id.clone());
            if expected != restored {
                state::advance_head(tx, expected.as_deref(), restored.as_deref())?;
            }

            if let (Some(image), true) = (&plan.restore_point, plan.exact_image) {
                let digest = store::state_digest(tx, config)?;
                if digest != image.state_digest {
                    return Err(TabledgerError::integrity(format!(
                        "state after rollback does not match image {} of event {}",
                        image.id, target.id
                    )));
                }
            }

            let message = format!(
                "Reversed {} event(s) back to {}: {} inserted, {} updated, {} deleted",
                plan.events.len(),
                target.id,
                plan.inserts,
                plan.updates,
                plan.deletes
            );
            Ok(run_result(finished, Vec::new(), restored, message))
        })
    }

    fn terminal_event(&self, reference: &str) -> Result<ChangeEvent> {
        let event = self.resolve_event(reference)?;
        if !event.status.is_terminal() {
            return Err(TabledgerError::invalid_state(format!(
                "event {} is still running",
                event.id
            )));
        }
        Ok(event)
    }

    // ---- images and history ----

    /// Image the current state as the product of `event_id`
    pub fn create_state_image(&mut self, event_id: &str, materialize: Option<bool>) -> Result<StateImage> {
        let event = self.resolve_event(event_id)?;
        let policy = ImagePolicy {
            create: true,
            materialize: materialize.unwrap_or(self.config.materialize_images),
            images_dir: self.images_dir.clone(),
        };

        let tx = self.store.connection_mut().transaction()?;
        let image = match maybe_image(&tx, &self.config, &event, &policy)? {
            Some(id) => state::require_image(&tx, &id)?,
            None => return Err(TabledgerError::invalid_state("image creation is disabled")),
        };
        tx.commit()?;
        Ok(image)
    }

    pub fn head(&self) -> Result<Head> {
        state::head(self.store.connection())
    }

    /// Images from HEAD back to the root
    pub fn history(&self) -> Result<ImageChain<'_>> {
        ImageChain::from_head(self.store.connection())
    }

    pub fn image(&self, reference: &str) -> Result<StateImage> {
        EventResolver::new(self.store.connection()).resolve_image(reference)
    }

    /// Contents of a materialized image
    pub fn image_archive(&self, image: &StateImage) -> Result<ImageArchive> {
        let name = image.archive_path.as_deref().ok_or_else(|| {
            TabledgerError::archive(format!("image {} was not materialized", image.id))
        })?;
        let dir = self
            .images_dir
            .as_deref()
            .ok_or_else(|| TabledgerError::archive("ledger has no images directory"))?;
        ArchiveManager::read_image(&dir.join(name))
    }

    // ---- events and diffs ----

    pub fn event(&self, id: &str) -> Result<ChangeEvent> {
        audit::require_event(self.store.connection(), id)
    }

    /// Resolve an id, id prefix, `HEAD~n` or `@date` reference
    pub fn resolve_event(&self, reference: &str) -> Result<ChangeEvent> {
        EventResolver::new(self.store.connection()).resolve_str(reference)
    }

    /// Most recent events first
    pub fn events(&self, limit: Option<usize>) -> Result<Vec<ChangeEvent>> {
        audit::list_events(self.store.connection(), limit)
    }

    /// Row changes of an event, one page at a time
    pub fn diff(&self, event_id: &str, page_size: Option<usize>) -> Result<DiffPager<'_>> {
        let event = self.event(event_id)?;
        Ok(DiffPager::new(
            self.store.connection(),
            &event.id,
            page_size.unwrap_or(self.config.diff_page_size),
        ))
    }

    /// Before and after values of one column, one page at a time
    pub fn diff_column(
        &self,
        event_id: &str,
        entity: &str,
        column: &str,
        page_size: Option<usize>,
    ) -> Result<ColumnDiffPager<'_>> {
        let event = self.event(event_id)?;
        let schema = self.config.entity(entity)?;
        if schema.column(column).is_none() {
            return Err(TabledgerError::invalid_input(format!(
                "Entity '{}' has no column '{}'",
                entity, column
            )));
        }
        Ok(ColumnDiffPager::new(
            self.store.connection(),
            &event.id,
            entity,
            column,
            page_size.unwrap_or(self.config.diff_page_size),
        ))
    }

    pub fn diff_summary(&self, event_id: &str) -> Result<DiffSummary> {
        let event = self.event(event_id)?;
        diff::diff_summary(self.store.connection(), event)
    }

    // ---- conflicts, staging, verification ----

    /// Conflicts of one event, or every unresolved conflict
    pub fn conflicts(&self, event_id: Option<&str>) -> Result<Vec<Conflict>> {
        match event_id {
            Some(id) => {
                let event = self.event(id)?;
                audit::conflicts_for_event(self.store.connection(), &event.id)
            }
            None => audit::open_conflicts(self.store.connection()),
        }
    }

    /// Record how a conflict was settled. Staging and the ledger are untouched.
    pub fn resolve_conflict(&self, conflict_id: &str, resolution: &str) -> Result<Conflict> {
        if resolution.trim().is_empty() {
            return Err(TabledgerError::invalid_input("Resolution text must not be empty"));
        }
        audit::resolve_conflict(self.store.connection(), conflict_id, resolution)
    }

    pub fn staging_rows(&self, entity: &str) -> Result<Vec<StagingRow>> {
        let schema = self.config.entity(entity)?;
        store::all_rows(self.store.connection(), schema)
    }

    pub fn staging_count(&self, entity: &str) -> Result<u64> {
        let schema = self.config.entity(entity)?;
        store::row_count(self.store.connection(), schema)
    }

    pub fn state_digest(&self) -> Result<String> {
        store::state_digest(self.store.connection(), &self.config)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        verify::verify(self.store.connection(), &self.config)
    }
}

/// Run `body` inside a transaction tied to a freshly started event
fn execute<F>(store: &mut LedgerStore, ctx: &EventContext, mut body: F) -> Result<RunResult>
where
    F: FnMut(&Connection, &ChangeEvent) -> Result<RunResult>,
{
    let event = audit::start_event(store.connection(), ctx)?;
    let mut retried = false;

    loop {
        match attempt(store, &event, &mut body) {
            Ok(result) => {
                log::info!("{}", result.message);
                return Ok(result);
            }
            Err(e) if e.is_retryable() && !retried => {
                log::warn!("Retrying run {} after HEAD contention", event.id);
                retried = true;
            }
            Err(e) => {
                log::warn!("Run {} failed: {}", event.id, e);
                if let Err(record) = audit::fail_event(store.connection(), &event.id, &e.to_string()) {
                    log::warn!("Could not record failure of run {}: {}", event.id, record);
                }
                return Err(TabledgerError::RunFailed {
                    change_event_id: event.id.clone(),
                    source: Box::new(e),
                });
            }
        }
    }
}

fn attempt<F>(store: &mut LedgerStore, event: &ChangeEvent, body: &mut F) -> Result<RunResult>
where
    F: FnMut(&Connection, &ChangeEvent) -> Result<RunResult>,
{
    let tx = store.connection_mut().transaction()?;
    let result = body(&*tx, event)?;
    tx.commit()?;
    Ok(result)
}

fn merge_run(
    tx: &Connection,
    config: &LedgerConfig,
    event: &ChangeEvent,
    batches: &[(String, Vec<RawRow>)],
    policy: &ImagePolicy,
    progress: Option<&ProgressFn>,
) -> Result<RunResult> {
    let total: u64 = batches.iter().map(|(_, rows)| rows.len() as u64).sum();
    let mut done = 0u64;
    let mut writer = AuditWriter::new(tx, &event.id);
    let mut summary = Vec::with_capacity(batches.len());
    let at = now();

    for (entity, rows) in batches {
        let schema = config.entity(entity)?;
        check_headers(schema, rows)?;

        let (plan, existing) = plan_batch(tx, schema, rows)?;
        summary.push(plan.summary(schema, config.sample_size));
        apply_plan(tx, schema, plan, &existing, &mut writer, &at)?;

        done += rows.len() as u64;
        if let Some(report) = progress {
            report(done, total, entity);
        }
    }

    let counts = writer.counts();
    let status = if counts.has_records() {
        EventStatus::Success
    } else {
        EventStatus::NoChanges
    };
    let finished = writer.finalize(status, None)?;

    let image = if status == EventStatus::Success {
        maybe_image(tx, config, &finished, policy)?
    } else {
        None
    };

    let message = match status {
        EventStatus::NoChanges => format!("No changes; {} row(s) unchanged", counts.unchanged),
        _ => format!(
            "{} inserted, {} updated, {} unchanged, {} conflicted, {} rejected",
            counts.inserted, counts.updated, counts.unchanged, counts.conflicted, counts.rejected
        ),
    };
    Ok(run_result(finished, summary, image, message))
}

/// A source missing the key or a required column fails the whole run
fn check_headers(schema: &EntitySchema, rows: &[RawRow]) -> Result<()> {
    let mut headers: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for row in rows {
        for header in row.cells.keys() {
            if seen.insert(header.as_str()) {
                headers.push(header.as_str());
            }
        }
    }
    if rows.is_empty() {
        return Ok(());
    }

    let missing = schema.missing_headers(&headers);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(TabledgerError::invalid_input(format!(
            "{}: missing required column(s): {}",
            schema.name,
            missing.join(", ")
        )))
    }
}

fn plan_batch(conn: &Connection, schema: &EntitySchema, rows: &[RawRow]) -> Result<(MergePlan, HashMap<String, StagingRow>)> {
    let engine = MergeEngine::new(schema);
    let batch = engine.prepare(rows);
    let existing = store::fetch_rows(conn, schema, &batch.keys())?;
    log::debug!(
        "{}: {} valid row(s), {} rejected, {} already staged",
        schema.name,
        batch.row_count(),
        batch.rejected_count(),
        existing.len()
    );
    let plan = engine.classify(batch, &existing);
    Ok((plan, existing))
}

fn apply_plan(
    tx: &Connection,
    schema: &EntitySchema,
    plan: MergePlan,
    existing: &HashMap<String, StagingRow>,
    writer: &mut AuditWriter<'_>,
    at: &chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let event_id = writer.event_id().to_string();
    let all_columns: Vec<String> = schema.column_names().map(str::to_string).collect();

    for change in plan.changes {
        match change {
            PlannedChange::Insert { row } => {
                store::insert_row(tx, schema, &row, &event_id, at)?;
                writer.record(NewRowChange {
                    entity: schema.name.clone(),
                    pk: Some(row.pk.clone()),
                    op: RowOp::Insert,
                    applied: true,
                    conflict: false,
                    reason: None,
                    changed_columns: all_columns.clone(),
                    db_before: None,
                    db_after: Some(row.to_document(schema)),
                    source_row_num: row.source_row_num,
                })?;
            }
            PlannedChange::Update { before, after, changed } => {
                store::update_row(tx, schema, &after, &event_id, at)?;
                writer.record(NewRowChange {
                    entity: schema.name.clone(),
                    pk: Some(after.pk.clone()),
                    op: RowOp::Update,
                    applied: true,
                    conflict: false,
                    reason: None,
                    changed_columns: changed,
                    db_before: Some(before.to_document(schema)),
                    db_after: Some(after.to_document(schema)),
                    source_row_num: after.source_row_num,
                })?;
            }
            PlannedChange::Conflict {
                current,
                incoming,
                changed,
                protected,
            } => {
                let reason = PlannedChange::conflict_reason(&protected);
                writer.record(NewRowChange {
                    entity: schema.name.clone(),
                    pk: Some(incoming.pk.clone()),
                    op: RowOp::Update,
                    applied: false,
                    conflict: true,
                    reason: Some(reason.clone()),
                    changed_columns: changed,
                    db_before: Some(current.to_document(schema)),
                    db_after: Some(incoming.to_document(schema)),
                    source_row_num: incoming.source_row_num,
                })?;
                writer.record_conflict(&schema.name, &incoming.pk, &reason, &protected)?;
            }
            PlannedChange::Reject(rejection) => {
                let current = rejection.pk.as_ref().and_then(|pk| existing.get(pk));
                writer.record(NewRowChange {
                    entity: schema.name.clone(),
                    pk: rejection.pk.clone(),
                    op: if current.is_some() { RowOp::Update } else { RowOp::Insert },
                    applied: false,
                    conflict: false,
                    reason: Some(rejection.reason),
                    changed_columns: Vec::new(),
                    db_before: current.map(|row| row.to_document(schema)),
                    db_after: Some(rejection.raw),
                    source_row_num: Some(rejection.source_row_num),
                })?;
            }
        }
    }

    writer.add_unchanged(plan.unchanged);
    Ok(())
}

/// Image the state `event` produced when the policy asks for it
fn maybe_image(
    tx: &Connection,
    config: &LedgerConfig,
    event: &ChangeEvent,
    policy: &ImagePolicy,
) -> Result<Option<String>> {
    if !policy.create {
        return Ok(None);
    }

    let digest = store::state_digest(tx, config)?;
    let image = state::create_image(tx, event, digest, None, |image| match (policy.materialize, policy.images_dir.as_deref()) {
        (true, Some(dir)) => {
            let mut staging = Vec::with_capacity(config.entities.len());
            for schema in &config.entities {
                let rows = store::all_rows(tx, schema)?
                    .iter()
                    .map(|row| row.to_document(schema))
                    .collect();
                staging.push((schema.name.clone(), rows));
            }
            ArchiveManager::write_image(dir, image, event, &staging).map(Some)
        }
        _ => Ok(None),
    })?;
    Ok(Some(image.id))
}

fn run_result(event: ChangeEvent, summary: Vec<EntitySummary>, state_image_id: Option<String>, message: String) -> RunResult {
    RunResult {
        status: event.status,
        change_event_id: event.id,
        counts: event.counts,
        summary,
        state_image_id,
        message,
    }
}

/// Load each `(entity, path)` input; also returns the file names loaded
pub fn load_inputs(inputs: &[(String, PathBuf)]) -> Result<(Vec<(String, Vec<RawRow>)>, Vec<String>)> {
    let processor = DataProcessor::new()?;
    let mut batches = Vec::with_capacity(inputs.len());
    let mut names = Vec::with_capacity(inputs.len());
    for (entity, path) in inputs {
        let loaded = processor.load_file(path)?;
        log::info!("Loaded {} row(s) for {} from {}", loaded.row_count(), entity, path.display());
        names.push(loaded.file_name());
        batches.push((entity.clone(), loaded.rows));
    }
    Ok((batches, names))
}
