//! Sync pipeline orchestration: schema synchronization against the store,
//! the redundant-key upsert engine with bulk-then-individual fallback, the
//! bounded fetch pool and the `SyncPipeline` entry point.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use formgrid_core::{
    build_catalog_with_limit, looks_like_iso_date, ColumnCatalog, ColumnSpec, ColumnType,
    DescriptorForest, FieldDescriptor, FieldInstance, FieldKind, FlatRow, RowIdentity,
    Submission, MAX_COLUMN_ID_LEN, TABLE_FIELDS, TABLE_REVIEWERS,
};
use formgrid_extract::{flatten_submission, reviewer_rows};
use formgrid_source::{SourceError, SubmissionSource, SyncFilters};
use formgrid_store::{RowFields, StoreError, StoredRow, TableStore};

pub const CRATE_NAME: &str = "formgrid-sync";

/// Immutable run configuration. Callers build it explicitly; nothing in
/// here is read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub form_id: i64,
    pub fetch_workers: usize,
    pub batch_size: usize,
    pub section_batch_size: usize,
    pub max_column_id_len: usize,
    pub sync_reviewers: bool,
}

impl SyncConfig {
    pub fn new(form_id: i64) -> Self {
        Self {
            form_id,
            fetch_workers: 3,
            batch_size: 100,
            section_batch_size: 50,
            max_column_id_len: MAX_COLUMN_ID_LEN,
            sync_reviewers: true,
        }
    }
}

/// Errors that abort the whole run. Per-submission failures never surface
/// here; they are counted into the outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum SyncAbort {
    #[error("listing submissions failed: {0}")]
    Listing(#[source] SourceError),
    #[error("schema unavailable and no submissions to sample: {0}")]
    SchemaUnavailable(#[source] SourceError),
    #[error("source rejected credentials: {0}")]
    SourceCredentials(#[source] SourceError),
    #[error("store unusable: {0}")]
    Store(#[from] StoreError),
}

/// What one run did, in the shape callers report upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub success_count: usize,
    pub error_count: usize,
    pub total_processed: usize,
    pub success: bool,
    pub message: String,
}

impl SyncOutcome {
    fn build(form_id: i64, total: usize, failed: usize) -> Self {
        let success_count = total.saturating_sub(failed);
        let message = if failed == 0 {
            format!("Synchronized {success_count}/{total} submissions for form {form_id}")
        } else {
            format!(
                "Synchronized {success_count}/{total} submissions for form {form_id}, {failed} failed"
            )
        };
        Self {
            success_count,
            error_count: failed,
            total_processed: total,
            success: failed == 0,
            message,
        }
    }
}

/// Store tables are namespaced per form so several forms can share one
/// document.
pub fn physical_table_name(form_id: i64, logical: &str, is_section: bool) -> String {
    if is_section {
        format!("form_{form_id}_section_{logical}")
    } else {
        format!("form_{form_id}_{logical}")
    }
}

/// Column type for a sampled cell value, used when a write hits a column
/// the schema pass did not know about.
pub fn infer_column_type(value: &JsonValue) -> ColumnType {
    match value {
        JsonValue::Bool(_) => ColumnType::Bool,
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Int,
        JsonValue::Number(_) => ColumnType::Numeric,
        JsonValue::String(s) if looks_like_iso_date(s) => ColumnType::DateTime,
        _ => ColumnType::Text,
    }
}

fn instance_schema_id(instance: &FieldInstance) -> &str {
    instance.descriptor_id.as_deref().unwrap_or(&instance.id)
}

fn merge_sampled_descriptors(
    out: &mut Vec<FieldDescriptor>,
    seen: &mut HashSet<String>,
    instances: &[FieldInstance],
) {
    for instance in instances {
        let id = instance_schema_id(instance).to_string();
        if !seen.insert(id.clone()) {
            if instance.kind == FieldKind::Repetition {
                if let Some(existing) = out.iter_mut().find(|d| d.id == id) {
                    let mut inner_seen: HashSet<String> =
                        existing.sub_descriptors.iter().map(|d| d.id.clone()).collect();
                    for iteration in &instance.rows {
                        merge_sampled_descriptors(
                            &mut existing.sub_descriptors,
                            &mut inner_seen,
                            &iteration.fields,
                        );
                    }
                }
            }
            continue;
        }
        let mut descriptor = FieldDescriptor {
            id,
            kind: instance.kind,
            label: instance.label.clone(),
            required: false,
            sub_descriptors: Vec::new(),
        };
        if instance.kind == FieldKind::Repetition {
            let mut inner_seen = HashSet::new();
            for iteration in &instance.rows {
                merge_sampled_descriptors(
                    &mut descriptor.sub_descriptors,
                    &mut inner_seen,
                    &iteration.fields,
                );
            }
        }
        out.push(descriptor);
    }
}

/// Reconstructs a descriptor forest from fetched submissions when the
/// schema query is down. Kinds and labels come straight from the
/// instances, so the catalog built from it matches what the data carries.
pub fn forest_from_samples<'a>(samples: impl IntoIterator<Item = &'a Submission>) -> DescriptorForest {
    let mut forest = DescriptorForest::default();
    let mut seen_fields = HashSet::new();
    let mut seen_annotations = HashSet::new();
    for submission in samples {
        merge_sampled_descriptors(&mut forest.fields, &mut seen_fields, &submission.fields);
        merge_sampled_descriptors(
            &mut forest.annotations,
            &mut seen_annotations,
            &submission.annotations,
        );
    }
    forest
}

// ---------------------------------------------------------------------------
// Schema synchronization
// ---------------------------------------------------------------------------

/// Creates missing tables and adds missing columns. Never drops or retypes
/// anything already in the store; table lookup is case-insensitive because
/// the store folds identifiers.
pub struct SchemaSynchronizer<'a> {
    store: &'a dyn TableStore,
    form_id: i64,
}

impl<'a> SchemaSynchronizer<'a> {
    pub fn new(store: &'a dyn TableStore, form_id: i64) -> Self {
        Self { store, form_id }
    }

    /// Returns the logical-to-physical table mapping the upsert phase
    /// writes through.
    pub async fn synchronize(
        &self,
        catalog: &ColumnCatalog,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let existing = self.store.list_tables().await?;
        let existing_by_lower: HashMap<String, String> = existing
            .into_iter()
            .map(|t| (t.id.to_lowercase(), t.id))
            .collect();

        let mut mapping = BTreeMap::new();
        for (logical, columns) in &catalog.tables {
            let is_section = catalog.section_tables.contains(logical);
            let physical = physical_table_name(self.form_id, logical, is_section);
            match existing_by_lower.get(&physical.to_lowercase()) {
                Some(actual) => {
                    let current = self.store.list_columns(actual).await?;
                    let current_ids: HashSet<&str> =
                        current.iter().map(|c| c.id.as_str()).collect();
                    let missing: Vec<ColumnSpec> = columns
                        .iter()
                        .filter(|c| !current_ids.contains(c.id.as_str()))
                        .cloned()
                        .collect();
                    if !missing.is_empty() {
                        info!(table = %actual, count = missing.len(), "adding missing columns");
                        self.store.add_columns(actual, &missing).await?;
                    }
                    mapping.insert(logical.clone(), actual.clone());
                }
                None => {
                    info!(table = %physical, columns = columns.len(), "creating table");
                    let created = self.store.create_table(&physical, columns).await?;
                    mapping.insert(logical.clone(), created);
                }
            }
        }
        Ok(mapping)
    }
}

// ---------------------------------------------------------------------------
// Row keys and the existing-row index
// ---------------------------------------------------------------------------

/// Candidate match keys for one row, most specific first. Section rows
/// carry several shapes because historical rows were written with
/// different key layouts.
pub fn row_keys(identity: &RowIdentity) -> Vec<String> {
    match identity {
        RowIdentity::Record { submission_number } => vec![submission_number.to_string()],
        RowIdentity::Reviewer { reviewer_id } => vec![reviewer_id.clone()],
        RowIdentity::SectionRow {
            submission_number,
            section,
            row_index,
            row_id,
            geo,
        } => {
            let full = format!("{submission_number}_{section}_{row_id}");
            let mut keys = vec![
                full.clone(),
                full.to_lowercase(),
                format!("{submission_number}_{section}_index_{row_index}"),
                row_id.clone(),
            ];
            if let Some(geo) = geo {
                keys.push(format!("{submission_number}_{section}_geo_{}", geo.geo_id));
            }
            keys
        }
    }
}

fn field_string(fields: &RowFields, key: &str) -> Option<String> {
    match fields.get(key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Match keys to store row ids for one table, built once per upsert pass.
/// First registration wins so fan-out rows sharing an index key keep their
/// own identities.
#[derive(Debug, Default)]
pub struct ExistingRowIndex {
    by_key: HashMap<String, i64>,
}

impl ExistingRowIndex {
    pub fn from_rows(section: Option<&str>, rows: &[StoredRow]) -> Self {
        let mut index = Self::default();
        for row in rows {
            match section {
                Some(section) => {
                    let record = match field_string(&row.fields, "record_key") {
                        Some(record) => record,
                        None => continue,
                    };
                    if let Some(row_key) = field_string(&row.fields, "row_id") {
                        let full = format!("{record}_{section}_{row_key}");
                        index.register(full.to_lowercase(), row.row_id);
                        index.register(full, row.row_id);
                        index.register(row_key, row.row_id);
                    }
                    if let Some(row_index) = field_string(&row.fields, "row_index") {
                        index.register(
                            format!("{record}_{section}_index_{row_index}"),
                            row.row_id,
                        );
                    }
                    if let Some(geo_id) = field_string(&row.fields, "geo_id") {
                        index.register(format!("{record}_{section}_geo_{geo_id}"), row.row_id);
                    }
                }
                None => {
                    if let Some(number) = field_string(&row.fields, "submission_number") {
                        index.register(number, row.row_id);
                    } else if let Some(reviewer) = field_string(&row.fields, "reviewer_id") {
                        index.register(reviewer, row.row_id);
                    }
                }
            }
        }
        index
    }

    fn register(&mut self, key: String, row_id: i64) {
        self.by_key.entry(key).or_insert(row_id);
    }

    pub fn lookup(&self, keys: &[String]) -> Option<i64> {
        keys.iter().find_map(|key| self.by_key.get(key).copied())
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Upsert engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TableUpsertStats {
    pub created: usize,
    pub updated: usize,
    pub failed_rows: usize,
    pub failed_submissions: HashSet<i64>,
}

fn submission_of(identity: &RowIdentity) -> Option<i64> {
    match identity {
        RowIdentity::Record { submission_number }
        | RowIdentity::SectionRow {
            submission_number, ..
        } => Some(*submission_number),
        RowIdentity::Reviewer { .. } => None,
    }
}

/// Bulk writes with an individual-row fallback. A write that hits an
/// unknown column adds the column (type inferred from the data) and
/// retries once before giving up on the row.
pub struct UpsertEngine<'a> {
    store: &'a dyn TableStore,
}

impl<'a> UpsertEngine<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self { store }
    }

    pub async fn upsert(
        &self,
        physical: &str,
        section: Option<&str>,
        rows: &[FlatRow],
        batch_size: usize,
        row_by_row: bool,
    ) -> Result<TableUpsertStats, SyncAbort> {
        let mut stats = TableUpsertStats::default();
        if rows.is_empty() {
            return Ok(stats);
        }

        let existing = self
            .store
            .list_rows(physical)
            .await
            .map_err(SyncAbort::Store)?;
        let index = ExistingRowIndex::from_rows(section, &existing);

        let mut creates: Vec<&FlatRow> = Vec::new();
        let mut updates: Vec<(i64, &FlatRow)> = Vec::new();
        for row in rows {
            match index.lookup(&row_keys(&row.identity)) {
                Some(row_id) => updates.push((row_id, row)),
                None => creates.push(row),
            }
        }

        let chunk = if row_by_row { 1 } else { batch_size.max(1) };
        for batch in creates.chunks(chunk) {
            self.create_batch(physical, batch, &mut stats).await?;
        }
        for batch in updates.chunks(chunk) {
            self.update_batch(physical, batch, &mut stats).await?;
        }
        Ok(stats)
    }

    /// Bulk payloads must be rectangular; absent columns are null-filled
    /// against the union of the batch.
    fn normalize_batch(rows: &[&FlatRow]) -> Vec<RowFields> {
        let mut columns: BTreeSet<&str> = BTreeSet::new();
        for row in rows {
            columns.extend(row.fields.keys().map(String::as_str));
        }
        rows.iter()
            .map(|row| {
                let mut fields: RowFields = row.fields.clone();
                for column in &columns {
                    fields
                        .entry((*column).to_string())
                        .or_insert(JsonValue::Null);
                }
                fields
            })
            .collect()
    }

    async fn heal_unknown_column(
        &self,
        physical: &str,
        column: &str,
        rows: &[&FlatRow],
    ) -> Result<(), StoreError> {
        let sample = rows
            .iter()
            .filter_map(|row| row.fields.get(column))
            .find(|value| !value.is_null());
        let column_type = sample.map(infer_column_type).unwrap_or(ColumnType::Text);
        warn!(table = physical, column, kind = column_type.as_str(), "adding column missing from schema pass");
        self.store
            .add_columns(
                physical,
                &[ColumnSpec::new(column.to_string(), column_type)],
            )
            .await
    }

    async fn create_batch(
        &self,
        physical: &str,
        batch: &[&FlatRow],
        stats: &mut TableUpsertStats,
    ) -> Result<(), SyncAbort> {
        let payload = Self::normalize_batch(batch);
        let mut healed = false;
        loop {
            match self.store.create_rows(physical, &payload).await {
                Ok(ids) => {
                    stats.created += ids.len();
                    return Ok(());
                }
                Err(StoreError::UnknownColumn { column, .. }) if !healed => {
                    healed = true;
                    self.heal_unknown_column(physical, &column, batch)
                        .await
                        .map_err(SyncAbort::Store)?;
                }
                Err(err) if err.is_credential() => return Err(SyncAbort::Store(err)),
                Err(err) => {
                    if batch.len() == 1 {
                        warn!(table = physical, error = %err, "row rejected");
                        stats.failed_rows += 1;
                        if let Some(number) = submission_of(&batch[0].identity) {
                            stats.failed_submissions.insert(number);
                        }
                        return Ok(());
                    }
                    warn!(table = physical, rows = batch.len(), error = %err, "bulk create failed, retrying rows individually");
                    for row in batch {
                        Box::pin(self.create_batch(physical, &[*row], stats)).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn update_batch(
        &self,
        physical: &str,
        batch: &[(i64, &FlatRow)],
        stats: &mut TableUpsertStats,
    ) -> Result<(), SyncAbort> {
        let rows: Vec<&FlatRow> = batch.iter().map(|(_, row)| *row).collect();
        let payload: Vec<(i64, RowFields)> = batch
            .iter()
            .map(|(row_id, _)| *row_id)
            .zip(Self::normalize_batch(&rows))
            .collect();
        let mut healed = false;
        loop {
            match self.store.update_rows(physical, &payload).await {
                Ok(()) => {
                    stats.updated += batch.len();
                    return Ok(());
                }
                Err(StoreError::UnknownColumn { column, .. }) if !healed => {
                    healed = true;
                    self.heal_unknown_column(physical, &column, &rows)
                        .await
                        .map_err(SyncAbort::Store)?;
                }
                Err(err) if err.is_credential() => return Err(SyncAbort::Store(err)),
                Err(err) => {
                    if batch.len() == 1 {
                        warn!(table = physical, error = %err, "row update rejected");
                        stats.failed_rows += 1;
                        if let Some(number) = submission_of(&batch[0].1.identity) {
                            stats.failed_submissions.insert(number);
                        }
                        return Ok(());
                    }
                    warn!(table = physical, rows = batch.len(), error = %err, "bulk update failed, retrying rows individually");
                    for entry in batch {
                        Box::pin(self.update_batch(physical, &[*entry], stats)).await?;
                    }
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch pool
// ---------------------------------------------------------------------------

/// Fetches full submissions through a bounded pool. Per-submission
/// failures are collected, not fatal.
async fn fetch_submissions(
    source: Arc<dyn SubmissionSource>,
    numbers: &[i64],
    workers: usize,
) -> (Vec<Submission>, Vec<i64>) {
    let limit = Arc::new(Semaphore::new(workers.max(1)));
    let mut pool = JoinSet::new();
    for &number in numbers {
        let source = Arc::clone(&source);
        let limit = Arc::clone(&limit);
        pool.spawn(async move {
            let _permit = match limit.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        number,
                        Err(SourceError::Api("fetch pool closed".to_string())),
                    )
                }
            };
            (number, source.fetch_submission(number).await)
        });
    }

    let mut fetched = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok((_, Ok(submission))) => fetched.push(submission),
            Ok((number, Err(err))) => {
                warn!(submission = number, error = %err, "fetch failed");
                failed.push(number);
            }
            Err(err) => warn!(error = %err, "fetch task panicked"),
        }
    }
    fetched.sort_by_key(|s| s.number);
    failed.sort_unstable();
    (fetched, failed)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct SyncPipeline {
    source: Arc<dyn SubmissionSource>,
    store: Arc<dyn TableStore>,
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn SubmissionSource>,
        store: Arc<dyn TableStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    async fn list_submission_numbers(&self, filters: &SyncFilters) -> Result<Vec<i64>, SyncAbort> {
        let mut numbers = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .source
                .fetch_submission_ids_page(self.config.form_id, filters, cursor.as_deref())
                .await
                .map_err(|err| {
                    if err.is_credential() {
                        SyncAbort::SourceCredentials(err)
                    } else {
                        SyncAbort::Listing(err)
                    }
                })?;
            numbers.extend(page.numbers);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(numbers)
    }

    async fn resolve_schema(&self, samples: &[Submission]) -> Result<DescriptorForest, SyncAbort> {
        match self.source.fetch_schema(self.config.form_id).await {
            Ok(forest) => Ok(forest),
            Err(err) if err.is_credential() => Err(SyncAbort::SourceCredentials(err)),
            Err(err) if !samples.is_empty() => {
                warn!(error = %err, "schema query failed, rebuilding from sampled submissions");
                Ok(forest_from_samples(samples.iter().take(3)))
            }
            Err(err) => Err(SyncAbort::SchemaUnavailable(err)),
        }
    }

    /// One full run: list, fetch, schema, flatten, upsert. Returns the
    /// outcome summary; only whole-run failures become errors.
    pub async fn run(&self, filters: &SyncFilters) -> Result<SyncOutcome, SyncAbort> {
        let run_id = Uuid::new_v4();
        info!(form_id = self.config.form_id, run_id = %run_id, "sync run started");

        let numbers = self.list_submission_numbers(filters).await?;
        let total = numbers.len();
        let (submissions, failed_fetch) =
            fetch_submissions(Arc::clone(&self.source), &numbers, self.config.fetch_workers)
                .await;

        let forest = self.resolve_schema(&submissions).await?;
        let (catalog, problematic) =
            build_catalog_with_limit(&forest, self.config.max_column_id_len);

        let synchronizer = SchemaSynchronizer::new(&*self.store, self.config.form_id);
        let table_map = synchronizer.synchronize(&catalog).await?;

        let mut rows_by_table: BTreeMap<String, Vec<FlatRow>> = BTreeMap::new();
        for submission in &submissions {
            for row in flatten_submission(
                submission,
                &catalog,
                &problematic,
                self.config.max_column_id_len,
            ) {
                rows_by_table.entry(row.table.clone()).or_default().push(row);
            }
        }

        if self.config.sync_reviewers {
            match self.source.fetch_reviewer_roster(self.config.form_id).await {
                Ok(groups) => {
                    rows_by_table
                        .entry(TABLE_REVIEWERS.to_string())
                        .or_default()
                        .extend(reviewer_rows(&groups));
                }
                Err(err) => warn!(error = %err, "reviewer roster unavailable, skipping"),
            }
        }

        let engine = UpsertEngine::new(&*self.store);
        let mut failed_submissions: HashSet<i64> = failed_fetch.iter().copied().collect();
        for (logical, physical) in &table_map {
            let Some(rows) = rows_by_table.remove(logical) else {
                continue;
            };
            let section = catalog
                .section_tables
                .contains(logical)
                .then_some(logical.as_str());
            let batch_size = if section.is_some() {
                self.config.section_batch_size
            } else {
                self.config.batch_size
            };
            // The flat-field table mixes shapes across schema revisions;
            // it is written row by row.
            let row_by_row = logical == TABLE_FIELDS;
            let stats = engine
                .upsert(physical, section, &rows, batch_size, row_by_row)
                .await?;
            info!(
                table = %physical,
                created = stats.created,
                updated = stats.updated,
                failed = stats.failed_rows,
                "table upserted"
            );
            failed_submissions.extend(stats.failed_submissions);
        }

        let outcome = SyncOutcome::build(self.config.form_id, total, failed_submissions.len());
        info!(run_id = %run_id, message = %outcome.message, "sync run finished");
        Ok(outcome)
    }
}

/// Convenience entry point for one-shot runs.
pub async fn run_sync(
    source: Arc<dyn SubmissionSource>,
    store: Arc<dyn TableStore>,
    config: SyncConfig,
    filters: &SyncFilters,
) -> Result<SyncOutcome, SyncAbort> {
    SyncPipeline::new(source, store, config).run(filters).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use formgrid_core::{GeoIdentity, TABLE_SUBMISSIONS};
    use formgrid_source::FixtureSource;
    use formgrid_store::{column, MemoryStore};
    use serde_json::json;

    fn mk_descriptor(id: &str, kind: FieldKind, label: &str) -> FieldDescriptor {
        FieldDescriptor {
            id: id.to_string(),
            kind,
            label: label.to_string(),
            required: false,
            sub_descriptors: Vec::new(),
        }
    }

    fn mk_forest() -> DescriptorForest {
        DescriptorForest {
            fields: vec![
                mk_descriptor("f1", FieldKind::Text, "Nom"),
                FieldDescriptor {
                    sub_descriptors: vec![mk_descriptor("f2", FieldKind::Text, "Prénom")],
                    ..mk_descriptor("rep", FieldKind::Repetition, "Enfants")
                },
            ],
            annotations: Vec::new(),
        }
    }

    fn mk_text_instance(id: &str, label: &str, value: &str) -> FieldInstance {
        FieldInstance {
            id: id.to_string(),
            kind: FieldKind::Text,
            label: label.to_string(),
            string_value: Some(value.to_string()),
            ..FieldInstance::default()
        }
    }

    fn mk_submission(number: i64, name: &str, children: &[&str]) -> Submission {
        let section = FieldInstance {
            id: "rep".to_string(),
            kind: FieldKind::Repetition,
            label: "Enfants".to_string(),
            rows: children
                .iter()
                .enumerate()
                .map(|(i, child)| formgrid_core::SectionIteration {
                    id: format!("row-{number}-{i}"),
                    fields: vec![mk_text_instance("f2", "Prénom", child)],
                })
                .collect(),
            ..FieldInstance::default()
        };
        Submission {
            number,
            state: "accepte".to_string(),
            submitted_at: Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single(),
            fields: vec![mk_text_instance("f1", "Nom", name), section],
            ..Submission::default()
        }
    }

    fn mk_record_row(table: &str, number: i64, value: JsonValue) -> FlatRow {
        let mut row = FlatRow::new(
            table,
            RowIdentity::Record {
                submission_number: number,
            },
        );
        row.set("submission_number", json!(number));
        row.set("payload", value);
        row
    }

    #[test]
    fn row_keys_are_ordered_most_specific_first() {
        let identity = RowIdentity::SectionRow {
            submission_number: 12,
            section: "enfants".to_string(),
            row_index: 2,
            row_id: "RowA_geo1".to_string(),
            geo: Some(GeoIdentity {
                field: "emprise".to_string(),
                geo_id: "g1".to_string(),
            }),
        };
        assert_eq!(
            row_keys(&identity),
            vec![
                "12_enfants_RowA_geo1".to_string(),
                "12_enfants_rowa_geo1".to_string(),
                "12_enfants_index_2".to_string(),
                "RowA_geo1".to_string(),
                "12_enfants_geo_g1".to_string(),
            ]
        );
    }

    #[test]
    fn existing_index_matches_rows_written_with_older_key_layouts() {
        let stored = vec![StoredRow {
            row_id: 41,
            fields: [
                ("record_key".to_string(), json!(12)),
                ("row_index".to_string(), json!(2)),
                ("row_id".to_string(), json!("RowA")),
            ]
            .into_iter()
            .collect(),
        }];
        let index = ExistingRowIndex::from_rows(Some("enfants"), &stored);
        let identity = RowIdentity::SectionRow {
            submission_number: 12,
            section: "enfants".to_string(),
            row_index: 7,
            row_id: "rowa".to_string(),
            geo: None,
        };
        // only the lowercase full key matches
        assert_eq!(index.lookup(&row_keys(&identity)), Some(41));
    }

    #[tokio::test]
    async fn bulk_failure_falls_back_to_individual_rows() {
        let store = MemoryStore::new();
        store
            .create_table(
                "t",
                &[
                    column("submission_number", ColumnType::Int),
                    column("payload", ColumnType::Text),
                ],
            )
            .await
            .unwrap();

        let mut rows: Vec<FlatRow> = (1..=49)
            .map(|n| mk_record_row("t", n, json!(format!("value {n}"))))
            .collect();
        // one malformed row poisons the bulk call
        rows.push(mk_record_row("t", 50, json!({"not": "a scalar"})));

        let engine = UpsertEngine::new(&store);
        let stats = engine.upsert("t", None, &rows, 100, false).await.unwrap();
        assert_eq!(stats.created, 49);
        assert_eq!(stats.failed_rows, 1);
        assert_eq!(stats.failed_submissions, HashSet::from([50]));
        assert_eq!(store.row_count("t").await, 49);
    }

    #[tokio::test]
    async fn unknown_column_is_healed_and_retried() {
        let store = MemoryStore::new();
        store
            .create_table("t", &[column("submission_number", ColumnType::Int)])
            .await
            .unwrap();

        let rows = vec![mk_record_row("t", 1, json!("hello"))];
        let engine = UpsertEngine::new(&store);
        let stats = engine.upsert("t", None, &rows, 100, false).await.unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.failed_rows, 0);
        let columns = store.column_ids("t").await.unwrap();
        assert!(columns.contains(&"payload".to_string()));
    }

    #[tokio::test]
    async fn second_pass_updates_instead_of_duplicating() {
        let store = MemoryStore::new();
        store
            .create_table(
                "t",
                &[
                    column("submission_number", ColumnType::Int),
                    column("payload", ColumnType::Text),
                ],
            )
            .await
            .unwrap();
        let engine = UpsertEngine::new(&store);

        let rows = vec![mk_record_row("t", 1, json!("first"))];
        engine.upsert("t", None, &rows, 100, false).await.unwrap();
        let rows = vec![mk_record_row("t", 1, json!("second"))];
        let stats = engine.upsert("t", None, &rows, 100, false).await.unwrap();

        assert_eq!(stats.created, 0);
        assert_eq!(stats.updated, 1);
        assert_eq!(store.row_count("t").await, 1);
        let stored = store.list_rows("t").await.unwrap();
        assert_eq!(stored[0].fields.get("payload"), Some(&json!("second")));
    }

    #[tokio::test]
    async fn update_pads_missing_fields_to_the_batch_union() {
        let store = MemoryStore::new();
        store
            .create_table(
                "t",
                &[
                    column("submission_number", ColumnType::Int),
                    column("payload", ColumnType::Text),
                ],
            )
            .await
            .unwrap();
        let engine = UpsertEngine::new(&store);

        let rows = vec![
            mk_record_row("t", 1, json!("stale")),
            mk_record_row("t", 2, json!("old")),
        ];
        engine.upsert("t", None, &rows, 100, false).await.unwrap();

        // submission 1 no longer carries the field, submission 2 still does
        let mut bare = FlatRow::new(
            "t",
            RowIdentity::Record {
                submission_number: 1,
            },
        );
        bare.set("submission_number", json!(1));
        let rows = vec![bare, mk_record_row("t", 2, json!("new"))];
        let stats = engine.upsert("t", None, &rows, 100, false).await.unwrap();
        assert_eq!(stats.updated, 2);

        let stored = store.list_rows("t").await.unwrap();
        let payload_of = |n: i64| {
            stored
                .iter()
                .find(|r| r.fields.get("submission_number") == Some(&json!(n)))
                .and_then(|r| r.fields.get("payload"))
                .cloned()
        };
        assert_eq!(payload_of(1), Some(JsonValue::Null));
        assert_eq!(payload_of(2), Some(json!("new")));
    }

    #[tokio::test]
    async fn schema_sync_adds_only_the_missing_column() {
        let store = MemoryStore::new();
        // pre-existing header table from an older schema, one column short
        let mut header: Vec<ColumnSpec> = vec![
            column("submission_number", ColumnType::Int),
            column("state", ColumnType::Text),
            column("archived", ColumnType::Bool),
            column("applicant_email", ColumnType::Text),
            column("submitted_at", ColumnType::DateTime),
            column("updated_at", ColumnType::DateTime),
            column("processed_at", ColumnType::DateTime),
            column("motivation", ColumnType::Text),
            column("labels_json", ColumnType::Text),
        ];
        store
            .create_table("form_7_submissions", &header)
            .await
            .unwrap();

        let (catalog, _) = formgrid_core::build_catalog(&mk_forest());
        let synchronizer = SchemaSynchronizer::new(&store, 7);
        let mapping = synchronizer.synchronize(&catalog).await.unwrap();

        assert_eq!(
            mapping.get(TABLE_SUBMISSIONS),
            Some(&"form_7_submissions".to_string())
        );
        header.push(column("label_names", ColumnType::Text));
        let ids = store.column_ids("form_7_submissions").await.unwrap();
        for spec in &header {
            assert!(ids.contains(&spec.id), "missing {}", spec.id);
        }
        assert!(mapping.contains_key("enfants"));
        assert_eq!(
            mapping.get("enfants"),
            Some(&"form_7_section_enfants".to_string())
        );
    }

    #[tokio::test]
    async fn pipeline_run_is_idempotent() {
        let source = Arc::new(FixtureSource::new(
            mk_forest(),
            vec![
                mk_submission(1, "Durand", &["Alice", "Benoît"]),
                mk_submission(2, "Martin", &[]),
            ],
        ));
        let store = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::new(
            source,
            Arc::clone(&store) as Arc<dyn TableStore>,
            SyncConfig::new(7),
        );

        let first = pipeline.run(&SyncFilters::default()).await.unwrap();
        assert!(first.success);
        assert_eq!(first.success_count, 2);
        assert_eq!(first.total_processed, 2);
        let header_rows = store.row_count("form_7_submissions").await;
        let section_rows = store.row_count("form_7_section_enfants").await;
        assert_eq!(header_rows, 2);
        assert_eq!(section_rows, 2);

        let second = pipeline.run(&SyncFilters::default()).await.unwrap();
        assert!(second.success);
        assert_eq!(store.row_count("form_7_submissions").await, header_rows);
        assert_eq!(store.row_count("form_7_section_enfants").await, section_rows);
    }

    #[tokio::test]
    async fn per_submission_fetch_failures_are_counted_not_fatal() {
        let mut fixture = FixtureSource::new(
            mk_forest(),
            vec![
                mk_submission(1, "Durand", &[]),
                mk_submission(2, "Martin", &[]),
                mk_submission(3, "Petit", &[]),
            ],
        );
        fixture.failing.insert(2);
        let store = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::new(
            Arc::new(fixture),
            Arc::clone(&store) as Arc<dyn TableStore>,
            SyncConfig::new(7),
        );

        let outcome = pipeline.run(&SyncFilters::default()).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.total_processed, 3);
        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.error_count, 1);
        assert!(outcome.message.contains("1 failed"));
        assert_eq!(store.row_count("form_7_submissions").await, 2);
    }

    #[tokio::test]
    async fn schema_outage_falls_back_to_sampled_submissions() {
        let mut fixture = FixtureSource::new(
            mk_forest(),
            vec![mk_submission(1, "Durand", &["Alice"])],
        );
        fixture.schema_unavailable = true;
        let store = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::new(
            Arc::new(fixture),
            Arc::clone(&store) as Arc<dyn TableStore>,
            SyncConfig::new(7),
        );

        let outcome = pipeline.run(&SyncFilters::default()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(store.row_count("form_7_section_enfants").await, 1);
        let ids = store.column_ids("form_7_section_enfants").await.unwrap();
        assert!(ids.contains(&"prenom".to_string()));
    }

    #[test]
    fn sampled_forest_merges_section_fields_across_rows() {
        let submission = mk_submission(1, "Durand", &["Alice", "Benoît"]);
        let forest = forest_from_samples([&submission]);
        assert_eq!(forest.fields.len(), 2);
        let section = forest
            .fields
            .iter()
            .find(|d| d.kind == FieldKind::Repetition)
            .unwrap();
        assert_eq!(section.sub_descriptors.len(), 1);
        assert_eq!(section.sub_descriptors[0].label, "Prénom");
    }

    #[test]
    fn inferred_types_match_sampled_values() {
        assert_eq!(infer_column_type(&json!(true)), ColumnType::Bool);
        assert_eq!(infer_column_type(&json!(3)), ColumnType::Int);
        assert_eq!(infer_column_type(&json!(3.5)), ColumnType::Numeric);
        assert_eq!(
            infer_column_type(&json!("2024-03-05T10:30:00Z")),
            ColumnType::DateTime
        );
        assert_eq!(infer_column_type(&json!("bonjour")), ColumnType::Text);
    }
}
