use std::io::Read;
use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{Context, Result};
use metadata_manager_core::{
    Delta, EntityKind, FieldMap, FieldPatch, FilterRegistry, HistoryEntry, KeywordQuery,
    MetadataError, Record, RecordId,
};
use metadata_manager_store_sqlite::{
    IntegrityReport, ProjectDetail, SchemaStatus, SqliteStore, StateChangeEvent,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Raw `name=value` assignments, parsed against the kind's schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRecordRequest {
    pub kind: EntityKind,
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecordRequest {
    pub id: RecordId,
    pub set: Vec<(String, String)>,
    pub unset: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRecordsRequest {
    pub kind: EntityKind,
    pub keywords: Vec<(String, String)>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListRecordsResult {
    pub kind: EntityKind,
    pub ignored_keys: Vec<String>,
    /// Rows read from the store before the limit was met or the kind ran out.
    pub scanned: usize,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryResult {
    pub record_id: RecordId,
    pub entries: Vec<HistoryEntry>,
}

/// Outcome of a CSV import, one identifier per data row in file order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub kind: EntityKind,
    pub rows: usize,
    pub created: Vec<RecordId>,
    pub updated: Vec<RecordId>,
    pub unchanged: Vec<RecordId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChangesResult {
    pub events: Vec<StateChangeEvent>,
    /// Pass back as `after` to continue from this page.
    pub cursor: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MetadataManagerApi {
    db_path: PathBuf,
    filters: FilterRegistry,
}

impl MetadataManagerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, filters: FilterRegistry::standard() }
    }

    /// Replace the keyword filter registry used by [`Self::list_records`].
    #[must_use]
    pub fn with_filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = filters;
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run the store's integrity checks.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Create one record from raw field assignments.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when an assignment names an undeclared field,
    /// fails to parse, or the resulting record is invalid.
    pub fn create_record(&self, input: CreateRecordRequest) -> Result<Record> {
        let pairs = input.fields.iter().map(|(name, value)| (name.as_str(), value.as_str()));
        let fields = input.kind.schema().parse_fields(pairs)?;
        let mut store = self.open_migrated()?;
        store.create_record(input.kind, fields)
    }

    /// Set and unset fields on an existing record.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] for an unknown record and
    /// [`MetadataError::Validation`] for bad assignments or an invalid result.
    pub fn update_record(&self, input: UpdateRecordRequest) -> Result<Record> {
        let mut store = self.open_migrated()?;
        let current = store.get_record(input.id)?;
        let patch = build_patch(current.kind, &input.set, &input.unset)?;
        store.update_record(input.id, &patch)
    }

    /// Load rows of `kind` from CSV and upsert them by external identifier.
    ///
    /// The header names the fields. Empty cells are skipped, so a row for an existing
    /// record only sets the columns it fills. Every row is parsed and validated before
    /// anything is written; each row is then committed through the ordinary create or
    /// update path, which records history and a state-change event.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] naming the CSV line for malformed input,
    /// unknown columns, unparsable values or rows missing the identifier. A reference or
    /// uniqueness failure while writing stops the import at that line; earlier rows stay
    /// committed.
    pub fn import_csv<R: Read>(&self, kind: EntityKind, reader: R) -> Result<ImportSummary> {
        let rows = read_csv_rows(kind, reader)?;
        let schema = kind.schema();
        let mut store = self.open_migrated()?;
        let mut summary = ImportSummary {
            kind,
            rows: rows.len(),
            created: Vec::new(),
            updated: Vec::new(),
            unchanged: Vec::new(),
        };

        for (line, fields) in rows {
            let existing = match schema.external_id(&fields) {
                Some(external_id) => store.find_by_external_id(kind, external_id)?,
                None => None,
            };
            match existing {
                None => {
                    let record = store
                        .create_record(kind, fields)
                        .with_context(|| format!("csv line {line}"))?;
                    summary.created.push(record.id);
                }
                Some(current) => {
                    let patch: FieldPatch =
                        fields.into_iter().map(|(name, value)| (name, Some(value))).collect();
                    let stored = store
                        .update_record(current.id, &patch)
                        .with_context(|| format!("csv line {line}"))?;
                    if stored == current {
                        summary.unchanged.push(current.id);
                    } else {
                        summary.updated.push(current.id);
                    }
                }
            }
        }

        tracing::info!(
            %kind,
            rows = summary.rows,
            created = summary.created.len(),
            updated = summary.updated.len(),
            unchanged = summary.unchanged.len(),
            "imported csv"
        );
        Ok(summary)
    }

    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record does not exist.
    pub fn get_record(&self, id: RecordId) -> Result<Record> {
        self.open_migrated()?.get_record(id)
    }

    /// List records of one kind filtered by keyword pairs.
    ///
    /// Rows are streamed from the store and reading stops once `limit` matches are held.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when a keyword value for a typed field fails
    /// to parse.
    pub fn list_records(&self, input: ListRecordsRequest) -> Result<ListRecordsResult> {
        let query = KeywordQuery::from_pairs(input.keywords);
        let compiled = self.filters.compile(input.kind, &query)?;
        if !compiled.ignored_keys().is_empty() {
            tracing::debug!(
                kind = %input.kind,
                ignored = ?compiled.ignored_keys(),
                "ignored keyword keys"
            );
        }

        let store = self.open_migrated()?;
        let limit = input.limit.unwrap_or(usize::MAX);
        let mut records = Vec::new();
        let scanned = if limit == 0 {
            0
        } else {
            store.scan_records(input.kind, |record| {
                if compiled.matches(&record) {
                    records.push(record);
                }
                if records.len() >= limit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })?
        };

        tracing::debug!(kind = %input.kind, scanned, matched = records.len(), "listed records");
        Ok(ListRecordsResult {
            kind: input.kind,
            ignored_keys: compiled.ignored_keys().to_vec(),
            scanned,
            records,
        })
    }

    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record does not exist.
    pub fn history(&self, id: RecordId) -> Result<HistoryResult> {
        let entries = self.open_migrated()?.history(id)?;
        Ok(HistoryResult { record_id: id, entries })
    }

    /// Diff the latest entry of a record against its predecessor.
    ///
    /// With `allow_initial`, a record with a single entry is diffed against nothing
    /// instead of failing.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record has no history, or has no prior
    /// entry and `allow_initial` is false.
    pub fn diff_latest(&self, id: RecordId, allow_initial: bool) -> Result<Delta> {
        let store = self.open_migrated()?;
        if allow_initial {
            store.diff_latest_or_initial(id)
        } else {
            store.diff_latest(id)
        }
    }

    /// Page through state-change events after the `after` cursor.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or read.
    pub fn state_changes(&self, after: Option<i64>, limit: usize) -> Result<StateChangesResult> {
        let events = self.open_migrated()?.state_changes(after, limit)?;
        let cursor = events.last().map(|event| event.sequence).or(after);
        Ok(StateChangesResult { events, cursor })
    }

    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the project does not exist.
    pub fn project_detail(&self, project_id: RecordId) -> Result<ProjectDetail> {
        self.open_migrated()?.project_detail(project_id)
    }

    /// # Errors
    /// Returns [`MetadataError::NotFound`] when either record is missing or of the wrong kind.
    pub fn link_contact(
        &self,
        project_id: RecordId,
        contact_id: RecordId,
    ) -> Result<ProjectDetail> {
        self.open_migrated()?.link_contact(project_id, contact_id)
    }

    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the project is missing or the contact is not
    /// associated with it.
    pub fn remove_contact(
        &self,
        project_id: RecordId,
        contact_id: RecordId,
    ) -> Result<ProjectDetail> {
        self.open_migrated()?.remove_contact(project_id, contact_id)
    }
}

fn build_patch(
    kind: EntityKind,
    set: &[(String, String)],
    unset: &[String],
) -> Result<FieldPatch, MetadataError> {
    let schema = kind.schema();
    let mut patch = FieldPatch::new();
    let pairs = set.iter().map(|(name, value)| (name.as_str(), value.as_str()));
    for (name, value) in schema.parse_fields(pairs)? {
        patch.insert(name, Some(value));
    }

    for name in unset {
        let spec = schema.field(name).ok_or_else(|| {
            MetadataError::Validation(format!("{kind} has no field named {name:?}"))
        })?;
        if patch.insert(spec.name.to_string(), None).is_some() {
            return Err(MetadataError::Validation(format!(
                "{kind}.{name} cannot be both set and unset"
            )));
        }
    }
    Ok(patch)
}

/// Parse and validate every data row, keyed by its line in the file.
fn read_csv_rows<R: Read>(kind: EntityKind, reader: R) -> Result<Vec<(u64, FieldMap)>> {
    let schema = kind.schema();
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::Headers).from_reader(reader);
    let headers = csv_reader.headers().map_err(malformed_csv)?.clone();
    if let Some(unknown) = headers.iter().find(|name| schema.field(name).is_none()) {
        return Err(MetadataError::Validation(format!("{kind} has no column {unknown:?}")).into());
    }

    let mut rows = Vec::new();
    for result in csv_reader.records() {
        let row = result.map_err(malformed_csv)?;
        let line = row.position().map_or(0, csv::Position::line);
        let cells = headers.iter().zip(row.iter()).filter(|(_, raw)| !raw.trim().is_empty());
        let fields = schema
            .parse_fields(cells)
            .and_then(|fields| schema.validate_fields(&fields).map(|()| fields))
            .map_err(|err| MetadataError::Validation(format!("line {line}: {}", err.detail())))?;
        rows.push((line, fields));
    }
    Ok(rows)
}

fn malformed_csv(err: csv::Error) -> anyhow::Error {
    MetadataError::Validation(format!("malformed CSV: {err}")).into()
}
