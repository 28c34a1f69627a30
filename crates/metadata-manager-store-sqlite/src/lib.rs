use std::ops::ControlFlow;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use metadata_manager_core::{
    diff, merge_fields, Delta, EntityKind, FieldMap, FieldPatch, HistoryEntry, HistoryId,
    HistoryType, MetadataError, Record, RecordId,
};
use rusqlite::{params, Connection, OptionalExtension, Params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 3;

/// Tracing target for state-change notifications, so subscribers can route them apart
/// from diagnostics.
pub const STATE_CHANGE_TARGET: &str = "metadata_state_change";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  record_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (
    kind IN ('project','contact','subject','library','sample','individual')
  ),
  external_id TEXT NOT NULL,
  fields_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(kind, external_id)
);

CREATE TABLE IF NOT EXISTS record_history (
  history_id TEXT PRIMARY KEY,
  record_id TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (
    kind IN ('project','contact','subject','library','sample','individual')
  ),
  position INTEGER NOT NULL CHECK (position >= 1),
  history_type TEXT NOT NULL CHECK (history_type IN ('created','updated')),
  recorded_at TEXT NOT NULL,
  fields_json TEXT NOT NULL,
  UNIQUE(record_id, position),
  FOREIGN KEY (record_id) REFERENCES records(record_id)
);

CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);
CREATE INDEX IF NOT EXISTS idx_record_history_record ON record_history(record_id, position);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS project_contacts (
  project_id TEXT NOT NULL,
  contact_id TEXT NOT NULL,
  linked_at TEXT NOT NULL,
  PRIMARY KEY (project_id, contact_id),
  FOREIGN KEY (project_id) REFERENCES records(record_id),
  FOREIGN KEY (contact_id) REFERENCES records(record_id)
);

CREATE INDEX IF NOT EXISTS idx_project_contacts_contact ON project_contacts(contact_id);
";

const MIGRATION_003_SQL: &str = r"
CREATE TABLE IF NOT EXISTS state_change_events (
  sequence INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  action TEXT NOT NULL CHECK (action IN ('CREATE','UPDATE')),
  record_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  position INTEGER NOT NULL,
  recorded_at TEXT NOT NULL,
  fields_json TEXT NOT NULL,
  UNIQUE(record_id, position),
  FOREIGN KEY (record_id) REFERENCES records(record_id)
);
";

const MIGRATIONS: [(i64, &str); 3] =
    [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL), (3, MIGRATION_003_SQL)];

const SELECT_RECORD_SQL: &str = "SELECT
    record_id, kind, fields_json, created_at, updated_at
 FROM records";

const SELECT_HISTORY_SQL: &str = "SELECT
    history_id, record_id, kind, position, history_type, recorded_at, fields_json
 FROM record_history";

const SELECT_STATE_CHANGE_SQL: &str = "SELECT
    sequence, event_id, action, record_id, kind, position, recorded_at, fields_json
 FROM state_change_events";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Records whose history positions are not exactly `1..=n`.
    pub history_gaps: Vec<RecordId>,
    pub schema_status: SchemaStatus,
}

/// A project together with its associated contacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectDetail {
    pub project: Record,
    pub contacts: Vec<Record>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateChangeAction {
    Create,
    Update,
}

impl StateChangeAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            _ => None,
        }
    }
}

impl From<HistoryType> for StateChangeAction {
    fn from(history_type: HistoryType) -> Self {
        match history_type {
            HistoryType::Created => Self::Create,
            HistoryType::Updated => Self::Update,
        }
    }
}

/// Outbox row written in the same transaction as the history entry it announces.
///
/// `sequence` is strictly increasing and serves as the consumer cursor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChangeEvent {
    pub sequence: i64,
    pub event_id: Ulid,
    pub action: StateChangeAction,
    pub record_id: RecordId,
    pub kind: EntityKind,
    pub position: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub fields: FieldMap,
}

/// Find the typed domain error anywhere in `err`'s context chain.
#[must_use]
pub fn error_kind(err: &anyhow::Error) -> Option<&MetadataError> {
    err.chain().find_map(|cause| cause.downcast_ref::<MetadataError>())
}

impl SqliteStore {
    /// Open a SQLite-backed metadata store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database is newer than this build or any migration fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in MIGRATIONS {
            if target > version {
                self.apply_migration(target, sql)?;
            }
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration v{version} transaction"))?;

        // Another connection may have applied it while we waited for the write lock.
        if current_schema_version(&tx)? >= version {
            return Ok(());
        }

        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;

        tracing::info!(version, "applied schema migration");
        Ok(())
    }

    /// Create a record and its first history entry in one transaction.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when the fields violate the kind's schema,
    /// reference missing records, or reuse an existing external identifier. Returns an
    /// error when persistence fails.
    pub fn create_record(&mut self, kind: EntityKind, fields: FieldMap) -> Result<Record> {
        let now = OffsetDateTime::now_utc();
        let record = Record { id: RecordId::new(), kind, fields, created_at: now, updated_at: now };
        record.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        check_references(&tx, &record)?;
        let external_id = check_unique_external_id(&tx, &record)?;

        tx.execute(
            "INSERT INTO records(record_id, kind, external_id, fields_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.to_string(),
                record.kind.as_str(),
                external_id,
                serde_json::to_string(&record.fields).context("failed to serialize fields")?,
                rfc3339(record.created_at)?,
                rfc3339(record.updated_at)?,
            ],
        )
        .context("failed to insert record")?;
        let entry = append_history(&tx, &record, HistoryType::Created)?;

        tx.commit().context("failed to commit create transaction")?;
        tracing::info!(
            record_id = %record.id,
            kind = %record.kind,
            position = entry.position,
            "created record"
        );
        Ok(record)
    }

    /// Apply a field patch and append a history entry when the field state changes.
    ///
    /// A patch that leaves every field as it was writes nothing and returns the stored record.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] for an unknown record and
    /// [`MetadataError::Validation`] when the merged state is invalid.
    pub fn update_record(&mut self, id: RecordId, patch: &FieldPatch) -> Result<Record> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;

        let current = load_record(&tx, id)?.ok_or_else(|| record_not_found(id))?;
        let fields = merge_fields(&current.fields, patch);
        if fields == current.fields {
            tracing::debug!(record_id = %id, "update left fields unchanged; no history appended");
            return Ok(current);
        }

        let updated = Record { fields, updated_at: OffsetDateTime::now_utc(), ..current };
        updated.validate()?;
        check_references(&tx, &updated)?;
        let external_id = check_unique_external_id(&tx, &updated)?;

        tx.execute(
            "UPDATE records SET external_id = ?2, fields_json = ?3, updated_at = ?4
             WHERE record_id = ?1",
            params![
                updated.id.to_string(),
                external_id,
                serde_json::to_string(&updated.fields).context("failed to serialize fields")?,
                rfc3339(updated.updated_at)?,
            ],
        )
        .context("failed to update record")?;
        let entry = append_history(&tx, &updated, HistoryType::Updated)?;

        tx.commit().context("failed to commit update transaction")?;
        tracing::info!(record_id = %id, position = entry.position, "updated record");
        Ok(updated)
    }

    /// Load one record by identifier.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when no record has this identifier.
    pub fn get_record(&self, id: RecordId) -> Result<Record> {
        load_record(&self.conn, id)?.ok_or_else(|| record_not_found(id))
    }

    /// Look a record up by the external identifier its kind declares.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_by_external_id(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<Record>> {
        let sql = format!("{SELECT_RECORD_SQL} WHERE kind = ?1 AND external_id = ?2");
        let records = query_records(&self.conn, &sql, params![kind.as_str(), external_id])?;
        Ok(records.into_iter().next())
    }

    /// Load all records of one kind ordered by identifier (creation order).
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_records(&self, kind: EntityKind) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        self.scan_records(kind, |record| {
            records.push(record);
            ControlFlow::Continue(())
        })?;
        Ok(records)
    }

    /// Stream records of one kind in identifier order, decoding one row at a time, until
    /// `visit` breaks. Returns the number of records handed to `visit`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn scan_records<F>(&self, kind: EntityKind, mut visit: F) -> Result<usize>
    where
        F: FnMut(Record) -> ControlFlow<()>,
    {
        let sql = format!("{SELECT_RECORD_SQL} WHERE kind = ?1 ORDER BY record_id ASC");
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare record scan")?;
        let mut rows = stmt.query(params![kind.as_str()]).context("failed to scan records")?;

        let mut scanned = 0;
        while let Some(row) = rows.next().context("failed to read record row")? {
            scanned += 1;
            let record = RecordRow::from_row(row).context("failed to read record row")?.decode()?;
            if visit(record).is_break() {
                break;
            }
        }
        Ok(scanned)
    }

    /// All history entries of a record, newest first.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record does not exist.
    pub fn history(&self, id: RecordId) -> Result<Vec<HistoryEntry>> {
        if load_record(&self.conn, id)?.is_none() {
            return Err(record_not_found(id));
        }
        query_history(
            &self.conn,
            &format!("{SELECT_HISTORY_SQL} WHERE record_id = ?1 ORDER BY position DESC"),
            params![id.to_string()],
        )
    }

    /// The entry with the highest position for `id`.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record has no history.
    pub fn latest(&self, id: RecordId) -> Result<HistoryEntry> {
        let sql =
            format!("{SELECT_HISTORY_SQL} WHERE record_id = ?1 ORDER BY position DESC LIMIT 1");
        let entries = query_history(&self.conn, &sql, params![id.to_string()])?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| MetadataError::NotFound(format!("no history for record {id}")).into())
    }

    /// The entry one position below `entry`, or `None` when `entry` is the first.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or the stored history has a gap.
    pub fn predecessor(&self, entry: &HistoryEntry) -> Result<Option<HistoryEntry>> {
        if entry.is_initial() {
            return Ok(None);
        }
        let position = entry.position - 1;
        self.find_entry(entry.record_id, position)?.map(Some).ok_or_else(|| {
            anyhow!("history for record {} is missing position {position}", entry.record_id)
        })
    }

    /// The entry at an explicit position.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record has no entry at `position`.
    pub fn entry_at(&self, id: RecordId, position: u32) -> Result<HistoryEntry> {
        let detail = format!("record {id} has no history entry at position {position}");
        self.find_entry(id, position)?.ok_or_else(|| MetadataError::NotFound(detail).into())
    }

    fn find_entry(&self, id: RecordId, position: u32) -> Result<Option<HistoryEntry>> {
        let sql = format!("{SELECT_HISTORY_SQL} WHERE record_id = ?1 AND position = ?2");
        let position = i64::from(position);
        let entries = query_history(&self.conn, &sql, params![id.to_string(), position])?;
        Ok(entries.into_iter().next())
    }

    /// Diff the latest entry of `id` against its immediate predecessor.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record has no history, or only its
    /// initial entry.
    pub fn diff_latest(&self, id: RecordId) -> Result<Delta> {
        let latest = self.latest(id)?;
        let Some(previous) = self.predecessor(&latest)? else {
            let detail = format!("record {id} has no prior history entry");
            return Err(MetadataError::NotFound(detail).into());
        };
        Ok(diff(&latest, Some(&previous))?)
    }

    /// Diff the latest entry of `id` against its predecessor, or against nothing when the
    /// latest entry is the initial one.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when the record has no history.
    pub fn diff_latest_or_initial(&self, id: RecordId) -> Result<Delta> {
        let latest = self.latest(id)?;
        let previous = self.predecessor(&latest)?;
        Ok(diff(&latest, previous.as_ref())?)
    }

    /// State-change events with a sequence above `after`, oldest first, at most `limit`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn state_changes(&self, after: Option<i64>, limit: usize) -> Result<Vec<StateChangeEvent>> {
        let sql =
            format!("{SELECT_STATE_CHANGE_SQL} WHERE sequence > ?1 ORDER BY sequence LIMIT ?2");
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare state change query")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![after.unwrap_or(0), limit], StateChangeRow::from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("failed to read state change row")?.decode()?);
        }
        Ok(events)
    }

    /// A project with its associated contacts.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] ("Project not found.") when `project_id` does
    /// not name a project.
    pub fn project_detail(&self, project_id: RecordId) -> Result<ProjectDetail> {
        load_project_detail(&self.conn, project_id)
    }

    /// Associate a contact with a project. Linking an existing pair is a no-op.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] when either identifier does not name a record of
    /// the expected kind.
    pub fn link_contact(
        &mut self,
        project_id: RecordId,
        contact_id: RecordId,
    ) -> Result<ProjectDetail> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        load_of_kind(&tx, project_id, EntityKind::Project)?;
        load_of_kind(&tx, contact_id, EntityKind::Contact)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO project_contacts(project_id, contact_id, linked_at)
                 VALUES (?1, ?2, ?3)",
                params![project_id.to_string(), contact_id.to_string(), now_rfc3339()?],
            )
            .context("failed to insert project contact")?;
        let detail = load_project_detail(&tx, project_id)?;

        tx.commit().context("failed to commit link transaction")?;
        tracing::info!(%project_id, %contact_id, inserted, "linked contact");
        Ok(detail)
    }

    /// Remove the association between a project and a contact. Neither record is touched.
    ///
    /// # Errors
    /// Returns [`MetadataError::NotFound`] with "Project not found." when the project is
    /// absent, and "Contact not found." when no association links the two.
    pub fn remove_contact(
        &mut self,
        project_id: RecordId,
        contact_id: RecordId,
    ) -> Result<ProjectDetail> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        load_of_kind(&tx, project_id, EntityKind::Project)?;

        let removed = tx
            .execute(
                "DELETE FROM project_contacts WHERE project_id = ?1 AND contact_id = ?2",
                params![project_id.to_string(), contact_id.to_string()],
            )
            .context("failed to delete project contact")?;
        if removed == 0 {
            return Err(MetadataError::NotFound("Contact not found.".to_string()).into());
        }
        let detail = load_project_detail(&tx, project_id)?;

        tx.commit().context("failed to commit unlink transaction")?;
        tracing::info!(%project_id, %contact_id, "removed contact from project");
        Ok(detail)
    }

    /// Run quick-check, foreign-key-check, history continuity, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let history_gaps =
            if schema_status.current_version >= 1 { self.history_gaps()? } else { Vec::new() };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            history_gaps,
            schema_status,
        })
    }

    fn history_gaps(&self) -> Result<Vec<RecordId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.record_id
                 FROM records r
                 LEFT JOIN record_history h ON h.record_id = r.record_id
                 GROUP BY r.record_id
                 HAVING COUNT(h.history_id) = 0
                     OR MIN(h.position) <> 1
                     OR MAX(h.position) <> COUNT(h.history_id)
                 ORDER BY r.record_id ASC",
            )
            .context("failed to prepare history continuity query")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut gaps = Vec::new();
        for row in rows {
            gaps.push(parse_record_id(&row?)?);
        }
        Ok(gaps)
    }
}

struct RecordRow {
    record_id: String,
    kind: String,
    fields_json: String,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            record_id: row.get(0)?,
            kind: row.get(1)?,
            fields_json: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn decode(self) -> Result<Record> {
        Ok(Record {
            id: parse_record_id(&self.record_id)?,
            kind: parse_kind(&self.kind)?,
            fields: serde_json::from_str(&self.fields_json)
                .context("failed to deserialize record fields")?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

struct HistoryRow {
    history_id: String,
    record_id: String,
    kind: String,
    position: i64,
    history_type: String,
    recorded_at: String,
    fields_json: String,
}

impl HistoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            history_id: row.get(0)?,
            record_id: row.get(1)?,
            kind: row.get(2)?,
            position: row.get(3)?,
            history_type: row.get(4)?,
            recorded_at: row.get(5)?,
            fields_json: row.get(6)?,
        })
    }

    fn decode(self) -> Result<HistoryEntry> {
        Ok(HistoryEntry {
            history_id: HistoryId(parse_ulid(&self.history_id)?),
            record_id: parse_record_id(&self.record_id)?,
            kind: parse_kind(&self.kind)?,
            position: parse_position(self.position)?,
            history_type: HistoryType::parse(&self.history_type)
                .ok_or_else(|| anyhow!("unknown history_type: {}", self.history_type))?,
            recorded_at: parse_rfc3339(&self.recorded_at)?,
            fields: serde_json::from_str(&self.fields_json)
                .context("failed to deserialize history fields")?,
        })
    }
}

struct StateChangeRow {
    sequence: i64,
    event_id: String,
    action: String,
    record_id: String,
    kind: String,
    position: i64,
    recorded_at: String,
    fields_json: String,
}

impl StateChangeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            event_id: row.get(1)?,
            action: row.get(2)?,
            record_id: row.get(3)?,
            kind: row.get(4)?,
            position: row.get(5)?,
            recorded_at: row.get(6)?,
            fields_json: row.get(7)?,
        })
    }

    fn decode(self) -> Result<StateChangeEvent> {
        Ok(StateChangeEvent {
            sequence: self.sequence,
            event_id: parse_ulid(&self.event_id)?,
            action: StateChangeAction::parse(&self.action)
                .ok_or_else(|| anyhow!("unknown state change action: {}", self.action))?,
            record_id: parse_record_id(&self.record_id)?,
            kind: parse_kind(&self.kind)?,
            position: parse_position(self.position)?,
            recorded_at: parse_rfc3339(&self.recorded_at)?,
            fields: serde_json::from_str(&self.fields_json)
                .context("failed to deserialize state change fields")?,
        })
    }
}

fn query_records<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare record query")?;
    let rows = stmt.query_map(params, RecordRow::from_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("failed to read record row")?.decode()?);
    }
    Ok(records)
}

fn query_history<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare history query")?;
    let rows = stmt.query_map(params, HistoryRow::from_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.context("failed to read history row")?.decode()?);
    }
    Ok(entries)
}

fn load_record(conn: &Connection, id: RecordId) -> Result<Option<Record>> {
    let sql = format!("{SELECT_RECORD_SQL} WHERE record_id = ?1");
    Ok(query_records(conn, &sql, params![id.to_string()])?.into_iter().next())
}

fn load_of_kind(conn: &Connection, id: RecordId, kind: EntityKind) -> Result<Record> {
    match load_record(conn, id)? {
        Some(record) if record.kind == kind => Ok(record),
        _ => Err(MetadataError::NotFound(format!("{} not found.", kind.label())).into()),
    }
}

fn load_project_detail(conn: &Connection, project_id: RecordId) -> Result<ProjectDetail> {
    let project = load_of_kind(conn, project_id, EntityKind::Project)?;
    let contacts = query_records(
        conn,
        "SELECT r.record_id, r.kind, r.fields_json, r.created_at, r.updated_at
         FROM project_contacts pc
         JOIN records r ON r.record_id = pc.contact_id
         WHERE pc.project_id = ?1
         ORDER BY r.record_id ASC",
        params![project_id.to_string()],
    )?;
    Ok(ProjectDetail { project, contacts })
}

/// Append the next history entry for `record` and its state-change event. Callers hold
/// an immediate transaction so the position read and the inserts are serialized against
/// other writers.
fn append_history(
    conn: &Connection,
    record: &Record,
    history_type: HistoryType,
) -> Result<HistoryEntry> {
    let next: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM record_history WHERE record_id = ?1",
            params![record.id.to_string()],
            |row| row.get(0),
        )
        .context("failed to compute next history position")?;

    let entry = HistoryEntry {
        history_id: HistoryId::new(),
        record_id: record.id,
        kind: record.kind,
        position: parse_position(next)?,
        history_type,
        recorded_at: record.updated_at,
        fields: record.fields.clone(),
    };
    let fields_json =
        serde_json::to_string(&entry.fields).context("failed to serialize history fields")?;
    let recorded_at = rfc3339(entry.recorded_at)?;

    conn.execute(
        "INSERT INTO record_history(
            history_id, record_id, kind, position, history_type, recorded_at, fields_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.history_id.to_string(),
            entry.record_id.to_string(),
            entry.kind.as_str(),
            next,
            entry.history_type.as_str(),
            recorded_at,
            fields_json,
        ],
    )
    .context("failed to insert history entry")?;
    tracing::debug!(record_id = %entry.record_id, position = entry.position, "appended history");

    let action = StateChangeAction::from(entry.history_type);
    let event_id = Ulid::new();
    conn.execute(
        "INSERT INTO state_change_events(
            event_id, action, record_id, kind, position, recorded_at, fields_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event_id.to_string(),
            action.as_str(),
            entry.record_id.to_string(),
            entry.kind.as_str(),
            next,
            recorded_at,
            fields_json,
        ],
    )
    .context("failed to insert state change event")?;
    tracing::info!(
        target: STATE_CHANGE_TARGET,
        %event_id,
        action = action.as_str(),
        kind = %entry.kind,
        record_id = %entry.record_id,
        position = entry.position,
        "metadata state change"
    );

    Ok(entry)
}

fn check_references(conn: &Connection, record: &Record) -> Result<()> {
    for (field, target_kind, target) in record.kind.schema().references(&record.fields) {
        let stored: Option<String> = conn
            .query_row(
                "SELECT kind FROM records WHERE record_id = ?1",
                params![target.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to resolve record reference")?;

        match stored.as_deref().and_then(EntityKind::parse) {
            Some(kind) if kind == target_kind => {}
            Some(kind) => {
                return Err(MetadataError::Validation(format!(
                    "{}.{field} must reference a {target_kind}, but {target} is a {kind}",
                    record.kind
                ))
                .into());
            }
            None => {
                return Err(MetadataError::Validation(format!(
                    "{}.{field} references unknown {target_kind} {target}",
                    record.kind
                ))
                .into());
            }
        }
    }
    Ok(())
}

fn check_unique_external_id(conn: &Connection, record: &Record) -> Result<String> {
    let schema = record.kind.schema();
    let (Some(spec), Some(external_id)) =
        (schema.identifier_field(), schema.external_id(&record.fields))
    else {
        return Err(anyhow!("{} record {} has no external identifier", record.kind, record.id));
    };

    let clash: Option<String> = conn
        .query_row(
            "SELECT record_id FROM records
             WHERE kind = ?1 AND external_id = ?2 AND record_id <> ?3",
            params![record.kind.as_str(), external_id, record.id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .context("failed to check external identifier uniqueness")?;

    if let Some(other) = clash {
        return Err(MetadataError::Validation(format!(
            "{} with {} {external_id:?} already exists ({other})",
            record.kind, spec.name
        ))
        .into());
    }
    Ok(external_id.to_string())
}

fn record_not_found(id: RecordId) -> anyhow::Error {
    MetadataError::NotFound(format!("Record {id} not found.")).into()
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_record_id(raw: &str) -> Result<RecordId> {
    Ok(RecordId(parse_ulid(raw)?))
}

fn parse_position(raw: i64) -> Result<u32> {
    u32::try_from(raw).with_context(|| format!("invalid history position: {raw}"))
}

fn parse_kind(raw: &str) -> Result<EntityKind> {
    EntityKind::parse(raw).ok_or_else(|| anyhow!("unknown kind: {raw}"))
}
