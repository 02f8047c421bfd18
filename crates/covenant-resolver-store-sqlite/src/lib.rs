//! SQLite persistence for workflows, parcels, covenant records, the join
//! index, and parcel matches.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::thread;

use anyhow::{anyhow, Context, Result};
use covenant_resolver_core::JoinIndexArena;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

mod covenants;
mod index;
mod matching;
mod parcels;

pub use covenants::{NewCorrection, NewExtraCandidate, NewManualCovenant, NewPinLink, NewSubject};
pub use index::{IndexRebuildSummary, SqlJoinLookup};
pub use matching::{write_match_report, MatchReportFile, MatchRunSummary};
pub use parcels::{
    NewAlternateName, NewManualParcelCandidate, NewParcel, ParcelRecord, SqlFootprints, WorkflowRecord,
};

const SCHEMA_VERSION: i64 = 2;

/// Forward migrations in apply order; each runs in its own write transaction.
const MIGRATIONS: [(i64, &str); 2] = [(1, CORE_TABLES_SQL), (2, MANUAL_OVERRIDE_TABLES_SQL)];

const CONNECTION_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;";

/// SQLite caps bound parameters per statement at 32766.
const MAX_BOUND_PARAMETERS: usize = 32_000;

const MIGRATION_LEDGER_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const CORE_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS workflows (
  workflow_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS parcels (
  parcel_id INTEGER PRIMARY KEY,
  workflow_id INTEGER NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  pin_primary TEXT NOT NULL,
  plat_name TEXT,
  plat_standardized TEXT,
  block TEXT,
  lot TEXT,
  street_address TEXT,
  city TEXT,
  geometry_json TEXT,
  has_covenant INTEGER NOT NULL DEFAULT 0 CHECK (has_covenant IN (0, 1)),
  UNIQUE (workflow_id, pin_primary)
);

CREATE TABLE IF NOT EXISTS parcel_join_candidates (
  candidate_id INTEGER PRIMARY KEY,
  workflow_id INTEGER NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  parcel_id INTEGER NOT NULL REFERENCES parcels(parcel_id) ON DELETE CASCADE,
  plat_name_standardized TEXT NOT NULL,
  join_key TEXT NOT NULL,
  source TEXT NOT NULL CHECK (source IN ('primary', 'plat_alternate_name', 'manual_parcel_candidate')),
  metadata_json TEXT NOT NULL,
  UNIQUE (workflow_id, join_key, parcel_id)
);

CREATE TABLE IF NOT EXISTS subjects (
  subject_id INTEGER PRIMARY KEY,
  workflow_id INTEGER NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  zoon_subject_id INTEGER NOT NULL,
  raw_json TEXT NOT NULL,
  scores_json TEXT NOT NULL,
  bool_covenant_final INTEGER CHECK (bool_covenant_final IN (0, 1)),
  covenant_text_final TEXT,
  addition_final TEXT,
  lot_final TEXT,
  block_final TEXT,
  seller_final TEXT,
  buyer_final TEXT,
  deed_date_final TEXT,
  has_manual_correction INTEGER NOT NULL DEFAULT 0 CHECK (has_manual_correction IN (0, 1)),
  bool_parcel_match INTEGER NOT NULL DEFAULT 0 CHECK (bool_parcel_match IN (0, 1)),
  geometry_union_json TEXT,
  parcel_addresses_json TEXT NOT NULL DEFAULT '[]',
  parcel_cities_json TEXT NOT NULL DEFAULT '[]',
  date_updated TEXT NOT NULL,
  UNIQUE (workflow_id, zoon_subject_id)
);

CREATE TABLE IF NOT EXISTS manual_corrections (
  correction_id INTEGER PRIMARY KEY,
  subject_id INTEGER NOT NULL REFERENCES subjects(subject_id) ON DELETE CASCADE,
  fields_json TEXT NOT NULL,
  comments TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS extra_parcel_candidates (
  extra_id INTEGER PRIMARY KEY,
  subject_id INTEGER NOT NULL REFERENCES subjects(subject_id) ON DELETE CASCADE,
  addition TEXT,
  block TEXT,
  lot TEXT,
  comments TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subject_parcel_matches (
  subject_id INTEGER NOT NULL REFERENCES subjects(subject_id) ON DELETE CASCADE,
  parcel_id INTEGER NOT NULL REFERENCES parcels(parcel_id) ON DELETE CASCADE,
  PRIMARY KEY (subject_id, parcel_id)
);

CREATE INDEX IF NOT EXISTS idx_parcels_workflow ON parcels(workflow_id);
CREATE INDEX IF NOT EXISTS idx_join_candidates_key ON parcel_join_candidates(workflow_id, join_key);
CREATE INDEX IF NOT EXISTS idx_subjects_workflow ON subjects(workflow_id);
CREATE INDEX IF NOT EXISTS idx_manual_corrections_subject ON manual_corrections(subject_id);
CREATE INDEX IF NOT EXISTS idx_extra_candidates_subject ON extra_parcel_candidates(subject_id);
CREATE INDEX IF NOT EXISTS idx_subject_matches_parcel ON subject_parcel_matches(parcel_id);
";

const MANUAL_OVERRIDE_TABLES_SQL: &str = r"
CREATE TABLE IF NOT EXISTS plat_alternate_names (
  alternate_id INTEGER PRIMARY KEY,
  workflow_id INTEGER NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  plat_name TEXT NOT NULL,
  plat_standardized TEXT NOT NULL,
  alternate_name TEXT NOT NULL,
  alternate_name_standardized TEXT NOT NULL,
  UNIQUE (workflow_id, plat_standardized, alternate_name_standardized)
);

CREATE TABLE IF NOT EXISTS manual_parcel_candidates (
  candidate_id INTEGER PRIMARY KEY,
  workflow_id INTEGER NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  parcel_pin TEXT NOT NULL,
  addition TEXT,
  block TEXT,
  lot TEXT,
  comments TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS manual_covenants (
  manual_covenant_id INTEGER PRIMARY KEY,
  workflow_id INTEGER NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  bool_confirmed INTEGER NOT NULL CHECK (bool_confirmed IN (0, 1)),
  fields_json TEXT NOT NULL,
  doc_num TEXT,
  city TEXT,
  comments TEXT,
  bool_parcel_match INTEGER NOT NULL DEFAULT 0 CHECK (bool_parcel_match IN (0, 1)),
  geometry_union_json TEXT,
  parcel_addresses_json TEXT NOT NULL DEFAULT '[]',
  parcel_cities_json TEXT NOT NULL DEFAULT '[]',
  date_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS manual_covenant_parcel_matches (
  manual_covenant_id INTEGER NOT NULL REFERENCES manual_covenants(manual_covenant_id) ON DELETE CASCADE,
  parcel_id INTEGER NOT NULL REFERENCES parcels(parcel_id) ON DELETE CASCADE,
  PRIMARY KEY (manual_covenant_id, parcel_id)
);

CREATE TABLE IF NOT EXISTS manual_pin_links (
  pin_link_id INTEGER PRIMARY KEY,
  workflow_id INTEGER NOT NULL REFERENCES workflows(workflow_id) ON DELETE CASCADE,
  subject_id INTEGER REFERENCES subjects(subject_id) ON DELETE CASCADE,
  manual_covenant_id INTEGER REFERENCES manual_covenants(manual_covenant_id) ON DELETE CASCADE,
  parcel_pin TEXT NOT NULL,
  comments TEXT,
  created_at TEXT NOT NULL,
  CHECK ((subject_id IS NULL) <> (manual_covenant_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_alternate_names_plat ON plat_alternate_names(workflow_id, plat_standardized);
CREATE INDEX IF NOT EXISTS idx_manual_parcel_candidates_pin ON manual_parcel_candidates(workflow_id, parcel_pin);
CREATE INDEX IF NOT EXISTS idx_manual_covenants_workflow ON manual_covenants(workflow_id);
CREATE INDEX IF NOT EXISTS idx_manual_covenant_matches_parcel ON manual_covenant_parcel_matches(parcel_id);
CREATE INDEX IF NOT EXISTS idx_pin_links_subject ON manual_pin_links(subject_id);
CREATE INDEX IF NOT EXISTS idx_pin_links_manual_covenant ON manual_pin_links(manual_covenant_id);
";

/// Tunables that do not change results, only how the work is spread out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub workers: usize,
    pub insert_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            insert_batch_size: 5_000,
        }
    }
}

pub struct SqliteStore {
    conn: Connection,
    arena: JoinIndexArena,
    options: StoreOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    /// The ledger was empty and the version was read off the tables present.
    pub inferred_from_tables: bool,
}

/// One row of `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DanglingReference {
    pub table: String,
    pub rowid: Option<i64>,
    pub referenced_table: String,
    pub constraint_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_detail: Vec<String>,
    pub dangling_references: Vec<DanglingReference>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a covenant store with default options.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened as SQLite.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Open a covenant store in WAL mode with foreign keys enforced.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened as SQLite.
    pub fn open_with_options(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open covenant database {}", path.display()))?;
        conn.execute_batch(CONNECTION_PRAGMAS)
            .with_context(|| format!("cannot configure covenant database {}", path.display()))?;

        tracing::debug!(path = %path.display(), workers = options.workers, "opened resolver store");
        Ok(Self { conn, arena: JoinIndexArena::new(), options })
    }

    #[must_use]
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Where the database stands against the newest schema this build knows.
    ///
    /// # Errors
    /// Returns an error when the migration ledger cannot be read, or when the
    /// tables present match no known schema version.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        ensure_migration_ledger(&self.conn)?;
        let recorded = recorded_version(&self.conn)?;
        let implied = if recorded == 0 { version_implied_by_tables(&self.conn)? } else { 0 };
        let current_version = recorded.max(implied);

        Ok(SchemaStatus {
            current_version,
            target_version: SCHEMA_VERSION,
            pending_versions: MIGRATIONS
                .iter()
                .map(|(version, _)| *version)
                .filter(|version| *version > current_version)
                .collect(),
            inferred_from_tables: implied > 0,
        })
    }

    /// Bring the database up to the newest schema. A database whose tables
    /// predate the ledger is adopted at the version its tables imply.
    ///
    /// # Errors
    /// Returns an error when a migration fails or the database is newer than
    /// this build.
    pub fn migrate(&mut self) -> Result<()> {
        ensure_migration_ledger(&self.conn)?;

        if recorded_version(&self.conn)? == 0 {
            let implied = version_implied_by_tables(&self.conn)?;
            for (version, _) in MIGRATIONS.iter().filter(|(version, _)| *version <= implied) {
                mark_applied(&self.conn, *version)?;
            }
            if implied > 0 {
                tracing::warn!(version = implied, "adopted covenant schema with no ledger rows");
            }
        }

        let recorded = recorded_version(&self.conn)?;
        for (version, sql) in MIGRATIONS.iter().filter(|(version, _)| *version > recorded) {
            self.apply_migration(*version, sql)?;
        }

        let reached = recorded_version(&self.conn)?;
        if reached != SCHEMA_VERSION {
            return Err(anyhow!(
                "covenant database is at schema v{reached} but this build expects v{SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn write_transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self.write_transaction()?;
        tx.execute_batch(sql)
            .with_context(|| format!("schema v{version} did not apply"))?;
        mark_applied(&tx, version)?;
        tx.commit().with_context(|| format!("schema v{version} did not commit"))?;
        tracing::info!(version, "covenant schema migrated");
        Ok(())
    }

    /// SQLite `quick_check`, dangling foreign keys, and the schema status in
    /// one report. Problems are reported, not raised.
    ///
    /// # Errors
    /// Returns an error only when the checks themselves cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_detail = query_rows(&self.conn, "PRAGMA quick_check", |row| row.get::<_, String>(0))?;
        let dangling_references = query_rows(&self.conn, "PRAGMA foreign_key_check", |row| {
            Ok(DanglingReference {
                table: row.get(0)?,
                rowid: row.get(1)?,
                referenced_table: row.get(2)?,
                constraint_index: row.get(3)?,
            })
        })?;
        let quick_check_ok = quick_check_detail == ["ok"];
        if !quick_check_ok || !dangling_references.is_empty() {
            tracing::warn!(
                quick_check = ?quick_check_detail,
                dangling = dangling_references.len(),
                "covenant database failed integrity checks"
            );
        }

        Ok(IntegrityReport {
            quick_check_ok,
            quick_check_detail,
            dangling_references,
            schema_status: self.schema_status()?,
        })
    }
}

fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql).with_context(|| format!("cannot prepare `{sql}`"))?;
    let rows = stmt
        .query_map([], map)
        .with_context(|| format!("cannot run `{sql}`"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("cannot read rows of `{sql}`"))?;
    Ok(rows)
}

fn ensure_migration_ledger(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_LEDGER_SQL)
        .context("cannot create the schema_migrations ledger")
}

fn recorded_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT IFNULL(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("cannot read the schema_migrations ledger")
}

fn table_names(conn: &Connection) -> Result<BTreeSet<String>> {
    let names = query_rows(conn, "SELECT name FROM sqlite_master WHERE type = 'table'", |row| {
        row.get::<_, String>(0)
    })?;
    Ok(names.into_iter().collect())
}

/// Schema version of a database that has tables but no ledger rows.
fn version_implied_by_tables(conn: &Connection) -> Result<i64> {
    let tables = table_names(conn)?;
    if !tables.contains("workflows") {
        return Ok(0);
    }
    if tables.contains("manual_pin_links") {
        return Ok(2);
    }
    if !tables.contains("subjects") {
        return Err(anyhow!("covenant database has a workflows table but no subjects table"));
    }
    Ok(1)
}

fn mark_applied(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("cannot record schema v{version} in the ledger"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("timestamp has no RFC 3339 form")
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize {what}"))
}

fn from_json<T: DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to parse stored {what}"))
}

/// Insert `rows` into `table` using multi-row `INSERT` statements of at most
/// `batch_size` rows each.
fn insert_rows_batched(
    conn: &Connection,
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
    batch_size: usize,
) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let max_rows = (MAX_BOUND_PARAMETERS / columns.len().max(1)).max(1);
    let batch_size = batch_size.clamp(1, max_rows);
    let column_list = columns.join(", ");
    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));

    for batch in rows.chunks(batch_size) {
        let values = vec![placeholders.as_str(); batch.len()].join(", ");
        let sql = format!("INSERT INTO {table}({column_list}) VALUES {values}");
        conn.execute(&sql, params_from_iter(batch.iter().flatten()))
            .with_context(|| format!("failed to batch insert {} rows into {table}", batch.len()))?;
    }

    Ok(rows.len())
}

/// One JSON document per line. Returns the SHA-256 of the bytes written and
/// the row count.
fn write_ndjson_file<T: Serialize>(path: &Path, rows: &[T]) -> Result<(String, usize)> {
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut digest = Sha256::new();
    let mut line = Vec::new();

    for row in rows {
        line.clear();
        serde_json::to_writer(&mut line, row).context("report row did not serialize")?;
        line.push(b'\n');
        digest.update(&line);
        writer.write_all(&line).with_context(|| format!("cannot write {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("cannot write {}", path.display()))?;

    Ok((format!("{:x}", digest.finalize()), rows.len()))
}

/// Read newline-delimited JSON records, skipping blank lines.
///
/// # Errors
/// Returns an error naming the file and line of the first bad record.
pub fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("cannot open input {}", path.display()))?;
    let mut records = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("{}:{line_no}: unreadable line", path.display()))?;
        let record = line.trim();
        if record.is_empty() {
            continue;
        }
        records.push(
            serde_json::from_str(record)
                .with_context(|| format!("{}:{line_no}: not a valid record", path.display()))?,
        );
    }

    Ok(records)
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::Result;
    use covenant_resolver_core::{CovenantFields, FieldScores, WorkflowId};

    use super::{NewParcel, NewSubject, SqliteStore};

    pub(crate) fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(std::path::Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    pub(crate) fn square(x: f64) -> serde_json::Value {
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [[[x, 0.0], [x + 1.0, 0.0], [x + 1.0, 1.0], [x, 1.0], [x, 0.0]]]
        })
    }

    pub(crate) fn parcel(pin: &str, plat: &str, block: &str, lot: &str, x: f64) -> Result<NewParcel> {
        Ok(NewParcel {
            pin_primary: pin.to_string(),
            plat_name: Some(plat.to_string()),
            block: Some(block.to_string()),
            lot: Some(lot.to_string()),
            street_address: Some(format!("{pin} Oak St")),
            city: Some("Minneapolis".to_string()),
            geometry: Some(serde_json::from_value(square(x))?),
        })
    }

    /// Oak Park block 1 lots 1-8, one parcel per lot, PIN `P-<lot>`.
    pub(crate) fn oak_park(store: &mut SqliteStore, workflow_name: &str) -> Result<WorkflowId> {
        let workflow = store.create_workflow(workflow_name)?;
        let parcels = (1..=8)
            .map(|lot| parcel(&format!("P-{lot}"), "Oak Park Addition", "1", &lot.to_string(), f64::from(lot)))
            .collect::<Result<Vec<_>>>()?;
        store.insert_parcels(workflow.workflow_id, &parcels)?;
        Ok(workflow.workflow_id)
    }

    pub(crate) fn covenant(zoon_subject_id: i64, addition: &str, block: &str, lot: &str) -> NewSubject {
        NewSubject {
            zoon_subject_id,
            raw: CovenantFields {
                bool_covenant: Some(true),
                covenant_text: Some("shall never be occupied by".to_string()),
                addition: Some(addition.to_string()),
                block: Some(block.to_string()),
                lot: Some(lot.to_string()),
                seller: Some("A. Seller".to_string()),
                buyer: Some("B. Buyer".to_string()),
                deed_date: Some("1925-04-01".to_string()),
            },
            scores: FieldScores::default(),
        }
    }
}
