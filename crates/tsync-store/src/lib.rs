//! SQLite-backed persistence: instance blacklist, sync watermarks and the
//! per-(project, record type) record tables.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use tsync_core::{instance_key, BlacklistEntry, FlattenedRow, WatermarkEntry, EPOCH_WATERMARK};

pub const CRATE_NAME: &str = "tsync-store";

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Shared connection pool for every persisted table.
#[derive(Debug, Clone)]
pub struct SyncStore {
    pool: SqlitePool,
}

impl SyncStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let opts =
            SqliteConnectOptions::from_str("sqlite::memory:").context("parsing in-memory url")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .context("opening in-memory sqlite")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn blacklist(&self, table: impl Into<String>) -> BlacklistStore {
        BlacklistStore {
            pool: self.pool.clone(),
            table: table.into(),
        }
    }

    pub fn watermarks(&self, table: impl Into<String>) -> WatermarkStore {
        WatermarkStore {
            pool: self.pool.clone(),
            table: table.into(),
        }
    }

    pub fn sink(&self, table_prefix: impl Into<String>) -> TableSink {
        TableSink {
            pool: self.pool.clone(),
            prefix: table_prefix.into(),
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let found = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("checking for table {table}"))?;
    Ok(found.is_some())
}

async fn table_columns(conn: &mut SqliteConnection, table: &str) -> Result<BTreeSet<String>> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("reading columns of {table}"))?;
    rows.iter()
        .map(|row| {
            row.try_get::<String, _>("name")
                .map(|name| name.to_lowercase())
                .context("decoding column name")
        })
        .collect()
}

/// Persisted, append-only list of instances excluded from syncing.
#[derive(Debug, Clone)]
pub struct BlacklistStore {
    pool: SqlitePool,
    table: String,
}

impl BlacklistStore {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (instance TEXT NOT NULL, reason TEXT, blacklisted_at TEXT NOT NULL)",
            quote_ident(&self.table)
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating {}", self.table))?;
        Ok(())
    }

    /// Lowercased instance names; empty when the table has never been written.
    pub async fn load_instances(&self) -> Result<HashSet<String>> {
        Ok(self.entries().await?.iter().map(|e| instance_key(&e.instance)).collect())
    }

    pub async fn entries(&self) -> Result<Vec<BlacklistEntry>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        if !table_exists(&mut conn, &self.table).await? {
            info!(table = %self.table, "blacklist table missing; treating blacklist as empty");
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT instance, reason, blacklisted_at FROM {} ORDER BY rowid",
            quote_ident(&self.table)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .with_context(|| format!("reading {}", self.table))?;
        rows.iter()
            .map(|row| {
                Ok(BlacklistEntry {
                    instance: row.try_get("instance")?,
                    reason: row.try_get("reason")?,
                    blacklisted_at: row.try_get("blacklisted_at")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .context("decoding blacklist entries")
    }

    pub async fn append(&self, entry: &BlacklistEntry) -> Result<()> {
        self.ensure_table().await?;
        let sql = format!(
            "INSERT INTO {} (instance, reason, blacklisted_at) VALUES (?, ?, ?)",
            quote_ident(&self.table)
        );
        sqlx::query(&sql)
            .bind(&entry.instance)
            .bind(&entry.reason)
            .bind(&entry.blacklisted_at)
            .execute(&self.pool)
            .await
            .with_context(|| format!("appending to {}", self.table))?;
        info!(instance = %entry.instance, "instance added to blacklist");
        Ok(())
    }

    pub async fn drop_table(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&self.table)))
            .execute(&self.pool)
            .await
            .with_context(|| format!("dropping {}", self.table))?;
        info!(table = %self.table, "blacklist table dropped");
        Ok(())
    }
}

/// Last successful sync time per (project, record type).
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    pool: SqlitePool,
    table: String,
}

impl WatermarkStore {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             project_key TEXT NOT NULL, \
             issue_type TEXT NOT NULL, \
             last_sync_time TEXT NOT NULL, \
             PRIMARY KEY (project_key, issue_type))",
            quote_ident(&self.table)
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating {}", self.table))?;
        Ok(())
    }

    /// Reads the watermark, materializing the epoch default on first access.
    pub async fn get_last_sync(&self, project_key: &str, record_type: &str) -> Result<String> {
        self.ensure_table().await?;
        let select = format!(
            "SELECT last_sync_time FROM {} WHERE project_key = ? AND issue_type = ?",
            quote_ident(&self.table)
        );
        let existing: Option<String> = sqlx::query_scalar(&select)
            .bind(project_key)
            .bind(record_type)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading watermark {project_key}/{record_type}"))?;
        if let Some(last_sync_time) = existing {
            info!(project = project_key, record_type, %last_sync_time, "loaded watermark");
            return Ok(last_sync_time);
        }

        let insert = format!(
            "INSERT INTO {} (project_key, issue_type, last_sync_time) VALUES (?, ?, ?) \
             ON CONFLICT (project_key, issue_type) DO NOTHING",
            quote_ident(&self.table)
        );
        sqlx::query(&insert)
            .bind(project_key)
            .bind(record_type)
            .bind(EPOCH_WATERMARK)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating watermark {project_key}/{record_type}"))?;
        info!(project = project_key, record_type, "created watermark entry");
        Ok(EPOCH_WATERMARK.to_string())
    }

    pub async fn advance(
        &self,
        project_key: &str,
        record_type: &str,
        last_sync_time: &str,
    ) -> Result<()> {
        self.ensure_table().await?;
        let sql = format!(
            "INSERT INTO {} (project_key, issue_type, last_sync_time) VALUES (?, ?, ?) \
             ON CONFLICT (project_key, issue_type) \
             DO UPDATE SET last_sync_time = excluded.last_sync_time",
            quote_ident(&self.table)
        );
        sqlx::query(&sql)
            .bind(project_key)
            .bind(record_type)
            .bind(last_sync_time)
            .execute(&self.pool)
            .await
            .with_context(|| format!("advancing watermark {project_key}/{record_type}"))?;
        info!(project = project_key, record_type, last_sync_time, "watermark advanced");
        Ok(())
    }

    pub async fn entries(&self) -> Result<Vec<WatermarkEntry>> {
        self.ensure_table().await?;
        let sql = format!(
            "SELECT project_key, issue_type, last_sync_time FROM {} ORDER BY project_key, issue_type",
            quote_ident(&self.table)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("reading {}", self.table))?;
        rows.iter()
            .map(|row| {
                Ok(WatermarkEntry {
                    project_key: row.try_get("project_key")?,
                    record_type: row.try_get("issue_type")?,
                    last_sync_time: row.try_get("last_sync_time")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .context("decoding watermark entries")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub table: String,
    pub written: usize,
    pub dropped_without_id: usize,
    pub created_table: bool,
    pub added_columns: Vec<String>,
}

/// Merge-upserts row batches into one table per (project, record type), keyed by `id`.
#[derive(Debug, Clone)]
pub struct TableSink {
    pool: SqlitePool,
    prefix: String,
}

impl TableSink {
    pub fn table_name(&self, project_key: &str, record_type: &str) -> String {
        record_table_name(&self.prefix, project_key, record_type)
    }

    /// Writes `rows` in one transaction. Matching ids get every batch column
    /// overwritten; columns absent from the table are added first.
    pub async fn upsert(
        &self,
        rows: Vec<FlattenedRow>,
        project_key: &str,
        record_type: &str,
    ) -> Result<UpsertReport> {
        let table = self.table_name(project_key, record_type);
        let mut report = UpsertReport {
            table: table.clone(),
            ..UpsertReport::default()
        };

        if rows.is_empty() {
            info!(%table, "no data to upsert; batch is empty");
            return Ok(report);
        }

        let total = rows.len();
        let rows: Vec<(String, FlattenedRow)> = rows
            .into_iter()
            .filter_map(|r| r.id().map(|id| (id, r)))
            .collect();
        report.dropped_without_id = total - rows.len();
        if rows.is_empty() {
            info!(%table, dropped = total, "every row lacked an id; nothing to upsert");
            return Ok(report);
        }

        let columns = batch_columns(&rows);
        let mut tx = self.pool.begin().await.context("beginning upsert transaction")?;

        if table_exists(&mut tx, &table).await? {
            let existing = table_columns(&mut tx, &table).await?;
            for column in columns.iter().filter(|c| !existing.contains(&c.to_lowercase())) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(&table),
                    quote_ident(column)
                );
                sqlx::query(&sql)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("adding column {column} to {table}"))?;
                report.added_columns.push(column.clone());
            }
            if !report.added_columns.is_empty() {
                debug!(%table, added = ?report.added_columns, "schema evolved");
            }
        } else {
            let definitions = columns
                .iter()
                .map(|c| {
                    if c == FlattenedRow::ID {
                        format!("{} NOT NULL PRIMARY KEY", quote_ident(c))
                    } else {
                        quote_ident(c)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("CREATE TABLE {} ({definitions})", quote_ident(&table));
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("creating {table}"))?;
            report.created_table = true;
        }

        let sql = upsert_statement(&table, &columns);
        for (id, row) in &rows {
            let mut query = sqlx::query(&sql);
            for column in &columns {
                query = if column == FlattenedRow::ID {
                    query.bind(id.clone())
                } else {
                    bind_cell(query, row.get(column))
                };
            }
            query
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting id {id} into {table}"))?;
        }

        tx.commit().await.with_context(|| format!("committing upsert into {table}"))?;
        report.written = rows.len();

        if report.created_table {
            info!(%table, records = report.written, "table created");
        } else {
            info!(%table, records = report.written, "data upserted");
        }
        Ok(report)
    }
}

/// `<prefix>_<project>_<record type>`, lowercased with spaces as underscores.
pub fn record_table_name(prefix: &str, project_key: &str, record_type: &str) -> String {
    format!("{prefix}_{project_key}_{record_type}")
        .to_lowercase()
        .replace(' ', "_")
}

/// Union of every row's columns, `id` first.
fn batch_columns(rows: &[(String, FlattenedRow)]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut columns = vec![FlattenedRow::ID.to_string()];
    seen.insert(FlattenedRow::ID.to_string());
    for (_, row) in rows {
        for column in row.columns().keys() {
            if seen.insert(column.to_lowercase()) {
                columns.push(column.clone());
            }
        }
    }
    columns
}

fn upsert_statement(table: &str, columns: &[String]) -> String {
    let names = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates = columns
        .iter()
        .filter(|c| c.as_str() != FlattenedRow::ID)
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect::<Vec<_>>();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({names}) VALUES ({placeholders}) ON CONFLICT ({}) {on_conflict}",
        quote_ident(table),
        quote_ident(FlattenedRow::ID)
    )
}

/// Binds a cell by its JSON type; lists and objects are stored as JSON text.
fn bind_cell<'q>(query: SqliteQuery<'q>, value: Option<&JsonValue>) -> SqliteQuery<'q> {
    match value {
        None | Some(JsonValue::Null) => query.bind(None::<String>),
        Some(JsonValue::Bool(b)) => query.bind(*b),
        Some(JsonValue::Number(n)) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Some(JsonValue::String(s)) => query.bind(s.clone()),
        Some(other) => query.bind(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn row(pairs: &[(&str, JsonValue)]) -> FlattenedRow {
        FlattenedRow::from_columns(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    async fn count(store: &SyncStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)))
            .fetch_one(store.pool())
            .await
            .expect("count")
    }

    #[test]
    fn table_names_are_lowercased_with_underscores() {
        assert_eq!(record_table_name("jira_issues", "OPS", "Sub Task"), "jira_issues_ops_sub_task");
    }

    #[test]
    fn upsert_statement_overwrites_every_non_key_column() {
        let sql = upsert_statement("t", &["id".to_string(), "summary".to_string()]);
        assert_eq!(
            sql,
            "INSERT INTO \"t\" (\"id\", \"summary\") VALUES (?, ?) ON CONFLICT (\"id\") DO UPDATE SET \"summary\" = excluded.\"summary\""
        );
    }

    #[tokio::test]
    async fn watermark_defaults_to_epoch_and_persists() {
        let store = SyncStore::in_memory().await.expect("store");
        let watermarks = store.watermarks("jira_sync_metadata");

        let first = watermarks.get_last_sync("OPS", "Task").await.expect("read");
        assert_eq!(first, EPOCH_WATERMARK);
        assert_eq!(count(&store, "jira_sync_metadata").await, 1);

        let again = watermarks.get_last_sync("OPS", "Task").await.expect("read");
        assert_eq!(again, EPOCH_WATERMARK);
        assert_eq!(count(&store, "jira_sync_metadata").await, 1);
    }

    #[tokio::test]
    async fn watermark_advance_updates_in_place() {
        let store = SyncStore::in_memory().await.expect("store");
        let watermarks = store.watermarks("jira_sync_metadata");

        watermarks.advance("OPS", "Task", "2026-03-01 10:00").await.expect("insert");
        watermarks.advance("OPS", "Task", "2026-03-02 11:30").await.expect("update");
        watermarks.advance("OPS", "Story", "2026-03-02 11:31").await.expect("other pair");

        let entries = watermarks.entries().await.expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(
            watermarks.get_last_sync("OPS", "Task").await.expect("read"),
            "2026-03-02 11:30"
        );
    }

    #[tokio::test]
    async fn blacklist_is_empty_until_first_append() {
        let store = SyncStore::in_memory().await.expect("store");
        let blacklist = store.blacklist("blacklist_table");
        assert!(blacklist.load_instances().await.expect("load").is_empty());

        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        blacklist.append(&BlacklistEntry::auth_failure("Acme-Prod", at)).await.expect("append");
        blacklist.append(&BlacklistEntry::auth_failure("other", at)).await.expect("append");

        let instances = blacklist.load_instances().await.expect("load");
        assert!(instances.contains("acme-prod"));
        assert_eq!(blacklist.entries().await.expect("entries").len(), 2);

        blacklist.drop_table().await.expect("drop");
        assert!(blacklist.load_instances().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn upserting_same_id_twice_keeps_one_row_with_latest_values() {
        let store = SyncStore::in_memory().await.expect("store");
        let sink = store.sink("jira_issues");

        let first = sink
            .upsert(vec![row(&[("id", json!("1")), ("summary", json!("old"))])], "OPS", "Task")
            .await
            .expect("first");
        assert!(first.created_table);

        let second = sink
            .upsert(vec![row(&[("id", json!("1")), ("summary", json!("new"))])], "OPS", "Task")
            .await
            .expect("second");
        assert!(!second.created_table);

        assert_eq!(count(&store, "jira_issues_ops_task").await, 1);
        let sql = "SELECT summary FROM jira_issues_ops_task WHERE id = '1'";
        let summary: String = sqlx::query_scalar(sql)
            .fetch_one(store.pool())
            .await
            .expect("summary");
        assert_eq!(summary, "new");
    }

    #[tokio::test]
    async fn null_ids_are_dropped_and_empty_batches_are_noops() {
        let store = SyncStore::in_memory().await.expect("store");
        let sink = store.sink("jira_issues");

        let empty = sink.upsert(Vec::new(), "OPS", "Task").await.expect("empty");
        assert_eq!(empty.written, 0);
        let mut conn = store.pool().acquire().await.expect("conn");
        assert!(!table_exists(&mut conn, "jira_issues_ops_task").await.expect("exists"));
        drop(conn);

        let report = sink
            .upsert(
                vec![
                    row(&[("id", JsonValue::Null), ("summary", json!("orphan"))]),
                    row(&[("id", json!("2")), ("summary", json!("kept"))]),
                ],
                "OPS",
                "Task",
            )
            .await
            .expect("upsert");
        assert_eq!(report.written, 1);
        assert_eq!(report.dropped_without_id, 1);
        assert_eq!(count(&store, "jira_issues_ops_task").await, 1);
    }

    #[tokio::test]
    async fn new_columns_are_added_on_later_batches() {
        let store = SyncStore::in_memory().await.expect("store");
        let sink = store.sink("jira_issues");

        sink.upsert(vec![row(&[("id", json!("1")), ("summary", json!("a"))])], "OPS", "Bug")
            .await
            .expect("first");
        let report = sink
            .upsert(
                vec![row(&[
                    ("id", json!("2")),
                    ("summary", json!("b")),
                    ("sprint_ids", json!([7, 8])),
                    ("flagged", json!(true)),
                    ("story_points", json!(3.5)),
                ])],
                "OPS",
                "Bug",
            )
            .await
            .expect("second");
        assert_eq!(report.added_columns.len(), 3);

        let sql =
            "SELECT sprint_ids, flagged, story_points FROM jira_issues_ops_bug WHERE id = '2'";
        let found = sqlx::query(sql)
            .fetch_one(store.pool())
            .await
            .expect("row");
        assert_eq!(found.try_get::<String, _>("sprint_ids").unwrap(), "[7,8]");
        assert!(found.try_get::<bool, _>("flagged").unwrap());
        assert_eq!(found.try_get::<f64, _>("story_points").unwrap(), 3.5);

        let sql = "SELECT sprint_ids FROM jira_issues_ops_bug WHERE id = '1'";
        let old: Option<String> = sqlx::query_scalar(sql)
            .fetch_one(store.pool())
            .await
            .expect("old row");
        assert_eq!(old, None);
    }

    #[tokio::test]
    async fn rows_missing_a_batch_column_store_null() {
        let store = SyncStore::in_memory().await.expect("store");
        let sink = store.sink("jira_issues");

        sink.upsert(
            vec![
                row(&[("id", json!("1")), ("time_in_closed", json!("60"))]),
                row(&[("id", json!("2"))]),
            ],
            "OPS",
            "Task",
        )
        .await
        .expect("upsert");

        let sql = "SELECT time_in_closed FROM jira_issues_ops_task WHERE id = '2'";
        let value: Option<String> = sqlx::query_scalar(sql)
            .fetch_one(store.pool())
            .await
            .expect("row");
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("sync.db").display());

        let store = SyncStore::connect(&url).await.expect("connect");
        store
            .watermarks("jira_sync_metadata")
            .advance("OPS", "Task", "2026-03-01 10:00")
            .await
            .expect("advance");
        store.pool().close().await;

        let reopened = SyncStore::connect(&url).await.expect("reconnect");
        let last = reopened
            .watermarks("jira_sync_metadata")
            .get_last_sync("OPS", "Task")
            .await
            .expect("read");
        assert_eq!(last, "2026-03-01 10:00");
    }
}
