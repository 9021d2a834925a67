use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use otsync_core::{FieldName, Record, RecordFields, RecordKey};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row has an empty key")]
    EmptyKey,
}

/// Column a listing search matches against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchField {
    #[default]
    Key,
    Field(FieldName),
}

impl SearchField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "key" | "record_key" => Some(SearchField::Key),
            other => FieldName::parse(other).map(SearchField::Field),
        }
    }

    fn column(self) -> &'static str {
        match self {
            SearchField::Key => "record_key",
            SearchField::Field(name) => name.as_str(),
        }
    }

    fn value<'a>(self, record: &'a Record) -> &'a str {
        match self {
            SearchField::Key => record.key.as_str(),
            SearchField::Field(name) => record.fields.get(name),
        }
    }
}

/// Listing filter: every word in `text` must appear (case-insensitively) in
/// the `search_by` column, and `client` must match exactly when set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub text: String,
    pub search_by: SearchField,
    pub client: Option<String>,
}

impl RecordFilter {
    /// Search words, ASCII-folded the way SQLite `LOWER`/`LIKE` fold them,
    /// so both stores agree on accented text.
    pub fn words(&self) -> Vec<String> {
        self.text
            .split_whitespace()
            .map(|w| w.to_ascii_lowercase())
            .collect()
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(client) = &self.client {
            if record.fields.client != *client {
                return false;
            }
        }
        let haystack = self.search_by.value(record).to_ascii_lowercase();
        self.words().iter().all(|w| haystack.contains(w.as_str()))
    }
}

/// Keyed record collection. Keys are compared in their normalized form.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError>;

    /// Insert the record, or overwrite every field of the existing one.
    async fn upsert(&self, record: &Record) -> Result<(), StoreError>;

    /// Matching records, ordered by key descending.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError>;

    /// Distinct non-empty client values, sorted.
    async fn distinct_clients(&self) -> Result<Vec<String>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<RecordKey, RecordFields>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.key, r.fields)).collect()),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(key)
            .map(|fields| Record::new(key.clone(), fields.clone())))
    }

    async fn upsert(&self, record: &Record) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.key.clone(), record.fields.clone());
        Ok(())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .rev()
            .map(|(key, fields)| Record::new(key.clone(), fields.clone()))
            .filter(|record| filter.matches(record))
            .collect())
    }

    async fn distinct_clients(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.read().await;
        let mut clients = records
            .values()
            .map(|f| f.client.clone())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>();
        clients.sort();
        clients.dedup();
        Ok(clients)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.read().await.len() as u64)
    }
}

/// SQLite-backed store; one row per record keyed on the normalized key.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Each in-memory connection is its own database, so pin to one.
        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(4)
        };
        let pool = pool_options.connect_with(options).await?;
        MIGRATOR.run(&pool).await?;
        debug!(database_url, "record store ready");
        Ok(Self { pool })
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const SELECT_RECORDS: &str = "SELECT record_key, description, serial_number, date, client, \
     work_type, tracking_status, plant FROM records";

fn record_from_row(row: &SqliteRow) -> Result<Record, StoreError> {
    let raw_key: String = row.try_get("record_key")?;
    let key = RecordKey::parse(&raw_key).ok_or(StoreError::EmptyKey)?;
    let mut fields = RecordFields::default();
    for name in FieldName::ALL {
        *fields.get_mut(name) = row.try_get(name.as_str())?;
    }
    Ok(Record::new(key, fields))
}

fn escape_like(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    for ch in word.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_RECORDS} WHERE record_key = ?"))
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn upsert(&self, record: &Record) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let f = &record.fields;
        sqlx::query(
            r#"
            INSERT INTO records (
                record_key, description, serial_number, date, client,
                work_type, tracking_status, plant, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(record_key) DO UPDATE SET
                description = excluded.description,
                serial_number = excluded.serial_number,
                date = excluded.date,
                client = excluded.client,
                work_type = excluded.work_type,
                tracking_status = excluded.tracking_status,
                plant = excluded.plant,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.key.as_str())
        .bind(&f.description)
        .bind(&f.serial_number)
        .bind(&f.date)
        .bind(&f.client)
        .bind(&f.work_type)
        .bind(&f.tracking_status)
        .bind(&f.plant)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<Record>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_RECORDS);
        qb.push(" WHERE 1 = 1");
        for word in filter.words() {
            qb.push(" AND LOWER(")
                .push(filter.search_by.column())
                .push(") LIKE ")
                .push_bind(format!("%{}%", escape_like(&word)))
                .push(" ESCAPE '\\'");
        }
        if let Some(client) = &filter.client {
            qb.push(" AND client = ").push_bind(client.clone());
        }
        qb.push(" ORDER BY record_key DESC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn distinct_clients(&self) -> Result<Vec<String>, StoreError> {
        let clients = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT client FROM records WHERE client <> '' ORDER BY client",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(clients)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}
