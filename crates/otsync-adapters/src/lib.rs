//! Remote fetch contracts, extract sources and row normalization.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use otsync_storage::ExtractArchive;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

mod normalize;

pub use normalize::{
    NormalizationReject, NormalizedBatch, Normalizer, RAW_ROW_WIDTH, SOURCE_DATE_FORMAT,
};

/// One extracted row, cells already projected into canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow {
    pub cells: Vec<Option<String>>,
}

impl RawRow {
    pub fn new(cells: Vec<Option<String>>) -> Self {
        Self { cells }
    }

    /// Cell text; missing and null cells read as empty.
    pub fn cell(&self, index: usize) -> String {
        self.cells
            .get(index)
            .and_then(|c| c.clone())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FetchContext {
    pub fetched_at: DateTime<Utc>,
    pub credentials: Option<Credentials>,
}

impl FetchContext {
    pub fn now(credentials: Option<Credentials>) -> Self {
        Self {
            fetched_at: Utc::now(),
            credentials,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no extract found in {0}")]
    NoExtract(PathBuf),
    #[error("extract produced no rows: {0}")]
    EmptyExtract(String),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing extract: {0}")]
    Parse(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Produces one complete raw batch per call, or fails as a whole.
#[async_trait]
pub trait RemoteFetch: Send + Sync {
    fn source_id(&self) -> &str;

    fn requires_credentials(&self) -> bool {
        false
    }

    async fn fetch_batch(&self, ctx: &FetchContext) -> Result<Vec<RawRow>, FetchError>;
}

/// Fixture rows on disk: either a bare array of rows or `{"rows": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RowsDocument {
    Bare(Vec<Vec<JsonValue>>),
    Wrapped { rows: Vec<Vec<JsonValue>> },
}

fn json_cell(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

pub fn parse_rows_json(text: &str) -> Result<Vec<RawRow>, FetchError> {
    let doc: RowsDocument =
        serde_json::from_str(text).map_err(|e| FetchError::Parse(e.to_string()))?;
    let rows = match doc {
        RowsDocument::Bare(rows) | RowsDocument::Wrapped { rows } => rows,
    };
    Ok(rows
        .into_iter()
        .map(|cells| RawRow::new(cells.into_iter().map(json_cell).collect()))
        .collect())
}

/// Reads canonical-order rows from a JSON file.
#[derive(Debug, Clone)]
pub struct JsonRowsSource {
    path: PathBuf,
}

impl JsonRowsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RemoteFetch for JsonRowsSource {
    fn source_id(&self) -> &str {
        "json-rows"
    }

    async fn fetch_batch(&self, _ctx: &FetchContext) -> Result<Vec<RawRow>, FetchError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(io_error("reading", &self.path))?;
        let rows = parse_rows_json(&text)?;
        if rows.is_empty() {
            return Err(FetchError::EmptyExtract(self.path.display().to_string()));
        }
        Ok(rows)
    }
}

/// Source columns of the work-order export, in canonical cell order:
/// key, description, serial number, date, client, work type, tracking, plant.
pub const EXPORT_COLUMNS: [usize; RAW_ROW_WIDTH] = [0, 12, 15, 2, 3, 9, 5, 13];

/// The work-order export is an HTML table saved with an `.xls` extension.
/// Each fetch picks the newest export in `export_dir`.
#[derive(Debug, Clone)]
pub struct HtmlTableExportSource {
    export_dir: PathBuf,
    extension: String,
    columns: [usize; RAW_ROW_WIDTH],
    skip_rows: usize,
    archive: Option<ExtractArchive>,
}

impl HtmlTableExportSource {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
            extension: "xls".to_string(),
            columns: EXPORT_COLUMNS,
            skip_rows: 1,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: ExtractArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Data rows to drop after the header (the export repeats a filter row).
    pub fn with_skip_rows(mut self, skip_rows: usize) -> Self {
        self.skip_rows = skip_rows;
        self
    }

    async fn newest_export(&self) -> Result<PathBuf, FetchError> {
        let mut entries = fs::read_dir(&self.export_dir)
            .await
            .map_err(io_error("listing", &self.export_dir))?;
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("listing", &self.export_dir))?
        {
            let path = entry.path();
            let matches_ext = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&self.extension));
            if !matches_ext {
                continue;
            }
            let meta = entry.metadata().await.map_err(io_error("inspecting", &path))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let is_newer = match &newest {
                Some((at, _)) => modified > *at,
                None => true,
            };
            if is_newer {
                newest = Some((modified, path));
            }
        }
        newest
            .map(|(_, path)| path)
            .ok_or_else(|| FetchError::NoExtract(self.export_dir.clone()))
    }
}

#[async_trait]
impl RemoteFetch for HtmlTableExportSource {
    fn source_id(&self) -> &str {
        "html-table-export"
    }

    async fn fetch_batch(&self, ctx: &FetchContext) -> Result<Vec<RawRow>, FetchError> {
        let span = info_span!("export_fetch", dir = %self.export_dir.display());
        async {
            let path = self.newest_export().await?;
            let bytes = fs::read(&path).await.map_err(io_error("reading", &path))?;

            if let Some(archive) = &self.archive {
                let archived = archive
                    .archive(ctx.fetched_at, &self.extension, &bytes)
                    .await?;
                info!(
                    path = %archived.relative_path.display(),
                    deduplicated = archived.deduplicated,
                    "archived extract"
                );
            }

            let (text, lossy) = decode_export(&bytes);
            if lossy {
                warn!(
                    path = %path.display(),
                    "export is not valid UTF-8; undecodable bytes were replaced"
                );
            }
            let rows = parse_html_table(&text, &self.columns, self.skip_rows)?;
            if rows.is_empty() {
                return Err(FetchError::EmptyExtract(path.display().to_string()));
            }
            info!(path = %path.display(), rows = rows.len(), "parsed export");
            Ok::<_, FetchError>(rows)
        }
        .instrument(span)
        .await
    }
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> FetchError {
    let path = path.to_path_buf();
    move |source| FetchError::Io {
        action,
        path,
        source,
    }
}

/// Export text, plus whether any bytes had to be replaced to decode it.
pub fn decode_export(bytes: &[u8]) -> (Cow<'_, str>, bool) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), false),
        Err(_) => (String::from_utf8_lossy(bytes), true),
    }
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Parse(e.to_string()))
}

fn cell_text(cell: ElementRef<'_>) -> Option<String> {
    let text = cell.text().collect::<String>();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Rows of the first `<table>`, projected through `columns`. Rows without
/// any `<td>` are headers and are dropped, then `skip_rows` more.
pub fn parse_html_table(
    html: &str,
    columns: &[usize; RAW_ROW_WIDTH],
    skip_rows: usize,
) -> Result<Vec<RawRow>, FetchError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;
    let data_sel = selector("td")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Err(FetchError::Parse("no <table> in extract".into()));
    };

    let rows = table
        .select(&row_sel)
        .filter(|tr| tr.select(&data_sel).next().is_some())
        .skip(skip_rows)
        .map(|tr| {
            let cells = tr.select(&cell_sel).map(cell_text).collect::<Vec<_>>();
            RawRow::new(
                columns
                    .iter()
                    .map(|&idx| cells.get(idx).cloned().flatten())
                    .collect(),
            )
        })
        .collect();
    Ok(rows)
}
