//! Durable storage and HTTP utilities for OTSYNC: the keyed record store,
//! the configuration document, the raw extract archive and the release feed.

mod archive;
mod config_store;
mod http;
mod records;

pub use archive::{ArchivedExtract, ExtractArchive};
pub use config_store::{write_atomic, ConfigError, JsonDocumentStore};
pub use http::{
    BackoffPolicy, CheckError, HttpReleaseFeed, ReleaseDocument, ReleaseFeed,
    DEFAULT_RELEASE_URL,
};
pub use records::{
    MemoryRecordStore, RecordFilter, RecordStore, SearchField, SqliteRecordStore, StoreError,
};
