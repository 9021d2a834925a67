use std::path::Path;

use otsync_adapters::{FetchContext, FetchError, HtmlTableExportSource, Normalizer, RemoteFetch};
use otsync_storage::ExtractArchive;

fn fixture() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/work_orders.xls")
}

#[tokio::test]
async fn export_fixture_normalizes_into_records() {
    let export_dir = tempfile::tempdir().unwrap();
    let archive_dir = tempfile::tempdir().unwrap();
    std::fs::copy(fixture(), export_dir.path().join("export.xls")).unwrap();
    std::fs::write(export_dir.path().join("notes.txt"), "ignored").unwrap();

    let source = HtmlTableExportSource::new(export_dir.path())
        .with_archive(ExtractArchive::new(archive_dir.path()));
    let rows = source.fetch_batch(&FetchContext::now(None)).await.unwrap();
    assert_eq!(rows.len(), 4);

    let batch = Normalizer::default().normalize_batch(&rows);
    let keys = batch
        .records
        .iter()
        .map(|r| r.key.as_str())
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["OT-1001", "OT-1002", "OT-1003"]);
    assert_eq!(batch.rejected.len(), 1);
    assert_eq!(batch.clients, vec!["ACME".to_string(), "Globex".to_string()]);

    let first = &batch.records[0].fields;
    assert_eq!(first.date, "2026-02-24");
    assert_eq!(first.description, "Replace pump seal");
    assert_eq!(first.serial_number, "SN-100");
    assert_eq!(batch.records[2].fields.date, "");

    let archived = walk_files(archive_dir.path());
    assert_eq!(archived, 1);
}

#[tokio::test]
async fn empty_export_directory_is_a_fetch_error() {
    let export_dir = tempfile::tempdir().unwrap();
    let err = HtmlTableExportSource::new(export_dir.path())
        .fetch_batch(&FetchContext::now(None))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NoExtract(_)));
}

fn walk_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .map(|p| if p.is_dir() { walk_files(&p) } else { 1 })
        .sum()
}
