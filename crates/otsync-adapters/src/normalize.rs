use chrono::NaiveDateTime;
use otsync_core::{normalize_text, FieldName, Record, RecordFields, RecordKey};
use thiserror::Error;
use tracing::{debug, info};

use crate::RawRow;

/// Layout of the source's date cells, e.g. `24/02/26 08:15:00`.
pub const SOURCE_DATE_FORMAT: &str = "%d/%m/%y %H:%M:%S";

/// Raw row cells are positional: the key first, then the record fields in
/// [`FieldName::ALL`] order.
pub const RAW_ROW_WIDTH: usize = 1 + FieldName::ALL.len();

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row {row_index} has an empty key")]
pub struct NormalizationReject {
    pub row_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub records: Vec<Record>,
    pub rejected: Vec<NormalizationReject>,
    /// Distinct non-empty client values of the accepted records, in
    /// first-seen order.
    pub clients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    date_format: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(SOURCE_DATE_FORMAT)
    }
}

impl Normalizer {
    pub fn new(date_format: impl Into<String>) -> Self {
        Self {
            date_format: date_format.into(),
        }
    }

    /// Reformat a source date as `YYYY-MM-DD`; anything unparseable becomes
    /// an empty string.
    pub fn normalize_date(&self, raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, &self.date_format)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }

    pub fn normalize_row(
        &self,
        row_index: usize,
        row: &RawRow,
    ) -> Result<Record, NormalizationReject> {
        let key = RecordKey::parse(&row.cell(0)).ok_or(NormalizationReject { row_index })?;

        let mut fields = RecordFields::default();
        for (offset, name) in FieldName::ALL.into_iter().enumerate() {
            let value = normalize_text(&row.cell(offset + 1));
            *fields.get_mut(name) = match name {
                FieldName::Date => self.normalize_date(&value),
                _ => value,
            };
        }
        Ok(Record::new(key, fields))
    }

    pub fn normalize_batch(&self, rows: &[RawRow]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for (row_index, row) in rows.iter().enumerate() {
            match self.normalize_row(row_index, row) {
                Ok(record) => {
                    let client = &record.fields.client;
                    if !client.is_empty() && !batch.clients.contains(client) {
                        batch.clients.push(client.clone());
                    }
                    batch.records.push(record);
                }
                Err(reject) => {
                    debug!(row_index, "rejecting row without key");
                    batch.rejected.push(reject);
                }
            }
        }
        info!(
            rows = rows.len(),
            accepted = batch.records.len(),
            rejected = batch.rejected.len(),
            clients = batch.clients.len(),
            "normalized extract"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[Option<&str>]) -> RawRow {
        RawRow::new(cells.iter().map(|c| c.map(str::to_string)).collect())
    }

    #[test]
    fn full_row_maps_to_named_fields() {
        let record = Normalizer::default()
            .normalize_row(
                0,
                &row(&[
                    Some("\u{00a0}OT-100 "),
                    Some("Replace seal"),
                    Some("SN-1"),
                    Some("24/02/26 08:15:00"),
                    Some("ACME\u{00a0}"),
                    Some("Corrective"),
                    Some("Open"),
                    Some(" P1 "),
                ]),
            )
            .unwrap();
        assert_eq!(record.key.as_str(), "OT-100");
        assert_eq!(record.fields.description, "Replace seal");
        assert_eq!(record.fields.serial_number, "SN-1");
        assert_eq!(record.fields.date, "2026-02-24");
        assert_eq!(record.fields.client, "ACME");
        assert_eq!(record.fields.work_type, "Corrective");
        assert_eq!(record.fields.tracking_status, "Open");
        assert_eq!(record.fields.plant, "P1");
    }

    #[test]
    fn nulls_and_short_rows_become_empty_strings() {
        let record = Normalizer::default()
            .normalize_row(0, &row(&[Some("OT-1"), None, Some("SN")]))
            .unwrap();
        assert_eq!(record.fields.description, "");
        assert_eq!(record.fields.serial_number, "SN");
        assert_eq!(record.fields.plant, "");
    }

    #[test]
    fn unparseable_date_keeps_the_row() {
        let normalizer = Normalizer::default();
        let record = normalizer
            .normalize_row(0, &row(&[Some("OT-1"), Some("d"), None, Some("not a date")]))
            .unwrap();
        assert_eq!(record.fields.date, "");
        assert_eq!(record.fields.description, "d");
        assert_eq!(normalizer.normalize_date("31/02/26 10:00:00"), "");
    }

    #[test]
    fn empty_keys_are_rejected_without_aborting_the_batch() {
        let batch = Normalizer::default().normalize_batch(&[
            row(&[Some("OT-1")]),
            row(&[Some(" \u{00a0} "), Some("orphan")]),
            row(&[None, Some("orphan")]),
            row(&[Some("OT-2")]),
        ]);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(
            batch.rejected,
            vec![
                NormalizationReject { row_index: 1 },
                NormalizationReject { row_index: 2 }
            ]
        );
    }

    #[test]
    fn every_keyed_row_yields_exactly_one_record_with_trimmed_key() {
        let keys = ["A", " B", "C\u{00a0}", "\u{00a0}D\u{00a0}E "];
        let rows = keys.iter().map(|k| row(&[Some(k)])).collect::<Vec<_>>();
        let batch = Normalizer::default().normalize_batch(&rows);
        let got = batch.records.iter().map(|r| r.key.as_str()).collect::<Vec<_>>();
        assert_eq!(got, vec!["A", "B", "C", "D E"]);
        assert!(batch.rejected.is_empty());
    }

    #[test]
    fn distinct_clients_keep_first_seen_order() {
        let batch = Normalizer::default().normalize_batch(&[
            row(&[Some("1"), None, None, None, Some("Globex")]),
            row(&[Some("2"), None, None, None, Some("ACME")]),
            row(&[Some("3"), None, None, None, Some("Globex\u{00a0}")]),
            row(&[Some("4"), None, None, None, None]),
        ]);
        assert_eq!(batch.clients, vec!["Globex".to_string(), "ACME".to_string()]);
    }
}
