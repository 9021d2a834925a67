//! Core domain model for OTSYNC work-order synchronization.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Space characters the export emits in place of an ordinary space.
const SPACE_VARIANTS: [char; 3] = ['\u{00a0}', '\u{2007}', '\u{202f}'];

/// Replace non-breaking space variants with ordinary spaces, then trim.
pub fn normalize_text(raw: &str) -> String {
    raw.chars()
        .map(|c| if SPACE_VARIANTS.contains(&c) { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Identity of a work item. Always normalized and never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    /// Normalizes `raw`; returns `None` when nothing is left after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let key = normalize_text(raw);
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RecordKey::parse(&value).ok_or_else(|| "record key must not be empty".to_string())
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

/// The fixed, ordered set of non-key fields carried by every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Description,
    SerialNumber,
    Date,
    Client,
    WorkType,
    TrackingStatus,
    Plant,
}

impl FieldName {
    pub const ALL: [FieldName; 7] = [
        FieldName::Description,
        FieldName::SerialNumber,
        FieldName::Date,
        FieldName::Client,
        FieldName::WorkType,
        FieldName::TrackingStatus,
        FieldName::Plant,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::Description => "description",
            FieldName::SerialNumber => "serial_number",
            FieldName::Date => "date",
            FieldName::Client => "client",
            FieldName::WorkType => "work_type",
            FieldName::TrackingStatus => "tracking_status",
            FieldName::Plant => "plant",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFields {
    pub description: String,
    pub serial_number: String,
    /// ISO `YYYY-MM-DD`, or empty when the source date could not be parsed.
    pub date: String,
    pub client: String,
    pub work_type: String,
    pub tracking_status: String,
    pub plant: String,
}

impl RecordFields {
    pub fn get(&self, name: FieldName) -> &str {
        match name {
            FieldName::Description => &self.description,
            FieldName::SerialNumber => &self.serial_number,
            FieldName::Date => &self.date,
            FieldName::Client => &self.client,
            FieldName::WorkType => &self.work_type,
            FieldName::TrackingStatus => &self.tracking_status,
            FieldName::Plant => &self.plant,
        }
    }

    pub fn get_mut(&mut self, name: FieldName) -> &mut String {
        match name {
            FieldName::Description => &mut self.description,
            FieldName::SerialNumber => &mut self.serial_number,
            FieldName::Date => &mut self.date,
            FieldName::Client => &mut self.client,
            FieldName::WorkType => &mut self.work_type,
            FieldName::TrackingStatus => &mut self.tracking_status,
            FieldName::Plant => &mut self.plant,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldName, &str)> + '_ {
        FieldName::ALL.into_iter().map(move |name| (name, self.get(name)))
    }

    /// Copy with every value passed through [`normalize_text`].
    pub fn normalized(&self) -> Self {
        let mut out = Self::default();
        for (name, value) in self.iter() {
            *out.get_mut(name) = normalize_text(value);
        }
        out
    }

    /// Field-by-field comparison after normalizing both sides.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.iter()
            .zip(other.iter())
            .any(|((_, a), (_, b))| normalize_text(a) != normalize_text(b))
    }
}

/// One canonical work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub fields: RecordFields,
}

impl Record {
    pub fn new(key: RecordKey, fields: RecordFields) -> Self {
        Self { key, fields }
    }
}

/// What started a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Manual => f.write_str("manual"),
            SyncTrigger::Scheduled => f.write_str("scheduled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Store,
    MissingCredentials,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub detail: String,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Result of one sync cycle. Only outcomes without `error` are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub timestamp: DateTime<Utc>,
    pub new_count: u64,
    pub updated_count: u64,
    #[serde(default)]
    pub rejected_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl SyncOutcome {
    pub fn succeeded(timestamp: DateTime<Utc>, new_count: u64, updated_count: u64) -> Self {
        Self {
            timestamp,
            new_count,
            updated_count,
            rejected_count: 0,
            error: None,
        }
    }

    pub fn failed(timestamp: DateTime<Utc>, error: ErrorInfo) -> Self {
        Self {
            timestamp,
            new_count: 0,
            updated_count: 0,
            rejected_count: 0,
            error: Some(error),
        }
    }

    pub fn with_rejected(mut self, rejected_count: u64) -> Self {
        self.rejected_count = rejected_count;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn has_changes(&self) -> bool {
        self.new_count > 0 || self.updated_count > 0
    }
}

/// Latest release seen on the release feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub tag: String,
    pub url: String,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn normalize_text_replaces_nbsp_and_trims() {
        assert_eq!(normalize_text("\u{00a0} OT\u{00a0}12 \t"), "OT 12");
        assert_eq!(normalize_text("a\u{202f}b"), "a b");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn record_keys_compare_equal_across_space_variants() {
        let a = RecordKey::parse("OT\u{00a0}1").unwrap();
        let b = RecordKey::parse(" OT 1 ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "OT 1");
    }

    #[test]
    fn empty_key_is_not_a_key() {
        assert!(RecordKey::parse("").is_none());
        assert!(RecordKey::parse("\u{00a0}\u{00a0}").is_none());
        assert!(serde_json::from_str::<RecordKey>("\"  \"").is_err());
    }

    #[test]
    fn fields_compare_after_normalization() {
        let a = RecordFields {
            description: "Pump\u{00a0}check ".into(),
            ..Default::default()
        };
        let b = RecordFields {
            description: "Pump check".into(),
            ..Default::default()
        };
        assert!(!a.differs_from(&b));

        let c = RecordFields {
            plant: "P2".into(),
            ..b.clone()
        };
        assert!(b.differs_from(&c));
    }

    #[test]
    fn field_names_round_trip_through_str() {
        for name in FieldName::ALL {
            assert_eq!(FieldName::parse(name.as_str()), Some(name));
        }
        assert_eq!(FieldName::parse("nope"), None);
    }

    #[test]
    fn failed_outcome_carries_no_counts() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        let outcome = SyncOutcome::failed(
            ts,
            ErrorInfo {
                kind: ErrorKind::Fetch,
                detail: "timeout".into(),
            },
        );
        assert!(!outcome.is_success());
        assert!(!outcome.has_changes());
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"fetch\""));
    }
}
