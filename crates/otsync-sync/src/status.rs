use chrono::{Local, TimeZone};
use otsync_core::SyncOutcome;

pub const READY: &str = "Ready.";

const STAMP_FORMAT: &str = "%d/%m/%y %H:%M";

/// `DD/MM/YY HH:MM – N new, M updated`, without a trailing period.
pub fn describe_outcome_in<Tz: TimeZone>(outcome: &SyncOutcome, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let stamp = outcome.timestamp.with_timezone(tz).format(STAMP_FORMAT);
    if outcome.has_changes() {
        format!(
            "{stamp} – {} new, {} updated",
            outcome.new_count, outcome.updated_count
        )
    } else {
        format!("{stamp} – no changes")
    }
}

pub fn describe_outcome(outcome: &SyncOutcome) -> String {
    describe_outcome_in(outcome, &Local)
}

pub fn format_ok_status(outcome: &SyncOutcome) -> String {
    format!("Last update {}.", describe_outcome(outcome))
}

pub fn startup_status(last: Option<&SyncOutcome>) -> String {
    last.map(format_ok_status)
        .unwrap_or_else(|| READY.to_string())
}

pub fn failure_status(detail: &str, last: Option<&SyncOutcome>) -> String {
    match last {
        Some(last) => format!(
            "current attempt failed: {detail}; last successful run was {}",
            describe_outcome(last)
        ),
        None => format!("current attempt failed: {detail}; no successful run yet"),
    }
}
