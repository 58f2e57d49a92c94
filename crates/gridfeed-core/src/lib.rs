//! Core domain model and storage contracts for gridfeed.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridfeed-core";

/// Longest derived archive identity we will emit.
pub const DERIVED_ID_MAX_LEN: usize = 64;

/// One upstream-published archive candidate for a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    pub archive_id: String,
    pub report_type: String,
    pub post_datetime: Option<String>,
    pub friendly_name: String,
    pub download_url: Option<String>,
}

/// Derive a stable archive identity when the upstream listing omits one.
///
/// Pure function: lower-case, replace `:` and `/` with `-`, truncate to
/// [`DERIVED_ID_MAX_LEN`] bytes on a char boundary. Two distinct archives
/// that collide after truncation would be treated as one ingestion attempt;
/// that limitation is accepted rather than papered over.
pub fn derive_archive_id(source: &str) -> String {
    let mut out = String::with_capacity(source.len().min(DERIVED_ID_MAX_LEN));
    for c in source.chars() {
        let c = match c {
            ':' | '/' => '-',
            other => other.to_ascii_lowercase(),
        };
        if out.len() + c.len_utf8() > DERIVED_ID_MAX_LEN {
            break;
        }
        out.push(c);
    }
    out
}

/// Canonical, timezone-naive rendering of every coerced date/time value.
pub const CANONICAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_canonical_timestamp(value: NaiveDateTime) -> String {
    value.format(CANONICAL_TIMESTAMP_FORMAT).to_string()
}

pub fn parse_canonical_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, CANONICAL_TIMESTAMP_FORMAT).ok()
}

/// Homogeneous tabular records decoded from one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Terminal per-archive ledger status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Success,
    Error,
}

impl IngestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestStatus::Success => "success",
            IngestStatus::Error => "error",
        }
    }
}

/// Lifecycle state of one pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Fail,
    Skipped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
            RunStatus::Skipped => "skipped",
        }
    }
}

/// Declarative per-report schema mapping, validated once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSpec {
    /// Upstream catalog identifier, e.g. `NP4-732-CD`.
    pub report_id: String,
    /// Destination table name; doubles as the ledger `report_type`.
    pub report_type: String,
    /// Upstream column name -> destination column name.
    #[serde(default)]
    pub column_renames: BTreeMap<String, String>,
    /// Dedup key, single column or ordered tuple, in destination names.
    pub key_columns: Vec<String>,
    /// Destination columns coerced to canonical timezone-naive timestamps.
    #[serde(default)]
    pub datetime_columns: BTreeSet<String>,
    /// Full destination column set, in insert order.
    pub allowed_columns: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("report {0}: key_columns must not be empty")]
    EmptyKey(String),
    #[error("report {report}: invalid identifier {identifier:?}")]
    BadIdentifier { report: String, identifier: String },
    #[error("report {report}: key column {column:?} is not in allowed_columns")]
    UnknownKeyColumn { report: String, column: String },
    #[error("report {report}: datetime column {column:?} is not in allowed_columns")]
    UnknownDatetimeColumn { report: String, column: String },
    #[error("report {report}: rename target {column:?} is not in allowed_columns")]
    RenameTargetNotAllowed { report: String, column: String },
}

/// Destination table and column names travel into SQL text, so they are
/// restricted to lower-case snake identifiers at validation time.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl ReportSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        let report = self.report_type.clone();
        if self.key_columns.is_empty() {
            return Err(SpecError::EmptyKey(report));
        }
        for identifier in
            std::iter::once(&self.report_type).chain(self.allowed_columns.iter())
        {
            if !is_valid_identifier(identifier) {
                return Err(SpecError::BadIdentifier {
                    report,
                    identifier: identifier.clone(),
                });
            }
        }
        for column in &self.key_columns {
            if !self.allowed_columns.contains(column) {
                return Err(SpecError::UnknownKeyColumn {
                    report,
                    column: column.clone(),
                });
            }
        }
        for column in &self.datetime_columns {
            if !self.allowed_columns.contains(column) {
                return Err(SpecError::UnknownDatetimeColumn {
                    report,
                    column: column.clone(),
                });
            }
        }
        for target in self.column_renames.values() {
            if !self.allowed_columns.contains(target) {
                return Err(SpecError::RenameTargetNotAllowed {
                    report,
                    column: target.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Per-archive network/storage failure. Scoped to one archive; never
/// aborts the rest of the run.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("cache io failure at {path}: {message}")]
    CacheIo { path: String, message: String },
}

/// Upstream listing unusable. Fatal for the current run.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog fetch failed: {0}")]
    Fetch(#[from] DownloadError),
    #[error("malformed catalog response for {report_id}: {message}")]
    Malformed { report_id: String, message: String },
    #[error("no archives listed for {report_id}")]
    Empty { report_id: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger backend failure: {0}")]
    Backend(String),
}

impl LedgerError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        LedgerError::Backend(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("run log backend failure: {0}")]
    Backend(String),
    #[error("run {0} not found or already finalized")]
    NotRunning(Uuid),
}

impl RunLogError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        RunLogError::Backend(err.to_string())
    }
}

/// Destination write or key-projection failure. Not retried automatically.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("destination backend failure: {0}")]
    Backend(String),
    #[error("row value {value:?} is not a canonical timestamp for column {column}")]
    BadTimestamp { column: String, value: String },
}

impl LoadError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        LoadError::Backend(err.to_string())
    }
}

/// Upstream provider seam: archive listing plus raw payload download.
/// Authentication material stays inside the implementation.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn list_archives(
        &self,
        report_id: &str,
        report_type: &str,
    ) -> Result<Vec<ArchiveDescriptor>, CatalogError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError>;
}

/// Durable record of which archive identities have been attempted.
#[async_trait]
pub trait IngestLedger: Send + Sync {
    /// True iff a terminal record exists for `(archive_id, report_type)`.
    async fn already_ingested(
        &self,
        archive_id: &str,
        report_type: &str,
    ) -> Result<bool, LedgerError>;

    /// Insert-if-absent. Repeated calls for the same key are no-ops.
    async fn log_status(
        &self,
        archive_id: &str,
        report_type: &str,
        status: IngestStatus,
        notes: Option<&str>,
    ) -> Result<(), LedgerError>;
}

/// Lifecycle record for one pipeline invocation.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    /// Insert a `running` record and hand back its id.
    async fn start(&self, report_type: &str) -> Result<Uuid, RunLogError>;

    /// Transition the run to a terminal status. Called exactly once per start.
    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        notes: Option<&str>,
    ) -> Result<(), RunLogError>;
}

/// Append-only destination table access, scoped to one report spec.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Existing key projection, each tuple in `spec.key_columns` order with
    /// datetime values rendered canonically.
    async fn existing_keys(&self, spec: &ReportSpec) -> Result<HashSet<Vec<String>>, LoadError>;

    /// Append rows aligned to `spec.allowed_columns`; returns the count
    /// written. Zero is a valid outcome.
    async fn append_rows(&self, spec: &ReportSpec, rows: &[Vec<String>]) -> Result<u64, LoadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ReportSpec {
        ReportSpec {
            report_id: "NP4-732-CD".into(),
            report_type: "wind_hourly_forecast".into(),
            column_renames: BTreeMap::from([
                ("DELIVERY_DATE".to_string(), "delivery_date".to_string()),
                ("HOUR_ENDING".to_string(), "hour_ending".to_string()),
            ]),
            key_columns: vec!["delivery_date".into(), "hour_ending".into()],
            datetime_columns: BTreeSet::from(["delivery_date".to_string()]),
            allowed_columns: vec![
                "delivery_date".into(),
                "hour_ending".into(),
                "system_wide_gen".into(),
            ],
        }
    }

    #[test]
    fn derived_identity_is_deterministic_and_bounded() {
        assert_eq!(
            derive_archive_id("NP4-732-CD_2024-01-01T06:00:00/part"),
            "np4-732-cd_2024-01-01t06-00-00-part"
        );
        let long = "x".repeat(200);
        let derived = derive_archive_id(&long);
        assert_eq!(derived.len(), DERIVED_ID_MAX_LEN);
        assert_eq!(derive_archive_id(&long), derived);
    }

    #[test]
    fn canonical_timestamps_round_trip() {
        let parsed = parse_canonical_timestamp("2024-01-01 06:15:00").expect("canonical parses");
        assert_eq!(format_canonical_timestamp(parsed), "2024-01-01 06:15:00");
        assert_eq!(parse_canonical_timestamp("2024-01-01T06:15:00"), None);
        assert_eq!(parse_canonical_timestamp(""), None);
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert_eq!(spec().validate(), Ok(()));
    }

    #[test]
    fn key_column_outside_allowed_set_is_rejected() {
        let mut bad = spec();
        bad.key_columns.push("dst_flag".into());
        assert_eq!(
            bad.validate(),
            Err(SpecError::UnknownKeyColumn {
                report: "wind_hourly_forecast".into(),
                column: "dst_flag".into(),
            })
        );
    }

    #[test]
    fn sql_unsafe_identifiers_are_rejected() {
        let mut bad = spec();
        bad.allowed_columns.push("delivery; drop table".into());
        assert!(matches!(
            bad.validate(),
            Err(SpecError::BadIdentifier { .. })
        ));
        assert!(!is_valid_identifier("Delivery_Date"));
        assert!(!is_valid_identifier("1hour"));
        assert!(is_valid_identifier("hour_ending"));
    }

    #[test]
    fn rename_targets_must_land_in_allowed_columns() {
        let mut bad = spec();
        bad.column_renames
            .insert("STWPF_SYSTEM_WIDE".into(), "stwpf_system_wide".into());
        assert_eq!(
            bad.validate(),
            Err(SpecError::RenameTargetNotAllowed {
                report: "wind_hourly_forecast".into(),
                column: "stwpf_system_wide".into(),
            })
        );
    }
}
