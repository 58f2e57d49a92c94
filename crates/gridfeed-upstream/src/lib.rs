//! Upstream catalog client and archive payload decoding.

use std::io::{Cursor, Read};

use async_trait::async_trait;
use gridfeed_core::{
    derive_archive_id, ArchiveDescriptor, CatalogError, DownloadError, ParsedBatch, Upstream,
};
use gridfeed_storage::{HttpFetcher, UpstreamAuth};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "gridfeed-upstream";

/// Wire shape of the catalog listing endpoint:
/// `{ archives: [ { archiveId, postDatetime, friendlyName,
///   _links: { endpoint: { href } } } ] }`.
#[derive(Debug, Deserialize)]
struct ArchiveListing {
    #[serde(default)]
    archives: Vec<ArchiveEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveEntry {
    archive_id: Option<String>,
    post_datetime: Option<String>,
    friendly_name: Option<String>,
    #[serde(rename = "_links")]
    links: Option<EntryLinks>,
}

#[derive(Debug, Deserialize)]
struct EntryLinks {
    endpoint: Option<EntryEndpoint>,
}

#[derive(Debug, Deserialize)]
struct EntryEndpoint {
    href: Option<String>,
}

/// Decode a catalog response into descriptors sorted ascending by publish
/// timestamp, ties kept in input order. Entries without an upstream
/// `archiveId` get the deterministic derived identity; entries without a
/// download href survive with `download_url: None` so the run loop can
/// record them as per-archive errors.
pub fn descriptors_from_listing(
    report_id: &str,
    report_type: &str,
    body: &[u8],
) -> Result<Vec<ArchiveDescriptor>, CatalogError> {
    let listing: ArchiveListing =
        serde_json::from_slice(body).map_err(|err| CatalogError::Malformed {
            report_id: report_id.to_string(),
            message: err.to_string(),
        })?;
    if listing.archives.is_empty() {
        return Err(CatalogError::Empty {
            report_id: report_id.to_string(),
        });
    }

    let mut entries = listing.archives;
    entries.sort_by_key(|entry| entry.post_datetime.clone().unwrap_or_default());

    let descriptors = entries
        .into_iter()
        .map(|entry| {
            let download_url = entry.links.and_then(|l| l.endpoint).and_then(|e| e.href);
            let friendly_name = entry.friendly_name.clone().unwrap_or_else(|| {
                let stamp = entry
                    .post_datetime
                    .clone()
                    .or_else(|| entry.archive_id.clone())
                    .unwrap_or_else(|| "unnamed".to_string());
                format!("{report_id}_{stamp}")
            });
            let archive_id = match entry.archive_id {
                Some(id) => id,
                None => {
                    let source = entry
                        .friendly_name
                        .as_deref()
                        .or(download_url.as_deref())
                        .unwrap_or(&friendly_name);
                    let derived = derive_archive_id(source);
                    debug!(%derived, %friendly_name, "derived missing archive id");
                    derived
                }
            };
            ArchiveDescriptor {
                archive_id,
                report_type: report_type.to_string(),
                post_datetime: entry.post_datetime,
                friendly_name,
                download_url,
            }
        })
        .collect();
    Ok(descriptors)
}

/// Live HTTP implementation of the [`Upstream`] seam: authenticated catalog
/// listing plus raw archive download.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    catalog_base_url: String,
    fetcher: HttpFetcher,
    auth: UpstreamAuth,
}

impl HttpUpstream {
    pub fn new(catalog_base_url: impl Into<String>, fetcher: HttpFetcher, auth: UpstreamAuth) -> Self {
        Self {
            catalog_base_url: catalog_base_url.into(),
            fetcher,
            auth,
        }
    }

    fn listing_url(&self, report_id: &str) -> String {
        format!("{}/{report_id}", self.catalog_base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn list_archives(
        &self,
        report_id: &str,
        report_type: &str,
    ) -> Result<Vec<ArchiveDescriptor>, CatalogError> {
        let url = self.listing_url(report_id);
        let body = self.fetcher.fetch_bytes(&self.auth, &url).await?;
        descriptors_from_listing(report_id, report_type, &body)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        self.fetcher.fetch_bytes(&self.auth, url).await
    }
}

/// Per-archive format failure, distinct from [`DownloadError`] so operators
/// can separate network issues from upstream format drift.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("zip container has no entries")]
    EmptyZip,
    #[error("zip entry unreadable: {0}")]
    Zip(zip::result::ZipError),
    #[error("reading zip entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("delimited text unreadable: {0}")]
    Csv(#[from] csv::Error),
    #[error("payload contains no tabular data")]
    EmptyPayload,
}

/// Decode one payload: ZIP container first (first entry is the tabular
/// source), falling back to delimited text when the bytes are not a valid
/// ZIP. These are the only two formats the upstream publishes.
pub fn parse_payload(bytes: &[u8]) -> Result<ParsedBatch, ParseError> {
    match zip::ZipArchive::new(Cursor::new(bytes)) {
        Ok(mut archive) => {
            if archive.len() == 0 {
                return Err(ParseError::EmptyZip);
            }
            let mut entry = archive.by_index(0).map_err(ParseError::Zip)?;
            let mut inner = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut inner)?;
            parse_delimited(&inner)
        }
        Err(_) => parse_delimited(bytes),
    }
}

fn parse_delimited(bytes: &[u8]) -> Result<ParsedBatch, ParseError> {
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
        return Err(ParseError::EmptyPayload);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }
    Ok(ParsedBatch { columns, rows })
}
