//! On-disk archive cache, authenticated HTTP fetch, and payload checksums.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gridfeed_core::{ArchiveDescriptor, DownloadError, Upstream};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridfeed-storage";

/// Header carrying the static subscription key on every upstream call.
pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Turn a friendly name into a single path component. Matches the cache
/// layout `cache/<report_id>/<sanitized_friendly_name>.bin`.
pub fn sanitize_cache_name(friendly_name: &str) -> String {
    let cleaned: String = friendly_name
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '-',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Write-once on-disk memoization of downloaded archive payloads.
///
/// A cache hit is fully offline and byte-identical to the original fetch;
/// a miss waits the fixed inter-request delay, downloads through the
/// upstream seam, and persists atomically via temp-file rename.
#[derive(Debug, Clone)]
pub struct ArchiveCache {
    root: PathBuf,
    request_delay: Duration,
}

impl ArchiveCache {
    pub fn new(root: impl Into<PathBuf>, request_delay: Duration) -> Self {
        Self {
            root: root.into(),
            request_delay,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_path(&self, report_id: &str, friendly_name: &str) -> PathBuf {
        self.root
            .join(report_id)
            .join(format!("{}.bin", sanitize_cache_name(friendly_name)))
    }

    /// Return the archive payload, hitting the network at most once per
    /// `(report_id, friendly_name)` for the lifetime of the cache directory.
    pub async fn fetch(
        &self,
        upstream: &dyn Upstream,
        report_id: &str,
        descriptor: &ArchiveDescriptor,
        download_url: &str,
    ) -> Result<Vec<u8>, DownloadError> {
        let path = self.cache_path(report_id, &descriptor.friendly_name);
        let span = info_span!("archive_fetch", report_id, archive_id = %descriptor.archive_id);
        async {
            if path_exists(&path).await? {
                debug!(path = %path.display(), "cache hit");
                return fs::read(&path).await.map_err(|err| cache_io(&path, err));
            }

            if !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
            info!(url = download_url, "downloading archive");
            let bytes = upstream.download(download_url).await?;
            self.persist(&path, &bytes).await?;
            debug!(path = %path.display(), bytes = bytes.len(), "cached archive");
            Ok(bytes)
        }
        .instrument(span)
        .await
    }

    /// Atomic write-once persist: temp file in the destination directory,
    /// then rename. A concurrent winner leaves the existing file untouched.
    async fn persist(&self, path: &Path, bytes: &[u8]) -> Result<(), DownloadError> {
        let parent = path
            .parent()
            .expect("cache path always has a report directory");
        fs::create_dir_all(parent)
            .await
            .map_err(|err| cache_io(parent, err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| cache_io(&temp_path, err))?;
        file.write_all(bytes)
            .await
            .map_err(|err| cache_io(&temp_path, err))?;
        file.flush()
            .await
            .map_err(|err| cache_io(&temp_path, err))?;
        drop(file);

        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(cache_io(path, err))
            }
        }
    }
}

async fn path_exists(path: &Path) -> Result<bool, DownloadError> {
    fs::try_exists(path)
        .await
        .map_err(|err| cache_io(path, err))
}

fn cache_io(path: &Path, err: std::io::Error) -> DownloadError {
    DownloadError::CacheIo {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Opaque credentials supplied per call by the external token provider.
#[derive(Debug, Clone)]
pub struct UpstreamAuth {
    pub bearer_token: String,
    pub subscription_key: String,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Thin authenticated GET wrapper. Fetch failures are scoped to the one
/// archive (or catalog call) that triggered them.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, DownloadError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(|err| DownloadError::Transport {
            url: String::new(),
            message: format!("building http client: {err}"),
        })?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        auth: &UpstreamAuth,
        url: &str,
    ) -> Result<Vec<u8>, DownloadError> {
        let span = info_span!("http_fetch", url);
        async {
            let response = self
                .client
                .get(url)
                .bearer_auth(&auth.bearer_token)
                .header(SUBSCRIPTION_KEY_HEADER, &auth.subscription_key)
                .send()
                .await
                .map_err(|err| transport(url, err))?;

            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::HttpStatus {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                });
            }
            let body = response
                .bytes()
                .await
                .map_err(|err| transport(url, err))?
                .to_vec();
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

fn transport(url: &str, err: reqwest::Error) -> DownloadError {
    DownloadError::Transport {
        url: url.to_string(),
        message: err.to_string(),
    }
}

/// Per-run content digest accounting. Any digest seen more than once is a
/// data-quality signal for operators, never a reason to skip ingestion.
#[derive(Debug, Default)]
pub struct ChecksumTracker {
    counts: HashMap<String, u32>,
}

impl ChecksumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bytes: &[u8]) -> String {
        let digest = sha256_hex(bytes);
        *self.counts.entry(digest.clone()).or_default() += 1;
        digest
    }

    /// Digests that occurred more than once this run, sorted for stable
    /// reporting.
    pub fn duplicates(&self) -> Vec<(String, u32)> {
        let mut dupes: Vec<(String, u32)> = self
            .counts
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(digest, count)| (digest.clone(), *count))
            .collect();
        dupes.sort();
        dupes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use gridfeed_core::{ArchiveDescriptor, CatalogError};
    use tempfile::tempdir;

    struct CountingUpstream {
        payload: Vec<u8>,
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for CountingUpstream {
        async fn list_archives(
            &self,
            _report_id: &str,
            _report_type: &str,
        ) -> Result<Vec<ArchiveDescriptor>, CatalogError> {
            Ok(Vec::new())
        }

        async fn download(&self, _url: &str) -> Result<Vec<u8>, DownloadError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(self.payload.clone())
        }
    }

    fn descriptor(friendly_name: &str) -> ArchiveDescriptor {
        ArchiveDescriptor {
            archive_id: "arch-1".into(),
            report_type: "wind_hourly_forecast".into(),
            post_datetime: Some("2024-01-01T06:00:00".into()),
            friendly_name: friendly_name.into(),
            download_url: Some("https://example.invalid/archive/1".into()),
        }
    }

    #[test]
    fn checksum_is_stable_sha256() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn friendly_names_become_single_path_components() {
        assert_eq!(
            sanitize_cache_name("NP4-732-CD_2024-01-01T06:00:00/retry"),
            "NP4-732-CD_2024-01-01T06-00-00-retry"
        );
        assert_eq!(sanitize_cache_name(""), "unnamed");
    }

    #[tokio::test]
    async fn second_fetch_is_offline_and_byte_identical() {
        let dir = tempdir().expect("tempdir");
        let cache = ArchiveCache::new(dir.path(), Duration::ZERO);
        let upstream = CountingUpstream {
            payload: b"DELIVERY_DATE,HOUR_ENDING\n2024-01-01,1\n".to_vec(),
            downloads: AtomicUsize::new(0),
        };
        let desc = descriptor("NP4-732-CD_2024-01-01T06:00:00");

        let first = cache
            .fetch(&upstream, "NP4-732-CD", &desc, "https://example.invalid/a")
            .await
            .expect("first fetch");
        let second = cache
            .fetch(&upstream, "NP4-732-CD", &desc, "https://example.invalid/a")
            .await
            .expect("second fetch");

        assert_eq!(upstream.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert!(cache
            .cache_path("NP4-732-CD", &desc.friendly_name)
            .exists());
    }

    #[tokio::test]
    async fn download_failure_leaves_no_cache_file() {
        struct FailingUpstream;

        #[async_trait]
        impl Upstream for FailingUpstream {
            async fn list_archives(
                &self,
                _report_id: &str,
                _report_type: &str,
            ) -> Result<Vec<ArchiveDescriptor>, CatalogError> {
                Ok(Vec::new())
            }

            async fn download(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
                Err(DownloadError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                })
            }
        }

        let dir = tempdir().expect("tempdir");
        let cache = ArchiveCache::new(dir.path(), Duration::ZERO);
        let desc = descriptor("NP4-732-CD_2024-01-01T06:00:00");

        let err = cache
            .fetch(&FailingUpstream, "NP4-732-CD", &desc, "https://example.invalid/a")
            .await
            .expect_err("download should fail");
        assert!(matches!(err, DownloadError::HttpStatus { status: 503, .. }));
        assert!(!cache
            .cache_path("NP4-732-CD", &desc.friendly_name)
            .exists());
    }

    #[test]
    fn duplicate_digests_are_reported_with_counts() {
        let mut tracker = ChecksumTracker::new();
        let a = tracker.record(b"same bytes");
        tracker.record(b"other bytes");
        let b = tracker.record(b"same bytes");

        assert_eq!(a, b);
        let dupes = tracker.duplicates();
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0], (a, 2));
    }
}
