//! Snapshot file storage + HTTP fetch utilities for pricewatch.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use pricewatch_core::{ChangeRecord, ProductRecord};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "pricewatch-storage";

const SNAPSHOT_EXTENSION: &str = "csv";
const CHANGES_PREFIX: &str = "changes_";

/// Owns the three snapshot directories. Nothing else in the workspace
/// touches snapshot files directly.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    current_dir: PathBuf,
    previous_dir: PathBuf,
    changes_dir: PathBuf,
}

impl SnapshotStore {
    /// Conventional layout under one data root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            current_dir: root.join("current_data"),
            previous_dir: root.join("previous_data"),
            changes_dir: root.join("changes_data"),
        }
    }

    pub fn with_dirs(
        current_dir: impl Into<PathBuf>,
        previous_dir: impl Into<PathBuf>,
        changes_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            current_dir: current_dir.into(),
            previous_dir: previous_dir.into(),
            changes_dir: changes_dir.into(),
        }
    }

    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }

    pub fn previous_dir(&self) -> &Path {
        &self.previous_dir
    }

    pub fn changes_dir(&self) -> &Path {
        &self.changes_dir
    }

    /// Create all three directories if absent. Called once per cycle so a
    /// first run has a current directory to rotate.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        for dir in [&self.current_dir, &self.previous_dir, &self.changes_dir] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    /// Deterministic snapshot file name for a category and price window.
    pub fn snapshot_file_name(category_name: &str, low_price: u64, top_price: u64) -> String {
        let safe_name: String = category_name
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '-' } else { c })
            .collect();
        format!("{safe_name}_from_{low_price}_to_{top_price}.{SNAPSHOT_EXTENSION}")
    }

    /// Serialize one category's records into the current directory,
    /// overwriting any file of the same name.
    pub fn write_snapshot(
        &self,
        category_name: &str,
        records: &[ProductRecord],
        low_price: u64,
        top_price: u64,
    ) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.current_dir)
            .with_context(|| format!("creating {}", self.current_dir.display()))?;
        let path = self
            .current_dir
            .join(Self::snapshot_file_name(category_name, low_price, top_price));
        write_rows(&path, records)?;
        Ok(path)
    }

    /// Move every file from current to previous. The move is per-file, not
    /// atomic across the set; a crash mid-rotation leaves a partial previous
    /// set, which the next full cycle repairs.
    pub fn rotate(&self) -> anyhow::Result<()> {
        if !self.current_dir.exists() {
            bail!(
                "current snapshot directory {} does not exist",
                self.current_dir.display()
            );
        }
        fs::create_dir_all(&self.previous_dir)
            .with_context(|| format!("creating {}", self.previous_dir.display()))?;

        let mut moved = 0usize;
        for entry in fs::read_dir(&self.current_dir)
            .with_context(|| format!("reading {}", self.current_dir.display()))?
        {
            let entry = entry.context("reading current directory entry")?;
            let target = self.previous_dir.join(entry.file_name());
            fs::rename(entry.path(), &target).with_context(|| {
                format!("moving {} -> {}", entry.path().display(), target.display())
            })?;
            moved += 1;
        }

        if moved == 0 {
            warn!(dir = %self.current_dir.display(), "nothing to rotate, current directory is empty");
        }
        Ok(())
    }

    /// Snapshot file names currently present, in sorted order.
    pub fn current_files(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.current_dir)
            .with_context(|| format!("reading {}", self.current_dir.display()))?
        {
            let entry = entry.context("reading current directory entry")?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Both sides of a snapshot pair, or `None` when no previous baseline
    /// exists for that file name.
    pub fn read_pair(
        &self,
        file_name: &str,
    ) -> anyhow::Result<Option<(Vec<ProductRecord>, Vec<ProductRecord>)>> {
        let previous_path = self.previous_dir.join(file_name);
        if !previous_path.exists() {
            return Ok(None);
        }
        let current = read_rows(&self.current_dir.join(file_name))?;
        let previous = read_rows(&previous_path)?;
        Ok(Some((current, previous)))
    }

    /// Persist detected changes for one snapshot file.
    pub fn write_changes(
        &self,
        snapshot_file_name: &str,
        changes: &[ChangeRecord],
    ) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.changes_dir)
            .with_context(|| format!("creating {}", self.changes_dir.display()))?;
        let path = self
            .changes_dir
            .join(format!("{CHANGES_PREFIX}{snapshot_file_name}"));
        write_rows(&path, changes)?;
        Ok(path)
    }

    pub fn read_changes(&self, snapshot_file_name: &str) -> anyhow::Result<Vec<ChangeRecord>> {
        read_rows(
            &self
                .changes_dir
                .join(format!("{CHANGES_PREFIX}{snapshot_file_name}")),
        )
    }
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.with_context(|| format!("reading row from {}", path.display()))?);
    }
    Ok(rows)
}

/// Bounded fixed-delay retry for listing and catalog requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            proxy_url: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("no success after {attempts} attempts for {url}, last status {last_status:?}")]
    RetriesExhausted {
        attempts: usize,
        url: String,
        last_status: Option<u16>,
    },
}

pub fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Shared read-only HTTP client: proxy and headers are configured once and
/// never mutated during a run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy_url) = &config.proxy_url {
            let proxy = reqwest::Proxy::http(proxy_url)
                .with_context(|| format!("configuring proxy {proxy_url}"))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// GET a JSON document, retrying on non-success statuses and transient
    /// transport errors up to the configured attempt bound.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, FetchError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_status: Option<StatusCode> = None;

        for attempt in 1..=attempts {
            match self.client.get(url).header("Accept", "*/*").send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }
                    last_status = Some(status);
                    warn!(%url, attempt, status = status.as_u16(), "request returned non-success status");
                }
                Err(err) if is_transient(&err) => {
                    warn!(%url, attempt, error = %err, "transient request error");
                }
                Err(err) => return Err(FetchError::Request(err)),
            }

            if attempt < attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts,
            url: url.to_string(),
            last_status: last_status.map(|s| s.as_u16()),
        })
    }
}
