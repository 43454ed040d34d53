//! Flat-file snapshot storage, single-generation archive and HTTP transport for trialsync.

use std::fs::{File, OpenOptions as StdOpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use fs2::FileExt;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use trialsync_core::{Row, Table};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trialsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct WrittenSnapshot {
    pub table: Table,
    pub path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
    pub sha256: String,
}

/// One CSV file per table under `root`. Knows columns, not semantics.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, table: Table) -> PathBuf {
        self.root.join(table.file_name())
    }

    /// Rows as persisted; an absent file reads as an empty table.
    pub async fn read(&self, table: Table) -> anyhow::Result<Vec<Row>> {
        let path = self.path_for(table);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading snapshot {}", path.display()))
            }
        };
        decode_csv(&bytes).with_context(|| format!("parsing snapshot {}", path.display()))
    }

    /// Replace the table file with a fresh one via temp-file rename.
    pub async fn write(&self, table: Table, rows: &[Row]) -> anyhow::Result<WrittenSnapshot> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))?;

        let bytes = encode_csv(table.columns(), rows)?;
        let path = self.path_for(table);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", table.name(), Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(%table, rows = rows.len(), path = %path.display(), "snapshot written");
        Ok(WrittenSnapshot {
            table,
            path,
            rows: rows.len(),
            byte_size: bytes.len(),
            sha256: sha256_hex(&bytes),
        })
    }
}

/// Header row is always `columns`; each row is projected onto it.
pub fn encode_csv(columns: &[&str], rows: &[Row]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record(columns)
        .context("writing csv header")?;
    for row in rows {
        let projected = row.project(columns);
        writer
            .write_record(projected.cells().iter().map(|(_, value)| value.as_str()))
            .context("writing csv record")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing csv buffer: {}", err.error()))
}

pub fn decode_csv(bytes: &[u8]) -> anyhow::Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader.headers().context("reading csv header")?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("reading csv record")?;
        let row = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                (
                    name.to_string(),
                    record.get(idx).unwrap_or_default().to_string(),
                )
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Single-generation retention: the archived copy keeps its base name and is overwritten next time.
#[derive(Debug, Clone)]
pub struct Archiver {
    root: PathBuf,
}

impl Archiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move `path` into the archive. Returns `None` when there was nothing to move.
    pub async fn archive(&self, path: &Path) -> anyhow::Result<Option<PathBuf>> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }

        let file_name = path
            .file_name()
            .with_context(|| format!("archive source {} has no file name", path.display()))?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating archive directory {}", self.root.display()))?;
        let target = self.root.join(file_name);

        match fs::rename(path, &target).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::CrossesDevices => {
                fs::copy(path, &target).await.with_context(|| {
                    format!("copying {} -> {}", path.display(), target.display())
                })?;
                fs::remove_file(path)
                    .await
                    .with_context(|| format!("removing archived source {}", path.display()))?;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("moving {} -> {}", path.display(), target.display())
                })
            }
        }

        info!(from = %path.display(), to = %target.display(), "moved snapshot to archive");
        Ok(Some(target))
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("run lock {} is held", path.display())]
    Held { path: PathBuf },
    #[error("run lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Advisory lock on `.trialsync.lock` guarding one snapshot directory.
///
/// The file itself persists between runs and only records the last holder. The OS
/// releases the lock when the handle closes, including when the holding process dies.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub const FILE_NAME: &'static str = ".trialsync.lock";

    pub fn acquire(dir: &Path, holder: &str) -> Result<Self, LockError> {
        let path = dir.join(Self::FILE_NAME);
        std::fs::create_dir_all(dir).map_err(io_err(&path))?;

        let mut file = StdOpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err(&path))?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                return Err(LockError::Held { path })
            }
            Err(source) => return Err(LockError::Io { path, source }),
        }

        file.set_len(0).map_err(io_err(&path))?;
        file.write_all(holder.as_bytes()).map_err(io_err(&path))?;
        file.flush().map_err(io_err(&path))?;
        debug!(path = %path.display(), holder, "acquired run lock");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LockError {
    let path = path.to_path_buf();
    move |source| LockError::Io { path, source }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub status: StatusCode,
    pub byte_size: usize,
    pub sha256: String,
}

/// Retry-free HTTP transport. Every call is bounded by the client timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(&self, run_id: Uuid, url: &str) -> Result<JsonValue, TransportError> {
        let span = info_span!("http_get", %run_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(TransportError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?;
            serde_json::from_slice(&body).map_err(|source| TransportError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }

    /// POST the file as the multipart part `file`, keeping its base name.
    pub async fn upload_file(
        &self,
        run_id: Uuid,
        url: &str,
        path: &Path,
    ) -> Result<UploadReceipt, TransportError> {
        let span = info_span!("http_upload", %run_id, url, path = %path.display());
        async {
            let bytes = fs::read(path).await.map_err(|source| TransportError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let byte_size = bytes.len();
            let sha256 = sha256_hex(&bytes);
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "snapshot.csv".to_string());

            let part = Part::bytes(bytes)
                .file_name(file_name)
                .mime_str("text/csv")?;
            let form = Form::new().part("file", part);

            let resp = self.client.post(url).multipart(form).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(TransportError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            Ok(UploadReceipt {
                status,
                byte_size,
                sha256,
            })
        }
        .instrument(span)
        .await
    }
}
