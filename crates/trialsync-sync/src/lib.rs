//! Sync pipeline orchestration: fetch, normalize, diff, archive, write and publish.
//!
//! A run assumes it is the only one touching its data directory; `run_once`
//! enforces that with a [`RunLock`] before any snapshot is read.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use trialsync_adapters::{
    fetch_version, normalize_batch, AdapterError, HttpPageSource, InterventionLinkage,
    KeyStrategy, NormalizerOptions, PageSource, PaginatedFetcher,
};
use trialsync_core::{FeedVersion, Row, Table, TableSet};
use trialsync_storage::{
    Archiver, HttpClientConfig, HttpFetcher, LockError, RunLock, SnapshotStore,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trialsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: String,
    pub version_url: String,
    pub target_url: String,
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
    pub normalizer: NormalizerOptions,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source_url: "https://clinicaltrials.gov/api/v2/studies".to_string(),
            version_url: "https://clinicaltrials.gov/api/v2/version".to_string(),
            target_url: "http://localhost:5000/upload".to_string(),
            data_dir: PathBuf::from("./data"),
            archive_dir: PathBuf::from("./archive"),
            user_agent: "trialsync/0.1".to_string(),
            http_timeout_secs: 30,
            sync_cron: "0 0 * * * *".to_string(),
            normalizer: NormalizerOptions::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let key_strategy = match std::env::var("TRIALSYNC_KEY_STRATEGY") {
            Ok(v) => v
                .parse::<KeyStrategy>()
                .context("parsing TRIALSYNC_KEY_STRATEGY")?,
            Err(_) => defaults.normalizer.keys,
        };
        let linkage = match std::env::var("TRIALSYNC_INTERVENTION_LINKAGE") {
            Ok(v) => v
                .parse::<InterventionLinkage>()
                .context("parsing TRIALSYNC_INTERVENTION_LINKAGE")?,
            Err(_) => defaults.normalizer.intervention_linkage,
        };

        Ok(Self {
            source_url: std::env::var("SOURCE_URL").unwrap_or(defaults.source_url),
            version_url: std::env::var("VERSION_URL").unwrap_or(defaults.version_url),
            target_url: std::env::var("TARGET_URL").unwrap_or(defaults.target_url),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            archive_dir: std::env::var("ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            user_agent: std::env::var("TRIALSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("TRIALSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            sync_cron: std::env::var("TRIALSYNC_SYNC_CRON").unwrap_or(defaults.sync_cron),
            normalizer: NormalizerOptions {
                keys: key_strategy,
                intervention_linkage: linkage,
            },
        })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("another run holds the lock at {}", path.display())]
    RunInProgress { path: PathBuf },
    #[error("storage failure on {table}: {source:#}")]
    StorageFailure {
        table: Table,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Errors that should stop a scheduler rather than wait for the next tick.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::RunInProgress { .. })
    }

    fn storage(table: Table, source: anyhow::Error) -> Self {
        SyncError::StorageFailure { table, source }
    }
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { path } => SyncError::RunInProgress { path },
            other => SyncError::Other(other.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableDiff {
    pub table: Table,
    pub existing_rows: usize,
    pub fresh_rows: usize,
    pub changed: bool,
}

/// Per-table change flags for one pipeline. The composite decision is their OR.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub tables: Vec<TableDiff>,
}

impl SnapshotDiff {
    pub fn any_changed(&self) -> bool {
        self.tables.iter().any(|t| t.changed)
    }

    pub fn changed_tables(&self) -> Vec<Table> {
        self.tables
            .iter()
            .filter(|t| t.changed)
            .map(|t| t.table)
            .collect()
    }

    pub fn get(&self, table: Table) -> Option<&TableDiff> {
        self.tables.iter().find(|t| t.table == table)
    }
}

/// Order-sensitive equality of fresh rows (as they would be written) against persisted rows.
pub fn table_unchanged(table: Table, fresh: &[Row], existing: &[Row]) -> bool {
    let columns = table.columns();
    fresh.len() == existing.len()
        && fresh
            .iter()
            .zip(existing)
            .all(|(new, old)| new.project(columns).cells() == old.cells())
}

pub fn diff_snapshots(fresh: &TableSet, existing: &TableSet, tables: &[Table]) -> SnapshotDiff {
    SnapshotDiff {
        tables: tables
            .iter()
            .map(|&table| {
                let new_rows = fresh.rows(table);
                let old_rows = existing.rows(table);
                TableDiff {
                    table,
                    existing_rows: old_rows.len(),
                    fresh_rows: new_rows.len(),
                    changed: !table_unchanged(table, new_rows, old_rows),
                }
            })
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published {
        status: u16,
        bytes: usize,
        sha256: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub table: Table,
    pub file: String,
    pub outcome: PublishOutcome,
}

impl PublishReport {
    pub fn is_published(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Published { .. })
    }
}

/// Uploads snapshot files to the downstream endpoint. Failures are reported, never raised.
#[derive(Debug, Clone)]
pub struct Publisher {
    http: HttpFetcher,
    target_url: String,
}

impl Publisher {
    pub fn new(http: HttpFetcher, target_url: impl Into<String>) -> Self {
        Self {
            http,
            target_url: target_url.into(),
        }
    }

    pub async fn publish(&self, run_id: Uuid, table: Table, path: &Path) -> PublishReport {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| table.file_name());
        let outcome = match self.http.upload_file(run_id, &self.target_url, path).await {
            Ok(receipt) => {
                info!(%table, status = receipt.status.as_u16(), bytes = receipt.byte_size, "published table");
                PublishOutcome::Published {
                    status: receipt.status.as_u16(),
                    bytes: receipt.byte_size,
                    sha256: receipt.sha256,
                }
            }
            Err(err) => {
                warn!(%table, error = %err, "publish failed; continuing with next table");
                PublishOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };
        PublishReport {
            table,
            file,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotOutcome {
    pub diff: SnapshotDiff,
    pub applied: bool,
    pub archived: Vec<Table>,
    pub publishes: Vec<PublishReport>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StudyFetchStats {
    pub pages: usize,
    pub studies: usize,
    pub duplicates_dropped: usize,
    pub unidentified_dropped: usize,
    pub truncated: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudySyncSummary {
    pub fetch: StudyFetchStats,
    /// `None` when no page could be fetched and the snapshot was left alone.
    pub snapshot: Option<SnapshotOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionSyncSummary {
    pub version: Option<FeedVersion>,
    pub error: Option<String>,
    pub snapshot: Option<SnapshotOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub studies: StudySyncSummary,
    pub version: VersionSyncSummary,
}

impl SyncRunSummary {
    pub fn published_tables(&self) -> usize {
        [&self.studies.snapshot, &self.version.snapshot]
            .into_iter()
            .flatten()
            .flat_map(|s| s.publishes.iter())
            .filter(|p| p.is_published())
            .count()
    }

    pub fn failed_publishes(&self) -> usize {
        [&self.studies.snapshot, &self.version.snapshot]
            .into_iter()
            .flatten()
            .flat_map(|s| s.publishes.iter())
            .filter(|p| !p.is_published())
            .count()
    }
}

/// Dry-run view: what a run would decide, without touching the filesystem.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPlan {
    pub fetch: StudyFetchStats,
    pub studies: Option<SnapshotDiff>,
    pub version: Option<SnapshotDiff>,
    pub version_error: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: SnapshotStore,
    archiver: Archiver,
    http: HttpFetcher,
    publisher: Publisher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        Ok(Self {
            store: SnapshotStore::new(config.data_dir.clone()),
            archiver: Archiver::new(config.archive_dir.clone()),
            publisher: Publisher::new(http.clone(), config.target_url.clone()),
            http,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id);

        async {
            let _lock = RunLock::acquire(&self.config.data_dir, &run_id.to_string())?;
            let source = HttpPageSource::new(&self.http, run_id);

            let (fetch, fresh) = self.collect_studies(&source).await?;
            let studies_snapshot = match fresh {
                Some(fresh) => Some(
                    self.reconcile(run_id, &fresh, &Table::STUDY_TABLES)
                        .await?,
                ),
                None => {
                    warn!("no study page could be fetched; leaving snapshot untouched");
                    None
                }
            };

            let (version, version_error) = self.collect_version(&source).await;
            let version_snapshot = match &version {
                Some(version) => Some(
                    self.reconcile(run_id, &version_table(version), &[Table::Version])
                        .await?,
                ),
                None => None,
            };

            let summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                studies: StudySyncSummary {
                    fetch,
                    snapshot: studies_snapshot,
                },
                version: VersionSyncSummary {
                    version,
                    error: version_error,
                    snapshot: version_snapshot,
                },
            };
            info!(
                published = summary.published_tables(),
                failed = summary.failed_publishes(),
                "sync run finished"
            );
            Ok::<_, SyncError>(summary)
        }
        .instrument(span)
        .await
    }

    pub async fn plan(&self) -> Result<SyncPlan, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_plan", %run_id);

        async {
            let source = HttpPageSource::new(&self.http, run_id);
            let (fetch, fresh) = self.collect_studies(&source).await?;
            let studies = match fresh {
                Some(fresh) => Some(self.diff_against_store(&fresh, &Table::STUDY_TABLES).await?),
                None => None,
            };

            let (version, version_error) = self.collect_version(&source).await;
            let version = match version {
                Some(version) => Some(
                    self.diff_against_store(&version_table(&version), &[Table::Version])
                        .await?,
                ),
                None => None,
            };

            Ok::<_, SyncError>(SyncPlan {
                fetch,
                studies,
                version,
                version_error,
            })
        }
        .instrument(span)
        .await
    }

    /// `None` tables when the walk failed before a single page arrived.
    async fn collect_studies<S: PageSource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<(StudyFetchStats, Option<TableSet>), SyncError> {
        let outcome = PaginatedFetcher::new(source, self.config.source_url.clone())
            .fetch_all()
            .await?;
        let stats = StudyFetchStats {
            pages: outcome.pages,
            studies: outcome.studies.len(),
            duplicates_dropped: outcome.duplicates_dropped,
            unidentified_dropped: outcome.unidentified_dropped,
            truncated: outcome.truncated.as_ref().map(ToString::to_string),
        };
        if outcome.pages == 0 {
            return Ok((stats, None));
        }

        let fresh = normalize_batch(&outcome.studies, self.config.normalizer);
        info!(
            studies = stats.studies,
            rows = fresh.total_rows(),
            truncated = stats.truncated.is_some(),
            "normalized study batch"
        );
        Ok((stats, Some(fresh)))
    }

    async fn collect_version<S: PageSource + ?Sized>(
        &self,
        source: &S,
    ) -> (Option<FeedVersion>, Option<String>) {
        match fetch_version(source, &self.config.version_url).await {
            Ok(version) => (Some(version), None),
            Err(err) => {
                warn!(error = %err, "version fetch failed; skipping version snapshot");
                (None, Some(err.to_string()))
            }
        }
    }

    async fn load_existing(&self, tables: &[Table]) -> Result<TableSet, SyncError> {
        let mut existing = TableSet::with_tables(tables);
        for &table in tables {
            let rows = self
                .store
                .read(table)
                .await
                .map_err(|err| SyncError::storage(table, err))?;
            existing.set_rows(table, rows);
        }
        Ok(existing)
    }

    async fn diff_against_store(
        &self,
        fresh: &TableSet,
        tables: &[Table],
    ) -> Result<SnapshotDiff, SyncError> {
        let existing = self.load_existing(tables).await?;
        Ok(diff_snapshots(fresh, &existing, tables))
    }

    /// Diff, then on any change archive, rewrite and publish every table in `tables`.
    async fn reconcile(
        &self,
        run_id: Uuid,
        fresh: &TableSet,
        tables: &[Table],
    ) -> Result<SnapshotOutcome, SyncError> {
        let diff = self.diff_against_store(fresh, tables).await?;
        if !diff.any_changed() {
            info!(tables = tables.len(), "no updates; snapshot left untouched");
            return Ok(SnapshotOutcome {
                diff,
                applied: false,
                archived: Vec::new(),
                publishes: Vec::new(),
            });
        }
        info!(changed = ?diff.changed_tables(), "snapshot changed; republishing all tables");

        // Archive right before each write: a failure leaves later tables at their previous version.
        let mut archived = Vec::new();
        let mut written = Vec::with_capacity(tables.len());
        for &table in tables {
            let moved = self
                .archiver
                .archive(&self.store.path_for(table))
                .await
                .map_err(|err| SyncError::storage(table, err))?;
            if moved.is_some() {
                archived.push(table);
            }
            let snapshot = self
                .store
                .write(table, fresh.rows(table))
                .await
                .map_err(|err| SyncError::storage(table, err))?;
            written.push(snapshot);
        }

        let mut publishes = Vec::with_capacity(written.len());
        for snapshot in &written {
            publishes.push(
                self.publisher
                    .publish(run_id, snapshot.table, &snapshot.path)
                    .await,
            );
        }

        Ok(SnapshotOutcome {
            diff,
            applied: true,
            archived,
            publishes,
        })
    }
}

fn version_table(version: &FeedVersion) -> TableSet {
    let mut set = TableSet::with_tables(&[Table::Version]);
    set.push(Table::Version, version.to_row());
    set
}

/// Run immediately, then on `sync_cron`, until Ctrl-C or a fatal run error.
pub async fn run_scheduled(pipeline: Arc<SyncPipeline>) -> Result<()> {
    run_logged(&pipeline).await?;

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();
    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let job_pipeline = pipeline.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = job_pipeline.clone();
        let fatal_tx = fatal_tx.clone();
        Box::pin(async move {
            if let Err(err) = run_logged(&pipeline).await {
                let _ = fatal_tx.send(err.to_string());
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "scheduler started");

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("shutdown requested");
            Ok(())
        }
        Some(reason) = fatal_rx.recv() => {
            Err(anyhow::anyhow!("stopping scheduler after fatal run error: {reason}"))
        }
    };

    sched.shutdown().await.context("shutting down scheduler")?;
    result
}

/// One scheduled run. Non-fatal errors are logged and swallowed.
async fn run_logged(pipeline: &SyncPipeline) -> Result<(), SyncError> {
    match pipeline.run_once().await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                studies = summary.studies.fetch.studies,
                published = summary.published_tables(),
                "scheduled run complete"
            );
            Ok(())
        }
        Err(err) if !err.is_fatal() => {
            warn!(error = %err, "skipping scheduled run");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "scheduled run failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};
    use tempfile::{tempdir, TempDir};
    use trialsync_adapters::load_json_file;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(name: &str) -> JsonValue {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        load_json_file(root.join(name)).unwrap()
    }

    fn config_for(server: &MockServer, dir: &TempDir) -> SyncConfig {
        SyncConfig {
            source_url: format!("{}/api/v2/studies", server.uri()),
            version_url: format!("{}/api/v2/version", server.uri()),
            target_url: format!("{}/upload", server.uri()),
            data_dir: dir.path().join("data"),
            archive_dir: dir.path().join("archive"),
            http_timeout_secs: 5,
            ..SyncConfig::default()
        }
    }

    async fn mount_feed(server: &MockServer, page1: JsonValue, page2: ResponseTemplate, version: JsonValue) {
        Mock::given(method("GET"))
            .and(path("/api/v2/studies"))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page1))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/studies"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(page2)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(version))
            .mount(server)
            .await;
    }

    async fn mount_upload(server: &MockServer, status: u16) {
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(status))
            .mount(server)
            .await;
    }

    async fn mount_fixture_feed(server: &MockServer) {
        mount_feed(
            server,
            fixture("studies/page1.json"),
            ResponseTemplate::new(200).set_body_json(fixture("studies/page2.json")),
            fixture("version.json"),
        )
        .await;
        mount_upload(server, 200).await;
    }

    async fn upload_count(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.method.to_string() == "POST")
            .count()
    }

    fn archive_names(dir: &TempDir) -> Vec<String> {
        let mut names = std::fs::read_dir(dir.path().join("archive"))
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn rows(values: &[(&str, &str)]) -> Vec<Row> {
        values
            .iter()
            .map(|(id, name)| {
                Row::new()
                    .with("condition_id", *id)
                    .with("study_id", "NCT1")
                    .with("condition_name", *name)
            })
            .collect()
    }

    #[test]
    fn empty_against_empty_is_unchanged() {
        let diff = diff_snapshots(&TableSet::new(), &TableSet::new(), &Table::STUDY_TABLES);
        assert_eq!(diff.tables.len(), 13);
        assert!(!diff.any_changed());
    }

    #[test]
    fn row_order_value_and_count_differences_are_changes() {
        let base = rows(&[("a", "x"), ("b", "y")]);
        assert!(table_unchanged(Table::Conditions, &base, &base));
        assert!(!table_unchanged(
            Table::Conditions,
            &rows(&[("b", "y"), ("a", "x")]),
            &base
        ));
        assert!(!table_unchanged(
            Table::Conditions,
            &rows(&[("a", "x"), ("b", "z")]),
            &base
        ));
        assert!(!table_unchanged(Table::Conditions, &rows(&[("a", "x")]), &base));
    }

    #[test]
    fn fresh_rows_compare_as_written() {
        let fresh = vec![Row::new()
            .with("study_id", "NCT1")
            .with("condition_id", "a")
            .with("extra", "dropped on write")];
        let persisted = vec![Row::new()
            .with("condition_id", "a")
            .with("study_id", "NCT1")
            .with("condition_name", "")];
        assert!(table_unchanged(Table::Conditions, &fresh, &persisted));
    }

    #[test]
    fn composite_decision_is_an_or_over_tables() {
        let mut fresh = TableSet::with_tables(&Table::STUDY_TABLES);
        fresh.set_rows(Table::Conditions, rows(&[("a", "x")]));
        let existing = TableSet::with_tables(&Table::STUDY_TABLES);
        let diff = diff_snapshots(&fresh, &existing, &Table::STUDY_TABLES);
        assert!(diff.any_changed());
        assert_eq!(diff.changed_tables(), vec![Table::Conditions]);
        assert_eq!(diff.get(Table::Conditions).unwrap().fresh_rows, 1);
    }

    #[test]
    fn only_lock_contention_is_non_fatal() {
        assert!(!SyncError::RunInProgress { path: PathBuf::from("x") }.is_fatal());
        assert!(SyncError::storage(Table::Arms, anyhow::anyhow!("disk full")).is_fatal());
    }

    #[tokio::test]
    async fn second_identical_run_is_a_noop() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();

        let first = pipeline.run_once().await.unwrap();
        let studies = first.studies.snapshot.as_ref().unwrap();
        assert!(studies.applied);
        assert!(studies.archived.is_empty());
        assert_eq!(studies.publishes.len(), 13);
        assert!(first.version.snapshot.as_ref().unwrap().applied);
        assert_eq!(first.published_tables(), 14);
        assert_eq!(upload_count(&server).await, 14);

        let second = pipeline.run_once().await.unwrap();
        let studies = second.studies.snapshot.as_ref().unwrap();
        assert!(!studies.applied);
        assert!(!studies.diff.any_changed());
        assert!(studies.publishes.is_empty());
        assert!(!second.version.snapshot.as_ref().unwrap().applied);
        assert_eq!(upload_count(&server).await, 14);
        assert!(archive_names(&dir).is_empty());
        RunLock::acquire(&dir.path().join("data"), "after-runs").unwrap();
    }

    #[tokio::test]
    async fn one_changed_table_republishes_all_thirteen() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();
        pipeline.run_once().await.unwrap();

        server.reset().await;
        let mut page1 = fixture("studies/page1.json");
        page1["studies"][1]["protocolSection"]["conditionsModule"]["conditions"][0] =
            json!("Pediatric Asthma");
        mount_feed(
            &server,
            page1,
            ResponseTemplate::new(200).set_body_json(fixture("studies/page2.json")),
            fixture("version.json"),
        )
        .await;
        mount_upload(&server, 200).await;

        let summary = pipeline.run_once().await.unwrap();
        let studies = summary.studies.snapshot.as_ref().unwrap();
        assert_eq!(studies.diff.changed_tables(), vec![Table::Conditions]);
        assert!(studies.applied);
        assert_eq!(studies.archived.len(), 13);
        assert_eq!(studies.publishes.len(), 13);
        assert!(!summary.version.snapshot.as_ref().unwrap().applied);
        assert_eq!(upload_count(&server).await, 13);

        let mut expected = Table::STUDY_TABLES
            .iter()
            .map(|t| t.file_name())
            .collect::<Vec<_>>();
        expected.sort();
        assert_eq!(archive_names(&dir), expected);

        let store = SnapshotStore::new(dir.path().join("data"));
        let conditions = store.read(Table::Conditions).await.unwrap();
        assert!(conditions
            .iter()
            .any(|r| r.get("condition_name") == Some("Pediatric Asthma")));
    }

    #[tokio::test]
    async fn failed_second_page_still_applies_first_page() {
        let server = MockServer::start().await;
        mount_feed(
            &server,
            fixture("studies/page1.json"),
            ResponseTemplate::new(500),
            fixture("version.json"),
        )
        .await;
        mount_upload(&server, 200).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.studies.fetch.pages, 1);
        assert_eq!(summary.studies.fetch.studies, 2);
        assert!(summary.studies.fetch.truncated.is_some());
        assert!(summary.studies.snapshot.as_ref().unwrap().applied);

        let store = SnapshotStore::new(dir.path().join("data"));
        assert_eq!(store.read(Table::Studies).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unreachable_feed_leaves_snapshot_untouched() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();
        pipeline.run_once().await.unwrap();

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let summary = pipeline.run_once().await.unwrap();
        assert!(summary.studies.snapshot.is_none());
        assert!(summary.studies.fetch.truncated.is_some());
        assert!(summary.version.snapshot.is_none());
        assert!(summary.version.error.is_some());
        assert!(archive_names(&dir).is_empty());

        let store = SnapshotStore::new(dir.path().join("data"));
        assert_eq!(store.read(Table::Studies).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn publish_failures_do_not_block_other_tables() {
        let server = MockServer::start().await;
        mount_feed(
            &server,
            fixture("studies/page1.json"),
            ResponseTemplate::new(200).set_body_json(fixture("studies/page2.json")),
            fixture("version.json"),
        )
        .await;
        mount_upload(&server, 500).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();

        let summary = pipeline.run_once().await.unwrap();
        let studies = summary.studies.snapshot.as_ref().unwrap();
        assert_eq!(studies.publishes.len(), 13);
        assert!(studies.publishes.iter().all(|p| !p.is_published()));
        assert_eq!(summary.failed_publishes(), 14);
        assert_eq!(upload_count(&server).await, 14);
        assert!(dir.path().join("data").join(Table::Locations.file_name()).exists());
    }

    #[tokio::test]
    async fn version_change_republishes_only_the_version_table() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();
        pipeline.run_once().await.unwrap();

        server.reset().await;
        mount_feed(
            &server,
            fixture("studies/page1.json"),
            ResponseTemplate::new(200).set_body_json(fixture("studies/page2.json")),
            json!({ "apiVersion": "2.0.3", "dataTimestamp": "2024-10-02T09:00:00" }),
        )
        .await;
        mount_upload(&server, 200).await;

        let summary = pipeline.run_once().await.unwrap();
        assert!(!summary.studies.snapshot.as_ref().unwrap().applied);
        let version = summary.version.snapshot.as_ref().unwrap();
        assert!(version.applied);
        assert_eq!(version.archived, vec![Table::Version]);
        assert_eq!(archive_names(&dir), vec![Table::Version.file_name()]);
        assert_eq!(upload_count(&server).await, 1);
    }

    #[tokio::test]
    async fn lock_file_left_by_a_killed_run_does_not_block_later_runs() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let config = config_for(&server, &dir);
        std::fs::create_dir_all(&config.data_dir).unwrap();
        std::fs::write(config.data_dir.join(RunLock::FILE_NAME), "dead-run").unwrap();
        let pipeline = SyncPipeline::new(config).unwrap();

        for _ in 0..2 {
            run_logged(&pipeline).await.unwrap();
        }
        assert_eq!(upload_count(&server).await, 14);
        let summary = pipeline.run_once().await.unwrap();
        assert!(!summary.studies.snapshot.unwrap().applied);
    }

    #[tokio::test]
    async fn storage_failure_mid_run_keeps_unwritten_tables_in_place() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();
        pipeline.run_once().await.unwrap();
        let store = SnapshotStore::new(dir.path().join("data"));
        let before = store.read(Table::Locations).await.unwrap();

        server.reset().await;
        let mut page1 = fixture("studies/page1.json");
        page1["studies"][1]["protocolSection"]["conditionsModule"]["conditions"][0] =
            json!("Pediatric Asthma");
        mount_feed(
            &server,
            page1,
            ResponseTemplate::new(200).set_body_json(fixture("studies/page2.json")),
            fixture("version.json"),
        )
        .await;
        mount_upload(&server, 200).await;

        // A directory squatting on the archive name makes archiving Conditions fail.
        let blocker = dir.path().join("archive").join(Table::Conditions.file_name());
        std::fs::create_dir_all(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::StorageFailure { table: Table::Conditions, .. }
        ));
        for table in Table::STUDY_TABLES {
            assert!(store.path_for(table).exists(), "{table} missing from data dir");
        }
        assert_eq!(store.read(Table::Locations).await.unwrap(), before);
        assert_eq!(upload_count(&server).await, 0);
    }

    #[tokio::test]
    async fn concurrent_run_is_refused_while_lock_is_held() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let config = config_for(&server, &dir);
        let _held = RunLock::acquire(&config.data_dir, "other-run").unwrap();
        let pipeline = SyncPipeline::new(config).unwrap();

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::RunInProgress { .. }));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn plan_reports_changes_without_writing() {
        let server = MockServer::start().await;
        mount_fixture_feed(&server).await;
        let dir = tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&server, &dir)).unwrap();

        let plan = pipeline.plan().await.unwrap();
        let studies = plan.studies.unwrap();
        assert_eq!(studies.changed_tables().len(), 13);
        assert!(plan.version.unwrap().any_changed());
        assert_eq!(plan.fetch.studies, 3);
        assert!(!dir.path().join("data").exists());
        assert_eq!(upload_count(&server).await, 0);
    }
}
