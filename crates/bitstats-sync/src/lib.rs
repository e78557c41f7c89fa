//! Sync pipeline orchestration: secrets, object-store round trip and link reconciliation.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitstats_adapters::{BitlyClient, StatsApi, DEFAULT_API_BASE_URL};
use bitstats_core::yesterday_cutoff;
use bitstats_storage::{
    DirSecretStore, EnvSecretStore, FsObjectStore, HttpClientConfig, HttpFetcher, JsonLinesSink,
    ObjectStore, SecretStore, SqliteRecordStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

mod error;
pub mod reconcile;
pub mod report;

pub use error::SyncError;
pub use reconcile::{reconcile, ReconcileOptions, ReconcileReport};
pub use report::report_markdown;

pub const CRATE_NAME: &str = "bitstats-sync";

/// What to do when a single link fails mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkFailurePolicy {
    /// Stop processing the remaining links and fail the run.
    Abort,
    /// Log the failure, attempt every remaining link, then fail the run.
    Continue,
}

impl FromStr for LinkFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            other => anyhow::bail!("unknown link failure policy {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub token_name: String,
    pub database_name: String,
    pub bucket_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub secrets_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub link_failure_policy: LinkFailurePolicy,
    pub channel_capacity: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token_name: "/bitly/apptoken".to_string(),
            database_name: "bitly-stats.db".to_string(),
            bucket_dir: PathBuf::from("./bucket"),
            temp_dir: PathBuf::from("."),
            secrets_dir: None,
            user_agent: "bitstats/0.1".to_string(),
            http_timeout_secs: 20,
            link_failure_policy: LinkFailurePolicy::Abort,
            channel_capacity: 16,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: std::env::var("BITSTATS_API_BASE_URL").unwrap_or(defaults.api_base_url),
            token_name: std::env::var("BITSTATS_TOKEN_NAME").unwrap_or(defaults.token_name),
            database_name: std::env::var("BITSTATS_DATABASE_NAME")
                .unwrap_or(defaults.database_name),
            bucket_dir: std::env::var("BITSTATS_BUCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.bucket_dir),
            temp_dir: std::env::var("BITSTATS_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            secrets_dir: std::env::var("BITSTATS_SECRETS_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("BITSTATS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("BITSTATS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            link_failure_policy: std::env::var("BITSTATS_LINK_FAILURE_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.link_failure_policy),
            channel_capacity: std::env::var("BITSTATS_CHANNEL_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.channel_capacity),
            scheduler_enabled: std::env::var("BITSTATS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("BITSTATS_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    /// Where the downloaded data file lives during a run.
    pub fn local_database_path(&self) -> PathBuf {
        self.temp_dir.join(&self.database_name)
    }

    fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            policy: self.link_failure_policy,
            channel_capacity: self.channel_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub yesterday: String,
    pub links_total: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub uploaded: bool,
    pub data_file_sha256: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    api: Arc<dyn StatsApi>,
    secrets: Box<dyn SecretStore>,
    objects: Box<dyn ObjectStore>,
    clock: fn() -> DateTime<Utc>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let api = Arc::new(BitlyClient::new(http, config.api_base_url.clone()));
        let secrets: Box<dyn SecretStore> = match &config.secrets_dir {
            Some(dir) => Box::new(DirSecretStore::new(dir.clone())),
            None => Box::new(EnvSecretStore),
        };
        let objects = Box::new(FsObjectStore::new(config.bucket_dir.clone()));
        Ok(Self::with_collaborators(config, api, secrets, objects))
    }

    pub fn with_collaborators(
        config: SyncConfig,
        api: Arc<dyn StatsApi>,
        secrets: Box<dyn SecretStore>,
        objects: Box<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            api,
            secrets,
            objects,
            clock: Utc::now,
            run_lock: Mutex::new(()),
        }
    }

    /// Replace the wall clock used for `started_at` and the yesterday cutoff.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Backup, download, reconcile into the data file, upload.
    ///
    /// Backup and download failures abort before any stats call. The upload is
    /// attempted even when reconciliation failed so rows already inserted are kept;
    /// the reconciliation error is still returned.
    pub async fn run_once(&self, request_id: &str) -> Result<SyncRunSummary, SyncError> {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, request_id);
        self.run_with_bucket(run_id, request_id).instrument(span).await
    }

    /// Reconcile without touching object storage, writing each record as a JSON
    /// line to `out` instead of inserting it.
    pub async fn dry_run<W>(&self, request_id: &str, out: W) -> Result<SyncRunSummary, SyncError>
    where
        W: std::io::Write + Send,
    {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_dry_run", %run_id, request_id);
        self.run_to_writer(run_id, request_id, out)
            .instrument(span)
            .await
    }

    async fn run_with_bucket(
        &self,
        run_id: Uuid,
        request_id: &str,
    ) -> Result<SyncRunSummary, SyncError> {
        let started_at = (self.clock)();
        let yesterday = yesterday_cutoff(started_at);
        info!(yesterday, "sync started");

        let token = self.token().await?;
        let db_name = self.config.database_name.as_str();

        self.objects
            .backup(db_name)
            .await
            .map_err(SyncError::from)
            .inspect_err(|err| error!(stage = "backup", error = %err, "sync failed"))?;
        let local = self
            .objects
            .download(db_name, &self.config.temp_dir)
            .await
            .map_err(SyncError::from)
            .inspect_err(|err| error!(stage = "download", error = %err, "sync failed"))?;
        let store = SqliteRecordStore::open(&local)
            .await
            .map_err(SyncError::from)
            .inspect_err(|err| error!(stage = "open_database", error = %err, "sync failed"))?;

        let reconciled = reconcile(
            self.api.as_ref(),
            &store,
            &token,
            &yesterday,
            self.config.reconcile_options(),
        )
        .await;
        store.close().await;

        let uploaded = self.objects.upload(&local, db_name).await;
        let (report, stored) = match (reconciled, uploaded) {
            (Ok(report), Ok(stored)) => (report, stored),
            (Err(err), uploaded) => {
                error!(stage = "reconcile", error = %err, "sync failed");
                if let Err(upload_err) = uploaded {
                    error!(stage = "upload", error = %upload_err, "upload after failed reconciliation");
                }
                return Err(err);
            }
            (Ok(_), Err(err)) => {
                error!(stage = "upload", error = %err, "sync failed");
                return Err(err.into());
            }
        };

        fail_on_link_failures(&report)?;

        let summary = SyncRunSummary {
            run_id,
            request_id: request_id.to_string(),
            started_at,
            finished_at: (self.clock)(),
            yesterday,
            links_total: report.links_total,
            persisted: report.persisted,
            skipped: report.skipped,
            failed: report.failures.len(),
            uploaded: true,
            data_file_sha256: Some(stored.sha256),
        };
        info!(persisted = summary.persisted, skipped = summary.skipped, "sync complete");
        Ok(summary)
    }

    async fn run_to_writer<W>(
        &self,
        run_id: Uuid,
        request_id: &str,
        out: W,
    ) -> Result<SyncRunSummary, SyncError>
    where
        W: std::io::Write + Send,
    {
        let started_at = (self.clock)();
        let yesterday = yesterday_cutoff(started_at);
        let token = self.token().await?;

        let sink = JsonLinesSink::new(out);
        let report = reconcile(
            self.api.as_ref(),
            &sink,
            &token,
            &yesterday,
            self.config.reconcile_options(),
        )
        .await
        .inspect_err(|err| error!(stage = "reconcile", error = %err, "dry run failed"))?;
        fail_on_link_failures(&report)?;

        Ok(SyncRunSummary {
            run_id,
            request_id: request_id.to_string(),
            started_at,
            finished_at: (self.clock)(),
            yesterday,
            links_total: report.links_total,
            persisted: report.persisted,
            skipped: report.skipped,
            failed: 0,
            uploaded: false,
            data_file_sha256: None,
        })
    }

    async fn token(&self) -> Result<String, SyncError> {
        self.secrets
            .get_parameter(&self.config.token_name, true)
            .await
            .map_err(SyncError::from)
            .inspect_err(|err| error!(stage = "secret", error = %err, "sync failed"))
    }
}

fn fail_on_link_failures(report: &ReconcileReport) -> Result<(), SyncError> {
    if report.failures.is_empty() {
        return Ok(());
    }
    for failure in &report.failures {
        error!(stage = "reconcile", link_id = %failure.link_id, error = %failure.error, "link failed");
    }
    Err(SyncError::LinksFailed {
        failed: report.failures.len(),
        total: report.links_total,
    })
}

pub async fn run_sync_once_from_env(request_id: &str) -> anyhow::Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    Ok(pipeline.run_once(request_id).await?)
}

/// Create an empty data file with the `links` table.
pub async fn init_database(path: &Path) -> anyhow::Result<()> {
    let store = SqliteRecordStore::create(path)
        .await
        .with_context(|| format!("creating database {}", path.display()))?;
    store.close().await;
    Ok(())
}

/// In-process cron running `run_once` with a fresh request id per tick.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> anyhow::Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let request_id = format!("cron-{}", Uuid::new_v4());
            match pipeline.run_once(&request_id).await {
                Ok(summary) => info!(
                    request_id = %request_id,
                    persisted = summary.persisted,
                    skipped = summary.skipped,
                    "scheduled sync complete"
                ),
                Err(err) => error!(request_id = %request_id, error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
