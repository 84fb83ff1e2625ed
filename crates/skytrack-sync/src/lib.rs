//! Gap-filling sync: works out which hours are missing locally, fetches and
//! reconciles each one, and commits it in timestamp order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use skytrack_core::{BalloonRecord, SlotReading, DEFAULT_BACKFILL_HOURS, DEFAULT_BALLOON_SLOTS};
use skytrack_feed::{extract_points, reconcile, SnapshotSource};
use skytrack_storage::{BalloonStore, FeedClient, FeedClientConfig, StoreError, DEFAULT_FEED_BASE_URL};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "skytrack-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub feed_base_url: String,
    pub balloon_slots: usize,
    pub http_timeout_secs: u64,
    pub backfill_hours: u32,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://balloons.db".to_string()),
            feed_base_url: std::env::var("SKYTRACK_FEED_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_FEED_BASE_URL.to_string()),
            balloon_slots: std::env::var("SKYTRACK_BALLOON_SLOTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BALLOON_SLOTS)
                .max(1),
            http_timeout_secs: std::env::var("SKYTRACK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            backfill_hours: std::env::var("SKYTRACK_BACKFILL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BACKFILL_HOURS)
                .max(1),
            scheduler_enabled: std::env::var("SKYTRACK_SCHEDULER_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            sync_cron: std::env::var("SKYTRACK_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            user_agent: std::env::var("SKYTRACK_USER_AGENT")
                .unwrap_or_else(|_| "skytrack/0.1".to_string()),
        }
    }

    pub fn feed_client_config(&self) -> FeedClientConfig {
        FeedClientConfig {
            base_url: self.feed_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store failure, run aborted: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub first_hour: Option<DateTime<Utc>>,
    pub last_hour: Option<DateTime<Utc>>,
    pub hours_committed: usize,
    pub hours_failed: usize,
    pub points_stored: usize,
}

/// Start of the hour containing `instant`.
pub fn hour_floor(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(TimeDelta::hours(1))
        .unwrap_or(instant)
}

/// Whole hours between `now` and `hour`; this is what addresses the upstream file.
pub fn hour_offset(now: DateTime<Utc>, hour: DateTime<Utc>) -> u32 {
    let hours = (now - hour).num_seconds().div_euclid(3600);
    u32::try_from(hours.max(0)).unwrap_or(u32::MAX)
}

/// Inclusive range of hours a run has to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub first_hour: DateTime<Utc>,
    pub end_hour: DateTime<Utc>,
}

impl FetchWindow {
    /// Continues right after `latest` when the store has data, otherwise seeds
    /// the last `backfill_hours` hours ending with the current one.
    pub fn plan(now: DateTime<Utc>, latest: Option<DateTime<Utc>>, backfill_hours: u32) -> Self {
        let end_hour = hour_floor(now);
        let first_hour = match latest {
            Some(last) => last + TimeDelta::hours(1),
            None => end_hour - TimeDelta::hours(i64::from(backfill_hours.max(1)) - 1),
        };
        Self {
            first_hour,
            end_hour,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first_hour > self.end_hour
    }

    pub fn hours(&self) -> impl Iterator<Item = DateTime<Utc>> {
        let end_hour = self.end_hour;
        std::iter::successors(Some(self.first_hour), |ts| Some(*ts + TimeDelta::hours(1)))
            .take_while(move |ts| *ts <= end_hour)
    }
}

/// Single writer for the balloon table. Runs are serialized through the run
/// lock so overlapping triggers never commit the same hour twice.
pub struct GapFiller {
    store: BalloonStore,
    source: Arc<dyn SnapshotSource>,
    backfill_hours: u32,
    run_lock: Arc<Mutex<()>>,
}

impl GapFiller {
    pub fn new(store: BalloonStore, source: Arc<dyn SnapshotSource>, backfill_hours: u32) -> Self {
        Self {
            store,
            source,
            backfill_hours: backfill_hours.max(1),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Shares a run lock with another filler writing to the same store.
    pub fn with_run_lock(mut self, run_lock: Arc<Mutex<()>>) -> Self {
        self.run_lock = run_lock;
        self
    }

    pub fn store(&self) -> &BalloonStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        self.run_at(Utc::now()).await
    }

    /// One pass with a fixed `now`. Offsets for every hour are measured from it.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("gap_fill", %run_id);
        self.fill_gaps(run_id, now).instrument(span).await
    }

    async fn fill_gaps(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let slots = self.store.slot_count();
        let latest = self.store.latest_timestamp().await?;
        let window = FetchWindow::plan(now, latest, self.backfill_hours);

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            first_hour: None,
            last_hour: None,
            hours_committed: 0,
            hours_failed: 0,
            points_stored: 0,
        };

        if window.is_empty() {
            info!(latest = ?latest, end_hour = %window.end_hour, "store is caught up");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        info!(
            first_hour = %window.first_hour,
            end_hour = %window.end_hour,
            slots,
            "filling missing hours"
        );

        for ts in window.hours() {
            let offset = hour_offset(now, ts);
            let (readings, points) = match self.source.fetch_snapshot(offset).await {
                Ok(raw) => {
                    let candidates = extract_points(&raw);
                    let points = candidates.len().min(slots);
                    (reconcile(&candidates, slots), points)
                }
                Err(err) => {
                    warn!(timestamp = %ts, offset, error = %err, "snapshot fetch failed; storing empty hour");
                    summary.hours_failed += 1;
                    (vec![SlotReading::absent(); slots], 0)
                }
            };

            let records = BalloonRecord::hour(ts, &readings);
            if let Err(err) = self.store.insert_hour(ts, &records).await {
                error!(timestamp = %ts, offset, error = %err, "commit failed; aborting run");
                return Err(err.into());
            }

            info!(
                timestamp = %ts,
                offset,
                points,
                nulls = slots - points,
                "committed hour"
            );
            summary.first_hour.get_or_insert(ts);
            summary.last_hour = Some(ts);
            summary.hours_committed += 1;
            summary.points_stored += points;
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }
}

/// Connects the store, applies the schema and wires the HTTP feed client.
pub async fn build_gap_filler(config: &SyncConfig) -> Result<GapFiller> {
    let store = BalloonStore::connect(&config.database_url, config.balloon_slots)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    store.migrate().await.context("applying schema")?;
    let client = FeedClient::new(config.feed_client_config())?;
    Ok(GapFiller::new(store, Arc::new(client), config.backfill_hours))
}

/// Installs the periodic trigger. Returns `None` when scheduling is disabled.
pub async fn maybe_start_scheduler(
    config: &SyncConfig,
    filler: Arc<GapFiller>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let filler = Arc::clone(&filler);
        Box::pin(async move {
            match filler.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    hours = summary.hours_committed,
                    failed = summary.hours_failed,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "periodic sync installed");
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let filler = build_gap_filler(&config).await?;
    let summary = filler.run_once().await?;
    filler.store().close().await;
    Ok(summary)
}
