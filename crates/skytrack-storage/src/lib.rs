//! Durable balloon table + upstream HTTP fetch utilities for skytrack.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use skytrack_core::{BalloonRecord, TrajectoryPoint};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "skytrack-storage";

pub const DEFAULT_FEED_BASE_URL: &str = "https://a.windbornesystems.com/treasure";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for hour offset {offset:02} failed: {source}")]
    Request {
        offset: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} (hour offset {offset:02})")]
    HttpStatus { offset: u32, status: u16, url: String },
}

impl FetchError {
    pub fn offset(&self) -> u32 {
        match self {
            FetchError::Request { offset, .. } | FetchError::HttpStatus { offset, .. } => *offset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FeedClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Resource address for one hourly snapshot. Offset 0 is the current hour.
pub fn snapshot_url(base_url: &str, hour_offset: u32) -> String {
    format!("{}/{hour_offset:02}.json", base_url.trim_end_matches('/'))
}

/// Fetches hourly snapshot documents. Never retries; the caller decides what a
/// failed hour means.
#[derive(Debug, Clone)]
pub struct FeedClient {
    client: reqwest::Client,
    base_url: String,
}

impl FeedClient {
    pub fn new(config: FeedClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub async fn fetch(&self, hour_offset: u32) -> Result<String, FetchError> {
        let url = snapshot_url(&self.base_url, hour_offset);
        let span = info_span!("feed_fetch", hour_offset, url = %url);

        async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    offset: hour_offset,
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    offset: hour_offset,
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.text().await.map_err(|source| FetchError::Request {
                offset: hour_offset,
                source,
            })?;
            debug!(bytes = body.len(), "fetched snapshot");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("expected {expected} records per hour, got {actual}")]
    SlotCountMismatch { expected: usize, actual: usize },
    #[error("record {position} is for balloon {balloon_index} at {timestamp}, expected balloon {position} at {hour}")]
    MisalignedRecord {
        position: usize,
        balloon_index: u32,
        timestamp: DateTime<Utc>,
        hour: DateTime<Utc>,
    },
}

/// Append-only table of per-slot hourly readings.
///
/// Every stored hour holds exactly `slot_count` rows; `insert_hour` writes them
/// in one transaction so readers never observe a partial hour.
#[derive(Debug, Clone)]
pub struct BalloonStore {
    pool: SqlitePool,
    slot_count: usize,
}

impl BalloonStore {
    pub async fn connect(database_url: &str, slot_count: usize) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool, slot_count))
    }

    /// Single-connection in-memory store. The connection is pinned so the
    /// database lives as long as the pool.
    pub async fn in_memory(slot_count: usize) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::from_pool(pool, slot_count))
    }

    pub fn from_pool(pool: SqlitePool, slot_count: usize) -> Self {
        Self {
            pool,
            slot_count: slot_count.max(1),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(timestamp) FROM balloon_data")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    /// Commits one hour. `records` must hold exactly one row per slot, in index
    /// order, all stamped with `timestamp`; nothing is written otherwise.
    pub async fn insert_hour(
        &self,
        timestamp: DateTime<Utc>,
        records: &[BalloonRecord],
    ) -> Result<(), StoreError> {
        if records.len() != self.slot_count {
            return Err(StoreError::SlotCountMismatch {
                expected: self.slot_count,
                actual: records.len(),
            });
        }
        if let Some((position, record)) = records
            .iter()
            .enumerate()
            .find(|(position, r)| r.balloon_index as usize != *position || r.timestamp != timestamp)
        {
            return Err(StoreError::MisalignedRecord {
                position,
                balloon_index: record.balloon_index,
                timestamp: record.timestamp,
                hour: timestamp,
            });
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO balloon_data (balloon_index, timestamp, lat, lon, alt)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(i64::from(record.balloon_index))
            .bind(record.timestamp)
            .bind(record.lat)
            .bind(record.lon)
            .bind(record.alt)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn trajectory_for(&self, balloon_index: u32) -> Result<Vec<TrajectoryPoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, lat, lon, alt
              FROM balloon_data
             WHERE balloon_index = ?
             ORDER BY timestamp ASC
            "#,
        )
        .bind(i64::from(balloon_index))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let record = BalloonRecord {
                balloon_index,
                timestamp: row.try_get("timestamp")?,
                lat: row.try_get("lat")?,
                lon: row.try_get("lon")?,
                alt: row.try_get("alt")?,
            };
            out.push(TrajectoryPoint::from(record));
        }
        Ok(out)
    }

    pub async fn count_rows_at(&self, timestamp: DateTime<Utc>) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM balloon_data WHERE timestamp = ?")
            .bind(timestamp)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use skytrack_core::SlotReading;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, h, 0, 0).single().unwrap()
    }

    fn reading(lat: f64, lon: f64, alt: Option<f64>) -> SlotReading {
        SlotReading {
            lat: Some(lat),
            lon: Some(lon),
            alt,
        }
    }

    fn rows(ts: DateTime<Utc>, readings: &[SlotReading]) -> Vec<BalloonRecord> {
        BalloonRecord::hour(ts, readings)
    }

    /// Serves a single connection: reads the request head, then either writes
    /// `response` or holds the socket open for `stall`.
    async fn one_shot_server(response: Option<&'static str>, stall: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.expect("read request");
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }
            match response {
                Some(response) => {
                    socket.write_all(response.as_bytes()).await.expect("write response");
                    socket.flush().await.expect("flush");
                }
                None => tokio::time::sleep(stall).await,
            }
        });
        format!("http://{addr}/treasure")
    }

    fn client_for(base_url: String, timeout: Duration) -> FeedClient {
        FeedClient::new(FeedClientConfig {
            base_url,
            timeout,
            user_agent: Some("skytrack-test".to_string()),
        })
        .expect("client")
    }

    async fn memory_store(slots: usize) -> BalloonStore {
        let store = BalloonStore::in_memory(slots).await.expect("in-memory store");
        store.migrate().await.expect("migrate");
        store
    }

    #[test]
    fn snapshot_url_zero_pads_offset() {
        assert_eq!(snapshot_url("https://feed.test/base", 0), "https://feed.test/base/00.json");
        assert_eq!(snapshot_url("https://feed.test/base/", 7), "https://feed.test/base/07.json");
        assert_eq!(snapshot_url("https://feed.test/base", 23), "https://feed.test/base/23.json");
        assert_eq!(snapshot_url("https://feed.test/base", 123), "https://feed.test/base/123.json");
    }

    #[tokio::test]
    async fn fetch_failure_carries_offset() {
        let client = FeedClient::new(FeedClientConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout: Duration::from_secs(2),
            user_agent: None,
        })
        .expect("client");
        let err = client.fetch(3).await.expect_err("nothing listens on the discard port");
        assert_eq!(err.offset(), 3);
    }

    #[tokio::test]
    async fn fetch_returns_body_on_success() {
        let base = one_shot_server(
            Some("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 14\r\nConnection: close\r\n\r\nblah [1.5,2.5]"),
            Duration::ZERO,
        )
        .await;
        let body = client_for(base, Duration::from_secs(5)).fetch(0).await.expect("fetch");
        assert_eq!(body, "blah [1.5,2.5]");
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let base = one_shot_server(
            Some("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"),
            Duration::ZERO,
        )
        .await;
        let err = client_for(base, Duration::from_secs(5))
            .fetch(7)
            .await
            .expect_err("404 must fail");
        match err {
            FetchError::HttpStatus { offset, status, url } => {
                assert_eq!(offset, 7);
                assert_eq!(status, 404);
                assert!(url.ends_with("/treasure/07.json"), "unexpected url {url}");
            }
            other => panic!("expected http status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_upstream_times_out() {
        let base = one_shot_server(None, Duration::from_secs(5)).await;
        let started = std::time::Instant::now();
        let err = client_for(base, Duration::from_millis(200))
            .fetch(2)
            .await
            .expect_err("stalled upstream must time out");
        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            FetchError::Request { offset, source } => {
                assert_eq!(offset, 2);
                assert!(source.is_timeout(), "expected timeout, got {source}");
            }
            other => panic!("expected request error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_store_has_no_latest_timestamp() {
        let store = memory_store(3).await;
        assert_eq!(store.latest_timestamp().await.unwrap(), None);
        assert!(store.trajectory_for(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_hour_then_read_back_in_time_order() {
        let store = memory_store(2).await;
        store
            .insert_hour(hour(5), &rows(hour(5), &[reading(1.0, 2.0, Some(3.0)), SlotReading::absent()]))
            .await
            .unwrap();
        store
            .insert_hour(hour(4), &rows(hour(4), &[reading(0.5, 1.5, None), reading(9.0, 8.0, Some(7.0))]))
            .await
            .unwrap();

        assert_eq!(store.latest_timestamp().await.unwrap(), Some(hour(5)));
        assert_eq!(store.count_rows_at(hour(4)).await.unwrap(), 2);
        assert_eq!(store.count_rows_at(hour(5)).await.unwrap(), 2);

        let first = store.trajectory_for(0).await.unwrap();
        assert_eq!(
            first,
            vec![
                TrajectoryPoint { timestamp: hour(4), lat: Some(0.5), lon: Some(1.5), alt: None },
                TrajectoryPoint { timestamp: hour(5), lat: Some(1.0), lon: Some(2.0), alt: Some(3.0) },
            ]
        );

        let second = store.trajectory_for(1).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].lat, None);
        assert_eq!(second[1].lon, None);
        assert_eq!(second[1].alt, None);
    }

    #[tokio::test]
    async fn duplicate_hour_is_rejected_as_a_whole() {
        let store = memory_store(3).await;
        let records = rows(hour(1), &[SlotReading::absent(); 3]);
        store.insert_hour(hour(1), &records).await.unwrap();

        let err = store.insert_hour(hour(1), &records).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert_eq!(store.count_rows_at(hour(1)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn wrong_reading_count_writes_nothing() {
        let store = memory_store(3).await;
        let err = store
            .insert_hour(hour(1), &rows(hour(1), &[SlotReading::absent(); 2]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::SlotCountMismatch { expected: 3, actual: 2 }
        ));
        assert_eq!(store.count_rows_at(hour(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn misaligned_records_write_nothing() {
        let store = memory_store(2).await;

        let mut swapped = rows(hour(1), &[reading(1.0, 2.0, None), reading(3.0, 4.0, None)]);
        swapped.swap(0, 1);
        let err = store.insert_hour(hour(1), &swapped).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::MisalignedRecord { position: 0, balloon_index: 1, .. }
        ));

        let wrong_hour = rows(hour(2), &[SlotReading::absent(); 2]);
        let err = store.insert_hour(hour(1), &wrong_hour).await.unwrap_err();
        assert!(matches!(err, StoreError::MisalignedRecord { position: 0, .. }));

        assert_eq!(store.count_rows_at(hour(1)).await.unwrap(), 0);
        assert_eq!(store.count_rows_at(hour(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_store_survives_reconnect() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("balloons.db").display());

        let store = BalloonStore::connect(&url, 1).await.expect("connect");
        store.migrate().await.expect("migrate");
        store
            .insert_hour(hour(2), &rows(hour(2), &[reading(10.0, 20.0, Some(30.0))]))
            .await
            .unwrap();
        store.close().await;

        let reopened = BalloonStore::connect(&url, 1).await.expect("reconnect");
        reopened.migrate().await.expect("migrate is idempotent");
        assert_eq!(reopened.latest_timestamp().await.unwrap(), Some(hour(2)));
        assert_eq!(reopened.trajectory_for(0).await.unwrap()[0].alt, Some(30.0));
    }
}
