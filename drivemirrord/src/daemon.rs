use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drivemirror_core::{BucketClient, DriveClient, WatchChannel};
use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::http_api;
use crate::sync::dedup::ChangeDeduplicator;
use crate::sync::engine::{EngineConfig, MirrorEngine};
use crate::sync::kv_store::SqliteKvStore;
use crate::sync::reconciler::run_poll_loop;
use crate::sync::retry::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_CAPACITY, RetryPolicy, RetryQueue, RetryRecord,
    run_retry_worker,
};
use crate::sync::watermark::WatermarkStore;

const DEFAULT_DRIVE_URL: &str = "https://www.googleapis.com";
const DEFAULT_STORAGE_URL: &str = "https://storage.googleapis.com";
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_POLL_SECS: u64 = 300;
const DEFAULT_LOOKBACK_SECS: u64 = 300;
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 300;
const DEFAULT_DEDUP_BUCKET_SECS: u64 = 30;
const DEFAULT_WALK_CONCURRENCY: u64 = 4;
const DEFAULT_WATCH_TTL_SECS: u64 = 86_400;
const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub token: String,
    pub root_id: String,
    pub bucket: String,
    pub drive_url: String,
    pub storage_url: String,
    pub listen: SocketAddr,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub poll_lookback: Duration,
    pub dedup_window: Duration,
    pub dedup_bucket: Duration,
    pub retry_max_attempts: u32,
    pub walk_concurrency: usize,
    pub use_change_feed: bool,
    pub watch_ttl: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = required_var(&lookup, "DRIVEMIRROR_TOKEN")?;
        let root_id = required_var(&lookup, "DRIVEMIRROR_ROOT_ID")?;
        let bucket = required_var(&lookup, "DRIVEMIRROR_BUCKET")?;
        let drive_url =
            lookup("DRIVEMIRROR_DRIVE_URL").unwrap_or_else(|| DEFAULT_DRIVE_URL.to_string());
        let storage_url =
            lookup("DRIVEMIRROR_STORAGE_URL").unwrap_or_else(|| DEFAULT_STORAGE_URL.to_string());
        let listen_raw = lookup("DRIVEMIRROR_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen_raw
            .parse()
            .with_context(|| format!("DRIVEMIRROR_LISTEN is not a socket address: {listen_raw}"))?;
        let db_path = match lookup("DRIVEMIRROR_DB") {
            Some(value) => match dirs::home_dir() {
                Some(home) => expand_with_home(&value, &home),
                None => PathBuf::from(value),
            },
            None => default_db_path(),
        };
        let retry_max_attempts = u32::try_from(read_u64_var(
            &lookup,
            "DRIVEMIRROR_RETRY_MAX_ATTEMPTS",
            u64::from(DEFAULT_MAX_ATTEMPTS),
        ))
        .unwrap_or(u32::MAX);
        let walk_concurrency = usize::try_from(read_u64_var(
            &lookup,
            "DRIVEMIRROR_WALK_CONCURRENCY",
            DEFAULT_WALK_CONCURRENCY,
        ))
        .unwrap_or(usize::MAX);

        Ok(Self {
            token,
            root_id,
            bucket,
            drive_url,
            storage_url,
            listen,
            db_path,
            poll_interval: secs_var(&lookup, "DRIVEMIRROR_POLL_SECS", DEFAULT_POLL_SECS),
            poll_lookback: secs_var(&lookup, "DRIVEMIRROR_LOOKBACK_SECS", DEFAULT_LOOKBACK_SECS),
            dedup_window: secs_var(
                &lookup,
                "DRIVEMIRROR_DEDUP_WINDOW_SECS",
                DEFAULT_DEDUP_WINDOW_SECS,
            ),
            dedup_bucket: secs_var(
                &lookup,
                "DRIVEMIRROR_DEDUP_BUCKET_SECS",
                DEFAULT_DEDUP_BUCKET_SECS,
            ),
            retry_max_attempts,
            walk_concurrency,
            use_change_feed: read_bool_var(&lookup, "DRIVEMIRROR_CHANGE_FEED", true),
            watch_ttl: secs_var(&lookup, "DRIVEMIRROR_WATCH_TTL_SECS", DEFAULT_WATCH_TTL_SECS),
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    drive: DriveClient,
    engine: Arc<MirrorEngine>,
    retry_rx: mpsc::Receiver<RetryRecord>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let drive = DriveClient::with_base_url(&config.drive_url, config.token.clone())
            .context("invalid tree store url")?;
        let bucket = BucketClient::with_base_url(
            &config.storage_url,
            config.token.clone(),
            config.bucket.clone(),
        )
        .context("invalid object store url")?;
        let kv = SqliteKvStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open watermark store at {:?}", config.db_path))?;

        let dedup = Arc::new(ChangeDeduplicator::new(
            config.dedup_window,
            config.dedup_bucket,
        ));
        let (retries, retry_rx) = RetryQueue::channel(DEFAULT_RETRY_CAPACITY);
        let mut engine_config = EngineConfig::new(config.root_id.clone());
        engine_config.walk_concurrency = config.walk_concurrency;
        engine_config.poll_lookback = config.poll_lookback;

        let mut engine = MirrorEngine::new(
            Arc::new(drive.clone()),
            Arc::new(bucket),
            WatermarkStore::new(Arc::new(kv)),
            dedup,
            retries,
            engine_config,
        );
        if config.use_change_feed {
            engine = engine.with_change_feed(Arc::new(drive.clone()));
        }

        Ok(Self {
            config,
            drive,
            engine: Arc::new(engine),
            retry_rx,
        })
    }

    pub fn engine(&self) -> &Arc<MirrorEngine> {
        &self.engine
    }

    /// Registers a push channel for the change feed, seeding the change cursor
    /// when none is stored yet so the first drain has a starting point.
    pub async fn register_watch(&self, address: &str) -> anyhow::Result<WatchChannel> {
        let watermark = self.engine.watermark();
        let cursor = match watermark.change_cursor().await? {
            Some(cursor) => cursor,
            None => {
                let start = self
                    .drive
                    .start_cursor()
                    .await
                    .context("failed to fetch start cursor")?;
                watermark.set_change_cursor(&start).await?;
                start
            }
        };
        let channel_id = random_channel_id();
        let expires_at = time::Duration::try_from(self.config.watch_ttl)
            .ok()
            .and_then(|ttl| OffsetDateTime::now_utc().checked_add(ttl))
            .context("watch ttl is out of range")?;
        let channel = self
            .drive
            .watch_changes(&cursor, &channel_id, address, expires_at)
            .await
            .context("failed to register push channel")?;
        info!(channel = %channel.id, resource = %channel.resource_id, address, "push channel registered");
        Ok(channel)
    }

    pub async fn stop_watch(&self, channel_id: &str, resource_id: &str) -> anyhow::Result<()> {
        self.drive
            .stop_channel(channel_id, resource_id)
            .await
            .context("failed to stop push channel")?;
        info!(channel = channel_id, resource = resource_id, "push channel stopped");
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            root = %self.config.root_id,
            bucket = %self.config.bucket,
            listen = %self.config.listen,
            poll_secs = self.config.poll_interval.as_secs(),
            change_feed = self.config.use_change_feed,
            "drivemirrord started"
        );

        // Bound before any task is spawned so a bind failure leaves nothing running.
        let listener = tokio::net::TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen))?;

        let poll_handle = tokio::spawn(run_poll_loop(
            Arc::clone(&self.engine),
            self.config.poll_interval,
        ));

        let policy = RetryPolicy {
            max_attempts: self.config.retry_max_attempts,
            ..RetryPolicy::default()
        };
        let retry_handle = tokio::spawn(run_retry_worker(
            Arc::clone(&self.engine),
            self.retry_rx,
            policy,
        ));

        let dedup = Arc::clone(self.engine.deduplicator());
        let sweep_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(DEDUP_SWEEP_INTERVAL).await;
                let dropped = dedup.sweep();
                if dropped > 0 {
                    debug!(dropped, remaining = dedup.len(), "expired change signatures swept");
                }
            }
        });

        let app = http_api::router(Arc::clone(&self.engine));
        let mut server_handle = tokio::spawn(async move { axum::serve(listener, app).await });

        let outcome = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                res.context("failed waiting for shutdown signal")
            }
            res = &mut server_handle => match res {
                Ok(Ok(())) => Err(anyhow::anyhow!("http server stopped unexpectedly")),
                Ok(Err(err)) => Err(err).context("http server failed"),
                Err(err) => Err(err).context("http server task panicked"),
            },
        };

        server_handle.abort();
        poll_handle.abort();
        retry_handle.abort();
        sweep_handle.abort();

        outcome
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
