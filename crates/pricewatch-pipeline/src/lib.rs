//! Snapshot-diff-and-notify pipeline orchestration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_catalog::{resolve_category, CatalogClient, PageFetcher, PageParams};
use pricewatch_core::{CategoryRef, ChangeRecord, ProductRecord};
use pricewatch_storage::{HttpClientConfig, HttpFetcher, RetryPolicy, SnapshotStore};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-pipeline";

/// Telegram bot API root; overridable for tests.
pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/113.0";

/// Process-wide configuration, constructed once at startup and passed by
/// reference into each component. No ambient globals.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub proxy_url: Option<String>,
    pub bot_token: String,
    pub channel_ids: Vec<String>,
    pub low_price: u64,
    pub top_price: u64,
    pub discount: Option<u32>,
    /// Percent drop required before a change is reported. The source
    /// history wavered between 10 and 30, so this is a parameter.
    pub drop_threshold_percent: f64,
    pub interval_minutes: u64,
    pub start_page: u32,
    /// Exclusive upper page bound.
    pub end_page: u32,
    pub max_categories: usize,
    pub urls_file: PathBuf,
    pub data_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self {
            proxy_url: std::env::var("PRICEWATCH_PROXY").ok().filter(|v| !v.is_empty()),
            bot_token: std::env::var("PRICEWATCH_BOT_TOKEN").unwrap_or_default(),
            channel_ids: std::env::var("PRICEWATCH_CHANNEL_IDS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
            low_price: std::env::var("PRICEWATCH_LOW_PRICE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            top_price: std::env::var("PRICEWATCH_TOP_PRICE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            discount: match std::env::var("PRICEWATCH_DISCOUNT") {
                Ok(v) if v.eq_ignore_ascii_case("none") => None,
                Ok(v) => v.parse().ok().or(Some(30)),
                Err(_) => Some(30),
            },
            drop_threshold_percent: std::env::var("PRICEWATCH_DROP_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30.0),
            interval_minutes: std::env::var("PRICEWATCH_INTERVAL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            start_page: std::env::var("PRICEWATCH_START_PAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            end_page: std::env::var("PRICEWATCH_END_PAGE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(31),
            max_categories: std::env::var("PRICEWATCH_MAX_CATEGORIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            urls_file: std::env::var("PRICEWATCH_URLS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("urls.txt")),
            data_root: std::env::var("PRICEWATCH_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("PRICEWATCH_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("PRICEWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Percent price change between snapshots. A product that was free and now
/// costs something is an infinite increase; free on both sides is no change.
pub fn percent_change(current: i64, previous: i64) -> f64 {
    if previous == 0 {
        if current != 0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        (current - previous) as f64 / previous as f64 * 100.0
    }
}

/// Inner join of a snapshot pair on product id, keeping only rows whose
/// sale price dropped strictly more than `threshold_percent`. Ids present
/// on one side only are silently excluded; current-side order is preserved.
pub fn detect_changes(
    current: &[ProductRecord],
    previous: &[ProductRecord],
    threshold_percent: f64,
) -> Vec<ChangeRecord> {
    let previous_by_id: HashMap<u64, &ProductRecord> =
        previous.iter().map(|record| (record.id, record)).collect();

    current
        .iter()
        .filter_map(|record| {
            let baseline = previous_by_id.get(&record.id)?;
            let change = percent_change(record.sale_price, baseline.sale_price);
            (change < -threshold_percent)
                .then(|| ChangeRecord::from_join(record, baseline.sale_price, change))
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("delivery to channel {channel_id} returned status {status}")]
    Status { channel_id: String, status: u16 },
}

/// Delivery seam so dispatch logic can be exercised without a live bot.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, channel_id: &str, text: &str) -> Result<(), NotifyError>;
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_api_base(TELEGRAM_API_BASE, token)
    }

    pub fn with_api_base(api_base: &str, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("building telegram client")?;
        Ok(Self {
            client,
            endpoint: format!("{api_base}/bot{token}/sendMessage"),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, channel_id: &str, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("chat_id", channel_id),
                ("text", text),
                ("parse_mode", "HTML"),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                channel_id: channel_id.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Human-readable message for one detected drop. The drop percentage is the
/// ceiling-rounded magnitude of the percent change.
pub fn change_message(change: &ChangeRecord) -> String {
    let drop_percent = (-change.percent_change).ceil();
    let feedbacks = change
        .feedback_count
        .map(|count| count.to_string())
        .unwrap_or_else(|| "-".to_string());
    let supplier_rating = change
        .supplier_rating
        .map(|rating| rating.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "<b>{name}</b>\n\
         Price before: {previous}\n\
         Price now: {current}\n\
         Dropped by {drop_percent}%\n\
         Feedbacks: {feedbacks}\n\
         Supplier rating: {supplier_rating}\n\
         {link}",
        name = change.name,
        previous = change.sale_price_previous,
        current = change.sale_price,
        link = change.link,
    )
}

/// Fans one message per change out to every configured channel. Deliveries
/// run concurrently and a failed one never blocks the rest.
pub struct NotificationDispatcher {
    channel_ids: Vec<String>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(channel_ids: Vec<String>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            channel_ids,
            notifier,
        }
    }

    /// Returns the number of successful deliveries.
    pub async fn dispatch(&self, changes: &[ChangeRecord]) -> usize {
        let mut deliveries = JoinSet::new();
        for change in changes {
            let text = change_message(change);
            for channel_id in &self.channel_ids {
                let notifier = self.notifier.clone();
                let channel_id = channel_id.clone();
                let text = text.clone();
                deliveries.spawn(async move {
                    let outcome = notifier.deliver(&channel_id, &text).await;
                    (channel_id, outcome)
                });
            }
        }

        let mut delivered = 0usize;
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((channel_id, Err(err))) => {
                    warn!(%channel_id, error = %err, "notification delivery failed");
                }
                Err(err) => warn!(error = %err, "notification task failed"),
            }
        }
        delivered
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectOutcome {
    pub files_compared: usize,
    pub changes_detected: usize,
    pub notifications_sent: usize,
}

/// Walk every current snapshot with a baseline, persist non-empty change
/// sets, and dispatch notifications for them. An empty result produces no
/// file and no messages.
pub async fn detect_and_notify(
    store: &SnapshotStore,
    threshold_percent: f64,
    dispatcher: &NotificationDispatcher,
) -> Result<DetectOutcome> {
    let mut outcome = DetectOutcome::default();

    for file_name in store.current_files()? {
        let Some((current, previous)) = store.read_pair(&file_name)? else {
            warn!(file = %file_name, "no previous snapshot, skipping comparison");
            continue;
        };
        outcome.files_compared += 1;

        let changes = detect_changes(&current, &previous, threshold_percent);
        if changes.is_empty() {
            info!(file = %file_name, "no qualifying changes");
            continue;
        }

        let path = store.write_changes(&file_name, &changes)?;
        info!(file = %path.display(), changes = changes.len(), "changes persisted");
        outcome.notifications_sent += dispatcher.dispatch(&changes).await;
        outcome.changes_detected += changes.len();
    }

    Ok(outcome)
}

/// One full cycle report, in the spirit of a sync run summary.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories_total: usize,
    pub categories_scraped: usize,
    pub records_collected: usize,
    pub files_compared: usize,
    pub changes_detected: usize,
    pub notifications_sent: usize,
}

pub struct Pipeline {
    config: WatchConfig,
    store: SnapshotStore,
    catalog: CatalogClient,
    pages: PageFetcher,
    dispatcher: NotificationDispatcher,
}

impl Pipeline {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            proxy_url: config.proxy_url.clone(),
            retry: RetryPolicy::default(),
        })?);
        let store = SnapshotStore::new(&config.data_root);
        let catalog = CatalogClient::new(http.clone());
        let pages = PageFetcher::new(http);
        let notifier = Arc::new(TelegramNotifier::new(&config.bot_token)?);
        let dispatcher = NotificationDispatcher::new(config.channel_ids.clone(), notifier);
        Ok(Self::from_parts(config, store, catalog, pages, dispatcher))
    }

    pub fn from_parts(
        config: WatchConfig,
        store: SnapshotStore,
        catalog: CatalogClient,
        pages: PageFetcher,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            config,
            store,
            catalog,
            pages,
            dispatcher,
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn load_category_urls(&self) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(&self.config.urls_file)
            .with_context(|| format!("reading {}", self.config.urls_file.display()))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// rotate -> scrape all categories -> diff and notify.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "cycle started");

        self.store.ensure_layout()?;
        self.store.rotate()?;

        let urls = self.load_category_urls()?;
        if urls.is_empty() {
            warn!("category url list is empty");
        }
        let urls: Vec<&String> = urls.iter().take(self.config.max_categories).collect();

        let entries = self
            .catalog
            .fetch_tree()
            .await
            .context("fetching catalog tree")?;

        let mut categories_scraped = 0usize;
        let mut records_collected = 0usize;
        for url in &urls {
            let category = match resolve_category(&entries, url) {
                Ok(category) => category,
                Err(err) => {
                    error!(%url, error = %err, "skipping category");
                    continue;
                }
            };
            let records = self.scrape_category(&category).await;
            records_collected += records.len();
            self.store.write_snapshot(
                &category.name,
                &records,
                self.config.low_price,
                self.config.top_price,
            )?;
            categories_scraped += 1;
        }

        let outcome = detect_and_notify(
            &self.store,
            self.config.drop_threshold_percent,
            &self.dispatcher,
        )
        .await?;

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            categories_total: urls.len(),
            categories_scraped,
            records_collected,
            files_compared: outcome.files_compared,
            changes_detected: outcome.changes_detected,
            notifications_sent: outcome.notifications_sent,
        };
        info!(
            %run_id,
            categories = summary.categories_scraped,
            records = summary.records_collected,
            changes = summary.changes_detected,
            "cycle finished"
        );
        Ok(summary)
    }

    /// Fan out every page of one category, await the batch, and aggregate.
    /// First occurrence wins on duplicate ids so id stays unique per
    /// snapshot. Page order is not preserved.
    async fn scrape_category(&self, category: &CategoryRef) -> Vec<ProductRecord> {
        let mut fetches = JoinSet::new();
        for page in self.config.start_page..self.config.end_page {
            let pages = self.pages.clone();
            let category = category.clone();
            let params = PageParams {
                page,
                low_price: self.config.low_price,
                top_price: self.config.top_price,
                discount: self.config.discount,
            };
            fetches.spawn(async move { pages.fetch_page(&category, params).await });
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        while let Some(joined) = fetches.join_next().await {
            match joined {
                Ok(page_records) => {
                    for record in page_records {
                        if seen.insert(record.id) {
                            records.push(record);
                        }
                    }
                }
                Err(err) => warn!(error = %err, "page fetch task failed"),
            }
        }
        info!(category = %category.name, records = records.len(), "category collected");
        records
    }
}

pub async fn run_cycle_from_env() -> Result<CycleSummary> {
    let pipeline = Pipeline::new(WatchConfig::from_env())?;
    pipeline.run_cycle().await
}

/// Repeated-interval scheduler driving full cycles. A failed cycle is
/// logged and the next tick proceeds; the process keeps running.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let interval = Duration::from_secs(pipeline.config().interval_minutes.max(1) * 60);
    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_cycle().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    changes = summary.changes_detected,
                    notified = summary.notifications_sent,
                    "scheduled cycle complete"
                ),
                Err(err) => error!("scheduled cycle failed: {err:#}"),
            }
        })
    })
    .context("creating repeated cycle job")?;
    scheduler.add(job).await.context("adding cycle job")?;
    Ok(scheduler)
}
