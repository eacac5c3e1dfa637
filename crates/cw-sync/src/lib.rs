//! Watcher orchestration: configuration, the per-source run, the one-shot and
//! daemon scheduler, and the wiring that turns a config into running watchers.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cw_adapters::{
    Asi67Config, Asi67Provider, HttpClientConfig, HttpFetcher, RememberMeConfig,
    RememberMeProvider, SourceKind, DEFAULT_MAX_PAGES, DEFAULT_SCRAPE_CONCURRENCY,
    DEFAULT_USER_AGENT,
};
use cw_core::{DedupStore, Listing, Notifier, Provider, ProviderError};
use cw_notify::{EmailConfig, EmailNotifier, FanOutNotifier, LogNotifier};
use cw_storage::{JsonFileStore, MemoryStore, PgStoreOptions, PostgresStore};
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cw-sync";

pub const DEFAULT_ASI67_DATA_FILE: &str = "data/asi67-seen.json";
pub const DEFAULT_REMEMBERME_DATA_FILE: &str = "data/rememberme-seen.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// One JSON document per source, at the configured data file path.
    JsonFiles,
    /// A single `seen_items` table shared by every source.
    Postgres { url: String, require_tls: bool },
    /// Nothing survives the process; used for dry runs.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub interval: Duration,
    pub run_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            run_timeout: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub sources: Vec<SourceKind>,
    pub asi67: Asi67Config,
    pub asi67_data_file: PathBuf,
    pub rememberme: RememberMeConfig,
    pub rememberme_data_file: PathBuf,
    pub store: StoreBackend,
    pub email: Option<EmailConfig>,
    pub http: HttpClientConfig,
    pub schedule: ScheduleConfig,
}

impl WatcherConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset and
    /// unparsable numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };
        let max_pages = u32::try_from(number("WATCHER_MAX_PAGES", u64::from(DEFAULT_MAX_PAGES)))
            .unwrap_or(DEFAULT_MAX_PAGES)
            .max(1);

        let sources = match get("WATCHER_SOURCES") {
            Some(raw) => parse_sources(&raw)?,
            None => SourceKind::ALL.to_vec(),
        };

        let asi67_defaults = Asi67Config::default();
        let per_page = number(
            "ASI67_ITEMS_PER_PAGE",
            u64::from(asi67_defaults.items_per_page),
        );
        let asi67 = Asi67Config {
            api_url: get("ASI67_API_URL").unwrap_or(asi67_defaults.api_url),
            items_per_page: u32::try_from(per_page)
                .unwrap_or(asi67_defaults.items_per_page)
                .max(1),
            max_pages,
        };

        let rememberme_defaults = RememberMeConfig::default();
        let concurrency = number("REMEMBERME_CONCURRENCY", DEFAULT_SCRAPE_CONCURRENCY as u64);
        let rememberme = RememberMeConfig {
            search_url: get("REMEMBERME_SEARCH_URL").unwrap_or(rememberme_defaults.search_url),
            concurrency: usize::try_from(concurrency)
                .unwrap_or(DEFAULT_SCRAPE_CONCURRENCY)
                .max(1),
            max_pages,
        };

        let store = match get("DATABASE_URL") {
            Some(url) => StoreBackend::Postgres {
                url,
                require_tls: flag("DATABASE_SSL_REQUIRE", true),
            },
            None => StoreBackend::JsonFiles,
        };

        let email = if flag("EMAIL_ENABLED", false) {
            let from =
                get("EMAIL_FROM").context("EMAIL_FROM must be set when EMAIL_ENABLED is true")?;
            let to: Vec<String> = get("EMAIL_TO")
                .context("EMAIL_TO must be set when EMAIL_ENABLED is true")?
                .split(',')
                .map(|addr| addr.trim().to_string())
                .filter(|addr| !addr.is_empty())
                .collect();
            let smtp_port = get("SMTP_PORT").unwrap_or_else(|| "587".to_string());
            Some(EmailConfig {
                smtp_host: get("SMTP_HOST").unwrap_or_else(|| "smtp.gmail.com".to_string()),
                smtp_port: smtp_port
                    .parse()
                    .with_context(|| format!("invalid SMTP_PORT {smtp_port:?}"))?,
                username: get("SMTP_USER"),
                password: get("SMTP_PASSWORD"),
                from,
                to,
                tls: flag("SMTP_TLS", true),
            })
        } else {
            None
        };

        let http = HttpClientConfig {
            timeout: Duration::from_secs(number("WATCHER_HTTP_TIMEOUT_SECS", 15).max(1)),
            user_agent: Some(
                get("WATCHER_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            ),
            ..HttpClientConfig::default()
        };

        let schedule = ScheduleConfig {
            interval: Duration::from_secs(number("WATCHER_INTERVAL_SECS", 900)),
            run_timeout: Duration::from_secs(number("WATCHER_RUN_TIMEOUT_SECS", 120)),
        };
        anyhow::ensure!(
            !schedule.interval.is_zero(),
            "WATCHER_INTERVAL_SECS must be greater than zero"
        );
        anyhow::ensure!(
            !schedule.run_timeout.is_zero(),
            "WATCHER_RUN_TIMEOUT_SECS must be greater than zero"
        );

        Ok(Self {
            sources,
            asi67,
            asi67_data_file: get("ASI67_DATA_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ASI67_DATA_FILE)),
            rememberme,
            rememberme_data_file: get("REMEMBERME_DATA_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REMEMBERME_DATA_FILE)),
            store,
            email,
            http,
            schedule,
        })
    }

    pub fn data_file(&self, kind: SourceKind) -> &PathBuf {
        match kind {
            SourceKind::Asi67 => &self.asi67_data_file,
            SourceKind::RememberMe => &self.rememberme_data_file,
        }
    }
}

fn parse_sources(raw: &str) -> anyhow::Result<Vec<SourceKind>> {
    let mut sources = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let kind = SourceKind::from_str(name)
            .with_context(|| format!("unknown source {name:?} in WATCHER_SOURCES"))?;
        if !sources.contains(&kind) {
            sources.push(kind);
        }
    }
    anyhow::ensure!(!sources.is_empty(), "WATCHER_SOURCES selects no source");
    Ok(sources)
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("fetching listings from {provider} failed")]
    Fetch {
        provider: String,
        #[source]
        source: ProviderError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub invalid: usize,
    pub already_seen: usize,
    pub check_failed: usize,
    pub notify_failed: usize,
    pub save_failed: usize,
    /// Listings that were notified and recorded during this run.
    pub new_items: usize,
    /// Set when cancellation stopped the run before every listing was handled.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Invalid,
    CheckFailed,
    AlreadySeen,
    NotifyFailed,
    SaveFailed,
    New,
}

/// Runs one provider against its dedup store and notifier.
///
/// A listing is recorded only after its notification succeeded, so a failed
/// send is retried on the next run. A failed save after a successful send
/// means the listing will be notified again: delivery is at-least-once.
#[derive(Clone)]
pub struct WatcherService {
    provider: Arc<dyn Provider>,
    store: Arc<dyn DedupStore>,
    notifier: Arc<dyn Notifier>,
}

impl WatcherService {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn DedupStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provider,
            store,
            notifier,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary, WatchError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("watcher_run", %run_id, provider = %self.provider.name());
        self.run_listings(run_id, cancel).instrument(span).await
    }

    async fn run_listings(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, WatchError> {
        let started_at = Utc::now();
        let provider = self.provider.name().to_string();
        info!("watcher run started");

        let listings = match self.provider.fetch_listings(cancel).await {
            Ok(listings) => listings,
            Err(source) => {
                error!(error = %source, "fetch failed, aborting run");
                return Err(WatchError::Fetch { provider, source });
            }
        };
        info!(count = listings.len(), "listings fetched");

        let mut summary = RunSummary {
            run_id,
            provider,
            started_at,
            finished_at: started_at,
            fetched: listings.len(),
            invalid: 0,
            already_seen: 0,
            check_failed: 0,
            notify_failed: 0,
            save_failed: 0,
            new_items: 0,
            interrupted: false,
        };

        for (index, listing) in listings.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    remaining = listings.len() - index,
                    "run cancelled, remaining listings wait for the next run"
                );
                summary.interrupted = true;
                break;
            }
            match self.process(listing, cancel).await {
                Outcome::Invalid => summary.invalid += 1,
                Outcome::CheckFailed => summary.check_failed += 1,
                Outcome::AlreadySeen => summary.already_seen += 1,
                Outcome::NotifyFailed => summary.notify_failed += 1,
                Outcome::SaveFailed => summary.save_failed += 1,
                Outcome::New => summary.new_items += 1,
            }
        }

        summary.finished_at = Utc::now();
        info!(
            new_items = summary.new_items,
            already_seen = summary.already_seen,
            invalid = summary.invalid,
            check_failed = summary.check_failed,
            notify_failed = summary.notify_failed,
            save_failed = summary.save_failed,
            "watcher run finished"
        );
        Ok(summary)
    }

    async fn process(&self, listing: &Listing, cancel: &CancellationToken) -> Outcome {
        if !listing.is_valid() {
            warn!(
                listing_id = %listing.id,
                title = %listing.title,
                url = %listing.url,
                "skipping invalid listing"
            );
            return Outcome::Invalid;
        }

        match self.store.exists(&listing.id).await {
            Ok(true) => {
                debug!(listing_id = %listing.id, "already seen");
                return Outcome::AlreadySeen;
            }
            Ok(false) => {}
            Err(err) => {
                error!(
                    listing_id = %listing.id,
                    error = %err,
                    "dedup check failed, skipping listing"
                );
                return Outcome::CheckFailed;
            }
        }

        info!(
            listing_id = %listing.id,
            title = %listing.title,
            url = %listing.url,
            "new listing found"
        );

        if let Err(err) = self.notifier.send(listing, cancel).await {
            error!(
                listing_id = %listing.id,
                error = %err,
                "notification failed, listing stays unrecorded"
            );
            return Outcome::NotifyFailed;
        }

        if let Err(err) = self.store.save(listing).await {
            error!(
                listing_id = %listing.id,
                error = %err,
                "recording listing failed, it will be notified again next run"
            );
            return Outcome::SaveFailed;
        }

        Outcome::New
    }
}

#[derive(Debug, Error)]
#[error("{} of {} watcher runs failed", .failures.len(), .total)]
pub struct CycleError {
    pub total: usize,
    pub failures: Vec<WatchError>,
}

/// How one watcher's run ended inside a daemon cycle.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunSummary),
    Failed,
    TimedOut,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }
}

/// Drives a set of watchers, either once or on a fixed interval.
pub struct Scheduler {
    watchers: Vec<WatcherService>,
    config: ScheduleConfig,
}

impl Scheduler {
    pub fn new(watchers: Vec<WatcherService>, config: ScheduleConfig) -> Self {
        Self { watchers, config }
    }

    pub fn config(&self) -> ScheduleConfig {
        self.config
    }

    pub fn watchers(&self) -> &[WatcherService] {
        &self.watchers
    }

    /// Runs every watcher once, in order. Fails if any watcher's fetch failed;
    /// the remaining watchers still run.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<RunSummary>, CycleError> {
        let mut summaries = Vec::with_capacity(self.watchers.len());
        let mut failures = Vec::new();
        for watcher in &self.watchers {
            if cancel.is_cancelled() {
                info!(provider = watcher.provider_name(), "cancelled before watcher started");
                break;
            }
            match watcher.run(cancel).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            Ok(summaries)
        } else {
            Err(CycleError {
                total: self.watchers.len(),
                failures,
            })
        }
    }

    /// Runs immediately, then once per interval until `shutdown` is cancelled.
    /// Cycle failures and timeouts are logged and never end the loop.
    pub async fn run_daemon(&self, shutdown: &CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            run_timeout_secs = self.config.run_timeout.as_secs(),
            watchers = self.watchers.len(),
            "daemon started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_cycle(shutdown).await;
        }

        info!("daemon stopped");
    }

    /// One daemon cycle: every watcher in turn, each under its own child
    /// token and its own `run_timeout`, so a stuck source cannot starve the
    /// sources after it. Returns one outcome per watcher that was started.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Vec<RunOutcome> {
        let mut outcomes = Vec::with_capacity(self.watchers.len());
        for watcher in &self.watchers {
            if shutdown.is_cancelled() {
                info!(provider = watcher.provider_name(), "shutting down before watcher started");
                break;
            }
            outcomes.push(self.run_bounded(watcher, shutdown).await);
        }

        let new_items: usize = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                RunOutcome::Completed(summary) => Some(summary.new_items),
                _ => None,
            })
            .sum();
        let failed = outcomes.iter().filter(|o| !o.is_completed()).count();
        if failed == 0 {
            info!(runs = outcomes.len(), new_items, "cycle finished");
        } else {
            warn!(runs = outcomes.len(), failed, new_items, "cycle finished with failures");
        }
        outcomes
    }

    async fn run_bounded(
        &self,
        watcher: &WatcherService,
        shutdown: &CancellationToken,
    ) -> RunOutcome {
        let run = shutdown.child_token();
        let _release = run.clone().drop_guard();

        match tokio::time::timeout(self.config.run_timeout, watcher.run(&run)).await {
            Ok(Ok(summary)) => RunOutcome::Completed(summary),
            Ok(Err(err)) => {
                error!(error = %err, "watcher run failed");
                RunOutcome::Failed
            }
            Err(_) => {
                warn!(
                    provider = watcher.provider_name(),
                    run_timeout_secs = self.config.run_timeout.as_secs(),
                    "watcher run timed out, abandoning it"
                );
                RunOutcome::TimedOut
            }
        }
    }
}

pub fn build_notifier(config: &WatcherConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    let mut notifier = FanOutNotifier::default().with(Arc::new(LogNotifier));
    if let Some(email) = &config.email {
        let email = EmailNotifier::new(email).context("configuring email notifier")?;
        notifier = notifier.with(Arc::new(email));
    }
    info!(sinks = notifier.len(), email = config.email.is_some(), "notifier configured");
    Ok(Arc::new(notifier))
}

/// Connects the stores and builds one watcher per configured source.
/// Any backend that cannot be set up fails the whole construction.
pub async fn build_watchers(config: &WatcherConfig) -> anyhow::Result<Vec<WatcherService>> {
    let http = HttpFetcher::new(config.http.clone()).context("building http client")?;
    let notifier = build_notifier(config)?;

    let shared: Option<Arc<dyn DedupStore>> = match &config.store {
        StoreBackend::Postgres { url, require_tls } => {
            let options = PgStoreOptions {
                require_tls: *require_tls,
                ..PgStoreOptions::default()
            };
            let store = PostgresStore::connect(url, options)
                .await
                .context("connecting postgres dedup store")?;
            Some(Arc::new(store))
        }
        StoreBackend::JsonFiles | StoreBackend::Memory => None,
    };

    let mut watchers = Vec::with_capacity(config.sources.len());
    for &kind in &config.sources {
        let provider: Arc<dyn Provider> = match kind {
            SourceKind::Asi67 => Arc::new(Asi67Provider::new(http.clone(), config.asi67.clone())),
            SourceKind::RememberMe => Arc::new(
                RememberMeProvider::new(http.clone(), config.rememberme.clone())
                    .context("building remember-me provider")?,
            ),
        };
        let store: Arc<dyn DedupStore> = match &shared {
            Some(store) => Arc::clone(store),
            None if config.store == StoreBackend::Memory => Arc::new(MemoryStore::new()),
            None => Arc::new(JsonFileStore::open(config.data_file(kind)).await),
        };
        info!(source = %kind, provider = provider.name(), "watcher configured");
        watchers.push(WatcherService::new(provider, store, Arc::clone(&notifier)));
    }
    Ok(watchers)
}

pub async fn scheduler_from_config(config: &WatcherConfig) -> anyhow::Result<Scheduler> {
    let watchers = build_watchers(config).await?;
    Ok(Scheduler::new(watchers, config.schedule))
}
