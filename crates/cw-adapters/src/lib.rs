//! Source providers plus the shared HTTP fetcher and paginated fan-out.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cw_core::{Listing, Provider, ProviderError};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "cw-adapters";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; ClassifiedsWatcher/1.0)";
pub const ASI67_LISTING_BASE_URL: &str = "https://www.asi67.com/location/location,";
pub const DEFAULT_SCRAPE_CONCURRENCY: usize = 5;
/// Upper bound on pages fetched per run, whatever page count a source reports.
pub const DEFAULT_MAX_PAGES: u32 = 200;

/// How a source is reached. Decides the default page fan-out policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crawlability {
    Api,
    PublicHtml,
}

impl Crawlability {
    /// JSON APIs tolerate unbounded fan-out; scraped sites get a small pool
    /// to stay under anti-scraping thresholds.
    pub fn default_fan_out(self) -> FanOutLimit {
        match self {
            Crawlability::Api => FanOutLimit::Unbounded,
            Crawlability::PublicHtml => FanOutLimit::Bounded(DEFAULT_SCRAPE_CONCURRENCY),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Asi67,
    RememberMe,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Asi67, SourceKind::RememberMe];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Asi67 => "asi67",
            SourceKind::RememberMe => "rememberme",
        }
    }

    pub fn crawlability(self) -> Crawlability {
        match self {
            SourceKind::Asi67 => Crawlability::Api,
            SourceKind::RememberMe => Crawlability::PublicHtml,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "asi67" => Ok(SourceKind::Asi67),
            "rememberme" | "remembermefrance" => Ok(SourceKind::RememberMe),
            other => anyhow::bail!("unknown source {other:?} (expected asi67 or rememberme)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 16,
        }
    }
}

/// Shared HTTP client. Every request holds a permit from a global semaphore
/// and is raced against the caller's cancellation token.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn get_text(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let request = self.client.get(url);
        let response = self.execute(request, url, cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            body = response.text() => body.map_err(|e| request_error(url, e)),
        }
    }

    /// POST a JSON payload and return the raw response body.
    pub async fn post_json<B>(
        &self,
        url: &str,
        payload: &B,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ProviderError>
    where
        B: Serialize + ?Sized,
    {
        let request = self
            .client
            .post(url)
            .header("X-Requested-With", "XMLHttpRequest")
            .json(payload);
        let response = self.execute(request, url, cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            body = response.bytes() => body.map(|b| b.to_vec()).map_err(|e| request_error(url, e)),
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            permit = self.global_limit.acquire() => permit.context("http semaphore closed")?,
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            sent = request.send() => sent.map_err(|e| request_error(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }
}

fn request_error(url: &str, err: reqwest::Error) -> ProviderError {
    ProviderError::Request {
        url: url.to_string(),
        source: err.into(),
    }
}

/// One page of a paginated source, with the page count it advertises.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub listings: Vec<Listing>,
    pub total_pages: u32,
}

#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    async fn fetch_page(
        &self,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutLimit {
    Unbounded,
    Bounded(usize),
}

/// Result of a paginated fetch. `failed_pages` lists pages whose listings
/// are missing from `listings`; `skipped_pages` counts advertised pages past
/// the page cap that were never requested.
#[derive(Debug, Clone, Default)]
pub struct PagedFetch {
    pub listings: Vec<Listing>,
    pub total_pages: u32,
    pub failed_pages: Vec<u32>,
    pub skipped_pages: u32,
}

impl PagedFetch {
    pub fn is_complete(&self) -> bool {
        self.failed_pages.is_empty() && self.skipped_pages == 0
    }
}

pub fn total_pages_for(total_items: u64, per_page: u32) -> u32 {
    if per_page == 0 {
        return 1;
    }
    let pages = total_items.div_ceil(u64::from(per_page));
    u32::try_from(pages).unwrap_or(u32::MAX).max(1)
}

/// Fetches page 1, learns the page count from it, then fans out over the
/// remaining pages. A failing page beyond the first is logged and dropped.
/// Never requests more than `max_pages` pages.
#[derive(Debug, Clone)]
pub struct Paginator {
    source_name: String,
    limit: FanOutLimit,
    max_pages: u32,
}

impl Paginator {
    pub fn new(source_name: impl Into<String>, limit: FanOutLimit) -> Self {
        Self {
            source_name: source_name.into(),
            limit,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub async fn fetch_all<S>(
        &self,
        source: Arc<S>,
        cancel: &CancellationToken,
    ) -> Result<PagedFetch, ProviderError>
    where
        S: PageSource,
    {
        let first = source.fetch_page(1, cancel).await?;
        let total_pages = first.total_pages.max(1);
        let last_page = total_pages.min(self.max_pages);
        let skipped_pages = total_pages - last_page;
        if skipped_pages > 0 {
            warn!(
                source = %self.source_name,
                total_pages,
                max_pages = self.max_pages,
                "source reports more pages than allowed, fetching only the first ones"
            );
        }
        if last_page == 1 {
            return Ok(PagedFetch {
                listings: first.listings,
                total_pages,
                failed_pages: Vec::new(),
                skipped_pages,
            });
        }

        debug!(
            source = %self.source_name,
            last_page,
            limit = ?self.limit,
            "fetching remaining pages"
        );

        let merged = Arc::new(Mutex::new(first.listings));
        let limiter = match self.limit {
            FanOutLimit::Unbounded => None,
            FanOutLimit::Bounded(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
        };

        let mut tasks = JoinSet::new();
        for page in 2..=last_page {
            let source = Arc::clone(&source);
            let merged = Arc::clone(&merged);
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = match limiter {
                    Some(limiter) => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return (page, Err(ProviderError::Cancelled)),
                        permit = limiter.acquire_owned() => permit.ok(),
                    },
                    None => None,
                };
                match source.fetch_page(page, &cancel).await {
                    Ok(fetched) => {
                        merged.lock().await.extend(fetched.listings);
                        (page, Ok(()))
                    }
                    Err(err) => (page, Err(err)),
                }
            });
        }

        let mut fetched_pages = HashSet::from([1u32]);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page, Ok(()))) => {
                    fetched_pages.insert(page);
                }
                Ok((page, Err(err))) => {
                    warn!(
                        source = %self.source_name,
                        page,
                        error = %err,
                        "page fetch failed, skipping page"
                    );
                }
                Err(err) => {
                    warn!(source = %self.source_name, error = %err, "page task did not complete");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let failed_pages: Vec<u32> = (2..=last_page)
            .filter(|p| !fetched_pages.contains(p))
            .collect();
        let listings = std::mem::take(&mut *merged.lock().await);
        if failed_pages.is_empty() && skipped_pages == 0 {
            info!(
                source = %self.source_name,
                total_pages,
                listings = listings.len(),
                "fetched all pages"
            );
        } else {
            warn!(
                source = %self.source_name,
                total_pages,
                failed_pages = ?failed_pages,
                skipped_pages,
                listings = listings.len(),
                "partial fetch, result may be incomplete"
            );
        }

        Ok(PagedFetch {
            listings,
            total_pages,
            failed_pages,
            skipped_pages,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Asi67Config {
    pub api_url: String,
    pub items_per_page: u32,
    pub max_pages: u32,
}

impl Default for Asi67Config {
    fn default() -> Self {
        Self {
            api_url: "https://www.asi67.com/webapi/getJson/Templates/ProductsList".to_string(),
            items_per_page: 12,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Asi67Response {
    data: Asi67Data,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Asi67Data {
    #[serde(default)]
    prod_count: u64,
    #[serde(default, deserialize_with = "map_or_empty_list")]
    prod_id: BTreeMap<String, Asi67Item>,
}

#[derive(Debug, Default, Deserialize)]
struct Asi67Item {
    #[serde(default)]
    city: String,
    #[serde(default)]
    cp: String,
    #[serde(default)]
    surface: f64,
    #[serde(default)]
    prod_ref: String,
    #[serde(default)]
    rent_total: f64,
    #[serde(default, rename = "pricePrimary")]
    price_primary: f64,
    #[serde(default)]
    title: LocalizedText,
}

#[derive(Debug, Default, Deserialize)]
struct LocalizedText {
    #[serde(default)]
    fr: String,
}

/// The API encodes an empty result map as `[]`.
fn map_or_empty_list<'de, D>(deserializer: D) -> Result<BTreeMap<String, Asi67Item>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MapOrList {
        Map(BTreeMap<String, Asi67Item>),
        List(IgnoredAny),
    }

    match MapOrList::deserialize(deserializer)? {
        MapOrList::Map(map) => Ok(map),
        MapOrList::List(_) => Ok(BTreeMap::new()),
    }
}

pub fn asi67_request_payload(page: u32) -> JsonValue {
    serde_json::json!({
        "params": {
            "type_offer": "2",
            "prod_type": "appt",
            "geo": "strasbourg/67000",
            "query": {
                "page": page.to_string(),
                "prod.prod_type": "appt",
                "prod.geo": "strasbourg/67000",
                "prod.geo_radius": "20",
                "prod.budget_rent_max": "1000",
            },
        },
    })
}

pub fn parse_asi67_page(
    body: &[u8],
    items_per_page: u32,
    fetched_at: DateTime<Utc>,
) -> Result<Page, ProviderError> {
    let response: Asi67Response = serde_json::from_slice(body).map_err(|e| ProviderError::Decode {
        what: "asi67 response".to_string(),
        message: e.to_string(),
    })?;

    let listings = response
        .data
        .prod_id
        .into_iter()
        .map(|(id, item)| {
            let title = if item.title.fr.trim().is_empty() {
                format!("Apartment in {} ({})", item.city, item.cp)
            } else {
                item.title.fr.trim().to_string()
            };
            let price = if item.rent_total > 0.0 { item.rent_total } else { item.price_primary };
            let url = format!("{ASI67_LISTING_BASE_URL}{id}");

            let mut listing = Listing::new(id, title, url)
                .with_price(price, "EUR")
                .with_description(format!("{:.0} m² - {}", item.surface, item.city))
                .with_metadata("city", item.city)
                .with_metadata("postal_code", item.cp)
                .with_metadata("surface", item.surface);
            if !item.prod_ref.is_empty() {
                listing = listing.with_metadata("reference", item.prod_ref);
            }
            listing.published_at = fetched_at;
            listing
        })
        .collect();

    Ok(Page {
        listings,
        total_pages: total_pages_for(response.data.prod_count, items_per_page),
    })
}

#[derive(Debug)]
struct Asi67Pages {
    http: HttpFetcher,
    config: Asi67Config,
}

#[async_trait]
impl PageSource for Asi67Pages {
    async fn fetch_page(
        &self,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page, ProviderError> {
        let body = self
            .http
            .post_json(&self.config.api_url, &asi67_request_payload(page), cancel)
            .await?;
        parse_asi67_page(&body, self.config.items_per_page, Utc::now())
    }
}

/// Apartment rentals from the asi67 JSON search API.
#[derive(Debug, Clone)]
pub struct Asi67Provider {
    pages: Arc<Asi67Pages>,
    paginator: Paginator,
}

impl Asi67Provider {
    pub const NAME: &'static str = "asi67";

    pub fn new(http: HttpFetcher, config: Asi67Config) -> Self {
        Self::with_fan_out(http, config, SourceKind::Asi67.crawlability().default_fan_out())
    }

    pub fn with_fan_out(http: HttpFetcher, config: Asi67Config, limit: FanOutLimit) -> Self {
        let paginator = Paginator::new(Self::NAME, limit).with_max_pages(config.max_pages);
        Self {
            pages: Arc::new(Asi67Pages { http, config }),
            paginator,
        }
    }
}

#[async_trait]
impl Provider for Asi67Provider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch_listings(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Listing>, ProviderError> {
        let fetched = self.paginator.fetch_all(Arc::clone(&self.pages), cancel).await?;
        Ok(fetched.listings)
    }
}

#[derive(Debug, Clone)]
pub struct RememberMeConfig {
    pub search_url: String,
    pub concurrency: usize,
    pub max_pages: u32,
}

const REMEMBERME_SEARCH_URL: &str = concat!(
    "https://remembermefrance.org/pets/?breed=0",
    "&pets_search%5Bsexe%5D=all",
    "&pets_search%5Bou_est_le_chien%5D=all",
    "&pets_search%5Burgence%5D=all",
);

impl Default for RememberMeConfig {
    fn default() -> Self {
        Self {
            search_url: REMEMBERME_SEARCH_URL.to_string(),
            concurrency: DEFAULT_SCRAPE_CONCURRENCY,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

/// Inserts `/page/N/` before the query string, WordPress style.
pub fn rememberme_page_url(search_url: &Url, page: u32) -> Url {
    let mut url = search_url.clone();
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base}/page/{page}/"));
    url
}

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Decode {
        what: format!("selector {css}"),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(card: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    card.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Parse one results page. Cards missing an id, a title or a link are
/// dropped. The page count comes from the highest `a.page-numbers` label.
pub fn parse_rememberme_page(
    html: &str,
    base_url: &Url,
    fetched_at: DateTime<Utc>,
) -> Result<Page, ProviderError> {
    let document = Html::parse_document(html);
    let card_sel = selector("article.pets")?;
    let title_sel = selector(".pet-title")?;
    let link_sel = selector(".pet-header a[href]")?;
    let content_sel = selector(".pet-content")?;
    let pager_sel = selector("a.page-numbers")?;

    let mut listings = Vec::new();
    for card in document.select(&card_sel) {
        let Some(id) = card.value().attr("id").and_then(|s| text_or_none(s.to_string())) else {
            continue;
        };
        let Some(title) = first_text(&card, &title_sel) else {
            continue;
        };
        let Some(href) = card.select(&link_sel).next().and_then(|a| a.value().attr("href")) else {
            continue;
        };
        let url = match base_url.join(href.trim()) {
            Ok(url) => url.to_string(),
            Err(err) => {
                debug!(id = %id, href = %href, error = %err, "skipping card with unusable link");
                continue;
            }
        };
        let description = first_text(&card, &content_sel).unwrap_or_default();

        let mut listing = Listing::new(id, title, url)
            .with_price(0.0, "EUR")
            .with_description(description);
        listing.published_at = fetched_at;
        listings.push(listing);
    }

    let total_pages = document
        .select(&pager_sel)
        .filter_map(|a| a.text().collect::<String>().trim().parse::<u32>().ok())
        .max()
        .unwrap_or(1)
        .max(1);

    Ok(Page {
        listings,
        total_pages,
    })
}

#[derive(Debug)]
struct RememberMePages {
    http: HttpFetcher,
    search_url: Url,
}

#[async_trait]
impl PageSource for RememberMePages {
    async fn fetch_page(
        &self,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page, ProviderError> {
        let url = if page <= 1 {
            self.search_url.clone()
        } else {
            rememberme_page_url(&self.search_url, page)
        };
        let html = self.http.get_text(url.as_str(), cancel).await?;
        parse_rememberme_page(&html, &url, Utc::now())
    }
}

/// Pet adoption notices scraped from the Remember Me France listing pages.
#[derive(Debug, Clone)]
pub struct RememberMeProvider {
    pages: Arc<RememberMePages>,
    paginator: Paginator,
}

impl RememberMeProvider {
    pub const NAME: &'static str = "remember-me-france";

    pub fn new(http: HttpFetcher, config: RememberMeConfig) -> anyhow::Result<Self> {
        let search_url = Url::parse(&config.search_url)
            .with_context(|| format!("invalid remember-me search url {}", config.search_url))?;
        let limit = FanOutLimit::Bounded(config.concurrency.max(1));
        Ok(Self {
            pages: Arc::new(RememberMePages { http, search_url }),
            paginator: Paginator::new(Self::NAME, limit).with_max_pages(config.max_pages),
        })
    }
}

#[async_trait]
impl Provider for RememberMeProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn fetch_listings(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<Listing>, ProviderError> {
        let fetched = self.paginator.fetch_all(Arc::clone(&self.pages), cancel).await?;
        Ok(fetched.listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ASI67_FIXTURE: &str = include_str!("../tests/fixtures/asi67_page1.json");
    const REMEMBERME_FIXTURE: &str = include_str!("../tests/fixtures/rememberme_page1.html");

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    /// Serves `total_items` listings, `per_page` at a time, failing the
    /// pages listed in `failing`.
    struct FakePages {
        total_items: u64,
        per_page: u32,
        failing: Vec<u32>,
        requested: std::sync::Mutex<Vec<u32>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakePages {
        fn new(total_items: u64, per_page: u32, failing: Vec<u32>) -> Self {
            Self {
                total_items,
                per_page,
                failing,
                requested: std::sync::Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn requested(&self) -> Vec<u32> {
            let mut pages = self.requested.lock().unwrap().clone();
            pages.sort();
            pages
        }
    }

    #[async_trait]
    impl PageSource for FakePages {
        async fn fetch_page(
            &self,
            page: u32,
            cancel: &CancellationToken,
        ) -> Result<Page, ProviderError> {
            self.requested.lock().unwrap().push(page);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let slept = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(Duration::from_millis(20)) => true,
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if !slept {
                return Err(ProviderError::Cancelled);
            }

            if self.failing.contains(&page) {
                return Err(ProviderError::HttpStatus {
                    status: 504,
                    url: format!("fake://page/{page}"),
                });
            }
            let start = u64::from(page - 1) * u64::from(self.per_page);
            let end = (start + u64::from(self.per_page)).min(self.total_items);
            let listings = (start..end)
                .map(|i| {
                    Listing::new(
                        format!("{i}"),
                        format!("Item {i}"),
                        format!("https://example.com/{i}"),
                    )
                })
                .collect();
            Ok(Page {
                listings,
                total_pages: total_pages_for(self.total_items, self.per_page),
            })
        }
    }

    fn sorted_ids(listings: &[Listing]) -> Vec<u64> {
        let mut ids: Vec<u64> = listings.iter().map(|l| l.id.parse().unwrap()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn total_pages_rounds_up_and_never_drops_below_one() {
        assert_eq!(total_pages_for(30, 12), 3);
        assert_eq!(total_pages_for(24, 12), 2);
        assert_eq!(total_pages_for(0, 12), 1);
        assert_eq!(total_pages_for(5, 0), 1);
    }

    #[tokio::test]
    async fn remaining_pages_are_fetched_after_first() {
        let source = Arc::new(FakePages::new(30, 12, vec![]));
        let fetched = Paginator::new("fake", FanOutLimit::Unbounded)
            .fetch_all(Arc::clone(&source), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.requested(), vec![1, 2, 3]);
        assert_eq!(fetched.total_pages, 3);
        assert!(fetched.is_complete());
        assert_eq!(sorted_ids(&fetched.listings), (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_page_is_dropped_and_reported() {
        let source = Arc::new(FakePages::new(30, 12, vec![3]));
        let fetched = Paginator::new("fake", FanOutLimit::Unbounded)
            .fetch_all(Arc::clone(&source), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.requested(), vec![1, 2, 3]);
        assert_eq!(fetched.failed_pages, vec![3]);
        assert!(!fetched.is_complete());
        assert_eq!(sorted_ids(&fetched.listings), (0..24).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn first_page_failure_fails_the_fetch() {
        let source = Arc::new(FakePages::new(30, 12, vec![1]));
        let err = Paginator::new("fake", FanOutLimit::Unbounded)
            .fetch_all(Arc::clone(&source), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::HttpStatus { status: 504, .. }));
        assert_eq!(source.requested(), vec![1]);
    }

    #[tokio::test]
    async fn single_page_source_skips_fan_out() {
        let source = Arc::new(FakePages::new(7, 12, vec![]));
        let fetched = Paginator::new("fake", FanOutLimit::Bounded(2))
            .fetch_all(Arc::clone(&source), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(source.requested(), vec![1]);
        assert_eq!(fetched.listings.len(), 7);
    }

    #[tokio::test]
    async fn absurd_page_count_is_capped() {
        let source = Arc::new(FakePages::new(999_999_990, 10, vec![]));
        let fetched = Paginator::new("fake", FanOutLimit::Unbounded)
            .with_max_pages(3)
            .fetch_all(Arc::clone(&source), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.requested(), vec![1, 2, 3]);
        assert_eq!(fetched.total_pages, 99_999_999);
        assert_eq!(fetched.skipped_pages, 99_999_996);
        assert!(!fetched.is_complete());
        assert_eq!(sorted_ids(&fetched.listings), (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn bounded_fan_out_caps_in_flight_requests() {
        let source = Arc::new(FakePages::new(120, 10, vec![]));
        let fetched = Paginator::new("fake", FanOutLimit::Bounded(3))
            .fetch_all(Arc::clone(&source), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fetched.listings.len(), 120);
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn unbounded_fan_out_runs_pages_concurrently() {
        let source = Arc::new(FakePages::new(60, 10, vec![]));
        Paginator::new("fake", FanOutLimit::Unbounded)
            .fetch_all(Arc::clone(&source), &CancellationToken::new())
            .await
            .unwrap();
        assert!(source.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn cancellation_during_fan_out_fails_the_fetch() {
        let source = Arc::new(FakePages::new(60, 10, vec![]));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = Paginator::new("fake", FanOutLimit::Bounded(1))
            .fetch_all(Arc::clone(&source), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[test]
    fn asi67_fixture_maps_to_listings() {
        let page = parse_asi67_page(ASI67_FIXTURE.as_bytes(), 12, fixed_time()).unwrap();
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.listings.len(), 2);

        let titled = page.listings.iter().find(|l| l.id == "10234").unwrap();
        assert_eq!(titled.title, "T2 lumineux proche tram");
        assert_eq!(titled.url, "https://www.asi67.com/location/location,10234");
        assert_eq!(titled.price, 780.0);
        assert_eq!(titled.currency, "EUR");
        assert_eq!(titled.description, "48 m² - Strasbourg");
        assert_eq!(titled.metadata["postal_code"], "67000");
        assert_eq!(titled.published_at, fixed_time());

        let untitled = page.listings.iter().find(|l| l.id == "10577").unwrap();
        assert_eq!(untitled.title, "Apartment in Schiltigheim (67300)");
        assert_eq!(untitled.price, 640.0, "falls back to pricePrimary");
        assert!(untitled.is_valid());
    }

    #[test]
    fn asi67_empty_result_list_is_accepted() {
        let body = br#"{"data":{"prodCount":0,"prodId":[]}}"#;
        let page = parse_asi67_page(body, 12, fixed_time()).unwrap();
        assert!(page.listings.is_empty());
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn asi67_garbage_is_a_decode_error() {
        let err = parse_asi67_page(b"<html>maintenance</html>", 12, fixed_time()).unwrap_err();
        assert!(matches!(err, ProviderError::Decode { .. }));
    }

    #[test]
    fn asi67_payload_carries_page_number() {
        let payload = asi67_request_payload(4);
        assert_eq!(payload["params"]["query"]["page"], "4");
    }

    #[test]
    fn rememberme_fixture_extracts_cards_and_page_count() {
        let base = Url::parse("https://remembermefrance.org/pets/?breed=0").unwrap();
        let page = parse_rememberme_page(REMEMBERME_FIXTURE, &base, fixed_time()).unwrap();

        assert_eq!(page.total_pages, 4);
        let ids: Vec<_> = page.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["pet-1201", "pet-1202"]);

        let rex = &page.listings[0];
        assert_eq!(rex.title, "Rex - Mâle");
        assert_eq!(rex.url, "https://remembermefrance.org/pets/rex/");
        assert_eq!(rex.description, "Gentil chien de 4 ans, sociable avec les chats.");
        assert_eq!(rex.price, 0.0);

        assert_eq!(
            page.listings[1].url, "https://remembermefrance.org/pets/nala/",
            "relative link resolved"
        );
    }

    #[test]
    fn rememberme_page_without_pager_is_single_page() {
        let base = Url::parse("https://remembermefrance.org/pets/").unwrap();
        let html = "<html><body><p>Aucun résultat</p></body></html>";
        let page = parse_rememberme_page(html, &base, fixed_time()).unwrap();
        assert!(page.listings.is_empty());
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn rememberme_page_url_inserts_page_segment_before_query() {
        let base = Url::parse("https://remembermefrance.org/pets/?breed=0&x=all").unwrap();
        assert_eq!(
            rememberme_page_url(&base, 2).as_str(),
            "https://remembermefrance.org/pets/page/2/?breed=0&x=all"
        );
        let bare = Url::parse("https://site.org").unwrap();
        assert_eq!(rememberme_page_url(&bare, 3).as_str(), "https://site.org/page/3/");
    }

    #[test]
    fn source_kinds_parse_from_config_names() {
        assert_eq!("asi67".parse::<SourceKind>().unwrap(), SourceKind::Asi67);
        assert_eq!("Remember-Me".parse::<SourceKind>().unwrap(), SourceKind::RememberMe);
        assert!("leboncoin".parse::<SourceKind>().is_err());
        assert_eq!(
            SourceKind::RememberMe.crawlability().default_fan_out(),
            FanOutLimit::Bounded(5)
        );
        assert_eq!(SourceKind::Asi67.crawlability().default_fan_out(), FanOutLimit::Unbounded);
    }
}
