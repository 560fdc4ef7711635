use std::collections::{BTreeMap, BTreeSet};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ResolvedSettings;
use crate::extract::{PageExtraction, PageFlags, StoreIds, extract_page};
use crate::path::TooBroadRules;
use crate::reconcile::{CacheChange, ListedPage, RecentChange, move_record};
use crate::resource::ResourceFile;
use crate::runtime::CancelFlag;

const RECENT_CHANGES_TIMESTAMP: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Cached state of one wiki page, keyed by its current title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WikiPageRecord {
    pub page_id: u64,
    #[serde(skip_serializing_if = "is_false")]
    pub dirty: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub renamed_from: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raw_templates: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam: Option<u32>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub steam_side: BTreeSet<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gog: Option<u64>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub gog_side: BTreeSet<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lutris: Option<String>,
    #[serde(flatten)]
    pub flags: PageFlags,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl WikiPageRecord {
    pub fn apply_extraction(
        &mut self,
        page_id: u64,
        revision_id: Option<u64>,
        extraction: PageExtraction,
    ) {
        self.page_id = page_id;
        self.revision_id = revision_id;
        self.dirty = false;
        self.raw_templates = extraction.raw_templates;
        self.flags = PageFlags::from(extraction.paths.diagnostics);

        let StoreIds {
            steam,
            steam_side,
            gog,
            gog_side,
            lutris,
        } = extraction.ids;
        self.steam = steam;
        self.steam_side = steam_side;
        self.gog = gog;
        self.gog_side = gog_side;
        self.lutris = lutris;
    }

    pub fn store_ids(&self) -> StoreIds {
        StoreIds {
            steam: self.steam,
            steam_side: self.steam_side.clone(),
            gog: self.gog,
            gog_side: self.gog_side.clone(),
            lutris: self.lutris.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WikiCache {
    pub pages: BTreeMap<String, WikiPageRecord>,
}

impl ResourceFile for WikiCache {
    const FILE_NAME: &'static str = "wiki-game-cache.yaml";
}

/// Store ids that some page claims as its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryIds {
    pub steam: BTreeSet<u32>,
    pub gog: BTreeSet<u64>,
}

impl WikiCache {
    pub fn primary_ids(&self) -> PrimaryIds {
        let mut ids = PrimaryIds::default();
        for record in self.pages.values() {
            ids.steam.extend(record.steam);
            ids.gog.extend(record.gog);
        }
        ids
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WikiMetaCache {
    pub last_checked_recent_changes: Option<DateTime<Utc>>,
}

impl ResourceFile for WikiMetaCache {
    const FILE_NAME: &'static str = "wiki-meta-cache.yaml";

    fn initialize(mut self) -> Self {
        if self.last_checked_recent_changes.is_none() {
            self.last_checked_recent_changes = Some(Utc::now() - chrono::Duration::days(1));
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// Title after following redirects.
    pub title: String,
    pub page_id: u64,
    pub revision_id: Option<u64>,
    pub raw_markup: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageLookup {
    Found(FetchedPage),
    Missing,
}

pub trait PageFetcher {
    fn fetch_page(&mut self, title: &str) -> Result<PageLookup>;
    fn fetch_category_members(&mut self, category: &str) -> Result<Vec<ListedPage>>;
    fn fetch_recent_changes(
        &mut self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BTreeMap<String, RecentChange>>;
    fn fetch_page_categories(&mut self, title: &str) -> Result<Vec<String>>;
    fn fetch_title_by_page_id(&mut self, page_id: u64) -> Result<Option<String>>;
    fn request_count(&self) -> usize;
}

pub fn is_game<F: PageFetcher + ?Sized>(
    fetcher: &mut F,
    title: &str,
    category: &str,
) -> Result<bool> {
    Ok(fetcher
        .fetch_page_categories(title)?
        .iter()
        .any(|name| name == category))
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOptions<'a> {
    pub category: &'a str,
    pub dirty_only: bool,
    /// Refresh exactly these titles, fetching ones the cache does not know yet.
    pub titles: Option<&'a [String]>,
    pub limit: Option<usize>,
    /// Resume after this title; it is not processed again.
    pub skip_until: Option<&'a str>,
    /// Pages between checkpoints; zero disables them.
    pub checkpoint_interval: usize,
    pub cancel: Option<CancelFlag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Titles, after any rename, whose record was re-extracted.
    pub refreshed: BTreeSet<String>,
    pub changes: Vec<CacheChange>,
    pub processed: usize,
    pub checkpoints: usize,
    pub cancelled: bool,
}

/// Fetches and re-extracts pages in title order.
///
/// Without explicit titles the pass covers cached pages (only dirty ones
/// with `dirty_only`). Explicit titles are fetched even when uncached and
/// inserted when they exist.
///
/// A page that went missing is looked up by page id; when it still exists
/// in the games category under another title the record moves there,
/// otherwise it is dropped. Failures while looking up the new identity leave
/// the record as it was. Any other fetch failure aborts the pass.
pub fn refresh_pages<F, C>(
    cache: &mut WikiCache,
    fetcher: &mut F,
    rules: &TooBroadRules,
    options: &RefreshOptions<'_>,
    mut checkpoint: C,
) -> Result<RefreshReport>
where
    F: PageFetcher + ?Sized,
    C: FnMut(&WikiCache) -> Result<()>,
{
    let candidates: BTreeSet<String> = match options.titles {
        Some(titles) => titles.iter().cloned().collect(),
        None => cache
            .pages
            .iter()
            .filter(|(_, record)| !options.dirty_only || record.dirty)
            .map(|(title, _)| title.clone())
            .collect(),
    };
    let selected: Vec<String> = candidates
        .into_iter()
        .filter(|title| {
            options
                .skip_until
                .is_none_or(|cursor| title.as_str() > cursor)
        })
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();
    let uncached: BTreeSet<&String> = selected
        .iter()
        .filter(|title| !cache.pages.contains_key(*title))
        .collect();

    info!(pages = selected.len(), new = uncached.len(), "refreshing wiki pages");
    let mut report = RefreshReport::default();
    for title in &selected {
        if options.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            warn!(processed = report.processed, "wiki refresh cancelled");
            report.cancelled = true;
            break;
        }
        // Earlier renames in this pass can move or drop a selected record.
        if !cache.pages.contains_key(title) && !uncached.contains(title) {
            continue;
        }
        refresh_page(cache, fetcher, rules, options.category, title, &mut report)?;

        report.processed += 1;
        if options.checkpoint_interval > 0 && report.processed % options.checkpoint_interval == 0 {
            checkpoint(cache)?;
            report.checkpoints += 1;
            info!(processed = report.processed, last = %title, "wiki cache checkpoint");
        }
    }

    Ok(report)
}

fn refresh_page<F>(
    cache: &mut WikiCache,
    fetcher: &mut F,
    rules: &TooBroadRules,
    category: &str,
    title: &str,
    report: &mut RefreshReport,
) -> Result<()>
where
    F: PageFetcher + ?Sized,
{
    debug!(title, "fetching page");
    let (page, verified) = match fetcher.fetch_page(title)? {
        PageLookup::Found(page) => (page, false),
        PageLookup::Missing => {
            let Some(page_id) = cache.pages.get(title).map(|record| record.page_id) else {
                warn!(title, "page does not exist");
                return Ok(());
            };
            match find_moved_page(fetcher, page_id, category) {
                Ok(Some(page)) => (page, true),
                Ok(None) => {
                    remove_record(cache, title, report);
                    return Ok(());
                }
                Err(error) => {
                    warn!(title, page_id, error = %format!("{error:#}"), "failed to locate missing page; keeping record");
                    return Ok(());
                }
            }
        }
    };

    if page.title != title {
        if !verified {
            match is_game(fetcher, &page.title, category) {
                Ok(true) => {}
                Ok(false) => {
                    remove_record(cache, title, report);
                    return Ok(());
                }
                Err(error) => {
                    warn!(title, target = %page.title, error = %format!("{error:#}"), "failed to check redirect target; keeping record");
                    return Ok(());
                }
            }
        }
        if move_record(cache, title, &page.title) {
            let change = CacheChange::Renamed {
                from: title.to_string(),
                to: page.title.clone(),
                page_id: page.page_id,
            };
            change.log();
            report.changes.push(change);
        }
    }

    let extraction = extract_page(&page.title, &page.raw_markup, rules);
    if !cache.pages.contains_key(&page.title) {
        let change = CacheChange::Inserted {
            title: page.title.clone(),
            page_id: page.page_id,
        };
        change.log();
        report.changes.push(change);
    }
    let record = cache.pages.entry(page.title.clone()).or_default();
    record.apply_extraction(page.page_id, page.revision_id, extraction);
    if record.flags.any() {
        debug!(title = %page.title, flags = ?record.flags.labels(), "page has extraction diagnostics");
    }
    report.refreshed.insert(page.title);
    Ok(())
}

fn find_moved_page<F>(fetcher: &mut F, page_id: u64, category: &str) -> Result<Option<FetchedPage>>
where
    F: PageFetcher + ?Sized,
{
    let Some(new_title) = fetcher.fetch_title_by_page_id(page_id)? else {
        return Ok(None);
    };
    if !is_game(fetcher, &new_title, category)? {
        return Ok(None);
    }
    match fetcher.fetch_page(&new_title)? {
        PageLookup::Found(page) => Ok(Some(page)),
        PageLookup::Missing => Ok(None),
    }
}

fn remove_record(cache: &mut WikiCache, title: &str, report: &mut RefreshReport) {
    if cache.pages.remove(title).is_some() {
        let change = CacheChange::Removed {
            title: title.to_string(),
        };
        change.log();
        report.changes.push(change);
    }
}

/// Error object returned by the MediaWiki API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("MediaWiki API error [{code}]: {info}")]
pub struct MediaWikiError {
    pub code: String,
    pub info: String,
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub request_delay_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_settings(settings: &ResolvedSettings) -> Self {
        Self {
            api_url: settings.api_url.clone(),
            user_agent: settings.user_agent.clone(),
            timeout_ms: settings.timeout_ms,
            request_delay_ms: settings.request_delay_ms,
            max_retries: settings.max_retries,
            retry_delay_ms: settings.retry_delay_ms,
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid wiki API URL: {}", self.config.api_url))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        return Err(MediaWikiError {
                            code: code.to_string(),
                            info: info.to_string(),
                        }
                        .into());
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.request_delay_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl PageFetcher for MediaWikiClient {
    fn fetch_page(&mut self, title: &str) -> Result<PageLookup> {
        let params = vec![
            ("action", "parse".to_string()),
            ("page", title.to_string()),
            ("prop", "wikitext|revid".to_string()),
            ("redirects", "1".to_string()),
        ];
        let response = match self.request_json_get(&params) {
            Ok(response) => response,
            Err(error)
                if error
                    .downcast_ref::<MediaWikiError>()
                    .is_some_and(|error| error.code == "missingtitle") =>
            {
                return Ok(PageLookup::Missing);
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to fetch page {title}"));
            }
        };

        let parsed: ParseResponse =
            serde_json::from_value(response).context("failed to decode parse API response")?;
        Ok(PageLookup::Found(FetchedPage {
            title: parsed.parse.title,
            page_id: parsed.parse.pageid,
            revision_id: parsed.parse.revid,
            raw_markup: parsed.parse.wikitext,
        }))
    }

    fn fetch_category_members(&mut self, category: &str) -> Result<Vec<ListedPage>> {
        let mut pages = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "categorymembers".to_string()),
                ("cmtitle", category.to_string()),
                ("cmtype", "page".to_string()),
                ("cmprop", "ids|title".to_string()),
                ("cmlimit", "500".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("cmcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode categorymembers API response")?;
            for item in parsed.query.categorymembers {
                pages.push(ListedPage {
                    page_id: item.pageid,
                    title: item.title,
                });
            }

            continue_token = parsed.continuation.and_then(|cont| cont.cmcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(pages)
    }

    fn fetch_recent_changes(
        &mut self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BTreeMap<String, RecentChange>> {
        let mut changes = BTreeMap::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", "recentchanges".to_string()),
                ("rcprop", "title|ids|redirect".to_string()),
                ("rcdir", "newer".to_string()),
                ("rcstart", since.format(RECENT_CHANGES_TIMESTAMP).to_string()),
                ("rcend", until.format(RECENT_CHANGES_TIMESTAMP).to_string()),
                ("rcnamespace", "0".to_string()),
                ("rclimit", "500".to_string()),
                ("rctype", "edit|new".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("rccontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode recentchanges API response")?;
            for item in parsed.query.recentchanges {
                changes.insert(
                    item.title,
                    RecentChange {
                        page_id: item.pageid,
                        redirect: item.redirect,
                    },
                );
            }

            continue_token = parsed.continuation.and_then(|cont| cont.rccontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(changes)
    }

    fn fetch_page_categories(&mut self, title: &str) -> Result<Vec<String>> {
        let mut categories = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("prop", "categories".to_string()),
                ("titles", title.to_string()),
                ("cllimit", "max".to_string()),
            ];
            if let Some(token) = &continue_token {
                params.push(("clcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode categories API response")?;
            for page in parsed.query.pages {
                categories.extend(page.categories.into_iter().map(|item| item.title));
            }

            continue_token = parsed.continuation.and_then(|cont| cont.clcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(categories)
    }

    fn fetch_title_by_page_id(&mut self, page_id: u64) -> Result<Option<String>> {
        let params = vec![
            ("action", "query".to_string()),
            ("pageids", page_id.to_string()),
        ];
        let response = self.request_json_get(&params)?;
        let parsed: QueryResponse =
            serde_json::from_value(response).context("failed to decode page id API response")?;
        Ok(parsed
            .query
            .pages
            .into_iter()
            .find(|page| !page.missing && !page.invalid)
            .map(|page| page.title))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    parse: ParsePayload,
}

#[derive(Debug, Deserialize)]
struct ParsePayload {
    title: String,
    pageid: u64,
    revid: Option<u64>,
    #[serde(default)]
    wikitext: String,
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    categorymembers: Vec<CategoryMemberItem>,
    #[serde(default)]
    recentchanges: Vec<RecentChangeItem>,
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    cmcontinue: Option<String>,
    rccontinue: Option<String>,
    clcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryMemberItem {
    pageid: u64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct RecentChangeItem {
    title: String,
    pageid: u64,
    #[serde(default)]
    redirect: bool,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    categories: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}
