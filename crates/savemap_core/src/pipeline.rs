//! End-to-end runs: reconcile, refresh the caches, assemble and persist.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::ResolvedSettings;
use crate::manifest::{
    Manifest, ManifestOverride, malformed_pages, missing_games, refresh_manifest,
    render_malformed, render_missing,
};
use crate::path::{TOO_BROAD_REVISION, TooBroadRules};
use crate::reconcile::{CacheChange, reconcile_listing, reconcile_recent_changes};
use crate::resource::{ResourceFile, write_if_changed};
use crate::runtime::CancelFlag;
use crate::steam::{SteamCache, StoreMetadataFetcher, StoreRefreshOptions, refresh_store_cache};
use crate::wiki::{PageFetcher, RefreshOptions, WikiCache, WikiMetaCache, is_game, refresh_pages};

pub const MISSING_REPORT: &str = "missing.md";
pub const MALFORMED_REPORT: &str = "wiki-malformed.md";

/// Changes are re-read from slightly before the last watermark.
const RECENT_CHANGES_OVERLAP_MINUTES: i64 = 1;

/// Every persisted store, loaded together and saved together.
#[derive(Debug, Clone, Default)]
pub struct Stores {
    pub wiki: WikiCache,
    pub meta: WikiMetaCache,
    pub steam: SteamCache,
    pub manifest: Manifest,
    pub overrides: ManifestOverride,
}

impl Stores {
    pub fn load(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            wiki: WikiCache::load_from_dir(data_dir)?,
            meta: WikiMetaCache::load_from_dir(data_dir)?,
            steam: SteamCache::load_from_dir(data_dir)?,
            manifest: Manifest::load_from_dir(data_dir)?,
            overrides: ManifestOverride::load_from_dir(data_dir)?,
        })
    }

    /// Writes the caches, the manifest and both triage reports.
    ///
    /// The recent changes watermark is only written with `include_meta`.
    pub fn save(&self, data_dir: &Path, include_meta: bool) -> Result<()> {
        self.wiki.save_to_dir(data_dir)?;
        self.steam.save_to_dir(data_dir)?;
        self.manifest.save_to_dir(data_dir)?;
        if include_meta {
            self.meta.save_to_dir(data_dir)?;
        }

        let missing = missing_games(&self.wiki, &self.manifest, &self.overrides);
        write_if_changed(&data_dir.join(MISSING_REPORT), &render_missing(&missing))?;
        let malformed = malformed_pages(&self.wiki);
        write_if_changed(&data_dir.join(MALFORMED_REPORT), &render_malformed(&malformed))?;
        Ok(())
    }
}

/// Loads the stores, runs `operation` and saves whatever state it reached.
///
/// State is saved even when the operation fails; the original error is
/// returned in that case.
pub fn execute<F>(data_dir: &Path, operation: F) -> Result<()>
where
    F: FnOnce(&mut Stores) -> Result<()>,
{
    let mut stores = Stores::load(data_dir)
        .with_context(|| format!("failed to load stores from {}", data_dir.display()))?;
    let outcome = operation(&mut stores);
    let saved = stores.save(data_dir, outcome.is_ok());

    match (outcome, saved) {
        (Ok(()), saved) => saved,
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(save_error)) => {
            warn!(error = %format!("{save_error:#}"), "failed to save state after an aborted run");
            Err(error)
        }
    }
}

/// Settings shared by every step of a run.
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub settings: &'a ResolvedSettings,
    pub rules: TooBroadRules,
    pub data_dir: &'a Path,
    pub cancel: CancelFlag,
}

impl<'a> RunContext<'a> {
    pub fn new(settings: &'a ResolvedSettings, data_dir: &'a Path) -> Self {
        let rules = settings.too_broad_rules();
        debug!(
            revision = TOO_BROAD_REVISION,
            entries = rules.len(),
            "too broad path rules loaded"
        );
        Self {
            settings,
            rules,
            data_dir,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(self, cancel: CancelFlag) -> Self {
        Self { cancel, ..self }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
    /// Refresh every cached page and product, not just dirty/outdated ones.
    pub full: bool,
    pub recent_changes: bool,
    pub missing_pages: bool,
    pub limit: Option<usize>,
    pub skip_until: Option<String>,
}

pub fn run_bulk<W, S>(
    stores: &mut Stores,
    wiki: &mut W,
    store: &mut S,
    context: &RunContext<'_>,
    options: &BulkOptions,
) -> Result<()>
where
    W: PageFetcher + ?Sized,
    S: StoreMetadataFetcher + ?Sized,
{
    let category = context.settings.category.as_str();

    if options.recent_changes {
        let until = Utc::now();
        let since = stores
            .meta
            .last_checked_recent_changes
            .unwrap_or(until - Duration::days(1))
            - Duration::minutes(RECENT_CHANGES_OVERLAP_MINUTES);
        info!(%since, %until, "checking recent changes");
        let changes = wiki.fetch_recent_changes(since, until)?;
        let result = reconcile_recent_changes(&stores.wiki, &changes, |title| {
            is_game(&mut *wiki, title, category)
        })?;
        log_summary("recent changes", &result.changes);
        stores.wiki = result.cache;
        stores.meta.last_checked_recent_changes = Some(until);
    }

    if options.missing_pages {
        info!(category, "listing category members");
        let listing = wiki.fetch_category_members(category)?;
        let result = reconcile_listing(&stores.wiki, &listing);
        log_summary("category listing", &result.changes);
        stores.wiki = result.cache;
    }

    let report = refresh_pages(
        &mut stores.wiki,
        wiki,
        &context.rules,
        &RefreshOptions {
            category,
            dirty_only: !options.full,
            titles: None,
            limit: options.limit,
            skip_until: options.skip_until.as_deref(),
            checkpoint_interval: context.settings.checkpoint_interval,
            cancel: Some(context.cancel.clone()),
        },
        |cache| cache.save_to_dir(context.data_dir).map(|_| ()),
    )?;

    let steam_ids: Vec<u32> = report
        .refreshed
        .iter()
        .filter_map(|title| stores.wiki.pages.get(title))
        .filter_map(|record| record.steam)
        .collect();
    stores.steam.mark_outdated(steam_ids);

    refresh_store_cache(
        &mut stores.steam,
        store,
        &StoreRefreshOptions {
            outdated_only: !options.full,
            ids: None,
            limit: None,
            batch_size: context.settings.steam_batch_size,
            checkpoint_interval: context.settings.checkpoint_interval,
            cancel: Some(context.cancel.clone()),
        },
        |cache| cache.save_to_dir(context.data_dir).map(|_| ()),
    )?;

    refresh_manifest(
        &mut stores.manifest,
        &stores.wiki,
        &stores.steam,
        &stores.overrides,
        &context.rules,
        None,
    );
    if context.cancel.is_cancelled() {
        warn!("bulk run interrupted; saving progress");
    }
    info!(
        wiki_requests = wiki.request_count(),
        store_requests = store.request_count(),
        "bulk run finished"
    );
    Ok(())
}

/// Refreshes the named games; with `local`, only reassembles them from the caches.
pub fn run_solo<W, S>(
    stores: &mut Stores,
    wiki: &mut W,
    store: &mut S,
    context: &RunContext<'_>,
    games: &[String],
    local: bool,
) -> Result<()>
where
    W: PageFetcher + ?Sized,
    S: StoreMetadataFetcher + ?Sized,
{
    let mut titles: BTreeSet<String> = games.iter().cloned().collect();

    if !local {
        let report = refresh_pages(
            &mut stores.wiki,
            wiki,
            &context.rules,
            &RefreshOptions {
                category: context.settings.category.as_str(),
                dirty_only: false,
                titles: Some(games),
                limit: None,
                skip_until: None,
                checkpoint_interval: 0,
                cancel: Some(context.cancel.clone()),
            },
            |_| Ok(()),
        )?;
        titles.extend(report.refreshed);

        let steam_ids: Vec<u32> = titles
            .iter()
            .filter_map(|title| stores.wiki.pages.get(title))
            .filter_map(|record| record.steam)
            .collect();
        stores.steam.mark_outdated(steam_ids.iter().copied());
        refresh_store_cache(
            &mut stores.steam,
            store,
            &StoreRefreshOptions {
                outdated_only: false,
                ids: Some(steam_ids),
                limit: None,
                batch_size: context.settings.steam_batch_size,
                checkpoint_interval: 0,
                cancel: Some(context.cancel.clone()),
            },
            |_| Ok(()),
        )?;
    }

    let titles: Vec<String> = titles.into_iter().collect();
    refresh_manifest(
        &mut stores.manifest,
        &stores.wiki,
        &stores.steam,
        &stores.overrides,
        &context.rules,
        Some(&titles),
    );
    Ok(())
}

fn log_summary(source: &str, changes: &[CacheChange]) {
    let count = |predicate: fn(&CacheChange) -> bool| {
        changes.iter().filter(|change| predicate(change)).count()
    };
    info!(
        source,
        inserted = count(|change| matches!(change, CacheChange::Inserted { .. })),
        renamed = count(|change| matches!(change, CacheChange::Renamed { .. })),
        dirty = count(|change| matches!(change, CacheChange::MarkedDirty { .. })),
        "wiki cache reconciled"
    );
}
