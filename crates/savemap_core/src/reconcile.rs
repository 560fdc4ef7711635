//! Keeps the wiki page cache in step with page listings and the recent changes feed.
//!
//! Each pass takes the current cache by reference and returns the updated
//! cache together with a log of what changed. Records are keyed by title but
//! identified by page id, so a known id under a new title is a rename.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, info};

use crate::wiki::{WikiCache, WikiPageRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedPage {
    pub page_id: u64,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecentChange {
    pub page_id: u64,
    pub redirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Inserted { title: String, page_id: u64 },
    Renamed { from: String, to: String, page_id: u64 },
    MarkedDirty { title: String },
    Removed { title: String },
}

impl CacheChange {
    pub fn log(&self) {
        match self {
            Self::Inserted { title, page_id } => info!(title = %title, page_id, "new page"),
            Self::Renamed { from, to, page_id } => {
                info!(from = %from, to = %to, page_id, "page renamed")
            }
            Self::MarkedDirty { title } => debug!(title = %title, "page marked dirty"),
            Self::Removed { title } => info!(title = %title, "page removed"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub cache: WikiCache,
    pub changes: Vec<CacheChange>,
}

/// Adds pages from a category listing that the cache does not know yet.
///
/// Titles already cached are left alone; their edits arrive through the
/// recent changes feed.
pub fn reconcile_listing(cache: &WikiCache, listing: &[ListedPage]) -> Reconciliation {
    let mut reconciler = Reconciler::new(cache);
    let mut listing: Vec<&ListedPage> = listing.iter().collect();
    listing.sort_by(|a, b| a.title.cmp(&b.title));

    for page in listing {
        if reconciler.cache.pages.contains_key(&page.title) {
            continue;
        }
        match reconciler.title_of(page.page_id) {
            Some(old_title) => reconciler.rename(&old_title, &page.title),
            None => reconciler.insert(&page.title, page.page_id),
        }
    }

    reconciler.finish()
}

/// Marks edited pages dirty and picks up new or renamed ones.
///
/// Titles the cache has never seen are only added when `is_game` confirms
/// them. Redirect entries are skipped because the target's own change
/// record carries the edit.
pub fn reconcile_recent_changes<F>(
    cache: &WikiCache,
    changes: &BTreeMap<String, RecentChange>,
    mut is_game: F,
) -> Result<Reconciliation>
where
    F: FnMut(&str) -> Result<bool>,
{
    let mut reconciler = Reconciler::new(cache);

    for (title, change) in changes {
        if change.redirect {
            debug!(title = %title, "skipping redirect change");
            continue;
        }
        if reconciler.cache.pages.contains_key(title) {
            reconciler.mark_dirty(title);
            continue;
        }
        if let Some(old_title) = reconciler.title_of(change.page_id) {
            reconciler.rename(&old_title, title);
            continue;
        }
        if is_game(title)? {
            reconciler.insert(title, change.page_id);
        } else {
            debug!(title = %title, "ignoring change outside the games category");
        }
    }

    Ok(reconciler.finish())
}

/// Moves the record under `from` to `to`, recording `from` as a former title.
///
/// Former titles already recorded under `to` are merged in. The moved record
/// is marked dirty.
pub fn move_record(cache: &mut WikiCache, from: &str, to: &str) -> bool {
    let Some(mut record) = cache.pages.remove(from) else {
        return false;
    };
    if let Some(existing) = cache.pages.remove(to) {
        for name in existing.renamed_from {
            if !record.renamed_from.contains(&name) {
                record.renamed_from.push(name);
            }
        }
    }
    if !record.renamed_from.iter().any(|name| name == from) {
        record.renamed_from.push(from.to_string());
    }
    record.renamed_from.retain(|name| name != to);
    record.dirty = true;
    cache.pages.insert(to.to_string(), record);
    true
}

struct Reconciler {
    cache: WikiCache,
    titles_by_id: BTreeMap<u64, String>,
    changes: Vec<CacheChange>,
}

impl Reconciler {
    fn new(cache: &WikiCache) -> Self {
        let titles_by_id = cache
            .pages
            .iter()
            .map(|(title, record)| (record.page_id, title.clone()))
            .collect();
        Self {
            cache: cache.clone(),
            titles_by_id,
            changes: Vec::new(),
        }
    }

    fn title_of(&self, page_id: u64) -> Option<String> {
        self.titles_by_id.get(&page_id).cloned()
    }

    fn insert(&mut self, title: &str, page_id: u64) {
        let record = WikiPageRecord {
            page_id,
            dirty: true,
            ..WikiPageRecord::default()
        };
        self.cache.pages.insert(title.to_string(), record);
        self.titles_by_id.insert(page_id, title.to_string());
        self.record(CacheChange::Inserted {
            title: title.to_string(),
            page_id,
        });
    }

    fn rename(&mut self, from: &str, to: &str) {
        let Some(page_id) = self.cache.pages.get(from).map(|record| record.page_id) else {
            return;
        };
        if move_record(&mut self.cache, from, to) {
            self.titles_by_id.insert(page_id, to.to_string());
            self.record(CacheChange::Renamed {
                from: from.to_string(),
                to: to.to_string(),
                page_id,
            });
        }
    }

    fn mark_dirty(&mut self, title: &str) {
        if let Some(record) = self.cache.pages.get_mut(title) {
            record.dirty = true;
            self.record(CacheChange::MarkedDirty {
                title: title.to_string(),
            });
        }
    }

    fn record(&mut self, change: CacheChange) {
        change.log();
        self.changes.push(change);
    }

    fn finish(self) -> Reconciliation {
        Reconciliation {
            cache: self.cache,
            changes: self.changes,
        }
    }
}
