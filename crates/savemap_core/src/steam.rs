//! Steam product metadata: install folder, launch options and Steam Cloud rules.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ResolvedSettings;
use crate::constraint::Os;
use crate::path::placeholder;
use crate::resource::ResourceFile;
use crate::runtime::CancelFlag;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SteamCache {
    pub apps: BTreeMap<u32, SteamCacheEntry>,
}

impl ResourceFile for SteamCache {
    const FILE_NAME: &'static str = "steam-game-cache.yaml";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SteamCacheEntry {
    #[serde(skip_serializing_if = "is_false")]
    pub outdated: bool,
    #[serde(flatten)]
    pub info: ProductInfo,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProductInfo {
    /// Set when the Cloud rules carried keys this tool does not interpret.
    #[serde(skip_serializing_if = "is_false")]
    pub irregular: bool,
    #[serde(skip_serializing_if = "Cloud::is_empty")]
    pub cloud: Cloud,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub launch: Vec<LaunchRecord>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub name_localized: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cloud {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub saves: Vec<CloudSave>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<CloudOverride>,
}

impl Cloud {
    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.overrides.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudSave {
    pub path: String,
    pub pattern: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub recursive: bool,
    pub root: String,
}

/// Rewrites the saves of one root on one OS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_compare: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path_transforms: Vec<PathTransform>,
    #[serde(skip_serializing_if = "is_false")]
    pub recursive: bool,
    pub root: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_instead: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathTransform {
    pub find: String,
    pub replace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LaunchRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "LaunchConfig::is_empty")]
    pub config: LaunchConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub launch_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl LaunchRecord {
    pub fn is_empty(&self) -> bool {
        self.arguments.is_none()
            && self.config.is_empty()
            && self.description.is_none()
            && self.executable.is_none()
            && self.launch_type.is_none()
            && self.working_dir.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub betakey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osarch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oslist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ownsdlc: Option<String>,
}

impl LaunchConfig {
    pub fn is_empty(&self) -> bool {
        self.betakey.is_none()
            && self.osarch.is_none()
            && self.oslist.is_none()
            && self.ownsdlc.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductLookup {
    Found(ProductInfo),
    /// The store returned nothing for the id.
    Unknown,
}

pub trait StoreMetadataFetcher {
    fn fetch_product_info(&mut self, ids: &[u32]) -> Result<BTreeMap<u32, ProductLookup>>;
    fn request_count(&self) -> usize;
}

/// Runs an external helper that prints the product info JSON for the given app ids.
pub struct CommandProductInfoFetcher {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    request_delay_ms: u64,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl CommandProductInfoFetcher {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
        request_delay_ms: u64,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: working_dir.into(),
            request_delay_ms,
            last_request_at: None,
            request_count: 0,
        }
    }

    pub fn from_settings(settings: &ResolvedSettings, working_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            settings.steam_command.clone(),
            settings.steam_args.clone(),
            working_dir,
            settings.request_delay_ms,
        )
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.request_delay_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }
}

impl StoreMetadataFetcher for CommandProductInfoFetcher {
    fn fetch_product_info(&mut self, ids: &[u32]) -> Result<BTreeMap<u32, ProductLookup>> {
        self.apply_rate_limit();
        let output = Command::new(&self.command)
            .args(&self.args)
            .args(ids.iter().map(u32::to_string))
            .current_dir(&self.working_dir)
            .output()
            .with_context(|| format!("failed to run product info command `{}`", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "product info command exited with {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_product_info(&stdout, ids)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Decodes the helper's JSON output into one lookup per requested id.
pub fn parse_product_info(json: &str, ids: &[u32]) -> Result<BTreeMap<u32, ProductLookup>> {
    let mut response: raw::Response =
        serde_json::from_str(json).context("failed to decode product info JSON")?;

    let mut out = BTreeMap::new();
    for id in ids {
        let lookup = match response.apps.remove(&id.to_string()) {
            Some(app) => ProductLookup::Found(product_from_app(*id, app)),
            None => {
                warn!(app_id = id, "no product info returned");
                ProductLookup::Unknown
            }
        };
        out.insert(*id, lookup);
    }
    Ok(out)
}

fn product_from_app(app_id: u32, app: raw::App) -> ProductInfo {
    let mut irregular = false;

    let saves = app
        .ufs
        .save_files
        .into_iter()
        .map(|save| {
            if !save.unknown.is_empty() {
                irregular = true;
                warn!(app_id, keys = ?save.unknown.keys().collect::<Vec<_>>(), "unknown Steam Cloud save keys");
            }
            CloudSave {
                path: save.path,
                pattern: save.pattern,
                platforms: save.platforms,
                recursive: save.recursive,
                root: save.root,
            }
        })
        .collect();

    let overrides = app
        .ufs
        .root_overrides
        .into_iter()
        .map(|item| {
            if !item.unknown.is_empty() {
                irregular = true;
                warn!(app_id, keys = ?item.unknown.keys().collect::<Vec<_>>(), "unknown Steam Cloud override keys");
            }
            CloudOverride {
                add_path: item.add_path,
                os: item.os,
                os_compare: item.os_compare,
                path_transforms: item
                    .path_transforms
                    .into_iter()
                    .map(|transform| PathTransform {
                        find: transform.find,
                        replace: transform.replace,
                    })
                    .collect(),
                recursive: item.recursive,
                root: item.root,
                use_instead: item.use_instead,
            }
        })
        .collect();

    let launch = app
        .config
        .launch
        .into_iter()
        .map(|item| LaunchRecord {
            arguments: item.arguments,
            config: LaunchConfig {
                betakey: item.config.betakey,
                osarch: item.config.osarch,
                oslist: item.config.oslist,
                ownsdlc: item.config.ownsdlc,
            },
            description: item.description,
            executable: item.executable,
            launch_type: item.launch_type,
            working_dir: item.workingdir,
        })
        .filter(|record| !record.is_empty())
        .collect();

    ProductInfo {
        irregular,
        cloud: Cloud { saves, overrides },
        install_dir: app.config.installdir,
        launch,
        name_localized: app.common.name_localized,
    }
}

impl SteamCache {
    /// Flags ids for the next store pass, adding entries for unseen ids.
    pub fn mark_outdated<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = u32>,
    {
        let mut marked = 0;
        for id in ids {
            let entry = self.apps.entry(id).or_default();
            if !entry.outdated {
                entry.outdated = true;
                marked += 1;
            }
        }
        marked
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreRefreshOptions {
    pub outdated_only: bool,
    /// Explicit ids, fetched whether or not they are cached.
    pub ids: Option<Vec<u32>>,
    pub limit: Option<usize>,
    pub batch_size: usize,
    pub checkpoint_interval: usize,
    pub cancel: Option<CancelFlag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreRefreshReport {
    pub fetched: usize,
    pub unknown: usize,
    pub checkpoints: usize,
    pub cancelled: bool,
}

pub fn refresh_store_cache<F, C>(
    cache: &mut SteamCache,
    fetcher: &mut F,
    options: &StoreRefreshOptions,
    mut checkpoint: C,
) -> Result<StoreRefreshReport>
where
    F: StoreMetadataFetcher + ?Sized,
    C: FnMut(&SteamCache) -> Result<()>,
{
    let ids: Vec<u32> = match &options.ids {
        Some(ids) => ids.clone(),
        None => cache
            .apps
            .iter()
            .filter(|(_, entry)| !options.outdated_only || entry.outdated)
            .map(|(id, _)| *id)
            .collect(),
    };
    let ids: Vec<u32> = ids
        .into_iter()
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();

    info!(apps = ids.len(), "refreshing Steam product info");
    let mut report = StoreRefreshReport::default();
    for batch in ids.chunks(options.batch_size.max(1)) {
        if options.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            warn!(processed = report.fetched, "Steam refresh cancelled");
            report.cancelled = true;
            break;
        }
        debug!(first = ?batch.first(), last = ?batch.last(), "fetching product info batch");
        let mut results = fetcher.fetch_product_info(batch)?;

        for id in batch {
            let entry = match results.remove(id) {
                Some(ProductLookup::Found(info)) => SteamCacheEntry {
                    outdated: false,
                    info,
                },
                Some(ProductLookup::Unknown) | None => {
                    report.unknown += 1;
                    SteamCacheEntry::default()
                }
            };
            cache.apps.insert(*id, entry);
            report.fetched += 1;

            if options.checkpoint_interval > 0
                && report.fetched % options.checkpoint_interval == 0
            {
                checkpoint(cache)?;
                report.checkpoints += 1;
                info!(processed = report.fetched, last = id, "Steam cache checkpoint");
            }
        }
    }

    Ok(report)
}

/// Maps a Steam Cloud root name to a manifest placeholder path.
pub fn parse_root(value: &str) -> Option<&'static str> {
    match value.to_lowercase().as_str() {
        "gameinstall" => Some(placeholder::BASE),
        "linuxhome" => Some(placeholder::HOME),
        "linuxxdgdatahome" => Some(placeholder::XDG_DATA),
        "linuxxdgconfighome" => Some(placeholder::XDG_CONFIG),
        "macappsupport" => Some("<home>/Library/Application Support"),
        "macdocuments" => Some("<home>/Documents"),
        "machome" => Some(placeholder::HOME),
        "winappdataroaming" => Some(placeholder::WIN_APP_DATA),
        "winappdatalocal" => Some(placeholder::WIN_LOCAL_APP_DATA),
        "winappdatalocallow" => Some("<home>/AppData/LocalLow"),
        "winmydocuments" => Some(placeholder::WIN_DOCUMENTS),
        "winsavedgames" => Some("<home>/Saved Games"),
        _ => {
            warn!(root = value, "unknown Steam Cloud root");
            None
        }
    }
}

pub fn parse_platform(value: &str) -> Option<Os> {
    match value.to_lowercase().as_str() {
        "linux" => Some(Os::Linux),
        "macos" => Some(Os::Mac),
        "windows" => Some(Os::Windows),
        "all" => None,
        _ => {
            warn!(platform = value, "unknown Steam Cloud platform");
            None
        }
    }
}

/// Only equality comparisons are understood; a missing operator means equality.
pub fn parse_os_comparison(os: Option<&str>, comparison: Option<&str>) -> Option<Os> {
    let comparison = comparison.unwrap_or("=");
    let os = os.map(str::to_lowercase).unwrap_or_default();

    match (comparison, os.as_str()) {
        ("=", "windows") => Some(Os::Windows),
        ("=", "linux") => Some(Os::Linux),
        ("=", "macos") => Some(Os::Mac),
        ("=", "") => None,
        ("=", other) => {
            warn!(os = other, "unknown Steam Cloud OS");
            None
        }
        (operator, _) => {
            warn!(operator, "unknown Steam Cloud OS operator");
            None
        }
    }
}

/// Shape of the helper's JSON output.
///
/// Steam encodes lists as objects keyed by "0", "1", ... and booleans as "1".
mod raw {
    use std::collections::BTreeMap;

    use serde::de::{DeserializeOwned, Error as _};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use tracing::warn;

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Response {
        pub apps: BTreeMap<String, App>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct App {
        pub common: Common,
        pub config: Config,
        pub ufs: Ufs,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Common {
        pub name_localized: BTreeMap<String, String>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Config {
        pub installdir: Option<String>,
        #[serde(deserialize_with = "numbered")]
        pub launch: Vec<Launch>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Launch {
        pub executable: Option<String>,
        pub arguments: Option<String>,
        pub workingdir: Option<String>,
        #[serde(rename = "type")]
        pub launch_type: Option<String>,
        pub description: Option<String>,
        pub config: LaunchConfig,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct LaunchConfig {
        pub betakey: Option<String>,
        pub osarch: Option<String>,
        pub oslist: Option<String>,
        pub ownsdlc: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Ufs {
        #[serde(rename = "savefiles", deserialize_with = "numbered")]
        pub save_files: Vec<SaveFile>,
        #[serde(rename = "rootoverrides", deserialize_with = "numbered")]
        pub root_overrides: Vec<RootOverride>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct SaveFile {
        pub path: String,
        pub pattern: String,
        #[serde(deserialize_with = "numbered")]
        pub platforms: Vec<String>,
        #[serde(deserialize_with = "flag")]
        pub recursive: bool,
        pub root: String,
        #[serde(flatten)]
        pub unknown: BTreeMap<String, Value>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct RootOverride {
        #[serde(rename = "addpath")]
        pub add_path: Option<String>,
        pub os: Option<String>,
        #[serde(rename = "oscompare")]
        pub os_compare: Option<String>,
        #[serde(rename = "pathtransforms", deserialize_with = "numbered")]
        pub path_transforms: Vec<Transform>,
        #[serde(deserialize_with = "numbered")]
        pub platforms: Vec<String>,
        #[serde(deserialize_with = "flag")]
        pub recursive: bool,
        pub root: String,
        #[serde(rename = "useinstead")]
        pub use_instead: Option<String>,
        #[serde(flatten)]
        pub unknown: BTreeMap<String, Value>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(default)]
    pub struct Transform {
        pub find: String,
        pub replace: String,
    }

    fn numbered<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let mut items = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let Ok(index) = key.parse::<u32>() else {
                warn!(key = %key, "ignoring non-numeric product info key");
                continue;
            };
            let item = serde_json::from_value::<T>(value).map_err(D::Error::custom)?;
            items.push((index, item));
        }
        items.sort_by_key(|(index, _)| *index);
        Ok(items.into_iter().map(|(_, item)| item).collect())
    }

    fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(text) => text == "1",
            Value::Bool(value) => value,
            Value::Number(number) => number.as_u64() == Some(1),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        ProductInfo, ProductLookup, SteamCache, SteamCacheEntry, StoreMetadataFetcher,
        StoreRefreshOptions, parse_os_comparison, parse_platform, parse_product_info, parse_root,
        refresh_store_cache,
    };
    use crate::constraint::Os;
    use crate::runtime::CancelFlag;

    const SAMPLE: &str = r#"{
      "apps": {
        "220": {
          "common": {"name_localized": {"german": "Halbwertszeit 2"}},
          "config": {
            "installdir": "Half-Life 2",
            "launch": {
              "1": {"executable": "hl2.sh", "config": {"oslist": "linux"}},
              "0": {"executable": "hl2.exe", "arguments": "-game hl2", "config": {"oslist": "windows", "osarch": "64"}},
              "2": {}
            }
          },
          "ufs": {
            "savefiles": {
              "0": {"path": "hl2/save", "pattern": "*.sav", "root": "gameinstall", "recursive": "1", "platforms": {"0": "Windows"}},
              "note": {"path": "ignored"}
            },
            "rootoverrides": {
              "0": {
                "root": "gameinstall", "os": "MacOS", "oscompare": "=", "useinstead": "MacAppSupport",
                "addpath": "HL2", "pathtransforms": {"0": {"find": "hl2/", "replace": ""}}
              }
            }
          }
        }
      }
    }"#;

    #[test]
    fn parses_launch_and_cloud_rules() {
        let result = parse_product_info(SAMPLE, &[220, 999]).expect("parse");
        let Some(ProductLookup::Found(info)) = result.get(&220) else {
            panic!("expected product info");
        };
        assert_eq!(result.get(&999), Some(&ProductLookup::Unknown));

        assert_eq!(info.install_dir.as_deref(), Some("Half-Life 2"));
        assert_eq!(info.launch.len(), 2);
        assert_eq!(info.launch[0].executable.as_deref(), Some("hl2.exe"));
        assert_eq!(info.launch[0].config.osarch.as_deref(), Some("64"));
        assert_eq!(info.launch[1].config.oslist.as_deref(), Some("linux"));

        assert_eq!(info.cloud.saves.len(), 1);
        let save = &info.cloud.saves[0];
        assert!(save.recursive);
        assert_eq!(save.platforms, vec!["Windows".to_string()]);

        let cloud_override = &info.cloud.overrides[0];
        assert_eq!(cloud_override.use_instead.as_deref(), Some("MacAppSupport"));
        assert_eq!(cloud_override.path_transforms[0].find, "hl2/");
        assert!(!info.irregular);
        assert_eq!(info.name_localized["german"], "Halbwertszeit 2");
    }

    #[test]
    fn unknown_cloud_keys_mark_the_product_irregular() {
        let json = r#"{"apps":{"1":{"ufs":{"savefiles":{"0":{"path":"x","root":"gameinstall","pattern":"*","excluded":"y"}}}}}}"#;
        let result = parse_product_info(json, &[1]).expect("parse");
        let Some(ProductLookup::Found(info)) = result.get(&1) else {
            panic!("expected product info");
        };
        assert!(info.irregular);
    }

    #[test]
    fn malformed_output_is_an_error() {
        let error = parse_product_info("not json", &[1]).expect_err("must fail");
        assert!(error.to_string().contains("failed to decode product info JSON"));
    }

    #[derive(Default)]
    struct MockStore {
        products: BTreeMap<u32, ProductInfo>,
        batches: Vec<Vec<u32>>,
        request_count: usize,
    }

    impl StoreMetadataFetcher for MockStore {
        fn fetch_product_info(
            &mut self,
            ids: &[u32],
        ) -> anyhow::Result<BTreeMap<u32, ProductLookup>> {
            self.request_count += 1;
            self.batches.push(ids.to_vec());
            Ok(ids
                .iter()
                .map(|id| {
                    let lookup = match self.products.get(id) {
                        Some(info) => ProductLookup::Found(info.clone()),
                        None => ProductLookup::Unknown,
                    };
                    (*id, lookup)
                })
                .collect())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    #[test]
    fn refresh_fetches_outdated_ids_in_batches() {
        let mut store = MockStore::default();
        for id in [1, 2, 3, 4] {
            store.products.insert(
                id,
                ProductInfo {
                    install_dir: Some(format!("Game {id}")),
                    ..ProductInfo::default()
                },
            );
        }
        let mut cache = SteamCache::default();
        cache.mark_outdated([1, 2, 3, 4, 5]);
        cache.apps.insert(6, SteamCacheEntry::default());

        let options = StoreRefreshOptions {
            outdated_only: true,
            batch_size: 2,
            checkpoint_interval: 4,
            ..StoreRefreshOptions::default()
        };
        let mut checkpoints = 0;
        let report = refresh_store_cache(&mut cache, &mut store, &options, |_| {
            checkpoints += 1;
            Ok(())
        })
        .expect("refresh");

        assert_eq!(store.batches, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(store.request_count(), 3);
        assert_eq!(report.fetched, 5);
        assert_eq!(report.unknown, 1);
        assert_eq!(checkpoints, 1);
        assert!(cache.apps.values().all(|entry| !entry.outdated));
        assert_eq!(cache.apps[&3].info.install_dir.as_deref(), Some("Game 3"));
        assert_eq!(cache.apps[&5], SteamCacheEntry::default());
    }

    #[test]
    fn cancelled_refresh_leaves_products_outdated() {
        let mut store = MockStore::default();
        let mut cache = SteamCache::default();
        cache.mark_outdated([1, 2]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let options = StoreRefreshOptions {
            outdated_only: true,
            batch_size: 1,
            cancel: Some(cancel),
            ..StoreRefreshOptions::default()
        };

        let report =
            refresh_store_cache(&mut cache, &mut store, &options, |_| Ok(())).expect("refresh");
        assert!(report.cancelled);
        assert_eq!(report.fetched, 0);
        assert_eq!(store.request_count(), 0);
        assert!(cache.apps.values().all(|entry| entry.outdated));
    }

    #[test]
    fn mark_outdated_counts_new_flags_only() {
        let mut cache = SteamCache::default();
        assert_eq!(cache.mark_outdated([7, 8]), 2);
        assert_eq!(cache.mark_outdated([8, 9]), 1);
        assert_eq!(cache.apps.len(), 3);
    }

    #[test]
    fn cache_entry_serializes_flat() {
        let mut cache = SteamCache::default();
        cache.apps.insert(
            10,
            SteamCacheEntry {
                outdated: true,
                info: ProductInfo {
                    install_dir: Some("Counter-Strike".to_string()),
                    ..ProductInfo::default()
                },
            },
        );
        let yaml = serde_yaml::to_string(&cache).expect("serialize");
        assert!(yaml.contains("10:"));
        assert!(yaml.contains("installDir: Counter-Strike"));
        assert!(yaml.contains("outdated: true"));
        let back: SteamCache = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, cache);
    }

    #[test]
    fn root_platform_and_os_names() {
        assert_eq!(parse_root("GameInstall"), Some("<base>"));
        assert_eq!(parse_root("WinAppDataLocalLow"), Some("<home>/AppData/LocalLow"));
        assert_eq!(parse_root("SteamCloudDocuments"), None);
        assert_eq!(parse_platform("MacOS"), Some(Os::Mac));
        assert_eq!(parse_platform("All"), None);
        assert_eq!(parse_os_comparison(Some("Linux"), None), Some(Os::Linux));
        assert_eq!(parse_os_comparison(Some("Windows"), Some("<>")), None);
        assert_eq!(parse_os_comparison(None, None), None);
    }
}
