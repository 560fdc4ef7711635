//! Final manifest assembly from wiki records, Steam metadata and manual overrides.
//!
//! Precedence, highest first: override, Steam, wiki.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::constraint::{Bit, Constraint, Os, Store};
use crate::extract::{PathEntry, extract_templates};
use crate::path::{TooBroadRules, clean_file_path, placeholder};
use crate::resource::ResourceFile;
use crate::steam::{self, CloudSave, SteamCache, SteamCacheEntry};
use crate::wiki::{PrimaryIds, WikiCache, WikiPageRecord};

const WIKI_PAGE_URL: &str = "https://www.pcgamingwiki.com/wiki/?curid=";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub games: BTreeMap<String, Game>,
}

impl ResourceFile for Manifest {
    const FILE_NAME: &'static str = "manifest.yaml";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Game {
    /// Set on entries that only redirect a former title to the current one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, PathEntry>,
    #[serde(skip_serializing_if = "GogMetadata::is_empty")]
    pub gog: GogMetadata,
    #[serde(skip_serializing_if = "IdMetadata::is_empty")]
    pub id: IdMetadata,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub install_dir: BTreeSet<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub launch: BTreeMap<String, Vec<LaunchVariant>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub registry: BTreeMap<String, PathEntry>,
    #[serde(skip_serializing_if = "SteamMetadata::is_empty")]
    pub steam: SteamMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LaunchVariant {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub when: BTreeSet<Constraint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteamMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl SteamMetadata {
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GogMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl GogMetadata {
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flatpak: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub gog_extra: BTreeSet<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lutris: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub steam_extra: BTreeSet<u32>,
}

impl IdMetadata {
    pub fn is_empty(&self) -> bool {
        self.flatpak.is_none()
            && self.gog_extra.is_empty()
            && self.lutris.is_none()
            && self.steam_extra.is_empty()
    }
}

/// Hand-maintained corrections, keyed by wiki title. Never written by the tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestOverride {
    pub games: BTreeMap<String, OverrideGame>,
}

impl ResourceFile for ManifestOverride {
    const FILE_NAME: &'static str = "manifest-override.yaml";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OverrideGame {
    pub omit: bool,
    pub omit_registry: bool,
    pub use_steam_cloud: bool,
    #[serde(flatten)]
    pub game: Game,
}

impl Default for OverrideGame {
    fn default() -> Self {
        Self {
            omit: false,
            omit_registry: false,
            use_steam_cloud: true,
            game: Game::default(),
        }
    }
}

impl ManifestOverride {
    pub fn is_omitted(&self, title: &str) -> bool {
        self.games.get(title).is_some_and(|game| game.omit)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    pub games: usize,
    pub aliases: usize,
    pub omitted: usize,
    pub dropped: usize,
}

/// Rebuilds manifest entries from the caches.
///
/// With `only`, just those titles (and aliases pointing at them) are
/// rebuilt and every other entry is kept as is.
pub fn refresh_manifest(
    manifest: &mut Manifest,
    wiki: &WikiCache,
    steam: &SteamCache,
    overrides: &ManifestOverride,
    rules: &TooBroadRules,
    only: Option<&[String]>,
) -> AssemblyReport {
    match only {
        Some(titles) => manifest.games.retain(|key, game| {
            let target = game.alias.as_deref().unwrap_or(key.as_str());
            !titles.iter().any(|title| title == target)
        }),
        None => manifest.games.clear(),
    }

    let primary_ids = wiki.primary_ids();
    let mut report = AssemblyReport::default();

    for (title, record) in &wiki.pages {
        if only.is_some_and(|titles| !titles.contains(title)) {
            continue;
        }
        if overrides.is_omitted(title) {
            debug!(title = %title, "omitted by override");
            report.omitted += 1;
            continue;
        }

        let mut game = Game::default();
        game.integrate_wiki(title, record, &primary_ids, rules);

        for former in &record.renamed_from {
            if former.to_lowercase() == title.to_lowercase() || manifest.games.contains_key(former)
            {
                continue;
            }
            manifest.games.insert(
                former.clone(),
                Game {
                    alias: Some(title.clone()),
                    ..Game::default()
                },
            );
            report.aliases += 1;
        }

        let overridden = overrides.games.get(title);
        if let Some(entry) = game.steam.id.and_then(|id| steam.apps.get(&id)) {
            let use_steam_cloud = overridden.is_none_or(|game| game.use_steam_cloud);
            game.integrate_steam(entry, use_steam_cloud, rules);
        }
        if let Some(overridden) = overridden {
            game.integrate_override(overridden);
        }

        if !game.is_usable() {
            report.dropped += 1;
            continue;
        }
        manifest.games.insert(title.clone(), game);
        report.games += 1;
    }

    info!(
        games = report.games,
        aliases = report.aliases,
        omitted = report.omitted,
        dropped = report.dropped,
        "manifest assembled"
    );
    report
}

impl Game {
    pub fn integrate_wiki(
        &mut self,
        title: &str,
        record: &WikiPageRecord,
        primary_ids: &PrimaryIds,
        rules: &TooBroadRules,
    ) {
        let ids = record.store_ids();
        self.steam.id = ids.steam;
        self.gog.id = ids.gog;
        self.id = IdMetadata {
            flatpak: None,
            gog_extra: ids
                .gog_side
                .into_iter()
                .filter(|id| !primary_ids.gog.contains(id))
                .collect(),
            lutris: ids.lutris,
            steam_extra: ids
                .steam_side
                .into_iter()
                .filter(|id| !primary_ids.steam.contains(id))
                .collect(),
        };

        let paths = extract_templates(title, &record.raw_templates, rules);
        self.files = paths.files;
        self.registry = paths.registry;
    }

    pub fn integrate_steam(
        &mut self,
        entry: &SteamCacheEntry,
        use_cloud: bool,
        rules: &TooBroadRules,
    ) {
        let info = &entry.info;
        if let Some(install_dir) = &info.install_dir {
            self.install_dir.insert(install_dir.clone());
        }

        for incoming in &info.launch {
            if incoming.executable.as_deref().is_none_or(|exe| exe.contains("://"))
                || !matches!(incoming.launch_type.as_deref(), None | Some("default" | "none"))
                || incoming.config.betakey.is_some()
                || incoming.config.ownsdlc.is_some()
            {
                continue;
            }
            let Some(executable) = incoming.executable.as_deref().and_then(normalize_launch_path)
            else {
                continue;
            };
            let constraint = Constraint {
                os: incoming.config.oslist.as_deref().and_then(launch_os),
                store: Some(Store::Steam),
                bit: incoming.config.osarch.as_deref().and_then(Bit::parse),
            };
            let working_dir = incoming.working_dir.as_deref().and_then(normalize_launch_path);
            self.add_launch(executable, incoming.arguments.clone(), working_dir, constraint);
        }

        if use_cloud && self.files.is_empty() && self.registry.is_empty() {
            for save in &info.cloud.saves {
                self.integrate_cloud_save(save, &info.cloud.overrides, rules);
            }
        }
    }

    fn add_launch(
        &mut self,
        executable: String,
        arguments: Option<String>,
        working_dir: Option<String>,
        constraint: Constraint,
    ) {
        let variants = self.launch.entry(executable).or_default();
        match variants
            .iter_mut()
            .find(|variant| variant.arguments == arguments && variant.working_dir == working_dir)
        {
            Some(variant) => {
                variant.when.insert(constraint);
            }
            None => variants.push(LaunchVariant {
                arguments,
                when: BTreeSet::from([constraint]),
                working_dir,
            }),
        }
    }

    fn integrate_cloud_save(
        &mut self,
        save: &CloudSave,
        overrides: &[steam::CloudOverride],
        rules: &TooBroadRules,
    ) {
        let Some(root) = steam::parse_root(&save.root) else {
            return;
        };
        let os = save
            .platforms
            .first()
            .and_then(|platform| steam::parse_platform(platform));
        let path = save.path.trim_matches(['/', '\\']);
        let pattern = save.pattern.trim_matches(['/', '\\']);

        self.add_file_constraint(
            &cloud_path(root, None, path, pattern, save.recursive),
            Constraint {
                os,
                store: Some(Store::Steam),
                bit: None,
            },
            rules,
        );

        for alternative in overrides.iter().filter(|item| item.root == save.root) {
            let alt_root = alternative.use_instead.as_deref().unwrap_or(&alternative.root);
            let Some(alt_root) = steam::parse_root(alt_root) else {
                continue;
            };
            let mut alt_path = cloud_path(
                alt_root,
                alternative.add_path.as_deref(),
                path,
                pattern,
                save.recursive,
            );
            for transform in &alternative.path_transforms {
                if !transform.find.is_empty() {
                    alt_path = alt_path.replace(&transform.find, &transform.replace);
                }
            }
            let alt_os = steam::parse_os_comparison(
                alternative.os.as_deref(),
                alternative.os_compare.as_deref(),
            );
            self.add_file_constraint(
                &alt_path,
                Constraint {
                    os: alt_os.or(os),
                    store: Some(Store::Steam),
                    bit: None,
                },
                rules,
            );
        }
    }

    fn add_file_constraint(&mut self, raw: &str, constraint: Constraint, rules: &TooBroadRules) {
        let path = clean_file_path(raw);
        if rules.is_too_broad(&path) || path.contains(':') {
            debug!(path = %path, "skipping unusable Steam Cloud path");
            return;
        }
        self.files.entry(path).or_default().add_constraint(constraint);
    }

    pub fn integrate_override(&mut self, overridden: &OverrideGame) {
        if let Some(id) = overridden.game.steam.id {
            self.steam.id = Some(id);
        }
        if let Some(id) = overridden.game.gog.id {
            self.gog.id = Some(id);
        }
        if let Some(flatpak) = &overridden.game.id.flatpak {
            self.id.flatpak = Some(flatpak.clone());
        }
        self.install_dir
            .extend(overridden.game.install_dir.iter().cloned());
        if overridden.omit_registry {
            self.registry.clear();
        }
    }

    /// False when the entry has nothing a consumer could act on.
    pub fn is_usable(&self) -> bool {
        !(self.files.is_empty()
            && self.registry.is_empty()
            && self.steam.is_empty()
            && self.gog.is_empty()
            && self.id.is_empty())
    }

    fn references_install_folder(&self) -> bool {
        self.files
            .keys()
            .any(|path| path.contains(placeholder::BASE) || path.contains(placeholder::GAME))
    }
}

fn cloud_path(root: &str, add: Option<&str>, path: &str, pattern: &str, recursive: bool) -> String {
    let folder = match add {
        Some(add) => format!("{root}/{add}/{path}"),
        None => format!("{root}/{path}"),
    };
    if pattern == "*" {
        folder
    } else if recursive {
        format!("{folder}/**/{pattern}")
    } else {
        format!("{folder}/{pattern}")
    }
}

fn launch_os(value: &str) -> Option<Os> {
    match value.trim().to_lowercase().as_str() {
        "windows" => Some(Os::Windows),
        "macos" | "macosx" => Some(Os::Mac),
        "linux" => Some(Os::Linux),
        _ => None,
    }
}

/// Anchors a Steam launch path under `<base>`. URIs pass through unchanged.
pub fn normalize_launch_path(raw: &str) -> Option<String> {
    if raw.contains("://") {
        return Some(raw.to_string());
    }

    let standardized = raw.replace('\\', "/").replace("//", "/");
    let standardized = standardized
        .trim_end_matches('/')
        .trim_start_matches("./")
        .trim_start_matches('/');

    if standardized.is_empty() || standardized == "." {
        None
    } else {
        Some(format!("{}/{}", placeholder::BASE, standardized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingGame {
    pub title: String,
    pub page_id: u64,
}

/// Cached games with no files or registry in the manifest, skipping omitted ones.
pub fn missing_games(
    wiki: &WikiCache,
    manifest: &Manifest,
    overrides: &ManifestOverride,
) -> Vec<MissingGame> {
    let mut missing: Vec<MissingGame> = wiki
        .pages
        .iter()
        .filter(|(title, _)| {
            manifest
                .games
                .get(*title)
                .is_none_or(|game| game.files.is_empty() && game.registry.is_empty())
        })
        .filter(|(title, _)| !overrides.is_omitted(title))
        .map(|(title, record)| MissingGame {
            title: title.clone(),
            page_id: record.page_id,
        })
        .collect();
    missing.sort_by(|a, b| {
        a.title
            .to_lowercase()
            .cmp(&b.title.to_lowercase())
            .then_with(|| a.title.cmp(&b.title))
    });
    missing
}

pub fn render_missing(missing: &[MissingGame]) -> String {
    if missing.is_empty() {
        return "N/A\n".to_string();
    }
    let mut out = String::new();
    for game in missing {
        out.push_str(&format!(
            "* [{}]({WIKI_PAGE_URL}{})\n",
            game.title, game.page_id
        ));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedPage {
    pub title: String,
    pub page_id: u64,
    pub flags: Vec<&'static str>,
}

/// Pages whose last extraction raised any diagnostic flag.
pub fn malformed_pages(wiki: &WikiCache) -> Vec<MalformedPage> {
    wiki.pages
        .iter()
        .filter(|(_, record)| record.flags.any())
        .map(|(title, record)| MalformedPage {
            title: title.clone(),
            page_id: record.page_id,
            flags: record.flags.labels(),
        })
        .collect()
}

pub fn render_malformed(pages: &[MalformedPage]) -> String {
    if pages.is_empty() {
        return "N/A\n".to_string();
    }
    let mut out = String::new();
    for page in pages {
        out.push_str(&format!(
            "* [{}]({WIKI_PAGE_URL}{}) - {}\n",
            page.title,
            page.page_id,
            page.flags.join(", ")
        ));
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestStats {
    pub games: usize,
    pub with_files_or_registry: usize,
    pub without_files_or_registry: usize,
    pub cached_pages: usize,
}

pub fn manifest_stats(manifest: &Manifest, wiki: &WikiCache) -> ManifestStats {
    let with_paths = manifest
        .games
        .values()
        .filter(|game| !game.files.is_empty() || !game.registry.is_empty())
        .count();
    ManifestStats {
        games: manifest.games.len(),
        with_files_or_registry: with_paths,
        without_files_or_registry: manifest.games.len() - with_paths,
        cached_pages: wiki.pages.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateEntry {
    pub title: String,
    pub page_id: u64,
}

/// Groups of titles whose manifest entries are identical.
///
/// Entries anchored to the install folder are skipped since sharing such
/// paths between games is harmless.
pub fn find_duplicates(manifest: &Manifest, wiki: &WikiCache) -> Result<Vec<Vec<DuplicateEntry>>> {
    let mut groups: HashMap<[u8; 32], Vec<DuplicateEntry>> = HashMap::new();
    let mut order = Vec::new();

    for (title, game) in &manifest.games {
        if game.alias.is_some() || game.references_install_folder() {
            continue;
        }
        let serialized = serde_json::to_vec(game)
            .with_context(|| format!("failed to serialize manifest entry {title}"))?;
        let digest: [u8; 32] = Sha256::digest(&serialized).into();
        let group = groups.entry(digest).or_insert_with(|| {
            order.push(digest);
            Vec::new()
        });
        group.push(DuplicateEntry {
            title: title.clone(),
            page_id: wiki.pages.get(title).map_or(0, |record| record.page_id),
        });
    }

    Ok(order
        .into_iter()
        .filter_map(|digest| groups.remove(&digest))
        .filter(|group| group.len() > 1)
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{
        Game, LaunchVariant, Manifest, ManifestOverride, OverrideGame, find_duplicates,
        malformed_pages, manifest_stats, missing_games, normalize_launch_path, refresh_manifest,
        render_malformed, render_missing,
    };
    use crate::constraint::{Bit, Constraint, Os, Store, Tag};
    use crate::extract::PageFlags;
    use crate::path::TooBroadRules;
    use crate::steam::{
        Cloud, CloudOverride, CloudSave, LaunchConfig, LaunchRecord, PathTransform, ProductInfo,
        SteamCache, SteamCacheEntry,
    };
    use crate::wiki::{WikiCache, WikiPageRecord};

    fn rules() -> TooBroadRules {
        TooBroadRules::built_in()
    }

    fn record(page_id: u64, templates: &[&str]) -> WikiPageRecord {
        WikiPageRecord {
            page_id,
            raw_templates: templates.iter().map(|item| item.to_string()).collect(),
            ..WikiPageRecord::default()
        }
    }

    fn launch(exe: &str, oslist: &str, osarch: Option<&str>) -> LaunchRecord {
        LaunchRecord {
            executable: Some(exe.to_string()),
            config: LaunchConfig {
                oslist: Some(oslist.to_string()),
                osarch: osarch.map(str::to_string),
                ..LaunchConfig::default()
            },
            ..LaunchRecord::default()
        }
    }

    fn steam_with(id: u32, info: ProductInfo) -> SteamCache {
        let mut cache = SteamCache::default();
        cache.apps.insert(
            id,
            SteamCacheEntry {
                outdated: false,
                info,
            },
        );
        cache
    }

    fn assemble(wiki: &WikiCache, steam: &SteamCache, overrides: &ManifestOverride) -> Manifest {
        let mut manifest = Manifest::default();
        refresh_manifest(&mut manifest, wiki, steam, overrides, &rules(), None);
        manifest
    }

    #[test]
    fn wiki_paths_flow_into_the_manifest() {
        let mut wiki = WikiCache::default();
        wiki.pages.insert(
            "Example".to_string(),
            record(1, &["{{Game data/saves|Windows|{{p|game}}\\saves}}"]),
        );
        let manifest = assemble(&wiki, &SteamCache::default(), &ManifestOverride::default());
        let entry = &manifest.games["Example"].files["<base>/saves"];
        assert_eq!(entry.tags, BTreeSet::from([Tag::Save]));
        assert_eq!(entry.when, BTreeSet::from([Constraint::os(Os::Windows)]));
    }

    #[test]
    fn launch_records_merge_across_os_and_architecture() {
        let mut wiki = WikiCache::default();
        let mut page = record(1, &[]);
        page.steam = Some(10);
        wiki.pages.insert("Example".to_string(), page);

        let steam = steam_with(
            10,
            ProductInfo {
                launch: vec![
                    launch("game.exe", "linux", None),
                    launch(".\\game.exe", "windows", Some("64")),
                    LaunchRecord {
                        arguments: Some("-safe".to_string()),
                        ..launch("game.exe", "windows", None)
                    },
                    LaunchRecord {
                        launch_type: Some("option1".to_string()),
                        ..launch("tool.exe", "windows", None)
                    },
                    launch("steam://run/10", "windows", None),
                ],
                install_dir: Some("Example Game".to_string()),
                ..ProductInfo::default()
            },
        );

        let manifest = assemble(&wiki, &steam, &ManifestOverride::default());
        let game = &manifest.games["Example"];
        assert_eq!(game.install_dir, BTreeSet::from(["Example Game".to_string()]));
        assert_eq!(game.launch.len(), 1);
        let variants = &game.launch["<base>/game.exe"];
        assert_eq!(
            variants,
            &vec![
                LaunchVariant {
                    arguments: None,
                    when: BTreeSet::from([
                        Constraint {
                            os: Some(Os::Linux),
                            store: Some(Store::Steam),
                            bit: None,
                        },
                        Constraint {
                            os: Some(Os::Windows),
                            store: Some(Store::Steam),
                            bit: Some(Bit::X64),
                        },
                    ]),
                    working_dir: None,
                },
                LaunchVariant {
                    arguments: Some("-safe".to_string()),
                    when: BTreeSet::from([Constraint {
                        os: Some(Os::Windows),
                        store: Some(Store::Steam),
                        bit: None,
                    }]),
                    working_dir: None,
                },
            ]
        );
    }

    #[test]
    fn steam_cloud_fills_in_when_the_wiki_has_nothing() {
        let mut wiki = WikiCache::default();
        let mut page = record(1, &[]);
        page.steam = Some(20);
        wiki.pages.insert("Cloudy".to_string(), page);

        let steam = steam_with(
            20,
            ProductInfo {
                cloud: Cloud {
                    saves: vec![
                        CloudSave {
                            path: "saves/".to_string(),
                            pattern: "*.sav".to_string(),
                            platforms: vec!["Windows".to_string()],
                            recursive: true,
                            root: "WinAppDataLocal".to_string(),
                        },
                        CloudSave {
                            path: String::new(),
                            pattern: "*".to_string(),
                            platforms: Vec::new(),
                            recursive: false,
                            root: "WinMyDocuments".to_string(),
                        },
                    ],
                    overrides: vec![CloudOverride {
                        root: "WinAppDataLocal".to_string(),
                        os: Some("MacOS".to_string()),
                        use_instead: Some("MacAppSupport".to_string()),
                        add_path: Some("Cloudy".to_string()),
                        path_transforms: vec![PathTransform {
                            find: "saves/".to_string(),
                            replace: "Saves/".to_string(),
                        }],
                        ..CloudOverride::default()
                    }],
                },
                ..ProductInfo::default()
            },
        );

        let manifest = assemble(&wiki, &steam, &ManifestOverride::default());
        let files = &manifest.games["Cloudy"].files;
        let keys: Vec<&String> = files.keys().collect();
        assert_eq!(
            keys,
            vec![
                "<home>/Library/Application Support/Cloudy/Saves/**/*.sav",
                "<winLocalAppData>/saves/**/*.sav",
            ]
        );
        assert_eq!(
            files["<winLocalAppData>/saves/**/*.sav"].when,
            BTreeSet::from([Constraint {
                os: Some(Os::Windows),
                store: Some(Store::Steam),
                bit: None,
            }])
        );
        assert_eq!(
            files["<home>/Library/Application Support/Cloudy/Saves/**/*.sav"].when,
            BTreeSet::from([Constraint {
                os: Some(Os::Mac),
                store: Some(Store::Steam),
                bit: None,
            }])
        );

        let mut overrides = ManifestOverride::default();
        overrides.games.insert(
            "Cloudy".to_string(),
            OverrideGame {
                use_steam_cloud: false,
                ..OverrideGame::default()
            },
        );
        let without_cloud = assemble(&wiki, &steam, &overrides);
        assert!(without_cloud.games["Cloudy"].files.is_empty());
        assert_eq!(without_cloud.games["Cloudy"].steam.id, Some(20));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut wiki = WikiCache::default();
        let mut page = record(
            1,
            &["{{Game data/config|Windows|{{p|hkcu}}\\Software\\Foo}}"],
        );
        page.steam = Some(30);
        wiki.pages.insert("Fixed".to_string(), page);
        wiki.pages.insert(
            "Hidden".to_string(),
            record(2, &["{{Game data/saves|Windows|{{p|game}}/saves}}"]),
        );

        let overrides: ManifestOverride = serde_yaml::from_str(
            "Fixed:\n  omitRegistry: true\n  steam:\n    id: 31\n  installDir: [Fixed Game]\n  id:\n    flatpak: org.example.Fixed\nHidden:\n  omit: true\n",
        )
        .expect("parse overrides");
        assert!(overrides.games["Fixed"].use_steam_cloud);

        let manifest = assemble(&wiki, &SteamCache::default(), &overrides);
        assert!(!manifest.games.contains_key("Hidden"));
        let fixed = &manifest.games["Fixed"];
        assert!(fixed.registry.is_empty());
        assert_eq!(fixed.steam.id, Some(31));
        assert_eq!(fixed.id.flatpak.as_deref(), Some("org.example.Fixed"));
        assert!(fixed.install_dir.contains("Fixed Game"));
    }

    #[test]
    fn aliases_side_ids_and_unusable_entries() {
        let mut wiki = WikiCache::default();
        let mut current = record(1, &["{{Game data/saves|Windows|{{p|game}}/saves}}"]);
        current.renamed_from = vec!["Old Name".to_string(), "current".to_string()];
        current.steam_side = BTreeSet::from([100, 200]);
        wiki.pages.insert("Current".to_string(), current);
        let mut other = record(2, &[]);
        other.steam = Some(200);
        wiki.pages.insert("Other".to_string(), other);
        wiki.pages.insert("Empty".to_string(), record(3, &[]));

        let manifest = assemble(&wiki, &SteamCache::default(), &ManifestOverride::default());
        assert_eq!(
            manifest.games["Old Name"].alias.as_deref(),
            Some("Current")
        );
        assert!(!manifest.games.contains_key("current"));
        assert_eq!(manifest.games["Current"].id.steam_extra, BTreeSet::from([100]));
        assert!(manifest.games.contains_key("Other"));
        assert!(!manifest.games.contains_key("Empty"));
    }

    #[test]
    fn too_broad_paths_never_reach_the_manifest() {
        let mut wiki = WikiCache::default();
        wiki.pages.insert(
            "Broad".to_string(),
            record(
                1,
                &["{{Game data/saves|Windows|{{p|userprofile}}\\Documents|{{p|game}}/x}}"],
            ),
        );
        let manifest = assemble(&wiki, &SteamCache::default(), &ManifestOverride::default());
        let files = &manifest.games["Broad"].files;
        assert!(!files.contains_key("<home>/Documents"));
        assert!(files.contains_key("<base>/x"));
    }

    #[test]
    fn solo_refresh_keeps_other_entries() {
        let mut wiki = WikiCache::default();
        wiki.pages.insert(
            "A".to_string(),
            record(1, &["{{Game data/saves|Windows|{{p|game}}/a}}"]),
        );
        let mut manifest = Manifest::default();
        manifest.games.insert(
            "B".to_string(),
            Game {
                alias: Some("Elsewhere".to_string()),
                ..Game::default()
            },
        );

        refresh_manifest(
            &mut manifest,
            &wiki,
            &SteamCache::default(),
            &ManifestOverride::default(),
            &rules(),
            Some(&["A".to_string()]),
        );
        assert!(manifest.games.contains_key("A"));
        assert!(manifest.games.contains_key("B"));
    }

    #[test]
    fn launch_paths_are_anchored_to_the_install_folder() {
        assert_eq!(normalize_launch_path("bin\\game.exe").as_deref(), Some("<base>/bin/game.exe"));
        assert_eq!(normalize_launch_path("./game").as_deref(), Some("<base>/game"));
        assert_eq!(normalize_launch_path("/game/").as_deref(), Some("<base>/game"));
        assert_eq!(normalize_launch_path("."), None);
        assert_eq!(normalize_launch_path(""), None);
        assert_eq!(
            normalize_launch_path("steam://run/1").as_deref(),
            Some("steam://run/1")
        );
    }

    #[test]
    fn reports_list_missing_and_malformed_pages() {
        let mut wiki = WikiCache::default();
        wiki.pages.insert(
            "beta".to_string(),
            record(2, &["{{Game data/saves|Windows|{{p|game}}/b}}"]),
        );
        wiki.pages.insert("Alpha".to_string(), record(1, &[]));
        let mut flagged = record(3, &[]);
        flagged.flags = PageFlags {
            too_broad: true,
            os_conflict: true,
            ..PageFlags::default()
        };
        wiki.pages.insert("Gamma".to_string(), flagged);
        let mut overrides = ManifestOverride::default();
        overrides.games.insert(
            "Gamma".to_string(),
            OverrideGame {
                omit: true,
                ..OverrideGame::default()
            },
        );

        let manifest = assemble(&wiki, &SteamCache::default(), &overrides);
        let missing = missing_games(&wiki, &manifest, &overrides);
        assert_eq!(
            render_missing(&missing),
            "* [Alpha](https://www.pcgamingwiki.com/wiki/?curid=1)\n"
        );
        assert_eq!(render_missing(&[]), "N/A\n");

        let malformed = malformed_pages(&wiki);
        assert_eq!(
            render_malformed(&malformed),
            "* [Gamma](https://www.pcgamingwiki.com/wiki/?curid=3) - tooBroad, osConflict\n"
        );

        let stats = manifest_stats(&manifest, &wiki);
        assert_eq!(stats.games, 1);
        assert_eq!(stats.with_files_or_registry, 1);
        assert_eq!(stats.cached_pages, 3);
    }

    #[test]
    fn duplicates_ignore_install_folder_paths() {
        let mut wiki = WikiCache::default();
        for (title, page_id) in [("One", 1), ("Two", 2), ("Three", 3), ("Four", 4)] {
            let path = if page_id <= 2 {
                "{{Game data/saves|Windows|{{p|appdata}}/Shared}}"
            } else {
                "{{Game data/saves|Windows|{{p|game}}/saves}}"
            };
            wiki.pages.insert(title.to_string(), record(page_id, &[path]));
        }
        let manifest = assemble(&wiki, &SteamCache::default(), &ManifestOverride::default());

        let groups = find_duplicates(&manifest, &wiki).expect("duplicates");
        assert_eq!(groups.len(), 1);
        let titles: Vec<&str> = groups[0].iter().map(|entry| entry.title.as_str()).collect();
        assert_eq!(titles, vec!["One", "Two"]);
        assert_eq!(groups[0][1].page_id, 2);
    }
}
