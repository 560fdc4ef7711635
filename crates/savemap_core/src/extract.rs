use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constraint::{Constraint, Tag, resolve_constraint};
use crate::flatten::flatten;
use crate::markup::{
    MarkupNode, Template, parse_wikitext, render_wikitext, strip_annotations, templates,
};
use crate::path::{PathKind, TooBroadRules, normalize, registry_is_too_broad};

pub const INFOBOX_GAME: &str = "Infobox game";
pub const GAME_DATA_SAVES: &str = "Game data/saves";
pub const GAME_DATA_CONFIG: &str = "Game data/config";

/// Store identifiers read from a page's infobox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreIds {
    pub steam: Option<u32>,
    pub steam_side: BTreeSet<u32>,
    pub gog: Option<u64>,
    pub gog_side: BTreeSet<u64>,
    pub lutris: Option<String>,
}

/// Conditions and tags of one file or registry path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathEntry {
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<Tag>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub when: BTreeSet<Constraint>,
}

impl PathEntry {
    /// Adds `constraint` unless one with the same OS and store is present.
    /// An empty constraint is never stored.
    pub fn add_constraint(&mut self, constraint: Constraint) -> bool {
        if constraint.is_empty() || self.when.iter().any(|known| known.same_target(&constraint)) {
            return false;
        }
        self.when.insert(constraint)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageDiagnostics {
    pub unsupported_os: usize,
    pub unsupported_path: usize,
    pub too_broad: usize,
    pub irregular_path: usize,
    pub os_conflict: usize,
}

/// Persisted form of [`PageDiagnostics`]: one flag per non-zero counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PageFlags {
    #[serde(skip_serializing_if = "is_false")]
    pub unsupported_os: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub unsupported_path: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub too_broad: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub irregular_path: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub os_conflict: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<PageDiagnostics> for PageFlags {
    fn from(value: PageDiagnostics) -> Self {
        Self {
            unsupported_os: value.unsupported_os > 0,
            unsupported_path: value.unsupported_path > 0,
            too_broad: value.too_broad > 0,
            irregular_path: value.irregular_path > 0,
            os_conflict: value.os_conflict > 0,
        }
    }
}

impl PageFlags {
    pub fn any(&self) -> bool {
        !self.labels().is_empty()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        [
            (self.unsupported_os, "unsupportedOs"),
            (self.unsupported_path, "unsupportedPath"),
            (self.too_broad, "tooBroad"),
            (self.irregular_path, "irregularPath"),
            (self.os_conflict, "osConflict"),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .map(|(_, label)| label)
        .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathExtraction {
    pub files: BTreeMap<String, PathEntry>,
    pub registry: BTreeMap<String, PathEntry>,
    pub diagnostics: PageDiagnostics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtraction {
    pub ids: StoreIds,
    /// Rendered game data templates, kept for later re-extraction.
    pub raw_templates: Vec<String>,
    pub paths: PathExtraction,
}

/// Extracts store ids and save/config paths from a page's wikitext.
pub fn extract_page(title: &str, raw: &str, rules: &TooBroadRules) -> PageExtraction {
    let nodes = parse_wikitext(&strip_annotations(raw));
    let mut ids = None;
    let mut raw_templates = Vec::new();

    for template in templates(&nodes) {
        if template.is(INFOBOX_GAME) {
            if ids.is_none() {
                ids = Some(infobox_ids(template));
            }
        } else if path_tag(template).is_some() && has_path_cell(template) {
            raw_templates.push(render_wikitext(&[MarkupNode::Template(template.clone())]));
        }
    }

    let paths = extract_templates(title, &raw_templates, rules);
    PageExtraction {
        ids: ids.unwrap_or_default(),
        raw_templates,
        paths,
    }
}

/// Turns stored game data templates into file and registry entries.
pub fn extract_templates(
    title: &str,
    raw_templates: &[String],
    rules: &TooBroadRules,
) -> PathExtraction {
    let mut out = PathExtraction::default();

    for raw in raw_templates {
        let nodes = parse_wikitext(raw);
        for template in templates(&nodes) {
            let Some(tag) = path_tag(template) else {
                continue;
            };
            let positional = template.positional();
            let Some((label, cells)) = positional.split_first() else {
                continue;
            };
            let label = flatten(label).text;
            for cell in cells {
                extract_cell(title, &label, cell, tag, rules, &mut out);
            }
        }
    }

    out
}

fn extract_cell(
    title: &str,
    label: &str,
    cell: &[MarkupNode],
    tag: Tag,
    rules: &TooBroadRules,
    out: &mut PathExtraction,
) {
    let flattened = flatten(cell);
    if flattened.text.is_empty() {
        return;
    }
    if !flattened.regular {
        out.diagnostics.irregular_path += 1;
        debug!(title, path = %flattened.text, "skipping irregular path markup");
        return;
    }

    let (canonical, kind) = match normalize(&flattened.text) {
        Ok(normalized) => normalized,
        Err(error) => {
            out.diagnostics.unsupported_path += 1;
            debug!(title, path = %flattened.text, %error, "skipping unsupported path");
            return;
        }
    };

    let resolved = match resolve_constraint(label, &flattened.text) {
        Ok(resolved) => resolved,
        Err(error) => {
            out.diagnostics.unsupported_os += 1;
            debug!(title, path = %canonical, %error, "skipping path with unsupported OS");
            return;
        }
    };
    if let Some(conflict) = resolved.os_conflict {
        out.diagnostics.os_conflict += 1;
        warn!(
            title,
            path = %canonical,
            label_os = %conflict.label,
            path_os = %conflict.path,
            "system label and path disagree on OS"
        );
    }

    let too_broad = match kind {
        PathKind::FileSystem => rules.is_too_broad(&canonical),
        PathKind::Registry => registry_is_too_broad(&canonical),
    };
    if too_broad {
        out.diagnostics.too_broad += 1;
        debug!(title, path = %canonical, "skipping too broad path");
        return;
    }

    let (target, constraint) = match kind {
        PathKind::FileSystem => (&mut out.files, resolved.constraint),
        PathKind::Registry => (&mut out.registry, resolved.constraint.without_os()),
    };
    let entry = target.entry(canonical).or_default();
    entry.tags.insert(tag);
    entry.add_constraint(constraint);
}

fn path_tag(template: &Template) -> Option<Tag> {
    if template.is(GAME_DATA_SAVES) {
        Some(Tag::Save)
    } else if template.is(GAME_DATA_CONFIG) {
        Some(Tag::Config)
    } else {
        None
    }
}

fn has_path_cell(template: &Template) -> bool {
    template
        .positional()
        .get(1)
        .is_some_and(|cell| !flatten(cell).text.is_empty())
}

fn infobox_ids(template: &Template) -> StoreIds {
    let value = |key: &str| {
        template
            .named(key)
            .map(|nodes| flatten(nodes).text)
            .filter(|text| !text.is_empty())
    };

    StoreIds {
        steam: value("steam appid")
            .and_then(|text| text.parse::<u32>().ok())
            .filter(|id| *id > 0),
        steam_side: value("steam appid side")
            .map(|text| parse_id_list(&text))
            .unwrap_or_default(),
        gog: value("gogcom id").and_then(|text| text.parse::<u64>().ok()),
        gog_side: value("gogcom id side")
            .map(|text| parse_id_list(&text))
            .unwrap_or_default(),
        lutris: value("lutris"),
    }
}

fn parse_id_list<T>(text: &str) -> BTreeSet<T>
where
    T: std::str::FromStr + Ord,
{
    text.split(',')
        .filter_map(|item| item.trim().parse::<T>().ok())
        .collect()
}
