use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::UnsupportedOsError;
use crate::path::{PATH_ARGUMENTS, argument_tokens};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Os {
    Dos,
    Windows,
    Mac,
    Linux,
}

impl Os {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dos => "dos",
            Self::Windows => "windows",
            Self::Mac => "mac",
            Self::Linux => "linux",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Store {
    Epic,
    Gog,
    Microsoft,
    Origin,
    Steam,
    Uplay,
}

impl Store {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Gog => "gog",
            Self::Microsoft => "microsoft",
            Self::Origin => "origin",
            Self::Steam => "steam",
            Self::Uplay => "uplay",
        }
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process architecture, serialized as the bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Bit {
    X32,
    X64,
}

impl Bit {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "32" => Some(Self::X32),
            "64" => Some(Self::X64),
            _ => None,
        }
    }
}

impl From<Bit> for u8 {
    fn from(value: Bit) -> Self {
        match value {
            Bit::X32 => 32,
            Bit::X64 => 64,
        }
    }
}

impl TryFrom<u8> for Bit {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            32 => Ok(Self::X32),
            64 => Ok(Self::X64),
            other => Err(format!("unsupported bitness: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tag {
    Config,
    Save,
}

/// Applicability condition for a path or launch entry.
///
/// A list of constraints on one entry is a disjunction. An entry with no
/// constraints applies unconditionally.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(default, rename_all = "camelCase")]
pub struct Constraint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<Os>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<Store>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit: Option<Bit>,
}

impl Constraint {
    pub const NONE: Self = Self {
        os: None,
        store: None,
        bit: None,
    };

    pub const fn os(os: Os) -> Self {
        Self {
            os: Some(os),
            store: None,
            bit: None,
        }
    }

    pub const fn store(store: Store) -> Self {
        Self {
            os: None,
            store: Some(store),
            bit: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.os.is_none() && self.store.is_none() && self.bit.is_none()
    }

    /// Two constraints target the same environment when OS and store agree.
    pub fn same_target(&self, other: &Self) -> bool {
        self.os == other.os && self.store == other.store
    }

    pub fn without_os(self) -> Self {
        Self { os: None, ..self }
    }
}

/// Label substrings checked before falling back to a literal OS name.
const LABEL_RULES: &[(&str, Constraint)] = &[
    ("steam", Constraint::store(Store::Steam)),
    (
        "microsoft store",
        Constraint {
            os: Some(Os::Windows),
            store: Some(Store::Microsoft),
            bit: None,
        },
    ),
    ("gog.com", Constraint::store(Store::Gog)),
    ("epic games", Constraint::store(Store::Epic)),
    ("uplay", Constraint::store(Store::Uplay)),
    ("origin", Constraint::store(Store::Origin)),
];

/// Resolves the "system" label of a game data template.
///
/// A store placeholder embedded in the raw path replaces whatever store the
/// label implied.
pub fn constraint_from_system_label(
    label: &str,
    raw_path: &str,
) -> Result<Constraint, UnsupportedOsError> {
    let normalized = label.trim().to_lowercase();
    let mut constraint = match LABEL_RULES
        .iter()
        .find(|(needle, _)| normalized.contains(needle))
    {
        Some((_, constraint)) => *constraint,
        None => Constraint::os(
            parse_os_label(&normalized).ok_or_else(|| UnsupportedOsError::new(label.trim()))?,
        ),
    };

    if let Some(store) = store_from_path(raw_path) {
        constraint.store = Some(store);
    }
    Ok(constraint)
}

fn parse_os_label(label: &str) -> Option<Os> {
    match label {
        "windows" => Some(Os::Windows),
        "os x" => Some(Os::Mac),
        "linux" => Some(Os::Linux),
        "dos" => Some(Os::Dos),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsConflict {
    pub label: Os,
    pub path: Os,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConstraint {
    pub constraint: Constraint,
    pub os_conflict: Option<OsConflict>,
}

/// Label resolution plus the OS implied by the path's placeholders.
///
/// The path OS only fills a gap. When label and path disagree the label's
/// OS is kept and the disagreement is returned for review.
pub fn resolve_constraint(
    label: &str,
    raw_path: &str,
) -> Result<ResolvedConstraint, UnsupportedOsError> {
    let mut constraint = constraint_from_system_label(label, raw_path)?;
    let mut os_conflict = None;

    match (constraint.os, os_from_path(raw_path)) {
        (None, Some(path_os)) => constraint.os = Some(path_os),
        (Some(label_os), Some(path_os)) if label_os != path_os => {
            os_conflict = Some(OsConflict {
                label: label_os,
                path: path_os,
            });
        }
        _ => {}
    }

    Ok(ResolvedConstraint {
        constraint,
        os_conflict,
    })
}

/// First store carried by a path argument present in `raw_path`, in table order.
pub fn store_from_path(raw_path: &str) -> Option<Store> {
    let tokens = argument_tokens(raw_path);
    PATH_ARGUMENTS
        .iter()
        .filter(|argument| tokens.iter().any(|token| token == argument.token))
        .find_map(|argument| argument.when.store)
}

/// First OS carried by a path argument present in `raw_path`, in table order.
pub fn os_from_path(raw_path: &str) -> Option<Os> {
    let tokens = argument_tokens(raw_path);
    PATH_ARGUMENTS
        .iter()
        .filter(|argument| tokens.iter().any(|token| token == argument.token))
        .find_map(|argument| argument.when.os)
}

#[cfg(test)]
mod tests {
    use super::{
        Bit, Constraint, Os, OsConflict, Store, constraint_from_system_label, os_from_path,
        resolve_constraint, store_from_path,
    };

    #[test]
    fn literal_os_labels_map_to_os_constraints() {
        let windows = constraint_from_system_label("Windows", "{{p|game}}").expect("windows");
        assert_eq!(windows, Constraint::os(Os::Windows));
        let mac = constraint_from_system_label(" OS X ", "~/Library").expect("mac");
        assert_eq!(mac, Constraint::os(Os::Mac));
        let dos = constraint_from_system_label("DOS", "{{p|game}}").expect("dos");
        assert_eq!(dos, Constraint::os(Os::Dos));
    }

    #[test]
    fn store_labels_match_by_substring() {
        let steam = constraint_from_system_label("Steam Play (Linux)", "x").expect("steam");
        assert_eq!(steam, Constraint::store(Store::Steam));
        let microsoft = constraint_from_system_label("Microsoft Store", "x").expect("ms");
        assert_eq!(microsoft.os, Some(Os::Windows));
        assert_eq!(microsoft.store, Some(Store::Microsoft));
        let gog = constraint_from_system_label("GOG.com", "x").expect("gog");
        assert_eq!(gog, Constraint::store(Store::Gog));
        let epic = constraint_from_system_label("Epic Games Store", "x").expect("epic");
        assert_eq!(epic, Constraint::store(Store::Epic));
    }

    #[test]
    fn unknown_label_is_an_unsupported_os() {
        let err = constraint_from_system_label("PlayStation 4", "x").expect_err("must fail");
        assert_eq!(err.label, "PlayStation 4");
    }

    #[test]
    fn path_store_overrides_label_store() {
        let constraint =
            constraint_from_system_label("Steam", "{{p|uplay}}\\savegames").expect("resolve");
        assert_eq!(constraint.store, Some(Store::Uplay));
    }

    #[test]
    fn path_os_fills_missing_label_os() {
        let resolved = resolve_constraint("Steam", "{{p|appdata}}\\Foo").expect("resolve");
        assert_eq!(resolved.constraint.os, Some(Os::Windows));
        assert_eq!(resolved.constraint.store, Some(Store::Steam));
        assert_eq!(resolved.os_conflict, None);
    }

    #[test]
    fn conflicting_path_os_keeps_label_os_and_reports() {
        let resolved = resolve_constraint("OS X", "{{p|appdata}}\\Foo").expect("resolve");
        assert_eq!(resolved.constraint.os, Some(Os::Mac));
        assert_eq!(
            resolved.os_conflict,
            Some(OsConflict {
                label: Os::Mac,
                path: Os::Windows,
            })
        );
    }

    #[test]
    fn path_scans_follow_table_order() {
        assert_eq!(
            store_from_path("{{p|steam}}/{{p|uplay}}"),
            Some(Store::Steam)
        );
        assert_eq!(os_from_path("{{P| LinuxHome }}/.foo"), Some(Os::Linux));
        assert_eq!(os_from_path("{{p|game}}/saves"), None);
    }

    #[test]
    fn bit_serializes_as_number() {
        let constraint = Constraint {
            os: Some(Os::Linux),
            store: Some(Store::Steam),
            bit: Some(Bit::X64),
        };
        let json = serde_json::to_string(&constraint).expect("serialize");
        assert_eq!(json, r#"{"os":"linux","store":"steam","bit":64}"#);
        let back: Constraint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, constraint);
        assert_eq!(Bit::parse("32"), Some(Bit::X32));
        assert_eq!(Bit::parse("128"), None);
    }
}
