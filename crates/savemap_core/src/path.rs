use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::constraint::{Constraint, Os, Store};
use crate::error::UnsupportedPathError;

pub mod placeholder {
    pub const ROOT: &str = "<root>";
    pub const GAME: &str = "<game>";
    pub const BASE: &str = "<base>";
    pub const HOME: &str = "<home>";
    pub const STORE_USER_ID: &str = "<storeUserId>";
    pub const OS_USER_NAME: &str = "<osUserName>";
    pub const WIN_APP_DATA: &str = "<winAppData>";
    pub const WIN_LOCAL_APP_DATA: &str = "<winLocalAppData>";
    pub const WIN_DOCUMENTS: &str = "<winDocuments>";
    pub const WIN_PUBLIC: &str = "<winPublic>";
    pub const WIN_PROGRAM_DATA: &str = "<winProgramData>";
    pub const WIN_DIR: &str = "<winDir>";
    pub const XDG_DATA: &str = "<xdgData>";
    pub const XDG_CONFIG: &str = "<xdgConfig>";

    pub const ALL: &[&str] = &[
        ROOT,
        GAME,
        BASE,
        HOME,
        STORE_USER_ID,
        OS_USER_NAME,
        WIN_APP_DATA,
        WIN_LOCAL_APP_DATA,
        WIN_DOCUMENTS,
        WIN_PUBLIC,
        WIN_PROGRAM_DATA,
        WIN_DIR,
        XDG_DATA,
        XDG_CONFIG,
    ];
}

/// Upper bound on substitution rounds per path argument.
pub const MAX_SUBSTITUTION_ROUNDS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    FileSystem,
    Registry,
}

/// One `{{p|token}}` argument understood by the wiki's path template.
#[derive(Debug, Clone, Copy)]
pub struct PathArgument {
    pub token: &'static str,
    pub placeholder: &'static str,
    pub when: Constraint,
    pub registry: bool,
    pub ignored: bool,
}

const fn general(token: &'static str, placeholder: &'static str, when: Constraint) -> PathArgument {
    PathArgument {
        token,
        placeholder,
        when,
        registry: false,
        ignored: false,
    }
}

const fn windows(token: &'static str, placeholder: &'static str) -> PathArgument {
    general(token, placeholder, Constraint::os(Os::Windows))
}

const fn hive(token: &'static str, placeholder: &'static str) -> PathArgument {
    PathArgument {
        registry: true,
        ..windows(token, placeholder)
    }
}

/// Arguments of the wiki's `Template:Path`, in resolution order.
pub const PATH_ARGUMENTS: &[PathArgument] = &[
    general("game", placeholder::BASE, Constraint::NONE),
    general("uid", placeholder::STORE_USER_ID, Constraint::NONE),
    general("steam", placeholder::ROOT, Constraint::store(Store::Steam)),
    general("uplay", placeholder::ROOT, Constraint::store(Store::Uplay)),
    general("ubisoftconnect", placeholder::ROOT, Constraint::store(Store::Uplay)),
    hive("hkcu", "HKEY_CURRENT_USER"),
    hive("hkey_current_user", "HKEY_CURRENT_USER"),
    hive("hklm", "HKEY_LOCAL_MACHINE"),
    hive("hkey_local_machine", "HKEY_LOCAL_MACHINE"),
    // WOW64 redirection depends on the bitness of the reading process.
    PathArgument {
        ignored: true,
        ..hive("wow64", "WOW6432Node")
    },
    windows("username", placeholder::OS_USER_NAME),
    windows("userprofile", placeholder::HOME),
    windows("userprofile\\documents", placeholder::WIN_DOCUMENTS),
    windows("userprofile\\appdata\\locallow", "<home>/AppData/LocalLow"),
    windows("appdata", placeholder::WIN_APP_DATA),
    windows("localappdata", placeholder::WIN_LOCAL_APP_DATA),
    windows("public", placeholder::WIN_PUBLIC),
    windows("allusersprofile", placeholder::WIN_PROGRAM_DATA),
    windows("programdata", placeholder::WIN_PROGRAM_DATA),
    windows("programfiles", "C:/Program Files"),
    windows("windir", placeholder::WIN_DIR),
    windows("syswow64", "<winDir>/SysWOW64"),
    general("osxhome", placeholder::HOME, Constraint::os(Os::Mac)),
    general("linuxhome", placeholder::HOME, Constraint::os(Os::Linux)),
    general("xdgdatahome", placeholder::XDG_DATA, Constraint::os(Os::Linux)),
    general("xdgconfighome", placeholder::XDG_CONFIG, Constraint::os(Os::Linux)),
];

/// A `{{p|...}}` or `{{path|...}}` occurrence with no nested braces.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArgumentSpan {
    start: usize,
    end: usize,
    token: String,
}

fn next_argument(text: &str, from: usize) -> Option<ArgumentSpan> {
    let mut cursor = from;
    while let Some(offset) = text.get(cursor..)?.find("{{") {
        let start = cursor + offset;
        let inner = &text[start + 2..];
        cursor = start + 2;

        let Some(close) = inner.find("}}") else {
            return None;
        };
        let Some(pipe) = inner[..close].find('|') else {
            continue;
        };
        let name = inner[..pipe].trim().to_ascii_lowercase();
        if name != "p" && name != "path" {
            continue;
        }
        let argument = &inner[pipe + 1..close];
        if argument.contains("{{") {
            continue;
        }
        return Some(ArgumentSpan {
            start,
            end: start + 2 + close + 2,
            token: argument.trim().to_lowercase(),
        });
    }
    None
}

fn find_argument(text: &str, token: &str) -> Option<ArgumentSpan> {
    let mut cursor = 0;
    while let Some(span) = next_argument(text, cursor) {
        if span.token == token {
            return Some(span);
        }
        cursor = span.start + 2;
    }
    None
}

/// Lowercased tokens of every path argument in `text`, in order of appearance.
pub fn argument_tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(span) = next_argument(text, cursor) {
        cursor = span.start + 2;
        out.push(span.token);
    }
    out
}

pub fn has_argument(text: &str, token: &str) -> bool {
    find_argument(text, token).is_some()
}

fn substitute(text: &mut String, argument: &PathArgument) -> Result<(), UnsupportedPathError> {
    for _ in 0..MAX_SUBSTITUTION_ROUNDS {
        if !substitute_round(text, argument) {
            return Ok(());
        }
    }
    if has_argument(text, argument.token) {
        return Err(UnsupportedPathError::SubstitutionLimit(
            argument.token.to_string(),
        ));
    }
    Ok(())
}

/// Replaces every current occurrence of the argument once.
fn substitute_round(text: &mut String, argument: &PathArgument) -> bool {
    let mut replaced = false;
    let mut cursor = 0;
    while let Some(span) = next_argument(text, cursor) {
        if span.token == argument.token {
            text.replace_range(span.start..span.end, argument.placeholder);
            cursor = span.start + argument.placeholder.len();
            replaced = true;
        } else {
            cursor = span.start + 2;
        }
    }
    replaced
}

/// Turns a flattened wiki path into a canonical manifest path.
pub fn normalize(raw: &str) -> Result<(String, PathKind), UnsupportedPathError> {
    let kind = if PATH_ARGUMENTS
        .iter()
        .any(|argument| argument.registry && has_argument(raw, argument.token))
    {
        PathKind::Registry
    } else {
        PathKind::FileSystem
    };

    let mut text = raw.to_string();
    for argument in PATH_ARGUMENTS {
        if argument.ignored {
            if has_argument(&text, argument.token) {
                return Err(UnsupportedPathError::Ignored(argument.token.to_string()));
            }
            continue;
        }
        substitute(&mut text, argument)?;
    }
    if text.contains("{{") {
        return Err(UnsupportedPathError::UnknownArgument(raw.trim().to_string()));
    }

    match kind {
        PathKind::FileSystem => {
            let canonical = clean_file_path(&text);
            if is_relative(&canonical) {
                return Err(UnsupportedPathError::Relative);
            }
            Ok((canonical, kind))
        }
        PathKind::Registry => {
            let canonical = clean_registry_path(&text);
            if UNPRINTABLE.is_match(&canonical) {
                return Err(UnsupportedPathError::Unprintable);
            }
            Ok((canonical, kind))
        }
    }
}

fn is_relative(path: &str) -> bool {
    path == "." || path == ".." || path.starts_with("./") || path.starts_with("../")
}

static CONSECUTIVE_SLASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/{2,}").expect("valid regex"));
static DOUBLE_STAR_AFTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^/*])\*{2,}").expect("valid regex"));
static DOUBLE_STAR_BEFORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*{2,}([^/*])").expect("valid regex"));
static ENDING_WILDCARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(/\*)+$").expect("valid regex"));
static ENDING_DOT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/\.$").expect("valid regex"));
static INTERMEDIATE_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/\./").expect("valid regex"));
static UNPRINTABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Cc}|\p{Cf}").expect("valid regex"));

// `%userprofile%/Documents` must fold before the bare `%userprofile%`.
static ENVIRONMENT_FOLDS: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    [
        (r"(?i)%appdata%", placeholder::WIN_APP_DATA.to_string()),
        (
            r"(?i)%userprofile%/AppData/Roaming",
            placeholder::WIN_APP_DATA.to_string(),
        ),
        (r"(?i)%localappdata%", placeholder::WIN_LOCAL_APP_DATA.to_string()),
        (
            r"(?i)%userprofile%/AppData/Local/",
            format!("{}/", placeholder::WIN_LOCAL_APP_DATA),
        ),
        (
            r"(?i)%userprofile%/Documents",
            placeholder::WIN_DOCUMENTS.to_string(),
        ),
        (r"(?i)%userprofile%", placeholder::HOME.to_string()),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).expect("valid regex"), replacement))
    .collect()
});

fn clean_structure(raw: &str) -> String {
    let mut path = raw
        .trim()
        .trim_end_matches(['/', '\\'])
        .replace('\\', "/");

    for (pattern, replacement) in [
        (&CONSECUTIVE_SLASHES, "/"),
        (&DOUBLE_STAR_AFTER, "${1}*"),
        (&DOUBLE_STAR_BEFORE, "*${1}"),
        (&ENDING_WILDCARD, ""),
        (&ENDING_DOT, ""),
        (&INTERMEDIATE_DOT, "/"),
    ] {
        path = pattern.replace_all(&path, replacement).into_owned();
    }
    path
}

/// Structural cleanup for filesystem paths that already carry placeholders.
pub fn clean_file_path(raw: &str) -> String {
    let mut path = clean_structure(raw);

    if path == "~" || path.starts_with("~/") {
        path = path.replacen('~', placeholder::HOME, 1);
    }
    for (pattern, replacement) in ENVIRONMENT_FOLDS.iter() {
        path = pattern
            .replace_all(&path, replacement.as_str())
            .into_owned();
    }
    for token in ["{64BitSteamID}", "{Steam3AccountID}"] {
        path = path.replace(token, placeholder::STORE_USER_ID);
    }

    clean_structure(&path)
}

pub fn clean_registry_path(raw: &str) -> String {
    clean_structure(raw)
}

/// Revision of the built-in too-broad list. Bump when the list changes.
pub const TOO_BROAD_REVISION: u32 = 3;

const TOO_BROAD_EXACT: &[&str] = &[
    // `<storeUserId>` is treated as `*` by consumers.
    "<base>/<storeUserId>",
    "<home>/Documents",
    "<home>/Saved Games",
    "<home>/AppData",
    "<home>/AppData/Local",
    "<home>/AppData/Local/Packages",
    "<home>/AppData/LocalLow",
    "<home>/AppData/Roaming",
    "<home>/Documents/My Games",
    "<home>/Library/Application Support",
    "<home>/Library/Preferences",
    "<home>/Telltale Games",
    "<root>/config",
    "<winDir>/win.ini",
    "<winDir>/SysWOW64",
    "<winDocuments>/My Games",
    "<winDocuments>/Telltale Games",
    "<xdgConfig>/unity3d",
    "<xdgData>/unity3d",
    "C:/Program Files",
    "C:/Program Files (x86)",
];

// Folders shared by several games or episodes.
const TOO_BROAD_PREFIXES: &[&str] = &[
    "<home>/*/",
    "<home>/**/",
    "<winDocuments>/Telltale Games/*/",
    "<xdgConfig>/unity3d/*",
    "<xdgData>/unity3d/*",
];

/// Canonical paths that exist whether or not a given game is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TooBroadRules {
    exact: BTreeSet<String>,
    prefixes: Vec<String>,
}

impl Default for TooBroadRules {
    fn default() -> Self {
        Self::built_in()
    }
}

impl TooBroadRules {
    pub fn built_in() -> Self {
        Self {
            exact: TOO_BROAD_EXACT.iter().map(|item| item.to_string()).collect(),
            prefixes: TOO_BROAD_PREFIXES
                .iter()
                .map(|item| item.to_string())
                .collect(),
        }
    }

    pub fn with_extra<I, J>(mut self, exact: I, prefixes: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        self.exact.extend(exact);
        for prefix in prefixes {
            if !self.prefixes.contains(&prefix) {
                self.prefixes.push(prefix);
            }
        }
        self
    }

    pub fn is_too_broad(&self, path: &str) -> bool {
        if placeholder::ALL.contains(&path) || self.exact.contains(path) {
            return true;
        }
        if self
            .prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return true;
        }
        is_bare_drive(path) || path == "/" || path.starts_with('*')
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

fn is_bare_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

static BUILT_IN_RULES: LazyLock<TooBroadRules> = LazyLock::new(TooBroadRules::built_in);

pub fn path_is_too_broad(canonical: &str) -> bool {
    BUILT_IN_RULES.is_too_broad(canonical)
}

/// Registry keys above the level where a single game's data lives.
pub fn registry_is_too_broad(canonical: &str) -> bool {
    let path = canonical.to_lowercase();
    let hives = ["hkey_current_user", "hkey_local_machine"];
    if !hives.iter().any(|hive| path.starts_with(hive)) {
        return true;
    }
    hives.iter().any(|hive| {
        path == *hive
            || path == format!("{hive}/software")
            || path == format!("{hive}/software/wow6432node")
    })
}
