//! Page-local extraction errors.
//!
//! These never abort a run: the extractor counts them per page and moves on
//! to the next path cell. Everything else in the crate reports through
//! `anyhow`.

/// A "system" label on a game data template that maps to no known OS or store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported OS label: {label:?}")]
pub struct UnsupportedOsError {
    pub label: String,
}

impl UnsupportedOsError {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

/// A raw path that cannot be turned into a canonical manifest path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedPathError {
    /// The path argument exists on the wiki but has no portable mapping.
    #[error("path argument `{0}` has no portable mapping")]
    Ignored(String),

    /// Substituting the argument did not settle within the iteration bound.
    #[error("substitution of path argument `{0}` did not terminate")]
    SubstitutionLimit(String),

    /// A `{{p|...}}` argument remained after substitution.
    #[error("unknown path argument in {0:?}")]
    UnknownArgument(String),

    /// The path is relative to an unknown working directory.
    #[error("relative paths are not supported")]
    Relative,

    /// The registry path contains control or format characters.
    #[error("registry path contains unprintable characters")]
    Unprintable,
}
