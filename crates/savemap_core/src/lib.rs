//! Save-path manifest extraction from PCGamingWiki markup and Steam product info.

pub mod config;
pub mod constraint;
pub mod error;
pub mod extract;
pub mod flatten;
pub mod manifest;
pub mod markup;
pub mod path;
pub mod pipeline;
pub mod reconcile;
pub mod resource;
pub mod runtime;
pub mod steam;
pub mod wiki;
