//! Built-in enrichment stages
//!
//! Stages that need a collaborator service hold it behind its capability
//! trait from [`crate::services`]; the metadata stage is purely local.

use crate::error::{Error, Result};
use crate::types::mime_essence;
use regex::{Regex, RegexBuilder};

mod html;
mod images;
mod language;
mod metadata;
mod tagging;

pub use html::HtmlCleaningStage;
pub use images::ImageStage;
pub use language::LanguageStage;
pub use metadata::MetadataStage;
pub use tagging::TaggingStage;

/// Whether `mime_type` is markup the local extractors understand
pub(crate) fn is_html(mime_type: &str) -> bool {
    matches!(
        mime_essence(mime_type).as_deref(),
        Some("text/html" | "application/xhtml+xml")
    )
}

/// Case-insensitive pattern compiled once per stage
pub(crate) fn pattern(source: &str) -> Result<Regex> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Other(format!("invalid extraction pattern {source}: {e}")))
}

/// Decode the handful of entities that show up in attribute values and titles
pub(crate) fn decode_entities(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
