//! Source loading and media decomposition capabilities.
//!
//! Loaders turn a location (path, URL) into [`SourceUnit`]s; decomposers
//! turn a unit whose modality has no embedding provider into units of
//! lower modalities (see [`Modality::fallback`](crate::models::Modality::fallback)).

use async_trait::async_trait;

use crate::error::Result;
use crate::models::SourceUnit;

#[async_trait]
pub trait SourceLoader: Send + Sync {
    fn name(&self) -> &str;

    /// Expand `location` into the locations to fetch one by one: a
    /// directory into its matching files, a sitemap into its pages.
    async fn discover(&self, location: &str) -> Result<Vec<String>> {
        Ok(vec![location.to_string()])
    }

    /// Fetch the units behind one location. A page may yield the units of
    /// the assets it links to after its own.
    async fn fetch(&self, location: &str) -> Result<Vec<SourceUnit>>;
}

#[async_trait]
pub trait MediaDecomposer: Send + Sync {
    /// Split `unit` into units of `unit.modality.fallback()` modalities.
    /// Derived units carry locations of the form `{parent}#{part}`.
    async fn decompose(&self, unit: &SourceUnit) -> Result<Vec<SourceUnit>>;
}

/// Parse a path/URL list file body: one entry per line, blank lines and
/// `#` comments skipped.
pub fn parse_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_skips_comments_and_blanks() {
        let body = "# sources\n\n  docs/a.md  \nhttps://example.com/x\n   # indented comment\n";
        assert_eq!(parse_list(body), vec!["docs/a.md", "https://example.com/x"]);
    }
}
