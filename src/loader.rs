//! Source loaders: local files and directories, and HTTP(S) URLs.
//!
//! Both loaders produce [`SourceUnit`]s whose `location` is the path or
//! URL they were fetched from. Modality is inferred from the file
//! extension (files) or the `Content-Type` header (URLs); files with an
//! unknown extension are skipped during directory walks.
//!
//! # Directory walks
//!
//! `include_globs` / `exclude_globs` are matched against the path relative
//! to the walked root. `.git`, `target` and `node_modules` are always
//! excluded. Discovery returns paths sorted; an entry the walk cannot
//! read is still returned so its fetch fails on its own.
//!
//! # URLs
//!
//! A URL ending in `.xml` is read as a sitemap and discovers the pages in
//! its `<loc>` entries, following nested sitemaps a few levels deep. An
//! HTML page yields its visible text followed by the image, audio and
//! video files it links to (`img`, `a`, `source`, `video`, `audio`),
//! limited to the page's origin when `loader.same_origin` is set. Bodies
//! are read in chunks and abandoned past `loader.max_page_bytes`
//! (pages) or `loader.max_asset_bytes` (media).

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use quick_xml::events::Event;
use ragweave_core::loader::{parse_list, SourceLoader};
use ragweave_core::models::{Modality, SourceUnit};
use ragweave_core::{Error, Result};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use walkdir::WalkDir;

use crate::config::LoaderConfig;

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/target/**", "**/node_modules/**"];
const MAX_SITEMAP_DEPTH: usize = 3;
/// Elements and attributes that may point at a media file.
const ASSET_ATTRS: [(&str, &str); 6] = [
    ("img[src]", "src"),
    ("a[href]", "href"),
    ("source[src]", "src"),
    ("source[srcset]", "srcset"),
    ("video[src]", "src"),
    ("audio[src]", "src"),
];

pub struct FileLoader {
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FileLoader {
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn selected(&self, root: &Path, path: &Path) -> bool {
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        !self.exclude.is_match(&rel) && self.include.is_match(&rel)
    }

    fn walk(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(self.follow_symlinks) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(root = %root.display(), error = %e, "walk error");
                    if let Some(path) = e.path().filter(|p| self.selected(root, p)) {
                        files.push(path.to_path_buf());
                    }
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !self.selected(root, path) {
                continue;
            }
            match modality_of(path) {
                Some(_) => files.push(path.to_path_buf()),
                None => tracing::debug!(path = %path.display(), "skipping file with unknown type"),
            }
        }
        files.sort();
        files.dedup();
        files
    }
}

#[async_trait]
impl SourceLoader for FileLoader {
    fn name(&self) -> &str {
        "file"
    }

    async fn discover(&self, location: &str) -> Result<Vec<String>> {
        let path = Path::new(location);
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            Error::invalid_request(format!("cannot read {location}: {e}"))
        })?;
        if meta.is_file() {
            return Ok(vec![location.to_string()]);
        }
        let files: Vec<String> = self
            .walk(path)
            .into_iter()
            .map(|p| p.display().to_string())
            .collect();
        tracing::debug!(root = location, files = files.len(), "walked directory");
        Ok(files)
    }

    async fn fetch(&self, location: &str) -> Result<Vec<SourceUnit>> {
        let path = Path::new(location);
        let meta = tokio::fs::metadata(path).await.map_err(|e| {
            Error::invalid_request(format!("cannot read {location}: {e}"))
        })?;

        if meta.is_file() {
            let modality = modality_of(path).ok_or_else(|| {
                Error::invalid_request(format!("unsupported file type: {location}"))
            })?;
            return Ok(vec![read_file(path, modality).await?]);
        }

        let mut units = Vec::new();
        for file in self.discover(location).await? {
            units.extend(self.fetch(&file).await?);
        }
        Ok(units)
    }
}

fn modality_of(path: &Path) -> Option<Modality> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(Modality::from_extension)
}

async fn read_file(path: &Path, modality: Modality) -> Result<SourceUnit> {
    let bytes = tokio::fs::read(path).await?;
    let location = path.display().to_string();
    let mut unit = match modality {
        Modality::Text => SourceUnit::text(location, String::from_utf8_lossy(&bytes).into_owned()),
        _ => SourceUnit::media(location, modality, bytes),
    };

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    unit = unit
        .with_metadata("path", path.display().to_string())
        .with_metadata("file_name", file_name);

    if let Ok(modified) = tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        let modified: DateTime<Utc> = modified.into();
        unit = unit.with_metadata("modified", modified.to_rfc3339());
    }
    Ok(unit)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::config(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::config(format!("invalid glob set: {e}")))
}

/// Fetches pages, media files and sitemaps over HTTP(S).
pub struct UrlLoader {
    client: reqwest::Client,
    load_assets: bool,
    same_origin: bool,
    max_assets: usize,
    max_asset_bytes: u64,
    max_page_bytes: u64,
}

impl UrlLoader {
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            load_assets: config.load_assets,
            same_origin: config.same_origin,
            max_assets: config.max_assets_per_page,
            max_asset_bytes: config.max_asset_bytes,
            max_page_bytes: config.max_page_bytes,
        })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::provider(self.name(), format!("GET {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("GET {url} returned {status}");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                Error::provider(self.name(), message)
            } else {
                Error::provider_fatal(self.name(), message)
            });
        }
        Ok(response)
    }

    /// Read the body, giving up as soon as it exceeds `limit` bytes.
    async fn read_body(&self, mut response: reqwest::Response, url: &str, limit: u64) -> Result<Vec<u8>> {
        let too_large = || Error::provider_fatal(self.name(), format!("{url} exceeds {limit} bytes"));
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(too_large());
        }
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::provider(self.name(), format!("reading {url} failed: {e}")))?
        {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Page URLs listed by the sitemap at `root` and the sitemaps it nests.
    async fn expand_sitemap(&self, root: &Url) -> Result<Vec<String>> {
        let mut pages = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([(root.clone(), 0usize)]);

        while let Some((sitemap, depth)) = queue.pop_front() {
            if !seen.insert(sitemap.to_string()) {
                continue;
            }
            let body = match self.send(sitemap.as_str()).await {
                Ok(response) => self.read_body(response, sitemap.as_str(), self.max_page_bytes).await,
                Err(e) => Err(e),
            };
            let locations = match body.and_then(|b| sitemap_locations(&b)) {
                Ok(locations) => locations,
                Err(e) if depth == 0 => return Err(e),
                Err(e) => {
                    tracing::warn!(sitemap = %sitemap, error = %e, "skipping nested sitemap");
                    continue;
                }
            };
            for loc in locations {
                let Ok(url) = Url::parse(&loc) else {
                    tracing::debug!(sitemap = %sitemap, loc, "skipping invalid sitemap entry");
                    continue;
                };
                if url_extension(url.as_str()) == Some("xml") {
                    if depth + 1 < MAX_SITEMAP_DEPTH {
                        queue.push_back((url, depth + 1));
                    } else {
                        tracing::warn!(sitemap = %url, "sitemap nesting too deep");
                    }
                } else if seen.insert(url.to_string()) {
                    pages.push(url.to_string());
                }
            }
        }
        tracing::info!(sitemap = %root, pages = pages.len(), "expanded sitemap");
        Ok(pages)
    }

    /// Media units for the assets `html` links to. Failures skip the asset.
    async fn fetch_assets(&self, page: &Url, html: &str) -> Vec<SourceUnit> {
        let mut units = Vec::new();
        for link in asset_links(html, page, self.same_origin, self.max_assets) {
            match self.fetch_asset(page, &link).await {
                Ok(Some(unit)) => units.push(unit),
                Ok(None) => {}
                Err(e) => tracing::warn!(page = %page, asset = %link, error = %e, "skipping asset"),
            }
        }
        if !units.is_empty() {
            tracing::debug!(page = %page, assets = units.len(), "fetched linked assets");
        }
        units
    }

    async fn fetch_asset(&self, page: &Url, link: &Url) -> Result<Option<SourceUnit>> {
        let response = self.send(link.as_str()).await?;
        let content_type = content_type(&response);
        if is_html(&content_type, link.as_str()) {
            tracing::debug!(asset = %link, "asset link serves a page");
            return Ok(None);
        }
        let modality = Modality::from_mime(&content_type)
            .filter(|m| !m.has_text())
            .or_else(|| url_extension(link.as_str()).and_then(Modality::from_extension))
            .filter(|m| !m.has_text());
        let Some(modality) = modality else {
            return Ok(None);
        };
        let body = self.read_body(response, link.as_str(), self.max_asset_bytes).await?;
        let unit = SourceUnit::media(link.as_str(), modality, body)
            .with_metadata("url", link.as_str())
            .with_metadata("base_source", page.as_str())
            .with_metadata("file_name", file_name_of(link))
            .with_metadata("content_type", content_type);
        Ok(Some(unit))
    }
}

#[async_trait]
impl SourceLoader for UrlLoader {
    fn name(&self) -> &str {
        "url"
    }

    async fn discover(&self, location: &str) -> Result<Vec<String>> {
        let url = parse_url(location)?;
        if url_extension(url.as_str()) != Some("xml") {
            return Ok(vec![location.to_string()]);
        }
        let pages = self.expand_sitemap(&url).await?;
        if pages.is_empty() {
            // Not a sitemap after all: load the document itself.
            return Ok(vec![location.to_string()]);
        }
        Ok(pages)
    }

    async fn fetch(&self, location: &str) -> Result<Vec<SourceUnit>> {
        let url = parse_url(location)?;
        let response = self.send(location).await?;
        let content_type = content_type(&response);
        let modality = Modality::from_mime(&content_type)
            .or_else(|| url_extension(location).and_then(Modality::from_extension))
            .unwrap_or(Modality::Text);
        let limit = if modality.has_text() {
            self.max_page_bytes
        } else {
            self.max_asset_bytes
        };
        let bytes = self.read_body(response, location, limit).await?;

        let mut assets = Vec::new();
        let mut unit = match modality {
            Modality::Text if is_html(&content_type, location) => {
                let html = String::from_utf8_lossy(&bytes);
                if self.load_assets {
                    assets = self.fetch_assets(&url, &html).await;
                }
                let page = extract_html(&html);
                let unit = SourceUnit::text(location, page.text);
                match page.title {
                    Some(title) => unit.with_metadata("title", title),
                    None => unit,
                }
            }
            Modality::Text => SourceUnit::text(location, String::from_utf8_lossy(&bytes).into_owned()),
            _ => SourceUnit::media(location, modality, bytes)
                .with_metadata("file_name", file_name_of(&url)),
        };
        unit = unit.with_metadata("url", location);
        if !content_type.is_empty() {
            unit = unit.with_metadata("content_type", content_type);
        }

        let mut units = vec![unit];
        units.extend(assets);
        Ok(units)
    }
}

fn parse_url(location: &str) -> Result<Url> {
    let url = Url::parse(location)
        .map_err(|e| Error::invalid_request(format!("invalid URL {location}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::invalid_request(format!(
            "unsupported URL scheme '{}' in {location}",
            url.scheme()
        )));
    }
    Ok(url)
}

fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn file_name_of(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or(url.as_str())
        .to_string()
}

/// Media URLs linked from `html`, resolved against `page`, deduplicated
/// and in discovery order, at most `limit` of them.
pub(crate) fn asset_links(html: &str, page: &Url, same_origin: bool, limit: usize) -> Vec<Url> {
    let document = Html::parse_document(html);
    let mut links: Vec<Url> = Vec::new();
    if limit == 0 {
        return links;
    }
    for (css, attr) in ASSET_ATTRS {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        for element in document.select(&selector) {
            let Some(value) = element.value().attr(attr) else {
                continue;
            };
            // srcset: "a.png 1x, b.png 2x"; the first candidate is enough.
            let candidate = match attr {
                "srcset" => value
                    .split(',')
                    .next()
                    .and_then(|c| c.split_whitespace().next()),
                _ => Some(value.trim()),
            };
            let Some(Ok(mut url)) = candidate.filter(|c| !c.is_empty()).map(|c| page.join(c)) else {
                continue;
            };
            url.set_fragment(None);
            if !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            if same_origin && url.origin() != page.origin() {
                continue;
            }
            let is_media = url_extension(url.as_str())
                .and_then(Modality::from_extension)
                .is_some_and(|m| !m.has_text());
            if !is_media || links.contains(&url) {
                continue;
            }
            links.push(url);
            if links.len() >= limit {
                return links;
            }
        }
    }
    links
}

/// Text of every `<loc>` element of a sitemap or sitemap index.
pub(crate) fn sitemap_locations(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_loc = false;
    let mut locations = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => in_loc = e.local_name().as_ref() == b"loc",
            Ok(Event::End(_)) => in_loc = false,
            Ok(Event::Text(t)) if in_loc => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::provider_fatal("url", format!("invalid sitemap: {e}")))?;
                locations.push(text.trim().to_string());
            }
            Ok(Event::CData(c)) if in_loc => {
                locations.push(String::from_utf8_lossy(&c.into_inner()).trim().to_string());
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::provider_fatal("url", format!("invalid sitemap: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }
    locations.retain(|l| !l.is_empty());
    Ok(locations)
}

fn url_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next()?;
    last.rsplit_once('.').map(|(_, ext)| ext)
}

fn is_html(content_type: &str, location: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("text/html")
        || ct.contains("application/xhtml")
        || (ct.is_empty() && matches!(url_extension(location), Some("html" | "htm")))
}

pub(crate) struct HtmlPage {
    pub title: Option<String>,
    pub text: String,
}

/// Visible text of an HTML document, one line per block element.
pub(crate) fn extract_html(html: &str) -> HtmlPage {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|sel| {
        document
            .select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|s| !s.is_empty())
    });

    let body = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next());
    let mut raw = String::new();
    match body {
        Some(body) => collect_text(&body, &mut raw),
        None => collect_text(&document.root_element(), &mut raw),
    }

    let text = raw
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    HtmlPage { title, text }
}

fn collect_text(element: &ElementRef, out: &mut String) {
    for node in element.children() {
        if let Some(el) = ElementRef::wrap(node) {
            let tag = el.value().name();
            if matches!(tag, "script" | "style" | "noscript" | "head" | "template") {
                continue;
            }
            let block = matches!(
                tag,
                "p" | "div" | "section" | "article" | "br" | "li" | "tr" | "pre" | "blockquote"
                    | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
            );
            if block {
                out.push('\n');
            }
            collect_text(&el, out);
            if block {
                out.push('\n');
            }
        } else if let Some(text) = node.value().as_text() {
            out.push_str(text);
        }
    }
}

/// Read a list file (one path or URL per line; blanks and `#` lines skipped).
pub async fn read_list(path: &Path) -> Result<Vec<String>> {
    let body = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::invalid_request(format!("cannot read list file {}: {e}", path.display()))
    })?;
    Ok(parse_list(&body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragweave_core::models::Content;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_directory_walk_applies_globs_and_modalities() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("docs/a.md"), "# A\n\nalpha").unwrap();
        fs::write(root.join("docs/b.wav"), b"RIFFxxxxWAVE").unwrap();
        fs::write(root.join("docs/skip.bin"), b"\0\0").unwrap();
        fs::write(root.join("docs/draft.md"), "draft").unwrap();
        fs::write(root.join(".git/config.md"), "nope").unwrap();

        let config = LoaderConfig {
            exclude_globs: vec!["**/draft.md".into()],
            ..LoaderConfig::default()
        };
        let loader = FileLoader::new(&config).unwrap();
        let units = loader.fetch(root.to_str().unwrap()).await.unwrap();

        let names: Vec<_> = units
            .iter()
            .map(|u| u.metadata["file_name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.md", "b.wav"]);
        assert_eq!(units[0].modality, Modality::Text);
        assert_eq!(units[0].content, Content::Text("# A\n\nalpha".into()));
        assert_eq!(units[1].modality, Modality::Audio);
        assert!(units[1].metadata.contains_key("modified"));
    }

    #[tokio::test]
    async fn test_single_file_and_errors() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("note.txt");
        fs::write(&file, "hello").unwrap();
        let loader = FileLoader::new(&LoaderConfig::default()).unwrap();

        let units = loader.fetch(file.to_str().unwrap()).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].location, file.display().to_string());

        let missing = tmp.path().join("missing.txt");
        let err = loader.fetch(missing.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let odd = tmp.path().join("blob.xyz");
        fs::write(&odd, "x").unwrap();
        assert!(loader.fetch(odd.to_str().unwrap()).await.is_err());
    }

    #[test]
    fn test_invalid_glob_is_config_error() {
        let config = LoaderConfig {
            include_globs: vec!["[".into()],
            ..LoaderConfig::default()
        };
        assert!(matches!(FileLoader::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_extract_html_drops_scripts_and_keeps_blocks() {
        let page = extract_html(
            "<html><head><title> Guide </title><style>p{}</style></head>\
             <body><h1>Setup</h1><script>var x = 1;</script>\
             <p>Install   the <b>tool</b>.</p><ul><li>one</li><li>two</li></ul></body></html>",
        );
        assert_eq!(page.title.as_deref(), Some("Guide"));
        assert_eq!(page.text, "Setup\n\nInstall the tool.\n\none\n\ntwo");
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://x.org/a/b.png?size=2"), Some("png"));
        assert_eq!(url_extension("https://x.org/page"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_entry_is_discovered_and_fails_alone() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::write(root.join("a.md"), "alpha").unwrap();
        fs::write(root.join("c.md"), "gamma").unwrap();
        std::os::unix::fs::symlink(root.join("missing-target.md"), root.join("b.md")).unwrap();

        let config = LoaderConfig {
            follow_symlinks: true,
            ..LoaderConfig::default()
        };
        let loader = FileLoader::new(&config).unwrap();
        let found = loader.discover(root.to_str().unwrap()).await.unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| Path::new(p).file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.md", "b.md", "c.md"]);

        assert!(loader.fetch(&found[0]).await.is_ok());
        let err = loader.fetch(&found[1]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_sitemap_locations() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc> https://example.com/a.html </loc><lastmod>2024-01-01</lastmod></url>
  <url><loc>https://example.com/b?x=1&amp;y=2</loc></url>
  <url><loc><![CDATA[https://example.com/c.html]]></loc></url>
</urlset>"#;
        assert_eq!(
            sitemap_locations(xml).unwrap(),
            vec![
                "https://example.com/a.html",
                "https://example.com/b?x=1&y=2",
                "https://example.com/c.html"
            ]
        );
        assert!(sitemap_locations(b"<urlset><loc>x</urlset>").is_err());
    }

    #[test]
    fn test_asset_links_resolve_filter_and_limit() {
        let page = Url::parse("https://docs.example.com/guide/intro.html").unwrap();
        let html = r#"<html><body>
            <img src="img/cat.png">
            <img src="/img/cat.png#zoom">
            <a href="diagram.webp">diagram</a>
            <a href="next.html">next</a>
            <img src="https://cdn.other.com/logo.png">
            <picture><source srcset="/media/hero.jpg 1x, /media/hero@2x.jpg 2x"></picture>
            <video src="//docs.example.com/clip.mp4"></video>
            <audio src="data:audio/wav;base64,AAAA"></audio>
        </body></html>"#;

        let links: Vec<String> = asset_links(html, &page, true, 20)
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        assert_eq!(
            links,
            vec![
                "https://docs.example.com/guide/img/cat.png",
                "https://docs.example.com/img/cat.png",
                "https://docs.example.com/guide/diagram.webp",
                "https://docs.example.com/media/hero.jpg",
                "https://docs.example.com/clip.mp4",
            ]
        );

        let any_origin = asset_links(html, &page, false, 20);
        assert!(any_origin.iter().any(|u| u.host_str() == Some("cdn.other.com")));
        assert_eq!(asset_links(html, &page, true, 2).len(), 2);
        assert!(asset_links(html, &page, true, 0).is_empty());
    }

    type Route = (String, &'static str, Vec<u8>);

    /// Serve canned responses on a local port; unknown paths get a 404.
    async fn serve(routes: impl FnOnce(&str) -> Vec<Route>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let routes = std::sync::Arc::new(routes(&base));
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, content_type, body) =
                        match routes.iter().find(|(p, _, _)| *p == path) {
                            Some((_, ct, body)) => ("200 OK", *ct, body.clone()),
                            None => ("404 Not Found", "text/plain", b"missing".to_vec()),
                        };
                    let head = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        base
    }

    #[tokio::test]
    async fn test_page_yields_linked_assets_within_limits() {
        let base = serve(|_| {
            vec![
                (
                    "/page.html".into(),
                    "text/html; charset=utf-8",
                    br#"<html><head><title>Cats</title></head><body>
                        <p>All about cats.</p>
                        <img src="/cat.png"><a href="/huge.png">big</a>
                        <img src="/fake.png"><img src="http://elsewhere.invalid/dog.png">
                        <a href="/other.html">more</a>
                    </body></html>"#
                        .to_vec(),
                ),
                ("/cat.png".into(), "image/png", vec![7u8; 64]),
                ("/huge.png".into(), "image/png", vec![1u8; 4096]),
                ("/fake.png".into(), "text/html", b"<html>login</html>".to_vec()),
            ]
        })
        .await;

        let config = LoaderConfig {
            max_asset_bytes: 1024,
            ..LoaderConfig::default()
        };
        let loader = UrlLoader::new(&config).unwrap();
        let page_url = format!("{base}/page.html");
        let units = loader.fetch(&page_url).await.unwrap();

        assert_eq!(units.len(), 2, "page plus the one asset within limits");
        assert_eq!(units[0].location, page_url);
        assert_eq!(units[0].metadata["title"], "Cats");
        assert!(units[0].content.to_text().contains("All about cats."));

        let cat = &units[1];
        assert_eq!(cat.location, format!("{base}/cat.png"));
        assert_eq!(cat.modality, Modality::Image);
        assert_eq!(cat.content, Content::Bytes(vec![7u8; 64]));
        assert_eq!(cat.metadata["base_source"], page_url.as_str());
        assert_eq!(cat.metadata["file_name"], "cat.png");

        let without_assets = UrlLoader::new(&LoaderConfig {
            load_assets: false,
            ..LoaderConfig::default()
        })
        .unwrap();
        assert_eq!(without_assets.fetch(&page_url).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_page_fails() {
        let base = serve(|_| vec![("/big.html".into(), "text/html", vec![b'a'; 2048])]).await;
        let loader = UrlLoader::new(&LoaderConfig {
            max_page_bytes: 512,
            ..LoaderConfig::default()
        })
        .unwrap();
        let err = loader.fetch(&format!("{base}/big.html")).await.unwrap_err();
        assert!(matches!(err, Error::Provider { retryable: false, .. }));
        assert!(err.to_string().contains("exceeds 512 bytes"));
    }

    #[tokio::test]
    async fn test_sitemap_discovers_pages_through_nested_sitemaps() {
        let base = serve(|base| {
            let index = format!(
                "<sitemapindex><sitemap><loc>{base}/pages.xml</loc></sitemap></sitemapindex>"
            );
            let pages = format!(
                "<urlset><url><loc>{base}/a.html</loc></url>\
                 <url><loc>{base}/b.html</loc></url>\
                 <url><loc>{base}/a.html</loc></url></urlset>"
            );
            vec![
                ("/sitemap.xml".into(), "application/xml", index.into_bytes()),
                ("/pages.xml".into(), "application/xml", pages.into_bytes()),
            ]
        })
        .await;

        let loader = UrlLoader::new(&LoaderConfig::default()).unwrap();
        let found = loader.discover(&format!("{base}/sitemap.xml")).await.unwrap();
        assert_eq!(found, vec![format!("{base}/a.html"), format!("{base}/b.html")]);

        assert_eq!(
            loader.discover("https://example.com/page").await.unwrap(),
            vec!["https://example.com/page"]
        );
        assert!(matches!(
            loader.discover("ftp://example.com/x").await.unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_read_list() {
        let tmp = TempDir::new().unwrap();
        let list = tmp.path().join("sources.txt");
        fs::write(&list, "# docs\n./a.md\n\nhttps://example.com\n").unwrap();
        assert_eq!(
            read_list(&list).await.unwrap(),
            vec!["./a.md", "https://example.com"]
        );
    }
}
