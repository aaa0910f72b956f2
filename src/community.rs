//! # Community Feed Client
//!
//! Handles communication with the community background feed to fetch the
//! list of submitted wallpapers, their attribution metadata and the images.
//!
//! ## Feed Layout
//! ```text
//! <base>/theshell/backgrounds/backgrounds.json      index (JSON array)
//! <base><entry>                                      metadata (JSON object)
//! <base>/theshell/backgrounds/<stem>/<filename>     image
//! ```
//!
//! The first element of the index array is a sentinel and never a real
//! background. Each remaining element is a path relative to `<base>`.
//! `<stem>` is the metadata `filename` up to its first dot.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Path of the index document below the feed base.
const INDEX_PATH: &str = "/theshell/backgrounds/backgrounds.json";

/// Directory holding per-background folders below the feed base.
const BACKGROUNDS_PATH: &str = "/theshell/backgrounds";

/// HTTP request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Attribution record stored next to the cached image.
///
/// Every field is optional on the wire; only `filename` is needed to fetch
/// the image, the rest is drawn as labels when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityMetadata {
    /// Title of the photo
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    /// Where it was taken
    #[serde(default, deserialize_with = "lenient_text")]
    pub location: Option<String>,
    /// Photographer credit
    #[serde(default, deserialize_with = "lenient_text")]
    pub author: Option<String>,
    /// Image file name on the feed (e.g. "lake.jpeg")
    #[serde(default, deserialize_with = "lenient_text")]
    pub filename: Option<String>,
}

/// Accepts numbers and booleans as text; arrays, objects and null are absent.
fn lenient_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

impl CommunityMetadata {
    /// Parses a metadata document. Anything but a JSON object is rejected.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            return Err(Error::Feed("metadata is not a JSON object".to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The image file name, if the record names a usable one.
    pub fn image_filename(&self) -> Option<&str> {
        self.filename.as_deref().filter(|f| !f.is_empty())
    }
}

/// Parses the index document into the list of candidate entries.
///
/// The first element is dropped; non-string elements are ignored.
/// An index with nothing left to pick from is an error.
pub fn parse_index(bytes: &[u8]) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let serde_json::Value::Array(items) = value else {
        return Err(Error::Feed("index is not a JSON array".to_string()));
    };

    let entries: Vec<String> = items
        .into_iter()
        .skip(1)
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect();

    if entries.is_empty() {
        return Err(Error::Feed("index lists no backgrounds".to_string()));
    }
    Ok(entries)
}

/// Picks one entry uniformly at random.
pub fn pick_entry<'a, R: Rng + ?Sized>(entries: &'a [String], rng: &mut R) -> Option<&'a str> {
    entries.choose(rng).map(String::as_str)
}

/// Builds the image URL for a metadata file name.
///
/// # Example
/// ```ignore
/// image_url("https://host", "lake.v2.jpeg")
/// // → "https://host/theshell/backgrounds/lake/lake.v2.jpeg"
/// ```
pub fn image_url(base: &str, filename: &str) -> String {
    let stem = filename.split('.').next().unwrap_or(filename);
    format!("{}{}/{}/{}", base.trim_end_matches('/'), BACKGROUNDS_PATH, stem, filename)
}

/// Checks the magic bytes of a downloaded image.
///
/// JPEG starts with FF D8 FF, PNG starts with 89 50 4E 47. Anything else is
/// most likely an HTML error page served with a 200.
pub fn validate_image(bytes: &[u8]) -> Result<()> {
    if bytes.len() < 4 {
        return Err(Error::Feed("downloaded file is too small to be an image".to_string()));
    }
    let is_jpeg = bytes[0] == 0xFF && bytes[1] == 0xD8 && bytes[2] == 0xFF;
    let is_png = bytes[0] == 0x89 && bytes[1] == 0x50 && bytes[2] == 0x4E && bytes[3] == 0x47;
    if !is_jpeg && !is_png {
        return Err(Error::Feed(
            "downloaded content is not a valid image (may be an error page)".to_string(),
        ));
    }
    Ok(())
}

/// Source of community backgrounds.
///
/// The daemon uses [`HttpFeed`]; tests substitute an in-memory feed.
pub trait Feed: Send + Sync {
    /// Fetches and parses the index, sentinel already removed.
    fn fetch_index(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Fetches the raw metadata document for an index entry.
    fn fetch_metadata(&self, entry: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Fetches the raw image bytes for a metadata file name.
    fn fetch_image(&self, filename: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// The real feed, spoken to over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    base: String,
    client: reqwest::Client,
}

impl HttpFeed {
    /// Creates a feed client rooted at `base` (e.g. `https://vicr123.github.io`).
    pub fn new(base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("shell-background/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!(%url, "GET");
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

impl Feed for HttpFeed {
    async fn fetch_index(&self) -> Result<Vec<String>> {
        let bytes = self.get(&format!("{}{}", self.base, INDEX_PATH)).await?;
        parse_index(&bytes)
    }

    async fn fetch_metadata(&self, entry: &str) -> Result<Vec<u8>> {
        self.get(&format!("{}{}", self.base, entry)).await
    }

    async fn fetch_image(&self, filename: &str) -> Result<Vec<u8>> {
        let bytes = self.get(&image_url(&self.base, filename)).await?;
        validate_image(&bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_drops_sentinel() {
        let entries = parse_index(br#"["skip", "/a.json", "/b.json"]"#).unwrap();
        assert_eq!(entries, vec!["/a.json", "/b.json"]);
    }

    #[test]
    fn test_index_rejects_non_array() {
        assert!(parse_index(br#"{"backgrounds": []}"#).is_err());
        assert!(parse_index(b"<html>404</html>").is_err());
    }

    #[test]
    fn test_index_with_only_sentinel_is_empty() {
        assert!(parse_index(br#"["skip"]"#).is_err());
    }

    #[test]
    fn test_pick_entry_comes_from_list() {
        let entries = vec!["/a.json".to_string(), "/b.json".to_string()];
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let picked = pick_entry(&entries, &mut rng).unwrap();
            assert!(entries.iter().any(|e| e == picked));
        }
        assert!(pick_entry(&[], &mut rng).is_none());
    }

    #[test]
    fn test_metadata_parsing() {
        let meta = CommunityMetadata::parse(
            br#"{"name":"Lake","author":"Sam","filename":"lake.jpeg","extra":1}"#,
        )
        .unwrap();
        assert_eq!(meta.name.as_deref(), Some("Lake"));
        assert_eq!(meta.location, None);
        assert_eq!(meta.image_filename(), Some("lake.jpeg"));

        assert!(CommunityMetadata::parse(b"[1,2]").is_err());
        assert!(CommunityMetadata::parse(b"garbage").is_err());
    }

    #[test]
    fn test_metadata_tolerates_non_string_fields() {
        let meta = CommunityMetadata::parse(
            br#"{"name":2019,"location":null,"author":["a"],"filename":"year.jpeg"}"#,
        )
        .unwrap();
        assert_eq!(meta.name.as_deref(), Some("2019"));
        assert_eq!(meta.location, None);
        assert_eq!(meta.author, None);
        assert_eq!(meta.image_filename(), Some("year.jpeg"));
    }

    #[test]
    fn test_image_url_uses_stem_directory() {
        assert_eq!(
            image_url("https://host/", "lake.jpeg"),
            "https://host/theshell/backgrounds/lake/lake.jpeg"
        );
        assert_eq!(
            image_url("https://host", "a.b.png"),
            "https://host/theshell/backgrounds/a/a.b.png"
        );
    }

    #[test]
    fn test_validate_image_magic() {
        assert!(validate_image(&[0xFF, 0xD8, 0xFF, 0xE0]).is_ok());
        assert!(validate_image(&[0x89, 0x50, 0x4E, 0x47, 0x0D]).is_ok());
        assert!(validate_image(b"<!DOCTYPE html>").is_err());
        assert!(validate_image(&[0xFF]).is_err());
    }
}
