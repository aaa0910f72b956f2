//! # Community Background Cache
//!
//! Two files in the config directory hold the current community background:
//! - `background.json` - the metadata document, exactly as served
//! - `background.jpeg` - the image bytes
//!
//! They are written as a pair: storing new metadata deletes the old image, and
//! the matching image is fetched right after. Whatever pair is on disk decides
//! where the refresh state machine starts (see [`CacheState`]).

use std::path::{Path, PathBuf};

use crate::community::CommunityMetadata;
use crate::error::Result;

const METADATA_FILE: &str = "background.json";
const IMAGE_FILE: &str = "background.jpeg";

/// Which halves of the pair are present on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing cached yet
    NoMetadata,
    /// Metadata stored, image still to be downloaded
    MetadataOnly,
    /// Image without metadata (an interrupted refresh); renders, but a fresh pair is fetched
    ImageOnly,
    /// Both files present
    Cached,
}

#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache in the user's config directory.
    pub fn user() -> Option<Self> {
        crate::config::app_config_dir().map(Self::new)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata_path().is_file()
    }

    pub fn has_image(&self) -> bool {
        self.image_path().is_file()
    }

    pub fn state(&self) -> CacheState {
        match (self.has_metadata(), self.has_image()) {
            (true, true) => CacheState::Cached,
            (true, false) => CacheState::MetadataOnly,
            (false, true) => CacheState::ImageOnly,
            (false, false) => CacheState::NoMetadata,
        }
    }

    /// Reads and parses the stored metadata.
    pub fn read_metadata(&self) -> Result<CommunityMetadata> {
        let bytes = std::fs::read(self.metadata_path())?;
        CommunityMetadata::parse(&bytes)
    }

    /// Stores a new metadata document and drops the image that belonged to the
    /// previous one.
    pub fn store_metadata(&self, raw: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        self.remove_image()?;
        std::fs::write(self.metadata_path(), raw)?;
        Ok(())
    }

    pub fn read_image(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.image_path())?)
    }

    pub fn store_image(&self, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.image_path(), bytes)?;
        Ok(())
    }

    fn remove_image(&self) -> Result<()> {
        match std::fs::remove_file(self.image_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes both files.
    pub fn clear(&self) -> Result<()> {
        self.remove_image()?;
        match std::fs::remove_file(self.metadata_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_follows_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        assert_eq!(cache.state(), CacheState::NoMetadata);

        cache.store_metadata(br#"{"filename":"a.jpeg"}"#).unwrap();
        assert_eq!(cache.state(), CacheState::MetadataOnly);

        cache.store_image(&[0xFF, 0xD8, 0xFF, 0x00]).unwrap();
        assert_eq!(cache.state(), CacheState::Cached);

        std::fs::remove_file(cache.metadata_path()).unwrap();
        assert_eq!(cache.state(), CacheState::ImageOnly);
    }

    #[test]
    fn test_new_metadata_drops_stale_image() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        cache.store_metadata(br#"{"filename":"a.jpeg"}"#).unwrap();
        cache.store_image(&[0xFF, 0xD8, 0xFF, 0x00]).unwrap();

        cache.store_metadata(br#"{"filename":"b.jpeg"}"#).unwrap();
        assert!(!cache.has_image());
        assert_eq!(
            cache.read_metadata().unwrap().image_filename(),
            Some("b.jpeg")
        );
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().join("sub"));
        cache.clear().unwrap();
        cache.store_metadata(b"{}").unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.state(), CacheState::NoMetadata);
    }
}
