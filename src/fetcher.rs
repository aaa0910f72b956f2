//! # Background Fetcher
//!
//! Decides what one screen shows and, for community backgrounds, keeps the
//! local cache fresh.
//!
//! ## Community refresh state machine
//!
//! ```text
//!   NoMetadata ──index + metadata──▶ MetadataOnly ──image──▶ Cached ──render──▶ Rendered
//!        ▲                                │
//!        └──── malformed local metadata ──┘
//! ```
//!
//! Each state has exactly one driving function (`fetch_metadata`,
//! `fetch_image`, `render_cached`); [`BackgroundFetcher::drive`] calls them
//! until a resting state is reached. Failures that still leave an image on
//! disk render that stale image; failures without one end in `Unavailable`.
//!
//! Only the fetcher created with `image_getter = true` touches the network.
//! Others render what is cached or wait for the owner to re-create them.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::cache::{Cache, CacheState};
use crate::community::{pick_entry, CommunityMetadata, Feed};
use crate::config::{BackgroundSource, SharedConfig};
use crate::error::{Error, Result};
use crate::render::{Canvas, Geometry, Renderer};

/// Text shown when no community background could be fetched or cached
pub const UNAVAILABLE_MESSAGE: &str = "Couldn't get community backgrounds!";

/// Text shown while the first community background is on its way
pub const LOADING_MESSAGE: &str = "Getting a community background...";

/// Where a fetcher is in the community refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// No usable metadata: fetch the index and pick a background
    NoMetadata,
    /// Metadata stored, image missing: fetch the image
    MetadataOnly,
    /// Both files present: render them
    Cached,
    /// Canvas painted (resting)
    Rendered,
    /// Not allowed to fetch; waiting for another fetcher to fill the cache (resting)
    Waiting,
    /// Nothing fetched and nothing cached (resting)
    Unavailable,
}

impl FetchState {
    pub fn is_resting(self) -> bool {
        matches!(self, FetchState::Rendered | FetchState::Waiting | FetchState::Unavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchState::NoMetadata => "no-metadata",
            FetchState::MetadataOnly => "metadata-only",
            FetchState::Cached => "cached",
            FetchState::Rendered => "rendered",
            FetchState::Waiting => "waiting",
            FetchState::Unavailable => "unavailable",
        }
    }
}

impl From<CacheState> for FetchState {
    fn from(state: CacheState) -> Self {
        match state {
            CacheState::Cached => FetchState::Cached,
            CacheState::MetadataOnly => FetchState::MetadataOnly,
            // An orphaned image still needs a fresh pair; it is only rendered
            // if that fetch fails.
            CacheState::ImageOnly | CacheState::NoMetadata => FetchState::NoMetadata,
        }
    }
}

/// Notifications for whoever owns the fetchers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherEvent {
    /// A newer background is cached; re-create the views to show it
    ReloadBackground,
    /// The first community background finished downloading
    NewCommunityBackgroundDownloaded,
}

/// Everything a fetcher needs from the outside world.
pub struct FetcherContext<F> {
    pub config: SharedConfig,
    pub cache: Cache,
    pub feed: Arc<F>,
    pub renderer: Arc<Renderer>,
    pub events: UnboundedSender<FetcherEvent>,
}

impl<F> Clone for FetcherContext<F> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            cache: self.cache.clone(),
            feed: self.feed.clone(),
            renderer: self.renderer.clone(),
            events: self.events.clone(),
        }
    }
}

/// What a screen should display right now
#[derive(Debug, Clone, Copy)]
pub enum View<'a> {
    Canvas(&'a Canvas),
    Message(&'static str),
}

pub struct BackgroundFetcher<F> {
    ctx: FetcherContext<F>,
    source: BackgroundSource,
    geometry: Geometry,
    image_getter: bool,
    state: FetchState,
    canvas: Option<Canvas>,
}

impl<F: Feed> BackgroundFetcher<F> {
    /// Creates the fetcher for one screen.
    ///
    /// Built-in and local-file backgrounds are painted right here. Community
    /// backgrounds only pick their starting state from the cache; call
    /// [`drive`](Self::drive) to run the state machine.
    pub async fn new(ctx: FetcherContext<F>, geometry: Geometry, image_getter: bool) -> Self {
        let source = ctx.config.read().await.config.source();
        Self::with_source(ctx, source, geometry, image_getter).await
    }

    /// Like [`new`](Self::new), but shows `source` instead of the configured one.
    pub async fn with_source(
        ctx: FetcherContext<F>,
        source: BackgroundSource,
        geometry: Geometry,
        image_getter: bool,
    ) -> Self {
        let mut fetcher = Self {
            ctx,
            source,
            geometry,
            image_getter,
            state: FetchState::NoMetadata,
            canvas: None,
        };

        match fetcher.source.clone() {
            BackgroundSource::BuiltIn(name) => {
                let rendered = fetcher
                    .off_thread({
                        let name = name.clone();
                        move |renderer| renderer.builtin(&name, geometry)
                    })
                    .await;
                fetcher.finish_static(rendered, &name);
            }
            BackgroundSource::LocalFile(path) => {
                let what = path.display().to_string();
                let rendered = fetcher
                    .off_thread(move |renderer| renderer.local_file(&path, geometry))
                    .await;
                fetcher.finish_static(rendered, &what);
            }
            BackgroundSource::Community => {
                if let Err(e) = std::fs::create_dir_all(fetcher.ctx.cache.dir()) {
                    tracing::warn!("cannot create cache directory: {e}");
                }
                fetcher.state = fetcher.ctx.cache.state().into();
            }
        }
        fetcher
    }

    /// Runs a render job on the blocking pool; decoding and scaling a
    /// screen-sized image takes long enough to stall the daemon loop.
    async fn off_thread<T, J>(&self, job: J) -> Result<T>
    where
        T: Send + 'static,
        J: FnOnce(&Renderer) -> Result<T> + Send + 'static,
    {
        let renderer = self.ctx.renderer.clone();
        tokio::task::spawn_blocking(move || job(&renderer)).await?
    }

    /// Static backgrounds that fail to load show plain black.
    fn finish_static(&mut self, rendered: Result<Canvas>, what: &str) {
        self.canvas = match rendered {
            Ok(canvas) => Some(canvas),
            Err(e) => {
                tracing::warn!("failed to render background {what}: {e}");
                Canvas::new(self.geometry).ok()
            }
        };
        self.state = FetchState::Rendered;
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Whether this fetcher owns the refresh timer.
    pub fn schedules_refresh(&self) -> bool {
        self.image_getter && self.source.is_community()
    }

    pub fn canvas(&self) -> Option<&Canvas> {
        self.canvas.as_ref()
    }

    pub fn view(&self) -> View<'_> {
        match (&self.canvas, self.state) {
            (Some(canvas), _) => View::Canvas(canvas),
            (None, FetchState::Unavailable) => View::Message(UNAVAILABLE_MESSAGE),
            (None, _) => View::Message(LOADING_MESSAGE),
        }
    }

    /// Runs the state machine until it reaches a resting state.
    pub async fn drive(&mut self) -> FetchState {
        while !self.state.is_resting() {
            let next = match self.state {
                FetchState::NoMetadata => self.fetch_metadata().await,
                FetchState::MetadataOnly => self.fetch_image().await,
                FetchState::Cached => self.render_cached().await,
                resting => resting,
            };
            if next != self.state {
                tracing::debug!(from = self.state.as_str(), to = next.as_str(), "fetch state");
            }
            self.state = next;
        }
        self.state
    }

    /// Starts a fresh index → metadata → image cycle (timer expiry or an
    /// explicit request).
    pub async fn refresh(&mut self) -> FetchState {
        if !self.source.is_community() {
            return self.state;
        }
        self.state = FetchState::NoMetadata;
        self.drive().await
    }

    fn emit(&self, event: FetcherEvent) {
        tracing::info!(?event, "background event");
        let _ = self.ctx.events.send(event);
    }

    /// NoMetadata: pick a background from the index and store its metadata.
    async fn fetch_metadata(&mut self) -> FetchState {
        if !self.image_getter {
            return FetchState::Waiting;
        }
        match self.try_fetch_metadata().await {
            Ok(()) => FetchState::MetadataOnly,
            Err(e) => self.fall_back(e).await,
        }
    }

    async fn try_fetch_metadata(&self) -> Result<()> {
        let entries = self.ctx.feed.fetch_index().await?;
        let entry = {
            let mut rng = rand::thread_rng();
            pick_entry(&entries, &mut rng)
                .map(str::to_string)
                .ok_or_else(|| Error::Feed("index lists no backgrounds".to_string()))?
        };
        tracing::info!(%entry, "picked community background");

        let raw = self.ctx.feed.fetch_metadata(&entry).await?;
        let metadata = CommunityMetadata::parse(&raw)?;
        if metadata.image_filename().is_none() {
            return Err(Error::Feed(format!("metadata for {entry} names no image")));
        }
        self.ctx.cache.store_metadata(&raw)
    }

    /// MetadataOnly: download the image the stored metadata points at.
    async fn fetch_image(&mut self) -> FetchState {
        if self.ctx.cache.has_image() {
            return FetchState::Cached;
        }
        if !self.image_getter {
            return FetchState::Waiting;
        }

        let metadata = match self.ctx.cache.read_metadata() {
            Ok(metadata) if metadata.image_filename().is_some() => metadata,
            Ok(_) | Err(_) => {
                tracing::warn!("cached metadata is unusable, starting over");
                return FetchState::NoMetadata;
            }
        };
        let filename = metadata.image_filename().unwrap_or_default();

        let stored = match self.ctx.feed.fetch_image(filename).await {
            Ok(bytes) => self.ctx.cache.store_image(&bytes),
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            return self.fall_back(e).await;
        }

        tracing::info!(%filename, "community background downloaded");
        self.ctx.config.write().await.record_fetch(Utc::now());

        if self.canvas.is_some() {
            self.emit(FetcherEvent::ReloadBackground);
            FetchState::Rendered
        } else {
            self.emit(FetcherEvent::NewCommunityBackgroundDownloaded);
            FetchState::Cached
        }
    }

    /// Cached: paint the image and its labels.
    async fn render_cached(&mut self) -> FetchState {
        if self.canvas.is_some() {
            self.emit(FetcherEvent::ReloadBackground);
            return FetchState::Rendered;
        }
        match self.ctx.cache.state() {
            CacheState::Cached => {}
            CacheState::MetadataOnly => return FetchState::MetadataOnly,
            CacheState::NoMetadata | CacheState::ImageOnly => return FetchState::NoMetadata,
        }

        let metadata = match self.ctx.cache.read_metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("cached metadata is malformed ({e}), starting over");
                return FetchState::NoMetadata;
            }
        };

        match self.paint_cache(Some(&metadata)).await {
            Ok(canvas) => {
                self.canvas = Some(canvas);
                FetchState::Rendered
            }
            Err(e @ Error::Image(_)) => {
                // A corrupt image would be served from cache forever; drop the pair
                tracing::warn!("cached community background does not decode: {e}");
                if let Err(e) = self.ctx.cache.clear() {
                    tracing::warn!("failed to clear cache: {e}");
                }
                self.ctx.config.write().await.record_fetch(Utc::now());
                FetchState::Unavailable
            }
            Err(e) => {
                tracing::warn!("cached community background does not render: {e}");
                self.ctx.config.write().await.record_fetch(Utc::now());
                FetchState::Unavailable
            }
        }
    }

    async fn paint_cache(&self, metadata: Option<&CommunityMetadata>) -> Result<Canvas> {
        let show_labels = self.ctx.config.read().await.config.show_labels;
        let image = self.ctx.cache.read_image()?;
        let metadata = metadata.cloned();
        let geometry = self.geometry;
        self.off_thread(move |renderer| {
            renderer.community(&image, metadata.as_ref(), show_labels, geometry)
        })
        .await
    }

    /// A fetch step failed: show the stale cache if there is one, and defer
    /// the next attempt by a full wait interval either way.
    async fn fall_back(&mut self, error: Error) -> FetchState {
        self.ctx.config.write().await.record_fetch(Utc::now());

        if !self.ctx.cache.has_image() {
            tracing::warn!("community background fetch failed with nothing cached: {error}");
            return if self.canvas.is_some() {
                FetchState::Rendered
            } else {
                FetchState::Unavailable
            };
        }

        tracing::warn!("community background fetch failed, keeping cached image: {error}");
        if self.canvas.is_some() {
            return FetchState::Rendered;
        }

        let metadata = self.ctx.cache.read_metadata().ok();
        match self.paint_cache(metadata.as_ref()).await {
            Ok(canvas) => {
                self.canvas = Some(canvas);
                FetchState::Rendered
            }
            Err(e) => {
                tracing::warn!("stale community background does not render: {e}");
                FetchState::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::fake::{jpeg, FakeFeed, META};
    use crate::config::{Config, ConfigStore};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Harness {
        _dir: tempfile::TempDir,
        cache: Cache,
        feed: Arc<FakeFeed>,
        config: SharedConfig,
        events: UnboundedReceiver<FetcherEvent>,
        ctx: FetcherContext<FakeFeed>,
    }

    fn harness(feed: FakeFeed, background: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let feed = Arc::new(feed);
        let config = ConfigStore::in_memory(Config {
            background: background.to_string(),
            ..Config::default()
        })
        .shared();
        let (tx, events) = unbounded_channel();
        let ctx = FetcherContext {
            config: config.clone(),
            cache: cache.clone(),
            feed: feed.clone(),
            renderer: Arc::new(Renderer::without_fonts()),
            events: tx,
        };
        Harness { _dir: dir, cache, feed, config, events, ctx }
    }

    fn geometry() -> Geometry {
        Geometry::new(64, 36)
    }

    fn drain(rx: &mut UnboundedReceiver<FetcherEvent>) -> Vec<FetcherEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_full_cache_renders_without_network() {
        let mut h = harness(FakeFeed::working(), "community");
        h.cache.store_metadata(META).unwrap();
        h.cache.store_image(&jpeg()).unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.state(), FetchState::Cached);
        assert_eq!(fetcher.drive().await, FetchState::Rendered);

        assert!(fetcher.canvas().is_some());
        assert!(h.feed.calls().is_empty());
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_metadata_only_fetches_just_the_image() {
        let mut h = harness(FakeFeed::working(), "community");
        h.cache.store_metadata(META).unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.drive().await, FetchState::Rendered);

        assert_eq!(h.feed.calls(), vec!["image lake.jpeg"]);
        assert_eq!(h.cache.state(), CacheState::Cached);
        assert_eq!(
            drain(&mut h.events),
            vec![FetcherEvent::NewCommunityBackgroundDownloaded]
        );
        assert!(h.config.read().await.config.fetched.is_some());
    }

    #[tokio::test]
    async fn test_empty_cache_runs_full_chain() {
        let h = harness(FakeFeed::working(), "community");

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.state(), FetchState::NoMetadata);
        assert_eq!(fetcher.drive().await, FetchState::Rendered);

        assert_eq!(
            h.feed.calls(),
            vec!["index", "metadata /bg/lake.json", "image lake.jpeg"]
        );
        assert_eq!(
            h.cache.read_metadata().unwrap().name.as_deref(),
            Some("Lake")
        );
    }

    #[tokio::test]
    async fn test_malformed_index_falls_back_to_cache() {
        let mut h = harness(FakeFeed::broken(), "community");
        h.cache.store_metadata(META).unwrap();
        h.cache.store_image(&jpeg()).unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        fetcher.drive().await;
        let before = fetcher.canvas().cloned();

        assert_eq!(fetcher.refresh().await, FetchState::Rendered);
        assert_eq!(fetcher.canvas().cloned(), before);
        assert_eq!(h.feed.calls(), vec!["index"]);
        assert!(h.config.read().await.config.fetched.is_some());
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_image_renders_when_feed_is_down() {
        let h = harness(FakeFeed::broken(), "community");
        h.cache.store_image(&jpeg()).unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.drive().await, FetchState::Rendered);
        assert!(matches!(fetcher.view(), View::Canvas(_)));
    }

    #[tokio::test]
    async fn test_nothing_cached_and_feed_down_is_unavailable() {
        let h = harness(FakeFeed::broken(), "community");

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.drive().await, FetchState::Unavailable);
        assert!(matches!(fetcher.view(), View::Message(UNAVAILABLE_MESSAGE)));
        // Next attempt deferred by one interval
        assert!(h.config.read().await.config.fetched.is_some());
    }

    #[tokio::test]
    async fn test_refetch_after_render_requests_reload() {
        let mut h = harness(FakeFeed::working(), "community");
        h.cache.store_metadata(META).unwrap();
        h.cache.store_image(&jpeg()).unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        fetcher.drive().await;

        assert_eq!(fetcher.refresh().await, FetchState::Rendered);
        assert_eq!(drain(&mut h.events), vec![FetcherEvent::ReloadBackground]);
        assert_eq!(h.feed.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_secondary_screen_waits() {
        let h = harness(FakeFeed::working(), "community");

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), false).await;
        assert_eq!(fetcher.drive().await, FetchState::Waiting);
        assert!(matches!(fetcher.view(), View::Message(LOADING_MESSAGE)));
        assert!(h.feed.calls().is_empty());
        assert!(!fetcher.schedules_refresh());
    }

    #[tokio::test]
    async fn test_malformed_local_metadata_refetches() {
        let h = harness(FakeFeed::working(), "community");
        h.cache.store_metadata(b"not json").unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.state(), FetchState::MetadataOnly);
        assert_eq!(fetcher.drive().await, FetchState::Rendered);
        assert_eq!(h.feed.calls()[0], "index");
    }

    #[tokio::test]
    async fn test_builtin_renders_immediately() {
        let h = harness(FakeFeed::working(), "inbuilt:triangles");

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.state(), FetchState::Rendered);
        assert!(fetcher.canvas().is_some());
        assert_eq!(fetcher.refresh().await, FetchState::Rendered);
        assert!(h.feed.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_file_is_black() {
        let h = harness(FakeFeed::working(), "/definitely/not/here.png");

        let fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        let canvas = fetcher.canvas().unwrap().to_rgba_image();
        assert!(canvas.pixels().all(|p| p.0 == [0, 0, 0, 255]));
    }

    #[tokio::test]
    async fn test_forced_community_fetch_keeps_configured_source() {
        let mut h = harness(FakeFeed::working(), "community");
        let path = h._dir.path().join("config.json");
        Config {
            background: "inbuilt:waves".to_string(),
            ..Config::default()
        }
        .save_to(&path)
        .unwrap();
        let config = ConfigStore::load_from(&path).shared();
        let ctx = FetcherContext {
            config: config.clone(),
            ..h.ctx.clone()
        };

        let mut fetcher =
            BackgroundFetcher::with_source(ctx, BackgroundSource::Community, geometry(), true).await;
        assert_eq!(fetcher.refresh().await, FetchState::Rendered);
        assert_eq!(
            drain(&mut h.events),
            vec![FetcherEvent::NewCommunityBackgroundDownloaded]
        );

        let on_disk = Config::load_from(&path);
        assert_eq!(on_disk.background, "inbuilt:waves");
        assert!(on_disk.fetched.is_some());
        assert_eq!(config.read().await.config.background, "inbuilt:waves");
    }

    #[tokio::test]
    async fn test_unlabelable_metadata_keeps_cache() {
        let h = harness(FakeFeed::broken(), "community");
        h.cache
            .store_metadata(br#"{"name":"Lake\u0001","filename":"lake.jpeg"}"#)
            .unwrap();
        h.cache.store_image(&jpeg()).unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.drive().await, FetchState::Rendered);
        assert_eq!(h.cache.state(), CacheState::Cached);
        assert!(h.feed.calls().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_cached_image_is_dropped() {
        let h = harness(FakeFeed::broken(), "community");
        h.cache.store_metadata(META).unwrap();
        h.cache.store_image(b"\xFF\xD8\xFF truncated").unwrap();

        let mut fetcher = BackgroundFetcher::new(h.ctx.clone(), geometry(), true).await;
        assert_eq!(fetcher.drive().await, FetchState::Unavailable);
        assert_eq!(h.cache.state(), CacheState::NoMetadata);
    }
}
