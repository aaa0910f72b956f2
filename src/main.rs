//! # Shell Background
//!
//! Desktop background daemon for X11 desktop shells. Shows a built-in SVG
//! background, a local image, or a community wallpaper that is refreshed on
//! a timer and credited with its name, location and author.
//!
//! ## Architecture
//! - `daemon.rs` - Main loop: one fetcher and one desktop window per monitor
//! - `fetcher.rs` - Per-screen background state machine
//! - `community.rs` - Community feed client (index, metadata, image)
//! - `cache.rs` - On-disk cache of the current community background
//! - `render.rs` - Canvas painting, built-in assets and the credit overlay
//! - `window.rs` - X11 desktop-type windows
//! - `timer.rs` - Refresh timer scheduling
//! - `actions.rs` - Context menu actions handed to the shell
//! - `service.rs` / `dbus_client.rs` - D-Bus interface and its client
//! - `config.rs` - User configuration
//!
//! ## CLI Usage
//! - No arguments: Run the daemon
//! - `--render <out.png>`: Render the configured background to a PNG
//! - `--fetch`, `-f`: Fetch a community background into the cache (one-shot)
//! - `--refresh`: Ask the running daemon for a new community background
//! - `--status`: Show what the running daemon is doing
//! - `--set-source <value>`: Change the background source
//! - `--action <name>`: Run a context menu action
//! - `--help`, `-h`: Show help message

mod actions;     // Context menu actions and their delegation
mod cache;       // Cached community metadata + image
mod community;   // Community feed client
mod config;      // User configuration
mod daemon;      // Daemon main loop
mod dbus_client; // D-Bus client proxy (used by the CLI)
mod error;       // Crate error type
mod fetcher;     // Background state machine
mod render;      // Canvas painting
mod service;     // D-Bus service interface
mod timer;       // Refresh timer
mod window;      // X11 desktop windows

use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::cache::Cache;
use crate::community::HttpFeed;
use crate::config::{BackgroundSource, Config, ConfigStore};
use crate::dbus_client::{is_service_available, BackgroundClient};
use crate::fetcher::{BackgroundFetcher, FetcherContext, View};
use crate::render::{Geometry, Renderer};

/// Used by `--render` when no X display is reachable
const FALLBACK_GEOMETRY: Geometry = Geometry {
    width: 1920,
    height: 1080,
    scale: 1.0,
};

/// How long `--refresh` waits for the daemon to show the new background
const REFRESH_WAIT: Duration = Duration::from_secs(90);

/// Maximum number of attempts for `--fetch`
const MAX_RETRIES: u32 = 3;

/// Initial delay between retries in seconds, doubled each attempt.
const INITIAL_RETRY_DELAY_SECS: u64 = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let value = |flag: &str| -> anyhow::Result<String> {
        args.get(2)
            .cloned()
            .with_context(|| format!("{flag} needs a value (see --help)"))
    };

    match args.get(1).map(String::as_str) {
        None => daemon::run_daemon().await.context("background daemon failed"),
        Some("--render") => render_once(Path::new(&value("--render")?)).await,
        Some("--fetch" | "-f") => run_headless().await,
        Some("--refresh") => {
            let client = connect().await?;
            if client.refresh_and_wait(REFRESH_WAIT).await? {
                println!("New background shown");
            } else {
                println!("Refresh requested, no new background yet (see --status)");
            }
            Ok(())
        }
        Some("--status") => print_status().await,
        Some("--set-source") => set_source(&value("--set-source")?).await,
        Some("--action") => {
            let name = value("--action")?;
            let client = connect().await?;
            client.trigger_action(&name).await?;
            Ok(())
        }
        Some("--help" | "-h") => {
            print_help(&args[0]);
            Ok(())
        }
        Some("--version" | "-v") => {
            println!("shell-background {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown argument: {other}");
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    }
}

/// Prints help message
fn print_help(program: &str) {
    println!("Desktop background for X11 shells\n");
    println!("Usage: {} [OPTIONS]\n", program);
    println!("Options:");
    println!("  (none)                 Run the background daemon");
    println!("  --render <out.png>     Render the configured background to a PNG");
    println!("  --fetch, -f            Fetch a community background into the cache");
    println!("  --refresh              Ask the daemon for a new community background");
    println!("  --status               Show the daemon's refresh state");
    println!("  --set-source <value>   Set the background (inbuilt:<name>, community, or a file)");
    println!("  --action <name>        Run a context menu action:");
    for action in actions::Action::ALL {
        println!("                           {:<22} {}", action.as_str(), action.label());
    }
    println!("  --version, -v          Show version information");
    println!("  --help, -h             Show this help message");
    println!();
    println!("Built-in backgrounds: {}", render::builtin_names().join(", "));
}

async fn connect() -> anyhow::Result<BackgroundClient> {
    if !is_service_available().await {
        bail!("the background daemon is not running");
    }
    Ok(BackgroundClient::connect().await?)
}

/// Builds a fetcher context over the user's cache and the configured feed.
fn context(
    store: ConfigStore,
) -> anyhow::Result<(
    FetcherContext<HttpFeed>,
    tokio::sync::mpsc::UnboundedReceiver<fetcher::FetcherEvent>,
)> {
    let cache = Cache::user().context("could not determine config directory")?;
    let feed = HttpFeed::new(&store.config.feed_base)?;
    let (events, rx) = tokio::sync::mpsc::unbounded_channel();
    let ctx = FetcherContext {
        config: store.shared(),
        cache,
        feed: Arc::new(feed),
        renderer: Arc::new(Renderer::new()),
        events,
    };
    Ok((ctx, rx))
}

/// Renders the primary screen's background once and writes it as PNG.
async fn render_once(out: &Path) -> anyhow::Result<()> {
    let geometry = match window::detect_monitors() {
        Ok(monitors) => monitors.first().map(|m| m.geometry()).unwrap_or(FALLBACK_GEOMETRY),
        Err(e) => {
            tracing::info!("no X display ({e}), rendering at 1920x1080");
            FALLBACK_GEOMETRY
        }
    };

    let (ctx, _events) = context(ConfigStore::load())?;
    let renderer = ctx.renderer.clone();
    let mut fetcher = BackgroundFetcher::new(ctx, geometry, true).await;
    fetcher.drive().await;

    match fetcher.view() {
        View::Canvas(canvas) => canvas.save_png(out)?,
        View::Message(message) => renderer.placeholder(message, geometry)?.save_png(out)?,
    }
    println!("Rendered {} ({})", out.display(), fetcher.state().as_str());
    Ok(())
}

/// Fetches a new community background into the cache without a display.
///
/// Retries with exponential backoff: immediately, then after 10s and 20s.
async fn run_headless() -> anyhow::Result<()> {
    let (ctx, mut events) = context(ConfigStore::load())?;

    let mut fetched = false;
    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            let delay = INITIAL_RETRY_DELAY_SECS * (1 << (attempt - 1));
            println!("Retry {} of {} in {} seconds...", attempt, MAX_RETRIES - 1, delay);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        // Only `fetched` reaches the config file; the configured source stays as it is
        let mut fetcher =
            BackgroundFetcher::with_source(ctx.clone(), BackgroundSource::Community, FALLBACK_GEOMETRY, true)
                .await;
        let state = fetcher.refresh().await;
        if events.try_recv().is_ok() {
            fetched = true;
            break;
        }
        eprintln!("Fetch attempt {} failed (state: {})", attempt + 1, state.as_str());
    }

    if !fetched {
        bail!("all {MAX_RETRIES} attempts failed");
    }
    let cache = Cache::user().context("could not determine config directory")?;
    match cache.read_metadata() {
        Ok(meta) => println!("Fetched: {}", meta.name.as_deref().unwrap_or("(untitled)")),
        Err(_) => println!("Fetched a community background"),
    }
    Ok(())
}

async fn print_status() -> anyhow::Result<()> {
    let client = connect().await?;
    println!("State:        {}", client.state().await?);
    let next = client.next_refresh().await?;
    println!("Next refresh: {}", if next.is_empty() { "-" } else { next.as_str() });
    if let Some(meta) = client.metadata().await? {
        let field = |f: &Option<String>| f.clone().unwrap_or_else(|| "-".to_string());
        println!("Name:         {}", field(&meta.name));
        println!("Location:     {}", field(&meta.location));
        println!("Author:       {}", field(&meta.author));
    }
    Ok(())
}

/// Changes the source through the daemon, or in the config file when no
/// daemon is running.
async fn set_source(source: &str) -> anyhow::Result<()> {
    if is_service_available().await {
        BackgroundClient::connect().await?.set_source(source).await?;
    } else {
        let mut config = Config::load();
        config.background = source.to_string();
        config.save()?;
    }
    println!("Background source set to {source}");
    Ok(())
}
