//! # D-Bus Client Module
//!
//! Client side of the background service, used by the CLI (`--refresh`,
//! `--set-source`, `--action`) to steer a running daemon.
//!
//! ```ignore
//! let client = BackgroundClient::connect().await?;
//! client.set_source("community").await?;
//! client.refresh_and_wait(Duration::from_secs(90)).await?;
//! println!("{}", client.state().await?);
//! ```

use futures_util::StreamExt;
use std::time::Duration;
use zbus::{proxy, Connection};

use crate::community::CommunityMetadata;
use crate::service::SERVICE_NAME;

/// D-Bus proxy for the background service
#[proxy(
    interface = "org.shellbackground.Background1",
    default_service = "org.shellbackground.Background1",
    default_path = "/org/shellbackground/Background1"
)]
trait Background {
    async fn refresh(&self) -> zbus::Result<()>;

    async fn reload(&self) -> zbus::Result<()>;

    async fn get_source(&self) -> zbus::Result<String>;

    async fn set_source(&self, source: &str) -> zbus::Result<()>;

    async fn get_show_labels(&self) -> zbus::Result<bool>;

    async fn set_show_labels(&self, show: bool) -> zbus::Result<()>;

    async fn get_wait_time(&self) -> zbus::Result<u32>;

    async fn set_wait_time(&self, minutes: u32) -> zbus::Result<()>;

    async fn get_state(&self) -> zbus::Result<String>;

    async fn get_metadata(&self) -> zbus::Result<String>;

    async fn get_next_refresh(&self) -> zbus::Result<String>;

    async fn get_context_menu(&self) -> zbus::Result<Vec<(String, Vec<(String, String)>)>>;

    async fn trigger_action(&self, name: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn reload_background(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn new_community_background_downloaded(&self) -> zbus::Result<()>;
}

/// High-level client for a running background daemon
pub struct BackgroundClient {
    proxy: BackgroundProxy<'static>,
}

impl BackgroundClient {
    /// Connects to the daemon. Fails if none is registered on the bus.
    pub async fn connect() -> zbus::Result<Self> {
        let connection = Connection::session().await?;
        let proxy = BackgroundProxy::new(&connection).await?;
        Ok(Self { proxy })
    }

    pub async fn set_source(&self, source: &str) -> zbus::Result<()> {
        self.proxy.set_source(source).await
    }

    pub async fn trigger_action(&self, name: &str) -> zbus::Result<()> {
        self.proxy.trigger_action(name).await
    }

    pub async fn state(&self) -> zbus::Result<String> {
        self.proxy.get_state().await
    }

    pub async fn next_refresh(&self) -> zbus::Result<String> {
        self.proxy.get_next_refresh().await
    }

    /// Metadata of the cached community background, if any.
    pub async fn metadata(&self) -> zbus::Result<Option<CommunityMetadata>> {
        let json = self.proxy.get_metadata().await?;
        if json.is_empty() {
            return Ok(None);
        }
        Ok(CommunityMetadata::parse(json.as_bytes()).ok())
    }

    /// Requests a refresh and waits for `ReloadBackground` or the
    /// first-download signal. Returns `false` if none arrived within `timeout`.
    pub async fn refresh_and_wait(&self, timeout: Duration) -> zbus::Result<bool> {
        // Subscribe first so a fast daemon cannot beat us to the signal
        let mut reloads = self.proxy.receive_reload_background().await?;
        let mut downloads = self.proxy.receive_new_community_background_downloaded().await?;
        self.proxy.refresh().await?;

        let arrived = async {
            tokio::select! {
                _ = reloads.next() => {}
                _ = downloads.next() => {}
            }
        };
        Ok(tokio::time::timeout(timeout, arrived).await.is_ok())
    }
}

/// Check if the daemon is running and registered on D-Bus
pub async fn is_service_available() -> bool {
    if let Ok(connection) = Connection::session().await {
        connection
            .call_method(
                Some("org.freedesktop.DBus"),
                "/org/freedesktop/DBus",
                Some("org.freedesktop.DBus"),
                "NameHasOwner",
                &SERVICE_NAME,
            )
            .await
            .and_then(|reply| reply.body().deserialize::<bool>())
            .unwrap_or(false)
    } else {
        false
    }
}
