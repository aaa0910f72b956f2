//! # Background Service Module
//!
//! Exposes the background daemon on the session bus so the shell (and the
//! CLI) can steer it and hear about new backgrounds.
//!
//! ## D-Bus Interface
//!
//! Service name: `org.shellbackground.Background1`
//! Object path: `/org/shellbackground/Background1`
//!
//! ### Methods
//! - `Refresh()` - Fetch a new community background now
//! - `Reload()` - Re-create the background views from config and cache
//! - `GetSource()` / `SetSource(source)` - Background source string
//! - `GetShowLabels()` / `SetShowLabels(show)` - Credit labels on community images
//! - `GetWaitTime()` / `SetWaitTime(minutes)` - Community refresh interval
//! - `GetState()` - Refresh state of the primary screen
//! - `GetMetadata()` - Cached community metadata as JSON (empty if none)
//! - `GetNextRefresh()` - Next scheduled community refresh (empty if none)
//! - `GetContextMenu()` - Desktop context menu sections
//! - `TriggerAction(name)` - Run a context-menu action
//!
//! ### Signals
//! - `ReloadBackground()` - A newer background is shown
//! - `NewCommunityBackgroundDownloaded()` - First community background arrived
//! - `ShowInfoPane(pane)` - The shell should open its info pane at `pane`
//! - `ChangeBackgroundRequested()` - The shell should open its background picker
//! - `ContextMenuRequested(x, y)` - Right click on the desktop at root coordinates

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use zbus::{interface, SignalContext};

use crate::actions::{context_menu, Action};
use crate::cache::Cache;
use crate::config::SharedConfig;

/// D-Bus service name, unique on the session bus
pub const SERVICE_NAME: &str = "org.shellbackground.Background1";

/// D-Bus object path of the interface
pub const OBJECT_PATH: &str = "/org/shellbackground/Background1";

/// Requests the D-Bus interface (and timers, watchers) hand to the daemon loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCommand {
    /// Start a fresh community fetch
    Refresh,
    /// The refresh timer expired
    TimerFired,
    /// Re-create all views
    Reload,
    /// Wait time or fetch history changed: re-arm the timer
    RescheduleTimer,
    /// `config.json` changed on disk
    ConfigChanged,
    Action(Action),
}

/// Snapshot of the daemon published to D-Bus readers.
#[derive(Debug, Clone, Default)]
pub struct DaemonStatus {
    pub state: String,
    pub next_refresh: String,
}

pub type SharedStatus = Arc<RwLock<DaemonStatus>>;

/// The D-Bus interface implementation.
///
/// Reads are answered from shared state; anything that changes what is on
/// screen is forwarded to the daemon loop as a [`DaemonCommand`].
pub struct BackgroundService {
    config: SharedConfig,
    cache: Cache,
    status: SharedStatus,
    commands: UnboundedSender<DaemonCommand>,
}

impl BackgroundService {
    pub fn new(
        config: SharedConfig,
        cache: Cache,
        status: SharedStatus,
        commands: UnboundedSender<DaemonCommand>,
    ) -> Self {
        Self {
            config,
            cache,
            status,
            commands,
        }
    }

    fn send(&self, command: DaemonCommand) -> zbus::fdo::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| zbus::fdo::Error::Failed("background daemon is shutting down".to_string()))
    }

    /// Applies `change` to the config, saves it and forwards `then`.
    async fn update_config(
        &self,
        change: impl FnOnce(&mut crate::config::Config),
        then: DaemonCommand,
    ) -> zbus::fdo::Result<()> {
        {
            let mut store = self.config.write().await;
            change(&mut store.config);
            store
                .save()
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        }
        self.send(then)
    }
}

#[interface(name = "org.shellbackground.Background1")]
impl BackgroundService {
    /// Fetch a new community background now
    async fn refresh(&self) -> zbus::fdo::Result<()> {
        self.send(DaemonCommand::Refresh)
    }

    /// Re-create the background views
    async fn reload(&self) -> zbus::fdo::Result<()> {
        self.send(DaemonCommand::Reload)
    }

    async fn get_source(&self) -> String {
        self.config.read().await.config.background.clone()
    }

    async fn set_source(&self, source: String) -> zbus::fdo::Result<()> {
        if source.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("empty background source".to_string()));
        }
        self.update_config(|c| c.background = source, DaemonCommand::Reload)
            .await
    }

    async fn get_show_labels(&self) -> bool {
        self.config.read().await.config.show_labels
    }

    async fn set_show_labels(&self, show: bool) -> zbus::fdo::Result<()> {
        self.update_config(|c| c.show_labels = show, DaemonCommand::Reload)
            .await
    }

    async fn get_wait_time(&self) -> u32 {
        self.config.read().await.config.wait_time
    }

    async fn set_wait_time(&self, minutes: u32) -> zbus::fdo::Result<()> {
        if minutes == 0 {
            return Err(zbus::fdo::Error::InvalidArgs("wait time must be at least one minute".to_string()));
        }
        self.update_config(|c| c.wait_time = minutes, DaemonCommand::RescheduleTimer)
            .await
    }

    async fn get_state(&self) -> String {
        self.status.read().await.state.clone()
    }

    /// Cached community metadata as JSON, empty if nothing valid is cached
    async fn get_metadata(&self) -> String {
        self.cache
            .read_metadata()
            .ok()
            .and_then(|m| serde_json::to_string(&m).ok())
            .unwrap_or_default()
    }

    async fn get_next_refresh(&self) -> String {
        self.status.read().await.next_refresh.clone()
    }

    /// Sections of (title, [(action name, label)])
    async fn get_context_menu(&self) -> Vec<(String, Vec<(String, String)>)> {
        context_menu()
            .into_iter()
            .map(|(title, actions)| {
                (
                    title.to_string(),
                    actions
                        .into_iter()
                        .map(|a| (a.as_str().to_string(), a.label().to_string()))
                        .collect(),
                )
            })
            .collect()
    }

    async fn trigger_action(&self, name: String) -> zbus::fdo::Result<()> {
        let action = name
            .parse::<Action>()
            .map_err(zbus::fdo::Error::InvalidArgs)?;
        self.send(DaemonCommand::Action(action))
    }

    // === Signals ===

    #[zbus(signal)]
    pub async fn reload_background(ctx: &SignalContext<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn new_community_background_downloaded(ctx: &SignalContext<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn show_info_pane(ctx: &SignalContext<'_>, pane: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn change_background_requested(ctx: &SignalContext<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn context_menu_requested(ctx: &SignalContext<'_>, x: i32, y: i32) -> zbus::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigStore};

    fn service() -> (
        BackgroundService,
        tokio::sync::mpsc::UnboundedReceiver<DaemonCommand>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::load_from(dir.path().join("config.json")).shared();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let svc = BackgroundService::new(
            config,
            Cache::new(dir.path()),
            SharedStatus::default(),
            tx,
        );
        (svc, rx, dir)
    }

    #[tokio::test]
    async fn test_set_source_saves_and_reloads() {
        let (svc, mut rx, dir) = service();
        svc.set_source("community".to_string()).await.unwrap();

        assert_eq!(rx.recv().await, Some(DaemonCommand::Reload));
        let saved = Config::load_from(&dir.path().join("config.json"));
        assert_eq!(saved.background, "community");
        assert_eq!(svc.get_source().await, "community");
    }

    #[tokio::test]
    async fn test_wait_time_reschedules() {
        let (svc, mut rx, _dir) = service();
        svc.set_wait_time(45).await.unwrap();
        assert_eq!(rx.recv().await, Some(DaemonCommand::RescheduleTimer));
        assert_eq!(svc.get_wait_time().await, 45);
        assert!(svc.set_wait_time(0).await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_action_validates_name() {
        let (svc, mut rx, _dir) = service();
        svc.trigger_action("change-background".to_string()).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(DaemonCommand::Action(Action::ChangeBackground))
        );
        assert!(svc.trigger_action("format-disk".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_metadata_empty_without_cache() {
        let (svc, _rx, _dir) = service();
        assert_eq!(svc.get_metadata().await, "");
        assert_eq!(svc.get_context_menu().await.len(), 2);
    }
}
