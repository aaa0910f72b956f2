//! # Background Daemon
//!
//! The main loop: owns one [`BackgroundFetcher`] per monitor, the refresh
//! timer, the X11 window thread and the D-Bus service.
//!
//! Every state transition happens on this loop, so at most one community
//! fetch chain runs at a time. Other tasks only send [`DaemonCommand`]s.
//!
//! ```text
//!  D-Bus ─┐
//!  timer ─┼─▶ commands ─▶ loop ─▶ fetchers ─▶ canvases ─▶ window thread
//!  notify ┘                  ▲                                 │
//!                            └──────── right clicks ───────────┘
//! ```

use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use zbus::SignalContext;

use crate::actions::{spawn_detached, Action, Delegation};
use crate::cache::Cache;
use crate::community::{Feed, HttpFeed};
use crate::config::{ConfigStore, SharedConfig};
use crate::error::{Error, Result};
use crate::fetcher::{BackgroundFetcher, FetcherContext, FetcherEvent, View};
use crate::render::Renderer;
use crate::service::{
    BackgroundService, DaemonCommand, DaemonStatus, SharedStatus, OBJECT_PATH, SERVICE_NAME,
};
use crate::timer::RefreshTimer;
use crate::window::{spawn_window_thread, Monitor, WindowCommand, WindowEvent};

/// One unit of work for the loop
#[derive(Debug)]
enum Work {
    Command(DaemonCommand),
    Fetcher(FetcherEvent),
    Window(WindowEvent),
}

struct Daemon<F> {
    ctx: FetcherContext<F>,
    monitors: Vec<Monitor>,
    /// Index 0 is the primary monitor and the only image getter
    views: Vec<BackgroundFetcher<F>>,
    timer: RefreshTimer,
    status: SharedStatus,
    commands: UnboundedSender<DaemonCommand>,
    windows: std::sync::mpsc::Sender<WindowCommand>,
    dbus: Option<zbus::Connection>,
}

impl<F: Feed> Daemon<F> {
    fn new(
        ctx: FetcherContext<F>,
        monitors: Vec<Monitor>,
        status: SharedStatus,
        commands: UnboundedSender<DaemonCommand>,
        windows: std::sync::mpsc::Sender<WindowCommand>,
        dbus: Option<zbus::Connection>,
    ) -> Self {
        Self {
            ctx,
            monitors,
            views: Vec::new(),
            timer: RefreshTimer::new(),
            status,
            commands,
            windows,
            dbus,
        }
    }

    /// Handles one unit of work. Returns `true` when the daemon should exit.
    async fn handle(&mut self, work: Work) -> bool {
        match work {
            Work::Command(command) => self.handle_command(command).await,
            Work::Fetcher(event) => self.handle_fetcher_event(event).await,
            Work::Window(WindowEvent::ContextMenu { screen, x, y }) => {
                tracing::debug!(screen, x, y, "context menu requested");
                self.signal(|ctx| async move {
                    BackgroundService::context_menu_requested(&ctx, i32::from(x), i32::from(y)).await
                })
                .await;
            }
            Work::Window(WindowEvent::Closed) => {
                tracing::info!("X connection closed, exiting");
                return true;
            }
        }
        false
    }

    /// Re-creates every view from the current config and cache.
    async fn rebuild_views(&mut self) {
        self.views.clear();
        for (i, monitor) in self.monitors.iter().enumerate() {
            let fetcher = BackgroundFetcher::new(self.ctx.clone(), monitor.geometry(), i == 0).await;
            self.views.push(fetcher);
        }
        for i in 0..self.views.len() {
            self.drive_view(i).await;
        }
        self.reschedule().await;
    }

    /// Re-creates only the secondary screens (they wait on the primary's download).
    async fn rebuild_secondary_views(&mut self) {
        for i in 1..self.views.len() {
            let geometry = self.monitors[i].geometry();
            self.views[i] = BackgroundFetcher::new(self.ctx.clone(), geometry, false).await;
            self.drive_view(i).await;
        }
    }

    async fn drive_view(&mut self, index: usize) {
        self.views[index].drive().await;
        self.present(index);
    }

    /// Sends what screen `index` should show to the window thread.
    fn present(&self, index: usize) {
        let fetcher = &self.views[index];
        let canvas = match fetcher.view() {
            View::Canvas(canvas) => Ok(canvas.clone()),
            View::Message(message) => self.ctx.renderer.placeholder(message, fetcher.geometry()),
        };
        match canvas {
            Ok(canvas) => {
                let _ = self.windows.send(WindowCommand::Present {
                    screen: index,
                    canvas,
                });
            }
            Err(e) => tracing::warn!(screen = index, "failed to paint view: {e}"),
        }
    }

    /// Re-arms the refresh timer from the recorded fetch time.
    async fn reschedule(&mut self) {
        if !self.views.first().is_some_and(|v| v.schedules_refresh()) {
            self.timer.cancel();
            self.publish_status().await;
            return;
        }

        let (fetched, wait_time) = {
            let store = self.ctx.config.read().await;
            (store.config.fetched, store.config.wait_time)
        };
        let due_now = self
            .timer
            .schedule(fetched, wait_time, self.commands.clone(), DaemonCommand::TimerFired);
        if due_now {
            let _ = self.commands.send(DaemonCommand::TimerFired);
        }
        self.publish_status().await;
    }

    async fn publish_status(&self) {
        let mut status = self.status.write().await;
        *status = DaemonStatus {
            state: self
                .views
                .first()
                .map(|v| v.state().as_str().to_string())
                .unwrap_or_default(),
            next_refresh: self.timer.next_run_string(),
        };
    }

    async fn refresh(&mut self) {
        if self.views.is_empty() {
            return;
        }
        tracing::info!("refreshing community background");
        self.views[0].refresh().await;
        self.present(0);
        self.reschedule().await;
    }

    async fn handle_command(&mut self, command: DaemonCommand) {
        match command {
            DaemonCommand::Refresh | DaemonCommand::TimerFired => self.refresh().await,
            DaemonCommand::Reload => self.rebuild_views().await,
            DaemonCommand::RescheduleTimer => self.reschedule().await,
            DaemonCommand::ConfigChanged => {
                let changed = {
                    let mut store = self.ctx.config.write().await;
                    let before = store.config.clone();
                    store.reload();
                    before != store.config
                };
                if changed {
                    tracing::info!("config changed on disk, reloading");
                    self.rebuild_views().await;
                }
            }
            DaemonCommand::Action(action) => self.run_action(action).await,
        }
    }

    async fn handle_fetcher_event(&mut self, event: FetcherEvent) {
        match event {
            FetcherEvent::ReloadBackground => {
                self.rebuild_views().await;
                self.signal(|ctx| async move { BackgroundService::reload_background(&ctx).await })
                    .await;
            }
            FetcherEvent::NewCommunityBackgroundDownloaded => {
                self.rebuild_secondary_views().await;
                self.signal(|ctx| async move {
                    BackgroundService::new_community_background_downloaded(&ctx).await
                })
                .await;
            }
        }
    }

    async fn run_action(&self, action: Action) {
        tracing::info!(%action, "context menu action");
        match action.delegation() {
            Delegation::InfoPane(pane) => {
                self.signal(|ctx| async move { BackgroundService::show_info_pane(&ctx, pane).await })
                    .await;
            }
            Delegation::Spawn(cmd) => {
                if let Err(e) = spawn_detached(cmd) {
                    tracing::warn!("failed to start {cmd}: {e}");
                }
            }
            Delegation::BackgroundPicker => {
                self.signal(|ctx| async move {
                    BackgroundService::change_background_requested(&ctx).await
                })
                .await;
            }
        }
    }

    /// Emits a D-Bus signal, if the bus is available.
    async fn signal<E, Fut>(&self, emit: E)
    where
        E: FnOnce(SignalContext<'static>) -> Fut,
        Fut: std::future::Future<Output = zbus::Result<()>>,
    {
        let Some(conn) = &self.dbus else {
            return;
        };
        let result = match SignalContext::new(conn, OBJECT_PATH) {
            Ok(ctx) => emit(ctx.into_owned()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("failed to emit D-Bus signal: {e}");
        }
    }
}

/// Registers the D-Bus service. The daemon keeps running without it.
async fn connect_dbus(service: BackgroundService) -> Option<zbus::Connection> {
    match zbus::connection::Builder::session()
        .and_then(|b| b.name(SERVICE_NAME))
        .and_then(|b| b.serve_at(OBJECT_PATH, service))
    {
        Ok(builder) => match builder.build().await {
            Ok(conn) => {
                tracing::info!("D-Bus service running at {OBJECT_PATH} on {SERVICE_NAME}");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!("failed to build D-Bus connection: {e}");
                None
            }
        },
        Err(e) => {
            tracing::warn!("failed to configure D-Bus: {e}");
            None
        }
    }
}

/// Watches the config file for edits made by other processes.
fn watch_config(config: &ConfigStore, commands: UnboundedSender<DaemonCommand>) -> Option<RecommendedWatcher> {
    let path = config.path()?.to_path_buf();
    // Watch the parent directory since the file might be replaced atomically
    let watch_dir = path.parent()?.to_path_buf();
    if let Err(e) = std::fs::create_dir_all(&watch_dir) {
        tracing::warn!("cannot create config directory: {e}");
        return None;
    }

    let notify_config = NotifyConfig::default().with_poll_interval(Duration::from_secs(1));
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let touches_config = event.paths.iter().any(|p| p == &path);
                if touches_config
                    && matches!(
                        event.kind,
                        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
                    )
                {
                    let _ = commands.send(DaemonCommand::ConfigChanged);
                }
            }
        },
        notify_config,
    )
    .ok()?;

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::warn!("cannot watch config directory: {e}");
        return None;
    }
    Some(watcher)
}

/// Runs the background daemon until the X connection closes or Ctrl+C.
pub async fn run_daemon() -> Result<()> {
    let store = ConfigStore::load();
    let cache = Cache::user()
        .ok_or_else(|| Error::Config("could not determine config directory".to_string()))?;
    let feed = Arc::new(HttpFeed::new(&store.config.feed_base)?);

    let (command_tx, mut command_rx) = unbounded_channel();
    let _watcher = watch_config(&store, command_tx.clone());
    let config: SharedConfig = store.shared();

    // Font discovery scans the disk; keep it off the async workers
    let renderer = tokio::task::spawn_blocking(Renderer::new)
        .await
        .map_err(|e| Error::Config(format!("renderer setup failed: {e}")))?;

    let (fetch_tx, mut fetch_rx) = unbounded_channel();
    let ctx = FetcherContext {
        config: config.clone(),
        cache: cache.clone(),
        feed,
        renderer: Arc::new(renderer),
        events: fetch_tx,
    };

    let (window_tx, window_rx) = std::sync::mpsc::channel();
    let (window_event_tx, mut window_event_rx): (_, UnboundedReceiver<WindowEvent>) =
        unbounded_channel();
    let (monitors, window_thread) = spawn_window_thread(window_rx, window_event_tx)?;
    tracing::info!(?monitors, "monitors detected");

    let status = SharedStatus::default();
    let service = BackgroundService::new(config, cache, status.clone(), command_tx.clone());
    let dbus = connect_dbus(service).await;

    let mut daemon = Daemon::new(ctx, monitors, status, command_tx, window_tx, dbus);

    // Ctrl+C also cuts work in progress short
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let interrupted = tokio::select! {
        _ = daemon.rebuild_views() => false,
        _ = &mut shutdown => true,
    };
    if !interrupted {
        loop {
            let work = tokio::select! {
                Some(command) = command_rx.recv() => Work::Command(command),
                Some(event) = fetch_rx.recv() => Work::Fetcher(event),
                Some(event) = window_event_rx.recv() => Work::Window(event),
                _ = &mut shutdown => break,
            };
            let exit = tokio::select! {
                exit = daemon.handle(work) => exit,
                _ = &mut shutdown => true,
            };
            if exit {
                break;
            }
        }
    }
    tracing::info!("shutting down");

    daemon.timer.cancel();
    let _ = daemon.windows.send(WindowCommand::Quit);
    let _ = window_thread.join();
    Ok(())
}
