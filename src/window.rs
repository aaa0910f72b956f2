//! # X11 Desktop Window
//!
//! One window per monitor, tagged `_NET_WM_WINDOW_TYPE_DESKTOP` so the window
//! manager keeps it below everything else, undecorated and out of the task list.
//!
//! The X connection is blocking, so windows live on their own OS thread
//! ([`spawn_window_thread`]). The daemon sends finished canvases over a std
//! channel; the thread repaints on `Expose` and reports right clicks back.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use x11rb::connection::Connection;
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::xproto::{
    AtomEnum, ConnectionExt as _, CreateGCAux, CreateWindowAux, EventMask, Gcontext, ImageFormat,
    PropMode, Screen, Window, WindowClass,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::error::Result;
use crate::render::{Canvas, Geometry};

/// Poll interval of the window thread
const POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Right mouse button
const CONTEXT_BUTTON: u8 = 3;

/// A monitor rectangle in root window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Monitor {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub primary: bool,
    /// UI scale derived from the physical size (1.0 at 96 DPI)
    pub scale: f32,
}

impl Monitor {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(u32::from(self.width), u32::from(self.height)).with_scale(self.scale)
    }
}

fn dpi_scale(pixels: u16, millimeters: u32) -> f32 {
    if millimeters == 0 {
        return 1.0;
    }
    let dpi = f32::from(pixels) / millimeters as f32 * 25.4;
    (dpi / 96.0).max(1.0)
}

fn whole_screen(screen: &Screen) -> Monitor {
    Monitor {
        x: 0,
        y: 0,
        width: screen.width_in_pixels,
        height: screen.height_in_pixels,
        primary: true,
        scale: dpi_scale(screen.width_in_pixels, u32::from(screen.width_in_millimeters)),
    }
}

/// Lists active monitors, primary first.
///
/// Falls back to the whole root window when RandR 1.5 is not available.
pub fn query_monitors(conn: &impl Connection, screen: &Screen) -> Vec<Monitor> {
    let reply = conn
        .randr_get_monitors(screen.root, true)
        .map_err(crate::error::Error::from)
        .and_then(|cookie| Ok(cookie.reply()?));

    let mut monitors: Vec<Monitor> = match reply {
        Ok(reply) => reply
            .monitors
            .iter()
            .map(|m| Monitor {
                x: m.x,
                y: m.y,
                width: m.width,
                height: m.height,
                primary: m.primary,
                scale: dpi_scale(m.width, m.width_in_millimeters),
            })
            .collect(),
        Err(e) => {
            tracing::debug!("RandR monitors unavailable: {e}");
            Vec::new()
        }
    };

    if monitors.is_empty() {
        monitors.push(whole_screen(screen));
    }
    // Stable sort keeps RandR order among non-primary monitors
    monitors.sort_by_key(|m| !m.primary);
    monitors
}

/// Connects to the X server and lists its monitors.
pub fn detect_monitors() -> Result<Vec<Monitor>> {
    let (conn, screen_num) = x11rb::connect(None)?;
    let screen = &conn.setup().roots[screen_num];
    Ok(query_monitors(&conn, screen))
}

/// One desktop-type window covering a monitor.
pub struct DesktopWindow {
    window: Window,
    gc: Gcontext,
    depth: u8,
    monitor: Monitor,
    canvas: Option<Canvas>,
}

impl DesktopWindow {
    /// Creates the window (unmapped).
    pub fn create(conn: &impl Connection, screen: &Screen, monitor: Monitor) -> Result<Self> {
        let window = conn.generate_id()?;
        conn.create_window(
            screen.root_depth,
            window,
            screen.root,
            monitor.x,
            monitor.y,
            monitor.width,
            monitor.height,
            0,
            WindowClass::INPUT_OUTPUT,
            screen.root_visual,
            &CreateWindowAux::new()
                .background_pixel(screen.black_pixel)
                .event_mask(EventMask::EXPOSURE | EventMask::BUTTON_PRESS),
        )?;

        conn.change_property8(
            PropMode::REPLACE,
            window,
            AtomEnum::WM_NAME,
            AtomEnum::STRING,
            b"Desktop Background",
        )?;

        let gc = conn.generate_id()?;
        conn.create_gc(gc, window, &CreateGCAux::new())?;

        if screen.root_depth != 24 && screen.root_depth != 32 {
            tracing::warn!(depth = screen.root_depth, "unexpected visual depth, colors may be wrong");
        }

        Ok(Self {
            window,
            gc,
            depth: screen.root_depth,
            monitor,
            canvas: None,
        })
    }

    pub fn id(&self) -> Window {
        self.window
    }

    /// Marks the window as the desktop and maps it.
    pub fn show(&self, conn: &impl Connection) -> Result<()> {
        let window_type = conn.intern_atom(false, b"_NET_WM_WINDOW_TYPE")?.reply()?.atom;
        let desktop = conn
            .intern_atom(false, b"_NET_WM_WINDOW_TYPE_DESKTOP")?
            .reply()?
            .atom;
        conn.change_property32(PropMode::REPLACE, self.window, window_type, AtomEnum::ATOM, &[desktop])?;

        conn.map_window(self.window)?;
        conn.flush()?;
        Ok(())
    }

    /// Replaces the displayed canvas and paints it.
    pub fn set_canvas(&mut self, conn: &impl Connection, canvas: Canvas) -> Result<()> {
        self.canvas = Some(canvas);
        self.repaint(conn)
    }

    /// Uploads the current canvas, split into requests the server accepts.
    pub fn repaint(&self, conn: &impl Connection) -> Result<()> {
        let Some(canvas) = &self.canvas else {
            return Ok(());
        };

        let width = canvas.width().min(u32::from(self.monitor.width)) as usize;
        let height = canvas.height().min(u32::from(self.monitor.height)) as usize;
        if width == 0 || height == 0 {
            return Ok(());
        }
        let stride = canvas.width() as usize * 4;
        let pixels = canvas.to_bgrx();

        // Leave room for the PutImage request header
        let max_bytes = conn.maximum_request_bytes().saturating_sub(64);
        let rows_per_chunk = (max_bytes / (width * 4)).max(1);

        let mut row = 0;
        while row < height {
            let rows = rows_per_chunk.min(height - row);
            let mut chunk = Vec::with_capacity(rows * width * 4);
            for r in row..row + rows {
                let start = r * stride;
                chunk.extend_from_slice(&pixels[start..start + width * 4]);
            }
            conn.put_image(
                ImageFormat::Z_PIXMAP,
                self.window,
                self.gc,
                width as u16,
                rows as u16,
                0,
                row as i16,
                0,
                self.depth,
                &chunk,
            )?;
            row += rows;
        }
        conn.flush()?;
        Ok(())
    }
}

/// Messages from the daemon to the window thread
#[derive(Debug)]
pub enum WindowCommand {
    /// Show `canvas` on screen `screen` (index into the monitor list)
    Present { screen: usize, canvas: Canvas },
    Quit,
}

/// Messages from the window thread to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    /// Right click at root coordinates
    ContextMenu { screen: usize, x: i16, y: i16 },
    /// The X connection went away
    Closed,
}

/// Runs the windows until [`WindowCommand::Quit`] or the X connection drops.
fn run_windows(
    conn: RustConnection,
    screen_num: usize,
    monitors: Vec<Monitor>,
    commands: Receiver<WindowCommand>,
    events: UnboundedSender<WindowEvent>,
) -> Result<()> {
    let screen = conn.setup().roots[screen_num].clone();
    let mut windows = Vec::with_capacity(monitors.len());
    for monitor in &monitors {
        let window = DesktopWindow::create(&conn, &screen, *monitor)?;
        window.show(&conn)?;
        windows.push(window);
    }
    tracing::info!(count = windows.len(), "desktop windows mapped");

    loop {
        while let Some(event) = conn.poll_for_event()? {
            match event {
                Event::Expose(e) if e.count == 0 => {
                    if let Some(w) = windows.iter().find(|w| w.id() == e.window) {
                        w.repaint(&conn)?;
                    }
                }
                Event::ButtonPress(e) if e.detail == CONTEXT_BUTTON => {
                    if let Some(screen) = windows.iter().position(|w| w.id() == e.event) {
                        let _ = events.send(WindowEvent::ContextMenu {
                            screen,
                            x: e.root_x,
                            y: e.root_y,
                        });
                    }
                }
                _ => {}
            }
        }

        loop {
            match commands.try_recv() {
                Ok(WindowCommand::Present { screen, canvas }) => match windows.get_mut(screen) {
                    Some(w) => w.set_canvas(&conn, canvas)?,
                    None => tracing::warn!(screen, "no window for screen"),
                },
                Ok(WindowCommand::Quit) | Err(TryRecvError::Disconnected) => return Ok(()),
                Err(TryRecvError::Empty) => break,
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Opens the display, creates one window per monitor on a new thread and
/// returns the monitors in screen-index order.
pub fn spawn_window_thread(
    commands: Receiver<WindowCommand>,
    events: UnboundedSender<WindowEvent>,
) -> Result<(Vec<Monitor>, std::thread::JoinHandle<()>)> {
    let (conn, screen_num) = x11rb::connect(None)?;
    let monitors = query_monitors(&conn, &conn.setup().roots[screen_num]);
    let thread_monitors = monitors.clone();

    let handle = std::thread::Builder::new()
        .name("x11-windows".to_string())
        .spawn(move || {
            if let Err(e) = run_windows(conn, screen_num, thread_monitors, commands, events.clone()) {
                tracing::error!("desktop window thread stopped: {e}");
            }
            let _ = events.send(WindowEvent::Closed);
        })?;

    Ok((monitors, handle))
}
