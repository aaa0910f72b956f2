//! # Error Types
//!
//! One error enum for the whole crate. Fetch and render code paths return
//! [`Result`], and the daemon decides per call site whether a failure falls
//! back to the cached background or to a placeholder.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level HTTP failure (connect, timeout, non-2xx status)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("SVG error: {0}")]
    Svg(String),

    /// The feed answered, but not with what we asked for
    #[error("community feed: {0}")]
    Feed(String),

    #[error("X11 error: {0}")]
    X11(String),

    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking render job panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<x11rb::errors::ConnectError> for Error {
    fn from(e: x11rb::errors::ConnectError) -> Self {
        Error::X11(e.to_string())
    }
}

impl From<x11rb::errors::ConnectionError> for Error {
    fn from(e: x11rb::errors::ConnectionError) -> Self {
        Error::X11(e.to_string())
    }
}

impl From<x11rb::errors::ReplyError> for Error {
    fn from(e: x11rb::errors::ReplyError) -> Self {
        Error::X11(e.to_string())
    }
}

impl From<x11rb::errors::ReplyOrIdError> for Error {
    fn from(e: x11rb::errors::ReplyOrIdError) -> Self {
        Error::X11(e.to_string())
    }
}

impl From<resvg::usvg::Error> for Error {
    fn from(e: resvg::usvg::Error) -> Self {
        Error::Svg(e.to_string())
    }
}
