//! Desktop context-menu actions.
//!
//! The background owns none of these features: each action is handed to the
//! shell component that does (over D-Bus signals) or to an external program.

use std::fmt;
use std::str::FromStr;

/// Program launched for "Open System Settings"
const SYSTEM_SETTINGS_COMMAND: &str = "systemsettings5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Clock/status pane of the shell's info pane
    OpenStatusCenter,
    /// Settings pane of the shell's info pane
    OpenShellSettings,
    /// The desktop environment's system settings program
    OpenSystemSettings,
    /// The shell's background picker
    ChangeBackground,
}

/// Who actually performs an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegation {
    /// Emit `ShowInfoPane(pane)` for the shell
    InfoPane(&'static str),
    /// Start a program, detached
    Spawn(&'static str),
    /// Emit `ChangeBackgroundRequested` for the shell
    BackgroundPicker,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::OpenStatusCenter,
        Action::OpenShellSettings,
        Action::OpenSystemSettings,
        Action::ChangeBackground,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::OpenStatusCenter => "open-status-center",
            Action::OpenShellSettings => "open-shell-settings",
            Action::OpenSystemSettings => "open-system-settings",
            Action::ChangeBackground => "change-background",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Action::OpenStatusCenter => "Open Status Center",
            Action::OpenShellSettings => "Open Shell Settings",
            Action::OpenSystemSettings => "Open System Settings",
            Action::ChangeBackground => "Change Background",
        }
    }

    pub fn delegation(self) -> Delegation {
        match self {
            Action::OpenStatusCenter => Delegation::InfoPane("clock"),
            Action::OpenShellSettings => Delegation::InfoPane("settings"),
            Action::OpenSystemSettings => Delegation::Spawn(SYSTEM_SETTINGS_COMMAND),
            Action::ChangeBackground => Delegation::BackgroundPicker,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action: {s}"))
    }
}

/// The desktop context menu as (section title, actions).
pub fn context_menu() -> Vec<(&'static str, Vec<Action>)> {
    vec![
        ("For desktop", vec![Action::ChangeBackground]),
        (
            "For system",
            vec![Action::OpenShellSettings, Action::OpenStatusCenter],
        ),
    ]
}

/// Checks if the application is running inside a Flatpak sandbox.
pub fn is_flatpak() -> bool {
    std::path::Path::new("/.flatpak-info").exists()
}

/// Spawns a command in the background on the host system (non-blocking).
///
/// Inside Flatpak the command is wrapped in `flatpak-spawn --host`.
pub fn spawn_host_command(cmd: &str) -> std::io::Result<std::process::Child> {
    if is_flatpak() {
        std::process::Command::new("flatpak-spawn")
            .args(["--host", cmd])
            .spawn()
    } else {
        std::process::Command::new(cmd).spawn()
    }
}

/// Starts `cmd` on the host and reaps it in the background once it exits.
///
/// Must be called from within a tokio runtime.
pub fn spawn_detached(
    cmd: &str,
) -> std::io::Result<tokio::task::JoinHandle<std::io::Result<std::process::ExitStatus>>> {
    let mut child = spawn_host_command(cmd)?;
    Ok(tokio::task::spawn_blocking(move || child.wait()))
}
