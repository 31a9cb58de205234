//! Backend selection.

use crate::capture::ScreenCapturer;
use crate::hyprland::HyprlandDesktop;
use crate::macos::MacDesktop;
use crate::window::WindowLocator;
use callwatch_core::BackendKind;
use std::time::Duration;

/// A desktop session that can find, raise and capture windows.
pub trait Desktop: WindowLocator + ScreenCapturer + Send {
    fn name(&self) -> &'static str;
}

impl Desktop for HyprlandDesktop {
    fn name(&self) -> &'static str {
        "hyprland"
    }
}

impl Desktop for MacDesktop {
    fn name(&self) -> &'static str {
        "macos"
    }
}

/// Build the configured backend, probing the session for `Auto`.
pub fn open_desktop(kind: BackendKind, command_timeout: Duration) -> Box<dyn Desktop> {
    let resolved = match kind {
        BackendKind::Auto => probe(std::env::var_os("HYPRLAND_INSTANCE_SIGNATURE").is_some()),
        other => other,
    };

    let desktop: Box<dyn Desktop> = match resolved {
        BackendKind::MacOs => Box::new(MacDesktop::new(command_timeout)),
        _ => Box::new(HyprlandDesktop::new(command_timeout)),
    };
    tracing::info!(requested = ?kind, backend = desktop.name(), "desktop backend selected");
    desktop
}

fn probe(hyprland_session: bool) -> BackendKind {
    if cfg!(target_os = "macos") {
        BackendKind::MacOs
    } else {
        if !hyprland_session {
            tracing::warn!("HYPRLAND_INSTANCE_SIGNATURE unset; assuming Hyprland anyway");
        }
        BackendKind::Hyprland
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_backend_wins() {
        assert_eq!(open_desktop(BackendKind::MacOs, Duration::from_secs(1)).name(), "macos");
        assert_eq!(open_desktop(BackendKind::Hyprland, Duration::from_secs(1)).name(), "hyprland");
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_probe_non_mac_is_hyprland() {
        assert_eq!(probe(true), BackendKind::Hyprland);
        assert_eq!(probe(false), BackendKind::Hyprland);
    }
}
