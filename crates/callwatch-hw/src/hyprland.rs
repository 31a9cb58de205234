//! Hyprland backend: `hyprctl` for windows, `grim` for pixels.

use crate::capture::{CaptureError, ScreenCapturer};
use crate::frame::{Frame, SequenceCounter};
use crate::process::run_with_timeout;
use crate::window::{FocusError, LocateError, ScreenRect, WindowHandle, WindowInfo, WindowLocator};
use serde::Deserialize;
use std::time::Duration;

/// One entry of `hyprctl clients -j`.
#[derive(Debug, Deserialize)]
struct HyprClient {
    address: String,
    #[serde(default)]
    title: String,
    at: [i32; 2],
    size: [i64; 2],
    #[serde(default = "default_true")]
    mapped: bool,
    #[serde(default)]
    hidden: bool,
}

fn default_true() -> bool {
    true
}

pub struct HyprlandDesktop {
    timeout: Duration,
    sequence: SequenceCounter,
}

impl HyprlandDesktop {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sequence: SequenceCounter::default(),
        }
    }
}

impl WindowLocator for HyprlandDesktop {
    fn list_windows(&self) -> Result<Vec<WindowInfo>, LocateError> {
        let out = run_with_timeout("hyprctl", &["clients", "-j"], self.timeout)?;
        parse_clients(&out)
    }

    fn focus(&self, handle: &WindowHandle) -> Result<(), FocusError> {
        let selector = format!("address:{handle}");
        let out = run_with_timeout("hyprctl", &["dispatch", "focuswindow", &selector], self.timeout)?;

        // hyprctl exits 0 even when the dispatcher refuses; the verdict is on stdout.
        let reply = String::from_utf8_lossy(&out).trim().to_string();
        if reply.is_empty() || reply.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(FocusError::Rejected {
                handle: handle.clone(),
                reason: reply,
            })
        }
    }
}

impl ScreenCapturer for HyprlandDesktop {
    fn capture(&self, rect: &ScreenRect) -> Result<Frame, CaptureError> {
        let geometry = grim_geometry(rect);
        let png = run_with_timeout("grim", &["-g", &geometry, "-t", "png", "-"], self.timeout)?;
        let frame = Frame::from_encoded(&png, self.sequence.next())?;
        tracing::debug!(%rect, sequence = frame.sequence, "grim capture");
        Ok(frame)
    }
}

/// `grim -g` geometry string: `"x,y wxh"`.
fn grim_geometry(rect: &ScreenRect) -> String {
    rect.to_string()
}

fn parse_clients(json: &[u8]) -> Result<Vec<WindowInfo>, LocateError> {
    let clients: Vec<HyprClient> = serde_json::from_slice(json).map_err(|e| LocateError::Parse(e.to_string()))?;
    Ok(clients
        .into_iter()
        .filter(|c| c.mapped && !c.hidden)
        .map(|c| WindowInfo {
            handle: WindowHandle(c.address),
            title: c.title,
            rect: ScreenRect::new(c.at[0], c.at[1], c.size[0], c.size[1]),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::select_target;

    const CLIENTS: &str = r#"[
        {"address": "0x55d1a0", "mapped": true, "hidden": false, "at": [0, 0], "size": [1280, 1440],
         "workspace": {"id": 1, "name": "1"}, "class": "kitty", "title": "nvim"},
        {"address": "0x55d1b8", "mapped": true, "hidden": true, "at": [10, 10], "size": [640, 480],
         "class": "firefox", "title": "Messenger call - hidden"},
        {"address": "0x55d2c0", "mapped": true, "hidden": false, "at": [1280, 36], "size": [1280, 1404],
         "class": "firefox", "title": "Messenger call - Mozilla Firefox"}
    ]"#;

    #[test]
    fn test_parse_clients_and_select() {
        let windows = parse_clients(CLIENTS.as_bytes()).unwrap();
        assert_eq!(windows.len(), 2);

        let target = select_target(&windows, "messenger CALL").unwrap();
        assert_eq!(target.handle.0, "0x55d2c0");
        assert_eq!(target.rect, ScreenRect { x: 1280, y: 36, width: 1280, height: 1404 });
    }

    #[test]
    fn test_parse_clients_garbage() {
        assert!(matches!(parse_clients(b"Hyprland IPC didn't respond"), Err(LocateError::Parse(_))));
    }

    #[test]
    fn test_no_call_window() {
        let json = r#"[{"address": "0x1", "at": [0, 0], "size": [800, 600], "title": "Terminal"}]"#;
        let windows = parse_clients(json.as_bytes()).unwrap();
        assert!(select_target(&windows, "Messenger call").is_none());
    }

    #[test]
    fn test_grim_geometry() {
        let rect = ScreenRect { x: 1280, y: 36, width: 640, height: 480 };
        assert_eq!(grim_geometry(&rect), "1280,36 640x480");
    }
}
