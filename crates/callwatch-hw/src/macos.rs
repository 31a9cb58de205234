//! macOS backend: System Events scripting for windows, `screencapture` for pixels.
//!
//! Requires the Accessibility and Screen Recording permissions for the
//! process running the daemon.

use crate::capture::{CaptureError, ScreenCapturer};
use crate::frame::{Frame, SequenceCounter};
use crate::process::run_with_timeout;
use crate::window::{FocusError, LocateError, ScreenRect, WindowHandle, WindowInfo, WindowLocator};
use std::path::PathBuf;
use std::time::Duration;

// One line per window: process, window index, title, x, y, width, height.
const LIST_SCRIPT: &str = r#"
set out to ""
tell application "System Events"
    repeat with p in (every process whose visible is true)
        set pname to name of p
        set idx to 0
        repeat with w in (every window of p)
            set idx to idx + 1
            try
                set {px, py} to position of w
                set {sw, sh} to size of w
                set out to out & pname & tab & idx & tab & (name of w) & tab & px & tab & py & tab & sw & tab & sh & linefeed
            end try
        end repeat
    end repeat
end tell
return out
"#;

const FOCUS_SCRIPT: &str = r#"
on run argv
    set pname to item 1 of argv
    set idx to (item 2 of argv) as integer
    tell application "System Events"
        tell process pname
            set frontmost to true
            perform action "AXRaise" of window idx
        end tell
    end tell
end run
"#;

pub struct MacDesktop {
    timeout: Duration,
    sequence: SequenceCounter,
}

impl MacDesktop {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sequence: SequenceCounter::default(),
        }
    }
}

impl WindowLocator for MacDesktop {
    fn list_windows(&self) -> Result<Vec<WindowInfo>, LocateError> {
        let out = run_with_timeout("osascript", &["-e", LIST_SCRIPT], self.timeout)?;
        Ok(parse_window_list(&String::from_utf8_lossy(&out)))
    }

    fn focus(&self, handle: &WindowHandle) -> Result<(), FocusError> {
        let (process, index) = handle.0.split_once('\t').ok_or_else(|| FocusError::Rejected {
            handle: handle.clone(),
            reason: "malformed handle".to_string(),
        })?;
        run_with_timeout("osascript", &["-e", FOCUS_SCRIPT, process, index], self.timeout)?;
        Ok(())
    }
}

impl ScreenCapturer for MacDesktop {
    fn capture(&self, rect: &ScreenRect) -> Result<Frame, CaptureError> {
        let path = std::env::temp_dir().join(format!("callwatch-{}.png", uuid::Uuid::new_v4()));
        let _cleanup = RemoveOnDrop(path.clone());

        let region = format!("-R{},{},{},{}", rect.x, rect.y, rect.width, rect.height);
        let target = path.to_string_lossy();
        run_with_timeout("screencapture", &["-x", "-t", "png", &region, &target], self.timeout)?;

        let bytes = std::fs::read(&path)?;
        let frame = Frame::from_encoded(&bytes, self.sequence.next())?;
        tracing::debug!(%rect, sequence = frame.sequence, "screencapture");
        Ok(frame)
    }
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Parse the tab-separated output of the listing script.
///
/// Titles may themselves contain tabs, so the numeric fields are taken from
/// the end of each line.
fn parse_window_list(text: &str) -> Vec<WindowInfo> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            let n = fields.len();
            let num = |s: &str| s.trim().parse::<f64>().ok().map(|v| v.round() as i64);
            let (x, y, w, h) = (num(fields[n - 4])?, num(fields[n - 3])?, num(fields[n - 2])?, num(fields[n - 1])?);

            Some(WindowInfo {
                handle: WindowHandle(format!("{}\t{}", fields[0], fields[1])),
                title: fields[2..n - 4].join("\t"),
                rect: ScreenRect::new(i32::try_from(x).ok()?, i32::try_from(y).ok()?, w, h),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::select_target;

    #[test]
    fn test_parse_window_list() {
        let text = "Finder\t1\tDesktop\t0\t25\t1440\t875\n\
                    Google Chrome\t1\tMessenger call\twith tab\t100\t50\t800\t600\n\
                    Dock\t1\t\t0\t0\t0\t0\n\
                    garbage line\n";
        let windows = parse_window_list(text);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[1].title, "Messenger call\twith tab");
        assert_eq!(windows[1].handle.0, "Google Chrome\t1");
        assert!(windows[2].rect.is_none());

        let target = select_target(&windows, "messenger call").unwrap();
        assert_eq!(target.rect, ScreenRect { x: 100, y: 50, width: 800, height: 600 });
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_window_list("").is_empty());
    }
}
