//! Window location and focus.

use crate::process::CommandError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, backend-specific window identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowHandle(pub String);

impl std::fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Screen-space rectangle in logical pixels. Width and height are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScreenRect {
    /// Build a rectangle, rejecting non-positive sizes.
    pub fn new(x: i32, y: i32, width: i64, height: i64) -> Option<Self> {
        if width <= 0 || height <= 0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width: u32::try_from(width).ok()?,
            height: u32::try_from(height).ok()?,
        })
    }
}

impl std::fmt::Display for ScreenRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.width, self.height)
    }
}

/// A visible window as enumerated by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub handle: WindowHandle,
    pub title: String,
    /// `None` when the backend reported a non-positive size.
    pub rect: Option<ScreenRect>,
}

/// The call window found on this poll. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowTarget {
    pub handle: WindowHandle,
    pub rect: ScreenRect,
}

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("window enumeration failed: {0}")]
    Command(#[from] CommandError),
    #[error("cannot parse window list: {0}")]
    Parse(String),
}

#[derive(Error, Debug)]
pub enum FocusError {
    #[error("focus command failed: {0}")]
    Command(#[from] CommandError),
    #[error("focus of {handle} rejected: {reason}")]
    Rejected { handle: WindowHandle, reason: String },
}

pub trait WindowLocator {
    /// Every visible window, in the backend's enumeration order.
    fn list_windows(&self) -> Result<Vec<WindowInfo>, LocateError>;

    /// Raise `handle` to the foreground.
    fn focus(&self, handle: &WindowHandle) -> Result<(), FocusError>;

    /// First window whose title contains `title_keyword`, ignoring case.
    ///
    /// Enumeration failures are logged and reported as no window.
    fn locate(&self, title_keyword: &str) -> Option<WindowTarget> {
        match self.list_windows() {
            Ok(windows) => select_target(&windows, title_keyword),
            Err(e) => {
                tracing::warn!(error = %e, "cannot enumerate windows");
                None
            }
        }
    }
}

/// First window in `windows` whose title contains `keyword` (case-insensitive)
/// and whose size is positive.
pub fn select_target(windows: &[WindowInfo], keyword: &str) -> Option<WindowTarget> {
    let needle = keyword.to_lowercase();
    windows.iter().find_map(|w| {
        let rect = w.rect?;
        w.title.to_lowercase().contains(&needle).then(|| WindowTarget {
            handle: w.handle.clone(),
            rect,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(handle: &str, title: &str, w: i64, h: i64) -> WindowInfo {
        WindowInfo {
            handle: WindowHandle(handle.to_string()),
            title: title.to_string(),
            rect: ScreenRect::new(10, 20, w, h),
        }
    }

    #[test]
    fn test_select_case_insensitive_first_match() {
        let windows = vec![
            window("0x1", "Inbox - Mail", 800, 600),
            window("0x2", "MESSENGER CALL with Alice", 640, 480),
            window("0x3", "Messenger call with Bob", 640, 480),
        ];
        let target = select_target(&windows, "Messenger call").unwrap();
        assert_eq!(target.handle, WindowHandle("0x2".into()));
        assert_eq!(target.rect.width, 640);
    }

    #[test]
    fn test_select_skips_zero_sized() {
        let windows = vec![
            window("0x1", "Messenger call", 0, 480),
            window("0x2", "Messenger call", 640, 480),
        ];
        assert_eq!(select_target(&windows, "messenger").unwrap().handle.0, "0x2");
    }

    #[test]
    fn test_select_none() {
        let windows = vec![window("0x1", "Terminal", 800, 600)];
        assert!(select_target(&windows, "Messenger call").is_none());
        assert!(select_target(&[], "Messenger call").is_none());
    }

    #[test]
    fn test_rect_rejects_non_positive() {
        assert!(ScreenRect::new(0, 0, -5, 10).is_none());
        assert!(ScreenRect::new(0, 0, 10, 0).is_none());
        assert_eq!(ScreenRect::new(-100, 5, 20, 30).unwrap().to_string(), "-100,5 20x30");
    }

    struct Broken;

    impl WindowLocator for Broken {
        fn list_windows(&self) -> Result<Vec<WindowInfo>, LocateError> {
            Err(LocateError::Parse("garbage".into()))
        }

        fn focus(&self, _: &WindowHandle) -> Result<(), FocusError> {
            Ok(())
        }
    }

    #[test]
    fn test_locate_enumeration_failure_is_none() {
        assert!(Broken.locate("anything").is_none());
    }
}
