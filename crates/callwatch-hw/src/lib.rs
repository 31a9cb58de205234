//! callwatch-hw: Desktop abstraction for finding and capturing call windows.
//!
//! Wraps the compositor and screenshot tools of each supported desktop
//! (`hyprctl` + `grim` on Hyprland, System Events + `screencapture` on macOS)
//! behind the [`Desktop`] trait.

pub mod backend;
pub mod capture;
pub mod frame;
pub mod hyprland;
pub mod macos;
pub mod process;
pub mod window;

pub use backend::{open_desktop, Desktop};
pub use capture::{CaptureError, ScreenCapturer};
pub use frame::{Frame, FrameError, SequenceCounter};
pub use window::{FocusError, ScreenRect, WindowHandle, WindowInfo, WindowLocator, WindowTarget};
