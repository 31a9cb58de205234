//! Screen-region capture.

use crate::frame::{Frame, FrameError};
use crate::process::CommandError;
use crate::window::ScreenRect;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture tool failed: {0}")]
    Command(#[from] CommandError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("capture io: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ScreenCapturer {
    /// Grab `rect` from the screen as a decoded frame.
    fn capture(&self, rect: &ScreenRect) -> Result<Frame, CaptureError>;
}
