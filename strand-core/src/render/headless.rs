//! Renderer for viewers without a window: checks every picture is
//! well-formed and keeps counters, nothing is drawn.

use tracing::debug;

use crate::decoder::{DecodedFrame, FrameStorage};
use crate::error::StreamError;
use crate::render::{Renderer, convert};

#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    rendered: u64,
    last_size: Option<(u32, u32)>,
    last_frame_number: Option<u16>,
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    pub fn last_size(&self) -> Option<(u32, u32)> {
        self.last_size
    }

    pub fn last_frame_number(&self) -> Option<u16> {
        self.last_frame_number
    }
}

impl Renderer for HeadlessRenderer {
    fn render(&mut self, frame: &DecodedFrame) -> Result<(), StreamError> {
        if let FrameStorage::Host(bytes) = &frame.storage {
            let need = convert::packed_len(frame.format, frame.width, frame.height);
            if bytes.len() < need {
                return Err(StreamError::Render(format!(
                    "frame {} carries {} bytes, {need} expected",
                    frame.frame_number,
                    bytes.len()
                )));
            }
        }
        if self.last_size != Some((frame.width, frame.height)) {
            debug!(width = frame.width, height = frame.height, "headless picture size");
            self.last_size = Some((frame.width, frame.height));
        }
        self.last_frame_number = Some(frame.frame_number);
        self.rendered += 1;
        Ok(())
    }

    fn resize(&mut self, _width: u32, _height: u32) {}

    fn backend(&self) -> &str {
        "headless"
    }
}
