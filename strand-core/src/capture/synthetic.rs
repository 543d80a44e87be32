//! Generated test pattern: eight vertical colour bars scrolling one
//! column per frame, with a frame-counter stripe along the top.
//!
//! Paced to the configured rate, so encoders and the network path see a
//! realistic cadence on machines without a display.

use std::time::{Duration, Instant};

use crate::capture::{CaptureBackend, CaptureConfig, CaptureKind};
use crate::error::StreamError;
use crate::types::{CapturedFrame, PixelFormat};

/// BGRA colours of the bars, left to right.
const BARS: [[u8; 4]; 8] = [
    [0xC0, 0xC0, 0xC0, 0xFF], // grey
    [0x00, 0xC0, 0xC0, 0xFF], // yellow
    [0xC0, 0xC0, 0x00, 0xFF], // cyan
    [0x00, 0xC0, 0x00, 0xFF], // green
    [0xC0, 0x00, 0xC0, 0xFF], // magenta
    [0x00, 0x00, 0xC0, 0xFF], // red
    [0xC0, 0x00, 0x00, 0xFF], // blue
    [0x10, 0x10, 0x10, 0xFF], // black
];

const COUNTER_ROWS: u32 = 8;

pub struct SyntheticCapture {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Option<Instant>,
    frame_index: u64,
    buffer: Vec<u8>,
}

impl SyntheticCapture {
    pub fn new(width: u32, height: u32, fps: u32) -> Result<Self, StreamError> {
        if width == 0 || height == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "synthetic capture size must be non-zero, got {width}x{height}"
            )));
        }
        if fps == 0 {
            return Err(StreamError::InvalidConfig("synthetic fps must be non-zero".into()));
        }
        Ok(Self {
            width,
            height,
            interval: Duration::from_secs(1) / fps,
            next_due: None,
            frame_index: 0,
            buffer: vec![0; width as usize * height as usize * 4],
        })
    }

    pub fn from_config(config: &CaptureConfig) -> Result<Self, StreamError> {
        Self::new(config.synthetic_width, config.synthetic_height, config.synthetic_fps)
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_index
    }

    fn paint(&mut self) {
        let width = self.width as usize;
        let shift = self.frame_index as usize;
        let bar_width = width.div_ceil(BARS.len()).max(1);

        for (y, row) in self.buffer.chunks_exact_mut(width * 4).enumerate() {
            if (y as u32) < COUNTER_ROWS.min(self.height) {
                // 64-bit frame counter, one bit per cell, MSB first.
                for (x, px) in row.chunks_exact_mut(4).enumerate() {
                    let bit = (x * 64 / width) as u32;
                    let on = (self.frame_index >> (63 - bit)) & 1 == 1;
                    px.copy_from_slice(if on { &[0xFF; 4] } else { &[0, 0, 0, 0xFF] });
                }
                continue;
            }
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let bar = ((x + shift) % width) / bar_width;
                px.copy_from_slice(&BARS[bar.min(BARS.len() - 1)]);
            }
        }
    }
}

impl CaptureBackend for SyntheticCapture {
    fn capture_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame<'_>>, StreamError> {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
        // Skip missed slots instead of bursting to catch up.
        self.next_due = Some((due + self.interval).max(now));

        self.paint();
        self.frame_index += 1;

        Ok(Some(CapturedFrame {
            width: self.width,
            height: self.height,
            pitch: self.width * 4,
            format: PixelFormat::Bgra8,
            timestamp: Instant::now(),
            data: &self.buffer,
            shared: None,
        }))
    }

    fn release(&mut self) {}

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn kind(&self) -> CaptureKind {
        CaptureKind::Synthetic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_geometry() {
        assert!(matches!(
            SyntheticCapture::new(0, 10, 30),
            Err(StreamError::InvalidConfig(_))
        ));
        assert!(matches!(
            SyntheticCapture::new(10, 10, 0),
            Err(StreamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn frames_are_tightly_packed_bgra() {
        let mut cap = SyntheticCapture::new(64, 32, 1000).unwrap();
        let frame = cap.capture_frame(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!(frame.pitch, 256);
        assert_eq!(frame.data.len(), frame.byte_len());
        assert_eq!(frame.format, PixelFormat::Bgra8);
        // First bar below the counter stripe is grey.
        let row = frame.row(COUNTER_ROWS);
        assert_eq!(&row[..4], &BARS[0]);
    }

    #[test]
    fn bars_scroll_between_frames() {
        let mut cap = SyntheticCapture::new(64, 16, 1000).unwrap();
        let first = cap.capture_frame(Duration::from_millis(50)).unwrap().unwrap().to_packed();
        let second = cap.capture_frame(Duration::from_millis(50)).unwrap().unwrap().to_packed();
        assert_ne!(first, second);
        assert_eq!(cap.frames_generated(), 2);
    }

    #[test]
    fn returns_none_when_next_frame_is_not_due() {
        let mut cap = SyntheticCapture::new(8, 8, 1).unwrap();
        assert!(cap.capture_frame(Duration::ZERO).unwrap().is_some());
        assert!(cap.capture_frame(Duration::from_millis(5)).unwrap().is_none());
    }
}
