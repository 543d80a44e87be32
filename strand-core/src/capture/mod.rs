//! Display capture backends.
//!
//! Every backend hands out [`CapturedFrame`]s that borrow a reused staging
//! buffer (or a zero-copy mapping), so the caller must finish with a frame
//! before asking for the next one. Output resolution is latched when the
//! backend opens; a live mode change surfaces as
//! [`StreamError::ResolutionChanged`] and the backend has to be reopened.

#[cfg(target_os = "windows")]
pub mod dxgi;
#[cfg(target_os = "linux")]
pub mod framebuffer;
pub mod synthetic;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StreamError;
use crate::types::CapturedFrame;

pub use synthetic::SyntheticCapture;

// ── Contract ─────────────────────────────────────────────────────

/// A source of raw display frames.
pub trait CaptureBackend: Send {
    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing
    /// new arrived in time.
    fn capture_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame<'_>>, StreamError>;

    /// Free device resources. Idempotent; also done on drop.
    fn release(&mut self);

    /// Latched output size in pixels.
    fn resolution(&self) -> (u32, u32);

    fn kind(&self) -> CaptureKind;
}

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Platform default: DXGI on Windows, frame buffer on Linux.
    #[default]
    Auto,
    Dxgi,
    Framebuffer,
    /// Generated test pattern, available everywhere.
    Synthetic,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaptureKind::Auto => "auto",
            CaptureKind::Dxgi => "dxgi",
            CaptureKind::Framebuffer => "framebuffer",
            CaptureKind::Synthetic => "synthetic",
        })
    }
}

/// Whether the frame-buffer backend may hand out its mapping directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZeroCopy {
    /// Use it when unified memory is detected.
    #[default]
    Auto,
    Force,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub kind: CaptureKind,
    /// DXGI adapter index (0 = first GPU).
    pub adapter_index: u32,
    /// Frame-buffer device node.
    pub device: PathBuf,
    pub zero_copy: ZeroCopy,
    /// Presence of this node means CPU and GPU share memory.
    pub unified_memory_probe: PathBuf,
    /// Size and rate of the synthetic source.
    pub synthetic_width: u32,
    pub synthetic_height: u32,
    pub synthetic_fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            kind: CaptureKind::Auto,
            adapter_index: 0,
            device: PathBuf::from("/dev/fb0"),
            zero_copy: ZeroCopy::Auto,
            unified_memory_probe: PathBuf::from("/dev/nvmap"),
            synthetic_width: 1280,
            synthetic_height: 720,
            synthetic_fps: 60,
        }
    }
}

// ── Lost handles ─────────────────────────────────────────────────

/// An OS capture handle that can be invalidated underneath us.
///
/// Some APIs refuse to hand out a new handle while the old one is alive,
/// so [`recreate`](Self::recreate) empties the slot before building the
/// replacement. A failed rebuild leaves the slot empty and the next
/// capture starts over.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(crate) struct HandleSlot<H> {
    handle: Option<H>,
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
impl<H> HandleSlot<H> {
    pub(crate) fn new(handle: H) -> Self {
        Self { handle: Some(handle) }
    }

    pub(crate) fn get(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub(crate) fn recreate(&mut self, make: impl FnOnce() -> Result<H, StreamError>) -> Result<&H, StreamError> {
        self.handle = None;
        let handle = make()?;
        Ok(self.handle.insert(handle))
    }
}

// ── Selection ────────────────────────────────────────────────────

/// Open the configured backend. `Auto` probes the platform backend and
/// falls back to the synthetic source with a warning.
pub fn open(config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, StreamError> {
    let backend: Box<dyn CaptureBackend> = match config.kind {
        CaptureKind::Auto => match open_platform(config) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "no display capture available, using synthetic source");
                Box::new(SyntheticCapture::from_config(config)?)
            }
        },
        CaptureKind::Dxgi | CaptureKind::Framebuffer => open_platform_kind(config.kind, config)?,
        CaptureKind::Synthetic => Box::new(SyntheticCapture::from_config(config)?),
    };
    let (width, height) = backend.resolution();
    info!(kind = %backend.kind(), width, height, "capture opened");
    Ok(backend)
}

fn open_platform(config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, StreamError> {
    if cfg!(target_os = "windows") {
        open_platform_kind(CaptureKind::Dxgi, config)
    } else {
        open_platform_kind(CaptureKind::Framebuffer, config)
    }
}

fn open_platform_kind(
    kind: CaptureKind,
    config: &CaptureConfig,
) -> Result<Box<dyn CaptureBackend>, StreamError> {
    match kind {
        #[cfg(target_os = "windows")]
        CaptureKind::Dxgi => Ok(Box::new(dxgi::DxgiCapture::open(config.adapter_index)?)),
        #[cfg(target_os = "linux")]
        CaptureKind::Framebuffer => Ok(Box::new(framebuffer::FramebufferCapture::open(config)?)),
        other => {
            let _ = config;
            Err(StreamError::Unsupported(format!(
                "{other} capture is not available on this platform"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_opens_everywhere() {
        let config = CaptureConfig {
            kind: CaptureKind::Synthetic,
            synthetic_width: 64,
            synthetic_height: 32,
            ..CaptureConfig::default()
        };
        let backend = open(&config).unwrap();
        assert_eq!(backend.resolution(), (64, 32));
        assert_eq!(backend.kind(), CaptureKind::Synthetic);
    }

    /// Counts live instances so a test can see when the old one is gone.
    struct Tracked(std::rc::Rc<std::cell::Cell<u32>>);

    impl Tracked {
        fn new(live: &std::rc::Rc<std::cell::Cell<u32>>) -> Self {
            live.set(live.get() + 1);
            Self(live.clone())
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() - 1);
        }
    }

    #[test]
    fn lost_handle_is_released_before_rebuild() {
        let live = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut slot = HandleSlot::new(Tracked::new(&live));
        assert_eq!(live.get(), 1);

        slot.recreate(|| {
            assert_eq!(live.get(), 0, "old handle still alive during rebuild");
            Ok(Tracked::new(&live))
        })
        .unwrap();
        assert_eq!(live.get(), 1);
        assert!(slot.get().is_some());
    }

    #[test]
    fn failed_rebuild_leaves_slot_empty() {
        let live = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut slot = HandleSlot::new(Tracked::new(&live));

        let err = slot.recreate(|| Err(StreamError::Capture("duplicate failed".into())));
        assert!(err.is_err());
        assert!(slot.get().is_none());
        assert_eq!(live.get(), 0);

        slot.recreate(|| Ok(Tracked::new(&live))).unwrap();
        assert_eq!(live.get(), 1);
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn dxgi_is_unsupported_off_windows() {
        let config = CaptureConfig {
            kind: CaptureKind::Dxgi,
            ..CaptureConfig::default()
        };
        assert!(matches!(open(&config), Err(StreamError::Unsupported(_))));
    }
}
