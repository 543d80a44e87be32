//! Presentation of decoded pictures.
//!
//! The viewer's render thread takes the newest [`DecodedFrame`] from a
//! latest-wins slot and hands it to a [`Renderer`]. GDI is used when the
//! embedding UI supplies a native window handle; without one the headless
//! renderer only validates and counts frames.

pub mod convert;
#[cfg(target_os = "windows")]
pub mod gdi;
pub mod headless;

use tracing::info;

use crate::decoder::DecodedFrame;
use crate::error::StreamError;
use crate::types::SurfaceHandle;

pub use headless::HeadlessRenderer;

/// Contract shared by all presenters.
pub trait Renderer: Send {
    /// Present one picture, scaled to the current target size.
    fn render(&mut self, frame: &DecodedFrame) -> Result<(), StreamError>;

    /// The target surface changed size.
    fn resize(&mut self, width: u32, height: u32);

    fn backend(&self) -> &str;
}

/// Pick a renderer for the optional native surface.
pub fn open(surface: Option<SurfaceHandle>) -> Result<Box<dyn Renderer>, StreamError> {
    let renderer: Box<dyn Renderer> = match surface {
        None => Box::new(HeadlessRenderer::new()),
        #[cfg(target_os = "windows")]
        Some(handle) => Box::new(gdi::GdiRenderer::new(handle)?),
        #[cfg(not(target_os = "windows"))]
        Some(handle) => {
            return Err(StreamError::Unsupported(format!(
                "native surface {handle:?} needs the Windows GDI renderer"
            )));
        }
    };
    info!(backend = renderer.backend(), "renderer ready");
    Ok(renderer)
}
