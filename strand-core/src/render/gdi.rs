//! GDI presenter: blits BGRA pictures into a native window with
//! `StretchDIBits`.

use tracing::debug;
use windows::Win32::Foundation::{HWND, RECT};
use windows::Win32::Graphics::Gdi::*;
use windows::Win32::UI::WindowsAndMessaging::GetClientRect;

use crate::decoder::DecodedFrame;
use crate::error::StreamError;
use crate::render::{Renderer, convert};
use crate::types::SurfaceHandle;

pub struct GdiRenderer {
    /// Raw `HWND` value; kept as an integer so the renderer can move to
    /// the render thread.
    hwnd: isize,
    width: u32,
    height: u32,
    bgra: Vec<u8>,
}

impl GdiRenderer {
    pub fn new(surface: SurfaceHandle) -> Result<Self, StreamError> {
        if surface.0 == 0 {
            return Err(StreamError::InvalidConfig("null window handle".into()));
        }
        let mut renderer = Self {
            hwnd: surface.0,
            width: 0,
            height: 0,
            bgra: Vec::new(),
        };
        let (w, h) = renderer.client_size()?;
        renderer.resize(w, h);
        Ok(renderer)
    }

    fn hwnd(&self) -> HWND {
        HWND(self.hwnd as *mut _)
    }

    fn client_size(&self) -> Result<(u32, u32), StreamError> {
        let mut rect = RECT::default();
        unsafe { GetClientRect(self.hwnd(), &mut rect) }
            .map_err(|e| StreamError::Render(format!("GetClientRect failed: {e}")))?;
        Ok((
            (rect.right - rect.left).max(0) as u32,
            (rect.bottom - rect.top).max(0) as u32,
        ))
    }
}

impl Renderer for GdiRenderer {
    fn render(&mut self, frame: &DecodedFrame) -> Result<(), StreamError> {
        if self.width == 0 || self.height == 0 {
            // Minimized.
            return Ok(());
        }
        convert::to_bgra(frame, &mut self.bgra)?;

        let hwnd = self.hwnd();
        unsafe {
            let hdc = GetDC(hwnd);
            if hdc.is_invalid() {
                return Err(StreamError::Render("GetDC failed".into()));
            }

            let bmi = BITMAPINFO {
                bmiHeader: BITMAPINFOHEADER {
                    biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                    biWidth: frame.width as i32,
                    // Negative height = top-down DIB.
                    biHeight: -(frame.height as i32),
                    biPlanes: 1,
                    biBitCount: 32,
                    biCompression: BI_RGB.0,
                    ..Default::default()
                },
                bmiColors: [RGBQUAD::default(); 1],
            };

            SetStretchBltMode(hdc, HALFTONE);
            let lines = StretchDIBits(
                hdc,
                0,
                0,
                self.width as i32,
                self.height as i32,
                0,
                0,
                frame.width as i32,
                frame.height as i32,
                Some(self.bgra.as_ptr() as *const _),
                &bmi,
                DIB_RGB_COLORS,
                SRCCOPY,
            );
            ReleaseDC(hwnd, hdc);

            if lines == 0 {
                return Err(StreamError::Render("StretchDIBits drew nothing".into()));
            }
        }
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        debug!(width, height, "GDI target resized");
        self.width = width;
        self.height = height;
    }

    fn backend(&self) -> &str {
        "gdi"
    }
}
