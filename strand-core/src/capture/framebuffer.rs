//! Linux frame-buffer capture (`/dev/fbN`).
//!
//! The device is mapped once. On unified-memory systems (Jetson-class
//! boards) the mapping itself is handed downstream as a [`SharedMapping`];
//! elsewhere the visible page is copied into a reused staging buffer,
//! since reading uncached device memory directly is slow.
//!
//! The mode is re-queried on every frame so a resolution switch is
//! reported instead of producing torn output.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use tracing::{debug, info};

use crate::capture::{CaptureBackend, CaptureConfig, CaptureKind, ZeroCopy};
use crate::error::StreamError;
use crate::types::{CapturedFrame, PixelFormat, SharedMapping};

// ── Kernel ABI (linux/fb.h) ──────────────────────────────────────

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(dead_code)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    kind: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

nix::ioctl_read_bad!(fbioget_vscreeninfo, 0x4600, FbVarScreeninfo);
nix::ioctl_read_bad!(fbioget_fscreeninfo, 0x4602, FbFixScreeninfo);

fn query_var(file: &File) -> Result<FbVarScreeninfo, StreamError> {
    let mut var = FbVarScreeninfo::default();
    unsafe { fbioget_vscreeninfo(file.as_raw_fd(), &mut var) }
        .map_err(|e| StreamError::Capture(format!("FBIOGET_VSCREENINFO failed: {e}")))?;
    Ok(var)
}

fn query_fix(file: &File) -> Result<FbFixScreeninfo, StreamError> {
    let mut fix = FbFixScreeninfo::default();
    unsafe { fbioget_fscreeninfo(file.as_raw_fd(), &mut fix) }
        .map_err(|e| StreamError::Capture(format!("FBIOGET_FSCREENINFO failed: {e}")))?;
    Ok(fix)
}

/// Pixel layout from the variable screen info.
fn pixel_format(bits_per_pixel: u32, red: FbBitfield, transp: FbBitfield) -> Result<PixelFormat, StreamError> {
    match (bits_per_pixel, red.offset) {
        (32, 16) if transp.length > 0 => Ok(PixelFormat::Bgra8),
        (32, 16) => Ok(PixelFormat::Bgrx8),
        (32, 0) => Ok(PixelFormat::Rgba8),
        (16, _) => Ok(PixelFormat::Rgb565),
        (bpp, offset) => Err(StreamError::Unsupported(format!(
            "frame buffer layout: {bpp} bpp, red at bit {offset}"
        ))),
    }
}

fn zero_copy_enabled(mode: ZeroCopy, probe: &Path) -> bool {
    match mode {
        ZeroCopy::Force => true,
        ZeroCopy::Off => false,
        ZeroCopy::Auto => probe.exists(),
    }
}

// ── Mapping ──────────────────────────────────────────────────────

/// The whole frame-buffer memory, unmapped when the last handle drops.
struct FbMapping {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// SAFETY: the region is mapped read-only and never written through this
// pointer, so concurrent shared reads are fine.
unsafe impl Send for FbMapping {}
unsafe impl Sync for FbMapping {}

impl FbMapping {
    fn map(file: &File, len: usize) -> Result<Self, StreamError> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| StreamError::Capture("frame buffer reports zero length".into()))?;
        let ptr = unsafe { mmap(None, length, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, file, 0) }
            .map_err(|e| StreamError::Capture(format!("mmap of frame buffer failed: {e}")))?;
        Ok(Self { ptr, len })
    }
}

impl AsRef<[u8]> for FbMapping {
    fn as_ref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }
}

impl Drop for FbMapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            debug!(error = %e, "munmap of frame buffer failed");
        }
    }
}

// ── FramebufferCapture ───────────────────────────────────────────

pub struct FramebufferCapture {
    file: Option<File>,
    mapping: Option<Arc<FbMapping>>,
    staging: Vec<u8>,
    width: u32,
    height: u32,
    pitch: u32,
    format: PixelFormat,
    zero_copy: bool,
}

impl FramebufferCapture {
    pub fn open(config: &CaptureConfig) -> Result<Self, StreamError> {
        let file = OpenOptions::new()
            .read(true)
            .open(&config.device)
            .map_err(|e| StreamError::Capture(format!("open {}: {e}", config.device.display())))?;

        let var = query_var(&file)?;
        let fix = query_fix(&file)?;
        let format = pixel_format(var.bits_per_pixel, var.red, var.transp)?;

        let len = match fix.smem_len as usize {
            0 => fix.line_length as usize * var.yres_virtual.max(var.yres) as usize,
            n => n,
        };
        let mapping = Arc::new(FbMapping::map(&file, len)?);
        let zero_copy = zero_copy_enabled(config.zero_copy, &config.unified_memory_probe);

        info!(
            device = %config.device.display(),
            width = var.xres,
            height = var.yres,
            bpp = var.bits_per_pixel,
            ?format,
            zero_copy,
            "frame buffer mapped"
        );

        Ok(Self {
            file: Some(file),
            mapping: Some(mapping),
            staging: Vec::new(),
            width: var.xres,
            height: var.yres,
            pitch: fix.line_length,
            format,
            zero_copy,
        })
    }

    pub fn is_zero_copy(&self) -> bool {
        self.zero_copy
    }
}

impl CaptureBackend for FramebufferCapture {
    /// The frame buffer always has a current picture, so this never waits.
    fn capture_frame(&mut self, _timeout: Duration) -> Result<Option<CapturedFrame<'_>>, StreamError> {
        let (Some(file), Some(mapping)) = (&self.file, &self.mapping) else {
            return Err(StreamError::InvalidState("capture released"));
        };

        let var = query_var(file)?;
        if (var.xres, var.yres) != (self.width, self.height) {
            return Err(StreamError::ResolutionChanged {
                from: (self.width, self.height),
                to: (var.xres, var.yres),
            });
        }

        let frame_len = self.pitch as usize * self.height as usize;
        let start = var.yoffset as usize * self.pitch as usize;
        let visible = AsRef::<[u8]>::as_ref(&**mapping)
            .get(start..start + frame_len)
            .ok_or_else(|| StreamError::Capture("visible page lies outside the mapping".into()))?;

        let timestamp = Instant::now();
        if self.zero_copy {
            return Ok(Some(CapturedFrame {
                width: self.width,
                height: self.height,
                pitch: self.pitch,
                format: self.format,
                timestamp,
                data: visible,
                shared: Some(SharedMapping::new(Arc::clone(mapping))),
            }));
        }

        self.staging.clear();
        self.staging.extend_from_slice(visible);
        Ok(Some(CapturedFrame {
            width: self.width,
            height: self.height,
            pitch: self.pitch,
            format: self.format,
            timestamp,
            data: &self.staging,
            shared: None,
        }))
    }

    fn release(&mut self) {
        if self.mapping.take().is_some() {
            debug!("frame buffer released");
        }
        self.file = None;
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn kind(&self) -> CaptureKind {
        CaptureKind::Framebuffer
    }
}

impl Drop for FramebufferCapture {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(offset: u32, length: u32) -> FbBitfield {
        FbBitfield {
            offset,
            length,
            msb_right: 0,
        }
    }

    #[test]
    fn derives_pixel_format() {
        assert_eq!(pixel_format(32, field(16, 8), field(24, 8)).unwrap(), PixelFormat::Bgra8);
        assert_eq!(pixel_format(32, field(16, 8), field(0, 0)).unwrap(), PixelFormat::Bgrx8);
        assert_eq!(pixel_format(32, field(0, 8), field(24, 8)).unwrap(), PixelFormat::Rgba8);
        assert_eq!(pixel_format(16, field(11, 5), field(0, 0)).unwrap(), PixelFormat::Rgb565);
        assert!(matches!(
            pixel_format(24, field(16, 8), field(0, 0)),
            Err(StreamError::Unsupported(_))
        ));
    }

    #[test]
    fn zero_copy_follows_probe_in_auto_mode() {
        let dir = tempfile::tempdir().unwrap();
        let probe = dir.path().join("nvmap");
        assert!(!zero_copy_enabled(ZeroCopy::Auto, &probe));
        assert!(zero_copy_enabled(ZeroCopy::Force, &probe));

        std::fs::write(&probe, b"").unwrap();
        assert!(zero_copy_enabled(ZeroCopy::Auto, &probe));
        assert!(!zero_copy_enabled(ZeroCopy::Off, &probe));
    }

    #[test]
    fn missing_device_is_a_capture_error() {
        let config = CaptureConfig {
            kind: CaptureKind::Framebuffer,
            device: "/nonexistent/fb9".into(),
            ..CaptureConfig::default()
        };
        assert!(matches!(
            FramebufferCapture::open(&config),
            Err(StreamError::Capture(_))
        ));
    }

    #[test]
    fn abi_struct_sizes_match_the_kernel() {
        assert_eq!(std::mem::size_of::<FbVarScreeninfo>(), 160);
    }
}
