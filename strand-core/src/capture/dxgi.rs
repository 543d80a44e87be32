//! DXGI Desktop Duplication capture for Windows.
//!
//! 1. Create a D3D11 device on the chosen adapter (`EnumAdapters1`).
//! 2. Duplicate output 0 of that adapter.
//! 3. Per frame: `AcquireNextFrame` → `CopyResource` into a reused
//!    CPU-readable staging texture → map → copy into a reused `Vec<u8>`.
//!
//! Acquire/release and map/unmap are paired by scoped guards so every early
//! return leaves the duplication in a consistent state.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::Foundation::HMODULE;
use windows::core::Interface;

use crate::capture::{CaptureBackend, CaptureKind, HandleSlot};
use crate::error::StreamError;
use crate::types::{CapturedFrame, PixelFormat};

fn capture_err(what: &str, e: windows::core::Error) -> StreamError {
    StreamError::Capture(format!("{what} failed: {e}"))
}

// ── Guards ───────────────────────────────────────────────────────

/// Releases an acquired duplication frame on drop.
struct AcquiredFrame<'a>(&'a IDXGIOutputDuplication);

impl Drop for AcquiredFrame<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.0.ReleaseFrame() } {
            debug!(error = %e, "ReleaseFrame failed");
        }
    }
}

/// Unmaps a staging texture on drop.
struct MappedTexture<'a> {
    context: &'a ID3D11DeviceContext,
    texture: &'a ID3D11Texture2D,
    mapped: D3D11_MAPPED_SUBRESOURCE,
}

impl<'a> MappedTexture<'a> {
    fn map(context: &'a ID3D11DeviceContext, texture: &'a ID3D11Texture2D) -> Result<Self, StreamError> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { context.Map(texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .map_err(|e| capture_err("Map", e))?;
        Ok(Self {
            context,
            texture,
            mapped,
        })
    }
}

impl Drop for MappedTexture<'_> {
    fn drop(&mut self) {
        unsafe { self.context.Unmap(self.texture, 0) };
    }
}

// ── Device state ─────────────────────────────────────────────────

struct Duplication {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    output: IDXGIOutput1,
    duplication: HandleSlot<IDXGIOutputDuplication>,
    staging_texture: ID3D11Texture2D,
    width: u32,
    height: u32,
}

impl Duplication {
    fn create(adapter_index: u32) -> Result<Self, StreamError> {
        let factory: IDXGIFactory1 =
            unsafe { CreateDXGIFactory1() }.map_err(|e| capture_err("CreateDXGIFactory1", e))?;
        let adapter1 = unsafe { factory.EnumAdapters1(adapter_index) }
            .map_err(|e| capture_err(&format!("EnumAdapters1({adapter_index})"), e))?;
        let adapter: IDXGIAdapter = adapter1.cast().map_err(|e| capture_err("IDXGIAdapter cast", e))?;

        let mut device = None;
        let mut context = None;
        unsafe {
            D3D11CreateDevice(
                &adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(|e| capture_err("D3D11CreateDevice", e))?;
        let device = device.ok_or_else(|| StreamError::Capture("D3D11 device is None".into()))?;
        let context = context.ok_or_else(|| StreamError::Capture("D3D11 context is None".into()))?;

        let output: IDXGIOutput =
            unsafe { adapter.EnumOutputs(0) }.map_err(|e| capture_err("EnumOutputs(0)", e))?;
        let output: IDXGIOutput1 = output.cast().map_err(|e| capture_err("IDXGIOutput1 cast", e))?;

        let (duplication, width, height) = Self::duplicate(&output, &device)?;
        let staging_texture = Self::staging(&device, width, height)?;

        Ok(Self {
            device,
            context,
            output,
            duplication: HandleSlot::new(duplication),
            staging_texture,
            width,
            height,
        })
    }

    fn duplicate(
        output: &IDXGIOutput1,
        device: &ID3D11Device,
    ) -> Result<(IDXGIOutputDuplication, u32, u32), StreamError> {
        let duplication =
            unsafe { output.DuplicateOutput(device) }.map_err(|e| capture_err("DuplicateOutput", e))?;
        let desc = unsafe { duplication.GetDesc() };
        Ok((duplication, desc.ModeDesc.Width, desc.ModeDesc.Height))
    }

    fn staging(device: &ID3D11Device, width: u32, height: u32) -> Result<ID3D11Texture2D, StreamError> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut texture = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(|e| capture_err("CreateTexture2D (staging)", e))?;
        texture.ok_or_else(|| StreamError::Capture("staging texture is None".into()))
    }

    /// Recreate the duplication after `DXGI_ERROR_ACCESS_LOST` (mode
    /// change, secure desktop, fullscreen switch).
    ///
    /// `DuplicateOutput` fails with `E_ACCESSDENIED` while the lost
    /// interface is still referenced, so the slot releases it first.
    fn recreate(&mut self) -> Result<&IDXGIOutputDuplication, StreamError> {
        let (output, device) = (&self.output, &self.device);
        let latched = (self.width, self.height);
        self.duplication.recreate(|| {
            let (duplication, width, height) = Self::duplicate(output, device)?;
            if (width, height) != latched {
                return Err(StreamError::ResolutionChanged {
                    from: latched,
                    to: (width, height),
                });
            }
            Ok(duplication)
        })
    }
}

// ── DxgiCapture ──────────────────────────────────────────────────

/// Desktop Duplication capture backend.
pub struct DxgiCapture {
    state: Option<Duplication>,
    staging: Vec<u8>,
    width: u32,
    height: u32,
}

// SAFETY: the COM objects are only touched through `&mut self`, so the
// immediate context is never used from two threads at once.
unsafe impl Send for DxgiCapture {}

impl DxgiCapture {
    /// Open output 0 of adapter `adapter_index` (0 = first GPU).
    pub fn open(adapter_index: u32) -> Result<Self, StreamError> {
        let state = Duplication::create(adapter_index)?;
        let (width, height) = (state.width, state.height);
        info!(adapter_index, width, height, "DXGI duplication ready");
        Ok(Self {
            state: Some(state),
            staging: Vec::new(),
            width,
            height,
        })
    }
}

enum Acquired {
    Frame(IDXGIResource),
    Timeout,
    AccessLost,
}

fn acquire(duplication: &IDXGIOutputDuplication, timeout: Duration) -> Result<Acquired, StreamError> {
    let mut info = DXGI_OUTDUPL_FRAME_INFO::default();
    let mut resource = None;
    let ms = timeout.as_millis().min(u32::MAX as u128) as u32;
    match unsafe { duplication.AcquireNextFrame(ms, &mut info, &mut resource) } {
        Ok(()) => resource
            .map(Acquired::Frame)
            .ok_or_else(|| StreamError::Capture("acquired resource is None".into())),
        Err(e) if e.code() == DXGI_ERROR_WAIT_TIMEOUT => Ok(Acquired::Timeout),
        Err(e) if e.code() == DXGI_ERROR_ACCESS_LOST => Ok(Acquired::AccessLost),
        Err(e) => Err(capture_err("AcquireNextFrame", e)),
    }
}

impl CaptureBackend for DxgiCapture {
    fn capture_frame(&mut self, timeout: Duration) -> Result<Option<CapturedFrame<'_>>, StreamError> {
        let state = self
            .state
            .as_mut()
            .ok_or(StreamError::InvalidState("capture released"))?;

        // An empty slot means an earlier rebuild failed; treat it as lost.
        let mut outcome = match state.duplication.get() {
            Some(duplication) => acquire(duplication, timeout)?,
            None => Acquired::AccessLost,
        };
        if matches!(outcome, Acquired::AccessLost) {
            warn!("desktop duplication lost, recreating");
            outcome = acquire(state.recreate()?, timeout)?;
        }
        let resource = match outcome {
            Acquired::Frame(r) => r,
            Acquired::Timeout => return Ok(None),
            Acquired::AccessLost => {
                return Err(StreamError::Capture("desktop duplication lost twice".into()));
            }
        };

        let pitch;
        {
            let duplication = state
                .duplication
                .get()
                .ok_or_else(|| StreamError::Capture("duplication missing after acquire".into()))?;
            let _frame = AcquiredFrame(duplication);
            let texture: ID3D11Texture2D =
                resource.cast().map_err(|e| capture_err("ID3D11Texture2D cast", e))?;
            unsafe { state.context.CopyResource(&state.staging_texture, &texture) };

            let map = MappedTexture::map(&state.context, &state.staging_texture)?;
            pitch = map.mapped.RowPitch;
            let total = pitch as usize * self.height as usize;
            let src = unsafe { std::slice::from_raw_parts(map.mapped.pData as *const u8, total) };
            self.staging.clear();
            self.staging.extend_from_slice(src);
        }

        Ok(Some(CapturedFrame {
            width: self.width,
            height: self.height,
            pitch,
            format: PixelFormat::Bgra8,
            timestamp: Instant::now(),
            data: &self.staging,
            shared: None,
        }))
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            debug!("DXGI duplication released");
        }
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn kind(&self) -> CaptureKind {
        CaptureKind::Dxgi
    }
}

impl Drop for DxgiCapture {
    fn drop(&mut self) {
        self.release();
    }
}
