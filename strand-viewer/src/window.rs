//! Win32 window hosting the stream.
//!
//! The window only produces [`WindowEvent`]s and a [`SurfaceHandle`];
//! presentation is done by the engine's GDI renderer on its own thread.

use strand_core::StreamError;

/// Events produced by the window message loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEvent {
    /// Window close requested (Alt-F4/X button).
    Close,
    /// Client area resized.
    Resize(u32, u32),
    /// Mouse moved (client-relative coordinates).
    MouseMove(i32, i32),
    /// Mouse button pressed or released.
    MouseButton(MouseBtn, bool),
    /// Wheel delta, 120 per notch.
    MouseWheel(i16),
    /// Virtual-key code, scan code, pressed.
    Key(u16, u16, bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseBtn {
    Left,
    Right,
    Middle,
}

#[cfg(target_os = "windows")]
mod platform {
    use std::sync::mpsc;

    use windows::Win32::Foundation::*;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::*;
    use windows::core::{PCWSTR, w};

    use super::{MouseBtn, WindowEvent};
    use strand_core::{StreamError, SurfaceHandle};

    const CLASS_NAME: PCWSTR = w!("StrandViewerWindow");

    fn low_word(v: isize) -> i32 {
        (v & 0xFFFF) as i16 as i32
    }

    fn high_word(v: isize) -> i32 {
        ((v >> 16) & 0xFFFF) as i16 as i32
    }

    fn translate(msg: u32, wparam: WPARAM, lparam: LPARAM) -> Option<WindowEvent> {
        let button = |b, down| Some(WindowEvent::MouseButton(b, down));
        let key = |down| {
            let vk = (wparam.0 & 0xFFFF) as u16;
            let mut scan = ((lparam.0 >> 16) & 0xFF) as u16;
            // Bit 24 marks extended keys (arrows, right Ctrl, ...).
            if (lparam.0 >> 24) & 1 == 1 {
                scan |= 0xE000;
            }
            Some(WindowEvent::Key(vk, scan, down))
        };
        match msg {
            WM_CLOSE => Some(WindowEvent::Close),
            WM_SIZE => Some(WindowEvent::Resize(
                low_word(lparam.0) as u16 as u32,
                high_word(lparam.0) as u16 as u32,
            )),
            WM_MOUSEMOVE => Some(WindowEvent::MouseMove(low_word(lparam.0), high_word(lparam.0))),
            WM_LBUTTONDOWN => button(MouseBtn::Left, true),
            WM_LBUTTONUP => button(MouseBtn::Left, false),
            WM_RBUTTONDOWN => button(MouseBtn::Right, true),
            WM_RBUTTONUP => button(MouseBtn::Right, false),
            WM_MBUTTONDOWN => button(MouseBtn::Middle, true),
            WM_MBUTTONUP => button(MouseBtn::Middle, false),
            WM_MOUSEWHEEL => Some(WindowEvent::MouseWheel(high_word(wparam.0 as isize) as i16)),
            WM_KEYDOWN | WM_SYSKEYDOWN => key(true),
            WM_KEYUP | WM_SYSKEYUP => key(false),
            _ => None,
        }
    }

    // GWLP_USERDATA holds a boxed event sender for the window's lifetime.
    unsafe extern "system" fn wndproc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
        let tx = unsafe { GetWindowLongPtrW(hwnd, GWLP_USERDATA) } as *const mpsc::Sender<WindowEvent>;
        if msg == WM_DESTROY {
            unsafe { PostQuitMessage(0) };
            return LRESULT(0);
        }
        if !tx.is_null() {
            if let Some(event) = translate(msg, wparam, lparam) {
                let _ = unsafe { &*tx }.send(event);
                return LRESULT(0);
            }
        }
        unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
    }

    /// Handle to the native window. Must stay on the creating thread.
    pub struct NativeWindow {
        hwnd: HWND,
        events: mpsc::Receiver<WindowEvent>,
    }

    impl NativeWindow {
        /// Create a visible top-level window.
        pub fn create(title: &str, width: u32, height: u32) -> Result<Self, StreamError> {
            let fail = |what: &str, e: windows::core::Error| StreamError::Render(format!("{what}: {e}"));
            let (tx, events) = mpsc::channel();

            let hinstance = unsafe { GetModuleHandleW(None) }.map_err(|e| fail("GetModuleHandleW", e))?;
            let class = WNDCLASSW {
                lpfnWndProc: Some(wndproc),
                hInstance: hinstance.into(),
                lpszClassName: CLASS_NAME,
                hCursor: unsafe { LoadCursorW(None, IDC_ARROW) }.unwrap_or_default(),
                ..Default::default()
            };
            // Registering twice fails harmlessly when a second window is made.
            unsafe { RegisterClassW(&class) };

            let title: Vec<u16> = title.encode_utf16().chain(std::iter::once(0)).collect();
            let hwnd = unsafe {
                CreateWindowExW(
                    WINDOW_EX_STYLE(0),
                    CLASS_NAME,
                    PCWSTR(title.as_ptr()),
                    WS_OVERLAPPEDWINDOW | WS_VISIBLE,
                    CW_USEDEFAULT,
                    CW_USEDEFAULT,
                    width as i32,
                    height as i32,
                    None,
                    None,
                    hinstance,
                    None,
                )
            }
            .map_err(|e| fail("CreateWindowExW", e))?;

            let tx = Box::into_raw(Box::new(tx));
            unsafe { SetWindowLongPtrW(hwnd, GWLP_USERDATA, tx as isize) };
            Ok(Self { hwnd, events })
        }

        /// Dispatch pending messages and return the events they produced.
        pub fn poll_events(&self) -> Vec<WindowEvent> {
            let mut msg = MSG::default();
            while unsafe { PeekMessageW(&mut msg, self.hwnd, 0, 0, PM_REMOVE) }.as_bool() {
                unsafe {
                    let _ = TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                }
            }
            self.events.try_iter().collect()
        }

        /// Handle for the engine's renderer.
        pub fn surface(&self) -> SurfaceHandle {
            SurfaceHandle(self.hwnd.0 as isize)
        }
    }

    impl Drop for NativeWindow {
        fn drop(&mut self) {
            unsafe {
                let tx = GetWindowLongPtrW(self.hwnd, GWLP_USERDATA) as *mut mpsc::Sender<WindowEvent>;
                SetWindowLongPtrW(self.hwnd, GWLP_USERDATA, 0);
                if !tx.is_null() {
                    drop(Box::from_raw(tx));
                }
                let _ = DestroyWindow(self.hwnd);
            }
        }
    }
}

#[cfg(target_os = "windows")]
pub use platform::NativeWindow;

// ── Other platforms ──────────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
pub struct NativeWindow;

#[cfg(not(target_os = "windows"))]
impl NativeWindow {
    pub fn create(_title: &str, _width: u32, _height: u32) -> Result<Self, StreamError> {
        Err(StreamError::Unsupported("native windows need Windows; run headless".into()))
    }

    pub fn poll_events(&self) -> Vec<WindowEvent> {
        Vec::new()
    }

    pub fn surface(&self) -> strand_core::SurfaceHandle {
        strand_core::SurfaceHandle(0)
    }
}
