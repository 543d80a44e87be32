//! Host-side replay of viewer input.
//!
//! Windows uses `SendInput` with absolute (0..65535) mouse coordinates.
//! Other platforms report [`StreamError::Unsupported`] so the host keeps
//! streaming view-only.

use crate::error::StreamError;
use crate::input::InputEvent;

/// Injects mouse and keyboard events into the local input stream.
///
/// `SendInput` only reaches the desktop of the calling session, so the
/// host must run in the interactive session (or with `UIAccess`).
#[derive(Debug, Default)]
pub struct InputInjector {
    injected: u64,
}

impl InputInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay one event.
    pub fn inject(&mut self, event: &InputEvent) -> Result<(), StreamError> {
        match event {
            InputEvent::Mouse(m) => platform::inject_mouse(m)?,
            InputEvent::Key(k) => platform::inject_key(k)?,
        }
        self.injected += 1;
        Ok(())
    }

    /// Events successfully injected so far.
    pub fn injected(&self) -> u64 {
        self.injected
    }
}

// ── Windows ──────────────────────────────────────────────────────

#[cfg(target_os = "windows")]
mod platform {
    use windows::Win32::UI::Input::KeyboardAndMouse::*;
    use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CXSCREEN, SM_CYSCREEN};

    use crate::error::StreamError;
    use crate::input::{KeyAction, KeyEvent, MouseButton, MouseEvent, MouseEventKind};

    const XBUTTON1: u32 = 1;
    const XBUTTON2: u32 = 2;

    fn send(input: INPUT, what: &str) -> Result<(), StreamError> {
        let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
        if sent == 0 {
            return Err(StreamError::Unsupported(format!("SendInput ({what}) was blocked")));
        }
        Ok(())
    }

    fn button_flags(button: MouseButton, down: bool) -> (MOUSE_EVENT_FLAGS, u32) {
        match (button, down) {
            (MouseButton::Left, true) => (MOUSEEVENTF_LEFTDOWN, 0),
            (MouseButton::Left, false) => (MOUSEEVENTF_LEFTUP, 0),
            (MouseButton::Right, true) => (MOUSEEVENTF_RIGHTDOWN, 0),
            (MouseButton::Right, false) => (MOUSEEVENTF_RIGHTUP, 0),
            (MouseButton::Middle, true) => (MOUSEEVENTF_MIDDLEDOWN, 0),
            (MouseButton::Middle, false) => (MOUSEEVENTF_MIDDLEUP, 0),
            (MouseButton::X1, true) => (MOUSEEVENTF_XDOWN, XBUTTON1),
            (MouseButton::X1, false) => (MOUSEEVENTF_XUP, XBUTTON1),
            (MouseButton::X2, true) => (MOUSEEVENTF_XDOWN, XBUTTON2),
            (MouseButton::X2, false) => (MOUSEEVENTF_XUP, XBUTTON2),
            (MouseButton::None, _) => (MOUSE_EVENT_FLAGS(0), 0),
        }
    }

    pub(super) fn inject_mouse(event: &MouseEvent) -> Result<(), StreamError> {
        let (screen_w, screen_h) =
            unsafe { (GetSystemMetrics(SM_CXSCREEN), GetSystemMetrics(SM_CYSCREEN)) };
        if screen_w == 0 || screen_h == 0 {
            return Err(StreamError::Unsupported("no interactive desktop".into()));
        }
        let abs_x = (event.x as i64 * 65535 / screen_w as i64) as i32;
        let abs_y = (event.y as i64 * 65535 / screen_h as i64) as i32;

        let (extra, mouse_data) = match event.kind {
            MouseEventKind::Move => (MOUSEEVENTF_MOVE, 0),
            MouseEventKind::Press => button_flags(event.button, true),
            MouseEventKind::Release => button_flags(event.button, false),
            MouseEventKind::Scroll => (MOUSEEVENTF_WHEEL, event.scroll_delta as i32 as u32),
            MouseEventKind::DoubleClick => {
                for _ in 0..2 {
                    inject_mouse(&MouseEvent::press(event.x, event.y, event.button))?;
                    inject_mouse(&MouseEvent::release(event.x, event.y, event.button))?;
                }
                return Ok(());
            }
        };

        send(
            INPUT {
                r#type: INPUT_MOUSE,
                Anonymous: INPUT_0 {
                    mi: MOUSEINPUT {
                        dx: abs_x,
                        dy: abs_y,
                        mouseData: mouse_data,
                        dwFlags: MOUSEEVENTF_ABSOLUTE | MOUSEEVENTF_MOVE | extra,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            },
            "mouse",
        )
    }

    pub(super) fn inject_key(event: &KeyEvent) -> Result<(), StreamError> {
        let mut flags = KEYBD_EVENT_FLAGS(0);
        if event.scan_code != 0 {
            flags |= KEYEVENTF_SCANCODE;
        }
        if event.action == KeyAction::Release {
            flags |= KEYEVENTF_KEYUP;
        }
        // 0xE0-prefixed scan codes (arrows, right Ctrl/Alt).
        if event.scan_code > 0xFF {
            flags |= KEYEVENTF_EXTENDEDKEY;
        }

        send(
            INPUT {
                r#type: INPUT_KEYBOARD,
                Anonymous: INPUT_0 {
                    ki: KEYBDINPUT {
                        wVk: VIRTUAL_KEY(event.virtual_key),
                        wScan: event.scan_code & 0xFF,
                        dwFlags: flags,
                        time: 0,
                        dwExtraInfo: 0,
                    },
                },
            },
            "keyboard",
        )
    }
}

// ── Other platforms ──────────────────────────────────────────────

#[cfg(not(target_os = "windows"))]
mod platform {
    use crate::error::StreamError;
    use crate::input::{KeyEvent, MouseEvent};

    pub(super) fn inject_mouse(_event: &MouseEvent) -> Result<(), StreamError> {
        Err(StreamError::Unsupported(
            "input injection is only available on Windows".into(),
        ))
    }

    pub(super) fn inject_key(_event: &KeyEvent) -> Result<(), StreamError> {
        Err(StreamError::Unsupported(
            "input injection is only available on Windows".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::MouseEvent;

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn injection_is_unsupported_off_windows() {
        let mut inj = InputInjector::new();
        let result = inj.inject(&InputEvent::Mouse(MouseEvent::move_to(1, 1)));
        assert!(matches!(result, Err(StreamError::Unsupported(_))));
        assert_eq!(inj.injected(), 0);
    }
}
