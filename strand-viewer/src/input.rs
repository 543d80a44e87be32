//! Window events → engine input events.
//!
//! Buttons and wheel carry the last known cursor position, already
//! mapped into host coordinates by the [`Viewport`].

use strand_core::input::{KeyEvent, MouseButton, MouseEvent};
use strand_core::{InputEvent, Viewport};

use crate::window::{MouseBtn, WindowEvent};

/// Tracks window size and cursor so events can be scaled.
#[derive(Debug, Clone)]
pub struct InputMapper {
    viewport: Viewport,
    cursor: (i32, i32),
}

impl InputMapper {
    pub fn new(window_width: u32, window_height: u32, remote_width: u32, remote_height: u32) -> Self {
        Self {
            viewport: Viewport::new(window_width, window_height, remote_width, remote_height),
            cursor: (0, 0),
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Convert one window event. Resizes update the viewport and yield
    /// nothing.
    pub fn translate(&mut self, event: &WindowEvent) -> Option<InputEvent> {
        match *event {
            WindowEvent::Resize(w, h) => {
                self.viewport.window_width = w;
                self.viewport.window_height = h;
                None
            }
            WindowEvent::MouseMove(x, y) => {
                self.cursor = self.viewport.scale(x, y);
                Some(MouseEvent::move_to(self.cursor.0, self.cursor.1).into())
            }
            WindowEvent::MouseButton(btn, pressed) => {
                let button = match btn {
                    MouseBtn::Left => MouseButton::Left,
                    MouseBtn::Right => MouseButton::Right,
                    MouseBtn::Middle => MouseButton::Middle,
                };
                let (x, y) = self.cursor;
                let ev = if pressed {
                    MouseEvent::press(x, y, button)
                } else {
                    MouseEvent::release(x, y, button)
                };
                Some(ev.into())
            }
            WindowEvent::MouseWheel(delta) => {
                Some(MouseEvent::scroll(self.cursor.0, self.cursor.1, delta).into())
            }
            WindowEvent::Key(vk, scan, pressed) => {
                let ev = if pressed {
                    KeyEvent::press(vk, scan, 0)
                } else {
                    KeyEvent::release(vk, scan, 0)
                };
                Some(ev.into())
            }
            WindowEvent::Close => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::input::{KeyAction, MouseEventKind};

    #[test]
    fn clicks_use_scaled_cursor_position() {
        let mut m = InputMapper::new(640, 360, 1920, 1080);
        m.translate(&WindowEvent::MouseMove(320, 180));
        let Some(InputEvent::Mouse(click)) = m.translate(&WindowEvent::MouseButton(MouseBtn::Left, true)) else {
            panic!("expected mouse event");
        };
        assert_eq!((click.x, click.y), (960, 540));
        assert_eq!(click.kind, MouseEventKind::Press);
        assert_eq!(click.button, MouseButton::Left);
    }

    #[test]
    fn resize_changes_scaling() {
        let mut m = InputMapper::new(640, 360, 1920, 1080);
        assert_eq!(m.translate(&WindowEvent::Resize(1920, 1080)), None);
        let Some(InputEvent::Mouse(mv)) = m.translate(&WindowEvent::MouseMove(100, 50)) else {
            panic!("expected mouse event");
        };
        assert_eq!((mv.x, mv.y), (100, 50));
    }

    #[test]
    fn keys_pass_through() {
        let mut m = InputMapper::new(1, 1, 1, 1);
        let Some(InputEvent::Key(k)) = m.translate(&WindowEvent::Key(0x41, 0x1E, false)) else {
            panic!("expected key event");
        };
        assert_eq!((k.virtual_key, k.scan_code), (0x41, 0x1E));
        assert_eq!(k.action, KeyAction::Release);
        assert_eq!(m.translate(&WindowEvent::Close), None);
    }
}
