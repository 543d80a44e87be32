//! Input events travelling viewer → host.
//!
//! Events are sent one datagram each, immediately, with no batching. The
//! viewer maps window coordinates into the host's capture resolution with
//! a [`Viewport`] before sending; the host replays them with
//! [`InputInjector`].

pub mod inject;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::StreamError;
use crate::protocol::ControlMessage;
use crate::transport::SessionSocket;

pub use inject::InputInjector;

// ── Mouse ────────────────────────────────────────────────────────

/// Mouse event in host screen coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MouseEvent {
    pub x: i32,
    pub y: i32,
    pub kind: MouseEventKind,
    pub button: MouseButton,
    /// Wheel delta for scroll events (120 per notch).
    pub scroll_delta: i16,
}

impl MouseEvent {
    pub fn move_to(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Move,
            button: MouseButton::None,
            scroll_delta: 0,
        }
    }

    pub fn press(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Press,
            button,
            scroll_delta: 0,
        }
    }

    pub fn release(x: i32, y: i32, button: MouseButton) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Release,
            button,
            scroll_delta: 0,
        }
    }

    pub fn scroll(x: i32, y: i32, delta: i16) -> Self {
        Self {
            x,
            y,
            kind: MouseEventKind::Scroll,
            button: MouseButton::None,
            scroll_delta: delta,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MouseEventKind {
    Move,
    Press,
    Release,
    Scroll,
    DoubleClick,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MouseButton {
    None,
    Left,
    Right,
    Middle,
    X1,
    X2,
}

// ── Keyboard ─────────────────────────────────────────────────────

/// Keyboard event carrying both virtual key and scan code.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct KeyEvent {
    pub virtual_key: u16,
    /// Hardware scan code; values above 0xFF mark extended keys.
    pub scan_code: u16,
    pub action: KeyAction,
    /// [`key_modifiers`] bits.
    pub modifiers: u8,
}

impl KeyEvent {
    pub fn press(virtual_key: u16, scan_code: u16, modifiers: u8) -> Self {
        Self {
            virtual_key,
            scan_code,
            action: KeyAction::Press,
            modifiers,
        }
    }

    pub fn release(virtual_key: u16, scan_code: u16, modifiers: u8) -> Self {
        Self {
            virtual_key,
            scan_code,
            action: KeyAction::Release,
            modifiers,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Release,
}

/// Modifier key flags.
pub mod key_modifiers {
    pub const NONE: u8 = 0x00;
    pub const SHIFT: u8 = 0x01;
    pub const CTRL: u8 = 0x02;
    pub const ALT: u8 = 0x04;
    pub const META: u8 = 0x08;
}

/// One input action, sent as a single `INPUT` datagram.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum InputEvent {
    Mouse(MouseEvent),
    Key(KeyEvent),
}

impl From<MouseEvent> for InputEvent {
    fn from(ev: MouseEvent) -> Self {
        InputEvent::Mouse(ev)
    }
}

impl From<KeyEvent> for InputEvent {
    fn from(ev: KeyEvent) -> Self {
        InputEvent::Key(ev)
    }
}

// ── Viewport ─────────────────────────────────────────────────────

/// Maps local window coordinates onto the remote capture resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub window_width: u32,
    pub window_height: u32,
    pub remote_width: u32,
    pub remote_height: u32,
}

impl Viewport {
    pub fn new(window_width: u32, window_height: u32, remote_width: u32, remote_height: u32) -> Self {
        Self {
            window_width,
            window_height,
            remote_width,
            remote_height,
        }
    }

    /// Scale a window position into remote coordinates, clamped to the
    /// remote screen.
    pub fn scale(&self, x: i32, y: i32) -> (i32, i32) {
        fn axis(v: i32, local: u32, remote: u32) -> i32 {
            if local == 0 || remote == 0 {
                return 0;
            }
            let scaled = (v as f64 / local as f64 * remote as f64) as i64;
            scaled.clamp(0, remote as i64 - 1) as i32
        }
        (
            axis(x, self.window_width, self.remote_width),
            axis(y, self.window_height, self.remote_height),
        )
    }

    /// Scale the position carried by a mouse event; key events pass through.
    pub fn map(&self, event: InputEvent) -> InputEvent {
        match event {
            InputEvent::Mouse(mut m) => {
                (m.x, m.y) = self.scale(m.x, m.y);
                InputEvent::Mouse(m)
            }
            key => key,
        }
    }
}

// ── InputSender ──────────────────────────────────────────────────

/// Sends input events upstream over the session socket.
pub struct InputSender {
    socket: Arc<SessionSocket>,
    sent: AtomicU64,
}

impl InputSender {
    pub fn new(socket: Arc<SessionSocket>) -> Self {
        Self {
            socket,
            sent: AtomicU64::new(0),
        }
    }

    /// Serialize and send one event right away.
    pub fn send(&self, event: InputEvent) -> Result<(), StreamError> {
        let datagram = ControlMessage::Input(event).encode()?;
        self.socket.send(&datagram)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        trace!(?event, "input sent");
        Ok(())
    }

    /// Events successfully handed to the socket.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;
    use crate::transport::bind_udp;
    use std::time::Duration;

    #[test]
    fn viewport_scales_and_clamps() {
        let vp = Viewport::new(960, 540, 1920, 1080);
        assert_eq!(vp.scale(480, 270), (960, 540));
        assert_eq!(vp.scale(960, 540), (1919, 1079));
        assert_eq!(vp.scale(-5, 10), (0, 20));
    }

    #[test]
    fn degenerate_viewport_maps_to_origin() {
        let vp = Viewport::new(0, 0, 1920, 1080);
        assert_eq!(vp.scale(100, 100), (0, 0));
    }

    #[test]
    fn map_leaves_keys_alone() {
        let vp = Viewport::new(100, 100, 200, 200);
        let key = InputEvent::Key(KeyEvent::press(0x41, 0x1E, key_modifiers::SHIFT));
        assert_eq!(vp.map(key), key);
        let moved = vp.map(MouseEvent::move_to(10, 20).into());
        assert_eq!(moved, InputEvent::Mouse(MouseEvent::move_to(20, 40)));
    }

    #[test]
    fn sender_emits_one_datagram_per_event() {
        let timeout = Duration::from_millis(500);
        let host = bind_udp("127.0.0.1:0".parse().unwrap(), timeout).unwrap();
        let viewer = bind_udp("127.0.0.1:0".parse().unwrap(), timeout).unwrap();
        let peer = host.local_addr().unwrap();
        let sender = InputSender::new(Arc::new(SessionSocket::new(viewer, peer, timeout).unwrap()));

        let event = InputEvent::Mouse(MouseEvent::scroll(5, 6, -120));
        sender.send(event).unwrap();
        assert_eq!(sender.sent(), 1);

        let mut buf = [0u8; 256];
        let (n, _) = host.recv_from(&mut buf).unwrap();
        assert_eq!(
            Packet::parse(&buf[..n]).unwrap(),
            Packet::Control(ControlMessage::Input(event))
        );
    }
}
