//! Integration tests: a host-side encoder and packetizer feeding a real
//! headless `Viewer` over loopback UDP, plus the viewer lifecycle and the
//! reconnect flow.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use strand_core::encoder::ScreenEncoder;
use strand_core::protocol::{AudioHeader, DEFAULT_MTU, decode_nack};
use strand_core::viewer::ReconnectConfig;
use strand_core::{
    AudioCodec, AudioConfig, CapturedFrame, Codec, ConnectionState, ControlMessage, EncoderConfig, FragmentFlags,
    FragmentHeader, Packet, Packetizer, PixelFormat, SessionParams, StreamError, VideoEncoder, Viewer,
    ViewerCallbacks, ViewerConfig,
};

const WIDTH: u32 = 64;
const HEIGHT: u32 = 32;

// ── Helpers ──────────────────────────────────────────────────────

fn loopback() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    socket
}

fn params(peer: SocketAddr) -> SessionParams {
    SessionParams {
        session_id: "it".into(),
        codec: Codec::Screen,
        width: WIDTH,
        height: HEIGHT,
        fps: 30,
        peer_addr: peer,
        fingerprint: "fp-1".into(),
        audio: AudioConfig {
            enabled: false,
            ..AudioConfig::default()
        },
        stats_interval_ms: 50,
        ..SessionParams::default()
    }
}

/// A viewer wired to a fresh host socket. Returns (viewer, host socket,
/// viewer address).
fn viewer_with(params_for: impl FnOnce(SocketAddr) -> SessionParams, callbacks: ViewerCallbacks) -> (Viewer, UdpSocket, SocketAddr) {
    let host = loopback();
    let socket = loopback();
    let viewer_addr = socket.local_addr().unwrap();
    let config = ViewerConfig {
        session: params_for(host.local_addr().unwrap()),
        socket,
        surface: None,
    };
    (Viewer::new(config, callbacks).unwrap(), host, viewer_addr)
}

fn bgra_frame(seed: u8) -> Vec<u8> {
    (0..WIDTH * HEIGHT * 4)
        .map(|i| (i as u8).wrapping_mul(seed).wrapping_add(seed))
        .collect()
}

/// Collect control messages arriving at the host until `done` says stop
/// or `timeout` expires.
fn host_receive_until(host: &UdpSocket, timeout: Duration, mut done: impl FnMut(&Packet<'_>) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 2048];
    while Instant::now() < deadline {
        let Ok(len) = host.recv(&mut buf) else { continue };
        if let Ok(packet) = Packet::parse(&buf[..len]) {
            if done(&packet) {
                return true;
            }
        }
    }
    false
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ── Media path ───────────────────────────────────────────────────

#[test]
fn encoded_frames_reach_the_headless_renderer() {
    let (mut viewer, host, viewer_addr) = viewer_with(params, ViewerCallbacks::new());
    viewer.start().unwrap();

    let mut encoder = ScreenEncoder::new(EncoderConfig {
        codec: Codec::Screen,
        width: WIDTH,
        height: HEIGHT,
        fps: 30,
        ..EncoderConfig::default()
    })
    .unwrap();
    let mut packetizer = Packetizer::new(DEFAULT_MTU).unwrap();

    for seed in 1..=10u8 {
        let pixels = bgra_frame(seed);
        let frame = CapturedFrame {
            width: WIDTH,
            height: HEIGHT,
            pitch: WIDTH * 4,
            format: PixelFormat::Bgra8,
            timestamp: Instant::now(),
            data: &pixels,
            shared: None,
        };
        if let Some(packet) = encoder.encode(&frame).unwrap() {
            for fragment in packetizer.packetize(&packet).unwrap() {
                host.send_to(&fragment.datagram, viewer_addr).unwrap();
            }
        }
        thread::sleep(Duration::from_millis(15));
    }

    assert!(wait_for(Duration::from_secs(3), || viewer.stats().frames_rendered >= 1));
    let stats = viewer.stats();
    assert!(stats.frames_received >= 1);
    assert!(stats.frames_decoded >= stats.frames_rendered);
    assert_eq!(stats.codec, Some(Codec::Screen));
    assert_eq!((stats.width, stats.height), (WIDTH, HEIGHT));

    // The stats thread reports back to the host.
    assert!(host_receive_until(&host, Duration::from_secs(2), |p| {
        matches!(p, Packet::Control(ControlMessage::ViewerStats(_)))
    }));

    viewer.stop();
    assert!(!viewer.is_running());
}

#[test]
fn missing_fragment_is_nacked() {
    let (mut viewer, host, viewer_addr) = viewer_with(params, ViewerCallbacks::new());
    viewer.start().unwrap();

    let send = |sequence: u16, index: u16| {
        let header = FragmentHeader {
            flags: FragmentFlags::KEYFRAME,
            sequence,
            frame_number: 0,
            fragment_index: index,
            fragment_total: 3,
            codec: Codec::Screen,
        };
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(&[0xAB; 32]);
        host.send_to(&datagram, viewer_addr).unwrap();
    };
    send(100, 0);
    send(102, 2);

    let mut nacked = Vec::new();
    assert!(host_receive_until(&host, Duration::from_secs(2), |p| {
        if let Packet::Nack(seqs) = p {
            nacked = seqs.clone();
            true
        } else {
            false
        }
    }));
    assert_eq!(nacked, vec![101]);
    viewer.stop();
}

#[test]
fn audio_plays_in_arrival_order_and_is_never_nacked() {
    let with_audio = |peer| SessionParams {
        audio: AudioConfig {
            enabled: true,
            codec: AudioCodec::Pcm,
            device_output: false,
            ..AudioConfig::default()
        },
        ..params(peer)
    };
    let (mut viewer, host, viewer_addr) = viewer_with(with_audio, ViewerCallbacks::new());
    viewer.start().unwrap();

    // 10 ms of silent 48 kHz stereo s16le.
    let pcm = vec![0u8; 480 * 4];
    let send_audio = |sequence: u16| {
        let header = AudioHeader {
            sequence,
            timestamp: u32::from(sequence) * 480,
        };
        host.send_to(&header.encode(&pcm), viewer_addr).unwrap();
        thread::sleep(Duration::from_millis(5));
    };
    // 13 is skipped, then arrives late; 14 is duplicated.
    for sequence in [10, 11, 12, 14, 13, 14, 15] {
        send_audio(sequence);
    }

    // A video gap on its own sequence space, so the NACK path is live.
    for (sequence, index) in [(500u16, 0u16), (502, 2)] {
        let header = FragmentHeader {
            flags: FragmentFlags::KEYFRAME,
            sequence,
            frame_number: 0,
            fragment_index: index,
            fragment_total: 3,
            codec: Codec::Screen,
        };
        let mut datagram = header.encode().to_vec();
        datagram.extend_from_slice(&[0xAB; 32]);
        host.send_to(&datagram, viewer_addr).unwrap();
    }

    let mut nacked = Vec::new();
    host_receive_until(&host, Duration::from_millis(1500), |p| {
        if let Packet::Nack(seqs) = p {
            nacked.extend_from_slice(seqs);
        }
        false
    });
    assert!(nacked.contains(&501), "video gap not nacked: {nacked:?}");
    assert!(
        nacked.iter().all(|s| !(10..=15).contains(s)),
        "audio sequence nacked: {nacked:?}"
    );

    // 10, 11, 12, 14, 15 play; the late 13 and the second 14 are stale.
    assert!(wait_for(Duration::from_secs(2), || {
        let stats = viewer.stats();
        stats.audio_played == 5 && stats.audio_dropped == 2
    }));
    let stats = viewer.stats();
    assert_eq!(stats.audio_played, 5);
    assert_eq!(stats.audio_dropped, 2);
    viewer.stop();
}

#[test]
fn ping_from_host_is_answered() {
    let (mut viewer, host, viewer_addr) = viewer_with(params, ViewerCallbacks::new());
    viewer.start().unwrap();

    let ping = ControlMessage::Ping(42).encode().unwrap();
    host.send_to(&ping, viewer_addr).unwrap();
    assert!(host_receive_until(&host, Duration::from_secs(2), |p| {
        matches!(p, Packet::Control(ControlMessage::Pong(42)))
    }));
    viewer.stop();
}

#[test]
fn nack_datagram_codec_matches_viewer_expectation() {
    // A host parses viewer NACKs with the same codec the viewer uses.
    let encoded = strand_core::protocol::encode_nack_packets(&[7, 8, 65_535]);
    assert_eq!(encoded.len(), 1);
    assert_eq!(decode_nack(&encoded[0]).unwrap(), vec![7, 8, 65_535]);
}

// ── Lifecycle ────────────────────────────────────────────────────

#[test]
fn stop_is_idempotent_and_restart_is_refused() {
    let (mut never_started, _host, _) = viewer_with(params, ViewerCallbacks::new());
    never_started.stop();
    never_started.stop();
    assert!(matches!(never_started.start(), Err(StreamError::InvalidState(_))));

    let (mut viewer, _host, _) = viewer_with(params, ViewerCallbacks::new());
    viewer.start().unwrap();
    assert!(viewer.is_running());
    assert!(matches!(viewer.start(), Err(StreamError::InvalidState(_))));
    viewer.stop();
    viewer.stop();
    assert!(matches!(viewer.start(), Err(StreamError::InvalidState(_))));
}

#[test]
fn invalid_session_is_rejected_at_construction() {
    let config = ViewerConfig {
        session: SessionParams {
            fps: 0,
            ..SessionParams::default()
        },
        socket: loopback(),
        surface: None,
    };
    assert!(matches!(
        Viewer::new(config, ViewerCallbacks::new()),
        Err(StreamError::InvalidConfig(_))
    ));
}

// ── Reconnect ────────────────────────────────────────────────────

fn fast_reconnect(peer: SocketAddr) -> SessionParams {
    SessionParams {
        reconnect: ReconnectConfig {
            no_activity_timeout_ms: 150,
            attempt_interval_ms: 5_000,
            total_timeout_ms: 10_000,
            max_attempts: 3,
        },
        ..params(peer)
    }
}

#[test]
fn silence_requests_reconnect_and_new_socket_resumes() {
    let (tx, rx) = mpsc::channel();
    let states = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&states);
    let callbacks = ViewerCallbacks::new()
        .on_reconnect_needed(move |attempt| {
            let _ = tx.send(attempt);
        })
        .on_state_change(move |s| seen.lock().unwrap().push(s));

    let (mut viewer, _host, _) = viewer_with(fast_reconnect, callbacks);
    viewer.start().unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 1);
    assert_eq!(viewer.state(), ConnectionState::Reconnecting);

    let new_host = loopback();
    let new_socket = loopback();
    new_socket.connect(new_host.local_addr().unwrap()).unwrap();
    viewer.on_reconnected(new_socket, "fp-2").unwrap();

    assert_eq!(viewer.state(), ConnectionState::Connected);
    assert!(states
        .lock()
        .unwrap()
        .starts_with(&[ConnectionState::Reconnecting, ConnectionState::Connected]));
    assert_eq!(viewer.fingerprint(), "fp-2");
    assert_eq!(viewer.peer_addr(), new_host.local_addr().unwrap());

    // A keyframe is requested on the new transport right away.
    assert!(host_receive_until(&new_host, Duration::from_secs(2), |p| {
        matches!(p, Packet::Control(ControlMessage::KeyframeRequest))
    }));
    assert!(wait_for(Duration::from_secs(2), || viewer.stats().reconnects >= 1));
    viewer.stop();
}

#[test]
fn failed_attempts_disconnect_exactly_once() {
    let (tx, rx) = mpsc::channel();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    let callbacks = ViewerCallbacks::new()
        .on_reconnect_needed(move |attempt| {
            let _ = tx.send(attempt);
        })
        .on_disconnected(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let (mut viewer, _host, _) = viewer_with(fast_reconnect, callbacks);
    viewer.start().unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 1);
    viewer.report_reconnect_failed();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    viewer.report_reconnect_failed();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
    viewer.report_reconnect_failed();

    assert_eq!(viewer.state(), ConnectionState::Disconnected);
    viewer.report_reconnect_failed();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    assert!(matches!(
        viewer.on_reconnected(loopback(), "late"),
        Err(StreamError::InvalidState(_))
    ));
    viewer.stop();
}
