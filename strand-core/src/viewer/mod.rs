//! Viewer orchestrator.
//!
//! A [`Viewer`] owns one session: the transport socket, jitter buffer,
//! NACK tracker, decoder, renderer, audio player and stats reporter, with
//! one OS thread per stage:
//!
//! ```text
//!  recv ──► jitter buffer ──► decode ──► latest slot ──► render
//!    │          ▲
//!    │        nack (5 ms timer) ──► NACK datagrams to host
//!    └──► audio queue ──► audio ──► playback ring ──► device
//!  stats (interval) ──► callback + VIEWER_STATS + PING
//! ```
//!
//! Each shared structure has its own mutex; no lock is held while another
//! is taken, except the jitter buffer mutex that the decode thread's
//! condvar waits on.
//!
//! Reconnects are driven from outside: the [`ReconnectMachine`] asks for a
//! new transport through the `on_reconnect_needed` callback and the
//! embedding application answers with [`Viewer::on_reconnected`] or
//! [`Viewer::report_reconnect_failed`]. A successful reconnect swaps only
//! the socket and resets receive state; stage threads keep running.

pub mod config;
pub mod queue;
pub mod state;

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::audio::AudioPlayer;
use crate::decoder::{self, DecodedFrame, VideoDecoder};
use crate::encoder::EncoderTelemetry;
use crate::error::StreamError;
use crate::input::{InputEvent, InputSender};
use crate::peer::{ConnectResult, ConnectionType, PeerConnection};
use crate::protocol::{
    AudioHeader, ControlMessage, MAX_DATAGRAM_SIZE, Packet, encode_nack_packets, seq_diff,
};
use crate::render::{self, Renderer};
use crate::stats::{PipelineCounters, StatsReporter, ViewerStats};
use crate::transport::{JitterBuffer, NackTracker, PushOutcome, SessionSocket};
use crate::types::SurfaceHandle;

pub use config::{SessionParams, ViewerCallbacks, ViewerConfig};
pub use queue::{BoundedQueue, LatestSlot};
pub use state::{ConnectionState, ReconnectAction, ReconnectConfig, ReconnectMachine};

const DECODE_IDLE_WAIT: Duration = Duration::from_millis(5);
const RENDER_WAIT: Duration = Duration::from_millis(100);
const AUDIO_WAIT: Duration = Duration::from_millis(10);

// ── Helpers ──────────────────────────────────────────────────────

/// Rate limit for upstream keyframe requests.
#[derive(Debug)]
struct KeyframeLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl KeyframeLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    fn allow(&mut self, now: Instant, force: bool) -> bool {
        let due = self
            .last
            .is_none_or(|t| now.saturating_duration_since(t) >= self.min_interval);
        if due || force {
            self.last = Some(now);
        }
        due || force
    }
}

/// Unwraps 16-bit frame numbers into a media clock.
#[derive(Debug)]
struct MediaClock {
    interval: Duration,
    last: Option<u16>,
    ticks: u64,
}

impl MediaClock {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            ticks: 0,
        }
    }

    fn media_time(&mut self, frame_number: u16) -> Duration {
        if let Some(last) = self.last {
            self.ticks += seq_diff(frame_number, last).max(1) as u64;
        }
        self.last = Some(frame_number);
        Duration::from_nanos((self.interval.as_nanos() as u64).saturating_mul(self.ticks))
    }

    fn reset(&mut self) {
        self.last = None;
    }
}

/// Interruptible sleep for the timer threads.
struct Wakeup {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl Wakeup {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Sleep for `period`; `false` once the viewer is stopping.
    fn sleep(&self, period: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cv.wait_for(&mut stopped, period);
        }
        !*stopped
    }

    fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }
}

// ── Shared session state ─────────────────────────────────────────

struct Shared {
    params: SessionParams,
    callbacks: ViewerCallbacks,
    socket: Arc<SessionSocket>,
    input: InputSender,

    jitter: Mutex<JitterBuffer>,
    frames_ready: Condvar,
    nack: Mutex<NackTracker>,
    render_slot: LatestSlot<DecodedFrame>,
    audio_queue: BoundedQueue<(AudioHeader, Bytes)>,
    audio_active: AtomicBool,

    stats: Mutex<StatsReporter>,
    latest_stats: Mutex<ViewerStats>,
    host_stats: Mutex<Option<EncoderTelemetry>>,
    reconnect: Mutex<ReconnectMachine>,
    keyframes: Mutex<KeyframeLimiter>,
    fingerprint: Mutex<String>,

    keyframe_requests: AtomicU64,
    audio_played: AtomicU64,
    audio_underruns: AtomicU64,
    audio_player_dropped: AtomicU64,
    reconnects: AtomicU64,
    /// Bumped on every reconnect; stage threads reset their state when it
    /// changes.
    epoch: AtomicU64,

    running: AtomicBool,
    wakeup: Wakeup,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn send_control(&self, message: ControlMessage) {
        let sent = message.encode().and_then(|datagram| self.socket.send(&datagram));
        if let Err(e) = sent {
            debug!(kind = ?message.packet_type(), error = %e, "control send failed");
        }
    }

    /// Ask the host for a keyframe unless one was requested recently.
    fn request_keyframe(&self, force: bool) {
        if !self.keyframes.lock().allow(Instant::now(), force) {
            return;
        }
        self.keyframe_requests.fetch_add(1, Ordering::Relaxed);
        debug!(force, "requesting keyframe");
        self.send_control(ControlMessage::KeyframeRequest);
    }

    fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            jitter: self.jitter.lock().stats(),
            nack: self.nack.lock().stats(),
            keyframe_requests: self.keyframe_requests.load(Ordering::Relaxed),
            audio_played: self.audio_played.load(Ordering::Relaxed),
            audio_underruns: self.audio_underruns.load(Ordering::Relaxed),
            audio_dropped: self.audio_queue.dropped()
                + self.audio_player_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Run the callbacks for a reconnect action. Called without locks.
    fn dispatch(&self, action: ReconnectAction) {
        match action {
            ReconnectAction::None => {}
            ReconnectAction::RequestReconnect { attempt } => {
                if attempt == 1 {
                    self.notify_state(ConnectionState::Reconnecting);
                }
                if let Some(cb) = &self.callbacks.on_reconnect_needed {
                    cb(attempt);
                }
            }
            ReconnectAction::Disconnect => {
                self.notify_state(ConnectionState::Disconnected);
                if let Some(cb) = &self.callbacks.on_disconnected {
                    cb();
                }
            }
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        if let Some(cb) = &self.callbacks.on_state_change {
            cb(state);
        }
    }

    // ── Receive path ─────────────────────────────────────────────

    fn on_datagram(&self, data: &[u8], now: Instant) {
        self.reconnect.lock().on_activity(now);
        self.stats.lock().on_datagram(now, data.len());

        match Packet::parse(data) {
            Ok(Packet::Video(header, payload)) => {
                self.nack.lock().on_packet(header.sequence);
                let outcome = self.jitter.lock().push_packet_at(&header, payload, now);
                match outcome {
                    PushOutcome::Completed | PushOutcome::Reset => {
                        self.frames_ready.notify_one();
                    }
                    PushOutcome::Stored => {}
                    PushOutcome::Rejected(reason) => {
                        trace!(seq = header.sequence, frame = header.frame_number, ?reason, "fragment rejected");
                    }
                }
            }
            Ok(Packet::Audio(header, payload)) => {
                if self.audio_active.load(Ordering::Relaxed) {
                    self.audio_queue.push((header, Bytes::copy_from_slice(payload)));
                }
            }
            Ok(Packet::Control(message)) => self.on_control(message, now),
            Ok(Packet::Nack(_)) => trace!("ignoring NACK addressed to a host"),
            Err(e) => debug!(len = data.len(), error = %e, "malformed datagram dropped"),
        }
    }

    fn on_control(&self, message: ControlMessage, now: Instant) {
        match message {
            ControlMessage::Ping(t) => self.send_control(ControlMessage::Pong(t)),
            ControlMessage::Pong(t) => {
                if let Some(rtt) = self.stats.lock().on_pong(t, now) {
                    trace!(rtt_us = rtt.as_micros() as u64, "pong");
                }
            }
            ControlMessage::Probe(id) => self.send_control(ControlMessage::ProbeAck(id)),
            ControlMessage::HostStats(telemetry) => {
                trace!(backend = %telemetry.backend, kbps = telemetry.effective_bitrate_kbps, "host stats");
                *self.host_stats.lock() = Some(telemetry);
            }
            other => trace!(kind = ?other.packet_type(), "ignoring host-bound control message"),
        }
    }

    // ── Reconnect ────────────────────────────────────────────────

    fn reconnected(
        &self,
        socket: UdpSocket,
        peer: SocketAddr,
        fingerprint: &str,
        connection_type: Option<ConnectionType>,
    ) -> Result<(), StreamError> {
        if self.reconnect.lock().state() == ConnectionState::Disconnected {
            return Err(StreamError::InvalidState("session already disconnected"));
        }
        self.socket.swap(socket, peer)?;

        self.jitter.lock().flush();
        self.nack.lock().flush();
        {
            let mut stats = self.stats.lock();
            stats.on_reconnect();
            if let Some(kind) = connection_type {
                stats.set_connection_type(kind);
            }
        }
        self.audio_queue.clear();
        self.render_slot.try_take();
        *self.fingerprint.lock() = fingerprint.to_owned();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.reconnects.fetch_add(1, Ordering::Relaxed);

        let was = self.reconnect.lock().state();
        if !self.reconnect.lock().on_reconnected(Instant::now()) {
            return Err(StreamError::InvalidState("session already disconnected"));
        }
        if was != ConnectionState::Connected {
            self.notify_state(ConnectionState::Connected);
        }
        info!(%peer, generation = self.socket.generation(), "transport replaced");
        self.request_keyframe(true);
        Ok(())
    }
}

// ── Stage threads ────────────────────────────────────────────────

fn receive_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while shared.is_running() {
        let action = shared.reconnect.lock().poll(Instant::now());
        shared.dispatch(action);

        match shared.socket.recv(&mut buf) {
            Ok(Some(len)) => shared.on_datagram(&buf[..len], Instant::now()),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "receive failed");
                shared.wakeup.sleep(shared.params.recv_timeout());
            }
        }
    }
    debug!("receive thread exiting");
}

fn nack_loop(shared: Arc<Shared>) {
    let interval = shared.params.nack.check_interval();
    while shared.wakeup.sleep(interval) {
        let missing = shared.nack.lock().scan();
        if missing.is_empty() {
            continue;
        }
        trace!(count = missing.len(), "sending NACKs");
        for datagram in encode_nack_packets(&missing) {
            if let Err(e) = shared.socket.send(&datagram) {
                debug!(error = %e, "NACK send failed");
            }
        }
    }
    debug!("NACK thread exiting");
}

fn decode_loop(shared: Arc<Shared>, mut decoder: Box<dyn VideoDecoder>) {
    let mut clock = MediaClock::new(shared.params.frame_interval());
    let mut epoch = shared.epoch.load(Ordering::Acquire);
    let mut seen_dropped = 0u64;
    let mut seen_resets = 0u64;
    let mut need_keyframe = false;

    while shared.is_running() {
        let (frame, dropped, resets) = {
            let mut jitter = shared.jitter.lock();
            let frame = jitter.pop_frame();
            if frame.is_none() {
                let wait = jitter
                    .next_deadline()
                    .map_or(DECODE_IDLE_WAIT, |d| d.saturating_duration_since(Instant::now()))
                    .clamp(Duration::from_millis(1), DECODE_IDLE_WAIT);
                shared.frames_ready.wait_for(&mut jitter, wait);
            }
            let stats = jitter.stats();
            (frame, stats.frames_dropped, stats.resets)
        };

        let current = shared.epoch.load(Ordering::Acquire);
        if current != epoch {
            epoch = current;
            decoder.flush();
            clock.reset();
            need_keyframe = true;
            seen_dropped = dropped;
            seen_resets = resets;
        }
        if resets > seen_resets {
            debug!("jitter buffer resynchronized; waiting for a keyframe");
            seen_resets = resets;
            clock.reset();
            need_keyframe = true;
            shared.request_keyframe(false);
        }
        if dropped > seen_dropped {
            debug!(dropped = dropped - seen_dropped, "jitter buffer dropped frames");
            seen_dropped = dropped;
            need_keyframe = true;
            shared.request_keyframe(false);
        }

        let Some(frame) = frame else { continue };
        if need_keyframe {
            if !frame.keyframe {
                trace!(frame = frame.frame_number, "waiting for keyframe");
                shared.request_keyframe(false);
                continue;
            }
            need_keyframe = false;
        }

        let media_time = clock.media_time(frame.frame_number);
        shared.stats.lock().on_frame(frame.first_arrival, media_time);

        let started = Instant::now();
        match decoder.decode(&frame) {
            Ok(Some(decoded)) => {
                shared.stats.lock().on_decoded(started.elapsed());
                if shared.render_slot.put(decoded) {
                    trace!("render slot overwritten before presentation");
                }
            }
            Ok(None) => {}
            Err(e) => {
                shared.stats.lock().on_decode_error();
                if matches!(e, StreamError::NeedKeyframe) {
                    debug!(frame = frame.frame_number, "decoder lost sync");
                } else {
                    warn!(frame = frame.frame_number, error = %e, "decode failed");
                }
                need_keyframe = true;
                shared.request_keyframe(false);
            }
        }
    }
    debug!(backend = decoder.backend(), "decode thread exiting");
}

fn render_loop(shared: Arc<Shared>, mut renderer: Box<dyn Renderer>) {
    while shared.is_running() {
        let Some(frame) = shared.render_slot.take_timeout(RENDER_WAIT) else {
            continue;
        };
        let started = Instant::now();
        match renderer.render(&frame) {
            Ok(()) => shared.stats.lock().on_rendered(started.elapsed()),
            Err(e) => warn!(frame = frame.frame_number, error = %e, "render failed"),
        }
    }
    debug!(backend = renderer.backend(), "render thread exiting");
}

fn audio_loop(shared: Arc<Shared>) {
    let mut player = match AudioPlayer::open(&shared.params.audio) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "audio unavailable; continuing video-only");
            shared.audio_active.store(false, Ordering::Relaxed);
            return;
        }
    };
    let mut epoch = shared.epoch.load(Ordering::Acquire);

    while shared.is_running() {
        let current = shared.epoch.load(Ordering::Acquire);
        if current != epoch {
            epoch = current;
            player.reset();
        }
        if let Some((header, payload)) = shared.audio_queue.pop_timeout(AUDIO_WAIT) {
            player.play(header, &payload);
        }
        player.pump(Instant::now());

        let stats = player.stats();
        shared.audio_played.store(stats.played_packets, Ordering::Relaxed);
        shared.audio_underruns.store(stats.ring.underruns, Ordering::Relaxed);
        shared
            .audio_player_dropped
            .store(stats.stale_packets + stats.decode_errors, Ordering::Relaxed);
    }
    debug!("audio thread exiting");
}

fn stats_loop(shared: Arc<Shared>) {
    let interval = shared.params.stats_interval();
    while shared.wakeup.sleep(interval) {
        let now = Instant::now();
        let counters = shared.counters();
        let (snapshot, ping) = {
            let mut reporter = shared.stats.lock();
            (reporter.snapshot_at(now, &counters), reporter.ping_value(now))
        };
        *shared.latest_stats.lock() = snapshot.clone();

        shared.send_control(ControlMessage::Ping(ping));
        shared.send_control(ControlMessage::ViewerStats(snapshot.clone()));
        if let Some(cb) = &shared.callbacks.on_stats {
            cb(&snapshot);
        }
    }
    debug!("stats thread exiting");
}

// ── Viewer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// One viewer session. See the module docs for the thread layout.
pub struct Viewer {
    shared: Arc<Shared>,
    surface: Option<SurfaceHandle>,
    threads: Vec<JoinHandle<()>>,
    lifecycle: Lifecycle,
}

impl Viewer {
    /// Build the session around an already negotiated socket. Nothing
    /// runs until [`start`](Self::start).
    pub fn new(config: ViewerConfig, callbacks: ViewerCallbacks) -> Result<Self, StreamError> {
        let params = config.session;
        params.validate()?;

        let socket = Arc::new(SessionSocket::new(
            config.socket,
            params.peer_addr,
            params.recv_timeout(),
        )?);
        let mut reporter = StatsReporter::new();
        reporter.set_stream(params.codec, params.width, params.height);

        let shared = Shared {
            input: InputSender::new(Arc::clone(&socket)),
            socket,
            jitter: Mutex::new(JitterBuffer::new(params.jitter.clone())),
            frames_ready: Condvar::new(),
            nack: Mutex::new(NackTracker::new(params.nack.clone())),
            render_slot: LatestSlot::new(),
            audio_queue: BoundedQueue::new(params.audio.queue_packets),
            audio_active: AtomicBool::new(params.audio.enabled),
            stats: Mutex::new(reporter),
            latest_stats: Mutex::new(ViewerStats::default()),
            host_stats: Mutex::new(None),
            reconnect: Mutex::new(ReconnectMachine::new(params.reconnect.clone())),
            keyframes: Mutex::new(KeyframeLimiter::new(params.keyframe_request_interval())),
            fingerprint: Mutex::new(params.fingerprint.clone()),
            keyframe_requests: AtomicU64::new(0),
            audio_played: AtomicU64::new(0),
            audio_underruns: AtomicU64::new(0),
            audio_player_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            running: AtomicBool::new(false),
            wakeup: Wakeup::new(),
            callbacks,
            params,
        };

        Ok(Self {
            shared: Arc::new(shared),
            surface: config.surface,
            threads: Vec::new(),
            lifecycle: Lifecycle::Created,
        })
    }

    /// Open the decoder and renderer and spawn the stage threads.
    ///
    /// Decoder or renderer failures abort the start. Audio failures only
    /// disable audio.
    pub fn start(&mut self) -> Result<(), StreamError> {
        match self.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running => return Err(StreamError::InvalidState("viewer already started")),
            Lifecycle::Stopped => return Err(StreamError::InvalidState("viewer was stopped")),
        }
        let params = &self.shared.params;
        let decoder = decoder::open(params.codec, params.width, params.height)?;
        let renderer = render::open(self.surface)?;
        info!(
            session = %params.session_id,
            codec = %params.codec,
            width = params.width,
            height = params.height,
            peer = %params.peer_addr,
            decoder = decoder.backend(),
            renderer = renderer.backend(),
            "viewer starting"
        );

        self.shared.reconnect.lock().on_reconnected(Instant::now());
        self.shared.running.store(true, Ordering::Release);
        self.lifecycle = Lifecycle::Running;

        if let Err(e) = self.spawn_all(decoder, renderer) {
            error!(error = %e, "failed to spawn viewer threads");
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn spawn_all(
        &mut self,
        decoder: Box<dyn VideoDecoder>,
        renderer: Box<dyn Renderer>,
    ) -> Result<(), StreamError> {
        let s = &self.shared;
        let audio = s.params.audio.enabled;
        let handles = [
            spawn("recv", Arc::clone(s), receive_loop)?,
            spawn("nack", Arc::clone(s), nack_loop)?,
            spawn("decode", Arc::clone(s), move |s| decode_loop(s, decoder))?,
            spawn("render", Arc::clone(s), move |s| render_loop(s, renderer))?,
            spawn("stats", Arc::clone(s), stats_loop)?,
        ];
        self.threads.extend(handles);
        if audio {
            let handle = spawn("audio", Arc::clone(&self.shared), audio_loop)?;
            self.threads.push(handle);
        }
        Ok(())
    }

    /// Stop every thread and wait for it. Safe to call repeatedly and on
    /// a viewer that was never started.
    pub fn stop(&mut self) {
        if self.lifecycle == Lifecycle::Stopped {
            return;
        }
        let was_running = self.lifecycle == Lifecycle::Running;
        self.lifecycle = Lifecycle::Stopped;

        let s = &self.shared;
        s.running.store(false, Ordering::Release);
        s.wakeup.trigger();
        s.frames_ready.notify_all();
        s.render_slot.close();
        s.audio_queue.close();
        s.reconnect.lock().close();

        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("viewer").to_owned();
            if handle.join().is_err() {
                error!(thread = %name, "viewer thread panicked");
            }
        }
        if was_running {
            info!(session = %s.params.session_id, "viewer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    /// Send an input event to the host immediately.
    pub fn send_input(&self, event: InputEvent) -> Result<(), StreamError> {
        if self.lifecycle == Lifecycle::Stopped {
            return Err(StreamError::InvalidState("viewer was stopped"));
        }
        self.shared.input.send(event)
    }

    /// Ask the host for a keyframe now, bypassing the rate limit.
    pub fn request_keyframe(&self) {
        self.shared.request_keyframe(true);
    }

    /// A new transport was negotiated. The peer is the socket's connected
    /// address when it has one, otherwise the current peer.
    pub fn on_reconnected(&self, socket: UdpSocket, fingerprint: &str) -> Result<(), StreamError> {
        if self.lifecycle == Lifecycle::Stopped {
            return Err(StreamError::InvalidState("viewer was stopped"));
        }
        let peer = socket.peer_addr().unwrap_or_else(|_| self.shared.socket.peer());
        self.shared.reconnected(socket, peer, fingerprint, None)
    }

    /// Adopt the socket of a successful [`PeerConnection::connect`].
    pub fn on_peer_connected(
        &self,
        peer: PeerConnection,
        result: &ConnectResult,
        fingerprint: &str,
    ) -> Result<(), StreamError> {
        if self.lifecycle == Lifecycle::Stopped {
            return Err(StreamError::InvalidState("viewer was stopped"));
        }
        let remote = match (result.success, result.remote) {
            (true, Some(remote)) => remote,
            _ => {
                return Err(StreamError::Peer(
                    result.error.clone().unwrap_or_else(|| "connect failed".into()),
                ));
            }
        };
        self.shared
            .reconnected(peer.into_socket(), remote, fingerprint, Some(result.connection_type))
    }

    /// The signaling layer failed to produce a new transport.
    pub fn report_reconnect_failed(&self) {
        let action = self.shared.reconnect.lock().on_attempt_failed(Instant::now());
        self.shared.dispatch(action);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.reconnect.lock().state()
    }

    /// Most recent periodic snapshot.
    pub fn stats(&self) -> ViewerStats {
        self.shared.latest_stats.lock().clone()
    }

    /// Last `HOST_STATS` telemetry received.
    pub fn host_stats(&self) -> Option<EncoderTelemetry> {
        self.shared.host_stats.lock().clone()
    }

    /// Path type reported in stats, as negotiated by the peer layer.
    pub fn set_connection_type(&self, kind: ConnectionType) {
        self.shared.stats.lock().set_connection_type(kind);
    }

    pub fn fingerprint(&self) -> String {
        self.shared.fingerprint.lock().clone()
    }

    pub fn session(&self) -> &SessionParams {
        &self.shared.params
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        self.shared.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.socket.peer()
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn(
    name: &str,
    shared: Arc<Shared>,
    body: impl FnOnce(Arc<Shared>) + Send + 'static,
) -> Result<JoinHandle<()>, StreamError> {
    Ok(thread::Builder::new()
        .name(format!("strand-{name}"))
        .spawn(move || body(shared))?)
}
