//! Host session core.
//!
//! Capture and encode run on a blocking thread and hand
//! [`EncodedPacket`]s to one tokio task that owns the socket. That task
//! packetizes and sends video, answers probes, pings and NACKs, forwards
//! keyframe requests and bitrate changes back to the encoder thread, and
//! replays viewer input.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use strand_core::capture::{self, CaptureBackend};
use strand_core::encoder::{self, EncodedPacket, EncoderTelemetry, VideoEncoder};
use strand_core::protocol::{MAX_DATAGRAM_SIZE, Packet, Packetizer};
use strand_core::{AbrController, ControlMessage, InputInjector, RetransmitBuffer, StreamError};

use crate::config::HostConfig;

/// Encoded frames buffered between the encoder thread and the socket task.
const PACKET_QUEUE: usize = 8;

/// Requests from the socket task to the encoder thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderCommand {
    ForceIdr,
    SetBitrate(u32),
}

// ── HostService ──────────────────────────────────────────────────

/// One host: a bound media socket plus the capture/encode pipeline
/// started by [`run`](Self::run).
pub struct HostService {
    config: HostConfig,
    socket: UdpSocket,
    running: Arc<AtomicBool>,
}

impl HostService {
    /// Bind the media socket.
    pub async fn bind(config: HostConfig) -> Result<Self, StreamError> {
        let socket = UdpSocket::bind(config.network.listen_addr).await?;
        Ok(Self {
            config,
            socket,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        Ok(self.socket.local_addr()?)
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stream until stopped or until the pipeline fails.
    pub async fn run(self) -> Result<(), StreamError> {
        self.running.store(true, Ordering::SeqCst);
        info!(addr = %self.local_addr()?, "host listening");

        let (packet_tx, mut packet_rx) = mpsc::channel(PACKET_QUEUE);
        let (command_tx, command_rx) = std_mpsc::channel();
        let (telemetry_tx, telemetry_rx) = watch::channel(EncoderTelemetry::default());

        let pipeline = {
            let config = self.config.clone();
            let running = Arc::clone(&self.running);
            tokio::task::spawn_blocking(move || {
                encode_loop(&config, &packet_tx, &command_rx, &telemetry_tx, &running)
            })
        };

        let mut session = Session::new(&self.config, command_tx)?;
        let mut ticker = tokio::time::interval(self.config.host_stats_interval());
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => session.on_datagram(&self.socket, &buf[..len], from).await,
                    // ICMP port-unreachable surfaces here on some platforms.
                    Err(e) => debug!(error = %e, "receive error"),
                },
                packet = packet_rx.recv() => match packet {
                    Some(packet) => session.on_packet(&self.socket, &packet).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    let telemetry = telemetry_rx.borrow().clone();
                    session.on_tick(&self.socket, telemetry).await;
                }
                _ = wait_for_stop(&self.running) => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        drop(packet_rx);
        let result = match pipeline.await {
            Ok(result) => result,
            Err(e) => Err(StreamError::Encoder(format!("pipeline thread failed: {e}"))),
        };
        match &result {
            Ok(()) => info!("host stopped"),
            Err(e) => error!(error = %e, "host pipeline ended"),
        }
        result
    }
}

/// Resolves when `running` becomes false.
async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Socket-side session state ────────────────────────────────────

struct Session {
    peer: Option<SocketAddr>,
    pinned: bool,
    packetizer: Packetizer,
    retransmit: RetransmitBuffer,
    abr: AbrController,
    injector: Option<InputInjector>,
    commands: std_mpsc::Sender<EncoderCommand>,
    clock: Instant,
}

impl Session {
    fn new(config: &HostConfig, commands: std_mpsc::Sender<EncoderCommand>) -> Result<Self, StreamError> {
        let enc = &config.encoder;
        let initial_sequence = rand::random::<u16>();
        Ok(Self {
            peer: config.network.peer,
            pinned: config.network.peer.is_some(),
            packetizer: Packetizer::new(config.network.mtu)?.with_initial_sequence(initial_sequence),
            retransmit: RetransmitBuffer::new(config.network.retransmit_capacity),
            abr: AbrController::new(
                config.abr.clone(),
                enc.bitrate_kbps,
                enc.min_bitrate_kbps,
                enc.max_bitrate_kbps,
            ),
            injector: config.inject_input.then(InputInjector::new),
            commands,
            clock: Instant::now(),
        })
    }

    fn now_us(&self) -> u64 {
        self.clock.elapsed().as_micros() as u64
    }

    fn command(&self, command: EncoderCommand) {
        if self.commands.send(command).is_err() {
            debug!(?command, "encoder thread gone");
        }
    }

    async fn send_to(socket: &UdpSocket, datagram: &[u8], to: SocketAddr) {
        if let Err(e) = socket.send_to(datagram, to).await {
            debug!(%to, error = %e, "send failed");
        }
    }

    async fn send_control(&self, socket: &UdpSocket, message: ControlMessage, to: SocketAddr) {
        match message.encode() {
            Ok(datagram) => Self::send_to(socket, &datagram, to).await,
            Err(e) => warn!(error = %e, "control encode failed"),
        }
    }

    /// The latest source of valid traffic becomes the peer unless the
    /// peer is pinned by configuration.
    fn accept_source(&mut self, from: SocketAddr) -> bool {
        match self.peer {
            Some(peer) if peer == from => true,
            Some(_) if self.pinned => false,
            previous => {
                info!(viewer = %from, ?previous, "viewer attached");
                self.peer = Some(from);
                self.command(EncoderCommand::ForceIdr);
                true
            }
        }
    }

    async fn on_datagram(&mut self, socket: &UdpSocket, data: &[u8], from: SocketAddr) {
        let packet = match Packet::parse(data) {
            Ok(p) => p,
            Err(e) => {
                debug!(%from, len = data.len(), error = %e, "malformed datagram dropped");
                return;
            }
        };
        if matches!(packet, Packet::Video(..) | Packet::Audio(..)) {
            trace!(%from, "ignoring media addressed to a host");
            return;
        }
        if !self.accept_source(from) {
            debug!(%from, "datagram from unknown source ignored");
            return;
        }

        match packet {
            Packet::Nack(sequences) => {
                let resend = self.retransmit.answer(&sequences);
                trace!(asked = sequences.len(), resent = resend.len(), "NACK");
                for datagram in resend {
                    Self::send_to(socket, &datagram, from).await;
                }
            }
            Packet::Control(message) => self.on_control(socket, message, from).await,
            Packet::Video(..) | Packet::Audio(..) => {}
        }
    }

    async fn on_control(&mut self, socket: &UdpSocket, message: ControlMessage, from: SocketAddr) {
        match message {
            ControlMessage::Probe(id) => {
                self.send_control(socket, ControlMessage::ProbeAck(id), from).await;
            }
            ControlMessage::Ping(t) => {
                self.send_control(socket, ControlMessage::Pong(t), from).await;
            }
            ControlMessage::Pong(t) => {
                let rtt_us = self.now_us().saturating_sub(t);
                debug!(rtt_ms = rtt_us as f64 / 1000.0, "viewer RTT");
            }
            ControlMessage::KeyframeRequest => {
                debug!("viewer requested a keyframe");
                self.command(EncoderCommand::ForceIdr);
            }
            ControlMessage::ViewerStats(stats) => {
                trace!(fps = stats.fps, loss = stats.loss_fraction, rtt_ms = stats.rtt_ms, "viewer stats");
                if let Some(kbps) = self.abr.on_loss(stats.loss_fraction as f64) {
                    self.command(EncoderCommand::SetBitrate(kbps));
                }
            }
            ControlMessage::Input(event) => match self.injector.as_mut() {
                Some(injector) => {
                    if let Err(e) = injector.inject(&event) {
                        warn!(error = %e, "input injection failed");
                    }
                }
                None => trace!("input injection disabled"),
            },
            ControlMessage::ProbeAck(_) | ControlMessage::HostStats(_) => {}
        }
    }

    async fn on_packet(&mut self, socket: &UdpSocket, packet: &EncodedPacket) {
        let Some(peer) = self.peer else {
            trace!(frame = packet.frame_number, "no viewer yet, frame dropped");
            return;
        };
        let fragments = match self.packetizer.packetize(packet) {
            Ok(f) => f,
            Err(e) => {
                warn!(frame = packet.frame_number, error = %e, "packetize failed");
                return;
            }
        };
        for fragment in fragments {
            Self::send_to(socket, &fragment.datagram, peer).await;
            self.retransmit.insert(fragment);
        }
    }

    async fn on_tick(&mut self, socket: &UdpSocket, telemetry: EncoderTelemetry) {
        let Some(peer) = self.peer else { return };
        self.send_control(socket, ControlMessage::HostStats(telemetry), peer).await;
        self.send_control(socket, ControlMessage::Ping(self.now_us()), peer).await;
    }
}

// ── Capture / encode thread ──────────────────────────────────────

fn open_pipeline(
    config: &HostConfig,
) -> Result<(Box<dyn CaptureBackend>, Box<dyn VideoEncoder>), StreamError> {
    let capture = capture::open(&config.capture)?;
    let (width, height) = capture.resolution();
    let encoder = encoder::open(&config.encoder_for(width, height), config.encoder_backend)?;
    Ok((capture, encoder))
}

/// Keeps wire frame numbers increasing when the encoder is reopened and
/// its own counter starts over.
#[derive(Debug, Default)]
struct FrameNumbering {
    offset: u64,
    next: u64,
    restarted: bool,
}

impl FrameNumbering {
    fn stamp(&mut self, packet: &mut EncodedPacket) {
        if self.restarted {
            self.offset = self.next.wrapping_sub(packet.frame_number);
            self.restarted = false;
        }
        packet.frame_number = packet.frame_number.wrapping_add(self.offset);
        self.next = packet.frame_number.wrapping_add(1);
    }

    fn restart(&mut self) {
        self.restarted = true;
    }
}

fn encode_loop(
    config: &HostConfig,
    packets: &mpsc::Sender<EncodedPacket>,
    commands: &std_mpsc::Receiver<EncoderCommand>,
    telemetry: &watch::Sender<EncoderTelemetry>,
    running: &AtomicBool,
) -> Result<(), StreamError> {
    let (mut capture, mut encoder) = open_pipeline(config)?;
    let timeout = config.capture_timeout();
    let mut numbering = FrameNumbering::default();

    while running.load(Ordering::SeqCst) {
        for command in commands.try_iter() {
            apply_command(encoder.as_mut(), command);
        }

        let encoded = match capture.capture_frame(timeout) {
            Ok(Some(frame)) => encoder.encode(&frame),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        match encoded {
            Ok(Some(mut packet)) => {
                numbering.stamp(&mut packet);
                telemetry.send_replace(encoder.telemetry());
                if packets.blocking_send(packet).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(StreamError::ResolutionChanged { from, to }) => {
                warn!(?from, ?to, "display mode changed, reopening pipeline");
                capture.release();
                (capture, encoder) = open_pipeline(config)?;
                numbering.restart();
            }
            Err(e) => {
                warn!(error = %e, "frame skipped");
                std::thread::sleep(timeout);
            }
        }
    }

    match encoder.flush() {
        Ok(rest) => {
            for mut packet in rest {
                numbering.stamp(&mut packet);
                if packets.blocking_send(packet).is_err() {
                    break;
                }
            }
        }
        Err(e) => debug!(error = %e, "encoder flush failed"),
    }
    capture.release();
    info!(frames = encoder.frame_count(), "capture pipeline stopped");
    Ok(())
}

fn apply_command(encoder: &mut dyn VideoEncoder, command: EncoderCommand) {
    match command {
        EncoderCommand::ForceIdr => encoder.force_idr(),
        EncoderCommand::SetBitrate(kbps) => {
            let next = strand_core::EncoderConfig {
                bitrate_kbps: kbps,
                ..encoder.config().clone()
            };
            if let Err(e) = encoder.reconfigure(&next) {
                warn!(kbps, error = %e, "bitrate change rejected");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::protocol::encode_nack_packets;
    use strand_core::{CaptureKind, Codec, FragmentFlags};

    fn test_config() -> HostConfig {
        let mut cfg = HostConfig::default();
        cfg.network.listen_addr = "127.0.0.1:0".parse().unwrap();
        cfg.network.host_stats_interval_ms = 50;
        cfg.network.capture_timeout_ms = 10;
        cfg.capture.kind = CaptureKind::Synthetic;
        cfg.capture.synthetic_width = 64;
        cfg.capture.synthetic_height = 48;
        cfg.capture.synthetic_fps = 30;
        cfg.encoder.codec = Codec::Screen;
        cfg
    }

    async fn start(cfg: HostConfig) -> (SocketAddr, Arc<AtomicBool>, tokio::task::JoinHandle<Result<(), StreamError>>) {
        let service = HostService::bind(cfg).await.unwrap();
        let addr = service.local_addr().unwrap();
        let stop = service.stop_handle();
        let handle = tokio::spawn(service.run());
        (addr, stop, handle)
    }

    /// Receive until `pick` returns something, or give up after `limit`.
    async fn recv_until<T>(
        socket: &UdpSocket,
        limit: Duration,
        mut pick: impl FnMut(Packet<'_>) -> Option<T>,
    ) -> Option<T> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        tokio::time::timeout(limit, async {
            loop {
                let (len, _) = socket.recv_from(&mut buf).await.unwrap();
                if let Ok(packet) = Packet::parse(&buf[..len]) {
                    if let Some(found) = pick(packet) {
                        return found;
                    }
                }
            }
        })
        .await
        .ok()
    }

    #[tokio::test]
    async fn probe_attaches_viewer_and_nacks_are_retransmitted() {
        let (addr, stop, handle) = start(test_config()).await;
        let viewer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let probe = ControlMessage::Probe(7).encode().unwrap();
        viewer.send_to(&probe, addr).await.unwrap();
        let acked = recv_until(&viewer, Duration::from_secs(2), |p| match p {
            Packet::Control(ControlMessage::ProbeAck(id)) => Some(id),
            _ => None,
        })
        .await;
        assert_eq!(acked, Some(7));

        let keyframe_seq = recv_until(&viewer, Duration::from_secs(3), |p| match p {
            Packet::Video(h, _) if h.flags.contains(FragmentFlags::KEYFRAME) => Some(h.sequence),
            _ => None,
        })
        .await
        .expect("no keyframe");

        for nack in encode_nack_packets(&[keyframe_seq]) {
            viewer.send_to(&nack, addr).await.unwrap();
        }
        let resent = recv_until(&viewer, Duration::from_secs(2), |p| match p {
            Packet::Video(h, _) if h.flags.contains(FragmentFlags::RETRANSMIT) => Some(h.sequence),
            _ => None,
        })
        .await;
        assert_eq!(resent, Some(keyframe_seq));

        stop.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered_and_host_stats_are_sent() {
        let (addr, stop, handle) = start(test_config()).await;
        let viewer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let ping = ControlMessage::Ping(99).encode().unwrap();
        viewer.send_to(&ping, addr).await.unwrap();
        let pong = recv_until(&viewer, Duration::from_secs(2), |p| match p {
            Packet::Control(ControlMessage::Pong(t)) => Some(t),
            _ => None,
        })
        .await;
        assert_eq!(pong, Some(99));

        let telemetry = recv_until(&viewer, Duration::from_secs(3), |p| match p {
            Packet::Control(ControlMessage::HostStats(t)) if t.frames_encoded > 0 => Some(t),
            _ => None,
        })
        .await
        .expect("no host stats");
        assert_eq!(telemetry.codec, Some(Codec::Screen));

        stop.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pinned_peer_ignores_other_sources() {
        let mut cfg = test_config();
        cfg.network.peer = Some("127.0.0.1:9".parse().unwrap());
        let (addr, stop, handle) = start(cfg).await;
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let ping = ControlMessage::Ping(1).encode().unwrap();
        stranger.send_to(&ping, addr).await.unwrap();
        let answered = recv_until(&stranger, Duration::from_millis(300), |p| match p {
            Packet::Control(ControlMessage::Pong(_)) => Some(()),
            _ => None,
        })
        .await;
        assert!(answered.is_none());

        stop.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn frame_numbers_continue_across_pipeline_reopen() {
        let packet = |n: u64| EncodedPacket {
            frame_number: n,
            keyframe: n == 0,
            codec: Codec::Screen,
            data: n.to_be_bytes().to_vec().into(),
            timestamp: Instant::now(),
        };
        let mut numbering = FrameNumbering::default();
        let mut wire = Vec::new();
        for n in 0..5000 {
            let mut p = packet(n);
            numbering.stamp(&mut p);
            wire.push(p.frame_number);
        }
        numbering.restart();
        for n in 0..600 {
            let mut p = packet(n);
            numbering.stamp(&mut p);
            wire.push(p.frame_number);
        }
        assert!(wire.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(wire.last(), Some(&5599));

        // A reopened encoder that starts counting at 1 still lines up.
        numbering.restart();
        let mut p = packet(1);
        numbering.stamp(&mut p);
        assert_eq!(p.frame_number, 5600);
    }

    #[test]
    fn bitrate_command_keeps_frame_counter() {
        let cfg = test_config();
        let mut enc = encoder::open(&cfg.encoder_for(64, 48), None).unwrap();
        apply_command(enc.as_mut(), EncoderCommand::SetBitrate(5000));
        assert_eq!(enc.config().bitrate_kbps, 5000);
        assert_eq!(enc.frame_count(), 0);
        apply_command(enc.as_mut(), EncoderCommand::SetBitrate(0));
        assert_eq!(enc.config().bitrate_kbps, 5000);
    }
}
