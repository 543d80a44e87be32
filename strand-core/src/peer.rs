//! Peer connection establishment over UDP.
//!
//! Candidate exchange happens out of band (the signaling channel); this
//! module gathers local candidates, accepts remote ones, and runs a simple
//! connectivity check: `PROBE` datagrams carrying a transaction id are sent
//! to every remote candidate in priority order until one answers with a
//! matching `PROBE_ACK`. Probes from the remote side are answered while
//! checking.
//!
//! Server-reflexive candidates come from a STUN binding request (RFC 5389,
//! `XOR-MAPPED-ADDRESS`).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::protocol::{ControlMessage, MAX_DATAGRAM_SIZE, Packet};
use crate::transport::bind_udp;

/// Spacing between probe rounds.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// How long to keep answering remote probes after our own check succeeded.
pub const ANSWER_LINGER: Duration = Duration::from_millis(150);

const STUN_TIMEOUT: Duration = Duration::from_millis(500);

// ── Candidates ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    Relay,
}

impl CandidateKind {
    /// RFC 8445 type preference.
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relay => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: SocketAddr,
    pub priority: u32,
}

impl Candidate {
    pub fn new(kind: CandidateKind, addr: SocketAddr) -> Self {
        // Single component, local preference favours IPv4.
        let local_pref: u32 = if addr.is_ipv4() { 65535 } else { 65534 };
        Self {
            kind,
            addr,
            priority: (kind.type_preference() << 24) + (local_pref << 8) + 255,
        }
    }
}

/// Path class of an established connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    #[default]
    Unknown,
    /// Direct host-to-host path (LAN).
    Direct,
    /// Through NAT via server-reflexive addresses.
    Reflexive,
    Relay,
}

impl From<CandidateKind> for ConnectionType {
    fn from(kind: CandidateKind) -> Self {
        match kind {
            CandidateKind::Host => ConnectionType::Direct,
            CandidateKind::ServerReflexive => ConnectionType::Reflexive,
            CandidateKind::Relay => ConnectionType::Relay,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionType::Unknown => "unknown",
            ConnectionType::Direct => "direct",
            ConnectionType::Reflexive => "reflexive",
            ConnectionType::Relay => "relay",
        })
    }
}

/// Outcome of [`PeerConnection::connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    pub success: bool,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub connection_type: ConnectionType,
    pub error: Option<String>,
}

// ── STUN ─────────────────────────────────────────────────────────

pub mod stun {
    //! Minimal STUN binding client (RFC 5389).

    use super::*;

    pub const MAGIC_COOKIE: u32 = 0x2112_A442;
    const BINDING_REQUEST: u16 = 0x0001;
    const BINDING_SUCCESS: u16 = 0x0101;
    const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
    const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
    const HEADER_SIZE: usize = 20;

    pub type TransactionId = [u8; 12];

    pub fn binding_request(tx: &TransactionId) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
        // Message length 0: no attributes.
        buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf[8..20].copy_from_slice(tx);
        buf
    }

    /// Extract the mapped address from a binding success response.
    pub fn parse_binding_response(
        data: &[u8],
        tx: &TransactionId,
    ) -> Result<SocketAddr, StreamError> {
        if data.len() < HEADER_SIZE {
            return Err(StreamError::PacketTooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        if u16::from_be_bytes([data[0], data[1]]) != BINDING_SUCCESS {
            return Err(StreamError::InvalidHeader("not a STUN binding success"));
        }
        if data[4..8] != MAGIC_COOKIE.to_be_bytes() || &data[8..20] != tx {
            return Err(StreamError::InvalidHeader("STUN transaction mismatch"));
        }
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let body = data
            .get(HEADER_SIZE..HEADER_SIZE + length)
            .ok_or(StreamError::PacketTooShort {
                expected: HEADER_SIZE + length,
                actual: data.len(),
            })?;

        let mut fallback = None;
        let mut offset = 0;
        while offset + 4 <= body.len() {
            let kind = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            let Some(value) = body.get(offset + 4..offset + 4 + len) else {
                break;
            };
            match kind {
                ATTR_XOR_MAPPED_ADDRESS => return decode_address(value, Some(tx)),
                ATTR_MAPPED_ADDRESS => fallback = Some(decode_address(value, None)?),
                _ => {}
            }
            // Attributes are padded to 4 bytes.
            offset += 4 + len.div_ceil(4) * 4;
        }
        fallback.ok_or(StreamError::InvalidHeader("STUN response without mapped address"))
    }

    fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr, StreamError> {
        if value.len() < 8 {
            return Err(StreamError::PacketTooShort {
                expected: 8,
                actual: value.len(),
            });
        }
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let mut port = u16::from_be_bytes([value[2], value[3]]);
        if xor.is_some() {
            port ^= (MAGIC_COOKIE >> 16) as u16;
        }
        match value[1] {
            0x01 => {
                let mut octets = [value[4], value[5], value[6], value[7]];
                if xor.is_some() {
                    for (o, c) in octets.iter_mut().zip(cookie) {
                        *o ^= c;
                    }
                }
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            0x02 => {
                let mut octets: [u8; 16] = value
                    .get(4..20)
                    .and_then(|s| s.try_into().ok())
                    .ok_or(StreamError::PacketTooShort {
                        expected: 20,
                        actual: value.len(),
                    })?;
                if let Some(tx) = xor {
                    let key = cookie.iter().chain(tx.iter());
                    for (o, k) in octets.iter_mut().zip(key) {
                        *o ^= k;
                    }
                }
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => Err(StreamError::UnknownVariant {
                type_name: "StunAddressFamily",
                value: other as u64,
            }),
        }
    }

    /// Send a binding request from `socket` and wait for the answer.
    pub fn query(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr, StreamError> {
        let tx: TransactionId = rand::random();
        socket.send_to(&binding_request(&tx), server)?;
        let deadline = Instant::now() + STUN_TIMEOUT;
        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) if from == server => return parse_binding_response(&buf[..n], &tx),
                Ok(_) => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StreamError::Timeout(STUN_TIMEOUT))
    }
}

// ── PeerConnection ───────────────────────────────────────────────

/// One UDP socket plus the candidates on both sides.
pub struct PeerConnection {
    socket: UdpSocket,
    local: Vec<Candidate>,
    remote: Vec<Candidate>,
}

impl PeerConnection {
    /// Bind the media socket.
    pub fn bind(local: SocketAddr) -> Result<Self, StreamError> {
        let socket = bind_udp(local, Duration::from_millis(10))?;
        Ok(Self {
            socket,
            local: Vec::new(),
            remote: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        Ok(self.socket.local_addr()?)
    }

    /// Host candidate plus one server-reflexive candidate per reachable
    /// STUN server. STUN failures are logged and skipped.
    pub fn gather_candidates(&mut self, stun_servers: &[SocketAddr]) -> Result<Vec<Candidate>, StreamError> {
        let bound = self.socket.local_addr()?;
        let host_ip = if bound.ip().is_unspecified() {
            stun_servers
                .first()
                .and_then(|server| route_ip(*server))
                .unwrap_or(bound.ip())
        } else {
            bound.ip()
        };
        let mut candidates = vec![Candidate::new(
            CandidateKind::Host,
            SocketAddr::new(host_ip, bound.port()),
        )];

        for server in stun_servers {
            match stun::query(&self.socket, *server) {
                Ok(mapped) if candidates.iter().all(|c| c.addr != mapped) => {
                    debug!(%server, %mapped, "server-reflexive candidate");
                    candidates.push(Candidate::new(CandidateKind::ServerReflexive, mapped));
                }
                Ok(_) => {}
                Err(e) => warn!(%server, error = %e, "STUN query failed"),
            }
        }
        info!(count = candidates.len(), "candidates gathered");
        self.local = candidates.clone();
        Ok(candidates)
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local
    }

    pub fn add_remote_candidate(&mut self, candidate: Candidate) {
        if !self.remote.iter().any(|c| c.addr == candidate.addr) {
            self.remote.push(candidate);
            self.remote.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote
    }

    /// Run connectivity checks until a remote candidate answers or
    /// `timeout` elapses.
    pub fn connect(&self, timeout: Duration) -> ConnectResult {
        let local = self.socket.local_addr().ok();
        if self.remote.is_empty() {
            return ConnectResult {
                success: false,
                local,
                remote: None,
                connection_type: ConnectionType::Unknown,
                error: Some("no remote candidates".into()),
            };
        }

        let tx_id: u64 = rand::random();
        let probe = match ControlMessage::Probe(tx_id).encode() {
            Ok(p) => p,
            Err(e) => {
                return ConnectResult {
                    success: false,
                    local,
                    remote: None,
                    connection_type: ConnectionType::Unknown,
                    error: Some(e.to_string()),
                };
            }
        };

        let deadline = Instant::now() + timeout;
        let mut next_round = Instant::now();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        while Instant::now() < deadline {
            if Instant::now() >= next_round {
                for candidate in &self.remote {
                    if let Err(e) = self.socket.send_to(&probe, candidate.addr) {
                        debug!(remote = %candidate.addr, error = %e, "probe send failed");
                    }
                }
                next_round = Instant::now() + PROBE_INTERVAL;
            }
            if let Some(from) = self.poll(&mut buf, tx_id) {
                let kind = self
                    .remote
                    .iter()
                    .find(|c| c.addr == from)
                    .map(|c| c.kind)
                    .unwrap_or(CandidateKind::ServerReflexive);
                self.linger(&mut buf);
                let connection_type = ConnectionType::from(kind);
                info!(remote = %from, %connection_type, "peer connected");
                return ConnectResult {
                    success: true,
                    local,
                    remote: Some(from),
                    connection_type,
                    error: None,
                };
            }
        }

        warn!(?timeout, candidates = self.remote.len(), "connectivity check timed out");
        ConnectResult {
            success: false,
            local,
            remote: None,
            connection_type: ConnectionType::Unknown,
            error: Some(format!("no candidate answered within {timeout:?}")),
        }
    }

    /// Hand the socket over to the media session.
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }

    /// Receive one datagram: answer probes, report a matching ack.
    fn poll(&self, buf: &mut [u8], tx_id: u64) -> Option<SocketAddr> {
        let (n, from) = self.socket.recv_from(buf).ok()?;
        match Packet::parse(&buf[..n]) {
            Ok(Packet::Control(ControlMessage::Probe(id))) => {
                if let Ok(ack) = ControlMessage::ProbeAck(id).encode() {
                    let _ = self.socket.send_to(&ack, from);
                }
                None
            }
            Ok(Packet::Control(ControlMessage::ProbeAck(id))) if id == tx_id => Some(from),
            _ => None,
        }
    }

    fn linger(&self, buf: &mut [u8]) {
        let until = Instant::now() + ANSWER_LINGER;
        while Instant::now() < until {
            self.poll(buf, 0);
        }
    }
}

/// Local interface address the OS would use to reach `target`.
fn route_ip(target: SocketAddr) -> Option<IpAddr> {
    let any: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let probe = UdpSocket::bind(any).ok()?;
    probe.connect(target).ok()?;
    probe.local_addr().ok().map(|a| a.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn host_candidates_outrank_reflexive() {
        let addr: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let host = Candidate::new(CandidateKind::Host, addr);
        let srflx = Candidate::new(CandidateKind::ServerReflexive, addr);
        let relay = Candidate::new(CandidateKind::Relay, addr);
        assert!(host.priority > srflx.priority);
        assert!(srflx.priority > relay.priority);
        assert_eq!(host.priority, (126 << 24) + (65535 << 8) + 255);
    }

    #[test]
    fn remote_candidates_sorted_and_deduplicated() {
        let mut pc = PeerConnection::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let a: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:1000".parse().unwrap();
        pc.add_remote_candidate(Candidate::new(CandidateKind::ServerReflexive, a));
        pc.add_remote_candidate(Candidate::new(CandidateKind::Host, b));
        pc.add_remote_candidate(Candidate::new(CandidateKind::Host, a));
        let remote = pc.remote_candidates();
        assert_eq!(remote.len(), 2);
        assert_eq!(remote[0].addr, b);
    }

    #[test]
    fn xor_mapped_ipv4() {
        let tx: stun::TransactionId = [7; 12];
        let mapped: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let cookie = stun::MAGIC_COOKIE.to_be_bytes();

        let mut attr = vec![0x00, 0x01];
        attr.extend_from_slice(&(40000u16 ^ 0x2112).to_be_bytes());
        for (o, c) in [203u8, 0, 113, 9].iter().zip(cookie) {
            attr.push(o ^ c);
        }
        let mut resp = vec![0x01, 0x01, 0x00, 12];
        resp.extend_from_slice(&cookie);
        resp.extend_from_slice(&tx);
        resp.extend_from_slice(&[0x00, 0x20, 0x00, 0x08]);
        resp.extend_from_slice(&attr);

        assert_eq!(stun::parse_binding_response(&resp, &tx).unwrap(), mapped);
        assert!(matches!(
            stun::parse_binding_response(&resp, &[8; 12]),
            Err(StreamError::InvalidHeader(_))
        ));
    }

    #[test]
    fn binding_request_layout() {
        let req = stun::binding_request(&[1; 12]);
        assert_eq!(&req[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
    }

    #[test]
    fn connect_without_candidates_fails_fast() {
        let pc = PeerConnection::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let result = pc.connect(Duration::from_secs(5));
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[test]
    fn connect_to_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        responder
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, from) = responder.recv_from(&mut buf).unwrap();
            let Packet::Control(ControlMessage::Probe(id)) = Packet::parse(&buf[..n]).unwrap()
            else {
                panic!("expected probe");
            };
            let ack = ControlMessage::ProbeAck(id).encode().unwrap();
            responder.send_to(&ack, from).unwrap();
        });

        let mut pc = PeerConnection::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        pc.add_remote_candidate(Candidate::new(CandidateKind::Host, responder_addr));
        let result = pc.connect(Duration::from_secs(2));
        handle.join().unwrap();

        assert!(result.success, "{result:?}");
        assert_eq!(result.remote, Some(responder_addr));
        assert_eq!(result.connection_type, ConnectionType::Direct);
    }

    #[test]
    fn connect_times_out_against_silence() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut pc = PeerConnection::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        pc.add_remote_candidate(Candidate::new(CandidateKind::Host, silent.local_addr().unwrap()));
        let result = pc.connect(Duration::from_millis(120));
        assert!(!result.success);
        assert_eq!(result.connection_type, ConnectionType::Unknown);
    }
}
