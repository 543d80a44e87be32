//! Peer negotiation for the initial session and for reconnects.
//!
//! Runs the blocking [`PeerConnection`] flow: bind, gather candidates,
//! probe the host. The embedding signaling is reduced to a configured
//! host address, which is added as the only remote host candidate.

use tracing::{info, warn};

use strand_core::{Candidate, CandidateKind, ConnectResult, PeerConnection, StreamError};

use crate::config::ViewerAppConfig;

/// A probed, working path to the host.
pub struct Established {
    pub peer: PeerConnection,
    pub result: ConnectResult,
}

/// Negotiate a fresh socket with the host. Blocking.
pub fn establish(config: &ViewerAppConfig) -> Result<Established, StreamError> {
    let mut peer = PeerConnection::bind(config.network.bind_address)?;
    let local = peer.gather_candidates(&config.network.stun_servers)?;
    info!(candidates = local.len(), "local candidates gathered");

    peer.add_remote_candidate(Candidate::new(CandidateKind::Host, config.network.host_address));
    let result = peer.connect(config.connect_timeout());
    if !result.success {
        let reason = result.error.clone().unwrap_or_else(|| "no candidate answered".into());
        warn!(host = %config.network.host_address, %reason, "peer connection failed");
        return Err(StreamError::Peer(reason));
    }
    Ok(Established { peer, result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::thread;
    use std::time::Duration;

    use strand_core::{ControlMessage, Packet};

    fn config_for(host: std::net::SocketAddr) -> ViewerAppConfig {
        let mut cfg = ViewerAppConfig::default();
        cfg.network.host_address = host;
        cfg.network.bind_address = "127.0.0.1:0".parse().unwrap();
        cfg.network.connect_timeout_ms = 2000;
        cfg
    }

    #[test]
    fn establishes_against_a_probe_answering_host() {
        let host = UdpSocket::bind("127.0.0.1:0").unwrap();
        host.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let host_addr = host.local_addr().unwrap();

        let responder = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let (len, from) = host.recv_from(&mut buf).unwrap();
            if let Ok(Packet::Control(ControlMessage::Probe(id))) = Packet::parse(&buf[..len]) {
                let ack = ControlMessage::ProbeAck(id).encode().unwrap();
                host.send_to(&ack, from).unwrap();
            }
        });

        let established = establish(&config_for(host_addr)).unwrap();
        assert!(established.result.success);
        assert_eq!(established.result.remote, Some(host_addr));
        responder.join().unwrap();
    }

    #[test]
    fn silent_host_is_a_peer_error() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut cfg = config_for(silent.local_addr().unwrap());
        cfg.network.connect_timeout_ms = 200;
        assert!(matches!(establish(&cfg), Err(StreamError::Peer(_))));
    }
}
