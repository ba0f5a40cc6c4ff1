//! TCP transport for peer sessions.
//!
//! Frames travel length-prefixed (u32 little-endian) over the socket. Each
//! accepted connection owns its [PeerSession]; the task enforces the
//! authentication watchdog and closes the socket on any terminal failure.

use crate::{
    codec::BlockHeaderWitnessPacket,
    error::{Disconnect, DisconnectionCode},
    session::{PeerSession, SessionEvent, SessionPolicy},
};
use opnet_types::PeerRecord;
use parking_lot::RwLock;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

/// Largest accepted wire frame.
const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Host-visible session events.
#[derive(Debug)]
pub enum P2pEvent {
    PeerAuthenticated { peer_id: String, identity: String },
    BlockHeaderWitness { peer_id: String, witness: BlockHeaderWitnessPacket },
    PeerDisconnected { peer_id: String, code: DisconnectionCode, reason: String },
}

/// Accept loop plus shared peer table.
pub struct P2pService {
    local_addr: SocketAddr,
    known_peers: Arc<RwLock<Vec<PeerRecord>>>,
    accept_task: JoinHandle<()>,
}

impl P2pService {
    /// Bind and start accepting connections.
    pub async fn bind(
        addr: &str,
        policy: SessionPolicy,
        events: mpsc::Sender<P2pEvent>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(target: "opnet::p2p", %local_addr, "p2p service listening");

        let known_peers: Arc<RwLock<Vec<PeerRecord>>> = Arc::new(RwLock::new(Vec::new()));
        let peers = known_peers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let session =
                            PeerSession::new(remote.to_string(), policy.clone());
                        let events = events.clone();
                        let peers = peers.clone();
                        tokio::spawn(async move {
                            drive_session(stream, session, peers, events).await;
                        });
                    }
                    Err(e) => {
                        warn!(target: "opnet::p2p", error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self { local_addr, known_peers, accept_task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replace the peer table advertised through `Discover`.
    pub fn set_known_peers(&self, peers: Vec<PeerRecord>) {
        *self.known_peers.write() = peers;
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for P2pService {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn drive_session(
    mut stream: TcpStream,
    mut session: PeerSession,
    peers: Arc<RwLock<Vec<PeerRecord>>>,
    events: mpsc::Sender<P2pEvent>,
) {
    let peer_id = session.peer_id().to_string();
    let auth_deadline = Instant::now() + session.auth_timeout();

    let disconnect = loop {
        session.set_known_peers(peers.read().clone());
        let awaiting_auth = matches!(
            session.phase(),
            crate::session::SessionPhase::AwaitAuth | crate::session::SessionPhase::AwaitCipher
        );

        tokio::select! {
            frame = read_frame(&mut stream) => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break None,
                    Err(d) => break Some(d),
                };
                match session.handle_frame(&frame) {
                    Ok(session_events) => {
                        if deliver_events(&mut stream, &peer_id, session_events, &events)
                            .await
                            .is_err()
                        {
                            break None;
                        }
                    }
                    Err(d) => break Some(d),
                }
            }
            _ = sleep_until(auth_deadline), if awaiting_auth => {
                break Some(Disconnect::new(
                    DisconnectionCode::AuthTimedOut,
                    "authentication watchdog fired",
                ));
            }
        }
    };

    session.terminate();
    if let Some(disconnect) = disconnect {
        debug!(target: "opnet::p2p", peer = %peer_id, code = ?disconnect.code, reason = %disconnect.reason, "disconnecting peer");
        let _ = events
            .send(P2pEvent::PeerDisconnected {
                peer_id: peer_id.clone(),
                code: disconnect.code,
                reason: disconnect.reason,
            })
            .await;
    }
    let _ = stream.shutdown().await;
}

async fn deliver_events(
    stream: &mut TcpStream,
    peer_id: &str,
    session_events: Vec<SessionEvent>,
    events: &mpsc::Sender<P2pEvent>,
) -> std::io::Result<()> {
    for event in session_events {
        match event {
            SessionEvent::Send(frame) => write_frame(stream, &frame).await?,
            SessionEvent::Authenticated { identity } => {
                let _ = events
                    .send(P2pEvent::PeerAuthenticated { peer_id: peer_id.to_string(), identity })
                    .await;
            }
            SessionEvent::BlockHeaderWitness(witness) => {
                let _ = events
                    .send(P2pEvent::BlockHeaderWitness { peer_id: peer_id.to_string(), witness })
                    .await;
            }
        }
    }
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, Disconnect> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(_) => return Ok(None),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(Disconnect::new(
            DisconnectionCode::BadPacket,
            format!("invalid frame length {len}"),
        ));
    }
    let mut frame = vec![0u8; len as usize];
    stream
        .read_exact(&mut frame)
        .await
        .map_err(|_| Disconnect::new(DisconnectionCode::BadPacket, "truncated frame"))?;
    Ok(Some(frame))
}

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(frame.len() as u32).to_le_bytes()).await?;
    stream.write_all(frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use opnet_types::Network;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn policy(auth_timeout: Duration) -> SessionPolicy {
        let mut policy = SessionPolicy::new(Network::Regtest, 1);
        policy.auth_timeout = auth_timeout;
        policy
    }

    #[tokio::test]
    async fn idle_connection_is_destroyed_by_the_watchdog() -> eyre::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let service =
            P2pService::bind("127.0.0.1:0", policy(Duration::from_millis(150)), events_tx).await?;

        let mut stream = TcpStream::connect(service.local_addr()).await?;

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv()).await?;
        match event {
            Some(P2pEvent::PeerDisconnected { code, .. }) => {
                assert_eq!(code, DisconnectionCode::AuthTimedOut);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }

        // the socket is closed from the server side
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await?;
        assert_eq!(read?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_opcode_disconnects_with_bad_packet() -> eyre::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let service =
            P2pService::bind("127.0.0.1:0", policy(Duration::from_secs(30)), events_tx).await?;

        let mut stream = TcpStream::connect(service.local_addr()).await?;
        write_frame(&mut stream, &[0xff, 0x00]).await?;

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv()).await?;
        match event {
            Some(P2pEvent::PeerDisconnected { code, .. }) => {
                assert_eq!(code, DisconnectionCode::BadPacket);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        Ok(())
    }
}
