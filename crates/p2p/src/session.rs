//! The per-peer authentication state machine.
//!
//! The session is free of I/O: [PeerSession::handle_frame] consumes one wire
//! frame and returns the frames to send plus any host-visible events, or a
//! [Disconnect] naming the code to close the connection with. The owning task
//! enforces the authentication watchdog through
//! [PeerSession::auth_expired].

use crate::{
    cipher::{CipherSession, AUTH_KEY_SIZE, IDENTITY_SIZE},
    codec::{
        decode_frame, decode_packet, encode_frame, AuthenticationPacket,
        AuthenticationStatusPacket, BlockHeaderWitnessPacket, ClientCipherExchangePacket,
        DiscoverPacket, DiscoveryResponsePacket, Opcode, PingPacket, PongPacket,
        ServerKeyCipherExchangePacket,
    },
    error::{Disconnect, DisconnectionCode},
};
use opnet_types::{now_millis, Network, PeerRecord, ProtocolVersion};
use serde::Serialize;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Handshake progress of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitAuth,
    AwaitCipher,
    Authenticated,
    Terminated,
}

/// Identity and policy the state machine enforces.
#[derive(Clone, Debug)]
pub struct SessionPolicy {
    pub current_version: ProtocolVersion,
    /// Trusted checksum per protocol version string.
    pub trusted_checksums: HashMap<String, Vec<u8>>,
    pub verify_network: bool,
    pub network: Network,
    pub chain_id: u32,
    pub auth_timeout: Duration,
}

impl SessionPolicy {
    pub fn new(network: Network, chain_id: u32) -> Self {
        Self {
            current_version: ProtocolVersion::new(1, 0, 0),
            trusted_checksums: HashMap::new(),
            verify_network: true,
            network,
            chain_id,
            auth_timeout: Duration::from_secs(30),
        }
    }
}

/// Output of one state-machine step.
#[derive(Debug)]
pub enum SessionEvent {
    /// A wire-ready frame, already sealed when the channel is encrypted.
    Send(Vec<u8>),
    /// The handshake completed.
    Authenticated { identity: String },
    /// An application packet for the host.
    BlockHeaderWitness(BlockHeaderWitnessPacket),
}

/// One inbound peer connection.
pub struct PeerSession {
    peer_id: String,
    policy: SessionPolicy,
    phase: SessionPhase,
    cipher: CipherSession,
    /// Generated exactly once, when the version check passes.
    challenge: Option<Vec<u8>>,
    client_version: Option<ProtocolVersion>,
    client_checksum: Option<Vec<u8>>,
    client_network: Option<u8>,
    client_chain_id: Option<u32>,
    /// Hex of the peer's 64-byte identity digest, set after cipher exchange.
    client_identity: Option<String>,
    last_ping: u64,
    created_at: Instant,
    known_peers: Vec<PeerRecord>,
}

impl PeerSession {
    pub fn new(peer_id: impl Into<String>, policy: SessionPolicy) -> Self {
        Self {
            peer_id: peer_id.into(),
            policy,
            phase: SessionPhase::AwaitAuth,
            cipher: CipherSession::new(),
            challenge: None,
            client_version: None,
            client_checksum: None,
            client_network: None,
            client_chain_id: None,
            client_identity: None,
            last_ping: 0,
            created_at: Instant::now(),
            known_peers: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn client_identity(&self) -> Option<&str> {
        self.client_identity.as_deref()
    }

    /// Version the peer advertised, once authentication has started.
    pub fn client_version(&self) -> Option<ProtocolVersion> {
        self.client_version
    }

    pub fn client_checksum(&self) -> Option<&[u8]> {
        self.client_checksum.as_deref()
    }

    pub fn client_network(&self) -> Option<u8> {
        self.client_network
    }

    pub fn client_chain_id(&self) -> Option<u32> {
        self.client_chain_id
    }

    /// Peers advertised through `DiscoveryResponse`.
    pub fn set_known_peers(&mut self, peers: Vec<PeerRecord>) {
        self.known_peers = peers;
    }

    /// Watchdog budget for the handshake.
    pub fn auth_timeout(&self) -> Duration {
        self.policy.auth_timeout
    }

    /// Whether the authentication watchdog should destroy this session.
    pub fn auth_expired(&self, now: Instant) -> bool {
        matches!(self.phase, SessionPhase::AwaitAuth | SessionPhase::AwaitCipher)
            && now.duration_since(self.created_at) >= self.policy.auth_timeout
    }

    /// Idempotent destroy.
    pub fn terminate(&mut self) {
        if self.phase != SessionPhase::Terminated {
            debug!(target: "opnet::p2p", peer = %self.peer_id, "session terminated");
            self.phase = SessionPhase::Terminated;
        }
    }

    /// Consume one wire frame.
    ///
    /// On error the session has already transitioned to `Terminated`; the
    /// caller closes the connection with the returned code.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<Vec<SessionEvent>, Disconnect> {
        let result = self.dispatch_frame(frame);
        if result.is_err() {
            self.terminate();
        }
        result
    }

    fn dispatch_frame(&mut self, frame: &[u8]) -> Result<Vec<SessionEvent>, Disconnect> {
        match self.phase {
            SessionPhase::Terminated => Ok(Vec::new()),
            SessionPhase::AwaitAuth => {
                let (opcode, body) = decode_frame(frame)?;
                match opcode {
                    Opcode::Authentication => self.on_authentication(decode_packet(body)?),
                    other => Err(Disconnect::new(
                        DisconnectionCode::BadPacket,
                        format!("unexpected {other:?} before authentication"),
                    )),
                }
            }
            SessionPhase::AwaitCipher => {
                let (opcode, body) = decode_frame(frame)?;
                match opcode {
                    Opcode::ClientCipherExchange => {
                        self.on_cipher_exchange(decode_packet(body)?)
                    }
                    Opcode::Authentication => Err(Disconnect::new(
                        DisconnectionCode::BadVersion,
                        "authentication already passed",
                    )),
                    other => Err(Disconnect::new(
                        DisconnectionCode::BadPacket,
                        format!("unexpected {other:?} during cipher exchange"),
                    )),
                }
            }
            SessionPhase::Authenticated => {
                // every frame is decrypted before the opcode byte is read
                let plaintext = self.cipher.decrypt(frame).map_err(|_| {
                    Disconnect::new(DisconnectionCode::BadEncryption, "frame failed to open")
                })?;
                let (opcode, body) = decode_frame(&plaintext)?;
                self.on_authenticated_frame(opcode, body)
            }
        }
    }

    fn on_authentication(
        &mut self,
        packet: AuthenticationPacket,
    ) -> Result<Vec<SessionEvent>, Disconnect> {
        // version compatibility: major equal, minor at least ours
        let version: ProtocolVersion = packet.version.parse().map_err(|_| {
            Disconnect::new(DisconnectionCode::BadVersion, format!("bad version {}", packet.version))
        })?;
        if !self.policy.current_version.accepts(&version) {
            return Err(Disconnect::new(
                DisconnectionCode::BadVersion,
                format!("incompatible version {version}"),
            ));
        }

        // the presented trusted checksum must equal our table entry
        let expected = self.policy.trusted_checksums.get(&packet.version);
        if expected.map(|c| c.as_slice()) != Some(packet.trusted_checksum.as_slice()) {
            return Err(Disconnect::new(
                DisconnectionCode::BadTrustedChecksum,
                "trusted checksum mismatch",
            ));
        }

        if packet.client_auth_cipher.len() != AUTH_KEY_SIZE {
            return Err(Disconnect::new(
                DisconnectionCode::BadAuthCipher,
                "auth cipher must be 32 bytes",
            ));
        }

        if self.policy.verify_network {
            if packet.network != self.policy.network.wire_id() {
                return Err(Disconnect::new(DisconnectionCode::BadNetwork, "wrong network"));
            }
            if packet.chain_id != self.policy.chain_id {
                return Err(Disconnect::new(DisconnectionCode::BadChainId, "wrong chain id"));
            }
        }

        self.cipher.set_client_signature_public_key(&packet.client_auth_cipher).map_err(|_| {
            Disconnect::new(DisconnectionCode::BadAuthCipher, "invalid signature public key")
        })?;

        self.client_version = Some(version);
        self.client_checksum = Some(packet.trusted_checksum);
        self.client_network = Some(packet.network);
        self.client_chain_id = Some(packet.chain_id);

        // challenge is generated exactly once
        let challenge = crate::cipher::generate_challenge().to_vec();
        self.challenge = Some(challenge.clone());
        self.cipher.generate_server_cipher_key_pair();
        self.phase = SessionPhase::AwaitCipher;
        debug!(target: "opnet::p2p", peer = %self.peer_id, version = %version, "challenge issued");

        let status = AuthenticationStatusPacket {
            success: true,
            message: String::new(),
            challenge,
        };
        Ok(vec![self.outbound(Opcode::AuthenticationStatus, &status)?])
    }

    fn on_cipher_exchange(
        &mut self,
        packet: ClientCipherExchangePacket,
    ) -> Result<Vec<SessionEvent>, Disconnect> {
        if packet.identity.len() != IDENTITY_SIZE {
            return Err(Disconnect::new(
                DisconnectionCode::BadIdentity,
                "identity must be 64 bytes",
            ));
        }

        // the signature key must equal the one stored during authentication
        let stored = self.cipher.client_signature_public_key().ok_or_else(|| {
            Disconnect::new(DisconnectionCode::BadAuthCipher, "no stored auth cipher")
        })?;
        if packet.client_auth_cipher != stored {
            return Err(Disconnect::new(
                DisconnectionCode::BadAuthCipher,
                "auth cipher changed between packets",
            ));
        }

        let challenge = self.challenge.as_deref().ok_or_else(|| {
            Disconnect::new(DisconnectionCode::BadChallenge, "no challenge issued")
        })?;
        if !CipherSession::verify_challenge(
            &packet.identity,
            challenge,
            &packet.challenge_response,
            &packet.client_auth_cipher,
        ) {
            return Err(Disconnect::new(
                DisconnectionCode::BadChallenge,
                "challenge verification failed",
            ));
        }

        self.cipher.set_client_public_key(&packet.client_key_cipher).map_err(|_| {
            Disconnect::new(DisconnectionCode::BadEncryption, "invalid key cipher")
        })?;

        let exchange = ServerKeyCipherExchangePacket {
            server_key_cipher: self
                .cipher
                .server_public_key()
                .map(|k| k.to_vec())
                .unwrap_or_default(),
            server_signing_cipher: self
                .cipher
                .server_signature_public_key()
                .map(|k| k.to_vec())
                .unwrap_or_default(),
            encryption_enabled: true,
        };
        // the exchange itself travels in the clear; everything after is sealed
        let reply = self.outbound(Opcode::ServerKeyCipherExchange, &exchange)?;

        self.cipher.start_encryption().map_err(|e| {
            Disconnect::new(DisconnectionCode::BadEncryption, format!("key agreement failed: {e}"))
        })?;
        let identity = hex::encode(&packet.identity);
        self.client_identity = Some(identity.clone());
        self.phase = SessionPhase::Authenticated;
        info!(target: "opnet::p2p", peer = %self.peer_id, identity = %identity, "peer authenticated");

        Ok(vec![reply, SessionEvent::Authenticated { identity }])
    }

    fn on_authenticated_frame(
        &mut self,
        opcode: Opcode,
        body: &[u8],
    ) -> Result<Vec<SessionEvent>, Disconnect> {
        match opcode {
            Opcode::Ping => {
                let ping: PingPacket = decode_packet(body)?;
                let previous = self.last_ping;
                self.last_ping = ping.timestamp;
                let pong = PongPacket { timestamp: now_millis(), last_ping: previous };
                Ok(vec![self.outbound(Opcode::Pong, &pong)?])
            }
            // auth packets after authentication are ignored
            Opcode::Authentication
            | Opcode::ClientCipherExchange
            | Opcode::AuthenticationStatus
            | Opcode::ServerKeyCipherExchange => {
                warn!(target: "opnet::p2p", peer = %self.peer_id, ?opcode, "auth packet after authentication ignored");
                Ok(Vec::new())
            }
            Opcode::Discover => {
                let _request: DiscoverPacket = decode_packet(body)?;
                let response = DiscoveryResponsePacket { peers: self.known_peers.clone() };
                Ok(vec![self.outbound(Opcode::DiscoveryResponse, &response)?])
            }
            Opcode::BlockHeaderWitness => {
                let witness: BlockHeaderWitnessPacket = decode_packet(body)?;
                Ok(vec![SessionEvent::BlockHeaderWitness(witness)])
            }
            Opcode::Pong | Opcode::DiscoveryResponse => {
                debug!(target: "opnet::p2p", peer = %self.peer_id, ?opcode, "unsolicited response ignored");
                Ok(Vec::new())
            }
        }
    }

    /// Encode a packet, sealing it when the channel is encrypted.
    fn outbound<T: Serialize>(
        &mut self,
        opcode: Opcode,
        packet: &T,
    ) -> Result<SessionEvent, Disconnect> {
        let frame = encode_frame(opcode, packet).map_err(|e| {
            Disconnect::new(DisconnectionCode::BadPacket, format!("encode failure: {e}"))
        })?;
        if self.cipher.encryption_started() {
            let sealed = self.cipher.encrypt(&frame).map_err(|_| {
                Disconnect::new(DisconnectionCode::BadEncryption, "outbound seal failure")
            })?;
            Ok(SessionEvent::Send(sealed))
        } else {
            Ok(SessionEvent::Send(frame))
        }
    }
}
