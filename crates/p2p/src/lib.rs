//! Peer-to-peer authentication and session state machine.
//!
//! Inbound connections run a four-phase handshake: version check, challenge,
//! cipher exchange, encrypted session. The state machine itself is free of
//! I/O; [service::P2pService] drives it over TCP.

pub mod cipher;
pub mod codec;
pub mod error;
pub mod service;
pub mod session;

pub use cipher::{CipherSession, AUTH_KEY_SIZE, CHALLENGE_SIZE, IDENTITY_SIZE, KEY_CIPHER_SIZE};
pub use codec::{decode_frame, decode_packet, encode_frame, Opcode};
pub use error::{Disconnect, DisconnectionCode, P2pError};
pub use service::{P2pEvent, P2pService};
pub use session::{PeerSession, SessionEvent, SessionPhase, SessionPolicy};
