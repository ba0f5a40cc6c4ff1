//! Error types for peer networking.

use thiserror::Error;

/// Codes presented to a peer when the node terminates its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectionCode {
    AuthTimedOut = 1,
    BadEncryption = 2,
    BadPacket = 3,
    BadVersion = 4,
    BadTrustedChecksum = 5,
    BadAuthCipher = 6,
    BadChallenge = 7,
    BadIdentity = 8,
    BadNetwork = 9,
    BadChainId = 10,
}

/// Terminal session failure: disconnect the peer with a specific code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("disconnect peer ({code:?}): {reason}")]
pub struct Disconnect {
    pub code: DisconnectionCode,
    pub reason: String,
}

impl Disconnect {
    pub fn new(code: DisconnectionCode, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }
}

/// Non-terminal p2p error type.
#[derive(Debug, Error)]
pub enum P2pError {
    /// `encrypt`/`decrypt` called before `start_encryption`.
    #[error("encryption has not been started")]
    EncryptionNotStarted,
    /// AEAD seal/open failure.
    #[error("aead failure")]
    Aead,
    /// Key material of the wrong shape.
    #[error("bad key material: {0}")]
    BadKeyMaterial(&'static str),
    /// Packet encode/decode failure.
    #[error("packet codec: {0}")]
    Codec(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
