//! Opcode-prefixed frame codec.
//!
//! A frame is one opcode byte followed by the bincode-encoded packet body.
//! After authentication the whole frame travels AEAD-sealed; the opcode byte
//! is only read after decryption.

use crate::error::{Disconnect, DisconnectionCode, P2pError};
use opnet_types::PeerRecord;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Wire opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Authentication = 0x01,
    ClientCipherExchange = 0x02,
    ServerKeyCipherExchange = 0x03,
    AuthenticationStatus = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Discover = 0x07,
    DiscoveryResponse = 0x08,
    BlockHeaderWitness = 0x09,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Opcode::Authentication,
            0x02 => Opcode::ClientCipherExchange,
            0x03 => Opcode::ServerKeyCipherExchange,
            0x04 => Opcode::AuthenticationStatus,
            0x05 => Opcode::Ping,
            0x06 => Opcode::Pong,
            0x07 => Opcode::Discover,
            0x08 => Opcode::DiscoveryResponse,
            0x09 => Opcode::BlockHeaderWitness,
            _ => return None,
        })
    }
}

/// First packet a connecting peer must send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationPacket {
    pub version: String,
    pub trusted_checksum: Vec<u8>,
    pub network: u8,
    pub chain_id: u32,
    /// The peer's Ed25519 signature public key, exactly 32 bytes.
    pub client_auth_cipher: Vec<u8>,
}

/// Server's answer to `Authentication`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationStatusPacket {
    pub success: bool,
    pub message: String,
    /// 128-byte challenge, present on success.
    pub challenge: Vec<u8>,
}

/// Second packet of the handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientCipherExchangePacket {
    /// SHA-512 digest of the peer's signature public key, 64 bytes.
    pub identity: Vec<u8>,
    /// The peer's x25519 encryption public key, 32 bytes.
    pub client_key_cipher: Vec<u8>,
    /// Must equal the signature public key presented in `Authentication`.
    pub client_auth_cipher: Vec<u8>,
    /// Signature over the server challenge.
    pub challenge_response: Vec<u8>,
}

/// Server's half of the cipher exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerKeyCipherExchangePacket {
    pub server_key_cipher: Vec<u8>,
    pub server_signing_cipher: Vec<u8>,
    pub encryption_enabled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PingPacket {
    pub timestamp: u64,
    pub last_ping: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PongPacket {
    pub timestamp: u64,
    pub last_ping: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoverPacket {
    pub version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponsePacket {
    pub peers: Vec<PeerRecord>,
}

/// Witness data for a block header, dispatched to the host after auth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockHeaderWitnessPacket {
    pub height: u64,
    pub block_hash: Vec<u8>,
    pub checksum_root: Vec<u8>,
    pub signatures: Vec<Vec<u8>>,
}

/// Encode opcode + packet body into a frame.
pub fn encode_frame<T: Serialize>(opcode: Opcode, packet: &T) -> Result<Vec<u8>, P2pError> {
    let body = bincode::serialize(packet).map_err(|e| P2pError::Codec(e.to_string()))?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(opcode as u8);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Split a frame into opcode and body. Unknown opcodes and empty frames are
/// protocol violations.
pub fn decode_frame(frame: &[u8]) -> Result<(Opcode, &[u8]), Disconnect> {
    let (&first, body) = frame
        .split_first()
        .ok_or_else(|| Disconnect::new(DisconnectionCode::BadPacket, "empty frame"))?;
    let opcode = Opcode::from_u8(first).ok_or_else(|| {
        Disconnect::new(DisconnectionCode::BadPacket, format!("unknown opcode {first:#04x}"))
    })?;
    Ok((opcode, body))
}

/// Decode a packet body.
pub fn decode_packet<T: DeserializeOwned>(body: &[u8]) -> Result<T, Disconnect> {
    bincode::deserialize(body)
        .map_err(|e| Disconnect::new(DisconnectionCode::BadPacket, format!("bad packet body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let packet = PingPacket { timestamp: 42, last_ping: 7 };
        let frame = encode_frame(Opcode::Ping, &packet).unwrap();
        let (opcode, body) = decode_frame(&frame).unwrap();
        assert_eq!(opcode, Opcode::Ping);
        assert_eq!(decode_packet::<PingPacket>(body).unwrap(), packet);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let err = decode_frame(&[0xff, 1, 2, 3]).unwrap_err();
        assert_eq!(err.code, DisconnectionCode::BadPacket);
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(decode_frame(&[]).unwrap_err().code, DisconnectionCode::BadPacket);
    }
}
