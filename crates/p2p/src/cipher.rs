//! Per-session channel cryptography.
//!
//! x25519 key exchange, Ed25519 challenge signatures, ChaCha20-Poly1305 for
//! the sealed channel. Directions use independent keys derived from the
//! shared secret and both public keys; nonces are 64-bit counters, so a
//! replayed ciphertext fails to open.

use crate::error::P2pError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

/// Size of the handshake challenge nonce.
pub const CHALLENGE_SIZE: usize = 128;
/// Size of an Ed25519 signature public key.
pub const AUTH_KEY_SIZE: usize = 32;
/// Size of an x25519 encryption public key.
pub const KEY_CIPHER_SIZE: usize = 32;
/// Size of a peer identity digest (SHA-512).
pub const IDENTITY_SIZE: usize = 64;

/// Derive the two direction keys from the ECDH shared secret.
///
/// Returns `(server_to_client, client_to_server)`. Both sides call this with
/// the same argument order, so the key schedule is symmetric.
pub fn derive_direction_keys(
    shared_secret: &[u8; 32],
    server_public: &[u8; 32],
    client_public: &[u8; 32],
) -> ([u8; 32], [u8; 32]) {
    let derive = |label: &[u8]| -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(shared_secret);
        hasher.update(server_public);
        hasher.update(client_public);
        hasher.update(label);
        hasher.finalize().into()
    };
    (derive(b"opnet.s2c"), derive(b"opnet.c2s"))
}

/// One direction of the sealed channel.
struct DirectionState {
    aead: ChaCha20Poly1305,
    counter: u64,
}

impl DirectionState {
    fn new(key: &[u8; 32]) -> Self {
        Self { aead: ChaCha20Poly1305::new(Key::from_slice(key)), counter: 0 }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        *Nonce::from_slice(&bytes)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, P2pError> {
        let nonce = self.next_nonce();
        self.aead.encrypt(&nonce, plaintext).map_err(|_| P2pError::Aead)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, P2pError> {
        let nonce = self.next_nonce();
        self.aead.decrypt(&nonce, ciphertext).map_err(|_| P2pError::Aead)
    }
}

/// Key state and sealed-channel state for one peer session.
pub struct CipherSession {
    server_secret: Option<StaticSecret>,
    server_public: Option<[u8; 32]>,
    signing_key: Option<SigningKey>,
    client_public: Option<[u8; 32]>,
    client_signature_public: Option<VerifyingKey>,
    outbound: Option<DirectionState>,
    inbound: Option<DirectionState>,
}

impl Default for CipherSession {
    fn default() -> Self {
        Self::new()
    }
}

impl CipherSession {
    pub fn new() -> Self {
        Self {
            server_secret: None,
            server_public: None,
            signing_key: None,
            client_public: None,
            client_signature_public: None,
            outbound: None,
            inbound: None,
        }
    }

    /// Generate the server's x25519 keypair and Ed25519 signing key for this
    /// session.
    pub fn generate_server_cipher_key_pair(&mut self) {
        let secret = StaticSecret::random_from_rng(OsRng);
        self.server_public = Some(*PublicKey::from(&secret).as_bytes());
        self.server_secret = Some(secret);
        self.signing_key = Some(SigningKey::generate(&mut OsRng));
    }

    /// Store the peer's x25519 encryption public key.
    pub fn set_client_public_key(&mut self, key: &[u8]) -> Result<(), P2pError> {
        let key: [u8; 32] =
            key.try_into().map_err(|_| P2pError::BadKeyMaterial("client key cipher"))?;
        self.client_public = Some(key);
        Ok(())
    }

    /// Store the peer's Ed25519 signature public key.
    pub fn set_client_signature_public_key(&mut self, key: &[u8]) -> Result<(), P2pError> {
        let key: [u8; 32] =
            key.try_into().map_err(|_| P2pError::BadKeyMaterial("client auth cipher"))?;
        let verifying = VerifyingKey::from_bytes(&key)
            .map_err(|_| P2pError::BadKeyMaterial("client auth cipher"))?;
        self.client_signature_public = Some(verifying);
        Ok(())
    }

    pub fn server_public_key(&self) -> Option<[u8; 32]> {
        self.server_public
    }

    pub fn server_signature_public_key(&self) -> Option<[u8; 32]> {
        self.signing_key.as_ref().map(|k| k.verifying_key().to_bytes())
    }

    /// The stored client signature public key, as bytes.
    pub fn client_signature_public_key(&self) -> Option<[u8; 32]> {
        self.client_signature_public.as_ref().map(|k| k.to_bytes())
    }

    /// Whether the sealed channel is active.
    pub fn encryption_started(&self) -> bool {
        self.outbound.is_some()
    }

    /// Derive direction keys and activate the sealed channel. Requires the
    /// server keypair and the client's encryption public key.
    pub fn start_encryption(&mut self) -> Result<(), P2pError> {
        let secret =
            self.server_secret.as_ref().ok_or(P2pError::BadKeyMaterial("server keypair"))?;
        let server_public =
            self.server_public.ok_or(P2pError::BadKeyMaterial("server keypair"))?;
        let client_public =
            self.client_public.ok_or(P2pError::BadKeyMaterial("client key cipher"))?;

        let shared = secret.diffie_hellman(&PublicKey::from(client_public));
        let (s2c, c2s) = derive_direction_keys(shared.as_bytes(), &server_public, &client_public);
        self.outbound = Some(DirectionState::new(&s2c));
        self.inbound = Some(DirectionState::new(&c2s));
        Ok(())
    }

    /// Seal an outbound frame. Fails before [CipherSession::start_encryption].
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, P2pError> {
        self.outbound.as_mut().ok_or(P2pError::EncryptionNotStarted)?.seal(plaintext)
    }

    /// Open an inbound frame. Fails before [CipherSession::start_encryption].
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, P2pError> {
        self.inbound.as_mut().ok_or(P2pError::EncryptionNotStarted)?.open(ciphertext)
    }

    /// Verify a signature over arbitrary key data with the stored client
    /// signature key.
    pub fn authenticate_key_data(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.client_signature_public.as_ref() else { return false };
        let Ok(signature) = Signature::from_slice(signature) else { return false };
        key.verify(data, &signature).is_ok()
    }

    /// Verify a challenge response.
    ///
    /// Binds three things: the identity must be the SHA-512 digest of the
    /// presented public key (compared in constant time), the response must be
    /// a valid signature by that key over the challenge, and the challenge
    /// buffer must be full sized.
    pub fn verify_challenge(
        identity: &[u8],
        challenge: &[u8],
        response: &[u8],
        public_key: &[u8],
    ) -> bool {
        if identity.len() != IDENTITY_SIZE || challenge.len() != CHALLENGE_SIZE {
            return false;
        }
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else { return false };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else { return false };

        let digest = Sha512::digest(public_key);
        if !bool::from(digest.as_slice().ct_eq(identity)) {
            return false;
        }
        let Ok(signature) = Signature::from_slice(response) else { return false };
        key.verify(challenge, &signature).is_ok()
    }

    /// Sign data with the server's session signing key.
    pub fn sign(&self, data: &[u8]) -> Option<[u8; 64]> {
        self.signing_key.as_ref().map(|k| k.sign(data).to_bytes())
    }
}

/// Generate a fresh CSPRNG challenge.
pub fn generate_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_before_start_fails() {
        let mut session = CipherSession::new();
        assert!(matches!(session.encrypt(b"x"), Err(P2pError::EncryptionNotStarted)));
        assert!(matches!(session.decrypt(b"x"), Err(P2pError::EncryptionNotStarted)));
    }

    #[test]
    fn sealed_channel_round_trip() -> eyre::Result<()> {
        // server side
        let mut server = CipherSession::new();
        server.generate_server_cipher_key_pair();
        let server_public = server.server_public_key().unwrap();

        // client side of the ECDH
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = *PublicKey::from(&client_secret).as_bytes();
        server.set_client_public_key(&client_public)?;
        server.start_encryption()?;

        let shared = client_secret.diffie_hellman(&PublicKey::from(server_public));
        let (s2c, c2s) = derive_direction_keys(shared.as_bytes(), &server_public, &client_public);
        let mut client_inbound = DirectionState::new(&s2c);
        let mut client_outbound = DirectionState::new(&c2s);

        // server -> client
        let sealed = server.encrypt(b"welcome")?;
        assert_ne!(sealed, b"welcome");
        assert_eq!(client_inbound.open(&sealed)?, b"welcome");

        // client -> server, twice to exercise the nonce counter
        for msg in [b"ping-0".as_slice(), b"ping-1".as_slice()] {
            let sealed = client_outbound.seal(msg)?;
            assert_eq!(server.decrypt(&sealed)?, msg);
        }
        Ok(())
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() -> eyre::Result<()> {
        let mut server = CipherSession::new();
        server.generate_server_cipher_key_pair();
        let client_secret = StaticSecret::random_from_rng(OsRng);
        server.set_client_public_key(PublicKey::from(&client_secret).as_bytes())?;
        server.start_encryption()?;

        // forge a client->server frame and corrupt it
        let server_public = server.server_public_key().unwrap();
        let shared = client_secret.diffie_hellman(&PublicKey::from(server_public));
        let (_, c2s) = derive_direction_keys(
            shared.as_bytes(),
            &server_public,
            PublicKey::from(&client_secret).as_bytes(),
        );
        let mut client_outbound = DirectionState::new(&c2s);
        let mut forged = client_outbound.seal(b"data")?;
        forged[0] ^= 0x01;
        assert!(matches!(server.decrypt(&forged), Err(P2pError::Aead)));
        Ok(())
    }

    #[test]
    fn challenge_verification() {
        let signing = SigningKey::generate(&mut OsRng);
        let public = signing.verifying_key().to_bytes();
        let identity: Vec<u8> = Sha512::digest(public).to_vec();
        let challenge = generate_challenge();
        let response = signing.sign(&challenge).to_bytes();

        assert!(CipherSession::verify_challenge(&identity, &challenge, &response, &public));

        // wrong challenge
        let other = generate_challenge();
        assert!(!CipherSession::verify_challenge(&identity, &other, &response, &public));

        // identity not bound to the key
        let bogus_identity = vec![0u8; IDENTITY_SIZE];
        assert!(!CipherSession::verify_challenge(&bogus_identity, &challenge, &response, &public));

        // truncated identity
        assert!(!CipherSession::verify_challenge(&identity[..32], &challenge, &response, &public));
    }

    #[test]
    fn authenticate_key_data_uses_stored_key() -> eyre::Result<()> {
        let signing = SigningKey::generate(&mut OsRng);
        let mut session = CipherSession::new();
        session.set_client_signature_public_key(&signing.verifying_key().to_bytes())?;

        let data = b"key-data";
        let signature = signing.sign(data).to_bytes();
        assert!(session.authenticate_key_data(data, &signature));
        assert!(!session.authenticate_key_data(b"other", &signature));
        Ok(())
    }
}
