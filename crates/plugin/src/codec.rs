//! The signed `.opnet` container.
//!
//! Layout, little-endian lengths:
//!
//! ```text
//! magic(4) || version(u32) || mldsaLevel(u8)
//!        || publicKey(L_pk) || signature(L_sig)
//!        || metadataLen(u32) || metadataJson
//!        || bytecodeLen(u32) || bytecode
//!        || protoLen(u32)   || proto
//!        || checksum(32)
//! ```
//!
//! The checksum is SHA-256 over everything above it; the ML-DSA signature
//! covers SHA-256(metadata || bytecode). `L_pk` and `L_sig` follow from the
//! level byte.

use crate::error::PluginFileError;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use fips204::{
    ml_dsa_44, ml_dsa_65, ml_dsa_87,
    traits::{SerDes, Signer, Verifier},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Container magic.
pub const PLUGIN_MAGIC: [u8; 4] = *b"OPNT";
/// Current container format version.
pub const FORMAT_VERSION_V1: u32 = 1;
/// Format versions this build parses.
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[FORMAT_VERSION_V1];
/// Enabled plugin file suffix.
pub const PLUGIN_SUFFIX: &str = ".opnet";
/// Disabled plugin file suffix: discovered but never parsed.
pub const DISABLED_SUFFIX: &str = ".opnet.disabled";

const HEADER_SIZE: usize = 4 + 4 + 1;
const CHECKSUM_SIZE: usize = 32;
/// Smallest container: v1 header, level-44 keys, three empty sections.
pub const MIN_FILE_SIZE: usize =
    HEADER_SIZE + ml_dsa_44::PK_LEN + ml_dsa_44::SIG_LEN + 3 * 4 + CHECKSUM_SIZE;

/// ML-DSA security level of the container signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MldsaLevel {
    Level44,
    Level65,
    Level87,
}

impl MldsaLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            44 => MldsaLevel::Level44,
            65 => MldsaLevel::Level65,
            87 => MldsaLevel::Level87,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MldsaLevel::Level44 => 44,
            MldsaLevel::Level65 => 65,
            MldsaLevel::Level87 => 87,
        }
    }

    pub fn public_key_len(&self) -> usize {
        match self {
            MldsaLevel::Level44 => ml_dsa_44::PK_LEN,
            MldsaLevel::Level65 => ml_dsa_65::PK_LEN,
            MldsaLevel::Level87 => ml_dsa_87::PK_LEN,
        }
    }

    pub fn signature_len(&self) -> usize {
        match self {
            MldsaLevel::Level44 => ml_dsa_44::SIG_LEN,
            MldsaLevel::Level65 => ml_dsa_65::SIG_LEN,
            MldsaLevel::Level87 => ml_dsa_87::SIG_LEN,
        }
    }

    /// Verify a detached signature. Malformed key or signature material
    /// verifies false.
    pub fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        macro_rules! verify_at {
            ($module:ident) => {{
                let pk: [u8; $module::PK_LEN] = match public_key.try_into() {
                    Ok(v) => v,
                    Err(_) => return false,
                };
                let pk = match $module::PublicKey::try_from_bytes(pk) {
                    Ok(v) => v,
                    Err(_) => return false,
                };
                let sig: [u8; $module::SIG_LEN] = match signature.try_into() {
                    Ok(v) => v,
                    Err(_) => return false,
                };
                pk.verify(message, &sig, &[])
            }};
        }
        match self {
            MldsaLevel::Level44 => verify_at!(ml_dsa_44),
            MldsaLevel::Level65 => verify_at!(ml_dsa_65),
            MldsaLevel::Level87 => verify_at!(ml_dsa_87),
        }
    }
}

/// A signing keypair for producing containers, used by tooling and tests.
pub struct MldsaKeypair {
    level: MldsaLevel,
    public: Vec<u8>,
    secret: MldsaSecret,
}

enum MldsaSecret {
    Level44(ml_dsa_44::PrivateKey),
    Level65(ml_dsa_65::PrivateKey),
    Level87(ml_dsa_87::PrivateKey),
}

impl MldsaKeypair {
    pub fn generate(level: MldsaLevel) -> Result<Self, PluginFileError> {
        let (public, secret) = match level {
            MldsaLevel::Level44 => {
                let (public, secret) = ml_dsa_44::try_keygen().map_err(PluginFileError::Crypto)?;
                (public.into_bytes().to_vec(), MldsaSecret::Level44(secret))
            }
            MldsaLevel::Level65 => {
                let (public, secret) = ml_dsa_65::try_keygen().map_err(PluginFileError::Crypto)?;
                (public.into_bytes().to_vec(), MldsaSecret::Level65(secret))
            }
            MldsaLevel::Level87 => {
                let (public, secret) = ml_dsa_87::try_keygen().map_err(PluginFileError::Crypto)?;
                (public.into_bytes().to_vec(), MldsaSecret::Level87(secret))
            }
        };
        Ok(Self { level, public, secret })
    }

    pub fn level(&self) -> MldsaLevel {
        self.level
    }

    pub fn public_key(&self) -> Vec<u8> {
        self.public.clone()
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, PluginFileError> {
        Ok(match &self.secret {
            MldsaSecret::Level44(secret) => {
                secret.try_sign(message, &[]).map_err(PluginFileError::Crypto)?.to_vec()
            }
            MldsaSecret::Level65(secret) => {
                secret.try_sign(message, &[]).map_err(PluginFileError::Crypto)?.to_vec()
            }
            MldsaSecret::Level87(secret) => {
                secret.try_sign(message, &[]).map_err(PluginFileError::Crypto)?.to_vec()
            }
        })
    }
}

/// Declared plugin kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Standalone,
    Library,
}

/// The structured descriptor embedded in the container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub name: String,
    pub version: semver::Version,
    /// Range of host versions the plugin accepts.
    pub opnet_version: semver::VersionReq,
    pub target: String,
    pub plugin_type: PluginType,
    /// Author-declared checksum, informational.
    pub checksum: String,
    pub author: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// A parsed and fully verified container.
#[derive(Debug)]
pub struct PluginFile {
    pub level: MldsaLevel,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub metadata: PluginMetadata,
    pub metadata_raw: Vec<u8>,
    pub bytecode: Bytes,
    pub proto: Option<Bytes>,
    pub checksum: [u8; 32],
}

impl PluginFile {
    /// Parse and verify a container.
    ///
    /// Validation order: size, magic, format version, checksum, signature,
    /// metadata JSON. The first failure rejects the file.
    pub fn parse(bytes: &[u8]) -> Result<Self, PluginFileError> {
        if bytes.len() < MIN_FILE_SIZE {
            return Err(PluginFileError::FileTooSmall(bytes.len()));
        }
        if bytes[..4] != PLUGIN_MAGIC {
            return Err(PluginFileError::InvalidMagic);
        }
        let version = LittleEndian::read_u32(&bytes[4..8]);
        if !SUPPORTED_FORMAT_VERSIONS.contains(&version) {
            return Err(PluginFileError::UnsupportedFormatVersion(version));
        }

        // checksum covers everything above it
        let checksum_offset = bytes.len() - CHECKSUM_SIZE;
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&bytes[checksum_offset..]);
        let computed: [u8; 32] = Sha256::digest(&bytes[..checksum_offset]).into();
        if computed != checksum {
            return Err(PluginFileError::ChecksumMismatch);
        }

        let level = MldsaLevel::from_u8(bytes[8])
            .ok_or(PluginFileError::UnsupportedMldsaLevel(bytes[8]))?;

        let mut reader = Reader { buf: &bytes[..checksum_offset], pos: HEADER_SIZE };
        let public_key = reader.take(level.public_key_len())?.to_vec();
        let signature = reader.take(level.signature_len())?.to_vec();
        let metadata_raw = reader.take_section()?.to_vec();
        let bytecode = Bytes::copy_from_slice(reader.take_section()?);
        let proto = reader.take_section()?;
        let proto = if proto.is_empty() { None } else { Some(Bytes::copy_from_slice(proto)) };
        if reader.pos != checksum_offset {
            return Err(PluginFileError::FileTooSmall(bytes.len()));
        }

        let digest = signing_digest(&metadata_raw, &bytecode);
        if !level.verify(&public_key, &digest, &signature) {
            return Err(PluginFileError::BadSignature);
        }

        let metadata: PluginMetadata = serde_json::from_slice(&metadata_raw)?;

        Ok(Self {
            level,
            public_key,
            signature,
            metadata,
            metadata_raw,
            bytecode,
            proto,
            checksum,
        })
    }
}

/// The message the container signature covers.
pub fn signing_digest(metadata_raw: &[u8], bytecode: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(metadata_raw);
    hasher.update(bytecode);
    hasher.finalize().into()
}

/// Assemble a container from raw parts. [write_plugin_file] is the signing
/// front end; this is split out so tooling can re-pack verified parts.
pub fn encode_container(
    level: MldsaLevel,
    public_key: &[u8],
    signature: &[u8],
    metadata_raw: &[u8],
    bytecode: &[u8],
    proto: Option<&[u8]>,
) -> Vec<u8> {
    let proto = proto.unwrap_or_default();
    let mut out = Vec::with_capacity(
        MIN_FILE_SIZE + public_key.len() + signature.len() + metadata_raw.len() + bytecode.len(),
    );
    out.extend_from_slice(&PLUGIN_MAGIC);
    let mut u32_buf = [0u8; 4];
    LittleEndian::write_u32(&mut u32_buf, FORMAT_VERSION_V1);
    out.extend_from_slice(&u32_buf);
    out.push(level.as_u8());
    out.extend_from_slice(public_key);
    out.extend_from_slice(signature);
    for section in [metadata_raw, bytecode, proto] {
        LittleEndian::write_u32(&mut u32_buf, section.len() as u32);
        out.extend_from_slice(&u32_buf);
        out.extend_from_slice(section);
    }
    let checksum: [u8; 32] = Sha256::digest(&out).into();
    out.extend_from_slice(&checksum);
    out
}

/// Serialize, sign and pack a container.
pub fn write_plugin_file(
    metadata: &PluginMetadata,
    bytecode: &[u8],
    proto: Option<&[u8]>,
    keypair: &MldsaKeypair,
) -> Result<Vec<u8>, PluginFileError> {
    let metadata_raw = serde_json::to_vec(metadata)?;
    let digest = signing_digest(&metadata_raw, bytecode);
    let signature = keypair.sign(&digest)?;
    Ok(encode_container(
        keypair.level(),
        &keypair.public_key(),
        &signature,
        &metadata_raw,
        bytecode,
        proto,
    ))
}

/// A plugin file found on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPlugin {
    /// Filename stem, the plugin id.
    pub id: String,
    pub path: PathBuf,
    /// `*.opnet.disabled` siblings are discovered but never parsed.
    pub enabled: bool,
}

/// Scan a directory for plugin containers, sorted by id.
pub fn discover_plugins(dir: &Path) -> Result<Vec<DiscoveredPlugin>, PluginFileError> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(id) = name.strip_suffix(DISABLED_SUFFIX) {
            found.push(DiscoveredPlugin {
                id: id.to_string(),
                path: entry.path(),
                enabled: false,
            });
        } else if let Some(id) = name.strip_suffix(PLUGIN_SUFFIX) {
            found.push(DiscoveredPlugin { id: id.to_string(), path: entry.path(), enabled: true });
        }
    }
    found.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(found)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], PluginFileError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(PluginFileError::FileTooSmall(self.buf.len()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_section(&mut self) -> Result<&'a [u8], PluginFileError> {
        let len_bytes = self.take(4)?;
        let len = LittleEndian::read_u32(len_bytes) as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> PluginMetadata {
        PluginMetadata {
            name: "example".into(),
            version: "0.2.1".parse().unwrap(),
            opnet_version: ">=1.0.0".parse().unwrap(),
            target: "wasm32".into(),
            plugin_type: PluginType::Standalone,
            checksum: String::new(),
            author: "tests".into(),
            permissions: vec!["blocks.onChange".into()],
        }
    }

    #[test]
    fn write_then_parse_round_trip() -> eyre::Result<()> {
        let keypair = MldsaKeypair::generate(MldsaLevel::Level44)?;
        let bytes =
            write_plugin_file(&metadata(), b"\0asm bytecode", Some(b"proto"), &keypair)?;

        let parsed = PluginFile::parse(&bytes)?;
        assert_eq!(parsed.level, MldsaLevel::Level44);
        assert_eq!(parsed.metadata, metadata());
        assert_eq!(parsed.bytecode.as_ref(), b"\0asm bytecode");
        assert_eq!(parsed.proto.as_deref(), Some(b"proto".as_slice()));

        // the stored checksum matches a recompute over the prefix
        let recomputed: [u8; 32] = Sha256::digest(&bytes[..bytes.len() - 32]).into();
        assert_eq!(parsed.checksum, recomputed);
        Ok(())
    }

    #[test]
    fn empty_proto_parses_as_none() -> eyre::Result<()> {
        let keypair = MldsaKeypair::generate(MldsaLevel::Level44)?;
        let bytes = write_plugin_file(&metadata(), b"code", None, &keypair)?;
        assert!(PluginFile::parse(&bytes)?.proto.is_none());
        Ok(())
    }

    #[test]
    fn tampered_byte_fails_checksum() -> eyre::Result<()> {
        let keypair = MldsaKeypair::generate(MldsaLevel::Level44)?;
        let mut bytes = write_plugin_file(&metadata(), b"code", None, &keypair)?;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert_matches::assert_matches!(
            PluginFile::parse(&bytes),
            Err(PluginFileError::ChecksumMismatch)
        );
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() -> eyre::Result<()> {
        let keypair = MldsaKeypair::generate(MldsaLevel::Level44)?;
        let mut bytes = write_plugin_file(&metadata(), b"code", None, &keypair)?;
        bytes[0] = b'X';
        assert_matches::assert_matches!(PluginFile::parse(&bytes), Err(PluginFileError::InvalidMagic));
        Ok(())
    }

    #[test]
    fn short_file_is_rejected() {
        assert_matches::assert_matches!(
            PluginFile::parse(b"OPNT"),
            Err(PluginFileError::FileTooSmall(4))
        );
    }

    #[test]
    fn unsupported_version_is_rejected() -> eyre::Result<()> {
        let keypair = MldsaKeypair::generate(MldsaLevel::Level44)?;
        let mut bytes = write_plugin_file(&metadata(), b"code", None, &keypair)?;
        bytes[4] = 0xfe; // format version little-endian low byte
        assert_matches::assert_matches!(
            PluginFile::parse(&bytes),
            Err(PluginFileError::UnsupportedFormatVersion(_))
        );
        Ok(())
    }

    #[test]
    fn foreign_signature_is_rejected() -> eyre::Result<()> {
        let signer = MldsaKeypair::generate(MldsaLevel::Level44)?;
        let imposter = MldsaKeypair::generate(MldsaLevel::Level44)?;

        let metadata_raw = serde_json::to_vec(&metadata())?;
        let digest = signing_digest(&metadata_raw, b"code");
        let signature = signer.sign(&digest)?;
        // container advertises the imposter's key with the signer's signature
        let bytes = encode_container(
            MldsaLevel::Level44,
            &imposter.public_key(),
            &signature,
            &metadata_raw,
            b"code",
            None,
        );
        assert_matches::assert_matches!(
            PluginFile::parse(&bytes),
            Err(PluginFileError::BadSignature)
        );
        Ok(())
    }

    #[test]
    fn invalid_metadata_json_is_rejected() -> eyre::Result<()> {
        let keypair = MldsaKeypair::generate(MldsaLevel::Level44)?;
        let metadata_raw = b"not json at all";
        let digest = signing_digest(metadata_raw, b"code");
        let signature = keypair.sign(&digest)?;
        let bytes = encode_container(
            MldsaLevel::Level44,
            &keypair.public_key(),
            &signature,
            metadata_raw,
            b"code",
            None,
        );
        assert_matches::assert_matches!(
            PluginFile::parse(&bytes),
            Err(PluginFileError::InvalidMetadataJson(_))
        );
        Ok(())
    }

    #[test]
    fn discovery_separates_enabled_and_disabled() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("alpha.opnet"), b"x")?;
        std::fs::write(dir.path().join("beta.opnet.disabled"), b"x")?;
        std::fs::write(dir.path().join("notes.txt"), b"x")?;

        let found = discover_plugins(dir.path())?;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "alpha");
        assert!(found[0].enabled);
        assert_eq!(found[1].id, "beta");
        assert!(!found[1].enabled);
        Ok(())
    }
}
