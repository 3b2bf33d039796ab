//! At-rest blob encoding
//!
//! Every stored blob is a self-describing frame:
//!
//! ```text
//! magic "DSBF" (4) | version (1) | flags (1) | payload
//! ```
//!
//! `flags` bit 0 marks a zstd-compressed payload, bit 1 an encrypted one.
//! Compression is applied before encryption. An encrypted payload is
//! `nonce (12) || ChaCha20-Poly1305 ciphertext+tag`. Because the frame carries
//! its own flags, blobs written under an older configuration stay readable.

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use zstd::stream::{decode_all as zstd_decode, encode_all as zstd_encode};

use crate::config::{CompressionConfig, EncryptionConfig};
use crate::error::{Result, StorageError};
use crate::hash::BlobHash;

/// Frame magic
pub const FRAME_MAGIC: &[u8; 4] = b"DSBF";
/// Frame format version
pub const FRAME_VERSION: u8 = 1;
/// Length of the fixed frame header
pub const HEADER_LEN: usize = 6;
/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;

const FLAG_ZSTD: u8 = 0b01;
const FLAG_ENCRYPTED: u8 = 0b10;

/// Compression applied to a stored frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zstd => "zstd",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub compression: Compression,
    pub encrypted: bool,
}

impl FrameHeader {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.compression == Compression::Zstd {
            flags |= FLAG_ZSTD;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        flags
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(FRAME_MAGIC);
        out.push(FRAME_VERSION);
        out.push(self.flags());
    }

    /// Parse the header at the start of `frame`
    pub fn parse(frame: &[u8]) -> std::result::Result<Self, String> {
        if frame.len() < HEADER_LEN {
            return Err(format!("frame too short ({} bytes)", frame.len()));
        }
        if &frame[..4] != FRAME_MAGIC {
            return Err("bad frame magic".to_string());
        }
        if frame[4] != FRAME_VERSION {
            return Err(format!("unknown frame version: {}", frame[4]));
        }
        let flags = frame[5];
        if flags & !(FLAG_ZSTD | FLAG_ENCRYPTED) != 0 {
            return Err(format!("unknown frame flags: {:#04x}", flags));
        }
        Ok(Self {
            compression: if flags & FLAG_ZSTD != 0 {
                Compression::Zstd
            } else {
                Compression::None
            },
            encrypted: flags & FLAG_ENCRYPTED != 0,
        })
    }
}

/// Stored-frame facts reported by the tier stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub stored_size: u64,
    pub compression: Compression,
    pub encrypted: bool,
}

/// An encoded frame ready to be written
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub bytes: Bytes,
    pub header: FrameHeader,
}

/// Symmetric at-rest encryption with a referenced key
struct Sealer {
    key_id: String,
    cipher: ChaCha20Poly1305,
}

impl Sealer {
    fn new(key_id: String, key: &[u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        Self { key_id, cipher }
    }

    fn seal(&self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| StorageError::Crypto(format!("failed to generate nonce: {}", e)))?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| StorageError::Crypto(format!("encryption failed: {}", e)))?;
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(())
    }

    fn open(&self, payload: &[u8]) -> std::result::Result<Vec<u8>, String> {
        if payload.len() < NONCE_SIZE {
            return Err("encrypted payload shorter than nonce".to_string());
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| "authentication failed".to_string())
    }
}

/// Encodes plain bytes into frames and back, verifying content addresses
pub struct BlobCodec {
    compression_level: Option<i32>,
    sealer: Option<Sealer>,
}

impl std::fmt::Debug for BlobCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCodec")
            .field("compression_level", &self.compression_level)
            .field("key_id", &self.key_id())
            .finish()
    }
}

impl BlobCodec {
    /// Build a codec from configuration
    pub fn new(compression: &CompressionConfig, encryption: &EncryptionConfig) -> Result<Self> {
        let sealer = encryption
            .resolve_key()?
            .map(|key| Sealer::new(encryption.key_id.clone(), &key));
        Ok(Self {
            compression_level: compression.enabled.then_some(compression.level),
            sealer,
        })
    }

    /// Codec that stores frames uncompressed and unencrypted
    pub fn plain() -> Self {
        Self {
            compression_level: None,
            sealer: None,
        }
    }

    /// Codec with zstd at `level` and optional encryption under `key`
    pub fn with_options(level: Option<i32>, key: Option<(&str, [u8; 32])>) -> Self {
        Self {
            compression_level: level,
            sealer: key.map(|(id, k)| Sealer::new(id.to_string(), &k)),
        }
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_level.is_some()
    }

    pub fn encryption_enabled(&self) -> bool {
        self.sealer.is_some()
    }

    /// Reference to the key new frames are sealed with
    pub fn key_id(&self) -> Option<&str> {
        self.sealer.as_ref().map(|s| s.key_id.as_str())
    }

    /// Encode plain bytes into a frame
    pub fn encode(&self, data: &[u8]) -> Result<EncodedFrame> {
        let mut compression = Compression::None;
        let compressed;
        let mut payload: &[u8] = data;

        if let Some(level) = self.compression_level {
            compressed = zstd_encode(data, level)
                .map_err(|e| StorageError::Backend(format!("Compression failed: {}", e)))?;
            // Incompressible content is stored as-is
            if compressed.len() < data.len() {
                compression = Compression::Zstd;
                payload = &compressed;
            }
        }

        let header = FrameHeader {
            compression,
            encrypted: self.sealer.is_some(),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_SIZE + payload.len() + 16);
        header.write(&mut out);
        match &self.sealer {
            Some(sealer) => sealer.seal(payload, &mut out)?,
            None => out.extend_from_slice(payload),
        }

        Ok(EncodedFrame {
            bytes: Bytes::from(out),
            header,
        })
    }

    /// Decode a frame back into plain bytes without checking its address
    pub fn decode(&self, hash: &BlobHash, frame: &[u8]) -> Result<Vec<u8>> {
        let corrupt = |reason: String| StorageError::Corrupt {
            hash: *hash,
            reason,
        };
        let header = FrameHeader::parse(frame).map_err(corrupt)?;
        let body = &frame[HEADER_LEN..];

        let opened;
        let payload: &[u8] = if header.encrypted {
            let sealer = self.sealer.as_ref().ok_or_else(|| {
                StorageError::Crypto(format!(
                    "blob {} is encrypted but no encryption key is configured",
                    hash
                ))
            })?;
            opened = sealer.open(body).map_err(corrupt)?;
            &opened
        } else {
            body
        };

        match header.compression {
            Compression::Zstd => {
                zstd_decode(payload).map_err(|e| corrupt(format!("decompression failed: {}", e)))
            }
            Compression::None => Ok(payload.to_vec()),
        }
    }

    /// Decode a frame and check the plain bytes hash to `hash`
    pub fn open(&self, hash: &BlobHash, frame: &[u8]) -> Result<Bytes> {
        let data = self.decode(hash, frame)?;
        let actual = BlobHash::from_data(&data);
        if actual != *hash {
            return Err(StorageError::ChecksumMismatch {
                expected: *hash,
                actual,
            });
        }
        Ok(Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn test_plain_frame() {
        let codec = BlobCodec::plain();
        let data = b"dataset-chunk-1";
        let hash = BlobHash::from_data(data);

        let frame = codec.encode(data).unwrap();
        assert_eq!(frame.header.compression, Compression::None);
        assert!(!frame.header.encrypted);
        assert_eq!(frame.bytes.len(), HEADER_LEN + data.len());

        let opened = codec.open(&hash, &frame.bytes).unwrap();
        assert_eq!(opened.as_ref(), data);
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() {
        let codec = BlobCodec::with_options(Some(3), None);
        let data = vec![b'A'; 10_000];
        let hash = BlobHash::from_data(&data);

        let frame = codec.encode(&data).unwrap();
        assert_eq!(frame.header.compression, Compression::Zstd);
        assert!(frame.bytes.len() < data.len());
        assert_eq!(codec.open(&hash, &frame.bytes).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_incompressible_data_stored_raw() {
        let codec = BlobCodec::with_options(Some(3), None);
        let data = b"x";
        let frame = codec.encode(data).unwrap();
        assert_eq!(frame.header.compression, Compression::None);
    }

    #[test]
    fn test_encrypted_frame() {
        let codec = BlobCodec::with_options(Some(3), Some(("k1", key())));
        let data = vec![b'B'; 4096];
        let hash = BlobHash::from_data(&data);

        let frame = codec.encode(&data).unwrap();
        assert!(frame.header.encrypted);
        assert_eq!(codec.key_id(), Some("k1"));
        // Ciphertext must not contain the plain run
        assert!(!frame.bytes.windows(64).any(|w| w.iter().all(|b| *b == b'B')));
        assert_eq!(codec.open(&hash, &frame.bytes).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_encrypted_frame_needs_key() {
        let sealed = BlobCodec::with_options(None, Some(("k1", key())));
        let data = b"secret chunk";
        let hash = BlobHash::from_data(data);
        let frame = sealed.encode(data).unwrap();

        let err = BlobCodec::plain().open(&hash, &frame.bytes).unwrap_err();
        assert!(matches!(err, StorageError::Crypto(_)));
    }

    #[test]
    fn test_tampered_ciphertext_is_corrupt() {
        let codec = BlobCodec::with_options(None, Some(("k1", key())));
        let data = b"secret chunk";
        let hash = BlobHash::from_data(data);
        let mut frame = codec.encode(data).unwrap().bytes.to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let err = codec.open(&hash, &frame).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_wrong_content_is_checksum_mismatch() {
        let codec = BlobCodec::plain();
        let claimed = BlobHash::from_data(b"original");
        let frame = codec.encode(b"something else").unwrap();

        match codec.open(&claimed, &frame.bytes).unwrap_err() {
            StorageError::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, claimed);
                assert_eq!(actual, BlobHash::from_data(b"something else"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_header_parse_rejects_garbage() {
        assert!(FrameHeader::parse(b"DSB").is_err());
        assert!(FrameHeader::parse(b"XXXX\x01\x00").is_err());
        assert!(FrameHeader::parse(b"DSBF\x09\x00").is_err());
        assert!(FrameHeader::parse(b"DSBF\x01\x80").is_err());
        let header = FrameHeader::parse(b"DSBF\x01\x03").unwrap();
        assert_eq!(header.compression, Compression::Zstd);
        assert!(header.encrypted);
    }
}
