//! Node attribute blobs and the file fingerprint
//!
//! Wire layout: `base64url(AES-CBC(key, IV=0, "MEGA" ‖ json ‖ NUL padding))`.
//! Decryption never fails: a blob that cannot be read yields a placeholder
//! name so one damaged node does not break a listing.

use std::io::{self, Read, Seek, SeekFrom};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::block::{cbc_decrypt, cbc_encrypt};
use crate::encoding::{base64url_decode, base64url_encode};
use crate::error::{CryptoError, CryptoResult};
use crate::{BLOCK_SIZE, KEY_SIZE};

const ATTRIBUTES_MAGIC: &[u8; 4] = b"MEGA";

/// Name shown for nodes whose attributes could not be decrypted
pub const UNREADABLE_NAME: &str = "[undecryptable]";

/// Decrypted node attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(rename = "n")]
    pub name: String,

    #[serde(
        rename = "c",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_fingerprint"
    )]
    pub fingerprint: Option<Fingerprint>,

    /// Fields written by other clients, kept so a rename does not drop them
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl Attributes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fingerprint: None,
            other: serde_json::Map::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    pub fn unreadable() -> Self {
        Self::new(UNREADABLE_NAME)
    }
}

fn lenient_fingerprint<'de, D>(deserializer: D) -> Result<Option<Fingerprint>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| match Fingerprint::parse(&s) {
        Ok(fp) => Some(fp),
        Err(e) => {
            debug!(error = %e, "ignoring malformed fingerprint");
            None
        }
    }))
}

/// Encrypt attributes with a node's AES key into the base64url wire form.
pub fn encrypt_attributes(attributes: &Attributes, key: &[u8; KEY_SIZE]) -> CryptoResult<String> {
    let json = serde_json::to_vec(attributes).map_err(|e| CryptoError::Encoding(e.to_string()))?;

    let mut plaintext = Vec::with_capacity(ATTRIBUTES_MAGIC.len() + json.len() + BLOCK_SIZE);
    plaintext.extend_from_slice(ATTRIBUTES_MAGIC);
    plaintext.extend_from_slice(&json);
    let padding = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;
    plaintext.resize(plaintext.len() + padding, 0);

    Ok(base64url_encode(&cbc_encrypt(key, &plaintext)?))
}

/// Decrypt an attribute blob, falling back to [`Attributes::unreadable`].
pub fn decrypt_attributes(blob: &str, key: &[u8; KEY_SIZE]) -> Attributes {
    match try_decrypt_attributes(blob, key) {
        Ok(attributes) => attributes,
        Err(e) => {
            warn!(error = %e, "could not decrypt node attributes");
            Attributes::unreadable()
        }
    }
}

fn try_decrypt_attributes(blob: &str, key: &[u8; KEY_SIZE]) -> CryptoResult<Attributes> {
    let plaintext = cbc_decrypt(key, &base64url_decode(blob)?)?;
    let body = plaintext
        .strip_prefix(ATTRIBUTES_MAGIC.as_slice())
        .ok_or_else(|| CryptoError::Encoding("attribute blob lacks the MEGA prefix".into()))?;
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    serde_json::from_slice(&body[..end]).map_err(|e| CryptoError::Encoding(e.to_string()))
}

const FINGERPRINT_CRC_COUNT: usize = 4;
const FINGERPRINT_CRC_BYTES: usize = FINGERPRINT_CRC_COUNT * 4;
/// Files up to this size get one CRC per quarter over every byte
const FINGERPRINT_FULL_MAX: u64 = 8192;
const FINGERPRINT_BLOCKS: u64 = 32;
const FINGERPRINT_BLOCK_SIZE: usize = 64;

/// Content fingerprint used to recognise an already-uploaded file: four
/// CRC32 values over (samples of) the content plus the modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub crc: [u32; FINGERPRINT_CRC_COUNT],
    /// Seconds since the Unix epoch
    pub modified: i64,
}

impl Fingerprint {
    /// Fingerprint `size` bytes of `reader`, starting from offset 0.
    pub fn compute<R: Read + Seek>(reader: &mut R, size: u64, modified: i64) -> io::Result<Self> {
        let mut crc = [0u32; FINGERPRINT_CRC_COUNT];
        reader.seek(SeekFrom::Start(0))?;

        if size <= FINGERPRINT_CRC_BYTES as u64 {
            let mut raw = [0u8; FINGERPRINT_CRC_BYTES];
            reader.read_exact(&mut raw[..size as usize])?;
            for (word, chunk) in crc.iter_mut().zip(raw.chunks_exact(4)) {
                *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        } else if size <= FINGERPRINT_FULL_MAX {
            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data)?;
            let len = data.len();
            for (i, word) in crc.iter_mut().enumerate() {
                let begin = i * len / FINGERPRINT_CRC_COUNT;
                let end = (i + 1) * len / FINGERPRINT_CRC_COUNT;
                *word = crc32fast::hash(&data[begin..end]);
            }
        } else {
            let mut block = [0u8; FINGERPRINT_BLOCK_SIZE];
            let span = size - FINGERPRINT_BLOCK_SIZE as u64;
            let samples = FINGERPRINT_CRC_COUNT as u64 * FINGERPRINT_BLOCKS - 1;
            for (i, word) in crc.iter_mut().enumerate() {
                let mut hasher = crc32fast::Hasher::new();
                for j in 0..FINGERPRINT_BLOCKS {
                    let index = i as u64 * FINGERPRINT_BLOCKS + j;
                    let offset = (span as u128 * index as u128 / samples as u128) as u64;
                    reader.seek(SeekFrom::Start(offset))?;
                    reader.read_exact(&mut block)?;
                    hasher.update(&block);
                }
                *word = hasher.finalize();
            }
        }

        Ok(Self { crc, modified })
    }

    /// 16 CRC bytes (each big-endian) followed by the length-prefixed
    /// little-endian modification time.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FINGERPRINT_CRC_BYTES + 9);
        for word in self.crc {
            out.extend_from_slice(&word.to_be_bytes());
        }

        let mut value = self.modified as u64;
        let mut time = Vec::with_capacity(8);
        while value != 0 {
            time.push(value as u8);
            value >>= 8;
        }
        out.push(time.len() as u8);
        out.extend_from_slice(&time);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() <= FINGERPRINT_CRC_BYTES {
            return Err(CryptoError::Encoding(format!(
                "fingerprint too short: {} bytes",
                bytes.len()
            )));
        }

        let mut crc = [0u32; FINGERPRINT_CRC_COUNT];
        for (word, chunk) in crc.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let time = &bytes[FINGERPRINT_CRC_BYTES..];
        let len = time[0] as usize;
        if len > 8 || time.len() < len + 1 {
            return Err(CryptoError::Encoding(format!(
                "invalid fingerprint timestamp length {len}"
            )));
        }
        let modified = time[1..=len]
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));

        Ok(Self {
            crc,
            modified: modified as i64,
        })
    }

    /// The base64url form stored in attribute field `c`.
    pub fn encode(&self) -> String {
        base64url_encode(&self.to_bytes())
    }

    pub fn parse(s: &str) -> CryptoResult<Self> {
        Self::from_bytes(&base64url_decode(s)?)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::parse(&s).map_err(serde::de::Error::custom)
    }
}
