//! Login key derivation: password → password key + user hash, and master key unwrap
//!
//! Two account generations exist:
//! - v1: 65536 rounds of AES over the password words, then an email hash
//! - v2: PBKDF2-HMAC-SHA512 over the password with a per-account salt

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha512;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::block::BlockCipher;
use crate::encoding::{base64url_decode, base64url_encode};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::unwrap_key;
use crate::KEY_SIZE;

/// Starting value of the v1 password key schedule
const PASSWORD_KEY_SEED: [u8; KEY_SIZE] = [
    0x93, 0xC4, 0x67, 0xE3, 0x7D, 0xB0, 0xC7, 0xA4, 0xD1, 0xBE, 0x3F, 0x81, 0x01, 0x52, 0xCB, 0x56,
];

const PASSWORD_KEY_ROUNDS: usize = 0x10000;
const USER_HASH_ROUNDS: usize = 0x4000;
const PBKDF2_ROUNDS: u32 = 100_000;

/// The account's 128-bit master key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                what: "master key",
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Pre-login answer: which scheme the account uses (`v`) and its salt (`s`, v2 only)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthInfo {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "s", default)]
    pub salt: Option<String>,
}

impl AuthInfo {
    pub fn v1() -> Self {
        Self {
            version: 1,
            salt: None,
        }
    }

    pub fn v2(salt: impl Into<String>) -> Self {
        Self {
            version: 2,
            salt: Some(salt.into()),
        }
    }
}

/// What the login request needs: the key that unwraps the master key and
/// the hash proving knowledge of the password.
pub struct LoginKeys {
    pub password_key: Zeroizing<[u8; KEY_SIZE]>,
    pub user_hash: String,
}

impl std::fmt::Debug for LoginKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginKeys")
            .field("password_key", &"[REDACTED]")
            .field("user_hash", &self.user_hash)
            .finish()
    }
}

/// Derive the password key and user hash for `email`.
pub fn derive_login_keys(
    email: &str,
    password: &SecretString,
    auth: &AuthInfo,
) -> CryptoResult<LoginKeys> {
    debug!(version = auth.version, "deriving login keys");
    match auth.version {
        1 => {
            let password_key = prepare_password_key(password);
            let user_hash = username_hash(email, &password_key);
            Ok(LoginKeys {
                password_key,
                user_hash,
            })
        }
        2 => {
            let salt = auth
                .salt
                .as_deref()
                .ok_or_else(|| CryptoError::Encoding("v2 login requires a salt".into()))?;
            let salt = base64url_decode(salt)?;

            let mut derived = Zeroizing::new([0u8; 2 * KEY_SIZE]);
            pbkdf2::pbkdf2_hmac::<Sha512>(
                password.expose_secret().as_bytes(),
                &salt,
                PBKDF2_ROUNDS,
                derived.as_mut_slice(),
            );

            let mut password_key = Zeroizing::new([0u8; KEY_SIZE]);
            password_key.copy_from_slice(&derived[..KEY_SIZE]);
            Ok(LoginKeys {
                password_key,
                user_hash: base64url_encode(&derived[KEY_SIZE..]),
            })
        }
        _ => Err(CryptoError::Unsupported("unknown login key derivation version")),
    }
}

/// v1 password key: AES-encrypt the seed 65536 times under every 16-byte
/// slice of the packed password.
pub fn prepare_password_key(password: &SecretString) -> Zeroizing<[u8; KEY_SIZE]> {
    let words = Zeroizing::new(password_words(password.expose_secret()));
    prepare_key_rounds(&words, PASSWORD_KEY_ROUNDS)
}

fn prepare_key_rounds(words: &[u8], rounds: usize) -> Zeroizing<[u8; KEY_SIZE]> {
    let ciphers: Vec<BlockCipher> = words
        .chunks(KEY_SIZE)
        .map(|slice| {
            let mut key = Zeroizing::new([0u8; KEY_SIZE]);
            key[..slice.len()].copy_from_slice(slice);
            BlockCipher::new(&key)
        })
        .collect();

    let mut pkey = Zeroizing::new(PASSWORD_KEY_SEED);
    for _ in 0..rounds {
        for cipher in &ciphers {
            *pkey = cipher.encrypt_block(&pkey);
        }
    }
    pkey
}

/// Pack UTF-16 code units into big-endian 32-bit words, four units per word,
/// each shifted into its byte lane. Units above 0xFF spill into (and overflow
/// past) neighbouring lanes.
fn password_words(password: &str) -> Vec<u8> {
    let units: Vec<u16> = password.encode_utf16().collect();
    let mut words = vec![0u32; units.len().div_ceil(4)];
    for (i, unit) in units.iter().enumerate() {
        let shift = 24 - (i as u32 & 3) * 8;
        words[i >> 2] |= u32::from(*unit).wrapping_shl(shift);
    }
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// v1 user hash: the lowercased email folded into one block, encrypted
/// 16384 times with the password key.
pub fn username_hash(email: &str, password_key: &[u8; KEY_SIZE]) -> String {
    let mut hash = [0u8; KEY_SIZE];
    for (i, b) in email.to_lowercase().bytes().enumerate() {
        hash[i % KEY_SIZE] ^= b;
    }

    let cipher = BlockCipher::new(password_key);
    for _ in 0..USER_HASH_ROUNDS {
        hash = cipher.encrypt_block(&hash);
    }

    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&hash[..4]);
    out[4..].copy_from_slice(&hash[8..12]);
    base64url_encode(&out)
}

/// Unwrap the master key returned by a successful login.
pub fn decrypt_master_key(
    wrapped_b64: &str,
    password_key: &[u8; KEY_SIZE],
) -> CryptoResult<MasterKey> {
    let wrapped = base64url_decode(wrapped_b64)?;
    let raw = Zeroizing::new(unwrap_key(password_key, &wrapped)?);
    MasterKey::from_slice(&raw)
}
