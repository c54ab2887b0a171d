//! Node keys: file key splitting/packing, folder and share keys, key wrapping

use rand::RngCore;
use zeroize::Zeroize;

use crate::block::{ecb_decrypt, ecb_encrypt};
use crate::encoding::{base64url_decode, base64url_encode};
use crate::error::{CryptoError, CryptoResult};
use crate::{FILE_KEY_SIZE, IV_SIZE, KEY_SIZE, META_MAC_SIZE};

/// The 32-byte key stored (wrapped) on a file node. Zeroized on drop.
///
/// Layout: `k[0..16] ^ k[16..32]` is the AES key, `k[16..24]` the CTR IV and
/// `k[24..32]` the expected MetaMac.
#[derive(Clone, PartialEq, Eq)]
pub struct FileKey {
    bytes: [u8; FILE_KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; FILE_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; FILE_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                what: "file key",
                expected: FILE_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Build the on-wire form from the parts known after an upload.
    pub fn pack(
        aes_key: &[u8; KEY_SIZE],
        iv: &[u8; IV_SIZE],
        meta_mac: &[u8; META_MAC_SIZE],
    ) -> Self {
        let mut bytes = [0u8; FILE_KEY_SIZE];
        for i in 0..IV_SIZE {
            bytes[i] = aes_key[i] ^ iv[i];
            bytes[i + 16] = iv[i];
        }
        for i in 0..META_MAC_SIZE {
            bytes[i + 8] = aes_key[i + 8] ^ meta_mac[i];
            bytes[i + 24] = meta_mac[i];
        }
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; FILE_KEY_SIZE] {
        &self.bytes
    }

    /// The AES-128 key used for content and attributes.
    pub fn aes_key(&self) -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        for (i, k) in key.iter_mut().enumerate() {
            *k = self.bytes[i] ^ self.bytes[i + 16];
        }
        key
    }

    pub fn iv(&self) -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&self.bytes[16..24]);
        iv
    }

    pub fn meta_mac(&self) -> [u8; META_MAC_SIZE] {
        let mut mac = [0u8; META_MAC_SIZE];
        mac.copy_from_slice(&self.bytes[24..32]);
        mac
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

macro_rules! aes_key_type {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
                let bytes: [u8; KEY_SIZE] =
                    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                        what: $what,
                        expected: KEY_SIZE,
                        actual: bytes.len(),
                    })?;
                Ok(Self { bytes })
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

aes_key_type!(
    /// A directory's 128-bit key, used as-is (no splitting).
    FolderKey,
    "folder key"
);

aes_key_type!(
    /// Key of a shared folder subtree; node keys inside the share are wrapped with it.
    ShareKey,
    "share key"
);

/// A resolved node key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKey {
    File(FileKey),
    Folder(FolderKey),
}

impl NodeKey {
    /// The AES key protecting the node's attributes (and content, for files).
    pub fn aes_key(&self) -> [u8; KEY_SIZE] {
        match self {
            NodeKey::File(key) => key.aes_key(),
            NodeKey::Folder(key) => *key.as_bytes(),
        }
    }

    /// Raw (unwrapped) bytes as stored in the node's key field.
    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            NodeKey::File(key) => key.as_bytes(),
            NodeKey::Folder(key) => key.as_bytes(),
        }
    }
}

/// Generate a random content key and IV for a new upload.
pub fn generate_content_key() -> ([u8; KEY_SIZE], [u8; IV_SIZE]) {
    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut iv);
    (key, iv)
}

/// Generate a random folder key.
pub fn generate_folder_key() -> FolderKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FolderKey::from_bytes(bytes)
}

/// Wrap key material (16 or 32 bytes) under a 128-bit key.
pub fn wrap_key(wrapping: &[u8; KEY_SIZE], key: &[u8]) -> CryptoResult<Vec<u8>> {
    ecb_encrypt(wrapping, key)
}

/// Unwrap key material wrapped by [`wrap_key`].
pub fn unwrap_key(wrapping: &[u8; KEY_SIZE], wrapped: &[u8]) -> CryptoResult<Vec<u8>> {
    ecb_decrypt(wrapping, wrapped)
}

/// Wrap and base64url-encode, ready for a request body.
pub fn wrap_key_b64(wrapping: &[u8; KEY_SIZE], key: &[u8]) -> CryptoResult<String> {
    Ok(base64url_encode(&wrap_key(wrapping, key)?))
}

/// Decode a base64url wrapped key and unwrap it.
pub fn unwrap_key_b64(wrapping: &[u8; KEY_SIZE], wrapped: &str) -> CryptoResult<Vec<u8>> {
    unwrap_key(wrapping, &base64url_decode(wrapped)?)
}
