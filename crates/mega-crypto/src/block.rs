//! AES-128 block primitive
//!
//! Every construction in the protocol reduces to single-block AES-128:
//! - ECB (block-by-block, equivalent to CBC with a fresh zero IV per block): key wrapping
//! - CBC with a zero IV and no padding: attribute blobs
//! - single-block encrypt with a reusable key schedule: the chunk MAC

use ::aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use ::aes::Aes128;

use crate::error::{CryptoError, CryptoResult};
use crate::{BLOCK_SIZE, KEY_SIZE};

/// An expanded AES-128 key schedule, reused across blocks.
#[derive(Clone)]
pub struct BlockCipher {
    inner: Aes128,
}

impl BlockCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            inner: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    pub fn encrypt_block(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = GenericArray::from(*block);
        self.inner.encrypt_block(&mut block);
        block.into()
    }

    pub fn decrypt_block(&self, block: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = GenericArray::from(*block);
        self.inner.decrypt_block(&mut block);
        block.into()
    }
}

impl std::fmt::Debug for BlockCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn check_blocks(data: &[u8]) -> CryptoResult<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidBlockLength(data.len()));
    }
    Ok(())
}

fn as_block(chunk: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(chunk);
    block
}

/// Encrypt each 16-byte block independently.
pub fn ecb_encrypt(key: &[u8; KEY_SIZE], data: &[u8]) -> CryptoResult<Vec<u8>> {
    check_blocks(data)?;
    let cipher = BlockCipher::new(key);
    Ok(data
        .chunks_exact(BLOCK_SIZE)
        .flat_map(|chunk| cipher.encrypt_block(&as_block(chunk)))
        .collect())
}

/// Decrypt each 16-byte block independently.
pub fn ecb_decrypt(key: &[u8; KEY_SIZE], data: &[u8]) -> CryptoResult<Vec<u8>> {
    check_blocks(data)?;
    let cipher = BlockCipher::new(key);
    Ok(data
        .chunks_exact(BLOCK_SIZE)
        .flat_map(|chunk| cipher.decrypt_block(&as_block(chunk)))
        .collect())
}

/// AES-128-CBC, zero IV, no padding.
pub fn cbc_encrypt(key: &[u8; KEY_SIZE], data: &[u8]) -> CryptoResult<Vec<u8>> {
    check_blocks(data)?;
    let cipher = BlockCipher::new(key);
    let mut out = Vec::with_capacity(data.len());
    let mut prev = [0u8; BLOCK_SIZE];

    for chunk in data.chunks_exact(BLOCK_SIZE) {
        let mut block = as_block(chunk);
        xor_in_place(&mut block, &prev);
        prev = cipher.encrypt_block(&block);
        out.extend_from_slice(&prev);
    }
    Ok(out)
}

/// AES-128-CBC, zero IV, no padding.
pub fn cbc_decrypt(key: &[u8; KEY_SIZE], data: &[u8]) -> CryptoResult<Vec<u8>> {
    check_blocks(data)?;
    let cipher = BlockCipher::new(key);
    let mut out = Vec::with_capacity(data.len());
    let mut prev = [0u8; BLOCK_SIZE];

    for chunk in data.chunks_exact(BLOCK_SIZE) {
        let ciphertext = as_block(chunk);
        let mut block = cipher.decrypt_block(&ciphertext);
        xor_in_place(&mut block, &prev);
        out.extend_from_slice(&block);
        prev = ciphertext;
    }
    Ok(out)
}

pub(crate) fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}
