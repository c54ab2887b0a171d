//! Streaming AES-128-CTR transform with the chunked MetaMac
//!
//! One engine serves both directions; [`StreamMode`] only decides which side
//! of the XOR feeds the MAC (always the plaintext) and whether the final MAC
//! is checked against the node key.
//!
//! Per 16-byte block at offset `pos`:
//! ```text
//! if pos is a chunk start: fileMac = AES(fileMac ^ chunkMac) (unless pos == 0); chunkMac = IV‖IV
//! keystream = AES(IV ‖ be64(pos / 16))    (Ctr64BE over IV ‖ 0u64)
//! out       = in ^ keystream
//! chunkMac  = AES(chunkMac ^ plaintext)
//! ```
//! At end of stream the last chunk is folded and
//! `MetaMac = (fileMac[0..4]^fileMac[4..8]) ‖ (fileMac[8..12]^fileMac[12..16])`.
//!
//! Reads before the end of the stream must ask for at least one block and are
//! rounded down to a multiple of 16, so a read may return fewer bytes than
//! requested while data remains. Loop until `Ok(0)`.
//!
//! A source error or truncation in the middle of a read leaves the stream
//! failed: every later read errors, and the transfer restarts with a new stream.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use mega_core::config::TransferConfig;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::block::{xor_in_place, BlockCipher};
use crate::chunks::chunk_positions;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{generate_content_key, FileKey};
use crate::{BLOCK_SIZE, IV_SIZE, KEY_SIZE, META_MAC_SIZE};

/// 64-bit big-endian block counter in the low half of the counter block
type Aes128Ctr64BE = ctr::Ctr64BE<Aes128>;

/// Direction of the transform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Source is plaintext; the MetaMac is produced for the new node key.
    Encrypt,
    /// Source is ciphertext; the MetaMac must match the node key's.
    Decrypt { expected_meta_mac: [u8; META_MAC_SIZE] },
}

/// Forward-only crypto stream over a source of known length.
pub struct AesCtrStream<R> {
    source: R,
    length: u64,
    position: u64,
    mode: StreamMode,
    cipher: BlockCipher,
    keystream: Aes128Ctr64BE,
    key: Zeroizing<[u8; KEY_SIZE]>,
    iv: [u8; IV_SIZE],
    chunk_positions: Vec<u64>,
    next_chunk: usize,
    chunk_mac: [u8; BLOCK_SIZE],
    file_mac: [u8; BLOCK_SIZE],
    meta_mac: Option<[u8; META_MAC_SIZE]>,
    /// Offset of the block whose transform failed
    failed_at: Option<u64>,
}

impl<R: Read> AesCtrStream<R> {
    pub fn new(
        source: R,
        length: u64,
        key: [u8; KEY_SIZE],
        iv: [u8; IV_SIZE],
        mode: StreamMode,
    ) -> Self {
        let chunk_positions = chunk_positions(length);
        debug!(
            length,
            chunks = chunk_positions.len(),
            encrypt = matches!(mode, StreamMode::Encrypt),
            "created crypto stream"
        );

        let mut counter_block = [0u8; BLOCK_SIZE];
        counter_block[..IV_SIZE].copy_from_slice(&iv);

        Self {
            source,
            length,
            position: 0,
            mode,
            cipher: BlockCipher::new(&key),
            keystream: Aes128Ctr64BE::new((&key).into(), (&counter_block).into()),
            key: Zeroizing::new(key),
            iv,
            chunk_positions,
            next_chunk: 0,
            chunk_mac: [0u8; BLOCK_SIZE],
            file_mac: [0u8; BLOCK_SIZE],
            meta_mac: None,
            failed_at: None,
        }
    }

    /// Encrypt `source` under a freshly generated key and IV.
    pub fn encrypter(source: R, length: u64) -> Self {
        let (key, iv) = generate_content_key();
        Self::new(source, length, key, iv, StreamMode::Encrypt)
    }

    /// Encrypt `source` under a caller-chosen key and IV.
    pub fn encrypter_with_key(
        source: R,
        length: u64,
        key: [u8; KEY_SIZE],
        iv: [u8; IV_SIZE],
    ) -> Self {
        Self::new(source, length, key, iv, StreamMode::Encrypt)
    }

    pub fn decrypter(
        source: R,
        length: u64,
        key: [u8; KEY_SIZE],
        iv: [u8; IV_SIZE],
        expected_meta_mac: [u8; META_MAC_SIZE],
    ) -> Self {
        Self::new(
            source,
            length,
            key,
            iv,
            StreamMode::Decrypt { expected_meta_mac },
        )
    }

    /// Decrypt a file's content with the parts of its node key.
    pub fn for_file_key(source: R, length: u64, file_key: &FileKey) -> Self {
        Self::decrypter(
            source,
            length,
            file_key.aes_key(),
            file_key.iv(),
            file_key.meta_mac(),
        )
    }

    /// Like [`decrypter`](Self::decrypter) for key material of unchecked length.
    pub fn decrypter_from_slices(
        source: R,
        length: u64,
        key: &[u8],
        iv: &[u8],
        expected_meta_mac: &[u8],
    ) -> CryptoResult<Self> {
        Ok(Self::decrypter(
            source,
            length,
            fixed(key, "AES key")?,
            fixed(iv, "IV")?,
            fixed(expected_meta_mac, "MetaMac")?,
        ))
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// The content AES key (freshly generated for an encrypter).
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn chunk_positions(&self) -> &[u64] {
        &self.chunk_positions
    }

    /// True after a read failed part-way; the stream cannot be resumed.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// True once every byte has been read and the MAC finalized.
    pub fn is_finished(&self) -> bool {
        self.meta_mac.is_some()
    }

    /// Condensed MAC, available only after the whole stream was consumed.
    pub fn meta_mac(&self) -> Option<[u8; META_MAC_SIZE]> {
        self.meta_mac
    }

    /// Full 16-byte file MAC, available only after the whole stream was consumed.
    pub fn file_mac(&self) -> Option<[u8; BLOCK_SIZE]> {
        self.meta_mac.map(|_| self.file_mac)
    }

    /// The 32-byte node key for the content just encrypted.
    pub fn node_key(&self) -> Option<FileKey> {
        self.meta_mac.map(|meta_mac| FileKey::pack(&self.key, &self.iv, &meta_mac))
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn transform_block(&mut self, pos: u64, out: &mut [u8]) -> CryptoResult<()> {
        if self.chunk_positions.get(self.next_chunk) == Some(&pos) {
            if pos != 0 {
                self.fold_chunk();
            }
            self.chunk_mac[..IV_SIZE].copy_from_slice(&self.iv);
            self.chunk_mac[IV_SIZE..].copy_from_slice(&self.iv);
            self.next_chunk += 1;
        }

        let n = out.len();
        let mut input = Zeroizing::new([0u8; BLOCK_SIZE]);
        self.fill_from_source(pos, &mut input[..n])?;

        out.copy_from_slice(&input[..n]);
        self.keystream.apply_keystream(out);

        let plaintext = match self.mode {
            StreamMode::Encrypt => &input[..n],
            StreamMode::Decrypt { .. } => &out[..n],
        };
        xor_in_place(&mut self.chunk_mac, plaintext);
        self.chunk_mac = self.cipher.encrypt_block(&self.chunk_mac);
        Ok(())
    }

    fn fill_from_source(&mut self, pos: u64, buf: &mut [u8]) -> CryptoResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(CryptoError::TruncatedSource {
                        expected: self.length,
                        actual: pos + filled as u64,
                    })
                }
                Ok(read) => filled += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn fold_chunk(&mut self) {
        xor_in_place(&mut self.file_mac, &self.chunk_mac);
        self.file_mac = self.cipher.encrypt_block(&self.file_mac);
    }

    fn finish(&mut self) -> CryptoResult<()> {
        // An empty stream never starts a chunk, so there is nothing to fold.
        if self.length > 0 {
            self.fold_chunk();
        }

        let mut meta_mac = [0u8; META_MAC_SIZE];
        for i in 0..4 {
            meta_mac[i] = self.file_mac[i] ^ self.file_mac[i + 4];
            meta_mac[i + 4] = self.file_mac[i + 8] ^ self.file_mac[i + 12];
        }
        self.meta_mac = Some(meta_mac);

        if let StreamMode::Decrypt { expected_meta_mac } = self.mode {
            if !bool::from(meta_mac.ct_eq(&expected_meta_mac)) {
                warn!(length = self.length, "MetaMac mismatch on download");
                return Err(CryptoError::DownloadCorrupted {
                    expected: hex::encode(expected_meta_mac),
                    computed: hex::encode(meta_mac),
                });
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for AesCtrStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(position) = self.failed_at {
            return Err(CryptoError::StreamFailed { position }.into());
        }
        if self.position == self.length {
            if !self.is_finished() {
                self.finish()?;
            }
            return Ok(0);
        }

        let remaining = self.length - self.position;
        let count = if (buf.len() as u64) < remaining {
            if buf.len() < BLOCK_SIZE {
                return Err(CryptoError::InvalidReadSize {
                    requested: buf.len(),
                    position: self.position,
                    length: self.length,
                }
                .into());
            }
            buf.len() - buf.len() % BLOCK_SIZE
        } else {
            remaining as usize
        };

        let start = self.position;
        for offset in (0..count).step_by(BLOCK_SIZE) {
            let end = (offset + BLOCK_SIZE).min(count);
            let pos = start + offset as u64;
            if let Err(e) = self.transform_block(pos, &mut buf[offset..end]) {
                warn!(position = pos, length = self.length, error = %e, "crypto stream failed");
                self.failed_at = Some(pos);
                return Err(e.into());
            }
        }
        self.position += count as u64;

        if self.position == self.length {
            self.finish()?;
        }
        Ok(count)
    }
}

/// Only `SeekFrom::Current(0)` (a position query) is accepted.
impl<R: Read> Seek for AesCtrStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.position),
            _ => Err(CryptoError::Unsupported("seek on a forward-only crypto stream").into()),
        }
    }
}

/// Crypto streams transform a source; they cannot be written to.
impl<R: Read> Write for AesCtrStream<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(CryptoError::Unsupported("write to a read-only crypto stream").into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Pump a crypto stream into `writer` until end of stream.
///
/// Reading to the end is what triggers the integrity check on downloads, so
/// callers should prefer this over ad-hoc loops. `buffer_size` is raised to
/// one block if smaller.
pub fn copy_stream<R: Read, W: Write>(
    stream: &mut AesCtrStream<R>,
    writer: &mut W,
    buffer_size: usize,
) -> io::Result<u64> {
    let mut buf = vec![0u8; buffer_size.max(BLOCK_SIZE)];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// [`copy_stream`] with the read buffer size taken from the transfer settings.
pub fn copy_stream_with_config<R: Read, W: Write>(
    stream: &mut AesCtrStream<R>,
    writer: &mut W,
    config: &TransferConfig,
) -> io::Result<u64> {
    copy_stream(stream, writer, config.buffer_size)
}

fn fixed<const N: usize>(bytes: &[u8], what: &'static str) -> CryptoResult<[u8; N]> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        what,
        expected: N,
        actual: bytes.len(),
    })
}
