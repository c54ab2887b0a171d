//! Upload fragment packing and the fragment driver
//!
//! MAC chunks are grouped into HTTP fragments of roughly `PackSize` bytes.
//! A fragment always ends on a chunk boundary so the server can verify each
//! one as it arrives.

use std::io::Read;

use mega_core::config::{TransferConfig, PACK_ALL_CHUNKS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunks::chunk_positions;
use crate::error::{CryptoError, CryptoResult};
use crate::stream::AesCtrStream;
use crate::BLOCK_SIZE;

/// Default fragment target (1 MiB)
pub const DEFAULT_PACK_SIZE: u64 = 1024 * 1024;

/// How many bytes of MAC chunks to pack into one upload fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackSize {
    /// Absorb chunks until the fragment reaches at least this many bytes
    Bytes(u64),
    /// Send the whole stream as one fragment
    All,
}

impl Default for PackSize {
    fn default() -> Self {
        PackSize::Bytes(DEFAULT_PACK_SIZE)
    }
}

impl PackSize {
    /// Interpret the raw `chunks_pack_size` setting (`-1` = everything).
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            PACK_ALL_CHUNKS => PackSize::All,
            n if n > 0 => PackSize::Bytes(n as u64),
            n => {
                warn!(chunks_pack_size = n, "invalid pack size, using default");
                PackSize::default()
            }
        }
    }

    fn absorbs(self, fragment_len: u64) -> bool {
        match self {
            PackSize::All => true,
            PackSize::Bytes(limit) => fragment_len < limit,
        }
    }
}

impl From<&TransferConfig> for PackSize {
    fn from(config: &TransferConfig) -> Self {
        PackSize::from_raw(config.chunks_pack_size)
    }
}

/// Fragment lengths covering a stream of `length` bytes with chunk starts `positions`.
///
/// Each fragment takes at least one whole chunk. An empty stream yields a
/// single empty fragment.
pub fn upload_chunk_sizes(positions: &[u64], length: u64, pack: PackSize) -> Vec<u64> {
    let end_of = |i: usize| positions.get(i + 1).copied().unwrap_or(length);
    let last = positions.len().saturating_sub(1);

    let mut sizes = Vec::new();
    let mut i = 0;
    while i < positions.len() {
        let start = positions[i];
        let mut end = end_of(i);
        while i < last && pack.absorbs(end - start) {
            i += 1;
            end = end_of(i);
        }
        sizes.push(end - start);
        i += 1;
    }
    sizes
}

/// One HTTP upload request: `length` bytes starting at stream `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadFragment {
    pub offset: u64,
    pub length: u64,
}

impl UploadFragment {
    pub fn url(&self, base: &str) -> String {
        fragment_url(base, self.offset)
    }
}

/// Fragments are posted to the upload URL suffixed with their stream offset.
pub fn fragment_url(base: &str, offset: u64) -> String {
    format!("{}/{}", base.trim_end_matches('/'), offset)
}

/// Ordered fragments for one upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    length: u64,
    fragments: Vec<UploadFragment>,
}

impl UploadPlan {
    pub fn new(length: u64, pack: PackSize) -> Self {
        let positions = chunk_positions(length);
        let mut offset = 0;
        let fragments = upload_chunk_sizes(&positions, length, pack)
            .into_iter()
            .map(|len| {
                let fragment = UploadFragment {
                    offset,
                    length: len,
                };
                offset += len;
                fragment
            })
            .collect();
        Self { length, fragments }
    }

    pub fn fragments(&self) -> &[UploadFragment] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn total_len(&self) -> u64 {
        self.length
    }
}

/// Encrypt and hand over every fragment of `plan` to `send`, in order.
///
/// `send` receives the fragment and its ciphertext and returns the server's
/// completion handle if it produced one (normally only for the last
/// fragment). Cancellation is checked before each fragment, never in the
/// middle of one. A failed attempt cannot resume: the caller retries with a
/// fresh stream and the same plan.
pub fn drive_upload<R, F>(
    stream: &mut AesCtrStream<R>,
    plan: &UploadPlan,
    cancel: &CancellationToken,
    mut send: F,
) -> CryptoResult<Option<String>>
where
    R: Read,
    F: FnMut(&UploadFragment, &[u8]) -> anyhow::Result<Option<String>>,
{
    if plan.total_len() != stream.length() || stream.position() != 0 {
        return Err(CryptoError::PlanMismatch {
            planned: plan.total_len(),
            length: stream.length() - stream.position(),
        });
    }

    let mut completion = None;
    for (index, fragment) in plan.fragments().iter().enumerate() {
        if cancel.is_cancelled() {
            debug!(index, offset = fragment.offset, "upload cancelled");
            return Err(CryptoError::Cancelled);
        }

        let mut buf = vec![0u8; fragment.length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = stream.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(CryptoError::TruncatedSource {
                    expected: stream.length(),
                    actual: stream.position(),
                });
            }
            filled += n;
        }

        debug!(
            index,
            offset = fragment.offset,
            length = fragment.length,
            "sending upload fragment"
        );
        if let Some(handle) = send(fragment, &buf).map_err(CryptoError::Transport)? {
            completion = Some(handle);
        }
    }

    // Finalizes the MAC of an empty stream; a no-op otherwise.
    let mut probe = [0u8; BLOCK_SIZE];
    stream.read(&mut probe)?;

    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const K: u64 = 1024;
    const M: u64 = 1024 * 1024;

    fn sizes(length: u64, pack: PackSize) -> Vec<u64> {
        upload_chunk_sizes(&chunk_positions(length), length, pack)
    }

    #[test]
    fn default_pack_groups_growing_chunks() {
        // Chunks: 128K 256K 384K 512K 640K 768K 896K 1024K then 1M each
        let length = 10 * M;
        let result = sizes(length, PackSize::default());
        assert_eq!(
            result,
            vec![
                128 * K + 256 * K + 384 * K + 512 * K,
                640 * K + 768 * K,
                896 * K + 1024 * K,
                M,
                M,
                M,
                M,
                M,
                512 * K,
            ]
        );
        assert_eq!(result.iter().sum::<u64>(), length);
    }

    #[test]
    fn pack_all_merges_everything() {
        assert_eq!(sizes(5 * M + 3, PackSize::All), vec![5 * M + 3]);
    }

    #[test]
    fn tiny_pack_size_still_sends_whole_chunks() {
        let result = sizes(400 * K, PackSize::Bytes(1));
        assert_eq!(result, vec![128 * K, 256 * K, 16 * K]);
    }

    #[test]
    fn empty_stream_has_one_empty_fragment() {
        assert_eq!(sizes(0, PackSize::default()), vec![0]);
    }

    #[test]
    fn pack_size_from_config() {
        assert_eq!(PackSize::from_raw(-1), PackSize::All);
        assert_eq!(PackSize::from_raw(4096), PackSize::Bytes(4096));
        assert_eq!(PackSize::from_raw(0), PackSize::default());
        assert_eq!(
            PackSize::from(&TransferConfig::default()),
            PackSize::Bytes(DEFAULT_PACK_SIZE)
        );
    }

    #[test]
    fn plan_offsets_are_contiguous() {
        let plan = UploadPlan::new(3 * M + 100, PackSize::default());
        let mut expected = 0;
        for fragment in plan.fragments() {
            assert_eq!(fragment.offset, expected);
            expected += fragment.length;
        }
        assert_eq!(expected, plan.total_len());
        assert_eq!(
            plan.fragments()[1].url("https://gfs.example/ul/abc/"),
            format!("https://gfs.example/ul/abc/{}", plan.fragments()[1].offset)
        );
    }

    #[test]
    fn drive_upload_sends_every_fragment() {
        let data: Vec<u8> = (0..3 * M as usize).map(|i| i as u8).collect();
        let length = data.len() as u64;
        let plan = UploadPlan::new(length, PackSize::default());
        let mut stream = AesCtrStream::encrypter(Cursor::new(data), length);

        let mut sent = Vec::new();
        let handle = drive_upload(&mut stream, &plan, &CancellationToken::new(), |f, bytes| {
            assert_eq!(bytes.len() as u64, f.length);
            sent.push(*f);
            Ok((f.offset + f.length == length).then(|| "completion-handle".to_string()))
        })
        .unwrap();

        assert_eq!(sent, plan.fragments());
        assert_eq!(handle.as_deref(), Some("completion-handle"));
        assert!(stream.is_finished());
    }

    #[test]
    fn drive_upload_finalizes_empty_stream() {
        let plan = UploadPlan::new(0, PackSize::default());
        let mut stream = AesCtrStream::encrypter(Cursor::new(Vec::new()), 0);

        drive_upload(&mut stream, &plan, &CancellationToken::new(), |_, bytes| {
            assert!(bytes.is_empty());
            Ok(Some("h".into()))
        })
        .unwrap();
        assert!(stream.node_key().is_some());
    }

    #[test]
    fn drive_upload_checks_cancellation_between_fragments() {
        let length = 2 * M;
        let plan = UploadPlan::new(length, PackSize::Bytes(256 * K));
        let mut stream = AesCtrStream::encrypter(Cursor::new(vec![0u8; length as usize]), length);
        let cancel = CancellationToken::new();

        let mut calls = 0;
        let result = drive_upload(&mut stream, &plan, &cancel, |_, _| {
            calls += 1;
            if calls == 2 {
                cancel.cancel();
            }
            Ok(None)
        });

        assert!(matches!(result, Err(CryptoError::Cancelled)));
        assert_eq!(calls, 2, "the in-flight fragment completes before cancelling");
        assert!(!stream.is_finished());
    }

    #[test]
    fn drive_upload_surfaces_transport_errors() {
        let plan = UploadPlan::new(64, PackSize::default());
        let mut stream = AesCtrStream::encrypter(Cursor::new(vec![0u8; 64]), 64);

        let err = drive_upload(&mut stream, &plan, &CancellationToken::new(), |_, _| {
            anyhow::bail!("HTTP 503")
        })
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn drive_upload_rejects_mismatched_plan() {
        let plan = UploadPlan::new(128, PackSize::default());
        let mut stream = AesCtrStream::encrypter(Cursor::new(vec![0u8; 64]), 64);
        let result = drive_upload(&mut stream, &plan, &CancellationToken::new(), |_, _| Ok(None));
        assert!(matches!(
            result,
            Err(CryptoError::PlanMismatch {
                planned: 128,
                length: 64
            })
        ));
    }

    proptest! {
        #[test]
        fn fragments_cover_stream_on_chunk_boundaries(
            length in 0u64..40 * 1024 * 1024,
            raw_pack in prop_oneof![Just(-1i64), 1i64..8 * 1024 * 1024],
        ) {
            let positions = chunk_positions(length);
            let result = upload_chunk_sizes(&positions, length, PackSize::from_raw(raw_pack));

            prop_assert_eq!(result.iter().sum::<u64>(), length);
            let mut offset = 0;
            for size in &result {
                prop_assert!(positions.contains(&offset), "fragment starts on a chunk boundary");
                if length > 0 {
                    prop_assert!(*size > 0);
                }
                offset += size;
            }
        }
    }
}
