//! MAC chunk boundaries
//!
//! A stream is cut into MAC chunks that grow by 128 KiB for the first eight
//! chunks (128K, 256K, ... 1024K) and are 1 MiB from then on. The server uses
//! the same boundaries to verify uploaded fragments, so they must be computed
//! identically from the stream length alone.

/// Growth step of the first eight chunks
pub const CHUNK_STEP: u64 = 128 * 1024;

/// Number of growing chunks before the size plateaus
pub const GROWING_CHUNKS: u64 = 8;

/// Chunk size after the growing phase
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024;

/// Start offsets of every MAC chunk in a stream of `length` bytes.
///
/// Always starts with 0 and is strictly increasing; every offset is below
/// `length` except for the lone 0 of an empty stream.
pub fn chunk_positions(length: u64) -> Vec<u64> {
    let mut positions = vec![0];
    let mut start = 0u64;

    for idx in 1..=GROWING_CHUNKS {
        let size = idx * CHUNK_STEP;
        if length <= size || start >= length - size {
            break;
        }
        start += size;
        positions.push(start);
    }

    while start + MAX_CHUNK_SIZE < length {
        start += MAX_CHUNK_SIZE;
        positions.push(start);
    }

    positions
}

/// Length of the chunk starting at `positions[index]`, `None` past the last chunk.
pub fn chunk_len(positions: &[u64], index: usize, length: u64) -> Option<u64> {
    let start = *positions.get(index)?;
    let end = positions.get(index + 1).copied().unwrap_or(length);
    Some(end.saturating_sub(start))
}
