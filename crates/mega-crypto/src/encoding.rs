//! URL-safe base64 as used for every key, handle and blob on the wire
//!
//! `+`→`-`, `/`→`_`, no `=` on encode; padding is accepted but not required
//! on decode.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;

use crate::error::{CryptoError, CryptoResult};

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_LENIENT.encode(data)
}

pub fn base64url_decode(s: &str) -> CryptoResult<Vec<u8>> {
    Ok(URL_SAFE_LENIENT.decode(s.trim())?)
}

/// Decode into a fixed-size array, naming the field in the error.
pub fn base64url_decode_array<const N: usize>(
    s: &str,
    what: &'static str,
) -> CryptoResult<[u8; N]> {
    let bytes = base64url_decode(s)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            what,
            expected: N,
            actual: bytes.len(),
        })
}
