//! Compact on-disk encoding of accumulated durations.
//!
//! A stored total is a signed nanosecond count written as:
//!
//! ```text
//! [version: u8][zig-zag LEB128 varint]
//! ```
//!
//! The varint needs at most ten bytes for any `i64`; typical totals (hours of
//! play) fit in six or seven. The leading version byte lets a later format be
//! introduced without guessing at old values.

use thiserror::Error;

/// Current encoding version tag.
pub const ENCODING_VERSION: u8 = 1;

/// Maximum encoded length: version byte plus a ten byte varint.
pub const MAX_ENCODED_LEN: usize = 1 + MAX_VARINT_LEN;

const MAX_VARINT_LEN: usize = 10;

/// Errors decoding a stored duration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The value had no bytes at all.
    #[error("encoded duration is empty")]
    Empty,
    /// The version tag is not one this build understands.
    #[error("unsupported duration encoding version {0}")]
    UnknownVersion(u8),
    /// The varint ended before its final byte.
    #[error("encoded duration is truncated")]
    Truncated,
    /// The varint does not fit in 64 bits.
    #[error("encoded duration overflows 64 bits")]
    Overflow,
    /// Bytes remained after the varint.
    #[error("{0} trailing bytes after encoded duration")]
    TrailingBytes(usize),
}

/// Encodes a nanosecond count.
pub fn encode_nanos(nanos: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_ENCODED_LEN);
    buf.push(ENCODING_VERSION);

    #[expect(
        clippy::cast_sign_loss,
        reason = "zig-zag maps the sign into the low bit before reinterpreting"
    )]
    let mut value = ((nanos << 1) ^ (nanos >> 63)) as u64;
    while value >= 0x80 {
        #[expect(clippy::cast_possible_truncation, reason = "masked to 7 bits")]
        let low = (value & 0x7f) as u8;
        buf.push(low | 0x80);
        value >>= 7;
    }
    #[expect(clippy::cast_possible_truncation, reason = "value < 0x80 here")]
    let last = value as u8;
    buf.push(last);
    buf
}

/// Decodes a nanosecond count written by [`encode_nanos`].
pub fn decode_nanos(bytes: &[u8]) -> Result<i64, DecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != ENCODING_VERSION {
        return Err(DecodeError::UnknownVersion(version));
    }

    let mut value: u64 = 0;
    for (index, &byte) in body.iter().enumerate() {
        if index == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(DecodeError::Overflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            let rest = body.len() - index - 1;
            if rest > 0 {
                return Err(DecodeError::TrailingBytes(rest));
            }
            #[expect(
                clippy::cast_possible_wrap,
                reason = "reinterpreting the zig-zag encoded bits"
            )]
            let decoded = ((value >> 1) as i64) ^ -((value & 1) as i64);
            return Ok(decoded);
        }
    }
    Err(DecodeError::Truncated)
}
