//! The QAP1 wire codec (component C1, spec §4.1): frame header, TLV
//! parameters and the recursive typed-value tree, plus the byte-swap
//! self-test required at startup (spec §4.1 "Endianness").

pub mod consts;
pub mod frame;
pub mod header;
pub mod value;

pub use consts::*;
pub use frame::{
    decode_sexp_param, decode_string_param, encode_err, encode_err_with_body, encode_frame,
    encode_ok, encode_params, iter_params, read_frame, write_frame, Param, ParsedParam,
};
pub use header::Header;
pub use value::{storage_size, Bool3, Sexp, Value};

use thiserror::Error;

/// Errors from decoding a length-prefixed structure off the wire. Every
/// variant maps to a transport- or protocol-level outcome; callers decide
/// whether that means tearing down the connection or replying with an
/// `ERR_*` code (spec §7).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer ended before a complete header/body could be read")]
    Truncated,
    #[error("a TLV header ran past the end of its buffer")]
    InvalidParam,
    #[error("recursion depth exceeded while decoding a value tree")]
    DepthExceeded,
    #[error("value tree structurally invalid for its node type")]
    InvalidValue,
    #[error("parameter length not a multiple of 4 following an unaligned one")]
    Unaligned,
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection broken mid-frame")]
    ConnBroken,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Verify that the little-endian integer/double codecs used throughout the
/// codec round-trip correctly. Run once at startup (spec §4.1, §6.6); the
/// process should abort if this fails since every subsequent decode
/// depends on it.
pub fn endian_self_test() -> bool {
    use byteorder::{ByteOrder, LittleEndian};

    let mut buf = [0u8; 4];
    LittleEndian::write_i32(&mut buf, -123_456);
    if LittleEndian::read_i32(&buf) != -123_456 {
        return false;
    }
    let mut dbuf = [0u8; 8];
    LittleEndian::write_f64(&mut dbuf, std::f64::consts::PI);
    if (LittleEndian::read_f64(&dbuf) - std::f64::consts::PI).abs() > f64::EPSILON {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_test_passes() {
        assert!(endian_self_test());
    }
}
