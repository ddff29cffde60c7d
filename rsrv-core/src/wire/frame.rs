use super::consts::*;
use super::header::Header;
use super::value::{decode as decode_value, encode as encode_value, storage_size, Sexp};
use super::{DecodeError, WireError};
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 16-byte QAP1 frame header (spec §3 "Frame").
const HEADER_LEN: usize = 16;

/// One request/reply parameter (`DT_*`, spec §3 "Payload parameter").
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int(u32),
    Str(String),
    ByteStream(Vec<u8>),
    Sexp(Sexp),
}

impl Param {
    fn type_tag(&self) -> u8 {
        match self {
            Param::Int(_) => DT_INT,
            Param::Str(_) => DT_STRING,
            Param::ByteStream(_) => DT_BYTESTREAM,
            Param::Sexp(_) => DT_SEXP,
        }
    }

    fn body_len(&self) -> u64 {
        match self {
            Param::Int(_) => 4,
            Param::Str(s) => round_up_4(s.len() as u64 + 1),
            Param::ByteStream(b) => b.len() as u64,
            Param::Sexp(s) => storage_size(s),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let header = Header::new(self.type_tag(), self.body_len());
        header.write(out, DT_LARGE);
        match self {
            Param::Int(v) => {
                let mut tmp = [0u8; 4];
                LittleEndian::write_u32(&mut tmp, *v);
                out.extend_from_slice(&tmp);
            }
            Param::Str(s) => {
                let start = out.len();
                out.extend_from_slice(s.as_bytes());
                out.push(0);
                let written = out.len() - start;
                let padded = round_up_4(written as u64) as usize;
                out.resize(out.len() + (padded - written), 0);
            }
            Param::ByteStream(b) => out.extend_from_slice(b),
            Param::Sexp(s) => encode_value(s, out),
        }
    }
}

fn round_up_4(n: u64) -> u64 {
    (n + 3) & !3
}

/// Encode `params` back-to-back with no inter-parameter padding.
pub fn encode_params(params: &[Param]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in params {
        p.encode(&mut out);
    }
    out
}

/// Build a full QAP1 frame: 16-byte header + payload (spec §4.1
/// `encode_frame`).
pub fn encode_frame(cmd: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    let len = payload.len() as u64;
    let mut hdr = [0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut hdr[0..4], cmd);
    LittleEndian::write_u32(&mut hdr[4..8], (len & 0xffff_ffff) as u32);
    LittleEndian::write_u32(&mut hdr[8..12], 0); // dof
    LittleEndian::write_u32(&mut hdr[12..16], (len >> 32) as u32);
    out.extend_from_slice(&hdr);
    out.extend_from_slice(payload);
    out
}

pub fn encode_ok(resp: u32, params: &[Param]) -> Vec<u8> {
    encode_frame(CMD_RESP | resp, &encode_params(params))
}

pub fn encode_err(err_code: u8) -> Vec<u8> {
    encode_frame(RESP_ERR | ((err_code as u32) << 24), &[])
}

pub fn encode_err_with_body(err_code: u8, body: &[u8]) -> Vec<u8> {
    encode_frame(RESP_ERR | ((err_code as u32) << 24), body)
}

/// Read exactly one frame from `stream`. Returns `Ok(None)` if the peer
/// closed before a full 16-byte header arrived (spec §4.1 `read_frame`:
/// "if fewer are read, the connection is treated as closed").
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<(u32, Vec<u8>)>, WireError> {
    let mut hdr = [0u8; HEADER_LEN];
    let mut read = 0;
    while read < HEADER_LEN {
        let n = stream.read(&mut hdr[read..]).await?;
        if n == 0 {
            return if read == 0 { Ok(None) } else { Err(WireError::ConnBroken) };
        }
        read += n;
    }
    let cmd = LittleEndian::read_u32(&hdr[0..4]);
    let len_lo = LittleEndian::read_u32(&hdr[4..8]) as u64;
    let dof = LittleEndian::read_u32(&hdr[8..12]) as usize;
    let len_hi = LittleEndian::read_u32(&hdr[12..16]) as u64;
    let total_len = (len_hi << 32 | len_lo) as usize;

    let mut payload = vec![0u8; total_len];
    stream.read_exact(&mut payload).await?;
    if dof > 0 {
        if dof > payload.len() {
            return Err(WireError::Decode(DecodeError::Truncated));
        }
        payload.drain(0..dof);
    }
    Ok(Some((cmd, payload)))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    frame: &[u8],
) -> Result<(), WireError> {
    stream.write_all(frame).await?;
    Ok(())
}

/// One parameter as scanned by [`iter_params`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedParam {
    pub type_byte: u8,
    pub start: usize,
    pub len: usize,
    pub large: bool,
    pub unaligned: bool,
}

impl ParsedParam {
    pub fn body<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[self.start..self.start + self.len]
    }
}

/// Scan `payload` for up to [`MAX_PARAMS`] TLV parameters (spec §4.1
/// `iter_params`). `require_aligned` rejects any parameter following one
/// whose length was not a multiple of 4 ("architectures that require
/// aligned access").
pub fn iter_params(
    payload: &[u8],
    require_aligned: bool,
) -> Result<Vec<ParsedParam>, DecodeError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut unaligned_seen = false;

    while out.len() < MAX_PARAMS && pos < payload.len() {
        if pos + 4 > payload.len() {
            return Err(DecodeError::InvalidParam);
        }
        let word0 = LittleEndian::read_u32(&payload[pos..pos + 4]);
        if word0 == 0 {
            break; // sentinel: 0-valued header word stops the scan
        }
        let header = Header::parse(payload, pos, DT_LARGE)?;
        let header_len = header.encoded_len();
        let start = pos + header_len;
        let end = start + header.body_len as usize;
        if end > payload.len() {
            return Err(DecodeError::InvalidParam);
        }
        let unaligned = header.body_len % 4 != 0;
        if unaligned_seen && require_aligned {
            return Err(DecodeError::Unaligned);
        }
        if unaligned {
            unaligned_seen = true;
        }
        out.push(ParsedParam {
            type_byte: header.type_byte,
            start,
            len: header.body_len as usize,
            large: header.large,
            unaligned,
        });
        pos = end;
    }
    Ok(out)
}

/// Decode a `DT_STRING` parameter body (NUL-terminated, zero-padded).
pub fn decode_string_param(body: &[u8]) -> String {
    let nul = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..nul]).into_owned()
}

/// Decode a `DT_SEXP` parameter body into a [`Sexp`] tree.
pub fn decode_sexp_param(body: &[u8]) -> Result<Sexp, DecodeError> {
    let (sexp, _consumed) = decode_value(body, 0, body.len())?;
    Ok(sexp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::value::Value;

    #[test]
    fn frame_round_trips_via_encode_decode() {
        let payload = b"hello world".to_vec();
        let frame = encode_frame(CMD_EVAL, &payload);
        assert_eq!(frame.len(), HEADER_LEN + payload.len());
        assert_eq!(&frame[HEADER_LEN..], &payload[..]);
    }

    #[tokio::test]
    async fn read_frame_round_trips() {
        let payload = encode_params(&[Param::Str("1+1".into())]);
        let frame = encode_frame(CMD_EVAL, &payload);
        let mut cursor = std::io::Cursor::new(frame);
        let (cmd, got) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(cmd, CMD_EVAL);
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn read_frame_returns_none_on_clean_close() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn iter_params_emits_each_param() {
        let params =
            vec![Param::Str("x".into()), Param::Sexp(Sexp::new(Value::ArrayInt(vec![42])))];
        let payload = encode_params(&params);
        let parsed = iter_params(&payload, false).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].type_byte, DT_STRING);
        assert_eq!(parsed[1].type_byte, DT_SEXP);
    }

    #[test]
    fn iter_params_stops_at_sentinel() {
        let mut payload = encode_params(&[Param::Int(1)]);
        payload.extend_from_slice(&[0, 0, 0, 0]);
        payload.extend_from_slice(&encode_params(&[Param::Int(2)]));
        let parsed = iter_params(&payload, false).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn iter_params_caps_at_max() {
        let params: Vec<Param> = (0..(MAX_PARAMS as u32 + 5)).map(Param::Int).collect();
        let payload = encode_params(&params);
        let parsed = iter_params(&payload, false).unwrap();
        assert_eq!(parsed.len(), MAX_PARAMS);
    }

    #[test]
    fn iter_params_rejects_header_past_buffer() {
        let payload = vec![0x01, 0x00, 0x00, 0x10]; // claims type 0x10 len huge
        assert!(iter_params(&payload, false).is_err());
    }
}
