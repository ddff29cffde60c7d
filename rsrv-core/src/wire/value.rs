use super::consts::*;
use super::header::Header;
use super::DecodeError;
use byteorder::{ByteOrder, LittleEndian};

/// Recursion budget for [`decode`] — bounds both the number of bytes a
/// decode may consume and the depth it may recurse to, since every length
/// field on the wire is attacker-controlled (Design Notes §9).
const MAX_DEPTH: usize = 64;

fn round_up_4(n: u64) -> u64 {
    (n + 3) & !3
}

/// Tri-state boolean, matching the `{0=false, 1=true, 2=NA}` wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bool3 {
    False,
    True,
    Na,
}

impl Bool3 {
    fn to_byte(self) -> u8 {
        match self {
            Bool3::False => 0,
            Bool3::True => 1,
            Bool3::Na => 2,
        }
    }

    fn from_byte(b: u8) -> Bool3 {
        match b {
            1 => Bool3::True,
            2 => Bool3::Na,
            _ => Bool3::False,
        }
    }
}

/// One node of the typed value tree carried by a `DT_SEXP` parameter
/// (spec §3 "Typed value tree").
#[derive(Debug, Clone, PartialEq)]
pub struct Sexp {
    pub attr: Option<Box<Sexp>>,
    pub value: Value,
}

impl Sexp {
    pub fn new(value: Value) -> Self {
        Sexp { attr: None, value }
    }

    pub fn with_attr(value: Value, attr: Sexp) -> Self {
        Sexp { attr: Some(Box::new(attr)), value }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i32),
    ArrayInt(Vec<i32>),
    Double(f64),
    ArrayDouble(Vec<f64>),
    Bool(Bool3),
    ArrayBool(Vec<Bool3>),
    Str(String),
    /// Invariant: never holds exactly one element — a length-1 string
    /// vector is represented as `Value::Str` (spec §3, collapse rule).
    ArrayStr(Vec<String>),
    Raw(Vec<u8>),
    Vector(Vec<Sexp>),
    List(Box<Sexp>, Box<Sexp>, Box<Sexp>),
    Lang(Box<Sexp>, Box<Sexp>, Box<Sexp>),
    Clos(Box<Sexp>, Box<Sexp>),
    Sym(String),
    Unknown(u32),
}

impl Value {
    /// Build a string-vector value, collapsing a single element to `Str`
    /// per the wire format's transparent-collapse rule.
    pub fn array_str(items: Vec<String>) -> Value {
        if items.len() == 1 {
            Value::Str(items.into_iter().next().unwrap())
        } else {
            Value::ArrayStr(items)
        }
    }

    fn type_tag(&self) -> u8 {
        match self {
            Value::Null => XT_NULL,
            Value::Int(_) => XT_INT,
            Value::ArrayInt(_) => XT_ARRAY_INT,
            Value::Double(_) => XT_DOUBLE,
            Value::ArrayDouble(_) => XT_ARRAY_DOUBLE,
            Value::Bool(_) => XT_BOOL,
            Value::ArrayBool(_) => XT_ARRAY_BOOL,
            Value::Str(_) => XT_STR,
            Value::ArrayStr(_) => XT_ARRAY_STR,
            Value::Raw(_) => XT_RAW,
            Value::Vector(_) => XT_VECTOR,
            Value::List(..) => XT_LIST,
            Value::Lang(..) => XT_LANG,
            Value::Clos(..) => XT_CLOS,
            Value::Sym(_) => XT_SYM,
            Value::Unknown(_) => XT_UNKNOWN,
        }
    }
}

/// Size, in bytes, of `sexp` once encoded — including its own header and,
/// recursively, any attribute node (spec §4.1 "Storage-size rules"). Must
/// match [`encode`] byte-for-byte (testable property 3).
pub fn storage_size(sexp: &Sexp) -> u64 {
    let mut body = attr_storage_size(&sexp.attr);
    body += body_size(&sexp.value);
    let header_len = if body > LARGE_THRESHOLD { 8 } else { 4 };
    header_len + body
}

fn attr_storage_size(attr: &Option<Box<Sexp>>) -> u64 {
    attr.as_ref().map(|a| storage_size(a)).unwrap_or(0)
}

fn body_size(value: &Value) -> u64 {
    match value {
        Value::Null => 0,
        Value::Int(_) => 4,
        Value::ArrayInt(v) => 4 * v.len() as u64,
        Value::Double(_) => 8,
        Value::ArrayDouble(v) => 8 * v.len() as u64,
        Value::Bool(_) => 4,
        Value::ArrayBool(v) => 4 + round_up_4(v.len() as u64),
        Value::Str(s) => round_up_4(s.len() as u64 + 1),
        Value::ArrayStr(items) => {
            let raw: u64 = items.iter().map(|s| s.len() as u64 + 1).sum();
            round_up_4(raw)
        }
        Value::Raw(b) => 4 + round_up_4(b.len() as u64),
        Value::Vector(children) => children.iter().map(storage_size).sum(),
        Value::List(a, b, c) | Value::Lang(a, b, c) => {
            storage_size(a) + storage_size(b) + storage_size(c)
        }
        Value::Clos(a, b) => storage_size(a) + storage_size(b),
        Value::Sym(name) => storage_size(&Sexp::new(Value::Str(name.clone()))),
        Value::Unknown(_) => 4,
    }
}

/// Encode `sexp` to its wire representation, appending to `out`.
pub fn encode(sexp: &Sexp, out: &mut Vec<u8>) {
    let body_len = attr_storage_size(&sexp.attr) + body_size(&sexp.value);
    let mut type_byte = sexp.value.type_tag();
    if sexp.attr.is_some() {
        type_byte |= XT_HAS_ATTR;
    }
    let header = Header::new(type_byte, body_len);
    header.write(out, XT_LARGE);

    if let Some(attr) = &sexp.attr {
        encode(attr, out);
    }
    encode_body(&sexp.value, out);
}

fn encode_body(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => {}
        Value::Int(i) => {
            let mut tmp = [0u8; 4];
            LittleEndian::write_i32(&mut tmp, *i);
            out.extend_from_slice(&tmp);
        }
        Value::ArrayInt(items) => {
            for i in items {
                let mut tmp = [0u8; 4];
                LittleEndian::write_i32(&mut tmp, *i);
                out.extend_from_slice(&tmp);
            }
        }
        Value::Double(d) => {
            let mut tmp = [0u8; 8];
            LittleEndian::write_f64(&mut tmp, *d);
            out.extend_from_slice(&tmp);
        }
        Value::ArrayDouble(items) => {
            for d in items {
                let mut tmp = [0u8; 8];
                LittleEndian::write_f64(&mut tmp, *d);
                out.extend_from_slice(&tmp);
            }
        }
        Value::Bool(b) => {
            out.push(b.to_byte());
            out.extend_from_slice(&[0xff, 0xff, 0xff]);
        }
        Value::ArrayBool(items) => {
            let mut len_bytes = [0u8; 4];
            LittleEndian::write_u32(&mut len_bytes, items.len() as u32);
            out.extend_from_slice(&len_bytes);
            let start = out.len();
            for b in items {
                out.push(b.to_byte());
            }
            pad_to_4_with(out, start, 0xff);
        }
        Value::Str(s) => {
            let start = out.len();
            out.extend_from_slice(s.as_bytes());
            out.push(0);
            pad_to_4_with(out, start, 0);
        }
        Value::ArrayStr(items) => {
            let start = out.len();
            for s in items {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            pad_to_4_with(out, start, 0);
        }
        Value::Raw(bytes) => {
            let mut len_bytes = [0u8; 4];
            LittleEndian::write_u32(&mut len_bytes, bytes.len() as u32);
            out.extend_from_slice(&len_bytes);
            let start = out.len();
            out.extend_from_slice(bytes);
            pad_to_4_with(out, start, 0);
        }
        Value::Vector(children) => {
            for c in children {
                encode(c, out);
            }
        }
        Value::List(a, b, c) | Value::Lang(a, b, c) => {
            encode(a, out);
            encode(b, out);
            encode(c, out);
        }
        Value::Clos(a, b) => {
            encode(a, out);
            encode(b, out);
        }
        Value::Sym(name) => {
            encode(&Sexp::new(Value::Str(name.clone())), out);
        }
        Value::Unknown(code) => {
            let mut tmp = [0u8; 4];
            LittleEndian::write_u32(&mut tmp, *code);
            out.extend_from_slice(&tmp);
        }
    }
}

fn pad_to_4_with(out: &mut Vec<u8>, start: usize, pad: u8) {
    let written = out.len() - start;
    let padded = round_up_4(written as u64) as usize;
    out.resize(out.len() + (padded - written), pad);
}

/// Decode one value node from `buf[pos..pos+len]`, returning the node and
/// the number of bytes consumed. Bounded by [`MAX_DEPTH`] recursion.
pub fn decode(buf: &[u8], pos: usize, len: usize) -> Result<(Sexp, usize), DecodeError> {
    decode_bounded(buf, pos, len, 0)
}

fn decode_bounded(
    buf: &[u8],
    pos: usize,
    len: usize,
    depth: usize,
) -> Result<(Sexp, usize), DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::DepthExceeded);
    }
    if pos + 4 > buf.len() || pos + 4 > pos + len {
        return Err(DecodeError::Truncated);
    }
    let header = Header::parse(buf, pos, XT_LARGE)?;
    let has_attr = header.type_byte & XT_HAS_ATTR != 0;
    let base_type = header.type_byte & !XT_HAS_ATTR;
    let header_len = header.encoded_len();
    let body_end = pos + header_len + header.body_len as usize;
    if body_end > buf.len() {
        return Err(DecodeError::Truncated);
    }

    let mut cursor = pos + header_len;
    let mut attr = None;
    if has_attr {
        let (a, consumed) = decode_bounded(buf, cursor, body_end - cursor, depth + 1)?;
        attr = Some(Box::new(a));
        cursor += consumed;
    }

    let value = decode_body(base_type, buf, cursor, body_end - cursor, depth)?;
    Ok((Sexp { attr, value }, body_end - pos))
}

fn decode_body(
    base_type: u8,
    buf: &[u8],
    pos: usize,
    len: usize,
    depth: usize,
) -> Result<Value, DecodeError> {
    let body = buf.get(pos..pos + len).ok_or(DecodeError::Truncated)?;
    Ok(match base_type {
        XT_NULL => Value::Null,
        XT_INT => {
            if body.len() < 4 {
                return Err(DecodeError::Truncated);
            }
            Value::Int(LittleEndian::read_i32(&body[0..4]))
        }
        XT_ARRAY_INT => {
            let n = body.len() / 4;
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                items.push(LittleEndian::read_i32(&body[i * 4..i * 4 + 4]));
            }
            Value::ArrayInt(items)
        }
        XT_DOUBLE => {
            if body.len() < 8 {
                return Err(DecodeError::Truncated);
            }
            Value::Double(LittleEndian::read_f64(&body[0..8]))
        }
        XT_ARRAY_DOUBLE => {
            let n = body.len() / 8;
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                items.push(LittleEndian::read_f64(&body[i * 8..i * 8 + 8]));
            }
            Value::ArrayDouble(items)
        }
        XT_BOOL => {
            if body.is_empty() {
                return Err(DecodeError::Truncated);
            }
            Value::Bool(Bool3::from_byte(body[0]))
        }
        XT_ARRAY_BOOL => {
            if body.len() < 4 {
                return Err(DecodeError::Truncated);
            }
            let n = LittleEndian::read_u32(&body[0..4]) as usize;
            let elems = body.get(4..).ok_or(DecodeError::Truncated)?;
            if elems.len() < n {
                return Err(DecodeError::Truncated);
            }
            Value::ArrayBool(elems[..n].iter().map(|b| Bool3::from_byte(*b)).collect())
        }
        XT_STR => {
            let nul = body.iter().position(|&b| b == 0).unwrap_or(body.len());
            Value::Str(String::from_utf8_lossy(&body[..nul]).into_owned())
        }
        XT_ARRAY_STR => {
            let mut items = Vec::new();
            let mut start = 0;
            while start < body.len() {
                let rel_nul = body[start..].iter().position(|&b| b == 0);
                let end = match rel_nul {
                    Some(r) => start + r,
                    None => body.len(),
                };
                if end > start || rel_nul.is_some() {
                    items.push(String::from_utf8_lossy(&body[start..end]).into_owned());
                }
                start = end + 1;
            }
            Value::array_str(items)
        }
        XT_RAW => {
            if body.len() < 4 {
                return Err(DecodeError::Truncated);
            }
            let n = LittleEndian::read_u32(&body[0..4]) as usize;
            let rest = body.get(4..).ok_or(DecodeError::Truncated)?;
            if rest.len() < n {
                return Err(DecodeError::Truncated);
            }
            Value::Raw(rest[..n].to_vec())
        }
        XT_VECTOR => {
            let mut children = Vec::new();
            let mut off = 0;
            while off < len {
                let (child, consumed) = decode_bounded(buf, pos + off, len - off, depth + 1)?;
                children.push(child);
                off += consumed;
            }
            Value::Vector(children)
        }
        XT_LIST | XT_LANG => {
            let (head, c1) = decode_bounded(buf, pos, len, depth + 1)?;
            let (tail, c2) = decode_bounded(buf, pos + c1, len - c1, depth + 1)?;
            let (tag, _c3) = decode_bounded(buf, pos + c1 + c2, len - c1 - c2, depth + 1)?;
            let boxed = (Box::new(head), Box::new(tail), Box::new(tag));
            if base_type == XT_LIST {
                Value::List(boxed.0, boxed.1, boxed.2)
            } else {
                Value::Lang(boxed.0, boxed.1, boxed.2)
            }
        }
        XT_CLOS => {
            let (formals, c1) = decode_bounded(buf, pos, len, depth + 1)?;
            let (body_node, _c2) = decode_bounded(buf, pos + c1, len - c1, depth + 1)?;
            Value::Clos(Box::new(formals), Box::new(body_node))
        }
        XT_SYM => {
            let (name, _) = decode_bounded(buf, pos, len, depth + 1)?;
            match name.value {
                Value::Str(s) => Value::Sym(s),
                _ => return Err(DecodeError::InvalidValue),
            }
        }
        _ => {
            if body.len() < 4 {
                Value::Unknown(base_type as u32)
            } else {
                Value::Unknown(LittleEndian::read_u32(&body[0..4]))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(sexp: Sexp) {
        let mut buf = Vec::new();
        encode(&sexp, &mut buf);
        assert_eq!(storage_size(&sexp), buf.len() as u64);
        let (decoded, consumed) = decode(&buf, 0, buf.len()).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, sexp);
    }

    #[test]
    fn null_round_trips() {
        round_trip(Sexp::new(Value::Null));
    }

    #[test]
    fn array_double_round_trips() {
        round_trip(Sexp::new(Value::ArrayDouble(vec![2.0, 3.5, -1.0])));
    }

    #[test]
    fn array_int_round_trips() {
        round_trip(Sexp::new(Value::ArrayInt(vec![1, 2, 3, 42])));
    }

    #[test]
    fn string_round_trips() {
        round_trip(Sexp::new(Value::Str("hello".into())));
    }

    #[test]
    fn string_vector_len1_collapses_to_str() {
        let mut buf = Vec::new();
        let collapsed = Sexp::new(Value::array_str(vec!["only".into()]));
        assert_eq!(collapsed.value, Value::Str("only".into()));
        encode(&collapsed, &mut buf);
        let (decoded, _) = decode(&buf, 0, buf.len()).unwrap();
        assert_eq!(decoded.value, Value::Str("only".into()));
    }

    #[test]
    fn array_str_round_trips() {
        round_trip(Sexp::new(Value::array_str(vec!["a".into(), "bb".into(), "ccc".into()])));
    }

    #[test]
    fn array_bool_round_trips() {
        round_trip(Sexp::new(Value::ArrayBool(vec![Bool3::True, Bool3::False, Bool3::Na])));
    }

    #[test]
    fn raw_round_trips() {
        round_trip(Sexp::new(Value::Raw(vec![1, 2, 3, 4, 5])));
    }

    #[test]
    fn list_round_trips() {
        let node = Sexp::new(Value::List(
            Box::new(Sexp::new(Value::Int(1))),
            Box::new(Sexp::new(Value::Null)),
            Box::new(Sexp::new(Value::Str("tag".into()))),
        ));
        round_trip(node);
    }

    #[test]
    fn attributes_round_trip() {
        let attr = Sexp::new(Value::Str("names".into()));
        let node = Sexp::with_attr(Value::ArrayInt(vec![1, 2]), attr);
        round_trip(node);
    }

    #[test]
    fn large_form_boundary() {
        // body of exactly LARGE_THRESHOLD bytes -> small header
        let n = (LARGE_THRESHOLD / 4) as usize;
        let small = Sexp::new(Value::ArrayInt(vec![0; n]));
        let mut buf = Vec::new();
        encode(&small, &mut buf);
        let header = Header::parse(&buf, 0, XT_LARGE).unwrap();
        assert!(!header.large);

        // one element over the threshold -> large header
        let large = Sexp::new(Value::ArrayInt(vec![0; n + 1]));
        let mut buf2 = Vec::new();
        encode(&large, &mut buf2);
        let header2 = Header::parse(&buf2, 0, XT_LARGE).unwrap();
        assert!(header2.large);
        round_trip(large);
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let buf = [0u8; 2];
        assert!(decode(&buf, 0, buf.len()).is_err());
    }

    #[test]
    fn decode_bounds_depth() {
        // a vector nested deeper than MAX_DEPTH must fail, not overflow the stack.
        let mut inner = Sexp::new(Value::Null);
        for _ in 0..(MAX_DEPTH + 10) {
            inner = Sexp::new(Value::Vector(vec![inner]));
        }
        let mut buf = Vec::new();
        encode(&inner, &mut buf);
        assert!(matches!(decode(&buf, 0, buf.len()), Err(DecodeError::DepthExceeded)));
    }
}
