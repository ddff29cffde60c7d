#![allow(dead_code)]

//! QAP1 command, response, error and type codes (spec §6.3, §6.4, §3).

// Commands (requests)
pub const CMD_LOGIN: u32 = 0x01;
pub const CMD_VOID_EVAL: u32 = 0x02;
pub const CMD_EVAL: u32 = 0x03;
pub const CMD_SHUTDOWN: u32 = 0x04;
pub const CMD_OPEN_FILE: u32 = 0x10;
pub const CMD_CREATE_FILE: u32 = 0x11;
pub const CMD_CLOSE_FILE: u32 = 0x12;
pub const CMD_READ_FILE: u32 = 0x13;
pub const CMD_WRITE_FILE: u32 = 0x14;
pub const CMD_REMOVE_FILE: u32 = 0x15;
pub const CMD_SET_SEXP: u32 = 0x20;
pub const CMD_ASSIGN_SEXP: u32 = 0x21;
pub const CMD_DETACH_SESSION: u32 = 0x30;
pub const CMD_DETACHED_VOID_EVAL: u32 = 0x31;
pub const CMD_SET_BUFFER_SIZE: u32 = 0x81;

/// Response flag OR'd into the command code of a reply (§3).
pub const CMD_RESP: u32 = 0x10000;
pub const RESP_OK: u32 = CMD_RESP | 0x0001;
pub const RESP_ERR: u32 = CMD_RESP | 0x0002;

// Error codes, carried in the high byte of an ERR response (§6.4).
pub const ERR_AUTH_FAILED: u8 = 0x41;
pub const ERR_CONN_BROKEN: u8 = 0x42;
pub const ERR_INV_CMD: u8 = 0x43;
pub const ERR_INV_PAR: u8 = 0x44;
pub const ERR_IO_ERROR: u8 = 0x4d;
pub const ERR_NOT_OPEN: u8 = 0x4e;
pub const ERR_ACCESS_DENIED: u8 = 0x4f;
pub const ERR_DETACH_FAILED: u8 = 0x52;
pub const ERR_DATA_OVERFLOW: u8 = 0x58;
pub const ERR_OBJECT_TOO_BIG: u8 = 0x59;
pub const ERR_OUT_OF_MEM: u8 = 0x5a;

/// Parameter (`DT_*`) type tags, carried in the high byte of a TLV header.
pub const DT_INT: u8 = 1;
pub const DT_STRING: u8 = 4;
pub const DT_BYTESTREAM: u8 = 5;
pub const DT_SEXP: u8 = 10;

/// High bit of a `DT_*` type byte: length extends into a second 32-bit word.
pub const DT_LARGE: u8 = 0x40;

/// Value-tree node (`XT_*`) type tags.
pub const XT_NULL: u8 = 0;
pub const XT_INT: u8 = 1;
pub const XT_DOUBLE: u8 = 2;
pub const XT_STR: u8 = 3;
pub const XT_SYM: u8 = 5;
pub const XT_LIST: u8 = 6;
pub const XT_CLOS: u8 = 7;
pub const XT_BOOL: u8 = 8;
pub const XT_RAW: u8 = 9;
pub const XT_LANG: u8 = 10;
pub const XT_VECTOR: u8 = 16;
pub const XT_ARRAY_INT: u8 = 32;
pub const XT_ARRAY_DOUBLE: u8 = 33;
pub const XT_ARRAY_BOOL: u8 = 34;
pub const XT_ARRAY_STR: u8 = 35;
pub const XT_UNKNOWN: u8 = 48;

/// High bit of an `XT_*` type byte: a preceding attribute node is present.
pub const XT_HAS_ATTR: u8 = 0x80;
/// Second-highest bit of an `XT_*`/`DT_*` type byte: large (8-byte) header.
pub const XT_LARGE: u8 = 0x40;

/// Threshold above which a node/parameter body must use the large header
/// form (spec §3 "Invariants", §4.1 "Storage-size rules").
pub const LARGE_THRESHOLD: u64 = 0xfffff0;

/// Maximum parameters `iter_params` will emit from one payload (spec §4.1).
pub const MAX_PARAMS: usize = 16;
