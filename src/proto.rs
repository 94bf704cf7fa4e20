//! Protocol vocabulary: opcodes, header and body keys, response codes, the
//! server greeting and the authentication scramble.

use crate::error::ClientError;
use base64::Engine;
use sha1::{Digest, Sha1};
use zerocopy::{FromBytes, FromZeroes};

/// Header keys.
pub const KEY_CODE: u64 = 0x00;
pub const KEY_SYNC: u64 = 0x01;
pub const KEY_SCHEMA_ID: u64 = 0x05;

/// Body keys.
pub const KEY_SPACE: u64 = 0x10;
pub const KEY_INDEX: u64 = 0x11;
pub const KEY_LIMIT: u64 = 0x12;
pub const KEY_OFFSET: u64 = 0x13;
pub const KEY_ITERATOR: u64 = 0x14;
pub const KEY_KEY: u64 = 0x20;
pub const KEY_TUPLE: u64 = 0x21;
pub const KEY_FUNCTION: u64 = 0x22;
pub const KEY_USER_NAME: u64 = 0x23;
pub const KEY_EXPRESSION: u64 = 0x27;
pub const KEY_UPSERT_OPS: u64 = 0x28;
pub const KEY_DATA: u64 = 0x30;
pub const KEY_ERROR: u64 = 0x31;
pub const KEY_METADATA: u64 = 0x32;
pub const KEY_SQL_TEXT: u64 = 0x40;
pub const KEY_SQL_BIND: u64 = 0x41;
pub const KEY_SQL_INFO: u64 = 0x42;

/// Keys inside the SQL_INFO map and a METADATA column map.
pub const SQL_INFO_ROW_COUNT: u64 = 0x00;
pub const METADATA_FIELD_NAME: u64 = 0x00;

/// Response codes. A non-zero code has the error bit set and carries the
/// server error number in the low bits.
pub const CODE_SUCCESS: u64 = 0;
pub const CODE_ERROR_BIT: u64 = 0x8000;
pub const CODE_ERROR_MASK: u64 = 0x7fff;
/// Distinguished sentinel for a stale schema id in the request header.
pub const ER_WRONG_SCHEMA_VERSION: u64 = 109;
pub const CODE_WRONG_SCHEMA_VERSION: u64 = CODE_ERROR_BIT | ER_WRONG_SCHEMA_VERSION;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Code {
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    OldCall = 6,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Call = 10,
    Execute = 11,
    Ping = 64,
}

impl Code {
    /// EVAL and both CALL flavors return one logical row; SELECT-like
    /// results are one row per tuple.
    #[inline]
    pub fn is_single_result_row(self) -> bool {
        matches!(self, Code::Eval | Code::Call | Code::OldCall)
    }
}

/// The fixed-size greeting block sent by the server right after accept:
/// a 64-byte server version line followed by a 64-byte line holding the
/// base64-encoded authentication salt.
pub const GREETING_SIZE: usize = 128;

#[derive(FromBytes, FromZeroes)]
#[repr(C)]
struct GreetingBlock {
    version_line: [u8; 64],
    salt_line: [u8; 64],
}

pub struct Greeting {
    pub server_version: String,
    pub salt: Vec<u8>,
}

impl Greeting {
    pub fn parse(buf: &[u8]) -> Result<Self, ClientError> {
        let block = GreetingBlock::ref_from(buf)
            .ok_or_else(|| ClientError::comm("greeting block is not 128 bytes"))?;
        let version_line = std::str::from_utf8(&block.version_line)
            .map_err(|_| ClientError::comm("greeting version line is not ascii"))?;
        let server_version = version_line.trim_end_matches(['\n', ' ']).to_string();
        if !server_version.starts_with("Tarantool") {
            return Err(ClientError::comm(format!("unexpected greeting: {}", server_version)));
        }
        let salt_line = std::str::from_utf8(&block.salt_line)
            .map_err(|_| ClientError::comm("greeting salt line is not ascii"))?;
        let salt_b64 = salt_line.trim_end_matches(['\n', ' ']);
        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .map_err(|_| ClientError::comm("greeting salt is not valid base64"))?;
        if salt.len() < SCRAMBLE_SIZE {
            return Err(ClientError::comm("greeting salt is too short"));
        }
        Ok(Self { server_version, salt })
    }
}

pub const SCRAMBLE_SIZE: usize = 20;

/// chap-sha1 scramble:
/// `sha1(password) XOR sha1(salt[..20] ++ sha1(sha1(password)))`.
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);
    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE]);
    hasher.update(step2);
    let step3 = hasher.finalize();
    let mut out = [0u8; SCRAMBLE_SIZE];
    for (i, b) in out.iter_mut().enumerate() {
        *b = step1[i] ^ step3[i];
    }
    out
}

/// Builds a greeting block the way a server does; the test harness uses it
/// to impersonate one.
pub fn make_greeting(version: &str, salt: &[u8]) -> Vec<u8> {
    let mut block = Vec::with_capacity(GREETING_SIZE);
    let mut line1 = format!("{} (Binary)", version).into_bytes();
    line1.resize(63, b' ');
    line1.push(b'\n');
    block.extend_from_slice(&line1);
    let mut line2 = base64::engine::general_purpose::STANDARD.encode(salt).into_bytes();
    line2.resize(63, b' ');
    line2.push(b'\n');
    block.extend_from_slice(&line2);
    block
}
