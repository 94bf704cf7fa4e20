//! The framed codec: translation between logical packets and
//! length-prefixed MessagePack frames. Pure and socket-free; the reader task
//! and the handshake drive [`read_frame`] with whatever stream they own.

use crate::error::ClientError;
use crate::proto::*;
use bytes::BytesMut;
use rmpv::Value;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frames above this are treated as a malformed length prefix rather than
/// honored with an allocation.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// A decoded response frame.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub code: u64,
    pub sync: u64,
    pub schema_id: u64,
    pub body: Vec<(Value, Value)>,
}

impl RawPacket {
    pub fn field(&self, key: u64) -> Option<&Value> {
        self.body.iter().find(|(k, _)| k.as_u64() == Some(key)).map(|(_, v)| v)
    }

    /// The server error string from the body, or a placeholder.
    pub fn error_message(&self) -> String {
        match self.field(KEY_ERROR).and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => "unknown server error".to_string(),
        }
    }
}

fn encode_err(e: impl std::fmt::Display) -> ClientError {
    ClientError::Usage(format!("cannot encode packet: {}", e))
}

/// Encodes a request packet: msgpack u32 length prefix, header map
/// {CODE, SYNC, SCHEMA_ID}, then the body map.
pub fn encode_request(
    code: Code, sync: u64, schema_id: u64, body: &[(u64, Value)],
) -> Result<Vec<u8>, ClientError> {
    encode_packet(code as u64, sync, schema_id, body)
}

/// Encodes a response packet; the test harness uses this to impersonate a
/// server.
pub fn encode_response(
    code: u64, sync: u64, schema_id: u64, body: &[(u64, Value)],
) -> Result<Vec<u8>, ClientError> {
    encode_packet(code, sync, schema_id, body)
}

fn encode_packet(
    code: u64, sync: u64, schema_id: u64, body: &[(u64, Value)],
) -> Result<Vec<u8>, ClientError> {
    let mut payload: Vec<u8> = Vec::with_capacity(64);
    rmp::encode::write_map_len(&mut payload, 3).map_err(encode_err)?;
    rmp::encode::write_uint(&mut payload, KEY_CODE).map_err(encode_err)?;
    rmp::encode::write_uint(&mut payload, code).map_err(encode_err)?;
    rmp::encode::write_uint(&mut payload, KEY_SYNC).map_err(encode_err)?;
    rmp::encode::write_uint(&mut payload, sync).map_err(encode_err)?;
    rmp::encode::write_uint(&mut payload, KEY_SCHEMA_ID).map_err(encode_err)?;
    rmp::encode::write_uint(&mut payload, schema_id).map_err(encode_err)?;
    rmp::encode::write_map_len(&mut payload, body.len() as u32).map_err(encode_err)?;
    for (key, value) in body {
        rmp::encode::write_uint(&mut payload, *key).map_err(encode_err)?;
        rmpv::encode::write_value(&mut payload, value).map_err(encode_err)?;
    }
    frame(payload)
}

/// Encodes the AUTH request sent during the handshake.
pub fn encode_auth(
    sync: u64, username: &str, password: &str, salt: &[u8],
) -> Result<Vec<u8>, ClientError> {
    let scramble = scramble(salt, password);
    let body = [
        (KEY_USER_NAME, Value::from(username)),
        (
            KEY_TUPLE,
            Value::Array(vec![
                Value::from("chap-sha1"),
                Value::Binary(scramble.to_vec()),
            ]),
        ),
    ];
    encode_request(Code::Auth, sync, 0, &body)
}

fn frame(payload: Vec<u8>) -> Result<Vec<u8>, ClientError> {
    // oversize packets are the caller's problem, not the connection's
    if payload.len() > u32::MAX as usize {
        return Err(ClientError::Usage(format!(
            "packet of {} bytes does not fit the frame length prefix",
            payload.len()
        )));
    }
    let mut out: Vec<u8> = Vec::with_capacity(payload.len() + 5);
    rmp::encode::write_u32(&mut out, payload.len() as u32).map_err(encode_err)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

fn malformed(what: &str) -> ClientError {
    ClientError::comm(format!("malformed frame: {}", what))
}

/// Reads one length-prefixed frame into `scratch` and decodes it. The
/// scratch buffer is resized to each frame and reused across reads. Every
/// error returned here is fatal to the connection; the caller is expected to
/// die on it.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R, scratch: &mut BytesMut,
) -> Result<RawPacket, ClientError> {
    let len = read_frame_len(reader).await?;
    if len > MAX_FRAME_SIZE {
        return Err(malformed("length prefix exceeds frame limit"));
    }
    scratch.resize(len, 0);
    reader.read_exact(&mut scratch[..]).await?;
    decode_payload(&scratch[..])
}

async fn read_frame_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, ClientError> {
    let marker = reader.read_u8().await?;
    let len = match marker {
        0x00..=0x7f => marker as u64,
        0xcc => reader.read_u8().await? as u64,
        0xcd => reader.read_u16().await? as u64,
        0xce => reader.read_u32().await? as u64,
        0xcf => reader.read_u64().await?,
        _ => return Err(malformed("length prefix is not a msgpack uint")),
    };
    Ok(len as usize)
}

fn decode_payload(payload: &[u8]) -> Result<RawPacket, ClientError> {
    let mut cursor = Cursor::new(payload);
    let header = rmpv::decode::read_value(&mut cursor)
        .map_err(|_| malformed("header is not valid msgpack"))?;
    let Value::Map(header) = header else {
        return Err(malformed("header is not a map"));
    };
    let lookup = |key: u64| {
        header
            .iter()
            .find(|(k, _)| k.as_u64() == Some(key))
            .and_then(|(_, v)| v.as_u64())
    };
    let code = lookup(KEY_CODE).ok_or_else(|| malformed("header has no response code"))?;
    let sync = lookup(KEY_SYNC).ok_or_else(|| malformed("header has no sync id"))?;
    let schema_id = lookup(KEY_SCHEMA_ID).unwrap_or(0);
    let body = if (cursor.position() as usize) < payload.len() {
        match rmpv::decode::read_value(&mut cursor)
            .map_err(|_| malformed("body is not valid msgpack"))?
        {
            Value::Map(pairs) => pairs,
            Value::Nil => Vec::new(),
            _ => return Err(malformed("body is not a map")),
        }
    } else {
        Vec::new()
    };
    Ok(RawPacket { code, sync, schema_id, body })
}
