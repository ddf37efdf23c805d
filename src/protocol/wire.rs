//! Server -> client message builders (§6).
//!
//! Every builder returns a complete, self-delimited message: `<type:u8>
//! <length:u32> <payload>`, length counting itself. Integers are
//! big-endian; UTF-8 strings are u32-length-prefixed (§6) unless noted.

use bytes::{BufMut, BytesMut};

use super::tags::server;

fn put_utf8(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// `'R'` Auth `{code:i32}`.
pub fn auth(code: i32) -> BytesMut {
    let mut msg = BytesMut::new();
    msg.put_u8(server::AUTH);
    msg.put_u32(4 + 4);
    msg.put_i32(code);
    msg
}

/// `'K'` BackendKey `{id:i32}`.
pub fn backend_key(id: i32) -> BytesMut {
    let mut msg = BytesMut::new();
    msg.put_u8(server::BACKEND_KEY);
    msg.put_u32(4 + 4);
    msg.put_i32(id);
    msg
}

/// `'S'` ParamStatus `{name:utf8, value:utf8}`.
pub fn param_status(name: &str, value: &str) -> BytesMut {
    let mut payload = BytesMut::new();
    put_utf8(&mut payload, name);
    put_utf8(&mut payload, value);

    let mut msg = BytesMut::new();
    msg.put_u8(server::PARAM_STATUS);
    msg.put_u32(4 + payload.len() as u32);
    msg.put(payload);
    msg
}

/// `'Z'` ReadyForQuery `{status:u8}`.
pub fn ready_for_query(status: u8) -> BytesMut {
    let mut msg = BytesMut::new();
    msg.put_u8(server::READY_FOR_QUERY);
    msg.put_u32(4 + 1);
    msg.put_u8(status);
    msg
}

/// `'1'` ParseComplete `{flags:i32, in_id:16, out_id:16}`.
pub fn parse_complete(flags: i32, in_type_id: [u8; 16], out_type_id: [u8; 16]) -> BytesMut {
    let mut msg = BytesMut::new();
    msg.put_u8(server::PARSE_COMPLETE);
    msg.put_u32(4 + 4 + 16 + 16);
    msg.put_i32(flags);
    msg.put_slice(&in_type_id);
    msg.put_slice(&out_type_id);
    msg
}

/// `'T'` TypeDescribe `{flags:i32, in_id:16, in_len:u16, in_data, out_id:16, out_len:u16, out_data}`.
pub fn type_describe(
    flags: i32,
    in_type_id: [u8; 16],
    in_type_data: &[u8],
    out_type_id: [u8; 16],
    out_type_data: &[u8],
) -> BytesMut {
    let mut msg = BytesMut::new();
    msg.put_u8(server::TYPE_DESCRIBE);
    msg.put_u32(
        4 + 4
            + 16
            + 2
            + in_type_data.len() as u32
            + 16
            + 2
            + out_type_data.len() as u32,
    );
    msg.put_i32(flags);
    msg.put_slice(&in_type_id);
    msg.put_u16(in_type_data.len() as u16);
    msg.put_slice(in_type_data);
    msg.put_slice(&out_type_id);
    msg.put_u16(out_type_data.len() as u16);
    msg.put_slice(out_type_data);
    msg
}

/// `'C'` CommandComplete `{}`.
pub fn command_complete() -> BytesMut {
    let mut msg = BytesMut::new();
    msg.put_u8(server::COMMAND_COMPLETE);
    msg.put_u32(4);
    msg
}

/// `'L'` LegacyResult `{payload:bytes}`.
pub fn legacy_result(payload: &[u8]) -> BytesMut {
    let mut msg = BytesMut::new();
    msg.put_u8(server::LEGACY_RESULT);
    msg.put_u32(4 + payload.len() as u32);
    msg.put_slice(payload);
    msg
}

/// `'E'` ErrorResponse `{code:u32, msg:utf8, (attr_key:u8, attr_val:utf8)*, 0x00}`.
pub fn error_response(code: u32, message: &str, attrs: &[(u8, String)]) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u32(code);
    put_utf8(&mut payload, message);
    for (key, val) in attrs {
        payload.put_u8(*key);
        put_utf8(&mut payload, val);
    }
    payload.put_u8(0);

    let mut msg = BytesMut::new();
    msg.put_u8(server::ERROR_RESPONSE);
    msg.put_u32(4 + payload.len() as u32);
    msg.put(payload);
    msg
}
