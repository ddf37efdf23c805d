//! Bind-argument recoder (§4.4): reframes the client's bind block into the
//! shape the SQL backend expects. Bit-exact per §8 invariant 8.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// `u32 len || u32 n || body` -> `0x00010001 || u16 n || body || 0x00010001`.
pub fn recode_bind_args(input: &[u8]) -> Result<BytesMut, ProtocolError> {
    let mut cursor = input;
    if cursor.remaining() < 8 {
        return Err(ProtocolError::Truncated {
            need: 8,
            have: cursor.remaining(),
        });
    }
    let _len = cursor.get_u32();
    let argsnum = cursor.get_u32();
    let body = cursor.chunk();

    let mut out = BytesMut::with_capacity(4 + 2 + body.len() + 4);
    out.put_u32(0x0001_0001);
    out.put_u16(argsnum as u16);
    out.put_slice(body);
    out.put_u32(0x0001_0001);
    Ok(out)
}
