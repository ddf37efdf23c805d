//! Message framing (§4.1): turns a byte stream into whole messages on
//! demand, and coalesces outbound messages without ever splitting one
//! across a flush.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Default threshold (§4.1, §5) above which the write buffer flushes
/// eagerly instead of waiting for the handler to finish its reply.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100_000;

struct PendingMessage {
    msg_type: u8,
    /// Snapshot taken at `take_message` time, used to restore the message
    /// verbatim via `put_message`.
    original: Bytes,
    /// Shrinks as fields are read off the front.
    remaining: Bytes,
}

/// Append-only read side of the framing layer.
#[derive(Default)]
pub struct ReadBuffer {
    inbound: BytesMut,
    current: Option<PendingMessage>,
    put_back: Option<(u8, Bytes)>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read off the socket.
    pub fn feed_data(&mut self, data: &[u8]) {
        self.inbound.put_slice(data);
    }

    fn peek_total_len(&self) -> Option<usize> {
        if self.inbound.len() < 5 {
            return None;
        }
        let len = u32::from_be_bytes([
            self.inbound[1],
            self.inbound[2],
            self.inbound[3],
            self.inbound[4],
        ]) as usize;
        let total = 1 + len;
        if self.inbound.len() < total {
            None
        } else {
            Some(total)
        }
    }

    /// Positions the cursor at the next full message if one is buffered.
    pub fn take_message(&mut self) -> bool {
        if self.current.is_some() {
            return true;
        }
        if let Some((msg_type, payload)) = self.put_back.take() {
            self.current = Some(PendingMessage {
                msg_type,
                original: payload.clone(),
                remaining: payload,
            });
            return true;
        }
        let Some(total) = self.peek_total_len() else {
            return false;
        };
        let mut whole = self.inbound.split_to(total);
        let msg_type = whole[0];
        let payload = whole.split_off(5).freeze();
        self.current = Some(PendingMessage {
            msg_type,
            original: payload.clone(),
            remaining: payload,
        });
        true
    }

    /// Peek: true iff the next queued message (without consuming it) has
    /// type `t`. Used to look ahead for a trailing Sync (§9).
    pub fn take_message_type(&mut self, t: u8) -> bool {
        if let Some((msg_type, _)) = &self.put_back {
            return *msg_type == t;
        }
        if let Some(pending) = &self.current {
            return pending.msg_type == t;
        }
        match self.peek_total_len() {
            Some(_) => self.inbound[0] == t,
            None => false,
        }
    }

    /// Current message's type byte. Only meaningful after `take_message`.
    pub fn get_message_type(&self) -> u8 {
        self.current
            .as_ref()
            .map(|p| p.msg_type)
            .unwrap_or_default()
    }

    /// Raw, unframed read of the client's 4-byte protocol version pair
    /// (§4.3): this precedes all message framing on the wire, so it can't
    /// go through `take_message`.
    pub fn take_raw_version(&mut self) -> Option<(i16, i16)> {
        if self.inbound.len() < 4 {
            return None;
        }
        let bytes = self.inbound.split_to(4);
        Some((
            i16::from_be_bytes([bytes[0], bytes[1]]),
            i16::from_be_bytes([bytes[2], bytes[3]]),
        ))
    }

    /// Bytes buffered but not yet claimed by a message, used to know when
    /// the startup version pair has fully arrived (§4.2 NEW -> STARTED).
    pub fn buffered_len(&self) -> usize {
        self.inbound.len()
    }

    fn remaining_mut(&mut self) -> &mut Bytes {
        &mut self
            .current
            .as_mut()
            .expect("read attempted with no message positioned")
            .remaining
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        let buf = self.remaining_mut();
        if buf.remaining() < 1 {
            return Err(ProtocolError::Truncated { need: 1, have: 0 });
        }
        Ok(buf.get_u8())
    }

    pub fn read_int16(&mut self) -> Result<i16, ProtocolError> {
        let buf = self.remaining_mut();
        if buf.remaining() < 2 {
            return Err(ProtocolError::Truncated {
                need: 2,
                have: buf.remaining(),
            });
        }
        Ok(buf.get_i16())
    }

    pub fn read_int32(&mut self) -> Result<i32, ProtocolError> {
        let buf = self.remaining_mut();
        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated {
                need: 4,
                have: buf.remaining(),
            });
        }
        Ok(buf.get_i32())
    }

    pub fn read_int64(&mut self) -> Result<i64, ProtocolError> {
        let buf = self.remaining_mut();
        if buf.remaining() < 8 {
            return Err(ProtocolError::Truncated {
                need: 8,
                have: buf.remaining(),
            });
        }
        Ok(buf.get_i64())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        let buf = self.remaining_mut();
        if buf.remaining() < n {
            return Err(ProtocolError::Truncated {
                need: n,
                have: buf.remaining(),
            });
        }
        Ok(buf.copy_to_bytes(n))
    }

    /// u32-length-prefixed UTF-8 string (§6 default string framing).
    pub fn read_utf8(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_int32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::EmptyRequiredString)
    }

    /// Null-terminated byte string (used for `eql`/`gql` payloads, §6).
    pub fn read_null_str(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let buf = self.remaining_mut();
        let nul = buf
            .as_ref()
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Truncated {
                need: 1,
                have: buf.remaining(),
            })?;
        let s = buf.copy_to_bytes(nul);
        buf.advance(1);
        Ok(s.to_vec())
    }

    /// Remainder of the current message, consumed wholesale.
    pub fn consume_message(&mut self) -> Bytes {
        let buf = self.remaining_mut();
        let n = buf.remaining();
        buf.copy_to_bytes(n)
    }

    /// Finalizes the current message, discarding anything unread.
    pub fn finish_message(&mut self) {
        self.current = None;
    }

    /// Discards the current message without reading it further. Used by
    /// the resync loop (§4.2) to drop client messages up to the next Sync.
    pub fn discard_message(&mut self) {
        self.current = None;
    }

    /// Unreads the current message so a later `take_message` sees it again.
    /// Used when a handler peeked ahead for a trailing Sync and then hit
    /// an error path that must hand the Sync back to the loop.
    pub fn put_message(&mut self) {
        if let Some(pending) = self.current.take() {
            self.put_back = Some((pending.msg_type, pending.original));
        }
    }
}

/// Coalescing write side of the framing layer (§4.1).
pub struct WriteBuffer {
    buf: BytesMut,
    flush_threshold: usize,
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    pub fn with_flush_threshold(flush_threshold: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            flush_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends an already-complete message (built via `crate::protocol::wire`).
    pub fn write_buffer(&mut self, message: BytesMut) {
        self.buf.put(message);
    }

    /// Direct access to the outbound buffer for collaborators that stream
    /// already-framed messages of their own (§4.4 step 4: the backend
    /// streams row/data messages directly onto this connection's write
    /// buffer rather than returning them to be re-queued).
    pub fn raw_buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// `true` once the buffer has grown past the flush threshold and
    /// should be flushed before the handler does anything else (§5).
    pub fn over_threshold(&self) -> bool {
        self.buf.len() >= self.flush_threshold
    }

    pub async fn flush<S>(&mut self, stream: &mut S) -> std::io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        if self.buf.is_empty() {
            return Ok(());
        }
        stream.write_all(&self.buf).await?;
        stream.flush().await?;
        self.buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(msg_type);
        out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn take_message_waits_for_full_payload() {
        let mut rb = ReadBuffer::new();
        let whole = frame(b'Q', b"hi\0");
        rb.feed_data(&whole[..3]);
        assert!(!rb.take_message());
        rb.feed_data(&whole[3..]);
        assert!(rb.take_message());
        assert_eq!(rb.get_message_type(), b'Q');
    }

    #[test]
    fn read_null_str_stops_at_nul_and_advances_past_it() {
        let mut rb = ReadBuffer::new();
        rb.feed_data(&frame(b'Q', b"select 1\0"));
        assert!(rb.take_message());
        let s = rb.read_null_str().unwrap();
        assert_eq!(s, b"select 1");
        assert_eq!(rb.consume_message().len(), 0);
    }

    #[test]
    fn read_utf8_round_trips_length_prefixed_string() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(5u32).to_be_bytes());
        payload.extend_from_slice(b"hello");
        let mut rb = ReadBuffer::new();
        rb.feed_data(&frame(b'0', &payload));
        assert!(rb.take_message());
        assert_eq!(rb.read_utf8().unwrap(), "hello");
    }

    #[test]
    fn put_message_restores_message_for_a_later_take() {
        let mut rb = ReadBuffer::new();
        rb.feed_data(&frame(b'S', b""));
        assert!(rb.take_message());
        rb.put_message();
        assert!(rb.take_message_type(b'S'));
        assert!(rb.take_message());
        assert_eq!(rb.get_message_type(), b'S');
    }

    #[test]
    fn take_message_type_peeks_without_consuming() {
        let mut rb = ReadBuffer::new();
        rb.feed_data(&frame(b'S', b""));
        assert!(rb.take_message_type(b'S'));
        assert!(!rb.take_message_type(b'Q'));
        assert!(rb.take_message());
    }

    #[test]
    fn write_buffer_flush_threshold() {
        let wb = WriteBuffer::with_flush_threshold(10);
        assert!(!wb.over_threshold());
    }

    #[tokio::test]
    async fn write_buffer_flushes_accumulated_messages() {
        let mut wb = WriteBuffer::new();
        wb.write_buffer(crate::protocol::wire::ready_for_query(b'I'));
        let (mut a, mut b) = tokio::io::duplex(64);
        wb.flush(&mut a).await.unwrap();
        drop(a);
        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &[b'Z', 0, 0, 0, 5, b'I']);
    }
}
