//! Minimal self-describing row encoding used by `SqlBackend::simple_query`
//! when `ignore_data` is false: the core needs to read some returned
//! columns back out rather than just forward them to the client (the
//! legacy graphql payload column, §4.4; the `_edgecon_state`/
//! `_edgecon_current_savepoint` recovery rows, §4.5). Rows are written
//! back-to-back with no row-count prefix: `u32 column_count`, then per
//! column `u32 len` (`u32::MAX` means SQL NULL) followed by `len` bytes,
//! repeated until the buffer is exhausted.

use bytes::{Buf, Bytes};

pub const NULL_LEN: u32 = u32::MAX;

/// Decodes every row in `buf` in order.
pub fn decode_rows(mut buf: &[u8]) -> Vec<Vec<Option<Bytes>>> {
    let mut rows = Vec::new();
    while buf.remaining() >= 4 {
        let column_count = buf.get_u32();
        let mut row = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            if buf.remaining() < 4 {
                break;
            }
            let len = buf.get_u32();
            if len == NULL_LEN {
                row.push(None);
                continue;
            }
            if buf.remaining() < len as usize {
                break;
            }
            row.push(Some(buf.copy_to_bytes(len as usize)));
        }
        rows.push(row);
    }
    rows
}

/// Decodes the first row's first column, if any row was written (§4.4
/// legacy graphql path). `Some(None)` means a row was present but the
/// column (or the row itself) was empty/NULL; `None` means no row was
/// written at all.
pub fn first_column(buf: &[u8]) -> Option<Option<Bytes>> {
    let mut rows = decode_rows(buf);
    if rows.is_empty() {
        return None;
    }
    let mut row = rows.remove(0);
    if row.is_empty() {
        return Some(None);
    }
    Some(row.remove(0))
}
