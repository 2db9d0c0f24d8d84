//! Wire codec for replicated log entries.
//!
//! The layout is a cross-node commitment, not an implementation detail:
//! `op(1) | keyLen(4, LE) | key | valLen(4, LE) | value`. Snapshots reuse
//! the same records, so a snapshot stream is just concatenated SET entries.

use crate::error::{Error, Result};

/// Tag for entries that write a key.
pub const SET_OPERATION: u8 = 0;

/// Tag for entries that read a key through the log (strong-consistency
/// reads only; never mutates the cache on any node).
pub const GET_OPERATION: u8 = 1;

const HEADER_LEN: usize = 9;

/// Serializes one log entry. Zero-length keys and values are valid.
pub fn encode(op: u8, key: &str, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + key.len() + value.len());
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Parses the bytes produced by [`encode`] back into `(op, key, value)`.
pub fn decode(buf: &[u8]) -> Result<(u8, &str, &[u8])> {
    if buf.len() < HEADER_LEN {
        return Err(Error::MalformedEntry(format!(
            "buffer too short: {} bytes",
            buf.len()
        )));
    }

    let op = buf[0];
    if op != SET_OPERATION && op != GET_OPERATION {
        return Err(Error::MalformedEntry(format!("unknown operation tag {op}")));
    }

    let key_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if buf.len() < HEADER_LEN + key_len {
        return Err(Error::MalformedEntry(format!(
            "key length {key_len} overruns buffer"
        )));
    }
    let key = std::str::from_utf8(&buf[5..5 + key_len])
        .map_err(|_| Error::MalformedEntry("key is not valid utf-8".to_string()))?;

    let val_off = 5 + key_len;
    let val_len = u32::from_le_bytes([
        buf[val_off],
        buf[val_off + 1],
        buf[val_off + 2],
        buf[val_off + 3],
    ]) as usize;
    let val_start = val_off + 4;
    if buf.len() < val_start + val_len {
        return Err(Error::MalformedEntry(format!(
            "value length {val_len} overruns buffer"
        )));
    }

    Ok((op, key, &buf[val_start..val_start + val_len]))
}

/// Number of bytes [`encode`] produces for this key and value.
pub fn encoded_len(key: &str, value: &[u8]) -> usize {
    HEADER_LEN + key.len() + value.len()
}
