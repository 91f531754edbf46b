//! Expiry header stored in front of entry payloads
//!
//! An entry written with a TTL starts with the ASCII header
//! `TTTTTTTTTTTTT-S ` (13-digit zero-padded creation time in milliseconds,
//! `-`, TTL in seconds, one space) followed directly by the payload. Entries
//! without a TTL are stored as the bare payload.
//!
//! Detection is structural: a bare payload that happens to look like a header
//! is treated as one.

use chrono::Utc;

const TIMESTAMP_WIDTH: usize = 13;
const DASH: u8 = b'-';
const SEPARATOR: u8 = b' ';

/// Longest header `encode` produces: timestamp, dash, a `u64` TTL, separator
pub const MAX_HEADER_LEN: usize = TIMESTAMP_WIDTH + 1 + 20 + 1;

/// Decoded expiry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlHeader {
    /// Creation time in milliseconds since the Unix epoch
    pub saved_at_ms: i64,
    pub ttl_secs: u64,
}

impl TtlHeader {
    pub fn expires_at_ms(&self) -> i64 {
        let ttl_ms = i64::try_from(self.ttl_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        self.saved_at_ms.saturating_add(ttl_ms)
    }
}

/// Prefix `payload` with an expiry header stamped with the current time.
/// Without a TTL the payload is returned as is.
pub fn encode(payload: &[u8], ttl_secs: Option<u64>) -> Vec<u8> {
    encode_at(payload, ttl_secs, Utc::now().timestamp_millis())
}

pub fn encode_at(payload: &[u8], ttl_secs: Option<u64>, now_ms: i64) -> Vec<u8> {
    let Some(ttl_secs) = ttl_secs else {
        return payload.to_vec();
    };

    let header = format!("{:013}-{}{}", now_ms, ttl_secs, SEPARATOR as char);
    let mut data = Vec::with_capacity(header.len() + payload.len());
    data.extend_from_slice(header.as_bytes());
    data.extend_from_slice(payload);
    data
}

fn separator_index(data: &[u8]) -> Option<usize> {
    data.iter().position(|&b| b == SEPARATOR)
}

/// Whether `data` is shaped like a header-prefixed entry
pub fn has_header(data: &[u8]) -> bool {
    data.len() > TIMESTAMP_WIDTH + 2
        && data[TIMESTAMP_WIDTH] == DASH
        && separator_index(data).is_some_and(|i| i > TIMESTAMP_WIDTH + 1)
}

/// Length of the header including the separator, if one is present
fn header_len(data: &[u8]) -> Option<usize> {
    if !has_header(data) {
        return None;
    }
    separator_index(data).map(|i| i + 1)
}

/// Decode the header. Returns `None` when there is no header or its numeric
/// fields don't parse.
pub fn parse_header(data: &[u8]) -> Option<TtlHeader> {
    let end = header_len(data)? - 1;
    let saved_at_ms = std::str::from_utf8(&data[..TIMESTAMP_WIDTH])
        .ok()?
        .parse::<i64>()
        .ok()?;
    let ttl_secs = std::str::from_utf8(&data[TIMESTAMP_WIDTH + 1..end])
        .ok()?
        .parse::<u64>()
        .ok()?;
    Some(TtlHeader {
        saved_at_ms,
        ttl_secs,
    })
}

pub fn is_expired(data: &[u8]) -> bool {
    is_expired_at(data, Utc::now().timestamp_millis())
}

pub fn is_expired_at(data: &[u8], now_ms: i64) -> bool {
    parse_header(data).is_some_and(|header| now_ms > header.expires_at_ms())
}

/// Payload without the header
pub fn strip_header(data: &[u8]) -> &[u8] {
    match header_len(data) {
        Some(len) => &data[len..],
        None => data,
    }
}

/// Owned variant of [`strip_header`] that reuses the buffer
pub fn into_payload(mut data: Vec<u8>) -> Vec<u8> {
    if let Some(len) = header_len(&data) {
        data.drain(..len);
    }
    data
}
