//! Fixed 24-byte record for `i64` payload streams.
//!
//! Layout (little-endian):
//!
//! ```text
//! [0..8)   sync_time   (start, or end for an End-edge)
//! [8..16)  other_time  (end, or start for an End-edge)
//! [16..24) payload
//! ```
//!
//! The kind is not stored; it is recovered from `other_time`.

use crate::error::WireError;
use crate::event::{EventKind, StreamEvent, INFINITY, PUNCTUATION_OTHER_TIME};

/// Size of one record.
pub const RECORD_LEN: usize = 24;

/// Encodes one event. Punctuations carry a zero payload.
pub fn encode(event: &StreamEvent<i64>) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..8].copy_from_slice(&event.sync_time.to_le_bytes());
    buf[8..16].copy_from_slice(&event.other_time.to_le_bytes());
    buf[16..24].copy_from_slice(&event.payload.unwrap_or(0).to_le_bytes());
    buf
}

/// Decodes one record, inferring the event kind.
pub fn decode(bytes: &[u8]) -> Result<StreamEvent<i64>, WireError> {
    if bytes.len() != RECORD_LEN {
        return Err(WireError::BadLength {
            expected: RECORD_LEN,
            actual: bytes.len(),
        });
    }
    let sync_time = read_i64(&bytes[0..8]);
    let other_time = read_i64(&bytes[8..16]);
    let payload = read_i64(&bytes[16..24]);

    let event = match inferred_kind(sync_time, other_time) {
        EventKind::Punctuation => StreamEvent::punctuation(sync_time),
        EventKind::Start => StreamEvent::start(sync_time, payload),
        EventKind::End => StreamEvent::end(sync_time, other_time, payload),
        EventKind::Point => StreamEvent::point(sync_time, payload),
        EventKind::Interval => StreamEvent::interval(sync_time, other_time, payload),
    };
    event.validate()?;
    Ok(event)
}

/// Encodes a batch of events back to back.
pub fn encode_batch<'a>(events: impl IntoIterator<Item = &'a StreamEvent<i64>>) -> Vec<u8> {
    let events = events.into_iter();
    let mut out = Vec::with_capacity(events.size_hint().0 * RECORD_LEN);
    for event in events {
        out.extend_from_slice(&encode(event));
    }
    out
}

/// Decodes a buffer of concatenated records.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<StreamEvent<i64>>, WireError> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(WireError::BadLength {
            expected: (bytes.len() / RECORD_LEN + 1) * RECORD_LEN,
            actual: bytes.len(),
        });
    }
    bytes.chunks_exact(RECORD_LEN).map(decode).collect()
}

/// Kind a record with the given times decodes to.
pub fn inferred_kind(sync_time: i64, other_time: i64) -> EventKind {
    if other_time == PUNCTUATION_OTHER_TIME {
        EventKind::Punctuation
    } else if other_time == INFINITY {
        EventKind::Start
    } else if other_time <= sync_time {
        EventKind::End
    } else if Some(other_time) == sync_time.checked_add(1) {
        EventKind::Point
    } else {
        EventKind::Interval
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    i64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_edge_layout() {
        let bytes = encode(&StreamEvent::end(50, 10, 7));
        assert_eq!(&bytes[0..8], &50i64.to_le_bytes());
        assert_eq!(&bytes[8..16], &10i64.to_le_bytes());
        assert_eq!(&bytes[16..24], &7i64.to_le_bytes());
    }

    #[test]
    fn test_kinds_survive_decode() {
        let events = [
            StreamEvent::point(3, 1),
            StreamEvent::interval(3, 9, 2),
            StreamEvent::start(4, 3),
            StreamEvent::end(9, 4, 3),
            StreamEvent::punctuation(12),
        ];
        for event in &events {
            assert_eq!(&decode(&encode(event)).unwrap(), event);
        }
    }

    #[test]
    fn test_short_record_rejected() {
        assert_eq!(
            decode(&[0u8; 10]),
            Err(WireError::BadLength {
                expected: 24,
                actual: 10
            })
        );
    }

    #[test]
    fn test_batch_length_must_align() {
        assert!(decode_batch(&[0u8; 30]).is_err());
    }

    #[test]
    fn test_inferred_kind_matches_constructors() {
        assert_eq!(inferred_kind(5, 6), EventKind::Point);
        assert_eq!(inferred_kind(5, 5), EventKind::End);
        assert_eq!(inferred_kind(5, INFINITY), EventKind::Start);
    }
}
