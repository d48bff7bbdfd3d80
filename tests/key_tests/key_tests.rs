//! Tests for keys, values, entry encodings and fingerprint search
//!
//! These tests verify:
//! - Length limits on keys and values
//! - Key ordering, including the MIN/MAX sentinels
//! - Word encodings of entries, fences and log records
//! - SIMD and scalar fingerprint matching agree

use tierkv::key::{Entry, Key, Value, MAX_KEY_LEN, MAX_VALUE_LEN};
use tierkv::log::{LogId, LogRecord, OpKind, RECORD_WORDS};
use tierkv::search::{match_fingerprints, match_fingerprints_scalar, set_fingerprint, unpack_fingerprints};
use tierkv::TierError;

// =============================================================================
// Key & Value Tests
// =============================================================================

#[test]
fn test_key_length_limit() {
    assert!(Key::new(&[b'k'; MAX_KEY_LEN]).is_ok());
    let err = Key::new(&[b'k'; MAX_KEY_LEN + 1]).unwrap_err();
    assert!(matches!(err, TierError::KeyTooLong { len: 25, max: 24 }));
}

#[test]
fn test_value_length_limit() {
    assert!(Value::new(&[b'v'; MAX_VALUE_LEN]).is_ok());
    let err = Value::new(&[b'v'; MAX_VALUE_LEN + 1]).unwrap_err();
    assert!(matches!(err, TierError::ValueTooLong { len: 33, max: 32 }));
    assert!(Value::EMPTY.is_empty());
}

#[test]
fn test_key_ordering() {
    let a = Key::new(b"a").unwrap();
    let ab = Key::new(b"ab").unwrap();
    let b = Key::new(b"b").unwrap();
    let full = Key::new(&[0xFF; MAX_KEY_LEN]).unwrap();

    assert!(Key::MIN < a);
    assert!(a < ab);
    assert!(ab < b);
    assert!(b < full);
    assert!(full < Key::MAX, "MAX must sort above every real key");
    assert_eq!(Key::new(b"").unwrap(), Key::MIN);
}

#[test]
fn test_key_from_u64_orders_numerically() {
    let keys: Vec<Key> = [0u64, 9, 10, 255, 256, u64::MAX].iter().map(|&n| Key::from_u64(n)).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(Key::from_u64(42).to_u64(), Some(42));
    assert_eq!(Key::new(b"short").unwrap().to_u64(), None);
}

#[test]
fn test_fingerprint_never_reserved() {
    for n in 0..10_000u64 {
        assert_ne!(Key::from_u64(n).fingerprint(), 0xFF);
    }
}

// =============================================================================
// Encoding Tests
// =============================================================================

#[test]
fn test_entry_words() {
    let entry = Entry::new(Key::new(b"user:42").unwrap(), Value::new(b"alice").unwrap());
    let decoded = Entry::from_words(&entry.to_words());
    assert_eq!(decoded, entry);
    assert_eq!(decoded.key.as_bytes(), b"user:42");
    assert_eq!(decoded.value.as_bytes(), b"alice");
}

#[test]
fn test_entry_words_clamp_garbage_lengths() {
    let mut words = Entry::new(Key::new(b"k").unwrap(), Value::EMPTY).to_words();
    words[3] = u64::MAX;
    let decoded = Entry::from_words(&words);
    assert!(decoded.key.as_bytes().len() <= MAX_KEY_LEN);
    assert!(decoded.value.len() <= MAX_VALUE_LEN);
}

#[test]
fn test_fence_words_keep_sentinels() {
    assert_eq!(Key::from_fence_words(&Key::MIN.to_fence_words()), Key::MIN);
    assert_eq!(Key::from_fence_words(&Key::MAX.to_fence_words()), Key::MAX);
    let k = Key::new(b"fence").unwrap();
    assert_eq!(Key::from_fence_words(&k.to_fence_words()), k);
}

#[test]
fn test_log_record_tag() {
    let record = LogRecord {
        key: Key::new(b"k1").unwrap(),
        value: Value::EMPTY,
        stamp: 77,
        kind: OpKind::Remove,
        flip: true,
    };
    let words = record.to_words();
    assert_eq!(words.len(), RECORD_WORDS);
    let decoded = LogRecord::from_words(&words).unwrap();
    assert_eq!(decoded, record);
    assert!(decoded.is_remove());
}

#[test]
fn test_zeroed_slot_is_not_a_record() {
    assert!(LogRecord::from_words(&[0u64; RECORD_WORDS]).is_none());
}

#[test]
fn test_log_id_packing() {
    let id = LogId::new(7, 123_456);
    assert_eq!(id.lane(), 7);
    assert_eq!(id.pos(), 123_456);
    assert_eq!(LogId::from_raw(id.raw()), id);
}

// =============================================================================
// Fingerprint Search Tests
// =============================================================================

#[test]
fn test_match_fingerprints_agrees_with_scalar() {
    let fps: Vec<u8> = (0..40u8).map(|i| i.wrapping_mul(7) % 13).collect();
    for probe in 0..14u8 {
        assert_eq!(
            match_fingerprints(&fps, probe),
            match_fingerprints_scalar(&fps, probe),
            "probe {}",
            probe
        );
    }
}

#[test]
fn test_match_fingerprints_short_slice() {
    let fps = [3u8, 1, 3];
    assert_eq!(match_fingerprints(&fps, 3), 0b101);
    assert_eq!(match_fingerprints(&fps, 9), 0);
}

#[test]
fn test_set_and_unpack_fingerprints() {
    let mut words = [u64::MAX; 2];
    words[1] = set_fingerprint(words[1], 10, 0x42);
    let mut out = [0u8; 16];
    unpack_fingerprints(&words, &mut out);
    assert_eq!(out[10], 0x42);
    assert_eq!(out[9], 0xFF);
    assert_eq!(out[11], 0xFF);
}
