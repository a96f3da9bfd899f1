//! Wrapped-entry codec.
//!
//! On-arena layout, little-endian:
//!
//! ```text
//! [0..8)   expiry, epoch seconds (0 = never expires)
//! [8..16)  key hash
//! [16..18) key length
//! [18..18+klen) key bytes
//! [18+klen..)   value bytes
//! ```

/// Expiry value meaning the entry never expires.
pub const NO_EXPIRY: u64 = 0;

/// Fixed portion of a wrapped entry preceding the key bytes.
pub(crate) const HEADERS_SIZE: usize = 18;

const EXPIRY_OFFSET: usize = 0;
const HASH_OFFSET: usize = 8;
const KEY_LEN_OFFSET: usize = 16;
const KEY_OFFSET: usize = 18;

/// Pack an entry into `buf`, reusing its allocation. Returns the packed length.
pub(crate) fn wrap(expiry: u64, hash: u64, key: &str, value: &[u8], buf: &mut Vec<u8>) -> usize {
    let total = HEADERS_SIZE + key.len() + value.len();
    buf.clear();
    buf.reserve(total);
    buf.extend_from_slice(&expiry.to_le_bytes());
    buf.extend_from_slice(&hash.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);
    total
}

pub(crate) fn expiry(wrapped: &[u8]) -> u64 {
    u64::from_le_bytes(wrapped[EXPIRY_OFFSET..EXPIRY_OFFSET + 8].try_into().unwrap())
}

pub(crate) fn hash(wrapped: &[u8]) -> u64 {
    u64::from_le_bytes(wrapped[HASH_OFFSET..HASH_OFFSET + 8].try_into().unwrap())
}

pub(crate) fn key(wrapped: &[u8]) -> &str {
    let len = key_len(wrapped);
    std::str::from_utf8(&wrapped[KEY_OFFSET..KEY_OFFSET + len]).unwrap_or("")
}

pub(crate) fn value(wrapped: &[u8]) -> &[u8] {
    &wrapped[KEY_OFFSET + key_len(wrapped)..]
}

/// Zero the key length so stale index scans see an invalidated wrapper.
pub(crate) fn reset_key(wrapped: &mut [u8]) {
    wrapped[KEY_LEN_OFFSET] = 0;
    wrapped[KEY_LEN_OFFSET + 1] = 0;
}

fn key_len(wrapped: &[u8]) -> usize {
    u16::from_le_bytes(wrapped[KEY_LEN_OFFSET..KEY_LEN_OFFSET + 2].try_into().unwrap()) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_read_back() {
        let mut buf = Vec::new();
        let n = wrap(1234, 0xdead_beef, "alpha", b"payload", &mut buf);
        assert_eq!(n, HEADERS_SIZE + 5 + 7);
        let wrapped = &buf[..n];

        assert_eq!(expiry(wrapped), 1234);
        assert_eq!(hash(wrapped), 0xdead_beef);
        assert_eq!(key(wrapped), "alpha");
        assert_eq!(value(wrapped), b"payload");
    }

    #[test]
    fn test_empty_value() {
        let mut buf = Vec::new();
        let n = wrap(NO_EXPIRY, 7, "k", b"", &mut buf);
        assert_eq!(key(&buf[..n]), "k");
        assert!(value(&buf[..n]).is_empty());
    }

    #[test]
    fn test_reset_key_invalidates() {
        let mut buf = Vec::new();
        let n = wrap(0, 1, "gone", b"v", &mut buf);
        reset_key(&mut buf[..n]);
        assert_eq!(key(&buf[..n]), "");
        // The value view shifts, which is why invalidated wrappers are only
        // ever inspected through the key.
        assert_eq!(key_len(&buf[..n]), 0);
    }

    #[test]
    fn test_buffer_reuse() {
        let mut buf = Vec::new();
        wrap(1, 2, "first-key", b"first-value", &mut buf);
        let n = wrap(3, 4, "2nd", b"xy", &mut buf);
        assert_eq!(key(&buf[..n]), "2nd");
        assert_eq!(value(&buf[..n]), b"xy");
    }
}
