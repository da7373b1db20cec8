//! Fixed-size key and value layouts.

use std::cmp::Ordering;

/// Shape and ordering of the keys stored in a tree.
///
/// Keys and values have a fixed size per tree. Leaf items are the key
/// followed by the value; inner items are keys only.
pub trait KeyLayout: Send + Sync {
    /// Key size in bytes.
    fn key_size(&self) -> usize;

    /// Value size in bytes.
    fn value_size(&self) -> usize;

    /// Orders two keys of `key_size` bytes.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Size of a leaf item.
    fn leaf_item_size(&self) -> usize {
        self.key_size() + self.value_size()
    }
}

/// Unsigned 64-bit keys stored big endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U64Keys {
    value_size: usize,
}

impl U64Keys {
    /// Creates a layout for u64 keys with `value_size`-byte values.
    pub fn new(value_size: usize) -> Self {
        Self { value_size }
    }

    /// Encodes a key.
    pub fn encode(key: u64) -> [u8; 8] {
        key.to_be_bytes()
    }

    /// Decodes a key.
    pub fn decode(key: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&key[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl KeyLayout for U64Keys {
    fn key_size(&self) -> usize {
        8
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        Self::decode(a).cmp(&Self::decode(b))
    }
}

/// Opaque byte-string keys ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBytes {
    key_size: usize,
    value_size: usize,
}

impl FixedBytes {
    pub fn new(key_size: usize, value_size: usize) -> Self {
        Self {
            key_size,
            value_size,
        }
    }
}

impl KeyLayout for FixedBytes {
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a[..self.key_size].cmp(&b[..self.key_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_keys_order_numerically() {
        let layout = U64Keys::new(8);
        let a = U64Keys::encode(255);
        let b = U64Keys::encode(256);
        assert_eq!(layout.compare(&a, &b), Ordering::Less);
        assert_eq!(layout.compare(&b, &a), Ordering::Greater);
        assert_eq!(U64Keys::decode(&b), 256);
        assert_eq!(layout.leaf_item_size(), 16);
    }

    #[test]
    fn test_fixed_bytes_ignore_trailing_value() {
        let layout = FixedBytes::new(4, 2);
        let a = [1u8, 2, 3, 4, 9, 9];
        let b = [1u8, 2, 3, 4, 0, 0];
        assert_eq!(layout.compare(&a, &b), Ordering::Equal);
        assert_eq!(layout.compare(&[0, 0, 0, 1], &[0, 0, 1, 0]), Ordering::Less);
    }
}
