//! Ordered key-value store with column families.
//!
//! Every key starts with a one-byte column family tag followed by a
//! big-endian composite key, so a prefix scan over `cf | distribution_key`
//! visits all partitions of one distribution contiguously and in order.
//!
//! ```text
//! ┌────┬──────────────────────────────┐
//! │ cf │ composite key (big-endian)   │
//! └────┴──────────────────────────────┘
//! ```

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnFamily {
    /// distribution_key → DistributionRecord
    Distribution = 1,
    /// (distribution_key, partition) → ()
    Pending = 2,
    /// (distribution_key, partition) → ()
    Retriable = 3,
    /// (queue, partition, sequence) → distribution_key
    Queued = 4,
    /// (queue, partition, distribution_key) → sequence
    QueuedIndex = 5,
    /// (queue, continuation_key) → DistributionRecord
    Continuation = 6,
    /// single-byte keys for counters
    Meta = 7,
}

/// Builds `cf | parts...` keys.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    buf: Vec<u8>,
}

impl KeyBuilder {
    pub fn new(cf: ColumnFamily) -> Self {
        let mut buf = Vec::with_capacity(24);
        buf.push(cf as u8);
        KeyBuilder { buf }
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Length-prefixed so that no queue name is a prefix of another's keys.
    pub fn str(mut self, value: &str) -> Self {
        debug_assert!(value.len() <= u16::MAX as usize, "Precondition: name fits u16 length");
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads the fixed-width parts back out of a key built by `KeyBuilder`.
#[derive(Debug)]
pub struct KeyReader<'a> {
    buf: &'a [u8],
}

impl<'a> KeyReader<'a> {
    /// Skips the column family tag.
    pub fn new(key: &'a [u8]) -> Self {
        KeyReader {
            buf: key.get(1..).unwrap_or(&[]),
        }
    }

    pub fn u32(&mut self) -> Option<u32> {
        let (head, rest) = self.buf.split_first_chunk::<4>()?;
        self.buf = rest;
        Some(u32::from_be_bytes(*head))
    }

    pub fn u64(&mut self) -> Option<u64> {
        let (head, rest) = self.buf.split_first_chunk::<8>()?;
        self.buf = rest;
        Some(u64::from_be_bytes(*head))
    }

    pub fn str(&mut self) -> Option<&'a str> {
        let (len, rest) = self.buf.split_first_chunk::<2>()?;
        let len = u16::from_be_bytes(*len) as usize;
        if rest.len() < len {
            return None;
        }
        let (s, rest) = rest.split_at(len);
        self.buf = rest;
        std::str::from_utf8(s).ok()
    }
}

/// Ordered byte-key store. Iteration order is lexicographic on keys.
pub trait KvStore: Send + 'static {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);
    fn get(&self, key: &[u8]) -> Option<&[u8]>;
    /// Returns whether the key existed.
    fn delete(&mut self, key: &[u8]) -> bool;

    fn exists(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Visit entries whose key starts with `prefix`, in key order, until the
    /// visitor returns false.
    fn scan_prefix(&self, prefix: &[u8], visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryKvStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.entries.remove(key).is_some()
    }

    fn scan_prefix(&self, prefix: &[u8], visitor: &mut dyn FnMut(&[u8], &[u8]) -> bool) {
        for (key, value) in self.entries.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) || !visitor(key, value) {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_scan_is_ordered_and_bounded() {
        let mut kv = InMemoryKvStore::new();
        for (key, partition) in [(7u64, 3u32), (7, 1), (8, 1), (6, 2), (7, 2)] {
            kv.put(
                KeyBuilder::new(ColumnFamily::Pending).u64(key).u32(partition).build(),
                vec![],
            );
        }
        kv.put(KeyBuilder::new(ColumnFamily::Retriable).u64(7).u32(9).build(), vec![]);

        let prefix = KeyBuilder::new(ColumnFamily::Pending).u64(7).build();
        let mut seen = Vec::new();
        kv.scan_prefix(&prefix, &mut |key, _| {
            let mut reader = KeyReader::new(key);
            seen.push((reader.u64().unwrap(), reader.u32().unwrap()));
            true
        });
        assert_eq!(seen, vec![(7, 1), (7, 2), (7, 3)]);
    }

    #[test]
    fn test_scan_stops_when_visitor_returns_false() {
        let mut kv = InMemoryKvStore::new();
        for i in 0..10u64 {
            kv.put(KeyBuilder::new(ColumnFamily::Distribution).u64(i).build(), vec![]);
        }
        let mut count = 0;
        kv.scan_prefix(&[ColumnFamily::Distribution as u8], &mut |_, _| {
            count += 1;
            count < 3
        });
        assert_eq!(count, 3);
    }

    #[test]
    fn test_string_parts_do_not_collide() {
        let a = KeyBuilder::new(ColumnFamily::Queued).str("ab").u32(1).build();
        let b = KeyBuilder::new(ColumnFamily::Queued).str("a").build();
        assert!(!a.starts_with(&b));

        let mut reader = KeyReader::new(&a);
        assert_eq!(reader.str(), Some("ab"));
        assert_eq!(reader.u32(), Some(1));
        assert_eq!(reader.u32(), None);
    }

    #[test]
    fn test_delete_reports_presence() {
        let mut kv = InMemoryKvStore::new();
        kv.put(vec![1, 2], vec![3]);
        assert!(kv.exists(&[1, 2]));
        assert!(kv.delete(&[1, 2]));
        assert!(!kv.delete(&[1, 2]));
        assert!(kv.is_empty());
    }
}
