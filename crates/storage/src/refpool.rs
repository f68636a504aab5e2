//! Refcounted string / blob pools
//!
//! Two instances of [`RefPool`] back the engine: one for strings, one for
//! variable-length blobs (simple arrays and reference arrays). Values are
//! held behind 64-bit handles that stay stable for the value's lifetime.
//! Writers `inc_ref` when assigning a handle to an object slot and
//! `dec_ref` on the replaced value; storage is reclaimed when the count
//! reaches zero.
//!
//! The pool is sharded by content hash so concurrent writers on different
//! values never contend.

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use velox_core::limits::POOL_SHARDS;

/// The null handle; never allocated to a value.
pub const NULL_HANDLE: u64 = 0;

#[derive(Debug)]
struct Entry {
    bytes: Arc<[u8]>,
    refs: u64,
    hash: u64,
}

#[derive(Debug, Default)]
struct PoolShard {
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
    /// Content hash → candidate slots, for interning.
    interned: FxHashMap<u64, SmallVec<[u32; 2]>>,
}

/// A sharded, refcounted value pool.
#[derive(Debug)]
pub struct RefPool {
    shards: Vec<RwLock<PoolShard>>,
}

impl Default for RefPool {
    fn default() -> Self {
        Self::new()
    }
}

impl RefPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(POOL_SHARDS);
        for _ in 0..POOL_SHARDS {
            shards.push(RwLock::new(PoolShard::default()));
        }
        RefPool { shards }
    }

    fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    fn split(handle: u64) -> (usize, usize) {
        let shard = (handle >> 32) as usize;
        let slot = (handle & 0xFFFF_FFFF) as usize - 1;
        (shard, slot)
    }

    fn join(shard: usize, slot: usize) -> u64 {
        ((shard as u64) << 32) | (slot as u64 + 1)
    }

    /// Store a value with an initial refcount of one.
    ///
    /// With `intern` set, an existing equal value is reused and its count
    /// incremented instead.
    pub fn acquire(&self, bytes: &[u8], intern: bool) -> u64 {
        let hash = Self::hash_bytes(bytes);
        let shard_idx = (hash as usize) % POOL_SHARDS;
        let mut shard = self.shards[shard_idx].write();

        if intern {
            if let Some(slots) = shard.interned.get(&hash) {
                for slot in slots.clone() {
                    let matches = shard.entries[slot as usize]
                        .as_ref()
                        .map(|e| e.bytes.as_ref() == bytes)
                        .unwrap_or(false);
                    if matches {
                        let entry = shard.entries[slot as usize].as_mut().expect("checked");
                        entry.refs += 1;
                        return Self::join(shard_idx, slot as usize);
                    }
                }
            }
        }

        let entry = Entry {
            bytes: Arc::from(bytes),
            refs: 1,
            hash,
        };
        let slot = match shard.free.pop() {
            Some(slot) => {
                shard.entries[slot as usize] = Some(entry);
                slot
            }
            None => {
                shard.entries.push(Some(entry));
                (shard.entries.len() - 1) as u32
            }
        };
        shard.interned.entry(hash).or_default().push(slot);
        Self::join(shard_idx, slot as usize)
    }

    /// Increment a handle's refcount. The null handle is ignored.
    pub fn inc_ref(&self, handle: u64) {
        if handle == NULL_HANDLE {
            return;
        }
        let (shard_idx, slot) = Self::split(handle);
        let mut shard = self.shards[shard_idx].write();
        if let Some(Some(entry)) = shard.entries.get_mut(slot) {
            entry.refs += 1;
        }
    }

    /// Decrement a handle's refcount, reclaiming storage at zero.
    /// The null handle is ignored.
    pub fn dec_ref(&self, handle: u64) {
        if handle == NULL_HANDLE {
            return;
        }
        let (shard_idx, slot) = Self::split(handle);
        let mut shard = self.shards[shard_idx].write();
        let freed = match shard.entries.get_mut(slot) {
            Some(Some(entry)) => {
                debug_assert!(entry.refs > 0, "dec_ref past zero");
                entry.refs -= 1;
                if entry.refs == 0 {
                    Some(entry.hash)
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(hash) = freed {
            shard.entries[slot] = None;
            shard.free.push(slot as u32);
            if let Some(slots) = shard.interned.get_mut(&hash) {
                slots.retain(|s| *s as usize != slot);
                if slots.is_empty() {
                    shard.interned.remove(&hash);
                }
            }
        }
    }

    /// Fetch a value. Returns `None` for the null handle or a freed slot.
    pub fn get(&self, handle: u64) -> Option<Arc<[u8]>> {
        if handle == NULL_HANDLE {
            return None;
        }
        let (shard_idx, slot) = Self::split(handle);
        let shard = self.shards.get(shard_idx)?.read();
        shard
            .entries
            .get(slot)
            .and_then(|e| e.as_ref())
            .map(|e| Arc::clone(&e.bytes))
    }

    /// Current refcount of a handle; zero for freed or null handles.
    pub fn refs(&self, handle: u64) -> u64 {
        if handle == NULL_HANDLE {
            return 0;
        }
        let (shard_idx, slot) = Self::split(handle);
        let shard = match self.shards.get(shard_idx) {
            Some(s) => s.read(),
            None => return 0,
        };
        shard
            .entries
            .get(slot)
            .and_then(|e| e.as_ref())
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    /// Number of live values across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                let shard = s.read();
                shard.entries.iter().filter(|e| e.is_some()).count()
            })
            .sum()
    }

    /// Whether the pool holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pack an id/long array into blob bytes (little endian).
pub fn encode_longs(values: &[i64]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * 8];
    for (i, v) in values.iter().enumerate() {
        LittleEndian::write_i64(&mut out[i * 8..i * 8 + 8], *v);
    }
    out
}

/// Unpack blob bytes into an id/long array.
pub fn decode_longs(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(LittleEndian::read_i64)
        .collect()
}
