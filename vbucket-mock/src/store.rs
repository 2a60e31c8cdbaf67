//! Per-vbucket item stores and the node-facing storage aggregate.
//!
//! Each vbucket guards its own map behind a mutex, so compare-and-mutate
//! sequences (CAS check, CAS assignment, lock transition) are single atomic
//! steps per key while unrelated vbuckets never contend. Expired items read
//! as absent and are evicted by the access that discovers them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::item::{absolute_expiry, Item, ItemLock, DEFAULT_LOCK_SECS, MAX_LOCK_SECS};
use crate::topology::{NodeId, VBucketMap};

/// Ordinary storage-level command failures, mapped to response statuses by
/// the executor layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,
    #[error("key exists or CAS mismatch")]
    KeyExists,
    #[error("item is locked")]
    Locked,
    #[error("item is not locked")]
    NotLocked,
    #[error("not stored")]
    NotStored,
    #[error("value is not a counter")]
    BadDelta,
}

struct VBucketState {
    items: HashMap<Vec<u8>, Item>,
    cas_counter: u64,
}

impl VBucketState {
    fn next_cas(&mut self) -> u64 {
        self.cas_counter += 1;
        self.cas_counter
    }

    /// Looks a key up, evicting it first if this access finds it expired.
    fn live_entry(&mut self, key: &[u8], now: u64) -> Option<&mut Item> {
        if let Some(item) = self.items.get(key) {
            if item.is_expired(now) {
                self.items.remove(key);
                return None;
            }
        }
        self.items.get_mut(key)
    }
}

/// Gate for any mutation of an existing item. Returns whether the mutation
/// is consuming a lock (so the caller clears it). A locked item admits only
/// the lock's own CAS; an unlocked item admits CAS 0 or its current CAS.
fn check_mutation(item: &Item, cas_expected: u64, now: u64) -> Result<bool, StoreError> {
    if item.is_locked(now) {
        if cas_expected != 0 && item.lock_cas(now) == Some(cas_expected) {
            Ok(true)
        } else {
            Err(StoreError::Locked)
        }
    } else if cas_expected == 0 || cas_expected == item.cas {
        Ok(false)
    } else {
        Err(StoreError::KeyExists)
    }
}

/// One vbucket's worth of items. Safe to share across connections.
pub struct VBucketStore {
    state: Mutex<VBucketState>,
}

impl Default for VBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VBucketStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(VBucketState {
                items: HashMap::new(),
                cas_counter: 0,
            }),
        }
    }

    /// Returns a snapshot of the item, or `None` if it was never stored,
    /// was deleted, or lazily expired at this access.
    pub fn get(&self, key: &[u8], now: u64) -> Option<Item> {
        let mut state = self.state.lock().unwrap();
        state.live_entry(key, now).map(|item| item.clone())
    }

    /// Unconditional upsert when `cas_expected` is zero; otherwise the
    /// stored CAS (or the lock CAS, while locked) must match. Returns the
    /// freshly assigned CAS.
    pub fn set(&self, key: &[u8], incoming: Item, cas_expected: u64, now: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.live_entry(key, now) {
            Some(existing) => {
                check_mutation(existing, cas_expected, now)?;
                existing.value = incoming.value;
                existing.flags = incoming.flags;
                existing.expiry = incoming.expiry;
                existing.lock = None;
            }
            None if cas_expected != 0 => return Err(StoreError::KeyNotFound),
            None => {
                let mut item = incoming;
                item.lock = None;
                state.items.insert(key.to_vec(), item);
            }
        }
        let cas = state.next_cas();
        state.items.get_mut(key).expect("entry present above").cas = cas;
        Ok(cas)
    }

    /// Insert-only store; fails when the key is already present.
    pub fn add(&self, key: &[u8], incoming: Item, now: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.live_entry(key, now).is_some() {
            return Err(StoreError::KeyExists);
        }
        let cas = state.next_cas();
        let mut item = incoming;
        item.cas = cas;
        item.lock = None;
        state.items.insert(key.to_vec(), item);
        Ok(cas)
    }

    /// Update-only store; fails when the key is absent.
    pub fn replace(&self, key: &[u8], incoming: Item, cas_expected: u64, now: u64) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(existing) = state.live_entry(key, now) else {
            return Err(StoreError::KeyNotFound);
        };
        check_mutation(existing, cas_expected, now)?;
        existing.value = incoming.value;
        existing.flags = incoming.flags;
        existing.expiry = incoming.expiry;
        existing.lock = None;
        let cas = state.next_cas();
        state.items.get_mut(key).expect("entry checked above").cas = cas;
        Ok(cas)
    }

    /// Append or prepend to an existing value; flags and expiry stay put.
    pub fn concat(
        &self,
        key: &[u8],
        chunk: &[u8],
        prepend: bool,
        cas_expected: u64,
        now: u64,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(existing) = state.live_entry(key, now) else {
            return Err(StoreError::NotStored);
        };
        check_mutation(existing, cas_expected, now)?;
        if prepend {
            let mut joined = Vec::with_capacity(chunk.len() + existing.value.len());
            joined.extend_from_slice(chunk);
            joined.extend_from_slice(&existing.value);
            existing.value = joined;
        } else {
            existing.value.extend_from_slice(chunk);
        }
        existing.lock = None;
        let cas = state.next_cas();
        state.items.get_mut(key).expect("entry checked above").cas = cas;
        Ok(cas)
    }

    /// Same CAS contract as [`VBucketStore::set`]; an absent key is its own
    /// error.
    pub fn delete(&self, key: &[u8], cas_expected: u64, now: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(existing) = state.live_entry(key, now) else {
            return Err(StoreError::KeyNotFound);
        };
        check_mutation(existing, cas_expected, now)?;
        state.items.remove(key);
        Ok(())
    }

    /// Transitions an unlocked item to locked-until-now+duration. The
    /// returned CAS is the lock's own token, distinct from the item's real
    /// CAS; only a mutation presenting it succeeds while the lock holds.
    pub fn lock(&self, key: &[u8], duration_secs: u32, now: u64) -> Result<(Item, u64), StoreError> {
        let duration = match duration_secs {
            0 => DEFAULT_LOCK_SECS,
            d => d.min(MAX_LOCK_SECS),
        };
        let mut state = self.state.lock().unwrap();
        match state.live_entry(key, now) {
            Some(existing) if existing.is_locked(now) => return Err(StoreError::Locked),
            Some(_) => {}
            None => return Err(StoreError::KeyNotFound),
        }
        let lock_cas = state.next_cas();
        let entry = state.items.get_mut(key).expect("entry present above");
        entry.lock = Some(ItemLock {
            cas: lock_cas,
            until: now + u64::from(duration),
        });
        Ok((entry.clone(), lock_cas))
    }

    /// Releases a lock given its token. Absent keys and unlocked items are
    /// reported separately so the executor can answer each correctly.
    pub fn unlock(&self, key: &[u8], cas: u64, now: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(existing) = state.live_entry(key, now) else {
            return Err(StoreError::KeyNotFound);
        };
        if !existing.is_locked(now) {
            return Err(StoreError::NotLocked);
        }
        if existing.lock_cas(now) != Some(cas) {
            return Err(StoreError::Locked);
        }
        existing.lock = None;
        Ok(())
    }

    /// Updates the expiry without touching value, flags or CAS. Locked
    /// items refuse the update.
    pub fn touch(&self, key: &[u8], expiry: u64, now: u64) -> Result<Item, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(existing) = state.live_entry(key, now) else {
            return Err(StoreError::KeyNotFound);
        };
        if existing.is_locked(now) {
            return Err(StoreError::Locked);
        }
        existing.expiry = expiry;
        Ok(existing.clone())
    }

    /// Increments or decrements an ASCII-decimal counter value. A missing
    /// key seeds `initial` unless `create_expiry` is `None` (the protocol's
    /// 0xffffffff sentinel). Decrements saturate at zero; increments wrap.
    pub fn counter(
        &self,
        key: &[u8],
        delta: u64,
        initial: u64,
        create_expiry: Option<u32>,
        decrement: bool,
        now: u64,
    ) -> Result<(u64, u64), StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.live_entry(key, now) {
            Some(existing) => {
                if existing.is_locked(now) {
                    return Err(StoreError::Locked);
                }
                let current: u64 = std::str::from_utf8(&existing.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or(StoreError::BadDelta)?;
                let next = if decrement {
                    current.saturating_sub(delta)
                } else {
                    current.wrapping_add(delta)
                };
                existing.value = next.to_string().into_bytes();
                let cas = state.next_cas();
                state.items.get_mut(key).expect("entry checked above").cas = cas;
                Ok((next, cas))
            }
            None => {
                let Some(expiry) = create_expiry else {
                    return Err(StoreError::KeyNotFound);
                };
                let mut item = Item::new(initial.to_string().into_bytes(), 0, absolute_expiry(expiry, now));
                let cas = state.next_cas();
                item.cas = cas;
                state.items.insert(key.to_vec(), item);
                Ok((initial, cas))
            }
        }
    }

    /// Any live item from this vbucket, or `None` when it holds nothing.
    pub fn random_item(&self, now: u64) -> Option<(Vec<u8>, Item)> {
        let state = self.state.lock().unwrap();
        let live: Vec<_> = state
            .items
            .iter()
            .filter(|(_, item)| !item.is_expired(now))
            .collect();
        if live.is_empty() {
            return None;
        }
        let (key, item) = live[rand::thread_rng().gen_range(0..live.len())];
        Some((key.clone(), item.clone()))
    }

    pub fn flush(&self) {
        self.state.lock().unwrap().items.clear();
    }

    pub fn len(&self, now: u64) -> usize {
        let state = self.state.lock().unwrap();
        state.items.values().filter(|i| !i.is_expired(now)).count()
    }

    pub fn is_empty(&self, now: u64) -> bool {
        self.len(now) == 0
    }
}

/// All vbuckets of one bucket, shared by every server node that serves it,
/// plus the topology that decides which node may touch which vbucket.
pub struct Storage {
    stores: Vec<VBucketStore>,
    topology: Arc<VBucketMap>,
}

impl Storage {
    pub fn new(topology: Arc<VBucketMap>) -> Self {
        let stores = (0..topology.num_vbuckets())
            .map(|_| VBucketStore::new())
            .collect();
        Self { stores, topology }
    }

    pub fn topology(&self) -> &VBucketMap {
        &self.topology
    }

    pub fn vbucket(&self, vbucket: u16) -> Option<&VBucketStore> {
        self.stores.get(vbucket as usize)
    }

    /// Clears every vbucket. All-or-nothing from the caller's perspective;
    /// individual vbuckets are cleared under their own locks.
    pub fn flush_all(&self) {
        for store in &self.stores {
            store.flush();
        }
    }

    pub fn curr_items(&self, now: u64) -> usize {
        self.stores.iter().map(|s| s.len(now)).sum()
    }

    /// A random live item from the vbuckets this node masters.
    pub fn random_item(&self, node: NodeId, now: u64) -> Option<(u16, Vec<u8>, Item)> {
        let num = self.stores.len();
        if num == 0 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..num);
        for offset in 0..num {
            let vb = ((start + offset) % num) as u16;
            if !self.topology.is_master(node, vb) {
                continue;
            }
            if let Some((key, item)) = self.stores[vb as usize].random_item(now) {
                return Some((vb, key, item));
            }
        }
        None
    }
}
