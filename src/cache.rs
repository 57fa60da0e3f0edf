// Copyright 2025 pincache Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{hash::BuildHasher, ops::Deref, ptr::NonNull, sync::Arc};

use ahash::RandomState;
use crossbeam::queue::ArrayQueue;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    dlist::Dlist,
    handle::{Deleter, Handle},
    indexer::Indexer,
    Value,
};

/// log2 of the default shard count.
const DEFAULT_SHARD_BITS: u32 = 4;
const DEFAULT_OBJECT_POOL_CAPACITY: usize = 64;

/// Entries whose last reference dropped inside a shard operation, staged so
/// their deleters run after the shard mutex is released.
type Victims<T> = Vec<(Box<[u8]>, T, Deleter<T>)>;

/// Sharded cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total charge budget, split evenly across shards. `0` disables caching:
    /// inserts still hand out pinned entries, but nothing is retained.
    pub capacity: usize,
    /// log2 of the shard count.
    pub shard_bits: u32,
    /// Capacity of the shared pool recycling entry allocations.
    pub object_pool_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            shard_bits: DEFAULT_SHARD_BITS,
            object_pool_capacity: DEFAULT_OBJECT_POOL_CAPACITY,
        }
    }
}

struct SharedState<T>
where
    T: Value,
{
    /// Recycled entry allocations, shared by all shards.
    object_pool: ArrayQueue<Box<Handle<T>>>,
}

/// One cache partition.
///
/// A shard keeps its members in two intrusive lists: `lru` holds the entries
/// with no outstanding pins in recency order, `in_use` holds the pinned ones
/// in no particular order. An entry is on exactly one of them while it is a
/// cache member and on neither once displaced, erased, pruned, or evicted.
/// Eviction only ever consumes the cold end of `lru`, so pinned entries may
/// hold usage above capacity indefinitely.
///
/// The owning [`Cache`] wraps every shard in a mutex; all methods here assume
/// that mutex is held.
struct LruShard<T>
where
    T: Value,
{
    capacity: usize,
    usage: usize,

    lru: Dlist<Handle<T>>,
    in_use: Dlist<Handle<T>>,

    indexer: Indexer<T>,

    state: Arc<SharedState<T>>,
}

impl<T> LruShard<T>
where
    T: Value,
{
    fn new(capacity: usize, state: Arc<SharedState<T>>) -> Self {
        Self {
            capacity,
            usage: 0,
            lru: Dlist::new(),
            in_use: Dlist::new(),
            indexer: Indexer::new(),
            state,
        }
    }

    /// Insert a new entry and pin it for the caller.
    ///
    /// An existing entry under the same key is displaced; it stays readable
    /// through outstanding pins but is no longer found by lookups.
    unsafe fn insert(
        &mut self,
        hash: u32,
        key: Box<[u8]>,
        value: T,
        charge: usize,
        deleter: Deleter<T>,
        victims: &mut Victims<T>,
    ) -> NonNull<Handle<T>> {
        let mut handle = self
            .state
            .object_pool
            .pop()
            .unwrap_or_else(|| Box::new(Handle::new()));
        handle.init(hash, key, value, charge, deleter);
        let mut ptr = NonNull::new_unchecked(Box::into_raw(handle));

        // one reference for the returned pin
        ptr.as_mut().inc_ref();

        if self.capacity > 0 {
            // and one for the cache itself
            ptr.as_mut().inc_ref();
            ptr.as_mut().set_in_cache(true);
            self.in_use.push_back(ptr);
            self.usage += charge;
            if let Some(old) = self.indexer.insert(ptr) {
                self.finish_erase(old, victims);
            }
        }
        // capacity == 0 turns caching off; the entry lives only through its pin

        self.evict(victims);

        debug_assert_eq!(self.indexer.len(), self.lru.len() + self.in_use.len());

        ptr
    }

    unsafe fn get(&mut self, hash: u32, key: &[u8]) -> Option<NonNull<Handle<T>>> {
        let ptr = self.indexer.get(hash, key)?;
        self.acquire(ptr);
        Some(ptr)
    }

    /// Pin a handle, migrating it from `lru` to `in_use` when it gains its
    /// first external pin.
    unsafe fn acquire(&mut self, mut ptr: NonNull<Handle<T>>) {
        if ptr.as_ref().refs() == 1 && ptr.as_ref().is_in_cache() {
            self.lru.remove(ptr);
            self.in_use.push_back(ptr);
        }
        ptr.as_mut().inc_ref();
    }

    /// Drop one reference. The last reference frees the handle and stages its
    /// data in `victims`; a cache member losing its last pin migrates back to
    /// the warm end of `lru`.
    unsafe fn release(&mut self, mut ptr: NonNull<Handle<T>>, victims: &mut Victims<T>) {
        match ptr.as_mut().dec_ref() {
            0 => {
                debug_assert!(!ptr.as_ref().is_in_cache());
                let mut handle = Box::from_raw(ptr.as_ptr());
                victims.push(handle.take());
                let _ = self.state.object_pool.push(handle);
            }
            1 if ptr.as_ref().is_in_cache() => {
                self.in_use.remove(ptr);
                self.lru.push_back(ptr);
            }
            _ => {}
        }
    }

    /// Finish removing an entry that has just left the indexer: detach it
    /// from its list, debit its charge, and drop the cache's reference.
    unsafe fn finish_erase(&mut self, mut ptr: NonNull<Handle<T>>, victims: &mut Victims<T>) {
        debug_assert!(ptr.as_ref().is_in_cache());
        if ptr.as_ref().refs() == 1 {
            self.lru.remove(ptr);
        } else {
            self.in_use.remove(ptr);
        }
        ptr.as_mut().set_in_cache(false);
        self.usage -= ptr.as_ref().charge();
        self.release(ptr, victims);
    }

    unsafe fn remove(&mut self, hash: u32, key: &[u8], victims: &mut Victims<T>) {
        if let Some(ptr) = self.indexer.remove(hash, key) {
            self.finish_erase(ptr, victims);
        }
        debug_assert_eq!(self.indexer.len(), self.lru.len() + self.in_use.len());
    }

    /// Drop every cache member without an outstanding pin.
    unsafe fn prune(&mut self, victims: &mut Victims<T>) {
        while let Some(ptr) = self.lru.front() {
            debug_assert_eq!(ptr.as_ref().refs(), 1);
            let removed = self.indexer.remove(ptr.as_ref().hash(), ptr.as_ref().key());
            debug_assert_eq!(removed, Some(ptr));
            self.finish_erase(ptr, victims);
        }
    }

    /// Evict from the cold end of `lru` until the shard is within budget or
    /// only pinned entries remain.
    unsafe fn evict(&mut self, victims: &mut Victims<T>) {
        while self.usage > self.capacity {
            let Some(oldest) = self.lru.front() else {
                break;
            };
            debug_assert_eq!(oldest.as_ref().refs(), 1);
            let removed = self
                .indexer
                .remove(oldest.as_ref().hash(), oldest.as_ref().key());
            debug_assert_eq!(removed, Some(oldest));
            self.finish_erase(oldest, victims);
        }
    }
}

impl<T> Drop for LruShard<T>
where
    T: Value,
{
    fn drop(&mut self) {
        // Every pin holds an `Arc` of the owning cache, so no external
        // references remain by the time a shard drops.
        debug_assert!(self.in_use.is_empty());

        let mut victims = vec![];
        unsafe { self.prune(&mut victims) };
        for (key, value, deleter) in victims {
            deleter(&key, value);
        }
    }
}

/// A concurrent, sharded, reference-counted LRU cache.
///
/// The cache hashes each key once and dispatches on the high bits of the
/// 32-bit fingerprint, so operations on unrelated keys contend on different
/// shard mutexes. See the crate docs for an overview and an example.
pub struct Cache<T, S = RandomState>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
    shards: Vec<Mutex<LruShard<T>>>,

    capacity: usize,
    shard_bits: u32,

    hash_builder: S,

    /// Guards the id counter only; never nested with a shard mutex.
    last_id: Mutex<u64>,
}

impl<T> Cache<T>
where
    T: Value,
{
    /// Create a cache with the given total charge capacity and the default
    /// shard count. Capacity `0` disables caching.
    pub fn new(capacity: usize) -> Self {
        Self::with_config(CacheConfig {
            capacity,
            ..CacheConfig::default()
        })
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self::with_config_and_hasher(config, RandomState::default())
    }
}

impl<T, S> Cache<T, S>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
    pub fn with_config_and_hasher(config: CacheConfig, hash_builder: S) -> Self {
        assert!(
            config.shard_bits < 32,
            "shard_bits must be in [0, 32), given: {}",
            config.shard_bits
        );

        let shards = 1usize << config.shard_bits;
        let shard_capacity = (config.capacity + shards - 1) / shards;

        let state = Arc::new(SharedState {
            object_pool: ArrayQueue::new(config.object_pool_capacity.max(1)),
        });

        let shards = (0..shards)
            .map(|_| Mutex::new(LruShard::new(shard_capacity, state.clone())))
            .collect_vec();

        Self {
            shards,
            capacity: config.capacity,
            shard_bits: config.shard_bits,
            hash_builder,
            last_id: Mutex::new(0),
        }
    }

    /// Insert an entry and return a pin on it.
    ///
    /// `charge` is the entry's cost against the cache capacity. The deleter
    /// consumes the key and value exactly once, when the last reference to
    /// the entry drops; it runs outside any shard mutex and must not re-enter
    /// the cache on the same key.
    ///
    /// An existing entry under the same key is displaced but stays readable
    /// through pins taken before this call.
    pub fn insert(
        self: &Arc<Self>,
        key: &[u8],
        value: T,
        charge: usize,
        deleter: impl FnOnce(&[u8], T) + Send + 'static,
    ) -> CacheEntry<T, S> {
        let hash = self.hash(key);
        let mut victims = vec![];

        let ptr = unsafe {
            let mut shard = self.shards[self.shard_index(hash)].lock();
            shard.insert(hash, Box::from(key), value, charge, Box::new(deleter), &mut victims)
        };

        // Deleters never run under the shard mutex.
        for (key, value, deleter) in victims {
            deleter(&key, value);
        }

        CacheEntry {
            cache: self.clone(),
            ptr,
        }
    }

    /// Look up an entry, pinning it on hit.
    pub fn get(self: &Arc<Self>, key: &[u8]) -> Option<CacheEntry<T, S>> {
        let hash = self.hash(key);
        unsafe {
            let mut shard = self.shards[self.shard_index(hash)].lock();
            shard.get(hash, key).map(|ptr| CacheEntry {
                cache: self.clone(),
                ptr,
            })
        }
    }

    /// Remove an entry from the cache. A no-op for absent keys; pinned
    /// entries stay readable through their pins but are no longer found by
    /// [`Cache::get`].
    pub fn remove(&self, key: &[u8]) {
        let hash = self.hash(key);
        let mut victims = vec![];

        unsafe {
            let mut shard = self.shards[self.shard_index(hash)].lock();
            shard.remove(hash, key, &mut victims);
        }

        for (key, value, deleter) in victims {
            deleter(&key, value);
        }
    }

    /// Drop every entry without an outstanding pin.
    pub fn prune(&self) {
        for shard in self.shards.iter() {
            let mut victims = vec![];
            unsafe { shard.lock().prune(&mut victims) };
            for (key, value, deleter) in victims {
                deleter(&key, value);
            }
        }
    }

    /// Sum of the charges of all cache members.
    ///
    /// Shards are read one at a time under their own mutexes, so the result
    /// is not a consistent snapshot across concurrent mutations.
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().usage).sum()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A process-unique, strictly increasing id. Clients use it to namespace
    /// their keys within a shared cache.
    pub fn new_id(&self) -> u64 {
        let mut last_id = self.last_id.lock();
        *last_id += 1;
        *last_id
    }

    fn hash(&self, key: &[u8]) -> u32 {
        self.hash_builder.hash_one(key) as u32
    }

    /// The high bits pick the shard; the indexer consumes the low bits.
    fn shard_index(&self, hash: u32) -> usize {
        if self.shard_bits == 0 {
            0
        } else {
            (hash >> (32 - self.shard_bits)) as usize
        }
    }

    unsafe fn release_entry(&self, ptr: NonNull<Handle<T>>) {
        let mut victims = vec![];

        {
            // The shard is recovered from the embedded hash: a pin stays tied
            // to the shard that created it even after an erase.
            let hash = ptr.as_ref().hash();
            let mut shard = self.shards[self.shard_index(hash)].lock();
            shard.release(ptr, &mut victims);
        }

        for (key, value, deleter) in victims {
            deleter(&key, value);
        }
    }
}

/// A pin on a cache entry.
///
/// The entry cannot be evicted or destroyed while a pin exists; the last pin
/// to drop runs the deleter. Cloning takes another pin. Pins are usable from
/// any thread.
pub struct CacheEntry<T, S = RandomState>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
    cache: Arc<Cache<T, S>>,
    ptr: NonNull<Handle<T>>,
}

impl<T, S> CacheEntry<T, S>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
    pub fn key(&self) -> &[u8] {
        unsafe { self.ptr.as_ref().key() }
    }

    pub fn value(&self) -> &T {
        unsafe { self.ptr.as_ref().value() }
    }

    pub fn charge(&self) -> usize {
        unsafe { self.ptr.as_ref().charge() }
    }

    pub fn hash(&self) -> u32 {
        unsafe { self.ptr.as_ref().hash() }
    }

    /// Snapshot of the entry's reference count, including the cache's own
    /// reference while the entry is a cache member. Read under the entry's
    /// shard mutex; the count may change as soon as the lock is dropped.
    pub fn refs(&self) -> usize {
        unsafe {
            let hash = self.ptr.as_ref().hash();
            let _shard = self.cache.shards[self.cache.shard_index(hash)].lock();
            self.ptr.as_ref().refs()
        }
    }
}

impl<T, S> Clone for CacheEntry<T, S>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        unsafe {
            let hash = self.ptr.as_ref().hash();
            let mut shard = self.cache.shards[self.cache.shard_index(hash)].lock();
            shard.acquire(self.ptr);
        }

        Self {
            cache: self.cache.clone(),
            ptr: self.ptr,
        }
    }
}

impl<T, S> Drop for CacheEntry<T, S>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
    fn drop(&mut self) {
        unsafe { self.cache.release_entry(self.ptr) }
    }
}

impl<T, S> Deref for CacheEntry<T, S>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.value()
    }
}

unsafe impl<T, S> Send for CacheEntry<T, S>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
}
unsafe impl<T, S> Sync for CacheEntry<T, S>
where
    T: Value,
    S: BuildHasher + Send + Sync + 'static,
{
}
