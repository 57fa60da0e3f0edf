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

//! A chained hash index over cache handles.
//!
//! Buckets are a power-of-two array of singly-linked chains threaded through
//! the handles' own `next_hash` links, so growing the table rehashes in place
//! without touching the allocator. The table grows whenever the element count
//! exceeds the bucket count, keeping the average chain length at most one.

use std::ptr::NonNull;

use crate::{handle::Handle, Value};

const INITIAL_BUCKETS: usize = 4;

pub struct Indexer<T>
where
    T: Value,
{
    buckets: Box<[Option<NonNull<Handle<T>>>]>,
    elems: usize,
}

unsafe impl<T> Send for Indexer<T> where T: Value {}
unsafe impl<T> Sync for Indexer<T> where T: Value {}

impl<T> Indexer<T>
where
    T: Value,
{
    pub fn new() -> Self {
        Self {
            buckets: vec![None; INITIAL_BUCKETS].into_boxed_slice(),
            elems: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.elems
    }

    /// Find the handle stored under `(key, hash)`.
    ///
    /// # Safety
    ///
    /// All indexed handles must be valid. Must be called under the owning
    /// shard's mutex.
    pub unsafe fn get(&self, hash: u32, key: &[u8]) -> Option<NonNull<Handle<T>>> {
        let mut cur = self.buckets[self.bucket(hash)];
        while let Some(h) = cur {
            if h.as_ref().hash() == hash && h.as_ref().key() == key {
                return Some(h);
            }
            cur = h.as_ref().next_hash();
        }
        None
    }

    /// Index a handle, returning the displaced handle if one was stored under
    /// the same `(key, hash)`.
    ///
    /// The displaced handle is spliced out of its chain; ownership passes to
    /// the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid, initialized, and not already indexed. Must be
    /// called under the owning shard's mutex.
    pub unsafe fn insert(&mut self, mut ptr: NonNull<Handle<T>>) -> Option<NonNull<Handle<T>>> {
        let hash = ptr.as_ref().hash();
        let slot = self.slot(hash, ptr.as_ref().key());

        let old = *slot.as_ref();
        *ptr.as_mut().next_hash_mut() = match old {
            // substitute for the matching handle, inheriting its chain tail
            Some(mut old) => old.as_mut().next_hash_mut().take(),
            None => None,
        };
        *slot.as_ptr() = Some(ptr);

        if old.is_none() {
            self.elems += 1;
            if self.elems > self.buckets.len() {
                self.grow();
            }
        }

        old
    }

    /// Splice the handle stored under `(key, hash)` out of its chain and
    /// return it. Ownership passes to the caller; nothing is freed.
    ///
    /// # Safety
    ///
    /// All indexed handles must be valid. Must be called under the owning
    /// shard's mutex.
    pub unsafe fn remove(&mut self, hash: u32, key: &[u8]) -> Option<NonNull<Handle<T>>> {
        let slot = self.slot(hash, key);

        let old = *slot.as_ref();
        if let Some(mut h) = old {
            *slot.as_ptr() = h.as_mut().next_hash_mut().take();
            self.elems -= 1;
        }
        old
    }

    fn bucket(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    /// Walk the chain for `(key, hash)` and return a pointer to the slot that
    /// refers to the matching handle, or to the trailing empty slot if there
    /// is no match. Operating on slots lets removal splice the head of a
    /// chain without a special case.
    unsafe fn slot(&mut self, hash: u32, key: &[u8]) -> NonNull<Option<NonNull<Handle<T>>>> {
        let bucket = self.bucket(hash);
        let mut slot = NonNull::from(&mut self.buckets[bucket]);
        while let Some(mut h) = *slot.as_ref() {
            if h.as_ref().hash() == hash && h.as_ref().key() == key {
                break;
            }
            slot = NonNull::from(h.as_mut().next_hash_mut());
        }
        slot
    }

    unsafe fn grow(&mut self) {
        let mut new_len = INITIAL_BUCKETS;
        while new_len < self.elems {
            new_len <<= 1;
        }

        let mut new_buckets = vec![None; new_len].into_boxed_slice();
        let mut count = 0;
        for bucket in self.buckets.iter_mut() {
            let mut cur = bucket.take();
            while let Some(mut h) = cur {
                let next = h.as_mut().next_hash_mut().take();
                let index = h.as_ref().hash() as usize & (new_len - 1);
                *h.as_mut().next_hash_mut() = new_buckets[index];
                new_buckets[index] = Some(h);
                cur = next;
                count += 1;
            }
        }
        debug_assert_eq!(self.elems, count);

        self.buckets = new_buckets;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn new_handle_ptr(hash: u32, key: &[u8], value: u64) -> NonNull<Handle<u64>> {
        let mut handle = Box::new(Handle::new());
        handle.init(hash, key.into(), value, 1, Box::new(|_, _| {}));
        NonNull::new_unchecked(Box::into_raw(handle))
    }

    unsafe fn del_handle_ptr(ptr: NonNull<Handle<u64>>) {
        let _ = Box::from_raw(ptr.as_ptr());
    }

    #[test]
    fn test_indexer_insert_get_remove() {
        unsafe {
            let mut indexer = Indexer::new();

            let p1 = new_handle_ptr(1, b"k1", 100);
            let p2 = new_handle_ptr(2, b"k2", 200);

            assert!(indexer.insert(p1).is_none());
            assert!(indexer.insert(p2).is_none());
            assert_eq!(indexer.len(), 2);

            assert_eq!(indexer.get(1, b"k1"), Some(p1));
            assert_eq!(indexer.get(2, b"k2"), Some(p2));
            assert_eq!(indexer.get(3, b"k3"), None);
            // same hash, different key
            assert_eq!(indexer.get(1, b"k2"), None);

            assert_eq!(indexer.remove(1, b"k1"), Some(p1));
            assert_eq!(indexer.remove(1, b"k1"), None);
            assert_eq!(indexer.get(1, b"k1"), None);
            assert_eq!(indexer.len(), 1);

            assert_eq!(indexer.remove(2, b"k2"), Some(p2));
            assert_eq!(indexer.len(), 0);

            del_handle_ptr(p1);
            del_handle_ptr(p2);
        }
    }

    #[test]
    fn test_indexer_displace() {
        unsafe {
            let mut indexer = Indexer::new();

            let p1 = new_handle_ptr(1, b"k", 100);
            let p2 = new_handle_ptr(1, b"k", 200);

            assert!(indexer.insert(p1).is_none());
            assert_eq!(indexer.insert(p2), Some(p1));
            // displacement does not bump the element count
            assert_eq!(indexer.len(), 1);
            assert_eq!(indexer.get(1, b"k"), Some(p2));
            assert!(p1.as_ref().next_hash().is_none());

            assert_eq!(indexer.remove(1, b"k"), Some(p2));

            del_handle_ptr(p1);
            del_handle_ptr(p2);
        }
    }

    #[test]
    fn test_indexer_chain_and_grow() {
        unsafe {
            let mut indexer = Indexer::new();

            // Colliding low bits exercise the chains; enough entries force
            // several growth steps.
            let ptrs = (0..64u32)
                .map(|i| new_handle_ptr(i << 4, format!("key-{i}").as_bytes(), i as u64))
                .collect::<Vec<_>>();

            for &ptr in &ptrs {
                assert!(indexer.insert(ptr).is_none());
            }
            assert_eq!(indexer.len(), 64);

            for (i, &ptr) in ptrs.iter().enumerate() {
                let i = i as u32;
                assert_eq!(indexer.get(i << 4, format!("key-{i}").as_bytes()), Some(ptr));
            }

            // removing from the middle of a chain splices cleanly
            for (i, &ptr) in ptrs.iter().enumerate() {
                let i = i as u32;
                assert_eq!(indexer.remove(i << 4, format!("key-{i}").as_bytes()), Some(ptr));
            }
            assert_eq!(indexer.len(), 0);

            for ptr in ptrs {
                del_handle_ptr(ptr);
            }
        }
    }
}
