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

use std::ptr::NonNull;

use bitflags::bitflags;

use crate::{
    dlist::{DlistLink, DlistNode},
    Value,
};

/// Consumes an entry's key and value when the last reference is dropped.
///
/// Deleters always run outside the shard mutex and must not re-enter the
/// cache on the same key.
pub type Deleter<T> = Box<dyn FnOnce(&[u8], T) + Send + 'static>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HandleFlags: u8 {
        const IN_CACHE = 0b00000001;
    }
}

struct Data<T>
where
    T: Value,
{
    key: Box<[u8]>,
    value: T,
    deleter: Deleter<T>,
}

/// The cached entry.
///
/// A handle is shared between the owning shard (one reference while
/// `IN_CACHE`) and every outstanding external pin. It carries its own list
/// link and hash-chain link, so list migration and index rehashing are
/// allocation-free. All fields except `hash`, the key, `charge`, and the
/// deleter are guarded by the shard mutex.
pub struct Handle<T>
where
    T: Value,
{
    data: Option<Data<T>>,

    link: DlistLink<Self>,
    next_hash: Option<NonNull<Handle<T>>>,

    hash: u32,
    charge: usize,
    refs: usize,
    flags: HandleFlags,
}

unsafe impl<T> Send for Handle<T> where T: Value {}
unsafe impl<T> Sync for Handle<T> where T: Value {}

unsafe impl<T> DlistNode for Handle<T>
where
    T: Value,
{
    fn dlist_link(&self) -> &DlistLink<Self> {
        &self.link
    }

    fn dlist_link_mut(&mut self) -> &mut DlistLink<Self> {
        &mut self.link
    }
}

impl<T> Handle<T>
where
    T: Value,
{
    /// Create an uninitialized handle, ready for [`Handle::init`].
    pub fn new() -> Self {
        Self {
            data: None,
            link: DlistLink::default(),
            next_hash: None,
            hash: 0,
            charge: 0,
            refs: 0,
            flags: HandleFlags::empty(),
        }
    }

    pub fn init(&mut self, hash: u32, key: Box<[u8]>, value: T, charge: usize, deleter: Deleter<T>) {
        debug_assert!(self.data.is_none());
        debug_assert!(!self.link.is_linked());
        debug_assert!(self.next_hash.is_none());

        self.data = Some(Data { key, value, deleter });
        self.hash = hash;
        self.charge = charge;
        self.refs = 0;
        self.flags = HandleFlags::empty();
    }

    /// Unwrap the entry data, resetting the handle for reuse.
    pub fn take(&mut self) -> (Box<[u8]>, T, Deleter<T>) {
        debug_assert!(self.data.is_some());
        debug_assert_eq!(self.refs, 0);
        debug_assert!(!self.link.is_linked());

        self.next_hash = None;
        self.flags = HandleFlags::empty();
        let data = unsafe { self.data.take().unwrap_unchecked() };
        (data.key, data.value, data.deleter)
    }

    pub fn key(&self) -> &[u8] {
        debug_assert!(self.data.is_some());
        unsafe { self.data.as_ref().unwrap_unchecked().key.as_ref() }
    }

    pub fn value(&self) -> &T {
        debug_assert!(self.data.is_some());
        unsafe { &self.data.as_ref().unwrap_unchecked().value }
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn charge(&self) -> usize {
        self.charge
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    /// Increase the reference count, returning the new count.
    pub fn inc_ref(&mut self) -> usize {
        self.refs += 1;
        tracing::trace!(
            "[handle]: inc handle (hash: {}) refs: {} => {}",
            self.hash,
            self.refs - 1,
            self.refs
        );
        self.refs
    }

    /// Decrease the reference count, returning the new count.
    pub fn dec_ref(&mut self) -> usize {
        debug_assert!(self.refs > 0);
        self.refs -= 1;
        tracing::trace!(
            "[handle]: dec handle (hash: {}) refs: {} => {}",
            self.hash,
            self.refs + 1,
            self.refs
        );
        self.refs
    }

    pub fn set_in_cache(&mut self, in_cache: bool) {
        if in_cache {
            self.flags |= HandleFlags::IN_CACHE;
        } else {
            self.flags -= HandleFlags::IN_CACHE;
        }
    }

    pub fn is_in_cache(&self) -> bool {
        !(self.flags & HandleFlags::IN_CACHE).is_empty()
    }

    pub fn next_hash(&self) -> Option<NonNull<Handle<T>>> {
        self.next_hash
    }

    pub fn next_hash_mut(&mut self) -> &mut Option<NonNull<Handle<T>>> {
        &mut self.next_hash
    }
}
