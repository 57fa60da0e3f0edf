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

//! A concurrent, sharded, reference-counted LRU cache.
//!
//! `pincache` is the block/table cache of an embedded key-value storage
//! engine. It admits opaque values under arbitrary byte-string keys, bounds
//! the total resident charge to a configured capacity, and evicts the least
//! recently used entries once the budget is exceeded. Every [`Cache::insert`]
//! and [`Cache::get`] returns a [`CacheEntry`] that *pins* the entry: a
//! pinned entry is never an eviction candidate and outlives its removal from
//! the cache until the last pin is dropped, at which point the entry's
//! deleter consumes the key and value.
//!
//! The cache is partitioned into shards selected by the high bits of the key
//! hash, each serializing its mutations under its own mutex, so unrelated
//! keys rarely contend.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use pincache::Cache;
//!
//! let cache = Arc::new(Cache::new(16 * 1024));
//!
//! let block = cache.insert(b"table-7/block-0", vec![0u8; 4096], 4096, |_key, _block| {
//!     // Runs exactly once, when the last pin on the entry is dropped.
//! });
//! assert_eq!(block.value().len(), 4096);
//! drop(block);
//!
//! let block = cache.get(b"table-7/block-0").unwrap();
//! assert_eq!(block.charge(), 4096);
//! ```

mod cache;
mod dlist;
mod handle;
mod indexer;

pub use cache::{Cache, CacheConfig, CacheEntry};
pub use handle::Deleter;

/// Cached value payload.
pub trait Value: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> Value for T {}
