// Copyright 2026 coevict Project Authors
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

use std::sync::Arc;

use coevict_common::code::{Key, Version};

use crate::context::EntryView;

/// Per-candidate filter, re-checked right before the entry is actually evicted.
pub type EntryFilter<K> = Arc<dyn Fn(&EntryView<K>) -> bool + Send + Sync + 'static>;

/// Handle the eviction policy uses to ask for an entry to be evicted.
pub trait Evictor<K: Key>: Send + Sync {
    /// Request eviction of `key`.
    ///
    /// `obsolete` is the version to mark the entry obsolete with when evicted without synchronization. `explicit`
    /// distinguishes user-requested evictions from policy-driven ones.
    ///
    /// Returns `true` if the entry is evicted or is now tracked for synchronized eviction.
    fn evict(&self, key: &K, obsolete: Option<Version>, explicit: bool, filter: Option<EntryFilter<K>>) -> bool;
}

/// Pluggable eviction policy, e.g. LRU or LFU.
///
/// The coordinator notifies the policy about accesses; the policy decides when an entry becomes a candidate and then
/// calls back [`Evictor::evict`].
pub trait EvictionPolicy<K: Key>: Send + Sync + 'static {
    /// Called when an entry is accessed, or re-offered after a rejected eviction.
    ///
    /// `evicted` is `true` if the entry has already left the cache and must be dropped from the policy's bookkeeping.
    fn on_entry_accessed(&self, evicted: bool, entry: &EntryView<K>, evictor: &dyn Evictor<K>);
}

/// Decides whether an entry may be evicted at all.
pub trait EvictionFilter<K: Key>: Send + Sync + 'static {
    /// Returns `true` if the entry is eligible for eviction.
    fn evict_allowed(&self, entry: &EntryView<K>) -> bool;
}

impl<K, F> EvictionFilter<K> for F
where
    K: Key,
    F: Fn(&EntryView<K>) -> bool + Send + Sync + 'static,
{
    fn evict_allowed(&self, entry: &EntryView<K>) -> bool {
        self(entry)
    }
}

/// A policy that never asks for anything to be evicted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicy;

impl<K: Key> EvictionPolicy<K> for NoopPolicy {
    fn on_entry_accessed(&self, _: bool, _: &EntryView<K>, _: &dyn Evictor<K>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_filter() {
        let filter = |entry: &EntryView<u64>| entry.key % 2 == 0;
        assert!(filter.evict_allowed(&EntryView::new(2, Version(1), 0)));
        assert!(!filter.evict_allowed(&EntryView::new(3, Version(1), 0)));
    }
}
