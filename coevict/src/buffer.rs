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

use std::{collections::VecDeque, fmt::Debug};

use coevict_common::{
    code::{Key, Version},
    strict_assert,
};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{context::EntryView, policy::EntryFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token(usize);

/// A FIFO queue that supports random lazy item removal.
pub(crate) struct RemovableQueue<T> {
    /// Slots from the pop point to the push point. Removed items leave a hole.
    queue: VecDeque<Option<T>>,
    /// Token of the slot at the pop point.
    offset: usize,
    /// Actually element count.
    len: usize,
}

impl<T> Default for RemovableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RemovableQueue<T> {
    pub const DEFAULT_CAPACITY: usize = 16;

    /// Create an empty [`RemovableQueue`] with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an empty [`RemovableQueue`] with given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            offset: 0,
            len: 0,
        }
    }

    /// Push an element to the tail of the queue.
    ///
    /// Returns a token that can be used for randomly removal.
    pub fn push(&mut self, elem: T) -> Token {
        let token = self.offset + self.queue.len();
        self.queue.push_back(Some(elem));
        self.len += 1;
        strict_assert!(self.usage() >= self.len);
        Token(token)
    }

    /// Pop an element from the head of the queue.
    pub fn pop(&mut self) -> Option<T> {
        let mut res = None;

        while res.is_none() {
            match self.queue.pop_front() {
                Some(slot) => {
                    self.offset += 1;
                    res = slot;
                }
                None => break,
            }
        }
        self.skip_holes();

        if res.is_some() {
            self.len -= 1;
        }

        res
    }

    /// Randonly remove the element with the given `token` from the queue.
    pub fn remove(&mut self, token: Token) -> Option<T> {
        if token.0 < self.offset || token.0 >= self.offset + self.queue.len() {
            return None;
        }
        let res = self.queue[token.0 - self.offset].take();
        if res.is_some() {
            self.len -= 1;
        }
        self.skip_holes();
        res
    }

    /// Returns the actually element count.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns the occupied slots of the queue.
    #[inline(always)]
    pub fn usage(&self) -> usize {
        self.queue.len()
    }

    fn skip_holes(&mut self) {
        while let Some(None) = self.queue.front() {
            self.queue.pop_front();
            self.offset += 1;
        }
    }
}

/// An entry flagged for synchronized eviction, with the version and filter captured at flag time.
#[derive(Clone)]
pub struct Candidate<K> {
    /// Entry key.
    pub key: K,
    /// Entry version when the candidate was created.
    pub version: Version,
    /// Optional filter re-checked at eviction time.
    pub filter: Option<EntryFilter<K>>,
}

impl<K: Debug> Debug for Candidate<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl<K: Key> Candidate<K> {
    /// Returns `true` if the entry is still the one flagged and passes the filter.
    pub(crate) fn matches(&self, entry: &EntryView<K>) -> bool {
        entry.version == self.version && self.filter.as_ref().is_none_or(|filter| filter(entry))
    }
}

struct BufferInner<K: Key> {
    queue: RemovableQueue<Candidate<K>>,
    /// Keys that are pending, either queued (with a token) or drained into a round that has not been prepared yet.
    markers: HashMap<K, Option<Token>>,
}

/// Candidates waiting to be batched into eviction rounds.
///
/// Every entry is buffered at most once until the round holding it is prepared.
pub(crate) struct EvictionBuffer<K: Key> {
    inner: Mutex<BufferInner<K>>,
}

impl<K: Key> Default for EvictionBuffer<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                queue: RemovableQueue::new(),
                markers: HashMap::new(),
            }),
        }
    }
}

impl<K: Key> EvictionBuffer<K> {
    /// Buffer a candidate.
    ///
    /// Returns `false` if the entry is already pending.
    pub fn push(&self, candidate: Candidate<K>) -> bool {
        let mut inner = self.inner.lock();
        if inner.markers.contains_key(&candidate.key) {
            return false;
        }
        let key = candidate.key.clone();
        let token = inner.queue.push(candidate);
        inner.markers.insert(key, Some(token));
        true
    }

    /// Take up to `max` candidates in FIFO order.
    ///
    /// Drained keys stay marked until [`EvictionBuffer::unmark`] is called for them.
    pub fn drain(&self, max: usize) -> Vec<Candidate<K>> {
        let mut inner = self.inner.lock();
        let mut res = Vec::with_capacity(max.min(inner.queue.len()));
        while res.len() < max {
            let Some(candidate) = inner.queue.pop() else { break };
            if let Some(marker) = inner.markers.get_mut(&candidate.key) {
                *marker = None;
            }
            res.push(candidate);
        }
        res
    }

    /// Clear the pending marker of `key`, removing the candidate from the queue if it has not been drained yet.
    pub fn unmark(&self, key: &K) -> Option<Candidate<K>> {
        let mut inner = self.inner.lock();
        match inner.markers.remove(key) {
            Some(Some(token)) => inner.queue.remove(token),
            _ => None,
        }
    }

    /// Returns `true` if `key` is pending.
    pub fn is_marked(&self, key: &K) -> bool {
        self.inner.lock().markers.contains_key(key)
    }

    /// Count of queued candidates.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}
