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

use std::marker::PhantomData;

use coevict_common::code::Key;

use crate::round::RoundOutcome;

/// Receives the results of synchronized eviction.
///
/// Callbacks run on the thread that completes the round, after every lock of the round is released.
pub trait EventListener<K>: Send + Sync + 'static
where
    K: Key,
{
    /// The entry has been evicted from the local node.
    fn on_evict(&self, key: &K) {
        let _ = key;
    }

    /// The entry could not be evicted and is handed back to the eviction policy.
    fn on_reject(&self, key: &K) {
        let _ = key;
    }

    /// A round has completed.
    fn on_round_completed(&self, outcome: &RoundOutcome<K>) {
        let _ = outcome;
    }
}

/// An [`EventListener`] that ignores every event.
#[derive(Debug)]
pub struct DefaultEventListener<K>(PhantomData<K>)
where
    K: Key;

impl<K> Default for DefaultEventListener<K>
where
    K: Key,
{
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<K> EventListener<K> for DefaultEventListener<K> where K: Key {}
