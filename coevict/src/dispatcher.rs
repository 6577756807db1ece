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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use coevict_common::code::Key;

use crate::{buffer::Candidate, manager::Shared, round::Round};

/// Routes candidates into the current round and starts new rounds.
pub(crate) struct Dispatcher<K: Key> {
    current: ArcSwapOption<Round<K>>,
    next_id: AtomicU64,
    created: AtomicU64,
}

impl<K: Key> Default for Dispatcher<K> {
    fn default() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            next_id: AtomicU64::new(0),
            created: AtomicU64::new(0),
        }
    }
}

impl<K: Key> Dispatcher<K> {
    /// Add a batch of candidates to the current round.
    ///
    /// The thread whose batch fills the round up to `max_batch` detaches the round and prepares it. No candidate is
    /// dropped: a batch refused by a closed or full round is retried on a fresh one.
    pub fn add_batch(&self, shared: &Arc<Shared<K>>, mut batch: Vec<Candidate<K>>, max_batch: usize) {
        loop {
            let Some(round) = self.current.load_full() else {
                self.install(shared, None);
                continue;
            };

            match round.add(batch, max_batch) {
                Ok(()) => {
                    if round.try_begin_prepare(max_batch) {
                        self.current
                            .compare_and_swap(&Some(round.clone()), None::<Arc<Round<K>>>);
                        round.prepare();
                    }
                    return;
                }
                Err(rejected) => {
                    batch = rejected;
                    self.install(shared, Some(round));
                }
            }
        }
    }

    /// Replace the current round with a fresh one if it is still `expected`.
    fn install(&self, shared: &Arc<Shared<K>>, expected: Option<Arc<Round<K>>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let fresh = Arc::new(Round::new(id, shared.clone()));
        let prev = self.current.compare_and_swap(&expected, Some(fresh));
        let installed = match (&*prev, &expected) {
            (None, None) => true,
            (Some(prev), Some(expected)) => Arc::ptr_eq(prev, expected),
            _ => false,
        };
        if installed {
            self.created.fetch_add(1, Ordering::Relaxed);
            shared.metrics.round_create.increase(1);
            tracing::trace!(round = id, "[eviction round]: created");
        }
    }

    /// Detach the round that is still accepting candidates.
    pub fn take_current(&self) -> Option<Arc<Round<K>>> {
        self.current.swap(None)
    }

    /// Count of rounds that have been installed.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}
