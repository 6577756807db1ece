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

//! The eviction round: one coordinated batch-eviction attempt spanning local and remote participants.
//!
//! A round moves strictly forward through [`RoundState`]. Only the thread that wins the `Created -> Preparing`
//! transition prepares it, and only the thread that wins the transition into `Completing` builds its outcome.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::Instant,
};

use coevict_common::code::{Key, NodeId, TopologyVersion};
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::{
    buffer::Candidate,
    context::{EntryView, EvictGuard, RequestContext, Tier, TimeoutToken, TopologyReadGuard},
    error::SendError,
    manager::Shared,
    message::{EvictionRequest, EvictionResponse, Message},
};

/// Lifecycle state of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RoundState {
    /// Accepting candidates.
    Created = 0,
    /// Closed for candidates, mapping participants and sending requests.
    Preparing = 1,
    /// Requests sent, waiting for responses or the timeout.
    Dispatched = 2,
    /// The outcome is being built.
    Completing = 3,
    /// The outcome has been delivered.
    Done = 4,
}

impl From<u8> for RoundState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Preparing,
            2 => Self::Dispatched,
            3 => Self::Completing,
            _ => Self::Done,
        }
    }
}

/// What forced a round to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Every outstanding request is answered, or a participant reported an error.
    Responses,
    /// The round timed out.
    Timeout,
    /// The coordinator is shutting down.
    Shutdown,
}

/// Final result of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome<K> {
    /// Round id.
    pub round_id: u64,
    /// Keys evicted by the round.
    pub evicted: Vec<K>,
    /// Keys the round could not evict.
    pub rejected: Vec<K>,
    /// The round timed out before every participant answered.
    pub timed_out: bool,
    /// The round was cancelled by shutdown.
    pub cancelled: bool,
    /// The topology changed between dispatch and completion.
    pub topology_changed: bool,
    /// Participants that failed to process their request.
    pub failed_nodes: Vec<NodeId>,
}

impl<K: Key> RoundOutcome<K> {
    fn new(round_id: u64) -> Self {
        Self {
            round_id,
            evicted: vec![],
            rejected: vec![],
            timed_out: false,
            cancelled: false,
            topology_changed: false,
            failed_nodes: vec![],
        }
    }

    /// Returns `true` if the round evicted `key`.
    pub fn is_evicted(&self, key: &K) -> bool {
        self.evicted.contains(key)
    }

    /// Returns `true` if the round rejected `key`.
    pub fn is_rejected(&self, key: &K) -> bool {
        self.rejected.contains(key)
    }
}

/// Receives the outcome of a round once it completes.
pub type RoundWaiter<K> = oneshot::Receiver<Arc<RoundOutcome<K>>>;

struct RoundInner<K: Key> {
    /// Candidates before preparation, candidates with remote participants after.
    entries: HashMap<K, Candidate<K>>,
    /// Near readers mapped for each candidate.
    readers: HashMap<K, Vec<NodeId>>,
    /// Keys of every outstanding request, by participant.
    requests: HashMap<NodeId, Vec<K>>,
    responses: HashMap<NodeId, EvictionResponse<K>>,
    /// Keys whose request could not be delivered.
    failed: HashSet<K>,
    /// Results resolved without remote participants.
    evicted: Vec<K>,
    rejected: Vec<K>,
    topology_version: TopologyVersion,
}

impl<K: Key> RoundInner<K> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            readers: HashMap::new(),
            requests: HashMap::new(),
            responses: HashMap::new(),
            failed: HashSet::new(),
            evicted: vec![],
            rejected: vec![],
            topology_version: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.requests.keys().all(|node| self.responses.contains_key(node))
    }
}

struct Waiters<K> {
    outcome: Option<Arc<RoundOutcome<K>>>,
    senders: Vec<oneshot::Sender<Arc<RoundOutcome<K>>>>,
}

pub(crate) struct Round<K: Key> {
    id: u64,
    shared: Arc<Shared<K>>,
    state: AtomicU8,
    /// Adders hold it shared. The preparer takes it exclusively once to wait for in-flight adders.
    fill: RwLock<()>,
    inner: Mutex<RoundInner<K>>,
    /// Timeout registered for the round, if any.
    timeout: Mutex<Option<TimeoutToken>>,
    /// Set while the round holds a limiter slot.
    limited: AtomicBool,
    waiters: Mutex<Waiters<K>>,
    created: Instant,
}

impl<K: Key> Debug for Round<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Round")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<K: Key> Round<K> {
    pub fn new(id: u64, shared: Arc<Shared<K>>) -> Self {
        Self {
            id,
            shared,
            state: AtomicU8::new(RoundState::Created as u8),
            fill: RwLock::new(()),
            inner: Mutex::new(RoundInner::new()),
            timeout: Mutex::new(None),
            limited: AtomicBool::new(false),
            waiters: Mutex::new(Waiters {
                outcome: None,
                senders: vec![],
            }),
            created: Instant::now(),
        }
    }

    pub fn state(&self) -> RoundState {
        self.state.load(Ordering::Acquire).into()
    }

    fn transit(&self, from: RoundState, to: RoundState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Add candidates to a round that is still accepting them.
    ///
    /// The batch is handed back if the round is being prepared or already holds `max_batch` candidates.
    pub fn add(&self, batch: Vec<Candidate<K>>, max_batch: usize) -> std::result::Result<(), Vec<Candidate<K>>> {
        let Some(_permit) = self.fill.try_read() else {
            return Err(batch);
        };
        if self.state() != RoundState::Created {
            return Err(batch);
        }
        let mut inner = self.inner.lock();
        if inner.entries.len() >= max_batch {
            return Err(batch);
        }
        for candidate in batch {
            inner.entries.insert(candidate.key.clone(), candidate);
        }
        Ok(())
    }

    /// Returns `true` if the caller has become the sole preparer of the round.
    pub fn try_begin_prepare(&self, max_batch: usize) -> bool {
        if self.inner.lock().entries.len() < max_batch {
            return false;
        }
        self.transit(RoundState::Created, RoundState::Preparing)
    }

    /// Subscribe to the outcome of the round.
    pub fn subscribe(&self) -> RoundWaiter<K> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        match &waiters.outcome {
            Some(outcome) => {
                let _ = tx.send(outcome.clone());
            }
            None => waiters.senders.push(tx),
        }
        rx
    }

    /// Map participants, evict local-only candidates and dispatch the remote requests.
    ///
    /// Must only be called by the thread that won [`Round::try_begin_prepare`].
    pub fn prepare(self: &Arc<Self>) {
        let shared = &self.shared;

        // Wait for in-flight adders.
        drop(self.fill.write());

        let start = Instant::now();
        if let Err(e) = shared.limiter.acquire(shared.config.admission_poll_interval) {
            tracing::debug!(round = self.id, "[eviction round]: {e}");
            self.complete(Trigger::Shutdown);
            return;
        }
        shared.metrics.round_inflight.increase(1);
        self.limited.store(true, Ordering::Release);
        shared
            .metrics
            .admission_wait_duration
            .record(start.elapsed().as_secs_f64());
        if self.state() != RoundState::Preparing {
            self.release_slot();
            return;
        }
        shared.metrics.round_prepare.increase(1);

        let sends = {
            let topology = &*shared.ctx.topology;
            let _guard = TopologyReadGuard::new(topology);
            let local = topology.local_node();
            let topology_version = topology.version();
            let ctx = RequestContext::local(local);

            let mut inner = self.inner.lock();
            inner.topology_version = topology_version;

            tracing::debug!(
                round = self.id,
                entries = inner.entries.len(),
                topology_version,
                "[eviction round]: preparing"
            );

            let entries = std::mem::take(&mut inner.entries);
            let mut requests: HashMap<NodeId, EvictionRequest<K>> = HashMap::new();
            let mut locals = vec![];

            for (key, candidate) in entries {
                shared.buffer.unmark(&key);

                let Some(entry) = shared.ctx.storage.peek(&key) else {
                    tracing::trace!(round = self.id, ?key, "[eviction round]: entry removed while preparing");
                    inner.evicted.push(key);
                    continue;
                };

                let (backups, readers) = shared.participants(&entry, topology_version, local);
                if backups.is_empty() && readers.is_empty() {
                    locals.push(candidate);
                    continue;
                }

                for node in backups.iter().chain(readers.iter()).unique() {
                    requests
                        .entry(*node)
                        .or_insert_with(|| EvictionRequest::new(self.id, topology_version))
                        .add_key(key.clone(), candidate.version, readers.contains(node));
                }
                inner.readers.insert(key.clone(), readers);
                inner.entries.insert(key, candidate);
            }

            if !locals.is_empty() {
                let obsolete = shared.ctx.versions.next_version();
                for candidate in locals {
                    tracing::trace!(round = self.id, key = ?candidate.key, "[eviction round]: evict without remote participants");
                    let guard: EvictGuard<'_, K> = &|entry: &EntryView<K>| candidate.matches(entry);
                    match shared
                        .ctx
                        .storage
                        .evict(&candidate.key, Tier::Main, obsolete, Some(guard), &ctx)
                    {
                        Ok(true) => {
                            shared.metrics.eviction_local_evict.increase(1);
                            inner.evicted.push(candidate.key);
                        }
                        Ok(false) => inner.rejected.push(candidate.key),
                        Err(e) => {
                            tracing::error!(round = self.id, key = ?candidate.key, "[eviction round]: failed to evict entry: {e}");
                            inner.rejected.push(candidate.key);
                        }
                    }
                }
            }

            if inner.entries.is_empty() {
                None
            } else {
                inner.requests = requests
                    .iter()
                    .map(|(node, request)| (*node, request.keys().cloned().collect()))
                    .collect();
                if self.state() == RoundState::Preparing {
                    shared.registry.lock().insert(self.id, self.clone());
                }
                Some(requests)
            }
        };

        let Some(requests) = sends else {
            // Only local entries.
            self.complete(Trigger::Responses);
            return;
        };

        for (node, request) in requests {
            if self.state() >= RoundState::Completing {
                return;
            }
            tracing::debug!(round = self.id, %node, keys = request.entries.len(), "[eviction round]: sending eviction request");
            match shared.ctx.transport.send(node, Message::Request(request)) {
                Ok(()) => shared.metrics.request_send.increase(1),
                Err(SendError::Unreachable(_)) => {
                    tracing::debug!(round = self.id, %node, "[eviction round]: node left before request was sent");
                    self.on_node_left(node);
                }
                Err(e) => {
                    shared.metrics.request_send_fail.increase(1);
                    tracing::error!(round = self.id, %node, "[eviction round]: failed to send eviction request: {e}");
                    self.on_send_failed(node);
                }
            }
        }

        let mut registered = self.timeout.lock();
        if self.transit(RoundState::Preparing, RoundState::Dispatched) {
            let round = Arc::downgrade(self);
            let token = shared.ctx.timer.add_timeout(
                self.id,
                Instant::now() + shared.config.timeout,
                Box::new(move || {
                    if let Some(round) = round.upgrade() {
                        round.on_timeout();
                    }
                }),
            );
            *registered = Some(token);
        }
    }

    pub fn on_response(&self, node: NodeId, response: EvictionResponse<K>) {
        if self.state() >= RoundState::Completing {
            return;
        }

        let error = {
            let mut inner = self.inner.lock();
            if !inner.requests.contains_key(&node) {
                tracing::debug!(round = self.id, %node, "[eviction round]: ignore response from unexpected node");
                return;
            }
            if self.shared.ctx.topology.is_alive(node) {
                let error = response.error;
                inner.responses.insert(node, response);
                error
            } else {
                inner.requests.remove(&node);
                inner.responses.remove(&node);
                false
            }
        };

        if error {
            tracing::warn!(round = self.id, %node, "[eviction round]: remote node failed to process eviction request");
            self.complete(Trigger::Responses);
        } else {
            self.check_done();
        }
    }

    pub fn on_node_left(&self, node: NodeId) {
        if self.state() >= RoundState::Completing {
            return;
        }

        {
            let mut inner = self.inner.lock();
            if inner.requests.remove(&node).is_none() {
                return;
            }
            inner.responses.remove(&node);
        }

        tracing::debug!(round = self.id, %node, "[eviction round]: participant left");
        self.check_done();
    }

    fn on_send_failed(&self, node: NodeId) {
        {
            let mut inner = self.inner.lock();
            if let Some(keys) = inner.requests.remove(&node) {
                inner.failed.extend(keys);
            }
            inner.responses.remove(&node);
        }
        self.check_done();
    }

    fn on_timeout(&self) {
        self.complete(Trigger::Timeout);
    }

    fn check_done(&self) {
        let done = self.inner.lock().is_done();
        if done {
            self.complete(Trigger::Responses);
        }
    }

    /// Build and deliver the outcome. Only the first caller has any effect.
    pub(crate) fn complete(&self, trigger: Trigger) {
        let mut current = self.state();
        loop {
            if current >= RoundState::Completing {
                return;
            }
            match self.state.compare_exchange(
                current as u8,
                RoundState::Completing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(state) => current = state.into(),
            }
        }

        let shared = &self.shared;

        let inner = {
            let mut inner = self.inner.lock();
            shared.registry.lock().remove(&self.id);
            std::mem::replace(&mut *inner, RoundInner::new())
        };
        let token = self.timeout.lock().take();
        if let Some(token) = token {
            shared.ctx.timer.remove_timeout(token);
        }

        let mut outcome = RoundOutcome::new(self.id);
        outcome.evicted = inner.evicted;
        outcome.rejected = inner.rejected;
        outcome.timed_out = trigger == Trigger::Timeout;
        outcome.cancelled = trigger == Trigger::Shutdown;
        outcome.failed_nodes = inner
            .responses
            .iter()
            .filter(|(_, response)| response.error)
            .map(|(node, _)| *node)
            .sorted()
            .collect();

        if outcome.cancelled {
            outcome.rejected.extend(inner.entries.into_keys());
        } else if outcome.timed_out || !outcome.failed_nodes.is_empty() {
            if !outcome.failed_nodes.is_empty() {
                tracing::warn!(
                    round = self.id,
                    nodes = ?outcome.failed_nodes,
                    "[eviction round]: remote nodes failed to process eviction request, backup or near values may be kept"
                );
            }
            if outcome.timed_out {
                tracing::warn!(
                    round = self.id,
                    "[eviction round]: timed out waiting for eviction round, consider increasing `timeout` or `concurrency_level`"
                );
            }
            outcome.rejected.extend(inner.entries.into_keys());
        } else {
            let remote_rejected: HashSet<&K> = inner
                .responses
                .values()
                .flat_map(|response| response.rejected.iter())
                .chain(inner.failed.iter())
                .collect();

            let topology = &*shared.ctx.topology;
            let _guard = TopologyReadGuard::new(topology);

            if topology.version() != inner.topology_version {
                tracing::debug!(
                    round = self.id,
                    from = inner.topology_version,
                    to = topology.version(),
                    "[eviction round]: topology changed, reject remote entries"
                );
                outcome.topology_changed = true;
                outcome.rejected.extend(inner.entries.into_keys());
            } else {
                let ctx = RequestContext::local(topology.local_node());
                let obsolete = shared.ctx.versions.next_version();

                for (key, candidate) in inner.entries {
                    if remote_rejected.contains(&key) {
                        outcome.rejected.push(key);
                        continue;
                    }

                    for node in inner.readers.get(&key).into_iter().flatten() {
                        if let Some(response) = inner.responses.get(node) {
                            if topology.is_alive(*node) {
                                shared.ctx.storage.remove_reader(&key, *node, response.message_id);
                            }
                        }
                    }

                    let guard: EvictGuard<'_, K> = &|entry: &EntryView<K>| candidate.matches(entry);
                    match shared.ctx.storage.evict(&key, Tier::Main, obsolete, Some(guard), &ctx) {
                        Ok(true) => outcome.evicted.push(key),
                        Ok(false) => outcome.rejected.push(key),
                        Err(e) => {
                            tracing::error!(round = self.id, ?key, "[eviction round]: failed to evict entry: {e}");
                            outcome.rejected.push(key);
                        }
                    }
                }
            }
        }

        tracing::debug!(
            round = self.id,
            ?trigger,
            evicted = outcome.evicted.len(),
            rejected = outcome.rejected.len(),
            "[eviction round]: completed"
        );

        let metrics = &shared.metrics;
        metrics.eviction_round_evict.increase(outcome.evicted.len() as u64);
        metrics.eviction_reject.increase(outcome.rejected.len() as u64);
        if outcome.cancelled {
            metrics.round_cancel.increase(1);
        } else if outcome.timed_out {
            metrics.round_timeout.increase(1);
        } else if !outcome.failed_nodes.is_empty() {
            metrics.round_abort.increase(1);
        } else {
            metrics.round_complete.increase(1);
        }
        metrics.round_duration.record(self.created.elapsed().as_secs_f64());

        for key in &outcome.evicted {
            shared.listener.on_evict(key);
        }
        for key in &outcome.rejected {
            shared.listener.on_reject(key);
        }
        if !outcome.cancelled {
            for key in &outcome.rejected {
                shared.resubmit(key);
            }
        }

        let outcome = Arc::new(outcome);
        shared.listener.on_round_completed(&outcome);

        self.release_slot();

        {
            let mut waiters = self.waiters.lock();
            waiters.outcome = Some(outcome.clone());
            for tx in waiters.senders.drain(..) {
                let _ = tx.send(outcome.clone());
            }
        }

        self.state.store(RoundState::Done as u8, Ordering::Release);
    }

    fn release_slot(&self) {
        if self.limited.swap(false, Ordering::AcqRel) {
            self.shared.metrics.round_inflight.decrease(1);
            self.shared.limiter.release();
        }
    }
}
