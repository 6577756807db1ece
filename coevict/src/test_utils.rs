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

//! Utilities for testing.

use std::{
    collections::BTreeMap,
    hash::{BuildHasher, BuildHasherDefault, DefaultHasher},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Instant,
};

use coevict_common::code::{Key, NodeId, PartitionId, TopologyVersion, Version};
use hashbrown::{HashMap, HashSet};
use parking_lot::{
    lock_api::{RawRwLock as _, RawRwLockRecursive as _},
    Mutex, MutexGuard, RawRwLock, RwLock,
};

use crate::{
    context::{
        EntryView, EvictGuard, RequestContext, Storage, Tier, TimeoutService, TimeoutToken, Topology, Transport,
    },
    error::{SendError, StorageError},
    listener::EventListener,
    message::Message,
    policy::{EvictionPolicy, Evictor},
    round::RoundOutcome,
};

/// An eviction applied by [`MemoryStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictRecord<K> {
    /// Evicted key.
    pub key: K,
    /// Tier the key was evicted from.
    pub tier: Tier,
    /// Version the entry was marked obsolete with.
    pub obsolete: Version,
    /// Requester of the eviction.
    pub requester: NodeId,
}

struct MemoryInner<K> {
    main: HashMap<K, EntryView<K>>,
    near: HashMap<K, EntryView<K>>,
    evictions: Vec<EvictRecord<K>>,
    removed_readers: Vec<(K, NodeId, u64)>,
    failing: HashSet<K>,
}

/// An in-memory [`Storage`].
pub struct MemoryStorage<K: Key> {
    inner: Mutex<MemoryInner<K>>,
    partitions: PartitionId,
}

impl<K: Key> MemoryStorage<K> {
    /// Create an empty storage whose unknown keys hash into `partitions` partitions.
    pub fn new(partitions: PartitionId) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                main: HashMap::new(),
                near: HashMap::new(),
                evictions: vec![],
                removed_readers: vec![],
                failing: HashSet::new(),
            }),
            partitions: partitions.max(1),
        }
    }

    /// Insert or replace a main-tier entry.
    pub fn insert(&self, entry: EntryView<K>) {
        self.inner.lock().main.insert(entry.key.clone(), entry);
    }

    /// Insert a plain primary entry.
    pub fn put(&self, key: K, version: Version, partition: PartitionId) {
        self.insert(EntryView::new(key, version, partition));
    }

    /// Insert or replace a near-tier entry.
    pub fn insert_near(&self, entry: EntryView<K>) {
        self.inner.lock().near.insert(entry.key.clone(), entry);
    }

    /// Modify a main-tier entry in place.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut EntryView<K>)) -> bool {
        match self.inner.lock().main.get_mut(key) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Remove a main-tier entry without recording an eviction.
    pub fn remove(&self, key: &K) -> Option<EntryView<K>> {
        self.inner.lock().main.remove(key)
    }

    /// Make every eviction of `key` fail with an error.
    pub fn fail_on(&self, key: K) {
        self.inner.lock().failing.insert(key);
    }

    /// Returns `true` if the main tier holds `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().main.contains_key(key)
    }

    /// Returns `true` if the near tier holds `key`.
    pub fn contains_near(&self, key: &K) -> bool {
        self.inner.lock().near.contains_key(key)
    }

    /// Applied evictions, in order.
    pub fn evictions(&self) -> Vec<EvictRecord<K>> {
        self.inner.lock().evictions.clone()
    }

    /// Reader records removed, in order.
    pub fn removed_readers(&self) -> Vec<(K, NodeId, u64)> {
        self.inner.lock().removed_readers.clone()
    }
}

impl<K: Key> Storage<K> for MemoryStorage<K> {
    fn key_count(&self) -> usize {
        self.inner.lock().main.len()
    }

    fn partition(&self, key: &K) -> PartitionId {
        if let Some(entry) = self.inner.lock().main.get(key) {
            return entry.partition;
        }
        let hash = BuildHasherDefault::<DefaultHasher>::default().hash_one(key);
        (hash % self.partitions as u64) as PartitionId
    }

    fn peek(&self, key: &K) -> Option<EntryView<K>> {
        self.inner.lock().main.get(key).cloned()
    }

    fn evict(
        &self,
        key: &K,
        tier: Tier,
        obsolete: Version,
        guard: Option<EvictGuard<'_, K>>,
        ctx: &RequestContext,
    ) -> std::result::Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(key) {
            return Err(StorageError::Other(format!("injected failure on {key:?}")));
        }
        let map = match tier {
            Tier::Main => &mut inner.main,
            Tier::Near => &mut inner.near,
        };
        let Some(entry) = map.get(key) else {
            return Ok(true);
        };
        if entry.locked {
            return Ok(false);
        }
        if let Some(guard) = guard {
            if !guard(entry) {
                return Ok(false);
            }
        }
        map.remove(key);
        inner.evictions.push(EvictRecord {
            key: key.clone(),
            tier,
            obsolete,
            requester: ctx.requester(),
        });
        Ok(true)
    }

    fn remove_reader(&self, key: &K, node: NodeId, message_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.main.get_mut(key) {
            entry.readers.retain(|reader| *reader != node);
        }
        inner.removed_readers.push((key.clone(), node, message_id));
    }

    fn entries(&self, partition: PartitionId) -> Vec<EntryView<K>> {
        self.inner
            .lock()
            .main
            .values()
            .filter(|entry| entry.partition == partition)
            .cloned()
            .collect()
    }
}

struct TopologyState {
    version: TopologyVersion,
    alive: HashSet<NodeId>,
    owners: HashMap<PartitionId, Vec<NodeId>>,
}

/// A [`Topology`] with explicitly assigned owners.
pub struct StaticTopology {
    local: NodeId,
    state: RwLock<TopologyState>,
    lock: RawRwLock,
}

impl StaticTopology {
    /// Create a topology of `nodes` at version 1, seen from `local`.
    pub fn new(local: NodeId, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut alive: HashSet<NodeId> = nodes.into_iter().collect();
        alive.insert(local);
        Self {
            local,
            state: RwLock::new(TopologyState {
                version: 1,
                alive,
                owners: HashMap::new(),
            }),
            lock: RawRwLock::INIT,
        }
    }

    /// Assign the owners of a partition, the primary first.
    pub fn set_owners(&self, partition: PartitionId, owners: Vec<NodeId>) {
        self.state.write().owners.insert(partition, owners);
    }

    /// Move to the next topology version.
    pub fn bump_version(&self) -> TopologyVersion {
        let mut state = self.state.write();
        state.version += 1;
        state.version
    }

    /// Remove a node from the cluster and from every owner list, moving to the next version.
    pub fn remove_node(&self, node: NodeId) -> TopologyVersion {
        let mut state = self.state.write();
        state.alive.remove(&node);
        for owners in state.owners.values_mut() {
            owners.retain(|owner| *owner != node);
        }
        state.version += 1;
        state.version
    }
}

impl Topology for StaticTopology {
    fn local_node(&self) -> NodeId {
        self.local
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.state.read().alive.contains(&node)
    }

    fn version(&self) -> TopologyVersion {
        self.state.read().version
    }

    fn read_lock(&self) {
        self.lock.lock_shared_recursive();
    }

    fn read_unlock(&self) {
        // SAFETY: paired with `read_lock` by the caller.
        unsafe { self.lock.unlock_shared() }
    }

    fn owners(&self, partition: PartitionId, _: TopologyVersion) -> Vec<NodeId> {
        self.state.read().owners.get(&partition).cloned().unwrap_or_default()
    }

    fn local_partitions(&self) -> Vec<PartitionId> {
        let state = self.state.read();
        let mut partitions = state
            .owners
            .iter()
            .filter(|(_, owners)| owners.first() == Some(&self.local))
            .map(|(partition, _)| *partition)
            .collect::<Vec<_>>();
        partitions.sort_unstable();
        partitions
    }
}

/// A [`Transport`] that records every sent message.
pub struct RecordingTransport<K: Key> {
    sent: Mutex<Vec<(NodeId, Message<K>)>>,
    unreachable: Mutex<HashSet<NodeId>>,
    failing: Mutex<HashSet<NodeId>>,
}

impl<K: Key> Default for RecordingTransport<K> {
    fn default() -> Self {
        Self {
            sent: Mutex::new(vec![]),
            unreachable: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }
}

impl<K: Key> RecordingTransport<K> {
    /// Report sends to `node` as unreachable.
    pub fn set_unreachable(&self, node: NodeId) {
        self.unreachable.lock().insert(node);
    }

    /// Fail sends to `node` with a generic error.
    pub fn set_failing(&self, node: NodeId) {
        self.failing.lock().insert(node);
    }

    /// All sent messages.
    pub fn sent(&self) -> MutexGuard<'_, Vec<(NodeId, Message<K>)>> {
        self.sent.lock()
    }

    /// Take all sent messages.
    pub fn take(&self) -> Vec<(NodeId, Message<K>)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl<K: Key> Transport<K> for RecordingTransport<K> {
    fn send(&self, node: NodeId, message: Message<K>) -> std::result::Result<(), SendError> {
        if self.unreachable.lock().contains(&node) {
            return Err(SendError::Unreachable(node));
        }
        if self.failing.lock().contains(&node) {
            return Err(SendError::Other("injected failure".to_string()));
        }
        self.sent.lock().push((node, message));
        Ok(())
    }
}

type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct PendingTimeout {
    id: u64,
    deadline: Instant,
    callback: TimeoutCallback,
}

/// A [`TimeoutService`] whose timeouts only fire on demand.
#[derive(Default)]
pub struct ManualTimer {
    next: AtomicU64,
    pending: Mutex<BTreeMap<TimeoutToken, PendingTimeout>>,
}

impl ManualTimer {
    /// Round ids of the pending timeouts, ascending.
    pub fn pending(&self) -> Vec<u64> {
        let mut ids = self.pending.lock().values().map(|timeout| timeout.id).collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Deadline of a pending timeout of round `id`.
    pub fn deadline(&self, id: u64) -> Option<Instant> {
        self.pending
            .lock()
            .values()
            .find(|timeout| timeout.id == id)
            .map(|timeout| timeout.deadline)
    }

    /// Fire the pending timeouts of round `id`.
    pub fn fire(&self, id: u64) -> bool {
        let fired = {
            let mut pending = self.pending.lock();
            let tokens = pending
                .iter()
                .filter(|(_, timeout)| timeout.id == id)
                .map(|(token, _)| *token)
                .collect::<Vec<_>>();
            tokens
                .into_iter()
                .filter_map(|token| pending.remove(&token))
                .collect::<Vec<_>>()
        };
        let any = !fired.is_empty();
        for timeout in fired {
            (timeout.callback)();
        }
        any
    }

    /// Fire every pending timeout, returning how many fired.
    pub fn fire_all(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let count = pending.len();
        for timeout in pending.into_values() {
            (timeout.callback)();
        }
        count
    }
}

impl TimeoutService for ManualTimer {
    fn add_timeout(&self, id: u64, deadline: Instant, on_timeout: Box<dyn FnOnce() + Send>) -> TimeoutToken {
        let token = TimeoutToken(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.pending.lock().insert(
            token,
            PendingTimeout {
                id,
                deadline,
                callback: on_timeout,
            },
        );
        token
    }

    fn remove_timeout(&self, token: TimeoutToken) {
        self.pending.lock().remove(&token);
    }
}

/// An [`EvictionPolicy`] that records every notification.
///
/// With `evict_on_access` it asks for every live entry it hears about to be evicted.
pub struct RecordingPolicy<K: Key> {
    accessed: Mutex<Vec<(K, bool)>>,
    evict_on_access: AtomicBool,
}

impl<K: Key> Default for RecordingPolicy<K> {
    fn default() -> Self {
        Self {
            accessed: Mutex::new(vec![]),
            evict_on_access: AtomicBool::new(false),
        }
    }
}

impl<K: Key> RecordingPolicy<K> {
    /// Create a policy that evicts every live entry it is notified about.
    pub fn evicting() -> Self {
        let policy = Self::default();
        policy.set_evict_on_access(true);
        policy
    }

    /// Toggle eviction on access.
    pub fn set_evict_on_access(&self, evict: bool) {
        self.evict_on_access.store(evict, Ordering::Relaxed);
    }

    /// All notifications, in order.
    pub fn accessed(&self) -> Vec<(K, bool)> {
        self.accessed.lock().clone()
    }

    /// Count of notifications about `key`.
    pub fn count(&self, key: &K) -> usize {
        self.accessed.lock().iter().filter(|(k, _)| k == key).count()
    }

    /// Forget the recorded notifications.
    pub fn clear(&self) {
        self.accessed.lock().clear();
    }
}

impl<K: Key> EvictionPolicy<K> for RecordingPolicy<K> {
    fn on_entry_accessed(&self, evicted: bool, entry: &EntryView<K>, evictor: &dyn Evictor<K>) {
        self.accessed.lock().push((entry.key.clone(), evicted));
        if !evicted && self.evict_on_access.load(Ordering::Relaxed) {
            evictor.evict(&entry.key, None, false, None);
        }
    }
}

/// An [`EventListener`] that records every event.
pub struct Recorder<K: Key> {
    evicted: Mutex<Vec<K>>,
    rejected: Mutex<Vec<K>>,
    outcomes: Mutex<Vec<RoundOutcome<K>>>,
}

impl<K: Key> Default for Recorder<K> {
    fn default() -> Self {
        Self {
            evicted: Mutex::new(vec![]),
            rejected: Mutex::new(vec![]),
            outcomes: Mutex::new(vec![]),
        }
    }
}

impl<K: Key> Recorder<K> {
    /// Evicted keys, in order.
    pub fn evicted(&self) -> Vec<K> {
        self.evicted.lock().clone()
    }

    /// Rejected keys, in order.
    pub fn rejected(&self) -> Vec<K> {
        self.rejected.lock().clone()
    }

    /// Completed round outcomes, in order.
    pub fn outcomes(&self) -> Vec<RoundOutcome<K>> {
        self.outcomes.lock().clone()
    }
}

impl<K: Key> EventListener<K> for Recorder<K> {
    fn on_evict(&self, key: &K) {
        self.evicted.lock().push(key.clone());
    }

    fn on_reject(&self, key: &K) {
        self.rejected.lock().push(key.clone());
    }

    fn on_round_completed(&self, outcome: &RoundOutcome<K>) {
        self.outcomes.lock().push(outcome.clone());
    }
}
