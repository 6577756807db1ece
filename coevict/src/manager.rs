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

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use coevict_common::{
    code::{Key, NodeId, TopologyVersion, Version},
    metrics::{registry::noop::NoopMetricsRegistry, BoxedRegistry, Metrics},
};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    buffer::{Candidate, EvictionBuffer},
    config::{CacheMode, EvictionConfig},
    context::{EntryView, EvictGuard, EvictionContext, RequestContext, Tier},
    dispatcher::Dispatcher,
    error::Result,
    handler,
    limiter::RoundLimiter,
    listener::{DefaultEventListener, EventListener},
    message::Message,
    policy::{EntryFilter, EvictionFilter, Evictor},
    reconcile::{ReconcileWorker, TopologyEvent},
    round::{Round, RoundWaiter, Trigger},
};

/// Keys touched by a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSummary<K> {
    /// Keys read or written by the transaction.
    pub keys: Vec<K>,
    /// Internal (system) transaction.
    pub internal: bool,
    /// The transaction was started on the local node.
    pub local: bool,
}

/// Point-in-time statistics of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvictionStats {
    /// Candidates waiting in the eviction buffer.
    pub buffered: usize,
    /// Rounds dispatched and awaiting completion.
    pub inflight: usize,
    /// Rounds created since start.
    pub rounds_created: u64,
}

pub(crate) struct Shared<K: Key> {
    pub config: EvictionConfig,
    backup_sync: bool,
    near_sync: bool,

    pub ctx: EvictionContext<K>,
    pub buffer: EvictionBuffer<K>,
    pub dispatcher: Dispatcher<K>,
    /// Prepared rounds by id.
    pub registry: Mutex<HashMap<u64, Arc<Round<K>>>>,
    pub limiter: RoundLimiter,

    pub filter: Option<Arc<dyn EvictionFilter<K>>>,
    pub listener: Arc<dyn EventListener<K>>,
    pub metrics: Arc<Metrics>,

    closed: AtomicBool,
    message_ids: AtomicU64,
    worker: Mutex<Option<ReconcileWorker>>,
}

impl<K: Key> Shared<K> {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn next_message_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sync_any(&self) -> bool {
        self.backup_sync || self.near_sync
    }

    /// Remote backup holders and near readers of an entry at the given topology version.
    pub fn participants(
        &self,
        entry: &EntryView<K>,
        topology_version: TopologyVersion,
        local: NodeId,
    ) -> (Vec<NodeId>, Vec<NodeId>) {
        let backups = if self.backup_sync {
            self.ctx
                .topology
                .owners(entry.partition, topology_version)
                .into_iter()
                .filter(|node| *node != local)
                .collect()
        } else {
            vec![]
        };
        let readers = if self.near_sync {
            entry.readers.iter().copied().filter(|node| *node != local).collect()
        } else {
            vec![]
        };
        (backups, readers)
    }

    /// Forward an access to the eviction policy, unless the filter protects the entry.
    pub fn notify_policy(&self, entry: &EntryView<K>) {
        if let Some(filter) = &self.filter {
            if !filter.evict_allowed(entry) {
                tracing::trace!(key = ?entry.key, "[eviction]: entry is protected by filter");
                return;
            }
        }
        self.ctx.policy.on_entry_accessed(entry.obsolete, entry, self);
    }

    /// Hand an entry rejected by a round back to the policy.
    pub fn resubmit(&self, key: &K) {
        if !self.config.policy_enabled {
            return;
        }
        if let Some(entry) = self.ctx.storage.peek(key) {
            self.metrics.eviction_resubmit.increase(1);
            self.notify_policy(&entry);
        }
    }

    fn touch(&self, key: &K) -> Result<()> {
        if self.is_closed() || !self.config.policy_enabled {
            return Ok(());
        }

        let Some(entry) = self.ctx.storage.peek(key) else {
            return Ok(());
        };
        if entry.internal {
            return Ok(());
        }
        if self.backup_sync
            && self.config.mode == CacheMode::Partitioned
            && !self
                .ctx
                .topology
                .is_primary(self.ctx.topology.local_node(), entry.partition)
        {
            // Backups are evicted by their primary.
            return Ok(());
        }

        self.wait_for_admission()?;
        self.notify_policy(&entry);
        Ok(())
    }

    fn wait_for_admission(&self) -> Result<()> {
        if !self.sync_any() {
            return Ok(());
        }
        let start = Instant::now();
        self.limiter.wait(self.config.admission_poll_interval)?;
        self.metrics
            .admission_wait_duration
            .record(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn evict_unsynchronized(&self, key: &K, obsolete: Option<Version>, filter: Option<EntryFilter<K>>) -> bool {
        let obsolete = obsolete.unwrap_or_else(|| self.ctx.versions.next_version());
        let ctx = RequestContext::local(self.ctx.topology.local_node());
        let res = match &filter {
            Some(filter) => {
                let guard: EvictGuard<'_, K> = &|entry: &EntryView<K>| filter(entry);
                self.ctx.storage.evict(key, Tier::Main, obsolete, Some(guard), &ctx)
            }
            None => self.ctx.storage.evict(key, Tier::Main, obsolete, None, &ctx),
        };
        match res {
            Ok(true) => {
                self.metrics.eviction_local_evict.increase(1);
                self.listener.on_evict(key);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!(?key, "[eviction]: failed to evict entry: {e}");
                false
            }
        }
    }
}

impl<K: Key> Evictor<K> for Shared<K> {
    fn evict(&self, key: &K, obsolete: Option<Version>, explicit: bool, filter: Option<EntryFilter<K>>) -> bool {
        let Some(entry) = self.ctx.storage.peek(key) else {
            return true;
        };
        if entry.internal {
            return false;
        }

        if !self.sync_any() {
            return self.evict_unsynchronized(key, obsolete, filter);
        }

        if self.backup_sync && entry.backup {
            // Backups leave together with their primary.
            return !explicit;
        }
        if let Some(filter) = &filter {
            if !filter(&entry) {
                return false;
            }
        }
        if entry.locked {
            return false;
        }

        let candidate = Candidate {
            key: key.clone(),
            version: entry.version,
            filter,
        };
        if self.buffer.push(candidate) {
            tracing::trace!(?key, version = %entry.version, "[eviction]: buffer candidate");
            self.metrics.eviction_enqueue.increase(1);
            self.metrics.buffer_size.absolute(self.buffer.len() as u64);
        } else {
            self.metrics.eviction_dedup.increase(1);
        }
        true
    }
}

/// Synchronized eviction coordinator of one cache on one node.
///
/// The coordinator is closed on drop.
pub struct EvictionManager<K: Key> {
    shared: Arc<Shared<K>>,
}

impl<K: Key> Debug for EvictionManager<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionManager")
            .field("name", &self.shared.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<K: Key> EvictionManager<K> {
    /// The effective configuration.
    pub fn config(&self) -> &EvictionConfig {
        &self.shared.config
    }

    /// Notify the policy that the entry of `key` has been accessed or updated.
    ///
    /// Blocks while the count of in-flight rounds is at the ceiling. Fails only with
    /// [`Error::Interrupted`](crate::Error::Interrupted) if the coordinator closes meanwhile.
    pub fn touch(&self, key: &K) -> Result<()> {
        self.shared.touch(key)
    }

    /// Notify the policy about every entry of a finished transaction.
    pub fn on_tx_finished(&self, tx: &TxSummary<K>) -> Result<()> {
        if tx.internal {
            return Ok(());
        }
        if self.shared.backup_sync && !tx.local {
            // The originating node touches the entries.
            return Ok(());
        }
        for key in &tx.keys {
            self.shared.touch(key)?;
        }
        Ok(())
    }

    /// Request eviction of `key`.
    ///
    /// Without synchronization the entry is evicted right away. Otherwise it is buffered for the next round and
    /// `true` means it is tracked, not that it is gone.
    pub fn evict(&self, key: &K, obsolete: Option<Version>, explicit: bool, filter: Option<EntryFilter<K>>) -> bool {
        self.shared.evict(key, obsolete, explicit, filter)
    }

    /// Batch buffered candidates into a round once the buffer reaches the batch threshold.
    ///
    /// Returns the count of candidates handed to the dispatcher. Meant to be called once per worker loop.
    pub fn unwind(&self) -> usize {
        let shared = &self.shared;
        if shared.is_closed() || !shared.sync_any() {
            return 0;
        }

        let max_batch = shared.config.max_batch(shared.ctx.storage.key_count());
        if shared.buffer.len() < max_batch {
            return 0;
        }

        let batch = shared.buffer.drain(max_batch);
        shared.metrics.buffer_size.absolute(shared.buffer.len() as u64);
        let count = batch.len();
        if count > 0 {
            tracing::debug!(count, max_batch, "[eviction]: dispatch buffered candidates");
            shared.dispatcher.add_batch(shared, batch, max_batch);
        }
        count
    }

    /// Handle a protocol message received from `from`.
    pub fn on_message(&self, from: NodeId, message: Message<K>) {
        if self.shared.is_closed() {
            return;
        }
        match message {
            Message::Request(request) => handler::handle_request(&self.shared, from, request),
            Message::Response(response) => {
                let round = self.shared.registry.lock().get(&response.round_id).cloned();
                match round {
                    Some(round) => round.on_response(from, response),
                    None => tracing::debug!(
                        %from,
                        round = response.round_id,
                        "[eviction]: response for unknown round, it may have completed already"
                    ),
                }
            }
        }
    }

    /// Handle a membership change.
    pub fn on_topology_event(&self, event: TopologyEvent) {
        if self.shared.is_closed() {
            return;
        }
        if event.is_departure() {
            let rounds = self.shared.registry.lock().values().cloned().collect::<Vec<_>>();
            for round in rounds {
                round.on_node_left(event.node);
            }
        }
        if let Some(worker) = &*self.shared.worker.lock() {
            worker.notify(event);
        }
    }

    /// Subscribe to the outcome of an in-flight round.
    pub fn subscribe(&self, round_id: u64) -> Option<RoundWaiter<K>> {
        self.shared.registry.lock().get(&round_id).map(|round| round.subscribe())
    }

    /// Ids of the in-flight rounds, ascending.
    pub fn inflight_rounds(&self) -> Vec<u64> {
        let mut ids = self.shared.registry.lock().keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Returns `true` if `key` is buffered or batched into a round that has not been prepared yet.
    pub fn is_pending(&self, key: &K) -> bool {
        self.shared.buffer.is_marked(key)
    }

    /// Count of buffered candidates.
    pub fn queue_size(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> EvictionStats {
        EvictionStats {
            buffered: self.shared.buffer.len(),
            inflight: self.shared.limiter.active(),
            rounds_created: self.shared.dispatcher.created(),
        }
    }

    /// Stop the coordinator.
    ///
    /// Waiters blocked on round admission are interrupted, and every round that has not completed is cancelled with
    /// all of its candidates rejected.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(name = %shared.config.name, "[eviction]: closing");

        shared.limiter.close();

        let worker = shared.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }

        let rounds = shared.registry.lock().values().cloned().collect::<Vec<_>>();
        for round in rounds {
            round.complete(Trigger::Shutdown);
        }
        if let Some(round) = shared.dispatcher.take_current() {
            round.complete(Trigger::Shutdown);
        }
    }
}

impl<K: Key> Drop for EvictionManager<K> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Builder of an [`EvictionManager`].
pub struct EvictionManagerBuilder<K: Key> {
    config: EvictionConfig,
    filter: Option<Arc<dyn EvictionFilter<K>>>,
    listener: Arc<dyn EventListener<K>>,
    registry: BoxedRegistry,
}

impl<K: Key> Default for EvictionManagerBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> EvictionManagerBuilder<K> {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: EvictionConfig::default(),
            filter: None,
            listener: Arc::new(DefaultEventListener::default()),
            registry: Box::new(NoopMetricsRegistry),
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: EvictionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cache name, used in logs and metrics labels.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the cache mode.
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Enable or disable the eviction policy.
    pub fn with_policy_enabled(mut self, enabled: bool) -> Self {
        self.config.policy_enabled = enabled;
        self
    }

    /// Synchronize eviction of backup copies.
    pub fn with_synchronized(mut self, synchronized: bool) -> Self {
        self.config.synchronized = synchronized;
        self
    }

    /// Synchronize eviction of near-cache reader copies.
    pub fn with_near_synchronized(mut self, synchronized: bool) -> Self {
        self.config.near_synchronized = synchronized;
        self
    }

    /// Declare whether near caches are enabled.
    pub fn with_near_enabled(mut self, enabled: bool) -> Self {
        self.config.near_enabled = enabled;
        self
    }

    /// Declare whether evicted entries are swapped out.
    pub fn with_swap_enabled(mut self, enabled: bool) -> Self {
        self.config.swap_enabled = enabled;
        self
    }

    /// Set the overflow ratio in percent of the local key count.
    pub fn with_max_overflow_ratio(mut self, ratio: f64) -> Self {
        self.config.max_overflow_ratio = ratio;
        self
    }

    /// Set the upper bound of a batch.
    pub fn with_key_buffer_size(mut self, size: usize) -> Self {
        self.config.key_buffer_size = size;
        self
    }

    /// Set the lower bound of the computed batch size.
    pub fn with_batch_floor(mut self, floor: usize) -> Self {
        self.config.batch_floor = floor;
        self
    }

    /// Set the ceiling of in-flight rounds.
    pub fn with_concurrency_level(mut self, level: usize) -> Self {
        self.config.concurrency_level = level;
        self
    }

    /// Set the round timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set how often blocked producers re-check shutdown.
    pub fn with_admission_poll_interval(mut self, interval: Duration) -> Self {
        self.config.admission_poll_interval = interval;
        self
    }

    /// Set how often the reconciliation worker re-checks shutdown.
    pub fn with_reconcile_poll_interval(mut self, interval: Duration) -> Self {
        self.config.reconcile_poll_interval = interval;
        self
    }

    /// Protect entries from eviction.
    pub fn with_filter(mut self, filter: impl EvictionFilter<K>) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Receive eviction events.
    pub fn with_event_listener(mut self, listener: Arc<dyn EventListener<K>>) -> Self {
        self.listener = listener;
        self
    }

    /// Register metrics to the given registry.
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Validate the configuration and start the coordinator.
    pub fn build(self, ctx: EvictionContext<K>) -> Result<EvictionManager<K>> {
        let config = self.config;
        config.validate()?;
        config.warn_unsynchronized();

        let metrics = Arc::new(Metrics::new(config.name.clone(), &*self.registry));
        let backup_sync = config.backup_sync();
        let near_sync = config.near_sync();
        let start_worker = backup_sync && config.mode == CacheMode::Partitioned && config.policy_enabled;

        tracing::debug!(
            name = %config.name,
            backup_sync,
            near_sync,
            "[eviction]: start eviction manager"
        );

        let shared = Arc::new(Shared {
            limiter: RoundLimiter::new(config.concurrency_level),
            backup_sync,
            near_sync,
            ctx,
            buffer: EvictionBuffer::default(),
            dispatcher: Dispatcher::default(),
            registry: Mutex::new(HashMap::new()),
            filter: self.filter,
            listener: self.listener,
            metrics,
            closed: AtomicBool::new(false),
            message_ids: AtomicU64::new(0),
            worker: Mutex::new(None),
            config,
        });

        if start_worker {
            let worker = ReconcileWorker::spawn(
                &shared.config.name,
                Arc::downgrade(&shared),
                shared.config.reconcile_poll_interval,
            )?;
            *shared.worker.lock() = Some(worker);
        }

        Ok(EvictionManager { shared })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicUsize, Barrier},
        thread,
    };

    use coevict_common::code::PartitionId;
    use itertools::Itertools;

    use super::*;
    use crate::{
        context::{Preloader, Topology},
        error::Error,
        message::{EvictionRequest, EvictionResponse},
        test_utils::{ManualTimer, MemoryStorage, Recorder, RecordingPolicy, RecordingTransport, StaticTopology},
    };

    const LOCAL: NodeId = NodeId(1);
    const REMOTE: NodeId = NodeId(2);
    const OTHER: NodeId = NodeId(3);

    struct Harness {
        storage: Arc<MemoryStorage<u64>>,
        topology: Arc<StaticTopology>,
        transport: Arc<RecordingTransport<u64>>,
        timer: Arc<ManualTimer>,
        policy: Arc<RecordingPolicy<u64>>,
        recorder: Arc<Recorder<u64>>,
        manager: EvictionManager<u64>,
    }

    impl Harness {
        fn requests(&self) -> Vec<(NodeId, EvictionRequest<u64>)> {
            self.transport
                .take()
                .into_iter()
                .filter_map(|(node, message)| match message {
                    Message::Request(request) => Some((node, request)),
                    Message::Response(_) => None,
                })
                .collect()
        }

        fn responses(&self) -> Vec<(NodeId, EvictionResponse<u64>)> {
            self.transport
                .take()
                .into_iter()
                .filter_map(|(node, message)| match message {
                    Message::Response(response) => Some((node, response)),
                    Message::Request(_) => None,
                })
                .collect()
        }

        fn respond(&self, from: NodeId, round_id: u64, rejected: Vec<u64>, error: bool) {
            self.manager.on_message(
                from,
                Message::Response(EvictionResponse {
                    round_id,
                    rejected,
                    error,
                    message_id: 42,
                }),
            );
        }
    }

    fn harness(builder: EvictionManagerBuilder<u64>) -> Harness {
        harness_with(builder, |ctx| ctx)
    }

    fn harness_with(
        builder: EvictionManagerBuilder<u64>,
        f: impl FnOnce(EvictionContext<u64>) -> EvictionContext<u64>,
    ) -> Harness {
        let storage = Arc::new(MemoryStorage::new(4));
        let topology = Arc::new(StaticTopology::new(LOCAL, [REMOTE, OTHER]));
        let transport = Arc::new(RecordingTransport::default());
        let timer = Arc::new(ManualTimer::default());
        let policy = Arc::new(RecordingPolicy::default());
        let recorder = Arc::new(Recorder::default());
        let ctx = EvictionContext::new(
            storage.clone(),
            topology.clone(),
            transport.clone(),
            timer.clone(),
            policy.clone(),
        );
        let manager = builder
            .with_event_listener(recorder.clone())
            .build(f(ctx))
            .unwrap();
        Harness {
            storage,
            topology,
            transport,
            timer,
            policy,
            recorder,
            manager,
        }
    }

    /// Synchronized backup eviction on a replicated cache, one candidate per round.
    fn synchronized() -> EvictionManagerBuilder<u64> {
        EvictionManagerBuilder::new()
            .with_name("test")
            .with_mode(CacheMode::Replicated)
            .with_synchronized(true)
            .with_key_buffer_size(1)
            .with_admission_poll_interval(Duration::from_millis(10))
            .with_reconcile_poll_interval(Duration::from_millis(10))
    }

    #[test_log::test]
    fn test_idempotent_admission() {
        let h = harness(synchronized().with_key_buffer_size(10));
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);

        assert!(h.manager.evict(&1, None, false, None));
        assert!(h.manager.evict(&1, None, false, None));
        assert_eq!(h.manager.queue_size(), 1);
        assert!(h.manager.is_pending(&1));
    }

    #[test_log::test]
    fn test_local_only_fast_path() {
        let h = harness(synchronized().with_key_buffer_size(3));
        h.topology.set_owners(0, vec![LOCAL]);
        for key in 1..=3 {
            h.storage.put(key, Version(1), 0);
        }

        for key in 1..=3 {
            assert!(h.manager.evict(&key, None, false, None));
        }
        assert_eq!(h.manager.unwind(), 3);

        let outcomes = h.recorder.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].evicted.iter().copied().sorted().collect_vec(), vec![1, 2, 3]);
        assert!(outcomes[0].rejected.is_empty());
        assert!(h.transport.sent().is_empty());
        assert!(h.manager.inflight_rounds().is_empty());
        assert!(h.timer.pending().is_empty());
        assert_eq!(h.manager.stats().inflight, 0);
        for key in 1..=3 {
            assert!(!h.storage.contains(&key));
            assert!(!h.manager.is_pending(&key));
        }
    }

    #[test_log::test]
    fn test_unwind_waits_for_threshold() {
        let h = harness(synchronized().with_key_buffer_size(2));
        h.topology.set_owners(0, vec![LOCAL]);
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        assert_eq!(h.manager.unwind(), 0);
        assert_eq!(h.manager.queue_size(), 1);

        h.manager.evict(&2, None, false, None);
        assert_eq!(h.manager.unwind(), 2);
        assert_eq!(h.manager.queue_size(), 0);
        assert_eq!(h.recorder.evicted().len(), 2);
    }

    #[test_log::test]
    fn test_local_version_guard() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL]);
        h.storage.put(1, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        h.storage.update(&1, |entry| entry.version = Version(2));
        h.manager.unwind();

        assert!(h.storage.contains(&1));
        assert_eq!(h.recorder.rejected(), vec![1]);
        assert_eq!(h.policy.count(&1), 1);
        assert!(h.transport.sent().is_empty());
    }

    #[test_log::test]
    fn test_remote_accept_evicts() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(3), 0);

        h.manager.evict(&1, None, false, None);
        assert_eq!(h.manager.unwind(), 1);

        let requests = h.requests();
        assert_eq!(requests.len(), 1);
        let (node, request) = &requests[0];
        assert_eq!(*node, REMOTE);
        assert_eq!(request.entries.len(), 1);
        assert_eq!(request.entries[0].key, 1);
        assert_eq!(request.entries[0].version, Version(3));
        assert!(!request.entries[0].near);
        assert_eq!(request.topology_version, h.topology.version());

        assert_eq!(h.manager.inflight_rounds(), vec![request.round_id]);
        assert_eq!(h.timer.pending(), vec![request.round_id]);
        assert_eq!(h.manager.stats().inflight, 1);
        let mut waiter = h.manager.subscribe(request.round_id).unwrap();

        h.respond(REMOTE, request.round_id, vec![], false);

        assert!(!h.storage.contains(&1));
        assert_eq!(h.recorder.evicted(), vec![1]);
        assert!(h.manager.inflight_rounds().is_empty());
        assert!(h.timer.pending().is_empty());
        assert_eq!(h.manager.stats().inflight, 0);

        let outcome = waiter.try_recv().unwrap();
        assert!(outcome.is_evicted(&1));
        assert_eq!(h.policy.count(&1), 0);
    }

    #[test_log::test]
    fn test_remote_rejected_resubmitted_once() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        h.manager.unwind();
        let (_, request) = h.requests().pop().unwrap();

        h.respond(REMOTE, request.round_id, vec![1], false);
        // A duplicate response after completion is ignored.
        h.respond(REMOTE, request.round_id, vec![1], false);

        assert!(h.storage.contains(&1));
        assert_eq!(h.recorder.rejected(), vec![1]);
        assert_eq!(h.recorder.outcomes().len(), 1);
        assert_eq!(h.policy.count(&1), 1);
    }

    #[test_log::test]
    fn test_version_changed_before_finalize() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        h.manager.unwind();
        let (_, request) = h.requests().pop().unwrap();

        h.storage.update(&1, |entry| entry.version = Version(2));
        h.respond(REMOTE, request.round_id, vec![], false);

        assert!(h.storage.contains(&1));
        let outcome = h.recorder.outcomes().pop().unwrap();
        assert!(outcome.is_rejected(&1));
        assert!(!outcome.is_evicted(&1));
    }

    #[test_log::test]
    fn test_filter_rechecked_before_finalize() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);

        let filter: EntryFilter<u64> = Arc::new(|entry: &EntryView<u64>| entry.readers.is_empty());
        assert!(h.manager.evict(&1, None, false, Some(filter)));
        h.manager.unwind();
        let (_, request) = h.requests().pop().unwrap();

        h.storage.update(&1, |entry| entry.readers = vec![OTHER]);
        h.respond(REMOTE, request.round_id, vec![], false);

        assert!(h.storage.contains(&1));
        assert_eq!(h.recorder.rejected(), vec![1]);
    }

    #[test_log::test]
    fn test_timeout_rejects_round() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        let dispatched = Instant::now();
        h.manager.unwind();
        let (_, request) = h.requests().pop().unwrap();
        let deadline = h.timer.deadline(request.round_id).unwrap();
        assert!(deadline >= dispatched + h.manager.config().timeout);
        assert!(deadline <= Instant::now() + h.manager.config().timeout);

        assert_eq!(h.timer.fire_all(), 1);

        let outcome = h.recorder.outcomes().pop().unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.rejected, vec![1]);
        assert!(h.storage.contains(&1));
        assert_eq!(h.policy.count(&1), 1);
        assert!(h.manager.inflight_rounds().is_empty());

        // Late response.
        h.respond(REMOTE, request.round_id, vec![], false);
        assert_eq!(h.recorder.outcomes().len(), 1);
    }

    #[test_log::test]
    fn test_error_response_rejects_whole_round() {
        let h = harness(synchronized().with_key_buffer_size(2));
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.topology.set_owners(1, vec![LOCAL, OTHER]);
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 1);

        h.manager.evict(&1, None, false, None);
        h.manager.evict(&2, None, false, None);
        h.manager.unwind();
        let requests = h.requests();
        assert_eq!(requests.len(), 2);
        let round_id = requests[0].1.round_id;

        h.respond(OTHER, round_id, vec![], false);
        assert!(h.recorder.outcomes().is_empty());
        h.respond(REMOTE, round_id, vec![], true);

        let outcome = h.recorder.outcomes().pop().unwrap();
        assert_eq!(outcome.failed_nodes, vec![REMOTE]);
        assert_eq!(outcome.rejected.iter().copied().sorted().collect_vec(), vec![1, 2]);
        assert!(h.storage.contains(&1));
        assert!(h.storage.contains(&2));
    }

    #[test_log::test]
    fn test_node_left_with_topology_change() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        h.manager.unwind();
        assert_eq!(h.requests().len(), 1);

        h.topology.remove_node(REMOTE);
        h.manager.on_topology_event(TopologyEvent::left(REMOTE));

        let outcome = h.recorder.outcomes().pop().unwrap();
        assert!(outcome.topology_changed);
        assert_eq!(outcome.rejected, vec![1]);
        assert_eq!(h.policy.count(&1), 1);
    }

    #[test_log::test]
    fn test_unreachable_participant_is_dropped() {
        let h = harness(synchronized());
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);
        h.transport.set_unreachable(REMOTE);

        h.manager.evict(&1, None, false, None);
        h.manager.unwind();

        assert!(h.transport.sent().is_empty());
        assert!(h.timer.pending().is_empty());
        assert_eq!(h.recorder.evicted(), vec![1]);
        assert!(!h.storage.contains(&1));
    }

    #[test_log::test]
    fn test_send_failure_rejects_node_keys() {
        let h = harness(synchronized().with_key_buffer_size(2));
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.topology.set_owners(1, vec![LOCAL, OTHER]);
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 1);
        h.transport.set_failing(REMOTE);

        h.manager.evict(&1, None, false, None);
        h.manager.evict(&2, None, false, None);
        h.manager.unwind();

        let requests = h.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, OTHER);
        h.respond(OTHER, requests[0].1.round_id, vec![], false);

        let outcome = h.recorder.outcomes().pop().unwrap();
        assert_eq!(outcome.evicted, vec![2]);
        assert_eq!(outcome.rejected, vec![1]);
    }

    #[test_log::test]
    fn test_at_most_one_completion() {
        for _ in 0..20 {
            let h = harness(synchronized().with_key_buffer_size(3));
            h.topology.set_owners(0, vec![LOCAL, REMOTE]);
            for key in 1..=3 {
                h.storage.put(key, Version(1), 0);
                h.manager.evict(&key, None, false, None);
            }
            h.manager.unwind();
            let (_, request) = h.requests().pop().unwrap();

            let barrier = Barrier::new(3);
            thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    h.respond(REMOTE, request.round_id, vec![2], false);
                });
                s.spawn(|| {
                    barrier.wait();
                    h.manager.on_topology_event(TopologyEvent::failed(REMOTE));
                });
                s.spawn(|| {
                    barrier.wait();
                    h.timer.fire_all();
                });
            });

            let outcomes = h.recorder.outcomes();
            assert_eq!(outcomes.len(), 1);
            let outcome = &outcomes[0];
            let all = outcome
                .evicted
                .iter()
                .chain(outcome.rejected.iter())
                .copied()
                .sorted()
                .collect_vec();
            assert_eq!(all, vec![1, 2, 3]);
            assert_eq!(h.manager.stats().inflight, 0);
        }
    }

    #[test_log::test]
    fn test_back_pressure() {
        let h = harness(synchronized().with_concurrency_level(1));
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        h.manager.unwind();
        let (_, request) = h.requests().pop().unwrap();
        assert_eq!(h.manager.stats().inflight, 1);

        let touched = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                h.manager.touch(&2).unwrap();
                touched.store(true, Ordering::SeqCst);
            });

            thread::sleep(Duration::from_millis(100));
            assert!(!touched.load(Ordering::SeqCst));
            assert_eq!(h.manager.stats().inflight, 1);

            h.respond(REMOTE, request.round_id, vec![], false);
        });

        assert!(touched.load(Ordering::SeqCst));
        assert_eq!(h.policy.count(&2), 1);
    }

    #[test_log::test]
    fn test_close_interrupts_admission_and_cancels_rounds() {
        let h = harness(synchronized().with_concurrency_level(1));
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);

        h.manager.evict(&1, None, false, None);
        h.manager.unwind();
        assert_eq!(h.manager.inflight_rounds().len(), 1);

        thread::scope(|s| {
            let blocked = s.spawn(|| h.manager.touch(&2));
            thread::sleep(Duration::from_millis(50));
            h.manager.close();
            assert!(matches!(blocked.join().unwrap(), Err(Error::Interrupted)));
        });

        let outcome = h.recorder.outcomes().pop().unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.rejected, vec![1]);
        // Cancelled entries are not handed back to the policy.
        assert_eq!(h.policy.count(&1), 0);
        assert!(h.manager.inflight_rounds().is_empty());
        assert!(h.timer.pending().is_empty());
    }

    #[test_log::test]
    fn test_unsynchronized_evicts_immediately() {
        let h = harness(EvictionManagerBuilder::new());
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);
        h.storage.update(&2, |entry| entry.locked = true);

        assert!(h.manager.evict(&1, Some(Version(9)), true, None));
        assert!(!h.manager.evict(&2, None, true, None));
        // Absent entries count as evicted.
        assert!(h.manager.evict(&3, None, true, None));

        assert_eq!(h.manager.queue_size(), 0);
        assert_eq!(h.recorder.evicted(), vec![1]);
        let evictions = h.storage.evictions();
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].obsolete, Version(9));
        assert_eq!(evictions[0].requester, LOCAL);
    }

    #[test_log::test]
    fn test_admission_guards() {
        let h = harness(synchronized().with_key_buffer_size(10));
        h.storage.put(1, Version(1), 0);
        h.storage.update(&1, |entry| entry.internal = true);
        h.storage.put(2, Version(1), 0);
        h.storage.update(&2, |entry| entry.backup = true);
        h.storage.put(3, Version(1), 0);
        h.storage.update(&3, |entry| entry.locked = true);
        h.storage.put(4, Version(1), 0);

        assert!(!h.manager.evict(&1, None, false, None));
        assert!(h.manager.evict(&2, None, false, None));
        assert!(!h.manager.evict(&2, None, true, None));
        assert!(!h.manager.evict(&3, None, false, None));
        let filter: EntryFilter<u64> = Arc::new(|entry: &EntryView<u64>| entry.key != 4);
        assert!(!h.manager.evict(&4, None, false, Some(filter)));

        assert_eq!(h.manager.queue_size(), 0);
    }

    #[test_log::test]
    fn test_touch_notifies_policy() {
        let h = harness(synchronized().with_filter(|entry: &EntryView<u64>| entry.key != 2));
        h.topology.set_owners(0, vec![LOCAL, REMOTE]);
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);
        h.policy.set_evict_on_access(true);

        h.manager.touch(&1).unwrap();
        h.manager.touch(&2).unwrap();
        h.manager.touch(&3).unwrap();

        assert_eq!(h.policy.accessed(), vec![(1, false)]);
        assert!(h.manager.is_pending(&1));
        assert!(!h.manager.is_pending(&2));
    }

    #[test_log::test]
    fn test_tx_touch() {
        let h = harness(synchronized());
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);

        h.manager
            .on_tx_finished(&TxSummary {
                keys: vec![1, 2],
                internal: true,
                local: true,
            })
            .unwrap();
        h.manager
            .on_tx_finished(&TxSummary {
                keys: vec![1, 2],
                internal: false,
                local: false,
            })
            .unwrap();
        assert!(h.policy.accessed().is_empty());

        h.manager
            .on_tx_finished(&TxSummary {
                keys: vec![1, 2],
                internal: false,
                local: true,
            })
            .unwrap();
        assert_eq!(h.policy.accessed(), vec![(1, false), (2, false)]);
    }

    #[test_log::test]
    fn test_handler_rejects_stale_topology() {
        let h = harness(synchronized());
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);

        let mut request = EvictionRequest::new(7, h.topology.version() + 1);
        request.add_key(1, Version(1), false);
        request.add_key(2, Version(1), false);
        h.manager.on_message(REMOTE, Message::Request(request));

        let (node, response) = h.responses().pop().unwrap();
        assert_eq!(node, REMOTE);
        assert_eq!(response.round_id, 7);
        assert!(!response.error);
        assert_eq!(response.rejected, vec![1, 2]);
        assert!(h.storage.contains(&1));
        assert!(h.storage.contains(&2));
    }

    #[test_log::test]
    fn test_handler_class_error() {
        let h = harness(synchronized());
        h.storage.put(1, Version(1), 0);

        let mut request = EvictionRequest::new(7, h.topology.version());
        request.add_key(1, Version(1), false);
        request.class_error = Some("unknown class".to_string());
        h.manager.on_message(REMOTE, Message::Request(request));

        let (_, response) = h.responses().pop().unwrap();
        assert!(response.error);
        assert_eq!(response.rejected, vec![1]);
        assert!(h.storage.contains(&1));
    }

    #[test_log::test]
    fn test_handler_evicts_locally() {
        let h = harness(synchronized());
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 1);
        h.storage.update(&2, |entry| entry.locked = true);
        h.storage.put(3, Version(1), 1);
        h.storage.fail_on(3);
        h.storage.insert_near(EntryView::new(4, Version(1), 0));

        let mut request = EvictionRequest::new(7, h.topology.version());
        request.add_key(1, Version(1), false);
        request.add_key(2, Version(1), false);
        request.add_key(3, Version(1), false);
        request.add_key(4, Version(1), true);
        // Absent on this node.
        request.add_key(5, Version(1), false);
        h.manager.on_message(REMOTE, Message::Request(request));

        let (_, response) = h.responses().pop().unwrap();
        assert!(!response.error);
        assert_eq!(response.rejected.iter().copied().sorted().collect_vec(), vec![2, 3]);
        assert!(!h.storage.contains(&1));
        assert!(!h.storage.contains_near(&4));

        let evictions = h.storage.evictions();
        assert!(evictions.iter().all(|record| record.requester == REMOTE));
        assert!(evictions.iter().any(|record| record.key == 4 && record.tier == Tier::Near));
    }

    #[derive(Default)]
    struct RecordingPreloader {
        ops: Mutex<Vec<String>>,
        evicted: AtomicUsize,
    }

    impl Preloader<u64> for RecordingPreloader {
        fn is_preload_enabled(&self) -> bool {
            true
        }

        fn reserve_partition(&self, partition: PartitionId) -> bool {
            self.ops.lock().push(format!("reserve-{partition}"));
            true
        }

        fn release_partition(&self, partition: PartitionId) {
            self.ops.lock().push(format!("release-{partition}"));
        }

        fn lock_partition(&self, partition: PartitionId) {
            self.ops.lock().push(format!("lock-{partition}"));
        }

        fn unlock_partition(&self, partition: PartitionId) {
            self.ops.lock().push(format!("unlock-{partition}"));
        }

        fn is_moving(&self, partition: PartitionId) -> bool {
            partition == 1
        }

        fn lock_global(&self) -> bool {
            self.ops.lock().push("lock-global".to_string());
            true
        }

        fn unlock_global(&self) {
            self.ops.lock().push("unlock-global".to_string());
        }

        fn on_entry_evicted(&self, _: PartitionId, _: &u64, _: Version) {
            self.evicted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test_log::test]
    fn test_handler_locks_moving_partitions() {
        let preloader = Arc::new(RecordingPreloader::default());
        let h = harness_with(
            synchronized()
                .with_mode(CacheMode::Partitioned)
                .with_policy_enabled(false),
            |ctx| ctx.with_preloader(preloader.clone()),
        );
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 1);

        let mut request = EvictionRequest::new(7, h.topology.version());
        request.add_key(1, Version(1), false);
        request.add_key(2, Version(1), false);
        h.manager.on_message(REMOTE, Message::Request(request));

        assert!(h.responses().pop().unwrap().1.rejected.is_empty());
        assert_eq!(
            *preloader.ops.lock(),
            vec![
                "reserve-0",
                "lock-0",
                "unlock-0",
                "release-0",
                "reserve-1",
                "lock-1",
                "unlock-1",
                "release-1",
            ]
        );
        // Only the eviction in the moving partition is recorded.
        assert_eq!(preloader.evicted.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_handler_replicated_takes_global_ticket() {
        let preloader = Arc::new(RecordingPreloader::default());
        let h = harness_with(synchronized(), |ctx| ctx.with_preloader(preloader.clone()));
        h.storage.put(1, Version(1), 0);

        let mut request = EvictionRequest::new(7, h.topology.version());
        request.add_key(1, Version(1), false);
        h.manager.on_message(REMOTE, Message::Request(request));

        assert_eq!(*preloader.ops.lock(), vec!["lock-global", "unlock-global"]);
        assert_eq!(preloader.evicted.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_near_readers_invalidated() {
        let h = harness(
            EvictionManagerBuilder::new()
                .with_near_enabled(true)
                .with_near_synchronized(true)
                .with_key_buffer_size(1),
        );
        h.topology.set_owners(0, vec![LOCAL]);
        h.storage.put(1, Version(1), 0);
        h.storage.update(&1, |entry| entry.readers = vec![OTHER]);

        h.manager.evict(&1, None, false, None);
        h.manager.unwind();

        let (node, request) = h.requests().pop().unwrap();
        assert_eq!(node, OTHER);
        assert!(request.entries[0].near);

        h.respond(OTHER, request.round_id, vec![], false);
        assert!(!h.storage.contains(&1));
        assert_eq!(h.storage.removed_readers(), vec![(1, OTHER, 42)]);
    }

    #[test_log::test]
    fn test_reconcile_touches_new_primary_partitions() {
        let h = harness(
            synchronized()
                .with_mode(CacheMode::Partitioned)
                .with_key_buffer_size(100),
        );
        h.topology.set_owners(0, vec![REMOTE, LOCAL]);
        h.storage.put(1, Version(1), 0);
        h.storage.put(2, Version(1), 0);
        h.storage.put(3, Version(1), 0);
        h.storage.update(&3, |entry| entry.internal = true);

        // Not primary yet.
        h.manager.touch(&1).unwrap();
        assert!(h.policy.accessed().is_empty());

        h.topology.remove_node(REMOTE);
        h.manager.on_topology_event(TopologyEvent::left(REMOTE));

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.policy.accessed().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            h.policy.accessed().into_iter().map(|(key, _)| key).sorted().collect_vec(),
            vec![1, 2]
        );

        h.manager.touch(&1).unwrap();
        assert_eq!(h.policy.count(&1), 2);
    }

    #[test_log::test]
    fn test_build_rejects_invalid_config() {
        let storage = Arc::new(MemoryStorage::<u64>::new(1));
        let ctx = EvictionContext::new(
            storage,
            Arc::new(StaticTopology::new(LOCAL, [])),
            Arc::new(RecordingTransport::default()),
            Arc::new(ManualTimer::default()),
            Arc::new(RecordingPolicy::default()),
        );
        let res = EvictionManagerBuilder::new()
            .with_synchronized(true)
            .with_near_enabled(true)
            .build(ctx);
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
