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

//! Re-offers entries to the eviction policy after partition ownership moves to the local node.
//!
//! With synchronized backup eviction only primary entries are tracked by the policy, so entries of a partition that
//! has just become primary would never be considered without this worker.

use std::{
    sync::Weak,
    thread::JoinHandle,
    time::Duration,
};

use coevict_common::code::{Key, NodeId, PartitionId};
use flume::{Receiver, RecvTimeoutError, Sender};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::{error::Result, manager::Shared};

/// Kind of a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyEventKind {
    /// A node joined the cluster.
    Joined,
    /// A node left the cluster gracefully.
    Left,
    /// A node was detected as failed.
    Failed,
}

/// A membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologyEvent {
    /// Kind of the change.
    pub kind: TopologyEventKind,
    /// The node that joined, left or failed.
    pub node: NodeId,
}

impl TopologyEvent {
    /// A node joined.
    pub fn joined(node: NodeId) -> Self {
        Self {
            kind: TopologyEventKind::Joined,
            node,
        }
    }

    /// A node left.
    pub fn left(node: NodeId) -> Self {
        Self {
            kind: TopologyEventKind::Left,
            node,
        }
    }

    /// A node failed.
    pub fn failed(node: NodeId) -> Self {
        Self {
            kind: TopologyEventKind::Failed,
            node,
        }
    }

    /// Returns `true` if the node is gone.
    pub fn is_departure(&self) -> bool {
        matches!(self.kind, TopologyEventKind::Left | TopologyEventKind::Failed)
    }
}

enum Command {
    Reconcile,
    Stop,
}

pub(crate) struct ReconcileWorker {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl ReconcileWorker {
    pub fn spawn<K: Key>(name: &str, shared: Weak<Shared<K>>, poll: Duration) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        // Compute the initial primary set.
        let _ = tx.send(Command::Reconcile);
        let handle = std::thread::Builder::new()
            .name(format!("coevict-reconcile-{name}"))
            .spawn(move || Runner { shared, rx, poll }.run())?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn notify(&self, event: TopologyEvent) {
        tracing::trace!(?event, "[reconcile]: queue topology event");
        let _ = self.tx.send(Command::Reconcile);
    }

    /// Stop the worker and wait for it, unless called from the worker itself.
    pub fn stop(mut self) {
        let _ = self.tx.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("[reconcile]: topology reconciliation worker panicked");
            }
        }
    }
}

struct Runner<K: Key> {
    shared: Weak<Shared<K>>,
    rx: Receiver<Command>,
    poll: Duration,
}

impl<K: Key> Runner<K> {
    fn run(self) {
        tracing::debug!("[reconcile]: topology reconciliation worker started");

        let mut primary = HashSet::new();

        loop {
            match self.rx.recv_timeout(self.poll) {
                Ok(Command::Reconcile) => {}
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    match self.shared.upgrade() {
                        Some(shared) if !shared.is_closed() => continue,
                        _ => break,
                    }
                }
            }

            let Some(shared) = self.shared.upgrade() else { break };
            if shared.is_closed() {
                break;
            }
            self.reconcile(&shared, &mut primary);
        }

        tracing::debug!("[reconcile]: topology reconciliation worker stopped");
    }

    fn reconcile(&self, shared: &Shared<K>, primary: &mut HashSet<PartitionId>) {
        let current: HashSet<PartitionId> = shared.ctx.topology.local_partitions().into_iter().collect();

        primary.retain(|partition| current.contains(partition));

        let mut fresh = current.difference(primary).copied().collect::<Vec<_>>();
        fresh.sort_unstable();

        for partition in fresh {
            // A newer event will recompute the primary set anyway.
            if !self.rx.is_empty() {
                return;
            }
            primary.insert(partition);

            let entries = shared.ctx.storage.entries(partition);
            tracing::debug!(partition, entries = entries.len(), "[reconcile]: partition became primary, touch entries");
            for entry in entries {
                if entry.internal {
                    continue;
                }
                shared.notify_policy(&entry);
            }
        }
    }
}
