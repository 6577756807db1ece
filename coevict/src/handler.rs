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

//! Serves eviction requests on a participant node.

use coevict_common::code::{Key, NodeId, PartitionId};
use itertools::Itertools;

use crate::{
    config::CacheMode,
    context::{Preloader, RequestContext, Tier, TopologyReadGuard},
    error::SendError,
    manager::Shared,
    message::{EvictionRequest, EvictionResponse, Message},
};

/// Rebalancing lock held while evicting the keys of one partition.
enum PartitionLock<'a, K: Key> {
    Unlocked,
    Global(&'a dyn Preloader<K>),
    Partition(&'a dyn Preloader<K>, PartitionId),
}

impl<'a, K: Key> PartitionLock<'a, K> {
    /// Lock the partition if it is being rebalanced to the local node.
    fn acquire(preloader: &'a dyn Preloader<K>, mode: CacheMode, partition: PartitionId) -> Self {
        if !preloader.is_preload_enabled() {
            return Self::Unlocked;
        }
        match mode {
            CacheMode::Replicated => {
                if preloader.lock_global() {
                    Self::Global(preloader)
                } else {
                    Self::Unlocked
                }
            }
            CacheMode::Partitioned => {
                if !preloader.reserve_partition(partition) {
                    tracing::debug!(partition, "[eviction]: partition does not belong to local node");
                    return Self::Unlocked;
                }
                preloader.lock_partition(partition);
                if !preloader.is_moving(partition) {
                    preloader.unlock_partition(partition);
                    preloader.release_partition(partition);
                    return Self::Unlocked;
                }
                Self::Partition(preloader, partition)
            }
        }
    }

    fn is_locked(&self) -> bool {
        !matches!(self, Self::Unlocked)
    }
}

impl<K: Key> Drop for PartitionLock<'_, K> {
    fn drop(&mut self) {
        match self {
            Self::Unlocked => {}
            Self::Global(preloader) => preloader.unlock_global(),
            Self::Partition(preloader, partition) => {
                preloader.unlock_partition(*partition);
                preloader.release_partition(*partition);
            }
        }
    }
}

pub(crate) fn handle_request<K: Key>(shared: &Shared<K>, from: NodeId, request: EvictionRequest<K>) {
    shared.metrics.request_handle.increase(1);

    let mut response = EvictionResponse::new(request.round_id, shared.next_message_id());

    if let Some(error) = &request.class_error {
        tracing::warn!(%from, round = request.round_id, "[eviction]: eviction request carries an unresolved deployment: {error}");
        response.error = true;
        response.rejected = request.keys().cloned().collect();
        send_response(shared, from, response);
        return;
    }

    {
        let topology = &*shared.ctx.topology;
        let _guard = TopologyReadGuard::new(topology);

        if topology.version() != request.topology_version {
            tracing::debug!(
                %from,
                round = request.round_id,
                local = topology.version(),
                remote = request.topology_version,
                "[eviction]: reject eviction request mapped at a stale topology"
            );
            shared.metrics.request_stale.increase(1);
            response.rejected = request.keys().cloned().collect();
        } else {
            let ctx = RequestContext::remote(from, topology.local_node());
            let obsolete = shared.ctx.versions.next_version();
            let storage = &*shared.ctx.storage;
            let preloader = &*shared.ctx.preloader;

            let (near, main): (Vec<_>, Vec<_>) = request.entries.into_iter().partition(|entry| entry.near);

            let groups = main
                .into_iter()
                .into_group_map_by(|entry| storage.partition(&entry.key))
                .into_iter()
                .sorted_by_key(|(partition, _)| *partition);
            for (partition, entries) in groups {
                let lock = PartitionLock::acquire(preloader, shared.config.mode, partition);
                for entry in entries {
                    let evicted = match storage.evict(&entry.key, Tier::Main, obsolete, None, &ctx) {
                        Ok(evicted) => evicted,
                        Err(e) => {
                            tracing::error!(%from, key = ?entry.key, "[eviction]: failed to evict entry on remote request: {e}");
                            false
                        }
                    };
                    tracing::trace!(key = ?entry.key, version = %entry.version, evicted, "[eviction]: evict on remote request");
                    if evicted {
                        if lock.is_locked() {
                            preloader.on_entry_evicted(partition, &entry.key, entry.version);
                        }
                    } else {
                        response.add_rejected(entry.key);
                    }
                }
                drop(lock);
            }

            // Near copies carry no consistency risk and need no partition lock.
            for entry in near {
                let evicted = match storage.evict(&entry.key, Tier::Near, obsolete, None, &ctx) {
                    Ok(evicted) => evicted,
                    Err(e) => {
                        tracing::error!(%from, key = ?entry.key, "[eviction]: failed to evict near entry on remote request: {e}");
                        false
                    }
                };
                tracing::trace!(key = ?entry.key, version = %entry.version, evicted, "[eviction]: evict near entry on remote request");
                if !evicted {
                    response.add_rejected(entry.key);
                }
            }
        }
    }

    shared
        .metrics
        .request_reject_key
        .increase(response.rejected.len() as u64);
    send_response(shared, from, response);
}

fn send_response<K: Key>(shared: &Shared<K>, to: NodeId, response: EvictionResponse<K>) {
    match shared.ctx.transport.send(to, Message::Response(response)) {
        Ok(()) => {}
        Err(SendError::Unreachable(_)) => {
            tracing::debug!(%to, "[eviction]: requester left before eviction response was sent");
        }
        Err(e) => tracing::error!(%to, "[eviction]: failed to send eviction response: {e}"),
    }
}
