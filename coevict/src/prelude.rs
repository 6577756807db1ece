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

pub use coevict_common::code::{Key, NodeId, PartitionId, TopologyVersion, Version};

pub use crate::{
    buffer::Candidate,
    config::{CacheMode, EvictionConfig},
    context::{
        AtomicVersions, DisabledPreloader, EntryView, EvictGuard, EvictionContext, Preloader, RequestContext, Storage,
        Tier, TimeoutService, TimeoutToken, Topology, Transport, VersionSource,
    },
    error::{Error, MultipleError, Result, SendError, StorageError},
    listener::{DefaultEventListener, EventListener},
    manager::{EvictionManager, EvictionManagerBuilder, EvictionStats, TxSummary},
    message::{EvictionRequest, EvictionResponse, Message, RequestEntry},
    policy::{EntryFilter, EvictionFilter, EvictionPolicy, Evictor, NoopPolicy},
    reconcile::{TopologyEvent, TopologyEventKind},
    round::{RoundOutcome, RoundState, RoundWaiter},
    timer::TokioTimeoutService,
};
