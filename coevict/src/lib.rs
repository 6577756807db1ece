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

//! Synchronized eviction coordinator for distributed in-memory caches.
//!
//! Entries flagged by the eviction policy are buffered, batched into eviction rounds, and removed from every node
//! that holds a copy (backups and near-cache readers) before they are removed locally.

mod buffer;
mod config;
mod context;
mod dispatcher;
mod error;
mod handler;
mod limiter;
mod listener;
mod manager;
mod message;
mod policy;
mod reconcile;
mod round;
mod timer;

mod prelude;
pub use prelude::*;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
