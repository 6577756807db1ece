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
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::AbortHandle};

use crate::context::{TimeoutService, TimeoutToken};

/// A [`TimeoutService`] that schedules timeouts on a tokio runtime.
///
/// Clones share the pending timeouts, so one service can serve every coordinator on a runtime.
#[derive(Debug, Clone)]
pub struct TokioTimeoutService {
    handle: Handle,
    next: Arc<AtomicU64>,
    tasks: Arc<Mutex<HashMap<TimeoutToken, AbortHandle>>>,
}

impl TokioTimeoutService {
    /// Schedule timeouts on the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next: Arc::default(),
            tasks: Arc::default(),
        }
    }

    /// Count of pending timeouts.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl TimeoutService for TokioTimeoutService {
    fn add_timeout(&self, id: u64, deadline: Instant, on_timeout: Box<dyn FnOnce() + Send>) -> TimeoutToken {
        let token = TimeoutToken(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let tasks = self.tasks.clone();
        // Hold the lock until the abort handle is recorded, so the task can always find it.
        let mut guard = self.tasks.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            let fire = tasks.lock().remove(&token).is_some();
            if fire {
                tracing::trace!(round = id, ?token, "[timer]: timeout fired");
                on_timeout();
            }
        });
        guard.insert(token, join.abort_handle());
        token
    }

    fn remove_timeout(&self, token: TimeoutToken) {
        if let Some(handle) = self.tasks.lock().remove(&token) {
            handle.abort();
        }
    }
}
