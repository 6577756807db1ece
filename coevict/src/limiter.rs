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

use std::time::Duration;

use coevict_common::strict_assert;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct LimiterState {
    active: usize,
    closed: bool,
}

/// Caps the number of eviction rounds that are dispatched and awaiting completion.
#[derive(Debug)]
pub(crate) struct RoundLimiter {
    state: Mutex<LimiterState>,
    cond: Condvar,
    max: usize,
}

impl RoundLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(LimiterState::default()),
            cond: Condvar::new(),
            max,
        }
    }

    /// Block until a slot is free, without taking it.
    ///
    /// The condition is re-checked every `poll` so that shutdown is observed promptly.
    pub fn wait(&self, poll: Duration) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::Interrupted);
            }
            if state.active < self.max {
                return Ok(());
            }
            self.cond.wait_for(&mut state, poll);
        }
    }

    /// Block until a slot is free and take it. Fails with [`Error::Closed`] once the limiter is closed.
    pub fn acquire(&self, poll: Duration) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::Closed);
            }
            if state.active < self.max {
                state.active += 1;
                return Ok(());
            }
            self.cond.wait_for(&mut state, poll);
        }
    }

    /// Free a slot taken by [`RoundLimiter::acquire`] and wake the waiters.
    pub fn release(&self) {
        let mut state = self.state.lock();
        strict_assert!(state.active > 0);
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Wake every waiter and refuse further slots.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
    };

    use super::*;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_limiter_blocks_at_ceiling() {
        let limiter = Arc::new(RoundLimiter::new(2));
        limiter.acquire(POLL).unwrap();
        limiter.acquire(POLL).unwrap();
        assert_eq!(limiter.active(), 2);

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn({
            let limiter = limiter.clone();
            let acquired = acquired.clone();
            move || {
                limiter.acquire(POLL).unwrap();
                acquired.store(true, Ordering::SeqCst);
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        limiter.release();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(limiter.active(), 2);
    }

    #[test]
    fn test_limiter_close_interrupts() {
        let limiter = Arc::new(RoundLimiter::new(1));
        limiter.acquire(POLL).unwrap();

        let handle = thread::spawn({
            let limiter = limiter.clone();
            move || limiter.wait(Duration::from_secs(60))
        });

        thread::sleep(Duration::from_millis(20));
        limiter.close();
        assert!(matches!(handle.join().unwrap(), Err(Error::Interrupted)));
        assert!(matches!(limiter.acquire(POLL), Err(Error::Closed)));
    }

    #[cfg(any(debug_assertions, feature = "strict_assertions"))]
    #[test]
    #[should_panic]
    fn test_release_without_slot() {
        let limiter = RoundLimiter::new(1);
        limiter.release();
    }
}
