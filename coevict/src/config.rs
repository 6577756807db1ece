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

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Distribution mode of the cache the coordinator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Keys are split into partitions, each owned by a primary and a set of backups.
    #[default]
    Partitioned,
    /// Every node holds every key.
    Replicated,
}

/// Synchronized eviction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Name of the cache, used in logs and metrics labels.
    pub name: String,
    /// Distribution mode.
    pub mode: CacheMode,
    /// Whether an eviction policy is configured.
    pub policy_enabled: bool,
    /// Evict backup copies together with the primary copy.
    pub synchronized: bool,
    /// Evict near-cache reader copies together with the primary copy.
    pub near_synchronized: bool,
    /// Whether near caches are enabled.
    pub near_enabled: bool,
    /// Whether evicted entries are swapped out instead of dropped.
    pub swap_enabled: bool,
    /// Percent of the local key count allowed to wait in the eviction buffer.
    pub max_overflow_ratio: f64,
    /// Upper bound of a batch of candidates.
    pub key_buffer_size: usize,
    /// Lower bound of the computed batch size, before the buffer cap applies.
    pub batch_floor: usize,
    /// Maximum count of dispatched rounds awaiting completion.
    pub concurrency_level: usize,
    /// How long a round waits for its participants.
    pub timeout: Duration,
    /// Interval of re-checking shutdown while blocked on round admission.
    pub admission_poll_interval: Duration,
    /// Interval of re-checking shutdown in the topology reconciliation worker.
    pub reconcile_poll_interval: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            name: "coevict".to_string(),
            mode: CacheMode::Partitioned,
            policy_enabled: true,
            synchronized: false,
            near_synchronized: false,
            near_enabled: false,
            swap_enabled: false,
            max_overflow_ratio: 10.0,
            key_buffer_size: 1024,
            batch_floor: 500,
            concurrency_level: 4,
            timeout: Duration::from_secs(10),
            admission_poll_interval: Duration::from_secs(2),
            reconcile_poll_interval: Duration::from_secs(1),
        }
    }
}

impl EvictionConfig {
    /// Backup copies are evicted synchronously.
    ///
    /// Swapped entries are kept on the primary, so backups are never synchronized with swap on.
    pub fn backup_sync(&self) -> bool {
        self.synchronized && !self.swap_enabled
    }

    /// Near-cache reader copies are evicted synchronously.
    pub fn near_sync(&self) -> bool {
        self.near_synchronized && self.mode == CacheMode::Partitioned && self.near_enabled
    }

    /// Any kind of synchronized eviction is enabled.
    pub fn sync_any(&self) -> bool {
        self.backup_sync() || self.near_sync()
    }

    /// Count of candidates batched into one round for a cache holding `key_count` entries.
    pub fn max_batch(&self, key_count: usize) -> usize {
        let ratio = (key_count as f64 * self.max_overflow_ratio / 100.0) as usize;
        self.key_buffer_size.min(self.batch_floor.max(ratio)).max(1)
    }

    /// Check the configuration, collecting every problem.
    pub fn validate(&self) -> Result<()> {
        let mut errs = vec![];

        if self.max_overflow_ratio.is_nan() || self.max_overflow_ratio < 0.0 {
            errs.push(Error::Config(format!(
                "max_overflow_ratio must be a non-negative number, given: {}",
                self.max_overflow_ratio
            )));
        }

        if self.mode == CacheMode::Partitioned && self.backup_sync() && self.near_enabled && !self.near_sync() {
            errs.push(Error::Config(
                "near readers must be synchronized when backups are synchronized, or data may become inconsistent"
                    .to_string(),
            ));
        }

        if self.sync_any() {
            if self.timeout.is_zero() {
                errs.push(Error::Config("timeout must be positive with synchronized eviction".to_string()));
            }
            if self.concurrency_level == 0 {
                errs.push(Error::Config(
                    "concurrency_level must be positive with synchronized eviction".to_string(),
                ));
            }
            if self.key_buffer_size == 0 {
                errs.push(Error::Config(
                    "key_buffer_size must be positive with synchronized eviction".to_string(),
                ));
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::multiple(errs))
        }
    }

    /// Report legal but risky settings.
    pub(crate) fn warn_unsynchronized(&self) {
        if !self.backup_sync() {
            tracing::warn!(
                name = %self.name,
                "[eviction]: evictions are not synchronized with other nodes in topology, which may cause data inconsistency"
            );
        }
        if self.near_enabled && self.mode == CacheMode::Partitioned && !self.near_sync() {
            tracing::warn!(
                name = %self.name,
                "[eviction]: near evictions are not synchronized with other nodes in topology, which may cause data inconsistency"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_batch() {
        let config = EvictionConfig {
            key_buffer_size: 1024,
            max_overflow_ratio: 10.0,
            ..Default::default()
        };
        // The floor dominates small caches.
        assert_eq!(config.max_batch(100), 500);
        assert_eq!(config.max_batch(8000), 800);
        // The buffer cap dominates large caches.
        assert_eq!(config.max_batch(1_000_000), 1024);

        let config = EvictionConfig {
            key_buffer_size: 3,
            ..Default::default()
        };
        assert_eq!(config.max_batch(0), 3);

        let config = EvictionConfig {
            batch_floor: 0,
            max_overflow_ratio: 0.0,
            ..Default::default()
        };
        assert_eq!(config.max_batch(10), 1);
    }

    #[test]
    fn test_derived_flags() {
        let mut config = EvictionConfig {
            synchronized: true,
            ..Default::default()
        };
        assert!(config.backup_sync());
        assert!(!config.near_sync());

        config.swap_enabled = true;
        assert!(!config.backup_sync());
        assert!(!config.sync_any());

        config.near_synchronized = true;
        config.near_enabled = true;
        assert!(config.near_sync());
        config.mode = CacheMode::Replicated;
        assert!(!config.near_sync());
    }

    #[test]
    fn test_validate() {
        assert!(EvictionConfig::default().validate().is_ok());

        let config = EvictionConfig {
            max_overflow_ratio: -1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = EvictionConfig {
            synchronized: true,
            near_enabled: true,
            timeout: Duration::ZERO,
            concurrency_level: 0,
            ..Default::default()
        };
        match config.validate() {
            Err(Error::Multiple(errs)) => assert_eq!(errs.errors().len(), 3),
            res => panic!("unexpected result: {res:?}"),
        }
    }

    #[test]
    fn test_serde_defaults() {
        let config: EvictionConfig = serde_json::from_str(r#"{"name": "users", "synchronized": true}"#).unwrap();
        assert_eq!(config.name, "users");
        assert!(config.synchronized);
        assert_eq!(config.key_buffer_size, 1024);
        assert_eq!(config.concurrency_level, 4);
    }
}
