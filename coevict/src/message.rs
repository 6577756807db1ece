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

//! Messages exchanged between the round owner and its participants.

use coevict_common::code::{Key, TopologyVersion, Version};
use serde::{Deserialize, Serialize};

/// One key of an eviction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEntry<K> {
    /// Key to evict.
    pub key: K,
    /// Entry version on the round owner.
    pub version: Version,
    /// `true` if the participant holds a near-cache reader copy rather than a backup.
    pub near: bool,
}

/// Asks a participant to evict its copies of a set of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionRequest<K> {
    /// Id of the round on the sender.
    pub round_id: u64,
    /// Topology version the participant mapping was computed at.
    pub topology_version: TopologyVersion,
    /// Keys to evict.
    pub entries: Vec<RequestEntry<K>>,
    /// Set when the sender could not resolve the deployment context the keys need.
    pub class_error: Option<String>,
}

impl<K: Key> EvictionRequest<K> {
    /// Create an empty request.
    pub fn new(round_id: u64, topology_version: TopologyVersion) -> Self {
        Self {
            round_id,
            topology_version,
            entries: vec![],
            class_error: None,
        }
    }

    /// Append a key.
    pub fn add_key(&mut self, key: K, version: Version, near: bool) {
        self.entries.push(RequestEntry { key, version, near });
    }

    /// All keys of the request.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.iter().map(|entry| &entry.key)
    }
}

/// Participant's answer to an [`EvictionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionResponse<K> {
    /// Id of the round on the requester.
    pub round_id: u64,
    /// Keys the participant could not evict.
    pub rejected: Vec<K>,
    /// Set when the participant could not process the request at all.
    pub error: bool,
    /// Id of this response, used to invalidate reader records that are not newer than it.
    pub message_id: u64,
}

impl<K: Key> EvictionResponse<K> {
    /// Create a response without rejected keys.
    pub fn new(round_id: u64, message_id: u64) -> Self {
        Self {
            round_id,
            rejected: vec![],
            error: false,
            message_id,
        }
    }

    /// Mark a key as rejected.
    pub fn add_rejected(&mut self, key: K) {
        self.rejected.push(key);
    }
}

/// Message of the synchronized eviction protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message<K> {
    /// Round owner to participant.
    Request(EvictionRequest<K>),
    /// Participant to round owner.
    Response(EvictionResponse<K>),
}

impl<K> Message<K> {
    /// Id of the round the message belongs to.
    pub fn round_id(&self) -> u64 {
        match self {
            Message::Request(req) => req.round_id,
            Message::Response(res) => res.round_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serde() {
        let mut req = EvictionRequest::new(3, 7);
        req.add_key("a".to_string(), Version(1), false);
        req.add_key("b".to_string(), Version(2), true);
        let msg = Message::Request(req);

        let json = serde_json::to_string(&msg).unwrap();
        let decoded: Message<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.round_id(), 3);
    }
}
