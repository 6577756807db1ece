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

use std::fmt::Display;

use coevict_common::code::NodeId;

/// Eviction coordinator error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Multiple error list.
    #[error(transparent)]
    Multiple(MultipleError),
    /// Config error.
    #[error("config error: {0}")]
    Config(String),
    /// The caller was woken up by shutdown while waiting for round admission.
    #[error("interrupted while waiting for eviction round admission")]
    Interrupted,
    /// The eviction manager is closed.
    #[error("eviction manager is closed")]
    Closed,
    /// Failed to spawn a background worker.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl Error {
    /// Combine multiple errors into one error.
    ///
    /// A single error is returned as it is.
    pub fn multiple(mut errs: Vec<Error>) -> Self {
        match errs.len() {
            1 => errs.remove(0),
            _ => Self::Multiple(MultipleError(errs)),
        }
    }
}

/// A list of errors raised together.
#[derive(thiserror::Error, Debug)]
pub struct MultipleError(Vec<Error>);

impl MultipleError {
    /// The errors in the list.
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl Display for MultipleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "multiple errors: [")?;
        if let Some((last, errs)) = self.0.as_slice().split_last() {
            for err in errs {
                write!(f, "{}, ", err)?;
            }
            write!(f, "{}", last)?;
        }
        write!(f, "]")?;
        Ok(())
    }
}

/// Eviction coordinator result.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the transport when sending an eviction message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The destination node has left the topology.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Failure reported by the local storage when evicting an entry.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    /// The entry is locked by a transaction.
    #[error("entry is locked")]
    Locked,
    /// I/O error, e.g. from a swap space.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other storage failure.
    #[error("storage error: {0}")]
    Other(String),
}
