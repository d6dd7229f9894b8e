// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types of the aggregator and its chunk sources

use thiserror::Error;

/// Error type record handlers can fail with, see [`Dispatcher::run`](crate::Dispatcher::run)
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Tag lookup failure reported by the [`TagCatalog`](crate::TagCatalog)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    /// No tag with this name exists
    #[error("no log tag named {0:?}")]
    Unknown(String),
    /// A name prefix matches more than one tag
    #[error("log tag prefix {0:?} matches multiple tags")]
    Ambiguous(String),
    /// A tag table with more entries than tag codes, contains the first index out of range
    #[error("log tag table too large, no code for entry {0}")]
    TableTooLarge(usize),
}

/// Reason why a chunk payload could not be turned into a structured field
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The payload doesn’t consist of the expected number of space-separated tokens
    #[error("expected {expected} space-separated tokens, found {found}")]
    TokenCount {
        /// Number of tokens the tag requires
        expected: usize,
        /// Number of tokens present in the payload
        found: usize,
    },
    /// A header line without the `:` separator
    #[error("header line without `:` separator")]
    MissingSeparator,
    /// A token that should have been numeric
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    /// A seconds-since-epoch value that cannot be represented as a timestamp
    #[error("timestamp {0:?} out of range")]
    InvalidTimestamp(String),
}

/// Failure of a [`ChunkSource`](crate::ChunkSource)
#[derive(Debug, Error)]
pub enum SourceError {
    /// Reading from the underlying stream failed
    #[error("failed reading log chunks: {0}")]
    Io(#[from] std::io::Error),
    /// Any other source specific failure
    #[error("log source failed: {0}")]
    Other(String),
}

/// Reason for [`Dispatcher::run`](crate::Dispatcher::run) to stop prematurely
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The chunk source failed, open records have been discarded
    #[error(transparent)]
    Source(#[from] SourceError),
    /// The record handler returned an error, open records are kept and dispatching can resume
    #[error("record handler failed: {0}")]
    Handler(HandlerError),
}
