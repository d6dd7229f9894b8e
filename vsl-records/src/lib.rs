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

//! # Varnish log record aggregation
//!
//! The Varnish shared memory log delivers a stream of small tagged chunks. Chunks belonging to
//! different transactions are interleaved, only the descriptor id tells them apart. This crate
//! groups these chunks into complete records:
//!
//! * a client record starts with `ReqStart` and ends with `ReqEnd`,
//! * a backend record starts with `BackendOpen` and ends with `BackendClose` or
//!   `BackendReuse`. In the latter case the connection is reused and a new backend record
//!   starts right away.
//!
//! While collecting chunks, a record extracts structured fields: request line, status, headers,
//! timing, hash inputs and VCL calls. Malformed payloads don’t stop aggregation, they are noted
//! as [`Fault`]s on the record.
//!
//! Chunks are read through the [`ChunkSource`] trait. [`TextSource`] parses the text output of
//! `varnishlog`, [`IterSource`] wraps any iterator.
//!
//! ## Code example
//!
//! ```rust
//! use vsl_records::{Chunk, Dispatcher, HandlerError, IterSource, Side, Termination};
//!
//! let chunks = [
//!     ("reqstart", "192.0.2.1 52814 1001"),
//!     ("rxrequest", "GET"),
//!     ("rxurl", "/index.html"),
//!     ("rxheader", "Host: example.com"),
//!     ("txstatus", "200"),
//!     ("reqend", "1001 1700000000.0 1700000000.2 0.0 0.1 0.1"),
//! ]
//! .map(|(tag, payload)| Chunk::new(tag, 12, Side::Client, payload));
//!
//! let mut dispatcher = Dispatcher::new(IterSource::new(chunks));
//! let termination = dispatcher.run(|record| {
//!     assert_eq!(record.xid(), Some("1001"));
//!     assert_eq!(record.exchange().url.as_deref(), Some("/index.html"));
//!     assert_eq!(record.exchange().status, Some(200));
//!     Ok::<_, HandlerError>(())
//! });
//! assert_eq!(termination.unwrap(), Termination::Exhausted);
//! assert_eq!(dispatcher.stats().records_completed, 1);
//! ```

mod chunk;
mod dispatcher;
mod error;
mod headers;
mod record;
mod source;
mod store;
mod tags;

pub use chunk::{Chunk, Side};
pub use dispatcher::{CancelToken, DispatchStats, Dispatcher, Termination};
pub use error::{DispatchError, HandlerError, PayloadError, SourceError, TagError};
pub use headers::Headers;
pub use record::{
    BackendDetails, ClientDetails, Details, Exchange, Fault, Record, RecordState, RecordTag,
    Transition,
};
pub use source::{ChunkSource, IterSource, TextSource};
pub use store::{Applied, RecordStore};
pub use tags::TagCatalog;
