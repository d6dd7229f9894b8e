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

//! The dispatch loop pulling chunks and delivering completed records

use log::{debug, trace};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chunk::Chunk;
use crate::error::{DispatchError, HandlerError};
use crate::record::{Fault, Record};
use crate::source::ChunkSource;
use crate::store::RecordStore;

/// Shared flag requesting a dispatch loop to stop
///
/// Clones refer to the same flag, so a token can be handed to a signal handler or another thread
/// while the dispatcher runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that hasn’t been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The dispatcher stops before pulling its next chunk.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Checks whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Reason for a dispatch loop to end without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The chunk source ran out of chunks
    Exhausted,
    /// Cancellation was requested through the [`CancelToken`]
    Cancelled,
}

/// Counters collected by a [`Dispatcher`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Chunks pulled from the source
    pub chunks: u64,
    /// Chunks discarded because they couldn’t be associated with an open record
    pub chunks_dropped: u64,
    /// Records delivered to the handler
    pub records_completed: u64,
    /// Completed records discarded because they had no content
    pub records_suppressed: u64,
    /// Incomplete records discarded, either superseded by a new transaction or left open when
    /// dispatching ended
    pub records_abandoned: u64,
    /// Chunks with a tag missing from the tag catalog
    pub unknown_tags: u64,
    /// Payloads that couldn’t be parsed, counted for every record once it leaves the store
    /// (delivered, suppressed or abandoned)
    pub malformed_payloads: u64,
    /// Records where the transaction id changed between start and end
    pub identity_mismatches: u64,
}

impl DispatchStats {
    fn count_chunk(&mut self, chunk: &Chunk) {
        self.chunks += 1;
        if chunk.tag().is_none() {
            self.unknown_tags += 1;
        }
    }

    fn count_faults(&mut self, record: &Record) {
        for fault in record.faults() {
            match fault {
                Fault::MalformedPayload { .. } => self.malformed_payloads += 1,
                Fault::IdentityMismatch { .. } => self.identity_mismatches += 1,
                Fault::UnpairedVclReturn(_) => {}
            }
        }
    }
}

impl Display for DispatchStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} chunks ({} dropped, {} with unknown tags), {} records delivered, {} suppressed, \
            {} abandoned, {} malformed payloads, {} transaction id mismatches",
            self.chunks,
            self.chunks_dropped,
            self.unknown_tags,
            self.records_completed,
            self.records_suppressed,
            self.records_abandoned,
            self.malformed_payloads,
            self.identity_mismatches
        )
    }
}

/// Pulls chunks from a source and hands out completed records
///
/// The dispatcher owns the [`RecordStore`] holding all transactions in progress. Chunks are
/// processed strictly one at a time, only completed records ever leave the dispatcher.
#[derive(Debug)]
pub struct Dispatcher<S> {
    source: S,
    store: RecordStore,
    cancel: CancelToken,
    stats: DispatchStats,
}

impl<S: ChunkSource> Dispatcher<S> {
    /// Creates a dispatcher reading from the given source.
    pub fn new(source: S) -> Self {
        Self {
            source,
            store: RecordStore::new(),
            cancel: CancelToken::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Replaces the cancellation token, e.g. to share one token between several dispatchers.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops this dispatcher when cancelled
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Counters collected so far
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Transactions in progress
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Number of transactions in progress
    pub fn open_records(&self) -> usize {
        self.store.len()
    }

    /// Releases the chunk source.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Runs the dispatch loop, invoking `handler` once for every completed record.
    ///
    /// The loop ends when the source runs out of chunks or cancellation is requested. Records
    /// still incomplete at that point are discarded, as they are when the source fails.
    ///
    /// If the handler returns an error, the loop stops right away with
    /// [`DispatchError::Handler`]. Open records are kept in that case, calling `run` again
    /// continues with the next chunk.
    pub fn run<H, E>(&mut self, mut handler: H) -> Result<Termination, DispatchError>
    where
        H: FnMut(Record) -> Result<(), E>,
        E: Into<HandlerError>,
    {
        loop {
            let Some(chunk) = self.pull()? else {
                return Ok(self.finish());
            };

            let applied = self.store.apply(chunk);
            if applied.dropped {
                self.stats.chunks_dropped += 1;
            }
            if let Some(stale) = applied.abandoned {
                self.stats.records_abandoned += 1;
                self.stats.count_faults(&stale);
            }

            let Some(record) = applied.completed else {
                continue;
            };
            self.stats.count_faults(&record);
            if !record.is_deliverable() {
                trace!("Suppressing empty record on descriptor {}", record.fd());
                self.stats.records_suppressed += 1;
                continue;
            }

            self.stats.records_completed += 1;
            handler(record).map_err(|err| DispatchError::Handler(err.into()))?;
        }
    }

    /// Runs the dispatch loop without aggregation, invoking `handler` for every chunk.
    ///
    /// Cancellation and errors are handled the same way as with [`Dispatcher::run`].
    pub fn run_chunks<H, E>(&mut self, mut handler: H) -> Result<Termination, DispatchError>
    where
        H: FnMut(Chunk) -> Result<(), E>,
        E: Into<HandlerError>,
    {
        loop {
            let Some(chunk) = self.pull()? else {
                return Ok(self.finish());
            };
            handler(chunk).map_err(|err| DispatchError::Handler(err.into()))?;
        }
    }

    /// Retrieves the next chunk, `None` if dispatching should end.
    fn pull(&mut self) -> Result<Option<Chunk>, DispatchError> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        match self.source.next_chunk() {
            Ok(Some(chunk)) => {
                self.stats.count_chunk(&chunk);
                Ok(Some(chunk))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.discard_open_records();
                Err(err.into())
            }
        }
    }

    fn finish(&mut self) -> Termination {
        self.discard_open_records();
        if self.cancel.is_cancelled() {
            Termination::Cancelled
        } else {
            Termination::Exhausted
        }
    }

    fn discard_open_records(&mut self) {
        let mut count = 0u64;
        for record in self.store.drain() {
            self.stats.count_faults(&record);
            count += 1;
        }
        if count > 0 {
            debug!("Discarding {count} incomplete records");
            self.stats.records_abandoned += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::chunk::Side;
    use crate::error::SourceError;
    use crate::source::IterSource;
    use test_log::test;

    fn client(fd: u32, tag: &str, payload: &str) -> Chunk {
        Chunk::new(tag, fd, Side::Client, payload)
    }

    fn backend(fd: u32, tag: &str, payload: &str) -> Chunk {
        Chunk::new(tag, fd, Side::Backend, payload)
    }

    fn transaction(fd: u32, xid: &str) -> Vec<Chunk> {
        vec![
            client(fd, "reqstart", &format!("10.0.0.1 1000 {xid}")),
            client(fd, "rxurl", "/"),
            client(fd, "reqend", &format!("{xid} 1 2 0 0 0")),
        ]
    }

    /// Fails after producing its chunks.
    struct Failing(std::vec::IntoIter<Chunk>);

    impl ChunkSource for Failing {
        fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
            match self.0.next() {
                Some(chunk) => Ok(Some(chunk)),
                None => Err(SourceError::Other("connection lost".to_owned())),
            }
        }
    }

    #[test]
    fn delivery() {
        let mut chunks = vec![
            client(3, "reqstart", "10.0.0.1 1000 1"),
            backend(4, "backendopen", "default 127.0.0.1"),
            client(3, "rxurl", "/a"),
            backend(4, "txurl", "/a"),
            Chunk::unclassified(3, Side::Client, "?"),
            client(9, "rxurl", "/orphan"),
            backend(4, "backendclose", "default"),
        ];
        chunks.push(client(3, "reqend", "1 1 2 0 0 0"));

        let mut dispatcher = Dispatcher::new(IterSource::new(chunks));
        let mut delivered = Vec::new();
        let termination = dispatcher
            .run(|record| {
                delivered.push(record);
                Ok::<_, HandlerError>(())
            })
            .unwrap();
        assert_eq!(termination, Termination::Exhausted);

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].side(), Side::Backend);
        assert_eq!(delivered[0].chunks().len(), 3);
        assert_eq!(delivered[1].xid(), Some("1"));
        assert_eq!(delivered[1].chunks().len(), 4);

        assert_eq!(
            dispatcher.stats(),
            &DispatchStats {
                chunks: 8,
                chunks_dropped: 1,
                records_completed: 2,
                unknown_tags: 1,
                ..Default::default()
            }
        );
        assert_eq!(dispatcher.open_records(), 0);
    }

    #[test]
    fn handler_failure_is_resumable() {
        let mut chunks = transaction(3, "1");
        chunks.insert(0, client(5, "reqstart", "10.0.0.1 1000 2"));
        chunks.extend(transaction(3, "3"));
        chunks.push(client(5, "reqend", "2 1 2 0 0 0"));

        let mut dispatcher = Dispatcher::new(IterSource::new(chunks));
        let mut xids = Vec::new();
        let result = dispatcher.run(|record| {
            xids.push(record.xid().unwrap().to_owned());
            if xids.len() == 1 {
                Err("handler broke")
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(DispatchError::Handler(_))));
        assert_eq!(xids, vec!["1"]);
        // Descriptor 5 is still open
        assert_eq!(dispatcher.open_records(), 1);

        let result = dispatcher.run(|record| {
            xids.push(record.xid().unwrap().to_owned());
            Ok::<_, HandlerError>(())
        });
        assert_eq!(result.unwrap(), Termination::Exhausted);
        assert_eq!(xids, vec!["1", "3", "2"]);
        assert_eq!(dispatcher.stats().records_completed, 3);
    }

    #[test]
    fn source_failure_discards_open_records() {
        let mut chunks = transaction(3, "1");
        chunks.push(client(4, "reqstart", "10.0.0.1 1000 2"));
        chunks.push(client(4, "txstatus", "bogus"));

        let mut dispatcher = Dispatcher::new(Failing(chunks.into_iter()));
        let mut delivered = 0;
        let result = dispatcher.run(|_| {
            delivered += 1;
            Ok::<_, HandlerError>(())
        });
        assert!(matches!(
            result,
            Err(DispatchError::Source(SourceError::Other(_)))
        ));
        assert_eq!(delivered, 1);
        assert_eq!(dispatcher.open_records(), 0);
        assert_eq!(dispatcher.stats().records_abandoned, 1);
        assert_eq!(dispatcher.stats().malformed_payloads, 1);
    }

    #[test]
    fn cancellation() {
        let cancel = CancelToken::new();
        let mut chunks = transaction(3, "1");
        chunks.extend(transaction(4, "2"));

        let mut dispatcher =
            Dispatcher::new(IterSource::new(chunks)).with_cancel_token(cancel.clone());
        let mut delivered = 0;
        let result = dispatcher.run(|_| {
            delivered += 1;
            cancel.cancel();
            Ok::<_, HandlerError>(())
        });
        assert_eq!(result.unwrap(), Termination::Cancelled);
        assert_eq!(delivered, 1);
        assert!(dispatcher.cancel_token().is_cancelled());
        assert_eq!(dispatcher.stats().chunks, 3);

        // The source itself wasn’t touched beyond the cancellation point
        let mut rest = dispatcher.into_source();
        assert_eq!(
            rest.next_chunk().unwrap(),
            Some(client(4, "reqstart", "10.0.0.1 1000 2"))
        );
    }

    #[test]
    fn abandoned_records() {
        let chunks = vec![
            client(3, "reqstart", "10.0.0.1 1000 1"),
            client(3, "txstatus", "bogus"),
            client(3, "reqstart", "10.0.0.1 1000 2"),
            client(3, "reqend", "3 1 2 0 0 0"),
            backend(4, "backendopen", "default"),
            backend(4, "rxstatus", "bogus"),
        ];

        let mut dispatcher = Dispatcher::new(IterSource::new(chunks));
        let mut delivered = Vec::new();
        dispatcher
            .run(|record| {
                delivered.push(record);
                Ok::<_, HandlerError>(())
            })
            .unwrap();

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].xid(), Some("2"));
        assert_eq!(
            dispatcher.stats(),
            &DispatchStats {
                chunks: 6,
                records_completed: 1,
                records_abandoned: 2,
                malformed_payloads: 2,
                identity_mismatches: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn raw_chunks() {
        let mut chunks = transaction(3, "1");
        chunks.push(client(0, "cli", "Rd ping"));

        let mut dispatcher = Dispatcher::new(IterSource::new(chunks.clone()));
        let mut received = Vec::new();
        let result = dispatcher.run_chunks(|chunk| {
            received.push(chunk);
            Ok::<_, HandlerError>(())
        });
        assert_eq!(result.unwrap(), Termination::Exhausted);
        assert_eq!(received, chunks);
        assert_eq!(dispatcher.stats().chunks, 4);
        assert_eq!(dispatcher.stats().records_completed, 0);

        let mut dispatcher = Dispatcher::new(IterSource::new(chunks));
        let result = dispatcher.run_chunks(|_| Err("stop"));
        assert!(matches!(result, Err(DispatchError::Handler(_))));
        assert_eq!(dispatcher.stats().chunks, 1);
    }

    #[test]
    fn stats_display() {
        let stats = DispatchStats {
            chunks: 10,
            chunks_dropped: 1,
            records_completed: 2,
            ..Default::default()
        };
        assert_eq!(
            stats.to_string(),
            "10 chunks (1 dropped, 0 with unknown tags), 2 records delivered, 0 suppressed, \
            0 abandoned, 0 malformed payloads, 0 transaction id mismatches"
        );
    }
}
