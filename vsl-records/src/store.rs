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

//! Open records keyed by descriptor id

use log::{debug, trace};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::chunk::{Chunk, Side};
use crate::record::{Record, RecordTag, Transition};

/// How a new record comes into existence
#[derive(Debug)]
enum Opening {
    /// A start tag for the given side
    Start(Side),
    /// A `backendreuse` chunk recycling the connection of the previous backend record
    Reuse(Chunk),
}

/// What happened to a chunk passed to [`RecordStore::apply`]
#[derive(Debug, Default)]
pub struct Applied {
    /// The chunk had no open record to join and didn’t start one, it was discarded.
    pub dropped: bool,
    /// An unfinished record superseded by a new start tag for the same descriptor id
    pub abandoned: Option<Record>,
    /// The record completed by this chunk, already removed from the store
    pub completed: Option<Record>,
}

/// Mapping from descriptor id to the record currently being assembled for it
///
/// The store only ever holds records that saw their start tag. Chunks that cannot be associated
/// with such a record are dropped rather than buffered.
#[derive(Debug, Default)]
pub struct RecordStore {
    open: HashMap<u32, Record>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open records
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Checks whether no records are open
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Returns the open record for a descriptor id.
    pub fn get(&self, fd: u32) -> Option<&Record> {
        self.open.get(&fd)
    }

    /// Discards all open records, returning their number.
    pub fn clear(&mut self) -> usize {
        self.drain().count()
    }

    /// Removes all open records, handing them out in no particular order.
    pub fn drain(&mut self) -> impl Iterator<Item = Record> + '_ {
        self.open.drain().map(|(_, record)| record)
    }

    /// Routes a chunk to its record, creating the record on a start tag and evicting it on
    /// completion.
    ///
    /// A `backendreuse` chunk both completes the current backend record and opens the next one
    /// for the same descriptor id. The next record is active right away and holds the very same
    /// chunk as its first one.
    pub fn apply(&mut self, chunk: Chunk) -> Applied {
        let mut applied = Applied::default();

        let fd = chunk.fd();
        if fd == 0 {
            // Descriptor 0 is used for entries not associated with any session
            trace!("Dropping {chunk}, no session");
            applied.dropped = true;
            return applied;
        }

        let side = chunk.side();
        let tag = RecordTag::classify(chunk.tag());
        if tag.starts(side) {
            applied.abandoned = self.open.remove(&fd);
            if let Some(stale) = &applied.abandoned {
                debug!(
                    "Abandoning incomplete {} record on descriptor {fd} after {} chunks, new transaction started",
                    stale.side(),
                    stale.chunks().len()
                );
            }
            self.create_or_reuse(fd, Opening::Start(side)).apply(chunk);
            return applied;
        }

        let Some(record) = self.open.get_mut(&fd) else {
            trace!("Dropping {chunk}, no open record");
            applied.dropped = true;
            return applied;
        };

        let handoff =
            (tag == RecordTag::BackendReuse && side == Side::Backend).then(|| chunk.clone());
        match record.apply(chunk) {
            Transition::Ignored => {
                trace!("Dropping chunk for descriptor {fd}, belongs to a different side");
                applied.dropped = true;
            }
            Transition::Completed => {
                applied.completed = self.open.remove(&fd);
                if let Some(chunk) = handoff {
                    debug!("Backend connection on descriptor {fd} reused");
                    self.create_or_reuse(fd, Opening::Reuse(chunk));
                }
            }
            Transition::Started | Transition::Accumulated => {}
        }
        applied
    }

    fn create_or_reuse(&mut self, fd: u32, opening: Opening) -> &mut Record {
        let record = match opening {
            Opening::Start(side) => Record::new(fd, side),
            Opening::Reuse(chunk) => Record::reused(chunk),
        };
        match self.open.entry(fd) {
            Entry::Occupied(mut entry) => {
                entry.insert(record);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::record::RecordState;
    use test_log::test;

    fn backend(tag: &str, payload: &str) -> Chunk {
        Chunk::new(tag, 20, Side::Backend, payload)
    }

    #[test]
    fn drop_policy() {
        let mut store = RecordStore::new();
        let applied = store.apply(Chunk::new("rxurl", 5, Side::Client, "/"));
        assert!(applied.dropped);
        assert!(store.is_empty());

        let applied = store.apply(Chunk::new("reqstart", 0, Side::Client, "1.2.3.4 1 1"));
        assert!(applied.dropped);
        assert!(store.is_empty());

        let applied = store.apply(Chunk::new("reqstart", 5, Side::Client, "1.2.3.4 1 1"));
        assert!(!applied.dropped);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(5).unwrap().state(), RecordState::Active);

        // Wrong side for the open record
        let applied = store.apply(Chunk::new("txurl", 5, Side::Backend, "/"));
        assert!(applied.dropped);
        assert_eq!(store.get(5).unwrap().chunks().len(), 1);

        let applied = store.apply(Chunk::new("reqend", 5, Side::Client, "1 1 1 0 0 0"));
        assert!(!applied.dropped);
        assert!(applied.completed.unwrap().is_complete());
        assert!(store.is_empty());

        // Evicted records don’t come back
        let applied = store.apply(Chunk::new("rxurl", 5, Side::Client, "/"));
        assert!(applied.dropped);
        assert!(store.is_empty());
    }

    #[test]
    fn reuse_handoff() {
        let mut store = RecordStore::new();
        assert!(store.apply(backend("backendopen", "one 1.2.3.4")).completed.is_none());
        assert!(store.apply(backend("txurl", "/a")).completed.is_none());

        let applied = store.apply(backend("backendreuse", "two"));
        let first = applied.completed.unwrap();
        assert_eq!(first.chunks().len(), 3);
        assert_eq!(first.chunks()[2].tag(), Some("backendreuse"));
        assert_eq!(first.exchange().url.as_deref(), Some("/a"));
        assert_eq!(first.backend().unwrap().backend_name.as_deref(), Some("two"));

        let next = store.get(20).unwrap();
        assert_eq!(next.state(), RecordState::Active);
        assert_eq!(next.chunks(), &[backend("backendreuse", "two")]);
        assert!(next.backend().unwrap().reused);

        assert!(store.apply(backend("txurl", "/b")).completed.is_none());
        let second = store.apply(backend("backendclose", "two")).completed.unwrap();
        assert_eq!(
            second
                .chunks()
                .iter()
                .map(|chunk| chunk.tag().unwrap())
                .collect::<Vec<_>>(),
            vec!["backendreuse", "txurl", "backendclose"]
        );
        assert_eq!(second.exchange().url.as_deref(), Some("/b"));
        assert_eq!(second.backend().unwrap().backend_name.as_deref(), Some("two"));
        assert!(store.is_empty());
    }

    #[test]
    fn restart_abandons_stale_record() {
        let mut store = RecordStore::new();
        store.apply(Chunk::new("reqstart", 5, Side::Client, "1.2.3.4 1 100"));
        store.apply(Chunk::new("rxurl", 5, Side::Client, "/lost"));

        let applied = store.apply(Chunk::new("reqstart", 5, Side::Client, "1.2.3.4 1 101"));
        let stale = applied.abandoned.unwrap();
        assert_eq!(stale.xid(), Some("100"));
        assert!(!stale.is_complete());
        assert_eq!(store.get(5).unwrap().xid(), Some("101"));
        assert_eq!(store.get(5).unwrap().chunks().len(), 1);

        let open: Vec<_> = store.drain().collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].xid(), Some("101"));
        assert!(store.is_empty());
        assert_eq!(store.clear(), 0);
    }
}
