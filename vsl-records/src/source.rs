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

//! Producers of log chunks

use log::{trace, warn};
use std::collections::HashSet;
use std::io::BufRead;
use std::sync::Arc;

use crate::chunk::{Chunk, Side};
use crate::error::SourceError;
use crate::tags::TagCatalog;

/// A stream of log chunks
///
/// `next_chunk` may block while waiting for more data. It returns `Ok(None)` once the stream
/// ended.
pub trait ChunkSource {
    /// Retrieves the next chunk.
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError>;
}

impl<S: ChunkSource + ?Sized> ChunkSource for Box<S> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        (**self).next_chunk()
    }
}

impl<S: ChunkSource + ?Sized> ChunkSource for &mut S {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        (**self).next_chunk()
    }
}

/// Chunk source wrapping an iterator
#[derive(Debug, Clone)]
pub struct IterSource<I> {
    iter: I,
}

impl<I: Iterator<Item = Chunk>> IterSource<I> {
    /// Creates a source producing the chunks of an iterator.
    pub fn new(chunks: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: chunks.into_iter(),
        }
    }
}

impl<I: Iterator<Item = Chunk>> ChunkSource for IterSource<I> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        Ok(self.iter.next())
    }
}

/// A line of a text dump split into its parts
#[derive(Debug, PartialEq, Eq)]
struct DumpLine<'a> {
    fd: u32,
    tag: &'a str,
    side: Option<Side>,
    payload: &'a str,
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    match line.find(char::is_whitespace) {
        Some(end) => Some((&line[..end], &line[end..])),
        None if line.is_empty() => None,
        None => Some((line, "")),
    }
}

fn parse_dump_line(line: &str) -> Result<Option<DumpLine<'_>>, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let (fd, rest) = split_field(line).ok_or("missing descriptor id")?;
    let fd = fd
        .parse()
        .map_err(|_| format!("invalid descriptor id {fd:?}"))?;
    let (tag, rest) = split_field(rest).ok_or("missing tag")?;
    let (marker, rest) = split_field(rest).ok_or("missing client/backend marker")?;

    let mut chars = marker.chars();
    let (Some(marker), None) = (chars.next(), chars.next()) else {
        return Err(format!("invalid client/backend marker {marker:?}"));
    };

    let payload = rest.strip_prefix(' ').unwrap_or(rest);
    Ok(Some(DumpLine {
        fd,
        tag,
        side: Side::from_marker(marker),
        payload,
    }))
}

/// Chunk source reading the text format written by `varnishlog`
///
/// Each line holds one chunk: descriptor id, tag name, `c` for client or `b` for backend chunks
/// and the payload, separated by whitespace:
///
/// ```text
///    12 ReqStart     c 192.0.2.1 52814 1227381574
///    12 RxRequest    c GET
/// ```
///
/// Lines that cannot be parsed are skipped with a warning, as are chunks that belong to neither
/// side. Tag names missing from the catalog produce unclassified chunks.
#[derive(Debug)]
pub struct TextSource<R> {
    reader: R,
    catalog: Arc<TagCatalog>,
    line: Vec<u8>,
    line_number: u64,
    skipped_lines: u64,
    unknown_tags: HashSet<String>,
}

impl<R: BufRead> TextSource<R> {
    /// Creates a source reading from the given reader and resolving tags through the catalog.
    pub fn new(reader: R, catalog: Arc<TagCatalog>) -> Self {
        Self {
            reader,
            catalog,
            line: Vec::new(),
            line_number: 0,
            skipped_lines: 0,
            unknown_tags: HashSet::new(),
        }
    }

    /// Number of lines skipped because they couldn’t be parsed
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    fn make_chunk(&mut self, line: DumpLine<'_>, side: Side) -> Chunk {
        match self.catalog.code_of(line.tag) {
            Ok(code) => Chunk::from_raw(
                &self.catalog,
                code,
                line.fd,
                side,
                line.payload.as_bytes(),
                0,
            ),
            Err(err) => {
                if self.unknown_tags.insert(line.tag.to_owned()) {
                    warn!("{err}, chunks with this tag stay unclassified");
                }
                Chunk::unclassified(line.fd, side, line.payload)
            }
        }
    }
}

impl<R: BufRead> ChunkSource for TextSource<R> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceError> {
        loop {
            let mut raw = std::mem::take(&mut self.line);
            raw.clear();
            if self.reader.read_until(b'\n', &mut raw)? == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            // Payloads are whatever clients sent, not necessarily UTF-8
            let line = String::from_utf8_lossy(&raw);
            let chunk = match parse_dump_line(&line) {
                Ok(Some(parsed)) => match parsed.side {
                    Some(side) => Some(self.make_chunk(parsed, side)),
                    None => {
                        trace!("Skipping line {} without session", self.line_number);
                        None
                    }
                },
                Ok(None) => None,
                Err(err) => {
                    warn!("Skipping line {}: {err}", self.line_number);
                    self.skipped_lines += 1;
                    None
                }
            };

            drop(line);
            self.line = raw;
            if chunk.is_some() {
                return Ok(chunk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufReader, Cursor, Read};
    use test_log::test;

    fn text_source(data: &'static str) -> TextSource<Cursor<&'static str>> {
        TextSource::new(Cursor::new(data), Arc::new(TagCatalog::builtin().clone()))
    }

    fn collect(mut source: impl ChunkSource) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn dump_line_parsing() {
        assert_eq!(
            parse_dump_line("   12 ReqStart     c 192.0.2.1 52814 1227381574\n"),
            Ok(Some(DumpLine {
                fd: 12,
                tag: "ReqStart",
                side: Some(Side::Client),
                payload: "192.0.2.1 52814 1227381574",
            }))
        );
        assert_eq!(
            parse_dump_line("   14 TxHeader     b  leading space\r\n"),
            Ok(Some(DumpLine {
                fd: 14,
                tag: "TxHeader",
                side: Some(Side::Backend),
                payload: " leading space",
            }))
        );
        assert_eq!(
            parse_dump_line("    0 CLI          - Rd ping"),
            Ok(Some(DumpLine {
                fd: 0,
                tag: "CLI",
                side: None,
                payload: "Rd ping",
            }))
        );
        assert_eq!(
            parse_dump_line("   12 Hash         c"),
            Ok(Some(DumpLine {
                fd: 12,
                tag: "Hash",
                side: Some(Side::Client),
                payload: "",
            }))
        );
        assert_eq!(parse_dump_line("   \n"), Ok(None));
        assert!(parse_dump_line("abc ReqStart c x").is_err());
        assert!(parse_dump_line("   12 ReqStart").is_err());
        assert!(parse_dump_line("   12 ReqStart cb x").is_err());
    }

    #[test]
    fn text_dump() {
        let source = text_source(
            "    0 CLI          - Rd ping\n\
            \x20  12 ReqStart     c 192.0.2.1 52814 1001\n\
             garbage\n\
             \n\
            \x20  12 Mystery      c something\n\
            \x20  15 BackendOpen  b default 127.0.0.1 40000\n",
        );
        let chunks = collect(source);
        assert_eq!(
            chunks,
            vec![
                Chunk::new("reqstart", 12, Side::Client, "192.0.2.1 52814 1001"),
                Chunk::unclassified(12, Side::Client, "something"),
                Chunk::new("backendopen", 15, Side::Backend, "default 127.0.0.1 40000"),
            ]
        );
    }

    #[test]
    fn skipped_lines() {
        let mut source = text_source("garbage\n   12 ReqEnd c 1 2 3 4 5 6\nmore garbage\n");
        assert_eq!(
            source.next_chunk().unwrap(),
            Some(Chunk::new("reqend", 12, Side::Client, "1 2 3 4 5 6"))
        );
        assert_eq!(source.next_chunk().unwrap(), None);
        assert_eq!(source.skipped_lines(), 2);
    }

    #[test]
    fn invalid_utf8() {
        let data: &[u8] = b"   12 ReqStart     c 192.0.2.1 52814 1001\n\
            \x20  12 RxHeader     c User-Agent: caf\xe9\n\
            \x20  12 ReqEnd       c 1001 1.0 2.0 0.0 0.5 0.5\n";
        let mut source =
            TextSource::new(Cursor::new(data), Arc::new(TagCatalog::builtin().clone()));

        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].payload(), "User-Agent: caf\u{fffd}");
        assert_eq!(source.skipped_lines(), 0);
    }

    #[test]
    fn io_errors() {
        struct Failing;

        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("broken pipe"))
            }
        }

        let mut source = TextSource::new(
            BufReader::new(Failing),
            Arc::new(TagCatalog::builtin().clone()),
        );
        assert!(matches!(source.next_chunk(), Err(SourceError::Io(_))));
    }

    #[test]
    fn iter_source() {
        let chunks = vec![
            Chunk::new("reqstart", 1, Side::Client, "a"),
            Chunk::new("reqend", 1, Side::Client, "b"),
        ];
        assert_eq!(collect(IterSource::new(chunks.clone())), chunks);
    }
}
