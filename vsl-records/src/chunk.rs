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

//! Log chunks as delivered by the shared memory log

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::tags::TagCatalog;

/// Lifecycle a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Transaction between a client and the proxy
    Client,
    /// Transaction between the proxy and an upstream server
    Backend,
}

impl Side {
    /// Classification bit marking client chunks
    pub const CLIENT_BIT: u32 = 1 << 0;
    /// Classification bit marking backend chunks
    pub const BACKEND_BIT: u32 = 1 << 1;

    /// Interprets the classification word of the log producer. Anything other than exactly one
    /// of the two bits means the chunk isn’t associated with a transaction.
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            Self::CLIENT_BIT => Some(Self::Client),
            Self::BACKEND_BIT => Some(Self::Backend),
            _ => None,
        }
    }

    /// Interprets the `c`/`b` marker used in text dumps of the log.
    pub fn from_marker(marker: char) -> Option<Self> {
        match marker {
            'c' => Some(Self::Client),
            'b' => Some(Self::Backend),
            _ => None,
        }
    }

    /// Lowercase name of this side
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Backend => "backend",
        }
    }
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single tagged log fragment
///
/// Chunks are immutable once created. The tag name is absent if the chunk’s tag code wasn’t
/// found in the tag catalog, such chunks still end up in record histories but never affect
/// structured fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    tag: Option<Arc<str>>,
    fd: u32,
    side: Side,
    payload: String,
    bitmap: u64,
}

impl Chunk {
    /// Creates a chunk with the given tag name, the name is normalized to lowercase.
    pub fn new(tag: &str, fd: u32, side: Side, payload: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.to_ascii_lowercase().into()),
            fd,
            side,
            payload: payload.into(),
            bitmap: 0,
        }
    }

    /// Creates a chunk whose tag is unknown.
    pub fn unclassified(fd: u32, side: Side, payload: impl Into<String>) -> Self {
        Self {
            tag: None,
            fd,
            side,
            payload: payload.into(),
            bitmap: 0,
        }
    }

    /// Creates a chunk from raw log data, resolving the tag code through the catalog. Payload
    /// bytes that aren’t valid UTF-8 are replaced.
    pub fn from_raw(
        catalog: &TagCatalog,
        code: u16,
        fd: u32,
        side: Side,
        payload: &[u8],
        bitmap: u64,
    ) -> Self {
        Self {
            tag: catalog.shared_name(code).cloned(),
            fd,
            side,
            payload: String::from_utf8_lossy(payload).into_owned(),
            bitmap,
        }
    }

    /// Replaces the auxiliary bitmap.
    pub fn with_bitmap(mut self, bitmap: u64) -> Self {
        self.bitmap = bitmap;
        self
    }

    /// Canonical tag name, `None` for unknown tags
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Descriptor id shared by all chunks of a transaction
    pub fn fd(&self) -> u32 {
        self.fd
    }

    /// Lifecycle this chunk belongs to
    pub fn side(&self) -> Side {
        self.side
    }

    /// Raw payload text
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Auxiliary bitmap, passed through uninterpreted
    pub fn bitmap(&self) -> u64 {
        self.bitmap
    }
}

impl Display for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<LogChunk [{}] tag: {} data: {}>",
            self.side,
            self.tag().unwrap_or("?"),
            self.payload
        )
    }
}
