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

//! Multi-valued header collection

use http::{HeaderMap, HeaderName, HeaderValue};
use log::trace;
use std::fmt::{Display, Formatter};

use crate::error::PayloadError;

/// HTTP headers collected from log lines
///
/// A header name can occur any number of times, all lines are kept in the order they were
/// logged. Names are case-insensitive for lookups but kept as logged. Nothing is validated
/// beyond the `:` separator since clients send arbitrary data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Parses a `Name: value` line and appends the header.
    pub(crate) fn append_line(&mut self, line: &str) -> Result<(), PayloadError> {
        let (name, value) = line.split_once(':').ok_or(PayloadError::MissingSeparator)?;
        self.entries
            .push((name.trim().to_owned(), value.trim().to_owned()));
        Ok(())
    }

    /// Returns the first value of a header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values(name).next()
    }

    /// Returns all values of a header in the order they were logged.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.values(name).collect()
    }

    fn values<'a: 'n, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n {
        self.entries
            .iter()
            .filter(move |(entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Iterates over all `(name, value)` pairs in the order they were logged.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Total number of values
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether no headers were logged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Converts into an HTTP header map. Lines that aren't valid HTTP headers are left out.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => trace!("Leaving out invalid header {name:?}"),
            }
        }
        map
    }
}

impl Display for Headers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (index, (name, value)) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}
