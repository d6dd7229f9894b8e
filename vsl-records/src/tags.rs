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

//! Mapping between numeric log tag codes and canonical tag names

use log::warn;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::TagError;

/// Tag table of Varnish 3, indexed by tag code
const VARNISH3_TAGS: &[&str] = &[
    "Debug",
    "Error",
    "CLI",
    "StatSess",
    "ReqEnd",
    "SessionOpen",
    "SessionClose",
    "BackendOpen",
    "BackendXID",
    "BackendReuse",
    "BackendClose",
    "HttpGarbage",
    "Backend",
    "Length",
    "FetchError",
    "RxRequest",
    "RxResponse",
    "RxStatus",
    "RxURL",
    "RxProtocol",
    "RxHeader",
    "TxRequest",
    "TxResponse",
    "TxStatus",
    "TxURL",
    "TxProtocol",
    "TxHeader",
    "ObjRequest",
    "ObjResponse",
    "ObjStatus",
    "ObjURL",
    "ObjProtocol",
    "ObjHeader",
    "LostHeader",
    "TTL",
    "Fetch_Body",
    "VCL_acl",
    "VCL_call",
    "VCL_trace",
    "VCL_return",
    "VCL_error",
    "ReqStart",
    "Hit",
    "HitPass",
    "ExpBan",
    "ExpKill",
    "WorkThread",
    "ESI_xmlerror",
    "Hash",
    "Backend_health",
    "VCL_Log",
    "Gzip",
];

/// Read-only catalog of log tags
///
/// The catalog is built once from the tag table supplied by the log producer. All names are
/// normalized to lowercase, lookups by name are case-insensitive. Since the catalog is immutable
/// after construction, it can be shared between threads freely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagCatalog {
    names: Vec<Option<Arc<str>>>,
    codes: HashMap<Arc<str>, u16>,
}

impl TagCatalog {
    /// Builds a catalog from `(code, name)` pairs. Entries without a name are holes in the
    /// upstream table and are skipped.
    pub fn from_table<I, S>(table: I) -> Self
    where
        I: IntoIterator<Item = (u16, Option<S>)>,
        S: AsRef<str>,
    {
        let mut catalog = Self::default();
        for (code, name) in table {
            let Some(name) = name else {
                continue;
            };

            let name: Arc<str> = name.as_ref().to_ascii_lowercase().into();
            let index = usize::from(code);
            if catalog.names.len() <= index {
                catalog.names.resize(index + 1, None);
            }
            if let Some(previous) = catalog.names[index].replace(name.clone()) {
                if catalog.codes.get(&previous) == Some(&code) {
                    catalog.codes.remove(&previous);
                }
            }

            if let Some(existing) = catalog.codes.get(&name) {
                warn!("Log tag {name} defined for codes {existing} and {code}, keeping the former");
            } else {
                catalog.codes.insert(name, code);
            }
        }
        catalog
    }

    /// Builds a catalog from a list of names indexed by tag code. Fails if the list has more
    /// entries than there are tag codes.
    pub fn from_names<I, S>(names: I) -> Result<Self, TagError>
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let table = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                u16::try_from(index)
                    .map(|code| (code, name))
                    .map_err(|_| TagError::TableTooLarge(index))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_table(table))
    }

    /// The Varnish 3 tag vocabulary, initialized on first use.
    pub fn builtin() -> &'static Self {
        static BUILTIN: Lazy<TagCatalog> =
            Lazy::new(|| TagCatalog::from_table((0u16..).zip(VARNISH3_TAGS.iter().map(Some))));
        &BUILTIN
    }

    /// Number of tags in the catalog
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    /// Checks whether the catalog has no tags
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Returns the canonical name of a tag code.
    pub fn name_of(&self, code: u16) -> Option<&str> {
        self.shared_name(code).map(|name| name.as_ref())
    }

    pub(crate) fn shared_name(&self, code: u16) -> Option<&Arc<str>> {
        self.names.get(usize::from(code))?.as_ref()
    }

    /// Returns the code of the tag with the given name, ignoring case.
    pub fn code_of(&self, name: &str) -> Result<u16, TagError> {
        self.codes
            .get(name.to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| TagError::Unknown(name.to_owned()))
    }

    /// Resolves a tag from the first `match_length` characters of `name` (all of it if `None`).
    ///
    /// A tag whose name is exactly as long as the prefix always wins. Otherwise the prefix has
    /// to be unique among the catalog’s tags.
    pub fn code_of_prefix(&self, name: &str, match_length: Option<usize>) -> Result<u16, TagError> {
        let prefix = match match_length {
            Some(length) => name.get(..length).unwrap_or(name),
            None => name,
        }
        .to_ascii_lowercase();

        let mut found = None;
        for (code, tag) in self.iter() {
            if !tag.starts_with(prefix.as_str()) {
                continue;
            }
            if tag.len() == prefix.len() {
                return Ok(code);
            }
            found = match found {
                None => Some(Ok(code)),
                Some(_) => Some(Err(TagError::Ambiguous(name.to_owned()))),
            };
        }
        found.unwrap_or_else(|| Err(TagError::Unknown(name.to_owned())))
    }

    /// Iterates over all `(code, name)` pairs in the order of codes.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &str)> + '_ {
        self.names
            .iter()
            .enumerate()
            .filter_map(|(index, name)| Some((u16::try_from(index).ok()?, name.as_deref()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn builtin_lookup() {
        let catalog = TagCatalog::builtin();
        assert_eq!(catalog.len(), VARNISH3_TAGS.len());
        assert_eq!(catalog.name_of(0), Some("debug"));
        assert_eq!(catalog.name_of(4), Some("reqend"));
        assert_eq!(catalog.name_of(9), Some("backendreuse"));
        assert_eq!(catalog.name_of(1000), None);

        assert_eq!(catalog.code_of("ReqStart"), Ok(41));
        assert_eq!(catalog.code_of("reqstart"), Ok(41));
        assert_eq!(catalog.code_of("VCL_CALL"), Ok(37));
        assert_eq!(
            catalog.code_of("nosuchtag"),
            Err(TagError::Unknown("nosuchtag".to_owned()))
        );

        for (code, name) in catalog.iter() {
            assert_eq!(catalog.code_of(name), Ok(code));
        }
    }

    #[test]
    fn table_with_holes() {
        let catalog = TagCatalog::from_table([
            (0, Some("Debug")),
            (3, Some("ReqStart")),
            (5, None),
            (7, Some("ReqEnd")),
        ]);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.name_of(1), None);
        assert_eq!(catalog.name_of(3), Some("reqstart"));
        assert_eq!(catalog.name_of(5), None);
        assert_eq!(catalog.name_of(7), Some("reqend"));
        assert_eq!(
            catalog.iter().collect::<Vec<_>>(),
            vec![(0, "debug"), (3, "reqstart"), (7, "reqend")]
        );
    }

    #[test]
    fn duplicate_names() {
        let catalog = TagCatalog::from_table([(0, Some("Hash")), (1, Some("hash"))]);
        assert_eq!(catalog.code_of("hash"), Ok(0));
        assert_eq!(catalog.name_of(1), Some("hash"));

        // Redefining a code drops the old name
        let catalog = TagCatalog::from_table([(0, Some("Hash")), (0, Some("Gzip"))]);
        assert_eq!(catalog.code_of("gzip"), Ok(0));
        assert!(catalog.code_of("hash").is_err());
    }

    #[test]
    fn table_size_limit() {
        let catalog = TagCatalog::from_table([(u16::MAX, Some("Last"))]);
        assert_eq!(catalog.code_of("last"), Ok(u16::MAX));
        assert_eq!(catalog.iter().collect::<Vec<_>>(), vec![(u16::MAX, "last")]);

        let names = std::iter::repeat(None::<&str>)
            .take(usize::from(u16::MAX))
            .chain([Some("Last")]);
        let catalog = TagCatalog::from_names(names).unwrap();
        assert_eq!(catalog.name_of(u16::MAX), Some("last"));

        let names = std::iter::repeat(None::<&str>)
            .take(usize::from(u16::MAX) + 1)
            .chain([Some("Overflow")]);
        assert_eq!(
            TagCatalog::from_names(names),
            Err(TagError::TableTooLarge(usize::from(u16::MAX) + 1))
        );
    }

    #[test]
    fn prefix_lookup() {
        let catalog = TagCatalog::builtin();
        assert_eq!(catalog.code_of_prefix("ReqStart", None), Ok(41));
        assert_eq!(catalog.code_of_prefix("reqs", None), Ok(41));
        assert_eq!(catalog.code_of_prefix("reqstartxyz", Some(4)), Ok(41));
        assert_eq!(
            catalog.code_of_prefix("req", None),
            Err(TagError::Ambiguous("req".to_owned()))
        );
        assert_eq!(
            catalog.code_of_prefix("bogus", None),
            Err(TagError::Unknown("bogus".to_owned()))
        );

        // Exact match wins over longer tags with the same prefix
        assert_eq!(catalog.code_of_prefix("backend", None), Ok(12));
        assert_eq!(catalog.code_of_prefix("hit", None), Ok(42));
    }
}
