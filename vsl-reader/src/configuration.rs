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

//! Structures handling command line options and YAML deserialization for the reader

use clap::Parser;
use http::HeaderName;
use log::trace;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vsl_records::{Side, TagCatalog, TagError};

/// Failure loading a YAML file
#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("failed opening {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed reading {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid tag table {path}: {source}")]
    Tags { path: String, source: TagError },
}

/// Trait for configuration structures that can be loaded from YAML files
pub(crate) trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let reader = BufReader::new(file);

        let conf = serde_yaml::from_reader(reader).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        trace!("Loaded configuration file: {conf:#?}");

        Ok(conf)
    }
}

/// Aggregate Varnish log dumps into one line per transaction
#[derive(Debug, Default, Parser)]
#[command(version)]
pub(crate) struct ReaderOpt {
    /// Text dump as written by varnishlog, - reads standard input.
    #[arg(short, long)]
    pub(crate) input: Option<PathBuf>,
    /// Output file path, - writes to standard output.
    #[arg(short, long)]
    pub(crate) output: Option<PathBuf>,
    /// The path to the configuration file.
    #[arg(short, long)]
    pub(crate) conf: Option<PathBuf>,
    /// YAML file listing log tag names indexed by tag code.
    #[arg(long)]
    pub(crate) tags: Option<PathBuf>,
    /// Write a multi-line summary per transaction instead of a log line.
    #[arg(long, conflicts_with = "raw")]
    pub(crate) summary: bool,
    /// Write every chunk as it is read, without aggregating transactions.
    #[arg(long)]
    pub(crate) raw: bool,
}

/// An individual log field
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub(crate) enum LogField {
    /// Skipped field, `-` in config file
    None,
    /// Transaction kind, `side` in config file
    Side,
    /// Descriptor id, `fd` in config file
    Fd,
    /// Transaction id, `xid` in config file
    Xid,
    /// Client address, `remote_addr` in config file
    RemoteAddr,
    /// Client port, `remote_port` in config file
    RemotePort,
    /// Upstream server name, `backend_name` in config file
    BackendName,
    /// Local time in the Common Log Format, `time_local` in config file
    TimeLocal,
    /// Local time in the ISO 8601 format, `time_iso8601` in config file
    TimeISO,
    /// Request line like `"GET / HTTP/1.1"`, `request` in config file
    Request,
    /// Numeric response status code, `status` in config file
    Status,
    /// Length of the response body, `bytes_sent` in config file
    BytesSent,
    /// Time it took to process the request, `processing_time` in config file
    ProcessingTime,
    /// A received header, `http_<header>` in config file
    ReceivedHeader(HeaderName),
    /// A sent header, `sent_http_<header>` in config file
    SentHeader(HeaderName),
    /// Number of faults noticed, `faults` in config file
    Faults,
}

impl LogField {
    /// Log format used if none is configured
    pub(crate) fn default_format() -> Vec<Self> {
        vec![
            Self::Side,
            Self::Xid,
            Self::RemoteAddr,
            Self::BackendName,
            Self::TimeLocal,
            Self::Request,
            Self::Status,
            Self::BytesSent,
            Self::ProcessingTime,
        ]
    }
}

impl TryFrom<&str> for LogField {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "-" => Ok(Self::None),
            "side" => Ok(Self::Side),
            "fd" => Ok(Self::Fd),
            "xid" => Ok(Self::Xid),
            "remote_addr" => Ok(Self::RemoteAddr),
            "remote_port" => Ok(Self::RemotePort),
            "backend_name" => Ok(Self::BackendName),
            "time_local" => Ok(Self::TimeLocal),
            "time_iso8601" => Ok(Self::TimeISO),
            "request" => Ok(Self::Request),
            "status" => Ok(Self::Status),
            "bytes_sent" => Ok(Self::BytesSent),
            "processing_time" => Ok(Self::ProcessingTime),
            "faults" => Ok(Self::Faults),
            name => {
                if let Some(header) = name.strip_prefix("http_") {
                    let header = header.replace('_', "-");
                    Ok(Self::ReceivedHeader(
                        HeaderName::try_from(header).map_err(|err| err.to_string())?,
                    ))
                } else if let Some(header) = name.strip_prefix("sent_http_") {
                    let header = header.replace('_', "-");
                    Ok(Self::SentHeader(
                        HeaderName::try_from(header).map_err(|err| err.to_string())?,
                    ))
                } else {
                    Err(format!("Unsupported log field {name}"))
                }
            }
        }
    }
}

impl TryFrom<String> for LogField {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

/// What gets written per transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OutputFormat {
    /// One line built from the configured log fields
    #[default]
    Line,
    /// Multi-line human readable summary
    Summary,
    /// Every chunk on its own line, no aggregation
    Raw,
}

/// Transaction kind to be written, `client` or `backend` in config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SideName {
    Client,
    Backend,
}

impl From<SideName> for Side {
    fn from(value: SideName) -> Self {
        match value {
            SideName::Client => Self::Client,
            SideName::Backend => Self::Backend,
        }
    }
}

/// Configuration settings of the reader
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ReaderConf {
    /// Text dump to read, `-` for standard input
    pub(crate) input: PathBuf,
    /// Output file path, `-` for standard output
    pub(crate) output: PathBuf,
    /// YAML file with the tag table, built-in Varnish 3 tags if missing
    pub(crate) tags_file: Option<PathBuf>,
    /// What gets written per transaction
    pub(crate) output_format: OutputFormat,
    /// List of fields to be logged
    ///
    /// See [`LogField`] for a list of supported values. [`LogField::default_format`] is used if
    /// the list is empty.
    pub(crate) log_format: Vec<LogField>,
    /// Transaction kinds to be written, all of them if empty
    pub(crate) sides: Vec<SideName>,
}

impl Default for ReaderConf {
    fn default() -> Self {
        Self {
            input: PathBuf::from("-"),
            output: PathBuf::from("-"),
            tags_file: None,
            output_format: OutputFormat::default(),
            log_format: Vec::new(),
            sides: Vec::new(),
        }
    }
}

impl ReaderConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub(crate) fn merge_with_opt(&mut self, opt: ReaderOpt) {
        if let Some(input) = opt.input {
            self.input = input;
        }
        if let Some(output) = opt.output {
            self.output = output;
        }
        if let Some(tags) = opt.tags {
            self.tags_file = Some(tags);
        }
        if opt.summary {
            self.output_format = OutputFormat::Summary;
        }
        if opt.raw {
            self.output_format = OutputFormat::Raw;
        }
        if self.log_format.is_empty() {
            self.log_format = LogField::default_format();
        }
    }

    /// Checks whether transactions of the given kind should be written.
    pub(crate) fn includes(&self, side: Side) -> bool {
        self.sides.is_empty() || self.sides.iter().any(|name| Side::from(*name) == side)
    }

    /// Loads the tag catalog from the configured file or falls back to the built-in one.
    pub(crate) fn load_catalog(&self) -> Result<TagCatalog, ConfigError> {
        match &self.tags_file {
            Some(path) => {
                let names = Vec::<Option<String>>::load_from_yaml(path)?;
                TagCatalog::from_names(names).map_err(|source| ConfigError::Tags {
                    path: path.display().to_string(),
                    source,
                })
            }
            None => Ok(TagCatalog::builtin().clone()),
        }
    }
}
