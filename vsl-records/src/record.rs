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

//! Per-transaction records assembled from chunks

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::chunk::{Chunk, Side};
use crate::error::PayloadError;
use crate::headers::Headers;

/// Tags the aggregator derives structured fields from
///
/// Everything else is [`RecordTag::Other`]: such chunks are kept in the record’s history but
/// otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordTag {
    /// `reqstart`: client address, port and transaction id, starts a client record
    ReqStart,
    /// `reqend`: transaction id and timing, completes a client record
    ReqEnd,
    /// `backendopen`: upstream name, starts a backend record
    BackendOpen,
    /// `backendreuse`: upstream name, completes a backend record and opens the next one
    BackendReuse,
    /// `backendclose`: completes a backend record
    BackendClose,
    /// `rxrequest`: request method received from the client
    RxRequest,
    /// `rxurl`: URL received from the client
    RxUrl,
    /// `rxprotocol`: protocol of a received message
    RxProtocol,
    /// `rxheader`: received header line
    RxHeader,
    /// `rxstatus`: status code received from the upstream server
    RxStatus,
    /// `rxresponse`: response phrase received from the upstream server
    RxResponse,
    /// `txrequest`: request method sent to the upstream server
    TxRequest,
    /// `txurl`: URL sent to the upstream server
    TxUrl,
    /// `txprotocol`: protocol of a sent message
    TxProtocol,
    /// `txheader`: sent header line
    TxHeader,
    /// `txstatus`: status code sent to the client
    TxStatus,
    /// `txresponse`: response phrase sent to the client
    TxResponse,
    /// `length`: response body length
    Length,
    /// `hash`: input to the cache key
    Hash,
    /// `vcl_call`: VCL subroutine called
    VclCall,
    /// `vcl_return`: outcome of the preceding VCL subroutine call
    VclReturn,
    /// Any other tag, including unknown ones
    Other,
}

impl RecordTag {
    /// All tags with a meaning to the aggregator
    pub const KNOWN: [Self; 21] = [
        Self::ReqStart,
        Self::ReqEnd,
        Self::BackendOpen,
        Self::BackendReuse,
        Self::BackendClose,
        Self::RxRequest,
        Self::RxUrl,
        Self::RxProtocol,
        Self::RxHeader,
        Self::RxStatus,
        Self::RxResponse,
        Self::TxRequest,
        Self::TxUrl,
        Self::TxProtocol,
        Self::TxHeader,
        Self::TxStatus,
        Self::TxResponse,
        Self::Length,
        Self::Hash,
        Self::VclCall,
        Self::VclReturn,
    ];

    /// Classifies a canonical tag name, `None` standing for an unknown tag.
    pub fn classify(tag: Option<&str>) -> Self {
        match tag {
            Some("reqstart") => Self::ReqStart,
            Some("reqend") => Self::ReqEnd,
            Some("backendopen") => Self::BackendOpen,
            Some("backendreuse") => Self::BackendReuse,
            Some("backendclose") => Self::BackendClose,
            Some("rxrequest") => Self::RxRequest,
            Some("rxurl") => Self::RxUrl,
            Some("rxprotocol") => Self::RxProtocol,
            Some("rxheader") => Self::RxHeader,
            Some("rxstatus") => Self::RxStatus,
            Some("rxresponse") => Self::RxResponse,
            Some("txrequest") => Self::TxRequest,
            Some("txurl") => Self::TxUrl,
            Some("txprotocol") => Self::TxProtocol,
            Some("txheader") => Self::TxHeader,
            Some("txstatus") => Self::TxStatus,
            Some("txresponse") => Self::TxResponse,
            Some("length") => Self::Length,
            Some("hash") => Self::Hash,
            Some("vcl_call") => Self::VclCall,
            Some("vcl_return") => Self::VclReturn,
            _ => Self::Other,
        }
    }

    /// Canonical tag name, `None` for [`RecordTag::Other`]
    pub fn name(&self) -> Option<&'static str> {
        Some(match self {
            Self::ReqStart => "reqstart",
            Self::ReqEnd => "reqend",
            Self::BackendOpen => "backendopen",
            Self::BackendReuse => "backendreuse",
            Self::BackendClose => "backendclose",
            Self::RxRequest => "rxrequest",
            Self::RxUrl => "rxurl",
            Self::RxProtocol => "rxprotocol",
            Self::RxHeader => "rxheader",
            Self::RxStatus => "rxstatus",
            Self::RxResponse => "rxresponse",
            Self::TxRequest => "txrequest",
            Self::TxUrl => "txurl",
            Self::TxProtocol => "txprotocol",
            Self::TxHeader => "txheader",
            Self::TxStatus => "txstatus",
            Self::TxResponse => "txresponse",
            Self::Length => "length",
            Self::Hash => "hash",
            Self::VclCall => "vcl_call",
            Self::VclReturn => "vcl_return",
            Self::Other => return None,
        })
    }

    /// Checks whether this tag starts a transaction on the given side.
    pub fn starts(&self, side: Side) -> bool {
        matches!(
            (side, self),
            (Side::Client, Self::ReqStart) | (Side::Backend, Self::BackendOpen)
        )
    }

    /// Checks whether this tag completes a transaction on the given side.
    pub fn completes(&self, side: Side) -> bool {
        matches!(
            (side, self),
            (Side::Client, Self::ReqEnd)
                | (Side::Backend, Self::BackendClose | Self::BackendReuse)
        )
    }
}

/// Lifecycle state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// No start tag seen yet
    Inactive,
    /// Collecting chunks
    Active,
    /// Terminating tag seen, the record won’t change any more
    Complete,
}

/// Result of applying a chunk to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The chunk didn’t belong to this record and was discarded
    Ignored,
    /// The chunk was a start tag and activated the record
    Started,
    /// The chunk was added to an active record
    Accumulated,
    /// The chunk was the terminating tag
    Completed,
}

/// Consistency problem noticed while assembling a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A payload didn’t have the expected format, the corresponding field was left unset
    MalformedPayload {
        /// Tag of the offending chunk
        tag: &'static str,
        /// What was wrong with the payload
        error: PayloadError,
    },
    /// Transaction id at completion differs from the one logged at start
    IdentityMismatch {
        /// Transaction id from `reqstart`
        started: String,
        /// Transaction id from `reqend`
        ended: String,
    },
    /// A `vcl_return` without a preceding `vcl_call`
    UnpairedVclReturn(String),
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedPayload { tag, error } => write!(f, "malformed {tag} payload: {error}"),
            Self::IdentityMismatch { started, ended } => {
                write!(f, "transaction started as {started} but ended as {ended}")
            }
            Self::UnpairedVclReturn(outcome) => {
                write!(f, "vcl_return {outcome} without vcl_call")
            }
        }
    }
}

/// Fields common to client and backend records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exchange {
    /// Protocol of the received message, e.g. `HTTP/1.1`
    pub rx_protocol: Option<String>,
    /// Protocol of the sent message
    pub tx_protocol: Option<String>,
    /// Request method
    pub method: Option<String>,
    /// Request URL
    pub url: Option<String>,
    /// Response status code
    pub status: Option<u16>,
    /// Response phrase, e.g. `OK`
    pub response: Option<String>,
    /// Response body length in bytes
    pub length: Option<u64>,
    /// Headers received, from the client or from the upstream server
    pub rx_headers: Headers,
    /// Headers sent, to the upstream server or to the client
    pub tx_headers: Headers,
}

/// Fields specific to client records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientDetails {
    /// Transaction id, the stable identifier of the transaction
    pub xid: Option<String>,
    /// Client IP address
    pub client_ip: Option<String>,
    /// Client TCP port
    pub client_port: Option<u16>,
    /// Cache key inputs in logging order
    pub hash_data: Vec<String>,
    /// VCL subroutine calls paired with their outcome, in logging order
    pub vcl_calls: Vec<(String, String)>,
    /// Time the request was received
    pub started_at: Option<DateTime<Utc>>,
    /// Time the response was completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Delay before the request was picked up, in seconds
    pub req_start_delay: Option<f64>,
    /// Processing time in seconds
    pub processing_time: Option<f64>,
    /// Delivery time in seconds
    pub deliver_time: Option<f64>,
    pending_vcl_call: Option<String>,
}

impl ClientDetails {
    /// Returns all outcomes logged for a VCL subroutine.
    pub fn vcl_outcomes<'a>(&'a self, call: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.vcl_calls
            .iter()
            .filter(move |(name, _)| name == call)
            .map(|(_, outcome)| outcome.as_str())
    }
}

/// Fields specific to backend records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendDetails {
    /// Name of the upstream server
    pub backend_name: Option<String>,
    /// `true` if the record was opened by a `backendreuse` hand-off
    pub reused: bool,
}

/// Side specific part of a record
#[derive(Debug, Clone, PartialEq)]
pub enum Details {
    /// Client record fields
    Client(Box<ClientDetails>),
    /// Backend record fields
    Backend(BackendDetails),
}

/// A transaction assembled from the chunks sharing a descriptor id
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fd: u32,
    state: RecordState,
    chunks: Vec<Chunk>,
    faults: Vec<Fault>,
    exchange: Exchange,
    details: Details,
}

impl Record {
    /// Creates an inactive record waiting for its start tag.
    pub fn new(fd: u32, side: Side) -> Self {
        let details = match side {
            Side::Client => Details::Client(Box::default()),
            Side::Backend => Details::Backend(BackendDetails::default()),
        };
        Self {
            fd,
            state: RecordState::Inactive,
            chunks: Vec::new(),
            faults: Vec::new(),
            exchange: Exchange::default(),
            details,
        }
    }

    /// Creates the backend record following a `backendreuse` chunk. The record starts out
    /// active with the reuse chunk as its first chunk.
    pub(crate) fn reused(chunk: Chunk) -> Self {
        let mut record = Self::new(chunk.fd(), Side::Backend);
        record.state = RecordState::Active;
        record.details = Details::Backend(BackendDetails {
            backend_name: None,
            reused: true,
        });
        let tag = RecordTag::classify(chunk.tag());
        record.accumulate(tag, chunk);
        record
    }

    /// Applies a chunk to the record, advancing its state if the chunk is a start or
    /// terminating tag.
    pub fn apply(&mut self, chunk: Chunk) -> Transition {
        if self.state == RecordState::Complete || chunk.side() != self.side() {
            return Transition::Ignored;
        }

        let tag = RecordTag::classify(chunk.tag());
        let transition = match self.state {
            RecordState::Inactive if tag.starts(self.side()) => {
                self.state = RecordState::Active;
                Transition::Started
            }
            RecordState::Active if tag.completes(self.side()) => {
                self.state = RecordState::Complete;
                Transition::Completed
            }
            RecordState::Active => Transition::Accumulated,
            _ => return Transition::Ignored,
        };

        self.accumulate(tag, chunk);
        transition
    }

    fn accumulate(&mut self, tag: RecordTag, chunk: Chunk) {
        let result = match &mut self.details {
            Details::Client(client) => {
                update_client(&mut self.exchange, client, &mut self.faults, tag, &chunk)
            }
            Details::Backend(backend) => update_backend(&mut self.exchange, backend, tag, &chunk),
        };

        if let Err(error) = result {
            let tag = tag.name().unwrap_or("?");
            debug!(
                "Malformed {tag} payload on descriptor {}: {error} ({:?})",
                self.fd,
                chunk.payload()
            );
            self.faults.push(Fault::MalformedPayload { tag, error });
        }

        self.chunks.push(chunk);
    }

    /// Descriptor id the record was collected for
    pub fn fd(&self) -> u32 {
        self.fd
    }

    /// Lifecycle the record belongs to
    pub fn side(&self) -> Side {
        match self.details {
            Details::Client(_) => Side::Client,
            Details::Backend(_) => Side::Backend,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Checks whether the terminating tag has been seen
    pub fn is_complete(&self) -> bool {
        self.state == RecordState::Complete
    }

    /// All chunks of this record in the order they were received
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Consistency problems noticed while assembling the record
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    /// Fields shared by both record kinds
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Side specific fields
    pub fn details(&self) -> &Details {
        &self.details
    }

    /// Client fields if this is a client record
    pub fn client(&self) -> Option<&ClientDetails> {
        match &self.details {
            Details::Client(client) => Some(client),
            Details::Backend(_) => None,
        }
    }

    /// Backend fields if this is a backend record
    pub fn backend(&self) -> Option<&BackendDetails> {
        match &self.details {
            Details::Client(_) => None,
            Details::Backend(backend) => Some(backend),
        }
    }

    /// Transaction id of a client record
    pub fn xid(&self) -> Option<&str> {
        self.client()?.xid.as_deref()
    }

    /// Checks whether a completed record has content worth reporting.
    pub fn is_deliverable(&self) -> bool {
        self.is_complete() && !self.chunks.is_empty()
    }
}

fn split_tokens<const N: usize>(payload: &str) -> Result<[&str; N], PayloadError> {
    let tokens: Vec<_> = payload.split_ascii_whitespace().collect();
    tokens
        .as_slice()
        .try_into()
        .map_err(|_| PayloadError::TokenCount {
            expected: N,
            found: tokens.len(),
        })
}

fn parse_number<T: FromStr>(token: &str) -> Result<T, PayloadError> {
    token
        .trim()
        .parse()
        .map_err(|_| PayloadError::InvalidNumber(token.to_owned()))
}

fn parse_timestamp(token: &str) -> Result<DateTime<Utc>, PayloadError> {
    let seconds: f64 = parse_number(token)?;
    let invalid = || PayloadError::InvalidTimestamp(token.to_owned());
    if !seconds.is_finite() {
        return Err(invalid());
    }

    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0);
    DateTime::<Utc>::from_timestamp(whole as i64, nanos as u32).ok_or_else(invalid)
}

fn update_exchange(
    exchange: &mut Exchange,
    tag: RecordTag,
    payload: &str,
) -> Result<(), PayloadError> {
    match tag {
        RecordTag::RxProtocol => exchange.rx_protocol = Some(payload.to_owned()),
        RecordTag::TxProtocol => exchange.tx_protocol = Some(payload.to_owned()),
        RecordTag::RxHeader => exchange.rx_headers.append_line(payload)?,
        RecordTag::TxHeader => exchange.tx_headers.append_line(payload)?,
        RecordTag::Length => exchange.length = Some(parse_number(payload)?),
        _ => {}
    }
    Ok(())
}

fn update_client(
    exchange: &mut Exchange,
    client: &mut ClientDetails,
    faults: &mut Vec<Fault>,
    tag: RecordTag,
    chunk: &Chunk,
) -> Result<(), PayloadError> {
    let payload = chunk.payload();
    match tag {
        RecordTag::RxRequest => exchange.method = Some(payload.to_owned()),
        RecordTag::RxUrl => exchange.url = Some(payload.to_owned()),
        RecordTag::TxStatus => exchange.status = Some(parse_number(payload)?),
        RecordTag::TxResponse => exchange.response = Some(payload.to_owned()),
        RecordTag::Hash => client.hash_data.push(payload.to_owned()),
        RecordTag::VclCall => client.pending_vcl_call = Some(payload.to_owned()),
        RecordTag::VclReturn => {
            if let Some(call) = client.pending_vcl_call.take() {
                client.vcl_calls.push((call, payload.to_owned()));
            } else {
                debug!("vcl_return {payload} without vcl_call on descriptor {}", chunk.fd());
                faults.push(Fault::UnpairedVclReturn(payload.to_owned()));
            }
        }
        RecordTag::ReqStart => {
            let [ip, port, xid] = split_tokens::<3>(payload)?;
            let port = parse_number(port)?;
            client.client_ip = Some(ip.to_owned());
            client.client_port = Some(port);
            client.xid = Some(xid.to_owned());
        }
        RecordTag::ReqEnd => {
            let [xid, started_at, completed_at, req_start_delay, processing_time, deliver_time] =
                split_tokens::<6>(payload)?;
            let started_at = parse_timestamp(started_at)?;
            let completed_at = parse_timestamp(completed_at)?;
            let req_start_delay = parse_number(req_start_delay)?;
            let processing_time = parse_number(processing_time)?;
            let deliver_time = parse_number(deliver_time)?;

            match &client.xid {
                Some(started) if started != xid => {
                    warn!(
                        "Transaction on descriptor {} started as {started} but ended as {xid}",
                        chunk.fd()
                    );
                    faults.push(Fault::IdentityMismatch {
                        started: started.clone(),
                        ended: xid.to_owned(),
                    });
                }
                Some(_) => {}
                None => client.xid = Some(xid.to_owned()),
            }

            client.started_at = Some(started_at);
            client.completed_at = Some(completed_at);
            client.req_start_delay = Some(req_start_delay);
            client.processing_time = Some(processing_time);
            client.deliver_time = Some(deliver_time);
        }
        _ => update_exchange(exchange, tag, payload)?,
    }
    Ok(())
}

fn update_backend(
    exchange: &mut Exchange,
    backend: &mut BackendDetails,
    tag: RecordTag,
    chunk: &Chunk,
) -> Result<(), PayloadError> {
    let payload = chunk.payload();
    match tag {
        RecordTag::TxRequest => exchange.method = Some(payload.to_owned()),
        RecordTag::TxUrl => exchange.url = Some(payload.to_owned()),
        RecordTag::RxStatus => exchange.status = Some(parse_number(payload)?),
        RecordTag::RxResponse => exchange.response = Some(payload.to_owned()),
        RecordTag::BackendOpen | RecordTag::BackendReuse => {
            let name = payload
                .split_ascii_whitespace()
                .next()
                .ok_or(PayloadError::TokenCount {
                    expected: 1,
                    found: 0,
                })?;
            backend.backend_name = Some(name.to_owned());
        }
        _ => update_exchange(exchange, tag, payload)?,
    }
    Ok(())
}

struct Optional<'a, T>(&'a Option<T>);

impl<T: Display> Display for Optional<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(value) => value.fmt(f),
            None => f.write_str("-"),
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let exchange = &self.exchange;
        match &self.details {
            Details::Client(client) => {
                writeln!(f, "<ClientRequestLog XID: {}", Optional(&client.xid))?;
                writeln!(
                    f,
                    "    Client: {}:{}",
                    Optional(&client.client_ip),
                    Optional(&client.client_port)
                )?;
                writeln!(f)?;
                writeln!(f, "    Timing:")?;
                writeln!(f, "        started   : {}", Optional(&client.started_at))?;
                writeln!(f, "        completed : {}", Optional(&client.completed_at))?;
                writeln!(f, "        delay     : {} [s]", Optional(&client.req_start_delay))?;
                writeln!(f, "        processing: {} [s]", Optional(&client.processing_time))?;
                writeln!(f, "        deliver   : {} [s]", Optional(&client.deliver_time))?;
                writeln!(f)?;
                writeln!(
                    f,
                    "    Request: {} {} {}",
                    Optional(&exchange.rx_protocol),
                    Optional(&exchange.method),
                    Optional(&exchange.url)
                )?;
                writeln!(f, "        headers   : {}", exchange.rx_headers)?;
                writeln!(f)?;
                writeln!(f, "    Hash: {:?}", client.hash_data)?;
                writeln!(f, "    VCL Calls: {:?}", client.vcl_calls)?;
                writeln!(f)?;
                writeln!(
                    f,
                    "    Response: {} {} {} [{}B]",
                    Optional(&exchange.tx_protocol),
                    Optional(&exchange.status),
                    Optional(&exchange.response),
                    Optional(&exchange.length)
                )?;
                writeln!(f, "        headers   : {}", exchange.tx_headers)?;
            }
            Details::Backend(backend) => {
                writeln!(
                    f,
                    "<BackendRequestLog [backend: {}]",
                    Optional(&backend.backend_name)
                )?;
                writeln!(
                    f,
                    "    Request: {} {} {}",
                    Optional(&exchange.tx_protocol),
                    Optional(&exchange.method),
                    Optional(&exchange.url)
                )?;
                writeln!(f, "        headers   : {}", exchange.tx_headers)?;
                writeln!(f)?;
                writeln!(
                    f,
                    "    Response: {} {} {} [{}B]",
                    Optional(&exchange.rx_protocol),
                    Optional(&exchange.status),
                    Optional(&exchange.response),
                    Optional(&exchange.length)
                )?;
                writeln!(f, "        headers   : {}", exchange.rx_headers)?;
            }
        }
        for fault in &self.faults {
            writeln!(f, "    Fault: {fault}")?;
        }
        f.write_str(">")
    }
}
