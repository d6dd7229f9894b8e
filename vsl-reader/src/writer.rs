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

//! Handles writing output on a separate task

use chrono::{DateTime, Local, Utc};
use log::error;
use std::fs::File;
use std::io::{stdout, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::Receiver;
use vsl_records::{Record, Side};

use crate::configuration::LogField;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LogToken {
    None,
    Side(Side),
    Number(u64),
    RemoteAddr(IpAddr),
    Verbatim(String),
    Quoted(String),
    TimeLocal,
    TimeISO,
    ProcessingTime(f64),
}

impl LogToken {
    fn verbatim(value: Option<&str>) -> Self {
        value.map_or(Self::None, |value| Self::Verbatim(value.to_owned()))
    }

    fn quoted(value: Option<impl Into<String>>) -> Self {
        value.map_or(Self::None, |value| Self::Quoted(value.into()))
    }

    fn number(value: Option<impl Into<u64>>) -> Self {
        value.map_or(Self::None, |value| Self::Number(value.into()))
    }
}

#[derive(Debug)]
pub(crate) struct LogData {
    time: DateTime<Utc>,
    tokens: Vec<LogToken>,
}

impl LogData {
    /// Extracts the configured fields from a completed record.
    pub(crate) fn from_record(record: &Record, format: &[LogField]) -> Self {
        let exchange = record.exchange();
        let client = record.client();
        let backend = record.backend();

        let mut tokens = Vec::with_capacity(format.len());
        for field in format {
            tokens.push(match field {
                LogField::None => LogToken::None,
                LogField::Side => LogToken::Side(record.side()),
                LogField::Fd => LogToken::Number(record.fd().into()),
                LogField::Xid => LogToken::verbatim(record.xid()),
                LogField::RemoteAddr => {
                    let addr = client.and_then(|client| client.client_ip.as_deref());
                    match addr.map(str::parse::<IpAddr>) {
                        Some(Ok(addr)) => LogToken::RemoteAddr(addr),
                        _ => LogToken::verbatim(addr),
                    }
                }
                LogField::RemotePort => {
                    LogToken::number(client.and_then(|client| client.client_port))
                }
                LogField::BackendName => LogToken::quoted(
                    backend.and_then(|backend| backend.backend_name.as_deref()),
                ),
                LogField::TimeLocal => LogToken::TimeLocal,
                LogField::TimeISO => LogToken::TimeISO,
                LogField::Request => {
                    let protocol = match record.side() {
                        Side::Client => &exchange.rx_protocol,
                        Side::Backend => &exchange.tx_protocol,
                    };
                    let parts = [&exchange.method, &exchange.url, protocol];
                    if parts.iter().all(|part| part.is_none()) {
                        LogToken::None
                    } else {
                        LogToken::Quoted(
                            parts
                                .map(|part| part.as_deref().unwrap_or("-"))
                                .join(" "),
                        )
                    }
                }
                LogField::Status => LogToken::number(exchange.status),
                LogField::BytesSent => LogToken::number(exchange.length),
                LogField::ProcessingTime => client
                    .and_then(|client| client.processing_time)
                    .map_or(LogToken::None, LogToken::ProcessingTime),
                LogField::ReceivedHeader(name) => {
                    LogToken::quoted(exchange.rx_headers.get(name.as_str()))
                }
                LogField::SentHeader(name) => {
                    LogToken::quoted(exchange.tx_headers.get(name.as_str()))
                }
                LogField::Faults => LogToken::Number(record.faults().len() as u64),
            });
        }

        Self {
            time: client
                .and_then(|client| client.started_at)
                .unwrap_or_else(Utc::now),
            tokens,
        }
    }
}

#[derive(Debug)]
pub(crate) enum WriterMessage {
    Reopen,
    Stop,
    LogData(LogData),
    Text(String),
}

fn open_file(path: &Path) -> Box<dyn Write + Send> {
    if path.as_os_str() != "-" {
        match File::options().append(true).create(true).open(path) {
            Ok(file) => return Box::new(file),
            Err(err) => {
                error!(
                    "Failed opening output file {} (cause: {err}), falling back to stdout",
                    path.display()
                );
            }
        }
    }
    Box::new(stdout())
}

fn write_escaped(buf: &mut Vec<u8>, data: impl AsRef<[u8]>) -> Result<(), std::io::Error> {
    fn is_allowed(byte: u8) -> bool {
        (b' '..=b'~').contains(&byte) && byte != b'"' && byte != b'\\'
    }

    buf.push(b'"');
    for byte in data.as_ref() {
        if is_allowed(*byte) {
            buf.push(*byte);
        } else {
            write!(buf, "\\x{byte:02x}")?;
        }
    }
    buf.push(b'"');

    Ok(())
}

/// Checks whether a value can be written without quotes, without breaking up the line.
fn is_plain(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || b".:-_".contains(&byte))
}

fn stringify_data(buf: &mut Vec<u8>, data: LogData) {
    buf.truncate(0);

    for token in data.tokens {
        if !buf.is_empty() {
            buf.push(b' ');
        }
        let _ = match token {
            LogToken::None => write!(buf, "-"),
            LogToken::Side(side) => write!(buf, "{side}"),
            LogToken::Number(number) => write!(buf, "{number}"),
            LogToken::RemoteAddr(addr) => write!(buf, "{addr}"),
            LogToken::Verbatim(value) if is_plain(&value) => write!(buf, "{value}"),
            LogToken::Verbatim(value) => write_escaped(buf, value),
            LogToken::Quoted(value) => write_escaped(buf, value),
            LogToken::TimeLocal => {
                let time = data
                    .time
                    .with_timezone(&Local)
                    .format("%d/%b/%Y:%H:%M:%S %z");
                write!(buf, "[{time}]")
            }
            LogToken::TimeISO => {
                let time = data.time.with_timezone(&Local).to_rfc3339();
                write!(buf, "[{time}]")
            }
            LogToken::ProcessingTime(seconds) => write!(buf, "{:.3}", seconds * 1000.0),
        };
    }
    buf.push(b'\n');
}

pub(crate) async fn log_writer(path: PathBuf, mut receiver: Receiver<WriterMessage>) {
    let mut writer: Option<Box<dyn Write + Send>> = None;

    let mut buf = Vec::<u8>::with_capacity(4096);

    while let Some(message) = receiver.recv().await {
        let data = match message {
            WriterMessage::Reopen => {
                writer = None;
                continue;
            }
            WriterMessage::Stop => break,
            WriterMessage::LogData(data) => {
                stringify_data(&mut buf, data);
                &buf
            }
            WriterMessage::Text(mut text) => {
                text.push('\n');
                buf.clear();
                buf.extend_from_slice(text.as_bytes());
                &buf
            }
        };

        let output = writer.get_or_insert_with(|| open_file(&path));
        if let Err(err) = output.write_all(data) {
            error!("Failed writing output: {err}");
        }
    }

    if let Some(mut output) = writer {
        let _ = output.flush();
    }
}
