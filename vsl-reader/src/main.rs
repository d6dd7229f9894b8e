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

#![doc = include_str!("../README.md")]

mod configuration;
#[cfg(unix)]
mod signal;
mod writer;

use clap::Parser;
use log::{error, info};
use std::fs::File;
use std::io::{stdin, BufRead, BufReader};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{channel, Sender};
use tokio::sync::{oneshot, Notify};
use vsl_records::{CancelToken, DispatchError, DispatchStats, Dispatcher, Termination, TextSource};

use configuration::{ConfigError, FromYaml, OutputFormat, ReaderConf, ReaderOpt};
use writer::{log_writer, LogData, WriterMessage};

/// Time the dispatch thread gets to notice a cancellation before it is left behind
const CANCEL_GRACE: Duration = Duration::from_millis(500);

type DispatchOutcome = (DispatchStats, Result<Termination, DispatchError>);

#[derive(Debug, Error)]
enum ReaderError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed opening input {path}: {source}")]
    Input {
        path: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("failed starting dispatch thread: {0}")]
    Thread(std::io::Error),
    #[error("dispatch thread stopped unexpectedly")]
    ThreadStopped(#[from] oneshot::error::RecvError),
    #[error("writer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead + Send>, ReaderError> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(stdin())));
    }

    let file = File::open(path).map_err(|source| ReaderError::Input {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Box::new(BufReader::new(file)))
}

/// Runs the dispatch loop, sending output for every record (or chunk) to the writer.
fn dispatch<R: BufRead>(
    conf: &ReaderConf,
    source: TextSource<R>,
    cancel: CancelToken,
    sender: &Sender<WriterMessage>,
) -> DispatchOutcome {
    let mut dispatcher = Dispatcher::new(source).with_cancel_token(cancel);
    let result = match conf.output_format {
        OutputFormat::Raw => dispatcher.run_chunks(|chunk| {
            if !conf.includes(chunk.side()) {
                return Ok(());
            }
            sender.blocking_send(WriterMessage::Text(chunk.to_string()))
        }),
        OutputFormat::Summary => dispatcher.run(|record| {
            if !conf.includes(record.side()) {
                return Ok(());
            }
            sender.blocking_send(WriterMessage::Text(record.to_string()))
        }),
        OutputFormat::Line => dispatcher.run(|record| {
            if !conf.includes(record.side()) {
                return Ok(());
            }
            let data = LogData::from_record(&record, &conf.log_format);
            sender.blocking_send(WriterMessage::LogData(data))
        }),
    };

    let stats = *dispatcher.stats();
    let skipped = dispatcher.into_source().skipped_lines();
    if skipped > 0 {
        info!("Skipped {skipped} unparseable input lines");
    }
    (stats, result)
}

/// Runs the dispatch loop on a separate thread. Reading the input blocks, so the thread might
/// never finish and must not be joined.
fn spawn_dispatch<R: BufRead + Send + 'static>(
    conf: ReaderConf,
    source: TextSource<R>,
    cancel: CancelToken,
    sender: Sender<WriterMessage>,
) -> Result<oneshot::Receiver<DispatchOutcome>, ReaderError> {
    let (done_sender, done) = oneshot::channel();
    std::thread::Builder::new()
        .name("dispatch".to_owned())
        .spawn(move || {
            let _ = done_sender.send(dispatch(&conf, source, cancel, &sender));
        })
        .map_err(ReaderError::Thread)?;
    Ok(done)
}

/// Waits for the dispatch thread to finish. Returns `None` if an interruption was requested and
/// the thread didn’t stop within the grace period, likely because it is waiting for input.
async fn await_dispatch(
    mut done: oneshot::Receiver<DispatchOutcome>,
    interrupted: &Notify,
) -> Result<Option<DispatchOutcome>, ReaderError> {
    tokio::select! {
        outcome = &mut done => return Ok(Some(outcome?)),
        () = interrupted.notified() => {}
    }

    match tokio::time::timeout(CANCEL_GRACE, done).await {
        Ok(outcome) => Ok(Some(outcome?)),
        Err(_) => Ok(None),
    }
}

async fn run(conf: ReaderConf) -> Result<Termination, ReaderError> {
    let catalog = Arc::new(conf.load_catalog()?);
    let source = TextSource::new(open_input(&conf.input)?, catalog);

    let (sender, receiver) = channel(1000);
    let writer = tokio::spawn(log_writer(conf.output.clone(), receiver));

    let cancel = CancelToken::new();
    let interrupted = Arc::new(Notify::new());
    #[cfg(unix)]
    let listeners = signal::listen(&sender, &cancel, &interrupted);
    #[cfg(not(unix))]
    let listeners: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    let outcome = match spawn_dispatch(conf, source, cancel, sender.clone()) {
        Ok(done) => await_dispatch(done, &interrupted).await,
        Err(err) => Err(err),
    };

    for listener in listeners {
        listener.abort();
    }
    // A dispatch thread left waiting for input still holds a sender
    if sender.send(WriterMessage::Stop).await.is_err() {
        error!("Failed stopping writer, writer crashed?");
    }
    writer.await?;

    match outcome? {
        Some((stats, result)) => {
            info!("Dispatching finished: {stats}");
            Ok(result?)
        }
        None => {
            info!("Stopped while waiting for input, incomplete transactions are discarded");
            Ok(Termination::Cancelled)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let opt = ReaderOpt::parse();

    let mut conf = match &opt.conf {
        Some(path) => match ReaderConf::load_from_yaml(path) {
            Ok(conf) => conf,
            Err(err) => {
                error!("{err}");
                return ExitCode::FAILURE;
            }
        },
        None => ReaderConf::default(),
    };
    conf.merge_with_opt(opt);

    match run(conf).await {
        Ok(Termination::Exhausted) => ExitCode::SUCCESS,
        Ok(Termination::Cancelled) => {
            info!("Cancelled before the end of input");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
