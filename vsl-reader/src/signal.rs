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

//! Unix signal processing

use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::Sender;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use vsl_records::CancelToken;

use crate::writer::WriterMessage;

fn listen_to_signal<F, Fut>(kind: SignalKind, mut action: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut sig = match signal(kind) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(
                    "Failed registering for signal {}: {err}",
                    kind.as_raw_value()
                );
                return;
            }
        };

        while sig.recv().await.is_some() {
            action().await;
        }
    })
}

fn reopen_on(kind: SignalKind, sender: &Sender<WriterMessage>) -> JoinHandle<()> {
    let sender = sender.clone();
    listen_to_signal(kind, move || {
        let sender = sender.clone();
        async move {
            if let Err(err) = sender.send(WriterMessage::Reopen).await {
                error!("Failed reopening output file, writer crashed? {err}");
            }
        }
    })
}

fn cancel_on(
    kind: SignalKind,
    cancel: &CancelToken,
    interrupted: &Arc<Notify>,
) -> JoinHandle<()> {
    let cancel = cancel.clone();
    let interrupted = interrupted.clone();
    listen_to_signal(kind, move || {
        info!("Received signal {}, stopping", kind.as_raw_value());
        cancel.cancel();
        interrupted.notify_one();
        std::future::ready(())
    })
}

/// Starts listening to signals: `HUP` and `USR1` re-open the output file, `INT` and `TERM` stop
/// dispatching and wake up anyone waiting on `interrupted`. The listeners run until aborted.
pub(crate) fn listen(
    sender: &Sender<WriterMessage>,
    cancel: &CancelToken,
    interrupted: &Arc<Notify>,
) -> Vec<JoinHandle<()>> {
    vec![
        reopen_on(SignalKind::hangup(), sender),
        reopen_on(SignalKind::user_defined1(), sender),
        cancel_on(SignalKind::interrupt(), cancel, interrupted),
        cancel_on(SignalKind::terminate(), cancel, interrupted),
    ]
}
