//! Entry point of the isolated archival worker process.

use std::collections::HashSet;

use anyhow::Context;
use futures_util::StreamExt;
use tokio::{io::AsyncRead, sync::watch};
use tokio_util::{
    codec::{FramedRead, LinesCodec},
    sync::CancellationToken,
};
use tracing::{info, warn};

use super::{store, supervisor::WorkerCommand, ArchivalWorker};
use crate::config::ArchivalSettings;

const MAX_COMMAND_LEN: usize = 4 * 1024 * 1024;

pub async fn run_worker_process(settings: ArchivalSettings) -> anyhow::Result<()> {
    let location = settings
        .store_url
        .clone()
        .context("ARCHIVE_STORE_URL is not set; archival worker has nothing to do")?;
    let store = store::from_location(&location, settings.store_token.clone())
        .context("failed to build artifact store")?;
    let worker = ArchivalWorker::new(&settings, store);

    let (live_tx, live_rx) = watch::channel(HashSet::new());
    let shutdown = CancellationToken::new();
    let commands = tokio::spawn(read_commands(tokio::io::stdin(), live_tx, shutdown.clone()));
    let signals = tokio::spawn(cancel_on_signal(shutdown.clone()));

    worker.run(live_rx, shutdown).await;

    commands.abort();
    signals.abort();
    Ok(())
}

/// Apply supervisor commands until shutdown, EOF or a broken pipe.
pub async fn read_commands<R>(
    input: R,
    live: watch::Sender<HashSet<String>>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(input, LinesCodec::new_with_max_length(MAX_COMMAND_LEN));
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => match serde_json::from_str::<WorkerCommand>(&line) {
                Ok(WorkerCommand::LiveTasks { keys }) => {
                    live.send_replace(keys.into_iter().collect());
                }
                Ok(WorkerCommand::Shutdown) => {
                    info!("shutdown requested by supervisor");
                    shutdown.cancel();
                    return;
                }
                Err(e) => warn!(error = %e, "ignoring malformed worker command"),
            },
            Some(Err(e)) => {
                warn!(error = %e, "worker command stream failed");
                shutdown.cancel();
                return;
            }
            None => {
                info!("supervisor closed the command stream");
                shutdown.cancel();
                return;
            }
        }
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut int)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        warn!("signal handlers unavailable");
        return;
    };
    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn live_set_is_replaced_and_eof_shuts_down() {
        let input: &[u8] = b"{\"command\":\"live_tasks\",\"keys\":[\"a\",\"b\"]}\nnot json\n{\"command\":\"live_tasks\",\"keys\":[\"c\"]}\n";
        let (tx, rx) = watch::channel(HashSet::new());
        let shutdown = CancellationToken::new();

        read_commands(input, tx, shutdown.clone()).await;

        assert_eq!(*rx.borrow(), HashSet::from(["c".to_string()]));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_command_stops_reading() {
        let input: &[u8] =
            b"{\"command\":\"shutdown\"}\n{\"command\":\"live_tasks\",\"keys\":[\"late\"]}\n";
        let (tx, rx) = watch::channel(HashSet::new());
        let shutdown = CancellationToken::new();

        read_commands(input, tx, shutdown.clone()).await;

        assert!(rx.borrow().is_empty());
        assert!(shutdown.is_cancelled());
    }
}
