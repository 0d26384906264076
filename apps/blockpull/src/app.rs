//! `send` and `receive` drivers: wire a WebSocket connection to an
//! endpoint and report progress until the transfers settle.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use blockpull_protocol::{TransferProgress, TransferRole, TransferState};
use blockpull_transfer::{
    DirectorySinks, Endpoint, EndpointHandle, FileSource, TransferEvent, calculate_file_checksum,
};
use tokio::net::TcpListener;
use tokio::time::{MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// How long `receive` waits for further announces once everything it
/// knows about has finished.
const LINGER: Duration = Duration::from_secs(1);

/// Offers `files` to the first peer that connects and serves them until
/// the peer disconnects.
pub async fn send(config: Config, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let sources = files
        .iter()
        .map(|path| {
            FileSource::open(path).with_context(|| format!("cannot offer {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("cannot listen on {}", config.listen))?;
    tracing::info!(addr = %listener.local_addr()?, files = sources.len(), "waiting for receiver");

    let stream = tokio::select! {
        accepted = listener.accept() => accepted?.0,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            return Ok(());
        }
    };
    let conn = blockpull_ws_channel::accept(stream, config.transfer.max_message_size).await?;
    let channel = conn.channel.clone();

    let mut endpoint = Endpoint::new(
        conn.channel,
        config.transfer.clone(),
        Arc::new(DirectorySinks::new(&config.output_dir)),
    )?;
    let mut events = endpoint.take_events().context("event stream already taken")?;
    let handle = endpoint.handle();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let inbound = conn.inbound;
    let task = tokio::spawn(async move { endpoint.run(inbound, token).await });

    for source in sources {
        handle.offer(Arc::new(source)).await?;
    }

    let mut ticker = progress_ticker();
    let mut failed = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let TransferEvent::Finished { role: TransferRole::Sender, state, .. } = &event {
                    if !matches!(state, TransferState::Done | TransferState::Cancelled) {
                        failed += 1;
                    }
                }
                log_event(&event);
            }
            _ = ticker.tick() => log_progress(&handle).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                shutdown.cancel();
            }
        }
    }

    task.await??;
    channel.close();

    if failed > 0 {
        anyhow::bail!("{failed} transfer(s) failed");
    }
    tracing::info!("all transfers served");
    Ok(())
}

/// Connects to `url` and downloads every offered file into the output
/// directory.
pub async fn receive(config: Config, url: String) -> anyhow::Result<()> {
    let conn = blockpull_ws_channel::connect(&url, config.transfer.max_message_size)
        .await
        .with_context(|| format!("cannot connect to {url}"))?;
    let channel = conn.channel.clone();
    let output_dir = config.output_dir.clone();

    let mut endpoint = Endpoint::new(
        conn.channel,
        config.transfer.clone(),
        Arc::new(DirectorySinks::new(&output_dir)),
    )?;
    let mut events = endpoint.take_events().context("event stream already taken")?;
    let handle = endpoint.handle();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let inbound = conn.inbound;
    let task = tokio::spawn(async move { endpoint.run(inbound, token).await });

    let mut ticker = progress_ticker();
    let mut linger: Option<Pin<Box<Sleep>>> = None;
    let mut pending = 0usize;
    let mut completed = 0usize;
    let mut failed = 0usize;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
                match event {
                    TransferEvent::Announced { .. } => {
                        pending += 1;
                        linger = None;
                    }
                    TransferEvent::Rejected { .. } => failed += 1,
                    TransferEvent::Finished {
                        role: TransferRole::Receiver,
                        state,
                        transfer_id,
                    } => {
                        pending = pending.saturating_sub(1);
                        if state == TransferState::Completed {
                            completed += 1;
                            log_checksum(&handle, &output_dir, transfer_id).await;
                        } else {
                            failed += 1;
                        }
                    }
                    _ => {}
                }
                if pending == 0 && completed + failed > 0 && linger.is_none() {
                    linger = Some(Box::pin(tokio::time::sleep(LINGER)));
                }
            }
            _ = async {
                if let Some(sleep) = linger.as_mut() {
                    sleep.await;
                }
            }, if linger.is_some() => break,
            _ = ticker.tick() => log_progress(&handle).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    task.await??;
    channel.close();

    tracing::info!(completed, failed, dir = %output_dir.display(), "receive finished");
    if failed > 0 {
        anyhow::bail!("{failed} transfer(s) failed");
    }
    Ok(())
}

fn progress_ticker() -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn log_event(event: &TransferEvent) {
    match event {
        TransferEvent::Offered {
            transfer_id,
            file_name,
            total_size,
        } => tracing::info!(id = %transfer_id, file = %file_name, size = total_size, "offered"),
        TransferEvent::Announced {
            transfer_id,
            file_name,
            total_size,
        } => tracing::info!(id = %transfer_id, file = %file_name, size = total_size, "incoming"),
        TransferEvent::Rejected {
            transfer_id,
            reason,
        } => tracing::warn!(id = %transfer_id, "rejected: {reason}"),
        TransferEvent::BlockVerified { transfer_id, index } => {
            tracing::debug!(id = %transfer_id, block = index, "block verified")
        }
        TransferEvent::BlockRetry {
            transfer_id,
            index,
            attempt,
        } => tracing::warn!(
            id = %transfer_id,
            block = index,
            attempt,
            "digest mismatch, re-pulling"
        ),
        TransferEvent::BlockServed {
            transfer_id,
            index,
            repeat,
        } => tracing::debug!(id = %transfer_id, block = index, repeat, "block served"),
        TransferEvent::Finished {
            transfer_id,
            role,
            state,
        } => tracing::info!(id = %transfer_id, role = ?role, state = %state.label(), "finished"),
    }
}

async fn log_progress(handle: &EndpointHandle) {
    let Ok(transfers) = handle.transfers().await else {
        return;
    };
    for p in transfers.iter().filter(|p| is_in_flight(p)) {
        tracing::info!(
            id = %p.transfer_id,
            file = %p.file_name,
            state = %p.label,
            block = ?p.current_block,
            percent = format!("{:.1}", p.percentage()),
            rate = %format_rate(p.rate_bps),
            eta_secs = ?p.eta_secs,
            "progress"
        );
    }
}

fn is_in_flight(p: &TransferProgress) -> bool {
    !p.state.is_terminal() && p.state != TransferState::Done
}

fn format_rate(bps: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KiB/s", "MiB/s", "GiB/s"];
    let mut value = bps;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

async fn log_checksum(
    handle: &EndpointHandle,
    dir: &std::path::Path,
    transfer_id: blockpull_protocol::TransferId,
) {
    let Ok(progress) = handle.progress(transfer_id.clone()).await else {
        return;
    };
    let Some(p) = progress.iter().find(|p| p.role == TransferRole::Receiver) else {
        return;
    };
    let path = dir.join(&p.file_name);
    match tokio::task::spawn_blocking(move || calculate_file_checksum(&path)).await {
        Ok(Ok(sum)) => {
            tracing::info!(id = %transfer_id, file = %p.file_name, sha256 = %sum, "saved")
        }
        Ok(Err(e)) => tracing::warn!(id = %transfer_id, "cannot checksum saved file: {e}"),
        Err(e) => tracing::warn!(id = %transfer_id, "checksum task failed: {e}"),
    }
}
