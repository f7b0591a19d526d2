//! Turns server change notifications into follow-up commands.
//!
//! The watcher keeps its own connection parked in the server's notification
//! mode. Each changed subsystem maps to the read command that fetches its new
//! state; the command goes through the broker's intake like any client
//! command, so the result reaches every client.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::broker::dial;
use crate::command::Command;
use crate::pool::Pool;
use crate::upstream::Connector;

/// Follow-up operation for a changed subsystem, if any.
pub fn command_for(subsystem: &str) -> Option<&'static str> {
    match subsystem {
        "player" | "mixer" | "options" => Some("Status"),
        "playlist" => Some("PlaylistInfo"),
        "stored_playlist" => Some("ListPlaylists"),
        "database" => Some("GetFiles"),
        _ => None,
    }
}

/// Handle to a running watcher task.
pub struct Watcher {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Watcher {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        intake: mpsc::Sender<Command>,
        pool: Arc<Pool<Command>>,
        retry: Duration,
    ) -> Self {
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(run(connector, intake, pool, retry, stopped));
        Self { stop, task }
    }

    /// Stop watching and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "watcher task failed");
        }
    }
}

async fn run(
    connector: Arc<dyn Connector>,
    intake: mpsc::Sender<Command>,
    pool: Arc<Pool<Command>>,
    retry: Duration,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        let mut events = tokio::select! {
            _ = &mut stopped => return,
            events = dial::with_retry("watcher", retry, || connector.subscribe()) => events,
        };

        loop {
            let event = tokio::select! {
                _ = &mut stopped => return,
                event = events.next_event() => event,
            };

            match event {
                Ok(subsystem) => {
                    let Some(op) = command_for(&subsystem) else {
                        tracing::debug!(%subsystem, "ignoring change notification");
                        continue;
                    };
                    tracing::debug!(%subsystem, cmd = op, "change notification");

                    let mut cmd = pool.acquire();
                    cmd.cmd.push_str(op);
                    if intake.send(cmd).await.is_err() {
                        tracing::debug!("broker intake closed, watcher exiting");
                        return;
                    }
                }
                Err(e) if e.invalidates_connection() => {
                    tracing::warn!(error = %e, "watcher lost upstream connection");
                    break;
                }
                Err(e) => {
                    // Connection still usable; back off before the next `idle`.
                    tracing::warn!(error = %e, retry_in = ?retry, "watcher notification error");
                    tokio::select! {
                        _ = &mut stopped => return,
                        _ = tokio::time::sleep(retry) => {}
                    }
                }
            }
        }
    }
}
