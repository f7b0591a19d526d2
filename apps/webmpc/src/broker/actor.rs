//! The broker's central loop.
//!
//! One task owns the registry and the upstream handle. Nothing inside the
//! `select!` loop waits on the network: dialing runs in its own task, and
//! every command runs on a worker task whose outcome the loop joins. Every
//! upstream call is bounded by the call timeout, and intake is only polled
//! while fewer than `max_in_flight` workers are outstanding.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};

use super::registry::{ClientRegistry, Payload};
use super::{dial, BrokerOptions, BrokerState, BrokerStats, Control};
use crate::command::{Command, CommandResult};
use crate::dispatch::{self, HandlerResult};
use crate::error::UpstreamError;
use crate::pool::Pool;
use crate::upstream::{Connector, Upstream};
use crate::watcher::Watcher;

type SharedUpstream = Arc<Mutex<Box<dyn Upstream>>>;

/// Operation name reported for keepalive pings.
const PING: &str = "ping";

/// Completion report of one worker.
struct Outcome {
    /// Connection generation the call ran on.
    generation: u64,
    op: &'static str,
    result: HandlerResult,
}

pub(crate) struct Actor {
    connector: Arc<dyn Connector>,
    options: BrokerOptions,
    pool: Arc<Pool<Command>>,
    state: BrokerState,
    registry: ClientRegistry,
    upstream: Option<SharedUpstream>,
    /// Bumped on every successful dial.
    generation: u64,
    dial: Option<JoinHandle<()>>,
    dialed: mpsc::Sender<Box<dyn Upstream>>,
    workers: JoinSet<Outcome>,
}

/// Channels the actor listens on.
pub(crate) struct Inbox {
    pub(crate) intake: mpsc::Receiver<Command>,
    pub(crate) control: mpsc::UnboundedReceiver<Control>,
    pub(crate) stopped: oneshot::Receiver<()>,
}

/// Channel fed by the actor's dial task.
pub(crate) struct Feedback {
    dialed: mpsc::Receiver<Box<dyn Upstream>>,
}

impl Actor {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        options: BrokerOptions,
        pool: Arc<Pool<Command>>,
    ) -> (Self, Feedback) {
        let (dialed, dialed_rx) = mpsc::channel(1);
        let registry = ClientRegistry::new(options.max_missed);

        let actor = Self {
            connector,
            options,
            pool,
            state: BrokerState::Disconnected,
            registry,
            upstream: None,
            generation: 0,
            dial: None,
            dialed,
            workers: JoinSet::new(),
        };
        let feedback = Feedback { dialed: dialed_rx };
        (actor, feedback)
    }

    pub(crate) async fn run(mut self, inbox: Inbox, feedback: Feedback, watcher: Watcher) {
        let Inbox {
            mut intake,
            mut control,
            mut stopped,
        } = inbox;
        let Feedback { mut dialed } = feedback;

        tracing::info!("broker started");
        self.begin_dial();

        let idle = time::sleep(self.options.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;

                _ = &mut stopped => break,

                Some(msg) = control.recv() => self.on_control(msg),

                Some(upstream) = dialed.recv() => self.on_connected(upstream),

                Some(joined) = self.workers.join_next() => {
                    match joined {
                        Ok(outcome) => self.on_outcome(outcome),
                        Err(e) => tracing::error!(error = %e, "command worker failed"),
                    }
                    idle.as_mut().reset(Instant::now() + self.options.idle_timeout);
                }

                cmd = intake.recv(), if self.accepts_commands() => {
                    let Some(cmd) = cmd else { break };
                    self.execute(cmd);
                    idle.as_mut().reset(Instant::now() + self.options.idle_timeout);
                }

                () = &mut idle => {
                    // A busy connection is already being checked by its own
                    // call timeout.
                    if self.state == BrokerState::Connected && self.workers.is_empty() {
                        self.ping();
                    }
                    idle.as_mut().reset(Instant::now() + self.options.idle_timeout);
                }
            }
        }

        self.shutdown(intake, watcher).await;
    }

    fn accepts_commands(&self) -> bool {
        self.state == BrokerState::Connected && self.workers.len() < self.options.max_in_flight
    }

    fn on_control(&mut self, msg: Control) {
        match msg {
            Control::Register { id, outbound, ack } => {
                if !self.registry.insert(id.clone(), outbound) {
                    tracing::warn!(client_id = %id, "client registered twice, replacing queue");
                }
                tracing::info!(client_id = %id, clients = self.registry.len(), "client joined");
                let _ = ack.send(());
            }
            Control::Drop { id } => {
                if self.registry.remove(&id) {
                    tracing::info!(client_id = %id, clients = self.registry.len(), "client left");
                }
            }
            Control::Stats { reply } => {
                let _ = reply.send(BrokerStats {
                    state: self.state,
                    clients: self.registry.len(),
                });
            }
        }
    }

    fn begin_dial(&mut self) {
        if self.dial.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        self.state = BrokerState::Connecting;

        let connector = Arc::clone(&self.connector);
        let dialed = self.dialed.clone();
        let delay = self.options.dial_retry;
        self.dial = Some(tokio::spawn(async move {
            let upstream = dial::with_retry("broker", delay, || connector.connect()).await;
            let _ = dialed.send(upstream).await;
        }));
    }

    fn on_connected(&mut self, upstream: Box<dyn Upstream>) {
        self.dial = None;
        self.generation += 1;
        self.upstream = Some(Arc::new(Mutex::new(upstream)));
        self.state = BrokerState::Connected;
        tracing::info!(generation = self.generation, "upstream connection ready");
    }

    fn execute(&mut self, cmd: Command) {
        let operation = match dispatch::resolve(&cmd.cmd) {
            Ok(operation) => operation,
            Err(e) => {
                tracing::warn!(error = %e, "dropping command");
                self.pool.release(cmd);
                return;
            }
        };
        let Some(upstream) = self.upstream.clone() else {
            self.pool.release(cmd);
            return;
        };
        tracing::debug!(cmd = operation.name, "executing command");

        let generation = self.generation;
        let pool = Arc::clone(&self.pool);
        let limit = self.options.call_timeout;
        self.workers.spawn(async move {
            let result = {
                let mut guard = upstream.lock().await;
                bounded(limit, operation.run(&cmd, &mut **guard)).await
            };
            pool.release(cmd);
            Outcome {
                generation,
                op: operation.name,
                result,
            }
        });
    }

    fn ping(&mut self) {
        let Some(upstream) = self.upstream.clone() else {
            return;
        };
        tracing::debug!("upstream idle, pinging");

        let generation = self.generation;
        let limit = self.options.call_timeout;
        self.workers.spawn(async move {
            let mut guard = upstream.lock().await;
            let result = bounded(limit, guard.ping()).await.map(|()| None);
            Outcome {
                generation,
                op: PING,
                result,
            }
        });
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        match outcome.result {
            Ok(Some(result)) => self.broadcast(outcome.op, &result),
            Ok(None) => {}
            Err(e) if e.invalidates_connection() => {
                if outcome.generation != self.generation || self.state != BrokerState::Connected {
                    tracing::debug!(cmd = outcome.op, error = %e, "failure on a replaced connection");
                    return;
                }
                tracing::warn!(cmd = outcome.op, error = %e, "upstream connection lost, redialing");
                self.upstream = None;
                self.state = BrokerState::Disconnected;
                self.begin_dial();
            }
            Err(e) => {
                tracing::warn!(cmd = outcome.op, error = %e, "command failed");
            }
        }
    }

    fn broadcast(&mut self, op: &'static str, result: &CommandResult) {
        let payload: Payload = match serde_json::to_string(result) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(cmd = op, error = %e, "failed to encode result");
                return;
            }
        };

        let delivery = self.registry.broadcast(&payload);
        tracing::debug!(
            cmd = op,
            kind = result.kind,
            delivered = delivery.delivered,
            skipped = delivery.skipped,
            "broadcast result"
        );
        for id in &delivery.dropped {
            tracing::info!(client_id = %id, clients = self.registry.len(), "client dropped");
        }
    }

    async fn shutdown(mut self, mut intake: mpsc::Receiver<Command>, watcher: Watcher) {
        self.state = BrokerState::Stopped;

        // Closing intake first unblocks any sender, the watcher included.
        intake.close();
        if let Some(dial) = self.dial.take() {
            dial.abort();
        }
        let clients = self.registry.clear();
        watcher.stop().await;

        while let Ok(cmd) = intake.try_recv() {
            self.pool.release(cmd);
        }
        // In-flight calls run to completion; nobody is left to hear about them.
        self.workers.detach_all();

        if let Some(upstream) = self.upstream.take() {
            match upstream.try_lock() {
                Ok(mut conn) => {
                    if let Err(e) = conn.close().await {
                        tracing::debug!(error = %e, "error closing upstream connection");
                    }
                }
                Err(_) => tracing::debug!("upstream busy at shutdown, dropping connection"),
            }
        }

        tracing::info!(clients, "broker stopped");
    }
}

/// Run one upstream call, turning a stall into a connection failure.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, UpstreamError>>,
) -> Result<T, UpstreamError> {
    match time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream call timed out",
        ))),
    }
}
