//! The broker actor owns the upstream connection and the client registry.
//!
//! Everything else talks to it through channels: commands arrive on the
//! bounded intake queue, registrations and drop reports on the control
//! channel. [`Broker`] is the owning value; [`BrokerHandle`] is the cheap,
//! cloneable side that connections and routes hold.

mod actor;
pub mod dial;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::error::BrokerGone;
use crate::pool::{Pool, DEFAULT_POOL_CAPACITY};
use crate::upstream::Connector;
use crate::watcher::Watcher;

pub use registry::Payload;

/// How long the broker waits without traffic before pinging upstream.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const INTAKE_CAPACITY: usize = 100;
pub const OUTBOUND_CAPACITY: usize = 100;
/// Consecutive full-queue broadcasts after which a client is dropped.
pub const MAX_MISSED_BROADCASTS: u32 = 16;
/// Longest a single upstream call may take before the connection is
/// considered dead.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Commands executing at once; further commands wait in intake.
pub const MAX_IN_FLIGHT: usize = 16;

/// Tunables of a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub dial_retry: Duration,
    pub idle_timeout: Duration,
    pub intake_capacity: usize,
    pub outbound_capacity: usize,
    pub pool_capacity: usize,
    pub max_missed: u32,
    pub call_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            dial_retry: dial::DIAL_RETRY_DELAY,
            idle_timeout: IDLE_TIMEOUT,
            intake_capacity: INTAKE_CAPACITY,
            outbound_capacity: OUTBOUND_CAPACITY,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            max_missed: MAX_MISSED_BROADCASTS,
            call_timeout: CALL_TIMEOUT,
            max_in_flight: MAX_IN_FLIGHT,
        }
    }
}

/// Connection state of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub state: BrokerState,
    pub clients: usize,
}

pub(crate) enum Control {
    Register {
        id: String,
        outbound: mpsc::Sender<Payload>,
        ack: oneshot::Sender<()>,
    },
    Drop {
        id: String,
    },
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
}

/// Owning handle of a running broker. Dropping it without calling
/// [`Broker::shutdown`] still stops the actor, but nothing waits for the
/// shutdown to finish.
pub struct Broker {
    handle: BrokerHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Broker {
    /// Spawn the broker actor and its watcher, and start dialing upstream.
    pub fn start(connector: Arc<dyn Connector>, options: BrokerOptions) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(options.intake_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (stop, stopped) = oneshot::channel();
        let pool = Arc::new(Pool::new(options.pool_capacity));

        let watcher = Watcher::spawn(
            Arc::clone(&connector),
            intake_tx.clone(),
            Arc::clone(&pool),
            options.dial_retry,
        );

        let handle = BrokerHandle {
            intake: intake_tx,
            control: control_tx,
            pool: Arc::clone(&pool),
            outbound_capacity: options.outbound_capacity,
        };

        let inbox = actor::Inbox {
            intake: intake_rx,
            control: control_rx,
            stopped,
        };
        let (actor, feedback) = actor::Actor::new(connector, options, pool);
        let task = tokio::spawn(actor.run(inbox, feedback, watcher));

        Self { handle, stop, task }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Stop the broker: disconnect every client, stop the watcher, close the
    /// upstream connection and wait for the actor to exit.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "broker task failed");
        }
    }
}

/// Cloneable access to a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    intake: mpsc::Sender<Command>,
    control: mpsc::UnboundedSender<Control>,
    pool: Arc<Pool<Command>>,
    outbound_capacity: usize,
}

impl BrokerHandle {
    /// Queue a command for execution. Waits while the intake queue is full.
    pub async fn submit(&self, cmd: Command) -> Result<(), BrokerGone> {
        self.intake.send(cmd).await.map_err(|rejected| {
            self.pool.release(rejected.0);
            BrokerGone
        })
    }

    /// Register a client and return the receiving end of its outbound queue.
    ///
    /// Returns once the broker has recorded the client, so every broadcast
    /// that starts afterwards reaches it.
    pub async fn register_client(&self, id: &str) -> Result<mpsc::Receiver<Payload>, BrokerGone> {
        let (outbound, rx) = mpsc::channel(self.outbound_capacity);
        let (ack, acked) = oneshot::channel();
        self.control
            .send(Control::Register {
                id: id.to_string(),
                outbound,
                ack,
            })
            .map_err(|_| BrokerGone)?;
        acked.await.map_err(|_| BrokerGone)?;
        Ok(rx)
    }

    /// Report a client as gone. Unknown or already dropped ids are ignored.
    pub fn drop_client(&self, id: &str) {
        let _ = self.control.send(Control::Drop { id: id.to_string() });
    }

    /// Current state and client count, or `None` once the broker has stopped.
    pub async fn stats(&self) -> Option<BrokerStats> {
        let (reply, rx) = oneshot::channel();
        self.control.send(Control::Stats { reply }).ok()?;
        rx.await.ok()
    }

    /// Pool that inbound commands should be decoded into.
    pub fn pool(&self) -> &Arc<Pool<Command>> {
        &self.pool
    }
}
