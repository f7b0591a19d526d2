//! One client's session with the broker.
//!
//! A connection runs two pumps. The inbound pump decodes each message into a
//! pooled [`Command`] and submits it; the outbound pump writes every result
//! the broker queues for this client. Whichever pump ends first takes the
//! whole connection down.

use async_trait::async_trait;
use tokio::sync::mpsc;
use webmpc_common::id;

use crate::broker::{BrokerHandle, Payload};
use crate::command::Command;
use crate::error::TransportError;

/// Receiving half of a client transport. One JSON document per message.
#[async_trait]
pub trait MessageSource: Send {
    /// `Ok(None)` means the client closed the stream.
    async fn receive_message(&mut self) -> Result<Option<String>, TransportError>;
}

/// Sending half of a client transport.
#[async_trait]
pub trait MessageSink: Send {
    async fn send_message(&mut self, text: &str) -> Result<(), TransportError>;

    /// Tell the client no more messages will follow.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct ClientConnection {
    id: String,
    broker: BrokerHandle,
}

impl ClientConnection {
    pub fn new(broker: BrokerHandle) -> Self {
        Self {
            id: id::client_id(),
            broker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register with the broker and pump messages until either side ends.
    pub async fn run<R, W>(self, source: R, sink: W)
    where
        R: MessageSource + 'static,
        W: MessageSink + 'static,
    {
        let outbound = match self.broker.register_client(&self.id).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::debug!(client_id = %self.id, error = %e, "rejecting client");
                return;
            }
        };

        let mut inbound_task = tokio::spawn(inbound_pump(self.id.clone(), self.broker.clone(), source));
        let mut outbound_task = tokio::spawn(outbound_pump(
            self.id.clone(),
            self.broker.clone(),
            outbound,
            sink,
        ));

        tokio::select! {
            _ = &mut inbound_task => outbound_task.abort(),
            _ = &mut outbound_task => inbound_task.abort(),
        }

        tracing::info!(client_id = %self.id, "client disconnected");
    }
}

async fn inbound_pump<R: MessageSource>(id: String, broker: BrokerHandle, mut source: R) {
    loop {
        let text = match source.receive_message().await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(client_id = %id, "client closed the stream");
                break;
            }
            Err(e) => {
                tracing::debug!(client_id = %id, error = %e, "client read error");
                break;
            }
        };

        let mut cmd: Command = broker.pool().acquire();
        if let Err(e) = cmd.decode_into(&text) {
            tracing::warn!(client_id = %id, error = %e, "discarding client message");
            broker.pool().release(cmd);
            continue;
        }

        tracing::debug!(client_id = %id, cmd = %cmd.cmd, "command received");
        if broker.submit(cmd).await.is_err() {
            break;
        }
    }

    broker.drop_client(&id);
}

async fn outbound_pump<W: MessageSink>(
    id: String,
    broker: BrokerHandle,
    mut queue: mpsc::Receiver<Payload>,
    mut sink: W,
) {
    while let Some(payload) = queue.recv().await {
        if let Err(e) = sink.send_message(&payload).await {
            tracing::debug!(client_id = %id, error = %e, "client write error");
            broker.drop_client(&id);
            return;
        }
    }

    // The broker closed our queue: we were dropped or it is shutting down.
    let _ = sink.close().await;
    broker.drop_client(&id);
}
