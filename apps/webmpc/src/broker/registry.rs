//! Live client registry owned by the broker task.
//!
//! Every client has its own bounded outbound queue. Broadcasting never waits
//! on a queue: a full queue makes that client miss the message, and a client
//! that keeps missing messages, or whose queue is closed, is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Encoded result shared by every outbound queue.
pub type Payload = Arc<str>;

struct ClientEntry {
    outbound: mpsc::Sender<Payload>,
    /// Consecutive broadcasts this client missed because its queue was full.
    missed: u32,
}

/// Per-broadcast delivery summary.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: Vec<String>,
}

pub struct ClientRegistry {
    clients: HashMap<String, ClientEntry>,
    max_missed: u32,
}

impl ClientRegistry {
    pub fn new(max_missed: u32) -> Self {
        Self {
            clients: HashMap::new(),
            max_missed,
        }
    }

    /// Register a client. Returns false if the id was already present, in
    /// which case the previous queue is replaced.
    pub fn insert(&mut self, id: String, outbound: mpsc::Sender<Payload>) -> bool {
        self.clients
            .insert(id, ClientEntry { outbound, missed: 0 })
            .is_none()
    }

    /// Deregister a client. Dropping its queue sender ends its outbound pump.
    /// Returns false for unknown ids, so duplicate drop reports are harmless.
    pub fn remove(&mut self, id: &str) -> bool {
        self.clients.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Hand `payload` to every registered client without waiting.
    pub fn broadcast(&mut self, payload: &Payload) -> Delivery {
        let mut delivery = Delivery::default();

        for (id, client) in self.clients.iter_mut() {
            match client.outbound.try_send(Arc::clone(payload)) {
                Ok(()) => {
                    client.missed = 0;
                    delivery.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    client.missed += 1;
                    if client.missed >= self.max_missed {
                        tracing::warn!(client_id = %id, missed = client.missed, "dropping slow client");
                        delivery.dropped.push(id.clone());
                    } else {
                        tracing::debug!(client_id = %id, missed = client.missed, "client queue full, skipping");
                        delivery.skipped += 1;
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    delivery.dropped.push(id.clone());
                }
            }
        }

        for id in &delivery.dropped {
            self.clients.remove(id);
        }
        delivery
    }

    /// Remove every client, closing all outbound queues. Returns how many
    /// were registered.
    pub fn clear(&mut self) -> usize {
        let count = self.clients.len();
        self.clients.clear();
        count
    }
}
