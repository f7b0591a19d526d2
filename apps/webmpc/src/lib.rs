pub mod broker;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod routes;
pub mod upstream;
pub mod watcher;

use std::sync::Arc;

use broker::BrokerHandle;
use config::Config;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub config: Arc<Config>,
}
