use std::sync::Arc;

use crate::services::{broker::JobBroker, dispatcher::Dispatcher, status::StatusService};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn JobBroker>,
    pub dispatcher: Arc<Dispatcher>,
    pub status: Arc<StatusService>,
}

impl AppState {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(broker.clone())),
            status: Arc::new(StatusService::new(broker.clone())),
            broker,
        }
    }
}
