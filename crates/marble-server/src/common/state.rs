use std::sync::Arc;

use crate::service::replication::ClientRegistry;
use crate::service::simulation::Simulation;

#[derive(Clone)]
pub struct AppState {
    pub simulation: Arc<Simulation>,
    pub clients: Arc<ClientRegistry>,
}

impl AppState {
    pub fn new(simulation: Arc<Simulation>) -> Self {
        Self {
            simulation,
            clients: Arc::new(ClientRegistry::new()),
        }
    }
}
