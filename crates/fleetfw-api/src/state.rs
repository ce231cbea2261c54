use std::sync::Arc;

use fleetfw_protocol::ProtocolManager;
use fleetfw_runner::Scheduler;
use fleetfw_store::RunStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub scheduler: Arc<Scheduler>,
    pub manager: Arc<ProtocolManager>,
    pub auth_token: Arc<String>,
}
