use std::sync::Arc;

use tokio::sync::Mutex;

use parley_store::Database;

use crate::config::ServerConfig;
use crate::delivery::Delivery;
use crate::hub::Hub;
use crate::presence::PresenceStore;

/// Everything a connection needs, shared across the whole process.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub presence: Arc<dyn PresenceStore>,
    pub hub: Arc<Hub>,
    pub delivery: Delivery,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(db: Database, presence: Arc<dyn PresenceStore>, config: ServerConfig) -> Self {
        let db = Arc::new(Mutex::new(db));
        let hub = Arc::new(Hub::new());
        let delivery = Delivery::new(
            db.clone(),
            presence.clone(),
            hub.clone(),
            config.retry.clone(),
        );
        Self {
            db,
            presence,
            hub,
            delivery,
            config: Arc::new(config),
        }
    }
}
