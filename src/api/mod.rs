use std::sync::Arc;

use crate::controller::Controller;

pub mod status;
pub mod workers;

/// Shared application state, stored as `Router::with_state(Arc<AppState>)`.
pub struct AppState {
    pub controller: Arc<Controller>,
}
