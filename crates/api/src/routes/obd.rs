//! OBD status route

use axum::{extract::State, Json};
use obd_poller::Status;
use std::sync::Arc;

use crate::AppState;

/// Latest status snapshot of the polling engine
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<Status> {
    Json(state.status.borrow().clone())
}
