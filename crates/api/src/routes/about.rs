//! Server info route

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct AboutResponse {
    pub name: String,
    pub version: String,
}

pub async fn get_about(State(state): State<Arc<AppState>>) -> Json<AboutResponse> {
    Json(AboutResponse {
        name: state.name.clone(),
        version: state.version.clone(),
    })
}
