//! HTTP API surface.

pub mod embed;
pub mod generate;
pub mod health;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Build the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(generate::router())
        .merge(embed::router())
}
