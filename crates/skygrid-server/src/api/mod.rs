//! Public API surface: REST routes and the WebSocket event channel.

pub mod routes;
pub mod ws;

use crate::state::Core;
use axum::Router;
use std::sync::Arc;

pub fn routes() -> Router<Arc<Core>> {
    routes::create_router()
}

#[cfg(test)]
mod tests;
