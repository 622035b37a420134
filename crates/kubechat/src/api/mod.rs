//! HTTP API module.
//!
//! Serves the WebSocket endpoint, the health probe and the admin endpoints
//! other subsystems use to push messages through the hub.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
