//! HTTP server: admin API for mock records and the catch-all mock dispatcher.

pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

pub use routes::build_router;
pub use state::AppState;
