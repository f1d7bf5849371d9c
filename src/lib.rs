// Library crate for integration tests.
// main.rs boots the service on top of these modules.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod log_capture;
pub mod model_client;
pub mod routes;
pub mod server;
pub mod settings;
pub mod state;
