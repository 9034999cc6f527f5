pub mod auth;
pub mod db;
pub mod handlers;
pub mod key_store;
pub mod message_store;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::{ServerState, SharedState};
