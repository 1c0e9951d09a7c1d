//! Status web UI

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{router, AppState, WebServer};
