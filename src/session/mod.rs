//! Session orchestration

pub mod controller;
pub mod state;

pub use controller::SessionController;
pub use state::{Session, SessionState, SessionStats, SessionStatus};
