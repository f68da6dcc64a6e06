pub mod agent;
pub mod comms;
pub mod guard;
pub mod security;
pub mod session;
pub mod storage;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
