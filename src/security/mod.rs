pub mod audit_log;
pub mod identity_cache;

pub use audit_log::AuditLogger;
pub use identity_cache::{IdentityCache, Observation};
