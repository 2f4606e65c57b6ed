pub mod audit_log;
#[cfg(test)]
pub(crate) mod memory;
pub mod user_2fa;

pub use audit_log::{AuditLogRepository, AuditLogStore};
pub use user_2fa::{User2faSecretRepository, User2faSecretStore};
