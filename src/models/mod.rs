pub mod audit_log;
pub mod user_2fa;

pub use audit_log::{AuditAction, AuditLogEntry, NewAuditLogEntry};
pub use user_2fa::User2faSecret;
