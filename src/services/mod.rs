pub mod audit;
pub mod enrollment;
pub mod ip_lookup;
pub mod provisioning;
pub mod rate_limit;
pub mod secret;
pub mod totp;
pub mod verifier;

pub use audit::AuditService;
pub use enrollment::TwoFactorService;
pub use totp::TotpService;
