//! Error handling for the gateway
//!
//! Hierarchical error system: one top-level [`AppError`] plus focused enums
//! per layer (tunnel, portal protocol, gateway brokering). Per-portal and
//! per-MAC failures are isolated by callers and must never abort a whole
//! refresh cycle or another user's session.

mod types;

pub use types::{AppError, GatewayError, PortalError, TunnelError};

/// Convenience result type used throughout the application
pub type AppResult<T> = Result<T, AppError>;
