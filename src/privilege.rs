//! Privilege gate for the platform lock capability.
//!
//! The engine never talks to the platform directly; it goes through this
//! trait, which models the elevated permission needed to force-lock the
//! screen. Only the logind adapter binds it to a real platform primitive.

pub mod logind;

use async_trait::async_trait;
pub use logind::LogindGate;
use thiserror::Error;

/// Errors from privilege-gated operations.
#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("admin privilege not active")]
    NotPrivileged,

    #[error("platform call failed: {0}")]
    Platform(String),
}

impl From<zbus::Error> for PrivilegeError {
    fn from(e: zbus::Error) -> Self {
        Self::Platform(e.to_string())
    }
}

/// Abstraction over the platform's lock-screen capability.
#[async_trait]
pub trait PrivilegeGate: Send + Sync {
    /// Whether the elevated capability is currently granted.
    async fn is_active(&self) -> bool;

    /// Request the elevated capability.
    ///
    /// Returns `true` once granted, immediately if already active. At most
    /// one request is outstanding at a time; the result is delivered exactly
    /// once per call.
    async fn request_activation(&self) -> Result<bool, PrivilegeError>;

    /// Lock the screen now.
    ///
    /// Fails with [`PrivilegeError::NotPrivileged`] when the capability is
    /// not active at invocation time; no platform call is made in that case.
    async fn lock_now(&self) -> Result<(), PrivilegeError>;

    /// Release the elevated capability. No-op when not active.
    async fn revoke(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        assert_eq!(
            PrivilegeError::NotPrivileged.to_string(),
            "admin privilege not active"
        );
        assert_eq!(
            PrivilegeError::Platform("no bus".to_string()).to_string(),
            "platform call failed: no bus"
        );
    }
}
