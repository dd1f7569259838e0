//! Alpaca WebSocket Authentication
//!
//! Alpaca requires authentication within 10 seconds of connecting.
//!
//! # Authentication Flow
//!
//! 1. Connect to WebSocket endpoint
//! 2. Receive `{"T":"success","msg":"connected"}` from server
//! 3. Send `{"action":"auth","key":"...","secret":"..."}`
//! 4. Receive `{"T":"success","msg":"authenticated"}` or error
//!
//! # Error Codes
//!
//! - 401: Not authenticated
//! - 402: Authentication failed (invalid credentials)
//! - 403: Already authenticated
//! - 404: Authentication timeout (>10 seconds)
//! - 406: Connection limit exceeded

use std::time::Duration;

use thiserror::Error;

use super::messages::{AuthRequest, ErrorMessage, SuccessKind, SuccessMessage};
use crate::infrastructure::config::Credentials;

/// Deadline for the server to confirm authentication.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during authentication.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Not authenticated (must authenticate before subscribing).
    #[error("not authenticated: must authenticate before making requests")]
    NotAuthenticated,

    /// Authentication failed (invalid credentials).
    #[error("authentication failed: invalid API key or secret")]
    InvalidCredentials,

    /// Already authenticated.
    #[error("already authenticated: connection is already authenticated")]
    AlreadyAuthenticated,

    /// Authentication took longer than 10 seconds.
    #[error("authentication timeout: must authenticate within 10 seconds")]
    Timeout,

    /// Connection limit exceeded.
    #[error("connection limit exceeded: too many concurrent connections")]
    ConnectionLimitExceeded,

    /// Unexpected error from server.
    #[error("server error ({code}): {message}")]
    ServerError {
        /// Error code from server
        code: i32,
        /// Error message from server
        message: String,
    },
}

impl AuthError {
    /// Whether retrying with the same credentials is pointless.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidCredentials)
    }
}

impl From<&ErrorMessage> for AuthError {
    fn from(err: &ErrorMessage) -> Self {
        match err.code {
            401 => Self::NotAuthenticated,
            402 => Self::InvalidCredentials,
            403 => Self::AlreadyAuthenticated,
            404 => Self::Timeout,
            406 => Self::ConnectionLimitExceeded,
            code => Self::ServerError {
                code,
                message: err.msg.clone(),
            },
        }
    }
}

// =============================================================================
// Authentication State
// =============================================================================

/// Current state of authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Not yet connected.
    #[default]
    Disconnected,
    /// Authentication request sent, awaiting response.
    Authenticating,
    /// Successfully authenticated.
    Authenticated,
    /// Authentication failed.
    Failed,
}

/// What the connection should do after a success frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this request.
    Send(AuthRequest),
    /// Authentication finished.
    Authenticated,
    /// Nothing to do.
    Idle,
}

/// Authentication state machine for one connection.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
    state: AuthState,
}

impl AuthHandler {
    /// Create a handler for a fresh connection.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::Disconnected,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Whether the server confirmed authentication.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated)
    }

    /// Process a success frame.
    pub fn on_success(&mut self, msg: &SuccessMessage) -> AuthStep {
        match msg.msg {
            SuccessKind::Connected if self.state == AuthState::Authenticated => AuthStep::Idle,
            SuccessKind::Connected => {
                self.state = AuthState::Authenticating;
                AuthStep::Send(AuthRequest::new(
                    self.credentials.api_key().to_string(),
                    self.credentials.api_secret().to_string(),
                ))
            }
            SuccessKind::Authenticated => {
                self.state = AuthState::Authenticated;
                AuthStep::Authenticated
            }
        }
    }

    /// Process an error frame received before authentication completed.
    pub fn on_error(&mut self, msg: &ErrorMessage) -> AuthError {
        self.state = AuthState::Failed;
        AuthError::from(msg)
    }

    /// Reset after the connection closes.
    pub const fn reset(&mut self) {
        self.state = AuthState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::new("key123".to_string(), "secret456".to_string())
    }

    fn success(kind: SuccessKind) -> SuccessMessage {
        SuccessMessage {
            msg_type: "success".to_string(),
            msg: kind,
        }
    }

    #[test]
    fn connected_then_authenticated() {
        let mut handler = AuthHandler::new(credentials());

        let step = handler.on_success(&success(SuccessKind::Connected));
        match step {
            AuthStep::Send(req) => {
                assert_eq!(req.action, "auth");
                assert_eq!(req.key, "key123");
                assert_eq!(req.secret, "secret456");
            }
            other => panic!("expected auth request, got {other:?}"),
        }
        assert_eq!(handler.state(), AuthState::Authenticating);

        assert_eq!(
            handler.on_success(&success(SuccessKind::Authenticated)),
            AuthStep::Authenticated
        );
        assert!(handler.is_authenticated());
    }

    #[test]
    fn on_error_marks_failed() {
        let mut handler = AuthHandler::new(credentials());
        let _ = handler.on_success(&success(SuccessKind::Connected));

        let err = handler.on_error(&ErrorMessage {
            msg_type: "error".to_string(),
            code: 402,
            msg: "auth failed".to_string(),
        });

        assert!(matches!(err, AuthError::InvalidCredentials));
        assert!(err.is_fatal());
        assert_eq!(handler.state(), AuthState::Failed);
    }

    #[test]
    fn error_codes_map_to_variants() {
        let msg = |code| ErrorMessage {
            msg_type: "error".to_string(),
            code,
            msg: "boom".to_string(),
        };

        assert!(matches!(AuthError::from(&msg(401)), AuthError::NotAuthenticated));
        assert!(matches!(AuthError::from(&msg(404)), AuthError::Timeout));
        assert!(matches!(
            AuthError::from(&msg(406)),
            AuthError::ConnectionLimitExceeded
        ));
        assert!(matches!(
            AuthError::from(&msg(500)),
            AuthError::ServerError { code: 500, .. }
        ));
        assert!(!AuthError::from(&msg(406)).is_fatal());
    }

    #[test]
    fn reset_returns_to_disconnected() {
        let mut handler = AuthHandler::new(credentials());
        let _ = handler.on_success(&success(SuccessKind::Connected));
        handler.reset();
        assert_eq!(handler.state(), AuthState::Disconnected);
    }
}
