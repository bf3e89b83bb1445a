//! Session-ending error kinds.
//!
//! These travel inside `anyhow::Error` and are recovered at the top level with
//! `downcast_ref` to choose the process exit status.

use std::fmt;
use std::time::Duration;

/// Application-level rejection sent by the orchestration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRejection {
    BadRequest,
    Unauthorized,
    Forbidden,
    Internal,
}

impl ServerRejection {
    pub fn status(self) -> u16 {
        match self {
            ServerRejection::BadRequest => 400,
            ServerRejection::Unauthorized => 401,
            ServerRejection::Forbidden => 403,
            ServerRejection::Internal => 500,
        }
    }

    fn reason(self) -> &'static str {
        match self {
            ServerRejection::BadRequest => "Bad Request",
            ServerRejection::Unauthorized => "Unauthorized",
            ServerRejection::Forbidden => "Forbidden",
            ServerRejection::Internal => "Internal Server Error",
        }
    }
}

impl fmt::Display for ServerRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status(), self.reason())
    }
}

/// Failure of the persistent connection itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Dial(String),
    Read(String),
    Write(String),
    /// Peer closed the connection.
    Closed,
    /// Nothing happened on the connection within the idle budget.
    Idle(Duration),
    /// No reply to an outstanding call within the reply budget.
    ReplyTimeout(Duration),
    /// The first keepalive probe never arrived.
    NoServer(Duration),
    /// A previous failure already marked the connection dead.
    Dead,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Dial(err) => write!(f, "dial failed: {err}"),
            TransportError::Read(err) => write!(f, "read failed: {err}"),
            TransportError::Write(err) => write!(f, "write failed: {err}"),
            TransportError::Closed => write!(f, "connection closed by server"),
            TransportError::Idle(budget) => {
                write!(f, "no server activity for {}s", budget.as_secs())
            }
            TransportError::ReplyTimeout(budget) => {
                write!(f, "call timeout after {}s", budget.as_secs())
            }
            TransportError::NoServer(budget) => {
                write!(f, "timeout waiting for server ({}s)", budget.as_secs())
            }
            TransportError::Dead => write!(f, "connection is dead"),
        }
    }
}

/// Unrecoverable session error, distinguished by who is at fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Transport(TransportError),
    /// Client/server contract mismatch.
    Protocol(String),
    Rejected(ServerRejection),
    /// Local precondition missing (e.g. an unset templated variable).
    Config(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(err) => write!(f, "transport error: {err}"),
            SessionError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            SessionError::Rejected(rejection) => write!(f, "rejected by server: {rejection}"),
            SessionError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::Transport(err)
    }
}
