//! Status codes and the tagged boundary error.
//!
//! Every error that crosses a component boundary carries a [`Status`] so that
//! callers can distinguish recoverable-absent (`NotFound`) from caller bugs
//! (`BadRequest`, `BadConfig`) and from genuine failures (`InternalError`).
//! The success states `Ok` and `Accepted` share the same numeric space because
//! they travel on the wire in response envelopes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for maestro-core operations.
pub type Result<T> = std::result::Result<T, StatusError>;

/// Machine-readable status, shared between errors and wire responses.
///
/// Serializes as its numeric wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", from = "u16")]
pub enum Status {
    /// Success.
    Ok,
    /// Accepted for asynchronous processing; counts as success.
    Accepted,
    /// The caller sent something malformed (e.g. an invalid list selector).
    BadRequest,
    /// The requested entity does not exist.
    NotFound,
    /// An unexpected failure: transport loss, timeout, corrupt data.
    InternalError,
    /// The component was configured incorrectly.
    BadConfig,
}

impl Status {
    /// The numeric wire value of this status.
    pub fn code(self) -> u16 {
        u16::from(self)
    }

    /// Whether this status counts as success (`Ok` or `Accepted`).
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::Accepted)
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        match status {
            Status::Ok => 200,
            Status::Accepted => 202,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::InternalError => 500,
            Status::BadConfig => 1000,
        }
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Status {
        match code {
            200 => Status::Ok,
            202 => Status::Accepted,
            400 => Status::BadRequest,
            404 => Status::NotFound,
            1000 => Status::BadConfig,
            _ => Status::InternalError,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::Accepted => "Accepted",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
            Status::BadConfig => "Bad Config",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// A boundary error: a [`Status`] tag, a human-readable message, and an
/// optional wrapped cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StatusError {
    pub status: Status,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StatusError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a cause while keeping the tagged status.
    pub fn with_source(
        status: Status,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, message)
    }

    pub fn bad_config(message: impl Into<String>) -> Self {
        Self::new(Status::BadConfig, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Status::InternalError, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Status::NotFound
    }
}
