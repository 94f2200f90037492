//! Request and Response Envelopes
//!
//! The runtime only looks at the correlation id and the response status; the
//! service, method and payload are opaque to it and travel through the
//! protocol codec untouched.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Correlation identifier matching a response to its originating request
pub type CorrelationId = u32;

/// Outgoing call envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Assigned by the correlation registry right before encoding
    pub correlation_id: CorrelationId,
    pub service: String,
    pub method: String,
    pub payload: Bytes,
}

impl Request {
    pub fn new(service: impl Into<String>, method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: 0,
            service: service.into(),
            method: method.into(),
            payload: payload.into(),
        }
    }

    /// `service.method`, used in diagnostics
    pub fn operation(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

/// Outcome reported by the remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    ServiceError { code: i32, message: String },
}

/// Incoming response envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub status: ResponseStatus,
    pub payload: Bytes,
}

impl Response {
    pub fn ok(correlation_id: CorrelationId, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Ok,
            payload: payload.into(),
        }
    }

    pub fn service_error(correlation_id: CorrelationId, code: i32, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::ServiceError {
                code,
                message: message.into(),
            },
            payload: Bytes::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, ResponseStatus::Ok)
    }
}
