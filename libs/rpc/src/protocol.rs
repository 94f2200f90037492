//! Protocol Codec Contract
//!
//! The client treats encoding as opaque: it hands a [`Request`] to a
//! [`Protocol`] and gets frame bytes back, and turns inbound frames into
//! [`Response`]s the same way.

use crate::message::{Request, Response};
use crate::{Result, RpcError};
use bytes::Bytes;

/// Encode requests and decode responses for one wire format
pub trait Protocol: Send + Sync + 'static {
    fn encode_request(&self, request: &Request) -> Result<Bytes>;

    fn decode_response(&self, frame: &[u8]) -> Result<Response>;
}

/// Bincode payload codec; framing is left to the transport
#[derive(Debug, Clone, Default)]
pub struct BincodeProtocol;

impl BincodeProtocol {
    pub fn new() -> Self {
        Self
    }

    /// Server side counterpart of [`Protocol::encode_request`]
    pub fn decode_request(&self, frame: &[u8]) -> Result<Request> {
        bincode::deserialize(frame)
            .map_err(|e| RpcError::serialization_with_source("Failed to decode request", e))
    }

    /// Server side counterpart of [`Protocol::decode_response`]
    pub fn encode_response(&self, response: &Response) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(response)?))
    }
}

impl Protocol for BincodeProtocol {
    fn encode_request(&self, request: &Request) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(request)?))
    }

    fn decode_response(&self, frame: &[u8]) -> Result<Response> {
        bincode::deserialize(frame)
            .map_err(|e| RpcError::serialization_with_source("Failed to decode response", e))
    }
}
