//! Typed discriminator over the wire unions.
//!
//! The dispatcher and workers never match on raw tags; everything funnels
//! through the accessors here. `id` is defined for every inbound variant
//! and every outbound variant except `LogEvent` and `Error`, which carry
//! their own identifiers.

use prost::Message as _;

use crate::error::ProtocolError;
use crate::proto;
use crate::proto::{inbound_message, outbound_message};

/// Decodes an inbound frame into its union payload.
pub fn parse_inbound(buf: &[u8]) -> Result<inbound_message::Message, ProtocolError> {
    let wrapper = proto::InboundMessage::decode(buf)?;
    wrapper
        .message
        .ok_or_else(|| ProtocolError::parse("InboundMessage.message is not set."))
}

/// Encodes an outbound union payload into a frame buffer.
pub fn encode_outbound(message: outbound_message::Message) -> Vec<u8> {
    proto::OutboundMessage {
        message: Some(message),
    }
    .encode_to_vec()
}

pub fn inbound_which(message: &inbound_message::Message) -> &'static str {
    use inbound_message::Message;
    match message {
        Message::VersionRequest(_) => "VersionRequest",
        Message::CompileRequest(_) => "CompileRequest",
        Message::CanonicalizeResponse(_) => "CanonicalizeResponse",
        Message::ImportResponse(_) => "ImportResponse",
        Message::FileImportResponse(_) => "FileImportResponse",
        Message::FunctionCallResponse(_) => "FunctionCallResponse",
    }
}

pub fn outbound_which(message: &outbound_message::Message) -> &'static str {
    use outbound_message::Message;
    match message {
        Message::Error(_) => "Error",
        Message::CompileResponse(_) => "CompileResponse",
        Message::VersionResponse(_) => "VersionResponse",
        Message::LogEvent(_) => "LogEvent",
        Message::CanonicalizeRequest(_) => "CanonicalizeRequest",
        Message::ImportRequest(_) => "ImportRequest",
        Message::FileImportRequest(_) => "FileImportRequest",
        Message::FunctionCallRequest(_) => "FunctionCallRequest",
    }
}

pub fn inbound_id(message: &inbound_message::Message) -> u32 {
    use inbound_message::Message;
    match message {
        Message::VersionRequest(m) => m.id,
        Message::CompileRequest(m) => m.id,
        Message::CanonicalizeResponse(m) => m.id,
        Message::ImportResponse(m) => m.id,
        Message::FileImportResponse(m) => m.id,
        Message::FunctionCallResponse(m) => m.id,
    }
}

/// `None` for `LogEvent` and `Error`, whose ids are supplied by their
/// producers.
pub fn outbound_id(message: &outbound_message::Message) -> Option<u32> {
    use outbound_message::Message;
    match message {
        Message::Error(_) | Message::LogEvent(_) => None,
        Message::CompileResponse(m) => Some(m.id),
        Message::VersionResponse(m) => Some(m.id),
        Message::CanonicalizeRequest(m) => Some(m.id),
        Message::ImportRequest(m) => Some(m.id),
        Message::FileImportRequest(m) => Some(m.id),
        Message::FunctionCallRequest(m) => Some(m.id),
    }
}

/// Overwrites the id of an id-bearing outbound variant. `LogEvent` and
/// `Error` are left untouched.
pub fn set_outbound_id(message: &mut outbound_message::Message, id: u32) {
    use outbound_message::Message;
    match message {
        Message::Error(_) | Message::LogEvent(_) => {}
        Message::CompileResponse(m) => m.id = id,
        Message::VersionResponse(m) => m.id = id,
        Message::CanonicalizeRequest(m) => m.id = id,
        Message::ImportRequest(m) => m.id = id,
        Message::FileImportRequest(m) => m.id = id,
        Message::FunctionCallRequest(m) => m.id = id,
    }
}
