//! Host-side importer and function proxies.
//!
//! Each proxy turns a synchronous engine callback into an outbound wire
//! request through the worker's [`HostChannel`], blocking until the
//! dispatcher routes the response back. Error results from the host
//! surface as plain importer/function errors; a response of the wrong
//! variant is a protocol violation and tears the process down.

use std::collections::HashSet;

use super::HostChannel;
use crate::engine::{load_from_disk, Functions, Importer, Loaded, Value};
use crate::proto;
use crate::proto::{
    canonicalize_response, file_import_response, function_call_request, function_call_response,
    import_response, inbound_message, outbound_message, value,
};

pub(crate) struct HostImporter {
    channel: HostChannel,
    importer_id: u32,
}

impl HostImporter {
    pub(crate) fn new(channel: HostChannel, importer_id: u32) -> Self {
        Self {
            channel,
            importer_id,
        }
    }
}

impl Importer for HostImporter {
    fn canonicalize(&mut self, url: &str, from_import: bool) -> Result<Option<String>, String> {
        let request = proto::CanonicalizeRequest {
            id: 0,
            importer_id: self.importer_id,
            url: url.to_string(),
            from_import,
        };
        let response = self
            .channel
            .call(outbound_message::Message::CanonicalizeRequest(request))?;
        match response {
            inbound_message::Message::CanonicalizeResponse(response) => match response.result {
                Some(canonicalize_response::Result::Url(url)) => Ok(Some(url)),
                Some(canonicalize_response::Result::Error(error)) => Err(error),
                None => Ok(None),
            },
            other => Err(self.channel.mismatch("CanonicalizeResponse", &other)),
        }
    }

    fn load(&mut self, canonical_url: &str) -> Result<Option<Loaded>, String> {
        let request = proto::ImportRequest {
            id: 0,
            importer_id: self.importer_id,
            url: canonical_url.to_string(),
        };
        let response = self
            .channel
            .call(outbound_message::Message::ImportRequest(request))?;
        match response {
            inbound_message::Message::ImportResponse(response) => match response.result {
                Some(import_response::Result::Success(success)) => {
                    let syntax = success.syntax();
                    Ok(Some(Loaded {
                        contents: success.contents,
                        syntax,
                        source_map_url: (!success.source_map_url.is_empty())
                            .then_some(success.source_map_url),
                    }))
                }
                Some(import_response::Result::Error(error)) => Err(error),
                None => Ok(None),
            },
            other => Err(self.channel.mismatch("ImportResponse", &other)),
        }
    }
}

/// A host file importer: the host only maps URLs to `file:` URLs, the
/// compiler loads the contents from disk itself.
pub(crate) struct HostFileImporter {
    channel: HostChannel,
    importer_id: u32,
}

impl HostFileImporter {
    pub(crate) fn new(channel: HostChannel, importer_id: u32) -> Self {
        Self {
            channel,
            importer_id,
        }
    }
}

impl Importer for HostFileImporter {
    fn canonicalize(&mut self, url: &str, from_import: bool) -> Result<Option<String>, String> {
        let request = proto::FileImportRequest {
            id: 0,
            importer_id: self.importer_id,
            url: url.to_string(),
            from_import,
        };
        let response = self
            .channel
            .call(outbound_message::Message::FileImportRequest(request))?;
        match response {
            inbound_message::Message::FileImportResponse(response) => match response.result {
                Some(file_import_response::Result::FileUrl(url)) => Ok(Some(url)),
                Some(file_import_response::Result::Error(error)) => Err(error),
                None => Ok(None),
            },
            other => Err(self.channel.mismatch("FileImportResponse", &other)),
        }
    }

    fn load(&mut self, canonical_url: &str) -> Result<Option<Loaded>, String> {
        load_from_disk(canonical_url)
    }
}

/// Dispatches calls to functions the host declared via
/// `CompileRequest.global_functions`.
pub(crate) struct HostFunctions {
    channel: HostChannel,
    names: HashSet<String>,
}

impl HostFunctions {
    pub(crate) fn new(channel: HostChannel, signatures: &[String]) -> Self {
        let names = signatures
            .iter()
            .map(|signature| {
                signature
                    .split('(')
                    .next()
                    .unwrap_or(signature)
                    .trim()
                    .to_string()
            })
            .collect();
        Self { channel, names }
    }
}

impl Functions for HostFunctions {
    fn knows(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn call(&mut self, name: &str, arguments: &[Value]) -> Result<Value, String> {
        let request = proto::FunctionCallRequest {
            id: 0,
            identifier: Some(function_call_request::Identifier::Name(name.to_string())),
            arguments: arguments.iter().map(value_to_proto).collect(),
        };
        let response = self
            .channel
            .call(outbound_message::Message::FunctionCallRequest(request))?;
        match response {
            inbound_message::Message::FunctionCallResponse(response) => {
                let id = response.id;
                match response.result {
                    Some(function_call_response::Result::Success(value)) => value_from_proto(value)
                        .ok_or_else(|| {
                            format!("Function {name} returned an unsupported value.")
                        }),
                    Some(function_call_response::Result::Error(error)) => Err(error),
                    None => Err(self.channel.protocol_violation(
                        crate::error::ProtocolError::params(
                            id,
                            "FunctionCallResponse.result is not set.",
                        ),
                    )),
                }
            }
            other => Err(self.channel.mismatch("FunctionCallResponse", &other)),
        }
    }
}

fn value_to_proto(value: &Value) -> proto::Value {
    let value = match value {
        Value::Number { value, unit } => value::Value::Number(value::Number {
            value: *value,
            unit: unit.clone(),
        }),
        Value::Str { text, quoted } => value::Value::String(value::String {
            text: text.clone(),
            quoted: *quoted,
        }),
        Value::Bool(b) => value::Value::Boolean(*b),
    };
    proto::Value { value: Some(value) }
}

fn value_from_proto(value: proto::Value) -> Option<Value> {
    match value.value? {
        value::Value::Number(number) => Some(Value::Number {
            value: number.value,
            unit: number.unit,
        }),
        value::Value::String(string) => Some(Value::Str {
            text: string.text,
            quoted: string.quoted,
        }),
        value::Value::Boolean(b) => Some(Value::Bool(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_reduce_to_names() {
        let (events, _rx) = tokio::sync::mpsc::channel(1);
        let (_tx, responses) = tokio::sync::mpsc::channel(1);
        let channel = HostChannel {
            compilation_id: 1,
            events,
            responses: std::sync::Arc::new(std::sync::Mutex::new(responses)),
            fatal: std::sync::Arc::new(std::sync::Mutex::new(None)),
        };
        let functions = HostFunctions::new(
            channel,
            &["invert($color)".to_string(), "darken ($c, $amount)".to_string()],
        );
        assert!(functions.knows("invert"));
        assert!(functions.knows("darken"));
        assert!(!functions.knows("lighten"));
    }

    #[test]
    fn value_conversion_roundtrip() {
        let values = [
            Value::Number {
                value: 3.5,
                unit: "px".into(),
            },
            Value::Str {
                text: "x".into(),
                quoted: true,
            },
            Value::Bool(true),
        ];
        for value in values {
            let converted = value_from_proto(value_to_proto(&value)).unwrap();
            assert_eq!(converted, value);
        }
    }
}
