//! End-to-end protocol tests over an in-memory wire.

mod common;

use std::sync::Arc;

use common::*;
use stylec::engine::builtin::BuiltinEngine;
use stylec::error::{exit, ErrorKind, HostError, ERROR_ID};
use stylec::proto::{self, inbound_message, outbound_message, ErrorType};
use stylec::{version, Config};

fn host() -> Host {
    spawn_host(Arc::new(BuiltinEngine), Config::default())
}

#[tokio::test]
async fn version_request_is_answered_in_place() {
    let mut host = host();
    host.send(inbound_message::Message::VersionRequest(
        proto::VersionRequest { id: 7 },
    ))
    .await;

    match host.recv().await {
        outbound_message::Message::VersionResponse(response) => {
            assert_eq!(response.id, 7);
            assert_eq!(response.implementation_name, version::IMPLEMENTATION_NAME);
            assert_eq!(response.protocol_version, version::PROTOCOL_VERSION);
        }
        other => panic!("expected a version response, got {other:?}"),
    }

    host.close().await;
    assert!(host.finish().await.is_ok());
}

#[tokio::test]
async fn identical_version_requests_yield_identical_frames() {
    let mut host = host();
    host.send(inbound_message::Message::VersionRequest(
        proto::VersionRequest { id: 7 },
    ))
    .await;
    let first = host.recv_frame().await.unwrap();
    host.send(inbound_message::Message::VersionRequest(
        proto::VersionRequest { id: 7 },
    ))
    .await;
    let second = host.recv_frame().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn simple_compilation_succeeds() {
    let mut host = host();
    host.send(compile_request(1, "a {b: 1px + 2px}")).await;

    let (id, success) = expect_success(host.recv().await);
    assert_eq!(id, 1);
    assert_eq!(success.css, "a {\n  b: 3px;\n}\n");
    assert!(success.loaded_urls.is_empty());

    host.close().await;
    assert!(host.finish().await.is_ok());
}

#[tokio::test]
async fn importer_callbacks_roundtrip_in_order() {
    let mut host = host();
    host.send(compile_request_with_importer(2, "@import 'x';", 0))
        .await;

    let canonicalize_id = match host.recv().await {
        outbound_message::Message::CanonicalizeRequest(request) => {
            assert_eq!(request.importer_id, 0);
            assert_eq!(request.url, "x");
            assert!(request.from_import);
            request.id
        }
        other => panic!("expected a canonicalize request, got {other:?}"),
    };
    host.send(canonicalize_response(canonicalize_id, "u:x")).await;

    let import_id = match host.recv().await {
        outbound_message::Message::ImportRequest(request) => {
            assert_eq!(request.importer_id, 0);
            assert_eq!(request.url, "u:x");
            request.id
        }
        other => panic!("expected an import request, got {other:?}"),
    };
    host.send(import_success(import_id, "c{d:1}")).await;

    let (id, success) = expect_success(host.recv().await);
    assert_eq!(id, 2);
    assert_eq!(success.css, "c {\n  d: 1;\n}\n");
    assert_eq!(success.loaded_urls, vec!["u:x".to_string()]);
}

#[tokio::test]
async fn importer_errors_fail_the_compilation_without_teardown() {
    let mut host = host();
    host.send(compile_request_with_importer(3, "@import 'x';", 0))
        .await;

    let canonicalize_id = match host.recv().await {
        outbound_message::Message::CanonicalizeRequest(request) => request.id,
        other => panic!("expected a canonicalize request, got {other:?}"),
    };
    host.send(inbound_message::Message::CanonicalizeResponse(
        proto::CanonicalizeResponse {
            id: canonicalize_id,
            result: Some(proto::canonicalize_response::Result::Error(
                "access denied".to_string(),
            )),
        },
    ))
    .await;

    let (id, failure) = expect_failure(host.recv().await);
    assert_eq!(id, 3);
    assert_eq!(failure.message, "access denied");

    // The process is still alive and serving.
    host.send(inbound_message::Message::VersionRequest(
        proto::VersionRequest { id: 9 },
    ))
    .await;
    match host.recv().await {
        outbound_message::Message::VersionResponse(response) => assert_eq!(response.id, 9),
        other => panic!("expected a version response, got {other:?}"),
    }
}

#[tokio::test]
async fn truncated_frame_is_a_fatal_parse_error() {
    let mut host = host();
    // Length prefix promises 100 bytes, only 3 arrive.
    host.send_raw(&[100, 1, 2, 3]).await;
    host.close().await;

    match host.recv().await {
        outbound_message::Message::Error(error) => {
            assert_eq!(error.r#type, ErrorType::Parse as i32);
            assert_eq!(error.id, ERROR_ID);
        }
        other => panic!("expected an error frame, got {other:?}"),
    }

    match host.finish().await {
        Err(HostError::Protocol(error)) => {
            assert_eq!(error.kind, ErrorKind::Parse);
            assert_eq!(HostError::Protocol(error).exit_code(), exit::PROTOCOL);
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_payload_is_a_fatal_parse_error() {
    let mut host = host();
    // A one-byte frame holding a group tag, which InboundMessage rejects.
    host.send_raw(&[1, 0x0b]).await;

    match host.recv().await {
        outbound_message::Message::Error(error) => {
            assert_eq!(error.r#type, ErrorType::Parse as i32);
            assert!(error.message.starts_with("Invalid protocol buffer:"));
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
    assert!(host.finish().await.is_err());
}

#[tokio::test]
async fn unset_union_is_a_fatal_parse_error() {
    let mut host = host();
    // An empty InboundMessage encodes to zero bytes.
    host.send_raw(&[0]).await;

    match host.recv().await {
        outbound_message::Message::Error(error) => {
            assert_eq!(error.r#type, ErrorType::Parse as i32);
            assert_eq!(error.message, "InboundMessage.message is not set.");
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
    assert!(host.finish().await.is_err());
}

#[tokio::test]
async fn response_without_outstanding_request_is_fatal() {
    let mut host = host();
    host.send(canonicalize_response(999, "u:x")).await;

    match host.recv().await {
        outbound_message::Message::Error(error) => {
            assert_eq!(error.r#type, ErrorType::Params as i32);
            assert_eq!(error.id, 999);
        }
        other => panic!("expected an error frame, got {other:?}"),
    }

    match host.finish().await {
        Err(HostError::Protocol(error)) => assert_eq!(error.kind, ErrorKind::Params),
        other => panic!("expected a protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_response_variant_is_fatal() {
    let mut host = host();
    host.send(compile_request_with_importer(4, "@import 'x';", 0))
        .await;

    let canonicalize_id = match host.recv().await {
        outbound_message::Message::CanonicalizeRequest(request) => request.id,
        other => panic!("expected a canonicalize request, got {other:?}"),
    };
    // Answer the outstanding slot with the wrong response type.
    host.send(inbound_message::Message::FunctionCallResponse(
        proto::FunctionCallResponse {
            id: canonicalize_id,
            result: Some(proto::function_call_response::Result::Error(String::new())),
        },
    ))
    .await;

    match host.recv().await {
        outbound_message::Message::Error(error) => {
            assert_eq!(error.r#type, ErrorType::Params as i32);
            assert!(error.message.contains("Expected CanonicalizeResponse"));
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
    assert!(host.finish().await.is_err());
}

#[tokio::test]
async fn unset_importer_in_compile_request_is_fatal() {
    let mut host = host();
    host.send(inbound_message::Message::CompileRequest(
        proto::CompileRequest {
            id: 5,
            input: Some(string_input("a { b: 1 }")),
            importers: vec![proto::compile_request::Importer { importer: None }],
            ..Default::default()
        },
    ))
    .await;

    match host.recv().await {
        outbound_message::Message::Error(error) => {
            assert_eq!(error.r#type, ErrorType::Params as i32);
            assert_eq!(error.id, 5);
            assert_eq!(error.message, "CompileRequest.Importer.importer is not set.");
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
    assert!(host.finish().await.is_err());
}

#[tokio::test]
async fn missing_path_input_reports_a_zero_span_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.scss");

    let mut host = host();
    host.send(inbound_message::Message::CompileRequest(
        proto::CompileRequest {
            id: 6,
            input: Some(proto::compile_request::Input::Path(
                path.display().to_string(),
            )),
            ..Default::default()
        },
    ))
    .await;

    let (id, failure) = expect_failure(host.recv().await);
    assert_eq!(id, 6);
    let span = failure.span.expect("failure span");
    assert_eq!(span.url, stylec::engine::file_url(&path));
    assert!(span.text.is_empty());
    let start = span.start.expect("span start");
    assert_eq!((start.offset, start.line, start.column), (0, 0, 0));
}

#[tokio::test]
async fn compile_failures_carry_spans_and_formatting() {
    let mut host = host();
    host.send(compile_request(8, "a { b: 1px + 2s; }")).await;

    let (id, failure) = expect_failure(host.recv().await);
    assert_eq!(id, 8);
    assert_eq!(failure.message, "Incompatible units px and s.");
    assert!(failure.formatted.contains("Error: Incompatible units px and s."));
    assert!(failure.stack_trace.contains("root stylesheet"));
    let span = failure.span.expect("failure span");
    assert_eq!(span.start.expect("span start").line, 0);
}

#[tokio::test]
async fn log_events_flow_during_compilation() {
    let mut host = host();
    host.send(compile_request(10, "@debug 1px + 1px;\n@warn \"old\";\na { b: 1 }"))
        .await;

    let debug = match host.recv().await {
        outbound_message::Message::LogEvent(event) => event,
        other => panic!("expected a log event, got {other:?}"),
    };
    assert_eq!(debug.r#type, proto::LogEventType::Debug as i32);
    assert_eq!(debug.message, "2px");

    let warning = match host.recv().await {
        outbound_message::Message::LogEvent(event) => event,
        other => panic!("expected a log event, got {other:?}"),
    };
    assert_eq!(warning.r#type, proto::LogEventType::Warning as i32);
    assert_eq!(warning.compilation_id, debug.compilation_id);

    let (id, _) = expect_success(host.recv().await);
    assert_eq!(id, 10);
}

#[tokio::test]
async fn host_functions_are_invoked_over_the_wire() {
    let mut host = host();
    host.send(inbound_message::Message::CompileRequest(
        proto::CompileRequest {
            id: 11,
            input: Some(string_input("a { b: twice(21px) }")),
            global_functions: vec!["twice($n)".to_string()],
            ..Default::default()
        },
    ))
    .await;

    let (call_id, argument) = match host.recv().await {
        outbound_message::Message::FunctionCallRequest(request) => {
            assert_eq!(
                request.identifier,
                Some(proto::function_call_request::Identifier::Name(
                    "twice".to_string()
                ))
            );
            (request.id, request.arguments[0].clone())
        }
        other => panic!("expected a function call request, got {other:?}"),
    };
    let doubled = match argument.value {
        Some(proto::value::Value::Number(number)) => proto::Value {
            value: Some(proto::value::Value::Number(proto::value::Number {
                value: number.value * 2.0,
                unit: number.unit,
            })),
        },
        other => panic!("expected a number argument, got {other:?}"),
    };
    host.send(inbound_message::Message::FunctionCallResponse(
        proto::FunctionCallResponse {
            id: call_id,
            result: Some(proto::function_call_response::Result::Success(doubled)),
        },
    ))
    .await;

    let (id, success) = expect_success(host.recv().await);
    assert_eq!(id, 11);
    assert_eq!(success.css, "a {\n  b: 42px;\n}\n");
}

#[tokio::test]
async fn eof_with_no_outstanding_compilations_exits_cleanly() {
    let mut host = host();
    host.close().await;
    assert!(host.recv_frame().await.is_none());
    assert!(host.finish().await.is_ok());
}
