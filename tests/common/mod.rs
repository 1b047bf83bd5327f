#![allow(dead_code)]

//! Shared harness for the protocol integration suites: an in-memory wire
//! with the host running on one side and the test acting as the host
//! application on the other.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message as _;
use tokio::io::{duplex, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use stylec::engine::Engine;
use stylec::error::HostError;
use stylec::proto::{self, compile_request, inbound_message, outbound_message};
use stylec::{varint, Config};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Host {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    pub handle: JoinHandle<Result<(), HostError>>,
}

pub fn spawn_host(engine: Arc<dyn Engine>, config: Config) -> Host {
    let (client, server) = duplex(1 << 16);
    let (server_reader, server_writer) = tokio::io::split(server);
    let handle = tokio::spawn(stylec::run(
        BufReader::new(server_reader),
        server_writer,
        engine,
        config,
    ));
    let (reader, writer) = tokio::io::split(client);
    Host {
        reader,
        writer,
        handle,
    }
}

impl Host {
    pub async fn send(&mut self, message: inbound_message::Message) {
        let frame = proto::InboundMessage {
            message: Some(message),
        }
        .encode_to_vec();
        varint::write_frame(&mut self.writer, &frame)
            .await
            .expect("wire write");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("wire write");
        self.writer.flush().await.expect("wire flush");
    }

    /// Closes the host's stdin.
    pub async fn close(&mut self) {
        self.writer.shutdown().await.expect("wire shutdown");
    }

    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        timeout(RECV_TIMEOUT, varint::read_frame(&mut self.reader))
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("wire read")
    }

    pub async fn recv(&mut self) -> outbound_message::Message {
        let frame = self.recv_frame().await.expect("host closed the stream");
        proto::OutboundMessage::decode(&frame[..])
            .expect("outbound frame decodes")
            .message
            .expect("outbound union is set")
    }

    /// Waits for the host to finish and returns its result.
    pub async fn finish(self) -> Result<(), HostError> {
        drop(self.reader);
        drop(self.writer);
        timeout(RECV_TIMEOUT, self.handle)
            .await
            .expect("timed out waiting for the host to exit")
            .expect("host task panicked")
    }
}

pub fn string_input(source: &str) -> compile_request::Input {
    compile_request::Input::String(compile_request::StringInput {
        source: source.to_string(),
        ..Default::default()
    })
}

pub fn compile_request(id: u32, source: &str) -> inbound_message::Message {
    inbound_message::Message::CompileRequest(proto::CompileRequest {
        id,
        input: Some(string_input(source)),
        ..Default::default()
    })
}

/// A compile request whose entry stylesheet resolves imports through the
/// given host importer.
pub fn compile_request_with_importer(
    id: u32,
    source: &str,
    importer_id: u32,
) -> inbound_message::Message {
    inbound_message::Message::CompileRequest(proto::CompileRequest {
        id,
        input: Some(compile_request::Input::String(
            compile_request::StringInput {
                source: source.to_string(),
                importer: Some(compile_request::Importer {
                    importer: Some(
                        compile_request::importer::Importer::ImporterId(importer_id),
                    ),
                }),
                ..Default::default()
            },
        )),
        ..Default::default()
    })
}

pub fn canonicalize_response(id: u32, url: &str) -> inbound_message::Message {
    inbound_message::Message::CanonicalizeResponse(proto::CanonicalizeResponse {
        id,
        result: Some(proto::canonicalize_response::Result::Url(url.to_string())),
    })
}

pub fn import_success(id: u32, contents: &str) -> inbound_message::Message {
    inbound_message::Message::ImportResponse(proto::ImportResponse {
        id,
        result: Some(proto::import_response::Result::Success(
            proto::import_response::ImportSuccess {
                contents: contents.to_string(),
                ..Default::default()
            },
        )),
    })
}

pub fn expect_success(message: outbound_message::Message) -> (u32, proto::compile_response::CompileSuccess) {
    match message {
        outbound_message::Message::CompileResponse(response) => match response.result {
            Some(proto::compile_response::Result::Success(success)) => (response.id, success),
            other => panic!("expected a successful compile response, got {other:?}"),
        },
        other => panic!("expected a compile response, got {other:?}"),
    }
}

pub fn expect_failure(message: outbound_message::Message) -> (u32, proto::compile_response::CompileFailure) {
    match message {
        outbound_message::Message::CompileResponse(response) => match response.result {
            Some(proto::compile_response::Result::Failure(failure)) => (response.id, failure),
            other => panic!("expected a failed compile response, got {other:?}"),
        },
        other => panic!("expected a compile response, got {other:?}"),
    }
}
