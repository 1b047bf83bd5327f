//! Per-compilation worker execution contexts.
//!
//! Each worker is a dedicated OS thread paired bidirectionally with the
//! root dispatcher: compile requests and routed callback responses arrive
//! on its inbound channel, outbound protocol messages leave through the
//! shared event channel. The compilation engine runs synchronously on the
//! worker's thread and blocks on [`HostChannel::call`] whenever it needs
//! the host — one callback outstanding at a time, strictly sequential.

mod logger;
mod proxy;

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{CompilationRequest, CompileFailure, CompileOutput, Engine, FilesystemImporter, Importer, Input};
use crate::error::{ProtocolError, ERROR_ID};
use crate::message::inbound_which;
use crate::proto;
use crate::proto::compile_request::importer::Importer as ImporterSpec;
use crate::proto::{compile_request, compile_response, inbound_message, outbound_message};

use self::logger::WireLogger;
use self::proxy::{HostFileImporter, HostFunctions, HostImporter};

/// Depth of a worker's inbound channel. It only ever holds the next
/// compile request or the single routed callback response.
const INBOUND_DEPTH: usize = 16;

/// Messages flowing to the root dispatcher.
#[derive(Debug)]
pub enum HostEvent {
    /// A worker produced an outbound protocol message.
    Outbound {
        compilation_id: u32,
        message: outbound_message::Message,
    },
    /// A pool acquisition completed for a pending compile request.
    Assigned {
        worker: WorkerHandle,
        request: proto::CompileRequest,
    },
    /// A fatal protocol error; the dispatcher tears the process down.
    Fatal(ProtocolError),
}

/// The dispatcher's end of a worker.
#[derive(Debug)]
pub struct WorkerHandle {
    compilation_id: u32,
    inbound: mpsc::Sender<inbound_message::Message>,
}

impl WorkerHandle {
    /// Spawns the worker thread and returns its handle.
    pub fn spawn(
        compilation_id: u32,
        events: mpsc::Sender<HostEvent>,
        engine: Arc<dyn Engine>,
    ) -> std::io::Result<Self> {
        let (inbound, rx) = mpsc::channel(INBOUND_DEPTH);
        thread::Builder::new()
            .name(format!("compilation-{compilation_id}"))
            .spawn(move || worker_main(compilation_id, rx, events, engine))?;
        Ok(Self {
            compilation_id,
            inbound,
        })
    }

    pub fn compilation_id(&self) -> u32 {
        self.compilation_id
    }

    /// A clone of the inbound sender, stored in the outstanding-request
    /// table to route one callback response back to this worker.
    pub fn sink(&self) -> mpsc::Sender<inbound_message::Message> {
        self.inbound.clone()
    }

    pub async fn send(&self, message: inbound_message::Message) -> Result<(), ProtocolError> {
        self.inbound.send(message).await.map_err(|_| {
            ProtocolError::internal(
                ERROR_ID,
                format!("Worker {} terminated unexpectedly.", self.compilation_id),
            )
        })
    }
}

fn worker_main(
    compilation_id: u32,
    inbound: mpsc::Receiver<inbound_message::Message>,
    events: mpsc::Sender<HostEvent>,
    engine: Arc<dyn Engine>,
) {
    let responses = Arc::new(Mutex::new(inbound));
    loop {
        let next = responses.lock().unwrap().blocking_recv();
        let Some(message) = next else {
            // Dispatcher dropped us: pool eviction or teardown.
            return;
        };
        let request = match message {
            inbound_message::Message::CompileRequest(request) => request,
            other => {
                let _ = events.blocking_send(HostEvent::Fatal(ProtocolError::internal(
                    ERROR_ID,
                    format!(
                        "Worker {compilation_id} received {} while idle.",
                        inbound_which(&other)
                    ),
                )));
                return;
            }
        };

        debug!(compilation_id, request_id = request.id, "compilation started");
        let outcome = run_compilation(compilation_id, request, &responses, &events, engine.as_ref());
        match outcome {
            Ok(response) => {
                let sent = events.blocking_send(HostEvent::Outbound {
                    compilation_id,
                    message: outbound_message::Message::CompileResponse(response),
                });
                if sent.is_err() {
                    return;
                }
            }
            Err(fatal) => {
                let _ = events.blocking_send(HostEvent::Fatal(fatal));
                return;
            }
        }
    }
}

fn run_compilation(
    compilation_id: u32,
    request: proto::CompileRequest,
    responses: &Arc<Mutex<mpsc::Receiver<inbound_message::Message>>>,
    events: &mpsc::Sender<HostEvent>,
    engine: &dyn Engine,
) -> Result<proto::CompileResponse, ProtocolError> {
    let request_id = request.id;
    let channel = HostChannel {
        compilation_id,
        events: events.clone(),
        responses: responses.clone(),
        fatal: Arc::new(Mutex::new(None)),
    };

    let compilation = build_compilation(request, &channel)?;
    let result = panic::catch_unwind(AssertUnwindSafe(|| engine.compile(compilation)));

    // A protocol violation recorded by a proxy outranks whatever the
    // engine made of the error string it was handed.
    if let Some(fatal) = channel.take_fatal() {
        return Err(fatal);
    }

    match result {
        Ok(Ok(output)) => Ok(success_response(output)),
        Ok(Err(failure)) => Ok(failure_response(*failure)),
        Err(panic) => Err(ProtocolError::internal(
            request_id,
            format!(
                "{}\n{}",
                panic_message(panic.as_ref()),
                Backtrace::force_capture()
            ),
        )),
    }
}

/// Decodes a wire compile request into an engine-level compilation,
/// wiring importer, function, and logger proxies to the host channel.
fn build_compilation(
    request: proto::CompileRequest,
    channel: &HostChannel,
) -> Result<CompilationRequest, ProtocolError> {
    let request_id = request.id;
    let style = request.style();
    let mut importers: Vec<Box<dyn Importer>> = Vec::new();

    let (input, entry_url) = match request.input {
        Some(compile_request::Input::String(string)) => {
            let syntax = string.syntax();
            if let Some(entry_importer) = string.importer {
                importers.push(decode_importer(request_id, entry_importer, channel)?);
            }
            let url = (!string.url.is_empty()).then_some(string.url);
            let input = Input::String {
                source: string.source,
                url: url.clone(),
                syntax,
            };
            (input, url)
        }
        Some(compile_request::Input::Path(path)) => {
            let path = PathBuf::from(path);
            let url = crate::engine::file_url(&path);
            (Input::Path(path), Some(url))
        }
        None => {
            return Err(ProtocolError::params(
                request_id,
                "CompileRequest.input is not set.",
            ));
        }
    };

    for importer in request.importers {
        importers.push(decode_importer(request_id, importer, channel)?);
    }

    let functions = HostFunctions::new(channel.clone(), &request.global_functions);
    let logger = WireLogger::new(
        channel.clone(),
        request.alert_color,
        request.alert_ascii,
        request.quiet_deps,
        request.verbose,
        entry_url,
    );

    Ok(CompilationRequest {
        input,
        importers,
        functions: Box::new(functions),
        logger: Box::new(logger),
        style,
        source_map: request.source_map,
        source_map_include_sources: request.source_map_include_sources,
        charset: request.charset,
        alert_color: request.alert_color,
        alert_ascii: request.alert_ascii,
    })
}

fn decode_importer(
    request_id: u32,
    importer: compile_request::Importer,
    channel: &HostChannel,
) -> Result<Box<dyn Importer>, ProtocolError> {
    match importer.importer {
        Some(ImporterSpec::Path(path)) => Ok(Box::new(FilesystemImporter::new(path))),
        Some(ImporterSpec::ImporterId(id)) => Ok(Box::new(HostImporter::new(channel.clone(), id))),
        Some(ImporterSpec::FileImporterId(id)) => {
            Ok(Box::new(HostFileImporter::new(channel.clone(), id)))
        }
        None => Err(ProtocolError::params(
            request_id,
            "CompileRequest.Importer.importer is not set.",
        )),
    }
}

fn success_response(output: CompileOutput) -> proto::CompileResponse {
    proto::CompileResponse {
        id: 0,
        result: Some(compile_response::Result::Success(
            compile_response::CompileSuccess {
                css: output.css,
                source_map: output.source_map.unwrap_or_default(),
                loaded_urls: output.loaded_urls,
            },
        )),
    }
}

fn failure_response(failure: CompileFailure) -> proto::CompileResponse {
    proto::CompileResponse {
        id: 0,
        result: Some(compile_response::Result::Failure(
            compile_response::CompileFailure {
                message: failure.message,
                span: failure.span,
                stack_trace: failure.stack_trace,
                formatted: failure.formatted,
            },
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "Engine panicked with a non-string payload.".to_string()
    }
}

const DISCONNECTED: &str = "Compiler host disconnected.";

/// A worker's two-way link to the host, shared by every proxy of one
/// compilation. Holds the one-slot completer: `call` sends a request and
/// blocks until the dispatcher routes the matching response back.
#[derive(Debug, Clone)]
pub(crate) struct HostChannel {
    compilation_id: u32,
    events: mpsc::Sender<HostEvent>,
    responses: Arc<Mutex<mpsc::Receiver<inbound_message::Message>>>,
    fatal: Arc<Mutex<Option<ProtocolError>>>,
}

impl HostChannel {
    pub(crate) fn compilation_id(&self) -> u32 {
        self.compilation_id
    }

    /// Emits an outbound request and blocks the compilation until the
    /// host's response arrives.
    pub(crate) fn call(
        &self,
        message: outbound_message::Message,
    ) -> Result<inbound_message::Message, String> {
        let event = HostEvent::Outbound {
            compilation_id: self.compilation_id,
            message,
        };
        if self.events.blocking_send(event).is_err() {
            return Err(DISCONNECTED.to_string());
        }
        match self.responses.lock().unwrap().blocking_recv() {
            Some(response) => Ok(response),
            None => Err(DISCONNECTED.to_string()),
        }
    }

    /// Fire-and-forget emission, used for log events.
    pub(crate) fn notify(&self, message: outbound_message::Message) {
        let _ = self.events.blocking_send(HostEvent::Outbound {
            compilation_id: self.compilation_id,
            message,
        });
    }

    /// Records a fatal protocol violation. The returned text is handed to
    /// the engine so the compilation unwinds promptly, but the violation
    /// itself supersedes whatever response the engine produces.
    pub(crate) fn protocol_violation(&self, error: ProtocolError) -> String {
        let text = error.to_string();
        let mut slot = self.fatal.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        text
    }

    /// A response whose variant doesn't match the outstanding request.
    pub(crate) fn mismatch(&self, expected: &str, got: &inbound_message::Message) -> String {
        self.protocol_violation(ProtocolError::params(
            crate::message::inbound_id(got),
            format!("Expected {expected}, got {}.", inbound_which(got)),
        ))
    }

    fn take_fatal(&self) -> Option<ProtocolError> {
        self.fatal.lock().unwrap().take()
    }
}
