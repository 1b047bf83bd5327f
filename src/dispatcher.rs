//! Root dispatcher.
//!
//! A single cooperative loop owns the wire: it interleaves frames arriving
//! from the host with events produced by the workers, never holding state
//! across a suspension point that another execution context could touch.
//! Version requests are answered in place; compile requests are handed to
//! the pool; callback responses are routed to the waiting worker through
//! the outstanding-request table.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{HostError, HostResult, ProtocolError, ERROR_ID};
use crate::message;
use crate::pool::WorkerPool;
use crate::proto::{inbound_message, outbound_message};
use crate::varint;
use crate::version;
use crate::worker::{HostEvent, WorkerHandle};
use crate::Config;

/// Depth of the inbound frame channel between the reader task and the
/// dispatcher; small, so a flooding host is backpressured by the wire.
const INBOUND_DEPTH: usize = 16;

/// Depth of the worker event channel. Workers block on it when the
/// dispatcher is busy writing, which backpressures their compilations.
const EVENT_DEPTH: usize = 64;

/// Runs the host until stdin closes or a fatal protocol error occurs.
///
/// On a fatal error the contractual stderr diagnostic is written, one
/// final `Error` frame is emitted, and the error is returned so the caller
/// can exit with code 76.
pub async fn run<R, W>(reader: R, writer: W, engine: Arc<dyn Engine>, config: Config) -> HostResult<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (events_tx, events_rx) = mpsc::channel(EVENT_DEPTH);
    let pool = WorkerPool::new(engine, events_tx.clone());
    let mut dispatcher = Dispatcher {
        inbound: spawn_reader(reader),
        writer,
        events: events_rx,
        spawner: events_tx,
        pool,
        outstanding: RequestTable::default(),
        active: HashMap::new(),
        config,
        eof: false,
    };

    let result = dispatcher.run().await;
    if let Err(HostError::Protocol(error)) = &result {
        eprintln!("{}", error.stderr_line());
        let frame = message::encode_outbound(outbound_message::Message::Error(error.to_proto()));
        let _ = varint::write_frame(&mut dispatcher.writer, &frame).await;
    }
    dispatcher.pool.clear_idle();
    result
}

/// Reads frames off the wire on a dedicated task so a partially-read
/// frame is never lost to cancellation in the dispatch loop.
fn spawn_reader<R>(mut reader: R) -> mpsc::Receiver<HostResult<Bytes>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(INBOUND_DEPTH);
    tokio::spawn(async move {
        loop {
            match varint::read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(error) => {
                    let _ = tx.send(Err(error)).await;
                    return;
                }
            }
        }
    });
    rx
}

struct ActiveCompilation {
    request_id: u32,
    /// `None` once callback routes are closed during EOF draining.
    worker: Option<WorkerHandle>,
}

struct Dispatcher<W> {
    inbound: mpsc::Receiver<HostResult<Bytes>>,
    writer: W,
    events: mpsc::Receiver<HostEvent>,
    spawner: mpsc::Sender<HostEvent>,
    pool: Arc<WorkerPool>,
    outstanding: RequestTable,
    /// Active compilations keyed by the worker's compilation id.
    active: HashMap<u32, ActiveCompilation>,
    config: Config,
    eof: bool,
}

impl<W> Dispatcher<W>
where
    W: AsyncWrite + Unpin,
{
    async fn run(&mut self) -> HostResult<()> {
        loop {
            tokio::select! {
                frame = self.inbound.recv(), if !self.eof => {
                    match frame {
                        Some(frame) => self.handle_inbound(&frame?).await?,
                        None => {
                            self.eof = true;
                            if self.active.is_empty() {
                                return Ok(());
                            }
                            if !self.config.drain_on_eof {
                                debug!("stdin closed with active compilations; exiting without draining");
                                return Ok(());
                            }
                            debug!(active = self.active.len(), "stdin closed; draining compilations");
                            self.abort_callbacks();
                        }
                    }
                }
                event = self.events.recv() => {
                    // The dispatcher holds a sender, so the channel never closes.
                    if let Some(event) = event {
                        self.handle_event(event).await?;
                    }
                }
            }
            if self.eof && self.active.is_empty() {
                return Ok(());
            }
        }
    }

    async fn handle_inbound(&mut self, frame: &[u8]) -> HostResult<()> {
        let message = message::parse_inbound(frame)?;
        debug!(
            kind = message::inbound_which(&message),
            id = message::inbound_id(&message),
            "inbound message"
        );
        use inbound_message::Message;
        match message {
            Message::VersionRequest(request) => {
                let response = version::response(request.id);
                self.emit(outbound_message::Message::VersionResponse(response))
                    .await
            }
            Message::CompileRequest(request) => {
                // Acquisition may wait on the pool ceiling; it runs detached
                // so callback responses for active compilations keep flowing.
                let pool = self.pool.clone();
                let spawner = self.spawner.clone();
                tokio::spawn(async move {
                    let event = match pool.acquire().await {
                        Ok(worker) => HostEvent::Assigned { worker, request },
                        Err(error) => HostEvent::Fatal(error),
                    };
                    let _ = spawner.send(event).await;
                });
                Ok(())
            }
            response @ (Message::CanonicalizeResponse(_)
            | Message::ImportResponse(_)
            | Message::FileImportResponse(_)
            | Message::FunctionCallResponse(_)) => self.route_response(response).await,
        }
    }

    /// Delivers a callback response to the worker recorded in its
    /// outstanding slot, freeing the slot.
    async fn route_response(&mut self, response: inbound_message::Message) -> HostResult<()> {
        let id = message::inbound_id(&response);
        let Some(sink) = self.outstanding.take(id) else {
            return Err(ProtocolError::params(
                id,
                format!("Response id {id} doesn't match any outstanding request."),
            )
            .into());
        };
        if sink.send(response).await.is_err() {
            return Err(ProtocolError::internal(
                id,
                "Worker terminated before receiving its response.",
            )
            .into());
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: HostEvent) -> HostResult<()> {
        match event {
            HostEvent::Assigned { worker, request } => {
                let compilation_id = worker.compilation_id();
                let request_id = request.id;
                debug!(compilation_id, request_id, "compile request assigned");
                worker
                    .send(inbound_message::Message::CompileRequest(request))
                    .await?;
                self.active.insert(
                    compilation_id,
                    ActiveCompilation {
                        request_id,
                        worker: Some(worker),
                    },
                );
                Ok(())
            }
            HostEvent::Outbound {
                compilation_id,
                message,
            } => self.handle_worker_message(compilation_id, message).await,
            HostEvent::Fatal(error) => Err(error.into()),
        }
    }

    async fn handle_worker_message(
        &mut self,
        compilation_id: u32,
        message: outbound_message::Message,
    ) -> HostResult<()> {
        use outbound_message::Message;
        match message {
            Message::CompileResponse(mut response) => {
                let Some(active) = self.active.remove(&compilation_id) else {
                    return Err(ProtocolError::internal(
                        ERROR_ID,
                        format!("CompileResponse from unknown compilation {compilation_id}."),
                    )
                    .into());
                };
                response.id = active.request_id;
                debug!(compilation_id, request_id = response.id, "compilation finished");
                self.emit(Message::CompileResponse(response)).await?;
                if let Some(worker) = active.worker {
                    self.pool.release(worker);
                }
                Ok(())
            }
            // Log events and errors carry their own ids.
            Message::LogEvent(_) | Message::Error(_) => self.emit(message).await,
            mut request @ (Message::CanonicalizeRequest(_)
            | Message::ImportRequest(_)
            | Message::FileImportRequest(_)
            | Message::FunctionCallRequest(_)) => {
                let Some(active) = self.active.get(&compilation_id) else {
                    return Err(ProtocolError::internal(
                        ERROR_ID,
                        format!("Callback from unknown compilation {compilation_id}."),
                    )
                    .into());
                };
                let Some(worker) = &active.worker else {
                    // Draining after EOF: the callback route is closed and
                    // the worker is about to observe that.
                    return Ok(());
                };
                let id = self.outstanding.insert(worker.sink());
                message::set_outbound_id(&mut request, id);
                self.emit(request).await
            }
            Message::VersionResponse(_) => Err(ProtocolError::internal(
                ERROR_ID,
                format!("Unexpected VersionResponse from compilation {compilation_id}."),
            )
            .into()),
        }
    }

    async fn emit(&mut self, message: outbound_message::Message) -> HostResult<()> {
        debug!(kind = message::outbound_which(&message), "outbound message");
        let frame = message::encode_outbound(message);
        varint::write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Closes every callback route so compilations blocked on the host
    /// abort and drain to their `CompileResponse`s.
    fn abort_callbacks(&mut self) {
        self.outstanding.clear();
        for active in self.active.values_mut() {
            active.worker = None;
        }
        self.pool.clear_idle();
    }
}

/// The outstanding-request table: a slot vector indexed by outbound id.
/// Freed slots are re-used smallest-first, so ids stay dense.
#[derive(Default)]
struct RequestTable {
    slots: Vec<Option<mpsc::Sender<inbound_message::Message>>>,
    free: BTreeSet<u32>,
}

impl RequestTable {
    fn insert(&mut self, sink: mpsc::Sender<inbound_message::Message>) -> u32 {
        if let Some(id) = self.free.pop_first() {
            self.slots[id as usize] = Some(sink);
            id
        } else {
            self.slots.push(Some(sink));
            (self.slots.len() - 1) as u32
        }
    }

    fn take(&mut self, id: u32) -> Option<mpsc::Sender<inbound_message::Message>> {
        let slot = self.slots.get_mut(id as usize)?;
        let sink = slot.take()?;
        self.free.insert(id);
        Some(sink)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> mpsc::Sender<inbound_message::Message> {
        mpsc::channel(1).0
    }

    #[test]
    fn ids_are_dense_and_unique_while_outstanding() {
        let mut table = RequestTable::default();
        assert_eq!(table.insert(sink()), 0);
        assert_eq!(table.insert(sink()), 1);
        assert_eq!(table.insert(sink()), 2);
    }

    #[test]
    fn vacated_slots_are_reused_smallest_first() {
        let mut table = RequestTable::default();
        for _ in 0..4 {
            table.insert(sink());
        }
        assert!(table.take(2).is_some());
        assert!(table.take(0).is_some());
        assert_eq!(table.insert(sink()), 0);
        assert_eq!(table.insert(sink()), 2);
        assert_eq!(table.insert(sink()), 4);
    }

    #[test]
    fn taking_a_vacant_slot_yields_nothing() {
        let mut table = RequestTable::default();
        assert!(table.take(0).is_none());
        table.insert(sink());
        assert!(table.take(0).is_some());
        assert!(table.take(0).is_none());
        assert!(table.take(99).is_none());
    }
}
