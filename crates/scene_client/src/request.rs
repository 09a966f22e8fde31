//! System request/response correlation.
//!
//! The transport only moves tagged byte frames, so request/response
//! semantics are layered on top: every system request is prefixed with a
//! two-byte id, and the host answers with frames carrying the same id.
//!
//! - `REQUEST_RESPONSE_MSG` delivers an intermediate value.
//! - `REQUEST_RESPONSE_COMPLETE` ends the exchange successfully.
//! - `REQUEST_RESPONSE_ERROR` ends it with a fault message.
//!
//! The same processor also serves inbound system requests (server role):
//! handlers are registered up front, the table is frozen, and every inbound
//! request gets exactly one terminal frame once its handler finishes.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use scene_net::{Connection, codec, framing, message_ids};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dispatch::PacketProcessor;
use crate::error::ClientError;
use crate::packet::Packet;

/// Maximum number of system requests pending at once on one connection.
///
/// Ids are allocated in `0..MAX_PENDING_REQUESTS`; `u16::MAX` is never
/// issued.
pub const MAX_PENDING_REQUESTS: usize = u16::MAX as usize;

/// What a pending request receives from the host.
#[derive(Debug)]
enum RequestEvent {
    Value(Vec<u8>),
    Complete,
    Error(ClientError),
}

/// Runs on the receive path with the first value of a request, before any
/// later frame is dispatched. An error fails the request.
pub type FirstValueHook = Box<dyn FnOnce(&[u8]) -> Result<(), ClientError> + Send + Sync>;

/// A request waiting for its terminal frame.
struct PendingRequest {
    /// Distinguishes successive requests that reuse the same id.
    ticket: u64,
    msg_id: u8,
    created_at: Instant,
    sink: mpsc::UnboundedSender<RequestEvent>,
    on_first_value: Option<FirstValueHook>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("ticket", &self.ticket)
            .field("msg_id", &self.msg_id)
            .field("created_at", &self.created_at)
            .field("hooked", &self.on_first_value.is_some())
            .finish_non_exhaustive()
    }
}

/// The id → pending request table.
#[derive(Debug)]
struct PendingTable {
    entries: DashMap<u16, PendingRequest>,
    /// No id below this is free. Lowered on release, raised on reserve.
    lowest_free: Mutex<u16>,
    next_ticket: AtomicU64,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            entries: DashMap::new(),
            lowest_free: Mutex::new(0),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Register a new pending request under the first free id.
    fn reserve(
        &self,
        msg_id: u8,
        on_first_value: Option<FirstValueHook>,
    ) -> Result<(u16, u64, mpsc::UnboundedReceiver<RequestEvent>), ClientError> {
        let mut lowest_free = self.lowest_free.lock().unwrap_or_else(PoisonError::into_inner);
        for id in *lowest_free..u16::MAX {
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                let (sink, events) = mpsc::unbounded_channel();
                slot.insert(PendingRequest {
                    ticket,
                    msg_id,
                    created_at: Instant::now(),
                    sink,
                    on_first_value,
                });
                *lowest_free = id + 1;
                return Ok((id, ticket, events));
            }
        }
        *lowest_free = u16::MAX;
        Err(ClientError::ResourceExhausted(self.entries.len()))
    }

    fn mark_free(&self, id: u16) {
        let mut lowest_free = self.lowest_free.lock().unwrap_or_else(PoisonError::into_inner);
        if id < *lowest_free {
            *lowest_free = id;
        }
    }

    /// Settle and release `id`, whatever request holds it.
    fn take(&self, id: u16) -> Option<PendingRequest> {
        let (_, pending) = self.entries.remove(&id)?;
        self.mark_free(id);
        Some(pending)
    }

    /// Release `id` only if it is still held by `ticket`.
    fn take_ticket(&self, id: u16, ticket: u64) -> Option<PendingRequest> {
        let (_, pending) = self.entries.remove_if(&id, |_, p| p.ticket == ticket)?;
        self.mark_free(id);
        Some(pending)
    }

    fn snapshot(&self) -> Vec<(u16, u64, Instant)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.ticket, e.created_at))
            .collect()
    }
}

/// Completion handle of one system request.
///
/// Values arrive in order through [`RequestStream::next`]. Dropping the
/// stream before the exchange ends cancels it and releases the id.
#[derive(Debug)]
pub struct RequestStream {
    id: u16,
    ticket: u64,
    events: mpsc::UnboundedReceiver<RequestEvent>,
    table: Weak<PendingTable>,
    settled: bool,
}

impl RequestStream {
    /// The request id carried on the wire.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Returns `true` once the exchange has ended.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Wait for the next value. Returns `None` once the exchange completed
    /// successfully, or `Some(Err(_))` once when it failed.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, ClientError>> {
        if self.settled {
            return None;
        }
        match self.events.recv().await {
            Some(RequestEvent::Value(value)) => Some(Ok(value)),
            Some(RequestEvent::Complete) => {
                self.settled = true;
                None
            }
            Some(RequestEvent::Error(err)) => {
                self.settled = true;
                Some(Err(err))
            }
            None => {
                self.settled = true;
                Some(Err(ClientError::Transport(format!(
                    "system request {} was dropped",
                    self.id
                ))))
            }
        }
    }

    /// Wait for exactly one value followed by completion.
    ///
    /// # Errors
    ///
    /// Returns the request's failure, or [`ClientError::Protocol`] if the
    /// host completed without sending a value.
    pub async fn single(mut self) -> Result<Vec<u8>, ClientError> {
        let mut first = None;
        while let Some(value) = self.next().await {
            let value = value?;
            if first.is_none() {
                first = Some(value);
            } else {
                trace!(id = self.id, "extra value ignored");
            }
        }
        first.ok_or_else(|| {
            ClientError::Protocol(format!("system request {} completed without a value", self.id))
        })
    }

    /// Wait for completion, gathering every value.
    ///
    /// # Errors
    ///
    /// Returns the request's failure.
    pub async fn collect(mut self) -> Result<Vec<Vec<u8>>, ClientError> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await {
            values.push(value?);
        }
        Ok(values)
    }

    /// Wait for completion, ignoring any value.
    ///
    /// # Errors
    ///
    /// Returns the request's failure.
    pub async fn finish(mut self) -> Result<(), ClientError> {
        while let Some(value) = self.next().await {
            value?;
        }
        Ok(())
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(table) = self.table.upgrade() else {
            return;
        };
        if table.take_ticket(self.id, self.ticket).is_some() {
            debug!(id = self.id, "system request cancelled");
        }
    }
}

/// Handler serving one kind of inbound system request.
pub type SystemRequestHandler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<(), ClientError>> + Send + Sync>;

/// Wrap an async closure as a [`SystemRequestHandler`].
pub fn system_handler<F, Fut>(f: F) -> SystemRequestHandler
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// An inbound system request being served.
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: u16,
    msg_id: u8,
    input: Vec<u8>,
    source: Arc<dyn Connection>,
    terminated: Arc<AtomicBool>,
}

impl RequestContext {
    /// The request id chosen by the peer.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The message kind the request arrived with.
    #[must_use]
    pub fn msg_id(&self) -> u8 {
        self.msg_id
    }

    /// The request body, id prefix removed.
    #[must_use]
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    /// The connection the request arrived on.
    #[must_use]
    pub fn source(&self) -> &Arc<dyn Connection> {
        &self.source
    }

    /// Decode the body as MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if the body does not decode.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(codec::decode(&self.input)?)
    }

    /// Send an intermediate value.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] once the request has been terminated,
    /// or the transport failure.
    pub fn send(&self, value: &[u8]) -> Result<(), ClientError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ClientError::State(format!(
                "system request {} already terminated",
                self.id
            )));
        }
        self.source.send_system(
            message_ids::REQUEST_RESPONSE_MSG,
            framing::prefix(self.id, value),
        )?;
        Ok(())
    }

    /// Encode `value` as MessagePack and send it as an intermediate value.
    ///
    /// # Errors
    ///
    /// See [`RequestContext::send`].
    pub fn send_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ClientError> {
        self.send(&codec::encode(value)?)
    }
}

/// Correlates outbound system requests and serves inbound ones.
pub struct RequestProcessor {
    connection: Arc<dyn Connection>,
    table: Arc<PendingTable>,
    handlers: RwLock<HashMap<u8, SystemRequestHandler>>,
    frozen: AtomicBool,
}

impl RequestProcessor {
    /// Create a processor sending on `connection`.
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            table: Arc::new(PendingTable::new()),
            handlers: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Number of requests currently pending.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table.entries.len()
    }

    /// Reserve the first free request id without sending anything.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ResourceExhausted`] if every id is in use.
    pub fn reserve_request_slot(&self, msg_id: u8) -> Result<RequestStream, ClientError> {
        self.reserve(msg_id, None)
    }

    fn reserve(
        &self,
        msg_id: u8,
        on_first_value: Option<FirstValueHook>,
    ) -> Result<RequestStream, ClientError> {
        let (id, ticket, events) = self.table.reserve(msg_id, on_first_value)?;
        Ok(RequestStream {
            id,
            ticket,
            events,
            table: Arc::downgrade(&self.table),
            settled: false,
        })
    }

    /// Send a system request. Never waits for the reply: the returned
    /// stream settles when a correlated frame arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ResourceExhausted`] if every id is in use, or
    /// [`ClientError::Transport`] if the send fails (the id is released).
    pub fn send_system_request(&self, msg_id: u8, body: &[u8]) -> Result<RequestStream, ClientError> {
        self.send(msg_id, body, None)
    }

    /// Like [`RequestProcessor::send_system_request`], but `hook` sees the
    /// first value on the receive path. State the hook sets up is in place
    /// before the next inbound frame is dispatched.
    ///
    /// # Errors
    ///
    /// See [`RequestProcessor::send_system_request`].
    pub fn send_system_request_with_hook(
        &self,
        msg_id: u8,
        body: &[u8],
        hook: FirstValueHook,
    ) -> Result<RequestStream, ClientError> {
        self.send(msg_id, body, Some(hook))
    }

    fn send(
        &self,
        msg_id: u8,
        body: &[u8],
        on_first_value: Option<FirstValueHook>,
    ) -> Result<RequestStream, ClientError> {
        let stream = self.reserve(msg_id, on_first_value)?;
        debug!(
            id = stream.id,
            msg_id,
            kind = message_ids::name(msg_id),
            len = body.len(),
            "system request"
        );
        self.connection
            .send_system(msg_id, framing::prefix(stream.id, body))?;
        Ok(stream)
    }

    /// Encode `body`, send it, and decode the single reply value.
    ///
    /// # Errors
    ///
    /// Returns any send, remote or decoding failure.
    pub async fn request<T, R>(&self, msg_id: u8, body: &T) -> Result<R, ClientError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let stream = self.send_system_request(msg_id, &codec::encode(body)?)?;
        let reply = stream.single().await?;
        Ok(codec::decode(&reply)?)
    }

    /// Fail every request pending longer than `max_age`. Returns how many
    /// were expired.
    pub fn expire_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut expired = 0;
        for (id, ticket, created_at) in self.table.snapshot() {
            if now.duration_since(created_at) < max_age {
                continue;
            }
            if let Some(pending) = self.table.take_ticket(id, ticket) {
                warn!(id, msg_id = pending.msg_id, "system request expired");
                let _ = pending.sink.send(RequestEvent::Error(ClientError::Timeout(id)));
                expired += 1;
            }
        }
        expired
    }

    /// Fail every pending request with `err`.
    pub fn fail_all(&self, err: &ClientError) {
        for (id, ticket, _) in self.table.snapshot() {
            if let Some(pending) = self.table.take_ticket(id, ticket) {
                let _ = pending.sink.send(RequestEvent::Error(err.clone()));
            }
        }
    }

    /// Register the handler serving inbound requests tagged `msg_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] after [`RequestProcessor::freeze`], or
    /// [`ClientError::Argument`] if `msg_id` is a reserved response or
    /// scene tag, or already has a handler.
    pub fn add_handler(&self, msg_id: u8, handler: SystemRequestHandler) -> Result<(), ClientError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(ClientError::State(
                "system request handlers are frozen".to_string(),
            ));
        }
        if message_ids::is_request_response(msg_id) || message_ids::is_scene_handle(msg_id) {
            return Err(ClientError::Argument(format!(
                "message kind {msg_id} cannot carry system requests"
            )));
        }
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&msg_id) {
            return Err(ClientError::Argument(format!(
                "message kind {msg_id} already has a handler"
            )));
        }
        handlers.insert(msg_id, handler);
        Ok(())
    }

    /// Freeze the handler table and start serving inbound requests.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the handler table is frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    fn handle_response(&self, tag: u8, packet: &mut Packet) {
        let (id, body) = match framing::split_prefix(&packet.payload) {
            Ok(parts) => parts,
            Err(err) => {
                trace!(tag, %err, "malformed response dropped");
                return;
            }
        };
        packet.metadata.request_id = Some(id);
        match tag {
            message_ids::REQUEST_RESPONSE_MSG => {
                let Some(mut pending) = self.table.entries.get_mut(&id) else {
                    trace!(id, "value for unknown request discarded");
                    return;
                };
                let applied = pending.on_first_value.take().map_or(Ok(()), |hook| hook(body));
                match applied {
                    Ok(()) => {
                        let _ = pending.sink.send(RequestEvent::Value(body.to_vec()));
                    }
                    Err(err) => {
                        drop(pending);
                        if let Some(pending) = self.table.take(id) {
                            debug!(id, msg_id = pending.msg_id, %err, "system request reply rejected");
                            let _ = pending.sink.send(RequestEvent::Error(err));
                        }
                    }
                }
            }
            message_ids::REQUEST_RESPONSE_COMPLETE => {
                let Some(pending) = self.table.take(id) else {
                    trace!(id, "completion for unknown request discarded");
                    return;
                };
                debug!(id, msg_id = pending.msg_id, "system request complete");
                let _ = pending.sink.send(RequestEvent::Complete);
            }
            _ => {
                let Some(pending) = self.table.take(id) else {
                    trace!(id, "error for unknown request discarded");
                    return;
                };
                let message = codec::decode::<String>(body)
                    .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
                debug!(id, msg_id = pending.msg_id, message, "system request failed");
                let _ = pending
                    .sink
                    .send(RequestEvent::Error(ClientError::RemoteFault(message)));
            }
        }
    }

    fn serve(&self, tag: u8, handler: SystemRequestHandler, packet: &mut Packet) {
        let (id, body) = match framing::split_prefix(&packet.payload) {
            Ok(parts) => parts,
            Err(err) => {
                trace!(tag, %err, "malformed system request dropped");
                return;
            }
        };
        packet.metadata.request_id = Some(id);
        let terminated = Arc::new(AtomicBool::new(false));
        let ctx = RequestContext {
            id,
            msg_id: tag,
            input: body.to_vec(),
            source: Arc::clone(&packet.source),
            terminated: Arc::clone(&terminated),
        };
        let source = Arc::clone(&packet.source);
        let work = handler(ctx);
        tokio::spawn(async move {
            let outcome = tokio::spawn(work).await;
            terminated.store(true, Ordering::SeqCst);
            let fault = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(join) => Some(format!("system request handler aborted: {join}")),
            };
            let sent = match fault {
                None => source.send_system(
                    message_ids::REQUEST_RESPONSE_COMPLETE,
                    framing::prefix(id, &[]),
                ),
                Some(message) => {
                    debug!(id, msg_id = tag, message, "system request handler failed");
                    codec::encode(&message).and_then(|body| {
                        source.send_system(
                            message_ids::REQUEST_RESPONSE_ERROR,
                            framing::prefix(id, &body),
                        )
                    })
                }
            };
            if let Err(err) = sent {
                warn!(id, msg_id = tag, %err, "failed to terminate system request");
            }
        });
    }
}

impl PacketProcessor for RequestProcessor {
    fn name(&self) -> &'static str {
        "request_processor"
    }

    fn dispatch(&self, tag: u8, packet: &mut Packet) -> bool {
        if message_ids::is_request_response(tag) {
            self.handle_response(tag, packet);
            return true;
        }
        if !self.is_frozen() {
            return false;
        }
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tag)
            .cloned();
        match handler {
            Some(handler) => {
                self.serve(tag, handler, packet);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for RequestProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestProcessor")
            .field("pending", &self.pending_count())
            .field("frozen", &self.is_frozen())
            .finish_non_exhaustive()
    }
}
