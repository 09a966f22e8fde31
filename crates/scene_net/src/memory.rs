//! In-process transport.
//!
//! [`MemoryConnection::pair`] returns two linked endpoints. Frames sent on
//! one side are queued on an unbounded channel and pumped into the other
//! side's inbound hook by a tokio task. Delivery is reliable and ordered, so
//! priority and reliability hints are only logged.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::{
    Connection, ConnectionMetadata, InboundHandler, PacketPriority, PacketReliability,
};
use crate::error::NetError;
use crate::framing;
use crate::message_ids;

/// A frame travelling between the two endpoints.
#[derive(Debug)]
struct Frame {
    tag: u8,
    payload: Vec<u8>,
}

/// One endpoint of an in-process link.
pub struct MemoryConnection {
    /// Label used in logs (`"client"` / `"host"`).
    label: &'static str,
    /// Queue towards the peer.
    outbound: mpsc::UnboundedSender<Frame>,
    /// Our own queue, taken by the pump task on first hook install.
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    /// Current inbound hook, read per frame so it can be replaced.
    handler: Arc<RwLock<Option<InboundHandler>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    open: AtomicBool,
    /// Shared by both endpoints: closing one side closes the link.
    closed: Arc<AtomicBool>,
    metadata: RwLock<ConnectionMetadata>,
    endpoint: RwLock<Option<String>>,
    open_count: AtomicUsize,
}

impl MemoryConnection {
    /// Create two linked endpoints, labelled `"client"` and `"host"`.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (to_host, host_rx) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let client = Self::endpoint_half("client", to_host, client_rx, Arc::clone(&closed));
        let host = Self::endpoint_half("host", to_client, host_rx, closed);
        (Arc::new(client), Arc::new(host))
    }

    fn endpoint_half(
        label: &'static str,
        outbound: mpsc::UnboundedSender<Frame>,
        inbound: mpsc::UnboundedReceiver<Frame>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            label,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            handler: Arc::new(RwLock::new(None)),
            pump: Mutex::new(None),
            open: AtomicBool::new(false),
            closed,
            metadata: RwLock::new(ConnectionMetadata::default()),
            endpoint: RwLock::new(None),
            open_count: AtomicUsize::new(0),
        }
    }

    /// How many times [`Connection::open`] succeeded on this endpoint.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// The endpoint string passed to the last successful `open`.
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, tag: u8, payload: Vec<u8>) -> Result<(), NetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Closed);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(NetError::NotOpen);
        }
        trace!(
            side = self.label,
            tag,
            kind = message_ids::name(tag),
            len = payload.len(),
            "memory frame out"
        );
        self.outbound
            .send(Frame { tag, payload })
            .map_err(|_| NetError::Closed)
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("label", &self.label)
            .field("open", &self.open.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open(&self, endpoint: &str, metadata: ConnectionMetadata) -> Result<(), NetError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetError::Closed);
        }
        *self.metadata.write().unwrap_or_else(PoisonError::into_inner) = metadata;
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.to_string());
        self.open.store(true, Ordering::SeqCst);
        self.open_count.fetch_add(1, Ordering::SeqCst);
        debug!(side = self.label, endpoint, "memory connection open");
        Ok(())
    }

    fn metadata(&self) -> ConnectionMetadata {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    fn send_system(&self, msg_id: u8, payload: Vec<u8>) -> Result<(), NetError> {
        self.push(msg_id, payload)
    }

    fn send_to_scene(
        &self,
        scene_handle: u8,
        route_index: u16,
        payload: &[u8],
        priority: PacketPriority,
        reliability: PacketReliability,
        channel: u8,
    ) -> Result<(), NetError> {
        if !message_ids::is_scene_handle(scene_handle) {
            return Err(NetError::Frame(format!(
                "{scene_handle} is not a scene handle"
            )));
        }
        trace!(
            side = self.label,
            scene_handle,
            route_index,
            ?priority,
            ?reliability,
            channel,
            "scene send"
        );
        self.push(scene_handle, framing::prefix(route_index, payload))
    }

    /// Must be called from within a tokio runtime: the first call spawns the
    /// pump task.
    fn set_inbound_handler(&self, handler: InboundHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        let Some(mut rx) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let current = Arc::clone(&self.handler);
        let closed = Arc::clone(&self.closed);
        let label = self.label;
        let pump = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let hook = current.read().unwrap_or_else(PoisonError::into_inner).clone();
                match hook {
                    Some(hook) => hook(frame.tag, frame.payload),
                    None => trace!(side = label, tag = frame.tag, "no inbound hook, frame dropped"),
                }
            }
            debug!(side = label, "memory pump stopped");
        });
        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(pump);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
        debug!(side = self.label, "memory connection closed");
    }
}
