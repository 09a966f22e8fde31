//! The inbound dispatch chain.
//!
//! Every frame received on a connection is offered to an ordered list of
//! processors. The first one that claims it wins; frames nobody claims are
//! dropped.

use std::sync::{Arc, Weak};

use scene_net::{Connection, InboundHandler, message_ids};
use tracing::trace;

use crate::packet::Packet;

/// A member of the dispatch chain.
pub trait PacketProcessor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Offer a packet tagged with `tag`. Returns `true` if the packet was
    /// claimed, in which case later processors never see it.
    fn dispatch(&self, tag: u8, packet: &mut Packet) -> bool;
}

/// Ordered chain of [`PacketProcessor`]s.
#[derive(Default)]
pub struct DispatchChain {
    processors: Vec<Arc<dyn PacketProcessor>>,
}

impl DispatchChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a processor.
    #[must_use]
    pub fn with(mut self, processor: Arc<dyn PacketProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Offer `packet` to each processor in turn. Returns `true` if one
    /// claimed it.
    pub fn dispatch(&self, tag: u8, mut packet: Packet) -> bool {
        for processor in &self.processors {
            if processor.dispatch(tag, &mut packet) {
                trace!(tag, processor = processor.name(), "packet claimed");
                return true;
            }
        }
        trace!(
            tag,
            kind = message_ids::name(tag),
            len = packet.payload.len(),
            "unclaimed packet dropped"
        );
        false
    }

    /// Install this chain as the inbound hook of `connection`.
    ///
    /// The hook only holds weak references, so the connection does not keep
    /// the chain (or itself) alive.
    pub fn install(chain: &Arc<Self>, connection: &Arc<dyn Connection>) {
        let weak_chain: Weak<Self> = Arc::downgrade(chain);
        let weak_connection: Weak<dyn Connection> = Arc::downgrade(connection);
        let hook: InboundHandler = Arc::new(move |tag, payload| {
            let (Some(chain), Some(source)) = (weak_chain.upgrade(), weak_connection.upgrade())
            else {
                return;
            };
            chain.dispatch(tag, Packet::new(source, payload));
        });
        connection.set_inbound_handler(hook);
    }
}
