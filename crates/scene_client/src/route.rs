//! Routes and their handler chains.
//!
//! A [`HandlerChain`] is copy-on-write: subscribing or unsubscribing swaps
//! in a new list, and dispatch iterates the list that was current when it
//! started. Handlers added or removed mid-dispatch take effect on the next
//! packet.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use scene_net::Metadata;
use scene_net::messages::{RouteDto, UNASSIGNED_ROUTE_INDEX};

use crate::packet::Packet;

/// Callback invoked for every packet delivered to a route.
pub type PacketHandler = Arc<dyn Fn(&Packet) + Send + Sync>;

type HandlerList = Arc<Vec<(u64, PacketHandler)>>;

/// An ordered set of packet handlers.
#[derive(Default)]
pub struct HandlerChain {
    next_id: AtomicU64,
    handlers: RwLock<HandlerList>,
}

impl HandlerChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a handler. The returned [`Subscription`] removes it again.
    pub fn subscribe(self: &Arc<Self>, handler: PacketHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(handlers.len() + 1);
        next.extend(handlers.iter().cloned());
        next.push((id, handler));
        *handlers = Arc::new(next);
        Subscription {
            chain: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if !handlers.iter().any(|(h, _)| *h == id) {
            return false;
        }
        let next: Vec<_> = handlers.iter().filter(|(h, _)| *h != id).cloned().collect();
        *handlers = Arc::new(next);
        true
    }

    fn snapshot(&self) -> HandlerList {
        Arc::clone(&self.handlers.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Invoke every handler subscribed when the call started. Returns the
    /// number of handlers invoked.
    pub fn dispatch(&self, packet: &Packet) -> usize {
        let snapshot = self.snapshot();
        for (_, handler) in snapshot.iter() {
            handler(packet);
        }
        snapshot.len()
    }

    /// Number of subscribed handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Returns `true` if no handler is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.len())
            .finish()
    }
}

/// Disposer returned by [`HandlerChain::subscribe`].
///
/// Dropping a subscription keeps the handler subscribed; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    chain: Weak<HandlerChain>,
    id: u64,
}

impl Subscription {
    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.chain
            .upgrade()
            .is_some_and(|chain| chain.unsubscribe(self.id))
    }
}

/// A named sub-channel of a scene.
#[derive(Debug, Clone)]
pub struct Route {
    name: String,
    /// `None` until the host assigns an index.
    index: Option<u16>,
    metadata: Metadata,
    handlers: Arc<HandlerChain>,
}

impl Route {
    /// Create a route with no index yet.
    #[must_use]
    pub fn new(name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            index: None,
            metadata,
            handlers: HandlerChain::new(),
        }
    }

    /// Create a route whose index is already known (host routes).
    #[must_use]
    pub fn with_index(name: impl Into<String>, index: u16, metadata: Metadata) -> Self {
        Self {
            index: Some(index),
            ..Self::new(name, metadata)
        }
    }

    /// Route name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host-assigned index, `None` before the connect handshake.
    #[must_use]
    pub fn index(&self) -> Option<u16> {
        self.index
    }

    /// Route metadata.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The handler chain shared by every clone of this route.
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerChain> {
        &self.handlers
    }

    pub(crate) fn set_index(&mut self, index: u16) {
        self.index = Some(index);
    }

    pub(crate) fn clear_index(&mut self) {
        self.index = None;
    }

    pub(crate) fn merge_metadata(&mut self, metadata: Metadata) {
        self.metadata.extend(metadata);
    }

    /// The wire description of this route.
    #[must_use]
    pub fn descriptor(&self) -> RouteDto {
        RouteDto {
            name: self.name.clone(),
            handle: self.index.unwrap_or(UNASSIGNED_ROUTE_INDEX),
            metadata: self.metadata.clone(),
        }
    }
}

impl From<RouteDto> for Route {
    fn from(dto: RouteDto) -> Self {
        Self::with_index(dto.name, dto.handle, dto.metadata)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use scene_net::MemoryConnection;

    use super::*;

    fn packet() -> Packet {
        let (client, _host) = MemoryConnection::pair();
        Packet::new(client, vec![1, 2, 3])
    }

    fn counter(hits: &Arc<AtomicUsize>) -> PacketHandler {
        let hits = Arc::clone(hits);
        Arc::new(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_dispatch_reaches_every_handler() {
        let chain = HandlerChain::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _a = chain.subscribe(counter(&hits));
        let _b = chain.subscribe(counter(&hits));
        assert_eq!(chain.dispatch(&packet()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_handler() {
        let chain = HandlerChain::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = chain.subscribe(counter(&hits));
        let _b = chain.subscribe(counter(&hits));
        assert!(a.unsubscribe());
        assert_eq!(chain.len(), 1);
        chain.dispatch(&packet());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_chain_dropped() {
        let chain = HandlerChain::new();
        let sub = chain.subscribe(Arc::new(|_| {}));
        drop(chain);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn test_subscribe_during_dispatch_uses_snapshot() {
        let chain = HandlerChain::new();
        let added = Arc::new(Mutex::new(Vec::new()));
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_chain = Arc::downgrade(&chain);
        let inner_hits = Arc::clone(&hits);
        let inner_added = Arc::clone(&added);
        let _sub = chain.subscribe(Arc::new(move |_| {
            if let Some(chain) = inner_chain.upgrade() {
                let sub = chain.subscribe(counter(&inner_hits));
                inner_added.lock().unwrap().push(sub);
            }
        }));

        assert_eq!(chain.dispatch(&packet()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_poisoned_chain_still_subscribes() {
        let chain = HandlerChain::new();
        let poisoner = Arc::clone(&chain);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.handlers.write().unwrap();
            panic!("poison the handler lock");
        })
        .join();
        assert!(chain.handlers.is_poisoned());

        let hits = Arc::new(AtomicUsize::new(0));
        let sub = chain.subscribe(counter(&hits));
        assert_eq!(chain.dispatch(&packet()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(sub.unsubscribe());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_route_descriptor_uses_placeholder_until_assigned() {
        let mut meta = Metadata::new();
        meta.insert("kind".to_string(), "chat".to_string());
        let mut route = Route::new("chat", meta);
        assert_eq!(route.descriptor().handle, UNASSIGNED_ROUTE_INDEX);
        assert_eq!(route.descriptor().metadata["kind"], "chat");
        route.set_index(9);
        assert_eq!(route.index(), Some(9));
        assert_eq!(route.descriptor().handle, 9);
    }

    #[test]
    fn test_route_clones_share_handlers() {
        let route = Route::new("chat", Metadata::new());
        let clone = route.clone();
        let _sub = route.handlers().subscribe(Arc::new(|_| {}));
        assert_eq!(clone.handlers().len(), 1);
    }
}
