//! A joined scene and its connect handshake.
//!
//! A [`Scene`] is obtained from [`Client::get_scene`]. While `Created`,
//! local routes may be added; [`Scene::connect`] then sends them to the host,
//! which answers with a scene handle and one index per route. From then on
//! inbound traffic tagged with the handle is routed here and fanned out to
//! the handlers of the addressed route.
//!
//! ```text
//! Created ──connect──▶ Connecting ──ok──▶ Connected ──disconnect──▶ Disconnected
//!    ▲                     │
//!    └──────failure────────┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use scene_net::connection::DEFAULT_CHANNEL;
use scene_net::messages::{RouteDto, SceneInfosDto};
use scene_net::{Connection, Metadata, PacketPriority, PacketReliability, Serializer, framing};
use serde::Serialize;
use tracing::{info, trace, warn};

use crate::client::{Client, ClientInner};
use crate::components::ComponentRegistry;
use crate::error::ClientError;
use crate::packet::Packet;
use crate::route::{HandlerChain, PacketHandler, Route, Subscription};

/// Prefix reserved for host-defined routes.
pub const RESERVED_ROUTE_PREFIX: char = '@';

/// Handshake state of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneState {
    /// Routes may be added.
    Created,
    /// The connect request is in flight.
    Connecting,
    /// Handle and route indices are assigned; traffic flows.
    Connected,
    /// Terminal.
    Disconnected,
}

#[derive(Debug)]
struct Link {
    state: SceneState,
    handle: Option<u8>,
}

type RouteLookup = Arc<HashMap<u16, Arc<HandlerChain>>>;

struct SceneInner {
    id: String,
    token: String,
    client: Weak<ClientInner>,
    connection: Arc<dyn Connection>,
    serializer: Serializer,
    host_metadata: Metadata,
    link: RwLock<Link>,
    local_routes: RwLock<HashMap<String, Route>>,
    remote_routes: HashMap<String, Route>,
    /// Local route index → handler chain, rebuilt once at connect.
    lookup: RwLock<RouteLookup>,
    observers: Arc<HandlerChain>,
    components: ComponentRegistry,
}

/// One joined scene. Clones share the same scene.
#[derive(Clone)]
pub struct Scene {
    inner: Arc<SceneInner>,
}

impl Scene {
    pub(crate) fn new(
        client: Weak<ClientInner>,
        connection: Arc<dyn Connection>,
        token: String,
        infos: SceneInfosDto,
        serializer: Serializer,
    ) -> Self {
        let remote_routes = infos
            .routes
            .into_iter()
            .map(|dto| (dto.name.clone(), Route::from(dto)))
            .collect();
        Self {
            inner: Arc::new(SceneInner {
                id: infos.scene_id,
                token,
                client,
                connection,
                serializer,
                host_metadata: infos.metadata,
                link: RwLock::new(Link {
                    state: SceneState::Created,
                    handle: None,
                }),
                local_routes: RwLock::new(HashMap::new()),
                remote_routes,
                lookup: RwLock::new(Arc::new(HashMap::new())),
                observers: HandlerChain::new(),
                components: ComponentRegistry::new(),
            }),
        }
    }

    /// Scene id as reported by the host.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The join token this scene was obtained with.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Current handshake state.
    #[must_use]
    pub fn state(&self) -> SceneState {
        self.link().state
    }

    /// Handle assigned by the host, `None` unless connected.
    #[must_use]
    pub fn handle(&self) -> Option<u8> {
        self.link().handle
    }

    /// Serializer negotiated for user data.
    #[must_use]
    pub fn serializer(&self) -> Serializer {
        self.inner.serializer
    }

    /// One entry of the host's scene metadata.
    #[must_use]
    pub fn host_metadata(&self, key: &str) -> Option<&str> {
        self.inner.host_metadata.get(key).map(String::as_str)
    }

    /// Every entry of the host's scene metadata.
    #[must_use]
    pub fn host_metadata_map(&self) -> &Metadata {
        &self.inner.host_metadata
    }

    /// A local route by name.
    #[must_use]
    pub fn local_route(&self, name: &str) -> Option<Route> {
        self.inner
            .local_routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Every local route.
    #[must_use]
    pub fn local_routes(&self) -> Vec<Route> {
        self.inner
            .local_routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// A host route by name.
    #[must_use]
    pub fn remote_route(&self, name: &str) -> Option<&Route> {
        self.inner.remote_routes.get(name)
    }

    /// Every host route.
    pub fn remote_routes(&self) -> impl Iterator<Item = &Route> {
        self.inner.remote_routes.values()
    }

    /// Subscribe `handler` to the local route `name`, creating the route on
    /// first use. `metadata` is merged into the route's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] for an empty or `@`-prefixed name,
    /// or [`ClientError::State`] once the scene has left `Created`; the route
    /// table is left unchanged in both cases.
    pub fn add_route(
        &self,
        name: &str,
        handler: PacketHandler,
        metadata: Metadata,
    ) -> Result<Subscription, ClientError> {
        if name.is_empty() {
            return Err(ClientError::Argument("route name is empty".to_string()));
        }
        if name.starts_with(RESERVED_ROUTE_PREFIX) {
            return Err(ClientError::Argument(format!(
                "route name {name:?} uses the reserved '{RESERVED_ROUTE_PREFIX}' prefix"
            )));
        }
        // Held across the table update so connect cannot start half-way.
        let link = self.inner.link.read().unwrap_or_else(PoisonError::into_inner);
        if link.state != SceneState::Created {
            return Err(ClientError::State(format!(
                "cannot add route {name:?} to scene {} in state {:?}",
                self.inner.id, link.state
            )));
        }
        let mut routes = self
            .inner
            .local_routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let route = routes
            .entry(name.to_string())
            .and_modify(|route| route.merge_metadata(metadata.clone()))
            .or_insert_with(|| Route::new(name, metadata));
        Ok(route.handlers().subscribe(handler))
    }

    /// Observe every packet addressed to this scene before route dispatch.
    pub fn on_packet_received(&self, handler: PacketHandler) -> Subscription {
        self.inner.observers.subscribe(handler)
    }

    /// Register the factory of component `T`.
    pub fn register_component<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Scene) -> T + Send + Sync + 'static,
    {
        self.inner.components.register(factory);
    }

    /// The scene's instance of component `T`, or `None` if `T` was never
    /// registered.
    #[must_use]
    pub fn component<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.inner.components.get::<T>(self)
    }

    /// Run the connect handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] unless the scene is `Created`, or the
    /// handshake failure; the scene is then back in `Created` and the call
    /// may be retried.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.begin_connect()?;
        let outcome = match self.client() {
            Some(client) => client.connect_to_scene(self).await,
            None => Err(ClientError::State("client was dropped".to_string())),
        };
        if let Err(err) = &outcome {
            warn!(scene = self.id(), %err, "scene connect failed");
            self.revert_connect();
        }
        outcome
    }

    /// Leave the scene. Disconnecting twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] if the scene never connected, or the
    /// host's answer to the disconnect request. The scene is unregistered
    /// either way.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let handle = {
            let mut link = self.inner.link.write().unwrap_or_else(PoisonError::into_inner);
            match link.state {
                SceneState::Connected => {
                    link.state = SceneState::Disconnected;
                    link.handle.take()
                }
                SceneState::Disconnected => return Ok(()),
                state => {
                    return Err(ClientError::State(format!(
                        "cannot disconnect scene {} in state {state:?}",
                        self.inner.id
                    )));
                }
            }
        };
        info!(scene = self.id(), handle, "scene disconnected");
        match (self.client(), handle) {
            (Some(client), Some(handle)) => client.disconnect_scene(self, handle).await,
            _ => Ok(()),
        }
    }

    /// Send raw bytes on the host route `route`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] unless connected,
    /// [`ClientError::Protocol`] if the host has no such route (nothing is
    /// sent), or the transport failure.
    pub fn send_packet(
        &self,
        route: &str,
        payload: &[u8],
        priority: PacketPriority,
        reliability: PacketReliability,
    ) -> Result<(), ClientError> {
        let handle = {
            let link = self.link();
            match (link.state, link.handle) {
                (SceneState::Connected, Some(handle)) => handle,
                (state, _) => {
                    return Err(ClientError::State(format!(
                        "cannot send on scene {} in state {state:?}",
                        self.inner.id
                    )));
                }
            }
        };
        let index = self
            .inner
            .remote_routes
            .get(route)
            .and_then(Route::index)
            .ok_or_else(|| {
                ClientError::Protocol(format!(
                    "scene {} has no host route {route:?}",
                    self.inner.id
                ))
            })?;
        self.inner.connection.send_to_scene(
            handle,
            index,
            payload,
            priority,
            reliability,
            DEFAULT_CHANNEL,
        )?;
        Ok(())
    }

    /// Serialize `value` with the negotiated serializer and send it on
    /// `route` with default priority and reliability.
    ///
    /// # Errors
    ///
    /// See [`Scene::send_packet`]; also fails if `value` cannot be
    /// serialized.
    pub fn send<T: Serialize + ?Sized>(&self, route: &str, value: &T) -> Result<(), ClientError> {
        let payload = self.inner.serializer.serialize(value)?;
        self.send_packet(
            route,
            &payload,
            PacketPriority::default(),
            PacketReliability::default(),
        )
    }

    /// Deliver an inbound scene packet: observers first, then the handlers
    /// of the route named by the two-byte index prefix.
    pub fn handle_message(&self, packet: &mut Packet) {
        packet.serializer = self.inner.serializer;
        self.inner.observers.dispatch(packet);

        let (index, body) = match framing::split_prefix(&packet.payload) {
            Ok((index, body)) => (index, body.to_vec()),
            Err(err) => {
                trace!(scene = self.id(), %err, "short scene packet dropped");
                return;
            }
        };
        packet.payload = body;
        packet.metadata.route_index = Some(index);

        let chain = self
            .inner
            .lookup
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned();
        match chain {
            Some(chain) => {
                chain.dispatch(packet);
            }
            None => trace!(scene = self.id(), index, "packet for unknown route dropped"),
        }
    }

    fn link(&self) -> std::sync::RwLockReadGuard<'_, Link> {
        self.inner.link.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Option<Client> {
        self.inner.client.upgrade().map(Client::from_inner)
    }

    pub(crate) fn begin_connect(&self) -> Result<(), ClientError> {
        let mut link = self.inner.link.write().unwrap_or_else(PoisonError::into_inner);
        if link.state != SceneState::Created {
            return Err(ClientError::State(format!(
                "cannot connect scene {} in state {:?}",
                self.inner.id, link.state
            )));
        }
        link.state = SceneState::Connecting;
        Ok(())
    }

    /// Undo a handshake that failed, including one whose answer was already
    /// applied. A scene disconnected meanwhile stays disconnected.
    pub(crate) fn revert_connect(&self) {
        let mut link = self.inner.link.write().unwrap_or_else(PoisonError::into_inner);
        match link.state {
            SceneState::Connecting => {}
            SceneState::Connected => {
                let mut routes = self
                    .inner
                    .local_routes
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                routes.values_mut().for_each(Route::clear_index);
                *self
                    .inner
                    .lookup
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::new(HashMap::new());
            }
            SceneState::Created | SceneState::Disconnected => return,
        }
        link.state = SceneState::Created;
        link.handle = None;
    }

    /// Returns `true` if both values refer to the same scene.
    pub(crate) fn same_scene(&self, other: &Scene) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wire descriptors of the local routes, sent with the connect request.
    pub(crate) fn local_descriptors(&self) -> Vec<RouteDto> {
        let mut descriptors: Vec<RouteDto> =
            self.local_routes().iter().map(Route::descriptor).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Apply the host's connect answer and enter `Connected`.
    ///
    /// Every local route must be mapped; extra mappings are ignored.
    pub(crate) fn complete_connect(
        &self,
        handle: u8,
        mappings: &HashMap<String, u16>,
    ) -> Result<(), ClientError> {
        let mut link = self.inner.link.write().unwrap_or_else(PoisonError::into_inner);
        if link.state != SceneState::Connecting {
            return Err(ClientError::State(format!(
                "scene {} is not connecting",
                self.inner.id
            )));
        }
        let mut routes = self
            .inner
            .local_routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(missing) = routes.keys().find(|name| !mappings.contains_key(*name)) {
            return Err(ClientError::Protocol(format!(
                "host did not map route {missing:?} of scene {}",
                self.inner.id
            )));
        }
        for name in mappings.keys().filter(|name| !routes.contains_key(*name)) {
            warn!(scene = self.id(), route = %name, "host mapped an unknown route");
        }

        let mut lookup = HashMap::with_capacity(routes.len());
        for (name, route) in routes.iter_mut() {
            let index = mappings[name];
            route.set_index(index);
            lookup.insert(index, Arc::clone(route.handlers()));
        }
        *self
            .inner
            .lookup
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(lookup);
        link.handle = Some(handle);
        link.state = SceneState::Connected;
        info!(scene = self.id(), handle, routes = routes.len(), "scene connected");
        Ok(())
    }

    /// Enter `Disconnected` without talking to the host.
    pub(crate) fn mark_disconnected(&self) {
        let mut link = self.inner.link.write().unwrap_or_else(PoisonError::into_inner);
        link.state = SceneState::Disconnected;
        link.handle = None;
    }

    #[cfg(test)]
    pub(crate) fn connected_for_tests(
        id: &str,
        handle: u8,
        connection: Arc<dyn Connection>,
        serializer: Serializer,
    ) -> Self {
        let infos = SceneInfosDto {
            scene_id: id.to_string(),
            metadata: Metadata::new(),
            routes: Vec::new(),
            selected_serializer: serializer.name().to_string(),
        };
        let scene = Self::new(Weak::new(), connection, String::new(), infos, serializer);
        if let Ok(mut link) = scene.inner.link.write() {
            link.state = SceneState::Connected;
            link.handle = Some(handle);
        }
        scene
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = self.link();
        f.debug_struct("Scene")
            .field("id", &self.inner.id)
            .field("state", &link.state)
            .field("handle", &link.handle)
            .field("serializer", &self.inner.serializer)
            .field("remote_routes", &self.inner.remote_routes.len())
            .finish_non_exhaustive()
    }
}
