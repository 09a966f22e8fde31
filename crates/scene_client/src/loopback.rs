//! An in-process scene host.
//!
//! [`LoopbackHost`] answers the system requests of a client on the other end
//! of a [`MemoryConnection`](scene_net::MemoryConnection) pair. It hosts a
//! fixed set of scenes, hands out tokens for them, records the scene traffic
//! it receives and can echo that traffic back to the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use scene_net::connection::{DEFAULT_CHANNEL, keys};
use scene_net::messages::{
    ConnectToSceneMsg, ConnectionResult, RouteDto, SceneInfosDto, SceneInfosRequest,
};
use scene_net::serializer::parse_advertised;
use scene_net::token::encode_token;
use scene_net::{
    Connection, ConnectionMetadata, Metadata, PacketPriority, PacketReliability, Serializer,
    TokenData, decode_token, framing, message_ids,
};
use tracing::{debug, info, trace};

use crate::config::DEFAULT_TRANSPORT;
use crate::dispatch::{DispatchChain, PacketProcessor};
use crate::error::ClientError;
use crate::packet::Packet;
use crate::request::{RequestContext, RequestProcessor, system_handler};
use crate::token_provider::TokenProvider;

/// Endpoint written into issued tokens.
pub const LOOPBACK_ENDPOINT: &str = "loopback";

/// Signature written into issued tokens.
const LOOPBACK_SIGNATURE: &str = "loopback";

/// A scene offered by the host.
#[derive(Debug, Clone)]
pub struct HostedScene {
    id: String,
    metadata: Metadata,
    routes: Vec<String>,
}

impl HostedScene {
    /// A scene with no metadata and no routes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: Metadata::new(),
            routes: Vec::new(),
        }
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add a host route. Indices follow declaration order from 0.
    #[must_use]
    pub fn with_route(mut self, name: impl Into<String>) -> Self {
        self.routes.push(name.into());
        self
    }

    /// Scene id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn descriptors(&self) -> Vec<RouteDto> {
        self.routes
            .iter()
            .zip(0u16..)
            .map(|(name, handle)| RouteDto {
                name: name.clone(),
                handle,
                metadata: Metadata::new(),
            })
            .collect()
    }
}

/// A scene a client is connected to.
#[derive(Debug)]
struct Session {
    scene_id: String,
    /// Client route name → index assigned by this host.
    client_routes: HashMap<String, u16>,
}

#[derive(Debug)]
struct HostState {
    next_handle: u16,
    sessions: HashMap<u8, Session>,
    mappings: HashMap<String, HashMap<String, u16>>,
    received: HashMap<String, Vec<(String, Vec<u8>)>>,
    disconnected: Vec<u8>,
}

struct HostInner {
    connection: Arc<dyn Connection>,
    serializers: Vec<Serializer>,
    scenes: HashMap<String, HostedScene>,
    echo: bool,
    state: Mutex<HostState>,
    chain: OnceLock<Arc<DispatchChain>>,
}

impl HostInner {
    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hosted(&self, token: &str) -> Result<&HostedScene, ClientError> {
        let data = decode_token(token)?;
        self.scenes
            .get(&data.scene_id)
            .ok_or_else(|| ClientError::Argument(format!("unknown scene {:?}", data.scene_id)))
    }

    /// First serializer the client advertises that this host speaks, else
    /// the host's own preference.
    fn select_serializer(&self, metadata: &Metadata) -> Result<Serializer, ClientError> {
        let advertised = metadata
            .get(keys::SERIALIZERS)
            .map(|value| parse_advertised(value))
            .unwrap_or_default();
        advertised
            .into_iter()
            .filter_map(Serializer::from_name)
            .find(|serializer| self.serializers.contains(serializer))
            .or_else(|| self.serializers.first().copied())
            .ok_or_else(|| ClientError::State("host has no serializer".to_string()))
    }

    fn scene_infos(&self, ctx: &RequestContext) -> Result<(), ClientError> {
        let request: SceneInfosRequest = ctx.read()?;
        let scene = self.hosted(&request.token)?;
        let serializer = self.select_serializer(&request.metadata)?;
        debug!(scene = scene.id(), %serializer, "serving scene infos");
        ctx.send_value(&SceneInfosDto {
            scene_id: scene.id.clone(),
            metadata: scene.metadata.clone(),
            routes: scene.descriptors(),
            selected_serializer: serializer.name().to_string(),
        })
    }

    fn connect_scene(&self, ctx: &RequestContext) -> Result<(), ClientError> {
        let msg: ConnectToSceneMsg = ctx.read()?;
        let scene = self.hosted(&msg.token)?;
        let route_mappings: HashMap<String, u16> = msg
            .routes
            .iter()
            .zip(0u16..)
            .map(|(route, index)| (route.name.clone(), index))
            .collect();

        let scene_handle = {
            let mut state = self.state();
            let scene_handle = u8::try_from(state.next_handle)
                .map_err(|_| ClientError::ResourceExhausted(state.sessions.len()))?;
            state.next_handle += 1;
            state.sessions.insert(
                scene_handle,
                Session {
                    scene_id: scene.id.clone(),
                    client_routes: route_mappings.clone(),
                },
            );
            state
                .mappings
                .insert(scene.id.clone(), route_mappings.clone());
            scene_handle
        };
        info!(scene = scene.id(), scene_handle, routes = route_mappings.len(), "client joined scene");
        ctx.send_value(&ConnectionResult {
            scene_handle,
            route_mappings,
        })
    }

    fn disconnect_scene(&self, ctx: &RequestContext) -> Result<(), ClientError> {
        let handle: u8 = ctx.read()?;
        let mut state = self.state();
        let session = state
            .sessions
            .remove(&handle)
            .ok_or_else(|| ClientError::Argument(format!("unknown scene handle {handle}")))?;
        state.disconnected.push(handle);
        info!(scene = %session.scene_id, handle, "client left scene");
        Ok(())
    }

    fn scene_traffic(&self, handle: u8, packet: &Packet) {
        let Ok((index, body)) = framing::split_prefix(&packet.payload) else {
            trace!(handle, "short scene packet dropped");
            return;
        };
        let echo_to = {
            let mut state = self.state();
            let Some(session) = state.sessions.get(&handle) else {
                trace!(handle, "traffic for unknown handle dropped");
                return;
            };
            let scene_id = session.scene_id.clone();
            let Some(route) = self
                .scenes
                .get(&scene_id)
                .and_then(|scene| scene.routes.get(usize::from(index)))
                .cloned()
            else {
                trace!(handle, index, "traffic for unknown host route dropped");
                return;
            };
            let echo_to = session.client_routes.get(&route).copied();
            state
                .received
                .entry(scene_id)
                .or_default()
                .push((route, body.to_vec()));
            echo_to
        };
        if let Some(client_index) = echo_to.filter(|_| self.echo) {
            let sent = self.connection.send_to_scene(
                handle,
                client_index,
                body,
                PacketPriority::default(),
                PacketReliability::default(),
                DEFAULT_CHANNEL,
            );
            if let Err(err) = sent {
                debug!(handle, %err, "echo failed");
            }
        }
    }
}

/// Claims scene traffic on the host side.
struct HostTraffic {
    host: Weak<HostInner>,
}

impl PacketProcessor for HostTraffic {
    fn name(&self) -> &'static str {
        "loopback_traffic"
    }

    fn dispatch(&self, tag: u8, packet: &mut Packet) -> bool {
        if !message_ids::is_scene_handle(tag) {
            return false;
        }
        if let Some(host) = self.host.upgrade() {
            host.scene_traffic(tag, packet);
        }
        true
    }
}

/// Builder for [`LoopbackHost`].
#[derive(Debug, Default)]
pub struct LoopbackHostBuilder {
    serializers: Vec<Serializer>,
    scenes: Vec<HostedScene>,
    echo: bool,
}

impl LoopbackHostBuilder {
    /// Serializers the host speaks, in preference order. Defaults to MsgPack.
    #[must_use]
    pub fn serializers(mut self, serializers: Vec<Serializer>) -> Self {
        self.serializers = serializers;
        self
    }

    /// Host a scene.
    #[must_use]
    pub fn scene(mut self, scene: HostedScene) -> Self {
        self.scenes.push(scene);
        self
    }

    /// Echo received traffic back on the client route of the same name.
    #[must_use]
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Open the host side of `connection` and start serving.
    ///
    /// # Errors
    ///
    /// Returns the failure to open the connection.
    pub async fn start(self, connection: Arc<dyn Connection>) -> Result<LoopbackHost, ClientError> {
        let serializers = if self.serializers.is_empty() {
            vec![Serializer::MsgPack]
        } else {
            self.serializers
        };
        let inner = Arc::new(HostInner {
            connection: Arc::clone(&connection),
            serializers,
            scenes: self
                .scenes
                .into_iter()
                .map(|scene| (scene.id.clone(), scene))
                .collect(),
            echo: self.echo,
            state: Mutex::new(HostState {
                next_handle: u16::from(message_ids::SCENES),
                sessions: HashMap::new(),
                mappings: HashMap::new(),
                received: HashMap::new(),
                disconnected: Vec::new(),
            }),
            chain: OnceLock::new(),
        });

        let requests = RequestProcessor::new(Arc::clone(&connection));
        let host = Arc::downgrade(&inner);
        requests.add_handler(
            message_ids::GET_SCENE_INFOS,
            serve(host.clone(), HostInner::scene_infos),
        )?;
        requests.add_handler(
            message_ids::CONNECT_TO_SCENE,
            serve(host.clone(), HostInner::connect_scene),
        )?;
        requests.add_handler(
            message_ids::DISCONNECT_FROM_SCENE,
            serve(host.clone(), HostInner::disconnect_scene),
        )?;
        requests.freeze();

        let chain = Arc::new(
            DispatchChain::new()
                .with(Arc::new(requests))
                .with(Arc::new(HostTraffic { host })),
        );
        DispatchChain::install(&chain, &connection);
        connection
            .open(LOOPBACK_ENDPOINT, ConnectionMetadata::default())
            .await?;
        let _ = inner.chain.set(chain);
        info!(scenes = inner.scenes.len(), echo = inner.echo, "loopback host started");
        Ok(LoopbackHost { inner })
    }
}

fn serve(
    host: Weak<HostInner>,
    action: fn(&HostInner, &RequestContext) -> Result<(), ClientError>,
) -> crate::request::SystemRequestHandler {
    system_handler(move |ctx| {
        let host = host.upgrade();
        async move {
            let host = host.ok_or_else(|| ClientError::State("host stopped".to_string()))?;
            action(&host, &ctx)
        }
    })
}

/// In-process host serving scenes over a memory connection. Clones share
/// the same host.
#[derive(Clone)]
pub struct LoopbackHost {
    inner: Arc<HostInner>,
}

impl LoopbackHost {
    /// Start configuring a host.
    #[must_use]
    pub fn builder() -> LoopbackHostBuilder {
        LoopbackHostBuilder::default()
    }

    /// Issue a join token for `scene_id` pointing at this host.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if the token cannot be encoded.
    pub fn issue_token(&self, scene_id: &str) -> Result<String, ClientError> {
        let data = TokenData::new(scene_id).with_endpoint(DEFAULT_TRANSPORT, LOOPBACK_ENDPOINT);
        Ok(encode_token(&data, LOOPBACK_SIGNATURE)?)
    }

    /// Route mappings handed out by the latest connect to `scene_id`.
    #[must_use]
    pub fn route_mappings(&self, scene_id: &str) -> HashMap<String, u16> {
        self.inner
            .state()
            .mappings
            .get(scene_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Scene traffic received for `scene_id`, as `(host route, payload)`.
    #[must_use]
    pub fn received(&self, scene_id: &str) -> Vec<(String, Vec<u8>)> {
        self.inner
            .state()
            .received
            .get(scene_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Handles released by disconnect requests, in order.
    #[must_use]
    pub fn disconnected(&self) -> Vec<u8> {
        self.inner.state().disconnected.clone()
    }

    /// Handles of the scenes clients are connected to.
    #[must_use]
    pub fn connected_handles(&self) -> Vec<u8> {
        let mut handles: Vec<u8> = self.inner.state().sessions.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Drop every session, as if the host restarted its scenes.
    pub fn forget_scenes(&self) {
        self.inner.state().sessions.clear();
    }
}

#[async_trait]
impl TokenProvider for LoopbackHost {
    async fn scene_token(&self, scene_id: &str, user_data: &[u8]) -> Result<String, ClientError> {
        debug!(scene = scene_id, len = user_data.len(), "issuing loopback token");
        self.issue_token(scene_id)
    }
}

impl fmt::Debug for LoopbackHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackHost")
            .field("scenes", &self.inner.scenes.len())
            .field("serializers", &self.inner.serializers)
            .field("echo", &self.inner.echo)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use scene_net::{MemoryConnection, MetadataBuilder, codec};
    use tokio::time::timeout;

    use super::*;

    async fn start(serializers: Vec<Serializer>) -> (LoopbackHost, Arc<RequestProcessor>, Arc<DispatchChain>) {
        let (client, host_conn) = MemoryConnection::pair();
        let host = LoopbackHost::builder()
            .serializers(serializers)
            .scene(HostedScene::new("lobby").with_route("chat").with_route("moves"))
            .start(host_conn)
            .await
            .unwrap();
        let client: Arc<dyn Connection> = client;
        let requests = Arc::new(RequestProcessor::new(Arc::clone(&client)));
        let processor: Arc<dyn PacketProcessor> = requests.clone();
        let chain = Arc::new(DispatchChain::new().with(processor));
        DispatchChain::install(&chain, &client);
        client
            .open("loopback", ConnectionMetadata::default())
            .await
            .unwrap();
        (host, requests, chain)
    }

    fn infos_request(host: &LoopbackHost, scene: &str, advertised: &str) -> SceneInfosRequest {
        SceneInfosRequest {
            token: host.issue_token(scene).unwrap(),
            metadata: MetadataBuilder::new()
                .set(keys::SERIALIZERS, advertised)
                .build()
                .to_map(),
        }
    }

    #[tokio::test]
    async fn test_issued_token_decodes() {
        let (host, _requests, _chain) = start(vec![Serializer::MsgPack]).await;
        let data = decode_token(&host.issue_token("lobby").unwrap()).unwrap();
        assert_eq!(data.scene_id, "lobby");
        assert_eq!(data.endpoint(DEFAULT_TRANSPORT), Some(LOOPBACK_ENDPOINT));
    }

    #[tokio::test]
    async fn test_scene_infos_lists_routes_in_order() {
        let (host, requests, _chain) = start(vec![Serializer::MsgPack]).await;
        let infos: SceneInfosDto = timeout(
            Duration::from_secs(1),
            requests.request(
                message_ids::GET_SCENE_INFOS,
                &infos_request(&host, "lobby", "MsgPack"),
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(infos.scene_id, "lobby");
        assert_eq!(infos.selected_serializer, "MsgPack");
        let routes: Vec<(String, u16)> = infos.routes.into_iter().map(|r| (r.name, r.handle)).collect();
        assert_eq!(routes, vec![("chat".to_string(), 0), ("moves".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_falls_back_to_own_serializer() {
        let (host, requests, _chain) = start(vec![Serializer::Json]).await;
        let infos: SceneInfosDto = requests
            .request(
                message_ids::GET_SCENE_INFOS,
                &infos_request(&host, "lobby", "MsgPack"),
            )
            .await
            .unwrap();
        assert_eq!(infos.selected_serializer, "Json");
    }

    #[tokio::test]
    async fn test_connect_assigns_handles_upward() {
        let (host, requests, _chain) = start(vec![Serializer::MsgPack]).await;
        let msg = ConnectToSceneMsg {
            token: host.issue_token("lobby").unwrap(),
            routes: vec![RouteDto {
                name: "chat".to_string(),
                handle: 0,
                metadata: Metadata::new(),
            }],
            connection_metadata: Metadata::new(),
        };
        let first: ConnectionResult = requests
            .request(message_ids::CONNECT_TO_SCENE, &msg)
            .await
            .unwrap();
        let second: ConnectionResult = requests
            .request(message_ids::CONNECT_TO_SCENE, &msg)
            .await
            .unwrap();
        assert_eq!(first.scene_handle, message_ids::SCENES);
        assert_eq!(second.scene_handle, message_ids::SCENES + 1);
        assert_eq!(first.route_mappings["chat"], 0);
        assert_eq!(host.connected_handles(), vec![141, 142]);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_handle_is_remote_fault() {
        let (_host, requests, _chain) = start(vec![Serializer::MsgPack]).await;
        let stream = requests
            .send_system_request(
                message_ids::DISCONNECT_FROM_SCENE,
                &codec::encode(&200u8).unwrap(),
            )
            .unwrap();
        let result = timeout(Duration::from_secs(1), stream.finish()).await.unwrap();
        assert!(matches!(result, Err(ClientError::RemoteFault(_))));
    }
}
