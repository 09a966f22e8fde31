//! The scene client.
//!
//! A [`Client`] owns one transport connection and every scene joined over
//! it. The connection is started lazily by the first [`Client::get_scene`]
//! call; concurrent callers share that single bootstrap.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use scene_net::connection::keys;
use scene_net::messages::{ConnectToSceneMsg, ConnectionResult, SceneInfosDto, SceneInfosRequest};
use scene_net::{
    Connection, MetadataBuilder, Serializer, SerializerRegistry, TokenData, codec, decode_token,
    message_ids,
};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatch::DispatchChain;
use crate::dispatcher::SceneDispatcher;
use crate::error::ClientError;
use crate::request::RequestProcessor;
use crate::scene::{Scene, SceneState};
use crate::token_provider::TokenProvider;

/// Smallest interval between two expiry sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct ClientInner {
    config: ClientConfig,
    connection: Arc<dyn Connection>,
    serializers: SerializerRegistry,
    token_provider: Option<Arc<dyn TokenProvider>>,
    requests: Arc<RequestProcessor>,
    scenes: Arc<SceneDispatcher>,
    /// Set once the connection is open; keeps the inbound chain alive.
    started: OnceCell<Arc<DispatchChain>>,
    negotiated: OnceLock<Serializer>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
    }
}

/// Entry point for joining scenes. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    connection: Option<Arc<dyn Connection>>,
    serializers: SerializerRegistry,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ClientBuilder {
    /// The transport the client runs on. Required.
    #[must_use]
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Serializers the client accepts for user data. Defaults to MsgPack.
    #[must_use]
    pub fn serializers(mut self, serializers: SerializerRegistry) -> Self {
        self.serializers = serializers;
        self
    }

    /// Where [`Client::get_public_scene`] obtains tokens.
    #[must_use]
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Build the client. Nothing is sent until the first scene is requested.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] if no connection was given or the
    /// serializer registry is empty.
    pub fn build(self) -> Result<Client, ClientError> {
        let connection = self
            .connection
            .ok_or_else(|| ClientError::Argument("a connection is required".to_string()))?;
        if self.serializers.is_empty() {
            return Err(ClientError::Argument(
                "at least one serializer must be registered".to_string(),
            ));
        }
        let requests = Arc::new(RequestProcessor::new(Arc::clone(&connection)));
        requests.freeze();
        Ok(Client {
            inner: Arc::new(ClientInner {
                config: self.config,
                connection,
                serializers: self.serializers,
                token_provider: self.token_provider,
                requests,
                scenes: Arc::new(SceneDispatcher::new()),
                started: OnceCell::new(),
                negotiated: OnceLock::new(),
                closed: AtomicBool::new(false),
                sweeper: Mutex::new(None),
            }),
        })
    }
}

impl Client {
    /// Start building a client for `config`.
    #[must_use]
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            connection: None,
            serializers: SerializerRegistry::default(),
            token_provider: None,
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The underlying transport.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.inner.connection
    }

    /// The system request processor of this connection.
    #[must_use]
    pub fn requests(&self) -> &Arc<RequestProcessor> {
        &self.inner.requests
    }

    /// Every scene currently connected.
    #[must_use]
    pub fn scenes(&self) -> Vec<Scene> {
        self.inner.scenes.scenes()
    }

    /// The serializer negotiated on this connection, once a scene was
    /// acquired.
    #[must_use]
    pub fn negotiated_serializer(&self) -> Option<Serializer> {
        self.inner.negotiated.get().copied()
    }

    /// Returns `true` once [`Client::disconnect`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::State("client is disconnected".to_string()));
        }
        Ok(())
    }

    /// Fetch a scene's description and build a [`Scene`] in `Created`
    /// state. Starts the connection on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] after disconnect,
    /// [`ClientError::Protocol`] for a malformed token or an unacceptable
    /// serializer choice, or the failure of the scene info request.
    pub async fn get_scene(&self, token: &str) -> Result<Scene, ClientError> {
        self.ensure_open()?;
        let data = decode_token(token)?;
        self.start(&data).await?;

        let request = SceneInfosRequest {
            token: token.to_string(),
            metadata: self.inner.connection.metadata().to_map(),
        };
        let mut infos: SceneInfosDto = self
            .inner
            .requests
            .request(message_ids::GET_SCENE_INFOS, &request)
            .await?;
        let serializer = self.negotiate(&infos.selected_serializer)?;
        if infos.scene_id.is_empty() {
            infos.scene_id = data.scene_id;
        }

        let scene = Scene::new(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.connection),
            token.to_string(),
            infos,
            serializer,
        );
        info!(
            scene = scene.id(),
            %serializer,
            routes = scene.remote_routes().count(),
            "scene acquired"
        );
        Ok(scene)
    }

    /// Obtain a token for `scene_id` from the configured provider, then
    /// [`Client::get_scene`] with it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] if no token provider is configured,
    /// plus any failure of the provider or of `get_scene`.
    pub async fn get_public_scene<T: Serialize + ?Sized>(
        &self,
        scene_id: &str,
        user_data: &T,
    ) -> Result<Scene, ClientError> {
        self.ensure_open()?;
        let provider = self
            .inner
            .token_provider
            .as_ref()
            .ok_or_else(|| ClientError::State("no token provider configured".to_string()))?;
        let user_data = codec::encode(user_data)?;
        let token = provider.scene_token(scene_id, &user_data).await?;
        self.get_scene(&token).await
    }

    /// Send the connect request for a scene in `Connecting` state, apply the
    /// host's handle and route mappings, and register the scene for
    /// inbound traffic. Called by [`Scene::connect`].
    ///
    /// The answer is applied on the receive path, so traffic the host sends
    /// right after accepting the scene already reaches its routes.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] if the client is disconnected or the
    /// scene is not connecting, [`ClientError::Protocol`] for an invalid
    /// handle or a local route missing from the mappings, or the request
    /// failure.
    pub async fn connect_to_scene(&self, scene: &Scene) -> Result<(), ClientError> {
        self.ensure_open()?;
        if scene.state() != SceneState::Connecting {
            return Err(ClientError::State(format!(
                "scene {} is not connecting",
                scene.id()
            )));
        }
        let msg = ConnectToSceneMsg {
            token: scene.token().to_string(),
            routes: scene.local_descriptors(),
            connection_metadata: self.inner.connection.metadata().to_map(),
        };
        debug!(scene = scene.id(), routes = msg.routes.len(), "connecting scene");
        let client = Arc::downgrade(&self.inner);
        let target = scene.clone();
        let stream = self.inner.requests.send_system_request_with_hook(
            message_ids::CONNECT_TO_SCENE,
            &codec::encode(&msg)?,
            Box::new(move |value: &[u8]| {
                let result: ConnectionResult = codec::decode(value)?;
                let inner = client
                    .upgrade()
                    .ok_or_else(|| ClientError::State("client was dropped".to_string()))?;
                Client::from_inner(inner).apply_connection(&target, &result)
            }),
        )?;
        if let Err(err) = stream.single().await {
            // The answer may have been applied before the exchange failed.
            if let Some(handle) = scene.handle() {
                self.inner.scenes.release(handle, scene);
            }
            return Err(err);
        }
        Ok(())
    }

    fn apply_connection(&self, scene: &Scene, result: &ConnectionResult) -> Result<(), ClientError> {
        self.ensure_open()?;
        let handle = result.scene_handle;
        if !message_ids::is_scene_handle(handle) {
            return Err(ClientError::Protocol(format!(
                "host assigned {handle} which is not a scene handle"
            )));
        }
        scene.complete_connect(handle, &result.route_mappings)?;
        if let Err(err) = self.inner.scenes.add_scene(scene) {
            scene.revert_connect();
            return Err(err);
        }
        if self.is_closed() {
            // Client::disconnect ran while the scene was being registered.
            self.inner.scenes.release(handle, scene);
            scene.mark_disconnected();
            return Err(ClientError::State("client is disconnected".to_string()));
        }
        Ok(())
    }

    /// Tell the host to drop `scene` and stop routing its traffic. The scene
    /// is unregistered whatever the host answers. Called by
    /// [`Scene::disconnect`].
    ///
    /// # Errors
    ///
    /// Returns the failure of the disconnect request.
    pub async fn disconnect_scene(&self, scene: &Scene, handle: u8) -> Result<(), ClientError> {
        if let Err(err) = self.inner.scenes.remove_scene(handle) {
            warn!(scene = scene.id(), handle, %err, "scene was not registered");
        }
        let stream = codec::encode(&handle).map_err(ClientError::from).and_then(|body| {
            self.inner
                .requests
                .send_system_request(message_ids::DISCONNECT_FROM_SCENE, &body)
        })?;
        stream.finish().await
    }

    /// Close the client. Every connected scene becomes `Disconnected`, every
    /// pending request fails with [`ClientError::Transport`], and the
    /// connection is closed. Later calls are no-ops.
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }
        let scenes = self.inner.scenes.clear();
        for scene in &scenes {
            scene.mark_disconnected();
        }
        self.inner
            .requests
            .fail_all(&ClientError::Transport("client disconnected".to_string()));
        self.inner.connection.close();
        info!(scenes = scenes.len(), "client disconnected");
    }

    /// Open the connection once; concurrent callers wait for the same
    /// attempt. A failed attempt is retried by the next caller.
    async fn start(&self, token: &TokenData) -> Result<(), ClientError> {
        self.inner
            .started
            .get_or_try_init(|| self.open_connection(token))
            .await?;
        Ok(())
    }

    async fn open_connection(&self, token: &TokenData) -> Result<Arc<DispatchChain>, ClientError> {
        let config = &self.inner.config;
        let endpoint = token.endpoint(&config.transport).ok_or_else(|| {
            ClientError::Protocol(format!(
                "token for scene {} has no {} endpoint",
                token.scene_id, config.transport
            ))
        })?;
        let metadata = MetadataBuilder::new()
            .set(keys::SERIALIZERS, self.inner.serializers.advertised())
            .set(keys::TRANSPORT, config.transport.as_str())
            .set(keys::PROTOCOL, config.protocol_version.as_str())
            .set(keys::PLATFORM, config.platform.as_str())
            .extend(config.metadata.clone())
            .extend(token.connection_metadata.clone())
            .build();

        let requests: Arc<dyn crate::dispatch::PacketProcessor> = self.inner.requests.clone();
        let scenes: Arc<dyn crate::dispatch::PacketProcessor> = self.inner.scenes.clone();
        let chain = Arc::new(DispatchChain::new().with(requests).with(scenes));
        DispatchChain::install(&chain, &self.inner.connection);
        self.inner.connection.open(endpoint, metadata).await?;
        info!(endpoint, transport = %config.transport, "connection started");

        if let Some(timeout) = config.request_timeout {
            let sweeper = spawn_sweeper(Arc::downgrade(&self.inner.requests), timeout);
            *self
                .inner
                .sweeper
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
        }
        Ok(chain)
    }

    fn negotiate(&self, selected: &str) -> Result<Serializer, ClientError> {
        let serializer = self.inner.serializers.get(selected).ok_or_else(|| {
            ClientError::Protocol(format!(
                "host selected serializer {selected:?} which is not registered"
            ))
        })?;
        let negotiated = *self.inner.negotiated.get_or_init(|| serializer);
        if negotiated != serializer {
            return Err(ClientError::Protocol(format!(
                "host selected {serializer} but {negotiated} was already negotiated"
            )));
        }
        Ok(serializer)
    }
}

fn spawn_sweeper(requests: Weak<RequestProcessor>, timeout: Duration) -> JoinHandle<()> {
    let period = (timeout / 2).max(MIN_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(requests) = requests.upgrade() else {
                break;
            };
            let expired = requests.expire_older_than(timeout);
            if expired > 0 {
                debug!(expired, "expired stale system requests");
            }
        }
    })
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("account", &self.inner.config.account)
            .field("application", &self.inner.config.application)
            .field("started", &self.inner.started.initialized())
            .field("closed", &self.is_closed())
            .field("negotiated", &self.negotiated_serializer())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use scene_net::{
        ConnectionMetadata, MemoryConnection, Metadata, PacketPriority, PacketReliability, framing,
    };
    use tokio::time::timeout;

    use super::*;
    use crate::loopback::{HostedScene, LoopbackHost};
    use crate::packet::Packet;
    use crate::route::PacketHandler;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        client: Client,
        host: LoopbackHost,
        client_conn: Arc<MemoryConnection>,
    }

    fn harness_with(host: LoopbackHost, client_conn: Arc<MemoryConnection>, registry: SerializerRegistry) -> Harness {
        let client = Client::builder(ClientConfig::new("acme", "arena"))
            .connection(client_conn.clone())
            .serializers(registry)
            .token_provider(Arc::new(host.clone()))
            .build()
            .unwrap();
        Harness {
            client,
            host,
            client_conn,
        }
    }

    async fn harness(registry: SerializerRegistry, host_serializers: &[Serializer]) -> Harness {
        let (client_conn, host_conn) = MemoryConnection::pair();
        let host = LoopbackHost::builder()
            .serializers(host_serializers.to_vec())
            .scene(
                HostedScene::new("lobby")
                    .with_metadata("mode", "duel")
                    .with_route("chat")
                    .with_route("moves"),
            )
            .scene(HostedScene::new("arena").with_route("chat"))
            .echo(true)
            .start(host_conn)
            .await
            .unwrap();
        harness_with(host, client_conn, registry)
    }

    fn recorder(log: &Arc<StdMutex<Vec<Vec<u8>>>>) -> PacketHandler {
        let log = Arc::clone(log);
        Arc::new(move |packet: &Packet| log.lock().unwrap().push(packet.payload.clone()))
    }

    async fn wait_for(log: &Arc<StdMutex<Vec<Vec<u8>>>>, count: usize) {
        timeout(WAIT, async {
            while log.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn memory_token(scene_id: &str) -> String {
        scene_net::token::encode_token(
            &TokenData::new(scene_id).with_endpoint("memory", "loopback"),
            "sig",
        )
        .unwrap()
    }

    fn reply<T: Serialize>(conn: &MemoryConnection, id: u16, value: &T) {
        let body = codec::encode(value).unwrap();
        conn.send_system(message_ids::REQUEST_RESPONSE_MSG, framing::prefix(id, &body))
            .unwrap();
        conn.send_system(message_ids::REQUEST_RESPONSE_COMPLETE, framing::prefix(id, &[]))
            .unwrap();
    }

    /// A bare host that answers every connect with `handle`, mapping routes
    /// in submission order, and optionally greets on route 0 straight after.
    async fn scripted_host(conn: Arc<MemoryConnection>, handle: u8, greeting: Option<&'static [u8]>) {
        let weak = Arc::downgrade(&conn);
        conn.set_inbound_handler(Arc::new(move |tag: u8, payload: Vec<u8>| {
            let Some(conn) = weak.upgrade() else {
                return;
            };
            let (id, body) = framing::split_prefix(&payload).unwrap();
            match tag {
                message_ids::GET_SCENE_INFOS => {
                    let request: SceneInfosRequest = codec::decode(body).unwrap();
                    let infos = SceneInfosDto {
                        scene_id: decode_token(&request.token).unwrap().scene_id,
                        metadata: Metadata::new(),
                        routes: Vec::new(),
                        selected_serializer: Serializer::MsgPack.name().to_string(),
                    };
                    reply(&conn, id, &infos);
                }
                message_ids::CONNECT_TO_SCENE => {
                    let msg: ConnectToSceneMsg = codec::decode(body).unwrap();
                    let route_mappings = msg
                        .routes
                        .iter()
                        .zip(0u16..)
                        .map(|(route, index)| (route.name.clone(), index))
                        .collect();
                    reply(&conn, id, &ConnectionResult {
                        scene_handle: handle,
                        route_mappings,
                    });
                    if let Some(greeting) = greeting {
                        conn.send_to_scene(
                            handle,
                            0,
                            greeting,
                            PacketPriority::default(),
                            PacketReliability::default(),
                            0,
                        )
                        .unwrap();
                    }
                }
                _ => {}
            }
        }));
        conn.open("loopback", ConnectionMetadata::default())
            .await
            .unwrap();
    }

    fn plain_client(conn: Arc<MemoryConnection>) -> Client {
        Client::builder(ClientConfig::new("acme", "arena"))
            .connection(conn)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_connection() {
        let result = Client::builder(ClientConfig::new("acme", "arena")).build();
        assert!(matches!(result, Err(ClientError::Argument(_))));
    }

    #[test]
    fn test_builder_rejects_empty_registry() {
        let (conn, _peer) = MemoryConnection::pair();
        let result = Client::builder(ClientConfig::new("acme", "arena"))
            .connection(conn)
            .serializers(SerializerRegistry::empty())
            .build();
        assert!(matches!(result, Err(ClientError::Argument(_))));
    }

    #[tokio::test]
    async fn test_get_scene_with_msgpack() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let token = h.host.issue_token("lobby").unwrap();
        let scene = timeout(WAIT, h.client.get_scene(&token)).await.unwrap().unwrap();

        assert_eq!(scene.id(), "lobby");
        assert_eq!(scene.state(), SceneState::Created);
        assert_eq!(scene.serializer(), Serializer::MsgPack);
        assert_eq!(scene.host_metadata("mode"), Some("duel"));
        assert_eq!(scene.remote_route("moves").and_then(|r| r.index()), Some(1));
        assert_eq!(h.client.negotiated_serializer(), Some(Serializer::MsgPack));

        let advertised = h.client_conn.metadata();
        assert_eq!(advertised.get(keys::SERIALIZERS), Some("MsgPack"));
        assert_eq!(advertised.get(keys::TRANSPORT), Some("memory"));
        assert!(advertised.get(keys::PLATFORM).is_some());
        assert_eq!(h.client.requests().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_serializer_is_protocol_error() {
        let h = harness(SerializerRegistry::default(), &[Serializer::Json]).await;
        let token = h.host.issue_token("lobby").unwrap();
        let result = timeout(WAIT, h.client.get_scene(&token)).await.unwrap();
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert_eq!(h.client.negotiated_serializer(), None);
    }

    #[tokio::test]
    async fn test_host_picks_first_advertised_serializer() {
        let registry = SerializerRegistry::empty()
            .with(Serializer::Json)
            .with(Serializer::MsgPack);
        let h = harness(registry, &[Serializer::MsgPack, Serializer::Json]).await;
        let token = h.host.issue_token("lobby").unwrap();
        let scene = h.client.get_scene(&token).await.unwrap();
        assert_eq!(scene.serializer(), Serializer::Json);
    }

    #[tokio::test]
    async fn test_unknown_scene_is_remote_fault() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let token = h.host.issue_token("nowhere").unwrap();
        let result = timeout(WAIT, h.client.get_scene(&token)).await.unwrap();
        assert!(matches!(result, Err(ClientError::RemoteFault(_))));
    }

    #[tokio::test]
    async fn test_malformed_token_is_protocol_error() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let result = h.client.get_scene("%%%-sig").await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert_eq!(h.client_conn.open_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_get_scene_opens_once() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let lobby = h.host.issue_token("lobby").unwrap();
        let arena = h.host.issue_token("arena").unwrap();
        let (a, b) = tokio::join!(h.client.get_scene(&lobby), h.client.get_scene(&arena));
        assert_eq!(a.unwrap().id(), "lobby");
        assert_eq!(b.unwrap().id(), "arena");
        assert_eq!(h.client_conn.open_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_maps_every_local_route() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let token = h.host.issue_token("lobby").unwrap();
        let scene = h.client.get_scene(&token).await.unwrap();
        let names = ["alpha", "beta", "chat", "delta", "moves"];
        for name in names {
            let _sub = scene
                .add_route(name, Arc::new(|_: &Packet| {}), Metadata::new())
                .unwrap();
        }
        timeout(WAIT, scene.connect()).await.unwrap().unwrap();
        assert_eq!(scene.state(), SceneState::Connected);

        let assigned = h.host.route_mappings("lobby");
        assert_eq!(assigned.len(), names.len());
        for name in names {
            assert_eq!(scene.local_route(name).unwrap().index(), assigned.get(name).copied());
        }
        assert_eq!(h.client.scenes().len(), 1);
        assert!(matches!(
            scene.add_route("late", Arc::new(|_: &Packet| {}), Metadata::new()),
            Err(ClientError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_round_trip_over_echo() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let token = h.host.issue_token("lobby").unwrap();
        let scene = h.client.get_scene(&token).await.unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let _sub = scene.add_route("chat", recorder(&log), Metadata::new()).unwrap();
        scene.connect().await.unwrap();

        scene.send("chat", "hello").unwrap();
        scene
            .send_packet("moves", &[1, 2, 3], PacketPriority::High, PacketReliability::Unreliable)
            .unwrap();
        wait_for(&log, 1).await;

        let received: String = scene.serializer().deserialize(&log.lock().unwrap()[0]).unwrap();
        assert_eq!(received, "hello");
        let traffic = h.host.received("lobby");
        assert_eq!(traffic.len(), 2);
        assert_eq!(traffic[1], ("moves".to_string(), vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_traffic_sent_right_after_connect_is_delivered() {
        let (client_conn, host_conn) = MemoryConnection::pair();
        scripted_host(host_conn, 141, Some(b"welcome")).await;
        let client = plain_client(client_conn);
        let scene = client.get_scene(&memory_token("lobby")).await.unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let _sub = scene.add_route("chat", recorder(&log), Metadata::new()).unwrap();

        timeout(WAIT, scene.connect()).await.unwrap().unwrap();
        wait_for(&log, 1).await;
        assert_eq!(log.lock().unwrap()[0], b"welcome".to_vec());
        assert_eq!(scene.handle(), Some(141));
    }

    #[tokio::test]
    async fn test_reused_handle_fails_second_connect() {
        let (client_conn, host_conn) = MemoryConnection::pair();
        scripted_host(host_conn, 141, None).await;
        let client = plain_client(client_conn);
        let first = client.get_scene(&memory_token("lobby")).await.unwrap();
        let second = client.get_scene(&memory_token("arena")).await.unwrap();
        first.connect().await.unwrap();

        let result = timeout(WAIT, second.connect()).await.unwrap();
        assert!(matches!(result, Err(ClientError::Protocol(_))));
        assert_eq!(second.state(), SceneState::Created);
        assert_eq!(second.handle(), None);
        assert_eq!(first.state(), SceneState::Connected);
        assert_eq!(first.handle(), Some(141));
        let registered = client.scenes();
        assert_eq!(registered.len(), 1);
        assert!(registered[0].same_scene(&first));
        assert_eq!(client.requests().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_answer_after_client_disconnect_is_ignored() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let scene = h.client.get_scene(&h.host.issue_token("lobby").unwrap()).await.unwrap();
        scene.begin_connect().unwrap();
        h.client.disconnect();

        let answer = ConnectionResult {
            scene_handle: 141,
            route_mappings: HashMap::new(),
        };
        assert!(matches!(
            h.client.apply_connection(&scene, &answer),
            Err(ClientError::State(_))
        ));
        assert!(h.client.scenes().is_empty());
        assert_eq!(scene.handle(), None);
    }

    #[tokio::test]
    async fn test_two_scenes_are_isolated() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let lobby = h.client.get_scene(&h.host.issue_token("lobby").unwrap()).await.unwrap();
        let arena = h.client.get_scene(&h.host.issue_token("arena").unwrap()).await.unwrap();
        let lobby_log = Arc::new(StdMutex::new(Vec::new()));
        let arena_log = Arc::new(StdMutex::new(Vec::new()));
        let _a = lobby.add_route("chat", recorder(&lobby_log), Metadata::new()).unwrap();
        let _b = arena.add_route("chat", recorder(&arena_log), Metadata::new()).unwrap();
        lobby.connect().await.unwrap();
        arena.connect().await.unwrap();
        assert_ne!(lobby.handle(), arena.handle());

        lobby.send("chat", &1u8).unwrap();
        wait_for(&lobby_log, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(arena_log.lock().unwrap().is_empty());

        arena.send("chat", &2u8).unwrap();
        wait_for(&arena_log, 1).await;
        assert_eq!(lobby_log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scene_disconnect_unregisters() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let scene = h.client.get_scene(&h.host.issue_token("lobby").unwrap()).await.unwrap();
        scene.connect().await.unwrap();
        let handle = scene.handle().unwrap();
        timeout(WAIT, scene.disconnect()).await.unwrap().unwrap();
        assert_eq!(scene.state(), SceneState::Disconnected);
        assert!(h.client.scenes().is_empty());
        assert_eq!(h.host.disconnected(), vec![handle]);
        assert!(matches!(
            scene.send("chat", &0u8),
            Err(ClientError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_scene_disconnect_unregisters_when_host_errors() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let scene = h.client.get_scene(&h.host.issue_token("lobby").unwrap()).await.unwrap();
        scene.connect().await.unwrap();
        h.host.forget_scenes();
        let result = timeout(WAIT, scene.disconnect()).await.unwrap();
        assert!(matches!(result, Err(ClientError::RemoteFault(_))));
        assert!(h.client.scenes().is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_is_terminal() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let token = h.host.issue_token("lobby").unwrap();
        let scene = h.client.get_scene(&token).await.unwrap();
        scene.connect().await.unwrap();
        let pending = h
            .client
            .requests()
            .reserve_request_slot(message_ids::GET_SCENE_INFOS)
            .unwrap();

        h.client.disconnect();
        assert!(h.client.is_closed());
        assert_eq!(scene.state(), SceneState::Disconnected);
        assert!(matches!(pending.single().await, Err(ClientError::Transport(_))));
        assert!(matches!(
            h.client.get_scene(&token).await,
            Err(ClientError::State(_))
        ));
        assert!(!h.client_conn.is_open());
        h.client.disconnect();
    }

    #[tokio::test]
    async fn test_request_timeout_expires_unanswered_requests() {
        let (client_conn, _host_conn) = MemoryConnection::pair();
        let client = Client::builder(
            ClientConfig::new("acme", "arena").with_request_timeout(Duration::from_millis(50)),
        )
        .connection(client_conn.clone())
        .build()
        .unwrap();
        let token = scene_net::token::encode_token(
            &TokenData::new("lobby").with_endpoint("memory", "loopback"),
            "sig",
        )
        .unwrap();
        // Nobody serves the host side, so the scene info request never
        // completes on its own.
        let result = timeout(WAIT, client.get_scene(&token)).await.unwrap();
        assert!(matches!(result, Err(ClientError::Timeout(0))));
        assert_eq!(client.requests().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_get_public_scene_uses_provider() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let scene = h
            .client
            .get_public_scene("arena", &HashMap::from([("name", "ada")]))
            .await
            .unwrap();
        assert_eq!(scene.id(), "arena");
    }

    #[tokio::test]
    async fn test_get_public_scene_without_provider() {
        let (conn, _peer) = MemoryConnection::pair();
        let client = Client::builder(ClientConfig::new("acme", "arena"))
            .connection(conn)
            .build()
            .unwrap();
        assert!(matches!(
            client.get_public_scene("arena", &()).await,
            Err(ClientError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_token_without_endpoint_for_transport() {
        let h = harness(SerializerRegistry::default(), &[Serializer::MsgPack]).await;
        let token = scene_net::token::encode_token(
            &TokenData::new("lobby").with_endpoint("udp", "10.0.0.1:9000"),
            "sig",
        )
        .unwrap();
        assert!(matches!(
            h.client.get_scene(&token).await,
            Err(ClientError::Protocol(_))
        ));
        assert_eq!(h.client_conn.open_count(), 0);
    }
}
