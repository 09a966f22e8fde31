//! # scene_client
//!
//! Client side of the scene protocol: joining scenes over a single
//! transport connection and exchanging route-addressed packets with the
//! host.
//!
//! This crate provides:
//!
//! - [`client`]: connection bootstrap, scene acquisition and teardown.
//! - [`scene`]: the connect handshake and per-scene route tables.
//! - [`route`]: named routes and their handler chains.
//! - [`request`]: system request/response correlation, both roles.
//! - [`dispatch`] / [`dispatcher`]: the inbound processor chain and the
//!   handle → scene table.
//! - [`components`]: typed per-scene singletons.
//! - [`token_provider`]: token sources for public scenes.
//! - [`loopback`]: an in-process host for tests and demos.
//! - [`config`] / [`error`]: configuration and error types.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scene_client::{Client, ClientConfig, HostedScene, LoopbackHost};
//! use scene_net::{Metadata, MemoryConnection};
//!
//! # async fn run() -> Result<(), scene_client::ClientError> {
//! let (client_side, host_side) = MemoryConnection::pair();
//! let host = LoopbackHost::builder()
//!     .scene(HostedScene::new("lobby").with_route("chat"))
//!     .echo(true)
//!     .start(host_side)
//!     .await?;
//!
//! let client = Client::builder(ClientConfig::new("acme", "arena"))
//!     .connection(client_side)
//!     .build()?;
//! let scene = client.get_scene(&host.issue_token("lobby")?).await?;
//! let _chat = scene.add_route("chat", Arc::new(|_packet: &scene_client::Packet| {}), Metadata::new())?;
//! scene.connect().await?;
//! scene.send("chat", "hello")?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod components;
pub mod config;
pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod loopback;
pub mod packet;
pub mod request;
pub mod route;
pub mod scene;
pub mod token_provider;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use dispatch::{DispatchChain, PacketProcessor};
pub use dispatcher::SceneDispatcher;
pub use error::ClientError;
pub use loopback::{HostedScene, LoopbackHost};
pub use packet::{Packet, PacketMetadata};
pub use request::{
    FirstValueHook, MAX_PENDING_REQUESTS, RequestContext, RequestProcessor, RequestStream,
    SystemRequestHandler, system_handler,
};
pub use route::{HandlerChain, PacketHandler, Route, Subscription};
pub use scene::{Scene, SceneState};
pub use token_provider::{HttpTokenProvider, TokenProvider};
