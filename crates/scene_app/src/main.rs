//! # scene_app: loopback session
//!
//! Runs a client and an in-process host over a memory connection, joins one
//! scene, sends a handful of packets on a route and waits for the host to
//! echo them back.
//!
//! ```text
//! RUST_LOG=scene_client=debug scene_app --scene lobby --route chat --count 5
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scene_client::{Client, ClientConfig, HostedScene, LoopbackHost, Packet};
use scene_net::{MemoryConnection, Metadata, Serializer, SerializerRegistry};

#[derive(Parser)]
#[command(name = "scene_app", about = "Join a loopback scene and echo packets")]
struct Args {
    /// Scene to join
    #[arg(short, long, default_value = "lobby")]
    scene: String,

    /// Route to send on
    #[arg(short, long, default_value = "chat")]
    route: String,

    /// Number of packets to send
    #[arg(short, long, default_value_t = 3)]
    count: u32,

    /// Serializer for user data (MsgPack or Json)
    #[arg(long, default_value = "MsgPack")]
    serializer: String,

    /// Seconds to wait for each echo
    #[arg(long, default_value_t = 2)]
    timeout: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    seq: u32,
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("scene_app=info".parse()?))
        .init();

    let args = Args::parse();
    let serializer = Serializer::from_name(&args.serializer)
        .with_context(|| format!("unknown serializer {:?}", args.serializer))?;

    let (client_side, host_side) = MemoryConnection::pair();
    let host = LoopbackHost::builder()
        .serializers(vec![serializer])
        .scene(
            HostedScene::new(&args.scene)
                .with_metadata("motd", "welcome")
                .with_route(&args.route),
        )
        .echo(true)
        .start(host_side.clone())
        .await?;

    let client = Client::builder(ClientConfig::new("demo", "scene_app"))
        .connection(client_side.clone())
        .serializers(SerializerRegistry::empty().with(serializer))
        .token_provider(Arc::new(host.clone()))
        .build()?;

    let scene = client.get_public_scene(&args.scene, &()).await?;
    info!(
        scene = scene.id(),
        motd = scene.host_metadata("motd").unwrap_or_default(),
        serializer = %scene.serializer(),
        "scene acquired"
    );

    let (echo_tx, mut echoes) = mpsc::unbounded_channel();
    let _echo = scene.add_route(
        &args.route,
        Arc::new(move |packet: &Packet| {
            let _ = echo_tx.send(packet.read::<Greeting>());
        }),
        Metadata::new(),
    )?;
    scene.connect().await?;
    info!(handle = scene.handle(), route = %args.route, "scene connected");

    let wait = Duration::from_secs(args.timeout);
    for seq in 0..args.count {
        let greeting = Greeting {
            seq,
            text: format!("hello #{seq}"),
        };
        scene.send(&args.route, &greeting)?;
        let Ok(Some(echo)) = tokio::time::timeout(wait, echoes.recv()).await else {
            bail!("no echo for packet {seq} within {wait:?}");
        };
        let echo = echo?;
        info!(seq = echo.seq, text = %echo.text, "echo received");
    }

    scene.disconnect().await?;
    client.disconnect();
    info!(
        sent = args.count,
        received = host.received(&args.scene).len(),
        opens = client_side.open_count(),
        "session finished"
    );
    Ok(())
}
