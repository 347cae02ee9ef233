//! A minimal launcher for a Ganymede cluster.
//!
//! Runs one of three roles, selected via `--mode`:
//! * `registry`: the membership registry, serving its HTTP surface.
//! * `server`: a cache node with a small built-in demo origin, heartbeating to the
//!   registry.
//! * `client`: a one-shot client which resolves the owning node for a key via the
//!   registry and performs an Insert, Delete or Search.
use std::panic::{set_hook, take_hook};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;

use ganymede::builder::Builder;
use ganymede::client::Client;
use ganymede::config::Config;
use ganymede::group::{loader_fn, Group};
use ganymede::idgen::generate_peer_id;
use ganymede::platform::Platform;
use ganymede::protocol::HandshakeOption;
use ganymede::registry::{
    default_heartbeat_period, fetch_servers, notify_shutdown, start_heartbeat, Registry,
};
use ganymede::ring::{Ring, DEFAULT_REPLICAS};
use ganymede::server::RpcServer;

/// The static demo origin served by `--mode server`.
const DEMO_DB: &[(&str, &str)] = &[("Tom", "630"), ("ngs", "567")];

struct Arguments {
    mode: String,
    addr: Option<String>,
    registry: String,
    operation: String,
    key: String,
    value: String,
}

fn parse_arguments() -> Arguments {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Arguments {
        mode: String::new(),
        addr: None,
        registry: "http://127.0.0.1:9999/_geerpc_/registry".to_owned(),
        operation: "Search".to_owned(),
        key: String::new(),
        value: String::new(),
    };

    let mut i = 1;
    while i + 1 < args.len() {
        match args[i].as_str() {
            "--mode" => parsed.mode = args[i + 1].clone(),
            "--addr" => parsed.addr = Some(args[i + 1].clone()),
            "--registry" => parsed.registry = args[i + 1].clone(),
            "--operation" => parsed.operation = args[i + 1].clone(),
            "--key" => parsed.key = args[i + 1].clone(),
            "--value" => parsed.value = args[i + 1].clone(),
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    parsed
}

fn usage() -> ! {
    eprintln!("Usage: ganymede-io --mode registry [--addr 0.0.0.0:9999]");
    eprintln!("       ganymede-io --mode server [--addr 127.0.0.1:9010] [--registry <url>]");
    eprintln!(
        "       ganymede-io --mode client --operation {{Insert|Delete|Search}} \
         --key <key> [--value <value>] [--registry <url>]"
    );
    std::process::exit(1);
}

async fn wait_for_termination(platform: &Arc<Platform>) {
    while platform.is_running() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn run_registry(addr: &str) -> anyhow::Result<()> {
    let platform = Builder::new().enable_all().build().await;
    let settings = platform.require::<Config>().registry();

    let registry = Registry::with_settings(&settings.path, settings.ttl, settings.reap_interval);
    registry.start_reaper(&platform);

    tokio::select! {
        result = registry.serve(addr) => result,
        _ = wait_for_termination(&platform) => Ok(()),
    }
}

async fn run_server(addr: Option<String>, registry_url: &str) -> anyhow::Result<()> {
    let platform = Builder::new().enable_all().build().await;

    // An explicit --addr wins over whatever the settings file says...
    if let Some(addr) = addr {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("--addr must be of the form host:port"))?;
        platform.register::<Config>(Arc::new(Config::from_string(&format!(
            "server:\n    host: {}\n    port: {}\n",
            host, port
        ))?));
    }

    let config = platform.require::<Config>();
    let cache = config.cache();
    let group = Group::install(
        &cache.group,
        cache.max_memory,
        loader_fn(|key: String| async move {
            log::info!("[SlowDB] search key {}", key);
            DEMO_DB
                .iter()
                .find(|(entry_key, _)| *entry_key == key)
                .map(|(_, value)| Bytes::from_static(value.as_bytes()))
                .ok_or_else(|| anyhow!("{} not exist", key))
        }),
    );

    let server = RpcServer::install(&platform, group);
    RpcServer::fork_and_await(&server).await;
    let bound = server
        .current_address()
        .ok_or_else(|| anyhow!("the server socket never came up"))?;

    let peer = format!("tcp@{}", bound);
    if let Some((ip, port)) = bound.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            log::info!("This node identifies as {}", generate_peer_id(ip, port));
        }
    }

    start_heartbeat(
        &platform,
        registry_url.to_owned(),
        peer.clone(),
        default_heartbeat_period(config.registry().ttl),
    );

    wait_for_termination(&platform).await;

    // Best effort: a registry which is already gone must not fail the shutdown.
    if let Err(error) = notify_shutdown(registry_url, &peer).await {
        log::warn!("Failed to deregister {}: {}", peer, error);
    }
    Ok(())
}

async fn run_client(
    registry_url: &str,
    operation: &str,
    key: String,
    value: String,
) -> anyhow::Result<()> {
    if key.is_empty() {
        bail!("--key is required for client mode");
    }

    let servers = fetch_servers(registry_url).await?;
    if servers.is_empty() {
        bail!("the registry does not know any alive servers");
    }

    // Route the key the same way every other client does...
    let mut ring = Ring::new(DEFAULT_REPLICAS);
    for server in &servers {
        ring.add(server);
    }
    let peer = ring
        .locate(&key)
        .ok_or_else(|| anyhow!("no peer found for key {}", key))?
        .to_owned();

    let client = Client::dial_peer(&peer, HandshakeOption::default()).await?;
    let reply: String = match operation {
        "Insert" => {
            client
                .call("Group.Insert", &[key.clone(), value])
                .await?
        }
        "Delete" => client.call("Group.Delete", &key).await?,
        "Search" => client.call("Group.Get", &key).await?,
        other => bail!("unknown operation: {}", other),
    };

    println!("{} {}", key, reply);
    client.close()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Crash the whole process instead of trying to survive with a missing tokio
    // background task. A half-dead node looks healthy from the outside but won't
    // answer anything, so we rather rely on an external watchdog for a clean restart.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a task. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    let arguments = parse_arguments();
    match arguments.mode.as_str() {
        "registry" => {
            let addr = arguments.addr.unwrap_or_else(|| "0.0.0.0:9999".to_owned());
            run_registry(&addr).await
        }
        "server" => run_server(arguments.addr, &arguments.registry).await,
        "client" => {
            run_client(
                &arguments.registry,
                &arguments.operation,
                arguments.key,
                arguments.value,
            )
            .await
        }
        _ => usage(),
    }
}
