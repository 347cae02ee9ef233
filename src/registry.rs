//! Provides the TTL based membership registry.
//!
//! The registry keeps a table of peer addresses along with the timestamp of their last
//! heartbeat, mirrored into a consistent-hash [Ring](crate::ring::Ring) for routing.
//! Both structures are updated together under one lock, so the invariant "a peer is on
//! the ring if and only if it is in the table" holds at all times.
//!
//! Peers announce themselves (and stay alive) via HTTP:
//! * **GET**: lists all alive peers in the `X-Geerpc-Servers` response header
//!   (comma-joined and sorted). Expired peers are reaped as a side effect.
//! * **POST** with `X-Geerpc-Server: <addr>`: adds the peer or refreshes its
//!   last-seen timestamp. A missing header yields a 500.
//! * **DELETE** with `X-Geerpc-Server: <addr>`: removes the peer, used as shutdown
//!   notice by departing nodes. A missing header yields a 500.
//! * anything else yields a 405.
//!
//! A background reaper evicts expired peers periodically, so that even a registry
//! nobody queries converges. The client side helpers in this module implement the
//! matching heartbeat loop and the shutdown notice.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::Extension;
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::get;
use axum::Router;

use crate::fmt::format_duration;
use crate::platform::Platform;
use crate::ring::{Ring, DEFAULT_REPLICAS};
use crate::spawn;

/// The default URL path the registry is mounted at.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc_/registry";

/// The header carrying the peer list in GET responses.
pub const SERVERS_HEADER: &str = "x-geerpc-servers";

/// The header carrying the peer address in POST and DELETE requests.
pub const SERVER_HEADER: &str = "x-geerpc-server";

/// A peer whose last heartbeat is older than this is expired.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// The default interval of the background reaper.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

struct RegistryState {
    table: HashMap<String, Instant>,
    ring: Ring,
}

/// Tracks the cluster membership and routes keys to alive peers.
pub struct Registry {
    path: String,
    ttl: Duration,
    reap_interval: Duration,
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Creates a registry with the default path, TTL and reap interval.
    pub fn new() -> Arc<Registry> {
        Registry::with_settings(DEFAULT_REGISTRY_PATH, DEFAULT_TTL, DEFAULT_REAP_INTERVAL)
    }

    /// Creates a registry with custom settings.
    pub fn with_settings(path: &str, ttl: Duration, reap_interval: Duration) -> Arc<Registry> {
        Arc::new(Registry {
            path: path.to_owned(),
            ttl,
            reap_interval,
            state: Mutex::new(RegistryState {
                table: HashMap::new(),
                ring: Ring::new(DEFAULT_REPLICAS),
            }),
        })
    }

    /// Returns the URL path this registry is mounted at.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the number of peers currently registered (including expired ones which
    /// have not been reaped yet).
    pub fn peer_count(&self) -> usize {
        self.state.lock().unwrap().table.len()
    }

    /// Adds the given peer or refreshes its last-seen timestamp.
    pub fn upsert(&self, peer: &str) {
        let mut state = self.state.lock().unwrap();
        match state.table.insert(peer.to_owned(), Instant::now()) {
            Some(_) => log::debug!("Refreshed peer {}...", peer),
            None => {
                log::info!("Registered peer {}...", peer);
                state.ring.add(peer);
            }
        }
    }

    /// Removes the given peer from the table and the ring.
    pub fn remove(&self, peer: &str) {
        let mut state = self.state.lock().unwrap();
        if state.table.remove(peer).is_some() {
            log::info!("Removed peer {}...", peer);
            state.ring.remove(peer);
        }
    }

    /// Returns the sorted list of peers within their TTL, reaping expired ones as a
    /// side effect.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        Registry::reap_locked(&mut state, self.ttl);

        let mut alive: Vec<String> = state.table.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// Returns the peer responsible for the given key.
    ///
    /// A selected peer which exceeded its TTL is evicted and **None** is returned;
    /// the caller retries with a fresh pick once membership settled.
    pub fn pick(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let peer = state.ring.locate(key)?.to_owned();

        let expired = state
            .table
            .get(&peer)
            .map(|last_seen| last_seen.elapsed() > self.ttl)
            .unwrap_or(true);
        if expired {
            log::info!("Peer {} exceeded its TTL, evicting...", peer);
            let _ = state.table.remove(&peer);
            state.ring.remove(&peer);
            return None;
        }

        Some(peer)
    }

    fn reap_locked(state: &mut RegistryState, ttl: Duration) -> usize {
        let expired: Vec<String> = state
            .table
            .iter()
            .filter(|(_, last_seen)| last_seen.elapsed() > ttl)
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in &expired {
            log::info!("Removing expired peer {}...", peer);
            let _ = state.table.remove(peer);
            state.ring.remove(peer);
        }

        expired.len()
    }

    /// Starts the background reaper which periodically evicts expired peers.
    pub fn start_reaper(self: &Arc<Self>, platform: &Arc<Platform>) {
        let registry = self.clone();
        let platform = platform.clone();
        spawn!(async move {
            let mut interval = tokio::time::interval(registry.reap_interval);
            // The first tick of an interval fires immediately...
            interval.tick().await;

            while platform.is_running() {
                interval.tick().await;
                let _ = Registry::reap_locked(&mut registry.state.lock().unwrap(), registry.ttl);
            }
        });
    }

    /// Builds the HTTP surface of this registry.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                &self.path,
                get(list_servers).post(put_server).delete(remove_server),
            )
            .layer(Extension(self.clone()))
    }

    /// Binds the given address and serves the HTTP surface until the socket fails.
    pub async fn serve(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!(
            "Serving the peer registry on {}{} (ttl: {})...",
            listener.local_addr()?,
            self.path,
            format_duration(self.ttl)
        );

        let router = self.router();
        axum::serve(listener, router).await?;
        Ok(())
    }
}

fn peer_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

async fn list_servers(
    Extension(registry): Extension<Arc<Registry>>,
) -> (HeaderMap, &'static str) {
    let alive = registry.alive_servers().join(",");

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&alive) {
        let _ = headers.insert(HeaderName::from_static(SERVERS_HEADER), value);
    }

    (headers, "")
}

async fn put_server(
    Extension(registry): Extension<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    match peer_header(&headers) {
        Some(peer) => {
            registry.upsert(&peer);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn remove_server(
    Extension(registry): Extension<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    match peer_header(&headers) {
        Some(peer) => {
            registry.remove(&peer);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Computes the default heartbeat period for the given TTL.
///
/// Heartbeats are sent one minute before the TTL elapses; for short TTLs (as used in
/// tests) half the TTL is used, so the period always stays strictly below the TTL.
pub fn default_heartbeat_period(ttl: Duration) -> Duration {
    let period = ttl.saturating_sub(Duration::from_secs(60));
    if period.is_zero() {
        ttl / 2
    } else {
        period
    }
}

/// Sends a single heartbeat for the given peer to the registry.
pub async fn send_heartbeat(registry_url: &str, peer: &str) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .post(registry_url)
        .header(SERVER_HEADER, peer)
        .send()
        .await?;
    let _ = response.error_for_status()?;
    Ok(())
}

/// Starts the heartbeat loop for the given peer.
///
/// A heartbeat is sent immediately and then once per period. The loop stops on the
/// first send error: a registry which went away will re-learn the peer from scratch
/// once both sides are back.
pub fn start_heartbeat(
    platform: &Arc<Platform>,
    registry_url: String,
    peer: String,
    period: Duration,
) {
    let platform = platform.clone();
    spawn!(async move {
        log::info!(
            "Sending heartbeats for {} to {} every {}...",
            peer,
            registry_url,
            format_duration(period)
        );

        while platform.is_running() {
            if let Err(error) = send_heartbeat(&registry_url, &peer).await {
                log::warn!("Stopping heartbeats for {}: {}", peer, error);
                return;
            }
            tokio::time::sleep(period).await;
        }
    });
}

/// Notifies the registry that the given peer is shutting down.
pub async fn notify_shutdown(registry_url: &str, peer: &str) -> anyhow::Result<()> {
    log::info!("Deregistering {} from {}...", peer, registry_url);
    let response = reqwest::Client::new()
        .delete(registry_url)
        .header(SERVER_HEADER, peer)
        .send()
        .await?;
    let _ = response.error_for_status()?;
    Ok(())
}

/// Fetches the list of alive peers from the registry.
pub async fn fetch_servers(registry_url: &str) -> anyhow::Result<Vec<String>> {
    let response = reqwest::get(registry_url).await?.error_for_status()?;
    let list = response
        .headers()
        .get(SERVERS_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    Ok(list
        .split(',')
        .filter(|peer| !peer.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{
        default_heartbeat_period, fetch_servers, notify_shutdown, send_heartbeat,
        start_heartbeat, Registry, DEFAULT_REGISTRY_PATH, SERVER_HEADER,
    };
    use crate::platform::Platform;
    use crate::spawn;
    use std::sync::Arc;
    use std::time::Duration;

    /// Serves the given registry on an ephemeral port and returns its full URL.
    async fn serve_registry(registry: &Arc<Registry>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = registry.router();
        spawn!(async move {
            let _ = axum::serve(listener, router).await;
        });

        format!("http://{}{}", addr, registry.path())
    }

    #[tokio::test]
    async fn the_http_surface_supports_post_get_and_delete() {
        let registry = Registry::new();
        let url = serve_registry(&registry).await;

        send_heartbeat(&url, "tcp@127.0.0.1:9011").await.unwrap();
        send_heartbeat(&url, "tcp@127.0.0.1:9010").await.unwrap();

        // GET lists both peers, sorted...
        let servers = fetch_servers(&url).await.unwrap();
        assert_eq!(servers, ["tcp@127.0.0.1:9010", "tcp@127.0.0.1:9011"]);

        // ...until one of them says goodbye:
        notify_shutdown(&url, "tcp@127.0.0.1:9010").await.unwrap();
        let servers = fetch_servers(&url).await.unwrap();
        assert_eq!(servers, ["tcp@127.0.0.1:9011"]);
    }

    #[tokio::test]
    async fn missing_peer_headers_yield_a_500_and_other_methods_a_405() {
        let registry = Registry::new();
        let url = serve_registry(&registry).await;
        let client = reqwest::Client::new();

        let response = client.post(&url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 500);

        let response = client
            .post(&url)
            .header(SERVER_HEADER, "")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);

        let response = client.delete(&url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 500);

        let response = client.put(&url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 405);
    }

    #[tokio::test]
    async fn expired_peers_vanish_from_the_listing() {
        let registry =
            Registry::with_settings(DEFAULT_REGISTRY_PATH, Duration::from_millis(80), Duration::from_secs(60));

        registry.upsert("tcp@a:1");
        assert_eq!(registry.alive_servers(), ["tcp@a:1"]);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.alive_servers().is_empty(), true);
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn pick_routes_to_alive_peers_and_evicts_expired_ones() {
        let registry =
            Registry::with_settings(DEFAULT_REGISTRY_PATH, Duration::from_millis(80), Duration::from_secs(60));

        assert_eq!(registry.pick("Tom"), None);

        registry.upsert("tcp@a:1");
        registry.upsert("tcp@b:1");
        let peer = registry.pick("Tom").unwrap();
        assert_eq!(peer == "tcp@a:1" || peer == "tcp@b:1", true);

        // Once expired, each pick evicts the peer it selected and yields nothing,
        // so the caller has to retry after membership settled...
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.pick("Tom"), None);
        assert_eq!(registry.pick("Tom"), None);
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn the_reaper_evicts_expired_peers_in_the_background() {
        let platform = Platform::new();
        let registry = Registry::with_settings(
            DEFAULT_REGISTRY_PATH,
            Duration::from_millis(60),
            Duration::from_millis(30),
        );
        registry.start_reaper(&platform);

        registry.upsert("tcp@a:1");
        assert_eq!(registry.peer_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.peer_count(), 0);

        platform.terminate();
    }

    #[tokio::test]
    async fn heartbeats_keep_a_peer_alive() {
        let platform = Platform::new();
        let registry = Registry::with_settings(
            DEFAULT_REGISTRY_PATH,
            Duration::from_millis(250),
            Duration::from_millis(50),
        );
        registry.start_reaper(&platform);
        let url = serve_registry(&registry).await;

        start_heartbeat(
            &platform,
            url.clone(),
            "tcp@127.0.0.1:9010".to_owned(),
            Duration::from_millis(50),
        );

        // Well beyond the TTL the peer is still listed, as it keeps refreshing...
        tokio::time::sleep(Duration::from_millis(600)).await;
        let servers = fetch_servers(&url).await.unwrap();
        assert_eq!(servers, ["tcp@127.0.0.1:9010"]);

        platform.terminate();
    }

    #[test]
    fn the_heartbeat_period_stays_below_the_ttl() {
        assert_eq!(
            default_heartbeat_period(Duration::from_secs(5 * 60)),
            Duration::from_secs(4 * 60)
        );
        assert_eq!(
            default_heartbeat_period(Duration::from_secs(2)),
            Duration::from_secs(1)
        );
    }
}
