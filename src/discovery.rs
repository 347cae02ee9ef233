//! Bridges an external coordinator into the routing ring.
//!
//! Instead of the heartbeat driven [Registry](crate::registry::Registry), a cluster
//! can delegate membership to an external key-value coordinator (etcd and friends).
//! The transport specifics of such a coordinator stay outside of this crate; the
//! adapter only relies on two narrow seams:
//!
//! * a stream of [PeerEvents](PeerEvent) describing peers joining and leaving, which
//!   [start_mirror](start_mirror) applies to a shared [Ring](crate::ring::Ring), and
//! * a [Lease](Lease) under which a node publishes its own address. The adapter
//!   consumes the lease's keep-alive acknowledgements and re-registers from scratch
//!   once they stop arriving for longer than the TTL.
//!
//! Exactly one membership source (registry or coordinator) owns a given ring at a
//! time; mixing both would make the ring contents unpredictable.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::platform::Platform;
use crate::ring::Ring;
use crate::spawn;

/// A membership change observed on the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer with the given address appeared.
    Joined(String),
    /// The peer with the given address went away.
    Left(String),
}

/// A TTL lease under which this node publishes its address.
///
/// [establish](Lease::establish) performs the full registration (grant the lease,
/// write the address, start the keep-alive) and hands back the stream of keep-alive
/// acknowledgements. When that stream dries up, the lease must be considered lost and
/// a fresh registration is required.
pub trait Lease: Send + Sync + 'static {
    /// Registers this node and returns the keep-alive acknowledgement stream.
    fn establish(&self) -> BoxFuture<'static, anyhow::Result<mpsc::Receiver<()>>>;
}

/// Mirrors coordinator events into the given ring until the stream ends.
///
/// The ring is the one consulted by the routing layer, therefore changes become
/// effective for the next lookup immediately.
pub fn start_mirror(
    platform: &Arc<Platform>,
    ring: Arc<Mutex<Ring>>,
    mut events: mpsc::Receiver<PeerEvent>,
) {
    let platform = platform.clone();
    spawn!(async move {
        while platform.is_running() {
            match events.recv().await {
                Some(PeerEvent::Joined(peer)) => {
                    log::info!("Peer {} joined the cluster...", peer);
                    ring.lock().unwrap().add(&peer);
                }
                Some(PeerEvent::Left(peer)) => {
                    log::info!("Peer {} left the cluster...", peer);
                    ring.lock().unwrap().remove(&peer);
                }
                None => {
                    log::info!("The coordinator event stream ended.");
                    return;
                }
            }
        }
    });
}

/// Keeps this node registered under the given lease.
///
/// Waits for keep-alive acknowledgements; if none arrives within the TTL (or the
/// stream ends), the lease is considered lost and the registration is re-established.
/// Errors during registration are retried after a short pause, so a temporarily
/// unreachable coordinator does not take the node down.
pub fn start_registration(platform: &Arc<Platform>, lease: Arc<dyn Lease>, ttl: Duration) {
    let platform = platform.clone();
    spawn!(async move {
        while platform.is_running() {
            let mut acknowledgements = match lease.establish().await {
                Ok(acknowledgements) => {
                    log::info!("Registered with the coordinator...");
                    acknowledgements
                }
                Err(error) => {
                    log::error!("Failed to register with the coordinator: {}", error);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            while platform.is_running() {
                match tokio::time::timeout(ttl, acknowledgements.recv()).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => {
                        log::warn!("Lease renewal failed, attempting to re-register...");
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::{start_mirror, start_registration, Lease, PeerEvent};
    use crate::platform::Platform;
    use crate::ring::Ring;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn events_are_mirrored_into_the_ring() {
        let platform = Platform::new();
        let ring = Arc::new(Mutex::new(Ring::new(10)));
        let (events, receiver) = mpsc::channel(16);

        start_mirror(&platform, ring.clone(), receiver);

        events
            .send(PeerEvent::Joined("tcp@a:1".to_owned()))
            .await
            .unwrap();
        events
            .send(PeerEvent::Joined("tcp@b:1".to_owned()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ring.lock().unwrap().virtual_len(), 20);
        assert_eq!(ring.lock().unwrap().locate("Tom").is_some(), true);

        events
            .send(PeerEvent::Left("tcp@a:1".to_owned()))
            .await
            .unwrap();
        events
            .send(PeerEvent::Left("tcp@b:1".to_owned()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ring.lock().unwrap().locate("Tom"), None);

        platform.terminate();
    }

    /// A lease whose keep-alive stream dries up after a single acknowledgement,
    /// counting how often it was established.
    struct FlakyLease {
        registrations: Arc<AtomicUsize>,
    }

    impl Lease for FlakyLease {
        fn establish(&self) -> BoxFuture<'static, anyhow::Result<mpsc::Receiver<()>>> {
            let registrations = self.registrations.clone();
            Box::pin(async move {
                let _ = registrations.fetch_add(1, Ordering::SeqCst);
                let (acknowledgements, receiver) = mpsc::channel(1);
                tokio::spawn(async move {
                    let _ = acknowledgements.send(()).await;
                    // ...and then silence: the sender is dropped, the lease is lost.
                });
                Ok(receiver)
            })
        }
    }

    #[tokio::test]
    async fn a_lost_lease_triggers_re_registration() {
        let platform = Platform::new();
        let registrations = Arc::new(AtomicUsize::new(0));
        let lease = Arc::new(FlakyLease {
            registrations: registrations.clone(),
        });

        start_registration(&platform, lease, Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(registrations.load(Ordering::SeqCst) >= 2, true);

        platform.terminate();
    }
}
