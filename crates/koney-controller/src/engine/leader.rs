//! Lease-based leader election.
//!
//! At most one controller instance mutates the cluster at a time.
//! Every instance runs the elector; the one holding the lease flips the
//! shared `is_leader` flag, renews at a third of the TTL, and loses
//! leadership when a renewal fails or the API becomes unreachable.
//! Non-leaders keep watching and retry acquisition at the same cadence.

use std::sync::Arc;
use std::time::Duration;

use koney_core::cluster::ClusterClient;
use tokio::sync::watch;
use tracing::{info, warn};

/// Name of the controller lease object.
pub const LEASE_NAME: &str = "koney-controller-leader";

/// Default lease duration.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// The leader election loop.
pub struct LeaderElector {
    client: Arc<dyn ClusterClient>,
    holder: String,
    ttl: Duration,
}

impl LeaderElector {
    /// Create an elector with a unique holder identity.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, ttl: Duration) -> Self {
        let holder = format!("koney-controller-{}", uuid::Uuid::new_v4());
        Self {
            client,
            holder,
            ttl,
        }
    }

    /// Run the election loop until shutdown, publishing leadership on
    /// `leadership`.
    pub async fn run(
        self,
        leadership: watch::Sender<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let renew_every = self.ttl / 3;
        loop {
            let held = match self
                .client
                .try_acquire_lease(LEASE_NAME, &self.holder, self.ttl)
                .await
            {
                Ok(held) => held,
                Err(err) => {
                    warn!(error = %err, "lease acquisition failed");
                    false
                }
            };

            leadership.send_if_modified(|current| {
                if *current != held {
                    if held {
                        info!(holder = %self.holder, "acquired leadership");
                    } else {
                        info!(holder = %self.holder, "lost leadership");
                    }
                    *current = held;
                    true
                } else {
                    false
                }
            });

            tokio::select! {
                _ = tokio::time::sleep(renew_every) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use koney_core::cluster::InMemoryCluster;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_single_instance_becomes_leader() {
        let client: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
        let elector = LeaderElector::new(Arc::clone(&client), DEFAULT_LEASE_TTL);
        let (leader_tx, mut leader_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(elector.run(leader_tx, shutdown_rx));
        leader_rx.changed().await.unwrap();
        assert!(*leader_rx.borrow());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_instance_stays_follower_while_lease_held() {
        let client: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new());
        // First instance takes the lease directly.
        assert!(client
            .try_acquire_lease(LEASE_NAME, "other-holder", DEFAULT_LEASE_TTL)
            .await
            .unwrap());

        let elector = LeaderElector::new(Arc::clone(&client), DEFAULT_LEASE_TTL);
        let (leader_tx, leader_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(elector.run(leader_tx, shutdown_rx));

        // Give the elector a few renewal rounds.
        tokio::time::sleep(DEFAULT_LEASE_TTL / 2).await;
        assert!(!*leader_rx.borrow());

        // Once the foreign lease expires, the elector takes over.
        tokio::time::sleep(DEFAULT_LEASE_TTL * 2).await;
        assert!(*leader_rx.borrow());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
