use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use metrics::gauge;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::interface::LeaseStorage;

pub const SCHEDULER_LEASE_NAME: &str = "scheduler";
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Maintains the scheduler lease and publishes leadership over a watch
/// channel. The lease is renewed every TTL/3; a lost or persistently
/// failing renewal steps down within one TTL, so at most one scheduler is
/// active (given bounded clock skew).
pub struct LeaseMonitor {
    storage: Arc<dyn LeaseStorage>,
    name: String,
    owner: Uuid,
    ttl: Duration,
    signal: watch::Sender<bool>,
    // Keeps the channel open so send() keeps updating the value.
    _keep_alive: watch::Receiver<bool>,
}

impl LeaseMonitor {
    pub fn new(
        storage: Arc<dyn LeaseStorage>,
        name: impl Into<String>,
        ttl: Duration,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let monitor = Arc::new(LeaseMonitor {
            storage,
            name: name.into(),
            owner: Uuid::now_v7(),
            ttl,
            signal: tx,
            _keep_alive: rx.clone(),
        });
        (monitor, rx)
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn is_leader(&self) -> bool {
        *self.signal.borrow()
    }

    fn set_leader(&self, leader: bool) {
        if *self.signal.borrow() != leader {
            if leader {
                info!("lease monitor[{}]: became active for '{}'", self.owner, self.name);
            } else {
                info!("lease monitor[{}]: standing by for '{}'", self.owner, self.name);
            }
            let _ = self.signal.send(leader);
        }
        gauge!("scheduler_lease_owned").set(if leader { 1.0 } else { 0.0 });
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let renew_interval = self.ttl / 3;
        let mut failures = 0u32;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self
                .storage
                .maybe_acquire(&self.name, self.owner, self.ttl)
                .await
            {
                Ok(Some(lease)) => {
                    failures = 0;
                    debug!(
                        "lease monitor[{}]: holding '{}' until {}",
                        self.owner, self.name, lease.acquired_until
                    );
                    self.set_leader(true);
                }
                Ok(None) => {
                    failures = 0;
                    self.set_leader(false);
                }
                Err(e) => {
                    warn!("lease monitor[{}]: renewal failed: {e}", self.owner);
                    failures += 1;
                    // Renewals run 3x per TTL; failing that many in a row
                    // means the lease may have expired under us.
                    if failures >= 3 {
                        self.set_leader(false);
                    }
                }
            }

            let delay = renew_interval + Duration::from_millis(jitter_ms(250));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        if self.is_leader() {
            if let Err(e) = self.storage.release(&self.name, self.owner).await {
                warn!("lease monitor[{}]: release failed: {e}", self.owner);
            }
            self.set_leader(false);
        }
    }
}

fn jitter_ms(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    nanos % max
}
