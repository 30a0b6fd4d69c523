//! Background lease renewal for an in-flight chunk.
//!
//! The renewer is a cooperating task cancelled through a oneshot before the
//! lock is released, so a released lease is never re-extended.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::coordination::scheduler::ChunkScheduler;

/// Fraction of the lock TTL between renewals.
const RENEW_FRACTION: f64 = 0.4;

pub struct LeaseRenewer {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl LeaseRenewer {
    /// Renewal period for a given TTL: 40% of the TTL, at least one second.
    pub fn renew_interval(lock_ttl_secs: u64) -> Duration {
        let millis = ((lock_ttl_secs as f64) * RENEW_FRACTION * 1000.0) as u64;
        Duration::from_millis(millis.max(1000))
    }

    pub fn spawn(scheduler: ChunkScheduler, chunk_id: u64) -> Self {
        let period = Self::renew_interval(scheduler.lock_ttl_secs());
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the initial EX stands.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match scheduler.renew_lock(chunk_id).await {
                            Ok(true) => {}
                            Ok(false) => {
                                // Lock key vanished; the chunk is stealable and
                                // renewing again would resurrect a dead lease.
                                break;
                            }
                            Err(e) => {
                                warn!(chunk_id, error = %e, "lease renewal failed");
                            }
                        }
                    }
                    _ = &mut cancelled => break,
                }
            }
        });
        Self { cancel, handle }
    }

    /// Cancel the renewal task and wait for it to drain. Call before
    /// releasing the lock.
    pub async fn stop(self) {
        let _ = self.cancel.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_interval_is_forty_percent_of_ttl() {
        assert_eq!(
            LeaseRenewer::renew_interval(120),
            Duration::from_millis(48_000)
        );
        assert_eq!(
            LeaseRenewer::renew_interval(10),
            Duration::from_millis(4_000)
        );
    }

    #[test]
    fn renew_interval_has_a_floor() {
        assert_eq!(LeaseRenewer::renew_interval(1), Duration::from_millis(1000));
        assert_eq!(LeaseRenewer::renew_interval(0), Duration::from_millis(1000));
    }
}
