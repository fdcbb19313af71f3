use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Idle clock driving the framing-layer heartbeat. The two direction loops
/// of a session share one clock through cheap clones; any data message on
/// either direction postpones the next heartbeat by a full idle period.
///
/// An idle time of zero disables the heartbeat: `extend` becomes a no-op
/// and `idle` never resolves.
#[derive(Clone)]
pub struct KeepAlive {
    deadline: Option<Arc<Mutex<Instant>>>,
    period: Duration,
}

impl KeepAlive {
    pub fn new(idle_secs: u64) -> Self {
        let period = Duration::from_secs(idle_secs);
        let deadline = if idle_secs == 0 {
            None
        } else {
            Some(Arc::new(Mutex::new(Instant::now() + period)))
        };
        Self { deadline, period }
    }

    /// Postpones the next heartbeat to one full idle period from now. Also
    /// used to rearm right after a heartbeat fires.
    pub fn extend(&self) {
        if let Some(ref deadline) = self.deadline {
            *deadline.lock() = Instant::now() + self.period;
        }
    }

    /// Resolves once the idle period elapses with no intervening `extend`.
    pub async fn idle(&self) {
        let Some(ref deadline) = self.deadline else {
            return std::future::pending().await;
        };
        loop {
            let at = *deadline.lock();
            tokio::time::sleep_until(at).await;
            // The deadline may have moved while we slept.
            if Instant::now() >= *deadline.lock() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_idle_period() {
        let keepalive = KeepAlive::new(5);
        timeout(Duration::from_secs(6), keepalive.idle())
            .await
            .expect("heartbeat should fire after the idle period");
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_postpones_firing() {
        let keepalive = KeepAlive::new(5);
        advance(Duration::from_secs(3)).await;
        keepalive.extend();

        // The original deadline has been pushed out past t=5.
        assert!(timeout(Duration::from_secs(3), keepalive.idle())
            .await
            .is_err());
        timeout(Duration::from_secs(10), keepalive.idle())
            .await
            .expect("heartbeat should fire once traffic stops");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_clone_extends_the_same_clock() {
        let keepalive = KeepAlive::new(5);
        let other = keepalive.clone();
        advance(Duration::from_secs(4)).await;
        other.extend();
        assert!(timeout(Duration::from_secs(4), keepalive.idle())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_fires() {
        let keepalive = KeepAlive::new(0);
        keepalive.extend();
        assert!(timeout(Duration::from_secs(3600), keepalive.idle())
            .await
            .is_err());
    }
}
