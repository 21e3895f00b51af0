//! RDS connection health monitoring and reconnection.
//!
//! A background task probes the transport on a fixed tick. When the link
//! drops it reconnects with jittered exponential backoff and, once the
//! session is back, fires the registered callback so the controller can
//! reconcile attachment state that may have moved while the RDS was away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::transport::SshTransport;

/// Callback invoked after a successful reconnection.
pub type OnReconnect = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub probe_interval: Duration,
    pub initial_backoff: Duration,
    pub backoff_multiplier: u32,
    pub max_backoff: Duration,
    /// Fractional randomization applied to each backoff (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2,
            max_backoff: Duration::from_secs(16),
            jitter: 0.1,
        }
    }
}

pub struct ConnectionManager {
    transport: Arc<Mutex<SshTransport>>,
    config: ConnectionManagerConfig,
    connected: Arc<AtomicBool>,
    on_reconnect: Option<OnReconnect>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<Mutex<SshTransport>>, config: ConnectionManagerConfig) -> Self {
        Self {
            transport,
            config,
            connected: Arc::new(AtomicBool::new(false)),
            on_reconnect: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Register the reconnect hook. Must be called before [`start`].
    pub fn set_on_reconnect(&mut self, callback: OnReconnect) {
        self.on_reconnect = Some(callback);
    }

    /// Last observed link state. Cheap; does not probe.
    pub fn is_up(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Spawn the monitor task.
    pub fn start(&mut self) {
        let (tx, mut rx) = watch::channel(false);
        self.shutdown_tx = Some(tx);

        let transport = self.transport.clone();
        let connected = self.connected.clone();
        let config = self.config.clone();
        let on_reconnect = self.on_reconnect.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.probe_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            return;
                        }
                    }
                }

                let up = {
                    let mut t = transport.lock().await;
                    t.is_connected()
                };
                let was_up = connected.swap(up, Ordering::SeqCst);

                if was_up && !up {
                    warn!("RDS connection lost; entering reconnect loop");
                    metrics::gauge!("rds_connected").set(0.0);
                    metrics::counter!("rds_connection_lost_total").increment(1);

                    if reconnect_loop(&transport, &config, &mut rx).await {
                        connected.store(true, Ordering::SeqCst);
                        metrics::gauge!("rds_connected").set(1.0);
                        if let Some(cb) = &on_reconnect {
                            cb();
                        }
                    } else {
                        return; // shut down mid-reconnect
                    }
                } else if !was_up && up {
                    metrics::gauge!("rds_connected").set(1.0);
                }
            }
        });
        self.handle = Some(handle);
    }

    /// Cooperative stop; blocks until the monitor task exits.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Reconnect until success or shutdown. Returns false when shut down.
async fn reconnect_loop(
    transport: &Arc<Mutex<SshTransport>>,
    config: &ConnectionManagerConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let started = Instant::now();
    let mut backoff = config.initial_backoff;
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        metrics::counter!("rds_reconnect_attempts_total").increment(1);

        let result = {
            let mut t = transport.lock().await;
            t.close();
            t.connect()
        };

        match result {
            Ok(()) => {
                info!(
                    attempts = attempts,
                    elapsed_secs = started.elapsed().as_secs(),
                    "RDS connection restored"
                );
                return true;
            }
            Err(e) => {
                let delay = with_jitter(backoff, config.jitter);
                warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "RDS reconnect failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return false;
                        }
                    }
                }
                backoff = next_backoff(backoff, config.backoff_multiplier, config.max_backoff);
            }
        }
    }
}

fn next_backoff(current: Duration, multiplier: u32, cap: Duration) -> Duration {
    (current * multiplier).min(cap)
}

fn with_jitter(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
    base.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let cap = Duration::from_secs(16);
        let mut backoff = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff, 2, cap);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 16]);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(base, 0.1);
            assert!(jittered >= Duration::from_secs(9));
            assert!(jittered <= Duration::from_secs(11));
        }
        assert_eq!(with_jitter(base, 0.0), base);
    }
}
