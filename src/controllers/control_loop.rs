use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, info, warn};

use crate::status::StatusSink;

use super::{sync_once, Controller, SyncOutcome};

const BASE_RETRY_DELAY_SECS: u64 = 1;
const MAX_RETRY_DELAY_SECS: u64 = 60;
const RETRY_FACTOR: f64 = 2.0;

pub(crate) fn calculate_backoff_delay(failures: u32) -> Duration {
    let delay = BASE_RETRY_DELAY_SECS as f64 * RETRY_FACTOR.powi(failures.saturating_sub(1) as i32);
    Duration::from_secs((delay as u64).min(MAX_RETRY_DELAY_SECS))
}

/// key: encryption-control-loop
/// Drives one [`Controller`]: syncs on start, on every wake-up, on each resync
/// tick and when a requeue falls due. Wake-ups coalesce in a single-slot queue
/// so at most one sync is pending while another runs.
pub struct ControlLoop {
    controller: Arc<dyn Controller>,
    status: Arc<dyn StatusSink>,
    resync: Duration,
    wake_tx: mpsc::Sender<()>,
    wake_rx: mpsc::Receiver<()>,
}

impl ControlLoop {
    pub fn new(controller: Arc<dyn Controller>, status: Arc<dyn StatusSink>, resync: Duration) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            controller,
            status,
            resync,
            wake_tx,
            wake_rx,
        }
    }

    /// Handle that schedules a sync.
    pub fn waker(&self) -> mpsc::Sender<()> {
        self.wake_tx.clone()
    }

    /// Wakes the loop on every message, lagged receivers included.
    pub fn watch_broadcast<T: Clone + Send + 'static>(self, receiver: broadcast::Receiver<T>) -> Self {
        let wake = self.wake_tx.clone();
        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(receiver);
            while stream.next().await.is_some() {
                if wake.is_closed() {
                    break;
                }
                let _ = wake.try_send(());
            }
        });
        self
    }

    /// Wakes the loop whenever the watched value changes.
    pub fn watch_value<T: Clone + Send + Sync + 'static>(self, receiver: watch::Receiver<T>) -> Self {
        let wake = self.wake_tx.clone();
        tokio::spawn(async move {
            let mut stream = WatchStream::from_changes(receiver);
            while stream.next().await.is_some() {
                if wake.is_closed() {
                    break;
                }
                let _ = wake.try_send(());
            }
        });
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let name = self.controller.name();
        info!(controller = name, resync_secs = self.resync.as_secs(), "control loop started");

        let mut resync = time::interval(self.resync);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let requeue = time::sleep(Duration::ZERO);
        tokio::pin!(requeue);
        let mut requeue_armed = false;
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = resync.tick() => {}
                Some(()) = self.wake_rx.recv() => {}
                _ = &mut requeue, if requeue_armed => {}
            }

            let next = match sync_once(self.controller.as_ref(), self.status.as_ref()).await {
                Ok(SyncOutcome::Done) => {
                    failures = 0;
                    None
                }
                Ok(SyncOutcome::Requeue(delay)) => {
                    failures = 0;
                    debug!(controller = name, delay_secs = delay.as_secs(), "sync requeued");
                    Some(delay)
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = calculate_backoff_delay(failures);
                    warn!(controller = name, %err, failures, retry_in_secs = delay.as_secs(), "sync failed");
                    Some(delay)
                }
            };

            match next {
                Some(delay) => {
                    requeue.as_mut().reset(Instant::now() + delay);
                    requeue_armed = true;
                }
                None => requeue_armed = false,
            }
        }

        info!(controller = name, "control loop stopped");
    }
}
