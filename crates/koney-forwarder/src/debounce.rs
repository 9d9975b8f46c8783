//! Scan debouncing.
//!
//! HTTP triggers only schedule work. Each arriving trigger resets a
//! fixed timer; when it expires, one scan runs over the trailing log
//! window. The trigger channel has capacity one, so triggers arriving
//! while a signal is already pending are dropped on the floor - the
//! pending scan covers them.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Delay between the last trigger and the scan.
pub const DEBOUNCE_DELAY: Duration = Duration::from_secs(5);

/// Log window one scan covers.
pub const SCAN_WINDOW: Duration = Duration::from_secs(60);

/// The sending half of the trigger channel.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    /// Signal the debouncer. Returns false when a signal was already
    /// pending (the trigger is dropped, which is fine).
    pub fn fire(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(_) => {
                debug!("trigger dropped; a signal is already pending");
                false
            }
        }
    }
}

/// Create the capacity-one trigger channel.
#[must_use]
pub fn channel() -> (Trigger, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger { tx }, rx)
}

/// Run the debouncer until every [`Trigger`] is dropped. Each signal
/// (re)arms a `delay` timer; on expiry `on_fire` runs once.
pub async fn run<F, Fut>(mut triggers: mpsc::Receiver<()>, delay: Duration, mut on_fire: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    while triggers.recv().await.is_some() {
        debug!("trigger received; arming debounce timer");
        loop {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    debug!("debounce period ended; scanning");
                    on_fire().await;
                    break;
                }
                more = triggers.recv() => {
                    if more.is_none() {
                        return;
                    }
                    debug!("trigger received; resetting debounce timer");
                }
            }
        }
    }
}
