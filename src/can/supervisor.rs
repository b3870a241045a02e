// src/can/supervisor.rs
//
// Polls the CAN driver's reported bus state every 5 seconds and drives
// recovery: a timeout-bounded wait against the shutdown watch on each tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{BusState, CanDriver};
use crate::tlog;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runs until `shutdown` fires. On each tick: `BusOff` triggers `recover()`,
/// `Stopped` triggers `start()`; `Active` is a no-op.
pub async fn run_supervisor(driver: Arc<dyn CanDriver>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        match driver.state() {
            BusState::BusOff => {
                tlog!("[supervisor] bus-off detected, attempting recovery");
                if let Err(e) = driver.recover().await {
                    tlog!("[supervisor] recovery failed: {e}");
                }
            }
            BusState::Stopped => {
                tlog!("[supervisor] controller stopped, restarting");
                if let Err(e) = driver.start().await {
                    tlog!("[supervisor] start failed: {e}");
                }
            }
            BusState::Active => {}
        }
    }
}
